//! Terminal feedback for the long-running steps of a command.

use std::io::Write;

use indicatif::{ProgressBar, ProgressStyle};

use crate::driver::DownloadProgress;
use crate::util::megabytes;

fn bar_style() -> ProgressStyle {
    ProgressStyle::default_bar()
        .template("{spinner:.green} [{bar:40.cyan/blue}] {msg} ({eta})")
        .map(|s| s.progress_chars("#>-"))
        .unwrap_or_else(|_| ProgressStyle::default_bar())
}

fn spinner_style() -> ProgressStyle {
    ProgressStyle::default_spinner()
        .template("{spinner:.green} {msg}")
        .unwrap_or_else(|_| ProgressStyle::default_spinner())
}

/// Progress bar fed by the driver's download callback.
///
/// Starts as a spinner and turns into a bar once the total size is known.
/// Drawn on stderr and hidden automatically when that is not a terminal.
pub struct DownloadBar {
    bar: ProgressBar,
}

impl DownloadBar {
    pub fn new() -> Self {
        let bar = ProgressBar::new_spinner();
        bar.set_style(spinner_style());
        Self { bar }
    }

    pub fn update(&self, progress: DownloadProgress) {
        if let Some(total) = progress.total {
            if self.bar.length() != Some(total) {
                self.bar.set_length(total);
                self.bar.set_style(bar_style());
            }
        }
        self.bar.set_position(progress.downloaded);
        self.bar.set_message(progress.message());
    }

    pub fn finish(&self) {
        self.bar.finish_and_clear();
    }
}

impl Default for DownloadBar {
    fn default() -> Self {
        Self::new()
    }
}

impl DownloadProgress {
    /// `Downloaded 12 MB of 530`, or without the total when the server did
    /// not send one.
    pub fn message(&self) -> String {
        match self.total {
            Some(total) => format!(
                "Downloaded {} MB of {}",
                megabytes(self.downloaded),
                megabytes(total)
            ),
            None => format!("Downloaded {} MB", megabytes(self.downloaded)),
        }
    }
}

/// "Waiting for VM to boot ..." with one dot per polling period.
pub struct BootWait<W: Write> {
    out: W,
    started: bool,
}

impl BootWait<std::io::Stdout> {
    pub fn stdout() -> Self {
        Self::new(std::io::stdout())
    }
}

impl<W: Write> BootWait<W> {
    pub fn new(out: W) -> Self {
        Self {
            out,
            started: false,
        }
    }

    pub fn tick(&mut self) {
        if !self.started {
            self.started = true;
            let _ = write!(self.out, "Waiting for VM to boot ");
        }
        let _ = write!(self.out, ".");
        let _ = self.out.flush();
    }

    /// Terminate the dot line, if one was started.
    pub fn finish(&mut self) {
        if self.started {
            let _ = writeln!(self.out);
            let _ = self.out.flush();
        }
    }

    #[cfg(test)]
    fn into_inner(self) -> W {
        self.out
    }
}
