//! Handing the terminal over to an interactive ssh session.

use std::ffi::OsString;
use std::os::unix::process::CommandExt;
use std::path::Path;

use crate::error::CcvmError;

pub const LOOPBACK: &str = "127.0.0.1";

/// Arguments for an ssh client that ignores user config and never records
/// the guest's host key, whose identity changes with every recreate.
pub fn ssh_args(key_path: &Path, port: u16) -> Vec<OsString> {
    let mut args: Vec<OsString> = [
        "-q",
        "-F",
        "/dev/null",
        "-o",
        "UserKnownHostsFile=/dev/null",
        "-o",
        "StrictHostKeyChecking=no",
        "-o",
        "IdentitiesOnly=yes",
        "-i",
    ]
    .into_iter()
    .map(OsString::from)
    .collect();
    args.push(key_path.as_os_str().to_owned());
    args.push(LOOPBACK.into());
    args.push("-p".into());
    args.push(port.to_string().into());
    args
}

/// The command `status` tells the user to run.
pub fn ssh_command_line(key_path: &Path, port: u16) -> String {
    let args = ssh_args(key_path, port);
    let mut line = String::from("ssh");
    for arg in &args {
        line.push(' ');
        line.push_str(&arg.to_string_lossy());
    }
    line
}

/// Replace the current process with `ssh`. Only returns if exec fails.
pub fn hand_off(ssh: &Path, key_path: &Path, port: u16) -> CcvmError {
    tracing::debug!(ssh = %ssh.display(), port, "exec ssh");
    let source = std::process::Command::new(ssh)
        .args(ssh_args(key_path, port))
        .exec();
    CcvmError::Io {
        context: format!("unable to exec {}", ssh.display()),
        source,
    }
}
