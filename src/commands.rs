//! One handler per CLI command.
//!
//! Handlers own everything they touch so they can run as a spawned task.
//! Cancellation is only observed between steps.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use console::style;
use tokio_util::sync::CancellationToken;

use crate::driver::{BootConfig, Driver, InstanceStatus};
use crate::error::CcvmError;
use crate::logging::LogFileHandle;
use crate::merge::{self, VmOverrides};
use crate::progress::{BootWait, DownloadBar};
use crate::readiness::{self, SshProbe};
use crate::session::{self, LOOPBACK};
use crate::state::{self, InstanceDir};
use crate::util;
use crate::workload::{self, VmSpec};
use crate::workspace::Workspace;

/// What every handler gets.
pub struct Context<D> {
    pub driver: Arc<D>,
    pub workspace: Workspace,
    /// Pointed at the instance log once the instance directory exists.
    pub log_file: Option<LogFileHandle>,
    /// The ssh client `connect` hands off to, looked up on `PATH`.
    pub ssh: Option<PathBuf>,
}

impl<D> Context<D> {
    pub fn new(driver: Arc<D>, workspace: Workspace) -> Self {
        Self {
            driver,
            workspace,
            log_file: None,
            ssh: util::find_in_path("ssh"),
        }
    }

    pub fn with_log_file(mut self, log_file: LogFileHandle) -> Self {
        self.log_file = Some(log_file);
        self
    }

    pub fn with_ssh(mut self, ssh: Option<PathBuf>) -> Self {
        self.ssh = ssh;
        self
    }

    /// Start appending to the instance log. Only call this once the
    /// instance directory is known to exist; nothing here creates it.
    fn activate_log(&self) {
        if let Some(log) = &self.log_file {
            log.activate(&self.workspace.log_path());
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct CreateOptions {
    pub workload: String,
    pub overrides: VmOverrides,
    /// Allow password login on the guest console.
    pub debug: bool,
    pub package_upgrade: Option<bool>,
}

fn checkpoint(cancel: &CancellationToken) -> Result<(), CcvmError> {
    if cancel.is_cancelled() {
        tracing::info!("cancelled between steps");
        Err(CcvmError::Cancelled)
    } else {
        Ok(())
    }
}

fn check_nested<D: Driver>(driver: &D, vm: &VmSpec) -> Result<(), CcvmError> {
    if vm.needs_nested_vm && !driver.host_supports_nested_virtualization() {
        return Err(CcvmError::NestedVirtUnavailable);
    }
    Ok(())
}

fn booting_line(vm: &VmSpec) {
    println!("Booting VM with {} GB RAM and {} cpus", vm.mem_gib, vm.cpus);
}

pub async fn create<D: Driver>(
    ctx: Context<D>,
    opts: CreateOptions,
    cancel: CancellationToken,
) -> Result<(), CcvmError> {
    let ws = &ctx.workspace;
    let driver = &*ctx.driver;

    opts.overrides.check_mounts()?;
    if ws.instance_dir.exists() {
        return Err(CcvmError::InstanceExists {
            path: ws.instance_dir.display().to_string(),
        });
    }

    let mut workload = workload::load(&opts.workload, &ws.workloads_dir)?;
    if opts.package_upgrade.is_some() {
        workload.package_upgrade = opts.package_upgrade;
    }
    workload.vm = merge::resolve(
        &workload.vm,
        &opts.overrides,
        driver.host_memory_and_cpu_defaults(),
    );
    check_nested(driver, &workload.vm)?;

    println!("Installing host dependencies");
    driver.install_host_dependencies().await?;
    checkpoint(&cancel)?;

    // From here on any failure removes the instance again.
    let instance = InstanceDir::acquire(ws)?;
    ctx.activate_log();
    tracing::info!(
        instance = %ws.instance,
        workload = %workload.name,
        "creating instance"
    );
    state::save(&workload, ws)?;

    driver.provision_ssh_keys(ws)?;
    checkpoint(&cancel)?;

    println!("Downloading {}", workload.vm.base_image_name);
    let bar = DownloadBar::new();
    let image = driver
        .download_base_image(&workload.vm.base_image_url, &ws.cache_dir, &|p| bar.update(p))
        .await;
    bar.finish();
    let image = image?;
    checkpoint(&cancel)?;

    let boot_config = BootConfig::new(&workload, ws);
    driver
        .build_boot_config_image(instance.path(), &boot_config, ws, opts.debug)
        .await?;
    checkpoint(&cancel)?;

    driver.create_disk(&image, instance.path()).await?;
    checkpoint(&cancel)?;

    booting_line(&workload.vm);
    driver.boot_instance(ws, &workload.vm).await?;

    instance.commit();
    println!("VM successfully created!");
    println!("Type ccvm connect to start using it.");
    Ok(())
}

pub async fn start<D: Driver>(
    ctx: Context<D>,
    overrides: VmOverrides,
    cancel: CancellationToken,
) -> Result<(), CcvmError> {
    let ws = &ctx.workspace;
    let driver = &*ctx.driver;

    overrides.check_mounts()?;
    let mut workload = state::restore(ws)?;
    ctx.activate_log();
    workload.vm = merge::resolve(
        &workload.vm,
        &overrides,
        driver.host_memory_and_cpu_defaults(),
    );
    check_nested(driver, &workload.vm)?;

    if let Err(e) = state::save(&workload, ws) {
        tracing::warn!(error = %e, "unable to update instance state");
    }
    checkpoint(&cancel)?;

    booting_line(&workload.vm);
    driver.boot_instance(ws, &workload.vm).await?;
    println!("VM Started");
    Ok(())
}

pub async fn stop<D: Driver>(ctx: Context<D>, _cancel: CancellationToken) -> Result<(), CcvmError> {
    state::restore(&ctx.workspace)?;
    ctx.activate_log();
    ctx.driver
        .stop_instance(&ctx.workspace.instance_dir)
        .await?;
    println!("VM Stopped");
    Ok(())
}

pub async fn quit<D: Driver>(ctx: Context<D>, _cancel: CancellationToken) -> Result<(), CcvmError> {
    state::restore(&ctx.workspace)?;
    ctx.activate_log();
    ctx.driver
        .force_quit_instance(&ctx.workspace.instance_dir)
        .await?;
    println!("VM Quit");
    Ok(())
}

pub async fn status<D: Driver>(
    ctx: Context<D>,
    _cancel: CancellationToken,
) -> Result<(), CcvmError> {
    let ws = &ctx.workspace;
    let workload = state::restore(ws)?;
    ctx.activate_log();
    let port = workload.vm.ssh_port().ok_or(CcvmError::NoSshPort)?;

    let status = ctx.driver.query_status(&ws.instance_dir, port).await?;
    let word = match status {
        InstanceStatus::Ready => style(status.to_string()).green(),
        InstanceStatus::Booting => style(status.to_string()).yellow(),
        InstanceStatus::Down => style(status.to_string()).red(),
    };

    println!("Status\t\t: {word}");
    println!("SSH\t\t: {}", session::ssh_command_line(&ws.key_path, port));
    if workload.vm.qemu_log_port != 0 {
        println!("QEMU Debug Port\t: {}", workload.vm.qemu_log_port);
    }
    Ok(())
}

pub async fn connect<D: Driver>(
    ctx: Context<D>,
    cancel: CancellationToken,
) -> Result<(), CcvmError> {
    let ws = &ctx.workspace;
    let workload = state::restore(ws)?;
    ctx.activate_log();
    let ssh = ctx.ssh.clone().ok_or(CcvmError::SshNotFound)?;
    let port = workload.vm.ssh_port().ok_or(CcvmError::NoSshPort)?;

    let mut wait = BootWait::stdout();
    let ready = readiness::wait_until_ready(
        &SshProbe::loopback(port),
        &cancel,
        readiness::POLL_INTERVAL,
        |_| wait.tick(),
    )
    .await;
    wait.finish();
    ready?;

    Err(session::hand_off(&ssh, &ws.key_path, port))
}

pub async fn delete<D: Driver>(
    ctx: Context<D>,
    _cancel: CancellationToken,
) -> Result<(), CcvmError> {
    let ws = &ctx.workspace;
    if !ws.instance_dir.is_dir() {
        return Err(CcvmError::InstanceNotFound {
            path: ws.instance_dir.display().to_string(),
        });
    }
    ctx.activate_log();

    let ssh_port = match state::restore(ws) {
        Ok(workload) => workload.vm.ssh_port(),
        Err(e) => {
            tracing::warn!(error = %e, "deleting instance with unreadable state");
            None
        }
    };

    if let Err(e) = ctx.driver.force_quit_instance(&ws.instance_dir).await {
        tracing::warn!(error = %e, "unable to quit VM before delete");
    }

    state::remove(ws)?;
    if let Some(port) = ssh_port {
        forget_host_key(&ws.known_hosts_path(), port).await;
    }

    println!("VM deleted");
    Ok(())
}

/// Drop the forwarded port's entry from `known_hosts`; a recreated guest
/// comes back with a new host key.
async fn forget_host_key(known_hosts: &Path, port: u16) {
    if !known_hosts.exists() {
        return;
    }

    let host = format!("[{LOOPBACK}]:{port}");
    let result = tokio::process::Command::new("ssh-keygen")
        .arg("-f")
        .arg(known_hosts)
        .args(["-R", host.as_str()])
        .output()
        .await;

    match result {
        Ok(output) if output.status.success() => {
            tracing::debug!(host = %host, "removed known_hosts entry");
        }
        Ok(output) => tracing::warn!(
            host = %host,
            stderr = %String::from_utf8_lossy(&output.stderr).trim(),
            "unable to remove known_hosts entry"
        ),
        Err(e) => tracing::warn!(host = %host, error = %e, "unable to run ssh-keygen"),
    }
}
