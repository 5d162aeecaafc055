//! Everything that actually touches the hypervisor, the host, or the network.
//!
//! Command handlers only see the [`Driver`] trait. [`qemu::QemuDriver`] is
//! the implementation the binary uses.

pub mod cloudinit;
pub mod host;
pub mod image;
pub mod keys;
pub mod qemu;

use std::fmt;
use std::future::Future;
use std::path::{Path, PathBuf};

use crate::error::CcvmError;
use crate::merge::{self, HostDefaults};
use crate::workload::{Mount, VmSpec, Workload};
use crate::workspace::{ProxySettings, Workspace};

/// Byte counts reported while a base image downloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DownloadProgress {
    pub downloaded: u64,
    /// `None` when the server sent no content length.
    pub total: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstanceStatus {
    /// No hypervisor process.
    Down,
    /// Running, but SSH is not answering yet.
    Booting,
    Ready,
}

impl fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            InstanceStatus::Down => "down",
            InstanceStatus::Booting => "booting",
            InstanceStatus::Ready => "ready",
        })
    }
}

/// What the guest needs to know on first boot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BootConfig {
    pub hostname: String,
    /// Guest login, same as the host user.
    pub user: String,
    pub packages: Vec<String>,
    pub runcmd: Vec<String>,
    pub mounts: Vec<Mount>,
    pub package_upgrade: Option<bool>,
    /// Proxy values for the guest, `no_proxy` already including the hostname.
    pub proxy: ProxySettings,
}

impl BootConfig {
    /// Assemble from the workload once its hostname is final.
    pub fn new(workload: &Workload, ws: &Workspace) -> Self {
        let proxy = ProxySettings {
            no_proxy: merge::no_proxy(&workload.hostname, &ws.proxy),
            ..ws.proxy.clone()
        };
        Self {
            hostname: workload.hostname.clone(),
            user: ws.user.clone(),
            packages: workload.packages.clone(),
            runcmd: workload.runcmd.clone(),
            mounts: workload.vm.mounts.clone(),
            package_upgrade: workload.package_upgrade,
            proxy,
        }
    }
}

/// Hypervisor and host operations used by the command handlers.
///
/// None of these observe cancellation; handlers check for it between calls.
pub trait Driver: Send + Sync + 'static {
    /// Fail with [`CcvmError::MissingTools`] if the host lacks what booting needs.
    fn install_host_dependencies(&self) -> impl Future<Output = Result<(), CcvmError>> + Send;

    /// Fetch `url` into `cache_dir` unless already cached. Returns the local path.
    fn download_base_image(
        &self,
        url: &str,
        cache_dir: &Path,
        progress: &(dyn Fn(DownloadProgress) + Sync),
    ) -> impl Future<Output = Result<PathBuf, CcvmError>> + Send;

    fn build_boot_config_image(
        &self,
        instance_dir: &Path,
        config: &BootConfig,
        ws: &Workspace,
        debug: bool,
    ) -> impl Future<Output = Result<(), CcvmError>> + Send;

    /// Create the instance's root disk on top of `image_path`.
    fn create_disk(
        &self,
        image_path: &Path,
        instance_dir: &Path,
    ) -> impl Future<Output = Result<(), CcvmError>> + Send;

    fn boot_instance(
        &self,
        ws: &Workspace,
        vm: &VmSpec,
    ) -> impl Future<Output = Result<(), CcvmError>> + Send;

    /// Ask the guest to power down.
    fn stop_instance(&self, instance_dir: &Path)
    -> impl Future<Output = Result<(), CcvmError>> + Send;

    /// Kill the hypervisor process.
    fn force_quit_instance(
        &self,
        instance_dir: &Path,
    ) -> impl Future<Output = Result<(), CcvmError>> + Send;

    fn query_status(
        &self,
        instance_dir: &Path,
        ssh_port: u16,
    ) -> impl Future<Output = Result<InstanceStatus, CcvmError>> + Send;

    fn host_supports_nested_virtualization(&self) -> bool;

    /// Make sure the shared key pair at `ws.key_path` exists.
    fn provision_ssh_keys(&self, ws: &Workspace) -> Result<(), CcvmError>;

    fn host_memory_and_cpu_defaults(&self) -> HostDefaults;
}
