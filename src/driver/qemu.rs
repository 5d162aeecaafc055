//! [`Driver`] backed by a daemonized `qemu-system-x86_64` per instance.
//!
//! The instance directory holds everything QEMU needs: the root disk, the
//! cloud-init ISO, the HMP monitor socket and the pid file. A connectable
//! monitor socket is what "running" means.

use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixStream;

use super::{BootConfig, DownloadProgress, Driver, InstanceStatus, cloudinit, host, image, keys};
use crate::error::CcvmError;
use crate::merge::HostDefaults;
use crate::readiness::{Probe, SshProbe};
use crate::session::LOOPBACK;
use crate::workload::VmSpec;
use crate::workspace::Workspace;

pub const DISK_IMAGE: &str = "image.qcow2";
pub const MONITOR_SOCKET: &str = "monitor.sock";
pub const PID_FILE: &str = "qemu.pid";

const MONITOR_TIMEOUT: Duration = Duration::from_secs(5);
const PROMPT: &str = "(qemu)";

#[derive(Debug, Default, Clone, Copy)]
pub struct QemuDriver;

impl QemuDriver {
    pub fn new() -> Self {
        Self
    }
}

fn path_arg(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

/// Full `qemu-system-x86_64` command line for an instance.
pub fn qemu_args(ws: &Workspace, vm: &VmSpec) -> Vec<String> {
    let dir = &ws.instance_dir;
    let mut args: Vec<String> = vec![
        "-name".into(),
        format!("ccvm-{}", ws.instance),
        "-enable-kvm".into(),
        "-cpu".into(),
        "host".into(),
        "-m".into(),
        format!("{}G", vm.mem_gib),
        "-smp".into(),
        format!("cpus={}", vm.cpus),
        "-drive".into(),
        format!("file={},if=virtio,format=qcow2", path_arg(&dir.join(DISK_IMAGE))),
        "-drive".into(),
        format!(
            "file={},if=virtio,media=cdrom",
            path_arg(&dir.join(cloudinit::CONFIG_ISO))
        ),
    ];

    for drive in &vm.drives {
        let mut spec = format!("file={},if=virtio,format={}", drive.path, drive.format);
        if !drive.options.is_empty() {
            spec.push(',');
            spec.push_str(&drive.options);
        }
        args.extend(["-drive".into(), spec]);
    }

    for (i, mount) in vm.mounts.iter().enumerate() {
        let id = format!("fsdev{i}");
        args.extend([
            "-fsdev".into(),
            format!(
                "local,security_model={},id={id},path={}",
                mount.security_model, mount.path
            ),
            "-device".into(),
            format!("virtio-9p-pci,fsdev={id},mount_tag={}", mount.tag),
        ]);
    }

    let mut netdev = String::from("user,id=net0");
    for port in &vm.ports {
        netdev.push_str(&format!(",hostfwd=tcp::{}-:{}", port.host, port.guest));
    }
    args.extend([
        "-netdev".into(),
        netdev,
        "-device".into(),
        "virtio-net-pci,netdev=net0".into(),
        "-monitor".into(),
        format!("unix:{},server,nowait", path_arg(&dir.join(MONITOR_SOCKET))),
    ]);

    if vm.qemu_log_port != 0 {
        args.extend([
            "-serial".into(),
            format!("tcp:{LOOPBACK}:{},server,nowait", vm.qemu_log_port),
        ]);
    }

    args.extend([
        "-display".into(),
        "none".into(),
        "-daemonize".into(),
        "-pidfile".into(),
        path_arg(&dir.join(PID_FILE)),
    ]);
    args
}

async fn is_running(instance_dir: &Path) -> bool {
    UnixStream::connect(instance_dir.join(MONITOR_SOCKET))
        .await
        .is_ok()
}

/// Send one HMP command and wait until the monitor prompts again or hangs up.
async fn monitor_command(instance_dir: &Path, command: &str) -> Result<(), CcvmError> {
    let socket = instance_dir.join(MONITOR_SOCKET);
    let mut stream = UnixStream::connect(&socket).await.map_err(|e| {
        tracing::debug!(path = %socket.display(), error = %e, "monitor not reachable");
        CcvmError::Driver {
            message: "VM is not running".into(),
        }
    })?;

    stream
        .write_all(format!("{command}\n").as_bytes())
        .await
        .map_err(|e| CcvmError::Io {
            context: format!("sending {command} to {}", socket.display()),
            source: e,
        })?;

    // The greeting carries one prompt; the second follows our command.
    let drain = async {
        let mut seen = String::new();
        let mut buf = [0u8; 1024];
        loop {
            match stream.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => seen.push_str(&String::from_utf8_lossy(&buf[..n])),
            }
            if seen.matches(PROMPT).count() >= 2 {
                break;
            }
        }
    };
    if tokio::time::timeout(MONITOR_TIMEOUT, drain).await.is_err() {
        tracing::warn!(command, "no acknowledgement from monitor");
    }

    tracing::info!(command, path = %socket.display(), "sent monitor command");
    Ok(())
}

async fn remove_stale(path: PathBuf) {
    match tokio::fs::remove_file(&path).await {
        Ok(()) => tracing::debug!(path = %path.display(), "removed stale file"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => tracing::warn!(path = %path.display(), error = %e, "cannot remove stale file"),
    }
}

impl Driver for QemuDriver {
    async fn install_host_dependencies(&self) -> Result<(), CcvmError> {
        host::check_tools()
    }

    async fn download_base_image(
        &self,
        url: &str,
        cache_dir: &Path,
        progress: &(dyn Fn(DownloadProgress) + Sync),
    ) -> Result<PathBuf, CcvmError> {
        image::ensure_base_image(url, cache_dir, progress).await
    }

    async fn build_boot_config_image(
        &self,
        instance_dir: &Path,
        config: &BootConfig,
        ws: &Workspace,
        debug: bool,
    ) -> Result<(), CcvmError> {
        cloudinit::build_config_iso(instance_dir, config, &ws.public_key_path(), debug).await
    }

    async fn create_disk(&self, image_path: &Path, instance_dir: &Path) -> Result<(), CcvmError> {
        let disk = instance_dir.join(DISK_IMAGE);
        let output = tokio::process::Command::new("qemu-img")
            .args(["create", "-f", "qcow2", "-b"])
            .arg(image_path)
            .args(["-F", "qcow2"])
            .arg(&disk)
            .output()
            .await
            .map_err(|e| CcvmError::Io {
                context: "running qemu-img".into(),
                source: e,
            })?;

        if !output.status.success() {
            return Err(CcvmError::ExternalCommand {
                command: "qemu-img".into(),
                message: String::from_utf8_lossy(&output.stderr).into_owned(),
            });
        }

        tracing::info!(path = %disk.display(), "created qcow2 overlay");
        Ok(())
    }

    async fn boot_instance(&self, ws: &Workspace, vm: &VmSpec) -> Result<(), CcvmError> {
        let dir = &ws.instance_dir;
        if is_running(dir).await {
            return Err(CcvmError::Driver {
                message: "VM is already running".into(),
            });
        }
        remove_stale(dir.join(MONITOR_SOCKET)).await;
        remove_stale(dir.join(PID_FILE)).await;

        let args = qemu_args(ws, vm);
        tracing::debug!(args = ?args, "starting qemu");
        let output = tokio::process::Command::new("qemu-system-x86_64")
            .args(&args)
            .output()
            .await
            .map_err(|e| CcvmError::Io {
                context: "running qemu-system-x86_64".into(),
                source: e,
            })?;

        if !output.status.success() {
            return Err(CcvmError::ExternalCommand {
                command: "qemu-system-x86_64".into(),
                message: String::from_utf8_lossy(&output.stderr).into_owned(),
            });
        }

        tracing::info!(instance = %ws.instance, "VM booted");
        Ok(())
    }

    async fn stop_instance(&self, instance_dir: &Path) -> Result<(), CcvmError> {
        monitor_command(instance_dir, "system_powerdown").await
    }

    async fn force_quit_instance(&self, instance_dir: &Path) -> Result<(), CcvmError> {
        monitor_command(instance_dir, "quit").await
    }

    async fn query_status(
        &self,
        instance_dir: &Path,
        ssh_port: u16,
    ) -> Result<InstanceStatus, CcvmError> {
        if !is_running(instance_dir).await {
            return Ok(InstanceStatus::Down);
        }
        if SshProbe::loopback(ssh_port).is_ready().await {
            Ok(InstanceStatus::Ready)
        } else {
            Ok(InstanceStatus::Booting)
        }
    }

    fn host_supports_nested_virtualization(&self) -> bool {
        host::nested_virtualization_enabled()
    }

    fn provision_ssh_keys(&self, ws: &Workspace) -> Result<(), CcvmError> {
        keys::ensure_key_pair(&ws.key_path, &ws.public_key_path())
    }

    fn host_memory_and_cpu_defaults(&self) -> HostDefaults {
        host::defaults()
    }
}

#[cfg(test)]
mod tests {
    use tokio::net::UnixListener;

    use super::*;
    use crate::workload::{Drive, Mount, PortMapping};

    fn ws() -> Workspace {
        Workspace::with_root(Path::new("/r"), "dev")
    }

    fn has_pair(args: &[String], flag: &str, value: &str) -> bool {
        args.windows(2).any(|w| w[0] == flag && w[1] == value)
    }

    #[test]
    fn basic_command_line() {
        let vm = VmSpec {
            mem_gib: 4,
            cpus: 2,
            ports: vec![PortMapping { host: 10022, guest: 22 }],
            ..VmSpec::default()
        };
        let args = qemu_args(&ws(), &vm);

        assert!(has_pair(&args, "-m", "4G"));
        assert!(has_pair(&args, "-smp", "cpus=2"));
        assert!(has_pair(
            &args,
            "-drive",
            "file=/r/data/instances/dev/image.qcow2,if=virtio,format=qcow2"
        ));
        assert!(has_pair(
            &args,
            "-netdev",
            "user,id=net0,hostfwd=tcp::10022-:22"
        ));
        assert!(has_pair(
            &args,
            "-monitor",
            "unix:/r/data/instances/dev/monitor.sock,server,nowait"
        ));
        assert!(has_pair(&args, "-pidfile", "/r/data/instances/dev/qemu.pid"));
        assert!(args.contains(&"-daemonize".to_string()));
        assert!(!args.contains(&"-serial".to_string()));
    }

    #[test]
    fn mounts_drives_and_log_port() {
        let vm = VmSpec {
            mem_gib: 1,
            cpus: 1,
            qemu_log_port: 4444,
            mounts: vec![Mount {
                tag: "hostgo".into(),
                security_model: "passthrough".into(),
                path: "/home/a/go".into(),
            }],
            drives: vec![
                Drive {
                    path: "/d/a.img".into(),
                    format: "raw".into(),
                    options: String::new(),
                },
                Drive {
                    path: "/d/b.qcow2".into(),
                    format: "qcow2".into(),
                    options: "aio=threads,cache=none".into(),
                },
            ],
            ..VmSpec::default()
        };
        let args = qemu_args(&ws(), &vm);

        assert!(has_pair(&args, "-drive", "file=/d/a.img,if=virtio,format=raw"));
        assert!(has_pair(
            &args,
            "-drive",
            "file=/d/b.qcow2,if=virtio,format=qcow2,aio=threads,cache=none"
        ));
        assert!(has_pair(
            &args,
            "-fsdev",
            "local,security_model=passthrough,id=fsdev0,path=/home/a/go"
        ));
        assert!(has_pair(
            &args,
            "-device",
            "virtio-9p-pci,fsdev=fsdev0,mount_tag=hostgo"
        ));
        assert!(has_pair(
            &args,
            "-serial",
            "tcp:127.0.0.1:4444,server,nowait"
        ));
    }

    #[tokio::test]
    async fn stop_without_monitor_is_not_running() {
        let dir = tempfile::tempdir().unwrap();
        let err = QemuDriver::new()
            .stop_instance(dir.path())
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "VM is not running");
    }

    #[tokio::test]
    async fn status_without_monitor_is_down() {
        let dir = tempfile::tempdir().unwrap();
        let status = QemuDriver::new()
            .query_status(dir.path(), 1)
            .await
            .unwrap();
        assert_eq!(status, InstanceStatus::Down);
    }

    #[tokio::test]
    async fn monitor_receives_command() {
        let dir = tempfile::tempdir().unwrap();
        let listener = UnixListener::bind(dir.path().join(MONITOR_SOCKET)).unwrap();

        let monitor = tokio::spawn(async move {
            let (mut conn, _) = listener.accept().await.unwrap();
            conn.write_all(b"QEMU 8.2.2 monitor - type 'help' for more information\r\n(qemu) ")
                .await
                .unwrap();
            let mut buf = [0u8; 64];
            let n = conn.read(&mut buf).await.unwrap();
            conn.write_all(b"system_powerdown\r\n(qemu) ").await.unwrap();
            String::from_utf8_lossy(&buf[..n]).into_owned()
        });

        QemuDriver::new().stop_instance(dir.path()).await.unwrap();
        assert_eq!(monitor.await.unwrap(), "system_powerdown\n");
    }

    #[tokio::test]
    async fn boot_refuses_running_instance() {
        let root = tempfile::tempdir().unwrap();
        let ws = Workspace::with_root(root.path(), "dev");
        std::fs::create_dir_all(&ws.instance_dir).unwrap();
        let _listener = UnixListener::bind(ws.instance_dir.join(MONITOR_SOCKET)).unwrap();

        let err = QemuDriver::new()
            .boot_instance(&ws, &VmSpec::default())
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "VM is already running");
    }
}
