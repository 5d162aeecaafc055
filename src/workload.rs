//! Workload data model and workload definitions.
//!
//! A workload definition is a TOML file describing the defaults for a kind of
//! VM (base image, hostname, forwarded ports, packages). `create` turns one
//! into a [`Workload`], which is what gets persisted for the instance.

use std::path::Path;

use facet::Facet;

use crate::error::CcvmError;
use crate::validate;

/// A host directory shared with the guest over 9p. `tag` is the merge key.
#[derive(Debug, Clone, PartialEq, Eq, Facet)]
pub struct Mount {
    pub tag: String,
    pub security_model: String,
    pub path: String,
}

/// A host port forwarded to a guest port. `guest` is the merge key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Facet)]
pub struct PortMapping {
    pub host: u16,
    pub guest: u16,
}

/// A host file exposed to the guest as a block device. `path` is the merge key.
#[derive(Debug, Clone, PartialEq, Eq, Facet)]
pub struct Drive {
    pub path: String,
    pub format: String,
    #[facet(default)]
    pub options: String,
}

/// Effective VM configuration.
///
/// Zero in `mem_gib`/`cpus` means "unset"; a persisted spec always has both
/// filled in. Zero in `qemu_log_port` disables the serial log port.
#[derive(Debug, Clone, Default, PartialEq, Eq, Facet)]
#[facet(default)]
pub struct VmSpec {
    #[facet(default)]
    pub mem_gib: u32,
    #[facet(default)]
    pub cpus: u32,
    #[facet(default)]
    pub qemu_log_port: u16,
    #[facet(default)]
    pub mounts: Vec<Mount>,
    #[facet(default)]
    pub ports: Vec<PortMapping>,
    #[facet(default)]
    pub drives: Vec<Drive>,
    #[facet(default)]
    pub needs_nested_vm: bool,
    #[facet(default)]
    pub base_image_name: String,
    #[facet(default)]
    pub base_image_url: String,
}

pub const SSH_GUEST_PORT: u16 = 22;

impl VmSpec {
    /// Host port forwarded to the guest's SSH service, if any.
    pub fn ssh_port(&self) -> Option<u16> {
        self.ports
            .iter()
            .find(|p| p.guest == SSH_GUEST_PORT)
            .map(|p| p.host)
    }
}

/// The persisted state of an instance.
#[derive(Debug, Clone, PartialEq, Eq, Facet)]
pub struct Workload {
    pub name: String,
    pub hostname: String,
    /// Hint for the guest to upgrade packages on first boot. `None` leaves
    /// the guest image's default alone.
    #[facet(default)]
    pub package_upgrade: Option<bool>,
    #[facet(default)]
    pub packages: Vec<String>,
    #[facet(default)]
    pub runcmd: Vec<String>,
    pub vm: VmSpec,
}

/// On-disk workload definition. Same shape as [`Workload`] minus the name,
/// which comes from the file name.
#[derive(Debug, Clone, Default, Facet)]
#[facet(default)]
struct WorkloadDefinition {
    #[facet(default)]
    hostname: String,
    #[facet(default)]
    packages: Vec<String>,
    #[facet(default)]
    runcmd: Vec<String>,
    #[facet(default)]
    vm: VmSpec,
}

const BUILTIN_WORKLOADS: &[(&str, &str)] = &[
    ("ubuntu", include_str!("../workloads/ubuntu.toml")),
    ("debian", include_str!("../workloads/debian.toml")),
];

/// Names of the workloads compiled into the binary.
pub fn builtin_names() -> impl Iterator<Item = &'static str> {
    BUILTIN_WORKLOADS.iter().map(|(name, _)| *name)
}

/// Look up a workload definition by name.
///
/// `<workloads_dir>/<name>.toml` shadows a built-in definition of the same name.
pub fn load(name: &str, workloads_dir: &Path) -> Result<Workload, CcvmError> {
    validate::check_name(name)?;

    let user_path = workloads_dir.join(format!("{name}.toml"));
    if user_path.is_file() {
        let contents = std::fs::read_to_string(&user_path).map_err(|source| CcvmError::Io {
            context: format!("reading {}", user_path.display()),
            source,
        })?;
        tracing::debug!(path = %user_path.display(), "using user workload definition");
        return parse(name, &contents, &user_path.display().to_string());
    }

    let (_, contents) = BUILTIN_WORKLOADS
        .iter()
        .find(|(builtin, _)| *builtin == name)
        .ok_or_else(|| CcvmError::WorkloadNotFound {
            name: name.to_string(),
            available: builtin_names().collect::<Vec<_>>().join(", "),
        })?;
    parse(name, contents, &format!("<builtin {name}>"))
}

fn parse(name: &str, contents: &str, origin: &str) -> Result<Workload, CcvmError> {
    let def: WorkloadDefinition =
        facet_toml::from_str(contents).map_err(|e| CcvmError::WorkloadParse {
            path: origin.to_string(),
            message: e.to_string(),
        })?;

    if def.vm.base_image_url.is_empty() {
        return Err(CcvmError::WorkloadParse {
            path: origin.to_string(),
            message: "vm.base_image_url must be set".into(),
        });
    }

    let hostname = if def.hostname.is_empty() {
        name.to_string()
    } else {
        def.hostname
    };
    let mut vm = def.vm;
    if vm.base_image_name.is_empty() {
        vm.base_image_name = vm.base_image_url.clone();
    }

    Ok(Workload {
        name: name.to_string(),
        hostname,
        package_upgrade: None,
        packages: def.packages,
        runcmd: def.runcmd,
        vm,
    })
}
