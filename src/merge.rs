//! Combining workload defaults, persisted state and CLI overrides.
//!
//! Scalars: a nonzero override wins, otherwise the existing value stands, and
//! a still-zero memory/CPU count falls back to a host-derived default.
//! Collections: an override entry replaces the existing entry with the same
//! merge key in place, or is appended.

use crate::error::CcvmError;
use crate::validate;
use crate::workload::{Drive, Mount, PortMapping, VmSpec};
use crate::workspace::ProxySettings;

/// Values the host suggests when neither the override nor the persisted
/// configuration sets memory or CPU count.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HostDefaults {
    pub mem_gib: u32,
    pub cpus: u32,
}

/// Validated command-line overrides for a VM. Zero/empty means "not given".
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VmOverrides {
    pub mem_gib: u32,
    pub cpus: u32,
    pub qemu_log_port: u16,
    pub mounts: Vec<Mount>,
    pub ports: Vec<PortMapping>,
    pub drives: Vec<Drive>,
}

impl VmOverrides {
    /// Host-side check of mount sources, deferred from token parsing.
    pub fn check_mounts(&self) -> Result<(), CcvmError> {
        for m in &self.mounts {
            validate::check_directory(&m.path)?;
        }
        Ok(())
    }
}

/// Produce the effective configuration from `base` (defaults or persisted
/// state), the overrides and the host defaults. `base` is left untouched.
pub fn resolve(base: &VmSpec, overrides: &VmOverrides, host: HostDefaults) -> VmSpec {
    let mut vm = base.clone();
    apply_overrides(&mut vm, overrides);
    fill_host_defaults(&mut vm, host);
    vm
}

pub fn apply_overrides(vm: &mut VmSpec, overrides: &VmOverrides) {
    if overrides.mem_gib != 0 {
        vm.mem_gib = overrides.mem_gib;
    }
    if overrides.cpus != 0 {
        vm.cpus = overrides.cpus;
    }
    if overrides.qemu_log_port != 0 {
        vm.qemu_log_port = overrides.qemu_log_port;
    }
    merge_mounts(&mut vm.mounts, &overrides.mounts);
    merge_ports(&mut vm.ports, &overrides.ports);
    merge_drives(&mut vm.drives, &overrides.drives);
}

pub fn fill_host_defaults(vm: &mut VmSpec, host: HostDefaults) {
    if vm.mem_gib == 0 {
        vm.mem_gib = host.mem_gib.max(1);
    }
    if vm.cpus == 0 {
        vm.cpus = host.cpus.max(1);
    }
}

pub fn merge_mounts(existing: &mut Vec<Mount>, incoming: &[Mount]) {
    merge_by_key(existing, incoming, |m| m.tag.clone());
}

pub fn merge_ports(existing: &mut Vec<PortMapping>, incoming: &[PortMapping]) {
    merge_by_key(existing, incoming, |p| p.guest);
}

pub fn merge_drives(existing: &mut Vec<Drive>, incoming: &[Drive]) {
    merge_by_key(existing, incoming, |d| d.path.clone());
}

fn merge_by_key<T, K, F>(existing: &mut Vec<T>, incoming: &[T], key: F)
where
    T: Clone,
    K: PartialEq,
    F: Fn(&T) -> K,
{
    for entry in incoming {
        let k = key(entry);
        match existing.iter_mut().find(|e| key(e) == k) {
            Some(slot) => *slot = entry.clone(),
            None => existing.push(entry.clone()),
        }
    }
}

/// `no_proxy` value handed to the guest once the hostname is fixed.
///
/// The guest's own hostname is prepended to an existing list; with proxies
/// configured but no list, the hostname alone is used.
pub fn no_proxy(hostname: &str, proxy: &ProxySettings) -> String {
    if !proxy.no_proxy.is_empty() {
        format!("{hostname},{}", proxy.no_proxy)
    } else if proxy.is_configured() {
        hostname.to_string()
    } else {
        String::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const HOST: HostDefaults = HostDefaults { mem_gib: 8, cpus: 4 };

    fn mount(tag: &str, path: &str) -> Mount {
        Mount {
            tag: tag.into(),
            security_model: "passthrough".into(),
            path: path.into(),
        }
    }

    fn drive(path: &str, format: &str) -> Drive {
        Drive {
            path: path.into(),
            format: format.into(),
            options: String::new(),
        }
    }

    fn base() -> VmSpec {
        VmSpec {
            mem_gib: 2,
            cpus: 0,
            mounts: vec![mount("src", "/a"), mount("data", "/b")],
            ports: vec![PortMapping { host: 10022, guest: 22 }],
            drives: vec![drive("/disk.img", "raw")],
            base_image_url: "https://example.com/img.qcow2".into(),
            ..VmSpec::default()
        }
    }

    #[test]
    fn nonzero_scalar_overrides_win() {
        let o = VmOverrides {
            mem_gib: 6,
            cpus: 3,
            qemu_log_port: 9999,
            ..VmOverrides::default()
        };
        let vm = resolve(&base(), &o, HOST);
        assert_eq!((vm.mem_gib, vm.cpus, vm.qemu_log_port), (6, 3, 9999));
    }

    #[test]
    fn zero_overrides_keep_existing_then_host() {
        let vm = resolve(&base(), &VmOverrides::default(), HOST);
        assert_eq!(vm.mem_gib, 2, "persisted value stands");
        assert_eq!(vm.cpus, 4, "host default fills the gap");
        assert_eq!(vm.qemu_log_port, 0, "log port has no host default");
    }

    #[test]
    fn host_defaults_never_zero() {
        let vm = resolve(
            &VmSpec::default(),
            &VmOverrides::default(),
            HostDefaults { mem_gib: 0, cpus: 0 },
        );
        assert_eq!((vm.mem_gib, vm.cpus), (1, 1));
    }

    #[test]
    fn same_key_replaced_in_place() {
        let o = VmOverrides {
            mounts: vec![mount("src", "/new")],
            ports: vec![
                PortMapping { host: 8080, guest: 80 },
                PortMapping { host: 2222, guest: 22 },
            ],
            drives: vec![drive("/disk.img", "qcow2")],
            ..VmOverrides::default()
        };
        let vm = resolve(&base(), &o, HOST);

        assert_eq!(vm.mounts, vec![mount("src", "/new"), mount("data", "/b")]);
        assert_eq!(
            vm.ports,
            vec![
                PortMapping { host: 2222, guest: 22 },
                PortMapping { host: 8080, guest: 80 },
            ]
        );
        assert_eq!(vm.drives, vec![drive("/disk.img", "qcow2")]);
    }

    #[test]
    fn duplicate_keys_within_overrides_collapse() {
        let o = VmOverrides {
            ports: vec![
                PortMapping { host: 3000, guest: 3000 },
                PortMapping { host: 3001, guest: 3000 },
            ],
            ..VmOverrides::default()
        };
        let vm = resolve(&base(), &o, HOST);
        let for_3000: Vec<_> = vm.ports.iter().filter(|p| p.guest == 3000).collect();
        assert_eq!(for_3000.len(), 1);
        assert_eq!(for_3000[0].host, 3001);
    }

    #[test]
    fn merge_is_idempotent() {
        let o = VmOverrides {
            mem_gib: 4,
            mounts: vec![mount("src", "/new"), mount("extra", "/c")],
            ports: vec![PortMapping { host: 8080, guest: 80 }],
            drives: vec![drive("/other.img", "raw")],
            ..VmOverrides::default()
        };
        let once = resolve(&base(), &o, HOST);
        let again = resolve(&base(), &o, HOST);
        assert_eq!(once, again);

        let twice = resolve(&once, &o, HOST);
        assert_eq!(once, twice);
    }

    #[test]
    fn base_is_not_mutated() {
        let b = base();
        let o = VmOverrides {
            mounts: vec![mount("extra", "/c")],
            ..VmOverrides::default()
        };
        let _ = resolve(&b, &o, HOST);
        assert_eq!(b, base());
    }

    #[test]
    fn no_proxy_derivation() {
        let none = ProxySettings::default();
        assert_eq!(no_proxy("vm", &none), "");

        let proxied = ProxySettings {
            http: "http://proxy:3128".into(),
            ..ProxySettings::default()
        };
        assert_eq!(no_proxy("vm", &proxied), "vm");

        let listed = ProxySettings {
            https: "http://proxy:3128".into(),
            no_proxy: "localhost,.corp".into(),
            ..ProxySettings::default()
        };
        assert_eq!(no_proxy("vm", &listed), "vm,localhost,.corp");
    }

    #[test]
    fn check_mounts_runs_directory_check() {
        let dir = tempfile::tempdir().unwrap();
        let ok = VmOverrides {
            mounts: vec![mount("src", dir.path().to_str().unwrap())],
            ..VmOverrides::default()
        };
        ok.check_mounts().unwrap();

        let bad = VmOverrides {
            mounts: vec![mount("src", "relative/path")],
            ..VmOverrides::default()
        };
        assert!(bad.check_mounts().is_err());
    }
}
