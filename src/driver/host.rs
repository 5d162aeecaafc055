//! Facts about the host: installed tools, KVM features, and sizing.

use std::path::Path;

use crate::error::CcvmError;
use crate::merge::HostDefaults;
use crate::util;

pub const REQUIRED_TOOLS: &[&str] = &["qemu-system-x86_64", "qemu-img", "xorriso"];

const NESTED_PARAMS: &[&str] = &[
    "/sys/module/kvm_intel/parameters/nested",
    "/sys/module/kvm_amd/parameters/nested",
];

/// Fail naming every required tool missing from `$PATH`.
pub fn check_tools() -> Result<(), CcvmError> {
    let missing: Vec<String> = REQUIRED_TOOLS
        .iter()
        .filter(|tool| util::find_in_path(tool).is_none())
        .map(|tool| tool.to_string())
        .collect();

    if missing.is_empty() {
        tracing::debug!("all host tools present");
        Ok(())
    } else {
        Err(CcvmError::MissingTools { tools: missing })
    }
}

pub fn nested_virtualization_enabled() -> bool {
    NESTED_PARAMS
        .iter()
        .any(|param| nested_param_enabled(Path::new(param)))
}

fn nested_param_enabled(path: &Path) -> bool {
    std::fs::read_to_string(path)
        .map(|v| matches!(v.trim(), "Y" | "y" | "1"))
        .unwrap_or(false)
}

/// Half the host's memory and half its CPUs, at least one of each.
pub fn defaults() -> HostDefaults {
    let meminfo = std::fs::read_to_string("/proc/meminfo").unwrap_or_default();
    let cpus = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1);
    let defaults = defaults_from(&meminfo, cpus);
    tracing::debug!(mem_gib = defaults.mem_gib, cpus = defaults.cpus, "host defaults");
    defaults
}

fn defaults_from(meminfo: &str, cpus: usize) -> HostDefaults {
    let mem_kib = meminfo
        .lines()
        .find_map(|line| line.strip_prefix("MemTotal:"))
        .and_then(|rest| rest.split_whitespace().next())
        .and_then(|kib| kib.parse::<u64>().ok())
        .unwrap_or(0);
    let mem_gib = mem_kib / (1024 * 1024) / 2;

    HostDefaults {
        mem_gib: u32::try_from(mem_gib).unwrap_or(u32::MAX).max(1),
        cpus: u32::try_from(cpus / 2).unwrap_or(u32::MAX).max(1),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MEMINFO: &str = "\
MemTotal:       32657832 kB
MemFree:         1234567 kB
MemAvailable:   20000000 kB
";

    #[test]
    fn half_of_host() {
        let d = defaults_from(MEMINFO, 16);
        // 32657832 KiB is just under 32 GiB.
        assert_eq!(d.mem_gib, 15);
        assert_eq!(d.cpus, 8);
    }

    #[test]
    fn never_below_one() {
        let d = defaults_from("MemTotal: 1024 kB\n", 1);
        assert_eq!(d.mem_gib, 1);
        assert_eq!(d.cpus, 1);
    }

    #[test]
    fn unreadable_meminfo() {
        assert_eq!(defaults_from("", 4).mem_gib, 1);
    }

    #[test]
    fn nested_param_values() {
        let dir = tempfile::tempdir().unwrap();
        let param = dir.path().join("nested");

        assert!(!nested_param_enabled(&param));
        for (value, expected) in [("Y\n", true), ("1\n", true), ("N\n", false), ("0\n", false)] {
            std::fs::write(&param, value).unwrap();
            assert_eq!(nested_param_enabled(&param), expected, "{value:?}");
        }
    }
}
