use std::ffi::OsStr;
use std::os::unix::fs::PermissionsExt;
use std::path::PathBuf;

/// Locate an executable on `$PATH`.
pub fn find_in_path(bin: &str) -> Option<PathBuf> {
    find_in(bin, &std::env::var_os("PATH")?)
}

fn find_in(bin: &str, path_var: &OsStr) -> Option<PathBuf> {
    std::env::split_paths(path_var)
        .map(|dir| dir.join(bin))
        .find(|candidate| is_executable(candidate))
}

fn is_executable(path: &std::path::Path) -> bool {
    std::fs::metadata(path)
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

/// `bytes` in whole megabytes, rounded down.
pub fn megabytes(bytes: u64) -> u64 {
    bytes / (1024 * 1024)
}
