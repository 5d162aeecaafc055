//! Persisted instance state.
//!
//! The instance directory existing means the instance exists. Inside it,
//! `state.json` holds the full [`Workload`] as last written; every save
//! replaces the whole file.

use std::path::{Path, PathBuf};

use crate::error::CcvmError;
use crate::workload::Workload;
use crate::workspace::Workspace;

/// Overwrite the instance's state file. The instance directory must exist.
pub fn save(workload: &Workload, ws: &Workspace) -> Result<(), CcvmError> {
    let path = ws.state_path();
    let storage_err = |source| CcvmError::Storage {
        path: path.display().to_string(),
        source,
    };

    if !ws.instance_dir.is_dir() {
        return Err(storage_err(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            "instance directory does not exist",
        )));
    }

    let json = facet_json::to_string(workload).map_err(|e| encoding_failed(&path, e))?;

    // Write-then-rename so a crash never leaves a truncated state file.
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, json).map_err(storage_err)?;
    std::fs::rename(&tmp, &path).map_err(storage_err)?;

    tracing::debug!(path = %path.display(), "saved instance state");
    Ok(())
}

fn encoding_failed(path: &Path, e: impl std::fmt::Display) -> CcvmError {
    CcvmError::Storage {
        path: path.display().to_string(),
        source: std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("serializing instance state: {e}"),
        ),
    }
}

/// Load the instance's state file.
pub fn restore(ws: &Workspace) -> Result<Workload, CcvmError> {
    let path = ws.state_path();
    let contents = match std::fs::read_to_string(&path) {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(CcvmError::InstanceNotFound {
                path: ws.instance_dir.display().to_string(),
            });
        }
        Err(source) => {
            return Err(CcvmError::Io {
                context: format!("reading {}", path.display()),
                source,
            });
        }
    };

    facet_json::from_str(&contents).map_err(|e| CcvmError::CorruptState {
        path: path.display().to_string(),
        message: e.to_string(),
    })
}

/// Remove the instance directory and everything in it.
pub fn remove(ws: &Workspace) -> Result<(), CcvmError> {
    std::fs::remove_dir_all(&ws.instance_dir).map_err(|source| CcvmError::Io {
        context: format!("unable to delete instance {}", ws.instance_dir.display()),
        source,
    })?;
    tracing::info!(path = %ws.instance_dir.display(), "removed instance directory");
    Ok(())
}

/// A freshly created instance directory that is removed again on drop
/// unless [`InstanceDir::commit`] is called.
#[derive(Debug)]
pub struct InstanceDir {
    path: PathBuf,
    committed: bool,
}

impl InstanceDir {
    /// Create the instance directory. Fails if it already exists.
    pub fn acquire(ws: &Workspace) -> Result<Self, CcvmError> {
        let path = ws.instance_dir.clone();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|source| CcvmError::Io {
                context: format!("unable to create {}", parent.display()),
                source,
            })?;
        }

        match std::fs::create_dir(&path) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                return Err(CcvmError::InstanceExists {
                    path: path.display().to_string(),
                });
            }
            Err(source) => {
                return Err(CcvmError::Io {
                    context: format!("unable to create instance dir {}", path.display()),
                    source,
                });
            }
        }

        tracing::debug!(path = %path.display(), "created instance directory");
        Ok(Self {
            path,
            committed: false,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Keep the directory.
    pub fn commit(mut self) {
        self.committed = true;
    }
}

impl Drop for InstanceDir {
    fn drop(&mut self) {
        if self.committed {
            return;
        }
        match std::fs::remove_dir_all(&self.path) {
            Ok(()) => {
                tracing::info!(path = %self.path.display(), "rolled back instance directory")
            }
            Err(e) => tracing::warn!(
                path = %self.path.display(),
                error = %e,
                "failed to remove partially created instance"
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workload::{PortMapping, VmSpec};

    fn sample() -> Workload {
        Workload {
            name: "ubuntu".into(),
            hostname: "dev".into(),
            package_upgrade: Some(false),
            packages: vec!["git".into()],
            runcmd: vec![],
            vm: VmSpec {
                mem_gib: 4,
                cpus: 2,
                ports: vec![PortMapping { host: 10022, guest: 22 }],
                base_image_url: "https://example.com/img.qcow2".into(),
                ..VmSpec::default()
            },
        }
    }

    #[test]
    fn save_then_restore() {
        let root = tempfile::tempdir().unwrap();
        let ws = Workspace::with_root(root.path(), "dev");
        std::fs::create_dir_all(&ws.instance_dir).unwrap();

        save(&sample(), &ws).unwrap();
        assert_eq!(restore(&ws).unwrap(), sample());

        let mut changed = sample();
        changed.vm.mem_gib = 8;
        save(&changed, &ws).unwrap();
        assert_eq!(restore(&ws).unwrap().vm.mem_gib, 8);
    }

    #[test]
    fn save_requires_instance_dir() {
        let root = tempfile::tempdir().unwrap();
        let ws = Workspace::with_root(root.path(), "dev");
        let err = save(&sample(), &ws).unwrap_err();
        assert!(matches!(err, CcvmError::Storage { .. }));
        assert!(!ws.instance_dir.exists());
    }

    #[test]
    fn restore_missing_is_not_found() {
        let root = tempfile::tempdir().unwrap();
        let ws = Workspace::with_root(root.path(), "dev");
        let err = restore(&ws).unwrap_err();
        assert!(matches!(err, CcvmError::InstanceNotFound { .. }));
    }

    #[test]
    fn restore_garbage_is_corrupt() {
        let root = tempfile::tempdir().unwrap();
        let ws = Workspace::with_root(root.path(), "dev");
        std::fs::create_dir_all(&ws.instance_dir).unwrap();
        std::fs::write(ws.state_path(), "{ not json").unwrap();
        let err = restore(&ws).unwrap_err();
        assert!(matches!(err, CcvmError::CorruptState { .. }));
    }

    #[test]
    fn instance_dir_rolls_back_unless_committed() {
        let root = tempfile::tempdir().unwrap();
        let ws = Workspace::with_root(root.path(), "dev");

        let dir = InstanceDir::acquire(&ws).unwrap();
        std::fs::write(dir.path().join("junk"), "x").unwrap();
        drop(dir);
        assert!(!ws.instance_dir.exists());

        let dir = InstanceDir::acquire(&ws).unwrap();
        dir.commit();
        assert!(ws.instance_dir.is_dir());
    }

    #[test]
    fn acquire_existing_fails_without_touching_it() {
        let root = tempfile::tempdir().unwrap();
        let ws = Workspace::with_root(root.path(), "dev");
        std::fs::create_dir_all(&ws.instance_dir).unwrap();
        std::fs::write(ws.instance_dir.join("keep"), "x").unwrap();

        let err = InstanceDir::acquire(&ws).unwrap_err();
        assert!(matches!(err, CcvmError::InstanceExists { .. }));
        assert!(ws.instance_dir.join("keep").exists());
    }

    #[test]
    fn encoding_failure_is_a_storage_error() {
        let err = encoding_failed(Path::new("/d/state.json"), "unsupported value");
        assert!(matches!(err, CcvmError::Storage { .. }));
        assert_eq!(
            err.to_string(),
            "unable to save instance state to /d/state.json: serializing instance state: unsupported value"
        );
    }
}
