use std::io::Write;
use std::os::unix::fs::OpenOptionsExt;
use std::path::Path;

use rand_core::OsRng;
use ssh_key::{Algorithm, LineEnding, PrivateKey};

use crate::error::CcvmError;

const KEY_COMMENT: &str = "ccvm";

/// Generate the ed25519 pair at `private` / `public` unless the private key
/// already exists. A missing public half is regenerated from the private key.
pub fn ensure_key_pair(private: &Path, public: &Path) -> Result<(), CcvmError> {
    let key = if private.exists() {
        if public.exists() {
            tracing::debug!(path = %private.display(), "reusing ssh key pair");
            return Ok(());
        }
        let pem = std::fs::read_to_string(private).map_err(|e| CcvmError::Io {
            context: format!("reading {}", private.display()),
            source: e,
        })?;
        PrivateKey::from_openssh(&pem).map_err(|e| CcvmError::Driver {
            message: format!("unable to parse ssh key {}: {e}", private.display()),
        })?
    } else {
        let mut key =
            PrivateKey::random(&mut OsRng, Algorithm::Ed25519).map_err(|e| CcvmError::Driver {
                message: format!("generating ssh key: {e}"),
            })?;
        key.set_comment(KEY_COMMENT);
        write_private(private, &key)?;
        tracing::info!(path = %private.display(), "generated ssh key pair");
        key
    };

    let openssh = key.public_key().to_openssh().map_err(|e| CcvmError::Driver {
        message: format!("encoding public key: {e}"),
    })?;
    std::fs::write(public, format!("{openssh}\n")).map_err(|e| CcvmError::Io {
        context: format!("writing {}", public.display()),
        source: e,
    })
}

fn write_private(path: &Path, key: &PrivateKey) -> Result<(), CcvmError> {
    let pem = key.to_openssh(LineEnding::LF).map_err(|e| CcvmError::Driver {
        message: format!("encoding private key: {e}"),
    })?;

    let io_err = |e| CcvmError::Io {
        context: format!("writing {}", path.display()),
        source: e,
    };
    let mut file = std::fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .mode(0o600)
        .open(path)
        .map_err(io_err)?;
    file.write_all(pem.as_bytes()).map_err(io_err)
}
