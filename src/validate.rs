//! Parsers for command-line override tokens.
//!
//! Each parser takes one raw token and returns a typed value or a
//! [`CcvmError::Validation`] naming the expected format. They are plugged into
//! clap as `value_parser`s, so a bad token is reported as a usage error.

use std::path::Path;

use crate::error::CcvmError;
use crate::workload::{Drive, Mount, PortMapping};

/// Parse `tag,security_model,path`.
///
/// The path is only checked for shape here; [`check_directory`] verifies it
/// against the host before the mount is used.
pub fn parse_mount(token: &str) -> Result<Mount, CcvmError> {
    let fields: Vec<&str> = token.split(',').collect();
    let [tag, security_model, path] = fields.as_slice() else {
        return Err(CcvmError::validation(format!(
            "malformed mount spec '{token}': expected tag,security_model,path"
        )));
    };
    Ok(Mount {
        tag: tag.to_string(),
        security_model: security_model.to_string(),
        path: path.to_string(),
    })
}

/// Verify that a mount source is an absolute path to an existing directory.
pub fn check_directory(dir: &str) -> Result<(), CcvmError> {
    let path = Path::new(dir);
    if !path.is_absolute() {
        return Err(CcvmError::validation(format!(
            "{dir} is not an absolute path"
        )));
    }

    let meta = std::fs::metadata(path)
        .map_err(|e| CcvmError::validation(format!("cannot stat path {dir}: {e}")))?;
    if !meta.is_dir() {
        return Err(CcvmError::validation(format!("{dir} is not a directory")));
    }
    Ok(())
}

/// Parse `host-guest`, e.g. `10022-22`.
pub fn parse_port(token: &str) -> Result<PortMapping, CcvmError> {
    let fields: Vec<&str> = token.split('-').collect();
    let [host, guest] = fields.as_slice() else {
        return Err(CcvmError::validation(format!(
            "malformed port spec '{token}': expected host-guest"
        )));
    };
    let host = parse_port_number(host)
        .ok_or_else(|| CcvmError::validation("host port must be a number between 1 and 65535"))?;
    let guest = parse_port_number(guest)
        .ok_or_else(|| CcvmError::validation("guest port must be a number between 1 and 65535"))?;
    Ok(PortMapping { host, guest })
}

fn parse_port_number(s: &str) -> Option<u16> {
    s.trim().parse::<u16>().ok().filter(|p| *p != 0)
}

/// Parse `path,format[,option]*`. The path must be accessible on the host.
pub fn parse_drive(token: &str) -> Result<Drive, CcvmError> {
    let fields: Vec<&str> = token.split(',').collect();
    let [path, format, options @ ..] = fields.as_slice() else {
        return Err(CcvmError::validation(format!(
            "malformed drive spec '{token}': expected path,format[,option]*"
        )));
    };
    std::fs::metadata(path)
        .map_err(|e| CcvmError::validation(format!("unable to access path {path}: {e}")))?;
    Ok(Drive {
        path: path.to_string(),
        format: format.to_string(),
        options: options.join(","),
    })
}

/// Parse the package-upgrade hint. Only the literals `true` and `false` are accepted.
pub fn parse_package_upgrade(token: &str) -> Result<bool, CcvmError> {
    match token {
        "true" => Ok(true),
        "false" => Ok(false),
        _ => Err(CcvmError::validation(format!(
            "package upgrade hint must be true or false (got '{token}')"
        ))),
    }
}

/// Instance and workload names end up in file paths.
pub fn check_name(name: &str) -> Result<(), CcvmError> {
    let valid = name.chars().next().is_some_and(|c| c.is_ascii_alphanumeric())
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '.' || c == '_' || c == '-');
    if !valid {
        return Err(CcvmError::validation(format!(
            "name must match [a-zA-Z0-9][a-zA-Z0-9._-]* (got '{name}')"
        )));
    }
    Ok(())
}

/// clap adapter for [`check_name`].
pub fn parse_name(token: &str) -> Result<String, CcvmError> {
    check_name(token)?;
    Ok(token.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mount_needs_three_fields() {
        let m = parse_mount("src,passthrough,/home/me/src").unwrap();
        assert_eq!(m.tag, "src");
        assert_eq!(m.security_model, "passthrough");
        assert_eq!(m.path, "/home/me/src");

        for bad in ["src", "src,passthrough", "a,b,c,d"] {
            let err = parse_mount(bad).unwrap_err();
            assert!(err.to_string().contains("malformed mount spec"), "{bad}");
        }
    }

    #[test]
    fn check_directory_accepts_absolute_existing_dir() {
        let dir = tempfile::tempdir().unwrap();
        check_directory(dir.path().to_str().unwrap()).unwrap();
    }

    #[test]
    fn check_directory_rejects_relative() {
        let err = check_directory("some/dir").unwrap_err();
        assert!(err.to_string().contains("not an absolute path"));
    }

    #[test]
    fn check_directory_rejects_missing() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("missing");
        let err = check_directory(missing.to_str().unwrap()).unwrap_err();
        assert!(err.to_string().contains("cannot stat path"));
    }

    #[test]
    fn check_directory_rejects_file() {
        let file = tempfile::NamedTempFile::new().unwrap();
        let err = check_directory(file.path().to_str().unwrap()).unwrap_err();
        assert!(err.to_string().contains("not a directory"));
    }

    #[test]
    fn port_pair() {
        assert_eq!(
            parse_port("10022-22").unwrap(),
            PortMapping {
                host: 10022,
                guest: 22
            }
        );
    }

    #[test]
    fn port_rejects_bad_shapes() {
        for bad in ["10022", "1-2-3", ""] {
            let err = parse_port(bad).unwrap_err();
            assert!(err.to_string().contains("malformed port spec"), "{bad}");
        }
        assert!(
            parse_port("ssh-22")
                .unwrap_err()
                .to_string()
                .contains("host port must be a number")
        );
        assert!(
            parse_port("10022-ssh")
                .unwrap_err()
                .to_string()
                .contains("guest port must be a number")
        );
        assert!(parse_port("0-22").is_err());
        assert!(parse_port("70000-22").is_err());
    }

    #[test]
    fn drive_with_options() {
        let file = tempfile::NamedTempFile::new().unwrap();
        let path = file.path().to_str().unwrap();
        let d = parse_drive(&format!("{path},qcow2,extra")).unwrap();
        assert_eq!(d.path, path);
        assert_eq!(d.format, "qcow2");
        assert_eq!(d.options, "extra");

        let d = parse_drive(&format!("{path},raw,cache=none,aio=native")).unwrap();
        assert_eq!(d.options, "cache=none,aio=native");

        let d = parse_drive(&format!("{path},raw")).unwrap();
        assert_eq!(d.options, "");
    }

    #[test]
    fn drive_rejects_missing_format_or_path() {
        let file = tempfile::NamedTempFile::new().unwrap();
        let err = parse_drive(file.path().to_str().unwrap()).unwrap_err();
        assert!(err.to_string().contains("malformed drive spec"));

        let err = parse_drive("/definitely/not/here.img,qcow2").unwrap_err();
        assert!(err.to_string().contains("unable to access path"));
    }

    #[test]
    fn package_upgrade_literals() {
        assert!(parse_package_upgrade("true").unwrap());
        assert!(!parse_package_upgrade("false").unwrap());
        for bad in ["yes", "TRUE", "1", ""] {
            let err = parse_package_upgrade(bad).unwrap_err();
            assert!(err.to_string().contains("must be true or false"));
        }
    }

    #[test]
    fn names() {
        for ok in ["default", "dev-1", "ubuntu.24", "a_b"] {
            check_name(ok).unwrap();
        }
        for bad in ["", "-x", "../etc", "a/b", ".hidden"] {
            assert!(check_name(bad).is_err(), "{bad}");
        }
    }
}
