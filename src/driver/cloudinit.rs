//! cloud-init NoCloud configuration for first boot.

use std::path::Path;

use facet_value::{VArray, Value, value};

use super::BootConfig;
use crate::error::CcvmError;
use crate::workspace::ProxySettings;

pub const CONFIG_ISO: &str = "config.iso";
const SEED_DIR: &str = "cloud-init";

/// Guest directory a 9p mount with `tag` is mounted on.
pub fn guest_mount_point(tag: &str) -> String {
    format!("/mnt/{tag}")
}

pub fn meta_data(hostname: &str) -> String {
    format!("instance-id: {hostname}\nlocal-hostname: {hostname}\n")
}

fn strings(items: &[String]) -> Value {
    Value::from(VArray::from_iter(items.iter().map(|s| Value::from(s.as_str()))))
}

/// `/etc/environment` lines for the guest, in both cases since tools disagree
/// on which one they read.
fn proxy_environment(proxy: &ProxySettings) -> String {
    let mut env = String::new();
    for (name, value) in [
        ("http_proxy", &proxy.http),
        ("https_proxy", &proxy.https),
        ("no_proxy", &proxy.no_proxy),
    ] {
        if value.is_empty() {
            continue;
        }
        env.push_str(&format!("{name}={value}\n"));
        env.push_str(&format!("{}={value}\n", name.to_ascii_uppercase()));
    }
    env
}

pub fn user_data(
    config: &BootConfig,
    public_key: &str,
    debug: bool,
) -> Result<String, CcvmError> {
    let mut user = value!({
        "name": (config.user.as_str()),
        "shell": "/bin/bash",
        "sudo": "ALL=(ALL) NOPASSWD:ALL",
    });
    if let Some(obj) = user.as_object_mut() {
        obj.insert(
            "ssh_authorized_keys",
            Value::from(VArray::from_iter([Value::from(public_key.trim())])),
        );
        // Console login is only wanted when debugging a guest that never
        // reaches sshd.
        obj.insert("lock_passwd", Value::from(!debug));
        if debug {
            obj.insert("plain_text_passwd", Value::from(config.user.as_str()));
        }
    }

    let mut runcmd = VArray::new();
    for m in &config.mounts {
        runcmd.push(Value::from(VArray::from_iter([
            Value::from("mkdir"),
            Value::from("-p"),
            Value::from(guest_mount_point(&m.tag).as_str()),
        ])));
    }
    for cmd in &config.runcmd {
        runcmd.push(Value::from(cmd.as_str()));
    }

    let mut doc = value!({
        "hostname": (config.hostname.as_str()),
        "users": [user],
        "runcmd": (Value::from(runcmd)),
    });
    let Some(obj) = doc.as_object_mut() else {
        return Err(CcvmError::Driver {
            message: "cloud-config root is not a mapping".into(),
        });
    };

    if let Some(upgrade) = config.package_upgrade {
        obj.insert("package_upgrade", Value::from(upgrade));
    }
    if !config.packages.is_empty() {
        obj.insert("packages", strings(&config.packages));
    }

    if !config.mounts.is_empty() {
        let mounts = VArray::from_iter(config.mounts.iter().map(|m| {
            Value::from(VArray::from_iter([
                Value::from(m.tag.as_str()),
                Value::from(guest_mount_point(&m.tag).as_str()),
                Value::from("9p"),
                Value::from("trans=virtio,version=9p2000.L,nofail"),
                Value::from("0"),
                Value::from("0"),
            ]))
        }));
        obj.insert("mounts", Value::from(mounts));
    }

    let environment = proxy_environment(&config.proxy);
    if !environment.is_empty() {
        obj.insert(
            "write_files",
            value!([{
                "path": "/etc/environment",
                "append": true,
                "content": (environment.as_str()),
            }]),
        );
    }

    let yaml = facet_yaml::to_string(&doc).map_err(|e| CcvmError::Driver {
        message: format!("serializing cloud-config: {e}"),
    })?;
    // cloud-init wants `#cloud-config` on the very first line.
    let yaml = yaml.strip_prefix("---\n").unwrap_or(&yaml);
    Ok(format!("#cloud-config\n{yaml}"))
}

/// Write `meta-data` and `user-data` under the instance directory and pack
/// them into a `cidata` ISO next to them.
pub async fn build_config_iso(
    instance_dir: &Path,
    config: &BootConfig,
    public_key_path: &Path,
    debug: bool,
) -> Result<(), CcvmError> {
    let public_key = tokio::fs::read_to_string(public_key_path)
        .await
        .map_err(|e| CcvmError::Io {
            context: format!("reading public key {}", public_key_path.display()),
            source: e,
        })?;

    let seed_dir = instance_dir.join(SEED_DIR);
    tokio::fs::create_dir_all(&seed_dir)
        .await
        .map_err(|e| CcvmError::Io {
            context: format!("creating directory {}", seed_dir.display()),
            source: e,
        })?;

    for (name, contents) in [
        ("meta-data", meta_data(&config.hostname)),
        ("user-data", user_data(config, &public_key, debug)?),
    ] {
        let path = seed_dir.join(name);
        tokio::fs::write(&path, contents)
            .await
            .map_err(|e| CcvmError::Io {
                context: format!("writing {}", path.display()),
                source: e,
            })?;
    }

    let iso = instance_dir.join(CONFIG_ISO);
    let output = tokio::process::Command::new("xorriso")
        .args(["-as", "mkisofs", "-quiet", "-o"])
        .arg(&iso)
        .args(["-V", "cidata", "-J", "-R"])
        .arg(&seed_dir)
        .output()
        .await
        .map_err(|e| CcvmError::Io {
            context: "running xorriso".into(),
            source: e,
        })?;

    if !output.status.success() {
        return Err(CcvmError::ExternalCommand {
            command: "xorriso".into(),
            message: String::from_utf8_lossy(&output.stderr).into_owned(),
        });
    }

    tracing::info!(path = %iso.display(), "generated cloud-init config ISO");
    Ok(())
}
