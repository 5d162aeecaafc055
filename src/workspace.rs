use std::path::{Path, PathBuf};

use crate::error::CcvmError;
use crate::validate;

/// Proxy values picked up from the environment and forwarded to the guest.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProxySettings {
    pub http: String,
    pub https: String,
    pub no_proxy: String,
}

impl ProxySettings {
    pub fn from_env() -> Self {
        Self {
            http: proxy_var("http_proxy"),
            https: proxy_var("https_proxy"),
            no_proxy: proxy_var("no_proxy"),
        }
    }

    pub fn is_configured(&self) -> bool {
        !self.http.is_empty() || !self.https.is_empty()
    }
}

/// Lowercase wins, matching curl and friends.
fn proxy_var(name: &str) -> String {
    std::env::var(name)
        .or_else(|_| std::env::var(name.to_ascii_uppercase()))
        .unwrap_or_default()
}

/// Environment snapshot for one command invocation. Computed once, read-only after.
#[derive(Debug, Clone)]
pub struct Workspace {
    /// Instance name selected with `--instance`.
    pub instance: String,
    pub home: PathBuf,
    /// Login name, reused as the guest user.
    pub user: String,
    /// `~/.local/share/ccvm/`
    pub data_dir: PathBuf,
    /// Base image cache: `~/.cache/ccvm/images/`
    pub cache_dir: PathBuf,
    /// User workload definitions: `~/.config/ccvm/workloads/`
    pub workloads_dir: PathBuf,
    /// `~/.local/share/ccvm/instances/<instance>/`
    pub instance_dir: PathBuf,
    /// Private half of the key pair used to reach every instance.
    pub key_path: PathBuf,
    pub proxy: ProxySettings,
}

impl Workspace {
    /// Build the workspace from the user's environment, creating the shared
    /// data and cache directories. The instance directory is not touched.
    pub fn prepare(instance: &str) -> Result<Self, CcvmError> {
        validate::check_name(instance)?;

        let home = dirs::home_dir().ok_or_else(|| CcvmError::Environment {
            message: "unable to determine home directory".into(),
        })?;
        let data_root = dirs::data_local_dir().unwrap_or_else(|| home.join(".local/share"));
        let cache_root = dirs::cache_dir().unwrap_or_else(|| home.join(".cache"));
        let config_root = dirs::config_dir().unwrap_or_else(|| home.join(".config"));

        let mut ws = Self::with_roots(
            instance,
            &home,
            &data_root.join("ccvm"),
            &cache_root.join("ccvm").join("images"),
            &config_root.join("ccvm").join("workloads"),
        );
        ws.proxy = ProxySettings::from_env();
        ws.user = std::env::var("USER")
            .ok()
            .filter(|u| !u.is_empty() && u != "root")
            .unwrap_or_else(|| "ccvm".to_string());

        for dir in [&ws.data_dir, &ws.cache_dir] {
            std::fs::create_dir_all(dir).map_err(|e| CcvmError::Environment {
                message: format!("unable to create {}: {e}", dir.display()),
            })?;
        }

        Ok(ws)
    }

    /// Workspace with everything under `root`. No filesystem access.
    pub fn with_root(root: &Path, instance: &str) -> Self {
        Self::with_roots(
            instance,
            &root.join("home"),
            &root.join("data"),
            &root.join("cache"),
            &root.join("workloads"),
        )
    }

    fn with_roots(
        instance: &str,
        home: &Path,
        data_dir: &Path,
        cache_dir: &Path,
        workloads_dir: &Path,
    ) -> Self {
        Self {
            instance: instance.to_string(),
            home: home.to_path_buf(),
            user: "ccvm".to_string(),
            data_dir: data_dir.to_path_buf(),
            cache_dir: cache_dir.to_path_buf(),
            workloads_dir: workloads_dir.to_path_buf(),
            instance_dir: data_dir.join("instances").join(instance),
            key_path: data_dir.join("id_ed25519"),
            proxy: ProxySettings::default(),
        }
    }

    /// Serialized [`crate::workload::Workload`].
    pub fn state_path(&self) -> PathBuf {
        self.instance_dir.join("state.json")
    }

    pub fn log_path(&self) -> PathBuf {
        self.instance_dir.join("ccvm.log")
    }

    pub fn public_key_path(&self) -> PathBuf {
        self.key_path.with_extension("pub")
    }

    pub fn known_hosts_path(&self) -> PathBuf {
        self.home.join(".ssh").join("known_hosts")
    }
}
