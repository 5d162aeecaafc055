use miette::Diagnostic;
use thiserror::Error;

#[derive(Debug, Error, Diagnostic)]
pub enum CcvmError {
    #[error("{message}")]
    Validation { message: String },

    #[error("{message}")]
    Environment { message: String },

    #[error("required host tools not found: {}", tools.join(", "))]
    #[diagnostic(help("install them with your distribution's package manager and retry"))]
    MissingTools { tools: Vec<String> },

    #[error("nested KVM is not enabled.  Please enable and try again")]
    #[diagnostic(help("set the `nested` parameter of the kvm_intel or kvm_amd module"))]
    NestedVirtUnavailable,

    #[error("instance already exists")]
    #[diagnostic(help("run `ccvm delete` first or pick another name with --instance"))]
    InstanceExists { path: String },

    #[error("instance not found: {path}")]
    #[diagnostic(help("run `ccvm create <workload>` first"))]
    InstanceNotFound { path: String },

    #[error("corrupt state in {path}: {message}")]
    CorruptState { path: String, message: String },

    #[error("unable to save instance state to {path}: {source}")]
    Storage {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("unknown workload '{name}'")]
    #[diagnostic(help("built-in workloads: {available}"))]
    WorkloadNotFound { name: String, available: String },

    #[error("failed to parse workload definition {path}: {message}")]
    WorkloadParse { path: String, message: String },

    #[error("instance does not have SSH port open.  Unable to determine status")]
    NoSshPort,

    #[error("unable to locate ssh binary")]
    SshNotFound,

    #[error("failed to download image: {message}: {source}")]
    ImageDownload {
        message: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("{command} failed: {message}")]
    ExternalCommand { command: String, message: String },

    #[error("{message}")]
    Driver { message: String },

    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Cancelled")]
    Cancelled,
}

impl CcvmError {
    pub fn validation(message: impl Into<String>) -> Self {
        CcvmError::Validation {
            message: message.into(),
        }
    }
}
