use thiserror::Error;

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// All errors possible to occur during watch, reconciliation and git delivery
#[derive(Error, Debug)]
pub enum Error {
    /// Any error originating from the `kube-rs` crate
    #[error("kube error: {0}")]
    KubeError(#[source] kube::Error),

    #[error("serialization error: {0}")]
    SerializationError(#[source] serde_json::Error),

    #[error("yaml error: {0}")]
    YamlError(#[source] serde_yaml::Error),

    /// Any error originating from libgit2
    #[error("git error: {0}")]
    GitError(#[source] git2::Error),

    #[error("io error: {0}")]
    IoError(#[source] std::io::Error),

    #[error("encryption error: {0}")]
    EncryptError(String),

    /// The destination requires encryption but its base folder carries no
    /// recipient declaration
    #[error(
        "missing encryption config: expected `{0}/{file}` declaring age recipients \
         (creation_rules: [{{age: \"age1...\"}}])",
        file = crate::encrypt::ENCRYPTION_CONFIG_FILE
    )]
    MissingEncryptionConfig(String),

    #[error("credentials error: {0}")]
    CredentialsError(String),

    /// A watched or admitted payload that is not a Kubernetes object
    #[error("invalid object: {0}")]
    InvalidObject(String),

    /// Error in user input or CRD definition, typically missing or
    /// inconsistent fields
    #[error("invalid configuration: {0}")]
    UserInputError(String),

    /// Finalizer bookkeeping failed in the outer controllers
    #[error("finalizer error: {0}")]
    FinalizerError(String),

    #[error("invalid OpenTelemetry trace id")]
    InvalidTraceId,
}

impl Error {
    pub fn metric_label(&self) -> String {
        match self {
            Error::KubeError(_) => "kube_error",
            Error::SerializationError(_) => "serialization_error",
            Error::YamlError(_) => "yaml_error",
            Error::GitError(_) => "git_error",
            Error::IoError(_) => "io_error",
            Error::EncryptError(_) => "encrypt_error",
            Error::MissingEncryptionConfig(_) => "missing_encryption_config",
            Error::CredentialsError(_) => "credentials_error",
            Error::InvalidObject(_) => "invalid_object",
            Error::UserInputError(_) => "user_input_error",
            Error::FinalizerError(_) => "finalizer_error",
            Error::InvalidTraceId => "invalid_trace_id",
        }
        .to_string()
    }
}

impl From<kube::Error> for Error {
    fn from(e: kube::Error) -> Self {
        Error::KubeError(e)
    }
}

impl From<git2::Error> for Error {
    fn from(e: git2::Error) -> Self {
        Error::GitError(e)
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::IoError(e)
    }
}
