#[derive(thiserror::Error, Debug)]
pub enum ProxyError {
    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Backend '{0}' is not ready")]
    BackendNotReady(String),

    #[error("Backend '{name}' failed to start: {message}")]
    BackendStart { name: String, message: String },

    #[error("Call to backend '{backend}' failed: {message}")]
    BackendCall {
        backend: String,
        message: String,
        /// Transient failures are retried once; permanent ones are not.
        transient: bool,
    },

    #[error("Template '{template}' exhausted: {max_instances} instances already active")]
    ResourceExhausted {
        template: String,
        max_instances: usize,
    },

    #[error("Invalid params: {0}")]
    InvalidParams(String),

    #[error("Insufficient scope: tags {missing:?} are not covered by the granted scopes")]
    InsufficientScope { missing: Vec<String> },

    #[error("Internal error: {0}")]
    Internal(String),
}

impl ProxyError {
    /// True for backend-call failures worth one automatic retry.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::BackendCall { transient: true, .. })
    }
}
