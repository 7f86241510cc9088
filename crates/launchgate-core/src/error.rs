use thiserror::Error;

#[derive(Debug, Error)]
pub enum GateError {
    #[error("not initialized: run 'launchgate init'")]
    NotInitialized,

    #[error("defaults store error: {0}")]
    Store(String),

    #[error("invalid endpoint '{0}': must be an absolute http(s) URL")]
    InvalidEndpoint(String),

    #[error("notification authorization was already requested during this launch")]
    PermissionAlreadyRequested,

    #[error("unknown authorization state '{0}'")]
    InvalidAuthState(String),

    #[error("orchestrator stopped before reaching a terminal presentation")]
    OrchestratorStopped,

    #[error(transparent)]
    Http(#[from] reqwest::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, GateError>;
