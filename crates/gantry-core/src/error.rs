use thiserror::Error;

#[derive(Debug, Error)]
pub enum GantryError {
    // Workflow / input errors
    #[error("Invalid workflow: {0}")]
    InvalidWorkflow(String),

    // Config errors
    #[error("Config error: {0}")]
    Config(String),

    #[error("Config file not found: {0}")]
    ConfigNotFound(String),

    // Graph server errors
    #[error("Server error: {0}")]
    Server(String),

    #[error("Port {0} is owned by a process that fails the liveness probe")]
    PortConflict(u16),

    #[error("Server push channel error: {0}")]
    Stream(String),

    // Install errors
    #[error("Install failed: {plugin}: {message}")]
    Install { plugin: String, message: String },

    // Status log errors
    #[error("Status log lock timed out: {0}")]
    Lock(String),

    // Cancellation is a clean early-exit signal, not a failure
    #[error("Generation cancelled")]
    Cancelled,

    // HTTP errors
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // JSON errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, GantryError>;
