use thiserror::Error;

pub type AgentResult<T> = Result<T, AgentError>;

#[derive(Debug, Error)]
pub enum AgentError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("registration failed: {0}")]
    Registration(String),

    #[error("collector error: {0}")]
    Collector(String),

    #[error("writer error: {0}")]
    Writer(String),

    #[error("policy error: {0}")]
    Policy(String),

    #[error("command error: {0}")]
    Command(String),

    #[error("unexpected API response: {0}")]
    Api(String),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),
}
