use std::path::PathBuf;

#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    #[error("websocket error: {0}")]
    Ws(#[from] tokio_tungstenite::tungstenite::Error),
    #[error("invalid url: {0}")]
    Url(#[from] url::ParseError),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("timed out waiting for auth_success")]
    AuthTimeout,
    #[error("event must be an object with a non-empty string `type`")]
    InvalidEvent,
    #[error("cannot read discovery file at {0}")]
    Discovery(PathBuf),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
