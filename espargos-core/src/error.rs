use thiserror::Error;

/// Error kinds surfaced by board control, clustering and calibration.
///
/// `StreamTimeout` deliberately has no variant here: per the failure model,
/// a stream timeout is logged and transitions the board to disconnected, it
/// is never returned from a fallible call.
#[derive(Debug, Error)]
pub enum Error {
    #[error("timed out connecting to {host}")]
    ConnectTimeout { host: String },

    #[error("unexpected response from {host}: {detail}")]
    UnexpectedResponse { host: String, detail: String },

    #[error("http status {status} from {host}{path}")]
    HttpStatus {
        host: String,
        path: String,
        status: u16,
    },

    #[error("calibration failed: no complete calibration clusters{}", board.as_ref().map(|b| format!(" on board {b}")).unwrap_or_default())]
    CalibrationFailed { board: Option<String> },

    #[error(transparent)]
    Wire(#[from] espargos_wire::WireError),

    #[error("http request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("invalid url: {0}")]
    Url(#[from] url::ParseError),
}

pub type Result<T> = std::result::Result<T, Error>;
