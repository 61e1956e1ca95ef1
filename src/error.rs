//! The crate-wide error type.
//!
//! Every public operation in this crate returns `Result<_, Error>` (or a
//! `Future`/channel that eventually resolves to one), following the error
//! taxonomy described for the engine: REST failures carry structure so
//! callers can match on them, WebSocket-level decode/validation failures
//! never escape to a caller (they're logged and the frame is dropped), and
//! a handful of variants exist purely to name terminal engine states.

use thiserror::Error as ThisError;

/// Errors produced by the kernel channel engine and its collaborators.
#[derive(Debug, ThisError)]
pub enum Error {
    /// A shell/control/stdin send was attempted on an engine whose status is
    /// already `Dead`.
    #[error("kernel is dead")]
    KernelDead,

    /// Outstanding work was aborted because the engine transitioned to
    /// `Dead` (reconnect exhaustion or an explicit `dead` status message).
    #[error("kernel was terminated")]
    KernelTerminated,

    /// A REST call returned a status code outside the documented success
    /// code for that endpoint.
    #[error("unexpected response status {status}: {body}")]
    InvalidResponse {
        /// The HTTP status code that was returned.
        status: u16,
        /// The response body, if any could be read.
        body: String,
    },

    /// A REST response body failed to deserialize into the expected model.
    #[error("malformed response model: {0}")]
    MalformedModel(String),

    /// A WebSocket frame failed codec validation (non-monotone offsets, an
    /// offset past the end of the frame, or a body that fails to parse as
    /// JSON). Frames of this kind are dropped, never raised to a caller;
    /// this variant exists so the drop can still be logged with a reason.
    #[error("malformed frame: {0}")]
    MalformedFrame(String),

    /// A server-initiated `comm_open` named a target that could not be
    /// resolved locally or via a host module loader.
    #[error("comm target not found: {0}")]
    CommTargetNotFound(String),

    /// The managed socket exhausted its reconnection budget.
    #[error("reconnection attempts exhausted")]
    ReconnectExhausted,

    /// A REST call exceeded its configured timeout.
    #[error("request timed out")]
    Timeout,

    /// The kernel session record deleted its kernel but the session record
    /// itself was not removed (HTTP 410 on `DELETE api/sessions/{id}`).
    #[error("kernel was deleted but session was not")]
    KernelDeletedSessionRemains,

    /// Failed to connect to a kernel's WebSocket.
    #[error("could not connect to the kernel: {0}")]
    KernelConnect(String),

    /// An invalid URL was provided or constructed.
    #[error("invalid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),

    /// HTTP-layer failure from the REST transport.
    #[error("HTTP failure: {0}")]
    Reqwest(#[from] reqwest::Error),

    /// Low-level WebSocket failure from the transport.
    #[error("websocket failure: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
}

impl Error {
    /// Whether this error indicates the engine/session/manager should be
    /// considered permanently unusable (vs. a one-off call failure).
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::KernelDead | Error::KernelTerminated | Error::ReconnectExhausted
        )
    }
}
