use thiserror::Error;

/// Configuration or structural validation failure. Fatal at startup; never
/// produced during steady-state operation.
#[derive(Debug, Error)]
pub enum ParseError {
    #[error("missing required field: {0}")]
    MissingField(&'static str),

    #[error("invalid value for {field}: {reason}")]
    InvalidValue { field: &'static str, reason: String },
}

impl ParseError {
    pub fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        ParseError::InvalidValue {
            field,
            reason: reason.into(),
        }
    }
}

/// Signature or claim verification failure. Deliberately carries no detail
/// about which check failed so the error cannot be used as an oracle.
#[derive(Debug, Error)]
#[error("authentication failed")]
pub struct AuthError;

/// Wire-format integrity failure. Malformed or hostile input; the packet is
/// dropped and counted, never routed.
#[derive(Debug, Error)]
pub enum PayloadError {
    #[error("unsupported packet version {0}")]
    Version(u8),

    #[error("packet truncated")]
    Truncated,

    #[error("declared length does not match payload")]
    Length,

    #[error("integrity digest mismatch")]
    Integrity,

    #[error("malformed field: {0}")]
    Malformed(&'static str),
}

/// Control-flow signals for the registration path. Mapped to HTTP statuses by
/// the daemon; not logged as errors.
#[derive(Debug, Error)]
pub enum RegistrationError {
    /// The claimed local node id equals our own id. Usually a misconfigured
    /// discovery loop sending our own advertisement back through a load
    /// balancer. Mapped to 421.
    #[error("registration from self")]
    FromSelf,

    /// The registration is structurally valid but unacceptable: id spoofing,
    /// address change for an existing node, and similar. Mapped to 400.
    #[error("registration failed: {0}")]
    Failed(String),
}

/// Failure of an HTTP call to a peer. The status variant carries the response
/// code so callers can branch retry behavior (404 triggers re-bootstrap).
#[derive(Debug, Error)]
pub enum RequestError {
    #[error("request failed with status {status}")]
    Status { status: u16 },

    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error(transparent)]
    Auth(#[from] AuthError),

    #[error("payload error: {0}")]
    Payload(#[from] PayloadError),

    #[error("malformed response: {0}")]
    Response(String),
}

impl RequestError {
    /// The HTTP status code, if the peer answered at all.
    pub fn status(&self) -> Option<u16> {
        match self {
            RequestError::Status { status } => Some(*status),
            RequestError::Transport(e) => e.status().map(|s| s.as_u16()),
            _ => None,
        }
    }

    pub fn is_client_error(&self) -> bool {
        matches!(self.status(), Some(s) if (400..500).contains(&s))
    }
}
