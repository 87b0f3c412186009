use thiserror::Error;

/// Authentication failures against a panel's management API.
#[derive(Error, Debug)]
pub enum AuthError {
    #[error("panel rejected credentials: {0}")]
    InvalidCredentials(String),
    /// The login HTTP exchange succeeded but the panel never set its named
    /// session token. HTTP 200 alone is not success.
    #[error("login succeeded but no session token was set")]
    AuthOkButNoToken,
}

#[derive(Error, Debug)]
pub enum PanelError {
    #[error("authentication failed: {0}")]
    Auth(#[from] AuthError),
    /// Timeout or connection failure. Counts toward the server's health
    /// counter; never treated as an auth problem.
    #[error("transient network error: {0}")]
    Transient(String),
    /// Well-formed response with `success=false`; carries the panel's own
    /// message.
    #[error("panel reported failure: {0}")]
    Logic(String),
    #[error("malformed panel response: {0}")]
    Malformed(String),
    #[error("no adapter registered for panel type {0}")]
    UnsupportedPanelType(String),
    #[error("invalid settings template: {0}")]
    InvalidTemplate(String),
    #[error("invalid session configuration: {0}")]
    InvalidConfig(String),
}

impl PanelError {
    /// Classifies a reqwest failure: timeouts and connect errors are
    /// transient, anything else malformed traffic.
    pub fn from_reqwest(err: reqwest::Error) -> Self {
        if err.is_timeout() || err.is_connect() {
            PanelError::Transient(err.to_string())
        } else if err.is_decode() {
            PanelError::Malformed(err.to_string())
        } else {
            PanelError::Transient(err.to_string())
        }
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, PanelError::Transient(_))
    }

    pub fn is_auth(&self) -> bool {
        matches!(self, PanelError::Auth(_))
    }
}
