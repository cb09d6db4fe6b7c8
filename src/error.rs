use thiserror::Error;

/// Top-level gateway error. Subsystems expose their own narrower error
/// enums (e.g. `tunnel::TunnelError`) or `anyhow::Error` chains and fold
/// into this one only at boundaries that need a single type: bootstrap
/// and the admin handlers.
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("config error: {0}")]
    Config(String),

    #[error("no channel available")]
    NoChannelAvailable,

    #[error("request body too large")]
    BodyTooLarge,

    #[error("request body read timed out")]
    BodyTimeout,

    #[error("upstream transport error: {0}")]
    UpstreamTransport(String),

    #[error("ssh tunnel error: {0}")]
    Tunnel(String),

    #[error("internal error: {0}")]
    Internal(String),
}

/// The error `type` field of the §7 JSON envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    ProxyError,
    UpstreamError,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::ProxyError => "proxy_error",
            ErrorKind::UpstreamError => "upstream_error",
        }
    }
}

/// Builds the `{"error":{"message":..,"type":..}}` envelope for any
/// synthesized (non-forwarded) error response.
pub fn error_envelope(message: &str, kind: ErrorKind) -> String {
    serde_json::json!({
        "error": {
            "message": message,
            "type": kind.as_str(),
        }
    })
    .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_shape() {
        let body = error_envelope("no channel available", ErrorKind::ProxyError);
        let v: serde_json::Value = serde_json::from_str(&body).unwrap();
        assert_eq!(v["error"]["type"], "proxy_error");
        assert_eq!(v["error"]["message"], "no channel available");
    }
}
