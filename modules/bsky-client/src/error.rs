use thiserror::Error;

pub type Result<T> = std::result::Result<T, BskyError>;

/// XRPC error names that mean the session is unusable.
const AUTH_ERROR_NAMES: &[&str] = &[
    "AuthenticationRequired",
    "ExpiredToken",
    "InvalidToken",
    "AuthFactorTokenRequired",
    "AccountTakedown",
];

#[derive(Debug, Error)]
pub enum BskyError {
    #[error("Authentication failed: {0}")]
    Auth(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("API error (status {status}): {message}")]
    Api { status: u16, message: String },

    #[error("Parse error: {0}")]
    Parse(String),
}

impl BskyError {
    /// True when the failure comes from the identity rather than the request.
    /// Callers treat these as fatal for the owning job.
    pub fn is_auth(&self) -> bool {
        matches!(self, BskyError::Auth(_))
    }

    /// Classify a non-success XRPC response.
    pub(crate) fn from_response(status: u16, body: &str) -> Self {
        let parsed: Option<XrpcErrorBody> = serde_json::from_str(body).ok();
        let name = parsed.as_ref().and_then(|b| b.error.as_deref());
        let message = parsed
            .as_ref()
            .and_then(|b| b.message.clone())
            .unwrap_or_else(|| body.to_string());

        if status == 401 || name.is_some_and(|n| AUTH_ERROR_NAMES.contains(&n)) {
            return BskyError::Auth(match name {
                Some(n) => format!("{n}: {message}"),
                None => message,
            });
        }

        BskyError::Api { status, message }
    }
}

#[derive(serde::Deserialize)]
struct XrpcErrorBody {
    error: Option<String>,
    message: Option<String>,
}

impl From<reqwest::Error> for BskyError {
    fn from(err: reqwest::Error) -> Self {
        BskyError::Network(err.to_string())
    }
}

impl From<serde_json::Error> for BskyError {
    fn from(err: serde_json::Error) -> Self {
        BskyError::Parse(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unauthorized_status_is_auth() {
        let err = BskyError::from_response(401, "");
        assert!(err.is_auth());
    }

    #[test]
    fn expired_token_body_is_auth_even_on_400() {
        let err = BskyError::from_response(
            400,
            r#"{"error":"ExpiredToken","message":"Token has expired"}"#,
        );
        assert!(err.is_auth());
        assert_eq!(
            err.to_string(),
            "Authentication failed: ExpiredToken: Token has expired"
        );
    }

    #[test]
    fn rate_limit_is_plain_api_error() {
        let err = BskyError::from_response(
            429,
            r#"{"error":"RateLimitExceeded","message":"Rate Limit Exceeded"}"#,
        );
        assert!(!err.is_auth());
        match err {
            BskyError::Api { status, message } => {
                assert_eq!(status, 429);
                assert_eq!(message, "Rate Limit Exceeded");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn non_json_body_is_kept_verbatim() {
        let err = BskyError::from_response(502, "bad gateway");
        assert_eq!(err.to_string(), "API error (status 502): bad gateway");
    }
}
