use bsky_client::BskyError;
use skyharvest_common::ConfigError;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, CollectError>;

#[derive(Error, Debug)]
pub enum CollectError {
    /// The identity was rejected. Fatal to the owning job only.
    #[error("Authentication failed: {0}")]
    Authentication(String),

    #[error("Checkpoint error: {0}")]
    Checkpoint(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl CollectError {
    pub fn is_auth(&self) -> bool {
        matches!(self, CollectError::Authentication(_))
    }
}

impl From<BskyError> for CollectError {
    fn from(err: BskyError) -> Self {
        match err {
            BskyError::Auth(message) => CollectError::Authentication(message),
            other => CollectError::Other(other.into()),
        }
    }
}

impl From<tokio::task::JoinError> for CollectError {
    fn from(err: tokio::task::JoinError) -> Self {
        CollectError::Other(anyhow::anyhow!("background task failed: {err}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn platform_auth_maps_to_authentication() {
        let err: CollectError = BskyError::Auth("ExpiredToken: gone".into()).into();
        assert!(err.is_auth());

        let err: CollectError = BskyError::Api {
            status: 500,
            message: "boom".into(),
        }
        .into();
        assert!(!err.is_auth());
        assert!(err.to_string().contains("boom"));
    }
}
