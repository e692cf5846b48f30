use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Invalid value for {key}: {value:?} ({reason})")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },

    #[error("Multi-account configuration mismatch: {usernames} usernames, {passwords} passwords")]
    AccountMismatch { usernames: usize, passwords: usize },

    #[error("Unknown time division strategy: {0}")]
    UnknownStrategy(String),
}
