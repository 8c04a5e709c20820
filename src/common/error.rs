//! Error types for the client control plane

use std::io;
use thiserror::Error;

/// Control plane error type
#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Process error: {0}")]
    Process(String),

    #[error("Core error: {0}")]
    Core(String),

    #[error("Tunnel error: {0}")]
    Tunnel(String),

    #[error("Timeout error: {0}")]
    Timeout(String),
}

impl Error {
    pub fn config<S: Into<String>>(msg: S) -> Self {
        Error::Config(msg.into())
    }

    pub fn process<S: Into<String>>(msg: S) -> Self {
        Error::Process(msg.into())
    }

    pub fn core<S: Into<String>>(msg: S) -> Self {
        Error::Core(msg.into())
    }

    pub fn tunnel<S: Into<String>>(msg: S) -> Self {
        Error::Tunnel(msg.into())
    }
}

impl From<serde_yaml::Error> for Error {
    fn from(e: serde_yaml::Error) -> Self {
        Error::Config(e.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Parse(e.to_string())
    }
}

impl From<tokio::time::error::Elapsed> for Error {
    fn from(e: tokio::time::error::Elapsed) -> Self {
        Error::Timeout(e.to_string())
    }
}

/// Result type alias using our Error
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_creation() {
        let e = Error::config("missing relay host");
        assert!(matches!(e, Error::Config(_)));
    }

    #[test]
    fn test_error_display() {
        let e = Error::core("relay refused handshake");
        assert_eq!(e.to_string(), "Core error: relay refused handshake");
    }

    #[test]
    fn test_yaml_error_is_config() {
        let yaml_err = serde_yaml::from_str::<u16>("not-a-port").unwrap_err();
        assert!(matches!(Error::from(yaml_err), Error::Config(_)));
    }
}
