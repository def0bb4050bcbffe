//! Stratum error replies and connection-fatal errors.

use serde::Serialize;
use thiserror::Error;

/// Wire-level error object sent back to a miner.
#[derive(Debug, Clone, Serialize)]
pub struct ErrorReply {
    pub code: i32,
    pub message: String,
}

impl ErrorReply {
    fn new(code: i32, message: &str) -> Self {
        Self {
            code,
            message: message.to_string(),
        }
    }

    pub fn invalid_params() -> Self {
        Self::new(-1, "Invalid params")
    }

    pub fn invalid_login() -> Self {
        Self::new(-1, "Invalid login")
    }

    pub fn blacklisted() -> Self {
        Self::new(-1, "You are blacklisted")
    }

    pub fn high_invalid_rate() -> Self {
        Self::new(-1, "High rate of invalid shares")
    }

    pub fn work_not_ready() -> Self {
        Self::new(0, "Work not ready")
    }

    pub fn duplicate_share() -> Self {
        Self::new(22, "Duplicate share")
    }

    pub fn invalid_share() -> Self {
        Self::new(23, "Invalid share")
    }

    pub fn not_subscribed() -> Self {
        Self::new(25, "Not subscribed")
    }

    pub fn method_not_found() -> Self {
        Self::new(-3, "Method not found")
    }
}

/// Errors that terminate a connection's reader task.
#[derive(Error, Debug)]
pub enum SessionError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("codec error: {0}")]
    Codec(#[from] tokio_util::codec::LinesCodecError),

    #[error("malformed request: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("read deadline expired")]
    Timeout,

    #[error("request exceeds maximum size")]
    Flood,

    #[error("{0}")]
    Rejected(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reply_serialization() {
        let reply = ErrorReply::duplicate_share();
        assert_eq!(
            serde_json::to_string(&reply).unwrap(),
            r#"{"code":22,"message":"Duplicate share"}"#
        );
    }

    #[test]
    fn code_assignments() {
        assert_eq!(ErrorReply::invalid_params().code, -1);
        assert_eq!(ErrorReply::work_not_ready().code, 0);
        assert_eq!(ErrorReply::duplicate_share().code, 22);
        assert_eq!(ErrorReply::invalid_share().code, 23);
        assert_eq!(ErrorReply::not_subscribed().code, 25);
        assert_eq!(ErrorReply::method_not_found().code, -3);
    }
}
