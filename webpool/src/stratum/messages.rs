//! Wire types for the line-delimited stratum dialect.
//!
//! One JSON object per line, at most 1024 bytes. Requests carry `id`,
//! `method`, `worker` and `params`; responses echo the id with either a
//! result or an error object; job pushes are unsolicited notifications.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::error::ErrorReply;

/// One request frame from a miner. The id is echoed back verbatim.
#[derive(Debug, Deserialize)]
pub struct StratumRequest {
    #[serde(default)]
    pub id: Value,
    pub method: String,
    #[serde(default)]
    pub worker: String,
    #[serde(default)]
    pub params: Value,
}

#[derive(Debug, Default, Deserialize)]
pub struct LoginParams {
    #[serde(default)]
    pub login: String,
    #[serde(default)]
    pub pass: String,
}

#[derive(Debug, Default, Deserialize)]
pub struct SubmitParams {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub job_id: String,
    /// 16 hex chars, no 0x prefix.
    #[serde(default)]
    pub nonce: String,
    /// 64 hex chars, no 0x prefix.
    #[serde(default)]
    pub result: String,
}

/// Job handed to a miner.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Job {
    /// Hex blob the miner hashes.
    pub blob: String,
    /// First 32 hex chars of the header hash.
    pub job_id: String,
    /// 16 hex chars: low 8 bytes of the target, little-endian.
    pub target: String,
    pub algo: String,
}

/// Result payload for `login` and `getjob`.
#[derive(Debug, Serialize)]
pub struct WorkReply {
    pub id: String,
    pub job: Job,
    pub status: String,
}

impl WorkReply {
    pub fn new(job: Job) -> Self {
        Self {
            id: "0".to_string(),
            job,
            status: "OK".to_string(),
        }
    }
}

/// Result payload for an accepted `submit`.
#[derive(Debug, Serialize)]
pub struct StatusReply {
    pub status: &'static str,
}

impl StatusReply {
    pub fn ok() -> Self {
        Self { status: "OK" }
    }
}

/// Response envelope. Successful replies carry `error: null`; error replies
/// omit `result` entirely.
#[derive(Debug, Serialize)]
pub struct Response<T> {
    pub id: Value,
    pub jsonrpc: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<T>,
    pub error: Option<ErrorReply>,
}

impl<T: Serialize> Response<T> {
    pub fn ok(id: Value, result: T) -> Self {
        Self {
            id,
            jsonrpc: "2.0",
            result: Some(result),
            error: None,
        }
    }
}

impl Response<()> {
    pub fn err(id: Value, error: ErrorReply) -> Self {
        Self {
            id,
            jsonrpc: "2.0",
            result: None,
            error: Some(error),
        }
    }
}

/// Unsolicited job push.
#[derive(Debug, Serialize)]
pub struct JobNotification<'a> {
    pub jsonrpc: &'static str,
    pub method: &'static str,
    pub params: &'a Job,
}

impl<'a> JobNotification<'a> {
    pub fn new(job: &'a Job) -> Self {
        Self {
            jsonrpc: "2.0",
            method: "job",
            params: job,
        }
    }
}
