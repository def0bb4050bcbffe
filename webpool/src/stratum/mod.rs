//! Stratum front-end and share pipeline.
//!
//! Miners hold a long-lived TCP session speaking a line-delimited JSON-RPC
//! dialect: `login`, `getjob`, `submit` and `keepalived` requests in; job
//! notifications out. Submissions flow through the share processor, which
//! verifies PoW against the per-session and network difficulties, records
//! credit, and submits block-difficulty solutions upstream.

pub mod error;
pub mod messages;
pub mod server;
pub mod session;
pub mod shares;
pub mod vardiff;

pub use error::ErrorReply;
pub use server::StratumServer;
pub use shares::ShareOutcome;
