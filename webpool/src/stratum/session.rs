//! Per-connection miner session.
//!
//! The reader task exclusively owns the protocol-side fields; the broadcast
//! fan-out only promotes `diff ← next_diff` and pushes jobs. Every socket
//! write goes through the framed writer behind an async mutex, so frames
//! from the reply path and the broadcast path can never interleave.

use std::net::IpAddr;
use std::sync::atomic::AtomicI64;
use std::sync::Mutex as StdMutex;
use std::time::Duration;

use futures::SinkExt;
use serde::Serialize;
use serde_json::Value;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tokio_util::codec::{FramedWrite, LinesCodec};

use super::error::ErrorReply;
use super::messages::{Job, JobNotification, Response};
use super::vardiff::VarDiff;
use crate::pow::Algorithm;
use crate::template::BlockTemplate;
use crate::util;

/// Fields owned by the reader task, plus `hash_no_nonce` which job handouts
/// on the broadcast path also refresh.
#[derive(Debug, Default)]
pub(crate) struct SessionState {
    /// Header hash of the last job handed to this session.
    pub hash_no_nonce: String,
    pub vardiff: VarDiff,
}

pub struct Session {
    pub(crate) id: u64,
    pub(crate) ip: IpAddr,
    pub(crate) login: StdMutex<String>,
    /// Difficulty shares are currently verified against.
    pub(crate) diff: AtomicI64,
    /// Staged difficulty, promoted at the next job handout.
    pub(crate) next_diff: AtomicI64,
    pub(crate) state: StdMutex<SessionState>,
    deadline: StdMutex<Instant>,
    writer: Mutex<FramedWrite<OwnedWriteHalf, LinesCodec>>,
}

impl Session {
    pub(crate) fn new(
        id: u64,
        ip: IpAddr,
        writer: FramedWrite<OwnedWriteHalf, LinesCodec>,
        timeout: Duration,
    ) -> Self {
        Self {
            id,
            ip,
            login: StdMutex::new(String::new()),
            diff: AtomicI64::new(0),
            next_diff: AtomicI64::new(0),
            state: StdMutex::new(SessionState::default()),
            deadline: StdMutex::new(Instant::now() + timeout),
            writer: Mutex::new(writer),
        }
    }

    pub(crate) fn login(&self) -> String {
        self.login.lock().unwrap().clone()
    }

    pub(crate) fn deadline(&self) -> Instant {
        *self.deadline.lock().unwrap()
    }

    /// Push the read deadline out by `timeout` from now.
    pub(crate) fn touch_deadline(&self, timeout: Duration) {
        *self.deadline.lock().unwrap() = Instant::now() + timeout;
    }

    /// Build the job for `template` at `diff`, staging the template's header
    /// as this session's `hash_no_nonce`.
    pub(crate) fn make_job(&self, template: &BlockTemplate, diff: i64, lyra2_block: u64) -> Job {
        let mut state = self.state.lock().unwrap();
        state.hash_no_nonce = template.header.clone();
        Job {
            blob: template.seed.clone(),
            job_id: template.header.get(2..34).unwrap_or_default().to_string(),
            target: util::job_target_hex(diff),
            algo: Algorithm::for_height(template.height, lyra2_block)
                .tag()
                .to_string(),
        }
    }

    pub(crate) async fn send_result<T: Serialize>(
        &self,
        id: Value,
        result: T,
    ) -> anyhow::Result<()> {
        self.send_frame(&Response::ok(id, result)).await
    }

    pub(crate) async fn send_error(&self, id: Value, error: ErrorReply) -> anyhow::Result<()> {
        self.send_frame(&Response::err(id, error)).await
    }

    pub(crate) async fn push_job(&self, job: &Job) -> anyhow::Result<()> {
        self.send_frame(&JobNotification::new(job)).await
    }

    async fn send_frame<T: Serialize>(&self, frame: &T) -> anyhow::Result<()> {
        let line = serde_json::to_string(frame)?;
        let mut writer = self.writer.lock().await;
        writer.send(line).await?;
        Ok(())
    }
}
