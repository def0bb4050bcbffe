//! Stratum TCP front-end: accept loop, per-connection reader, method
//! dispatch and job broadcast.
//!
//! Each accepted socket gets its own reader task; total concurrency is
//! bounded by an admission semaphore of `maxConn` permits. The broadcast
//! fan-out spawns one bounded task per session so a burst of template
//! refreshes cannot saturate the scheduler on large fleets.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use anyhow::{bail, ensure, Context};
use futures::StreamExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{watch, Semaphore};
use tokio::time::Instant;
use tokio_util::codec::{FramedRead, FramedWrite, LinesCodec, LinesCodecError};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use super::error::{ErrorReply, SessionError};
use super::messages::{Job, LoginParams, StatusReply, StratumRequest, SubmitParams, WorkReply};
use super::session::Session;
use super::shares::ShareOutcome;
use crate::config::ProxyConfig;
use crate::policy::Policy;
use crate::pow::PowHasher;
use crate::rpc::NodeRpc;
use crate::storage::Backend;
use crate::template::{BlockTemplate, TemplateCache};
use crate::tracing::prelude::*;
use crate::util;

/// Largest request frame accepted from a miner, in bytes.
pub const MAX_REQ_SIZE: usize = 1024;

/// Concurrency bound on the broadcast fan-out.
const BROADCAST_WIDTH: usize = 1024;

pub struct StratumServer {
    pub(crate) config: ProxyConfig,
    pub(crate) lyra2_block: u64,
    pub(crate) timeout: Duration,
    pub(crate) hasher: Arc<dyn PowHasher>,
    pub(crate) rpc: Arc<dyn NodeRpc>,
    pub(crate) backend: Arc<dyn Backend>,
    pub(crate) policy: Arc<Policy>,
    pub(crate) templates: Arc<TemplateCache>,
    sessions: RwLock<HashMap<u64, Arc<Session>>>,
    next_session_id: AtomicU64,
}

impl StratumServer {
    pub fn new(
        config: ProxyConfig,
        hasher: Arc<dyn PowHasher>,
        rpc: Arc<dyn NodeRpc>,
        backend: Arc<dyn Backend>,
        policy: Arc<Policy>,
        templates: Arc<TemplateCache>,
    ) -> anyhow::Result<Arc<Self>> {
        ensure!(config.difficulty > 0, "stratum difficulty must be positive");
        let timeout = util::parse_duration(&config.stratum.timeout)?;
        let lyra2_block = config.lyra2_block;
        Ok(Arc::new(Self {
            config,
            lyra2_block,
            timeout,
            hasher,
            rpc,
            backend,
            policy,
            templates,
            sessions: RwLock::new(HashMap::new()),
            next_session_id: AtomicU64::new(1),
        }))
    }

    pub fn session_count(&self) -> usize {
        self.sessions.read().unwrap().len()
    }

    /// Bind the configured address and serve until shutdown.
    pub async fn listen(self: Arc<Self>, shutdown: CancellationToken) -> anyhow::Result<()> {
        let listener = TcpListener::bind(&self.config.stratum.listen)
            .await
            .with_context(|| format!("binding {}", self.config.stratum.listen))?;
        info!(listen = %self.config.stratum.listen, "stratum listening");
        self.serve(listener, shutdown).await
    }

    async fn serve(
        self: Arc<Self>,
        listener: TcpListener,
        shutdown: CancellationToken,
    ) -> anyhow::Result<()> {
        let admit = Arc::new(Semaphore::new(self.config.stratum.max_conn));
        loop {
            let (stream, peer) = tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok(pair) => pair,
                    Err(e) => {
                        warn!(error = %e, "accept failed");
                        continue;
                    }
                },
                _ = shutdown.cancelled() => return Ok(()),
            };
            let permit = tokio::select! {
                permit = admit.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => return Ok(()),
                },
                _ = shutdown.cancelled() => return Ok(()),
            };

            let ip = peer.ip();
            if self.policy.is_banned(ip) || !self.policy.apply_limit_policy(ip) {
                continue;
            }
            if let Err(e) = socket2::SockRef::from(&stream).set_keepalive(true) {
                debug!(error = %e, "failed to enable TCP keepalive");
            }

            let id = self.next_session_id.fetch_add(1, Ordering::Relaxed);
            let server = self.clone();
            tokio::spawn(async move {
                let _permit = permit;
                if let Err(e) = server.clone().handle_client(id, ip, stream).await {
                    debug!(%ip, error = %e, "session ended");
                }
                server.remove_session(id);
            });
        }
    }

    async fn handle_client(
        self: Arc<Self>,
        id: u64,
        ip: IpAddr,
        stream: TcpStream,
    ) -> anyhow::Result<()> {
        let (read_half, write_half) = stream.into_split();
        let writer = FramedWrite::new(write_half, LinesCodec::new());
        let mut reader = FramedRead::new(read_half, LinesCodec::new_with_max_length(MAX_REQ_SIZE));
        let session = Arc::new(Session::new(id, ip, writer, self.timeout));

        loop {
            let frame = tokio::time::timeout_at(session.deadline(), reader.next()).await;
            let line = match frame {
                Err(_) => {
                    // A broadcast push may have extended the deadline while
                    // we were parked on the old one.
                    if session.deadline() > Instant::now() {
                        continue;
                    }
                    info!(%ip, "client timed out");
                    break;
                }
                Ok(None) => {
                    info!(%ip, "client disconnected");
                    break;
                }
                Ok(Some(Err(LinesCodecError::MaxLineLengthExceeded))) => {
                    warn!(%ip, "socket flood detected");
                    self.policy.ban_client(ip);
                    return Err(SessionError::Flood.into());
                }
                Ok(Some(Err(e))) => return Err(e.into()),
                Ok(Some(Ok(line))) => line,
            };
            if line.len() <= 1 {
                continue;
            }
            let request: StratumRequest = match serde_json::from_str(&line) {
                Ok(request) => request,
                Err(e) => {
                    warn!(%ip, error = %e, "malformed stratum request");
                    self.policy.apply_malformed_policy(ip);
                    return Err(SessionError::Malformed(e).into());
                }
            };
            session.touch_deadline(self.timeout);
            self.handle_message(&session, &request).await?;
        }
        Ok(())
    }

    async fn handle_message(
        &self,
        session: &Arc<Session>,
        request: &StratumRequest,
    ) -> anyhow::Result<()> {
        match request.method.as_str() {
            "login" => self.handle_login(session, request).await,
            "getjob" => match self.current_work(session) {
                Ok(job) => {
                    session
                        .send_result(request.id.clone(), WorkReply::new(job))
                        .await
                }
                Err(reply) => session.send_error(request.id.clone(), reply).await,
            },
            "submit" => self.handle_submit(session, request).await,
            "keepalived" => session.send_result(request.id.clone(), true).await,
            method => {
                // Answered, but does not cost the miner its connection.
                warn!(ip = %session.ip, method, "unknown stratum method");
                self.policy.apply_malformed_policy(session.ip);
                session
                    .send_error(request.id.clone(), ErrorReply::method_not_found())
                    .await
            }
        }
    }

    async fn handle_login(
        &self,
        session: &Arc<Session>,
        request: &StratumRequest,
    ) -> anyhow::Result<()> {
        let id = request.id.clone();
        let Ok(params) = serde_json::from_value::<LoginParams>(request.params.clone()) else {
            warn!(ip = %session.ip, "malformed login params");
            session.send_error(id, ErrorReply::invalid_params()).await?;
            bail!("malformed login params");
        };
        if params.login.is_empty() {
            session.send_error(id, ErrorReply::invalid_params()).await?;
            bail!("empty login");
        }
        let login = params.login.to_lowercase();
        if !util::is_valid_hex_address(&login) {
            session.send_error(id, ErrorReply::invalid_login()).await?;
            bail!("invalid login");
        }
        if !self.policy.apply_login_policy(&login, session.ip) {
            session.send_error(id, ErrorReply::blacklisted()).await?;
            bail!("blacklisted login");
        }

        *session.login.lock().unwrap() = login.clone();
        session.diff.store(self.config.difficulty, Ordering::Relaxed);
        session
            .next_diff
            .store(self.config.difficulty, Ordering::Relaxed);
        self.register_session(session.clone());
        info!(%login, ip = %session.ip, "stratum miner connected");

        match self.current_work(session) {
            Ok(job) => session.send_result(id, WorkReply::new(job)).await,
            // The session stays registered; the next broadcast delivers work.
            Err(reply) => session.send_error(id, reply).await,
        }
    }

    /// Promote the staged difficulty and build a job from the current
    /// template.
    fn current_work(&self, session: &Session) -> Result<Job, ErrorReply> {
        let template = match self.templates.current() {
            Some(t) if !t.header.is_empty() && !self.templates.is_sick() => t,
            _ => return Err(ErrorReply::work_not_ready()),
        };
        let diff = session.next_diff.load(Ordering::Relaxed);
        session.diff.store(diff, Ordering::Relaxed);
        Ok(session.make_job(&template, diff, self.lyra2_block))
    }

    async fn handle_submit(
        &self,
        session: &Arc<Session>,
        request: &StratumRequest,
    ) -> anyhow::Result<()> {
        let id = request.id.clone();
        if !self.is_registered(session.id) {
            session.send_error(id, ErrorReply::not_subscribed()).await?;
            bail!("not subscribed");
        }
        let Ok(params) = serde_json::from_value::<SubmitParams>(request.params.clone()) else {
            warn!(ip = %session.ip, "malformed submit params");
            self.policy.apply_malformed_policy(session.ip);
            session.send_error(id, ErrorReply::invalid_params()).await?;
            bail!("malformed submit params");
        };
        let worker = if util::is_valid_worker_name(&request.worker) {
            request.worker.clone()
        } else {
            "0".to_string()
        };

        let login = session.login();
        let hash_no_nonce = session.state.lock().unwrap().hash_no_nonce.clone();
        let tuple = [
            format!("0x{}", params.nonce),
            hash_no_nonce,
            format!("0x{}", params.result),
        ];

        let Some(template) = self.templates.current() else {
            session.send_error(id, ErrorReply::work_not_ready()).await?;
            return Ok(());
        };
        let share_diff = session.diff.load(Ordering::Relaxed);
        let outcome = self
            .process_share(&login, &worker, session.ip, &template, &tuple, share_diff)
            .await;

        match outcome {
            ShareOutcome::Stale => session.send_result(id, false).await,
            ShareOutcome::Duplicate => {
                self.policy.apply_share_policy(session.ip, false);
                warn!(%login, ip = %session.ip, nonce = %params.nonce, "duplicate share");
                session
                    .send_error(id, ErrorReply::duplicate_share())
                    .await?;
                bail!("duplicate share");
            }
            ShareOutcome::Invalid => {
                let tolerated = self.policy.apply_share_policy(session.ip, false);
                warn!(%login, ip = %session.ip, "invalid share");
                if !tolerated {
                    session.send_error(id, ErrorReply::invalid_share()).await?;
                    bail!("invalid share limit reached");
                }
                session.send_result(id, false).await
            }
            ShareOutcome::Valid | ShareOutcome::Block => {
                let tolerated = self.policy.apply_share_policy(session.ip, true);
                debug!(%login, ip = %session.ip, "valid share");
                let staged = {
                    let mut state = session.state.lock().unwrap();
                    state.vardiff.observe(
                        &self.config.var_diff,
                        std::time::Instant::now(),
                        share_diff,
                    )
                };
                session.next_diff.store(staged, Ordering::Relaxed);
                if !tolerated {
                    session
                        .send_error(id, ErrorReply::high_invalid_rate())
                        .await?;
                    bail!("high rate of invalid shares");
                }
                session.send_result(id, StatusReply::ok()).await
            }
        }
    }

    fn register_session(&self, session: Arc<Session>) {
        self.sessions.write().unwrap().insert(session.id, session);
    }

    pub(crate) fn remove_session(&self, id: u64) {
        self.sessions.write().unwrap().remove(&id);
    }

    fn is_registered(&self, id: u64) -> bool {
        self.sessions.read().unwrap().contains_key(&id)
    }

    /// Push jobs on every template change until shutdown.
    pub async fn run_broadcaster(
        self: Arc<Self>,
        mut templates_rx: watch::Receiver<Option<Arc<BlockTemplate>>>,
        shutdown: CancellationToken,
    ) {
        loop {
            tokio::select! {
                changed = templates_rx.changed() => {
                    if changed.is_err() {
                        return;
                    }
                }
                _ = shutdown.cancelled() => return,
            }
            self.clone().broadcast_new_jobs().await;
        }
    }

    pub(crate) async fn broadcast_new_jobs(self: Arc<Self>) {
        let Some(template) = self.templates.current() else {
            return;
        };
        if template.header.is_empty() || self.templates.is_sick() {
            return;
        }

        let sessions: Vec<Arc<Session>> =
            self.sessions.read().unwrap().values().cloned().collect();
        info!(miners = sessions.len(), height = template.height, "broadcasting new job");

        let start = Instant::now();
        let gate = Arc::new(Semaphore::new(BROADCAST_WIDTH));
        let tracker = TaskTracker::new();
        for session in sessions {
            let Ok(permit) = gate.clone().acquire_owned().await else {
                break;
            };
            let server = self.clone();
            let template = template.clone();
            tracker.spawn(async move {
                let _permit = permit;
                let diff = session.next_diff.load(Ordering::Relaxed);
                session.diff.store(diff, Ordering::Relaxed);
                let job = session.make_job(&template, diff, server.lyra2_block);
                match session.push_job(&job).await {
                    Ok(()) => session.touch_deadline(server.timeout),
                    Err(e) => {
                        warn!(login = %session.login(), ip = %session.ip, error = %e,
                              "job transmit error");
                        server.remove_session(session.id);
                    }
                }
            });
        }
        tracker.close();
        tracker.wait().await;
        info!(elapsed = ?start.elapsed(), "jobs broadcast finished");
    }
}
