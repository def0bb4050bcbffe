//! Work template cache and refresh loop.
//!
//! The active template is published through a `watch` channel, which gives
//! readers an atomic snapshot swap and gives the broadcast loop its change
//! notification. Retired templates stay alive under `Arc` for as long as any
//! in-flight share still references them, and their job headers are carried
//! forward for a bounded backlog so a submission that crosses a template
//! change still verifies against the header it was issued for.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context};
use num_traits::ToPrimitive;
use tokio::sync::{watch, Notify};
use tokio_util::sync::CancellationToken;

use crate::rpc::NodeRpc;
use crate::tracing::prelude::*;
use crate::util;

/// Heights for which retired job headers remain resolvable.
const HEADER_BACKLOG: u64 = 3;

/// Difficulty and height a header was issued under.
#[derive(Debug, Clone)]
pub struct JobHeader {
    pub diff: i64,
    pub height: u64,
}

/// Cached fields of the node's pending block, served to API-layer consumers
/// without another upstream round trip.
#[derive(Debug, Clone)]
pub struct PendingBlockReply {
    pub number: String,
    pub difficulty: String,
}

/// Immutable snapshot of the work currently handed to miners.
#[derive(Debug)]
pub struct BlockTemplate {
    /// Header hash identifying the job (`hashNoNonce`).
    pub header: String,
    /// Hashing blob the miners grind on.
    pub seed: String,
    pub height: u64,
    /// Network difficulty of the header.
    pub diff: i64,
    /// Live headers: the current one plus recent predecessors.
    pub headers: HashMap<String, JobHeader>,
    pub pending: PendingBlockReply,
}

/// Publishes templates and tracks upstream health.
pub struct TemplateCache {
    tx: watch::Sender<Option<Arc<BlockTemplate>>>,
    sick: AtomicBool,
    refresh: Notify,
}

impl TemplateCache {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(None);
        Self {
            tx,
            sick: AtomicBool::new(false),
            refresh: Notify::new(),
        }
    }

    /// Snapshot of the active template, if any has been published.
    pub fn current(&self) -> Option<Arc<BlockTemplate>> {
        self.tx.borrow().clone()
    }

    /// Receiver for template-change notifications (the broadcast loop).
    pub fn subscribe(&self) -> watch::Receiver<Option<Arc<BlockTemplate>>> {
        self.tx.subscribe()
    }

    /// True when the last refresh failed or no template exists yet.
    pub fn is_sick(&self) -> bool {
        self.sick.load(Ordering::Relaxed) || self.current().is_none()
    }

    pub fn mark_sick(&self) {
        self.sick.store(true, Ordering::Relaxed);
    }

    fn mark_healthy(&self) {
        self.sick.store(false, Ordering::Relaxed);
    }

    /// Ask the refresh loop for an immediate fetch (used right after a block
    /// submission).
    pub fn request_refresh(&self) {
        self.refresh.notify_one();
    }

    pub fn publish(&self, template: BlockTemplate) {
        self.tx.send_replace(Some(Arc::new(template)));
    }
}

impl Default for TemplateCache {
    fn default() -> Self {
        Self::new()
    }
}

/// Refresh loop: poll the node on an interval, or sooner when a refresh is
/// requested.
pub async fn poll_templates(
    cache: Arc<TemplateCache>,
    rpc: Arc<dyn NodeRpc>,
    interval: Duration,
    shutdown: CancellationToken,
) {
    loop {
        if let Err(e) = refresh_template(&cache, rpc.as_ref()).await {
            cache.mark_sick();
            warn!(error = %e, "failed to refresh block template");
        }
        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            _ = cache.refresh.notified() => {}
            _ = shutdown.cancelled() => return,
        }
    }
}

async fn refresh_template(cache: &TemplateCache, rpc: &dyn NodeRpc) -> anyhow::Result<()> {
    let work = rpc.get_work().await.context("get work")?;
    let pending = rpc.get_pending_block().await.context("get pending block")?;
    let height = util::parse_hex_u64(&pending.number)
        .ok_or_else(|| anyhow!("can't parse pending block number {:?}", pending.number))?;
    let diff = util::parse_prefixed_uint(&pending.difficulty)
        .and_then(|d| d.to_i64())
        .ok_or_else(|| anyhow!("can't parse pending difficulty {:?}", pending.difficulty))?;

    let previous = cache.current();
    if let Some(prev) = &previous {
        if prev.header == work[0] {
            cache.mark_healthy();
            return Ok(());
        }
    }

    let [header, seed, _boundary] = work;
    let mut headers = HashMap::new();
    if let Some(prev) = &previous {
        for (hash, job) in &prev.headers {
            if job.height + HEADER_BACKLOG >= height {
                headers.insert(hash.clone(), job.clone());
            }
        }
    }
    headers.insert(header.clone(), JobHeader { diff, height });

    info!(height, diff, "loaded block template");
    cache.publish(BlockTemplate {
        header,
        seed,
        height,
        diff,
        headers,
        pending: PendingBlockReply {
            number: pending.number,
            difficulty: pending.difficulty,
        },
    });
    cache.mark_healthy();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rpc::{RpcBlock, TxReceipt};
    use async_trait::async_trait;
    use std::sync::Mutex;

    /// Node stub yielding a scripted sequence of (header, height, diff).
    struct ScriptedNode {
        steps: Mutex<Vec<(String, u64, i64)>>,
    }

    impl ScriptedNode {
        fn new(steps: Vec<(&str, u64, i64)>) -> Self {
            let mut steps: Vec<_> = steps
                .into_iter()
                .map(|(h, height, d)| (h.to_string(), height, d))
                .collect();
            steps.reverse();
            Self {
                steps: Mutex::new(steps),
            }
        }

        fn peek(&self) -> (String, u64, i64) {
            self.steps.lock().unwrap().last().cloned().expect("script exhausted")
        }

        fn advance(&self) {
            let mut steps = self.steps.lock().unwrap();
            if steps.len() > 1 {
                steps.pop();
            }
        }
    }

    #[async_trait]
    impl NodeRpc for ScriptedNode {
        async fn get_work(&self) -> anyhow::Result<[String; 3]> {
            let (header, _, _) = self.peek();
            Ok([header, "0xseed".to_string(), "0x00".to_string()])
        }

        async fn get_pending_block(&self) -> anyhow::Result<RpcBlock> {
            let (_, height, diff) = self.peek();
            Ok(RpcBlock {
                number: format!("0x{height:x}"),
                difficulty: format!("0x{diff:x}"),
                ..RpcBlock::default()
            })
        }

        async fn get_block_by_height(&self, _height: u64) -> anyhow::Result<Option<RpcBlock>> {
            unreachable!("not used by the template cache")
        }

        async fn get_uncle_by_block_number_and_index(
            &self,
            _height: u64,
            _index: usize,
        ) -> anyhow::Result<Option<RpcBlock>> {
            unreachable!("not used by the template cache")
        }

        async fn get_tx_receipt(&self, _hash: &str) -> anyhow::Result<Option<TxReceipt>> {
            unreachable!("not used by the template cache")
        }

        async fn submit_block(&self, _params: &[String]) -> anyhow::Result<bool> {
            unreachable!("not used by the template cache")
        }
    }

    #[tokio::test]
    async fn publishes_and_swaps_templates() {
        let cache = TemplateCache::new();
        let node = ScriptedNode::new(vec![("0xaaaa", 100, 5000), ("0xbbbb", 101, 6000)]);

        assert!(cache.is_sick());
        refresh_template(&cache, &node).await.unwrap();
        let first = cache.current().unwrap();
        assert_eq!(first.header, "0xaaaa");
        assert_eq!(first.height, 100);
        assert!(!cache.is_sick());

        node.advance();
        refresh_template(&cache, &node).await.unwrap();
        let second = cache.current().unwrap();
        assert_eq!(second.header, "0xbbbb");
        // The retired header is still resolvable against the new template.
        assert!(second.headers.contains_key("0xaaaa"));
        assert_eq!(second.headers["0xaaaa"].height, 100);
        assert_eq!(second.headers["0xbbbb"].diff, 6000);
    }

    #[tokio::test]
    async fn unchanged_header_is_not_republished() {
        let cache = TemplateCache::new();
        let node = ScriptedNode::new(vec![("0xaaaa", 100, 5000)]);
        let mut rx = cache.subscribe();

        refresh_template(&cache, &node).await.unwrap();
        assert!(rx.has_changed().unwrap());
        let _ = rx.borrow_and_update();

        refresh_template(&cache, &node).await.unwrap();
        assert!(!rx.has_changed().unwrap());
    }

    #[tokio::test]
    async fn headers_age_out_of_the_backlog() {
        let cache = TemplateCache::new();
        let node = ScriptedNode::new(vec![("0xaaaa", 100, 5000), ("0xbbbb", 110, 5000)]);

        refresh_template(&cache, &node).await.unwrap();
        node.advance();
        refresh_template(&cache, &node).await.unwrap();

        let current = cache.current().unwrap();
        assert!(!current.headers.contains_key("0xaaaa"));
        assert!(current.headers.contains_key("0xbbbb"));
    }

    #[tokio::test]
    async fn refresh_failure_marks_sick() {
        struct FailingNode;

        #[async_trait]
        impl NodeRpc for FailingNode {
            async fn get_work(&self) -> anyhow::Result<[String; 3]> {
                anyhow::bail!("node down")
            }
            async fn get_pending_block(&self) -> anyhow::Result<RpcBlock> {
                anyhow::bail!("node down")
            }
            async fn get_block_by_height(&self, _: u64) -> anyhow::Result<Option<RpcBlock>> {
                anyhow::bail!("node down")
            }
            async fn get_uncle_by_block_number_and_index(
                &self,
                _: u64,
                _: usize,
            ) -> anyhow::Result<Option<RpcBlock>> {
                anyhow::bail!("node down")
            }
            async fn get_tx_receipt(&self, _: &str) -> anyhow::Result<Option<TxReceipt>> {
                anyhow::bail!("node down")
            }
            async fn submit_block(&self, _: &[String]) -> anyhow::Result<bool> {
                anyhow::bail!("node down")
            }
        }

        let cache = TemplateCache::new();
        let good = ScriptedNode::new(vec![("0xaaaa", 100, 5000)]);
        refresh_template(&cache, &good).await.unwrap();
        assert!(!cache.is_sick());

        assert!(refresh_template(&cache, &FailingNode).await.is_err());
        cache.mark_sick();
        assert!(cache.is_sick());
        // The stale template itself remains readable.
        assert_eq!(cache.current().unwrap().header, "0xaaaa");
    }
}
