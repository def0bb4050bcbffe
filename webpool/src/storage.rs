//! Storage collaborator: share and block persistence behind [`Backend`].
//!
//! The pool core never talks to a database directly; everything goes through
//! this trait. [`MemoryBackend`] is the in-process implementation used for
//! development, single-node deployments and tests. A persistent store slots
//! in behind the same trait.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use num_bigint::BigInt;
use num_traits::Zero;

/// Heights a submission tuple stays on record for duplicate detection.
const POW_WINDOW: u64 = 8;

/// A block found by the pool, from candidate through maturity.
#[derive(Debug, Clone)]
pub struct BlockData {
    /// Height the session believed it was mining; the round's share key.
    pub round_height: u64,
    /// Corrected once the block is matched on-chain.
    pub height: u64,
    /// Set only when the candidate matured as an uncle.
    pub uncle_height: Option<u64>,
    pub nonce: String,
    pub pow_hash: String,
    pub mix_digest: String,
    pub timestamp: u64,
    /// Network difficulty the header was issued under.
    pub diff: i64,
    /// Sum of round share weights credited to this block.
    pub total_shares: u64,
    /// Authoritative block hash once matched on-chain.
    pub hash: String,
    /// Reward in wei.
    pub reward: BigInt,
    /// Transaction fees, present only in keep-tx-fees mode.
    pub extra_reward: Option<BigInt>,
    pub orphan: bool,
}

impl BlockData {
    pub fn round_key(&self) -> String {
        format!("{}:{}", self.round_height, self.nonce)
    }
}

/// Persistence operations the core depends on. Write methods returning
/// `bool` report whether the identical submission already existed.
#[async_trait]
pub trait Backend: Send + Sync {
    async fn write_share(
        &self,
        login: &str,
        worker: &str,
        params: &[String; 3],
        diff: i64,
        height: u64,
    ) -> anyhow::Result<bool>;

    async fn write_block(
        &self,
        login: &str,
        worker: &str,
        params: &[String; 3],
        share_diff: i64,
        block_diff: i64,
        round_height: u64,
    ) -> anyhow::Result<bool>;

    async fn get_candidates(&self, max_height: u64) -> anyhow::Result<Vec<BlockData>>;

    async fn get_immature_blocks(&self, max_height: u64) -> anyhow::Result<Vec<BlockData>>;

    async fn get_round_shares(
        &self,
        round_height: u64,
        nonce: &str,
    ) -> anyhow::Result<HashMap<String, u64>>;

    async fn write_pending_orphans(&self, blocks: &[BlockData]) -> anyhow::Result<()>;

    async fn write_immature_block(
        &self,
        block: &BlockData,
        rewards: &HashMap<String, u64>,
    ) -> anyhow::Result<()>;

    async fn write_matured_block(
        &self,
        block: &BlockData,
        rewards: &HashMap<String, u64>,
    ) -> anyhow::Result<()>;

    async fn write_orphan(&self, block: &BlockData) -> anyhow::Result<()>;
}

#[derive(Default)]
struct Inner {
    /// login → share weight accumulated since the last block find.
    round_shares: HashMap<String, u64>,
    /// height → submission tuples, for duplicate rejection.
    pow_seen: HashMap<u64, HashSet<String>>,
    /// round key → share snapshot taken when the block was found.
    rounds: HashMap<String, HashMap<String, u64>>,
    candidates: Vec<BlockData>,
    immature: Vec<BlockData>,
    matured: Vec<BlockData>,
    pending_orphans: Vec<BlockData>,
    orphans: Vec<BlockData>,
    /// round key → rewards credited while immature, reverted on orphan.
    immature_credits: HashMap<String, HashMap<String, u64>>,
    /// login → finalized balance in Shannon.
    balances: HashMap<String, u64>,
}

/// In-process [`Backend`].
pub struct MemoryBackend {
    inner: Mutex<Inner>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
        }
    }

    /// Finalized balance for a login, in Shannon.
    pub fn balance(&self, login: &str) -> u64 {
        self.inner
            .lock()
            .unwrap()
            .balances
            .get(login)
            .copied()
            .unwrap_or(0)
    }

    /// Share weights of the round in progress.
    pub fn current_round_shares(&self) -> HashMap<String, u64> {
        self.inner.lock().unwrap().round_shares.clone()
    }

    pub fn matured_blocks(&self) -> Vec<BlockData> {
        self.inner.lock().unwrap().matured.clone()
    }

    pub fn orphaned_blocks(&self) -> Vec<BlockData> {
        self.inner.lock().unwrap().orphans.clone()
    }

    pub fn pending_orphaned_blocks(&self) -> Vec<BlockData> {
        self.inner.lock().unwrap().pending_orphans.clone()
    }

    pub fn immature_credits(&self, round_key: &str) -> Option<HashMap<String, u64>> {
        self.inner
            .lock()
            .unwrap()
            .immature_credits
            .get(round_key)
            .cloned()
    }
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Record the tuple for `height`; true when it was already present.
fn pow_exists(inner: &mut Inner, height: u64, params: &[String; 3]) -> bool {
    inner
        .pow_seen
        .retain(|h, _| *h + POW_WINDOW >= height);
    let tuple = params.join(":");
    !inner.pow_seen.entry(height).or_default().insert(tuple)
}

fn remove_block(list: &mut Vec<BlockData>, round_key: &str) -> Option<BlockData> {
    let pos = list.iter().position(|b| b.round_key() == round_key)?;
    Some(list.remove(pos))
}

#[async_trait]
impl Backend for MemoryBackend {
    async fn write_share(
        &self,
        login: &str,
        _worker: &str,
        params: &[String; 3],
        diff: i64,
        height: u64,
    ) -> anyhow::Result<bool> {
        let mut inner = self.inner.lock().unwrap();
        if pow_exists(&mut inner, height, params) {
            return Ok(true);
        }
        *inner.round_shares.entry(login.to_string()).or_default() += diff.max(0) as u64;
        Ok(false)
    }

    async fn write_block(
        &self,
        login: &str,
        _worker: &str,
        params: &[String; 3],
        share_diff: i64,
        block_diff: i64,
        round_height: u64,
    ) -> anyhow::Result<bool> {
        let mut inner = self.inner.lock().unwrap();
        if pow_exists(&mut inner, round_height, params) {
            return Ok(true);
        }
        *inner.round_shares.entry(login.to_string()).or_default() += share_diff.max(0) as u64;

        let shares = std::mem::take(&mut inner.round_shares);
        let total_shares = shares.values().sum();
        let block = BlockData {
            round_height,
            height: round_height,
            uncle_height: None,
            nonce: params[0].clone(),
            pow_hash: params[1].clone(),
            mix_digest: params[2].clone(),
            timestamp: unix_now(),
            diff: block_diff,
            total_shares,
            hash: String::new(),
            reward: BigInt::zero(),
            extra_reward: None,
            orphan: false,
        };
        inner.rounds.insert(block.round_key(), shares);
        inner.candidates.push(block);
        Ok(false)
    }

    async fn get_candidates(&self, max_height: u64) -> anyhow::Result<Vec<BlockData>> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .candidates
            .iter()
            .filter(|b| b.round_height <= max_height)
            .cloned()
            .collect())
    }

    async fn get_immature_blocks(&self, max_height: u64) -> anyhow::Result<Vec<BlockData>> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .immature
            .iter()
            .filter(|b| b.height <= max_height)
            .cloned()
            .collect())
    }

    async fn get_round_shares(
        &self,
        round_height: u64,
        nonce: &str,
    ) -> anyhow::Result<HashMap<String, u64>> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .rounds
            .get(&format!("{round_height}:{nonce}"))
            .cloned()
            .unwrap_or_default())
    }

    async fn write_pending_orphans(&self, blocks: &[BlockData]) -> anyhow::Result<()> {
        let mut inner = self.inner.lock().unwrap();
        for block in blocks {
            remove_block(&mut inner.candidates, &block.round_key());
            inner.pending_orphans.push(block.clone());
        }
        Ok(())
    }

    async fn write_immature_block(
        &self,
        block: &BlockData,
        rewards: &HashMap<String, u64>,
    ) -> anyhow::Result<()> {
        let mut inner = self.inner.lock().unwrap();
        remove_block(&mut inner.candidates, &block.round_key());
        inner
            .immature_credits
            .insert(block.round_key(), rewards.clone());
        inner.immature.push(block.clone());
        Ok(())
    }

    async fn write_matured_block(
        &self,
        block: &BlockData,
        rewards: &HashMap<String, u64>,
    ) -> anyhow::Result<()> {
        let mut inner = self.inner.lock().unwrap();
        remove_block(&mut inner.immature, &block.round_key());
        remove_block(&mut inner.candidates, &block.round_key());
        inner.immature_credits.remove(&block.round_key());
        for (login, reward) in rewards {
            *inner.balances.entry(login.clone()).or_default() += reward;
        }
        inner.matured.push(block.clone());
        Ok(())
    }

    async fn write_orphan(&self, block: &BlockData) -> anyhow::Result<()> {
        let mut inner = self.inner.lock().unwrap();
        remove_block(&mut inner.immature, &block.round_key());
        inner.immature_credits.remove(&block.round_key());
        // Return the round's shares to the open round so the work is not
        // lost with the block.
        if let Some(shares) = inner.rounds.remove(&block.round_key()) {
            for (login, n) in shares {
                *inner.round_shares.entry(login).or_default() += n;
            }
        }
        inner.orphans.push(block.clone());
        Ok(())
    }
}
