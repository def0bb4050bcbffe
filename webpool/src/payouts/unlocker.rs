//! Block unlocker and payout distributor.
//!
//! The node does not give a consistent view of height while a block is being
//! found, so the stored round height is only a reference point. Each
//! candidate is matched against the canonical chain by scanning forward from
//! its claimed height, looking for the block itself or for an uncle
//! reference to it. Any upstream or storage failure makes the unlocker
//! halt: silent partial progress against a desynchronized node would
//! mis-attribute rewards, so a halted unlocker stays halted until an
//! operator resets it.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Context};
use num_bigint::BigInt;
use num_rational::BigRational;
use num_traits::{ToPrimitive, Zero};
use tokio_util::sync::CancellationToken;

use super::rewards::{block_era, uncle_reward_by_era, winner_reward_by_era};
use crate::config::UnlockerConfig;
use crate::rpc::{NodeRpc, RpcBlock};
use crate::storage::{Backend, BlockData};
use crate::tracing::prelude::*;
use crate::util;

/// Narrowest maturity window; the reconciliation scan covers this many
/// heights from the candidate's claimed height.
const MIN_DEPTH: u64 = 16;

/// Wei per Shannon.
pub const SHANNON: u64 = 1_000_000_000;

const DONATION_FEE: f64 = 10.0;
const DONATION_ACCOUNT: &str = "0x2a42292799d49895a4c8d39411ae735e82987008";

pub struct BlockUnlocker {
    config: UnlockerConfig,
    backend: Arc<dyn Backend>,
    rpc: Arc<dyn NodeRpc>,
    interval: Duration,
    halt: bool,
    last_fail: Option<String>,
}

#[derive(Default)]
struct UnlockResult {
    matured: Vec<BlockData>,
    orphaned: Vec<BlockData>,
    blocks: usize,
    uncles: usize,
    orphans: usize,
}

impl BlockUnlocker {
    pub fn new(
        config: UnlockerConfig,
        backend: Arc<dyn Backend>,
        rpc: Arc<dyn NodeRpc>,
    ) -> anyhow::Result<Self> {
        if !config.pool_fee_address.is_empty()
            && !util::is_valid_hex_address(&config.pool_fee_address)
        {
            bail!("invalid poolFeeAddress {}", config.pool_fee_address);
        }
        if config.depth < MIN_DEPTH * 2 {
            bail!(
                "block maturity depth can't be < {}, got {}",
                MIN_DEPTH * 2,
                config.depth
            );
        }
        if config.immature_depth < MIN_DEPTH {
            bail!(
                "immature depth can't be < {}, got {}",
                MIN_DEPTH,
                config.immature_depth
            );
        }
        let interval = util::parse_duration(&config.interval)?;
        Ok(Self {
            config,
            backend,
            rpc,
            interval,
            halt: false,
            last_fail: None,
        })
    }

    /// Run reconciliation on the configured interval until shutdown. The
    /// first pass starts immediately.
    pub async fn run(mut self, shutdown: CancellationToken) {
        info!(interval = ?self.interval, "starting block unlocker");
        let mut ticker = tokio::time::interval(self.interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => self.tick().await,
                _ = shutdown.cancelled() => return,
            }
        }
    }

    /// One full pass: immature phase, then maturity phase.
    pub async fn tick(&mut self) {
        self.unlock_pending_blocks().await;
        self.unlock_and_credit_miners().await;
    }

    pub fn is_halted(&self) -> bool {
        self.halt
    }

    pub fn last_fail(&self) -> Option<&str> {
        self.last_fail.as_deref()
    }

    /// Clear the halt flag after an operator intervened.
    pub fn reset(&mut self) {
        self.halt = false;
        self.last_fail = None;
    }

    fn suspend(&mut self, err: anyhow::Error) {
        error!(error = %err, "unlocker halted");
        self.halt = true;
        self.last_fail = Some(err.to_string());
    }

    async fn current_height(&self) -> anyhow::Result<u64> {
        let pending = self
            .rpc
            .get_pending_block()
            .await
            .context("unable to get current blockchain height from node")?;
        util::parse_hex_u64(&pending.number)
            .ok_or_else(|| anyhow!("can't parse pending block number {:?}", pending.number))
    }

    /// Phase A: candidates old enough to classify are credited as immature,
    /// or parked as pending orphans.
    async fn unlock_pending_blocks(&mut self) {
        if self.halt {
            warn!(last_fail = ?self.last_fail, "unlocking suspended due to last critical error");
            return;
        }

        let current_height = match self.current_height().await {
            Ok(height) => height,
            Err(e) => return self.suspend(e),
        };
        let threshold = current_height.saturating_sub(self.config.immature_depth);
        let candidates = match self.backend.get_candidates(threshold).await {
            Ok(candidates) => candidates,
            Err(e) => return self.suspend(e.context("failed to get block candidates")),
        };
        if candidates.is_empty() {
            info!("no block candidates to unlock");
            return;
        }

        let result = match self.unlock_candidates(candidates).await {
            Ok(result) => result,
            Err(e) => return self.suspend(e.context("failed to unlock blocks")),
        };
        info!(
            blocks = result.blocks,
            uncles = result.uncles,
            orphans = result.orphans,
            "immature pass classified candidates"
        );

        if let Err(e) = self.backend.write_pending_orphans(&result.orphaned).await {
            return self.suspend(e.context("failed to insert orphaned blocks"));
        }

        let mut total_revenue = BigRational::zero();
        let mut total_miners_profit = BigRational::zero();
        let mut total_pool_profit = BigRational::zero();

        for block in &result.matured {
            let (revenue, miners_profit, pool_profit, rewards) =
                match self.calculate_rewards(block).await {
                    Ok(split) => split,
                    Err(e) => {
                        return self.suspend(
                            e.context(format!("failed to calculate rewards for {}", block.round_key())),
                        )
                    }
                };
            if let Err(e) = self.backend.write_immature_block(block, &rewards).await {
                return self.suspend(
                    e.context(format!("failed to credit rewards for {}", block.round_key())),
                );
            }
            log_round("immature", block, &revenue, &miners_profit, &pool_profit, &rewards);
            total_revenue += revenue;
            total_miners_profit += miners_profit;
            total_pool_profit += pool_profit;
        }

        info!(
            revenue = %format_reward(&total_revenue),
            miners_profit = %format_reward(&total_miners_profit),
            pool_profit = %format_reward(&total_pool_profit),
            "immature session finished"
        );
    }

    /// Phase B: immature blocks past the full maturity depth are finalized,
    /// or committed as orphans.
    async fn unlock_and_credit_miners(&mut self) {
        if self.halt {
            warn!(last_fail = ?self.last_fail, "unlocking suspended due to last critical error");
            return;
        }

        let current_height = match self.current_height().await {
            Ok(height) => height,
            Err(e) => return self.suspend(e),
        };
        let threshold = current_height.saturating_sub(self.config.depth);
        let immature = match self.backend.get_immature_blocks(threshold).await {
            Ok(immature) => immature,
            Err(e) => return self.suspend(e.context("failed to get immature blocks")),
        };
        if immature.is_empty() {
            info!("no immature blocks to credit miners");
            return;
        }

        let result = match self.unlock_candidates(immature).await {
            Ok(result) => result,
            Err(e) => return self.suspend(e.context("failed to unlock blocks")),
        };
        info!(
            blocks = result.blocks,
            uncles = result.uncles,
            orphans = result.orphans,
            "mature pass classified blocks"
        );

        for block in &result.orphaned {
            if let Err(e) = self.backend.write_orphan(block).await {
                return self.suspend(e.context("failed to insert orphaned block"));
            }
        }

        let mut total_revenue = BigRational::zero();
        let mut total_miners_profit = BigRational::zero();
        let mut total_pool_profit = BigRational::zero();

        for block in &result.matured {
            let (revenue, miners_profit, pool_profit, rewards) =
                match self.calculate_rewards(block).await {
                    Ok(split) => split,
                    Err(e) => {
                        return self.suspend(
                            e.context(format!("failed to calculate rewards for {}", block.round_key())),
                        )
                    }
                };
            if let Err(e) = self.backend.write_matured_block(block, &rewards).await {
                return self.suspend(
                    e.context(format!("failed to credit rewards for {}", block.round_key())),
                );
            }
            log_round("matured", block, &revenue, &miners_profit, &pool_profit, &rewards);
            total_revenue += revenue;
            total_miners_profit += miners_profit;
            total_pool_profit += pool_profit;
        }

        info!(
            revenue = %format_reward(&total_revenue),
            miners_profit = %format_reward(&total_miners_profit),
            pool_profit = %format_reward(&total_pool_profit),
            "mature session finished"
        );
    }

    /// Match each candidate against the canonical chain.
    ///
    /// The claimed height is only a reference point, so the scan covers
    /// `[height, height + MIN_DEPTH)`, checking the canonical block and its
    /// uncles at each step. A candidate with no match anywhere in the window
    /// is an orphan.
    async fn unlock_candidates(&self, candidates: Vec<BlockData>) -> anyhow::Result<UnlockResult> {
        let mut result = UnlockResult::default();

        for mut candidate in candidates {
            let mut matched = false;

            'scan: for offset in 0..MIN_DEPTH {
                let height = candidate.height + offset;
                let block = self
                    .rpc
                    .get_block_by_height(height)
                    .await
                    .with_context(|| format!("error while retrieving block {height} from node"))?
                    .ok_or_else(|| {
                        anyhow!("error while retrieving block {height} from node, wrong node height")
                    })?;

                if match_candidate(&block, &candidate) {
                    self.handle_block(&block, &mut candidate).await?;
                    result.blocks += 1;
                    matched = true;
                    info!(
                        height = candidate.height,
                        txs = block.transactions.len(),
                        hash = %candidate.hash,
                        "mature block"
                    );
                    break 'scan;
                }

                for (uncle_index, uncle_hash) in block.uncles.iter().enumerate() {
                    let uncle = self
                        .rpc
                        .get_uncle_by_block_number_and_index(height, uncle_index)
                        .await
                        .with_context(|| {
                            format!("error while retrieving uncle {uncle_hash} of block {height}")
                        })?
                        .ok_or_else(|| {
                            anyhow!("error while retrieving uncle of block {height} from node")
                        })?;

                    if match_candidate(&uncle, &candidate) {
                        handle_uncle(height, &uncle, &mut candidate)?;
                        result.uncles += 1;
                        matched = true;
                        info!(
                            height = candidate.height,
                            uncle_height = candidate.uncle_height,
                            hash = %candidate.hash,
                            "mature uncle"
                        );
                        break 'scan;
                    }
                }
            }

            if matched {
                result.matured.push(candidate);
            } else {
                candidate.orphan = true;
                result.orphans += 1;
                warn!(round = %candidate.round_key(), "orphaned block");
                result.orphaned.push(candidate);
            }
        }
        Ok(result)
    }

    /// Fill in a candidate matched as a canonical block: corrected height,
    /// winner reward, uncle-inclusion rewards and the tx-fee policy.
    async fn handle_block(
        &self,
        block: &RpcBlock,
        candidate: &mut BlockData,
    ) -> anyhow::Result<()> {
        let height = util::parse_hex_u64(&block.number)
            .ok_or_else(|| anyhow!("can't parse block number {:?}", block.number))?;
        candidate.height = height;

        let era = block_era(height);
        let mut reward = winner_reward_by_era(era);

        let extra_tx_reward = self
            .tx_fee_reward(block)
            .await
            .context("error while fetching tx receipts")?;
        if self.config.keep_tx_fees {
            candidate.extra_reward = Some(extra_tx_reward);
        } else {
            reward += extra_tx_reward;
        }

        reward += uncle_reward_by_era(era) * BigInt::from(block.uncles.len() as u64);

        candidate.orphan = false;
        candidate.hash = block.hash.clone();
        candidate.reward = reward;
        Ok(())
    }

    /// Total `gasUsed * gasPrice` across the block's transactions. A missing
    /// receipt contributes zero; a malformed one is fatal to the tick.
    async fn tx_fee_reward(&self, block: &RpcBlock) -> anyhow::Result<BigInt> {
        let mut amount = BigInt::zero();
        for tx in &block.transactions {
            let Some(receipt) = self.rpc.get_tx_receipt(&tx.hash).await? else {
                continue;
            };
            let gas_used = util::parse_prefixed_uint(&receipt.gas_used)
                .ok_or_else(|| anyhow!("malformed used gas: {}", receipt.gas_used))?;
            let gas_price = util::parse_prefixed_uint(&tx.gas_price)
                .ok_or_else(|| anyhow!("malformed transaction gas price: {}", tx.gas_price))?;
            amount += BigInt::from(gas_used * gas_price);
        }
        Ok(amount)
    }

    /// Split a matured block's revenue: pool fee off the top, the miners'
    /// share weighted by round shares, then tx fees, donation and the pool
    /// fee address. Exact rationals throughout; Shannon conversion floors.
    pub async fn calculate_rewards(
        &self,
        block: &BlockData,
    ) -> anyhow::Result<(BigRational, BigRational, BigRational, HashMap<String, u64>)> {
        let mut revenue = BigRational::from_integer(block.reward.clone());
        let (miners_profit, mut pool_profit) = charge_fee(&revenue, self.config.pool_fee);

        let shares = self
            .backend
            .get_round_shares(block.round_height, &block.nonce)
            .await?;
        let mut rewards = rewards_for_shares(&shares, block.total_shares, &miners_profit);

        if let Some(extra) = &block.extra_reward {
            let extra = BigRational::from_integer(extra.clone());
            pool_profit += extra.clone();
            revenue += extra;
        }

        if self.config.enabled {
            let donate = match self.config.dev_donate {
                Some(fee) if (0.0..100.0).contains(&fee) => fee,
                _ => DONATION_FEE,
            };
            if donate > 0.0 {
                let (kept, donation) = charge_fee(&pool_profit, donate);
                pool_profit = kept;
                *rewards.entry(DONATION_ACCOUNT.to_string()).or_default() +=
                    wei_to_shannon(&donation);
            }
        }

        if !self.config.pool_fee_address.is_empty() {
            let address = self.config.pool_fee_address.to_lowercase();
            *rewards.entry(address).or_default() += wei_to_shannon(&pool_profit);
        }

        Ok((revenue, miners_profit, pool_profit, rewards))
    }
}

/// Matches a candidate to a chain block: an authoritative hash wins, then
/// the geth-style nonce, then the second of exactly two Parity seal fields.
fn match_candidate(block: &RpcBlock, candidate: &BlockData) -> bool {
    if !candidate.hash.is_empty() && candidate.hash.eq_ignore_ascii_case(&block.hash) {
        return true;
    }
    if !block.nonce.is_empty() {
        return block.nonce.eq_ignore_ascii_case(&candidate.nonce);
    }
    if block.seal_fields.len() == 2 {
        return candidate.nonce.eq_ignore_ascii_case(&block.seal_fields[1]);
    }
    false
}

/// Fill in a candidate matched as an uncle of the block at `height`. The
/// reward is fixed by the including block's era; the uncle's own height does
/// not scale it.
fn handle_uncle(height: u64, uncle: &RpcBlock, candidate: &mut BlockData) -> anyhow::Result<()> {
    let uncle_height = util::parse_hex_u64(&uncle.number)
        .ok_or_else(|| anyhow!("can't parse uncle block number {:?}", uncle.number))?;
    candidate.height = height;
    candidate.uncle_height = Some(uncle_height);
    candidate.orphan = false;
    candidate.hash = uncle.hash.clone();
    candidate.reward = uncle_reward_by_era(block_era(height));
    Ok(())
}

/// Share-weighted split of `reward`, floored to Shannon per miner.
fn rewards_for_shares(
    shares: &HashMap<String, u64>,
    total: u64,
    reward: &BigRational,
) -> HashMap<String, u64> {
    let mut rewards = HashMap::new();
    if total == 0 {
        return rewards;
    }
    for (login, n) in shares {
        let percent = BigRational::new(BigInt::from(*n), BigInt::from(total));
        let worker_reward = reward * percent;
        *rewards.entry(login.clone()).or_default() += wei_to_shannon(&worker_reward);
    }
    rewards
}

/// Split `value` at `fee` percent: returns (remainder, fee value), exactly.
fn charge_fee(value: &BigRational, fee: f64) -> (BigRational, BigRational) {
    let percent = BigRational::from_float(fee / 100.0).unwrap_or_else(BigRational::zero);
    let fee_value = value * percent;
    (value - fee_value.clone(), fee_value)
}

/// Wei to Shannon, truncating toward zero.
fn wei_to_shannon(wei: &BigRational) -> u64 {
    (wei / BigRational::from_integer(BigInt::from(SHANNON)))
        .to_integer()
        .to_u64()
        .unwrap_or_default()
}

fn format_reward(value: &BigRational) -> String {
    value.to_integer().to_string()
}

fn log_round(
    phase: &str,
    block: &BlockData,
    revenue: &BigRational,
    miners_profit: &BigRational,
    pool_profit: &BigRational,
    rewards: &HashMap<String, u64>,
) {
    info!(
        round = %block.round_key(),
        revenue = %format_reward(revenue),
        miners_profit = %format_reward(miners_profit),
        pool_profit = %format_reward(pool_profit),
        "{phase} round accounted"
    );
    for (login, reward) in rewards {
        info!(round = %block.round_key(), %login, reward, "reward in Shannon");
    }
}
