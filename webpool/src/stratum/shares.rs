//! Share classification pipeline.
//!
//! Every `submit` lands here with the tuple `[0x·nonce, hashNoNonce,
//! 0x·result]`. The pipeline resolves the job header, recomputes the PoW,
//! gates on the session and network difficulties, and drives block
//! submission plus backend writes. Classification is a return value, never
//! an error: the handler layer maps it to wire codes and the share policy.

use std::net::IpAddr;

use super::server::StratumServer;
use crate::pow::{self, Algorithm};
use crate::template::BlockTemplate;
use crate::tracing::prelude::*;
use crate::util;

/// Outcome of one submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShareOutcome {
    /// The job header is no longer live, or a collaborator failure (node
    /// RPC, storage) prevented recording the submission. Rejected without
    /// credit and without counting against the miner.
    Stale,
    /// Failed verification; counts toward the invalid-share policy.
    Invalid,
    /// The identical tuple was already recorded this round.
    Duplicate,
    /// Met the session difficulty and was credited.
    Valid,
    /// Met the network difficulty and was submitted as a block.
    Block,
}

impl ShareOutcome {
    /// Whether the submission earns credit (valid or block-level).
    pub fn credited(self) -> bool {
        matches!(self, ShareOutcome::Valid | ShareOutcome::Block)
    }
}

impl StratumServer {
    pub(crate) async fn process_share(
        &self,
        login: &str,
        worker: &str,
        ip: IpAddr,
        template: &BlockTemplate,
        params: &[String; 3],
        share_diff: i64,
    ) -> ShareOutcome {
        let hash_no_nonce = &params[1];
        let Some(header) = template.headers.get(hash_no_nonce) else {
            info!(%login, %ip, "stale share");
            return ShareOutcome::Stale;
        };

        let Ok(seed) = hex::decode(template.seed.trim_start_matches("0x")) else {
            warn!(seed = %template.seed, "undecodable template seed");
            return ShareOutcome::Invalid;
        };
        let Some(nonce) = util::parse_hex_u64(&params[0]) else {
            return ShareOutcome::Invalid;
        };

        let algo = Algorithm::for_height(header.height, self.lyra2_block);
        let hash = pow::hash_value(&self.hasher.hash(algo, &seed, nonce));
        if !pow::check_hash(&hash, share_diff) {
            return ShareOutcome::Invalid;
        }

        if pow::check_hash(&hash, header.diff) {
            match self.rpc.submit_block(params).await {
                Err(e) => {
                    warn!(height = header.height, error = %e, "block submission failure");
                    return ShareOutcome::Stale;
                }
                Ok(false) => {
                    warn!(height = header.height, "block rejected upstream");
                    return ShareOutcome::Invalid;
                }
                Ok(true) => {
                    self.templates.request_refresh();
                    return match self
                        .backend
                        .write_block(login, worker, params, share_diff, header.diff, header.height)
                        .await
                    {
                        Ok(true) => ShareOutcome::Duplicate,
                        Ok(false) => {
                            info!(%login, %ip, height = header.height, "block found");
                            ShareOutcome::Block
                        }
                        Err(e) => {
                            error!(error = %e, "failed to insert block candidate into backend");
                            ShareOutcome::Stale
                        }
                    };
                }
            }
        }

        match self
            .backend
            .write_share(login, worker, params, share_diff, header.height)
            .await
        {
            Ok(true) => ShareOutcome::Duplicate,
            Ok(false) => ShareOutcome::Valid,
            Err(e) => {
                error!(error = %e, "failed to insert share into backend");
                ShareOutcome::Stale
            }
        }
    }
}
