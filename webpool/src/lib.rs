//! Server-side core of a mining pool for CryptoNight/Lyra2 chains.
//!
//! Two tightly coupled subsystems make up the crate:
//!
//! - The **stratum front-end and share pipeline** ([`stratum`]): a TCP accept
//!   loop speaking a line-delimited JSON-RPC dialect, per-session state with
//!   variable difficulty, PoW verification against the live work templates
//!   ([`template`], [`pow`]), and block submission upstream.
//! - The **block unlocker and reward engine** ([`payouts`]): periodic
//!   reconciliation of found blocks against the canonical chain and exact
//!   rational-arithmetic payout distribution.
//!
//! The blockchain node ([`rpc`]), persistence ([`storage`]), per-IP policy
//! ([`policy`]) and the PoW hash itself ([`pow::PowHasher`]) are
//! collaborators behind traits; the daemon binary wires them together.

pub mod config;
pub mod payouts;
pub mod policy;
pub mod pow;
pub mod rpc;
pub mod storage;
pub mod stratum;
pub mod template;
pub mod tracing;
pub mod util;
