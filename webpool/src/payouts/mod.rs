//! Block unlocking and reward distribution.
//!
//! A found block starts as a candidate tied to the round's shares. The
//! unlocker periodically reconciles candidates against the canonical chain,
//! classifies them as block, uncle or orphan, computes the reward from the
//! era schedule, and splits it share-weighted across the round's miners.

pub mod rewards;
pub mod unlocker;

pub use unlocker::BlockUnlocker;
