//! Variable-difficulty controller.
//!
//! Watches the spacing of a session's valid shares and retunes its
//! difficulty toward the configured target time. The new value is staged by
//! the caller in `next_diff` and only takes effect at the next job handout,
//! never mid-verification.

use std::time::{Duration, Instant};

use crate::config::VarDiffConfig;

/// Retained inter-share durations.
const WINDOW: usize = 5;

/// Per-session controller state.
#[derive(Debug, Default)]
pub struct VarDiff {
    last_share: Option<Instant>,
    durations: Vec<Duration>,
}

impl VarDiff {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a valid share at `now` and return the difficulty to stage.
    ///
    /// Adjustments are proportional (`target / avg`), clamped to the
    /// configured bounds, and capped at `max_jump` percent per step. After
    /// any adjustment the window resets so the next decision is based only
    /// on post-change observations.
    pub fn observe(&mut self, config: &VarDiffConfig, now: Instant, cur_diff: i64) -> i64 {
        let Some(last) = self.last_share else {
            self.last_share = Some(now);
            return cur_diff;
        };
        let since = now.saturating_duration_since(last);
        self.last_share = Some(now);

        self.durations.push(since);
        if self.durations.len() > WINDOW {
            self.durations.remove(0);
        }
        let avg = self.durations.iter().map(Duration::as_secs_f64).sum::<f64>()
            / self.durations.len() as f64;

        let variance = config.variance_percent / 100.0 * config.target_time;
        let t_min = config.target_time - variance;
        let t_max = config.target_time + variance;

        let (proposed, direction) = if avg > t_max && cur_diff > config.min_diff {
            let new_diff = ((config.target_time / avg) * cur_diff as f64) as i64;
            (new_diff.max(config.min_diff), -1)
        } else if avg < t_min && cur_diff < config.max_diff {
            let new_diff = ((config.target_time / avg) * cur_diff as f64) as i64;
            (new_diff.min(config.max_diff), 1)
        } else {
            return cur_diff;
        };

        let mut new_diff = proposed;
        if (new_diff - cur_diff).abs() as f64 / cur_diff as f64 * 100.0 > config.max_jump {
            let change = (config.max_jump / 100.0 * cur_diff as f64) as i64 * direction;
            new_diff = cur_diff + change;
        }
        self.durations.clear();
        new_diff
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> VarDiffConfig {
        VarDiffConfig {
            min_diff: 100,
            max_diff: 1_000_000_000,
            target_time: 30.0,
            variance_percent: 30.0,
            max_jump: 50.0,
        }
    }

    fn seconds(s: u64) -> Duration {
        Duration::from_secs(s)
    }

    #[test]
    fn first_share_only_arms_the_clock() {
        let mut vd = VarDiff::new();
        assert_eq!(vd.observe(&config(), Instant::now(), 1000), 1000);
    }

    #[test]
    fn fast_shares_raise_difficulty_with_jump_cap() {
        let mut vd = VarDiff::new();
        let base = Instant::now();
        vd.observe(&config(), base, 1000);
        // 10s interval: proportional retune would be 3000 (+200%), capped to
        // +50% of 1000.
        assert_eq!(vd.observe(&config(), base + seconds(10), 1000), 1500);
        // Window was cleared by the adjustment.
        assert!(vd.durations.is_empty());
    }

    #[test]
    fn slow_shares_lower_difficulty_with_jump_cap() {
        let mut vd = VarDiff::new();
        let base = Instant::now();
        vd.observe(&config(), base, 1000);
        // 100s interval: proportional retune would be 300 (-70%), capped to
        // -50% of 1000.
        assert_eq!(vd.observe(&config(), base + seconds(100), 1000), 500);
    }

    #[test]
    fn within_variance_band_keeps_difficulty() {
        let mut vd = VarDiff::new();
        let base = Instant::now();
        vd.observe(&config(), base, 1000);
        assert_eq!(vd.observe(&config(), base + seconds(30), 1000), 1000);
        assert_eq!(vd.observe(&config(), base + seconds(55), 1000), 1000);
        // The no-adjustment path retains the window.
        assert_eq!(vd.durations.len(), 2);
    }

    #[test]
    fn clamps_to_min_diff() {
        let mut vd = VarDiff::new();
        let base = Instant::now();
        let cfg = VarDiffConfig {
            max_jump: 10_000.0,
            ..config()
        };
        vd.observe(&cfg, base, 110);
        // Very slow shares, but difficulty may not drop below the floor.
        assert_eq!(vd.observe(&cfg, base + seconds(3000), 110), 100);
    }

    #[test]
    fn clamps_to_max_diff() {
        let mut vd = VarDiff::new();
        let base = Instant::now();
        let cfg = VarDiffConfig {
            max_diff: 1200,
            max_jump: 10_000.0,
            ..config()
        };
        vd.observe(&cfg, base, 1000);
        assert_eq!(vd.observe(&cfg, base + seconds(1), 1000), 1200);
    }

    #[test]
    fn at_min_diff_no_downward_adjustment() {
        let mut vd = VarDiff::new();
        let base = Instant::now();
        vd.observe(&config(), base, 100);
        assert_eq!(vd.observe(&config(), base + seconds(500), 100), 100);
    }

    #[test]
    fn averages_over_the_window() {
        let mut vd = VarDiff::new();
        let base = Instant::now();
        let cfg = VarDiffConfig {
            variance_percent: 0.0,
            max_jump: 10_000.0,
            ..config()
        };
        let mut t = base;
        vd.observe(&cfg, t, 1000);
        // Intervals 20s and 40s average exactly to the 30s target on the
        // second observation; the first (20s) adjusts.
        t += seconds(20);
        let adjusted = vd.observe(&cfg, t, 1000);
        assert_eq!(adjusted, 1500); // 30/20 * 1000
        t += seconds(40);
        assert_eq!(vd.observe(&cfg, t, adjusted), adjusted * 30 / 40);
    }
}
