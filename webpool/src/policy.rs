//! Per-IP admission and abuse policy.
//!
//! Tracks connection credit, malformed-frame counts and the valid/invalid
//! share ratio per remote IP, and bans offenders for a configured period.
//! The stratum server consults this before any protocol exchange.

use std::collections::{HashMap, HashSet};
use std::net::IpAddr;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::config::PolicyConfig;
use crate::tracing::prelude::*;
use crate::util;

#[derive(Default)]
struct IpStats {
    valid_shares: u32,
    invalid_shares: u32,
    malformed: u32,
    /// Remaining connection credit; `None` until first admission.
    conn_credit: Option<i32>,
    banned_until: Option<Instant>,
}

pub struct Policy {
    config: PolicyConfig,
    ban_timeout: Duration,
    stats: Mutex<HashMap<IpAddr, IpStats>>,
    blacklist: Mutex<HashSet<String>>,
}

impl Policy {
    pub fn new(config: PolicyConfig) -> anyhow::Result<Self> {
        let ban_timeout = util::parse_duration(&config.banning.timeout)?;
        Ok(Self {
            config,
            ban_timeout,
            stats: Mutex::new(HashMap::new()),
            blacklist: Mutex::new(HashSet::new()),
        })
    }

    pub fn is_banned(&self, ip: IpAddr) -> bool {
        if !self.config.banning.enabled {
            return false;
        }
        let stats = self.stats.lock().unwrap();
        match stats.get(&ip).and_then(|s| s.banned_until) {
            Some(until) => until > Instant::now(),
            None => false,
        }
    }

    pub fn ban_client(&self, ip: IpAddr) {
        let mut stats = self.stats.lock().unwrap();
        let entry = stats.entry(ip).or_default();
        entry.banned_until = Some(Instant::now() + self.ban_timeout);
        info!(%ip, timeout = ?self.ban_timeout, "banned client");
    }

    /// Admission check for a new connection. Each accepted socket consumes
    /// one credit; valid shares earn it back.
    pub fn apply_limit_policy(&self, ip: IpAddr) -> bool {
        if !self.config.limits.enabled {
            return true;
        }
        let mut stats = self.stats.lock().unwrap();
        let credit = stats
            .entry(ip)
            .or_default()
            .conn_credit
            .get_or_insert(self.config.limits.limit);
        if *credit <= 0 {
            debug!(%ip, "connection limit reached");
            return false;
        }
        *credit -= 1;
        true
    }

    /// Login admission: blacklisted logins ban the originating IP.
    pub fn apply_login_policy(&self, login: &str, ip: IpAddr) -> bool {
        if self.blacklist.lock().unwrap().contains(login) {
            self.ban_client(ip);
            return false;
        }
        true
    }

    pub fn apply_malformed_policy(&self, ip: IpAddr) {
        let mut stats = self.stats.lock().unwrap();
        let entry = stats.entry(ip).or_default();
        entry.malformed += 1;
        if entry.malformed >= self.config.banning.malformed_limit {
            entry.banned_until = Some(Instant::now() + self.ban_timeout);
            warn!(%ip, "banned for malformed requests");
        }
    }

    /// Account one share result; false means the invalid ratio crossed the
    /// banning threshold and the caller should drop the connection.
    pub fn apply_share_policy(&self, ip: IpAddr, valid: bool) -> bool {
        let mut stats = self.stats.lock().unwrap();
        let limits = self.config.limits.clone();
        let entry = stats.entry(ip).or_default();
        if valid {
            entry.valid_shares += 1;
            if limits.enabled {
                let credit = entry.conn_credit.get_or_insert(limits.limit);
                *credit = (*credit + limits.limit_jump).min(limits.limit);
            }
        } else {
            entry.invalid_shares += 1;
        }

        let total = entry.valid_shares + entry.invalid_shares;
        if total < self.config.banning.check_threshold {
            return true;
        }
        let invalid_percent = entry.invalid_shares as f64 / total as f64 * 100.0;
        entry.valid_shares = 0;
        entry.invalid_shares = 0;
        if self.config.banning.enabled && invalid_percent >= self.config.banning.invalid_percent {
            entry.banned_until = Some(Instant::now() + self.ban_timeout);
            warn!(%ip, invalid_percent, "banned for invalid shares");
            return false;
        }
        true
    }

    pub fn blacklist_login(&self, login: &str) {
        self.blacklist.lock().unwrap().insert(login.to_lowercase());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BanningConfig, LimitsConfig};

    fn policy(banning: BanningConfig, limits: LimitsConfig) -> Policy {
        Policy::new(PolicyConfig { banning, limits }).unwrap()
    }

    fn ip() -> IpAddr {
        "10.0.0.1".parse().unwrap()
    }

    #[test]
    fn malformed_frames_lead_to_ban() {
        let p = policy(
            BanningConfig {
                malformed_limit: 3,
                ..BanningConfig::default()
            },
            LimitsConfig::default(),
        );
        p.apply_malformed_policy(ip());
        p.apply_malformed_policy(ip());
        assert!(!p.is_banned(ip()));
        p.apply_malformed_policy(ip());
        assert!(p.is_banned(ip()));
    }

    #[test]
    fn invalid_share_ratio_bans_at_threshold() {
        let p = policy(
            BanningConfig {
                check_threshold: 10,
                invalid_percent: 50.0,
                ..BanningConfig::default()
            },
            LimitsConfig::default(),
        );
        for _ in 0..4 {
            assert!(p.apply_share_policy(ip(), true));
        }
        for _ in 0..5 {
            assert!(p.apply_share_policy(ip(), false));
        }
        // Tenth share trips the evaluation: 6/10 invalid.
        assert!(!p.apply_share_policy(ip(), false));
        assert!(p.is_banned(ip()));
    }

    #[test]
    fn mostly_valid_window_passes_and_resets() {
        let p = policy(
            BanningConfig {
                check_threshold: 4,
                invalid_percent: 50.0,
                ..BanningConfig::default()
            },
            LimitsConfig::default(),
        );
        for _ in 0..3 {
            assert!(p.apply_share_policy(ip(), true));
        }
        assert!(p.apply_share_policy(ip(), false));
        assert!(!p.is_banned(ip()));
    }

    #[test]
    fn connection_credit_runs_out_and_replenishes() {
        let p = policy(
            BanningConfig::default(),
            LimitsConfig {
                enabled: true,
                limit: 2,
                limit_jump: 2,
            },
        );
        assert!(p.apply_limit_policy(ip()));
        assert!(p.apply_limit_policy(ip()));
        assert!(!p.apply_limit_policy(ip()));
        p.apply_share_policy(ip(), true);
        assert!(p.apply_limit_policy(ip()));
    }

    #[test]
    fn blacklisted_login_bans_ip() {
        let p = policy(BanningConfig::default(), LimitsConfig::default());
        p.blacklist_login("0xBAD");
        assert!(!p.apply_login_policy("0xbad", ip()));
        assert!(p.is_banned(ip()));
    }
}
