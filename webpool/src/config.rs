//! JSON configuration document.
//!
//! Keys are camelCase to match the deployed config files. Durations are
//! strings like `"90s"` or `"2m"`, parsed by [`crate::util::parse_duration`].

use anyhow::ensure;
use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    pub upstream: UpstreamConfig,
    pub proxy: ProxyConfig,
    pub unlocker: UnlockerConfig,
}

/// Blockchain node serving work templates and accepting block submissions.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpstreamConfig {
    #[serde(default = "default_upstream_name")]
    pub name: String,
    pub url: String,
    #[serde(default = "default_upstream_timeout")]
    pub timeout: String,
}

fn default_upstream_name() -> String {
    "main".to_string()
}

fn default_upstream_timeout() -> String {
    "10s".to_string()
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProxyConfig {
    /// Initial per-session difficulty handed out at login.
    pub difficulty: i64,

    /// Height of the CryptoNight → Lyra2 algorithm switch.
    pub lyra2_block: u64,

    #[serde(default = "default_block_refresh")]
    pub block_refresh_interval: String,

    pub stratum: StratumConfig,

    pub var_diff: VarDiffConfig,

    #[serde(default)]
    pub policy: PolicyConfig,
}

fn default_block_refresh() -> String {
    "1s".to_string()
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StratumConfig {
    pub listen: String,

    /// Rolling per-connection read deadline.
    #[serde(default = "default_stratum_timeout")]
    pub timeout: String,

    /// Cap on concurrently served connections.
    #[serde(default = "default_max_conn")]
    pub max_conn: usize,
}

fn default_stratum_timeout() -> String {
    "120s".to_string()
}

fn default_max_conn() -> usize {
    8192
}

/// Variable-difficulty controller tuning.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VarDiffConfig {
    pub min_diff: i64,
    pub max_diff: i64,
    /// Desired seconds between shares.
    pub target_time: f64,
    /// Tolerated deviation around `target_time`, in percent.
    pub variance_percent: f64,
    /// Largest single adjustment, in percent of the current difficulty.
    pub max_jump: f64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PolicyConfig {
    pub banning: BanningConfig,
    pub limits: LimitsConfig,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            banning: BanningConfig::default(),
            limits: LimitsConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BanningConfig {
    pub enabled: bool,
    /// Shares observed before the invalid ratio is evaluated.
    pub check_threshold: u32,
    /// Ban when at least this percentage of the window was invalid.
    pub invalid_percent: f64,
    /// Ban duration.
    pub timeout: String,
    /// Malformed frames tolerated before an outright ban.
    pub malformed_limit: u32,
}

impl Default for BanningConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            check_threshold: 30,
            invalid_percent: 30.0,
            timeout: "1h".to_string(),
            malformed_limit: 5,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LimitsConfig {
    pub enabled: bool,
    /// Initial connection credit per IP.
    pub limit: i32,
    /// Credit returned for each valid share.
    pub limit_jump: i32,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            limit: 30,
            limit_jump: 10,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UnlockerConfig {
    pub enabled: bool,
    /// Pool cut, percent of block revenue.
    pub pool_fee: f64,
    #[serde(default)]
    pub pool_fee_address: String,
    /// Confirmations before a block is finalized. Must be at least 32.
    pub depth: u64,
    /// Developer donation percentage; the built-in default applies when unset.
    #[serde(default)]
    pub dev_donate: Option<f64>,
    /// Confirmations before a candidate is credited as immature. At least 16.
    pub immature_depth: u64,
    /// Keep transaction fees for the pool instead of folding them into the
    /// miners' reward.
    #[serde(default)]
    pub keep_tx_fees: bool,
    pub interval: String,
    pub daemon: String,
    pub timeout: String,
}

impl Config {
    pub fn load(path: &str) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: Config = serde_json::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> anyhow::Result<()> {
        ensure!(self.proxy.difficulty > 0, "proxy difficulty must be positive");
        ensure!(self.proxy.stratum.max_conn > 0, "maxConn must be positive");
        let vd = &self.proxy.var_diff;
        ensure!(
            vd.min_diff > 0 && vd.min_diff <= vd.max_diff,
            "varDiff bounds must satisfy 0 < minDiff <= maxDiff"
        );
        ensure!(vd.target_time > 0.0, "varDiff targetTime must be positive");
        ensure!(vd.max_jump >= 0.0, "varDiff maxJump must not be negative");
        Ok(())
    }
}
