//! Engine configuration.
//!
//! Two sources, deliberately separated: credentials come from the
//! environment (never from files checked into a repo), strategy and risk
//! knobs come from an optional JSON file with defaults matching the
//! production tuning for micro futures.

use std::path::Path;

use chrono::Weekday;
use chrono_tz::Tz;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors raised while assembling configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{0} must be set in environment")]
    MissingEnv(&'static str),

    #[error("failed to read config file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Gateway credentials and endpoints, read from the environment.
#[derive(Debug, Clone)]
pub struct GatewayCredentials {
    pub username: String,
    pub api_key: String,
    pub api_url: String,
    pub rtc_url: String,
}

impl GatewayCredentials {
    /// Read credentials from the environment. `GATEWAY_USERNAME` and
    /// `GATEWAY_API_KEY` are required; the URLs default to the production
    /// gateway.
    pub fn from_env() -> Result<Self, ConfigError> {
        let username = std::env::var("GATEWAY_USERNAME")
            .map_err(|_| ConfigError::MissingEnv("GATEWAY_USERNAME"))?;
        let api_key = std::env::var("GATEWAY_API_KEY")
            .map_err(|_| ConfigError::MissingEnv("GATEWAY_API_KEY"))?;
        let api_url = std::env::var("GATEWAY_API_URL")
            .unwrap_or_else(|_| "https://api.topstepx.com".to_string());
        let rtc_url = std::env::var("GATEWAY_RTC_URL")
            .unwrap_or_else(|_| "wss://rtc.topstepx.com".to_string());
        Ok(Self {
            username,
            api_key,
            api_url,
            rtc_url,
        })
    }
}

/// Instrument and account selection.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct InstrumentConfig {
    /// Contract search text, e.g. "MGC".
    pub symbol: String,
    /// Explicit account id. Takes precedence over `account_suffix`.
    pub account_id: Option<i64>,
    /// Suffix matched against account id or name, preferring tradable
    /// accounts. Falls back to the first tradable account when unset.
    pub account_suffix: Option<String>,
    /// Search live contracts instead of sim.
    pub live: bool,
}

impl Default for InstrumentConfig {
    fn default() -> Self {
        Self {
            symbol: "MGC".to_string(),
            account_id: None,
            account_suffix: None,
            live: false,
        }
    }
}

/// How entries are executed once a signal is accepted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryMode {
    /// Market order, protective orders placed after the fill confirms.
    Market,
    /// Market order with broker-linked stop/target brackets.
    Bracket,
    /// Park a limit order offset toward the retest; expire if unfilled.
    LimitRetest,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TradingConfig {
    pub position_size: i64,
    pub entry_mode: EntryMode,
    /// File watched for strategy signals; the engine trades signal-less
    /// (reconcile and protect only) when unset.
    pub signal_file: Option<String>,
    /// Main loop cadence.
    pub poll_interval_secs: u64,
    /// Strategy bar interval; cooldown and retest expiry count in these.
    pub bar_interval_minutes: i64,
    /// Attempts waiting for a market entry to show up in positions.
    pub max_fill_wait_attempts: u32,
    pub fill_wait_delay_ms: u64,
    /// Quotes older than this are not acted on.
    pub quote_staleness_secs: i64,
    /// Weekday names on which no new entries are taken.
    pub blocked_days: Vec<String>,
    /// IANA timezone defining the trading day boundary.
    pub timezone: String,
    /// Positions older than this are force-closed.
    pub max_position_hours: i64,
    /// Limit-retest entry tuning (only used with `EntryMode::LimitRetest`).
    pub retest_max_wait_bars: i64,
    pub retest_entry_offset_ticks: i64,
}

impl Default for TradingConfig {
    fn default() -> Self {
        Self {
            position_size: 5,
            entry_mode: EntryMode::Market,
            signal_file: None,
            poll_interval_secs: 30,
            bar_interval_minutes: 3,
            max_fill_wait_attempts: 10,
            fill_wait_delay_ms: 500,
            quote_staleness_secs: 30,
            blocked_days: Vec::new(),
            timezone: "America/Chicago".to_string(),
            max_position_hours: 6,
            retest_max_wait_bars: 4,
            retest_entry_offset_ticks: 1,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BreakEvenConfig {
    pub enabled: bool,
    /// R multiple of initial risk that arms the move to entry.
    pub trigger_r: Decimal,
    /// Optional earlier trigger in raw ticks of profit.
    pub early_enabled: bool,
    pub early_ticks: i64,
    /// If clamping against the market drags the stop this many ticks past
    /// entry, skip the move and alert instead.
    pub tolerance_ticks: i64,
}

impl Default for BreakEvenConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            trigger_r: Decimal::ONE,
            early_enabled: false,
            early_ticks: 40,
            tolerance_ticks: 2,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PartialExitConfig {
    pub enabled: bool,
    /// R multiple triggering the scale-out when no structure level is used.
    pub first_exit_r: Decimal,
    /// Fraction of remaining contracts to close (floored, minimum one).
    pub first_exit_pct: Decimal,
    /// Trigger off the nearest structure level instead of a fixed R.
    pub structure_based: bool,
    /// R of profit locked by the post-partial stop. Deliberately below
    /// break-even so a retest of entry does not stop the runner out.
    pub post_partial_lock_r: Decimal,
}

impl Default for PartialExitConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            first_exit_r: Decimal::ONE,
            first_exit_pct: Decimal::new(5, 1),
            structure_based: false,
            post_partial_lock_r: Decimal::new(5, 1),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrailingConfig {
    pub enabled: bool,
    /// Profit (in R, measured at the running extreme) that activates the trail.
    pub activation_r: Decimal,
    /// Distance (in R) the stop trails behind the extreme.
    pub trail_distance_r: Decimal,
}

impl Default for TrailingConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            activation_r: Decimal::ONE,
            trail_distance_r: Decimal::new(4, 1),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StructureConfig {
    /// Ticks beyond a level before it counts as broken.
    pub detect_buffer_ticks: i64,
    /// Ticks behind a broken level the stop is parked, wide enough to
    /// survive a liquidity sweep back through the level.
    pub sweep_buffer_ticks: i64,
}

impl Default for StructureConfig {
    fn default() -> Self {
        Self {
            detect_buffer_ticks: 3,
            sweep_buffer_ticks: 10,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CooldownConfig {
    pub enabled: bool,
    /// Consecutive losing trades that open the cooldown window.
    pub consecutive_losses_trigger: u32,
    /// Cooldown length in bars of `bar_interval_minutes`.
    pub pause_bars: i64,
}

impl Default for CooldownConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            consecutive_losses_trigger: 2,
            pause_bars: 20,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RiskConfig {
    /// Daily loss floor in account currency (negative).
    pub daily_loss_limit: Decimal,
    pub max_trades_per_day: u32,
    pub break_even: BreakEvenConfig,
    pub partial: PartialExitConfig,
    pub trailing: TrailingConfig,
    pub structure: StructureConfig,
    pub cooldown: CooldownConfig,
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self {
            daily_loss_limit: Decimal::new(-2500, 0),
            max_trades_per_day: 4,
            break_even: BreakEvenConfig::default(),
            partial: PartialExitConfig::default(),
            trailing: TrailingConfig::default(),
            structure: StructureConfig::default(),
            cooldown: CooldownConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProtectiveConfig {
    /// Placement attempts per protective order before giving up.
    pub max_place_attempts: u32,
    /// Open-order polls while verifying an accepted submission.
    pub verify_attempts: u32,
    pub verify_delay_ms: u64,
    /// Cancel retries for dangling orders after a closure.
    pub cancel_attempts: u32,
    pub cancel_retry_delay_ms: u64,
    /// Minimum seconds between watchdog passes.
    pub watchdog_interval_secs: u64,
    /// Conservative stop distance (ticks from current price) used when
    /// adopting a position with no recoverable stop.
    pub default_stop_ticks: i64,
    /// Floor on the adopted stop's distance from entry.
    pub min_stop_ticks: i64,
    /// Target distance from entry when no take-profit is recoverable.
    pub default_target_ticks: i64,
    /// Derived targets are at least this multiple of the stop distance.
    pub min_reward_risk: Decimal,
}

impl Default for ProtectiveConfig {
    fn default() -> Self {
        Self {
            max_place_attempts: 5,
            verify_attempts: 5,
            verify_delay_ms: 400,
            cancel_attempts: 3,
            cancel_retry_delay_ms: 500,
            watchdog_interval_secs: 60,
            default_stop_ticks: 20,
            min_stop_ticks: 30,
            default_target_ticks: 40,
            min_reward_risk: Decimal::ONE,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    /// Real-time push channel on, REST polling fallback off.
    pub push_enabled: bool,
    /// Polling cadence in degraded mode.
    pub polling_interval_secs: u64,
    /// Heartbeat window; a tick or push message inside it counts as alive.
    pub heartbeat_interval_secs: u64,
    /// Consecutive missed windows before the connection is declared dead.
    pub max_missed_heartbeats: u32,
    /// Throttle for the periodic heartbeat status line.
    pub heartbeat_log_secs: u64,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            push_enabled: true,
            polling_interval_secs: 10,
            heartbeat_interval_secs: 60,
            max_missed_heartbeats: 3,
            heartbeat_log_secs: 60,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BreakerConfig {
    pub failure_threshold: u32,
    pub timeout_minutes: i64,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 3,
            timeout_minutes: 15,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AlertsConfig {
    /// Webhook endpoint for alert delivery; alerts are disabled when unset.
    pub webhook_url: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct JournalConfig {
    /// CSV file appended with one line per trade event; disabled when unset.
    pub csv_path: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    pub enabled: bool,
    pub port: u16,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            port: 9100,
        }
    }
}

/// Top-level engine configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub instrument: InstrumentConfig,
    pub trading: TradingConfig,
    pub risk: RiskConfig,
    pub protective: ProtectiveConfig,
    pub connection: ConnectionConfig,
    pub breaker: BreakerConfig,
    pub alerts: AlertsConfig,
    pub journal: JournalConfig,
    pub health: HealthConfig,
}

impl EngineConfig {
    /// Load from a JSON file, or defaults when no path is given.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let config = match path {
            Some(p) => {
                let text = std::fs::read_to_string(p).map_err(|e| ConfigError::Io {
                    path: p.display().to_string(),
                    source: e,
                })?;
                serde_json::from_str(&text).map_err(|e| ConfigError::Parse {
                    path: p.display().to_string(),
                    source: e,
                })?
            }
            None => Self::default(),
        };
        config.validate()?;
        Ok(config)
    }

    /// Sanity-check cross-field constraints that serde cannot express.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.trading.position_size < 1 {
            return Err(ConfigError::Invalid(
                "trading.position_size must be at least 1".to_string(),
            ));
        }
        if self.risk.partial.first_exit_pct <= Decimal::ZERO
            || self.risk.partial.first_exit_pct >= Decimal::ONE
        {
            return Err(ConfigError::Invalid(
                "risk.partial.first_exit_pct must be between 0 and 1 exclusive".to_string(),
            ));
        }
        if self.risk.daily_loss_limit >= Decimal::ZERO {
            return Err(ConfigError::Invalid(
                "risk.daily_loss_limit must be negative".to_string(),
            ));
        }
        if self.protective.min_reward_risk < Decimal::ONE {
            return Err(ConfigError::Invalid(
                "protective.min_reward_risk must be at least 1.0".to_string(),
            ));
        }
        self.timezone()?;
        self.blocked_weekdays()?;
        Ok(())
    }

    /// The trading-day timezone, parsed from its IANA name.
    pub fn timezone(&self) -> Result<Tz, ConfigError> {
        self.trading
            .timezone
            .parse::<Tz>()
            .map_err(|_| ConfigError::Invalid(format!("unknown timezone {}", self.trading.timezone)))
    }

    /// Blocked weekdays parsed from their names.
    pub fn blocked_weekdays(&self) -> Result<Vec<Weekday>, ConfigError> {
        self.trading
            .blocked_days
            .iter()
            .map(|d| {
                d.parse::<Weekday>()
                    .map_err(|_| ConfigError::Invalid(format!("unknown weekday {}", d)))
            })
            .collect()
    }

    /// Cooldown length as a duration.
    pub fn cooldown_duration(&self) -> chrono::Duration {
        chrono::Duration::minutes(self.risk.cooldown.pause_bars * self.trading.bar_interval_minutes)
    }

    /// Pending-limit entry lifetime as a duration.
    pub fn retest_lifetime(&self) -> chrono::Duration {
        chrono::Duration::minutes(self.trading.retest_max_wait_bars * self.trading.bar_interval_minutes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn defaults_validate() {
        let config = EngineConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.trading.position_size, 5);
        assert_eq!(config.risk.daily_loss_limit, dec!(-2500));
        assert_eq!(config.cooldown_duration(), chrono::Duration::minutes(60));
    }

    #[test]
    fn rejects_bad_partial_pct() {
        let mut config = EngineConfig::default();
        config.risk.partial.first_exit_pct = dec!(1.5);
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_unknown_timezone() {
        let mut config = EngineConfig::default();
        config.trading.timezone = "Mars/Olympus".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn parses_blocked_days() {
        let mut config = EngineConfig::default();
        config.trading.blocked_days = vec!["friday".to_string(), "Mon".to_string()];
        let days = config.blocked_weekdays().unwrap();
        assert_eq!(days, vec![Weekday::Fri, Weekday::Mon]);
    }

    #[test]
    fn partial_config_round_trips_through_json() {
        let config = EngineConfig::default();
        let json = serde_json::to_string(&config).unwrap();
        let back: EngineConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back.trading.poll_interval_secs, 30);
        assert_eq!(back.risk.partial.first_exit_pct, dec!(0.5));
    }
}
