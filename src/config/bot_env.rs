//! Bot settings read from the environment file.
//!
//! The bot and MCP server consume these values themselves; the launcher
//! only reads them to decide whether the MCP server is needed and to show
//! them in `fxlaunch config`.

#[cfg(test)]
use std::collections::HashMap;
use std::path::Path;

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use tracing::{debug, warn};

/// Flat key-value settings for the bot process.
#[derive(Debug, Clone)]
pub struct BotSettings {
    pub telegram_bot_token: Option<String>,
    pub telegram_chat_id: Option<String>,
    pub currency_pair: String,

    /// Percentage of balance risked per trade
    pub risk_percentage: Decimal,

    /// Lot size used when no other sizing applies
    pub default_position_size: Decimal,

    pub mt5_account: Option<String>,
    pub mt5_password: Option<String>,
    pub mt5_server: Option<String>,
    pub mt5_server_url: String,

    /// Whether orders are routed through MetaTrader at all
    pub mt5_enabled: bool,

    /// Whether signals are executed without confirmation
    pub mt5_auto_trade: bool,

    pub timezone: String,
}

impl Default for BotSettings {
    fn default() -> Self {
        Self {
            telegram_bot_token: None,
            telegram_chat_id: None,
            currency_pair: "XAUUSD".to_string(),
            risk_percentage: dec!(1),
            default_position_size: dec!(0.01),
            mt5_account: None,
            mt5_password: None,
            mt5_server: None,
            mt5_server_url: "http://127.0.0.1:8000".to_string(),
            mt5_enabled: false,
            mt5_auto_trade: false,
            timezone: "UTC".to_string(),
        }
    }
}

impl BotSettings {
    /// Load the env file (if present) into the process environment, then read settings.
    ///
    /// Variables already set in the environment win over the file.
    pub fn load(env_file: &Path) -> Self {
        match dotenvy::from_path(env_file) {
            Ok(()) => debug!(path = %env_file.display(), "Loaded environment file"),
            Err(e) if e.not_found() => {
                debug!(path = %env_file.display(), "No environment file, using process environment")
            }
            Err(e) => warn!(path = %env_file.display(), error = %e, "Failed to read environment file"),
        }

        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build settings from a key lookup.
    #[cfg(test)]
    pub fn from_map(vars: &HashMap<String, String>) -> Self {
        Self::from_lookup(|key| vars.get(key).cloned())
    }

    fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let text = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        Self {
            telegram_bot_token: text("TELEGRAM_BOT_TOKEN"),
            telegram_chat_id: text("TELEGRAM_CHAT_ID"),
            currency_pair: text("CURRENCY_PAIR").unwrap_or(defaults.currency_pair),
            risk_percentage: parse_decimal("RISK_PERCENTAGE", text("RISK_PERCENTAGE"), defaults.risk_percentage),
            default_position_size: parse_decimal(
                "DEFAULT_POSITION_SIZE",
                text("DEFAULT_POSITION_SIZE"),
                defaults.default_position_size,
            ),
            mt5_account: text("MT5_ACCOUNT"),
            mt5_password: text("MT5_PASSWORD"),
            mt5_server: text("MT5_SERVER"),
            mt5_server_url: text("MT5_SERVER_URL").unwrap_or(defaults.mt5_server_url),
            mt5_enabled: parse_bool("MT5_ENABLED", text("MT5_ENABLED"), defaults.mt5_enabled),
            mt5_auto_trade: parse_bool("MT5_AUTO_TRADE", text("MT5_AUTO_TRADE"), defaults.mt5_auto_trade),
            timezone: text("TIMEZONE").unwrap_or(defaults.timezone),
        }
    }
}

fn parse_decimal(key: &str, value: Option<String>, default: Decimal) -> Decimal {
    match value {
        Some(raw) => match raw.trim().parse::<Decimal>() {
            Ok(v) => v,
            Err(e) => {
                warn!("Invalid {} '{}': {}. Using default {}.", key, raw, e, default);
                default
            }
        },
        None => default,
    }
}

fn parse_bool(key: &str, value: Option<String>, default: bool) -> bool {
    match value {
        Some(raw) => match raw.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => true,
            "0" | "false" | "no" | "off" => false,
            _ => {
                warn!("Invalid {} '{}'. Using default {}.", key, raw, default);
                default
            }
        },
        None => default,
    }
}

/// Mask a secret for display, keeping the last four characters.
pub fn mask(value: Option<&str>) -> String {
    match value {
        None => "(not set)".to_string(),
        Some(v) if v.chars().count() <= 4 => "****".to_string(),
        Some(v) => {
            let tail: String = v.chars().rev().take(4).collect::<Vec<_>>().into_iter().rev().collect();
            format!("****{}", tail)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vars(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    #[test]
    fn test_defaults_when_empty() {
        let settings = BotSettings::from_map(&HashMap::new());
        assert_eq!(settings.currency_pair, "XAUUSD");
        assert_eq!(settings.risk_percentage, dec!(1));
        assert_eq!(settings.default_position_size, dec!(0.01));
        assert!(!settings.mt5_enabled);
        assert!(settings.telegram_bot_token.is_none());
    }

    #[test]
    fn test_reads_values() {
        let settings = BotSettings::from_map(&vars(&[
            ("TELEGRAM_BOT_TOKEN", "123:abc"),
            ("CURRENCY_PAIR", "EURUSD"),
            ("RISK_PERCENTAGE", "2.5"),
            ("MT5_ENABLED", "True"),
            ("MT5_AUTO_TRADE", "0"),
        ]));
        assert_eq!(settings.telegram_bot_token.as_deref(), Some("123:abc"));
        assert_eq!(settings.currency_pair, "EURUSD");
        assert_eq!(settings.risk_percentage, dec!(2.5));
        assert!(settings.mt5_enabled);
        assert!(!settings.mt5_auto_trade);
    }

    #[test]
    fn test_invalid_values_fall_back() {
        let settings = BotSettings::from_map(&vars(&[
            ("RISK_PERCENTAGE", "lots"),
            ("MT5_ENABLED", "maybe"),
            ("CURRENCY_PAIR", "   "),
        ]));
        assert_eq!(settings.risk_percentage, dec!(1));
        assert!(!settings.mt5_enabled);
        assert_eq!(settings.currency_pair, "XAUUSD");
    }

    #[test]
    fn test_mask() {
        assert_eq!(mask(None), "(not set)");
        assert_eq!(mask(Some("abc")), "****");
        assert_eq!(mask(Some("123456:secret")), "****cret");
    }
}
