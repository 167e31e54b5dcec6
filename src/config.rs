use std::{env, path::PathBuf, time::Duration};

use crate::{error::BridgeError, normalize_path};

const DEFAULT_HOME: &str = "/home/user";

#[derive(Clone, Debug)]
pub(crate) struct BridgeConfig {
    pub(crate) host: String,
    pub(crate) port: u16,
    pub(crate) inbound_path: PathBuf,
    pub(crate) reply_path: PathBuf,
    pub(crate) claude_config_path: PathBuf,
    pub(crate) project_key: String,
    pub(crate) history_limit: usize,
    pub(crate) reply_max_attempts: u32,
    pub(crate) reply_poll_interval: Duration,
    pub(crate) monitor_poll_interval: Duration,
    pub(crate) monitor_enabled: bool,
    pub(crate) rate_limit: RateLimitConfig,
}

#[derive(Clone, Debug)]
pub(crate) struct RateLimitConfig {
    pub(crate) enabled: bool,
    pub(crate) max_per_minute: u32,
    pub(crate) max_per_hour: u32,
    pub(crate) cooldown: Duration,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_per_minute: 10,
            max_per_hour: 100,
            cooldown: Duration::from_millis(5_000),
        }
    }
}

impl BridgeConfig {
    pub(crate) fn from_env() -> Result<Self, BridgeError> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    pub(crate) fn from_lookup<F>(lookup: F) -> Result<Self, BridgeError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |name: &str| {
            lookup(name)
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        };
        let flag = |name: &str| {
            var(name)
                .map(|value| value.eq_ignore_ascii_case("true"))
                .unwrap_or(false)
        };
        let number = |name: &str, fallback: u64| {
            var(name)
                .and_then(|value| value.parse::<u64>().ok())
                .unwrap_or(fallback)
        };

        let host = var("BRIDGE_HOST").unwrap_or_else(|| "0.0.0.0".to_string());
        let port = var("BRIDGE_PORT")
            .and_then(|v| v.parse::<u16>().ok())
            .unwrap_or(3001);

        let home = var("BRIDGE_HOME")
            .or_else(|| var("HOME"))
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_HOME));
        let home = normalize_path(&home);
        if !home.is_absolute() {
            return Err(BridgeError::Config(format!(
                "BRIDGE_HOME must be an absolute path, got {}",
                home.display()
            )));
        }

        let path_or = |name: &str, file_name: &str| {
            var(name)
                .map(|raw| normalize_path(&home.join(raw)))
                .unwrap_or_else(|| home.join(file_name))
        };

        let inbound_path = path_or("BRIDGE_INBOUND_PATH", "whatsapp_messages.json");
        let reply_path = path_or("BRIDGE_REPLY_PATH", "claude_response.json");
        let claude_config_path = path_or("BRIDGE_CLAUDE_CONFIG_PATH", ".claude.json");
        let project_key =
            var("BRIDGE_PROJECT_KEY").unwrap_or_else(|| home.to_string_lossy().to_string());

        if inbound_path == reply_path
            || reply_path == claude_config_path
            || inbound_path == claude_config_path
        {
            return Err(BridgeError::Config(
                "inbound, reply and claude config paths must be distinct".to_string(),
            ));
        }

        let history_limit = number("BRIDGE_HISTORY_LIMIT", 100).max(1) as usize;
        let reply_max_attempts =
            number("BRIDGE_REPLY_MAX_ATTEMPTS", 120).min(u32::MAX as u64) as u32;
        let reply_poll_interval =
            Duration::from_millis(number("BRIDGE_REPLY_POLL_MS", 1_000).max(10));
        let monitor_poll_interval =
            Duration::from_millis(number("BRIDGE_MONITOR_POLL_MS", 2_000).max(10));

        let defaults = RateLimitConfig::default();
        let rate_limit = RateLimitConfig {
            enabled: !flag("BRIDGE_DISABLE_RATE_LIMIT"),
            max_per_minute: number(
                "BRIDGE_RATE_LIMIT_PER_MINUTE",
                defaults.max_per_minute as u64,
            )
            .min(u32::MAX as u64) as u32,
            max_per_hour: number("BRIDGE_RATE_LIMIT_PER_HOUR", defaults.max_per_hour as u64)
                .min(u32::MAX as u64) as u32,
            cooldown: Duration::from_millis(number(
                "BRIDGE_RATE_LIMIT_COOLDOWN_MS",
                defaults.cooldown.as_millis() as u64,
            )),
        };

        Ok(Self {
            host,
            port,
            inbound_path,
            reply_path,
            claude_config_path,
            project_key,
            history_limit,
            reply_max_attempts,
            reply_poll_interval,
            monitor_poll_interval,
            monitor_enabled: !flag("BRIDGE_DISABLE_MONITOR"),
            rate_limit,
        })
    }

    pub(crate) fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[cfg(test)]
pub(crate) fn test_config(home: &std::path::Path) -> BridgeConfig {
    BridgeConfig {
        host: "127.0.0.1".to_string(),
        port: 0,
        inbound_path: home.join("whatsapp_messages.json"),
        reply_path: home.join("claude_response.json"),
        claude_config_path: home.join(".claude.json"),
        project_key: home.to_string_lossy().to_string(),
        history_limit: 100,
        reply_max_attempts: 3,
        reply_poll_interval: Duration::from_millis(20),
        monitor_poll_interval: Duration::from_millis(20),
        monitor_enabled: false,
        rate_limit: RateLimitConfig {
            enabled: false,
            ..RateLimitConfig::default()
        },
    }
}
