/// Configuration management
use crate::error::{ChatError, Result};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::time::Duration;

const DEFAULT_PAGE_SIZE: u32 = 20;

/// Client configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// REST API origin, e.g. `https://api.example.com`
    pub api_origin: String,

    /// Message bus address (`host:port`)
    pub bus_addr: String,

    /// Virtual host sent in the STOMP CONNECT frame
    pub bus_host: String,

    /// Connect + handshake timeout
    pub connection_timeout: Duration,

    /// Fixed delay between reconnect attempts
    pub reconnect_delay: Duration,

    /// Heartbeat interval we offer in both directions
    pub heartbeat_interval: Duration,

    /// Page size for conversation and message history requests
    pub page_size: u32,

    /// Expected user id; the session must belong to this user when set
    pub user_id: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            api_origin: "http://127.0.0.1:8080".to_string(),
            bus_addr: "127.0.0.1:61613".to_string(),
            bus_host: "/".to_string(),
            connection_timeout: Duration::from_secs(10),
            reconnect_delay: Duration::from_secs(5),
            heartbeat_interval: Duration::from_secs(4),
            page_size: DEFAULT_PAGE_SIZE,
            user_id: None,
        }
    }
}

impl Config {
    /// Create config from command line arguments
    pub fn from_args(args: &[String]) -> Result<Self> {
        if args.len() < 3 {
            return Err(ChatError::Config(format!(
                "Usage: {} <api-origin> <bus-addr> [--user <id>] [--page-size <n>] [--reconnect-ms <ms>] [--heartbeat-ms <ms>]",
                args.first().map(String::as_str).unwrap_or("marketchat")
            )));
        }

        let api_origin = args[1].trim_end_matches('/').to_string();
        if !api_origin.starts_with("http://") && !api_origin.starts_with("https://") {
            return Err(ChatError::Config(
                "API origin must start with http:// or https://".to_string(),
            ));
        }
        let bus_addr = args[2].clone();

        let mut config = Self {
            api_origin,
            bus_addr,
            ..Default::default()
        };

        let mut i = 3;
        while i < args.len() {
            let flag = args[i].as_str();
            let value = args.get(i + 1).ok_or_else(|| {
                ChatError::Config(format!("{} requires an argument", flag))
            })?;
            match flag {
                "--user" => config.user_id = Some(value.clone()),
                "--page-size" => config.page_size = parse_number(flag, value)?,
                "--reconnect-ms" => {
                    config.reconnect_delay = Duration::from_millis(parse_number(flag, value)?)
                }
                "--heartbeat-ms" => {
                    config.heartbeat_interval = Duration::from_millis(parse_number(flag, value)?)
                }
                "--bus-host" => config.bus_host = value.clone(),
                other => {
                    return Err(ChatError::Config(format!("Unknown flag: {}", other)));
                }
            }
            i += 2;
        }

        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    /// Env overrides (nice for scripts)
    fn apply_env(&mut self) {
        if let Ok(user) = std::env::var("MARKETCHAT_USER") {
            if !user.is_empty() {
                self.user_id = Some(user);
            }
        }
        if let Some(n) = std::env::var("MARKETCHAT_PAGE_SIZE")
            .ok()
            .and_then(|s| s.parse::<u32>().ok())
        {
            self.page_size = n;
        }
        if let Some(ms) = std::env::var("MARKETCHAT_RECONNECT_MS")
            .ok()
            .and_then(|s| s.parse::<u64>().ok())
        {
            self.reconnect_delay = Duration::from_millis(ms);
        }
    }

    fn validate(&self) -> Result<()> {
        if self.page_size == 0 {
            return Err(ChatError::Config("Page size must be positive".to_string()));
        }
        if self.reconnect_delay.is_zero() {
            return Err(ChatError::Config(
                "Reconnect delay must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

fn parse_number<T: FromStr>(flag: &str, value: &str) -> Result<T> {
    value
        .parse::<T>()
        .map_err(|_| ChatError::Config(format!("{} must be a valid number", flag)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_from_args_flags() {
        let config = Config::from_args(&args(&[
            "marketchat",
            "https://api.example.com/",
            "bus.example.com:61613",
            "--page-size",
            "50",
            "--reconnect-ms",
            "250",
        ]))
        .unwrap();
        assert_eq!(config.api_origin, "https://api.example.com");
        assert_eq!(config.bus_addr, "bus.example.com:61613");
        assert_eq!(config.page_size, 50);
        assert_eq!(config.reconnect_delay, Duration::from_millis(250));
    }

    #[test]
    fn test_from_args_rejects_bad_input() {
        assert!(Config::from_args(&args(&["marketchat"])).is_err());
        assert!(Config::from_args(&args(&["marketchat", "ftp://x", "b:1"])).is_err());
        assert!(Config::from_args(&args(&[
            "marketchat",
            "http://x",
            "b:1",
            "--page-size"
        ]))
        .is_err());
        assert!(Config::from_args(&args(&[
            "marketchat",
            "http://x",
            "b:1",
            "--page-size",
            "abc"
        ]))
        .is_err());
        // u32::MAX + 2 must not wrap around to 1
        assert!(Config::from_args(&args(&[
            "marketchat",
            "http://x",
            "b:1",
            "--page-size",
            "4294967297"
        ]))
        .is_err());
    }
}
