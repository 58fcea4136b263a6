//! Environment-driven configuration.
//!
//! Every value can come from the process environment (or a `.env` file loaded
//! by the binary). Blank values are treated as unset.

use std::path::PathBuf;
use std::time::Duration;

use crate::auth::Credentials;
use crate::protocol::{
    ChatParameter, Fragment, MessageText, OutboundEnvelope, Parameter, RequestHeader,
    RequestPayload,
};

pub const DEFAULT_HOST: &str = "spark-api.xf-yun.com";
pub const DEFAULT_PATH: &str = "/v1.1/chat";

fn env_value(key: &str) -> Option<String> {
    std::env::var(key).ok().and_then(|value| {
        let trimmed = value.trim();
        (!trimmed.is_empty()).then(|| trimmed.to_string())
    })
}

/// Where to connect and how to address the chat model
#[derive(Debug, Clone, PartialEq)]
pub struct ServiceConfig {
    pub host: String,
    pub path: String,
    pub app_id: String,
    /// Placeholder user id sent in every request header
    pub uid: String,
    pub domain: String,
    pub temperature: f32,
    pub top_k: Option<u32>,
    /// Resolver service to ask for signed URLs; `None` signs locally
    pub resolver_url: Option<String>,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            path: DEFAULT_PATH.to_string(),
            app_id: String::new(),
            uid: "1234".to_string(),
            domain: "general".to_string(),
            temperature: 0.5,
            top_k: None,
            resolver_url: None,
        }
    }
}

impl ServiceConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            host: env_value("SPARK_HOST").unwrap_or(defaults.host),
            path: env_value("SPARK_PATH").unwrap_or(defaults.path),
            app_id: env_value("APP_ID").unwrap_or(defaults.app_id),
            uid: env_value("UID").unwrap_or(defaults.uid),
            domain: env_value("SERVICE_DOMAIN").unwrap_or(defaults.domain),
            temperature: env_value("TEMPERATURE")
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.temperature),
            top_k: env_value("TOP_K").and_then(|s| s.parse().ok()),
            resolver_url: env_value("RESOLVER_URL"),
        }
    }

    /// Build the request envelope carrying `content` as the only user fragment
    pub fn envelope(&self, content: &str) -> OutboundEnvelope {
        OutboundEnvelope {
            header: RequestHeader {
                app_id: self.app_id.clone(),
                uid: self.uid.clone(),
            },
            parameter: Parameter {
                chat: ChatParameter {
                    domain: self.domain.clone(),
                    temperature: self.temperature,
                    top_k: self.top_k,
                },
            },
            payload: RequestPayload {
                message: MessageText {
                    text: vec![Fragment::user(content)],
                },
            },
        }
    }
}

impl Credentials {
    /// Load API_KEY / API_SECRET; missing values become empty strings
    pub fn from_env() -> Self {
        let credentials = Self {
            api_key: env_value("API_KEY").unwrap_or_default(),
            api_secret: env_value("API_SECRET").unwrap_or_default(),
        };
        if !credentials.is_complete() {
            tracing::warn!("API_KEY and API_SECRET should both be set; signed URLs will be rejected");
        }
        credentials
    }
}

/// Reconnection policy for the connection manager
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectionConfig {
    /// Reconnect attempts after a close before giving up
    pub max_retries: u32,
    /// Delay before the first reconnect; doubles on every attempt
    pub base_delay: Duration,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            max_retries: 5,
            base_delay: Duration::from_secs(1),
        }
    }
}

impl ConnectionConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            max_retries: env_value("WS_MAX_RETRIES")
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.max_retries),
            base_delay: env_value("WS_BASE_DELAY_MS")
                .and_then(|s| s.parse().ok())
                .map(Duration::from_millis)
                .unwrap_or(defaults.base_delay),
        }
    }

    /// Delay before reconnect attempt `attempt` (0-indexed): base * 2^attempt
    pub fn backoff(&self, attempt: u32) -> Duration {
        self.base_delay.saturating_mul(2u32.saturating_pow(attempt))
    }
}

/// Directory holding persisted conversation histories
pub fn history_dir_from_env() -> PathBuf {
    env_value("HISTORY_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("history"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    fn test_default_config() {
        let config = ServiceConfig::default();
        assert_eq!(config.host, "spark-api.xf-yun.com");
        assert_eq!(config.path, "/v1.1/chat");
        assert_eq!(config.temperature, 0.5);
        assert!(config.top_k.is_none());
    }

    #[test]
    fn test_backoff_doubles() {
        let config = ConnectionConfig::default();
        let delays: Vec<u64> = (0..5).map(|k| config.backoff(k).as_secs()).collect();
        assert_eq!(delays, vec![1, 2, 4, 8, 16]);
    }

    #[test]
    fn test_envelope_embeds_single_user_fragment() {
        let config = ServiceConfig {
            app_id: "a28e68da".to_string(),
            top_k: Some(4),
            ..ServiceConfig::default()
        };
        let envelope = config.envelope("Hi");
        assert_eq!(envelope.header.app_id, "a28e68da");
        assert_eq!(envelope.parameter.chat.top_k, Some(4));
        assert_eq!(envelope.payload.message.text, vec![Fragment::user("Hi")]);
    }

    #[test]
    #[serial]
    fn test_from_env_trims_and_ignores_blank() {
        std::env::set_var("SPARK_HOST", "  example.test  ");
        std::env::set_var("SERVICE_DOMAIN", "   ");
        std::env::set_var("TOP_K", "4");
        let config = ServiceConfig::from_env();
        std::env::remove_var("SPARK_HOST");
        std::env::remove_var("SERVICE_DOMAIN");
        std::env::remove_var("TOP_K");

        assert_eq!(config.host, "example.test");
        assert_eq!(config.domain, "general");
        assert_eq!(config.top_k, Some(4));
    }

    #[test]
    #[serial]
    fn test_connection_config_from_env() {
        std::env::set_var("WS_MAX_RETRIES", "2");
        std::env::set_var("WS_BASE_DELAY_MS", "250");
        let config = ConnectionConfig::from_env();
        std::env::remove_var("WS_MAX_RETRIES");
        std::env::remove_var("WS_BASE_DELAY_MS");

        assert_eq!(config.max_retries, 2);
        assert_eq!(config.backoff(1), Duration::from_millis(500));
    }
}
