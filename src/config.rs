use std::env;
use std::str::FromStr;
use std::time::Duration;

/// Largest body the port side accepts, in bytes.
pub const MAX_CONTENT_LENGTH: u16 = 32768;

/// Capacities of the three cross-context queues.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueSizes {
    /// Request-start descriptors.
    pub requests: usize,
    /// Body chunks. Kept small, the BUSY status throttles the producer.
    pub body: usize,
    /// Response chunks. Must absorb bursts while the consumer parses.
    pub inbound: usize,
}

impl Default for QueueSizes {
    fn default() -> Self {
        QueueSizes {
            requests: 2,
            body: 2,
            inbound: 8,
        }
    }
}

#[derive(Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub path: String,
    /// Bearer credential for the `Authorization` header.
    pub api_key: String,
    /// Spans every state from resolution to the last byte received.
    pub request_timeout: Duration,
    pub resolve_timeout: Duration,
    pub max_content_length: u16,
    pub queues: QueueSizes,
    /// Capacity of the decrypted response buffer.
    pub response_buffer: usize,
    /// Skip server certificate verification.
    pub insecure: bool,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            host: "api.openai.com".to_string(),
            port: 443,
            path: "/v1/chat/completions".to_string(),
            api_key: String::new(),
            request_timeout: Duration::from_secs(90),
            resolve_timeout: Duration::from_secs(10),
            max_content_length: MAX_CONTENT_LENGTH,
            queues: QueueSizes::default(),
            response_buffer: 2048,
            insecure: false,
        }
    }
}

impl Config {
    /// Defaults overridden by environment variables.
    pub fn from_env() -> Self {
        let default = Config::default();

        let config = Config {
            host: env::var("CHATPORT_HOST").unwrap_or(default.host),
            port: parse_var("CHATPORT_PORT").unwrap_or(default.port),
            path: env::var("CHATPORT_PATH").unwrap_or(default.path),
            api_key: env::var("OPENAI_API_KEY").unwrap_or(default.api_key),
            request_timeout: parse_var("CHATPORT_TIMEOUT_MS")
                .map(Duration::from_millis)
                .unwrap_or(default.request_timeout),
            resolve_timeout: parse_var("CHATPORT_RESOLVE_TIMEOUT_MS")
                .map(Duration::from_millis)
                .unwrap_or(default.resolve_timeout),
            insecure: parse_var::<u8>("CHATPORT_INSECURE").map_or(default.insecure, |v| v != 0),
            ..default
        };

        if config.api_key.is_empty() {
            warn!("OPENAI_API_KEY is not set, requests will be unauthenticated");
        }

        config
    }

    /// `Host` header value. The port is left out when it is the TLS default.
    pub(crate) fn authority(&self) -> String {
        if self.port == 443 {
            self.host.clone()
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}

fn parse_var<T: FromStr>(name: &str) -> Option<T> {
    let value = env::var(name).ok()?;
    match value.trim().parse() {
        Ok(v) => Some(v),
        Err(_) => {
            warn!("Ignoring unparsable {}={:?}", name, value);
            None
        }
    }
}

impl core::fmt::Debug for Config {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Config")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("path", &self.path)
            .field("api_key", &if self.api_key.is_empty() { "" } else { "***" })
            .field("request_timeout", &self.request_timeout)
            .field("resolve_timeout", &self.resolve_timeout)
            .field("max_content_length", &self.max_content_length)
            .field("queues", &self.queues)
            .field("response_buffer", &self.response_buffer)
            .field("insecure", &self.insecure)
            .finish()
    }
}
