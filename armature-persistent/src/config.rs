//! Pool configuration.

use http::{HeaderMap, HeaderName, HeaderValue};
use std::time::Duration;

use crate::proxy::ProxySetting;
use crate::socket::SocketOption;
use crate::tls::TlsSettings;
use crate::{PoolError, Result};

/// Default idle timeout before a connection is reset instead of reused.
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(5);

/// Default `Keep-Alive` value advertised to servers, in seconds.
pub const DEFAULT_KEEP_ALIVE: u32 = 30;

/// Persistent pool configuration.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Pool name, used in log events.
    pub name: String,
    /// Reset connections idle for longer than this; `None` never expires.
    pub idle_timeout: Option<Duration>,
    /// Seconds advertised in the `Keep-Alive` header.
    pub keep_alive: u32,
    /// TCP connect timeout.
    pub open_timeout: Option<Duration>,
    /// Read and write timeout per attempt.
    pub read_timeout: Option<Duration>,
    /// Options applied to each socket when it connects.
    pub socket_options: Vec<SocketOption>,
    /// Headers appended to every request.
    pub headers: Vec<(HeaderName, HeaderValue)>,
    /// Headers replacing any request value of the same name.
    pub override_headers: HeaderMap,
    /// Proxy selection.
    pub proxy: ProxySetting,
    /// TLS parameters for `https` destinations.
    pub tls: TlsSettings,
    /// Retry non-idempotent requests too.
    pub retry_change_requests: bool,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            idle_timeout: Some(DEFAULT_IDLE_TIMEOUT),
            keep_alive: DEFAULT_KEEP_ALIVE,
            open_timeout: None,
            read_timeout: None,
            socket_options: SocketOption::defaults(),
            headers: Vec::new(),
            override_headers: HeaderMap::new(),
            proxy: ProxySetting::None,
            tls: TlsSettings::default(),
            retry_change_requests: false,
        }
    }
}

impl PoolConfig {
    /// Create a new configuration builder.
    pub fn builder() -> PoolConfigBuilder {
        PoolConfigBuilder::default()
    }

    /// Load from `<PREFIX>_*` environment variables on top of the defaults.
    ///
    /// Recognized keys: `NAME`, `PROXY`, `IDLE_TIMEOUT`, `KEEP_ALIVE`,
    /// `OPEN_TIMEOUT`, `READ_TIMEOUT` and `RETRY_CHANGE_REQUESTS`. Timeouts
    /// are seconds and may be fractional; `none` disables a timeout.
    pub fn from_env(prefix: &str) -> Result<Self> {
        Self::from_env_with(prefix, |key| std::env::var(key).ok())
    }

    /// Like [`PoolConfig::from_env`] with a custom lookup.
    pub fn from_env_with<F>(prefix: &str, lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |key: &str| {
            let full_key = if prefix.is_empty() {
                key.to_string()
            } else {
                format!("{}_{}", prefix.to_uppercase(), key)
            };
            lookup(&full_key).map(|value| (full_key, value.trim().to_string()))
        };

        let mut config = Self::default();
        if let Some((_, name)) = var("NAME") {
            config.name = name;
        }
        if let Some((_, proxy)) = var("PROXY") {
            config.proxy = proxy.parse()?;
        }
        if let Some((key, value)) = var("IDLE_TIMEOUT") {
            config.idle_timeout = parse_timeout(&key, &value)?;
        }
        if let Some((key, value)) = var("KEEP_ALIVE") {
            config.keep_alive = value
                .parse()
                .map_err(|_| invalid(&key, &value, "expected whole seconds"))?;
        }
        if let Some((key, value)) = var("OPEN_TIMEOUT") {
            config.open_timeout = parse_timeout(&key, &value)?;
        }
        if let Some((key, value)) = var("READ_TIMEOUT") {
            config.read_timeout = parse_timeout(&key, &value)?;
        }
        if let Some((key, value)) = var("RETRY_CHANGE_REQUESTS") {
            config.retry_change_requests = parse_bool(&key, &value)?;
        }
        Ok(config)
    }
}

fn invalid(key: &str, value: &str, reason: &str) -> PoolError {
    PoolError::Config(format!("{key}={value:?}: {reason}"))
}

fn parse_timeout(key: &str, value: &str) -> Result<Option<Duration>> {
    if value.is_empty() || value.eq_ignore_ascii_case("none") {
        return Ok(None);
    }
    let seconds: f64 = value
        .parse()
        .map_err(|_| invalid(key, value, "expected seconds"))?;
    Duration::try_from_secs_f64(seconds)
        .map(Some)
        .map_err(|_| invalid(key, value, "out of range"))
}

fn parse_bool(key: &str, value: &str) -> Result<bool> {
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(invalid(key, value, "expected a boolean")),
    }
}

/// Builder for pool configuration.
#[derive(Debug, Default)]
pub struct PoolConfigBuilder {
    config: PoolConfig,
}

impl PoolConfigBuilder {
    /// Set the pool name.
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.config.name = name.into();
        self
    }

    /// Set the idle timeout; `None` disables expiry, zero always resets.
    pub fn idle_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.config.idle_timeout = timeout;
        self
    }

    /// Set the advertised keep-alive, in seconds.
    pub fn keep_alive(mut self, seconds: u32) -> Self {
        self.config.keep_alive = seconds;
        self
    }

    /// Set the connect timeout.
    pub fn open_timeout(mut self, timeout: Duration) -> Self {
        self.config.open_timeout = Some(timeout);
        self
    }

    /// Set the per-attempt read timeout.
    pub fn read_timeout(mut self, timeout: Duration) -> Self {
        self.config.read_timeout = Some(timeout);
        self
    }

    /// Add a socket option.
    pub fn socket_option(mut self, option: SocketOption) -> Self {
        self.config.socket_options.push(option);
        self
    }

    /// Replace all socket options.
    pub fn socket_options(mut self, options: Vec<SocketOption>) -> Self {
        self.config.socket_options = options;
        self
    }

    /// Add a header appended to every request.
    pub fn header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.config.headers.push((name, value));
        self
    }

    /// Add a header that replaces request values of the same name.
    pub fn override_header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.config.override_headers.insert(name, value);
        self
    }

    /// Set the proxy.
    pub fn proxy(mut self, proxy: impl Into<ProxySetting>) -> Self {
        self.config.proxy = proxy.into();
        self
    }

    /// Set TLS parameters.
    pub fn tls(mut self, tls: TlsSettings) -> Self {
        self.config.tls = tls;
        self
    }

    /// Allow retrying non-idempotent requests.
    pub fn retry_change_requests(mut self, enable: bool) -> Self {
        self.config.retry_change_requests = enable;
        self
    }

    /// Build the configuration.
    pub fn build(self) -> PoolConfig {
        self.config
    }
}
