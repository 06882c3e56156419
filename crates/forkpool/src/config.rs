//! Manager and coordination configuration.

use std::net::Ipv4Addr;
use std::time::Duration;

use crate::error::ForkError;

pub const DEFAULT_MAX_FORKS: usize = 7;
pub const DEFAULT_WAIT_TIMEOUT: Duration = Duration::from_secs(36_000);
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(50);
pub const DEFAULT_MAX_POLL_INTERVAL: Duration = Duration::from_secs(1);

pub const DEFAULT_COORDINATION_PORT: u16 = 8020;
pub const DEFAULT_PORT_ATTEMPTS: u16 = 64;
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Where the coordination server listens and how clients talk to it.
#[derive(Debug, Clone)]
pub struct CoordinationConfig {
    pub host: Ipv4Addr,
    /// First port tried; each bind conflict moves one port up.
    pub port: u16,
    pub port_attempts: u16,
    pub request_timeout: Duration,
}

impl Default for CoordinationConfig {
    fn default() -> Self {
        Self {
            host: Ipv4Addr::LOCALHOST,
            port: DEFAULT_COORDINATION_PORT,
            port_attempts: DEFAULT_PORT_ATTEMPTS,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }
}

impl CoordinationConfig {
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn with_port_attempts(mut self, attempts: u16) -> Self {
        self.port_attempts = attempts.max(1);
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }
}

#[derive(Debug, Clone)]
pub struct ForkManagerConfig {
    /// Upper bound on forks in progress at once.
    pub max_forks: usize,
    /// How long a fork may stay in progress before it is failed.
    pub wait_timeout: Duration,
    /// Use real process forks when the platform has them.
    pub use_async: bool,
    pub poll_interval: Duration,
    /// Ceiling for the poll back-off.
    pub max_poll_interval: Duration,
    /// Make `await_forks` return an error when any fork times out.
    pub strict_timeouts: bool,
    /// Catch SIGINT/SIGTERM while awaiting and shut forks down.
    pub handle_interrupts: bool,
    pub coordination: CoordinationConfig,
}

impl Default for ForkManagerConfig {
    fn default() -> Self {
        Self {
            max_forks: DEFAULT_MAX_FORKS,
            wait_timeout: DEFAULT_WAIT_TIMEOUT,
            use_async: true,
            poll_interval: DEFAULT_POLL_INTERVAL,
            max_poll_interval: DEFAULT_MAX_POLL_INTERVAL,
            strict_timeouts: false,
            handle_interrupts: true,
            coordination: CoordinationConfig::default(),
        }
    }
}

impl ForkManagerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Defaults overridden by `FORKPOOL_MAX_FORKS`, `FORKPOOL_WAIT_TIMEOUT` (seconds),
    /// `FORKPOOL_ASYNC` and `FORKPOOL_PORT`.
    pub fn from_env() -> Result<Self, ForkError> {
        let mut config = Self::default();

        if let Some(value) = env_var("FORKPOOL_MAX_FORKS") {
            let max = parse_var("FORKPOOL_MAX_FORKS", &value)?;
            config = config.with_max_forks(max);
        }
        if let Some(value) = env_var("FORKPOOL_WAIT_TIMEOUT") {
            let secs: f64 = parse_var("FORKPOOL_WAIT_TIMEOUT", &value)?;
            let timeout = Duration::try_from_secs_f64(secs).map_err(|_| ForkError::Config {
                var: "FORKPOOL_WAIT_TIMEOUT",
                value: value.clone(),
            })?;
            config = config.with_wait_timeout(timeout);
        }
        if let Some(value) = env_var("FORKPOOL_ASYNC") {
            let enabled = match value.to_ascii_lowercase().as_str() {
                "1" | "true" | "yes" | "on" => true,
                "0" | "false" | "no" | "off" => false,
                _ => {
                    return Err(ForkError::Config {
                        var: "FORKPOOL_ASYNC",
                        value,
                    });
                }
            };
            config = config.with_async(enabled);
        }
        if let Some(value) = env_var("FORKPOOL_PORT") {
            let port = parse_var("FORKPOOL_PORT", &value)?;
            config.coordination = config.coordination.with_port(port);
        }

        Ok(config)
    }

    pub fn with_max_forks(mut self, max: usize) -> Self {
        self.max_forks = max.max(1);
        self
    }

    pub fn with_wait_timeout(mut self, timeout: Duration) -> Self {
        self.wait_timeout = timeout;
        self
    }

    pub fn with_async(mut self, enabled: bool) -> Self {
        self.use_async = enabled;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_max_poll_interval(mut self, interval: Duration) -> Self {
        self.max_poll_interval = interval;
        self
    }

    pub fn with_strict_timeouts(mut self, strict: bool) -> Self {
        self.strict_timeouts = strict;
        self
    }

    pub fn with_interrupt_handling(mut self, enabled: bool) -> Self {
        self.handle_interrupts = enabled;
        self
    }

    pub fn with_coordination(mut self, coordination: CoordinationConfig) -> Self {
        self.coordination = coordination;
        self
    }
}

fn env_var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

fn parse_var<T: std::str::FromStr>(var: &'static str, value: &str) -> Result<T, ForkError> {
    value.trim().parse().map_err(|_| ForkError::Config {
        var,
        value: value.to_string(),
    })
}
