use crate::error::{NsqError, Result};
use std::time::Duration;

/// Stream compression negotiated with nsqd during IDENTIFY.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Compression {
    #[default]
    None,
    /// Raw DEFLATE at the given level (1..=9).
    Deflate { level: u32 },
    Snappy,
}

/// Options shared by readers and writers for the connection handshake.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    pub heartbeat_interval: Duration,
    pub tls: bool,
    pub tls_verification: bool,
    pub compression: Compression,
    pub auth_secret: Option<String>,
    pub client_id: Option<String>,
    pub hostname: Option<String>,
    pub user_agent: String,
    /// Bytes nsqd buffers before flushing to this client; `-1` disables buffering.
    pub output_buffer_size: Option<i64>,
    /// Milliseconds nsqd waits before flushing buffered data; `-1` disables
    /// the timeout.
    pub output_buffer_timeout: Option<i64>,
    pub dial_timeout: Duration,
    pub read_timeout: Duration,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(30),
            tls: false,
            tls_verification: true,
            compression: Compression::None,
            auth_secret: None,
            client_id: None,
            hostname: None,
            user_agent: format!("nsq-client/{}", env!("CARGO_PKG_VERSION")),
            output_buffer_size: None,
            output_buffer_timeout: None,
            dial_timeout: Duration::from_secs(1),
            read_timeout: Duration::from_secs(60),
        }
    }
}

impl ConnectionConfig {
    pub fn validate(&self) -> Result<()> {
        if self.heartbeat_interval < Duration::from_secs(1) {
            return Err(NsqError::Validation(
                "heartbeat_interval must be at least 1s".to_string(),
            ));
        }
        if let Compression::Deflate { level } = self.compression {
            if !(1..=9).contains(&level) {
                return Err(NsqError::Validation(format!(
                    "deflate level must be between 1 and 9, got {level}"
                )));
            }
        }
        if let Some(size) = self.output_buffer_size {
            if size != -1 && size < 64 {
                return Err(NsqError::Validation(
                    "output_buffer_size must be -1 or at least 64".to_string(),
                ));
            }
        }
        if let Some(timeout) = self.output_buffer_timeout {
            if timeout != -1 && timeout < 1 {
                return Err(NsqError::Validation(
                    "output_buffer_timeout must be -1 or at least 1ms".to_string(),
                ));
            }
        }
        if self.dial_timeout.is_zero() || self.read_timeout.is_zero() {
            return Err(NsqError::Validation(
                "dial_timeout and read_timeout must be non-zero".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct ReaderConfig {
    pub connection: ConnectionConfig,
    /// Messages in flight across every nsqd connection of the reader.
    pub max_in_flight: u64,
    pub max_backoff_duration: Duration,
    pub backoff_base: Duration,
    /// Random fraction applied on either side of each backoff wait.
    pub backoff_jitter: f64,
    /// Consecutive successes needed to drop one backoff tier.
    pub backoff_success_streak: u32,
    /// Attempts after which a message is discarded; `0` means unlimited.
    pub max_attempts: u16,
    pub requeue_delay: Duration,
    pub nsqd_tcp_addresses: Vec<String>,
    pub lookupd_http_addresses: Vec<String>,
    pub lookupd_poll_interval: Duration,
    pub lookupd_poll_jitter: f64,
    pub lookupd_request_timeout: Duration,
    /// Server-side message timeout requested in IDENTIFY.
    pub message_timeout: Option<Duration>,
    /// Percentage of the channel's messages delivered to this client; `0` means all.
    pub sample_rate: u8,
    pub reconnect_base: Duration,
    pub reconnect_max: Duration,
    /// Fraction of the last RDY grant below which a connection is refilled.
    pub rdy_low_water_mark: f64,
    pub rdy_redistribute_interval: Duration,
}

impl Default for ReaderConfig {
    fn default() -> Self {
        Self {
            connection: ConnectionConfig::default(),
            max_in_flight: 1,
            max_backoff_duration: Duration::from_secs(128),
            backoff_base: Duration::from_secs(1),
            backoff_jitter: 0.3,
            backoff_success_streak: 1,
            max_attempts: 0,
            requeue_delay: Duration::from_secs(90),
            nsqd_tcp_addresses: Vec::new(),
            lookupd_http_addresses: Vec::new(),
            lookupd_poll_interval: Duration::from_secs(60),
            lookupd_poll_jitter: 0.3,
            lookupd_request_timeout: Duration::from_secs(5),
            message_timeout: None,
            sample_rate: 0,
            reconnect_base: Duration::from_secs(1),
            reconnect_max: Duration::from_secs(60),
            rdy_low_water_mark: 0.25,
            rdy_redistribute_interval: Duration::from_secs(5),
        }
    }
}

impl ReaderConfig {
    pub fn validate(&self) -> Result<()> {
        self.connection.validate()?;

        if self.max_in_flight == 0 {
            return Err(NsqError::Validation(
                "max_in_flight must be greater than 0".to_string(),
            ));
        }
        if self.nsqd_tcp_addresses.is_empty() && self.lookupd_http_addresses.is_empty() {
            return Err(NsqError::Validation(
                "nsqd_tcp_addresses or lookupd_http_addresses must be set".to_string(),
            ));
        }
        if !self.nsqd_tcp_addresses.is_empty() && !self.lookupd_http_addresses.is_empty() {
            return Err(NsqError::Validation(
                "nsqd_tcp_addresses and lookupd_http_addresses are mutually exclusive".to_string(),
            ));
        }
        for addr in &self.nsqd_tcp_addresses {
            let valid = matches!(
                addr.rsplit_once(':'),
                Some((host, port)) if !host.is_empty() && port.parse::<u16>().is_ok()
            );
            if !valid {
                return Err(NsqError::Validation(format!(
                    "nsqd address {addr:?} must be host:port"
                )));
            }
        }
        if self.lookupd_request_timeout.is_zero() {
            return Err(NsqError::Validation(
                "lookupd_request_timeout must be non-zero".to_string(),
            ));
        }
        if self.rdy_redistribute_interval.is_zero() {
            return Err(NsqError::Validation(
                "rdy_redistribute_interval must be non-zero".to_string(),
            ));
        }
        if self.lookupd_poll_interval < Duration::from_secs(1) {
            return Err(NsqError::Validation(
                "lookupd_poll_interval must be at least 1s".to_string(),
            ));
        }
        for (name, value) in [
            ("lookupd_poll_jitter", self.lookupd_poll_jitter),
            ("backoff_jitter", self.backoff_jitter),
            ("rdy_low_water_mark", self.rdy_low_water_mark),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(NsqError::Validation(format!(
                    "{name} must be between 0 and 1, got {value}"
                )));
            }
        }
        if self.backoff_base.is_zero() || self.backoff_base > self.max_backoff_duration {
            return Err(NsqError::Validation(
                "backoff_base must be non-zero and not exceed max_backoff_duration".to_string(),
            ));
        }
        if self.backoff_success_streak == 0 {
            return Err(NsqError::Validation(
                "backoff_success_streak must be at least 1".to_string(),
            ));
        }
        if self.sample_rate > 99 {
            return Err(NsqError::Validation(
                "sample_rate must be between 0 and 99".to_string(),
            ));
        }
        if let Some(timeout) = self.message_timeout {
            if timeout < Duration::from_secs(1) {
                return Err(NsqError::Validation(
                    "message_timeout must be at least 1s".to_string(),
                ));
            }
        }
        if self.reconnect_base.is_zero() || self.reconnect_base > self.reconnect_max {
            return Err(NsqError::Validation(
                "reconnect_base must be non-zero and not exceed reconnect_max".to_string(),
            ));
        }
        Ok(())
    }
}

pub struct ReaderConfigBuilder {
    config: ReaderConfig,
}

impl ReaderConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: ReaderConfig::default(),
        }
    }

    pub fn max_in_flight(mut self, max_in_flight: u64) -> Self {
        self.config.max_in_flight = max_in_flight;
        self
    }

    pub fn heartbeat_interval(mut self, interval: Duration) -> Self {
        self.config.connection.heartbeat_interval = interval;
        self
    }

    pub fn max_backoff_duration(mut self, duration: Duration) -> Self {
        self.config.max_backoff_duration = duration;
        self
    }

    pub fn backoff_base(mut self, base: Duration) -> Self {
        self.config.backoff_base = base;
        self
    }

    pub fn backoff_jitter(mut self, jitter: f64) -> Self {
        self.config.backoff_jitter = jitter;
        self
    }

    pub fn backoff_success_streak(mut self, streak: u32) -> Self {
        self.config.backoff_success_streak = streak;
        self
    }

    pub fn max_attempts(mut self, attempts: u16) -> Self {
        self.config.max_attempts = attempts;
        self
    }

    pub fn requeue_delay(mut self, delay: Duration) -> Self {
        self.config.requeue_delay = delay;
        self
    }

    pub fn nsqd_tcp_address(mut self, addr: impl Into<String>) -> Self {
        self.config.nsqd_tcp_addresses.push(addr.into());
        self
    }

    pub fn nsqd_tcp_addresses<I, S>(mut self, addrs: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.config
            .nsqd_tcp_addresses
            .extend(addrs.into_iter().map(Into::into));
        self
    }

    pub fn lookupd_http_address(mut self, addr: impl Into<String>) -> Self {
        self.config.lookupd_http_addresses.push(addr.into());
        self
    }

    pub fn lookupd_http_addresses<I, S>(mut self, addrs: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.config
            .lookupd_http_addresses
            .extend(addrs.into_iter().map(Into::into));
        self
    }

    pub fn lookupd_poll_interval(mut self, interval: Duration) -> Self {
        self.config.lookupd_poll_interval = interval;
        self
    }

    pub fn lookupd_poll_jitter(mut self, jitter: f64) -> Self {
        self.config.lookupd_poll_jitter = jitter;
        self
    }

    pub fn lookupd_request_timeout(mut self, timeout: Duration) -> Self {
        self.config.lookupd_request_timeout = timeout;
        self
    }

    pub fn tls(mut self, enabled: bool) -> Self {
        self.config.connection.tls = enabled;
        self
    }

    pub fn tls_verification(mut self, verify: bool) -> Self {
        self.config.connection.tls_verification = verify;
        self
    }

    pub fn compression(mut self, compression: Compression) -> Self {
        self.config.connection.compression = compression;
        self
    }

    pub fn auth_secret(mut self, secret: impl Into<String>) -> Self {
        self.config.connection.auth_secret = Some(secret.into());
        self
    }

    pub fn output_buffer_size(mut self, size: i64) -> Self {
        self.config.connection.output_buffer_size = Some(size);
        self
    }

    pub fn output_buffer_timeout(mut self, timeout: Duration) -> Self {
        self.config.connection.output_buffer_timeout = Some(timeout.as_millis() as i64);
        self
    }

    /// Asks nsqd to flush only when its output buffer is full.
    pub fn disable_output_buffer_timeout(mut self) -> Self {
        self.config.connection.output_buffer_timeout = Some(-1);
        self
    }

    pub fn message_timeout(mut self, timeout: Duration) -> Self {
        self.config.message_timeout = Some(timeout);
        self
    }

    pub fn sample_rate(mut self, rate: u8) -> Self {
        self.config.sample_rate = rate;
        self
    }

    pub fn client_id(mut self, client_id: impl Into<String>) -> Self {
        self.config.connection.client_id = Some(client_id.into());
        self
    }

    pub fn hostname(mut self, hostname: impl Into<String>) -> Self {
        self.config.connection.hostname = Some(hostname.into());
        self
    }

    pub fn user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.config.connection.user_agent = user_agent.into();
        self
    }

    pub fn dial_timeout(mut self, timeout: Duration) -> Self {
        self.config.connection.dial_timeout = timeout;
        self
    }

    pub fn read_timeout(mut self, timeout: Duration) -> Self {
        self.config.connection.read_timeout = timeout;
        self
    }

    pub fn reconnect_base(mut self, delay: Duration) -> Self {
        self.config.reconnect_base = delay;
        self
    }

    pub fn reconnect_max(mut self, delay: Duration) -> Self {
        self.config.reconnect_max = delay;
        self
    }

    pub fn rdy_low_water_mark(mut self, fraction: f64) -> Self {
        self.config.rdy_low_water_mark = fraction;
        self
    }

    pub fn rdy_redistribute_interval(mut self, interval: Duration) -> Self {
        self.config.rdy_redistribute_interval = interval;
        self
    }

    pub fn build(self) -> ReaderConfig {
        self.config
    }
}

impl Default for ReaderConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone)]
pub struct WriterConfig {
    pub host: String,
    pub port: u16,
    pub connection: ConnectionConfig,
}

impl Default for WriterConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 4150,
            connection: ConnectionConfig::default(),
        }
    }
}

impl WriterConfig {
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn validate(&self) -> Result<()> {
        if self.host.is_empty() {
            return Err(NsqError::Validation("host must not be empty".to_string()));
        }
        self.connection.validate()
    }
}

pub struct WriterConfigBuilder {
    config: WriterConfig,
}

impl WriterConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: WriterConfig::default(),
        }
    }

    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.config.host = host.into();
        self
    }

    pub fn port(mut self, port: u16) -> Self {
        self.config.port = port;
        self
    }

    pub fn heartbeat_interval(mut self, interval: Duration) -> Self {
        self.config.connection.heartbeat_interval = interval;
        self
    }

    pub fn tls(mut self, enabled: bool) -> Self {
        self.config.connection.tls = enabled;
        self
    }

    pub fn tls_verification(mut self, verify: bool) -> Self {
        self.config.connection.tls_verification = verify;
        self
    }

    pub fn compression(mut self, compression: Compression) -> Self {
        self.config.connection.compression = compression;
        self
    }

    pub fn auth_secret(mut self, secret: impl Into<String>) -> Self {
        self.config.connection.auth_secret = Some(secret.into());
        self
    }

    pub fn client_id(mut self, client_id: impl Into<String>) -> Self {
        self.config.connection.client_id = Some(client_id.into());
        self
    }

    pub fn dial_timeout(mut self, timeout: Duration) -> Self {
        self.config.connection.dial_timeout = timeout;
        self
    }

    pub fn read_timeout(mut self, timeout: Duration) -> Self {
        self.config.connection.read_timeout = timeout;
        self
    }

    pub fn build(self) -> WriterConfig {
        self.config
    }
}

impl Default for WriterConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}
