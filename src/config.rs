//! Engine configuration.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use crate::error::{Error, Result};

/// Default time an outbound connection may take before it is abandoned.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_millis(3000);

/// Default pause between two iterations of the listen worker, and between two
/// connect attempts.
pub const DEFAULT_SLEEP_TIME: Duration = Duration::from_millis(10);

/// Default maximum number of bytes delivered by a single receive callback.
pub const DEFAULT_RECEIVE_BUFFER_SIZE: usize = 1024;

/// Initial settings of a [`TcpNode`](crate::TcpNode).
///
/// ```
/// use std::time::Duration;
/// use tcpnode::Config;
///
/// let config = Config::default()
///     .with_sleep_time(Duration::from_millis(5))
///     .with_connect_timeout(Duration::from_millis(500));
///
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Config {
    /// How long an outbound connection may take.
    pub connect_timeout: Duration,
    /// Polling interval of the workers.
    pub sleep_time: Duration,
    /// Maximum bytes per receive.
    pub receive_buffer_size: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            sleep_time: DEFAULT_SLEEP_TIME,
            receive_buffer_size: DEFAULT_RECEIVE_BUFFER_SIZE,
        }
    }
}

impl Config {
    /// Sets the connect timeout.
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Sets the polling interval.
    pub fn with_sleep_time(mut self, sleep: Duration) -> Self {
        self.sleep_time = sleep;
        self
    }

    /// Sets the receive buffer size.
    pub fn with_receive_buffer_size(mut self, size: usize) -> Self {
        self.receive_buffer_size = size;
        self
    }

    /// Checks that every value is usable.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] for a zero timeout, a zero sleep time
    /// or a zero receive buffer size.
    pub fn validate(&self) -> Result<()> {
        if self.connect_timeout.is_zero() {
            return Err(Error::InvalidConfig("connect timeout must be non-zero"));
        }
        if self.sleep_time.is_zero() {
            return Err(Error::InvalidConfig("sleep time must be non-zero"));
        }
        if self.receive_buffer_size == 0 {
            return Err(Error::InvalidConfig("receive buffer size must be non-zero"));
        }

        Ok(())
    }
}

/// Runtime form of [`Config`], readable by every worker without taking the
/// data lock.
#[derive(Debug)]
pub(crate) struct Settings {
    connect_timeout_ms: AtomicU64,
    sleep_time_ms: AtomicU64,
    receive_buffer_size: AtomicUsize,
}

impl Settings {
    pub(crate) fn new(config: &Config) -> Self {
        Self {
            connect_timeout_ms: AtomicU64::new(millis(config.connect_timeout)),
            sleep_time_ms: AtomicU64::new(millis(config.sleep_time)),
            receive_buffer_size: AtomicUsize::new(config.receive_buffer_size),
        }
    }

    pub(crate) fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms.load(Ordering::Relaxed))
    }

    pub(crate) fn set_connect_timeout(&self, timeout: Duration) {
        self.connect_timeout_ms.store(millis(timeout), Ordering::Relaxed);
    }

    pub(crate) fn sleep_time(&self) -> Duration {
        Duration::from_millis(self.sleep_time_ms.load(Ordering::Relaxed))
    }

    pub(crate) fn set_sleep_time(&self, sleep: Duration) {
        // A zero interval would turn the listen worker into a busy loop.
        self.sleep_time_ms.store(millis(sleep).max(1), Ordering::Relaxed);
    }

    pub(crate) fn receive_buffer_size(&self) -> usize {
        self.receive_buffer_size.load(Ordering::Relaxed)
    }

    pub(crate) fn set_receive_buffer_size(&self, size: usize) {
        self.receive_buffer_size.store(size.max(1), Ordering::Relaxed);
    }
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = Config::default();

        assert_eq!(config.connect_timeout, Duration::from_millis(3000));
        assert_eq!(config.sleep_time, Duration::from_millis(10));
        assert_eq!(config.receive_buffer_size, 1024);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn zero_values_are_rejected() {
        let zero_timeout = Config::default().with_connect_timeout(Duration::ZERO);
        let zero_sleep = Config::default().with_sleep_time(Duration::ZERO);
        let zero_buffer = Config::default().with_receive_buffer_size(0);

        for config in [zero_timeout, zero_sleep, zero_buffer] {
            assert!(matches!(config.validate(), Err(Error::InvalidConfig(_))));
        }
    }

    #[test]
    fn settings_clamp_degenerate_values() {
        let settings = Settings::new(&Config::default());

        settings.set_sleep_time(Duration::ZERO);
        settings.set_receive_buffer_size(0);
        settings.set_connect_timeout(Duration::from_millis(250));

        assert_eq!(settings.sleep_time(), Duration::from_millis(1));
        assert_eq!(settings.receive_buffer_size(), 1);
        assert_eq!(settings.connect_timeout(), Duration::from_millis(250));
    }
}
