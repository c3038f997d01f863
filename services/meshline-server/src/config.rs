//! Tunables for a [`crate::server::MessageServer`] (spec §4.4
//! "Configuration").

use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Codec key (spec §4.1). `None` runs the wire in plaintext.
    pub password: Option<String>,
    /// Cluster-signing secret (spec §3 inner envelope `sign`).
    /// Required for any cluster traffic; inner packets are rejected
    /// with 4004 if this is unset.
    pub secret: Option<String>,
    /// Codec frame kind.
    pub binary: bool,
    /// Supervisor sweep period. Must be >= 10s.
    pub cycle: Duration,
    /// Max interval between heartbeats per session before it is
    /// considered expired. Must be >= 30s and >= 3x `cycle`.
    pub timeout: Duration,
    /// Per-session recent-`reqId` ring capacity.
    pub req_id_cache: usize,
    /// Header name (e.g. `x-forwarded-for`) preferred over the raw TCP
    /// peer address when resolving a session's `ip` (spec §3).
    pub forwarded_header: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            password: None,
            secret: None,
            binary: false,
            cycle: Duration::from_millis(60_000),
            timeout: Duration::from_millis(180_000),
            req_id_cache: 32,
            forwarded_header: None,
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ServerConfigError {
    #[error("cycle must be at least 10000ms, got {0:?}")]
    CycleTooShort(Duration),
    #[error("timeout must be at least 30000ms, got {0:?}")]
    TimeoutTooShort(Duration),
    #[error("timeout must be at least 3x cycle ({cycle:?} * 3 = {min:?}), got {timeout:?}")]
    TimeoutBelowCycleMultiple {
        cycle: Duration,
        min: Duration,
        timeout: Duration,
    },
}

impl ServerConfig {
    pub fn with_password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(password.into());
        self
    }

    pub fn with_secret(mut self, secret: impl Into<String>) -> Self {
        self.secret = Some(secret.into());
        self
    }

    pub fn with_binary(mut self, binary: bool) -> Self {
        self.binary = binary;
        self
    }

    pub fn with_cycle(mut self, cycle: Duration) -> Self {
        self.cycle = cycle;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_req_id_cache(mut self, capacity: usize) -> Self {
        self.req_id_cache = capacity;
        self
    }

    pub fn with_forwarded_header(mut self, header: impl Into<String>) -> Self {
        self.forwarded_header = Some(header.into());
        self
    }

    pub fn validate(&self) -> Result<(), ServerConfigError> {
        const MIN_CYCLE: Duration = Duration::from_millis(10_000);
        const MIN_TIMEOUT: Duration = Duration::from_millis(30_000);

        if self.cycle < MIN_CYCLE {
            return Err(ServerConfigError::CycleTooShort(self.cycle));
        }
        if self.timeout < MIN_TIMEOUT {
            return Err(ServerConfigError::TimeoutTooShort(self.timeout));
        }
        let min = self.cycle * 3;
        if self.timeout < min {
            return Err(ServerConfigError::TimeoutBelowCycleMultiple {
                cycle: self.cycle,
                min,
                timeout: self.timeout,
            });
        }
        Ok(())
    }
}
