use std::str::FromStr;
use std::time::Duration;

use crate::error::{Error, Result};

pub const DEFAULT_HEARTBEAT_PERIOD: Duration = Duration::from_secs(30);
pub const DEFAULT_MAX_CONNECTIONS: usize = 1024;
pub const DEFAULT_DIAL_TIMEOUT: Duration = Duration::from_millis(5000);
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// 16 byte AES-128 key shared by both ends of an encrypted leg.
#[derive(Clone, PartialEq, Eq)]
pub struct Secret([u8; 16]);

impl Secret {
    pub fn new(key: [u8; 16]) -> Self {
        Self(key)
    }

    pub fn key(&self) -> &[u8; 16] {
        &self.0
    }
}

impl FromStr for Secret {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let key: [u8; 16] = s
            .as_bytes()
            .try_into()
            .map_err(|_| Error::Config(format!("secret should be 16 bytes, got {}", s.len())))?;
        Ok(Self(key))
    }
}

impl std::fmt::Debug for Secret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Secret(..)")
    }
}

/// Static settings shared by every mode. Built once at startup.
#[derive(Debug, Clone)]
pub struct Config {
    pub heartbeat_period: Duration,
    /// Upper bound on concurrent proxied connections; queues hold half of it.
    pub max_connections: usize,
    pub dial_timeout: Duration,
    pub handshake_timeout: Duration,
    pub secret: Option<Secret>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            heartbeat_period: DEFAULT_HEARTBEAT_PERIOD,
            max_connections: DEFAULT_MAX_CONNECTIONS,
            dial_timeout: DEFAULT_DIAL_TIMEOUT,
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            secret: None,
        }
    }
}

impl Config {
    /// Rejects settings the roles cannot run with.
    pub fn validate(&self) -> Result<()> {
        let zero = |name: &str| Err(Error::Config(format!("{name} must be greater than zero")));
        if self.heartbeat_period.is_zero() {
            return zero("heartbeat period");
        }
        if self.dial_timeout.is_zero() {
            return zero("dial timeout");
        }
        if self.handshake_timeout.is_zero() {
            return zero("handshake timeout");
        }
        if self.max_connections == 0 {
            return zero("max connections");
        }
        Ok(())
    }

    pub fn queue_capacity(&self) -> usize {
        (self.max_connections / 2).max(1)
    }

    /// Secret for a leg, or `None` when the leg is plain.
    ///
    /// Asking for an encrypted leg without a configured secret is an error.
    pub fn leg_secret(&self, encrypted: bool) -> Result<Option<Secret>> {
        match (encrypted, &self.secret) {
            (false, _) => Ok(None),
            (true, Some(secret)) => Ok(Some(secret.clone())),
            (true, None) => Err(Error::Config(
                "encryption requested but no secret configured".into(),
            )),
        }
    }
}
