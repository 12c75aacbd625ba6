//! Per-connection settings.

use serde::Deserialize;
use std::time::Duration;

/// Packets larger than this are refused by default.
pub const DEFAULT_MAX_PACKET_SIZE: u32 = 16 * 1024 * 1024;

/// Settings shared by both ends of a connection. `from_env` overlays
/// `VOODOO_*` variables on the defaults.
#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(default)]
pub struct VoodooConfig {
    /// Try LZ4 on outgoing payloads; used only when strictly smaller.
    pub compression: bool,
    /// Payloads shorter than this are never compressed.
    pub compression_min_size: usize,
    /// Largest packet body accepted from the peer.
    pub max_packet_size: u32,
    /// How deep requests may nest while a thread waits for its own response.
    pub max_dispatch_depth: u32,
    /// How long a `RESPOND` request waits for its response.
    #[serde(with = "millis")]
    pub request_timeout: Duration,
    /// How long the hello exchange may take.
    #[serde(with = "millis")]
    pub handshake_timeout: Duration,
    /// Followers re-check for the reader token this often.
    #[serde(with = "millis")]
    pub follower_slice: Duration,
    /// Accept loops poll their cancellation flag this often.
    #[serde(with = "millis")]
    pub accept_poll: Duration,
}

impl Default for VoodooConfig {
    fn default() -> Self {
        Self {
            compression: true,
            compression_min_size: 64,
            max_packet_size: DEFAULT_MAX_PACKET_SIZE,
            max_dispatch_depth: 16,
            request_timeout: Duration::from_secs(30),
            handshake_timeout: Duration::from_secs(5),
            follower_slice: Duration::from_millis(20),
            accept_poll: Duration::from_millis(20),
        }
    }
}

impl VoodooConfig {
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(on) = env_parse::<bool>("VOODOO_COMPRESSION") {
            config.compression = on;
        }
        if let Some(size) = env_parse::<usize>("VOODOO_COMPRESSION_MIN_SIZE") {
            config.compression_min_size = size;
        }
        if let Some(size) = env_parse::<u32>("VOODOO_MAX_PACKET_SIZE") {
            config.max_packet_size = size;
        }
        if let Some(depth) = env_parse::<u32>("VOODOO_MAX_DISPATCH_DEPTH") {
            config.max_dispatch_depth = depth;
        }
        if let Some(ms) = env_parse::<u64>("VOODOO_REQUEST_TIMEOUT_MS") {
            config.request_timeout = Duration::from_millis(ms);
        }
        config
    }

    pub fn with_compression(mut self, on: bool) -> Self {
        self.compression = on;
        self
    }

    pub fn with_max_dispatch_depth(mut self, depth: u32) -> Self {
        self.max_dispatch_depth = depth;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Compression policy for outgoing packets.
    pub fn compression_policy(&self) -> crate::packet::Compression {
        if self.compression {
            crate::packet::Compression::Above(self.compression_min_size)
        } else {
            crate::packet::Compression::Never
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    let raw = std::env::var(key).ok()?;
    match raw.parse() {
        Ok(value) => Some(value),
        Err(_) => {
            tracing::warn!(key, raw, "ignoring unparsable voodoo override");
            None
        }
    }
}

mod millis {
    use serde::{Deserialize, Deserializer};
    use std::time::Duration;

    pub fn deserialize<'de, D: Deserializer<'de>>(de: D) -> Result<Duration, D::Error> {
        u64::deserialize(de).map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::Compression;

    #[test]
    fn compression_policy_follows_flag() {
        let config = VoodooConfig::default();
        assert_eq!(config.compression_policy(), Compression::Above(64));
        assert_eq!(
            config.with_compression(false).compression_policy(),
            Compression::Never
        );
    }
}
