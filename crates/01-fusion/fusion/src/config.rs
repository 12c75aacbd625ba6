//! Runtime configuration for worlds and their participants.

use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

/// Default size of a world's shared mapping.
pub const DEFAULT_ARENA_SIZE: usize = 4 * 1024 * 1024;
/// Default payload capacity of each participant's inbox ring.
pub const DEFAULT_INBOX_CAPACITY: usize = 64 * 1024;

/// Settings applied when entering a world.
///
/// Every field has a default; `from_env` overlays `FUSION_*` variables so a
/// deployment can tune a process group without recompiling.
#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(default)]
pub struct FusionConfig {
    /// Directory holding the `fusion.<index>` arena files.
    pub shm_dir: PathBuf,
    /// Total size in bytes of a newly created arena. Ignored by slaves.
    pub arena_size: usize,
    /// Payload capacity of each participant's inbox ring.
    pub inbox_capacity: usize,
    /// How long `Call::execute` waits for a reply before `Timeout`.
    #[serde(with = "millis")]
    pub call_timeout: Duration,
    /// Slice used by blocked waiters between liveness checks.
    #[serde(with = "millis")]
    pub liveness_interval: Duration,
    /// How long a slave waits for a master to finish initialising the arena.
    #[serde(with = "millis")]
    pub enter_timeout: Duration,
    /// Remove the arena file when the master shuts the world down.
    pub unlink_on_shutdown: bool,
}

impl Default for FusionConfig {
    fn default() -> Self {
        Self {
            shm_dir: default_shm_dir(),
            arena_size: DEFAULT_ARENA_SIZE,
            inbox_capacity: DEFAULT_INBOX_CAPACITY,
            call_timeout: Duration::from_secs(30),
            liveness_interval: Duration::from_millis(100),
            enter_timeout: Duration::from_secs(5),
            unlink_on_shutdown: true,
        }
    }
}

impl FusionConfig {
    /// Defaults overlaid with any `FUSION_*` environment overrides.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(dir) = std::env::var_os("FUSION_SHM_DIR") {
            config.shm_dir = PathBuf::from(dir);
        }
        if let Some(size) = env_parse::<usize>("FUSION_ARENA_SIZE") {
            config.arena_size = size;
        }
        if let Some(size) = env_parse::<usize>("FUSION_INBOX_CAPACITY") {
            config.inbox_capacity = size;
        }
        if let Some(ms) = env_parse::<u64>("FUSION_CALL_TIMEOUT_MS") {
            config.call_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = env_parse::<u64>("FUSION_LIVENESS_MS") {
            config.liveness_interval = Duration::from_millis(ms);
        }
        config
    }

    /// Returns a copy placing arenas under `dir`.
    pub fn with_shm_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.shm_dir = dir.into();
        self
    }

    pub fn with_arena_size(mut self, size: usize) -> Self {
        self.arena_size = size;
        self
    }

    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }

    pub fn with_inbox_capacity(mut self, capacity: usize) -> Self {
        self.inbox_capacity = capacity;
        self
    }

    pub(crate) fn arena_path(&self, index: u32) -> PathBuf {
        self.shm_dir.join(format!("fusion.{index}"))
    }
}

fn default_shm_dir() -> PathBuf {
    let dev_shm = PathBuf::from("/dev/shm");
    if dev_shm.is_dir() {
        dev_shm
    } else {
        std::env::temp_dir()
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    let raw = std::env::var(key).ok()?;
    match raw.parse() {
        Ok(value) => Some(value),
        Err(_) => {
            tracing::warn!(key, raw, "ignoring unparsable fusion override");
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

    #[test]
    fn arena_path_uses_index() {
        let config = FusionConfig::default().with_shm_dir("/tmp/worlds");
        assert_eq!(config.arena_path(3), PathBuf::from("/tmp/worlds/fusion.3"));
    }

    #[test]
    fn defaults_are_sane() {
        let config = FusionConfig::default();
        assert!(config.arena_size >= DEFAULT_INBOX_CAPACITY * 4);
        assert!(config.liveness_interval < config.call_timeout);
    }
}
