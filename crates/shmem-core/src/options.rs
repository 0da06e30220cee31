//! Connection options.

use std::path::PathBuf;
use std::time::Duration;

use crate::codec::Codec;
use crate::error::{Error, Result};
use crate::handshake::HELLO_ACK_LEN;
use crate::layout::SegmentLayout;
use crate::{
    DEFAULT_CAPACITY, DEFAULT_COMPRESSION_THRESHOLD, DEFAULT_MAX_FRAME_SIZE, RECORD_HEADER_SIZE,
    segment,
};

/// Options shared by `connect` and `accept`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionOptions {
    /// Ring capacity per direction (power of two)
    pub capacity: usize,
    /// Maximum frame payload after compression
    pub max_frame_size: usize,
    /// Enable LZ4 compression for large payloads
    pub compression: bool,
    /// Payloads at or above this size are compression candidates
    pub compression_threshold: usize,
    /// How often this side refreshes its heartbeat
    pub heartbeat_interval: Duration,
    /// Peer heartbeat age after which the peer is considered dead
    pub liveness_timeout: Duration,
    /// How long `connect` keeps retrying a missing segment
    pub connect_timeout: Duration,
    /// How long the opener waits for the creator's handshake reply
    pub handshake_timeout: Duration,
    /// Fallback poll period of the reactor bridge
    pub poll_interval: Duration,
    /// Segment directory (defaults to `/dev/shm/shmem-connect`)
    pub shm_dir: Option<PathBuf>,
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_CAPACITY,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            compression: false,
            compression_threshold: DEFAULT_COMPRESSION_THRESHOLD,
            heartbeat_interval: Duration::from_millis(100),
            liveness_timeout: Duration::from_secs(2),
            connect_timeout: Duration::from_secs(5),
            handshake_timeout: Duration::from_secs(5),
            poll_interval: Duration::from_millis(5),
            shm_dir: None,
        }
    }
}

impl ConnectionOptions {
    /// Set the ring capacity, shrinking the maximum frame size to fit.
    #[must_use]
    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity;
        let fit = capacity.saturating_sub(RECORD_HEADER_SIZE);
        self.max_frame_size = self.max_frame_size.min(fit);
        self
    }

    /// Set the maximum frame size
    #[must_use]
    pub fn with_max_frame_size(mut self, max_frame_size: usize) -> Self {
        self.max_frame_size = max_frame_size;
        self
    }

    /// Enable or disable compression with `threshold`
    #[must_use]
    pub fn with_compression(mut self, enabled: bool, threshold: usize) -> Self {
        self.compression = enabled;
        self.compression_threshold = threshold;
        self
    }

    /// Set heartbeat interval and liveness timeout
    #[must_use]
    pub fn with_liveness(mut self, heartbeat_interval: Duration, liveness_timeout: Duration) -> Self {
        self.heartbeat_interval = heartbeat_interval;
        self.liveness_timeout = liveness_timeout;
        self
    }

    /// Set the segment directory
    #[must_use]
    pub fn with_shm_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.shm_dir = Some(dir.into());
        self
    }

    /// Set the connect retry deadline
    #[must_use]
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Defaults overridden by `SHMEM_*` environment variables.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] if a variable does not parse.
    pub fn from_env() -> Result<Self> {
        Self::default().apply_env(|key| std::env::var(key).ok())
    }

    /// Apply overrides from `lookup` (`SHMEM_CAPACITY`, `SHMEM_MAX_FRAME_SIZE`,
    /// `SHMEM_COMPRESSION`, `SHMEM_COMPRESSION_THRESHOLD`, `SHMEM_HEARTBEAT_MS`,
    /// `SHMEM_LIVENESS_MS`, `SHMEM_DIR`).
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] if a value does not parse.
    pub fn apply_env<F>(mut self, lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("SHMEM_CAPACITY") {
            self = self.with_capacity(parse_num("SHMEM_CAPACITY", &v)?);
        }
        if let Some(v) = lookup("SHMEM_MAX_FRAME_SIZE") {
            self.max_frame_size = parse_num("SHMEM_MAX_FRAME_SIZE", &v)?;
        }
        if let Some(v) = lookup("SHMEM_COMPRESSION") {
            self.compression = parse_bool("SHMEM_COMPRESSION", &v)?;
        }
        if let Some(v) = lookup("SHMEM_COMPRESSION_THRESHOLD") {
            self.compression_threshold = parse_num("SHMEM_COMPRESSION_THRESHOLD", &v)?;
        }
        if let Some(v) = lookup("SHMEM_HEARTBEAT_MS") {
            self.heartbeat_interval = Duration::from_millis(parse_num("SHMEM_HEARTBEAT_MS", &v)? as u64);
        }
        if let Some(v) = lookup("SHMEM_LIVENESS_MS") {
            self.liveness_timeout = Duration::from_millis(parse_num("SHMEM_LIVENESS_MS", &v)? as u64);
        }
        if let Some(v) = lookup("SHMEM_DIR") {
            if !v.is_empty() {
                self.shm_dir = Some(PathBuf::from(v));
            }
        }
        Ok(self)
    }

    /// Validate the options.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] describing the first problem found.
    pub fn validate(&self) -> Result<()> {
        self.layout().validate()?;
        if self.max_frame_size < HELLO_ACK_LEN {
            return Err(Error::InvalidConfig(format!(
                "max frame size {} cannot carry the handshake ({HELLO_ACK_LEN} bytes)",
                self.max_frame_size
            )));
        }
        if self.compression_threshold == 0 {
            return Err(Error::InvalidConfig(
                "compression threshold must be at least 1 byte".into(),
            ));
        }
        if self.heartbeat_interval.is_zero() {
            return Err(Error::InvalidConfig("heartbeat interval must be non-zero".into()));
        }
        if self.heartbeat_interval >= self.liveness_timeout {
            return Err(Error::InvalidConfig(format!(
                "heartbeat interval {:?} must be shorter than liveness timeout {:?}",
                self.heartbeat_interval, self.liveness_timeout
            )));
        }
        if self.poll_interval.is_zero() {
            return Err(Error::InvalidConfig("poll interval must be non-zero".into()));
        }
        Ok(())
    }

    /// Segment geometry
    #[must_use]
    pub fn layout(&self) -> SegmentLayout {
        SegmentLayout {
            capacity: self.capacity,
            max_frame_size: self.max_frame_size,
        }
    }

    /// Codec for these options before negotiation
    #[must_use]
    pub fn codec(&self) -> Codec {
        Codec::new(self.compression, self.compression_threshold, self.max_frame_size)
    }

    /// Resolved segment directory
    #[must_use]
    pub fn segment_dir(&self) -> PathBuf {
        self.shm_dir.clone().unwrap_or_else(segment::default_dir)
    }
}

fn parse_num(key: &str, value: &str) -> Result<usize> {
    value
        .trim()
        .parse()
        .map_err(|_| Error::InvalidConfig(format!("{key}={value} is not a number")))
}

fn parse_bool(key: &str, value: &str) -> Result<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(Error::InvalidConfig(format!("{key}={value} is not a boolean"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_default_is_valid() {
        ConnectionOptions::default().validate().unwrap();
    }

    #[test]
    fn test_with_capacity_shrinks_max_frame() {
        let opts = ConnectionOptions::default().with_capacity(4096);
        assert_eq!(opts.capacity, 4096);
        assert_eq!(opts.max_frame_size, 4088);
        opts.validate().unwrap();
    }

    #[test]
    fn test_validate_rejects() {
        let bad_capacity = ConnectionOptions {
            capacity: 1000,
            max_frame_size: 100,
            ..Default::default()
        };
        assert!(bad_capacity.validate().is_err());

        let frame_too_big = ConnectionOptions {
            capacity: 4096,
            max_frame_size: 4096,
            ..Default::default()
        };
        assert!(frame_too_big.validate().is_err());

        let slow_heartbeat = ConnectionOptions::default()
            .with_liveness(Duration::from_secs(2), Duration::from_secs(1));
        assert!(slow_heartbeat.validate().is_err());

        let tiny_frames = ConnectionOptions::default().with_max_frame_size(8);
        assert!(tiny_frames.validate().is_err());
    }

    #[test]
    fn test_apply_env() {
        let opts = ConnectionOptions::default()
            .apply_env(env(&[
                ("SHMEM_CAPACITY", "65536"),
                ("SHMEM_COMPRESSION", "on"),
                ("SHMEM_COMPRESSION_THRESHOLD", "1000"),
                ("SHMEM_LIVENESS_MS", "750"),
                ("SHMEM_DIR", "/tmp/shm-test"),
            ]))
            .unwrap();
        assert_eq!(opts.capacity, 65536);
        assert_eq!(opts.max_frame_size, 65528);
        assert!(opts.compression);
        assert_eq!(opts.compression_threshold, 1000);
        assert_eq!(opts.liveness_timeout, Duration::from_millis(750));
        assert_eq!(opts.segment_dir(), PathBuf::from("/tmp/shm-test"));
    }

    #[test]
    fn test_apply_env_rejects_garbage() {
        let err = ConnectionOptions::default()
            .apply_env(env(&[("SHMEM_CAPACITY", "lots")]))
            .unwrap_err();
        assert!(matches!(err, Error::InvalidConfig(_)));

        assert!(
            ConnectionOptions::default()
                .apply_env(env(&[("SHMEM_COMPRESSION", "maybe")]))
                .is_err()
        );
    }
}
