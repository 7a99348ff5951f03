//! Per-server settings for the send pipeline.

use serde::Deserialize;

use crate::compression::DEFAULT_THRESHOLD;

/// Upper bound for `max-age`, one year in seconds.
pub const MAX_AGE_LIMIT: u64 = 60 * 60 * 24 * 365;

/// Settings shared by every request served with them.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct SendConfig {
    /// `max-age` announced in `Cache-Control`, clamped to [`MAX_AGE_LIMIT`].
    pub max_age: u64,
    /// Append `no-transform` to `Cache-Control`. Disables compression.
    pub no_transform: bool,
    /// Honour `Range` requests. When off, `Range` is ignored and `Accept-Ranges` omitted.
    pub accept_ranges: bool,
    pub compression: bool,
    /// Bodies shorter than this many bytes are never compressed.
    pub compression_threshold: u64,
    /// flate2 level, 0 to 9.
    pub compression_level: u32,
    /// File served when a request resolves to a directory.
    pub index_file: String,
}

impl Default for SendConfig {
    fn default() -> Self {
        SendConfig {
            max_age: 0,
            no_transform: false,
            accept_ranges: true,
            compression: true,
            compression_threshold: DEFAULT_THRESHOLD,
            compression_level: 6,
            index_file: "index.html".to_string(),
        }
    }
}

impl SendConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_age(mut self, max_age: u64) -> Self {
        self.max_age = max_age;
        self
    }

    pub fn with_no_transform(mut self, no_transform: bool) -> Self {
        self.no_transform = no_transform;
        self
    }

    pub fn with_accept_ranges(mut self, accept_ranges: bool) -> Self {
        self.accept_ranges = accept_ranges;
        self
    }

    pub fn with_compression(mut self, compression: bool) -> Self {
        self.compression = compression;
        self
    }

    pub fn with_compression_threshold(mut self, threshold: u64) -> Self {
        self.compression_threshold = threshold;
        self
    }

    pub fn with_compression_level(mut self, level: u32) -> Self {
        self.compression_level = level.min(9);
        self
    }

    pub fn with_index_file(mut self, index_file: impl Into<String>) -> Self {
        self.index_file = index_file.into();
        self
    }

    /// `Cache-Control` header value for these settings.
    pub fn cache_control(&self) -> String {
        let mut value = format!("public, max-age={}", self.max_age.min(MAX_AGE_LIMIT));
        if self.no_transform {
            value.push_str(", no-transform");
        }
        value
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = SendConfig::default();
        assert_eq!(1024, config.compression_threshold);
        assert_eq!("index.html", config.index_file);
        assert_eq!("public, max-age=0", config.cache_control());
    }

    #[test]
    fn test_max_age_is_clamped() {
        let config = SendConfig::new().with_max_age(u64::MAX);
        assert_eq!("public, max-age=31536000", config.cache_control());
    }

    #[test]
    fn test_no_transform() {
        let config = SendConfig::new().with_max_age(60).with_no_transform(true);
        assert_eq!("public, max-age=60, no-transform", config.cache_control());
    }

    #[test]
    fn test_deserialize_partial() {
        let config: SendConfig = serde_json::from_str(r#"{"max_age": 3600, "compression": false}"#).unwrap();
        assert_eq!(3600, config.max_age);
        assert!(!config.compression);
        assert!(config.accept_ranges);
        assert_eq!(6, config.compression_level);
    }
}
