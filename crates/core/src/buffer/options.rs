//! Construction options for [`LogBuffer`](super::LogBuffer).

use serde_json::{Map, Value};

/// Default ceiling on accumulated entry bytes.
///
/// An average single spaced page holds about 3k characters, so 100k is
/// roughly 33 pages of log output for one request.
pub const DEFAULT_MAX_SIZE: usize = 100_000;

/// Banner text rendered when the banner is enabled without a custom text.
pub const DEFAULT_BANNER: &str = "[AXUM] --------------------------------------------------------------- AggregateLogWithTracing ----------------------------------------------------------------";

/// Options applied when creating a [`LogBuffer`](super::LogBuffer).
///
/// ```
/// use aggregate_log_core::{LogBuffer, LogBufferOptions};
///
/// let buffer = LogBuffer::new(
///     LogBufferOptions::default()
///         .with_banner(true)
///         .with_header("service", "checkout")
///         .with_max_size(4096),
/// );
/// assert_eq!(buffer.max_size(), 4096);
/// assert!(buffer.banner_enabled());
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct LogBufferOptions {
    pub(crate) add_banner: bool,
    pub(crate) banner: String,
    pub(crate) headers: Map<String, Value>,
    pub(crate) max_size: usize,
}

impl Default for LogBufferOptions {
    fn default() -> Self {
        Self {
            add_banner: false,
            banner: DEFAULT_BANNER.to_owned(),
            headers: Map::new(),
            max_size: DEFAULT_MAX_SIZE,
        }
    }
}

impl LogBufferOptions {
    /// Whether the rendered object carries a `"banner"` field.
    #[must_use]
    pub const fn with_banner(mut self, add_banner: bool) -> Self {
        self.add_banner = add_banner;
        self
    }

    /// Seed one header. Later calls with the same key overwrite earlier ones.
    #[must_use]
    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    /// Byte ceiling for accumulated entries.
    #[must_use]
    pub const fn with_max_size(mut self, max_size: usize) -> Self {
        self.max_size = max_size;
        self
    }

    /// Replace [`DEFAULT_BANNER`] with `banner`.
    ///
    /// This only changes the text; the banner is rendered when
    /// [`with_banner`](Self::with_banner) is also set.
    #[must_use]
    pub fn with_custom_banner(mut self, banner: impl Into<String>) -> Self {
        self.banner = banner.into();
        self
    }
}
