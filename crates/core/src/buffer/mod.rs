//! Aggregating log buffer.
//!
//! A [`LogBuffer`] collects the pre-formatted JSON records produced while a
//! request is handled and renders them, together with request-scoped
//! headers, as a single JSON object:
//!
//! ```text
//! {<header fields>,"entries":[<record>,<record>],"banner":"<text>"}
//! ```
//!
//! The buffer implements [`std::io::Write`], so any logger that writes to a
//! byte sink can be pointed at it.

mod error;
mod options;

use std::fmt;
use std::io;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use serde_json::{Map, Value};

pub use error::LogBufferError;
pub use options::{DEFAULT_BANNER, DEFAULT_MAX_SIZE, LogBufferOptions};

/// Request-scoped metadata rendered at the top level of the output object.
pub type Headers = Map<String, Value>;

const SEPARATOR: u8 = b',';

/// Thread-safe, bounded accumulator for one request's log records.
///
/// Cloning a `LogBuffer` is cheap and yields a handle to the same buffer, so
/// a clone can be handed to a logger or moved into a spawned task.
///
/// # Locking
///
/// Headers sit behind a reader/writer lock shared by every operation that
/// touches them. Entries have their own lock. No operation ever holds both,
/// and none of them wait on I/O.
#[derive(Clone)]
pub struct LogBuffer {
    inner: Arc<Inner>,
    headers: Arc<RwLock<Headers>>,
}

struct Inner {
    entries: Mutex<Vec<u8>>,
    banner: RwLock<Banner>,
    max_size: usize,
}

#[derive(Debug, Clone)]
struct Banner {
    enabled: bool,
    text: String,
}

impl LogBuffer {
    /// Create an empty buffer from `options`.
    #[must_use]
    pub fn new(options: LogBufferOptions) -> Self {
        let LogBufferOptions {
            add_banner,
            banner,
            headers,
            max_size,
        } = options;

        Self {
            inner: Arc::new(Inner {
                entries: Mutex::new(Vec::new()),
                banner: RwLock::new(Banner {
                    enabled: add_banner,
                    text: banner,
                }),
                max_size,
            }),
            headers: Arc::new(RwLock::new(headers)),
        }
    }

    /// Create a buffer with empty entries that shares this buffer's headers.
    ///
    /// Header writes through either buffer are visible to both. The banner
    /// starts disabled. Use this for background work that finishes after the
    /// request but should still report the request's headers.
    #[must_use]
    pub fn derived(&self) -> Self {
        let text = self.read_banner().text.clone();
        Self {
            inner: Arc::new(Inner {
                entries: Mutex::new(Vec::new()),
                banner: RwLock::new(Banner {
                    enabled: false,
                    text,
                }),
                max_size: self.inner.max_size,
            }),
            headers: Arc::clone(&self.headers),
        }
    }

    /// Configured ceiling on accumulated entry bytes.
    #[must_use]
    pub fn max_size(&self) -> usize {
        self.inner.max_size
    }

    /// Bytes accumulated so far, separators included.
    #[must_use]
    pub fn len(&self) -> usize {
        self.lock_entries().len()
    }

    /// Whether no entry has been appended yet.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lock_entries().is_empty()
    }

    /// Append one record.
    ///
    /// A single trailing `\n` is stripped from `fragment` before it is
    /// stored, followed by a `,` separator. Returns the number of bytes
    /// stored, which is the trimmed length plus one.
    ///
    /// # Errors
    ///
    /// Returns [`LogBufferError::CapacityExceeded`] when the current length
    /// plus the trimmed fragment length is greater than the maximum size.
    /// The buffer is left untouched in that case.
    pub fn append(&self, fragment: &[u8]) -> Result<usize, LogBufferError> {
        let trimmed = fragment.strip_suffix(b"\n").unwrap_or(fragment);

        let mut entries = self.lock_entries();
        let current = entries.len();
        if current + trimmed.len() > self.inner.max_size {
            return Err(LogBufferError::CapacityExceeded {
                max: self.inner.max_size,
                current,
                attempted: trimmed.len(),
                data: String::from_utf8_lossy(trimmed).into_owned(),
            });
        }

        entries.reserve(trimmed.len() + 1);
        entries.extend_from_slice(trimmed);
        entries.push(SEPARATOR);
        Ok(trimmed.len() + 1)
    }

    /// Store `value` under `key`, replacing any previous value.
    pub fn store_header(&self, key: impl Into<String>, value: impl Into<Value>) {
        self.write_headers().insert(key.into(), value.into());
    }

    /// Remove `key`. Absent keys are ignored.
    pub fn delete_header(&self, key: &str) {
        self.write_headers().remove(key);
    }

    /// The value stored under `key`, if any.
    #[must_use]
    pub fn get_header(&self, key: &str) -> Option<Value> {
        self.read_headers().get(key).cloned()
    }

    /// An independent deep copy of every header.
    #[must_use]
    pub fn all_headers(&self) -> Headers {
        self.read_headers().clone()
    }

    /// Copy the headers and the banner flag of `src` into `dst`.
    ///
    /// `src` is snapshotted and released before `dst` is locked, so copying
    /// between buffers that share headers cannot deadlock.
    pub fn copy_header(dst: &Self, src: &Self) {
        let headers = src.all_headers();
        let enabled = src.banner_enabled();

        *dst.write_headers() = headers;
        dst.write_banner().enabled = enabled;
    }

    /// Whether the rendered output carries a banner.
    #[must_use]
    pub fn banner_enabled(&self) -> bool {
        self.read_banner().enabled
    }

    /// Turn the banner on or off.
    pub fn set_banner(&self, enabled: bool) {
        self.write_banner().enabled = enabled;
    }

    /// Replace the banner text. Does not enable the banner.
    pub fn set_custom_banner(&self, banner: impl Into<String>) {
        self.write_banner().text = banner.into();
    }

    /// Render the buffer as one JSON object followed by a newline.
    ///
    /// Rendering does not consume the buffer; two renders with no mutation in
    /// between are identical.
    #[must_use]
    pub fn render(&self) -> String {
        let mut out = String::from("{");

        if let Some(fields) = self.header_fields() {
            out.push_str(&fields);
            out.push(',');
        }

        out.push_str("\"entries\":[");
        {
            let entries = self.lock_entries();
            let joined = entries
                .strip_suffix(&[SEPARATOR])
                .unwrap_or(entries.as_slice());
            out.push_str(&String::from_utf8_lossy(joined));
        }
        out.push(']');

        let banner = self.read_banner().clone();
        if banner.enabled {
            if let Ok(text) = serde_json::to_string(&banner.text) {
                out.push_str(",\"banner\":");
                out.push_str(&text);
            }
        }

        out.push_str("}\n");
        out
    }

    /// Serialized headers without the enclosing braces, or `None` if there
    /// are no headers.
    fn header_fields(&self) -> Option<String> {
        let encoded = {
            let headers = self.read_headers();
            if headers.is_empty() {
                return None;
            }
            serde_json::to_string(&*headers)
        };

        // Unreachable with `Value` headers. Render without them if it happens.
        let encoded = match encoded {
            Ok(encoded) => encoded,
            Err(e) => {
                tracing::warn!(error = %e, "Failed to serialize log buffer headers");
                return None;
            }
        };
        encoded
            .strip_prefix('{')
            .and_then(|s| s.strip_suffix('}'))
            .map(str::to_owned)
    }

    fn lock_entries(&self) -> MutexGuard<'_, Vec<u8>> {
        self.inner
            .entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn read_headers(&self) -> RwLockReadGuard<'_, Headers> {
        self.headers.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_headers(&self) -> RwLockWriteGuard<'_, Headers> {
        self.headers.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn read_banner(&self) -> RwLockReadGuard<'_, Banner> {
        self.inner
            .banner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn write_banner(&self) -> RwLockWriteGuard<'_, Banner> {
        self.inner
            .banner
            .write()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for LogBuffer {
    fn default() -> Self {
        Self::new(LogBufferOptions::default())
    }
}

impl fmt::Debug for LogBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LogBuffer")
            .field("len", &self.len())
            .field("max_size", &self.inner.max_size)
            .field("headers", &self.read_headers().len())
            .field("banner", &self.banner_enabled())
            .finish()
    }
}

impl fmt::Display for LogBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.render())
    }
}

/// Byte-sink view of the buffer.
///
/// Each `write` call is one record. On success the whole input counts as
/// consumed, even though the stored form drops a trailing newline and adds a
/// separator.
impl io::Write for LogBuffer {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.append(buf)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
