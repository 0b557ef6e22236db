//! HTTP byte-range parsing.
//!
//! Ranges are validated strictly against the object size: an end offset past
//! the last byte is rejected rather than clamped, so a caller asking for
//! `bytes=0-1000` of a 20-byte object gets a 416 instead of a silently
//! truncated body.

use crate::error::{Error, Result};

/// A resolved, inclusive byte range within an object of known size.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteRange {
    /// First byte offset (inclusive).
    pub start: u64,
    /// Last byte offset (inclusive).
    pub end: u64,
}

impl ByteRange {
    /// Number of bytes covered by the range.
    pub fn len(&self) -> u64 {
        self.end - self.start + 1
    }

    /// Always at least one byte; present for clippy's benefit.
    pub fn is_empty(&self) -> bool {
        false
    }

    /// `Content-Range` header value for an object of `size` bytes.
    pub fn content_range(&self, size: u64) -> String {
        format!("bytes {}-{}/{}", self.start, self.end, size)
    }

    /// Parse a `Range` header value against an object of `size` bytes.
    ///
    /// Supported forms: `bytes=a-b`, `bytes=a-` (to end), `bytes=-n` (last
    /// n bytes). Multi-range requests are not supported.
    pub fn parse(header: &str, size: u64) -> Result<Self> {
        let spec = header
            .strip_prefix("bytes=")
            .ok_or_else(|| Error::InvalidRange(format!("unsupported range unit: {header}")))?
            .trim();

        if spec.is_empty() || spec.contains(',') {
            return Err(Error::InvalidRange(format!(
                "unsupported range spec: {spec}"
            )));
        }

        if size == 0 {
            return Err(Error::RangeNotSatisfiable {
                start: 0,
                end: 0,
                size: 0,
            });
        }

        let (start, end) = if let Some(suffix) = spec.strip_prefix('-') {
            // Suffix range: last n bytes.
            let n: u64 = suffix
                .parse()
                .map_err(|_| Error::InvalidRange(format!("invalid suffix length: {suffix}")))?;
            if n == 0 {
                return Err(Error::InvalidRange("zero-length suffix range".to_string()));
            }
            if n > size {
                return Err(Error::RangeNotSatisfiable {
                    start: 0,
                    end: n,
                    size,
                });
            }
            (size - n, size - 1)
        } else {
            let (start_str, end_str) = spec
                .split_once('-')
                .ok_or_else(|| Error::InvalidRange(format!("invalid range spec: {spec}")))?;
            let start: u64 = start_str
                .parse()
                .map_err(|_| Error::InvalidRange(format!("invalid range start: {start_str}")))?;
            let end: u64 = if end_str.is_empty() {
                size - 1
            } else {
                end_str
                    .parse()
                    .map_err(|_| Error::InvalidRange(format!("invalid range end: {end_str}")))?
            };
            (start, end)
        };

        if start > end || end >= size {
            return Err(Error::RangeNotSatisfiable { start, end, size });
        }

        Ok(Self { start, end })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_explicit_range() {
        let r = ByteRange::parse("bytes=0-9", 20).unwrap();
        assert_eq!(r, ByteRange { start: 0, end: 9 });
        assert_eq!(r.len(), 10);
        assert_eq!(r.content_range(20), "bytes 0-9/20");
    }

    #[test]
    fn test_open_ended_range() {
        let r = ByteRange::parse("bytes=5-", 20).unwrap();
        assert_eq!(r, ByteRange { start: 5, end: 19 });
        assert_eq!(r.len(), 15);
    }

    #[test]
    fn test_suffix_range() {
        let r = ByteRange::parse("bytes=-5", 20).unwrap();
        assert_eq!(r, ByteRange { start: 15, end: 19 });
        assert_eq!(r.len(), 5);
    }

    #[test]
    fn test_out_of_bounds_rejected_not_clamped() {
        let err = ByteRange::parse("bytes=0-1000", 20).unwrap_err();
        assert!(matches!(err, Error::RangeNotSatisfiable { .. }));
    }

    #[test]
    fn test_suffix_longer_than_object_rejected() {
        let err = ByteRange::parse("bytes=-50", 20).unwrap_err();
        assert!(matches!(err, Error::RangeNotSatisfiable { .. }));
    }

    #[test]
    fn test_inverted_range_rejected() {
        let err = ByteRange::parse("bytes=9-3", 20).unwrap_err();
        assert!(matches!(err, Error::RangeNotSatisfiable { .. }));
    }

    #[test]
    fn test_malformed_specs_rejected() {
        assert!(ByteRange::parse("items=0-9", 20).is_err());
        assert!(ByteRange::parse("bytes=", 20).is_err());
        assert!(ByteRange::parse("bytes=a-b", 20).is_err());
        assert!(ByteRange::parse("bytes=0-4,10-14", 20).is_err());
        assert!(ByteRange::parse("bytes=-0", 20).is_err());
    }

    #[test]
    fn test_empty_object() {
        assert!(ByteRange::parse("bytes=0-0", 0).is_err());
    }

    #[test]
    fn test_single_byte_range() {
        let r = ByteRange::parse("bytes=19-19", 20).unwrap();
        assert_eq!(r.len(), 1);
    }
}
