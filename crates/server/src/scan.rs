//! Security scanning of uploaded content.
//!
//! The scanner is an external collaborator as far as the rest of the system
//! is concerned: the engine only consumes the verdict. [`BasicScanner`] is
//! the built-in implementation covering MIME sniffing, extension policy,
//! and the EICAR test signature; deployments with a real antivirus daemon
//! plug in their own [`Scanner`].

use async_trait::async_trait;
use depot_core::config::SecurityConfig;

/// Standard antivirus test signature (EICAR). Any file containing it is
/// reported as infected.
const EICAR_SIGNATURE: &[u8] =
    br"X5O!P%@AP[4\PZX54(P^)7CC)7}$EICAR-STANDARD-ANTIVIRUS-TEST-FILE!$H+H*";

/// Outcome of a content scan.
#[derive(Debug, Clone)]
pub struct ScanVerdict {
    /// Overall allow/deny decision.
    pub safe: bool,
    /// Detected MIME type (from content, not the declared one).
    pub mime_type: String,
    /// Extension derived from the filename, lowercase, without the dot.
    pub extension: String,
    pub virus_detected: bool,
    pub virus_name: Option<String>,
    /// Non-fatal observations (e.g. declared/detected type mismatch).
    pub warnings: Vec<String>,
}

/// Content scanner interface.
#[async_trait]
pub trait Scanner: Send + Sync {
    /// Scan an upload. `declared_mime` is what the client claimed, if
    /// anything.
    async fn scan(
        &self,
        filename: &str,
        declared_mime: Option<&str>,
        data: &[u8],
    ) -> ScanVerdict;
}

/// Built-in scanner: magic-byte MIME detection, blocked-extension policy,
/// EICAR detection.
pub struct BasicScanner {
    blocked_extensions: Vec<String>,
}

impl BasicScanner {
    pub fn new(config: &SecurityConfig) -> Self {
        Self {
            blocked_extensions: config
                .blocked_extensions
                .iter()
                .map(|e| e.to_ascii_lowercase())
                .collect(),
        }
    }
}

#[async_trait]
impl Scanner for BasicScanner {
    async fn scan(
        &self,
        filename: &str,
        declared_mime: Option<&str>,
        data: &[u8],
    ) -> ScanVerdict {
        let extension = extension_of(filename);
        let detected = sniff_mime(data);
        let mut warnings = Vec::new();

        if self.blocked_extensions.contains(&extension) {
            return ScanVerdict {
                safe: false,
                mime_type: detected.to_string(),
                extension,
                virus_detected: false,
                virus_name: None,
                warnings: vec![format!("extension .{} is blocked", filename_ext(filename))],
            };
        }

        if find_subsequence(data, EICAR_SIGNATURE) {
            return ScanVerdict {
                safe: false,
                mime_type: detected.to_string(),
                extension,
                virus_detected: true,
                virus_name: Some("EICAR-Test-File".to_string()),
                warnings,
            };
        }

        if let Some(declared) = declared_mime
            && !declared.is_empty()
            && detected != "application/octet-stream"
            && !declared.eq_ignore_ascii_case(detected)
        {
            warnings.push(format!(
                "declared type {declared} does not match detected type {detected}"
            ));
        }

        // Prefer the sniffed type; fall back to the declared one for
        // formats without a recognizable signature.
        let mime_type = if detected == "application/octet-stream" {
            declared_mime
                .filter(|d| !d.is_empty())
                .unwrap_or(detected)
                .to_string()
        } else {
            detected.to_string()
        };

        ScanVerdict {
            safe: true,
            mime_type,
            extension,
            virus_detected: false,
            virus_name: None,
            warnings,
        }
    }
}

/// Pass-through scanner for deployments that disable scanning.
pub struct NoopScanner;

#[async_trait]
impl Scanner for NoopScanner {
    async fn scan(
        &self,
        filename: &str,
        declared_mime: Option<&str>,
        _data: &[u8],
    ) -> ScanVerdict {
        ScanVerdict {
            safe: true,
            mime_type: declared_mime
                .filter(|d| !d.is_empty())
                .unwrap_or("application/octet-stream")
                .to_string(),
            extension: extension_of(filename),
            virus_detected: false,
            virus_name: None,
            warnings: Vec::new(),
        }
    }
}

fn filename_ext(filename: &str) -> &str {
    filename.rsplit_once('.').map(|(_, ext)| ext).unwrap_or("")
}

/// Lowercase extension without the dot, empty if none.
pub fn extension_of(filename: &str) -> String {
    filename_ext(filename).to_ascii_lowercase()
}

/// Detect MIME type from leading magic bytes.
fn sniff_mime(data: &[u8]) -> &'static str {
    const SIGNATURES: &[(&[u8], &str)] = &[
        (b"\xFF\xD8\xFF", "image/jpeg"),
        (b"\x89PNG\r\n\x1a\n", "image/png"),
        (b"GIF87a", "image/gif"),
        (b"GIF89a", "image/gif"),
        (b"%PDF-", "application/pdf"),
        (b"PK\x03\x04", "application/zip"),
        (b"\x1f\x8b", "application/gzip"),
        (b"BM", "image/bmp"),
        (b"\x7fELF", "application/x-executable"),
        (b"MZ", "application/x-msdownload"),
    ];

    for (magic, mime) in SIGNATURES {
        if data.starts_with(magic) {
            return mime;
        }
    }

    // WEBP: RIFF....WEBP
    if data.len() >= 12 && &data[0..4] == b"RIFF" && &data[8..12] == b"WEBP" {
        return "image/webp";
    }

    if !data.is_empty() && data.iter().take(512).all(|b| *b != 0) {
        return "text/plain";
    }

    "application/octet-stream"
}

fn find_subsequence(haystack: &[u8], needle: &[u8]) -> bool {
    // Only scan the head; the EICAR file is tiny by definition.
    let window = haystack.len().min(1024 * 1024);
    haystack[..window]
        .windows(needle.len())
        .any(|w| w == needle)
}
