//! Test fixtures: request builders and multipart form encoding.

use axum::body::Body;
use axum::http::{Request, Response, header};
use sha2::{Digest, Sha256};

/// Deterministic test data based on a seed.
/// Note: #[allow(dead_code)] because each test file compiles common/
/// separately.
#[allow(dead_code)]
pub fn seeded_bytes(seed: u64, len: usize) -> Vec<u8> {
    let mut data = vec![0u8; len];
    let mut state = seed;
    for chunk in data.chunks_mut(8) {
        state = state.wrapping_mul(6364136223846793005).wrapping_add(1);
        let bytes = state.to_le_bytes();
        for (i, byte) in chunk.iter_mut().enumerate() {
            *byte = bytes[i % 8];
        }
    }
    data
}

/// SHA-256 hex digest of data.
#[allow(dead_code)]
pub fn sha256_hex(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hasher.finalize().iter().map(|b| format!("{b:02x}")).collect()
}

/// One part of a multipart form body.
#[allow(dead_code)]
pub struct Part {
    pub name: &'static str,
    pub filename: Option<String>,
    pub content_type: Option<&'static str>,
    pub data: Vec<u8>,
}

#[allow(dead_code)]
impl Part {
    pub fn text(name: &'static str, value: &str) -> Self {
        Self {
            name,
            filename: None,
            content_type: None,
            data: value.as_bytes().to_vec(),
        }
    }

    pub fn file(name: &'static str, filename: &str, content_type: &'static str, data: Vec<u8>) -> Self {
        Self {
            name,
            filename: Some(filename.to_string()),
            content_type: Some(content_type),
            data,
        }
    }
}

pub const BOUNDARY: &str = "depot-test-boundary-7f3a";

/// Encode parts as a multipart/form-data body.
#[allow(dead_code)]
pub fn multipart_body(parts: &[Part]) -> Vec<u8> {
    let mut body = Vec::new();
    for part in parts {
        body.extend_from_slice(format!("--{BOUNDARY}\r\n").as_bytes());
        match &part.filename {
            Some(filename) => body.extend_from_slice(
                format!(
                    "Content-Disposition: form-data; name=\"{}\"; filename=\"{}\"\r\n",
                    part.name, filename
                )
                .as_bytes(),
            ),
            None => body.extend_from_slice(
                format!("Content-Disposition: form-data; name=\"{}\"\r\n", part.name).as_bytes(),
            ),
        }
        if let Some(content_type) = part.content_type {
            body.extend_from_slice(format!("Content-Type: {content_type}\r\n").as_bytes());
        }
        body.extend_from_slice(b"\r\n");
        body.extend_from_slice(&part.data);
        body.extend_from_slice(b"\r\n");
    }
    body.extend_from_slice(format!("--{BOUNDARY}--\r\n").as_bytes());
    body
}

/// Build a multipart upload request for the given path.
#[allow(dead_code)]
pub fn upload_request(path: &str, user: &str, parts: &[Part]) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(path)
        .header(
            header::CONTENT_TYPE,
            format!("multipart/form-data; boundary={BOUNDARY}"),
        )
        .header("x-depot-user", user)
        .body(Body::from(multipart_body(parts)))
        .unwrap()
}

/// Standard single-file upload request with ticket metadata.
#[allow(dead_code)]
pub fn simple_upload(entity_id: &str, filename: &str, data: Vec<u8>) -> Request<Body> {
    upload_request(
        "/api/v1/upload",
        "alice",
        &[
            Part::file("file", filename, "application/octet-stream", data),
            Part::text("entity_type", "ticket"),
            Part::text("entity_id", entity_id),
        ],
    )
}

/// GET request with a user header.
#[allow(dead_code)]
pub fn get_request(path: &str, user: &str) -> Request<Body> {
    Request::builder()
        .method("GET")
        .uri(path)
        .header("x-depot-user", user)
        .body(Body::empty())
        .unwrap()
}

/// Request with the admin role.
#[allow(dead_code)]
pub fn admin_request(method: &str, path: &str) -> Request<Body> {
    Request::builder()
        .method(method)
        .uri(path)
        .header("x-depot-user", "root")
        .header("x-depot-role", "admin")
        .body(Body::empty())
        .unwrap()
}

/// Read a response body as JSON.
#[allow(dead_code)]
pub async fn json_body(response: Response<Body>) -> serde_json::Value {
    let bytes = axum::body::to_bytes(response.into_body(), 64 * 1024 * 1024)
        .await
        .unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

/// Read a response body as raw bytes.
#[allow(dead_code)]
pub async fn raw_body(response: Response<Body>) -> Vec<u8> {
    axum::body::to_bytes(response.into_body(), 64 * 1024 * 1024)
        .await
        .unwrap()
        .to_vec()
}
