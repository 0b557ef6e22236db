//! Download, range, view, and info endpoint tests.

mod common;

use axum::http::{StatusCode, header};
use common::fixtures::{get_request, json_body, raw_body, seeded_bytes, sha256_hex, simple_upload};
use common::server::TestServer;
use tower::ServiceExt;

/// Upload 20 known bytes and return (reference_id, data).
async fn upload_twenty_bytes(server: &TestServer) -> (String, Vec<u8>) {
    let data: Vec<u8> = (0u8..20).collect();
    let response = server
        .app()
        .oneshot(simple_upload("T-1", "twenty.bin", data.clone()))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);
    let body = json_body(response).await;
    (body["reference_id"].as_str().unwrap().to_string(), data)
}

#[tokio::test]
async fn test_download_roundtrip() {
    let server = TestServer::new().await;
    let data = seeded_bytes(1, 50_000);

    let response = server
        .app()
        .oneshot(simple_upload("T-1", "blob.bin", data.clone()))
        .await
        .unwrap();
    let reference_id = json_body(response).await["reference_id"]
        .as_str()
        .unwrap()
        .to_string();

    let response = server
        .app()
        .oneshot(get_request(
            &format!("/api/v1/download/{reference_id}"),
            "alice",
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers()[header::CONTENT_LENGTH],
        data.len().to_string()
    );
    let disposition = response.headers()[header::CONTENT_DISPOSITION]
        .to_str()
        .unwrap()
        .to_string();
    assert!(disposition.starts_with("attachment"));
    assert!(disposition.contains("blob.bin"));
    assert_eq!(
        response.headers()[header::ACCEPT_RANGES].to_str().unwrap(),
        "bytes"
    );

    assert_eq!(raw_body(response).await, data);
}

#[tokio::test]
async fn test_range_request_first_ten_bytes() {
    let server = TestServer::new().await;
    let (reference_id, data) = upload_twenty_bytes(&server).await;

    let request = axum::http::Request::builder()
        .uri(format!("/api/v1/download/{reference_id}"))
        .header("x-depot-user", "alice")
        .header(header::RANGE, "bytes=0-9")
        .body(axum::body::Body::empty())
        .unwrap();
    let response = server.app().oneshot(request).await.unwrap();

    assert_eq!(response.status(), StatusCode::PARTIAL_CONTENT);
    assert_eq!(
        response.headers()[header::CONTENT_RANGE].to_str().unwrap(),
        "bytes 0-9/20"
    );
    assert_eq!(
        response.headers()[header::CONTENT_LENGTH].to_str().unwrap(),
        "10"
    );
    assert_eq!(raw_body(response).await, data[..10]);
}

#[tokio::test]
async fn test_range_request_suffix() {
    let server = TestServer::new().await;
    let (reference_id, data) = upload_twenty_bytes(&server).await;

    let request = axum::http::Request::builder()
        .uri(format!("/api/v1/download/{reference_id}"))
        .header("x-depot-user", "alice")
        .header(header::RANGE, "bytes=-5")
        .body(axum::body::Body::empty())
        .unwrap();
    let response = server.app().oneshot(request).await.unwrap();

    assert_eq!(response.status(), StatusCode::PARTIAL_CONTENT);
    assert_eq!(
        response.headers()[header::CONTENT_RANGE].to_str().unwrap(),
        "bytes 15-19/20"
    );
    assert_eq!(raw_body(response).await, data[15..]);
}

#[tokio::test]
async fn test_out_of_bounds_range_rejected_not_clamped() {
    let server = TestServer::new().await;
    let (reference_id, _) = upload_twenty_bytes(&server).await;

    let request = axum::http::Request::builder()
        .uri(format!("/api/v1/download/{reference_id}"))
        .header("x-depot-user", "alice")
        .header(header::RANGE, "bytes=0-1000")
        .body(axum::body::Body::empty())
        .unwrap();
    let response = server.app().oneshot(request).await.unwrap();

    assert_eq!(response.status(), StatusCode::RANGE_NOT_SATISFIABLE);
}

#[tokio::test]
async fn test_open_ended_range() {
    let server = TestServer::new().await;
    let (reference_id, data) = upload_twenty_bytes(&server).await;

    let request = axum::http::Request::builder()
        .uri(format!("/api/v1/download/{reference_id}"))
        .header("x-depot-user", "alice")
        .header(header::RANGE, "bytes=12-")
        .body(axum::body::Body::empty())
        .unwrap();
    let response = server.app().oneshot(request).await.unwrap();

    assert_eq!(response.status(), StatusCode::PARTIAL_CONTENT);
    assert_eq!(
        response.headers()[header::CONTENT_RANGE].to_str().unwrap(),
        "bytes 12-19/20"
    );
    assert_eq!(raw_body(response).await, data[12..]);
}

#[tokio::test]
async fn test_view_sets_etag_and_inline_disposition() {
    let server = TestServer::new().await;
    let data = seeded_bytes(5, 1000);
    let hash = sha256_hex(&data);

    let response = server
        .app()
        .oneshot(simple_upload("T-1", "img.bin", data.clone()))
        .await
        .unwrap();
    let reference_id = json_body(response).await["reference_id"]
        .as_str()
        .unwrap()
        .to_string();

    let response = server
        .app()
        .oneshot(get_request(&format!("/api/v1/view/{reference_id}"), "alice"))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let etag = response.headers()[header::ETAG].to_str().unwrap().to_string();
    assert_eq!(etag, format!("\"{hash}\""));
    assert!(
        response.headers()[header::CONTENT_DISPOSITION]
            .to_str()
            .unwrap()
            .starts_with("inline")
    );
    assert!(
        response.headers()[header::CACHE_CONTROL]
            .to_str()
            .unwrap()
            .contains("max-age=")
    );

    // Conditional revalidation: matching ETag short-circuits to 304.
    let request = axum::http::Request::builder()
        .uri(format!("/api/v1/view/{reference_id}"))
        .header("x-depot-user", "alice")
        .header(header::IF_NONE_MATCH, etag)
        .body(axum::body::Body::empty())
        .unwrap();
    let response = server.app().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::NOT_MODIFIED);
}

#[tokio::test]
async fn test_info_returns_metadata_without_body() {
    let server = TestServer::new().await;
    let data = seeded_bytes(6, 2048);
    let hash = sha256_hex(&data);

    let response = server
        .app()
        .oneshot(simple_upload("T-7", "doc.bin", data))
        .await
        .unwrap();
    let reference_id = json_body(response).await["reference_id"]
        .as_str()
        .unwrap()
        .to_string();

    let response = server
        .app()
        .oneshot(get_request(&format!("/api/v1/info/{reference_id}"), "alice"))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let body = json_body(response).await;
    assert_eq!(body["file_hash"], hash.as_str());
    assert_eq!(body["filename"], "doc.bin");
    assert_eq!(body["size_bytes"], 2048);
    assert_eq!(body["entity_type"], "ticket");
    assert_eq!(body["entity_id"], "T-7");
    assert_eq!(body["uploader_id"], "alice");
}

#[tokio::test]
async fn test_unknown_reference_is_404() {
    let server = TestServer::new().await;

    let response = server
        .app()
        .oneshot(get_request(
            &format!("/api/v1/download/{}", uuid::Uuid::new_v4()),
            "alice",
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    // Malformed reference ids are a validation error, not a 500.
    let response = server
        .app()
        .oneshot(get_request("/api/v1/download/not-a-uuid", "alice"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}
