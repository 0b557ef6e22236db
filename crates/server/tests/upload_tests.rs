//! Upload endpoint tests: deduplication accounting, validation, scanning,
//! batch behavior, and quotas.

mod common;

use axum::http::StatusCode;
use common::fixtures::{
    Part, json_body, seeded_bytes, sha256_hex, simple_upload, upload_request,
};
use common::server::TestServer;
use tower::ServiceExt;

#[tokio::test]
async fn test_upload_returns_reference_and_hash() {
    let server = TestServer::new().await;
    let data = seeded_bytes(1, 4096);
    let expected_hash = sha256_hex(&data);

    let response = server
        .app()
        .oneshot(simple_upload("TICKET-1", "report.bin", data))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::CREATED);
    let body = json_body(response).await;
    assert_eq!(body["file_hash"], expected_hash.as_str());
    assert_eq!(body["filename"], "report.bin");
    assert_eq!(body["size_bytes"], 4096);
    assert_eq!(body["deduplicated"], false);
    assert_eq!(body["saved_bytes"], 0);
    assert!(body["reference_id"].as_str().is_some());
}

#[tokio::test]
async fn test_identical_uploads_deduplicate_with_saved_bytes() {
    let server = TestServer::new().await;
    let data = seeded_bytes(2, 10_000);
    let hash = sha256_hex(&data);

    // First upload of this content writes the blob.
    let response = server
        .app()
        .oneshot(simple_upload("TICKET-1", "a.bin", data.clone()))
        .await
        .unwrap();
    let first = json_body(response).await;
    assert_eq!(first["deduplicated"], false);
    assert_eq!(first["saved_bytes"], 0);

    // Uploads 2..N of byte-identical content under different entities
    // attach to the same content object and report the full size saved.
    for i in 2..=4 {
        let response = server
            .app()
            .oneshot(simple_upload(&format!("TICKET-{i}"), "b.bin", data.clone()))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
        let body = json_body(response).await;
        assert_eq!(body["file_hash"], hash.as_str());
        assert_eq!(body["deduplicated"], true);
        assert_eq!(body["saved_bytes"], 10_000);
    }

    // Exactly one content object with ref_count == 4.
    let content = server
        .state
        .metadata
        .get_content(&hash)
        .await
        .unwrap()
        .expect("content object exists");
    assert_eq!(content.ref_count, 4);

    let stats = server.state.engine.stats().await.unwrap();
    assert_eq!(stats.total_files, 1);
    assert_eq!(stats.total_references, 4);
    assert_eq!(stats.shared_files, 1);
    assert_eq!(stats.saved_bytes_total, 30_000);
}

#[tokio::test]
async fn test_upload_requires_authentication() {
    let server = TestServer::new().await;
    let request = upload_request(
        "/api/v1/upload",
        "", // empty user header is treated as anonymous
        &[
            Part::file("file", "a.txt", "text/plain", b"data".to_vec()),
            Part::text("entity_type", "ticket"),
            Part::text("entity_id", "T-1"),
        ],
    );

    let response = server.app().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_upload_validation_failures() {
    let server = TestServer::new().await;

    // Missing entity_type.
    let request = upload_request(
        "/api/v1/upload",
        "alice",
        &[
            Part::file("file", "a.txt", "text/plain", b"data".to_vec()),
            Part::text("entity_id", "T-1"),
        ],
    );
    let response = server.app().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    // Unknown entity type.
    let request = upload_request(
        "/api/v1/upload",
        "alice",
        &[
            Part::file("file", "a.txt", "text/plain", b"data".to_vec()),
            Part::text("entity_type", "starship"),
            Part::text("entity_id", "T-1"),
        ],
    );
    let response = server.app().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    // Missing file field.
    let request = upload_request(
        "/api/v1/upload",
        "alice",
        &[
            Part::text("entity_type", "ticket"),
            Part::text("entity_id", "T-1"),
        ],
    );
    let response = server.app().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    // Validation failures leave no rows behind.
    let stats = server.state.engine.stats().await.unwrap();
    assert_eq!(stats.total_files, 0);
}

#[tokio::test]
async fn test_blocked_extension_is_security_rejection() {
    let server = TestServer::new().await;
    let request = upload_request(
        "/api/v1/upload",
        "alice",
        &[
            Part::file("file", "payload.exe", "application/octet-stream", b"MZ\x90\x00data".to_vec()),
            Part::text("entity_type", "ticket"),
            Part::text("entity_id", "T-1"),
        ],
    );

    let response = server.app().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
    let body = json_body(response).await;
    assert_eq!(body["error"], "security_rejection");
}

#[tokio::test]
async fn test_eicar_content_is_rejected() {
    let server = TestServer::new().await;
    let mut data = b"prefix ".to_vec();
    data.extend_from_slice(
        br"X5O!P%@AP[4\PZX54(P^)7CC)7}$EICAR-STANDARD-ANTIVIRUS-TEST-FILE!$H+H*",
    );

    let request = upload_request(
        "/api/v1/upload",
        "alice",
        &[
            Part::file("file", "innocent.txt", "text/plain", data),
            Part::text("entity_type", "ticket"),
            Part::text("entity_id", "T-1"),
        ],
    );

    let response = server.app().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
    let body = json_body(response).await;
    assert!(
        body["details"].as_str().unwrap().contains("EICAR"),
        "details should name the signature: {body}"
    );
}

#[tokio::test]
async fn test_batch_upload_partial_failure_reports_per_item() {
    let server = TestServer::new().await;

    let request = upload_request(
        "/api/v1/upload/multiple",
        "alice",
        &[
            Part::file("files", "one.txt", "text/plain", seeded_bytes(10, 256)),
            Part::file("files", "bad.exe", "application/octet-stream", b"MZ!".to_vec()),
            Part::file("files", "two.txt", "text/plain", seeded_bytes(11, 256)),
            Part::text("entity_type", "ticket"),
            Part::text("entity_id", "T-9"),
            Part::text("tags", "batch,test"),
        ],
    );

    let response = server.app().oneshot(request).await.unwrap();
    // One bad file never aborts the batch; the endpoint answers 200.
    assert_eq!(response.status(), StatusCode::OK);

    let body = json_body(response).await;
    assert_eq!(body["summary"]["total"], 3);
    assert_eq!(body["summary"]["successful"], 2);
    assert_eq!(body["summary"]["failed"], 1);
    assert_eq!(body["uploads"].as_array().unwrap().len(), 2);
    assert_eq!(body["errors"][0]["filename"], "bad.exe");
    assert_eq!(body["errors"][0]["error"], "security_rejection");
}

#[tokio::test]
async fn test_batch_upload_rejects_too_many_files() {
    let server = TestServer::with_config(|c| c.server.max_batch_files = 2).await;

    let request = upload_request(
        "/api/v1/upload/multiple",
        "alice",
        &[
            Part::file("files", "1.txt", "text/plain", b"one".to_vec()),
            Part::file("files", "2.txt", "text/plain", b"two".to_vec()),
            Part::file("files", "3.txt", "text/plain", b"three".to_vec()),
            Part::text("entity_type", "ticket"),
            Part::text("entity_id", "T-9"),
        ],
    );

    let response = server.app().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_quota_exceeded_rejects_upload() {
    let server = TestServer::with_config(|c| {
        c.quota.enabled = true;
        c.quota.default_limit_bytes = 1000;
        c.quota.default_limit_files = 100;
    })
    .await;

    let response = server
        .app()
        .oneshot(simple_upload("T-1", "small.bin", seeded_bytes(20, 600)))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);

    // Second upload would overshoot the 1000-byte budget.
    let response = server
        .app()
        .oneshot(simple_upload("T-2", "big.bin", seeded_bytes(21, 600)))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
    let body = json_body(response).await;
    assert_eq!(body["error"], "quota_exceeded");
}

#[tokio::test]
async fn test_upload_larger_than_limit_rejected() {
    let server = TestServer::with_config(|c| {
        c.server.max_upload_size_bytes = 1024;
    })
    .await;

    let response = server
        .app()
        .oneshot(simple_upload("T-1", "big.bin", seeded_bytes(30, 4096)))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
}

#[tokio::test]
async fn test_upload_spills_large_files_through_spool() {
    // Spool threshold far below the payload size forces the temp-file path.
    let server = TestServer::with_config(|c| {
        c.server.spool_threshold_bytes = 1024;
    })
    .await;
    let data = seeded_bytes(40, 64 * 1024);
    let hash = sha256_hex(&data);

    let response = server
        .app()
        .oneshot(simple_upload("T-1", "large.bin", data))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);
    let body = json_body(response).await;
    assert_eq!(body["file_hash"], hash.as_str());
}
