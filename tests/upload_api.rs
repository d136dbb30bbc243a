use axum::{
    Router,
    body::{Body, to_bytes},
    http::{Request, StatusCode, header},
};
use chunked_upload::{AppState, config::AppConfig, create_app, db};
use http_body_util::BodyExt;
use serde_json::Value;
use std::sync::Arc;
use tempfile::TempDir;
use tower::ServiceExt;

const BOUNDARY: &str = "chunked-upload-test-boundary";

struct TestApp {
    app: Router,
    // Keeps the storage, staging and database directories alive.
    _dir: TempDir,
}

async fn setup() -> TestApp {
    let dir = tempfile::tempdir().unwrap();
    let cfg = AppConfig {
        host: "127.0.0.1".into(),
        port: 0,
        storage_dir: dir.path().join("files").to_string_lossy().into_owned(),
        staging_dir: dir.path().join("staging").to_string_lossy().into_owned(),
        database_url: format!("sqlite://{}", dir.path().join("meta/uploads.db").display()),
        session_ttl_secs: 3600,
        completed_retention_secs: 60,
        sweep_interval_secs: 60,
        max_chunk_bytes: 1024 * 1024,
        max_total_chunks: 1000,
        purge_files_on_delete: false,
    };
    std::fs::create_dir_all(&cfg.storage_dir).unwrap();
    std::fs::create_dir_all(&cfg.staging_dir).unwrap();

    let pool = db::connect(&cfg.database_url).await.unwrap();
    db::run_migrations(&pool).await.unwrap();

    let state = AppState::new(Arc::new(pool), &cfg);
    TestApp {
        app: create_app(state, cfg.max_chunk_bytes),
        _dir: dir,
    }
}

fn multipart_body(fields: &[(&str, &str)], chunk: &[u8]) -> Vec<u8> {
    let mut body = Vec::new();
    for (name, value) in fields {
        body.extend_from_slice(
            format!(
                "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"{name}\"\r\n\r\n{value}\r\n"
            )
            .as_bytes(),
        );
    }
    body.extend_from_slice(
        format!(
            "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"fileChunk\"; filename=\"blob\"\r\n\
             Content-Type: application/octet-stream\r\n\r\n"
        )
        .as_bytes(),
    );
    body.extend_from_slice(chunk);
    body.extend_from_slice(format!("\r\n--{BOUNDARY}--\r\n").as_bytes());
    body
}

fn chunk_request(
    upload_id: &str,
    index: u32,
    total: u32,
    file_name: &str,
    order_data: &str,
    bytes: &[u8],
) -> Request<Body> {
    let index = index.to_string();
    let total = total.to_string();
    let body = multipart_body(
        &[
            ("uploadId", upload_id),
            ("chunkIndex", &index),
            ("totalChunks", &total),
            ("fileName", file_name),
            ("orderData", order_data),
        ],
        bytes,
    );
    Request::builder()
        .method("POST")
        .uri("/api/uploads/chunks")
        .header(
            header::CONTENT_TYPE,
            format!("multipart/form-data; boundary={BOUNDARY}"),
        )
        .header("x-user-id", "7")
        .header("x-user-name", "lab tech")
        .header("x-organization-id", "org-1")
        .body(Body::from(body))
        .unwrap()
}

fn get(uri: &str) -> Request<Body> {
    Request::builder()
        .uri(uri)
        .header("x-user-id", "7")
        .body(Body::empty())
        .unwrap()
}

async fn json_body(response: axum::response::Response) -> Value {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}

#[tokio::test]
async fn out_of_order_chunks_merge_and_download_in_index_order() {
    let t = setup().await;
    let order = r#"{"patientName":"Chen","productName":"Crown","description":"upper left"}"#;

    for (index, bytes) in [(1u32, b"B"), (0, b"A")] {
        let response = t
            .app
            .clone()
            .oneshot(chunk_request("u1", index, 3, "scan.stl", order, bytes))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = json_body(response).await;
        assert_eq!(body["message"], "Chunk uploaded successfully.");
    }

    let response = t
        .app
        .clone()
        .oneshot(chunk_request("u1", 2, 3, "scan.stl", order, b"C"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = json_body(response).await;
    assert_eq!(body["message"], "Files uploaded successfully.");
    assert_eq!(body["sizeBytes"], 3);
    assert!(body["fileName"].as_str().unwrap().ends_with(".stl"));
    let id = body["id"].as_str().unwrap().to_string();

    let response = t
        .app
        .clone()
        .oneshot(get(&format!("/api/files/{id}")))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let record = json_body(response).await;
    assert_eq!(record["patientName"], "Chen");
    assert_eq!(record["uploaderId"], "7");
    assert_eq!(record["organizationId"], "org-1");
    assert_eq!(record["originalName"], "scan.stl");

    let response = t
        .app
        .clone()
        .oneshot(get(&format!("/api/files/{id}/download")))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers()[header::CONTENT_DISPOSITION],
        "attachment; filename=\"scan.stl\""
    );
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    assert_eq!(&bytes[..], b"ABC");
}

#[tokio::test]
async fn merge_endpoint_reports_missing_chunk_then_succeeds_after_resend() {
    let t = setup().await;

    for index in [0u32, 1, 3, 4] {
        let response = t
            .app
            .clone()
            .oneshot(chunk_request("gap", index, 5, "part.bin", "", &[index as u8]))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    let merge = || {
        Request::builder()
            .method("POST")
            .uri("/api/uploads/gap/merge")
            .header(header::CONTENT_TYPE, "application/json")
            .header("x-user-id", "7")
            .body(Body::from(r#"{"fileName":"part.bin"}"#))
            .unwrap()
    };

    let response = t.app.clone().oneshot(merge()).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body = json_body(response).await;
    assert!(body["error"].as_str().unwrap().contains("Chunk 2 is missing"));

    // The resent chunk completes the set and merges on its own.
    let response = t
        .app
        .clone()
        .oneshot(chunk_request("gap", 2, 5, "part.bin", "", &[2]))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = json_body(response).await;
    assert_eq!(body["sizeBytes"], 5);

    // A late retry replays the recorded result.
    let response = t.app.clone().oneshot(merge()).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let replay = json_body(response).await;
    assert_eq!(replay["id"], body["id"]);
}

#[tokio::test]
async fn list_filters_and_soft_delete() {
    let t = setup().await;

    let uploads = [
        ("p1", r#"{"patientName":"Alice Wong","productName":"Crown"}"#),
        ("p2", r#"{"patientName":"Bob Li","productName":"Bridge"}"#),
    ];
    for (upload_id, order) in uploads {
        let response = t
            .app
            .clone()
            .oneshot(chunk_request(upload_id, 0, 1, "x.stl", order, b"data"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    let response = t.app.clone().oneshot(get("/api/files")).await.unwrap();
    let body = json_body(response).await;
    assert_eq!(body["total"], 2);

    let response = t
        .app
        .clone()
        .oneshot(get("/api/files?patientName=alice"))
        .await
        .unwrap();
    let body = json_body(response).await;
    assert_eq!(body["total"], 1);
    assert_eq!(body["data"][0]["productName"], "Crown");
    let id = body["data"][0]["id"].as_str().unwrap().to_string();

    let response = t
        .app
        .clone()
        .oneshot(get("/api/files?uploadStartDate=2000-01-01&uploadEndDate=2000-01-02"))
        .await
        .unwrap();
    assert_eq!(json_body(response).await["total"], 0);

    let response = t
        .app
        .clone()
        .oneshot(get("/api/files?uploadStartDate=yesterday"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let delete = Request::builder()
        .method("DELETE")
        .uri(format!("/api/files/{id}"))
        .header("x-user-id", "7")
        .body(Body::empty())
        .unwrap();
    let response = t.app.clone().oneshot(delete).await.unwrap();
    assert_eq!(response.status(), StatusCode::NO_CONTENT);

    let response = t
        .app
        .clone()
        .oneshot(get(&format!("/api/files/{id}")))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    let response = t.app.clone().oneshot(get("/api/files")).await.unwrap();
    assert_eq!(json_body(response).await["total"], 1);
}

#[tokio::test]
async fn chunk_upload_without_identity_is_unauthorized() {
    let t = setup().await;
    let mut request = chunk_request("anon", 0, 1, "x.bin", "", b"z");
    request.headers_mut().remove("x-user-id");

    let response = t.app.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn invalid_chunk_coordinates_are_rejected() {
    let t = setup().await;

    let response = t
        .app
        .clone()
        .oneshot(chunk_request("bad", 3, 3, "x.bin", "", b"z"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let response = t
        .app
        .clone()
        .oneshot(chunk_request("../escape", 0, 1, "x.bin", "", b"z"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let response = t
        .app
        .clone()
        .oneshot(chunk_request("huge", 1, u32::MAX, "x.bin", "", b"z"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body = json_body(response).await;
    assert!(body["error"].as_str().unwrap().contains("exceeds the limit"));
}

#[tokio::test]
async fn health_endpoints_report_ok() {
    let t = setup().await;

    let response = t.app.clone().oneshot(get("/healthz")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let response = t.app.clone().oneshot(get("/readyz")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = json_body(response).await;
    assert_eq!(body["checks"]["staging"]["ok"], true);
}
