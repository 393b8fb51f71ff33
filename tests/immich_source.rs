use std::collections::HashMap;
use std::sync::Arc;

use axum::Router;
use axum::extract::{Path, Query};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use photo_cache::source::{AuthOutcome, ImmichSource, PhotoRef, PhotoSource};
use serde_json::{Value, json};
use tokio::net::TcpListener;

const TOKEN: &str = "secret-token";

fn authorized(headers: &HeaderMap) -> bool {
    headers
        .get("authorization")
        .and_then(|value| value.to_str().ok())
        .is_some_and(|value| value == format!("Bearer {TOKEN}"))
}

async fn login(Json(body): Json<Value>) -> Json<Value> {
    if body["password"] == "hunter2" {
        Json(json!({ "accessToken": TOKEN, "userEmail": body["email"] }))
    } else {
        Json(json!({ "userEmail": body["email"] }))
    }
}

async fn albums(headers: HeaderMap) -> Response {
    if !authorized(&headers) {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    Json(json!([
        { "id": "album-other", "albumName": "Work" },
        { "id": "album-family", "albumName": "Family" },
    ]))
    .into_response()
}

async fn buckets(headers: HeaderMap, Query(query): Query<HashMap<String, String>>) -> Response {
    if !authorized(&headers) {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    assert_eq!(query.get("size").map(String::as_str), Some("MONTH"));
    assert_eq!(query.get("albumId").map(String::as_str), Some("album-family"));
    Json(json!([
        { "timeBucket": "2024-02-01T00:00:00.000Z", "count": 2 },
        { "timeBucket": "2023-06-01T00:00:00.000Z", "count": 0 },
        { "timeBucket": "2023-12-01T00:00:00.000Z", "count": 1 },
    ]))
    .into_response()
}

async fn bucket(Query(query): Query<HashMap<String, String>>) -> Json<Value> {
    match query.get("timeBucket").map(String::as_str) {
        Some("2024-02-01T00:00:00.000Z") => Json(json!([
            {
                "id": "asset-1",
                "type": "IMAGE",
                "originalFileName": "IMG_0001.HEIC",
                "fileCreatedAt": "2024-02-03T10:00:00.000Z",
                "exifInfo": {
                    "exifImageWidth": 4032,
                    "exifImageHeight": 3024,
                    "dateTimeOriginal": "2024-02-02T09:30:00.000Z"
                }
            },
            {
                "id": "asset-2",
                "type": "VIDEO",
                "originalFileName": "MOV_0002.MOV",
                "fileCreatedAt": "2024-02-04T10:00:00.000Z"
            }
        ])),
        _ => Json(json!([])),
    }
}

async fn asset(Path(id): Path<String>) -> Response {
    if id == "asset-9" {
        Json(json!({
            "id": "asset-9",
            "type": "IMAGE",
            "originalFileName": "scan.png",
            "fileCreatedAt": "2019-05-01T00:00:00.000Z"
        }))
        .into_response()
    } else {
        StatusCode::NOT_FOUND.into_response()
    }
}

async fn thumbnail(
    Path(id): Path<String>,
    Query(query): Query<HashMap<String, String>>,
) -> Response {
    assert_eq!(query.get("size").map(String::as_str), Some("preview"));
    match id.as_str() {
        "asset-1" => (StatusCode::OK, vec![0xFFu8, 0xD8, 0xFF, 0xD9]).into_response(),
        "flaky" => StatusCode::SERVICE_UNAVAILABLE.into_response(),
        "expired" => StatusCode::UNAUTHORIZED.into_response(),
        "forbidden" => StatusCode::FORBIDDEN.into_response(),
        _ => StatusCode::NOT_FOUND.into_response(),
    }
}

async fn mock_server() -> String {
    let app = Router::new()
        .route("/api/auth/login", post(login))
        .route("/api/albums", get(albums))
        .route("/api/timeline/buckets", get(buckets))
        .route("/api/timeline/bucket", get(bucket))
        .route("/api/assets/{id}", get(asset))
        .route("/api/assets/{id}/thumbnail", get(thumbnail));
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{addr}/")
}

async fn blocking<T: Send + 'static>(f: impl FnOnce() -> T + Send + 'static) -> T {
    tokio::task::spawn_blocking(f).await.unwrap()
}

#[tokio::test(flavor = "multi_thread")]
async fn lists_album_buckets_and_images() {
    let url = mock_server().await;
    let source = Arc::new(ImmichSource::new(&url, Some("Family".to_string())));

    let src = source.clone();
    let outcome = blocking(move || src.authenticate("frame@example.com", "hunter2"))
        .await
        .unwrap();
    assert_eq!(outcome, AuthOutcome::LoggedIn);

    let src = source.clone();
    let buckets = blocking(move || src.list_buckets()).await.unwrap();
    let labels: Vec<&str> = buckets.iter().map(|b| b.time_label.as_str()).collect();
    assert_eq!(
        labels,
        vec!["2023-12-01T00:00:00.000Z", "2024-02-01T00:00:00.000Z"]
    );

    let src = source.clone();
    let february = buckets[1].clone();
    let photos = blocking(move || src.list_photos(&february)).await.unwrap();
    assert_eq!(photos.len(), 1);
    assert_eq!(photos[0].photo_id, "asset-1");

    let src = source.clone();
    let photo = photos[0].clone();
    let metadata = blocking(move || src.metadata(&photo)).await.unwrap();
    assert_eq!(metadata.filename, "IMG_0001.HEIC");
    assert_eq!(metadata.dimensions, Some((4032, 3024)));
    assert_eq!(
        metadata.created_at.map(|t| t.to_rfc3339()),
        Some("2024-02-02T09:30:00+00:00".to_string())
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn unknown_assets_are_fetched_individually() {
    let url = mock_server().await;
    let source = Arc::new(ImmichSource::new(&url, None));
    let photo = PhotoRef {
        bucket_id: "2019-05-01T00:00:00.000Z".to_string(),
        photo_id: "asset-9".to_string(),
    };
    let metadata = blocking(move || source.metadata(&photo)).await.unwrap();
    assert_eq!(metadata.filename, "scan.png");
    assert_eq!(metadata.dimensions, None);
}

#[tokio::test(flavor = "multi_thread")]
async fn password_without_token_needs_second_factor() {
    let url = mock_server().await;
    let source = ImmichSource::new(&url, None);
    let outcome = blocking(move || source.authenticate("frame@example.com", "wrong"))
        .await
        .unwrap();
    assert_eq!(outcome, AuthOutcome::MfaRequired);
}

#[tokio::test(flavor = "multi_thread")]
async fn rejected_credentials_are_transient() {
    let url = mock_server().await;
    let source = ImmichSource::new(&url, None);
    let err = blocking(move || source.list_buckets()).await.unwrap_err();
    assert!(!err.is_permanent(), "{err}");
}

#[tokio::test(flavor = "multi_thread")]
async fn downloads_classify_failures() {
    let url = mock_server().await;
    let dir = tempfile::tempdir().unwrap();
    let source = Arc::new(ImmichSource::new(&url, None));

    let src = source.clone();
    let target = dir.path().join("asset-1.jpg");
    let written = target.clone();
    let bytes = blocking(move || {
        src.fetch(
            &PhotoRef {
                bucket_id: "b".into(),
                photo_id: "asset-1".into(),
            },
            &written,
        )
    })
    .await
    .unwrap();
    assert_eq!(bytes, 4);
    assert_eq!(std::fs::read(&target).unwrap(), vec![0xFF, 0xD8, 0xFF, 0xD9]);

    let src = source.clone();
    let missing = dir.path().join("missing.jpg");
    let err = blocking(move || {
        src.fetch(
            &PhotoRef {
                bucket_id: "b".into(),
                photo_id: "missing".into(),
            },
            &missing,
        )
    })
    .await
    .unwrap_err();
    assert!(err.is_permanent());

    for photo_id in ["expired", "forbidden"] {
        let src = source.clone();
        let target = dir.path().join(format!("{photo_id}.jpg"));
        let err = blocking(move || {
            src.fetch(
                &PhotoRef {
                    bucket_id: "b".into(),
                    photo_id: photo_id.into(),
                },
                &target,
            )
        })
        .await
        .unwrap_err();
        assert!(!err.is_permanent(), "{photo_id}: {err}");
    }

    let flaky = dir.path().join("flaky.jpg");
    let err = blocking(move || {
        source.fetch(
            &PhotoRef {
                bucket_id: "b".into(),
                photo_id: "flaky".into(),
            },
            &flaky,
        )
    })
    .await
    .unwrap_err();
    assert!(!err.is_permanent());
}
