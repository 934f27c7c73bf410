// Integration tests for `ReleaseLocator` against a local mock of the releases API.

use serde_json::json;
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use padawan_force_lib::update::{ReleaseLocator, UpdateError};

const LATEST: &str = "/repos/Ghost3379/PadAwan/releases/latest";

async fn setup() -> (MockServer, ReleaseLocator) {
    let server = MockServer::start().await;
    let locator = ReleaseLocator::new("Ghost3379", "PadAwan").with_api_base(server.uri());
    (server, locator)
}

fn release_body(server: &MockServer, tag: &str, body: &str) -> serde_json::Value {
    json!({
        "tag_name": tag,
        "body": body,
        "published_at": "2025-10-01T12:00:00Z",
        "assets": [
            { "name": "checksums.txt", "browser_download_url": format!("{}/dl/checksums.txt", server.uri()), "size": 64 },
            { "name": "padawan-force.bin", "browser_download_url": format!("{}/dl/padawan-force.bin", server.uri()), "size": 4096 }
        ]
    })
}

#[tokio::test]
async fn test_latest_release_picks_bin_asset() {
    let (server, locator) = setup().await;

    Mock::given(method("GET"))
        .and(path(LATEST))
        .and(header("User-Agent", "PadAwan-Force-Updater"))
        .respond_with(ResponseTemplate::new(200).set_body_json(release_body(&server, "release-2025-10", "Firmware: v1.4.0")))
        .mount(&server)
        .await;

    let release = locator.latest_release().await.unwrap();
    assert_eq!(release.firmware_version, "v1.4.0");
    assert_eq!(release.asset_name, "padawan-force.bin");
    assert_eq!(release.size_bytes, 4096);
    assert!(release.download_url.ends_with("/dl/padawan-force.bin"));
}

#[tokio::test]
async fn test_latest_release_http_error() {
    let (server, locator) = setup().await;

    Mock::given(method("GET"))
        .and(path(LATEST))
        .respond_with(ResponseTemplate::new(404).set_body_string("Not Found"))
        .mount(&server)
        .await;

    let result = locator.latest_release().await;
    assert!(
        matches!(result, Err(UpdateError::Network(_))),
        "expected Network error, got: {result:?}"
    );
}

#[tokio::test]
async fn test_release_without_image_is_rejected() {
    let (server, locator) = setup().await;

    Mock::given(method("GET"))
        .and(path(LATEST))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "tag_name": "v1.4.0",
            "assets": [{ "name": "notes.md", "browser_download_url": "https://example.invalid/notes.md" }]
        })))
        .mount(&server)
        .await;

    assert!(matches!(locator.latest_release().await, Err(UpdateError::NoArtifact)));
}

#[tokio::test]
async fn test_download_streams_to_file_with_progress() {
    let (server, locator) = setup().await;
    let image = vec![0xA5u8; 4096];

    Mock::given(method("GET"))
        .and(path(LATEST))
        .respond_with(ResponseTemplate::new(200).set_body_json(release_body(&server, "v1.4.0", "")))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/dl/padawan-force.bin"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(image.clone()))
        .mount(&server)
        .await;

    let release = locator.latest_release().await.unwrap();
    let dir = tempfile::tempdir().unwrap();
    let target = dir.path().join("fw.bin");

    let last = std::sync::Mutex::new(None);
    let written = locator
        .download_artifact(&release, &target, |p| *last.lock().unwrap() = Some(p))
        .await
        .unwrap();

    assert_eq!(written, 4096);
    assert_eq!(std::fs::read(&target).unwrap(), image);
    let last = last.into_inner().unwrap().unwrap();
    assert_eq!(last.downloaded_bytes, 4096);
    assert!((last.percentage - 100.0).abs() < f64::EPSILON);
}

#[tokio::test]
async fn test_empty_download_fails() {
    let (server, locator) = setup().await;

    Mock::given(method("GET"))
        .and(path(LATEST))
        .respond_with(ResponseTemplate::new(200).set_body_json(release_body(&server, "v1.4.0", "")))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/dl/padawan-force.bin"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(Vec::<u8>::new()))
        .mount(&server)
        .await;

    let release = locator.latest_release().await.unwrap();
    let dir = tempfile::tempdir().unwrap();
    let result = locator.download_artifact(&release, &dir.path().join("fw.bin"), |_| {}).await;
    assert!(matches!(result, Err(UpdateError::DownloadFailed(_))));
}
