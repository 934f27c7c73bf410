use std::path::Path;

use log::{debug, info, warn};
use reqwest::Client;
use serde_json::Value;
use tokio::fs::File;
use tokio::io::AsyncWriteExt;

use super::models::{DownloadProgress, FirmwareRelease, UpdateError, UpdateResult};

const USER_AGENT: &str = "PadAwan-Force-Updater";

/// Resolves the latest published firmware and downloads its image.
#[derive(Clone)]
pub struct ReleaseLocator {
    client: Client,
    api_base: String,
    repo_owner: String,
    repo_name: String,
}

impl ReleaseLocator {
    pub fn new(repo_owner: impl Into<String>, repo_name: impl Into<String>) -> Self {
        Self {
            client: Client::new(),
            api_base: "https://api.github.com".to_string(),
            repo_owner: repo_owner.into(),
            repo_name: repo_name.into(),
        }
    }

    /// Point at a different API host (GitHub Enterprise, tests).
    pub fn with_api_base(mut self, api_base: impl Into<String>) -> Self {
        self.api_base = api_base.into().trim_end_matches('/').to_string();
        self
    }

    /// Latest release metadata. Fails with `NoArtifact` if no `.bin` asset is attached.
    pub async fn latest_release(&self) -> UpdateResult<FirmwareRelease> {
        let url = format!(
            "{}/repos/{}/{}/releases/latest",
            self.api_base, self.repo_owner, self.repo_name
        );
        debug!("Fetching latest release from: {}", url);

        let response = self
            .client
            .get(&url)
            .header("Accept", "application/vnd.github+json")
            .header("User-Agent", USER_AGENT)
            .send()
            .await?
            .error_for_status()?;

        let release_data: Value = response.json().await?;
        let release = parse_release(&release_data)?;
        info!(
            "Latest release {} (firmware {}), asset {}",
            release.tag_version, release.firmware_version, release.asset_name
        );
        Ok(release)
    }

    /// Stream the release image to `output_path`, reporting progress per chunk.
    /// Returns the number of bytes written.
    pub async fn download_artifact<F>(
        &self,
        release: &FirmwareRelease,
        output_path: &Path,
        progress_callback: F,
    ) -> UpdateResult<u64>
    where
        F: Fn(DownloadProgress) + Send + Sync,
    {
        info!("Downloading firmware from: {}", release.download_url);

        let response = self
            .client
            .get(&release.download_url)
            .header("User-Agent", USER_AGENT)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| UpdateError::DownloadFailed(e.to_string()))?;

        let total_size = response.content_length().unwrap_or(release.size_bytes);
        let mut file = File::create(output_path).await?;
        let mut downloaded = 0u64;
        let mut stream = response.bytes_stream();
        let start_time = std::time::Instant::now();

        while let Some(chunk_result) = futures_util::StreamExt::next(&mut stream).await {
            let chunk = chunk_result.map_err(|e| UpdateError::DownloadFailed(e.to_string()))?;
            file.write_all(&chunk).await?;

            downloaded += chunk.len() as u64;
            let elapsed = start_time.elapsed().as_secs_f64();
            let speed_bps = if elapsed > 0.0 { (downloaded as f64 / elapsed) as u64 } else { 0 };

            progress_callback(DownloadProgress {
                downloaded_bytes: downloaded,
                total_bytes: total_size,
                percentage: if total_size > 0 {
                    (downloaded as f64 / total_size as f64 * 100.0).min(100.0)
                } else {
                    0.0
                },
                speed_bps,
            });
        }

        file.flush().await?;

        if downloaded == 0 {
            return Err(UpdateError::DownloadFailed("empty firmware image".to_string()));
        }
        if total_size > 0 && downloaded != total_size {
            warn!("Downloaded {} bytes, expected {}", downloaded, total_size);
        }

        info!("Firmware download completed: {} bytes", downloaded);
        Ok(downloaded)
    }
}

/// Parse GitHub release JSON into a [`FirmwareRelease`].
pub fn parse_release(data: &Value) -> UpdateResult<FirmwareRelease> {
    let tag_name = data["tag_name"]
        .as_str()
        .ok_or_else(|| UpdateError::InvalidRelease("missing tag_name".to_string()))?;
    let body = data["body"].as_str().unwrap_or("");

    let published_at = data["published_at"]
        .as_str()
        .and_then(|s| chrono::DateTime::parse_from_rfc3339(s).ok())
        .map(|d| d.with_timezone(&chrono::Utc));

    let asset = data["assets"]
        .as_array()
        .and_then(|assets| {
            assets.iter().find(|asset| {
                asset["name"]
                    .as_str()
                    .map(|n| n.to_ascii_lowercase().ends_with(".bin"))
                    .unwrap_or(false)
            })
        })
        .ok_or(UpdateError::NoArtifact)?;

    let download_url = asset["browser_download_url"]
        .as_str()
        .filter(|u| !u.is_empty())
        .ok_or(UpdateError::NoArtifact)?
        .to_string();

    Ok(FirmwareRelease {
        tag_version: tag_name.to_string(),
        firmware_version: extract_version(tag_name, body, "firmware").unwrap_or_else(|| tag_name.to_string()),
        software_version: extract_version(tag_name, body, "software"),
        download_url,
        asset_name: asset["name"].as_str().unwrap_or("firmware.bin").to_string(),
        size_bytes: asset["size"].as_u64().unwrap_or(0),
        published_at,
        changelog: body.to_string(),
    })
}

/// Version of one component (`firmware` or `software`) named by a release.
///
/// Tags like `firmware-v1.2.0` name a single component; a plain `v1.2.0` tag
/// covers both. Otherwise the notes are searched for `<kind>: v1.2.0`.
pub fn extract_version(tag: &str, body: &str, kind: &str) -> Option<String> {
    let tag_lower = tag.to_ascii_lowercase();
    let names_component = tag_lower.contains("firmware") || tag_lower.contains("software");

    if tag_lower.contains(kind) || !names_component {
        if let Some(v) = find_triplet(&tag_lower) {
            return Some(format!("v{}", v));
        }
    }

    let body_lower = body.to_ascii_lowercase();
    let mut search_from = 0;
    while let Some(pos) = body_lower[search_from..].find(kind) {
        let after = &body_lower[search_from + pos + kind.len()..];
        let rest = after.trim_start_matches(|c: char| c == ':' || c.is_whitespace());
        if rest.len() < after.len() {
            let rest = rest.strip_prefix('v').unwrap_or(rest);
            if let Some(v) = leading_triplet(rest) {
                return Some(format!("v{}", v));
            }
        }
        search_from += pos + kind.len();
    }

    None
}

/// First `N.N.N` anywhere in `s`.
fn find_triplet(s: &str) -> Option<String> {
    let bytes = s.as_bytes();
    (0..bytes.len())
        .filter(|&i| bytes[i].is_ascii_digit() && (i == 0 || !bytes[i - 1].is_ascii_digit()))
        .find_map(|i| leading_triplet(&s[i..]))
}

/// `N.N.N` at the very start of `s`.
fn leading_triplet(s: &str) -> Option<String> {
    let mut parts = Vec::with_capacity(3);
    let mut rest = s;
    for idx in 0..3 {
        let len = rest.chars().take_while(|c| c.is_ascii_digit()).count();
        if len == 0 {
            return None;
        }
        parts.push(&rest[..len]);
        rest = &rest[len..];
        if idx < 2 {
            rest = rest.strip_prefix('.')?;
        }
    }
    Some(parts.join("."))
}
