use std::cmp::Ordering;

use super::models::{FirmwareRelease, VersionCheckResult};

/// Numeric components of a dotted version.
///
/// A leading `v` is ignored and each component uses its leading digits, so
/// `v1.2.3-beta` reads as `[1, 2, 3]`. Returns `None` when the first component
/// has no digits (`"Unknown"`, empty strings).
pub fn parse_version(version: &str) -> Option<Vec<u64>> {
    let trimmed = version.trim();
    let trimmed = trimmed
        .strip_prefix('v')
        .or_else(|| trimmed.strip_prefix('V'))
        .unwrap_or(trimmed);

    let mut parts = Vec::new();
    for (idx, segment) in trimmed.split('.').enumerate() {
        let digits: String = segment.chars().take_while(|c| c.is_ascii_digit()).collect();
        match digits.parse::<u64>() {
            Ok(n) => parts.push(n),
            Err(_) if idx == 0 => return None,
            Err(_) => break,
        }
    }
    Some(parts)
}

/// Component-wise integer comparison, missing trailing components count as zero.
pub fn compare_versions(a: &[u64], b: &[u64]) -> Ordering {
    let len = a.len().max(b.len());
    for i in 0..len {
        let x = a.get(i).copied().unwrap_or(0);
        let y = b.get(i).copied().unwrap_or(0);
        match x.cmp(&y) {
            Ordering::Equal => continue,
            other => return other,
        }
    }
    Ordering::Equal
}

/// Decide update eligibility. An unreadable device version is always eligible.
pub fn check_update(current: Option<&str>, release: &FirmwareRelease) -> VersionCheckResult {
    let latest = release.firmware_version.clone();
    let current_parsed = current.and_then(parse_version);
    let latest_parsed = parse_version(&latest);

    let (update_available, reason) = match (current_parsed, latest_parsed) {
        (None, _) => (true, "Device version unknown".to_string()),
        (Some(_), None) => (false, format!("Latest version '{}' is not comparable", latest)),
        (Some(cur), Some(new)) => match compare_versions(&cur, &new) {
            Ordering::Less => (true, format!("{} is newer", latest)),
            Ordering::Equal => (false, "Already up to date".to_string()),
            Ordering::Greater => (false, "Device runs a newer version".to_string()),
        },
    };

    log::info!(
        "Version check - current: {}, latest: {}, update available: {}",
        current.unwrap_or("unknown"),
        latest,
        update_available
    );

    VersionCheckResult {
        current_version: current.map(str::to_string),
        latest_version: latest,
        update_available,
        reason,
        release_info: update_available.then(|| release.clone()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn release(version: &str) -> FirmwareRelease {
        FirmwareRelease {
            tag_version: version.to_string(),
            firmware_version: version.to_string(),
            software_version: None,
            download_url: "https://example.invalid/fw.bin".to_string(),
            asset_name: "fw.bin".to_string(),
            size_bytes: 0,
            published_at: None,
            changelog: String::new(),
        }
    }

    #[test]
    fn parses_loose_versions() {
        assert_eq!(parse_version("v1.2.3"), Some(vec![1, 2, 3]));
        assert_eq!(parse_version("1.10"), Some(vec![1, 10]));
        assert_eq!(parse_version("2.0.1-rc1"), Some(vec![2, 0, 1]));
        assert_eq!(parse_version("Unknown"), None);
        assert_eq!(parse_version(""), None);
    }

    #[test]
    fn missing_components_are_zero() {
        assert_eq!(compare_versions(&[1, 2], &[1, 2, 0]), Ordering::Equal);
        assert_eq!(compare_versions(&[1, 2], &[1, 2, 1]), Ordering::Less);
    }

    #[test]
    fn update_eligibility() {
        assert!(check_update(Some("1.2.3"), &release("1.2.4")).update_available);
        assert!(!check_update(Some("1.10.0"), &release("1.9.9")).update_available);
        assert!(!check_update(Some("v1.9.9"), &release("v1.9.9")).update_available);
        assert!(check_update(Some("Unknown"), &release("0.0.1")).update_available);
        assert!(check_update(None, &release("0.0.1")).update_available);
    }

    #[test]
    fn release_info_only_when_eligible() {
        assert!(check_update(Some("1.2.3"), &release("1.2.4")).release_info.is_some());
        assert!(check_update(Some("2.0"), &release("1.2.4")).release_info.is_none());
    }
}
