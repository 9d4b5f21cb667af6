//! WARC archive generation.
//!
//! Preferred path: shell out to `wget --warc-file` for a real, spec-compliant
//! archive. If `wget` is missing, times out, or fails, synthesize a minimal
//! two-record WARC (warcinfo + response) from already-captured HTML; if even
//! that can't be written, fall back to saving the raw HTML alongside.
//!
//! Grounded on `original_source/services/capture/warc.py` (`capture_warc`,
//! `capture_warc_with_fallback`) and `service.py`'s `_create_warc_record`.

use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::Utc;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::process::Command;
use tracing::warn;

const TOOL_NAME: &str = "national-treasure";
const TOOL_VERSION: &str = "0.1.0";

#[derive(Debug, Error)]
pub enum WarcError {
    #[error("wget not available on PATH")]
    WgetMissing,
    #[error("wget timed out after {0:?}")]
    Timeout(Duration),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone)]
pub struct WarcResult {
    pub success: bool,
    pub warc_path: Option<PathBuf>,
    pub cdx_path: Option<PathBuf>,
    pub error: Option<String>,
}

impl WarcResult {
    fn failure(error: impl Into<String>) -> Self {
        Self {
            success: false,
            warc_path: None,
            cdx_path: None,
            error: Some(error.into()),
        }
    }
}

fn wget_available() -> bool {
    which_wget().is_some()
}

fn which_wget() -> Option<PathBuf> {
    std::env::var_os("PATH").and_then(|paths| {
        std::env::split_paths(&paths)
            .map(|dir| dir.join("wget"))
            .find(|candidate| candidate.is_file())
    })
}

fn generate_warc_basename(url: &str) -> String {
    let hash = hex::encode(Sha256::digest(url.as_bytes()));
    let timestamp = Utc::now().format("%Y%m%d%H%M%S");
    format!("capture-{timestamp}-{}", &hash[..12])
}

/// Invokes `wget --warc-file` with page-requisites, producing a real WARC
/// plus a CDX index. Returns a non-success `WarcResult` (not an error) on
/// any failure — callers fall back rather than abort the whole capture.
pub async fn capture_warc(url: &str, output_dir: &Path, timeout: Duration, include_requisites: bool) -> WarcResult {
    if !wget_available() {
        return WarcResult::failure("wget not available. Install wget to enable full-fidelity WARC capture.");
    }

    if let Err(e) = tokio::fs::create_dir_all(output_dir).await {
        return WarcResult::failure(format!("failed to create output dir: {e}"));
    }

    let basename = generate_warc_basename(url);
    let warc_path = output_dir.join(format!("{basename}.warc.gz"));
    let files_dir = output_dir.join("files");

    let mut cmd = Command::new("wget");
    cmd.arg("--warc-file")
        .arg(output_dir.join(&basename))
        .arg("--warc-cdx")
        .arg("--no-check-certificate")
        .arg("--timeout")
        .arg("30")
        .arg("--tries")
        .arg("2")
        .arg("--waitretry")
        .arg("3")
        .arg("-q")
        .arg("-P")
        .arg(&files_dir);

    if include_requisites {
        cmd.arg("--page-requisites").arg("--span-hosts").arg("--convert-links");
    }
    cmd.arg(url);

    let spawn_result = cmd.output();
    let output = match tokio::time::timeout(timeout, spawn_result).await {
        Ok(Ok(output)) => output,
        Ok(Err(e)) => return WarcResult::failure(format!("failed to run wget: {e}")),
        Err(_) => return WarcResult::failure(format!("WARC capture timed out after {timeout:?}")),
    };

    if !warc_path.exists() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        let truncated: String = stderr.chars().take(200).collect();
        return WarcResult::failure(format!("WARC file not created. stderr: {truncated}"));
    }

    let cdx_path = output_dir.join(format!("{basename}.cdx"));
    WarcResult {
        success: true,
        warc_path: Some(warc_path),
        cdx_path: if cdx_path.exists() { Some(cdx_path) } else { None },
        error: None,
    }
}

fn warc_record(record_type: &str, record_id: &str, timestamp: &str, target_uri: &str, content: &[u8], content_type: &str) -> Vec<u8> {
    let headers = format!(
        "WARC/1.1\r\n\
         WARC-Type: {record_type}\r\n\
         WARC-Record-ID: <{record_id}>\r\n\
         WARC-Date: {timestamp}\r\n\
         WARC-Target-URI: {target_uri}\r\n\
         Content-Type: {content_type}\r\n\
         Content-Length: {}\r\n\r\n",
        content.len()
    );

    let mut record = headers.into_bytes();
    record.extend_from_slice(content);
    record.extend_from_slice(b"\r\n\r\n");
    record
}

/// Synthesizes a minimal two-record WARC (warcinfo + response) from already
/// fetched HTML, gzip-compressed. Used when `wget` is unavailable or fails.
pub async fn write_minimal_warc(url: &str, html: &str, output_path: &Path) -> Result<(), WarcError> {
    use std::io::Write;

    let timestamp = Utc::now().format("%Y-%m-%dT%H:%M:%SZ").to_string();
    let url_hash = hex::encode(Sha256::digest(url.as_bytes()));
    let response_hash = hex::encode(Sha256::digest(format!("{url}response").as_bytes()));

    let warcinfo_id = format!("urn:uuid:{}", &url_hash[..36.min(url_hash.len())]);
    let response_id = format!("urn:uuid:{}", &response_hash[..36.min(response_hash.len())]);

    let warcinfo_body = format!("software: {TOOL_NAME}/{TOOL_VERSION}\r\nformat: WARC/1.1\r\n");
    let warcinfo = warc_record("warcinfo", &warcinfo_id, &timestamp, url, warcinfo_body.as_bytes(), "application/warc-fields");
    let response = warc_record("response", &response_id, &timestamp, url, html.as_bytes(), "text/html");

    if let Some(parent) = output_path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }

    let bytes = output_path.to_path_buf();
    let payload = [warcinfo, response].concat();
    tokio::task::spawn_blocking(move || -> std::io::Result<()> {
        let file = std::fs::File::create(&bytes)?;
        let mut encoder = flate2::write::GzEncoder::new(file, flate2::Compression::default());
        encoder.write_all(&payload)?;
        encoder.finish()?;
        Ok(())
    })
    .await
    .map_err(|e| std::io::Error::other(e.to_string()))??;

    Ok(())
}

/// Tries `wget` first; on any failure, synthesizes a minimal WARC from
/// `html_content` if provided, else writes the raw HTML as a last resort.
/// Never returns an error — a failed archive is reported in the result, not
/// propagated, matching the original's "fallback path never raises".
pub async fn capture_warc_with_fallback(url: &str, output_dir: &Path, html_content: Option<&str>) -> WarcResult {
    let result = capture_warc(url, output_dir, Duration::from_secs(120), true).await;
    if result.success {
        return result;
    }

    let Some(html) = html_content else {
        return result;
    };

    let basename = generate_warc_basename(url);
    let warc_path = output_dir.join(format!("{basename}.warc.gz"));

    match write_minimal_warc(url, html, &warc_path).await {
        Ok(()) => WarcResult {
            success: true,
            warc_path: Some(warc_path),
            cdx_path: None,
            error: result.error.map(|e| format!("Fallback: synthesized minimal WARC ({e})")),
        },
        Err(e) => {
            warn!("minimal WARC synthesis failed, falling back to raw HTML: {e}");
            let html_path = output_dir.join(format!("{basename}.html"));
            match tokio::fs::write(&html_path, html).await {
                Ok(()) => WarcResult {
                    success: true,
                    warc_path: Some(html_path),
                    cdx_path: None,
                    error: Some(format!("Fallback: saved HTML only ({e})")),
                },
                Err(write_err) => WarcResult::failure(format!("{e}; html fallback also failed: {write_err}")),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generate_warc_basename_is_stable_for_same_url_minute() {
        let a = generate_warc_basename("https://example.com/page");
        let b = generate_warc_basename("https://example.com/page");
        assert_eq!(&a[..20], &b[..20], "hash portion should match for the same URL");
    }

    #[test]
    fn warc_record_has_crlf_header_block() {
        let record = warc_record("response", "abc", "2026-01-01T00:00:00Z", "https://x", b"hello", "text/html");
        let text = String::from_utf8_lossy(&record);
        assert!(text.starts_with("WARC/1.1\r\n"));
        assert!(text.contains("Content-Length: 5\r\n"));
        assert!(text.ends_with("hello\r\n\r\n"));
    }

    #[tokio::test]
    async fn write_minimal_warc_produces_gzip_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("archive.warc.gz");
        write_minimal_warc("https://example.com", "<html>hi</html>", &path).await.unwrap();
        assert!(path.exists());
        assert!(std::fs::metadata(&path).unwrap().len() > 0);
    }
}
