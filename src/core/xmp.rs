//! XMP sidecar writer: records capture provenance (source URL, browser
//! configuration, custody chain) alongside each captured artifact as a
//! `<artifact>.xmp` file, written via the system `exiftool` binary.
//!
//! This is supplemental to the core pipeline — capture succeeds whether or
//! not a sidecar gets written. `exiftool` is invoked the same way
//! [`crate::services::browser::setup`] shells out to the system Chrome: a
//! missing binary degrades to a logged warning, never a hard failure.

use std::path::{Path, PathBuf};

use chrono::Utc;
use thiserror::Error;
use tokio::process::Command;
use tracing::warn;

const NAMESPACE: &str = "nt";
const TOOL_NAME: &str = "national-treasure";
const TOOL_VERSION: &str = "0.1.0";
const SCHEMA_VERSION: u32 = 1;

#[derive(Debug, Error)]
pub enum XmpError {
    #[error("exiftool not found on PATH")]
    ExiftoolMissing,
    #[error("exiftool exited with status {0}")]
    ExiftoolFailed(std::process::ExitStatus),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Web capture provenance recorded for one artifact.
#[derive(Debug, Clone)]
pub struct WebProvenance {
    pub source_url: String,
    pub page_url: Option<String>,
    pub page_title: Option<String>,
    pub capture_method: String,
    pub browser_engine: String,
    pub user_agent: Option<String>,
    pub viewport_size: Option<String>,
    pub http_status: Option<u16>,
    pub was_blocked: bool,
    pub warc_file: Option<String>,
    pub warc_record_id: Option<String>,
}

impl WebProvenance {
    pub fn new(source_url: impl Into<String>, capture_method: impl Into<String>) -> Self {
        Self {
            source_url: source_url.into(),
            page_url: None,
            page_title: None,
            capture_method: capture_method.into(),
            browser_engine: "chromium".to_string(),
            user_agent: None,
            viewport_size: None,
            http_status: None,
            was_blocked: false,
            warc_file: None,
            warc_record_id: None,
        }
    }
}

fn generate_event_id() -> String {
    let ts = Utc::now().timestamp();
    let nonce: u32 = rand::random();
    format!("{ts}-{nonce:08x}")
}

fn hostname() -> String {
    hostname_impl().unwrap_or_else(|| "unknown".to_string())
}

#[cfg(unix)]
fn hostname_impl() -> Option<String> {
    std::process::Command::new("hostname")
        .output()
        .ok()
        .filter(|o| o.status.success())
        .map(|o| String::from_utf8_lossy(&o.stdout).trim().to_string())
        .filter(|s| !s.is_empty())
}

#[cfg(not(unix))]
fn hostname_impl() -> Option<String> {
    None
}

fn username() -> String {
    std::env::var("USER")
        .or_else(|_| std::env::var("USERNAME"))
        .unwrap_or_else(|_| "unknown".to_string())
}

fn escape_struct_value(value: &str) -> String {
    value.replace('{', "_").replace('}', "_").replace('=', "_").replace(',', "_")
}

fn build_custody_event(action: &str, outcome: &str, notes: Option<&str>) -> String {
    let mut event = format!(
        "{{EventID={},EventTimestamp={},EventAction={},EventOutcome={},EventTool={}/{},EventHost={},EventUser={}",
        generate_event_id(),
        Utc::now().to_rfc3339(),
        action,
        outcome,
        TOOL_NAME,
        TOOL_VERSION,
        hostname(),
        username(),
    );
    if let Some(notes) = notes {
        event.push_str(&format!(",EventNotes={}", escape_struct_value(notes)));
    }
    event.push('}');
    event
}

pub fn xmp_path(file_path: &Path) -> PathBuf {
    let mut os_string = file_path.as_os_str().to_owned();
    os_string.push(".xmp");
    PathBuf::from(os_string)
}

/// Writes XMP sidecars by shelling out to `exiftool`. One instance is shared
/// across a process; exiftool has no meaningful per-call state to hold.
pub struct XmpWriter;

impl XmpWriter {
    pub fn new() -> Self {
        Self
    }

    async fn run_exiftool(&self, args: &[String]) -> Result<(), XmpError> {
        let mut command = Command::new("exiftool");
        command.arg("-overwrite_original").args(args);

        let output = match command.output().await {
            Ok(output) => output,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                warn!("exiftool not found on PATH; skipping XMP sidecar write");
                return Err(XmpError::ExiftoolMissing);
            }
            Err(e) => return Err(e.into()),
        };

        if !output.status.success() {
            return Err(XmpError::ExiftoolFailed(output.status));
        }
        Ok(())
    }

    fn provenance_args(&self, provenance: &WebProvenance) -> Vec<String> {
        let mut args = vec![
            format!("-XMP-{NAMESPACE}:SchemaVersion={SCHEMA_VERSION}"),
            format!("-XMP-{NAMESPACE}:CapturedAt={}", Utc::now().to_rfc3339()),
            format!("-XMP-{NAMESPACE}:SourceURL={}", provenance.source_url),
            format!("-XMP-{NAMESPACE}:CaptureMethod={}", provenance.capture_method),
            format!("-XMP-{NAMESPACE}:BrowserEngine={}", provenance.browser_engine),
        ];

        if let Some(page_url) = &provenance.page_url {
            args.push(format!("-XMP-{NAMESPACE}:PageURL={page_url}"));
        }
        if let Some(title) = &provenance.page_title {
            args.push(format!("-XMP-{NAMESPACE}:PageTitle={}", title.replace('"', "'")));
        }
        if let Some(ua) = &provenance.user_agent {
            args.push(format!("-XMP-{NAMESPACE}:UserAgent={ua}"));
        }
        if let Some(viewport) = &provenance.viewport_size {
            args.push(format!("-XMP-{NAMESPACE}:ViewportSize={viewport}"));
        }
        if let Some(status) = provenance.http_status {
            args.push(format!("-XMP-{NAMESPACE}:HttpStatus={status}"));
        }
        if provenance.was_blocked {
            args.push(format!("-XMP-{NAMESPACE}:WasBlocked=true"));
        }
        if let Some(warc_file) = &provenance.warc_file {
            args.push(format!("-XMP-{NAMESPACE}:WarcFile={warc_file}"));
        }
        if let Some(record_id) = &provenance.warc_record_id {
            args.push(format!("-XMP-{NAMESPACE}:WarcRecordID={record_id}"));
        }

        args
    }

    /// Writes (or overwrites) capture metadata and appends one custody event.
    pub async fn write_capture_metadata(
        &self,
        file_path: &Path,
        provenance: &WebProvenance,
    ) -> Result<(), XmpError> {
        let mut args = self.provenance_args(provenance);

        let notes = format!(
            "Captured {} from {}",
            provenance.capture_method,
            &provenance.source_url[..provenance.source_url.len().min(50)]
        );
        args.push("-XMP-wnb:EventCount+=1".to_string());
        args.push(format!("-XMP-wnb:SidecarUpdated={}", Utc::now().to_rfc3339()));
        args.push(format!(
            "-XMP-wnb:CustodyChain+={}",
            build_custody_event("web_capture", "success", Some(&notes))
        ));
        args.push(xmp_path(file_path).to_string_lossy().into_owned());

        self.run_exiftool(&args).await
    }

    /// Creates a fresh sidecar for a newly captured file, establishing the
    /// custody chain's first event.
    pub async fn create_initial_sidecar(
        &self,
        file_path: &Path,
        provenance: &WebProvenance,
        content_hash: Option<&str>,
        file_size: Option<u64>,
    ) -> Result<(), XmpError> {
        let now = Utc::now().to_rfc3339();
        let notes = format!(
            "Initial capture from {}",
            &provenance.source_url[..provenance.source_url.len().min(50)]
        );

        let mut args = vec![
            format!("-XMP-wnb:FirstSeen={now}"),
            "-XMP-wnb:EventCount=1".to_string(),
            format!("-XMP-wnb:SidecarCreated={now}"),
            format!("-XMP-wnb:SidecarUpdated={now}"),
            format!(
                "-XMP-wnb:CustodyChain+={}",
                build_custody_event("web_capture", "success", Some(&notes))
            ),
        ];
        args.extend(self.provenance_args(provenance));

        if let Some(hash) = content_hash {
            args.push(format!("-XMP-wnb:ContentHash={}", &hash[..hash.len().min(16)]));
            args.push(format!("-XMP-wnb:ContentHashFull={hash}"));
            args.push("-XMP-wnb:HashAlgorithm=sha256".to_string());
        }
        if let Some(size) = file_size {
            args.push(format!("-XMP-wnb:FileSize={size}"));
        }

        args.push(xmp_path(file_path).to_string_lossy().into_owned());
        self.run_exiftool(&args).await
    }

    /// Appends one custody-chain event without touching the nt: namespace fields.
    pub async fn append_custody_event(
        &self,
        file_path: &Path,
        action: &str,
        outcome: &str,
        notes: Option<&str>,
    ) -> Result<(), XmpError> {
        let args = vec![
            "-XMP-wnb:EventCount+=1".to_string(),
            format!("-XMP-wnb:SidecarUpdated={}", Utc::now().to_rfc3339()),
            format!("-XMP-wnb:CustodyChain+={}", build_custody_event(action, outcome, notes)),
            xmp_path(file_path).to_string_lossy().into_owned(),
        ];
        self.run_exiftool(&args).await
    }
}

impl Default for XmpWriter {
    fn default() -> Self {
        Self::new()
    }
}

pub fn xmp_exists(file_path: &Path) -> bool {
    xmp_path(file_path).exists()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn xmp_path_appends_suffix() {
        let path = Path::new("/tmp/capture.png");
        assert_eq!(xmp_path(path), PathBuf::from("/tmp/capture.png.xmp"));
    }

    #[test]
    fn custody_event_escapes_special_chars() {
        let event = build_custody_event("web_capture", "success", Some("a={b},c"));
        assert!(event.contains("EventNotes=a=_b__c"));
    }

    #[test]
    fn provenance_args_include_required_fields() {
        let writer = XmpWriter::new();
        let provenance = WebProvenance::new("https://example.com", "screenshot");
        let args = writer.provenance_args(&provenance);
        assert!(args.iter().any(|a| a.starts_with("-XMP-nt:SourceURL=https://example.com")));
        assert!(args.iter().any(|a| a.starts_with("-XMP-nt:CaptureMethod=screenshot")));
    }
}
