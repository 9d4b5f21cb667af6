//! Capture state machine: navigate → validate → behaviors → multi-format
//! emit. Per-format emit errors are logged and suppressed; the overall
//! capture succeeds as long as navigation and validation got through
//! without a block.
//!
//! Grounded on `original_source/services/capture/service.py`
//! (`CaptureService.capture`, output-path hashing, per-format capture
//! methods), adapted to drive a pooled `BrowserRuntime` instead of
//! Playwright and to route formats through idiomatic `Result` plumbing
//! instead of Python's blanket `except Exception: pass`.

pub mod warc;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::core::models::{BrowserConfig, CaptureResult};
use crate::core::xmp::{WebProvenance, XmpWriter};
use crate::services::browser::behaviors::{BehaviorOptions, PageBehaviors};
use crate::services::browser::pool::BrowserPool;
use crate::services::browser::runtime::{BrowserRuntime, ChromiumPage, PdfOptions};
use crate::services::browser::validator::ResponseValidator;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CaptureFormat {
    Screenshot,
    Pdf,
    Html,
    Warc,
}

impl CaptureFormat {
    pub fn all() -> Vec<CaptureFormat> {
        vec![CaptureFormat::Screenshot, CaptureFormat::Pdf, CaptureFormat::Html, CaptureFormat::Warc]
    }

    fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "screenshot" => Some(CaptureFormat::Screenshot),
            "pdf" => Some(CaptureFormat::Pdf),
            "html" => Some(CaptureFormat::Html),
            "warc" => Some(CaptureFormat::Warc),
            _ => None,
        }
    }

    pub fn parse_csv(csv: &str) -> Vec<CaptureFormat> {
        csv.split(',').filter_map(CaptureFormat::parse).collect()
    }
}

#[derive(Debug, Clone)]
pub struct CaptureOptions {
    pub formats: Vec<CaptureFormat>,
    pub run_behaviors: bool,
    pub behavior_options: BehaviorOptions,
    pub timeout_ms: u64,
    pub write_xmp_sidecar: bool,
}

impl Default for CaptureOptions {
    fn default() -> Self {
        Self {
            formats: CaptureFormat::all(),
            run_behaviors: true,
            behavior_options: BehaviorOptions::default(),
            timeout_ms: 30_000,
            write_xmp_sidecar: false,
        }
    }
}

pub struct CaptureService {
    pool: Arc<BrowserPool>,
    validator: ResponseValidator,
    output_dir: PathBuf,
    xmp_writer: XmpWriter,
}

impl CaptureService {
    pub fn new(pool: Arc<BrowserPool>, output_dir: PathBuf) -> Self {
        Self {
            pool,
            validator: ResponseValidator::new(),
            output_dir,
            xmp_writer: XmpWriter::new(),
        }
    }

    pub fn with_validator(mut self, validator: ResponseValidator) -> Self {
        self.validator = validator;
        self
    }

    /// Computes the lazily-created output directory for a capture:
    /// `output_dir/<host>/<timestamp>_<12-hex sha256 prefix>`.
    fn output_path(&self, url: &str) -> PathBuf {
        let host = url::Url::parse(url)
            .ok()
            .and_then(|u| u.host_str().map(|h| h.replace(':', "_")))
            .unwrap_or_else(|| "unknown_host".to_string());

        let hash = hex::encode(Sha256::digest(url.as_bytes()));
        let timestamp = Utc::now().format("%Y%m%d_%H%M%S");

        self.output_dir.join(host).join(format!("{timestamp}_{}", &hash[..12]))
    }

    pub async fn capture(&self, url: &str, config: &BrowserConfig, options: &CaptureOptions) -> CaptureResult {
        let start_time = Instant::now();
        let mut result = CaptureResult::new(url);

        match self.capture_inner(url, config, options, &mut result).await {
            Ok(()) => result.success = true,
            Err(e) => {
                warn!("capture failed for {url}: {e}");
                result.error = Some(e.to_string());
            }
        }

        result.duration_ms = start_time.elapsed().as_millis() as u64;
        result
    }

    async fn capture_inner(
        &self,
        url: &str,
        config: &BrowserConfig,
        options: &CaptureOptions,
        result: &mut CaptureResult,
    ) -> anyhow::Result<()> {
        let guard = self.pool.acquire_for(config.headless_mode).await?;
        let page = guard.browser().new_page("about:blank").await?;
        let runtime = ChromiumPage::new(page);

        let timeout = Duration::from_millis(options.timeout_ms);
        let response = match runtime.navigate(url, config.wait_strategy, timeout).await {
            Ok(response) => response,
            Err(e) => {
                result.validation = Some(self.validator.validate(None, ""));
                anyhow::bail!("navigation failed: {e}");
            }
        };

        let body = match runtime.content().await {
            Ok(body) => body,
            Err(e) => {
                let mut validation = self.validator.validate(Some(&response), "");
                validation.blocked = true;
                validation.reason = Some("content_error".to_string());
                result.validation = Some(validation);
                anyhow::bail!("failed to fetch page content: {e}");
            }
        };

        let validation = self.validator.validate(Some(&response), &body);
        let blocked = validation.blocked;
        let reason = validation.reason.clone();
        result.validation = Some(validation);

        if blocked {
            anyhow::bail!("Blocked: {}", reason.unwrap_or_else(|| "unknown".to_string()));
        }

        if options.run_behaviors {
            let behaviors = PageBehaviors::new(options.behavior_options.clone());
            let stats = behaviors.run_all(&runtime).await;
            debug!("behaviors for {url}: {stats:?}");
        }

        result.page_title = runtime.title().await.ok().filter(|t| !t.is_empty());
        result.page_description = self.meta_description(&runtime).await;

        let output_path = self.output_path(url);
        let html = runtime.content().await.unwrap_or(body);

        let mut provenance = WebProvenance::new(url, "browser_capture");
        provenance.page_url = Some(url.to_string());
        provenance.page_title = result.page_title.clone();
        provenance.user_agent = config.user_agent.clone();
        provenance.viewport_size = Some(format!("{}x{}", config.viewport_width, config.viewport_height));
        provenance.http_status = response.status;

        for format in &options.formats {
            let outcome = match format {
                CaptureFormat::Screenshot => self.capture_screenshot(&runtime, &output_path).await,
                CaptureFormat::Pdf => self.capture_pdf(&runtime, &output_path).await,
                CaptureFormat::Html => self.capture_html(&html, &output_path).await,
                CaptureFormat::Warc => self.capture_warc(url, &html, &output_path).await,
            };

            match outcome {
                Ok(path) => {
                    if options.write_xmp_sidecar {
                        let _ = self.xmp_writer.create_initial_sidecar(&path, &provenance, None, None).await;
                    }
                    self.assign_path(result, *format, path);
                }
                Err(e) => warn!("format {:?} failed for {url}: {e}", format),
            }
        }

        Ok(())
    }

    fn assign_path(&self, result: &mut CaptureResult, format: CaptureFormat, path: PathBuf) {
        let path = path.to_string_lossy().into_owned();
        match format {
            CaptureFormat::Screenshot => result.screenshot_path = Some(path),
            CaptureFormat::Pdf => result.pdf_path = Some(path),
            CaptureFormat::Html => result.html_path = Some(path),
            CaptureFormat::Warc => result.warc_path = Some(path),
        }
    }

    async fn meta_description(&self, runtime: &dyn BrowserRuntime) -> Option<String> {
        let js = r#"(() => {
            const meta = document.querySelector('meta[name="description"]');
            return meta ? meta.getAttribute('content') : null;
        })()"#;
        runtime.evaluate(js).await.ok().and_then(|v| v.as_str().map(String::from))
    }

    async fn capture_screenshot(&self, runtime: &dyn BrowserRuntime, output_path: &Path) -> anyhow::Result<PathBuf> {
        tokio::fs::create_dir_all(output_path).await?;
        let path = output_path.join("screenshot.png");
        let bytes = runtime.screenshot(true).await?;
        tokio::fs::write(&path, bytes).await?;
        Ok(path)
    }

    async fn capture_pdf(&self, runtime: &dyn BrowserRuntime, output_path: &Path) -> anyhow::Result<PathBuf> {
        tokio::fs::create_dir_all(output_path).await?;
        let path = output_path.join("page.pdf");
        let bytes = runtime.pdf(PdfOptions { print_background: true, landscape: false }).await?;
        tokio::fs::write(&path, bytes).await?;
        Ok(path)
    }

    async fn capture_html(&self, html: &str, output_path: &Path) -> anyhow::Result<PathBuf> {
        tokio::fs::create_dir_all(output_path).await?;
        let path = output_path.join("page.html");
        tokio::fs::write(&path, html).await?;
        Ok(path)
    }

    async fn capture_warc(&self, url: &str, html: &str, output_path: &Path) -> anyhow::Result<PathBuf> {
        tokio::fs::create_dir_all(output_path).await?;
        let result = warc::capture_warc_with_fallback(url, output_path, Some(html)).await;
        result.warc_path.ok_or_else(|| anyhow::anyhow!(result.error.unwrap_or_else(|| "warc capture failed".to_string())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_format_csv() {
        let formats = CaptureFormat::parse_csv("screenshot, pdf,html");
        assert_eq!(formats, vec![CaptureFormat::Screenshot, CaptureFormat::Pdf, CaptureFormat::Html]);
    }

    #[test]
    fn ignores_unknown_format_tokens() {
        let formats = CaptureFormat::parse_csv("screenshot,bogus,warc");
        assert_eq!(formats, vec![CaptureFormat::Screenshot, CaptureFormat::Warc]);
    }

    #[test]
    fn default_options_enable_all_formats() {
        let options = CaptureOptions::default();
        assert_eq!(options.formats.len(), 4);
        assert!(options.run_behaviors);
    }
}
