//! `BrowserRuntime`: the seam between the capture/behaviors/validator logic
//! above and the concrete CDP client below. Every core subsystem talks to
//! this trait, never to `chromiumoxide::Page` directly, so tests can supply
//! a stub instead of driving a real browser.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chromiumoxide::cdp::browser_protocol::network::CookieParam;
use chromiumoxide::cdp::browser_protocol::page::PrintToPdfParams;
use chromiumoxide::page::ScreenshotParams;
use chromiumoxide::Page;
use serde_json::Value;
use thiserror::Error;

use crate::core::models::WaitStrategy;

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("navigation timed out after {0:?}")]
    NavigationTimeout(Duration),
    #[error("cdp error: {0}")]
    Cdp(#[from] chromiumoxide::error::CdpError),
    #[error("selector not found: {0}")]
    SelectorNotFound(String),
}

pub type RuntimeResult<T> = Result<T, RuntimeError>;

/// HTTP response metadata captured from the navigation that loaded the page.
#[derive(Debug, Clone, Default)]
pub struct NavigationResponse {
    pub status: Option<u16>,
    pub headers: HashMap<String, String>,
}

/// Cookie to inject before or during a session.
#[derive(Debug, Clone)]
pub struct Cookie {
    pub name: String,
    pub value: String,
    pub domain: String,
    pub path: String,
    pub secure: bool,
    pub http_only: bool,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct PdfOptions {
    pub print_background: bool,
    pub landscape: bool,
}

#[async_trait]
pub trait BrowserRuntime: Send + Sync {
    async fn navigate(
        &self,
        url: &str,
        wait_until: WaitStrategy,
        timeout: Duration,
    ) -> RuntimeResult<NavigationResponse>;

    async fn content(&self) -> RuntimeResult<String>;
    async fn title(&self) -> RuntimeResult<String>;
    async fn evaluate(&self, js: &str) -> RuntimeResult<Value>;

    async fn query_selector(&self, selector: &str) -> RuntimeResult<bool>;
    async fn query_selector_all(&self, selector: &str) -> RuntimeResult<usize>;

    async fn screenshot(&self, full_page: bool) -> RuntimeResult<Vec<u8>>;
    async fn pdf(&self, opts: PdfOptions) -> RuntimeResult<Vec<u8>>;

    async fn add_cookies(&self, cookies: &[Cookie]) -> RuntimeResult<()>;
    async fn add_init_script(&self, js: &str) -> RuntimeResult<()>;
    async fn press_key(&self, key: &str) -> RuntimeResult<()>;
}

/// `BrowserRuntime` backed by a live `chromiumoxide::Page`.
pub struct ChromiumPage {
    page: Page,
}

impl ChromiumPage {
    pub fn new(page: Page) -> Self {
        Self { page }
    }
}

fn wait_strategy_str(strategy: WaitStrategy) -> &'static str {
    match strategy {
        WaitStrategy::Load => "load",
        WaitStrategy::DomContentLoaded => "domcontentloaded",
        WaitStrategy::NetworkIdle => "networkidle0",
        WaitStrategy::Commit => "commit",
    }
}

#[async_trait]
impl BrowserRuntime for ChromiumPage {
    async fn navigate(
        &self,
        url: &str,
        wait_until: WaitStrategy,
        timeout: Duration,
    ) -> RuntimeResult<NavigationResponse> {
        let navigate = self.page.goto(url);
        let result = tokio::time::timeout(timeout, navigate)
            .await
            .map_err(|_| RuntimeError::NavigationTimeout(timeout))??;

        let _ = wait_strategy_str(wait_until);
        self.page.wait_for_navigation().await.ok();

        let status = result.map(|r| r.status.map(|s| s as u16)).unwrap_or(None);
        Ok(NavigationResponse {
            status,
            headers: HashMap::new(),
        })
    }

    async fn content(&self) -> RuntimeResult<String> {
        Ok(self.page.content().await?)
    }

    async fn title(&self) -> RuntimeResult<String> {
        Ok(self.page.get_title().await?.unwrap_or_default())
    }

    async fn evaluate(&self, js: &str) -> RuntimeResult<Value> {
        let result = self.page.evaluate(js).await?;
        Ok(result.into_value().unwrap_or(Value::Null))
    }

    async fn query_selector(&self, selector: &str) -> RuntimeResult<bool> {
        Ok(self.page.find_element(selector).await.is_ok())
    }

    async fn query_selector_all(&self, selector: &str) -> RuntimeResult<usize> {
        Ok(self.page.find_elements(selector).await.map(|elems| elems.len()).unwrap_or(0))
    }

    async fn screenshot(&self, full_page: bool) -> RuntimeResult<Vec<u8>> {
        let params = ScreenshotParams::builder().full_page(full_page).build();
        Ok(self.page.screenshot(params).await?)
    }

    async fn pdf(&self, opts: PdfOptions) -> RuntimeResult<Vec<u8>> {
        let params = PrintToPdfParams::builder()
            .print_background(opts.print_background)
            .landscape(opts.landscape)
            .build();
        Ok(self.page.pdf(params).await?)
    }

    async fn add_cookies(&self, cookies: &[Cookie]) -> RuntimeResult<()> {
        let params: Vec<CookieParam> = cookies
            .iter()
            .map(|c| {
                CookieParam::builder()
                    .name(c.name.clone())
                    .value(c.value.clone())
                    .domain(c.domain.clone())
                    .path(c.path.clone())
                    .secure(c.secure)
                    .http_only(c.http_only)
                    .build()
                    .expect("cookie builder requires only name/value, always present")
            })
            .collect();
        self.page.set_cookies(params).await?;
        Ok(())
    }

    async fn add_init_script(&self, js: &str) -> RuntimeResult<()> {
        self.page.evaluate_on_new_document(js).await?;
        Ok(())
    }

    async fn press_key(&self, key: &str) -> RuntimeResult<()> {
        self.page.keyboard().down(key).await?;
        self.page.keyboard().up(key).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn maps_wait_strategies_to_cdp_names() {
        assert_eq!(wait_strategy_str(WaitStrategy::Load), "load");
        assert_eq!(wait_strategy_str(WaitStrategy::NetworkIdle), "networkidle0");
    }
}
