//! Page behaviors: dismiss overlays, scroll to load lazy content, expand
//! collapsed sections, click through tabs/carousels/comments, and drive
//! infinite scroll — in that fixed order, each behavior capped at
//! `max_behavior_time_ms` and the whole run capped at `max_total_time_ms`.
//!
//! Grounded on `services/browser/behaviors.py`'s `PageBehaviors.run_all`.
//! Rather than driving individual Playwright element handles, each step is
//! one `evaluate()` call whose JS performs the query/filter/click and
//! returns a count — the natural shape for a CDP-level `BrowserRuntime`.

use std::time::{Duration, Instant};

use tracing::debug;

use crate::core::models::BehaviorStats;
use crate::services::browser::runtime::BrowserRuntime;

#[derive(Debug, Clone)]
pub struct BehaviorOptions {
    pub max_total_time_ms: u64,
    pub max_behavior_time_ms: u64,
    pub action_delay_ms: u64,
    pub scroll_step_px: u32,
    pub max_scroll_attempts: u32,
    pub max_infinite_scroll_pages: u32,

    pub dismiss_overlays: bool,
    pub scroll_to_load: bool,
    pub expand_content: bool,
    pub click_tabs: bool,
    pub navigate_carousels: bool,
    pub expand_comments: bool,
    pub handle_infinite_scroll: bool,
}

impl Default for BehaviorOptions {
    fn default() -> Self {
        Self {
            max_total_time_ms: 120_000,
            max_behavior_time_ms: 30_000,
            action_delay_ms: 300,
            scroll_step_px: 500,
            max_scroll_attempts: 50,
            max_infinite_scroll_pages: 10,
            dismiss_overlays: true,
            scroll_to_load: true,
            expand_content: true,
            click_tabs: true,
            navigate_carousels: true,
            expand_comments: true,
            handle_infinite_scroll: true,
        }
    }
}

const OVERLAY_SELECTORS: &[&str] = &[
    "[class*='cookie'] button[class*='accept']",
    "[class*='cookie'] button[class*='agree']",
    "[class*='consent'] button[class*='accept']",
    "[id*='cookie'] button",
    ".cc-dismiss",
    "#onetrust-accept-btn-handler",
    ".cookie-banner button",
    "[class*='modal'] [class*='close']",
    "[class*='modal'] button[aria-label*='close']",
    "[class*='popup'] [class*='close']",
    ".modal-close",
    "button[class*='dismiss']",
    "[aria-label='Close']",
    "[aria-label='Dismiss']",
    "button.close",
];

const EXPAND_SELECTORS: &[&str] = &[
    "[class*='read-more']",
    "[class*='show-more']",
    "[class*='expand']",
    "[class*='see-more']",
    "button[class*='more']",
    "a[class*='more']",
    "[aria-expanded='false']",
];

const TAB_SELECTORS: &[&str] = &["[role='tab']", ".tab", "[class*='tab-']", ".nav-link", "[data-toggle='tab']"];

const CAROUSEL_SELECTORS: &[&str] = &[
    "[class*='carousel'] [class*='next']",
    "[class*='slider'] [class*='next']",
    "[class*='swiper'] [class*='next']",
    ".slick-next",
    "[aria-label*='next']",
];

const COMMENT_SELECTORS: &[&str] = &[
    "[class*='comment'] [class*='load-more']",
    "[class*='comment'] [class*='show-more']",
    "[class*='reply'] button",
    ".load-comments",
    "[class*='comments'] button",
];

/// `(selector) => count of elements clicked that were visible`, shared by
/// overlays/expand/tabs/comments.
fn click_visible_js(selectors: &[&str], delay_marker: &str) -> String {
    let list = selectors
        .iter()
        .map(|s| format!("\"{}\"", s.replace('"', "\\\"")))
        .collect::<Vec<_>>()
        .join(",");
    format!(
        r#"(() => {{
            const selectors = [{list}];
            let clicked = 0;
            for (const sel of selectors) {{
                let elements;
                try {{ elements = document.querySelectorAll(sel); }} catch (e) {{ continue; }}
                for (const el of elements) {{
                    const rect = el.getBoundingClientRect();
                    const visible = rect.width > 0 && rect.height > 0 &&
                        getComputedStyle(el).visibility !== 'hidden';
                    if (visible) {{
                        try {{ el.click(); clicked++; }} catch (e) {{ /* {delay_marker} */ }}
                    }}
                }}
            }}
            return clicked;
        }})()"#
    )
}

fn as_count(value: serde_json::Value) -> u32 {
    value.as_u64().unwrap_or(0) as u32
}

pub struct PageBehaviors {
    options: BehaviorOptions,
}

impl PageBehaviors {
    pub fn new(options: BehaviorOptions) -> Self {
        Self { options }
    }

    pub async fn run_all(&self, runtime: &dyn BrowserRuntime) -> BehaviorStats {
        let mut stats = BehaviorStats::default();
        let start = Instant::now();

        let steps: [(&str, bool); 7] = [
            ("overlays", self.options.dismiss_overlays),
            ("scroll", self.options.scroll_to_load),
            ("expand", self.options.expand_content),
            ("tabs", self.options.click_tabs),
            ("carousels", self.options.navigate_carousels),
            ("comments", self.options.expand_comments),
            ("infinite", self.options.handle_infinite_scroll),
        ];

        for (name, enabled) in steps {
            if !enabled {
                continue;
            }
            if start.elapsed().as_millis() as u64 >= self.options.max_total_time_ms {
                break;
            }

            let per_behavior_budget = Duration::from_millis(self.options.max_behavior_time_ms);
            let result = tokio::time::timeout(per_behavior_budget, self.run_one(name, runtime)).await;

            match result {
                Ok(Ok(count)) => self.apply_stat(&mut stats, name, count),
                Ok(Err(e)) => debug!("behavior {} failed: {}", name, e),
                Err(_) => debug!("behavior {} timed out", name),
            }
        }

        stats.duration_ms = start.elapsed().as_millis() as u64;
        stats
    }

    async fn run_one(
        &self,
        name: &str,
        runtime: &dyn BrowserRuntime,
    ) -> anyhow::Result<u32> {
        match name {
            "overlays" => self.dismiss_overlays(runtime).await,
            "scroll" => self.scroll_to_load_all(runtime).await,
            "expand" => self.expand_all_content(runtime).await,
            "tabs" => self.click_all_tabs(runtime).await,
            "carousels" => self.navigate_carousels(runtime).await,
            "comments" => self.expand_comments(runtime).await,
            "infinite" => self.handle_infinite_scroll(runtime).await,
            _ => Ok(0),
        }
    }

    fn apply_stat(&self, stats: &mut BehaviorStats, name: &str, count: u32) {
        match name {
            "overlays" => stats.overlays_dismissed = count,
            "scroll" => stats.scroll_depth = count,
            "expand" => stats.elements_expanded = count,
            "tabs" => stats.tabs_clicked = count,
            "carousels" => stats.carousel_slides = count,
            "comments" => stats.comments_loaded = count,
            "infinite" => stats.infinite_scroll_pages = count,
            _ => {}
        }
    }

    async fn dismiss_overlays(&self, runtime: &dyn BrowserRuntime) -> anyhow::Result<u32> {
        let js = click_visible_js(OVERLAY_SELECTORS, "overlay click failed");
        let dismissed = as_count(runtime.evaluate(&js).await?);

        let _ = runtime.press_key("Escape").await;

        let _ = runtime
            .evaluate(
                r#"(() => {
                    const overlays = document.querySelectorAll(
                        '[style*="position: fixed"], [style*="position: sticky"]'
                    );
                    overlays.forEach(el => {
                        if (el.offsetHeight > window.innerHeight * 0.5) el.remove();
                    });
                })()"#,
            )
            .await;

        Ok(dismissed)
    }

    async fn scroll_to_load_all(&self, runtime: &dyn BrowserRuntime) -> anyhow::Result<u32> {
        let mut scroll_depth = 0u32;
        let step = self.options.scroll_step_px;

        for _ in 0..self.options.max_scroll_attempts {
            let prev_height = runtime.evaluate("document.body.scrollHeight").await?.as_u64().unwrap_or(0);

            runtime.evaluate(&format!("window.scrollBy(0, {step})")).await?;
            scroll_depth += step;

            tokio::time::sleep(Duration::from_millis(self.options.action_delay_ms)).await;

            let current_height = runtime.evaluate("document.body.scrollHeight").await?.as_u64().unwrap_or(0);
            let scroll_position = runtime
                .evaluate("window.scrollY + window.innerHeight")
                .await?
                .as_u64()
                .unwrap_or(0);

            if scroll_position >= current_height && current_height == prev_height {
                break;
            }
        }

        runtime.evaluate("window.scrollTo(0, 0)").await?;
        Ok(scroll_depth)
    }

    async fn expand_all_content(&self, runtime: &dyn BrowserRuntime) -> anyhow::Result<u32> {
        let opened = runtime
            .evaluate(
                r#"(() => {
                    const details = document.querySelectorAll('details:not([open])');
                    let opened = 0;
                    details.forEach(d => { d.open = true; opened++; });
                    return opened;
                })()"#,
            )
            .await?;
        let mut expanded = as_count(opened);

        let js = click_visible_js(EXPAND_SELECTORS, "expand click failed");
        expanded += as_count(runtime.evaluate(&js).await?);

        Ok(expanded)
    }

    async fn click_all_tabs(&self, runtime: &dyn BrowserRuntime) -> anyhow::Result<u32> {
        let js = click_visible_js(TAB_SELECTORS, "tab click failed");
        Ok(as_count(runtime.evaluate(&js).await?))
    }

    async fn navigate_carousels(&self, runtime: &dyn BrowserRuntime) -> anyhow::Result<u32> {
        // Click each "next" control up to 5 times to cycle through slides.
        let list = CAROUSEL_SELECTORS
            .iter()
            .map(|s| format!("\"{}\"", s.replace('"', "\\\"")))
            .collect::<Vec<_>>()
            .join(",");
        let js = format!(
            r#"(() => {{
                const selectors = [{list}];
                let slides = 0;
                for (const sel of selectors) {{
                    let buttons;
                    try {{ buttons = document.querySelectorAll(sel); }} catch (e) {{ continue; }}
                    for (const button of buttons) {{
                        const rect = button.getBoundingClientRect();
                        if (rect.width === 0 || rect.height === 0) continue;
                        for (let i = 0; i < 5; i++) {{
                            try {{ button.click(); slides++; }} catch (e) {{ break; }}
                        }}
                    }}
                }}
                return slides;
            }})()"#
        );
        Ok(as_count(runtime.evaluate(&js).await?))
    }

    async fn expand_comments(&self, runtime: &dyn BrowserRuntime) -> anyhow::Result<u32> {
        let js = click_visible_js(COMMENT_SELECTORS, "comment click failed");
        Ok(as_count(runtime.evaluate(&js).await?))
    }

    async fn handle_infinite_scroll(&self, runtime: &dyn BrowserRuntime) -> anyhow::Result<u32> {
        let mut pages_loaded = 0u32;

        for _ in 0..self.options.max_infinite_scroll_pages {
            let prev_count = runtime
                .evaluate("document.body.querySelectorAll('*').length")
                .await?
                .as_u64()
                .unwrap_or(0);

            runtime.evaluate("window.scrollTo(0, document.body.scrollHeight)").await?;
            tokio::time::sleep(Duration::from_secs(1)).await;

            let new_count = runtime
                .evaluate("document.body.querySelectorAll('*').length")
                .await?
                .as_u64()
                .unwrap_or(0);

            if new_count > prev_count {
                pages_loaded += 1;
            } else {
                break;
            }
        }

        Ok(pages_loaded)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_options_enable_every_behavior() {
        let opts = BehaviorOptions::default();
        assert!(opts.dismiss_overlays);
        assert!(opts.handle_infinite_scroll);
        assert_eq!(opts.max_total_time_ms, 120_000);
    }

    #[test]
    fn click_visible_js_embeds_every_selector() {
        let js = click_visible_js(OVERLAY_SELECTORS, "marker");
        for selector in OVERLAY_SELECTORS {
            assert!(js.contains(selector), "missing selector {selector}");
        }
    }
}
