//! Pre-warmed Chrome browser pool with dynamic scaling.
//!
//! Grounded directly on the reference crate's `browser_pool` module: pool
//! size target is `max(in_use + 2, min_pool_size)`, a background scaler
//! rebalances every 5s and evicts browsers idle past `idle_timeout`, and a
//! keepalive task CDP-pings every pooled browser on `keepalive_interval`.
//!
//! Unlike the reference pool, every pre-warmed browser shares one fixed
//! `default_headless_mode` (headless mode is a process launch flag and can't
//! vary per page). The learner's `user_agent`/`wait_strategy` arms are
//! applied per-page via CDP after acquiring. When a domain's learned arm
//! picks a *different* headless mode than the pool's default, `acquire_for`
//! launches a dedicated one-off browser instead of drawing from the pool —
//! mirroring the source system, which always launches one browser per
//! capture job rather than sharing a warm pool.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use chromiumoxide::browser::Browser;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::core::models::HeadlessMode;
use crate::services::browser::profile;
use crate::services::browser::setup;

#[derive(Debug, Clone)]
pub struct BrowserPoolConfig {
    pub min_pool_size: usize,
    pub max_pool_size: usize,
    pub keepalive_interval: Duration,
    pub idle_timeout: Duration,
    pub default_headless_mode: HeadlessMode,
    pub default_viewport: (u32, u32),
}

impl Default for BrowserPoolConfig {
    fn default() -> Self {
        Self {
            min_pool_size: 2,
            max_pool_size: 10,
            keepalive_interval: Duration::from_secs(30),
            idle_timeout: Duration::from_secs(300),
            default_headless_mode: HeadlessMode::Shell,
            default_viewport: (1920, 1080),
        }
    }
}

#[derive(Debug)]
pub struct PooledBrowserWrapper {
    browser: Arc<Browser>,
    handler: JoinHandle<()>,
    user_data_dir: Option<PathBuf>,
}

impl PooledBrowserWrapper {
    fn new(browser: Browser, handler: JoinHandle<()>, user_data_dir: PathBuf) -> Self {
        Self {
            browser: Arc::new(browser),
            handler,
            user_data_dir: Some(user_data_dir),
        }
    }

    pub fn browser(&self) -> &Browser {
        &self.browser
    }

    pub fn browser_arc(&self) -> Arc<Browser> {
        Arc::clone(&self.browser)
    }

    pub fn browser_mut(&mut self) -> Option<&mut Browser> {
        Arc::get_mut(&mut self.browser)
    }

    pub fn cleanup_temp_dir(&mut self) {
        if let Some(path) = self.user_data_dir.take() {
            info!("Cleaning up pool browser temp directory: {}", path.display());
            if let Err(e) = std::fs::remove_dir_all(&path) {
                warn!("Failed to clean up temp directory {}: {}", path.display(), e);
            }
        }
    }
}

impl Drop for PooledBrowserWrapper {
    fn drop(&mut self) {
        self.handler.abort();
        if self.user_data_dir.is_some() {
            self.cleanup_temp_dir();
        }
    }
}

#[derive(Debug)]
pub struct PooledBrowser {
    pub id: u64,
    pub wrapper: PooledBrowserWrapper,
    pub created_at: Instant,
    pub last_used: Instant,
    pub last_health_check: Instant,
}

impl PooledBrowser {
    fn new(id: u64, wrapper: PooledBrowserWrapper) -> Self {
        let now = Instant::now();
        Self {
            id,
            wrapper,
            created_at: now,
            last_used: now,
            last_health_check: now,
        }
    }
}

#[derive(Debug)]
pub struct BrowserPool {
    config: BrowserPoolConfig,
    available: Arc<Mutex<VecDeque<PooledBrowser>>>,
    in_use_count: AtomicUsize,
    next_id: AtomicU64,
    scaler_handle: Mutex<Option<JoinHandle<()>>>,
    keepalive_handle: Mutex<Option<JoinHandle<()>>>,
    shutdown: AtomicBool,
}

impl BrowserPool {
    pub fn new(config: BrowserPoolConfig) -> Arc<Self> {
        Arc::new(Self {
            config,
            available: Arc::new(Mutex::new(VecDeque::new())),
            in_use_count: AtomicUsize::new(0),
            next_id: AtomicU64::new(0),
            scaler_handle: Mutex::new(None),
            keepalive_handle: Mutex::new(None),
            shutdown: AtomicBool::new(false),
        })
    }

    pub async fn start(self: &Arc<Self>) -> Result<()> {
        info!("Starting browser pool with config: {:?}", self.config);

        self.scale_to_target().await?;

        let pool_clone = Arc::clone(self);
        let scaler = tokio::spawn(async move {
            scaler_loop(pool_clone).await;
        });
        *self.scaler_handle.lock().await = Some(scaler);

        let pool_clone = Arc::clone(self);
        let keepalive = tokio::spawn(async move {
            keepalive_loop(pool_clone).await;
        });
        *self.keepalive_handle.lock().await = Some(keepalive);

        info!(
            "Browser pool started with {} pre-warmed browsers",
            self.available.lock().await.len()
        );
        Ok(())
    }

    /// Acquire a browser matching the pool's default headless mode.
    pub async fn acquire(self: &Arc<Self>) -> Result<PooledBrowserGuard> {
        loop {
            let mut available = self.available.lock().await;

            if let Some(mut browser) = available.pop_front() {
                match browser.wrapper.browser().version().await {
                    Ok(_) => {
                        browser.last_used = Instant::now();
                        browser.last_health_check = Instant::now();
                        self.in_use_count.fetch_add(1, Ordering::Relaxed);
                        debug!("Acquired browser {} from pool", browser.id);

                        return Ok(PooledBrowserGuard {
                            browser: Some(browser),
                            pool: Arc::clone(self),
                            pooled: true,
                        });
                    }
                    Err(e) => {
                        warn!("Browser {} failed health check during acquire: {}", browser.id, e);
                        continue;
                    }
                }
            }

            drop(available);

            let total = self.in_use_count.load(Ordering::Relaxed) + self.available.lock().await.len();

            if total < self.config.max_pool_size {
                let browser = self.launch_browser_internal(self.config.default_headless_mode, None).await?;
                self.in_use_count.fetch_add(1, Ordering::Relaxed);
                debug!("Launched new browser {} for acquire (pool was empty)", browser.id);

                return Ok(PooledBrowserGuard {
                    browser: Some(browser),
                    pool: Arc::clone(self),
                    pooled: true,
                });
            }

            warn!("Browser pool at max capacity ({}), waiting...", self.config.max_pool_size);
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }

    /// Acquire a browser for `headless_mode`. If it matches the pool's
    /// default, draws from the shared pool; otherwise launches and returns a
    /// dedicated one-off browser that is closed (not recycled) on release.
    pub async fn acquire_for(self: &Arc<Self>, headless_mode: HeadlessMode) -> Result<PooledBrowserGuard> {
        if headless_mode == self.config.default_headless_mode {
            return self.acquire().await;
        }

        let browser = self.launch_browser_internal(headless_mode, None).await?;
        debug!("Launched dedicated browser {} for non-default headless mode {:?}", browser.id, headless_mode);
        Ok(PooledBrowserGuard {
            browser: Some(browser),
            pool: Arc::clone(self),
            pooled: false,
        })
    }

    fn release(&self, mut browser: PooledBrowser) {
        self.in_use_count.fetch_sub(1, Ordering::Relaxed);
        browser.last_used = Instant::now();

        let available = Arc::clone(&self.available);
        let id = browser.id;

        tokio::spawn(async move {
            available.lock().await.push_back(browser);
            debug!("Released browser {} back to pool", id);
        });
    }

    fn close_dedicated(&self, mut browser: PooledBrowser) {
        tokio::spawn(async move {
            if let Some(b) = browser.wrapper.browser_mut() {
                if let Err(e) = b.close().await {
                    warn!("Failed to close dedicated browser {}: {}", browser.id, e);
                }
                let _ = b.wait().await;
            }
            browser.wrapper.cleanup_temp_dir();
        });
    }

    pub async fn shutdown(&self) -> Result<()> {
        info!("Shutting down browser pool");
        self.shutdown.store(true, Ordering::Relaxed);

        if let Some(handle) = self.scaler_handle.lock().await.take() {
            handle.abort();
        }
        if let Some(handle) = self.keepalive_handle.lock().await.take() {
            handle.abort();
        }

        let mut available = self.available.lock().await;
        while let Some(mut browser) = available.pop_front() {
            if let Some(b) = browser.wrapper.browser_mut() {
                if let Err(e) = b.close().await {
                    warn!("Failed to close browser {}: {}", browser.id, e);
                }
                let _ = b.wait().await;
            } else {
                warn!("Browser {} has outstanding references, skipping graceful close", browser.id);
            }
            browser.wrapper.cleanup_temp_dir();
        }

        info!("Browser pool shutdown complete");
        Ok(())
    }

    fn target_pool_size(&self) -> usize {
        let in_use = self.in_use_count.load(Ordering::Relaxed);
        (in_use + 2).max(self.config.min_pool_size).min(self.config.max_pool_size)
    }

    async fn scale_to_target(&self) -> Result<()> {
        let target = self.target_pool_size();
        let current = self.available.lock().await.len();

        if current >= target {
            return Ok(());
        }

        let to_launch = target - current;
        debug!("Scaling pool: launching {} browsers (current={}, target={})", to_launch, current, target);

        let default_mode = self.config.default_headless_mode;
        let futs: Vec<_> = (0..to_launch)
            .map(|_| self.launch_browser_internal(default_mode, None))
            .collect();

        let results = futures::future::join_all(futs).await;

        let mut available = self.available.lock().await;
        for result in results {
            match result {
                Ok(browser) => available.push_back(browser),
                Err(e) => warn!("Failed to launch browser for pool: {}", e),
            }
        }

        Ok(())
    }

    async fn launch_browser_internal(
        &self,
        headless_mode: HeadlessMode,
        user_agent: Option<&str>,
    ) -> Result<PooledBrowser> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);

        let profile = profile::create_unique_profile_with_prefix("national_treasure_chrome_pool")
            .context("Failed to create unique pool browser profile")?;
        let user_data_dir = profile.into_path();

        let (browser, handler, _returned_dir) = setup::launch_browser(
            headless_mode,
            user_agent,
            self.config.default_viewport,
            Some(user_data_dir.clone()),
        )
        .await
        .context("Failed to launch browser for pool")?;

        let wrapper = PooledBrowserWrapper::new(browser, handler, user_data_dir);
        Ok(PooledBrowser::new(id, wrapper))
    }
}

pub struct PooledBrowserGuard {
    browser: Option<PooledBrowser>,
    pool: Arc<BrowserPool>,
    pooled: bool,
}

impl PooledBrowserGuard {
    pub fn browser(&self) -> &Browser {
        self.browser.as_ref().expect("browser should be present").wrapper.browser()
    }

    pub fn browser_arc(&self) -> Arc<Browser> {
        self.browser.as_ref().expect("browser should be present").wrapper.browser_arc()
    }

    pub fn id(&self) -> u64 {
        self.browser.as_ref().expect("browser should be present").id
    }
}

impl Drop for PooledBrowserGuard {
    fn drop(&mut self) {
        if let Some(browser) = self.browser.take() {
            if self.pooled {
                self.pool.release(browser);
            } else {
                self.pool.close_dedicated(browser);
            }
        }
    }
}

async fn scaler_loop(pool: Arc<BrowserPool>) {
    let mut interval = tokio::time::interval(Duration::from_secs(5));

    while !pool.shutdown.load(Ordering::Relaxed) {
        interval.tick().await;

        if let Err(e) = pool.scale_to_target().await {
            warn!("Pool scaler error: {}", e);
        }

        let mut available = pool.available.lock().await;
        let now = Instant::now();
        let min_size = pool.config.min_pool_size;

        while available.len() > min_size {
            if let Some(browser) = available.front() {
                if now.duration_since(browser.last_used) > pool.config.idle_timeout {
                    if let Some(removed) = available.pop_front() {
                        debug!("Removing idle browser {} (idle {:?})", removed.id, now.duration_since(removed.last_used));
                    }
                } else {
                    break;
                }
            } else {
                break;
            }
        }
    }

    debug!("Scaler loop exiting");
}

async fn keepalive_loop(pool: Arc<BrowserPool>) {
    let mut interval = tokio::time::interval(pool.config.keepalive_interval);

    while !pool.shutdown.load(Ordering::Relaxed) {
        interval.tick().await;

        let mut available = pool.available.lock().await;
        let mut healthy = VecDeque::new();

        while let Some(mut browser) = available.pop_front() {
            match browser.wrapper.browser().version().await {
                Ok(version) => {
                    browser.last_health_check = Instant::now();
                    healthy.push_back(browser);
                    debug!("Browser health check OK: {}", version.product);
                }
                Err(e) => {
                    warn!("Browser {} failed keepalive health check: {}", browser.id, e);
                }
            }
        }

        *available = healthy;
        debug!("Keepalive complete: {} healthy browsers in pool", available.len());
    }

    debug!("Keepalive loop exiting");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn target_pool_size_respects_bounds() {
        let config = BrowserPoolConfig {
            min_pool_size: 2,
            max_pool_size: 5,
            ..Default::default()
        };
        let pool = BrowserPool::new(config);
        assert_eq!(pool.target_pool_size(), 2);
        pool.in_use_count.store(10, Ordering::Relaxed);
        assert_eq!(pool.target_pool_size(), 5);
    }
}
