//! Everything needed to drive a real capture session: locating/downloading
//! a Chrome binary, managing profile directories, pooling warm browser
//! processes, the CDP-facing `BrowserRuntime` seam, post-navigation page
//! behaviors, and response validation.

pub mod behaviors;
pub mod pool;
pub mod profile;
pub mod runtime;
pub mod setup;
pub mod validator;

pub use behaviors::{BehaviorOptions, PageBehaviors};
pub use pool::{BrowserPool, BrowserPoolConfig, PooledBrowserGuard};
pub use profile::BrowserProfile;
pub use runtime::{BrowserRuntime, ChromiumPage, Cookie, NavigationResponse, PdfOptions, RuntimeError, RuntimeResult};
pub use setup::{launch_browser, DEFAULT_USER_AGENT};
pub use validator::{validate_response, ResponseValidator};
