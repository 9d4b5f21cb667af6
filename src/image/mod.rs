//! Multi-source image enumeration over a loaded page.

pub mod discovery;

pub use discovery::{discover_and_deduplicate, discover_images, parse_srcset, DiscoveredImage, ImageDiscoveryResult};
