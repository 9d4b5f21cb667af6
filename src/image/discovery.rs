//! Discovers images on a loaded page from six sources (`<img>`, srcset,
//! OpenGraph/Twitter meta, Schema.org JSON-LD, `<picture>`, CSS
//! `background-image`) and deduplicates by normalized URL.
//!
//! Grounded on `original_source/services/image/discovery.py`.

use std::collections::HashMap;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use url::Url;

use crate::services::browser::{BrowserRuntime, RuntimeResult};

static SRCSET_SPLIT: Lazy<Regex> = Lazy::new(|| Regex::new(r",\s*(?=\S+\s+\d)").unwrap());
static SRCSET_ENTRY: Lazy<Regex> = Lazy::new(|| Regex::new(r"^(\S+)\s*(.*)$").unwrap());
static BG_IMAGE: Lazy<Regex> = Lazy::new(|| Regex::new(r#"background-image:\s*url\(['"]?([^'"\)]+)['"]?\)"#).unwrap());

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiscoveredImage {
    pub url: String,
    pub source: String,
    pub alt: Option<String>,
    pub title: Option<String>,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub srcset_descriptor: Option<String>,
    pub priority: i32,
}

impl DiscoveredImage {
    fn new(url: String, source: &str, priority: i32) -> Self {
        Self { url, source: source.to_string(), alt: None, title: None, width: None, height: None, srcset_descriptor: None, priority }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ImageDiscoveryResult {
    pub images: Vec<DiscoveredImage>,
    pub page_url: String,
    pub total_found: usize,
}

/// Splits a `srcset` attribute into one `DiscoveredImage` per candidate,
/// resolving relative URLs against `base_url` and parsing `NNNw` width
/// descriptors.
pub fn parse_srcset(srcset: &str, base_url: &str) -> Vec<DiscoveredImage> {
    let mut images = Vec::new();
    if srcset.trim().is_empty() {
        return images;
    }

    let base = match Url::parse(base_url) {
        Ok(u) => u,
        Err(_) => return images,
    };

    for part in SRCSET_SPLIT.split(srcset) {
        let part = part.trim();
        if part.is_empty() {
            continue;
        }
        let Some(caps) = SRCSET_ENTRY.captures(part) else { continue };
        let raw_url = caps.get(1).map(|m| m.as_str()).unwrap_or_default();
        let descriptor = caps.get(2).map(|m| m.as_str().trim()).filter(|s| !s.is_empty());

        let Ok(full_url) = base.join(raw_url) else { continue };
        let width = descriptor.and_then(|d| d.strip_suffix('w')).and_then(|n| n.parse::<u32>().ok());

        images.push(DiscoveredImage {
            url: full_url.to_string(),
            source: "srcset".to_string(),
            alt: None,
            title: None,
            width,
            height: None,
            srcset_descriptor: descriptor.map(str::to_string),
            priority: 2,
        });
    }

    images
}

#[derive(Debug, Deserialize)]
struct ImgTagData {
    src: Option<String>,
    srcset: Option<String>,
    #[serde(rename = "dataSrc")]
    data_src: Option<String>,
    #[serde(rename = "dataLazySrc")]
    data_lazy_src: Option<String>,
    #[serde(rename = "dataOriginal")]
    data_original: Option<String>,
    alt: Option<String>,
    title: Option<String>,
    width: Option<u32>,
    height: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct OgTagData {
    content: Option<String>,
    property: Option<String>,
}

#[derive(Debug, Deserialize)]
struct PictureSourceData {
    srcset: Option<String>,
}

fn join(base: &str, maybe_relative: &str) -> Option<String> {
    let base = Url::parse(base).ok()?;
    base.join(maybe_relative).ok().map(|u| u.to_string())
}

/// Discovers every image on `page_url` by evaluating a handful of small JS
/// snippets through `runtime`.
pub async fn discover_images(runtime: &dyn BrowserRuntime, page_url: &str) -> RuntimeResult<ImageDiscoveryResult> {
    let mut result = ImageDiscoveryResult { page_url: page_url.to_string(), ..Default::default() };
    let mut seen_urls: std::collections::HashSet<String> = std::collections::HashSet::new();

    let mut add_image = |img: DiscoveredImage, images: &mut Vec<DiscoveredImage>| {
        if !img.url.is_empty() && img.url.starts_with("http") && seen_urls.insert(img.url.clone()) {
            images.push(img);
        }
    };

    // 1. <img> tags.
    let img_data: Vec<ImgTagData> = serde_json::from_value(
        runtime
            .evaluate(
                "Array.from(document.querySelectorAll('img')).map(img => ({ \
                   src: img.src, srcset: img.srcset, dataSrc: img.dataset.src, \
                   dataLazySrc: img.dataset.lazySrc, dataOriginal: img.dataset.original, \
                   alt: img.alt, title: img.title, \
                   width: img.naturalWidth || img.width, height: img.naturalHeight || img.height }))",
            )
            .await?,
    )
    .unwrap_or_default();

    for img in &img_data {
        if let Some(src) = img.src.as_deref().filter(|s| !s.is_empty()) {
            if let Some(url) = join(page_url, src) {
                let mut di = DiscoveredImage::new(url, "img", 3);
                di.alt = img.alt.clone();
                di.title = img.title.clone();
                di.width = img.width;
                di.height = img.height;
                add_image(di, &mut result.images);
            }
        }

        if let Some(srcset) = img.srcset.as_deref().filter(|s| !s.is_empty()) {
            for mut srcset_img in parse_srcset(srcset, page_url) {
                srcset_img.alt = img.alt.clone();
                add_image(srcset_img, &mut result.images);
            }
        }

        for data_value in [&img.data_src, &img.data_lazy_src, &img.data_original] {
            if let Some(src) = data_value.as_deref().filter(|s| !s.is_empty()) {
                if let Some(url) = join(page_url, src) {
                    let mut di = DiscoveredImage::new(url, "data", 2);
                    di.alt = img.alt.clone();
                    add_image(di, &mut result.images);
                }
            }
        }
    }

    // 2. Open Graph images.
    let og_images: Vec<OgTagData> = serde_json::from_value(
        runtime
            .evaluate(
                "Array.from(document.querySelectorAll('meta[property^=\"og:image\"]')).map(meta => \
                 ({ content: meta.content, property: meta.getAttribute('property') }))",
            )
            .await?,
    )
    .unwrap_or_default();

    for og in &og_images {
        if let Some(content) = og.content.as_deref().filter(|s| !s.is_empty()) {
            let priority = if og.property.as_deref() == Some("og:image") { 5 } else { 4 };
            if let Some(url) = join(page_url, content) {
                add_image(DiscoveredImage::new(url, "og", priority), &mut result.images);
            }
        }
    }

    // 3. Twitter card images.
    let twitter_images: Vec<String> = serde_json::from_value(
        runtime
            .evaluate("Array.from(document.querySelectorAll('meta[name^=\"twitter:image\"]')).map(meta => meta.content)")
            .await?,
    )
    .unwrap_or_default();

    for url in twitter_images.into_iter().filter(|u| !u.is_empty()) {
        if let Some(url) = join(page_url, &url) {
            add_image(DiscoveredImage::new(url, "twitter", 4), &mut result.images);
        }
    }

    // 4. Schema.org JSON-LD.
    let schema_scripts: Vec<String> =
        serde_json::from_value(runtime.evaluate("Array.from(document.querySelectorAll('script[type=\"application/ld+json\"]')).map(s => s.textContent)").await?)
            .unwrap_or_default();

    for script in &schema_scripts {
        if let Ok(data) = serde_json::from_str::<Value>(script) {
            for img in extract_schema_images(&data, page_url) {
                add_image(img, &mut result.images);
            }
        }
    }

    // 5. <picture> sources.
    let picture_sources: Vec<PictureSourceData> = serde_json::from_value(
        runtime.evaluate("Array.from(document.querySelectorAll('picture source')).map(s => ({ srcset: s.srcset }))").await?,
    )
    .unwrap_or_default();

    for source in &picture_sources {
        if let Some(srcset) = source.srcset.as_deref().filter(|s| !s.is_empty()) {
            for mut img in parse_srcset(srcset, page_url) {
                img.source = "picture".to_string();
                add_image(img, &mut result.images);
            }
        }
    }

    // 6. CSS background-image.
    let bg_images: Vec<String> = serde_json::from_value(
        runtime
            .evaluate(
                "(() => { const out = []; document.querySelectorAll('[style*=\"background-image\"]').forEach(el => { \
                   out.push(el.getAttribute('style') || ''); }); return out; })()",
            )
            .await?,
    )
    .unwrap_or_default();

    for style in &bg_images {
        if let Some(caps) = BG_IMAGE.captures(style) {
            if let Some(raw) = caps.get(1) {
                if let Some(url) = join(page_url, raw.as_str()) {
                    add_image(DiscoveredImage::new(url, "css", 1), &mut result.images);
                }
            }
        }
    }

    result.images.sort_by(|a, b| b.priority.cmp(&a.priority));
    result.total_found = result.images.len();

    Ok(result)
}

/// Recurses into Schema.org JSON-LD, following `@graph` and nested objects,
/// pulling `image` values as strings, `{url, width, height}` objects, or
/// arrays of either.
fn extract_schema_images(data: &Value, base_url: &str) -> Vec<DiscoveredImage> {
    let mut images = Vec::new();
    process_schema_item(data, base_url, &mut images);
    images
}

fn process_schema_item(item: &Value, base_url: &str, images: &mut Vec<DiscoveredImage>) {
    match item {
        Value::Object(map) => {
            if let Some(img) = map.get("image") {
                collect_schema_image(img, base_url, images);
            }
            if let Some(graph) = map.get("@graph").and_then(Value::as_array) {
                for entry in graph {
                    process_schema_item(entry, base_url, images);
                }
            }
            for (key, value) in map {
                if key != "@graph" && (value.is_object() || value.is_array()) {
                    process_schema_item(value, base_url, images);
                }
            }
        }
        Value::Array(items) => {
            for entry in items {
                process_schema_item(entry, base_url, images);
            }
        }
        _ => {}
    }
}

fn collect_schema_image(img: &Value, base_url: &str, images: &mut Vec<DiscoveredImage>) {
    match img {
        Value::String(s) => {
            if let Some(url) = join(base_url, s) {
                images.push(DiscoveredImage::new(url, "schema", 4));
            }
        }
        Value::Object(map) => {
            if let Some(Value::String(url)) = map.get("url") {
                if let Some(url) = join(base_url, url) {
                    let mut di = DiscoveredImage::new(url, "schema", 4);
                    di.width = map.get("width").and_then(Value::as_u64).map(|n| n as u32);
                    di.height = map.get("height").and_then(Value::as_u64).map(|n| n as u32);
                    images.push(di);
                }
            }
        }
        Value::Array(items) => {
            for entry in items {
                if let Value::String(s) = entry {
                    if let Some(url) = join(base_url, s) {
                        images.push(DiscoveredImage::new(url, "schema", 4));
                    }
                }
            }
        }
        _ => {}
    }
}

/// Runs [`discover_images`] and collapses it to one entry per
/// scheme+host+path, keeping the highest-priority variant.
pub async fn discover_and_deduplicate(runtime: &dyn BrowserRuntime, page_url: &str) -> RuntimeResult<Vec<DiscoveredImage>> {
    let result = discover_images(runtime, page_url).await?;

    let mut by_base_url: HashMap<String, DiscoveredImage> = HashMap::new();
    for img in result.images {
        let Ok(parsed) = Url::parse(&img.url) else { continue };
        let base_key = format!("{}://{}{}", parsed.scheme(), parsed.host_str().unwrap_or(""), parsed.path());

        match by_base_url.get(&base_key) {
            Some(existing) if existing.priority >= img.priority => {}
            _ => {
                by_base_url.insert(base_key, img);
            }
        }
    }

    Ok(by_base_url.into_values().collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_srcset_extracts_width_descriptors() {
        let images = parse_srcset("a.jpg 480w, b.jpg 800w", "https://example.com/page");
        assert_eq!(images.len(), 2);
        assert_eq!(images[0].url, "https://example.com/a.jpg");
        assert_eq!(images[0].width, Some(480));
        assert_eq!(images[1].width, Some(800));
    }

    #[test]
    fn parse_srcset_handles_pixel_density_descriptors() {
        let images = parse_srcset("a.jpg 1x, b.jpg 2x", "https://example.com/");
        assert_eq!(images.len(), 2);
        assert_eq!(images[0].width, None);
        assert_eq!(images[0].srcset_descriptor.as_deref(), Some("1x"));
    }

    #[test]
    fn parse_srcset_empty_returns_empty() {
        assert!(parse_srcset("", "https://example.com/").is_empty());
    }

    #[test]
    fn extract_schema_images_recurses_through_graph() {
        let data: Value = serde_json::from_str(
            r#"{"@graph": [{"@type": "ImageObject", "image": {"url": "/a.jpg", "width": 100, "height": 50}}, {"nested": {"image": "/b.jpg"}}]}"#,
        )
        .unwrap();
        let images = extract_schema_images(&data, "https://example.com/page");
        assert_eq!(images.len(), 2);
        assert!(images.iter().any(|i| i.url == "https://example.com/a.jpg" && i.width == Some(100)));
        assert!(images.iter().any(|i| i.url == "https://example.com/b.jpg"));
    }

    #[test]
    fn extract_schema_images_handles_array_of_strings() {
        let data: Value = serde_json::from_str(r#"{"image": ["/a.jpg", "/b.jpg"]}"#).unwrap();
        let images = extract_schema_images(&data, "https://example.com/");
        assert_eq!(images.len(), 2);
    }
}
