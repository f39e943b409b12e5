// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
//! HTML content extraction
//!
//! Extracts the main text, the title and every image candidate from rendered
//! page HTML using CSS selectors.

use regex::Regex;
use scraper::node::Node;
use scraper::{ElementRef, Html, Selector};
use std::collections::HashSet;
use std::sync::OnceLock;

/// Lazy-load attributes that carry the real image URL
const LAZY_ATTRS: &[&str] = &[
    "data-src",
    "data-original",
    "data-lazy-src",
    "data-actualsrc",
    "data-url",
    "data-echo",
];

const SKIPPED_TAGS: &[&str] = &["script", "style", "noscript", "template", "svg"];

/// Where in the markup a candidate came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CandidateSource {
    Img,
    LazyAttribute,
    Srcset,
    PictureSource,
    CssBackground,
}

/// Raw, not yet normalized image reference
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageCandidate {
    pub raw: String,
    pub source: CandidateSource,
    pub alt: Option<String>,
}

/// Extract main content from HTML
///
/// Tries multiple strategies in order:
/// 1. `<article>` tag
/// 2. `<main>` tag
/// 3. `[role="main"]` attribute
/// 4. Common content class names (.post-content, .article-body, etc.)
/// 5. Fallback to `<body>`
///
/// Script, style and template text never reaches the output.
pub fn extract_main_content(html: &str, max_chars: usize) -> String {
    let document = Html::parse_document(html);

    let selectors = [
        "article",
        "main",
        "[role='main']",
        ".post-content",
        ".article-content",
        ".article-body",
        ".entry-content",
        ".story-body",
        ".article__body",
        ".rich_media_content", // WeChat articles
        "#article-body",
        "#content",
        ".prose",
    ];

    for selector_str in selectors {
        if let Ok(selector) = Selector::parse(selector_str) {
            if let Some(element) = document.select(&selector).next() {
                let cleaned = clean_text(&visible_text(element));
                if cleaned.chars().count() > 200 {
                    return truncate_content(&cleaned, max_chars);
                }
            }
        }
    }

    extract_body_text(&document, max_chars)
}

/// Page title from `<title>`, then `og:title`, then the first `<h1>`
pub fn extract_title(html: &str) -> Option<String> {
    let document = Html::parse_document(html);

    let from_text = |selector: &str| -> Option<String> {
        let selector = Selector::parse(selector).ok()?;
        let element = document.select(&selector).next()?;
        let title = clean_text(&element.text().collect::<String>());
        (!title.is_empty()).then_some(title)
    };

    from_text("title")
        .or_else(|| {
            let selector = Selector::parse("meta[property='og:title']").ok()?;
            let content = document.select(&selector).next()?.value().attr("content")?;
            let title = clean_text(content);
            (!title.is_empty()).then_some(title)
        })
        .or_else(|| from_text("h1"))
}

/// Every image reference on the page, in document order, without duplicates
///
/// Covers `<img>` (including lazy-load attributes and `srcset`),
/// `<picture><source>` and CSS `background-image` in inline styles and
/// `<style>` blocks.
pub fn extract_image_candidates(html: &str) -> Vec<ImageCandidate> {
    let document = Html::parse_document(html);
    let mut candidates = Vec::new();

    if let Ok(img_selector) = Selector::parse("img") {
        for img in document.select(&img_selector) {
            let el = img.value();
            let alt = el
                .attr("alt")
                .map(clean_text)
                .filter(|a| !a.is_empty());
            let mut push = |raw: &str, source| {
                candidates.push(ImageCandidate {
                    raw: raw.trim().to_string(),
                    source,
                    alt: alt.clone(),
                })
            };

            for attr in LAZY_ATTRS {
                if let Some(value) = el.attr(attr) {
                    push(value, CandidateSource::LazyAttribute);
                }
            }
            if let Some(src) = el.attr("src") {
                push(src, CandidateSource::Img);
            }
            for attr in ["srcset", "data-srcset"] {
                if let Some(best) = el.attr(attr).and_then(best_src_from_srcset) {
                    push(&best, CandidateSource::Srcset);
                }
            }
        }
    }

    if let Ok(source_selector) = Selector::parse("picture source") {
        for source in document.select(&source_selector) {
            let el = source.value();
            let best = el
                .attr("srcset")
                .or_else(|| el.attr("data-srcset"))
                .and_then(best_src_from_srcset);
            if let Some(best) = best {
                candidates.push(ImageCandidate {
                    raw: best,
                    source: CandidateSource::PictureSource,
                    alt: None,
                });
            }
        }
    }

    if let Ok(styled) = Selector::parse("[style]") {
        for element in document.select(&styled) {
            if let Some(style) = element.value().attr("style") {
                push_css_backgrounds(style, &mut candidates);
            }
        }
    }
    if let Ok(style_blocks) = Selector::parse("style") {
        for block in document.select(&style_blocks) {
            let css: String = block.text().collect();
            push_css_backgrounds(&css, &mut candidates);
        }
    }

    let mut seen = HashSet::new();
    candidates.retain(|c| !c.raw.is_empty() && seen.insert(c.raw.clone()));
    candidates
}

fn css_url_regex() -> Option<&'static Regex> {
    static CSS_URL_RE: OnceLock<Option<Regex>> = OnceLock::new();
    CSS_URL_RE
        .get_or_init(|| Regex::new(r#"url\(\s*['"]?([^'")\s]+)['"]?\s*\)"#).ok())
        .as_ref()
}

fn push_css_backgrounds(css: &str, candidates: &mut Vec<ImageCandidate>) {
    if !css.contains("background") {
        return;
    }
    let Some(re) = css_url_regex() else {
        return;
    };
    for cap in re.captures_iter(css) {
        if let Some(url) = cap.get(1) {
            candidates.push(ImageCandidate {
                raw: url.as_str().to_string(),
                source: CandidateSource::CssBackground,
                alt: None,
            });
        }
    }
}

/// Largest entry of a `srcset`, by width (`w`) or density (`x`) descriptor
fn best_src_from_srcset(srcset: &str) -> Option<String> {
    let mut best: Option<(f64, String)> = None;
    for part in srcset.split(',') {
        let mut pieces = part.split_whitespace();
        let Some(url) = pieces.next() else {
            continue;
        };
        let weight = pieces
            .next()
            .and_then(|d| {
                let d = d.to_ascii_lowercase();
                d.strip_suffix('w')
                    .or_else(|| d.strip_suffix('x'))
                    .and_then(|n| n.parse::<f64>().ok())
            })
            .unwrap_or(1.0);
        if best.as_ref().map_or(true, |(w, _)| weight > *w) {
            best = Some((weight, url.to_string()));
        }
    }
    best.map(|(_, url)| url)
}

/// Text under `element`, skipping script/style/template subtrees
fn visible_text(element: ElementRef) -> String {
    let mut out = String::new();
    collect_text(element, &mut out);
    out
}

fn collect_text(element: ElementRef, out: &mut String) {
    for child in element.children() {
        match child.value() {
            Node::Text(text) => {
                out.push_str(text);
                out.push(' ');
            }
            Node::Element(el) if SKIPPED_TAGS.contains(&el.name()) => {}
            Node::Element(_) => {
                if let Some(child_el) = ElementRef::wrap(child) {
                    collect_text(child_el, out);
                }
            }
            _ => {}
        }
    }
}

fn extract_body_text(document: &Html, max_chars: usize) -> String {
    if let Ok(body_selector) = Selector::parse("body") {
        if let Some(body) = document.select(&body_selector).next() {
            let cleaned = clean_text(&visible_text(body));
            return truncate_content(&cleaned, max_chars);
        }
    }
    String::new()
}

/// Normalize whitespace
fn clean_text(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Truncate to at most `max_chars` bytes on a char and word boundary
fn truncate_content(text: &str, max_chars: usize) -> String {
    if text.len() <= max_chars {
        return text.to_string();
    }

    let mut end = max_chars;
    while end > 0 && !text.is_char_boundary(end) {
        end -= 1;
    }
    let truncated = &text[..end];
    match truncated.rfind(' ') {
        Some(last_space) if last_space > 0 => format!("{}...", &text[..last_space]),
        _ => format!("{}...", truncated),
    }
}
