// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
//! Image reference normalization
//!
//! Turns the raw `src`-style strings found in page markup into absolute,
//! canonical URLs. Normalization never fails: anything that cannot be
//! resolved becomes an empty string and the caller skips it.

use url::Url;

/// Query parameters CDN and image-proxy wrappers use to carry the real URL
const WRAPPER_PARAMS: &[&str] = &["url", "src", "image", "img", "imgurl"];

/// Nested wrappers are unwrapped at most this many times
const MAX_UNWRAP_DEPTH: usize = 3;

const REJECTED_SCHEMES: &[&str] = &["data:", "javascript:", "about:", "blob:", "mailto:"];

/// Resolve a raw image reference against the page it appeared on
///
/// Returns an empty string when the reference is empty, inline data, or
/// otherwise unresolvable.
pub fn normalize_image_url(raw: &str, base: &str) -> String {
    let raw = raw.trim();
    if raw.is_empty() {
        return String::new();
    }
    let lower = raw.to_ascii_lowercase();
    if REJECTED_SCHEMES.iter().any(|s| lower.starts_with(s)) {
        return String::new();
    }

    let resolved = if let Some(rest) = raw.strip_prefix("//") {
        Url::parse(&format!("https://{}", rest)).ok()
    } else {
        match Url::parse(raw) {
            Ok(url) => Some(url),
            Err(url::ParseError::RelativeUrlWithoutBase) => {
                Url::parse(base).ok().and_then(|b| b.join(raw).ok())
            }
            Err(_) => None,
        }
    };

    let mut url = match resolved {
        Some(url) if matches!(url.scheme(), "http" | "https") && url.host_str().is_some() => url,
        _ => return String::new(),
    };

    for _ in 0..MAX_UNWRAP_DEPTH {
        match unwrap_wrapper(&url) {
            Some(inner) => url = inner,
            None => break,
        }
    }

    url.set_fragment(None);
    // Serializing through `Url` percent-encodes spaces and other unsafe path
    // characters.
    url.to_string()
}

/// Extract the wrapped target of a CDN / proxy URL, if it is one
fn unwrap_wrapper(url: &Url) -> Option<Url> {
    let is_next_image = url.path().ends_with("/_next/image");
    for (key, value) in url.query_pairs() {
        if !WRAPPER_PARAMS.contains(&key.to_ascii_lowercase().as_str()) {
            continue;
        }
        let value = value.trim();
        if value.starts_with("http://") || value.starts_with("https://") {
            if let Ok(inner) = Url::parse(value) {
                if inner.host_str().is_some() {
                    return Some(inner);
                }
            }
        } else if value.starts_with("//") {
            if let Ok(inner) = Url::parse(&format!("https:{}", value)) {
                return Some(inner);
            }
        } else if is_next_image && value.starts_with('/') {
            if let Ok(inner) = url.join(value) {
                return Some(inner);
            }
        }
    }
    None
}

/// Identity used to decide whether two references name the same image
///
/// Host is case-folded, the scheme and a leading `www.` are ignored and the
/// fragment is dropped; path and query are kept as-is.
pub fn canonical_identity(url: &str) -> String {
    match Url::parse(url.trim()) {
        Ok(parsed) => {
            let host = parsed.host_str().unwrap_or_default().to_lowercase();
            let host = host.strip_prefix("www.").unwrap_or(&host).to_string();
            let mut identity = format!("{}{}", host, parsed.path());
            if let Some(query) = parsed.query() {
                identity.push('?');
                identity.push_str(query);
            }
            identity
        }
        Err(_) => url.trim().to_string(),
    }
}

/// Check if URL is safe to fetch (not localhost/private IP)
pub fn is_safe_url(url: &str) -> bool {
    let parsed = match Url::parse(url) {
        Ok(u) => u,
        Err(_) => return false,
    };

    if !["http", "https"].contains(&parsed.scheme()) {
        return false;
    }

    match parsed.host() {
        Some(url::Host::Domain(host)) => {
            let host = host.to_lowercase();
            host != "localhost" && !host.ends_with(".localhost") && !host.ends_with(".local")
        }
        Some(url::Host::Ipv4(ip)) => {
            !(ip.is_loopback()
                || ip.is_private()
                || ip.is_link_local()
                || ip.is_unspecified()
                || ip.is_broadcast())
        }
        Some(url::Host::Ipv6(ip)) => {
            let segments = ip.segments();
            let unique_local = (segments[0] & 0xfe00) == 0xfc00;
            let link_local = (segments[0] & 0xffc0) == 0xfe80;
            !(ip.is_loopback() || ip.is_unspecified() || unique_local || link_local)
        }
        None => false,
    }
}
