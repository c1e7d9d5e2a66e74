//! Cache-busting query tokens
//!
//! A retry must not be answered from a cached failure, so the URL gets a
//! disambiguating `t` parameter. Any earlier token is replaced rather than
//! stacked.

use uuid::Uuid;

/// Query parameter carrying the token
pub const CACHE_BUST_PARAM: &str = "t";

/// Fresh token, unique per call
pub fn new_token() -> String {
    Uuid::new_v4().simple().to_string()
}

/// Append a fresh cache-busting token to `url`
pub fn cache_bust(url: &str) -> String {
    with_token(url, &new_token())
}

/// Set the cache-busting parameter of `url` to `token`.
///
/// The rest of the query is kept byte for byte: signed URLs break if their
/// parameters are re-encoded.
pub fn with_token(url: &str, token: &str) -> String {
    let stripped = strip_token(url);
    let (rest, fragment) = split_fragment(&stripped);

    let separator = if !rest.contains('?') {
        "?"
    } else if rest.ends_with('?') {
        ""
    } else {
        "&"
    };

    let mut out = format!("{}{}{}={}", rest, separator, CACHE_BUST_PARAM, token);
    if let Some(fragment) = fragment {
        out.push('#');
        out.push_str(fragment);
    }
    out
}

/// The URL without any cache-busting parameter.
///
/// Only pairs whose key is exactly `t` are dropped; every other byte of the
/// query, empty pairs included, survives.
pub fn strip_token(url: &str) -> String {
    let (rest, fragment) = split_fragment(url);
    let (base, query) = match rest.split_once('?') {
        Some((base, query)) => (base, query),
        None => return url.to_string(),
    };

    let kept: Vec<&str> = query
        .split('&')
        .filter(|pair| !is_token_pair(pair))
        .collect();

    let mut out = base.to_string();
    if !kept.is_empty() {
        out.push('?');
        out.push_str(&kept.join("&"));
    }
    if let Some(fragment) = fragment {
        out.push('#');
        out.push_str(fragment);
    }
    out
}

fn split_fragment(url: &str) -> (&str, Option<&str>) {
    match url.split_once('#') {
        Some((rest, fragment)) => (rest, Some(fragment)),
        None => (url, None),
    }
}

fn is_token_pair(pair: &str) -> bool {
    let key = pair.split('=').next().unwrap_or("");
    key == CACHE_BUST_PARAM
}
