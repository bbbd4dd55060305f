// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Local URL checks.
//!
//! These run before any network activity so obviously bad input never
//! reaches a fetch backend. They are a fast guard, not a security boundary.

use once_cell::sync::Lazy;
use regex::Regex;

/// `http(s)://` + (domain with TLD | localhost | dotted-quad IPv4)
/// + optional port + optional path/query.
static VALID_URL: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)^https?://(?:(?:[a-z0-9](?:[a-z0-9-]{0,61}[a-z0-9])?\.)+[a-z]{2,63}\.?|localhost|\d{1,3}\.\d{1,3}\.\d{1,3}\.\d{1,3})(?::\d+)?(?:/?|[/?]\S+)$",
    )
    .expect("valid URL regex")
});

/// Candidate URLs inside free-form text.
static URL_IN_TEXT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"(?i)https?://[^\s<>"']+"#).expect("valid extraction regex"));

/// Characters that usually end a sentence rather than a URL.
const TRAILING_PUNCTUATION: &[char] = &['.', ',', ';', ':', '!', '?', ')', ']', '}'];

/// Whether `url` is syntactically acceptable for a download attempt.
pub fn is_valid_url(url: &str) -> bool {
    VALID_URL.is_match(url)
}

/// Extract every valid URL from a chat message, in order of appearance.
pub fn extract_urls(text: &str) -> Vec<String> {
    URL_IN_TEXT
        .find_iter(text)
        .map(|m| m.as_str().trim_end_matches(TRAILING_PUNCTUATION))
        .filter(|candidate| is_valid_url(candidate))
        .map(str::to_string)
        .collect()
}
