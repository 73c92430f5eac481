// Copyright 2021-2024 SecureDNA Stiftung (SecureDNA Foundation) <licensing@securedna.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Decides whether an exchange is eligible for directive processing at all

use http::header::{CACHE_CONTROL, CONTENT_TYPE};
use http::{HeaderMap, HeaderName, StatusCode, Uri};
use once_cell::sync::Lazy;
use regex::Regex;

use crate::selector::DirectiveKind;

pub const PREFER: HeaderName = HeaderName::from_static("prefer");

static JSON_REGEX: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)\bjson\b").unwrap());
static NO_TRANSFORM_REGEX: Lazy<Regex> = Lazy::new(|| Regex::new(r"\bno-transform\b").unwrap());
static JSON_POINTER_PREFERENCE_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"\s*selector="?json-pointer"?"#).unwrap());

/// True iff the request carries at least one non-empty directive, as header or query.
pub fn is_eligible_request(headers: &HeaderMap, uri: &Uri) -> bool {
    let kinds = [DirectiveKind::Preload, DirectiveKind::Fields];
    let in_headers = kinds.iter().any(|kind| {
        headers
            .get_all(kind.header_name())
            .iter()
            .any(|value| !value.is_empty())
    });

    in_headers
        || form_urlencoded::parse(uri.query().unwrap_or_default().as_bytes()).any(
            |(key, value)| !value.is_empty() && kinds.iter().any(|kind| key == kind.name()),
        )
}

/// True iff the response is a JSON success we are allowed to transform, and the client
/// does not prefer a selector syntax other than JSON pointers.
pub fn is_eligible_response(
    status: StatusCode,
    headers: &HeaderMap,
    request_headers: &HeaderMap,
) -> bool {
    if !status.is_success() {
        return false;
    }

    let content_type = header_str(headers, &CONTENT_TYPE);
    if !JSON_REGEX.is_match(content_type) {
        return false;
    }
    if NO_TRANSFORM_REGEX.is_match(header_str(headers, &CACHE_CONTROL)) {
        return false;
    }

    let mut preferences = request_headers.get_all(PREFER).iter().peekable();
    if preferences.peek().is_none() {
        return true;
    }
    preferences.any(|preference| {
        preference
            .to_str()
            .is_ok_and(|preference| JSON_POINTER_PREFERENCE_REGEX.is_match(preference))
    })
}

fn header_str<'h>(headers: &'h HeaderMap, name: &HeaderName) -> &'h str {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default()
}
