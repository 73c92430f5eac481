// Copyright 2021-2024 SecureDNA Stiftung (SecureDNA Foundation) <licensing@securedna.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Preload hints, the fallback delivery of relations that could not be pushed

use http::HeaderValue;

use crate::relation::Relation;

pub type EarlyHintsError = Box<dyn std::error::Error + Send + Sync>;

/// Host capability to send a 103 Early Hints response ahead of the final response.
pub trait EarlyHints: Send + Sync {
    /// Sends one informational response carrying `links` as `Link` header values.
    fn send_early_hints(&self, links: &[HeaderValue]) -> Result<(), EarlyHintsError>;
}

/// Formats the `Link` value advertising `relation`.
///
/// `nopush` tells the client that the relation will never be pushed, so it should not
/// wait for a push before fetching it. `api_url` prefixes same-origin relations.
pub fn preload_link(relation: &Relation, api_url: Option<&str>, nopush: bool) -> String {
    let prefix = match api_url {
        Some(api_url) if relation.is_same_origin() => api_url.trim_end_matches('/'),
        _ => "",
    };
    let mut link = format!("<{prefix}{relation}>; rel=preload; as=fetch");
    if nopush {
        link.push_str("; nopush");
    }
    link
}
