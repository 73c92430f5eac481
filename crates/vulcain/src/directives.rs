// Copyright 2021-2024 SecureDNA Stiftung (SecureDNA Foundation) <licensing@securedna.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Extraction of the `preload` and `fields` directives from request headers or query

use http::{HeaderMap, HeaderName, Uri};
use sfv::{BareItem, Item, List, ListEntry, Parser, SerializeValue};
use tracing::debug;

use crate::selector::DirectiveKind;

pub const PRELOAD: HeaderName = HeaderName::from_static("preload");
pub const FIELDS: HeaderName = HeaderName::from_static("fields");

impl DirectiveKind {
    pub fn header_name(self) -> HeaderName {
        match self {
            DirectiveKind::Preload => PRELOAD,
            DirectiveKind::Fields => FIELDS,
        }
    }
}

/// Where a directive was read from.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DirectiveSource {
    Header,
    Query,
}

/// One parsed directive: its JSON pointers and where they came from.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Directive {
    paths: Vec<String>,
    source: DirectiveSource,
}

impl Directive {
    pub fn new(paths: Vec<String>, source: DirectiveSource) -> Self {
        Self { paths, source }
    }

    pub fn paths(&self) -> &[String] {
        &self.paths
    }

    pub fn source(&self) -> DirectiveSource {
        self.source
    }
}

/// Both directives of a request. Malformed or missing directives are `None`.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Directives {
    preload: Option<Directive>,
    fields: Option<Directive>,
}

impl Directives {
    /// Reads both directives, preferring headers over query parameters.
    pub fn from_request(headers: &HeaderMap, uri: &Uri) -> Self {
        let query = uri.query().unwrap_or_default();
        Self {
            preload: extract(DirectiveKind::Preload, headers, query),
            fields: extract(DirectiveKind::Fields, headers, query),
        }
    }

    pub fn get(&self, kind: DirectiveKind) -> Option<&Directive> {
        match kind {
            DirectiveKind::Preload => self.preload.as_ref(),
            DirectiveKind::Fields => self.fields.as_ref(),
        }
    }

    pub fn paths(&self, kind: DirectiveKind) -> impl Iterator<Item = &str> {
        self.get(kind)
            .into_iter()
            .flat_map(|directive| directive.paths.iter().map(String::as_str))
    }

    pub fn source(&self, kind: DirectiveKind) -> Option<DirectiveSource> {
        self.get(kind).map(Directive::source)
    }

    pub fn from_header(&self, kind: DirectiveKind) -> bool {
        self.source(kind) == Some(DirectiveSource::Header)
    }

    /// Whether any directive was carried by the query string.
    pub fn any_from_query(&self) -> bool {
        [DirectiveKind::Preload, DirectiveKind::Fields]
            .into_iter()
            .any(|kind| self.source(kind) == Some(DirectiveSource::Query))
    }
}

/// Picks exactly one source for a directive; header and query values are never merged.
fn extract(kind: DirectiveKind, headers: &HeaderMap, query: &str) -> Option<Directive> {
    let header_lines: Vec<&str> = headers
        .get_all(kind.header_name())
        .iter()
        .filter_map(|value| value.to_str().ok())
        .collect();
    if !header_lines.is_empty() {
        match parse_list(&header_lines.join(", ")) {
            Ok(paths) => return Some(Directive::new(paths, DirectiveSource::Header)),
            Err(err) => debug!("Ignoring malformed {} header: {err}", kind.name()),
        }
    }

    let query_values: Vec<String> = form_urlencoded::parse(query.as_bytes())
        .filter(|(key, _)| key == kind.name())
        .map(|(_, value)| value.into_owned())
        .collect();
    if query_values.is_empty() {
        return None;
    }
    match parse_list(&query_values.join(", ")) {
        Ok(paths) => Some(Directive::new(paths, DirectiveSource::Query)),
        Err(err) => {
            debug!("Ignoring malformed {} query parameter: {err}", kind.name());
            None
        }
    }
}

/// Parses a structured list, keeping only its string items.
pub fn parse_list(input: &str) -> Result<Vec<String>, &'static str> {
    let list = Parser::parse_list(input.as_bytes())?;
    Ok(list
        .into_iter()
        .filter_map(|entry| match entry {
            ListEntry::Item(Item {
                bare_item: BareItem::String(path),
                ..
            }) => Some(path),
            _ => None,
        })
        .collect())
}

/// Serializes pointers as a structured list of strings, or `None` if there is nothing
/// (or nothing serializable) to send.
pub fn serialize_list(paths: &[String]) -> Option<String> {
    if paths.is_empty() {
        return None;
    }
    let list: List = paths
        .iter()
        .map(|path| ListEntry::from(Item::new(BareItem::String(path.clone()))))
        .collect();
    list.serialize_value().ok()
}
