// Copyright 2021-2024 SecureDNA Stiftung (SecureDNA Foundation) <licensing@securedna.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Turns relation values found in documents into URLs

use http::Uri;
use once_cell::sync::Lazy;
use url::{ParseError, Position, Url};

use crate::directives::serialize_list;
use crate::route::{RouteContext, RouteLookup};
use crate::selector::{DirectiveKind, Node};

/// Stand-in origin used to resolve relative references.
static LOCAL_ORIGIN: Lazy<Url> = Lazy::new(|| Url::parse("http://vulcain.invalid/").unwrap());

#[derive(Debug, thiserror::Error)]
pub enum RelationError {
    #[error("empty relation")]
    Empty,
    #[error("invalid relation {relation:?}: {source}")]
    InvalidUrl {
        relation: String,
        source: ParseError,
    },
}

/// A resolved relation.
///
/// Same-origin relations are rendered as path and query only, cross-origin ones as
/// full URLs. Network-path references (`//host/path`) keep inheriting the client's
/// scheme.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Relation {
    url: Url,
    same_origin: bool,
    scheme_relative: bool,
    from_route_lookup: bool,
}

impl Relation {
    /// Parses `raw`, resolving relative references against `base`.
    pub fn parse(raw: &str, base: &Url) -> Result<Self, RelationError> {
        if raw.is_empty() {
            return Err(RelationError::Empty);
        }
        let invalid = |source| RelationError::InvalidUrl {
            relation: raw.to_owned(),
            source,
        };

        match Url::parse(raw) {
            Ok(url) => Ok(Self {
                url,
                same_origin: false,
                scheme_relative: false,
                from_route_lookup: false,
            }),
            Err(ParseError::RelativeUrlWithoutBase) => {
                let url = base.join(raw).map_err(invalid)?;
                let same_origin = url.origin() == base.origin();
                Ok(Self {
                    url,
                    same_origin,
                    scheme_relative: raw.starts_with("//"),
                    from_route_lookup: false,
                })
            }
            Err(source) => Err(invalid(source)),
        }
    }

    pub fn is_same_origin(&self) -> bool {
        self.same_origin
    }

    /// Whether the relation was synthesized by a [`RouteLookup`].
    pub fn from_route_lookup(&self) -> bool {
        self.from_route_lookup
    }

    pub fn as_str(&self) -> &str {
        if self.same_origin {
            &self.url[Position::BeforePath..Position::AfterQuery]
        } else if self.scheme_relative {
            // Drops the placeholder scheme and its colon, keeping the leading "//".
            &self.url[Position::AfterScheme..][1..]
        } else {
            self.url.as_str()
        }
    }

    /// Carries the directives selected below `node` as query parameters, so that the
    /// related resource can be fetched with the same selection.
    pub fn append_directives(&mut self, node: &Node) {
        let directives: Vec<(&str, String)> = [DirectiveKind::Preload, DirectiveKind::Fields]
            .into_iter()
            .filter_map(|kind| {
                serialize_list(&node.sub_selectors(kind)).map(|list| (kind.name(), list))
            })
            .collect();
        if directives.is_empty() {
            return;
        }

        let kept: Vec<(String, String)> = self
            .url
            .query_pairs()
            .filter(|(key, _)| directives.iter().all(|(name, _)| key != name))
            .map(|(key, value)| (key.into_owned(), value.into_owned()))
            .collect();
        self.url
            .query_pairs_mut()
            .clear()
            .extend_pairs(kept)
            .extend_pairs(directives);
    }
}

impl std::fmt::Display for Relation {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Resolves the relations of one response.
///
/// The route of the request is looked up at most once, on first need.
pub struct RelationResolver<'a> {
    uri: &'a Uri,
    base: Url,
    lookup: Option<&'a dyn RouteLookup>,
    route: Option<Option<RouteContext>>,
}

impl<'a> RelationResolver<'a> {
    pub fn new(uri: &'a Uri, lookup: Option<&'a dyn RouteLookup>) -> Self {
        let base = LOCAL_ORIGIN
            .join(uri.path())
            .unwrap_or_else(|_| LOCAL_ORIGIN.clone());
        Self {
            uri,
            base,
            lookup,
            route: None,
        }
    }

    /// Resolves the value `raw` found at `selector`.
    pub fn resolve(&mut self, selector: &str, raw: &str) -> Result<Relation, RelationError> {
        let synthesized = match self.lookup {
            Some(lookup) => {
                let uri = self.uri;
                self.route
                    .get_or_insert_with(|| lookup.resolve_route(uri))
                    .as_ref()
                    .and_then(|route| lookup.resolve_relation(route, selector, raw))
                    .filter(|relation| !relation.is_empty())
            }
            None => None,
        };

        match synthesized {
            Some(relation) => {
                let mut relation = Relation::parse(&relation, &self.base)?;
                relation.from_route_lookup = true;
                Ok(relation)
            }
            None => Relation::parse(raw, &self.base),
        }
    }
}
