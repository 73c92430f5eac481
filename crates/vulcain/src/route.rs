// Copyright 2021-2024 SecureDNA Stiftung (SecureDNA Foundation) <licensing@securedna.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Interface to an external description of the API's routes.
//!
//! Non-hypermedia APIs often expose identifiers instead of links. A [`RouteLookup`]
//! turns such an identifier into the URL of the related resource, using whatever
//! knowledge it has of the API (see [`crate::openapi::OpenApi`]).

use http::Uri;

/// Opaque handle to the route a request was matched against.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RouteContext {
    id: String,
}

impl RouteContext {
    pub fn new(id: impl Into<String>) -> Self {
        Self { id: id.into() }
    }

    pub fn id(&self) -> &str {
        &self.id
    }
}

pub trait RouteLookup: Send + Sync {
    /// Finds the route serving `uri`, if the description knows it.
    fn resolve_route(&self, uri: &Uri) -> Option<RouteContext>;

    /// Builds the relation designated by the value at `selector` in a response of `route`.
    fn resolve_relation(&self, route: &RouteContext, selector: &str, raw: &str) -> Option<String>;
}
