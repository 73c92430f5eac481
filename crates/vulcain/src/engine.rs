// Copyright 2021-2024 SecureDNA Stiftung (SecureDNA Foundation) <licensing@securedna.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

use std::sync::Arc;

use bytes::Bytes;
use http::header::{CONTENT_LENGTH, LINK, TE, TRANSFER_ENCODING, VARY};
use http::{request, HeaderMap, HeaderValue, StatusCode, Uri};
use http_body::Body;
use http_body_util::BodyExt;
use serde_json::Value;
use tracing::{debug, warn};

use crate::directives::{serialize_list, Directives, FIELDS, PRELOAD};
use crate::error::ApplyError;
use crate::gate;
use crate::links::{preload_link, EarlyHints};
use crate::options::Options;
use crate::push::{PushError, PushHandle, PushLedger, PushTransport};
use crate::relation::{Relation, RelationResolver};
use crate::route::RouteLookup;
use crate::selector::{DirectiveKind, Node, SelectorTree};
use crate::traverse;

/// Applies preload and fields directives to the responses of an API.
///
/// A host calls, for every exchange:
/// 1. [`Vulcain::push_handle`] when the request arrives, with the ledger of its connection;
/// 2. [`Vulcain::apply`] once the response headers are known, if both
///    [`Vulcain::is_eligible_request`] and [`Vulcain::is_eligible_response`] hold;
/// 3. [`Vulcain::finish`], whether or not the exchange was eligible.
pub struct Vulcain {
    options: Options,
    route_lookup: Option<Arc<dyn RouteLookup>>,
}

impl Vulcain {
    pub fn new(options: Options) -> Self {
        Self {
            options,
            route_lookup: None,
        }
    }

    pub fn with_route_lookup(mut self, route_lookup: Arc<dyn RouteLookup>) -> Self {
        self.route_lookup = Some(route_lookup);
        self
    }

    /// Creates the push ledger of a new connection.
    pub fn new_ledger(&self) -> Arc<PushLedger> {
        Arc::new(PushLedger::new(self.options.max_pushes))
    }

    pub fn is_eligible_request(&self, headers: &HeaderMap, uri: &Uri) -> bool {
        gate::is_eligible_request(headers, uri)
    }

    pub fn is_eligible_response(
        &self,
        status: StatusCode,
        headers: &HeaderMap,
        request_headers: &HeaderMap,
    ) -> bool {
        gate::is_eligible_response(status, headers, request_headers)
    }

    /// Returns the push handle of a request; see [`PushLedger::handle_for_request`].
    pub fn push_handle(
        &self,
        ledger: &Arc<PushLedger>,
        request: &request::Parts,
        transport: Option<Arc<dyn PushTransport>>,
    ) -> Option<PushHandle> {
        ledger.handle_for_request(&request.headers, &request.uri, transport)
    }

    /// Reads `body` and returns it pruned to the requested fields, with the requested
    /// relations pushed or advertised.
    ///
    /// `response_headers` receives the `Link`, `Vary` and `Content-Length` headers of the
    /// new body. A body that is not JSON is returned as is. Only a failure to read `body`
    /// is an error.
    pub async fn apply<B>(
        &self,
        request: &request::Parts,
        handle: Option<&PushHandle>,
        body: B,
        response_headers: &mut HeaderMap,
        early_hints: Option<&dyn EarlyHints>,
    ) -> Result<Bytes, ApplyError>
    where
        B: Body,
        B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        let original = body
            .collect()
            .await
            .map_err(|err| ApplyError::BodyRead(err.into()))?
            .to_bytes();

        let directives = Directives::from_request(&request.headers, &request.uri);
        let tree = SelectorTree::from_directives(&directives);
        if tree.is_empty() {
            set_length(response_headers, original.len());
            return Ok(original);
        }

        let document: Value = match serde_json::from_slice(&original) {
            Ok(document) => document,
            Err(err) => {
                debug!("Response to {} is not valid JSON: {err}", request.uri);
                set_length(response_headers, original.len());
                return Ok(original);
            }
        };

        let rewrite_relations = self
            .options
            .rewrite_policy
            .rewrites(directives.any_from_query());
        let mut resolver = RelationResolver::new(&request.uri, self.route_lookup.as_deref());
        let mut links: Vec<HeaderValue> = vec![];
        let mut preloaded = false;

        let rewritten = traverse::rewrite(&document, &tree, |node, raw| {
            let mut relation = match resolver.resolve(node.pointer(), raw) {
                Ok(relation) => relation,
                Err(err) => {
                    debug!(selector = node.pointer(), "Skipping relation: {err}");
                    return rewrite_relations.then(String::new);
                }
            };
            preloaded = true;

            let rewrite = rewrite_relations && !relation.from_route_lookup();
            if rewrite {
                relation.append_directives(node);
            }
            if let Some(link) = self.push_or_fallback(handle, request, &directives, node, &relation)
            {
                if !links.contains(&link) {
                    links.push(link);
                }
            }
            rewrite.then(|| relation.to_string())
        });

        let body = match serde_json::to_vec(&rewritten) {
            Ok(body) => Bytes::from(body),
            Err(err) => {
                warn!("Could not serialize rewritten document: {err}");
                set_length(response_headers, original.len());
                return Ok(original);
            }
        };

        if preloaded {
            response_headers.append(VARY, HeaderValue::from_static("preload"));
        }
        if directives.from_header(DirectiveKind::Fields) {
            response_headers.append(VARY, HeaderValue::from_static("fields"));
        }
        for link in &links {
            response_headers.append(LINK, link.clone());
        }
        set_length(response_headers, body.len());

        if let (true, false, Some(early_hints)) =
            (self.options.early_hints, links.is_empty(), early_hints)
        {
            // upstream links are hinted along with ours
            let hints: Vec<HeaderValue> = response_headers.get_all(LINK).iter().cloned().collect();
            if let Err(err) = early_hints.send_early_hints(&hints) {
                debug!("Could not send early hints: {err}");
            }
        }

        Ok(body)
    }

    /// Releases the push handle of a request, waiting for the pushes it initiated if
    /// `wait` is true. Must be called for every request, eligible or not.
    pub async fn finish(&self, handle: Option<&PushHandle>, wait: bool) {
        if let Some(handle) = handle {
            handle.finish(wait).await;
        }
    }

    /// Pushes `relation`, or returns the `Link` value advertising it instead.
    fn push_or_fallback(
        &self,
        handle: Option<&PushHandle>,
        request: &request::Parts,
        directives: &Directives,
        node: &Node,
        relation: &Relation,
    ) -> Option<HeaderValue> {
        let nopush = self.options.push_disabled() || !relation.is_same_origin();
        if let (false, Some(handle)) = (nopush, handle) {
            let headers = forwarded_headers(&request.headers, directives, node);
            match handle.push(relation.as_str(), headers) {
                Ok(()) => {
                    debug!(%relation, "Relation pushed");
                    return None;
                }
                Err(PushError::AlreadyPushed) => {
                    debug!(%relation, "Relation already pushed");
                    return None;
                }
                Err(err) => debug!(%relation, "Failed to push: {err}"),
            }
        }

        let link = preload_link(relation, self.options.api_url.as_deref(), nopush);
        match HeaderValue::try_from(link) {
            Ok(link) => {
                debug!(%relation, nopush, "Link preload header added");
                Some(link)
            }
            Err(err) => {
                warn!(%relation, "Invalid preload link: {err}");
                None
            }
        }
    }
}

/// Headers of the request pushing a relation found at `node`.
///
/// Directives that arrived as headers are narrowed to the selections below `node`;
/// directives that arrived in the query string travel in the relation's URL instead.
fn forwarded_headers(request_headers: &HeaderMap, directives: &Directives, node: &Node) -> HeaderMap {
    let mut headers = request_headers.clone();
    headers.remove(PRELOAD);
    headers.remove(FIELDS);
    headers.remove(TE);

    for kind in [DirectiveKind::Preload, DirectiveKind::Fields] {
        if !directives.from_header(kind) {
            continue;
        }
        let value = serialize_list(&node.sub_selectors(kind))
            .and_then(|list| HeaderValue::try_from(list).ok());
        if let Some(value) = value {
            headers.insert(kind.header_name(), value);
        }
    }
    headers
}

fn set_length(headers: &mut HeaderMap, length: usize) {
    headers.remove(TRANSFER_ENCODING);
    headers.insert(CONTENT_LENGTH, HeaderValue::from(length));
}
