// Copyright 2021-2024 SecureDNA Stiftung (SecureDNA Foundation) <licensing@securedna.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Server side of the Vulcain protocol.
//!
//! Clients send `Preload` and `Fields` directives, as headers or query parameters,
//! listing JSON pointers into the response document. The response is pruned to the
//! requested fields, and the requested relations are pushed to the client (or
//! advertised as preload links when they cannot be pushed).

pub mod directives;
mod engine;
pub mod error;
pub mod gate;
pub mod links;
pub mod openapi;
pub mod options;
pub mod push;
pub mod relation;
pub mod route;
pub mod selector;
pub mod traverse;

pub use crate::directives::{Directive, DirectiveSource, Directives};
pub use crate::engine::Vulcain;
pub use crate::error::ApplyError;
pub use crate::links::EarlyHints;
pub use crate::openapi::OpenApi;
pub use crate::options::{Options, RewritePolicy};
pub use crate::push::{PushError, PushHandle, PushLedger, PushTransport};
pub use crate::route::{RouteContext, RouteLookup};
pub use crate::selector::{DirectiveKind, SelectorTree};
