// Copyright 2021-2024 SecureDNA Stiftung (SecureDNA Foundation) <licensing@securedna.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! HTTP/1 reverse proxy applying Vulcain directives to the responses of an upstream API

pub mod opts;
pub mod proxy;
pub mod response;
pub mod server;

pub use opts::{Config, Opts};
pub use proxy::Gateway;
pub use server::Server;
