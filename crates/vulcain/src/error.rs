// Copyright 2021-2024 SecureDNA Stiftung (SecureDNA Foundation) <licensing@securedna.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

/// Failure to process a response. Anything else degrades to a less optimized response.
#[derive(Debug, thiserror::Error)]
pub enum ApplyError {
    #[error("could not read response body: {0}")]
    BodyRead(#[source] Box<dyn std::error::Error + Send + Sync>),
}
