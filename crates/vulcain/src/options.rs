// Copyright 2021-2024 SecureDNA Stiftung (SecureDNA Foundation) <licensing@securedna.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

use std::fmt::Display;
use std::str::FromStr;

use serde::Deserialize;

/// When relation values in the document are replaced by their resolved form.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RewritePolicy {
    /// Only when a directive came from the query string. Header-driven responses stay
    /// a valid cache of the canonical representation.
    #[default]
    Query,
    Always,
    Never,
}

impl RewritePolicy {
    pub const ALL: [RewritePolicy; 3] = [Self::Query, Self::Always, Self::Never];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Query => "query",
            Self::Always => "always",
            Self::Never => "never",
        }
    }

    /// Whether relations are rewritten, given whether any directive came from the query.
    pub fn rewrites(self, directive_from_query: bool) -> bool {
        match self {
            Self::Query => directive_from_query,
            Self::Always => true,
            Self::Never => false,
        }
    }
}

impl Display for RewritePolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, thiserror::Error)]
#[error("unknown rewrite policy {0:?}, expected one of: query, always, never")]
pub struct ParseRewritePolicyError(String);

impl FromStr for RewritePolicy {
    type Err = ParseRewritePolicyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|policy| policy.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| ParseRewritePolicyError(s.to_owned()))
    }
}

/// Behavior of a [`crate::Vulcain`] instance.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize)]
pub struct Options {
    /// Pushes allowed per push cycle; unlimited when absent. Zero disables pushing.
    #[serde(default)]
    pub max_pushes: Option<usize>,
    /// Send the preload links of a response in a 103 Early Hints response.
    #[serde(default)]
    pub early_hints: bool,
    /// Base URL prefixed to same-origin preload links.
    #[serde(default)]
    pub api_url: Option<String>,
    #[serde(default)]
    pub rewrite_policy: RewritePolicy,
}

impl Options {
    pub fn with_max_pushes(mut self, max_pushes: Option<usize>) -> Self {
        self.max_pushes = max_pushes;
        self
    }

    pub fn with_early_hints(mut self, early_hints: bool) -> Self {
        self.early_hints = early_hints;
        self
    }

    pub fn with_api_url(mut self, api_url: impl Into<String>) -> Self {
        self.api_url = Some(api_url.into());
        self
    }

    pub fn with_rewrite_policy(mut self, rewrite_policy: RewritePolicy) -> Self {
        self.rewrite_policy = rewrite_policy;
        self
    }

    /// Whether pushing is disabled altogether.
    pub fn push_disabled(&self) -> bool {
        self.max_pushes == Some(0)
    }
}
