// Copyright 2021-2024 SecureDNA Stiftung (SecureDNA Foundation) <licensing@securedna.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use anyhow::Context;
use clap::{crate_version, Args, Parser};
use serde::Deserialize;

use vulcain::{Options, RewritePolicy};

#[derive(Debug, Parser)]
#[clap(
    name = "vulcain_gateway",
    about = "Reverse proxy applying Preload and Fields directives to a JSON API",
    version = crate_version!()
)]
pub struct Opts {
    #[arg(
        long,
        env = "VULCAIN_CONFIG",
        help = "The path to the gateway config TOML",
        exclusive = true
    )]
    pub config: Option<PathBuf>,

    #[command(flatten)]
    pub settings: Option<Config>,
}

impl Opts {
    /// Returns the configuration from the TOML file or the command line, whichever was given.
    pub fn load_config(self) -> anyhow::Result<Config> {
        match self.config {
            Some(path) => Config::from_toml_file(&path),
            // Without --config, clap requires --upstream and fills in the settings.
            None => self.settings.context("--upstream is required without --config"),
        }
    }
}

#[derive(Clone, Debug, Args, Deserialize)]
pub struct Config {
    #[clap(
        long,
        help = "URL of the upstream API, e.g. http://127.0.0.1:8081",
        env = "VULCAIN_UPSTREAM"
    )]
    pub upstream: String,

    #[clap(
        long,
        help = "Address to listen on",
        default_value_t = Config::default_listen(),
        env = "VULCAIN_LISTEN"
    )]
    #[serde(default = "Config::default_listen")]
    pub listen: SocketAddr,

    #[clap(
        long,
        help = "Maximum simultaneous connections before 503 unavailable is returned",
        default_value_t = Config::default_max_connections(),
        env = "VULCAIN_MAX_CONNECTIONS"
    )]
    #[serde(default = "Config::default_max_connections")]
    pub max_connections: usize,

    #[clap(
        long,
        help = "Maximum number of relations pushed per request; unlimited if unset, 0 disables pushes",
        env = "VULCAIN_MAX_PUSHES"
    )]
    #[serde(default)]
    pub max_pushes: Option<usize>,

    #[clap(
        long,
        help = "Base URL prefixed to same-origin preload links",
        env = "VULCAIN_API_URL"
    )]
    #[serde(default)]
    pub api_url: Option<String>,

    #[clap(
        long,
        help = "Path to an OpenAPI description (JSON) used to turn identifiers into relations",
        env = "VULCAIN_OPENAPI"
    )]
    #[serde(default)]
    pub openapi: Option<PathBuf>,

    #[clap(
        long,
        help = "When relations in documents are rewritten: query, always or never",
        default_value_t = RewritePolicy::default(),
        env = "VULCAIN_REWRITE_POLICY"
    )]
    #[serde(default)]
    pub rewrite_policy: RewritePolicy,
}

impl Config {
    pub fn default_listen() -> SocketAddr {
        SocketAddr::from(([0, 0, 0, 0], 8080))
    }

    pub fn default_max_connections() -> usize {
        512
    }

    pub fn from_toml_file(path: &Path) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Couldn't open config TOML: {path:?}"))?;
        let config: Config =
            toml::from_str(&contents).with_context(|| format!("Couldn't parse as TOML: {path:?}"))?;
        let parent = path.parent().unwrap_or(".".as_ref());
        Ok(config.relative_to(parent))
    }

    /// Resolves the paths of a config file relative to the directory containing it.
    fn relative_to(mut self, base: &Path) -> Self {
        self.openapi = self.openapi.map(|path| base.join(path));
        self
    }

    pub fn options(&self) -> Options {
        Options {
            max_pushes: self.max_pushes,
            early_hints: false,
            api_url: self.api_url.clone(),
            rewrite_policy: self.rewrite_policy,
        }
    }
}
