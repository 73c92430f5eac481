// Copyright 2021-2024 SecureDNA Stiftung (SecureDNA Foundation) <licensing@securedna.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio::net::TcpListener;
use tracing::{info, warn};

use vulcain_gateway::{Gateway, Opts, Server};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();
    let config = Opts::parse().load_config()?;
    let gateway = Arc::new(Gateway::from_config(&config)?);

    let listener = TcpListener::bind(config.listen)
        .await
        .with_context(|| format!("Couldn't listen on {}", config.listen))?;
    info!("Listening on {}, forwarding to {}", config.listen, config.upstream);
    let connections = futures::stream::unfold(listener, |listener| async {
        Some((listener.accept().await, listener))
    });

    let server = Server::new(config.max_connections);
    let shutdown = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            warn!("Unable to await CTRL-C: {err}");
            std::future::pending::<()>().await;
        }
        info!("Shutting down");
        server.graceful_shutdown().await;
    };
    tokio::join!(server.serve(connections, gateway), shutdown);
    Ok(())
}
