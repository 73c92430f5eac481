// Copyright 2021-2024 SecureDNA Stiftung (SecureDNA Foundation) <licensing@securedna.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! [`Server`]-related things

use std::convert::Infallible;
use std::future::Future;
use std::net::SocketAddr;
use std::pin::pin;
use std::sync::Arc;
use std::time::Duration;

use futures::{FutureExt, Stream, StreamExt};
use hyper::body::{Body, Incoming};
use hyper::server::conn::http1;
use hyper::service::{service_fn, HttpService};
use hyper::Request;
use hyper_util::rt::TokioIo;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::select;
use tokio::sync::{mpsc, watch, Semaphore};
use tokio::time::sleep;
use tracing::{error, info, info_span, warn, Instrument};

use crate::proxy::{self, Gateway};

/// Serves gateway connections while allowing for graceful shutdowns.
pub struct Server {
    concurrent_connections: Arc<Semaphore>,
    shutdown: watch::Sender<bool>,
}

impl Server {
    /// `max_connections` is the maximum number of simultaneous connections that may be handled
    /// across all [`serve`](Self::serve) calls before they start responding with 503s.
    pub fn new(max_connections: usize) -> Self {
        let concurrent_connections = Arc::new(Semaphore::new(max_connections));
        let (shutdown, _) = watch::channel(false);
        Self {
            concurrent_connections,
            shutdown,
        }
    }

    /// Serve incoming `connections` through `gateway`.
    ///
    /// Each connection is handled in its own task and gets its own push ledger, shared by
    /// all the requests it carries. Resolves once [`graceful_shutdown`](Self::graceful_shutdown)
    /// has been called (or `connections` is exhausted) and no connection is left.
    ///
    /// If the [`Server`] is already at its `max_connections` limit, new connections are
    /// served a single minimal 503 response.
    pub async fn serve<P, C>(&self, connections: P, gateway: Arc<Gateway>)
    where
        P: Stream<Item = std::io::Result<(C, SocketAddr)>>,
        C: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        // This receiver is what keeps graceful_shutdown from returning, so it must be
        // the last thing dropped.
        let mut shutdown_receiver = self.shutdown.subscribe();
        let mut was_shutdown = pin!(shutdown_receiver.wait_for(|&done| done).map(|_| None));

        async fn either<T>(f1: impl Future<Output = T>, f2: impl Future<Output = T>) -> T {
            select! {
                biased; // never handle connections once shut down
                x1 = f1 => x1,
                x2 = f2 => x2,
            }
        }

        // Every connection task holds a sender; recv yields None once they are all gone.
        let (alive, mut all_closed) = mpsc::channel::<()>(1);

        info!("Started serving");

        // scope is only to force `connections` to be dropped
        {
            let mut connections = pin!(connections);
            while let Some(accepted) = either(&mut was_shutdown, connections.next()).await {
                let (connection, peer_addr) = match accepted {
                    Ok(accepted) => accepted,
                    Err(err) => {
                        error!("Couldn't accept connection: {err}");
                        continue;
                    }
                };

                let connection_span = info_span!("connection", addr=%peer_addr);
                let permit = match self.concurrent_connections.clone().try_acquire_owned() {
                    Ok(permit) => permit,
                    Err(_) => {
                        async {
                            warn!("Too overloaded; sending minimal 503.");
                            let _ = respond_with_temporarily_unavailable(connection).await;
                        }
                        .instrument(connection_span)
                        .await;
                        continue;
                    }
                };

                let ledger = gateway.vulcain().new_ledger();
                let gateway = gateway.clone();
                let service = service_fn(move |request: Request<Incoming>| {
                    let gateway = gateway.clone();
                    let ledger = ledger.clone();
                    async move {
                        info!("Request: {} {}", request.method(), request.uri());
                        let response = proxy::respond(gateway, ledger, request).await;
                        info!("Response: {}", response.status());
                        Ok::<_, Infallible>(response)
                    }
                });

                let mut shutdown_receiver = self.shutdown.subscribe();
                let alive = alive.clone();
                let connection_task = async move {
                    let _alive = alive;
                    let _permit = permit;
                    info!("Connected.");
                    let wants_shutdown = shutdown_receiver.wait_for(|&done| done);
                    let http_connection = http1::Builder::new()
                        .half_close(true)
                        .serve_connection(TokioIo::new(connection), service);
                    if let Err(err) = with_graceful_shutdown(http_connection, wants_shutdown).await
                    {
                        error!("Error serving: {err}");
                    }
                    info!("Disconnected.");
                };
                tokio::task::spawn(connection_task.instrument(connection_span));
            }
        }

        drop(alive);
        all_closed.recv().await;
        info!("Stopped serving");
    }

    /// Gracefully shuts down server.
    ///
    /// New calls to [`serve`](Self::serve) resolve immediately without handling new connections.
    /// Existing calls stop accepting, then wait for their connections to finish their
    /// current request (idle connections are closed immediately). Resolves once all calls
    /// to [`serve`](Self::serve) have resolved or been dropped.
    pub async fn graceful_shutdown(&self) {
        self.shutdown.send_replace(true);
        self.shutdown.closed().await;
    }
}

/// Cheaply responds to an HTTP 1 connection with a minimal 503.
async fn respond_with_temporarily_unavailable(
    mut connection: impl AsyncWriteExt + Unpin,
) -> std::io::Result<()> {
    // The request is not parsed, and a slow client gets at most a second.
    let write_response = async {
        let msg = b"HTTP/1.1 503 Service Unavailable\r\n\
                    Content-Type: text/plain;charset=utf-8\r\n\
                    Content-Length: 22\r\n\
                    \r\n\
                    Too many connections!\n";
        connection.write_all(msg).await?;
        connection.shutdown().await
    };
    select! {
         result = write_response => result,
         _ = sleep(Duration::from_secs(1)) => Err(std::io::ErrorKind::TimedOut.into()),
    }
}

/// Gracefully terminate `connection` if `want_shutdown` resolves.
async fn with_graceful_shutdown<I, S, B>(
    connection: http1::Connection<I, S>,
    want_shutdown: impl Future,
) -> Result<(), hyper::Error>
where
    I: hyper::rt::Read + hyper::rt::Write + Unpin + 'static,
    S: HttpService<Incoming, ResBody = B>,
    S::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
    B: Body + 'static,
    B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    // Polling and graceful shutdown both need exclusive access to the connection.
    let mut connection = pin!(connection);
    let mut want_shutdown = pin!(want_shutdown.fuse());
    std::future::poll_fn(|cx| {
        if want_shutdown.as_mut().poll(cx).is_ready() {
            connection.as_mut().graceful_shutdown();
        }
        connection.as_mut().poll(cx)
    })
    .await
}
