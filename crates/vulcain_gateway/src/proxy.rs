// Copyright 2021-2024 SecureDNA Stiftung (SecureDNA Foundation) <licensing@securedna.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Forwarding requests to the upstream API and applying directives to its responses

use std::str::FromStr;
use std::sync::Arc;

use anyhow::Context;
use http::header::{CONNECTION, HOST};
use http::uri::{Authority, InvalidUri, Scheme};
use http::{request, HeaderValue, Request, Response, StatusCode, Uri};
use hyper::body::Incoming;
use hyper::client::conn::http1;
use hyper_util::rt::TokioIo;
use tokio::net::TcpStream;
use tracing::{debug, warn};

use vulcain::{OpenApi, PushLedger, Vulcain};

use crate::opts::Config;
use crate::response::{self, GenericResponse};

#[derive(Debug, thiserror::Error)]
pub enum UpstreamError {
    #[error("invalid upstream URL: {0}")]
    InvalidUri(#[from] InvalidUri),
    #[error("unsupported upstream scheme {0:?}, only http is supported")]
    UnsupportedScheme(String),
    #[error("upstream URL has no host")]
    MissingAuthority,
}

/// Where requests are forwarded to.
#[derive(Clone, Debug)]
pub struct Upstream {
    authority: Authority,
    address: String,
}

impl Upstream {
    pub fn authority(&self) -> &Authority {
        &self.authority
    }
}

impl FromStr for Upstream {
    type Err = UpstreamError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let uri: Uri = s.parse()?;
        match uri.scheme() {
            Some(scheme) if *scheme == Scheme::HTTP => {}
            Some(scheme) => return Err(UpstreamError::UnsupportedScheme(scheme.to_string())),
            None => return Err(UpstreamError::UnsupportedScheme(String::new())),
        }
        let authority = uri
            .authority()
            .cloned()
            .ok_or(UpstreamError::MissingAuthority)?;
        let address = format!("{}:{}", authority.host(), authority.port_u16().unwrap_or(80));
        Ok(Self { authority, address })
    }
}

#[derive(Debug, thiserror::Error)]
enum ProxyError {
    #[error("could not connect to upstream: {0}")]
    Connect(#[from] std::io::Error),
    #[error("upstream request failed: {0}")]
    Http(#[from] hyper::Error),
}

/// Shared state of the gateway.
pub struct Gateway {
    vulcain: Vulcain,
    upstream: Upstream,
}

impl Gateway {
    pub fn new(vulcain: Vulcain, upstream: Upstream) -> Self {
        Self { vulcain, upstream }
    }

    pub fn from_config(config: &Config) -> anyhow::Result<Self> {
        let upstream = config
            .upstream
            .parse()
            .with_context(|| format!("Couldn't use upstream {:?}", config.upstream))?;
        let mut vulcain = Vulcain::new(config.options());
        if let Some(path) = &config.openapi {
            let openapi = OpenApi::from_path(path)?;
            vulcain = vulcain.with_route_lookup(Arc::new(openapi));
        }
        Ok(Self::new(vulcain, upstream))
    }

    pub fn vulcain(&self) -> &Vulcain {
        &self.vulcain
    }
}

/// Serves one request of a connection whose push ledger is `ledger`.
///
/// HTTP/1 connections cannot push, so relations reach the client as preload links.
pub async fn respond(
    gateway: Arc<Gateway>,
    ledger: Arc<PushLedger>,
    request: Request<Incoming>,
) -> GenericResponse {
    let (parts, body) = request.into_parts();
    let vulcain = &gateway.vulcain;
    let handle = vulcain.push_handle(&ledger, &parts, None);

    let response = match forward(&gateway.upstream, &parts, body).await {
        Ok(upstream_response) => {
            let (mut response_parts, body) = upstream_response.into_parts();
            let eligible = vulcain.is_eligible_request(&parts.headers, &parts.uri)
                && vulcain.is_eligible_response(
                    response_parts.status,
                    &response_parts.headers,
                    &parts.headers,
                );
            if eligible {
                let applied = vulcain
                    .apply(&parts, handle.as_ref(), body, &mut response_parts.headers, None)
                    .await;
                match applied {
                    Ok(body) => response::buffered(response_parts, body),
                    Err(err) => {
                        warn!("{err}");
                        response::text(StatusCode::BAD_GATEWAY, "Bad gateway")
                    }
                }
            } else {
                response::streamed(response_parts, body)
            }
        }
        Err(err) => {
            warn!("{err}");
            response::text(StatusCode::BAD_GATEWAY, "Bad gateway")
        }
    };

    vulcain.finish(handle.as_ref(), true).await;
    response
}

async fn forward(
    upstream: &Upstream,
    parts: &request::Parts,
    body: Incoming,
) -> Result<Response<Incoming>, ProxyError> {
    let stream = TcpStream::connect(&upstream.address).await?;
    let (mut sender, connection) = http1::handshake(TokioIo::new(stream)).await?;
    tokio::spawn(async move {
        if let Err(err) = connection.await {
            debug!("Upstream connection failed: {err}");
        }
    });

    let mut request = Request::new(body);
    *request.method_mut() = parts.method.clone();
    *request.uri_mut() = parts
        .uri
        .path_and_query()
        .cloned()
        .map_or_else(|| Uri::from_static("/"), Uri::from);
    *request.headers_mut() = parts.headers.clone();
    request.headers_mut().remove(CONNECTION);
    if let Ok(host) = HeaderValue::from_str(upstream.authority.as_str()) {
        request.headers_mut().insert(HOST, host);
    }

    Ok(sender.send_request(request).await?)
}
