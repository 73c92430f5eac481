// Copyright 2021-2024 SecureDNA Stiftung (SecureDNA Foundation) <licensing@securedna.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Push coordination for one connection.
//!
//! A [`PushLedger`] is shared by every request of a connection. It guarantees that a
//! URL is pushed at most once on that connection, however many concurrent requests
//! discover it, and keeps track of the *push cycles* in progress.
//!
//! A push cycle starts with a request sent by the client (the *origin*). Every push it
//! initiates reaches the application again as a *follow-up* request, which carries the
//! cycle's correlation identifier in the [`INTERNAL_REQUEST`] header. Follow-ups join
//! the cycle of their origin instead of starting their own, and a push is considered
//! complete once its follow-up request has finished. The origin can wait for all of
//! its pushes to complete before releasing its own response:
//!
//! ```
//! use std::sync::{Arc, Mutex};
//!
//! use http::{HeaderMap, Uri};
//! use vulcain::push::{PushError, PushLedger, PushTransport, INTERNAL_REQUEST};
//!
//! #[derive(Default)]
//! struct Recorder(Mutex<Vec<(String, HeaderMap)>>);
//!
//! impl PushTransport for Recorder {
//!     fn initiate_push(&self, target: &str, headers: HeaderMap) -> Result<(), PushError> {
//!         self.0.lock().unwrap().push((target.to_owned(), headers));
//!         Ok(())
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() {
//!     let ledger = Arc::new(PushLedger::new(None));
//!     let transport = Arc::new(Recorder::default());
//!
//!     let uri = Uri::from_static("/books/1");
//!     let origin = ledger
//!         .handle_for_request(&HeaderMap::new(), &uri, Some(transport.clone()))
//!         .unwrap();
//!     origin.push("/users/5", HeaderMap::new()).unwrap();
//!
//!     // The transport delivers the pushed request back to the application...
//!     let (target, headers) = transport.0.lock().unwrap().pop().unwrap();
//!     assert!(headers.contains_key(INTERNAL_REQUEST));
//!     let uri: Uri = target.parse().unwrap();
//!     let follow_up = ledger.handle_for_request(&headers, &uri, None).unwrap();
//!     assert!(follow_up.is_follow_up());
//!
//!     // ...and once it is done, the origin no longer has anything to wait for.
//!     follow_up.finish(false).await;
//!     origin.finish(true).await;
//! }
//! ```

use std::collections::hash_map::Entry;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use http::{HeaderMap, HeaderName, HeaderValue, Uri};
use tokio::sync::watch;
use tracing::debug;
use uuid::Uuid;

/// Header carrying the correlation identifier of a push cycle.
pub const INTERNAL_REQUEST: HeaderName = HeaderName::from_static("vulcain-internal");

#[derive(Debug, thiserror::Error)]
pub enum PushError {
    /// The URL was already pushed on this connection. Not a failure.
    #[error("relation already pushed")]
    AlreadyPushed,
    #[error("maximum number of pushes ({0}) reached")]
    BudgetExhausted(usize),
    #[error("push failed: {0}")]
    Transport(#[source] Box<dyn std::error::Error + Send + Sync>),
}

/// Connection-level ability to push resources to the client (e.g. HTTP/2 server push).
pub trait PushTransport: Send + Sync {
    /// Whether pushes can currently be initiated on this connection.
    fn has_push_capability(&self) -> bool {
        true
    }

    /// Initiates a push of `target`, a path and query on the connection's origin.
    ///
    /// `headers` are the headers of the request to push; the transport is expected to
    /// deliver that request back to the application.
    fn initiate_push(&self, target: &str, headers: HeaderMap) -> Result<(), PushError>;
}

/// Push bookkeeping for one connection.
pub struct PushLedger {
    max_pushes: Option<usize>,
    pushed: Mutex<HashSet<String>>,
    cycles: Mutex<HashMap<String, Arc<PushCycle>>>,
}

impl PushLedger {
    /// `max_pushes` bounds the pushes of each cycle; `None` means unlimited.
    pub fn new(max_pushes: Option<usize>) -> Self {
        Self {
            max_pushes,
            pushed: Default::default(),
            cycles: Default::default(),
        }
    }

    /// Whether `target` has been pushed on this connection.
    pub fn is_pushed(&self, target: &str) -> bool {
        self.pushed.lock().unwrap().contains(target)
    }

    pub fn pushed_count(&self) -> usize {
        self.pushed.lock().unwrap().len()
    }

    /// Number of push cycles whose origin has not finished yet.
    pub fn live_cycles(&self) -> usize {
        self.cycles.lock().unwrap().len()
    }

    /// Returns the push handle of a request, if it may push at all.
    ///
    /// Requests sent by the client start a new cycle when `transport` is available.
    /// Follow-ups of a live cycle join it; follow-ups of an unknown or finished cycle
    /// get no handle.
    pub fn handle_for_request(
        self: &Arc<Self>,
        headers: &HeaderMap,
        uri: &Uri,
        transport: Option<Arc<dyn PushTransport>>,
    ) -> Option<PushHandle> {
        let Some(correlation) = headers.get(INTERNAL_REQUEST) else {
            let transport = transport.filter(|transport| transport.has_push_capability())?;
            let cycle = Arc::new(PushCycle::new(Uuid::new_v4().to_string(), transport));
            self.cycles
                .lock()
                .unwrap()
                .insert(cycle.id.clone(), cycle.clone());
            return Some(PushHandle::new(self.clone(), cycle, Role::Origin));
        };

        let cycle = correlation
            .to_str()
            .ok()
            .and_then(|id| self.cycles.lock().unwrap().get(id).cloned());
        let Some(cycle) = cycle else {
            debug!("Follow-up request {uri} belongs to no live push cycle");
            return None;
        };
        let target = uri
            .path_and_query()
            .map_or_else(|| uri.path().to_owned(), |pq| pq.as_str().to_owned());
        Some(PushHandle::new(
            self.clone(),
            cycle,
            Role::FollowUp { target },
        ))
    }
}

struct PushCycle {
    id: String,
    transport: Arc<dyn PushTransport>,
    state: Mutex<CycleState>,
    /// Number of pushes initiated but not yet completed
    outstanding: watch::Sender<usize>,
}

#[derive(Default)]
struct CycleState {
    pushes: usize,
    in_flight: HashMap<String, usize>,
}

impl PushCycle {
    fn new(id: String, transport: Arc<dyn PushTransport>) -> Self {
        let (outstanding, _) = watch::channel(0);
        Self {
            id,
            transport,
            state: Default::default(),
            outstanding,
        }
    }

    fn complete(&self, target: &str) {
        let mut state = self.state.lock().unwrap();
        if let Entry::Occupied(mut in_flight) = state.in_flight.entry(target.to_owned()) {
            *in_flight.get_mut() -= 1;
            if *in_flight.get() == 0 {
                in_flight.remove();
            }
            self.outstanding
                .send_modify(|outstanding| *outstanding = outstanding.saturating_sub(1));
        }
    }
}

enum Role {
    Origin,
    FollowUp { target: String },
}

/// Per-request access to the push cycle of a connection.
///
/// Dropping a handle releases it without waiting for its pushes.
pub struct PushHandle {
    ledger: Arc<PushLedger>,
    cycle: Arc<PushCycle>,
    role: Role,
    released: AtomicBool,
}

impl PushHandle {
    fn new(ledger: Arc<PushLedger>, cycle: Arc<PushCycle>, role: Role) -> Self {
        Self {
            ledger,
            cycle,
            role,
            released: AtomicBool::new(false),
        }
    }

    /// Correlation identifier of the cycle.
    pub fn id(&self) -> &str {
        &self.cycle.id
    }

    pub fn is_follow_up(&self) -> bool {
        matches!(self.role, Role::FollowUp { .. })
    }

    /// Pushes `target` unless it was already pushed on this connection.
    ///
    /// The check against the connection's ledger and the registration of `target` are
    /// atomic, so concurrent requests discovering the same relation push it once. The
    /// correlation header is added to `headers` before they are handed to the transport.
    pub fn push(&self, target: &str, mut headers: HeaderMap) -> Result<(), PushError> {
        let correlation = HeaderValue::from_str(&self.cycle.id)
            .map_err(|err| PushError::Transport(err.into()))?;

        {
            let mut state = self.cycle.state.lock().unwrap();
            let mut pushed = self.ledger.pushed.lock().unwrap();
            if pushed.contains(target) {
                return Err(PushError::AlreadyPushed);
            }
            if let Some(max_pushes) = self.ledger.max_pushes {
                if state.pushes >= max_pushes {
                    return Err(PushError::BudgetExhausted(max_pushes));
                }
            }
            pushed.insert(target.to_owned());
            state.pushes += 1;
            *state.in_flight.entry(target.to_owned()).or_default() += 1;
            self.cycle
                .outstanding
                .send_modify(|outstanding| *outstanding += 1);
        }

        headers.insert(INTERNAL_REQUEST, correlation);
        let result = self.cycle.transport.initiate_push(target, headers);
        if let Err(err) = &result {
            debug!("Push of {target} was not initiated: {err}");
            self.cycle.complete(target);
            self.cycle.state.lock().unwrap().pushes -= 1;
            if !matches!(err, PushError::AlreadyPushed) {
                self.ledger.pushed.lock().unwrap().remove(target);
            }
        }
        result
    }

    /// Finishes the request this handle belongs to.
    ///
    /// If `wait` is true and this is the origin of the cycle, this waits until every push
    /// of the cycle has completed. Calling this more than once is harmless, and canceling
    /// the returned future while it waits leaves the handle unreleased (dropping it
    /// releases it).
    pub async fn finish(&self, wait: bool) {
        if wait && !self.is_follow_up() && !self.released.load(Ordering::Acquire) {
            let mut outstanding = self.cycle.outstanding.subscribe();
            // the sender lives as long as the cycle we hold, so this only ends at zero
            let _ = outstanding.wait_for(|&outstanding| outstanding == 0).await;
        }
        self.release();
    }

    fn release(&self) {
        if self.released.swap(true, Ordering::AcqRel) {
            return;
        }
        match &self.role {
            Role::Origin => {
                self.ledger.cycles.lock().unwrap().remove(&self.cycle.id);
            }
            Role::FollowUp { target } => self.cycle.complete(target),
        }
    }
}

impl Drop for PushHandle {
    fn drop(&mut self) {
        self.release();
    }
}
