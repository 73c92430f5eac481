// Copyright 2021-2024 SecureDNA Stiftung (SecureDNA Foundation) <licensing@securedna.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use http::header::{CONTENT_LENGTH, LINK, VARY};
use http::{request, HeaderMap, HeaderValue, Request, Uri};
use http_body_util::Full;
use serde_json::{json, Value};

use vulcain::links::EarlyHintsError;
use vulcain::push::INTERNAL_REQUEST;
use vulcain::{EarlyHints, OpenApi, Options, PushError, PushLedger, PushTransport, Vulcain};

/// Records pushes, and delivers the pushed requests back as follow-ups that finish
/// shortly after.
struct LoopbackTransport {
    ledger: Arc<PushLedger>,
    pushes: Mutex<Vec<(String, HeaderMap)>>,
    fail: AtomicBool,
}

impl LoopbackTransport {
    fn new(ledger: &Arc<PushLedger>) -> Arc<Self> {
        Arc::new(Self {
            ledger: ledger.clone(),
            pushes: Default::default(),
            fail: AtomicBool::new(false),
        })
    }

    fn targets(&self) -> Vec<String> {
        let pushes = self.pushes.lock().unwrap();
        pushes.iter().map(|(target, _)| target.clone()).collect()
    }
}

impl PushTransport for LoopbackTransport {
    fn initiate_push(&self, target: &str, headers: HeaderMap) -> Result<(), PushError> {
        if self.fail.load(Ordering::Relaxed) {
            return Err(PushError::Transport("refused stream".into()));
        }
        self.pushes
            .lock()
            .unwrap()
            .push((target.to_owned(), headers.clone()));

        let ledger = self.ledger.clone();
        let uri: Uri = target
            .parse()
            .map_err(|err: http::uri::InvalidUri| PushError::Transport(err.into()))?;
        tokio::spawn(async move {
            let handle = ledger.handle_for_request(&headers, &uri, None);
            tokio::time::sleep(Duration::from_millis(20)).await;
            if let Some(handle) = handle {
                handle.finish(false).await;
            }
        });
        Ok(())
    }
}

#[derive(Default)]
struct RecordingHints(Mutex<Vec<Vec<HeaderValue>>>);

impl EarlyHints for RecordingHints {
    fn send_early_hints(&self, links: &[HeaderValue]) -> Result<(), EarlyHintsError> {
        self.0.lock().unwrap().push(links.to_vec());
        Ok(())
    }
}

fn request(uri: &str, headers: &[(&str, &str)]) -> request::Parts {
    let mut request = Request::get(uri);
    for &(name, value) in headers {
        request = request.header(name, value);
    }
    request.body(()).unwrap().into_parts().0
}

struct Exchange {
    body: Value,
    headers: HeaderMap,
}

impl Exchange {
    fn links(&self) -> Vec<&str> {
        self.headers
            .get_all(LINK)
            .iter()
            .map(|link| link.to_str().unwrap())
            .collect()
    }

    fn vary(&self) -> Vec<&str> {
        self.headers
            .get_all(VARY)
            .iter()
            .map(|vary| vary.to_str().unwrap())
            .collect()
    }
}

/// Runs one exchange the way a host would, returning the rewritten response.
async fn exchange(
    vulcain: &Vulcain,
    ledger: &Arc<PushLedger>,
    transport: Option<Arc<dyn PushTransport>>,
    request: &request::Parts,
    document: &Value,
) -> Exchange {
    let handle = vulcain.push_handle(ledger, request, transport);
    let mut headers = HeaderMap::new();
    headers.insert("content-type", HeaderValue::from_static("application/json"));
    assert!(vulcain.is_eligible_request(&request.headers, &request.uri));
    assert!(vulcain.is_eligible_response(http::StatusCode::OK, &headers, &request.headers));

    let body = Full::new(Bytes::from(document.to_string()));
    let body = vulcain
        .apply(request, handle.as_ref(), body, &mut headers, None)
        .await
        .unwrap();
    tokio::time::timeout(Duration::from_secs(5), vulcain.finish(handle.as_ref(), true))
        .await
        .unwrap();

    assert_eq!(headers[CONTENT_LENGTH], body.len().to_string().as_str());
    Exchange {
        body: serde_json::from_slice(&body).unwrap(),
        headers,
    }
}

#[tokio::test]
async fn fields_prune_the_document() {
    let vulcain = Vulcain::new(Options::default());
    let ledger = vulcain.new_ledger();
    let transport = LoopbackTransport::new(&ledger);
    let document = json!({"id": 1, "author": "/users/5", "title": "t"});

    let response = exchange(
        &vulcain,
        &ledger,
        Some(transport.clone()),
        &request("/books/1", &[("fields", r#""/title""#)]),
        &document,
    )
    .await;

    assert_eq!(response.body, json!({"title": "t"}));
    assert_eq!(response.vary(), vec!["fields"]);
    assert!(response.links().is_empty());
    assert!(transport.targets().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn preloaded_relations_are_pushed_once() {
    let vulcain = Vulcain::new(Options::default());
    let ledger = vulcain.new_ledger();
    let transport = LoopbackTransport::new(&ledger);
    let document = json!({"author": "/users/5"});
    let request = request("/books/1", &[("preload", r#""/author""#)]);

    let response = exchange(&vulcain, &ledger, Some(transport.clone()), &request, &document).await;
    assert_eq!(response.body, document);
    assert_eq!(response.vary(), vec!["preload"]);
    assert!(response.links().is_empty());
    assert_eq!(transport.targets(), vec!["/users/5"]);

    let pushes = transport.pushes.lock().unwrap();
    let (_, headers) = &pushes[0];
    assert!(headers.contains_key(INTERNAL_REQUEST));
    assert!(!headers.contains_key("preload"));
    drop(pushes);

    // a later request on the same connection finds the relation already pushed
    let response = exchange(&vulcain, &ledger, Some(transport.clone()), &request, &document).await;
    assert!(response.links().is_empty());
    assert_eq!(transport.targets(), vec!["/users/5"]);
    assert_eq!(ledger.live_cycles(), 0);
}

#[tokio::test]
async fn zero_budget_advertises_relations_without_push() {
    let vulcain = Vulcain::new(Options::default().with_max_pushes(Some(0)));
    let ledger = vulcain.new_ledger();
    let transport = LoopbackTransport::new(&ledger);

    let response = exchange(
        &vulcain,
        &ledger,
        Some(transport.clone()),
        &request("/books/1", &[("preload", r#""/author""#)]),
        &json!({"author": "/users/5"}),
    )
    .await;

    assert!(transport.targets().is_empty());
    assert_eq!(
        response.links(),
        vec!["</users/5>; rel=preload; as=fetch; nopush"]
    );
    assert_eq!(response.vary(), vec!["preload"]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn query_directives_rewrite_relations() {
    let vulcain = Vulcain::new(Options::default());
    let ledger = vulcain.new_ledger();
    let transport = LoopbackTransport::new(&ledger);
    let document = json!({
        "title": "t",
        "author": "../users/5",
        "editor": "/users/7",
        "reviews": ["/reviews/1"]
    });

    let response = exchange(
        &vulcain,
        &ledger,
        Some(transport.clone()),
        &request(
            "/books/1?preload=%22%2Fauthor%22%2C%20%22%2Fauthor%2Faddress%22%2C%20%22%2Freviews%2F*%22",
            &[],
        ),
        &document,
    )
    .await;

    assert_eq!(
        response.body,
        json!({
            "title": "t",
            "author": "/users/5?preload=%22%2Faddress%22",
            "editor": "/users/7",
            "reviews": ["/reviews/1"]
        })
    );
    // the pushed URLs are the ones the client will find in the document
    assert_eq!(
        transport.targets(),
        vec!["/users/5?preload=%22%2Faddress%22", "/reviews/1"]
    );
    // query-driven responses do not vary on the fields header
    assert_eq!(response.vary(), vec!["preload"]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn header_directives_leave_relations_untouched() {
    let vulcain = Vulcain::new(Options::default());
    let ledger = vulcain.new_ledger();
    let transport = LoopbackTransport::new(&ledger);
    let document = json!({"author": "../users/5"});

    let response = exchange(
        &vulcain,
        &ledger,
        Some(transport.clone()),
        &request(
            "/books/1",
            &[("preload", r#""/author", "/author/address""#)],
        ),
        &document,
    )
    .await;

    assert_eq!(response.body, document);
    assert_eq!(transport.targets(), vec!["/users/5"]);
    let pushes = transport.pushes.lock().unwrap();
    assert_eq!(pushes[0].1["preload"], r#""/address""#);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_requests_push_shared_relations_once() {
    let vulcain = Arc::new(Vulcain::new(Options::default()));
    let ledger = vulcain.new_ledger();
    let transport = LoopbackTransport::new(&ledger);

    let tasks: Vec<_> = [
        json!({"order": "/orders/1", "customer": "/customers/1"}),
        json!({"order": "/orders/1", "customer": "/customers/2"}),
    ]
    .into_iter()
    .map(|document| {
        let vulcain = vulcain.clone();
        let ledger = ledger.clone();
        let transport: Arc<dyn PushTransport> = transport.clone();
        tokio::spawn(async move {
            let request = request("/invoices/1", &[("preload", r#""/order", "/customer""#)]);
            exchange(&vulcain, &ledger, Some(transport), &request, &document).await
        })
    })
    .collect();

    for task in tasks {
        let response = task.await.unwrap();
        assert!(response.links().is_empty());
    }

    let mut targets = transport.targets();
    targets.sort();
    assert_eq!(targets, vec!["/customers/1", "/customers/2", "/orders/1"]);
    assert_eq!(ledger.pushed_count(), 3);
}

#[tokio::test]
async fn relations_fall_back_to_links() {
    let vulcain = Vulcain::new(Options::default());
    let ledger = vulcain.new_ledger();
    let document = json!({
        "author": "/users/5",
        "coauthor": "/users/5",
        "cdn": "https://cdn.example.com/cover.json",
        "broken": "http://[::1"
    });

    // no push capability: every relation is advertised once, without nopush
    let response = exchange(
        &vulcain,
        &ledger,
        None,
        &request(
            "/books/1",
            &[("preload", r#""/author", "/coauthor", "/cdn", "/broken""#)],
        ),
        &document,
    )
    .await;

    assert_eq!(
        response.links(),
        vec![
            "</users/5>; rel=preload; as=fetch",
            "<https://cdn.example.com/cover.json>; rel=preload; as=fetch; nopush",
        ]
    );
    assert_eq!(response.body, document);
}

#[tokio::test]
async fn failed_pushes_fall_back_to_links() {
    let vulcain = Vulcain::new(Options::default().with_api_url("https://api.example.com"));
    let ledger = vulcain.new_ledger();
    let transport = LoopbackTransport::new(&ledger);
    transport.fail.store(true, Ordering::Relaxed);

    let response = exchange(
        &vulcain,
        &ledger,
        Some(transport.clone()),
        &request("/books/1", &[("preload", r#""/author""#)]),
        &json!({"author": "/users/5"}),
    )
    .await;

    assert_eq!(
        response.links(),
        vec!["<https://api.example.com/users/5>; rel=preload; as=fetch"]
    );
    assert!(!ledger.is_pushed("/users/5"));
}

#[tokio::test]
async fn exhausted_budget_falls_back_to_links() {
    let vulcain = Vulcain::new(Options::default().with_max_pushes(Some(1)));
    let ledger = vulcain.new_ledger();
    let transport = LoopbackTransport::new(&ledger);

    let response = exchange(
        &vulcain,
        &ledger,
        Some(transport.clone()),
        &request("/books/1", &[("preload", r#""/authors/*""#)]),
        &json!({"authors": ["/users/5", "/users/6"]}),
    )
    .await;

    assert_eq!(transport.targets(), vec!["/users/5"]);
    assert_eq!(
        response.links(),
        vec!["</users/6>; rel=preload; as=fetch"]
    );
}

#[tokio::test]
async fn relations_pushed_earlier_need_no_budget() {
    let vulcain = Vulcain::new(Options::default().with_max_pushes(Some(1)));
    let ledger = vulcain.new_ledger();
    let transport = LoopbackTransport::new(&ledger);

    let first = exchange(
        &vulcain,
        &ledger,
        Some(transport.clone()),
        &request("/books/1", &[("preload", r#""/author""#)]),
        &json!({"author": "/users/5"}),
    )
    .await;
    assert!(first.links().is_empty());

    let second = exchange(
        &vulcain,
        &ledger,
        Some(transport.clone()),
        &request("/books/2", &[("preload", r#""/editor", "/author""#)]),
        &json!({"editor": "/users/6", "author": "/users/5"}),
    )
    .await;

    assert_eq!(transport.targets(), vec!["/users/5", "/users/6"]);
    assert!(second.links().is_empty());
}

#[tokio::test]
async fn early_hints_carry_the_links() {
    let vulcain = Vulcain::new(Options::default().with_early_hints(true));
    let hints = RecordingHints::default();
    let request = request("/books/1", &[("preload", r#""/author", "/editor""#)]);
    let mut headers = HeaderMap::new();

    let body = Full::new(Bytes::from(r#"{"author": "/users/5", "editor": "/users/7"}"#));
    vulcain
        .apply(&request, None, body, &mut headers, Some(&hints))
        .await
        .unwrap();

    let sent = hints.0.lock().unwrap();
    assert_eq!(sent.len(), 1);
    assert_eq!(
        sent[0],
        vec![
            HeaderValue::from_static("</users/5>; rel=preload; as=fetch"),
            HeaderValue::from_static("</users/7>; rel=preload; as=fetch"),
        ]
    );
}

#[tokio::test]
async fn early_hints_include_upstream_links() {
    let vulcain = Vulcain::new(Options::default().with_early_hints(true));
    let hints = RecordingHints::default();
    let request = request("/books/1", &[("preload", r#""/author""#)]);
    let mut headers = HeaderMap::new();
    headers.insert(LINK, HeaderValue::from_static("</style.css>; rel=preload; as=style"));

    let body = Full::new(Bytes::from(r#"{"author": "/users/5"}"#));
    vulcain
        .apply(&request, None, body, &mut headers, Some(&hints))
        .await
        .unwrap();

    let sent = hints.0.lock().unwrap();
    assert_eq!(
        *sent,
        vec![vec![
            HeaderValue::from_static("</style.css>; rel=preload; as=style"),
            HeaderValue::from_static("</users/5>; rel=preload; as=fetch"),
        ]]
    );
}

#[tokio::test]
async fn failing_early_hints_do_not_fail_the_response() {
    struct Refused;
    impl EarlyHints for Refused {
        fn send_early_hints(&self, _: &[HeaderValue]) -> Result<(), EarlyHintsError> {
            Err("informational responses unsupported".into())
        }
    }

    let vulcain = Vulcain::new(Options::default().with_early_hints(true));
    let request = request("/books/1", &[("preload", r#""/author""#)]);
    let mut headers = HeaderMap::new();

    let body = Full::new(Bytes::from(r#"{"author": "/users/5"}"#));
    let body = vulcain
        .apply(&request, None, body, &mut headers, Some(&Refused))
        .await
        .unwrap();

    assert_eq!(body, r#"{"author":"/users/5"}"#);
    assert_eq!(headers[LINK], "</users/5>; rel=preload; as=fetch");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn route_lookup_synthesizes_relations() {
    let openapi = OpenApi::from_slice(
        br#"{"paths": {
            "/books/{id}": {"get": {"responses": {"200": {"links": {"author": {
                "operationId": "getUser",
                "parameters": {"userId": "$response.body#/author"}
            }}}}}},
            "/users/{userId}": {"get": {"operationId": "getUser"}}
        }}"#,
    )
    .unwrap();
    let vulcain = Vulcain::new(Options::default()).with_route_lookup(Arc::new(openapi));
    let ledger = vulcain.new_ledger();
    let transport = LoopbackTransport::new(&ledger);
    let document = json!({"author": "5"});

    let response = exchange(
        &vulcain,
        &ledger,
        Some(transport.clone()),
        &request("/books/1?preload=%22%2Fauthor%22", &[]),
        &document,
    )
    .await;

    assert_eq!(transport.targets(), vec!["/users/5"]);
    // synthesized relations never replace the identifier in the document
    assert_eq!(response.body, document);
}

#[tokio::test]
async fn ineligible_exchanges_still_release_their_handle() {
    let vulcain = Vulcain::new(Options::default());
    let ledger = vulcain.new_ledger();
    let transport = LoopbackTransport::new(&ledger);
    let request = request("/books/1", &[]);

    assert!(!vulcain.is_eligible_request(&request.headers, &request.uri));
    let handle = vulcain.push_handle(&ledger, &request, Some(transport));
    assert_eq!(ledger.live_cycles(), 1);
    vulcain.finish(handle.as_ref(), true).await;
    vulcain.finish(handle.as_ref(), true).await;
    assert_eq!(ledger.live_cycles(), 0);
}
