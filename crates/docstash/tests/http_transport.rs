use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use docstash::cache::FixedSpaceProbe;
use docstash::{
    ContentCheck, HttpRequest, HttpTransport, RetrievalOrchestrator, RetryPolicy, StashConfig,
    StashError, TtlClass, UreqTransport, UrlTemplate,
};
use tempfile::tempdir;
use tiny_http::{Header, Response, Server, StatusCode};

#[derive(Debug, Clone)]
struct Seen {
    url: String,
    headers: HashMap<String, String>,
}

type Log = Arc<Mutex<Vec<Seen>>>;

/// Serves:
/// - `/records/doc-1`  PDF bytes
/// - `/records/flaky`  503 once, then JSON
/// - `/records/busy`   429 with `Retry-After: 0` once, then JSON
/// - anything else     404
fn spawn_server() -> (String, Log, thread::JoinHandle<()>) {
    let server = Server::http("127.0.0.1:0").expect("http server");
    let base = format!("http://{}", server.server_addr());
    let log: Log = Arc::new(Mutex::new(Vec::new()));
    let log_clone = Arc::clone(&log);

    let handle = thread::spawn(move || {
        let mut hits: HashMap<String, usize> = HashMap::new();
        loop {
            let req = match server.recv_timeout(Duration::from_millis(500)) {
                Ok(Some(req)) => req,
                Ok(None) => break,
                Err(_) => break,
            };
            let url = req.url().to_string();
            let headers = req
                .headers()
                .iter()
                .map(|h| (h.field.as_str().as_str().to_ascii_lowercase(), h.value.as_str().to_string()))
                .collect();
            log_clone.lock().unwrap().push(Seen {
                url: url.clone(),
                headers,
            });
            let count = {
                let n = hits.entry(url.clone()).or_insert(0);
                *n += 1;
                *n
            };

            let _ = match url.as_str() {
                "/records/doc-1" => req.respond(Response::from_data(b"%PDF-1.7\n%fixture".to_vec())),
                "/records/flaky" if count == 1 => req.respond(Response::empty(StatusCode(503))),
                "/records/busy" if count == 1 => req.respond(
                    Response::empty(StatusCode(429))
                        .with_header(Header::from_bytes("Retry-After", "0").expect("header")),
                ),
                "/records/flaky" | "/records/busy" => req.respond(
                    Response::from_data(br#"{"status": "ok"}"#.to_vec()).with_header(
                        Header::from_bytes("Content-Type", "application/json").expect("header"),
                    ),
                ),
                _ => req.respond(Response::empty(StatusCode(404))),
            };
        }
    });

    (base, log, handle)
}

fn config(cache_dir: &std::path::Path) -> StashConfig {
    StashConfig::new(cache_dir)
        .with_retry(RetryPolicy::fast(3))
        .with_default_min_interval(Duration::ZERO)
        .with_min_free_bytes(0)
        .with_user_agent("docstash-tests/1.0 (ops@example.org)")
        .with_api_key("secret-token")
}

fn orchestrator(base: &str, config: StashConfig, check: ContentCheck) -> RetrievalOrchestrator {
    let transport = Box::new(UreqTransport::new(&config));
    let resolver = UrlTemplate::new(format!("{}/records/{{key}}", base))
        .with_ttl_class(TtlClass::Static)
        .with_content_check(check);
    RetrievalOrchestrator::with_parts(
        config,
        Box::new(resolver),
        transport,
        Box::new(FixedSpaceProbe::unlimited()),
    )
    .expect("orchestrator")
}

#[test]
fn fetch_sends_identity_and_keeps_key_out_of_url() {
    let (base, log, handle) = spawn_server();
    let cache = tempdir().expect("cache");
    let mut stash = orchestrator(&base, config(cache.path()), ContentCheck::pdf());

    let first = stash.get_or_fetch("doc-1", false).expect("fetch");
    assert!(first.is_fetched());
    assert!(first.artifact().read().unwrap().starts_with(b"%PDF-"));
    assert!(stash.get_or_fetch("doc-1", false).expect("hit").is_hit());

    drop(stash);
    handle.join().expect("server thread");

    let seen = log.lock().unwrap().clone();
    assert_eq!(seen.len(), 1);
    assert_eq!(
        seen[0].headers.get("user-agent").map(String::as_str),
        Some("docstash-tests/1.0 (ops@example.org)")
    );
    assert_eq!(
        seen[0].headers.get("x-api-key").map(String::as_str),
        Some("secret-token")
    );
    assert!(!seen[0].url.contains("secret-token"));
}

#[test]
fn transient_status_is_retried() {
    let (base, log, handle) = spawn_server();
    let cache = tempdir().expect("cache");
    let mut stash = orchestrator(&base, config(cache.path()), ContentCheck::Json);

    assert!(stash.get_or_fetch("flaky", false).expect("flaky").is_fetched());
    assert!(stash.get_or_fetch("busy", false).expect("busy").is_fetched());

    drop(stash);
    handle.join().expect("server thread");
    assert_eq!(log.lock().unwrap().len(), 4);
}

#[test]
fn not_found_is_not_retried() {
    let (base, log, handle) = spawn_server();
    let cache = tempdir().expect("cache");
    let mut stash = orchestrator(&base, config(cache.path()), ContentCheck::Any);

    let err = stash.get_or_fetch("nope", false).unwrap_err();
    assert!(matches!(
        err,
        StashError::PermanentTransport {
            status: Some(404),
            attempts: 1,
            ..
        }
    ));

    drop(stash);
    handle.join().expect("server thread");
    assert_eq!(log.lock().unwrap().len(), 1);
}

#[test]
fn transport_returns_error_statuses_as_responses() {
    let (base, _log, handle) = spawn_server();
    let transport = UreqTransport::new(&config(std::path::Path::new("/tmp/unused")));

    let response = transport
        .get(&HttpRequest::get(format!("{}/records/busy", base)))
        .expect("response");
    assert_eq!(response.status, 429);
    assert_eq!(response.retry_after, Some(Duration::ZERO));

    let response = transport
        .get(&HttpRequest::get(format!("{}/records/busy", base)))
        .expect("response");
    assert_eq!(response.status, 200);
    assert_eq!(response.content_type.as_deref(), Some("application/json"));

    drop(transport);
    handle.join().expect("server thread");
}

#[test]
fn oversized_body_is_rejected() {
    let (base, _log, handle) = spawn_server();
    let mut config = config(std::path::Path::new("/tmp/unused"));
    config.max_body_bytes = 4;
    let transport = UreqTransport::new(&config);

    let err = transport
        .get(&HttpRequest::get(format!("{}/records/doc-1", base)))
        .unwrap_err();
    assert!(!err.is_retryable());

    drop(transport);
    handle.join().expect("server thread");
}
