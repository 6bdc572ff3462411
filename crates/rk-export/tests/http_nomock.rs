//! Uploader over the real HTTP transport, talking to a local collector.

use std::collections::BTreeMap;
use std::io::Read;
use std::net::TcpListener;
use std::sync::mpsc;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use rk_cache::FsKeyValueStore;
use rk_common::{system_clock, ManualClock};
use rk_export::{
    BlobStore, FsBlobStore, HttpTransport, HttpTransportConfig, RetryingUploader, UploaderConfig,
};
use tempfile::TempDir;

struct Received {
    body: String,
    headers: BTreeMap<String, String>,
}

/// Answer `count` requests with `status`, forwarding what was received.
fn collector(status: u16, count: usize) -> (String, mpsc::Receiver<Received>) {
    let server = tiny_http::Server::http("127.0.0.1:0").unwrap();
    let port = server.server_addr().to_ip().unwrap().port();
    let (tx, rx) = mpsc::channel();
    thread::spawn(move || {
        for _ in 0..count {
            let Ok(mut request) = server.recv() else { return };
            let mut body = String::new();
            request.as_reader().read_to_string(&mut body).unwrap();
            let headers = request
                .headers()
                .iter()
                .map(|h| {
                    (
                        h.field.as_str().as_str().to_ascii_lowercase(),
                        h.value.as_str().to_string(),
                    )
                })
                .collect();
            let _ = tx.send(Received { body, headers });
            let _ = request.respond(tiny_http::Response::from_string("ok").with_status_code(status));
        }
    });
    (format!("http://127.0.0.1:{port}/v1/logs"), rx)
}

fn wait_until(mut done: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(10);
    while Instant::now() < deadline {
        if done() {
            return true;
        }
        thread::sleep(Duration::from_millis(20));
    }
    false
}

fn uploader_at(
    dir: &TempDir,
    endpoint: &str,
    clock: rk_common::SharedClock,
) -> (RetryingUploader, Arc<FsBlobStore>) {
    let blobs = Arc::new(FsBlobStore::open(dir.path().join("uploads")).unwrap());
    let state = Arc::new(FsKeyValueStore::open(dir.path().join("state")).unwrap());
    let transport = Arc::new(
        HttpTransport::start(blobs.clone(), clock.clone(), HttpTransportConfig::default()).unwrap(),
    );
    let mut config = UploaderConfig::new(endpoint);
    config.request_timeout = Duration::from_secs(5);
    config
        .headers
        .insert("x-rumkit-token".to_string(), "secret".to_string());
    let uploader = RetryingUploader::new(config, blobs.clone(), state, transport, clock).unwrap();
    (uploader, blobs)
}

#[test]
fn delivered_upload_is_removed_from_disk() {
    let dir = TempDir::new().unwrap();
    let (endpoint, received) = collector(200, 1);
    let (uploader, blobs) = uploader_at(&dir, &endpoint, system_clock());

    let id = uploader
        .upload(br#"{"name":"session.start"}"#, BTreeMap::new())
        .unwrap();

    let request = received.recv_timeout(Duration::from_secs(10)).unwrap();
    assert_eq!(request.body, r#"{"name":"session.start"}"#);
    assert_eq!(
        request.headers.get("x-rumkit-token").map(String::as_str),
        Some("secret")
    );
    assert_eq!(
        request.headers.get("content-type").map(String::as_str),
        Some("application/json")
    );
    assert!(request
        .headers
        .get("user-agent")
        .is_some_and(|ua| ua.starts_with("rumkit/")));

    assert!(wait_until(|| !blobs.exists(&id.to_string()).unwrap()));
    assert!(wait_until(|| uploader.pending().is_empty()));
    assert_eq!(uploader.stats().unwrap().count, 0);
}

#[test]
fn rejected_upload_is_not_retried() {
    let dir = TempDir::new().unwrap();
    let (endpoint, received) = collector(500, 1);
    let (uploader, blobs) = uploader_at(&dir, &endpoint, system_clock());

    let id = uploader.upload(b"{}", BTreeMap::new()).unwrap();
    received.recv_timeout(Duration::from_secs(10)).unwrap();

    assert!(wait_until(|| !blobs.exists(&id.to_string()).unwrap()));
    assert!(wait_until(|| uploader.pending().is_empty()));
}

#[test]
fn unreachable_collector_reschedules_with_backoff() {
    // Reserve a port, then close it so connections are refused.
    let port = {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    };
    let endpoint = format!("http://127.0.0.1:{port}/v1/logs");

    let dir = TempDir::new().unwrap();
    let clock = ManualClock::starting_now();
    let start = rk_common::Clock::now(&clock);
    let (uploader, blobs) = uploader_at(&dir, &endpoint, Arc::new(clock));

    let id = uploader.upload(b"{}", BTreeMap::new()).unwrap();

    assert!(wait_until(|| uploader
        .pending()
        .first()
        .is_some_and(|p| p.sent_count == 2)));
    let pending = uploader.pending();
    assert_eq!(pending[0].scheduled_at, start + chrono::Duration::minutes(1));
    assert!(blobs.exists(&id.to_string()).unwrap());
}

#[test]
fn uploads_survive_restart() {
    let dir = TempDir::new().unwrap();
    let (endpoint, received) = collector(200, 1);

    // A blob left behind by a run that was killed before indexing it.
    let id = "5f0c6a9e-2b7d-4e1f-8c3a-9d4e5f6a7b8c".to_string();
    FsBlobStore::open(dir.path().join("uploads"))
        .unwrap()
        .write(&id, b"left over")
        .unwrap();

    // Next run: recovery finds the blob and delivers it.
    let (uploader, blobs) = uploader_at(&dir, &endpoint, system_clock());
    let report = uploader.recover_stalled(chrono::Utc::now()).unwrap();
    assert_eq!(report.created, 1);

    let request = received.recv_timeout(Duration::from_secs(10)).unwrap();
    assert_eq!(request.body, "left over");
    assert!(wait_until(|| !blobs.exists(&id).unwrap()));
}
