//! Integration tests for leasehold-etcd against a canned JSON gateway

use leasehold_etcd::{EtcdConfig, EtcdStore};
use leasehold_store::{CreateOutcome, LeaseId, LeaseStore, StoreError};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;

/// A route answered with a fixed status and body.
#[derive(Clone)]
struct Route {
    path: &'static str,
    status: u16,
    body: String,
}

fn route(path: &'static str, status: u16, body: &str) -> Route {
    Route {
        path,
        status,
        body: body.to_string(),
    }
}

/// Read one HTTP/1.1 request and return its path and body.
async fn read_request(socket: &mut TcpStream) -> (String, String) {
    let mut buffer = Vec::new();
    let mut chunk = [0u8; 4096];

    let header_end = loop {
        let n = socket.read(&mut chunk).await.unwrap();
        assert!(n > 0, "client closed before sending headers");
        buffer.extend_from_slice(&chunk[..n]);
        if let Some(pos) = buffer.windows(4).position(|w| w == b"\r\n\r\n") {
            break pos + 4;
        }
    };

    let head = String::from_utf8_lossy(&buffer[..header_end]).to_string();
    let path = head.split_whitespace().nth(1).unwrap_or_default().to_string();
    let length: usize = head
        .lines()
        .find_map(|line| {
            let (name, value) = line.split_once(':')?;
            name.eq_ignore_ascii_case("content-length")
                .then(|| value.trim().parse().ok())
                .flatten()
        })
        .unwrap_or(0);

    while buffer.len() < header_end + length {
        let n = socket.read(&mut chunk).await.unwrap();
        assert!(n > 0, "client closed before sending body");
        buffer.extend_from_slice(&chunk[..n]);
    }

    let body = String::from_utf8_lossy(&buffer[header_end..header_end + length]).to_string();
    (path, body)
}

/// Serve `routes` on a local port. Every request is reported on the returned channel.
async fn gateway(routes: Vec<Route>) -> (String, mpsc::UnboundedReceiver<(String, String)>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let address = format!("http://{}", listener.local_addr().unwrap());
    let (tx, rx) = mpsc::unbounded_channel();

    tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            let routes = routes.clone();
            let tx = tx.clone();
            tokio::spawn(async move {
                let (path, body) = read_request(&mut socket).await;
                let (status, reply) = routes
                    .iter()
                    .find(|r| r.path == path)
                    .map(|r| (r.status, r.body.clone()))
                    .unwrap_or((404, String::new()));
                let _ = tx.send((path, body));

                let response = format!(
                    "HTTP/1.1 {} Gateway\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                    status,
                    reply.len(),
                    reply
                );
                let _ = socket.write_all(response.as_bytes()).await;
                let _ = socket.shutdown().await;
            });
        }
    });

    (address, rx)
}

fn store(endpoints: Vec<String>) -> EtcdStore {
    EtcdStore::new(
        EtcdConfig::builder()
            .endpoints(endpoints)
            .request_timeout(Duration::from_secs(2))
            .connect_timeout(Duration::from_secs(1))
            .build(),
    )
    .unwrap()
}

// "/locks/a" and "worker-1" in base64
const KEY_B64: &str = "L2xvY2tzL2E=";
const HOLDER_B64: &str = "d29ya2VyLTE=";

#[tokio::test]
async fn test_grant_lease_parses_string_integers() {
    let (address, _requests) = gateway(vec![route(
        "/v3/lease/grant",
        200,
        r#"{"header":{"revision":"5"},"ID":"7587862","TTL":"10"}"#,
    )])
    .await;

    let grant = store(vec![address]).grant_lease(10).await.unwrap();
    assert_eq!(grant.id, LeaseId::new(7587862));
    assert_eq!(grant.ttl, 10);
}

#[tokio::test]
async fn test_create_if_absent_sends_guarded_txn() {
    let (address, mut requests) = gateway(vec![route(
        "/v3/kv/txn",
        200,
        r#"{"header":{"revision":"42"},"succeeded":true,"responses":[{"response_put":{"header":{"revision":"42"}}}]}"#,
    )])
    .await;

    let outcome = store(vec![address])
        .create_if_absent("/locks/a", "worker-1", LeaseId::new(99))
        .await
        .unwrap();
    assert_eq!(outcome, CreateOutcome::Created { revision: 42 });

    let (path, body) = requests.recv().await.unwrap();
    assert_eq!(path, "/v3/kv/txn");
    let body: serde_json::Value = serde_json::from_str(&body).unwrap();
    assert_eq!(body["compare"][0]["target"], "CREATE");
    assert_eq!(body["compare"][0]["key"], KEY_B64);
    assert_eq!(body["success"][0]["request_put"]["value"], HOLDER_B64);
    assert_eq!(body["success"][0]["request_put"]["lease"], "99");
}

#[tokio::test]
async fn test_create_if_absent_reports_current_holder() {
    let reply = format!(
        r#"{{"header":{{"revision":"50"}},"responses":[{{"response_range":{{"header":{{}},"kvs":[{{"key":"{}","create_revision":"42","mod_revision":"42","version":"1","value":"{}","lease":"77"}}],"count":"1"}}}}]}}"#,
        KEY_B64, HOLDER_B64
    );
    let (address, _requests) = gateway(vec![route("/v3/kv/txn", 200, &reply)]).await;

    let outcome = store(vec![address])
        .create_if_absent("/locks/a", "worker-2", LeaseId::new(99))
        .await
        .unwrap();

    match outcome {
        CreateOutcome::Exists { current, revision } => {
            assert_eq!(revision, 50);
            assert_eq!(current.key, "/locks/a");
            assert_eq!(current.value, "worker-1");
            assert_eq!(current.create_revision, 42);
            assert_eq!(current.lease, Some(LeaseId::new(77)));
        }
        other => panic!("unexpected outcome {:?}", other),
    }
}

#[tokio::test]
async fn test_keep_alive_results() {
    let (alive, _requests) = gateway(vec![route(
        "/v3/lease/keepalive",
        200,
        "{\"result\":{\"header\":{\"revision\":\"3\"},\"ID\":\"99\",\"TTL\":\"10\"}}\n",
    )])
    .await;
    assert_eq!(tokio_test::assert_ok!(store(vec![alive]).keep_alive(LeaseId::new(99)).await), 10);

    // etcd answers an expired lease with a frame that carries no TTL
    let (expired, _requests) = gateway(vec![route(
        "/v3/lease/keepalive",
        200,
        "{\"result\":{\"header\":{\"revision\":\"3\"},\"ID\":\"99\"}}\n",
    )])
    .await;
    let err = tokio_test::assert_err!(store(vec![expired]).keep_alive(LeaseId::new(99)).await);
    assert!(err.is_lease_not_found());
}

#[tokio::test]
async fn test_revoke_of_unknown_lease_succeeds() {
    let (address, _requests) = gateway(vec![route(
        "/v3/lease/revoke",
        404,
        r#"{"error":"etcdserver: requested lease not found","code":5,"message":"etcdserver: requested lease not found"}"#,
    )])
    .await;

    tokio_test::assert_ok!(store(vec![address]).revoke_lease(LeaseId::new(99)).await);
}

#[tokio::test]
async fn test_server_errors_are_retryable() {
    let (address, _requests) = gateway(vec![route(
        "/v3/kv/range",
        503,
        r#"{"error":"etcdserver: no leader","code":14,"message":"etcdserver: no leader"}"#,
    )])
    .await;

    let err = tokio_test::assert_err!(store(vec![address]).get("/locks/a").await);
    assert!(matches!(err, StoreError::Unavailable(_)));
    assert!(err.is_retryable());
}

#[tokio::test]
async fn test_watch_delivers_delete() {
    let stream = format!(
        "{{\"result\":{{\"header\":{{\"revision\":\"50\"}},\"created\":true}}}}\n{{\"result\":{{\"header\":{{\"revision\":\"51\"}},\"events\":[{{\"type\":\"DELETE\",\"kv\":{{\"key\":\"{}\",\"mod_revision\":\"51\"}}}}]}}}}\n",
        KEY_B64
    );
    let (address, mut requests) = gateway(vec![route("/v3/watch", 200, &stream)]).await;

    let mut watcher = store(vec![address]).watch("/locks/a", 51).await.unwrap();
    let event = watcher.next_delete().await.unwrap();
    assert_eq!(event.key, "/locks/a");
    assert_eq!(event.revision, 51);
    assert!(event.lease.is_none());

    let (_, body) = requests.recv().await.unwrap();
    let body: serde_json::Value = serde_json::from_str(&body).unwrap();
    assert_eq!(body["create_request"]["key"], KEY_B64);
    assert_eq!(body["create_request"]["start_revision"], "51");
}

#[tokio::test]
async fn test_fails_over_to_next_endpoint() {
    let (address, _requests) = gateway(vec![route(
        "/v3/lease/grant",
        200,
        r#"{"ID":"1","TTL":"5"}"#,
    )])
    .await;

    let etcd = store(vec!["http://127.0.0.1:9".to_string(), address.clone()]);
    let grant = etcd.grant_lease(5).await.unwrap();

    assert_eq!(grant.id, LeaseId::new(1));
    assert_eq!(etcd.current_endpoint(), address);
}
