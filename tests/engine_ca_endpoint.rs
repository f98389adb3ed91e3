//! End-to-end test against a real loopback listener (spec §10.4): bootstrap
//! an `Engine` with no-op repositories, run it on an ephemeral port, and
//! drive a plain HTTP/1.1 client request through the full accept loop,
//! protocol mux, and modifier pipeline.
//!
//! Exercises spec §8 Scenario 6 ("CA certificate download"): a plain HTTP
//! request for `http://marasi.cert/` is served directly by
//! `transport::dispatch`'s short-circuit, without dialing any upstream --
//! the one end-to-end scenario this crate can drive without a live origin
//! server.

use std::time::Duration;

use marasi::config::EngineConfig;
use marasi::persistence::{
    LaunchpadLink, LaunchpadRepository, LogEntry, LogRepository, Repositories, RequestRecord,
    ResponseRecord, StatsRepository, TrafficRepository,
};
use marasi::{Engine, OpaqueError};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

#[derive(Default, Clone)]
struct NullTraffic;
impl TrafficRepository for NullTraffic {
    async fn insert_request(&self, _record: RequestRecord) -> Result<(), OpaqueError> {
        Ok(())
    }
    async fn insert_response(&self, _record: ResponseRecord) -> Result<(), OpaqueError> {
        Ok(())
    }
}

#[derive(Default, Clone)]
struct NullLaunchpad;
impl LaunchpadRepository for NullLaunchpad {
    async fn link(&self, _link: LaunchpadLink) -> Result<(), OpaqueError> {
        Ok(())
    }
}

#[derive(Default, Clone)]
struct NullLog;
impl LogRepository for NullLog {
    async fn insert(&self, _entry: LogEntry) -> Result<(), OpaqueError> {
        Ok(())
    }
}

#[derive(Default, Clone)]
struct NullStats;
impl StatsRepository for NullStats {
    async fn increment(&self, _counter: &'static str) -> Result<(), OpaqueError> {
        Ok(())
    }
}

#[derive(Default, Clone)]
struct NullRepositories {
    traffic: NullTraffic,
    launchpad: NullLaunchpad,
    log: NullLog,
    stats: NullStats,
}

impl Repositories for NullRepositories {
    type Traffic = NullTraffic;
    type Launchpad = NullLaunchpad;
    type Log = NullLog;
    type Stats = NullStats;

    fn traffic(&self) -> &NullTraffic {
        &self.traffic
    }
    fn launchpad(&self) -> &NullLaunchpad {
        &self.launchpad
    }
    fn log(&self) -> &NullLog {
        &self.log
    }
    fn stats(&self) -> &NullStats {
        &self.stats
    }
}

#[tokio::test]
async fn plain_http_request_for_ca_endpoint_returns_der_without_dialing_upstream() {
    let config_dir = tempfile::tempdir().unwrap();
    let config = EngineConfig {
        listen_addr: "127.0.0.1:0".to_owned(),
        config_dir: config_dir.path().to_path_buf(),
        launchpad_timeout_secs: 30,
        intercept_all: false,
        waypoint_resync_interval_secs: 60,
        extension_config: serde_json::Map::new(),
    };

    let engine = Engine::bootstrap(config, NullRepositories::default())
        .await
        .expect("engine bootstraps");

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let run_handle = tokio::spawn(async move {
        engine.run(listener).await.unwrap();
    });

    // give the accept loop a moment to start selecting on the listener
    tokio::time::sleep(Duration::from_millis(50)).await;

    let mut stream = TcpStream::connect(addr).await.expect("connect to engine");
    stream
        .write_all(b"GET http://marasi.cert/ HTTP/1.1\r\nHost: marasi.cert\r\nConnection: close\r\n\r\n")
        .await
        .unwrap();
    stream.flush().await.unwrap();

    let mut response = Vec::new();
    tokio::time::timeout(Duration::from_secs(5), stream.read_to_end(&mut response))
        .await
        .expect("response within timeout")
        .expect("read response");

    let text = String::from_utf8_lossy(&response);
    assert!(text.starts_with("HTTP/1.1 200"), "unexpected status line: {text}");
    assert!(
        text.contains("application/x-x509-ca-cert"),
        "missing ca-cert content-type: {text}"
    );
    assert!(
        text.contains("marasi-cert.der"),
        "missing content-disposition filename: {text}"
    );

    run_handle.abort();
}
