//! End-to-end tests against a fake fail2ban daemon on a real Unix socket.

use std::sync::Arc;
use std::time::Duration;

use f2b_exporter_core::protocol::{ConnectError, ConnectionState, ExtractError, RequestError};
use f2b_exporter_core::{Exporter, JailSource, StatusClient};
use f2b_exporter_test_utils::FakeDaemon;
use f2b_exporter_test_utils::config::TestConfigBuilder;
use pretty_assertions::assert_eq;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

async fn two_jail_daemon() -> FakeDaemon {
    FakeDaemon::start(vec![
        FakeDaemon::jail("sshd", [3, 10, 1, 4]),
        FakeDaemon::jail("apache", [0, 2, 0, 1]),
    ])
    .await
}

fn client_for(daemon: &FakeDaemon) -> StatusClient {
    StatusClient::from_config(&TestConfigBuilder::new().socket_path(daemon.socket_path()).build())
}

#[tokio::test]
async fn test_get_all_jails_over_unix_socket() {
    let daemon = two_jail_daemon().await;
    let client = client_for(&daemon);

    let jails = client.get_all_jails().await.unwrap();
    assert_eq!(
        jails,
        vec![
            FakeDaemon::jail("sshd", [3, 10, 1, 4]),
            FakeDaemon::jail("apache", [0, 2, 0, 1]),
        ]
    );
    // One socket carries the whole poll.
    assert_eq!(daemon.connections(), 1);
    assert_eq!(daemon.requests(), 3);
}

#[tokio::test]
async fn test_per_chunk_scan_against_daemon() {
    let daemon = two_jail_daemon().await;
    let client = StatusClient::from_config(
        &TestConfigBuilder::new()
            .socket_path(daemon.socket_path())
            .sentinel_scan("per-chunk")
            .build(),
    );
    assert_eq!(client.list_jail_names().await.unwrap(), ["sshd", "apache"]);
}

#[tokio::test]
async fn test_unknown_jail_is_daemon_failure() {
    let daemon = two_jail_daemon().await;
    let client = client_for(&daemon);

    let err = client.get_jail("postfix").await.unwrap_err();
    match err {
        ExtractError::DaemonReportedFailure { code, detail } => {
            assert_eq!(code, 1);
            assert!(detail.contains("postfix"));
        }
        other => panic!("expected daemon failure, got {other:?}"),
    }
}

#[test_log::test(tokio::test)]
async fn test_daemon_restart_yields_retry_then_recovers() {
    let mut daemon = two_jail_daemon().await;
    let client = client_for(&daemon);

    client.list_jail_names().await.unwrap();
    assert_eq!(client.state(), ConnectionState::Connected);

    daemon.restart().await;

    // The first request after the restart finds the old socket dead. It
    // either reconnects and asks for a retry, or (if the probe already saw
    // the dead socket) reconnects up front and succeeds.
    match client.list_jail_names().await {
        Ok(names) => assert_eq!(names, ["sshd", "apache"]),
        Err(ExtractError::Request(RequestError::RetryLater)) => {
            assert_eq!(client.list_jail_names().await.unwrap(), ["sshd", "apache"]);
        }
        Err(other) => panic!("unexpected error after restart: {other:?}"),
    }
    assert_eq!(daemon.connections(), 2);
    assert_eq!(client.state(), ConnectionState::Connected);
}

#[tokio::test]
async fn test_daemon_down_with_attempt_cap() {
    let mut daemon = two_jail_daemon().await;
    daemon.stop().await;

    let client = StatusClient::from_config(
        &TestConfigBuilder::new()
            .socket_path(daemon.socket_path())
            .max_attempts(2)
            .build(),
    );

    let err = client.get_all_jails().await.unwrap_err();
    assert!(
        matches!(
            err,
            ExtractError::Request(RequestError::Connect(ConnectError::Exhausted { attempts: 2 }))
        ),
        "got {err:?}"
    );
    assert_eq!(client.state(), ConnectionState::Disconnected);

    daemon.restart().await;
    assert_eq!(client.get_all_jails().await.unwrap().len(), 2);
}

#[tokio::test]
async fn test_daemon_down_without_cap_keeps_dialing() {
    let mut daemon = two_jail_daemon().await;
    daemon.stop().await;

    let client = StatusClient::from_config(
        &TestConfigBuilder::new()
            .socket_path(daemon.socket_path())
            .connect_wait_ms(100)
            .build(),
    );

    let err = client.list_jail_names().await.unwrap_err();
    assert!(
        matches!(
            err,
            ExtractError::Request(RequestError::Connect(ConnectError::Pending(_)))
        ),
        "got {err:?}"
    );
    assert_eq!(client.state(), ConnectionState::Connecting);

    // The background dial picks the daemon up once it is back.
    daemon.restart().await;
    let mut names = None;
    for _ in 0..50 {
        if let Ok(found) = client.list_jail_names().await {
            names = Some(found);
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(names.unwrap(), ["sshd", "apache"]);
}

#[tokio::test]
async fn test_concurrent_polls_share_one_connection() {
    let daemon = two_jail_daemon().await;
    let client = client_for(&daemon);

    let (a, b, c) = tokio::join!(
        client.get_all_jails(),
        client.get_all_jails(),
        client.get_jail("sshd")
    );
    assert_eq!(a.unwrap().len(), 2);
    assert_eq!(b.unwrap().len(), 2);
    assert_eq!(c.unwrap().total_banned, 4);
    assert_eq!(daemon.connections(), 1);
    assert_eq!(daemon.requests(), 7);
}

#[tokio::test]
async fn test_close_sends_close_command() {
    let daemon = two_jail_daemon().await;
    let client = client_for(&daemon);
    client.list_jail_names().await.unwrap();

    client.close().await;
    client.close().await;

    for _ in 0..50 {
        if daemon.closes() == 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(daemon.closes(), 1);
}

#[tokio::test]
async fn test_exporter_scrape_tracks_daemon_health() {
    let daemon = two_jail_daemon().await;
    let config = TestConfigBuilder::new().socket_path(daemon.socket_path()).build();
    let exporter = Exporter::new(config).unwrap();

    let text = exporter.scrape().await.unwrap();
    assert!(text.contains("fail2ban_up 1"));
    assert!(text.contains(r#"fail2ban_failed_total{jail="sshd"} 10"#));

    daemon.set_failing(true);
    let text = exporter.scrape().await.unwrap();
    assert!(text.contains("fail2ban_up 0"));
    assert!(!text.contains("sshd"));

    daemon.set_failing(false);
    daemon.set_jails(vec![FakeDaemon::jail("postfix", [1, 1, 0, 0])]);
    let text = exporter.scrape().await.unwrap();
    assert!(text.contains("fail2ban_up 1"));
    assert!(text.contains(r#"jail="postfix""#));
    assert!(!text.contains(r#"jail="sshd""#));
}

#[tokio::test]
async fn test_exporter_serves_http_until_shutdown() {
    let daemon = two_jail_daemon().await;
    let config = TestConfigBuilder::new()
        .socket_path(daemon.socket_path())
        .telemetry_path("/scrape")
        .build();
    let client = Arc::new(StatusClient::from_config(&config));
    let exporter = Arc::new(
        Exporter::with_source(config, Arc::clone(&client) as Arc<dyn JailSource>).unwrap(),
    );

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let runner = {
        let exporter = Arc::clone(&exporter);
        tokio::spawn(async move { exporter.run_on(listener).await })
    };

    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream
        .write_all(b"GET /scrape HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n")
        .await
        .unwrap();
    let mut response = String::new();
    stream.read_to_string(&mut response).await.unwrap();
    assert!(response.starts_with("HTTP/1.1 200"));
    assert!(response.contains(r#"fail2ban_banned_current{jail="sshd"} 1"#));
    assert!(response.contains("fail2ban_up 1"));

    exporter.shutdown();
    tokio::time::timeout(Duration::from_secs(5), runner)
        .await
        .unwrap()
        .unwrap()
        .unwrap();

    assert_eq!(client.state(), ConnectionState::Disconnected);
    for _ in 0..50 {
        if daemon.closes() == 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(daemon.closes(), 1);
}
