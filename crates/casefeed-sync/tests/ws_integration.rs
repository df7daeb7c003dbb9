use casefeed_sync::{
    BackoffConfig, ConnectionState, SyncConfig, TimelineSync, ViewPredicate, WsTransport,
};
use futures_util::{SinkExt, StreamExt};
use serde_json::json;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_tungstenite::tungstenite::Message;
use url::Url;

#[derive(Default)]
struct ServerStats {
    connections: AtomicUsize,
    pings: AtomicUsize,
}

fn event(id: &str, kind: &str, case_id: &str) -> Message {
    Message::Text(
        json!({
            "id": id,
            "type": kind,
            "message": format!("{kind} for {case_id}"),
            "case_id": case_id,
            "timestamp": "2026-02-07T21:00:00",
            "data": {"source": "test"},
        })
        .to_string(),
    )
}

/// First connection: welcome, two events around a malformed one, then close
/// after the first heartbeat. Later connections: one more event, then answer
/// heartbeats until the client leaves.
async fn serve(listener: TcpListener, stats: Arc<ServerStats>) {
    loop {
        let Ok((stream, _)) = listener.accept().await else {
            return;
        };
        let index = stats.connections.fetch_add(1, Ordering::SeqCst);
        let stats = stats.clone();
        tokio::spawn(async move {
            let Ok(mut ws) = tokio_tungstenite::accept_async(stream).await else {
                return;
            };
            if index == 0 {
                let _ = ws
                    .send(Message::Text(
                        json!({"type": "system_message", "message": "Connected"}).to_string(),
                    ))
                    .await;
                let _ = ws.send(event("e1", "case_created", "TW-1")).await;
                let _ = ws.send(Message::Text("{not json".to_string())).await;
                let _ = ws.send(event("e2", "run_failed", "TW-2")).await;
            } else {
                let _ = ws.send(event("e1", "case_created", "TW-1")).await;
                let _ = ws.send(event("e3", "case_closed", "TW-1")).await;
            }
            while let Some(Ok(message)) = ws.next().await {
                if let Message::Text(text) = message {
                    if text == "ping" {
                        stats.pings.fetch_add(1, Ordering::SeqCst);
                        if index == 0 {
                            let _ = ws.close(None).await;
                            return;
                        }
                        let _ = ws.send(Message::Text("pong".to_string())).await;
                    }
                }
            }
        });
    }
}

async fn wait_until(mut predicate: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    while !predicate() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "condition not reached in time"
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn websocket_session_feeds_the_store_and_reconnects() {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    let stats = Arc::new(ServerStats::default());
    tokio::spawn(serve(listener, stats.clone()));

    let url = Url::parse(&format!("ws://{addr}/ws/timeline")).expect("url");
    let config = SyncConfig {
        url: url.clone(),
        heartbeat_interval: Duration::from_millis(200),
        backoff: BackoffConfig {
            base: Duration::from_millis(50),
            cap: Duration::from_millis(200),
            jitter: 0.0,
        },
        ..SyncConfig::default()
    };
    let sync = TimelineSync::init(config, WsTransport::new(url)).expect("init");
    let case_view = sync.view(ViewPredicate::Case("TW-1".to_string()));

    let interest = sync.acquire();
    wait_until(|| sync.store().len() >= 3).await;
    let ids: Vec<String> = sync
        .store()
        .snapshot()
        .events()
        .iter()
        .map(|event| event.id.clone())
        .collect();
    assert_eq!(ids[1..3], ["e1".to_string(), "e2".to_string()]);

    // first session closes on its first heartbeat, the second redelivers e1
    wait_until(|| sync.store().len() == 4).await;
    wait_until(|| sync.connection_state() == ConnectionState::Open).await;
    assert_eq!(stats.connections.load(Ordering::SeqCst), 2);

    let ids: Vec<String> = case_view
        .current()
        .events()
        .iter()
        .map(|event| event.id.clone())
        .collect();
    assert_eq!(ids, vec!["e1".to_string(), "e3".to_string()]);
    let data = sync.store().snapshot().latest().and_then(|event| event.data.clone());
    assert_eq!(data, Some(json!({"source": "test"})));

    // the second session stays up on pongs
    wait_until(|| stats.pings.load(Ordering::SeqCst) >= 4).await;
    assert_eq!(stats.connections.load(Ordering::SeqCst), 2);
    assert!(sync.store().is_connected());

    drop(interest);
    sync.shutdown().await;
    assert_eq!(sync.connection_state(), ConnectionState::Idle);
    assert!(!sync.store().is_connected());
    assert_eq!(sync.store().len(), 4);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn unreachable_server_keeps_retrying_until_released() {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    drop(listener);

    let url = Url::parse(&format!("ws://{addr}/ws/timeline")).expect("url");
    let config = SyncConfig {
        url: url.clone(),
        backoff: BackoffConfig {
            base: Duration::from_millis(20),
            cap: Duration::from_millis(40),
            jitter: 0.0,
        },
        ..SyncConfig::default()
    };
    let sync = TimelineSync::init(config, WsTransport::new(url)).expect("init");
    let interest = sync.acquire();
    wait_until(|| sync.connection_state() == ConnectionState::Reconnecting).await;
    assert!(!sync.store().is_connected());

    drop(interest);
    sync.shutdown().await;
    assert_eq!(sync.connection_state(), ConnectionState::Idle);
    assert!(!sync.is_running());
}
