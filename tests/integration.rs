//! Integration tests for the backplane.

use backplane::{
    Backplane, BackplaneConfig, ChannelTransport, ConnectionInfo, HubLifetimeManager,
    MessageHandle, MsgPackArgsCodec, Target, TopicKey, TransportMessage,
};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio_util::sync::CancellationToken;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(tracing::Level::DEBUG)
        .try_init();
}

async fn start(
    backplane: &Backplane,
) -> (HubLifetimeManager, UnboundedReceiver<TransportMessage>) {
    let (transport, outbox) = ChannelTransport::channel();
    let manager = backplane
        .lifetime_manager("chat", Arc::new(transport))
        .await
        .unwrap();
    (manager, outbox)
}

async fn next(outbox: &mut UnboundedReceiver<TransportMessage>) -> TransportMessage {
    tokio::time::timeout(Duration::from_secs(5), outbox.recv())
        .await
        .expect("timed out waiting for delivery")
        .expect("transport closed")
}

async fn assert_quiet(outbox: &mut UnboundedReceiver<TransportMessage>) {
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(outbox.try_recv().is_err(), "unexpected delivery");
}

// --- Fanout ---

#[tokio::test]
async fn test_all_except_skips_excluded_connection() {
    init_tracing();
    let backplane = Backplane::in_memory(BackplaneConfig::default()).unwrap();
    let (manager, mut outbox) = start(&backplane).await;
    let cancel = CancellationToken::new();

    manager
        .on_connected(ConnectionInfo::new("c1"), &cancel)
        .await
        .unwrap();
    manager
        .on_connected(ConnectionInfo::new("c2"), &cancel)
        .await
        .unwrap();

    manager
        .send(
            &Target::AllExcept(vec!["c1".into()]),
            "announce",
            &[json!("hello")],
            &cancel,
        )
        .await
        .unwrap();

    let message = next(&mut outbox).await;
    assert_eq!(message.connection_id, "c2");
    assert_eq!(message.method, "announce");
    assert_eq!(message.args, vec![json!("hello")]);
    assert_quiet(&mut outbox).await;
}

#[tokio::test]
async fn test_group_send_honours_exclusions() {
    init_tracing();
    let backplane = Backplane::in_memory(BackplaneConfig::default()).unwrap();
    let (manager, mut outbox) = start(&backplane).await;
    let cancel = CancellationToken::new();

    for id in ["c1", "c2", "c3"] {
        manager
            .on_connected(ConnectionInfo::new(id), &cancel)
            .await
            .unwrap();
        manager.add_to_group(id, "lobby", &cancel).await.unwrap();
    }

    let hub = backplane.hub("chat").unwrap();
    hub.send(
        &Target::GroupExcept("lobby".into(), vec!["c2".into()]),
        "say",
        &[json!("hi")],
        &cancel,
    )
    .await
    .unwrap();

    let mut receivers = vec![
        next(&mut outbox).await.connection_id,
        next(&mut outbox).await.connection_id,
    ];
    receivers.sort();
    assert_eq!(receivers, vec!["c1", "c3"]);
    assert_quiet(&mut outbox).await;
}

#[tokio::test]
async fn test_user_send_reaches_every_connection() {
    init_tracing();
    let backplane = Backplane::in_memory(BackplaneConfig::default()).unwrap();
    let (manager, mut outbox) = start(&backplane).await;
    let cancel = CancellationToken::new();

    manager
        .on_connected(ConnectionInfo::new("phone").with_user("alice"), &cancel)
        .await
        .unwrap();
    manager
        .on_connected(ConnectionInfo::new("laptop").with_user("alice"), &cancel)
        .await
        .unwrap();
    manager
        .on_connected(ConnectionInfo::new("desk").with_user("bob"), &cancel)
        .await
        .unwrap();

    manager
        .send(&Target::User("alice".into()), "dm", &[json!(1)], &cancel)
        .await
        .unwrap();

    let mut receivers = vec![
        next(&mut outbox).await.connection_id,
        next(&mut outbox).await.connection_id,
    ];
    receivers.sort();
    assert_eq!(receivers, vec!["laptop", "phone"]);
    assert_quiet(&mut outbox).await;
}

#[tokio::test]
async fn test_msgpack_codec_end_to_end() {
    init_tracing();
    let backplane = Backplane::in_memory(BackplaneConfig::default())
        .unwrap()
        .with_codec(Arc::new(MsgPackArgsCodec));
    let (manager, mut outbox) = start(&backplane).await;
    let cancel = CancellationToken::new();

    manager
        .on_connected(ConnectionInfo::new("c1"), &cancel)
        .await
        .unwrap();
    manager
        .send(
            &Target::Connection("c1".into()),
            "update",
            &[json!({"score": 10}), json!([1, 2])],
            &cancel,
        )
        .await
        .unwrap();

    let message = next(&mut outbox).await;
    assert_eq!(message.args, vec![json!({"score": 10}), json!([1, 2])]);
}

// --- Reconnection ---

#[tokio::test]
async fn test_reconnect_replays_missed_messages() {
    init_tracing();
    let backplane = Backplane::in_memory(BackplaneConfig::default()).unwrap();
    let (manager, mut outbox) = start(&backplane).await;
    let cancel = CancellationToken::new();
    let target = Target::Connection("c1".into());

    manager
        .on_connected(ConnectionInfo::new("c1"), &cancel)
        .await
        .unwrap();
    for i in 0..3 {
        manager.send(&target, "tick", &[json!(i)], &cancel).await.unwrap();
        assert_eq!(next(&mut outbox).await.args, vec![json!(i)]);
    }

    let resume_from = eventually_latest(&manager, "c1", 3).await;
    manager.on_disconnected("c1", &cancel).await.unwrap();

    // Published while the client is away.
    for i in 3..5 {
        manager.send(&target, "tick", &[json!(i)], &cancel).await.unwrap();
    }
    assert_quiet(&mut outbox).await;

    manager
        .on_connected(
            ConnectionInfo::new("c1").resuming_from(resume_from),
            &cancel,
        )
        .await
        .unwrap();
    manager.send(&target, "tick", &[json!(5)], &cancel).await.unwrap();

    for i in 3..6 {
        assert_eq!(next(&mut outbox).await.args, vec![json!(i)]);
    }
    assert_quiet(&mut outbox).await;
}

#[tokio::test]
async fn test_reconnect_past_window_resumes_live_without_replay() {
    init_tracing();
    let config = BackplaneConfig {
        max_rewind: 2,
        ..Default::default()
    };
    let backplane = Backplane::in_memory(config).unwrap();
    let (manager, mut outbox) = start(&backplane).await;
    let cancel = CancellationToken::new();
    let target = Target::Connection("c1".into());

    manager
        .on_connected(ConnectionInfo::new("c1"), &cancel)
        .await
        .unwrap();
    manager.send(&target, "tick", &[json!(0)], &cancel).await.unwrap();
    next(&mut outbox).await;
    let resume_from = eventually_latest(&manager, "c1", 1).await;
    manager.on_disconnected("c1", &cancel).await.unwrap();

    for i in 1..6 {
        manager.send(&target, "tick", &[json!(i)], &cancel).await.unwrap();
    }

    manager
        .on_connected(
            ConnectionInfo::new("c1").resuming_from(resume_from),
            &cancel,
        )
        .await
        .unwrap();
    assert_quiet(&mut outbox).await;

    // The gap is accepted: the resume point jumps to the end of the log.
    assert_eq!(manager.latest_handle("c1").unwrap().sequence, 6);

    manager.send(&target, "tick", &[json!(6)], &cancel).await.unwrap();
    assert_eq!(next(&mut outbox).await.args, vec![json!(6)]);
}

#[tokio::test]
async fn test_stream_survives_topic_restart() {
    init_tracing();
    let backplane = Backplane::in_memory(BackplaneConfig::default()).unwrap();
    let (manager, mut outbox) = start(&backplane).await;
    let cancel = CancellationToken::new();
    let target = Target::Connection("c1".into());
    let key = TopicKey::connection("chat", "c1");

    manager
        .on_connected(ConnectionInfo::new("c1"), &cancel)
        .await
        .unwrap();
    manager.send(&target, "tick", &[json!(0)], &cancel).await.unwrap();
    next(&mut outbox).await;
    let before = eventually_latest(&manager, "c1", 1).await;

    // Forced end: the topic actor goes away and comes back with a new log.
    assert!(backplane.supervisor().deactivate(&key).await.unwrap());
    for _ in 0..200 {
        let stats = backplane.supervisor().stats(&key).await.unwrap();
        if stats.observers == 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    manager.send(&target, "tick", &[json!(1)], &cancel).await.unwrap();
    assert_eq!(next(&mut outbox).await.args, vec![json!(1)]);

    let after = eventually_latest(&manager, "c1", 1).await;
    assert_ne!(after.generation, before.generation);
}

// --- Persistence ---

#[tokio::test]
async fn test_group_membership_survives_restart() {
    init_tracing();
    let dir = TempDir::new().unwrap();
    let cancel = CancellationToken::new();

    {
        let backplane = Backplane::open(BackplaneConfig::default(), dir.path()).unwrap();
        let hub = backplane.hub("chat").unwrap();
        hub.add_to_group("c1", "lobby", &cancel).await.unwrap();
        hub.add_to_group("c2", "lobby", &cancel).await.unwrap();
        backplane.shutdown().await.unwrap();
    }

    let backplane = Backplane::open(BackplaneConfig::default(), dir.path()).unwrap();
    let members = backplane
        .hub("chat")
        .unwrap()
        .group_members("lobby")
        .await
        .unwrap();
    assert_eq!(
        members.into_iter().collect::<Vec<_>>(),
        vec!["c1".to_string(), "c2".to_string()]
    );
}

#[tokio::test]
async fn test_flush_persists_without_shutdown() {
    init_tracing();
    let dir = TempDir::new().unwrap();
    let cancel = CancellationToken::new();

    let backplane = Backplane::open(BackplaneConfig::default(), dir.path()).unwrap();
    let hub = backplane.hub("chat").unwrap();
    hub.add_to_group("c1", "lobby", &cancel).await.unwrap();
    backplane.flush().await.unwrap();

    let records = std::fs::read_dir(dir.path())
        .unwrap()
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.path().extension().is_some_and(|ext| ext == "members"))
        .count();
    assert_eq!(records, 1);
}

/// Wait until the connection's resume point reaches `sequence`.
async fn eventually_latest(
    manager: &HubLifetimeManager,
    connection_id: &str,
    sequence: u64,
) -> MessageHandle {
    for _ in 0..200 {
        if let Some(handle) = manager.latest_handle(connection_id) {
            if handle.sequence == sequence {
                return handle;
            }
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!(
        "latest handle of {connection_id} never reached {sequence}: {:?}",
        manager.latest_handle(connection_id)
    );
}
