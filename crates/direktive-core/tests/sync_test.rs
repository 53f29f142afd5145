#![allow(clippy::unwrap_used)]

mod common;

use std::time::Duration;

use common::{Harness, MemoryHost, command, id};
use direktive_api::{CloudMessage, ResumeMode};
use direktive_core::{Capabilities, SyncPhase};
use pretty_assertions::assert_eq;
use secrecy::{ExposeSecret, SecretString};

const RESUME_FROM_START: ResumeMode = ResumeMode::Resume { acked_through: 0 };

#[tokio::test]
async fn kitchen_light_round_trip() {
    let host = MemoryHost::with_entities(&["light.kitchen"]);
    let mut h = Harness::new(host);
    h.bridge
        .expose(&id("light.kitchen"), Capabilities::all())
        .await
        .unwrap();
    h.bridge.start().await.unwrap();

    let mut peer = h.next_peer().await;
    peer.handshake(RESUME_FROM_START, vec![]).await;

    // Exposure notice goes out before any record.
    let CloudMessage::EntityExposed { entity_id, capabilities, .. } = peer.recv().await else {
        panic!("expected entity_exposed");
    };
    assert_eq!(entity_id, "light.kitchen");
    assert_eq!(capabilities, vec!["state_read", "command_accept"]);

    h.host.set_state("light.kitchen", "on");
    let (records, _) = peer.records_through(1).await;
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].seq, 1);
    assert_eq!(records[0].entity_id, "light.kitchen");
    assert_eq!(records[0].state, "on");
    peer.ack(1).await;
    h.wait_status(|s| s.last_acked_seq == 1).await;

    peer.send(CloudMessage::Command(command("c1", "light.kitchen", "turn_off")))
        .await;

    let mut result = None;
    let mut records = Vec::new();
    while result.is_none() || records.is_empty() {
        match peer.recv().await {
            CloudMessage::CommandResult(r) => result = Some(r),
            CloudMessage::StateUpdate { records: batch } => records.extend(batch),
            other => panic!("unexpected {}", other.kind()),
        }
    }
    let result = result.unwrap();
    assert_eq!(result.command_id, "c1");
    assert!(result.success);
    assert_eq!(records[0].seq, 2);
    assert_eq!(records[0].state, "off");

    let calls = h.host.calls();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].domain, "light");
    assert_eq!(calls[0].service, "turn_off");
    assert_eq!(h.host.state_of("light.kitchen").as_deref(), Some("off"));

    h.bridge.shutdown().await;
}

#[tokio::test]
async fn lost_acks_are_resent_exactly_once() {
    let host = MemoryHost::with_entities(&["sensor.power"]);
    let mut h = Harness::new(host);
    h.bridge
        .expose(&id("sensor.power"), Capabilities::read_only())
        .await
        .unwrap();
    h.bridge.start().await.unwrap();

    let mut first = h.next_peer().await;
    first.handshake(RESUME_FROM_START, vec![]).await;
    for i in 1..=100 {
        h.host.set_state("sensor.power", &i.to_string());
    }
    let (records, _) = first.records_through(100).await;
    let seqs: Vec<u64> = records.iter().map(|r| r.seq).collect();
    assert_eq!(seqs, (1..=100).collect::<Vec<_>>());

    // Only 1..=40 is acknowledged before the link drops.
    first.ack(40).await;
    h.wait_status(|s| s.last_acked_seq == 40).await;
    drop(first);

    for i in 101..=105 {
        h.host.set_state("sensor.power", &i.to_string());
    }

    let mut second = h.next_peer().await;
    let (_, last_acked) = second
        .handshake(ResumeMode::Resume { acked_through: 40 }, vec![])
        .await;
    assert_eq!(last_acked, 40);

    let (records, others) = second.records_through(105).await;
    let seqs: Vec<u64> = records.iter().map(|r| r.seq).collect();
    assert_eq!(seqs, (41..=105).collect::<Vec<_>>());
    assert!(others.is_empty());
    let states: Vec<&str> = records.iter().map(|r| r.state.as_str()).collect();
    assert_eq!(states.first(), Some(&"41"));
    assert_eq!(states.last(), Some(&"105"));

    // Nothing is sent twice.
    assert!(second.try_recv(Duration::from_millis(200)).await.is_none());

    h.bridge.shutdown().await;
}

#[tokio::test]
async fn unexposed_sensor_never_crosses_the_boundary() {
    let host = MemoryHost::with_entities(&["light.kitchen", "sensor.battery"]);
    let mut h = Harness::new(host);
    h.bridge
        .expose(&id("light.kitchen"), Capabilities::read_only())
        .await
        .unwrap();
    h.bridge.start().await.unwrap();

    let mut peer = h.next_peer().await;
    peer.handshake(RESUME_FROM_START, vec![]).await;

    for i in 0..50 {
        h.host.set_state("sensor.battery", &format!("{i}"));
    }
    h.host.set_state("light.kitchen", "on");

    let (records, _) = peer.records_through(1).await;
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].entity_id, "light.kitchen");
    assert_eq!(h.bridge.status().await.last_assigned_seq, 1);

    // Commands for it are refused too.
    peer.send(CloudMessage::Command(command("c-bat", "sensor.battery", "turn_on")))
        .await;
    let result = peer.command_result().await;
    assert!(!result.success);
    assert_eq!(result.error_kind.as_deref(), Some("not_authorized"));
    assert!(h.host.calls().is_empty());

    h.bridge.shutdown().await;
}

#[tokio::test]
async fn redelivered_command_applies_once() {
    let host = MemoryHost::with_entities(&["switch.fan"]);
    let mut h = Harness::new(host);
    h.bridge
        .expose(&id("switch.fan"), Capabilities::all())
        .await
        .unwrap();
    h.bridge.start().await.unwrap();

    let mut peer = h.next_peer().await;
    peer.handshake(RESUME_FROM_START, vec![]).await;

    const N: usize = 5;
    for _ in 0..N {
        peer.send(CloudMessage::Command(command("c-fan", "switch.fan", "toggle")))
            .await;
    }
    let mut results = Vec::new();
    for _ in 0..N {
        results.push(peer.command_result().await);
    }

    assert!(results.iter().all(|r| r == &results[0]));
    assert!(results[0].success);
    assert_eq!(h.host.calls().len(), 1);
    assert_eq!(h.host.state_of("switch.fan").as_deref(), Some("on"));

    h.bridge.shutdown().await;
}

#[tokio::test]
async fn failed_action_is_reported_not_dropped() {
    let host = MemoryHost::with_entities(&["cover.garage"]);
    host.fail_calls("motor jammed");
    let mut h = Harness::new(host);
    h.bridge
        .expose(&id("cover.garage"), Capabilities::all())
        .await
        .unwrap();
    h.bridge.start().await.unwrap();

    let mut peer = h.next_peer().await;
    peer.handshake(RESUME_FROM_START, vec![]).await;
    peer.send(CloudMessage::Command(command("c-open", "cover.garage", "open")))
        .await;

    let result = peer.command_result().await;
    assert!(!result.success);
    assert_eq!(result.error_kind.as_deref(), Some("action_failed"));
    assert!(result.error_detail.unwrap().contains("motor jammed"));

    h.bridge.shutdown().await;
}

#[tokio::test]
async fn full_resync_rebaselines_current_state() {
    let host = MemoryHost::with_entities(&["light.kitchen", "cover.garage", "switch.fan"]);
    host.set_state("cover.garage", "closed");
    let mut h = Harness::new(host);
    h.bridge
        .expose(&id("light.kitchen"), Capabilities::all())
        .await
        .unwrap();
    h.bridge
        .expose(&id("cover.garage"), Capabilities::read_only())
        .await
        .unwrap();
    h.bridge.start().await.unwrap();

    let mut first = h.next_peer().await;
    first.handshake(RESUME_FROM_START, vec![]).await;
    h.host.set_state("light.kitchen", "on");
    first.records_through(1).await;
    drop(first);

    // The cloud lost its copy: the stale backlog is replaced by a snapshot.
    let mut second = h.next_peer().await;
    second
        .handshake(ResumeMode::FullResync, vec![command("c-pending", "light.kitchen", "turn_off")])
        .await;

    let mut exposed = Vec::new();
    let mut snapshot = Vec::new();
    let mut result = None;
    while exposed.len() < 2 || snapshot.len() < 2 || result.is_none() {
        match second.recv().await {
            CloudMessage::EntityExposed { entity_id, .. } => exposed.push(entity_id),
            CloudMessage::StateUpdate { records } => snapshot.extend(records),
            CloudMessage::CommandResult(r) => result = Some(r),
            other => panic!("unexpected {}", other.kind()),
        }
    }
    // Unconfirmed notices from the first session come round again.
    exposed.sort();
    exposed.dedup();
    assert_eq!(exposed, vec!["cover.garage", "light.kitchen"]);

    let baseline: Vec<(&str, &str)> = snapshot
        .iter()
        .take(2)
        .map(|r| (r.entity_id.as_str(), r.state.as_str()))
        .collect();
    assert!(baseline.contains(&("cover.garage", "closed")));
    assert!(baseline.contains(&("light.kitchen", "on")));
    assert!(snapshot.iter().all(|r| r.seq > 1));

    // Pending command replayed through the normal path.
    assert!(result.unwrap().success);
    assert_eq!(h.host.calls().len(), 1);

    h.bridge.shutdown().await;
}

#[tokio::test]
async fn first_connection_takes_a_baseline() {
    let host = MemoryHost::with_entities(&["light.kitchen"]);
    let store = direktive_core::BridgeStore::open_in_memory().unwrap();
    let mut h = Harness::with_store(host, store, common::test_config());
    h.bridge
        .expose(&id("light.kitchen"), Capabilities::read_only())
        .await
        .unwrap();
    h.bridge.start().await.unwrap();

    let mut peer = h.next_peer().await;
    // The cloud says "resume", but there has never been a baseline.
    peer.handshake(RESUME_FROM_START, vec![]).await;
    let (records, _) = peer.records_through(1).await;
    assert_eq!(records[0].entity_id, "light.kitchen");
    assert_eq!(records[0].state, "off");
    assert!(h.store.baseline_done().unwrap());

    h.bridge.shutdown().await;
}

#[tokio::test]
async fn revoke_sends_unexposed_notice_and_purges() {
    let host = MemoryHost::with_entities(&["light.kitchen"]);
    let mut h = Harness::new(host);
    h.bridge
        .expose(&id("light.kitchen"), Capabilities::all())
        .await
        .unwrap();
    h.bridge.start().await.unwrap();

    let mut peer = h.next_peer().await;
    peer.handshake(RESUME_FROM_START, vec![]).await;
    h.host.set_state("light.kitchen", "on");
    peer.records_through(1).await;

    assert!(h.bridge.revoke(&id("light.kitchen")).await.unwrap());
    loop {
        match peer.recv().await {
            CloudMessage::EntityUnexposed { entity_id } => {
                assert_eq!(entity_id, "light.kitchen");
                break;
            }
            CloudMessage::EntityExposed { .. } => {}
            other => panic!("unexpected {}", other.kind()),
        }
    }
    assert_eq!(h.bridge.status().await.backlog_len, 0);

    h.host.set_state("light.kitchen", "off");
    assert!(peer.try_recv(Duration::from_millis(200)).await.is_none());

    h.bridge.shutdown().await;
}

#[tokio::test]
async fn auth_failure_suspends_until_key_rotation() {
    let host = MemoryHost::with_entities(&["light.kitchen"]);
    let mut h = Harness::new(host);
    h.cloud.reject_auth(true);
    h.bridge.start().await.unwrap();

    let status = h.wait_status(|s| s.phase == SyncPhase::AuthSuspended).await;
    assert!(status.auth_suspended);
    assert!(!status.connected);
    let attempts = h.cloud.connects();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(h.cloud.connects(), attempts);

    h.cloud.reject_auth(false);
    h.bridge
        .credentials()
        .rotate_api_key(SecretString::from("rotated-key"));

    let mut peer = h.next_peer().await;
    assert_eq!(peer.endpoint.api_key.expose_secret(), "rotated-key");
    peer.handshake(RESUME_FROM_START, vec![]).await;
    h.wait_status(|s| s.connected).await;

    h.bridge.shutdown().await;
}

#[tokio::test]
async fn auth_revoked_message_stops_traffic() {
    let host = MemoryHost::with_entities(&["light.kitchen"]);
    let mut h = Harness::new(host);
    h.bridge.start().await.unwrap();

    let mut peer = h.next_peer().await;
    peer.handshake(RESUME_FROM_START, vec![]).await;
    peer.send(CloudMessage::AuthRevoked {
        reason: "key revoked".into(),
    })
    .await;

    h.wait_status(|s| s.auth_suspended).await;
    assert!(h.bridge.credentials().is_revoked());

    h.bridge.shutdown().await;
}

#[tokio::test]
async fn shutdown_is_prompt_and_keeps_backlog() {
    let host = MemoryHost::with_entities(&["light.kitchen"]);
    let mut h = Harness::new(host);
    h.bridge
        .expose(&id("light.kitchen"), Capabilities::read_only())
        .await
        .unwrap();
    h.bridge.start().await.unwrap();

    let mut peer = h.next_peer().await;
    peer.handshake(RESUME_FROM_START, vec![]).await;
    h.host.set_state("light.kitchen", "on");
    peer.records_through(1).await;

    tokio::time::timeout(Duration::from_secs(1), h.bridge.shutdown())
        .await
        .unwrap();
    assert_eq!(h.bridge.status().await.phase, SyncPhase::Idle);

    let summary = h.store.summary().unwrap();
    assert_eq!(summary.backlog_len, 1);
    assert_eq!(summary.cursor.last_acked_seq, 0);
    assert_eq!(summary.exposed_entities, 1);
}

#[tokio::test]
async fn session_token_is_presented_on_reconnect() {
    let host = MemoryHost::with_entities(&["light.kitchen"]);
    let mut h = Harness::new(host);
    h.bridge.start().await.unwrap();

    let mut first = h.next_peer().await;
    assert!(first.endpoint.session_token.is_none());
    first.handshake(RESUME_FROM_START, vec![]).await;
    first
        .send(CloudMessage::Session(direktive_api::protocol::SessionGrant {
            token: "sess-1".into(),
            expires_at: None,
        }))
        .await;
    // Let the grant be processed before the link drops.
    tokio::time::sleep(Duration::from_millis(50)).await;
    drop(first);

    let second = h.next_peer().await;
    assert_eq!(
        second.endpoint.session_token.as_ref().map(|t| t.expose_secret().to_owned()),
        Some("sess-1".to_owned())
    );

    h.bridge.shutdown().await;
}

#[tokio::test]
async fn change_during_resync_snapshot_lands_after_it() {
    let host = MemoryHost::with_entities(&["light.kitchen"]);
    let mut h = Harness::new(host);
    h.bridge
        .expose(&id("light.kitchen"), Capabilities::read_only())
        .await
        .unwrap();
    h.bridge.start().await.unwrap();

    // The snapshot reads "off"; the light turns on before the read returns.
    h.host.change_after_next_read("light.kitchen", "on");
    let mut peer = h.next_peer().await;
    peer.handshake(ResumeMode::FullResync, vec![]).await;

    let (records, _) = peer.records_through(2).await;
    let sent: Vec<(u64, &str)> = records.iter().map(|r| (r.seq, r.state.as_str())).collect();
    assert_eq!(sent, vec![(1, "off"), (2, "on")]);
    assert_eq!(h.host.state_of("light.kitchen").as_deref(), Some("on"));

    h.bridge.shutdown().await;
}

#[tokio::test]
async fn unexposed_notice_survives_a_dropped_session() {
    let host = MemoryHost::with_entities(&["light.kitchen"]);
    let mut h = Harness::new(host);
    h.bridge
        .expose(&id("light.kitchen"), Capabilities::all())
        .await
        .unwrap();
    h.bridge.start().await.unwrap();

    let mut first = h.next_peer().await;
    first.handshake(RESUME_FROM_START, vec![]).await;
    let CloudMessage::EntityExposed { .. } = first.recv().await else {
        panic!("expected entity_exposed");
    };

    // The notice is handed to the session but never read before the link drops.
    assert!(h.bridge.revoke(&id("light.kitchen")).await.unwrap());
    tokio::time::sleep(Duration::from_millis(100)).await;
    drop(first);

    let mut second = h.next_peer().await;
    second.handshake(RESUME_FROM_START, vec![]).await;
    let mut notices = Vec::new();
    loop {
        match second.recv().await {
            CloudMessage::EntityExposed { entity_id, .. } => notices.push(("exposed", entity_id)),
            CloudMessage::EntityUnexposed { entity_id } => {
                notices.push(("unexposed", entity_id));
                break;
            }
            other => panic!("unexpected {}", other.kind()),
        }
    }
    assert_eq!(notices.last().unwrap(), &("unexposed", "light.kitchen".to_owned()));
    assert_eq!(h.store.summary().unwrap().pending_notices, 2);

    h.bridge.shutdown().await;
}

#[tokio::test]
async fn records_in_flight_at_disconnect_are_resent() {
    let host = MemoryHost::with_entities(&["sensor.power"]);
    let mut h = Harness::new(host);
    h.bridge
        .expose(&id("sensor.power"), Capabilities::read_only())
        .await
        .unwrap();
    h.bridge.start().await.unwrap();

    let mut first = h.next_peer().await;
    first.handshake(RESUME_FROM_START, vec![]).await;
    for i in 1..=10 {
        h.host.set_state("sensor.power", &i.to_string());
    }
    tokio::time::timeout(common::WAIT, async {
        while h.bridge.status().await.last_assigned_seq < 10 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    // Notice and records sit unread in the session when it drops.
    drop(first);

    let mut second = h.next_peer().await;
    second.handshake(RESUME_FROM_START, vec![]).await;
    let (records, others) = second.records_through(10).await;
    let seqs: Vec<u64> = records.iter().map(|r| r.seq).collect();
    assert_eq!(seqs, (1..=10).collect::<Vec<_>>());
    assert_eq!(records.last().unwrap().state, "10");
    assert!(matches!(
        others.as_slice(),
        [CloudMessage::EntityExposed { entity_id, .. }] if entity_id == "sensor.power"
    ));

    // An ack for a record that followed the notice confirms it.
    second.ack(10).await;
    h.wait_status(|s| s.last_acked_seq == 10).await;
    assert_eq!(h.store.summary().unwrap().pending_notices, 0);

    h.bridge.shutdown().await;
}

#[tokio::test]
async fn not_connected_until_resume_completes() {
    let host = MemoryHost::with_entities(&["light.kitchen"]);
    let mut h = Harness::new(host);
    h.bridge.start().await.unwrap();

    let mut peer = h.next_peer().await;
    let CloudMessage::ResumeRequest { .. } = peer.recv().await else {
        panic!("expected resume_request first");
    };
    let status = h.bridge.status().await;
    assert_eq!(status.phase, SyncPhase::Connecting);
    assert!(!status.connected);

    peer.send(CloudMessage::ResumeResponse {
        mode: RESUME_FROM_START,
        pending_commands: vec![],
    })
    .await;
    h.wait_status(|s| s.connected && s.phase == SyncPhase::Streaming).await;

    h.bridge.shutdown().await;
}
