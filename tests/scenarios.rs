//! Cross-module scenario tests over the pure cores: conversation ordering,
//! speaker planning, port accounting, and gateway fan-out.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::json;
use tokio::sync::{mpsc, oneshot};

use huddle_server::gateway::{GatewayState, Outbound};
use huddle_server::media::peer::{HandleState, PeerAudioView};
use huddle_server::media::speakers::plan_for_peer;
use huddle_server::services::msgqueue::{Enqueued, MessageQueueManager, QueueTask};
use huddle_server::sidetap::ports::PortPool;
use huddle_server::types::events::Frame;
use huddle_server::types::message::ChatMessage;

fn message(id: &str, job_id: &str, timestamp: i64) -> ChatMessage {
    serde_json::from_value(json!({
        "id": id,
        "jobId": job_id,
        "timestamp": timestamp,
        "encryptedContent": {"body": "AAEC"},
    }))
    .unwrap()
}

fn recorder(order: &Arc<Mutex<Vec<String>>>, id: &str) -> QueueTask {
    let order = Arc::clone(order);
    let id = id.to_string();
    Box::pin(async move {
        order.lock().unwrap().push(id.clone());
        Ok(json!({"success": true, "messageId": id}))
    })
}

// S3: a lower-timestamp message queued behind an in-flight one runs first.
#[tokio::test]
async fn out_of_order_messages_run_in_timestamp_order() {
    let queues = MessageQueueManager::new(Duration::from_secs(300));
    let order = Arc::new(Mutex::new(Vec::new()));

    let (gate_tx, gate_rx) = oneshot::channel::<()>();
    let first: QueueTask = {
        let order = Arc::clone(&order);
        Box::pin(async move {
            let _ = gate_rx.await;
            order.lock().unwrap().push("a".into());
            Ok(json!({"success": true}))
        })
    };

    let queues_a = Arc::clone(&queues);
    let a = tokio::spawn(async move { queues_a.enqueue("j2", "a", 200, first).await });
    tokio::task::yield_now().await;

    let queues_b = Arc::clone(&queues);
    let task_b = recorder(&order, "b");
    let b = tokio::spawn(async move { queues_b.enqueue("j2", "b", 100, task_b).await });
    tokio::task::yield_now().await;

    gate_tx.send(()).unwrap();
    a.await.unwrap();
    b.await.unwrap();

    assert_eq!(*order.lock().unwrap(), vec!["a".to_string(), "b".to_string()]);
    assert_eq!(queues.last_processed_timestamp("j2"), 200);
    queues.destroy().await;
}

// S2 (process-local half): a repeated message id is reported as duplicate
// and its task never runs a second time.
#[tokio::test]
async fn duplicate_send_does_not_rebroadcast() {
    let queues = MessageQueueManager::new(Duration::from_secs(300));
    let order = Arc::new(Mutex::new(Vec::new()));
    let msg = message("m1", "j1", 10);

    match queues
        .enqueue(&msg.job_id, &msg.id, msg.timestamp, recorder(&order, "m1"))
        .await
    {
        Enqueued::Executed(result) => assert!(result.is_ok()),
        Enqueued::Duplicate => panic!("first send must execute"),
    }
    match queues
        .enqueue(&msg.job_id, &msg.id, msg.timestamp, recorder(&order, "m1"))
        .await
    {
        Enqueued::Duplicate => {}
        Enqueued::Executed(_) => panic!("second send must be deduplicated"),
    }

    assert_eq!(order.lock().unwrap().len(), 1);
    queues.destroy().await;
}

// S1 (planning half): after a dominant-speaker flip to ["PB", "PA"], a peer
// owning PB but consuming nothing is told to create a transport for PA only.
#[test]
fn dominant_speaker_flip_requests_only_missing_streams() {
    let speakers = vec!["PB".to_string(), "PA".to_string()];

    let mut peer_b = PeerAudioView {
        socket_id: "sB".into(),
        ..PeerAudioView::default()
    };
    peer_b
        .owned_audio
        .insert("PB".into(), HandleState { open: true, paused: false });

    let plan = plan_for_peer(&peer_b, &speakers, 10);
    assert_eq!(plan.need_transport, vec!["PA".to_string()]);
    assert!(plan.pause_owned.is_empty());
    assert!(plan.pause_consumed.is_empty());
}

// Invariant 7: audio outside the window pauses, video never does.
#[test]
fn reconciliation_never_pauses_video() {
    let speakers: Vec<String> = (0..12).map(|i| format!("p{i}")).collect();
    let mut view = PeerAudioView::default();
    for pid in &speakers {
        view.consumed_audio
            .insert(pid.clone(), HandleState { open: true, paused: false });
        view.video_for_audio
            .insert(pid.clone(), HandleState { open: true, paused: false });
    }

    let plan = plan_for_peer(&view, &speakers, 10);
    assert_eq!(plan.pause_consumed.len(), 2);
    assert!(plan.resume_video.is_empty(), "unpaused video stays untouched");
}

// Invariant 5: a stopped tap returns exactly its port pair to the pool.
#[test]
fn port_pairs_return_on_release() {
    let pool = PortPool::new(61880, 61890);
    let before = pool.available();

    let first = pool.allocate().unwrap();
    let second = pool.allocate().unwrap();
    assert_eq!(first.rtcp, first.rtp + 1);
    assert_eq!(second.rtcp, second.rtp + 1);
    assert_eq!(pool.available(), before - 4);

    pool.release(first);
    pool.release(second);
    assert_eq!(pool.available(), before);
}

// Chat fan-out reaches every subscriber of the conversation room except the
// excluded sender, exactly once each.
#[tokio::test]
async fn room_broadcast_reaches_each_member_once() {
    let gateway = GatewayState::new();
    let mut receivers = Vec::new();
    for socket in ["s1", "s2", "s3"] {
        let (tx, rx) = mpsc::unbounded_channel();
        gateway.register(&socket.to_string(), tx);
        gateway.join_room("j1", &socket.to_string());
        receivers.push((socket, rx));
    }

    let frame = Frame::event("contract:message.new", json!({"id": "m1"}));
    gateway.broadcast_to_room("j1", frame, Some(&"s1".to_string()));

    for (socket, rx) in receivers.iter_mut() {
        let mut seen = 0;
        while let Ok(outbound) = rx.try_recv() {
            if matches!(outbound, Outbound::Frame(_)) {
                seen += 1;
            }
        }
        let expected = if *socket == "s1" { 0 } else { 1 };
        assert_eq!(seen, expected, "socket {socket}");
    }
}
