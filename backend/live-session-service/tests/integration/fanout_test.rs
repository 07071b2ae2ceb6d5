use chrono::Utc;
use live_session_service::models::{
    Actor, ModerationAction, SessionConfig, SessionState, ViewerIdentity,
};
use live_session_service::services::hub::RelayOutcome;
use live_session_service::websocket::message_types::{
    ControlEvent, NegotiationPayload, SignalKind, WsInboundEvent, WsOutboundEvent,
};
use live_session_service::AppError;
use uuid::Uuid;

use super::support::{control_events, harness, harness_with};

#[tokio::test]
async fn broadcaster_departure_reaches_every_viewer_and_ends_the_session() {
    let h = harness();
    let (broadcaster, session_id) = h.live_session(SessionConfig::public()).await;
    let host = h.admit(session_id, ViewerIdentity::User(broadcaster)).await;

    let mut viewers = Vec::new();
    for _ in 0..50 {
        viewers.push(h.admit(session_id, ViewerIdentity::User(Uuid::new_v4())).await);
    }
    assert_eq!(h.coordinator.hub().viewer_count(session_id), 50);

    h.coordinator
        .remove_connection(session_id, host.connection.connection_id)
        .await
        .unwrap();

    for viewer in &viewers {
        let controls = control_events(&viewer.queue.try_drain());
        assert!(controls.contains(&ControlEvent::BroadcasterLeft));
        assert!(controls
            .iter()
            .any(|c| matches!(c, ControlEvent::SessionEnded { .. })));
        assert!(viewer.queue.is_closed());
    }

    let view = h.view(session_id).await;
    assert_eq!(view.session.state, SessionState::Ended);
    assert_eq!(
        view.session.fault_reason.as_deref(),
        Some("broadcaster disconnected")
    );
    assert_eq!(view.viewer_count, 0);

    let metrics = h.coordinator.session_metrics(session_id).await.unwrap();
    assert!(metrics.is_final());
    assert_eq!(metrics.peak_concurrent_viewers, 50);
    assert_eq!(metrics.unique_viewers, 50);

    // Removing an already detached viewer changes nothing
    assert!(h
        .coordinator
        .remove_connection(session_id, viewers[0].connection.connection_id)
        .await
        .is_none());
    assert_eq!(h.coordinator.session_metrics(session_id).await.unwrap(), metrics);
}

#[tokio::test]
async fn saturated_viewer_still_receives_control_frames() {
    let h = harness_with(&[("OUTBOUND_QUEUE_CAPACITY", "8")]);
    let (broadcaster, session_id) = h.live_session(SessionConfig::public()).await;
    let host = h.admit(session_id, ViewerIdentity::User(broadcaster)).await;
    let slow = h
        .admit(session_id, ViewerIdentity::Anonymous("slow-reader".into()))
        .await;

    for i in 0..20 {
        h.coordinator
            .publish_chat(session_id, &ViewerIdentity::User(broadcaster), &format!("line {i}"))
            .await
            .unwrap();
    }
    assert!(slow.queue.dropped_count() > 0);

    h.coordinator
        .remove_connection(session_id, host.connection.connection_id)
        .await;

    let frames = slow.queue.try_drain();
    let controls = control_events(&frames);
    assert!(controls.contains(&ControlEvent::BroadcasterLeft));
    assert!(controls
        .iter()
        .any(|c| matches!(c, ControlEvent::SessionEnded { .. })));

    // Whatever chat survived is still in sequence order
    let sequences: Vec<u64> = frames
        .iter()
        .filter_map(|f| match f.as_ref() {
            WsOutboundEvent::Chat { message } => Some(message.sequence),
            _ => None,
        })
        .collect();
    assert!(sequences.windows(2).all(|w| w[0] < w[1]));
    assert_eq!(sequences.last().copied(), Some(20));
}

#[tokio::test]
async fn chat_is_sequenced_without_gaps_and_every_viewer_sees_the_same_order() {
    let h = harness();
    let (broadcaster, session_id) = h.live_session(SessionConfig::public()).await;
    let a = h.admit(session_id, ViewerIdentity::User(Uuid::new_v4())).await;
    let b = h.admit(session_id, ViewerIdentity::User(Uuid::new_v4())).await;

    let mut tasks = Vec::new();
    for i in 0..10 {
        let coordinator = h.coordinator.clone();
        let sender = if i % 2 == 0 {
            a.connection.identity.clone()
        } else {
            ViewerIdentity::User(broadcaster)
        };
        tasks.push(tokio::spawn(async move {
            coordinator
                .publish_chat(session_id, &sender, &format!("msg {i}"))
                .await
                .unwrap()
        }));
    }
    let mut sequences = Vec::new();
    for task in tasks {
        sequences.push(task.await.unwrap().sequence);
    }
    sequences.sort_unstable();
    assert_eq!(sequences, (1..=10).collect::<Vec<u64>>());

    let seen = |frames: Vec<std::sync::Arc<WsOutboundEvent>>| -> Vec<Uuid> {
        frames
            .iter()
            .filter_map(|f| match f.as_ref() {
                WsOutboundEvent::Chat { message } => Some(message.id),
                _ => None,
            })
            .collect()
    };
    let seen_by_a = seen(a.queue.try_drain());
    let seen_by_b = seen(b.queue.try_drain());
    assert_eq!(seen_by_a.len(), 10);
    assert_eq!(seen_by_a, seen_by_b);

    let history = h.coordinator.recent_messages(session_id, 3).await.unwrap();
    assert_eq!(
        history.iter().map(|m| m.sequence).collect::<Vec<_>>(),
        vec![8, 9, 10]
    );
}

#[tokio::test]
async fn welcome_frame_marks_where_live_chat_begins() {
    let h = harness();
    let (broadcaster, session_id) = h.live_session(SessionConfig::public()).await;
    for body in ["one", "two"] {
        h.coordinator
            .publish_chat(session_id, &ViewerIdentity::User(broadcaster), body)
            .await
            .unwrap();
    }

    let late = h.admit(session_id, ViewerIdentity::Anonymous("late".into())).await;
    h.coordinator
        .publish_chat(session_id, &ViewerIdentity::User(broadcaster), "three")
        .await
        .unwrap();

    let frames = late.queue.try_drain();
    match frames.first().map(|f| f.as_ref()) {
        Some(WsOutboundEvent::Welcome { last_sequence, .. }) => assert_eq!(*last_sequence, 2),
        other => panic!("expected welcome first, got {other:?}"),
    }
    let first_chat = frames.iter().find_map(|f| match f.as_ref() {
        WsOutboundEvent::Chat { message } => Some(message.sequence),
        _ => None,
    });
    assert_eq!(first_chat, Some(3));
}

#[tokio::test]
async fn removal_is_broadcast_once_and_redacted_in_history() {
    let h = harness();
    let (broadcaster, session_id) = h.live_session(SessionConfig::public()).await;
    let viewer_id = Uuid::new_v4();
    let viewer = h.admit(session_id, ViewerIdentity::User(viewer_id)).await;
    let message = h
        .coordinator
        .publish_chat(session_id, &ViewerIdentity::User(viewer_id), "spoiler")
        .await
        .unwrap();

    let err = h
        .coordinator
        .moderate(session_id, message.id, ModerationAction::Remove, Actor::User(viewer_id))
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::NotAuthorized(_)));

    for _ in 0..2 {
        h.coordinator
            .moderate(
                session_id,
                message.id,
                ModerationAction::Remove,
                Actor::User(broadcaster),
            )
            .await
            .unwrap();
    }

    let removals = viewer
        .queue
        .try_drain()
        .iter()
        .filter(|f| matches!(f.as_ref(), WsOutboundEvent::Moderation { message_id, .. } if *message_id == message.id))
        .count();
    assert_eq!(removals, 1);

    let history = h.coordinator.recent_messages(session_id, 10).await.unwrap();
    assert_eq!(history.len(), 1);
    assert!(history[0].is_removed());
    assert!(history[0].body.is_empty());
}

#[tokio::test]
async fn negotiation_is_relayed_between_broadcaster_and_viewer_only() {
    let h = harness();
    let (broadcaster, session_id) = h.live_session(SessionConfig::public()).await;
    let host = h.admit(session_id, ViewerIdentity::User(broadcaster)).await;
    let alice = h.admit(session_id, ViewerIdentity::Anonymous("alice".into())).await;
    let bob = h.admit(session_id, ViewerIdentity::Anonymous("bob".into())).await;
    host.queue.try_drain();

    let offer = NegotiationPayload {
        kind: SignalKind::Offer,
        data: "v=0 o=- 1 1 IN IP4 0.0.0.0".to_string(),
    };
    h.coordinator
        .handle_inbound(
            &alice.connection,
            WsInboundEvent::Negotiation {
                to: host.connection.connection_id,
                payload: offer.clone(),
            },
        )
        .await
        .unwrap();
    let relayed = host.queue.try_drain();
    assert!(relayed.iter().any(|f| matches!(
        f.as_ref(),
        WsOutboundEvent::Negotiation { from, payload }
            if *from == alice.connection.connection_id && *payload == offer
    )));

    let err = h
        .coordinator
        .relay(
            session_id,
            alice.connection.connection_id,
            bob.connection.connection_id,
            offer.clone(),
        )
        .unwrap_err();
    assert!(matches!(err, AppError::NotAuthorized(_)));

    h.coordinator
        .remove_connection(session_id, bob.connection.connection_id)
        .await;
    let outcome = h
        .coordinator
        .relay(
            session_id,
            host.connection.connection_id,
            bob.connection.connection_id,
            offer,
        )
        .unwrap();
    assert_eq!(outcome, RelayOutcome::PeerGone);
    assert!(host
        .queue
        .try_drain()
        .iter()
        .any(|f| matches!(f.as_ref(), WsOutboundEvent::RelayFailed { .. })));
}

#[tokio::test]
async fn viewer_churn_is_reported_to_the_broadcaster() {
    let h = harness();
    let (broadcaster, session_id) = h.live_session(SessionConfig::public()).await;
    let host = h.admit(session_id, ViewerIdentity::User(broadcaster)).await;
    let viewer = h.admit(session_id, ViewerIdentity::Anonymous("drifter".into())).await;
    h.coordinator
        .remove_connection(session_id, viewer.connection.connection_id)
        .await;

    let controls = control_events(&host.queue.try_drain());
    assert!(controls.contains(&ControlEvent::ViewerJoined {
        connection_id: viewer.connection.connection_id,
        viewer_count: 1,
    }));
    assert!(controls.contains(&ControlEvent::ViewerLeft {
        connection_id: viewer.connection.connection_id,
        viewer_count: 0,
    }));
    assert_eq!(
        h.view(session_id).await.session.state,
        SessionState::Live
    );
}

#[tokio::test]
async fn heartbeat_keeps_a_connection_and_silence_gets_it_reaped() {
    let h = harness();
    let (_, session_id) = h.live_session(SessionConfig::public()).await;
    let quiet = h.admit(session_id, ViewerIdentity::Anonymous("quiet".into())).await;
    let chatty = h.admit(session_id, ViewerIdentity::Anonymous("chatty".into())).await;

    h.coordinator
        .handle_inbound(&chatty.connection, WsInboundEvent::Heartbeat)
        .await
        .unwrap();
    assert!(chatty
        .queue
        .try_drain()
        .iter()
        .any(|f| matches!(f.as_ref(), WsOutboundEvent::HeartbeatAck { .. })));

    // Nothing is stale yet
    assert_eq!(
        h.coordinator
            .reap_stale_connections(Utc::now().timestamp_millis())
            .await,
        0
    );

    let heartbeat_ms = h.coordinator.config().limits.heartbeat_interval.as_millis() as i64;
    let later = Utc::now().timestamp_millis() + heartbeat_ms * 2;
    assert_eq!(h.coordinator.reap_stale_connections(later).await, 2);
    assert!(quiet.queue.is_closed());
    assert_eq!(h.coordinator.hub().viewer_count(session_id), 0);
}

#[tokio::test]
async fn stalled_broadcaster_queue_stays_bounded_under_viewer_churn() {
    let h = harness_with(&[("OUTBOUND_QUEUE_CAPACITY", "8")]);
    let (broadcaster, session_id) = h.live_session(SessionConfig::public()).await;
    let host = h.admit(session_id, ViewerIdentity::User(broadcaster)).await;

    for _ in 0..200 {
        let viewer = h.admit(session_id, ViewerIdentity::User(Uuid::new_v4())).await;
        h.coordinator
            .remove_connection(session_id, viewer.connection.connection_id)
            .await;
    }

    assert!(host.queue.len() <= 8);
    assert!(!host.queue.is_closed());
    assert!(host.queue.dropped_count() > 0);
}

#[tokio::test]
async fn chat_before_going_live_is_refused() {
    let h = harness();
    let broadcaster = Uuid::new_v4();
    let session = h
        .coordinator
        .create_session(broadcaster, SessionConfig::public())
        .await
        .unwrap();

    let err = h
        .coordinator
        .publish_chat(session.id, &ViewerIdentity::User(broadcaster), "testing, testing")
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::Conflict(_)));
    assert!(h
        .coordinator
        .recent_messages(session.id, 10)
        .await
        .unwrap()
        .is_empty());
}
