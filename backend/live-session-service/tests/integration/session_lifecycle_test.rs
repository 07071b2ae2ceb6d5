use live_session_service::clients::ReadinessMode;
use live_session_service::db::SessionStore;
use live_session_service::models::{
    Actor, DonationRequest, SessionConfig, SessionState, ViewerIdentity,
};
use live_session_service::services::transcoding::PlaybackStatus;
use live_session_service::AppError;
use uuid::Uuid;

use super::support::{eventually, harness, harness_with};

#[tokio::test]
async fn scheduled_session_can_end_without_going_live() {
    let h = harness();
    let broadcaster = Uuid::new_v4();
    let session = h
        .coordinator
        .create_session(broadcaster, SessionConfig::public())
        .await
        .unwrap();

    let ended = h
        .coordinator
        .transition_state(session.id, SessionState::Ended, Actor::User(broadcaster))
        .await
        .unwrap();
    assert_eq!(ended.state, SessionState::Ended);
    assert!(ended.fault_reason.is_none());
    assert!(h.transcoder.finalized_jobs().is_empty());

    let err = h
        .coordinator
        .transition_state(session.id, SessionState::Live, Actor::User(broadcaster))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        AppError::InvalidStateTransition {
            from: SessionState::Ended,
            to: SessionState::Live
        }
    ));
}

#[tokio::test]
async fn only_the_owner_or_an_operator_may_transition() {
    let h = harness();
    let broadcaster = Uuid::new_v4();
    let session = h
        .coordinator
        .create_session(broadcaster, SessionConfig::public())
        .await
        .unwrap();

    let err = h
        .coordinator
        .transition_state(session.id, SessionState::Live, Actor::User(Uuid::new_v4()))
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::NotAuthorized(_)));
    assert_eq!(
        h.view(session.id).await.session.state,
        SessionState::Scheduled
    );

    let live = h
        .coordinator
        .transition_state(session.id, SessionState::Live, Actor::Admin)
        .await
        .unwrap();
    assert_eq!(live.state, SessionState::Live);
    assert!(live.started_at.is_some());
}

#[tokio::test]
async fn moving_back_to_scheduled_is_rejected() {
    let h = harness();
    let (broadcaster, session_id) = h.live_session(SessionConfig::public()).await;

    let err = h
        .coordinator
        .transition_state(session_id, SessionState::Scheduled, Actor::User(broadcaster))
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::InvalidStateTransition { .. }));
}

#[tokio::test]
async fn broadcaster_holds_at_most_one_live_session() {
    let h = harness();
    let broadcaster = Uuid::new_v4();
    let first = h
        .coordinator
        .create_session(broadcaster, SessionConfig::public())
        .await
        .unwrap();
    let second = h
        .coordinator
        .create_session(broadcaster, SessionConfig::public())
        .await
        .unwrap();

    h.coordinator
        .transition_state(first.id, SessionState::Live, Actor::User(broadcaster))
        .await
        .unwrap();
    let err = h
        .coordinator
        .transition_state(second.id, SessionState::Live, Actor::User(broadcaster))
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::Conflict(_)));

    // Creating another session while live is refused as well
    let err = h
        .coordinator
        .create_session(broadcaster, SessionConfig::public())
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::Conflict(_)));

    h.coordinator
        .transition_state(first.id, SessionState::Ended, Actor::User(broadcaster))
        .await
        .unwrap();
    h.coordinator
        .transition_state(second.id, SessionState::Live, Actor::User(broadcaster))
        .await
        .unwrap();
}

#[tokio::test]
async fn going_live_notifies_subscribers() {
    let h = harness();
    let (_, session_id) = h.live_session(SessionConfig::public()).await;

    let notifier = &h.notifier;
    assert!(eventually(|| async move { notifier.sent().contains(&session_id) }).await);
}

#[tokio::test]
async fn playback_becomes_ready_after_the_transcoder_reports_in() {
    let h = harness();
    h.transcoder.set_mode(ReadinessMode::Manual);
    let (_, session_id) = h.live_session(SessionConfig::public()).await;
    let viewer = h
        .admit(session_id, ViewerIdentity::Anonymous("early-bird".into()))
        .await;

    assert_eq!(h.view(session_id).await.playback, PlaybackStatus::Starting);
    assert!(h.transcoder.signal_ready(session_id));

    let coordinator = &h.coordinator;
    assert!(
        eventually(|| async move {
            matches!(
                coordinator.get_session(session_id).await.map(|v| v.playback),
                Ok(PlaybackStatus::Ready { .. })
            )
        })
        .await
    );
    let frames = viewer.queue.try_drain();
    assert!(frames.iter().any(|f| serde_json::to_value(f.as_ref()).unwrap()["event"]
        == "RECORDING_READY"));
}

#[tokio::test]
async fn transcoder_crash_before_ready_ends_the_session() {
    let h = harness();
    h.transcoder.set_mode(ReadinessMode::Manual);
    let (_, session_id) = h.live_session(SessionConfig::public()).await;

    assert!(h.transcoder.signal_failure(session_id, "encoder exited"));

    assert!(h.wait_for_state(session_id, SessionState::Ended).await);
    let view = h.view(session_id).await;
    assert!(view
        .session
        .fault_reason
        .as_deref()
        .unwrap_or_default()
        .contains("transcoder"));
    assert!(matches!(view.playback, PlaybackStatus::Failed { .. } | PlaybackStatus::Ended));
}

#[tokio::test]
async fn recording_is_archived_while_the_session_is_live() {
    let h = harness();
    let mut config = SessionConfig::public();
    config.recording_enabled = true;
    let (broadcaster, session_id) = h.live_session(config).await;

    let coordinator = &h.coordinator;
    let archive = &h.archive;
    assert!(
        eventually(|| async move {
            let playback = coordinator.get_session(session_id).await.map(|v| v.playback);
            matches!(playback, Ok(PlaybackStatus::Ready { .. })) && archive.segment_count(session_id) == 2
        })
        .await
    );
    assert!(h.transcoder.push_segment(session_id, b"segment-2"));
    assert!(eventually(|| async move { archive.segment_count(session_id) == 3 }).await);
    assert_eq!(h.view(session_id).await.session.state, SessionState::Live);
    assert!(h.archive.manifest(session_id).is_none());

    let ended = h
        .coordinator
        .transition_state(session_id, SessionState::Ended, Actor::User(broadcaster))
        .await
        .unwrap();

    assert!(ended.archive_location.is_some());
    assert!(h.archive.manifest(session_id).is_some());
    // segments streamed while live, plus the rendition playlist at stop
    assert_eq!(h.archive.segment_count(session_id), 4);
    assert_eq!(h.view(session_id).await.playback, PlaybackStatus::Ended);
}

#[tokio::test]
async fn unrecorded_session_leaves_the_archive_untouched() {
    let h = harness();
    let (broadcaster, session_id) = h.live_session(SessionConfig::public()).await;
    h.coordinator
        .transition_state(session_id, SessionState::Ended, Actor::User(broadcaster))
        .await
        .unwrap();
    assert_eq!(h.archive.segment_count(session_id), 0);
    assert!(h.archive.manifest(session_id).is_none());
}

#[tokio::test]
async fn ended_session_state_is_released_and_served_from_the_store() {
    let h = harness_with(&[("ENDED_SESSION_RETENTION_SECS", "0")]);
    let mut config = SessionConfig::public();
    config.recording_enabled = true;
    let (broadcaster, session_id) = h.live_session(config).await;
    let viewer = Uuid::new_v4();
    let _admission = h.admit(session_id, ViewerIdentity::User(viewer)).await;
    h.coordinator
        .publish_chat(session_id, &ViewerIdentity::User(viewer), "hello")
        .await
        .unwrap();
    h.coordinator
        .submit_donation(
            session_id,
            viewer,
            DonationRequest {
                amount: 500,
                message: None,
                idempotency_key: "tip".to_string(),
                donor_name: None,
            },
        )
        .await
        .unwrap();
    assert!(h.coordinator.holds_state(session_id));

    h.coordinator
        .transition_state(session_id, SessionState::Ended, Actor::User(broadcaster))
        .await
        .unwrap();
    let frozen = h.store.load_metrics(session_id).await.unwrap().unwrap();

    let coordinator = &h.coordinator;
    assert!(eventually(|| async move { !coordinator.holds_state(session_id) }).await);

    let view = h.view(session_id).await;
    assert_eq!(view.session.state, SessionState::Ended);
    assert_eq!(view.playback, PlaybackStatus::Ended);
    assert!(view.session.archive_location.is_some());
    assert_eq!(h.coordinator.session_metrics(session_id).await.unwrap(), frozen);
    assert_eq!(frozen.total_chat_messages, 1);
    assert_eq!(h.coordinator.list_donations(session_id).await.unwrap().len(), 1);

    let err = h
        .coordinator
        .transition_state(session_id, SessionState::Ended, Actor::User(broadcaster))
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::InvalidStateTransition { .. }));
    let err = h
        .coordinator
        .publish_chat(session_id, &ViewerIdentity::User(viewer), "anyone?")
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::Conflict(_)));
    assert!(!h.coordinator.holds_state(session_id));
}

#[tokio::test]
async fn final_metrics_are_persisted_and_frozen() {
    let h = harness();
    let (broadcaster, session_id) = h.live_session(SessionConfig::public()).await;
    let viewer = Uuid::new_v4();
    let admission = h.admit(session_id, ViewerIdentity::User(viewer)).await;
    h.coordinator
        .publish_chat(session_id, &ViewerIdentity::User(viewer), "hello")
        .await
        .unwrap();

    h.coordinator
        .transition_state(session_id, SessionState::Ended, Actor::User(broadcaster))
        .await
        .unwrap();
    assert!(admission.queue.is_closed());

    let frozen = h.coordinator.session_metrics(session_id).await.unwrap();
    assert!(frozen.is_final());
    assert_eq!(frozen.total_chat_messages, 1);
    assert_eq!(frozen.peak_concurrent_viewers, 1);
    assert_eq!(frozen.unique_viewers, 1);

    // Late activity cannot move the counters
    let err = h
        .coordinator
        .publish_chat(session_id, &ViewerIdentity::User(viewer), "anyone?")
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::Conflict(_)));
    assert_eq!(h.coordinator.session_metrics(session_id).await.unwrap(), frozen);

    let stored = h.store.load_metrics(session_id).await.unwrap();
    assert_eq!(stored, Some(frozen));
}

#[tokio::test]
async fn ending_twice_reports_the_illegal_move() {
    let h = harness();
    let (broadcaster, session_id) = h.live_session(SessionConfig::public()).await;
    h.coordinator
        .transition_state(session_id, SessionState::Ended, Actor::User(broadcaster))
        .await
        .unwrap();

    let err = h
        .coordinator
        .transition_state(session_id, SessionState::Ended, Actor::User(broadcaster))
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::InvalidStateTransition { .. }));

    // Platform-initiated ends stay quiet
    let again = h.coordinator.force_end(session_id, "cleanup").await.unwrap();
    assert!(again.fault_reason.is_none());
}

#[tokio::test]
async fn unknown_session_is_not_found() {
    let h = harness();
    assert!(matches!(
        h.coordinator.get_session(Uuid::new_v4()).await,
        Err(AppError::NotFound(_))
    ));
    assert!(matches!(
        h.coordinator
            .transition_state(Uuid::new_v4(), SessionState::Live, Actor::Admin)
            .await,
        Err(AppError::NotFound(_))
    ));
}
