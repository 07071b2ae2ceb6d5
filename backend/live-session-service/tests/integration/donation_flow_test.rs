use std::time::Duration;

use live_session_service::clients::ScriptedCapture;
use live_session_service::models::{
    Actor, DonationRequest, MessageKind, SessionConfig, SessionState, SettlementState,
    ViewerIdentity,
};
use live_session_service::websocket::message_types::WsOutboundEvent;
use live_session_service::AppError;
use uuid::Uuid;

use super::support::{harness, harness_with};

fn request(amount: i64, key: &str) -> DonationRequest {
    DonationRequest {
        amount,
        message: Some("great stream".to_string()),
        idempotency_key: key.to_string(),
        donor_name: Some("patron".to_string()),
    }
}

fn announcements(frames: &[std::sync::Arc<WsOutboundEvent>]) -> usize {
    frames
        .iter()
        .filter(|f| matches!(f.as_ref(), WsOutboundEvent::DonationAnnouncement { .. }))
        .count()
}

#[tokio::test]
async fn settled_donation_is_split_and_announced_once() {
    let h = harness();
    let (_, session_id) = h.live_session(SessionConfig::public()).await;
    let viewer = h
        .admit(session_id, ViewerIdentity::Anonymous("watcher".into()))
        .await;
    let donor = Uuid::new_v4();

    let donation = h
        .coordinator
        .submit_donation(session_id, donor, request(1_000, "tip-1"))
        .await
        .unwrap();
    assert_eq!(donation.state, SettlementState::Settled);
    assert_eq!(donation.gross_amount, 1_000);
    assert_eq!(donation.fee_amount, 100);
    assert_eq!(donation.net_amount, 900);
    assert!(donation.processor_reference.is_some());

    // Client retry with the same key
    let replay = h
        .coordinator
        .submit_donation(session_id, donor, request(1_000, "tip-1"))
        .await
        .unwrap();
    assert_eq!(replay.id, donation.id);
    assert_eq!(h.payments.calls().len(), 1);

    assert_eq!(announcements(&viewer.queue.try_drain()), 1);

    let history = h.coordinator.recent_messages(session_id, 10).await.unwrap();
    let announced: Vec<_> = history
        .iter()
        .filter(|m| m.kind == MessageKind::DonationAnnouncement)
        .collect();
    assert_eq!(announced.len(), 1);
    assert_eq!(announced[0].amount, Some(1_000));
    assert_eq!(announced[0].display_name, "patron");

    let metrics = h.coordinator.session_metrics(session_id).await.unwrap();
    assert_eq!(metrics.total_donation_gross, 1_000);
    assert_eq!(metrics.total_chat_messages, 0);

    let ledger = h.coordinator.list_donations(session_id).await.unwrap();
    assert_eq!(ledger.len(), 1);
    assert_eq!(ledger[0].state, SettlementState::Settled);
}

#[tokio::test]
async fn concurrent_duplicates_capture_once() {
    let h = harness();
    let (_, session_id) = h.live_session(SessionConfig::public()).await;
    h.payments.push(ScriptedCapture::Delay(Duration::from_millis(100)));
    let donor = Uuid::new_v4();

    let first = {
        let coordinator = h.coordinator.clone();
        tokio::spawn(async move {
            coordinator
                .submit_donation(session_id, donor, request(500, "double-click"))
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(10)).await;
    let second = h
        .coordinator
        .submit_donation(session_id, donor, request(500, "double-click"))
        .await
        .unwrap();
    let first = first.await.unwrap().unwrap();

    assert_eq!(first.id, second.id);
    assert_eq!(h.payments.calls().len(), 1);
    assert_eq!(first.state, SettlementState::Settled);
}

#[tokio::test]
async fn retry_after_an_unanswered_capture_reuses_the_processor_key() {
    let h = harness_with(&[("RETRY_BACKOFF_MS", "5")]);
    let (_, session_id) = h.live_session(SessionConfig::public()).await;
    h.payments.push(ScriptedCapture::Fail);
    h.payments.push(ScriptedCapture::Fail);
    let donor = Uuid::new_v4();

    let err = h
        .coordinator
        .submit_donation(session_id, donor, request(500, "client-key-1"))
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::ExternalDependency(_)));

    let retried = h
        .coordinator
        .submit_donation(session_id, donor, request(500, "client-key-1"))
        .await
        .unwrap();
    assert_eq!(retried.state, SettlementState::Settled);

    let ledger = h.coordinator.list_donations(session_id).await.unwrap();
    assert_eq!(ledger.len(), 1);
    assert_eq!(ledger[0].id, retried.id);

    let calls = h.payments.calls();
    assert!(calls.len() >= 2);
    assert!(calls.iter().all(|c| c.idempotency_key == calls[0].idempotency_key));
    assert!(calls.iter().all(|c| c.donation_id == retried.id));
    assert_eq!(h.payments.charged(), 1);
}

#[tokio::test]
async fn declined_capture_fails_the_donation_without_an_announcement() {
    let h = harness();
    let (_, session_id) = h.live_session(SessionConfig::public()).await;
    let viewer = h
        .admit(session_id, ViewerIdentity::Anonymous("watcher".into()))
        .await;
    h.payments
        .push(ScriptedCapture::Decline("insufficient_funds".to_string()));
    let donor = Uuid::new_v4();

    let err = h
        .coordinator
        .submit_donation(session_id, donor, request(1_000, "tip-declined"))
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::PaymentDeclined(ref reason) if reason == "insufficient_funds"));
    assert_eq!(announcements(&viewer.queue.try_drain()), 0);

    let ledger = h.coordinator.list_donations(session_id).await.unwrap();
    assert_eq!(ledger.len(), 1);
    assert_eq!(ledger[0].state, SettlementState::Failed);
    assert_eq!(
        h.coordinator
            .session_metrics(session_id)
            .await
            .unwrap()
            .total_donation_gross,
        0
    );

    // A definite decline releases the key
    let retried = h
        .coordinator
        .submit_donation(session_id, donor, request(1_000, "tip-declined"))
        .await
        .unwrap();
    assert_eq!(retried.state, SettlementState::Settled);
    assert_ne!(retried.id, ledger[0].id);
}

#[tokio::test]
async fn processor_outage_surfaces_as_dependency_failure() {
    let h = harness_with(&[("RETRY_BACKOFF_MS", "5")]);
    let (_, session_id) = h.live_session(SessionConfig::public()).await;
    for _ in 0..5 {
        h.payments.push(ScriptedCapture::Fail);
    }

    let err = h
        .coordinator
        .submit_donation(session_id, Uuid::new_v4(), request(1_000, "tip-outage"))
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::ExternalDependency(_)));
    // The processor might have charged; the record waits for reconciliation
    let ledger = h.coordinator.list_donations(session_id).await.unwrap();
    assert_eq!(ledger.len(), 1);
    assert_eq!(ledger[0].state, SettlementState::Pending);
    assert_eq!(
        h.coordinator
            .session_metrics(session_id)
            .await
            .unwrap()
            .total_donation_gross,
        0
    );
}

#[tokio::test]
async fn donations_require_a_live_session_and_a_sane_amount() {
    let h = harness();
    let broadcaster = Uuid::new_v4();
    let session = h
        .coordinator
        .create_session(broadcaster, SessionConfig::public())
        .await
        .unwrap();

    let err = h
        .coordinator
        .submit_donation(session.id, Uuid::new_v4(), request(1_000, "early"))
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::Conflict(_)));

    h.coordinator
        .transition_state(session.id, SessionState::Live, Actor::User(broadcaster))
        .await
        .unwrap();
    for amount in [0, -50, 10] {
        let err = h
            .coordinator
            .submit_donation(session.id, Uuid::new_v4(), request(amount, "bad"))
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Validation(_)), "amount {amount}");
    }
    assert!(h.payments.calls().is_empty());
}

#[tokio::test]
async fn anonymous_donor_name_falls_back_to_the_account_handle() {
    let h = harness();
    let (_, session_id) = h.live_session(SessionConfig::public()).await;
    let donor = Uuid::new_v4();
    let mut req = request(250, "no-name");
    req.donor_name = None;

    let donation = h
        .coordinator
        .submit_donation(session_id, donor, req)
        .await
        .unwrap();
    assert_eq!(donation.donor_name, ViewerIdentity::User(donor).display_name());
}
