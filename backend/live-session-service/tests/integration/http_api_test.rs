use actix_web::{http::StatusCode, test, App};
use live_session_service::handlers;
use live_session_service::models::ViewerIdentity;
use serde_json::{json, Value};
use uuid::Uuid;

use super::support::{app_state, harness, ADMIN_TOKEN};

#[actix_web::test]
async fn health_endpoint_reports_ok() {
    let h = harness();
    let app = test::init_service(App::new().app_data(app_state(&h)).configure(handlers::configure)).await;

    let req = test::TestRequest::get().uri("/health").to_request();
    let body: Value = test::call_and_read_body_json(&app, req).await;
    assert_eq!(body["status"], "ok");
}

#[actix_web::test]
async fn session_lifecycle_over_http() {
    let h = harness();
    let app = test::init_service(App::new().app_data(app_state(&h)).configure(handlers::configure)).await;
    let broadcaster = Uuid::new_v4();

    let req = test::TestRequest::post()
        .uri("/api/v1/sessions")
        .insert_header(("x-user-id", broadcaster.to_string()))
        .set_json(json!({ "visibility": "PUBLIC", "recording_enabled": true }))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), StatusCode::CREATED);
    let created: Value = test::read_body_json(resp).await;
    assert_eq!(created["state"], "SCHEDULED");
    let session_id = created["session_id"].as_str().unwrap().to_string();

    let req = test::TestRequest::post()
        .uri(&format!("/api/v1/sessions/{session_id}/transition"))
        .insert_header(("x-user-id", broadcaster.to_string()))
        .set_json(json!({ "target_state": "LIVE" }))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), StatusCode::OK);

    let req = test::TestRequest::get()
        .uri(&format!("/api/v1/sessions/{session_id}"))
        .to_request();
    let view: Value = test::call_and_read_body_json(&app, req).await;
    assert_eq!(view["state"], "LIVE");
    assert_eq!(view["viewer_count"], 0);
    assert_eq!(view["recording_enabled"], true);
    assert!(view["playback"]["status"].is_string());

    let req = test::TestRequest::post()
        .uri(&format!("/api/v1/sessions/{session_id}/transition"))
        .insert_header(("x-user-id", broadcaster.to_string()))
        .set_json(json!({ "target_state": "SCHEDULED" }))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), StatusCode::CONFLICT);
    let error: Value = test::read_body_json(resp).await;
    assert_eq!(error["error"], "invalid_state_transition");

    let req = test::TestRequest::post()
        .uri(&format!("/api/v1/sessions/{session_id}/transition"))
        .insert_header(("x-user-id", broadcaster.to_string()))
        .set_json(json!({ "target_state": "ENDED" }))
        .to_request();
    let ended: Value = test::call_and_read_body_json(&app, req).await;
    assert_eq!(ended["state"], "ENDED");

    let req = test::TestRequest::get()
        .uri(&format!("/api/v1/sessions/{session_id}/metrics"))
        .to_request();
    let metrics: Value = test::call_and_read_body_json(&app, req).await;
    assert!(metrics["finalized_at"].is_string());
}

#[actix_web::test]
async fn creating_a_session_needs_an_identity_and_a_valid_config() {
    let h = harness();
    let app = test::init_service(App::new().app_data(app_state(&h)).configure(handlers::configure)).await;

    let req = test::TestRequest::post()
        .uri("/api/v1/sessions")
        .set_json(json!({ "visibility": "PUBLIC" }))
        .to_request();
    assert_eq!(test::call_service(&app, req).await.status(), StatusCode::FORBIDDEN);

    let req = test::TestRequest::post()
        .uri("/api/v1/sessions")
        .insert_header(("x-user-id", "not-a-uuid"))
        .set_json(json!({ "visibility": "PUBLIC" }))
        .to_request();
    assert_eq!(test::call_service(&app, req).await.status(), StatusCode::BAD_REQUEST);

    let req = test::TestRequest::post()
        .uri("/api/v1/sessions")
        .insert_header(("x-user-id", Uuid::new_v4().to_string()))
        .set_json(json!({ "visibility": "TIER_GATED" }))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    let error: Value = test::read_body_json(resp).await;
    assert_eq!(error["error"], "validation_error");
}

#[actix_web::test]
async fn stranger_cannot_transition_but_operator_can() {
    let h = harness();
    let app = test::init_service(App::new().app_data(app_state(&h)).configure(handlers::configure)).await;
    let session = h
        .coordinator
        .create_session(Uuid::new_v4(), live_session_service::models::SessionConfig::public())
        .await
        .unwrap();

    let req = test::TestRequest::post()
        .uri(&format!("/api/v1/sessions/{}/transition", session.id))
        .insert_header(("x-user-id", Uuid::new_v4().to_string()))
        .set_json(json!({ "target_state": "ENDED" }))
        .to_request();
    assert_eq!(test::call_service(&app, req).await.status(), StatusCode::FORBIDDEN);

    let req = test::TestRequest::post()
        .uri(&format!("/api/v1/sessions/{}/transition", session.id))
        .insert_header(("x-admin-token", "guess"))
        .set_json(json!({ "target_state": "ENDED" }))
        .to_request();
    assert_eq!(test::call_service(&app, req).await.status(), StatusCode::FORBIDDEN);

    let req = test::TestRequest::post()
        .uri(&format!("/api/v1/sessions/{}/transition", session.id))
        .insert_header(("x-admin-token", ADMIN_TOKEN))
        .set_json(json!({ "target_state": "ENDED" }))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), StatusCode::OK);
}

#[actix_web::test]
async fn join_denial_is_a_forbidden_answer_with_a_reason() {
    let h = harness();
    let app = test::init_service(App::new().app_data(app_state(&h)).configure(handlers::configure)).await;
    let mut config = live_session_service::models::SessionConfig::public();
    config.visibility = live_session_service::models::Visibility::Subscribers;
    let (broadcaster, session_id) = h.live_session(config).await;

    let req = test::TestRequest::post()
        .uri(&format!("/api/v1/sessions/{session_id}/join"))
        .insert_header(("x-anonymous-id", "visitor-7"))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), StatusCode::FORBIDDEN);
    let body: Value = test::read_body_json(resp).await;
    assert_eq!(body["decision"], "deny");
    assert_eq!(body["reason"], "not_subscribed");

    let fan = Uuid::new_v4();
    h.directory.subscribe(fan, broadcaster, "basic");
    let req = test::TestRequest::post()
        .uri(&format!("/api/v1/sessions/{session_id}/join"))
        .insert_header(("x-user-id", fan.to_string()))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), StatusCode::OK);
    let body: Value = test::read_body_json(resp).await;
    assert_eq!(body["decision"], "allow");
    assert_eq!(body["role"], "VIEWER");
    assert!(body["token"].as_str().map(|t| !t.is_empty()).unwrap_or(false));
}

#[actix_web::test]
async fn donations_over_http() {
    let h = harness();
    let app = test::init_service(App::new().app_data(app_state(&h)).configure(handlers::configure)).await;
    let (_, session_id) = h.live_session(live_session_service::models::SessionConfig::public()).await;
    let donor = Uuid::new_v4();

    let req = test::TestRequest::post()
        .uri(&format!("/api/v1/sessions/{session_id}/donations"))
        .insert_header(("x-user-id", donor.to_string()))
        .set_json(json!({ "amount": 1000, "idempotency_key": "k-1", "message": "gg" }))
        .to_request();
    let donation: Value = test::call_and_read_body_json(&app, req).await;
    assert_eq!(donation["state"], "SETTLED");
    assert_eq!(donation["fee_amount"], 100);
    assert_eq!(donation["net_amount"], 900);

    h.payments.push(live_session_service::clients::ScriptedCapture::Decline(
        "card_expired".to_string(),
    ));
    let req = test::TestRequest::post()
        .uri(&format!("/api/v1/sessions/{session_id}/donations"))
        .insert_header(("x-user-id", donor.to_string()))
        .set_json(json!({ "amount": 1000, "idempotency_key": "k-2" }))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), StatusCode::PAYMENT_REQUIRED);
    let error: Value = test::read_body_json(resp).await;
    assert_eq!(error["error"], "payment_declined");

    let req = test::TestRequest::get()
        .uri(&format!("/api/v1/sessions/{session_id}/donations"))
        .to_request();
    let ledger: Value = test::call_and_read_body_json(&app, req).await;
    assert_eq!(ledger.as_array().map(Vec::len), Some(2));
}

#[actix_web::test]
async fn chat_history_and_moderation_over_http() {
    let h = harness();
    let app = test::init_service(App::new().app_data(app_state(&h)).configure(handlers::configure)).await;
    let (broadcaster, session_id) = h.live_session(live_session_service::models::SessionConfig::public()).await;
    let viewer = Uuid::new_v4();
    let mut last = None;
    for i in 0..5 {
        last = Some(
            h.coordinator
                .publish_chat(session_id, &ViewerIdentity::User(viewer), &format!("hi {i}"))
                .await
                .unwrap(),
        );
    }
    let last = last.unwrap();

    let req = test::TestRequest::get()
        .uri(&format!("/api/v1/sessions/{session_id}/messages?limit=2"))
        .to_request();
    let page: Value = test::call_and_read_body_json(&app, req).await;
    let sequences: Vec<u64> = page
        .as_array()
        .unwrap()
        .iter()
        .map(|m| m["sequence"].as_u64().unwrap())
        .collect();
    assert_eq!(sequences, vec![4, 5]);

    let uri = format!("/api/v1/sessions/{session_id}/messages/{}/moderate", last.id);
    let req = test::TestRequest::post()
        .uri(&uri)
        .insert_header(("x-user-id", viewer.to_string()))
        .set_json(json!({ "action": "remove" }))
        .to_request();
    assert_eq!(test::call_service(&app, req).await.status(), StatusCode::FORBIDDEN);

    let req = test::TestRequest::post()
        .uri(&uri)
        .insert_header(("x-user-id", broadcaster.to_string()))
        .set_json(json!({ "action": "remove" }))
        .to_request();
    let first: Value = test::call_and_read_body_json(&app, req).await;
    assert_eq!(first["applied"], true);
    assert_eq!(first["message"]["moderation_state"], "REMOVED");

    let req = test::TestRequest::post()
        .uri(&uri)
        .insert_header(("x-admin-token", ADMIN_TOKEN))
        .set_json(json!({ "action": "remove" }))
        .to_request();
    let second: Value = test::call_and_read_body_json(&app, req).await;
    assert_eq!(second["applied"], false);
}

#[actix_web::test]
async fn unknown_session_is_404() {
    let h = harness();
    let app = test::init_service(App::new().app_data(app_state(&h)).configure(handlers::configure)).await;

    let req = test::TestRequest::get()
        .uri(&format!("/api/v1/sessions/{}", Uuid::new_v4()))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    let error: Value = test::read_body_json(resp).await;
    assert_eq!(error["error"], "not_found");
}
