//! HTTP integration tests for the voice presence endpoints.
//!
//! Run with: `cargo test -p vc-presence-server --test voice_http_test`

mod helpers;

use axum::body::Body;
use axum::http::{Method, Request, StatusCode};
use helpers::{authed, body_to_json, settle, TestApp};
use uuid::Uuid;
use vc_common::VoiceEvent;

#[tokio::test]
async fn test_health_is_public() {
    let app = TestApp::new();
    let response = app
        .oneshot(Request::get("/health").body(Body::empty()).unwrap())
        .await;

    assert_eq!(response.status(), StatusCode::OK);
    let body = body_to_json(response).await;
    assert_eq!(body["status"], "ok");
    assert_eq!(body["provider_configured"], true);
}

#[tokio::test]
async fn test_voice_routes_require_auth() {
    let app = TestApp::new();
    let response = app
        .oneshot(
            Request::post("/voice/heartbeat")
                .body(Body::empty())
                .unwrap(),
        )
        .await;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    let response = app
        .oneshot(
            Request::post("/voice/heartbeat")
                .header("Authorization", "Bearer not-a-jwt")
                .body(Body::empty())
                .unwrap(),
        )
        .await;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_token_join_and_leave_flow() {
    let mut app = TestApp::new();
    let (user, channel) = (Uuid::new_v4(), Uuid::new_v4());

    let response = app
        .oneshot(authed(
            Method::POST,
            &format!("/voice/token/{channel}?sessionId=tab-1"),
            user,
        ))
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    let token = body_to_json(response).await;
    assert_eq!(token["channel_id"], channel.to_string());
    assert_eq!(token["session_id"], "tab-1");
    assert_eq!(token["heartbeat_interval_secs"], 45);
    assert!(token["auth_token"].as_str().unwrap().starts_with("tok-"));

    let meeting_id = token["meeting_id"].as_str().unwrap().to_string();
    assert_eq!(app.provider.connected(&meeting_id), vec![format!("{user}:tab-1")]);

    let response = app
        .oneshot(authed(
            Method::GET,
            &format!("/voice/channels/{channel}/participants"),
            user,
        ))
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        body_to_json(response).await["user_ids"],
        serde_json::json!([user.to_string()])
    );

    let response = app
        .oneshot(authed(Method::POST, "/voice/heartbeat", user))
        .await;
    assert_eq!(body_to_json(response).await["active"], true);

    app.drain_events();
    let response = app
        .oneshot(authed(
            Method::POST,
            &format!("/voice/channels/{channel}/leave?session_id=tab-1"),
            user,
        ))
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_to_json(response).await["left"], true);
    assert!(app.drain_events().contains(&VoiceEvent::ChannelParticipants {
        planet_id: None,
        channel_id: channel,
        user_ids: vec![],
    }));

    settle().await;
    assert!(app.provider.connected(&meeting_id).is_empty());

    // Second leave is a no-op.
    let response = app
        .oneshot(authed(
            Method::POST,
            &format!("/voice/channels/{channel}/leave?session_id=tab-1"),
            user,
        ))
        .await;
    assert_eq!(body_to_json(response).await["left"], false);
}

#[tokio::test]
async fn test_second_tab_replaces_first() {
    let mut app = TestApp::new();
    let (user, channel) = (Uuid::new_v4(), Uuid::new_v4());

    app.oneshot(authed(Method::POST, &format!("/voice/token/{channel}?session_id=a"), user))
        .await;
    app.drain_events();
    let response = app
        .oneshot(authed(Method::POST, &format!("/voice/token/{channel}?session_id=b"), user))
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    let meeting_id = body_to_json(response).await["meeting_id"]
        .as_str()
        .unwrap()
        .to_string();

    assert_eq!(app.provider.connected(&meeting_id), vec![format!("{user}:b")]);
    assert!(app.drain_events().contains(&VoiceEvent::SessionReplaced {
        channel_id: channel,
        user_id: user,
        session_id: Some("a".into()),
        active_session_id: Some("b".into()),
    }));

    // The superseded tab's late leave must not remove the new session.
    let response = app
        .oneshot(authed(
            Method::POST,
            &format!("/voice/channels/{channel}/leave?session_id=a"),
            user,
        ))
        .await;
    assert_eq!(body_to_json(response).await["left"], false);
    assert_eq!(
        app.voice.participants(user, channel).await.unwrap().user_ids,
        vec![user]
    );
}

#[tokio::test]
async fn test_join_denied_by_access_service() {
    let app = TestApp::new();
    let (user, channel) = (Uuid::new_v4(), Uuid::new_v4());
    app.access.denied.lock().unwrap().insert(user);

    let response = app
        .oneshot(authed(Method::POST, &format!("/voice/token/{channel}"), user))
        .await;
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
    assert_eq!(body_to_json(response).await["code"], "PERMISSION_DENIED");
}

#[tokio::test]
async fn test_unconfigured_provider_returns_503() {
    let app = TestApp::unconfigured();
    let response = app
        .oneshot(authed(
            Method::POST,
            &format!("/voice/token/{}", Uuid::new_v4()),
            Uuid::new_v4(),
        ))
        .await;
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body_to_json(response).await["code"], "PROVIDER_NOT_CONFIGURED");
}

#[tokio::test]
async fn test_moderation_endpoint() {
    let mut app = TestApp::new();
    let (moderator, target, channel) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
    app.oneshot(authed(Method::POST, &format!("/voice/token/{channel}"), target))
        .await;

    // Unknown action
    let response = app
        .oneshot(authed(
            Method::POST,
            &format!("/voice/channels/{channel}/participants/{target}/ban"),
            moderator,
        ))
        .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(body_to_json(response).await["code"], "UNKNOWN_ACTION");

    // Equal authority
    let response = app
        .oneshot(authed(
            Method::POST,
            &format!("/voice/channels/{channel}/participants/{target}/mute"),
            moderator,
        ))
        .await;
    assert_eq!(response.status(), StatusCode::FORBIDDEN);

    app.access.authority.lock().unwrap().insert(moderator, 100);
    app.drain_events();
    let response = app
        .oneshot(authed(
            Method::POST,
            &format!("/voice/channels/{channel}/participants/{target}/kick"),
            moderator,
        ))
        .await;
    assert_eq!(response.status(), StatusCode::OK);

    let events = app.drain_events();
    assert!(events.iter().any(|e| matches!(
        e,
        VoiceEvent::ModerationAction { target_user_id, .. } if *target_user_id == target
    )));
    assert!(app.voice.participants(moderator, channel).await.unwrap().user_ids.is_empty());

    // Target is gone now
    let response = app
        .oneshot(authed(
            Method::POST,
            &format!("/voice/channels/{channel}/participants/{target}/mute"),
            moderator,
        ))
        .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(body_to_json(response).await["code"], "NOT_IN_CHANNEL");
}

#[tokio::test]
async fn test_openapi_document_lists_voice_paths() {
    let app = TestApp::new();
    let response = app
        .oneshot(Request::get("/api/openapi.json").body(Body::empty()).unwrap())
        .await;
    assert_eq!(response.status(), StatusCode::OK);

    let doc = body_to_json(response).await;
    assert!(doc["paths"]["/voice/token/{channel_id}"].is_object());
    assert!(doc["paths"]["/voice/heartbeat"].is_object());
}
