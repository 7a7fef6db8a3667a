use std::net::SocketAddr;

use axum::{routing::get, Json, Router};
use serde_json::{json, Value};
use time::{format_description::well_known::Rfc3339, OffsetDateTime};
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use crate::state::AppState;
use crate::{auth, jobs};

pub fn build_app(state: AppState) -> Router {
    Router::new()
        .nest(
            "/api",
            Router::new()
                .merge(auth::router())
                .merge(jobs::router())
                .route("/health", get(health)),
        )
        .with_state(state)
        .layer(CorsLayer::permissive())
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(|req: &axum::http::Request<_>| {
                    let method = req.method().clone();
                    // path only: the query string may carry a session token
                    let path = req.uri().path().to_owned();
                    tracing::info_span!("http_request", %method, %path, status = tracing::field::Empty)
                })
                .on_response(
                    |res: &axum::http::Response<_>,
                     _latency: std::time::Duration,
                     span: &tracing::Span| {
                        let status = res.status();
                        span.record("status", tracing::field::display(status));
                        if status.is_server_error() {
                            tracing::error!(%status, "response");
                        } else {
                            tracing::info!(%status, "response");
                        }
                    },
                ),
        )
}

async fn health() -> Json<Value> {
    let timestamp = OffsetDateTime::now_utc()
        .format(&Rfc3339)
        .unwrap_or_default();
    Json(json!({ "status": "OK", "timestamp": timestamp }))
}

pub async fn serve(app: Router) -> anyhow::Result<()> {
    let addr: SocketAddr = format!(
        "{}:{}",
        std::env::var("APP_HOST").unwrap_or_else(|_| "0.0.0.0".into()),
        std::env::var("APP_PORT").unwrap_or_else(|_| "5000".into())
    )
    .parse()?;

    tracing::info!("listening on {}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use async_trait::async_trait;
    use axum::{
        body::{to_bytes, Body},
        http::{header, Request, StatusCode},
        response::Response,
    };
    use tower::ServiceExt;

    use super::*;
    use crate::auth::{
        google::GoogleOAuth,
        memory::MemoryUserStore,
        repo::UserStore,
        repo_types::{GoogleProfile, ProfileValue, Provider},
    };

    struct FakeGoogle;

    #[async_trait]
    impl GoogleOAuth for FakeGoogle {
        fn authorize_url(&self, state: &str) -> String {
            format!("https://accounts.example/auth?state={state}")
        }

        async fn exchange(&self, code: &str) -> anyhow::Result<GoogleProfile> {
            anyhow::ensure!(code == "good-code", "bad code");
            Ok(GoogleProfile {
                id: "g1".into(),
                emails: vec![ProfileValue {
                    value: "x@y.com".into(),
                }],
                display_name: Some("X".into()),
                photos: vec![],
            })
        }
    }

    async fn json_body(res: Response) -> Value {
        let bytes = to_bytes(res.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn post_json(uri: &str, body: Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    fn get_with_bearer(uri: &str, token: &str) -> Request<Body> {
        Request::builder()
            .uri(uri)
            .header(header::AUTHORIZATION, format!("Bearer {token}"))
            .body(Body::empty())
            .unwrap()
    }

    fn set_cookie_value(res: &Response, name: &str) -> Option<String> {
        res.headers()
            .get_all(header::SET_COOKIE)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .find_map(|v| {
                let pair = v.split(';').next()?;
                let (k, val) = pair.split_once('=')?;
                (k == name).then(|| val.to_string())
            })
    }

    async fn signup(app: &Router, email: &str, password: &str) -> Response {
        app.clone()
            .oneshot(post_json(
                "/api/auth/signup",
                json!({ "email": email, "password": password }),
            ))
            .await
            .unwrap()
    }

    async fn login(app: &Router, body: Value) -> Response {
        app.clone()
            .oneshot(post_json("/api/auth/login", body))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn health_reports_ok() {
        let app = build_app(AppState::fake());
        let res = app
            .oneshot(Request::builder().uri("/api/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::OK);
        assert_eq!(json_body(res).await["status"], "OK");
    }

    #[tokio::test]
    async fn signup_then_login_and_wrong_password() {
        let app = build_app(AppState::fake());

        let res = signup(&app, "a@b.com", "secret1").await;
        assert_eq!(res.status(), StatusCode::CREATED);
        assert!(set_cookie_value(&res, "token").is_some());

        let res = login(&app, json!({ "email": "a@b.com", "password": "secret1" })).await;
        assert_eq!(res.status(), StatusCode::OK);
        let cookie = set_cookie_value(&res, "token").unwrap();
        let body = json_body(res).await;
        assert_eq!(body["token"].as_str().unwrap(), cookie);
        assert_eq!(body["user"]["email"], "a@b.com");
        assert!(body["user"].get("passwordHash").is_none());
        assert!(body["user"].get("password_hash").is_none());

        let res = login(&app, json!({ "email": "a@b.com", "password": "nope123" })).await;
        assert_eq!(res.status(), StatusCode::BAD_REQUEST);
        assert_eq!(json_body(res).await["message"], "Invalid credentials");
    }

    #[tokio::test]
    async fn signup_rejects_short_password_and_taken_email() {
        let app = build_app(AppState::fake());
        let res = signup(&app, "a@b.com", "12345").await;
        assert_eq!(res.status(), StatusCode::BAD_REQUEST);

        assert_eq!(signup(&app, "a@b.com", "secret1").await.status(), StatusCode::CREATED);
        // the first signup left a live session behind
        let res = signup(&app, "A@B.com", "secret2").await;
        assert_eq!(res.status(), StatusCode::CONFLICT);
        assert_eq!(json_body(res).await["error"], "active_session_conflict");
    }

    #[tokio::test]
    async fn verify_without_credential_is_unauthorized() {
        let app = build_app(AppState::fake());
        let res = app
            .oneshot(Request::builder().uri("/api/auth/verify").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(json_body(res).await["error"], "missing_credential");
    }

    #[tokio::test]
    async fn newer_login_revokes_older_token() {
        let app = build_app(AppState::fake());
        let first = json_body(signup(&app, "a@b.com", "secret1").await).await["token"]
            .as_str()
            .unwrap()
            .to_string();
        let res = login(&app, json!({ "email": "a@b.com", "password": "secret1" })).await;
        let second = json_body(res).await["token"].as_str().unwrap().to_string();

        let res = app
            .clone()
            .oneshot(get_with_bearer("/api/auth/verify", &second))
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::OK);
        assert_eq!(json_body(res).await["isValid"], true);

        let res = app
            .oneshot(get_with_bearer("/api/auth/verify", &first))
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::UNAUTHORIZED);
        assert!(set_cookie_value(&res, "token").is_some());
        assert_eq!(json_body(res).await["error"], "session_revoked");
    }

    #[tokio::test]
    async fn logout_always_succeeds_and_revokes() {
        let app = build_app(AppState::fake());

        let res = app
            .clone()
            .oneshot(post_json("/api/auth/logout", json!({})))
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::OK);
        assert_eq!(json_body(res).await["success"], true);

        let token = json_body(signup(&app, "a@b.com", "secret1").await).await["token"]
            .as_str()
            .unwrap()
            .to_string();
        let res = app
            .clone()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/api/auth/logout")
                    .header(header::COOKIE, format!("token={token}"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::OK);
        assert_eq!(set_cookie_value(&res, "token").as_deref(), Some(""));

        let res = app
            .oneshot(get_with_bearer("/api/auth/verify", &token))
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn passwordless_login_replaces_live_session() {
        let app = build_app(AppState::fake());
        let res = login(&app, json!({ "email": "m@b.com" })).await;
        assert_eq!(res.status(), StatusCode::OK);
        let first = json_body(res).await["token"].as_str().unwrap().to_string();

        let res = login(&app, json!({ "email": "m@b.com" })).await;
        assert_eq!(res.status(), StatusCode::OK);
        let second = json_body(res).await["token"].as_str().unwrap().to_string();
        assert_ne!(first, second);

        let res = app
            .clone()
            .oneshot(get_with_bearer("/api/auth/verify", &first))
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::UNAUTHORIZED);
        let res = app
            .oneshot(get_with_bearer("/api/auth/verify", &second))
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn get_token_only_trusts_the_cookie() {
        let app = build_app(AppState::fake());
        let token = json_body(signup(&app, "a@b.com", "secret1").await).await["token"]
            .as_str()
            .unwrap()
            .to_string();

        let res = app
            .clone()
            .oneshot(get_with_bearer("/api/auth/get-token", &token))
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::UNAUTHORIZED);

        let res = app
            .oneshot(
                Request::builder()
                    .uri("/api/auth/get-token")
                    .header(header::COOKIE, format!("token={token}"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::OK);
        assert_eq!(json_body(res).await["token"], token.as_str());
    }

    #[tokio::test]
    async fn verify_session_requires_matching_email() {
        let app = build_app(AppState::fake());
        let token = json_body(signup(&app, "a@b.com", "secret1").await).await["token"]
            .as_str()
            .unwrap()
            .to_string();

        let res = app
            .clone()
            .oneshot(post_json(
                "/api/auth/verify-session",
                json!({ "token": token, "email": "other@b.com" }),
            ))
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::UNAUTHORIZED);

        let res = app
            .oneshot(post_json(
                "/api/auth/verify-session",
                json!({ "token": token, "email": " A@b.com " }),
            ))
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn failed_verify_session_leaves_cookie_session_alone() {
        let app = build_app(AppState::fake());
        let token = json_body(signup(&app, "a@b.com", "secret1").await).await["token"]
            .as_str()
            .unwrap()
            .to_string();

        for body in [
            json!({ "token": "not-a-token", "email": "a@b.com" }),
            json!({ "token": token, "email": "other@b.com" }),
        ] {
            let mut req = post_json("/api/auth/verify-session", body);
            req.headers_mut().insert(
                header::COOKIE,
                format!("token={token}").parse().unwrap(),
            );
            let res = app.clone().oneshot(req).await.unwrap();
            assert_eq!(res.status(), StatusCode::UNAUTHORIZED);
            assert!(res.headers().get(header::SET_COOKIE).is_none());
        }

        let res = app
            .oneshot(
                Request::builder()
                    .uri("/api/auth/verify")
                    .header(header::COOKIE, format!("token={token}"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn change_password_then_login_with_new_one() {
        let app = build_app(AppState::fake());
        let token = json_body(signup(&app, "a@b.com", "secret1").await).await["token"]
            .as_str()
            .unwrap()
            .to_string();

        let res = app
            .clone()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/api/auth/password")
                    .header(header::AUTHORIZATION, format!("Bearer {token}"))
                    .header(header::CONTENT_TYPE, "application/json")
                    .body(Body::from(
                        json!({ "currentPassword": "secret1", "newPassword": "secret2" })
                            .to_string(),
                    ))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::OK);

        let res = login(&app, json!({ "email": "a@b.com", "password": "secret1" })).await;
        assert_eq!(res.status(), StatusCode::BAD_REQUEST);
        let res = login(&app, json!({ "email": "a@b.com", "password": "secret2" })).await;
        assert_eq!(res.status(), StatusCode::OK);
    }

    async fn google_round_trip(app: &Router, code: &str) -> Response {
        let res = app
            .clone()
            .oneshot(Request::builder().uri("/api/auth/google").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert!(res.status().is_redirection());
        let state = set_cookie_value(&res, "oauth_state").unwrap();
        let location = res.headers()[header::LOCATION].to_str().unwrap();
        assert!(location.ends_with(&format!("state={state}")));

        app.clone()
            .oneshot(
                Request::builder()
                    .uri(format!("/api/auth/google/callback?code={code}&state={state}"))
                    .header(header::COOKIE, format!("oauth_state={state}"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn google_callback_creates_then_updates_one_user() {
        let store = Arc::new(MemoryUserStore::new());
        let mut state = AppState::fake().with_google(Arc::new(FakeGoogle));
        state.users = store.clone() as Arc<dyn UserStore>;
        let app = build_app(state);

        let res = google_round_trip(&app, "good-code").await;
        assert!(res.status().is_redirection());
        let location = res.headers()[header::LOCATION].to_str().unwrap().to_string();
        assert!(location.starts_with("http://localhost:5000/pages/JobTrackerDashboard.html#token="));
        let token = location.split("#token=").nth(1).unwrap().to_string();
        assert_eq!(set_cookie_value(&res, "token").as_deref(), Some(token.as_str()));

        let user = store.find_by_email("x@y.com").await.unwrap().unwrap();
        assert_eq!(user.provider, Provider::Google);
        assert!(user.verified);
        assert_eq!(user.google_id.as_deref(), Some("g1"));

        let res = google_round_trip(&app, "good-code").await;
        assert!(res.status().is_redirection());
        assert_eq!(store.len().await, 1);

        let res = app
            .oneshot(get_with_bearer("/api/auth/verify", &token))
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn google_callback_failures_redirect_to_failure_route() {
        let app = build_app(AppState::fake().with_google(Arc::new(FakeGoogle)));

        let res = google_round_trip(&app, "bad-code").await;
        assert_eq!(
            res.headers()[header::LOCATION].to_str().unwrap(),
            "/api/auth/google/failure"
        );

        let res = app
            .clone()
            .oneshot(
                Request::builder()
                    .uri("/api/auth/google/callback?code=good-code&state=forged")
                    .header(header::COOKIE, "oauth_state=real")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(
            res.headers()[header::LOCATION].to_str().unwrap(),
            "/api/auth/google/failure"
        );

        let res = app
            .oneshot(
                Request::builder()
                    .uri("/api/auth/google/failure")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(json_body(res).await["error"], "google_login_failed");
    }

    #[tokio::test]
    async fn google_disabled_is_unavailable() {
        let app = build_app(AppState::fake());
        let res = app
            .oneshot(Request::builder().uri("/api/auth/google").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn jobs_require_a_session() {
        let app = build_app(AppState::fake());
        let res = app
            .oneshot(Request::builder().uri("/api/jobs").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::UNAUTHORIZED);
    }
}
