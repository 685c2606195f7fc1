#![allow(clippy::unwrap_used)]

mod common;

use anyhow::{Context, Result};
use axum::http::StatusCode;
use std::sync::Arc;

use common::{body_json, location, query_param, Harness, CLIENT_ID, KID, REDIRECT_URI};
use gatehouse::oauth::pkce;

const VERIFIER: &str = "dBjftJeZ4CVP-mJ92K1s3GZ6mhx4fmtlZEqY1Tq0kWA-gatehouse";

fn authorize_uri(state: &str) -> String {
    let challenge = pkce::challenge_s256(VERIFIER);
    let query = url::form_urlencoded::Serializer::new(String::new())
        .append_pair("response_type", "code")
        .append_pair("client_id", CLIENT_ID)
        .append_pair("redirect_uri", REDIRECT_URI)
        .append_pair("state", state)
        .append_pair("code_challenge", &challenge)
        .append_pair("code_challenge_method", "S256")
        .finish();
    format!("/oauth/authorize?{query}")
}

async fn issue_code(harness: &Harness, cookie: &str, state: &str) -> Result<String> {
    let response = harness.get(&authorize_uri(state), Some(cookie)).await?;
    assert_eq!(response.status(), StatusCode::SEE_OTHER);
    let redirect = location(&response).context("authorize redirect")?;
    assert!(redirect.as_str().starts_with(REDIRECT_URI));
    assert_eq!(query_param(&redirect, "state").as_deref(), Some(state));
    query_param(&redirect, "code").context("code in redirect")
}

async fn exchange(harness: &Harness, code: &str) -> Result<axum::response::Response> {
    harness
        .form(
            "/oauth/token",
            &[
                ("grant_type", "authorization_code"),
                ("code", code),
                ("redirect_uri", REDIRECT_URI),
                ("code_verifier", VERIFIER),
                ("client_id", CLIENT_ID),
            ],
        )
        .await
}

#[tokio::test]
async fn authorization_code_flow_with_pkce() -> Result<()> {
    let harness = Harness::new().await?;
    let user = harness.user("alice@example.com").await?;
    let cookie = harness.session_cookie(&user)?;

    let code = issue_code(&harness, &cookie, "xyz").await?;
    let response = exchange(&harness, &code).await?;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers().get("cache-control").map(|v| v.to_str().unwrap()),
        Some("no-store")
    );
    let tokens = body_json(response).await?;
    assert_eq!(tokens["token_type"], "Bearer");
    let access_token = tokens["access_token"].as_str().context("access token")?;
    assert!(tokens["refresh_token"].as_str().is_some());

    let claims = harness.services.verifier.verify(access_token).await?;
    assert_eq!(claims.sub, user.public_id);
    assert_eq!(claims.aud, CLIENT_ID);

    // Codes are single use.
    let replay = exchange(&harness, &code).await?;
    assert_eq!(replay.status(), StatusCode::BAD_REQUEST);
    assert_eq!(body_json(replay).await?["error"], "invalid_grant");
    Ok(())
}

#[tokio::test]
async fn wrong_verifier_is_rejected() -> Result<()> {
    let harness = Harness::new().await?;
    let user = harness.user("bob@example.com").await?;
    let cookie = harness.session_cookie(&user)?;
    let code = issue_code(&harness, &cookie, "s1").await?;

    let response = harness
        .form(
            "/oauth/token",
            &[
                ("grant_type", "authorization_code"),
                ("code", &code),
                ("redirect_uri", REDIRECT_URI),
                ("code_verifier", "another-verifier-that-is-long-enough-to-be-valid-0001"),
                ("client_id", CLIENT_ID),
            ],
        )
        .await?;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(body_json(response).await?["error"], "invalid_grant");
    Ok(())
}

#[tokio::test]
async fn anonymous_authorize_parks_request_until_sign_in() -> Result<()> {
    let harness = Harness::new().await?;
    let response = harness.get(&authorize_uri("later"), None).await?;
    assert_eq!(response.status(), StatusCode::SEE_OTHER);
    let login = location(&response).context("login redirect")?;
    assert_eq!(login.path(), "/login");
    let continuation = query_param(&login, "continuation").context("continuation")?;

    let resume_uri = format!("/oauth/authorize/continue?continuation={continuation}");
    let unauthenticated = harness.get(&resume_uri, None).await?;
    assert_eq!(unauthenticated.status(), StatusCode::UNAUTHORIZED);

    let user = harness.user("carol@example.com").await?;
    let cookie = harness.session_cookie(&user)?;
    let resumed = harness.get(&resume_uri, Some(&cookie)).await?;
    assert_eq!(resumed.status(), StatusCode::SEE_OTHER);
    let redirect = location(&resumed).context("client redirect")?;
    assert_eq!(query_param(&redirect, "state").as_deref(), Some("later"));
    assert!(query_param(&redirect, "code").is_some());
    Ok(())
}

#[tokio::test]
async fn unknown_redirect_uri_is_not_followed() -> Result<()> {
    let harness = Harness::new().await?;
    let user = harness.user("dave@example.com").await?;
    let cookie = harness.session_cookie(&user)?;
    let uri = format!(
        "/oauth/authorize?response_type=code&client_id={CLIENT_ID}&redirect_uri=https%3A%2F%2Fevil.example.com%2F&code_challenge={}&code_challenge_method=S256",
        pkce::challenge_s256(VERIFIER)
    );
    let response = harness.get(&uri, Some(&cookie)).await?;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert!(location(&response).is_none());
    Ok(())
}

#[tokio::test]
async fn refresh_rotates_and_revoke_invalidates() -> Result<()> {
    let harness = Harness::new().await?;
    let user = harness.user("erin@example.com").await?;
    let cookie = harness.session_cookie(&user)?;
    let code = issue_code(&harness, &cookie, "r").await?;
    let tokens = body_json(exchange(&harness, &code).await?).await?;
    let first = tokens["refresh_token"].as_str().context("refresh token")?.to_string();

    let rotated = harness
        .form(
            "/oauth/token",
            &[
                ("grant_type", "refresh_token"),
                ("refresh_token", &first),
                ("client_id", CLIENT_ID),
            ],
        )
        .await?;
    assert_eq!(rotated.status(), StatusCode::OK);
    let second = body_json(rotated).await?["refresh_token"]
        .as_str()
        .context("rotated token")?
        .to_string();
    assert_ne!(first, second);

    let revoked = harness
        .form("/oauth/revoke", &[("token", &second), ("client_id", CLIENT_ID)])
        .await?;
    assert_eq!(revoked.status(), StatusCode::OK);

    let after = harness
        .form(
            "/oauth/token",
            &[
                ("grant_type", "refresh_token"),
                ("refresh_token", &second),
                ("client_id", CLIENT_ID),
            ],
        )
        .await?;
    assert_eq!(after.status(), StatusCode::BAD_REQUEST);
    Ok(())
}

#[tokio::test]
async fn deactivated_user_cannot_refresh() -> Result<()> {
    let harness = Harness::new().await?;
    let user = harness.user("gail@example.com").await?;
    let cookie = harness.session_cookie(&user)?;
    let code = issue_code(&harness, &cookie, "d").await?;
    let tokens = body_json(exchange(&harness, &code).await?).await?;
    let refresh_token = tokens["refresh_token"].as_str().context("refresh token")?.to_string();

    let admin = harness.superadmin("root@example.com").await?;
    let admin_cookie = harness.session_cookie(&admin)?;
    let deactivated = harness
        .json(
            "PUT",
            &format!("/admin/users/{}/active", user.public_id),
            Some(&admin_cookie),
            &serde_json::json!({ "active": false }),
        )
        .await?;
    assert_eq!(deactivated.status(), StatusCode::NO_CONTENT);

    let refreshed = harness
        .form(
            "/oauth/token",
            &[
                ("grant_type", "refresh_token"),
                ("refresh_token", &refresh_token),
                ("client_id", CLIENT_ID),
            ],
        )
        .await?;
    assert_eq!(refreshed.status(), StatusCode::BAD_REQUEST);
    assert_eq!(body_json(refreshed).await?["error"], "invalid_grant");

    // The old session no longer resolves either.
    let session = harness.get("/auth/session", Some(&cookie)).await?;
    assert_ne!(session.status(), StatusCode::OK);
    Ok(())
}

#[tokio::test]
async fn concurrent_refreshes_share_one_rotation() -> Result<()> {
    let harness = Arc::new(Harness::new().await?);
    let user = harness.user("frank@example.com").await?;
    let cookie = harness.session_cookie(&user)?;
    let code = issue_code(&harness, &cookie, "c").await?;
    let tokens = body_json(exchange(&harness, &code).await?).await?;
    let refresh = tokens["refresh_token"].as_str().context("refresh token")?.to_string();

    let mut handles = Vec::new();
    for _ in 0..4 {
        let harness = harness.clone();
        let refresh = refresh.clone();
        handles.push(tokio::spawn(async move {
            let response = harness
                .form(
                    "/oauth/token",
                    &[
                        ("grant_type", "refresh_token"),
                        ("refresh_token", &refresh),
                        ("client_id", CLIENT_ID),
                    ],
                )
                .await?;
            anyhow::ensure!(response.status() == StatusCode::OK, "refresh failed");
            body_json(response).await
        }));
    }

    let mut issued = Vec::new();
    for handle in handles {
        let body = handle.await??;
        issued.push(body["refresh_token"].as_str().unwrap().to_string());
    }
    issued.dedup();
    assert_eq!(issued.len(), 1, "every caller sees the same rotation");
    Ok(())
}

#[tokio::test]
async fn unsupported_grant_type() -> Result<()> {
    let harness = Harness::new().await?;
    let response = harness
        .form(
            "/oauth/token",
            &[("grant_type", "password"), ("client_id", CLIENT_ID)],
        )
        .await?;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(body_json(response).await?["error"], "unsupported_grant_type");
    Ok(())
}

#[tokio::test]
async fn jwks_endpoint_publishes_signing_key() -> Result<()> {
    let harness = Harness::new().await?;
    let response = harness.get("/.well-known/jwks.json", None).await?;
    assert_eq!(response.status(), StatusCode::OK);
    let jwks = body_json(response).await?;
    let keys = jwks["keys"].as_array().context("keys")?;
    assert_eq!(keys.len(), 1);
    assert_eq!(keys[0]["kid"], KID);
    assert_eq!(keys[0]["kty"], "RSA");
    assert_eq!(keys[0]["alg"], "RS256");
    Ok(())
}
