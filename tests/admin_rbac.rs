#![allow(clippy::unwrap_used)]

mod common;

use anyhow::{Context, Result};
use axum::http::StatusCode;
use serde_json::json;

use common::{body_json, Harness};

#[tokio::test]
async fn admin_routes_require_a_principal() -> Result<()> {
    let harness = Harness::new().await?;
    let response = harness.get("/admin/roles", None).await?;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    Ok(())
}

#[tokio::test]
async fn users_without_grants_are_forbidden() -> Result<()> {
    let harness = Harness::new().await?;
    let user = harness.user("plain@example.com").await?;
    let cookie = harness.session_cookie(&user)?;

    let response = harness.get("/admin/roles", Some(&cookie)).await?;
    assert_eq!(response.status(), StatusCode::FORBIDDEN);

    let response = harness
        .json("POST", "/admin/roles", Some(&cookie), &json!({ "name": "editor" }))
        .await?;
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
    Ok(())
}

#[tokio::test]
async fn built_ins_cannot_be_deleted() -> Result<()> {
    let harness = Harness::new().await?;
    let admin = harness.superadmin("root@example.com").await?;
    let cookie = harness.session_cookie(&admin)?;

    let roles = body_json(harness.get("/admin/roles", Some(&cookie)).await?).await?;
    let superadmin = roles
        .as_array()
        .context("role list")?
        .iter()
        .find(|role| role["name"] == "superadmin")
        .context("superadmin listed")?;
    let id = superadmin["id"].as_str().context("role id")?;
    let response = harness
        .json("DELETE", &format!("/admin/roles/{id}"), Some(&cookie), &json!({}))
        .await?;
    assert_eq!(response.status(), StatusCode::CONFLICT);

    let permissions = body_json(harness.get("/admin/permissions", Some(&cookie)).await?).await?;
    let root = permissions
        .as_array()
        .context("permission list")?
        .iter()
        .find(|permission| permission["name"] == "root")
        .context("root listed")?;
    let id = root["id"].as_str().context("permission id")?;
    let response = harness
        .json("DELETE", &format!("/admin/permissions/{id}"), Some(&cookie), &json!({}))
        .await?;
    assert_eq!(response.status(), StatusCode::CONFLICT);
    Ok(())
}

#[tokio::test]
async fn granted_permission_opens_reads_only() -> Result<()> {
    let harness = Harness::new().await?;
    let admin = harness.superadmin("root@example.com").await?;
    let admin_cookie = harness.session_cookie(&admin)?;

    let created = harness
        .json(
            "POST",
            "/admin/permissions",
            Some(&admin_cookie),
            &json!({ "name": "role:read", "description": "List roles" }),
        )
        .await?;
    assert_eq!(created.status(), StatusCode::CREATED);
    let permission = body_json(created).await?;
    let permission_id = permission["id"].as_str().context("permission id")?.to_string();

    let duplicate = harness
        .json(
            "POST",
            "/admin/permissions",
            Some(&admin_cookie),
            &json!({ "name": "role:read" }),
        )
        .await?;
    assert_eq!(duplicate.status(), StatusCode::CONFLICT);

    let auditor = harness.user("auditor@example.com").await?;
    let granted = harness
        .json(
            "POST",
            &format!("/admin/users/{}/permissions", auditor.public_id),
            Some(&admin_cookie),
            &json!({ "ids": [permission_id] }),
        )
        .await?;
    assert_eq!(granted.status(), StatusCode::NO_CONTENT);

    let auditor_cookie = harness.session_cookie(&auditor)?;
    let listed = harness.get("/admin/roles", Some(&auditor_cookie)).await?;
    assert_eq!(listed.status(), StatusCode::OK);

    let write = harness
        .json(
            "POST",
            "/admin/roles",
            Some(&auditor_cookie),
            &json!({ "name": "editor" }),
        )
        .await?;
    assert_eq!(write.status(), StatusCode::FORBIDDEN);
    Ok(())
}

#[tokio::test]
async fn invalid_role_names_are_rejected() -> Result<()> {
    let harness = Harness::new().await?;
    let admin = harness.superadmin("root@example.com").await?;
    let cookie = harness.session_cookie(&admin)?;

    let response = harness
        .json("POST", "/admin/roles", Some(&cookie), &json!({ "name": "Not Valid!" }))
        .await?;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let response = harness
        .json("POST", "/admin/roles", Some(&cookie), &json!({ "name": "editor" }))
        .await?;
    assert_eq!(response.status(), StatusCode::CREATED);
    assert_eq!(body_json(response).await?["name"], "editor");
    Ok(())
}

#[tokio::test]
async fn client_secrets_are_shown_once() -> Result<()> {
    let harness = Harness::new().await?;
    let admin = harness.superadmin("root@example.com").await?;
    let cookie = harness.session_cookie(&admin)?;

    let created = harness
        .json(
            "POST",
            "/admin/clients",
            Some(&cookie),
            &json!({
                "client_id": "backend",
                "name": "Backend",
                "confidential": true,
                "redirect_uris": ["https://backend.example.com/cb"]
            }),
        )
        .await?;
    assert_eq!(created.status(), StatusCode::CREATED);
    let client = body_json(created).await?;
    assert!(client["client_secret"].as_str().is_some());
    let id = client["id"].as_str().context("client id")?;

    let fetched = body_json(
        harness
            .get(&format!("/admin/clients/{id}"), Some(&cookie))
            .await?,
    )
    .await?;
    assert!(fetched.get("client_secret").is_none());
    Ok(())
}
