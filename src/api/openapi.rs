use super::handlers::{admin, codes, health, oauth, providers, session};
use utoipa::openapi::{
    tag::TagBuilder, ContactBuilder, InfoBuilder, LicenseBuilder, OpenApiBuilder, Tag,
};
use utoipa_axum::{router::OpenApiRouter, routes};

#[must_use]
pub fn openapi() -> utoipa::openapi::OpenApi {
    let (_router, openapi) = api_router().split_for_parts();
    openapi
}

/// Build the router that also drives the `OpenAPI` document.
///
/// Handlers sharing a path are registered in one `routes!` call.
pub(crate) fn api_router() -> OpenApiRouter {
    let mut router = OpenApiRouter::with_openapi(cargo_openapi())
        .routes(routes!(health::health))
        .routes(routes!(oauth::authorize))
        .routes(routes!(oauth::authorize_continue))
        .routes(routes!(oauth::token))
        .routes(routes!(oauth::revoke))
        .routes(routes!(oauth::jwks))
        .routes(routes!(session::session))
        .routes(routes!(session::logout))
        .routes(routes!(session::refresh))
        .routes(routes!(providers::login))
        .routes(routes!(providers::callback))
        .routes(routes!(codes::request_otp))
        .routes(routes!(codes::verify_otp))
        .routes(routes!(codes::verify_email))
        .routes(routes!(codes::resend_verification))
        .routes(routes!(admin::list_roles, admin::create_role))
        .routes(routes!(admin::get_role, admin::update_role, admin::delete_role))
        .routes(routes!(
            admin::role_permissions,
            admin::assign_role_permissions,
            admin::remove_role_permissions
        ))
        .routes(routes!(admin::list_permissions, admin::create_permission))
        .routes(routes!(
            admin::get_permission,
            admin::update_permission,
            admin::delete_permission
        ))
        .routes(routes!(
            admin::user_roles,
            admin::assign_user_roles,
            admin::remove_user_roles
        ))
        .routes(routes!(
            admin::user_permissions,
            admin::assign_user_permissions,
            admin::remove_user_permissions
        ))
        .routes(routes!(admin::set_user_active))
        .routes(routes!(admin::user_projects))
        .routes(routes!(admin::project_members))
        .routes(routes!(admin::add_project_member, admin::remove_project_member))
        .routes(routes!(admin::list_clients, admin::create_client))
        .routes(routes!(admin::get_client, admin::update_client, admin::delete_client))
        .routes(routes!(admin::rotate_client_secret))
        .routes(routes!(admin::list_providers))
        .routes(routes!(admin::get_provider, admin::upsert_provider))
        .routes(routes!(admin::set_provider_enabled));

    router.get_openapi_mut().tags = Some(vec![
        tag("oauth", "OAuth2 authorization code flow with PKCE"),
        tag("auth", "Sessions, federated sign-in and one-time codes"),
        tag("admin", "Roles, permissions, clients and providers"),
        tag("health", "Liveness and storage reachability"),
    ]);

    router
}

fn tag(name: &str, description: &str) -> Tag {
    TagBuilder::new()
        .name(name)
        .description(Some(description))
        .build()
}

/// Document metadata taken from the package manifest.
fn cargo_openapi() -> utoipa::openapi::OpenApi {
    let license = non_empty(env!("CARGO_PKG_LICENSE")).map(|spdx| {
        LicenseBuilder::new()
            .name(spdx)
            .identifier(Some(spdx))
            .build()
    });
    // First entry of the `;` separated authors list, as "Name <email>".
    let contact = env!("CARGO_PKG_AUTHORS")
        .split(';')
        .map(parse_author)
        .find(|(name, email)| name.is_some() || email.is_some())
        .map(|(name, email)| ContactBuilder::new().name(name).email(email).build());

    let info = InfoBuilder::new()
        .title(env!("CARGO_PKG_NAME"))
        .version(env!("CARGO_PKG_VERSION"))
        .description(non_empty(env!("CARGO_PKG_DESCRIPTION")))
        .contact(contact)
        .license(license)
        .build();

    OpenApiBuilder::new().info(info).build()
}

fn non_empty(value: &str) -> Option<&str> {
    Some(value.trim()).filter(|value| !value.is_empty())
}

fn parse_author(author: &str) -> (Option<&str>, Option<&str>) {
    match author.split_once('<') {
        Some((name, email)) => (non_empty(name), non_empty(email.trim_end_matches(['>', ' ']))),
        None => (non_empty(author), None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn openapi_info_from_cargo() {
        let spec = openapi();
        assert_eq!(spec.info.title, env!("CARGO_PKG_NAME"));
        assert_eq!(spec.info.version, env!("CARGO_PKG_VERSION"));

        let contact = spec.info.contact;
        assert!(contact.is_some());
        if let Some(contact) = contact {
            assert_eq!(contact.name.as_deref(), Some("Team Gatehouse"));
            assert_eq!(contact.email.as_deref(), Some("team@gatehouse.dev"));
        }

        let license = spec.info.license;
        assert!(license.is_some());
        if let Some(license) = license {
            assert_eq!(license.identifier.as_deref(), Some("BSD-3-Clause"));
        }
    }

    #[test]
    fn openapi_tags_and_paths() {
        let spec = openapi();
        let tags = spec.tags.clone().unwrap_or_default();
        for name in ["oauth", "auth", "admin", "health"] {
            assert!(tags.iter().any(|tag| tag.name == name), "missing tag {name}");
        }
        for path in [
            "/oauth/authorize",
            "/oauth/token",
            "/.well-known/jwks.json",
            "/auth/providers/{provider}/callback",
            "/auth/otp/verify",
            "/admin/roles/{id}",
            "/admin/users/{user}/active",
        ] {
            assert!(spec.paths.paths.contains_key(path), "missing path {path}");
        }
    }

    #[test]
    fn author_parsing() {
        assert_eq!(
            parse_author("Ada <ada@example.com>"),
            (Some("Ada"), Some("ada@example.com"))
        );
        assert_eq!(parse_author("Ada"), (Some("Ada"), None));
        assert_eq!(parse_author("<ada@example.com>"), (None, Some("ada@example.com")));
    }
}
