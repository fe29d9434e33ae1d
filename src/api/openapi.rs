use super::handlers::{admin, auth, health, jwks};
use utoipa::openapi::{Contact, InfoBuilder, License, OpenApiBuilder, Tag};
use utoipa_axum::{router::OpenApiRouter, routes};

/// Full document, admin routes included, for the `openapi` binary.
#[must_use]
pub fn openapi() -> utoipa::openapi::OpenApi {
    let (_router, openapi) = api_router().merge(admin_router()).split_for_parts();
    openapi
}

/// Public routes: login, token lifecycle, JWKS and health.
///
/// Add new endpoints here via `.routes(routes!(...))` so they are both served
/// and included in the generated `OpenAPI` spec.
pub(crate) fn api_router() -> OpenApiRouter {
    let mut router = OpenApiRouter::with_openapi(cargo_openapi())
        .routes(routes!(health::health))
        .routes(routes!(jwks::jwks))
        .routes(routes!(auth::login))
        .routes(routes!(auth::refresh))
        .routes(routes!(auth::verify))
        .routes(routes!(auth::revoke))
        .routes(routes!(auth::revoke_refresh))
        .routes(routes!(auth::logout));

    router.get_openapi_mut().tags = Some(vec![
        tag("auth", "Login and token lifecycle"),
        tag("jwks", "Published verification keys"),
        tag("health", "Service and store reachability"),
        tag("admin", "Signing-key administration"),
    ]);

    router
}

/// Admin routes; mounted only when an admin token is configured.
pub(crate) fn admin_router() -> OpenApiRouter {
    OpenApiRouter::new()
        .routes(routes!(admin::create_key, admin::list_keys))
        .routes(routes!(admin::get_key))
        .routes(routes!(admin::enter_grace))
        .routes(routes!(admin::retire))
        .routes(routes!(admin::force_retire))
        .routes(routes!(admin::cleanup))
        .routes(routes!(admin::rotate))
        .routes(routes!(admin::rotation_status))
}

fn tag(name: &str, description: &str) -> Tag {
    let mut tag = Tag::new(name);
    tag.description = Some(description.to_string());
    tag
}

fn cargo_openapi() -> utoipa::openapi::OpenApi {
    // Use Cargo.toml metadata instead of the utoipa-axum crate info defaults.
    let mut info = InfoBuilder::new()
        .title(env!("CARGO_PKG_NAME"))
        .version(env!("CARGO_PKG_VERSION"))
        .description(optional_str(env!("CARGO_PKG_DESCRIPTION")))
        .build();

    info.contact = cargo_contact();
    info.license = cargo_license();

    OpenApiBuilder::new().info(info).build()
}

fn cargo_contact() -> Option<Contact> {
    // Cargo authors are `;` separated and may include "Name <email>".
    let primary = env!("CARGO_PKG_AUTHORS").split(';').next().map(str::trim)?;
    if primary.is_empty() {
        return None;
    }

    let (name, email) = parse_author(primary);
    if name.is_none() && email.is_none() {
        return None;
    }

    let mut contact = Contact::new();
    contact.name = name.map(str::to_string);
    contact.email = email.map(str::to_string);
    Some(contact)
}

fn cargo_license() -> Option<License> {
    let identifier = optional_str(env!("CARGO_PKG_LICENSE"))?;
    let mut license = License::new(identifier);
    license.identifier = Some(identifier.to_string());
    Some(license)
}

fn optional_str(value: &'static str) -> Option<&'static str> {
    Some(value.trim()).filter(|trimmed| !trimmed.is_empty())
}

fn parse_author(author: &str) -> (Option<&str>, Option<&str>) {
    match author.split_once('<') {
        Some((name, email)) => (
            Some(name.trim()).filter(|name| !name.is_empty()),
            Some(email.trim_end_matches('>').trim()).filter(|email| !email.is_empty()),
        ),
        None => (Some(author.trim()).filter(|name| !name.is_empty()), None),
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
        assert_eq!(
            spec.info.description.as_deref(),
            Some(env!("CARGO_PKG_DESCRIPTION"))
        );

        let contact = spec.info.contact;
        assert!(contact.is_some());
        if let Some(contact) = contact {
            assert_eq!(contact.name.as_deref(), Some("Team Permesi"));
            assert_eq!(contact.email.as_deref(), Some("team@permesi.dev"));
        }

        let license = spec.info.license;
        assert!(license.is_some());
        if let Some(license) = license {
            assert_eq!(license.name, "BSD-3-Clause");
        }
    }

    #[test]
    fn openapi_lists_public_and_admin_paths() {
        let spec = openapi();
        let tags = spec.tags.clone().unwrap_or_default();
        assert!(tags.iter().any(|tag| tag.name == "auth"));
        for path in [
            "/v1/auth/login",
            "/v1/auth/logout",
            "/.well-known/jwks.json",
            "/v1/admin/keys",
            "/v1/admin/keys/{kid}/force-retire",
            "/v1/admin/keys/rotation",
        ] {
            assert!(spec.paths.paths.contains_key(path), "missing {path}");
        }
    }

    #[test]
    fn author_parsing() {
        assert_eq!(
            parse_author("Jane <jane@example.com>"),
            (Some("Jane"), Some("jane@example.com"))
        );
        assert_eq!(parse_author("Jane"), (Some("Jane"), None));
        assert_eq!(parse_author("<a@b.c>"), (None, Some("a@b.c")));
    }
}
