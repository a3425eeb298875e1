use super::handlers::{auth, health, me, phi};
use utoipa::openapi::{Contact, InfoBuilder, License, OpenApiBuilder, Tag};
use utoipa_axum::{router::OpenApiRouter, routes};

/// The OpenAPI document for the routes served by [`api_router`].
#[must_use]
pub fn openapi() -> utoipa::openapi::OpenApi {
    api_router().split_for_parts().1
}

/// Build the router that also drives the `OpenAPI` document.
///
/// Every endpoint is registered through `routes!`, which reads the
/// handler's `#[utoipa::path]` attribute, so serving a route and
/// documenting it are a single step.
pub(crate) fn api_router() -> OpenApiRouter {
    let mut openapi = cargo_openapi();
    openapi.tags = Some(vec![
        tag("auth", "Login, logout, reset, and invitations"),
        tag("mfa", "Passkey setup and second-factor verification"),
        tag("me", "Authenticated profile"),
        tag("phi", "Audited PHI access decisions"),
    ]);

    OpenApiRouter::with_openapi(openapi)
        .routes(routes!(health::health))
        .routes(routes!(auth::login::login))
        .routes(routes!(auth::login::logout))
        .routes(routes!(auth::mfa::setup))
        .routes(routes!(auth::mfa::setup_confirm))
        .routes(routes!(auth::mfa::verify_passkey))
        .routes(routes!(auth::mfa::verify_backup_code))
        .routes(routes!(auth::mfa::regenerate_backup_codes))
        .routes(routes!(auth::reset::password_reset_request))
        .routes(routes!(auth::reset::password_reset_confirm))
        .routes(routes!(auth::reset::invitation_accept))
        .routes(routes!(me::get_me))
        .routes(routes!(phi::phi_decision))
}

fn tag(name: &str, description: &str) -> Tag {
    let mut tag = Tag::new(name);
    tag.description = Some(description.to_string());
    tag
}

/// Seed the document info from Cargo.toml metadata rather than the
/// utoipa-axum defaults.
fn cargo_openapi() -> utoipa::openapi::OpenApi {
    let mut info = InfoBuilder::new()
        .title(env!("CARGO_PKG_NAME"))
        .version(env!("CARGO_PKG_VERSION"))
        .description(non_empty(env!("CARGO_PKG_DESCRIPTION")))
        .build();

    info.contact = cargo_contact();
    info.license = non_empty(env!("CARGO_PKG_LICENSE")).map(|identifier| {
        let mut license = License::new(identifier);
        license.identifier = Some(identifier.to_string());
        license
    });

    OpenApiBuilder::new().info(info).build()
}

/// First Cargo author, split into name and optional `<email>` part.
fn cargo_contact() -> Option<Contact> {
    let primary = env!("CARGO_PKG_AUTHORS").split(';').next()?.trim();

    let (name, email) = match primary.split_once('<') {
        Some((name, rest)) => (name.trim(), rest.trim_end_matches('>').trim()),
        None => (primary, ""),
    };
    if name.is_empty() && email.is_empty() {
        return None;
    }

    let mut contact = Contact::new();
    contact.name = non_empty(name).map(str::to_string);
    contact.email = non_empty(email).map(str::to_string);
    Some(contact)
}

fn non_empty(value: &str) -> Option<&str> {
    let trimmed = value.trim();
    (!trimmed.is_empty()).then_some(trimmed)
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

        let license = spec.info.license.expect("license from Cargo.toml");
        assert_eq!(license.name, "BSD-3-Clause");

        let contact = spec.info.contact.expect("contact from Cargo.toml");
        assert_eq!(contact.name.as_deref(), Some("Team Zorgi"));
        assert_eq!(contact.email.as_deref(), Some("team@zorgi.care"));
    }

    #[test]
    fn openapi_tags_and_paths() {
        let spec = openapi();
        let tags = spec.tags.clone().unwrap_or_default();
        assert!(tags.iter().any(|tag| tag.name == "auth"));
        assert!(tags.iter().any(|tag| tag.name == "mfa"));
        assert!(tags.iter().any(|tag| tag.name == "me"));
        assert!(tags.iter().any(|tag| tag.name == "phi"));
        assert!(spec.paths.paths.contains_key("/v1/me"));
        assert!(spec.paths.paths.contains_key("/v1/login"));
        assert!(spec.paths.paths.contains_key("/v1/mfa/verify-backup-code"));
        assert!(spec.paths.paths.contains_key("/v1/phi/decision"));
    }
}
