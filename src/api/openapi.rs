use super::handlers::{auth, health, me, oauth2};
use utoipa::openapi::{Contact, InfoBuilder, License, OpenApiBuilder, Tag};
use utoipa_axum::{router::OpenApiRouter, routes};

#[must_use]
pub fn openapi() -> utoipa::openapi::OpenApi {
    let (_router, openapi) = api_router().split_for_parts();
    openapi
}

/// Build the router that also drives the `OpenAPI` document.
///
/// Add new endpoints here via `.routes(routes!(...))` so they are both served
/// and included in the generated `OpenAPI` document.
pub(crate) fn api_router() -> OpenApiRouter {
    let mut router = OpenApiRouter::with_openapi(cargo_openapi())
        .routes(routes!(health::health))
        .routes(routes!(oauth2::discovery::openid_configuration))
        .routes(routes!(oauth2::discovery::jwks))
        .routes(routes!(oauth2::authorize::authorize))
        .routes(routes!(oauth2::token::token))
        .routes(routes!(oauth2::revoke::revoke))
        .routes(routes!(oauth2::revoke::introspect))
        .routes(routes!(oauth2::userinfo::userinfo))
        .routes(routes!(auth::login::login))
        .routes(routes!(auth::mfa::verify))
        .routes(routes!(auth::mfa::challenge))
        .routes(routes!(auth::session::session))
        .routes(routes!(auth::session::logout))
        .routes(routes!(me::list_devices))
        .routes(routes!(me::register_totp))
        .routes(routes!(me::register_out_of_band))
        .routes(routes!(me::register_hardware_key))
        .routes(routes!(me::confirm_device))
        .routes(routes!(me::remove_device))
        .routes(routes!(me::set_default_device))
        .routes(routes!(me::set_mfa));

    let mut health_tag = Tag::new("health");
    health_tag.description = Some("Liveness and database reachability".to_string());

    let mut oauth2_tag = Tag::new("oauth2");
    oauth2_tag.description = Some("OAuth2 and OpenID Connect endpoints".to_string());

    let mut auth_tag = Tag::new("auth");
    auth_tag.description = Some("Password login, MFA step-up and sessions".to_string());

    let mut devices_tag = Tag::new("devices");
    devices_tag.description = Some("Second-factor device management".to_string());

    router.get_openapi_mut().tags = Some(vec![health_tag, oauth2_tag, auth_tag, devices_tag]);

    router
}

fn cargo_openapi() -> utoipa::openapi::OpenApi {
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
    let authors = env!("CARGO_PKG_AUTHORS");
    let primary = authors.split(';').next().map(str::trim)?;
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
    let trimmed = value.trim();
    (!trimmed.is_empty()).then_some(trimmed)
}

fn parse_author(author: &str) -> (Option<&str>, Option<&str>) {
    fn non_empty(value: &str) -> Option<&str> {
        (!value.is_empty()).then_some(value)
    }
    match author.find('<') {
        Some(start) => (
            non_empty(author[..start].trim()),
            non_empty(author[start + 1..].trim_end_matches('>').trim()),
        ),
        None => (non_empty(author.trim()), None),
    }
}
