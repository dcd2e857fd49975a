//! Header parsing shared by the handlers.

use axum::http::{
    HeaderMap,
    header::{AUTHORIZATION, COOKIE},
};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;

use crate::oauth2::{ClientCredentials, OAuthError};

/// Extract a client IP for rate limiting from common proxy headers.
pub(crate) fn extract_client_ip(headers: &HeaderMap) -> Option<String> {
    let forwarded = headers
        .get("x-forwarded-for")
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.split(',').next())
        .map(str::trim)
        .filter(|value| !value.is_empty());
    if forwarded.is_some() {
        return forwarded.map(str::to_string);
    }
    headers
        .get("x-real-ip")
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
}

pub(crate) fn extract_bearer_token(headers: &HeaderMap) -> Option<String> {
    let value = headers.get(AUTHORIZATION)?.to_str().ok()?;
    let trimmed = value.trim();
    let token = trimmed
        .strip_prefix("Bearer ")
        .or_else(|| trimmed.strip_prefix("bearer "))?
        .trim();
    if token.is_empty() {
        None
    } else {
        Some(token.to_string())
    }
}

pub(crate) fn extract_cookie(headers: &HeaderMap, name: &str) -> Option<String> {
    for header in headers.get_all(COOKIE) {
        let Ok(value) = header.to_str() else {
            continue;
        };
        for pair in value.split(';') {
            let mut parts = pair.trim().splitn(2, '=');
            let (Some(key), Some(val)) = (parts.next(), parts.next()) else {
                continue;
            };
            if key.trim() == name && !val.trim().is_empty() {
                return Some(val.trim().to_string());
            }
        }
    }
    None
}

/// Client id and secret are form-urlencoded before they go into the Basic
/// header (RFC 6749 §2.3.1).
fn form_decode(value: &str) -> String {
    if value.contains('&') || value.contains('=') {
        return value.to_string();
    }
    url::form_urlencoded::parse(value.as_bytes())
        .next()
        .map_or_else(String::new, |(decoded, _)| decoded.into_owned())
}

fn basic_credentials(headers: &HeaderMap) -> Result<Option<ClientCredentials>, OAuthError> {
    let Some(value) = headers.get(AUTHORIZATION).and_then(|value| value.to_str().ok()) else {
        return Ok(None);
    };
    let trimmed = value.trim();
    let Some(encoded) = trimmed
        .strip_prefix("Basic ")
        .or_else(|| trimmed.strip_prefix("basic "))
    else {
        return Ok(None);
    };
    let invalid = || OAuthError::InvalidClient("malformed Basic credentials".to_string());
    let decoded = STANDARD.decode(encoded.trim()).map_err(|_| invalid())?;
    let decoded = String::from_utf8(decoded).map_err(|_| invalid())?;
    let (client_id, secret) = decoded.split_once(':').ok_or_else(invalid)?;
    Ok(Some(ClientCredentials {
        client_id: form_decode(client_id),
        client_secret: Some(form_decode(secret)),
    }))
}

/// Client credentials from the Basic header or, failing that, the form body.
///
/// # Errors
/// `invalid_request` when both methods are used, `invalid_client` for a
/// malformed header.
pub(crate) fn client_credentials(
    headers: &HeaderMap,
    form_client_id: Option<&str>,
    form_client_secret: Option<&str>,
) -> Result<ClientCredentials, OAuthError> {
    if let Some(credentials) = basic_credentials(headers)? {
        if form_client_secret.is_some() {
            return Err(OAuthError::InvalidRequest(
                "use only one client authentication method".to_string(),
            ));
        }
        if form_client_id.is_some_and(|id| id != credentials.client_id) {
            return Err(OAuthError::InvalidClient(
                "client_id does not match credentials".to_string(),
            ));
        }
        return Ok(credentials);
    }
    Ok(ClientCredentials {
        client_id: form_client_id.unwrap_or_default().to_string(),
        client_secret: form_client_secret
            .filter(|secret| !secret.is_empty())
            .map(str::to_string),
    })
}

/// Treat empty form fields as absent.
pub(crate) fn non_empty(value: Option<&String>) -> Option<&str> {
    value.map(|value| value.trim()).filter(|value| !value.is_empty())
}
