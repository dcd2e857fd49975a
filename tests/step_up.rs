mod common;

use anyhow::{Context, Result};
use axum::{
    body::Body,
    http::{Request, StatusCode, header},
};
use common::{
    PASSWORD, SPA_REDIRECT, TestApp, field, json_body, location, query_param, session_cookie,
    totp_code,
};
use base64::{Engine, engine::general_purpose::URL_SAFE_NO_PAD};
use serde_json::json;
use sso::{
    mfa::{Device, DeviceKind},
    oauth2::pkce::s256,
};

fn totp_state(device: &Device) -> Result<(i64, i64)> {
    match &device.kind {
        DeviceKind::Totp(params) => Ok((params.last_t, params.drift)),
        _ => anyhow::bail!("not a TOTP device"),
    }
}

async fn start_login(app: &TestApp, username: &str) -> Result<serde_json::Value> {
    let response = app
        .post_form(
            "/v1/auth/login",
            &[("identifier", username), ("password", PASSWORD)],
        )
        .await?;
    assert_eq!(response.status(), StatusCode::OK);
    assert!(response.headers().get(header::SET_COOKIE).is_none());
    let body = json_body(response).await?;
    assert_eq!(field(&body, "status")?, "challenge");
    Ok(body)
}

#[tokio::test]
async fn totp_step_up_binds_the_device_to_the_session() -> Result<()> {
    let app = TestApp::new().await?;
    let user = app.add_user("bob").await?;
    let device = app.add_totp_device(user.id).await?;

    let challenge = start_login(&app, "bob").await?;
    let state = field(&challenge, "state")?.to_string();
    assert_eq!(challenge["material"]["kind"], "none");

    let outside = totp_code(-2)?;
    let rejected = app
        .post_form("/v1/auth/mfa/verify", &[("state", &state), ("response", &outside)])
        .await?;
    assert_eq!(rejected.status(), StatusCode::UNAUTHORIZED);
    assert!(rejected.headers().get(header::SET_COOKIE).is_none());
    let stored = app.state.devices().get(user.id, device.id).await?;
    assert_eq!(totp_state(&stored)?, (-1, 0));

    let accepted = app
        .post_form("/v1/auth/mfa/verify", &[("state", &state), ("response", &totp_code(0)?)])
        .await?;
    assert_eq!(accepted.status(), StatusCode::OK);
    let cookie = session_cookie(&accepted).context("no session cookie")?;
    let (_, token) = cookie.split_once('=').context("malformed cookie")?;
    let claims = app.state.sessions().decode(token)?;
    assert_eq!(claims.sub, user.id);
    assert_eq!(claims.dev, Some(device.id));

    let stored = app.state.devices().get(user.id, device.id).await?;
    let (last_t, _) = totp_state(&stored)?;
    assert!(last_t >= 0);
    assert!(stored.last_used.is_some());
    Ok(())
}

#[tokio::test]
async fn accepted_code_cannot_be_replayed() -> Result<()> {
    let app = TestApp::new().await?;
    let user = app.add_user("bob").await?;
    app.add_totp_device(user.id).await?;
    let code = totp_code(0)?;

    let first = start_login(&app, "bob").await?;
    let ok = app
        .post_form(
            "/v1/auth/mfa/verify",
            &[("state", field(&first, "state")?), ("response", &code)],
        )
        .await?;
    assert_eq!(ok.status(), StatusCode::OK);

    let second = start_login(&app, "bob").await?;
    let replay = app
        .post_form(
            "/v1/auth/mfa/verify",
            &[("state", field(&second, "state")?), ("response", &code)],
        )
        .await?;
    assert_eq!(replay.status(), StatusCode::UNAUTHORIZED);
    Ok(())
}

#[tokio::test]
async fn tampered_login_state_is_rejected() -> Result<()> {
    let app = TestApp::new().await?;
    let user = app.add_user("bob").await?;
    app.add_totp_device(user.id).await?;
    let challenge = start_login(&app, "bob").await?;
    let mut state = field(&challenge, "state")?.to_string();
    state.push('x');

    let response = app
        .post_form("/v1/auth/mfa/verify", &[("state", &state), ("response", &totp_code(0)?)])
        .await?;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(field(&json_body(response).await?, "error")?, "login_expired");
    Ok(())
}

#[tokio::test]
async fn two_factor_acr_forces_step_up() -> Result<()> {
    let app = TestApp::new().await?;
    let user = app.add_user("carol").await?;
    let cookie = app.sign_in("carol").await?;
    let device = app.add_totp_device(user.id).await?;

    let uri = format!(
        "/authorize?{}",
        url::form_urlencoded::Serializer::new(String::new())
            .append_pair("response_type", "code")
            .append_pair("client_id", "spa")
            .append_pair("redirect_uri", SPA_REDIRECT)
            .append_pair("scope", "openid")
            .append_pair("code_challenge", &s256(&"v".repeat(43)))
            .append_pair("code_challenge_method", "S256")
            .append_pair("acr_values", "two_factor")
            .finish()
    );
    let response = app.get(&uri, Some(&cookie)).await?;
    assert_eq!(response.status(), StatusCode::SEE_OTHER);
    let login = location(&response)?;
    assert_eq!(login.path(), "/login");
    assert_eq!(query_param(&login, "two_factor").as_deref(), Some("1"));

    let challenge = start_login(&app, "carol").await?;
    let verified = app
        .post_form(
            "/v1/auth/mfa/verify",
            &[("state", field(&challenge, "state")?), ("response", &totp_code(0)?)],
        )
        .await?;
    let stepped_up = session_cookie(&verified).context("no session cookie")?;

    let response = app.get(&uri, Some(&stepped_up)).await?;
    assert_eq!(response.status(), StatusCode::SEE_OTHER);
    let redirect = location(&response)?;
    assert!(query_param(&redirect, "code").is_some());

    let code = query_param(&redirect, "code").context("no code")?;
    let verifier = "v".repeat(43);
    let response = app
        .post_form(
            "/token",
            &[
                ("grant_type", "authorization_code"),
                ("code", code.as_str()),
                ("redirect_uri", SPA_REDIRECT),
                ("code_verifier", verifier.as_str()),
                ("client_id", "spa"),
            ],
        )
        .await?;
    assert_eq!(response.status(), StatusCode::OK);
    let body = json_body(response).await?;
    let id_token = field(&body, "id_token")?;
    let payload = id_token.split('.').nth(1).context("malformed id_token")?;
    let claims: serde_json::Value = serde_json::from_slice(&URL_SAFE_NO_PAD.decode(payload)?)?;
    assert_eq!(claims["sub"], device.user_id.to_string());
    assert_eq!(claims["acr"], "two_factor");
    assert_eq!(claims["amr"], json!(["pwd", "otp", "mfa"]));
    Ok(())
}

#[tokio::test]
async fn devices_are_managed_through_the_session() -> Result<()> {
    let app = TestApp::new().await?;
    let user = app.add_user("dave").await?;
    let cookie = app.sign_in("dave").await?;

    let anonymous = app.get("/v1/me/devices", None).await?;
    assert_eq!(anonymous.status(), StatusCode::UNAUTHORIZED);

    let register = Request::builder()
        .method("POST")
        .uri("/v1/me/devices/out-of-band")
        .header(header::COOKIE, &cookie)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(
            json!({"name": "work phone", "target": "+15551234567"}).to_string(),
        ))?;
    let response = app.send(register).await?;
    assert_eq!(response.status(), StatusCode::CREATED);
    let body = json_body(response).await?;
    assert_eq!(body["material"]["kind"], "delivered");
    assert_eq!(body["device"]["confirmed"], false);
    let id = field(&body["device"], "id")?.to_string();

    let sms = app.outbox.lock().await.recv().await.context("no sms queued")?;
    assert_eq!(sms.to, "+15551234567");
    let code = sms.body.split_whitespace().next().context("empty sms")?.to_string();

    let enable_early = Request::builder()
        .method("PUT")
        .uri("/v1/me/mfa")
        .header(header::COOKIE, &cookie)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(json!({"enabled": true}).to_string()))?;
    assert_eq!(app.send(enable_early).await?.status(), StatusCode::CONFLICT);

    let confirm = Request::builder()
        .method("POST")
        .uri(format!("/v1/me/devices/{id}/confirm"))
        .header(header::COOKIE, &cookie)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(json!({"response": code}).to_string()))?;
    let response = app.send(confirm).await?;
    assert_eq!(response.status(), StatusCode::OK);
    let confirmed = json_body(response).await?;
    assert_eq!(confirmed["confirmed"], true);
    assert_eq!(confirmed["is_default"], true);

    let listed = json_body(app.get("/v1/me/devices", Some(&cookie)).await?).await?;
    assert_eq!(listed.as_array().map(Vec::len), Some(1));

    let other = app.add_user("eve").await?;
    let eve_cookie = app.sign_in("eve").await?;
    let steal = Request::builder()
        .method("DELETE")
        .uri(format!("/v1/me/devices/{id}"))
        .header(header::COOKIE, &eve_cookie)
        .body(Body::empty())?;
    assert_eq!(app.send(steal).await?.status(), StatusCode::NOT_FOUND);
    assert!(app.state.devices().list(other.id).await?.is_empty());

    let remove = Request::builder()
        .method("DELETE")
        .uri(format!("/v1/me/devices/{id}"))
        .header(header::COOKIE, &cookie)
        .body(Body::empty())?;
    assert_eq!(app.send(remove).await?.status(), StatusCode::NO_CONTENT);
    assert!(app.state.devices().list(user.id).await?.is_empty());
    Ok(())
}

#[tokio::test]
async fn two_factor_acr_without_a_device_fails_instead_of_looping() -> Result<()> {
    let app = TestApp::new().await?;
    app.add_user("frank").await?;
    let uri = format!(
        "/authorize?{}",
        url::form_urlencoded::Serializer::new(String::new())
            .append_pair("response_type", "code")
            .append_pair("client_id", "spa")
            .append_pair("redirect_uri", SPA_REDIRECT)
            .append_pair("scope", "openid")
            .append_pair("state", "af0ifjsldkj")
            .append_pair("code_challenge", &s256(&"v".repeat(43)))
            .append_pair("code_challenge_method", "S256")
            .append_pair("acr_values", "two_factor")
            .finish()
    );

    let anonymous = app.get(&uri, None).await?;
    assert_eq!(anonymous.status(), StatusCode::SEE_OTHER);
    let login = location(&anonymous)?;
    assert_eq!(query_param(&login, "two_factor").as_deref(), Some("1"));

    let signed_in = app
        .post_form(
            "/v1/auth/login",
            &[("identifier", "frank"), ("password", PASSWORD), ("two_factor", "1")],
        )
        .await?;
    assert_eq!(signed_in.status(), StatusCode::OK);
    let cookie = session_cookie(&signed_in).context("no session cookie")?;

    let response = app.get(&uri, Some(&cookie)).await?;
    assert_eq!(response.status(), StatusCode::SEE_OTHER);
    let redirect = location(&response)?;
    assert!(redirect.as_str().starts_with(SPA_REDIRECT));
    assert_eq!(query_param(&redirect, "error").as_deref(), Some("two_factor_required"));
    assert_eq!(query_param(&redirect, "state").as_deref(), Some("af0ifjsldkj"));
    assert!(query_param(&redirect, "code").is_none());
    Ok(())
}
