//! Postgres-backed store. Tables are created by `sql/schema.sql`.

use anyhow::{Context, anyhow};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Postgres, Row, Transaction, postgres::PgRow};
use std::collections::BTreeSet;
use tracing::{Instrument, Span};
use uuid::Uuid;

use super::{
    ClientStore, CodeStore, DeviceStore, PruneCutoffs, PruneReport, Store, StoreError, TokenStore,
};
use crate::mfa::device::{
    CounterUpdate, Device, DeviceKind, DeviceType, HardwareKeyParams, OutOfBandParams, Profile,
    TotpParams,
};
use crate::oauth2::client::{Client, ClientType};
use crate::oauth2::code::AuthorizationCode;
use crate::oauth2::pkce::PkceChallenge;
use crate::oauth2::scope::ScopeSet;
use crate::oauth2::token::{BearerRecord, RefreshRecord, RotateOutcome, RotateRequest};

fn query_span(operation: &'static str, statement: &'static str) -> Span {
    tracing::info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = operation,
        db.statement = statement
    )
}

#[derive(Clone, Debug)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    #[must_use]
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn begin(&self) -> Result<Transaction<'static, Postgres>, StoreError> {
        Ok(self
            .pool
            .begin()
            .await
            .context("failed to begin transaction")?)
    }
}

fn client_from_row(row: &PgRow) -> Result<Client, StoreError> {
    let client_type: String = row.try_get("client_type")?;
    let client_type = client_type
        .parse::<ClientType>()
        .map_err(|err| anyhow!("invalid client row: {err}"))?;
    let redirect_uris: Vec<String> = row.try_get("redirect_uris")?;
    let post_logout_redirect_uris: Vec<String> = row.try_get("post_logout_redirect_uris")?;
    let scopes: String = row.try_get("scopes")?;

    Ok(Client {
        client_id: row.try_get("client_id")?,
        name: row.try_get("name")?,
        secret_hash: row.try_get("secret_hash")?,
        client_type,
        redirect_uris: redirect_uris.into_iter().collect::<BTreeSet<_>>(),
        post_logout_redirect_uris: post_logout_redirect_uris.into_iter().collect(),
        scopes: ScopeSet::from_stored(&scopes),
        is_active: row.try_get("is_active")?,
        is_trustworthy: row.try_get("is_trustworthy")?,
        pkce_required: row.try_get("pkce_required")?,
        service_user: row.try_get("service_user")?,
    })
}

fn code_from_row(row: &PgRow) -> Result<AuthorizationCode, StoreError> {
    let scopes: String = row.try_get("scopes")?;
    let challenge: Option<String> = row.try_get("code_challenge")?;
    let method: Option<String> = row.try_get("code_challenge_method")?;
    let pkce = match challenge {
        Some(challenge) => Some(PkceChallenge {
            challenge,
            method: method
                .as_deref()
                .unwrap_or("plain")
                .parse()
                .map_err(|err| anyhow!("invalid code row: {err}"))?,
        }),
        None => None,
    };

    Ok(AuthorizationCode {
        id: row.try_get("id")?,
        code_hash: row.try_get("code_hash")?,
        client_id: row.try_get("client_id")?,
        user_id: row.try_get("user_id")?,
        redirect_uri: row.try_get("redirect_uri")?,
        scopes: ScopeSet::from_stored(&scopes),
        pkce,
        nonce: row.try_get("nonce")?,
        device_id: row.try_get("device_id")?,
        auth_time: row.try_get("auth_time")?,
        is_valid: row.try_get("is_valid")?,
        created_at: row.try_get("created_at")?,
    })
}

fn bearer_from_row(row: &PgRow) -> Result<BearerRecord, StoreError> {
    let scopes: String = row.try_get("scopes")?;
    Ok(BearerRecord {
        token_hash: row.try_get("token_hash")?,
        client_id: row.try_get("client_id")?,
        user_id: row.try_get("user_id")?,
        scopes: ScopeSet::from_stored(&scopes),
        device_id: row.try_get("device_id")?,
        family_id: row.try_get("family_id")?,
        auth_time: row.try_get("auth_time")?,
        created_at: row.try_get("created_at")?,
    })
}

fn device_from_row(row: &PgRow) -> Result<Device, StoreError> {
    let kind: String = row.try_get("kind")?;
    let kind = match DeviceType::from_str(&kind) {
        Some(DeviceType::Totp) => {
            let digits: i32 = row.try_get("digits")?;
            DeviceKind::Totp(TotpParams {
                key: row.try_get("secret")?,
                step: row.try_get("step")?,
                t0: row.try_get("t0")?,
                digits: u32::try_from(digits).context("invalid totp digits")?,
                tolerance: row.try_get("tolerance")?,
                drift: row.try_get("drift")?,
                last_t: row.try_get("last_t")?,
            })
        }
        Some(DeviceType::OutOfBand) => DeviceKind::OutOfBand(OutOfBandParams {
            target: row.try_get("target")?,
            key: row.try_get("secret")?,
            last_t: row.try_get("last_t")?,
        }),
        Some(DeviceType::HardwareKey) => DeviceKind::HardwareKey(HardwareKeyParams {
            public_key: row.try_get("public_key")?,
            key_handle: row.try_get("key_handle")?,
            app_id: row.try_get("app_id")?,
            version: row.try_get("version")?,
        }),
        None => return Err(anyhow!("unknown device kind: {kind}").into()),
    };

    Ok(Device {
        id: row.try_get("id")?,
        user_id: row.try_get("user_id")?,
        name: row.try_get("name")?,
        confirmed: row.try_get("confirmed")?,
        created_at: row.try_get("created_at")?,
        last_used: row.try_get("last_used")?,
        order: row.try_get("sort_order")?,
        kind,
    })
}

async fn insert_bearer(
    tx: &mut Transaction<'_, Postgres>,
    bearer: &BearerRecord,
) -> Result<(), StoreError> {
    let query = r"
        INSERT INTO bearer_tokens
            (token_hash, client_id, user_id, scopes, device_id, family_id, auth_time, created_at)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
    ";
    sqlx::query(query)
        .bind(&bearer.token_hash)
        .bind(&bearer.client_id)
        .bind(bearer.user_id)
        .bind(bearer.scopes.to_string())
        .bind(bearer.device_id)
        .bind(bearer.family_id)
        .bind(bearer.auth_time)
        .bind(bearer.created_at)
        .execute(&mut **tx)
        .instrument(query_span("INSERT", query))
        .await?;
    Ok(())
}

async fn insert_refresh(
    tx: &mut Transaction<'_, Postgres>,
    refresh: &RefreshRecord,
) -> Result<(), StoreError> {
    let query = r"
        INSERT INTO refresh_tokens (token_hash, bearer_hash, created_at)
        VALUES ($1, $2, $3)
    ";
    sqlx::query(query)
        .bind(&refresh.token_hash)
        .bind(&refresh.bearer_hash)
        .bind(refresh.created_at)
        .execute(&mut **tx)
        .instrument(query_span("INSERT", query))
        .await?;
    Ok(())
}

/// Refresh rows cascade with their bearer.
async fn delete_bearer(
    tx: &mut Transaction<'_, Postgres>,
    bearer_hash: &[u8],
) -> Result<(), StoreError> {
    let query = "DELETE FROM bearer_tokens WHERE token_hash = $1";
    sqlx::query(query)
        .bind(bearer_hash)
        .execute(&mut **tx)
        .instrument(query_span("DELETE", query))
        .await
        .context("failed to delete bearer token")?;
    Ok(())
}

#[async_trait]
impl ClientStore for PgStore {
    async fn find_client(&self, client_id: &str) -> Result<Option<Client>, StoreError> {
        let query = "SELECT client_id, name, secret_hash, client_type, redirect_uris, \
             post_logout_redirect_uris, scopes, is_active, is_trustworthy, pkce_required, \
             service_user FROM clients WHERE client_id = $1";
        let row = sqlx::query(query)
            .bind(client_id)
            .fetch_optional(&self.pool)
            .instrument(query_span("SELECT", query))
            .await
            .context("failed to lookup client")?;
        row.as_ref().map(client_from_row).transpose()
    }
}

#[async_trait]
impl CodeStore for PgStore {
    async fn insert_code(&self, code: &AuthorizationCode) -> Result<(), StoreError> {
        let query = r"
            INSERT INTO authorization_codes
                (id, code_hash, client_id, user_id, redirect_uri, scopes, code_challenge,
                 code_challenge_method, nonce, device_id, auth_time, is_valid, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
        ";
        sqlx::query(query)
            .bind(code.id)
            .bind(&code.code_hash)
            .bind(&code.client_id)
            .bind(code.user_id)
            .bind(&code.redirect_uri)
            .bind(code.scopes.to_string())
            .bind(code.pkce.as_ref().map(|pkce| pkce.challenge.clone()))
            .bind(code.pkce.as_ref().map(|pkce| pkce.method.as_str()))
            .bind(&code.nonce)
            .bind(code.device_id)
            .bind(code.auth_time)
            .bind(code.is_valid)
            .bind(code.created_at)
            .execute(&self.pool)
            .instrument(query_span("INSERT", query))
            .await?;
        Ok(())
    }

    async fn take_code(&self, code_hash: &[u8]) -> Result<Option<AuthorizationCode>, StoreError> {
        let mut tx = self.begin().await?;

        let query = r"
            SELECT id, code_hash, client_id, user_id, redirect_uri, scopes, code_challenge,
                   code_challenge_method, nonce, device_id, auth_time, is_valid, created_at
            FROM authorization_codes
            WHERE code_hash = $1
            FOR UPDATE
        ";
        let row = sqlx::query(query)
            .bind(code_hash)
            .fetch_optional(&mut *tx)
            .instrument(query_span("SELECT", query))
            .await
            .context("failed to lookup authorization code")?;
        let Some(row) = row else {
            tx.commit().await.context("commit code lookup")?;
            return Ok(None);
        };
        let code = code_from_row(&row)?;

        if code.is_valid {
            let query = "UPDATE authorization_codes SET is_valid = FALSE WHERE id = $1";
            sqlx::query(query)
                .bind(code.id)
                .execute(&mut *tx)
                .instrument(query_span("UPDATE", query))
                .await
                .context("failed to invalidate authorization code")?;
        }

        tx.commit().await.context("commit code redemption")?;
        Ok(Some(code))
    }
}

#[async_trait]
impl TokenStore for PgStore {
    async fn insert_tokens(
        &self,
        bearer: &BearerRecord,
        refresh: Option<&RefreshRecord>,
    ) -> Result<(), StoreError> {
        let mut tx = self.begin().await?;
        insert_bearer(&mut tx, bearer).await?;
        if let Some(refresh) = refresh {
            insert_refresh(&mut tx, refresh).await?;
        }
        tx.commit().await.context("commit token insert")?;
        Ok(())
    }

    async fn find_bearer(&self, token_hash: &[u8]) -> Result<Option<BearerRecord>, StoreError> {
        let query = r"
            SELECT token_hash, client_id, user_id, scopes, device_id, family_id, auth_time,
                   created_at
            FROM bearer_tokens
            WHERE token_hash = $1
        ";
        let row = sqlx::query(query)
            .bind(token_hash)
            .fetch_optional(&self.pool)
            .instrument(query_span("SELECT", query))
            .await
            .context("failed to lookup bearer token")?;
        row.as_ref().map(bearer_from_row).transpose()
    }

    async fn find_refresh(
        &self,
        token_hash: &[u8],
    ) -> Result<Option<(RefreshRecord, BearerRecord)>, StoreError> {
        let query = r"
            SELECT r.token_hash AS refresh_hash, r.created_at AS refresh_created_at,
                   b.token_hash, b.client_id, b.user_id, b.scopes, b.device_id, b.family_id,
                   b.auth_time, b.created_at
            FROM refresh_tokens r
            JOIN bearer_tokens b ON b.token_hash = r.bearer_hash
            WHERE r.token_hash = $1
        ";
        let row = sqlx::query(query)
            .bind(token_hash)
            .fetch_optional(&self.pool)
            .instrument(query_span("SELECT", query))
            .await
            .context("failed to lookup refresh token")?;
        let Some(row) = row else {
            return Ok(None);
        };
        let bearer = bearer_from_row(&row)?;
        let refresh = RefreshRecord {
            token_hash: row.try_get("refresh_hash")?,
            bearer_hash: bearer.token_hash.clone(),
            created_at: row.try_get("refresh_created_at")?,
        };
        Ok(Some((refresh, bearer)))
    }

    async fn rotate_refresh(&self, request: &RotateRequest) -> Result<RotateOutcome, StoreError> {
        let mut tx = self.begin().await?;

        let query = "DELETE FROM refresh_tombstones WHERE rotated_at < $1";
        sqlx::query(query)
            .bind(request.not_before)
            .execute(&mut *tx)
            .instrument(query_span("DELETE", query))
            .await
            .context("failed to prune refresh tombstones")?;

        let query = r"
            SELECT r.created_at AS refresh_created_at,
                   b.token_hash, b.client_id, b.user_id, b.scopes, b.device_id, b.family_id,
                   b.auth_time, b.created_at
            FROM refresh_tokens r
            JOIN bearer_tokens b ON b.token_hash = r.bearer_hash
            WHERE r.token_hash = $1
            FOR UPDATE OF r, b
        ";
        let row = sqlx::query(query)
            .bind(&request.refresh_hash)
            .fetch_optional(&mut *tx)
            .instrument(query_span("SELECT", query))
            .await
            .context("failed to lock refresh token")?;

        let Some(row) = row else {
            let query = "SELECT family_id FROM refresh_tombstones WHERE token_hash = $1";
            let tombstone = sqlx::query(query)
                .bind(&request.refresh_hash)
                .fetch_optional(&mut *tx)
                .instrument(query_span("SELECT", query))
                .await
                .context("failed to lookup refresh tombstone")?;
            let outcome = match tombstone {
                Some(row) => RotateOutcome::Reused {
                    family_id: row.try_get("family_id")?,
                },
                None => RotateOutcome::NotFound,
            };
            tx.commit().await.context("commit refresh lookup")?;
            return Ok(outcome);
        };

        let bearer = bearer_from_row(&row)?;
        let refresh_created_at: DateTime<Utc> = row.try_get("refresh_created_at")?;

        if bearer.client_id != request.client_id {
            tx.commit().await.context("commit refresh lookup")?;
            return Ok(RotateOutcome::ClientMismatch);
        }
        if refresh_created_at < request.not_before {
            delete_bearer(&mut tx, &bearer.token_hash).await?;
            tx.commit().await.context("commit expired refresh cleanup")?;
            return Ok(RotateOutcome::Expired);
        }

        delete_bearer(&mut tx, &bearer.token_hash).await?;

        let query = r"
            INSERT INTO refresh_tombstones (token_hash, family_id, rotated_at)
            VALUES ($1, $2, $3)
            ON CONFLICT (token_hash) DO UPDATE SET rotated_at = EXCLUDED.rotated_at
        ";
        sqlx::query(query)
            .bind(&request.refresh_hash)
            .bind(bearer.family_id)
            .bind(request.now)
            .execute(&mut *tx)
            .instrument(query_span("INSERT", query))
            .await
            .context("failed to record refresh tombstone")?;

        let rotated = BearerRecord {
            token_hash: request.new_bearer_hash.clone(),
            created_at: request.now,
            ..bearer
        };
        insert_bearer(&mut tx, &rotated).await?;
        insert_refresh(
            &mut tx,
            &RefreshRecord {
                token_hash: request.new_refresh_hash.clone(),
                bearer_hash: rotated.token_hash.clone(),
                created_at: request.now,
            },
        )
        .await?;

        tx.commit().await.context("commit refresh rotation")?;
        Ok(RotateOutcome::Rotated(rotated))
    }

    async fn revoke(&self, token_hash: &[u8], client_id: &str) -> Result<bool, StoreError> {
        let query = r"
            DELETE FROM bearer_tokens
            WHERE client_id = $2
              AND (token_hash = $1
                   OR token_hash IN (SELECT bearer_hash FROM refresh_tokens WHERE token_hash = $1))
        ";
        let result = sqlx::query(query)
            .bind(token_hash)
            .bind(client_id)
            .execute(&self.pool)
            .instrument(query_span("DELETE", query))
            .await
            .context("failed to revoke token")?;
        Ok(result.rows_affected() > 0)
    }

    async fn revoke_family(&self, family_id: Uuid) -> Result<u64, StoreError> {
        let query = "DELETE FROM bearer_tokens WHERE family_id = $1";
        let result = sqlx::query(query)
            .bind(family_id)
            .execute(&self.pool)
            .instrument(query_span("DELETE", query))
            .await
            .context("failed to revoke token family")?;
        Ok(result.rows_affected())
    }
}

#[async_trait]
impl DeviceStore for PgStore {
    async fn list_devices(&self, user_id: Uuid) -> Result<Vec<Device>, StoreError> {
        let query = "SELECT id, user_id, name, kind, confirmed, created_at, last_used, sort_order, \
             secret, step, t0, digits, tolerance, drift, last_t, target, public_key, key_handle, \
             app_id, version FROM mfa_devices WHERE user_id = $1 ORDER BY sort_order, created_at";
        let rows = sqlx::query(query)
            .bind(user_id)
            .fetch_all(&self.pool)
            .instrument(query_span("SELECT", query))
            .await
            .context("failed to list mfa devices")?;
        rows.iter().map(device_from_row).collect()
    }

    async fn find_device(&self, user_id: Uuid, device_id: Uuid) -> Result<Option<Device>, StoreError> {
        let query = "SELECT id, user_id, name, kind, confirmed, created_at, last_used, sort_order, \
             secret, step, t0, digits, tolerance, drift, last_t, target, public_key, key_handle, \
             app_id, version FROM mfa_devices WHERE user_id = $1 AND id = $2";
        let row = sqlx::query(query)
            .bind(user_id)
            .bind(device_id)
            .fetch_optional(&self.pool)
            .instrument(query_span("SELECT", query))
            .await
            .context("failed to lookup mfa device")?;
        row.as_ref().map(device_from_row).transpose()
    }

    async fn insert_device(&self, device: &Device) -> Result<(), StoreError> {
        let query = r"
            INSERT INTO mfa_devices
                (id, user_id, name, kind, confirmed, created_at, last_used, sort_order, secret,
                 step, t0, digits, tolerance, drift, last_t, target, public_key, key_handle,
                 app_id, version)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17,
                    $18, $19, $20)
        ";
        let mut statement = sqlx::query(query)
            .bind(device.id)
            .bind(device.user_id)
            .bind(&device.name)
            .bind(device.device_type().as_str())
            .bind(device.confirmed)
            .bind(device.created_at)
            .bind(device.last_used)
            .bind(device.order);

        statement = match &device.kind {
            DeviceKind::Totp(params) => statement
                .bind(Some(params.key.clone()))
                .bind(Some(params.step))
                .bind(Some(params.t0))
                .bind(Some(i32::try_from(params.digits).context("invalid totp digits")?))
                .bind(Some(params.tolerance))
                .bind(Some(params.drift))
                .bind(Some(params.last_t))
                .bind(None::<String>)
                .bind(None::<Vec<u8>>)
                .bind(None::<String>)
                .bind(None::<String>)
                .bind(None::<String>),
            DeviceKind::OutOfBand(params) => statement
                .bind(Some(params.key.clone()))
                .bind(None::<i64>)
                .bind(None::<i64>)
                .bind(None::<i32>)
                .bind(None::<i64>)
                .bind(None::<i64>)
                .bind(Some(params.last_t))
                .bind(Some(params.target.clone()))
                .bind(None::<Vec<u8>>)
                .bind(None::<String>)
                .bind(None::<String>)
                .bind(None::<String>),
            DeviceKind::HardwareKey(params) => statement
                .bind(None::<String>)
                .bind(None::<i64>)
                .bind(None::<i64>)
                .bind(None::<i32>)
                .bind(None::<i64>)
                .bind(None::<i64>)
                .bind(None::<i64>)
                .bind(None::<String>)
                .bind(Some(params.public_key.clone()))
                .bind(Some(params.key_handle.clone()))
                .bind(Some(params.app_id.clone()))
                .bind(Some(params.version.clone())),
        };

        statement
            .execute(&self.pool)
            .instrument(query_span("INSERT", query))
            .await?;
        Ok(())
    }

    async fn delete_device(&self, user_id: Uuid, device_id: Uuid) -> Result<bool, StoreError> {
        let query = "DELETE FROM mfa_devices WHERE user_id = $1 AND id = $2";
        let result = sqlx::query(query)
            .bind(user_id)
            .bind(device_id)
            .execute(&self.pool)
            .instrument(query_span("DELETE", query))
            .await
            .context("failed to delete mfa device")?;
        Ok(result.rows_affected() == 1)
    }

    async fn record_device_use(&self, update: &CounterUpdate) -> Result<bool, StoreError> {
        let query = r"
            UPDATE mfa_devices
            SET last_t = COALESCE($4, last_t),
                drift = COALESCE($5, drift),
                last_used = $6,
                confirmed = confirmed OR $7
            WHERE id = $1 AND user_id = $2 AND last_t IS NOT DISTINCT FROM $3
        ";
        let result = sqlx::query(query)
            .bind(update.device_id)
            .bind(update.user_id)
            .bind(update.expected_last_t)
            .bind(update.last_t)
            .bind(update.drift)
            .bind(update.last_used)
            .bind(update.confirm)
            .execute(&self.pool)
            .instrument(query_span("UPDATE", query))
            .await
            .context("failed to record mfa device use")?;
        Ok(result.rows_affected() == 1)
    }

    async fn find_profile(&self, user_id: Uuid) -> Result<Option<Profile>, StoreError> {
        let query = "SELECT user_id, default_device, mfa_enabled FROM mfa_profiles WHERE user_id = $1";
        let row = sqlx::query(query)
            .bind(user_id)
            .fetch_optional(&self.pool)
            .instrument(query_span("SELECT", query))
            .await
            .context("failed to lookup mfa profile")?;
        row.map(|row| -> Result<Profile, StoreError> {
            Ok(Profile {
                user_id: row.try_get("user_id")?,
                default_device: row.try_get("default_device")?,
                mfa_enabled: row.try_get("mfa_enabled")?,
            })
        })
        .transpose()
    }

    async fn save_profile(&self, profile: &Profile) -> Result<(), StoreError> {
        let query = r"
            INSERT INTO mfa_profiles (user_id, default_device, mfa_enabled)
            VALUES ($1, $2, $3)
            ON CONFLICT (user_id) DO UPDATE
            SET default_device = EXCLUDED.default_device,
                mfa_enabled = EXCLUDED.mfa_enabled
        ";
        sqlx::query(query)
            .bind(profile.user_id)
            .bind(profile.default_device)
            .bind(profile.mfa_enabled)
            .execute(&self.pool)
            .instrument(query_span("INSERT", query))
            .await
            .context("failed to save mfa profile")?;
        Ok(())
    }
}

#[async_trait]
impl Store for PgStore {
    async fn ping(&self) -> Result<(), StoreError> {
        let query = "SELECT 1";
        sqlx::query(query)
            .execute(&self.pool)
            .instrument(query_span("SELECT", query))
            .await
            .context("database ping failed")?;
        Ok(())
    }

    async fn prune_expired(&self, cutoffs: &PruneCutoffs) -> Result<PruneReport, StoreError> {
        let mut tx = self.begin().await?;

        let query = "DELETE FROM authorization_codes WHERE created_at < $1";
        let codes = sqlx::query(query)
            .bind(cutoffs.codes_before)
            .execute(&mut *tx)
            .instrument(query_span("DELETE", query))
            .await
            .context("failed to prune authorization codes")?;

        let query = "DELETE FROM refresh_tokens WHERE created_at < $1";
        let refresh_tokens = sqlx::query(query)
            .bind(cutoffs.refresh_before)
            .execute(&mut *tx)
            .instrument(query_span("DELETE", query))
            .await
            .context("failed to prune refresh tokens")?;

        let query = r"
            DELETE FROM bearer_tokens b
            WHERE b.created_at < $1
              AND NOT EXISTS (SELECT 1 FROM refresh_tokens r WHERE r.bearer_hash = b.token_hash)
        ";
        let bearers = sqlx::query(query)
            .bind(cutoffs.bearers_before)
            .execute(&mut *tx)
            .instrument(query_span("DELETE", query))
            .await
            .context("failed to prune bearer tokens")?;

        let query = "DELETE FROM refresh_tombstones WHERE rotated_at < $1";
        sqlx::query(query)
            .bind(cutoffs.refresh_before)
            .execute(&mut *tx)
            .instrument(query_span("DELETE", query))
            .await
            .context("failed to prune refresh tombstones")?;

        tx.commit().await.context("commit prune")?;
        Ok(PruneReport {
            codes: codes.rows_affected(),
            bearers: bearers.rows_affected(),
            refresh_tokens: refresh_tokens.rows_affected(),
        })
    }
}
