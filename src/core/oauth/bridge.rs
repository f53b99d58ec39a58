use anyhow::Result;
use chrono::Utc;
use dashmap::DashMap;
use reqwest::StatusCode;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use zeroize::Zeroizing;

use super::{ProviderDef, ProviderRegistry, TokenResponse, ToolCredential};
use crate::config::CredentialConfig;
use crate::core::error::CredentialError;
use crate::core::vault::{SecretStore, StoredCredential};

/// Outcome of one token-endpoint call that did not yield tokens.
enum GrantFailure {
    /// Worth another attempt after backoff.
    Retryable(String),
    Fatal(CredentialError),
}

/// Resolves stored grants into credentials a tool can use, refreshing them
/// when they are about to expire.
pub struct CredentialBridge {
    store: Arc<dyn SecretStore>,
    providers: ProviderRegistry,
    http: reqwest::Client,
    config: CredentialConfig,
    refresh_locks: DashMap<(String, String), Arc<Mutex<()>>>,
}

impl CredentialBridge {
    pub fn new(
        store: Arc<dyn SecretStore>,
        providers: ProviderRegistry,
        config: CredentialConfig,
    ) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(config.request_timeout())
            .build()?;
        Ok(Self {
            store,
            providers,
            http,
            config,
            refresh_locks: DashMap::new(),
        })
    }

    pub fn providers(&self) -> &ProviderRegistry {
        &self.providers
    }

    fn provider(&self, service: &str) -> Result<&ProviderDef, CredentialError> {
        self.providers
            .get(service)
            .ok_or_else(|| CredentialError::Provider {
                service: service.to_string(),
                reason: "unknown service".into(),
            })
    }

    /// A credential for `service` that is valid right now, in the shape the
    /// provider's tools expect.
    pub async fn get_usable_credential(
        &self,
        user_id: &str,
        service: &str,
    ) -> Result<ToolCredential, CredentialError> {
        let provider = self.provider(service)?;
        let skew = chrono::Duration::seconds(self.config.refresh_skew_secs);

        let stored = self
            .store
            .get(user_id, service)
            .await?
            .ok_or_else(|| CredentialError::NotConnected {
                service: service.to_string(),
            })?;

        let usable = if stored.needs_refresh(Utc::now(), skew) {
            self.refresh_serialized(user_id, provider, skew).await?
        } else {
            stored
        };

        ToolCredential::from_stored(provider, &usable)
    }

    /// Refresh under the per-(user, service) lock. Whoever gets the lock second
    /// re-reads and finds the token already fresh.
    async fn refresh_serialized(
        &self,
        user_id: &str,
        provider: &ProviderDef,
        skew: chrono::Duration,
    ) -> Result<StoredCredential, CredentialError> {
        let key = (user_id.to_string(), provider.id.clone());
        let lock = self
            .refresh_locks
            .entry(key.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();

        let result = {
            let _guard = lock.lock().await;
            match self.store.get(user_id, &provider.id).await {
                Ok(Some(current)) if !current.needs_refresh(Utc::now(), skew) => {
                    debug!(user_id, service = %provider.id, "Credential refreshed by another caller");
                    Ok(current)
                }
                Ok(Some(current)) => self.refresh(user_id, provider, &current).await,
                Ok(None) => Err(CredentialError::NotConnected {
                    service: provider.id.clone(),
                }),
                Err(e) => Err(e.into()),
            }
        };

        drop(lock);
        self.refresh_locks
            .remove_if(&key, |_, lock| Arc::strong_count(lock) == 1);
        result
    }

    async fn refresh(
        &self,
        user_id: &str,
        provider: &ProviderDef,
        current: &StoredCredential,
    ) -> Result<StoredCredential, CredentialError> {
        let Some(refresh_token) = current.refresh_token.as_ref() else {
            return Err(CredentialError::ReauthRequired {
                service: provider.id.clone(),
                reason: "access token expired and no refresh token is stored".into(),
            });
        };

        let mut params = vec![
            ("grant_type", Zeroizing::new("refresh_token".to_string())),
            ("refresh_token", refresh_token.clone()),
        ];
        push_client_auth(&mut params, provider);

        let response = self.token_request(provider, &params).await?;
        let refreshed =
            response.into_credential(&provider.id, Some(refresh_token), &current.scopes)?;
        self.store.put(user_id, &provider.id, &refreshed).await?;
        info!(user_id, service = %provider.id, "Refreshed credential");
        Ok(refreshed)
    }

    /// POST to the provider's token endpoint, retrying transient failures with
    /// exponential backoff.
    async fn token_request(
        &self,
        provider: &ProviderDef,
        params: &[(&str, Zeroizing<String>)],
    ) -> Result<TokenResponse, CredentialError> {
        let max_attempts = self.config.max_attempts.max(1);
        let mut last_reason = String::new();

        for attempt in 1..=max_attempts {
            match self.post_token_endpoint(provider, params).await {
                Ok(response) => return Ok(response),
                Err(GrantFailure::Fatal(e)) => return Err(e),
                Err(GrantFailure::Retryable(reason)) => {
                    warn!(
                        service = %provider.id,
                        attempt,
                        max_attempts,
                        "Token endpoint call failed: {}",
                        reason
                    );
                    last_reason = reason;
                    if attempt < max_attempts {
                        let backoff = backoff_delay_ms(self.config.backoff_base_ms, attempt);
                        tokio::time::sleep(Duration::from_millis(backoff)).await;
                    }
                }
            }
        }

        Err(CredentialError::TransientNetwork {
            service: provider.id.clone(),
            attempts: max_attempts,
            reason: last_reason,
        })
    }

    async fn post_token_endpoint(
        &self,
        provider: &ProviderDef,
        params: &[(&str, Zeroizing<String>)],
    ) -> Result<TokenResponse, GrantFailure> {
        let form: Vec<(&str, &str)> = params.iter().map(|(k, v)| (*k, v.as_str())).collect();
        let response = self
            .http
            .post(&provider.token_url)
            .header("Accept", "application/json")
            .form(&form)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    GrantFailure::Retryable("request timed out".into())
                } else {
                    GrantFailure::Retryable(format!("transport error: {}", e))
                }
            })?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| GrantFailure::Retryable(format!("failed to read body: {}", e)))?;
        let parsed: Option<TokenResponse> = serde_json::from_str(&body).ok();

        if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
            return Err(GrantFailure::Retryable(format!("HTTP {}", status)));
        }

        let error_code = parsed.as_ref().and_then(|p| p.error.clone());
        if status == StatusCode::BAD_REQUEST
            || status == StatusCode::UNAUTHORIZED
            || error_code.as_deref() == Some("invalid_grant")
        {
            let reason = match &parsed {
                Some(TokenResponse {
                    error: Some(code),
                    error_description,
                    ..
                }) => format!("{} {}", code, error_description.as_deref().unwrap_or("")).trim().to_string(),
                _ => format!("HTTP {}", status),
            };
            return Err(GrantFailure::Fatal(CredentialError::ReauthRequired {
                service: provider.id.clone(),
                reason,
            }));
        }

        if !status.is_success() {
            return Err(GrantFailure::Fatal(CredentialError::Provider {
                service: provider.id.clone(),
                reason: format!("token endpoint answered HTTP {}", status),
            }));
        }

        match parsed {
            Some(TokenResponse {
                error: Some(code), ..
            }) => Err(GrantFailure::Fatal(CredentialError::Provider {
                service: provider.id.clone(),
                reason: format!("token endpoint returned error '{}'", code),
            })),
            Some(response) => Ok(response),
            None => Err(GrantFailure::Fatal(CredentialError::Provider {
                service: provider.id.clone(),
                reason: "token endpoint returned a non-JSON body".into(),
            })),
        }
    }

    /// Persist a grant obtained out of band (CLI import, tests).
    pub async fn store_grant(
        &self,
        user_id: &str,
        service: &str,
        credential: &StoredCredential,
    ) -> Result<(), CredentialError> {
        self.provider(service)?;
        self.store.put(user_id, service, credential).await?;
        info!(user_id, service, "Stored credential grant");
        Ok(())
    }

    /// Authorization-code grant: trade `code` for tokens and store them.
    pub async fn exchange_code(
        &self,
        user_id: &str,
        service: &str,
        code: &str,
        redirect_uri: &str,
    ) -> Result<(), CredentialError> {
        let provider = self.provider(service)?;
        let mut params = vec![
            ("grant_type", Zeroizing::new("authorization_code".to_string())),
            ("code", Zeroizing::new(code.to_string())),
            ("redirect_uri", Zeroizing::new(redirect_uri.to_string())),
        ];
        push_client_auth(&mut params, provider);

        let response = self.token_request(provider, &params).await?;
        let credential = response.into_credential(service, None, "")?;
        self.store_grant(user_id, service, &credential).await
    }

    /// Forget a user's grant. Returns whether one existed.
    pub async fn revoke(&self, user_id: &str, service: &str) -> Result<bool, CredentialError> {
        let removed = self.store.delete(user_id, service).await?;
        if removed {
            info!(user_id, service, "Revoked credential");
        }
        Ok(removed)
    }
}

/// Delay before retry number `attempt + 1`; doubles per attempt and saturates.
fn backoff_delay_ms(base_ms: u64, attempt: u32) -> u64 {
    let factor = 1u64.checked_shl(attempt.saturating_sub(1)).unwrap_or(u64::MAX);
    base_ms.saturating_mul(factor)
}

fn push_client_auth(params: &mut Vec<(&'static str, Zeroizing<String>)>, provider: &ProviderDef) {
    if let Some(id) = &provider.client_id {
        params.push(("client_id", Zeroizing::new(id.clone())));
    }
    if let Some(secret) = &provider.client_secret {
        params.push(("client_secret", Zeroizing::new(secret.clone())));
    }
}
