mod bridge;

pub use bridge::CredentialBridge;

use chrono::{Duration as ChronoDuration, Utc};
use rand::Rng;
use rand::distributions::Alphanumeric;
use serde::{Deserialize, Serialize};
use std::fmt;
use zeroize::Zeroizing;

use crate::core::error::CredentialError;
use crate::core::vault::StoredCredential;

const PROVIDERS_JSON: &str = include_str!("providers.json");

/// Redirect target for copy-paste flows where no callback server runs.
pub const OOB_REDIRECT_URI: &str = "urn:ietf:wg:oauth:2.0:oob";

/// How a stored token is handed to a tool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CredentialShape {
    /// `Authorization: Bearer <token>`
    #[default]
    Bearer,
    /// `Authorization: token <token>`
    TokenHeader,
    /// Token appended as a query parameter named by `ProviderDef::query_param`.
    QueryParam,
    /// Google `authorized_user` JSON document, for client libraries that
    /// refresh on their own.
    GoogleAuthorizedUser,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderDef {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub auth_url: Option<String>,
    pub token_url: String,
    #[serde(default)]
    pub shape: CredentialShape,
    #[serde(default = "default_query_param")]
    pub query_param: String,
    #[serde(default)]
    pub scopes: Vec<String>,
    #[serde(default = "default_scope_separator")]
    pub scope_separator: String,
    #[serde(default)]
    pub client_id: Option<String>,
    #[serde(default)]
    pub client_secret: Option<String>,
}

fn default_query_param() -> String {
    "access_token".to_string()
}

fn default_scope_separator() -> String {
    " ".to_string()
}

#[derive(Debug, Clone, Deserialize)]
struct RegistryFile {
    providers: Vec<ProviderDef>,
}

/// Known OAuth providers: the embedded list, with configured entries merged
/// over it by id.
#[derive(Debug, Clone)]
pub struct ProviderRegistry {
    providers: Vec<ProviderDef>,
}

impl ProviderRegistry {
    pub fn embedded() -> Result<Self, serde_json::Error> {
        let file: RegistryFile = serde_json::from_str(PROVIDERS_JSON)?;
        Ok(Self {
            providers: file.providers,
        })
    }

    pub fn empty() -> Self {
        Self {
            providers: Vec::new(),
        }
    }

    /// Replace providers with the same id, append new ones.
    pub fn with_overrides(mut self, overrides: &[ProviderDef]) -> Self {
        for def in overrides {
            match self.providers.iter_mut().find(|p| p.id == def.id) {
                Some(existing) => *existing = def.clone(),
                None => self.providers.push(def.clone()),
            }
        }
        self
    }

    pub fn get(&self, id: &str) -> Option<&ProviderDef> {
        let normalized = id.to_lowercase();
        self.providers.iter().find(|p| p.id == normalized)
    }

    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.providers.iter().map(|p| p.id.as_str())
    }
}

/// Credential material ready for a tool to attach to its requests.
#[derive(Clone)]
pub enum ToolCredential {
    Header {
        name: &'static str,
        value: Zeroizing<String>,
    },
    QueryParam {
        name: String,
        value: Zeroizing<String>,
    },
    AuthorizedUser {
        document: Zeroizing<String>,
        access_token: Zeroizing<String>,
    },
}

impl ToolCredential {
    pub fn from_stored(
        provider: &ProviderDef,
        credential: &StoredCredential,
    ) -> Result<Self, CredentialError> {
        let token = credential.access_token.as_str();
        match provider.shape {
            CredentialShape::Bearer => Ok(Self::Header {
                name: "Authorization",
                value: Zeroizing::new(format!("Bearer {}", token)),
            }),
            CredentialShape::TokenHeader => Ok(Self::Header {
                name: "Authorization",
                value: Zeroizing::new(format!("token {}", token)),
            }),
            CredentialShape::QueryParam => Ok(Self::QueryParam {
                name: provider.query_param.clone(),
                value: Zeroizing::new(token.to_string()),
            }),
            CredentialShape::GoogleAuthorizedUser => {
                let refresh_token = credential.refresh_token.as_ref().ok_or_else(|| {
                    CredentialError::ReauthRequired {
                        service: provider.id.clone(),
                        reason: "authorized_user document needs a refresh token".into(),
                    }
                })?;
                let document = serde_json::json!({
                    "type": "authorized_user",
                    "client_id": provider.client_id.clone().unwrap_or_default(),
                    "client_secret": provider.client_secret.clone().unwrap_or_default(),
                    "refresh_token": refresh_token.as_str(),
                });
                Ok(Self::AuthorizedUser {
                    document: Zeroizing::new(document.to_string()),
                    access_token: Zeroizing::new(token.to_string()),
                })
            }
        }
    }

    /// Attach the credential to an outgoing request.
    pub fn apply(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match self {
            Self::Header { name, value } => request.header(*name, value.as_str()),
            Self::QueryParam { name, value } => request.query(&[(name.as_str(), value.as_str())]),
            Self::AuthorizedUser { access_token, .. } => request.bearer_auth(access_token.as_str()),
        }
    }
}

impl fmt::Debug for ToolCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self {
            Self::Header { .. } => "Header",
            Self::QueryParam { .. } => "QueryParam",
            Self::AuthorizedUser { .. } => "AuthorizedUser",
        };
        write!(f, "ToolCredential::{}(<redacted>)", kind)
    }
}

#[derive(Debug, Deserialize)]
pub(crate) struct TokenResponse {
    pub access_token: Option<String>,
    pub refresh_token: Option<String>,
    pub expires_in: Option<i64>,
    #[serde(default)]
    pub scope: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub error_description: Option<String>,
}

impl TokenResponse {
    /// Build the token set to persist. A response without a new refresh token
    /// keeps `previous_refresh`.
    pub(crate) fn into_credential(
        self,
        service: &str,
        previous_refresh: Option<&Zeroizing<String>>,
        previous_scopes: &str,
    ) -> Result<StoredCredential, CredentialError> {
        let access_token = self
            .access_token
            .filter(|t| !t.is_empty())
            .ok_or_else(|| CredentialError::Provider {
                service: service.to_string(),
                reason: "token response had no access_token".into(),
            })?;

        let now = Utc::now();
        let mut credential = StoredCredential::new(access_token)
            .with_scopes(self.scope.unwrap_or_else(|| previous_scopes.to_string()));
        credential.updated_at = now;
        credential.expires_at = self.expires_in.map(|secs| now + ChronoDuration::seconds(secs));
        credential.refresh_token = match self.refresh_token {
            Some(rotated) => Some(Zeroizing::new(rotated)),
            None => previous_refresh.cloned(),
        };
        Ok(credential)
    }
}

pub fn generate_state() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(32)
        .map(char::from)
        .collect()
}

pub fn build_auth_url(
    provider: &ProviderDef,
    redirect_uri: &str,
    state: &str,
) -> Result<String, CredentialError> {
    let auth_url = provider
        .auth_url
        .as_deref()
        .ok_or_else(|| CredentialError::Provider {
            service: provider.id.clone(),
            reason: "no auth_url configured".into(),
        })?;
    let client_id = provider
        .client_id
        .as_deref()
        .ok_or_else(|| CredentialError::Provider {
            service: provider.id.clone(),
            reason: "no client_id configured".into(),
        })?;

    let scopes = provider.scopes.join(&provider.scope_separator);
    Ok(format!(
        "{}?response_type=code&client_id={}&redirect_uri={}&scope={}&state={}&access_type=offline&prompt=consent",
        auth_url,
        urlencoding::encode(client_id),
        urlencoding::encode(redirect_uri),
        urlencoding::encode(&scopes),
        urlencoding::encode(state)
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn provider(shape: CredentialShape) -> ProviderDef {
        ProviderDef {
            id: "acme".into(),
            name: "Acme".into(),
            auth_url: Some("https://auth.example.com/authorize".into()),
            token_url: "https://auth.example.com/token".into(),
            shape,
            query_param: "key".into(),
            scopes: vec!["read".into(), "write".into()],
            scope_separator: " ".into(),
            client_id: Some("client 1".into()),
            client_secret: Some("shh".into()),
        }
    }

    #[test]
    fn embedded_registry_parses_and_knows_gmail() {
        let registry = ProviderRegistry::embedded().unwrap();
        let gmail = registry.get("Gmail").unwrap();
        assert_eq!(gmail.shape, CredentialShape::Bearer);
        assert!(registry.get("nope").is_none());
    }

    #[test]
    fn overrides_replace_by_id_and_append_new() {
        let registry = ProviderRegistry::embedded().unwrap();
        let before = registry.ids().count();
        let mut gmail = registry.get("gmail").unwrap().clone();
        gmail.token_url = "http://127.0.0.1:1/token".into();
        let registry = registry.with_overrides(&[gmail, provider(CredentialShape::Bearer)]);

        assert_eq!(registry.ids().count(), before + 1);
        assert_eq!(registry.get("gmail").unwrap().token_url, "http://127.0.0.1:1/token");
        assert!(registry.get("acme").is_some());
    }

    #[test]
    fn shapes_translate_tokens() {
        let cred = StoredCredential::new("tok").with_refresh_token("ref");

        match ToolCredential::from_stored(&provider(CredentialShape::Bearer), &cred).unwrap() {
            ToolCredential::Header { value, .. } => assert_eq!(value.as_str(), "Bearer tok"),
            other => panic!("unexpected {:?}", other),
        }
        match ToolCredential::from_stored(&provider(CredentialShape::TokenHeader), &cred).unwrap() {
            ToolCredential::Header { value, .. } => assert_eq!(value.as_str(), "token tok"),
            other => panic!("unexpected {:?}", other),
        }
        match ToolCredential::from_stored(&provider(CredentialShape::QueryParam), &cred).unwrap() {
            ToolCredential::QueryParam { name, value } => {
                assert_eq!(name, "key");
                assert_eq!(value.as_str(), "tok");
            }
            other => panic!("unexpected {:?}", other),
        }
        match ToolCredential::from_stored(&provider(CredentialShape::GoogleAuthorizedUser), &cred)
            .unwrap()
        {
            ToolCredential::AuthorizedUser { document, .. } => {
                let doc: serde_json::Value = serde_json::from_str(&document).unwrap();
                assert_eq!(doc["type"], "authorized_user");
                assert_eq!(doc["refresh_token"], "ref");
                assert_eq!(doc["client_id"], "client 1");
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn authorized_user_without_refresh_token_needs_reauth() {
        let cred = StoredCredential::new("tok");
        let err = ToolCredential::from_stored(&provider(CredentialShape::GoogleAuthorizedUser), &cred)
            .unwrap_err();
        assert!(matches!(err, CredentialError::ReauthRequired { .. }));
    }

    #[test]
    fn tool_credential_debug_is_redacted() {
        let cred = StoredCredential::new("very-secret");
        let tool = ToolCredential::from_stored(&provider(CredentialShape::Bearer), &cred).unwrap();
        assert!(!format!("{:?}", tool).contains("very-secret"));
    }

    #[test]
    fn auth_url_encodes_parameters() {
        let url = build_auth_url(&provider(CredentialShape::Bearer), OOB_REDIRECT_URI, "st4te").unwrap();
        assert!(url.starts_with("https://auth.example.com/authorize?response_type=code"));
        assert!(url.contains("client_id=client%201"));
        assert!(url.contains("scope=read%20write"));
        assert!(url.contains("state=st4te"));
    }

    #[test]
    fn auth_url_requires_client_id() {
        let mut def = provider(CredentialShape::Bearer);
        def.client_id = None;
        assert!(matches!(
            build_auth_url(&def, OOB_REDIRECT_URI, "s"),
            Err(CredentialError::Provider { .. })
        ));
    }

    #[test]
    fn generated_state_is_alphanumeric() {
        let state = generate_state();
        assert_eq!(state.len(), 32);
        assert!(state.chars().all(|c| c.is_ascii_alphanumeric()));
        assert_ne!(state, generate_state());
    }

    #[test]
    fn token_response_keeps_previous_refresh_token() {
        let previous = Zeroizing::new("old-refresh".to_string());
        let response: TokenResponse =
            serde_json::from_str(r#"{"access_token":"new","expires_in":3600}"#).unwrap();
        let cred = response.into_credential("acme", Some(&previous), "read").unwrap();
        assert_eq!(cred.access_token.as_str(), "new");
        assert_eq!(cred.refresh_token.as_ref().unwrap().as_str(), "old-refresh");
        assert_eq!(cred.scopes, "read");
        assert!(cred.expires_at.unwrap() > Utc::now());
    }
}
