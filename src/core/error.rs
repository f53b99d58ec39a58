use thiserror::Error;

/// Failures surfaced by the credential bridge. The service id is carried so
/// chat surfaces can name the integration that needs attention.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CredentialError {
    #[error("no credential stored for service '{service}'")]
    NotConnected { service: String },
    #[error("credential for service '{service}' must be re-authorized: {reason}")]
    ReauthRequired { service: String, reason: String },
    #[error("network failure talking to '{service}' after {attempts} attempt(s): {reason}")]
    TransientNetwork {
        service: String,
        attempts: u32,
        reason: String,
    },
    #[error("provider '{service}' is misconfigured: {reason}")]
    Provider { service: String, reason: String },
    #[error("secret store failure: {0}")]
    Store(String),
}

impl CredentialError {
    pub fn service(&self) -> Option<&str> {
        match self {
            Self::NotConnected { service }
            | Self::ReauthRequired { service, .. }
            | Self::TransientNetwork { service, .. }
            | Self::Provider { service, .. } => Some(service),
            Self::Store(_) => None,
        }
    }

    /// Text safe to show an end user. Never includes tokens or raw payloads.
    pub fn user_message(&self) -> String {
        match self {
            Self::NotConnected { service } => {
                format!("{} isn't connected. Connect it and try again.", display_name(service))
            }
            Self::ReauthRequired { service, .. } => format!(
                "{} access has expired or was revoked. Please reconnect it.",
                display_name(service)
            ),
            Self::TransientNetwork { service, .. } => format!(
                "{} could not be reached right now. Please try again shortly.",
                display_name(service)
            ),
            Self::Provider { service, .. } => format!(
                "{} is not set up correctly on this server.",
                display_name(service)
            ),
            Self::Store(_) => "Stored credentials could not be read.".to_string(),
        }
    }
}

/// `gmail` -> `Gmail`, `google_drive` -> `Google drive`.
pub fn display_name(service: &str) -> String {
    let spaced = service.replace(['_', '-'], " ");
    let mut chars = spaced.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

/// Errors from acquiring an execution context or running a turn.
#[derive(Debug, Clone, Error)]
pub enum RuntimeError {
    #[error("agent '{agent}' is misconfigured: {reason}")]
    Configuration { agent: String, reason: String },
    #[error("agent '{agent}' does not exist for user '{user_id}'")]
    UnknownAgent { user_id: String, agent: String },
    #[error("agent '{agent}' is disabled")]
    AgentDisabled { agent: String },
    #[error("timed out waiting for {what}")]
    ConcurrencyTimeout { what: String },
    #[error(transparent)]
    Credential(#[from] CredentialError),
    #[error("execution engine failed: {0}")]
    Engine(String),
    #[error("storage failure: {0}")]
    Storage(String),
}

impl RuntimeError {
    pub fn configuration(agent: &str, reason: impl Into<String>) -> Self {
        Self::Configuration {
            agent: agent.to_string(),
            reason: reason.into(),
        }
    }

    pub fn storage(err: impl std::fmt::Display) -> Self {
        Self::Storage(err.to_string())
    }

    pub fn user_message(&self) -> String {
        match self {
            Self::Configuration { agent, .. } => format!(
                "The agent '{}' has a configuration problem and can't run right now.",
                agent
            ),
            Self::UnknownAgent { agent, .. } => format!("There is no agent named '{}'.", agent),
            Self::AgentDisabled { agent } => format!("The agent '{}' is turned off.", agent),
            Self::ConcurrencyTimeout { .. } => {
                "The agent is busy right now. Please try again in a moment.".to_string()
            }
            Self::Credential(e) => e.user_message(),
            Self::Engine(_) => "The agent could not complete this request.".to_string(),
            Self::Storage(_) => "Something went wrong saving or loading data.".to_string(),
        }
    }
}

impl From<anyhow::Error> for RuntimeError {
    fn from(err: anyhow::Error) -> Self {
        Self::Storage(format!("{:#}", err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn not_connected_names_the_service() {
        let err = CredentialError::NotConnected {
            service: "gmail".into(),
        };
        assert_eq!(
            err.user_message(),
            "Gmail isn't connected. Connect it and try again."
        );
        assert_eq!(err.service(), Some("gmail"));
    }

    #[test]
    fn display_name_handles_separators_and_empty() {
        assert_eq!(display_name("google_drive"), "Google drive");
        assert_eq!(display_name("github"), "Github");
        assert_eq!(display_name(""), "");
    }

    #[test]
    fn runtime_error_wraps_credential_message() {
        let err: RuntimeError = CredentialError::ReauthRequired {
            service: "gmail".into(),
            reason: "invalid_grant".into(),
        }
        .into();
        assert!(err.user_message().starts_with("Gmail access"));
        assert!(!err.user_message().contains("invalid_grant"));
    }
}
