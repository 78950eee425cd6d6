use std::time::Duration;

use url::Url;

use crate::error::SyncError;

/// Attempts allowed before the supervisor parks in the failed state.
pub const MAX_RECONNECT_ATTEMPTS: u32 = 5;

/// Linear backoff base: the Nth retry waits `base * N`.
pub const RECONNECT_DELAY_BASE: Duration = Duration::from_millis(3000);

/// Configuration for the push channel and its chat API collaborator.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// WebSocket endpoint of the push channel. Bare hosts get a scheme
    /// inferred (`ws://` for loopback, `wss://` otherwise).
    pub endpoint: String,
    /// Primary API token. Also the subscription credential when the pubsub
    /// token fetch fails.
    pub api_token: String,
    pub account_id: i64,
    pub user_id: i64,
    pub max_reconnect_attempts: u32,
    pub reconnect_delay_base: Duration,
}

impl SyncConfig {
    pub fn new(
        endpoint: impl Into<String>,
        api_token: impl Into<String>,
        account_id: i64,
        user_id: i64,
    ) -> Self {
        Self {
            endpoint: endpoint.into(),
            api_token: api_token.into(),
            account_id,
            user_id,
            max_reconnect_attempts: MAX_RECONNECT_ATTEMPTS,
            reconnect_delay_base: RECONNECT_DELAY_BASE,
        }
    }

    /// Validate and normalize into a connectable WebSocket URL. Runs before
    /// any socket or credential work; a bad config never opens a connection.
    pub fn websocket_url(&self) -> Result<Url, SyncError> {
        let raw = self.endpoint.trim();
        if raw.is_empty() {
            return Err(SyncError::InvalidConfig("endpoint cannot be empty".into()));
        }
        if self.api_token.trim().is_empty() {
            return Err(SyncError::InvalidConfig("api token cannot be empty".into()));
        }
        if self.account_id <= 0 {
            return Err(SyncError::InvalidConfig(format!(
                "account id must be positive, got {}",
                self.account_id
            )));
        }
        if self.user_id <= 0 {
            return Err(SyncError::InvalidConfig(format!(
                "user id must be positive, got {}",
                self.user_id
            )));
        }

        let with_scheme = if raw.starts_with("ws://") || raw.starts_with("wss://") {
            raw.to_string()
        } else if raw.contains("://") {
            return Err(SyncError::InvalidConfig(format!(
                "endpoint scheme must be ws or wss: {raw}"
            )));
        } else if raw.contains("localhost") || raw.contains("127.0.0.1") {
            format!("ws://{raw}")
        } else {
            format!("wss://{raw}")
        };

        let parsed = Url::parse(&with_scheme)
            .map_err(|err| SyncError::InvalidConfig(format!("invalid endpoint url: {err}")))?;
        match parsed.scheme() {
            "ws" | "wss" => {}
            other => {
                return Err(SyncError::InvalidConfig(format!(
                    "endpoint scheme must be ws or wss, got {other}"
                )));
            }
        }
        if parsed.host_str().is_none() {
            return Err(SyncError::InvalidConfig("endpoint is missing a host".into()));
        }
        Ok(parsed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(endpoint: &str) -> SyncConfig {
        SyncConfig::new(endpoint, "token", 1, 7)
    }

    #[test]
    fn accepts_explicit_ws_schemes() {
        let url = config("wss://chat.example.com/cable").websocket_url().unwrap();
        assert_eq!(url.scheme(), "wss");
        assert_eq!(url.path(), "/cable");
    }

    #[test]
    fn infers_scheme_for_bare_hosts() {
        assert_eq!(
            config("127.0.0.1:8080/cable").websocket_url().unwrap().scheme(),
            "ws"
        );
        assert_eq!(
            config("chat.example.com/cable").websocket_url().unwrap().scheme(),
            "wss"
        );
    }

    #[test]
    fn rejects_bad_configuration_before_any_io() {
        assert!(matches!(
            config("").websocket_url(),
            Err(SyncError::InvalidConfig(_))
        ));
        assert!(matches!(
            config("http://chat.example.com").websocket_url(),
            Err(SyncError::InvalidConfig(_))
        ));

        let mut empty_token = config("ws://localhost/cable");
        empty_token.api_token = "  ".into();
        assert!(matches!(
            empty_token.websocket_url(),
            Err(SyncError::InvalidConfig(_))
        ));

        let mut bad_account = config("ws://localhost/cable");
        bad_account.account_id = 0;
        assert!(matches!(
            bad_account.websocket_url(),
            Err(SyncError::InvalidConfig(_))
        ));
    }
}
