use std::fmt;
use std::time::{Duration, Instant};

use serde::Deserialize;

const DEFAULT_TOKEN_LIFETIME: Duration = Duration::from_secs(3600);

/// Password-grant credentials. `Debug` never prints the secrets.
#[derive(Clone)]
pub struct Credentials {
    pub client_id: String,
    pub client_secret: String,
    pub username: String,
    pub password: String,
}

impl Credentials {
    pub fn grant_form(&self) -> Vec<(String, String)> {
        vec![
            ("grant_type".to_string(), "password".to_string()),
            ("client_id".to_string(), self.client_id.clone()),
            ("client_secret".to_string(), self.client_secret.clone()),
            ("username".to_string(), self.username.clone()),
            ("password".to_string(), self.password.clone()),
        ]
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("client_id", &self.client_id)
            .field("username", &self.username)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Deserialize)]
pub struct TokenResponse {
    pub access_token: String,
    #[serde(default)]
    pub expires_in: Option<u64>,
    #[serde(default)]
    pub token_type: Option<String>,
}

#[derive(Clone)]
struct CachedToken {
    value: String,
    expires_at: Instant,
}

/// Holds the current bearer token and decides when it must be refreshed.
pub struct TokenCache {
    token: Option<CachedToken>,
    refresh_buffer: Duration,
}

impl TokenCache {
    pub fn new(refresh_buffer: Duration) -> Self {
        Self {
            token: None,
            refresh_buffer,
        }
    }

    /// Returns the cached token unless it expires within the refresh buffer.
    pub fn current(&self, now: Instant) -> Option<&str> {
        self.token
            .as_ref()
            .filter(|token| now + self.refresh_buffer < token.expires_at)
            .map(|token| token.value.as_str())
    }

    pub fn store(&mut self, response: TokenResponse, now: Instant) -> String {
        let lifetime = response
            .expires_in
            .map(Duration::from_secs)
            .unwrap_or(DEFAULT_TOKEN_LIFETIME);
        let value = response.access_token;
        self.token = Some(CachedToken {
            value: value.clone(),
            expires_at: now + lifetime,
        });
        value
    }

    pub fn invalidate(&mut self) {
        self.token = None;
    }
}

impl fmt::Debug for TokenCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenCache")
            .field("cached", &self.token.is_some())
            .field("refresh_buffer", &self.refresh_buffer)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn token(expires_in: Option<u64>) -> TokenResponse {
        TokenResponse {
            access_token: "abc".to_string(),
            expires_in,
            token_type: Some("Bearer".to_string()),
        }
    }

    #[test]
    fn token_is_refreshed_inside_the_buffer() {
        let start = Instant::now();
        let mut cache = TokenCache::new(Duration::from_secs(60));
        cache.store(token(Some(300)), start);

        assert_eq!(cache.current(start + Duration::from_secs(200)), Some("abc"));
        assert_eq!(cache.current(start + Duration::from_secs(240)), None);
    }

    #[test]
    fn missing_expiry_falls_back_to_an_hour() {
        let start = Instant::now();
        let mut cache = TokenCache::new(Duration::from_secs(60));
        cache.store(token(None), start);

        assert!(cache.current(start + Duration::from_secs(3_500)).is_some());
        cache.invalidate();
        assert!(cache.current(start).is_none());
    }

    #[test]
    fn debug_hides_secrets() {
        let credentials = Credentials {
            client_id: "etl".into(),
            client_secret: "s3cret".into(),
            username: "loader".into(),
            password: "hunter2".into(),
        };
        let rendered = format!("{credentials:?}");
        assert!(!rendered.contains("s3cret"));
        assert!(!rendered.contains("hunter2"));
        assert_eq!(credentials.grant_form()[0].1, "password");
    }
}
