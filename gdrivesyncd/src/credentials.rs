use std::path::{Path, PathBuf};

use gdrive_core::{ClientSecret, OAuthClient, OAuthError, OAuthToken};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const CLIENT_SECRET_FILE: &str = "client_secret.json";
pub const CREDENTIALS_DIR: &str = "google_drive_credentials";
const TOKEN_FILE: &str = "token.json";

const REFRESH_SKEW_SECS: i64 = 60;

#[derive(Debug, Error)]
pub enum CredentialError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("credential state is corrupt: {0}")]
    Corrupt(#[from] serde_json::Error),
    #[error("{0}")]
    OAuth(#[from] OAuthError),
    #[error("no stored credentials; authorize this machine first")]
    Missing,
    #[error("access token expired and no refresh token is stored")]
    CannotRefresh,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredToken {
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub expires_at: Option<i64>,
    #[serde(default)]
    pub scope: Option<String>,
    #[serde(default)]
    pub token_type: Option<String>,
}

impl StoredToken {
    pub fn from_oauth_token(token: &OAuthToken) -> Self {
        Self {
            access_token: token.access_token.clone(),
            refresh_token: token.refresh_token.clone(),
            expires_at: token
                .expires_in
                .map(|seconds| now_unix().saturating_add(seconds as i64)),
            scope: token.scope.clone(),
            token_type: Some(token.token_type.clone()),
        }
    }
}

/// Plain-file credential store under `google_drive_credentials/` in the
/// working directory.
pub struct CredentialStore {
    dir: PathBuf,
}

impl CredentialStore {
    pub fn new(work_dir: &Path) -> Self {
        Self {
            dir: work_dir.join(CREDENTIALS_DIR),
        }
    }

    pub fn load(&self) -> Result<StoredToken, CredentialError> {
        let raw = match std::fs::read_to_string(self.dir.join(TOKEN_FILE)) {
            Ok(raw) => raw,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Err(CredentialError::Missing);
            }
            Err(err) => return Err(err.into()),
        };
        Ok(serde_json::from_str(&raw)?)
    }

    pub fn save(&self, token: &StoredToken) -> Result<(), CredentialError> {
        std::fs::create_dir_all(&self.dir)?;
        let raw = serde_json::to_string_pretty(token)?;
        std::fs::write(self.dir.join(TOKEN_FILE), raw)?;
        Ok(())
    }
}

pub fn load_client_secret(work_dir: &Path) -> Result<Option<ClientSecret>, CredentialError> {
    let raw = match std::fs::read_to_string(work_dir.join(CLIENT_SECRET_FILE)) {
        Ok(raw) => raw,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(err.into()),
    };
    Ok(Some(ClientSecret::from_json(&raw)?))
}

/// Hands out an access token, refreshing through the OAuth collaborator
/// shortly before expiry.
pub struct TokenProvider {
    state: StoredToken,
    oauth_client: Option<OAuthClient>,
}

impl TokenProvider {
    pub fn new(state: StoredToken, oauth_client: Option<OAuthClient>) -> Self {
        Self {
            state,
            oauth_client,
        }
    }

    pub fn state(&self) -> &StoredToken {
        &self.state
    }

    pub async fn valid_access_token(&mut self) -> Result<String, CredentialError> {
        if self.should_refresh() {
            self.refresh().await?;
        }
        Ok(self.state.access_token.clone())
    }

    fn should_refresh(&self) -> bool {
        let Some(expires_at) = self.state.expires_at else {
            return false;
        };
        expires_at <= now_unix().saturating_add(REFRESH_SKEW_SECS)
    }

    async fn refresh(&mut self) -> Result<(), CredentialError> {
        let refresh_token = self
            .state
            .refresh_token
            .clone()
            .ok_or(CredentialError::CannotRefresh)?;
        let client = self
            .oauth_client
            .as_ref()
            .ok_or(CredentialError::CannotRefresh)?;
        let token = client.refresh_token(&refresh_token).await?;
        let mut refreshed = StoredToken::from_oauth_token(&token);
        if refreshed.refresh_token.is_none() {
            refreshed.refresh_token = Some(refresh_token);
        }
        if refreshed.scope.is_none() {
            refreshed.scope = self.state.scope.clone();
        }
        self.state = refreshed;
        Ok(())
    }
}

/// Resolves the access token for the daemon: the `GDRIVESYNC_TOKEN`
/// override if set, otherwise the stored credentials, refreshed and
/// persisted when stale.
pub async fn resolve_access_token(work_dir: &Path) -> Result<String, CredentialError> {
    if let Ok(token) = std::env::var("GDRIVESYNC_TOKEN") {
        return Ok(token);
    }

    let store = CredentialStore::new(work_dir);
    let state = store.load()?;
    let oauth_client = match load_client_secret(work_dir)? {
        Some(secret) => Some(OAuthClient::new(&secret)?),
        None => None,
    };

    let mut provider = TokenProvider::new(state, oauth_client);
    let token = provider.valid_access_token().await?;
    store.save(provider.state())?;
    Ok(token)
}

fn now_unix() -> i64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{body_string_contains, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[test]
    fn store_round_trips_token_state() {
        let dir = tempfile::tempdir().unwrap();
        let store = CredentialStore::new(dir.path());
        let token = StoredToken {
            access_token: "token-1".into(),
            refresh_token: Some("refresh-1".into()),
            expires_at: Some(1_700_000_000),
            scope: Some("https://www.googleapis.com/auth/drive".into()),
            token_type: Some("Bearer".into()),
        };

        store.save(&token).unwrap();
        let loaded = store.load().unwrap();

        assert_eq!(loaded.access_token, "token-1");
        assert_eq!(loaded.refresh_token.as_deref(), Some("refresh-1"));
        assert!(dir
            .path()
            .join(CREDENTIALS_DIR)
            .join("token.json")
            .exists());
    }

    #[test]
    fn missing_store_reports_missing() {
        let dir = tempfile::tempdir().unwrap();
        let store = CredentialStore::new(dir.path());
        assert!(matches!(store.load(), Err(CredentialError::Missing)));
    }

    #[tokio::test]
    async fn provider_returns_current_token_when_fresh() {
        let mut provider = TokenProvider::new(
            StoredToken {
                access_token: "token-1".into(),
                refresh_token: Some("refresh-1".into()),
                expires_at: Some(i64::MAX),
                scope: None,
                token_type: None,
            },
            None,
        );
        assert_eq!(provider.valid_access_token().await.unwrap(), "token-1");
    }

    #[tokio::test]
    async fn provider_refreshes_expired_token_and_keeps_refresh_token() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/token"))
            .and(body_string_contains("refresh_token=refresh-1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "access_token": "token-2",
                "token_type": "Bearer",
                "expires_in": 3600
            })))
            .mount(&server)
            .await;

        let oauth_client = OAuthClient::with_token_url(
            &format!("{}/token", server.uri()),
            "client-id",
            "secret",
        )
        .unwrap();
        let mut provider = TokenProvider::new(
            StoredToken {
                access_token: "token-1".into(),
                refresh_token: Some("refresh-1".into()),
                expires_at: Some(0),
                scope: Some("drive".into()),
                token_type: Some("Bearer".into()),
            },
            Some(oauth_client),
        );

        assert_eq!(provider.valid_access_token().await.unwrap(), "token-2");
        assert_eq!(provider.state().refresh_token.as_deref(), Some("refresh-1"));
        assert_eq!(provider.state().scope.as_deref(), Some("drive"));
    }

    #[tokio::test]
    async fn expired_token_without_refresh_is_an_error() {
        let mut provider = TokenProvider::new(
            StoredToken {
                access_token: "token-1".into(),
                refresh_token: None,
                expires_at: Some(0),
                scope: None,
                token_type: None,
            },
            None,
        );
        assert!(matches!(
            provider.valid_access_token().await,
            Err(CredentialError::CannotRefresh)
        ));
    }
}
