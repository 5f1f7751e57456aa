use async_trait::async_trait;
use time::OffsetDateTime;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::auth::device::{SilentAuth, TokenResponse};
use crate::auth::tokens::{StoredTokens, TokenStore};
use crate::error::{Error, Result};
use crate::provider::types::TokenSource;

/// Refresh before the access token gets this close to expiry.
const REFRESH_WINDOW_SECS: i64 = 300;

/// Throttle back-off schedule for silent acquisition. The token endpoint
/// rate-limits aggressively; a long sync must never acquire per call.
const THROTTLE_BACKOFF_SECS: [u64; 3] = [10, 20, 30];

#[derive(Debug, Clone)]
struct CachedToken {
    value: String,
    expires_on: OffsetDateTime,
}

#[derive(Debug, Clone, PartialEq)]
pub enum AuthStatus {
    SignedOut,
    /// Access token expired but a refresh token is on hand.
    NeedsRefresh,
    SignedIn { expires_on: OffsetDateTime },
}

/// Process-wide bearer-token supplier. One cache, one outstanding silent
/// acquisition at a time, proactive refresh.
pub struct CredentialGateway {
    auth: Box<dyn SilentAuth>,
    store: TokenStore,
    cache: Mutex<Option<CachedToken>>,
}

impl std::fmt::Debug for CredentialGateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialGateway").finish_non_exhaustive()
    }
}

impl CredentialGateway {
    pub fn new(auth: Box<dyn SilentAuth>, store: TokenStore) -> Self {
        Self {
            auth,
            store,
            cache: Mutex::new(None),
        }
    }

    /// Current access token, refreshing silently when the cached one is
    /// within the expiry window. All provider calls funnel through here.
    pub async fn access_token(&self) -> Result<String> {
        let mut cache = self.cache.lock().await;
        let now = OffsetDateTime::now_utc();
        if let Some(cached) = cache.as_ref() {
            if (cached.expires_on - now).whole_seconds() > REFRESH_WINDOW_SECS {
                return Ok(cached.value.clone());
            }
            debug!("cached token near expiry, re-acquiring");
            *cache = None;
        }

        let stored = self
            .store
            .load()?
            .ok_or_else(|| Error::Auth("not signed in; run `magpie auth login` first".into()))?;

        let fresh = if !stored.expires_within(REFRESH_WINDOW_SECS, now) {
            stored.clone()
        } else {
            let refresh_token = stored.refresh_token.clone().ok_or_else(|| {
                Error::Auth("access token expired and no refresh token is stored".into())
            })?;
            let response = self.redeem_with_backoff(&refresh_token).await?;
            let renewed = StoredTokens {
                access_token: response.access_token,
                // the authority may rotate the refresh token
                refresh_token: response.refresh_token.or(Some(refresh_token)),
                expires_at: now.unix_timestamp() + response.expires_in as i64,
            };
            self.store.save(&renewed)?;
            info!("access token refreshed silently");
            renewed
        };

        let token = CachedToken {
            value: fresh.access_token.clone(),
            expires_on: fresh.expires_on(),
        };
        *cache = Some(token);
        Ok(fresh.access_token)
    }

    async fn redeem_with_backoff(&self, refresh_token: &str) -> Result<TokenResponse> {
        let mut last_throttle = None;
        for (attempt, delay) in THROTTLE_BACKOFF_SECS.iter().enumerate() {
            match self.auth.redeem_refresh_token(refresh_token).await {
                Err(Error::Throttled(detail)) => {
                    debug!(attempt, delay, "token endpoint throttled, backing off");
                    last_throttle = Some(detail);
                    tokio::time::sleep(std::time::Duration::from_secs(*delay)).await;
                }
                other => return other,
            }
        }
        match self.auth.redeem_refresh_token(refresh_token).await {
            Err(Error::Throttled(detail)) => Err(Error::Throttled(
                last_throttle.map_or(detail, |first| format!("{first} (retries exhausted)")),
            )),
            other => other,
        }
    }

    /// Persist a freshly granted token pair (from `auth login`).
    pub fn store_grant(&self, response: &TokenResponse) -> Result<()> {
        let tokens = StoredTokens {
            access_token: response.access_token.clone(),
            refresh_token: response.refresh_token.clone(),
            expires_at: OffsetDateTime::now_utc().unix_timestamp() + response.expires_in as i64,
        };
        self.store.save(&tokens)
    }

    /// Cache and store only; never reaches the network.
    pub async fn status(&self) -> Result<AuthStatus> {
        let now = OffsetDateTime::now_utc();
        if let Some(cached) = self.cache.lock().await.as_ref() {
            if (cached.expires_on - now).whole_seconds() > 0 {
                return Ok(AuthStatus::SignedIn {
                    expires_on: cached.expires_on,
                });
            }
        }
        match self.store.load()? {
            None => Ok(AuthStatus::SignedOut),
            Some(stored) if stored.expires_within(0, now) => {
                if stored.refresh_token.is_some() {
                    Ok(AuthStatus::NeedsRefresh)
                } else {
                    Ok(AuthStatus::SignedOut)
                }
            }
            Some(stored) => Ok(AuthStatus::SignedIn {
                expires_on: stored.expires_on(),
            }),
        }
    }

    pub async fn sign_out(&self) -> Result<()> {
        *self.cache.lock().await = None;
        self.store.clear()
    }
}

#[async_trait]
impl TokenSource for CredentialGateway {
    async fn bearer_token(&self) -> Result<String> {
        self.access_token().await
    }
}
