use axum::{
    async_trait,
    extract::FromRequestParts,
    http::{request::Parts, StatusCode},
};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha512};
use sqlx::SqlitePool;
use time::Duration;
use tower_sessions::{
    cookie::{Key, SameSite},
    service::SignedCookie,
    ExpiredDeletion, Expiry, Session, SessionManagerLayer,
};
use tower_sessions_sqlx_store::SqliteStore;
use tracing::{error, warn};

use crate::confirmation::Purpose;

const CONFIRMATION_KEY: &str = "confirmed";
const WRITER_KEY: &str = "writer";

/// How often expired session rows are purged
const CLEANUP_INTERVAL: tokio::time::Duration = tokio::time::Duration::from_secs(60);

pub type SessionLayer = SessionManagerLayer<SqliteStore, SignedCookie>;

/// Set by a verified token, consumed by the next request to the route of
/// the same purpose.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfirmationState {
    pub email: String,
    pub purpose: Option<Purpose>,
    pub confirmed: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriterState {
    pub email: String,
    pub logged_in: bool,
}

/// Session rows live next to the site's own tables.
pub async fn session_store(pool: &SqlitePool) -> anyhow::Result<SqliteStore> {
    let store = SqliteStore::new(pool.clone());
    store.migrate().await?;
    Ok(store)
}

/// Purges expired sessions in the background until the process exits.
pub fn spawn_expired_cleanup(store: SqliteStore) {
    tokio::spawn(async move {
        if let Err(e) = store.continuously_delete_expired(CLEANUP_INTERVAL).await {
            error!("Session cleanup task stopped: {}", e);
        }
    });
}

/// Cookie signing key derived from the configured secret, or a throwaway one.
pub fn session_key(secret: Option<&str>) -> Key {
    match secret {
        Some(secret) if !secret.is_empty() => {
            let digest = Sha512::digest(secret.as_bytes());
            Key::from(digest.as_slice())
        }
        _ => {
            warn!("No secret_key configured; generating ephemeral session key");
            Key::generate()
        }
    }
}

pub fn session_layer(store: SqliteStore, key: Key, secure: bool) -> SessionLayer {
    SessionManagerLayer::new(store)
        .with_secure(secure)
        .with_http_only(true)
        .with_same_site(SameSite::Lax)
        .with_expiry(Expiry::OnInactivity(Duration::hours(2)))
        .with_signed(key)
}

/// Typed view over the request's session.
pub struct SessionContext {
    session: Session,
}

impl SessionContext {
    pub fn new(session: Session) -> Self {
        Self { session }
    }

    pub async fn confirmation(&self) -> anyhow::Result<Option<ConfirmationState>> {
        Ok(self.session.get(CONFIRMATION_KEY).await?)
    }

    pub async fn set_confirmation(
        &self,
        email: &str,
        purpose: Option<Purpose>,
        confirmed: bool,
    ) -> anyhow::Result<()> {
        let state = ConfirmationState {
            email: email.to_string(),
            purpose,
            confirmed,
        };
        self.session.insert(CONFIRMATION_KEY, state).await?;
        Ok(())
    }

    /// The logged-in writer's email, if any.
    pub async fn writer_email(&self) -> anyhow::Result<Option<String>> {
        let state: Option<WriterState> = self.session.get(WRITER_KEY).await?;
        Ok(state.filter(|w| w.logged_in).map(|w| w.email))
    }

    pub async fn log_in_writer(&self, email: &str) -> anyhow::Result<()> {
        // New identity, new session id
        self.session.cycle_id().await?;
        let state = WriterState {
            email: email.to_string(),
            logged_in: true,
        };
        self.session.insert(WRITER_KEY, state).await?;
        Ok(())
    }

    pub async fn log_out_writer(&self) -> anyhow::Result<()> {
        self.session.remove::<WriterState>(WRITER_KEY).await?;
        Ok(())
    }
}

#[async_trait]
impl<S> FromRequestParts<S> for SessionContext
where
    S: Send + Sync,
{
    type Rejection = (StatusCode, &'static str);

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let session = Session::from_request_parts(parts, state).await?;
        Ok(Self::new(session))
    }
}
