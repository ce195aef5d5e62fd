//! Process-wide session state: the signed-in user and the credential pair.
//!
//! The session is the single owner of the credentials. It is mutated only by
//! [`Session::sign_in`], [`Session::replace_tokens`] and [`Session::sign_out`];
//! every other component reads a snapshot at dispatch time or watches for
//! changes through [`Session::subscribe`].

use secrecy::{ExposeSecret, Secret, SecretString};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{watch, Mutex};
use tracing::{info, instrument, warn};

use crate::capabilities::{KeyNamespace, KvError, KvStore, TypedKv};
use crate::model::{TokenPair, User, UserId};

const PERSISTED_KEY: &str = "credentials";

/// One issued credential pair. `generation` increases every time the pair is
/// replaced, so a request can tell whether the token it was sent with is
/// still the current one.
#[derive(Clone)]
pub struct Credentials {
    access_token: Arc<SecretString>,
    refresh_token: Arc<SecretString>,
    pub expires_in: u64,
    pub generation: u64,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("access_token", &"[REDACTED]")
            .field("refresh_token", &"[REDACTED]")
            .field("expires_in", &self.expires_in)
            .field("generation", &self.generation)
            .finish()
    }
}

impl Credentials {
    fn from_pair(pair: TokenPair, generation: u64) -> Self {
        Self {
            access_token: Arc::new(Secret::new(pair.access_token)),
            refresh_token: Arc::new(Secret::new(pair.refresh_token)),
            expires_in: pair.expires_in,
            generation,
        }
    }

    pub fn access_token(&self) -> &SecretString {
        &self.access_token
    }

    pub fn refresh_token(&self) -> &SecretString {
        &self.refresh_token
    }

    pub fn has_refresh_token(&self) -> bool {
        !self.refresh_token.expose_secret().is_empty()
    }

    pub fn bearer(&self) -> String {
        format!("Bearer {}", self.access_token.expose_secret())
    }

    fn to_pair(&self) -> TokenPair {
        TokenPair {
            access_token: self.access_token.expose_secret().clone(),
            refresh_token: self.refresh_token.expose_secret().clone(),
            expires_in: self.expires_in,
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct SessionState {
    pub user: Option<User>,
    pub credentials: Option<Credentials>,
}

impl SessionState {
    pub fn is_authenticated(&self) -> bool {
        self.credentials.is_some()
    }
}

#[derive(Serialize, Deserialize)]
struct PersistedSession {
    user: User,
    token: TokenPair,
}

struct SessionInner {
    state: watch::Sender<SessionState>,
    store: Option<TypedKv<PersistedSession>>,
    /// Serializes every write to `store`. Snapshots are taken under it so a
    /// save can never land after the sign-out that cleared the state.
    writes: Mutex<()>,
    generation: AtomicU64,
}

#[derive(Clone)]
pub struct Session {
    inner: Arc<SessionInner>,
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.state.borrow();
        f.debug_struct("Session")
            .field("user_id", &state.user.as_ref().map(|u| u.id))
            .field("authenticated", &state.is_authenticated())
            .field("persistent", &self.inner.store.is_some())
            .finish()
    }
}

impl Session {
    /// A session that lives only in memory.
    pub fn new() -> Self {
        Self::build(None)
    }

    /// A session persisted under the `session` namespace of `store`.
    pub fn with_store(store: Arc<dyn KvStore>) -> Self {
        Self::build(Some(TypedKv::new(store, KeyNamespace::Session)))
    }

    fn build(store: Option<TypedKv<PersistedSession>>) -> Self {
        let (state, _) = watch::channel(SessionState::default());
        Self {
            inner: Arc::new(SessionInner {
                state,
                store,
                writes: Mutex::new(()),
                generation: AtomicU64::new(0),
            }),
        }
    }

    fn next_generation(&self) -> u64 {
        self.inner.generation.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Loads a previously persisted session. Returns whether one was found.
    #[instrument(skip(self))]
    pub async fn restore(&self) -> Result<bool, KvError> {
        let Some(store) = &self.inner.store else {
            return Ok(false);
        };
        let Some(persisted) = store.load(PERSISTED_KEY).await? else {
            return Ok(false);
        };
        if persisted.token.access_token.is_empty() {
            warn!("Discarding persisted session without an access token");
            let _writes = self.inner.writes.lock().await;
            store.remove(PERSISTED_KEY).await?;
            return Ok(false);
        }

        let user_id = persisted.user.id;
        let credentials = Credentials::from_pair(persisted.token, self.next_generation());
        self.inner.state.send_replace(SessionState {
            user: Some(persisted.user),
            credentials: Some(credentials),
        });
        info!(%user_id, "Session restored");
        Ok(true)
    }

    pub fn snapshot(&self) -> SessionState {
        self.inner.state.borrow().clone()
    }

    pub fn credentials(&self) -> Option<Credentials> {
        self.inner.state.borrow().credentials.clone()
    }

    pub fn current_user(&self) -> Option<User> {
        self.inner.state.borrow().user.clone()
    }

    pub fn current_user_id(&self) -> Option<UserId> {
        self.inner.state.borrow().user.as_ref().map(|u| u.id)
    }

    pub fn is_authenticated(&self) -> bool {
        self.inner.state.borrow().is_authenticated()
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.inner.state.subscribe()
    }

    #[instrument(skip(self, user, tokens), fields(user_id = %user.id))]
    pub async fn sign_in(&self, user: User, tokens: TokenPair) -> Credentials {
        let credentials = Credentials::from_pair(tokens, self.next_generation());
        self.inner.state.send_replace(SessionState {
            user: Some(user),
            credentials: Some(credentials.clone()),
        });
        info!(generation = credentials.generation, "Signed in");
        self.persist().await;
        credentials
    }

    /// Installs a refreshed pair, but only if the session still holds the
    /// generation the refresh was started from. A session that was signed out
    /// or signed in again meanwhile is left untouched and `None` is returned.
    #[instrument(skip(self, tokens))]
    pub async fn replace_tokens(
        &self,
        expected_generation: u64,
        tokens: TokenPair,
    ) -> Option<Credentials> {
        let mut installed = None;
        self.inner.state.send_if_modified(|state| {
            let current = state
                .credentials
                .as_ref()
                .map_or(false, |c| c.generation == expected_generation);
            if !current {
                return false;
            }
            let fresh = Credentials::from_pair(tokens, self.next_generation());
            installed = Some(fresh.clone());
            state.credentials = Some(fresh);
            true
        });

        match &installed {
            Some(credentials) => {
                info!(generation = credentials.generation, "Credentials refreshed");
                self.persist().await;
            }
            None => warn!("Refreshed credentials discarded; session changed during refresh"),
        }
        installed
    }

    #[instrument(skip(self))]
    pub async fn sign_out(&self) {
        let was_authenticated = self.inner.state.send_if_modified(|state| {
            if state.user.is_none() && state.credentials.is_none() {
                return false;
            }
            *state = SessionState::default();
            true
        });

        if let Some(store) = &self.inner.store {
            let _writes = self.inner.writes.lock().await;
            if let Err(e) = store.remove(PERSISTED_KEY).await {
                warn!(error = %e, "Failed to clear persisted session");
            }
        }
        if was_authenticated {
            info!("Signed out");
        }
    }

    pub async fn update_user(&self, user: User) {
        let updated = self.inner.state.send_if_modified(|state| {
            if state.credentials.is_none() {
                return false;
            }
            state.user = Some(user);
            true
        });
        if updated {
            self.persist().await;
        }
    }

    async fn persist(&self) {
        let Some(store) = &self.inner.store else {
            return;
        };
        let _writes = self.inner.writes.lock().await;
        let persisted = {
            let state = self.inner.state.borrow();
            match (&state.user, &state.credentials) {
                (Some(user), Some(credentials)) => Some(PersistedSession {
                    user: user.clone(),
                    token: credentials.to_pair(),
                }),
                _ => None,
            }
        };
        if let Some(persisted) = persisted {
            if let Err(e) = store.save(PERSISTED_KEY, &persisted).await {
                warn!(error = %e, "Failed to persist session; continuing in memory");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capabilities::MemoryKvStore;
    use crate::model::UserType;

    fn user(id: i64) -> User {
        User {
            id: UserId(id),
            phone: "13800000000".into(),
            nickname: "pilot".into(),
            avatar_url: String::new(),
            user_type: UserType::Renter,
            id_verified: "verified".into(),
            credit_score: 100,
            status: "active".into(),
            created_at: String::new(),
        }
    }

    fn pair(tag: &str) -> TokenPair {
        TokenPair {
            access_token: format!("access-{tag}"),
            refresh_token: format!("refresh-{tag}"),
            expires_in: 7200,
        }
    }

    #[tokio::test]
    async fn test_sign_in_and_out() {
        let session = Session::new();
        assert!(!session.is_authenticated());

        let creds = session.sign_in(user(1), pair("a")).await;
        assert_eq!(creds.bearer(), "Bearer access-a");
        assert_eq!(session.current_user_id(), Some(UserId(1)));

        session.sign_out().await;
        assert!(session.credentials().is_none());
        assert!(session.current_user().is_none());
    }

    #[tokio::test]
    async fn test_replace_tokens_bumps_generation() {
        let session = Session::new();
        let first = session.sign_in(user(1), pair("a")).await;
        let second = session
            .replace_tokens(first.generation, pair("b"))
            .await
            .unwrap();
        assert!(second.generation > first.generation);
        assert_eq!(session.credentials().unwrap().bearer(), "Bearer access-b");
    }

    #[tokio::test]
    async fn test_replace_tokens_after_sign_out_is_discarded() {
        let session = Session::new();
        let first = session.sign_in(user(1), pair("a")).await;
        session.sign_out().await;
        assert!(session.replace_tokens(first.generation, pair("b")).await.is_none());
        assert!(!session.is_authenticated());
    }

    #[tokio::test]
    async fn test_replace_tokens_with_stale_generation_is_discarded() {
        let session = Session::new();
        let first = session.sign_in(user(1), pair("a")).await;
        session.sign_in(user(1), pair("c")).await;
        assert!(session.replace_tokens(first.generation, pair("b")).await.is_none());
        assert_eq!(session.credentials().unwrap().bearer(), "Bearer access-c");
    }

    #[tokio::test]
    async fn test_persisted_session_restores() {
        let store: Arc<dyn KvStore> = Arc::new(MemoryKvStore::new());
        let session = Session::with_store(store.clone());
        session.sign_in(user(9), pair("a")).await;

        let restored = Session::with_store(store.clone());
        assert!(restored.restore().await.unwrap());
        assert_eq!(restored.current_user_id(), Some(UserId(9)));
        assert_eq!(restored.credentials().unwrap().bearer(), "Bearer access-a");

        restored.sign_out().await;
        let empty = Session::with_store(store);
        assert!(!empty.restore().await.unwrap());
    }

    #[tokio::test]
    async fn test_subscribers_see_sign_out() {
        let session = Session::new();
        session.sign_in(user(1), pair("a")).await;
        let mut rx = session.subscribe();
        session.sign_out().await;
        rx.changed().await.unwrap();
        assert!(!rx.borrow().is_authenticated());
    }

    #[test]
    fn test_debug_does_not_leak_tokens() {
        let creds = Credentials::from_pair(pair("secret"), 1);
        let rendered = format!("{creds:?}");
        assert!(!rendered.contains("access-secret"));
        assert!(!rendered.contains("refresh-secret"));
    }
}
