use market_core::error::{MarketError, MarketResult};
use market_core::types::{Profile, UserType};
use market_core::MarketBackend;
use tokio::sync::watch;

#[derive(Debug, Clone, PartialEq)]
pub struct Session {
    pub user_id: String,
    pub email: String,
    /// `None` until the profile has been loaded.
    pub profile: Option<Profile>,
}

impl Session {
    pub fn new(user_id: impl Into<String>, email: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            email: email.into(),
            profile: None,
        }
    }
}

/// Auth and profile state shared by every view.
///
/// Observers call [`SessionContext::subscribe`] and stop observing by dropping
/// the receiver.
#[derive(Debug)]
pub struct SessionContext {
    tx: watch::Sender<Option<Session>>,
}

impl Default for SessionContext {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionContext {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(None);
        Self { tx }
    }

    pub fn subscribe(&self) -> watch::Receiver<Option<Session>> {
        self.tx.subscribe()
    }

    pub fn current(&self) -> Option<Session> {
        self.tx.borrow().clone()
    }

    pub fn is_signed_in(&self) -> bool {
        self.tx.borrow().is_some()
    }

    pub fn sign_in(&self, session: Session) {
        tracing::info!("Session started for user {}", session.user_id);
        self.tx.send_replace(Some(session));
    }

    pub fn sign_out(&self) {
        if let Some(previous) = self.tx.send_replace(None) {
            tracing::info!("Session ended for user {}", previous.user_id);
        }
    }

    /// Ignored while signed out or when the profile belongs to someone else.
    pub fn set_profile(&self, profile: Profile) {
        self.tx.send_if_modified(|state| match state {
            Some(session) if session.user_id == profile.id => {
                session.profile = Some(profile);
                true
            }
            _ => false,
        });
    }

    pub fn set_coin_balance(&self, balance: i64) {
        self.tx.send_if_modified(|state| {
            match state.as_mut().and_then(|s| s.profile.as_mut()) {
                Some(profile) if profile.coin_balance != balance => {
                    profile.coin_balance = balance;
                    true
                }
                _ => false,
            }
        });
    }

    pub async fn refresh_profile(&self, backend: &dyn MarketBackend) -> MarketResult<Profile> {
        let session = self.require()?;
        let profile = backend.get_profile(&session.user_id).await?;
        self.set_profile(profile.clone());
        Ok(profile)
    }

    /// The active session, or `Unauthenticated` for a sign-in redirect.
    pub fn require(&self) -> MarketResult<Session> {
        self.current().ok_or(MarketError::Unauthenticated)
    }

    pub fn profile(&self) -> Option<Profile> {
        self.tx.borrow().as_ref().and_then(|s| s.profile.clone())
    }

    pub fn coin_balance(&self) -> Option<i64> {
        self.tx
            .borrow()
            .as_ref()
            .and_then(|s| s.profile.as_ref())
            .map(|p| p.coin_balance)
    }

    pub fn user_type(&self) -> Option<UserType> {
        self.tx
            .borrow()
            .as_ref()
            .and_then(|s| s.profile.as_ref())
            .map(|p| p.user_type)
    }
}
