use std::sync::Arc;
use std::time::Duration;

use market_core::config::MarketplaceConfig;
use market_core::error::MarketResult;
use market_core::types::{BrokerStats, Profile, UserType};
use market_core::MarketBackend;

use crate::cache::{keys, QueryCache, QueryKey};
use crate::invalidation::InvalidationTable;
use crate::notify::{Notice, NoticeAction, NoticeLevel, Notifier, TracingNotifier};
use crate::realtime::{ListenerHandle, RealtimeListener};
use crate::session::{Session, SessionContext};

/// Entry point for the marketplace views.
///
/// Cloning is cheap; clones share the backend, cache, session and notifier.
#[derive(Clone)]
pub struct MarketClient {
    pub(crate) backend: Arc<dyn MarketBackend>,
    pub(crate) cache: Arc<QueryCache>,
    pub(crate) session: Arc<SessionContext>,
    pub(crate) notifier: Arc<dyn Notifier>,
    pub(crate) config: MarketplaceConfig,
}

impl MarketClient {
    pub fn new(backend: Arc<dyn MarketBackend>, config: MarketplaceConfig) -> Self {
        let cache = QueryCache::new(Duration::from_secs(config.cache_stale_after_secs));
        Self {
            backend,
            cache: Arc::new(cache),
            session: Arc::new(SessionContext::new()),
            notifier: Arc::new(TracingNotifier),
            config,
        }
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = notifier;
        self
    }

    pub fn backend(&self) -> &Arc<dyn MarketBackend> {
        &self.backend
    }

    pub fn cache(&self) -> &Arc<QueryCache> {
        &self.cache
    }

    pub fn session(&self) -> &SessionContext {
        &self.session
    }

    pub fn config(&self) -> &MarketplaceConfig {
        &self.config
    }

    /// Account type registered for an email, checked before requesting a
    /// magic link.
    pub async fn account_type(&self, email: &str) -> MarketResult<Option<UserType>> {
        self.backend.get_account_type_by_email(email).await
    }

    /// Starts a session for a user the identity provider has authenticated.
    pub async fn sign_in(&self, user_id: &str, email: &str) -> MarketResult<Profile> {
        self.session.sign_in(Session::new(user_id, email));
        match self.session.refresh_profile(self.backend.as_ref()).await {
            Ok(profile) => Ok(profile),
            Err(e) => {
                self.session.sign_out();
                Err(e)
            }
        }
    }

    pub fn sign_out(&self) {
        self.session.sign_out();
        self.cache.clear();
    }

    pub async fn profile(&self) -> MarketResult<Profile> {
        let session = self.signed_in()?;
        let profile: Profile = self
            .cache
            .fetch(keys::profile(&session.user_id), || {
                self.backend.get_profile(&session.user_id)
            })
            .await?;
        self.session.set_profile(profile.clone());
        Ok(profile)
    }

    pub async fn broker_stats(&self) -> MarketResult<BrokerStats> {
        let session = self.signed_in()?;
        self.cache
            .fetch(keys::broker_stats(&session.user_id), || {
                self.backend.get_broker_stats(&session.user_id)
            })
            .await
    }

    /// Subscribes the user's dashboards to pushed changes. `None` when the
    /// backend has no in-process feed.
    pub async fn listen(&self) -> MarketResult<Option<ListenerHandle>> {
        let Some(feed) = self.backend.change_feed() else {
            return Ok(None);
        };
        let session = self.signed_in()?;
        let user_type = match self.session.user_type() {
            Some(user_type) => user_type,
            None => self.session.refresh_profile(self.backend.as_ref()).await?.user_type,
        };
        let table = InvalidationTable::for_user(&session.user_id, user_type);
        Ok(Some(RealtimeListener::spawn(feed, table, self.cache.clone())))
    }

    /// Current session. Without one the user is prompted to sign in.
    pub(crate) fn signed_in(&self) -> MarketResult<Session> {
        self.session.require().map_err(|e| {
            self.notifier.notify(
                Notice::new(NoticeLevel::Error, "Not signed in", "Sign in to continue.")
                    .with_action(NoticeAction::SignIn),
            );
            e
        })
    }

    pub(crate) fn invalidate(&self, keys: &[QueryKey]) {
        for key in keys {
            self.cache.invalidate(key);
        }
    }
}
