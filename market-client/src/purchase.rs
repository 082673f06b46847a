use std::time::Duration;

use market_core::error::{MarketError, MarketResult};
use market_core::types::PurchaseLeadParams;

use crate::cache::keys;
use crate::client::MarketClient;
use crate::matching::MatchRow;
use crate::notify::{Notice, NoticeAction, NoticeLevel};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PurchaseOutcome {
    pub chat_id: Option<String>,
    pub new_balance: Option<i64>,
    /// How long the success notice stays up before the chat opens.
    pub navigate_after: Duration,
}

impl MarketClient {
    /// Buys the lead behind a listed match.
    ///
    /// The balance check here only saves a round trip; the backend procedure
    /// decides.
    pub async fn purchase_lead(&self, row: &MatchRow) -> MarketResult<PurchaseOutcome> {
        let session = self.signed_in()?;
        let price = self.config.lead_price;
        let balance = match self.session.coin_balance() {
            Some(balance) => balance,
            None => self.session.refresh_profile(self.backend.as_ref()).await?.coin_balance,
        };
        if balance < price {
            self.notifier.notify(
                Notice::new(
                    NoticeLevel::Error,
                    "Insufficient coins",
                    format!("This lead costs {} coins and you have {}. Refill your wallet to continue.", price, balance),
                )
                .with_action(NoticeAction::RefillCoins),
            );
            return Err(MarketError::InsufficientBalance {
                balance,
                required: price,
            });
        }

        let params = PurchaseLeadParams {
            match_id: row.match_id.clone(),
            buyer_id: row.buyer_id.clone(),
            lead_price: price,
            requirement_id: row.requirement.id.clone(),
        };
        let outcome = match self
            .backend
            .purchase_lead(&session.user_id, params)
            .await
            .and_then(|o| o.into_result())
        {
            Ok(outcome) => outcome,
            Err(e) => {
                tracing::warn!("Lead purchase for match {} failed: {}", row.match_id, e);
                self.notifier.error("Purchase failed", &e.to_string());
                return Err(e);
            }
        };

        self.sync_balance(outcome.new_balance).await;
        self.invalidate(&[
            keys::matches(&session.user_id),
            keys::broker_stats(&session.user_id),
            keys::broker_leads(&session.user_id),
            keys::chats(&session.user_id),
            keys::wallet_transactions(&session.user_id),
            keys::profile(&session.user_id),
        ]);

        let mut notice = Notice::new(
            NoticeLevel::Success,
            "Lead purchased",
            format!("{} coins spent. Opening your chat with the buyer.", price),
        );
        if let Some(chat_id) = &outcome.chat_id {
            notice = notice.with_action(NoticeAction::OpenChat(chat_id.clone()));
        }
        self.notifier.notify(notice);

        Ok(PurchaseOutcome {
            chat_id: outcome.chat_id,
            new_balance: outcome.new_balance,
            navigate_after: Duration::from_millis(self.config.navigation_delay_ms),
        })
    }

    /// Applies the balance the backend reported, or reloads the profile. A
    /// failed reload is only logged.
    async fn sync_balance(&self, new_balance: Option<i64>) {
        match new_balance {
            Some(balance) => self.session.set_coin_balance(balance),
            None => {
                if let Err(e) = self.session.refresh_profile(self.backend.as_ref()).await {
                    tracing::warn!("Could not reload balance after purchase: {}", e);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::matching::MatchListing;
    use crate::testing::Fixture;
    use crate::session::Session;
    use market_core::types::{LeadRole, LeadStatus, MatchQuery, TransactionType};
    use market_core::MarketBackend;

    #[tokio::test]
    async fn test_insufficient_balance_blocks_without_backend_call() {
        let f = Fixture::new(50).await;
        let client = f.client_for(&f.broker).await;
        let row = client.matches(MatchListing::Full).await.unwrap().remove(0);

        let err = client.purchase_lead(&row).await.unwrap_err();
        assert!(matches!(err, MarketError::InsufficientBalance { balance: 50, required: 100 }));

        let notice = f.notifier.last().unwrap();
        assert_eq!(notice.level, NoticeLevel::Error);
        assert_eq!(notice.action, Some(NoticeAction::RefillCoins));

        assert_eq!(f.backend.get_profile(&f.broker.id).await.unwrap().coin_balance, 50);
        assert!(f
            .backend
            .list_leads(&f.broker.id, LeadRole::Broker, None)
            .await
            .unwrap()
            .is_empty());
        let matches = f
            .backend
            .list_property_matches(MatchQuery {
                broker_id: f.broker.id.clone(),
                min_score: 0,
                unpurchased_only: false,
                limit: None,
            })
            .await
            .unwrap();
        assert!(!matches[0].is_lead_purchased);
    }

    #[tokio::test]
    async fn test_successful_purchase_updates_balance_and_listing() {
        let f = Fixture::new(200).await;
        let client = f.client_for(&f.broker).await;
        let row = client.matches(MatchListing::Full).await.unwrap().remove(0);

        let outcome = client.purchase_lead(&row).await.unwrap();
        assert!(outcome.chat_id.as_deref().is_some_and(|id| !id.is_empty()));
        assert_eq!(outcome.new_balance, Some(100));
        assert_eq!(outcome.navigate_after, Duration::from_millis(1500));
        assert_eq!(client.session().coin_balance(), Some(100));

        let txs = f.backend.list_wallet_transactions(&f.broker.id).await.unwrap();
        let debits: Vec<_> = txs.iter().filter(|t| t.tx_type == TransactionType::Debit).collect();
        assert_eq!(debits.len(), 1);
        assert_eq!(debits[0].amount, 100);

        let leads = f.backend.list_leads(&f.broker.id, LeadRole::Broker, None).await.unwrap();
        assert_eq!(leads.len(), 1);
        assert_eq!(leads[0].lead.status, LeadStatus::Pending);

        let listing = client.matches(MatchListing::Full).await.unwrap();
        assert!(listing.iter().all(|r| r.match_id != row.match_id));
        assert_eq!(f.notifier.last().unwrap().level, NoticeLevel::Success);
    }

    #[tokio::test]
    async fn test_rejected_purchase_leaves_local_state() {
        let f = Fixture::new(500).await;
        let client = f.client_for(&f.broker).await;
        let row = client.matches(MatchListing::Full).await.unwrap().remove(0);

        // Another device buys it first.
        f.purchase_directly(&f.matches[0]).await;

        let err = client.purchase_lead(&row).await.unwrap_err();
        assert!(matches!(err, MarketError::Rejected(ref reason) if reason == "Lead already purchased"));
        assert_eq!(client.session().coin_balance(), Some(500));
        assert_eq!(f.notifier.last().unwrap().level, NoticeLevel::Error);
    }

    #[tokio::test]
    async fn test_failed_balance_reload_is_not_an_error() {
        let f = Fixture::new(500).await;
        let client = f.client_for(&f.broker).await;

        client.sync_balance(Some(400)).await;
        assert_eq!(client.session().coin_balance(), Some(400));

        // A session whose profile the backend cannot load.
        client.session.sign_in(Session::new("ghost", "ghost@example.com"));
        client.sync_balance(None).await;
        assert!(client.session().is_signed_in());
        assert_eq!(client.session().coin_balance(), None);
    }
}
