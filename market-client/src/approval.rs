use market_core::error::{MarketError, MarketResult};
use market_core::types::{LeadDetail, LeadRole, LeadStatus, RpcOutcome};

use crate::cache::{keys, QueryKey};
use crate::client::MarketClient;

impl MarketClient {
    /// Leads addressed to the signed-in buyer.
    pub async fn buyer_leads(&self, status: Option<LeadStatus>) -> MarketResult<Vec<LeadDetail>> {
        let session = self.signed_in()?;
        let key = keys::leads_with_status(keys::buyer_leads(&session.user_id), status);
        self.cache
            .fetch(key, || self.backend.list_leads(&session.user_id, LeadRole::Buyer, status))
            .await
    }

    /// Leads the signed-in broker has bought.
    pub async fn broker_leads(&self, status: Option<LeadStatus>) -> MarketResult<Vec<LeadDetail>> {
        let session = self.signed_in()?;
        let key = keys::leads_with_status(keys::broker_leads(&session.user_id), status);
        self.cache
            .fetch(key, || self.backend.list_leads(&session.user_id, LeadRole::Broker, status))
            .await
    }

    pub async fn approve_lead(&self, lead_id: &str) -> MarketResult<RpcOutcome> {
        let session = self.signed_in()?;
        self.ensure_undecided(&session.user_id, lead_id)?;
        let result = self
            .backend
            .approve_lead(&session.user_id, lead_id)
            .await
            .and_then(|o| o.into_result());
        self.finish_decision(&session.user_id, lead_id, "Lead approved", "You can now chat with the broker.", result)
    }

    pub async fn reject_lead(&self, lead_id: &str, reason: Option<&str>) -> MarketResult<RpcOutcome> {
        let session = self.signed_in()?;
        self.ensure_undecided(&session.user_id, lead_id)?;
        let reason = reason.map(str::trim).filter(|r| !r.is_empty());
        let result = self
            .backend
            .reject_lead(&session.user_id, lead_id, reason)
            .await
            .and_then(|o| o.into_result());
        self.finish_decision(&session.user_id, lead_id, "Lead rejected", "The broker has been refunded.", result)
    }

    /// Refuses leads the cached listing already shows as decided. The backend
    /// enforces this regardless.
    fn ensure_undecided(&self, buyer_id: &str, lead_id: &str) -> MarketResult<()> {
        let cached: Option<Vec<LeadDetail>> = self
            .cache
            .peek(&keys::leads_with_status(keys::buyer_leads(buyer_id), None));
        let decided = cached
            .iter()
            .flatten()
            .find(|d| d.lead.id == lead_id && d.lead.status.is_terminal());
        match decided {
            Some(detail) => Err(MarketError::LeadAlreadyDecided {
                lead_id: lead_id.to_string(),
                status: detail.lead.status,
            }),
            None => Ok(()),
        }
    }

    fn finish_decision(
        &self,
        buyer_id: &str,
        lead_id: &str,
        title: &str,
        message: &str,
        result: MarketResult<RpcOutcome>,
    ) -> MarketResult<RpcOutcome> {
        match result {
            Ok(outcome) => {
                // Approval moves the requirement to matched.
                let affected: [QueryKey; 3] = [
                    keys::buyer_leads(buyer_id),
                    keys::chats(buyer_id),
                    keys::requirements(buyer_id),
                ];
                self.invalidate(&affected);
                self.notifier.success(title, message);
                Ok(outcome)
            }
            Err(e) => {
                tracing::warn!("Decision on lead {} failed: {}", lead_id, e);
                self.notifier.error("Could not update lead", &e.to_string());
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notify::NoticeLevel;
    use crate::testing::Fixture;
    use market_core::types::RequirementStatus;
    use market_core::MarketBackend;

    async fn purchased(f: &Fixture) -> String {
        f.purchase_directly(&f.matches[0]).await;
        f.backend
            .list_leads(&f.buyer.id, LeadRole::Buyer, None)
            .await
            .unwrap()
            .remove(0)
            .lead
            .id
    }

    #[tokio::test]
    async fn test_reject_with_reason_is_stored_verbatim() {
        let f = Fixture::new(500).await;
        let lead_id = purchased(&f).await;
        let client = f.client_for(&f.buyer).await;

        client.reject_lead(&lead_id, Some("wrong budget")).await.unwrap();

        let leads = client.buyer_leads(None).await.unwrap();
        assert_eq!(leads[0].lead.status, LeadStatus::Rejected);
        assert_eq!(leads[0].lead.rejection_reason.as_deref(), Some("wrong budget"));
        let chats = f.backend.get_user_chats(&f.buyer.id).await.unwrap();
        assert!(chats.iter().all(|c| !c.chat.is_active));
    }

    #[tokio::test]
    async fn test_blank_reason_becomes_none() {
        let f = Fixture::new(500).await;
        let lead_id = purchased(&f).await;
        let client = f.client_for(&f.buyer).await;

        client.reject_lead(&lead_id, Some("   ")).await.unwrap();
        let leads = client.buyer_leads(Some(LeadStatus::Rejected)).await.unwrap();
        assert_eq!(leads[0].lead.rejection_reason, None);
    }

    #[tokio::test]
    async fn test_decided_lead_is_refused_locally() {
        let f = Fixture::new(500).await;
        let lead_id = purchased(&f).await;
        let client = f.client_for(&f.buyer).await;

        let outcome = client.approve_lead(&lead_id).await.unwrap();
        assert!(outcome.chat_id.is_some());
        assert_eq!(client.buyer_leads(None).await.unwrap()[0].lead.status, LeadStatus::Approved);

        let err = client.reject_lead(&lead_id, None).await.unwrap_err();
        assert!(matches!(
            err,
            MarketError::LeadAlreadyDecided { status: LeadStatus::Approved, .. }
        ));
        assert_eq!(client.buyer_leads(None).await.unwrap()[0].lead.status, LeadStatus::Approved);
    }

    #[tokio::test]
    async fn test_backend_refuses_decided_lead_without_cache() {
        let f = Fixture::new(500).await;
        let lead_id = purchased(&f).await;
        f.backend.approve_lead(&f.buyer.id, &lead_id).await.unwrap();

        let client = f.client_for(&f.buyer).await;
        let err = client.reject_lead(&lead_id, Some("changed my mind")).await.unwrap_err();
        assert!(matches!(err, MarketError::Rejected(_)));
        assert_eq!(f.notifier.last().unwrap().level, NoticeLevel::Error);
    }

    #[tokio::test]
    async fn test_approval_refreshes_cached_requirements() {
        let f = Fixture::new(500).await;
        let lead_id = purchased(&f).await;
        let client = f.client_for(&f.buyer).await;

        let before = client.requirements().await.unwrap();
        assert_eq!(before[0].status, RequirementStatus::Active);
        assert!(client.cache().is_fresh(&keys::requirements(&f.buyer.id)));

        client.approve_lead(&lead_id).await.unwrap();

        let after = client.requirements().await.unwrap();
        assert_eq!(after[0].id, f.requirement.id);
        assert_eq!(after[0].status, RequirementStatus::Matched);
    }
}
