use async_trait::async_trait;
use tokio::sync::broadcast;

use crate::changes::ChangeEvent;
use crate::error::MarketResult;
use crate::types::*;

/// The operations the marketplace front end relies on.
///
/// Row-level authorisation is applied against the acting user id passed to
/// each call. The three lead procedures report business rejections as
/// `RpcOutcome { success: false, .. }` and reserve `Err` for authorisation,
/// lookup and storage failures.
#[async_trait]
pub trait MarketBackend: Send + Sync {
    async fn get_account_type_by_email(&self, email: &str) -> MarketResult<Option<UserType>>;

    async fn create_profile(&self, profile: NewProfile) -> MarketResult<Profile>;

    async fn get_profile(&self, user_id: &str) -> MarketResult<Profile>;

    async fn get_profile_public(&self, target_user_id: &str) -> MarketResult<PublicProfile>;

    async fn set_kyc_status(&self, user_id: &str, status: KycStatus) -> MarketResult<Profile>;

    // Matching

    async fn list_property_matches(&self, query: MatchQuery) -> MarketResult<Vec<PropertyMatch>>;

    /// Records a score produced by the matching job.
    async fn upsert_property_match(&self, new_match: NewPropertyMatch) -> MarketResult<PropertyMatch>;

    // Lead procedures

    /// Debits the broker, records the ledger entry, flags the match, creates a
    /// pending lead and its chat. All or nothing.
    async fn purchase_lead(&self, broker_id: &str, params: PurchaseLeadParams) -> MarketResult<RpcOutcome>;

    async fn approve_lead(&self, buyer_id: &str, lead_id: &str) -> MarketResult<RpcOutcome>;

    async fn reject_lead(
        &self,
        buyer_id: &str,
        lead_id: &str,
        rejection_reason: Option<&str>,
    ) -> MarketResult<RpcOutcome>;

    async fn list_leads(
        &self,
        user_id: &str,
        role: LeadRole,
        status: Option<LeadStatus>,
    ) -> MarketResult<Vec<LeadDetail>>;

    // Wallet

    async fn credit_coins(
        &self,
        user_id: &str,
        amount: i64,
        reference_id: Option<&str>,
    ) -> MarketResult<WalletTransaction>;

    /// Full history, newest first.
    async fn list_wallet_transactions(&self, user_id: &str) -> MarketResult<Vec<WalletTransaction>>;

    async fn get_broker_stats(&self, broker_id: &str) -> MarketResult<BrokerStats>;

    // Chat

    async fn get_user_chats(&self, user_id: &str) -> MarketResult<Vec<ChatSummary>>;

    async fn get_chat_by_id(&self, user_id: &str, chat_id: &str) -> MarketResult<ChatDetail>;

    /// Messages ordered by `created_at` ascending.
    async fn get_chat_messages(&self, user_id: &str, chat_id: &str) -> MarketResult<Vec<Message>>;

    async fn send_message(&self, user_id: &str, chat_id: &str, content: &str) -> MarketResult<Message>;

    // Requirements

    async fn create_requirement(&self, buyer_id: &str, input: NewRequirement) -> MarketResult<Requirement>;

    async fn update_requirement(
        &self,
        buyer_id: &str,
        requirement_id: &str,
        input: NewRequirement,
    ) -> MarketResult<Requirement>;

    async fn set_requirement_status(
        &self,
        buyer_id: &str,
        requirement_id: &str,
        status: RequirementStatus,
    ) -> MarketResult<Requirement>;

    async fn list_requirements(&self, buyer_id: &str) -> MarketResult<Vec<Requirement>>;

    async fn get_requirement(&self, requirement_id: &str) -> MarketResult<Requirement>;

    // Properties

    async fn submit_property(&self, broker_id: &str, draft: PropertyDraft) -> MarketResult<PropertyApproval>;

    async fn review_property_approval(
        &self,
        approval_id: &str,
        decision: ApprovalDecision,
    ) -> MarketResult<PropertyApproval>;

    async fn list_property_approvals(&self, broker_id: &str) -> MarketResult<Vec<PropertyApproval>>;

    async fn list_broker_properties(&self, broker_id: &str) -> MarketResult<Vec<Property>>;

    async fn search_properties(&self, search: PropertySearch) -> MarketResult<Vec<Property>>;

    async fn get_property(&self, property_id: &str) -> MarketResult<Property>;

    async fn set_property_status(
        &self,
        broker_id: &str,
        property_id: &str,
        status: PropertyStatus,
        user_status: Option<&str>,
    ) -> MarketResult<Property>;

    /// In-process change subscription, when the backend has one. Backends that
    /// publish through the outbox return `None`.
    fn change_feed(&self) -> Option<broadcast::Receiver<ChangeEvent>> {
        None
    }
}
