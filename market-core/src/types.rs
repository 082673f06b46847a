use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{MarketError, MarketResult, ValidationErrors};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UserType {
    Buyer,
    Broker,
}

text_enum!(UserType { Buyer => "buyer", Broker => "broker" });

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KycStatus {
    NotSubmitted,
    Pending,
    Verified,
    Rejected,
}

text_enum!(KycStatus {
    NotSubmitted => "not_submitted",
    Pending => "pending",
    Verified => "verified",
    Rejected => "rejected",
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Urgency {
    Low,
    Medium,
    High,
    Immediate,
}

text_enum!(Urgency {
    Low => "low",
    Medium => "medium",
    High => "high",
    Immediate => "immediate",
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequirementStatus {
    Active,
    Matched,
    Closed,
}

text_enum!(RequirementStatus {
    Active => "active",
    Matched => "matched",
    Closed => "closed",
});

impl RequirementStatus {
    /// active -> matched -> closed, and active -> closed.
    pub fn can_transition_to(self, next: RequirementStatus) -> bool {
        matches!(
            (self, next),
            (RequirementStatus::Active, RequirementStatus::Matched)
                | (RequirementStatus::Active, RequirementStatus::Closed)
                | (RequirementStatus::Matched, RequirementStatus::Closed)
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PropertyStatus {
    Active,
    Sold,
    Inactive,
}

text_enum!(PropertyStatus {
    Active => "active",
    Sold => "sold",
    Inactive => "inactive",
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalStatus {
    Pending,
    Approved,
    Rejected,
}

text_enum!(ApprovalStatus {
    Pending => "pending",
    Approved => "approved",
    Rejected => "rejected",
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LeadStatus {
    Pending,
    Approved,
    Rejected,
}

text_enum!(LeadStatus {
    Pending => "pending",
    Approved => "approved",
    Rejected => "rejected",
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LeadDecision {
    Approve,
    Reject,
}

impl LeadStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, LeadStatus::Pending)
    }

    /// The only transitions are pending -> approved and pending -> rejected.
    pub fn decide(self, lead_id: &str, decision: LeadDecision) -> MarketResult<LeadStatus> {
        if self.is_terminal() {
            return Err(MarketError::LeadAlreadyDecided {
                lead_id: lead_id.to_string(),
                status: self,
            });
        }
        Ok(match decision {
            LeadDecision::Approve => LeadStatus::Approved,
            LeadDecision::Reject => LeadStatus::Rejected,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionType {
    Debit,
    Credit,
    Refund,
}

text_enum!(TransactionType {
    Debit => "debit",
    Credit => "credit",
    Refund => "refund",
});

impl TransactionType {
    /// Balance effect of a transaction of `amount` coins.
    pub fn signed(self, amount: i64) -> i64 {
        match self {
            TransactionType::Debit => -amount,
            TransactionType::Credit | TransactionType::Refund => amount,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LeadRole {
    Broker,
    Buyer,
}

text_enum!(LeadRole { Broker => "broker", Buyer => "buyer" });

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Profile {
    pub id: String,
    pub email: String,
    pub user_type: UserType,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub company_name: Option<String>,
    pub phone: Option<String>,
    pub coin_balance: i64,
    pub kyc_status: KycStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Profile {
    pub fn public(&self) -> PublicProfile {
        PublicProfile {
            company_name: self.company_name.clone(),
            first_name: self.first_name.clone(),
            last_name: self.last_name.clone(),
        }
    }
}

/// Privacy-filtered projection of a profile.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PublicProfile {
    pub company_name: Option<String>,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
}

impl PublicProfile {
    /// "First Last", falling back to the company name, then "Unknown".
    pub fn display_name(&self) -> String {
        let person: Vec<&str> = [self.first_name.as_deref(), self.last_name.as_deref()]
            .into_iter()
            .flatten()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .collect();
        if !person.is_empty() {
            return person.join(" ");
        }
        match self.company_name.as_deref().map(str::trim) {
            Some(company) if !company.is_empty() => company.to_string(),
            _ => "Unknown".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewProfile {
    pub id: Option<String>,
    pub email: String,
    pub user_type: UserType,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub company_name: Option<String>,
    pub phone: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Requirement {
    pub id: String,
    pub buyer_id: String,
    pub property_type: String,
    pub location: Option<String>,
    pub budget_min: Option<i64>,
    pub budget_max: Option<i64>,
    pub area_min: Option<i32>,
    pub area_max: Option<i32>,
    pub bedrooms: Option<i32>,
    pub urgency: Urgency,
    pub notes: Option<String>,
    pub status: RequirementStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Buyer-submitted fields of a requirement, used for both create and edit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewRequirement {
    pub property_type: String,
    pub location: Option<String>,
    pub budget_min: Option<i64>,
    pub budget_max: Option<i64>,
    pub area_min: Option<i32>,
    pub area_max: Option<i32>,
    pub bedrooms: Option<i32>,
    pub urgency: Urgency,
    pub notes: Option<String>,
}

impl NewRequirement {
    pub fn validate(&self) -> ValidationErrors {
        let mut errors = ValidationErrors::new();
        if self.property_type.trim().is_empty() {
            errors.add("property_type", "property type is required");
        }
        for (field, value) in [("budget_min", self.budget_min), ("budget_max", self.budget_max)] {
            if matches!(value, Some(v) if v < 0) {
                errors.add(field, "must not be negative");
            }
        }
        if let (Some(min), Some(max)) = (self.budget_min, self.budget_max) {
            if min > max {
                errors.add("budget_min", "minimum budget must not exceed maximum budget");
            }
        }
        for (field, value) in [("area_min", self.area_min), ("area_max", self.area_max)] {
            if matches!(value, Some(v) if v < 0) {
                errors.add(field, "must not be negative");
            }
        }
        if let (Some(min), Some(max)) = (self.area_min, self.area_max) {
            if min > max {
                errors.add("area_min", "minimum area must not exceed maximum area");
            }
        }
        if matches!(self.bedrooms, Some(b) if b < 0) {
            errors.add("bedrooms", "must not be negative");
        }
        errors
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PropertyDraft {
    pub title: String,
    pub property_type: String,
    pub location: String,
    pub price: i64,
    pub area: Option<i32>,
    pub bedrooms: Option<i32>,
    pub description: Option<String>,
}

impl PropertyDraft {
    pub fn validate(&self) -> ValidationErrors {
        let mut errors = ValidationErrors::new();
        if self.title.trim().is_empty() {
            errors.add("title", "title is required");
        }
        if self.property_type.trim().is_empty() {
            errors.add("property_type", "property type is required");
        }
        if self.location.trim().is_empty() {
            errors.add("location", "location is required");
        }
        if self.price <= 0 {
            errors.add("price", "price must be greater than zero");
        }
        if matches!(self.area, Some(a) if a <= 0) {
            errors.add("area", "area must be greater than zero");
        }
        if matches!(self.bedrooms, Some(b) if b < 0) {
            errors.add("bedrooms", "must not be negative");
        }
        errors
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PropertyApproval {
    pub id: String,
    pub broker_id: String,
    pub draft: PropertyDraft,
    pub status: ApprovalStatus,
    pub reviewer_notes: Option<String>,
    pub property_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub reviewed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum ApprovalDecision {
    Approve { notes: Option<String> },
    Reject { notes: Option<String> },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Property {
    pub id: String,
    pub broker_id: String,
    pub approval_id: String,
    pub title: String,
    pub property_type: String,
    pub location: String,
    pub price: i64,
    pub area: Option<i32>,
    pub bedrooms: Option<i32>,
    pub description: Option<String>,
    pub status: PropertyStatus,
    /// Free-form label chosen by the broker, e.g. "under offer".
    pub user_status: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PropertySearch {
    pub property_type: Option<String>,
    pub location: Option<String>,
    pub min_price: Option<i64>,
    pub max_price: Option<i64>,
    pub limit: Option<i64>,
}

impl PropertySearch {
    pub fn matches(&self, property: &Property) -> bool {
        if property.status != PropertyStatus::Active {
            return false;
        }
        if let Some(kind) = &self.property_type {
            if !property.property_type.eq_ignore_ascii_case(kind) {
                return false;
            }
        }
        if let Some(location) = &self.location {
            let needle = location.to_lowercase();
            if !property.location.to_lowercase().contains(&needle) {
                return false;
            }
        }
        if matches!(self.min_price, Some(min) if property.price < min) {
            return false;
        }
        if matches!(self.max_price, Some(max) if property.price > max) {
            return false;
        }
        true
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PropertyMatch {
    pub id: String,
    pub broker_id: String,
    pub buyer_id: String,
    pub property_id: String,
    pub requirement_id: String,
    pub match_score: i32,
    pub is_lead_purchased: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A score produced by the external matching job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewPropertyMatch {
    pub broker_id: String,
    pub buyer_id: String,
    pub property_id: String,
    pub requirement_id: String,
    pub match_score: i32,
}

impl NewPropertyMatch {
    pub fn validate(&self) -> ValidationErrors {
        let mut errors = ValidationErrors::new();
        if !(0..=100).contains(&self.match_score) {
            errors.add("match_score", "score must be between 0 and 100");
        }
        errors
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MatchQuery {
    pub broker_id: String,
    /// Rows must score strictly above this.
    pub min_score: i32,
    pub unpurchased_only: bool,
    pub limit: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Lead {
    pub id: String,
    pub match_id: String,
    pub broker_id: String,
    pub buyer_id: String,
    pub property_id: String,
    pub requirement_id: String,
    pub lead_price: i64,
    pub status: LeadStatus,
    pub rejection_reason: Option<String>,
    pub chat_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub decided_at: Option<DateTime<Utc>>,
}

/// A lead with the property snapshot the buyer reviews.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LeadDetail {
    pub lead: Lead,
    pub property: Option<Property>,
    pub counterparty: PublicProfile,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WalletTransaction {
    pub id: String,
    pub user_id: String,
    pub amount: i64,
    pub tx_type: TransactionType,
    pub reference_id: Option<String>,
    pub description: Option<String>,
    pub balance_after: i64,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chat {
    pub id: String,
    pub lead_id: Option<String>,
    pub broker_id: String,
    pub buyer_id: String,
    pub is_active: bool,
    pub last_message_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl Chat {
    pub fn is_participant(&self, user_id: &str) -> bool {
        self.broker_id == user_id || self.buyer_id == user_id
    }

    pub fn counterparty_of(&self, user_id: &str) -> &str {
        if self.broker_id == user_id {
            &self.buyer_id
        } else {
            &self.broker_id
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatSummary {
    pub chat: Chat,
    pub counterparty: PublicProfile,
    pub last_message: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatDetail {
    pub chat: Chat,
    pub broker: PublicProfile,
    pub buyer: PublicProfile,
    pub lead: Option<Lead>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub chat_id: String,
    pub sender_id: String,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PurchaseLeadParams {
    pub match_id: String,
    pub buyer_id: String,
    pub lead_price: i64,
    pub requirement_id: String,
}

/// Result shape shared by `purchase_lead`, `approve_lead` and `reject_lead`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RpcOutcome {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chat_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub new_balance: Option<i64>,
}

impl RpcOutcome {
    pub fn ok() -> Self {
        Self {
            success: true,
            ..Self::default()
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
            ..Self::default()
        }
    }

    pub fn with_chat(mut self, chat_id: impl Into<String>) -> Self {
        self.chat_id = Some(chat_id.into());
        self
    }

    pub fn with_balance(mut self, balance: i64) -> Self {
        self.new_balance = Some(balance);
        self
    }

    /// Business rejections surface the same way as transport errors.
    pub fn into_result(self) -> MarketResult<RpcOutcome> {
        if self.success {
            Ok(self)
        } else {
            Err(MarketError::Rejected(
                self.error.unwrap_or_else(|| "request was rejected".to_string()),
            ))
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BrokerStats {
    pub coin_balance: i64,
    pub available_matches: i64,
    pub leads_purchased: i64,
    pub leads_pending: i64,
    pub leads_approved: i64,
    pub leads_rejected: i64,
}

pub fn new_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// Trims and drops blank optional text.
pub fn normalize_text(value: Option<&str>) -> Option<String> {
    value
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}
