//! Postgres implementation of [`MarketBackend`].
//!
//! Lead procedures run inside a single transaction and lock the rows they
//! read. Every mutation appends its change events to `market_outbox` in the
//! same transaction; `market-outbox` publishes them.

use anyhow::anyhow;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use diesel::prelude::*;
use diesel_async::scoped_futures::ScopedFutureExt;
use diesel_async::{AsyncConnection, RunQueryDsl};
use std::sync::Arc;

use crate::backend::MarketBackend;
use crate::changes::{ChangeEvent, Table};
use crate::db::{DbConnection, DbPool};
use crate::encryption::{decrypt_message, encrypt_message};
use crate::error::{MarketError, MarketResult};
use crate::memory::{message_change, purchase_rejection};
use crate::schema::{
    chats, leads, market_outbox, messages, profiles, properties, property_approvals,
    property_matches, requirements, wallet_transactions,
};
use crate::types::*;

diesel::define_sql_function! { fn lower(x: diesel::sql_types::Text) -> diesel::sql_types::Text; }

#[derive(Queryable, Selectable, Insertable, Clone)]
#[diesel(table_name = profiles)]
#[diesel(check_for_backend(diesel::pg::Pg))]
struct ProfileRow {
    id: String,
    email: String,
    user_type: String,
    first_name: Option<String>,
    last_name: Option<String>,
    company_name: Option<String>,
    phone: Option<String>,
    coin_balance: i64,
    kyc_status: String,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<ProfileRow> for Profile {
    type Error = MarketError;

    fn try_from(row: ProfileRow) -> MarketResult<Self> {
        Ok(Profile {
            id: row.id,
            email: row.email,
            user_type: row.user_type.parse()?,
            first_name: row.first_name,
            last_name: row.last_name,
            company_name: row.company_name,
            phone: row.phone,
            coin_balance: row.coin_balance,
            kyc_status: row.kyc_status.parse()?,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(Queryable, Selectable, Insertable)]
#[diesel(table_name = requirements)]
#[diesel(check_for_backend(diesel::pg::Pg))]
struct RequirementRow {
    id: String,
    buyer_id: String,
    property_type: String,
    location: Option<String>,
    budget_min: Option<i64>,
    budget_max: Option<i64>,
    area_min: Option<i32>,
    area_max: Option<i32>,
    bedrooms: Option<i32>,
    urgency: String,
    notes: Option<String>,
    status: String,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<RequirementRow> for Requirement {
    type Error = MarketError;

    fn try_from(row: RequirementRow) -> MarketResult<Self> {
        Ok(Requirement {
            id: row.id,
            buyer_id: row.buyer_id,
            property_type: row.property_type,
            location: row.location,
            budget_min: row.budget_min,
            budget_max: row.budget_max,
            area_min: row.area_min,
            area_max: row.area_max,
            bedrooms: row.bedrooms,
            urgency: row.urgency.parse()?,
            notes: row.notes,
            status: row.status.parse()?,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(Queryable, Selectable, Insertable)]
#[diesel(table_name = property_approvals)]
#[diesel(check_for_backend(diesel::pg::Pg))]
struct ApprovalRow {
    id: String,
    broker_id: String,
    draft: serde_json::Value,
    status: String,
    reviewer_notes: Option<String>,
    property_id: Option<String>,
    created_at: DateTime<Utc>,
    reviewed_at: Option<DateTime<Utc>>,
}

impl TryFrom<ApprovalRow> for PropertyApproval {
    type Error = MarketError;

    fn try_from(row: ApprovalRow) -> MarketResult<Self> {
        let draft = serde_json::from_value(row.draft)
            .map_err(|e| anyhow!("Invalid property draft in approval {}: {}", row.id, e))?;
        Ok(PropertyApproval {
            id: row.id,
            broker_id: row.broker_id,
            draft,
            status: row.status.parse()?,
            reviewer_notes: row.reviewer_notes,
            property_id: row.property_id,
            created_at: row.created_at,
            reviewed_at: row.reviewed_at,
        })
    }
}

#[derive(Queryable, Selectable, Insertable)]
#[diesel(table_name = properties)]
#[diesel(check_for_backend(diesel::pg::Pg))]
struct PropertyRow {
    id: String,
    broker_id: String,
    approval_id: String,
    title: String,
    property_type: String,
    location: String,
    price: i64,
    area: Option<i32>,
    bedrooms: Option<i32>,
    description: Option<String>,
    status: String,
    user_status: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<PropertyRow> for Property {
    type Error = MarketError;

    fn try_from(row: PropertyRow) -> MarketResult<Self> {
        Ok(Property {
            id: row.id,
            broker_id: row.broker_id,
            approval_id: row.approval_id,
            title: row.title,
            property_type: row.property_type,
            location: row.location,
            price: row.price,
            area: row.area,
            bedrooms: row.bedrooms,
            description: row.description,
            status: row.status.parse()?,
            user_status: row.user_status,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(Queryable, Selectable, Insertable)]
#[diesel(table_name = property_matches)]
#[diesel(check_for_backend(diesel::pg::Pg))]
struct MatchRow {
    id: String,
    broker_id: String,
    buyer_id: String,
    property_id: String,
    requirement_id: String,
    match_score: i32,
    is_lead_purchased: bool,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl From<MatchRow> for PropertyMatch {
    fn from(row: MatchRow) -> Self {
        PropertyMatch {
            id: row.id,
            broker_id: row.broker_id,
            buyer_id: row.buyer_id,
            property_id: row.property_id,
            requirement_id: row.requirement_id,
            match_score: row.match_score,
            is_lead_purchased: row.is_lead_purchased,
            created_at: row.created_at,
            updated_at: row.updated_at,
        }
    }
}

#[derive(Queryable, Selectable, Insertable)]
#[diesel(table_name = leads)]
#[diesel(check_for_backend(diesel::pg::Pg))]
struct LeadRow {
    id: String,
    match_id: String,
    broker_id: String,
    buyer_id: String,
    property_id: String,
    requirement_id: String,
    lead_price: i64,
    status: String,
    rejection_reason: Option<String>,
    chat_id: Option<String>,
    created_at: DateTime<Utc>,
    decided_at: Option<DateTime<Utc>>,
}

impl TryFrom<LeadRow> for Lead {
    type Error = MarketError;

    fn try_from(row: LeadRow) -> MarketResult<Self> {
        Ok(Lead {
            id: row.id,
            match_id: row.match_id,
            broker_id: row.broker_id,
            buyer_id: row.buyer_id,
            property_id: row.property_id,
            requirement_id: row.requirement_id,
            lead_price: row.lead_price,
            status: row.status.parse()?,
            rejection_reason: row.rejection_reason,
            chat_id: row.chat_id,
            created_at: row.created_at,
            decided_at: row.decided_at,
        })
    }
}

impl From<&Lead> for LeadRow {
    fn from(lead: &Lead) -> Self {
        LeadRow {
            id: lead.id.clone(),
            match_id: lead.match_id.clone(),
            broker_id: lead.broker_id.clone(),
            buyer_id: lead.buyer_id.clone(),
            property_id: lead.property_id.clone(),
            requirement_id: lead.requirement_id.clone(),
            lead_price: lead.lead_price,
            status: lead.status.as_str().to_string(),
            rejection_reason: lead.rejection_reason.clone(),
            chat_id: lead.chat_id.clone(),
            created_at: lead.created_at,
            decided_at: lead.decided_at,
        }
    }
}

#[derive(Queryable, Selectable, Insertable)]
#[diesel(table_name = wallet_transactions)]
#[diesel(check_for_backend(diesel::pg::Pg))]
struct TransactionRow {
    id: String,
    user_id: String,
    amount: i64,
    tx_type: String,
    reference_id: Option<String>,
    description: Option<String>,
    balance_after: i64,
    created_at: DateTime<Utc>,
}

impl TryFrom<TransactionRow> for WalletTransaction {
    type Error = MarketError;

    fn try_from(row: TransactionRow) -> MarketResult<Self> {
        Ok(WalletTransaction {
            id: row.id,
            user_id: row.user_id,
            amount: row.amount,
            tx_type: row.tx_type.parse()?,
            reference_id: row.reference_id,
            description: row.description,
            balance_after: row.balance_after,
            created_at: row.created_at,
        })
    }
}

#[derive(Queryable, Selectable, Insertable, Clone)]
#[diesel(table_name = chats)]
#[diesel(check_for_backend(diesel::pg::Pg))]
struct ChatRow {
    id: String,
    lead_id: Option<String>,
    broker_id: String,
    buyer_id: String,
    is_active: bool,
    last_message_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
}

impl From<ChatRow> for Chat {
    fn from(row: ChatRow) -> Self {
        Chat {
            id: row.id,
            lead_id: row.lead_id,
            broker_id: row.broker_id,
            buyer_id: row.buyer_id,
            is_active: row.is_active,
            last_message_at: row.last_message_at,
            created_at: row.created_at,
        }
    }
}

impl From<&Chat> for ChatRow {
    fn from(chat: &Chat) -> Self {
        ChatRow {
            id: chat.id.clone(),
            lead_id: chat.lead_id.clone(),
            broker_id: chat.broker_id.clone(),
            buyer_id: chat.buyer_id.clone(),
            is_active: chat.is_active,
            last_message_at: chat.last_message_at,
            created_at: chat.created_at,
        }
    }
}

#[derive(Queryable, Selectable, Insertable)]
#[diesel(table_name = messages)]
#[diesel(check_for_backend(diesel::pg::Pg))]
struct MessageRow {
    id: String,
    chat_id: String,
    sender_id: String,
    /// Base64 AES-256-GCM ciphertext.
    content: String,
    created_at: DateTime<Utc>,
}

pub struct PgBackend {
    pool: Arc<DbPool>,
    encryption_key: String,
}

impl PgBackend {
    pub fn new(pool: Arc<DbPool>, encryption_key: impl Into<String>) -> Self {
        Self {
            pool,
            encryption_key: encryption_key.into(),
        }
    }

    async fn conn(&self) -> MarketResult<DbConnection> {
        self.pool
            .get()
            .await
            .map_err(|e| MarketError::Internal(anyhow!("Failed to get database connection: {}", e)))
    }

    fn decrypt(&self, row: MessageRow) -> MarketResult<Message> {
        let content = decrypt_message(&row.content, &row.chat_id, &self.encryption_key)?;
        Ok(Message {
            id: row.id,
            chat_id: row.chat_id,
            sender_id: row.sender_id,
            content,
            created_at: row.created_at,
        })
    }
}

async fn record_change(conn: &mut DbConnection, event: ChangeEvent) -> MarketResult<()> {
    diesel::insert_into(market_outbox::table)
        .values((
            market_outbox::table_name.eq(event.table.as_str()),
            market_outbox::change_kind.eq(event.kind.as_str()),
            market_outbox::record.eq(event.record),
            market_outbox::old_record.eq(event.old_record),
        ))
        .execute(conn)
        .await?;
    Ok(())
}

async fn find_profile(conn: &mut DbConnection, id: &str, lock: bool) -> MarketResult<Profile> {
    let query = profiles::table.find(id).select(ProfileRow::as_select());
    let row = if lock {
        query.for_update().first(conn).await.optional()?
    } else {
        query.first(conn).await.optional()?
    };
    row.ok_or_else(|| MarketError::not_found("profile", id))?
        .try_into()
}

async fn find_public_profile(conn: &mut DbConnection, id: &str) -> MarketResult<PublicProfile> {
    let row: Option<(Option<String>, Option<String>, Option<String>)> = profiles::table
        .find(id)
        .select((profiles::company_name, profiles::first_name, profiles::last_name))
        .first(conn)
        .await
        .optional()?;
    Ok(row
        .map(|(company_name, first_name, last_name)| PublicProfile {
            company_name,
            first_name,
            last_name,
        })
        .unwrap_or_default())
}

async fn find_lead(conn: &mut DbConnection, id: &str) -> MarketResult<Lead> {
    leads::table
        .find(id)
        .select(LeadRow::as_select())
        .for_update()
        .first(conn)
        .await
        .optional()?
        .ok_or_else(|| MarketError::not_found("lead", id))?
        .try_into()
}

async fn find_chat(conn: &mut DbConnection, id: &str) -> MarketResult<Chat> {
    chats::table
        .find(id)
        .select(ChatRow::as_select())
        .first(conn)
        .await
        .optional()?
        .map(Chat::from)
        .ok_or_else(|| MarketError::not_found("chat", id))
}

async fn participant_chat(conn: &mut DbConnection, user_id: &str, chat_id: &str) -> MarketResult<Chat> {
    let chat = find_chat(conn, chat_id).await?;
    if !chat.is_participant(user_id) {
        return Err(MarketError::Forbidden(format!(
            "user {} is not a participant of chat {}",
            user_id, chat_id
        )));
    }
    Ok(chat)
}

/// Applies a balance change and records its ledger entry in the caller's
/// transaction. The profile row must already be locked.
async fn post_transaction(
    conn: &mut DbConnection,
    profile: &Profile,
    amount: i64,
    tx_type: TransactionType,
    reference_id: Option<&str>,
    description: &str,
) -> MarketResult<WalletTransaction> {
    let new_balance = profile.coin_balance + tx_type.signed(amount);
    if new_balance < 0 {
        return Err(MarketError::InsufficientBalance {
            balance: profile.coin_balance,
            required: amount,
        });
    }
    let now = Utc::now();
    diesel::update(profiles::table.find(&profile.id))
        .set((
            profiles::coin_balance.eq(new_balance),
            profiles::updated_at.eq(now),
        ))
        .execute(conn)
        .await?;
    let mut updated = profile.clone();
    updated.coin_balance = new_balance;
    updated.updated_at = now;
    record_change(conn, ChangeEvent::update(Table::Profiles, profile, &updated)).await?;

    let row = TransactionRow {
        id: new_id(),
        user_id: profile.id.clone(),
        amount,
        tx_type: tx_type.as_str().to_string(),
        reference_id: reference_id.map(str::to_string),
        description: Some(description.to_string()),
        balance_after: new_balance,
        created_at: now,
    };
    diesel::insert_into(wallet_transactions::table)
        .values(&row)
        .execute(conn)
        .await?;
    let tx = WalletTransaction::try_from(row)?;
    record_change(conn, ChangeEvent::insert(Table::WalletTransactions, &tx)).await?;
    Ok(tx)
}

async fn lead_detail(conn: &mut DbConnection, lead: Lead, role: LeadRole) -> MarketResult<LeadDetail> {
    let property = properties::table
        .find(&lead.property_id)
        .select(PropertyRow::as_select())
        .first(conn)
        .await
        .optional()?
        .map(Property::try_from)
        .transpose()?;
    let counterparty_id = match role {
        LeadRole::Broker => lead.buyer_id.clone(),
        LeadRole::Buyer => lead.broker_id.clone(),
    };
    let counterparty = find_public_profile(conn, &counterparty_id).await?;
    Ok(LeadDetail {
        lead,
        property,
        counterparty,
    })
}

#[async_trait]
impl MarketBackend for PgBackend {
    async fn get_account_type_by_email(&self, email: &str) -> MarketResult<Option<UserType>> {
        let mut conn = self.conn().await?;
        let user_type: Option<String> = profiles::table
            .filter(lower(profiles::email).eq(email.trim().to_lowercase()))
            .select(profiles::user_type)
            .first(&mut conn)
            .await
            .optional()?;
        user_type.map(|t| t.parse()).transpose()
    }

    async fn create_profile(&self, input: NewProfile) -> MarketResult<Profile> {
        let email = input.email.trim().to_string();
        if email.is_empty() || !email.contains('@') {
            return Err(MarketError::validation("email", "a valid email is required"));
        }
        if self.get_account_type_by_email(&email).await?.is_some() {
            return Err(MarketError::validation("email", "email is already registered"));
        }
        let now = Utc::now();
        let row = ProfileRow {
            id: input.id.unwrap_or_else(new_id),
            email,
            user_type: input.user_type.as_str().to_string(),
            first_name: normalize_text(input.first_name.as_deref()),
            last_name: normalize_text(input.last_name.as_deref()),
            company_name: normalize_text(input.company_name.as_deref()),
            phone: normalize_text(input.phone.as_deref()),
            coin_balance: 0,
            kyc_status: KycStatus::NotSubmitted.as_str().to_string(),
            created_at: now,
            updated_at: now,
        };
        let mut conn = self.conn().await?;
        conn.transaction::<_, MarketError, _>(|conn| {
            async move {
                diesel::insert_into(profiles::table)
                    .values(&row)
                    .execute(conn)
                    .await?;
                let profile = Profile::try_from(row)?;
                record_change(conn, ChangeEvent::insert(Table::Profiles, &profile)).await?;
                Ok(profile)
            }
            .scope_boxed()
        })
        .await
    }

    async fn get_profile(&self, user_id: &str) -> MarketResult<Profile> {
        let mut conn = self.conn().await?;
        find_profile(&mut conn, user_id, false).await
    }

    async fn get_profile_public(&self, target_user_id: &str) -> MarketResult<PublicProfile> {
        let mut conn = self.conn().await?;
        Ok(find_profile(&mut conn, target_user_id, false).await?.public())
    }

    async fn set_kyc_status(&self, user_id: &str, status: KycStatus) -> MarketResult<Profile> {
        let mut conn = self.conn().await?;
        conn.transaction::<_, MarketError, _>(|conn| {
            async move {
                let before = find_profile(conn, user_id, true).await?;
                let now = Utc::now();
                diesel::update(profiles::table.find(user_id))
                    .set((
                        profiles::kyc_status.eq(status.as_str()),
                        profiles::updated_at.eq(now),
                    ))
                    .execute(conn)
                    .await?;
                let mut after = before.clone();
                after.kyc_status = status;
                after.updated_at = now;
                record_change(conn, ChangeEvent::update(Table::Profiles, &before, &after)).await?;
                Ok(after)
            }
            .scope_boxed()
        })
        .await
    }

    async fn list_property_matches(&self, query: MatchQuery) -> MarketResult<Vec<PropertyMatch>> {
        let mut conn = self.conn().await?;
        let mut q = property_matches::table
            .filter(property_matches::broker_id.eq(&query.broker_id))
            .filter(property_matches::match_score.gt(query.min_score))
            .order((
                property_matches::match_score.desc(),
                property_matches::created_at.asc(),
            ))
            .select(MatchRow::as_select())
            .into_boxed();
        if query.unpurchased_only {
            q = q.filter(property_matches::is_lead_purchased.eq(false));
        }
        if let Some(limit) = query.limit {
            q = q.limit(limit.max(0));
        }
        let rows: Vec<MatchRow> = q.load(&mut conn).await?;
        Ok(rows.into_iter().map(PropertyMatch::from).collect())
    }

    async fn upsert_property_match(&self, input: NewPropertyMatch) -> MarketResult<PropertyMatch> {
        input.validate().into_result()?;
        let mut conn = self.conn().await?;
        conn.transaction::<_, MarketError, _>(|conn| {
            async move {
                let requirement_owner: Option<String> = requirements::table
                    .find(&input.requirement_id)
                    .select(requirements::buyer_id)
                    .first(conn)
                    .await
                    .optional()?;
                match requirement_owner {
                    None => return Err(MarketError::not_found("requirement", &input.requirement_id)),
                    Some(owner) if owner != input.buyer_id => {
                        return Err(MarketError::InvalidState(format!(
                            "requirement {} does not belong to buyer {}",
                            input.requirement_id, input.buyer_id
                        )))
                    }
                    Some(_) => {}
                }
                let property_owner: Option<String> = properties::table
                    .find(&input.property_id)
                    .select(properties::broker_id)
                    .first(conn)
                    .await
                    .optional()?;
                match property_owner {
                    None => return Err(MarketError::not_found("property", &input.property_id)),
                    Some(owner) if owner != input.broker_id => {
                        return Err(MarketError::InvalidState(format!(
                            "property {} does not belong to broker {}",
                            input.property_id, input.broker_id
                        )))
                    }
                    Some(_) => {}
                }

                let existing: Option<MatchRow> = property_matches::table
                    .filter(property_matches::broker_id.eq(&input.broker_id))
                    .filter(property_matches::property_id.eq(&input.property_id))
                    .filter(property_matches::requirement_id.eq(&input.requirement_id))
                    .select(MatchRow::as_select())
                    .for_update()
                    .first(conn)
                    .await
                    .optional()?;
                let now = Utc::now();
                match existing.map(PropertyMatch::from) {
                    Some(current) if current.is_lead_purchased => Err(MarketError::InvalidState(format!(
                        "match {} is purchased and can no longer be rescored",
                        current.id
                    ))),
                    Some(current) => {
                        diesel::update(property_matches::table.find(&current.id))
                            .set((
                                property_matches::match_score.eq(input.match_score),
                                property_matches::updated_at.eq(now),
                            ))
                            .execute(conn)
                            .await?;
                        let mut updated = current.clone();
                        updated.match_score = input.match_score;
                        updated.updated_at = now;
                        record_change(conn, ChangeEvent::update(Table::PropertyMatches, &current, &updated))
                            .await?;
                        Ok(updated)
                    }
                    None => {
                        let row = MatchRow {
                            id: new_id(),
                            broker_id: input.broker_id.clone(),
                            buyer_id: input.buyer_id.clone(),
                            property_id: input.property_id.clone(),
                            requirement_id: input.requirement_id.clone(),
                            match_score: input.match_score,
                            is_lead_purchased: false,
                            created_at: now,
                            updated_at: now,
                        };
                        diesel::insert_into(property_matches::table)
                            .values(&row)
                            .execute(conn)
                            .await?;
                        let created = PropertyMatch::from(row);
                        record_change(conn, ChangeEvent::insert(Table::PropertyMatches, &created)).await?;
                        Ok(created)
                    }
                }
            }
            .scope_boxed()
        })
        .await
    }

    async fn purchase_lead(&self, broker_id: &str, params: PurchaseLeadParams) -> MarketResult<RpcOutcome> {
        let mut conn = self.conn().await?;
        conn.transaction::<_, MarketError, _>(|conn| {
            async move {
                let broker = find_profile(conn, broker_id, true).await?;
                if broker.user_type != UserType::Broker {
                    return Err(MarketError::Forbidden("only brokers can purchase leads".to_string()));
                }
                let matched: PropertyMatch = property_matches::table
                    .find(&params.match_id)
                    .select(MatchRow::as_select())
                    .for_update()
                    .first(conn)
                    .await
                    .optional()?
                    .map(PropertyMatch::from)
                    .ok_or_else(|| MarketError::not_found("property match", &params.match_id))?;
                if matched.broker_id != broker_id {
                    return Err(MarketError::Forbidden(format!(
                        "match {} belongs to another broker",
                        params.match_id
                    )));
                }
                if let Some(reason) = purchase_rejection(&matched, &params, broker.coin_balance) {
                    tracing::warn!("Lead purchase for match {} rejected: {}", params.match_id, reason);
                    return Ok(RpcOutcome::failed(reason));
                }

                let lead_id = new_id();
                let tx = post_transaction(
                    conn,
                    &broker,
                    params.lead_price,
                    TransactionType::Debit,
                    Some(&lead_id),
                    "Lead purchase",
                )
                .await?;

                let now = Utc::now();
                diesel::update(property_matches::table.find(&matched.id))
                    .set((
                        property_matches::is_lead_purchased.eq(true),
                        property_matches::updated_at.eq(now),
                    ))
                    .execute(conn)
                    .await?;
                let mut purchased = matched.clone();
                purchased.is_lead_purchased = true;
                purchased.updated_at = now;
                record_change(conn, ChangeEvent::update(Table::PropertyMatches, &matched, &purchased)).await?;

                let chat = Chat {
                    id: new_id(),
                    lead_id: Some(lead_id.clone()),
                    broker_id: broker_id.to_string(),
                    buyer_id: params.buyer_id.clone(),
                    is_active: true,
                    last_message_at: None,
                    created_at: now,
                };
                let lead = Lead {
                    id: lead_id,
                    match_id: matched.id.clone(),
                    broker_id: broker_id.to_string(),
                    buyer_id: params.buyer_id.clone(),
                    property_id: matched.property_id.clone(),
                    requirement_id: params.requirement_id.clone(),
                    lead_price: params.lead_price,
                    status: LeadStatus::Pending,
                    rejection_reason: None,
                    chat_id: Some(chat.id.clone()),
                    created_at: now,
                    decided_at: None,
                };
                diesel::insert_into(chats::table)
                    .values(ChatRow::from(&chat))
                    .execute(conn)
                    .await?;
                diesel::insert_into(leads::table)
                    .values(LeadRow::from(&lead))
                    .execute(conn)
                    .await?;
                record_change(conn, ChangeEvent::insert(Table::Leads, &lead)).await?;
                record_change(conn, ChangeEvent::insert(Table::Chats, &chat)).await?;

                tracing::info!(
                    "Broker {} purchased match {} for {} coins",
                    broker_id,
                    params.match_id,
                    params.lead_price
                );
                Ok(RpcOutcome::ok().with_chat(chat.id).with_balance(tx.balance_after))
            }
            .scope_boxed()
        })
        .await
    }

    async fn approve_lead(&self, buyer_id: &str, lead_id: &str) -> MarketResult<RpcOutcome> {
        let mut conn = self.conn().await?;
        conn.transaction::<_, MarketError, _>(|conn| {
            async move {
                let lead = find_lead(conn, lead_id).await?;
                if lead.buyer_id != buyer_id {
                    return Err(MarketError::Forbidden(format!("lead {} belongs to another buyer", lead_id)));
                }
                let next = match lead.status.decide(lead_id, LeadDecision::Approve) {
                    Ok(next) => next,
                    Err(e) => return Ok(RpcOutcome::failed(e.to_string())),
                };
                let now = Utc::now();

                let existing = match lead.chat_id.as_deref() {
                    Some(id) => chats::table
                        .find(id)
                        .select(ChatRow::as_select())
                        .first(conn)
                        .await
                        .optional()?
                        .map(Chat::from),
                    None => None,
                };
                let chat_id = match existing {
                    Some(chat) => {
                        if !chat.is_active {
                            diesel::update(chats::table.find(&chat.id))
                                .set(chats::is_active.eq(true))
                                .execute(conn)
                                .await?;
                            let mut reopened = chat.clone();
                            reopened.is_active = true;
                            record_change(conn, ChangeEvent::update(Table::Chats, &chat, &reopened)).await?;
                        }
                        chat.id
                    }
                    None => {
                        let chat = Chat {
                            id: new_id(),
                            lead_id: Some(lead.id.clone()),
                            broker_id: lead.broker_id.clone(),
                            buyer_id: lead.buyer_id.clone(),
                            is_active: true,
                            last_message_at: None,
                            created_at: now,
                        };
                        diesel::insert_into(chats::table)
                            .values(ChatRow::from(&chat))
                            .execute(conn)
                            .await?;
                        record_change(conn, ChangeEvent::insert(Table::Chats, &chat)).await?;
                        chat.id
                    }
                };

                let requirement: Option<RequirementRow> = requirements::table
                    .find(&lead.requirement_id)
                    .select(RequirementRow::as_select())
                    .for_update()
                    .first(conn)
                    .await
                    .optional()?;
                if let Some(requirement) = requirement.map(Requirement::try_from).transpose()? {
                    if requirement.status.can_transition_to(RequirementStatus::Matched) {
                        diesel::update(requirements::table.find(&requirement.id))
                            .set((
                                requirements::status.eq(RequirementStatus::Matched.as_str()),
                                requirements::updated_at.eq(now),
                            ))
                            .execute(conn)
                            .await?;
                        let mut matched = requirement.clone();
                        matched.status = RequirementStatus::Matched;
                        matched.updated_at = now;
                        record_change(conn, ChangeEvent::update(Table::Requirements, &requirement, &matched))
                            .await?;
                    }
                }

                diesel::update(leads::table.find(lead_id))
                    .set((
                        leads::status.eq(next.as_str()),
                        leads::chat_id.eq(Some(chat_id.as_str())),
                        leads::decided_at.eq(Some(now)),
                    ))
                    .execute(conn)
                    .await?;
                let mut decided = lead.clone();
                decided.status = next;
                decided.chat_id = Some(chat_id.clone());
                decided.decided_at = Some(now);
                record_change(conn, ChangeEvent::update(Table::Leads, &lead, &decided)).await?;

                tracing::info!("Buyer {} approved lead {}", buyer_id, lead_id);
                Ok(RpcOutcome::ok().with_chat(chat_id))
            }
            .scope_boxed()
        })
        .await
    }

    async fn reject_lead(
        &self,
        buyer_id: &str,
        lead_id: &str,
        rejection_reason: Option<&str>,
    ) -> MarketResult<RpcOutcome> {
        let reason = rejection_reason
            .filter(|r| !r.trim().is_empty())
            .map(str::to_string);
        let mut conn = self.conn().await?;
        conn.transaction::<_, MarketError, _>(|conn| {
            async move {
                let lead = find_lead(conn, lead_id).await?;
                if lead.buyer_id != buyer_id {
                    return Err(MarketError::Forbidden(format!("lead {} belongs to another buyer", lead_id)));
                }
                let next = match lead.status.decide(lead_id, LeadDecision::Reject) {
                    Ok(next) => next,
                    Err(e) => return Ok(RpcOutcome::failed(e.to_string())),
                };

                let broker = find_profile(conn, &lead.broker_id, true).await?;
                post_transaction(
                    conn,
                    &broker,
                    lead.lead_price,
                    TransactionType::Refund,
                    Some(lead_id),
                    "Lead rejected by buyer",
                )
                .await?;

                if let Some(chat_id) = lead.chat_id.as_deref() {
                    let chat = find_chat(conn, chat_id).await?;
                    if chat.is_active {
                        diesel::update(chats::table.find(chat_id))
                            .set(chats::is_active.eq(false))
                            .execute(conn)
                            .await?;
                        let mut closed = chat.clone();
                        closed.is_active = false;
                        record_change(conn, ChangeEvent::update(Table::Chats, &chat, &closed)).await?;
                    }
                }

                let now = Utc::now();
                diesel::update(leads::table.find(lead_id))
                    .set((
                        leads::status.eq(next.as_str()),
                        leads::rejection_reason.eq(reason.as_deref()),
                        leads::decided_at.eq(Some(now)),
                    ))
                    .execute(conn)
                    .await?;
                let mut decided = lead.clone();
                decided.status = next;
                decided.rejection_reason = reason.clone();
                decided.decided_at = Some(now);
                record_change(conn, ChangeEvent::update(Table::Leads, &lead, &decided)).await?;

                tracing::info!("Buyer {} rejected lead {}", buyer_id, lead_id);
                Ok(RpcOutcome::ok())
            }
            .scope_boxed()
        })
        .await
    }

    async fn list_leads(
        &self,
        user_id: &str,
        role: LeadRole,
        status: Option<LeadStatus>,
    ) -> MarketResult<Vec<LeadDetail>> {
        let mut conn = self.conn().await?;
        let mut q = leads::table
            .select(LeadRow::as_select())
            .order(leads::created_at.desc())
            .into_boxed();
        q = match role {
            LeadRole::Broker => q.filter(leads::broker_id.eq(user_id)),
            LeadRole::Buyer => q.filter(leads::buyer_id.eq(user_id)),
        };
        if let Some(status) = status {
            q = q.filter(leads::status.eq(status.as_str()));
        }
        let rows: Vec<LeadRow> = q.load(&mut conn).await?;
        let mut details = Vec::with_capacity(rows.len());
        for row in rows {
            details.push(lead_detail(&mut conn, Lead::try_from(row)?, role).await?);
        }
        Ok(details)
    }

    async fn credit_coins(
        &self,
        user_id: &str,
        amount: i64,
        reference_id: Option<&str>,
    ) -> MarketResult<WalletTransaction> {
        if amount <= 0 {
            return Err(MarketError::validation("amount", "amount must be greater than zero"));
        }
        let mut conn = self.conn().await?;
        conn.transaction::<_, MarketError, _>(|conn| {
            async move {
                let profile = find_profile(conn, user_id, true).await?;
                post_transaction(
                    conn,
                    &profile,
                    amount,
                    TransactionType::Credit,
                    reference_id,
                    "Coin refill",
                )
                .await
            }
            .scope_boxed()
        })
        .await
    }

    async fn list_wallet_transactions(&self, user_id: &str) -> MarketResult<Vec<WalletTransaction>> {
        let mut conn = self.conn().await?;
        let rows: Vec<TransactionRow> = wallet_transactions::table
            .filter(wallet_transactions::user_id.eq(user_id))
            .order(wallet_transactions::created_at.desc())
            .select(TransactionRow::as_select())
            .load(&mut conn)
            .await?;
        rows.into_iter().map(WalletTransaction::try_from).collect()
    }

    async fn get_broker_stats(&self, broker_id: &str) -> MarketResult<BrokerStats> {
        let mut conn = self.conn().await?;
        let profile = find_profile(&mut conn, broker_id, false).await?;
        let available_matches: i64 = property_matches::table
            .filter(property_matches::broker_id.eq(broker_id))
            .filter(property_matches::is_lead_purchased.eq(false))
            .count()
            .get_result(&mut conn)
            .await?;
        let statuses: Vec<String> = leads::table
            .filter(leads::broker_id.eq(broker_id))
            .select(leads::status)
            .load(&mut conn)
            .await?;

        let mut stats = BrokerStats {
            coin_balance: profile.coin_balance,
            available_matches,
            ..BrokerStats::default()
        };
        for status in statuses {
            stats.leads_purchased += 1;
            match status.parse()? {
                LeadStatus::Pending => stats.leads_pending += 1,
                LeadStatus::Approved => stats.leads_approved += 1,
                LeadStatus::Rejected => stats.leads_rejected += 1,
            }
        }
        Ok(stats)
    }

    async fn get_user_chats(&self, user_id: &str) -> MarketResult<Vec<ChatSummary>> {
        let mut conn = self.conn().await?;
        let rows: Vec<ChatRow> = chats::table
            .filter(chats::broker_id.eq(user_id).or(chats::buyer_id.eq(user_id)))
            .select(ChatRow::as_select())
            .load(&mut conn)
            .await?;

        let mut summaries = Vec::with_capacity(rows.len());
        for chat in rows.into_iter().map(Chat::from) {
            let counterparty = find_public_profile(&mut conn, chat.counterparty_of(user_id)).await?;
            let last: Option<MessageRow> = messages::table
                .filter(messages::chat_id.eq(&chat.id))
                .order(messages::created_at.desc())
                .select(MessageRow::as_select())
                .first(&mut conn)
                .await
                .optional()?;
            let last_message = last.map(|row| self.decrypt(row)).transpose()?.map(|m| m.content);
            summaries.push(ChatSummary {
                chat,
                counterparty,
                last_message,
            });
        }
        summaries.sort_by(|a, b| {
            let a_at = a.chat.last_message_at.unwrap_or(a.chat.created_at);
            let b_at = b.chat.last_message_at.unwrap_or(b.chat.created_at);
            b_at.cmp(&a_at)
        });
        Ok(summaries)
    }

    async fn get_chat_by_id(&self, user_id: &str, chat_id: &str) -> MarketResult<ChatDetail> {
        let mut conn = self.conn().await?;
        let chat = participant_chat(&mut conn, user_id, chat_id).await?;
        let broker = find_public_profile(&mut conn, &chat.broker_id).await?;
        let buyer = find_public_profile(&mut conn, &chat.buyer_id).await?;
        let lead = match chat.lead_id.as_deref() {
            Some(id) => leads::table
                .find(id)
                .select(LeadRow::as_select())
                .first(&mut conn)
                .await
                .optional()?
                .map(Lead::try_from)
                .transpose()?,
            None => None,
        };
        Ok(ChatDetail {
            chat,
            broker,
            buyer,
            lead,
        })
    }

    async fn get_chat_messages(&self, user_id: &str, chat_id: &str) -> MarketResult<Vec<Message>> {
        let mut conn = self.conn().await?;
        participant_chat(&mut conn, user_id, chat_id).await?;
        let rows: Vec<MessageRow> = messages::table
            .filter(messages::chat_id.eq(chat_id))
            .order(messages::created_at.asc())
            .select(MessageRow::as_select())
            .load(&mut conn)
            .await?;
        rows.into_iter().map(|row| self.decrypt(row)).collect()
    }

    async fn send_message(&self, user_id: &str, chat_id: &str, content: &str) -> MarketResult<Message> {
        let content = content.trim();
        if content.is_empty() {
            return Err(MarketError::validation("content", "message must not be empty"));
        }
        let encrypted = encrypt_message(content, chat_id, &self.encryption_key)?;
        let mut conn = self.conn().await?;
        let message = conn
            .transaction::<_, MarketError, _>(|conn| {
                async move {
                    let chat = participant_chat(conn, user_id, chat_id).await?;
                    if !chat.is_active {
                        return Err(MarketError::InvalidState(format!("chat {} is closed", chat_id)));
                    }
                    let row = MessageRow {
                        id: new_id(),
                        chat_id: chat_id.to_string(),
                        sender_id: user_id.to_string(),
                        content: encrypted,
                        created_at: Utc::now(),
                    };
                    diesel::insert_into(messages::table)
                        .values(&row)
                        .execute(conn)
                        .await?;
                    diesel::update(chats::table.find(chat_id))
                        .set(chats::last_message_at.eq(Some(row.created_at)))
                        .execute(conn)
                        .await?;
                    let message = Message {
                        id: row.id,
                        chat_id: row.chat_id,
                        sender_id: row.sender_id,
                        content: content.to_string(),
                        created_at: row.created_at,
                    };
                    record_change(conn, ChangeEvent::insert(Table::Messages, &message_change(&message))).await?;
                    Ok(message)
                }
                .scope_boxed()
            })
            .await?;
        Ok(message)
    }

    async fn create_requirement(&self, buyer_id: &str, input: NewRequirement) -> MarketResult<Requirement> {
        input.validate().into_result()?;
        let mut conn = self.conn().await?;
        conn.transaction::<_, MarketError, _>(|conn| {
            async move {
                if find_profile(conn, buyer_id, false).await?.user_type != UserType::Buyer {
                    return Err(MarketError::Forbidden("only buyers can post requirements".to_string()));
                }
                let now = Utc::now();
                let row = RequirementRow {
                    id: new_id(),
                    buyer_id: buyer_id.to_string(),
                    property_type: input.property_type.trim().to_string(),
                    location: normalize_text(input.location.as_deref()),
                    budget_min: input.budget_min,
                    budget_max: input.budget_max,
                    area_min: input.area_min,
                    area_max: input.area_max,
                    bedrooms: input.bedrooms,
                    urgency: input.urgency.as_str().to_string(),
                    notes: normalize_text(input.notes.as_deref()),
                    status: RequirementStatus::Active.as_str().to_string(),
                    created_at: now,
                    updated_at: now,
                };
                diesel::insert_into(requirements::table)
                    .values(&row)
                    .execute(conn)
                    .await?;
                let requirement = Requirement::try_from(row)?;
                record_change(conn, ChangeEvent::insert(Table::Requirements, &requirement)).await?;
                Ok(requirement)
            }
            .scope_boxed()
        })
        .await
    }

    async fn update_requirement(
        &self,
        buyer_id: &str,
        requirement_id: &str,
        input: NewRequirement,
    ) -> MarketResult<Requirement> {
        input.validate().into_result()?;
        let mut conn = self.conn().await?;
        conn.transaction::<_, MarketError, _>(|conn| {
            async move {
                let before: Requirement = requirements::table
                    .find(requirement_id)
                    .select(RequirementRow::as_select())
                    .for_update()
                    .first(conn)
                    .await
                    .optional()?
                    .ok_or_else(|| MarketError::not_found("requirement", requirement_id))?
                    .try_into()?;
                if before.buyer_id != buyer_id {
                    return Err(MarketError::Forbidden(format!(
                        "requirement {} belongs to another buyer",
                        requirement_id
                    )));
                }
                if before.status == RequirementStatus::Closed {
                    return Err(MarketError::InvalidState(format!("requirement {} is closed", requirement_id)));
                }
                let mut after = before.clone();
                after.property_type = input.property_type.trim().to_string();
                after.location = normalize_text(input.location.as_deref());
                after.budget_min = input.budget_min;
                after.budget_max = input.budget_max;
                after.area_min = input.area_min;
                after.area_max = input.area_max;
                after.bedrooms = input.bedrooms;
                after.urgency = input.urgency;
                after.notes = normalize_text(input.notes.as_deref());
                after.updated_at = Utc::now();

                diesel::update(requirements::table.find(requirement_id))
                    .set((
                        requirements::property_type.eq(&after.property_type),
                        requirements::location.eq(after.location.as_deref()),
                        requirements::budget_min.eq(after.budget_min),
                        requirements::budget_max.eq(after.budget_max),
                        requirements::area_min.eq(after.area_min),
                        requirements::area_max.eq(after.area_max),
                        requirements::bedrooms.eq(after.bedrooms),
                        requirements::urgency.eq(after.urgency.as_str()),
                        requirements::notes.eq(after.notes.as_deref()),
                        requirements::updated_at.eq(after.updated_at),
                    ))
                    .execute(conn)
                    .await?;
                record_change(conn, ChangeEvent::update(Table::Requirements, &before, &after)).await?;
                Ok(after)
            }
            .scope_boxed()
        })
        .await
    }

    async fn set_requirement_status(
        &self,
        buyer_id: &str,
        requirement_id: &str,
        status: RequirementStatus,
    ) -> MarketResult<Requirement> {
        let mut conn = self.conn().await?;
        conn.transaction::<_, MarketError, _>(|conn| {
            async move {
                let before: Requirement = requirements::table
                    .find(requirement_id)
                    .select(RequirementRow::as_select())
                    .for_update()
                    .first(conn)
                    .await
                    .optional()?
                    .ok_or_else(|| MarketError::not_found("requirement", requirement_id))?
                    .try_into()?;
                if before.buyer_id != buyer_id {
                    return Err(MarketError::Forbidden(format!(
                        "requirement {} belongs to another buyer",
                        requirement_id
                    )));
                }
                if !before.status.can_transition_to(status) {
                    return Err(MarketError::InvalidState(format!(
                        "requirement cannot move from {} to {}",
                        before.status, status
                    )));
                }
                let now = Utc::now();
                diesel::update(requirements::table.find(requirement_id))
                    .set((
                        requirements::status.eq(status.as_str()),
                        requirements::updated_at.eq(now),
                    ))
                    .execute(conn)
                    .await?;
                let mut after = before.clone();
                after.status = status;
                after.updated_at = now;
                record_change(conn, ChangeEvent::update(Table::Requirements, &before, &after)).await?;
                Ok(after)
            }
            .scope_boxed()
        })
        .await
    }

    async fn list_requirements(&self, buyer_id: &str) -> MarketResult<Vec<Requirement>> {
        let mut conn = self.conn().await?;
        let rows: Vec<RequirementRow> = requirements::table
            .filter(requirements::buyer_id.eq(buyer_id))
            .order(requirements::created_at.desc())
            .select(RequirementRow::as_select())
            .load(&mut conn)
            .await?;
        rows.into_iter().map(Requirement::try_from).collect()
    }

    async fn get_requirement(&self, requirement_id: &str) -> MarketResult<Requirement> {
        let mut conn = self.conn().await?;
        requirements::table
            .find(requirement_id)
            .select(RequirementRow::as_select())
            .first(&mut conn)
            .await
            .optional()?
            .ok_or_else(|| MarketError::not_found("requirement", requirement_id))?
            .try_into()
    }

    async fn submit_property(&self, broker_id: &str, draft: PropertyDraft) -> MarketResult<PropertyApproval> {
        draft.validate().into_result()?;
        let draft_json = serde_json::to_value(&draft)
            .map_err(|e| anyhow!("Failed to serialize property draft: {}", e))?;
        let mut conn = self.conn().await?;
        conn.transaction::<_, MarketError, _>(|conn| {
            async move {
                let broker = find_profile(conn, broker_id, false).await?;
                if broker.user_type != UserType::Broker {
                    return Err(MarketError::Forbidden("only brokers can list properties".to_string()));
                }
                if broker.kyc_status != KycStatus::Verified {
                    return Err(MarketError::Forbidden(
                        "KYC verification is required before listing properties".to_string(),
                    ));
                }
                let row = ApprovalRow {
                    id: new_id(),
                    broker_id: broker_id.to_string(),
                    draft: draft_json,
                    status: ApprovalStatus::Pending.as_str().to_string(),
                    reviewer_notes: None,
                    property_id: None,
                    created_at: Utc::now(),
                    reviewed_at: None,
                };
                diesel::insert_into(property_approvals::table)
                    .values(&row)
                    .execute(conn)
                    .await?;
                let approval = PropertyApproval::try_from(row)?;
                record_change(conn, ChangeEvent::insert(Table::PropertyApprovals, &approval)).await?;
                Ok(approval)
            }
            .scope_boxed()
        })
        .await
    }

    async fn review_property_approval(
        &self,
        approval_id: &str,
        decision: ApprovalDecision,
    ) -> MarketResult<PropertyApproval> {
        let mut conn = self.conn().await?;
        conn.transaction::<_, MarketError, _>(|conn| {
            async move {
                let before: PropertyApproval = property_approvals::table
                    .find(approval_id)
                    .select(ApprovalRow::as_select())
                    .for_update()
                    .first(conn)
                    .await
                    .optional()?
                    .ok_or_else(|| MarketError::not_found("property approval", approval_id))?
                    .try_into()?;
                if before.status != ApprovalStatus::Pending {
                    return Err(MarketError::InvalidState(format!(
                        "approval {} is already {}",
                        approval_id, before.status
                    )));
                }

                let now = Utc::now();
                let (status, notes) = match &decision {
                    ApprovalDecision::Approve { notes } => (ApprovalStatus::Approved, notes),
                    ApprovalDecision::Reject { notes } => (ApprovalStatus::Rejected, notes),
                };
                let property_id = if status == ApprovalStatus::Approved {
                    let draft = &before.draft;
                    let row = PropertyRow {
                        id: new_id(),
                        broker_id: before.broker_id.clone(),
                        approval_id: before.id.clone(),
                        title: draft.title.trim().to_string(),
                        property_type: draft.property_type.trim().to_string(),
                        location: draft.location.trim().to_string(),
                        price: draft.price,
                        area: draft.area,
                        bedrooms: draft.bedrooms,
                        description: normalize_text(draft.description.as_deref()),
                        status: PropertyStatus::Active.as_str().to_string(),
                        user_status: None,
                        created_at: now,
                        updated_at: now,
                    };
                    diesel::insert_into(properties::table)
                        .values(&row)
                        .execute(conn)
                        .await?;
                    let property = Property::try_from(row)?;
                    record_change(conn, ChangeEvent::insert(Table::Properties, &property)).await?;
                    Some(property.id)
                } else {
                    None
                };

                let mut after = before.clone();
                after.status = status;
                after.reviewer_notes = normalize_text(notes.as_deref());
                after.property_id = property_id;
                after.reviewed_at = Some(now);
                diesel::update(property_approvals::table.find(approval_id))
                    .set((
                        property_approvals::status.eq(after.status.as_str()),
                        property_approvals::reviewer_notes.eq(after.reviewer_notes.as_deref()),
                        property_approvals::property_id.eq(after.property_id.as_deref()),
                        property_approvals::reviewed_at.eq(after.reviewed_at),
                    ))
                    .execute(conn)
                    .await?;
                record_change(conn, ChangeEvent::update(Table::PropertyApprovals, &before, &after)).await?;
                Ok(after)
            }
            .scope_boxed()
        })
        .await
    }

    async fn list_property_approvals(&self, broker_id: &str) -> MarketResult<Vec<PropertyApproval>> {
        let mut conn = self.conn().await?;
        let rows: Vec<ApprovalRow> = property_approvals::table
            .filter(property_approvals::broker_id.eq(broker_id))
            .order(property_approvals::created_at.desc())
            .select(ApprovalRow::as_select())
            .load(&mut conn)
            .await?;
        rows.into_iter().map(PropertyApproval::try_from).collect()
    }

    async fn list_broker_properties(&self, broker_id: &str) -> MarketResult<Vec<Property>> {
        let mut conn = self.conn().await?;
        let rows: Vec<PropertyRow> = properties::table
            .filter(properties::broker_id.eq(broker_id))
            .order(properties::created_at.desc())
            .select(PropertyRow::as_select())
            .load(&mut conn)
            .await?;
        rows.into_iter().map(Property::try_from).collect()
    }

    async fn search_properties(&self, search: PropertySearch) -> MarketResult<Vec<Property>> {
        let mut conn = self.conn().await?;
        let mut q = properties::table
            .filter(properties::status.eq(PropertyStatus::Active.as_str()))
            .order(properties::created_at.desc())
            .select(PropertyRow::as_select())
            .into_boxed();
        if let Some(kind) = &search.property_type {
            q = q.filter(properties::property_type.ilike(kind.clone()));
        }
        if let Some(location) = &search.location {
            q = q.filter(properties::location.ilike(format!("%{}%", location)));
        }
        if let Some(min) = search.min_price {
            q = q.filter(properties::price.ge(min));
        }
        if let Some(max) = search.max_price {
            q = q.filter(properties::price.le(max));
        }
        if let Some(limit) = search.limit {
            q = q.limit(limit.max(0));
        }
        let rows: Vec<PropertyRow> = q.load(&mut conn).await?;
        rows.into_iter().map(Property::try_from).collect()
    }

    async fn get_property(&self, property_id: &str) -> MarketResult<Property> {
        let mut conn = self.conn().await?;
        properties::table
            .find(property_id)
            .select(PropertyRow::as_select())
            .first(&mut conn)
            .await
            .optional()?
            .ok_or_else(|| MarketError::not_found("property", property_id))?
            .try_into()
    }

    async fn set_property_status(
        &self,
        broker_id: &str,
        property_id: &str,
        status: PropertyStatus,
        user_status: Option<&str>,
    ) -> MarketResult<Property> {
        let user_status = normalize_text(user_status);
        let mut conn = self.conn().await?;
        conn.transaction::<_, MarketError, _>(|conn| {
            async move {
                let before: Property = properties::table
                    .find(property_id)
                    .select(PropertyRow::as_select())
                    .for_update()
                    .first(conn)
                    .await
                    .optional()?
                    .ok_or_else(|| MarketError::not_found("property", property_id))?
                    .try_into()?;
                if before.broker_id != broker_id {
                    return Err(MarketError::Forbidden(format!(
                        "property {} belongs to another broker",
                        property_id
                    )));
                }
                let now = Utc::now();
                diesel::update(properties::table.find(property_id))
                    .set((
                        properties::status.eq(status.as_str()),
                        properties::user_status.eq(user_status.as_deref()),
                        properties::updated_at.eq(now),
                    ))
                    .execute(conn)
                    .await?;
                let mut after = before.clone();
                after.status = status;
                after.user_status = user_status.clone();
                after.updated_at = now;
                record_change(conn, ChangeEvent::update(Table::Properties, &before, &after)).await?;
                Ok(after)
            }
            .scope_boxed()
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn profile_row() -> ProfileRow {
        let now = Utc::now();
        ProfileRow {
            id: "p1".to_string(),
            email: "broker@example.com".to_string(),
            user_type: "broker".to_string(),
            first_name: Some("Ravi".to_string()),
            last_name: Some("Kumar".to_string()),
            company_name: None,
            phone: None,
            coin_balance: 250,
            kyc_status: "verified".to_string(),
            created_at: now,
            updated_at: now,
        }
    }

    fn lead_row(status: &str) -> LeadRow {
        LeadRow {
            id: "l1".to_string(),
            match_id: "m1".to_string(),
            broker_id: "b1".to_string(),
            buyer_id: "u1".to_string(),
            property_id: "pr1".to_string(),
            requirement_id: "r1".to_string(),
            lead_price: 100,
            status: status.to_string(),
            rejection_reason: None,
            chat_id: Some("c1".to_string()),
            created_at: Utc::now(),
            decided_at: None,
        }
    }

    #[test]
    fn test_profile_row_parses_enum_text() {
        let profile = Profile::try_from(profile_row()).unwrap();
        assert_eq!(profile.user_type, UserType::Broker);
        assert_eq!(profile.kyc_status, KycStatus::Verified);
        assert_eq!(profile.coin_balance, 250);

        let mut row = profile_row();
        row.user_type = "admin".to_string();
        assert!(matches!(Profile::try_from(row), Err(MarketError::InvalidState(_))));

        let mut row = profile_row();
        row.kyc_status = "Verified".to_string();
        assert!(matches!(Profile::try_from(row), Err(MarketError::InvalidState(_))));
    }

    #[test]
    fn test_requirement_row_rejects_unknown_status() {
        let now = Utc::now();
        let row = |urgency: &str, status: &str| RequirementRow {
            id: "r1".to_string(),
            buyer_id: "u1".to_string(),
            property_type: "apartment".to_string(),
            location: Some("Baner, Pune".to_string()),
            budget_min: Some(5_000_000),
            budget_max: Some(8_000_000),
            area_min: None,
            area_max: None,
            bedrooms: Some(2),
            urgency: urgency.to_string(),
            notes: None,
            status: status.to_string(),
            created_at: now,
            updated_at: now,
        };

        let requirement = Requirement::try_from(row("immediate", "matched")).unwrap();
        assert_eq!(requirement.urgency, Urgency::Immediate);
        assert_eq!(requirement.status, RequirementStatus::Matched);

        assert!(matches!(
            Requirement::try_from(row("urgent", "active")),
            Err(MarketError::InvalidState(_))
        ));
        assert!(matches!(
            Requirement::try_from(row("low", "archived")),
            Err(MarketError::InvalidState(_))
        ));
    }

    #[test]
    fn test_approval_row_decodes_stored_draft() {
        let draft = PropertyDraft {
            title: "2BHK near Baner".to_string(),
            property_type: "apartment".to_string(),
            location: "Baner, Pune".to_string(),
            price: 7_000_000,
            area: Some(1100),
            bedrooms: Some(2),
            description: None,
        };
        let row = |draft: serde_json::Value, status: &str| ApprovalRow {
            id: "a1".to_string(),
            broker_id: "b1".to_string(),
            draft,
            status: status.to_string(),
            reviewer_notes: None,
            property_id: None,
            created_at: Utc::now(),
            reviewed_at: None,
        };

        let approval =
            PropertyApproval::try_from(row(serde_json::to_value(&draft).unwrap(), "pending")).unwrap();
        assert_eq!(approval.draft, draft);
        assert_eq!(approval.status, ApprovalStatus::Pending);

        let broken = PropertyApproval::try_from(row(json!({ "title": 5 }), "pending"));
        assert!(matches!(broken, Err(MarketError::Internal(_))));

        let unknown = PropertyApproval::try_from(row(serde_json::to_value(&draft).unwrap(), "withdrawn"));
        assert!(matches!(unknown, Err(MarketError::InvalidState(_))));
    }

    #[test]
    fn test_property_and_transaction_rows_reject_unknown_text() {
        let now = Utc::now();
        let property = PropertyRow {
            id: "pr1".to_string(),
            broker_id: "b1".to_string(),
            approval_id: "a1".to_string(),
            title: "2BHK near Baner".to_string(),
            property_type: "apartment".to_string(),
            location: "Baner, Pune".to_string(),
            price: 7_000_000,
            area: None,
            bedrooms: None,
            description: None,
            status: "leased".to_string(),
            user_status: Some("open house sunday".to_string()),
            created_at: now,
            updated_at: now,
        };
        assert!(matches!(Property::try_from(property), Err(MarketError::InvalidState(_))));

        let tx = |tx_type: &str| TransactionRow {
            id: "t1".to_string(),
            user_id: "b1".to_string(),
            amount: 100,
            tx_type: tx_type.to_string(),
            reference_id: Some("l1".to_string()),
            description: None,
            balance_after: 400,
            created_at: now,
        };
        let refund = WalletTransaction::try_from(tx("refund")).unwrap();
        assert_eq!(refund.tx_type, TransactionType::Refund);
        assert_eq!(refund.tx_type.signed(refund.amount), 100);
        assert!(matches!(WalletTransaction::try_from(tx("bonus")), Err(MarketError::InvalidState(_))));
    }

    #[test]
    fn test_lead_row_survives_a_write_and_read() {
        let lead = Lead::try_from(lead_row("approved")).unwrap();
        assert_eq!(lead.status, LeadStatus::Approved);

        let row = LeadRow::from(&lead);
        assert_eq!(row.status, "approved");
        assert_eq!(Lead::try_from(row).unwrap(), lead);

        assert!(matches!(Lead::try_from(lead_row("cancelled")), Err(MarketError::InvalidState(_))));
    }

    #[test]
    fn test_chat_row_conversion_keeps_activity() {
        let chat = Chat {
            id: "c1".to_string(),
            lead_id: Some("l1".to_string()),
            broker_id: "b1".to_string(),
            buyer_id: "u1".to_string(),
            is_active: false,
            last_message_at: None,
            created_at: Utc::now(),
        };
        assert_eq!(Chat::from(ChatRow::from(&chat)), chat);
    }
}
