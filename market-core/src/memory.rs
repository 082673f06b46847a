//! In-process implementation of [`MarketBackend`].
//!
//! All state sits behind one async mutex. Every procedure checks its
//! preconditions before the first write, so a procedure either applies all of
//! its effects or none of them. Change events are broadcast after the lock is
//! released.

use async_trait::async_trait;
use chrono::Utc;
use serde_json::json;
use std::collections::HashMap;
use tokio::sync::{broadcast, Mutex};

use crate::backend::MarketBackend;
use crate::changes::{ChangeEvent, Table};
use crate::error::{MarketError, MarketResult};
use crate::types::*;

const CHANGE_CHANNEL_CAPACITY: usize = 1024;

#[derive(Default)]
struct State {
    profiles: HashMap<String, Profile>,
    requirements: Vec<Requirement>,
    approvals: Vec<PropertyApproval>,
    properties: Vec<Property>,
    matches: Vec<PropertyMatch>,
    leads: Vec<Lead>,
    transactions: Vec<WalletTransaction>,
    chats: Vec<Chat>,
    messages: Vec<Message>,
}

impl State {
    fn profile(&self, id: &str) -> MarketResult<&Profile> {
        self.profiles
            .get(id)
            .ok_or_else(|| MarketError::not_found("profile", id))
    }

    fn public_profile(&self, id: &str) -> PublicProfile {
        self.profiles.get(id).map(Profile::public).unwrap_or_default()
    }

    fn requirement_index(&self, id: &str) -> MarketResult<usize> {
        self.requirements
            .iter()
            .position(|r| r.id == id)
            .ok_or_else(|| MarketError::not_found("requirement", id))
    }

    fn property_index(&self, id: &str) -> MarketResult<usize> {
        self.properties
            .iter()
            .position(|p| p.id == id)
            .ok_or_else(|| MarketError::not_found("property", id))
    }

    fn match_index(&self, id: &str) -> MarketResult<usize> {
        self.matches
            .iter()
            .position(|m| m.id == id)
            .ok_or_else(|| MarketError::not_found("property match", id))
    }

    fn lead_index(&self, id: &str) -> MarketResult<usize> {
        self.leads
            .iter()
            .position(|l| l.id == id)
            .ok_or_else(|| MarketError::not_found("lead", id))
    }

    fn chat_index(&self, id: &str) -> MarketResult<usize> {
        self.chats
            .iter()
            .position(|c| c.id == id)
            .ok_or_else(|| MarketError::not_found("chat", id))
    }

    fn participant_chat(&self, user_id: &str, chat_id: &str) -> MarketResult<&Chat> {
        let chat = &self.chats[self.chat_index(chat_id)?];
        if !chat.is_participant(user_id) {
            return Err(MarketError::Forbidden(format!(
                "user {} is not a participant of chat {}",
                user_id, chat_id
            )));
        }
        Ok(chat)
    }

    /// Applies a balance change and records its ledger entry together.
    fn post_transaction(
        &mut self,
        user_id: &str,
        amount: i64,
        tx_type: TransactionType,
        reference_id: Option<&str>,
        description: &str,
        events: &mut Vec<ChangeEvent>,
    ) -> MarketResult<WalletTransaction> {
        let profile = self
            .profiles
            .get_mut(user_id)
            .ok_or_else(|| MarketError::not_found("profile", user_id))?;
        let new_balance = profile.coin_balance + tx_type.signed(amount);
        if new_balance < 0 {
            return Err(MarketError::InsufficientBalance {
                balance: profile.coin_balance,
                required: amount,
            });
        }

        let before = profile.clone();
        profile.coin_balance = new_balance;
        profile.updated_at = Utc::now();
        events.push(ChangeEvent::update(Table::Profiles, &before, &*profile));

        let tx = WalletTransaction {
            id: new_id(),
            user_id: user_id.to_string(),
            amount,
            tx_type,
            reference_id: reference_id.map(str::to_string),
            description: Some(description.to_string()),
            balance_after: new_balance,
            created_at: Utc::now(),
        };
        events.push(ChangeEvent::insert(Table::WalletTransactions, &tx));
        self.transactions.push(tx.clone());
        Ok(tx)
    }

    fn lead_detail(&self, lead: &Lead, role: LeadRole) -> LeadDetail {
        let counterparty_id = match role {
            LeadRole::Broker => &lead.buyer_id,
            LeadRole::Buyer => &lead.broker_id,
        };
        LeadDetail {
            lead: lead.clone(),
            property: self
                .properties
                .iter()
                .find(|p| p.id == lead.property_id)
                .cloned(),
            counterparty: self.public_profile(counterparty_id),
        }
    }
}

pub struct MemoryBackend {
    state: Mutex<State>,
    changes: broadcast::Sender<ChangeEvent>,
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBackend {
    pub fn new() -> Self {
        let (changes, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);
        Self {
            state: Mutex::new(State::default()),
            changes,
        }
    }

    fn publish(&self, events: Vec<ChangeEvent>) {
        for event in events {
            tracing::debug!("Change {} on {}", event.kind, event.table);
            // No subscribers is fine.
            let _ = self.changes.send(event);
        }
    }

    /// Creates a verified broker or buyer with a starting balance. Intended for
    /// seeding local runs and tests.
    pub async fn seed_profile(
        &self,
        email: &str,
        user_type: UserType,
        first_name: &str,
        last_name: &str,
        coin_balance: i64,
    ) -> MarketResult<Profile> {
        let profile = self
            .create_profile(NewProfile {
                id: None,
                email: email.to_string(),
                user_type,
                first_name: Some(first_name.to_string()),
                last_name: Some(last_name.to_string()),
                company_name: None,
                phone: None,
            })
            .await?;
        if coin_balance > 0 {
            self.credit_coins(&profile.id, coin_balance, Some("seed")).await?;
        }
        self.set_kyc_status(&profile.id, KycStatus::Verified).await
    }
}

#[async_trait]
impl MarketBackend for MemoryBackend {
    async fn get_account_type_by_email(&self, email: &str) -> MarketResult<Option<UserType>> {
        let state = self.state.lock().await;
        let email = email.trim();
        Ok(state
            .profiles
            .values()
            .find(|p| p.email.eq_ignore_ascii_case(email))
            .map(|p| p.user_type))
    }

    async fn create_profile(&self, input: NewProfile) -> MarketResult<Profile> {
        let mut events = Vec::new();
        let profile = {
            let mut state = self.state.lock().await;
            let email = input.email.trim().to_string();
            if email.is_empty() || !email.contains('@') {
                return Err(MarketError::validation("email", "a valid email is required"));
            }
            if state.profiles.values().any(|p| p.email.eq_ignore_ascii_case(&email)) {
                return Err(MarketError::validation("email", "email is already registered"));
            }
            let id = input.id.unwrap_or_else(new_id);
            if state.profiles.contains_key(&id) {
                return Err(MarketError::InvalidState(format!("profile {} already exists", id)));
            }
            let now = Utc::now();
            let profile = Profile {
                id: id.clone(),
                email,
                user_type: input.user_type,
                first_name: normalize_text(input.first_name.as_deref()),
                last_name: normalize_text(input.last_name.as_deref()),
                company_name: normalize_text(input.company_name.as_deref()),
                phone: normalize_text(input.phone.as_deref()),
                coin_balance: 0,
                kyc_status: KycStatus::NotSubmitted,
                created_at: now,
                updated_at: now,
            };
            events.push(ChangeEvent::insert(Table::Profiles, &profile));
            state.profiles.insert(id, profile.clone());
            profile
        };
        self.publish(events);
        Ok(profile)
    }

    async fn get_profile(&self, user_id: &str) -> MarketResult<Profile> {
        let state = self.state.lock().await;
        state.profile(user_id).cloned()
    }

    async fn get_profile_public(&self, target_user_id: &str) -> MarketResult<PublicProfile> {
        let state = self.state.lock().await;
        Ok(state.profile(target_user_id)?.public())
    }

    async fn set_kyc_status(&self, user_id: &str, status: KycStatus) -> MarketResult<Profile> {
        let mut events = Vec::new();
        let profile = {
            let mut state = self.state.lock().await;
            let profile = state
                .profiles
                .get_mut(user_id)
                .ok_or_else(|| MarketError::not_found("profile", user_id))?;
            let before = profile.clone();
            profile.kyc_status = status;
            profile.updated_at = Utc::now();
            events.push(ChangeEvent::update(Table::Profiles, &before, &*profile));
            profile.clone()
        };
        self.publish(events);
        Ok(profile)
    }

    async fn list_property_matches(&self, query: MatchQuery) -> MarketResult<Vec<PropertyMatch>> {
        let state = self.state.lock().await;
        let mut rows: Vec<PropertyMatch> = state
            .matches
            .iter()
            .filter(|m| m.broker_id == query.broker_id)
            .filter(|m| !query.unpurchased_only || !m.is_lead_purchased)
            .filter(|m| m.match_score > query.min_score)
            .cloned()
            .collect();
        rows.sort_by(|a, b| {
            b.match_score
                .cmp(&a.match_score)
                .then(a.created_at.cmp(&b.created_at))
        });
        if let Some(limit) = query.limit {
            rows.truncate(limit.max(0) as usize);
        }
        Ok(rows)
    }

    async fn upsert_property_match(&self, input: NewPropertyMatch) -> MarketResult<PropertyMatch> {
        input.validate().into_result()?;
        let mut events = Vec::new();
        let row = {
            let mut state = self.state.lock().await;
            let requirement = &state.requirements[state.requirement_index(&input.requirement_id)?];
            if requirement.buyer_id != input.buyer_id {
                return Err(MarketError::InvalidState(format!(
                    "requirement {} does not belong to buyer {}",
                    input.requirement_id, input.buyer_id
                )));
            }
            let property = &state.properties[state.property_index(&input.property_id)?];
            if property.broker_id != input.broker_id {
                return Err(MarketError::InvalidState(format!(
                    "property {} does not belong to broker {}",
                    input.property_id, input.broker_id
                )));
            }

            let existing = state.matches.iter().position(|m| {
                m.broker_id == input.broker_id
                    && m.property_id == input.property_id
                    && m.requirement_id == input.requirement_id
            });
            let now = Utc::now();
            match existing {
                Some(idx) => {
                    let current = &mut state.matches[idx];
                    if current.is_lead_purchased {
                        return Err(MarketError::InvalidState(format!(
                            "match {} is purchased and can no longer be rescored",
                            current.id
                        )));
                    }
                    let before = current.clone();
                    current.match_score = input.match_score;
                    current.updated_at = now;
                    events.push(ChangeEvent::update(Table::PropertyMatches, &before, &*current));
                    current.clone()
                }
                None => {
                    let row = PropertyMatch {
                        id: new_id(),
                        broker_id: input.broker_id,
                        buyer_id: input.buyer_id,
                        property_id: input.property_id,
                        requirement_id: input.requirement_id,
                        match_score: input.match_score,
                        is_lead_purchased: false,
                        created_at: now,
                        updated_at: now,
                    };
                    events.push(ChangeEvent::insert(Table::PropertyMatches, &row));
                    state.matches.push(row.clone());
                    row
                }
            }
        };
        self.publish(events);
        Ok(row)
    }

    async fn purchase_lead(&self, broker_id: &str, params: PurchaseLeadParams) -> MarketResult<RpcOutcome> {
        let mut events = Vec::new();
        let outcome = {
            let mut guard = self.state.lock().await;
            let state = &mut *guard;

            let broker = state.profile(broker_id)?;
            if broker.user_type != UserType::Broker {
                return Err(MarketError::Forbidden("only brokers can purchase leads".to_string()));
            }
            let balance = broker.coin_balance;
            let match_idx = state.match_index(&params.match_id)?;
            let matched = &state.matches[match_idx];
            if matched.broker_id != broker_id {
                return Err(MarketError::Forbidden(format!(
                    "match {} belongs to another broker",
                    params.match_id
                )));
            }

            if let Some(reason) = purchase_rejection(matched, &params, balance) {
                tracing::warn!("Lead purchase for match {} rejected: {}", params.match_id, reason);
                return Ok(RpcOutcome::failed(reason));
            }

            // Every precondition holds; apply all effects.
            let lead_id = new_id();
            let tx = state.post_transaction(
                broker_id,
                params.lead_price,
                TransactionType::Debit,
                Some(&lead_id),
                "Lead purchase",
                &mut events,
            )?;

            let current = &mut state.matches[match_idx];
            let before = current.clone();
            current.is_lead_purchased = true;
            current.updated_at = Utc::now();
            events.push(ChangeEvent::update(Table::PropertyMatches, &before, &*current));
            let property_id = current.property_id.clone();

            let now = Utc::now();
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
                match_id: params.match_id.clone(),
                broker_id: broker_id.to_string(),
                buyer_id: params.buyer_id.clone(),
                property_id,
                requirement_id: params.requirement_id.clone(),
                lead_price: params.lead_price,
                status: LeadStatus::Pending,
                rejection_reason: None,
                chat_id: Some(chat.id.clone()),
                created_at: now,
                decided_at: None,
            };
            events.push(ChangeEvent::insert(Table::Leads, &lead));
            events.push(ChangeEvent::insert(Table::Chats, &chat));
            let chat_id = chat.id.clone();
            state.leads.push(lead);
            state.chats.push(chat);

            tracing::info!(
                "Broker {} purchased match {} for {} coins",
                broker_id,
                params.match_id,
                params.lead_price
            );
            RpcOutcome::ok().with_chat(chat_id).with_balance(tx.balance_after)
        };
        self.publish(events);
        Ok(outcome)
    }

    async fn approve_lead(&self, buyer_id: &str, lead_id: &str) -> MarketResult<RpcOutcome> {
        let mut events = Vec::new();
        let outcome = {
            let mut guard = self.state.lock().await;
            let state = &mut *guard;

            let lead_idx = state.lead_index(lead_id)?;
            let lead = &state.leads[lead_idx];
            if lead.buyer_id != buyer_id {
                return Err(MarketError::Forbidden(format!("lead {} belongs to another buyer", lead_id)));
            }
            let next = match lead.status.decide(lead_id, LeadDecision::Approve) {
                Ok(next) => next,
                Err(e) => return Ok(RpcOutcome::failed(e.to_string())),
            };

            let now = Utc::now();
            let existing_chat = lead
                .chat_id
                .as_deref()
                .and_then(|id| state.chats.iter().position(|c| c.id == id));
            let chat_id = match existing_chat {
                Some(idx) => {
                    let chat = &mut state.chats[idx];
                    if !chat.is_active {
                        let before = chat.clone();
                        chat.is_active = true;
                        events.push(ChangeEvent::update(Table::Chats, &before, &*chat));
                    }
                    chat.id.clone()
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
                    events.push(ChangeEvent::insert(Table::Chats, &chat));
                    let id = chat.id.clone();
                    state.chats.push(chat);
                    id
                }
            };

            let requirement_id = state.leads[lead_idx].requirement_id.clone();
            if let Some(requirement) = state.requirements.iter_mut().find(|r| r.id == requirement_id) {
                if requirement.status.can_transition_to(RequirementStatus::Matched) {
                    let before = requirement.clone();
                    requirement.status = RequirementStatus::Matched;
                    requirement.updated_at = now;
                    events.push(ChangeEvent::update(Table::Requirements, &before, &*requirement));
                }
            }

            let lead = &mut state.leads[lead_idx];
            let before = lead.clone();
            lead.status = next;
            lead.chat_id = Some(chat_id.clone());
            lead.decided_at = Some(now);
            events.push(ChangeEvent::update(Table::Leads, &before, &*lead));

            tracing::info!("Buyer {} approved lead {}", buyer_id, lead_id);
            RpcOutcome::ok().with_chat(chat_id)
        };
        self.publish(events);
        Ok(outcome)
    }

    async fn reject_lead(
        &self,
        buyer_id: &str,
        lead_id: &str,
        rejection_reason: Option<&str>,
    ) -> MarketResult<RpcOutcome> {
        let mut events = Vec::new();
        let outcome = {
            let mut guard = self.state.lock().await;
            let state = &mut *guard;

            let lead_idx = state.lead_index(lead_id)?;
            let lead = &state.leads[lead_idx];
            if lead.buyer_id != buyer_id {
                return Err(MarketError::Forbidden(format!("lead {} belongs to another buyer", lead_id)));
            }
            let next = match lead.status.decide(lead_id, LeadDecision::Reject) {
                Ok(next) => next,
                Err(e) => return Ok(RpcOutcome::failed(e.to_string())),
            };
            let broker_id = lead.broker_id.clone();
            let lead_price = lead.lead_price;
            let chat_id = lead.chat_id.clone();

            state.post_transaction(
                &broker_id,
                lead_price,
                TransactionType::Refund,
                Some(lead_id),
                "Lead rejected by buyer",
                &mut events,
            )?;

            if let Some(chat) = chat_id
                .as_deref()
                .and_then(|id| state.chats.iter_mut().find(|c| c.id == id))
            {
                let before = chat.clone();
                chat.is_active = false;
                events.push(ChangeEvent::update(Table::Chats, &before, &*chat));
            }

            let lead = &mut state.leads[lead_idx];
            let before = lead.clone();
            lead.status = next;
            lead.rejection_reason = rejection_reason
                .filter(|r| !r.trim().is_empty())
                .map(str::to_string);
            lead.decided_at = Some(Utc::now());
            events.push(ChangeEvent::update(Table::Leads, &before, &*lead));

            tracing::info!("Buyer {} rejected lead {}", buyer_id, lead_id);
            RpcOutcome::ok()
        };
        self.publish(events);
        Ok(outcome)
    }

    async fn list_leads(
        &self,
        user_id: &str,
        role: LeadRole,
        status: Option<LeadStatus>,
    ) -> MarketResult<Vec<LeadDetail>> {
        let state = self.state.lock().await;
        let mut rows: Vec<LeadDetail> = state
            .leads
            .iter()
            .filter(|l| match role {
                LeadRole::Broker => l.broker_id == user_id,
                LeadRole::Buyer => l.buyer_id == user_id,
            })
            .filter(|l| status.map_or(true, |s| l.status == s))
            .map(|l| state.lead_detail(l, role))
            .collect();
        rows.sort_by(|a, b| b.lead.created_at.cmp(&a.lead.created_at));
        Ok(rows)
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
        let mut events = Vec::new();
        let tx = {
            let mut state = self.state.lock().await;
            state.post_transaction(
                user_id,
                amount,
                TransactionType::Credit,
                reference_id,
                "Coin refill",
                &mut events,
            )?
        };
        self.publish(events);
        Ok(tx)
    }

    async fn list_wallet_transactions(&self, user_id: &str) -> MarketResult<Vec<WalletTransaction>> {
        let state = self.state.lock().await;
        Ok(state
            .transactions
            .iter()
            .rev()
            .filter(|t| t.user_id == user_id)
            .cloned()
            .collect())
    }

    async fn get_broker_stats(&self, broker_id: &str) -> MarketResult<BrokerStats> {
        let state = self.state.lock().await;
        let profile = state.profile(broker_id)?;
        let mut stats = BrokerStats {
            coin_balance: profile.coin_balance,
            available_matches: state
                .matches
                .iter()
                .filter(|m| m.broker_id == broker_id && !m.is_lead_purchased)
                .count() as i64,
            ..BrokerStats::default()
        };
        for lead in state.leads.iter().filter(|l| l.broker_id == broker_id) {
            stats.leads_purchased += 1;
            match lead.status {
                LeadStatus::Pending => stats.leads_pending += 1,
                LeadStatus::Approved => stats.leads_approved += 1,
                LeadStatus::Rejected => stats.leads_rejected += 1,
            }
        }
        Ok(stats)
    }

    async fn get_user_chats(&self, user_id: &str) -> MarketResult<Vec<ChatSummary>> {
        let state = self.state.lock().await;
        let mut rows: Vec<ChatSummary> = state
            .chats
            .iter()
            .filter(|c| c.is_participant(user_id))
            .map(|chat| ChatSummary {
                chat: chat.clone(),
                counterparty: state.public_profile(chat.counterparty_of(user_id)),
                last_message: state
                    .messages
                    .iter()
                    .rev()
                    .find(|m| m.chat_id == chat.id)
                    .map(|m| m.content.clone()),
            })
            .collect();
        rows.sort_by(|a, b| {
            let a_at = a.chat.last_message_at.unwrap_or(a.chat.created_at);
            let b_at = b.chat.last_message_at.unwrap_or(b.chat.created_at);
            b_at.cmp(&a_at)
        });
        Ok(rows)
    }

    async fn get_chat_by_id(&self, user_id: &str, chat_id: &str) -> MarketResult<ChatDetail> {
        let state = self.state.lock().await;
        let chat = state.participant_chat(user_id, chat_id)?;
        Ok(ChatDetail {
            chat: chat.clone(),
            broker: state.public_profile(&chat.broker_id),
            buyer: state.public_profile(&chat.buyer_id),
            lead: chat
                .lead_id
                .as_deref()
                .and_then(|id| state.leads.iter().find(|l| l.id == id))
                .cloned(),
        })
    }

    async fn get_chat_messages(&self, user_id: &str, chat_id: &str) -> MarketResult<Vec<Message>> {
        let state = self.state.lock().await;
        state.participant_chat(user_id, chat_id)?;
        Ok(state
            .messages
            .iter()
            .filter(|m| m.chat_id == chat_id)
            .cloned()
            .collect())
    }

    async fn send_message(&self, user_id: &str, chat_id: &str, content: &str) -> MarketResult<Message> {
        let content = content.trim();
        if content.is_empty() {
            return Err(MarketError::validation("content", "message must not be empty"));
        }
        let mut events = Vec::new();
        let message = {
            let mut guard = self.state.lock().await;
            let state = &mut *guard;
            let chat = state.participant_chat(user_id, chat_id)?;
            if !chat.is_active {
                return Err(MarketError::InvalidState(format!("chat {} is closed", chat_id)));
            }
            let message = Message {
                id: new_id(),
                chat_id: chat_id.to_string(),
                sender_id: user_id.to_string(),
                content: content.to_string(),
                created_at: Utc::now(),
            };
            let idx = state.chat_index(chat_id)?;
            state.chats[idx].last_message_at = Some(message.created_at);
            events.push(ChangeEvent::insert(Table::Messages, &message_change(&message)));
            state.messages.push(message.clone());
            message
        };
        self.publish(events);
        Ok(message)
    }

    async fn create_requirement(&self, buyer_id: &str, input: NewRequirement) -> MarketResult<Requirement> {
        input.validate().into_result()?;
        let mut events = Vec::new();
        let requirement = {
            let mut state = self.state.lock().await;
            if state.profile(buyer_id)?.user_type != UserType::Buyer {
                return Err(MarketError::Forbidden("only buyers can post requirements".to_string()));
            }
            let now = Utc::now();
            let requirement = Requirement {
                id: new_id(),
                buyer_id: buyer_id.to_string(),
                property_type: input.property_type.trim().to_string(),
                location: normalize_text(input.location.as_deref()),
                budget_min: input.budget_min,
                budget_max: input.budget_max,
                area_min: input.area_min,
                area_max: input.area_max,
                bedrooms: input.bedrooms,
                urgency: input.urgency,
                notes: normalize_text(input.notes.as_deref()),
                status: RequirementStatus::Active,
                created_at: now,
                updated_at: now,
            };
            events.push(ChangeEvent::insert(Table::Requirements, &requirement));
            state.requirements.push(requirement.clone());
            requirement
        };
        self.publish(events);
        Ok(requirement)
    }

    async fn update_requirement(
        &self,
        buyer_id: &str,
        requirement_id: &str,
        input: NewRequirement,
    ) -> MarketResult<Requirement> {
        input.validate().into_result()?;
        let mut events = Vec::new();
        let requirement = {
            let mut state = self.state.lock().await;
            let idx = state.requirement_index(requirement_id)?;
            let requirement = &mut state.requirements[idx];
            if requirement.buyer_id != buyer_id {
                return Err(MarketError::Forbidden(format!(
                    "requirement {} belongs to another buyer",
                    requirement_id
                )));
            }
            if requirement.status == RequirementStatus::Closed {
                return Err(MarketError::InvalidState(format!(
                    "requirement {} is closed",
                    requirement_id
                )));
            }
            let before = requirement.clone();
            requirement.property_type = input.property_type.trim().to_string();
            requirement.location = normalize_text(input.location.as_deref());
            requirement.budget_min = input.budget_min;
            requirement.budget_max = input.budget_max;
            requirement.area_min = input.area_min;
            requirement.area_max = input.area_max;
            requirement.bedrooms = input.bedrooms;
            requirement.urgency = input.urgency;
            requirement.notes = normalize_text(input.notes.as_deref());
            requirement.updated_at = Utc::now();
            events.push(ChangeEvent::update(Table::Requirements, &before, &*requirement));
            requirement.clone()
        };
        self.publish(events);
        Ok(requirement)
    }

    async fn set_requirement_status(
        &self,
        buyer_id: &str,
        requirement_id: &str,
        status: RequirementStatus,
    ) -> MarketResult<Requirement> {
        let mut events = Vec::new();
        let requirement = {
            let mut state = self.state.lock().await;
            let idx = state.requirement_index(requirement_id)?;
            let requirement = &mut state.requirements[idx];
            if requirement.buyer_id != buyer_id {
                return Err(MarketError::Forbidden(format!(
                    "requirement {} belongs to another buyer",
                    requirement_id
                )));
            }
            if !requirement.status.can_transition_to(status) {
                return Err(MarketError::InvalidState(format!(
                    "requirement cannot move from {} to {}",
                    requirement.status, status
                )));
            }
            let before = requirement.clone();
            requirement.status = status;
            requirement.updated_at = Utc::now();
            events.push(ChangeEvent::update(Table::Requirements, &before, &*requirement));
            requirement.clone()
        };
        self.publish(events);
        Ok(requirement)
    }

    async fn list_requirements(&self, buyer_id: &str) -> MarketResult<Vec<Requirement>> {
        let state = self.state.lock().await;
        let mut rows: Vec<Requirement> = state
            .requirements
            .iter()
            .filter(|r| r.buyer_id == buyer_id)
            .cloned()
            .collect();
        rows.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(rows)
    }

    async fn get_requirement(&self, requirement_id: &str) -> MarketResult<Requirement> {
        let state = self.state.lock().await;
        let idx = state.requirement_index(requirement_id)?;
        Ok(state.requirements[idx].clone())
    }

    async fn submit_property(&self, broker_id: &str, draft: PropertyDraft) -> MarketResult<PropertyApproval> {
        draft.validate().into_result()?;
        let mut events = Vec::new();
        let approval = {
            let mut state = self.state.lock().await;
            let broker = state.profile(broker_id)?;
            if broker.user_type != UserType::Broker {
                return Err(MarketError::Forbidden("only brokers can list properties".to_string()));
            }
            if broker.kyc_status != KycStatus::Verified {
                return Err(MarketError::Forbidden(
                    "KYC verification is required before listing properties".to_string(),
                ));
            }
            let approval = PropertyApproval {
                id: new_id(),
                broker_id: broker_id.to_string(),
                draft,
                status: ApprovalStatus::Pending,
                reviewer_notes: None,
                property_id: None,
                created_at: Utc::now(),
                reviewed_at: None,
            };
            events.push(ChangeEvent::insert(Table::PropertyApprovals, &approval));
            state.approvals.push(approval.clone());
            approval
        };
        self.publish(events);
        Ok(approval)
    }

    async fn review_property_approval(
        &self,
        approval_id: &str,
        decision: ApprovalDecision,
    ) -> MarketResult<PropertyApproval> {
        let mut events = Vec::new();
        let approval = {
            let mut guard = self.state.lock().await;
            let state = &mut *guard;
            let idx = state
                .approvals
                .iter()
                .position(|a| a.id == approval_id)
                .ok_or_else(|| MarketError::not_found("property approval", approval_id))?;
            if state.approvals[idx].status != ApprovalStatus::Pending {
                return Err(MarketError::InvalidState(format!(
                    "approval {} is already {}",
                    approval_id, state.approvals[idx].status
                )));
            }

            let now = Utc::now();
            let before = state.approvals[idx].clone();
            let (status, notes, property) = match decision {
                ApprovalDecision::Approve { notes } => {
                    let draft = &before.draft;
                    let property = Property {
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
                        status: PropertyStatus::Active,
                        user_status: None,
                        created_at: now,
                        updated_at: now,
                    };
                    (ApprovalStatus::Approved, notes, Some(property))
                }
                ApprovalDecision::Reject { notes } => (ApprovalStatus::Rejected, notes, None),
            };

            let approval = &mut state.approvals[idx];
            approval.status = status;
            approval.reviewer_notes = normalize_text(notes.as_deref());
            approval.reviewed_at = Some(now);
            approval.property_id = property.as_ref().map(|p| p.id.clone());
            events.push(ChangeEvent::update(Table::PropertyApprovals, &before, &*approval));
            let approval = approval.clone();

            if let Some(property) = property {
                events.push(ChangeEvent::insert(Table::Properties, &property));
                state.properties.push(property);
            }
            approval
        };
        self.publish(events);
        Ok(approval)
    }

    async fn list_property_approvals(&self, broker_id: &str) -> MarketResult<Vec<PropertyApproval>> {
        let state = self.state.lock().await;
        Ok(state
            .approvals
            .iter()
            .rev()
            .filter(|a| a.broker_id == broker_id)
            .cloned()
            .collect())
    }

    async fn list_broker_properties(&self, broker_id: &str) -> MarketResult<Vec<Property>> {
        let state = self.state.lock().await;
        Ok(state
            .properties
            .iter()
            .rev()
            .filter(|p| p.broker_id == broker_id)
            .cloned()
            .collect())
    }

    async fn search_properties(&self, search: PropertySearch) -> MarketResult<Vec<Property>> {
        let state = self.state.lock().await;
        let mut rows: Vec<Property> = state
            .properties
            .iter()
            .rev()
            .filter(|p| search.matches(p))
            .cloned()
            .collect();
        if let Some(limit) = search.limit {
            rows.truncate(limit.max(0) as usize);
        }
        Ok(rows)
    }

    async fn get_property(&self, property_id: &str) -> MarketResult<Property> {
        let state = self.state.lock().await;
        let idx = state.property_index(property_id)?;
        Ok(state.properties[idx].clone())
    }

    async fn set_property_status(
        &self,
        broker_id: &str,
        property_id: &str,
        status: PropertyStatus,
        user_status: Option<&str>,
    ) -> MarketResult<Property> {
        let mut events = Vec::new();
        let property = {
            let mut state = self.state.lock().await;
            let idx = state.property_index(property_id)?;
            let property = &mut state.properties[idx];
            if property.broker_id != broker_id {
                return Err(MarketError::Forbidden(format!(
                    "property {} belongs to another broker",
                    property_id
                )));
            }
            let before = property.clone();
            property.status = status;
            property.user_status = normalize_text(user_status);
            property.updated_at = Utc::now();
            events.push(ChangeEvent::update(Table::Properties, &before, &*property));
            property.clone()
        };
        self.publish(events);
        Ok(property)
    }

    fn change_feed(&self) -> Option<broadcast::Receiver<ChangeEvent>> {
        Some(self.changes.subscribe())
    }
}

/// Business checks of `purchase_lead`, in the order the procedure reports them.
pub(crate) fn purchase_rejection(
    matched: &PropertyMatch,
    params: &PurchaseLeadParams,
    balance: i64,
) -> Option<&'static str> {
    if matched.is_lead_purchased {
        return Some("Lead already purchased");
    }
    if matched.buyer_id != params.buyer_id || matched.requirement_id != params.requirement_id {
        return Some("Match does not correspond to this buyer requirement");
    }
    if params.lead_price <= 0 {
        return Some("Invalid lead price");
    }
    if balance < params.lead_price {
        return Some("Insufficient coin balance");
    }
    None
}

/// Message rows are published without their content.
pub(crate) fn message_change(message: &Message) -> serde_json::Value {
    json!({
        "id": message.id,
        "chat_id": message.chat_id,
        "sender_id": message.sender_id,
        "created_at": message.created_at,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Fixture {
        backend: MemoryBackend,
        broker: Profile,
        buyer: Profile,
        requirement: Requirement,
        property: Property,
    }

    async fn fixture(broker_balance: i64) -> Fixture {
        let backend = MemoryBackend::new();
        let broker = backend
            .seed_profile("broker@example.com", UserType::Broker, "Ravi", "Kumar", broker_balance)
            .await
            .unwrap();
        let buyer = backend
            .seed_profile("buyer@example.com", UserType::Buyer, "Meera", "Shah", 0)
            .await
            .unwrap();
        let requirement = backend
            .create_requirement(
                &buyer.id,
                NewRequirement {
                    property_type: "apartment".to_string(),
                    location: Some("Baner, Pune".to_string()),
                    budget_min: Some(5_000_000),
                    budget_max: Some(8_000_000),
                    area_min: Some(900),
                    area_max: Some(1400),
                    bedrooms: Some(2),
                    urgency: Urgency::High,
                    notes: None,
                },
            )
            .await
            .unwrap();
        let approval = backend
            .submit_property(
                &broker.id,
                PropertyDraft {
                    title: "2BHK near Baner road".to_string(),
                    property_type: "apartment".to_string(),
                    location: "Baner, Pune".to_string(),
                    price: 7_200_000,
                    area: Some(1100),
                    bedrooms: Some(2),
                    description: None,
                },
            )
            .await
            .unwrap();
        let approval = backend
            .review_property_approval(&approval.id, ApprovalDecision::Approve { notes: None })
            .await
            .unwrap();
        let property = backend
            .get_property(approval.property_id.as_deref().unwrap())
            .await
            .unwrap();
        Fixture {
            backend,
            broker,
            buyer,
            requirement,
            property,
        }
    }

    async fn scored_match(f: &Fixture, score: i32) -> PropertyMatch {
        f.backend
            .upsert_property_match(NewPropertyMatch {
                broker_id: f.broker.id.clone(),
                buyer_id: f.buyer.id.clone(),
                property_id: f.property.id.clone(),
                requirement_id: f.requirement.id.clone(),
                match_score: score,
            })
            .await
            .unwrap()
    }

    fn params(f: &Fixture, m: &PropertyMatch, price: i64) -> PurchaseLeadParams {
        PurchaseLeadParams {
            match_id: m.id.clone(),
            buyer_id: f.buyer.id.clone(),
            lead_price: price,
            requirement_id: f.requirement.id.clone(),
        }
    }

    #[tokio::test]
    async fn test_purchase_debits_and_creates_lead_and_chat() {
        let f = fixture(200).await;
        let m = scored_match(&f, 85).await;

        let outcome = f.backend.purchase_lead(&f.broker.id, params(&f, &m, 100)).await.unwrap();
        assert!(outcome.success);
        assert_eq!(outcome.new_balance, Some(100));
        assert!(!outcome.chat_id.as_deref().unwrap_or_default().is_empty());

        assert_eq!(f.backend.get_profile(&f.broker.id).await.unwrap().coin_balance, 100);
        let debits: Vec<_> = f
            .backend
            .list_wallet_transactions(&f.broker.id)
            .await
            .unwrap()
            .into_iter()
            .filter(|t| t.tx_type == TransactionType::Debit)
            .collect();
        assert_eq!(debits.len(), 1);
        assert_eq!(debits[0].amount, 100);

        let leads = f.backend.list_leads(&f.broker.id, LeadRole::Broker, None).await.unwrap();
        assert_eq!(leads.len(), 1);
        assert_eq!(leads[0].lead.status, LeadStatus::Pending);
        assert_eq!(leads[0].lead.chat_id, outcome.chat_id);
    }

    #[tokio::test]
    async fn test_purchase_with_insufficient_balance_changes_nothing() {
        let f = fixture(50).await;
        let m = scored_match(&f, 90).await;

        let outcome = f.backend.purchase_lead(&f.broker.id, params(&f, &m, 100)).await.unwrap();
        assert!(!outcome.success);
        assert_eq!(outcome.error.as_deref(), Some("Insufficient coin balance"));

        assert_eq!(f.backend.get_profile(&f.broker.id).await.unwrap().coin_balance, 50);
        assert!(f.backend.list_leads(&f.broker.id, LeadRole::Broker, None).await.unwrap().is_empty());
        assert!(f.backend.get_user_chats(&f.broker.id).await.unwrap().is_empty());
        let stats = f.backend.get_broker_stats(&f.broker.id).await.unwrap();
        assert_eq!(stats.available_matches, 1);
    }

    #[tokio::test]
    async fn test_second_purchase_of_same_match_is_rejected() {
        let f = fixture(500).await;
        let m = scored_match(&f, 90).await;

        assert!(f.backend.purchase_lead(&f.broker.id, params(&f, &m, 100)).await.unwrap().success);
        let again = f.backend.purchase_lead(&f.broker.id, params(&f, &m, 100)).await.unwrap();
        assert!(!again.success);
        assert_eq!(again.error.as_deref(), Some("Lead already purchased"));
        assert_eq!(f.backend.get_profile(&f.broker.id).await.unwrap().coin_balance, 400);
    }

    #[tokio::test]
    async fn test_purchased_match_cannot_be_rescored() {
        let f = fixture(500).await;
        let m = scored_match(&f, 90).await;
        f.backend.purchase_lead(&f.broker.id, params(&f, &m, 100)).await.unwrap();

        let err = f
            .backend
            .upsert_property_match(NewPropertyMatch {
                broker_id: f.broker.id.clone(),
                buyer_id: f.buyer.id.clone(),
                property_id: f.property.id.clone(),
                requirement_id: f.requirement.id.clone(),
                match_score: 10,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, MarketError::InvalidState(_)));
    }

    #[tokio::test]
    async fn test_reject_stores_reason_refunds_and_closes_chat() {
        let f = fixture(200).await;
        let m = scored_match(&f, 90).await;
        let purchase = f.backend.purchase_lead(&f.broker.id, params(&f, &m, 100)).await.unwrap();
        let lead_id = f.backend.list_leads(&f.buyer.id, LeadRole::Buyer, None).await.unwrap()[0]
            .lead
            .id
            .clone();

        let outcome = f
            .backend
            .reject_lead(&f.buyer.id, &lead_id, Some("wrong budget"))
            .await
            .unwrap();
        assert!(outcome.success);
        assert!(outcome.chat_id.is_none());

        let lead = &f.backend.list_leads(&f.buyer.id, LeadRole::Buyer, None).await.unwrap()[0].lead;
        assert_eq!(lead.status, LeadStatus::Rejected);
        assert_eq!(lead.rejection_reason.as_deref(), Some("wrong budget"));

        // No new chat; the purchase chat is closed.
        let chats = f.backend.get_user_chats(&f.buyer.id).await.unwrap();
        assert_eq!(chats.len(), 1);
        assert_eq!(Some(chats[0].chat.id.clone()), purchase.chat_id);
        assert!(!chats[0].chat.is_active);

        assert_eq!(f.backend.get_profile(&f.broker.id).await.unwrap().coin_balance, 200);
    }

    #[tokio::test]
    async fn test_decided_lead_is_never_mutated_again() {
        let f = fixture(200).await;
        let m = scored_match(&f, 90).await;
        f.backend.purchase_lead(&f.broker.id, params(&f, &m, 100)).await.unwrap();
        let lead_id = f.backend.list_leads(&f.buyer.id, LeadRole::Buyer, None).await.unwrap()[0]
            .lead
            .id
            .clone();

        assert!(f.backend.approve_lead(&f.buyer.id, &lead_id).await.unwrap().success);
        let reject = f.backend.reject_lead(&f.buyer.id, &lead_id, Some("changed mind")).await.unwrap();
        assert!(!reject.success);
        let again = f.backend.approve_lead(&f.buyer.id, &lead_id).await.unwrap();
        assert!(!again.success);

        let lead = &f.backend.list_leads(&f.buyer.id, LeadRole::Buyer, None).await.unwrap()[0].lead;
        assert_eq!(lead.status, LeadStatus::Approved);
        assert!(lead.rejection_reason.is_none());
        assert_eq!(
            f.backend.get_requirement(&f.requirement.id).await.unwrap().status,
            RequirementStatus::Matched
        );
    }

    #[tokio::test]
    async fn test_only_owner_can_decide_lead() {
        let f = fixture(200).await;
        let m = scored_match(&f, 90).await;
        f.backend.purchase_lead(&f.broker.id, params(&f, &m, 100)).await.unwrap();
        let lead_id = f.backend.list_leads(&f.buyer.id, LeadRole::Buyer, None).await.unwrap()[0]
            .lead
            .id
            .clone();

        let err = f.backend.approve_lead(&f.broker.id, &lead_id).await.unwrap_err();
        assert!(matches!(err, MarketError::Forbidden(_)));
    }

    #[tokio::test]
    async fn test_match_listing_threshold_order_and_limit() {
        let f = fixture(0).await;
        let low = scored_match(&f, 40).await;
        assert_eq!(low.match_score, 40);

        let query = MatchQuery {
            broker_id: f.broker.id.clone(),
            min_score: 40,
            unpurchased_only: true,
            limit: None,
        };
        // Score must exceed the threshold.
        assert!(f.backend.list_property_matches(query.clone()).await.unwrap().is_empty());

        let rescored = scored_match(&f, 75).await;
        assert_eq!(rescored.id, low.id);
        let rows = f.backend.list_property_matches(query).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].match_score, 75);
    }

    #[tokio::test]
    async fn test_messages_require_participant_and_active_chat() {
        let f = fixture(200).await;
        let m = scored_match(&f, 90).await;
        let chat_id = f
            .backend
            .purchase_lead(&f.broker.id, params(&f, &m, 100))
            .await
            .unwrap()
            .chat_id
            .unwrap();

        f.backend.send_message(&f.broker.id, &chat_id, "Hello Meera").await.unwrap();
        f.backend.send_message(&f.buyer.id, &chat_id, "Hi!").await.unwrap();
        let messages = f.backend.get_chat_messages(&f.buyer.id, &chat_id).await.unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].content, "Hello Meera");

        let outsider = f
            .backend
            .seed_profile("other@example.com", UserType::Broker, "Other", "Broker", 0)
            .await
            .unwrap();
        assert!(matches!(
            f.backend.get_chat_messages(&outsider.id, &chat_id).await,
            Err(MarketError::Forbidden(_))
        ));
        assert!(matches!(
            f.backend.send_message(&f.broker.id, &chat_id, "   ").await,
            Err(MarketError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn test_unverified_broker_cannot_submit_property() {
        let backend = MemoryBackend::new();
        let broker = backend
            .create_profile(NewProfile {
                id: None,
                email: "new@example.com".to_string(),
                user_type: UserType::Broker,
                first_name: None,
                last_name: None,
                company_name: Some("New Homes".to_string()),
                phone: None,
            })
            .await
            .unwrap();
        let err = backend
            .submit_property(
                &broker.id,
                PropertyDraft {
                    title: "Plot".to_string(),
                    property_type: "plot".to_string(),
                    location: "Nashik".to_string(),
                    price: 1_000_000,
                    area: None,
                    bedrooms: None,
                    description: None,
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, MarketError::Forbidden(_)));
    }

    #[tokio::test]
    async fn test_account_type_lookup_is_case_insensitive() {
        let f = fixture(0).await;
        assert_eq!(
            f.backend.get_account_type_by_email("BROKER@example.com").await.unwrap(),
            Some(UserType::Broker)
        );
        assert_eq!(f.backend.get_account_type_by_email("nobody@example.com").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_purchase_publishes_changes() {
        let f = fixture(200).await;
        let m = scored_match(&f, 90).await;
        let mut feed = f.backend.change_feed().unwrap();

        f.backend.purchase_lead(&f.broker.id, params(&f, &m, 100)).await.unwrap();

        let mut tables = Vec::new();
        while let Ok(event) = feed.try_recv() {
            tables.push(event.table);
        }
        assert!(tables.contains(&Table::WalletTransactions));
        assert!(tables.contains(&Table::PropertyMatches));
        assert!(tables.contains(&Table::Leads));
        assert!(tables.contains(&Table::Chats));
    }
}
