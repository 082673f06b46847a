use market_core::changes::{ChangeEvent, ChangeFilter, ChangeKind, Table};
use market_core::types::UserType;

use crate::cache::{keys, QueryKey};

/// One row of the event-to-invalidation table.
#[derive(Debug, Clone, PartialEq)]
pub struct InvalidationRule {
    pub table: Table,
    pub kinds: Vec<ChangeKind>,
    pub filter: Option<ChangeFilter>,
    pub keys: Vec<QueryKey>,
}

impl InvalidationRule {
    pub fn new(table: Table, kinds: &[ChangeKind]) -> Self {
        Self {
            table,
            kinds: kinds.to_vec(),
            filter: None,
            keys: Vec::new(),
        }
    }

    pub fn filter(mut self, column: &str, value: &str) -> Self {
        self.filter = Some(ChangeFilter::eq(column, value));
        self
    }

    pub fn invalidates(mut self, key: QueryKey) -> Self {
        self.keys.push(key);
        self
    }

    pub fn applies_to(&self, event: &ChangeEvent) -> bool {
        event.table == self.table
            && self.kinds.contains(&event.kind)
            && self.filter.as_ref().map_or(true, |f| f.matches(event))
    }
}

const INSERT_UPDATE: &[ChangeKind] = &[ChangeKind::Insert, ChangeKind::Update];

/// Which cached queries a pushed row change makes stale.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct InvalidationTable {
    rules: Vec<InvalidationRule>,
}

impl InvalidationTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn rule(mut self, rule: InvalidationRule) -> Self {
        self.rules.push(rule);
        self
    }

    /// Default subscriptions for a signed-in user's dashboards.
    pub fn for_user(user_id: &str, user_type: UserType) -> Self {
        let mut table = Self::new()
            .rule(
                InvalidationRule::new(Table::Profiles, &[ChangeKind::Update])
                    .filter("id", user_id)
                    .invalidates(keys::profile(user_id)),
            )
            .rule(
                InvalidationRule::new(Table::WalletTransactions, &[ChangeKind::Insert])
                    .filter("user_id", user_id)
                    .invalidates(keys::wallet_transactions(user_id))
                    .invalidates(keys::profile(user_id)),
            );

        table = match user_type {
            UserType::Broker => table
                .rule(
                    InvalidationRule::new(Table::PropertyMatches, INSERT_UPDATE)
                        .filter("broker_id", user_id)
                        .invalidates(keys::matches(user_id))
                        .invalidates(keys::broker_stats(user_id)),
                )
                .rule(
                    InvalidationRule::new(Table::Leads, INSERT_UPDATE)
                        .filter("broker_id", user_id)
                        .invalidates(keys::broker_leads(user_id))
                        .invalidates(keys::broker_stats(user_id))
                        .invalidates(keys::chats(user_id)),
                )
                .rule(
                    InvalidationRule::new(Table::Chats, INSERT_UPDATE)
                        .filter("broker_id", user_id)
                        .invalidates(keys::chats(user_id)),
                )
                .rule(
                    InvalidationRule::new(Table::PropertyApprovals, &[ChangeKind::Update])
                        .filter("broker_id", user_id)
                        .invalidates(keys::property_approvals(user_id))
                        .invalidates(keys::properties(user_id)),
                ),
            UserType::Buyer => table
                .rule(
                    InvalidationRule::new(Table::Leads, INSERT_UPDATE)
                        .filter("buyer_id", user_id)
                        .invalidates(keys::buyer_leads(user_id))
                        .invalidates(keys::chats(user_id)),
                )
                .rule(
                    InvalidationRule::new(Table::Chats, INSERT_UPDATE)
                        .filter("buyer_id", user_id)
                        .invalidates(keys::chats(user_id)),
                )
                .rule(
                    InvalidationRule::new(Table::Requirements, INSERT_UPDATE)
                        .filter("buyer_id", user_id)
                        .invalidates(keys::requirements(user_id)),
                ),
        };
        table
    }

    /// Adds the message subscription of an open chat.
    pub fn with_chat(self, chat_id: &str) -> Self {
        self.rule(
            InvalidationRule::new(Table::Messages, &[ChangeKind::Insert])
                .filter("chat_id", chat_id)
                .invalidates(keys::chat_messages(chat_id)),
        )
    }

    pub fn rules(&self) -> &[InvalidationRule] {
        &self.rules
    }

    pub fn tables(&self) -> Vec<Table> {
        let mut tables: Vec<Table> = Vec::new();
        for rule in &self.rules {
            if !tables.contains(&rule.table) {
                tables.push(rule.table);
            }
        }
        tables
    }

    pub fn keys_for(&self, event: &ChangeEvent) -> Vec<QueryKey> {
        let mut hit: Vec<QueryKey> = Vec::new();
        for rule in self.rules.iter().filter(|r| r.applies_to(event)) {
            for key in &rule.keys {
                if !hit.contains(key) {
                    hit.push(key.clone());
                }
            }
        }
        hit
    }

    pub fn all_keys(&self) -> Vec<QueryKey> {
        let mut all: Vec<QueryKey> = Vec::new();
        for key in self.rules.iter().flat_map(|r| r.keys.iter()) {
            if !all.contains(key) {
                all.push(key.clone());
            }
        }
        all
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_broker_match_insert_invalidates_listing_and_stats() {
        let table = InvalidationTable::for_user("b1", UserType::Broker);
        let event = ChangeEvent::insert(Table::PropertyMatches, &json!({"id": "m1", "broker_id": "b1"}));
        assert_eq!(
            table.keys_for(&event),
            vec![keys::matches("b1"), keys::broker_stats("b1")]
        );

        let other = ChangeEvent::insert(Table::PropertyMatches, &json!({"id": "m2", "broker_id": "b2"}));
        assert!(table.keys_for(&other).is_empty());
    }

    #[test]
    fn test_lead_update_routes_by_role() {
        let record = json!({"id": "l1", "broker_id": "b1", "buyer_id": "u1", "status": "approved"});
        let event = ChangeEvent::update(Table::Leads, &record, &record);

        let broker = InvalidationTable::for_user("b1", UserType::Broker);
        assert_eq!(
            broker.keys_for(&event),
            vec![keys::broker_leads("b1"), keys::broker_stats("b1"), keys::chats("b1")]
        );
        let buyer = InvalidationTable::for_user("u1", UserType::Buyer);
        assert_eq!(buyer.keys_for(&event), vec![keys::buyer_leads("u1"), keys::chats("u1")]);
    }

    #[test]
    fn test_wallet_insert_refreshes_profile() {
        let table = InvalidationTable::for_user("u1", UserType::Buyer);
        let event = ChangeEvent::insert(Table::WalletTransactions, &json!({"user_id": "u1", "amount": 100}));
        assert_eq!(
            table.keys_for(&event),
            vec![keys::wallet_transactions("u1"), keys::profile("u1")]
        );
        let record = json!({"user_id": "u1"});
        let update = ChangeEvent::update(Table::WalletTransactions, &record, &record);
        assert!(table.keys_for(&update).is_empty());
    }

    #[test]
    fn test_chat_rule_only_for_open_chat() {
        let table = InvalidationTable::new().with_chat("c1");
        let hit = ChangeEvent::insert(Table::Messages, &json!({"chat_id": "c1"}));
        let miss = ChangeEvent::insert(Table::Messages, &json!({"chat_id": "c2"}));
        assert_eq!(table.keys_for(&hit), vec![keys::chat_messages("c1")]);
        assert!(table.keys_for(&miss).is_empty());
        assert_eq!(table.tables(), vec![Table::Messages]);
    }
}
