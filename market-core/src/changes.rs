use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Tables whose row changes are published to subscribers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Table {
    Profiles,
    Requirements,
    Properties,
    PropertyApprovals,
    PropertyMatches,
    Leads,
    WalletTransactions,
    Chats,
    Messages,
}

text_enum!(Table {
    Profiles => "profiles",
    Requirements => "requirements",
    Properties => "properties",
    PropertyApprovals => "property_approvals",
    PropertyMatches => "property_matches",
    Leads => "leads",
    WalletTransactions => "wallet_transactions",
    Chats => "chats",
    Messages => "messages",
});

impl Table {
    pub const ALL: [Table; 9] = [
        Table::Profiles,
        Table::Requirements,
        Table::Properties,
        Table::PropertyApprovals,
        Table::PropertyMatches,
        Table::Leads,
        Table::WalletTransactions,
        Table::Chats,
        Table::Messages,
    ];

    /// Redpanda topic carrying this table's changes.
    pub fn topic(&self) -> String {
        format!("changes.{}", self.as_str())
    }

    /// Redis stream the realtime consumer appends to.
    pub fn stream_key(&self) -> String {
        format!("STREAM:CHANGES:{}", self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    Insert,
    Update,
    Delete,
}

text_enum!(ChangeKind {
    Insert => "insert",
    Update => "update",
    Delete => "delete",
});

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub table: Table,
    pub kind: ChangeKind,
    pub record: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub old_record: Option<Value>,
    pub occurred_at: DateTime<Utc>,
}

impl ChangeEvent {
    pub fn insert<T: Serialize>(table: Table, row: &T) -> Self {
        Self {
            table,
            kind: ChangeKind::Insert,
            record: to_value(row),
            old_record: None,
            occurred_at: Utc::now(),
        }
    }

    pub fn update<T: Serialize>(table: Table, old: &T, new: &T) -> Self {
        Self {
            table,
            kind: ChangeKind::Update,
            record: to_value(new),
            old_record: Some(to_value(old)),
            occurred_at: Utc::now(),
        }
    }

    /// Column value from the new record, or the old one for deletes.
    pub fn column(&self, column: &str) -> Option<&Value> {
        self.record
            .get(column)
            .or_else(|| self.old_record.as_ref().and_then(|old| old.get(column)))
    }
}

fn to_value<T: Serialize>(row: &T) -> Value {
    serde_json::to_value(row).unwrap_or_else(|e| {
        tracing::warn!("Failed to serialize change record: {}", e);
        Value::Null
    })
}

/// `column = value` predicate on a change event, e.g. `broker_id = X`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeFilter {
    pub column: String,
    pub value: String,
}

impl ChangeFilter {
    pub fn eq(column: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            column: column.into(),
            value: value.into(),
        }
    }

    pub fn matches(&self, event: &ChangeEvent) -> bool {
        match event.column(&self.column) {
            Some(Value::String(s)) => s == &self.value,
            Some(Value::Number(n)) => n.to_string() == self.value,
            Some(Value::Bool(b)) => b.to_string() == self.value,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_filter_matches_record_column() {
        let event = ChangeEvent::insert(
            Table::PropertyMatches,
            &json!({"id": "m1", "broker_id": "b1", "match_score": 82}),
        );
        assert!(ChangeFilter::eq("broker_id", "b1").matches(&event));
        assert!(!ChangeFilter::eq("broker_id", "b2").matches(&event));
        assert!(ChangeFilter::eq("match_score", "82").matches(&event));
        assert!(!ChangeFilter::eq("buyer_id", "b1").matches(&event));
    }

    #[test]
    fn test_filter_falls_back_to_old_record() {
        let event = ChangeEvent {
            table: Table::Leads,
            kind: ChangeKind::Delete,
            record: json!({}),
            old_record: Some(json!({"buyer_id": "u1"})),
            occurred_at: Utc::now(),
        };
        assert!(ChangeFilter::eq("buyer_id", "u1").matches(&event));
    }

    #[test]
    fn test_topic_and_stream_names() {
        assert_eq!(Table::WalletTransactions.topic(), "changes.wallet_transactions");
        assert_eq!(Table::Messages.stream_key(), "STREAM:CHANGES:messages");
        assert_eq!("property_matches".parse::<Table>().unwrap(), Table::PropertyMatches);
    }
}
