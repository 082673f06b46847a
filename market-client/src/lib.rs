pub mod approval;
pub mod cache;
pub mod chat;
pub mod client;
pub mod forms;
pub mod invalidation;
pub mod matching;
pub mod notify;
pub mod purchase;
pub mod realtime;
pub mod session;
pub mod wallet;

#[cfg(test)]
pub(crate) mod testing;

pub use cache::{keys, QueryCache, QueryKey};
pub use chat::ChatView;
pub use client::MarketClient;
pub use forms::{PropertyForm, PropertyStep, RequirementForm, RequirementStep};
pub use invalidation::{InvalidationRule, InvalidationTable};
pub use matching::{mask_name, MatchListing, MatchRow};
pub use notify::{Notice, NoticeAction, NoticeLevel, Notifier, RecordingNotifier, TracingNotifier};
pub use purchase::PurchaseOutcome;
pub use realtime::{ListenerHandle, RealtimeListener};
pub use session::{Session, SessionContext};
pub use wallet::{LedgerEntry, WalletSummary};
