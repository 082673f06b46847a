use market_core::error::{MarketError, MarketResult};
use market_core::types::{ChatDetail, ChatSummary, Message};

use crate::cache::keys;
use crate::client::MarketClient;
use crate::invalidation::InvalidationTable;
use crate::realtime::{ListenerHandle, RealtimeListener};

/// One open conversation.
#[derive(Clone)]
pub struct ChatView {
    client: MarketClient,
    chat_id: String,
}

impl MarketClient {
    pub async fn chats(&self) -> MarketResult<Vec<ChatSummary>> {
        let session = self.signed_in()?;
        self.cache
            .fetch(keys::chats(&session.user_id), || self.backend.get_user_chats(&session.user_id))
            .await
    }

    pub fn open_chat(&self, chat_id: &str) -> ChatView {
        ChatView {
            client: self.clone(),
            chat_id: chat_id.to_string(),
        }
    }
}

impl ChatView {
    pub fn chat_id(&self) -> &str {
        &self.chat_id
    }

    pub async fn detail(&self) -> MarketResult<ChatDetail> {
        let session = self.client.signed_in()?;
        self.client
            .cache
            .fetch(keys::chat(&self.chat_id), || {
                self.client.backend.get_chat_by_id(&session.user_id, &self.chat_id)
            })
            .await
    }

    /// Messages in the order the backend returns them.
    pub async fn messages(&self) -> MarketResult<Vec<Message>> {
        let session = self.client.signed_in()?;
        self.client
            .cache
            .fetch(keys::chat_messages(&self.chat_id), || {
                self.client.backend.get_chat_messages(&session.user_id, &self.chat_id)
            })
            .await
    }

    pub async fn send(&self, content: &str) -> MarketResult<Message> {
        let session = self.client.signed_in()?;
        let content = content.trim();
        if content.is_empty() {
            return Err(MarketError::validation("content", "message must not be empty"));
        }
        match self
            .client
            .backend
            .send_message(&session.user_id, &self.chat_id, content)
            .await
        {
            Ok(message) => {
                self.client.invalidate(&[
                    keys::chat_messages(&self.chat_id),
                    keys::chats(&session.user_id),
                ]);
                Ok(message)
            }
            Err(e) => {
                self.client.notifier.error("Message not sent", &e.to_string());
                Err(e)
            }
        }
    }

    /// Subscribes to new messages in this chat until the handle is dropped.
    pub fn listen(&self) -> Option<ListenerHandle> {
        let feed = self.client.backend.change_feed()?;
        let table = InvalidationTable::new().with_chat(&self.chat_id);
        Some(RealtimeListener::spawn(feed, table, self.client.cache.clone()))
    }
}
