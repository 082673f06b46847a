//! Shared fixture for client tests: one broker, one buyer, one requirement
//! and a scored match, all on the in-memory backend.

use std::sync::Arc;

use market_core::config::MarketplaceConfig;
use market_core::types::*;
use market_core::{MarketBackend, MemoryBackend};

use crate::client::MarketClient;
use crate::notify::RecordingNotifier;

pub(crate) struct Fixture {
    pub backend: Arc<MemoryBackend>,
    pub notifier: Arc<RecordingNotifier>,
    pub broker: Profile,
    pub buyer: Profile,
    pub requirement: Requirement,
    pub matches: Vec<PropertyMatch>,
}

impl Fixture {
    /// Broker starts with `broker_balance` coins and one match scored 90.
    pub async fn new(broker_balance: i64) -> Self {
        let backend = Arc::new(MemoryBackend::new());
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
                    area_min: None,
                    area_max: None,
                    bedrooms: Some(2),
                    urgency: Urgency::High,
                    notes: None,
                },
            )
            .await
            .unwrap();
        let mut fixture = Fixture {
            backend,
            notifier: Arc::new(RecordingNotifier::new()),
            broker,
            buyer,
            requirement,
            matches: Vec::new(),
        };
        fixture.add_match(90).await;
        fixture
    }

    /// Lists a fresh property for the broker and scores it against the requirement.
    pub async fn add_match(&mut self, score: i32) -> PropertyMatch {
        let approval = self
            .backend
            .submit_property(
                &self.broker.id,
                PropertyDraft {
                    title: format!("Listing {}", self.matches.len() + 1),
                    property_type: "apartment".to_string(),
                    location: "Baner, Pune".to_string(),
                    price: 7_000_000,
                    area: Some(1000),
                    bedrooms: Some(2),
                    description: None,
                },
            )
            .await
            .unwrap();
        let approval = self
            .backend
            .review_property_approval(&approval.id, ApprovalDecision::Approve { notes: None })
            .await
            .unwrap();
        let m = self
            .backend
            .upsert_property_match(NewPropertyMatch {
                broker_id: self.broker.id.clone(),
                buyer_id: self.buyer.id.clone(),
                property_id: approval.property_id.unwrap(),
                requirement_id: self.requirement.id.clone(),
                match_score: score,
            })
            .await
            .unwrap();
        self.matches.push(m.clone());
        m
    }

    pub fn client(&self) -> MarketClient {
        let backend: Arc<dyn MarketBackend> = self.backend.clone();
        MarketClient::new(backend, MarketplaceConfig::default()).with_notifier(self.notifier.clone())
    }

    pub async fn client_for(&self, profile: &Profile) -> MarketClient {
        let client = self.client();
        client.sign_in(&profile.id, &profile.email).await.unwrap();
        client
    }

    /// Buys a match behind the client's back, as another device would.
    pub async fn purchase_directly(&self, m: &PropertyMatch) -> RpcOutcome {
        self.backend
            .purchase_lead(
                &self.broker.id,
                PurchaseLeadParams {
                    match_id: m.id.clone(),
                    buyer_id: m.buyer_id.clone(),
                    lead_price: 100,
                    requirement_id: m.requirement_id.clone(),
                },
            )
            .await
            .unwrap()
    }
}
