use serde::Serialize;

use market_core::config::MarketplaceConfig;
use market_core::error::MarketResult;
use market_core::types::{MatchQuery, Property, PropertyMatch, Requirement};

use crate::cache::keys;
use crate::client::MarketClient;

/// Which lead listing a broker is looking at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MatchListing {
    /// Dashboard summary: best few matches only.
    Dashboard,
    Full,
}

impl MatchListing {
    pub fn as_str(&self) -> &'static str {
        match self {
            MatchListing::Dashboard => "dashboard",
            MatchListing::Full => "full",
        }
    }

    pub fn query(&self, broker_id: &str, config: &MarketplaceConfig) -> MatchQuery {
        let (min_score, limit) = match self {
            MatchListing::Dashboard => (config.dashboard_min_score, Some(config.dashboard_limit)),
            MatchListing::Full => (config.listing_min_score, None),
        };
        MatchQuery {
            broker_id: broker_id.to_string(),
            min_score,
            unpurchased_only: true,
            limit,
        }
    }
}

/// A match resolved for display.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MatchRow {
    pub match_id: String,
    pub match_score: i32,
    pub buyer_id: String,
    /// Masked until the lead is purchased.
    pub buyer_name: String,
    pub requirement: Requirement,
    pub property: Property,
    pub is_lead_purchased: bool,
}

/// Keeps the first and last character of each word and stars the rest.
pub fn mask_name(name: &str) -> String {
    name.split_whitespace()
        .map(|word| {
            let chars: Vec<char> = word.chars().collect();
            match chars.len() {
                0 => String::new(),
                1 => "*".to_string(),
                2 => format!("{}*", chars[0]),
                n => {
                    let mut masked = String::with_capacity(word.len());
                    masked.push(chars[0]);
                    masked.extend(std::iter::repeat('*').take(n - 2));
                    masked.push(chars[n - 1]);
                    masked
                }
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

impl MarketClient {
    pub async fn matches(&self, listing: MatchListing) -> MarketResult<Vec<MatchRow>> {
        let session = self.signed_in()?;
        let key = keys::match_listing(&session.user_id, listing.as_str());
        let query = listing.query(&session.user_id, &self.config);
        self.cache
            .fetch(key, || async move {
                let found = self.backend.list_property_matches(query).await?;
                let mut rows = Vec::with_capacity(found.len());
                for m in found {
                    rows.push(self.resolve_match(m).await?);
                }
                Ok(rows)
            })
            .await
    }

    async fn resolve_match(&self, m: PropertyMatch) -> MarketResult<MatchRow> {
        let requirement = self.backend.get_requirement(&m.requirement_id).await?;
        let property = self.backend.get_property(&m.property_id).await?;
        let raw_name = self.backend.get_profile_public(&m.buyer_id).await?.display_name();
        let buyer_name = if m.is_lead_purchased {
            raw_name
        } else {
            mask_name(&raw_name)
        };
        Ok(MatchRow {
            match_id: m.id,
            match_score: m.match_score,
            buyer_id: m.buyer_id,
            buyer_name,
            requirement,
            property,
            is_lead_purchased: m.is_lead_purchased,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::Fixture;
    use market_core::MarketBackend;

    #[test]
    fn test_mask_name_keeps_edges() {
        assert_eq!(mask_name("Meera Shah"), "M***a S**h");
        assert_eq!(mask_name("Jo"), "J*");
        assert_eq!(mask_name("K"), "*");
        assert_eq!(mask_name("  Ana   Li "), "A*a L*");
        assert_eq!(mask_name(""), "");
    }

    #[test]
    fn test_masked_name_differs_from_raw_in_interior() {
        for raw in ["Meera Shah", "Aditya", "Wei"] {
            let masked = mask_name(raw);
            assert_ne!(masked, raw);
            assert_eq!(masked.chars().next(), raw.chars().next());
            assert_eq!(masked.chars().last(), raw.chars().last());
        }
    }

    #[test]
    fn test_listing_thresholds_from_config() {
        let config = MarketplaceConfig::default();
        let dashboard = MatchListing::Dashboard.query("b1", &config);
        assert_eq!((dashboard.min_score, dashboard.limit), (70, Some(5)));
        assert!(dashboard.unpurchased_only);
        let full = MatchListing::Full.query("b1", &config);
        assert_eq!((full.min_score, full.limit), (40, None));
    }

    #[tokio::test]
    async fn test_dashboard_filters_orders_and_masks() {
        let mut f = Fixture::new(0).await;
        f.add_match(70).await;
        f.add_match(95).await;
        f.add_match(55).await;
        let client = f.client_for(&f.broker).await;

        let dashboard = client.matches(MatchListing::Dashboard).await.unwrap();
        let scores: Vec<i32> = dashboard.iter().map(|r| r.match_score).collect();
        assert_eq!(scores, vec![95, 90]);
        assert!(dashboard.iter().all(|r| r.buyer_name == "M***a S**h"));

        let full = client.matches(MatchListing::Full).await.unwrap();
        let scores: Vec<i32> = full.iter().map(|r| r.match_score).collect();
        assert_eq!(scores, vec![95, 90, 70, 55]);
    }

    #[tokio::test]
    async fn test_dashboard_is_capped() {
        let mut f = Fixture::new(0).await;
        for score in [71, 72, 73, 74, 75, 76] {
            f.add_match(score).await;
        }
        let client = f.client_for(&f.broker).await;
        assert_eq!(client.matches(MatchListing::Dashboard).await.unwrap().len(), 5);
    }

    #[tokio::test]
    async fn test_purchased_row_shows_raw_name() {
        let f = Fixture::new(500).await;
        let client = f.client_for(&f.broker).await;
        f.purchase_directly(&f.matches[0]).await;

        let m = f
            .backend
            .list_property_matches(MatchQuery {
                broker_id: f.broker.id.clone(),
                min_score: 0,
                unpurchased_only: false,
                limit: None,
            })
            .await
            .unwrap()
            .remove(0);
        let row = client.resolve_match(m).await.unwrap();
        assert!(row.is_lead_purchased);
        assert_eq!(row.buyer_name, "Meera Shah");
    }

    #[tokio::test]
    async fn test_listing_requires_session() {
        let f = Fixture::new(0).await;
        assert!(f.client().matches(MatchListing::Full).await.is_err());
    }
}
