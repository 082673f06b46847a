//! Multi-step intake forms. Fields hold raw input; nothing reaches the
//! backend until every step validates.

use std::str::FromStr;

use market_core::error::{MarketResult, ValidationErrors};
use market_core::types::{
    normalize_text, NewRequirement, PropertyApproval, PropertyDraft, Requirement, RequirementStatus,
    Urgency,
};

use crate::cache::keys;
use crate::client::MarketClient;

fn parse_optional<T: FromStr>(errors: &mut ValidationErrors, field: &str, raw: &str) -> Option<T> {
    let raw = raw.trim().replace(',', "");
    if raw.is_empty() {
        return None;
    }
    match raw.parse() {
        Ok(value) => Some(value),
        Err(_) => {
            errors.add(field, "must be a whole number");
            None
        }
    }
}

fn require_text(errors: &mut ValidationErrors, field: &str, raw: &str, message: &str) {
    if raw.trim().is_empty() {
        errors.add(field, message);
    }
}

/// First error per field, restricted to `fields`.
fn only_fields(errors: ValidationErrors, fields: &[&str]) -> ValidationErrors {
    let mut kept = ValidationErrors::new();
    for error in errors.errors {
        if fields.contains(&error.field.as_str()) && !kept.has(&error.field) {
            kept.add(&error.field, error.message);
        }
    }
    kept
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequirementStep {
    Basics,
    Budget,
    Details,
}

impl RequirementStep {
    pub const ALL: [RequirementStep; 3] = [Self::Basics, Self::Budget, Self::Details];

    fn fields(&self) -> &'static [&'static str] {
        match self {
            RequirementStep::Basics => &["property_type", "location"],
            RequirementStep::Budget => &["budget_min", "budget_max"],
            RequirementStep::Details => &["area_min", "area_max", "bedrooms"],
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RequirementForm {
    pub property_type: String,
    pub location: String,
    pub budget_min: String,
    pub budget_max: String,
    pub area_min: String,
    pub area_max: String,
    pub bedrooms: String,
    pub urgency: Urgency,
    pub notes: String,
}

impl Default for RequirementForm {
    fn default() -> Self {
        Self {
            property_type: String::new(),
            location: String::new(),
            budget_min: String::new(),
            budget_max: String::new(),
            area_min: String::new(),
            area_max: String::new(),
            bedrooms: String::new(),
            urgency: Urgency::Medium,
            notes: String::new(),
        }
    }
}

fn text_of<T: ToString>(value: Option<T>) -> String {
    value.map(|v| v.to_string()).unwrap_or_default()
}

impl RequirementForm {
    /// Prefills the form for editing.
    pub fn from_requirement(requirement: &Requirement) -> Self {
        Self {
            property_type: requirement.property_type.clone(),
            location: requirement.location.clone().unwrap_or_default(),
            budget_min: text_of(requirement.budget_min),
            budget_max: text_of(requirement.budget_max),
            area_min: text_of(requirement.area_min),
            area_max: text_of(requirement.area_max),
            bedrooms: text_of(requirement.bedrooms),
            urgency: requirement.urgency,
            notes: requirement.notes.clone().unwrap_or_default(),
        }
    }

    pub fn validate_step(&self, step: RequirementStep) -> ValidationErrors {
        let mut errors = ValidationErrors::new();
        let parsed = self.parse(&mut errors);
        require_text(&mut errors, "location", &self.location, "location is required");
        require_text(&mut errors, "budget_max", &self.budget_max, "maximum budget is required");
        errors.merge(parsed.validate());
        only_fields(errors, step.fields())
    }

    pub fn validate(&self) -> MarketResult<NewRequirement> {
        let mut errors = ValidationErrors::new();
        for step in RequirementStep::ALL {
            errors.merge(self.validate_step(step));
        }
        errors.into_result()?;
        Ok(self.parse(&mut ValidationErrors::new()))
    }

    fn parse(&self, errors: &mut ValidationErrors) -> NewRequirement {
        NewRequirement {
            property_type: self.property_type.trim().to_string(),
            location: normalize_text(Some(&self.location)),
            budget_min: parse_optional(errors, "budget_min", &self.budget_min),
            budget_max: parse_optional(errors, "budget_max", &self.budget_max),
            area_min: parse_optional(errors, "area_min", &self.area_min),
            area_max: parse_optional(errors, "area_max", &self.area_max),
            bedrooms: parse_optional(errors, "bedrooms", &self.bedrooms),
            urgency: self.urgency,
            notes: normalize_text(Some(&self.notes)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PropertyStep {
    Basics,
    Pricing,
    Details,
}

impl PropertyStep {
    pub const ALL: [PropertyStep; 3] = [Self::Basics, Self::Pricing, Self::Details];

    fn fields(&self) -> &'static [&'static str] {
        match self {
            PropertyStep::Basics => &["title", "property_type", "location"],
            PropertyStep::Pricing => &["price"],
            PropertyStep::Details => &["area", "bedrooms"],
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct PropertyForm {
    pub title: String,
    pub property_type: String,
    pub location: String,
    pub price: String,
    pub area: String,
    pub bedrooms: String,
    pub description: String,
}

impl PropertyForm {
    pub fn validate_step(&self, step: PropertyStep) -> ValidationErrors {
        let mut errors = ValidationErrors::new();
        let draft = self.parse(&mut errors);
        require_text(&mut errors, "price", &self.price, "price is required");
        errors.merge(draft.validate());
        only_fields(errors, step.fields())
    }

    pub fn validate(&self) -> MarketResult<PropertyDraft> {
        let mut errors = ValidationErrors::new();
        for step in PropertyStep::ALL {
            errors.merge(self.validate_step(step));
        }
        errors.into_result()?;
        Ok(self.parse(&mut ValidationErrors::new()))
    }

    fn parse(&self, errors: &mut ValidationErrors) -> PropertyDraft {
        PropertyDraft {
            title: self.title.trim().to_string(),
            property_type: self.property_type.trim().to_string(),
            location: self.location.trim().to_string(),
            price: parse_optional(errors, "price", &self.price).unwrap_or(0),
            area: parse_optional(errors, "area", &self.area),
            bedrooms: parse_optional(errors, "bedrooms", &self.bedrooms),
            description: normalize_text(Some(&self.description)),
        }
    }
}

impl MarketClient {
    pub async fn requirements(&self) -> MarketResult<Vec<Requirement>> {
        let session = self.signed_in()?;
        self.cache
            .fetch(keys::requirements(&session.user_id), || {
                self.backend.list_requirements(&session.user_id)
            })
            .await
    }

    pub async fn submit_requirement(&self, form: &RequirementForm) -> MarketResult<Requirement> {
        let session = self.signed_in()?;
        let input = form.validate()?;
        let requirement = self.backend.create_requirement(&session.user_id, input).await?;
        self.invalidate(&[keys::requirements(&session.user_id)]);
        self.notifier.success("Requirement posted", "Brokers with matching properties will reach out.");
        Ok(requirement)
    }

    pub async fn update_requirement(&self, requirement_id: &str, form: &RequirementForm) -> MarketResult<Requirement> {
        let session = self.signed_in()?;
        let input = form.validate()?;
        let requirement = self
            .backend
            .update_requirement(&session.user_id, requirement_id, input)
            .await?;
        self.invalidate(&[keys::requirements(&session.user_id)]);
        Ok(requirement)
    }

    pub async fn close_requirement(&self, requirement_id: &str) -> MarketResult<Requirement> {
        let session = self.signed_in()?;
        let requirement = self
            .backend
            .set_requirement_status(&session.user_id, requirement_id, RequirementStatus::Closed)
            .await?;
        self.invalidate(&[keys::requirements(&session.user_id)]);
        Ok(requirement)
    }

    pub async fn property_approvals(&self) -> MarketResult<Vec<PropertyApproval>> {
        let session = self.signed_in()?;
        self.cache
            .fetch(keys::property_approvals(&session.user_id), || {
                self.backend.list_property_approvals(&session.user_id)
            })
            .await
    }

    /// Sends a listing for review. It becomes a property once approved.
    pub async fn submit_property(&self, form: &PropertyForm) -> MarketResult<PropertyApproval> {
        let session = self.signed_in()?;
        let draft = form.validate()?;
        match self.backend.submit_property(&session.user_id, draft).await {
            Ok(approval) => {
                self.invalidate(&[keys::property_approvals(&session.user_id)]);
                self.notifier.success("Listing submitted", "We'll notify you once it is reviewed.");
                Ok(approval)
            }
            Err(e) => {
                self.notifier.error("Listing not submitted", &e.to_string());
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::Fixture;
    use market_core::error::MarketError;

    fn filled_requirement() -> RequirementForm {
        RequirementForm {
            property_type: "villa".to_string(),
            location: "Kothrud, Pune".to_string(),
            budget_min: "9,000,000".to_string(),
            budget_max: "12000000".to_string(),
            bedrooms: "3".to_string(),
            urgency: Urgency::Immediate,
            ..RequirementForm::default()
        }
    }

    #[test]
    fn test_requirement_steps_report_their_own_fields() {
        let form = RequirementForm {
            budget_min: "lots".to_string(),
            area_min: "2000".to_string(),
            area_max: "1000".to_string(),
            ..RequirementForm::default()
        };

        let basics = form.validate_step(RequirementStep::Basics);
        assert!(basics.has("property_type"));
        assert!(basics.has("location"));
        assert!(!basics.has("budget_min"));

        let budget = form.validate_step(RequirementStep::Budget);
        assert!(budget.has("budget_min"));
        assert!(budget.has("budget_max"));

        let details = form.validate_step(RequirementStep::Details);
        assert!(details.has("area_min"));
        assert!(!details.has("property_type"));
    }

    #[test]
    fn test_requirement_form_parses_amounts() {
        let input = filled_requirement().validate().unwrap();
        assert_eq!(input.budget_min, Some(9_000_000));
        assert_eq!(input.bedrooms, Some(3));
        assert_eq!(input.area_min, None);
        assert_eq!(input.notes, None);
    }

    #[test]
    fn test_inverted_budget_fails_whole_form() {
        let form = RequirementForm {
            budget_min: "500".to_string(),
            budget_max: "100".to_string(),
            ..filled_requirement()
        };
        let err = form.validate().unwrap_err();
        assert!(matches!(err, MarketError::Validation(ref v) if v.has("budget_min")));
    }

    #[test]
    fn test_property_form_pricing_step() {
        let mut form = PropertyForm {
            title: "3BHK with garden".to_string(),
            property_type: "villa".to_string(),
            location: "Aundh".to_string(),
            ..PropertyForm::default()
        };
        assert!(form.validate_step(PropertyStep::Basics).is_empty());
        assert!(form.validate_step(PropertyStep::Pricing).has("price"));

        form.price = "0".to_string();
        assert!(form.validate_step(PropertyStep::Pricing).has("price"));
        form.price = "15000000".to_string();
        form.area = "-5".to_string();
        assert!(form.validate_step(PropertyStep::Pricing).is_empty());
        assert!(form.validate_step(PropertyStep::Details).has("area"));
        assert!(form.validate().is_err());
    }

    #[tokio::test]
    async fn test_requirement_round_trip_through_client() {
        let f = Fixture::new(0).await;
        let buyer = f.client_for(&f.buyer).await;
        assert_eq!(buyer.requirements().await.unwrap().len(), 1);

        let created = buyer.submit_requirement(&filled_requirement()).await.unwrap();
        assert_eq!(buyer.requirements().await.unwrap().len(), 2);

        let mut form = RequirementForm::from_requirement(&created);
        assert_eq!(form.budget_max, "12000000");
        form.notes = "near a school".to_string();
        let updated = buyer.update_requirement(&created.id, &form).await.unwrap();
        assert_eq!(updated.notes.as_deref(), Some("near a school"));

        let closed = buyer.close_requirement(&created.id).await.unwrap();
        assert_eq!(closed.status, RequirementStatus::Closed);
    }

    #[tokio::test]
    async fn test_invalid_form_never_reaches_backend() {
        let f = Fixture::new(0).await;
        let buyer = f.client_for(&f.buyer).await;
        assert!(buyer.submit_requirement(&RequirementForm::default()).await.is_err());
        assert_eq!(buyer.requirements().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_broker_submits_listing_for_review() {
        let f = Fixture::new(0).await;
        let broker = f.client_for(&f.broker).await;
        let before = broker.property_approvals().await.unwrap().len();
        let form = PropertyForm {
            title: "Office space".to_string(),
            property_type: "commercial".to_string(),
            location: "Hinjewadi".to_string(),
            price: "25000000".to_string(),
            ..PropertyForm::default()
        };
        let approval = broker.submit_property(&form).await.unwrap();
        assert_eq!(approval.draft.price, 25_000_000);
        assert_eq!(broker.property_approvals().await.unwrap().len(), before + 1);
    }
}
