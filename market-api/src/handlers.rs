use axum::{
    extract::{Extension, Path, Query},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use market_core::types::{
    BrokerStats, ChatDetail, ChatSummary, LeadDetail, LeadRole, LeadStatus, MatchQuery, Message,
    NewRequirement, Profile, Property, PropertyApproval, PropertyDraft, PropertyMatch,
    PropertySearch, PublicProfile, PurchaseLeadParams, Requirement, RequirementStatus, RpcOutcome,
    UserType, WalletTransaction,
};
use market_core::{MarketContext, MarketError};
use serde::Deserialize;
use std::str::FromStr;

use crate::auth::AuthenticatedUser;

/// `MarketError` rendered as `{ error, message, fields? }`.
#[derive(Debug)]
pub struct ApiError(pub MarketError);

impl From<MarketError> for ApiError {
    fn from(err: MarketError) -> Self {
        ApiError(err)
    }
}

pub fn status_for(err: &MarketError) -> StatusCode {
    match err {
        MarketError::Unauthenticated => StatusCode::UNAUTHORIZED,
        MarketError::Forbidden(_) => StatusCode::FORBIDDEN,
        MarketError::NotFound { .. } => StatusCode::NOT_FOUND,
        MarketError::Validation(_) => StatusCode::UNPROCESSABLE_ENTITY,
        MarketError::InsufficientBalance { .. }
        | MarketError::LeadAlreadyDecided { .. }
        | MarketError::InvalidState(_) => StatusCode::CONFLICT,
        MarketError::Rejected(_) => StatusCode::BAD_REQUEST,
        MarketError::Database(_) | MarketError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = status_for(&self.0);
        let message = if status == StatusCode::INTERNAL_SERVER_ERROR {
            tracing::error!("Request failed: {}", self.0);
            "internal error".to_string()
        } else {
            tracing::debug!("Request refused: {}", self.0);
            self.0.to_string()
        };

        let mut body = serde_json::json!({
            "error": self.0.code(),
            "message": message,
        });
        if let MarketError::Validation(errors) = &self.0 {
            body["fields"] = serde_json::json!(errors.errors);
        }

        (status, Json(body)).into_response()
    }
}

pub type ApiResult<T> = Result<Json<T>, ApiError>;

fn parse_param<T: FromStr>(field: &str, value: Option<&str>) -> Result<Option<T>, MarketError> {
    match value.map(str::trim).filter(|v| !v.is_empty() && *v != "all") {
        None => Ok(None),
        Some(v) => v
            .parse()
            .map(Some)
            .map_err(|_| MarketError::validation(field, format!("unknown value: {}", v))),
    }
}

pub async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "service": "market-api"
    }))
}

#[derive(Deserialize)]
pub struct AccountTypeQuery {
    pub email: String,
}

pub async fn account_type(
    Extension(ctx): Extension<MarketContext>,
    Query(params): Query<AccountTypeQuery>,
) -> ApiResult<serde_json::Value> {
    let user_type: Option<UserType> = ctx.backend.get_account_type_by_email(&params.email).await?;
    Ok(Json(serde_json::json!({ "user_type": user_type })))
}

pub async fn get_profile(
    Extension(ctx): Extension<MarketContext>,
    Extension(user): Extension<AuthenticatedUser>,
) -> ApiResult<Profile> {
    Ok(Json(ctx.backend.get_profile(&user.user_id).await?))
}

pub async fn get_public_profile(
    Extension(ctx): Extension<MarketContext>,
    Path(id): Path<String>,
) -> ApiResult<PublicProfile> {
    Ok(Json(ctx.backend.get_profile_public(&id).await?))
}

#[derive(Deserialize)]
pub struct MatchesQuery {
    #[serde(default)]
    pub min_score: Option<i32>,
    #[serde(default)]
    pub limit: Option<i64>,
    #[serde(default)]
    pub include_purchased: Option<bool>,
}

pub async fn get_matches(
    Extension(ctx): Extension<MarketContext>,
    Extension(user): Extension<AuthenticatedUser>,
    Query(params): Query<MatchesQuery>,
) -> ApiResult<Vec<PropertyMatch>> {
    let query = MatchQuery {
        broker_id: user.user_id,
        min_score: params
            .min_score
            .unwrap_or(ctx.config.marketplace.listing_min_score),
        unpurchased_only: !params.include_purchased.unwrap_or(false),
        limit: params.limit.map(|l| l.clamp(1, 100)),
    };
    Ok(Json(ctx.backend.list_property_matches(query).await?))
}

/// The price is always the configured quote; any price sent by the caller is ignored.
#[derive(Deserialize)]
pub struct PurchaseRequest {
    pub buyer_id: String,
    pub requirement_id: String,
}

pub async fn purchase_lead(
    Extension(ctx): Extension<MarketContext>,
    Extension(user): Extension<AuthenticatedUser>,
    Path(match_id): Path<String>,
    Json(req): Json<PurchaseRequest>,
) -> ApiResult<RpcOutcome> {
    let params = PurchaseLeadParams {
        match_id,
        buyer_id: req.buyer_id,
        requirement_id: req.requirement_id,
        lead_price: ctx.config.marketplace.lead_price,
    };
    let outcome = ctx.backend.purchase_lead(&user.user_id, params).await?;
    if outcome.success {
        tracing::info!("Broker {} purchased a lead", user.user_id);
    }
    Ok(Json(outcome))
}

#[derive(Deserialize)]
pub struct LeadsQuery {
    #[serde(default)]
    pub role: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
}

pub async fn list_leads(
    Extension(ctx): Extension<MarketContext>,
    Extension(user): Extension<AuthenticatedUser>,
    Query(params): Query<LeadsQuery>,
) -> ApiResult<Vec<LeadDetail>> {
    let role = match parse_param::<LeadRole>("role", params.role.as_deref())? {
        Some(role) => role,
        None => match ctx.backend.get_profile(&user.user_id).await?.user_type {
            UserType::Broker => LeadRole::Broker,
            UserType::Buyer => LeadRole::Buyer,
        },
    };
    let status = parse_param::<LeadStatus>("status", params.status.as_deref())?;
    Ok(Json(ctx.backend.list_leads(&user.user_id, role, status).await?))
}

pub async fn approve_lead(
    Extension(ctx): Extension<MarketContext>,
    Extension(user): Extension<AuthenticatedUser>,
    Path(lead_id): Path<String>,
) -> ApiResult<RpcOutcome> {
    Ok(Json(ctx.backend.approve_lead(&user.user_id, &lead_id).await?))
}

#[derive(Deserialize, Default)]
pub struct RejectRequest {
    #[serde(default)]
    pub reason: Option<String>,
}

pub async fn reject_lead(
    Extension(ctx): Extension<MarketContext>,
    Extension(user): Extension<AuthenticatedUser>,
    Path(lead_id): Path<String>,
    Json(req): Json<RejectRequest>,
) -> ApiResult<RpcOutcome> {
    Ok(Json(
        ctx.backend
            .reject_lead(&user.user_id, &lead_id, req.reason.as_deref())
            .await?,
    ))
}

pub async fn get_wallet_transactions(
    Extension(ctx): Extension<MarketContext>,
    Extension(user): Extension<AuthenticatedUser>,
) -> ApiResult<Vec<WalletTransaction>> {
    Ok(Json(ctx.backend.list_wallet_transactions(&user.user_id).await?))
}

pub async fn get_stats(
    Extension(ctx): Extension<MarketContext>,
    Extension(user): Extension<AuthenticatedUser>,
) -> ApiResult<BrokerStats> {
    Ok(Json(ctx.backend.get_broker_stats(&user.user_id).await?))
}

pub async fn get_chats(
    Extension(ctx): Extension<MarketContext>,
    Extension(user): Extension<AuthenticatedUser>,
) -> ApiResult<Vec<ChatSummary>> {
    Ok(Json(ctx.backend.get_user_chats(&user.user_id).await?))
}

pub async fn get_chat(
    Extension(ctx): Extension<MarketContext>,
    Extension(user): Extension<AuthenticatedUser>,
    Path(chat_id): Path<String>,
) -> ApiResult<ChatDetail> {
    Ok(Json(ctx.backend.get_chat_by_id(&user.user_id, &chat_id).await?))
}

pub async fn get_messages(
    Extension(ctx): Extension<MarketContext>,
    Extension(user): Extension<AuthenticatedUser>,
    Path(chat_id): Path<String>,
) -> ApiResult<Vec<Message>> {
    Ok(Json(ctx.backend.get_chat_messages(&user.user_id, &chat_id).await?))
}

#[derive(Deserialize)]
pub struct SendMessageRequest {
    pub content: String,
}

pub async fn send_message(
    Extension(ctx): Extension<MarketContext>,
    Extension(user): Extension<AuthenticatedUser>,
    Path(chat_id): Path<String>,
    Json(req): Json<SendMessageRequest>,
) -> ApiResult<Message> {
    Ok(Json(
        ctx.backend
            .send_message(&user.user_id, &chat_id, &req.content)
            .await?,
    ))
}

pub async fn get_requirements(
    Extension(ctx): Extension<MarketContext>,
    Extension(user): Extension<AuthenticatedUser>,
) -> ApiResult<Vec<Requirement>> {
    Ok(Json(ctx.backend.list_requirements(&user.user_id).await?))
}

pub async fn create_requirement(
    Extension(ctx): Extension<MarketContext>,
    Extension(user): Extension<AuthenticatedUser>,
    Json(input): Json<NewRequirement>,
) -> ApiResult<Requirement> {
    input.validate().into_result()?;
    Ok(Json(ctx.backend.create_requirement(&user.user_id, input).await?))
}

pub async fn update_requirement(
    Extension(ctx): Extension<MarketContext>,
    Extension(user): Extension<AuthenticatedUser>,
    Path(requirement_id): Path<String>,
    Json(input): Json<NewRequirement>,
) -> ApiResult<Requirement> {
    input.validate().into_result()?;
    Ok(Json(
        ctx.backend
            .update_requirement(&user.user_id, &requirement_id, input)
            .await?,
    ))
}

#[derive(Deserialize)]
pub struct RequirementStatusRequest {
    pub status: RequirementStatus,
}

pub async fn set_requirement_status(
    Extension(ctx): Extension<MarketContext>,
    Extension(user): Extension<AuthenticatedUser>,
    Path(requirement_id): Path<String>,
    Json(req): Json<RequirementStatusRequest>,
) -> ApiResult<Requirement> {
    Ok(Json(
        ctx.backend
            .set_requirement_status(&user.user_id, &requirement_id, req.status)
            .await?,
    ))
}

pub async fn search_properties(
    Extension(ctx): Extension<MarketContext>,
    Query(search): Query<PropertySearch>,
) -> ApiResult<Vec<Property>> {
    Ok(Json(ctx.backend.search_properties(search).await?))
}

pub async fn get_my_properties(
    Extension(ctx): Extension<MarketContext>,
    Extension(user): Extension<AuthenticatedUser>,
) -> ApiResult<Vec<Property>> {
    Ok(Json(ctx.backend.list_broker_properties(&user.user_id).await?))
}

pub async fn get_property_approvals(
    Extension(ctx): Extension<MarketContext>,
    Extension(user): Extension<AuthenticatedUser>,
) -> ApiResult<Vec<PropertyApproval>> {
    Ok(Json(ctx.backend.list_property_approvals(&user.user_id).await?))
}

pub async fn submit_property(
    Extension(ctx): Extension<MarketContext>,
    Extension(user): Extension<AuthenticatedUser>,
    Json(draft): Json<PropertyDraft>,
) -> ApiResult<PropertyApproval> {
    draft.validate().into_result()?;
    Ok(Json(ctx.backend.submit_property(&user.user_id, draft).await?))
}
