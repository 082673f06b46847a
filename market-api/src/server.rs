use anyhow::Result;
use axum::{
    extract::Extension,
    middleware,
    routing::{get, post, put},
    Router,
};
use market_core::MarketContext;
use std::env;
use std::net::SocketAddr;
use tower::ServiceBuilder;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::auth;
use crate::handlers;
use crate::websocket;

fn cors_layer() -> CorsLayer {
    match env::var("CORS_ORIGINS") {
        Ok(origins) => {
            let mut cors = CorsLayer::new();
            for origin in origins.split(',').map(str::trim) {
                if let Ok(parsed) = origin.parse::<axum::http::HeaderValue>() {
                    cors = cors.allow_origin(parsed);
                }
            }
            cors.allow_methods(Any).allow_headers(Any)
        }
        Err(_) => {
            tracing::warn!("CORS_ORIGINS not set, using permissive CORS");
            CorsLayer::permissive()
        }
    }
}

pub fn router(ctx: MarketContext) -> Router {
    Router::new()
        .route("/health", get(handlers::health))
        .route("/ws", get(websocket::websocket_handler))
        .route("/api/v1/auth/account-type", get(handlers::account_type))
        .route("/api/v1/profile", get(handlers::get_profile))
        .route("/api/v1/profiles/:id/public", get(handlers::get_public_profile))
        .route("/api/v1/stats", get(handlers::get_stats))
        .route("/api/v1/matches", get(handlers::get_matches))
        .route("/api/v1/matches/:id/purchase", post(handlers::purchase_lead))
        .route("/api/v1/leads", get(handlers::list_leads))
        .route("/api/v1/leads/:id/approve", post(handlers::approve_lead))
        .route("/api/v1/leads/:id/reject", post(handlers::reject_lead))
        .route("/api/v1/wallet/transactions", get(handlers::get_wallet_transactions))
        .route("/api/v1/chats", get(handlers::get_chats))
        .route("/api/v1/chats/:id", get(handlers::get_chat))
        .route(
            "/api/v1/chats/:id/messages",
            get(handlers::get_messages).post(handlers::send_message),
        )
        .route(
            "/api/v1/requirements",
            get(handlers::get_requirements).post(handlers::create_requirement),
        )
        .route("/api/v1/requirements/:id", put(handlers::update_requirement))
        .route("/api/v1/requirements/:id/status", post(handlers::set_requirement_status))
        .route("/api/v1/properties", get(handlers::search_properties))
        .route("/api/v1/properties/mine", get(handlers::get_my_properties))
        .route(
            "/api/v1/property-approvals",
            get(handlers::get_property_approvals).post(handlers::submit_property),
        )
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(cors_layer())
                .layer(Extension(ctx))
                .layer(middleware::from_fn(auth::auth_middleware)),
        )
}

pub async fn run(ctx: MarketContext) -> Result<()> {
    let addr: SocketAddr = format!("{}:{}", ctx.config.server.host, ctx.config.server.api_port).parse()?;
    let app = router(ctx);

    tracing::info!("Starting API server on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
