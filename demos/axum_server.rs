//! Axum server with idempotent order creation.
//! Run with: cargo run --example axum_server --features axum-integration

use axum::{extract::Json, http::StatusCode, response::IntoResponse, routing::post, Router};
use idempotency_coordinator::{
    axum_integration::idempotency_middleware, IdempotencyConfig, IdempotencyMiddleware,
    SqliteIdempotencyStore,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

#[derive(Debug, Serialize, Deserialize)]
struct CreateOrderRequest {
    symbol: String,
    quantity: u32,
    price: f64,
}

#[derive(Debug, Serialize, Deserialize)]
struct CreateOrderResponse {
    order_id: String,
    status: String,
    total: f64,
}

async fn create_order(Json(req): Json<CreateOrderRequest>) -> impl IntoResponse {
    // Simulate order processing
    tokio::time::sleep(tokio::time::Duration::from_millis(100)).await;

    let response = CreateOrderResponse {
        order_id: Uuid::new_v4().to_string(),
        status: "pending".to_string(),
        total: req.quantity as f64 * req.price,
    };

    (StatusCode::CREATED, Json(response))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,idempotency_coordinator=debug")),
        )
        .init();

    let config = IdempotencyConfig::from_env()?;
    let store = SqliteIdempotencyStore::new("sqlite:idempotency.db").await?;
    let middleware = Arc::new(IdempotencyMiddleware::with_config(store, config)?);

    let app = Router::new()
        .route("/orders", post(create_order))
        .layer(axum::middleware::from_fn_with_state(
            middleware,
            idempotency_middleware::<SqliteIdempotencyStore>,
        ))
        .layer(TraceLayer::new_for_http());

    let listener = tokio::net::TcpListener::bind("127.0.0.1:3000").await?;

    tracing::info!("Server running on http://127.0.0.1:3000");
    println!("Try: curl -i -X POST http://127.0.0.1:3000/orders \\");
    println!("  -H 'Content-Type: application/json' \\");
    println!("  -H \"Idempotency-Key: $(uuidgen)\" \\");
    println!("  -d '{{\"symbol\":\"AAPL\",\"quantity\":100,\"price\":150.0}}'");

    axum::serve(listener, app).await?;
    Ok(())
}
