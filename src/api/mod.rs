//! HTTP API consumed by the admin GUI.
//!
//! The API validates declarations synchronously and writes `Motis` objects;
//! everything else happens in the controller. Status is read back from the
//! objects and their owned sub-objects.

pub mod error;
pub mod instances;

use std::sync::Arc;

use axum::{Router, routing::get};
use tracing::info;

use crate::controller::context::Context;

pub use error::{ApiError, ErrorBody};
pub use instances::{Accepted, InstanceList, InstanceRequest};

/// Default port of the instance API
pub const DEFAULT_API_PORT: u16 = 8080;

/// Shared state of the API handlers
#[derive(Clone)]
pub struct ApiState {
    pub ctx: Arc<Context>,
    /// Namespace new instances are created in
    pub namespace: String,
}

impl ApiState {
    pub fn new(ctx: Arc<Context>, namespace: impl Into<String>) -> Self {
        Self {
            ctx,
            namespace: namespace.into(),
        }
    }
}

/// Create the API router
pub fn create_router(state: ApiState) -> Router {
    Router::new()
        .route(
            "/instances",
            get(instances::list_instances).post(instances::create_instance),
        )
        .route(
            "/instances/{name}",
            get(instances::get_instance)
                .put(instances::replace_instance)
                .delete(instances::delete_instance),
        )
        .with_state(state)
}

/// Run the API server on 0.0.0.0:`port`
pub async fn run_api_server(state: ApiState, port: u16) -> Result<(), std::io::Error> {
    let app = create_router(state);

    let addr = std::net::SocketAddr::from(([0, 0, 0, 0], port));
    info!(port = port, "Starting instance API server");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
