//! Instance endpoints.
//!
//! - `POST /instances` - Declare a new instance
//! - `GET /instances` - List instances with their status
//! - `GET /instances/{name}` - Status of one instance
//! - `PUT /instances/{name}` - Replace the declaration of an instance
//! - `DELETE /instances/{name}` - Delete an instance and its owned objects

use std::future::Future;

use axum::{
    Json,
    extract::{Path, State, rejection::JsonRejection},
    http::StatusCode,
};
use futures::future::join_all;
use kube::ResourceExt;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::api::ApiState;
use crate::api::error::{ApiError, Result};
use crate::client::ClientError;
use crate::controller::status::{InstanceSummary, summarize_instance};
use crate::controller::validation::InstanceSpec;
use crate::crd::{ImageSpec, Motis, MotisSpec, Phase};
use crate::resources::common::RETRY_ANNOTATION;

/// Declaration submitted by the GUI.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceRequest {
    /// Required on create; on replace it must match the path if present.
    #[serde(default)]
    pub name: Option<String>,
    pub schedule_url: String,
    pub osm_url: String,
    #[serde(default)]
    pub refresh_schedule: Option<String>,
    pub config: String,
    #[serde(default)]
    pub image: Option<ImageSpec>,
}

impl InstanceRequest {
    /// Validate against `name` and build the normalized resource spec.
    fn into_spec(self, name: &str, namespace: &str) -> Result<MotisSpec> {
        let spec = MotisSpec {
            schedule_url: self.schedule_url,
            osm_url: self.osm_url,
            refresh_schedule: self.refresh_schedule,
            config: self.config,
            image: self.image.unwrap_or_default(),
        };
        let validated = InstanceSpec::validate(name, namespace, &spec)?;
        Ok(MotisSpec {
            schedule_url: validated.schedule_url,
            osm_url: validated.osm_url,
            refresh_schedule: validated.refresh_schedule,
            config: validated.config_text,
            image: validated.image,
        })
    }
}

/// Acknowledgement of an accepted request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Accepted {
    pub message: String,
}

/// Response of `GET /instances`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceList {
    pub instances: Vec<InstanceSummary>,
}

async fn bounded<T, F>(state: &ApiState, fut: F) -> Result<T>
where
    F: Future<Output = std::result::Result<T, ClientError>>,
{
    Ok(tokio::time::timeout(state.ctx.settings.call_timeout, fut).await??)
}

fn not_found(name: &str) -> ApiError {
    ApiError::NotFound(format!("instance '{name}' not found"))
}

fn accepted(message: String) -> (StatusCode, Json<Accepted>) {
    (StatusCode::ACCEPTED, Json(Accepted { message }))
}

/// POST /instances
pub async fn create_instance(
    State(state): State<ApiState>,
    body: std::result::Result<Json<InstanceRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<Accepted>)> {
    let Json(request) = body?;
    let name = request.name.clone().unwrap_or_default();
    let spec = request.into_spec(&name, &state.namespace)?;

    let mut instance = Motis::new(&name, spec);
    instance.metadata.namespace = Some(state.namespace.clone());
    match bounded(&state, state.ctx.clients.instances.create(&instance)).await {
        Ok(_) => {}
        Err(ApiError::Conflict(_)) => {
            return Err(ApiError::Conflict(format!("instance '{name}' already exists")));
        }
        Err(e) => return Err(e),
    }

    info!(name = %name, "Instance declared");
    Ok(accepted(format!("instance '{name}' accepted")))
}

/// GET /instances
pub async fn list_instances(State(state): State<ApiState>) -> Result<Json<InstanceList>> {
    let instances = bounded(&state, state.ctx.clients.instances.list(None)).await?;
    let mut summaries = join_all(
        instances
            .iter()
            .map(|instance| summarize_instance(&state.ctx.clients, instance)),
    )
    .await;
    summaries.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(Json(InstanceList {
        instances: summaries,
    }))
}

/// GET /instances/{name}
pub async fn get_instance(
    Path(name): Path<String>,
    State(state): State<ApiState>,
) -> Result<Json<InstanceSummary>> {
    let instance = bounded(&state, state.ctx.clients.instances.get_opt(&name))
        .await?
        .ok_or_else(|| not_found(&name))?;
    Ok(Json(summarize_instance(&state.ctx.clients, &instance).await))
}

/// PUT /instances/{name}
///
/// Full replace of the declaration. The write carries the resourceVersion
/// that was read, so a concurrent replace yields 409.
pub async fn replace_instance(
    Path(name): Path<String>,
    State(state): State<ApiState>,
    body: std::result::Result<Json<InstanceRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<Accepted>)> {
    let Json(request) = body?;
    if let Some(body_name) = &request.name {
        if *body_name != name {
            return Err(ApiError::BadRequest {
                message: format!("name '{body_name}' does not match '{name}'"),
                reason: "InvalidName",
            });
        }
    }
    let spec = request.into_spec(&name, &state.namespace)?;

    let mut instance = bounded(&state, state.ctx.clients.instances.get_opt(&name))
        .await?
        .ok_or_else(|| not_found(&name))?;
    let failed = instance.status.as_ref().is_some_and(|s| s.phase == Phase::Failed);
    let outcome = if instance.spec != spec {
        instance.spec = spec;
        "updated"
    } else if failed {
        // Resubmitting a Failed instance asks for another attempt.
        instance.annotations_mut().insert(
            RETRY_ANNOTATION.to_string(),
            state.ctx.clock.now().to_string(),
        );
        "retry requested"
    } else {
        return Ok(accepted(format!("instance '{name}' unchanged")));
    };
    match bounded(&state, state.ctx.clients.instances.update(&instance)).await {
        Ok(_) => {}
        Err(ApiError::NotFound(_)) => return Err(not_found(&name)),
        Err(e) => return Err(e),
    }

    info!(name = %name, outcome = outcome, "Instance declaration replaced");
    Ok(accepted(format!("instance '{name}' {outcome}")))
}

/// DELETE /instances/{name}
pub async fn delete_instance(
    Path(name): Path<String>,
    State(state): State<ApiState>,
) -> Result<(StatusCode, Json<Accepted>)> {
    match bounded(&state, state.ctx.clients.instances.delete(&name)).await {
        Ok(()) => {}
        Err(ApiError::NotFound(_)) => return Err(not_found(&name)),
        Err(e) => return Err(e),
    }
    // Abort in-flight passes; the next pass performs the cascade deletion.
    state.ctx.cancel(&name).await;

    info!(name = %name, "Instance deletion requested");
    Ok(accepted(format!("instance '{name}' deletion accepted")))
}
