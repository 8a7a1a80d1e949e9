use axum::extract::State;
use axum::http::header::CONTENT_TYPE;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use serde_json::json;
use std::sync::Arc;
use tracing::{debug, info, warn};

use pilotctl_crypto::{EnvelopeSigner, SignedEnvelope};
use pilotctl_events::EventPublisher;
use pilotctl_types::{AuthToken, Command, Event, PingEnvelope, PingRequest};

use crate::auth::{AuthenticatedPilot, TokenAuthenticator};
use crate::config::ServiceConfig;
use crate::error::ServiceError;
use crate::storage::{HostRecord, PilotStore};

/// Shared service state passed to all handlers.
pub struct ServiceContext {
    pub config: ServiceConfig,
    pub store: Arc<dyn PilotStore>,
    pub authenticator: TokenAuthenticator,
    pub signer: EnvelopeSigner,
    pub publisher: EventPublisher,
}

impl ServiceContext {
    pub fn new(
        config: ServiceConfig,
        store: Arc<dyn PilotStore>,
        publisher: EventPublisher,
    ) -> Self {
        let authenticator =
            TokenAuthenticator::new(store.clone()).with_ttl(config.token_ttl_secs);
        let signer = EnvelopeSigner::new(config.key_store());
        Self {
            config,
            store,
            authenticator,
            signer,
            publisher,
        }
    }
}

// --- POST /ping ---

/// Record the reported job result, then hand out the next job.
///
/// The response is always signed. An empty command (`job_id` 0) means there
/// is nothing to run.
pub async fn ping(
    State(state): State<Arc<ServiceContext>>,
    pilot: AuthenticatedPilot,
    Json(request): Json<PingRequest>,
) -> Result<Json<SignedEnvelope<PingEnvelope>>, ServiceError> {
    let host = &pilot.token.host_uuid;

    if let Some(result) = request.result {
        state
            .store
            .complete_job(host, result.job_id, &result.log_entry(), !result.success)
            .await?;
        info!(
            host = %host,
            job_id = result.job_id,
            success = result.success,
            "job completed"
        );
    }

    let command = match state.store.next_job(host).await? {
        Some(job) => {
            let command = state.store.command(&job.command_key).await?.ok_or_else(|| {
                ServiceError::Internal(format!(
                    "job {} refers to unknown command '{}'",
                    job.job_id, job.command_key
                ))
            })?;
            info!(
                host = %host,
                job_id = job.job_id,
                command = %job.command_key,
                version = job.command_version,
                "job assigned"
            );
            Command {
                job_id: job.job_id,
                ..command
            }
        }
        None => Command::default(),
    };

    let envelope = PingEnvelope {
        command,
        interval: state.config.ping_interval,
    };
    let signed = SignedEnvelope::seal(envelope, &state.signer)?;
    Ok(Json(signed))
}

// --- POST /events ---

pub async fn post_events(
    State(state): State<Arc<ServiceContext>>,
    pilot: AuthenticatedPilot,
    Json(mut events): Json<Vec<Event>>,
) -> impl IntoResponse {
    for event in &mut events {
        stamp(event, &pilot.token);
    }
    match state.store.host(&pilot.token.host_uuid).await {
        Ok(Some(record)) => {
            for event in &mut events {
                place(event, &record);
            }
        }
        Ok(None) => debug!(host = %pilot.principal, "host not registered, events not placed"),
        Err(e) => warn!(
            host = %pilot.principal,
            error = %e,
            "cannot look up host, events not placed"
        ),
    }
    debug!(host = %pilot.principal, events = events.len(), "events received");

    if !events.is_empty() {
        // Deliveries run detached; their outcome is only logged.
        drop(state.publisher.publish(&events));
    }

    (
        StatusCode::ACCEPTED,
        Json(json!({ "accepted": events.len() })),
    )
}

/// Fill host fields the pilot left blank from its token.
fn stamp(event: &mut Event, token: &AuthToken) {
    if event.host_uuid.is_empty() {
        event.host_uuid = token.host_uuid.clone();
    } else if event.host_uuid != token.host_uuid {
        warn!(
            host = %token.host_uuid,
            claimed = %event.host_uuid,
            "event claims a different host"
        );
    }
    if event.hostname.is_empty() {
        event.hostname = token.hostname.clone();
    }
    if event.host_address.is_empty() {
        event.host_address = token.host_ip.clone();
    }
}

/// Copy the host's organisational placement onto an event.
fn place(event: &mut Event, record: &HostRecord) {
    event.organisation = record.organisation.clone();
    event.organisation_group = record.organisation_group.clone();
    event.area = record.area.clone();
    event.location = record.location.clone();
    event.host_label = record.labels.clone();
}

// --- GET /pub ---

/// The armored verification key, for pilots to pin.
pub async fn get_verification_key(
    State(state): State<Arc<ServiceContext>>,
) -> Result<impl IntoResponse, ServiceError> {
    let armored = state.signer.keys().verification_key_armored()?;
    Ok(([(CONTENT_TYPE, "application/x-pem-file")], armored))
}

// --- GET /health ---

pub async fn health() -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "service": "pilotctl",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}
