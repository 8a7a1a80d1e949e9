use axum::routing::{get, post};
use axum::Router;
use std::sync::Arc;
use tracing::{error, info, warn};

use pilotctl_events::{load_receivers, locate_receivers_file, EventPublisher};
use pilotctl_types::EventReceiver;

use crate::config::ServiceConfig;
use crate::routes::{self, ServiceContext};
use crate::storage::SqliteStore;

/// Build and run the service.
pub async fn run(config: ServiceConfig) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let store = SqliteStore::open(&config.db_path).await?;
    let receivers = event_receivers(&config);
    let publisher = EventPublisher::new(receivers, config.publisher.clone())?;

    let keys = config.key_store();
    match keys.signing_key() {
        Ok(_) => info!("signing key loaded"),
        Err(e) => warn!(error = %e, "signing key unavailable, pings will fail until it is installed"),
    }

    let bind_addr = config.bind_addr;
    let state = Arc::new(ServiceContext::new(config, Arc::new(store), publisher));
    let app = router(state);

    let listener = tokio::net::TcpListener::bind(bind_addr).await?;
    info!("pilotctl listening on {}", bind_addr);
    axum::serve(listener, app).await?;
    Ok(())
}

/// Build the router (exported for testing).
pub fn router(state: Arc<ServiceContext>) -> Router {
    Router::new()
        .route("/health", get(routes::health))
        .route("/ping", post(routes::ping))
        .route("/events", post(routes::post_events))
        .route("/pub", get(routes::get_verification_key))
        .with_state(state)
}

/// Receivers from the configured file, or from the first file found.
///
/// A file that cannot be read or parsed disables publishing rather than
/// stopping the service.
pub fn event_receivers(config: &ServiceConfig) -> Vec<EventReceiver> {
    let Some(path) = config
        .receivers_file
        .clone()
        .or_else(locate_receivers_file)
    else {
        info!("no event receiver configuration found, events will not be published");
        return Vec::new();
    };

    match load_receivers(&path) {
        Ok(receivers) => {
            for receiver in &receivers {
                info!(receiver = %receiver, "event receiver configured");
            }
            receivers
        }
        Err(e) => {
            error!(error = %e, "cannot load event receivers, events will not be published");
            Vec::new()
        }
    }
}
