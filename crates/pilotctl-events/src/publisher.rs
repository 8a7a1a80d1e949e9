use std::sync::Arc;
use std::time::Duration;

use pilotctl_types::{Event, EventReceiver};
use reqwest::header::CONTENT_TYPE;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::retry::{Attempt, RetryPolicy};

/// Per-request timeout for receiver calls.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, thiserror::Error)]
pub enum DeliveryError {
    /// No response was received; worth another attempt.
    #[error("transient delivery failure: {0}")]
    Transient(String),
    /// The receiver answered and refused, or the request could not be built.
    #[error("terminal delivery failure: {0}")]
    Terminal(String),
}

/// Map a delivery result onto the retry loop's outcome.
pub fn classify<T>(result: Result<T, DeliveryError>) -> Attempt<T, DeliveryError> {
    match result {
        Ok(value) => Attempt::Success(value),
        Err(e @ DeliveryError::Transient(_)) => Attempt::Retry(e),
        Err(e @ DeliveryError::Terminal(_)) => Attempt::Stop(e),
    }
}

#[derive(Clone, Debug)]
pub struct PublisherConfig {
    pub policy: RetryPolicy,
    /// Upper bound on concurrent deliveries. Defaults to the receiver count.
    pub concurrency: Option<usize>,
    pub timeout: Duration,
}

impl Default for PublisherConfig {
    fn default() -> Self {
        Self {
            policy: RetryPolicy::default(),
            concurrency: None,
            timeout: REQUEST_TIMEOUT,
        }
    }
}

/// Fans event batches out to every configured receiver.
///
/// Each receiver gets its own background task and its own retry loop, so a
/// slow or failing receiver never holds up another one or the caller.
/// The concurrency bound applies to requests in flight; a delivery backing
/// off between attempts holds no permit. Batches whose retries run out are
/// dropped.
#[derive(Clone)]
pub struct EventPublisher {
    receivers: Arc<[EventReceiver]>,
    policy: RetryPolicy,
    permits: Arc<Semaphore>,
    http: reqwest::Client,
}

impl EventPublisher {
    pub fn new(
        receivers: Vec<EventReceiver>,
        config: PublisherConfig,
    ) -> Result<Self, DeliveryError> {
        // Receivers commonly sit behind self-signed certificates.
        let http = reqwest::Client::builder()
            .danger_accept_invalid_certs(true)
            .timeout(config.timeout)
            .build()
            .map_err(|e| DeliveryError::Terminal(format!("failed to create http client: {e}")))?;
        let concurrency = config
            .concurrency
            .unwrap_or(receivers.len())
            .max(1);

        info!(
            receivers = receivers.len(),
            concurrency, "event publisher ready"
        );
        Ok(Self {
            receivers: receivers.into(),
            policy: config.policy,
            permits: Arc::new(Semaphore::new(concurrency)),
            http,
        })
    }

    pub fn receivers(&self) -> &[EventReceiver] {
        &self.receivers
    }

    /// Schedule delivery of `events` to every receiver and return at once.
    ///
    /// The returned handles may be awaited to observe completion; dropping
    /// them leaves the deliveries running.
    pub fn publish(&self, events: &[Event]) -> Vec<JoinHandle<()>> {
        if self.receivers.is_empty() {
            warn!(
                events = events.len(),
                "no event receivers configured, events will be discarded"
            );
            return Vec::new();
        }

        let body: Arc<[u8]> = match serde_json::to_vec(events) {
            Ok(body) => body.into(),
            Err(e) => {
                error!(error = %e, "cannot serialize events, events will be discarded");
                return Vec::new();
            }
        };

        self.receivers
            .iter()
            .cloned()
            .map(|receiver| {
                let delivery = Delivery {
                    http: self.http.clone(),
                    permits: self.permits.clone(),
                    receiver: Arc::new(receiver),
                    body: body.clone(),
                };
                let policy = self.policy;
                tokio::spawn(async move {
                    let uri = delivery.receiver.uri.clone();
                    match policy
                        .execute(delivery, |d| async move { classify(d.send().await) })
                        .await
                    {
                        Ok(()) => debug!(receiver = %uri, "events delivered"),
                        Err(e) => error!(
                            receiver = %uri,
                            error = %e,
                            "event delivery failed, events will be discarded"
                        ),
                    }
                })
            })
            .collect()
    }
}

/// One batch bound for one receiver.
#[derive(Clone)]
struct Delivery {
    http: reqwest::Client,
    permits: Arc<Semaphore>,
    receiver: Arc<EventReceiver>,
    body: Arc<[u8]>,
}

impl Delivery {
    /// One attempt. The permit is released before the retry loop sleeps.
    async fn send(&self) -> Result<(), DeliveryError> {
        let uri = &self.receiver.uri;
        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|_| DeliveryError::Terminal("event publisher has shut down".into()))?;
        let mut request = self
            .http
            .post(uri)
            .header(CONTENT_TYPE, "application/json")
            .body(self.body.to_vec());
        if let Some((user, pwd)) = self.receiver.credentials() {
            request = request.basic_auth(user, Some(pwd));
        }

        let response = request.send().await.map_err(|e| {
            let msg = format!("failed to post events to receiver '{uri}': {e}");
            if e.is_builder() {
                DeliveryError::Terminal(msg)
            } else {
                DeliveryError::Transient(msg)
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            return Err(DeliveryError::Terminal(format!(
                "failed to post events to receiver '{uri}': {status}"
            )));
        }
        Ok(())
    }
}
