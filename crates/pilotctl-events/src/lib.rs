pub mod publisher;
pub mod receivers;
pub mod retry;

pub use publisher::{classify, DeliveryError, EventPublisher, PublisherConfig};
pub use receivers::{load_receivers, locate_receivers_file, ReceiverConfigError};
pub use retry::{Attempt, RetryPolicy, RetryState};
