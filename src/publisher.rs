//! Single-shot, timeout-bounded publisher
//!
//! Every call dials its own connection, declares topology exactly as the
//! consumer does, publishes one message and tears the connection down again.
//! There is no retry here; callers that need one re-invoke [`publish`].

use crate::broker::{declare_topology, Broker, BrokerChannel, ConnectionDescriptor, ScopedChannel};
use crate::{metrics, WorkerError};
use tokio::time::timeout;
use tracing::{debug, warn};

pub async fn publish<B: Broker>(
    broker: &B,
    descriptor: &ConnectionDescriptor,
    payload: &[u8],
) -> Result<(), WorkerError> {
    let channel = ScopedChannel::new(broker.connect(&descriptor.url).await?);
    let outcome = publish_on(&*channel, descriptor, payload).await;
    channel.release().await;

    match &outcome {
        Ok(()) => debug!(queue = %descriptor.queue, bytes = payload.len(), "Publish finished"),
        Err(e) => {
            metrics::record_publish_failure();
            warn!(queue = %descriptor.queue, "Publish failed: {}", e);
        }
    }
    outcome
}

async fn publish_on<C: BrokerChannel>(
    channel: &C,
    descriptor: &ConnectionDescriptor,
    payload: &[u8],
) -> Result<(), WorkerError> {
    declare_topology(channel, descriptor).await?;

    let deadline = descriptor.publish_timeout();
    match timeout(
        deadline,
        channel.publish(&descriptor.exchange, descriptor.routing_key(), payload),
    )
    .await
    {
        Ok(result) => result,
        Err(_) => Err(WorkerError::PublishTimeout(deadline)),
    }
}
