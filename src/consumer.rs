//! Reconnecting broker consumer
//!
//! A consumer runs on one background task. It dials, declares topology, sets a
//! prefetch of one and then waits on three sources at once: the delivery
//! stream, the connection close notice and the channel close notice. Each
//! delivery is handled to completion before the next wait, so at most one job
//! is in flight per consumer.
//!
//! When retry is enabled any failure (dial, declare, close notice, stream end)
//! leads to a pause of `retry_interval` and a full re-establishment. The
//! remaining-attempts counter only changes how loudly that is logged.
//!
//! With retry disabled, close notices are logged and drained. Once the
//! delivery stream itself ends the consumer parks until shutdown; it never
//! re-dials on its own.

use crate::broker::{
    declare_topology, Broker, BrokerChannel, CloseNotices, Delivery, DeliveryStream,
    ConnectionDescriptor, ScopedChannel,
};
use crate::{metrics, WorkerError};
use async_trait::async_trait;
use futures::StreamExt;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::task::{JoinError, JoinHandle};
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

/// Never prefetch more than one unacknowledged job.
pub const PREFETCH_COUNT: u16 = 1;

/// Receives each non-empty delivery body.
///
/// Returning `Ok` acknowledges the delivery. An error rejects it, requeueing
/// only when [`WorkerError::is_retryable`] holds.
#[async_trait]
pub trait MessageHandler: Send + Sync + 'static {
    async fn handle(&self, body: &[u8]) -> Result<(), WorkerError>;
}

/// Handle to a running consumer task.
pub struct ConsumerHandle {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<Result<(), WorkerError>>,
}

impl ConsumerHandle {
    /// Stop after the in-flight delivery (if any) has been handled.
    pub async fn shutdown(self) -> Result<(), WorkerError> {
        let _ = self.shutdown.send(true);
        self.wait().await
    }

    /// Park until the consumer task exits.
    pub async fn wait(self) -> Result<(), WorkerError> {
        // The sender must outlive the task, a dropped sender reads as shutdown.
        let ConsumerHandle { shutdown, task } = self;
        let outcome = task.await;
        drop(shutdown);
        join_outcome(outcome)
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

/// Start a consumer on a background task.
pub fn spawn_consumer<B, H>(
    broker: Arc<B>,
    descriptor: ConnectionDescriptor,
    handler: Arc<H>,
) -> ConsumerHandle
where
    B: Broker,
    H: MessageHandler + ?Sized,
{
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let task = tokio::spawn(async move {
        consume_with_retry(broker.as_ref(), &descriptor, handler.as_ref(), shutdown_rx).await
    });

    ConsumerHandle {
        shutdown: shutdown_tx,
        task,
    }
}

/// Start a consumer and park until it exits.
pub async fn run_consumer<B, H>(
    broker: Arc<B>,
    descriptor: ConnectionDescriptor,
    handler: Arc<H>,
) -> Result<(), WorkerError>
where
    B: Broker,
    H: MessageHandler + ?Sized,
{
    run_consumer_until(broker, descriptor, handler, std::future::pending()).await
}

/// Start a consumer and park until it exits or `stop` resolves. On `stop` the
/// in-flight delivery is finished before returning.
pub async fn run_consumer_until<B, H, F>(
    broker: Arc<B>,
    descriptor: ConnectionDescriptor,
    handler: Arc<H>,
    stop: F,
) -> Result<(), WorkerError>
where
    B: Broker,
    H: MessageHandler + ?Sized,
    F: Future<Output = ()>,
{
    info!(queue = %descriptor.queue, " [*] Waiting for messages. To exit press CTRL+C");
    let ConsumerHandle { shutdown, mut task } = spawn_consumer(broker, descriptor, handler);

    tokio::select! {
        outcome = &mut task => join_outcome(outcome),
        _ = stop => {
            let _ = shutdown.send(true);
            join_outcome(task.await)
        }
    }
}

fn join_outcome(outcome: Result<Result<(), WorkerError>, JoinError>) -> Result<(), WorkerError> {
    outcome.map_err(|e| WorkerError::ConsumerStopped(e.to_string()))?
}

enum SessionExit {
    Shutdown,
    Lost(WorkerError),
}

async fn consume_with_retry<B, H>(
    broker: &B,
    descriptor: &ConnectionDescriptor,
    handler: &H,
    mut shutdown: watch::Receiver<bool>,
) -> Result<(), WorkerError>
where
    B: Broker,
    H: MessageHandler + ?Sized,
{
    let mut attempts_remaining = descriptor.retry_times;

    loop {
        let exit = match open_session(broker, descriptor).await {
            Ok((channel, session)) => {
                let exit = drive_session(session, descriptor, handler, &mut shutdown).await;
                channel.release().await;
                exit
            }
            Err(e) => SessionExit::Lost(e),
        };

        let err = match exit {
            SessionExit::Shutdown => {
                info!(queue = %descriptor.queue, "Consumer shut down");
                return Ok(());
            }
            SessionExit::Lost(err) => err,
        };

        // Only reachable before a session exists: dial, declare or subscribe failed.
        if !descriptor.retry {
            error!(queue = %descriptor.queue, "Consumer setup failed and retry is disabled: {}", err);
            return Err(WorkerError::ConsumerStopped(err.to_string()));
        }

        metrics::record_reconnect();
        if attempts_remaining > 0 {
            info!(
                queue = %descriptor.queue,
                "Consumer lost ({}). Wait {:?} then re-connect, retry times: {}",
                err, descriptor.retry_interval, attempts_remaining
            );
            attempts_remaining -= 1;
        } else {
            warn!(
                queue = %descriptor.queue,
                "Consumer lost ({}), retry budget exhausted; re-connecting in {:?} anyway",
                err, descriptor.retry_interval
            );
        }

        tokio::select! {
            _ = sleep(descriptor.retry_interval) => {}
            _ = shutdown.changed() => {
                info!(queue = %descriptor.queue, "Consumer shut down while waiting to reconnect");
                return Ok(());
            }
        }
    }
}

struct Session {
    deliveries: DeliveryStream,
    notices: CloseNotices,
}

async fn open_session<B: Broker>(
    broker: &B,
    descriptor: &ConnectionDescriptor,
) -> Result<(ScopedChannel<B::Channel>, Session), WorkerError> {
    let channel = ScopedChannel::new(broker.connect(&descriptor.url).await?);
    let notices = channel.close_notices();

    declare_topology(&*channel, descriptor).await?;
    channel.set_prefetch(PREFETCH_COUNT).await?;

    let consumer_tag = format!("snapshot-worker-{}", uuid::Uuid::new_v4());
    let deliveries = channel.consume(&descriptor.queue, &consumer_tag).await?;

    info!(
        queue = %descriptor.queue,
        exchange = %descriptor.exchange,
        consumer_tag = %consumer_tag,
        "Consuming"
    );
    Ok((channel, Session { deliveries, notices }))
}

async fn drive_session<H: MessageHandler + ?Sized>(
    session: Session,
    descriptor: &ConnectionDescriptor,
    handler: &H,
    shutdown: &mut watch::Receiver<bool>,
) -> SessionExit {
    let Session {
        mut deliveries,
        notices,
    } = session;
    let mut connection_closed = Some(notices.connection);
    let mut channel_closed = Some(notices.channel);

    loop {
        tokio::select! {
            _ = shutdown.changed() => return SessionExit::Shutdown,
            reason = next_notice(&mut connection_closed) => {
                warn!(queue = %descriptor.queue, "Connection closed: {}", reason);
                if descriptor.retry {
                    return SessionExit::Lost(WorkerError::Connection(reason));
                }
            }
            reason = next_notice(&mut channel_closed) => {
                warn!(queue = %descriptor.queue, "Channel closed: {}", reason);
                if descriptor.retry {
                    return SessionExit::Lost(WorkerError::Channel(reason));
                }
            }
            delivery = deliveries.next() => {
                let err = match delivery {
                    Some(Ok(delivery)) => {
                        dispatch(delivery, handler).await;
                        continue;
                    }
                    Some(Err(e)) => e,
                    None => WorkerError::Channel("delivery stream ended".to_string()),
                };
                if descriptor.retry {
                    return SessionExit::Lost(err);
                }
                return park_until_shutdown(descriptor, err, shutdown).await;
            }
        }
    }
}

async fn park_until_shutdown(
    descriptor: &ConnectionDescriptor,
    err: WorkerError,
    shutdown: &mut watch::Receiver<bool>,
) -> SessionExit {
    error!(
        queue = %descriptor.queue,
        "Consumer lost and retry is disabled, no further deliveries until restart: {}", err
    );
    let _ = shutdown.changed().await;
    SessionExit::Shutdown
}

/// Resolves with the next close reason, or never once the sender is gone.
async fn next_notice(slot: &mut Option<mpsc::UnboundedReceiver<String>>) -> String {
    if let Some(rx) = slot.as_mut() {
        if let Some(reason) = rx.recv().await {
            return reason;
        }
    }
    *slot = None;
    std::future::pending().await
}

async fn dispatch<H: MessageHandler + ?Sized>(delivery: Delivery, handler: &H) {
    if delivery.body.is_empty() {
        debug!("Dropping delivery with empty body");
        metrics::record_delivery("dropped");
        return;
    }

    match handler.handle(&delivery.body).await {
        Ok(()) => {
            metrics::record_delivery("acked");
            if let Err(e) = delivery.ack().await {
                error!("Failed to acknowledge delivery: {}", e);
            }
        }
        Err(e) => {
            let requeue = e.is_retryable();
            warn!(requeue, "Handler failed, rejecting delivery: {}", e);
            metrics::record_delivery("rejected");
            if let Err(e) = delivery.reject(requeue).await {
                error!("Failed to reject delivery: {}", e);
            }
        }
    }
}
