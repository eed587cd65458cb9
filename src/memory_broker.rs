//! In-process broker used by the tests.
//!
//! Queues are plain `VecDeque`s. Every channel gets its own close-notice
//! senders so a test can sever all live connections and watch the consumer
//! recover. All state sits behind one std mutex that is never held across an
//! await.

use crate::broker::{
    Acknowledger, Broker, BrokerChannel, CloseNotices, Delivery, DeliveryStream, ExchangeKind,
};
use crate::WorkerError;
use async_trait::async_trait;
use futures::StreamExt;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::mpsc;

#[derive(Debug, Clone, PartialEq)]
pub struct Published {
    pub exchange: String,
    pub routing_key: String,
    pub payload: Vec<u8>,
}

#[derive(Default)]
struct State {
    next_channel_id: usize,
    pending: HashMap<String, VecDeque<Vec<u8>>>,
    live: Vec<LiveChannel>,
    dial_failures: usize,
    publish_failures: usize,
    publish_delay: Option<Duration>,
    connects: usize,
    closes: usize,
    declared_queues: Vec<String>,
    declared_exchanges: Vec<(String, ExchangeKind)>,
    bindings: Vec<(String, String, String)>,
    prefetch: Vec<u16>,
    acked: Vec<Vec<u8>>,
    rejected: Vec<(Vec<u8>, bool)>,
    published: Vec<Published>,
}

struct LiveChannel {
    id: usize,
    connection_tx: mpsc::UnboundedSender<String>,
    channel_tx: mpsc::UnboundedSender<String>,
    subscription: Option<(String, mpsc::UnboundedSender<Result<Delivery, WorkerError>>)>,
}

#[derive(Clone, Default)]
pub struct MemoryBroker {
    state: Arc<Mutex<State>>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        lock(&self.state)
    }

    /// Enqueue a message as if a producer had published it to `queue`.
    pub fn push(&self, queue: &str, body: impl Into<Vec<u8>>) {
        deliver(&self.state, queue, body.into());
    }

    /// The next `count` dials fail with a connection error.
    pub fn fail_next_dials(&self, count: usize) {
        self.lock().dial_failures = count;
    }

    /// The next `count` publishes fail with a publish error.
    pub fn fail_next_publishes(&self, count: usize) {
        self.lock().publish_failures = count;
    }

    pub fn set_publish_delay(&self, delay: Duration) {
        self.lock().publish_delay = Some(delay);
    }

    /// Sever every live connection: close notices fire and subscriptions end.
    pub fn drop_connections(&self, reason: &str) {
        let live = std::mem::take(&mut self.lock().live);
        for channel in live {
            let _ = channel.connection_tx.send(reason.to_string());
            drop(channel.subscription);
        }
    }

    /// Fire only the channel close notice on every live channel.
    pub fn close_channels(&self, reason: &str) {
        for channel in &self.lock().live {
            let _ = channel.channel_tx.send(reason.to_string());
        }
    }

    pub fn connects(&self) -> usize {
        self.lock().connects
    }

    pub fn closes(&self) -> usize {
        self.lock().closes
    }

    pub fn live_channels(&self) -> usize {
        self.lock().live.len()
    }

    pub fn consumers(&self, queue: &str) -> usize {
        self.lock()
            .live
            .iter()
            .filter(|c| matches!(&c.subscription, Some((q, _)) if q == queue))
            .count()
    }

    pub fn pending(&self, queue: &str) -> usize {
        self.lock().pending.get(queue).map_or(0, VecDeque::len)
    }

    pub fn declared_queues(&self) -> Vec<String> {
        self.lock().declared_queues.clone()
    }

    pub fn declared_exchanges(&self) -> Vec<(String, ExchangeKind)> {
        self.lock().declared_exchanges.clone()
    }

    pub fn bindings(&self) -> Vec<(String, String, String)> {
        self.lock().bindings.clone()
    }

    pub fn prefetch(&self) -> Vec<u16> {
        self.lock().prefetch.clone()
    }

    pub fn acked(&self) -> Vec<Vec<u8>> {
        self.lock().acked.clone()
    }

    pub fn rejected(&self) -> Vec<(Vec<u8>, bool)> {
        self.lock().rejected.clone()
    }

    pub fn published(&self) -> Vec<Published> {
        self.lock().published.clone()
    }
}

fn lock(state: &Mutex<State>) -> MutexGuard<'_, State> {
    state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn deliver(state: &Arc<Mutex<State>>, queue: &str, body: Vec<u8>) {
    let mut guard = lock(state);
    let subscriber = guard.live.iter().find_map(|c| match &c.subscription {
        Some((q, tx)) if q == queue && !tx.is_closed() => Some(tx.clone()),
        _ => None,
    });

    match subscriber {
        Some(tx) => {
            let acker = MemoryAcker {
                state: state.clone(),
                queue: queue.to_string(),
                body: body.clone(),
            };
            let _ = tx.send(Ok(Delivery::new(body, Box::new(acker))));
        }
        None => guard
            .pending
            .entry(queue.to_string())
            .or_default()
            .push_back(body),
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    type Channel = MemoryChannel;

    async fn connect(&self, _url: &str) -> Result<MemoryChannel, WorkerError> {
        let mut state = self.lock();
        if state.dial_failures > 0 {
            state.dial_failures -= 1;
            return Err(WorkerError::Connection("connection refused".to_string()));
        }

        state.connects += 1;
        state.next_channel_id += 1;
        let id = state.next_channel_id;

        let (connection_tx, connection_rx) = mpsc::unbounded_channel();
        let (channel_tx, channel_rx) = mpsc::unbounded_channel();
        state.live.push(LiveChannel {
            id,
            connection_tx,
            channel_tx,
            subscription: None,
        });

        Ok(MemoryChannel {
            id,
            state: self.state.clone(),
            notices: Mutex::new(Some(CloseNotices {
                connection: connection_rx,
                channel: channel_rx,
            })),
        })
    }
}

pub struct MemoryChannel {
    id: usize,
    state: Arc<Mutex<State>>,
    notices: Mutex<Option<CloseNotices>>,
}

impl MemoryChannel {
    fn ensure_open(&self) -> Result<(), WorkerError> {
        if lock(&self.state).live.iter().any(|c| c.id == self.id) {
            Ok(())
        } else {
            Err(WorkerError::Channel("channel is closed".to_string()))
        }
    }
}

#[async_trait]
impl BrokerChannel for MemoryChannel {
    async fn declare_queue(&self, queue: &str) -> Result<(), WorkerError> {
        self.ensure_open()?;
        lock(&self.state).declared_queues.push(queue.to_string());
        Ok(())
    }

    async fn declare_exchange(&self, exchange: &str, kind: ExchangeKind) -> Result<(), WorkerError> {
        self.ensure_open()?;
        lock(&self.state)
            .declared_exchanges
            .push((exchange.to_string(), kind));
        Ok(())
    }

    async fn bind_queue(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<(), WorkerError> {
        self.ensure_open()?;
        lock(&self.state).bindings.push((
            queue.to_string(),
            exchange.to_string(),
            routing_key.to_string(),
        ));
        Ok(())
    }

    async fn set_prefetch(&self, count: u16) -> Result<(), WorkerError> {
        self.ensure_open()?;
        lock(&self.state).prefetch.push(count);
        Ok(())
    }

    async fn consume(&self, queue: &str, _consumer_tag: &str) -> Result<DeliveryStream, WorkerError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let backlog = {
            let mut state = lock(&self.state);
            let channel = state
                .live
                .iter_mut()
                .find(|c| c.id == self.id)
                .ok_or_else(|| WorkerError::Channel("channel is closed".to_string()))?;
            channel.subscription = Some((queue.to_string(), tx));
            state.pending.remove(queue).unwrap_or_default()
        };

        for body in backlog {
            deliver(&self.state, queue, body);
        }

        Ok(futures::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|delivery| (delivery, rx))
        })
        .boxed())
    }

    fn close_notices(&self) -> CloseNotices {
        let taken = lock_notices(&self.notices).take();
        taken.unwrap_or_else(|| {
            let (_, connection) = mpsc::unbounded_channel();
            let (_, channel) = mpsc::unbounded_channel();
            CloseNotices { connection, channel }
        })
    }

    async fn publish(&self, exchange: &str, routing_key: &str, payload: &[u8]) -> Result<(), WorkerError> {
        self.ensure_open()?;
        let delay = lock(&self.state).publish_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut state = lock(&self.state);
        if state.publish_failures > 0 {
            state.publish_failures -= 1;
            return Err(WorkerError::Publish("broker refused message".to_string()));
        }
        state.published.push(Published {
            exchange: exchange.to_string(),
            routing_key: routing_key.to_string(),
            payload: payload.to_vec(),
        });
        Ok(())
    }

    async fn close(&self) -> Result<(), WorkerError> {
        let mut state = lock(&self.state);
        state.closes += 1;
        state.live.retain(|c| c.id != self.id);
        Ok(())
    }
}

fn lock_notices(notices: &Mutex<Option<CloseNotices>>) -> MutexGuard<'_, Option<CloseNotices>> {
    notices.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

struct MemoryAcker {
    state: Arc<Mutex<State>>,
    queue: String,
    body: Vec<u8>,
}

#[async_trait]
impl Acknowledger for MemoryAcker {
    async fn ack(&self) -> Result<(), WorkerError> {
        lock(&self.state).acked.push(self.body.clone());
        Ok(())
    }

    async fn reject(&self, requeue: bool) -> Result<(), WorkerError> {
        lock(&self.state).rejected.push((self.body.clone(), requeue));
        if requeue {
            deliver(&self.state, &self.queue, self.body.clone());
        }
        Ok(())
    }
}
