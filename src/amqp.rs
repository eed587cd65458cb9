//! lapin-backed AMQP 0-9-1 transport

use crate::broker::{
    Acknowledger, Broker, BrokerChannel, CloseNotices, Delivery, DeliveryStream, ExchangeKind,
};
use crate::WorkerError;
use async_trait::async_trait;
use futures::StreamExt;
use lapin::{
    acker::Acker,
    options::*,
    publisher_confirm::Confirmation,
    types::FieldTable,
    BasicProperties, Channel, Connection, ConnectionProperties,
};
use tokio::sync::mpsc;
use tracing::{debug, info};

const PERSISTENT: u8 = 2;

#[derive(Debug, Clone, Default)]
pub struct AmqpBroker;

impl AmqpBroker {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Broker for AmqpBroker {
    type Channel = AmqpChannel;

    async fn connect(&self, url: &str) -> Result<AmqpChannel, WorkerError> {
        let connection = Connection::connect(url, ConnectionProperties::default())
            .await
            .map_err(|e| WorkerError::Connection(e.to_string()))?;

        let channel = match connection.create_channel().await {
            Ok(channel) => channel,
            Err(e) => {
                let _ = connection.close(200, "channel open failed").await;
                return Err(WorkerError::Channel(e.to_string()));
            }
        };

        info!("Connected to broker, channel {}", channel.id());
        Ok(AmqpChannel {
            connection,
            channel,
        })
    }
}

pub struct AmqpChannel {
    connection: Connection,
    channel: Channel,
}

fn to_lapin_kind(kind: ExchangeKind) -> lapin::ExchangeKind {
    match kind {
        ExchangeKind::Direct => lapin::ExchangeKind::Direct,
        ExchangeKind::Fanout => lapin::ExchangeKind::Fanout,
        ExchangeKind::Topic => lapin::ExchangeKind::Topic,
        ExchangeKind::Headers => lapin::ExchangeKind::Headers,
    }
}

#[async_trait]
impl BrokerChannel for AmqpChannel {
    async fn declare_queue(&self, queue: &str) -> Result<(), WorkerError> {
        self.channel
            .queue_declare(
                queue,
                QueueDeclareOptions {
                    durable: true,
                    auto_delete: false,
                    exclusive: false,
                    nowait: false,
                    passive: false,
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| WorkerError::Declare(format!("queue {queue}: {e}")))?;
        Ok(())
    }

    async fn declare_exchange(
        &self,
        exchange: &str,
        kind: ExchangeKind,
    ) -> Result<(), WorkerError> {
        self.channel
            .exchange_declare(
                exchange,
                to_lapin_kind(kind),
                ExchangeDeclareOptions {
                    durable: true,
                    auto_delete: false,
                    internal: false,
                    nowait: false,
                    passive: false,
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| WorkerError::Declare(format!("exchange {exchange}: {e}")))
    }

    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), WorkerError> {
        self.channel
            .queue_bind(
                queue,
                exchange,
                routing_key,
                QueueBindOptions { nowait: false },
                FieldTable::default(),
            )
            .await
            .map_err(|e| WorkerError::Declare(format!("bind {queue} -> {exchange}: {e}")))
    }

    async fn set_prefetch(&self, count: u16) -> Result<(), WorkerError> {
        self.channel
            .basic_qos(count, BasicQosOptions { global: false })
            .await
            .map_err(|e| WorkerError::Channel(format!("basic.qos: {e}")))
    }

    async fn consume(
        &self,
        queue: &str,
        consumer_tag: &str,
    ) -> Result<DeliveryStream, WorkerError> {
        let consumer = self
            .channel
            .basic_consume(
                queue,
                consumer_tag,
                BasicConsumeOptions {
                    no_ack: false,
                    exclusive: false,
                    no_local: false,
                    nowait: false,
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| WorkerError::Channel(format!("basic.consume: {e}")))?;

        let deliveries = consumer.map(|delivery| match delivery {
            Ok(delivery) => Ok(Delivery::new(
                delivery.data,
                Box::new(AmqpAcker(delivery.acker)),
            )),
            Err(e) => Err(WorkerError::Channel(e.to_string())),
        });

        Ok(deliveries.boxed())
    }

    fn close_notices(&self) -> CloseNotices {
        let (connection_tx, connection_rx) = mpsc::unbounded_channel();
        let (channel_tx, channel_rx) = mpsc::unbounded_channel();

        self.connection.on_error(move |err| {
            let _ = connection_tx.send(err.to_string());
        });
        self.channel.on_error(move |err| {
            let _ = channel_tx.send(err.to_string());
        });

        CloseNotices {
            connection: connection_rx,
            channel: channel_rx,
        }
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
    ) -> Result<(), WorkerError> {
        let properties = BasicProperties::default()
            .with_content_type("text/plain".into())
            .with_delivery_mode(PERSISTENT)
            .with_timestamp(chrono::Utc::now().timestamp() as u64)
            .with_message_id(uuid::Uuid::new_v4().to_string().into());

        // Publisher channels are single-shot, so confirms are enabled per publish.
        self.channel
            .confirm_select(ConfirmSelectOptions { nowait: false })
            .await
            .map_err(|e| WorkerError::Channel(format!("confirm.select: {e}")))?;

        let confirm = self
            .channel
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions {
                    mandatory: false,
                    immediate: false,
                },
                payload,
                properties,
            )
            .await
            .map_err(|e| WorkerError::Publish(e.to_string()))?
            .await
            .map_err(|e| WorkerError::Publish(e.to_string()))?;
        confirmation_result(&confirm)?;

        debug!(exchange, routing_key, bytes = payload.len(), "Published message");
        Ok(())
    }

    async fn close(&self) -> Result<(), WorkerError> {
        if self.channel.status().connected() {
            self.channel
                .close(200, "OK")
                .await
                .map_err(|e| WorkerError::Channel(e.to_string()))?;
        }
        if self.connection.status().connected() {
            self.connection
                .close(200, "OK")
                .await
                .map_err(|e| WorkerError::Connection(e.to_string()))?;
        }
        Ok(())
    }
}

/// Only a broker ack counts as a delivered publish.
fn confirmation_result(confirm: &Confirmation) -> Result<(), WorkerError> {
    match confirm {
        Confirmation::Ack(_) => Ok(()),
        Confirmation::Nack(_) => Err(WorkerError::Publish("publisher confirm NACK".to_string())),
        Confirmation::NotRequested => Err(WorkerError::Publish(
            "publisher confirms are not enabled on this channel".to_string(),
        )),
    }
}

struct AmqpAcker(Acker);

#[async_trait]
impl Acknowledger for AmqpAcker {
    async fn ack(&self) -> Result<(), WorkerError> {
        self.0
            .ack(BasicAckOptions { multiple: false })
            .await
            .map_err(|e| WorkerError::Channel(format!("basic.ack: {e}")))
    }

    async fn reject(&self, requeue: bool) -> Result<(), WorkerError> {
        self.0
            .nack(BasicNackOptions {
                multiple: false,
                requeue,
            })
            .await
            .map_err(|e| WorkerError::Channel(format!("basic.nack: {e}")))
    }
}
