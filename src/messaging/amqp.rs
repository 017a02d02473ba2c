//! RabbitMQ adapter (AMQP 0-9-1 via `lapin`)

use super::{Broker, BrokerChannel, Delivery, DeliveryAcker, PublishProperties};
use crate::errors::{BrokerError, BrokerResult};
use async_trait::async_trait;
use futures::stream::{BoxStream, StreamExt};
use lapin::{
    acker::Acker,
    options::{
        BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicPublishOptions, BasicQosOptions,
        ConfirmSelectOptions, ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions,
    },
    types::{AMQPValue, FieldTable, LongString, ShortString},
    BasicProperties, Channel, Connection, ConnectionProperties, ExchangeKind,
};
use std::collections::BTreeMap;
use tracing::{debug, info};

const PERSISTENT: u8 = 2;
const TRANSIENT: u8 = 1;

/// Connects to RabbitMQ; each `connect()` opens its own TCP connection
pub struct AmqpBroker {
    url: String,
    connection_name: String,
}

impl AmqpBroker {
    pub fn new(url: impl Into<String>, connection_name: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            connection_name: connection_name.into(),
        }
    }
}

#[async_trait]
impl Broker for AmqpBroker {
    async fn connect(&self) -> BrokerResult<Box<dyn BrokerChannel>> {
        let properties = ConnectionProperties::default()
            .with_connection_name(LongString::from(self.connection_name.clone()));

        let connection = Connection::connect(&self.url, properties)
            .await
            .map_err(|e| BrokerError::ConnectionFailed(e.to_string()))?;
        let channel = connection.create_channel().await?;
        // Confirm mode: each publish resolves to the broker ack or nack
        channel
            .confirm_select(ConfirmSelectOptions::default())
            .await
            .map_err(|e| BrokerError::ConnectionFailed(format!("confirm_select failed: {}", e)))?;

        info!(name = %self.connection_name, "Connected to RabbitMQ");
        Ok(Box::new(AmqpChannel { connection, channel }))
    }
}

struct AmqpChannel {
    connection: Connection,
    channel: Channel,
}

fn to_field_table(headers: &BTreeMap<String, String>) -> FieldTable {
    let mut table = FieldTable::default();
    for (key, value) in headers {
        table.insert(
            ShortString::from(key.clone()),
            AMQPValue::LongString(LongString::from(value.clone())),
        );
    }
    table
}

/// String-valued headers only; other AMQP field types are not trace context
fn from_field_table(table: Option<&FieldTable>) -> BTreeMap<String, String> {
    let Some(table) = table else {
        return BTreeMap::new();
    };
    table
        .inner()
        .iter()
        .filter_map(|(key, value)| {
            let text = match value {
                AMQPValue::LongString(s) => String::from_utf8_lossy(s.as_bytes()).into_owned(),
                AMQPValue::ShortString(s) => s.as_str().to_string(),
                _ => return None,
            };
            Some((key.as_str().to_string(), text))
        })
        .collect()
}

fn into_delivery(delivery: lapin::message::Delivery) -> Delivery {
    let headers = from_field_table(delivery.properties.headers().as_ref());
    Delivery::new(
        delivery.routing_key.as_str().to_string(),
        delivery.data,
        headers,
        delivery.redelivered,
        Box::new(AmqpAcker {
            acker: delivery.acker,
        }),
    )
}

#[async_trait]
impl BrokerChannel for AmqpChannel {
    async fn declare_exchange(&self, name: &str) -> BrokerResult<()> {
        self.channel
            .exchange_declare(
                name,
                ExchangeKind::Topic,
                ExchangeDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| BrokerError::DeclareFailed(format!("exchange {}: {}", name, e)))
    }

    async fn declare_queue(&self, name: &str) -> BrokerResult<()> {
        self.channel
            .queue_declare(
                name,
                QueueDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map(|_| ())
            .map_err(|e| BrokerError::DeclareFailed(format!("queue {}: {}", name, e)))
    }

    async fn bind_queue(&self, queue: &str, exchange: &str, routing_key: &str) -> BrokerResult<()> {
        self.channel
            .queue_bind(
                queue,
                exchange,
                routing_key,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| BrokerError::DeclareFailed(format!("bind {} -> {}: {}", queue, exchange, e)))
    }

    async fn set_prefetch(&self, count: u16) -> BrokerResult<()> {
        self.channel
            .basic_qos(count, BasicQosOptions::default())
            .await
            .map_err(BrokerError::from)
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
        properties: &PublishProperties,
    ) -> BrokerResult<()> {
        let amqp_properties = BasicProperties::default()
            .with_content_type(ShortString::from("application/json"))
            .with_delivery_mode(if properties.persistent { PERSISTENT } else { TRANSIENT })
            .with_headers(to_field_table(&properties.headers));

        let confirm = self
            .channel
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions::default(),
                payload,
                amqp_properties,
            )
            .await
            .map_err(|e| BrokerError::PublishFailed(e.to_string()))?;
        let confirmation = confirm
            .await
            .map_err(|e| BrokerError::PublishFailed(e.to_string()))?;
        if confirmation.is_nack() {
            return Err(BrokerError::PublishFailed(format!(
                "broker nacked publish to {} / {}",
                exchange, routing_key
            )));
        }

        debug!(exchange, routing_key, bytes = payload.len(), "Published");
        Ok(())
    }

    async fn consume(
        &self,
        queue: &str,
        consumer_tag: &str,
    ) -> BrokerResult<BoxStream<'static, BrokerResult<Delivery>>> {
        let consumer = self
            .channel
            .basic_consume(
                queue,
                consumer_tag,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| BrokerError::ConsumeFailed(format!("{}: {}", queue, e)))?;

        Ok(consumer
            .map(|item| item.map(into_delivery).map_err(BrokerError::from))
            .boxed())
    }

    async fn close(&self) -> BrokerResult<()> {
        if self.channel.status().connected() {
            self.channel.close(200, "OK").await?;
        }
        if self.connection.status().connected() {
            self.connection.close(200, "OK").await?;
        }
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.connection.status().connected() && self.channel.status().connected()
    }
}

struct AmqpAcker {
    acker: Acker,
}

#[async_trait]
impl DeliveryAcker for AmqpAcker {
    async fn ack(&self) -> BrokerResult<()> {
        self.acker
            .ack(BasicAckOptions::default())
            .await
            .map_err(|e| BrokerError::AckFailed(e.to_string()))
    }

    async fn nack(&self, requeue: bool) -> BrokerResult<()> {
        self.acker
            .nack(BasicNackOptions {
                requeue,
                ..Default::default()
            })
            .await
            .map_err(|e| BrokerError::AckFailed(e.to_string()))
    }
}
