//! RabbitMQ transport on top of `lapin`.
//!
//! Compiled with the `amqp` feature, on by default. One connection carries
//! one channel; connection and channel failures are both surfaced through
//! `LinkState` watches so the connection manager can rebuild the link.

use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use lapin::acker::Acker;
use lapin::options::{
    BasicAckOptions, BasicCancelOptions, BasicConsumeOptions, BasicNackOptions,
    BasicPublishOptions, BasicQosOptions, ConfirmSelectOptions, ExchangeDeclareOptions,
    QueueBindOptions, QueueDeclareOptions,
};
use lapin::types::{AMQPValue, FieldTable, LongString, ShortString};
use lapin::{BasicProperties, ConnectionProperties};
use tokio::sync::watch;
use tracing::{debug, warn};

use super::{
    Acknowledger, Channel, Connection, Delivery, DeliveryStream, HeaderValue, Headers, LinkState,
    OutgoingMessage, Transport, TransportError,
};
use crate::topology::{BindingSpec, ExchangeKind, ExchangeSpec, QueueSpec};

const REPLY_SUCCESS: u16 = 200;
const PERSISTENT: u8 = 2;

fn map_error(err: lapin::Error) -> TransportError {
    let text = err.to_string();
    match err {
        lapin::Error::InvalidChannelState(_) | lapin::Error::InvalidConnectionState(_) => {
            TransportError::ChannelClosed(text)
        }
        lapin::Error::IOError(_) => TransportError::ConnectionFailed(text),
        _ if text.contains("PRECONDITION_FAILED") => TransportError::PreconditionFailed(text),
        _ if text.contains("NOT_FOUND") => TransportError::NotFound(text),
        _ => TransportError::Protocol(text),
    }
}

fn to_field_table(headers: &Headers) -> FieldTable {
    let mut table = FieldTable::default();
    for (key, value) in headers {
        let value = match value {
            HeaderValue::Int(number) => AMQPValue::LongLongInt(*number),
            HeaderValue::Text(text) => AMQPValue::LongString(LongString::from(text.as_str())),
        };
        table.insert(ShortString::from(key.as_str()), value);
    }
    table
}

fn from_field_table(table: &FieldTable) -> Headers {
    table
        .inner()
        .iter()
        .filter_map(|(key, value)| {
            let value = match value {
                AMQPValue::LongLongInt(n) => HeaderValue::Int(*n),
                AMQPValue::LongInt(n) => HeaderValue::Int(i64::from(*n)),
                AMQPValue::ShortInt(n) => HeaderValue::Int(i64::from(*n)),
                AMQPValue::LongUInt(n) => HeaderValue::Int(i64::from(*n)),
                AMQPValue::LongString(s) => {
                    HeaderValue::Text(String::from_utf8_lossy(s.as_bytes()).into_owned())
                }
                AMQPValue::ShortString(s) => HeaderValue::Text(s.as_str().to_string()),
                _ => return None,
            };
            Some((key.as_str().to_string(), value))
        })
        .collect()
}

/// Connects to RabbitMQ. `confirms` turns on publisher confirms for every
/// channel it opens.
#[derive(Debug, Clone)]
pub struct AmqpTransport {
    confirms: bool,
}

impl AmqpTransport {
    pub fn new(confirms: bool) -> Self {
        Self { confirms }
    }
}

#[async_trait]
impl Transport for AmqpTransport {
    async fn connect(&self, url: &str) -> Result<Arc<dyn Connection>, TransportError> {
        let connection = lapin::Connection::connect(url, ConnectionProperties::default())
            .await
            .map_err(|e| TransportError::ConnectionFailed(e.to_string()))?;

        let (sender, receiver) = watch::channel(LinkState::Open);
        let sender = Arc::new(sender);
        let on_error = sender.clone();
        connection.on_error(move |err| {
            warn!(error = %err, "amqp connection error");
            on_error.send_replace(LinkState::Closed(err.to_string()));
        });

        Ok(Arc::new(AmqpConnection {
            connection,
            sender,
            receiver,
            confirms: self.confirms,
        }))
    }
}

struct AmqpConnection {
    connection: lapin::Connection,
    sender: Arc<watch::Sender<LinkState>>,
    receiver: watch::Receiver<LinkState>,
    confirms: bool,
}

#[async_trait]
impl Connection for AmqpConnection {
    async fn open_channel(&self) -> Result<Arc<dyn Channel>, TransportError> {
        let channel = self.connection.create_channel().await.map_err(map_error)?;
        if self.confirms {
            channel
                .confirm_select(ConfirmSelectOptions::default())
                .await
                .map_err(map_error)?;
        }

        let (status, _) = watch::channel(LinkState::Open);
        let status = Arc::new(status);
        let on_error = status.clone();
        channel.on_error(move |err| {
            warn!(error = %err, "amqp channel error");
            on_error.send_replace(LinkState::Closed(err.to_string()));
        });

        Ok(Arc::new(AmqpChannel {
            channel,
            confirms: self.confirms,
            status,
        }))
    }

    fn state(&self) -> watch::Receiver<LinkState> {
        self.receiver.clone()
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.sender
            .send_replace(LinkState::Closed("closed by client".to_string()));
        self.connection
            .close(REPLY_SUCCESS, "bye")
            .await
            .map_err(map_error)
    }
}

struct AmqpChannel {
    channel: lapin::Channel,
    confirms: bool,
    status: Arc<watch::Sender<LinkState>>,
}

#[async_trait]
impl Channel for AmqpChannel {
    async fn declare_exchange(&self, spec: &ExchangeSpec) -> Result<(), TransportError> {
        let kind = match spec.kind {
            ExchangeKind::Topic => lapin::ExchangeKind::Topic,
            ExchangeKind::Direct => lapin::ExchangeKind::Direct,
        };
        let options = ExchangeDeclareOptions {
            durable: spec.durable,
            ..Default::default()
        };
        self.channel
            .exchange_declare(&spec.name, kind, options, FieldTable::default())
            .await
            .map_err(map_error)
    }

    async fn declare_queue(&self, spec: &QueueSpec) -> Result<(), TransportError> {
        let mut arguments = FieldTable::default();
        if let Some(exchange) = &spec.arguments.dead_letter_exchange {
            arguments.insert(
                ShortString::from("x-dead-letter-exchange"),
                AMQPValue::LongString(LongString::from(exchange.as_str())),
            );
        }
        if let Some(routing_key) = &spec.arguments.dead_letter_routing_key {
            arguments.insert(
                ShortString::from("x-dead-letter-routing-key"),
                AMQPValue::LongString(LongString::from(routing_key.as_str())),
            );
        }
        if let Some(ttl) = spec.arguments.message_ttl_ms {
            arguments.insert(
                ShortString::from("x-message-ttl"),
                AMQPValue::LongLongInt(ttl as i64),
            );
        }

        let options = QueueDeclareOptions {
            durable: spec.durable,
            ..Default::default()
        };
        self.channel
            .queue_declare(&spec.name, options, arguments)
            .await
            .map(|_| ())
            .map_err(map_error)
    }

    async fn bind_queue(&self, binding: &BindingSpec) -> Result<(), TransportError> {
        self.channel
            .queue_bind(
                &binding.queue,
                &binding.exchange,
                &binding.routing_key,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(map_error)
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        message: OutgoingMessage,
    ) -> Result<(), TransportError> {
        let mut properties = BasicProperties::default()
            .with_content_type(ShortString::from(message.content_type.as_str()))
            .with_headers(to_field_table(&message.headers));
        if message.persistent {
            properties = properties.with_delivery_mode(PERSISTENT);
        }
        if let Some(id) = &message.message_id {
            properties = properties.with_message_id(ShortString::from(id.as_str()));
        }

        let confirm = self
            .channel
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions::default(),
                &message.body,
                properties,
            )
            .await
            .map_err(map_error)?;

        if self.confirms {
            let confirmation = confirm.await.map_err(map_error)?;
            if confirmation.is_nack() {
                return Err(TransportError::Protocol(format!(
                    "broker nacked message for '{routing_key}'"
                )));
            }
        }
        Ok(())
    }

    async fn consume(
        &self,
        queue: &str,
        consumer_tag: &str,
        prefetch: u16,
    ) -> Result<DeliveryStream, TransportError> {
        self.channel
            .basic_qos(prefetch, BasicQosOptions::default())
            .await
            .map_err(map_error)?;
        let consumer = self
            .channel
            .basic_consume(
                queue,
                consumer_tag,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(map_error)?;
        debug!(queue, consumer_tag, prefetch, "amqp consumer started");

        Ok(consumer
            .map(|item| item.map(into_delivery).map_err(map_error))
            .boxed())
    }

    async fn cancel(&self, consumer_tag: &str) -> Result<(), TransportError> {
        self.channel
            .basic_cancel(consumer_tag, BasicCancelOptions::default())
            .await
            .map_err(map_error)
    }

    fn state(&self) -> watch::Receiver<LinkState> {
        self.status.subscribe()
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.status
            .send_replace(LinkState::Closed("closed by client".to_string()));
        self.channel
            .close(REPLY_SUCCESS, "bye")
            .await
            .map_err(map_error)
    }
}

fn into_delivery(delivery: lapin::message::Delivery) -> Delivery {
    let headers = delivery
        .properties
        .headers()
        .as_ref()
        .map(from_field_table)
        .unwrap_or_default();
    let message_id = delivery
        .properties
        .message_id()
        .as_ref()
        .map(|id| id.as_str().to_string());
    let persistent = *delivery.properties.delivery_mode() == Some(PERSISTENT);

    Delivery::new(
        delivery.delivery_tag,
        delivery.exchange.as_str().to_string(),
        delivery.routing_key.as_str().to_string(),
        delivery.data,
        headers,
        message_id,
        delivery.redelivered,
        persistent,
        Box::new(AmqpAcker {
            acker: delivery.acker,
        }),
    )
}

struct AmqpAcker {
    acker: Acker,
}

#[async_trait]
impl Acknowledger for AmqpAcker {
    async fn ack(&self) -> Result<(), TransportError> {
        self.acker
            .ack(BasicAckOptions::default())
            .await
            .map(|_| ())
            .map_err(map_error)
    }

    async fn reject(&self, requeue: bool) -> Result<(), TransportError> {
        self.acker
            .nack(BasicNackOptions {
                multiple: false,
                requeue,
            })
            .await
            .map(|_| ())
            .map_err(map_error)
    }
}
