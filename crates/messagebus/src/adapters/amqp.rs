//! # AMQP Transport
//!
//! `lapin`-backed implementation of the broker ports. Enabled with the
//! `amqp` feature.
//!
//! - Channels are opened in publisher-confirm mode.
//! - Connection and channel errors are forwarded to the event sink.
//! - Each consumer is pumped into an unbounded channel by its own task.
//!
//! The broker address is handed to `lapin` as a structured URI, so
//! credentials never pass through URL parsing.
//!
//! TLS: the CA bundle is trusted in addition to the system roots. The client
//! certificate is presented from a PKCS#12 archive; PEM pairs alone are not.

use std::sync::Arc;

use async_trait::async_trait;
use bus_telemetry::HeaderCarrier;
use futures::{FutureExt, StreamExt};
use lapin::{
    options::{
        BasicAckOptions, BasicCancelOptions, BasicConsumeOptions, BasicPublishOptions,
        ConfirmSelectOptions, ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions,
        QueueDeleteOptions,
    },
    publisher_confirm,
    tcp::{OwnedIdentity, OwnedTLSConfig},
    types::{AMQPValue, FieldTable, LongString, ShortString},
    uri::{AMQPAuthority, AMQPScheme, AMQPUri, AMQPUserInfo},
    BasicProperties, Channel, Connection, ConnectionProperties, ExchangeKind,
};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::config::{BusConfig, ConfigError};
use crate::domain::message::CONTENT_TYPE_JSON;
use crate::domain::{Confirmation, Delivery, OutboundMessage, TransportError};
use crate::ports::{
    BrokerChannel, BrokerConnection, BrokerTransport, Consumer, EventSink, PendingConfirm,
    QueueOptions, TransportEvent,
};

/// Broker transport over AMQP 0-9-1.
pub struct AmqpTransport {
    uri: AMQPUri,
    redacted_url: String,
    ca: Option<String>,
    /// PKCS#12 DER and its password.
    identity: Option<(Vec<u8>, String)>,
}

impl AmqpTransport {
    /// Fails if the configured client identity cannot be read.
    pub fn new(config: &BusConfig) -> Result<Self, ConfigError> {
        let identity = match &config.tls.identity {
            Some(identity) => Some((identity.load()?, identity.password.clone())),
            None => {
                if config.tls.cert.is_some() {
                    warn!("PEM client certificate configured without MESSAGEBUS_PKCS12, it will not be presented");
                }
                None
            }
        };

        Ok(Self {
            uri: broker_uri(config),
            redacted_url: config.redacted_url(),
            ca: config.tls.ca.clone(),
            identity,
        })
    }

    fn tls_config(&self) -> OwnedTLSConfig {
        OwnedTLSConfig {
            identity: self.identity.as_ref().map(|(der, password)| OwnedIdentity {
                der: der.clone(),
                password: password.clone(),
            }),
            cert_chain: self.ca.clone(),
        }
    }
}

fn broker_uri(config: &BusConfig) -> AMQPUri {
    let scheme = if config.uses_tls() {
        AMQPScheme::AMQPS
    } else {
        AMQPScheme::AMQP
    };
    AMQPUri {
        scheme,
        authority: AMQPAuthority {
            userinfo: AMQPUserInfo {
                username: config.username.clone(),
                password: config.password.clone(),
            },
            host: config.host.clone(),
            port: config.port(),
        },
        ..AMQPUri::default()
    }
}

fn map_error(err: lapin::Error) -> TransportError {
    match err {
        lapin::Error::InvalidChannelState(_) | lapin::Error::InvalidConnectionState(_) => {
            TransportError::ChannelClosed
        }
        other => TransportError::Broker(other.to_string()),
    }
}

#[async_trait]
impl BrokerTransport for AmqpTransport {
    async fn connect(&self, events: EventSink) -> Result<Arc<dyn BrokerConnection>, TransportError> {
        let connection = Connection::connect_uri_with_config(
            self.uri.clone(),
            ConnectionProperties::default(),
            self.tls_config(),
        )
        .await
        .map_err(|e| TransportError::Connect(e.to_string()))?;

        let sink = events.clone();
        connection.on_error(move |err| {
            let event = match err {
                lapin::Error::InvalidConnectionState(_) => TransportEvent::ConnectionClosed,
                other => TransportEvent::ConnectionError(other.to_string()),
            };
            let _ = sink.send(event);
        });

        Ok(Arc::new(AmqpConnection {
            connection,
            events,
        }))
    }

    fn describe(&self) -> String {
        self.redacted_url.clone()
    }
}

struct AmqpConnection {
    connection: Connection,
    events: EventSink,
}

#[async_trait]
impl BrokerConnection for AmqpConnection {
    async fn open_channel(&self) -> Result<Arc<dyn BrokerChannel>, TransportError> {
        let channel = self.connection.create_channel().await.map_err(map_error)?;
        channel
            .confirm_select(ConfirmSelectOptions::default())
            .await
            .map_err(map_error)?;

        let sink = self.events.clone();
        channel.on_error(move |err| {
            let _ = sink.send(TransportEvent::ChannelError(err.to_string()));
        });

        Ok(Arc::new(AmqpChannel { channel }))
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.connection.close(200, "closing").await.map_err(map_error)
    }

    fn is_open(&self) -> bool {
        self.connection.status().connected()
    }
}

struct AmqpChannel {
    channel: Channel,
}

fn headers_to_table(headers: &HeaderCarrier) -> FieldTable {
    let mut table = FieldTable::default();
    for (key, value) in headers {
        table.insert(
            ShortString::from(key.clone()),
            AMQPValue::LongString(LongString::from(value.clone())),
        );
    }
    table
}

fn table_to_headers(table: Option<&FieldTable>) -> HeaderCarrier {
    let mut headers = HeaderCarrier::new();
    if let Some(table) = table {
        for (key, value) in table.inner() {
            let value = match value {
                AMQPValue::LongString(s) => String::from_utf8_lossy(s.as_bytes()).into_owned(),
                AMQPValue::ShortString(s) => s.as_str().to_string(),
                _ => continue,
            };
            headers.insert(key.as_str().to_string(), value);
        }
    }
    headers
}

fn into_delivery(delivery: lapin::message::Delivery) -> Delivery {
    Delivery {
        delivery_tag: delivery.delivery_tag,
        exchange: delivery.exchange.as_str().to_string(),
        routing_key: delivery.routing_key.as_str().to_string(),
        headers: table_to_headers(delivery.properties.headers().as_ref()),
        body: delivery.data,
    }
}

#[async_trait]
impl BrokerChannel for AmqpChannel {
    async fn declare_topic_exchange(&self, name: &str, durable: bool) -> Result<(), TransportError> {
        self.channel
            .exchange_declare(
                name,
                ExchangeKind::Topic,
                ExchangeDeclareOptions {
                    durable,
                    ..ExchangeDeclareOptions::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(map_error)
    }

    async fn declare_queue(&self, name: &str, options: QueueOptions) -> Result<String, TransportError> {
        let queue = self
            .channel
            .queue_declare(
                name,
                QueueDeclareOptions {
                    durable: options.durable,
                    exclusive: options.exclusive,
                    auto_delete: options.auto_delete,
                    ..QueueDeclareOptions::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(map_error)?;
        Ok(queue.name().as_str().to_string())
    }

    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), TransportError> {
        self.channel
            .queue_bind(
                queue,
                exchange,
                routing_key,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(map_error)
    }

    async fn consume(&self, queue: &str) -> Result<Consumer, TransportError> {
        let mut consumer = self
            .channel
            .basic_consume(
                queue,
                "",
                BasicConsumeOptions {
                    no_ack: false,
                    ..BasicConsumeOptions::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(map_error)?;
        let tag = consumer.tag().as_str().to_string();

        let (sender, deliveries) = mpsc::unbounded_channel();
        let pump_tag = tag.clone();
        tokio::spawn(async move {
            while let Some(next) = consumer.next().await {
                match next {
                    Ok(delivery) => {
                        if sender.send(into_delivery(delivery)).is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        debug!(consumer = %pump_tag, error = %e, "Consumer stream ended with error");
                        break;
                    }
                }
            }
        });

        Ok(Consumer { tag, deliveries })
    }

    async fn ack(&self, delivery_tag: u64) -> Result<(), TransportError> {
        self.channel
            .basic_ack(delivery_tag, BasicAckOptions::default())
            .await
            .map_err(map_error)
    }

    async fn cancel(&self, consumer_tag: &str) -> Result<(), TransportError> {
        self.channel
            .basic_cancel(consumer_tag, BasicCancelOptions::default())
            .await
            .map_err(map_error)
    }

    async fn delete_queue(&self, queue: &str) -> Result<(), TransportError> {
        self.channel
            .queue_delete(queue, QueueDeleteOptions::default())
            .await
            .map(|_| ())
            .map_err(map_error)
    }

    async fn publish(&self, message: OutboundMessage) -> Result<PendingConfirm, TransportError> {
        let properties = BasicProperties::default()
            .with_content_type(ShortString::from(CONTENT_TYPE_JSON))
            .with_headers(headers_to_table(&message.headers));

        let confirm = self
            .channel
            .basic_publish(
                &message.exchange,
                &message.routing_key,
                BasicPublishOptions::default(),
                &message.body,
                properties,
            )
            .await
            .map_err(map_error)?;

        let confirmation = async move {
            match confirm.await.map_err(map_error)? {
                publisher_confirm::Confirmation::Nack(returned) => Ok(Confirmation::Nack {
                    reason: returned
                        .map(|r| r.reply_text.as_str().to_string())
                        .unwrap_or_else(|| "message nacked by broker".to_string()),
                }),
                _ => Ok(Confirmation::Ack),
            }
        }
        .boxed();

        Ok(PendingConfirm {
            accepted: true,
            confirmation,
        })
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.channel.close(200, "closing").await.map_err(map_error)
    }

    fn is_open(&self) -> bool {
        self.channel.status().connected()
    }
}
