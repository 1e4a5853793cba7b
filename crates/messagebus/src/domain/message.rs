//! Messages crossing the broker boundary.

use bus_telemetry::{HeaderCarrier, TraceContext};
use serde::{de::DeserializeOwned, Serialize};

use super::errors::BusError;
use super::topic::{parse_topic, Topic};

/// Exchange name that routes directly to the queue named by the routing key.
pub const DEFAULT_EXCHANGE: &str = "";

/// Content type stamped on every published payload.
pub const CONTENT_TYPE_JSON: &str = "application/json";

/// A message received from a consumer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub delivery_tag: u64,
    pub exchange: String,
    pub routing_key: String,
    pub headers: HeaderCarrier,
    pub body: Vec<u8>,
}

impl Delivery {
    /// Decode the JSON body into the listener's envelope type.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, BusError> {
        serde_json::from_slice(&self.body).map_err(|e| BusError::MalformedMessage(e.to_string()))
    }

    /// Parsed routing key, if it has the three-segment topic shape.
    pub fn topic(&self) -> Option<Topic> {
        parse_topic(&self.routing_key)
    }

    /// Remote trace context carried in the headers (empty if none).
    pub fn trace_context(&self) -> TraceContext {
        TraceContext::extract(&self.headers)
    }

    /// Metadata handed to the listener callback alongside the payload.
    pub fn context(&self) -> DeliveryContext {
        DeliveryContext {
            exchange: self.exchange.clone(),
            routing_key: self.routing_key.clone(),
            topic: self.topic(),
            trace: self.trace_context(),
            delivery_tag: self.delivery_tag,
        }
    }
}

/// Per-delivery metadata passed to listener callbacks.
#[derive(Debug, Clone)]
pub struct DeliveryContext {
    pub exchange: String,
    pub routing_key: String,
    /// `None` when the routing key is not a three-segment topic.
    pub topic: Option<Topic>,
    pub trace: TraceContext,
    pub delivery_tag: u64,
}

/// A message ready to be handed to the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundMessage {
    /// Target exchange; [`DEFAULT_EXCHANGE`] addresses a queue by name.
    pub exchange: String,
    pub routing_key: String,
    pub headers: HeaderCarrier,
    pub body: Vec<u8>,
}

impl OutboundMessage {
    /// Serialize `payload` as JSON and attach the trace context, if any.
    pub fn json<T: Serialize + ?Sized>(
        exchange: &str,
        routing_key: &str,
        payload: &T,
        trace: Option<&TraceContext>,
    ) -> Result<Self, BusError> {
        let body =
            serde_json::to_vec(payload).map_err(|e| BusError::Serialization(e.to_string()))?;
        let mut headers = HeaderCarrier::new();
        if let Some(trace) = trace {
            trace.inject(&mut headers);
        }
        Ok(Self {
            exchange: exchange.to_string(),
            routing_key: routing_key.to_string(),
            headers,
            body,
        })
    }
}

/// Per-call publish options.
#[derive(Debug, Clone, Default)]
pub struct PublishOptions {
    /// Wait for the broker to acknowledge the message.
    pub confirm: bool,
    /// Trace context to inject into the message headers.
    pub trace: Option<TraceContext>,
}

impl PublishOptions {
    /// Confirm-mode options.
    #[must_use]
    pub fn confirmed() -> Self {
        Self {
            confirm: true,
            trace: None,
        }
    }

    #[must_use]
    pub fn with_trace(mut self, trace: TraceContext) -> Self {
        self.trace = Some(trace);
        self
    }
}

/// Broker outcome of a confirm-mode publish.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Confirmation {
    Ack,
    Nack { reason: String },
}

impl Confirmation {
    pub fn into_result(self) -> Result<(), BusError> {
        match self {
            Confirmation::Ack => Ok(()),
            Confirmation::Nack { reason } => Err(BusError::PublishNacked { reason }),
        }
    }
}
