use crate::config::BrokerConfig;
use crate::error::BrokerError;
use crate::lifecycle::Lifecycle;
use crate::mqtt::MqttPublisherFactory;
use bytes::Bytes;
use chrono::{DateTime, Utc};

/// Key attached to every readings message.
pub const MESSAGE_KEY: &str = "readings";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerMessage {
    pub topic: String,
    pub key: &'static str,
    pub payload: Bytes,
    /// Creation time of the readings, not broker receive time.
    pub timestamp: DateTime<Utc>,
}

pub trait Publisher {
    /// Hands the message to the client queue without waiting for delivery.
    fn enqueue(&self, message: BrokerMessage) -> Result<(), BrokerError>;
}

pub trait PublisherFactory {
    type Publisher: Publisher;

    fn create(&self, config: &BrokerConfig) -> Result<Self::Publisher, BrokerError>;
}

pub struct BrokerWriter<F: PublisherFactory = MqttPublisherFactory> {
    factory: F,
    config: BrokerConfig,
    publisher: Lifecycle<F::Publisher>,
}

impl BrokerWriter<MqttPublisherFactory> {
    pub fn from_config(config: BrokerConfig) -> Self {
        Self::new(MqttPublisherFactory, config)
    }
}

impl<F: PublisherFactory> BrokerWriter<F> {
    pub fn new(factory: F, config: BrokerConfig) -> Self {
        Self {
            factory,
            config,
            publisher: Lifecycle::default(),
        }
    }

    pub fn topic(&self) -> &str {
        &self.config.topic
    }

    /// Publishes one message stamped with `timestamp`. The publisher is created
    /// on first use; a failed creation is retried on the next call.
    pub async fn produce(
        &mut self,
        timestamp: DateTime<Utc>,
        payload: impl Into<Bytes>,
    ) -> Result<(), BrokerError> {
        let factory = &self.factory;
        let config = &self.config;
        let publisher = self
            .publisher
            .ready_or_init(|| async move { factory.create(config) })
            .await?;

        publisher.enqueue(BrokerMessage {
            topic: config.topic.clone(),
            key: MESSAGE_KEY,
            payload: payload.into(),
            timestamp,
        })
    }
}
