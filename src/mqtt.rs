use crate::broker::{BrokerMessage, Publisher, PublisherFactory};
use crate::config::BrokerConfig;
use crate::error::BrokerError;
use rumqttc::v5::mqttbytes::v5::{Packet, PublishProperties};
use rumqttc::v5::mqttbytes::QoS;
use rumqttc::v5::{AsyncClient, Event, EventLoop, MqttOptions};
use rumqttc::Transport;
use tokio::task::JoinHandle;
use tokio::time::{sleep, Duration};

const REQUEST_QUEUE_CAPACITY: usize = 64;

/// Creates MQTT v5 publishers. Key and timestamp travel as user properties so
/// the payload stays exactly the serialized readings.
pub struct MqttPublisherFactory;

pub struct MqttPublisher {
    client: AsyncClient,
    driver: JoinHandle<()>,
}

impl Drop for MqttPublisher {
    fn drop(&mut self) {
        self.driver.abort();
    }
}

fn bootstrap_addresses(bootstrap: &str) -> Result<Vec<(String, u16)>, BrokerError> {
    let addresses = bootstrap
        .split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(parse_address)
        .collect::<Result<Vec<_>, _>>()?;
    if addresses.is_empty() {
        return Err(BrokerError::ProducerCreation("empty bootstrap list".to_string()));
    }
    Ok(addresses)
}

fn parse_address(entry: &str) -> Result<(String, u16), BrokerError> {
    let (host, port) = entry.rsplit_once(':').ok_or_else(|| {
        BrokerError::ProducerCreation(format!("bootstrap address {entry:?} has no port"))
    })?;
    let port = port.parse::<u16>().map_err(|err| {
        BrokerError::ProducerCreation(format!("bootstrap address {entry:?}: {err}"))
    })?;
    if host.is_empty() {
        return Err(BrokerError::ProducerCreation(format!(
            "bootstrap address {entry:?} has no host"
        )));
    }
    Ok((host.to_string(), port))
}

fn validate_topic(topic: &str) -> Result<(), BrokerError> {
    if topic.is_empty() || topic.contains(['+', '#']) {
        return Err(BrokerError::ProducerCreation(format!(
            "invalid publish topic {topic:?}"
        )));
    }
    Ok(())
}

fn mqtt_options(config: &BrokerConfig, (host, port): &(String, u16)) -> MqttOptions {
    let mut options = MqttOptions::new(config.client_id.clone(), host.clone(), *port);
    options.set_keep_alive(config.keep_alive);
    if let Some(username) = &config.sa_key {
        options.set_credentials(username.clone(), config.sa_secret.clone().unwrap_or_default());
    }
    if config.tls {
        options.set_transport(Transport::tls_with_default_config());
    }
    options
}

/// Bootstrap entries in connection order. A dropped or refused connection
/// moves on to the next entry, wrapping around.
struct Bootstrap {
    config: BrokerConfig,
    addresses: Vec<(String, u16)>,
    current: usize,
}

impl Bootstrap {
    fn address(&self) -> &(String, u16) {
        &self.addresses[self.current]
    }

    fn advance(&mut self) -> Option<MqttOptions> {
        if self.addresses.len() < 2 {
            return None;
        }
        self.current = (self.current + 1) % self.addresses.len();
        Some(mqtt_options(&self.config, self.address()))
    }
}

impl PublisherFactory for MqttPublisherFactory {
    type Publisher = MqttPublisher;

    fn create(&self, config: &BrokerConfig) -> Result<MqttPublisher, BrokerError> {
        validate_topic(&config.topic)?;
        let bootstrap = Bootstrap {
            config: config.clone(),
            addresses: bootstrap_addresses(&config.bootstrap)?,
            current: 0,
        };
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|err| BrokerError::ProducerCreation(err.to_string()))?;

        let options = mqtt_options(config, bootstrap.address());
        let (client, eventloop) = AsyncClient::new(options, REQUEST_QUEUE_CAPACITY);
        tracing::info!(
            topic = %config.topic,
            bootstrap = %config.bootstrap,
            client_id = %config.client_id,
            "created broker publisher"
        );
        let driver = runtime.spawn(drive_event_loop(eventloop, bootstrap));
        Ok(MqttPublisher { client, driver })
    }
}

impl Publisher for MqttPublisher {
    fn enqueue(&self, message: BrokerMessage) -> Result<(), BrokerError> {
        let properties = PublishProperties {
            content_type: Some("application/json".to_string()),
            user_properties: vec![
                ("key".to_string(), message.key.to_string()),
                ("timestamp".to_string(), message.timestamp.to_rfc3339()),
            ],
            ..Default::default()
        };
        self.client
            .try_publish_with_properties(
                message.topic,
                QoS::AtLeastOnce,
                false,
                message.payload,
                properties,
            )
            .map_err(|err| BrokerError::Publish(err.to_string()))
    }
}

/// Delivery happens here, out of band from the tick loop. Connection errors
/// are logged and the next poll reconnects, to the next bootstrap entry when
/// there is one.
async fn drive_event_loop(mut eventloop: EventLoop, mut bootstrap: Bootstrap) {
    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(_))) => {
                let (host, port) = bootstrap.address();
                tracing::info!(host = %host, port, "connected to broker");
            }
            Ok(Event::Incoming(Packet::PubAck(ack))) => {
                tracing::debug!(pkid = ack.pkid, "broker acknowledged readings");
            }
            Ok(_) => {}
            Err(err) => {
                tracing::warn!(error=%err, "broker connection dropped; reconnecting");
                if let Some(options) = bootstrap.advance() {
                    let (host, port) = bootstrap.address();
                    tracing::info!(host = %host, port, "failing over to next bootstrap address");
                    eventloop.options = options;
                }
                sleep(Duration::from_secs(2)).await;
            }
        }
    }
}
