//! Smart-lock access events from MQTT into a single-slot cell.
//!
//! The subscriber runs as a tokio task and overwrites the cell on every good
//! payload. The recognition loop only ever sees the latest event.

use rollcall_core::AccessEvent;
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, Publish, QoS};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;

const KEEP_ALIVE: Duration = Duration::from_secs(30);
const REQUEST_CAPACITY: usize = 10;

#[derive(Error, Debug)]
pub enum BridgeError {
    #[error("malformed access event: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("subscribe failed: {0}")]
    Subscribe(#[from] rumqttc::ClientError),
}

/// Broker coordinates for the access-event subscription.
#[derive(Debug, Clone)]
pub struct MqttSettings {
    pub host: String,
    pub port: u16,
    pub topic: String,
    pub client_id: String,
    pub retry: Duration,
}

pub struct AccessBridge {
    cell: watch::Sender<Option<AccessEvent>>,
    parse_errors: AtomicU64,
}

impl AccessBridge {
    pub fn new() -> Self {
        let (cell, _) = watch::channel(None);
        Self {
            cell,
            parse_errors: AtomicU64::new(0),
        }
    }

    /// Read side of the cell, for the recognition loop.
    pub fn subscribe(&self) -> watch::Receiver<Option<AccessEvent>> {
        self.cell.subscribe()
    }

    pub fn latest(&self) -> Option<AccessEvent> {
        self.cell.borrow().clone()
    }

    pub fn parse_errors(&self) -> u64 {
        self.parse_errors.load(Ordering::Relaxed)
    }

    /// Decode one payload. A good event replaces the cell; a bad one is
    /// counted and reported, and the cell keeps its previous value.
    pub fn handle_payload(&self, payload: &[u8]) -> Result<(), BridgeError> {
        match serde_json::from_slice::<AccessEvent>(payload) {
            Ok(event) => {
                tracing::info!(
                    name = %event.name,
                    status = ?event.status,
                    timestamp = %event.timestamp,
                    "access event"
                );
                self.cell.send_replace(Some(event));
                Ok(())
            }
            Err(e) => {
                self.parse_errors.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(error = %e, bytes = payload.len(), "dropping malformed access event");
                Err(e.into())
            }
        }
    }

    /// Handle a publish delivered on the subscription. The broker only routes
    /// messages matching the configured filter, so wildcard topics such as
    /// `smartlock/#` arrive here under their concrete names.
    pub fn handle_publish(&self, publish: &Publish) -> Result<(), BridgeError> {
        tracing::debug!(topic = %publish.topic, bytes = publish.payload.len(), "publish received");
        self.handle_payload(&publish.payload)
    }

    /// Drive the MQTT event loop forever, resubscribing on every ConnAck.
    pub async fn run(self: Arc<Self>, settings: MqttSettings) {
        let mut options = MqttOptions::new(
            settings.client_id.clone(),
            settings.host.clone(),
            settings.port,
        );
        options.set_keep_alive(KEEP_ALIVE);

        let (client, mut eventloop) = AsyncClient::new(options, REQUEST_CAPACITY);
        tracing::info!(
            host = %settings.host,
            port = settings.port,
            topic = %settings.topic,
            "access bridge starting"
        );

        loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(Packet::ConnAck(_))) => {
                    if let Err(e) = subscribe(&client, &settings.topic) {
                        tracing::warn!(error = %e, topic = %settings.topic, "subscribe failed");
                    }
                }
                Ok(Event::Incoming(Packet::Publish(publish))) => {
                    // Already logged and counted; the loop keeps going either way.
                    self.handle_publish(&publish).ok();
                }
                Ok(_) => {}
                Err(e) => {
                    tracing::warn!(
                        error = %e,
                        retry_secs = settings.retry.as_secs(),
                        "broker connection error"
                    );
                    tokio::time::sleep(settings.retry).await;
                }
            }
        }
    }
}

impl Default for AccessBridge {
    fn default() -> Self {
        Self::new()
    }
}

fn subscribe(client: &AsyncClient, topic: &str) -> Result<(), BridgeError> {
    client.try_subscribe(topic, QoS::AtMostOnce)?;
    tracing::info!(topic, "subscribed to access events");
    Ok(())
}
