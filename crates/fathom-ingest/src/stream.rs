//! Live data point stream over MQTT.
//!
//! The collection service pushes new data points over an MQTT broker:
//! username is the collection identity, password is the API token, and
//! every topic under the collection is covered by a `#` subscription.
//!
//! # Architecture
//!
//! [`MqttSource::subscribe`] spawns the transport event loop as its own
//! task and hands the caller a bounded mpsc channel of parsed
//! [`NewDataPoint`]s plus a [`MqttSubscription`] handle for shutdown. The
//! consumer side stays free of transport details; the synchronizer just
//! selects on the channel.
//!
//! # Reconnects and failures
//!
//! A dropped connection is retried by polling the event loop again (the
//! client's built-in reconnect), counted in `stream_reconnects_total`.
//! Authentication, TLS and broker-initiated disconnects are treated as
//! unrecoverable: an unobserved stream is worse than a crashed,
//! restartable process. Malformed payloads are logged, counted and
//! skipped; a peer's bad message must not take the stream down.

use rumqttc::{AsyncClient, ConnectionError, Event, MqttOptions, Packet, QoS, Transport};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use fathom_core::{NewDataPoint, WireMessage};

use crate::{Error, Result};

/// Delay before re-polling the event loop after a dropped connection.
const RECONNECT_DELAY: Duration = Duration::from_secs(1);

/// How long `close` waits for the event loop task to wind down.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

/// Configuration for the live MQTT stream.
#[derive(Debug, Clone)]
pub struct StreamConfig {
    /// Broker hostname.
    pub host: String,

    /// Broker port (TLS).
    pub port: u16,

    /// Collection identity; doubles as the MQTT username.
    pub collection_id: String,

    /// API token; doubles as the MQTT password.
    pub api_token: String,

    /// Capacity of the channel between the stream task and the consumer.
    pub channel_capacity: usize,

    /// MQTT keep-alive interval.
    pub keep_alive: Duration,
}

impl StreamConfig {
    /// Config with the default channel capacity and keep-alive.
    pub fn new(host: &str, port: u16, collection_id: &str, api_token: &str) -> Self {
        Self {
            host: host.to_string(),
            port,
            collection_id: collection_id.to_string(),
            api_token: api_token.to_string(),
            channel_capacity: 1024,
            keep_alive: Duration::from_secs(30),
        }
    }
}

/// Handle for a running live subscription.
pub trait Subscription {
    /// Close the connection gracefully.
    ///
    /// Must succeed on a connection that is already closed. Returns the
    /// transport's terminal error if the stream died before `close` was
    /// called.
    fn close(self) -> impl Future<Output = Result<()>> + Send;
}

/// A source of live data points.
pub trait LiveSource {
    /// The subscription handle type this source produces.
    type Sub: Subscription;

    /// Open the subscription and start delivering data points.
    fn subscribe(
        self,
    ) -> impl Future<Output = Result<(Self::Sub, mpsc::Receiver<NewDataPoint>)>> + Send;
}

/// Live MQTT data point source.
pub struct MqttSource {
    config: StreamConfig,
}

impl MqttSource {
    /// Create a source with the given configuration.
    pub fn new(config: StreamConfig) -> Self {
        Self { config }
    }
}

/// A running MQTT subscription.
pub struct MqttSubscription {
    client: AsyncClient,
    task: JoinHandle<Result<()>>,
    stopping: Arc<AtomicBool>,
}

impl LiveSource for MqttSource {
    type Sub = MqttSubscription;

    async fn subscribe(self) -> Result<(MqttSubscription, mpsc::Receiver<NewDataPoint>)> {
        let config = self.config;

        tracing::info!(
            collection_id = %config.collection_id,
            "Initiating collection data stream for live data"
        );

        let client_id = format!("fathom-{}", config.collection_id);
        let mut options = MqttOptions::new(client_id, config.host.clone(), config.port);
        options.set_credentials(config.collection_id.clone(), config.api_token.clone());
        options.set_keep_alive(config.keep_alive);
        options.set_transport(Transport::tls_with_default_config());

        let (client, mut event_loop) = AsyncClient::new(options, 64);
        let (tx, rx) = mpsc::channel(config.channel_capacity);

        let stopping = Arc::new(AtomicBool::new(false));
        let task_client = client.clone();
        let task_stopping = Arc::clone(&stopping);

        let task = tokio::spawn(async move {
            loop {
                match event_loop.poll().await {
                    Ok(Event::Incoming(Packet::ConnAck(_))) => {
                        tracing::info!("MQTT client connected");

                        // Subscribe on every connect so reconnects keep
                        // delivering without caller involvement.
                        if let Err(e) = task_client.subscribe("#", QoS::AtMostOnce).await {
                            return Err(Error::Transport(format!("subscribe failed: {e}")));
                        }
                    }
                    Ok(Event::Incoming(Packet::SubAck(_))) => {
                        tracing::info!("Successfully subscribed to # (everything)");
                    }
                    Ok(Event::Incoming(Packet::Publish(publish))) => {
                        match WireMessage::parse_json(&publish.payload) {
                            Ok(point) => {
                                tracing::debug!(
                                    topic = %publish.topic,
                                    received = %point.received,
                                    "Got stream message"
                                );
                                if tx.send(point).await.is_err() {
                                    // Consumer is gone; the session is over.
                                    tracing::info!("Data point channel closed, ending stream");
                                    return Ok(());
                                }
                            }
                            Err(e) => {
                                metrics::counter!("stream_parse_errors_total").increment(1);
                                tracing::warn!(
                                    topic = %publish.topic,
                                    "Skipping unparsable stream message: {}",
                                    e
                                );
                            }
                        }
                    }
                    Ok(Event::Incoming(Packet::Disconnect)) => {
                        if task_stopping.load(Ordering::SeqCst) {
                            return Ok(());
                        }
                        return Err(Error::Transport("broker sent DISCONNECT".to_string()));
                    }
                    Ok(_) => {}
                    Err(e) => {
                        if task_stopping.load(Ordering::SeqCst) {
                            // Error raised by our own graceful disconnect.
                            tracing::debug!("Event loop ended after disconnect: {}", e);
                            return Ok(());
                        }
                        if is_recoverable(&e) {
                            metrics::counter!("stream_reconnects_total").increment(1);
                            tracing::warn!("MQTT connection lost, reconnecting: {}", e);
                            tokio::time::sleep(RECONNECT_DELAY).await;
                            continue;
                        }
                        return Err(Error::Transport(e.to_string()));
                    }
                }
            }
        });

        Ok((
            MqttSubscription {
                client,
                task,
                stopping,
            },
            rx,
        ))
    }
}

impl Subscription for MqttSubscription {
    async fn close(self) -> Result<()> {
        self.stopping.store(true, Ordering::SeqCst);

        // A send failure just means the event loop is already gone.
        if let Err(e) = self.client.disconnect().await {
            tracing::debug!("Disconnect on already-closed connection: {}", e);
        }

        let mut task = self.task;
        match tokio::time::timeout(CLOSE_TIMEOUT, &mut task).await {
            Ok(Ok(result)) => result,
            Ok(Err(join_err)) => Err(Error::Transport(format!(
                "stream task failed: {join_err}"
            ))),
            Err(_) => {
                tracing::warn!("Stream task did not wind down in time, aborting");
                task.abort();
                Ok(())
            }
        }
    }
}

/// Whether polling again can reasonably bring the connection back.
fn is_recoverable(err: &ConnectionError) -> bool {
    matches!(
        err,
        ConnectionError::Io(_) | ConnectionError::NetworkTimeout | ConnectionError::FlushTimeout
    )
}
