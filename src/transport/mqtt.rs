use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use log::{error, info, warn};
use rumqttc::{AsyncClient, Event, EventLoop, LastWill, MqttOptions, Packet, QoS};
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};
use crate::model::ConnectionState;

use super::backoff_duration;

/// A publish handed from the Publisher to the Transport. Retained as a
/// plain data type (rather than folded straight into `TransportHandle`)
/// since the Publisher logs/queues these before the handle accepts them.
#[derive(Debug, Clone)]
pub struct PublishRequest {
    pub topic: String,
    pub payload: Vec<u8>,
}

/// Events the Transport emits to subscribers: inbound broker messages and
/// connection state transitions.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    Message { topic: String, payload: Vec<u8> },
    StateChanged(ConnectionState),
}

/// Cheaply cloneable front door used by Publisher/Subscriber/API code. The
/// heavy eventloop-polling task lives behind `Transport::run`.
#[derive(Clone)]
pub struct TransportHandle {
    client: AsyncClient,
    state_rx: watch::Receiver<ConnectionState>,
    cancel: CancellationToken,
}

impl TransportHandle {
    pub fn state(&self) -> ConnectionState {
        *self.state_rx.borrow()
    }

    pub fn state_rx(&self) -> watch::Receiver<ConnectionState> {
        self.state_rx.clone()
    }

    /// Publishes with QoS=1, retain=false. Fails with
    /// `ErrorKind::Disconnected` immediately rather than blocking — callers
    /// that want at-least-once delivery while offline must go through the
    /// Offline Queue instead.
    pub async fn publish(&self, request: PublishRequest) -> Result<()> {
        if self.state() != ConnectionState::Connected {
            return Err(Error::disconnected(format!(
                "cannot publish to {}: transport not connected",
                request.topic
            )));
        }
        self.client
            .publish(&request.topic, QoS::AtLeastOnce, false, request.payload)
            .await
            .map_err(|e| Error::transport(format!("publish to {} failed: {e}", request.topic)))
    }

    pub async fn subscribe(&self, topic: &str) -> Result<()> {
        self.client
            .subscribe(topic, QoS::AtLeastOnce)
            .await
            .map_err(|e| Error::transport(format!("subscribe to {topic} failed: {e}")))
    }

    /// Cancels pending backoff sleeps and stops the eventloop task.
    pub async fn disconnect(&self) -> Result<()> {
        self.cancel.cancel();
        self.client
            .disconnect()
            .await
            .map_err(|e| Error::transport(format!("disconnect failed: {e}")))
    }
}

/// Owns the `rumqttc` client/eventloop pair and drives the connection
/// state machine: `disconnected -> connecting -> connected -> (reconnecting
/// | disconnected|suspended)`.
pub struct Transport {
    eventloop: EventLoop,
    state_tx: watch::Sender<ConnectionState>,
    events_tx: mpsc::Sender<TransportEvent>,
    cancel: CancellationToken,
    reconnect_attempt: Arc<AtomicU32>,
}

impl Transport {
    /// Builds a Transport and its cheaply-cloneable handle. Configures Last
    /// Will on the responses topic so peers observe ungraceful loss, and
    /// sets keep-alive from `keep_alive_seconds` (lifecycle-adapter
    /// derived).
    pub fn new(
        client_id: &str,
        host: &str,
        port: u16,
        will_topic: &str,
        will_payload: Vec<u8>,
        keep_alive_seconds: u32,
        credentials: Option<(String, String)>,
    ) -> (Self, TransportHandle, mpsc::Receiver<TransportEvent>) {
        let mut opts = MqttOptions::new(client_id, host, port);
        opts.set_keep_alive(Duration::from_secs(keep_alive_seconds as u64));
        opts.set_last_will(LastWill::new(will_topic, will_payload, QoS::AtLeastOnce, false));
        if let Some((user, pass)) = credentials {
            opts.set_credentials(user, pass);
        }

        let (client, eventloop) = AsyncClient::new(opts, 64);
        let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);
        let (events_tx, events_rx) = mpsc::channel(256);
        let cancel = CancellationToken::new();

        let handle = TransportHandle { client, state_rx, cancel: cancel.clone() };
        let transport = Self {
            eventloop,
            state_tx,
            events_tx,
            cancel,
            reconnect_attempt: Arc::new(AtomicU32::new(0)),
        };
        (transport, handle, events_rx)
    }

    fn set_state(&self, state: ConnectionState) {
        let _ = self.state_tx.send(state);
        let _ = self.events_tx.try_send(TransportEvent::StateChanged(state));
    }

    /// Drives the eventloop until `disconnect()` cancels it. Intended to be
    /// spawned as a background task; reconnection backoff uses full jitter
    /// (base 1s, cap 60s) and is itself cancellable.
    pub async fn run(mut self) {
        self.set_state(ConnectionState::Connecting);
        let mut rng = rand::thread_rng();

        loop {
            if self.cancel.is_cancelled() {
                self.set_state(ConnectionState::Disconnected);
                return;
            }

            tokio::select! {
                _ = self.cancel.cancelled() => {
                    self.set_state(ConnectionState::Disconnected);
                    return;
                }
                poll_result = self.eventloop.poll() => {
                    match poll_result {
                        Ok(Event::Incoming(Packet::ConnAck(_))) => {
                            self.reconnect_attempt.store(0, Ordering::SeqCst);
                            self.set_state(ConnectionState::Connected);
                        }
                        Ok(Event::Incoming(Packet::Publish(publish))) => {
                            let event = TransportEvent::Message {
                                topic: publish.topic.clone(),
                                payload: publish.payload.to_vec(),
                            };
                            if self.events_tx.send(event).await.is_err() {
                                warn!("transport event receiver dropped, stopping");
                                return;
                            }
                        }
                        Ok(_other) => {
                            // Other broker acks (PubAck, SubAck, PingResp, ...) need no action.
                        }
                        Err(e) => {
                            error!("mqtt eventloop error: {e}");
                            self.set_state(ConnectionState::Reconnecting);
                            let attempt = self.reconnect_attempt.fetch_add(1, Ordering::SeqCst);
                            let delay = backoff_duration(attempt, &mut rng);
                            info!("reconnecting in {delay:?} (attempt {attempt})");
                            tokio::select! {
                                _ = tokio::time::sleep(delay) => {}
                                _ = self.cancel.cancelled() => {
                                    self.set_state(ConnectionState::Disconnected);
                                    return;
                                }
                            }
                        }
                    }
                }
            }
        }
    }
}
