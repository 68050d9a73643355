//! Public API Façade: the crate's entry point. Wires
//! together Storage, Transport, Publisher/Subscriber, the Offline Queue,
//! and the Command Processor behind the method set a host application
//! calls directly — this is an in-process library, not a client dialing a
//! remote server.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use log::{info, warn};
use tokio::sync::watch;
use uuid::Uuid;

use crate::command::{CommandProcessor, BULK_TIMEOUT, SINGLE_KEY_TIMEOUT};
use crate::config::Config;
use crate::error::{Error, Result};
use crate::lifecycle::{self, LifecycleParams, PowerState};
use crate::model::{Command, CommandOp, ConnectionState, Response, ResponseValue};
use crate::offline_queue::{NullPersistence, OfflineQueue, SledPersistence};
use crate::replication::{Publisher, Subscriber};
use crate::storage::{MemoryEngine, PersistentEngine, StorageEngine};
use crate::topic::TopicScheme;
use crate::transport::{Transport, TransportEvent, TransportHandle};

/// A running MerkleKV-Mobile node. Construct with [`MerkleKv::new`],
/// call [`connect`](Self::connect) to bring the MQTT transport up, then use
/// the key-value methods directly.
///
/// ```rust,no_run
/// # use merklekv_mobile::{Config, MerkleKv};
/// # async fn run() -> merklekv_mobile::error::Result<()> {
/// let config = Config::default_for_node("node-a");
/// let mut node = MerkleKv::new(config)?;
/// node.connect().await?;
/// node.set(None, "user:1".into(), "alice".into()).await?;
/// let value = node.get(None, "user:1".into()).await?;
/// node.disconnect().await?;
/// # let _ = value;
/// # Ok(())
/// # }
/// ```
pub struct MerkleKv {
    config: Config,
    storage: Arc<dyn StorageEngine>,
    processor: Arc<CommandProcessor>,
    publisher: Arc<Publisher>,
    subscriber: Arc<Subscriber>,
    offline_queue: Arc<OfflineQueue>,
    topics: TopicScheme,
    /// Always present: a disconnected throwaway handle until `connect()`
    /// replaces it with a real one, so Publisher construction never needs
    /// an `Option`.
    handle: TransportHandle,
    connected_transport: bool,
    /// Tuning derived from the last known device power state; read by
    /// `connect()` and the offline-queue drain loop.
    lifecycle: Arc<RwLock<LifecycleParams>>,
}

impl MerkleKv {
    pub fn new(config: Config) -> Result<Self> {
        let storage: Arc<dyn StorageEngine> = if config.persistence_enabled {
            let path = config
                .storage_path
                .as_deref()
                .ok_or_else(|| Error::validation("persistence_enabled requires storage_path"))?;
            Arc::new(PersistentEngine::open(path)?)
        } else {
            Arc::new(MemoryEngine::new())
        };

        let topics = TopicScheme::new(config.topic_prefix.clone(), config.client_id.clone())?;

        let offline_queue = Arc::new(OfflineQueue::with_limits(
            Box::new(NullPersistence),
            config.offline_queue.max_operations,
            config.offline_queue.max_age_seconds * 1000,
            config.offline_queue.batch_size,
            config.offline_queue.max_retries,
        )?);

        // Placeholder handle until `connect()` builds the real transport;
        // all publishes before `connect()` fall through to the offline
        // queue because its reported state is always `Disconnected`.
        let (_throwaway_transport, handle, _rx) = Transport::new(
            &config.client_id,
            &config.mqtt_host,
            config.mqtt_port,
            &topics.responses(),
            b"{\"status\":\"unavailable\"}".to_vec(),
            config.keep_alive_seconds,
            None,
        );

        let publisher = Arc::new(Publisher::new(
            config.node_id.clone(),
            handle,
            topics.clone(),
            offline_queue.clone(),
        ));
        let subscriber = Arc::new(Subscriber::new(storage.clone(), config.node_id.clone()));
        let processor = Arc::new(CommandProcessor::new(storage.clone(), publisher.clone(), config.node_id.clone()));

        Ok(Self {
            config,
            storage,
            processor,
            publisher,
            subscriber,
            offline_queue,
            topics,
            handle,
            connected_transport: false,
            lifecycle: Arc::new(RwLock::new(lifecycle::derive(
                PowerState {
                    battery_level: 1.0,
                    charging: false,
                    power_save: false,
                    low_power: false,
                },
                critical_threshold_fraction(&config.battery_config),
            ))),
        })
    }

    /// Recomputes transport/offline-queue tuning from a device power-state
    /// snapshot and applies it at the next reconnect and
    /// queue-drain idle boundary. `BatteryConfig`'s opt-out flags pin the
    /// corresponding parameter at its configured baseline instead, and its
    /// `critical_threshold` sets the battery level below which tuning
    /// switches to the critical tier.
    pub fn apply_power_state(&mut self, power: PowerState) -> LifecycleParams {
        let battery = &self.config.battery_config;
        let mut params = lifecycle::derive(power, critical_threshold_fraction(battery));
        if !battery.adaptive_keep_alive {
            params.keep_alive_seconds = self.config.keep_alive_seconds;
        }
        if !battery.throttle {
            params.max_concurrent_operations = u32::MAX;
        }
        if !battery.reduce_background {
            params.defer_non_critical_requests = false;
        }
        self.config.keep_alive_seconds = params.keep_alive_seconds;
        *self.lifecycle.write().unwrap() = params;
        params
    }

    /// The tuning currently in effect.
    pub fn lifecycle_params(&self) -> LifecycleParams {
        *self.lifecycle.read().unwrap()
    }

    /// Uses a sled-backed offline queue sharing the persistent storage
    /// engine's database: one `sled::Db`, two named trees. Call before
    /// [`connect`](Self::connect).
    pub fn with_persistent_queue(mut self, db: &sled::Db) -> Result<Self> {
        let persistence = SledPersistence::new(db)?;
        self.offline_queue = Arc::new(OfflineQueue::with_limits(
            Box::new(persistence),
            self.config.offline_queue.max_operations,
            self.config.offline_queue.max_age_seconds * 1000,
            self.config.offline_queue.batch_size,
            self.config.offline_queue.max_retries,
        )?);
        self.publisher = Arc::new(Publisher::new(
            self.config.node_id.clone(),
            self.handle.clone(),
            self.topics.clone(),
            self.offline_queue.clone(),
        ));
        self.processor = Arc::new(CommandProcessor::new(
            self.storage.clone(),
            self.publisher.clone(),
            self.config.node_id.clone(),
        ));
        Ok(self)
    }

    /// Brings the MQTT transport up: builds the real `Transport`, spawns
    /// its eventloop, (re-)subscribes to the command and replication
    /// topics, and starts the background tasks that drain the offline
    /// queue on reconnection and process inbound commands/replication
    /// events. Subscriptions are re-established idempotently on every
    /// `connected` transition by the event-processing loop
    /// below reacting to `TransportEvent::StateChanged`.
    pub async fn connect(&mut self) -> Result<()> {
        let will_payload = serde_json::to_vec(&serde_json::json!({"status": "unavailable"}))
            .expect("static JSON payload always serializes");
        let credentials = match (&self.config.username, &self.config.password) {
            (Some(u), Some(p)) => Some((u.clone(), p.clone())),
            _ => None,
        };
        self.config.check_security(|msg| warn!("{msg}"));

        let (transport, handle, mut events_rx) = Transport::new(
            &self.config.client_id,
            &self.config.mqtt_host,
            self.config.mqtt_port,
            &self.topics.responses(),
            will_payload,
            self.config.keep_alive_seconds,
            credentials,
        );

        self.publisher = Arc::new(Publisher::new(
            self.config.node_id.clone(),
            handle.clone(),
            self.topics.clone(),
            self.offline_queue.clone(),
        ));
        self.processor = Arc::new(CommandProcessor::new(
            self.storage.clone(),
            self.publisher.clone(),
            self.config.node_id.clone(),
        ));
        self.handle = handle.clone();
        self.connected_transport = true;

        tokio::spawn(transport.run());

        let topics = self.topics.clone();
        let subscriber = self.subscriber.clone();
        let processor = self.processor.clone();
        let offline_queue = self.offline_queue.clone();
        let publisher = self.publisher.clone();
        let handle_for_loop = handle.clone();
        let lifecycle = self.lifecycle.clone();

        tokio::spawn(async move {
            loop {
                match events_rx.recv().await {
                    Some(TransportEvent::StateChanged(ConnectionState::Connected)) => {
                        info!("transport connected, re-establishing subscriptions");
                        if let Err(e) = handle_for_loop.subscribe(&topics.commands()).await {
                            warn!("failed to subscribe to commands topic: {e}");
                        }
                        if let Err(e) = handle_for_loop.subscribe(&topics.replication_events()).await {
                            warn!("failed to subscribe to replication topic: {e}");
                        }
                        let defer_non_critical = lifecycle.read().unwrap().defer_non_critical_requests;
                        drain_offline_queue(&offline_queue, &publisher, defer_non_critical).await;
                    }
                    Some(TransportEvent::StateChanged(_)) => {}
                    Some(TransportEvent::Message { topic, payload }) => {
                        if topic == topics.replication_events() {
                            subscriber.apply(&payload);
                        } else if topic == topics.commands() {
                            handle_inbound_command(&processor, &handle_for_loop, &topics, &payload).await;
                        }
                    }
                    None => {
                        info!("transport event stream closed");
                        return;
                    }
                }
            }
        });

        Ok(())
    }

    pub async fn disconnect(&mut self) -> Result<()> {
        if self.connected_transport {
            self.handle.disconnect().await?;
        }
        Ok(())
    }

    /// An observable stream of `ConnectionState` transitions.
    pub fn connection_state(&self) -> watch::Receiver<ConnectionState> {
        self.handle.state_rx()
    }

    fn check_require_connected(&self) -> Result<()> {
        if self.config.require_connected && self.handle.state() != ConnectionState::Connected {
            return Err(Error::disconnected("require_connected is set and transport is not connected"));
        }
        Ok(())
    }

    pub async fn set(&self, id: Option<Uuid>, key: String, value: String) -> Result<Response> {
        self.check_require_connected()?;
        with_timeout(SINGLE_KEY_TIMEOUT, self.processor.set(id, key, value)).await
    }

    pub async fn get(&self, id: Option<Uuid>, key: String) -> Result<Response> {
        with_timeout(SINGLE_KEY_TIMEOUT, self.processor.get(id, key)).await
    }

    pub async fn delete(&self, id: Option<Uuid>, key: String) -> Result<Response> {
        self.check_require_connected()?;
        with_timeout(SINGLE_KEY_TIMEOUT, self.processor.delete(id, key)).await
    }

    pub async fn increment(&self, id: Option<Uuid>, key: String, amount: Option<i64>) -> Result<Response> {
        self.check_require_connected()?;
        with_timeout(SINGLE_KEY_TIMEOUT, self.processor.increment(id, key, amount)).await
    }

    pub async fn decrement(&self, id: Option<Uuid>, key: String, amount: Option<i64>) -> Result<Response> {
        self.check_require_connected()?;
        with_timeout(SINGLE_KEY_TIMEOUT, self.processor.decrement(id, key, amount)).await
    }

    pub async fn append(&self, id: Option<Uuid>, key: String, value: String) -> Result<Response> {
        self.check_require_connected()?;
        with_timeout(SINGLE_KEY_TIMEOUT, self.processor.append(id, key, value)).await
    }

    pub async fn prepend(&self, id: Option<Uuid>, key: String, value: String) -> Result<Response> {
        self.check_require_connected()?;
        with_timeout(SINGLE_KEY_TIMEOUT, self.processor.prepend(id, key, value)).await
    }

    pub async fn get_multiple(&self, id: Option<Uuid>, keys: Vec<String>) -> Result<Response> {
        with_timeout(BULK_TIMEOUT, self.processor.mget(id, keys)).await
    }

    pub async fn set_multiple(&self, id: Option<Uuid>, kvs: HashMap<String, String>) -> Result<Response> {
        self.check_require_connected()?;
        with_timeout(BULK_TIMEOUT, self.processor.mset(id, kvs)).await
    }
}

fn critical_threshold_fraction(battery: &crate::config::BatteryConfig) -> f32 {
    battery.critical_threshold as f32 / 100.0
}

async fn with_timeout(duration: std::time::Duration, fut: impl std::future::Future<Output = Result<Response>>) -> Result<Response> {
    tokio::time::timeout(duration, fut)
        .await
        .unwrap_or_else(|_| Err(Error::timeout("command exceeded its deadline")))
}

async fn drain_offline_queue(queue: &Arc<OfflineQueue>, publisher: &Arc<Publisher>, defer_non_critical: bool) {
    loop {
        let batch = if defer_non_critical { queue.drain_high_priority_batch() } else { queue.drain_batch() };
        if batch.is_empty() {
            return;
        }
        for op in batch {
            match publisher.publish_encoded(op.command_bytes.clone()).await {
                Ok(()) => queue.report_success(),
                Err(e) => queue.report_failure(op, e.to_string()),
            }
        }
    }
}

async fn handle_inbound_command(
    processor: &Arc<CommandProcessor>,
    transport: &TransportHandle,
    topics: &TopicScheme,
    payload: &[u8],
) {
    let command: Command = match serde_json::from_slice(payload) {
        Ok(cmd) => cmd,
        Err(e) => {
            warn!("dropping malformed inbound command: {e}");
            return;
        }
    };

    let response = dispatch_command(processor, command).await;
    let encoded = match serde_json::to_vec(&response) {
        Ok(bytes) => bytes,
        Err(e) => {
            warn!("failed to serialize response: {e}");
            return;
        }
    };
    let request = crate::transport::PublishRequest { topic: topics.responses(), payload: encoded };
    if let Err(e) = transport.publish(request).await {
        warn!("failed to publish response: {e}");
    }
}

async fn dispatch_command(processor: &Arc<CommandProcessor>, command: Command) -> Response {
    let id = command.id;
    let missing_key = || Error::validation("command requires a key");
    match command.op {
        CommandOp::Set => match (command.key, command.value) {
            (Some(key), Some(value)) => processor.set(id, key, value).await,
            _ => Ok(Response::err(id.unwrap_or_else(Uuid::new_v4), &missing_key())),
        },
        CommandOp::Get => match command.key {
            Some(key) => processor.get(id, key).await,
            None => Ok(Response::err(id.unwrap_or_else(Uuid::new_v4), &missing_key())),
        },
        CommandOp::Delete => match command.key {
            Some(key) => processor.delete(id, key).await,
            None => Ok(Response::err(id.unwrap_or_else(Uuid::new_v4), &missing_key())),
        },
        CommandOp::Incr => match command.key {
            Some(key) => processor.increment(id, key, command.amount).await,
            None => Ok(Response::err(id.unwrap_or_else(Uuid::new_v4), &missing_key())),
        },
        CommandOp::Decr => match command.key {
            Some(key) => processor.decrement(id, key, command.amount).await,
            None => Ok(Response::err(id.unwrap_or_else(Uuid::new_v4), &missing_key())),
        },
        CommandOp::Append => match (command.key, command.value) {
            (Some(key), Some(value)) => processor.append(id, key, value).await,
            _ => Ok(Response::err(id.unwrap_or_else(Uuid::new_v4), &missing_key())),
        },
        CommandOp::Prepend => match (command.key, command.value) {
            (Some(key), Some(value)) => processor.prepend(id, key, value).await,
            _ => Ok(Response::err(id.unwrap_or_else(Uuid::new_v4), &missing_key())),
        },
        CommandOp::MGet => match command.keys {
            Some(keys) => processor.mget(id, keys).await,
            None => Ok(Response::err(id.unwrap_or_else(Uuid::new_v4), &missing_key())),
        },
        CommandOp::MSet => match command.kvs {
            Some(kvs) => processor.mset(id, kvs).await,
            None => Ok(Response::err(id.unwrap_or_else(Uuid::new_v4), &missing_key())),
        },
    }
    .unwrap_or_else(|e| Response::err(id.unwrap_or_else(Uuid::new_v4), &e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn new_node_starts_disconnected() {
        let config = Config::default_for_node("node-a");
        let node = MerkleKv::new(config).unwrap();
        assert_eq!(node.connection_state().borrow().clone(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn set_and_get_round_trip_without_connecting() {
        let config = Config::default_for_node("node-a");
        let node = MerkleKv::new(config).unwrap();
        node.set(None, "k".into(), "v".into()).await.unwrap();
        let resp = node.get(None, "k".into()).await.unwrap();
        match resp.value {
            Some(ResponseValue::Str(s)) => assert_eq!(s, "v"),
            other => panic!("unexpected response: {other:?}"),
        }
    }

    #[tokio::test]
    async fn apply_power_state_updates_keep_alive_and_defer_flag() {
        let config = Config::default_for_node("node-a");
        let mut node = MerkleKv::new(config).unwrap();
        assert!(!node.lifecycle_params().defer_non_critical_requests);

        let params = node.apply_power_state(PowerState {
            battery_level: 0.05,
            charging: false,
            power_save: true,
            low_power: true,
        });
        assert!(params.defer_non_critical_requests);
        assert_eq!(node.lifecycle_params(), params);
        assert_eq!(node.config.keep_alive_seconds, params.keep_alive_seconds);
    }

    #[tokio::test]
    async fn configured_critical_threshold_changes_when_tuning_kicks_in() {
        let mut config = Config::default_for_node("node-a");
        config.battery_config.critical_threshold = 20;
        let mut node = MerkleKv::new(config).unwrap();

        let power = PowerState { battery_level: 0.15, charging: false, power_save: false, low_power: false };
        let params = node.apply_power_state(power);
        assert!(params.defer_non_critical_requests);
        assert_eq!(params.max_concurrent_operations, 2);
    }

    #[tokio::test]
    async fn require_connected_blocks_writes_before_connect() {
        let mut config = Config::default_for_node("node-a");
        config.require_connected = true;
        let node = MerkleKv::new(config).unwrap();
        let err = node.set(None, "k".into(), "v".into()).await.unwrap_err();
        assert_eq!(err.code(), "DISCONNECTED");
    }
}
