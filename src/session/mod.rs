//! Cloud session manager
//!
//! [`CloudService`] is the top-level state machine: it waits for the
//! network link, activates the device against the backend, then starts the
//! MQTT engine and tracks its connection state. One background task owns
//! the whole lifecycle; the service struct itself only exposes synchronous
//! publish/status accessors and the OTA entry points.

mod status;

pub(crate) use status::SharedStatus;
pub use status::{ServiceStatus, SessionState};

use std::sync::{Arc, Mutex};
use std::time::Duration;

use rumqttc::v5::mqttbytes::QoS;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::activation::{
    derive_device_token, ActivationClient, ActivationError, DeviceAuthRequest, RomVersionInfo,
};
use crate::config::{ConfigError, ServiceConfig};
use crate::engine::{
    join_with_timeout, EngineConfig, EngineError, EngineHandle, EngineState, MqttEngine,
};
use crate::events::CloudEvents;
use crate::ota::{FirmwareSink, OtaDownloader, OtaError, OtaOutcome};
use crate::store::{DeviceRecord, DeviceStore, StoreError};

#[derive(Debug, Error)]
pub enum SessionError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("service already running")]
    AlreadyRunning,
    #[error("no active session (state: {state:?})")]
    NotConnected { state: SessionState },
    #[error(transparent)]
    Engine(#[from] EngineError),
    #[error(transparent)]
    Activation(#[from] ActivationError),
    #[error(transparent)]
    Ota(#[from] OtaError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Topic the broker pushes messages to this device on.
fn subscribe_topic(device_id: &str) -> String {
    format!("{device_id}/in")
}

/// Default topic this device publishes on.
fn publish_topic(device_id: &str) -> String {
    format!("{device_id}/out")
}

fn qos_from_level(level: u8) -> QoS {
    match level {
        1 => QoS::AtLeastOnce,
        2 => QoS::ExactlyOnce,
        _ => QoS::AtMostOnce,
    }
}

/// Session state implied by an engine state, given whether this connection
/// cycle already reached the broker once. `None` means no change: during
/// the initial connect the session stays Started.
fn map_engine_state(engine: EngineState, was_connected: bool) -> Option<SessionState> {
    match engine {
        EngineState::Connected => Some(SessionState::Connected),
        _ if was_connected => Some(SessionState::Disconnected),
        _ => None,
    }
}

/// Top-level cloud connectivity service.
///
/// Construction validates the configuration and seeds the status record
/// from the device store; [`CloudService::start`] spawns the session task.
pub struct CloudService {
    config: ServiceConfig,
    status: SharedStatus,
    events: Arc<dyn CloudEvents>,
    store: Arc<dyn DeviceStore>,
    network_up: watch::Receiver<bool>,
    engine_handle: Arc<Mutex<Option<EngineHandle>>>,
    shutdown_tx: watch::Sender<bool>,
    task: Option<JoinHandle<()>>,
}

impl CloudService {
    /// Create a stopped service. `network_up` reports link availability;
    /// flip it to `false` and back to force a full reconnect cycle.
    pub fn new(
        config: ServiceConfig,
        store: Arc<dyn DeviceStore>,
        events: Arc<dyn CloudEvents>,
        network_up: watch::Receiver<bool>,
    ) -> Result<Self, SessionError> {
        config.validate()?;
        let record = store.load()?;

        let initial = ServiceStatus {
            activated: record.activated,
            device_id: record.device_id,
            device_key: record.device_key,
            rom_version: if record.rom_version.is_empty() {
                config.device.rom_version.clone()
            } else {
                record.rom_version
            },
            ..ServiceStatus::default()
        };

        let (shutdown_tx, _) = watch::channel(false);
        Ok(Self {
            config,
            status: SharedStatus::new(initial),
            events,
            store,
            network_up,
            engine_handle: Arc::new(Mutex::new(None)),
            shutdown_tx,
            task: None,
        })
    }

    /// Spawn the session task and return immediately.
    pub fn start(&mut self) -> Result<(), SessionError> {
        if self.task.is_some() {
            return Err(SessionError::AlreadyRunning);
        }
        let task = SessionTask {
            config: self.config.clone(),
            status: self.status.clone(),
            events: self.events.clone(),
            store: self.store.clone(),
            network_up: self.network_up.clone(),
            engine_slot: self.engine_handle.clone(),
            shutdown_rx: self.shutdown_tx.subscribe(),
        };
        self.task = Some(tokio::spawn(task.run()));
        Ok(())
    }

    /// Signal the session task and join it.
    pub async fn stop(&mut self) {
        let _ = self.shutdown_tx.send(true);
        if let Some(task) = self.task.take() {
            join_with_timeout(task, Duration::from_secs(5), "session task").await;
        }
        if self.status.set_state(SessionState::Stopped) {
            self.events.on_status_changed(SessionState::Stopped);
        }
    }

    pub fn state(&self) -> SessionState {
        self.status.state()
    }

    /// Snapshot of the full status record.
    pub fn status(&self) -> ServiceStatus {
        self.status.snapshot()
    }

    /// Publish to the device's default topic.
    pub fn publish(&self, payload: &[u8]) -> Result<(), SessionError> {
        self.with_engine(|engine| engine.publish(payload))
    }

    /// Publish to an explicit topic.
    pub fn publish_to(&self, topic: &str, payload: &[u8]) -> Result<(), SessionError> {
        self.with_engine(|engine| engine.publish_to(topic, payload))
    }

    /// Publish to `<default topic>/<channel>`.
    pub fn publish_to_channel(&self, channel: &str, payload: &[u8]) -> Result<(), SessionError> {
        self.with_engine(|engine| engine.publish_to_channel(channel, payload))
    }

    fn with_engine(
        &self,
        f: impl FnOnce(&EngineHandle) -> Result<(), EngineError>,
    ) -> Result<(), SessionError> {
        let guard = self
            .engine_handle
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        let Some(engine) = guard.as_ref() else {
            return Err(SessionError::NotConnected {
                state: self.status.state(),
            });
        };
        f(engine).map_err(|e| match e {
            EngineError::NotConnected { .. } => SessionError::NotConnected {
                state: self.status.state(),
            },
            other => SessionError::Engine(other),
        })
    }

    /// Ask the backend for the latest published firmware. Records the
    /// descriptor in the status and returns it only when its version
    /// differs from the installed one.
    pub async fn check_update(&self) -> Result<Option<RomVersionInfo>, SessionError> {
        let client = ActivationClient::new(&self.config.cloud.base_url)?;
        let info = client.latest_rom_version().await?;
        let installed = {
            let status = self.status.snapshot();
            status.rom_version
        };
        self.status.update(|s| s.latest_rom = Some(info.clone()));
        if info.version == installed {
            debug!(version = %info.version, "firmware already current");
            return Ok(None);
        }
        info!(installed = %installed, available = %info.version, "firmware update available");
        Ok(Some(info))
    }

    /// Download and validate the firmware described by `info`, committing
    /// it into `sink`. On success the installed version is persisted.
    pub async fn apply_update(
        &self,
        info: &RomVersionInfo,
        sink: &mut dyn FirmwareSink,
    ) -> Result<OtaOutcome, SessionError> {
        let outcome = OtaDownloader::default()
            .download(&info.bin_file, &info.bin_md5, sink)
            .await?;
        if let OtaOutcome::Updated { .. } = outcome {
            self.status.update(|s| s.rom_version = info.version.clone());
            let status = self.status.snapshot();
            let record = DeviceRecord {
                activated: status.activated,
                device_id: status.device_id,
                device_key: status.device_key,
                rom_version: status.rom_version,
            };
            self.store.save(&record)?;
        }
        Ok(outcome)
    }
}

impl Drop for CloudService {
    fn drop(&mut self) {
        let _ = self.shutdown_tx.send(true);
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

/// Why the activation loop ended.
enum ActivationOutcome {
    Ready,
    Stopped,
    GaveUp,
}

/// Why one engine monitoring loop ended.
enum MonitorOutcome {
    Stop,
    LinkDown,
}

/// State owned exclusively by the session task.
struct SessionTask {
    config: ServiceConfig,
    status: SharedStatus,
    events: Arc<dyn CloudEvents>,
    store: Arc<dyn DeviceStore>,
    network_up: watch::Receiver<bool>,
    engine_slot: Arc<Mutex<Option<EngineHandle>>>,
    shutdown_rx: watch::Receiver<bool>,
}

impl SessionTask {
    async fn run(mut self) {
        info!("cloud service started");
        self.set_state(SessionState::Started);

        loop {
            if self.stop_requested() {
                break;
            }
            self.set_state(SessionState::Started);

            if !self.wait_network_up().await {
                break;
            }

            match self.ensure_activated().await {
                ActivationOutcome::Ready => {}
                ActivationOutcome::Stopped => break,
                ActivationOutcome::GaveUp => {
                    error!("giving up on activation");
                    break;
                }
            }

            let device_id = self.status.snapshot().device_id;
            let mut engine =
                match MqttEngine::new(self.engine_config(&device_id), self.events.clone()) {
                    Ok(engine) => engine,
                    Err(e) => {
                        error!(error = %e, "engine configuration rejected");
                        break;
                    }
                };
            if let Err(e) = engine.start() {
                error!(error = %e, "engine failed to start");
                break;
            }
            self.put_engine(Some(engine.handle()));

            let outcome = self.monitor(engine.handle().watch_state()).await;
            self.put_engine(None);
            engine.stop().await;

            match outcome {
                MonitorOutcome::Stop => break,
                MonitorOutcome::LinkDown => {
                    self.set_state(SessionState::Disconnected);
                    // Loop back to the network wait and rebuild the session
                }
            }
        }

        self.put_engine(None);
        self.set_state(SessionState::Stopped);
        info!("cloud service stopped");
    }

    /// Block until the network link is up. Returns false on stop. A closed
    /// link watch degrades to pure polling rather than ending the session.
    async fn wait_network_up(&mut self) -> bool {
        let poll = self.config.session.network_poll();
        loop {
            if self.stop_requested() {
                return false;
            }
            if *self.network_up.borrow() {
                return true;
            }
            tokio::select! {
                changed = self.shutdown_rx.changed() => {
                    if changed.is_err() {
                        return false;
                    }
                }
                changed = self.network_up.changed() => {
                    if changed.is_err() {
                        tokio::time::sleep(poll).await;
                    }
                }
                _ = tokio::time::sleep(poll) => {}
            }
        }
    }

    /// Run the activation loop until the device holds credentials. Retries
    /// at a fixed interval, forever unless a cap is configured. The store
    /// write happens exactly once, on the successful attempt.
    async fn ensure_activated(&mut self) -> ActivationOutcome {
        if self.status.snapshot().activated {
            return ActivationOutcome::Ready;
        }

        let client = match ActivationClient::new(&self.config.cloud.base_url) {
            Ok(client) => client,
            Err(e) => {
                error!(error = %e, "backend url rejected");
                return ActivationOutcome::GaveUp;
            }
        };
        let request = DeviceAuthRequest {
            product_id: self.config.device.product_id.clone(),
            bssid: self.config.device.bssid.clone(),
            device_token: derive_device_token(
                &self.config.device.bssid,
                &self.config.device.product_key,
            ),
            user_token: self.config.device.user_token.clone(),
        };

        let mut attempts = 0u32;
        loop {
            if self.stop_requested() {
                return ActivationOutcome::Stopped;
            }
            attempts += 1;
            match client.activate(&request).await {
                Ok(credentials) => {
                    info!(device_id = %credentials.device_id, attempts, "device activated");
                    self.status.update(|s| {
                        s.activated = true;
                        s.device_id = credentials.device_id.clone();
                        s.device_key = credentials.device_key.clone();
                    });
                    let record = DeviceRecord {
                        activated: true,
                        device_id: credentials.device_id,
                        device_key: credentials.device_key,
                        rom_version: self.status.snapshot().rom_version,
                    };
                    if let Err(e) = self.store.save(&record) {
                        // Credentials survive in memory; next boot re-activates
                        warn!(error = %e, "failed to persist device identity");
                    }
                    return ActivationOutcome::Ready;
                }
                Err(e) => {
                    if let Some(max) = self.config.session.activation_max_attempts {
                        if attempts >= max {
                            error!(attempts, error = %e, "activation attempt cap reached");
                            return ActivationOutcome::GaveUp;
                        }
                    }
                    warn!(attempt = attempts, error = %e, "activation failed; retrying");
                    if !self
                        .sleep_interruptible(self.config.session.activation_retry())
                        .await
                    {
                        return ActivationOutcome::Stopped;
                    }
                }
            }
        }
    }

    /// Track the running engine until stop or link loss, mirroring its
    /// connection state into the session state. State changes arrive over
    /// the watch channel; the poll interval only bounds how stale a missed
    /// wakeup can get. Takes the state receiver rather than the engine so
    /// tests can drive it directly.
    async fn monitor(&mut self, mut engine_state: watch::Receiver<EngineState>) -> MonitorOutcome {
        let mut was_connected = false;
        let mut network_closed = false;

        loop {
            if self.stop_requested() {
                return MonitorOutcome::Stop;
            }
            if !*self.network_up.borrow() {
                info!("network link down; tearing down session");
                return MonitorOutcome::LinkDown;
            }

            let state = *engine_state.borrow();
            if let Some(session_state) = map_engine_state(state, was_connected) {
                if session_state == SessionState::Connected {
                    was_connected = true;
                }
                self.set_state(session_state);
            }

            tokio::select! {
                changed = self.shutdown_rx.changed() => {
                    if changed.is_err() {
                        return MonitorOutcome::Stop;
                    }
                }
                changed = self.network_up.changed(), if !network_closed => {
                    if changed.is_err() {
                        network_closed = true;
                    }
                }
                changed = engine_state.changed() => {
                    if changed.is_err() {
                        // Engine task is gone; rebuild the whole session
                        return MonitorOutcome::LinkDown;
                    }
                }
                _ = tokio::time::sleep(self.config.session.status_poll()) => {}
            }
        }
    }

    fn engine_config(&self, device_id: &str) -> EngineConfig {
        EngineConfig {
            broker_host: self.config.broker.host.clone(),
            broker_port: self.config.broker.port,
            client_id: device_id.to_string(),
            username: self.config.broker.username.clone(),
            password: self.config.broker.password.clone(),
            keepalive: self.config.broker.keepalive(),
            subscribe_topic: subscribe_topic(device_id),
            subscribe_qos: qos_from_level(self.config.broker.subscribe_qos),
            default_publish_topic: publish_topic(device_id),
            mailbox_capacity: self.config.session.mailbox_capacity,
        }
    }

    fn put_engine(&self, handle: Option<EngineHandle>) {
        *self
            .engine_slot
            .lock()
            .unwrap_or_else(|e| e.into_inner()) = handle;
    }

    fn set_state(&self, state: SessionState) {
        if self.status.set_state(state) {
            info!(?state, "session state changed");
            self.events.on_status_changed(state);
        }
    }

    fn stop_requested(&self) -> bool {
        *self.shutdown_rx.borrow()
    }

    /// Sleep that a stop request interrupts. Returns false on stop.
    async fn sleep_interruptible(&mut self, delay: Duration) -> bool {
        tokio::select! {
            changed = self.shutdown_rx.changed() => changed.is_ok() && !*self.shutdown_rx.borrow(),
            _ = tokio::time::sleep(delay) => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::mocks::{MemoryStore, RecordingEvents};

    fn test_config() -> ServiceConfig {
        toml::from_str(
            r#"
                [cloud]
                base_url = "http://api.example.io"

                [device]
                bssid = "c8:93:46:00:00:01"
                product_id = "prod-1"
                product_key = "secret-key"
                rom_version = "1.0.0"

                [broker]
                host = "broker.example.io"
            "#,
        )
        .unwrap()
    }

    fn service_parts() -> (Arc<MemoryStore>, Arc<RecordingEvents>, watch::Sender<bool>) {
        let (network_tx, _) = watch::channel(false);
        (
            Arc::new(MemoryStore::default()),
            Arc::new(RecordingEvents::default()),
            network_tx,
        )
    }

    #[test]
    fn derived_topics() {
        assert_eq!(subscribe_topic("dev-1"), "dev-1/in");
        assert_eq!(publish_topic("dev-1"), "dev-1/out");
    }

    #[test]
    fn qos_levels_map_with_fallback() {
        assert_eq!(qos_from_level(0), QoS::AtMostOnce);
        assert_eq!(qos_from_level(1), QoS::AtLeastOnce);
        assert_eq!(qos_from_level(2), QoS::ExactlyOnce);
        assert_eq!(qos_from_level(9), QoS::AtMostOnce);
    }

    #[test]
    fn engine_state_mapping() {
        use EngineState::*;
        assert_eq!(
            map_engine_state(Connected, false),
            Some(SessionState::Connected)
        );
        assert_eq!(
            map_engine_state(Connected, true),
            Some(SessionState::Connected)
        );
        // Still dialing for the first time: no transition yet
        assert_eq!(map_engine_state(ConnectingSocket, false), None);
        assert_eq!(map_engine_state(Subscribing, false), None);
        // Once the broker was reached, any regression reads as a drop
        assert_eq!(
            map_engine_state(Disconnected, true),
            Some(SessionState::Disconnected)
        );
        assert_eq!(
            map_engine_state(ConnectingProtocol, true),
            Some(SessionState::Disconnected)
        );
    }

    #[test]
    fn new_service_seeds_status_from_store() {
        let (store, events, network_tx) = service_parts();
        store.put(DeviceRecord {
            activated: true,
            device_id: "dev-9".into(),
            device_key: "key-9".into(),
            rom_version: "2.0.0".into(),
        });

        let service =
            CloudService::new(test_config(), store, events, network_tx.subscribe()).unwrap();
        let status = service.status();
        assert!(status.activated);
        assert_eq!(status.device_id, "dev-9");
        assert_eq!(status.rom_version, "2.0.0");
        assert_eq!(status.state, SessionState::Stopped);
    }

    #[test]
    fn empty_stored_version_falls_back_to_build_version() {
        let (store, events, network_tx) = service_parts();
        let service =
            CloudService::new(test_config(), store, events, network_tx.subscribe()).unwrap();
        assert_eq!(service.status().rom_version, "1.0.0");
    }

    #[test]
    fn publish_before_start_is_a_state_error() {
        let (store, events, network_tx) = service_parts();
        let service =
            CloudService::new(test_config(), store, events, network_tx.subscribe()).unwrap();
        assert!(matches!(
            service.publish(b"hello"),
            Err(SessionError::NotConnected {
                state: SessionState::Stopped
            })
        ));
    }

    #[tokio::test]
    async fn start_twice_is_rejected() {
        let (store, events, network_tx) = service_parts();
        let mut service =
            CloudService::new(test_config(), store, events, network_tx.subscribe()).unwrap();
        service.start().unwrap();
        assert!(matches!(service.start(), Err(SessionError::AlreadyRunning)));
        service.stop().await;
    }

    async fn wait_for_state(status: &SharedStatus, want: SessionState, bound: Duration) {
        tokio::time::timeout(bound, async {
            while status.state() != want {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap_or_else(|_| panic!("state did not reach {want:?} within {bound:?}"));
    }

    #[tokio::test]
    async fn monitor_mirrors_engine_state_within_poll_bound() {
        let events = Arc::new(RecordingEvents::default());
        let status = SharedStatus::new(ServiceStatus::default());
        let (network_tx, network_rx) = watch::channel(true);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (engine_tx, engine_rx) = watch::channel(EngineState::Disconnected);

        let config = test_config();
        let poll_bound = config.session.status_poll();
        let mut task = SessionTask {
            config,
            status: status.clone(),
            events: events.clone(),
            store: Arc::new(MemoryStore::default()),
            network_up: network_rx,
            engine_slot: Arc::new(Mutex::new(None)),
            shutdown_rx,
        };
        let monitor = tokio::spawn(async move { task.monitor(engine_rx).await });

        // The session must mirror the engine within one poll interval
        engine_tx.send_replace(EngineState::Connected);
        wait_for_state(&status, SessionState::Connected, poll_bound).await;

        engine_tx.send_replace(EngineState::Disconnected);
        wait_for_state(&status, SessionState::Disconnected, poll_bound).await;

        shutdown_tx.send_replace(true);
        let outcome = tokio::time::timeout(Duration::from_secs(1), monitor)
            .await
            .expect("monitor did not observe stop")
            .unwrap();
        assert!(matches!(outcome, MonitorOutcome::Stop));
        assert_eq!(
            events.states(),
            vec![SessionState::Connected, SessionState::Disconnected]
        );
        drop(network_tx);
    }

    #[tokio::test]
    async fn monitor_tears_down_on_link_loss() {
        let events = Arc::new(RecordingEvents::default());
        let status = SharedStatus::new(ServiceStatus::default());
        let (network_tx, network_rx) = watch::channel(true);
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        let (engine_tx, engine_rx) = watch::channel(EngineState::Connected);

        let mut task = SessionTask {
            config: test_config(),
            status: status.clone(),
            events: events.clone(),
            store: Arc::new(MemoryStore::default()),
            network_up: network_rx,
            engine_slot: Arc::new(Mutex::new(None)),
            shutdown_rx,
        };
        let monitor = tokio::spawn(async move { task.monitor(engine_rx).await });
        wait_for_state(&status, SessionState::Connected, Duration::from_secs(3)).await;

        network_tx.send_replace(false);
        let outcome = tokio::time::timeout(Duration::from_secs(1), monitor)
            .await
            .expect("monitor did not observe link loss")
            .unwrap();
        assert!(matches!(outcome, MonitorOutcome::LinkDown));
        drop(engine_tx);
    }

    #[tokio::test]
    async fn stop_interrupts_the_network_wait() {
        let (store, events, network_tx) = service_parts();
        // Link stays down so the task sits in the network wait
        let mut service = CloudService::new(
            test_config(),
            store,
            events.clone(),
            network_tx.subscribe(),
        )
        .unwrap();

        service.start().unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        service.stop().await;

        assert_eq!(service.state(), SessionState::Stopped);
        let states = events.states();
        assert_eq!(states.first(), Some(&SessionState::Started));
        assert_eq!(states.last(), Some(&SessionState::Stopped));
    }
}
