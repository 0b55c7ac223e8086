//! Connection-owning engine task and its thread-safe publish handle
//!
//! All broker I/O happens inside one supervisor task spawned by
//! [`MqttEngine::start`]. Publish calls encode an envelope and hand it to
//! the supervisor through a bounded mpsc mailbox; delivery is QoS 0
//! fire-and-forget. The mailbox preserves FIFO order and reports overflow
//! as [`EngineError::MailboxFull`] instead of dropping frames silently.

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use rumqttc::v5::mqttbytes::QoS;
use rumqttc::v5::{AsyncClient, Event, EventLoop, MqttOptions};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::state::{
    can_publish, next_state, route_broker_event, BrokerEventRoute, EngineEvent, EngineState,
    RetryPolicy,
};
use super::EngineError;
use crate::envelope::{self, PublishEnvelope};
use crate::events::CloudEvents;

/// Engine parameters, copied from the service configuration at each
/// (re)start of the engine.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub broker_host: String,
    pub broker_port: u16,
    /// Base client id; a per-attempt timestamp suffix is appended to avoid
    /// broker-side session conflicts across reconnects.
    pub client_id: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub keepalive: Duration,
    pub subscribe_topic: String,
    pub subscribe_qos: QoS,
    pub default_publish_topic: String,
    pub mailbox_capacity: usize,
}

impl EngineConfig {
    fn validate(&self) -> Result<(), EngineError> {
        if self.broker_host.is_empty() {
            return Err(EngineError::Config("broker host must not be empty".into()));
        }
        if self.client_id.is_empty() {
            return Err(EngineError::Config("client id must not be empty".into()));
        }
        if self.subscribe_topic.is_empty() || self.default_publish_topic.is_empty() {
            return Err(EngineError::Config("topics must not be empty".into()));
        }
        if self.mailbox_capacity == 0 {
            return Err(EngineError::Config(
                "mailbox capacity must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

/// Build MQTT options for one connection attempt.
fn build_mqtt_options(config: &EngineConfig) -> MqttOptions {
    let timestamp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis();
    let client_id = format!("{}-{timestamp}", config.client_id);
    let mut options = MqttOptions::new(client_id, &config.broker_host, config.broker_port);
    options.set_keep_alive(config.keepalive);
    if let Some(username) = &config.username {
        options.set_credentials(username, config.password.clone().unwrap_or_default());
    }
    options
}

/// Resolve the publish topic for a decoded envelope (pure function).
fn resolve_topic(default_topic: &str, env: &PublishEnvelope) -> String {
    match (&env.topic, env.sub_channel) {
        (Some(suffix), true) => format!("{default_topic}/{suffix}"),
        (Some(topic), false) => topic.clone(),
        (None, _) => default_topic.to_string(),
    }
}

/// Cheap, cloneable publish/state handle. Callable from any task; every
/// method returns synchronously.
#[derive(Debug, Clone)]
pub struct EngineHandle {
    mailbox_tx: mpsc::Sender<Bytes>,
    state_rx: watch::Receiver<EngineState>,
}

impl EngineHandle {
    /// Current connection state (non-blocking read).
    pub fn state(&self) -> EngineState {
        *self.state_rx.borrow()
    }

    /// Watch channel for state transitions.
    pub fn watch_state(&self) -> watch::Receiver<EngineState> {
        self.state_rx.clone()
    }

    /// Publish to the default topic.
    pub fn publish(&self, payload: &[u8]) -> Result<(), EngineError> {
        self.send_frame(None, false, payload)
    }

    /// Publish to an explicit topic.
    pub fn publish_to(&self, topic: &str, payload: &[u8]) -> Result<(), EngineError> {
        self.send_frame(Some(topic), false, payload)
    }

    /// Publish to `<default topic>/<channel>`.
    pub fn publish_to_channel(&self, channel: &str, payload: &[u8]) -> Result<(), EngineError> {
        self.send_frame(Some(channel), true, payload)
    }

    fn send_frame(
        &self,
        topic: Option<&str>,
        sub_channel: bool,
        payload: &[u8],
    ) -> Result<(), EngineError> {
        let state = self.state();
        if !can_publish(state) {
            return Err(EngineError::NotConnected { state });
        }
        let frame = envelope::encode(topic, sub_channel, payload)?;
        self.mailbox_tx.try_send(frame).map_err(|e| match e {
            TrySendError::Full(_) => EngineError::MailboxFull,
            TrySendError::Closed(_) => EngineError::Stopped,
        })
    }
}

/// The engine instance. Owns the supervisor task; dropping it aborts the
/// task, but callers should prefer [`MqttEngine::stop`] for a clean join.
pub struct MqttEngine {
    config: EngineConfig,
    retry: RetryPolicy,
    events: Arc<dyn CloudEvents>,
    handle: EngineHandle,
    mailbox_rx: Option<mpsc::Receiver<Bytes>>,
    state_tx: Option<watch::Sender<EngineState>>,
    shutdown_tx: watch::Sender<bool>,
    task: Option<JoinHandle<()>>,
}

impl MqttEngine {
    /// Create an engine. Fails with a configuration error if the broker
    /// host or client id is empty.
    pub fn new(config: EngineConfig, events: Arc<dyn CloudEvents>) -> Result<Self, EngineError> {
        config.validate()?;
        let (mailbox_tx, mailbox_rx) = mpsc::channel(config.mailbox_capacity);
        let (state_tx, state_rx) = watch::channel(EngineState::Disconnected);
        let (shutdown_tx, _) = watch::channel(false);
        Ok(Self {
            config,
            retry: RetryPolicy::default(),
            events,
            handle: EngineHandle {
                mailbox_tx,
                state_rx,
            },
            mailbox_rx: Some(mailbox_rx),
            state_tx: Some(state_tx),
            shutdown_tx,
            task: None,
        })
    }

    /// Override the retry backoff policy.
    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Publish/state handle, cloneable across tasks.
    pub fn handle(&self) -> EngineHandle {
        self.handle.clone()
    }

    /// Current connection state.
    pub fn state(&self) -> EngineState {
        self.handle.state()
    }

    /// Spawn the supervisor task and return immediately.
    pub fn start(&mut self) -> Result<(), EngineError> {
        let mailbox_rx = self.mailbox_rx.take().ok_or(EngineError::AlreadyStarted)?;
        let state_tx = self.state_tx.take().ok_or(EngineError::AlreadyStarted)?;
        let supervisor = Supervisor {
            config: self.config.clone(),
            retry: self.retry.clone(),
            events: self.events.clone(),
            mailbox_rx,
            state_tx,
            shutdown_rx: self.shutdown_tx.subscribe(),
        };
        self.task = Some(tokio::spawn(supervisor.run()));
        Ok(())
    }

    /// Cooperative stop: signal the supervisor and join it. The signal is
    /// observed at the retry-loop head and after every blocking call.
    pub async fn stop(&mut self) {
        let _ = self.shutdown_tx.send(true);
        if let Some(task) = self.task.take() {
            join_with_timeout(task, Duration::from_secs(2), "engine task").await;
        }
    }
}

impl Drop for MqttEngine {
    fn drop(&mut self) {
        let _ = self.shutdown_tx.send(true);
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

/// Why one connection's serve loop ended.
enum ConnectionOutcome {
    /// Stop was requested; shut down cleanly.
    Stop,
    /// Every handle was dropped; nothing can publish anymore.
    HandleClosed,
    /// The connection failed; retry after backoff.
    Lost(String),
}

/// State owned exclusively by the engine task.
struct Supervisor {
    config: EngineConfig,
    retry: RetryPolicy,
    events: Arc<dyn CloudEvents>,
    mailbox_rx: mpsc::Receiver<Bytes>,
    state_tx: watch::Sender<EngineState>,
    shutdown_rx: watch::Receiver<bool>,
}

impl Supervisor {
    async fn run(mut self) {
        info!(
            broker = %self.config.broker_host,
            port = self.config.broker_port,
            client_id = %self.config.client_id,
            "mqtt engine started"
        );

        loop {
            if *self.shutdown_rx.borrow() {
                break;
            }
            self.apply(&EngineEvent::AttemptStarted);

            let options = build_mqtt_options(&self.config);
            let (client, mut event_loop) = AsyncClient::new(options, 10);

            match self.serve_connection(&client, &mut event_loop).await {
                ConnectionOutcome::Stop => {
                    let _ = client.disconnect().await;
                    break;
                }
                ConnectionOutcome::HandleClosed => {
                    debug!("all engine handles dropped; stopping");
                    break;
                }
                ConnectionOutcome::Lost(reason) => {
                    let delay = self.retry.delay_after_failure(*self.state_tx.borrow());
                    warn!(%reason, ?delay, "broker connection lost; retrying");
                    self.apply(&EngineEvent::ConnectionLost(reason));
                    if !interruptible_sleep(&mut self.shutdown_rx, delay).await {
                        break;
                    }
                }
            }
        }

        self.state_tx.send_replace(EngineState::Disconnected);
        info!("mqtt engine stopped");
    }

    /// Serve one connection until it fails, every handle goes away, or a
    /// stop is requested. The mailbox is only drained while connected, so a
    /// frame accepted under a stale state check waits for the next session
    /// rather than being lost.
    async fn serve_connection(
        &mut self,
        client: &AsyncClient,
        event_loop: &mut EventLoop,
    ) -> ConnectionOutcome {
        loop {
            let connected = can_publish(*self.state_tx.borrow());
            tokio::select! {
                changed = self.shutdown_rx.changed() => {
                    if changed.is_err() || *self.shutdown_rx.borrow() {
                        return ConnectionOutcome::Stop;
                    }
                }
                frame = self.mailbox_rx.recv(), if connected => {
                    match frame {
                        Some(frame) => self.deliver(client, &frame).await,
                        None => return ConnectionOutcome::HandleClosed,
                    }
                }
                event = event_loop.poll() => {
                    match event {
                        Ok(event) => {
                            if let Some(outcome) = self.handle_broker_event(client, &event).await {
                                return outcome;
                            }
                        }
                        Err(e) => return ConnectionOutcome::Lost(e.to_string()),
                    }
                }
            }
        }
    }

    async fn handle_broker_event(
        &self,
        client: &AsyncClient,
        event: &Event,
    ) -> Option<ConnectionOutcome> {
        // Any successful poll proves the socket phase completed.
        self.apply(&EngineEvent::SocketConnected);

        match route_broker_event(event) {
            BrokerEventRoute::ConnectionAcknowledged => {
                self.apply(&EngineEvent::ConnAck);
                if let Err(e) = client
                    .subscribe(self.config.subscribe_topic.clone(), self.config.subscribe_qos)
                    .await
                {
                    return Some(ConnectionOutcome::Lost(format!("subscribe failed: {e}")));
                }
                None
            }
            BrokerEventRoute::SubscriptionConfirmed => {
                info!(topic = %self.config.subscribe_topic, "subscribed");
                self.apply(&EngineEvent::SubAck);
                None
            }
            BrokerEventRoute::MessageReceived { topic, payload } => {
                debug!(topic = %topic, len = payload.len(), "message received");
                self.events.on_message(&topic, &payload);
                None
            }
            BrokerEventRoute::Disconnected => {
                Some(ConnectionOutcome::Lost("broker disconnected".into()))
            }
            BrokerEventRoute::Infrastructure => None,
        }
    }

    /// Decode one mailbox frame and publish it. A malformed frame aborts
    /// only that frame; a publish failure is logged and the session keeps
    /// running until the event loop reports the error.
    async fn deliver(&self, client: &AsyncClient, frame: &[u8]) {
        let env = match envelope::decode(frame) {
            Ok(env) => env,
            Err(e) => {
                error!(error = %e, "dropping malformed mailbox frame");
                return;
            }
        };
        let topic = resolve_topic(&self.config.default_publish_topic, &env);
        if let Err(e) = client
            .publish(topic.clone(), QoS::AtMostOnce, false, env.payload)
            .await
        {
            warn!(topic = %topic, error = %e, "publish failed");
        }
    }

    fn apply(&self, event: &EngineEvent) {
        let current = *self.state_tx.borrow();
        let next = next_state(current, event);
        if next != current {
            debug!(?current, ?next, "engine state transition");
            self.state_tx.send_replace(next);
        }
    }
}

/// Join a background task, aborting it if it does not finish within
/// `wait`. The abort is awaited so the task's destructors have run by the
/// time this returns.
pub(crate) async fn join_with_timeout(mut task: JoinHandle<()>, wait: Duration, what: &str) {
    match tokio::time::timeout(wait, &mut task).await {
        Ok(Ok(())) => info!(task = what, "task joined"),
        Ok(Err(e)) if !e.is_cancelled() => warn!(task = what, error = %e, "task panicked"),
        Err(_) => {
            warn!(task = what, "task did not stop in time; aborting");
            task.abort();
            let _ = task.await;
        }
        _ => {}
    }
}

/// Sleep that a stop request can interrupt. Returns false when the engine
/// should shut down.
async fn interruptible_sleep(shutdown_rx: &mut watch::Receiver<bool>, delay: Duration) -> bool {
    tokio::select! {
        changed = shutdown_rx.changed() => changed.is_ok() && !*shutdown_rx.borrow(),
        _ = tokio::time::sleep(delay) => true,
    }
}
