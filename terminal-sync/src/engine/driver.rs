//! Tokio driver for [`SyncCore`]
//!
//! One task owns the core. It waits on consumer commands, transport events,
//! queued inbound frames, fetched snapshots and the core's next timer, feeds
//! whichever fires into the core, then executes the effects the core asked
//! for. Consumers talk to it through a cloneable [`SyncHandle`].

use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use terminal_core::{ConnectionState, TopicKey};
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::transport::{Transport, TransportEvent, TransportLink, TransportSink, WsTransport};
use super::{EngineStatus, Effect, SyncCore, SyncEvent};
use crate::clock::{Clock, SystemClock};
use crate::config::SyncConfig;
use crate::error::{SyncError, SyncResult};
use crate::inbound::InboundChannel;
use crate::multiplexer::Subscription;
use crate::snapshot::{EntitySnapshot, RestSnapshotClient, SnapshotError, SnapshotSource};
use crate::store::{Mutation, PendingMutation, Query, Selector};

/// Frames handed to the core per dispatch batch
const DISPATCH_BATCH: usize = 512;

/// Upper bound on an idle wait when no timer is armed
const IDLE_WAIT: Duration = Duration::from_secs(60);

const COMMAND_CAPACITY: usize = 256;
const EVENT_CAPACITY: usize = 1024;

enum Command {
    Acquire {
        topic: TopicKey,
        reply: oneshot::Sender<Subscription>,
    },
    Release(Subscription),
    Select {
        query: Query,
        reply: oneshot::Sender<Selector>,
    },
    Submit {
        mutation: Mutation,
        reply: oneshot::Sender<PendingMutation>,
    },
    Shutdown,
}

/// Consumer-facing handle to a running engine
#[derive(Clone)]
pub struct SyncHandle {
    commands: mpsc::Sender<Command>,
    events: broadcast::Sender<SyncEvent>,
    status: Arc<RwLock<EngineStatus>>,
}

impl SyncHandle {
    /// Subscribe to `topic`; shares the wire subscription with other consumers
    pub async fn acquire(&self, topic: TopicKey) -> SyncResult<Subscription> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Acquire { topic, reply }).await?;
        rx.await.map_err(|_| SyncError::EngineClosed)
    }

    /// Give up a subscription; releasing twice is harmless
    pub async fn release(&self, subscription: Subscription) -> SyncResult<()> {
        self.send(Command::Release(subscription)).await
    }

    /// Observe a slice of the store
    pub async fn select(&self, query: Query) -> SyncResult<Selector> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Select { query, reply }).await?;
        rx.await.map_err(|_| SyncError::EngineClosed)
    }

    /// Apply a mutation optimistically; await the returned handle for the outcome
    pub async fn submit(&self, mutation: Mutation) -> SyncResult<PendingMutation> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Submit { mutation, reply }).await?;
        rx.await.map_err(|_| SyncError::EngineClosed)
    }

    pub fn state(&self) -> ConnectionState {
        self.status.read().state
    }

    pub fn status(&self) -> EngineStatus {
        self.status.read().clone()
    }

    /// Listen for connection, topic and revert events
    pub fn events(&self) -> broadcast::Receiver<SyncEvent> {
        self.events.subscribe()
    }

    /// Stop the engine and close the connection
    pub async fn shutdown(&self) -> SyncResult<()> {
        self.send(Command::Shutdown).await
    }

    async fn send(&self, command: Command) -> SyncResult<()> {
        self.commands
            .send(command)
            .await
            .map_err(|_| SyncError::EngineClosed)
    }
}

/// Running sync engine
pub struct SyncEngine {
    handle: SyncHandle,
    task: JoinHandle<()>,
}

impl SyncEngine {
    /// Start with the WebSocket transport, the system clock and, when a
    /// snapshot URL is configured, the REST snapshot client
    pub fn start(config: SyncConfig) -> SyncResult<Self> {
        let snapshots: Option<Arc<dyn SnapshotSource>> = match &config.snapshot_url {
            Some(url) => Some(Arc::new(
                RestSnapshotClient::new(url.clone(), config.api_key.clone())
                    .map_err(|e| terminal_core::TerminalError::config(e.to_string()))?,
            )),
            None => None,
        };
        Ok(Self::start_with(
            config,
            Arc::new(SystemClock::new()),
            Arc::new(WsTransport),
            snapshots,
        ))
    }

    /// Start with explicit collaborators
    pub fn start_with(
        config: SyncConfig,
        clock: Arc<dyn Clock>,
        transport: Arc<dyn Transport>,
        snapshots: Option<Arc<dyn SnapshotSource>>,
    ) -> Self {
        let (command_tx, command_rx) = mpsc::channel(COMMAND_CAPACITY);
        let (event_tx, _) = broadcast::channel(EVENT_CAPACITY);
        let (transport_tx, transport_rx) = mpsc::channel(64);
        let (snapshot_tx, snapshot_rx) = mpsc::channel(64);
        let status = Arc::new(RwLock::new(EngineStatus::default()));

        let inbound = InboundChannel::new(config.inbound_capacity, config.coalesce_watermark);
        let driver = Driver {
            core: SyncCore::new(config, clock.clone()),
            clock,
            transport,
            snapshots,
            inbound,
            transport_tx,
            snapshot_tx,
            link: None,
            events: event_tx.clone(),
            status: status.clone(),
        };

        let task = tokio::spawn(driver.run(command_rx, transport_rx, snapshot_rx));
        info!("[Sync] Engine started");

        Self {
            handle: SyncHandle {
                commands: command_tx,
                events: event_tx,
                status,
            },
            task,
        }
    }

    pub fn handle(&self) -> SyncHandle {
        self.handle.clone()
    }

    /// Shut down and wait for the engine task to finish
    pub async fn stop(self) {
        let _ = self.handle.shutdown().await;
        if let Err(e) = self.task.await {
            warn!("[Sync] Engine task ended abnormally: {}", e);
        }
    }
}

type FetchedSnapshot = (TopicKey, Result<EntitySnapshot, SnapshotError>);

struct Driver {
    core: SyncCore,
    clock: Arc<dyn Clock>,
    transport: Arc<dyn Transport>,
    snapshots: Option<Arc<dyn SnapshotSource>>,
    inbound: InboundChannel,
    transport_tx: mpsc::Sender<TransportEvent>,
    snapshot_tx: mpsc::Sender<FetchedSnapshot>,
    link: Option<TransportLink>,
    events: broadcast::Sender<SyncEvent>,
    status: Arc<RwLock<EngineStatus>>,
}

impl Driver {
    async fn run(
        mut self,
        mut commands: mpsc::Receiver<Command>,
        mut transport_events: mpsc::Receiver<TransportEvent>,
        mut snapshots: mpsc::Receiver<FetchedSnapshot>,
    ) {
        self.core.connect();
        self.execute();

        loop {
            let wait = match self.core.next_deadline() {
                Some(at) => Duration::from_millis(at.saturating_sub(self.clock.now_ms())),
                None => IDLE_WAIT,
            };

            tokio::select! {
                command = commands.recv() => {
                    match command {
                        Some(Command::Shutdown) | None => break,
                        Some(command) => self.handle_command(command),
                    }
                }

                Some(event) = transport_events.recv() => {
                    match event {
                        TransportEvent::Opened { epoch } => self.core.on_transport_opened(epoch),
                        TransportEvent::Closed { epoch, reason } => {
                            self.core.on_transport_closed(epoch, &reason)
                        }
                    }
                }

                _ = self.inbound.readable() => {
                    let frames = self.inbound.drain(DISPATCH_BATCH);
                    self.core.on_frames(frames);
                }

                Some((topic, result)) = snapshots.recv() => {
                    self.core.on_snapshot_fetched(topic, result);
                }

                _ = tokio::time::sleep(wait) => {
                    self.core.on_timer();
                }
            }

            self.execute();
        }

        info!("[Sync] Engine shutting down");
        self.core.close();
        self.execute();
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::Acquire { topic, reply } => {
                let _ = reply.send(self.core.acquire(topic));
            }
            Command::Release(subscription) => self.core.release(&subscription),
            Command::Select { query, reply } => {
                let _ = reply.send(self.core.select(query));
            }
            Command::Submit { mutation, reply } => {
                let _ = reply.send(self.core.submit(mutation));
            }
            Command::Shutdown => {}
        }
    }

    /// Carry out everything the core asked for
    fn execute(&mut self) {
        for effect in self.core.take_effects() {
            match effect {
                Effect::Open { endpoint, epoch } => {
                    if let Some(old) = self.link.take() {
                        old.close();
                    }
                    let sink = TransportSink {
                        epoch,
                        inbound: self.inbound.clone(),
                        events: self.transport_tx.clone(),
                    };
                    self.link = Some(self.transport.open(endpoint, sink));
                }
                Effect::Close { epoch } => {
                    if self.link.as_ref().is_some_and(|link| link.epoch == epoch) {
                        if let Some(link) = self.link.take() {
                            link.close();
                        }
                    }
                }
                Effect::Send { epoch, request } => match &self.link {
                    Some(link) if link.epoch == epoch => {
                        link.send(request);
                    }
                    _ => debug!("[Sync] Request for closed epoch {} dropped", epoch),
                },
                Effect::FetchSnapshot { topic } => self.fetch_snapshot(topic),
                Effect::Publish(event) => {
                    // No listeners is fine
                    let _ = self.events.send(event);
                }
            }
        }
        *self.status.write() = self.core.status();
    }

    fn fetch_snapshot(&self, topic: TopicKey) {
        let Some(source) = self.snapshots.clone() else {
            return;
        };
        let tx = self.snapshot_tx.clone();
        tokio::spawn(async move {
            let result = source.fetch(&topic).await;
            let _ = tx.send((topic, result)).await;
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::Endpoint;
    use crate::store::Selection;
    use parking_lot::Mutex;
    use rust_decimal_macros::dec;
    use terminal_core::{ClientRequest, FieldValue};

    /// Transport that opens instantly and records what the engine sends
    #[derive(Default, Clone)]
    struct FakeTransport {
        sinks: Arc<Mutex<Vec<TransportSink>>>,
        sent: Arc<Mutex<Vec<ClientRequest>>>,
    }

    impl Transport for FakeTransport {
        fn open(&self, _endpoint: Endpoint, sink: TransportSink) -> TransportLink {
            let (tx, mut rx) = mpsc::channel(16);
            let epoch = sink.epoch;
            self.sinks.lock().push(sink.clone());
            let sent = self.sent.clone();
            tokio::spawn(async move {
                sink.opened().await;
                while let Some(request) = rx.recv().await {
                    sent.lock().push(request);
                }
            });
            TransportLink::new(epoch, tx)
        }
    }

    impl FakeTransport {
        async fn deliver(&self, text: &str) {
            let sink = self.sinks.lock().last().cloned().unwrap();
            sink.deliver_text(text).await;
        }
    }

    async fn wait_for<F: Fn() -> bool>(condition: F) {
        for _ in 0..200 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not met in time");
    }

    fn start(transport: &FakeTransport) -> SyncEngine {
        SyncEngine::start_with(
            SyncConfig::default(),
            Arc::new(SystemClock::new()),
            Arc::new(transport.clone()),
            None,
        )
    }

    #[tokio::test]
    async fn test_engine_connects_and_subscribes() {
        let transport = FakeTransport::default();
        let engine = start(&transport);
        let handle = engine.handle();

        wait_for(|| handle.state() == ConnectionState::Connected).await;
        let topic: TopicKey = "instrument:EURUSD".parse().unwrap();
        let _sub = handle.acquire(topic.clone()).await.unwrap();

        wait_for(|| !transport.sent.lock().is_empty()).await;
        assert_eq!(
            transport.sent.lock()[0],
            ClientRequest::Subscribe { topics: vec![topic] }
        );
        engine.stop().await;
    }

    #[tokio::test]
    async fn test_selector_sees_streamed_snapshot() {
        let transport = FakeTransport::default();
        let engine = start(&transport);
        let handle = engine.handle();
        wait_for(|| handle.state() == ConnectionState::Connected).await;

        let topic: TopicKey = "instrument:EURUSD".parse().unwrap();
        let _sub = handle.acquire(topic.clone()).await.unwrap();
        let mut selector = handle
            .select(Query::Field(topic.entity_key(), "price".to_string()))
            .await
            .unwrap();
        assert_eq!(selector.current(), Selection::Field(None));

        transport
            .deliver(r#"{"type":"snapshot","topic":"instrument:EURUSD","seq":10,"payload":{"price":100}}"#)
            .await;

        let selection = tokio::time::timeout(Duration::from_secs(1), selector.changed())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(selection, Selection::Field(Some(FieldValue::Number(dec!(100)))));
        engine.stop().await;
    }

    #[tokio::test]
    async fn test_handle_errors_after_stop() {
        let transport = FakeTransport::default();
        let engine = start(&transport);
        let handle = engine.handle();
        engine.stop().await;

        let result = handle.acquire("instrument:EURUSD".parse().unwrap()).await;
        assert_eq!(result.unwrap_err(), SyncError::EngineClosed);
    }
}
