use crate::close::CloseReason;
use crate::config::{GatewayConfig, ShardInformation};
use crate::dispatch::DispatchEvent;
use crate::error::Error;
use crate::handler::{GatewayHandler, ShardDelegate};
use crate::metrics::Metrics;
use crate::payload::GatewayCommand;
use crate::session::ShardState;
use crate::shard::{ShardCommand, ShardHandle, ShardRunner};
use futures_util::FutureExt;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::ops::Range;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Default command channel buffer size per shard
const DEFAULT_CHANNEL_SIZE: usize = 100;

/// Owns the shards of one account and presents them as a single connection.
///
/// The application is told it is connected once every shard has a session,
/// and disconnected once every shard has lost its connection.
///
/// # Thread Safety
///
/// `ShardManager` is `Send + Sync`. Shard bookkeeping lives under one
/// `parking_lot::Mutex` that shard callbacks and lifecycle operations share;
/// `connect`, `disconnect` and `manually_shatter` are additionally serialized
/// by an async lifecycle lock.
pub struct ShardManager<H: GatewayHandler> {
    inner: Arc<ManagerInner<H>>,
    /// Serializes connect/disconnect/shatter across await points
    lifecycle_lock: tokio::sync::Mutex<()>,
}

pub(crate) struct ManagerInner<H: GatewayHandler> {
    handler: H,
    config: Arc<GatewayConfig>,
    metrics: Arc<Metrics>,
    state: Mutex<ManagerState>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ShardStatus {
    /// Not yet reported anything this cycle
    Pending,
    Connected,
    Disconnected { closed: bool },
}

struct ManagerState {
    info: ShardInformation,
    shards: BTreeMap<u32, ShardHandle>,
    status: BTreeMap<u32, ShardStatus>,
    tasks: Vec<JoinHandle<()>>,
    /// Set by `disconnect`, cleared by `connect`
    closed: bool,
    signaled_connected: bool,
    signaled_disconnected: bool,
    /// A disconnect with `closed == true` has reached the handler this cycle
    signaled_closed: bool,
}

impl ManagerState {
    fn reset_status(&mut self) {
        self.status = self
            .info
            .shard_ids()
            .map(|id| (id, ShardStatus::Pending))
            .collect();
        self.signaled_connected = false;
        self.signaled_disconnected = false;
        self.signaled_closed = false;
    }

    fn all_connected(&self) -> bool {
        !self.status.is_empty() && self.status.values().all(|s| *s == ShardStatus::Connected)
    }

    fn connected_count(&self) -> usize {
        self.status
            .values()
            .filter(|s| **s == ShardStatus::Connected)
            .count()
    }
}

impl<H: GatewayHandler> ShardManager<H> {
    /// Create a manager for the shards named by `config`. Nothing connects
    /// until [`connect`](Self::connect).
    pub fn new(config: GatewayConfig, handler: H) -> Self {
        Self::with_metrics(config, handler, Arc::new(Metrics::new()))
    }

    /// Like [`new`](Self::new), recording into shared metrics
    pub fn with_metrics(config: GatewayConfig, handler: H, metrics: Arc<Metrics>) -> Self {
        let info = config.shard_information();
        let mut state = ManagerState {
            info,
            shards: BTreeMap::new(),
            status: BTreeMap::new(),
            tasks: Vec::new(),
            closed: true,
            signaled_connected: false,
            signaled_disconnected: false,
            signaled_closed: false,
        };
        state.reset_status();

        Self {
            inner: Arc::new(ManagerInner {
                handler,
                config: Arc::new(config),
                metrics,
                state: Mutex::new(state),
            }),
            lifecycle_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// Get the metrics for this manager
    pub fn metrics(&self) -> Arc<Metrics> {
        self.inner.metrics.clone()
    }

    /// Get a reference to the handler
    pub fn handler(&self) -> &H {
        &self.inner.handler
    }

    /// The shard range and total currently managed
    pub fn shard_information(&self) -> ShardInformation {
        self.inner.state.lock().info.clone()
    }

    /// Number of shards managed
    pub fn shard_count(&self) -> usize {
        self.inner.state.lock().info.len()
    }

    /// State of shard `shard_id`, if it is running
    pub fn shard_state(&self, shard_id: u32) -> Option<ShardState> {
        self.inner.state.lock().shards.get(&shard_id).map(|s| s.state())
    }

    /// Whether every shard has an established session
    pub fn is_connected(&self) -> bool {
        let state = self.inner.state.lock();
        !state.closed && state.all_connected()
    }

    /// Connect every shard.
    ///
    /// Shard `i` of the range starts `identify_stagger * i` after this call,
    /// so identifies reach the server one at a time. Returns once the shard
    /// tasks are spawned.
    pub async fn connect(&self) -> Result<(), Error> {
        let _lifecycle_guard = self.lifecycle_lock.lock().await;

        let mut state = self.inner.state.lock();
        if !state.closed {
            warn!("ShardManager already connected");
            return Ok(());
        }

        let stagger = self.inner.config.connection.identify_stagger;
        let total = state.info.total();
        info!(
            "Connecting shards {:?} of {} ({:?} apart)",
            state.info.range(),
            total,
            stagger
        );

        state.closed = false;
        state.reset_status();

        let ids: Vec<u32> = state.info.shard_ids().collect();
        for (i, shard_id) in ids.into_iter().enumerate() {
            let (runner, handle) = ShardRunner::new(
                shard_id,
                total,
                Arc::downgrade(&self.inner),
                self.inner.config.clone(),
                self.inner.metrics.clone(),
                stagger * i as u32,
                DEFAULT_CHANNEL_SIZE,
            );
            let weak = Arc::downgrade(&self.inner);
            let task = tokio::spawn(run_shard_with_recovery(shard_id, runner, weak));
            state.shards.insert(shard_id, handle);
            state.tasks.push(task);
            self.inner.metrics.update_shard(shard_id, |s| {
                s.state = ShardState::Disconnected;
                s.is_connected = false;
            });
        }

        Ok(())
    }

    /// Disconnect every shard and wait for their tasks to finish.
    ///
    /// If not every shard is connected and the handler has not yet been told
    /// the set is closed, it receives one `on_disconnect(Normal, true)`
    /// immediately.
    pub async fn disconnect(&self) {
        let _lifecycle_guard = self.lifecycle_lock.lock().await;

        let (shards, tasks, synthesize) = {
            let mut state = self.inner.state.lock();
            if state.closed {
                return;
            }
            state.closed = true;

            let synthesize = !state.all_connected() && !state.signaled_closed;
            if synthesize {
                state.signaled_disconnected = true;
                state.signaled_connected = false;
                state.signaled_closed = true;
            }
            let shards: Vec<ShardHandle> = std::mem::take(&mut state.shards).into_values().collect();
            (shards, std::mem::take(&mut state.tasks), synthesize)
        };

        info!("Disconnecting {} shards", shards.len());

        for shard in shards {
            if shard.command_tx.send(ShardCommand::Close).await.is_err() {
                debug!("[SHARD-{}] Already stopped", shard.id);
            }
        }

        if synthesize {
            self.inner
                .handler
                .on_disconnect(CloseReason::Normal, true)
                .await;
        }

        for task in tasks {
            let _ = task.await;
        }

        info!("ShardManager disconnected");
    }

    /// Replace the shard set with one shard per index in `range`, out of
    /// `total` shards for the whole account.
    ///
    /// For splitting an account across processes. Running shards are
    /// disconnected first; call [`connect`](Self::connect) afterwards.
    pub async fn manually_shatter(&self, range: Range<u32>, total: u32) -> Result<(), Error> {
        let info = ShardInformation::new(range, total)?;
        debug!("Handling shard range {:?} of {}", info.range(), info.total());

        self.disconnect().await;

        let _lifecycle_guard = self.lifecycle_lock.lock().await;
        let mut state = self.inner.state.lock();
        state.info = info;
        state.shards.clear();
        state.reset_status();
        self.inner.metrics.clear_shards();
        Ok(())
    }

    /// Send a gateway command on shard `shard_id`
    pub async fn send_command(&self, shard_id: u32, command: GatewayCommand) -> Result<(), Error> {
        let tx = self.command_sender(shard_id)?;
        tx.send(ShardCommand::Send(command))
            .await
            .map_err(|e| Error::ChannelSend(e.to_string()))
    }

    /// Close shard `shard_id` resumably and reconnect it
    pub async fn reconnect_shard(&self, shard_id: u32) -> Result<(), Error> {
        let tx = self.command_sender(shard_id)?;
        tx.send(ShardCommand::Reconnect)
            .await
            .map_err(|e| Error::ChannelSend(e.to_string()))
    }

    fn command_sender(
        &self,
        shard_id: u32,
    ) -> Result<tokio::sync::mpsc::Sender<ShardCommand>, Error> {
        let state = self.inner.state.lock();
        if state.closed {
            return Err(Error::ShuttingDown);
        }
        state
            .shards
            .get(&shard_id)
            .map(|s| s.command_tx.clone())
            .ok_or(Error::UnknownShard(shard_id))
    }
}

impl<H: GatewayHandler> Drop for ShardManager<H> {
    fn drop(&mut self) {
        // Abort shard tasks so none outlive the manager
        let tasks = std::mem::take(&mut self.inner.state.lock().tasks);
        for task in tasks {
            task.abort();
        }
    }
}

/// Run a shard, reporting a panic as a final disconnect
async fn run_shard_with_recovery<H: GatewayHandler>(
    shard_id: u32,
    runner: ShardRunner<ManagerInner<H>>,
    manager: Weak<ManagerInner<H>>,
) {
    match AssertUnwindSafe(runner.run()).catch_unwind().await {
        Ok(Ok(())) => {
            debug!("[SHARD-{}] Shard task completed normally", shard_id);
        }
        Ok(Err(e)) => {
            warn!("[SHARD-{}] Shard task ended with error: {}", shard_id, e);
        }
        Err(panic_err) => {
            let panic_msg = if let Some(s) = panic_err.downcast_ref::<&str>() {
                s.to_string()
            } else if let Some(s) = panic_err.downcast_ref::<String>() {
                s.clone()
            } else {
                "Unknown panic".to_string()
            };
            error!("[SHARD-{}] Shard task PANICKED: {}", shard_id, panic_msg);
            if let Some(manager) = manager.upgrade() {
                manager.metrics.record_error();
                manager
                    .shard_did_disconnect(shard_id, CloseReason::Unknown, true)
                    .await;
            }
        }
    }
}

impl<H: GatewayHandler> ShardDelegate for ManagerInner<H> {
    async fn shard_did_connect(&self, shard_id: u32, resumed: bool) {
        debug!("[SHARD-{}] Connected (resumed={})", shard_id, resumed);

        let notify = {
            let mut state = self.state.lock();
            match state.status.get_mut(&shard_id) {
                Some(status) => *status = ShardStatus::Connected,
                None => return,
            }
            if state.all_connected() && !state.signaled_connected && !state.closed {
                state.signaled_connected = true;
                state.signaled_disconnected = false;
                state.signaled_closed = false;
                true
            } else {
                false
            }
        };

        if notify {
            info!("All shards connected");
            self.handler.on_connect(true).await;
        }
    }

    async fn shard_did_disconnect(&self, shard_id: u32, reason: CloseReason, closed: bool) {
        debug!(
            "[SHARD-{}] Disconnected: {} (closed={})",
            shard_id, reason, closed
        );

        let notify = {
            let mut state = self.state.lock();
            match state.status.get_mut(&shard_id) {
                Some(status) => *status = ShardStatus::Disconnected { closed },
                None => return,
            }
            let all_disconnected = state
                .status
                .values()
                .all(|s| matches!(s, ShardStatus::Disconnected { .. }));
            let all_closed = state
                .status
                .values()
                .all(|s| *s == ShardStatus::Disconnected { closed: true });
            // A set already reported as dropped is reported again once it is closed for good
            if all_disconnected
                && (!state.signaled_disconnected || (all_closed && !state.signaled_closed))
            {
                state.signaled_disconnected = true;
                state.signaled_connected = false;
                state.signaled_closed |= all_closed;
                Some(all_closed)
            } else {
                debug!(
                    "{} of {} shards still connected",
                    state.connected_count(),
                    state.status.len()
                );
                None
            }
        };

        if let Some(all_closed) = notify {
            info!("All shards disconnected ({})", reason);
            self.handler.on_disconnect(reason, all_closed).await;
        }
    }

    async fn shard_should_attempt_resuming(
        &self,
        _shard_id: u32,
        reason: CloseReason,
        closed: bool,
    ) -> bool {
        let closed_by_owner = self.state.lock().closed;
        if closed_by_owner {
            return false;
        }
        self.handler.should_attempt_resuming(reason, closed).await
    }

    async fn shard_did_receive_event(&self, shard_id: u32, event: DispatchEvent) {
        match event {
            DispatchEvent::Unhandled { name, data } => {
                self.handler.on_unhandled_event(shard_id, &name, &data).await
            }
            event => self.handler.on_event(shard_id, event).await,
        }
    }

    async fn shard_got_hello(&self, shard_id: u32, heartbeat_interval: Duration) {
        self.handler.on_hello(shard_id, heartbeat_interval).await;
    }
}
