use crate::close::CloseReason;
use crate::config::GatewayConfig;
use crate::connection::{self, WsStream};
use crate::error::Error;
use crate::handler::ShardDelegate;
use crate::heartbeat::{Beat, HeartbeatTracker};
use crate::metrics::Metrics;
use crate::payload::{GatewayCommand, GatewayEvent};
use crate::session::{Action, CloseOutcome, ShardMachine, ShardState};
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use parking_lot::RwLock;
use std::sync::{Arc, Weak};
use std::time::Instant as StdInstant;
use tokio::sync::mpsc;
use tokio::time::{sleep_until, Duration, Instant};
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, trace, warn};

/// Commands that can be sent to a running shard
#[derive(Debug)]
pub enum ShardCommand {
    /// Send a gateway command
    Send(GatewayCommand),
    /// Close resumably and reconnect
    Reconnect,
    /// Close for good
    Close,
}

/// The manager's side of a running shard
#[derive(Debug, Clone)]
pub(crate) struct ShardHandle {
    pub id: u32,
    pub command_tx: mpsc::Sender<ShardCommand>,
    pub state: Arc<RwLock<ShardState>>,
}

impl ShardHandle {
    pub fn state(&self) -> ShardState {
        *self.state.read()
    }
}

type WsSink = SplitSink<WsStream, Message>;

/// How a session loop ended
enum Flow {
    Continue,
    /// The socket is closed or closing; carries the observed reason
    Closed(CloseReason),
}

/// Runs one shard: connects, drives the session machine over the socket and
/// reconnects until told to stop.
pub(crate) struct ShardRunner<D: ShardDelegate> {
    shard_id: u32,
    delegate: Weak<D>,
    config: Arc<GatewayConfig>,
    machine: ShardMachine,
    heartbeat: HeartbeatTracker,
    metrics: Arc<Metrics>,
    command_rx: mpsc::Receiver<ShardCommand>,
    state: Arc<RwLock<ShardState>>,
    /// Wait before the first connect, so shards identify one at a time
    start_delay: Duration,
    /// Consecutive attempts that did not reach a session
    attempt: u32,
}

impl<D: ShardDelegate> ShardRunner<D> {
    /// Create a runner and the handle used to control it
    pub fn new(
        shard_id: u32,
        shard_count: u32,
        delegate: Weak<D>,
        config: Arc<GatewayConfig>,
        metrics: Arc<Metrics>,
        start_delay: Duration,
        channel_size: usize,
    ) -> (Self, ShardHandle) {
        let (command_tx, command_rx) = mpsc::channel(channel_size);
        let state = Arc::new(RwLock::new(ShardState::Disconnected));
        let runner = Self {
            shard_id,
            delegate,
            machine: ShardMachine::new(shard_id, shard_count, &config),
            heartbeat: HeartbeatTracker::new(config.heartbeat.clone()),
            config,
            metrics,
            command_rx,
            state: state.clone(),
            start_delay,
            attempt: 0,
        };
        let handle = ShardHandle {
            id: shard_id,
            command_tx,
            state,
        };
        (runner, handle)
    }

    /// Run the shard until it is closed or gives up
    pub async fn run(mut self) -> Result<(), Error> {
        if !self.start_delay.is_zero() {
            debug!("[SHARD-{}] Starting in {:?}", self.shard_id, self.start_delay);
            if !self.wait(self.start_delay).await {
                info!("[SHARD-{}] Closed before connecting", self.shard_id);
                return Ok(());
            }
        }

        loop {
            if self.attempt > 0 {
                let delay = self.config.backoff.delay_for_attempt(self.attempt - 1);
                debug!(
                    "[SHARD-{}] Reconnecting in {:?} (attempt {})",
                    self.shard_id,
                    delay,
                    self.attempt + 1
                );
                self.metrics
                    .update_shard(self.shard_id, |s| s.reconnect_attempt = self.attempt);
                if !self.wait(delay).await {
                    self.report_disconnect(CloseReason::Normal, true).await;
                    return Ok(());
                }
            }

            self.machine.begin_connect();
            self.publish_state();

            let url = match self.machine.session().and_then(|s| s.resume_url.clone()) {
                Some(resume_url) => self.config.connect_url_for(&resume_url),
                None => self.config.connect_url(),
            };
            debug!("[SHARD-{}] Connecting to {}", self.shard_id, url);

            let ws = match connection::connect(&url, self.config.connection.connect_timeout).await {
                Ok(ws) => ws,
                Err(e) => {
                    self.metrics.record_error();
                    let reason = self.machine.open_failed();
                    self.publish_state();
                    self.attempt += 1;
                    let give_up = self.attempt >= self.config.connection.max_connect_attempts;
                    warn!(
                        "[SHARD-{}] Connection failed: {} (attempt {})",
                        self.shard_id, e, self.attempt
                    );
                    self.report_disconnect(reason, give_up).await;
                    if give_up {
                        error!(
                            "[SHARD-{}] Max connection attempts ({}) reached",
                            self.shard_id, self.config.connection.max_connect_attempts
                        );
                        return Err(Error::ConnectionFailed {
                            attempts: self.attempt,
                            last_error: e.to_string(),
                        });
                    }
                    continue;
                }
            };

            self.machine.transport_opened();
            self.publish_state();

            let (observed, reached_session) = self.run_session(ws).await;

            self.heartbeat.stop();
            self.metrics.update_shard(self.shard_id, |s| s.is_connected = false);
            if reached_session {
                self.attempt = 0;
            } else {
                self.attempt += 1;
            }

            let outcome = match self.machine.transport_closed(observed) {
                CloseOutcome::AskOwner { reason } => {
                    let authorized = match self.delegate.upgrade() {
                        Some(delegate) => {
                            delegate
                                .shard_should_attempt_resuming(self.shard_id, reason, false)
                                .await
                        }
                        None => false,
                    };
                    self.machine.authorize_reconnect(reason, authorized)
                }
                decided => decided,
            };
            self.publish_state();

            match outcome {
                CloseOutcome::Reconnect { reason, resume } => {
                    info!(
                        "[SHARD-{}] Disconnected ({}), reconnecting ({})",
                        self.shard_id,
                        reason,
                        if resume { "resume" } else { "identify" }
                    );
                    self.report_disconnect(reason, false).await;
                    self.metrics.record_reconnection();
                    if self.attempt >= self.config.connection.max_connect_attempts {
                        self.report_disconnect(reason, true).await;
                        return Err(Error::ConnectionFailed {
                            attempts: self.attempt,
                            last_error: reason.to_string(),
                        });
                    }
                }
                CloseOutcome::Stop { reason } | CloseOutcome::AskOwner { reason } => {
                    info!("[SHARD-{}] Disconnected ({}), stopping", self.shard_id, reason);
                    self.report_disconnect(reason, true).await;
                    if reason.is_fatal() {
                        return Err(Error::SessionClosed(reason));
                    }
                    return Ok(());
                }
            }
        }
    }

    /// Sleep for `delay` while draining commands. Returns false if the shard
    /// was closed in the meantime.
    async fn wait(&mut self, delay: Duration) -> bool {
        let deadline = Instant::now() + delay;
        loop {
            tokio::select! {
                _ = sleep_until(deadline) => return true,
                cmd = self.command_rx.recv() => match cmd {
                    Some(ShardCommand::Close) | None => {
                        self.machine.request_stop();
                        self.machine.transport_closed(CloseReason::Normal);
                        self.publish_state();
                        return false;
                    }
                    Some(ShardCommand::Reconnect) => {}
                    Some(ShardCommand::Send(cmd)) => warn!(
                        "[SHARD-{}] Dropping {} command, not connected",
                        self.shard_id,
                        cmd.opcode()
                    ),
                }
            }
        }
    }

    /// Drive one socket until it closes. Returns the observed close reason and
    /// whether a session was established on it.
    async fn run_session(&mut self, ws: WsStream) -> (CloseReason, bool) {
        let (mut write, mut read) = ws.split();
        let mut reached_session = false;
        info!("[SHARD-{}] Transport open, awaiting hello", self.shard_id);

        let observed = loop {
            let next_beat = self.heartbeat.next_beat_at();

            let flow = tokio::select! {
                msg = read.next() => match msg {
                    Some(Ok(Message::Text(text))) => {
                        self.handle_text(text.as_str(), &mut write, &mut reached_session).await
                    }
                    Some(Ok(Message::Binary(data))) => match std::str::from_utf8(&data) {
                        Ok(text) => self.handle_text(text, &mut write, &mut reached_session).await,
                        Err(_) => {
                            warn!("[SHARD-{}] Ignoring non-UTF-8 binary frame", self.shard_id);
                            Flow::Continue
                        }
                    },
                    Some(Ok(Message::Close(frame))) => {
                        let reason = connection::close_reason(frame.as_ref());
                        info!("[SHARD-{}] Received close frame: {}", self.shard_id, reason);
                        Flow::Closed(reason)
                    }
                    Some(Ok(_)) => Flow::Continue,
                    Some(Err(e)) => {
                        warn!("[SHARD-{}] WebSocket error: {}", self.shard_id, e);
                        self.metrics.record_error();
                        Flow::Closed(CloseReason::Unknown)
                    }
                    None => {
                        info!("[SHARD-{}] WebSocket stream ended", self.shard_id);
                        Flow::Closed(CloseReason::Unknown)
                    }
                },

                cmd = self.command_rx.recv() => {
                    let actions = match cmd {
                        Some(ShardCommand::Send(command)) => {
                            if let GatewayCommand::PresenceUpdate(presence) = &command {
                                self.machine.set_presence(presence.clone());
                            }
                            vec![Action::Send(command)]
                        }
                        Some(ShardCommand::Reconnect) => {
                            info!("[SHARD-{}] Received reconnect command", self.shard_id);
                            vec![self.machine.request_reconnect()]
                        }
                        Some(ShardCommand::Close) | None => {
                            info!("[SHARD-{}] Received close command", self.shard_id);
                            vec![self.machine.request_stop()]
                        }
                    };
                    self.perform(actions, &mut write, &mut reached_session).await
                }

                _ = heartbeat_due(next_beat) => {
                    let action = match self.heartbeat.on_due() {
                        Beat::Send => Action::Send(self.machine.heartbeat()),
                        Beat::Zombie => {
                            self.metrics.record_zombie();
                            self.machine.zombied()
                        }
                    };
                    self.perform(vec![action], &mut write, &mut reached_session).await
                }
            };

            if let Flow::Closed(reason) = flow {
                break reason;
            }
        };

        let _ = write.close().await;
        (observed, reached_session)
    }

    async fn handle_text(
        &mut self,
        text: &str,
        write: &mut WsSink,
        reached_session: &mut bool,
    ) -> Flow {
        trace!("[SHARD-{}] <- {}", self.shard_id, text);
        match GatewayEvent::decode(text) {
            Ok(event) => {
                if matches!(event, GatewayEvent::InvalidSession { .. }) {
                    self.metrics.record_invalid_session();
                }
                let actions = self.machine.handle_event(event);
                self.perform(actions, write, reached_session).await
            }
            Err(Error::UnknownOpcode(op)) => {
                error!("[SHARD-{}] Unknown opcode {}, closing", self.shard_id, op);
                self.metrics.record_error();
                let action = self.machine.protocol_error();
                self.perform(vec![action], write, reached_session).await
            }
            Err(e) => {
                warn!("[SHARD-{}] Malformed payload ignored: {}", self.shard_id, e);
                self.metrics.record_error();
                Flow::Continue
            }
        }
    }

    async fn perform(
        &mut self,
        actions: Vec<Action>,
        write: &mut WsSink,
        reached_session: &mut bool,
    ) -> Flow {
        for action in actions {
            match action {
                Action::Send(command) => {
                    match &command {
                        GatewayCommand::Identify(_) => self.metrics.record_identify(),
                        GatewayCommand::Resume(_) => self.metrics.record_resume(),
                        GatewayCommand::Heartbeat(_) => self.metrics.record_heartbeat(),
                        _ => {}
                    }
                    let text = match command.encode() {
                        Ok(text) => text,
                        Err(e) => {
                            error!("[SHARD-{}] Failed to encode {}: {}", self.shard_id, command.opcode(), e);
                            continue;
                        }
                    };
                    if let Err(e) = write.send(Message::Text(text.into())).await {
                        warn!("[SHARD-{}] Failed to send: {}", self.shard_id, e);
                        self.metrics.record_error();
                        return Flow::Closed(CloseReason::Unknown);
                    }
                }
                Action::Hello(interval) => {
                    debug!("[SHARD-{}] Hello, heartbeat every {:?}", self.shard_id, interval);
                    self.heartbeat.start(interval);
                    if let Some(delegate) = self.delegate.upgrade() {
                        delegate.shard_got_hello(self.shard_id, interval).await;
                    }
                }
                Action::HeartbeatAck => {
                    self.heartbeat.record_ack();
                    self.metrics.record_heartbeat_ack();
                    let latency = self.heartbeat.latency();
                    self.metrics
                        .update_shard(self.shard_id, |s| s.heartbeat_latency = latency);
                }
                Action::Connected { resumed } => {
                    *reached_session = true;
                    self.metrics.record_connection();
                    self.metrics.update_shard(self.shard_id, |s| {
                        s.is_connected = true;
                        s.last_connected_at = Some(StdInstant::now());
                        s.reconnect_attempt = 0;
                    });
                    if let Some(delegate) = self.delegate.upgrade() {
                        delegate.shard_did_connect(self.shard_id, resumed).await;
                    }
                }
                Action::Dispatch(event) => {
                    self.metrics.record_dispatch(event.is_unhandled());
                    let sequence = self.machine.sequence();
                    self.metrics
                        .update_shard(self.shard_id, |s| s.last_sequence = sequence);
                    if let Some(delegate) = self.delegate.upgrade() {
                        delegate.shard_did_receive_event(self.shard_id, event).await;
                    }
                }
                Action::Close(reason) => {
                    debug!("[SHARD-{}] Closing with {}", self.shard_id, reason);
                    let _ = write.send(connection::close_message(reason)).await;
                    self.publish_state();
                    return Flow::Closed(reason);
                }
            }
        }

        self.publish_state();
        Flow::Continue
    }

    async fn report_disconnect(&self, reason: CloseReason, closed: bool) {
        if let Some(delegate) = self.delegate.upgrade() {
            delegate
                .shard_did_disconnect(self.shard_id, reason, closed)
                .await;
        }
    }

    fn publish_state(&self) {
        let state = self.machine.state();
        let changed = {
            let mut current = self.state.write();
            let changed = *current != state;
            *current = state;
            changed
        };
        if changed {
            trace!("[SHARD-{}] State -> {}", self.shard_id, state);
            self.metrics.update_shard(self.shard_id, |s| s.state = state);
        }
    }
}

async fn heartbeat_due(at: Option<Instant>) {
    match at {
        Some(at) => sleep_until(at).await,
        None => std::future::pending().await,
    }
}
