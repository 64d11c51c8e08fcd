/// Connection manager: one STOMP session per authenticated user
use crate::auth::AuthContext;
use crate::bus::connector::{BusStream, Connector};
use crate::bus::frame::{negotiate_heart_beat, parse_heart_beat, Command, Decoded, Frame};
use crate::config::Config;
use crate::error::{ChatError, Result};
use crate::messenger_types::{ChatEvent, Message, OutboundEnvelope, ResponseEnvelope};
use bytes::BytesMut;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::{broadcast, mpsc, oneshot, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, sleep, timeout, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

/// Per-user inbox topic prefix
pub const INBOX_PREFIX: &str = "/topic/messages/";
/// Private queue carrying acknowledgements of our own publishes
pub const RESPONSES_QUEUE: &str = "/user/queue/responses";
/// Destination for outgoing chat messages
pub const SEND_DESTINATION: &str = "/app/send-message";

const INBOX_SUBSCRIPTION: &str = "sub-inbox";
const RESPONSES_SUBSCRIPTION: &str = "sub-responses";
const EVENT_CAPACITY: usize = 256;
const COMMAND_CAPACITY: usize = 64;
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);
const IDLE_TICK: Duration = Duration::from_secs(3600);

/// Bus topic for a user's inbox
pub fn inbox_topic(user_id: &str) -> String {
    format!("{}{}", INBOX_PREFIX, user_id)
}

enum BusCommand {
    Publish {
        frame: Frame,
        reply: oneshot::Sender<Result<()>>,
    },
}

impl BusCommand {
    fn reject(self) {
        match self {
            BusCommand::Publish { reply, .. } => {
                let _ = reply.send(Err(ChatError::NotConnected));
            }
        }
    }
}

enum SessionEnd {
    Shutdown,
    Closed(String),
}

struct SessionHandle {
    user_id: String,
    commands: mpsc::Sender<BusCommand>,
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

#[derive(Debug, Clone)]
struct BusSettings {
    host: String,
    connection_timeout: Duration,
    reconnect_delay: Duration,
    heartbeat: Duration,
}

struct Inner {
    connector: Arc<dyn Connector>,
    settings: BusSettings,
    auth: AuthContext,
    connected: watch::Sender<bool>,
    events: broadcast::Sender<ChatEvent>,
    session: Mutex<Option<SessionHandle>>,
}

/// Maintains the single bus connection for the signed-in user.
///
/// Reconnects after a fixed delay with no attempt cap. There is no offline
/// queue: publishing while the session is down fails with `NotConnected`.
#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<Inner>,
}

impl ConnectionManager {
    pub fn new(connector: Arc<dyn Connector>, auth: AuthContext, config: &Config) -> Self {
        let (connected, _) = watch::channel(false);
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            inner: Arc::new(Inner {
                connector,
                settings: BusSettings {
                    host: config.bus_host.clone(),
                    connection_timeout: config.connection_timeout,
                    reconnect_delay: config.reconnect_delay,
                    heartbeat: config.heartbeat_interval,
                },
                auth,
                connected,
                events,
                session: Mutex::new(None),
            }),
        }
    }

    /// Start (or keep) a session bound to `user_id`
    pub async fn connect(&self, user_id: &str) -> Result<()> {
        let user_id = user_id.trim();
        if user_id.is_empty() {
            return Err(ChatError::NotAuthenticated);
        }

        let mut session = self.inner.session.lock().await;
        if let Some(existing) = session.as_ref() {
            if existing.user_id == user_id && !existing.task.is_finished() {
                debug!("Bus session for {} already running", user_id);
                return Ok(());
            }
        }
        if let Some(old) = session.take() {
            info!("Identity changed ({} -> {}), closing old session", old.user_id, user_id);
            stop_session(old).await;
            self.inner.set_connected(false, "identity changed");
        }

        let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_CAPACITY);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let inner = self.inner.clone();
        let owner = user_id.to_string();
        let task = tokio::spawn(async move {
            inner.run_supervisor(owner, cmd_rx, shutdown_rx).await;
        });

        info!(
            "Connecting to bus {} as {}",
            self.inner.connector.describe(),
            user_id
        );
        *session = Some(SessionHandle {
            user_id: user_id.to_string(),
            commands: cmd_tx,
            shutdown: shutdown_tx,
            task,
        });
        Ok(())
    }

    /// Close the session; safe to call repeatedly
    pub async fn disconnect(&self) {
        let handle = self.inner.session.lock().await.take();
        if let Some(handle) = handle {
            info!("Disconnecting bus session for {}", handle.user_id);
            stop_session(handle).await;
        }
        self.inner.set_connected(false, "disconnected by client");
    }

    /// Publish an outbound chat envelope; fails fast when not connected
    pub async fn publish(&self, envelope: &OutboundEnvelope) -> Result<()> {
        if !self.is_connected() {
            return Err(ChatError::NotConnected);
        }
        let commands = match self.inner.session.lock().await.as_ref() {
            Some(handle) => handle.commands.clone(),
            None => return Err(ChatError::NotConnected),
        };

        let body = serde_json::to_vec(envelope)?;
        let (reply_tx, reply_rx) = oneshot::channel();
        commands
            .send(BusCommand::Publish {
                frame: Frame::send_json(SEND_DESTINATION, body),
                reply: reply_tx,
            })
            .await
            .map_err(|_| ChatError::NotConnected)?;
        reply_rx.await.map_err(|_| ChatError::NotConnected)?
    }

    pub fn is_connected(&self) -> bool {
        *self.inner.connected.borrow()
    }

    /// Observe the connected flag
    pub fn watch_connected(&self) -> watch::Receiver<bool> {
        self.inner.connected.subscribe()
    }

    /// Receive bus events (inbound messages, acks, connection changes)
    pub fn subscribe(&self) -> broadcast::Receiver<ChatEvent> {
        self.inner.events.subscribe()
    }

    /// User the current session is bound to
    pub async fn current_user(&self) -> Option<String> {
        self.inner
            .session
            .lock()
            .await
            .as_ref()
            .map(|h| h.user_id.clone())
    }
}

async fn stop_session(handle: SessionHandle) {
    let _ = handle.shutdown.send(true);
    let mut task = handle.task;
    if timeout(SHUTDOWN_GRACE, &mut task).await.is_err() {
        warn!("Bus session for {} did not stop in time, aborting", handle.user_id);
        task.abort();
    }
}

impl Inner {
    /// Flip the connected flag; `detail` is the user id when connecting, the reason otherwise
    fn set_connected(&self, value: bool, detail: &str) {
        let was = self.connected.send_replace(value);
        if was == value {
            return;
        }
        let event = if value {
            ChatEvent::Connected {
                user_id: detail.to_string(),
            }
        } else {
            ChatEvent::Disconnected {
                reason: detail.to_string(),
            }
        };
        let _ = self.events.send(event);
    }

    fn emit(&self, event: ChatEvent) {
        // No receivers is fine; nobody is listening yet.
        let _ = self.events.send(event);
    }

    /// Connect, run, and reconnect until shut down
    async fn run_supervisor(
        &self,
        user_id: String,
        mut commands: mpsc::Receiver<BusCommand>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        loop {
            if *shutdown.borrow() {
                break;
            }

            let reason = match self.run_session(&user_id, &mut commands, &mut shutdown).await {
                Ok(SessionEnd::Shutdown) => break,
                Ok(SessionEnd::Closed(reason)) => {
                    info!("Bus session closed: {}", reason);
                    reason
                }
                Err(e) => {
                    warn!("Bus session error: {}", e);
                    e.to_string()
                }
            };
            self.set_connected(false, &reason);

            debug!(
                "Reconnecting in {:?} as {}",
                self.settings.reconnect_delay, user_id
            );
            let delay = sleep(self.settings.reconnect_delay);
            tokio::pin!(delay);
            loop {
                tokio::select! {
                    _ = &mut delay => break,
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            self.set_connected(false, "disconnected by client");
                            return;
                        }
                    }
                    cmd = commands.recv() => match cmd {
                        Some(cmd) => cmd.reject(),
                        None => return,
                    },
                }
            }
        }
        self.set_connected(false, "disconnected by client");
    }

    async fn run_session(
        &self,
        user_id: &str,
        commands: &mut mpsc::Receiver<BusCommand>,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<SessionEnd> {
        let mut stream = self.connector.connect().await?;
        let mut buf = BytesMut::with_capacity(8 * 1024);

        let hb_ms = self.settings.heartbeat.as_millis() as u64;
        let token = self.auth.token();
        let connect = Frame::connect(&self.settings.host, token.as_deref(), (hb_ms, hb_ms));
        write_frame(&mut stream, &connect).await?;

        let connected = timeout(
            self.settings.connection_timeout,
            read_frame(&mut stream, &mut buf),
        )
        .await
        .map_err(|_| ChatError::Timeout("STOMP handshake".to_string()))??;

        let theirs = match connected.command {
            Command::Connected => parse_heart_beat(connected.get("heart-beat").unwrap_or("0,0"))?,
            Command::Error => return Err(error_from_frame(&connected)),
            other => {
                return Err(ChatError::Protocol(format!(
                    "expected CONNECTED, got {}",
                    other
                )))
            }
        };
        let (send_every, expect_within) = negotiate_heart_beat((hb_ms, hb_ms), theirs);

        write_frame(
            &mut stream,
            &Frame::subscribe(INBOX_SUBSCRIPTION, &inbox_topic(user_id)),
        )
        .await?;
        write_frame(
            &mut stream,
            &Frame::subscribe(RESPONSES_SUBSCRIPTION, RESPONSES_QUEUE),
        )
        .await?;

        info!(
            "Bus connected as {} (heart-beat send {:?}, expect {:?})",
            user_id, send_every, expect_within
        );
        self.set_connected(true, user_id);

        let period = send_every.unwrap_or(IDLE_TICK);
        let mut send_tick = interval_at(Instant::now() + period, period);
        send_tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let check = expect_within.unwrap_or(IDLE_TICK);
        let mut check_tick = interval_at(Instant::now() + check, check);
        check_tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut last_rx = Instant::now();

        loop {
            tokio::select! {
                read = stream.read_buf(&mut buf) => {
                    if read? == 0 {
                        return Ok(SessionEnd::Closed("server closed connection".to_string()));
                    }
                    last_rx = Instant::now();
                    while let Some(decoded) = Frame::decode(&mut buf)? {
                        match decoded {
                            Decoded::Heartbeat => debug!("Heartbeat received"),
                            Decoded::Frame(frame) => self.handle_frame(frame)?,
                        }
                    }
                }
                cmd = commands.recv() => match cmd {
                    Some(BusCommand::Publish { frame, reply }) => {
                        match write_frame(&mut stream, &frame).await {
                            Ok(()) => {
                                let _ = reply.send(Ok(()));
                            }
                            Err(e) => {
                                let reason = e.to_string();
                                let _ = reply.send(Err(ChatError::NotConnected));
                                return Ok(SessionEnd::Closed(format!("write failed: {}", reason)));
                            }
                        }
                    }
                    None => return Ok(SessionEnd::Shutdown),
                },
                _ = send_tick.tick(), if send_every.is_some() => {
                    stream.write_all(b"\n").await?;
                    stream.flush().await?;
                }
                _ = check_tick.tick(), if expect_within.is_some() => {
                    if last_rx.elapsed() > check * 2 {
                        return Ok(SessionEnd::Closed("heartbeat timeout".to_string()));
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        if let Err(e) = write_frame(&mut stream, &Frame::disconnect("bye")).await {
                            debug!("DISCONNECT not delivered: {}", e);
                        }
                        return Ok(SessionEnd::Shutdown);
                    }
                }
            }
        }
    }

    /// Route one server frame; errors end the session
    fn handle_frame(&self, frame: Frame) -> Result<()> {
        match frame.command {
            Command::Message => {
                let subscription = frame.get("subscription").unwrap_or_default();
                let destination = frame.get("destination").unwrap_or_default();
                if subscription == RESPONSES_SUBSCRIPTION || destination == RESPONSES_QUEUE {
                    match decode_body::<ResponseEnvelope>(&frame) {
                        Ok(response) => self.emit(ChatEvent::Ack { response }),
                        Err(e) => warn!("Dropping malformed response envelope: {}", e),
                    }
                } else if subscription == INBOX_SUBSCRIPTION || destination.starts_with(INBOX_PREFIX) {
                    match decode_body::<Message>(&frame) {
                        Ok(message) => {
                            debug!("Inbound message {} in {}", message.id, message.conversation_id);
                            self.emit(ChatEvent::Inbound { message });
                        }
                        Err(e) => warn!("Dropping malformed inbound message: {}", e),
                    }
                } else {
                    debug!("Ignoring MESSAGE for unknown destination {}", destination);
                }
                Ok(())
            }
            Command::Error => {
                let err = error_from_frame(&frame);
                error!("Bus reported error: {}", err);
                Err(err)
            }
            Command::Receipt => {
                debug!("Receipt {}", frame.get("receipt-id").unwrap_or_default());
                Ok(())
            }
            other => {
                debug!("Ignoring unexpected {} frame", other);
                Ok(())
            }
        }
    }
}

fn decode_body<T: serde::de::DeserializeOwned>(frame: &Frame) -> Result<T> {
    serde_json::from_slice(&frame.body).map_err(|e| ChatError::Malformed(e.to_string()))
}

fn error_from_frame(frame: &Frame) -> ChatError {
    let detail = frame.get("message").unwrap_or("no message");
    let body = String::from_utf8_lossy(&frame.body);
    if body.trim().is_empty() {
        ChatError::Protocol(detail.to_string())
    } else {
        ChatError::Protocol(format!("{}: {}", detail, body.trim()))
    }
}

async fn write_frame(stream: &mut Box<dyn BusStream>, frame: &Frame) -> Result<()> {
    stream.write_all(&frame.encode()).await?;
    stream.flush().await?;
    Ok(())
}

/// Read the next full frame, skipping heartbeats
async fn read_frame(stream: &mut Box<dyn BusStream>, buf: &mut BytesMut) -> Result<Frame> {
    loop {
        while let Some(decoded) = Frame::decode(buf)? {
            if let Decoded::Frame(frame) = decoded {
                return Ok(frame);
            }
        }
        if stream.read_buf(buf).await? == 0 {
            return Err(ChatError::Protocol(
                "connection closed during handshake".to_string(),
            ));
        }
    }
}
