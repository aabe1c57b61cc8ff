use std::fmt;
use std::num::NonZeroU32;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use beacon_types::events::{ChatEvent, Envelope};
use beacon_types::models::{ClientInfo, GeoDetails, User};
use chrono::{DateTime, Utc};
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use crate::hub::HubHandle;
use crate::settings::ChatSettings;
use crate::transport::Frame;

/// Largest chat payload delivered. Anything over twice this is refused by
/// the transport before it reaches the session.
pub const MAX_MESSAGE_SIZE: usize = 8 * 1024;

/// Time allowed to write a frame to the peer.
pub const WRITE_WAIT: Duration = Duration::from_secs(10);

/// Time allowed between inbound frames, pongs included.
pub const PONG_WAIT: Duration = Duration::from_secs(60);

/// Keep-alive interval. Must be shorter than [`PONG_WAIT`].
pub const PING_PERIOD: Duration = Duration::from_secs(54);

/// Queued outbound payloads per client before broadcasts start dropping.
pub const SEND_BUFFER: usize = 256;

const FLOOD_TIMEOUT: Duration = Duration::from_secs(10);

// No more than 3 messages in any 2 second window: a full bucket holds 3
// and each message takes 2 seconds to earn back.
const RATE_BURST: u32 = 3;
const RATE_REPLENISH: Duration = Duration::from_secs(2);

pub const OVERSIZED_MESSAGE: &str =
    "Sorry, that message exceeded the maximum size and can't be delivered.";
pub const FLOOD_WARNING: &str =
    "You are temporarily blocked from sending chat messages due to perceived flooding.";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClientId(pub u64);

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// What the connection told us about the peer at upgrade time.
#[derive(Debug, Clone, Default)]
pub struct ConnectionMeta {
    pub ip_address: String,
    pub user_agent: String,
    pub geo: Option<GeoDetails>,
}

/// Result of the per-session checks on one inbound payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundVerdict {
    /// Sanitized payload to hand to the hub.
    Forward(String),
    Oversized,
    InTimeout,
    RateLimited,
}

struct SessionState {
    /// `None` once the session is closed.
    send: Option<mpsc::Sender<String>>,
    in_timeout: bool,
    timeout_task: Option<JoinHandle<()>>,
}

/// One connected chat participant.
pub struct ChatClient {
    pub id: ClientId,
    pub user: User,
    pub connected_at: DateTime<Utc>,
    pub meta: ConnectionMeta,
    message_count: AtomicU64,
    state: Mutex<SessionState>,
    limiter: DefaultDirectRateLimiter,
    hub: HubHandle,
    settings: Arc<dyn ChatSettings>,
}

impl ChatClient {
    /// Create a session and the receiving end of its send buffer, which
    /// belongs to the write pump.
    pub fn new(
        user: User,
        meta: ConnectionMeta,
        hub: HubHandle,
        settings: Arc<dyn ChatSettings>,
    ) -> (Arc<Self>, mpsc::Receiver<String>) {
        let (tx, rx) = mpsc::channel(SEND_BUFFER);

        let burst = NonZeroU32::new(RATE_BURST).unwrap_or(NonZeroU32::MIN);
        let quota = Quota::with_period(RATE_REPLENISH)
            .unwrap_or_else(|| Quota::per_second(NonZeroU32::MIN))
            .allow_burst(burst);

        let client = Arc::new(Self {
            id: hub.next_client_id(),
            user,
            connected_at: Utc::now(),
            meta,
            message_count: AtomicU64::new(0),
            state: Mutex::new(SessionState {
                send: Some(tx),
                in_timeout: false,
                timeout_task: None,
            }),
            limiter: RateLimiter::direct(quota),
            hub,
            settings,
        });

        (client, rx)
    }

    fn state(&self) -> MutexGuard<'_, SessionState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn is_closed(&self) -> bool {
        self.state().send.is_none()
    }

    pub fn is_in_timeout(&self) -> bool {
        self.state().in_timeout
    }

    pub fn message_count(&self) -> u64 {
        self.message_count.load(Ordering::Relaxed)
    }

    pub(crate) fn record_message(&self) {
        self.message_count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn info(&self) -> ClientInfo {
        ClientInfo {
            id: self.id.0,
            user: self.user.clone(),
            connected_at: self.connected_at,
            message_count: self.message_count(),
            user_agent: self.meta.user_agent.clone(),
            ip_address: self.meta.ip_address.clone(),
            geo: self.meta.geo.clone(),
        }
    }

    /// Apply size, timeout and rate checks to one raw inbound payload.
    /// Rejections that the user should hear about are answered here.
    pub fn accept_inbound(self: &Arc<Self>, raw: &str) -> InboundVerdict {
        if raw.len() > MAX_MESSAGE_SIZE {
            self.send_action(OVERSIZED_MESSAGE);
            return InboundVerdict::Oversized;
        }

        if self.is_in_timeout() {
            return InboundVerdict::InTimeout;
        }

        if !self.passes_rate_limit() {
            warn!(
                "Client {} {} has exceeded the messaging rate limiting thresholds and messages are being rejected temporarily.",
                self.id, self.user.display_name
            );
            self.start_timeout();
            return InboundVerdict::RateLimited;
        }

        InboundVerdict::Forward(sanitize(raw))
    }

    fn passes_rate_limit(&self) -> bool {
        if !self.settings.spam_protection_enabled() || self.user.is_moderator() {
            return true;
        }
        self.limiter.check().is_ok() && !self.is_in_timeout()
    }

    /// Enter the flood timeout and warn the user once. A no-op while a
    /// timeout is already running or after close.
    pub fn start_timeout(self: &Arc<Self>) {
        {
            let mut state = self.state();
            if state.timeout_task.is_some() || state.send.is_none() {
                return;
            }
            state.in_timeout = true;

            let client = Arc::downgrade(self);
            state.timeout_task = Some(tokio::spawn(async move {
                tokio::time::sleep(FLOOD_TIMEOUT).await;
                if let Some(client) = client.upgrade() {
                    let mut state = client.state();
                    state.in_timeout = false;
                    state.timeout_task = None;
                }
            }));
        }

        self.send_action(FLOOD_WARNING);
    }

    /// Queue a serialized payload without waiting. Returns false if the
    /// session is closed or its buffer is full.
    pub fn send_payload(&self, payload: String) -> bool {
        let state = self.state();
        let Some(send) = state.send.as_ref() else {
            return false;
        };

        match send.try_send(payload) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                warn!(
                    "Client {} ({}) send buffer full, dropping payload",
                    self.id, self.user.display_name
                );
                false
            }
            Err(TrySendError::Closed(_)) => false,
        }
    }

    pub fn send_event(&self, envelope: &Envelope) -> bool {
        match envelope.to_json() {
            Ok(json) => self.send_payload(json),
            Err(e) => {
                warn!("Failed to serialize {} event: {}", envelope.event.type_name(), e);
                false
            }
        }
    }

    /// Send an action line visible only to this client.
    pub fn send_action(&self, body: &str) -> bool {
        self.send_event(&Envelope::new(ChatEvent::Action {
            body: body.to_string(),
        }))
    }

    /// Close the session. Only the first call has any effect: the send
    /// buffer is dropped, which ends the write pump, the flood timer is
    /// cancelled and the hub is told once.
    pub fn close(&self) {
        {
            let mut state = self.state();
            if state.send.take().is_none() {
                return;
            }
            state.in_timeout = false;
            if let Some(timer) = state.timeout_task.take() {
                timer.abort();
            }
        }

        trace!(
            "client closed: {} {} {}",
            self.user.display_name, self.id, self.meta.ip_address
        );
        self.hub.unregister(self.id);
    }
}

/// Collapse newlines to spaces and trim.
pub fn sanitize(raw: &str) -> String {
    raw.replace('\n', " ").trim().to_string()
}

/// Drive one session until either side of the connection ends, then close it.
pub async fn run<K, S, E>(client: Arc<ChatClient>, outbound: mpsc::Receiver<String>, sink: K, stream: S)
where
    K: Sink<Frame> + Send + Unpin + 'static,
    K::Error: fmt::Display,
    S: Stream<Item = Result<Frame, E>> + Send + Unpin + 'static,
    E: fmt::Display + Send + 'static,
{
    let mut send_task = tokio::spawn(write_pump(client.id, outbound, sink));
    let mut recv_task = tokio::spawn(read_pump(client.clone(), stream));

    tokio::select! {
        _ = &mut send_task => {
            recv_task.abort();
            client.close();
        }
        _ = &mut recv_task => {
            // Dropping the send buffer lets the write pump flush and say goodbye
            client.close();
            if tokio::time::timeout(WRITE_WAIT, &mut send_task).await.is_err() {
                send_task.abort();
            }
        }
    }
}

/// Read frames until the peer goes away or falls silent for [`PONG_WAIT`].
pub async fn read_pump<S, E>(client: Arc<ChatClient>, mut stream: S)
where
    S: Stream<Item = Result<Frame, E>> + Unpin,
    E: fmt::Display,
{
    loop {
        let frame = match tokio::time::timeout(PONG_WAIT, stream.next()).await {
            Ok(Some(Ok(frame))) => frame,
            Ok(Some(Err(e))) => {
                debug!("Client {} read error: {}", client.id, e);
                break;
            }
            Ok(None) => break,
            Err(_) => {
                debug!("Client {} read deadline passed", client.id);
                break;
            }
        };

        let raw = match frame {
            Frame::Text(text) => text,
            Frame::Binary(data) => match std::str::from_utf8(&data) {
                Ok(text) => text.to_owned(),
                Err(_) => {
                    debug!("Client {} sent non-UTF-8 binary frame", client.id);
                    continue;
                }
            },
            Frame::Close => break,
            Frame::Ping | Frame::Pong => continue,
        };

        if let InboundVerdict::Forward(body) = client.accept_inbound(&raw) {
            if !client.hub.inbound(client.clone(), body).await {
                break;
            }
        }
    }

    client.close();
}

/// Drain the send buffer into the sink, batching whatever is already
/// queued into one newline separated text frame, and ping on a timer.
pub async fn write_pump<K>(id: ClientId, mut outbound: mpsc::Receiver<String>, mut sink: K)
where
    K: Sink<Frame> + Unpin,
    K::Error: fmt::Display,
{
    let mut ping = tokio::time::interval(PING_PERIOD);
    ping.tick().await;

    loop {
        let frame = tokio::select! {
            msg = outbound.recv() => {
                let Some(mut batch) = msg else {
                    // Session closed
                    let _ = tokio::time::timeout(WRITE_WAIT, sink.send(Frame::Close)).await;
                    break;
                };
                for _ in 0..SEND_BUFFER {
                    match outbound.try_recv() {
                        Ok(next) => {
                            batch.push('\n');
                            batch.push_str(&next);
                        }
                        Err(_) => break,
                    }
                }
                Frame::Text(batch)
            }
            _ = ping.tick() => Frame::Ping,
        };

        match tokio::time::timeout(WRITE_WAIT, sink.send(frame)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                debug!("Client {} write failed: {}", id, e);
                break;
            }
            Err(_) => {
                warn!("Client {} write timed out", id);
                break;
            }
        }
    }
}
