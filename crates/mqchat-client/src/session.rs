//! The chat session state machine.
//!
//! A [`ChatSession`] owns one connection attempt at a time. Broker events are
//! processed by a spawned loop, front-end calls arrive from any thread, and
//! the heartbeat fires from its own task. All three go through a single
//! mutex around [`Shared`]. Broker handles only enqueue, so publishing while
//! holding the lock never waits on the network. Events for the front end are
//! emitted while the lock is still held, so they reach the sink in the order
//! the state changed; the sink must not block or call back into the session.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use mqchat_net::{
    Broker, BrokerError, BrokerEvent, BrokerOptions, Connector, Credentials, LastWill,
    PresenceTracker,
};
use mqchat_shared::protocol::{ChatEnvelope, PresenceEnvelope};
use mqchat_shared::topics::{validate_name, TopicKind, TopicScheme};
use mqchat_shared::{derive_key, MessageCodec};

use crate::config::SessionConfig;
use crate::error::SessionError;
use crate::events::{ChatEvent, EventSink};
use crate::heartbeat::HeartbeatScheduler;
use crate::state::SessionState;

// ---------------------------------------------------------------------------
// Connect parameters
// ---------------------------------------------------------------------------

/// What the user typed into the connect form.
#[derive(Clone)]
pub struct ConnectParams {
    pub server: String,
    pub port: u16,
    pub channel: String,
    pub passphrase: String,
    pub username: String,
    /// Broker account. `None` connects anonymously.
    pub credentials: Option<Credentials>,
}

impl fmt::Debug for ConnectParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectParams")
            .field("server", &self.server)
            .field("port", &self.port)
            .field("channel", &self.channel)
            .field("passphrase", &"<redacted>")
            .field("username", &self.username)
            .field("credentials", &self.credentials)
            .finish()
    }
}

impl ConnectParams {
    pub fn new(
        server: impl Into<String>,
        port: u16,
        channel: impl Into<String>,
        passphrase: impl Into<String>,
        username: impl Into<String>,
    ) -> Self {
        Self {
            server: server.into(),
            port,
            channel: channel.into(),
            passphrase: passphrase.into(),
            username: username.into(),
            credentials: None,
        }
    }

    pub fn with_credentials(
        mut self,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        self.credentials = Some(Credentials {
            username: username.into(),
            password: password.into(),
        });
        self
    }

    /// Trim every field and reject anything that cannot form a session.
    pub fn validate(mut self) -> Result<Self, SessionError> {
        self.server = self.server.trim().to_string();
        self.channel = self.channel.trim().to_string();
        self.username = self.username.trim().to_string();
        self.passphrase = self.passphrase.trim().to_string();

        if self.server.is_empty() {
            return Err(SessionError::Validation("server must not be empty".into()));
        }
        if self.port == 0 {
            return Err(SessionError::Validation(
                "port must be between 1 and 65535".into(),
            ));
        }
        if self.passphrase.is_empty() {
            return Err(SessionError::Validation(
                "passphrase must not be empty".into(),
            ));
        }
        validate_name("channel", &self.channel)
            .and_then(|()| validate_name("username", &self.username))
            .map_err(|e| SessionError::Validation(e.to_string()))?;

        self.credentials = self
            .credentials
            .take()
            .map(|credentials| Credentials {
                username: credentials.username.trim().to_string(),
                password: credentials.password.trim().to_string(),
            })
            .filter(|credentials| !credentials.username.is_empty());
        Ok(self)
    }
}

// ---------------------------------------------------------------------------
// Session internals
// ---------------------------------------------------------------------------

/// Everything that only exists while a broker connection does.
struct Active {
    username: String,
    client_id: String,
    topics: TopicScheme,
    own_presence_topic: String,
    codec: MessageCodec,
    broker: Arc<dyn Broker>,
    presence: PresenceTracker,
    runtime: Handle,
}

#[derive(Default)]
struct Shared {
    state: SessionState,
    /// Bumped on every connect so events from an older connection are ignored.
    generation: u64,
    active: Option<Active>,
    heartbeat: HeartbeatScheduler,
}

struct Inner {
    config: SessionConfig,
    connector: Arc<dyn Connector>,
    sink: Arc<dyn EventSink>,
    shared: Mutex<Shared>,
}

fn now() -> std::time::Instant {
    tokio::time::Instant::now().into_std()
}

fn presence_payload(envelope: &PresenceEnvelope) -> Vec<u8> {
    match envelope.to_json() {
        Ok(json) => json.into_bytes(),
        Err(e) => {
            warn!(error = %e, "Failed to encode presence");
            Vec::new()
        }
    }
}

/// Retained "online" on our own presence topic.
fn announce_online(active: &Active) {
    let payload = presence_payload(&PresenceEnvelope::online(&active.username));
    if let Err(e) = active.broker.publish(&active.own_presence_topic, payload, true) {
        warn!(error = %e, "Online announcement failed");
    }
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, Shared> {
        self.shared.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Callers hold the session lock.
    fn emit_all(&self, events: Vec<ChatEvent>) {
        for event in events {
            self.sink.emit(event);
        }
    }

    /// Broker accepted us: clear stale presence, subscribe, announce online,
    /// start the heartbeat.
    fn on_connected(self: &Arc<Self>, generation: u64) {
        let mut shared = self.lock();
        if shared.generation != generation || shared.state != SessionState::Connecting {
            return;
        }
        let Some(active) = shared.active.as_mut() else {
            return;
        };

        let broker = active.broker.clone();
        let own = active.own_presence_topic.clone();
        if let Err(e) = broker.publish(&own, Vec::new(), true) {
            warn!(error = %e, "Failed to clear retained presence");
        }

        active.presence.reset();
        let subscriptions = [
            active.topics.messages_topic().to_string(),
            active.topics.presence_wildcard(),
        ];
        for filter in &subscriptions {
            if let Err(e) = broker.subscribe(filter) {
                warn!(topic = %filter, error = %e, "Subscribe failed");
            }
        }

        let username = active.username.clone();
        active.presence.on_online(&username, now());
        announce_online(active);
        let users = active.presence.users();
        let channel = active.topics.channel().to_string();

        // Already announced above; the ticks take the lock themselves.
        shared.state = SessionState::Connected;
        let weak = Arc::downgrade(self);
        shared
            .heartbeat
            .schedule(self.config.heartbeat_interval, move || {
                if let Some(inner) = weak.upgrade() {
                    inner.heartbeat_tick(generation);
                }
            });

        info!(channel = %channel, user = %username, "Connected to chat");
        self.emit_all(vec![
            ChatEvent::state(SessionState::Connected),
            ChatEvent::notice("Connected to chat!"),
            ChatEvent::users(users),
        ]);
    }

    fn on_connection_failed(&self, generation: u64, reason: String) {
        let mut shared = self.lock();
        if shared.generation != generation || shared.state != SessionState::Connecting {
            return;
        }
        shared.state = SessionState::Disconnected;
        shared.active = None;

        warn!(reason = %reason, "Broker connection failed");
        self.emit_all(vec![
            ChatEvent::error(format!("Connection failed: {reason}")),
            ChatEvent::state(SessionState::Disconnected),
        ]);
    }

    /// Unsolicited loss of an established connection. The last will speaks
    /// for us, so nothing is published here.
    fn on_connection_lost(&self, generation: u64, reason: Option<String>) {
        let mut shared = self.lock();
        if shared.generation != generation {
            return;
        }
        match shared.state {
            SessionState::Connected => {}
            SessionState::Connecting => {
                drop(shared);
                let reason = reason.unwrap_or_else(|| "connection closed".to_string());
                self.on_connection_failed(generation, reason);
                return;
            }
            SessionState::Disconnecting | SessionState::Disconnected => return,
        }

        shared.heartbeat.cancel();
        shared.active = None;
        shared.state = SessionState::Disconnected;

        let text = match &reason {
            Some(reason) => format!("Connection lost: {reason}"),
            None => "Connection lost".to_string(),
        };
        warn!(reason = ?reason, "Connection to broker lost");
        self.emit_all(vec![
            ChatEvent::users(Vec::new()),
            ChatEvent::notice(text),
            ChatEvent::state(SessionState::Disconnected),
        ]);
    }

    fn on_message(&self, generation: u64, topic: &str, payload: &[u8]) {
        let mut shared = self.lock();
        if shared.generation != generation || shared.state != SessionState::Connected {
            return;
        }
        let Some(active) = shared.active.as_mut() else {
            return;
        };

        let events = match active.topics.classify(topic) {
            TopicKind::Chat => {
                let Ok(text) = std::str::from_utf8(payload) else {
                    debug!(topic = %topic, "Dropping non-UTF-8 chat payload");
                    return;
                };
                match active.codec.decode_chat(text) {
                    Ok(envelope) if envelope.user == active.username => {
                        // Our own publish echoed back; already shown.
                        return;
                    }
                    Ok(envelope) => vec![ChatEvent::ChatMessage {
                        user: envelope.user,
                        text: envelope.message,
                        timestamp: envelope.timestamp,
                    }],
                    Err(e) => {
                        debug!(topic = %topic, error = %e, "Dropping undecryptable chat payload");
                        return;
                    }
                }
            }
            TopicKind::Presence(user) => match active.presence.handle(&user, payload, now()) {
                Ok(update) => {
                    let mut events = Vec::with_capacity(2);
                    if let Some(notice) = update.notice {
                        events.push(ChatEvent::notice(notice.to_string()));
                    }
                    events.push(ChatEvent::users(update.users));
                    events
                }
                Err(e) => {
                    warn!(topic = %topic, error = %e, "Dropping invalid presence payload");
                    return;
                }
            },
            TopicKind::Unrelated => {
                debug!(topic = %topic, "Ignoring message on unrelated topic");
                return;
            }
        };
        self.emit_all(events);
    }

    fn heartbeat_tick(&self, generation: u64) {
        let mut shared = self.lock();
        if shared.generation != generation || shared.state != SessionState::Connected {
            return;
        }
        let Some(active) = shared.active.as_mut() else {
            return;
        };

        announce_online(active);

        let Some(max_age) = self.config.stale_after else {
            return;
        };
        let notices = active.presence.evict_stale(now(), max_age);
        if notices.is_empty() {
            return;
        }
        let mut events: Vec<ChatEvent> = notices
            .iter()
            .map(|notice| ChatEvent::notice(notice.to_string()))
            .collect();
        events.push(ChatEvent::users(active.presence.users()));
        self.emit_all(events);
    }
}

async fn run_events(
    inner: Weak<Inner>,
    mut rx: mpsc::UnboundedReceiver<BrokerEvent>,
    generation: u64,
) {
    while let Some(event) = rx.recv().await {
        let Some(inner) = inner.upgrade() else {
            break;
        };
        if inner.lock().generation != generation {
            break;
        }
        match event {
            BrokerEvent::Connected => inner.on_connected(generation),
            BrokerEvent::ConnectionFailed(reason) => inner.on_connection_failed(generation, reason),
            BrokerEvent::Message { topic, payload } => {
                inner.on_message(generation, &topic, &payload)
            }
            BrokerEvent::Disconnected { reason } => inner.on_connection_lost(generation, reason),
        }
    }

    // The transport went away without saying goodbye.
    if let Some(inner) = inner.upgrade() {
        inner.on_connection_lost(generation, Some("event stream closed".to_string()));
    }
    debug!(generation, "Broker event loop finished");
}

/// Announce offline, let it flush, clear the retained slot, close.
/// Failures are logged and skipped so the session always ends Disconnected.
async fn teardown(inner: Arc<Inner>, active: Active, generation: u64) {
    let offline = presence_payload(&PresenceEnvelope::offline(&active.username));
    if let Err(e) = active.broker.publish(&active.own_presence_topic, offline, true) {
        debug!(error = %e, "Offline announcement failed");
    }

    tokio::time::sleep(inner.config.disconnect_grace).await;

    if let Err(e) = active
        .broker
        .publish(&active.own_presence_topic, Vec::new(), true)
    {
        debug!(error = %e, "Clearing retained presence failed");
    }
    if let Err(e) = active.broker.disconnect() {
        debug!(error = %e, "Broker disconnect failed");
    }

    let mut shared = inner.lock();
    if shared.generation == generation {
        shared.state = SessionState::Disconnected;
    }

    info!(user = %active.username, "Disconnected from chat");
    inner.emit_all(vec![
        ChatEvent::users(Vec::new()),
        ChatEvent::notice("Disconnected from chat"),
        ChatEvent::state(SessionState::Disconnected),
    ]);
}

// ---------------------------------------------------------------------------
// Public handle
// ---------------------------------------------------------------------------

/// A chat session over one broker. Clones share the same session.
#[derive(Clone)]
pub struct ChatSession {
    inner: Arc<Inner>,
}

impl ChatSession {
    pub fn new(
        config: SessionConfig,
        connector: Arc<dyn Connector>,
        sink: Arc<dyn EventSink>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                connector,
                sink,
                shared: Mutex::new(Shared::default()),
            }),
        }
    }

    pub fn state(&self) -> SessionState {
        self.inner.lock().state
    }

    /// Broker client id of the current connection.
    pub fn client_id(&self) -> Option<String> {
        self.inner
            .lock()
            .active
            .as_ref()
            .map(|active| active.client_id.clone())
    }

    /// Sorted online users, empty unless connected.
    pub fn online_users(&self) -> Vec<String> {
        let shared = self.inner.lock();
        match (&shared.active, shared.state) {
            (Some(active), SessionState::Connected) => active.presence.users(),
            _ => Vec::new(),
        }
    }

    /// Start connecting. Returns once the attempt is under way; the outcome
    /// arrives as events. Must be called inside a tokio runtime.
    pub fn connect(&self, params: ConnectParams) -> Result<(), SessionError> {
        let params = params.validate()?;
        let runtime = Handle::try_current()
            .map_err(|e| BrokerError::Client(format!("no async runtime: {e}")))?;

        let key = derive_key(&params.passphrase)?;
        let topics = TopicScheme::new(&params.channel)?;
        let own_presence_topic = topics.presence_topic_for(&params.username);
        let codec = MessageCodec::new(key).with_ttl(self.inner.config.message_ttl);

        let client_id = format!("mqchat-{}", Uuid::new_v4().simple());
        let mut options = BrokerOptions::new(&params.server, params.port, &client_id);
        options.keep_alive = self.inner.config.keep_alive;
        options.credentials = params.credentials.clone();
        options.last_will = Some(LastWill {
            topic: own_presence_topic.clone(),
            payload: PresenceEnvelope::offline(&params.username)
                .to_json()?
                .into_bytes(),
            retain: true,
        });

        let mut shared = self.inner.lock();
        if shared.state.is_active() {
            return Err(SessionError::AlreadyActive(shared.state));
        }

        let (broker, rx) = self.inner.connector.connect(options)?;

        shared.generation += 1;
        let generation = shared.generation;
        shared.state = SessionState::Connecting;
        shared.active = Some(Active {
            presence: PresenceTracker::new(&params.username, self.inner.config.join_debounce),
            username: params.username.clone(),
            client_id,
            topics,
            own_presence_topic,
            codec,
            broker,
            runtime: runtime.clone(),
        });

        info!(
            server = %params.server,
            port = params.port,
            channel = %params.channel,
            user = %params.username,
            "Connecting"
        );
        let access = match &params.credentials {
            Some(credentials) => format!(
                "Using broker authentication for user: {}",
                credentials.username
            ),
            None => "Connecting with anonymous broker access".to_string(),
        };
        self.inner.emit_all(vec![
            ChatEvent::state(SessionState::Connecting),
            ChatEvent::notice(access),
        ]);
        drop(shared);

        runtime.spawn(run_events(Arc::downgrade(&self.inner), rx, generation));
        Ok(())
    }

    /// Publish a chat message and show it locally. Returns false when not
    /// connected, when `text` is blank, or when the publish could not be queued.
    pub fn send_message(&self, text: &str) -> bool {
        let text = text.trim();
        if text.is_empty() {
            return false;
        }

        let shared = self.inner.lock();
        if shared.state != SessionState::Connected {
            return false;
        }
        let Some(active) = shared.active.as_ref() else {
            return false;
        };

        let envelope = ChatEnvelope::new(&active.username, text);
        let payload = match active.codec.encode_chat(&envelope) {
            Ok(payload) => payload,
            Err(e) => {
                warn!(error = %e, "Failed to encode chat message");
                return false;
            }
        };
        if let Err(e) = active
            .broker
            .publish(active.topics.messages_topic(), payload.into_bytes(), false)
        {
            warn!(error = %e, "Failed to publish chat message");
            self.inner
                .emit_all(vec![ChatEvent::error(format!("Message not sent: {e}"))]);
            return false;
        }

        self.inner.emit_all(vec![ChatEvent::ChatMessage {
            user: envelope.user,
            text: envelope.message,
            timestamp: envelope.timestamp,
        }]);
        true
    }

    /// Leave the channel.
    ///
    /// From Connected the heartbeat is cancelled before this returns and the
    /// teardown runs in the background; the returned handle completes once
    /// the session is Disconnected. A pending connect is abandoned directly.
    /// Otherwise this is a no-op.
    pub fn disconnect(&self) -> Option<JoinHandle<()>> {
        let mut shared = self.inner.lock();
        match shared.state {
            SessionState::Connected => {
                shared.heartbeat.cancel();
                let Some(active) = shared.active.take() else {
                    shared.state = SessionState::Disconnected;
                    return None;
                };
                shared.state = SessionState::Disconnecting;
                let generation = shared.generation;
                self.inner
                    .emit_all(vec![ChatEvent::state(SessionState::Disconnecting)]);
                drop(shared);

                let runtime = active.runtime.clone();
                Some(runtime.spawn(teardown(self.inner.clone(), active, generation)))
            }
            SessionState::Connecting => {
                let active = shared.active.take();
                shared.state = SessionState::Disconnected;
                if let Some(active) = active {
                    if let Err(e) = active.broker.disconnect() {
                        debug!(error = %e, "Abandoning pending connection");
                    }
                }
                self.inner
                    .emit_all(vec![ChatEvent::state(SessionState::Disconnected)]);
                None
            }
            SessionState::Disconnecting | SessionState::Disconnected => None,
        }
    }

    /// Rebuild the user list: keep only ourselves and ask the broker to
    /// replay retained presence. Returns false unless connected.
    pub fn resync_presence(&self) -> bool {
        let mut shared = self.inner.lock();
        if shared.state != SessionState::Connected {
            return false;
        }
        let Some(active) = shared.active.as_mut() else {
            return false;
        };

        active.presence.clear_remote();
        let username = active.username.clone();
        active.presence.on_online(&username, now());
        let users = active.presence.users();
        if let Err(e) = active.broker.subscribe(&active.topics.presence_wildcard()) {
            warn!(error = %e, "Presence resubscribe failed");
        }

        debug!("Presence resync requested");
        self.inner.emit_all(vec![
            ChatEvent::notice("Refreshing user list"),
            ChatEvent::users(users),
        ]);
        true
    }
}
