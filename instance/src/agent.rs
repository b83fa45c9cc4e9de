//! Instance-side synchronization agent
//!
//! The agent authenticates the instance with the coordinator and carries
//! request/response traffic over the sync channel. All public operations are
//! non-blocking: they hand back a [`Completion`] and any waiting happens in
//! timer tasks spawned on the Tokio runtime, so they must be called from
//! within one.
//!
//! Authentication states:
//!
//! ```text
//! Unauthenticated -> Authenticating -> Authenticated
//!                                  \-> Failed
//! ```
//!
//! A session sends up to `max_auth_attempts` AUTH envelopes, one per
//! `auth_timeout`. Failed is terminal until the next explicit `authenticate()`.

use crate::completion::{Completion, Resolver};
use crate::config::AgentConfig;
use log::{debug, error, info, warn};
use shared::{get_timestamp, Envelope, TransportChannel};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, sleep, Instant};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthState {
    Unauthenticated,
    Authenticating,
    Authenticated,
    Failed,
}

/// A MESSAGE awaiting its MESSAGE_RESPONSE, keyed by correlation id
#[derive(Debug)]
struct PendingMessage {
    resolver: Resolver,
}

struct AuthSession {
    id: u64,
    waiters: Vec<Resolver>,
}

struct AuthCore {
    state: AuthState,
    attempts: u32,
    session: Option<AuthSession>,
    next_session_id: u64,
}

struct AgentInner {
    config: AgentConfig,
    channel: Arc<TransportChannel>,
    auth: Mutex<AuthCore>,
    pending: Mutex<HashMap<Uuid, PendingMessage>>,
    last_sync: Mutex<Option<Instant>>,
    health_task: Mutex<Option<JoinHandle<()>>>,
}

/// Handle to an instance's sync agent. Cheap to clone.
#[derive(Clone)]
pub struct ClientSyncAgent {
    inner: Arc<AgentInner>,
}

impl ClientSyncAgent {
    /// Creates the agent, registers the channel and installs the dispatch
    ///
    /// A failed registration is logged by the channel and retried lazily on
    /// the next `authenticate()`.
    pub fn new(config: AgentConfig, channel: Arc<TransportChannel>) -> Self {
        let inner = Arc::new(AgentInner {
            config,
            channel: Arc::clone(&channel),
            auth: Mutex::new(AuthCore {
                state: AuthState::Unauthenticated,
                attempts: 0,
                session: None,
                next_session_id: 1,
            }),
            pending: Mutex::new(HashMap::new()),
            last_sync: Mutex::new(None),
            health_task: Mutex::new(None),
        });

        let weak: Weak<AgentInner> = Arc::downgrade(&inner);
        channel.set_dispatch(move |payload, _from| {
            if let Some(inner) = weak.upgrade() {
                inner.handle_payload(payload);
            }
        });
        let _ = channel.register_channel();

        Self { inner }
    }

    /// Starts (or restarts) the periodic connection health check
    pub fn spawn_health_check(&self) {
        let weak = Arc::downgrade(&self.inner);
        let period = self.inner.config.health_interval;

        let handle = tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            loop {
                ticker.tick().await;
                match weak.upgrade() {
                    Some(inner) => {
                        inner.check_health();
                    }
                    None => break,
                }
            }
        });

        if let Some(previous) = self.inner.lock_health_task().replace(handle) {
            previous.abort();
        }
    }

    /// Authenticates with the coordinator
    ///
    /// Resolves immediately with `true` when already authenticated. Calls made
    /// while a session is in flight join that session.
    pub fn authenticate(&self) -> Completion {
        AgentInner::authenticate(&self.inner)
    }

    /// Sends a typed message and resolves with the coordinator's verdict
    ///
    /// Resolves `false` immediately when not authenticated or no carrier is
    /// connected, and after `message_timeout` without a response.
    pub fn send_message<I, K, V>(&self, message_type: &str, data: I) -> Completion
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let fields = data
            .into_iter()
            .map(|(key, value)| (key.into(), value.into()))
            .collect();
        AgentInner::send_message(&self.inner, message_type, fields)
    }

    /// Fire-and-forget liveness probe. Reports whether the ping was sent.
    pub fn ping(&self) -> bool {
        self.inner.ping()
    }

    /// Runs one health check pass. Returns true if a probe was sent.
    pub fn check_health(&self) -> bool {
        self.inner.check_health()
    }

    /// Host hook for a carrier connecting
    ///
    /// Schedules authentication after `carrier_grace` when the agent has
    /// never authenticated and no session is in flight.
    pub fn on_carrier_available(&self) {
        let idle = {
            let auth = self.inner.lock_auth();
            auth.state == AuthState::Unauthenticated && auth.session.is_none()
        };
        if !idle {
            return;
        }

        info!("Carrier connected, attempting authentication with coordinator");
        let weak = Arc::downgrade(&self.inner);
        let grace = self.inner.config.carrier_grace;
        tokio::spawn(async move {
            sleep(grace).await;
            if let Some(inner) = weak.upgrade() {
                let _ = AgentInner::authenticate(&inner);
            }
        });
    }

    pub fn is_authenticated(&self) -> bool {
        self.state() == AuthState::Authenticated
    }

    pub fn state(&self) -> AuthState {
        self.inner.lock_auth().state
    }

    pub fn pending_count(&self) -> usize {
        self.inner.lock_pending().len()
    }

    pub fn last_successful_sync(&self) -> Option<Instant> {
        *self.inner.lock_last_sync()
    }

    /// Shuts the agent down
    ///
    /// Every outstanding message and any in-flight authentication resolve
    /// `false`, the health check stops and the channel is unregistered. Safe
    /// to call repeatedly.
    pub fn cleanup(&self) {
        let pending: Vec<PendingMessage> = self
            .inner
            .lock_pending()
            .drain()
            .map(|(_, message)| message)
            .collect();
        if !pending.is_empty() {
            info!("Abandoning {} pending messages", pending.len());
        }
        for message in pending {
            message.resolver.resolve(false);
        }

        let session = {
            let mut auth = self.inner.lock_auth();
            let session = auth.session.take();
            if session.is_some() {
                auth.state = AuthState::Unauthenticated;
            }
            session
        };
        if let Some(session) = session {
            resolve_all(session.waiters, false);
        }

        if let Some(task) = self.inner.lock_health_task().take() {
            task.abort();
        }

        self.inner.channel.unregister();
    }
}

impl AgentInner {
    fn lock_auth(&self) -> MutexGuard<'_, AuthCore> {
        self.auth.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_pending(&self) -> MutexGuard<'_, HashMap<Uuid, PendingMessage>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_last_sync(&self) -> MutexGuard<'_, Option<Instant>> {
        self.last_sync.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_health_task(&self) -> MutexGuard<'_, Option<JoinHandle<()>>> {
        self.health_task.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn mark_synced(&self) {
        *self.lock_last_sync() = Some(Instant::now());
    }

    fn is_authenticated(&self) -> bool {
        self.lock_auth().state == AuthState::Authenticated
    }

    fn authenticate(this: &Arc<Self>) -> Completion {
        let mut auth = this.lock_auth();
        if auth.state == AuthState::Authenticated {
            return Completion::ready(true);
        }

        let (resolver, completion) = Completion::channel();
        if let Some(session) = auth.session.as_mut() {
            session.waiters.push(resolver);
            return completion;
        }

        let token_usable = this
            .config
            .token
            .as_ref()
            .map_or(false, |token| token.is_usable());
        if !token_usable {
            error!("Invalid sync token configured, refusing to authenticate");
            auth.state = AuthState::Failed;
            resolver.resolve(false);
            return completion;
        }

        if !this.channel.is_registered() {
            warn!("Sync channel not registered, attempting to register");
            if this.channel.register_channel().is_err() {
                error!("Failed to register sync channel, authentication aborted");
                auth.state = AuthState::Failed;
                resolver.resolve(false);
                return completion;
            }
        }

        if !this.channel.has_carrier() {
            info!("No carrier connected, authentication will be attempted when one joins");
            resolver.resolve(false);
            return completion;
        }

        let session_id = auth.next_session_id;
        auth.next_session_id += 1;
        auth.attempts = 0;
        auth.state = AuthState::Authenticating;
        auth.session = Some(AuthSession {
            id: session_id,
            waiters: vec![resolver],
        });
        drop(auth);

        Self::attempt(this, session_id);
        completion
    }

    /// Sends one AUTH envelope for the session and arms its timeout
    fn attempt(this: &Arc<Self>, session_id: u64) {
        let mut auth = this.lock_auth();
        if auth.session.as_ref().map(|s| s.id) != Some(session_id) {
            return;
        }

        let token = match this.config.token.as_ref() {
            Some(token) => token.as_str().to_string(),
            None => return,
        };

        if !this.channel.has_carrier() {
            info!("Carrier lost during authentication, waiting for the next one");
            auth.state = AuthState::Unauthenticated;
            let session = auth.session.take();
            drop(auth);
            if let Some(session) = session {
                resolve_all(session.waiters, false);
            }
            return;
        }

        auth.attempts += 1;
        let attempt = auth.attempts;
        drop(auth);

        let envelope = Envelope::Auth {
            token,
            plugin_version: this.config.plugin_version.clone(),
        };
        match envelope.encode() {
            Ok(bytes) => {
                info!(
                    "Sending authentication request to coordinator (attempt {}/{})",
                    attempt, this.config.max_auth_attempts
                );
                if !this.channel.send(&bytes) {
                    warn!("Authentication request could not be relayed");
                }
            }
            Err(e) => error!("Failed to encode authentication request: {}", e),
        }

        let weak = Arc::downgrade(this);
        let timeout = this.config.auth_timeout;
        tokio::spawn(async move {
            sleep(timeout).await;
            if let Some(inner) = weak.upgrade() {
                Self::on_auth_timeout(&inner, session_id, attempt);
            }
        });
    }

    fn on_auth_timeout(this: &Arc<Self>, session_id: u64, attempt: u32) {
        let mut auth = this.lock_auth();
        let current = auth.session.as_ref().map(|s| s.id) == Some(session_id);
        if !current || auth.attempts != attempt {
            return;
        }

        warn!(
            "Authentication request timed out after {:?}",
            this.config.auth_timeout
        );

        if auth.attempts < this.config.max_auth_attempts {
            info!(
                "Retrying authentication (attempt {}/{})",
                auth.attempts + 1,
                this.config.max_auth_attempts
            );
            drop(auth);
            Self::attempt(this, session_id);
        } else {
            error!("Maximum authentication attempts reached, authentication failed");
            auth.state = AuthState::Failed;
            let session = auth.session.take();
            drop(auth);
            if let Some(session) = session {
                resolve_all(session.waiters, false);
            }
        }
    }

    fn send_message(this: &Arc<Self>, message_type: &str, fields: Vec<(String, String)>) -> Completion {
        if !this.is_authenticated() {
            warn!("Cannot send {}: not authenticated with coordinator", message_type);
            return Completion::ready(false);
        }
        if !this.channel.has_carrier() {
            warn!("Cannot send {}: no carrier connected", message_type);
            return Completion::ready(false);
        }

        let correlation_id = Uuid::new_v4();
        let envelope = Envelope::Message {
            correlation_id,
            message_type: message_type.to_string(),
            fields,
        };
        let bytes = match envelope.encode() {
            Ok(bytes) => bytes,
            Err(e) => {
                error!("Failed to encode {} message: {}", message_type, e);
                return Completion::ready(false);
            }
        };

        // Registered before sending so a reply relayed synchronously finds it
        let (resolver, completion) = Completion::channel();
        this.lock_pending().insert(
            correlation_id,
            PendingMessage { resolver },
        );

        if !this.channel.send(&bytes) {
            error!("Failed to relay {} message {}", message_type, correlation_id);
            this.resolve_pending(correlation_id, false);
            return completion;
        }
        debug!("Sent {} message {}", message_type, correlation_id);

        let weak = Arc::downgrade(this);
        let timeout = this.config.message_timeout;
        tokio::spawn(async move {
            sleep(timeout).await;
            if let Some(inner) = weak.upgrade() {
                if inner.resolve_pending(correlation_id, false) {
                    warn!("Message {} delivery timed out", correlation_id);
                }
            }
        });

        completion
    }

    /// Removes and completes a pending entry. Whoever removes it wins.
    fn resolve_pending(&self, correlation_id: Uuid, success: bool) -> bool {
        let entry = self.lock_pending().remove(&correlation_id);
        match entry {
            Some(message) => {
                message.resolver.resolve(success);
                true
            }
            None => false,
        }
    }

    fn ping(&self) -> bool {
        if !self.is_authenticated() || !self.channel.has_carrier() {
            return false;
        }

        let envelope = Envelope::Ping {
            timestamp: get_timestamp(),
        };
        match envelope.encode() {
            Ok(bytes) => self.channel.send(&bytes),
            Err(e) => {
                error!("Failed to encode ping: {}", e);
                false
            }
        }
    }

    fn check_health(&self) -> bool {
        if !self.is_authenticated() || !self.channel.has_carrier() {
            return false;
        }

        let threshold = self.config.sync_threshold;
        let stale = match *self.lock_last_sync() {
            Some(at) => at.elapsed() > threshold,
            None => true,
        };

        if stale {
            warn!(
                "No coordinator communication for {:?}, checking connection",
                threshold
            );
            self.ping()
        } else {
            false
        }
    }

    fn handle_payload(&self, payload: &[u8]) {
        let envelope = match Envelope::decode(payload) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!("Dropping malformed envelope from coordinator: {}", e);
                return;
            }
        };

        match envelope {
            Envelope::AuthResponse {
                valid,
                coordinator_name,
                coordinator_version,
            } => self.on_auth_response(valid, &coordinator_name, &coordinator_version),

            Envelope::MessageResponse {
                correlation_id,
                success,
            } => {
                if success {
                    self.mark_synced();
                }
                if !self.resolve_pending(correlation_id, success) {
                    debug!("Response for unknown or expired message {}", correlation_id);
                } else if success {
                    debug!("Message {} delivered", correlation_id);
                } else {
                    warn!("Message {} delivery failed", correlation_id);
                }
            }

            Envelope::PingResponse { timestamp } => {
                self.mark_synced();
                debug!(
                    "Ping response from coordinator ({}ms round trip)",
                    get_timestamp().saturating_sub(timestamp)
                );
            }

            other => {
                warn!("Unexpected {} envelope from coordinator", other.kind());
            }
        }
    }

    fn on_auth_response(&self, valid: bool, coordinator_name: &str, coordinator_version: &str) {
        let session = {
            let mut auth = self.lock_auth();
            auth.state = if valid {
                AuthState::Authenticated
            } else {
                AuthState::Failed
            };
            auth.session.take()
        };

        if valid {
            self.mark_synced();
            info!(
                "Authenticated with coordinator '{}' (version {})",
                coordinator_name, coordinator_version
            );
        } else {
            error!("Coordinator rejected the sync token, check the token configuration");
        }

        match session {
            Some(session) => resolve_all(session.waiters, valid),
            None => debug!("Auth response arrived with no session in flight"),
        }
    }
}

fn resolve_all(waiters: Vec<Resolver>, value: bool) {
    for waiter in waiters {
        waiter.resolve(value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_approx_eq::assert_approx_eq;
    use shared::transport::{ChannelRegistrar, Messenger, TransportError};
    use shared::{Carrier, CarrierSet, CHANNEL, PLACEHOLDER_TOKEN};
    use std::time::Duration;

    /// Carrier that records every payload it is asked to relay
    #[derive(Default)]
    struct TestCarrier {
        sent: Mutex<Vec<Vec<u8>>>,
    }

    impl TestCarrier {
        fn envelopes(&self) -> Vec<Envelope> {
            self.sent
                .lock()
                .unwrap()
                .iter()
                .map(|bytes| Envelope::decode(bytes).unwrap())
                .collect()
        }

        fn count(&self, kind: &str) -> usize {
            self.envelopes().iter().filter(|e| e.kind() == kind).count()
        }

        fn clear(&self) {
            self.sent.lock().unwrap().clear();
        }

        fn last_correlation_id(&self) -> Uuid {
            self.envelopes()
                .iter()
                .rev()
                .find_map(|e| e.correlation_id())
                .unwrap()
        }
    }

    impl Carrier for TestCarrier {
        fn id(&self) -> String {
            "test-carrier".to_string()
        }

        fn relay(&self, _channel: &str, payload: &[u8]) -> Result<(), TransportError> {
            self.sent.lock().unwrap().push(payload.to_vec());
            Ok(())
        }
    }

    struct Harness {
        agent: ClientSyncAgent,
        carriers: Arc<CarrierSet>,
        carrier: Arc<TestCarrier>,
        channel: Arc<TransportChannel>,
    }

    impl Harness {
        fn new(config: AgentConfig) -> Self {
            Self::with_messenger(config, Arc::new(Messenger::new()))
        }

        fn with_messenger(config: AgentConfig, messenger: Arc<Messenger>) -> Self {
            let carriers = Arc::new(CarrierSet::new());
            let channel = Arc::new(TransportChannel::new(
                CHANNEL,
                "instance",
                messenger,
                Arc::clone(&carriers) as Arc<dyn shared::CarrierSource>,
            ));
            let agent = ClientSyncAgent::new(config, Arc::clone(&channel));
            Self {
                agent,
                carriers,
                carrier: Arc::new(TestCarrier::default()),
                channel,
            }
        }

        fn connect(&self) {
            self.carriers.join(Arc::clone(&self.carrier) as Arc<dyn Carrier>);
        }

        fn deliver(&self, envelope: Envelope) {
            let from: Arc<dyn Carrier> = Arc::clone(&self.carrier) as Arc<dyn Carrier>;
            self.channel.on_receive(&envelope.encode().unwrap(), &from);
        }

        fn accept(&self) {
            self.deliver(Envelope::AuthResponse {
                valid: true,
                coordinator_name: "proxy".to_string(),
                coordinator_version: "1.0.0".to_string(),
            });
        }

        async fn authenticated(config: AgentConfig) -> Self {
            let harness = Self::new(config);
            harness.connect();
            let completion = harness.agent.authenticate();
            harness.accept();
            assert!(completion.await);
            harness.carrier.clear();
            harness
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_authenticate_without_carrier_sends_nothing() {
        let harness = Harness::new(AgentConfig::new("abc"));

        assert!(!harness.agent.authenticate().await);
        assert_eq!(harness.agent.state(), AuthState::Unauthenticated);
        assert!(harness.carrier.envelopes().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_placeholder_token_fails_fast() {
        let harness = Harness::new(AgentConfig::new(PLACEHOLDER_TOKEN));
        harness.connect();

        assert!(!harness.agent.authenticate().await);
        assert_eq!(harness.agent.state(), AuthState::Failed);
        assert!(harness.carrier.envelopes().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_token_fails_fast() {
        let harness = Harness::new(AgentConfig::default());
        harness.connect();

        assert!(!harness.agent.authenticate().await);
        assert_eq!(harness.agent.state(), AuthState::Failed);
        assert!(harness.carrier.envelopes().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_registration_failure_fails() {
        let messenger = Arc::new(Messenger::new());
        messenger.register(CHANNEL, "another-plugin").unwrap();

        let harness = Harness::with_messenger(AgentConfig::new("abc"), messenger);
        harness.connect();

        assert!(!harness.agent.authenticate().await);
        assert_eq!(harness.agent.state(), AuthState::Failed);
        assert!(harness.carrier.envelopes().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_successful_handshake() {
        let harness = Harness::new(AgentConfig::new("abc"));
        harness.connect();

        let completion = harness.agent.authenticate();
        assert_eq!(harness.agent.state(), AuthState::Authenticating);

        match harness.carrier.envelopes().as_slice() {
            [Envelope::Auth {
                token,
                plugin_version,
            }] => {
                assert_eq!(token, "abc");
                assert_eq!(plugin_version, env!("CARGO_PKG_VERSION"));
            }
            other => panic!("expected one AUTH, got {:?}", other),
        }

        harness.accept();
        assert!(completion.await);
        assert!(harness.agent.is_authenticated());
        assert!(harness.agent.last_successful_sync().is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejected_token_sets_failed() {
        let harness = Harness::new(AgentConfig::new("wrong"));
        harness.connect();

        let completion = harness.agent.authenticate();
        harness.deliver(Envelope::AuthResponse {
            valid: false,
            coordinator_name: "proxy".to_string(),
            coordinator_version: "1.0.0".to_string(),
        });

        assert!(!completion.await);
        assert_eq!(harness.agent.state(), AuthState::Failed);
        assert!(!harness.agent.is_authenticated());
    }

    #[tokio::test(start_paused = true)]
    async fn test_short_circuit_when_authenticated() {
        let harness = Harness::authenticated(AgentConfig::new("abc")).await;

        assert!(harness.agent.authenticate().await);
        assert!(harness.carrier.envelopes().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_auth_retries_are_bounded() {
        let harness = Harness::new(AgentConfig::new("abc"));
        harness.connect();

        let start = Instant::now();
        assert!(!harness.agent.authenticate().await);

        assert_eq!(harness.carrier.count(Envelope::AUTH), 5);
        assert_eq!(harness.agent.state(), AuthState::Failed);
        assert_approx_eq!(start.elapsed().as_secs_f64(), 50.0, 0.5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_carrier_lost_mid_session_reverts_to_unauthenticated() {
        let harness = Harness::new(AgentConfig::new("abc"));
        harness.connect();

        let completion = harness.agent.authenticate();
        assert_eq!(harness.agent.state(), AuthState::Authenticating);
        assert_eq!(harness.carrier.count(Envelope::AUTH), 1);

        harness.carriers.quit(&harness.carrier.id());
        let start = Instant::now();

        assert!(!completion.await);
        assert_approx_eq!(start.elapsed().as_secs_f64(), 10.0, 0.5);
        assert_eq!(harness.agent.state(), AuthState::Unauthenticated);
        assert_eq!(harness.carrier.count(Envelope::AUTH), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_then_success() {
        let harness = Harness::new(AgentConfig::new("abc"));
        harness.connect();

        let completion = harness.agent.authenticate();
        sleep(Duration::from_secs(11)).await;
        assert_eq!(harness.carrier.count(Envelope::AUTH), 2);

        harness.accept();
        assert!(completion.await);

        // The armed timer for attempt 2 must not trigger a third AUTH
        sleep(Duration::from_secs(30)).await;
        assert_eq!(harness.carrier.count(Envelope::AUTH), 2);
        assert!(harness.agent.is_authenticated());
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_state_allows_new_session() {
        let harness = Harness::new(AgentConfig::new("abc"));
        harness.connect();

        assert!(!harness.agent.authenticate().await);
        assert_eq!(harness.agent.state(), AuthState::Failed);
        harness.carrier.clear();

        let completion = harness.agent.authenticate();
        assert_eq!(harness.agent.state(), AuthState::Authenticating);
        assert_eq!(harness.carrier.count(Envelope::AUTH), 1);

        harness.accept();
        assert!(completion.await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_callers_share_session() {
        let harness = Harness::new(AgentConfig::new("abc"));
        harness.connect();

        let first = harness.agent.authenticate();
        let second = harness.agent.authenticate();
        assert_eq!(harness.carrier.count(Envelope::AUTH), 1);

        harness.accept();
        assert!(first.await);
        assert!(second.await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_message_requires_auth() {
        let harness = Harness::new(AgentConfig::new("abc"));
        harness.connect();

        assert!(!harness.agent.send_message("NEW_REPORT", [("id", "1")]).await);
        assert_eq!(harness.agent.pending_count(), 0);
        assert!(harness.carrier.envelopes().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_message_requires_carrier() {
        let harness = Harness::authenticated(AgentConfig::new("abc")).await;
        harness.carriers.quit("test-carrier");

        assert!(!harness.agent.send_message("NEW_REPORT", [("id", "1")]).await);
        assert_eq!(harness.agent.pending_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_message_resolves_on_response() {
        let harness = Harness::authenticated(AgentConfig::new("abc")).await;

        let completion = harness
            .agent
            .send_message("NEW_REPORT", [("id", "7"), ("reason", "spam")]);
        assert_eq!(harness.agent.pending_count(), 1);

        let correlation_id = harness.carrier.last_correlation_id();
        match &harness.carrier.envelopes()[0] {
            Envelope::Message {
                message_type,
                fields,
                ..
            } => {
                assert_eq!(message_type, "NEW_REPORT");
                assert_eq!(fields.len(), 2);
            }
            other => panic!("expected MESSAGE, got {:?}", other),
        }

        harness.deliver(Envelope::MessageResponse {
            correlation_id,
            success: true,
        });
        assert!(completion.await);
        assert_eq!(harness.agent.pending_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_message_times_out() {
        let harness = Harness::authenticated(AgentConfig::new("abc")).await;

        let start = Instant::now();
        let completion = harness.agent.send_message("NEW_REPORT", [("id", "7")]);
        let correlation_id = harness.carrier.last_correlation_id();

        assert!(!completion.await);
        assert_approx_eq!(start.elapsed().as_secs_f64(), 5.0, 1.0);
        assert_eq!(harness.agent.pending_count(), 0);

        // A late response finds nothing to resolve
        harness.deliver(Envelope::MessageResponse {
            correlation_id,
            success: true,
        });
        assert_eq!(harness.agent.pending_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_messages_are_isolated() {
        let harness = Harness::authenticated(AgentConfig::new("abc")).await;

        let first = harness.agent.send_message("NEW_REPORT", [("id", "1")]);
        let first_id = harness.carrier.last_correlation_id();
        let second = harness.agent.send_message("NEW_REPORT", [("id", "2")]);
        let second_id = harness.carrier.last_correlation_id();
        assert_ne!(first_id, second_id);

        harness.deliver(Envelope::MessageResponse {
            correlation_id: second_id,
            success: false,
        });
        harness.deliver(Envelope::MessageResponse {
            correlation_id: first_id,
            success: true,
        });

        assert!(first.await);
        assert!(!second.await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_ping_requires_auth() {
        let harness = Harness::new(AgentConfig::new("abc"));
        harness.connect();
        assert!(!harness.agent.ping());

        let harness = Harness::authenticated(AgentConfig::new("abc")).await;
        assert!(harness.agent.ping());
        assert_eq!(harness.carrier.count(Envelope::PING), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_health_check_skips_recent_sync() {
        let harness = Harness::authenticated(AgentConfig::new("abc")).await;

        assert!(!harness.agent.check_health());
        assert!(harness.carrier.envelopes().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_health_check_pings_when_stale() {
        let config = AgentConfig {
            health_interval: Duration::from_secs(60),
            ..AgentConfig::new("abc")
        };
        let harness = Harness::authenticated(config).await;
        harness.agent.spawn_health_check();

        sleep(Duration::from_secs(250)).await;
        assert_eq!(harness.carrier.count(Envelope::PING), 0);

        sleep(Duration::from_secs(120)).await;
        assert!(harness.carrier.count(Envelope::PING) >= 1);

        harness.deliver(Envelope::PingResponse {
            timestamp: get_timestamp(),
        });
        assert!(!harness.agent.check_health());
        assert!(harness.agent.is_authenticated());
    }

    #[tokio::test(start_paused = true)]
    async fn test_carrier_available_triggers_auth() {
        let harness = Harness::new(AgentConfig::new("abc"));
        assert!(!harness.agent.authenticate().await);

        harness.connect();
        harness.agent.on_carrier_available();
        sleep(Duration::from_secs(2)).await;

        assert_eq!(harness.carrier.count(Envelope::AUTH), 1);
        assert_eq!(harness.agent.state(), AuthState::Authenticating);
    }

    #[tokio::test(start_paused = true)]
    async fn test_carrier_available_ignored_when_failed() {
        let harness = Harness::new(AgentConfig::new(PLACEHOLDER_TOKEN));
        assert!(!harness.agent.authenticate().await);

        harness.connect();
        harness.agent.on_carrier_available();
        sleep(Duration::from_secs(2)).await;

        assert!(harness.carrier.envelopes().is_empty());
        assert_eq!(harness.agent.state(), AuthState::Failed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cleanup_resolves_outstanding_work() {
        let harness = Harness::authenticated(AgentConfig::new("abc")).await;
        harness.agent.spawn_health_check();

        let completion = harness.agent.send_message("NEW_REPORT", [("id", "1")]);
        harness.agent.cleanup();

        assert!(!completion.await);
        assert_eq!(harness.agent.pending_count(), 0);
        assert!(!harness.channel.is_registered());

        harness.agent.cleanup();
    }

    #[tokio::test(start_paused = true)]
    async fn test_cleanup_without_registration() {
        let messenger = Arc::new(Messenger::new());
        messenger.register(CHANNEL, "another-plugin").unwrap();
        let harness = Harness::with_messenger(AgentConfig::new("abc"), Arc::clone(&messenger));

        harness.agent.cleanup();
        assert!(messenger.is_registered(CHANNEL));
    }

    #[tokio::test(start_paused = true)]
    async fn test_malformed_payload_is_dropped() {
        let harness = Harness::authenticated(AgentConfig::new("abc")).await;
        let from: Arc<dyn Carrier> = Arc::clone(&harness.carrier) as Arc<dyn Carrier>;

        harness.channel.on_receive(b"\x01\x02\x03", &from);
        harness.deliver(Envelope::Ping { timestamp: 1 });

        assert!(harness.agent.is_authenticated());
    }
}
