//! Named side-channel relayed through transiently available carriers
//!
//! A carrier is any connected peer able to forward bytes toward the other end.
//! The channel keeps no queue: when no carrier is connected a send fails
//! immediately and the caller decides when to try again, typically on the next
//! carrier-available event.

pub mod udp;

use log::{debug, error, info, warn};
use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use thiserror::Error;

pub use udp::{ChannelFrame, UdpCarrier};

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("invalid channel name `{0}`")]
    InvalidChannel(String),
    #[error("channel `{channel}` is already registered by {owner}")]
    AlreadyClaimed { channel: String, owner: String },
    #[error("carrier {carrier} failed to relay: {source}")]
    Relay {
        carrier: String,
        #[source]
        source: io::Error,
    },
}

/// A connected peer that can forward payloads on a named channel
pub trait Carrier: Send + Sync {
    /// Stable identifier used in logs and for removal
    fn id(&self) -> String;

    fn relay(&self, channel: &str, payload: &[u8]) -> Result<(), TransportError>;
}

/// Supplies whichever carrier is currently connected
pub trait CarrierSource: Send + Sync {
    fn any_carrier(&self) -> Option<Arc<dyn Carrier>>;

    fn has_carrier(&self) -> bool {
        self.any_carrier().is_some()
    }
}

/// Registry of connected carriers maintained from host join/quit events
#[derive(Default)]
pub struct CarrierSet {
    carriers: RwLock<HashMap<String, Arc<dyn Carrier>>>,
}

impl CarrierSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a carrier. Returns true when this made the set non-empty.
    pub fn join(&self, carrier: Arc<dyn Carrier>) -> bool {
        let mut carriers = self.carriers.write().unwrap_or_else(PoisonError::into_inner);
        let was_empty = carriers.is_empty();
        let id = carrier.id();
        debug!("Carrier {} joined", id);
        carriers.insert(id, carrier);
        was_empty
    }

    /// Removes a carrier by id. Returns true if it was present.
    pub fn quit(&self, id: &str) -> bool {
        let mut carriers = self.carriers.write().unwrap_or_else(PoisonError::into_inner);
        let removed = carriers.remove(id).is_some();
        if removed {
            debug!("Carrier {} left", id);
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.carriers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl CarrierSource for CarrierSet {
    fn any_carrier(&self) -> Option<Arc<dyn Carrier>> {
        self.carriers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .next()
            .cloned()
    }
}

/// Host facility that owns channel names
pub trait ChannelRegistrar: Send + Sync {
    fn register(&self, channel: &str, owner: &str) -> Result<(), TransportError>;

    fn unregister(&self, channel: &str, owner: &str);
}

/// In-process channel registry
///
/// Channel names take the form `namespace:name` using lowercase ASCII letters,
/// digits, `.`, `_` and `-`. A name can be held by one owner at a time;
/// re-registering by the same owner succeeds.
#[derive(Default)]
pub struct Messenger {
    channels: Mutex<HashMap<String, String>>,
}

impl Messenger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_registered(&self, channel: &str) -> bool {
        self.channels
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(channel)
    }
}

impl ChannelRegistrar for Messenger {
    fn register(&self, channel: &str, owner: &str) -> Result<(), TransportError> {
        if !is_valid_channel(channel) {
            return Err(TransportError::InvalidChannel(channel.to_string()));
        }

        let mut channels = self.channels.lock().unwrap_or_else(PoisonError::into_inner);
        match channels.get(channel) {
            Some(current) if current != owner => Err(TransportError::AlreadyClaimed {
                channel: channel.to_string(),
                owner: current.clone(),
            }),
            _ => {
                channels.insert(channel.to_string(), owner.to_string());
                Ok(())
            }
        }
    }

    fn unregister(&self, channel: &str, owner: &str) {
        let mut channels = self.channels.lock().unwrap_or_else(PoisonError::into_inner);
        if channels.get(channel).map(String::as_str) == Some(owner) {
            channels.remove(channel);
        }
    }
}

/// Checks the `namespace:name` channel identifier format
pub fn is_valid_channel(name: &str) -> bool {
    let valid_part = |part: &str| {
        !part.is_empty()
            && part
                .chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || "._-".contains(c))
    };

    match name.split_once(':') {
        Some((namespace, path)) => valid_part(namespace) && valid_part(path),
        None => false,
    }
}

/// Callback receiving each payload together with the carrier it arrived on
pub type Dispatch = dyn Fn(&[u8], &Arc<dyn Carrier>) + Send + Sync;

/// A registered side-channel bound to a carrier source
pub struct TransportChannel {
    name: String,
    owner: String,
    registrar: Arc<dyn ChannelRegistrar>,
    carriers: Arc<dyn CarrierSource>,
    registered: AtomicBool,
    dispatch: RwLock<Option<Arc<Dispatch>>>,
}

impl TransportChannel {
    pub fn new(
        name: impl Into<String>,
        owner: impl Into<String>,
        registrar: Arc<dyn ChannelRegistrar>,
        carriers: Arc<dyn CarrierSource>,
    ) -> Self {
        Self {
            name: name.into(),
            owner: owner.into(),
            registrar,
            carriers,
            registered: AtomicBool::new(false),
            dispatch: RwLock::new(None),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Registers the channel with the host. A no-op when already registered.
    ///
    /// Failures are logged here and handed back as a value; nothing past this
    /// boundary needs to care how the registrar failed.
    pub fn register_channel(&self) -> Result<(), TransportError> {
        if self.registered.load(Ordering::Acquire) {
            return Ok(());
        }

        info!("Registering channel {}", self.name);
        match self.registrar.register(&self.name, &self.owner) {
            Ok(()) => {
                self.registered.store(true, Ordering::Release);
                info!("Channel {} registered", self.name);
                Ok(())
            }
            Err(e) => {
                error!("Failed to register channel {}: {}", self.name, e);
                Err(e)
            }
        }
    }

    pub fn is_registered(&self) -> bool {
        self.registered.load(Ordering::Acquire)
    }

    /// Releases the channel name. Safe to call when never registered.
    pub fn unregister(&self) {
        if self.registered.swap(false, Ordering::AcqRel) {
            self.registrar.unregister(&self.name, &self.owner);
            info!("Channel {} unregistered", self.name);
        }
    }

    /// Installs the callback invoked for every received payload
    pub fn set_dispatch<F>(&self, dispatch: F)
    where
        F: Fn(&[u8], &Arc<dyn Carrier>) + Send + Sync + 'static,
    {
        *self.dispatch.write().unwrap_or_else(PoisonError::into_inner) = Some(Arc::new(dispatch));
    }

    pub fn has_carrier(&self) -> bool {
        self.carriers.has_carrier()
    }

    /// Relays a payload through any connected carrier
    pub fn send(&self, payload: &[u8]) -> bool {
        if !self.is_registered() {
            debug!("Dropping send on unregistered channel {}", self.name);
            return false;
        }

        match self.carriers.any_carrier() {
            Some(carrier) => self.send_via(&carrier, payload),
            None => {
                debug!("No carrier available on channel {}", self.name);
                false
            }
        }
    }

    /// Relays a payload through a specific carrier, e.g. to answer on the
    /// connection a request arrived on
    pub fn send_via(&self, carrier: &Arc<dyn Carrier>, payload: &[u8]) -> bool {
        if !self.is_registered() {
            return false;
        }

        match carrier.relay(&self.name, payload) {
            Ok(()) => true,
            Err(e) => {
                warn!("Send on channel {} failed: {}", self.name, e);
                false
            }
        }
    }

    /// Hands an incoming payload to the dispatch callback
    pub fn on_receive(&self, payload: &[u8], from: &Arc<dyn Carrier>) {
        if !self.is_registered() {
            debug!(
                "Ignoring {} bytes on unregistered channel {}",
                payload.len(),
                self.name
            );
            return;
        }

        // Clone out of the lock so the callback may reinstall itself
        let dispatch = self
            .dispatch
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();

        match dispatch {
            Some(dispatch) => dispatch(payload, from),
            None => debug!("No dispatch installed on channel {}", self.name),
        }
    }
}
