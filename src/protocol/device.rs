//! Device handles.
//!
//! A [`DeviceHandle`] is the client-side identity of one peripheral. Device
//! specific modules declare which functions the device has and whether each
//! one answers, then issue calls through the owning `Connection`.

use crate::core::base58;
use crate::core::payload::{Format, Value};
use crate::error::{constants, ProtocolError, Result};
use crate::protocol::correlator::Correlator;
use crate::protocol::message::FUNCTION_GET_IDENTITY;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use tracing::debug;

/// Whether a function sends a response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseExpected {
    /// Getter: always answers, cannot be changed
    AlwaysTrue,
    /// Setter: answers only if enabled
    Toggle(bool),
    /// The device has no such function
    Unknown,
}

impl ResponseExpected {
    /// `None` for unknown functions.
    pub fn expects_response(self) -> Option<bool> {
        match self {
            ResponseExpected::AlwaysTrue => Some(true),
            ResponseExpected::Toggle(flag) => Some(flag),
            ResponseExpected::Unknown => None,
        }
    }
}

/// API version assumed when a device module does not name one.
pub const DEFAULT_API_VERSION: [u8; 3] = [2, 0, 0];

type CallbackFn = dyn Fn(&[Value]) + Send + Sync + 'static;

/// Decoding format and handler for one callback id.
#[derive(Clone)]
pub(crate) struct CallbackSlot {
    pub(crate) format: Arc<Format>,
    pub(crate) handler: Arc<CallbackFn>,
}

struct DeviceInner {
    uid: String,
    peer_id: u32,
    api_version: [u8; 3],
    replaced: AtomicBool,
    response_expected: RwLock<HashMap<u8, ResponseExpected>>,
    callbacks: RwLock<HashMap<u8, CallbackSlot>>,
    correlator: Correlator,
    /// One lock per streamed function, created on first use.
    stream_locks: Mutex<HashMap<u8, Arc<tokio::sync::Mutex<()>>>>,
}

/// Shared handle to one device. Cloning yields the same identity.
#[derive(Clone)]
pub struct DeviceHandle {
    inner: Arc<DeviceInner>,
}

impl DeviceHandle {
    /// Create an unregistered handle for the device labelled `uid`.
    ///
    /// Every device answers `get_identity`, so that function is declared up
    /// front. Use `Connection::add_device` to create and register in one step.
    pub fn new(uid: &str) -> Result<Self> {
        Self::with_api_version(uid, DEFAULT_API_VERSION)
    }

    /// Like [`DeviceHandle::new`], for a device module built against
    /// `api_version`.
    pub fn with_api_version(uid: &str, api_version: [u8; 3]) -> Result<Self> {
        let peer_id = base58::parse_uid(uid)?;
        Ok(Self::with_peer_id(uid, peer_id, api_version))
    }

    /// Handle for an already resolved peer id, with an explicit function
    /// table.
    pub(crate) fn with_functions(
        uid: &str,
        peer_id: u32,
        functions: &[(u8, ResponseExpected)],
    ) -> Self {
        let device = Self::with_peer_id(uid, peer_id, DEFAULT_API_VERSION);
        {
            let mut table = device
                .inner
                .response_expected
                .write()
                .unwrap_or_else(PoisonError::into_inner);
            table.extend(functions.iter().copied());
        }
        device
    }

    fn with_peer_id(uid: &str, peer_id: u32, api_version: [u8; 3]) -> Self {
        let mut functions = HashMap::new();
        functions.insert(FUNCTION_GET_IDENTITY, ResponseExpected::AlwaysTrue);

        Self {
            inner: Arc::new(DeviceInner {
                uid: uid.to_string(),
                peer_id,
                api_version,
                replaced: AtomicBool::new(false),
                response_expected: RwLock::new(functions),
                callbacks: RwLock::new(HashMap::new()),
                correlator: Correlator::new(),
                stream_locks: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn uid(&self) -> &str {
        &self.inner.uid
    }

    pub fn peer_id(&self) -> u32 {
        self.inner.peer_id
    }

    /// Version of the device API this handle was built for.
    pub fn api_version(&self) -> [u8; 3] {
        self.inner.api_version
    }

    pub fn ptr_eq(&self, other: &DeviceHandle) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub fn is_replaced(&self) -> bool {
        self.inner.replaced.load(Ordering::Acquire)
    }

    /// Fail with `DeviceReplaced` if a newer handle took over this peer id.
    pub fn check_active(&self) -> Result<()> {
        if self.is_replaced() {
            Err(ProtocolError::DeviceReplaced)
        } else {
            Ok(())
        }
    }

    pub(crate) fn mark_replaced(&self) {
        self.inner.replaced.store(true, Ordering::Release);
        self.inner.correlator.reset();
        debug!(uid = %self.inner.uid, peer_id = self.inner.peer_id, "Device handle replaced");
    }

    pub(crate) fn correlator(&self) -> &Correlator {
        &self.inner.correlator
    }

    /// Lock serializing streamed transfers of `function_id`.
    pub(crate) fn stream_lock(&self, function_id: u8) -> Arc<tokio::sync::Mutex<()>> {
        self.inner
            .stream_locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(function_id)
            .or_default()
            .clone()
    }

    /// Whether a call on this handle is currently waiting for its response.
    pub fn has_pending_request(&self) -> bool {
        self.inner.correlator.has_pending()
    }

    /// Declare a function of this device. Device modules call this for each
    /// getter (`AlwaysTrue`) and setter (`Toggle`).
    pub fn declare_function(&self, function_id: u8, state: ResponseExpected) -> Result<()> {
        self.check_active()?;
        let mut table = self
            .inner
            .response_expected
            .write()
            .map_err(|_| ProtocolError::Custom(constants::ERR_LOCK_POISONED.to_string()))?;
        if state == ResponseExpected::Unknown {
            table.remove(&function_id);
        } else {
            table.insert(function_id, state);
        }
        Ok(())
    }

    /// Response expectation for `function_id`.
    pub fn response_expected_state(&self, function_id: u8) -> ResponseExpected {
        self.inner
            .response_expected
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&function_id)
            .copied()
            .unwrap_or(ResponseExpected::Unknown)
    }

    /// Whether `function_id` currently answers.
    pub fn get_response_expected(&self, function_id: u8) -> Result<bool> {
        self.check_active()?;
        self.response_expected_state(function_id)
            .expects_response()
            .ok_or_else(|| unknown_function(function_id))
    }

    /// Enable or disable the response of a setter.
    pub fn set_response_expected(&self, function_id: u8, expected: bool) -> Result<()> {
        self.check_active()?;
        let mut table = self
            .inner
            .response_expected
            .write()
            .map_err(|_| ProtocolError::Custom(constants::ERR_LOCK_POISONED.to_string()))?;

        match table.get_mut(&function_id) {
            Some(ResponseExpected::Toggle(flag)) => {
                *flag = expected;
                Ok(())
            }
            Some(_) => Err(ProtocolError::InvalidArgument(format!(
                "{} {function_id}",
                constants::ERR_ALWAYS_TRUE
            ))),
            None => Err(unknown_function(function_id)),
        }
    }

    /// Enable or disable the response of every setter.
    pub fn set_response_expected_all(&self, expected: bool) -> Result<()> {
        self.check_active()?;
        let mut table = self
            .inner
            .response_expected
            .write()
            .map_err(|_| ProtocolError::Custom(constants::ERR_LOCK_POISONED.to_string()))?;

        for state in table.values_mut() {
            if let ResponseExpected::Toggle(flag) = state {
                *flag = expected;
            }
        }
        Ok(())
    }

    /// Install the decoding format and handler for a callback id, replacing
    /// any previous one.
    pub fn register_callback<F>(&self, callback_id: u8, format: Format, handler: F) -> Result<()>
    where
        F: Fn(&[Value]) + Send + Sync + 'static,
    {
        self.check_active()?;
        let mut callbacks = self
            .inner
            .callbacks
            .write()
            .map_err(|_| ProtocolError::Custom(constants::ERR_LOCK_POISONED.to_string()))?;
        callbacks.insert(
            callback_id,
            CallbackSlot {
                format: Arc::new(format),
                handler: Arc::new(handler),
            },
        );
        Ok(())
    }

    pub fn unregister_callback(&self, callback_id: u8) {
        self.inner
            .callbacks
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&callback_id);
    }

    pub fn has_callback(&self, callback_id: u8) -> bool {
        self.inner
            .callbacks
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(&callback_id)
    }

    pub(crate) fn callback(&self, callback_id: u8) -> Option<CallbackSlot> {
        self.inner
            .callbacks
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&callback_id)
            .cloned()
    }
}

fn unknown_function(function_id: u8) -> ProtocolError {
    ProtocolError::InvalidArgument(format!("{} {function_id}", constants::ERR_UNKNOWN_FUNCTION))
}

impl std::fmt::Debug for DeviceHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceHandle")
            .field("uid", &self.inner.uid)
            .field("peer_id", &self.inner.peer_id)
            .field("api_version", &self.inner.api_version)
            .field("replaced", &self.is_replaced())
            .finish()
    }
}
