use std::collections::HashMap;
use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use serde::Serialize;
use serde::de::DeserializeOwned;
use ulid::Ulid;

use crate::limits::MAX_SESSIONS;

pub type SessionId = Ulid;

/// Name of the cookie carrying the session id.
pub const COOKIE_NAME: &str = "bookings_session";

/// A session slot holding values of type `T`.
pub struct SessionKey<T> {
    name: &'static str,
    _marker: PhantomData<fn() -> T>,
}

impl<T> SessionKey<T> {
    pub const fn new(name: &'static str) -> Self {
        Self {
            name,
            _marker: PhantomData,
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    /// Nothing stored under the key, or the session has expired.
    Missing(&'static str),
    /// A value is stored but does not decode as the key's type.
    Malformed { key: &'static str, reason: String },
    /// Starting another session would exceed the store's capacity.
    StoreFull,
}

impl fmt::Display for SessionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionError::Missing(key) => write!(f, "session key {key:?} is missing"),
            SessionError::Malformed { key, reason } => {
                write!(f, "session key {key:?} is malformed: {reason}")
            }
            SessionError::StoreFull => write!(f, "session store is full"),
        }
    }
}

impl std::error::Error for SessionError {}

struct SessionEntry {
    values: HashMap<&'static str, serde_json::Value>,
    expires_at: Instant,
}

impl SessionEntry {
    fn is_expired(&self, now: Instant) -> bool {
        now >= self.expires_at
    }
}

/// In-process session storage keyed by a random id.
///
/// An entry is created by the first write to a session, not by reading it,
/// so requests that never store anything cost nothing. Entries expire a fixed
/// `lifetime` after creation. Expired entries read as absent;
/// `purge_expired` reclaims them.
pub struct SessionStore {
    entries: DashMap<SessionId, SessionEntry>,
    lifetime: Duration,
    capacity: usize,
}

impl SessionStore {
    pub fn new(lifetime: Duration) -> Self {
        Self::with_capacity(lifetime, MAX_SESSIONS)
    }

    pub fn with_capacity(lifetime: Duration, capacity: usize) -> Self {
        Self {
            entries: DashMap::new(),
            lifetime,
            capacity,
        }
    }

    pub fn lifetime(&self) -> Duration {
        self.lifetime
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Resume the session named by `cookie`, or start a fresh one when the
    /// cookie is absent, unparseable, unknown or expired. A fresh session has
    /// no entry until something is written to it.
    pub fn open(self: &Arc<Self>, cookie: Option<&str>) -> Session {
        let now = Instant::now();
        let resumed = cookie
            .and_then(|c| Ulid::from_string(c).ok())
            .filter(|id| self.entries.get(id).is_some_and(|e| !e.is_expired(now)));
        Session {
            store: Arc::clone(self),
            id: resumed.unwrap_or_else(Ulid::new),
            is_new: resumed.is_none(),
            written: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Make room for a new entry. Fails when the store is at capacity and
    /// nothing has expired.
    fn reserve_slot(&self, id: &SessionId) -> Result<(), SessionError> {
        if self.entries.contains_key(id) || self.entries.len() < self.capacity {
            return Ok(());
        }
        if self.purge_expired() == 0 {
            return Err(SessionError::StoreFull);
        }
        Ok(())
    }

    /// Drop every expired session. Returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.entries.len();
        self.entries.retain(|_, entry| !entry.is_expired(now));
        before.saturating_sub(self.entries.len())
    }
}

/// Handle to one guest's session, valid for a single request.
///
/// Every read and write goes to the entry named by this handle's id, so one
/// guest's request can never observe another guest's values. Clones share
/// the record of whether anything was written.
#[derive(Clone)]
pub struct Session {
    store: Arc<SessionStore>,
    id: SessionId,
    is_new: bool,
    written: Arc<AtomicBool>,
}

impl Session {
    pub fn id(&self) -> SessionId {
        self.id
    }

    /// True when no live session matched the request's cookie.
    pub fn is_new(&self) -> bool {
        self.is_new
    }

    /// A fresh session that was written to; the response must set the cookie.
    pub fn needs_cookie(&self) -> bool {
        self.is_new && self.written.load(Ordering::Acquire)
    }

    pub fn get<T: DeserializeOwned>(&self, key: &SessionKey<T>) -> Result<T, SessionError> {
        let entry = self
            .store
            .entries
            .get(&self.id)
            .filter(|e| !e.is_expired(Instant::now()))
            .ok_or(SessionError::Missing(key.name))?;
        let value = entry
            .values
            .get(key.name)
            .ok_or(SessionError::Missing(key.name))?;
        decode(key, value.clone())
    }

    pub fn put<T: Serialize>(&self, key: &SessionKey<T>, value: &T) -> Result<(), SessionError> {
        let value = serde_json::to_value(value).map_err(|e| SessionError::Malformed {
            key: key.name,
            reason: e.to_string(),
        })?;
        self.store.reserve_slot(&self.id)?;
        let now = Instant::now();
        let mut entry = self
            .store
            .entries
            .entry(self.id)
            .or_insert_with(|| SessionEntry {
                values: HashMap::new(),
                expires_at: now + self.store.lifetime,
            });
        if entry.is_expired(now) {
            entry.values.clear();
            entry.expires_at = now + self.store.lifetime;
        }
        entry.values.insert(key.name, value);
        self.written.store(true, Ordering::Release);
        Ok(())
    }

    pub fn remove<T>(&self, key: &SessionKey<T>) {
        if let Some(mut entry) = self.store.entries.get_mut(&self.id) {
            entry.values.remove(key.name);
        }
    }

    /// Read and remove in one step. The value is gone even if it fails to decode.
    pub fn take<T: DeserializeOwned>(&self, key: &SessionKey<T>) -> Result<T, SessionError> {
        let mut entry = self
            .store
            .entries
            .get_mut(&self.id)
            .filter(|e| !e.is_expired(Instant::now()))
            .ok_or(SessionError::Missing(key.name))?;
        let value = entry
            .values
            .remove(key.name)
            .ok_or(SessionError::Missing(key.name))?;
        decode(key, value)
    }
}

fn decode<T: DeserializeOwned>(
    key: &SessionKey<T>,
    value: serde_json::Value,
) -> Result<T, SessionError> {
    serde_json::from_value(value).map_err(|e| SessionError::Malformed {
        key: key.name,
        reason: e.to_string(),
    })
}
