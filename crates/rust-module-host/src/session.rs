//! Cookie sessions with sliding expiry, persisted through a key-value store

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use dashmap::DashMap;
use rust_module_host_sdk::host::{KeyValueStore, SessionStore};
use rust_module_host_sdk::HandlerError;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};
use uuid::Uuid;

/// Collection holding session records
pub const SESSIONS_COLLECTION: &str = "sessions";
pub const SESSION_COOKIE: &str = "session_id";

#[derive(Debug, Clone, Serialize, Deserialize)]
struct SessionRecord {
    id: String,
    data: Map<String, JsonValue>,
    created_at: DateTime<Utc>,
    last_accessed: DateTime<Utc>,
    expires_at: DateTime<Utc>,
}

impl SessionRecord {
    fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

/// Session records are read, changed and written back whole. Every such
/// update holds the session's lock so concurrent updates never overwrite
/// each other.
pub struct SessionService {
    store: Arc<dyn KeyValueStore>,
    timeout: TimeDelta,
    locks: DashMap<String, Arc<Mutex<()>>>,
}

impl SessionService {
    pub fn new(store: Arc<dyn KeyValueStore>, timeout: Duration) -> Self {
        Self {
            store,
            timeout: TimeDelta::from_std(timeout).unwrap_or_else(|_| TimeDelta::days(365)),
            locks: DashMap::new(),
        }
    }

    /// Run `f` holding `session_id`'s lock
    fn locked<T>(&self, session_id: &str, f: impl FnOnce() -> T) -> T {
        let lock = self.locks.entry(session_id.to_string()).or_default().clone();
        let result = {
            let _guard = lock.lock().unwrap_or_else(PoisonError::into_inner);
            f()
        };
        drop(lock);
        self.locks.remove_if(session_id, |_, lock| Arc::strong_count(lock) == 1);
        result
    }

    pub fn timeout(&self) -> Duration {
        self.timeout.to_std().unwrap_or(Duration::ZERO)
    }

    fn load(&self, session_id: &str) -> Result<Option<SessionRecord>, HandlerError> {
        self.store.get_as(SESSIONS_COLLECTION, session_id)
    }

    fn save(&self, record: &SessionRecord) -> Result<(), HandlerError> {
        self.store.set_as(SESSIONS_COLLECTION, &record.id, record)
    }

    /// The live record, touched and saved. Expired records read as absent.
    /// Callers hold the session's lock.
    fn touch(&self, session_id: &str) -> Result<Option<SessionRecord>, HandlerError> {
        let now = Utc::now();
        let Some(mut record) = self.load(session_id)? else {
            return Ok(None);
        };
        if record.is_expired(now) {
            return Ok(None);
        }
        record.last_accessed = now;
        record.expires_at = now + self.timeout;
        self.save(&record)?;
        Ok(Some(record))
    }

    /// Write `key`, starting a fresh record if the session is missing or
    /// expired. Callers hold the session's lock.
    fn write(&self, session_id: &str, key: &str, value: JsonValue) -> Result<(), HandlerError> {
        let now = Utc::now();
        let mut record = match self.load(session_id)? {
            Some(record) if !record.is_expired(now) => record,
            _ => SessionRecord {
                id: session_id.to_string(),
                data: Map::new(),
                created_at: now,
                last_accessed: now,
                expires_at: now,
            },
        };
        record.data.insert(key.to_string(), value);
        record.last_accessed = now;
        record.expires_at = now + self.timeout;
        self.save(&record)
    }

    /// Delete every expired session. Returns how many were removed.
    pub fn cleanup_expired(&self) -> Result<usize, HandlerError> {
        let now = Utc::now();
        let mut removed = 0;
        for (id, value) in self.store.get_all(SESSIONS_COLLECTION)? {
            let expired = serde_json::from_value::<SessionRecord>(value)
                .map(|record| record.is_expired(now))
                .unwrap_or(true);
            if !expired {
                continue;
            }
            // Re-check under the lock: the session may have been touched since
            let deleted = self.locked(&id, || -> Result<bool, HandlerError> {
                let still_expired = match self.load(&id) {
                    Ok(Some(record)) => record.is_expired(now),
                    _ => true,
                };
                Ok(still_expired && self.store.delete(SESSIONS_COLLECTION, &id)?)
            })?;
            if deleted {
                removed += 1;
            }
        }
        if removed > 0 {
            tracing::debug!(removed, "Expired sessions removed");
        }
        Ok(removed)
    }
}

impl SessionStore for SessionService {
    fn get(&self, session_id: &str, key: &str) -> Result<Option<JsonValue>, HandlerError> {
        let record = self.locked(session_id, || self.touch(session_id))?;
        Ok(record.and_then(|mut record| record.data.remove(key)))
    }

    fn set(&self, session_id: &str, key: &str, value: JsonValue) -> Result<(), HandlerError> {
        self.locked(session_id, || self.write(session_id, key, value))
    }

    fn remove(&self, session_id: &str, key: &str) -> Result<(), HandlerError> {
        self.locked(session_id, || {
            if let Some(mut record) = self.touch(session_id)? {
                if record.data.remove(key).is_some() {
                    self.save(&record)?;
                }
            }
            Ok(())
        })
    }

    fn exists(&self, session_id: &str) -> Result<bool, HandlerError> {
        Ok(self
            .load(session_id)?
            .is_some_and(|record| !record.is_expired(Utc::now())))
    }

    fn refresh(&self, session_id: &str) -> Result<(), HandlerError> {
        self.locked(session_id, || self.touch(session_id).map(|_| ()))
    }

    fn remove_session(&self, session_id: &str) -> Result<(), HandlerError> {
        self.locked(session_id, || {
            self.store.delete(SESSIONS_COLLECTION, session_id).map(|_| ())
        })
    }
}

/// Session id from a `Cookie` header value
pub fn session_id_from_cookies(cookie_header: &str) -> Option<String> {
    cookie_header
        .split(';')
        .filter_map(|cookie| cookie.trim().split_once('='))
        .find(|(name, _)| *name == SESSION_COOKIE)
        .map(|(_, value)| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

pub fn new_session_id() -> String {
    Uuid::new_v4().to_string()
}

/// `Set-Cookie` value for a session
pub fn session_cookie(session_id: &str, max_age: Duration, secure: bool) -> String {
    let mut cookie = format!(
        "{}={}; HttpOnly; SameSite=Strict; Path=/; Max-Age={}",
        SESSION_COOKIE,
        session_id,
        max_age.as_secs()
    );
    if secure {
        cookie.push_str("; Secure");
    }
    cookie
}
