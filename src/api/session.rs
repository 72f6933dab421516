//! Cookie-keyed session store.
//!
//! Sessions hold the per-user token state plus the CSRF and login-state
//! tokens the HTTP layer needs. Records live in memory with a fixed TTL
//! from creation; expired records are dropped on access and by a periodic
//! sweep.

use crate::auth::SessionTokens;
use axum::http::{header, HeaderMap};
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use chrono::{DateTime, Duration, Utc};
use rand::Rng;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use uuid::Uuid;

/// Name of the session cookie.
pub const SESSION_COOKIE: &str = "mailpilot_session";

const CSRF_TOKEN_BYTES: usize = 24;
const STATE_TOKEN_BYTES: usize = 16;

/// One user session.
///
/// Handlers hold this record's lock across token operations, which
/// serializes refresh calls per session.
#[derive(Debug, Default)]
pub struct SessionRecord {
    /// Token state owned by this session, mutated by the token manager
    pub tokens: SessionTokens,

    /// CSRF token for configuration writes, generated on first use
    csrf_token: Option<String>,

    /// Single-use state token for the in-flight sign-in, if any
    login_state: Option<String>,
}

impl SessionRecord {
    /// Returns the session's CSRF token, generating it on first use.
    pub fn csrf_token(&mut self) -> String {
        if let Some(token) = &self.csrf_token {
            return token.clone();
        }
        let token = random_token(CSRF_TOKEN_BYTES);
        self.csrf_token = Some(token.clone());
        token
    }

    /// True when the given value matches the session's CSRF token.
    pub fn csrf_matches(&self, candidate: &str) -> bool {
        self.csrf_token.as_deref() == Some(candidate)
    }

    /// Issues a fresh login state token, replacing any previous one.
    pub fn issue_login_state(&mut self) -> String {
        let state = random_token(STATE_TOKEN_BYTES);
        self.login_state = Some(state.clone());
        state
    }

    /// Consumes the stored login state token (single-use).
    pub fn take_login_state(&mut self) -> Option<String> {
        self.login_state.take()
    }
}

struct SessionEntry {
    created_at: DateTime<Utc>,
    record: Arc<tokio::sync::Mutex<SessionRecord>>,
}

/// In-memory session store with automatic expiration.
///
/// The map lock is held only for lookups and inserts; per-record state is
/// behind each record's own async lock.
#[derive(Clone)]
pub struct SessionStore {
    sessions: Arc<Mutex<HashMap<String, SessionEntry>>>,
    ttl: Duration,
}

impl SessionStore {
    /// Create a session store with a fixed TTL from session creation.
    pub fn new(ttl_hours: i64) -> Self {
        Self {
            sessions: Arc::new(Mutex::new(HashMap::new())),
            ttl: Duration::hours(ttl_hours),
        }
    }

    /// Returns the session for the request's cookie, creating a fresh one
    /// when the cookie is absent, unknown, or expired.
    ///
    /// The boolean is true when a new session was created and the response
    /// must set the session cookie.
    pub fn establish(
        &self,
        headers: &HeaderMap,
    ) -> (String, Arc<tokio::sync::Mutex<SessionRecord>>, bool) {
        let now = Utc::now();
        let mut sessions = self.sessions.lock().unwrap();

        if let Some(id) = session_id_from_headers(headers) {
            if let Some(entry) = sessions.get(&id) {
                if now - entry.created_at <= self.ttl {
                    let record = Arc::clone(&entry.record);
                    return (id, record, false);
                }
            }
            // Unknown or expired cookie: drop any stale entry and start over
            sessions.remove(&id);
        }

        let id = Uuid::new_v4().to_string();
        let record = Arc::new(tokio::sync::Mutex::new(SessionRecord::default()));
        sessions.insert(
            id.clone(),
            SessionEntry {
                created_at: now,
                record: Arc::clone(&record),
            },
        );
        (id, record, true)
    }

    /// Returns the live session for the request's cookie, if one exists.
    /// Never creates a session.
    pub fn lookup(
        &self,
        headers: &HeaderMap,
    ) -> Option<(String, Arc<tokio::sync::Mutex<SessionRecord>>)> {
        let id = session_id_from_headers(headers)?;
        let now = Utc::now();
        let mut sessions = self.sessions.lock().unwrap();

        if let Some(entry) = sessions.get(&id) {
            if now - entry.created_at <= self.ttl {
                let record = Arc::clone(&entry.record);
                return Some((id, record));
            }
        }
        sessions.remove(&id);
        None
    }

    /// Destroys a session.
    pub fn remove(&self, session_id: &str) {
        self.sessions.lock().unwrap().remove(session_id);
    }

    /// Drops expired sessions (called periodically).
    pub fn sweep_expired(&self) {
        let now = Utc::now();
        let mut sessions = self.sessions.lock().unwrap();
        sessions.retain(|_, entry| now - entry.created_at <= self.ttl);
    }

    /// Number of live sessions (for debugging/monitoring)
    pub fn count(&self) -> usize {
        self.sessions.lock().unwrap().len()
    }

    /// Seconds a session cookie should live, matching the store TTL.
    pub fn cookie_max_age(&self) -> i64 {
        self.ttl.num_seconds()
    }
}

/// Background task that periodically sweeps expired sessions.
pub async fn run_session_sweep(store: SessionStore, interval_seconds: u64) {
    let mut interval = tokio::time::interval(tokio::time::Duration::from_secs(interval_seconds));

    loop {
        interval.tick().await;
        store.sweep_expired();
        tracing::debug!("session sweep complete, {} sessions remaining", store.count());
    }
}

/// Extracts the session ID from the request's Cookie header.
pub fn session_id_from_headers(headers: &HeaderMap) -> Option<String> {
    let cookies = headers.get(header::COOKIE)?.to_str().ok()?;

    cookies.split(';').find_map(|pair| {
        let (name, value) = pair.trim().split_once('=')?;
        (name == SESSION_COOKIE).then(|| value.to_string())
    })
}

/// Builds the Set-Cookie value for a session.
pub fn session_cookie(session_id: &str, max_age_seconds: i64, secure: bool) -> String {
    let mut cookie = format!(
        "{}={}; Path=/; HttpOnly; SameSite=Lax; Max-Age={}",
        SESSION_COOKIE, session_id, max_age_seconds
    );
    if secure {
        cookie.push_str("; Secure");
    }
    cookie
}

/// Builds the Set-Cookie value that clears the session cookie.
pub fn expired_session_cookie() -> String {
    format!("{}=; Path=/; HttpOnly; SameSite=Lax; Max-Age=0", SESSION_COOKIE)
}

fn random_token(bytes: usize) -> String {
    let mut buf = vec![0u8; bytes];
    rand::thread_rng().fill(buf.as_mut_slice());
    URL_SAFE_NO_PAD.encode(buf)
}
