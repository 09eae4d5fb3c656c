use std::collections::HashMap;
use std::sync::RwLock;

use crate::types::Session;

// Storage keys for the authenticated session
pub const ACCESS_TOKEN: &str = "access_token";
pub const REFRESH_TOKEN: &str = "refresh_token";
pub const ID_TOKEN: &str = "id_token";
pub const ACCESS_TOKEN_ISSUED_AT: &str = "access_token_issued_at";
pub const ACCESS_TOKEN_EXPIRES_IN: &str = "access_token_expires_in";
pub const DISPLAY_NAME: &str = "display_name";
pub const EMAIL: &str = "email";
pub const USERNAME: &str = "username";

// Ephemeral keys, managed independently of the session lifecycle
pub const PKCE_CODE_VERIFIER: &str = "pkce_code_verifier";
pub const OAUTH_STATE: &str = "oauth_state";

/// Every key written by [`init_authenticated_session`]. Reset clears exactly
/// this set, so it stays in sync with the [`Session`] fields.
const SESSION_KEYS: &[&str] = &[
    ACCESS_TOKEN,
    REFRESH_TOKEN,
    ID_TOKEN,
    ACCESS_TOKEN_ISSUED_AT,
    ACCESS_TOKEN_EXPIRES_IN,
    DISPLAY_NAME,
    EMAIL,
    USERNAME,
];

/// Key-value persistence for session state.
///
/// Implementations are expected to scope values to the process lifetime and
/// never write them to disk. Injected into the session manager so tests can
/// swap in a fake.
pub trait SessionRepository: Send + Sync {
    fn get(&self, key: &str) -> Option<String>;
    fn set(&self, key: &str, value: &str);
    fn remove(&self, key: &str);
}

/// In-memory [`SessionRepository`]. Values live only as long as the process;
/// credentials are never written to disk.
#[derive(Debug, Default)]
pub struct MemorySessionStore {
    values: RwLock<HashMap<String, String>>,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SessionRepository for MemorySessionStore {
    fn get(&self, key: &str) -> Option<String> {
        let values = self.values.read().unwrap();
        values.get(key).cloned()
    }

    fn set(&self, key: &str, value: &str) {
        let mut values = self.values.write().unwrap();
        values.insert(key.to_string(), value.to_string());
    }

    fn remove(&self, key: &str) {
        let mut values = self.values.write().unwrap();
        values.remove(key);
    }
}

/// Persist a full token set. Writes every session key; partial sessions never
/// hit the store.
pub fn init_authenticated_session(repository: &dyn SessionRepository, session: &Session) {
    repository.set(ACCESS_TOKEN, &session.access_token);
    repository.set(REFRESH_TOKEN, &session.refresh_token);
    repository.set(ID_TOKEN, &session.id_token);
    repository.set(ACCESS_TOKEN_ISSUED_AT, &session.issued_at.to_string());
    repository.set(ACCESS_TOKEN_EXPIRES_IN, &session.expires_in.to_string());
    repository.set(DISPLAY_NAME, &session.display_name);
    repository.set(EMAIL, &session.email);
    repository.set(USERNAME, &session.username);
}

/// Clear every known session key. Idempotent; called on sign-out and on any
/// unrecoverable authentication failure so no stale partial credentials
/// survive.
pub fn reset_authenticated_session(repository: &dyn SessionRepository) {
    for key in SESSION_KEYS {
        repository.remove(key);
    }
}

pub fn store_code_verifier(repository: &dyn SessionRepository, verifier: &str) {
    repository.set(PKCE_CODE_VERIFIER, verifier);
}

pub fn retrieve_code_verifier(repository: &dyn SessionRepository) -> Option<String> {
    repository.get(PKCE_CODE_VERIFIER)
}

pub fn clear_code_verifier(repository: &dyn SessionRepository) {
    repository.remove(PKCE_CODE_VERIFIER);
}
