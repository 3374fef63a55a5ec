//! Cookie transport for the auth layer.
//!
//! Three primitives: a plain JSON cookie for UI hints the frontend may read,
//! a secure HttpOnly cookie for sensitive values, and a chunking layer that
//! splits oversized values across an ordered cookie sequence while staying
//! readable for legacy single-cookie deployments.

use axum_extra::extract::cookie::{Cookie, CookieJar, SameSite};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use time::Duration;

pub const ERROR_COOKIE: &str = "auth-error";
pub const PROVIDER_COOKIE: &str = "auth-provider";
pub const STORAGE_COOKIE: &str = "auth-storage";
pub const STATE_COOKIE: &str = "oauth2-state";

/// Per-cookie value size limit. 4KB is the common browser limit; the headroom
/// covers the cookie name and attributes.
pub const COOKIE_CHUNK_SIZE: usize = 3584;
pub const MAX_COOKIE_CHUNKS: usize = 10;

const STATE_COOKIE_MAX_AGE: Duration = Duration::minutes(5);
const HINT_COOKIE_MAX_AGE: Duration = Duration::minutes(1);

/// Client-held session credentials. The whole session state of a user: there
/// is no server-side session store to fall back on.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct CredentialStorage {
    /// The provider's ID token, used as the access token for this dashboard.
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: String,
    pub session_start: DateTime<Utc>,
}

#[derive(Debug, Error)]
pub enum CookieError {
    #[error("value of {size} bytes needs {needed} chunks, only {max} available")]
    TooManyChunks {
        size: usize,
        needed: usize,
        max: usize,
    },
}

/// Splits `value` into chunks of at most `chunk_size` bytes, cutting only on
/// `char` boundaries so concatenating the chunks reproduces the input exactly.
/// Errors instead of truncating when more than `max_chunks` would be needed.
pub fn split_chunks(
    value: &str,
    chunk_size: usize,
    max_chunks: usize,
) -> Result<Vec<String>, CookieError> {
    let mut chunks = Vec::new();
    let mut rest = value;
    while !rest.is_empty() {
        let mut cut = chunk_size.min(rest.len());
        while !rest.is_char_boundary(cut) {
            cut -= 1;
        }
        if cut == 0 {
            // chunk_size smaller than the first char; a char never splits.
            cut = rest.chars().next().map_or(rest.len(), char::len_utf8);
        }
        let (chunk, tail) = rest.split_at(cut);
        chunks.push(chunk.to_string());
        rest = tail;
    }
    if chunks.is_empty() {
        chunks.push(String::new());
    }
    if chunks.len() > max_chunks {
        return Err(CookieError::TooManyChunks {
            size: value.len(),
            needed: chunks.len(),
            max: max_chunks,
        });
    }
    Ok(chunks)
}

/// Cookie name for chunk `index`. Index 0 keeps the bare base name so
/// unchunked values written by older versions stay readable.
pub fn chunk_name(base: &str, index: usize) -> String {
    if index == 0 {
        base.to_string()
    } else {
        format!("{}-{}", base, index)
    }
}

/// Issues and clears the cookies this layer owns.
#[derive(Clone)]
pub struct CookieTransport {
    secure: bool,
    session_max_age: Duration,
}

impl CookieTransport {
    pub fn new(secure: bool, session_duration_secs: u64) -> Self {
        CookieTransport {
            secure,
            session_max_age: Duration::seconds(session_duration_secs as i64),
        }
    }

    /// A short-lived, frontend-readable hint cookie carrying a JSON value.
    pub fn hint_cookie<T: Serialize>(&self, name: &'static str, value: &T) -> Cookie<'static> {
        let payload = serde_json::to_string(value).unwrap_or_default();
        Cookie::build((name, payload))
            .secure(self.secure)
            .same_site(SameSite::Lax)
            .path("/")
            .max_age(HINT_COOKIE_MAX_AGE)
            .build()
    }

    /// The long-lived hint naming the active provider, for the login page.
    pub fn provider_cookie(&self, provider_name: &str) -> Cookie<'static> {
        Cookie::build((PROVIDER_COOKIE, provider_name.to_string()))
            .secure(self.secure)
            .same_site(SameSite::Lax)
            .path("/")
            .build()
    }

    fn secure_cookie(&self, name: String, value: String, max_age: Duration) -> Cookie<'static> {
        Cookie::build((name, value))
            .http_only(true)
            .secure(self.secure)
            .same_site(SameSite::Lax)
            .path("/")
            .max_age(max_age)
            .build()
    }

    /// The 5-minute login-state cookie.
    pub fn state_cookie(&self, encoded_state: String) -> Cookie<'static> {
        self.secure_cookie(STATE_COOKIE.to_string(), encoded_state, STATE_COOKIE_MAX_AGE)
    }

    pub fn clear_state_cookie(&self) -> Cookie<'static> {
        removal_cookie(STATE_COOKIE.to_string())
    }

    /// Writes an (already sealed) storage payload across chunk cookies,
    /// clearing any stale higher-index chunks from a previously larger value.
    pub fn set_storage(&self, jar: CookieJar, sealed: &str) -> Result<CookieJar, CookieError> {
        let chunks = split_chunks(sealed, COOKIE_CHUNK_SIZE, MAX_COOKIE_CHUNKS)?;
        let written = chunks.len();
        let mut jar = jar;
        for (index, chunk) in chunks.into_iter().enumerate() {
            jar = jar.add(self.secure_cookie(
                chunk_name(STORAGE_COOKIE, index),
                chunk,
                self.session_max_age,
            ));
        }
        for index in written..MAX_COOKIE_CHUNKS {
            jar = jar.remove(removal_cookie(chunk_name(STORAGE_COOKIE, index)));
        }
        Ok(jar)
    }

    /// Reassembles the storage payload. A missing chunk-1 cookie means the
    /// base cookie holds the whole value (legacy unchunked format); otherwise
    /// chunks concatenate in index order up to the first gap.
    pub fn read_storage(&self, jar: &CookieJar) -> Option<String> {
        let base = jar.get(STORAGE_COOKIE)?.value().to_string();
        let mut value = base;
        for index in 1..MAX_COOKIE_CHUNKS {
            match jar.get(&chunk_name(STORAGE_COOKIE, index)) {
                Some(chunk) => value.push_str(chunk.value()),
                None => break,
            }
        }
        Some(value)
    }

    /// Removal cookies for every storage slot, the state cookie and the
    /// provider hint. Used on logout and on confirmed token invalidity.
    pub fn clear_storage(&self, jar: CookieJar) -> CookieJar {
        let mut jar = jar;
        for index in 0..MAX_COOKIE_CHUNKS {
            jar = jar.remove(removal_cookie(chunk_name(STORAGE_COOKIE, index)));
        }
        jar.remove(removal_cookie(STATE_COOKIE.to_string()))
    }
}

fn removal_cookie(name: String) -> Cookie<'static> {
    Cookie::build((name, ""))
        .path("/")
        .max_age(Duration::ZERO)
        .build()
}
