// ===============================
// src/valr.rs
// ===============================
//
// Signer VALR: HMAC-SHA512 atas `timestamp + METHOD + path + body`.
// Timestamp yang sama dipakai di digest dan di header X-VALR-TIMESTAMP.
//
use hmac::{Hmac, Mac};
use secrecy::{ExposeSecret, SecretString};
use sha2::Sha512;
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

type HmacSha512 = Hmac<Sha512>;

pub const ACCOUNT_WS_PATH: &str = "/ws/account";
pub const LIMIT_ORDER_PATH: &str = "/v1/orders/limit";

pub const HDR_API_KEY: &str = "X-VALR-API-KEY";
pub const HDR_SIGNATURE: &str = "X-VALR-SIGNATURE";
pub const HDR_TIMESTAMP: &str = "X-VALR-TIMESTAMP";

pub fn timestamp_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

pub fn sign_request(secret: &str, timestamp: u64, method: &str, path: &str, body: &str) -> String {
    let mut mac = HmacSha512::new_from_slice(secret.as_bytes()).expect("HMAC key");
    mac.update(timestamp.to_string().as_bytes());
    mac.update(method.to_ascii_uppercase().as_bytes());
    mac.update(path.as_bytes());
    mac.update(body.as_bytes());
    hex::encode(mac.finalize().into_bytes())
}

/// API key + secret. Secret tidak pernah muncul di Debug.
pub struct Credentials {
    api_key: String,
    api_secret: SecretString,
}

impl Credentials {
    pub fn new(api_key: String, api_secret: String) -> Self {
        Self { api_key, api_secret: SecretString::from(api_secret) }
    }
    pub fn api_key(&self) -> &str {
        &self.api_key
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("api_key", &self.api_key)
            .field("api_secret", &"[REDACTED]")
            .finish()
    }
}

/// Tiga header auth yang wajib dikirim (REST maupun WS handshake).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthHeaders {
    pub api_key: String,
    pub signature: String,
    pub timestamp: u64,
}

impl AuthHeaders {
    pub fn pairs(&self) -> [(&'static str, String); 3] {
        [
            (HDR_API_KEY, self.api_key.clone()),
            (HDR_SIGNATURE, self.signature.clone()),
            (HDR_TIMESTAMP, self.timestamp.to_string()),
        ]
    }
}

/// Dibagi via `Arc<Signer>` antara session (WS handshake) dan strategy (REST).
#[derive(Debug)]
pub struct Signer {
    creds: Credentials,
    clock: fn() -> u64,
}

impl Signer {
    pub fn new(creds: Credentials) -> Self {
        Self { creds, clock: timestamp_ms }
    }

    /// Sumber timestamp lain (test dengan waktu tetap).
    pub fn with_clock(mut self, clock: fn() -> u64) -> Self {
        self.clock = clock;
        self
    }

    pub fn sign(&self, path: &str, method: &str, body: &str, timestamp: u64) -> String {
        sign_request(self.creds.api_secret.expose_secret(), timestamp, method, path, body)
    }

    /// Header auth dengan timestamp saat ini; tidak di-cache.
    pub fn build_headers(&self, path: &str, body: &str, method: &str) -> AuthHeaders {
        self.build_headers_at(path, body, method, (self.clock)())
    }

    /// Header handshake WS account (GET, body kosong).
    pub fn account_stream_headers(&self) -> AuthHeaders {
        self.build_headers(ACCOUNT_WS_PATH, "", "GET")
    }

    pub fn build_headers_at(&self, path: &str, body: &str, method: &str, timestamp: u64) -> AuthHeaders {
        AuthHeaders {
            api_key: self.creds.api_key().to_string(),
            signature: self.sign(path, method, body, timestamp),
            timestamp,
        }
    }
}
