use crate::AuthError;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

pub const TICKET: &str = "ticket";
pub const WAMPCRA: &str = "wampcra";

/// Authentication challenge as received from the broker
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Challenge {
    pub method: String,
    #[serde(default)]
    pub extra: Map<String, Value>,
}

impl Challenge {
    pub fn new(method: impl Into<String>) -> Self {
        Challenge {
            method: method.into(),
            extra: Map::new(),
        }
    }

    pub fn with_extra(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.extra.insert(key.into(), value.into());
        self
    }
}

/// Compute the signature answering a `wampcra` challenge.
pub fn compute_wcs(secret: &str, challenge: &str) -> String {
    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC accepts any key length");
    mac.update(challenge.as_bytes());
    STANDARD.encode(mac.finalize().into_bytes())
}

/// Produce the answer for `challenge` using the configured `secret`.
/// `ticket` answers with the secret itself and `wampcra` with
/// `base64(HMAC-SHA256(secret, challenge))`. Other methods are rejected.
pub fn resolve_challenge(challenge: &Challenge, secret: &str) -> Result<String, AuthError> {
    match challenge.method.as_str() {
        TICKET => Ok(secret.to_string()),
        WAMPCRA => {
            let nonce = challenge
                .extra
                .get("challenge")
                .and_then(Value::as_str)
                .ok_or_else(|| AuthError::MissingChallenge(challenge.method.clone()))?;
            Ok(compute_wcs(secret, nonce))
        }
        other => Err(AuthError::UnsupportedMethod(other.to_string())),
    }
}
