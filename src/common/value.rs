//! Signed, typed, expiring values stored under a key.

use std::convert::TryFrom;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};

/// Maximum size of a value's data in bytes.
pub const MAX_VALUE_SIZE: usize = 1000;
/// User type of plain utf-8 text values.
pub const TEXT_PLAIN: &str = "text/plain";

#[derive(Clone, Debug, PartialEq, Eq)]
/// A value stored in the DHT under some key.
pub struct Value {
    /// Unique within a key.
    id: u64,
    /// ed25519 public key of the signer, if signed.
    owner: Option<[u8; 32]>,
    /// ed25519 signature over the signable encoding of this value.
    signature: Option<[u8; 64]>,
    data: Bytes,
    user_type: String,
    /// Unix seconds.
    created: u64,
    /// Unix seconds.
    expires: u64,
}

#[derive(Clone, Debug, PartialEq, Eq)]
/// Known payload kinds, dispatched by [Value::user_type].
pub enum ValuePayload {
    /// `text/plain` utf-8 text.
    Text(String),
    /// Any other user type, or text that isn't valid utf-8.
    Unknown { user_type: String, data: Bytes },
}

impl Value {
    /// Create a new unsigned value with a random id, expiring after `ttl`.
    pub fn new(data: impl Into<Bytes>, user_type: &str, ttl: Duration) -> Self {
        let created = unix_now();

        Self {
            id: rand::random(),
            owner: None,
            signature: None,
            data: data.into(),
            user_type: user_type.to_string(),
            created,
            expires: created.saturating_add(ttl.as_secs()),
        }
    }

    /// Create a new `text/plain` value.
    pub fn text(text: &str, ttl: Duration) -> Self {
        Self::new(Bytes::copy_from_slice(text.as_bytes()), TEXT_PLAIN, ttl)
    }

    /// Create a new value from a [ValuePayload].
    pub fn from_payload(payload: ValuePayload, ttl: Duration) -> Self {
        match payload {
            ValuePayload::Text(text) => Self::text(&text, ttl),
            ValuePayload::Unknown { user_type, data } => Self::new(data, &user_type, ttl),
        }
    }

    /// Create a value from its parts, as received from the network. Not validated.
    pub(crate) fn from_parts(
        id: u64,
        owner: Option<[u8; 32]>,
        signature: Option<[u8; 64]>,
        data: Bytes,
        user_type: String,
        created: u64,
        expires: u64,
    ) -> Self {
        Self {
            id,
            owner,
            signature,
            data,
            user_type,
            created,
            expires,
        }
    }

    /// Sign this value, setting its owner to the signer's public key.
    pub fn sign(mut self, signer: &SigningKey) -> Self {
        let signable = self.signable();

        self.owner = Some(signer.verifying_key().to_bytes());
        self.signature = Some(signer.sign(&signable).to_bytes());

        self
    }

    /// Check that a declared owner matches the signature.
    ///
    /// Unsigned values without an owner are valid, a signature without an owner is not.
    pub fn verify(&self) -> Result<(), ValueError> {
        match (&self.owner, &self.signature) {
            (None, None) => Ok(()),
            (Some(owner), Some(signature)) => {
                let key =
                    VerifyingKey::try_from(&owner[..]).map_err(|_| ValueError::InvalidSignature)?;
                let signature = Signature::from_bytes(signature);

                key.verify(&self.signable(), &signature)
                    .map_err(|_| ValueError::InvalidSignature)
            }
            _ => Err(ValueError::InvalidSignature),
        }
    }

    /// Validate size, expiry and signature of this value at unix time `now`.
    pub fn validate(&self, now: u64) -> Result<(), ValueError> {
        if self.data.len() > MAX_VALUE_SIZE {
            return Err(ValueError::TooLarge(self.data.len()));
        }

        if self.is_expired(now) {
            return Err(ValueError::Expired);
        }

        self.verify()
    }

    /// Returns a copy of this value expiring `ttl` from now, re-signed if `signer` owns it.
    ///
    /// Values owned by someone else are returned unchanged.
    pub(crate) fn renewed(&self, ttl: Duration, signer: Option<&SigningKey>) -> Self {
        match (self.owner, signer) {
            (None, _) => Self {
                expires: unix_now().saturating_add(ttl.as_secs()),
                ..self.clone()
            },
            (Some(owner), Some(signer)) if owner == signer.verifying_key().to_bytes() => Self {
                expires: unix_now().saturating_add(ttl.as_secs()),
                ..self.clone()
            }
            .sign(signer),
            _ => self.clone(),
        }
    }

    /// Same id, owner, type and data. Expiry and signature may differ.
    pub fn same_content(&self, other: &Value) -> bool {
        self.id == other.id
            && self.owner == other.owner
            && self.user_type == other.user_type
            && self.data == other.data
    }

    pub fn is_expired(&self, now: u64) -> bool {
        self.expires <= now
    }

    /// Decode the payload according to the user type.
    pub fn payload(&self) -> ValuePayload {
        if self.user_type == TEXT_PLAIN {
            if let Ok(text) = std::str::from_utf8(&self.data) {
                return ValuePayload::Text(text.to_string());
            }
        }

        ValuePayload::Unknown {
            user_type: self.user_type.clone(),
            data: self.data.clone(),
        }
    }

    // === Getters ===

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn owner(&self) -> Option<&[u8; 32]> {
        self.owner.as_ref()
    }

    pub fn signature(&self) -> Option<&[u8; 64]> {
        self.signature.as_ref()
    }

    pub fn data(&self) -> &Bytes {
        &self.data
    }

    pub fn user_type(&self) -> &str {
        &self.user_type
    }

    pub fn created(&self) -> u64 {
        self.created
    }

    pub fn expires(&self) -> u64 {
        self.expires
    }

    pub fn is_signed(&self) -> bool {
        self.signature.is_some()
    }

    // === Private Methods ===

    fn signable(&self) -> Box<[u8]> {
        encode_signable(
            self.id,
            &self.user_type,
            self.created,
            self.expires,
            &self.data,
        )
    }
}

impl ValuePayload {
    pub fn user_type(&self) -> &str {
        match self {
            ValuePayload::Text(_) => TEXT_PLAIN,
            ValuePayload::Unknown { user_type, .. } => user_type,
        }
    }
}

/// Bencode-like encoding of the signed fields of a [Value].
pub fn encode_signable(id: u64, user_type: &str, created: u64, expires: u64, data: &[u8]) -> Box<[u8]> {
    let mut signable = vec![];

    signable.extend(format!("1:ci{}e1:ei{}e2:idi{}e", created, expires, id).into_bytes());
    signable.extend(format!("1:t{}:", user_type.len()).into_bytes());
    signable.extend(user_type.as_bytes());
    signable.extend(format!("1:v{}:", data.len()).into_bytes());
    signable.extend(data);

    signable.into()
}

/// Current unix time in seconds.
pub(crate) fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|duration| duration.as_secs())
        .unwrap_or_default()
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq, Hash)]
/// Reasons a value is rejected by a value store.
pub enum ValueError {
    #[error("Invalid value signature")]
    InvalidSignature,

    #[error("A different value with the same id is already stored")]
    Conflict,

    #[error("Value data too large: {0} bytes, max {MAX_VALUE_SIZE}")]
    TooLarge(usize),

    #[error("Value expired")]
    Expired,
}
