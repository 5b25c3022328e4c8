//! # DHT Record Validation
//!
//! Every record that enters the DHT, whether we're storing it for someone
//! else or picking between answers to our own lookup, goes through a
//! [`Validator`]. The stack is short:
//!
//! ```text
//! RecordValidator          logs + counts, never changes a verdict
//!   └─ NamespacedValidator dispatches on "/<namespace>/..."
//!        └─ "pk" → PublicKeyValidator
//! ```
//!
//! Only the `pk` namespace is recognised. Anything else (`ipns`, made-up
//! namespaces, keys without a leading slash) is rejected, which means this
//! node stores public keys for the network and nothing else.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use libp2p::identity::PublicKey;
use libp2p::PeerId;
use tracing::{debug, Span};

/// Namespace for public-key records.
pub const PK_NAMESPACE: &str = "pk";

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("record key is not of the form /<namespace>/<path>")]
    MissingNamespace,

    #[error("no validator for record namespace '{0}'")]
    UnknownNamespace(String),

    #[error("no candidate records to select from")]
    NoCandidates,

    #[error("invalid public key record: {0}")]
    InvalidPublicKey(String),

    #[error("public key does not match the peer id in the record key")]
    KeyMismatch,
}

// ---------------------------------------------------------------------------
// Validator Trait
// ---------------------------------------------------------------------------

/// Record acceptance policy.
pub trait Validator: Send + Sync {
    /// Accept or reject a single record.
    fn validate(&self, key: &[u8], value: &[u8]) -> Result<(), ValidationError>;

    /// Index of the best record among `values`, all stored under `key`.
    fn select(&self, key: &[u8], values: &[Vec<u8>]) -> Result<usize, ValidationError>;
}

/// Splits `/<namespace>/<rest>` into its parts.
///
/// `rest` is raw bytes: for `pk` records it's a binary peer id, not text.
pub fn split_key(key: &[u8]) -> Result<(&str, &[u8]), ValidationError> {
    let body = key.strip_prefix(b"/").ok_or(ValidationError::MissingNamespace)?;
    let slash = body
        .iter()
        .position(|b| *b == b'/')
        .ok_or(ValidationError::MissingNamespace)?;
    let namespace =
        std::str::from_utf8(&body[..slash]).map_err(|_| ValidationError::MissingNamespace)?;
    if namespace.is_empty() {
        return Err(ValidationError::MissingNamespace);
    }
    Ok((namespace, &body[slash + 1..]))
}

// ---------------------------------------------------------------------------
// Public Key Records
// ---------------------------------------------------------------------------

/// Validates `/pk/<peer-id>` → protobuf public key records.
///
/// A public key is either the right one for that peer id or it isn't, so
/// there's nothing to choose between: `select` always picks the first.
#[derive(Debug, Clone, Copy, Default)]
pub struct PublicKeyValidator;

impl Validator for PublicKeyValidator {
    fn validate(&self, key: &[u8], value: &[u8]) -> Result<(), ValidationError> {
        let (namespace, peer_bytes) = split_key(key)?;
        if namespace != PK_NAMESPACE {
            return Err(ValidationError::UnknownNamespace(namespace.to_string()));
        }

        let peer_id = PeerId::from_bytes(peer_bytes)
            .map_err(|e| ValidationError::InvalidPublicKey(format!("bad peer id: {e}")))?;
        let public = PublicKey::try_decode_protobuf(value)
            .map_err(|e| ValidationError::InvalidPublicKey(e.to_string()))?;

        if public.to_peer_id() != peer_id {
            return Err(ValidationError::KeyMismatch);
        }
        Ok(())
    }

    fn select(&self, _key: &[u8], values: &[Vec<u8>]) -> Result<usize, ValidationError> {
        if values.is_empty() {
            return Err(ValidationError::NoCandidates);
        }
        Ok(0)
    }
}

// ---------------------------------------------------------------------------
// Namespace Dispatch
// ---------------------------------------------------------------------------

/// Routes each record to the validator registered for its namespace.
#[derive(Default)]
pub struct NamespacedValidator {
    validators: HashMap<String, Box<dyn Validator>>,
}

impl NamespacedValidator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers (or replaces) the validator for `namespace`.
    pub fn with(mut self, namespace: &str, validator: impl Validator + 'static) -> Self {
        self.validators
            .insert(namespace.to_string(), Box::new(validator));
        self
    }

    pub fn namespaces(&self) -> impl Iterator<Item = &str> {
        self.validators.keys().map(String::as_str)
    }

    fn for_key(&self, key: &[u8]) -> Result<&dyn Validator, ValidationError> {
        let (namespace, _) = split_key(key)?;
        self.validators
            .get(namespace)
            .map(|v| v.as_ref())
            .ok_or_else(|| ValidationError::UnknownNamespace(namespace.to_string()))
    }
}

impl Validator for NamespacedValidator {
    fn validate(&self, key: &[u8], value: &[u8]) -> Result<(), ValidationError> {
        self.for_key(key)?.validate(key, value)
    }

    fn select(&self, key: &[u8], values: &[Vec<u8>]) -> Result<usize, ValidationError> {
        if values.is_empty() {
            return Err(ValidationError::NoCandidates);
        }
        self.for_key(key)?.select(key, values)
    }
}

impl fmt::Debug for NamespacedValidator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut namespaces: Vec<&str> = self.namespaces().collect();
        namespaces.sort_unstable();
        f.debug_struct("NamespacedValidator")
            .field("namespaces", &namespaces)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Observability Wrapper
// ---------------------------------------------------------------------------

/// Counters kept by [`RecordValidator`].
#[derive(Debug, Default)]
pub struct ValidatorStats {
    validate_calls: AtomicU64,
    validate_rejections: AtomicU64,
    select_calls: AtomicU64,
    select_rejections: AtomicU64,
}

/// Point-in-time copy of [`ValidatorStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ValidatorSnapshot {
    pub validate_calls: u64,
    pub validate_rejections: u64,
    pub select_calls: u64,
    pub select_rejections: u64,
}

impl ValidatorStats {
    pub fn snapshot(&self) -> ValidatorSnapshot {
        ValidatorSnapshot {
            validate_calls: self.validate_calls.load(Ordering::Relaxed),
            validate_rejections: self.validate_rejections.load(Ordering::Relaxed),
            select_calls: self.select_calls.load(Ordering::Relaxed),
            select_rejections: self.select_rejections.load(Ordering::Relaxed),
        }
    }
}

/// Pass-through validator: logs every call inside the span it was built
/// with and counts outcomes. The verdict is always the inner validator's.
pub struct RecordValidator {
    inner: Box<dyn Validator>,
    span: Span,
    stats: ValidatorStats,
}

impl RecordValidator {
    pub fn new(inner: impl Validator + 'static, span: Span) -> Self {
        Self {
            inner: Box::new(inner),
            span,
            stats: ValidatorStats::default(),
        }
    }

    /// The node's validator: `pk` records only.
    pub fn standard(span: Span) -> Self {
        Self::new(
            NamespacedValidator::new().with(PK_NAMESPACE, PublicKeyValidator),
            span,
        )
    }

    pub fn stats(&self) -> ValidatorSnapshot {
        self.stats.snapshot()
    }

    pub fn span(&self) -> &Span {
        &self.span
    }
}

/// Log-friendly rendering of a record key: namespace in clear, the rest hex.
fn display_key(key: &[u8]) -> String {
    match split_key(key) {
        Ok((namespace, rest)) => format!("/{namespace}/{}", hex::encode(rest)),
        Err(_) => hex::encode(key),
    }
}

impl Validator for RecordValidator {
    fn validate(&self, key: &[u8], value: &[u8]) -> Result<(), ValidationError> {
        let _entered = self.span.enter();
        self.stats.validate_calls.fetch_add(1, Ordering::Relaxed);

        let verdict = self.inner.validate(key, value);
        match &verdict {
            Ok(()) => debug!(key = %display_key(key), "record validated"),
            Err(e) => {
                self.stats.validate_rejections.fetch_add(1, Ordering::Relaxed);
                debug!(key = %display_key(key), error = %e, "record rejected");
            }
        }
        verdict
    }

    fn select(&self, key: &[u8], values: &[Vec<u8>]) -> Result<usize, ValidationError> {
        let _entered = self.span.enter();
        self.stats.select_calls.fetch_add(1, Ordering::Relaxed);

        let choice = self.inner.select(key, values);
        match &choice {
            Ok(index) => debug!(
                key = %display_key(key),
                candidates = values.len(),
                selected = index,
                "record selected"
            ),
            Err(e) => {
                self.stats.select_rejections.fetch_add(1, Ordering::Relaxed);
                debug!(key = %display_key(key), error = %e, "record selection failed");
            }
        }
        choice
    }
}

impl fmt::Debug for RecordValidator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RecordValidator")
            .field("stats", &self.stats.snapshot())
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
