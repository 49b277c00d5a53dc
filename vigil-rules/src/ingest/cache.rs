use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::Value;
use sha2::{Digest, Sha256};
use tokio::sync::OnceCell;
use tracing::trace;
use uuid::Uuid;

use super::IngestResult;
use crate::error::IngestError;

type Slot = Arc<OnceCell<Result<Arc<IngestResult>, IngestError>>>;

/// Ingest results of one entity evaluation, keyed by fingerprint.
///
/// The shared variant builds each key at most once: concurrent callers for the same key
/// wait on the first builder and observe its result, including a failure. The no-op
/// variant always builds.
#[derive(Clone)]
pub enum IngestCache {
    Shared(Arc<Mutex<HashMap<String, Slot>>>),
    NoOp,
}

impl IngestCache {
    pub fn shared() -> Self {
        IngestCache::Shared(Arc::new(Mutex::new(HashMap::new())))
    }

    pub fn noop() -> Self {
        IngestCache::NoOp
    }

    pub fn len(&self) -> usize {
        match self {
            IngestCache::Shared(slots) => slots.lock().len(),
            IngestCache::NoOp => 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub async fn get_or_ingest<F, Fut>(
        &self,
        key: &str,
        build: F,
    ) -> Result<Arc<IngestResult>, IngestError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<IngestResult, IngestError>>,
    {
        let slots = match self {
            IngestCache::NoOp => return build().await.map(Arc::new),
            IngestCache::Shared(slots) => slots,
        };
        let slot = slots.lock().entry(key.to_string()).or_default().clone();
        if slot.initialized() {
            trace!(fingerprint = key, "ingest cache hit");
        }
        slot.get_or_init(|| async { build().await.map(Arc::new) })
            .await
            .clone()
    }
}

impl std::fmt::Debug for IngestCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            IngestCache::Shared(_) => write!(f, "IngestCache::Shared({} entries)", self.len()),
            IngestCache::NoOp => f.write_str("IngestCache::NoOp"),
        }
    }
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<_> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (index, key) in keys.into_iter().enumerate() {
                if index > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String(key.clone()).to_string());
                out.push(':');
                write_canonical(&map[key], out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (index, item) in items.iter().enumerate() {
                if index > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        other => out.push_str(&other.to_string()),
    }
}

/// Cache key of an ingest: SHA-256 over rule type, entity, normalized params and provider.
///
/// Absent (`null`) params and an empty object fingerprint the same.
pub fn fingerprint(rule_type: &str, entity_id: Uuid, params: &Value, provider_id: Uuid) -> String {
    let mut canonical = String::new();
    match params {
        Value::Null => canonical.push_str("{}"),
        other => write_canonical(other, &mut canonical),
    }

    let mut hasher = Sha256::new();
    for part in [
        rule_type.as_bytes(),
        entity_id.as_bytes(),
        canonical.as_bytes(),
        provider_id.as_bytes(),
    ] {
        hasher.update((part.len() as u64).to_be_bytes());
        hasher.update(part);
    }
    hex::encode(hasher.finalize())
}
