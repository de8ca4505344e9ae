use async_trait::async_trait;
use chrono::Utc;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::trace;

use crate::error::StoreError;
use crate::traits::*;

/// Store operations, used to count calls and to target injected faults.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Op {
    Get,
    Create,
    Update,
    UpdateStatus,
    Delete,
}

impl Op {
    pub fn is_write(self) -> bool {
        !matches!(self, Op::Get)
    }
}

/// A failure the memory store produces instead of performing an operation.
#[derive(Debug, Clone)]
pub enum Fault {
    /// Fail the call with a stale-token conflict.
    Conflict,
    /// Fail the call with a backend error carrying this message.
    Backend(String),
    /// Fail the call with a timeout.
    Timeout,
    /// Let a read succeed, then modify the object behind the caller's back
    /// so the token it just received is stale.
    ConcurrentWrite,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct StoreKey {
    kind: String,
    id: ObjectId,
}

#[derive(Debug)]
struct Entry {
    value: Value,
    version: u64,
    generation: i64,
}

#[derive(Debug)]
struct ArmedFault {
    kind: String,
    op: Op,
    fault: Fault,
    // None keeps the fault armed until cleared
    remaining: Option<usize>,
}

#[derive(Debug, Default)]
struct Inner {
    objects: HashMap<StoreKey, Entry>,
    version: u64,
    faults: Vec<ArmedFault>,
    calls: HashMap<(String, Op), usize>,
}

/// In-process store with API-server-like semantics: monotonically increasing
/// resource versions, finalizer-aware deletion, status kept apart from the
/// rest of the object, and generation bumps on spec changes.
#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Mutex<Inner>>,
}

enum Proceed {
    Normally,
    ThenBump,
}

impl Inner {
    fn next_version(&mut self) -> u64 {
        self.version += 1;
        self.version
    }

    fn begin(&mut self, kind: &str, op: Op, id: &ObjectId) -> StoreResult<Proceed> {
        *self.calls.entry((kind.to_string(), op)).or_default() += 1;

        let Some(idx) = self
            .faults
            .iter()
            .position(|f| f.kind == kind && f.op == op)
        else {
            return Ok(Proceed::Normally);
        };
        let fault = self.faults[idx].fault.clone();
        if let Some(remaining) = self.faults[idx].remaining.as_mut() {
            *remaining -= 1;
            if *remaining == 0 {
                self.faults.remove(idx);
            }
        }
        trace!(%id, kind, ?op, ?fault, "injected fault");
        match fault {
            Fault::Conflict => Err(StoreError::Conflict(id.to_string())),
            Fault::Backend(msg) => Err(StoreError::Backend(msg)),
            Fault::Timeout => Err(StoreError::Timeout(id.to_string())),
            Fault::ConcurrentWrite => Ok(Proceed::ThenBump),
        }
    }

    fn check_token(
        &self,
        key: &StoreKey,
        token: &ConflictToken,
    ) -> StoreResult<()> {
        let entry = self
            .objects
            .get(key)
            .ok_or_else(|| StoreError::NotFound(key.id.to_string()))?;
        if entry.version.to_string() != token.as_str() {
            return Err(StoreError::Conflict(key.id.to_string()));
        }
        Ok(())
    }
}

fn key_of<T: StoredObject>(id: &ObjectId) -> StoreKey {
    StoreKey {
        kind: kind_key::<T>(),
        id: id.clone(),
    }
}

fn decode<T: StoredObject>(entry: &Entry) -> StoreResult<Versioned<T>> {
    let mut object: T = serde_json::from_value(entry.value.clone())?;
    let version = entry.version.to_string();
    object.meta_mut().resource_version = Some(version.clone());
    object.meta_mut().generation = Some(entry.generation);
    Ok(Versioned {
        object,
        token: ConflictToken::new(version),
    })
}

fn has_finalizers(value: &Value) -> bool {
    value["metadata"]["finalizers"]
        .as_array()
        .is_some_and(|f| !f.is_empty())
}

fn is_deleting(value: &Value) -> bool {
    !value["metadata"]["deletionTimestamp"].is_null()
}

// Everything but metadata and status; a change here bumps the generation.
fn spec_view(value: &Value) -> Value {
    let mut view = value.clone();
    if let Some(obj) = view.as_object_mut() {
        obj.remove("metadata");
        obj.remove("status");
    }
    view
}

fn strip_volatile_metadata(value: &mut Value) {
    if let Some(meta) = value.get_mut("metadata").and_then(Value::as_object_mut)
    {
        meta.remove("resourceVersion");
        meta.remove("generation");
    }
}

fn carry_server_fields(old: &Value, new: &mut Value) {
    for field in ["uid", "creationTimestamp", "deletionTimestamp"] {
        let prev = &old["metadata"][field];
        if !prev.is_null() {
            new["metadata"][field] = prev.clone();
        }
    }
    match old.get("status") {
        Some(status) => new["status"] = status.clone(),
        None => {
            if let Some(obj) = new.as_object_mut() {
                obj.remove("status");
            }
        }
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `times` calls of `op` on kind `T`.
    pub async fn fail<T: StoredObject>(&self, op: Op, fault: Fault, times: usize) {
        if times == 0 {
            return;
        }
        self.inner.lock().await.faults.push(ArmedFault {
            kind: kind_key::<T>(),
            op,
            fault,
            remaining: Some(times),
        });
    }

    /// Fail every call of `op` on kind `T` until [`MemoryStore::clear_faults`].
    pub async fn fail_always<T: StoredObject>(&self, op: Op, fault: Fault) {
        self.inner.lock().await.faults.push(ArmedFault {
            kind: kind_key::<T>(),
            op,
            fault,
            remaining: None,
        });
    }

    pub async fn clear_faults(&self) {
        self.inner.lock().await.faults.clear();
    }

    /// Number of `op` calls made on kind `T` since the last reset.
    pub async fn calls<T: StoredObject>(&self, op: Op) -> usize {
        self.inner
            .lock()
            .await
            .calls
            .get(&(kind_key::<T>(), op))
            .copied()
            .unwrap_or(0)
    }

    /// Number of write calls (of any kind) since the last reset.
    pub async fn total_writes(&self) -> usize {
        self.inner
            .lock()
            .await
            .calls
            .iter()
            .filter(|((_, op), _)| op.is_write())
            .map(|(_, n)| *n)
            .sum()
    }

    pub async fn reset_calls(&self) {
        self.inner.lock().await.calls.clear();
    }

    /// Read an object without counting the call or tripping faults.
    pub async fn peek<T: StoredObject>(&self, id: &ObjectId) -> Option<T> {
        let inner = self.inner.lock().await;
        inner
            .objects
            .get(&key_of::<T>(id))
            .and_then(|e| decode::<T>(e).ok())
            .map(|v| v.object)
    }

    /// Write an object as an outside party would (e.g. a manual edit):
    /// no token check, no call counting. Status is taken from `object`.
    pub async fn put<T: StoredObject>(&self, object: &T) -> StoreResult<ConflictToken> {
        let id = ObjectId::of(object);
        let key = key_of::<T>(&id);
        let mut value = serde_json::to_value(object)?;
        strip_volatile_metadata(&mut value);
        let mut inner = self.inner.lock().await;
        let version = inner.next_version();
        let generation = match inner.objects.get(&key) {
            Some(old) => {
                for field in ["uid", "creationTimestamp"] {
                    let prev = old.value["metadata"][field].clone();
                    if !prev.is_null() {
                        value["metadata"][field] = prev;
                    }
                }
                if spec_view(&old.value) != spec_view(&value) {
                    old.generation + 1
                } else {
                    old.generation
                }
            }
            None => 1,
        };
        inner.objects.insert(
            key,
            Entry {
                value,
                version,
                generation,
            },
        );
        Ok(ConflictToken::new(version.to_string()))
    }
}

#[async_trait]
impl<T: StoredObject> ObjectStore<T> for MemoryStore {
    async fn get(&self, id: &ObjectId) -> StoreResult<Versioned<T>> {
        let key = key_of::<T>(id);
        let mut inner = self.inner.lock().await;
        let proceed = inner.begin(&key.kind, Op::Get, id)?;
        let read = inner
            .objects
            .get(&key)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))
            .and_then(decode::<T>)?;
        if let Proceed::ThenBump = proceed {
            let version = inner.next_version();
            if let Some(entry) = inner.objects.get_mut(&key) {
                entry.version = version;
            }
        }
        Ok(read)
    }

    async fn create(&self, object: &T) -> StoreResult<ConflictToken> {
        let id = ObjectId::of(object);
        let key = key_of::<T>(&id);
        let mut value = serde_json::to_value(object)?;
        strip_volatile_metadata(&mut value);
        let mut inner = self.inner.lock().await;
        inner.begin(&key.kind, Op::Create, &id)?;
        if inner.objects.contains_key(&key) {
            return Err(StoreError::AlreadyExists(id.to_string()));
        }
        let version = inner.next_version();
        value["metadata"]["uid"] = Value::String(format!("uid-{version}"));
        value["metadata"]["creationTimestamp"] =
            serde_json::to_value(Time(Utc::now()))?;
        value["metadata"]["namespace"] = Value::String(id.namespace.clone());
        inner.objects.insert(
            key,
            Entry {
                value,
                version,
                generation: 1,
            },
        );
        trace!(%id, version, "memory store: created");
        Ok(ConflictToken::new(version.to_string()))
    }

    async fn update(
        &self,
        object: &T,
        token: &ConflictToken,
    ) -> StoreResult<ConflictToken> {
        let id = ObjectId::of(object);
        let key = key_of::<T>(&id);
        let mut value = serde_json::to_value(object)?;
        strip_volatile_metadata(&mut value);
        let mut inner = self.inner.lock().await;
        inner.begin(&key.kind, Op::Update, &id)?;
        inner.check_token(&key, token)?;
        let version = inner.next_version();
        let Some(entry) = inner.objects.get_mut(&key) else {
            return Err(StoreError::NotFound(id.to_string()));
        };
        carry_server_fields(&entry.value, &mut value);
        if spec_view(&entry.value) != spec_view(&value) {
            entry.generation += 1;
        }
        entry.value = value;
        entry.version = version;
        // The last finalizer going away releases a deleting object.
        if is_deleting(&entry.value) && !has_finalizers(&entry.value) {
            inner.objects.remove(&key);
            trace!(%id, "memory store: finalized and removed");
        }
        Ok(ConflictToken::new(version.to_string()))
    }

    async fn update_status(
        &self,
        object: &T,
        token: &ConflictToken,
    ) -> StoreResult<ConflictToken> {
        let id = ObjectId::of(object);
        let key = key_of::<T>(&id);
        let status = serde_json::to_value(object)?
            .get("status")
            .cloned()
            .unwrap_or(Value::Null);
        let mut inner = self.inner.lock().await;
        inner.begin(&key.kind, Op::UpdateStatus, &id)?;
        inner.check_token(&key, token)?;
        let version = inner.next_version();
        let Some(entry) = inner.objects.get_mut(&key) else {
            return Err(StoreError::NotFound(id.to_string()));
        };
        entry.value["status"] = status;
        entry.version = version;
        Ok(ConflictToken::new(version.to_string()))
    }

    async fn delete(&self, id: &ObjectId) -> StoreResult<()> {
        let key = key_of::<T>(id);
        let mut inner = self.inner.lock().await;
        inner.begin(&key.kind, Op::Delete, id)?;
        let Some(entry) = inner.objects.get(&key) else {
            return Err(StoreError::NotFound(id.to_string()));
        };
        if has_finalizers(&entry.value) {
            if !is_deleting(&entry.value) {
                let version = inner.next_version();
                let stamp = serde_json::to_value(Time(Utc::now()))?;
                if let Some(entry) = inner.objects.get_mut(&key) {
                    entry.value["metadata"]["deletionTimestamp"] = stamp;
                    entry.version = version;
                }
            }
            trace!(%id, "memory store: marked for deletion");
            return Ok(());
        }
        inner.objects.remove(&key);
        trace!(%id, "memory store: deleted");
        Ok(())
    }
}
