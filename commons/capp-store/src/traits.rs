use std::fmt;

use async_trait::async_trait;
use kube::{Resource, ResourceExt};
use serde::{Serialize, de::DeserializeOwned};

use crate::error::StoreError;

pub type StoreResult<T> = Result<T, StoreError>;

/// Namespaced identity of a stored object. Every store call is addressed by
/// identity; nothing in the hot path lists or searches.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectId {
    pub namespace: String,
    pub name: String,
}

impl ObjectId {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    /// Identity of an already materialized object. Objects without a
    /// namespace are placed in "default", matching the API server.
    pub fn of<K: Resource>(obj: &K) -> Self {
        Self {
            namespace: obj.namespace().unwrap_or_else(|| "default".into()),
            name: obj.name_any(),
        }
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// Optimistic-concurrency marker handed out by reads and checked by writes.
/// Backed by `metadata.resourceVersion`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConflictToken(String);

impl ConflictToken {
    pub fn new(version: impl Into<String>) -> Self {
        Self(version.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Token carried by an object returned from the backend.
    pub fn from_object<K: Resource>(obj: &K) -> StoreResult<Self> {
        obj.resource_version().map(Self).ok_or_else(|| {
            StoreError::Backend(format!(
                "{} returned without a resourceVersion",
                ObjectId::of(obj)
            ))
        })
    }
}

impl fmt::Display for ConflictToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A live object together with the token it was read at.
#[derive(Debug, Clone)]
pub struct Versioned<T> {
    pub object: T,
    pub token: ConflictToken,
}

/// Anything the store can persist: a typed, namespaced kube resource.
pub trait StoredObject:
    Resource<DynamicType = ()>
    + Clone
    + fmt::Debug
    + Serialize
    + DeserializeOwned
    + Send
    + Sync
    + 'static
{
}

impl<T> StoredObject for T where
    T: Resource<DynamicType = ()>
        + Clone
        + fmt::Debug
        + Serialize
        + DeserializeOwned
        + Send
        + Sync
        + 'static
{
}

/// Key under which a kind is tracked by backends and test hooks, e.g.
/// `serving.knative.dev/v1/Service`.
pub fn kind_key<T: StoredObject>() -> String {
    format!("{}/{}", T::api_version(&()), T::kind(&()))
}

/// Identity-addressed access to the backing store for one object kind.
///
/// Writes return the token of the state they produced so a caller can chain
/// a second write (e.g. finalizer then status) without re-reading.
#[async_trait]
pub trait ObjectStore<T: StoredObject>: Send + Sync {
    async fn get(&self, id: &ObjectId) -> StoreResult<Versioned<T>>;

    async fn create(&self, object: &T) -> StoreResult<ConflictToken>;

    /// Replace the object (spec and metadata). Fails with
    /// [`StoreError::Conflict`] when `token` is stale.
    async fn update(
        &self,
        object: &T,
        token: &ConflictToken,
    ) -> StoreResult<ConflictToken>;

    /// Replace only the status sub-tree of the object.
    async fn update_status(
        &self,
        object: &T,
        token: &ConflictToken,
    ) -> StoreResult<ConflictToken>;

    async fn delete(&self, id: &ObjectId) -> StoreResult<()>;
}
