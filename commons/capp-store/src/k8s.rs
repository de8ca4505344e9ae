use async_trait::async_trait;
use k8s_openapi::NamespaceResourceScope;
use kube::{
    Api, Client, Resource,
    api::{DeleteParams, Patch, PatchParams, PostParams},
};
use serde_json::json;
use tracing::trace;

use crate::{
    error::StoreError,
    traits::{
        ConflictToken, ObjectId, ObjectStore, StoreResult, StoredObject,
        Versioned,
    },
};

/// Store backed by the Kubernetes API server. The conflict token is the
/// object's `resourceVersion`; the API server rejects stale writes with 409.
#[derive(Clone)]
pub struct KubeStore {
    client: Client,
}

impl KubeStore {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn api<T>(&self, namespace: &str) -> Api<T>
    where
        T: StoredObject + Resource<Scope = NamespaceResourceScope>,
    {
        Api::namespaced(self.client.clone(), namespace)
    }
}

fn classify(err: kube::Error, id: &ObjectId) -> StoreError {
    match err {
        kube::Error::Api(resp) if resp.code == 404 => {
            StoreError::NotFound(id.to_string())
        }
        kube::Error::Api(resp)
            if resp.code == 409 && resp.reason == "AlreadyExists" =>
        {
            StoreError::AlreadyExists(id.to_string())
        }
        kube::Error::Api(resp) if resp.code == 409 => {
            StoreError::Conflict(id.to_string())
        }
        kube::Error::SerdeError(e) => StoreError::Serialization(e),
        other => StoreError::Backend(other.to_string()),
    }
}

#[async_trait]
impl<T> ObjectStore<T> for KubeStore
where
    T: StoredObject + Resource<Scope = NamespaceResourceScope>,
{
    async fn get(&self, id: &ObjectId) -> StoreResult<Versioned<T>> {
        let object = self
            .api::<T>(&id.namespace)
            .get(&id.name)
            .await
            .map_err(|e| classify(e, id))?;
        let token = ConflictToken::from_object(&object)?;
        Ok(Versioned { object, token })
    }

    async fn create(&self, object: &T) -> StoreResult<ConflictToken> {
        let id = ObjectId::of(object);
        let created = self
            .api::<T>(&id.namespace)
            .create(&PostParams::default(), object)
            .await
            .map_err(|e| classify(e, &id))?;
        trace!(%id, kind = %T::kind(&()), "created");
        ConflictToken::from_object(&created)
    }

    async fn update(
        &self,
        object: &T,
        token: &ConflictToken,
    ) -> StoreResult<ConflictToken> {
        let id = ObjectId::of(object);
        let mut object = object.clone();
        object.meta_mut().resource_version = Some(token.as_str().to_string());
        let replaced = self
            .api::<T>(&id.namespace)
            .replace(&id.name, &PostParams::default(), &object)
            .await
            .map_err(|e| classify(e, &id))?;
        ConflictToken::from_object(&replaced)
    }

    async fn update_status(
        &self,
        object: &T,
        token: &ConflictToken,
    ) -> StoreResult<ConflictToken> {
        let id = ObjectId::of(object);
        let value = serde_json::to_value(object)?;
        // resourceVersion in a merge patch makes the API server enforce it
        let patch = json!({
            "metadata": { "resourceVersion": token.as_str() },
            "status": value.get("status").cloned().unwrap_or_default(),
        });
        let patched = self
            .api::<T>(&id.namespace)
            .patch_status(&id.name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
            .map_err(|e| classify(e, &id))?;
        ConflictToken::from_object(&patched)
    }

    async fn delete(&self, id: &ObjectId) -> StoreResult<()> {
        self.api::<T>(&id.namespace)
            .delete(&id.name, &DeleteParams::background())
            .await
            .map_err(|e| classify(e, id))?;
        Ok(())
    }
}
