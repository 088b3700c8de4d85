use std::{
    collections::{BTreeMap, VecDeque},
    sync::{Arc, Mutex, MutexGuard},
};

use async_trait::async_trait;
use kube::Resource;
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;
use tokio::sync::Barrier;

use crate::{
    name::NamespacedName,
    scheme::{Scheme, TypeKey},
};

use super::{ClientError, ObjectClient};

/// An in-process object store honoring the [`ObjectClient`] contract.
///
/// Faults can be queued per operation and a gate can hold `get` calls until
/// a number of callers have arrived, which lets races be replayed
/// deterministically.
#[derive(Clone)]
pub struct MemoryClient {
    scheme: Arc<Scheme>,
    state: Arc<Mutex<MemoryState>>,
}

#[derive(Default)]
struct MemoryState {
    objects: BTreeMap<(TypeKey, NamespacedName), Value>,
    get_faults: VecDeque<ClientError>,
    get_gate: Option<Arc<Barrier>>,
    create_faults: VecDeque<ClientError>,
    stats: MemoryStats,
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct MemoryStats {
    pub gets: usize,
    pub create_attempts: usize,
    pub creates: usize,
}

impl MemoryClient {
    pub fn new(scheme: Arc<Scheme>) -> Self {
        Self {
            scheme,
            state: Default::default(),
        }
    }

    pub fn stats(&self) -> MemoryStats {
        self.lock().stats
    }

    /// Makes the next `get` calls fail with the given errors, in order.
    pub fn fail_gets(&self, errors: impl IntoIterator<Item = ClientError>) {
        self.lock().get_faults.extend(errors)
    }

    /// Makes the next `create` calls fail with the given errors, in order.
    pub fn fail_creates(&self, errors: impl IntoIterator<Item = ClientError>) {
        self.lock().create_faults.extend(errors)
    }

    /// Holds every `get` call, after it has read the store, until `callers`
    /// of them have done so.
    pub fn synchronize_gets(&self, callers: usize) {
        self.lock().get_gate = Some(Arc::new(Barrier::new(callers)));
    }

    /// Stores `object` directly, bypassing faults and counters.
    pub fn insert<K>(&self, object: &K) -> Result<(), ClientError>
    where
        K: Resource<DynamicType = ()> + Serialize,
    {
        let key = self.resolve::<K>()?;
        let name = super::object_name(object)?;
        let value = encode(object)?;
        self.lock().objects.insert((key, name), value);
        Ok(())
    }

    pub fn contains<K>(&self, name: &NamespacedName) -> bool
    where
        K: Resource<DynamicType = ()>,
    {
        let key = (TypeKey::of::<K>(), name.clone());
        self.lock().objects.contains_key(&key)
    }

    fn resolve<K>(&self) -> Result<TypeKey, ClientError>
    where
        K: Resource<DynamicType = ()>,
    {
        let key = TypeKey::of::<K>();
        self.scheme.resolve(&key)?;
        Ok(key)
    }

    fn lock(&self) -> MutexGuard<'_, MemoryState> {
        // a panicking test thread must not hide the state from the others
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl ObjectClient for MemoryClient {
    async fn get<K>(&self, name: &NamespacedName) -> Result<K, ClientError>
    where
        K: Resource<DynamicType = ()> + DeserializeOwned + Send,
    {
        let key = self.resolve::<K>()?;

        let (result, gate) = {
            let mut state = self.lock();
            state.stats.gets += 1;
            let result = match state.get_faults.pop_front() {
                Some(error) => Err(error),
                None => match state.objects.get(&(key.clone(), name.clone())) {
                    Some(value) => Ok(value.clone()),
                    None => Err(ClientError::NotFound {
                        kind: key.kind,
                        name: name.clone(),
                    }),
                },
            };
            (result, state.get_gate.clone())
        };

        // every gated caller reads before any of them proceeds
        if let Some(gate) = gate {
            gate.wait().await;
        }
        result.and_then(decode)
    }

    async fn create<K>(&self, object: &K) -> Result<K, ClientError>
    where
        K: Resource<DynamicType = ()> + Serialize + DeserializeOwned + Send + Sync,
    {
        let key = self.resolve::<K>()?;
        let name = super::object_name(object)?;
        let mut value = encode(object)?;

        let mut state = self.lock();
        state.stats.create_attempts += 1;
        if let Some(error) = state.create_faults.pop_front() {
            return Err(error);
        }

        let slot = (key, name);
        if state.objects.contains_key(&slot) {
            let (key, name) = slot;
            return Err(ClientError::AlreadyExists {
                kind: key.kind,
                name,
            });
        }

        if let Some(metadata) = value.get_mut("metadata").and_then(Value::as_object_mut) {
            metadata.insert("uid".into(), ::uuid::Uuid::new_v4().to_string().into());
            metadata.insert("resourceVersion".into(), "1".into());
        }
        state.stats.creates += 1;
        state.objects.insert(slot, value.clone());
        drop(state);

        decode(value)
    }
}

fn encode<K>(object: &K) -> Result<Value, ClientError>
where
    K: Resource<DynamicType = ()> + Serialize,
{
    ::serde_json::to_value(object).map_err(|error| {
        let kind = K::kind(&());
        ClientError::Fatal(format!("failed to encode {kind}: {error}"))
    })
}

fn decode<K>(value: Value) -> Result<K, ClientError>
where
    K: Resource<DynamicType = ()> + DeserializeOwned,
{
    ::serde_json::from_value(value).map_err(|error| {
        let kind = K::kind(&());
        ClientError::Fatal(format!("failed to decode {kind}: {error}"))
    })
}
