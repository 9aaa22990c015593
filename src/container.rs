//! A distributed key/value map sharded by an explicit ownership function.
//!
//! Every key has exactly one owner, computed by a [Pmap] that is pure and total, so any rank
//! can route an operation without asking anyone. Only the owner ever touches an entry: other
//! ranks send the operation to it as an active message. Values are stored serialized, which
//! lets the owner serve remote requests without knowing the value type.

use crate::active_messaging::handle::AmHandle;
use crate::active_messaging::{ActiveMessage, ActiveMessaging, AmContext, AmDist};
use crate::rt_am;
use crate::world::World;
use crate::world_object::{ObjectGuard, ObjectId};
use crate::Error;

use parking_lot::Mutex;

use std::collections::hash_map::DefaultHasher;
use std::collections::BTreeMap;
use std::hash::{Hash, Hasher};
use std::marker::PhantomData;
use std::ops::Bound;
use std::sync::Arc;

/// Maps every key to the pe that owns it. Must be deterministic and identical on every pe.
pub trait Pmap: Send + Sync + 'static {
    fn owner(&self, key: i64, num_pes: usize) -> usize;
}

/// Hashes the key
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultPmap;

impl Pmap for DefaultPmap {
    fn owner(&self, key: i64, num_pes: usize) -> usize {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        (hasher.finish() % num_pes as u64) as usize
    }
}

/// Every key is owned by pe 0
#[derive(Debug, Clone, Copy, Default)]
pub struct MasterPmap;

impl Pmap for MasterPmap {
    fn owner(&self, _key: i64, _num_pes: usize) -> usize {
        0
    }
}

/// The local shard of a container, registered with its world so active messages can find it by id
pub(crate) struct ContainerRT {
    pmap: Arc<dyn Pmap>,
    type_name: &'static str,
    entries: Mutex<BTreeMap<i64, Vec<u8>>>,
}

impl ContainerRT {
    fn new<V>(pmap: Arc<dyn Pmap>) -> ContainerRT {
        ContainerRT {
            pmap,
            type_name: std::any::type_name::<V>(),
            entries: Mutex::new(BTreeMap::new()),
        }
    }

    pub(crate) fn insert(&self, key: i64, value: Vec<u8>) {
        self.entries.lock().insert(key, value);
    }

    pub(crate) fn remove(&self, key: i64) -> Option<Vec<u8>> {
        self.entries.lock().remove(&key)
    }

    pub(crate) fn get(&self, key: i64) -> Option<Vec<u8>> {
        self.entries.lock().get(&key).cloned()
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.lock().len()
    }

    fn first_key(&self) -> Option<i64> {
        self.entries.lock().keys().next().copied()
    }

    fn next_after(&self, cursor: Option<i64>) -> Option<(i64, Vec<u8>)> {
        let entries = self.entries.lock();
        let lower = match cursor {
            Some(key) => Bound::Excluded(key),
            None => Bound::Unbounded,
        };
        entries
            .range((lower, Bound::Unbounded))
            .next()
            .map(|(k, v)| (*k, v.clone()))
    }

    /// Removes and returns the entry with the smallest key, `None` if the shard is empty
    pub(crate) fn pop_first(&self, retry_limit: usize) -> Result<Option<(i64, Vec<u8>)>, Error> {
        pop_with_retry(retry_limit, || self.first_key(), |key| self.remove(key))
    }
}

/// Scan for the smallest key, then remove it. A key that vanished between the two steps
/// triggers a rescan, at most `retry_limit` times.
pub(crate) fn pop_with_retry(
    retry_limit: usize,
    mut scan: impl FnMut() -> Option<i64>,
    mut take: impl FnMut(i64) -> Option<Vec<u8>>,
) -> Result<Option<(i64, Vec<u8>)>, Error> {
    for attempt in 0..=retry_limit {
        let key = match scan() {
            Some(key) => key,
            None => return Ok(None),
        };
        if let Some(value) = take(key) {
            return Ok(Some((key, value)));
        }
        tracing::debug!(key, attempt, "key vanished before removal, rescanning");
    }
    Err(Error::PopRetriesExhausted(retry_limit))
}

fn local_shard(ctx: &AmContext, container: ObjectId) -> Arc<ContainerRT> {
    ctx.world()
        .object::<ContainerRT>(container)
        .unwrap_or_else(|e| ctx.world().abort(e))
}

#[derive(serde::Serialize, serde::Deserialize, Debug, Clone)]
struct ContainerInsert {
    container: ObjectId,
    key: i64,
    #[serde(with = "serde_bytes")]
    value: Vec<u8>,
}

#[rt_am]
impl ActiveMessage for ContainerInsert {
    type Output = ();
    fn exec(self, ctx: &AmContext) {
        local_shard(ctx, self.container).insert(self.key, self.value);
    }
}

#[derive(serde::Serialize, serde::Deserialize, Debug, Clone)]
struct ContainerErase {
    container: ObjectId,
    key: i64,
}

#[rt_am]
impl ActiveMessage for ContainerErase {
    type Output = bool;
    fn exec(self, ctx: &AmContext) -> bool {
        local_shard(ctx, self.container).remove(self.key).is_some()
    }
}

#[derive(serde::Serialize, serde::Deserialize, Debug, Clone)]
struct ContainerFind {
    container: ObjectId,
    key: i64,
}

#[rt_am]
impl ActiveMessage for ContainerFind {
    type Output = Option<serde_bytes::ByteBuf>;
    fn exec(self, ctx: &AmContext) -> Option<serde_bytes::ByteBuf> {
        local_shard(ctx, self.container)
            .get(self.key)
            .map(serde_bytes::ByteBuf::from)
    }
}

#[derive(serde::Serialize, serde::Deserialize, Debug, Clone)]
struct ContainerLen {
    container: ObjectId,
}

#[rt_am]
impl ActiveMessage for ContainerLen {
    type Output = usize;
    fn exec(self, ctx: &AmContext) -> usize {
        local_shard(ctx, self.container).len()
    }
}

/// A typed handle to a distributed container.
///
/// Construction is collective over the world. Every operation routes by the container's
/// [Pmap]: the owner performs it locally and synchronously, any other rank sends it to the
/// owner.
///
/// Handles from [WorldContainer::new] and their clones keep the container alive. Once every
/// member dropped them, each member drops its shard. Views from [WorldContainer::attach]
/// do not keep it alive.
///
/// # Examples
///```ignore
/// let map = WorldContainer::<String>::new(&world, DefaultPmap);
/// map.insert(7, "seven".to_owned());
/// world.fence();
/// assert_eq!(map.find(7), Some("seven".to_owned()));
///```
pub struct WorldContainer<V> {
    world: World,
    id: ObjectId,
    rt: Arc<ContainerRT>,
    _guard: Option<Arc<ObjectGuard>>,
    _value: PhantomData<fn() -> V>,
}

impl<V> Clone for WorldContainer<V> {
    fn clone(&self) -> Self {
        WorldContainer {
            world: self.world.clone(),
            id: self.id,
            rt: self.rt.clone(),
            _guard: self._guard.clone(),
            _value: PhantomData,
        }
    }
}

impl<V> std::fmt::Debug for WorldContainer<V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "WorldContainer<{}> {{ id: {}, world: {:x}, local_len: {} }}",
            self.rt.type_name,
            self.id,
            self.world.id(),
            self.rt.len()
        )
    }
}

impl<V: AmDist> WorldContainer<V> {
    /// Collective: creates an empty container on `world` distributed by `pmap`
    #[tracing::instrument(skip_all)]
    pub fn new<P: Pmap>(world: &World, pmap: P) -> WorldContainer<V> {
        let (id, rt) = world.register_object(ContainerRT::new::<V>(Arc::new(pmap)));
        WorldContainer {
            world: world.clone(),
            id,
            rt,
            _guard: Some(ObjectGuard::new(world, id)),
            _value: PhantomData,
        }
    }

    /// A typed view of container `id`, for code running on some rank of `world` (e.g. inside
    /// an active message). Fails if no such container exists or it holds another value type.
    pub fn attach(world: &World, id: ObjectId) -> Result<WorldContainer<V>, Error> {
        let rt = world.object::<ContainerRT>(id)?;
        if rt.type_name != std::any::type_name::<V>() {
            return Err(Error::TypeMismatch {
                expected: std::any::type_name::<V>(),
                found: rt.type_name,
            });
        }
        Ok(WorldContainer {
            world: world.clone(),
            id,
            rt,
            _guard: None,
            _value: PhantomData,
        })
    }

    pub fn id(&self) -> ObjectId {
        self.id
    }

    pub fn world(&self) -> &World {
        &self.world
    }

    /// The pe owning `key`
    pub fn owner(&self, key: i64) -> usize {
        self.rt.pmap.owner(key, self.world.num_pes())
    }

    pub fn is_local(&self, key: i64) -> bool {
        self.owner(key) == self.world.my_pe()
    }

    fn encode(&self, value: &V) -> Vec<u8> {
        crate::serialize(value)
            .unwrap_or_else(|e| self.world.abort(Error::Serialization(e.to_string())))
    }

    fn decode(&self, bytes: &[u8]) -> V {
        crate::deserialize(bytes).unwrap_or_else(|e| {
            self.world.abort(Error::Serialization(format!(
                "container {} entry is not a {}: {}",
                self.id, self.rt.type_name, e
            )))
        })
    }

    fn not_owner(&self, key: i64) -> Error {
        Error::NotOwner {
            key,
            owner: self.owner(key),
            pe: self.world.my_pe(),
        }
    }

    /// Stores `value` under `key` (replacing any previous value) on the owner.
    /// Resolved immediately when the calling pe owns the key.
    pub fn insert(&self, key: i64, value: V) -> AmHandle<()> {
        let value = self.encode(&value);
        self.world.exec_am_pe(
            self.owner(key),
            ContainerInsert {
                container: self.id,
                key,
                value,
            },
        )
    }

    /// Removes `key` on the owner. Erasing an absent key is a no-op, so concurrent erases of
    /// the same key remove it exactly once; the handle tells whether this call removed it.
    pub fn erase(&self, key: i64) -> AmHandle<bool> {
        self.world.exec_am_pe(
            self.owner(key),
            ContainerErase {
                container: self.id,
                key,
            },
        )
    }

    /// The value under `key`, read from the owner (blocking if that is another pe)
    pub fn find(&self, key: i64) -> Option<V> {
        if self.is_local(key) {
            return self.rt.get(key).map(|bytes| self.decode(&bytes));
        }
        self.world
            .exec_am_pe(
                self.owner(key),
                ContainerFind {
                    container: self.id,
                    key,
                },
            )
            .get()
            .map(|bytes| self.decode(&bytes))
    }

    /// The value under `key`, only on the owner
    pub fn find_local(&self, key: i64) -> Result<Option<V>, Error> {
        if !self.is_local(key) {
            return Err(self.not_owner(key));
        }
        Ok(self.rt.get(key).map(|bytes| self.decode(&bytes)))
    }

    /// Read-modify-write of a locally owned entry: `f` receives the current value and returns
    /// the new one (`None` removes the entry). `f` must not access this container.
    pub fn update_local<F>(&self, key: i64, f: F) -> Result<(), Error>
    where
        F: FnOnce(Option<V>) -> Option<V>,
    {
        if !self.is_local(key) {
            return Err(self.not_owner(key));
        }
        let mut entries = self.rt.entries.lock();
        let current = entries.get(&key).map(|bytes| self.decode(bytes));
        match f(current) {
            Some(value) => {
                entries.insert(key, self.encode(&value));
            }
            None => {
                entries.remove(&key);
            }
        }
        Ok(())
    }

    /// Iterates the locally owned entries in key order.
    ///
    /// The iterator is lazy and finite and holds no lock between items: entries inserted
    /// behind the cursor are skipped, entries ahead of it are seen. Calling `iter_local`
    /// again restarts from the smallest key. Not coordinated across pes.
    pub fn iter_local(&self) -> LocalIter<V> {
        LocalIter {
            container: self.clone(),
            cursor: None,
        }
    }

    /// Number of entries owned by the calling pe
    pub fn local_len(&self) -> usize {
        self.rt.len()
    }

    /// Number of entries owned by `pe`
    pub fn len_on(&self, pe: usize) -> AmHandle<usize> {
        self.world
            .exec_am_pe(pe, ContainerLen { container: self.id })
    }
}

/// Iterator over the locally owned entries of a [WorldContainer], see [WorldContainer::iter_local]
pub struct LocalIter<V> {
    container: WorldContainer<V>,
    cursor: Option<i64>,
}

impl<V: AmDist> Iterator for LocalIter<V> {
    type Item = (i64, V);
    fn next(&mut self) -> Option<(i64, V)> {
        let (key, bytes) = self.container.rt.next_after(self.cursor)?;
        self.cursor = Some(key);
        Some((key, self.container.decode(&bytes)))
    }
}
