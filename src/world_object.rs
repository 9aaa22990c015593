use crate::world::World;
use crate::Error;

use parking_lot::RwLock;

use std::any::Any;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Collectively assigned id of a distributed object within a world.
///
/// Every member of the world registers its local part of the object under the same id, so a
/// remote operation names its target by id and the owner resolves it locally.
#[derive(
    serde::Serialize, serde::Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord,
)]
pub struct ObjectId(pub(crate) u64);

impl std::fmt::Display for ObjectId {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "obj{}", self.0)
    }
}

struct Registered {
    obj: Arc<dyn Any + Send + Sync>,
    type_name: &'static str,
    // members that dropped every handle to the object
    released: usize,
}

/// The local parts of the distributed objects of one world
pub(crate) struct ObjectRegistry {
    next_id: AtomicU64,
    objects: RwLock<HashMap<ObjectId, Registered>>,
}

impl ObjectRegistry {
    pub(crate) fn new() -> ObjectRegistry {
        ObjectRegistry {
            next_id: AtomicU64::new(0),
            objects: RwLock::new(HashMap::new()),
        }
    }

    /// Ids are handed out in registration order, identical on every member as long as
    /// objects are created collectively
    pub(crate) fn insert<T: Any + Send + Sync>(&self, obj: Arc<T>) -> ObjectId {
        let id = ObjectId(self.next_id.fetch_add(1, Ordering::SeqCst));
        self.objects.write().insert(
            id,
            Registered {
                obj,
                type_name: std::any::type_name::<T>(),
                released: 0,
            },
        );
        id
    }

    pub(crate) fn get<T: Any + Send + Sync>(&self, id: ObjectId) -> Result<Arc<T>, Error> {
        let objects = self.objects.read();
        let registered = objects.get(&id).ok_or(Error::UnknownObject(id.0))?;
        registered
            .obj
            .clone()
            .downcast::<T>()
            .map_err(|_| Error::TypeMismatch {
                expected: std::any::type_name::<T>(),
                found: registered.type_name,
            })
    }

    pub(crate) fn remove(&self, id: ObjectId) -> bool {
        self.objects.write().remove(&id).is_some()
    }

    /// Counts one member's release of `id` and drops the local part once all `num_pes`
    /// members released it. Returns true if the part was dropped; unknown ids are ignored.
    pub(crate) fn release(&self, id: ObjectId, num_pes: usize) -> bool {
        let mut objects = self.objects.write();
        let released = match objects.get_mut(&id) {
            Some(registered) => {
                registered.released += 1;
                registered.released
            }
            None => return false,
        };
        if released < num_pes {
            return false;
        }
        objects.remove(&id);
        true
    }

    pub(crate) fn len(&self) -> usize {
        self.objects.read().len()
    }
}

/// Keeps a distributed object registered on this member.
///
/// Dropping the last guard announces the release to every member of the world. A member
/// drops its part once all members released it, so operations already sent to it by slower
/// members still find their target.
pub(crate) struct ObjectGuard {
    world: World,
    id: ObjectId,
}

impl ObjectGuard {
    pub(crate) fn new(world: &World, id: ObjectId) -> Arc<ObjectGuard> {
        Arc::new(ObjectGuard {
            world: world.clone(),
            id,
        })
    }
}

impl Drop for ObjectGuard {
    fn drop(&mut self) {
        // an unwinding pe stays off the fabric
        if !std::thread::panicking() {
            self.world.release_object(self.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookup_by_id_and_type() {
        let registry = ObjectRegistry::new();
        let a = registry.insert(Arc::new(5u32));
        let b = registry.insert(Arc::new(String::from("b")));
        assert_ne!(a, b);
        assert_eq!(*registry.get::<u32>(a).unwrap(), 5);
        assert_eq!(registry.get::<String>(b).unwrap().as_str(), "b");
        assert!(matches!(
            registry.get::<u64>(a),
            Err(Error::TypeMismatch { .. })
        ));
        assert!(registry.remove(a));
        assert!(matches!(registry.get::<u32>(a), Err(Error::UnknownObject(0))));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn dropped_after_every_member_released() {
        let registry = ObjectRegistry::new();
        let id = registry.insert(Arc::new(7u8));
        assert!(!registry.release(id, 3));
        assert!(!registry.release(id, 3));
        assert_eq!(*registry.get::<u8>(id).unwrap(), 7);
        assert!(registry.release(id, 3));
        assert!(matches!(registry.get::<u8>(id), Err(Error::UnknownObject(_))));
        // late or repeated releases are ignored
        assert!(!registry.release(id, 3));
        assert_eq!(registry.len(), 0);
    }
}
