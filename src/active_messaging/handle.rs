use crate::active_messaging::{AmDist, ReqId};
use crate::request::RequestAddResult;
use crate::scheduler::Scheduler;
use crate::warnings::RuntimeWarning;
use crate::Error;

use futures::Future;
use parking_lot::Mutex;

use std::pin::Pin;
use std::sync::{Arc, OnceLock};
use std::task::{Context, Poll, Waker};

pub(crate) struct AmHandleInner<T> {
    data: OnceLock<T>,
    waker: Mutex<Option<Waker>>,
}

impl<T> AmHandleInner<T> {
    fn new() -> AmHandleInner<T> {
        AmHandleInner {
            data: OnceLock::new(),
            waker: Mutex::new(None),
        }
    }

    fn resolve(&self, req_id: ReqId, val: T) -> Result<(), Error> {
        self.data
            .set(val)
            .map_err(|_| Error::AlreadyResolved(req_id))?;
        if let Some(waker) = self.waker.lock().take() {
            waker.wake();
        }
        Ok(())
    }
}

impl<T: AmDist> RequestAddResult for AmHandleInner<T> {
    fn add_result(&self, req_id: ReqId, data: &[u8]) -> Result<(), Error> {
        let val: T = crate::deserialize(data).map_err(|e| {
            Error::Serialization(format!(
                "reply to request {} is not a {}: {}",
                req_id,
                std::any::type_name::<T>(),
                e
            ))
        })?;
        self.resolve(req_id, val)
    }
}

/// A single-assignment handle to the result of an active message.
///
/// The handle is either pending or resolved; it moves from pending to resolved exactly once,
/// when the reply is processed, and the value never changes afterwards. Blocking on the
/// handle services incoming messages, so waiting on a result never stops this PE from
/// answering the requests of others.
pub struct AmHandle<T> {
    inner: Arc<AmHandleInner<T>>,
    scheduler: Arc<Scheduler>,
}

impl<T: AmDist + Clone> AmHandle<T> {
    pub(crate) fn resolved(val: T, scheduler: Arc<Scheduler>) -> AmHandle<T> {
        let inner = AmHandleInner::new();
        let _ = inner.data.set(val);
        AmHandle {
            inner: Arc::new(inner),
            scheduler,
        }
    }

    pub(crate) fn pending(scheduler: Arc<Scheduler>) -> (AmHandle<T>, Arc<AmHandleInner<T>>) {
        let inner = Arc::new(AmHandleInner::new());
        (
            AmHandle {
                inner: inner.clone(),
                scheduler,
            },
            inner,
        )
    }

    /// Returns true once the result has arrived, never blocks
    pub fn is_ready(&self) -> bool {
        self.inner.data.get().is_some()
    }

    /// The result if it has arrived, never blocks
    pub fn try_get(&self) -> Option<T> {
        self.inner.data.get().cloned()
    }

    /// Blocks (servicing incoming messages) until the result arrives, then borrows it
    #[tracing::instrument(skip_all)]
    pub fn get_ref(&self) -> &T {
        self.scheduler.wait_for(
            |elapsed| RuntimeWarning::BlockingWait("AmHandle::get", elapsed),
            || self.inner.data.get(),
        )
    }

    /// Blocks (servicing incoming messages) until the result arrives
    pub fn get(self) -> T {
        self.get_ref().clone()
    }
}

impl<T> Clone for AmHandle<T> {
    fn clone(&self) -> Self {
        AmHandle {
            inner: self.inner.clone(),
            scheduler: self.scheduler.clone(),
        }
    }
}

impl<T> std::fmt::Debug for AmHandle<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = if self.inner.data.get().is_some() {
            "resolved"
        } else {
            "pending"
        };
        write!(f, "AmHandle({state})")
    }
}

impl<T: AmDist + Clone> Future for AmHandle<T> {
    type Output = T;
    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        if let Some(val) = self.inner.data.get() {
            return Poll::Ready(val.clone());
        }
        *self.inner.waker.lock() = Some(cx.waker().clone());
        // the reply may have landed while the waker was being stored
        match self.inner.data.get() {
            Some(val) => Poll::Ready(val.clone()),
            None => Poll::Pending,
        }
    }
}

/// The results of an active message executed on every PE of a world, indexed by world pe id
pub struct MultiAmHandle<T> {
    handles: Vec<AmHandle<T>>,
    scheduler: Arc<Scheduler>,
}

impl<T: AmDist + Clone> MultiAmHandle<T> {
    pub(crate) fn new(handles: Vec<AmHandle<T>>, scheduler: Arc<Scheduler>) -> MultiAmHandle<T> {
        MultiAmHandle { handles, scheduler }
    }

    pub fn is_ready(&self) -> bool {
        self.handles.iter().all(|h| h.is_ready())
    }

    pub fn try_get(&self) -> Option<Vec<T>> {
        self.handles.iter().map(|h| h.try_get()).collect()
    }

    #[tracing::instrument(skip_all)]
    pub fn get(self) -> Vec<T> {
        self.scheduler.wait_for(
            |elapsed| RuntimeWarning::BlockingWait("MultiAmHandle::get", elapsed),
            || self.try_get(),
        )
    }
}

impl<T: AmDist + Clone> Future for MultiAmHandle<T> {
    type Output = Vec<T>;
    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let mut ready = true;
        for handle in self.handles.iter_mut() {
            if Pin::new(handle).poll(cx).is_pending() {
                ready = false;
            }
        }
        if ready {
            match self.try_get() {
                Some(vals) => Poll::Ready(vals),
                None => Poll::Pending,
            }
        } else {
            Poll::Pending
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolves_exactly_once() {
        let inner = AmHandleInner::<u64>::new();
        assert!(inner.data.get().is_none());
        inner.resolve(7, 42).unwrap();
        assert_eq!(inner.data.get(), Some(&42));
        match inner.resolve(7, 43) {
            Err(Error::AlreadyResolved(7)) => {}
            other => panic!("expected AlreadyResolved, got {other:?}"),
        }
        assert_eq!(inner.data.get(), Some(&42));
    }

    #[test]
    fn remote_result_type_mismatch() {
        let inner = AmHandleInner::<String>::new();
        let bytes = crate::serialize(&vec![1u8; 3]).unwrap();
        let res = inner.add_result(3, &bytes[..4]);
        assert!(matches!(res, Err(Error::Serialization(_))));
        assert!(inner.data.get().is_none());
    }
}
