use crate::active_messaging::{AMCounters, ReqId};
use crate::Error;

use parking_lot::Mutex;

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

pub(crate) trait RequestAddResult: Sync + Send {
    fn add_result(&self, req_id: ReqId, data: &[u8]) -> Result<(), Error>;
}

/// The in-flight remote requests issued by this pe on one world
pub(crate) struct RequestTable {
    next_id: AtomicUsize,
    reqs: Mutex<HashMap<ReqId, Arc<dyn RequestAddResult>>>,
    pub(crate) counters: AMCounters,
}

impl RequestTable {
    pub(crate) fn new() -> RequestTable {
        RequestTable {
            next_id: AtomicUsize::new(0),
            reqs: Mutex::new(HashMap::new()),
            counters: AMCounters::new(),
        }
    }

    pub(crate) fn insert(&self, req: Arc<dyn RequestAddResult>) -> ReqId {
        let req_id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.reqs.lock().insert(req_id, req);
        self.counters.add_send_req(1);
        req_id
    }

    /// Hands a reply to its request; an unknown id means the reply was duplicated or misrouted
    pub(crate) fn complete(&self, req_id: ReqId, data: &[u8]) -> Result<(), Error> {
        let req = self.reqs.lock().remove(&req_id);
        match req {
            Some(req) => {
                let res = req.add_result(req_id, data);
                self.counters.complete_req();
                res
            }
            None => Err(Error::RemoteInvocation(format!(
                "received a reply for unknown request {}",
                req_id
            ))),
        }
    }

    pub(crate) fn outstanding(&self) -> usize {
        self.counters.outstanding()
    }
}
