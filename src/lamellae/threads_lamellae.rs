use super::{Backend, FabricState, Lamellae, LamellaeComm, LamellaeInit, SerializedData};
use crate::Error;

use crossbeam::channel::{unbounded, Receiver, Sender};

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Builds an in-process fabric of `num_pes` ranks, each with its own unbounded FIFO inbox.
/// Every rank holds a sender for every inbox, so a fixed sender/receiver pair is ordered.
pub(crate) struct ThreadsBuilder {
    num_pes: usize,
    state: Arc<FabricState>,
}

impl ThreadsBuilder {
    pub(crate) fn new(num_pes: usize) -> ThreadsBuilder {
        ThreadsBuilder {
            num_pes,
            state: Arc::new(FabricState::new()),
        }
    }
}

impl LamellaeInit for ThreadsBuilder {
    fn init_fabric(&mut self) -> (u64, usize) {
        (self.state.job_id(), self.num_pes)
    }
    fn init_lamellae(&mut self) -> Vec<Lamellae> {
        let (senders, receivers): (Vec<_>, Vec<_>) = (0..self.num_pes).map(|_| unbounded()).unzip();
        let senders = Arc::new(senders);
        receivers
            .into_iter()
            .enumerate()
            .map(|(pe, inbox)| {
                Lamellae::Threads(Threads {
                    my_pe: pe,
                    num_pes: self.num_pes,
                    state: self.state.clone(),
                    senders: senders.clone(),
                    inbox,
                    msgs_sent: AtomicUsize::new(0),
                    bytes_sent: AtomicUsize::new(0),
                })
            })
            .collect()
    }
}

pub(crate) struct Threads {
    my_pe: usize,
    num_pes: usize,
    state: Arc<FabricState>,
    senders: Arc<Vec<Sender<SerializedData>>>,
    inbox: Receiver<SerializedData>,
    msgs_sent: AtomicUsize,
    bytes_sent: AtomicUsize,
}

impl std::fmt::Debug for Threads {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Threads {{ pe: {}/{} }}", self.my_pe, self.num_pes)
    }
}

impl LamellaeComm for Threads {
    fn my_pe(&self) -> usize {
        self.my_pe
    }
    fn num_pes(&self) -> usize {
        self.num_pes
    }
    fn backend(&self) -> Backend {
        Backend::Threads
    }
    fn job_id(&self) -> u64 {
        self.state.job_id()
    }
    fn send_to_pe(&self, pe: usize, data: SerializedData) -> Result<(), Error> {
        let sender = self.senders.get(pe).ok_or(Error::InvalidPe(crate::IdError {
            parent_pe: pe,
            world_pe: pe,
        }))?;
        self.msgs_sent.fetch_add(1, Ordering::Relaxed);
        self.bytes_sent.fetch_add(data.len(), Ordering::Relaxed);
        sender.send(data).map_err(|_| {
            Error::RemoteInvocation(format!(
                "pe {} can not reach pe {}, its inbox is closed",
                self.my_pe, pe
            ))
        })
    }
    fn try_recv(&self) -> Option<SerializedData> {
        self.inbox.try_recv().ok()
    }
    fn recv_timeout(&self, timeout: Duration) -> Option<SerializedData> {
        self.inbox.recv_timeout(timeout).ok()
    }
    fn msgs_sent(&self) -> usize {
        self.msgs_sent.load(Ordering::Relaxed)
    }
    #[allow(non_snake_case)]
    fn MB_sent(&self) -> f64 {
        self.bytes_sent.load(Ordering::Relaxed) as f64 / 1_000_000.0
    }
    fn abort(&self, reason: &str) {
        self.state.abort(reason)
    }
    fn abort_reason(&self) -> Option<String> {
        self.state.abort_reason()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn per_pair_fifo() {
        let mut builder = ThreadsBuilder::new(3);
        let (_, num_pes) = builder.init_fabric();
        assert_eq!(num_pes, 3);
        let lamellae = builder.init_lamellae();
        for i in 0..10u8 {
            lamellae[0].send_to_pe(2, SerializedData(vec![i])).unwrap();
        }
        let received: Vec<u8> = (0..10)
            .map(|_| lamellae[2].try_recv().unwrap().0[0])
            .collect();
        assert_eq!(received, (0..10).collect::<Vec<u8>>());
        assert!(lamellae[1].try_recv().is_none());
        assert_eq!(lamellae[0].msgs_sent(), 10);
        assert!(lamellae[0].send_to_pe(3, SerializedData(vec![])).is_err());
    }

    #[test]
    fn abort_is_shared_and_first_reason_wins() {
        let mut builder = ThreadsBuilder::new(2);
        let lamellae = builder.init_lamellae();
        assert!(lamellae[1].abort_reason().is_none());
        lamellae[0].abort("first");
        lamellae[1].abort("second");
        assert_eq!(lamellae[1].abort_reason().as_deref(), Some("first"));
        assert_eq!(lamellae[0].job_id(), lamellae[1].job_id());
    }
}
