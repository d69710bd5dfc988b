//! Coalescing bridge between the update loop and a background trace worker.
//!
//! The update loop queues the latest [`TracePoint`] per entity, flushes at
//! most once per frame, and later dispatches finished [`Trace`]s to the
//! callbacks registered for each entity. The worker thread shares no memory
//! with the loop: batches and results cross the boundary as owned messages.

use std::{
    collections::{BTreeMap, HashMap},
    fmt, io,
    panic::{self, AssertUnwindSafe},
    sync::mpsc::{
        self, Receiver, RecvTimeoutError, Sender, SyncSender, TryRecvError, TrySendError,
    },
    thread::{self, JoinHandle},
    time::Duration,
};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, error, trace, warn};

use crate::trajectory::{PatchedConicTracer, Trace, TraceError, TracePoint};

/// Identifier of a traced entity.
#[derive(
    Copy, Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct TraceId(pub u64);

impl fmt::Display for TraceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("the trace worker has stopped")]
    WorkerGone,
    #[error("could not start the trace worker: {0}")]
    Spawn(#[from] io::Error),
}

/// Computation run on the background thread for each queued entity.
pub trait TraceWorker: Send + 'static {
    fn compute(&mut self, id: TraceId, point: &TracePoint) -> Result<Trace, TraceError>;
}

impl<F> TraceWorker for F
where
    F: FnMut(TraceId, &TracePoint) -> Result<Trace, TraceError> + Send + 'static,
{
    fn compute(&mut self, id: TraceId, point: &TracePoint) -> Result<Trace, TraceError> {
        self(id, point)
    }
}

impl TraceWorker for PatchedConicTracer {
    fn compute(&mut self, _id: TraceId, point: &TracePoint) -> Result<Trace, TraceError> {
        self.trace(point)
    }
}

/// One flush worth of updates, at most one per entity.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TraceBatch {
    pub sequence: u64,
    pub updates: Vec<(TraceId, TracePoint)>,
}

/// The traces computed for one [`TraceBatch`]. Entities whose computation
/// failed are absent.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TraceBatchResult {
    pub sequence: u64,
    pub traces: Vec<(TraceId, Trace)>,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Flush {
    /// Nothing was pending.
    Empty,
    /// A batch with this many updates was handed to the worker.
    Sent(usize),
    /// The mailbox was full; this many updates stay pending.
    Deferred(usize),
}

type Handler = Box<dyn FnMut(&Trace)>;

pub struct TraceChannel {
    pending: BTreeMap<TraceId, TracePoint>,
    handlers: HashMap<TraceId, Handler>,
    tx: Option<SyncSender<TraceBatch>>,
    rx: Receiver<TraceBatchResult>,
    worker: Option<JoinHandle<()>>,
    sequence: u64,
    in_flight: usize,
}

impl TraceChannel {
    /// Start the background worker with a mailbox of `capacity` batches
    /// (at least one).
    pub fn spawn<W: TraceWorker>(worker: W, capacity: usize) -> Result<Self, ChannelError> {
        let (batch_tx, batch_rx) = mpsc::sync_channel(capacity.max(1));
        let (result_tx, result_rx) = mpsc::channel();
        let handle = thread::Builder::new()
            .name("trace-worker".into())
            .spawn(move || worker_thread(batch_rx, result_tx, worker))?;
        Ok(Self {
            pending: BTreeMap::new(),
            handlers: HashMap::new(),
            tx: Some(batch_tx),
            rx: result_rx,
            worker: Some(handle),
            sequence: 0,
            in_flight: 0,
        })
    }

    pub fn register(&mut self, id: TraceId, callback: impl FnMut(&Trace) + 'static) {
        self.handlers.insert(id, Box::new(callback));
    }

    /// Stop delivering to `id`. Work already handed to the worker still
    /// runs; its result is dropped on arrival.
    pub fn unregister(&mut self, id: TraceId) -> bool {
        self.handlers.remove(&id).is_some()
    }

    pub fn is_registered(&self, id: TraceId) -> bool {
        self.handlers.contains_key(&id)
    }

    /// Replace any pending point for `id`.
    pub fn queue_update(&mut self, id: TraceId, point: TracePoint) {
        self.pending.insert(id, point);
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Batches sent whose results have not been dispatched yet.
    pub fn in_flight(&self) -> usize {
        self.in_flight
    }

    /// Send every pending update to the worker as one batch.
    pub fn flush(&mut self) -> Result<Flush, ChannelError> {
        if self.pending.is_empty() {
            return Ok(Flush::Empty);
        }
        let tx = self.tx.as_ref().ok_or(ChannelError::WorkerGone)?;
        let batch = TraceBatch {
            sequence: self.sequence,
            updates: std::mem::take(&mut self.pending).into_iter().collect(),
        };
        let len = batch.updates.len();
        match tx.try_send(batch) {
            Ok(()) => {
                trace!(sequence = self.sequence, len, "flushed trace batch");
                self.sequence += 1;
                self.in_flight += 1;
                Ok(Flush::Sent(len))
            }
            Err(TrySendError::Full(batch)) => {
                debug!(len, "trace mailbox full, deferring batch");
                self.restore(batch);
                Ok(Flush::Deferred(self.pending.len()))
            }
            Err(TrySendError::Disconnected(batch)) => {
                self.restore(batch);
                Err(ChannelError::WorkerGone)
            }
        }
    }

    /// Deliver every finished result without blocking. Returns the number of
    /// callbacks invoked.
    pub fn dispatch(&mut self) -> Result<usize, ChannelError> {
        let mut delivered = 0;
        loop {
            match self.rx.try_recv() {
                Ok(result) => delivered += self.deliver(result),
                Err(TryRecvError::Empty) => return Ok(delivered),
                Err(TryRecvError::Disconnected) if self.in_flight > 0 => {
                    return Err(ChannelError::WorkerGone)
                }
                Err(TryRecvError::Disconnected) => return Ok(delivered),
            }
        }
    }

    /// Like [`dispatch`](Self::dispatch), but waits up to `timeout` for a
    /// result when one is outstanding.
    pub fn dispatch_timeout(&mut self, timeout: Duration) -> Result<usize, ChannelError> {
        if self.in_flight == 0 {
            return self.dispatch();
        }
        match self.rx.recv_timeout(timeout) {
            Ok(result) => {
                let delivered = self.deliver(result);
                Ok(delivered + self.dispatch()?)
            }
            Err(RecvTimeoutError::Timeout) => Ok(0),
            Err(RecvTimeoutError::Disconnected) => Err(ChannelError::WorkerGone),
        }
    }

    fn restore(&mut self, batch: TraceBatch) {
        for (id, point) in batch.updates {
            self.pending.entry(id).or_insert(point);
        }
    }

    fn deliver(&mut self, result: TraceBatchResult) -> usize {
        self.in_flight = self.in_flight.saturating_sub(1);
        let mut delivered = 0;
        for (id, trace) in &result.traces {
            match self.handlers.get_mut(id) {
                Some(handler) => {
                    handler(trace);
                    delivered += 1;
                }
                None => {
                    debug!(%id, sequence = result.sequence, "dropping trace for unregistered id");
                }
            }
        }
        delivered
    }
}

impl Drop for TraceChannel {
    fn drop(&mut self) {
        self.tx.take();
        if let Some(handle) = self.worker.take() {
            if handle.join().is_err() {
                error!("trace worker panicked");
            }
        }
    }
}

impl fmt::Debug for TraceChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TraceChannel")
            .field("pending", &self.pending)
            .field("handlers", &self.handlers.keys().collect::<Vec<_>>())
            .field("sequence", &self.sequence)
            .field("in_flight", &self.in_flight)
            .finish_non_exhaustive()
    }
}

/// Body of the background thread. Runs until the batch sender is dropped.
pub fn worker_thread<W: TraceWorker>(
    rx: Receiver<TraceBatch>,
    tx: Sender<TraceBatchResult>,
    mut worker: W,
) {
    while let Ok(batch) = rx.recv() {
        trace!(sequence = batch.sequence, len = batch.updates.len(), "computing trace batch");
        let traces = batch
            .updates
            .iter()
            .filter_map(|(id, point)| {
                match panic::catch_unwind(AssertUnwindSafe(|| worker.compute(*id, point))) {
                    Ok(Ok(trace)) => Some((*id, trace)),
                    Ok(Err(error)) => {
                        warn!(%id, %error, "trace computation failed");
                        None
                    }
                    Err(_) => {
                        error!(%id, "trace computation panicked");
                        None
                    }
                }
            })
            .collect();
        let result = TraceBatchResult {
            sequence: batch.sequence,
            traces,
        };
        if tx.send(result).is_err() {
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{cell::RefCell, rc::Rc};

    use nalgebra::Vector3;

    use super::*;
    use crate::{bodies::BodyId, soi::TrajectorySample, time::UT};

    const WAIT: Duration = Duration::from_secs(10);

    fn point(x: f64) -> TracePoint {
        TracePoint {
            time: UT::J2000,
            central_body: BodyId(399),
            position: Vector3::new(x, 0.0, 0.0),
            velocity: Vector3::zeros(),
        }
    }

    fn echo(_: TraceId, point: &TracePoint) -> Result<Trace, TraceError> {
        Ok(Trace {
            samples: vec![TrajectorySample::from(*point)],
            transitions: vec![],
        })
    }

    fn recorder(channel: &mut TraceChannel, id: TraceId) -> Rc<RefCell<Vec<f64>>> {
        let seen = Rc::new(RefCell::new(Vec::new()));
        let sink = seen.clone();
        channel.register(id, move |trace: &Trace| {
            sink.borrow_mut().push(trace.samples[0].position.x);
        });
        seen
    }

    fn drain(channel: &mut TraceChannel) -> usize {
        let mut delivered = 0;
        for _ in 0..100 {
            if channel.in_flight() == 0 {
                break;
            }
            delivered += channel.dispatch_timeout(WAIT).unwrap();
        }
        delivered
    }

    #[test]
    fn latest_update_wins() {
        let mut channel = TraceChannel::spawn(echo, 4).unwrap();
        let seen = recorder(&mut channel, TraceId(1));
        channel.queue_update(TraceId(1), point(1.0));
        channel.queue_update(TraceId(1), point(2.0));
        assert_eq!(channel.flush().unwrap(), Flush::Sent(1));
        assert_eq!(channel.pending_len(), 0);
        assert_eq!(drain(&mut channel), 1);
        assert_eq!(*seen.borrow(), vec![2.0]);
    }

    #[test]
    fn empty_flush_sends_nothing() {
        let mut channel = TraceChannel::spawn(echo, 1).unwrap();
        assert_eq!(channel.flush().unwrap(), Flush::Empty);
        assert_eq!(channel.in_flight(), 0);
        assert_eq!(channel.dispatch().unwrap(), 0);
    }

    #[test]
    fn failing_entities_are_isolated() {
        let worker = |id: TraceId, point: &TracePoint| match id.0 {
            1 => Err(TraceError::Worker("no solution".into())),
            2 => panic!("worker bug"),
            _ => echo(id, point),
        };
        let mut channel = TraceChannel::spawn(worker, 1).unwrap();
        let seen: Vec<_> = (1..=3)
            .map(|i| recorder(&mut channel, TraceId(i)))
            .collect();
        for i in 1..=3 {
            channel.queue_update(TraceId(i), point(i as f64));
        }
        channel.flush().unwrap();
        assert_eq!(drain(&mut channel), 1);
        assert!(seen[0].borrow().is_empty());
        assert!(seen[1].borrow().is_empty());
        assert_eq!(*seen[2].borrow(), vec![3.0]);

        // the worker survives the panic
        channel.queue_update(TraceId(3), point(4.0));
        channel.flush().unwrap();
        assert_eq!(drain(&mut channel), 1);
        assert_eq!(*seen[2].borrow(), vec![3.0, 4.0]);
    }

    #[test]
    fn unregistered_results_are_dropped() {
        let mut channel = TraceChannel::spawn(echo, 1).unwrap();
        let kept = recorder(&mut channel, TraceId(1));
        let dropped = recorder(&mut channel, TraceId(2));
        channel.queue_update(TraceId(1), point(1.0));
        channel.queue_update(TraceId(2), point(2.0));
        channel.queue_update(TraceId(3), point(3.0));
        channel.flush().unwrap();
        assert!(channel.unregister(TraceId(2)));
        assert_eq!(drain(&mut channel), 1);
        assert_eq!(*kept.borrow(), vec![1.0]);
        assert!(dropped.borrow().is_empty());
    }

    #[test]
    fn full_mailbox_defers_the_batch() {
        let (started_tx, started_rx) = mpsc::channel();
        let (release_tx, release_rx) = mpsc::channel::<()>();
        let worker = move |id: TraceId, point: &TracePoint| {
            let _ = started_tx.send(());
            let _ = release_rx.recv();
            echo(id, point)
        };
        let mut channel = TraceChannel::spawn(worker, 1).unwrap();
        let seen = recorder(&mut channel, TraceId(7));

        channel.queue_update(TraceId(7), point(1.0));
        assert_eq!(channel.flush().unwrap(), Flush::Sent(1));
        // the worker holds the first batch, so the mailbox is empty again
        started_rx.recv_timeout(WAIT).unwrap();

        channel.queue_update(TraceId(7), point(2.0));
        assert_eq!(channel.flush().unwrap(), Flush::Sent(1));
        channel.queue_update(TraceId(7), point(3.0));
        assert_eq!(channel.flush().unwrap(), Flush::Deferred(1));
        assert_eq!(channel.pending_len(), 1);
        assert_eq!(channel.in_flight(), 2);

        for _ in 0..3 {
            release_tx.send(()).unwrap();
        }
        assert_eq!(drain(&mut channel), 2);
        assert_eq!(channel.flush().unwrap(), Flush::Sent(1));
        assert_eq!(drain(&mut channel), 1);
        assert_eq!(*seen.borrow(), vec![1.0, 2.0, 3.0]);
    }
}
