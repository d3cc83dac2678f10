//! Half-channels: one direction of the duplex connection.
//!
//! Each half-channel owns its own mutex and condition variable, so traffic in
//! one direction never contends with the other. The queue is unbounded:
//! `send` only ever takes the lock long enough to push.

use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};

use crate::error::{BackendError, CodecError};
use crate::value::Value;

/// The peer of a half-channel is gone, or the channel was closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("half-channel disconnected")]
pub struct Disconnected;

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum TryRecvError {
    #[error("half-channel is empty")]
    Empty,
    #[error("half-channel disconnected")]
    Disconnected,
}

struct State<T> {
    queue: VecDeque<T>,
    /// Sending side stopped accepting values; queued ones stay receivable.
    closed: bool,
    /// Receiving side is gone; nothing is receivable any more.
    disconnected: bool,
    senders: usize,
}

impl<T> State<T> {
    fn send_closed(&self) -> bool {
        self.closed || self.disconnected
    }

    fn drained(&self) -> bool {
        self.disconnected || (self.queue.is_empty() && (self.closed || self.senders == 0))
    }
}

struct Shared<T> {
    state: Mutex<State<T>>,
    ready: Condvar,
}

impl<T> Shared<T> {
    // The queue is consistent after every critical section, so a panic while
    // holding the lock leaves nothing to repair.
    fn lock(&self) -> MutexGuard<'_, State<T>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Create a half-channel.
pub fn half_channel<T>() -> (HalfSender<T>, HalfReceiver<T>) {
    let shared = Arc::new(Shared {
        state: Mutex::new(State {
            queue: VecDeque::new(),
            closed: false,
            disconnected: false,
            senders: 1,
        }),
        ready: Condvar::new(),
    });
    (
        HalfSender {
            shared: Arc::clone(&shared),
        },
        HalfReceiver { shared },
    )
}

/// Producing end. Cloneable; the channel closes when the last clone drops.
pub struct HalfSender<T = Value> {
    shared: Arc<Shared<T>>,
}

impl<T> HalfSender<T> {
    /// Enqueue a value. Never blocks beyond the enqueue itself.
    pub fn send(&self, value: T) -> Result<(), Disconnected> {
        let mut state = self.shared.lock();
        if state.send_closed() {
            return Err(Disconnected);
        }
        state.queue.push_back(value);
        drop(state);
        self.shared.ready.notify_one();
        Ok(())
    }

    /// Stop accepting new values. Idempotent.
    pub fn close(&self) {
        let mut state = self.shared.lock();
        if !state.closed {
            state.closed = true;
            drop(state);
            self.shared.ready.notify_all();
        }
    }

    pub fn is_closed(&self) -> bool {
        self.shared.lock().send_closed()
    }
}

impl<T> Clone for HalfSender<T> {
    fn clone(&self) -> Self {
        self.shared.lock().senders += 1;
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T> Drop for HalfSender<T> {
    fn drop(&mut self) {
        let mut state = self.shared.lock();
        state.senders -= 1;
        if state.senders == 0 {
            drop(state);
            self.shared.ready.notify_all();
        }
    }
}

/// Consuming end.
///
/// `recv` may be called from several threads at once: each value is handed
/// to exactly one caller, in enqueue order, but which caller gets which value
/// is unspecified.
pub struct HalfReceiver<T = Value> {
    shared: Arc<Shared<T>>,
}

impl<T> HalfReceiver<T> {
    /// Block until a value is available or the channel reaches a terminal
    /// state with nothing left to drain.
    pub fn recv(&self) -> Result<T, Disconnected> {
        let mut state = self.shared.lock();
        loop {
            if state.disconnected {
                return Err(Disconnected);
            }
            if let Some(value) = state.queue.pop_front() {
                return Ok(value);
            }
            if state.drained() {
                return Err(Disconnected);
            }
            state = self
                .shared
                .ready
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    pub fn try_recv(&self) -> Result<T, TryRecvError> {
        let mut state = self.shared.lock();
        if state.disconnected {
            return Err(TryRecvError::Disconnected);
        }
        match state.queue.pop_front() {
            Some(value) => Ok(value),
            None if state.drained() => Err(TryRecvError::Disconnected),
            None => Err(TryRecvError::Empty),
        }
    }

    /// Tear the channel down from the receiving side.
    ///
    /// Wakes every blocked `recv` with [`Disconnected`], discards queued
    /// values and makes further sends fail.
    pub fn disconnect(&self) {
        let discarded = {
            let mut state = self.shared.lock();
            if state.disconnected {
                return;
            }
            state.disconnected = true;
            std::mem::take(&mut state.queue)
        };
        self.shared.ready.notify_all();
        if !discarded.is_empty() {
            tracing::trace!(discarded = discarded.len(), "Discarding undelivered values");
        }
    }

    /// True once `recv` can only ever fail.
    pub fn is_disconnected(&self) -> bool {
        self.shared.lock().drained()
    }
}

impl<T> Drop for HalfReceiver<T> {
    fn drop(&mut self) {
        self.disconnect();
    }
}

/// Host side of a duplex connection.
pub struct HostPort {
    pub outbound: HalfSender,
    pub inbound: HalfReceiver,
}

/// Worker side of a duplex connection.
pub struct WorkerPort {
    outbound: HalfReceiver,
    inbound: HalfSender,
}

impl WorkerPort {
    /// Next value sent by the host. Fails once the host closed its side and
    /// everything sent before was received.
    pub fn recv(&self) -> Result<Value, Disconnected> {
        self.outbound.recv()
    }

    pub fn try_recv(&self) -> Result<Value, TryRecvError> {
        self.outbound.try_recv()
    }

    /// Deliver a value to the host.
    ///
    /// `Invalid` children are dropped; an `Invalid` value on its own is
    /// rejected and nothing is sent.
    pub fn send(&self, value: Value) -> Result<(), BackendError> {
        let value = value.prune().ok_or(CodecError::InvalidTopLevel)?;
        Ok(self.inbound.send(value)?)
    }

    /// Extra handle on the inbound direction. The host only sees the worker
    /// as gone once every such handle is dropped too.
    pub(crate) fn sender(&self) -> HalfSender {
        self.inbound.clone()
    }
}

/// Create both directions at once.
pub fn duplex() -> (HostPort, WorkerPort) {
    let (outbound_tx, outbound_rx) = half_channel();
    let (inbound_tx, inbound_rx) = half_channel();
    (
        HostPort {
            outbound: outbound_tx,
            inbound: inbound_rx,
        },
        WorkerPort {
            outbound: outbound_rx,
            inbound: inbound_tx,
        },
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn fifo_for_single_sender() {
        let (tx, rx) = half_channel();
        for i in 0..100 {
            tx.send(i).unwrap();
        }
        let received: Vec<i32> = (0..100).map(|_| rx.recv().unwrap()).collect();
        assert_eq!(received, (0..100).collect::<Vec<_>>());
    }

    #[test]
    fn close_drains_then_disconnects() {
        let (tx, rx) = half_channel();
        tx.send(1).unwrap();
        tx.send(2).unwrap();
        tx.close();
        assert_eq!(tx.send(3), Err(Disconnected));
        assert_eq!(rx.recv(), Ok(1));
        assert_eq!(rx.recv(), Ok(2));
        assert_eq!(rx.recv(), Err(Disconnected));
        assert_eq!(rx.try_recv(), Err(TryRecvError::Disconnected));
    }

    #[test]
    fn close_is_idempotent() {
        let (tx, rx) = half_channel::<i32>();
        tx.close();
        tx.close();
        assert!(tx.is_closed());
        assert!(rx.is_disconnected());
    }

    #[test]
    fn dropping_last_sender_disconnects() {
        let (tx, rx) = half_channel();
        let tx2 = tx.clone();
        drop(tx);
        tx2.send("still open").unwrap();
        drop(tx2);
        assert_eq!(rx.recv(), Ok("still open"));
        assert_eq!(rx.recv(), Err(Disconnected));
    }

    #[test]
    fn dropping_receiver_fails_sends() {
        let (tx, rx) = half_channel();
        drop(rx);
        assert_eq!(tx.send(1), Err(Disconnected));
        assert!(tx.is_closed());
    }

    #[test]
    fn try_recv_reports_empty() {
        let (tx, rx) = half_channel::<u8>();
        assert_eq!(rx.try_recv(), Err(TryRecvError::Empty));
        tx.send(7).unwrap();
        assert_eq!(rx.try_recv(), Ok(7));
    }

    #[test]
    fn disconnect_unblocks_waiting_receivers() {
        let (_tx, rx) = half_channel::<u8>();
        let rx = Arc::new(rx);
        let waiters: Vec<_> = (0..3)
            .map(|_| {
                let rx = Arc::clone(&rx);
                thread::spawn(move || rx.recv())
            })
            .collect();
        thread::sleep(Duration::from_millis(50));
        rx.disconnect();
        for waiter in waiters {
            assert_eq!(waiter.join().unwrap(), Err(Disconnected));
        }
    }

    #[test]
    fn blocked_recv_wakes_on_send() {
        let (tx, rx) = half_channel();
        let handle = thread::spawn(move || rx.recv());
        thread::sleep(Duration::from_millis(20));
        tx.send(42).unwrap();
        assert_eq!(handle.join().unwrap(), Ok(42));
    }

    #[test]
    fn concurrent_receivers_get_each_value_once() {
        let (tx, rx) = half_channel();
        let rx = Arc::new(rx);
        for i in 0..1000 {
            tx.send(i).unwrap();
        }
        tx.close();
        let readers: Vec<_> = (0..4)
            .map(|_| {
                let rx = Arc::clone(&rx);
                thread::spawn(move || {
                    let mut got = Vec::new();
                    while let Ok(v) = rx.recv() {
                        got.push(v);
                    }
                    got
                })
            })
            .collect();
        let mut all: Vec<i32> = Vec::new();
        for reader in readers {
            let got = reader.join().unwrap();
            assert!(got.windows(2).all(|w| w[0] < w[1]), "per-reader order follows enqueue order");
            all.extend(got);
        }
        all.sort_unstable();
        assert_eq!(all, (0..1000).collect::<Vec<_>>());
    }

    #[test]
    fn concurrent_senders_keep_per_sender_order() {
        let (tx, rx) = half_channel();
        let senders: Vec<_> = (0..4)
            .map(|id| {
                let tx = tx.clone();
                thread::spawn(move || {
                    for seq in 0..250 {
                        tx.send((id, seq)).unwrap();
                    }
                })
            })
            .collect();
        drop(tx);
        for sender in senders {
            sender.join().unwrap();
        }
        let mut last = [-1; 4];
        while let Ok((id, seq)) = rx.recv() {
            assert!(seq > last[id], "sender {id} reordered");
            last[id] = seq;
        }
        assert_eq!(last, [249; 4]);
    }

    #[test]
    fn directions_are_independent() {
        let (HostPort { outbound, inbound }, worker) = duplex();
        // A host thread blocked on inbound must not hold up outbound sends.
        let reader = thread::spawn(move || inbound.recv());
        thread::sleep(Duration::from_millis(20));
        outbound.send(Value::Bool(true)).unwrap();
        assert_eq!(worker.recv(), Ok(Value::Bool(true)));
        worker.send(Value::Int64(1)).unwrap();
        assert_eq!(reader.join().unwrap(), Ok(Value::Int64(1)));
    }

    #[test]
    fn worker_values_are_pruned() {
        let (host, worker) = duplex();
        let err = worker.send(Value::Invalid).unwrap_err();
        assert!(matches!(err, BackendError::Codec(CodecError::InvalidTopLevel)));
        assert_eq!(host.inbound.try_recv(), Err(TryRecvError::Empty));

        worker
            .send(Value::dict([("keep", Value::Nil), ("drop", Value::Invalid)]))
            .unwrap();
        assert_eq!(host.inbound.recv(), Ok(Value::dict([("keep", Value::Nil)])));
    }

    #[test]
    fn extra_sender_keeps_host_connected() {
        let (host, worker) = duplex();
        let sender = worker.sender();
        drop(worker);
        assert_eq!(host.inbound.try_recv(), Err(TryRecvError::Empty));
        drop(sender);
        assert_eq!(host.inbound.recv(), Err(Disconnected));
    }
}
