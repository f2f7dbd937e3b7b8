// ABOUTME: Bounded, closable channels carrying Slug objects between tasks

use crate::object::Object;
use crossbeam_channel::{bounded, Receiver, Select, Sender};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

/// Outcome of a blocking send.
#[derive(Debug)]
pub enum SendOutcome {
    Sent,
    Closed,
    Cancelled,
}

/// Outcome of a blocking receive.
#[derive(Debug)]
pub enum RecvOutcome {
    Value(Object),
    /// Channel closed and drained; the language sees the `closed` marker.
    Drained,
    Cancelled,
}

/// A bounded multi-producer/multi-consumer FIFO queue. crossbeam channels
/// have no explicit close, so closing is modelled by dropping the sender of
/// a zero-capacity signal channel: a disconnected receiver is permanently
/// "ready", which wakes every blocked `send`, `recv`, and `select`.
#[derive(Debug)]
pub struct Channel {
    pub id: u64,
    pub capacity: usize,
    pub data_tx: Sender<Object>,
    pub data_rx: Receiver<Object>,
    closed: AtomicBool,
    close_tx: Mutex<Option<Sender<()>>>,
    pub close_rx: Receiver<()>,
}

impl Channel {
    pub fn new(id: u64, capacity: usize) -> Self {
        let (data_tx, data_rx) = bounded(capacity);
        let (close_tx, close_rx) = bounded(0);
        Channel {
            id,
            capacity,
            data_tx,
            data_rx,
            closed: AtomicBool::new(false),
            close_tx: Mutex::new(Some(close_tx)),
            close_rx,
        }
    }

    /// Idempotent: closing a closed channel is a no-op.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.close_tx.lock().take();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Blocking send, waking on close or task cancellation.
    pub fn send_blocking(&self, value: Object, done: &Receiver<()>) -> SendOutcome {
        if self.is_closed() {
            return SendOutcome::Closed;
        }
        let mut sel = Select::new();
        let op_send = sel.send(&self.data_tx);
        let op_close = sel.recv(&self.close_rx);
        let op_done = sel.recv(done);
        let oper = sel.select();
        let index = oper.index();
        if index == op_send {
            let _ = oper.send(&self.data_tx, value);
            SendOutcome::Sent
        } else if index == op_close {
            let _ = oper.recv(&self.close_rx);
            SendOutcome::Closed
        } else {
            debug_assert_eq!(index, op_done);
            let _ = oper.recv(done);
            SendOutcome::Cancelled
        }
    }

    /// Blocking receive. A closed channel drains buffered values first, then
    /// reports `Drained`.
    pub fn recv_blocking(&self, done: &Receiver<()>) -> RecvOutcome {
        let mut sel = Select::new();
        let op_data = sel.recv(&self.data_rx);
        let op_close = sel.recv(&self.close_rx);
        let op_done = sel.recv(done);
        let oper = sel.select();
        let index = oper.index();
        if index == op_data {
            match oper.recv(&self.data_rx) {
                Ok(value) => RecvOutcome::Value(value),
                Err(_) => RecvOutcome::Drained,
            }
        } else if index == op_close {
            let _ = oper.recv(&self.close_rx);
            // the close signal may have raced queued data
            match self.data_rx.try_recv() {
                Ok(value) => RecvOutcome::Value(value),
                Err(_) => RecvOutcome::Drained,
            }
        } else {
            debug_assert_eq!(index, op_done);
            let _ = oper.recv(done);
            RecvOutcome::Cancelled
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::number::Number;
    use crossbeam_channel::never;

    fn num(s: &str) -> Object {
        Object::Number(Number::parse(s))
    }

    #[test]
    fn test_send_recv_buffered() {
        let ch = Channel::new(1, 2);
        let idle = never();
        assert!(matches!(
            ch.send_blocking(num("1"), &idle),
            SendOutcome::Sent
        ));
        assert!(matches!(
            ch.send_blocking(num("2"), &idle),
            SendOutcome::Sent
        ));
        match ch.recv_blocking(&idle) {
            RecvOutcome::Value(v) => assert!(v.object_eq(&num("1"))),
            other => panic!("expected value, got {:?}", other),
        }
    }

    #[test]
    fn test_close_is_idempotent() {
        let ch = Channel::new(1, 1);
        ch.close();
        ch.close();
        assert!(ch.is_closed());
    }

    #[test]
    fn test_send_on_closed_fails() {
        let ch = Channel::new(1, 1);
        ch.close();
        assert!(matches!(
            ch.send_blocking(num("1"), &never()),
            SendOutcome::Closed
        ));
    }

    #[test]
    fn test_recv_drains_then_reports_closed() {
        let ch = Channel::new(1, 2);
        let idle = never();
        ch.send_blocking(num("1"), &idle);
        ch.close();
        assert!(matches!(ch.recv_blocking(&idle), RecvOutcome::Value(_)));
        assert!(matches!(ch.recv_blocking(&idle), RecvOutcome::Drained));
        assert!(matches!(ch.recv_blocking(&idle), RecvOutcome::Drained));
    }

    #[test]
    fn test_recv_wakes_on_close_from_other_thread() {
        let ch = std::sync::Arc::new(Channel::new(1, 0));
        let ch2 = ch.clone();
        let handle = std::thread::spawn(move || ch2.recv_blocking(&never()));
        std::thread::sleep(std::time::Duration::from_millis(20));
        ch.close();
        assert!(matches!(handle.join().unwrap(), RecvOutcome::Drained));
    }

    #[test]
    fn test_cancellation_wakes_blocked_recv() {
        let ch = Channel::new(1, 0);
        let (done_tx, done_rx) = bounded::<()>(0);
        drop(done_tx); // simulates a cancelled task: Done is closed
        assert!(matches!(ch.recv_blocking(&done_rx), RecvOutcome::Cancelled));
    }
}
