// ABOUTME: Task handles, cancellation signals, and nursery scopes

use crate::object::{MapObj, Object, RuntimeErr};
use crossbeam_channel::{bounded, Receiver, Select, Sender};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Build the conventional `{type: "cancelled", reason: …}` runtime error.
pub fn cancelled_error(reason: &str, cause: Option<Arc<RuntimeErr>>) -> Arc<RuntimeErr> {
    let mut payload = MapObj::new();
    let _ = payload.insert(
        Object::Str("type".to_string()),
        Object::Str("cancelled".to_string()),
    );
    let _ = payload.insert(
        Object::Str("reason".to_string()),
        Object::Str(reason.to_string()),
    );
    RuntimeErr::with_cause(Object::Map(payload), Vec::new(), cause)
}

/// Build the `{type: "timeout", handle: …, ms: …}` runtime error raised when
/// an awaited task outlives its deadline.
pub fn timeout_error(handle: u64, ms: i64) -> Arc<RuntimeErr> {
    let mut payload = MapObj::new();
    let _ = payload.insert(
        Object::Str("type".to_string()),
        Object::Str("timeout".to_string()),
    );
    let _ = payload.insert(
        Object::Str("handle".to_string()),
        Object::Number(crate::number::Number::from_i64(handle as i64)),
    );
    let _ = payload.insert(
        Object::Str("ms".to_string()),
        Object::Number(crate::number::Number::from_i64(ms)),
    );
    RuntimeErr::new(Object::Map(payload), Vec::new())
}

/// Shared state of a spawned task. `Done` is a zero-capacity channel whose
/// sender is dropped exactly once, on completion or cancellation; blocked
/// operations select against the receiver.
#[derive(Debug)]
pub struct TaskState {
    pub id: u64,
    done_rx: Receiver<()>,
    done_tx: Mutex<Option<Sender<()>>>,
    result: Mutex<Option<Object>>,
    cancelled: AtomicBool,
    observed: AtomicBool,
}

impl TaskState {
    pub fn new(id: u64) -> Arc<Self> {
        let (done_tx, done_rx) = bounded(0);
        Arc::new(TaskState {
            id,
            done_rx,
            done_tx: Mutex::new(Some(done_tx)),
            result: Mutex::new(None),
            cancelled: AtomicBool::new(false),
            observed: AtomicBool::new(false),
        })
    }

    pub fn done(&self) -> &Receiver<()> {
        &self.done_rx
    }

    pub fn is_done(&self) -> bool {
        self.done_tx.lock().is_none()
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    pub fn mark_observed(&self) {
        self.observed.store(true, Ordering::SeqCst);
    }

    pub fn is_observed(&self) -> bool {
        self.observed.load(Ordering::SeqCst)
    }

    /// Idempotent. Records the cancellation error as the task's result
    /// (unless it already finished) and closes `Done`.
    pub fn cancel(&self, cause: Option<Arc<RuntimeErr>>, reason: &str) {
        if self.cancelled.swap(true, Ordering::SeqCst) {
            return;
        }
        {
            let mut slot = self.result.lock();
            if slot.is_none() {
                *slot = Some(Object::Failure(cancelled_error(reason, cause)));
            }
        }
        self.done_tx.lock().take();
    }

    /// Record the task's result and close `Done`. A cancellation that
    /// arrived first wins; the completion value is discarded.
    pub fn finish(&self, result: Object) {
        {
            let mut slot = self.result.lock();
            if slot.is_none() {
                *slot = Some(result);
            }
        }
        self.done_tx.lock().take();
    }

    pub fn take_result(&self) -> Object {
        self.result.lock().clone().unwrap_or(Object::Nil)
    }

    /// The cancellation error for operations blocked inside this task.
    pub fn cancellation(&self) -> Object {
        match self.result.lock().clone() {
            Some(obj @ Object::Failure(_)) => obj,
            _ => Object::Failure(cancelled_error("cancelled", None)),
        }
    }
}

/// A structured-concurrency scope: a bounded limiter plus the set of child
/// tasks spawned inside it.
#[derive(Debug)]
pub struct Nursery {
    limit_tx: Sender<()>,
    limit_rx: Receiver<()>,
    children: Mutex<Vec<Arc<TaskState>>>,
}

impl Nursery {
    pub fn new(limit: usize) -> Arc<Self> {
        let (limit_tx, limit_rx) = bounded(limit.max(1));
        Arc::new(Nursery {
            limit_tx,
            limit_rx,
            children: Mutex::new(Vec::new()),
        })
    }

    /// Acquire a limiter slot, blocking while the nursery is at capacity.
    /// Returns false if the acquiring task was cancelled while waiting.
    pub fn acquire_slot(&self, done: &Receiver<()>) -> bool {
        let mut sel = Select::new();
        let op_send = sel.send(&self.limit_tx);
        let op_done = sel.recv(done);
        let oper = sel.select();
        if oper.index() == op_send {
            let _ = oper.send(&self.limit_tx, ());
            true
        } else {
            debug_assert_eq!(oper.index(), op_done);
            let _ = oper.recv(done);
            false
        }
    }

    pub fn release_slot(&self) {
        let _ = self.limit_rx.try_recv();
    }

    pub fn register(&self, child: Arc<TaskState>) {
        self.children.lock().push(child);
    }

    /// Drop an awaited child so its result is not double-propagated at join.
    pub fn remove(&self, child: &Arc<TaskState>) {
        self.children
            .lock()
            .retain(|c| !Arc::ptr_eq(c, child));
    }

    pub fn children(&self) -> Vec<Arc<TaskState>> {
        self.children.lock().clone()
    }

    pub fn cancel_children(&self, cause: Option<Arc<RuntimeErr>>, reason: &str) {
        for child in self.children() {
            child.cancel(cause.clone(), reason);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::number::Number;

    #[test]
    fn test_cancel_is_idempotent_and_closes_done() {
        let task = TaskState::new(1);
        assert!(!task.is_done());
        task.cancel(None, "test");
        task.cancel(None, "again");
        assert!(task.is_done());
        assert!(task.is_cancelled());
        // Done is closed: recv returns immediately
        assert!(task.done().recv().is_err());
        match task.take_result() {
            Object::Failure(err) => assert_eq!(err.error_type().as_deref(), Some("cancelled")),
            other => panic!("expected failure, got {:?}", other),
        }
    }

    #[test]
    fn test_finish_does_not_override_cancellation() {
        let task = TaskState::new(2);
        task.cancel(None, "first");
        task.finish(Object::Number(Number::from_i64(42)));
        match task.take_result() {
            Object::Failure(err) => assert_eq!(err.error_type().as_deref(), Some("cancelled")),
            other => panic!("expected cancellation, got {:?}", other),
        }
    }

    #[test]
    fn test_finish_records_result() {
        let task = TaskState::new(3);
        task.finish(Object::Number(Number::from_i64(7)));
        assert!(task.is_done());
        assert!(task
            .take_result()
            .object_eq(&Object::Number(Number::from_i64(7))));
    }

    #[test]
    fn test_nursery_limiter_blocks_at_capacity() {
        let nursery = Nursery::new(1);
        let idle = crossbeam_channel::never();
        assert!(nursery.acquire_slot(&idle));
        // second acquisition blocks until a slot frees; run it on a thread
        let n2 = nursery.clone();
        let handle = std::thread::spawn(move || n2.acquire_slot(&crossbeam_channel::never()));
        std::thread::sleep(std::time::Duration::from_millis(20));
        assert!(!handle.is_finished());
        nursery.release_slot();
        assert!(handle.join().unwrap());
    }

    #[test]
    fn test_nursery_register_and_remove() {
        let nursery = Nursery::new(4);
        let a = TaskState::new(10);
        let b = TaskState::new(11);
        nursery.register(a.clone());
        nursery.register(b.clone());
        assert_eq!(nursery.children().len(), 2);
        nursery.remove(&a);
        let rest = nursery.children();
        assert_eq!(rest.len(), 1);
        assert!(Arc::ptr_eq(&rest[0], &b));
    }

    #[test]
    fn test_timeout_error_payload() {
        let err = timeout_error(99, 50);
        assert_eq!(err.error_type().as_deref(), Some("timeout"));
    }
}
