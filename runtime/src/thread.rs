//! VM thread descriptors: cooperative safepoints, the pending-exception
//! slot compiled code checks, the uncooperative-code boundary, and the frame
//! records stack walking and isolate termination operate on.

use crate::error::VmError;
use crate::heap::GcRef;
use crate::keys::{FunctionId, IsolateId, MethodId, ThreadId};
use crate::throw_exception;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, RwLock};

/// One engine frame as seen from outside the running thread. The redirect
/// flags are shared with the engine so the termination pipeline can poison
/// frames it never executes in.
#[derive(Clone)]
pub struct FrameRecord {
    pub method: Option<MethodId>,
    pub function: FunctionId,
    pub isolate: IsolateId,
    /// Bytecode offset currently executing, kept fresh at call sites for
    /// stack walking and exception-line attribution.
    pub bc: Arc<AtomicU32>,
    /// When set, returning into this frame raises "interrupted" instead of
    /// resuming — the portable form of the patched on-stack return address.
    pub poisoned: Arc<AtomicBool>,
    /// When set, this frame's exception handlers are skipped during
    /// propagation — the pruned exception-table entry.
    pub handlers_removed: Arc<AtomicBool>,
}

pub struct VmThread {
    pub id: ThreadId,
    /// Safepoint poll flag; polls at function entries and loop back-edges
    /// branch on it.
    do_yield: AtomicBool,
    interrupted: AtomicBool,
    pending_exception: AtomicUsize,
    current_isolate: AtomicU32,
    frames: Mutex<Vec<FrameRecord>>,
    /// Frame depth recorded on entry to uncooperative (native) code; zero
    /// when the thread is fully cooperative.
    uncooperative_depth: AtomicUsize,
}

impl VmThread {
    pub fn new(id: ThreadId) -> Self {
        Self {
            id,
            do_yield: AtomicBool::new(false),
            interrupted: AtomicBool::new(false),
            pending_exception: AtomicUsize::new(0),
            current_isolate: AtomicU32::new(IsolateId::BOOT.0),
            frames: Mutex::new(Vec::new()),
            uncooperative_depth: AtomicUsize::new(0),
        }
    }

    pub fn pending_exception(&self) -> GcRef {
        self.pending_exception.load(Ordering::Acquire)
    }

    pub fn set_pending_exception(&self, obj: GcRef) {
        self.pending_exception.store(obj, Ordering::Release);
    }

    /// Reads and clears; the handler-entry protocol.
    pub fn take_pending_exception(&self) -> GcRef {
        self.pending_exception.swap(0, Ordering::AcqRel)
    }

    pub fn request_yield(&self) {
        self.do_yield.store(true, Ordering::Release);
    }

    pub fn clear_yield(&self) {
        self.do_yield.store(false, Ordering::Release);
    }

    pub fn yield_requested(&self) -> bool {
        self.do_yield.load(Ordering::Acquire)
    }

    pub fn interrupt(&self) {
        self.interrupted.store(true, Ordering::Release);
        self.request_yield();
    }

    pub fn current_isolate(&self) -> IsolateId {
        IsolateId(self.current_isolate.load(Ordering::Acquire))
    }

    pub fn set_current_isolate(&self, isolate: IsolateId) {
        self.current_isolate.store(isolate.0, Ordering::Release);
    }

    /// The safepoint body: run when the poll flag is up. Raises the guest
    /// interruption if one is queued, otherwise parks until the world
    /// restarts.
    pub fn safepoint(&self, gate: &WorldGate) -> Result<(), VmError> {
        if !self.yield_requested() {
            return Ok(());
        }
        if self.interrupted.swap(false, Ordering::AcqRel) {
            self.clear_yield();
            throw_exception!(InterruptedException);
        }
        gate.park_if_stopped();
        self.clear_yield();
        Ok(())
    }

    pub fn push_frame(&self, record: FrameRecord) {
        self.frames.lock().unwrap().push(record);
    }

    pub fn pop_frame(&self) {
        self.frames.lock().unwrap().pop();
    }

    pub fn frame_count(&self) -> usize {
        self.frames.lock().unwrap().len()
    }

    /// Snapshot for stack walkers, innermost frame last.
    pub fn walk_stack(&self) -> Vec<FrameRecord> {
        self.frames.lock().unwrap().clone()
    }

    pub fn in_uncooperative_code(&self) -> bool {
        self.uncooperative_depth.load(Ordering::Acquire) != 0
    }
}

/// Scoped entry into code that may block outside the VM's control: saves
/// the frame boundary on construction so the collector can stop at it, and
/// clears it on drop.
pub struct UncooperativeGuard<'a> {
    thread: &'a VmThread,
}

impl<'a> UncooperativeGuard<'a> {
    pub fn enter(thread: &'a VmThread) -> Self {
        let depth = thread.frames.lock().unwrap().len();
        thread
            .uncooperative_depth
            .store(depth.max(1), Ordering::Release);
        Self { thread }
    }
}

impl Drop for UncooperativeGuard<'_> {
    fn drop(&mut self) {
        self.thread.uncooperative_depth.store(0, Ordering::Release);
    }
}

/// Stop-the-world gate threads park on at safepoints.
#[derive(Default)]
pub struct WorldGate {
    stopped: Mutex<bool>,
    resumed: Condvar,
}

impl WorldGate {
    pub fn stop_world(&self) {
        *self.stopped.lock().unwrap() = true;
    }

    pub fn resume_world(&self) {
        *self.stopped.lock().unwrap() = false;
        self.resumed.notify_all();
    }

    pub fn park_if_stopped(&self) {
        let mut stopped = self.stopped.lock().unwrap();
        while *stopped {
            stopped = self.resumed.wait(stopped).unwrap();
        }
    }
}

#[derive(Default)]
pub struct ThreadRegistry {
    threads: RwLock<HashMap<ThreadId, Arc<VmThread>>>,
    next_id: AtomicU32,
}

impl ThreadRegistry {
    pub fn attach(&self) -> Arc<VmThread> {
        let raw = self.next_id.fetch_add(1, Ordering::AcqRel) + 1;
        let id = ThreadId::from_raw(raw).expect("thread ids start at 1");
        let thread = Arc::new(VmThread::new(id));
        self.threads.write().unwrap().insert(id, thread.clone());
        thread
    }

    pub fn detach(&self, id: ThreadId) {
        self.threads.write().unwrap().remove(&id);
    }

    pub fn all(&self) -> Vec<Arc<VmThread>> {
        self.threads.read().unwrap().values().cloned().collect()
    }

    pub fn request_yield_all(&self) {
        for thread in self.all() {
            thread.request_yield();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn safepoint_raises_queued_interruption() {
        let registry = ThreadRegistry::default();
        let thread = registry.attach();
        let gate = WorldGate::default();
        assert!(thread.safepoint(&gate).is_ok());
        thread.interrupt();
        assert!(thread.safepoint(&gate).is_err());
        // The interruption is one-shot.
        assert!(thread.safepoint(&gate).is_ok());
    }

    #[test]
    fn uncooperative_guard_clears_on_drop() {
        let registry = ThreadRegistry::default();
        let thread = registry.attach();
        assert!(!thread.in_uncooperative_code());
        {
            let _guard = UncooperativeGuard::enter(&thread);
            assert!(thread.in_uncooperative_code());
        }
        assert!(!thread.in_uncooperative_code());
    }

    #[test]
    fn pending_exception_is_take_once() {
        let registry = ThreadRegistry::default();
        let thread = registry.attach();
        thread.set_pending_exception(0x40);
        assert_eq!(thread.take_pending_exception(), 0x40);
        assert_eq!(thread.take_pending_exception(), 0);
    }
}
