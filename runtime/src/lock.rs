//! Lock-word synchronisation: a compare-and-swap thin lock in the object
//! header that promotes to a fat lock (mutex + condition variable) on
//! contention or recursion overflow.
//!
//! Word layout, LP64: the MSB marks a fat lock; a thin word carries the
//! owner thread id above bit 20 and the recursion count in bits [12, 20).
//! The low 12 bits are reserved (4 hash + 8 GC) and preserved by every
//! transition.

use crate::error::VmError;
use crate::keys::ThreadId;
use crate::{build_exception, throw_exception};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Condvar, Mutex, RwLock};

pub const FAT_MASK: u64 = 1 << 63;
pub const THIN_COUNT_MASK: u64 = 0xFF000;
pub const THIN_COUNT_SHIFT: u32 = 12;
pub const THIN_COUNT_ADD: u64 = 0x1000;
pub const NON_LOCK_BITS_MASK: u64 = 0xFFF;
pub const HASH_MASK: u64 = 0xF00;
pub const GC_BITS_MASK: u64 = 0xFF;
const OWNER_SHIFT: u32 = 20;
const OWNER_MASK: u64 = !(FAT_MASK | THIN_COUNT_MASK | NON_LOCK_BITS_MASK);

const _: () = {
    assert!(FAT_MASK & (OWNER_MASK | THIN_COUNT_MASK | NON_LOCK_BITS_MASK) == 0);
    assert!(OWNER_MASK & (THIN_COUNT_MASK | NON_LOCK_BITS_MASK) == 0);
    assert!(HASH_MASK | GC_BITS_MASK == NON_LOCK_BITS_MASK);
};

fn owner_bits(thread: ThreadId) -> u64 {
    u64::from(thread.raw()) << OWNER_SHIFT
}

fn owner_of(word: u64) -> Option<ThreadId> {
    ThreadId::from_raw(((word & OWNER_MASK) >> OWNER_SHIFT) as u32)
}

struct FatState {
    owner: Option<ThreadId>,
    count: u32,
}

pub struct FatLock {
    state: Mutex<FatState>,
    available: Condvar,
}

impl FatLock {
    fn new(owner: Option<ThreadId>, count: u32) -> Self {
        Self {
            state: Mutex::new(FatState { owner, count }),
            available: Condvar::new(),
        }
    }

    fn acquire(&self, thread: ThreadId) {
        let mut state = self.state.lock().unwrap();
        loop {
            match state.owner {
                None => {
                    state.owner = Some(thread);
                    state.count = 1;
                    return;
                }
                Some(owner) if owner == thread => {
                    state.count += 1;
                    return;
                }
                Some(_) => {
                    state = self.available.wait(state).unwrap();
                }
            }
        }
    }

    fn release(&self, thread: ThreadId) -> Result<(), VmError> {
        let mut state = self.state.lock().unwrap();
        if state.owner != Some(thread) {
            throw_exception!(InternalError, "monitor exit by a non-owning thread");
        }
        state.count -= 1;
        if state.count == 0 {
            state.owner = None;
            self.available.notify_one();
        }
        Ok(())
    }
}

/// Process-wide fat-lock arena; a fat word is `FAT_MASK | (id << 12)` with
/// the reserved low bits carried over.
#[derive(Default)]
pub struct LockTable {
    locks: RwLock<Vec<std::sync::Arc<FatLock>>>,
}

impl LockTable {
    fn install(&self, owner: Option<ThreadId>, count: u32) -> (u64, std::sync::Arc<FatLock>) {
        let mut locks = self.locks.write().unwrap();
        let lock = std::sync::Arc::new(FatLock::new(owner, count));
        locks.push(lock.clone());
        ((locks.len() as u64) << THIN_COUNT_SHIFT, lock)
    }

    fn get(&self, word: u64) -> Result<std::sync::Arc<FatLock>, VmError> {
        let id = ((word & !FAT_MASK & !NON_LOCK_BITS_MASK) >> THIN_COUNT_SHIFT) as usize;
        self.locks
            .read()
            .unwrap()
            .get(id.wrapping_sub(1))
            .cloned()
            .ok_or_else(|| build_exception!(InternalError, "fat lock id out of range"))
    }

    /// Acquire: thin CAS fast path, recursion bump, fat promotion on
    /// contention or count overflow.
    pub fn monitor_enter(&self, word: &AtomicU64, thread: ThreadId) -> Result<(), VmError> {
        loop {
            let current = word.load(Ordering::SeqCst);
            if current & FAT_MASK != 0 {
                self.get(current)?.acquire(thread);
                return Ok(());
            }
            let reserved = current & NON_LOCK_BITS_MASK;
            if current & !NON_LOCK_BITS_MASK == 0 {
                // Unlocked: claim it.
                let desired = owner_bits(thread) | reserved;
                if word
                    .compare_exchange(current, desired, Ordering::SeqCst, Ordering::SeqCst)
                    .is_ok()
                {
                    return Ok(());
                }
                continue;
            }
            if owner_of(current) == Some(thread) {
                if current & THIN_COUNT_MASK == THIN_COUNT_MASK {
                    // Recursion counter saturated: promote, keeping the count.
                    let recursion = ((current & THIN_COUNT_MASK) >> THIN_COUNT_SHIFT) as u32 + 2;
                    let (id_bits, _) = self.install(Some(thread), recursion);
                    let desired = FAT_MASK | id_bits | reserved;
                    if word
                        .compare_exchange(current, desired, Ordering::SeqCst, Ordering::SeqCst)
                        .is_ok()
                    {
                        return Ok(());
                    }
                    continue;
                }
                let desired = current + THIN_COUNT_ADD;
                if word
                    .compare_exchange(current, desired, Ordering::SeqCst, Ordering::SeqCst)
                    .is_ok()
                {
                    return Ok(());
                }
                continue;
            }
            // Contended: promote on behalf of the current holder, then queue.
            let holder = owner_of(current);
            let recursion = ((current & THIN_COUNT_MASK) >> THIN_COUNT_SHIFT) as u32 + 1;
            let (id_bits, lock) = self.install(holder, recursion);
            let desired = FAT_MASK | id_bits | reserved;
            if word
                .compare_exchange(current, desired, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                lock.acquire(thread);
                return Ok(());
            }
        }
    }

    pub fn monitor_exit(&self, word: &AtomicU64, thread: ThreadId) -> Result<(), VmError> {
        let current = word.load(Ordering::SeqCst);
        if current & FAT_MASK != 0 {
            return self.get(current)?.release(thread);
        }
        if owner_of(current) != Some(thread) {
            throw_exception!(InternalError, "monitor exit by a non-owning thread");
        }
        let desired = if current & THIN_COUNT_MASK != 0 {
            current - THIN_COUNT_ADD
        } else {
            current & NON_LOCK_BITS_MASK
        };
        word.store(desired, Ordering::SeqCst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn thread(raw: u32) -> ThreadId {
        ThreadId::from_raw(raw).unwrap()
    }

    #[test]
    fn thin_acquire_release_restores_word() {
        let table = LockTable::default();
        let word = AtomicU64::new(0x5A0); // pre-set hash and GC bits
        let before = word.load(Ordering::SeqCst);
        table.monitor_enter(&word, thread(1)).unwrap();
        assert_eq!(owner_of(word.load(Ordering::SeqCst)), Some(thread(1)));
        table.monitor_exit(&word, thread(1)).unwrap();
        assert_eq!(word.load(Ordering::SeqCst), before);
    }

    #[test]
    fn recursion_counts_in_the_thin_word() {
        let table = LockTable::default();
        let word = AtomicU64::new(0);
        let t = thread(2);
        table.monitor_enter(&word, t).unwrap();
        table.monitor_enter(&word, t).unwrap();
        table.monitor_enter(&word, t).unwrap();
        assert_eq!(
            (word.load(Ordering::SeqCst) & THIN_COUNT_MASK) >> THIN_COUNT_SHIFT,
            2
        );
        table.monitor_exit(&word, t).unwrap();
        table.monitor_exit(&word, t).unwrap();
        table.monitor_exit(&word, t).unwrap();
        assert_eq!(word.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn exit_without_ownership_is_an_error() {
        let table = LockTable::default();
        let word = AtomicU64::new(0);
        table.monitor_enter(&word, thread(1)).unwrap();
        assert!(table.monitor_exit(&word, thread(2)).is_err());
        table.monitor_exit(&word, thread(1)).unwrap();
    }

    #[test]
    fn contention_promotes_to_fat_and_blocks() {
        use std::sync::Arc;
        use std::sync::atomic::AtomicBool;

        let table = Arc::new(LockTable::default());
        let word = Arc::new(AtomicU64::new(0));
        table.monitor_enter(&word, thread(1)).unwrap();

        let reached = Arc::new(AtomicBool::new(false));
        let handle = {
            let table = table.clone();
            let word = word.clone();
            let reached = reached.clone();
            std::thread::spawn(move || {
                table.monitor_enter(&word, thread(2)).unwrap();
                reached.store(true, Ordering::SeqCst);
                table.monitor_exit(&word, thread(2)).unwrap();
            })
        };

        // Wait until the contender has promoted the word.
        while word.load(Ordering::SeqCst) & FAT_MASK == 0 {
            std::thread::yield_now();
        }
        assert!(!reached.load(Ordering::SeqCst));
        table.monitor_exit(&word, thread(1)).unwrap();
        handle.join().unwrap();
        assert!(reached.load(Ordering::SeqCst));
    }

    #[test]
    fn reserved_bits_survive_promotion() {
        let table = LockTable::default();
        let word = AtomicU64::new(0x321);
        table.monitor_enter(&word, thread(1)).unwrap();
        // Saturate the recursion counter to force promotion.
        for _ in 0..260 {
            table.monitor_enter(&word, thread(1)).unwrap();
        }
        assert_ne!(word.load(Ordering::SeqCst) & FAT_MASK, 0);
        assert_eq!(word.load(Ordering::SeqCst) & NON_LOCK_BITS_MASK, 0x321);
        for _ in 0..261 {
            table.monitor_exit(&word, thread(1)).unwrap();
        }
    }
}
