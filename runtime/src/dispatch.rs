//! Envelope-per-call-site inline caches.
//!
//! A call site owns one `Enveloppe` holding an MRU list of cache nodes. The
//! generated fast path compares the receiver's class against a lock-free
//! head snapshot; misses fall into the resolver, which walks the list under
//! the envelope lock, MRU-moves hits, and resolves true misses through the
//! class model. Readers always load the head snapshot first, so they never
//! observe a partially linked node.

use crate::error::VmError;
use crate::keys::{ClassId, CodeHandle, EnvelopeId, MethodId};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

/// `(observed class, code, box flag)`. The box flag marks value-class
/// receivers that are passed unboxed to the target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheNode {
    pub class: ClassId,
    pub code: CodeHandle,
    pub boxed: bool,
}

impl CacheNode {
    /// Entry word handed back to the call site: code in the low 32 bits,
    /// box flag at bit 32.
    pub fn entry_word(&self) -> u64 {
        u64::from(self.code.raw()) | (u64::from(self.boxed) << 32)
    }
}

pub struct Enveloppe {
    /// The original unresolved method this call site was compiled against.
    pub original: MethodId,
    /// Packed `(class << 33) | (boxed << 32) | code` snapshot of the head
    /// node; 0 while the cache is empty.
    head: AtomicU64,
    nodes: Mutex<Vec<CacheNode>>,
}

const HEAD_CLASS_SHIFT: u32 = 33;

impl Enveloppe {
    pub fn new(original: MethodId) -> Self {
        Self {
            original,
            head: AtomicU64::new(0),
            nodes: Mutex::new(Vec::new()),
        }
    }

    pub fn head_class_word(&self) -> u64 {
        self.head.load(Ordering::Acquire) >> HEAD_CLASS_SHIFT
    }

    pub fn head_entry_word(&self) -> u64 {
        self.head.load(Ordering::Acquire) & ((1 << HEAD_CLASS_SHIFT) - 1)
    }

    /// Lock-free fast path: the head node's code, when the receiver class
    /// matches.
    pub fn fast_path(&self, class: ClassId) -> Option<CacheNode> {
        let word = self.head.load(Ordering::Acquire);
        if word == 0 || (word >> HEAD_CLASS_SHIFT) as u32 != class.raw() {
            return None;
        }
        Some(CacheNode {
            class,
            code: CodeHandle::from_raw((word & 0xFFFF_FFFF) as u32)?,
            boxed: word & (1 << 32) != 0,
        })
    }

    fn publish_head(&self, node: &CacheNode) {
        let word = (u64::from(node.class.raw()) << HEAD_CLASS_SHIFT) | node.entry_word();
        self.head.store(word, Ordering::Release);
    }

    /// The miss path: walk under the lock, MRU-move a hit, or resolve the
    /// receiver's implementation and link a new head node.
    pub fn lookup_or_insert(
        &self,
        class: ClassId,
        resolve: impl FnOnce(MethodId) -> Result<(CodeHandle, bool), VmError>,
    ) -> Result<CacheNode, VmError> {
        let mut nodes = self.nodes.lock().unwrap();
        if let Some(position) = nodes.iter().position(|n| n.class == class) {
            let node = nodes.remove(position);
            nodes.insert(0, node);
            self.publish_head(&node);
            return Ok(node);
        }
        let (code, boxed) = resolve(self.original)?;
        let node = CacheNode { class, code, boxed };
        nodes.insert(0, node);
        self.publish_head(&node);
        Ok(node)
    }

    /// Every receiver class this site has observed, head first.
    pub fn observed_classes(&self) -> Vec<ClassId> {
        self.nodes.lock().unwrap().iter().map(|n| n.class).collect()
    }
}

/// Envelope arena; call sites embed the id as a constant. Nodes outlive the
/// first call-site use and are freed with the compiler module that owns the
/// arena.
#[derive(Default)]
pub struct EnvelopeArena {
    envelopes: RwLock<Vec<Arc<Enveloppe>>>,
}

impl EnvelopeArena {
    pub fn allocate(&self, original: MethodId) -> EnvelopeId {
        let mut envelopes = self.envelopes.write().unwrap();
        envelopes.push(Arc::new(Enveloppe::new(original)));
        EnvelopeId::from_usize(envelopes.len())
    }

    pub fn get(&self, id: EnvelopeId) -> Arc<Enveloppe> {
        self.envelopes.read().unwrap()[id.to_index()].clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn class(raw: u32) -> ClassId {
        ClassId::from_raw(raw).unwrap()
    }

    fn handle(raw: u32) -> CodeHandle {
        CodeHandle::from_raw(raw).unwrap()
    }

    #[test]
    fn fast_path_misses_until_first_resolution() {
        let env = Enveloppe::new(MethodId::from_usize(1));
        assert_eq!(env.fast_path(class(3)), None);
        let node = env
            .lookup_or_insert(class(3), |_| Ok((handle(7), false)))
            .unwrap();
        assert_eq!(env.fast_path(class(3)), Some(node));
        assert_eq!(env.fast_path(class(4)), None);
    }

    #[test]
    fn hits_move_to_the_head() {
        let env = Enveloppe::new(MethodId::from_usize(1));
        env.lookup_or_insert(class(1), |_| Ok((handle(11), false)))
            .unwrap();
        env.lookup_or_insert(class(2), |_| Ok((handle(12), false)))
            .unwrap();
        assert_eq!(env.observed_classes(), vec![class(2), class(1)]);

        // A hit on the older class must MRU-move it without re-resolving.
        env.lookup_or_insert(class(1), |_| panic!("cached entry resolved again"))
            .unwrap();
        assert_eq!(env.observed_classes(), vec![class(1), class(2)]);
        assert_eq!(env.fast_path(class(1)).unwrap().code, handle(11));
    }

    #[test]
    fn every_observed_class_stays_in_the_envelope() {
        let env = Enveloppe::new(MethodId::from_usize(1));
        for raw in 1..=20u32 {
            env.lookup_or_insert(class(raw), |_| Ok((handle(raw + 100), false)))
                .unwrap();
        }
        let observed = env.observed_classes();
        for raw in 1..=20u32 {
            assert!(observed.contains(&class(raw)));
        }
    }

    #[test]
    fn box_flag_travels_in_the_entry_word() {
        let env = Enveloppe::new(MethodId::from_usize(1));
        let node = env
            .lookup_or_insert(class(5), |_| Ok((handle(9), true)))
            .unwrap();
        assert_eq!(node.entry_word() & 0xFFFF_FFFF, 9);
        assert_ne!(node.entry_word() & (1 << 32), 0);
        assert_eq!(env.head_class_word(), 5);
    }
}
