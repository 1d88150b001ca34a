//! Virtual tables and interface-method tables.
//!
//! The VT is a plain record the runtime indexes into: fixed leading slots
//! (tracing hooks, class back-pointer, the Cohen display, the secondary-type
//! table, the IMT) followed by method slots. Method slots hold `CodeHandle`
//! words and are the only part written after resolution — a single atomic
//! store when the JIT installs newly compiled code.

use crate::keys::{ClassId, CodeHandle, MethodId};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

/// Cohen display length; subtype tests against classes deeper than this fall
/// back to the secondary-type scan.
pub const DISPLAY_LEN: usize = 8;

/// IMT slot count, power of two.
pub const IMT_SIZE: usize = 32;

const SPECIALISED_TRACERS: usize = 3;

/// Deterministic slot hash over an interface method's name and descriptor.
pub fn imt_hash(name: &str, desc: &str) -> usize {
    let mut h: u32 = 0x811c_9dc5;
    for b in name.bytes().chain(desc.bytes()) {
        h ^= u32::from(b);
        h = h.wrapping_mul(0x0100_0193);
    }
    (((h >> 5) ^ h) as usize) & (IMT_SIZE - 1)
}

/// Collision-chain pair: the interface method a call site compares against
/// and the implementing method's code word. Chains are immutable after
/// resolution apart from the atomic code words.
#[derive(Debug)]
pub struct ImtPair {
    pub interface_method: MethodId,
    pub code: AtomicU32,
}

/// Fixed-size interface dispatch table. A slot word is `0` (empty),
/// `code << 1` (single target, tag bit clear), or `(chain_index << 1) | 1`
/// (tag bit set, chain of pairs).
#[derive(Debug)]
pub struct Imt {
    slots: [AtomicU64; IMT_SIZE],
    chains: Vec<Vec<ImtPair>>,
}

pub const IMT_TAG_BIT: u64 = 1;

impl Imt {
    pub fn build(entries: &[(MethodId, CodeHandle, usize)]) -> Self {
        let mut buckets: Vec<Vec<(MethodId, CodeHandle)>> = (0..IMT_SIZE).map(|_| Vec::new()).collect();
        for (interface_method, code, slot) in entries {
            buckets[*slot].push((*interface_method, *code));
        }

        let slots: [AtomicU64; IMT_SIZE] = std::array::from_fn(|_| AtomicU64::new(0));
        let mut chains = Vec::new();
        for (slot_index, bucket) in buckets.into_iter().enumerate() {
            let word = match bucket.len() {
                0 => 0,
                1 => u64::from(bucket[0].1.raw()) << 1,
                _ => {
                    let chain_index = chains.len() as u64;
                    chains.push(
                        bucket
                            .into_iter()
                            .map(|(interface_method, code)| ImtPair {
                                interface_method,
                                code: AtomicU32::new(code.raw()),
                            })
                            .collect(),
                    );
                    (chain_index << 1) | IMT_TAG_BIT
                }
            };
            slots[slot_index].store(word, Ordering::Release);
        }
        Self { slots, chains }
    }

    pub fn slot_word(&self, index: usize) -> u64 {
        self.slots[index].load(Ordering::Acquire)
    }

    pub fn chain(&self, slot_word: u64) -> Option<&[ImtPair]> {
        if slot_word & IMT_TAG_BIT == 0 {
            return None;
        }
        self.chains
            .get((slot_word >> 1) as usize)
            .map(Vec::as_slice)
    }

    /// Follows the tag-bit protocol on a slot word for a given interface
    /// method. `None` means the slot cannot serve the method.
    pub fn lookup(&self, index: usize, interface_method: MethodId) -> Option<CodeHandle> {
        let word = self.slot_word(index);
        if word == 0 {
            return None;
        }
        if word & IMT_TAG_BIT == 0 {
            return CodeHandle::from_raw((word >> 1) as u32);
        }
        self.chain(word)?
            .iter()
            .find(|pair| pair.interface_method == interface_method)
            .and_then(|pair| CodeHandle::from_raw(pair.code.load(Ordering::Acquire)))
    }

    /// Re-points every occurrence of an implementing method's code word after
    /// the JIT installs new code.
    pub fn patch_chains(&self, old: CodeHandle, new: CodeHandle) {
        for chain in &self.chains {
            for pair in chain {
                let _ = pair.code.compare_exchange(
                    old.raw(),
                    new.raw(),
                    Ordering::AcqRel,
                    Ordering::Relaxed,
                );
            }
        }
        for slot in &self.slots {
            let word = slot.load(Ordering::Acquire);
            if word != 0 && word & IMT_TAG_BIT == 0 && (word >> 1) as u32 == old.raw() {
                let _ = slot.compare_exchange(
                    word,
                    u64::from(new.raw()) << 1,
                    Ordering::AcqRel,
                    Ordering::Relaxed,
                );
            }
        }
    }
}

/// Per-class virtual table.
#[derive(Debug)]
pub struct VirtualTable {
    pub destructor: Option<CodeHandle>,
    pub operator_delete: Option<CodeHandle>,
    pub tracer: Option<CodeHandle>,
    pub specialised_tracers: [Option<CodeHandle>; SPECIALISED_TRACERS],
    /// Back-pointer to the owning class.
    pub class: ClassId,
    /// Depth in the superclass chain; the root class has depth 0.
    pub depth: u16,
    /// This class's own index in `display` when `depth < DISPLAY_LEN`.
    pub display_offset: u16,
    /// Last secondary type that answered a probe positively.
    pub cache: AtomicU64,
    pub display: [Option<ClassId>; DISPLAY_LEN],
    /// Interfaces and any ancestors beyond the display bound, scanned
    /// linearly by the slow subtype path.
    pub secondary_types: Vec<ClassId>,
    /// Element-class VT for array classes.
    pub base_class_vt: Option<ClassId>,
    pub imt: Option<Imt>,
    methods: Vec<AtomicU32>,
    method_ids: Vec<MethodId>,
}

impl VirtualTable {
    pub fn new(class: ClassId, parent: Option<&VirtualTable>) -> Self {
        let (depth, mut display) = match parent {
            Some(parent_vt) => (parent_vt.depth + 1, parent_vt.display),
            None => (0, [None; DISPLAY_LEN]),
        };
        let display_offset = depth.min(DISPLAY_LEN as u16 - 1);
        if (depth as usize) < DISPLAY_LEN {
            display[depth as usize] = Some(class);
        }
        let (methods, method_ids) = match parent {
            Some(parent_vt) => (
                parent_vt
                    .methods
                    .iter()
                    .map(|w| AtomicU32::new(w.load(Ordering::Acquire)))
                    .collect(),
                parent_vt.method_ids.clone(),
            ),
            None => (Vec::new(), Vec::new()),
        };
        Self {
            destructor: None,
            operator_delete: None,
            tracer: None,
            specialised_tracers: [None; SPECIALISED_TRACERS],
            class,
            depth,
            display_offset,
            cache: AtomicU64::new(0),
            display,
            secondary_types: Vec::new(),
            base_class_vt: None,
            imt: None,
            methods,
            method_ids,
        }
    }

    pub fn method_count(&self) -> usize {
        self.method_ids.len()
    }

    pub fn method_at(&self, offset: u16) -> MethodId {
        self.method_ids[offset as usize]
    }

    pub fn code_at(&self, offset: u16) -> Option<CodeHandle> {
        CodeHandle::from_raw(self.methods[offset as usize].load(Ordering::Acquire))
    }

    /// Appends a fresh slot, returning its offset.
    pub fn push_slot(&mut self, method: MethodId, code: CodeHandle) -> u16 {
        let offset = self.method_ids.len() as u16;
        self.method_ids.push(method);
        self.methods.push(AtomicU32::new(code.raw()));
        offset
    }

    /// Replaces an inherited slot with an overriding method.
    pub fn override_slot(&mut self, offset: u16, method: MethodId, code: CodeHandle) {
        self.method_ids[offset as usize] = method;
        self.methods[offset as usize].store(code.raw(), Ordering::Release);
    }

    /// The JIT's single-word slot patch.
    pub fn patch_code(&self, offset: u16, code: CodeHandle) {
        self.methods[offset as usize].store(code.raw(), Ordering::Release);
    }

    /// O(1) display probe; valid only when `target_depth < DISPLAY_LEN`.
    pub fn display_hit(&self, target: ClassId, target_depth: u16) -> bool {
        debug_assert!((target_depth as usize) < DISPLAY_LEN);
        self.display[target_depth as usize] == Some(target)
    }

    /// Linear secondary-type scan with a one-entry cache.
    pub fn secondary_hit(&self, target: ClassId) -> bool {
        if self.cache.load(Ordering::Relaxed) == u64::from(target.raw()) {
            return true;
        }
        if self.secondary_types.contains(&target) {
            self.cache.store(u64::from(target.raw()), Ordering::Relaxed);
            return true;
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handle(raw: u32) -> CodeHandle {
        CodeHandle::from_raw(raw).unwrap()
    }

    #[test]
    fn imt_hash_is_deterministic_and_bounded() {
        let a = imt_hash("f", "()I");
        assert_eq!(a, imt_hash("f", "()I"));
        assert!(a < IMT_SIZE);
        for (name, desc) in [("get", "()I"), ("run", "()V"), ("apply", "(II)I")] {
            assert!(imt_hash(name, desc) < IMT_SIZE);
        }
    }

    #[test]
    fn imt_single_entry_is_untagged() {
        let method = MethodId::from_usize(1);
        let imt = Imt::build(&[(method, handle(9), 4)]);
        let word = imt.slot_word(4);
        assert_eq!(word & IMT_TAG_BIT, 0);
        assert_eq!(imt.lookup(4, method), Some(handle(9)));
        assert_eq!(imt.slot_word(5), 0);
    }

    #[test]
    fn imt_collisions_build_a_chain_holding_every_method() {
        let m1 = MethodId::from_usize(1);
        let m2 = MethodId::from_usize(2);
        let m3 = MethodId::from_usize(3);
        let imt = Imt::build(&[(m1, handle(11), 7), (m2, handle(12), 7), (m3, handle(13), 7)]);
        let word = imt.slot_word(7);
        assert_eq!(word & IMT_TAG_BIT, 1);
        let chain = imt.chain(word).unwrap();
        assert_eq!(chain.len(), 3);
        assert_eq!(imt.lookup(7, m1), Some(handle(11)));
        assert_eq!(imt.lookup(7, m2), Some(handle(12)));
        assert_eq!(imt.lookup(7, m3), Some(handle(13)));
        assert_eq!(imt.lookup(7, MethodId::from_usize(4)), None);
    }

    #[test]
    fn imt_patching_re_points_both_slot_forms() {
        let m1 = MethodId::from_usize(1);
        let m2 = MethodId::from_usize(2);
        let direct = Imt::build(&[(m1, handle(5), 0)]);
        direct.patch_chains(handle(5), handle(6));
        assert_eq!(direct.lookup(0, m1), Some(handle(6)));

        let chained = Imt::build(&[(m1, handle(5), 0), (m2, handle(7), 0)]);
        chained.patch_chains(handle(5), handle(6));
        assert_eq!(chained.lookup(0, m1), Some(handle(6)));
        assert_eq!(chained.lookup(0, m2), Some(handle(7)));
    }

    #[test]
    fn display_extends_parent_chain() {
        let root_class = ClassId::from_usize(1);
        let child_class = ClassId::from_usize(2);
        let root = VirtualTable::new(root_class, None);
        assert_eq!(root.depth, 0);
        assert_eq!(root.display[0], Some(root_class));

        let child = VirtualTable::new(child_class, Some(&root));
        assert_eq!(child.depth, 1);
        assert_eq!(child.display[0], Some(root_class));
        assert_eq!(child.display[1], Some(child_class));
        assert!(child.display_hit(root_class, 0));
        assert!(child.display_hit(child_class, 1));
        assert!(!root.display_hit(child_class, 1));
    }

    #[test]
    fn vt_slot_patch_is_visible() {
        let vt_class = ClassId::from_usize(1);
        let mut vt = VirtualTable::new(vt_class, None);
        let m = MethodId::from_usize(1);
        let offset = vt.push_slot(m, handle(3));
        assert_eq!(vt.code_at(offset), Some(handle(3)));
        vt.patch_code(offset, handle(8));
        assert_eq!(vt.code_at(offset), Some(handle(8)));
        assert_eq!(vt.method_at(offset), m);
    }
}
