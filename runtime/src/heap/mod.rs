//! The mutator's view of the heap: a bump allocator over an mmapped segment,
//! two-word object headers, and the traversal hooks the collector and the
//! isolate reference-reset need. The collector proper lives elsewhere; only
//! its mutator interface is realised here.

use crate::error::VmError;
use crate::ir::MemShape;
use crate::keys::ClassId;
use crate::vm::Value;
use crate::{build_exception, debug_log};
use std::collections::HashMap;

/// Heap reference: byte offset into the segment. 0 is null.
pub type GcRef = usize;

pub const VT_WORD_OFFSET: usize = 0;
pub const LOCK_WORD_OFFSET: usize = 8;
/// Two words: VT pointer and lock word.
pub const OBJECT_HEADER_SIZE: usize = 16;
pub const ARRAY_LENGTH_OFFSET: usize = OBJECT_HEADER_SIZE;
pub const ARRAY_ELEMENTS_OFFSET: usize = OBJECT_HEADER_SIZE + 8;

#[derive(Debug, Clone, Copy)]
struct Allocation {
    class: ClassId,
    size: usize,
    array_elem: Option<MemShape>,
}

pub struct Heap {
    memory: *mut u8,
    capacity: usize,
    allocated: usize,
    /// Per-object metadata for precise traversal; the side table a real
    /// collector would derive from its block structure.
    objects: HashMap<GcRef, Allocation>,
    /// Canonical instances for zero-slot classes.
    singletons: HashMap<ClassId, GcRef>,
    finalization_candidates: Vec<GcRef>,
}

// The raw segment pointer never leaves this struct; all access is bounds
// checked against the side table.
unsafe impl Send for Heap {}
unsafe impl Sync for Heap {}

impl Heap {
    pub fn new(size_mb: usize) -> Result<Self, VmError> {
        let capacity = size_mb * 1024 * 1024;
        let memory = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                capacity,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANON,
                -1,
                0,
            )
        };
        if memory == libc::MAP_FAILED {
            return Err(build_exception!(OutOfMemoryError, "mmap failed"));
        }
        debug_log!("heap segment of {capacity} bytes mapped");
        Ok(Heap {
            memory: memory as *mut u8,
            capacity,
            // Offset 0 stays unused so that 0 can be null.
            allocated: OBJECT_HEADER_SIZE,
            objects: HashMap::new(),
            singletons: HashMap::new(),
            finalization_candidates: Vec::new(),
        })
    }

    fn bump(&mut self, total: usize) -> Result<GcRef, VmError> {
        let aligned = (total + 7) & !7;
        if self.allocated + aligned > self.capacity {
            return Err(build_exception!(OutOfMemoryError));
        }
        let offset = self.allocated;
        self.allocated += aligned;
        unsafe {
            std::ptr::write_bytes(self.memory.add(offset), 0, aligned);
        }
        Ok(offset)
    }

    fn store_word(&mut self, at: usize, word: u64) {
        unsafe {
            std::ptr::write_unaligned(self.memory.add(at) as *mut u64, word);
        }
    }

    fn load_word(&self, at: usize) -> u64 {
        unsafe { std::ptr::read_unaligned(self.memory.add(at) as *const u64) }
    }

    /// Allocates an instance; `size` includes the header.
    pub fn alloc_instance(&mut self, class: ClassId, size: usize) -> Result<GcRef, VmError> {
        let size = size.max(OBJECT_HEADER_SIZE);
        let obj = self.bump(size)?;
        self.store_word(obj + VT_WORD_OFFSET, u64::from(class.raw()));
        self.objects.insert(
            obj,
            Allocation {
                class,
                size,
                array_elem: None,
            },
        );
        Ok(obj)
    }

    /// Canonical singleton for zero-slot classes.
    pub fn singleton_instance(&mut self, class: ClassId) -> Result<GcRef, VmError> {
        if let Some(obj) = self.singletons.get(&class) {
            return Ok(*obj);
        }
        let obj = self.alloc_instance(class, OBJECT_HEADER_SIZE)?;
        self.singletons.insert(class, obj);
        Ok(obj)
    }

    pub fn alloc_array(
        &mut self,
        class: ClassId,
        elem: MemShape,
        length: usize,
    ) -> Result<GcRef, VmError> {
        let total = ARRAY_ELEMENTS_OFFSET + elem.byte_size() * length;
        let obj = self.bump(total)?;
        self.store_word(obj + VT_WORD_OFFSET, u64::from(class.raw()));
        self.store_word(obj + ARRAY_LENGTH_OFFSET, length as u64);
        self.objects.insert(
            obj,
            Allocation {
                class,
                size: total,
                array_elem: Some(elem),
            },
        );
        Ok(obj)
    }

    pub fn class_of(&self, obj: GcRef) -> Result<ClassId, VmError> {
        self.allocation(obj).map(|a| a.class)
    }

    fn allocation(&self, obj: GcRef) -> Result<Allocation, VmError> {
        self.objects
            .get(&obj)
            .copied()
            .ok_or_else(|| build_exception!(InternalError, format!("dangling reference {obj:#x}")))
    }

    pub fn is_live(&self, obj: GcRef) -> bool {
        self.objects.contains_key(&obj)
    }

    pub fn is_array(&self, obj: GcRef) -> Result<bool, VmError> {
        Ok(self.allocation(obj)?.array_elem.is_some())
    }

    /// Unchecked length load; the translator emits the null check around it.
    pub fn array_length(&self, obj: GcRef) -> Result<i32, VmError> {
        self.allocation(obj)?;
        Ok(self.load_word(obj + ARRAY_LENGTH_OFFSET) as i32)
    }

    fn check_range(&self, obj: GcRef, offset: usize, len: usize) -> Result<(), VmError> {
        let alloc = self.allocation(obj)?;
        if offset + len > alloc.size {
            return Err(build_exception!(
                InternalError,
                format!("access at {offset}+{len} past object of {} bytes", alloc.size)
            ));
        }
        Ok(())
    }

    pub fn read(&self, obj: GcRef, offset: usize, shape: MemShape) -> Result<Value, VmError> {
        self.check_range(obj, offset, shape.byte_size())?;
        let at = obj + offset;
        Ok(unsafe {
            match shape {
                MemShape::I8 => {
                    Value::Int(i32::from(std::ptr::read(self.memory.add(at) as *const i8)))
                }
                MemShape::I16 => Value::Int(i32::from(std::ptr::read_unaligned(
                    self.memory.add(at) as *const i16,
                ))),
                MemShape::U16 => Value::Int(i32::from(std::ptr::read_unaligned(
                    self.memory.add(at) as *const u16,
                ))),
                MemShape::I32 => Value::Int(std::ptr::read_unaligned(
                    self.memory.add(at) as *const i32
                )),
                MemShape::I64 => Value::Long(std::ptr::read_unaligned(
                    self.memory.add(at) as *const i64
                )),
                MemShape::F32 => Value::Float(std::ptr::read_unaligned(
                    self.memory.add(at) as *const f32
                )),
                MemShape::F64 => Value::Double(std::ptr::read_unaligned(
                    self.memory.add(at) as *const f64
                )),
                MemShape::Ref => Value::Ref(std::ptr::read_unaligned(
                    self.memory.add(at) as *const u64
                ) as GcRef),
            }
        })
    }

    pub fn write(
        &mut self,
        obj: GcRef,
        offset: usize,
        shape: MemShape,
        value: Value,
    ) -> Result<(), VmError> {
        self.check_range(obj, offset, shape.byte_size())?;
        let at = obj + offset;
        unsafe {
            match shape {
                MemShape::I8 => {
                    std::ptr::write(self.memory.add(at) as *mut i8, value.as_int()? as i8)
                }
                MemShape::I16 => std::ptr::write_unaligned(
                    self.memory.add(at) as *mut i16,
                    value.as_int()? as i16,
                ),
                MemShape::U16 => std::ptr::write_unaligned(
                    self.memory.add(at) as *mut u16,
                    value.as_int()? as u16,
                ),
                MemShape::I32 => {
                    std::ptr::write_unaligned(self.memory.add(at) as *mut i32, value.as_int()?)
                }
                MemShape::I64 => {
                    std::ptr::write_unaligned(self.memory.add(at) as *mut i64, value.as_long()?)
                }
                MemShape::F32 => {
                    std::ptr::write_unaligned(self.memory.add(at) as *mut f32, value.as_float()?)
                }
                MemShape::F64 => {
                    std::ptr::write_unaligned(self.memory.add(at) as *mut f64, value.as_double()?)
                }
                MemShape::Ref => std::ptr::write_unaligned(
                    self.memory.add(at) as *mut u64,
                    value.as_ref()? as u64,
                ),
            }
        }
        Ok(())
    }

    pub fn array_elem_offset(&self, obj: GcRef, index: usize) -> Result<(usize, MemShape), VmError> {
        let alloc = self.allocation(obj)?;
        let elem = alloc.array_elem.ok_or_else(|| {
            build_exception!(InternalError, "element access on a non-array object")
        })?;
        Ok((ARRAY_ELEMENTS_OFFSET + elem.byte_size() * index, elem))
    }

    /// The lock word as an atomic; lock.rs owns the bit protocol.
    pub fn lock_word(&self, obj: GcRef) -> Result<&std::sync::atomic::AtomicU64, VmError> {
        self.check_range(obj, LOCK_WORD_OFFSET, 8)?;
        // The lock word is 8-aligned because every allocation is.
        Ok(unsafe { &*(self.memory.add(obj + LOCK_WORD_OFFSET) as *const std::sync::atomic::AtomicU64) })
    }

    pub fn add_finalization_candidate(&mut self, obj: GcRef) {
        self.finalization_candidates.push(obj);
    }

    pub fn finalization_candidates(&self) -> &[GcRef] {
        &self.finalization_candidates
    }

    /// `(ref, class, is_array)` for every live object.
    pub fn objects(&self) -> Vec<(GcRef, ClassId, bool)> {
        self.objects
            .iter()
            .map(|(obj, alloc)| (*obj, alloc.class, alloc.array_elem.is_some()))
            .collect()
    }

    pub fn allocated_bytes(&self) -> usize {
        self.allocated
    }
}

impl Drop for Heap {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.memory as *mut libc::c_void, self.capacity);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn class(raw: u32) -> ClassId {
        ClassId::from_raw(raw).unwrap()
    }

    #[test]
    fn instance_allocation_round_trips_fields() {
        let mut heap = Heap::new(4).unwrap();
        let obj = heap.alloc_instance(class(3), OBJECT_HEADER_SIZE + 16).unwrap();
        assert_ne!(obj, 0);
        assert_eq!(heap.class_of(obj).unwrap(), class(3));
        heap.write(obj, OBJECT_HEADER_SIZE, MemShape::I32, Value::Int(42))
            .unwrap();
        assert_eq!(
            heap.read(obj, OBJECT_HEADER_SIZE, MemShape::I32).unwrap(),
            Value::Int(42)
        );
        assert!(heap.read(obj, OBJECT_HEADER_SIZE + 16, MemShape::I32).is_err());
    }

    #[test]
    fn array_allocation_has_length_and_elements() {
        let mut heap = Heap::new(4).unwrap();
        let arr = heap.alloc_array(class(1), MemShape::I32, 5).unwrap();
        assert_eq!(heap.array_length(arr).unwrap(), 5);
        let (offset, shape) = heap.array_elem_offset(arr, 2).unwrap();
        heap.write(arr, offset, shape, Value::Int(42)).unwrap();
        assert_eq!(heap.read(arr, offset, shape).unwrap(), Value::Int(42));
        // Fresh elements are zeroed.
        let (offset0, _) = heap.array_elem_offset(arr, 0).unwrap();
        assert_eq!(heap.read(arr, offset0, MemShape::I32).unwrap(), Value::Int(0));
    }

    #[test]
    fn narrow_shapes_widen_like_the_guest_expects() {
        let mut heap = Heap::new(4).unwrap();
        let obj = heap.alloc_instance(class(1), OBJECT_HEADER_SIZE + 8).unwrap();
        heap.write(obj, OBJECT_HEADER_SIZE, MemShape::I8, Value::Int(-1))
            .unwrap();
        assert_eq!(
            heap.read(obj, OBJECT_HEADER_SIZE, MemShape::I8).unwrap(),
            Value::Int(-1)
        );
        heap.write(obj, OBJECT_HEADER_SIZE + 2, MemShape::U16, Value::Int(0xFFFF))
            .unwrap();
        assert_eq!(
            heap.read(obj, OBJECT_HEADER_SIZE + 2, MemShape::U16).unwrap(),
            Value::Int(0xFFFF)
        );
    }

    #[test]
    fn singletons_are_canonical() {
        let mut heap = Heap::new(4).unwrap();
        let a = heap.singleton_instance(class(7)).unwrap();
        let b = heap.singleton_instance(class(7)).unwrap();
        assert_eq!(a, b);
        assert_ne!(heap.singleton_instance(class(8)).unwrap(), a);
    }
}
