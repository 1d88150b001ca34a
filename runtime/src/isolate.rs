//! Isolate lifecycle: per-loader isolate ids, the state bitset, and the
//! termination pipeline.
//!
//! Termination proceeds in four phases: freeze under the loader lock, prune
//! exception-handler frames belonging to the dying isolate, scrub stacks so
//! returns into doomed frames raise "interrupted", and patch every doomed
//! method's prolog. Code patching here is the portable form: code words are
//! table indices, so redirecting the entry re-routes every caller at once;
//! the well-known `stop` entry point gets a plain-return redirect so an
//! orderly shutdown can complete.

use crate::backend::{Backend, CodeEntry};
use crate::error::VmError;
use crate::ir::MemShape;
use crate::keys::{ClassId, IsolateId, LoaderId, MethodId};
use crate::rt::ClassEntity;
use crate::rt::registry::ClassProvider;
use crate::ty::TypeDescriptor;
use crate::vm::{Value, VirtualMachine};
use crate::{debug_log, throw_exception};
use once_cell::sync::OnceCell;
use std::sync::atomic::{AtomicU8, Ordering};

pub const NR_ISOLATES: usize = 64;

pub const RUNNING: u8 = 0x1;
pub const RESET_REFERENCES: u8 = 0x2;
pub const DENY_EXECUTION: u8 = 0x4;
pub const FREE: u8 = 0x8;

struct IsolateEntry {
    state: AtomicU8,
    loader: OnceCell<LoaderId>,
}

/// Fixed-size table of `(state, loader)` entries indexed by isolate id.
pub struct IsolateTable {
    entries: [IsolateEntry; NR_ISOLATES],
}

impl Default for IsolateTable {
    fn default() -> Self {
        let entries = std::array::from_fn(|index| IsolateEntry {
            // Isolate 0 is the bootstrap isolate, always running.
            state: AtomicU8::new(if index == 0 { RUNNING } else { FREE }),
            loader: OnceCell::new(),
        });
        Self { entries }
    }
}

impl IsolateTable {
    pub fn state(&self, id: IsolateId) -> u8 {
        self.entries[id.to_index()].state.load(Ordering::Acquire)
    }

    pub fn is_denied(&self, id: IsolateId) -> bool {
        self.state(id) & DENY_EXECUTION != 0
    }

    pub fn loader_of(&self, id: IsolateId) -> Option<LoaderId> {
        self.entries[id.to_index()].loader.get().copied()
    }

    fn mark(&self, id: IsolateId, bits: u8) {
        self.entries[id.to_index()]
            .state
            .fetch_or(bits, Ordering::AcqRel);
    }

    fn claim_free(&self) -> Option<IsolateId> {
        for (index, entry) in self.entries.iter().enumerate() {
            if entry
                .state
                .compare_exchange(FREE, RUNNING, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return Some(IsolateId(index as u32));
            }
        }
        None
    }

    fn bind_loader(&self, id: IsolateId, loader: LoaderId) {
        let _ = self.entries[id.to_index()].loader.set(loader);
    }

    pub fn release(&self, id: IsolateId) {
        self.entries[id.to_index()]
            .state
            .store(FREE, Ordering::Release);
    }
}

/// Creates a fresh isolate with its own class loader.
pub fn start_isolate(
    vm: &VirtualMachine,
    provider: Box<dyn ClassProvider>,
) -> Result<IsolateId, VmError> {
    let Some(id) = vm.isolates.claim_free() else {
        throw_exception!(InternalError, "isolate table exhausted");
    };
    let loader = vm.registry_write().register_loader(provider, id);
    vm.isolates.bind_loader(id, loader);
    debug_log!("started isolate {:?} with loader {:?}", id, loader);
    Ok(id)
}

/// The four-phase termination pipeline.
pub fn deny_execution(vm: &VirtualMachine, id: IsolateId) -> Result<(), VmError> {
    // Phase 1: freeze writes. The loader lock is taken before the state
    // flips, so an in-flight class load either completes first or observes
    // DENY_EXECUTION.
    let loader = {
        let registry = vm.registry_write();
        vm.isolates.mark(id, DENY_EXECUTION);
        vm.threads.request_yield_all();
        let loader = vm.isolates.loader_of(id);
        drop(registry);
        loader
    };
    let Some(loader) = loader else {
        return Ok(());
    };

    // Phases 2 and 3 walk every thread's stack.
    for thread in vm.threads.all() {
        for frame in thread.walk_stack() {
            if frame.isolate == id {
                // Phase 2: this frame's handlers no longer run.
                frame.handlers_removed.store(true, Ordering::Release);
                // Phase 3: returning into this frame raises "interrupted".
                frame.poisoned.store(true, Ordering::Release);
            }
        }
    }

    // Phase 4: patch every doomed method's prolog.
    let class_ids: Vec<ClassId> = {
        let registry = vm.registry_read();
        registry.loader(loader).classes().collect()
    };
    for class_id in class_ids {
        deny_class_execution(vm, class_id)?;
    }
    Ok(())
}

fn deny_class_execution(vm: &VirtualMachine, class_id: ClassId) -> Result<(), VmError> {
    let methods: Vec<MethodId> = {
        let registry = vm.registry_read();
        match registry.get_class(class_id) {
            ClassEntity::Instance(class) => {
                let mut all = class.virtual_methods()?.to_vec();
                all.extend_from_slice(class.static_methods()?);
                if let Some(clinit) = class.base.clinit() {
                    all.push(clinit);
                }
                all
            }
            ClassEntity::Interface(interface) => interface.methods()?.to_vec(),
            _ => return Ok(()),
        }
    };
    for method in methods {
        deny_method_execution(vm, method);
    }
    Ok(())
}

/// Redirects one method: its current code word, every stub pointing at it,
/// and all receiver-specialised copies. Customisation is retired first so
/// the JIT cannot race in a fresh copy.
fn deny_method_execution(vm: &VirtualMachine, method: MethodId) {
    let registry = vm.registry_read();
    let m = registry.get_method(method);
    let redirect = if is_orderly_stop_method(vm, method) {
        CodeEntry::ReturnOnly
    } else {
        CodeEntry::RaiseInterrupted(method)
    };

    m.retire_customization();

    let table = vm.engine.code_table();
    if let Some(code) = m.code() {
        table.redirect(code, redirect);
    }
    for handle in table.handles_for_method(method) {
        table.redirect(handle, redirect);
    }
    for handle in m.specialisations() {
        table.redirect(handle, redirect);
    }
}

/// The orderly-shutdown entry point: public, non-static, one reference
/// argument, void return, named `stop`.
fn is_orderly_stop_method(vm: &VirtualMachine, method: MethodId) -> bool {
    let registry = vm.registry_read();
    let m = registry.get_method(method);
    if m.name != vm.br.stop_sym || m.is_static() || !m.flags().is_public() {
        return false;
    }
    let desc = registry.get_signature(m.signature());
    desc.ret.is_none()
        && desc.params.len() == 1
        && matches!(desc.params[0], TypeDescriptor::Reference(_))
}

/// Flags the isolate for reference reset; the next traversal clears every
/// pointer from surviving objects into its state.
pub fn reset_references(vm: &VirtualMachine, id: IsolateId) {
    vm.isolates.mark(id, RESET_REFERENCES);
}

/// The traversal the collector runs: outgoing pointers from surviving
/// objects into any RESET_REFERENCES isolate are cleared.
pub fn run_reference_reset(vm: &VirtualMachine) -> Result<(), VmError> {
    let dying: Vec<IsolateId> = (0..NR_ISOLATES)
        .map(|index| IsolateId(index as u32))
        .filter(|id| vm.isolates.state(*id) & RESET_REFERENCES != 0)
        .collect();
    if dying.is_empty() {
        return Ok(());
    }

    let objects = vm.heap_read().objects();
    for (obj, class_id, is_array) in objects {
        let owner = vm.registry_read().isolate_of_class(class_id);
        if dying.contains(&owner) {
            continue; // the object itself is dying state
        }
        if is_array {
            let is_ref_array = {
                let registry = vm.registry_read();
                registry
                    .get_class(class_id)
                    .as_array()
                    .map(|a| a.element_class.is_some())
                    .unwrap_or(false)
            };
            if !is_ref_array {
                continue;
            }
            let length = vm.heap_read().array_length(obj)? as usize;
            for index in 0..length {
                let (offset, shape) = vm.heap_read().array_elem_offset(obj, index)?;
                clear_if_dying(vm, &dying, obj, offset, shape)?;
            }
        } else {
            let ref_offsets: Vec<usize> = {
                let registry = vm.registry_read();
                match registry.get_class(class_id) {
                    ClassEntity::Instance(class) => class
                        .instance_fields()?
                        .iter()
                        .filter(|f| {
                            registry
                                .get_field_descriptor(f.descriptor)
                                .is_reference_like()
                        })
                        .map(|f| f.offset)
                        .collect(),
                    _ => Vec::new(),
                }
            };
            for offset in ref_offsets {
                clear_if_dying(vm, &dying, obj, offset, MemShape::Ref)?;
            }
        }
    }
    Ok(())
}

fn clear_if_dying(
    vm: &VirtualMachine,
    dying: &[IsolateId],
    obj: crate::heap::GcRef,
    offset: usize,
    shape: MemShape,
) -> Result<(), VmError> {
    if shape != MemShape::Ref {
        return Ok(());
    }
    let target = vm.heap_read().read(obj, offset, MemShape::Ref)?.as_ref()?;
    if target == 0 {
        return Ok(());
    }
    let target_class = vm.heap_read().class_of(target)?;
    let target_isolate = vm.registry_read().isolate_of_class(target_class);
    if dying.contains(&target_isolate) {
        vm.heap_write().write(obj, offset, MemShape::Ref, Value::NULL)?;
    }
    Ok(())
}
