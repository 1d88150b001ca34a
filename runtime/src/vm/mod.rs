//! The virtual machine: explicit context carrying every shared structure
//! (registry, heap, code, caches, threads, isolates) along the call chain.

use crate::backend::Backend;
use crate::compiler::jit::JitCompiler;
use crate::dispatch::EnvelopeArena;
use crate::engine::Engine;
use crate::error::{GuestException, VmError};
use crate::heap::{GcRef, Heap};
use crate::ir::MemShape;
use crate::isolate::IsolateTable;
use crate::keys::{ClassId, LoaderId, MethodKey, Symbol};
use crate::lock::LockTable;
use crate::lower::SignatureLowerer;
use crate::rt::ClassState;
use crate::rt::registry::{BOOT_LOADER, ClassProvider, ClassRegistry, StaticStore};
use crate::support::InitTable;
use crate::thread::{ThreadRegistry, VmThread, WorldGate};
use crate::vm::bootstrap::{BootstrapProvider, BootstrapRegistry, ChainedProvider};
use crate::{debug_log, throw_exception};
use dashmap::DashMap;
use lasso::ThreadedRodeo;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

pub mod bootstrap;

/// Operand, local, argument and field values.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Value {
    Int(i32),
    Long(i64),
    Float(f32),
    Double(f64),
    /// `Ref(0)` is null.
    Ref(GcRef),
}

impl Value {
    pub const NULL: Value = Value::Ref(0);

    pub fn as_int(&self) -> Result<i32, VmError> {
        match self {
            Value::Int(v) => Ok(*v),
            _ => Err(VmError::ResolutionState("expected an int value")),
        }
    }

    pub fn as_long(&self) -> Result<i64, VmError> {
        match self {
            Value::Long(v) => Ok(*v),
            _ => Err(VmError::ResolutionState("expected a long value")),
        }
    }

    pub fn as_float(&self) -> Result<f32, VmError> {
        match self {
            Value::Float(v) => Ok(*v),
            _ => Err(VmError::ResolutionState("expected a float value")),
        }
    }

    pub fn as_double(&self) -> Result<f64, VmError> {
        match self {
            Value::Double(v) => Ok(*v),
            _ => Err(VmError::ResolutionState("expected a double value")),
        }
    }

    pub fn as_ref(&self) -> Result<GcRef, VmError> {
        match self {
            Value::Ref(v) => Ok(*v),
            _ => Err(VmError::ResolutionState("expected a reference value")),
        }
    }

    /// Raw machine word for the untyped slots (code handles, tokens).
    pub fn as_word(&self) -> Result<u64, VmError> {
        match self {
            Value::Long(v) => Ok(*v as u64),
            Value::Int(v) => Ok(*v as u32 as u64),
            Value::Ref(v) => Ok(*v as u64),
            _ => Err(VmError::ResolutionState("expected a word value")),
        }
    }
}

#[derive(Debug, Clone)]
pub struct VmConfig {
    pub main_class: String,
    /// Where the embedder's reader finds the bootstrap classes; the core
    /// only carries it through.
    pub boot_class_path: Option<String>,
    pub heap_size_mb: usize,
    pub max_stack_depth: usize,
    /// Envelope inline caches at interface call sites instead of the IMT
    /// protocol.
    pub use_inline_caches: bool,
    /// Null/bounds checks in generated code; off only for trusted input.
    pub emit_checks: bool,
}

impl Default for VmConfig {
    fn default() -> Self {
        Self {
            main_class: String::new(),
            boot_class_path: None,
            heap_size_mb: 64,
            max_stack_depth: 200,
            use_inline_caches: false,
            emit_checks: true,
        }
    }
}

/// Unresolved cross-compilation reference; stub tokens index this table.
#[derive(Debug, Clone, Copy)]
pub struct PendingRef {
    pub loader: LoaderId,
    pub class: Symbol,
    pub key: MethodKey,
}

/// Token bit marking a pending-ref index rather than a method id.
pub const PENDING_TOKEN_BIT: u64 = 1 << 63;

#[derive(Debug, Clone)]
pub struct TraceLine {
    pub class: Symbol,
    pub method: Symbol,
    pub line: Option<u16>,
}

pub struct VirtualMachine {
    pub config: VmConfig,
    interner: Arc<ThreadedRodeo>,
    pub br: Arc<BootstrapRegistry>,
    registry: RwLock<ClassRegistry>,
    heap: RwLock<Heap>,
    pub engine: Engine,
    pub jit: JitCompiler,
    pub lowerer: SignatureLowerer,
    pub envelopes: EnvelopeArena,
    pub threads: ThreadRegistry,
    pub gate: WorldGate,
    pub locks: LockTable,
    pub isolates: IsolateTable,
    pub init: InitTable,
    pending_refs: RwLock<Vec<PendingRef>>,
    strings: DashMap<Symbol, GcRef>,
    exception_traces: DashMap<GcRef, Vec<TraceLine>>,
}

struct HeapStaticStore<'a> {
    heap: &'a RwLock<Heap>,
}

impl StaticStore for HeapStaticStore<'_> {
    fn allocate_static(&self, class: ClassId, size: usize) -> Result<GcRef, VmError> {
        self.heap.write().unwrap().alloc_instance(class, size)
    }
}

impl VirtualMachine {
    pub fn new(
        config: VmConfig,
        app_provider: Option<Box<dyn ClassProvider>>,
    ) -> Result<Arc<Self>, VmError> {
        let interner = Arc::new(ThreadedRodeo::default());
        let br = Arc::new(BootstrapRegistry::new(&interner));
        let provider: Box<dyn ClassProvider> = match app_provider {
            Some(app) => Box::new(ChainedProvider {
                first: Box::new(BootstrapProvider),
                second: app,
            }),
            None => Box::new(BootstrapProvider),
        };
        let registry = ClassRegistry::new(interner.clone(), br.clone(), provider);
        let heap = Heap::new(config.heap_size_mb)?;
        let vm = Arc::new(Self {
            config,
            interner,
            br,
            registry: RwLock::new(registry),
            heap: RwLock::new(heap),
            engine: Engine::default(),
            jit: JitCompiler::default(),
            lowerer: SignatureLowerer::default(),
            envelopes: EnvelopeArena::default(),
            threads: ThreadRegistry::default(),
            gate: WorldGate::default(),
            locks: LockTable::default(),
            isolates: IsolateTable::default(),
            init: InitTable::default(),
            pending_refs: RwLock::new(Vec::new()),
            strings: DashMap::new(),
            exception_traces: DashMap::new(),
        });
        vm.preload_core_classes()?;
        Ok(vm)
    }

    fn preload_core_classes(&self) -> Result<(), VmError> {
        debug_log!("preloading core classes");
        for sym in [
            self.br.java_lang_object_sym,
            self.br.java_lang_string_sym,
            self.br.java_lang_throwable_sym,
        ] {
            self.resolve_class(BOOT_LOADER, sym)?;
        }
        Ok(())
    }

    pub fn interner(&self) -> &ThreadedRodeo {
        &self.interner
    }

    pub fn registry_read(&self) -> RwLockReadGuard<'_, ClassRegistry> {
        self.registry.read().unwrap()
    }

    pub fn registry_write(&self) -> RwLockWriteGuard<'_, ClassRegistry> {
        self.registry.write().unwrap()
    }

    pub fn heap_read(&self) -> RwLockReadGuard<'_, Heap> {
        self.heap.read().unwrap()
    }

    pub fn heap_write(&self) -> RwLockWriteGuard<'_, Heap> {
        self.heap.write().unwrap()
    }

    /// Load + resolve under the loader lock; never initialises.
    pub fn resolve_class(&self, loader: LoaderId, name: Symbol) -> Result<ClassId, VmError> {
        let mut registry = self.registry_write();
        let class_id = registry.get_or_load(loader, name)?;
        let statics = HeapStaticStore { heap: &self.heap };
        registry.resolve(class_id, self.engine.code_table(), &statics)?;
        Ok(class_id)
    }

    pub fn resolve_class_by_name(&self, loader: LoaderId, name: &str) -> Result<ClassId, VmError> {
        let sym = self.interner.get_or_intern(name);
        self.resolve_class(loader, sym)
    }

    /// Drives an already-loaded class to `Resolved`.
    pub fn resolve_existing(&self, class_id: ClassId) -> Result<(), VmError> {
        let mut registry = self.registry_write();
        let statics = HeapStaticStore { heap: &self.heap };
        registry.resolve(class_id, self.engine.code_table(), &statics)
    }

    pub fn add_pending_ref(&self, pending: PendingRef) -> u64 {
        let mut refs = self.pending_refs.write().unwrap();
        refs.push(pending);
        (refs.len() as u64 - 1) | PENDING_TOKEN_BIT
    }

    pub fn pending_ref(&self, token: u64) -> Result<PendingRef, VmError> {
        self.pending_refs
            .read()
            .unwrap()
            .get((token & !PENDING_TOKEN_BIT) as usize)
            .copied()
            .ok_or(VmError::ResolutionState("pending reference token out of range"))
    }

    /// Interned guest string for a symbol; `intern(intern(s)) == intern(s)`.
    pub fn intern_string(&self, sym: Symbol) -> Result<GcRef, VmError> {
        if let Some(existing) = self.strings.get(&sym) {
            return Ok(*existing);
        }
        let string_class = self.resolve_class(BOOT_LOADER, self.br.java_lang_string_sym)?;
        let bytes_sym = self.interner.get_or_intern("[B");
        let byte_array_class = {
            let mut registry = self.registry_write();
            registry.get_or_load(BOOT_LOADER, bytes_sym)?
        };

        let text = self.interner.resolve(&sym).to_string();
        let (string_size, value_offset) = {
            let registry = self.registry_read();
            let class = registry.get_class(string_class).as_instance()?;
            let field = class
                .instance_field(&self.br.string_value_fk)
                .ok_or(VmError::ResolutionState("String.value missing"))?;
            (class.instance_size()?, field.offset)
        };

        let mut heap = self.heap_write();
        let array = heap.alloc_array(byte_array_class, MemShape::I8, text.len())?;
        for (index, byte) in text.bytes().enumerate() {
            let (offset, shape) = heap.array_elem_offset(array, index)?;
            heap.write(array, offset, shape, Value::Int(i32::from(byte as i8)))?;
        }
        let string = heap.alloc_instance(string_class, string_size)?;
        heap.write(string, value_offset, MemShape::Ref, Value::Ref(array))?;
        drop(heap);

        let entry = *self.strings.entry(sym).or_insert(string);
        Ok(entry)
    }

    /// Turns a guest exception carried as a Rust value into a heap object,
    /// recording the stack trace for later attribution.
    pub fn materialise_exception(
        &self,
        thread: &VmThread,
        exception: GuestException,
    ) -> Result<GcRef, VmError> {
        let class_sym = self.interner.get_or_intern(exception.kind.class_name());
        let class_id = self.resolve_class(BOOT_LOADER, class_sym)?;

        let (size, message_offset) = {
            let registry = self.registry_read();
            let class = registry.get_class(class_id).as_instance()?;
            let field = registry
                .lookup_field(class_id, self.br.detail_message_fk, false)
                .ok()
                .map(|(_, f)| f.offset);
            (class.instance_size()?, field)
        };

        let message_ref = match exception.message {
            Some(message) => {
                let text = message.into_resolved(&self.interner);
                let text_sym = self.interner.get_or_intern(&text);
                Some(self.intern_string(text_sym)?)
            }
            None => None,
        };

        let obj = {
            let mut heap = self.heap_write();
            let obj = heap.alloc_instance(class_id, size)?;
            if let (Some(offset), Some(message)) = (message_offset, message_ref) {
                heap.write(obj, offset, MemShape::Ref, Value::Ref(message))?;
            }
            obj
        };

        self.exception_traces
            .insert(obj, self.capture_trace(thread));
        Ok(obj)
    }

    fn capture_trace(&self, thread: &VmThread) -> Vec<TraceLine> {
        let registry = self.registry_read();
        thread
            .walk_stack()
            .iter()
            .rev()
            .filter_map(|frame| {
                let method_id = frame.method?;
                let method = registry.get_method(method_id);
                let class_sym = registry.get_class(method.class_id()).name();
                let bc = frame.bc.load(std::sync::atomic::Ordering::Acquire);
                let line = self.engine.line_for(frame.function, bc);
                Some(TraceLine {
                    class: class_sym,
                    method: method.name,
                    line,
                })
            })
            .collect()
    }

    pub fn trace_of(&self, exception: GcRef) -> Option<Vec<TraceLine>> {
        self.exception_traces.get(&exception).map(|t| t.clone())
    }

    pub fn pretty_trace(&self, exception: GcRef) -> String {
        let registry = self.registry_read();
        let class_name = self
            .heap_read()
            .class_of(exception)
            .map(|cid| {
                self.interner
                    .resolve(&registry.get_class(cid).name())
                    .replace('/', ".")
            })
            .unwrap_or_else(|_| "<unknown>".to_string());
        let mut out = format!("Exception in thread \"main\" {class_name}");
        if let Some(trace) = self.trace_of(exception) {
            for line in trace {
                let class = self.interner.resolve(&line.class).replace('/', ".");
                let method = self.interner.resolve(&line.method);
                match line.line {
                    Some(number) => {
                        out.push_str(&format!("\n\tat {class}.{method}(line {number})"));
                    }
                    None => out.push_str(&format!("\n\tat {class}.{method}")),
                }
            }
        }
        out
    }

    /// Loads, resolves and initialises the main class, then runs
    /// `main([Ljava/lang/String;)V`. Returns the process exit code.
    pub fn run_main(self: &Arc<Self>, args: &[String]) -> Result<i32, VmError> {
        let thread = self.threads.attach();
        let main_sym = self.interner.get_or_intern(&self.config.main_class);
        let class_id = self
            .resolve_class(BOOT_LOADER, main_sym)
            .map_err(|_| VmError::MainClassNotFound(self.config.main_class.clone()))?;

        crate::support::initialise_class(self, &thread, class_id)?;

        let key = MethodKey {
            name: self.br.main_sym,
            desc: self.br.main_desc_sym,
        };
        let method_id = {
            let registry = self.registry_read();
            registry
                .lookup_method(class_id, key, true, true)?
                .expect("lookup with throw=true returns Some")
        };

        let args_array = self.build_string_array(args)?;
        match self
            .engine
            .call_method(self, &thread, method_id, &[Value::Ref(args_array)])
        {
            Ok(_) => Ok(0),
            Err(VmError::Thrown(exception)) => {
                eprintln!("{}", self.pretty_trace(exception));
                Ok(1)
            }
            Err(VmError::Exception(exception)) => {
                let obj = self.materialise_exception(&thread, exception)?;
                eprintln!("{}", self.pretty_trace(obj));
                Ok(1)
            }
            Err(other) => Err(other),
        }
    }

    fn build_string_array(&self, args: &[String]) -> Result<GcRef, VmError> {
        let array_class_sym = self.interner.get_or_intern("[Ljava/lang/String;");
        let array_class = {
            let mut registry = self.registry_write();
            registry.get_or_load(BOOT_LOADER, array_class_sym)?
        };
        let strings: Vec<GcRef> = args
            .iter()
            .map(|arg| {
                let sym = self.interner.get_or_intern(arg);
                self.intern_string(sym)
            })
            .collect::<Result<_, _>>()?;
        let mut heap = self.heap_write();
        let array = heap.alloc_array(array_class, MemShape::Ref, strings.len())?;
        for (index, string) in strings.iter().enumerate() {
            let (offset, shape) = heap.array_elem_offset(array, index)?;
            heap.write(array, offset, shape, Value::Ref(*string))?;
        }
        Ok(array)
    }

    /// The state a class is currently in, for tests and diagnostics.
    pub fn class_state(&self, class_id: ClassId) -> Option<ClassState> {
        self.registry_read()
            .get_class(class_id)
            .base()
            .map(|b| b.state())
    }

    pub fn class_of_value(&self, value: &Value) -> Result<ClassId, VmError> {
        match value {
            Value::Ref(0) => throw_exception!(NullPointerException),
            Value::Ref(obj) => self.heap_read().class_of(*obj),
            _ => Err(VmError::ResolutionState("not a reference value")),
        }
    }
}

/// Entry point used by the launcher.
pub fn start(
    config: VmConfig,
    provider: Option<Box<dyn ClassProvider>>,
    args: &[String],
) -> Result<i32, VmError> {
    let vm = VirtualMachine::new(config, provider)?;
    vm.run_main(args)
}
