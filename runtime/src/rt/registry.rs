//! Process-wide class registry: arenas for classes, methods and descriptors,
//! plus the per-loader name maps. Loaders create entries lazily; resolution
//! drives the lifecycle through `Loaded → Resolving → Resolved` and builds
//! layouts, VTs and IMTs. Callers serialise mutation through the registry
//! lock the VM wraps around this struct (the "loader lock").

use crate::backend::{CodeAllocator, StubKind};
use crate::bytecode::{ClassDefinition, ClassFlags};
use crate::error::VmError;
use crate::heap::{GcRef, OBJECT_HEADER_SIZE};
use crate::keys::{
    ClassId, FieldDescriptorId, FieldKey, IsolateId, LoaderId, MethodId, MethodKey, SignatureId,
    Symbol,
};
use crate::rt::class::InstanceClass;
use crate::rt::field::Field;
use crate::rt::interface::InterfaceClass;
use crate::rt::method::Method;
use crate::rt::vtable::{DISPLAY_LEN, Imt, VirtualTable, imt_hash};
use crate::rt::{ArrayClass, BaseClass, ClassEntity, ClassState, PrimitiveClass};
use crate::ty::{MethodDescriptor, PrimitiveKind, TypeDescriptor, WORD_SIZE};
use crate::vm::bootstrap::BootstrapRegistry;
use crate::{build_exception, debug_log, throw_exception};
use lasso::ThreadedRodeo;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

/// Hands out class definitions by name; the reader behind it is external.
pub trait ClassProvider: Send + Sync {
    fn find_class(
        &self,
        name: Symbol,
        interner: &ThreadedRodeo,
    ) -> Result<ClassDefinition, VmError>;
}

/// Allocates backing storage for static instances.
pub trait StaticStore {
    fn allocate_static(&self, class: ClassId, size: usize) -> Result<GcRef, VmError>;
}

pub struct ClassLoader {
    pub isolate: IsolateId,
    provider: Box<dyn ClassProvider>,
    by_name: HashMap<Symbol, ClassId>,
}

impl ClassLoader {
    pub fn lookup(&self, name: Symbol) -> Option<ClassId> {
        self.by_name.get(&name).copied()
    }

    pub fn classes(&self) -> impl Iterator<Item = ClassId> + '_ {
        self.by_name.values().copied()
    }
}

pub struct ClassRegistry {
    interner: Arc<ThreadedRodeo>,
    br: Arc<BootstrapRegistry>,
    loaders: Vec<ClassLoader>,
    classes: Vec<ClassEntity>,
    methods: Vec<Method>,

    signatures: Vec<MethodDescriptor>,
    signature_index: HashMap<Symbol, SignatureId>,

    field_descriptors: Vec<TypeDescriptor>,
    field_descriptor_index: HashMap<Symbol, FieldDescriptorId>,

    // Raw definition pieces parked between load and resolve.
    pending_fields: HashMap<ClassId, Vec<crate::bytecode::FieldDefinition>>,
    pending_interfaces: HashMap<ClassId, Vec<Symbol>>,
}

pub const BOOT_LOADER: LoaderId = match LoaderId::from_raw(1) {
    Some(id) => id,
    None => unreachable!(),
};

impl ClassRegistry {
    pub fn new(
        interner: Arc<ThreadedRodeo>,
        br: Arc<BootstrapRegistry>,
        boot_provider: Box<dyn ClassProvider>,
    ) -> Self {
        debug_log!("creating class registry");
        let mut registry = Self {
            interner,
            br,
            loaders: Vec::new(),
            classes: Vec::with_capacity(256),
            methods: Vec::with_capacity(4096),
            signatures: Vec::with_capacity(1024),
            signature_index: HashMap::new(),
            field_descriptors: Vec::with_capacity(512),
            field_descriptor_index: HashMap::new(),
            pending_fields: HashMap::new(),
            pending_interfaces: HashMap::new(),
        };
        let boot = registry.register_loader(boot_provider, IsolateId::BOOT);
        debug_assert_eq!(boot, BOOT_LOADER);
        registry.register_primitives();
        registry
    }

    fn register_primitives(&mut self) {
        for kind in PrimitiveKind::values() {
            let name = self.br.primitive_sym(*kind);
            let class_id = self.push_class(ClassEntity::Primitive(PrimitiveClass {
                name,
                kind: *kind,
            }));
            self.loaders[BOOT_LOADER.to_index()]
                .by_name
                .insert(name, class_id);
        }
    }

    pub fn register_loader(
        &mut self,
        provider: Box<dyn ClassProvider>,
        isolate: IsolateId,
    ) -> LoaderId {
        self.loaders.push(ClassLoader {
            isolate,
            provider,
            by_name: HashMap::new(),
        });
        LoaderId::from_usize(self.loaders.len())
    }

    pub fn interner(&self) -> &ThreadedRodeo {
        &self.interner
    }

    pub fn br(&self) -> &BootstrapRegistry {
        &self.br
    }

    pub fn loader(&self, id: LoaderId) -> &ClassLoader {
        &self.loaders[id.to_index()]
    }

    pub fn loader_count(&self) -> usize {
        self.loaders.len()
    }

    pub fn isolate_of_class(&self, class_id: ClassId) -> IsolateId {
        match self.get_class(class_id).loader() {
            Some(loader) => self.loader(loader).isolate,
            None => IsolateId::BOOT,
        }
    }

    pub fn push_class(&mut self, class: ClassEntity) -> ClassId {
        self.classes.push(class);
        ClassId::from_usize(self.classes.len())
    }

    pub fn get_class(&self, class_id: ClassId) -> &ClassEntity {
        &self.classes[class_id.to_index()]
    }

    pub fn classes(&self) -> &[ClassEntity] {
        &self.classes
    }

    pub fn push_method(&mut self, method: Method) -> MethodId {
        self.methods.push(method);
        MethodId::from_usize(self.methods.len())
    }

    pub fn get_method(&self, method_id: MethodId) -> &Method {
        &self.methods[method_id.to_index()]
    }

    pub fn method_count(&self) -> usize {
        self.methods.len()
    }

    pub fn get_or_intern_signature(&mut self, desc: Symbol) -> Result<SignatureId, VmError> {
        if let Some(id) = self.signature_index.get(&desc) {
            return Ok(*id);
        }
        let parsed = MethodDescriptor::parse(self.interner.resolve(&desc), &self.interner)?;
        self.signatures.push(parsed);
        let id = SignatureId::from_usize(self.signatures.len());
        self.signature_index.insert(desc, id);
        Ok(id)
    }

    pub fn get_signature(&self, id: SignatureId) -> &MethodDescriptor {
        &self.signatures[id.to_index()]
    }

    pub fn signature_of_method(&self, method_id: MethodId) -> &MethodDescriptor {
        self.get_signature(self.get_method(method_id).signature())
    }

    pub fn get_or_intern_field_descriptor(
        &mut self,
        desc: Symbol,
    ) -> Result<FieldDescriptorId, VmError> {
        if let Some(id) = self.field_descriptor_index.get(&desc) {
            return Ok(*id);
        }
        let parsed = TypeDescriptor::parse(self.interner.resolve(&desc), &self.interner)?;
        self.field_descriptors.push(parsed);
        let id = FieldDescriptorId::from_usize(self.field_descriptors.len());
        self.field_descriptor_index.insert(desc, id);
        Ok(id)
    }

    pub fn get_field_descriptor(&self, id: FieldDescriptorId) -> &TypeDescriptor {
        &self.field_descriptors[id.to_index()]
    }

    // ---- loading ----------------------------------------------------------

    /// Name-keyed lazy load. Array descriptors synthesise array classes;
    /// user loaders delegate to the bootstrap loader first.
    pub fn get_or_load(&mut self, loader: LoaderId, name: Symbol) -> Result<ClassId, VmError> {
        if let Some(class_id) = self.loaders[loader.to_index()].by_name.get(&name) {
            return Ok(*class_id);
        }
        if loader != BOOT_LOADER
            && let Some(class_id) = self.loaders[BOOT_LOADER.to_index()].by_name.get(&name)
        {
            return Ok(*class_id);
        }

        let name_str = self.interner.resolve(&name);
        if name_str.starts_with('[') {
            return self.load_array_class(loader, name);
        }

        if loader != BOOT_LOADER {
            if let Ok(class_id) = self.load_class(BOOT_LOADER, name) {
                return Ok(class_id);
            }
        }
        self.load_class(loader, name)
    }

    fn load_class(&mut self, loader: LoaderId, name: Symbol) -> Result<ClassId, VmError> {
        let def = self.loaders[loader.to_index()]
            .provider
            .find_class(name, &self.interner)?;
        if def.name != name {
            return Err(VmError::ClassFormat(format!(
                "provider returned {:?} for {:?}",
                self.interner.resolve(&def.name),
                self.interner.resolve(&name)
            )));
        }
        let super_id = match def.super_name {
            Some(super_name) => Some(self.get_or_load(loader, super_name)?),
            None => None,
        };
        let class_id = self.define_class(loader, def, super_id)?;
        self.loaders[loader.to_index()].by_name.insert(name, class_id);
        debug_log!("loaded class {}", self.interner.resolve(&name));
        Ok(class_id)
    }

    fn define_class(
        &mut self,
        loader: LoaderId,
        def: ClassDefinition,
        super_id: Option<ClassId>,
    ) -> Result<ClassId, VmError> {
        let mut base = BaseClass::new(
            def.name,
            def.flags,
            loader,
            super_id,
            def.source_file,
            def.value_class,
        );
        base.inner_classes = def.inner_classes;
        base.attributes = def.attributes;
        base.generic_params = def.generic_params;
        let is_interface = def.flags.is_interface();
        let entity = if is_interface {
            ClassEntity::Interface(Box::new(InterfaceClass::new(base, def.pool)))
        } else {
            ClassEntity::Instance(Box::new(InstanceClass::new(base, def.pool)))
        };
        let class_id = self.push_class(entity);

        let clinit_sym = self.br.clinit_sym;
        let init_sym = self.br.init_sym;

        let mut declared = HashMap::new();
        let mut virtuals = Vec::new();
        let mut statics = Vec::new();
        for method_def in def.methods {
            let key = MethodKey {
                name: method_def.name,
                desc: method_def.desc,
            };
            let signature = self.get_or_intern_signature(method_def.desc)?;
            let method = Method::new(
                class_id,
                method_def.name,
                method_def.desc,
                signature,
                method_def.flags,
                method_def.code,
                method_def.generic_params,
            )?;
            let is_static = method.is_static();
            let method_id = self.push_method(method);

            if key.name == clinit_sym {
                self.get_class(class_id)
                    .base()
                    .expect("just created")
                    .set_clinit(method_id)?;
                continue;
            }
            declared.insert(key, method_id);
            // Constructors and privates dispatch via invokespecial, never the VT.
            let method_flags = method_def.flags;
            if !is_static && key.name != init_sym && !method_flags.is_private() {
                virtuals.push(method_id);
            } else {
                statics.push(method_id);
            }
        }

        // Field definitions are split into instance/static lists at resolve
        // time; stash the raw definitions on the entity until then.
        match self.get_class(class_id) {
            ClassEntity::Instance(class) => {
                class.set_declared_methods(declared, virtuals, statics)?;
            }
            ClassEntity::Interface(interface) => {
                let index = declared.clone();
                let methods = declared.values().copied().collect();
                interface.set_methods(methods, index)?;
            }
            _ => unreachable!(),
        }
        self.pending_fields.insert(class_id, def.fields);
        self.pending_interfaces.insert(class_id, def.interfaces);
        let base = self.get_class(class_id).base().expect("just created");
        base.set_state(ClassState::Loaded);
        Ok(class_id)
    }

    fn load_array_class(&mut self, loader: LoaderId, name: Symbol) -> Result<ClassId, VmError> {
        let descriptor = TypeDescriptor::parse(self.interner.resolve(&name), &self.interner)?;
        let TypeDescriptor::Array { .. } = &descriptor else {
            return Err(VmError::ClassFormat(format!(
                "{:?} is not an array descriptor",
                self.interner.resolve(&name)
            )));
        };
        let element = descriptor.element_type().expect("array has an element");
        let (element_class, element_primitive) = match &element {
            TypeDescriptor::Primitive(kind) => (None, Some(*kind)),
            TypeDescriptor::Reference(sym) => (Some(self.get_or_load(loader, *sym)?), None),
            TypeDescriptor::Array { .. } => {
                let mut elem_name = String::new();
                element.write_descriptor(&mut elem_name, &self.interner);
                let elem_sym = self.interner.get_or_intern(&elem_name);
                (Some(self.get_or_load(loader, elem_sym)?), None)
            }
            TypeDescriptor::Pointer(_) => {
                return Err(VmError::ClassFormat(
                    "pointer types have no array classes".to_string(),
                ));
            }
        };

        let object_id = self.get_or_load(BOOT_LOADER, self.br.java_lang_object_sym)?;
        let base = BaseClass::new(
            name,
            ClassFlags(ClassFlags::PUBLIC | ClassFlags::FINAL),
            loader,
            Some(object_id),
            None,
            false,
        );
        base.set_state(ClassState::Loaded);
        let array = ArrayClass {
            base,
            descriptor,
            element_class,
            element_primitive,
            vt: once_cell::sync::OnceCell::new(),
        };
        let class_id = self.push_class(ClassEntity::Array(Box::new(array)));
        self.loaders[loader.to_index()].by_name.insert(name, class_id);
        Ok(class_id)
    }

    // ---- resolution -------------------------------------------------------

    /// Computes the instance layout, builds VT and IMT, computes depth and
    /// display, lays out and allocates the static instance. Recursively
    /// resolves (never initialises) the superclass chain and interfaces.
    pub fn resolve(
        &mut self,
        class_id: ClassId,
        code: &dyn CodeAllocator,
        statics: &dyn StaticStore,
    ) -> Result<(), VmError> {
        let state = match self.get_class(class_id).base() {
            Some(base) => base.state(),
            None => return Ok(()), // primitives need no resolution
        };
        if state >= ClassState::Resolved {
            return Ok(());
        }
        if state == ClassState::Resolving {
            return Err(VmError::Lifecycle {
                class: self.get_class(class_id).name(),
                expected: "resolution re-entered on a cyclic superclass chain",
            });
        }
        let base = self.get_class(class_id).base().expect("checked above");
        if !base.try_transition(ClassState::Loaded, ClassState::Resolving) {
            return Ok(());
        }

        if let Some(super_id) = self.get_class(class_id).super_id() {
            self.resolve(super_id, code, statics)?;
        }

        match self.get_class(class_id) {
            ClassEntity::Instance(_) => self.resolve_instance(class_id, code, statics)?,
            ClassEntity::Interface(_) => self.resolve_interface(class_id, code, statics)?,
            ClassEntity::Array(_) => self.resolve_array(class_id)?,
            ClassEntity::Primitive(_) => unreachable!(),
        }

        let base = self.get_class(class_id).base().expect("checked above");
        base.set_state(ClassState::Resolved);
        Ok(())
    }

    fn link_interfaces(
        &mut self,
        class_id: ClassId,
        code: &dyn CodeAllocator,
        statics: &dyn StaticStore,
    ) -> Result<Vec<ClassId>, VmError> {
        let loader = self
            .get_class(class_id)
            .loader()
            .expect("linked classes have a loader");
        let interface_defs = self.pending_interfaces.remove(&class_id).unwrap_or_default();

        let mut transitive = Vec::new();
        let mut seen = HashSet::new();
        if let Some(super_id) = self.get_class(class_id).super_id() {
            for &id in self.get_class(super_id).base().expect("resolved").interfaces()? {
                if seen.insert(id) {
                    transitive.push(id);
                }
            }
        }
        for name in interface_defs {
            let interface_id = self.get_or_load(loader, name)?;
            self.resolve(interface_id, code, statics)?;
            if !self.get_class(interface_id).is_interface() {
                throw_exception!(
                    IncompatibleClassChangeError,
                    class_sym: self.get_class(interface_id).name()
                );
            }
            if seen.insert(interface_id) {
                transitive.push(interface_id);
            }
            for &super_interface in self
                .get_class(interface_id)
                .base()
                .expect("interface")
                .interfaces()?
            {
                if seen.insert(super_interface) {
                    transitive.push(super_interface);
                }
            }
        }
        self.get_class(class_id)
            .base()
            .expect("linked")
            .set_interfaces(transitive.clone())?;
        Ok(transitive)
    }

    fn layout_fields(&mut self, class_id: ClassId) -> Result<(), VmError> {
        let defs = self.pending_fields.remove(&class_id).unwrap_or_default();

        let super_id = self.get_class(class_id).super_id();
        let (mut size, mut align, mut fields, mut index) = match super_id {
            Some(super_id) => match self.get_class(super_id) {
                ClassEntity::Instance(parent) => (
                    parent.instance_size()?,
                    parent.instance_align()?,
                    parent.instance_fields()?.to_vec(),
                    parent
                        .instance_fields()?
                        .iter()
                        .enumerate()
                        .map(|(i, f)| {
                            (
                                FieldKey {
                                    name: f.name,
                                    desc: f.desc,
                                },
                                i,
                            )
                        })
                        .collect::<HashMap<_, _>>(),
                ),
                _ => (OBJECT_HEADER_SIZE, WORD_SIZE, Vec::new(), HashMap::new()),
            },
            None => (OBJECT_HEADER_SIZE, WORD_SIZE, Vec::new(), HashMap::new()),
        };

        let mut static_fields = Vec::new();
        let mut static_index = HashMap::new();
        let mut static_size = OBJECT_HEADER_SIZE;

        for def in defs {
            let key = FieldKey {
                name: def.name,
                desc: def.desc,
            };
            let descriptor_id = self.get_or_intern_field_descriptor(def.desc)?;
            let field_size = self.get_field_descriptor(descriptor_id).byte_size();

            if def.flags.is_static() {
                static_size = (static_size + field_size - 1) & !(field_size - 1);
                let offset = static_size;
                static_size += field_size;
                let slot = static_fields.len();
                static_fields.push(Field {
                    name: def.name,
                    desc: def.desc,
                    descriptor: descriptor_id,
                    flags: def.flags,
                    slot: slot as u16,
                    offset,
                    class_def: class_id,
                });
                static_index.insert(key, slot);
            } else {
                size = (size + field_size - 1) & !(field_size - 1);
                let offset = size;
                size += field_size;
                align = align.max(field_size);
                let slot = fields.len();
                fields.push(Field {
                    name: def.name,
                    desc: def.desc,
                    descriptor: descriptor_id,
                    flags: def.flags,
                    slot: slot as u16,
                    offset,
                    class_def: class_id,
                });
                index.insert(key, slot);
            }
        }

        size = (size + align - 1) & !(align - 1);

        match self.get_class(class_id) {
            ClassEntity::Instance(class) => {
                class.set_instance_layout(fields, index, size, align)?;
                class
                    .base
                    .set_static_layout(static_fields, static_index, static_size)?;
            }
            ClassEntity::Interface(interface) => {
                interface
                    .base
                    .set_static_layout(static_fields, static_index, static_size)?;
            }
            _ => unreachable!(),
        }
        Ok(())
    }

    fn resolve_instance(
        &mut self,
        class_id: ClassId,
        code: &dyn CodeAllocator,
        statics: &dyn StaticStore,
    ) -> Result<(), VmError> {
        let interfaces = self.link_interfaces(class_id, code, statics)?;
        self.layout_fields(class_id)?;

        // VT: copy the parent's table, then override by name+descriptor.
        let super_id = self.get_class(class_id).super_id();
        let (parent_vt_snapshot, mut vtable_index) = match super_id {
            Some(super_id) => match self.get_class(super_id) {
                ClassEntity::Instance(parent) => {
                    (Some(super_id), parent.vtable_index()?.clone())
                }
                _ => (None, HashMap::new()),
            },
            None => (None, HashMap::new()),
        };

        let mut vt = {
            let parent_vt = parent_vt_snapshot
                .map(|sid| self.get_class(sid).as_instance().and_then(|p| p.vt()))
                .transpose()?;
            VirtualTable::new(class_id, parent_vt)
        };

        let virtuals = self.get_class(class_id).as_instance()?.virtual_methods()?.to_vec();
        for method_id in virtuals {
            let method = self.get_method(method_id);
            let key = method.key();
            let stub = code.method_stub(method_id, StubKind::Virtual);
            method.set_code(stub);
            match vtable_index.get(&key) {
                Some(&offset) => {
                    vt.override_slot(offset, method_id, stub);
                    method.set_vt_offset(offset)?;
                }
                None => {
                    let offset = vt.push_slot(method_id, stub);
                    vtable_index.insert(key, offset);
                    method.set_vt_offset(offset)?;
                }
            }
        }

        let statics_and_specials = self
            .get_class(class_id)
            .as_instance()?
            .static_methods()?
            .to_vec();
        for method_id in statics_and_specials {
            let method = self.get_method(method_id);
            let kind = if method.is_static() {
                StubKind::Static
            } else {
                StubKind::Special
            };
            method.set_code(code.method_stub(method_id, kind));
        }

        // Interface methods the class does not define land in the VT too:
        // default methods get their own slot, abstract holes get a trap that
        // raises AbstractMethodError at call time.
        let mut imt_entries = Vec::new();
        for &interface_id in &interfaces {
            let interface_methods = self
                .get_class(interface_id)
                .as_interface()?
                .methods()?
                .to_vec();
            for interface_method_id in interface_methods {
                let interface_method = self.get_method(interface_method_id);
                let key = interface_method.key();
                let slot = imt_hash(
                    self.interner.resolve(&key.name),
                    self.interner.resolve(&key.desc),
                );
                let code_word = match vtable_index.get(&key) {
                    Some(&offset) => vt.code_at(offset).expect("slot filled during build"),
                    None => {
                        let (impl_code, impl_method) = if interface_method.is_abstract() {
                            (code.abstract_trap(interface_method_id), interface_method_id)
                        } else {
                            let stub = code.method_stub(interface_method_id, StubKind::Virtual);
                            interface_method.set_code(stub);
                            (stub, interface_method_id)
                        };
                        let offset = vt.push_slot(impl_method, impl_code);
                        vtable_index.insert(key, offset);
                        impl_code
                    }
                };
                imt_entries.push((interface_method_id, code_word, slot));
            }
        }
        vt.imt = Some(Imt::build(&imt_entries));

        // A finalize override marks instances for finalisation at allocation.
        vt.destructor = vtable_index
            .get(&self.br.finalize_key)
            .and_then(|offset| vt.code_at(*offset));

        // Secondary types: every transitive interface, plus the chain beyond
        // the display bound.
        let mut secondary = interfaces.clone();
        if vt.depth as usize >= DISPLAY_LEN {
            secondary.push(class_id);
            let mut cursor = super_id;
            while let Some(ancestor) = cursor {
                if let Some(ancestor_vt) = self.get_class(ancestor).vt()
                    && ancestor_vt.depth as usize >= DISPLAY_LEN
                {
                    secondary.push(ancestor);
                }
                cursor = self.get_class(ancestor).super_id();
            }
        }
        vt.secondary_types = secondary;

        let class = self.get_class(class_id).as_instance()?;
        class.set_vtable_index(vtable_index)?;
        class.set_vt(vt)?;

        // Static instance: laid out above, allocated here, live as long as
        // the loader.
        let static_size = class.base.static_size()?;
        let static_instance = statics.allocate_static(class_id, static_size)?;
        class.base.set_static_instance(static_instance)?;
        Ok(())
    }

    fn resolve_interface(
        &mut self,
        class_id: ClassId,
        code: &dyn CodeAllocator,
        statics: &dyn StaticStore,
    ) -> Result<(), VmError> {
        self.link_interfaces(class_id, code, statics)?;
        self.layout_fields(class_id)?;
        let methods = self
            .get_class(class_id)
            .as_interface()?
            .methods()?
            .to_vec();
        for method_id in methods {
            let method = self.get_method(method_id);
            if !method.is_abstract() {
                method.set_code(code.method_stub(method_id, StubKind::Virtual));
            }
        }
        let interface = self.get_class(class_id).as_interface()?;
        let static_size = interface.base.static_size()?;
        let static_instance = statics.allocate_static(class_id, static_size)?;
        interface.base.set_static_instance(static_instance)?;
        Ok(())
    }

    fn resolve_array(&mut self, class_id: ClassId) -> Result<(), VmError> {
        let object_id = self.get_or_load(BOOT_LOADER, self.br.java_lang_object_sym)?;
        let cloneable = self.get_or_load(BOOT_LOADER, self.br.java_lang_cloneable_sym)?;
        let serializable = self.get_or_load(BOOT_LOADER, self.br.java_io_serializable_sym)?;

        let object_vt = self
            .get_class(object_id)
            .as_instance()
            .ok()
            .and_then(|c| c.vt.get());
        let mut vt = VirtualTable::new(class_id, object_vt);
        vt.secondary_types = vec![cloneable, serializable];
        vt.base_class_vt = self.get_class(class_id).as_array()?.element_class;

        let array = self.get_class(class_id).as_array()?;
        array.base.set_interfaces(vec![cloneable, serializable])?;
        array
            .vt
            .set(vt)
            .map_err(|_| VmError::ResolutionState("array VT already built"))?;
        Ok(())
    }

    // ---- lookup -----------------------------------------------------------

    /// The standard walk: declared methods, then the superclass chain, then
    /// interfaces; ties broken by declaration order.
    pub fn lookup_method(
        &self,
        class_id: ClassId,
        key: MethodKey,
        want_static: bool,
        throw: bool,
    ) -> Result<Option<MethodId>, VmError> {
        let mut cursor = Some(class_id);
        while let Some(id) = cursor {
            match self.get_class(id) {
                ClassEntity::Instance(class) => {
                    if let Some(method_id) = class.declared_method(&key) {
                        if self.get_method(method_id).is_static() == want_static {
                            return Ok(Some(method_id));
                        }
                    }
                }
                ClassEntity::Interface(interface) => {
                    if let Some(method_id) = interface.method(&key) {
                        if self.get_method(method_id).is_static() == want_static {
                            return Ok(Some(method_id));
                        }
                    }
                }
                _ => {}
            }
            cursor = self.get_class(id).super_id();
        }

        if !want_static
            && let Some(base) = self.get_class(class_id).base()
            && let Ok(interfaces) = base.interfaces()
        {
            for &interface_id in interfaces {
                if let Some(method_id) = self.get_class(interface_id).as_interface()?.method(&key) {
                    return Ok(Some(method_id));
                }
            }
        }

        if throw {
            throw_exception!(
                NoSuchMethodError,
                method_key: key,
                class_sym: self.get_class(class_id).name()
            );
        }
        Ok(None)
    }

    /// Field resolution walk: the class, then superclasses, then interfaces
    /// (for statics).
    pub fn lookup_field(
        &self,
        class_id: ClassId,
        key: FieldKey,
        want_static: bool,
    ) -> Result<(ClassId, Field), VmError> {
        let mut cursor = Some(class_id);
        while let Some(id) = cursor {
            if want_static {
                if let Some(base) = self.get_class(id).base()
                    && let Some(field) = base.static_field(&key)
                {
                    return Ok((id, field.clone()));
                }
            } else if let ClassEntity::Instance(class) = self.get_class(id)
                && let Some(field) = class.instance_field(&key)
            {
                return Ok((field.class_def, field.clone()));
            }
            cursor = self.get_class(id).super_id();
        }

        if want_static
            && let Some(base) = self.get_class(class_id).base()
            && let Ok(interfaces) = base.interfaces()
        {
            for &interface_id in interfaces {
                if let Some(base) = self.get_class(interface_id).base()
                    && let Some(field) = base.static_field(&key)
                {
                    return Ok((interface_id, field.clone()));
                }
            }
        }

        Err(build_exception!(
            NoSuchFieldError,
            field_key: key,
            class_sym: self.get_class(class_id).name()
        ))
    }

    // ---- subtype tests ----------------------------------------------------

    /// One load and one compare when the target sits inside the display;
    /// a linear secondary scan otherwise.
    pub fn sub_class_of(&self, class_id: ClassId, target: ClassId) -> bool {
        if class_id == target {
            return true;
        }
        let target_entity = self.get_class(target);
        let Some(vt) = self.get_class(class_id).vt() else {
            // Interfaces have no VT; walk their super-interface set.
            if let Ok(interface) = self.get_class(class_id).as_interface() {
                if target == self.object_id_unchecked() {
                    return true;
                }
                return interface
                    .base
                    .interfaces()
                    .map(|ids| ids.contains(&target))
                    .unwrap_or(false);
            }
            return false;
        };
        if !target_entity.is_interface()
            && let Some(target_vt) = target_entity.vt()
            && (target_vt.depth as usize) < DISPLAY_LEN
        {
            return vt.display_hit(target, target_vt.depth);
        }
        vt.secondary_hit(target)
    }

    fn object_id_unchecked(&self) -> ClassId {
        self.loaders[BOOT_LOADER.to_index()]
            .by_name
            .get(&self.br.java_lang_object_sym)
            .copied()
            .expect("root class is loaded before interfaces exist")
    }

    /// `source` is assignable to `target`, with array covariance for
    /// reference elements and invariance for primitive elements.
    pub fn assignable_from(&self, target: ClassId, source: ClassId) -> bool {
        if target == source {
            return true;
        }
        match (self.get_class(source), self.get_class(target)) {
            (ClassEntity::Array(src), ClassEntity::Array(dst)) => {
                match (src.element_primitive, dst.element_primitive) {
                    (Some(a), Some(b)) => a == b,
                    (None, None) => match (src.element_class, dst.element_class) {
                        (Some(a), Some(b)) => self.assignable_from(b, a),
                        _ => false,
                    },
                    _ => false,
                }
            }
            (ClassEntity::Array(_), _) => self.sub_class_of(source, target),
            _ => self.sub_class_of(source, target),
        }
    }

    pub fn instance_of(&self, class_id: ClassId, target: ClassId) -> bool {
        self.assignable_from(target, class_id)
    }
}
