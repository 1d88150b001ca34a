//! Ahead-of-time mode: materialises every resolvable entity of a set of
//! classes — class records, VTs, constant pools, static instances, UTF-8
//! and interned strings — as typed constants in a translation unit, plus one
//! compiled function per bytecode method and a generated `StaticInitializer`
//! that registers the unit's classes with the bootstrap loader at load time.
//! Cross-unit references stay external and resolve at load.

use crate::backend::Backend;
use crate::bytecode::Constant;
use crate::error::VmError;
use crate::intrinsics::RuntimeFn;
use crate::ir::{Callee, FnSig, FunctionBuilder, InstKind, IrType, Terminator};
use crate::keys::{ClassId, FunctionId};
use crate::rt::ClassEntity;
use crate::thread::VmThread;
use crate::translate::{CompileMode, TranslateOpts, translate_method};
use crate::vm::VirtualMachine;
use crate::debug_log;
use itertools::Itertools;
use lasso::Key;

/// A typed constant recorded into the unit.
#[derive(Debug, Clone, PartialEq)]
pub enum AotConstant {
    Class {
        name: String,
        class: ClassId,
    },
    VirtualTable {
        class: ClassId,
        method_symbols: Vec<String>,
    },
    ConstantPool {
        class: ClassId,
        entry_count: usize,
    },
    StaticInstance {
        class: ClassId,
        byte_size: usize,
    },
    Utf8(String),
    InternedString(String),
}

pub struct AotModule {
    pub name: String,
    pub constants: Vec<AotConstant>,
    pub functions: Vec<FunctionId>,
    /// Symbols left with external linkage, filled at load time.
    pub externals: Vec<String>,
    pub static_initializer: FunctionId,
}

pub struct AotCompiler {
    /// All classes present at compile time; otherwise callback stubs are
    /// left for not-yet-seen targets.
    pub assume_compiled: bool,
}

impl AotCompiler {
    pub fn new(assume_compiled: bool) -> Self {
        Self { assume_compiled }
    }

    fn opts(&self, vm: &VirtualMachine) -> TranslateOpts {
        TranslateOpts {
            mode: if self.assume_compiled {
                CompileMode::AotAssumeCompiled
            } else {
                CompileMode::AotCallback
            },
            use_inline_caches: vm.config.use_inline_caches,
            emit_checks: vm.config.emit_checks,
        }
    }

    /// Compiles one translation unit.
    pub fn compile_unit(
        &self,
        vm: &VirtualMachine,
        unit_name: &str,
        classes: &[ClassId],
    ) -> Result<AotModule, VmError> {
        let _ir_lock = vm.engine.lock_compilation();
        debug_log!("AOT-compiling unit {unit_name} with {} classes", classes.len());

        let mut constants = Vec::new();
        let mut functions = Vec::new();
        let mut externals = Vec::new();

        for &class_id in classes {
            vm.resolve_existing(class_id)?;
            let (class_name, method_ids) = {
                let registry = vm.registry_read();
                let entity = registry.get_class(class_id);
                let name = registry.interner().resolve(&entity.name()).to_string();
                let methods: Vec<_> = match entity {
                    ClassEntity::Instance(class) => {
                        let mut all = class.virtual_methods()?.to_vec();
                        all.extend_from_slice(class.static_methods()?);
                        if let Some(clinit) = class.base.clinit() {
                            all.push(clinit);
                        }
                        all
                    }
                    ClassEntity::Interface(interface) => interface.methods()?.to_vec(),
                    _ => Vec::new(),
                };
                (name, methods)
            };

            constants.push(AotConstant::Utf8(class_name.clone()));
            constants.push(AotConstant::Class {
                name: class_name.clone(),
                class: class_id,
            });

            {
                let registry = vm.registry_read();
                let entity = registry.get_class(class_id);
                if let Some(vt) = entity.vt() {
                    let mut method_symbols = Vec::with_capacity(vt.method_count());
                    for offset in 0..vt.method_count() {
                        let m = registry.get_method(vt.method_at(offset as u16));
                        method_symbols.push(format!(
                            "{}.{}{}",
                            registry
                                .interner()
                                .resolve(&registry.get_class(m.class_id()).name()),
                            registry.interner().resolve(&m.name),
                            registry.interner().resolve(&m.desc),
                        ));
                    }
                    constants.push(AotConstant::VirtualTable {
                        class: class_id,
                        method_symbols,
                    });
                }
                if let Some(pool) = entity.pool() {
                    constants.push(AotConstant::ConstantPool {
                        class: class_id,
                        entry_count: pool.len(),
                    });
                    for entry in pool.entries() {
                        match entry {
                            Constant::StringConst(sym) => {
                                constants.push(AotConstant::InternedString(
                                    registry.interner().resolve(sym).to_string(),
                                ));
                            }
                            Constant::Utf8(sym) => {
                                constants.push(AotConstant::Utf8(
                                    registry.interner().resolve(sym).to_string(),
                                ));
                            }
                            _ => {}
                        }
                    }
                }
                if let Some(base) = entity.base()
                    && let Ok(size) = base.static_size()
                {
                    constants.push(AotConstant::StaticInstance {
                        class: class_id,
                        byte_size: size,
                    });
                }
            }

            for method_id in method_ids {
                let (has_code, symbol) = {
                    let registry = vm.registry_read();
                    let m = registry.get_method(method_id);
                    let symbol = format!(
                        "{}.{}{}",
                        class_name,
                        registry.interner().resolve(&m.name),
                        registry.interner().resolve(&m.desc),
                    );
                    (m.bytecode().is_ok(), symbol)
                };
                if !has_code {
                    // Native and abstract bodies keep external linkage.
                    externals.push(symbol);
                    continue;
                }
                let body = translate_method(vm, method_id, self.opts(vm))?;
                let function = vm.engine.define_function(body)?;
                {
                    let registry = vm.registry_read();
                    registry
                        .get_method(method_id)
                        .set_code(vm.engine.function_code(function));
                }
                functions.push(function);
            }
        }

        let static_initializer = self.build_static_initializer(vm, unit_name, classes)?;
        // UTF-8 and interned-string constants appear once per unit; the
        // external symbol table is kept sorted and duplicate-free.
        let mut seen = std::collections::HashSet::new();
        constants.retain(|c| match c {
            AotConstant::Utf8(text) => seen.insert(("u", text.clone())),
            AotConstant::InternedString(text) => seen.insert(("s", text.clone())),
            _ => true,
        });
        let externals: Vec<String> = externals.into_iter().sorted().dedup().collect();
        Ok(AotModule {
            name: unit_name.to_string(),
            constants,
            functions,
            externals,
            static_initializer,
        })
    }

    /// `StaticInitializer`: registers each class (and array classes) with
    /// the bootstrap loader when the unit is loaded.
    fn build_static_initializer(
        &self,
        vm: &VirtualMachine,
        unit_name: &str,
        classes: &[ClassId],
    ) -> Result<FunctionId, VmError> {
        let sig = FnSig {
            params: Vec::new(),
            ret: IrType::Void,
        };
        let mut b = FunctionBuilder::new(format!("vmkit.StaticInitializer.{unit_name}"), sig, None);
        for &class_id in classes {
            let name_sym = {
                let registry = vm.registry_read();
                registry.get_class(class_id).name()
            };
            let token = b.push(
                InstKind::ConstWord(name_sym.into_usize() as u64),
                IrType::Word,
                0,
            );
            b.push(
                InstKind::Call {
                    callee: Callee::Intrinsic(RuntimeFn::ClassLookup),
                    args: vec![token],
                },
                IrType::Word,
                0,
            );
        }
        b.terminate(Terminator::Ret(None));
        vm.engine.define_function(b.finish())
    }
}

/// Runs a unit's `StaticInitializer`, the module-load step.
pub fn load_unit(
    vm: &VirtualMachine,
    thread: &VmThread,
    module: &AotModule,
) -> Result<(), VmError> {
    vm.engine
        .call_function(vm, thread, module.static_initializer, &[])?;
    Ok(())
}
