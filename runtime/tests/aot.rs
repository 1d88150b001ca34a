//! AOT mode: translation units of typed constants and functions, plus the
//! generated StaticInitializer.

mod common;

use common::op::*;
use common::{ClassSpec, MethodSpec, class_fn, trivial_init, vm_with};
use vmkit_runtime::bytecode::FieldFlags;
use vmkit_runtime::compiler::aot::{AotCompiler, AotConstant, load_unit};
use vmkit_runtime::rt::registry::BOOT_LOADER;
use vmkit_runtime::vm::Value;

fn unit_class() -> ClassSpec {
    ClassSpec {
        name: "aot/T",
        fields: vec![
            ("n", "I", FieldFlags::PUBLIC),
            ("s", "I", FieldFlags::PUBLIC | FieldFlags::STATIC),
        ],
        methods: vec![
            trivial_init(),
            MethodSpec::new("answer", "()I", vec![BIPUSH, 42, IRETURN]).public_static(),
        ],
        ..ClassSpec::default()
    }
}

#[test]
fn a_unit_materialises_every_resolvable_entity() {
    let vm = vm_with(vec![class_fn(unit_class())]);
    let class = vm.resolve_class_by_name(BOOT_LOADER, "aot/T").unwrap();

    let module = AotCompiler::new(true)
        .compile_unit(&vm, "unit_t", &[class])
        .unwrap();

    assert!(module.constants.iter().any(|c| matches!(
        c,
        AotConstant::Class { name, .. } if name == "aot/T"
    )));
    assert!(module
        .constants
        .iter()
        .any(|c| matches!(c, AotConstant::VirtualTable { class: id, .. } if *id == class)));
    assert!(module
        .constants
        .iter()
        .any(|c| matches!(c, AotConstant::StaticInstance { class: id, byte_size } if *id == class && *byte_size > 0)));
    assert!(module
        .constants
        .iter()
        .any(|c| matches!(c, AotConstant::Utf8(text) if text == "aot/T")));
    // <init> and answer were compiled.
    assert_eq!(module.functions.len(), 2);
    assert!(module.externals.is_empty());

    // Loading the unit runs the StaticInitializer, which registers every
    // class with the bootstrap loader.
    let thread = vm.threads.attach();
    load_unit(&vm, &thread, &module).unwrap();

    // The compiled function is directly callable.
    let answer = {
        let registry = vm.registry_read();
        registry
            .lookup_method(
                class,
                vmkit_runtime::keys::MethodKey {
                    name: vm.interner().get_or_intern("answer"),
                    desc: vm.interner().get_or_intern("()I"),
                },
                true,
                true,
            )
            .unwrap()
            .unwrap()
    };
    let result = vm.engine.call_method(&vm, &thread, answer, &[]).unwrap();
    assert_eq!(result, Some(Value::Int(42)));
}

#[test]
fn utf8_constants_are_deduplicated() {
    let vm = vm_with(vec![class_fn(unit_class())]);
    let class = vm.resolve_class_by_name(BOOT_LOADER, "aot/T").unwrap();
    let module = AotCompiler::new(true)
        .compile_unit(&vm, "unit_u", &[class, class])
        .unwrap();
    let count = module
        .constants
        .iter()
        .filter(|c| matches!(c, AotConstant::Utf8(text) if text == "aot/T"))
        .count();
    assert_eq!(count, 1);
}
