//! Isolate lifecycle: start, deny-execution termination, reference reset.

mod common;

use common::op::*;
use common::{ClassSpec, MethodSpec, PoolSpec, TestProvider, class_fn, trivial_init, vm_with};
use vmkit_runtime::bytecode::FieldFlags;
use vmkit_runtime::isolate;
use vmkit_runtime::keys::MethodKey;
use vmkit_runtime::rt::registry::BOOT_LOADER;
use vmkit_runtime::vm::Value;
use vmkit_runtime::VmError;

fn isolate_classes() -> Vec<(&'static str, common::ClassFn)> {
    vec![class_fn(ClassSpec {
        name: "iso/K",
        pool: vec![PoolSpec::Method("iso/K", "tick", "()V")],
        methods: vec![
            trivial_init(),
            MethodSpec::new("tick", "()V", vec![RETURN]).public_static(),
            // loop { tick(); }
            MethodSpec::new(
                "spin",
                "()V",
                vec![INVOKESTATIC, 0, 1, GOTO, 0xff, 0xfd],
            )
            .public_static(),
            // The orderly-shutdown entry point.
            MethodSpec::new("stop", "(Ljava/lang/Object;)V", vec![RETURN]),
        ],
        ..ClassSpec::default()
    })]
}

#[test]
fn terminating_an_isolate_interrupts_its_running_code() {
    // Seed scenario 6: a thread busy in isolate code raises "interrupted"
    // once the isolate is stopped, and later entries fail immediately.
    let vm = vm_with(vec![]);
    let iso = isolate::start_isolate(&vm, Box::new(TestProvider::new(isolate_classes()))).unwrap();
    let loader = vm.isolates.loader_of(iso).unwrap();
    let k_sym = vm.interner().get_or_intern("iso/K");
    let k = vm.resolve_class(loader, k_sym).unwrap();

    let (spin, tick) = {
        let registry = vm.registry_read();
        let spin = registry
            .lookup_method(
                k,
                MethodKey {
                    name: vm.interner().get_or_intern("spin"),
                    desc: vm.interner().get_or_intern("()V"),
                },
                true,
                true,
            )
            .unwrap()
            .unwrap();
        let tick = registry
            .lookup_method(
                k,
                MethodKey {
                    name: vm.interner().get_or_intern("tick"),
                    desc: vm.interner().get_or_intern("()V"),
                },
                true,
                true,
            )
            .unwrap()
            .unwrap();
        (spin, tick)
    };

    let runner = vm.threads.attach();
    let handle = {
        let vm = vm.clone();
        let runner = runner.clone();
        std::thread::spawn(move || vm.engine.call_method(&vm, &runner, spin, &[]))
    };
    while runner.frame_count() == 0 {
        std::thread::yield_now();
    }

    isolate::deny_execution(&vm, iso).unwrap();
    let error = handle.join().unwrap().unwrap_err();
    match error {
        VmError::Thrown(obj) => {
            let class = vm.heap_read().class_of(obj).unwrap();
            let registry = vm.registry_read();
            assert_eq!(
                vm.interner().resolve(&registry.get_class(class).name()),
                "java/lang/InterruptedException"
            );
        }
        other => panic!("expected an interruption, got {other:?}"),
    }

    // The prolog patch makes fresh entries fail immediately.
    let thread = vm.threads.attach();
    assert!(vm.engine.call_method(&vm, &thread, tick, &[]).is_err());
}

#[test]
fn the_stop_entry_point_survives_as_a_plain_return() {
    let vm = vm_with(vec![]);
    let iso = isolate::start_isolate(&vm, Box::new(TestProvider::new(isolate_classes()))).unwrap();
    let loader = vm.isolates.loader_of(iso).unwrap();
    let k_sym = vm.interner().get_or_intern("iso/K");
    let k = vm.resolve_class(loader, k_sym).unwrap();

    let stop = {
        let registry = vm.registry_read();
        registry
            .lookup_method(
                k,
                MethodKey {
                    name: vm.interner().get_or_intern("stop"),
                    desc: vm.interner().get_or_intern("(Ljava/lang/Object;)V"),
                },
                false,
                true,
            )
            .unwrap()
            .unwrap()
    };
    let size = {
        let registry = vm.registry_read();
        registry
            .get_class(k)
            .as_instance()
            .unwrap()
            .instance_size()
            .unwrap()
    };
    let receiver = vm.heap_write().alloc_instance(k, size).unwrap();

    isolate::deny_execution(&vm, iso).unwrap();

    // Doomed methods raise; the stop method still completes orderly.
    let thread = vm.threads.attach();
    let result = vm.engine.call_method(
        &vm,
        &thread,
        stop,
        &[Value::Ref(receiver), Value::NULL],
    );
    assert!(matches!(result, Ok(None)));
}

#[test]
fn reference_reset_clears_pointers_into_the_dying_isolate() {
    let holder = ClassSpec {
        name: "hold/H",
        fields: vec![("k", "Ljava/lang/Object;", FieldFlags::PUBLIC)],
        methods: vec![trivial_init()],
        ..ClassSpec::default()
    };
    let vm = vm_with(vec![class_fn(holder)]);
    let iso = isolate::start_isolate(&vm, Box::new(TestProvider::new(isolate_classes()))).unwrap();
    let loader = vm.isolates.loader_of(iso).unwrap();
    let k_sym = vm.interner().get_or_intern("iso/K");
    let k = vm.resolve_class(loader, k_sym).unwrap();
    let h = vm.resolve_class_by_name(BOOT_LOADER, "hold/H").unwrap();

    let (h_size, k_size, field_offset) = {
        let registry = vm.registry_read();
        let h_class = registry.get_class(h).as_instance().unwrap();
        let field = h_class
            .instance_field(&vmkit_runtime::keys::FieldKey {
                name: vm.interner().get_or_intern("k"),
                desc: vm.interner().get_or_intern("Ljava/lang/Object;"),
            })
            .unwrap();
        (
            h_class.instance_size().unwrap(),
            registry
                .get_class(k)
                .as_instance()
                .unwrap()
                .instance_size()
                .unwrap(),
            field.offset,
        )
    };

    let (holder_obj, doomed_obj) = {
        let mut heap = vm.heap_write();
        let holder_obj = heap.alloc_instance(h, h_size).unwrap();
        let doomed_obj = heap.alloc_instance(k, k_size).unwrap();
        heap.write(
            holder_obj,
            field_offset,
            vmkit_runtime::ir::MemShape::Ref,
            Value::Ref(doomed_obj),
        )
        .unwrap();
        (holder_obj, doomed_obj)
    };

    isolate::reset_references(&vm, iso);
    isolate::run_reference_reset(&vm).unwrap();

    let held = vm
        .heap_read()
        .read(holder_obj, field_offset, vmkit_runtime::ir::MemShape::Ref)
        .unwrap();
    assert_eq!(held, Value::NULL);
    assert_ne!(doomed_obj, 0);
}
