//! End-to-end pipeline scenarios: translate, materialise, execute.

mod common;

use common::op::*;
use common::{ClassSpec, MethodSpec, PoolSpec, class_fn, trivial_init, vm_with, vm_with_config};
use std::sync::Arc;
use vmkit_runtime::bytecode::ClassFlags;
use vmkit_runtime::heap::GcRef;
use vmkit_runtime::keys::{ClassId, MethodId, MethodKey};
use vmkit_runtime::rt::registry::BOOT_LOADER;
use vmkit_runtime::vm::VirtualMachine;
use vmkit_runtime::{Value, VmConfig, VmError};

fn static_method(vm: &Arc<VirtualMachine>, class: ClassId, name: &str, desc: &str) -> MethodId {
    let registry = vm.registry_read();
    registry
        .lookup_method(
            class,
            MethodKey {
                name: vm.interner().get_or_intern(name),
                desc: vm.interner().get_or_intern(desc),
            },
            true,
            true,
        )
        .unwrap()
        .unwrap()
}

fn call_static(
    vm: &Arc<VirtualMachine>,
    class: ClassId,
    name: &str,
    desc: &str,
    args: &[Value],
) -> Result<Option<Value>, VmError> {
    let method = static_method(vm, class, name, desc);
    let thread = vm.threads.attach();
    vm.engine.call_method(vm, &thread, method, args)
}

fn new_instance(vm: &Arc<VirtualMachine>, class: ClassId) -> GcRef {
    let size = {
        let registry = vm.registry_read();
        registry
            .get_class(class)
            .as_instance()
            .unwrap()
            .instance_size()
            .unwrap()
    };
    vm.heap_write().alloc_instance(class, size).unwrap()
}

fn thrown_class_name(vm: &Arc<VirtualMachine>, error: VmError) -> String {
    match error {
        VmError::Thrown(obj) => {
            let class = vm.heap_read().class_of(obj).unwrap();
            let registry = vm.registry_read();
            vm.interner()
                .resolve(&registry.get_class(class).name())
                .to_string()
        }
        other => panic!("expected a thrown guest exception, got {other:?}"),
    }
}

#[test]
fn array_allocation_store_load_and_length() {
    // Seed scenario 1: new int[5]; a[2] = 42; a[2] * 100 + a.length.
    let spec = ClassSpec {
        name: "arr/T",
        methods: vec![
            trivial_init(),
            MethodSpec::new(
                "run",
                "()I",
                vec![
                    ICONST_5, //
                    NEWARRAY, 10, // int[]
                    ASTORE_0, //
                    ALOAD_0, ICONST_2, BIPUSH, 42, IASTORE, //
                    ALOAD_0, ICONST_2, IALOAD, //
                    BIPUSH, 100, IMUL, //
                    ALOAD_0, ARRAYLENGTH, IADD, //
                    IRETURN,
                ],
            )
            .public_static(),
        ],
        ..ClassSpec::default()
    };
    let vm = vm_with(vec![class_fn(spec)]);
    let class = vm.resolve_class_by_name(BOOT_LOADER, "arr/T").unwrap();
    let result = call_static(&vm, class, "run", "()I", &[]).unwrap();
    assert_eq!(result, Some(Value::Int(4205)));
}

#[test]
fn out_of_bounds_and_zero_division_surface_guest_exceptions() {
    let spec = ClassSpec {
        name: "chk/T",
        methods: vec![
            trivial_init(),
            MethodSpec::new(
                "get",
                "(I)I",
                vec![
                    ICONST_2, NEWARRAY, 10, ASTORE_1, //
                    ALOAD_1, ILOAD_0, IALOAD, IRETURN,
                ],
            )
            .public_static(),
            MethodSpec::new("div", "(II)I", vec![ILOAD_0, ILOAD_1, IDIV, IRETURN])
                .public_static(),
        ],
        ..ClassSpec::default()
    };
    let vm = vm_with(vec![class_fn(spec)]);
    let class = vm.resolve_class_by_name(BOOT_LOADER, "chk/T").unwrap();

    // In-bounds access works.
    assert_eq!(
        call_static(&vm, class, "get", "(I)I", &[Value::Int(1)]).unwrap(),
        Some(Value::Int(0))
    );
    let error = call_static(&vm, class, "get", "(I)I", &[Value::Int(5)]).unwrap_err();
    assert_eq!(
        thrown_class_name(&vm, error),
        "java/lang/ArrayIndexOutOfBoundsException"
    );

    assert_eq!(
        call_static(&vm, class, "div", "(II)I", &[Value::Int(42), Value::Int(7)]).unwrap(),
        Some(Value::Int(6))
    );
    let error =
        call_static(&vm, class, "div", "(II)I", &[Value::Int(1), Value::Int(0)]).unwrap_err();
    assert_eq!(thrown_class_name(&vm, error), "java/lang/ArithmeticException");
}

#[test]
fn try_catch_finally_runs_both_blocks() {
    // Seed scenario 4: try { throw new E(); } catch (E e) { r = 1; }
    // finally { r |= 2; } — the result is 3.
    let exception_class = ClassSpec {
        name: "exc/E",
        super_name: "java/lang/RuntimeException",
        methods: vec![trivial_init()],
        ..ClassSpec::default()
    };
    let spec = ClassSpec {
        name: "exc/T",
        pool: vec![
            PoolSpec::Class("exc/E"),
            PoolSpec::Method("exc/E", "<init>", "()V"),
        ],
        methods: vec![
            trivial_init(),
            MethodSpec::new(
                "run",
                "()I",
                vec![
                    NEW, 0, 1, // 0
                    DUP, // 3
                    INVOKESPECIAL, 0, 2, // 4
                    ATHROW, // 7
                    ASTORE_0, // 8: catch E
                    ICONST_1, // 9
                    ISTORE_1, // 10
                    ILOAD_1, // 11: finally, fallthrough copy
                    ICONST_2, // 12
                    IOR, // 13
                    ISTORE_1, // 14
                    ILOAD_1, // 15
                    IRETURN, // 16
                    ASTORE_0, // 17: finally, exceptional copy
                    ILOAD_1, // 18
                    ICONST_2, // 19
                    IOR, // 20
                    ISTORE_1, // 21
                    ALOAD_0, // 22
                    ATHROW, // 23
                ],
            )
            .public_static()
            .with_exceptions(vec![(0, 8, 8, Some("exc/E")), (0, 8, 17, None)]),
        ],
        ..ClassSpec::default()
    };
    let vm = vm_with(vec![class_fn(exception_class), class_fn(spec)]);
    let class = vm.resolve_class_by_name(BOOT_LOADER, "exc/T").unwrap();
    let result = call_static(&vm, class, "run", "()I", &[]).unwrap();
    assert_eq!(result, Some(Value::Int(3)));
}

#[test]
fn uncaught_exceptions_propagate_with_a_trace() {
    let exception_class = ClassSpec {
        name: "exc/F",
        super_name: "java/lang/RuntimeException",
        methods: vec![trivial_init()],
        ..ClassSpec::default()
    };
    let spec = ClassSpec {
        name: "exc/U",
        pool: vec![
            PoolSpec::Class("exc/F"),
            PoolSpec::Method("exc/F", "<init>", "()V"),
        ],
        methods: vec![
            trivial_init(),
            MethodSpec::new(
                "boom",
                "()V",
                vec![NEW, 0, 1, DUP, INVOKESPECIAL, 0, 2, ATHROW],
            )
            .public_static(),
        ],
        ..ClassSpec::default()
    };
    let vm = vm_with(vec![class_fn(exception_class), class_fn(spec)]);
    let class = vm.resolve_class_by_name(BOOT_LOADER, "exc/U").unwrap();
    let error = call_static(&vm, class, "boom", "()V", &[]).unwrap_err();
    assert_eq!(thrown_class_name(&vm, error), "exc/F");
}

#[test]
fn invokevirtual_dispatches_on_the_receiver_class() {
    // Invariant 5: the implementation called is the one lookup_method
    // returns for the receiver's class.
    let a = ClassSpec {
        name: "dyn/A",
        methods: vec![
            trivial_init(),
            MethodSpec::new("m", "()I", vec![ICONST_1, IRETURN]),
        ],
        ..ClassSpec::default()
    };
    let b = ClassSpec {
        name: "dyn/B",
        super_name: "dyn/A",
        methods: vec![
            trivial_init(),
            MethodSpec::new("m", "()I", vec![ICONST_2, IRETURN]),
        ],
        ..ClassSpec::default()
    };
    let driver = ClassSpec {
        name: "dyn/D",
        pool: vec![PoolSpec::Method("dyn/A", "m", "()I")],
        methods: vec![
            trivial_init(),
            MethodSpec::new("call", "(Ldyn/A;)I", vec![ALOAD_0, INVOKEVIRTUAL, 0, 1, IRETURN])
                .public_static(),
        ],
        ..ClassSpec::default()
    };
    let vm = vm_with(vec![class_fn(a), class_fn(b), class_fn(driver)]);
    let a_id = vm.resolve_class_by_name(BOOT_LOADER, "dyn/A").unwrap();
    let b_id = vm.resolve_class_by_name(BOOT_LOADER, "dyn/B").unwrap();
    let d_id = vm.resolve_class_by_name(BOOT_LOADER, "dyn/D").unwrap();

    let a_obj = new_instance(&vm, a_id);
    let b_obj = new_instance(&vm, b_id);
    assert_eq!(
        call_static(&vm, d_id, "call", "(Ldyn/A;)I", &[Value::Ref(a_obj)]).unwrap(),
        Some(Value::Int(1))
    );
    assert_eq!(
        call_static(&vm, d_id, "call", "(Ldyn/A;)I", &[Value::Ref(b_obj)]).unwrap(),
        Some(Value::Int(2))
    );
    // Null receivers surface the standard exception.
    let error = call_static(&vm, d_id, "call", "(Ldyn/A;)I", &[Value::NULL]).unwrap_err();
    assert_eq!(thrown_class_name(&vm, error), "java/lang/NullPointerException");
}

fn interface_world(implementer_count: usize) -> Vec<(&'static str, common::ClassFn)> {
    let mut classes = vec![class_fn(ClassSpec {
        name: "iface/I",
        flags: ClassFlags(ClassFlags::PUBLIC | ClassFlags::INTERFACE | ClassFlags::ABSTRACT),
        methods: vec![MethodSpec::abstract_method("f", "()I")],
        ..ClassSpec::default()
    })];
    for index in 0..implementer_count {
        let name: &'static str = Box::leak(format!("iface/C{index:02}").into_boxed_str());
        classes.push(class_fn(ClassSpec {
            name,
            interfaces: vec!["iface/I"],
            methods: vec![
                trivial_init(),
                MethodSpec::new("f", "()I", vec![BIPUSH, index as u8, IRETURN]),
            ],
            ..ClassSpec::default()
        }));
    }
    classes.push(class_fn(ClassSpec {
        name: "iface/D",
        pool: vec![PoolSpec::InterfaceMethod("iface/I", "f", "()I")],
        methods: vec![
            trivial_init(),
            MethodSpec::new(
                "call",
                "(Liface/I;)I",
                vec![ALOAD_0, INVOKEINTERFACE, 0, 1, 1, 0, IRETURN],
            )
            .public_static(),
        ],
        ..ClassSpec::default()
    }));
    classes
}

fn run_interface_dispatch(config: VmConfig) {
    // Seed scenario 3: twenty implementers, each returning its own value.
    let vm = vm_with_config(config, interface_world(20));
    let d_id = vm.resolve_class_by_name(BOOT_LOADER, "iface/D").unwrap();
    for index in 0..20 {
        let name = format!("iface/C{index:02}");
        let class = vm.resolve_class_by_name(BOOT_LOADER, &name).unwrap();
        let obj = new_instance(&vm, class);
        assert_eq!(
            call_static(&vm, d_id, "call", "(Liface/I;)I", &[Value::Ref(obj)]).unwrap(),
            Some(Value::Int(index)),
            "receiver {name}"
        );
    }
}

#[test]
fn invokeinterface_through_the_imt() {
    run_interface_dispatch(VmConfig::default());
}

#[test]
fn invokeinterface_through_envelope_inline_caches() {
    run_interface_dispatch(VmConfig {
        use_inline_caches: true,
        ..VmConfig::default()
    });
}

#[test]
fn imt_collisions_walk_the_chain() {
    // Two interface methods that land in the same IMT slot force the
    // tag-bit collision protocol at both call sites.
    let (first, second) = {
        use vmkit_runtime::rt::vtable::imt_hash;
        let names: Vec<String> = (0..200).map(|i| format!("m{i}")).collect();
        let target = imt_hash(&names[0], "()I");
        let colliding = names[1..]
            .iter()
            .find(|n| imt_hash(n, "()I") == target)
            .expect("some name collides within 200 candidates")
            .clone();
        (
            Box::leak(names[0].clone().into_boxed_str()) as &'static str,
            Box::leak(colliding.into_boxed_str()) as &'static str,
        )
    };

    let iface = ClassSpec {
        name: "col/I",
        flags: ClassFlags(ClassFlags::PUBLIC | ClassFlags::INTERFACE | ClassFlags::ABSTRACT),
        methods: vec![
            MethodSpec::abstract_method(first, "()I"),
            MethodSpec::abstract_method(second, "()I"),
        ],
        ..ClassSpec::default()
    };
    let imp = ClassSpec {
        name: "col/C",
        interfaces: vec!["col/I"],
        methods: vec![
            trivial_init(),
            MethodSpec::new(first, "()I", vec![BIPUSH, 11, IRETURN]),
            MethodSpec::new(second, "()I", vec![BIPUSH, 22, IRETURN]),
        ],
        ..ClassSpec::default()
    };
    let driver = ClassSpec {
        name: "col/D",
        pool: vec![
            PoolSpec::InterfaceMethod("col/I", first, "()I"),
            PoolSpec::InterfaceMethod("col/I", second, "()I"),
        ],
        methods: vec![
            trivial_init(),
            MethodSpec::new(
                "a",
                "(Lcol/I;)I",
                vec![ALOAD_0, INVOKEINTERFACE, 0, 1, 1, 0, IRETURN],
            )
            .public_static(),
            MethodSpec::new(
                "b",
                "(Lcol/I;)I",
                vec![ALOAD_0, INVOKEINTERFACE, 0, 2, 1, 0, IRETURN],
            )
            .public_static(),
        ],
        ..ClassSpec::default()
    };
    let vm = vm_with(vec![class_fn(iface), class_fn(imp), class_fn(driver)]);
    let c_id = vm.resolve_class_by_name(BOOT_LOADER, "col/C").unwrap();
    let d_id = vm.resolve_class_by_name(BOOT_LOADER, "col/D").unwrap();

    // The slot really is shared.
    {
        use vmkit_runtime::rt::vtable::{IMT_TAG_BIT, imt_hash};
        let registry = vm.registry_read();
        let vt = registry.get_class(c_id).vt().unwrap();
        let slot = imt_hash(first, "()I");
        let word = vt.imt.as_ref().unwrap().slot_word(slot);
        assert_eq!(word & IMT_TAG_BIT, 1, "expected a tagged collision slot");
    }

    let obj = new_instance(&vm, c_id);
    assert_eq!(
        call_static(&vm, d_id, "a", "(Lcol/I;)I", &[Value::Ref(obj)]).unwrap(),
        Some(Value::Int(11))
    );
    assert_eq!(
        call_static(&vm, d_id, "b", "(Lcol/I;)I", &[Value::Ref(obj)]).unwrap(),
        Some(Value::Int(22))
    );
}

#[test]
fn small_static_helpers_inline_into_the_caller() {
    let spec = ClassSpec {
        name: "inl/T",
        pool: vec![PoolSpec::Method("inl/T", "add", "(II)I")],
        methods: vec![
            trivial_init(),
            MethodSpec::new("add", "(II)I", vec![ILOAD_0, ILOAD_1, IADD, IRETURN])
                .public_static(),
            MethodSpec::new(
                "sum",
                "()I",
                vec![BIPUSH, 3, BIPUSH, 4, INVOKESTATIC, 0, 1, IRETURN],
            )
            .public_static(),
        ],
        ..ClassSpec::default()
    };
    let vm = vm_with(vec![class_fn(spec)]);
    let class = vm.resolve_class_by_name(BOOT_LOADER, "inl/T").unwrap();
    assert_eq!(
        call_static(&vm, class, "sum", "()I", &[]).unwrap(),
        Some(Value::Int(7))
    );
}

#[test]
fn math_calls_lower_to_intrinsics() {
    let spec = ClassSpec {
        name: "math/T",
        pool: vec![PoolSpec::Method("java/lang/Math", "sqrt", "(D)D")],
        methods: vec![
            trivial_init(),
            MethodSpec::new(
                "root",
                "(D)D",
                vec![0x26 /* dload_0 */, INVOKESTATIC, 0, 1, DRETURN],
            )
            .public_static(),
        ],
        ..ClassSpec::default()
    };
    let vm = vm_with(vec![class_fn(spec)]);
    let class = vm.resolve_class_by_name(BOOT_LOADER, "math/T").unwrap();
    assert_eq!(
        call_static(&vm, class, "root", "(D)D", &[Value::Double(9.0)]).unwrap(),
        Some(Value::Double(3.0))
    );
}

#[test]
fn string_constants_intern() {
    let spec = ClassSpec {
        name: "str/T",
        pool: vec![PoolSpec::Str("hello")],
        methods: vec![
            trivial_init(),
            MethodSpec::new("s", "()Ljava/lang/String;", vec![LDC, 1, 0xb0 /* areturn */])
                .public_static(),
        ],
        ..ClassSpec::default()
    };
    let vm = vm_with(vec![class_fn(spec)]);
    let class = vm.resolve_class_by_name(BOOT_LOADER, "str/T").unwrap();
    let first = call_static(&vm, class, "s", "()Ljava/lang/String;", &[]).unwrap();
    let second = call_static(&vm, class, "s", "()Ljava/lang/String;", &[]).unwrap();
    assert_eq!(first, second);

    // intern(intern(s)) == intern(s).
    let sym = vm.interner().get_or_intern("other");
    let once = vm.intern_string(sym).unwrap();
    let twice = vm.intern_string(sym).unwrap();
    assert_eq!(once, twice);
}

#[test]
fn tight_loops_exit_at_the_next_safepoint_poll() {
    // Seed scenario 5: an endless loop leaves through the poll when another
    // thread interrupts it.
    let spec = ClassSpec {
        name: "spin/T",
        methods: vec![
            trivial_init(),
            MethodSpec::new("spin", "()V", vec![GOTO, 0, 0]).public_static(),
        ],
        ..ClassSpec::default()
    };
    let vm = vm_with(vec![class_fn(spec)]);
    let class = vm.resolve_class_by_name(BOOT_LOADER, "spin/T").unwrap();
    let method = static_method(&vm, class, "spin", "()V");

    let runner = vm.threads.attach();
    let handle = {
        let vm = vm.clone();
        let runner = runner.clone();
        std::thread::spawn(move || vm.engine.call_method(&vm, &runner, method, &[]))
    };
    while runner.frame_count() == 0 {
        std::thread::yield_now();
    }
    runner.interrupt();
    let error = handle.join().unwrap().unwrap_err();
    assert_eq!(
        thrown_class_name(&vm, error),
        "java/lang/InterruptedException"
    );
}

#[test]
fn call_buf_round_trips_every_argument_shape() {
    // Signature parse → lower → pack → unpack preserves the values.
    let spec = ClassSpec {
        name: "buf/T",
        methods: vec![
            trivial_init(),
            MethodSpec::new(
                "sum",
                "(IJD)D",
                vec![ILOAD_0, I2D, LLOAD_1, L2D, DADD, DLOAD_3, DADD, DRETURN],
            )
            .public_static(),
        ],
        ..ClassSpec::default()
    };
    let vm = vm_with(vec![class_fn(spec)]);
    let class = vm.resolve_class_by_name(BOOT_LOADER, "buf/T").unwrap();
    let method = static_method(&vm, class, "sum", "(IJD)D");
    let thread = vm.threads.attach();

    let code = vm.jit.materialise(&vm, method).unwrap();
    let (sig, desc) = {
        let registry = vm.registry_read();
        let m = registry.get_method(method);
        (m.signature(), registry.get_signature(m.signature()).clone())
    };
    let buf_fn = vm.lowerer.static_buf(&vm, sig).unwrap();
    let args = [Value::Int(7), Value::Long(100), Value::Double(0.5)];
    let buf = vmkit_runtime::lower::pack_args(&vm, &desc, &args).unwrap();
    let result = vm
        .engine
        .call_function(
            &vm,
            &thread,
            buf_fn,
            &[
                Value::Long(0),
                Value::Long(i64::from(code.raw())),
                Value::NULL,
                Value::Ref(buf),
            ],
        )
        .unwrap();
    assert_eq!(result, Some(Value::Double(107.5)));
}

#[test]
fn resolution_stubs_tail_call_their_target() {
    let spec = ClassSpec {
        name: "stub/T",
        methods: vec![
            trivial_init(),
            MethodSpec::new("forty", "()I", vec![BIPUSH, 40, IRETURN]).public_static(),
        ],
        ..ClassSpec::default()
    };
    let vm = vm_with(vec![class_fn(spec)]);
    let class = vm.resolve_class_by_name(BOOT_LOADER, "stub/T").unwrap();
    let method = static_method(&vm, class, "forty", "()I");
    let thread = vm.threads.attach();

    let sig = vm.registry_read().get_method(method).signature();
    let stub = vm.lowerer.static_stub(&vm, sig).unwrap();
    let result = vm
        .engine
        .call_function(
            &vm,
            &thread,
            stub,
            &[Value::Long(i64::from(method.raw()))],
        )
        .unwrap();
    assert_eq!(result, Some(Value::Int(40)));
}
