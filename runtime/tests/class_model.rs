//! Class-model invariants: layout, display, subtype tests, lookup, and the
//! initialisation state machine.

mod common;

use common::op::*;
use common::{ClassSpec, MethodSpec, PoolSpec, class_fn, trivial_init, vm_with};
use vmkit_runtime::bytecode::FieldFlags;
use vmkit_runtime::heap::OBJECT_HEADER_SIZE;
use vmkit_runtime::keys::{FieldKey, MethodKey};
use vmkit_runtime::rt::ClassState;
use vmkit_runtime::rt::registry::BOOT_LOADER;
use vmkit_runtime::rt::vtable::DISPLAY_LEN;
use vmkit_runtime::VmError;

fn point_class() -> ClassSpec {
    ClassSpec {
        name: "geo/Point",
        fields: vec![
            ("x", "I", FieldFlags::PUBLIC),
            ("y", "I", FieldFlags::PUBLIC),
            ("tag", "B", FieldFlags::PUBLIC),
        ],
        methods: vec![trivial_init()],
        ..ClassSpec::default()
    }
}

fn point3_class() -> ClassSpec {
    ClassSpec {
        name: "geo/Point3",
        super_name: "geo/Point",
        fields: vec![("z", "D", FieldFlags::PUBLIC)],
        methods: vec![trivial_init()],
        ..ClassSpec::default()
    }
}

#[test]
fn field_offsets_stay_inside_the_instance_and_match_the_parent() {
    let vm = vm_with(vec![class_fn(point_class()), class_fn(point3_class())]);
    let parent = vm.resolve_class_by_name(BOOT_LOADER, "geo/Point").unwrap();
    let child = vm.resolve_class_by_name(BOOT_LOADER, "geo/Point3").unwrap();

    let registry = vm.registry_read();
    let parent_class = registry.get_class(parent).as_instance().unwrap();
    let child_class = registry.get_class(child).as_instance().unwrap();

    let parent_size = parent_class.instance_size().unwrap();
    assert!(parent_size > OBJECT_HEADER_SIZE);
    for field in parent_class.instance_fields().unwrap() {
        assert!(field.offset < parent_size);
        assert!(field.offset >= OBJECT_HEADER_SIZE);
    }

    // Inherited fields first, at the offsets the parent assigned them.
    let child_size = child_class.instance_size().unwrap();
    for parent_field in parent_class.instance_fields().unwrap() {
        let key = FieldKey {
            name: parent_field.name,
            desc: parent_field.desc,
        };
        let inherited = child_class.instance_field(&key).unwrap();
        assert_eq!(inherited.offset, parent_field.offset);
    }
    for field in child_class.instance_fields().unwrap() {
        assert!(field.offset < child_size);
    }

    // The double field is naturally aligned.
    let z = child_class
        .instance_field(&FieldKey {
            name: vm.interner().get_or_intern("z"),
            desc: vm.interner().get_or_intern("D"),
        })
        .unwrap();
    assert_eq!(z.offset % 8, 0);
}

#[test]
fn display_holds_every_ancestor_at_its_depth() {
    let vm = vm_with(vec![class_fn(point_class()), class_fn(point3_class())]);
    let object = vm
        .resolve_class_by_name(BOOT_LOADER, "java/lang/Object")
        .unwrap();
    let parent = vm.resolve_class_by_name(BOOT_LOADER, "geo/Point").unwrap();
    let child = vm.resolve_class_by_name(BOOT_LOADER, "geo/Point3").unwrap();

    let registry = vm.registry_read();
    let child_vt = registry.get_class(child).vt().unwrap();
    assert!((child_vt.depth as usize) < DISPLAY_LEN);
    assert_eq!(child_vt.depth, 2);
    // C.display[depth(C)] == C and for every ancestor A,
    // C.display[depth(A)] == A.
    assert_eq!(child_vt.display[2], Some(child));
    assert_eq!(child_vt.display[1], Some(parent));
    assert_eq!(child_vt.display[0], Some(object));
    assert_eq!(child_vt.display_offset, 2);
}

#[test]
fn sub_class_of_is_reflexive_transitive_antisymmetric() {
    let vm = vm_with(vec![class_fn(point_class()), class_fn(point3_class())]);
    let object = vm
        .resolve_class_by_name(BOOT_LOADER, "java/lang/Object")
        .unwrap();
    let parent = vm.resolve_class_by_name(BOOT_LOADER, "geo/Point").unwrap();
    let child = vm.resolve_class_by_name(BOOT_LOADER, "geo/Point3").unwrap();

    let registry = vm.registry_read();
    for id in [object, parent, child] {
        assert!(registry.sub_class_of(id, id));
    }
    assert!(registry.sub_class_of(child, parent));
    assert!(registry.sub_class_of(parent, object));
    assert!(registry.sub_class_of(child, object));
    // Antisymmetry: the reverse directions fail.
    assert!(!registry.sub_class_of(parent, child));
    assert!(!registry.sub_class_of(object, child));
}

#[test]
fn array_covariance_is_reference_only() {
    let vm = vm_with(vec![class_fn(point_class()), class_fn(point3_class())]);
    vm.resolve_class_by_name(BOOT_LOADER, "geo/Point").unwrap();
    vm.resolve_class_by_name(BOOT_LOADER, "geo/Point3").unwrap();

    let int_array = vm.resolve_class_by_name(BOOT_LOADER, "[I").unwrap();
    let long_array = vm.resolve_class_by_name(BOOT_LOADER, "[J").unwrap();
    let point_array = vm.resolve_class_by_name(BOOT_LOADER, "[Lgeo/Point;").unwrap();
    let point3_array = vm
        .resolve_class_by_name(BOOT_LOADER, "[Lgeo/Point3;")
        .unwrap();
    let object = vm
        .resolve_class_by_name(BOOT_LOADER, "java/lang/Object")
        .unwrap();

    let registry = vm.registry_read();
    // Primitive arrays are invariant.
    assert!(registry.assignable_from(int_array, int_array));
    assert!(!registry.assignable_from(long_array, int_array));
    // T[] assignable to U[] iff T assignable to U.
    assert!(registry.assignable_from(point_array, point3_array));
    assert!(!registry.assignable_from(point3_array, point_array));
    // Arrays are objects.
    assert!(registry.assignable_from(object, int_array));
}

#[test]
fn method_lookup_walks_declared_then_supers_then_interfaces() {
    let vm = vm_with(vec![
        class_fn(ClassSpec {
            name: "walk/Base",
            methods: vec![
                trivial_init(),
                MethodSpec::new("m", "()I", vec![ICONST_1, IRETURN]),
            ],
            ..ClassSpec::default()
        }),
        class_fn(ClassSpec {
            name: "walk/Derived",
            super_name: "walk/Base",
            methods: vec![trivial_init()],
            ..ClassSpec::default()
        }),
    ]);
    let base = vm.resolve_class_by_name(BOOT_LOADER, "walk/Base").unwrap();
    let derived = vm.resolve_class_by_name(BOOT_LOADER, "walk/Derived").unwrap();

    let registry = vm.registry_read();
    let key = MethodKey {
        name: vm.interner().get_or_intern("m"),
        desc: vm.interner().get_or_intern("()I"),
    };
    let found_on_base = registry.lookup_method(base, key, false, true).unwrap();
    let found_on_derived = registry.lookup_method(derived, key, false, true).unwrap();
    assert_eq!(found_on_base, found_on_derived);

    let missing = MethodKey {
        name: vm.interner().get_or_intern("absent"),
        desc: vm.interner().get_or_intern("()V"),
    };
    assert!(matches!(
        registry.lookup_method(derived, missing, false, true),
        Err(VmError::Exception(_))
    ));
    assert_eq!(
        registry.lookup_method(derived, missing, false, false).unwrap(),
        None
    );
}

#[test]
fn overriding_replaces_the_parent_slot() {
    let vm = vm_with(vec![
        class_fn(ClassSpec {
            name: "ovr/A",
            methods: vec![
                trivial_init(),
                MethodSpec::new("m", "()I", vec![ICONST_1, IRETURN]),
            ],
            ..ClassSpec::default()
        }),
        class_fn(ClassSpec {
            name: "ovr/B",
            super_name: "ovr/A",
            methods: vec![
                trivial_init(),
                MethodSpec::new("m", "()I", vec![ICONST_2, IRETURN]),
            ],
            ..ClassSpec::default()
        }),
    ]);
    let a = vm.resolve_class_by_name(BOOT_LOADER, "ovr/A").unwrap();
    let b = vm.resolve_class_by_name(BOOT_LOADER, "ovr/B").unwrap();

    let registry = vm.registry_read();
    let key = MethodKey {
        name: vm.interner().get_or_intern("m"),
        desc: vm.interner().get_or_intern("()I"),
    };
    let a_class = registry.get_class(a).as_instance().unwrap();
    let b_class = registry.get_class(b).as_instance().unwrap();
    let a_slot = a_class.vt_slot(&key).unwrap();
    let b_slot = b_class.vt_slot(&key).unwrap();
    // Same slot, different implementation.
    assert_eq!(a_slot, b_slot);
    assert_ne!(a_class.vt_method(&key), b_class.vt_method(&key));
}

#[test]
fn class_initialiser_runs_once_and_failures_are_sticky() {
    // ok/C: static { x = x + 1 }; boom/D: static { 1 / 0 }.
    let ok = ClassSpec {
        name: "init/C",
        fields: vec![("x", "I", FieldFlags::PUBLIC | FieldFlags::STATIC)],
        pool: vec![PoolSpec::Field("init/C", "x", "I")],
        methods: vec![
            trivial_init(),
            MethodSpec::new(
                "<clinit>",
                "()V",
                vec![
                    GETSTATIC, 0, 1, //
                    ICONST_1, IADD, //
                    PUTSTATIC, 0, 1, //
                    RETURN,
                ],
            )
            .public_static(),
            MethodSpec::new("get", "()I", vec![GETSTATIC, 0, 1, IRETURN]).public_static(),
        ],
        ..ClassSpec::default()
    };
    let boom = ClassSpec {
        name: "init/D",
        methods: vec![
            trivial_init(),
            MethodSpec::new(
                "<clinit>",
                "()V",
                vec![ICONST_1, ICONST_0, IDIV, ICONST_0, IADD, RETURN],
            )
            .public_static(),
        ],
        ..ClassSpec::default()
    };
    let vm = vm_with(vec![class_fn(ok), class_fn(boom)]);
    let thread = vm.threads.attach();

    let c = vm.resolve_class_by_name(BOOT_LOADER, "init/C").unwrap();
    assert_eq!(vm.class_state(c), Some(ClassState::Resolved));
    vmkit_runtime::support::initialise_class(&vm, &thread, c).unwrap();
    assert_eq!(vm.class_state(c), Some(ClassState::Ready));
    // Re-initialisation is a no-op: x stays 1.
    vmkit_runtime::support::initialise_class(&vm, &thread, c).unwrap();

    let registry = vm.registry_read();
    let get = registry
        .lookup_method(
            c,
            MethodKey {
                name: vm.interner().get_or_intern("get"),
                desc: vm.interner().get_or_intern("()I"),
            },
            true,
            true,
        )
        .unwrap()
        .unwrap();
    drop(registry);
    let result = vm
        .engine
        .call_method(&vm, &thread, get, &[])
        .unwrap()
        .unwrap();
    assert_eq!(result, vmkit_runtime::Value::Int(1));

    // The failing initialiser marks the class Erroneous, and the stored
    // error is re-raised on every later use.
    let d = vm.resolve_class_by_name(BOOT_LOADER, "init/D").unwrap();
    assert!(vmkit_runtime::support::initialise_class(&vm, &thread, d).is_err());
    assert_eq!(vm.class_state(d), Some(ClassState::Erroneous));
    assert!(vmkit_runtime::support::initialise_class(&vm, &thread, d).is_err());
}

#[test]
fn concurrent_initialisation_runs_the_initialiser_once() {
    // Seed scenario 2: two threads racing to read a lazily initialised
    // static observe the same value and the initialiser runs once.
    let spec = ClassSpec {
        name: "race/C",
        fields: vec![("x", "I", FieldFlags::PUBLIC | FieldFlags::STATIC)],
        pool: vec![PoolSpec::Field("race/C", "x", "I")],
        methods: vec![
            trivial_init(),
            MethodSpec::new(
                "<clinit>",
                "()V",
                vec![
                    GETSTATIC, 0, 1, //
                    ICONST_1, IADD, //
                    PUTSTATIC, 0, 1, //
                    RETURN,
                ],
            )
            .public_static(),
            MethodSpec::new("get", "()I", vec![GETSTATIC, 0, 1, IRETURN]).public_static(),
        ],
        ..ClassSpec::default()
    };
    let vm = vm_with(vec![class_fn(spec)]);
    let c = vm.resolve_class_by_name(BOOT_LOADER, "race/C").unwrap();
    let get = {
        let registry = vm.registry_read();
        registry
            .lookup_method(
                c,
                MethodKey {
                    name: vm.interner().get_or_intern("get"),
                    desc: vm.interner().get_or_intern("()I"),
                },
                true,
                true,
            )
            .unwrap()
            .unwrap()
    };

    let mut handles = Vec::new();
    for _ in 0..2 {
        let vm = vm.clone();
        handles.push(std::thread::spawn(move || {
            let thread = vm.threads.attach();
            vmkit_runtime::support::initialise_class(&vm, &thread, c).unwrap();
            vm.engine
                .call_method(&vm, &thread, get, &[])
                .unwrap()
                .unwrap()
        }));
    }
    for handle in handles {
        assert_eq!(handle.join().unwrap(), vmkit_runtime::Value::Int(1));
    }
}

#[test]
fn lifecycle_walks_the_linear_states() {
    let vm = vm_with(vec![class_fn(point_class())]);
    let thread = vm.threads.attach();
    let loaded = {
        let mut registry = vm.registry_write();
        let sym = vm.interner().get_or_intern("geo/Point");
        registry.get_or_load(BOOT_LOADER, sym).unwrap()
    };
    assert_eq!(vm.class_state(loaded), Some(ClassState::Loaded));
    vm.resolve_existing(loaded).unwrap();
    assert_eq!(vm.class_state(loaded), Some(ClassState::Resolved));
    vmkit_runtime::support::initialise_class(&vm, &thread, loaded).unwrap();
    assert_eq!(vm.class_state(loaded), Some(ClassState::Ready));
}
