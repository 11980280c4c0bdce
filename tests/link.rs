//! End-to-end linking tests over the public API: fragments in, one
//! assembled module out.

use wld::error::LinkError;
use wld::fragment::{BuiltinSymbols, Fragment};
use wld::ir::{
    ArrayDecl, ElemWidth, ExportKind, FieldDecl, FuncType, Function, HeapType, Instr, Module,
    StructDecl, Tag, TypeDecl, TypeRef, TypeUse, ValType,
};
use wld::linker::{link, LinkOptions};

fn struct_decl(name: &str, refs: &[&str]) -> TypeDecl {
    TypeDecl::Struct(StructDecl {
        name: name.to_string(),
        fields: refs
            .iter()
            .map(|r| FieldDecl {
                name: format!("ref_{r}"),
                ty: ValType::nullable_ref(HeapType::Type(TypeRef::Named((*r).into()))),
                mutable: false,
            })
            .collect(),
        super_type: None,
        is_final: false,
    })
}

fn void_func(frag: &mut Fragment, name: &str) -> Function {
    Function::Defined {
        name: name.to_string(),
        ty: TypeUse::Sym(frag.reference_func_type("sig.v")),
        locals: vec![],
        body: vec![Instr::Return],
    }
}

fn define_void(frag: &mut Fragment, id: &str, name: &str) {
    let f = void_func(frag, name);
    frag.define_function(id, f).unwrap();
}

/// The runtime-support fragment every full link needs: base classes, the
/// string constructor, and the module-descriptor registration hook.
fn std_fragment() -> Fragment {
    let mut std = Fragment::new("std.src");
    std.class_types
        .define("std.Any".into(), struct_decl("Any", &[]))
        .unwrap();
    std.class_types
        .define("std.Exception".into(), struct_decl("Exception", &[]))
        .unwrap();
    std.class_types
        .define("std.String".into(), struct_decl("String", &[]))
        .unwrap();
    std.class_types
        .define(
            "std.CharArray".into(),
            TypeDecl::Array(ArrayDecl {
                name: "CharArray".to_string(),
                field: FieldDecl {
                    name: String::new(),
                    ty: ValType::I16,
                    mutable: true,
                },
            }),
        )
        .unwrap();
    std.func_types
        .define("sig.v".into(), FuncType::new(vec![], vec![]))
        .unwrap();
    std.func_types
        .define(
            "sig.createString".into(),
            FuncType::new(
                vec![ValType::nullable_ref(HeapType::Type(TypeRef::Named(
                    "std.CharArray".into(),
                )))],
                vec![ValType::nullable_ref(HeapType::Type(TypeRef::Named(
                    "std.String".into(),
                )))],
            ),
        )
        .unwrap();
    let ty = TypeUse::Sym(std.reference_func_type("sig.createString"));
    std.define_function(
        "std.createString",
        Function::Defined {
            name: "createString".to_string(),
            ty,
            locals: vec![],
            body: vec![Instr::Return],
        },
    )
    .unwrap();
    define_void(&mut std, "std.registerModuleDescriptor", "registerModuleDescriptor");
    std.builtins = Some(BuiltinSymbols {
        base_any: Some("std.Any".into()),
        base_exception: Some("std.Exception".into()),
        register_module_descriptor: Some("std.registerModuleDescriptor".into()),
        create_string: Some("std.createString".into()),
        ..BuiltinSymbols::default()
    });
    std
}

fn func_name(module: &Module, index: u32) -> &str {
    let imports = module.imported_functions.len() as u32;
    if index < imports {
        module.imported_functions[index as usize].name()
    } else {
        module.functions[(index - imports) as usize].name()
    }
}

fn exported_func_name<'a>(module: &'a Module, export: &str) -> &'a str {
    module
        .exports
        .iter()
        .find_map(|e| match (e.name == export, e.kind) {
            (true, ExportKind::Func(index)) => Some(func_name(module, index)),
            _ => None,
        })
        .unwrap_or_else(|| panic!("no function export named {export}"))
}

#[test]
fn linking_is_deterministic() {
    let make = || {
        let mut a = Fragment::new("a.src");
        define_void(&mut a, "a.main", "main");
        a.export_function("main", "a.main");
        a.reference_string("hello");
        vec![std_fragment(), a]
    };
    let first = link(make(), LinkOptions::default()).unwrap();
    let second = link(make(), LinkOptions::default()).unwrap();
    assert_eq!(first, second);
}

#[test]
fn references_resolve_regardless_of_which_fragment_defines() {
    // The same program with `shared.helper` defined in either fragment.
    let build = |define_in_first: bool| {
        let mut a = Fragment::new("a.src");
        let cell = a.reference_function("shared.helper");
        let ty = TypeUse::Sym(a.reference_func_type("sig.v"));
        a.define_function(
            "a.main",
            Function::Defined {
                name: "main".to_string(),
                ty,
                locals: vec![],
                body: vec![Instr::Call(wld::ir::FuncUse::Sym(cell)), Instr::Return],
            },
        )
        .unwrap();
        a.export_function("main", "a.main");
        let mut b = Fragment::new("b.src");
        if define_in_first {
            define_void(&mut a, "shared.helper", "helper");
        } else {
            define_void(&mut b, "shared.helper", "helper");
        }
        vec![std_fragment(), a, b]
    };
    let here = link(build(true), LinkOptions::default()).unwrap();
    let there = link(build(false), LinkOptions::default()).unwrap();
    assert_eq!(exported_func_name(&here, "main"), "main");
    assert_eq!(exported_func_name(&there, "main"), "main");
}

#[test]
fn mutually_referencing_fragments_resolve() {
    let mut a = Fragment::new("a.src");
    let to_bar = a.reference_function("b.bar");
    let ty = TypeUse::Sym(a.reference_func_type("sig.v"));
    a.define_function(
        "a.foo",
        Function::Defined {
            name: "foo".to_string(),
            ty,
            locals: vec![],
            body: vec![Instr::Call(wld::ir::FuncUse::Sym(to_bar)), Instr::Return],
        },
    )
    .unwrap();

    let mut b = Fragment::new("b.src");
    let to_foo = b.reference_function("a.foo");
    let ty = TypeUse::Sym(b.reference_func_type("sig.v"));
    b.define_function(
        "b.bar",
        Function::Defined {
            name: "bar".to_string(),
            ty,
            locals: vec![],
            body: vec![Instr::Call(wld::ir::FuncUse::Sym(to_foo)), Instr::Return],
        },
    )
    .unwrap();

    let module = link(vec![std_fragment(), a, b], LinkOptions::default()).unwrap();
    let names: Vec<&str> = module.functions.iter().map(Function::name).collect();
    assert!(names.contains(&"foo") && names.contains(&"bar"));
}

#[test]
fn unresolved_symbol_fails_the_link() {
    let mut a = Fragment::new("a.src");
    a.reference_function("nowhere.x");
    let err = link(vec![a], LinkOptions::default()).unwrap_err();
    assert!(matches!(err, LinkError::UnresolvedSymbol(id) if id.as_str() == "nowhere.x"));
}

#[test]
fn duplicate_definition_fails_the_link() {
    let mut a = Fragment::new("a.src");
    define_void(&mut a, "pkg.foo", "foo");
    let mut b = Fragment::new("b.src");
    define_void(&mut b, "pkg.foo", "foo");
    let err = link(vec![a, b], LinkOptions::default()).unwrap_err();
    assert!(matches!(err, LinkError::DuplicateDefinition(id) if id.as_str() == "pkg.foo"));
}

#[test]
fn structurally_equal_signatures_collapse() {
    let mut a = Fragment::new("a.src");
    a.func_types
        .define(
            "sig.intToInt".into(),
            FuncType::new(vec![ValType::I32], vec![ValType::I32]),
        )
        .unwrap();
    let mut b = Fragment::new("b.src");
    b.func_types
        .define(
            "sig.i2i".into(),
            FuncType::new(vec![ValType::I32], vec![ValType::I32]),
        )
        .unwrap();

    let module = link(vec![std_fragment(), a, b], LinkOptions::default()).unwrap();
    let shape = FuncType::new(vec![ValType::I32], vec![ValType::I32]);
    let copies = module
        .rec_groups
        .iter()
        .flatten()
        .filter(|decl| match decl {
            TypeDecl::Func(ft) => *ft == shape,
            _ => false,
        })
        .count();
    assert_eq!(copies, 1);
}

#[test]
fn equivalent_adapters_keep_only_the_first_copy() {
    let mut a = Fragment::new("a.src");
    define_void(&mut a, "a.adapter", "adapter_a");
    a.equivalent_functions
        .push(("shape:v->v".to_string(), "a.adapter".into()));

    let mut b = Fragment::new("b.src");
    define_void(&mut b, "b.adapter", "adapter_b");
    b.equivalent_functions
        .push(("shape:v->v".to_string(), "b.adapter".into()));
    b.export_function("adapter", "b.adapter");

    let module = link(vec![std_fragment(), a, b], LinkOptions::default()).unwrap();
    let names: Vec<&str> = module.functions.iter().map(Function::name).collect();
    assert!(names.contains(&"adapter_a"));
    assert!(!names.contains(&"adapter_b"));
    // The duplicate's export was removed together with the definition.
    assert!(module.exports.iter().all(|e| e.name != "adapter"));
}

#[test]
fn string_literals_pool_across_fragments() {
    let mut a = Fragment::new("a.src");
    let (a_addr, a_pool) = a.reference_string("abc");
    let ty = TypeUse::Sym(a.reference_func_type("sig.v"));
    a.define_function(
        "a.lit",
        Function::Defined {
            name: "lit_a".to_string(),
            ty,
            locals: vec![],
            body: vec![
                Instr::StringAddress(a_addr),
                Instr::StringPoolId(a_pool),
                Instr::Return,
            ],
        },
    )
    .unwrap();

    let mut b = Fragment::new("b.src");
    let (b_addr, b_pool) = b.reference_string("abc");
    let ty = TypeUse::Sym(b.reference_func_type("sig.v"));
    b.define_function(
        "b.lit",
        Function::Defined {
            name: "lit_b".to_string(),
            ty,
            locals: vec![],
            body: vec![
                Instr::StringAddress(b_addr),
                Instr::StringPoolId(b_pool),
                Instr::Return,
            ],
        },
    )
    .unwrap();

    let module = link(vec![std_fragment(), a, b], LinkOptions::default()).unwrap();
    // One copy of "abc" as UTF-16LE in segment 0.
    assert_eq!(module.data[0].bytes.len(), 6);
    let body_of = |name: &str| {
        module
            .functions
            .iter()
            .find_map(|f| match f {
                Function::Defined { name: n, body, .. } if n == name => Some(body.clone()),
                _ => None,
            })
            .unwrap()
    };
    let expected = vec![Instr::I32Const(0), Instr::I32Const(0), Instr::Return];
    assert_eq!(body_of("lit_a"), expected);
    assert_eq!(body_of("lit_b"), expected);
}

#[test]
fn const_arrays_get_their_own_segments() {
    let mut a = Fragment::new("a.src");
    a.reference_const_array(vec![7, 8], ElemWidth::W4);
    let mut b = Fragment::new("b.src");
    b.reference_const_array(vec![7, 8], ElemWidth::W4);
    b.reference_const_array(vec![7, 8], ElemWidth::W1);

    let module = link(vec![std_fragment(), a, b], LinkOptions::default()).unwrap();
    // Segment 0 is string data; one segment per distinct (values, width).
    assert_eq!(module.data.len(), 3);
    assert_eq!(module.data[1].bytes, vec![7, 0, 0, 0, 8, 0, 0, 0]);
    assert_eq!(module.data[2].bytes, vec![7, 8]);
}

#[test]
fn recursive_classes_share_a_group_and_lone_arrays_stand_alone() {
    let mut a = Fragment::new("a.src");
    a.class_types
        .define("pkg.A".into(), struct_decl("A", &["pkg.B"]))
        .unwrap();
    a.class_types
        .define(
            "pkg.IntBox".into(),
            TypeDecl::Array(ArrayDecl {
                name: "IntBox".to_string(),
                field: FieldDecl {
                    name: String::new(),
                    ty: ValType::I32,
                    mutable: true,
                },
            }),
        )
        .unwrap();
    let mut b = Fragment::new("b.src");
    b.class_types
        .define("pkg.B".into(), struct_decl("B", &["pkg.C"]))
        .unwrap();
    b.class_types
        .define("pkg.C".into(), struct_decl("C", &["pkg.A"]))
        .unwrap();

    let module = link(vec![std_fragment(), a, b], LinkOptions::default()).unwrap();
    let group_names: Vec<Vec<&str>> = module
        .rec_groups
        .iter()
        .map(|g| g.iter().map(TypeDecl::name).collect())
        .collect();
    let cycle = group_names
        .iter()
        .find(|g| g.contains(&"A"))
        .expect("group holding A");
    assert!(cycle.contains(&"B") && cycle.contains(&"C"));
    assert!(cycle.iter().any(|n| n.starts_with("cycle_marker_")));
    assert!(group_names.contains(&vec!["IntBox"]));
}

#[test]
fn service_functions_are_exported_under_fixed_names() {
    let mut a = Fragment::new("a.src");
    define_void(&mut a, "a.mainWrapper", "mainWrapper");
    a.init_wrappers.push("a.mainWrapper".into());

    let module = link(vec![std_fragment(), a], LinkOptions::default()).unwrap();
    assert_eq!(exported_func_name(&module, "_initialize"), "_initialize");
    assert_eq!(exported_func_name(&module, "_fieldInitialize"), "_fieldInitialize");
    assert_eq!(
        exported_func_name(&module, "_associatedObjectGetter"),
        "_associatedObjectGetter"
    );
    assert!(module
        .exports
        .iter()
        .any(|e| e.name == "memory" && matches!(e.kind, ExportKind::Memory(0))));
    // No fragment registered a test runner, so there is no test entry.
    assert!(module.exports.iter().all(|e| e.name != "startUnitTests"));
}

#[test]
fn test_entry_appears_only_with_a_root_suite_runner() {
    let mut std = std_fragment();
    define_void(&mut std, "std.runRootSuites", "runRootSuites");
    std.builtins.as_mut().unwrap().run_root_suites = Some("std.runRootSuites".into());

    let mut a = Fragment::new("a.src");
    define_void(&mut a, "a.declareSuites", "declareSuites");
    a.test_declarators.push("a.declareSuites".into());

    let module = link(vec![std, a], LinkOptions::default()).unwrap();
    assert_eq!(exported_func_name(&module, "startUnitTests"), "startUnitTests");
}

#[test]
fn exception_tag_follows_the_host_flags() {
    let defaults = link(vec![std_fragment()], LinkOptions::default()).unwrap();
    assert_eq!(defaults.tags.len(), 1);
    assert!(defaults.imported_tags.is_empty());

    let js = link(
        vec![std_fragment()],
        LinkOptions { js_host: true, ..LinkOptions::default() },
    )
    .unwrap();
    assert!(js.tags.is_empty());
    assert_eq!(js.imported_tags.len(), 1);
    assert_eq!(
        js.imported_tags[0].import.as_ref().unwrap().module,
        "intrinsics"
    );

    let traps = link(
        vec![std_fragment()],
        LinkOptions { trap_exceptions: true, ..LinkOptions::default() },
    )
    .unwrap();
    assert!(traps.tags.is_empty() && traps.imported_tags.is_empty());
}

#[test]
fn at_most_one_exception_tag_survives_collection() {
    let tagged = |name: &str| {
        let mut frag = Fragment::new(name);
        let ty = TypeUse::Sym(frag.reference_func_type("sig.v"));
        frag.tags.push(Tag { ty, import: None });
        frag
    };

    // A single fragment-contributed tag links and carries through.
    let module = link(
        vec![std_fragment(), tagged("a.src")],
        LinkOptions { trap_exceptions: true, ..LinkOptions::default() },
    )
    .unwrap();
    assert_eq!(module.tags.len(), 1);

    // Two contributing fragments exceed the target's limit.
    let err = link(
        vec![std_fragment(), tagged("a.src"), tagged("b.src")],
        LinkOptions { trap_exceptions: true, ..LinkOptions::default() },
    )
    .unwrap_err();
    assert!(matches!(err, LinkError::TooManyExceptionTags));

    // So does a fragment tag on top of the synthesized one.
    let err = link(
        vec![std_fragment(), tagged("a.src")],
        LinkOptions::default(),
    )
    .unwrap_err();
    assert!(matches!(err, LinkError::TooManyExceptionTags));
}

#[test]
fn fragment_order_moves_pool_slots_but_not_content() {
    let lit_fragment = |frag_name: &str, fn_id: &str, fn_name: &str, literal: &str| {
        let mut frag = Fragment::new(frag_name);
        let (addr, pool) = frag.reference_string(literal);
        let ty = TypeUse::Sym(frag.reference_func_type("sig.v"));
        frag.define_function(
            fn_id,
            Function::Defined {
                name: fn_name.to_string(),
                ty,
                locals: vec![],
                body: vec![Instr::StringAddress(addr), Instr::StringPoolId(pool), Instr::Return],
            },
        )
        .unwrap();
        frag
    };
    let forward = link(
        vec![
            std_fragment(),
            lit_fragment("a.src", "a.lit", "lit_a", "aa"),
            lit_fragment("b.src", "b.lit", "lit_b", "bb"),
        ],
        LinkOptions::default(),
    )
    .unwrap();
    let reversed = link(
        vec![
            std_fragment(),
            lit_fragment("b.src", "b.lit", "lit_b", "bb"),
            lit_fragment("a.src", "a.lit", "lit_a", "aa"),
        ],
        LinkOptions::default(),
    )
    .unwrap();

    let slots = |module: &Module, fn_name: &str| {
        module
            .functions
            .iter()
            .find_map(|f| match f {
                Function::Defined { name, body, .. } if name == fn_name => match body.as_slice() {
                    [Instr::I32Const(addr), Instr::I32Const(pool), Instr::Return] => {
                        Some((*addr, *pool))
                    }
                    _ => None,
                },
                _ => None,
            })
            .unwrap()
    };
    // Permuting the input list reassigns pool addresses and ids only.
    assert_eq!(slots(&forward, "lit_a"), (0, 0));
    assert_eq!(slots(&forward, "lit_b"), (4, 1));
    assert_eq!(slots(&reversed, "lit_a"), (4, 1));
    assert_eq!(slots(&reversed, "lit_b"), (0, 0));
    // The pooled bytes are the same literals, reordered.
    assert_eq!(forward.data[0].bytes, b"a\0a\0b\0b\0");
    assert_eq!(reversed.data[0].bytes, b"b\0b\0a\0a\0");
}

#[test]
fn initializer_calls_wrappers_in_fragment_order() {
    let mut a = Fragment::new("a.src");
    define_void(&mut a, "a.first", "first");
    a.init_wrappers.push("a.first".into());
    let mut b = Fragment::new("b.src");
    define_void(&mut b, "b.second", "second");
    b.init_wrappers.push("b.second".into());

    let module = link(vec![std_fragment(), a, b], LinkOptions::default()).unwrap();
    let init_body = module
        .functions
        .iter()
        .find_map(|f| match f {
            Function::Defined { name, body, .. } if name == "_initialize" => Some(body),
            _ => None,
        })
        .unwrap();
    let call_targets: Vec<&str> = init_body
        .iter()
        .filter_map(|instr| match instr {
            Instr::Call(wld::ir::FuncUse::Func(fid)) => Some(func_name(&module, fid.0)),
            _ => None,
        })
        .collect();
    // registerModuleDescriptor, _fieldInitialize, then the wrappers.
    assert_eq!(
        call_targets,
        vec!["registerModuleDescriptor", "_fieldInitialize", "first", "second"]
    );
}

#[test]
fn foreign_import_names_are_made_unique() {
    let mut a = Fragment::new("a.src");
    let name_cell = a.add_ffi_bridge("a.alert", "host", "alert", "(m) => alert(m)");
    a.func_types
        .define("sig.ext".into(), FuncType::new(vec![], vec![]))
        .unwrap();
    let ty = TypeUse::Sym(a.reference_func_type("sig.ext"));
    a.define_function(
        "a.alert",
        Function::Imported {
            name: "alert".to_string(),
            ty,
            module: "host".to_string(),
            import_name: wld::ir::NameUse::Sym(name_cell),
        },
    )
    .unwrap();

    let mut b = Fragment::new("b.src");
    let name_cell = b.add_ffi_bridge("b.alert", "host", "alert", "(m) => console.log(m)");
    let ty = TypeUse::Sym(b.reference_func_type("sig.ext"));
    b.define_function(
        "b.alert",
        Function::Imported {
            name: "alert".to_string(),
            ty,
            module: "host".to_string(),
            import_name: wld::ir::NameUse::Sym(name_cell),
        },
    )
    .unwrap();

    let module = link(vec![std_fragment(), a, b], LinkOptions::default()).unwrap();
    let import_names: Vec<&str> = module
        .imported_functions
        .iter()
        .filter_map(|f| match f {
            Function::Imported { import_name: wld::ir::NameUse::Value(v), .. } => Some(v.as_str()),
            _ => None,
        })
        .collect();
    assert_eq!(import_names, vec!["alert", "alert_1"]);
    let glue_names: Vec<&str> = module.ffi_glue.iter().map(|g| g.import_name.as_str()).collect();
    assert_eq!(glue_names, vec!["alert", "alert_1"]);
}

#[test]
fn associated_object_dispatch_skips_removed_getters() {
    use wld::fragment::{AssociatedObject, ClassAssociatedObjects};

    let mut a = Fragment::new("a.src");
    define_void(&mut a, "a.getter", "getter");
    a.associated_objects.push(ClassAssociatedObjects {
        class_id: 77,
        objects: vec![
            AssociatedObject::new(1, "a.getter", false),
            AssociatedObject::new(2, "a.removedGetter", false),
        ],
    });

    let module = link(vec![std_fragment(), a], LinkOptions::default()).unwrap();
    let body = module
        .functions
        .iter()
        .find_map(|f| match f {
            Function::Defined { name, body, .. } if name == "_associatedObjectGetter" => Some(body),
            _ => None,
        })
        .unwrap();
    // One class comparison, one key comparison; the removed getter
    // contributes nothing.
    let key_compares = body
        .iter()
        .filter(|i| matches!(i, Instr::I64Const(k) if *k == 1 || *k == 2))
        .count();
    assert_eq!(key_compares, 1);
    assert!(body.contains(&Instr::I64Const(77)));
}
