//! Service code: linker-synthesized functions, globals, and types that no
//! single fragment owns.
//!
//! Everything here is stitched together from per-fragment contributions in
//! fragment order. The synthesized functions are exported under fixed
//! names (`_initialize`, `_fieldInitialize`, `_associatedObjectGetter`,
//! and `startUnitTests` when tests are present); hosts locate them by
//! those names with no further negotiation.

use indexmap::IndexMap;
use rustc_hash::FxHashMap;

use crate::error::{LinkError, LinkResult};
use crate::fragment::RttiGlobal;
use crate::ir::{
    ArrayDecl, DataUse, Export, ExportKind, FieldDecl, FuncId, FuncType, FuncUse, Function,
    Global, GlobalId, GlobalUse, HeapType, Instr, Local, StructDecl, TypeDecl, TypeId, TypeRef,
    TypeUse, ValType,
};
use crate::linker::{FuncEntry, GlobalEntry, Linker};
use crate::symbol::SymbolId;

/// Interface-dispatch slots reserved for well-known interfaces ahead of
/// the open-ended slot array.
const SPECIAL_SLOT_COUNT: usize = 4;

impl Linker {
    pub(crate) fn synthesize_service_code(&mut self) -> LinkResult<()> {
        let void_ty = self.push_additional_type(TypeDecl::Func(FuncType::new(vec![], vec![])));

        let field_init = self.create_field_initializer(void_ty)?;
        self.export_service("_fieldInitialize", field_init);

        let getter = self.create_associated_object_getter()?;
        self.export_service("_associatedObjectGetter", getter);

        let master_init = self.create_master_initializer(void_ty, field_init, getter)?;
        self.export_service("_initialize", master_init);

        self.create_string_literal_service()?;

        if let Some(start) = self.create_start_unit_tests(void_ty)? {
            self.export_service("startUnitTests", start);
        }
        Ok(())
    }

    fn export_service(&mut self, name: &str, fid: FuncId) {
        self.exports.push(Export {
            name: name.to_string(),
            kind: ExportKind::Func(fid.0),
        });
    }

    fn add_service_function(
        &mut self,
        name: &str,
        ty: TypeId,
        locals: Vec<Local>,
        body: Vec<Instr>,
    ) -> FuncId {
        let fid = FuncId(self.funcs.len() as u32);
        self.funcs.push(Some(FuncEntry {
            origin: None,
            func: Function::Defined {
                name: name.to_string(),
                ty: TypeUse::Type(ty),
                locals,
                body,
            },
        }));
        fid
    }

    /// Field initialization. Object-instance initializers are *prepended*
    /// per item, so the most recently visited fragment's instance
    /// initializers run first; non-constant top-level initializers are
    /// appended in fragment order. The asymmetry is deliberate and part
    /// of the observable init order.
    pub(crate) fn create_field_initializer(&mut self, void_ty: TypeId) -> LinkResult<FuncId> {
        let mut body: Vec<Instr> = Vec::new();
        for frag in &self.fragments {
            for id in &frag.instance_field_inits {
                // Instance initializers removed by upstream tree shaking
                // are skipped.
                if let Some(&fid) = self.func_defs.get(id) {
                    body.insert(0, Instr::Call(FuncUse::Func(fid)));
                }
            }
            for id in &frag.field_inits {
                let fid = self.func_defs.get(id).ok_or_else(|| {
                    LinkError::inconsistency(format!("missing field initializer {id}"))
                })?;
                body.push(Instr::Call(FuncUse::Func(*fid)));
            }
        }
        Ok(self.add_service_function("_fieldInitialize", void_ty, vec![], body))
    }

    /// Reflective associated-object dispatch: `(class id, key id)` to an
    /// optional object reference, as a flat chain of compare-and-call
    /// blocks over every fragment's contribution.
    fn create_associated_object_getter(&mut self) -> LinkResult<FuncId> {
        let base_any = self.require_builtin_type("base_any", |b| b.base_any.as_ref())?;
        let result_ty = ValType::nullable_ref(HeapType::Type(TypeRef::Type(base_any)));
        let getter_ty = self.push_additional_type(TypeDecl::Func(FuncType::new(
            vec![ValType::I64, ValType::I64],
            vec![result_ty],
        )));

        let contributions: Vec<_> = self
            .fragments
            .iter()
            .flat_map(|f| f.associated_objects.clone())
            .collect();

        let mut foreign_adapter: Option<FuncId> = None;
        let mut body: Vec<Instr> = Vec::new();
        for class in &contributions {
            body.push(Instr::LocalGet(0));
            body.push(Instr::I64Const(class.class_id));
            body.push(Instr::I64Eq);
            body.push(Instr::If);
            for object in &class.objects {
                let Some(&getter) = self.func_defs.get(&object.getter) else {
                    // Removed by upstream tree shaking together with the
                    // code that would have looked it up.
                    tracing::debug!(getter = %object.getter, "skipping removed getter");
                    continue;
                };
                body.push(Instr::LocalGet(1));
                body.push(Instr::I64Const(object.key_id));
                body.push(Instr::I64Eq);
                body.push(Instr::If);
                body.push(Instr::Call(FuncUse::Func(getter)));
                if object.external {
                    let adapter = match foreign_adapter {
                        Some(adapter) => adapter,
                        None => {
                            let adapter = self.require_builtin_func("foreign_adapter", |b| {
                                b.foreign_adapter.as_ref()
                            })?;
                            foreign_adapter = Some(adapter);
                            adapter
                        }
                    };
                    body.push(Instr::Call(FuncUse::Func(adapter)));
                }
                body.push(Instr::Return);
                body.push(Instr::End);
            }
            body.push(Instr::End);
        }
        body.push(Instr::RefNull(HeapType::None));
        body.push(Instr::Return);

        let fid = self.add_service_function("_associatedObjectGetter", getter_ty, vec![], body);
        // Referenced by ref.func from `_initialize`.
        self.elements.push(vec![fid]);
        Ok(fid)
    }

    fn create_master_initializer(
        &mut self,
        void_ty: TypeId,
        field_init: FuncId,
        getter: FuncId,
    ) -> LinkResult<FuncId> {
        let mut body: Vec<Instr> = Vec::new();
        if self.options.init_singletons {
            let singleton_init =
                self.require_builtin_func("singleton_init", |b| b.singleton_init.as_ref())?;
            body.push(Instr::Call(FuncUse::Func(singleton_init)));
        }

        let register = self.require_builtin_func("register_module_descriptor", |b| {
            b.register_module_descriptor.as_ref()
        })?;
        body.push(Instr::RefFunc(FuncUse::Func(getter)));
        body.push(Instr::Call(FuncUse::Func(register)));

        body.push(Instr::Call(FuncUse::Func(field_init)));

        for frag in &self.fragments {
            for wrapper in &frag.init_wrappers {
                let fid = self.func_defs.get(wrapper).ok_or_else(|| {
                    LinkError::inconsistency(format!("missing entry-point wrapper {wrapper}"))
                })?;
                body.push(Instr::Call(FuncUse::Func(*fid)));
            }
        }
        body.push(Instr::Return);
        Ok(self.add_service_function("_initialize", void_ty, vec![], body))
    }

    /// Lazy string materialization: a `_stringPool` cache global plus the
    /// `_stringLiteral(poolId, startAddress, length)` accessor that fills
    /// it on first use from the pooled character data in segment 0.
    fn create_string_literal_service(&mut self) -> LinkResult<()> {
        let create_string =
            self.require_builtin_func("create_string", |b| b.create_string.as_ref())?;
        let sig = self.resolved_func_type(create_string)?.clone();
        let string_ty = sig.results.first().cloned().ok_or_else(|| {
            LinkError::inconsistency("string constructor must return the string type")
        })?;
        let char_array_tid = match sig.params.first() {
            Some(ValType::Ref { heap: HeapType::Type(TypeRef::Type(tid)), .. }) => *tid,
            Some(ValType::Ref { heap: HeapType::Type(TypeRef::Named(id)), .. }) => {
                self.lookup_named_type(id)?
            }
            _ => {
                return Err(LinkError::inconsistency(
                    "string constructor must take a char array reference",
                ))
            }
        };

        let string_array_tid = self.push_additional_type(TypeDecl::Array(ArrayDecl {
            name: "string_array".to_string(),
            field: FieldDecl {
                name: "string".to_string(),
                ty: string_ty.clone(),
                mutable: true,
            },
        }));

        let pool_global = GlobalId(self.globals.len() as u32);
        self.globals.push(GlobalEntry {
            origin: None,
            global: Global {
                name: "_stringPool".to_string(),
                ty: ValType::non_null_ref(HeapType::Type(TypeRef::Type(string_array_tid))),
                mutable: false,
                init: vec![
                    Instr::I32Const(self.string_pool_size as i32),
                    Instr::ArrayNewDefault(TypeUse::Type(string_array_tid)),
                ],
                import: None,
            },
        });

        let literal_ty = self.push_additional_type(TypeDecl::Func(FuncType::new(
            vec![ValType::I32, ValType::I32, ValType::I32],
            vec![string_ty.clone()],
        )));

        // Params: 0 poolId, 1 startAddress, 2 length; local 3 caches the
        // freshly created string for both the pool store and the return.
        let body = vec![
            Instr::Block { result: Some(string_ty.clone()) },
            Instr::GlobalGet(GlobalUse::Global(pool_global)),
            Instr::LocalGet(0),
            Instr::ArrayGet(TypeUse::Type(string_array_tid)),
            Instr::BrOnNonNull(0),
            // Cache miss: build the string from the pooled UTF-16 data.
            Instr::GlobalGet(GlobalUse::Global(pool_global)),
            Instr::LocalGet(0),
            Instr::LocalGet(1),
            Instr::LocalGet(2),
            Instr::ArrayNewData(TypeUse::Type(char_array_tid), DataUse::Idx(0)),
            Instr::Call(FuncUse::Func(create_string)),
            Instr::LocalTee(3),
            Instr::ArraySet(TypeUse::Type(string_array_tid)),
            Instr::LocalGet(3),
            Instr::End,
            Instr::Return,
        ];
        let literal_fn = self.add_service_function(
            "_stringLiteral",
            literal_ty,
            vec![Local { name: "temporary".to_string(), ty: string_ty }],
            body,
        );
        self.elements.push(vec![literal_fn]);

        for frag in self.fragments.iter_mut() {
            if let Some(cell) = frag.string_literal_fn {
                frag.func_cells.bind(cell, literal_fn)?;
            }
            if let Some(cell) = frag.string_literal_type {
                frag.type_cells.bind(cell, literal_ty)?;
            }
        }
        Ok(())
    }

    /// Present only when some fragment carries the root-suite runner; a
    /// module without tests gets no `startUnitTests` at all.
    fn create_start_unit_tests(&mut self, void_ty: TypeId) -> LinkResult<Option<FuncId>> {
        let Some(run_root_suites) = self.find_builtin_func(|b| b.run_root_suites.as_ref()) else {
            return Ok(None);
        };
        let mut body: Vec<Instr> = Vec::new();
        for frag in &self.fragments {
            for declarator in &frag.test_declarators {
                let fid = self.func_defs.get(declarator).ok_or_else(|| {
                    LinkError::inconsistency(format!("missing test declarator {declarator}"))
                })?;
                body.push(Instr::Call(FuncUse::Func(*fid)));
            }
        }
        body.push(Instr::Call(FuncUse::Func(run_root_suites)));
        Ok(Some(self.add_service_function("startUnitTests", void_ty, vec![], body)))
    }

    /// Synthesized interface-dispatch support types, bound into every
    /// fragment that asked for them.
    pub(crate) fn synthesize_special_itable_types(&mut self) -> LinkResult<()> {
        let any_array = self.push_synthetic_rec_type(
            "$AnyArray",
            TypeDecl::Array(ArrayDecl {
                name: "AnyArray".to_string(),
                field: FieldDecl {
                    name: String::new(),
                    ty: ValType::nullable_ref(HeapType::Any),
                    mutable: false,
                },
            }),
        );

        let mut fields = vec![
            FieldDecl {
                name: String::new(),
                ty: ValType::nullable_ref(HeapType::Any),
                mutable: false,
            };
            SPECIAL_SLOT_COUNT
        ];
        fields.push(FieldDecl {
            name: String::new(),
            ty: ValType::nullable_ref(HeapType::Type(TypeRef::Type(any_array))),
            mutable: false,
        });
        let itable = self.push_synthetic_rec_type(
            "$SpecialITable",
            TypeDecl::Struct(StructDecl {
                name: "SpecialITable".to_string(),
                fields,
                super_type: None,
                is_final: true,
            }),
        );

        for frag in self.fragments.iter_mut() {
            if let Some(refs) = &frag.special_itable_refs {
                let (any_cell, slot_cell) = (refs.any_array, refs.special_slot);
                frag.type_cells.bind(any_cell, any_array)?;
                frag.type_cells.bind(slot_cell, itable)?;
            }
        }
        Ok(())
    }

    /// Runtime type information: the record type (self-referential through
    /// its supertype link) plus every fragment's RTTI globals, emitted
    /// parents-before-children so initializers can read the parent global.
    pub(crate) fn synthesize_rtti(&mut self) -> LinkResult<()> {
        let long_array = self.push_synthetic_rec_type(
            "$LongArray",
            TypeDecl::Array(ArrayDecl {
                name: "LongArray".to_string(),
                field: FieldDecl {
                    name: "Long".to_string(),
                    ty: ValType::I64,
                    mutable: false,
                },
            }),
        );

        // Reserve the slot so the declaration can reference itself.
        let rtti_tid = TypeId(self.types.len() as u32);
        let i32_field = |name: &str| FieldDecl {
            name: name.to_string(),
            ty: ValType::I32,
            mutable: false,
        };
        let decl = TypeDecl::Struct(StructDecl {
            name: "RTTI".to_string(),
            fields: vec![
                FieldDecl {
                    name: "implementedIFaceIds".to_string(),
                    ty: ValType::nullable_ref(HeapType::Type(TypeRef::Type(long_array))),
                    mutable: false,
                },
                FieldDecl {
                    name: "superClassRtti".to_string(),
                    ty: ValType::nullable_ref(HeapType::Type(TypeRef::Type(rtti_tid))),
                    mutable: false,
                },
                i32_field("packageNameAddress"),
                i32_field("packageNameLength"),
                i32_field("packageNamePoolId"),
                i32_field("simpleNameAddress"),
                i32_field("simpleNameLength"),
                i32_field("simpleNamePoolId"),
                FieldDecl {
                    name: "klassId".to_string(),
                    ty: ValType::I64,
                    mutable: false,
                },
                i32_field("typeInfoFlag"),
                FieldDecl {
                    name: "createString".to_string(),
                    ty: ValType::nullable_ref(HeapType::Func),
                    mutable: false,
                },
            ],
            super_type: None,
            is_final: true,
        });
        let pushed = self.push_synthetic_rec_type("$RTTI", decl);
        debug_assert_eq!(pushed, rtti_tid);

        // Later fragments may override a class's RTTI global; collection
        // order still follows the first sighting.
        let mut rtti_globals: IndexMap<SymbolId, (usize, RttiGlobal)> = IndexMap::new();
        for (i, frag) in self.fragments.iter().enumerate() {
            if let Some(rtti) = &frag.rtti {
                for global in &rtti.globals {
                    rtti_globals.insert(global.class_id.clone(), (i, global.clone()));
                }
            }
        }

        fn depth(globals: &IndexMap<SymbolId, (usize, RttiGlobal)>, g: &RttiGlobal) -> usize {
            match &g.super_class {
                Some(parent) => globals
                    .get(parent)
                    .map(|(_, p)| depth(globals, p) + 1)
                    .unwrap_or(0),
                None => 0,
            }
        }
        let mut ordered: Vec<(SymbolId, (usize, RttiGlobal))> = rtti_globals
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        ordered.sort_by_key(|(_, (_, g))| depth(&rtti_globals, g));

        let mut ids: FxHashMap<SymbolId, GlobalId> = FxHashMap::default();
        for (class, (origin, global)) in ordered {
            let gid = GlobalId(self.globals.len() as u32);
            self.globals.push(GlobalEntry {
                origin: Some(origin),
                global: global.global,
            });
            ids.insert(class, gid);
        }

        for frag in self.fragments.iter_mut() {
            let Some(rtti) = frag.rtti.clone() else { continue };
            for (class, cell) in &rtti.unbound {
                let gid = ids.get(class).ok_or_else(|| {
                    LinkError::inconsistency(format!("no runtime type info global for {class}"))
                })?;
                frag.global_cells.bind(*cell, *gid)?;
            }
            if let Some(cell) = rtti.rtti_type {
                frag.type_cells.bind(cell, rtti_tid)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fragment::{Fragment, RttiContribution};
    use crate::linker::LinkOptions;

    fn void_func(frag: &mut Fragment, name: &str) -> Function {
        Function::Defined {
            name: name.to_string(),
            ty: TypeUse::Sym(frag.reference_func_type("sig.v")),
            locals: vec![],
            body: vec![Instr::Return],
        }
    }

    #[test]
    fn instance_initializers_prepend_and_field_initializers_append() {
        let mut a = Fragment::new("a.src");
        for name in ["init.a", "field.x"] {
            let f = void_func(&mut a, name);
            a.define_function(name, f).unwrap();
        }
        a.instance_field_inits.push("init.a".into());
        a.field_inits.push("field.x".into());

        let mut b = Fragment::new("b.src");
        for name in ["init.b", "field.y"] {
            let f = void_func(&mut b, name);
            b.define_function(name, f).unwrap();
        }
        b.instance_field_inits.push("init.b".into());
        b.field_inits.push("field.y".into());

        let mut linker = Linker::new(vec![a, b], LinkOptions::default());
        linker.merge_definitions().unwrap();
        let void_ty = linker.push_additional_type(TypeDecl::Func(FuncType::new(vec![], vec![])));
        let fid = linker.create_field_initializer(void_ty).unwrap();

        let defs = &linker.func_defs;
        let call = |name: &str| Instr::Call(FuncUse::Func(defs[&SymbolId::from(name)]));
        let entry = linker.func_entry(fid).unwrap();
        let Function::Defined { body, .. } = &entry.func else {
            panic!("service function must be defined");
        };
        // The second fragment's instance initializer runs first; top-level
        // field initializers keep fragment order.
        assert_eq!(
            body,
            &vec![call("init.b"), call("init.a"), call("field.x"), call("field.y")]
        );
    }

    fn rtti_global(name: &str) -> Global {
        Global {
            name: name.to_string(),
            ty: ValType::I64,
            mutable: false,
            init: vec![],
            import: None,
        }
    }

    #[test]
    fn rtti_globals_emit_parents_before_children() {
        // The derived class's fragment comes first, yet its global must be
        // emitted after the base's so the initializer can read the parent.
        let mut derived = Fragment::new("derived.src");
        let base_cell = derived.global_cells.alloc();
        let type_cell = derived.type_cells.alloc();
        let mut unbound = IndexMap::new();
        unbound.insert(SymbolId::from("pkg.Base"), base_cell);
        derived.rtti = Some(RttiContribution {
            globals: vec![RttiGlobal {
                global: rtti_global("derivedRtti"),
                class_id: "pkg.Derived".into(),
                super_class: Some("pkg.Base".into()),
            }],
            unbound,
            rtti_type: Some(type_cell),
        });

        let mut base = Fragment::new("base.src");
        base.rtti = Some(RttiContribution {
            globals: vec![RttiGlobal {
                global: rtti_global("baseRtti"),
                class_id: "pkg.Base".into(),
                super_class: None,
            }],
            unbound: IndexMap::new(),
            rtti_type: None,
        });

        let mut linker = Linker::new(vec![derived, base], LinkOptions::default());
        linker.synthesize_rtti().unwrap();

        let names: Vec<&str> = linker
            .globals
            .iter()
            .map(|entry| entry.global.name.as_str())
            .collect();
        assert_eq!(names, vec!["baseRtti", "derivedRtti"]);

        // The derived fragment's cell for the base RTTI is bound, and its
        // record-type cell points at the self-referential RTTI struct.
        let frag = &linker.fragments[0];
        assert_eq!(frag.global_cells.get(base_cell), Some(&GlobalId(0)));
        let tid = *frag.type_cells.get(type_cell).expect("record type bound");
        assert_eq!(linker.type_entry(tid).unwrap().decl.name(), "RTTI");
    }

    #[test]
    fn missing_rtti_parent_reference_fails() {
        let mut orphan = Fragment::new("orphan.src");
        let cell = orphan.global_cells.alloc();
        let mut unbound = IndexMap::new();
        unbound.insert(SymbolId::from("pkg.Nowhere"), cell);
        orphan.rtti = Some(RttiContribution {
            globals: vec![],
            unbound,
            rtti_type: None,
        });

        let mut linker = Linker::new(vec![orphan], LinkOptions::default());
        let err = linker.synthesize_rtti().unwrap_err();
        assert!(matches!(err, LinkError::Inconsistency(_)));
    }

    #[test]
    fn missing_instance_initializer_is_skipped_silently() {
        let mut a = Fragment::new("a.src");
        a.instance_field_inits.push("gone".into());

        let mut linker = Linker::new(vec![a], LinkOptions::default());
        linker.merge_definitions().unwrap();
        let void_ty = linker.push_additional_type(TypeDecl::Func(FuncType::new(vec![], vec![])));
        let fid = linker.create_field_initializer(void_ty).unwrap();
        let Function::Defined { body, .. } = &linker.func_entry(fid).unwrap().func else {
            panic!("service function must be defined");
        };
        assert!(body.is_empty());
    }
}
