//! Core linker logic.
//!
//! This module contains the `Linker` struct which orchestrates the entire
//! linking process:
//! 1. Merge: fold every fragment's definition maps into linker-owned
//!    tables, failing fast on duplicate definitions.
//! 2. Canonicalization: collapse structurally-equal function types and
//!    equivalent adapter functions (see `canon`).
//! 3. Resolution: bind every fragment's unbound references through the
//!    write-once cell arenas, failing fast on unresolved symbols.
//! 4. Pools: merge string-literal and constant-array pools (see `pool`).
//! 5. Service code: synthesize init/dispatch/pooling glue (see `service`).
//! 6. Grouping: order type declarations into recursion groups (see
//!    `groups`).
//! 7. Assembly: assign final indices and produce the `Module`.
//!
//! A failure anywhere aborts the link; no partial module is ever produced.

use indexmap::IndexMap;
use rustc_hash::FxHashMap;
use std::fmt;
use std::mem;

use crate::error::{LinkError, LinkResult};
use crate::fragment::{BuiltinSymbols, Fragment};
use crate::groups::{self, TypeEntry, TypeKind};
use crate::ir::{
    DataSegment, DataUse, Export, ExportKind, FuncId, FuncType, FuncUse, Function, Global,
    GlobalId, GlobalUse, HeapType, ImportPair, Instr, Memory, Module, NameUse, Tag, TypeDecl,
    TypeId, TypeRef, TypeUse, ValType,
};
use crate::symbol::{CellId, CellTable, SymbolId};

/// Host-configuration flags for one link.
#[derive(Debug, Clone, Default)]
pub struct LinkOptions {
    /// Exceptions are modeled as traps; no exception tag is synthesized.
    pub trap_exceptions: bool,
    /// The host is JS-like; selects the imported foreign exception tag.
    pub js_host: bool,
    /// Import memory from this module name instead of defining it.
    pub import_memory: Option<String>,
    /// Whether `_initialize` must trigger singleton initialization.
    pub init_singletons: bool,
}

/// A function slab entry. `origin` is the index of the fragment whose cell
/// arenas the body's symbolic uses point into; linker-synthesized service
/// functions have no origin and carry only direct references.
#[derive(Debug)]
pub(crate) struct FuncEntry {
    pub origin: Option<usize>,
    pub func: Function,
}

#[derive(Debug)]
pub(crate) struct GlobalEntry {
    pub origin: Option<usize>,
    pub global: Global,
}

/// Link an ordered fragment list into one module.
///
/// Fragment order is preserved verbatim through every order-sensitive
/// component (pool assignment, initializer concatenation, canonical
/// representative selection); this determinism is a correctness
/// requirement for reproducible builds.
pub fn link(fragments: Vec<Fragment>, options: LinkOptions) -> LinkResult<Module> {
    Linker::new(fragments, options).run()
}

pub struct Linker {
    pub(crate) fragments: Vec<Fragment>,
    pub(crate) options: LinkOptions,

    // Entity slabs. Ids handed to resolution cells index these; slots may
    // be tombstoned by canonicalization but never reused.
    pub(crate) funcs: Vec<Option<FuncEntry>>,
    pub(crate) globals: Vec<GlobalEntry>,
    pub(crate) types: Vec<TypeEntry>,

    // Merged definition maps, one per entity kind.
    pub(crate) func_defs: IndexMap<SymbolId, FuncId>,
    pub(crate) global_field_defs: IndexMap<SymbolId, GlobalId>,
    pub(crate) global_vtable_defs: IndexMap<SymbolId, GlobalId>,
    pub(crate) global_itable_defs: IndexMap<SymbolId, GlobalId>,
    pub(crate) class_type_defs: IndexMap<SymbolId, TypeId>,
    pub(crate) vtable_type_defs: IndexMap<SymbolId, TypeId>,
    pub(crate) func_type_defs: IndexMap<SymbolId, TypeId>,
    /// Structural signature -> canonical representative.
    pub(crate) canon_func_types: IndexMap<FuncType, TypeId>,
    /// Well-known names of linker-synthesized types (`$RTTI` etc.).
    pub(crate) synthetic_type_names: FxHashMap<String, TypeId>,

    /// Synthetic types participating in recursion-group computation, in
    /// creation order; they precede all fragment-defined types there.
    pub(crate) synthetic_rec_types: Vec<TypeId>,
    /// Types appended after grouping as singleton groups.
    pub(crate) additional_types: Vec<TypeId>,

    /// Pending exports; `ExportKind::Func` holds slab ids until assembly.
    pub(crate) exports: Vec<Export>,
    /// Declarative element segments (slab function ids).
    pub(crate) elements: Vec<Vec<FuncId>>,
    pub(crate) data: Vec<DataSegment>,
    pub(crate) string_pool_size: u32,
    /// Collected tags with the index of the contributing fragment;
    /// linker-synthesized tags have no origin.
    pub(crate) tags: Vec<(Option<usize>, Tag)>,
    pub(crate) memories: Vec<Memory>,
}

impl Linker {
    pub fn new(fragments: Vec<Fragment>, options: LinkOptions) -> Self {
        Linker {
            fragments,
            options,
            funcs: Vec::new(),
            globals: Vec::new(),
            types: Vec::new(),
            func_defs: IndexMap::new(),
            global_field_defs: IndexMap::new(),
            global_vtable_defs: IndexMap::new(),
            global_itable_defs: IndexMap::new(),
            class_type_defs: IndexMap::new(),
            vtable_type_defs: IndexMap::new(),
            func_type_defs: IndexMap::new(),
            canon_func_types: IndexMap::new(),
            synthetic_type_names: FxHashMap::default(),
            synthetic_rec_types: Vec::new(),
            additional_types: Vec::new(),
            exports: Vec::new(),
            elements: Vec::new(),
            data: Vec::new(),
            string_pool_size: 0,
            tags: Vec::new(),
            memories: Vec::new(),
        }
    }

    pub fn run(mut self) -> LinkResult<Module> {
        self.merge_definitions()?;
        self.canonicalize()?;
        self.resolve_references()?;
        self.bind_resource_pools()?;

        self.collect_fragment_exports()?;
        self.create_memory();
        self.synthesize_special_itable_types()?;
        self.synthesize_rtti()?;
        self.synthesize_service_code()?;
        self.create_exception_tags()?;

        let groups = self.compute_type_groups()?;
        let module = self.assemble(groups)?;
        tracing::info!(
            types = module.rec_groups.iter().map(Vec::len).sum::<usize>(),
            functions = module.functions.len(),
            imports = module.imported_functions.len(),
            data_segments = module.data.len(),
            "link complete"
        );
        Ok(module)
    }

    // ---- step 1: merge ---------------------------------------------------

    pub(crate) fn merge_definitions(&mut self) -> LinkResult<()> {
        self.merge_functions()?;
        self.merge_globals()?;
        self.merge_types()
    }

    fn merge_functions(&mut self) -> LinkResult<()> {
        for i in 0..self.fragments.len() {
            let defined: Vec<(SymbolId, Function)> =
                self.fragments[i].functions.defined.drain(..).collect();
            for (id, func) in defined {
                if self.func_defs.contains_key(&id) {
                    return Err(LinkError::DuplicateDefinition(id));
                }
                let fid = FuncId(self.funcs.len() as u32);
                self.funcs.push(Some(FuncEntry { origin: Some(i), func }));
                self.func_defs.insert(id, fid);
            }
        }
        Ok(())
    }

    fn merge_globals(&mut self) -> LinkResult<()> {
        // Global section order is fragment-by-fragment: fields, vtables,
        // interface tables.
        for i in 0..self.fragments.len() {
            for table in 0..3usize {
                let drained: Vec<(SymbolId, Global)> = match table {
                    0 => self.fragments[i].global_fields.defined.drain(..).collect(),
                    1 => self.fragments[i].global_vtables.defined.drain(..).collect(),
                    _ => self.fragments[i].global_itables.defined.drain(..).collect(),
                };
                for (id, global) in drained {
                    let defs = match table {
                        0 => &mut self.global_field_defs,
                        1 => &mut self.global_vtable_defs,
                        _ => &mut self.global_itable_defs,
                    };
                    if defs.contains_key(&id) {
                        return Err(LinkError::DuplicateDefinition(id));
                    }
                    let gid = GlobalId(self.globals.len() as u32);
                    defs.insert(id, gid);
                    self.globals.push(GlobalEntry { origin: Some(i), global });
                }
            }
        }
        Ok(())
    }

    fn merge_types(&mut self) -> LinkResult<()> {
        // Class types across all fragments first, then vtable types, the
        // order recursion-group computation will see them in. Function
        // types are merged by the canonicalizer.
        for i in 0..self.fragments.len() {
            let drained: Vec<(SymbolId, TypeDecl)> =
                self.fragments[i].class_types.defined.drain(..).collect();
            for (id, decl) in drained {
                if self.class_type_defs.contains_key(&id) {
                    return Err(LinkError::DuplicateDefinition(id));
                }
                let tid = self.push_type(decl, TypeKind::Class, Some(id.clone()));
                self.class_type_defs.insert(id, tid);
            }
        }
        for i in 0..self.fragments.len() {
            let drained: Vec<(SymbolId, TypeDecl)> =
                self.fragments[i].vtable_types.defined.drain(..).collect();
            for (id, decl) in drained {
                if self.vtable_type_defs.contains_key(&id) {
                    return Err(LinkError::DuplicateDefinition(id));
                }
                let tid = self.push_type(decl, TypeKind::VTable, Some(id.clone()));
                self.vtable_type_defs.insert(id, tid);
            }
        }
        Ok(())
    }

    pub(crate) fn push_type(
        &mut self,
        decl: TypeDecl,
        kind: TypeKind,
        origin: Option<SymbolId>,
    ) -> TypeId {
        let tid = TypeId(self.types.len() as u32);
        self.types.push(TypeEntry { decl, kind, origin });
        tid
    }

    /// A synthetic type that takes part in recursion-group computation.
    pub(crate) fn push_synthetic_rec_type(&mut self, name: &str, decl: TypeDecl) -> TypeId {
        let tid = self.push_type(decl, TypeKind::Synthetic, None);
        self.synthetic_rec_types.push(tid);
        self.synthetic_type_names.insert(name.to_string(), tid);
        tid
    }

    /// A synthetic type emitted as its own singleton group after grouping.
    pub(crate) fn push_additional_type(&mut self, decl: TypeDecl) -> TypeId {
        let tid = self.push_type(decl, TypeKind::Synthetic, None);
        self.additional_types.push(tid);
        tid
    }

    // ---- step 3: resolution ----------------------------------------------

    fn resolve_references(&mut self) -> LinkResult<()> {
        let Linker {
            fragments,
            func_defs,
            global_field_defs,
            global_vtable_defs,
            global_itable_defs,
            class_type_defs,
            vtable_type_defs,
            func_type_defs,
            ..
        } = self;

        for frag in fragments.iter_mut() {
            resolve_table(&frag.functions.unbound, &mut frag.func_cells, func_defs)?;
            resolve_table(&frag.global_fields.unbound, &mut frag.global_cells, global_field_defs)?;
            resolve_table(&frag.global_vtables.unbound, &mut frag.global_cells, global_vtable_defs)?;
            resolve_table(&frag.global_itables.unbound, &mut frag.global_cells, global_itable_defs)?;
            resolve_table(&frag.class_types.unbound, &mut frag.type_cells, class_type_defs)?;
            resolve_table(&frag.vtable_types.unbound, &mut frag.type_cells, vtable_type_defs)?;
            resolve_table(&frag.func_types.unbound, &mut frag.type_cells, func_type_defs)?;
        }

        self.bind_unique_ffi_names()
    }

    /// Foreign bridges across fragments may collide on their import name;
    /// the second and later occurrences get a numeric suffix.
    fn bind_unique_ffi_names(&mut self) -> LinkResult<()> {
        let mut seen: FxHashMap<String, u32> = FxHashMap::default();
        for frag in self.fragments.iter_mut() {
            for bridge in frag.ffi_bridges.values() {
                let count = seen.entry(bridge.import_name.clone()).or_insert(0);
                let unique = if *count == 0 {
                    bridge.import_name.clone()
                } else {
                    format!("{}_{}", bridge.import_name, count)
                };
                *count += 1;
                frag.ffi_name_cells.bind(bridge.name_cell, unique)?;
            }
        }
        Ok(())
    }

    // ---- builtin lookup --------------------------------------------------

    /// First fragment naming the builtin decides; a named-but-undefined id
    /// (removed upstream) yields `None` like the definition being absent.
    pub(crate) fn find_builtin_func(
        &self,
        select: impl Fn(&BuiltinSymbols) -> Option<&SymbolId>,
    ) -> Option<FuncId> {
        for frag in &self.fragments {
            if let Some(id) = frag.builtins.as_ref().and_then(&select) {
                return self.func_defs.get(id).copied();
            }
        }
        None
    }

    pub(crate) fn require_builtin_func(
        &self,
        name: &'static str,
        select: impl Fn(&BuiltinSymbols) -> Option<&SymbolId>,
    ) -> LinkResult<FuncId> {
        self.find_builtin_func(select)
            .ok_or(LinkError::MissingRuntimeEntity(name))
    }

    pub(crate) fn find_builtin_type(
        &self,
        select: impl Fn(&BuiltinSymbols) -> Option<&SymbolId>,
    ) -> Option<TypeId> {
        for frag in &self.fragments {
            if let Some(id) = frag.builtins.as_ref().and_then(&select) {
                return self.class_type_defs.get(id).copied();
            }
        }
        None
    }

    pub(crate) fn require_builtin_type(
        &self,
        name: &'static str,
        select: impl Fn(&BuiltinSymbols) -> Option<&SymbolId>,
    ) -> LinkResult<TypeId> {
        self.find_builtin_type(select)
            .ok_or(LinkError::MissingRuntimeEntity(name))
    }

    // ---- step 5: exports, memory, tags -----------------------------------

    fn collect_fragment_exports(&mut self) -> LinkResult<()> {
        for frag in &self.fragments {
            for export in &frag.exports {
                let fid = self
                    .func_defs
                    .get(&export.target)
                    .copied()
                    .ok_or_else(|| LinkError::UnresolvedSymbol(export.target.clone()))?;
                self.exports.push(Export {
                    name: export.export_name.clone(),
                    kind: ExportKind::Func(fid.0),
                });
            }
        }
        Ok(())
    }

    fn create_memory(&mut self) {
        let import = self.options.import_memory.as_ref().map(|module| ImportPair {
            module: module.clone(),
            name: "memory".to_string(),
        });
        self.memories.push(Memory { min_pages: 0, max_pages: None, import });
        // Exported so the host can pass complex objects; the name is an
        // ABI convention.
        self.exports.push(Export {
            name: "memory".to_string(),
            kind: ExportKind::Memory(0),
        });
    }

    /// Gather tags from every contributing source, then enforce the
    /// target's one-tag limit on the combined result.
    fn create_exception_tags(&mut self) -> LinkResult<()> {
        {
            let Linker { fragments, tags, .. } = self;
            for (i, frag) in fragments.iter().enumerate() {
                for tag in &frag.tags {
                    tags.push((Some(i), tag.clone()));
                }
            }
        }
        if !self.options.trap_exceptions {
            let tag = if self.options.js_host {
                let ty = self.push_additional_type(TypeDecl::Func(FuncType::new(
                    vec![ValType::nullable_ref(HeapType::Extern)],
                    vec![],
                )));
                Tag {
                    ty: TypeUse::Type(ty),
                    import: Some(ImportPair {
                        module: "intrinsics".to_string(),
                        name: "tag".to_string(),
                    }),
                }
            } else {
                let exception = self.require_builtin_type("base_exception", |b| {
                    b.base_exception.as_ref()
                })?;
                let ty = self.push_additional_type(TypeDecl::Func(FuncType::new(
                    vec![ValType::nullable_ref(HeapType::Type(TypeRef::Type(exception)))],
                    vec![],
                )));
                Tag { ty: TypeUse::Type(ty), import: None }
            };
            self.tags.push((None, tag));
        }
        if self.tags.len() > 1 {
            return Err(LinkError::TooManyExceptionTags);
        }
        Ok(())
    }

    // ---- step 7: grouping ------------------------------------------------

    fn compute_type_groups(&mut self) -> LinkResult<Vec<Vec<TypeId>>> {
        // Synthetic recursion-group participants first, then class types,
        // vtable types, and canonical function signatures.
        let mut participants = self.synthetic_rec_types.clone();
        participants.extend(self.class_type_defs.values().copied());
        participants.extend(self.vtable_type_defs.values().copied());
        participants.extend(self.canon_func_types.values().copied());

        let named = self.named_type_lookup();
        let mut groups = groups::compute_rec_groups(&mut self.types, &participants, &named)?;
        for &tid in &self.additional_types {
            groups.push(vec![tid]);
        }
        Ok(groups)
    }

    /// Name -> slab type id for every resolvable type name: fragment
    /// declarations reference each other this way, and service types carry
    /// reserved `$`-prefixed names.
    fn named_type_lookup(&self) -> FxHashMap<SymbolId, TypeId> {
        let mut named: FxHashMap<SymbolId, TypeId> = FxHashMap::default();
        for (name, &tid) in &self.synthetic_type_names {
            named.insert(SymbolId::new(name.clone()), tid);
        }
        for (id, &tid) in self
            .func_type_defs
            .iter()
            .chain(self.vtable_type_defs.iter())
            .chain(self.class_type_defs.iter())
        {
            named.insert(id.clone(), tid);
        }
        named
    }

    /// Signature of an already-merged function, looked through cells.
    pub(crate) fn resolved_func_type(&self, fid: FuncId) -> LinkResult<&FuncType> {
        let entry = self.func_entry(fid)?;
        let tid = match entry.func.ty() {
            TypeUse::Type(tid) => tid,
            TypeUse::Sym(cell) => {
                let origin = entry.origin.ok_or_else(|| {
                    LinkError::inconsistency("service function with symbolic type")
                })?;
                *self.fragments[origin].type_cells.resolved(cell)?
            }
        };
        match &self.type_entry(tid)?.decl {
            TypeDecl::Func(ft) => Ok(ft),
            other => Err(LinkError::inconsistency(format!(
                "function {} typed by non-signature declaration {other:?}",
                fid.0
            ))),
        }
    }

    pub(crate) fn func_entry(&self, fid: FuncId) -> LinkResult<&FuncEntry> {
        self.funcs
            .get(fid.0 as usize)
            .and_then(|slot| slot.as_ref())
            .ok_or_else(|| LinkError::inconsistency(format!("function slot {} is vacant", fid.0)))
    }

    pub(crate) fn type_entry(&self, tid: TypeId) -> LinkResult<&TypeEntry> {
        self.types
            .get(tid.0 as usize)
            .ok_or_else(|| LinkError::inconsistency(format!("type slot {} is vacant", tid.0)))
    }

    // ---- step 8: final id assignment and assembly ------------------------

    fn assemble(mut self, groups: Vec<Vec<TypeId>>) -> LinkResult<Module> {
        let type_map = final_type_indices(&groups, self.types.len())?;

        let funcs = mem::take(&mut self.funcs);
        let globals = mem::take(&mut self.globals);

        // Unified index spaces: imports first, in slab order.
        let mut func_map: Vec<Option<u32>> = vec![None; funcs.len()];
        let mut next = 0u32;
        for (i, slot) in funcs.iter().enumerate() {
            if matches!(slot, Some(e) if e.func.is_imported()) {
                func_map[i] = Some(next);
                next += 1;
            }
        }
        for (i, slot) in funcs.iter().enumerate() {
            if matches!(slot, Some(e) if !e.func.is_imported()) {
                func_map[i] = Some(next);
                next += 1;
            }
        }

        let mut global_map: Vec<Option<u32>> = vec![None; globals.len()];
        let mut next = 0u32;
        for (i, entry) in globals.iter().enumerate() {
            if entry.global.import.is_some() {
                global_map[i] = Some(next);
                next += 1;
            }
        }
        for (i, entry) in globals.iter().enumerate() {
            if entry.global.import.is_none() {
                global_map[i] = Some(next);
                next += 1;
            }
        }

        let maps = FinalMaps {
            types: &type_map,
            funcs: &func_map,
            globals: &global_map,
        };

        // Type section: every group's declarations with references
        // rewritten to final indices.
        let mut rec_groups = Vec::with_capacity(groups.len());
        for group in &groups {
            let mut decls = Vec::with_capacity(group.len());
            for &tid in group {
                let decl = self.type_entry(tid)?.decl.clone();
                decls.push(self.finalize_type_decl(decl, &maps)?);
            }
            rec_groups.push(decls);
        }

        let mut imported_functions = Vec::new();
        let mut defined_functions = Vec::new();
        for entry in funcs.into_iter().flatten() {
            let func = self.finalize_function(entry.func, entry.origin, &maps)?;
            if func.is_imported() {
                imported_functions.push(func);
            } else {
                defined_functions.push(func);
            }
        }

        let mut imported_globals = Vec::new();
        let mut defined_globals = Vec::new();
        for entry in globals {
            let global = self.finalize_global(entry.global, entry.origin, &maps)?;
            if global.import.is_some() {
                imported_globals.push(global);
            } else {
                defined_globals.push(global);
            }
        }

        let (imported_memories, defined_memories): (Vec<Memory>, Vec<Memory>) = self
            .memories
            .iter()
            .cloned()
            .partition(|m| m.import.is_some());

        let mut imported_tags = Vec::new();
        let mut defined_tags = Vec::new();
        for (origin, tag) in &self.tags {
            let finalized = Tag {
                ty: self.finalize_type_use(tag.ty, *origin, &maps)?,
                import: tag.import.clone(),
            };
            if finalized.import.is_some() {
                imported_tags.push(finalized);
            } else {
                defined_tags.push(finalized);
            }
        }

        let mut exports = Vec::with_capacity(self.exports.len());
        for export in &self.exports {
            let kind = match export.kind {
                ExportKind::Func(slab) => ExportKind::Func(final_index(maps.funcs, slab, "function")?),
                other => other,
            };
            exports.push(Export { name: export.name.clone(), kind });
        }

        let mut elements = Vec::with_capacity(self.elements.len());
        for segment in &self.elements {
            let mut funcs_out = Vec::with_capacity(segment.len());
            for fid in segment {
                funcs_out.push(FuncUse::Func(FuncId(final_index(maps.funcs, fid.0, "function")?)));
            }
            elements.push(crate::ir::Element { funcs: funcs_out });
        }

        let mut ffi_glue = Vec::new();
        for frag in &self.fragments {
            for bridge in frag.ffi_bridges.values() {
                let name = frag.ffi_name_cells.resolved(bridge.name_cell)?;
                ffi_glue.push(crate::ir::FfiGlue {
                    import_name: name.clone(),
                    code: bridge.code.clone(),
                });
            }
        }

        Ok(Module {
            rec_groups,
            imported_functions,
            imported_tags,
            imported_globals,
            imported_memories,
            functions: defined_functions,
            memories: defined_memories,
            globals: defined_globals,
            exports,
            start: None, // the module is initialized via an exported call
            elements,
            data: mem::take(&mut self.data),
            tags: defined_tags,
            ffi_glue,
        })
    }

    fn finalize_function(
        &self,
        func: Function,
        origin: Option<usize>,
        maps: &FinalMaps<'_>,
    ) -> LinkResult<Function> {
        match func {
            Function::Defined { name, ty, locals, body } => {
                let ty = self.finalize_type_use(ty, origin, maps)?;
                let body = body
                    .into_iter()
                    .map(|instr| self.finalize_instr(instr, origin, maps))
                    .collect::<LinkResult<Vec<_>>>()?;
                let locals = locals
                    .into_iter()
                    .map(|mut local| {
                        local.ty = self.finalize_val_type(local.ty, maps)?;
                        Ok(local)
                    })
                    .collect::<LinkResult<Vec<_>>>()?;
                Ok(Function::Defined { name, ty, locals, body })
            }
            Function::Imported { name, ty, module, import_name } => {
                let ty = self.finalize_type_use(ty, origin, maps)?;
                let import_name = match import_name {
                    NameUse::Value(v) => NameUse::Value(v),
                    NameUse::Sym(cell) => {
                        let i = origin.ok_or_else(|| {
                            LinkError::inconsistency("imported service function")
                        })?;
                        NameUse::Value(self.fragments[i].ffi_name_cells.resolved(cell)?.clone())
                    }
                };
                Ok(Function::Imported { name, ty, module, import_name })
            }
        }
    }

    fn finalize_global(
        &self,
        mut global: Global,
        origin: Option<usize>,
        maps: &FinalMaps<'_>,
    ) -> LinkResult<Global> {
        global.ty = self.finalize_val_type(global.ty, maps)?;
        global.init = global
            .init
            .into_iter()
            .map(|instr| self.finalize_instr(instr, origin, maps))
            .collect::<LinkResult<Vec<_>>>()?;
        Ok(global)
    }

    fn finalize_instr(
        &self,
        instr: Instr,
        origin: Option<usize>,
        maps: &FinalMaps<'_>,
    ) -> LinkResult<Instr> {
        Ok(match instr {
            Instr::Call(f) => Instr::Call(self.finalize_func_use(f, origin, maps)?),
            Instr::RefFunc(f) => Instr::RefFunc(self.finalize_func_use(f, origin, maps)?),
            Instr::GlobalGet(g) => Instr::GlobalGet(self.finalize_global_use(g, origin, maps)?),
            Instr::GlobalSet(g) => Instr::GlobalSet(self.finalize_global_use(g, origin, maps)?),
            Instr::RefNull(heap) => Instr::RefNull(self.finalize_heap_type(heap, maps)?),
            Instr::Block { result } => Instr::Block {
                result: result.map(|ty| self.finalize_val_type(ty, maps)).transpose()?,
            },
            Instr::ArrayGet(t) => Instr::ArrayGet(self.finalize_type_use(t, origin, maps)?),
            Instr::ArraySet(t) => Instr::ArraySet(self.finalize_type_use(t, origin, maps)?),
            Instr::ArrayNewDefault(t) => {
                Instr::ArrayNewDefault(self.finalize_type_use(t, origin, maps)?)
            }
            Instr::ArrayNewData(t, d) => Instr::ArrayNewData(
                self.finalize_type_use(t, origin, maps)?,
                self.finalize_data_use(d, origin)?,
            ),
            Instr::StringAddress(cell) => {
                let i = self.code_origin(origin, "string address")?;
                Instr::I32Const(*self.fragments[i].string_addresses.cells.resolved(cell)? as i32)
            }
            Instr::StringPoolId(cell) => {
                let i = self.code_origin(origin, "string pool id")?;
                Instr::I32Const(*self.fragments[i].string_pool_ids.cells.resolved(cell)? as i32)
            }
            passthrough => passthrough,
        })
    }

    fn code_origin(&self, origin: Option<usize>, what: &str) -> LinkResult<usize> {
        origin.ok_or_else(|| {
            LinkError::inconsistency(format!("service code holds a symbolic {what} reference"))
        })
    }

    fn finalize_func_use(
        &self,
        func_use: FuncUse,
        origin: Option<usize>,
        maps: &FinalMaps<'_>,
    ) -> LinkResult<FuncUse> {
        let slab = match func_use {
            FuncUse::Func(fid) => fid,
            FuncUse::Sym(cell) => {
                let i = self.code_origin(origin, "function")?;
                *self.fragments[i].func_cells.resolved(cell)?
            }
        };
        Ok(FuncUse::Func(FuncId(final_index(maps.funcs, slab.0, "function")?)))
    }

    fn finalize_global_use(
        &self,
        global_use: GlobalUse,
        origin: Option<usize>,
        maps: &FinalMaps<'_>,
    ) -> LinkResult<GlobalUse> {
        let slab = match global_use {
            GlobalUse::Global(gid) => gid,
            GlobalUse::Sym(cell) => {
                let i = self.code_origin(origin, "global")?;
                *self.fragments[i].global_cells.resolved(cell)?
            }
        };
        Ok(GlobalUse::Global(GlobalId(final_index(maps.globals, slab.0, "global")?)))
    }

    fn finalize_type_use(
        &self,
        type_use: TypeUse,
        origin: Option<usize>,
        maps: &FinalMaps<'_>,
    ) -> LinkResult<TypeUse> {
        let slab = match type_use {
            TypeUse::Type(tid) => tid,
            TypeUse::Sym(cell) => {
                let i = self.code_origin(origin, "type")?;
                *self.fragments[i].type_cells.resolved(cell)?
            }
        };
        Ok(TypeUse::Type(TypeId(final_index(maps.types, slab.0, "type")?)))
    }

    fn finalize_data_use(&self, data_use: DataUse, origin: Option<usize>) -> LinkResult<DataUse> {
        Ok(match data_use {
            DataUse::Idx(i) => DataUse::Idx(i),
            DataUse::Sym(cell) => {
                let i = self.code_origin(origin, "data segment")?;
                DataUse::Idx(*self.fragments[i].const_arrays.cells.resolved(cell)?)
            }
        })
    }

    fn finalize_type_ref(&self, type_ref: TypeRef, maps: &FinalMaps<'_>) -> LinkResult<TypeRef> {
        let slab = match type_ref {
            TypeRef::Type(tid) => tid,
            TypeRef::Named(id) => self.lookup_named_type(&id)?,
        };
        Ok(TypeRef::Type(TypeId(final_index(maps.types, slab.0, "type")?)))
    }

    pub(crate) fn lookup_named_type(&self, id: &SymbolId) -> LinkResult<TypeId> {
        self.class_type_defs
            .get(id)
            .or_else(|| self.vtable_type_defs.get(id))
            .or_else(|| self.func_type_defs.get(id))
            .or_else(|| self.synthetic_type_names.get(id.as_str()))
            .copied()
            .ok_or_else(|| LinkError::UnresolvedSymbol(id.clone()))
    }

    fn finalize_heap_type(&self, heap: HeapType, maps: &FinalMaps<'_>) -> LinkResult<HeapType> {
        Ok(match heap {
            HeapType::Type(tr) => HeapType::Type(self.finalize_type_ref(tr, maps)?),
            simple => simple,
        })
    }

    fn finalize_val_type(&self, ty: ValType, maps: &FinalMaps<'_>) -> LinkResult<ValType> {
        Ok(match ty {
            ValType::Ref { nullable, heap } => ValType::Ref {
                nullable,
                heap: self.finalize_heap_type(heap, maps)?,
            },
            scalar => scalar,
        })
    }

    fn finalize_type_decl(&self, decl: TypeDecl, maps: &FinalMaps<'_>) -> LinkResult<TypeDecl> {
        Ok(match decl {
            TypeDecl::Struct(mut s) => {
                s.super_type = s
                    .super_type
                    .map(|tr| self.finalize_type_ref(tr, maps))
                    .transpose()?;
                for field in &mut s.fields {
                    field.ty = self.finalize_val_type(field.ty.clone(), maps)?;
                }
                TypeDecl::Struct(s)
            }
            TypeDecl::Array(mut a) => {
                a.field.ty = self.finalize_val_type(a.field.ty.clone(), maps)?;
                TypeDecl::Array(a)
            }
            TypeDecl::Func(mut ft) => {
                ft.params = ft
                    .params
                    .into_iter()
                    .map(|ty| self.finalize_val_type(ty, maps))
                    .collect::<LinkResult<Vec<_>>>()?;
                ft.results = ft
                    .results
                    .into_iter()
                    .map(|ty| self.finalize_val_type(ty, maps))
                    .collect::<LinkResult<Vec<_>>>()?;
                TypeDecl::Func(ft)
            }
        })
    }
}

struct FinalMaps<'a> {
    types: &'a [Option<u32>],
    funcs: &'a [Option<u32>],
    globals: &'a [Option<u32>],
}

fn final_index(map: &[Option<u32>], slab: u32, what: &str) -> LinkResult<u32> {
    map.get(slab as usize).copied().flatten().ok_or_else(|| {
        LinkError::inconsistency(format!("{what} slot {slab} has no final index"))
    })
}

/// Flattened group order defines the final type index space. Every type
/// slot must land in exactly one group.
fn final_type_indices(groups: &[Vec<TypeId>], type_count: usize) -> LinkResult<Vec<Option<u32>>> {
    let mut map: Vec<Option<u32>> = vec![None; type_count];
    let mut next = 0u32;
    for group in groups {
        for tid in group {
            let slot = map
                .get_mut(tid.0 as usize)
                .ok_or_else(|| LinkError::inconsistency(format!("type {} out of range", tid.0)))?;
            if slot.is_some() {
                return Err(LinkError::inconsistency(format!(
                    "type {} appears in more than one recursion group",
                    tid.0
                )));
            }
            *slot = Some(next);
            next += 1;
        }
    }
    for (i, slot) in map.iter().enumerate() {
        if slot.is_none() {
            return Err(LinkError::inconsistency(format!(
                "type {i} was not assigned to any recursion group"
            )));
        }
    }
    Ok(map)
}

fn resolve_table<Id: Copy + PartialEq + fmt::Debug>(
    unbound: &IndexMap<SymbolId, CellId>,
    cells: &mut CellTable<Id>,
    defs: &IndexMap<SymbolId, Id>,
) -> LinkResult<()> {
    for (id, &cell) in unbound {
        if cells.is_bound(cell) {
            // Canonicalization already redirected this reference.
            continue;
        }
        match defs.get(id) {
            Some(&target) => cells.bind(cell, target)?,
            None => return Err(LinkError::UnresolvedSymbol(id.clone())),
        }
    }
    Ok(())
}
