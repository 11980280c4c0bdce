//! The compiled file fragment: one source file's worth of lowered,
//! not-yet-linked output.
//!
//! A fragment is immutable once handed to the linker except for its
//! symbol-binding side tables (the unbound maps and cell arenas). The
//! `reference_*` helpers are the lowering stage's API for recording
//! cross-fragment uses; tests build fragments through the same calls.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::error::LinkResult;
use crate::ir::{ElemWidth, FuncId, FuncType, Function, Global, GlobalId, Tag, TypeDecl, TypeId};
use crate::symbol::{CellId, CellTable, EntityTable, RefTable, SymbolId};

/// Pool key of a constant numeric array: the logical values plus the
/// element width they will be stored at.
pub type ConstArrayKey = (Vec<i64>, ElemWidth);

/// Ids of the well-known runtime entities a fragment may carry (normally
/// only the standard-library fragment sets any of these).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BuiltinSymbols {
    /// Base exception class type; shapes the defined exception tag.
    pub base_exception: Option<SymbolId>,
    /// Base "any" class type; result type of the associated-object getter.
    pub base_any: Option<SymbolId>,
    /// Adapter from a foreign object to a module object.
    pub foreign_adapter: Option<SymbolId>,
    /// Singleton/unit instance initializer.
    pub singleton_init: Option<SymbolId>,
    /// Root test-suite runner; its presence enables `startUnitTests`.
    pub run_root_suites: Option<SymbolId>,
    /// Reflective module-descriptor registration hook.
    pub register_module_descriptor: Option<SymbolId>,
    /// String constructor backing the string-literal pool service.
    pub create_string: Option<SymbolId>,
}

/// Type cells a fragment holds for the linker-synthesized special
/// interface-table types.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpecialITableRefs {
    pub any_array: CellId,
    pub special_slot: CellId,
}

/// One runtime-type-info global contributed by a fragment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RttiGlobal {
    pub global: Global,
    pub class_id: SymbolId,
    pub super_class: Option<SymbolId>,
}

/// A fragment's runtime-type-info contribution: the globals it defines,
/// the global cells it wants bound to other classes' RTTI, and a type
/// cell for the synthesized RTTI record type.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RttiContribution {
    pub globals: Vec<RttiGlobal>,
    /// Cells into the fragment's global arena, keyed by class symbol.
    pub unbound: IndexMap<SymbolId, CellId>,
    pub rtti_type: Option<CellId>,
}

/// A foreign-function bridge: an imported function's glue snippet plus the
/// cell through which its import name is finally assigned (names are
/// deduplicated module-wide).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FfiBridge {
    pub module: String,
    pub import_name: String,
    pub name_cell: CellId,
    pub code: String,
}

/// An export this fragment requests for one of its own functions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FragmentExport {
    pub export_name: String,
    pub target: SymbolId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssociatedObject {
    pub key_id: i64,
    pub getter: SymbolId,
    pub external: bool,
}

impl AssociatedObject {
    pub fn new(key_id: i64, getter: impl Into<SymbolId>, external: bool) -> Self {
        AssociatedObject { key_id, getter: getter.into(), external }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClassAssociatedObjects {
    pub class_id: i64,
    pub objects: Vec<AssociatedObject>,
}

/// One source file's compiled output, ready for linking.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Fragment {
    /// Source-file tag, for diagnostics only.
    pub name: String,

    pub functions: EntityTable<Function>,
    pub global_fields: EntityTable<Global>,
    pub global_vtables: EntityTable<Global>,
    pub global_itables: EntityTable<Global>,
    pub func_types: EntityTable<FuncType>,
    pub class_types: EntityTable<TypeDecl>,
    pub vtable_types: EntityTable<TypeDecl>,

    /// Per-kind resolution arenas; `FuncUse::Sym` indexes `func_cells`,
    /// and so on. Tables of the same kind share one arena.
    pub func_cells: CellTable<FuncId>,
    pub global_cells: CellTable<GlobalId>,
    pub type_cells: CellTable<TypeId>,

    pub string_addresses: RefTable<String, u32>,
    pub string_pool_ids: RefTable<String, u32>,
    pub const_arrays: RefTable<ConstArrayKey, u32>,

    pub ffi_bridges: IndexMap<SymbolId, FfiBridge>,
    pub ffi_name_cells: CellTable<String>,

    /// Exception tags this fragment defines or imports; the target
    /// supports at most one module-wide.
    pub tags: Vec<Tag>,
    pub exports: Vec<FragmentExport>,
    /// Entry-point wrappers `_initialize` must call, in order.
    pub init_wrappers: Vec<SymbolId>,
    pub test_declarators: Vec<SymbolId>,
    /// (semantic shape key, local definition id) pairs for adapter
    /// functions that other fragments derive identically.
    pub equivalent_functions: Vec<(String, SymbolId)>,
    pub associated_objects: Vec<ClassAssociatedObjects>,
    pub builtins: Option<BuiltinSymbols>,
    pub special_itable_refs: Option<SpecialITableRefs>,
    pub rtti: Option<RttiContribution>,
    /// Cells bound to the synthesized `_stringLiteral` function/type.
    pub string_literal_fn: Option<CellId>,
    pub string_literal_type: Option<CellId>,
    pub instance_field_inits: Vec<SymbolId>,
    pub field_inits: Vec<SymbolId>,
}

impl Fragment {
    pub fn new(name: impl Into<String>) -> Self {
        Fragment {
            name: name.into(),
            ..Fragment::default()
        }
    }

    pub fn define_function(&mut self, id: impl Into<SymbolId>, func: Function) -> LinkResult<()> {
        self.functions.define(id.into(), func)
    }

    pub fn reference_function(&mut self, id: impl Into<SymbolId>) -> CellId {
        self.functions.reference(id.into(), &mut self.func_cells)
    }

    pub fn reference_global_field(&mut self, id: impl Into<SymbolId>) -> CellId {
        self.global_fields.reference(id.into(), &mut self.global_cells)
    }

    pub fn reference_vtable(&mut self, id: impl Into<SymbolId>) -> CellId {
        self.global_vtables.reference(id.into(), &mut self.global_cells)
    }

    pub fn reference_itable(&mut self, id: impl Into<SymbolId>) -> CellId {
        self.global_itables.reference(id.into(), &mut self.global_cells)
    }

    pub fn reference_class_type(&mut self, id: impl Into<SymbolId>) -> CellId {
        self.class_types.reference(id.into(), &mut self.type_cells)
    }

    pub fn reference_vtable_type(&mut self, id: impl Into<SymbolId>) -> CellId {
        self.vtable_types.reference(id.into(), &mut self.type_cells)
    }

    pub fn reference_func_type(&mut self, id: impl Into<SymbolId>) -> CellId {
        self.func_types.reference(id.into(), &mut self.type_cells)
    }

    /// Record a use of a string literal; returns the (address, pool id)
    /// cells every use of this literal in this fragment shares.
    pub fn reference_string(&mut self, literal: &str) -> (CellId, CellId) {
        let addr = self.string_addresses.reference(literal.to_string());
        let pool = self.string_pool_ids.reference(literal.to_string());
        (addr, pool)
    }

    pub fn reference_const_array(&mut self, values: Vec<i64>, width: ElemWidth) -> CellId {
        self.const_arrays.reference((values, width))
    }

    /// Register a foreign bridge import; the returned cell is bound to the
    /// final (deduplicated) import name during linking.
    pub fn add_ffi_bridge(
        &mut self,
        id: impl Into<SymbolId>,
        module: impl Into<String>,
        import_name: impl Into<String>,
        code: impl Into<String>,
    ) -> CellId {
        let name_cell = self.ffi_name_cells.alloc();
        self.ffi_bridges.insert(
            id.into(),
            FfiBridge {
                module: module.into(),
                import_name: import_name.into(),
                name_cell,
                code: code.into(),
            },
        );
        name_cell
    }

    pub fn export_function(&mut self, export_name: impl Into<String>, target: impl Into<SymbolId>) {
        self.exports.push(FragmentExport {
            export_name: export_name.into(),
            target: target.into(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{FuncUse, Instr, TypeUse};

    #[test]
    fn string_reference_shares_cells_within_fragment() {
        let mut fragment = Fragment::new("a.src");
        let (addr1, pool1) = fragment.reference_string("abc");
        let (addr2, pool2) = fragment.reference_string("abc");
        assert_eq!(addr1, addr2);
        assert_eq!(pool1, pool2);
        assert_eq!(fragment.string_addresses.unbound.len(), 1);
    }

    #[test]
    fn fragment_round_trips_through_json() {
        let mut fragment = Fragment::new("roundtrip.src");
        let cell = fragment.reference_function("pkg.foo");
        let ty = TypeUse::Sym(fragment.reference_func_type("sig.bar"));
        fragment
            .define_function(
                "pkg.bar",
                Function::Defined {
                    name: "bar".to_string(),
                    ty,
                    locals: vec![],
                    body: vec![Instr::Call(FuncUse::Sym(cell))],
                },
            )
            .unwrap();
        fragment.reference_const_array(vec![1, 2, 3], ElemWidth::W2);
        fragment.builtins = Some(BuiltinSymbols {
            base_any: Some("std.Any".into()),
            ..BuiltinSymbols::default()
        });

        let json = serde_json::to_string(&fragment).unwrap();
        let back: Fragment = serde_json::from_str(&json).unwrap();
        assert_eq!(back.name, "roundtrip.src");
        assert!(back.functions.defined.contains_key(&SymbolId::from("pkg.bar")));
        assert_eq!(back.const_arrays.unbound.len(), 1);
    }
}
