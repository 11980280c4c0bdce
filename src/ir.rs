//! The linkable intermediate representation.
//!
//! This is the subset of a Wasm-GC style object format that the linker
//! manipulates: type declarations, functions, globals, memories, tags,
//! exports, element and data segments, and the handful of instructions the
//! service-code synthesizer emits. Everything is serde-serializable so the
//! lowering stage can hand fragments over as files.
//!
//! References come in two flavors. Inside *type declarations* (struct
//! fields, supertypes, signatures) other types are named by [`TypeRef`],
//! since signatures double as structural keys. Inside *code*, entities are
//! referenced through resolution cells ([`FuncUse::Sym`] etc.) until the
//! final id pass rewrites them to concrete indices.

use serde::{Deserialize, Serialize};

use crate::symbol::{CellId, SymbolId};

/// Function handle. During linking this indexes the linker's function
/// slab; after `Linker::link` returns it is the final index in the
/// module's unified function index space (imports first).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FuncId(pub u32);

/// Global handle; same two-phase meaning as [`FuncId`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct GlobalId(pub u32);

/// Type-declaration handle; same two-phase meaning as [`FuncId`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TypeId(pub u32);

/// Reference to a type declaration from within another declaration.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TypeRef {
    /// By stable symbol id; resolved during linking.
    Named(SymbolId),
    /// Already-resolved handle (synthetic types, post-finalize decls).
    Type(TypeId),
}

/// Element width of a pooled constant array, in bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ElemWidth {
    W1,
    W2,
    W4,
    W8,
}

impl ElemWidth {
    pub fn byte_size(self) -> usize {
        match self {
            ElemWidth::W1 => 1,
            ElemWidth::W2 => 2,
            ElemWidth::W4 => 4,
            ElemWidth::W8 => 8,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum HeapType {
    Any,
    Extern,
    Func,
    /// The `none` bottom type; `ref.null none` produces the "no result"
    /// sentinel of the associated-object dispatcher.
    None,
    Type(TypeRef),
}

/// Value and storage types (the packed `i8`/`i16` forms only appear as
/// array/struct field storage).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ValType {
    I8,
    I16,
    I32,
    I64,
    F32,
    F64,
    Ref { nullable: bool, heap: HeapType },
}

impl ValType {
    pub fn nullable_ref(heap: HeapType) -> ValType {
        ValType::Ref { nullable: true, heap }
    }

    pub fn non_null_ref(heap: HeapType) -> ValType {
        ValType::Ref { nullable: false, heap }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FieldDecl {
    pub name: String,
    pub ty: ValType,
    pub mutable: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StructDecl {
    pub name: String,
    pub fields: Vec<FieldDecl>,
    pub super_type: Option<TypeRef>,
    pub is_final: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ArrayDecl {
    pub name: String,
    pub field: FieldDecl,
}

/// Structural function signature. Doubles as the canonicalization key:
/// two signatures are the same iff params and results compare equal,
/// with nested type references compared by symbol id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FuncType {
    pub params: Vec<ValType>,
    pub results: Vec<ValType>,
}

impl FuncType {
    pub fn new(params: Vec<ValType>, results: Vec<ValType>) -> Self {
        FuncType { params, results }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TypeDecl {
    Struct(StructDecl),
    Array(ArrayDecl),
    Func(FuncType),
}

impl TypeDecl {
    pub fn name(&self) -> &str {
        match self {
            TypeDecl::Struct(s) => &s.name,
            TypeDecl::Array(a) => &a.name,
            TypeDecl::Func(_) => "",
        }
    }
}

/// Function reference in code: a resolution cell of the owning fragment,
/// or a concrete handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FuncUse {
    Sym(CellId),
    Func(FuncId),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum GlobalUse {
    Sym(CellId),
    Global(GlobalId),
}

/// Type reference in instruction immediates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TypeUse {
    Sym(CellId),
    Type(TypeId),
}

/// Passive data segment reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DataUse {
    Sym(CellId),
    Idx(u32),
}

/// Import-name reference for foreign bridges; the name may be rewritten
/// by the unique-name pass, which binds the shared cell.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum NameUse {
    Sym(CellId),
    Value(String),
}

/// The instruction subset the linker understands: what fragment bodies may
/// carry across the link boundary plus what service code synthesis emits.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Instr {
    I32Const(i32),
    I64Const(i64),
    LocalGet(u32),
    LocalTee(u32),
    GlobalGet(GlobalUse),
    GlobalSet(GlobalUse),
    Call(FuncUse),
    RefFunc(FuncUse),
    RefNull(HeapType),
    I64Eq,
    If,
    End,
    Return,
    Block { result: Option<ValType> },
    BrOnNonNull(u32),
    ArrayGet(TypeUse),
    ArraySet(TypeUse),
    ArrayNewDefault(TypeUse),
    ArrayNewData(TypeUse, DataUse),
    /// Byte offset of a pooled string literal; becomes `I32Const`.
    StringAddress(CellId),
    /// Pool index of a pooled string literal; becomes `I32Const`.
    StringPoolId(CellId),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Local {
    pub name: String,
    pub ty: ValType,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImportPair {
    pub module: String,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Function {
    Defined {
        name: String,
        ty: TypeUse,
        locals: Vec<Local>,
        body: Vec<Instr>,
    },
    Imported {
        name: String,
        ty: TypeUse,
        module: String,
        import_name: NameUse,
    },
}

impl Function {
    pub fn name(&self) -> &str {
        match self {
            Function::Defined { name, .. } | Function::Imported { name, .. } => name,
        }
    }

    pub fn is_imported(&self) -> bool {
        matches!(self, Function::Imported { .. })
    }

    pub fn ty(&self) -> TypeUse {
        match self {
            Function::Defined { ty, .. } | Function::Imported { ty, .. } => *ty,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Global {
    pub name: String,
    pub ty: ValType,
    pub mutable: bool,
    pub init: Vec<Instr>,
    pub import: Option<ImportPair>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Memory {
    pub min_pages: u32,
    pub max_pages: Option<u32>,
    pub import: Option<ImportPair>,
}

/// Exception tag; its signature lives in the type section like any
/// function type. Fragment-contributed tags carry a resolution cell
/// until the final id pass.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tag {
    pub ty: TypeUse,
    pub import: Option<ImportPair>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExportKind {
    Func(u32),
    Global(u32),
    Memory(u32),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Export {
    pub name: String,
    pub kind: ExportKind,
}

/// Element segments are only used declaratively here, to make service
/// functions valid `ref.func` targets.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Element {
    pub funcs: Vec<FuncUse>,
}

/// A passive data segment of the final module.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataSegment {
    pub bytes: Vec<u8>,
}

/// Foreign glue snippet carried through to the host-side glue emitter,
/// keyed by the deduplicated import name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FfiGlue {
    pub import_name: String,
    pub code: String,
}

/// The linked module. Field order mirrors the section order the host
/// environment expects: types, then imports before definitions by entity
/// kind. Produced once per link and handed to the external serializer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Module {
    pub rec_groups: Vec<Vec<TypeDecl>>,
    pub imported_functions: Vec<Function>,
    pub imported_tags: Vec<Tag>,
    pub imported_globals: Vec<Global>,
    pub imported_memories: Vec<Memory>,
    pub functions: Vec<Function>,
    pub memories: Vec<Memory>,
    pub globals: Vec<Global>,
    pub exports: Vec<Export>,
    pub start: Option<u32>,
    pub elements: Vec<Element>,
    pub data: Vec<DataSegment>,
    pub tags: Vec<Tag>,
    pub ffi_glue: Vec<FfiGlue>,
}
