//! Recursion-group computation for the type section.
//!
//! Mutually recursive type declarations must be emitted inside one
//! recursion group; everything else gets the smallest group possible, in
//! dependency-first order. Groups are strongly connected components of
//! the type reference graph, discovered with Tarjan's algorithm, which
//! completes a component only after every component it depends on, so the
//! natural completion order already satisfies declaration-before-use.
//!
//! Group content order feeds the module's ABI, so it must not depend on
//! hash iteration: members of a group containing class or vtable
//! declarations are stably sorted by their declaration identity, and such
//! a group gets a marker member appended whose name carries a hash of the
//! first class member's identity, making recursive-group shapes
//! recognizable across separately-produced modules.

use rustc_hash::FxHashMap;

use crate::error::{LinkError, LinkResult};
use crate::ir::{FieldDecl, HeapType, StructDecl, TypeDecl, TypeId, TypeRef, ValType};
use crate::symbol::SymbolId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TypeKind {
    Class,
    VTable,
    FuncSig,
    Synthetic,
}

/// One slot of the linker's type slab.
#[derive(Debug)]
pub(crate) struct TypeEntry {
    pub decl: TypeDecl,
    pub kind: TypeKind,
    /// Defining symbol for fragment-contributed types; doubles as the
    /// deterministic sort identity within a group.
    pub origin: Option<SymbolId>,
}

impl TypeEntry {
    fn sort_identity(&self, slab: u32) -> String {
        match &self.origin {
            Some(id) => id.as_str().to_string(),
            None if !self.decl.name().is_empty() => self.decl.name().to_string(),
            None => format!("~{slab}"),
        }
    }
}

/// Partition `participants` into recursion groups. A lone array type with
/// no cycle stays a singleton group untouched; `entries` grows only by
/// marker members.
pub(crate) fn compute_rec_groups(
    entries: &mut Vec<TypeEntry>,
    participants: &[TypeId],
    named: &FxHashMap<SymbolId, TypeId>,
) -> LinkResult<Vec<Vec<TypeId>>> {
    let position: FxHashMap<u32, usize> = participants
        .iter()
        .enumerate()
        .map(|(i, tid)| (tid.0, i))
        .collect();

    // Edges between participants, in declaration order per node.
    let mut edges: Vec<Vec<usize>> = Vec::with_capacity(participants.len());
    for &tid in participants {
        let entry = entries
            .get(tid.0 as usize)
            .ok_or_else(|| LinkError::inconsistency(format!("type {} out of range", tid.0)))?;
        let mut out = Vec::new();
        for target in referenced_types(&entry.decl, named)? {
            if let Some(&pos) = position.get(&target.0) {
                out.push(pos);
            }
            // References to non-participants (service types emitted as
            // trailing singleton groups) cannot form cycles here.
        }
        edges.push(out);
    }

    let components = Tarjan::run(&edges);

    let mut groups = Vec::with_capacity(components.len());
    for component in components {
        let mut group: Vec<TypeId> = component.into_iter().map(|pos| participants[pos]).collect();

        // A lone array never needs sorting or a marker.
        if group.len() == 1
            && matches!(entries[group[0].0 as usize].decl, TypeDecl::Array(_))
        {
            groups.push(group);
            continue;
        }

        let has_identity_members = group.iter().any(|tid| {
            matches!(
                entries[tid.0 as usize].kind,
                TypeKind::Class | TypeKind::VTable
            )
        });
        if has_identity_members {
            group.sort_by_key(|tid| entries[tid.0 as usize].sort_identity(tid.0));
        }

        if let Some(marker) = group_marker(entries, &group) {
            let tid = TypeId(entries.len() as u32);
            entries.push(TypeEntry {
                decl: marker,
                kind: TypeKind::Synthetic,
                origin: None,
            });
            group.push(tid);
        }
        groups.push(group);
    }
    Ok(groups)
}

/// Marker member for a group holding class declarations, giving the group
/// a shape recognizable across separately-produced modules; its name
/// hashes the first class struct's identity.
fn group_marker(entries: &[TypeEntry], group: &[TypeId]) -> Option<TypeDecl> {
    let first_class = group.iter().find_map(|tid| {
        let entry = &entries[tid.0 as usize];
        match (&entry.decl, entry.kind, &entry.origin) {
            (TypeDecl::Struct(_), TypeKind::Class, Some(origin)) => Some(origin),
            _ => None,
        }
    })?;
    let hash = crc32fast::hash(first_class.as_str().as_bytes());
    Some(TypeDecl::Struct(StructDecl {
        name: format!("cycle_marker_{hash:08x}"),
        fields: vec![],
        super_type: None,
        is_final: true,
    }))
}

/// Types a declaration mentions, in declaration order.
fn referenced_types(
    decl: &TypeDecl,
    named: &FxHashMap<SymbolId, TypeId>,
) -> LinkResult<Vec<TypeId>> {
    let mut out = Vec::new();
    match decl {
        TypeDecl::Struct(s) => {
            if let Some(super_type) = &s.super_type {
                out.push(resolve_ref(super_type, named)?);
            }
            for FieldDecl { ty, .. } in &s.fields {
                collect_val(ty, named, &mut out)?;
            }
        }
        TypeDecl::Array(a) => collect_val(&a.field.ty, named, &mut out)?,
        TypeDecl::Func(ft) => {
            for ty in ft.params.iter().chain(&ft.results) {
                collect_val(ty, named, &mut out)?;
            }
        }
    }
    Ok(out)
}

fn resolve_ref(tr: &TypeRef, named: &FxHashMap<SymbolId, TypeId>) -> LinkResult<TypeId> {
    match tr {
        TypeRef::Type(tid) => Ok(*tid),
        TypeRef::Named(id) => named
            .get(id)
            .copied()
            .ok_or_else(|| LinkError::UnresolvedSymbol(id.clone())),
    }
}

fn collect_val(
    ty: &ValType,
    named: &FxHashMap<SymbolId, TypeId>,
    out: &mut Vec<TypeId>,
) -> LinkResult<()> {
    if let ValType::Ref { heap: HeapType::Type(tr), .. } = ty {
        out.push(resolve_ref(tr, named)?);
    }
    Ok(())
}

struct Tarjan<'a> {
    edges: &'a [Vec<usize>],
    index: Vec<Option<u32>>,
    lowlink: Vec<u32>,
    on_stack: Vec<bool>,
    stack: Vec<usize>,
    next: u32,
    components: Vec<Vec<usize>>,
}

impl<'a> Tarjan<'a> {
    fn run(edges: &'a [Vec<usize>]) -> Vec<Vec<usize>> {
        let n = edges.len();
        let mut t = Tarjan {
            edges,
            index: vec![None; n],
            lowlink: vec![0; n],
            on_stack: vec![false; n],
            stack: Vec::new(),
            next: 0,
            components: Vec::new(),
        };
        for v in 0..n {
            if t.index[v].is_none() {
                t.connect(v);
            }
        }
        t.components
    }

    fn connect(&mut self, v: usize) {
        self.index[v] = Some(self.next);
        self.lowlink[v] = self.next;
        self.next += 1;
        self.stack.push(v);
        self.on_stack[v] = true;

        for i in 0..self.edges[v].len() {
            let w = self.edges[v][i];
            match self.index[w] {
                None => {
                    self.connect(w);
                    self.lowlink[v] = self.lowlink[v].min(self.lowlink[w]);
                }
                Some(w_index) if self.on_stack[w] => {
                    self.lowlink[v] = self.lowlink[v].min(w_index);
                }
                Some(_) => {}
            }
        }

        if Some(self.lowlink[v]) == self.index[v] {
            let mut component = Vec::new();
            loop {
                let w = self.stack.pop().expect("tarjan stack underflow");
                self.on_stack[w] = false;
                component.push(w);
                if w == v {
                    break;
                }
            }
            component.reverse();
            self.components.push(component);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::ArrayDecl;

    fn class(name: &str, refs: &[&str]) -> TypeEntry {
        TypeEntry {
            decl: TypeDecl::Struct(StructDecl {
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
            }),
            kind: TypeKind::Class,
            origin: Some(name.into()),
        }
    }

    fn array(name: &str) -> TypeEntry {
        TypeEntry {
            decl: TypeDecl::Array(ArrayDecl {
                name: name.to_string(),
                field: FieldDecl {
                    name: String::new(),
                    ty: ValType::I32,
                    mutable: true,
                },
            }),
            kind: TypeKind::Class,
            origin: Some(name.into()),
        }
    }

    fn named(entries: &[TypeEntry]) -> FxHashMap<SymbolId, TypeId> {
        entries
            .iter()
            .enumerate()
            .filter_map(|(i, e)| e.origin.clone().map(|o| (o, TypeId(i as u32))))
            .collect()
    }

    #[test]
    fn cycle_members_share_one_group_and_a_lone_array_stands_alone() {
        let mut entries = vec![
            class("A", &["B"]),
            class("B", &["C"]),
            class("C", &["A"]),
            array("IntBox"),
        ];
        let lookup = named(&entries);
        let participants: Vec<TypeId> = (0..4).map(TypeId).collect();
        let groups = compute_rec_groups(&mut entries, &participants, &lookup).unwrap();

        assert_eq!(groups.len(), 2);
        // A, B, C plus the appended cycle marker.
        assert_eq!(groups[0].len(), 4);
        assert_eq!(groups[1], vec![TypeId(3)]);
        let marker = &entries[groups[0][3].0 as usize];
        assert!(marker.decl.name().starts_with("cycle_marker_"));
    }

    #[test]
    fn group_members_sort_by_declaration_identity() {
        let mut entries = vec![class("zeta", &["alpha"]), class("alpha", &["zeta"])];
        let lookup = named(&entries);
        let groups =
            compute_rec_groups(&mut entries, &[TypeId(0), TypeId(1)], &lookup).unwrap();
        assert_eq!(&groups[0][..2], &[TypeId(1), TypeId(0)]);
    }

    #[test]
    fn dependencies_precede_dependents() {
        let mut entries = vec![class("Derived", &["Base"]), class("Base", &[])];
        let lookup = named(&entries);
        let groups =
            compute_rec_groups(&mut entries, &[TypeId(0), TypeId(1)], &lookup).unwrap();
        // Each singleton class group still gets its marker member.
        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0][0], TypeId(1));
        assert_eq!(groups[1][0], TypeId(0));
    }

    #[test]
    fn missing_named_reference_is_reported() {
        let mut entries = vec![class("Orphan", &["Nowhere"])];
        let lookup = named(&entries);
        let err = compute_rec_groups(&mut entries, &[TypeId(0)], &lookup).unwrap_err();
        assert!(matches!(err, LinkError::UnresolvedSymbol(id) if id.as_str() == "Nowhere"));
    }
}
