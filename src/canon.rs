//! Canonicalization: structural function-type deduplication and
//! equivalent-adapter collapsing.
//!
//! Runs after merging and before reference resolution, so that references
//! to collapsed entities can be redirected by binding their cells early;
//! the resolution pass skips cells that are already bound.

use indexmap::IndexMap;

use crate::error::LinkResult;
use crate::groups::TypeKind;
use crate::ir::{FuncId, FuncType, TypeDecl};
use crate::linker::Linker;
use crate::symbol::SymbolId;

impl Linker {
    pub(crate) fn canonicalize(&mut self) -> LinkResult<()> {
        self.canonicalize_func_types();
        self.rebind_equivalent_functions()
    }

    /// Merge every fragment's function-type definitions, collapsing
    /// structurally-equal signatures to one representative declaration.
    ///
    /// Unlike the other entity kinds, one signature id defined by several
    /// fragments is not an error: lowering derives these ids from the
    /// signature itself, so collisions are expected and the first
    /// definition wins.
    fn canonicalize_func_types(&mut self) {
        for i in 0..self.fragments.len() {
            let drained: Vec<(SymbolId, FuncType)> =
                self.fragments[i].func_types.defined.drain(..).collect();
            for (id, ty) in drained {
                let tid = match self.canon_func_types.get(&ty) {
                    Some(&tid) => tid,
                    None => {
                        let tid = self.push_type(TypeDecl::Func(ty.clone()), TypeKind::FuncSig, None);
                        self.canon_func_types.insert(ty, tid);
                        tid
                    }
                };
                self.func_type_defs.entry(id).or_insert(tid);
            }
        }
    }

    /// Collapse adapter functions that several fragments derive
    /// identically. Fragments tag such functions with a semantic shape
    /// key; the first definition seen (in fragment order) survives, later
    /// ones are discarded along with their exports and foreign bridges,
    /// and the discarding fragment's own references are redirected to the
    /// survivor.
    fn rebind_equivalent_functions(&mut self) -> LinkResult<()> {
        let mut chosen: IndexMap<String, FuncId> = IndexMap::new();
        for i in 0..self.fragments.len() {
            let pairs = self.fragments[i].equivalent_functions.clone();
            for (key, id) in pairs {
                match chosen.get(&key) {
                    None => {
                        // A tagged function removed by earlier tree shaking
                        // simply never becomes a representative.
                        if let Some(&fid) = self.func_defs.get(&id) {
                            chosen.insert(key, fid);
                        }
                    }
                    Some(&survivor) => {
                        let Some(fid) = self.func_defs.shift_remove(&id) else {
                            continue;
                        };
                        tracing::debug!(%id, key, "collapsing equivalent function");
                        self.funcs[fid.0 as usize] = None;
                        let frag = &mut self.fragments[i];
                        frag.exports.retain(|e| e.target != id);
                        frag.ffi_bridges.shift_remove(&id);
                        if let Some(&cell) = frag.functions.unbound.get(&id) {
                            frag.func_cells.bind(cell, survivor)?;
                        }
                    }
                }
            }
        }
        Ok(())
    }
}
