//! Symbol identities and the write-once resolution-cell arena.
//!
//! Fragments never point at each other's declarations directly. A fragment
//! refers to an entity through a [`CellId`], an index into the resolution
//! arena the owning fragment keeps for that entity kind. The linker binds
//! each cell exactly once; every holder of the cell index then observes
//! the same resolved entity. Binding is idempotent for equal values and an
//! internal error for conflicting ones.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::hash::Hash;

use crate::error::{LinkError, LinkResult};

/// Stable cross-fragment identifier, derived by the lowering stage from the
/// fully-qualified name/signature of the originating declaration.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SymbolId(pub String);

impl SymbolId {
    pub fn new(name: impl Into<String>) -> Self {
        SymbolId(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SymbolId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SymbolId {
    fn from(name: &str) -> Self {
        SymbolId(name.to_string())
    }
}

/// Index of a resolution cell within one [`CellTable`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CellId(pub u32);

/// Arena of write-once resolution cells.
///
/// Cells start unbound; [`CellTable::bind`] writes a value once. Rebinding
/// with an equal value is a no-op so that canonicalization may bind a cell
/// ahead of the general resolution pass.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CellTable<V> {
    cells: Vec<Option<V>>,
}

impl<V> Default for CellTable<V> {
    fn default() -> Self {
        CellTable { cells: Vec::new() }
    }
}

impl<V: PartialEq + fmt::Debug> CellTable<V> {
    pub fn alloc(&mut self) -> CellId {
        let id = CellId(self.cells.len() as u32);
        self.cells.push(None);
        id
    }

    pub fn bind(&mut self, cell: CellId, value: V) -> LinkResult<()> {
        let slot = self
            .cells
            .get_mut(cell.0 as usize)
            .ok_or_else(|| LinkError::inconsistency(format!("cell {} out of range", cell.0)))?;
        match slot {
            None => {
                *slot = Some(value);
                Ok(())
            }
            Some(existing) if *existing == value => Ok(()),
            Some(existing) => Err(LinkError::inconsistency(format!(
                "cell {} already bound to {existing:?}, rebind to {value:?}",
                cell.0
            ))),
        }
    }

    pub fn is_bound(&self, cell: CellId) -> bool {
        matches!(self.cells.get(cell.0 as usize), Some(Some(_)))
    }

    pub fn get(&self, cell: CellId) -> Option<&V> {
        self.cells.get(cell.0 as usize).and_then(|slot| slot.as_ref())
    }

    /// Resolved value of a cell that must be bound by now.
    pub fn resolved(&self, cell: CellId) -> LinkResult<&V> {
        self.get(cell)
            .ok_or_else(|| LinkError::inconsistency(format!("cell {} is still unbound", cell.0)))
    }
}

/// Reference side of a pool table: maps a logical value to the single cell
/// shared by every use of that value within one fragment. Serialized as a
/// pair sequence because pool keys are not JSON-safe map keys.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(bound(
    serialize = "K: Serialize, V: Serialize",
    deserialize = "K: Deserialize<'de>, V: Deserialize<'de>"
))]
pub struct RefTable<K: Hash + Eq, V> {
    #[serde(with = "indexmap::map::serde_seq")]
    pub unbound: IndexMap<K, CellId>,
    pub cells: CellTable<V>,
}

impl<K: Hash + Eq, V> Default for RefTable<K, V> {
    fn default() -> Self {
        RefTable {
            unbound: IndexMap::new(),
            cells: CellTable::default(),
        }
    }
}

impl<K: Hash + Eq, V: PartialEq + fmt::Debug> RefTable<K, V> {
    /// One cell per key, allocated on first use.
    pub fn reference(&mut self, key: K) -> CellId {
        let cells = &mut self.cells;
        *self.unbound.entry(key).or_insert_with(|| cells.alloc())
    }
}

/// Defined-vs-referenced split for one kind of linkable entity within one
/// fragment. `defined` entries are this fragment's own declarations;
/// `unbound` entries await a definition from elsewhere in the module.
/// Cells live in the fragment's per-kind arena, shared by tables of the
/// same kind so a cell index in code is unambiguous.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntityTable<T> {
    pub defined: IndexMap<SymbolId, T>,
    pub unbound: IndexMap<SymbolId, CellId>,
}

impl<T> Default for EntityTable<T> {
    fn default() -> Self {
        EntityTable {
            defined: IndexMap::new(),
            unbound: IndexMap::new(),
        }
    }
}

impl<T> EntityTable<T> {
    /// Register a definition; a fragment may define each id only once.
    pub fn define(&mut self, id: SymbolId, entity: T) -> LinkResult<()> {
        if self.defined.contains_key(&id) {
            return Err(LinkError::DuplicateDefinition(id));
        }
        self.defined.insert(id, entity);
        Ok(())
    }

    /// One cell per id, allocated from the kind's arena on first use.
    pub fn reference<Id: PartialEq + fmt::Debug>(
        &mut self,
        id: SymbolId,
        cells: &mut CellTable<Id>,
    ) -> CellId {
        *self.unbound.entry(id).or_insert_with(|| cells.alloc())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cell_binds_once() {
        let mut cells: CellTable<u32> = CellTable::default();
        let c = cells.alloc();
        assert!(!cells.is_bound(c));
        cells.bind(c, 7).unwrap();
        assert_eq!(cells.get(c), Some(&7));
        // Same value again is fine.
        cells.bind(c, 7).unwrap();
        // A conflicting value is an internal error.
        assert!(matches!(cells.bind(c, 8), Err(LinkError::Inconsistency(_))));
    }

    #[test]
    fn reference_memoizes_one_cell_per_key() {
        let mut refs: RefTable<String, u32> = RefTable::default();
        let a = refs.reference("abc".to_string());
        let b = refs.reference("abc".to_string());
        let c = refs.reference("def".to_string());
        assert_eq!(a, b);
        assert_ne!(a, c);
        refs.cells.bind(a, 42).unwrap();
        // The second holder of the cell sees the same resolution.
        assert_eq!(refs.cells.get(b), Some(&42));
    }

    #[test]
    fn table_rejects_local_redefinition() {
        let mut cells: CellTable<u32> = CellTable::default();
        let mut table: EntityTable<&'static str> = EntityTable::default();
        table.define(SymbolId::from("f"), "first").unwrap();
        let err = table.define(SymbolId::from("f"), "second").unwrap_err();
        assert!(matches!(err, LinkError::DuplicateDefinition(id) if id.as_str() == "f"));
        // References to distinct ids get distinct cells.
        let a = table.reference(SymbolId::from("f"), &mut cells);
        let b = table.reference(SymbolId::from("g"), &mut cells);
        assert_ne!(a, b);
    }
}
