//! Literal pools: string data and constant numeric arrays.
//!
//! Strings are interned module-wide into one passive data segment (always
//! segment 0) as UTF-16LE code units; each literal gets a byte address and
//! a dense pool index, and every fragment's cells for that literal are
//! bound to the shared pair. Constant arrays are pooled the same way, one
//! passive segment per distinct (values, width) key, starting at segment 1.

use indexmap::IndexMap;

use crate::error::{LinkError, LinkResult};
use crate::fragment::ConstArrayKey;
use crate::ir::DataSegment;
use crate::linker::Linker;
use crate::symbol::CellId;

impl Linker {
    pub(crate) fn bind_resource_pools(&mut self) -> LinkResult<()> {
        self.bind_string_pool()?;
        self.bind_const_array_pool()
    }

    fn bind_string_pool(&mut self) -> LinkResult<()> {
        let mut bytes: Vec<u8> = Vec::new();
        // literal -> (byte address, pool index), in first-use order.
        let mut pool: IndexMap<String, (u32, u32)> = IndexMap::new();

        for frag in self.fragments.iter_mut() {
            let pending: Vec<(String, CellId)> = frag
                .string_addresses
                .unbound
                .iter()
                .map(|(literal, &cell)| (literal.clone(), cell))
                .collect();
            for (literal, addr_cell) in pending {
                let next_index = pool.len() as u32;
                let (address, pool_index) = *pool.entry(literal.clone()).or_insert_with(|| {
                    let address = bytes.len() as u32;
                    for unit in literal.encode_utf16() {
                        bytes.extend_from_slice(&unit.to_le_bytes());
                    }
                    (address, next_index)
                });
                frag.string_addresses.cells.bind(addr_cell, address)?;
                let pool_cell =
                    frag.string_pool_ids.unbound.get(&literal).copied().ok_or_else(|| {
                        LinkError::inconsistency(format!(
                            "literal {literal:?} has an address cell but no pool-id cell"
                        ))
                    })?;
                frag.string_pool_ids.cells.bind(pool_cell, pool_index)?;
            }
        }

        tracing::debug!(literals = pool.len(), bytes = bytes.len(), "string pool sealed");
        self.string_pool_size = pool.len() as u32;
        self.data.push(DataSegment { bytes });
        Ok(())
    }

    fn bind_const_array_pool(&mut self) -> LinkResult<()> {
        let Linker { fragments, data, .. } = self;
        let mut pooled: IndexMap<ConstArrayKey, u32> = IndexMap::new();

        for frag in fragments.iter_mut() {
            let pending: Vec<(ConstArrayKey, CellId)> = frag
                .const_arrays
                .unbound
                .iter()
                .map(|(key, &cell)| (key.clone(), cell))
                .collect();
            for (key, cell) in pending {
                let segment = *pooled.entry(key.clone()).or_insert_with(|| {
                    let (values, width) = &key;
                    let size = width.byte_size();
                    let mut bytes = Vec::with_capacity(values.len() * size);
                    for value in values {
                        bytes.extend_from_slice(&value.to_le_bytes()[..size]);
                    }
                    let index = data.len() as u32;
                    data.push(DataSegment { bytes });
                    index
                });
                frag.const_arrays.cells.bind(cell, segment)?;
            }
        }
        tracing::debug!(arrays = pooled.len(), "constant array pool sealed");
        Ok(())
    }
}
