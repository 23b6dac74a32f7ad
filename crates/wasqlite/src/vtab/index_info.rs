//! The planning descriptor and its wasm32 byte layout.
//!
//! `best_index` negotiation crosses the boundary through a fixed-layout
//! struct owned by the engine. The offsets below are the engine's public
//! ABI; they must match exactly, so they are kept in one table and covered
//! by conformance tests rather than spread across call sites. [`load`]
//! reads every input field into a host-native [`IndexInfo`]; [`save`]
//! writes every output field back. The backing memory is borrowed from the
//! engine for the duration of the callback; no ownership crosses.

use crate::arena;
use crate::error::{Error, Result};
use crate::guest::{self, api, with_arena, ConnState};
use crate::value::{self, Value};
use wasmtime::StoreContextMut;
use wasqlite_runtime::memory;

pub(crate) mod layout {
    //! Byte offsets into the planning descriptor (wasm32 ABI).

    pub(crate) const N_CONSTRAINT: u32 = 0;
    pub(crate) const A_CONSTRAINT: u32 = 4;
    pub(crate) const N_ORDER_BY: u32 = 8;
    pub(crate) const A_ORDER_BY: u32 = 12;
    pub(crate) const A_CONSTRAINT_USAGE: u32 = 16;
    pub(crate) const IDX_NUM: u32 = 20;
    pub(crate) const IDX_STR: u32 = 24;
    pub(crate) const NEED_TO_FREE_IDX_STR: u32 = 28;
    pub(crate) const ORDER_BY_CONSUMED: u32 = 32;
    pub(crate) const ESTIMATED_COST: u32 = 40;
    pub(crate) const ESTIMATED_ROWS: u32 = 48;
    pub(crate) const IDX_FLAGS: u32 = 56;
    pub(crate) const COL_USED: u32 = 64;
    pub(crate) const DESCRIPTOR_SIZE: u32 = 72;

    pub(crate) const CONSTRAINT_STRIDE: u32 = 12;
    pub(crate) const CONSTRAINT_COLUMN: u32 = 0;
    pub(crate) const CONSTRAINT_OP: u32 = 4;
    pub(crate) const CONSTRAINT_USABLE: u32 = 5;

    pub(crate) const ORDER_BY_STRIDE: u32 = 8;
    pub(crate) const ORDER_BY_COLUMN: u32 = 0;
    pub(crate) const ORDER_BY_DESC: u32 = 4;

    pub(crate) const USAGE_STRIDE: u32 = 8;
    pub(crate) const USAGE_ARGV_INDEX: u32 = 0;
    pub(crate) const USAGE_OMIT: u32 = 4;

    /// One descriptor field: name, byte offset, width in bytes.
    pub(crate) struct Field {
        pub(crate) name: &'static str,
        pub(crate) offset: u32,
        pub(crate) width: u32,
    }

    /// Every descriptor field, in ascending offset order.
    pub(crate) const DESCRIPTOR_FIELDS: &[Field] = &[
        Field { name: "nConstraint", offset: N_CONSTRAINT, width: 4 },
        Field { name: "aConstraint", offset: A_CONSTRAINT, width: 4 },
        Field { name: "nOrderBy", offset: N_ORDER_BY, width: 4 },
        Field { name: "aOrderBy", offset: A_ORDER_BY, width: 4 },
        Field { name: "aConstraintUsage", offset: A_CONSTRAINT_USAGE, width: 4 },
        Field { name: "idxNum", offset: IDX_NUM, width: 4 },
        Field { name: "idxStr", offset: IDX_STR, width: 4 },
        Field { name: "needToFreeIdxStr", offset: NEED_TO_FREE_IDX_STR, width: 4 },
        Field { name: "orderByConsumed", offset: ORDER_BY_CONSUMED, width: 4 },
        Field { name: "estimatedCost", offset: ESTIMATED_COST, width: 8 },
        Field { name: "estimatedRows", offset: ESTIMATED_ROWS, width: 8 },
        Field { name: "idxFlags", offset: IDX_FLAGS, width: 4 },
        Field { name: "colUsed", offset: COL_USED, width: 8 },
    ];
}

/// Verify the internal consistency of the layout table.
///
/// Exercised by tests; a violation means the table was edited incorrectly
/// for a new engine ABI.
pub(crate) fn verify_layout() -> Result<()> {
    let fields = layout::DESCRIPTOR_FIELDS;
    let mut last_end = 0u32;
    for field in fields {
        if field.offset < last_end {
            return Err(Error::LayoutMismatch("descriptor fields overlap"));
        }
        if field.offset % field.width != 0 {
            return Err(Error::LayoutMismatch("descriptor field misaligned"));
        }
        last_end = field.offset + field.width;
    }
    if last_end > layout::DESCRIPTOR_SIZE {
        return Err(Error::LayoutMismatch("descriptor fields exceed struct size"));
    }
    Ok(())
}

/// A constraint-operator code.
///
/// Codes above `FUNCTION` identify overloaded functions; arbitrary values
/// are representable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConstraintOp(pub u8);

impl ConstraintOp {
    pub const EQ: Self = Self(2);
    pub const GT: Self = Self(4);
    pub const LE: Self = Self(8);
    pub const LT: Self = Self(16);
    pub const GE: Self = Self(32);
    pub const MATCH: Self = Self(64);
    pub const LIKE: Self = Self(65);
    pub const GLOB: Self = Self(66);
    pub const REGEXP: Self = Self(67);
    pub const NE: Self = Self(68);
    pub const IS_NOT: Self = Self(69);
    pub const IS_NOT_NULL: Self = Self(70);
    pub const IS_NULL: Self = Self(71);
    pub const IS: Self = Self(72);
    pub const LIMIT: Self = Self(73);
    pub const OFFSET: Self = Self(74);
    pub const FUNCTION: Self = Self(150);
}

/// The scan produces at most one row.
pub const INDEX_SCAN_UNIQUE: u32 = 1;

/// One planning constraint (input to `best_index`).
#[derive(Debug, Clone)]
pub struct IndexConstraint {
    pub column: i32,
    pub op: ConstraintOp,
    pub usable: bool,
    /// The right-hand operand, when the engine knows it at plan time.
    pub rhs: Option<Value>,
}

/// One ORDER BY term (input to `best_index`).
#[derive(Debug, Clone, Copy)]
pub struct IndexOrderBy {
    pub column: i32,
    pub desc: bool,
}

/// How the chosen plan consumes one constraint (output of `best_index`).
#[derive(Debug, Clone, Copy, Default)]
pub struct IndexConstraintUsage {
    /// 1-based position in the `filter` argument list, 0 if unused.
    pub argv_index: i32,
    /// The engine may skip re-checking this constraint.
    pub omit: bool,
}

/// Host-native projection of the engine's planning descriptor.
#[derive(Debug, Clone, Default)]
pub struct IndexInfo {
    // Inputs
    pub constraints: Vec<IndexConstraint>,
    pub order_by: Vec<IndexOrderBy>,
    pub columns_used: u64,
    // Outputs
    pub constraint_usage: Vec<IndexConstraintUsage>,
    pub index_num: i32,
    pub index_str: Option<String>,
    pub index_flags: u32,
    pub order_by_consumed: bool,
    pub estimated_cost: f64,
    pub estimated_rows: i64,
}

impl Default for IndexConstraint {
    fn default() -> Self {
        Self {
            column: 0,
            op: ConstraintOp(0),
            usable: false,
            rhs: None,
        }
    }
}

/// Read every descriptor input field into a host-native [`IndexInfo`].
pub(crate) fn load(ctx: &mut StoreContextMut<'_, ConnState>, ptr: u32) -> Result<IndexInfo> {
    use layout::*;

    let mut info = IndexInfo::default();
    let n_constraint = {
        let m = guest::mem(ctx)?;

        let n_constraint = memory::read_u32(m, ptr + N_CONSTRAINT)?;
        let n_order_by = memory::read_u32(m, ptr + N_ORDER_BY)?;

        let constraint_ptr = memory::read_u32(m, ptr + A_CONSTRAINT)?;
        for i in 0..n_constraint {
            let base = constraint_ptr + i * CONSTRAINT_STRIDE;
            info.constraints.push(IndexConstraint {
                column: memory::read_i32(m, base + CONSTRAINT_COLUMN)?,
                op: ConstraintOp(memory::read_u8(m, base + CONSTRAINT_OP)?),
                usable: memory::read_u8(m, base + CONSTRAINT_USABLE)? != 0,
                rhs: None,
            });
        }

        let order_by_ptr = memory::read_u32(m, ptr + A_ORDER_BY)?;
        for i in 0..n_order_by {
            let base = order_by_ptr + i * ORDER_BY_STRIDE;
            info.order_by.push(IndexOrderBy {
                column: memory::read_i32(m, base + ORDER_BY_COLUMN)?,
                desc: memory::read_u8(m, base + ORDER_BY_DESC)? != 0,
            });
        }

        info.estimated_cost = memory::read_f64(m, ptr + ESTIMATED_COST)?;
        info.estimated_rows = memory::read_i64(m, ptr + ESTIMATED_ROWS)?;
        info.columns_used = memory::read_u64(m, ptr + COL_USED)?;

        n_constraint
    };

    info.constraint_usage =
        vec![IndexConstraintUsage::default(); n_constraint as usize];

    // Fetch known right-hand operands, copying each engine value to host
    // memory before user planning code runs.
    for i in 0..n_constraint {
        info.constraints[i as usize].rhs = rhs_value(ctx, ptr, i)?;
    }

    Ok(info)
}

/// Fetch the right-hand operand of constraint `index`, if the engine knows
/// it at planning time.
fn rhs_value(
    ctx: &mut StoreContextMut<'_, ConnState>,
    descriptor: u32,
    index: u32,
) -> Result<Option<Value>> {
    with_arena(ctx, |ctx| {
        let pp_val = arena::alloc(ctx, 4)?;
        let rc = guest::call(
            ctx,
            api::VTAB_RHS_VALUE,
            &[descriptor as u64, index as u64, pp_val as u64],
        )? as u32;
        if rc != crate::error::codes::OK {
            // NOTFOUND (or any refusal) means the operand is not known.
            return Ok(None);
        }
        let val_ptr = memory::read_u32(guest::mem(ctx)?, pp_val)?;
        Ok(Some(value::read_value(ctx, val_ptr)?))
    })
}

/// Write every descriptor output field from a host-native [`IndexInfo`].
pub(crate) fn save(
    ctx: &mut StoreContextMut<'_, ConnState>,
    ptr: u32,
    info: &IndexInfo,
) -> Result<()> {
    use layout::*;

    // The chosen plan string must outlive this callback; it goes through
    // the engine's allocator and the engine frees it (needToFreeIdxStr).
    let idx_str_ptr = match &info.index_str {
        Some(s) => Some(guest::new_string(ctx, s)?),
        None => None,
    };

    let m = guest::mem_mut(ctx)?;

    let n_constraint = memory::read_u32(m, ptr + N_CONSTRAINT)? as usize;
    let usage_ptr = memory::read_u32(m, ptr + A_CONSTRAINT_USAGE)?;
    for (i, usage) in info
        .constraint_usage
        .iter()
        .take(n_constraint)
        .enumerate()
    {
        let base = usage_ptr + i as u32 * USAGE_STRIDE;
        memory::write_i32(m, base + USAGE_ARGV_INDEX, usage.argv_index)?;
        memory::write_u8(m, base + USAGE_OMIT, usage.omit as u8)?;
    }

    memory::write_i32(m, ptr + IDX_NUM, info.index_num)?;
    if let Some(s) = idx_str_ptr {
        memory::write_u32(m, ptr + IDX_STR, s)?;
        memory::write_u32(m, ptr + NEED_TO_FREE_IDX_STR, 1)?;
    }
    memory::write_u32(m, ptr + ORDER_BY_CONSUMED, info.order_by_consumed as u32)?;
    memory::write_f64(m, ptr + ESTIMATED_COST, info.estimated_cost)?;
    memory::write_i64(m, ptr + ESTIMATED_ROWS, info.estimated_rows)?;
    memory::write_u32(m, ptr + IDX_FLAGS, info.index_flags)?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::Fixture;

    #[test]
    fn test_layout_table_is_consistent() {
        verify_layout().unwrap();
    }

    #[test]
    fn test_layout_offsets_are_ascending() {
        let mut last = None;
        for field in layout::DESCRIPTOR_FIELDS {
            if let Some(prev) = last {
                assert!(field.offset > prev, "{} out of order", field.name);
            }
            last = Some(field.offset);
        }
    }

    /// Fabricate a descriptor in guest memory:
    /// two constraints, one ORDER BY term, usage array zeroed.
    fn build_descriptor(fx: &mut Fixture) -> u32 {
        const DESC: u32 = 0x800;
        const CONSTRAINTS: u32 = 0x900;
        const ORDER_BY: u32 = 0x980;
        const USAGE: u32 = 0x9c0;

        let mut ctx = fx.ctx();
        let m = guest::mem_mut(&mut ctx).unwrap();

        memory::write_u32(m, DESC + layout::N_CONSTRAINT, 2).unwrap();
        memory::write_u32(m, DESC + layout::A_CONSTRAINT, CONSTRAINTS).unwrap();
        memory::write_u32(m, DESC + layout::N_ORDER_BY, 1).unwrap();
        memory::write_u32(m, DESC + layout::A_ORDER_BY, ORDER_BY).unwrap();
        memory::write_u32(m, DESC + layout::A_CONSTRAINT_USAGE, USAGE).unwrap();
        memory::write_f64(m, DESC + layout::ESTIMATED_COST, 5e98).unwrap();
        memory::write_i64(m, DESC + layout::ESTIMATED_ROWS, 25).unwrap();
        memory::write_u64(m, DESC + layout::COL_USED, 0x8000_0000_0000_0001).unwrap();

        // constraint 0: column 3, EQ, usable
        memory::write_i32(m, CONSTRAINTS, 3).unwrap();
        memory::write_u8(m, CONSTRAINTS + 4, 2).unwrap();
        memory::write_u8(m, CONSTRAINTS + 5, 1).unwrap();
        // constraint 1: column -1 (rowid), GT, not usable
        memory::write_i32(m, CONSTRAINTS + 12, -1).unwrap();
        memory::write_u8(m, CONSTRAINTS + 16, 4).unwrap();
        memory::write_u8(m, CONSTRAINTS + 17, 0).unwrap();
        // order by: column 2 descending
        memory::write_i32(m, ORDER_BY, 2).unwrap();
        memory::write_u8(m, ORDER_BY + 4, 1).unwrap();

        DESC
    }

    #[test]
    fn test_load_reads_every_input_field() {
        let mut fx = Fixture::new();
        let desc = build_descriptor(&mut fx);

        let mut ctx = fx.ctx();
        let info = load(&mut ctx, desc).unwrap();

        assert_eq!(info.constraints.len(), 2);
        assert_eq!(info.constraints[0].column, 3);
        assert_eq!(info.constraints[0].op, ConstraintOp::EQ);
        assert!(info.constraints[0].usable);
        assert_eq!(info.constraints[1].column, -1);
        assert_eq!(info.constraints[1].op, ConstraintOp::GT);
        assert!(!info.constraints[1].usable);
        assert_eq!(info.order_by.len(), 1);
        assert_eq!(info.order_by[0].column, 2);
        assert!(info.order_by[0].desc);
        assert_eq!(info.constraint_usage.len(), 2);
        assert_eq!(info.estimated_cost, 5e98);
        assert_eq!(info.estimated_rows, 25);
        assert_eq!(info.columns_used, 0x8000_0000_0000_0001);
        // The stub engine reports no known right-hand operands.
        assert!(info.constraints.iter().all(|c| c.rhs.is_none()));
    }

    #[test]
    fn test_save_writes_every_output_field() {
        let mut fx = Fixture::new();
        let desc = build_descriptor(&mut fx);

        let mut ctx = fx.ctx();
        let mut info = load(&mut ctx, desc).unwrap();
        info.constraint_usage[0] = IndexConstraintUsage {
            argv_index: 1,
            omit: true,
        };
        info.index_num = 42;
        info.index_str = Some("plan=eq".into());
        info.index_flags = INDEX_SCAN_UNIQUE;
        info.order_by_consumed = true;
        info.estimated_cost = 10.0;
        info.estimated_rows = 1;

        save(&mut ctx, desc, &info).unwrap();

        let m = guest::mem(&mut ctx).unwrap();
        let usage_ptr = memory::read_u32(m, desc + layout::A_CONSTRAINT_USAGE).unwrap();
        assert_eq!(memory::read_i32(m, usage_ptr).unwrap(), 1);
        assert_eq!(memory::read_u8(m, usage_ptr + 4).unwrap(), 1);
        assert_eq!(memory::read_i32(m, usage_ptr + 8).unwrap(), 0);
        assert_eq!(memory::read_i32(m, desc + layout::IDX_NUM).unwrap(), 42);
        assert_eq!(
            memory::read_u32(m, desc + layout::NEED_TO_FREE_IDX_STR).unwrap(),
            1
        );
        let str_ptr = memory::read_u32(m, desc + layout::IDX_STR).unwrap();
        assert_eq!(
            memory::read_string(m, str_ptr, 64).unwrap(),
            "plan=eq"
        );
        assert_eq!(
            memory::read_u32(m, desc + layout::ORDER_BY_CONSUMED).unwrap(),
            1
        );
        assert_eq!(memory::read_f64(m, desc + layout::ESTIMATED_COST).unwrap(), 10.0);
        assert_eq!(memory::read_i64(m, desc + layout::ESTIMATED_ROWS).unwrap(), 1);
        assert_eq!(
            memory::read_u32(m, desc + layout::IDX_FLAGS).unwrap(),
            INDEX_SCAN_UNIQUE
        );
    }

    #[test]
    fn test_boundary_values_roundtrip_at_descriptor_offsets() {
        let mut fx = Fixture::new();
        let mut ctx = fx.ctx();
        let m = guest::mem_mut(&mut ctx).unwrap();
        const DESC: u32 = 0x800;

        for field in layout::DESCRIPTOR_FIELDS {
            let off = DESC + field.offset;
            match field.width {
                4 => {
                    for v in [0u32, 1, 0x7fff_ffff, u32::MAX] {
                        memory::write_u32(m, off, v).unwrap();
                        assert_eq!(memory::read_u32(m, off).unwrap(), v, "{}", field.name);
                    }
                }
                8 => {
                    for v in [0u64, 1, i64::MAX as u64, u64::MAX] {
                        memory::write_u64(m, off, v).unwrap();
                        assert_eq!(memory::read_u64(m, off).unwrap(), v, "{}", field.name);
                    }
                }
                _ => unreachable!("unexpected field width"),
            }
        }
    }
}
