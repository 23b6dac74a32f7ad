//! Per-connection scratch allocator in guest memory.
//!
//! One backing region is obtained from the guest's persistent allocator when
//! the connection opens and reused for its whole lifetime. Call sites mark
//! the cursor on entry and reset on exit; every allocation made in between
//! is scratch for that one call. Allocations that do not fit the region fall
//! back to the persistent allocator and are tracked so the reset frees them.
//!
//! Nothing allocated here may outlive its frame. Data that must (an error
//! string handed to the engine) goes through [`crate::guest::new_string`]
//! instead and is freed by the engine.

use crate::error::Result;
use crate::guest::{self, ConnState};
use tracing::trace;
use wasmtime::StoreContextMut;
use wasqlite_runtime::memory;

const ALIGN: u32 = 8;

/// Arena bookkeeping; the backing bytes live in guest memory.
pub(crate) struct Arena {
    base: u32,
    size: u32,
    next: u32,
    /// Persistent-allocator fallbacks made since the last full reset,
    /// freed when their frame resets.
    fallbacks: Vec<u32>,
}

/// A cursor position captured at call entry.
#[derive(Debug, Clone, Copy)]
pub(crate) struct ArenaMark {
    next: u32,
    fallbacks: usize,
}

impl Arena {
    /// An arena with no backing region yet.
    pub(crate) const fn unset() -> Self {
        Self {
            base: 0,
            size: 0,
            next: 0,
            fallbacks: Vec::new(),
        }
    }
}

/// Allocate the backing region. Called once at connection open.
pub(crate) fn init(ctx: &mut StoreContextMut<'_, ConnState>, size: u32) -> Result<()> {
    let base = guest::malloc(ctx, size)?;
    let arena = &mut ctx.data_mut().arena;
    arena.base = base;
    arena.size = size;
    arena.next = 0;
    Ok(())
}

/// Capture the cursor at call entry.
pub(crate) fn mark(ctx: &mut StoreContextMut<'_, ConnState>) -> ArenaMark {
    let arena = &ctx.data().arena;
    ArenaMark {
        next: arena.next,
        fallbacks: arena.fallbacks.len(),
    }
}

/// Rewind to a mark, freeing fallback allocations made since.
pub(crate) fn reset(ctx: &mut StoreContextMut<'_, ConnState>, mark: ArenaMark) -> Result<()> {
    let pending: Vec<u32> = {
        let arena = &mut ctx.data_mut().arena;
        arena.next = mark.next;
        arena.fallbacks.split_off(mark.fallbacks)
    };
    for ptr in pending {
        guest::free(ctx, ptr)?;
    }
    Ok(())
}

/// Allocate a zeroed scratch region, returning its guest offset.
pub(crate) fn alloc(ctx: &mut StoreContextMut<'_, ConnState>, len: u32) -> Result<u32> {
    let ptr = {
        let arena = &mut ctx.data_mut().arena;
        let next = (arena.next + ALIGN - 1) & !(ALIGN - 1);
        if next.checked_add(len).is_some_and(|end| end <= arena.size) {
            arena.next = next + len;
            Some(arena.base + next)
        } else {
            None
        }
    };

    let ptr = match ptr {
        Some(ptr) => ptr,
        None => {
            trace!(len, "arena full, falling back to guest allocator");
            let ptr = guest::malloc(ctx, len)?;
            ctx.data_mut().arena.fallbacks.push(ptr);
            ptr
        }
    };

    memory::fill_zero(guest::mem_mut(ctx)?, ptr, len)?;
    Ok(ptr)
}

/// Copy bytes into scratch.
pub(crate) fn bytes(ctx: &mut StoreContextMut<'_, ConnState>, data: &[u8]) -> Result<u32> {
    let ptr = alloc(ctx, data.len() as u32)?;
    memory::write_bytes(guest::mem_mut(ctx)?, ptr, data)?;
    Ok(ptr)
}

/// Copy a string into scratch as a NUL-terminated C string.
pub(crate) fn string(ctx: &mut StoreContextMut<'_, ConnState>, s: &str) -> Result<u32> {
    let ptr = alloc(ctx, s.len() as u32 + 1)?;
    memory::write_bytes(guest::mem_mut(ctx)?, ptr, s.as_bytes())?;
    Ok(ptr)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::error::Error;
    use crate::testing::Fixture;

    #[test]
    fn test_alloc_is_zeroed_and_reused_after_reset() {
        let mut fx = Fixture::with_config(Config::new().with_arena_size(256));
        fx.conn_op(|ctx| {
            let m = mark(ctx);
            let a = alloc(ctx, 16)?;
            // Poison the region, rewind, and allocate again: the same
            // offset comes back zeroed, so nothing can observe stale
            // bytes from the previous frame.
            memory::write_bytes(guest::mem_mut(ctx)?, a, &[0xaa; 16])?;
            reset(ctx, m)?;
            let b = alloc(ctx, 16)?;
            assert_eq!(a, b);
            assert_eq!(memory::read_bytes(guest::mem(ctx)?, b, 16)?, &[0u8; 16]);
            reset(ctx, m)?;
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn test_allocations_are_aligned_and_disjoint() {
        let mut fx = Fixture::with_config(Config::new().with_arena_size(256));
        fx.conn_op(|ctx| {
            let m = mark(ctx);
            let a = alloc(ctx, 3)?;
            let b = alloc(ctx, 3)?;
            assert_eq!(a % ALIGN, 0);
            assert_eq!(b % ALIGN, 0);
            assert!(b >= a + 3);
            reset(ctx, m)?;
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn test_overflow_falls_back_and_reset_frees() {
        let mut fx = Fixture::with_config(Config::new().with_arena_size(64));
        let frees_before = fx.global_i32("free_count");
        fx.conn_op(|ctx| {
            let m = mark(ctx);
            // Larger than the backing region: served by the guest
            // allocator and tracked for release.
            let big = alloc(ctx, 1024)?;
            assert_eq!(memory::read_bytes(guest::mem(ctx)?, big, 1024)?[..8], [0u8; 8]);
            reset(ctx, m)?;
            Ok(())
        })
        .unwrap();
        assert!(fx.global_i32("free_count") > frees_before);
    }

    #[test]
    fn test_nested_frames_unwind_in_order() {
        let mut fx = Fixture::with_config(Config::new().with_arena_size(256));
        fx.conn_op(|ctx| {
            let outer = mark(ctx);
            let a = alloc(ctx, 8)?;
            let inner = mark(ctx);
            let b = alloc(ctx, 8)?;
            reset(ctx, inner)?;
            // The inner frame's slot is reusable, the outer's is not.
            let c = alloc(ctx, 8)?;
            assert_eq!(b, c);
            assert_ne!(a, c);
            reset(ctx, outer)?;
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn test_exhausted_guest_allocator_is_out_of_memory() {
        let mut fx = Fixture::with_config(Config::new().with_arena_size(16));
        fx.set_global_i32("malloc_fail", 1);
        let err = fx
            .conn_op(|ctx| alloc(ctx, 4096).map(|_| ()))
            .unwrap_err();
        assert!(matches!(err, Error::OutOfMemory));
    }

    #[test]
    fn test_string_is_nul_terminated() {
        let mut fx = Fixture::new();
        fx.conn_op(|ctx| {
            let m = mark(ctx);
            let ptr = string(ctx, "hello")?;
            let mem = guest::mem(ctx)?;
            assert_eq!(memory::read_string(mem, ptr, 64)?, "hello");
            assert_eq!(memory::read_u8(mem, ptr + 5)?, 0);
            reset(ctx, m)?;
            Ok(())
        })
        .unwrap();
    }
}
