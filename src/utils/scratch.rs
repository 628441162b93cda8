//! Scratch Arena
//!
//! Process-local scratch storage backing short-lived decoder call buffers.
//! Each call into a native decoder runs as a synchronous critical section:
//! the arena top is saved on entry and restored on exit, and regions nest.

use std::cell::RefCell;

const DEFAULT_CAPACITY: usize = 1 << 20; // 1 MiB

thread_local! {
    static SCRATCH: RefCell<ScratchArena> = RefCell::new(ScratchArena::new(DEFAULT_CAPACITY));
}

struct ScratchArena {
    storage: Vec<u8>,
    top: usize,
}

impl ScratchArena {
    fn new(capacity: usize) -> Self {
        Self {
            storage: vec![0; capacity],
            top: 0,
        }
    }
}

/// Borrow a zeroed scratch region of `len` bytes for the duration of `f`.
///
/// Nested calls stack; the arena top is restored when `f` returns, even on
/// an early return from within. Requests larger than the remaining arena
/// space fall back to a heap allocation.
pub fn with_scratch<R>(len: usize, f: impl FnOnce(&mut [u8]) -> R) -> R {
    SCRATCH.with(|cell| {
        let saved = {
            let mut arena = cell.borrow_mut();
            if arena.top + len > arena.storage.len() {
                // Arena exhausted for this nesting depth.
                drop(arena);
                let mut heap = vec![0u8; len];
                return f(&mut heap);
            }
            let saved = arena.top;
            arena.top += len;
            arena.storage[saved..saved + len].fill(0);
            saved
        };

        // The region is exclusive: nested calls allocate above `top`, and the
        // backing storage is never reallocated, so the pointer stays valid
        // while the borrow is released for re-entry.
        let base = cell.borrow_mut().storage.as_mut_ptr();
        let region: &mut [u8] = unsafe { std::slice::from_raw_parts_mut(base.add(saved), len) };
        let result = f(region);

        cell.borrow_mut().top = saved;
        result
    })
}

/// f32 view of a scratch region, for PCM output buffers.
pub fn with_scratch_f32<R>(samples: usize, f: impl FnOnce(&mut [f32]) -> R) -> R {
    with_scratch(samples * 4, |bytes| {
        let floats: &mut [f32] =
            unsafe { std::slice::from_raw_parts_mut(bytes.as_mut_ptr() as *mut f32, samples) };
        floats.fill(0.0);
        f(floats)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_region_is_zeroed() {
        with_scratch(64, |buf| {
            assert!(buf.iter().all(|&b| b == 0));
            buf.fill(0xFF);
        });
        with_scratch(64, |buf| {
            assert!(buf.iter().all(|&b| b == 0));
        });
    }

    #[test]
    fn test_nested_regions_do_not_alias() {
        with_scratch(32, |outer| {
            outer.fill(0xAA);
            with_scratch(32, |inner| {
                inner.fill(0xBB);
            });
            assert!(outer.iter().all(|&b| b == 0xAA));
        });
    }

    #[test]
    fn test_top_restored_after_use() {
        with_scratch(128, |_| {});
        // A second full-size request succeeds only if the top was restored.
        with_scratch(DEFAULT_CAPACITY, |buf| {
            assert_eq!(buf.len(), DEFAULT_CAPACITY);
        });
    }

    #[test]
    fn test_oversized_falls_back_to_heap() {
        with_scratch(DEFAULT_CAPACITY * 2, |buf| {
            assert_eq!(buf.len(), DEFAULT_CAPACITY * 2);
        });
    }

    #[test]
    fn test_f32_view() {
        with_scratch_f32(960 * 2, |pcm| {
            assert_eq!(pcm.len(), 1920);
            assert!(pcm.iter().all(|&s| s == 0.0));
        });
    }
}
