// =============================================================================
// MinimalOS NextGen — Atomic Primitive Layer
// =============================================================================
//
// One interface over every built-in atomic integer type. Each operation is a
// single indivisible memory transaction with SeqCst ordering unless its name
// says otherwise (`ld_acq`, `st_rel`). Nothing here blocks or knows about
// the scheduler, so all of it is usable from interrupt handlers.
//
// `cmpxchg` returns the value that was in memory: the caller compares it
// with `expected` to tell success from failure. That shape makes CAS retry
// loops read naturally:
//
//     let mut old = v.ld_acq();
//     loop {
//         let cur = v.cmpxchg(old, f(old));
//         if cur == old { break; }
//         old = cur;
//     }
// =============================================================================

use core::sync::atomic::{
    AtomicI8, AtomicI16, AtomicI32, AtomicI64, AtomicIsize, AtomicU8, AtomicU16, AtomicU32,
    AtomicU64, AtomicUsize, Ordering, compiler_fence, fence,
};

/// An atomic integer cell.
pub trait AtomicInt: Sync {
    type Value: Copy + Eq + Ord;

    /// Stores `new` if the current value equals `expected`. Returns the
    /// value observed before the operation.
    fn cmpxchg(&self, expected: Self::Value, new: Self::Value) -> Self::Value;

    /// Like `cmpxchg`, but returns success and writes the observed value
    /// back into `expected` on failure.
    fn cmpxchg_upd(&self, expected: &mut Self::Value, new: Self::Value) -> bool;

    /// Stores `new`, returns the previous value.
    fn xchg(&self, new: Self::Value) -> Self::Value;

    /// Adds `rhs`, returns the previous value.
    fn xadd(&self, rhs: Self::Value) -> Self::Value;

    /// Adds `rhs`, returns the new value.
    fn add(&self, rhs: Self::Value) -> Self::Value;

    /// Subtracts `rhs`, returns the new value.
    fn sub(&self, rhs: Self::Value) -> Self::Value;

    /// Bitwise and, returns the new value.
    fn and(&self, rhs: Self::Value) -> Self::Value;

    /// Bitwise or, returns the new value.
    fn or(&self, rhs: Self::Value) -> Self::Value;

    /// Bitwise xor, returns the new value.
    fn xor(&self, rhs: Self::Value) -> Self::Value;

    /// Sets bit `bit`, returns whether it was already set. Panics if `bit`
    /// is not below the type's width.
    fn bts(&self, bit: u32) -> bool;

    /// Clears bit `bit`, returns whether it was set. Same range rule as
    /// `bts`.
    fn btr(&self, bit: u32) -> bool;

    /// Acquire load.
    fn ld_acq(&self) -> Self::Value;

    /// Release store.
    fn st_rel(&self, value: Self::Value);
}

macro_rules! impl_atomic_int {
    ($($atomic:ty => $int:ty),* $(,)?) => {$(
        impl AtomicInt for $atomic {
            type Value = $int;

            #[inline]
            fn cmpxchg(&self, expected: $int, new: $int) -> $int {
                match self.compare_exchange(expected, new, Ordering::SeqCst, Ordering::SeqCst) {
                    Ok(old) | Err(old) => old,
                }
            }

            #[inline]
            fn cmpxchg_upd(&self, expected: &mut $int, new: $int) -> bool {
                match self.compare_exchange(*expected, new, Ordering::SeqCst, Ordering::SeqCst) {
                    Ok(_) => true,
                    Err(observed) => {
                        *expected = observed;
                        false
                    }
                }
            }

            #[inline]
            fn xchg(&self, new: $int) -> $int {
                self.swap(new, Ordering::SeqCst)
            }

            #[inline]
            fn xadd(&self, rhs: $int) -> $int {
                self.fetch_add(rhs, Ordering::SeqCst)
            }

            #[inline]
            fn add(&self, rhs: $int) -> $int {
                self.fetch_add(rhs, Ordering::SeqCst).wrapping_add(rhs)
            }

            #[inline]
            fn sub(&self, rhs: $int) -> $int {
                self.fetch_sub(rhs, Ordering::SeqCst).wrapping_sub(rhs)
            }

            #[inline]
            fn and(&self, rhs: $int) -> $int {
                self.fetch_and(rhs, Ordering::SeqCst) & rhs
            }

            #[inline]
            fn or(&self, rhs: $int) -> $int {
                self.fetch_or(rhs, Ordering::SeqCst) | rhs
            }

            #[inline]
            fn xor(&self, rhs: $int) -> $int {
                self.fetch_xor(rhs, Ordering::SeqCst) ^ rhs
            }

            #[inline]
            fn bts(&self, bit: u32) -> bool {
                assert!(bit < <$int>::BITS, "bts: bit {bit} out of range");
                let mask: $int = 1 << bit;
                self.fetch_or(mask, Ordering::SeqCst) & mask != 0
            }

            #[inline]
            fn btr(&self, bit: u32) -> bool {
                assert!(bit < <$int>::BITS, "btr: bit {bit} out of range");
                let mask: $int = 1 << bit;
                self.fetch_and(!mask, Ordering::SeqCst) & mask != 0
            }

            #[inline]
            fn ld_acq(&self) -> $int {
                self.load(Ordering::Acquire)
            }

            #[inline]
            fn st_rel(&self, value: $int) {
                self.store(value, Ordering::Release)
            }
        }
    )*};
}

impl_atomic_int! {
    AtomicU8 => u8,
    AtomicU16 => u16,
    AtomicU32 => u32,
    AtomicU64 => u64,
    AtomicUsize => usize,
    AtomicI8 => i8,
    AtomicI16 => i16,
    AtomicI32 => i32,
    AtomicI64 => i64,
    AtomicIsize => isize,
}

/// Lowers `*cell` to `n` if it is above `n`.
///
/// Returns `n` when this call stored it, otherwise the latest value seen,
/// which is already `<= n`. Never leaves the cell above `n`.
pub fn atomic_min<A: AtomicInt>(cell: &A, n: A::Value) -> A::Value {
    let mut last = cell.ld_acq();
    while last > n {
        let cur = cell.cmpxchg(last, n);
        if cur == last {
            return n;
        }
        last = cur;
        pause();
    }
    last
}

/// Raises `*cell` to `n` if it is below `n`.
///
/// Returns `n` when this call stored it, otherwise the latest value seen,
/// which is already `>= n`. Never leaves the cell below `n`.
pub fn atomic_max<A: AtomicInt>(cell: &A, n: A::Value) -> A::Value {
    let mut last = cell.ld_acq();
    while last < n {
        let cur = cell.cmpxchg(last, n);
        if cur == last {
            return n;
        }
        last = cur;
        pause();
    }
    last
}

/// Full memory fence.
#[inline(always)]
pub fn atomic_fence() {
    fence(Ordering::SeqCst);
}

/// Acquire fence.
#[inline(always)]
pub fn atomic_lfence() {
    fence(Ordering::Acquire);
}

/// Release fence.
#[inline(always)]
pub fn atomic_sfence() {
    fence(Ordering::Release);
}

/// Compiler-only barrier; emits no instruction.
#[inline(always)]
pub fn atomic_barrier() {
    compiler_fence(Ordering::SeqCst);
}

/// Spin-wait hint.
#[inline(always)]
pub fn pause() {
    core::hint::spin_loop();
}
