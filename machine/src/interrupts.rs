/*
 * SPDX-License-Identifier: BlueOak-1.0.0
 * Copyright (c) Anillo OS Developers
 */

//! The outstanding interrupt-disable counter.
//!
//! `flock_spin_intsafe_t` and every place the core masks interrupts around a
//! critical section nest: an interrupt handler that itself takes an
//! interrupt-safe lock must not re-enable interrupts when it releases that
//! lock if the code it interrupted already had them disabled. Rather than
//! have every caller track "were interrupts on before I touched this",
//! [`InterruptGuard`] keeps a per-CPU nesting depth and only asks
//! [`Arch`](crate::arch::Arch) to actually flip the hardware bit on the
//! outermost acquire and the outermost release.

use crate::{
    arch::{Arch, Current},
    percpu::PerCpu,
};

#[derive(Clone, Copy)]
struct Nesting {
    depth: usize,
    /// Interrupt state observed at the outermost `disable()`, restored at
    /// the outermost drop.
    was_enabled: bool,
}

static NESTING: PerCpu<Nesting> = PerCpu::new(Nesting { depth: 0, was_enabled: true });

/// RAII token representing one nested "interrupts must stay disabled"
/// request. Interrupts are masked for as long as any `InterruptGuard` on the
/// calling core is alive.
pub struct InterruptGuard {
    _private: (),
}

impl InterruptGuard {
    /// Disable interrupts on the calling core, or, if already disabled by an
    /// outer guard, just record the nesting.
    pub fn disable() -> Self {
        let nesting = NESTING.get();
        if nesting.depth == 0 {
            nesting.was_enabled = Current::disable_interrupts();
        }
        nesting.depth += 1;
        Self { _private: () }
    }

    /// Whether interrupts are currently disabled (on the calling core)
    /// because of an outstanding guard.
    pub fn is_held() -> bool {
        NESTING.get().depth > 0
    }
}

impl Drop for InterruptGuard {
    fn drop(&mut self) {
        let nesting = NESTING.get();
        nesting.depth -= 1;
        if nesting.depth == 0 {
            Current::restore_interrupts(nesting.was_enabled);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nested_guards_only_restore_on_outermost_drop() {
        assert!(!InterruptGuard::is_held());
        let outer = InterruptGuard::disable();
        assert!(InterruptGuard::is_held());
        {
            let _inner = InterruptGuard::disable();
            assert!(InterruptGuard::is_held());
        }
        assert!(InterruptGuard::is_held(), "inner drop must not release the outer guard");
        drop(outer);
        assert!(!InterruptGuard::is_held());
    }
}
