/*
 * SPDX-License-Identifier: BlueOak-1.0.0
 * Copyright (c) Anillo OS Developers
 */

//! `#[test_case]` runner for in-target tests. `cargo test` on the host runs
//! ordinary `#[test]`s instead (the `cfg_attr(not(test), no_std)` split used
//! throughout this crate) — this runner only matters for the real target,
//! where `kernel::klog` has installed the global logger before handing
//! control to `test_main`.

pub trait TestFn {
    fn run(&self);
}

impl<T> TestFn for T
where
    T: Fn(),
{
    fn run(&self) {
        log::info!("{}...", core::any::type_name::<T>());
        self();
        log::info!("[ok]");
    }
}

pub fn test_runner(tests: &[&dyn TestFn]) {
    log::info!("running {} tests", tests.len());
    for test in tests {
        test.run();
    }
    log::info!("test result: ok. {} passed", tests.len());
}
