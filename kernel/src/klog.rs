/*
 * SPDX-License-Identifier: BlueOak-1.0.0
 * Copyright (c) Anillo OS Developers
 */

//! Kernel logging, `kernel-include/ferro/core/console.h`'s `flog_*` levels
//! given a `log`-crate-compatible [`log::Log`] implementation so the rest of
//! the ecosystem (future drivers, `machine`'s own test runner) can log
//! through the standard facade instead of a bespoke print macro.
//!
//! The sink itself is a single global spinlock-guarded writer; whatever
//! implements [`core::fmt::Write`] (the boot console's serial port, in the
//! out-of-scope bootstrap stage) can be installed with [`set_sink`].

use core::fmt::Write;

use log::{Level, LevelFilter, Log, Metadata, Record};
use machine::sync::SpinLock;

/// Anything that can receive formatted log output.
pub trait Sink: Write + Send {}
impl<T: Write + Send> Sink for T {}

static SINK: SpinLock<Option<&'static mut dyn Sink>> = SpinLock::new(None);

struct KernelLogger;

impl Log for KernelLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= Level::Info
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        if let Some(sink) = SINK.lock().as_deref_mut() {
            let _ = writeln!(sink, "[{}] {}", record.level(), record.args());
        }
    }

    fn flush(&self) {}
}

static LOGGER: KernelLogger = KernelLogger;

/// Install `sink` as the destination for all kernel log output and register
/// the global `log` logger. Call once, early in boot.
pub fn init(sink: &'static mut dyn Sink, level: LevelFilter) {
    *SINK.lock() = Some(sink);
    log::set_logger(&LOGGER).expect("klog::init called more than once");
    log::set_max_level(level);
}

pub use log::{debug as kdebug, error as kerror, info as klog, trace as ktrace, warn as kwarn};
