/*
 * SPDX-License-Identifier: BlueOak-1.0.0
 * Copyright (c) Anillo OS Developers
 */

//! Boot-time configuration, `original_source/kernel/src/core/config.c`'s
//! `fconfig` given a typed Rust shape: a handful of tunables parsed out of
//! the `key=value` boot argument blob the bootstrap stage hands off in the
//! boot data table (§6.4).

use core::time::Duration;

use crate::error::Status;

/// Scheduling and table-sizing tunables read at boot.
#[derive(Debug, Clone, Copy)]
pub struct BootConfig {
    /// Length of a scheduler timeslice before a preemption tick fires.
    pub quantum: Duration,
    /// Initial bucket count for the futex hash table (§4.C); grows are not
    /// supported, so this should be sized generously relative to expected
    /// concurrent futex word count.
    pub futex_table_buckets: usize,
    /// Maximum number of queued messages a channel's ring will buffer
    /// before `channel_send` reports `temporary_outage` (§4.E).
    pub channel_ring_capacity: usize,
    /// Maximum number of items a single monitor may track (§4.F).
    pub monitor_max_items: usize,
}

impl Default for BootConfig {
    fn default() -> Self {
        Self {
            quantum: Duration::from_millis(10),
            futex_table_buckets: 256,
            channel_ring_capacity: 64,
            monitor_max_items: 256,
        }
    }
}

impl BootConfig {
    /// Parse one `key=value` boot argument, overriding the matching field.
    /// Unrecognized keys are ignored (forward compatibility with future
    /// boot arguments some other subsystem consumes), malformed values for
    /// a recognized key report [`Status::InvalidArgument`].
    pub fn apply_override(&mut self, arg: &str) -> Result<(), Status> {
        let (key, value) = arg.split_once('=').ok_or(Status::InvalidArgument)?;
        match key {
            "quantum_us" => {
                let micros: u64 = value.parse().map_err(|_| Status::InvalidArgument)?;
                self.quantum = Duration::from_micros(micros);
            }
            "futex_table_buckets" => {
                self.futex_table_buckets =
                    value.parse().map_err(|_| Status::InvalidArgument)?;
            }
            "channel_ring_capacity" => {
                self.channel_ring_capacity =
                    value.parse().map_err(|_| Status::InvalidArgument)?;
            }
            "monitor_max_items" => {
                self.monitor_max_items = value.parse().map_err(|_| Status::InvalidArgument)?;
            }
            _ => {}
        }
        Ok(())
    }

    /// Parse a whole space-separated boot argument string, as handed off in
    /// the boot data table.
    pub fn parse(args: &str) -> Result<Self, Status> {
        let mut config = Self::default();
        for arg in args.split_whitespace() {
            config.apply_override(arg)?;
        }
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = BootConfig::default();
        assert!(config.quantum.as_micros() > 0);
        assert!(config.futex_table_buckets > 0);
    }

    #[test]
    fn overrides_recognized_keys() {
        let config = BootConfig::parse("quantum_us=5000 channel_ring_capacity=128").unwrap();
        assert_eq!(config.quantum, Duration::from_micros(5000));
        assert_eq!(config.channel_ring_capacity, 128);
    }

    #[test]
    fn unrecognized_keys_are_ignored() {
        let config = BootConfig::parse("some_driver_flag=1").unwrap();
        assert_eq!(config.channel_ring_capacity, BootConfig::default().channel_ring_capacity);
    }

    #[test]
    fn malformed_value_is_rejected() {
        assert_eq!(
            BootConfig::parse("futex_table_buckets=not_a_number"),
            Err(Status::InvalidArgument)
        );
    }
}
