//! Concurrency caps for one scheduling tick.
//!
//! Seeded from the tasks already in flight, then charged for every task the
//! tick dispatches. Server actions are charged against a reserved host key.

use std::collections::HashMap;

use crate::constants::SERVER_ACTION_HOST_KEY;
use crate::models::HostRoleCommand;
use crate::state_machine::HostRoleStatus;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotDenied {
    Host,
    Global,
}

#[derive(Debug, Clone)]
pub struct DispatchLimits {
    per_host: usize,
    global: usize,
    in_flight: HashMap<String, usize>,
    total: usize,
}

impl DispatchLimits {
    pub fn new(per_host: usize, global: usize) -> Self {
        Self {
            per_host,
            global,
            in_flight: HashMap::new(),
            total: 0,
        }
    }

    /// Limits charged with every task that currently occupies a slot.
    ///
    /// A queued task whose dispatch failed is waiting for redelivery and does
    /// not hold a slot.
    pub fn seeded<'a>(
        per_host: usize,
        global: usize,
        tasks: impl IntoIterator<Item = &'a HostRoleCommand>,
    ) -> Self {
        let mut limits = Self::new(per_host, global);
        for task in tasks {
            let occupies = match task.status {
                HostRoleStatus::InProgress => true,
                HostRoleStatus::Queued => task.dispatch_error.is_none(),
                _ => false,
            };
            if occupies {
                *limits.in_flight.entry(Self::host_key(task)).or_default() += 1;
                limits.total += 1;
            }
        }
        limits
    }

    pub fn host_key(task: &HostRoleCommand) -> String {
        task.host_name
            .clone()
            .unwrap_or_else(|| SERVER_ACTION_HOST_KEY.to_string())
    }

    pub fn try_acquire(&mut self, host_key: &str) -> Result<(), SlotDenied> {
        if self.total >= self.global {
            return Err(SlotDenied::Global);
        }
        let count = self.in_flight.entry(host_key.to_string()).or_default();
        if *count >= self.per_host {
            return Err(SlotDenied::Host);
        }
        *count += 1;
        self.total += 1;
        Ok(())
    }

    pub fn release(&mut self, host_key: &str) {
        if let Some(count) = self.in_flight.get_mut(host_key) {
            if *count > 0 {
                *count -= 1;
                self.total = self.total.saturating_sub(1);
            }
        }
    }

    pub fn is_saturated(&self) -> bool {
        self.total >= self.global
    }
}
