use std::collections::VecDeque;

use crate::config::SchedulerConfig;

/// Value the histories start filled with, so a new machine reads as busy.
pub const SATURATED: u8 = 100;

/// Rolling utilization histories for one machine and the idle verdict
/// derived from them.
///
/// Two signals are kept: total GPU utilization, and "other" utilization with
/// the dispatched job's own share subtracted. Only the "other" history
/// decides idleness, so a machine running our job can still be judged free
/// of outside load.
#[derive(Debug, Clone)]
pub struct UtilizationSampler {
    total: VecDeque<u8>,
    other: VecDeque<u8>,
    capacity: usize,
    window: usize,
    ceiling: u8,
    idle: bool,
}

impl UtilizationSampler {
    pub fn new(capacity: usize, window: usize, ceiling: u8) -> Self {
        let mut sampler = Self {
            total: VecDeque::from(vec![SATURATED; capacity]),
            other: VecDeque::from(vec![SATURATED; capacity]),
            capacity,
            window,
            ceiling,
            idle: false,
        };
        sampler.idle = sampler.classify();
        sampler
    }

    pub fn from_config(config: &SchedulerConfig) -> Self {
        Self::new(
            config.history_capacity,
            config.idle_window,
            config.utilization_ceiling,
        )
    }

    /// Append one sample to both histories and recompute idleness.
    pub fn record(&mut self, total: u8, other: u8) {
        push_bounded(&mut self.total, total.min(100), self.capacity);
        push_bounded(&mut self.other, other.min(100), self.capacity);
        self.idle = self.classify();
    }

    fn classify(&self) -> bool {
        if self.window == 0 || self.other.len() < self.window {
            return false;
        }
        self.other
            .iter()
            .rev()
            .take(self.window)
            .all(|&sample| sample < self.ceiling)
    }

    pub fn is_idle(&self) -> bool {
        self.idle
    }

    pub fn last_total(&self) -> Option<u8> {
        self.total.back().copied()
    }

    pub fn last_other(&self) -> Option<u8> {
        self.other.back().copied()
    }

    pub fn total_history(&self) -> &VecDeque<u8> {
        &self.total
    }

    pub fn other_history(&self) -> &VecDeque<u8> {
        &self.other
    }
}

fn push_bounded(history: &mut VecDeque<u8>, sample: u8, capacity: usize) {
    if capacity == 0 {
        return;
    }
    while history.len() >= capacity {
        history.pop_front();
    }
    history.push_back(sample);
}
