//! Orders live input before it reaches the block queue.
//!
//! Subscriptions may deliver blocks out of order. Adds ahead of the next
//! expected number are held back until the gap closes. Removes pass straight
//! through and rewind the expected number.

use std::collections::BTreeMap;

use tracing::debug;

use marketsync_core::types::{BlockDirection, BlockUnit};

#[derive(Debug)]
pub struct Sequencer {
    next: u64,
    pending: BTreeMap<u64, BlockUnit>,
}

impl Sequencer {
    /// Expect `next` as the first add.
    pub fn new(next: u64) -> Self {
        Self {
            next,
            pending: BTreeMap::new(),
        }
    }

    pub fn next_expected(&self) -> u64 {
        self.next
    }

    pub fn buffered(&self) -> usize {
        self.pending.len()
    }

    /// Feed one unit; returns the units that are ready, in order.
    pub fn push(&mut self, unit: BlockUnit) -> Vec<BlockUnit> {
        let number = unit.block.number;
        match unit.direction {
            BlockDirection::Remove => {
                self.next = number;
                self.pending.retain(|&n, _| n < number);
                vec![unit]
            }
            BlockDirection::Add if number < self.next => vec![unit],
            BlockDirection::Add if number > self.next => {
                debug!(block = number, expected = self.next, "holding block until gap closes");
                self.pending.insert(number, unit);
                Vec::new()
            }
            BlockDirection::Add => {
                let mut ready = vec![unit];
                self.next = number + 1;
                while let Some(unit) = self.pending.remove(&self.next) {
                    ready.push(unit);
                    self.next += 1;
                }
                ready
            }
        }
    }
}
