//! Block height memory of all nodes for judging their health.

use crate::api::NodeStatistic;
use crate::utils::max_entries;

use num_bigint::BigInt;
use num_traits::ToPrimitive;
use std::collections::{BTreeMap, VecDeque};

/// Bounded history of the block heights every node reported, newest sample
/// first. A node that missed a polling cycle is recorded with a sentinel of
/// `-1` so the history of all nodes stays aligned.
pub struct BlockHeightMemory {
    window: usize,
    mem: BTreeMap<String, VecDeque<BigInt>>,
}

fn sentinel() -> BigInt {
    BigInt::from(-1)
}

impl BlockHeightMemory {
    /// Creates a new block height memory for the given nodes. `window`
    /// specifies the number of checkpoints that shall be remembered. Every
    /// node owns its backing storage.
    pub fn new(nodes: &[String], window: usize) -> Self {
        let mem = nodes
            .iter()
            .map(|name| {
                let history: VecDeque<BigInt> = (0..window).map(|_| sentinel()).collect();
                (name.clone(), history)
            })
            .collect();
        BlockHeightMemory { window, mem }
    }

    /// Adds the block heights for all known nodes as a new checkpoint; the
    /// oldest checkpoint falls out of the window.
    pub fn record(&mut self, stats: &BTreeMap<String, NodeStatistic>) {
        for (name, history) in self.mem.iter_mut() {
            let entry = stats
                .get(name)
                .map(|stat| stat.last_block_height.clone())
                .unwrap_or_else(sentinel);
            history.push_front(entry);
            history.truncate(self.window);
        }
    }

    /// Per checkpoint, the difference of each node's height to the maximum
    /// height reported at that checkpoint.
    fn diffs(&self) -> BTreeMap<String, Vec<BigInt>> {
        let mut diff_map: BTreeMap<String, Vec<BigInt>> = self
            .mem
            .keys()
            .map(|name| (name.clone(), Vec::with_capacity(self.window)))
            .collect();
        for i in 0..self.window {
            let current: BTreeMap<String, BigInt> = self
                .mem
                .iter()
                .map(|(name, history)| (name.clone(), history[i].clone()))
                .collect();
            let max_height = match max_entries(&current) {
                Some((max, _)) => max,
                None => return diff_map,
            };
            for (name, height) in current {
                diff_map
                    .get_mut(&name)
                    .expect("diff map covers all nodes")
                    .push(&max_height - height);
            }
        }
        diff_map
    }

    /// Computes the drift of all the given nodes: a reverse weighting by
    /// time, so the deficit of past checkpoints has a lower weight than the
    /// deficit of recent checkpoints. The exact function is
    ///
    /// ```text
    ///     sum_x diff_x * sqrt((n - x) / n)
    /// ```
    ///
    /// where `x` is the checkpoint index (0 = newest), `n` the window size
    /// and `diff_x` the height deficit at checkpoint `x`. Lower is
    /// healthier; a node at parity with the fleet maximum throughout
    /// scores exactly 0.
    pub fn drift_scores(&self) -> BTreeMap<String, f64> {
        let n = self.window as f64;
        self.diffs()
            .into_iter()
            .map(|(name, history)| {
                let score = history
                    .iter()
                    .enumerate()
                    .map(|(x, diff)| {
                        let weight = ((n - x as f64) / n).sqrt();
                        diff.to_f64().unwrap_or(f64::MAX) * weight
                    })
                    .sum();
                (name, score)
            })
            .collect()
    }
}
