//! Small helpers shared by the supervision loops.

pub mod task;

use std::collections::BTreeMap;

/// Scans the map of nodes with their reported value and returns the highest
/// value together with the names of all nodes that reported exactly this
/// value. Returns `None` on an empty map.
pub fn max_entries<V>(map: &BTreeMap<String, V>) -> Option<(V, Vec<String>)>
where
    V: Clone + PartialOrd,
{
    let mut best: Option<(V, Vec<String>)> = None;
    for (name, value) in map {
        match &mut best {
            None => best = Some((value.clone(), vec![name.clone()])),
            Some((current, names)) => {
                if value > current {
                    *current = value.clone();
                    names.clear();
                    names.push(name.clone());
                } else if value == current {
                    names.push(name.clone());
                }
            }
        }
    }
    best
}

/// Counterpart of [`max_entries`] for the lowest value.
pub fn min_entries<V>(map: &BTreeMap<String, V>) -> Option<(V, Vec<String>)>
where
    V: Clone + PartialOrd,
{
    let mut best: Option<(V, Vec<String>)> = None;
    for (name, value) in map {
        match &mut best {
            None => best = Some((value.clone(), vec![name.clone()])),
            Some((current, names)) => {
                if value < current {
                    *current = value.clone();
                    names.clear();
                    names.push(name.clone());
                } else if value == current {
                    names.push(name.clone());
                }
            }
        }
    }
    best
}
