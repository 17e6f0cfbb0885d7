//! Slot-delay assignment.
//!
//! Converts per-node round-trip measurements into transmit offsets such that
//! no two answers can overlap at the gateway. Nodes are served closest
//! first; each following node is pushed one slot further out, minus twice
//! the one-way spread to its predecessor:
//!
//! ```text
//! delay[0] = 0
//! delay[i] = delay[i-1] + slot - 2 * (oneway[i] - oneway[i-1])
//! ```
//!
//! A farther node's answer needs more travel time, so it may start
//! transmitting earlier relative to the broadcast trigger. Each microsecond
//! of extra one-way distance delays the trigger's arrival by one
//! microsecond and the answer's return by another, hence the factor two.

use std::collections::HashMap;

use log::warn;

use crate::error::MacError;
use crate::packet::NodeAddress;

/// Compute the transmit-delay table for `topology`, sorting it by round
/// trip ascending in place. `slot_us` is the full width of one response
/// slot (on-air time plus guard interval).
///
/// The computation is deterministic for unchanged inputs: the sort is
/// stable, so nodes with equal round trips keep their relative order.
pub(crate) fn compute_slot_delays(
    topology: &mut Vec<NodeAddress>,
    round_trip_us: &HashMap<NodeAddress, u32>,
    slot_us: u64,
) -> Result<HashMap<NodeAddress, u32>, MacError> {
    if topology.is_empty() {
        return Err(MacError::TopologyEmpty);
    }
    for &addr in topology.iter() {
        if !round_trip_us.contains_key(&addr) {
            return Err(MacError::MissingMeasurement(addr));
        }
    }

    // The delay formula assumes one-way times are non-decreasing along the
    // slot order; serving closest-first makes that hold.
    topology.sort_by_key(|addr| round_trip_us[addr]);

    let mut delays = HashMap::with_capacity(topology.len());
    delays.insert(topology[0], 0u32);

    for pair in topology.windows(2) {
        let (prev, cur) = (pair[0], pair[1]);
        let one_way_spread =
            i64::from(round_trip_us[&cur] / 2) - i64::from(round_trip_us[&prev] / 2);
        let delay = i64::from(delays[&prev]) + slot_us as i64 - 2 * one_way_spread;
        let delay = if delay < 0 {
            // Only possible when two nodes' one-way times differ by more
            // than a whole slot; the measurements are suspect.
            warn!(
                "node {}: computed transmit delay {} us is negative, clamping to 0",
                cur, delay
            );
            0
        } else {
            delay.min(i64::from(u32::MAX))
        };
        delays.insert(cur, delay as u32);
    }

    Ok(delays)
}
