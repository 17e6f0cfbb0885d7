//! Gateway-side MAC engine.
//!
//! The gateway owns the channel: it measures each node's round-trip time of
//! flight, derives collision-free transmit offsets, distributes them, and
//! then polls the topology once per superframe. All protocol state lives in
//! one task; inbound packets are consumed from the modem's receive stream by
//! whichever phase is currently waiting, so no phase races another for the
//! shared tables.
//!
//! ## Module Organization
//!
//! - `ranging`: round-trip measurement with retry and eviction
//! - `schedule`: slot-delay computation from the measurements
//! - `poll`: the cyclic data-request loop with jitter tracking
//!
//! The phases run in a fixed order: ranging, scheduling, distribution, then
//! the poll loop. [`Gateway::run`] drives the whole sequence and re-enters
//! ranging when the poll loop reports timing drift.

mod poll;
mod ranging;
mod schedule;

pub use poll::{PollOutcome, RoundReport};

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use embassy_time::Instant;
use log::info;

use crate::config::MacConfig;
use crate::error::MacError;
use crate::modem::Modem;
use crate::packet::{NodeAddress, Packet};

/// Counters tracking degraded-mode events since the gateway started.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GatewayStats {
    /// Completed poll cycles.
    pub rounds: u32,
    /// Cycles that ended on the collection deadline with nodes missing.
    pub collection_timeouts: u32,
    /// Data packets dropped because their sequence number belonged to an
    /// already-closed round.
    pub stale_drops: u32,
    /// Responses that arrived outside the expected window.
    pub jitter_warnings: u32,
    /// Times the poll loop requested a fresh ranging pass.
    pub reschedules: u32,
    /// Nodes evicted during ranging after exhausting all attempts.
    pub evicted_unresponsive: u32,
    /// Nodes evicted by the missing-node policy during polling.
    pub evicted_missing: u32,
}

/// Stops a running gateway from another logical flow.
#[derive(Clone)]
pub struct GatewayHandle {
    running: Arc<AtomicBool>,
}

impl GatewayHandle {
    /// Request the poll loop to exit. Any in-flight wait completes first.
    pub fn stop(&self) {
        self.running.store(false, Ordering::Relaxed);
    }
}

/// Gateway-side protocol engine.
pub struct Gateway<'a, M: Modem> {
    modem: &'a M,
    config: MacConfig,
    /// Nodes currently served, in ranging order until scheduling sorts them
    /// by measured round trip.
    topology: Vec<NodeAddress>,
    /// Measured round-trip time of flight per node, microseconds. Entries
    /// outlive eviction; only current topology members are consulted.
    round_trip_us: HashMap<NodeAddress, u32>,
    /// Assigned transmit offsets per node, microseconds.
    slot_delays: HashMap<NodeAddress, u32>,
    /// Poll-cycle sequence number, incremented mod 256 per cycle.
    sequence: u8,
    /// Consecutive jitter violations per node.
    jitter_strikes: HashMap<NodeAddress, u32>,
    /// Consecutive missed rounds per node.
    miss_strikes: HashMap<NodeAddress, u32>,
    last_report: Option<RoundReport>,
    stats: GatewayStats,
    running: Arc<AtomicBool>,
}

impl<'a, M: Modem> Gateway<'a, M> {
    pub fn new(modem: &'a M, config: MacConfig, topology: Vec<NodeAddress>) -> Self {
        Self {
            modem,
            config,
            topology,
            round_trip_us: HashMap::new(),
            slot_delays: HashMap::new(),
            sequence: 0,
            jitter_strikes: HashMap::new(),
            miss_strikes: HashMap::new(),
            last_report: None,
            stats: GatewayStats::default(),
            running: Arc::new(AtomicBool::new(true)),
        }
    }

    pub fn handle(&self) -> GatewayHandle {
        GatewayHandle {
            running: self.running.clone(),
        }
    }

    /// Nodes currently served, in slot order once scheduling has run.
    pub fn topology(&self) -> &[NodeAddress] {
        &self.topology
    }

    pub fn round_trip_times(&self) -> &HashMap<NodeAddress, u32> {
        &self.round_trip_us
    }

    pub fn slot_delays(&self) -> &HashMap<NodeAddress, u32> {
        &self.slot_delays
    }

    /// Outcome of the most recent poll cycle.
    pub fn last_report(&self) -> Option<&RoundReport> {
        self.last_report.as_ref()
    }

    pub fn stats(&self) -> GatewayStats {
        self.stats
    }

    /// Width of one response slot: the on-air time of a data answer plus the
    /// guard interval.
    pub fn slot_us(&self) -> u64 {
        self.config
            .timings
            .transmission_time_us(u64::from(self.config.data_payload_bits))
            + self.config.guard_interval_us
    }

    /// Compute the slot delay table from the current measurements. Sorts the
    /// topology by round trip ascending as a side effect.
    pub fn schedule_slots(&mut self) -> Result<(), MacError> {
        let slot_us = self.slot_us();
        self.slot_delays = schedule::compute_slot_delays(
            &mut self.topology,
            &self.round_trip_us,
            slot_us,
        )?;
        info!(
            "scheduled {} nodes into {} us slots",
            self.topology.len(),
            slot_us
        );
        Ok(())
    }

    /// Send every topology member its assigned transmit delay. No
    /// acknowledgment is awaited; a lost assignment surfaces later as a node
    /// missing from rounds, and assignments can be re-sent at any time.
    pub async fn distribute_slots(&self) -> Result<(), MacError> {
        for &addr in &self.topology {
            let delay_us = self
                .slot_delays
                .get(&addr)
                .copied()
                .ok_or(MacError::NotScheduled(addr))?;
            self.modem
                .send(Packet::tdi(self.config.gateway_address, addr, delay_us))
                .await?;
        }
        info!("distributed slot delays to {} nodes", self.topology.len());
        Ok(())
    }

    /// Run the full gateway sequence: ranging, scheduling, distribution,
    /// then the poll loop. Re-enters ranging when the poll loop detects
    /// timing drift. Returns once stopped or after the configured number of
    /// rounds.
    pub async fn run(&mut self) -> Result<(), MacError> {
        loop {
            self.range_topology().await?;
            self.schedule_slots()?;
            self.distribute_slots().await?;
            match self.poll().await? {
                PollOutcome::Stopped => return Ok(()),
                PollOutcome::RescheduleNeeded => {
                    info!("timing drift detected, re-running ranging");
                    continue;
                }
            }
        }
    }

    fn running(&self) -> bool {
        self.running.load(Ordering::Relaxed)
    }

    /// Absolute microsecond distance between two instants.
    fn deviation_us(a: Instant, b: Instant) -> u64 {
        a.as_micros().abs_diff(b.as_micros())
    }
}
