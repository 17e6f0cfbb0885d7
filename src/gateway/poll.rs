//! Cyclic poll/collect loop.
//!
//! Once per superframe the gateway broadcasts a data request tagged with a
//! fresh sequence number, then collects answers until every topology member
//! has reported or the round deadline passes. Each accepted answer's arrival
//! time is checked against the expectation derived from the node's measured
//! round trip and assigned slot delay; sustained deviation means the
//! measurements have drifted and triggers a fresh ranging pass.

use std::collections::HashMap;

use embassy_sync::pubsub::WaitResult;
use embassy_time::{Duration, Instant, Timer, with_deadline};
use log::{debug, info, warn};

use crate::error::MacError;
use crate::modem::{Modem, RxStream};
use crate::packet::{NodeAddress, Packet, PacketType};

use super::Gateway;

/// Why the poll loop returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollOutcome {
    /// Stop was requested or the configured round count was reached.
    Stopped,
    /// Sustained arrival jitter; the caller should re-run ranging,
    /// scheduling, and distribution.
    RescheduleNeeded,
}

/// What one poll cycle produced.
#[derive(Debug, Clone)]
pub struct RoundReport {
    /// Sequence number this round was keyed by.
    pub dsn: u8,
    /// When the data request broadcast was sent.
    pub sent_at: Instant,
    /// Accepted answers by node address.
    pub packets: HashMap<NodeAddress, Packet>,
    /// Arrival timestamp of each accepted answer.
    pub arrivals: HashMap<NodeAddress, Instant>,
    /// Topology members that did not answer in time.
    pub missing: Vec<NodeAddress>,
    /// Whether the collection wait ran into its deadline.
    pub timed_out: bool,
}

enum RoundVerdict {
    Continue,
    Reschedule,
}

impl<M: Modem> Gateway<'_, M> {
    /// Poll the topology cyclically until stopped, the configured number of
    /// rounds completes, or the jitter policy demands rescheduling.
    pub async fn poll(&mut self) -> Result<PollOutcome, MacError> {
        let mut rx = self.modem.listen()?;
        self.jitter_strikes.clear();
        self.miss_strikes.clear();
        info!("polling {} nodes", self.topology.len());

        loop {
            if !self.running() {
                info!("stop requested, leaving the poll loop");
                return Ok(PollOutcome::Stopped);
            }
            if let Some(max) = self.config.max_rounds {
                if self.stats.rounds >= max {
                    info!("completed {} rounds, leaving the poll loop", max);
                    return Ok(PollOutcome::Stopped);
                }
            }
            match self.poll_round(&mut rx).await? {
                RoundVerdict::Continue => {}
                RoundVerdict::Reschedule => {
                    self.stats.reschedules += 1;
                    return Ok(PollOutcome::RescheduleNeeded);
                }
            }
        }
    }

    /// Run one poll cycle: broadcast, collect, check timing, pace.
    async fn poll_round(&mut self, rx: &mut RxStream) -> Result<RoundVerdict, MacError> {
        self.sequence = self.sequence.wrapping_add(1);
        let dsn = self.sequence;

        let mut packets: HashMap<NodeAddress, Packet> = HashMap::new();
        let mut arrivals: HashMap<NodeAddress, Instant> = HashMap::new();

        let sent_at = Instant::now();
        self.modem
            .send(Packet::req_data(self.config.gateway_address, dsn))
            .await?;
        debug!("round {}: data request broadcast", dsn);

        // The last slot's answer is the latest thing that can still arrive.
        let last = *self.topology.last().ok_or(MacError::TopologyEmpty)?;
        let last_delay_us = self
            .slot_delays
            .get(&last)
            .copied()
            .ok_or(MacError::NotScheduled(last))?;
        let deadline = sent_at
            + self.config.data_request_timeout()
            + Duration::from_micros(u64::from(last_delay_us) + self.config.guard_interval_us);

        let mut timed_out = false;
        while packets.len() < self.topology.len() {
            match with_deadline(deadline, rx.next_message()).await {
                Ok(WaitResult::Message(packet)) => {
                    self.accept(packet, dsn, &mut packets, &mut arrivals);
                }
                Ok(WaitResult::Lagged(missed)) => {
                    warn!(
                        "round {}: receive stream lagged, {} packets lost",
                        dsn, missed
                    );
                }
                Err(_) => {
                    timed_out = true;
                    self.stats.collection_timeouts += 1;
                    warn!(
                        "round {}: collection timed out with {}/{} answers",
                        dsn,
                        packets.len(),
                        self.topology.len()
                    );
                    break;
                }
            }
        }

        let missing: Vec<NodeAddress> = self
            .topology
            .iter()
            .copied()
            .filter(|addr| !packets.contains_key(addr))
            .collect();

        let verdict = self.check_timing(dsn, sent_at, &arrivals);
        let evicted = self.apply_miss_policy(&arrivals);

        self.stats.rounds += 1;
        self.last_report = Some(RoundReport {
            dsn,
            sent_at,
            packets,
            arrivals,
            missing,
            timed_out,
        });

        if evicted {
            // The slot chain changed; recompute from the retained
            // measurements and tell the survivors.
            self.schedule_slots()?;
            self.distribute_slots().await?;
        }

        // Pace the loop to one cycle per superframe.
        if let Some(rest) = self.config.poll_period().checked_sub(sent_at.elapsed()) {
            Timer::after(rest).await;
        }

        Ok(verdict)
    }

    /// Gate an inbound packet into the round state. Only data answers
    /// carrying the current round's sequence number from known nodes count.
    fn accept(
        &mut self,
        packet: Packet,
        dsn: u8,
        packets: &mut HashMap<NodeAddress, Packet>,
        arrivals: &mut HashMap<NodeAddress, Instant>,
    ) {
        if packet.kind != PacketType::Data {
            debug!(
                "round {}: ignoring {:?} from {} during collection",
                dsn, packet.kind, packet.src
            );
            return;
        }
        if packet.dsn != dsn {
            self.stats.stale_drops += 1;
            warn!(
                "round {}: dropping stale data from {} (dsn {})",
                dsn, packet.src, packet.dsn
            );
            return;
        }
        if !self.topology.contains(&packet.src) {
            warn!(
                "round {}: ignoring data from unknown node {}",
                dsn, packet.src
            );
            return;
        }
        if packets.contains_key(&packet.src) {
            debug!("round {}: duplicate answer from {}", dsn, packet.src);
            return;
        }
        debug!(
            "round {}: accepted {} bytes from {}",
            dsn,
            packet.payload.len(),
            packet.src
        );
        arrivals.insert(packet.src, Instant::now());
        packets.insert(packet.src, packet);
    }

    /// Compare each answer's arrival against the expectation derived from
    /// ranging and the slot table. Sustained deviation on any node asks for
    /// a reschedule.
    fn check_timing(
        &mut self,
        dsn: u8,
        sent_at: Instant,
        arrivals: &HashMap<NodeAddress, Instant>,
    ) -> RoundVerdict {
        let mut verdict = RoundVerdict::Continue;
        for &addr in &self.topology {
            let Some(&arrived_at) = arrivals.get(&addr) else {
                continue;
            };
            let (Some(&rtt), Some(&delay)) = (
                self.round_trip_us.get(&addr),
                self.slot_delays.get(&addr),
            ) else {
                continue;
            };
            let expected = sent_at + Duration::from_micros(u64::from(rtt) + u64::from(delay));
            let deviation = Self::deviation_us(arrived_at, expected);
            if deviation <= self.config.jitter_threshold_us {
                self.jitter_strikes.remove(&addr);
                continue;
            }
            self.stats.jitter_warnings += 1;
            let strikes = self.jitter_strikes.entry(addr).or_insert(0);
            *strikes += 1;
            warn!(
                "round {}: node {} arrived {} us off expectation ({} in a row)",
                dsn, addr, deviation, strikes
            );
            if let Some(limit) = self.config.reschedule_after_jitter {
                if *strikes >= limit {
                    verdict = RoundVerdict::Reschedule;
                }
            }
        }
        verdict
    }

    /// Track consecutive misses and evict nodes past the configured limit.
    /// Returns whether the topology changed.
    fn apply_miss_policy(&mut self, arrivals: &HashMap<NodeAddress, Instant>) -> bool {
        let Some(limit) = self.config.evict_after_misses else {
            return false;
        };
        let mut evict: Vec<NodeAddress> = Vec::new();
        for &addr in &self.topology {
            if arrivals.contains_key(&addr) {
                self.miss_strikes.remove(&addr);
                continue;
            }
            let strikes = self.miss_strikes.entry(addr).or_insert(0);
            *strikes += 1;
            debug!("node {}: missed round ({} in a row)", addr, strikes);
            if *strikes >= limit {
                evict.push(addr);
            }
        }
        if evict.is_empty() {
            return false;
        }
        for addr in &evict {
            warn!(
                "node {}: missed {} consecutive rounds, evicting",
                addr, limit
            );
            self.miss_strikes.remove(addr);
            self.jitter_strikes.remove(addr);
            self.slot_delays.remove(addr);
            self.stats.evicted_missing += 1;
        }
        self.topology.retain(|addr| !evict.contains(addr));
        true
    }
}
