//! Round-trip measurement pass.
//!
//! The gateway probes one node at a time: it sends a ranging request and
//! waits for the acknowledgment carrying the measured round trip. Nodes that
//! stay silent through every attempt are evicted so the scheduler never
//! reserves a slot for an unreachable peer.

use embassy_time::{Instant, with_deadline};
use log::{debug, info, warn};

use embassy_sync::pubsub::WaitResult;

use crate::error::MacError;
use crate::modem::{Modem, RxStream};
use crate::packet::{NodeAddress, Packet, PacketType};

use super::Gateway;

impl<M: Modem> Gateway<'_, M> {
    /// Measure the round-trip time of flight of every topology member.
    ///
    /// Nodes are probed in topology order, strictly one at a time; an
    /// acknowledgment is only accepted from the node currently being probed,
    /// so a stale ack from an earlier exchange cannot be mistaken for a
    /// fresh measurement. A node that times out `max_ping_attempts` times in
    /// a row is dropped from the topology.
    ///
    /// Fails with [`MacError::TopologyEmpty`] when there is nothing to probe
    /// before, or nothing left after, the pass.
    pub async fn range_topology(&mut self) -> Result<(), MacError> {
        if self.topology.is_empty() {
            return Err(MacError::TopologyEmpty);
        }

        // Listen before the first request so a fast ack cannot be lost.
        let mut rx = self.modem.listen()?;

        // Iterate a snapshot and collect survivors; the live topology is
        // swapped once at the end of the pass.
        let snapshot = self.topology.clone();
        let mut surviving = Vec::with_capacity(snapshot.len());

        info!("ranging {} nodes", snapshot.len());
        for addr in snapshot {
            match self.range_one(&mut rx, addr).await? {
                Some(round_trip_us) => {
                    info!("node {}: round trip {} us", addr, round_trip_us);
                    self.round_trip_us.insert(addr, round_trip_us);
                    surviving.push(addr);
                }
                None => {
                    warn!(
                        "node {}: no ranging ack after {} attempts, evicting",
                        addr, self.config.max_ping_attempts
                    );
                    self.stats.evicted_unresponsive += 1;
                }
            }
        }
        self.topology = surviving;

        if self.topology.is_empty() {
            return Err(MacError::TopologyEmpty);
        }
        Ok(())
    }

    /// Probe a single node, retrying on timeout. Returns the measured round
    /// trip, or `None` once every attempt has been used up.
    async fn range_one(
        &mut self,
        rx: &mut RxStream,
        addr: NodeAddress,
    ) -> Result<Option<u32>, MacError> {
        for attempt in 1..=self.config.max_ping_attempts {
            self.modem
                .send(Packet::ping_request(self.config.gateway_address, addr))
                .await?;

            let deadline = Instant::now() + self.config.ping_timeout();
            loop {
                match with_deadline(deadline, rx.next_message()).await {
                    Ok(WaitResult::Message(packet)) => {
                        if packet.kind == PacketType::Ping && packet.src == addr {
                            if let Some(round_trip_us) = packet.payload_u32() {
                                return Ok(Some(round_trip_us));
                            }
                            debug!("node {}: ranging ack without a measurement, ignoring", addr);
                            continue;
                        }
                        // A response from some other exchange; keep waiting.
                        debug!(
                            "ignoring {:?} from {} while probing node {}",
                            packet.kind, packet.src, addr
                        );
                    }
                    Ok(WaitResult::Lagged(missed)) => {
                        warn!("receive stream lagged during ranging, {} packets lost", missed);
                    }
                    Err(_) => {
                        debug!(
                            "node {}: ranging attempt {}/{} timed out",
                            addr, attempt, self.config.max_ping_attempts
                        );
                        break;
                    }
                }
            }
        }
        Ok(None)
    }
}
