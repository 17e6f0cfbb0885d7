//! Node-side slot agent.
//!
//! A node is passive: it waits for the gateway to assign it a transmit delay
//! (TDI packet), then answers every data request after exactly that delay.
//! The agent runs as a single task that owns all protocol state; the
//! application talks to it through a cloneable [`NodeHandle`].

use std::cell::Cell;
use std::sync::Arc;

use embassy_futures::select::{Either, select};
use embassy_sync::blocking_mutex::Mutex;
use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::channel::Channel;
use embassy_sync::pubsub::WaitResult;
use embassy_sync::signal::Signal;
use embassy_time::{Duration, Instant, Timer};
use log::{debug, info, warn};

use crate::config::NodeConfig;
use crate::error::MacError;
use crate::modem::Modem;
use crate::packet::{Packet, PacketType, PayloadTooLarge};

/// Messages queued for transmission before the next poll picks one up.
const OUTBOX_DEPTH: usize = 8;

/// State shared between the agent task and application handles.
struct NodeShared {
    /// Assigned transmit delay in microseconds; `None` until the first TDI.
    assigned_us: Mutex<CriticalSectionRawMutex, Cell<Option<u32>>>,
    /// Wakes flows blocked on assignment. The delay cell is written before
    /// this fires.
    assignment: Signal<CriticalSectionRawMutex, u32>,
    outbox: Channel<CriticalSectionRawMutex, Vec<u8>, OUTBOX_DEPTH>,
}

/// A data answer armed by a poll request, waiting out the assigned delay.
struct PendingReply {
    due: Instant,
    dsn: u8,
    payload: Vec<u8>,
}

/// Application-side handle to a running [`NodeAgent`].
#[derive(Clone)]
pub struct NodeHandle {
    shared: Arc<NodeShared>,
}

impl NodeHandle {
    /// Block until the gateway has assigned a transmit delay. There is no
    /// timeout: an unassigned node has nothing to say and waits silently.
    pub async fn wait_for_assignment(&self) -> u32 {
        loop {
            if let Some(delay) = self.shared.assigned_us.lock(|c| c.get()) {
                return delay;
            }
            self.shared.assignment.wait().await;
        }
    }

    /// Queue `data` for transmission on the next poll. Blocks until the node
    /// has a slot assignment, then until outbox space is available.
    pub async fn send(&self, data: Vec<u8>) -> Result<(), PayloadTooLarge> {
        if data.len() > crate::packet::MAX_PAYLOAD_LEN {
            return Err(PayloadTooLarge(data.len()));
        }
        self.wait_for_assignment().await;
        self.shared.outbox.send(data).await;
        Ok(())
    }

    /// Currently assigned transmit delay, if any.
    pub fn assigned_delay_us(&self) -> Option<u32> {
        self.shared.assigned_us.lock(|c| c.get())
    }

    /// Messages waiting in the outbox.
    pub fn queued_messages(&self) -> usize {
        self.shared.outbox.len()
    }
}

/// Node-side protocol task.
pub struct NodeAgent<'a, M: Modem> {
    modem: &'a M,
    config: NodeConfig,
    shared: Arc<NodeShared>,
}

impl<'a, M: Modem> NodeAgent<'a, M> {
    pub fn new(modem: &'a M, config: NodeConfig) -> Self {
        Self {
            modem,
            config,
            shared: Arc::new(NodeShared {
                assigned_us: Mutex::new(Cell::new(None)),
                assignment: Signal::new(),
                outbox: Channel::new(),
            }),
        }
    }

    pub fn handle(&self) -> NodeHandle {
        NodeHandle {
            shared: self.shared.clone(),
        }
    }

    /// See [`NodeHandle::wait_for_assignment`].
    pub async fn wait_for_assignment(&self) -> u32 {
        self.handle().wait_for_assignment().await
    }

    /// See [`NodeHandle::send`].
    pub async fn send(&self, data: Vec<u8>) -> Result<(), PayloadTooLarge> {
        self.handle().send(data).await
    }

    /// Currently assigned transmit delay, if any.
    pub fn assigned_delay_us(&self) -> Option<u32> {
        self.shared.assigned_us.lock(|c| c.get())
    }

    /// Drive the agent. Listens for slot assignments and poll requests and
    /// answers inside the assigned slot. The receive path stays live while a
    /// deferred answer waits out its delay.
    pub async fn run(&self) -> Result<(), MacError> {
        let mut rx = self.modem.listen()?;
        let mut pending: Option<PendingReply> = None;

        loop {
            let due = pending.as_ref().map(|reply| reply.due);
            let fire = match due {
                Some(due) => match select(rx.next_message(), Timer::at(due)).await {
                    Either::First(event) => {
                        self.on_rx_event(event, &mut pending);
                        false
                    }
                    Either::Second(()) => true,
                },
                None => {
                    let event = rx.next_message().await;
                    self.on_rx_event(event, &mut pending);
                    false
                }
            };

            if fire {
                if let Some(reply) = pending.take() {
                    debug!(
                        "node {}: slot reached, transmitting {} bytes (dsn {})",
                        self.config.address,
                        reply.payload.len(),
                        reply.dsn
                    );
                    match Packet::data(
                        self.config.address,
                        self.config.gateway_address,
                        reply.dsn,
                        reply.payload,
                    ) {
                        Ok(packet) => self.modem.send(packet).await?,
                        // enqueue bounds queued payloads, so only an
                        // oversized idle payload can land here
                        Err(e) => {
                            warn!("node {}: dropping reply: {}", self.config.address, e);
                        }
                    }
                }
            }
        }
    }

    fn on_rx_event(&self, event: WaitResult<Packet>, pending: &mut Option<PendingReply>) {
        let packet = match event {
            WaitResult::Message(packet) => packet,
            WaitResult::Lagged(missed) => {
                warn!(
                    "node {}: receive stream lagged, {} packets lost",
                    self.config.address, missed
                );
                return;
            }
        };

        match packet.kind {
            PacketType::Tdi => match packet.payload_u32() {
                Some(delay_us) => {
                    info!(
                        "node {}: assigned transmit delay {} us",
                        self.config.address, delay_us
                    );
                    // Order matters: publish the value, then wake waiters.
                    self.shared.assigned_us.lock(|c| c.set(Some(delay_us)));
                    self.shared.assignment.signal(delay_us);
                }
                None => warn!(
                    "node {}: slot assignment without a delay payload, ignoring",
                    self.config.address
                ),
            },
            PacketType::ReqData => {
                let Some(delay_us) = self.shared.assigned_us.lock(|c| c.get()) else {
                    debug!(
                        "node {}: data request before slot assignment, ignoring",
                        self.config.address
                    );
                    return;
                };
                if pending.is_some() {
                    warn!(
                        "node {}: new data request before the previous answer fired, replacing it",
                        self.config.address
                    );
                }
                let payload = self
                    .shared
                    .outbox
                    .try_receive()
                    .unwrap_or_else(|_| self.config.idle_payload.clone());
                *pending = Some(PendingReply {
                    due: Instant::now() + Duration::from_micros(u64::from(delay_us)),
                    dsn: packet.dsn,
                    payload,
                });
            }
            PacketType::Ping | PacketType::Data => {
                // Ranging is answered by the modem itself; data packets
                // addressed here are not part of the protocol.
                debug!(
                    "node {}: ignoring {:?} packet from {}",
                    self.config.address, packet.kind, packet.src
                );
            }
        }
    }
}
