//! In-process acoustic network for the integration tests.
//!
//! A star topology: one gateway modem and any number of node modems, each
//! joined to the gateway by a link with its own one-way propagation delay.
//! A central task carries every transmission, delivering it after the
//! link delay and answering ranging requests the way the modem hardware
//! does (the MAC never sees its own ranging acks being produced). Links can
//! drop packets on demand to simulate loss, and their delay can be changed
//! mid-run to simulate a drifting channel.

#![allow(dead_code)]

use std::cell::RefCell;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};

use embassy_futures::select::{Either, select};
use embassy_sync::blocking_mutex::Mutex;
use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::channel::{Channel, Sender};
use embassy_time::{Duration, Instant, Timer};
use log::{debug, trace};

use tdamac::modem::{Modem, ModemError, RxQueue, RxStream};
use tdamac::packet::{NodeAddress, Packet, PacketType};

const NET_QUEUE_DEPTH: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum Endpoint {
    Gateway,
    Node(NodeAddress),
}

struct Transmission {
    from: Endpoint,
    packet: Packet,
}

type NetQueue = Channel<CriticalSectionRawMutex, Transmission, NET_QUEUE_DEPTH>;
type NetSender = Sender<'static, CriticalSectionRawMutex, Transmission, NET_QUEUE_DEPTH>;
type LinkTable = Mutex<CriticalSectionRawMutex, RefCell<HashMap<NodeAddress, LinkState>>>;

struct LinkState {
    one_way: Duration,
    /// Drop the next N packets travelling toward the node.
    drop_next_rx: u32,
    /// Drop the next N packets sent by the node.
    drop_next_tx: u32,
    /// Drop everything toward the node (it hears nothing, so it answers
    /// nothing).
    silent: bool,
}

struct Delivery {
    due: Instant,
    to: Endpoint,
    packet: Packet,
}

/// One simulated modem, gateway- or node-side.
pub struct SimModem {
    endpoint: Endpoint,
    net_tx: NetSender,
    rx: &'static RxQueue,
    connected: AtomicBool,
    receiving: AtomicBool,
}

impl Modem for SimModem {
    fn connect(&self, descriptor: &str) -> Result<(), ModemError> {
        debug!("sim modem {:?}: connected to {}", self.endpoint, descriptor);
        self.connected.store(true, Ordering::Relaxed);
        Ok(())
    }

    fn start_receive(&self) -> Result<(), ModemError> {
        if !self.connected.load(Ordering::Relaxed) {
            return Err(ModemError::NotConnected);
        }
        self.receiving.store(true, Ordering::Relaxed);
        Ok(())
    }

    async fn send(&self, packet: Packet) -> Result<(), ModemError> {
        if !self.connected.load(Ordering::Relaxed) {
            return Err(ModemError::NotConnected);
        }
        self.net_tx
            .send(Transmission {
                from: self.endpoint,
                packet,
            })
            .await;
        Ok(())
    }

    fn listen(&self) -> Result<RxStream, ModemError> {
        self.rx
            .dyn_subscriber()
            .map_err(|_| ModemError::ListenersExhausted)
    }
}

/// The network itself. Build it, add nodes, connect the modems, then keep
/// [`SimNetwork::run`] selected against the test scenario.
pub struct SimNetwork {
    net: &'static NetQueue,
    links: &'static LinkTable,
    gateway: &'static SimModem,
    nodes: HashMap<NodeAddress, &'static SimModem>,
}

impl SimNetwork {
    pub fn new() -> Self {
        // Leaked so the modem channels get the 'static lifetime the Modem
        // contract hands out; one allocation per test process.
        let net: &'static NetQueue = Box::leak(Box::new(NetQueue::new()));
        let links: &'static LinkTable = Box::leak(Box::new(Mutex::new(RefCell::new(HashMap::new()))));
        let gateway: &'static SimModem = Box::leak(Box::new(SimModem {
            endpoint: Endpoint::Gateway,
            net_tx: net.sender(),
            rx: Box::leak(Box::new(RxQueue::new())),
            connected: AtomicBool::new(false),
            receiving: AtomicBool::new(false),
        }));
        Self {
            net,
            links,
            gateway,
            nodes: HashMap::new(),
        }
    }

    pub fn gateway_modem(&self) -> &'static SimModem {
        self.gateway
    }

    /// Join a node to the gateway over a link with the given one-way
    /// propagation delay.
    pub fn add_node(&mut self, addr: NodeAddress, one_way: Duration) -> &'static SimModem {
        let modem: &'static SimModem = Box::leak(Box::new(SimModem {
            endpoint: Endpoint::Node(addr),
            net_tx: self.net.sender(),
            rx: Box::leak(Box::new(RxQueue::new())),
            connected: AtomicBool::new(false),
            receiving: AtomicBool::new(false),
        }));
        self.links.lock(|cell| {
            cell.borrow_mut().insert(
                addr,
                LinkState {
                    one_way,
                    drop_next_rx: 0,
                    drop_next_tx: 0,
                    silent: false,
                },
            );
        });
        self.nodes.insert(addr, modem);
        modem
    }

    /// Change a link's propagation delay mid-run (channel drift).
    pub fn set_one_way(&self, addr: NodeAddress, one_way: Duration) {
        self.links.lock(|cell| {
            if let Some(link) = cell.borrow_mut().get_mut(&addr) {
                link.one_way = one_way;
            }
        });
    }

    /// Drop the next `n` packets travelling toward `addr`.
    pub fn drop_next_rx(&self, addr: NodeAddress, n: u32) {
        self.links.lock(|cell| {
            if let Some(link) = cell.borrow_mut().get_mut(&addr) {
                link.drop_next_rx = n;
            }
        });
    }

    /// Drop the next `n` packets sent by `addr`.
    pub fn drop_next_tx(&self, addr: NodeAddress, n: u32) {
        self.links.lock(|cell| {
            if let Some(link) = cell.borrow_mut().get_mut(&addr) {
                link.drop_next_tx = n;
            }
        });
    }

    /// Make `addr` deaf: every packet toward it is lost.
    pub fn set_silent(&self, addr: NodeAddress, silent: bool) {
        self.links.lock(|cell| {
            if let Some(link) = cell.borrow_mut().get_mut(&addr) {
                link.silent = silent;
            }
        });
    }

    /// Carry transmissions forever. Select this against the test scenario.
    pub async fn run(&self) {
        let mut in_flight: Vec<Delivery> = Vec::new();
        loop {
            let next_due = in_flight.iter().map(|d| d.due).min();
            let incoming = match next_due {
                Some(due) => match select(self.net.receive(), Timer::at(due)).await {
                    Either::First(tx) => Some(tx),
                    Either::Second(()) => None,
                },
                None => Some(self.net.receive().await),
            };

            if let Some(tx) = incoming {
                self.route(tx, &mut in_flight);
            }

            let now = Instant::now();
            let mut i = 0;
            while i < in_flight.len() {
                if in_flight[i].due <= now {
                    let delivery = in_flight.swap_remove(i);
                    self.deliver(delivery, &mut in_flight);
                } else {
                    i += 1;
                }
            }
        }
    }

    fn route(&self, tx: Transmission, in_flight: &mut Vec<Delivery>) {
        let now = Instant::now();
        match tx.from {
            Endpoint::Gateway => {
                let targets: Vec<NodeAddress> = if tx.packet.is_broadcast() {
                    self.nodes.keys().copied().collect()
                } else {
                    vec![tx.packet.dst]
                };
                for addr in targets {
                    if !self.nodes.contains_key(&addr) {
                        continue;
                    }
                    if self.consume_rx_drop(addr) {
                        debug!("sim: node {} lost {:?} on receive", addr, tx.packet.kind);
                        continue;
                    }
                    in_flight.push(Delivery {
                        due: now + self.one_way(addr),
                        to: Endpoint::Node(addr),
                        packet: tx.packet.clone(),
                    });
                }
            }
            Endpoint::Node(addr) => {
                if self.consume_tx_drop(addr) {
                    debug!("sim: node {} lost {:?} on transmit", addr, tx.packet.kind);
                    return;
                }
                in_flight.push(Delivery {
                    due: now + self.one_way(addr),
                    to: Endpoint::Gateway,
                    packet: tx.packet,
                });
            }
        }
    }

    fn deliver(&self, delivery: Delivery, in_flight: &mut Vec<Delivery>) {
        match delivery.to {
            Endpoint::Node(addr) => {
                // The modem hardware answers ranging itself with the round
                // trip it measures on this exchange.
                if delivery.packet.kind == PacketType::Ping && delivery.packet.wants_response() {
                    let one_way = self.one_way(addr);
                    if self.consume_tx_drop(addr) {
                        debug!("sim: node {} lost ranging ack on transmit", addr);
                    } else {
                        let round_trip_us = (one_way * 2).as_micros() as u32;
                        in_flight.push(Delivery {
                            due: Instant::now() + one_way,
                            to: Endpoint::Gateway,
                            packet: Packet::ping_reply(addr, delivery.packet.src, round_trip_us),
                        });
                    }
                }
                if let Some(modem) = self.nodes.get(&addr) {
                    self.publish(modem, delivery.packet);
                }
            }
            Endpoint::Gateway => {
                self.publish(self.gateway, delivery.packet);
            }
        }
    }

    fn publish(&self, modem: &SimModem, packet: Packet) {
        if !modem.receiving.load(Ordering::Relaxed) {
            debug!(
                "sim: {:?} not receiving, {:?} dropped",
                modem.endpoint, packet.kind
            );
            return;
        }
        trace!("sim: delivering {:?} to {:?}", packet.kind, modem.endpoint);
        modem.rx.dyn_immediate_publisher().publish_immediate(packet);
    }

    fn one_way(&self, addr: NodeAddress) -> Duration {
        self.links.lock(|cell| {
            cell.borrow()
                .get(&addr)
                .map(|link| link.one_way)
                .unwrap_or(Duration::from_ticks(0))
        })
    }

    fn consume_rx_drop(&self, addr: NodeAddress) -> bool {
        self.links.lock(|cell| {
            let mut links = cell.borrow_mut();
            let Some(link) = links.get_mut(&addr) else {
                return true;
            };
            if link.silent {
                return true;
            }
            if link.drop_next_rx > 0 {
                link.drop_next_rx -= 1;
                return true;
            }
            false
        })
    }

    fn consume_tx_drop(&self, addr: NodeAddress) -> bool {
        self.links.lock(|cell| {
            let mut links = cell.borrow_mut();
            let Some(link) = links.get_mut(&addr) else {
                return true;
            };
            if link.drop_next_tx > 0 {
                link.drop_next_tx -= 1;
                return true;
            }
            false
        })
    }
}

/// Connect a modem and start its receive path.
pub fn bring_up(modem: &SimModem, descriptor: &str) {
    modem.connect(descriptor).unwrap();
    modem.start_receive().unwrap();
}

/// Run `scenario` to completion while `background` keeps running.
pub async fn with_background<F, B>(scenario: F, background: B) -> F::Output
where
    F: Future,
    B: Future,
{
    match select(scenario, background).await {
        Either::First(out) => out,
        Either::Second(_) => panic!("background future finished before the scenario"),
    }
}

/// Block on `scenario` with the network task running alongside.
pub fn run_net<F: Future>(net: &SimNetwork, scenario: F) -> F::Output {
    futures::executor::block_on(with_background(scenario, net.run()))
}

pub fn init_logs() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Gateway config with timings scaled down so a whole superframe fits in a
/// test-friendly fraction of a second.
pub fn fast_config() -> tdamac::MacConfig {
    tdamac::MacConfig {
        ping_timeout_ms: 300,
        max_ping_attempts: 3,
        guard_interval_us: 10_000,
        data_request_timeout_ms: 500,
        poll_period_ms: 150,
        jitter_threshold_us: 20_000,
        data_payload_bits: 64,
        timings: tdamac::ModemTimings {
            // ~4167 bit/s net: a 112-bit frame is on the air for 26 880 us
            symbol_duration_us: 160.0,
            ..tdamac::ModemTimings::default()
        },
        ..tdamac::MacConfig::default()
    }
}
