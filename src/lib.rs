//! Time-division MAC engine for half-duplex acoustic modem networks.
//!
//! Sound is slow: on an acoustic channel the propagation delay between two
//! modems is counted in tens or hundreds of milliseconds and differs from
//! node to node. This crate implements the coordination layer that makes a
//! single shared channel usable anyway. One gateway measures each node's
//! round-trip time of flight, converts the measurements into collision-free
//! per-node transmit offsets, distributes them, and then polls the whole
//! topology once per superframe. Nodes wait out their assigned offset before
//! answering, so every response lands in its own window at the gateway.
//!
//! ## Module Organization
//!
//! - `packet`: addresses, packet types, and payload encodings
//! - `airtime`: the on-air transmission time model
//! - `modem`: the transport contract the MAC runs on top of
//! - `gateway`: ranging, slot scheduling, and the poll loop
//! - `node`: the node-side slot agent
//! - `config`: tunable parameters for both sides
//! - `error`: the error taxonomy
//!
//! The gateway and node engines are generic over the [`modem::Modem`] trait;
//! anything that can ferry packets and fan out received ones satisfies it,
//! including the in-process network used by the integration tests.

pub mod airtime;
pub mod config;
pub mod error;
pub mod gateway;
pub mod modem;
pub mod node;
pub mod packet;

pub use airtime::ModemTimings;
pub use config::{MacConfig, NodeConfig};
pub use error::MacError;
pub use gateway::{Gateway, GatewayHandle, GatewayStats, PollOutcome, RoundReport};
pub use modem::{Modem, ModemError, RxStream};
pub use node::{NodeAgent, NodeHandle};
pub use packet::{BROADCAST_ADDRESS, NodeAddress, Packet, PacketType};
