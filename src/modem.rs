//! Contract between the MAC layer and the acoustic modem transport.
//!
//! The MAC never talks to hardware directly. A `Modem` implementation owns
//! the transport (serial line, TCP bridge, or an in-process simulation) and
//! fans every inbound packet out to the listeners obtained via [`Modem::listen`].
//! Dropping the returned stream unregisters the listener.

use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::pubsub::{DynSubscriber, PubSubChannel};
use thiserror::Error;

use crate::packet::Packet;

/// Inbound packets buffered per modem before the slowest listener lags.
pub const RX_QUEUE_DEPTH: usize = 16;
/// Listener slots per modem. Each MAC operation holds at most one.
pub const MAX_RX_LISTENERS: usize = 4;

/// Dispatch queue a modem implementation publishes inbound packets into.
///
/// Implementations keep one of these alive for the lifetime of the modem
/// (leaked at construction; the queues live as long as the process).
pub type RxQueue = PubSubChannel<CriticalSectionRawMutex, Packet, RX_QUEUE_DEPTH, MAX_RX_LISTENERS, 1>;

/// One listener's view of the inbound packet stream.
pub type RxStream = DynSubscriber<'static, Packet>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ModemError {
    /// `connect` has not been called yet.
    #[error("modem is not connected")]
    NotConnected,
    /// `start_receive` has not been called yet.
    #[error("modem reception has not been started")]
    NotReceiving,
    /// Every listener slot is taken.
    #[error("all receive listener slots are in use")]
    ListenersExhausted,
    /// The transport could not queue the packet.
    #[error("transmit queue is full")]
    TxQueueFull,
}

/// Half-duplex acoustic modem as seen by the MAC layer.
///
/// The receive path runs concurrently with whatever logical flow called
/// `send`: packets are delivered into the streams handed out by `listen`
/// while a caller is suspended in a wait. Listeners must therefore be
/// created *before* the request that could trigger a response is sent.
#[allow(async_fn_in_trait)]
pub trait Modem {
    /// Attach to the transport named by `descriptor` (a serial port, a
    /// `tcp@host:port` endpoint, ...). Must precede any send or receive.
    fn connect(&self, descriptor: &str) -> Result<(), ModemError>;

    /// Start delivering inbound packets to listeners.
    fn start_receive(&self) -> Result<(), ModemError>;

    /// Transmit one packet. Fails with [`ModemError::NotConnected`] before
    /// `connect`.
    async fn send(&self, packet: Packet) -> Result<(), ModemError>;

    /// Register a listener on the inbound packet stream. Dropping the stream
    /// releases the slot.
    fn listen(&self) -> Result<RxStream, ModemError>;
}
