//! GATT peripheral-role hosting engine.
//!
//! This crate hosts mutable GATT characteristics on the peripheral side
//! of a BLE link: it tracks subscribed centrals, queues value updates
//! against transport backpressure, and correlates read/write requests
//! with their responses. The actual radio is abstracted behind the
//! [`Transport`] trait, so the engine runs against any host stack (or a
//! channel-backed one in tests and demos).
//!
//! All state transitions are serialized by a single manager actor;
//! [`Characteristic`] handles and the inbound-event methods on
//! [`PeripheralManager`] are safe to use from any task.

pub mod config;
pub mod error;
pub mod event;
pub mod gatt;
pub mod peripheral;

#[cfg(test)]
mod testutil;

pub use crate::{
   config::Config,
   error::{GattError, Result},
   event::{EventBus, EventSender, PeripheralEvent},
   gatt::{
      characteristic::{Characteristic, RequestStream, UpdateOutcome},
      service::Service,
      types::{
         AttResult, GattRequest, MAX_VALUE_LEN, Props, RequestKind, RequestToken, Subscriber,
         SubscriberId,
      },
   },
   peripheral::{
      manager::PeripheralManager,
      transport::{ChannelTransport, Notification, Packet, Reply, Transport, TransportHandle},
   },
};
