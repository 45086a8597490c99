//! Event handling system for peripheral state changes.
//!
//! This module provides the event infrastructure for notifying about
//! engine activity such as subscriber churn, backpressure stalls, and
//! service registration.

use std::sync::Arc;

use uuid::Uuid;

use crate::gatt::types::{Subscriber, SubscriberId};

/// Events that can be emitted by the peripheral engine.
#[derive(Debug, Clone)]
pub enum PeripheralEvent {
   ServiceAdded(Uuid),
   ServiceRemoved(Uuid),
   SubscriberAdded { characteristic: Uuid, subscriber: Subscriber },
   SubscriberRemoved { characteristic: Uuid, subscriber: SubscriberId },
   /// A push was rejected by the transport; `queued` updates are backed up.
   UpdatesStalled { characteristic: Uuid, queued: usize },
   /// A drain flushed the whole backlog to the transport.
   UpdatesResumed { characteristic: Uuid, flushed: usize },
   TransportReset,
}

/// Trait for implementing event emission.
pub trait EventBus: Send + Sync {
   /// Emits an event to all registered listeners.
   fn emit(&self, event: PeripheralEvent);
}

/// Type alias for a thread-safe event sender.
pub type EventSender = Arc<dyn EventBus>;
