//! Transport seam between the GATT engine and the host stack.
//!
//! This module defines the outbound interface the engine drives (value
//! pushes and request replies) plus an in-process channel transport used
//! by the demo binary and tests.

use std::sync::Arc;

use log::{debug, warn};
use smallvec::SmallVec;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::gatt::types::{AttResult, RequestToken, SubscriberId};

pub type Packet = SmallVec<[u8; 32]>;

/// Outbound side of a host stack.
///
/// Both calls must return without blocking and without calling back into
/// the engine; a stack that needs to do work on its own schedule should
/// queue internally. `push_value` reports whether the stack accepted the
/// update. After a rejection the stack is expected to deliver a
/// ready-to-resume event once its transmit queue has room again.
pub trait Transport: Send + Sync {
   fn push_value(&self, characteristic: Uuid, value: &[u8], subscribers: &[SubscriberId]) -> bool;

   fn respond(&self, token: RequestToken, result: AttResult, value: Option<&[u8]>);
}

pub type TransportHandle = Arc<dyn Transport>;

/// A value update pushed towards subscribed centrals.
#[derive(Debug, Clone)]
pub struct Notification {
   pub characteristic: Uuid,
   pub value: Packet,
   pub subscribers: Vec<SubscriberId>,
}

/// A reply to a previously delivered read or write request.
#[derive(Debug, Clone)]
pub struct Reply {
   pub token: RequestToken,
   pub result: AttResult,
   pub value: Option<Packet>,
}

/// In-process transport backed by bounded channels.
///
/// A push succeeds while the notification queue has room; a full queue
/// counts as a rejection, which is the same backpressure contract a real
/// host stack exposes. The consumer decides when to signal resume.
pub struct ChannelTransport {
   notify_tx: mpsc::Sender<Notification>,
   reply_tx: mpsc::Sender<Reply>,
}

impl ChannelTransport {
   pub fn new(capacity: usize) -> (Arc<Self>, mpsc::Receiver<Notification>, mpsc::Receiver<Reply>) {
      let (notify_tx, notify_rx) = mpsc::channel(capacity);
      let (reply_tx, reply_rx) = mpsc::channel(capacity);
      (Arc::new(Self { notify_tx, reply_tx }), notify_rx, reply_rx)
   }
}

impl Transport for ChannelTransport {
   fn push_value(&self, characteristic: Uuid, value: &[u8], subscribers: &[SubscriberId]) -> bool {
      let notification = Notification {
         characteristic,
         value: Packet::from_slice(value),
         subscribers: subscribers.to_vec(),
      };
      match self.notify_tx.try_send(notification) {
         Ok(()) => {
            debug!("→ {characteristic}: {}", hex::encode(value));
            true
         },
         Err(mpsc::error::TrySendError::Full(_)) => {
            debug!("→ {characteristic}: notify queue full, push rejected");
            false
         },
         Err(mpsc::error::TrySendError::Closed(_)) => {
            warn!("→ {characteristic}: transport closed, push rejected");
            false
         },
      }
   }

   fn respond(&self, token: RequestToken, result: AttResult, value: Option<&[u8]>) {
      let reply = Reply {
         token,
         result,
         value: value.map(Packet::from_slice),
      };
      if let Err(e) = self.reply_tx.try_send(reply) {
         // Replies carry ATT results; dropping one leaves the central hanging
         // until its own timeout fires.
         warn!("→ reply {token} ({result}) dropped: {e}");
      } else {
         debug!("→ reply {token}: {result}");
      }
   }
}

#[cfg(test)]
mod tests {
   use super::*;

   #[test]
   fn test_push_reports_backpressure_when_full() {
      let (transport, mut notify_rx, _reply_rx) = ChannelTransport::new(1);
      let chr = Uuid::new_v4();
      let central = Uuid::new_v4();

      assert!(transport.push_value(chr, &[0xAA], &[central]));
      assert!(!transport.push_value(chr, &[0xBB], &[central]));

      let pushed = notify_rx.try_recv().unwrap();
      assert_eq!(pushed.characteristic, chr);
      assert_eq!(pushed.value.as_slice(), &[0xAA]);
      assert_eq!(pushed.subscribers, vec![central]);

      // Queue drained, pushes are accepted again.
      assert!(transport.push_value(chr, &[0xBB], &[central]));
   }

   #[test]
   fn test_respond_delivers_reply_with_payload() {
      let (transport, _notify_rx, mut reply_rx) = ChannelTransport::new(4);
      let token = RequestToken::from_raw(7);

      transport.respond(token, AttResult::Success, Some(&[1, 2, 3]));
      transport.respond(token, AttResult::RequestNotSupported, None);

      let first = reply_rx.try_recv().unwrap();
      assert_eq!(first.token, token);
      assert_eq!(first.result, AttResult::Success);
      assert_eq!(first.value.as_deref(), Some(&[1, 2, 3][..]));

      let second = reply_rx.try_recv().unwrap();
      assert_eq!(second.result, AttResult::RequestNotSupported);
      assert!(second.value.is_none());
   }
}
