//! Test doubles shared by the engine tests.

use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};

use uuid::Uuid;

use crate::{
   event::{EventBus, PeripheralEvent},
   gatt::types::{AttResult, RequestToken, SubscriberId},
   peripheral::transport::{Packet, Transport},
};

/// A delivered value push.
#[derive(Debug, Clone)]
pub(crate) struct PushRecord {
   pub characteristic: Uuid,
   pub value: Packet,
   pub subscribers: Vec<SubscriberId>,
}

/// A reply sent back for a read or write request.
#[derive(Debug, Clone)]
pub(crate) struct ReplyRecord {
   pub token: RequestToken,
   pub result: AttResult,
   pub value: Option<Packet>,
}

/// Transport double recording delivered pushes and request replies.
///
/// The accept budget steers push outcomes: negative accepts everything,
/// zero rejects, a positive count accepts that many pushes and then
/// starts rejecting.
pub(crate) struct TestTransport {
   accept_budget: AtomicI64,
   attempts: AtomicUsize,
   pushes: parking_lot::Mutex<Vec<PushRecord>>,
   replies: parking_lot::Mutex<Vec<ReplyRecord>>,
}

impl TestTransport {
   pub fn new() -> Self {
      Self {
         accept_budget: AtomicI64::new(-1),
         attempts: AtomicUsize::new(0),
         pushes: parking_lot::Mutex::new(Vec::new()),
         replies: parking_lot::Mutex::new(Vec::new()),
      }
   }

   /// Accept or reject every push from now on.
   pub fn set_accepting(&self, accepting: bool) {
      self
         .accept_budget
         .store(if accepting { -1 } else { 0 }, Ordering::SeqCst);
   }

   /// Accept exactly `n` more pushes, then start rejecting.
   pub fn accept_next(&self, n: i64) {
      self.accept_budget.store(n, Ordering::SeqCst);
   }

   /// Push attempts, including rejected ones.
   pub fn attempt_count(&self) -> usize {
      self.attempts.load(Ordering::SeqCst)
   }

   pub fn pushes(&self) -> Vec<PushRecord> {
      self.pushes.lock().clone()
   }

   pub fn push_count(&self) -> usize {
      self.pushes.lock().len()
   }

   pub fn last_push(&self) -> Option<PushRecord> {
      self.pushes.lock().last().cloned()
   }

   /// Delivered payloads in push order.
   pub fn pushed_values(&self) -> Vec<Packet> {
      self.pushes.lock().iter().map(|p| p.value.clone()).collect()
   }

   pub fn replies(&self) -> Vec<ReplyRecord> {
      self.replies.lock().clone()
   }

   pub fn reply_for(&self, token: RequestToken) -> Option<ReplyRecord> {
      self.replies.lock().iter().find(|r| r.token == token).cloned()
   }
}

impl Transport for TestTransport {
   fn push_value(&self, characteristic: Uuid, value: &[u8], subscribers: &[SubscriberId]) -> bool {
      self.attempts.fetch_add(1, Ordering::SeqCst);
      let budget = self.accept_budget.load(Ordering::SeqCst);
      if budget == 0 {
         return false;
      }
      if budget > 0 {
         self.accept_budget.fetch_sub(1, Ordering::SeqCst);
      }
      self.pushes.lock().push(PushRecord {
         characteristic,
         value: Packet::from_slice(value),
         subscribers: subscribers.to_vec(),
      });
      true
   }

   fn respond(&self, token: RequestToken, result: AttResult, value: Option<&[u8]>) {
      self.replies.lock().push(ReplyRecord {
         token,
         result,
         value: value.map(Packet::from_slice),
      });
   }
}

/// Event bus double collecting everything emitted.
#[derive(Default)]
pub(crate) struct CollectingBus {
   events: parking_lot::Mutex<Vec<PeripheralEvent>>,
}

impl CollectingBus {
   pub fn events(&self) -> Vec<PeripheralEvent> {
      self.events.lock().clone()
   }

   pub fn contains(&self, pred: impl Fn(&PeripheralEvent) -> bool) -> bool {
      self.events.lock().iter().any(|e| pred(e))
   }
}

impl EventBus for CollectingBus {
   fn emit(&self, event: PeripheralEvent) {
      self.events.lock().push(event);
   }
}
