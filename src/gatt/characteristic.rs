//! Mutable characteristic hosting and update flow control.
//!
//! This module provides the core `Characteristic` type which represents a
//! locally-hosted GATT characteristic, tracks its subscribed centrals, and
//! queues value updates against the transport's backpressure signal.

use core::fmt;
use std::{
   collections::{HashMap, VecDeque},
   pin::Pin,
   sync::Arc,
   task::{Context, Poll},
};

use futures::Stream;
use log::debug;
use serde_json::json;
use smol_str::SmolStr;
use tokio::sync::{mpsc, oneshot};
use uuid::Uuid;

use crate::{
   error::{GattError, Result},
   gatt::types::{
      AttResult, GattRequest, MAX_VALUE_LEN, Props, RequestKind, Subscriber, SubscriberId,
   },
   peripheral::{manager::Command, transport::Packet},
};

/// Sender half of an active request stream registration.
pub(crate) type RequestSink = mpsc::Sender<Result<GattRequest>>;

/// Disposition of a single update submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateOutcome {
   /// The transport accepted an immediate push.
   Pushed,
   /// Queued: nobody is subscribed.
   NoSubscribers,
   /// Queued behind an existing backlog.
   BehindBacklog,
   /// Queued: the transport rejected the push.
   Rejected,
}

impl UpdateOutcome {
   pub const fn was_pushed(self) -> bool {
      matches!(self, Self::Pushed)
   }
}

/// Mutable engine state of a characteristic.
///
/// Everything that must stay coherent across a single update or drain step
/// lives under one lock; mutation happens only on the owning peripheral's
/// actor (or locally while detached, when no subscriber can exist).
#[derive(Default)]
struct CharState {
   value: Option<Packet>,
   is_updating: bool,
   pending: VecDeque<Packet>,
   subscribers: HashMap<SubscriberId, Subscriber>,
   write_sink: Option<RequestSink>,
   read_sink: Option<RequestSink>,
}

impl CharState {
   fn sink_slot(&mut self, kind: RequestKind) -> &mut Option<RequestSink> {
      match kind {
         RequestKind::Read => &mut self.read_sink,
         RequestKind::Write => &mut self.write_sink,
      }
   }

   fn subscriber_ids(&self) -> Vec<SubscriberId> {
      self.subscribers.keys().copied().collect()
   }
}

/// Internal shared state for a hosted characteristic.
struct CharacteristicInner {
   uuid: Uuid,
   name: SmolStr,
   props: Props,
   state: parking_lot::Mutex<CharState>,
   link: parking_lot::Mutex<Option<mpsc::Sender<Command>>>,
}

/// A locally-hosted GATT characteristic.
///
/// This type is cheaply cloneable and thread-safe. Getters are synchronous
/// snapshots; mutation is serialized through the owning peripheral once the
/// characteristic's service has been added.
#[derive(Clone)]
pub struct Characteristic(Arc<CharacteristicInner>);

impl fmt::Debug for Characteristic {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      f.debug_struct("Characteristic")
         .field("uuid", &self.0.uuid)
         .field("name", &self.0.name)
         .field("props", &self.0.props)
         .finish()
   }
}

impl Characteristic {
   /// Creates a new characteristic with an optional initial value.
   pub fn new(
      uuid: Uuid,
      name: impl Into<SmolStr>,
      props: Props,
      initial_value: impl Into<Option<Packet>>,
   ) -> Self {
      Self(Arc::new(CharacteristicInner {
         uuid,
         name: name.into(),
         props,
         state: parking_lot::Mutex::new(CharState {
            value: initial_value.into(),
            ..Default::default()
         }),
         link: parking_lot::Mutex::new(None),
      }))
   }

   /// Gets the UUID of the characteristic.
   pub fn uuid(&self) -> Uuid {
      self.0.uuid
   }

   /// Gets the name of the characteristic.
   pub fn name(&self) -> &str {
      &self.0.name
   }

   /// Gets the declared property flags.
   pub fn props(&self) -> Props {
      self.0.props
   }

   /// Gets the current cached value.
   pub fn value(&self) -> Option<Packet> {
      self.0.state.lock().value.clone()
   }

   /// Whether the last push attempt to the transport was accepted.
   pub fn is_updating(&self) -> bool {
      self.0.state.lock().is_updating
   }

   /// Snapshot of the currently subscribed centrals.
   pub fn subscribers(&self) -> Vec<Subscriber> {
      self.0.state.lock().subscribers.values().copied().collect()
   }

   pub fn has_subscribers(&self) -> bool {
      !self.0.state.lock().subscribers.is_empty()
   }

   /// Snapshot of the undelivered update backlog, oldest first.
   pub fn pending_updates(&self) -> Vec<Packet> {
      self.0.state.lock().pending.iter().cloned().collect()
   }

   pub fn pending_count(&self) -> usize {
      self.0.state.lock().pending.len()
   }

   /// Largest update payload every current subscriber can receive.
   pub fn max_update_len(&self) -> Option<usize> {
      let st = self.0.state.lock();
      st.subscribers.values().map(|s| s.max_update_len).min()
   }

   /// Overwrites the cached value without pushing or queueing anything.
   pub fn set_value(&self, value: &[u8]) -> Result<()> {
      check_len(value)?;
      self.0.state.lock().value = Some(Packet::from_slice(value));
      Ok(())
   }

   /// Converts the characteristic state to a JSON representation.
   pub fn to_json(&self) -> serde_json::Value {
      let st = self.0.state.lock();
      json!({
          "uuid": self.0.uuid.to_string(),
          "name": self.0.name.as_str(),
          "props": self.0.props.to_string(),
          "value": st.value.as_deref().map(hex::encode),
          "is_updating": st.is_updating,
          "subscribers": st.subscribers.values().collect::<Vec<_>>(),
          "pending": st.pending.len(),
      })
   }

   // === Update API ===

   /// Submits a new value for delivery to subscribers.
   ///
   /// The cached value is overwritten immediately. Returns `Ok(true)` when
   /// the transport accepted an immediate push, `Ok(false)` when the update
   /// was queued behind backpressure or the absence of subscribers.
   pub async fn update_value(&self, value: &[u8]) -> Result<bool> {
      check_len(value)?;
      let packet = Packet::from_slice(value);
      let Some(link) = self.link() else {
         // Not attached yet; nobody can be subscribed, so the update is
         // cached and queued for the first subscriber.
         return Ok(self.queue_detached(packet));
      };
      let (tx, rx) = oneshot::channel();
      link
         .send(Command::UpdateValue {
            characteristic: self.clone(),
            value: packet,
            then: tx,
         })
         .await
         .map_err(|_| GattError::ManagerShutdown)?;
      rx.await.map_err(|_| GattError::ManagerShutdown)?
   }

   // === Request handling API ===

   /// Registers a live stream of inbound write requests.
   ///
   /// At most one stream per direction is active; a previously active one
   /// observes a terminal `ResponderReplaced` error before this one takes
   /// effect.
   pub async fn start_responding_to_write_requests(&self) -> Result<RequestStream> {
      self.start_responding(RequestKind::Write).await
   }

   /// Deactivates the write stream; later writes answer `RequestNotSupported`.
   pub async fn stop_responding_to_write_requests(&self) -> Result<()> {
      self.stop_responding(RequestKind::Write).await
   }

   /// Registers a live stream of inbound read requests.
   ///
   /// Without one, reads are answered synchronously from the cached value.
   pub async fn start_responding_to_read_requests(&self) -> Result<RequestStream> {
      self.start_responding(RequestKind::Read).await
   }

   /// Deactivates the read stream; later reads answer from the cached value.
   pub async fn stop_responding_to_read_requests(&self) -> Result<()> {
      self.stop_responding(RequestKind::Read).await
   }

   /// Delivers the result code for a dispatched request.
   ///
   /// Valid exactly once per request, even after the stream that carried it
   /// was stopped. Fails with `InvalidRequestState` on a second call or an
   /// unknown token.
   pub async fn respond(&self, request: &GattRequest, result: AttResult) -> Result<()> {
      self.send_response(request, result, None).await
   }

   /// Like [`respond`](Self::respond), carrying the answer bytes for a read.
   pub async fn respond_with_value(
      &self,
      request: &GattRequest,
      result: AttResult,
      value: &[u8],
   ) -> Result<()> {
      self.send_response(request, result, Some(Packet::from_slice(value))).await
   }

   async fn start_responding(&self, kind: RequestKind) -> Result<RequestStream> {
      let link = self.link().ok_or(GattError::NotAttached(self.0.uuid))?;
      let (tx, rx) = oneshot::channel();
      link
         .send(Command::StartResponding {
            characteristic: self.clone(),
            kind,
            then: tx,
         })
         .await
         .map_err(|_| GattError::ManagerShutdown)?;
      rx.await.map_err(|_| GattError::ManagerShutdown)?
   }

   async fn stop_responding(&self, kind: RequestKind) -> Result<()> {
      let link = self.link().ok_or(GattError::NotAttached(self.0.uuid))?;
      let (tx, rx) = oneshot::channel();
      link
         .send(Command::StopResponding {
            characteristic: self.clone(),
            kind,
            then: tx,
         })
         .await
         .map_err(|_| GattError::ManagerShutdown)?;
      rx.await.map_err(|_| GattError::ManagerShutdown)
   }

   async fn send_response(
      &self,
      request: &GattRequest,
      result: AttResult,
      value: Option<Packet>,
   ) -> Result<()> {
      let link = self.link().ok_or(GattError::NotAttached(self.0.uuid))?;
      let (tx, rx) = oneshot::channel();
      link
         .send(Command::Respond {
            token: request.token,
            result,
            value,
            then: tx,
         })
         .await
         .map_err(|_| GattError::ManagerShutdown)?;
      rx.await.map_err(|_| GattError::ManagerShutdown)?
   }

   // === Engine transitions (serialized by the owning actor) ===

   /// Runs the update algorithm against the given transport push.
   ///
   /// The cached value is overwritten first, unconditionally. With no
   /// subscribers, or with a backlog already queued while not updating, the
   /// value queues; the push closure is invoked at most once and never ahead
   /// of queued entries.
   pub(crate) fn apply_update(
      &self,
      value: Packet,
      push: impl FnOnce(&Packet, &[SubscriberId]) -> bool,
   ) -> UpdateOutcome {
      let mut st = self.0.state.lock();
      st.value = Some(value.clone());
      if st.subscribers.is_empty() {
         st.pending.push_back(value);
         st.is_updating = false;
         debug!("{}: no subscribers, queued update ({} pending)", self.0.uuid, st.pending.len());
         return UpdateOutcome::NoSubscribers;
      }
      if !st.is_updating && !st.pending.is_empty() {
         // Backlog goes first; never push a newer value out of order.
         st.pending.push_back(value);
         debug!("{}: backlog present, queued update ({} pending)", self.0.uuid, st.pending.len());
         return UpdateOutcome::BehindBacklog;
      }
      let ids = st.subscriber_ids();
      if push(&value, &ids) {
         st.is_updating = true;
         UpdateOutcome::Pushed
      } else {
         st.is_updating = false;
         st.pending.push_back(value);
         debug!("{}: push rejected, queued update ({} pending)", self.0.uuid, st.pending.len());
         UpdateOutcome::Rejected
      }
   }

   /// Replays queued updates in FIFO order, stopping at the first rejection.
   ///
   /// Returns how many entries were flushed and whether the queue fully
   /// drained. A no-op without subscribers.
   pub(crate) fn resume(
      &self,
      mut push: impl FnMut(&Packet, &[SubscriberId]) -> bool,
   ) -> (usize, bool) {
      let mut st = self.0.state.lock();
      if st.subscribers.is_empty() {
         return (0, false);
      }
      st.is_updating = true;
      let mut flushed = 0;
      while let Some(head) = st.pending.front() {
         let ids = st.subscriber_ids();
         if push(head, &ids) {
            st.pending.pop_front();
            flushed += 1;
         } else {
            // Rejected entry stays at the head for the next resume.
            st.is_updating = false;
            debug!("{}: drain stalled with {} pending", self.0.uuid, st.pending.len());
            return (flushed, false);
         }
      }
      (flushed, true)
   }

   /// Records a subscriber; returns true on the zero-to-positive transition.
   pub(crate) fn add_subscriber(&self, subscriber: Subscriber) -> bool {
      let mut st = self.0.state.lock();
      let was_empty = st.subscribers.is_empty();
      st.subscribers.insert(subscriber.id, subscriber);
      was_empty
   }

   /// Removes a subscriber if present. The last removal forces
   /// `is_updating` off; the backlog stays queued for a future subscriber.
   pub(crate) fn remove_subscriber(&self, id: SubscriberId) -> Option<Subscriber> {
      let mut st = self.0.state.lock();
      let removed = st.subscribers.remove(&id);
      if removed.is_some() && st.subscribers.is_empty() {
         st.is_updating = false;
      }
      removed
   }

   /// Installs a fresh request stream for one direction, failing any active
   /// one in-band before it is dropped.
   pub(crate) fn start_stream(&self, kind: RequestKind, capacity: usize) -> RequestStream {
      let (tx, rx) = mpsc::channel(capacity);
      let mut st = self.0.state.lock();
      if let Some(old) = st.sink_slot(kind).replace(tx) {
         // A full buffer drops the notice; the handle still ends once drained.
         let _ = old.try_send(Err(GattError::ResponderReplaced));
      }
      RequestStream { rx }
   }

   /// Clears the stream registration for one direction.
   pub(crate) fn stop_stream(&self, kind: RequestKind) -> bool {
      self.0.state.lock().sink_slot(kind).take().is_some()
   }

   /// Current sink for a direction, pruning one whose receiver was dropped.
   pub(crate) fn live_sink(&self, kind: RequestKind) -> Option<RequestSink> {
      let mut st = self.0.state.lock();
      let slot = st.sink_slot(kind);
      if slot.as_ref().is_some_and(mpsc::Sender::is_closed) {
         *slot = None;
      }
      slot.clone()
   }

   /// Drops all subscribers, e.g. on transport teardown.
   pub(crate) fn reset_subscriptions(&self) {
      let mut st = self.0.state.lock();
      st.subscribers.clear();
      st.is_updating = false;
   }

   pub(crate) fn attach(&self, tx: mpsc::Sender<Command>) {
      *self.0.link.lock() = Some(tx);
   }

   /// Severs the peripheral link: subscribers are dropped and both request
   /// streams observe a terminal error. Value and backlog are preserved.
   pub(crate) fn detach(&self) {
      *self.0.link.lock() = None;
      let mut st = self.0.state.lock();
      st.subscribers.clear();
      st.is_updating = false;
      for kind in [RequestKind::Write, RequestKind::Read] {
         if let Some(sink) = st.sink_slot(kind).take() {
            let _ = sink.try_send(Err(GattError::ResponderStopped));
         }
      }
   }

   pub(crate) fn is_attached(&self) -> bool {
      self.0.link.lock().is_some()
   }

   fn link(&self) -> Option<mpsc::Sender<Command>> {
      self.0.link.lock().clone()
   }

   pub(crate) fn queue_detached(&self, value: Packet) -> bool {
      let mut st = self.0.state.lock();
      st.value = Some(value.clone());
      st.pending.push_back(value);
      st.is_updating = false;
      false
   }
}

fn check_len(value: &[u8]) -> Result<()> {
   if value.len() > MAX_VALUE_LEN {
      return Err(GattError::ValueTooLarge {
         len: value.len(),
         max: MAX_VALUE_LEN,
      });
   }
   Ok(())
}

/// Live stream of inbound requests for one direction of a characteristic.
///
/// Ends with `ResponderReplaced` when a newer registration displaces it and
/// `ResponderStopped` after an explicit stop or detach. A displaced stream
/// whose buffer was full keeps its backlog and ends with `ResponderStopped`
/// once drained.
#[derive(Debug)]
pub struct RequestStream {
   rx: mpsc::Receiver<Result<GattRequest>>,
}

impl RequestStream {
   /// Receives the next inbound request.
   pub async fn recv(&mut self) -> Result<GattRequest> {
      match self.rx.recv().await {
         Some(item) => item,
         None => Err(GattError::ResponderStopped),
      }
   }
}

impl Stream for RequestStream {
   type Item = Result<GattRequest>;

   fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
      self.rx.poll_recv(cx)
   }
}

#[cfg(test)]
mod tests {
   use std::cell::Cell;

   use super::*;
   use crate::gatt::types::RequestToken;

   fn pkt(data: &[u8]) -> Packet {
      Packet::from_slice(data)
   }

   fn notify_char() -> Characteristic {
      Characteristic::new(
         Uuid::new_v4(),
         "test",
         Props::new(Props::READ | Props::WRITE | Props::NOTIFY),
         None,
      )
   }

   fn sub(n: u128) -> Subscriber {
      Subscriber::new(Uuid::from_u128(n), 23)
   }

   fn write_req(n: u64) -> GattRequest {
      GattRequest {
         token: RequestToken::from_raw(n),
         kind: RequestKind::Write,
         characteristic: Uuid::from_u128(7),
         subscriber: Uuid::from_u128(1),
         offset: 0,
         value: Some(pkt(&[n as u8])),
      }
   }

   #[test]
   fn test_update_with_no_subscribers_queues() {
      let ch = notify_char();
      let pushes = Cell::new(0);
      let outcome = ch.apply_update(pkt(&[0xAA]), |_, _| {
         pushes.set(pushes.get() + 1);
         true
      });

      assert_eq!(outcome, UpdateOutcome::NoSubscribers);
      assert_eq!(pushes.get(), 0, "no transport call with zero subscribers");
      assert_eq!(ch.value(), Some(pkt(&[0xAA])));
      assert_eq!(ch.pending_count(), 1);
      assert!(!ch.is_updating());
   }

   #[test]
   fn test_value_overwritten_eagerly() {
      let ch = notify_char();
      ch.apply_update(pkt(&[0x01]), |_, _| false);
      ch.apply_update(pkt(&[0x02]), |_, _| false);

      // Cached value tracks the newest submission even while queued.
      assert_eq!(ch.value(), Some(pkt(&[0x02])));
      assert_eq!(ch.pending_updates(), vec![pkt(&[0x01]), pkt(&[0x02])]);
   }

   #[test]
   fn test_queued_updates_drain_in_order() {
      let ch = notify_char();
      for v in [0xAA, 0xBB, 0xCC] {
         ch.apply_update(pkt(&[v]), |_, _| unreachable!());
      }
      assert!(ch.add_subscriber(sub(1)));

      let order = std::cell::RefCell::new(Vec::new());
      let (flushed, drained) = ch.resume(|value, _| {
         order.borrow_mut().push(value.clone());
         true
      });

      assert_eq!(flushed, 3);
      assert!(drained);
      assert_eq!(*order.borrow(), vec![pkt(&[0xAA]), pkt(&[0xBB]), pkt(&[0xCC])]);
      assert_eq!(ch.pending_count(), 0);
      assert!(ch.is_updating());
   }

   #[test]
   fn test_resume_stops_at_first_rejection() {
      let ch = notify_char();
      for v in [0x01, 0x02, 0x03] {
         ch.apply_update(pkt(&[v]), |_, _| unreachable!());
      }
      ch.add_subscriber(sub(1));

      let budget = Cell::new(1u32);
      let (flushed, drained) = ch.resume(|_, _| {
         let left = budget.get();
         budget.set(left.saturating_sub(1));
         left > 0
      });

      assert_eq!(flushed, 1);
      assert!(!drained);
      assert!(!ch.is_updating());
      // Rejected entry stays at the head.
      assert_eq!(ch.pending_updates(), vec![pkt(&[0x02]), pkt(&[0x03])]);
   }

   #[test]
   fn test_rejected_push_blocks_later_direct_pushes() {
      let ch = notify_char();
      ch.add_subscriber(sub(1));

      assert_eq!(ch.apply_update(pkt(&[0xBB]), |_, _| false), UpdateOutcome::Rejected);
      assert!(!ch.is_updating());
      assert_eq!(ch.pending_count(), 1);

      // Queue is non-empty and not updating: must queue without any push.
      assert_eq!(
         ch.apply_update(pkt(&[0xCC]), |_, _| unreachable!()),
         UpdateOutcome::BehindBacklog
      );
      assert_eq!(ch.pending_updates(), vec![pkt(&[0xBB]), pkt(&[0xCC])]);
      assert_eq!(ch.value(), Some(pkt(&[0xCC])));
   }

   #[test]
   fn test_accepted_push_skips_queue() {
      let ch = notify_char();
      ch.add_subscriber(sub(1));

      let seen = std::cell::RefCell::new(Vec::new());
      let outcome = ch.apply_update(pkt(&[0xAA]), |value, ids| {
         seen.borrow_mut().push((value.clone(), ids.to_vec()));
         true
      });

      assert_eq!(outcome, UpdateOutcome::Pushed);
      assert!(ch.is_updating());
      assert_eq!(ch.pending_count(), 0);
      assert_eq!(seen.borrow().len(), 1);
      assert_eq!(seen.borrow()[0].1, vec![Uuid::from_u128(1)]);
   }

   #[test]
   fn test_subscribe_is_idempotent() {
      let ch = notify_char();
      assert!(ch.add_subscriber(sub(1)));
      assert!(!ch.add_subscriber(sub(1)));
      assert_eq!(ch.subscribers().len(), 1);
   }

   #[test]
   fn test_remove_unknown_subscriber_is_noop() {
      let ch = notify_char();
      ch.add_subscriber(sub(1));
      assert!(ch.remove_subscriber(Uuid::from_u128(9)).is_none());
      assert_eq!(ch.subscribers().len(), 1);
   }

   #[test]
   fn test_last_unsubscribe_clears_updating_keeps_backlog() {
      let ch = notify_char();
      ch.add_subscriber(sub(1));
      ch.apply_update(pkt(&[0xAA]), |_, _| true);
      ch.apply_update(pkt(&[0xBB]), |_, _| false);
      assert_eq!(ch.pending_count(), 1);

      ch.remove_subscriber(Uuid::from_u128(1));
      assert!(!ch.is_updating());
      assert_eq!(ch.pending_count(), 1, "backlog survives for a future subscriber");
   }

   #[test]
   fn test_empty_drain_marks_ready() {
      let ch = notify_char();
      ch.add_subscriber(sub(1));
      let (flushed, drained) = ch.resume(|_, _| unreachable!());
      assert_eq!(flushed, 0);
      assert!(drained);
      assert!(ch.is_updating());
   }

   #[test]
   fn test_resume_without_subscribers_is_noop() {
      let ch = notify_char();
      ch.apply_update(pkt(&[0x01]), |_, _| unreachable!());
      let (flushed, drained) = ch.resume(|_, _| unreachable!());
      assert_eq!(flushed, 0);
      assert!(!drained);
      assert!(!ch.is_updating());
      assert_eq!(ch.pending_count(), 1);
   }

   #[test]
   fn test_max_update_len_is_smallest_declared() {
      let ch = notify_char();
      assert_eq!(ch.max_update_len(), None);
      ch.add_subscriber(Subscriber::new(Uuid::from_u128(1), 104));
      ch.add_subscriber(Subscriber::new(Uuid::from_u128(2), 23));
      assert_eq!(ch.max_update_len(), Some(23));
   }

   #[tokio::test]
   async fn test_detached_update_queues_locally() {
      let ch = notify_char();
      let pushed = ch.update_value(&[0x10]).await.unwrap();
      assert!(!pushed);
      assert_eq!(ch.value(), Some(pkt(&[0x10])));
      assert_eq!(ch.pending_count(), 1);
   }

   #[tokio::test]
   async fn test_oversized_value_is_rejected() {
      let ch = notify_char();
      let huge = vec![0u8; MAX_VALUE_LEN + 1];
      assert!(matches!(
         ch.update_value(&huge).await,
         Err(GattError::ValueTooLarge { len: 513, .. })
      ));
      assert!(ch.set_value(&huge).is_err());
      assert_eq!(ch.value(), None, "rejected values never reach the cache");
   }

   #[test]
   fn test_set_value_does_not_queue() {
      let ch = notify_char();
      ch.set_value(&[0x42]).unwrap();
      assert_eq!(ch.value(), Some(pkt(&[0x42])));
      assert_eq!(ch.pending_count(), 0);
   }

   #[tokio::test]
   async fn test_new_stream_fails_previous_one() {
      let ch = notify_char();
      let mut first = ch.start_stream(RequestKind::Write, 8);
      let _second = ch.start_stream(RequestKind::Write, 8);

      assert!(matches!(first.recv().await, Err(GattError::ResponderReplaced)));
      // The displaced sender is gone, so the stream then terminates.
      assert!(matches!(first.recv().await, Err(GattError::ResponderStopped)));
   }

   #[tokio::test]
   async fn test_stop_stream_terminates_handle() {
      let ch = notify_char();
      let mut stream = ch.start_stream(RequestKind::Read, 8);
      assert!(ch.stop_stream(RequestKind::Read));
      assert!(matches!(stream.recv().await, Err(GattError::ResponderStopped)));
      assert!(!ch.stop_stream(RequestKind::Read));
   }

   #[tokio::test]
   async fn test_displaced_stream_with_full_buffer_drains_then_stops() {
      let ch = notify_char();
      let mut first = ch.start_stream(RequestKind::Write, 1);
      let sink = ch.live_sink(RequestKind::Write).unwrap();
      sink.try_send(Ok(write_req(1))).unwrap();
      drop(sink);

      // No room for the in-band replacement notice: the backlog is still
      // delivered and the handle then terminates.
      let _second = ch.start_stream(RequestKind::Write, 1);
      let delivered = first.recv().await.unwrap();
      assert_eq!(delivered.token, RequestToken::from_raw(1));
      assert!(matches!(first.recv().await, Err(GattError::ResponderStopped)));
   }

   #[tokio::test]
   async fn test_stream_adapter_yields_requests_then_ends() {
      use futures::StreamExt;

      let ch = notify_char();
      let mut stream = ch.start_stream(RequestKind::Write, 8);
      let sink = ch.live_sink(RequestKind::Write).unwrap();
      sink.try_send(Ok(write_req(4))).unwrap();
      drop(sink);

      let item = stream.next().await.unwrap().unwrap();
      assert_eq!(item.token, RequestToken::from_raw(4));
      ch.stop_stream(RequestKind::Write);
      assert!(stream.next().await.is_none(), "closed channel ends the stream");
   }

   #[test]
   fn test_live_sink_prunes_dropped_receiver() {
      let ch = notify_char();
      let stream = ch.start_stream(RequestKind::Write, 8);
      assert!(ch.live_sink(RequestKind::Write).is_some());

      drop(stream);
      assert!(ch.live_sink(RequestKind::Write).is_none());
      assert!(!ch.stop_stream(RequestKind::Write), "stale slot was pruned");
   }

   #[test]
   fn test_detach_clears_subscribers_and_streams() {
      let ch = notify_char();
      ch.add_subscriber(sub(1));
      ch.apply_update(pkt(&[0x01]), |_, _| true);
      ch.apply_update(pkt(&[0x02]), |_, _| false);
      let _stream = ch.start_stream(RequestKind::Write, 8);

      ch.detach();
      assert!(ch.subscribers().is_empty());
      assert!(!ch.is_updating());
      assert_eq!(ch.pending_count(), 1, "value backlog is preserved");
      assert_eq!(ch.value(), Some(pkt(&[0x02])));
   }

   #[test]
   fn test_to_json_snapshot() {
      let ch = notify_char();
      ch.set_value(&[0xDE, 0xAD]).unwrap();
      ch.add_subscriber(sub(1));

      let snapshot = ch.to_json();
      assert_eq!(snapshot["value"], "dead");
      assert_eq!(snapshot["pending"], 0);
      assert_eq!(snapshot["is_updating"], false);
      assert_eq!(snapshot["subscribers"].as_array().unwrap().len(), 1);
   }
}
