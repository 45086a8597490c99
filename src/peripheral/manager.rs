//! Peripheral manager: the single actor serializing all GATT state.
//!
//! Every inbound transport event and every characteristic API call is
//! funneled through one command channel, so subscriber sets, update
//! queues and request tokens never race. The actor owns the service
//! table and drives the transport; characteristic handles talk to it
//! through the link installed when their service is added.

use std::collections::{HashMap, HashSet};

use log::{debug, info, warn};
use tokio::sync::{
   mpsc::{self, error::TrySendError},
   oneshot,
};
use uuid::Uuid;

use crate::{
   config::Config,
   error::{GattError, Result},
   event::{EventSender, PeripheralEvent},
   gatt::{
      characteristic::{Characteristic, RequestStream, UpdateOutcome},
      service::Service,
      types::{AttResult, GattRequest, RequestKind, RequestToken, Subscriber, SubscriberId},
   },
   peripheral::transport::{Packet, TransportHandle},
};

// === Commands ===

#[derive(Debug)]
pub(crate) enum Command {
   // Inbound transport events
   Subscribed {
      characteristic: Uuid,
      subscriber: Subscriber,
      then: oneshot::Sender<()>,
   },
   Unsubscribed {
      characteristic: Uuid,
      subscriber: SubscriberId,
      then: oneshot::Sender<()>,
   },
   WriteRequested {
      characteristic: Uuid,
      subscriber: SubscriberId,
      offset: usize,
      value: Packet,
      then: oneshot::Sender<RequestToken>,
   },
   ReadRequested {
      characteristic: Uuid,
      subscriber: SubscriberId,
      offset: usize,
      then: oneshot::Sender<RequestToken>,
   },
   ReadyToResume {
      then: oneshot::Sender<()>,
   },
   TransportReset {
      then: oneshot::Sender<()>,
   },

   // Characteristic handle calls
   UpdateValue {
      characteristic: Characteristic,
      value: Packet,
      then: oneshot::Sender<Result<bool>>,
   },
   StartResponding {
      characteristic: Characteristic,
      kind: RequestKind,
      then: oneshot::Sender<Result<RequestStream>>,
   },
   StopResponding {
      characteristic: Characteristic,
      kind: RequestKind,
      then: oneshot::Sender<()>,
   },
   Respond {
      token: RequestToken,
      result: AttResult,
      value: Option<Packet>,
      then: oneshot::Sender<Result<()>>,
   },

   // Service table
   AddService {
      service: Service,
      then: oneshot::Sender<Result<()>>,
   },
   RemoveService {
      uuid: Uuid,
      then: oneshot::Sender<Result<()>>,
   },
   RemoveAllServices {
      then: oneshot::Sender<()>,
   },
   GetService {
      uuid: Uuid,
      then: oneshot::Sender<Option<Service>>,
   },
   GetServices {
      then: oneshot::Sender<Vec<Service>>,
   },
   GetCharacteristic {
      uuid: Uuid,
      then: oneshot::Sender<Option<Characteristic>>,
   },
   Shutdown {
      then: oneshot::Sender<()>,
   },
}

/// Bookkeeping for a dispatched request awaiting its response.
struct PendingRequest {
   characteristic: Uuid,
   kind: RequestKind,
}

// === Peripheral Manager ===

/// Handle to the peripheral actor.
///
/// This type is cheaply cloneable. The host-stack adapter feeds inbound
/// events through the `subscribed`/`unsubscribed`/`*_requested`/
/// `ready_to_resume` methods; applications mostly hold `Characteristic`
/// handles instead and only touch the manager for service management.
#[derive(Debug, Clone)]
pub struct PeripheralManager {
   inbox: mpsc::Sender<Command>,
}

impl PeripheralManager {
   /// Spawns the manager actor on the current tokio runtime.
   pub fn new(transport: TransportHandle, events: EventSender, config: &Config) -> Self {
      let (command_tx, command_rx) = mpsc::channel(config.command_capacity);
      let actor = ManagerActor {
         transport,
         events,
         command_rx,
         link_tx: command_tx.clone(),
         request_capacity: config.request_stream_capacity,
         services: HashMap::new(),
         characteristics: HashMap::new(),
         pending: HashMap::new(),
         next_token: 0,
      };
      tokio::spawn(actor.run());
      Self { inbox: command_tx }
   }

   /// Publishes a service, attaching all of its characteristics.
   pub async fn add_service(&self, service: Service) -> Result<()> {
      let (tx, rx) = oneshot::channel();
      self
         .inbox
         .send(Command::AddService { service, then: tx })
         .await
         .map_err(|_| GattError::ManagerShutdown)?;
      rx.await.map_err(|_| GattError::ManagerShutdown)?
   }

   /// Removes a service; its characteristics detach and keep their state.
   pub async fn remove_service(&self, uuid: Uuid) -> Result<()> {
      let (tx, rx) = oneshot::channel();
      self
         .inbox
         .send(Command::RemoveService { uuid, then: tx })
         .await
         .map_err(|_| GattError::ManagerShutdown)?;
      rx.await.map_err(|_| GattError::ManagerShutdown)?
   }

   pub async fn remove_all_services(&self) -> Result<()> {
      let (tx, rx) = oneshot::channel();
      self
         .inbox
         .send(Command::RemoveAllServices { then: tx })
         .await
         .map_err(|_| GattError::ManagerShutdown)?;
      rx.await.map_err(|_| GattError::ManagerShutdown)
   }

   pub async fn service(&self, uuid: Uuid) -> Option<Service> {
      let (tx, rx) = oneshot::channel();
      if self
         .inbox
         .send(Command::GetService { uuid, then: tx })
         .await
         .is_err()
      {
         return None;
      }
      rx.await.ok().flatten()
   }

   pub async fn services(&self) -> Vec<Service> {
      let (tx, rx) = oneshot::channel();
      if self
         .inbox
         .send(Command::GetServices { then: tx })
         .await
         .is_err()
      {
         return Vec::new();
      }
      rx.await.unwrap_or_default()
   }

   /// Looks up a hosted characteristic across all services.
   pub async fn characteristic(&self, uuid: Uuid) -> Option<Characteristic> {
      let (tx, rx) = oneshot::channel();
      if self
         .inbox
         .send(Command::GetCharacteristic { uuid, then: tx })
         .await
         .is_err()
      {
         return None;
      }
      rx.await.ok().flatten()
   }

   /// A central subscribed to a characteristic's notifications.
   ///
   /// The first subscriber triggers a drain of any queued updates.
   pub async fn subscribed(&self, characteristic: Uuid, subscriber: Subscriber) -> Result<()> {
      let (tx, rx) = oneshot::channel();
      self
         .inbox
         .send(Command::Subscribed {
            characteristic,
            subscriber,
            then: tx,
         })
         .await
         .map_err(|_| GattError::ManagerShutdown)?;
      rx.await.map_err(|_| GattError::ManagerShutdown)
   }

   /// A central dropped its subscription.
   pub async fn unsubscribed(&self, characteristic: Uuid, subscriber: SubscriberId) -> Result<()> {
      let (tx, rx) = oneshot::channel();
      self
         .inbox
         .send(Command::Unsubscribed {
            characteristic,
            subscriber,
            then: tx,
         })
         .await
         .map_err(|_| GattError::ManagerShutdown)?;
      rx.await.map_err(|_| GattError::ManagerShutdown)
   }

   /// Inbound write request; returns the token the eventual response will
   /// carry. The request is dispatched (or refused) before this returns.
   pub async fn write_requested(
      &self,
      characteristic: Uuid,
      subscriber: SubscriberId,
      offset: usize,
      value: &[u8],
   ) -> Result<RequestToken> {
      let (tx, rx) = oneshot::channel();
      self
         .inbox
         .send(Command::WriteRequested {
            characteristic,
            subscriber,
            offset,
            value: Packet::from_slice(value),
            then: tx,
         })
         .await
         .map_err(|_| GattError::ManagerShutdown)?;
      rx.await.map_err(|_| GattError::ManagerShutdown)
   }

   /// Inbound read request; returns the token the eventual response will
   /// carry. Without a registered read responder the answer comes straight
   /// from the cached value.
   pub async fn read_requested(
      &self,
      characteristic: Uuid,
      subscriber: SubscriberId,
      offset: usize,
   ) -> Result<RequestToken> {
      let (tx, rx) = oneshot::channel();
      self
         .inbox
         .send(Command::ReadRequested {
            characteristic,
            subscriber,
            offset,
            then: tx,
         })
         .await
         .map_err(|_| GattError::ManagerShutdown)?;
      rx.await.map_err(|_| GattError::ManagerShutdown)
   }

   /// The transport's transmit queue has room again; queued updates drain.
   pub async fn ready_to_resume(&self) -> Result<()> {
      let (tx, rx) = oneshot::channel();
      self
         .inbox
         .send(Command::ReadyToResume { then: tx })
         .await
         .map_err(|_| GattError::ManagerShutdown)?;
      rx.await.map_err(|_| GattError::ManagerShutdown)
   }

   /// The link to the host stack dropped: all subscriptions and in-flight
   /// requests are void. Cached values and update backlogs survive.
   pub async fn transport_reset(&self) -> Result<()> {
      let (tx, rx) = oneshot::channel();
      self
         .inbox
         .send(Command::TransportReset { then: tx })
         .await
         .map_err(|_| GattError::ManagerShutdown)?;
      rx.await.map_err(|_| GattError::ManagerShutdown)
   }

   /// Stops the actor. All characteristics detach first, so their streams
   /// terminate and later updates queue locally.
   pub async fn shutdown(&self) {
      let (tx, rx) = oneshot::channel();
      if self
         .inbox
         .send(Command::Shutdown { then: tx })
         .await
         .is_ok()
      {
         let _ = rx.await;
      }
   }
}

// === Manager Actor ===

struct ManagerActor {
   transport: TransportHandle,
   events: EventSender,
   command_rx: mpsc::Receiver<Command>,
   link_tx: mpsc::Sender<Command>,
   request_capacity: usize,

   services: HashMap<Uuid, Service>,
   characteristics: HashMap<Uuid, Characteristic>,
   pending: HashMap<RequestToken, PendingRequest>,
   next_token: u64,
}

impl ManagerActor {
   async fn run(mut self) {
      info!("Peripheral manager started");
      while let Some(cmd) = self.command_rx.recv().await {
         if !self.handle_command(cmd) {
            break;
         }
      }
      self.cleanup();
      info!("Peripheral manager stopped");
   }

   fn handle_command(&mut self, cmd: Command) -> bool {
      match cmd {
         Command::Subscribed {
            characteristic,
            subscriber,
            then,
         } => {
            if let Some(chr) = self.characteristics.get(&characteristic) {
               let first = chr.add_subscriber(subscriber);
               debug!(
                  "{characteristic}: subscriber {} added (max update {})",
                  subscriber.id, subscriber.max_update_len
               );
               self.events.emit(PeripheralEvent::SubscriberAdded {
                  characteristic,
                  subscriber,
               });
               if first {
                  self.drain(chr);
               }
            } else {
               warn!("Subscribe for unknown characteristic {characteristic}");
            }
            let _ = then.send(());
         },
         Command::Unsubscribed {
            characteristic,
            subscriber,
            then,
         } => {
            if let Some(chr) = self.characteristics.get(&characteristic)
               && chr.remove_subscriber(subscriber).is_some()
            {
               debug!("{characteristic}: subscriber {subscriber} removed");
               self.events.emit(PeripheralEvent::SubscriberRemoved {
                  characteristic,
                  subscriber,
               });
            }
            let _ = then.send(());
         },
         Command::WriteRequested {
            characteristic,
            subscriber,
            offset,
            value,
            then,
         } => {
            let token = self.allocate_token();
            self.handle_request(RequestKind::Write, characteristic, subscriber, offset, Some(value), token);
            let _ = then.send(token);
         },
         Command::ReadRequested {
            characteristic,
            subscriber,
            offset,
            then,
         } => {
            let token = self.allocate_token();
            self.handle_request(RequestKind::Read, characteristic, subscriber, offset, None, token);
            let _ = then.send(token);
         },
         Command::ReadyToResume { then } => {
            debug!("Transport ready, draining update backlogs");
            for chr in self.characteristics.values() {
               self.drain(chr);
            }
            let _ = then.send(());
         },
         Command::TransportReset { then } => {
            info!(
               "Transport reset, dropping {} in-flight requests and all subscribers",
               self.pending.len()
            );
            self.pending.clear();
            for chr in self.characteristics.values() {
               chr.reset_subscriptions();
            }
            self.events.emit(PeripheralEvent::TransportReset);
            let _ = then.send(());
         },
         Command::UpdateValue {
            characteristic,
            value,
            then,
         } => {
            let _ = then.send(Ok(self.push_update(&characteristic, value)));
         },
         Command::StartResponding {
            characteristic,
            kind,
            then,
         } => {
            let result = if self.characteristics.contains_key(&characteristic.uuid()) {
               debug!("{}: {kind} responder registered", characteristic.uuid());
               Ok(characteristic.start_stream(kind, self.request_capacity))
            } else {
               Err(GattError::NotAttached(characteristic.uuid()))
            };
            let _ = then.send(result);
         },
         Command::StopResponding {
            characteristic,
            kind,
            then,
         } => {
            if characteristic.stop_stream(kind) {
               debug!("{}: {kind} responder stopped", characteristic.uuid());
            }
            let _ = then.send(());
         },
         Command::Respond {
            token,
            result,
            value,
            then,
         } => {
            let _ = then.send(self.finish_request(token, result, value.as_deref()));
         },
         Command::AddService { service, then } => {
            let _ = then.send(self.add_service(service));
         },
         Command::RemoveService { uuid, then } => {
            let _ = then.send(self.remove_service(uuid));
         },
         Command::RemoveAllServices { then } => {
            let uuids: Vec<Uuid> = self.services.keys().copied().collect();
            for uuid in uuids {
               let _ = self.remove_service(uuid);
            }
            let _ = then.send(());
         },
         Command::GetService { uuid, then } => {
            let _ = then.send(self.services.get(&uuid).cloned());
         },
         Command::GetServices { then } => {
            let _ = then.send(self.services.values().cloned().collect());
         },
         Command::GetCharacteristic { uuid, then } => {
            let _ = then.send(self.characteristics.get(&uuid).cloned());
         },
         Command::Shutdown { then } => {
            self.cleanup();
            let _ = then.send(());
            return false;
         },
      }
      true
   }

   fn allocate_token(&mut self) -> RequestToken {
      self.next_token += 1;
      RequestToken::from_raw(self.next_token)
   }

   fn add_service(&mut self, service: Service) -> Result<()> {
      if self.services.contains_key(&service.uuid()) {
         return Err(GattError::ServiceAlreadyAdded(service.uuid()));
      }
      let mut seen = HashSet::new();
      for chr in service.characteristics() {
         if !seen.insert(chr.uuid())
            || self.characteristics.contains_key(&chr.uuid())
            || chr.is_attached()
         {
            return Err(GattError::DuplicateCharacteristic(chr.uuid()));
         }
      }
      for chr in service.characteristics() {
         chr.attach(self.link_tx.clone());
         self.characteristics.insert(chr.uuid(), chr.clone());
      }
      info!(
         "Added service {} ({}) with {} characteristics",
         service.uuid(),
         service.name(),
         service.characteristics().len()
      );
      self.events.emit(PeripheralEvent::ServiceAdded(service.uuid()));
      self.services.insert(service.uuid(), service);
      Ok(())
   }

   fn remove_service(&mut self, uuid: Uuid) -> Result<()> {
      let Some(service) = self.services.remove(&uuid) else {
         return Err(GattError::ServiceNotFound(uuid));
      };
      for chr in service.characteristics() {
         self.characteristics.remove(&chr.uuid());
         chr.detach();
      }
      // In-flight requests against the removed characteristics can no
      // longer be answered by anyone; fail them towards the stack.
      let orphaned: Vec<RequestToken> = self
         .pending
         .iter()
         .filter(|(_, p)| service.characteristic(p.characteristic).is_some())
         .map(|(token, _)| *token)
         .collect();
      for token in orphaned {
         self.pending.remove(&token);
         self.transport.respond(token, AttResult::UnlikelyError, None);
      }
      info!("Removed service {uuid} ({})", service.name());
      self.events.emit(PeripheralEvent::ServiceRemoved(uuid));
      Ok(())
   }

   fn push_update(&self, chr: &Characteristic, value: Packet) -> bool {
      if !self.characteristics.contains_key(&chr.uuid()) {
         // The handle raced a service removal; behave as if detached.
         return chr.queue_detached(value);
      }
      let uuid = chr.uuid();
      let transport = &self.transport;
      let outcome = chr.apply_update(value, |value, ids| transport.push_value(uuid, value, ids));
      if outcome == UpdateOutcome::Rejected {
         warn!("{uuid}: push rejected by transport, updates stalled");
         self.events.emit(PeripheralEvent::UpdatesStalled {
            characteristic: uuid,
            queued: chr.pending_count(),
         });
      }
      outcome.was_pushed()
   }

   /// Replays a characteristic's backlog while the transport accepts.
   fn drain(&self, chr: &Characteristic) {
      let uuid = chr.uuid();
      let transport = &self.transport;
      let (flushed, drained) = chr.resume(|value, ids| transport.push_value(uuid, value, ids));
      if drained {
         if flushed > 0 {
            debug!("{uuid}: flushed {flushed} queued updates");
            self.events.emit(PeripheralEvent::UpdatesResumed {
               characteristic: uuid,
               flushed,
            });
         }
      } else if chr.has_subscribers() {
         debug!("{uuid}: drain stalled after {flushed} updates, {} left", chr.pending_count());
         self.events.emit(PeripheralEvent::UpdatesStalled {
            characteristic: uuid,
            queued: chr.pending_count(),
         });
      }
   }

   fn handle_request(
      &mut self,
      kind: RequestKind,
      uuid: Uuid,
      subscriber: SubscriberId,
      offset: usize,
      value: Option<Packet>,
      token: RequestToken,
   ) {
      let Some(chr) = self.characteristics.get(&uuid).cloned() else {
         warn!("{kind} request {token} for unknown characteristic {uuid}");
         self.transport.respond(token, AttResult::UnlikelyError, None);
         return;
      };
      let permitted = match kind {
         RequestKind::Read => chr.props().can_read(),
         RequestKind::Write => chr.props().can_write(),
      };
      if !permitted {
         let result = match kind {
            RequestKind::Read => AttResult::ReadNotPermitted,
            RequestKind::Write => AttResult::WriteNotPermitted,
         };
         debug!("{uuid}: {kind} request {token} not permitted by properties");
         self.transport.respond(token, result, None);
         return;
      }
      if let Some(sink) = chr.live_sink(kind) {
         let request = GattRequest {
            token,
            kind,
            characteristic: uuid,
            subscriber,
            offset,
            value,
         };
         match sink.try_send(Ok(request)) {
            Ok(()) => {
               self.pending.insert(token, PendingRequest { characteristic: uuid, kind });
               debug!("{uuid}: {kind} request {token} dispatched (offset {offset})");
               return;
            },
            Err(TrySendError::Full(_)) => {
               warn!("{uuid}: {kind} request stream full, {token} answered busy");
               self.transport.respond(token, AttResult::InsufficientResources, None);
               return;
            },
            Err(TrySendError::Closed(_)) => {
               // Receiver dropped without an explicit stop; clear the slot
               // and fall through to the unhandled path.
               chr.stop_stream(kind);
            },
         }
      }
      match kind {
         RequestKind::Read => self.answer_read(&chr, token, offset),
         RequestKind::Write => {
            debug!("{uuid}: no write responder, {token} answered not supported");
            self.transport.respond(token, AttResult::RequestNotSupported, None);
         },
      }
   }

   /// Answers a read straight from the cached value.
   fn answer_read(&self, chr: &Characteristic, token: RequestToken, offset: usize) {
      let value = chr.value().unwrap_or_default();
      if offset > value.len() {
         debug!(
            "{}: read {token} at offset {offset} beyond {} bytes",
            chr.uuid(),
            value.len()
         );
         self.transport.respond(token, AttResult::InvalidOffset, None);
      } else {
         self.transport.respond(token, AttResult::Success, Some(&value[offset..]));
      }
   }

   fn finish_request(
      &mut self,
      token: RequestToken,
      result: AttResult,
      value: Option<&[u8]>,
   ) -> Result<()> {
      let Some(pending) = self.pending.remove(&token) else {
         warn!("Response for unknown or already answered request {token}");
         return Err(GattError::InvalidRequestState);
      };
      debug!(
         "{}: {} request {token} answered {result}",
         pending.characteristic, pending.kind
      );
      self.transport.respond(token, result, value);
      Ok(())
   }

   fn cleanup(&mut self) {
      for (token, _) in self.pending.drain() {
         self.transport.respond(token, AttResult::UnlikelyError, None);
      }
      for chr in self.characteristics.values() {
         chr.detach();
      }
      self.characteristics.clear();
      self.services.clear();
   }
}
