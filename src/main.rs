//! Demo GATT peripheral.
//!
//! Hosts a small environmental-sensing service over the in-process
//! channel transport and scripts a central against it: a producer task
//! streams telemetry updates, while the central consumes notifications
//! slowly enough to exercise backpressure, plus occasional reads and
//! writes.

use std::{sync::Arc, time::Duration};

use crossbeam::queue::SegQueue;
use log::{debug, info, warn};
use rand::Rng;
use tokio::{
   signal,
   sync::{Notify, mpsc},
   time,
};
use uuid::Uuid;

use gatthost::{
   AttResult, ChannelTransport, Characteristic, Config, EventBus, Notification, Packet,
   PeripheralEvent, PeripheralManager, Props, Reply, Result, Service, Subscriber,
};

/// Demo environmental sensing service
const SERVICE_UUID: Uuid = Uuid::from_u128(0x6e400001_b5a3_f393_e0a9_e50e24dcca9e);
/// Telemetry readings, notified and readable
const TELEMETRY_UUID: Uuid = Uuid::from_u128(0x6e400002_b5a3_f393_e0a9_e50e24dcca9e);
/// Command characteristic the central writes to
const CONTROL_UUID: Uuid = Uuid::from_u128(0x6e400003_b5a3_f393_e0a9_e50e24dcca9e);

#[tokio::main]
async fn main() -> Result<()> {
   env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

   info!("Starting gatthost demo peripheral...");

   let config = Config::load()?;
   let event_bus = EventProcessor::new();
   let (transport, notify_rx, reply_rx) = ChannelTransport::new(config.transport_capacity);
   let manager = PeripheralManager::new(transport, event_bus.clone(), &config);

   let telemetry = Characteristic::new(
      TELEMETRY_UUID,
      "telemetry",
      Props::new(Props::READ | Props::NOTIFY),
      Packet::from_slice(&encode_reading(2150, 0)),
   );
   let control = Characteristic::new(CONTROL_UUID, "control", Props::new(Props::WRITE), None);
   let service = Service::new(
      SERVICE_UUID,
      config.device_name.as_str(),
      vec![telemetry.clone(), control.clone()],
   );
   manager.add_service(service).await?;

   info!("Hosting service {SERVICE_UUID} as '{}'", config.device_name);

   event_bus.clone().spawn_dispatcher();
   tokio::spawn(run_write_handler(control));
   tokio::spawn(run_central(manager.clone(), notify_rx, reply_rx));
   tokio::spawn(run_producer(telemetry, config.update_interval_ms));

   // Wait for shutdown signal
   signal::ctrl_c().await?;
   info!("Shutting down gatthost demo...");
   manager.shutdown().await;

   Ok(())
}

/// Temperature in centi-degrees plus a sequence number, little endian.
fn encode_reading(temperature: i16, sequence: u16) -> [u8; 4] {
   let mut payload = [0u8; 4];
   payload[..2].copy_from_slice(&temperature.to_le_bytes());
   payload[2..].copy_from_slice(&sequence.to_le_bytes());
   payload
}

/// Streams telemetry readings into the characteristic.
async fn run_producer(telemetry: Characteristic, interval_ms: u64) {
   let mut tick = time::interval(Duration::from_millis(interval_ms.max(10)));
   tick.set_missed_tick_behavior(time::MissedTickBehavior::Skip);
   let mut temperature = 2150i16;
   let mut sequence = 0u16;

   loop {
      tick.tick().await;
      temperature += rand::thread_rng().gen_range(-25..=25);
      sequence = sequence.wrapping_add(1);
      match telemetry.update_value(&encode_reading(temperature, sequence)).await {
         Ok(true) => {},
         Ok(false) => debug!("telemetry: update queued ({} pending)", telemetry.pending_count()),
         Err(e) => {
            warn!("telemetry: update failed: {e}");
            return;
         },
      }
   }
}

/// Answers writes against the control characteristic.
async fn run_write_handler(control: Characteristic) {
   let mut requests = match control.start_responding_to_write_requests().await {
      Ok(stream) => stream,
      Err(e) => {
         warn!("control: failed to register write responder: {e}");
         return;
      },
   };
   loop {
      match requests.recv().await {
         Ok(request) => {
            let payload = request.value.as_deref().unwrap_or_default();
            info!("control: write {} from {}", hex::encode(payload), request.subscriber);
            let result = if payload.len() > 4 {
               AttResult::InvalidAttributeValueLength
            } else {
               let _ = control.set_value(payload);
               AttResult::Success
            };
            if let Err(e) = control.respond(&request, result).await {
               warn!("control: respond failed: {e}");
            }
         },
         Err(e) => {
            info!("control: write responder stopped: {e}");
            return;
         },
      }
   }
}

/// Scripted central: subscribes, consumes notifications slowly, signals
/// readiness after each batch, and fires the odd read or write.
async fn run_central(
   manager: PeripheralManager,
   mut notifications: mpsc::Receiver<Notification>,
   mut replies: mpsc::Receiver<Reply>,
) {
   let central = Subscriber::new(Uuid::new_v4(), 185);
   if manager.subscribed(TELEMETRY_UUID, central).await.is_err() {
      return;
   }

   let mut consume = time::interval(Duration::from_millis(300));
   consume.set_missed_tick_behavior(time::MissedTickBehavior::Skip);
   let mut ticks = 0u32;

   loop {
      tokio::select! {
         _ = consume.tick() => {
            // Sometimes the radio is busy and nothing gets consumed; the
            // notify queue backs up and pushes start getting rejected.
            if rand::thread_rng().gen_bool(0.25) {
               continue;
            }
            let mut drained = 0;
            while drained < 2 {
               match notifications.try_recv() {
                  Ok(notification) => {
                     debug!(
                        "central: notification on {} ({})",
                        notification.characteristic,
                        hex::encode(&notification.value)
                     );
                     drained += 1;
                  },
                  Err(mpsc::error::TryRecvError::Empty) => break,
                  Err(mpsc::error::TryRecvError::Disconnected) => return,
               }
            }
            if drained > 0 && manager.ready_to_resume().await.is_err() {
               return;
            }

            ticks += 1;
            if ticks % 25 == 0 {
               let command = [rand::thread_rng().gen_range(0..=3u8)];
               if manager.write_requested(CONTROL_UUID, central.id, 0, &command).await.is_err() {
                  return;
               }
            } else if ticks % 10 == 0
               && manager.read_requested(TELEMETRY_UUID, central.id, 0).await.is_err()
            {
               return;
            }
         },
         reply = replies.recv() => {
            match reply {
               Some(reply) => debug!("central: reply {} -> {}", reply.token, reply.result),
               None => return,
            }
         },
      }
   }
}

// === Event Processor ===

struct EventProcessor {
   queue: SegQueue<PeripheralEvent>,
   notifier: Notify,
}

impl EventProcessor {
   fn new() -> Arc<Self> {
      Arc::new(Self {
         queue: SegQueue::new(),
         notifier: Notify::new(),
      })
   }

   async fn recv(self: &Arc<Self>) -> Option<PeripheralEvent> {
      loop {
         if let Some(event) = self.queue.pop() {
            return Some(event);
         }
         let notify = self.notifier.notified();
         if let Some(event) = self.queue.pop() {
            return Some(event);
         }
         if Arc::strong_count(self) == 1 {
            return None;
         }
         let _ = time::timeout(Duration::from_secs(1), notify).await;
      }
   }

   fn spawn_dispatcher(self: Arc<Self>) {
      tokio::spawn(async move {
         while let Some(event) = self.recv().await {
            dispatch(&event);
         }
      });
   }
}

impl EventBus for EventProcessor {
   fn emit(&self, event: PeripheralEvent) {
      self.queue.push(event);
      self.notifier.notify_waiters();
   }
}

fn dispatch(event: &PeripheralEvent) {
   match event {
      PeripheralEvent::ServiceAdded(uuid) => info!("event: service {uuid} added"),
      PeripheralEvent::ServiceRemoved(uuid) => info!("event: service {uuid} removed"),
      PeripheralEvent::SubscriberAdded {
         characteristic,
         subscriber,
      } => {
         info!(
            "event: {characteristic} gained subscriber {} (max update {})",
            subscriber.id, subscriber.max_update_len
         );
      },
      PeripheralEvent::SubscriberRemoved {
         characteristic,
         subscriber,
      } => {
         info!("event: {characteristic} lost subscriber {subscriber}");
      },
      PeripheralEvent::UpdatesStalled {
         characteristic,
         queued,
      } => {
         warn!("event: {characteristic} stalled with {queued} queued updates");
      },
      PeripheralEvent::UpdatesResumed {
         characteristic,
         flushed,
      } => {
         info!("event: {characteristic} resumed, {flushed} updates flushed");
      },
      PeripheralEvent::TransportReset => warn!("event: transport reset"),
   }
}
