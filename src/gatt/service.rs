//! GATT service: a named group of characteristics.

use serde_json::json;
use smol_str::SmolStr;
use uuid::Uuid;

use crate::gatt::characteristic::Characteristic;

/// A primary service hosted by the peripheral.
///
/// The service itself carries no behavior; it groups characteristics so
/// they can be added to and removed from a peripheral as one unit.
/// Cloning is cheap and shares the characteristic handles.
#[derive(Debug, Clone)]
pub struct Service {
   uuid: Uuid,
   name: SmolStr,
   characteristics: Vec<Characteristic>,
}

impl Service {
   pub fn new(uuid: Uuid, name: impl Into<SmolStr>, characteristics: Vec<Characteristic>) -> Self {
      Self {
         uuid,
         name: name.into(),
         characteristics,
      }
   }

   pub fn uuid(&self) -> Uuid {
      self.uuid
   }

   pub fn name(&self) -> &str {
      &self.name
   }

   pub fn characteristics(&self) -> &[Characteristic] {
      &self.characteristics
   }

   pub fn characteristic(&self, uuid: Uuid) -> Option<&Characteristic> {
      self.characteristics.iter().find(|c| c.uuid() == uuid)
   }

   pub fn to_json(&self) -> serde_json::Value {
      json!({
          "uuid": self.uuid.to_string(),
          "name": self.name.as_str(),
          "characteristics": self.characteristics.iter().map(Characteristic::to_json).collect::<Vec<_>>(),
      })
   }
}

#[cfg(test)]
mod tests {
   use super::*;
   use crate::gatt::types::Props;

   #[test]
   fn test_lookup_by_uuid() {
      let a = Characteristic::new(Uuid::new_v4(), "a", Props::new(Props::READ), None);
      let b = Characteristic::new(Uuid::new_v4(), "b", Props::new(Props::NOTIFY), None);
      let service = Service::new(Uuid::new_v4(), "sensor", vec![a.clone(), b.clone()]);

      assert_eq!(service.characteristic(a.uuid()).unwrap().uuid(), a.uuid());
      assert_eq!(service.characteristic(b.uuid()).unwrap().name(), "b");
      assert!(service.characteristic(Uuid::new_v4()).is_none());
   }

   #[test]
   fn test_json_shape() {
      let chr = Characteristic::new(Uuid::new_v4(), "level", Props::new(Props::READ), None);
      let service = Service::new(Uuid::new_v4(), "battery", vec![chr]);

      let json = service.to_json();
      assert_eq!(json["name"], "battery");
      assert_eq!(json["characteristics"].as_array().unwrap().len(), 1);
      assert_eq!(json["characteristics"][0]["name"], "level");
   }
}
