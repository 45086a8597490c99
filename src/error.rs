//! Error types for the GATT peripheral engine.
//!
//! This module defines all error types that can occur while hosting
//! characteristics, dispatching ATT requests, and loading configuration.

use thiserror::Error;
use uuid::Uuid;

/// Main error type for the peripheral engine.
#[derive(Error, Debug)]
pub enum GattError {
   #[error("I/O error: {0}")]
   Io(#[from] std::io::Error),

   #[error("Characteristic not found: {0}")]
   CharacteristicNotFound(Uuid),

   #[error("Characteristic {0} is not attached to a peripheral")]
   NotAttached(Uuid),

   #[error("Service already added: {0}")]
   ServiceAlreadyAdded(Uuid),

   #[error("Service not found: {0}")]
   ServiceNotFound(Uuid),

   #[error("Characteristic {0} already attached to another service")]
   DuplicateCharacteristic(Uuid),

   #[error("Value length {len} exceeds maximum of {max} bytes")]
   ValueTooLarge { len: usize, max: usize },

   #[error("Request is not pending or was already responded to")]
   InvalidRequestState,

   #[error("Request responder was replaced by a newer registration")]
   ResponderReplaced,

   #[error("Request responder was stopped")]
   ResponderStopped,

   #[error("Could not determine config directory")]
   ConfigDirNotFound,

   #[error("TOML parsing error: {0}")]
   TomlParse(#[from] toml::de::Error),

   #[error("TOML serialization error: {0}")]
   TomlSerialize(#[from] toml::ser::Error),

   #[error("Manager has been shut down")]
   ManagerShutdown,
}

/// Convenience type alias for Results with `GattError`.
pub type Result<T> = std::result::Result<T, GattError>;
