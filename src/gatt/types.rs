//! GATT data model primitives.
//!
//! This module contains the attribute-protocol result codes, characteristic
//! property flags, and the request/subscriber structures exchanged between
//! the peripheral core and a transport adapter.

use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::peripheral::transport::Packet;

/// Maximum length of a characteristic value, per the attribute protocol.
pub const MAX_VALUE_LEN: usize = 512;

/// Opaque identity of a subscribed remote central.
pub type SubscriberId = Uuid;

/// Result codes delivered back to the transport for ATT requests.
///
/// Discriminants are the attribute-protocol error codes so adapters can
/// put them on the wire directly.
#[repr(u8)]
#[derive(
   Debug,
   Clone,
   Copy,
   PartialEq,
   Eq,
   Serialize,
   Deserialize,
   strum::FromRepr,
   strum::Display,
   strum::EnumString,
)]
pub enum AttResult {
   Success = 0x00,
   ReadNotPermitted = 0x02,
   WriteNotPermitted = 0x03,
   RequestNotSupported = 0x06,
   InvalidOffset = 0x07,
   InsufficientAuthorization = 0x08,
   InvalidAttributeValueLength = 0x0D,
   UnlikelyError = 0x0E,
   InsufficientResources = 0x11,
}

impl AttResult {
   pub const fn code(self) -> u8 {
      self as u8
   }

   pub const fn is_success(self) -> bool {
      matches!(self, Self::Success)
   }
}

/// Direction of an inbound ATT request.
#[derive(
   Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display, strum::EnumString,
)]
pub enum RequestKind {
   #[strum(serialize = "read")]
   Read,
   #[strum(serialize = "write")]
   Write,
}

pub const KNOWN_PROPS: &[(u8, &str)] = &[
   (Props::BROADCAST, "broadcast"),
   (Props::READ, "read"),
   (Props::WRITE_WITHOUT_RESPONSE, "write_without_response"),
   (Props::WRITE, "write"),
   (Props::NOTIFY, "notify"),
   (Props::INDICATE, "indicate"),
];

/// Declared property flags of a characteristic.
///
/// Bit values follow the GATT characteristic-properties field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(transparent)]
pub struct Props(u8);

impl Props {
   pub const BROADCAST: u8 = 1 << 0;
   pub const READ: u8 = 1 << 1;
   pub const WRITE_WITHOUT_RESPONSE: u8 = 1 << 2;
   pub const WRITE: u8 = 1 << 3;
   pub const NOTIFY: u8 = 1 << 4;
   pub const INDICATE: u8 = 1 << 5;

   pub const fn new(bits: u8) -> Self {
      Self(bits)
   }

   pub const fn bits(self) -> u8 {
      self.0
   }

   pub const fn contains(self, bits: u8) -> bool {
      self.0 & bits == bits
   }

   pub const fn can_read(self) -> bool {
      self.contains(Self::READ)
   }

   pub const fn can_write(self) -> bool {
      self.0 & (Self::WRITE | Self::WRITE_WITHOUT_RESPONSE) != 0
   }

   pub const fn can_notify(self) -> bool {
      self.0 & (Self::NOTIFY | Self::INDICATE) != 0
   }
}

impl FromStr for Props {
   type Err = strum::ParseError;

   /// Parses a `|`-separated flag list, e.g. `"read|notify"`.
   fn from_str(s: &str) -> Result<Self, Self::Err> {
      let mut bits = 0;
      for part in s.split('|').map(str::trim).filter(|p| !p.is_empty()) {
         let Some((bit, _)) = KNOWN_PROPS.iter().find(|(_, name)| name.eq_ignore_ascii_case(part))
         else {
            return Err(strum::ParseError::VariantNotFound);
         };
         bits |= bit;
      }
      Ok(Self(bits))
   }
}

impl fmt::Display for Props {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      let mut first = true;
      for (bit, name) in KNOWN_PROPS {
         if self.0 & bit != 0 {
            if !first {
               f.write_str("|")?;
            }
            f.write_str(name)?;
            first = false;
         }
      }
      if first {
         f.write_str("none")?;
      }
      Ok(())
   }
}

/// A remote central subscribed to notifications on a characteristic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subscriber {
   pub id: SubscriberId,
   /// Largest update payload the central declared it can receive.
   pub max_update_len: usize,
}

impl Subscriber {
   pub const fn new(id: SubscriberId, max_update_len: usize) -> Self {
      Self { id, max_update_len }
   }
}

/// Correlates an inbound request with exactly one response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct RequestToken(u64);

impl RequestToken {
   pub const fn from_raw(raw: u64) -> Self {
      Self(raw)
   }

   pub const fn raw(self) -> u64 {
      self.0
   }
}

impl fmt::Display for RequestToken {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      write!(f, "#{}", self.0)
   }
}

/// An inbound ATT request as surfaced to an application handler.
#[derive(Debug, Clone)]
pub struct GattRequest {
   pub token: RequestToken,
   pub kind: RequestKind,
   pub characteristic: Uuid,
   pub subscriber: SubscriberId,
   pub offset: usize,
   /// Payload carried by write requests; `None` for reads.
   pub value: Option<Packet>,
}
