//! Peripheral-role engine.
//!
//! This module contains the manager actor that serializes all GATT state
//! transitions and the transport seam it drives.

pub mod manager;
pub mod transport;
