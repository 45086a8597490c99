//! GATT database types.
//!
//! This module contains the attribute-level building blocks: services,
//! characteristics with their update queues, and the shared wire types.

pub mod characteristic;
pub mod service;
pub mod types;
