//! Configuration management for the GATT host engine.
//!
//! This module handles loading and saving configuration from disk,
//! including channel capacities and the demo peripheral's knobs.

use std::{
   env, fs,
   path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};

use crate::error::{GattError, Result};

/// Main configuration structure for the engine.
#[derive(Serialize, Deserialize, Clone)]
pub struct Config {
   /// Name the demo peripheral advertises itself under.
   #[serde(default = "default_device_name")]
   pub device_name: String,

   /// Command inbox depth of the peripheral actor.
   #[serde(default = "default_command_capacity")]
   pub command_capacity: usize,

   /// Buffered requests per characteristic request stream.
   #[serde(default = "default_request_stream_capacity")]
   pub request_stream_capacity: usize,

   /// Notification queue depth of the channel transport.
   #[serde(default = "default_transport_capacity")]
   pub transport_capacity: usize,

   /// Demo telemetry producer tick in milliseconds.
   #[serde(default = "default_update_interval_ms")]
   pub update_interval_ms: u64,
}

fn default_device_name() -> String {
   "gatthost".to_owned()
}

const fn default_command_capacity() -> usize {
   1000
}

const fn default_request_stream_capacity() -> usize {
   32
}

const fn default_transport_capacity() -> usize {
   8
}

const fn default_update_interval_ms() -> u64 {
   250
}

impl Default for Config {
   fn default() -> Self {
      Self {
         device_name: default_device_name(),
         command_capacity: default_command_capacity(),
         request_stream_capacity: default_request_stream_capacity(),
         transport_capacity: default_transport_capacity(),
         update_interval_ms: default_update_interval_ms(),
      }
   }
}

impl Config {
   /// Loads configuration from disk or creates default if not exists.
   pub fn load() -> Result<Self> {
      let config_path = Self::config_path()?;

      if config_path.exists() {
         Self::load_from(&config_path)
      } else {
         // Create default config
         let config = Self::default();
         config.save()?;
         Ok(config)
      }
   }

   pub fn load_from(path: &Path) -> Result<Self> {
      let contents = fs::read_to_string(path)?;
      Ok(toml::from_str(&contents)?)
   }

   /// Saves the current configuration to disk.
   pub fn save(&self) -> Result<()> {
      self.save_to(&Self::config_path()?)
   }

   pub fn save_to(&self, path: &Path) -> Result<()> {
      // Ensure directory exists
      if let Some(parent) = path.parent() {
         fs::create_dir_all(parent)?;
      }

      let contents = toml::to_string_pretty(self)?;
      fs::write(path, contents)?;

      Ok(())
   }

   fn config_path() -> Result<PathBuf> {
      let config_dir = if let Ok(home) = env::var("GATTHOST_HOME") {
         PathBuf::from(home)
      } else if let Ok(config_home) = env::var("XDG_CONFIG_HOME") {
         PathBuf::from(config_home)
      } else if let Ok(home) = env::var("HOME") {
         PathBuf::from(home).join(".config")
      } else {
         return Err(GattError::ConfigDirNotFound);
      };

      Ok(config_dir.join("gatthost").join("config.toml"))
   }
}

#[cfg(test)]
mod tests {
   use super::*;

   #[test]
   fn test_defaults_fill_missing_fields() {
      let config: Config = toml::from_str("device_name = \"bench\"").unwrap();
      assert_eq!(config.device_name, "bench");
      assert_eq!(config.command_capacity, default_command_capacity());
      assert_eq!(config.request_stream_capacity, default_request_stream_capacity());
      assert_eq!(config.update_interval_ms, default_update_interval_ms());
   }

   #[test]
   fn test_save_and_load_round_trip() {
      let dir = tempfile::tempdir().unwrap();
      let path = dir.path().join("nested").join("config.toml");

      let mut config = Config::default();
      config.device_name = "bench".into();
      config.transport_capacity = 4;
      config.save_to(&path).unwrap();

      let loaded = Config::load_from(&path).unwrap();
      assert_eq!(loaded.device_name, "bench");
      assert_eq!(loaded.transport_capacity, 4);
      assert_eq!(loaded.command_capacity, default_command_capacity());
   }
}
