//! Named presets: register configurations and custom functions
//!
//! Both live in their own sled trees keyed by name, with JSON values.
//! `upsert` replaces an existing entry of the same name. Register presets
//! can be exported to and imported from a JSON array file.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::{info, warn};

use super::StorageError;
use crate::acquisition::channel::Channel;
use crate::config::{defaults, ChannelConfig};

const REGISTER_TREE: &str = "register_configs";
const FUNCTION_TREE: &str = "custom_functions";

/// A saved register configuration. Missing fields take the usual channel
/// defaults when imported.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegisterPreset {
    pub name: String,
    #[serde(default = "default_slave")]
    pub slave_id: u8,
    #[serde(default)]
    pub address: u16,
    #[serde(default = "default_count")]
    pub count: u16,
    #[serde(default = "default_function_code")]
    pub function_code: u8,
    #[serde(default)]
    pub unit: String,
    #[serde(default = "default_scale")]
    pub scale: f64,
    #[serde(default)]
    pub offset: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub color: Option<String>,
}

fn default_slave() -> u8 {
    1
}
fn default_count() -> u16 {
    1
}
fn default_function_code() -> u8 {
    3
}
fn default_scale() -> f64 {
    1.0
}

impl RegisterPreset {
    pub fn to_channel_config(&self) -> ChannelConfig {
        let mut cfg = ChannelConfig::new(&self.name, self.slave_id, self.address);
        cfg.count = self.count;
        cfg.function_code = self.function_code;
        cfg.unit.clone_from(&self.unit);
        cfg.scale = self.scale;
        cfg.offset = self.offset;
        cfg.color.clone_from(&self.color);
        cfg
    }

    pub fn from_channel(channel: &Channel) -> Self {
        Self {
            name: channel.name.to_string(),
            slave_id: channel.slave_id,
            address: channel.address,
            count: channel.count,
            function_code: channel.function_code.code(),
            unit: channel.unit.to_string(),
            scale: channel.scale,
            offset: channel.offset,
            color: channel.color.clone(),
        }
    }

    /// Same checks a channel built from this preset would face.
    fn validate(&self) -> Result<(), StorageError> {
        Channel::from_config(
            &self.to_channel_config(),
            Duration::from_millis(defaults::DEFAULT_POLL_INTERVAL_MS),
        )
        .map(|_| ())
        .map_err(|e| StorageError::InvalidInput(e.to_string()))
    }
}

/// A named user expression. Stored only; evaluation lives elsewhere.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CustomFunction {
    pub name: String,
    pub expression: String,
    #[serde(default)]
    pub description: String,
}

/// Outcome of a preset import.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ImportSummary {
    pub imported: usize,
    pub failed: usize,
}

#[derive(Clone)]
pub struct PresetStore {
    registers: sled::Tree,
    functions: sled::Tree,
}

impl PresetStore {
    pub fn from_db(db: &sled::Db) -> Result<Self, StorageError> {
        Ok(Self {
            registers: db.open_tree(REGISTER_TREE)?,
            functions: db.open_tree(FUNCTION_TREE)?,
        })
    }

    // ------------------------------------------------------------------
    // Register presets
    // ------------------------------------------------------------------

    /// All register presets, sorted by name.
    pub fn list_registers(&self) -> Result<Vec<RegisterPreset>, StorageError> {
        list_tree(&self.registers)
    }

    pub fn get_register(&self, name: &str) -> Result<Option<RegisterPreset>, StorageError> {
        get_from_tree(&self.registers, name.trim())
    }

    /// Insert or replace by name. Surrounding whitespace in the name is
    /// dropped from both the key and the stored preset.
    pub fn upsert_register(&self, preset: &RegisterPreset) -> Result<(), StorageError> {
        let mut preset = preset.clone();
        preset.name = preset.name.trim().to_string();
        if preset.name.is_empty() {
            return Err(StorageError::InvalidInput("preset name must not be empty".into()));
        }
        preset.validate()?;
        self.registers
            .insert(preset.name.as_bytes(), serde_json::to_vec(&preset)?)?;
        Ok(())
    }

    /// Returns whether a preset of that name existed.
    pub fn remove_register(&self, name: &str) -> Result<bool, StorageError> {
        Ok(self.registers.remove(name.trim().as_bytes())?.is_some())
    }

    /// Write every register preset as a pretty JSON array.
    pub fn export_registers(&self, path: &Path) -> Result<usize, StorageError> {
        let presets = self.list_registers()?;
        std::fs::write(path, serde_json::to_vec_pretty(&presets)?)?;
        info!(path = %path.display(), count = presets.len(), "Register presets exported");
        Ok(presets.len())
    }

    /// Import a JSON array of presets, replacing same-named entries.
    ///
    /// Entries that fail to parse or validate are skipped and counted.
    pub fn import_registers(&self, path: &Path) -> Result<ImportSummary, StorageError> {
        let raw = std::fs::read(path)?;
        let items: Vec<serde_json::Value> = serde_json::from_slice(&raw)?;

        let mut summary = ImportSummary::default();
        for item in items {
            let result = serde_json::from_value::<RegisterPreset>(item)
                .map_err(StorageError::from)
                .and_then(|p| self.upsert_register(&p));
            match result {
                Ok(()) => summary.imported += 1,
                Err(e) => {
                    warn!(error = %e, "Skipping register preset during import");
                    summary.failed += 1;
                }
            }
        }
        info!(
            path = %path.display(),
            imported = summary.imported,
            failed = summary.failed,
            "Register presets imported"
        );
        Ok(summary)
    }

    // ------------------------------------------------------------------
    // Custom functions
    // ------------------------------------------------------------------

    pub fn list_functions(&self) -> Result<Vec<CustomFunction>, StorageError> {
        list_tree(&self.functions)
    }

    pub fn get_function(&self, name: &str) -> Result<Option<CustomFunction>, StorageError> {
        get_from_tree(&self.functions, name.trim())
    }

    pub fn upsert_function(&self, function: &CustomFunction) -> Result<(), StorageError> {
        let mut function = function.clone();
        function.name = function.name.trim().to_string();
        if function.name.is_empty() || function.expression.trim().is_empty() {
            return Err(StorageError::InvalidInput(
                "function name and expression must not be empty".into(),
            ));
        }
        self.functions
            .insert(function.name.as_bytes(), serde_json::to_vec(&function)?)?;
        Ok(())
    }

    pub fn remove_function(&self, name: &str) -> Result<bool, StorageError> {
        Ok(self.functions.remove(name.trim().as_bytes())?.is_some())
    }
}

fn list_tree<T: serde::de::DeserializeOwned>(tree: &sled::Tree) -> Result<Vec<T>, StorageError> {
    tree.iter()
        .values()
        .map(|v| Ok(serde_json::from_slice(&v?)?))
        .collect()
}

fn get_from_tree<T: serde::de::DeserializeOwned>(
    tree: &sled::Tree,
    name: &str,
) -> Result<Option<T>, StorageError> {
    match tree.get(name.as_bytes())? {
        Some(v) => Ok(Some(serde_json::from_slice(&v)?)),
        None => Ok(None),
    }
}
