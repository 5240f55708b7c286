use crate::corrections::validate_owner;
use crate::error::CorrectionError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceInfo {
    pub vendor: String,
    #[serde(default)]
    pub model: String,
    #[serde(default)]
    pub spec_version: String,
    /// Artifact the device's derived outputs are regenerated from
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub document_id: Option<String>,
}

/// `registry.yaml`: device id → vendor, model and spec version
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeviceRegistry {
    devices: BTreeMap<String, DeviceInfo>,
}

impl DeviceRegistry {
    /// A missing file is an empty registry
    pub fn load(path: &Path) -> Result<Self, CorrectionError> {
        if !path.exists() {
            debug!(path = %path.display(), "No device registry, starting empty");
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)?;
        if content.trim().is_empty() {
            return Ok(Self::default());
        }
        Ok(serde_yaml::from_str(&content)?)
    }

    pub fn save(&self, path: &Path) -> Result<(), CorrectionError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, serde_yaml::to_string(self)?)?;
        Ok(())
    }

    pub fn get(&self, device_id: &str) -> Result<&DeviceInfo, CorrectionError> {
        self.devices
            .get(device_id)
            .ok_or_else(|| CorrectionError::MissingDevice(device_id.to_string()))
    }

    pub fn contains(&self, device_id: &str) -> bool {
        self.devices.contains_key(device_id)
    }

    pub fn vendor_of(&self, device_id: &str) -> Result<&str, CorrectionError> {
        self.get(device_id).map(|info| info.vendor.as_str())
    }

    /// Vendor-scope corrections may only name a vendor some registered
    /// device belongs to
    pub fn require_vendor(&self, vendor: &str) -> Result<(), CorrectionError> {
        validate_owner(vendor)?;
        if self.devices.values().any(|info| info.vendor == vendor) {
            Ok(())
        } else {
            Err(CorrectionError::InvalidOwner {
                owner: vendor.to_string(),
                reason: "no registered device has this vendor".to_string(),
            })
        }
    }

    pub fn register(&mut self, device_id: &str, info: DeviceInfo) {
        self.devices.insert(device_id.to_string(), info);
    }

    pub fn assign_document(&mut self, device_id: &str, document_id: &str) -> Result<(), CorrectionError> {
        let info = self
            .devices
            .get_mut(device_id)
            .ok_or_else(|| CorrectionError::MissingDevice(device_id.to_string()))?;
        info.document_id = Some(document_id.to_string());
        Ok(())
    }

    pub fn device_ids(&self) -> impl Iterator<Item = &str> {
        self.devices.keys().map(String::as_str)
    }
}
