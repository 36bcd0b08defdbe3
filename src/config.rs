//! Host side configuration of a bootgate core.
//!
//! A configuration is a RON document describing the storage device, its
//! slot layout and the image policy. It only exists on the host: the
//! simulator loads it to build a [`Storage`] and an [`ImagePolicy`].
use crate::{
    devices::{
        image::ImagePolicy,
        storage::{Storage, StorageSlot, MAX_SLOTS},
        traits::Flash,
    },
    utilities::memory::{Region, Span},
};
use anyhow::{anyhow, bail, Context, Result};
use p256::{ecdsa::VerifyingKey, pkcs8::DecodePublicKey};
use serde::{Deserialize, Serialize};
use std::{fs, path::Path};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SlotConfiguration {
    pub address: u32,
    pub length: u32,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StorageConfiguration {
    pub page_size: u32,
    pub capacity: u32,
    pub slots: Vec<SlotConfiguration>,
    /// Page holding the persisted boot order.
    pub boot_info_address: u32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum SecurityMode {
    /// Images are only checked for integrity.
    Crc,
    /// Images must carry a valid P-256 ECDSA signature.
    P256ECDSA,
}

impl Default for SecurityMode {
    fn default() -> Self { SecurityMode::P256ECDSA }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct SecurityConfiguration {
    pub security_mode: SecurityMode,
    /// SubjectPublicKeyInfo PEM of the image signing key.
    #[serde(default)]
    pub verifying_key_pem: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Configuration {
    pub storage: StorageConfiguration,
    #[serde(default)]
    pub security: SecurityConfiguration,
    /// Start of the application's vector table.
    pub application_base: u32,
    /// Address bootloader upgrades are built for.
    #[serde(default)]
    pub bootloader_base: u32,
    #[serde(default)]
    pub minimum_application_version: u32,
}

impl Configuration {
    pub fn load(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read configuration {}", path.display()))?;
        Self::parse(&contents)
    }

    pub fn parse(contents: &str) -> Result<Self> {
        let configuration: Configuration = ron::from_str(contents)?;
        configuration.validate()?;
        Ok(configuration)
    }

    /// Checks the storage layout and the security settings for consistency.
    pub fn validate(&self) -> Result<()> {
        let storage = &self.storage;
        if storage.page_size == 0 || storage.capacity % storage.page_size != 0 {
            bail!("Capacity must be a non-zero multiple of the page size");
        }
        if storage.slots.len() > MAX_SLOTS {
            bail!("At most {} slots are supported", MAX_SLOTS);
        }

        let device = Span::new(0, storage.capacity);
        let boot_info = Span::new(storage.boot_info_address, storage.page_size);
        if storage.boot_info_address % storage.page_size != 0
            || !device.contains_range(boot_info.start, boot_info.length)
        {
            bail!("Boot info page must be a whole page inside the device");
        }
        for (index, slot) in storage.slots.iter().enumerate() {
            let span = Span::new(slot.address, slot.length);
            if slot.address % storage.page_size != 0 {
                bail!("Slot {} does not start on a page boundary", index);
            }
            if !device.contains_range(slot.address, slot.length) {
                bail!("Slot {} exceeds the device capacity", index);
            }
            if span.overlaps(&boot_info) {
                bail!("Slot {} overlaps the boot info page", index);
            }
            let overlapping = storage.slots[..index]
                .iter()
                .position(|other| Span::new(other.address, other.length).overlaps(&span));
            if let Some(other) = overlapping {
                bail!("Slot {} overlaps slot {}", index, other);
            }
        }

        if self.security.security_mode == SecurityMode::P256ECDSA {
            self.verifying_key()?;
        }
        Ok(())
    }

    /// The configured signing key, if any.
    pub fn verifying_key(&self) -> Result<Option<VerifyingKey>> {
        match self.security.security_mode {
            SecurityMode::Crc => Ok(None),
            SecurityMode::P256ECDSA => VerifyingKey::from_public_key_pem(&self.security.verifying_key_pem)
                .map(Some)
                .map_err(|e| anyhow!("Invalid verifying key: {}", e)),
        }
    }

    pub fn policy(&self) -> Result<ImagePolicy> {
        Ok(ImagePolicy {
            require_authenticity: self.security.security_mode == SecurityMode::P256ECDSA,
            verifying_key: self.verifying_key()?,
            application_base: self.application_base,
            bootloader_base: self.bootloader_base,
            minimum_application_version: self.minimum_application_version,
        })
    }

    pub fn slots(&self) -> Vec<StorageSlot> {
        self.storage
            .slots
            .iter()
            .map(|slot| StorageSlot { address: slot.address, length: slot.length })
            .collect()
    }

    /// Binds `device` to the configured slot layout.
    pub fn storage<F: Flash>(&self, device: F) -> Result<Storage<F>> {
        Storage::new(device, &self.slots(), self.storage.boot_info_address)
            .map_err(|e| anyhow!("Storage layout rejected: {}", e))
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::hal::doubles::flash::FakeFlash;
    use p256::{
        ecdsa::SigningKey,
        pkcs8::{EncodePublicKey, LineEnding},
    };

    const SAMPLE: &str = r#"(
        storage: (
            page_size: 2048,
            capacity: 65536,
            slots: [
                (address: 0, length: 24576),
                (address: 24576, length: 24576),
                (address: 49152, length: 12288),
            ],
            boot_info_address: 63488,
        ),
        security: (security_mode: Crc),
        application_base: 134250496,
    )"#;

    #[test]
    fn sample_configuration_builds_storage_and_policy() {
        // Given
        let configuration = Configuration::parse(SAMPLE).unwrap();

        // When
        let mut storage = configuration.storage(FakeFlash::new(2048, 65536)).unwrap();
        let policy = configuration.policy().unwrap();

        // Then
        assert_eq!(storage.slot_count(), 3);
        assert_eq!(storage.storage_info().page_size, 2048);
        assert_eq!(storage.slot_info(2).unwrap(), StorageSlot { address: 49152, length: 12288 });
        assert!(!policy.require_authenticity);
        assert!(policy.verifying_key.is_none());
        assert_eq!(policy.application_base, 0x0800_8000);
        assert_eq!((policy.bootloader_base, policy.minimum_application_version), (0, 0));
    }

    #[test]
    fn bootloader_base_and_minimum_version_reach_the_policy() {
        // Given
        let sample = SAMPLE.replace(
            "application_base: 134250496,",
            "application_base: 134250496, bootloader_base: 134217728, minimum_application_version: 5,",
        );

        // When
        let policy = Configuration::parse(&sample).unwrap().policy().unwrap();

        // Then
        assert_eq!(policy.bootloader_base, 0x0800_0000);
        assert_eq!(policy.minimum_application_version, 5);
    }

    #[test]
    fn inconsistent_layouts_are_rejected() {
        let mut configuration = Configuration::parse(SAMPLE).unwrap();
        configuration.storage.slots[1].address = 2048;
        assert!(configuration.validate().is_err());

        let mut configuration = Configuration::parse(SAMPLE).unwrap();
        configuration.storage.boot_info_address = 49152;
        assert!(configuration.validate().is_err());

        let mut configuration = Configuration::parse(SAMPLE).unwrap();
        configuration.storage.slots[2].length = 16384;
        assert!(configuration.validate().is_err());

        let mut configuration = Configuration::parse(SAMPLE).unwrap();
        configuration.storage.capacity = 65537;
        assert!(configuration.validate().is_err());
    }

    #[test]
    fn signed_mode_requires_a_key() {
        // Given
        let mut configuration = Configuration::parse(SAMPLE).unwrap();
        configuration.security.security_mode = SecurityMode::P256ECDSA;

        // Then
        assert!(configuration.validate().is_err());

        // When
        let key = SigningKey::from_slice(&[0x5A; 32]).unwrap();
        configuration.security.verifying_key_pem = VerifyingKey::from(&key)
            .to_public_key_pem(LineEnding::LF)
            .unwrap();

        // Then
        configuration.validate().unwrap();
        let policy = configuration.policy().unwrap();
        assert!(policy.require_authenticity);
        assert_eq!(policy.verifying_key, Some(VerifyingKey::from(&key)));
    }
}
