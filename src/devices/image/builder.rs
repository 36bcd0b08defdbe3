//! Host side assembly of GBL containers.
use super::{
    tag, ApplicationImageMetadata, CONTAINER_MAJOR_VERSION, CONTAINER_TYPE_SIGNED,
    SIGNATURE_LENGTH,
};
use crc::crc32;
use p256::ecdsa::{signature::DigestSigner, Signature, SigningKey};
use sha2::{Digest, Sha256};

/// Accumulates tags and emits a container with header and end tags.
#[derive(Clone, Debug, Default)]
pub struct GblBuilder {
    tags: Vec<u8>,
}

impl GblBuilder {
    pub fn new() -> Self { Self::default() }

    pub fn application(mut self, metadata: &ApplicationImageMetadata) -> Self {
        let mut body = Vec::with_capacity(28);
        body.extend_from_slice(&metadata.application_type.bits().to_le_bytes());
        body.extend_from_slice(&metadata.version.to_le_bytes());
        body.extend_from_slice(&metadata.capabilities.to_le_bytes());
        body.extend_from_slice(&metadata.product_id);
        self.push(tag::APPLICATION, &body);
        self
    }

    pub fn bootloader(mut self, version: u32, address: u32, binary: &[u8]) -> Self {
        let mut body = Vec::with_capacity(8 + binary.len());
        body.extend_from_slice(&version.to_le_bytes());
        body.extend_from_slice(&address.to_le_bytes());
        body.extend_from_slice(binary);
        self.push(tag::BOOTLOADER, &body);
        self
    }

    pub fn prog(mut self, address: u32, data: &[u8]) -> Self {
        let mut body = Vec::with_capacity(4 + data.len());
        body.extend_from_slice(&address.to_le_bytes());
        body.extend_from_slice(data);
        self.push(tag::PROG, &body);
        self
    }

    pub fn metadata(mut self, data: &[u8]) -> Self {
        self.push(tag::METADATA, data);
        self
    }

    /// Appends a raw tag, for containers the typed helpers can't express.
    pub fn raw(mut self, id: u32, body: &[u8]) -> Self {
        self.push(id, body);
        self
    }

    /// Emits an unsigned container.
    pub fn build(self) -> Vec<u8> {
        let mut container = self.body(0);
        end(&mut container);
        container
    }

    /// Emits a container signed with `key`.
    pub fn build_signed(self, key: &SigningKey) -> Vec<u8> {
        let mut container = self.body(CONTAINER_TYPE_SIGNED);
        let signature: Signature = key.sign_digest(Sha256::new_with_prefix(&container));
        push_tag(&mut container, tag::SIGNATURE_ECDSA_P256, &signature.to_bytes());
        debug_assert_eq!(signature.to_bytes().len(), SIGNATURE_LENGTH);
        end(&mut container);
        container
    }

    fn body(&self, container_type: u32) -> Vec<u8> {
        let mut container = Vec::with_capacity(16 + self.tags.len() + 80);
        let mut header = [0u8; 8];
        header[..4].copy_from_slice(&CONTAINER_MAJOR_VERSION.to_le_bytes());
        header[4..].copy_from_slice(&container_type.to_le_bytes());
        push_tag(&mut container, tag::HEADER_V3, &header);
        container.extend_from_slice(&self.tags);
        container
    }

    fn push(&mut self, id: u32, body: &[u8]) { push_tag(&mut self.tags, id, body) }
}

fn push_tag(container: &mut Vec<u8>, id: u32, body: &[u8]) {
    container.extend_from_slice(&id.to_le_bytes());
    container.extend_from_slice(&(body.len() as u32).to_le_bytes());
    container.extend_from_slice(body);
}

fn end(container: &mut Vec<u8>) {
    container.extend_from_slice(&tag::END.to_le_bytes());
    container.extend_from_slice(&4u32.to_le_bytes());
    let crc = crc32::checksum_ieee(container);
    container.extend_from_slice(&crc.to_le_bytes());
}
