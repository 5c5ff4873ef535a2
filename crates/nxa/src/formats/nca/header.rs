use snafu::ResultExt;
use tracing::warn;

use crate::crypto::keyset::KeyProvider;
use crate::crypto::verify_rsa2048_pss_sha256;
use crate::ids::{ContentId, RightsId};
use crate::storage::ReadableStorage;

use super::key_area;
use super::patch::PatchBlock;
use super::structs::{DistributionType, NcaHeader, NcaMagic, SECTOR_SIZE};
use super::{
    serialize_nca_header, HeaderSerializingSnafu, Nca, NcaError, FULL_HEADER_LENGTH,
    HEADER_LENGTH, HEADER_SECTOR_SIZE,
};

/// The signed region starts at the magic and spans 0x200 bytes.
pub(super) const SIGNED_AREA_OFFSET: usize = 0x200;
pub(super) const SIGNED_AREA_SIZE: usize = 0x200;

/// Checks the RSA-2048-PSS-SHA-256 main signature over the plaintext header.
/// A missing modulus reports `false`; initialization never fails on this.
pub(super) fn verify_main_signature(
    keys: &dyn KeyProvider,
    header: &NcaHeader,
    header_bytes: &[u8; HEADER_LENGTH],
) -> bool {
    let generation = header.main_signature_key_generation;
    let modulus = match keys.main_signature_modulus(generation) {
        Some(modulus) => modulus,
        None => {
            warn!("no modulus for main signature key generation {generation}");
            return false;
        }
    };

    let signed = &header_bytes[SIGNED_AREA_OFFSET..SIGNED_AREA_OFFSET + SIGNED_AREA_SIZE];
    verify_rsa2048_pss_sha256(&modulus, signed, &header.main_signature.0 .0)
}

impl<S: ReadableStorage> Nca<S> {
    /// Refreshes the encrypted write-back image of the headers. A no-op
    /// unless the header has been mutated since the last refresh.
    pub fn encrypt_header(&mut self) -> Result<(), NcaError> {
        if !self.header_image_stale {
            return Ok(());
        }
        self.rebuild_encrypted_header()?;
        self.header_image_stale = false;
        Ok(())
    }

    /// Exactly reverses header decryption: the archive header at sector 0,
    /// then the section headers with the per-format sector numbering and (for
    /// NCA0) the key-area XTS pair.
    fn rebuild_encrypted_header(&mut self) -> Result<(), NcaError> {
        let mut archive_header =
            serialize_nca_header(&self.header).context(HeaderSerializingSnafu)?;
        self.header_key
            .encrypt(&mut archive_header, 0, HEADER_SECTOR_SIZE);

        let spans = match self.version {
            NcaMagic::Nca0 => {
                let mut spans = vec![PatchBlock::new(0, archive_header.to_vec())];
                let xts_key = self.decrypted_key_area.xts_key();
                for section in self.sections.iter().flatten() {
                    let mut data = section.raw_header.to_vec();
                    let sector = (section.offset / SECTOR_SIZE - 2) as usize;
                    xts_key.encrypt(&mut data, sector, HEADER_SECTOR_SIZE);
                    spans.push(PatchBlock::new(section.offset, data));
                }
                spans
            }
            NcaMagic::Nca2 | NcaMagic::Nca3 => {
                let mut image = Vec::with_capacity(FULL_HEADER_LENGTH);
                image.extend_from_slice(&archive_header);
                for index in 0..self.sections.len() {
                    let mut data = match &self.sections[index] {
                        Some(section) => section.raw_header,
                        None => self.raw_fs_headers[index],
                    };
                    let sector = match self.version {
                        NcaMagic::Nca3 => 2 + index,
                        _ => 0,
                    };
                    self.header_key.encrypt(&mut data, sector, HEADER_SECTOR_SIZE);
                    image.extend_from_slice(&data);
                }
                vec![PatchBlock::new(0, image)]
            }
        };

        self.encrypted_header = spans;
        Ok(())
    }

    /// Splices the encrypted header image into an outbound buffer covering
    /// the archive range starting at `buf_offset`. Returns whether the whole
    /// image has been written out, across this and previous calls.
    pub fn apply_header_to(&mut self, buf: &mut [u8], buf_offset: u64) -> Result<bool, NcaError> {
        self.encrypt_header()?;
        let mut written = true;
        for span in &mut self.encrypted_header {
            written &= span.apply_to(buf, buf_offset);
        }
        Ok(written)
    }

    pub fn is_header_written(&self) -> bool {
        self.encrypted_header.iter().all(PatchBlock::is_written)
    }

    pub fn set_distribution_type(&mut self, distribution_type: DistributionType) {
        self.header.distribution_type = distribution_type;
        self.mark_header_dirty();
    }

    pub fn set_content_id(&mut self, content_id: ContentId) {
        self.content_id = content_id;
        self.mark_header_dirty();
    }

    /// Converts a rights-id archive to standard crypto: the resolved title
    /// key moves into the key area's CTR slot and the rights id is cleared.
    /// A no-op for archives without titlekey crypto.
    pub fn remove_titlekey_crypto(&mut self, keys: &dyn KeyProvider) -> Result<(), NcaError> {
        if !self.rights_id_available {
            return Ok(());
        }
        let title_key = self.title_key.ok_or(NcaError::MissingTitleKey {
            rights_id: self.header.rights_id,
        })?;

        self.decrypted_key_area.set_ctr_key(title_key.as_aes_key());
        self.header.encrypted_key_area = key_area::encrypt_key_area(
            keys,
            &self.header,
            self.key_generation,
            &self.decrypted_key_area,
        )?;
        self.header.rights_id = RightsId::from([0; 0x10]);
        self.rights_id_available = false;
        self.mark_header_dirty();
        Ok(())
    }

    pub(super) fn mark_header_dirty(&mut self) {
        self.header_dirty = true;
        self.header_image_stale = true;
    }
}
