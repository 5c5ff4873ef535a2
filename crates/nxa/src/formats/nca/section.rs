use num_integer::Integer;
use snafu::{ResultExt, Snafu};

use crate::crypto::{ctr_ex_iv, ctr_iv, AesKey, AesXtsKey, TitleKey};
use crate::storage::ReadableStorage;

use super::key_area::KeyArea;
use super::patch::PatchBlock;
use super::staging::{self, StagingGuard, STAGING_BUFFER_SIZE};
use super::structs::{
    EncryptionType, FsType, HashType, NcaFsEntry, NcaFsHeader, NcaMagic, Sha256Hash,
};
use super::{parse_fs_header, Nca, NcaError, StorageSnafu, FS_HEADER_LENGTH, HEADER_LENGTH};

pub(crate) const XTS_SECTOR_SIZE: u64 = 0x200;
pub(crate) const CTR_BLOCK_SIZE: u64 = 0x10;

/// What a section holds, derived from its fs/hash type pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SectionType {
    PartitionFs,
    RomFs,
    PatchRomFs,
    Nca0RomFs,
    Invalid,
}

/// Metadata of a section materialized through a sparse bucket table.
#[derive(Debug, Clone, Copy)]
pub struct SparseLayer {
    /// Absolute offset of the bucket table within the archive.
    pub table_offset: u64,
    pub table_size: u64,
    pub entry_count: u32,
    /// Upper counter half used when addressing the table.
    pub ctr_upper_iv: u64,
}

/// Why a section slot was disabled at initialization. These never fail the
/// archive; they are logged and the slot stays empty.
#[derive(Snafu, Debug)]
pub(super) enum SectionInitError {
    #[snafu(display("fs header hash mismatch"))]
    HeaderHashMismatch,
    #[snafu(display("failed to parse the fs header: {source}"))]
    HeaderParsing { source: binrw::Error },
    #[snafu(display(
        "range {offset:#x}+{size:#x} is invalid for an archive of {archive_size:#x} bytes"
    ))]
    RangeInvalid {
        offset: u64,
        size: u64,
        archive_size: u64,
    },
    #[snafu(display("unsupported fs/hash type combination"))]
    InvalidType,
    #[snafu(display("unresolvable encryption type"))]
    InvalidEncryption,
    #[snafu(display("no ticket resolves the title key"))]
    TitleKeyUnavailable,
    #[snafu(display("invalid sparse bucket table"))]
    InvalidSparseBucket,
}

#[derive(Debug)]
pub struct FsSection {
    pub(super) index: usize,
    pub(super) section_type: SectionType,
    pub(super) encryption: EncryptionType,
    /// Absolute offset and size within the archive, in bytes.
    pub(super) offset: u64,
    pub(super) size: u64,
    pub(super) ctr_upper_iv: u64,
    pub(super) sparse: Option<SparseLayer>,
    pub(super) ctr_key: AesKey,
    pub(super) xts_key: AesXtsKey,
    pub(super) header: NcaFsHeader,
    /// Decrypted on-disk form of the section header, kept in sync with
    /// `header` across mutations.
    pub(super) raw_header: [u8; FS_HEADER_LENGTH],
}

fn derive_section_type(version: NcaMagic, header: &NcaFsHeader) -> SectionType {
    match (header.fs_type, header.hash_type) {
        (FsType::PartitionFs, HashType::HierarchicalSha256) => SectionType::PartitionFs,
        (FsType::RomFs, HashType::HierarchicalSha256) if version == NcaMagic::Nca0 => {
            SectionType::Nca0RomFs
        }
        (FsType::RomFs, HashType::HierarchicalIntegrity) => {
            if header.patch_info.is_populated() {
                SectionType::PatchRomFs
            } else {
                SectionType::RomFs
            }
        }
        _ => SectionType::Invalid,
    }
}

impl FsSection {
    #[allow(clippy::too_many_arguments)]
    pub(super) fn build(
        index: usize,
        version: NcaMagic,
        entry: NcaFsEntry,
        raw_header: [u8; FS_HEADER_LENGTH],
        expected_hash: Sha256Hash,
        archive_size: u64,
        key_area: &KeyArea,
        title_key: Option<TitleKey>,
        rights_id_available: bool,
    ) -> Result<Self, SectionInitError> {
        if !expected_hash.matches(&raw_header) {
            return HeaderHashMismatchSnafu.fail();
        }
        let header = parse_fs_header(&raw_header).context(HeaderParsingSnafu)?;

        let offset = entry.offset();
        let size = entry.size();
        if offset < HEADER_LENGTH as u64 || size == 0 {
            return RangeInvalidSnafu {
                offset,
                size,
                archive_size,
            }
            .fail();
        }

        let section_type = derive_section_type(version, &header);
        if section_type == SectionType::Invalid {
            return InvalidTypeSnafu.fail();
        }

        let encryption = header.encryption_type;
        match encryption {
            EncryptionType::Auto => return InvalidEncryptionSnafu.fail(),
            EncryptionType::None | EncryptionType::AesXts => {}
            EncryptionType::AesCtr | EncryptionType::AesCtrEx => {
                if version == NcaMagic::Nca0 {
                    return InvalidEncryptionSnafu.fail();
                }
            }
        }

        let sparse = if header.exists_sparse_layer() {
            let info = &header.sparse_info;
            if !info.bucket.header.is_valid() {
                return InvalidSparseBucketSnafu.fail();
            }
            let table_offset = info
                .physical_offset
                .checked_add(info.bucket.offset)
                .ok_or(SectionInitError::InvalidSparseBucket)?;
            let table_end = table_offset
                .checked_add(info.bucket.size)
                .ok_or(SectionInitError::InvalidSparseBucket)?;
            if table_end > archive_size {
                return InvalidSparseBucketSnafu.fail();
            }
            Some(SparseLayer {
                table_offset,
                table_size: info.bucket.size,
                entry_count: info.bucket.header.entry_count,
                ctr_upper_iv: header.aes_ctr_upper_iv | (info.generation as u64) << 0x10,
            })
        } else {
            match offset.checked_add(size) {
                Some(end) if end <= archive_size => None,
                _ => {
                    return RangeInvalidSnafu {
                        offset,
                        size,
                        archive_size,
                    }
                    .fail()
                }
            }
        };

        let ctr_key = if rights_id_available
            && matches!(
                encryption,
                EncryptionType::AesCtr | EncryptionType::AesCtrEx
            ) {
            match title_key {
                Some(title_key) => title_key.as_aes_key(),
                None => return TitleKeyUnavailableSnafu.fail(),
            }
        } else {
            key_area.ctr_key()
        };

        Ok(Self {
            index,
            section_type,
            encryption,
            offset,
            size,
            ctr_upper_iv: header.aes_ctr_upper_iv,
            sparse,
            ctr_key,
            xts_key: key_area.xts_key(),
            header,
            raw_header,
        })
    }

    pub fn section_type(&self) -> SectionType {
        self.section_type
    }

    pub fn encryption(&self) -> EncryptionType {
        self.encryption
    }

    /// Absolute offset within the archive.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn is_sparse(&self) -> bool {
        self.sparse.is_some()
    }

    pub fn sparse_layer(&self) -> Option<&SparseLayer> {
        self.sparse.as_ref()
    }

    pub fn header(&self) -> &NcaFsHeader {
        &self.header
    }

    fn ctr(&self, content_offset: u64, ctr_val: Option<u32>) -> [u8; 0x10] {
        match ctr_val {
            Some(generation) => ctr_ex_iv(self.ctr_upper_iv, generation, content_offset),
            None => ctr_iv(self.ctr_upper_iv, content_offset),
        }
    }

    fn check_range(&self, offset: u64, len: usize) -> Result<(), NcaError> {
        match offset.checked_add(len as u64) {
            Some(end) if end <= self.size => Ok(()),
            _ => Err(NcaError::SectionRange {
                index: self.index,
                offset,
                size: len as u64,
            }),
        }
    }
}

fn align_down(value: u64, unit: u64) -> u64 {
    value - value % unit
}

fn align_up(value: u64, unit: u64) -> u64 {
    Integer::div_ceil(&value, &unit) * unit
}

impl<S: ReadableStorage> Nca<S> {
    /// Decrypted random-access read from a section.
    pub fn read_section(
        &self,
        index: usize,
        offset: u64,
        buf: &mut [u8],
    ) -> Result<(), NcaError> {
        let section = self.enabled_section(index)?;
        let mut staging = staging::acquire();
        self.read_section_inner(section, offset, buf, None, &mut staging)
    }

    /// The CTR-Ex bucket-table read: like [`Self::read_section`], but the
    /// given 32-bit generation value is mixed into the counter.
    pub fn read_section_with_ctr(
        &self,
        index: usize,
        offset: u64,
        buf: &mut [u8],
        ctr_val: u32,
    ) -> Result<(), NcaError> {
        let section = self.enabled_section(index)?;
        if section.encryption != EncryptionType::AesCtrEx {
            return Err(NcaError::CtrExRequired { index });
        }
        let mut staging = staging::acquire();
        self.read_section_inner(section, offset, buf, Some(ctr_val), &mut staging)
    }

    /// Re-encrypts `data` as it would appear at `offset` within the section,
    /// returning the ciphertext block together with its absolute position.
    pub fn encrypt_section_block(
        &self,
        index: usize,
        data: &[u8],
        offset: u64,
    ) -> Result<PatchBlock, NcaError> {
        let section = self.enabled_section(index)?;
        let mut staging = staging::acquire();
        self.encrypt_section_block_inner(section, data, offset, &mut staging)
    }

    pub(super) fn read_section_inner(
        &self,
        section: &FsSection,
        offset: u64,
        buf: &mut [u8],
        ctr_val: Option<u32>,
        staging: &mut StagingGuard,
    ) -> Result<(), NcaError> {
        if section.is_sparse() {
            return Err(NcaError::SparseSectionUnsupported {
                index: section.index,
            });
        }
        section.check_range(offset, buf.len())?;
        if buf.is_empty() {
            return Ok(());
        }

        let content_offset = section.offset + offset;
        match section.encryption {
            EncryptionType::None | EncryptionType::Auto => {
                self.storage.read(content_offset, buf).context(StorageSnafu)
            }
            EncryptionType::AesCtr | EncryptionType::AesCtrEx => {
                if content_offset % CTR_BLOCK_SIZE == 0 && buf.len() as u64 % CTR_BLOCK_SIZE == 0 {
                    self.storage
                        .read(content_offset, buf)
                        .context(StorageSnafu)?;
                    section
                        .ctr_key
                        .decrypt_ctr(buf, &section.ctr(content_offset, ctr_val));
                    Ok(())
                } else {
                    self.read_section_staged(
                        section,
                        content_offset,
                        buf,
                        CTR_BLOCK_SIZE,
                        ctr_val,
                        staging,
                    )
                }
            }
            EncryptionType::AesXts => {
                if content_offset % XTS_SECTOR_SIZE == 0 && buf.len() as u64 % XTS_SECTOR_SIZE == 0
                {
                    self.storage
                        .read(content_offset, buf)
                        .context(StorageSnafu)?;
                    section.xts_key.decrypt(
                        buf,
                        self.xts_payload_sector(section, content_offset) as usize,
                        XTS_SECTOR_SIZE as usize,
                    );
                    Ok(())
                } else {
                    self.read_section_staged(
                        section,
                        content_offset,
                        buf,
                        XTS_SECTOR_SIZE,
                        ctr_val,
                        staging,
                    )
                }
            }
        }
    }

    /// The unaligned path: reads the enclosing cipher-aligned span through the
    /// shared staging buffer, decrypts it there and copies the requested
    /// sub-range out. Spans larger than the staging buffer are processed in
    /// staging-sized chunks.
    fn read_section_staged(
        &self,
        section: &FsSection,
        mut content_offset: u64,
        buf: &mut [u8],
        unit: u64,
        ctr_val: Option<u32>,
        staging: &mut StagingGuard,
    ) -> Result<(), NcaError> {
        let staging_buf = staging.buffer();
        let mut filled = 0;
        while filled < buf.len() {
            let remaining = (buf.len() - filled) as u64;
            let span_start = align_down(content_offset, unit);
            let span_end = align_up(content_offset + remaining, unit);
            let span = std::cmp::min(span_end - span_start, STAGING_BUFFER_SIZE as u64) as usize;

            let chunk = &mut staging_buf[..span];
            self.storage.read(span_start, chunk).context(StorageSnafu)?;
            match section.encryption {
                EncryptionType::AesCtr | EncryptionType::AesCtrEx => section
                    .ctr_key
                    .decrypt_ctr(chunk, &section.ctr(span_start, ctr_val)),
                EncryptionType::AesXts => section.xts_key.decrypt(
                    chunk,
                    self.xts_payload_sector(section, span_start) as usize,
                    XTS_SECTOR_SIZE as usize,
                ),
                EncryptionType::None | EncryptionType::Auto => {}
            }

            let skip = (content_offset - span_start) as usize;
            let copy = std::cmp::min(span - skip, buf.len() - filled);
            buf[filled..filled + copy].copy_from_slice(&chunk[skip..skip + copy]);
            filled += copy;
            content_offset += copy as u64;
        }
        Ok(())
    }

    pub(super) fn encrypt_section_block_inner(
        &self,
        section: &FsSection,
        data: &[u8],
        offset: u64,
        staging: &mut StagingGuard,
    ) -> Result<PatchBlock, NcaError> {
        if section.is_sparse() {
            return Err(NcaError::SparseSectionUnsupported {
                index: section.index,
            });
        }
        section.check_range(offset, data.len())?;
        if data.is_empty() {
            return Err(NcaError::SectionRange {
                index: section.index,
                offset,
                size: 0,
            });
        }

        let content_offset = section.offset + offset;
        let unit = match section.encryption {
            EncryptionType::None | EncryptionType::Auto => 1,
            EncryptionType::AesCtr | EncryptionType::AesCtrEx => CTR_BLOCK_SIZE,
            EncryptionType::AesXts => XTS_SECTOR_SIZE,
        };

        if content_offset % unit == 0 && data.len() as u64 % unit == 0 {
            let mut out = data.to_vec();
            self.encrypt_in_place(section, &mut out, content_offset);
            return Ok(PatchBlock::new(content_offset, out));
        }

        // read the enclosing aligned span as plaintext, overlay, re-encrypt
        let span_start = align_down(content_offset, unit);
        let span_end = align_up(content_offset + data.len() as u64, unit);
        let mut out = vec![0; (span_end - span_start) as usize];
        self.read_section_inner(section, span_start - section.offset, &mut out, None, staging)?;

        let skip = (content_offset - span_start) as usize;
        out[skip..skip + data.len()].copy_from_slice(data);
        self.encrypt_in_place(section, &mut out, span_start);
        Ok(PatchBlock::new(span_start, out))
    }

    fn encrypt_in_place(&self, section: &FsSection, buf: &mut [u8], content_offset: u64) {
        match section.encryption {
            EncryptionType::None | EncryptionType::Auto => {}
            EncryptionType::AesCtr | EncryptionType::AesCtrEx => section
                .ctr_key
                .encrypt_ctr(buf, &section.ctr(content_offset, None)),
            EncryptionType::AesXts => section.xts_key.encrypt(
                buf,
                self.xts_payload_sector(section, content_offset) as usize,
                XTS_SECTOR_SIZE as usize,
            ),
        }
    }

    /// XTS sector number of a payload position. NCA0 numbers sectors across
    /// the whole archive (past the two header sectors); later formats number
    /// them within the section.
    fn xts_payload_sector(&self, section: &FsSection, content_offset: u64) -> u64 {
        match self.version {
            NcaMagic::Nca0 => (content_offset - HEADER_LENGTH as u64) / XTS_SECTOR_SIZE,
            _ => (content_offset - section.offset) / XTS_SECTOR_SIZE,
        }
    }
}
