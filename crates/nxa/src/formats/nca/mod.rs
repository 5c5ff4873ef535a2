mod header;
mod key_area;
mod patch;
mod section;
mod staging;
pub mod structs;


use binrw::{BinRead, BinWrite};
use snafu::{ResultExt, Snafu};
use std::io::Cursor;
use tracing::warn;

use crate::crypto::keyset::{KeyProvider, MissingKeyError, TicketProvider};
use crate::crypto::{AesXtsKey, TitleKey};
use crate::ids::{ContentId, RightsId};
use crate::storage::{ReadableStorage, ReadableStorageExt, SharedStorage, StorageError};

use crate::formats::nca::structs::{ContentType, NcaFsHeader, NcaHeader, NcaMagic, Sha256Hash};

pub use key_area::KeyArea;
pub use patch::{HashTreePatch, PatchBlock};
pub use section::{FsSection, SectionType, SparseLayer};
pub use staging::release_staging_buffer;

/// Length of the archive header. NCA0 keeps only this much at offset 0.
pub const HEADER_LENGTH: usize = 0x400;
/// Length of one section header.
pub const FS_HEADER_LENGTH: usize = 0x200;
/// Archive header plus the four contiguous section headers (NCA2/NCA3).
pub const FULL_HEADER_LENGTH: usize = 0xc00;
pub const MAX_SECTION_COUNT: usize = 4;

pub(crate) const HEADER_SECTOR_SIZE: usize = 0x200;

#[derive(Snafu, Debug)]
pub enum NcaError {
    /// NCA: failed to read from the storage
    Storage { source: StorageError },
    /// NCA: missing a crypto key
    MissingKey { source: MissingKeyError },
    /// NCA: no ticket resolves a title key for rights id {rights_id}
    MissingTitleKey { rights_id: RightsId },
    /// NCA: failed to parse the NCA header
    NcaHeaderParsing { source: binrw::Error },
    /// NCA: failed to re-serialize a header
    HeaderSerializing { source: binrw::Error },
    /// NCA: declared content size {declared:#x} does not match the storage size {actual:#x}
    ContentSizeMismatch { declared: u64, actual: u64 },
    /// NCA: the archive ({size:#x} bytes) cannot hold its headers ({required:#x} bytes)
    TruncatedArchive { size: u64, required: u64 },
    /// NCA: section {index} is absent or was disabled at initialization
    SectionDisabled { index: usize },
    /// NCA: range {offset:#x}+{size:#x} is out of bounds for section {index}
    SectionRange { index: usize, offset: u64, size: u64 },
    /// NCA: section {index} is sparse, which this operation does not support
    SparseSectionUnsupported { index: usize },
    /// NCA: section {index} is not AES-CTR-Ex encrypted
    CtrExRequired { index: usize },
    /// NCA: section {index} carries no patchable hash tree
    HashTreeMissing { index: usize },
    /// NCA: the hash-tree geometry of section {index} is inconsistent
    HashLayerGeometry { index: usize },
    /// NCA: the main header signature did not verify
    InvalidMainSignature,
}

/// Where the archive physically lives. Ticket lookup wants to know whether
/// that medium is removable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageKind {
    GameCard,
    BuiltInSystem,
    BuiltInUser,
    SdCard,
}

impl StorageKind {
    pub fn is_removable(&self) -> bool {
        matches!(self, StorageKind::GameCard | StorageKind::SdCard)
    }
}

/// A content archive opened over a block reader.
///
/// Construction decrypts and validates the header envelope; afterwards the
/// layout is immutable. Reads take `&self` and are safe to issue from
/// multiple threads against distinct archives (they share only the staging
/// buffer); mutations (`generate_hash_tree_patch`, the header helpers) take
/// `&mut self` and are thereby serialized per archive.
#[derive(Debug)]
pub struct Nca<S: ReadableStorage> {
    storage: SharedStorage<S>,
    storage_kind: StorageKind,
    content_id: ContentId,
    size: u64,
    version: NcaMagic,
    /// `max(key_generation, key_generation_old)`.
    key_generation: u8,
    rights_id_available: bool,
    title_key: Option<TitleKey>,
    /// Kept for re-encryption.
    header_key: AesXtsKey,
    header: NcaHeader,
    header_hash: Sha256Hash,
    /// Decrypted on-disk bytes of all four section-header slots as read at
    /// initialization. Enabled sections carry their own up-to-date copy.
    raw_fs_headers: [[u8; FS_HEADER_LENGTH]; MAX_SECTION_COUNT],
    decrypted_key_area: key_area::KeyArea,
    sections: [Option<FsSection>; MAX_SECTION_COUNT],
    /// The as-on-disk header image, spliced into outbound buffers by
    /// [`Nca::apply_header_to`].
    encrypted_header: Vec<PatchBlock>,
    header_dirty: bool,
    /// Set when `encrypted_header` no longer reflects `header`.
    header_image_stale: bool,
    main_signature_valid: bool,
}

pub(crate) fn parse_nca_header(data: &[u8; HEADER_LENGTH]) -> Result<NcaHeader, binrw::Error> {
    let mut cur = Cursor::new(&data[..]);
    let header = NcaHeader::read(&mut cur)?;
    assert_eq!(cur.position(), HEADER_LENGTH as u64);
    Ok(header)
}

pub(crate) fn parse_fs_header(data: &[u8; FS_HEADER_LENGTH]) -> Result<NcaFsHeader, binrw::Error> {
    let mut cur = Cursor::new(&data[..]);
    let header = NcaFsHeader::read(&mut cur)?;
    assert_eq!(cur.position(), FS_HEADER_LENGTH as u64);
    Ok(header)
}

pub(crate) fn serialize_nca_header(header: &NcaHeader) -> Result<[u8; HEADER_LENGTH], binrw::Error> {
    let mut cur = Cursor::new(Vec::with_capacity(HEADER_LENGTH));
    header.write(&mut cur)?;
    let data = cur.into_inner();
    assert_eq!(data.len(), HEADER_LENGTH);
    Ok(data.try_into().expect("BUG: header length mismatch"))
}

pub(crate) fn serialize_fs_header(
    header: &NcaFsHeader,
) -> Result<[u8; FS_HEADER_LENGTH], binrw::Error> {
    let mut cur = Cursor::new(Vec::with_capacity(FS_HEADER_LENGTH));
    header.write(&mut cur)?;
    let data = cur.into_inner();
    assert_eq!(data.len(), FS_HEADER_LENGTH);
    Ok(data.try_into().expect("BUG: fs header length mismatch"))
}

impl<S: ReadableStorage> Nca<S> {
    pub fn new(
        keys: &dyn KeyProvider,
        tickets: &dyn TicketProvider,
        storage: S,
        storage_kind: StorageKind,
        content_id: ContentId,
    ) -> Result<Self, NcaError> {
        let size = storage.get_size();
        if size < HEADER_LENGTH as u64 {
            return Err(NcaError::TruncatedArchive {
                size,
                required: HEADER_LENGTH as u64,
            });
        }

        let header_key = keys.header_key().context(MissingKeySnafu)?;

        let mut encrypted_archive_header = [0; HEADER_LENGTH];
        storage
            .read(0, &mut encrypted_archive_header)
            .context(StorageSnafu)?;

        let mut header_data = encrypted_archive_header;
        header_key.decrypt(&mut header_data, 0, HEADER_SECTOR_SIZE);
        let header = parse_nca_header(&header_data).context(NcaHeaderParsingSnafu)?;
        let version = header.magic;

        if header.content_size != size {
            return Err(NcaError::ContentSizeMismatch {
                declared: header.content_size,
                actual: size,
            });
        }
        let required = match version {
            NcaMagic::Nca0 => HEADER_LENGTH,
            _ => FULL_HEADER_LENGTH,
        } as u64;
        if size < required {
            return Err(NcaError::TruncatedArchive { size, required });
        }

        let key_generation = header.effective_key_generation();
        let header_hash = Sha256Hash::of(&header_data);
        let rights_id_available = header.has_rights_id();

        let main_signature_valid = header::verify_main_signature(keys, &header, &header_data);
        if !main_signature_valid {
            warn!("main header signature of {} did not verify", content_id);
        }

        let title_key = if rights_id_available {
            let title_key = tickets.title_key(&header.rights_id, storage_kind.is_removable());
            if title_key.is_none() {
                warn!(
                    "no ticket for rights id {} of {}",
                    header.rights_id, content_id
                );
            }
            title_key
        } else {
            None
        };

        // rights-id crypto bypasses the key area entirely
        let decrypted_key_area = if rights_id_available {
            key_area::KeyArea::ZERO
        } else {
            key_area::decrypt_key_area(keys, &header, key_generation)?
        };

        // read and decrypt the four section-header slots
        let mut raw_fs_headers = [[0; FS_HEADER_LENGTH]; MAX_SECTION_COUNT];
        let mut encrypted_fs_region = Vec::new();
        match version {
            NcaMagic::Nca2 | NcaMagic::Nca3 => {
                let mut region = [0; FULL_HEADER_LENGTH - HEADER_LENGTH];
                storage
                    .read(HEADER_LENGTH as u64, &mut region)
                    .context(StorageSnafu)?;
                encrypted_fs_region.extend_from_slice(&region);
                for (index, chunk) in region.chunks_exact_mut(FS_HEADER_LENGTH).enumerate() {
                    // NCA2 encrypts every section header as its own sector 0
                    let sector = match version {
                        NcaMagic::Nca3 => 2 + index,
                        _ => 0,
                    };
                    header_key.decrypt(chunk, sector, HEADER_SECTOR_SIZE);
                    raw_fs_headers[index].copy_from_slice(chunk);
                }
            }
            NcaMagic::Nca0 => {
                // NCA0 keeps each section header at the section's start
                // sector, encrypted with the key-area XTS pair and numbered
                // across the whole archive
                let xts_key = decrypted_key_area.xts_key();
                for (index, entry) in header.fs_entries.iter().enumerate() {
                    if entry.is_empty()
                        || entry.offset() < HEADER_LENGTH as u64
                        || entry.offset() + FS_HEADER_LENGTH as u64 > size
                    {
                        continue;
                    }
                    let mut chunk = [0; FS_HEADER_LENGTH];
                    storage
                        .read(entry.offset(), &mut chunk)
                        .context(StorageSnafu)?;
                    let sector = (entry.start_sector - 2) as usize;
                    xts_key.decrypt(&mut chunk, sector, HEADER_SECTOR_SIZE);
                    raw_fs_headers[index] = chunk;
                }
            }
        }

        // build the section contexts; a structural problem disables its slot
        // and nothing else
        let mut sections: [Option<FsSection>; MAX_SECTION_COUNT] = [None, None, None, None];
        for index in 0..MAX_SECTION_COUNT {
            let entry = header.fs_entries[index];
            if entry.is_empty() {
                continue;
            }
            match FsSection::build(
                index,
                version,
                entry,
                raw_fs_headers[index],
                header.fs_header_hashes[index],
                size,
                &decrypted_key_area,
                title_key,
                rights_id_available,
            ) {
                Ok(section) => sections[index] = Some(section),
                Err(reason) => warn!("disabling section {} of {}: {}", index, content_id, reason),
            }
        }

        // the original on-disk header image, ready for splicing
        let encrypted_header = match version {
            NcaMagic::Nca0 => {
                let mut spans = vec![PatchBlock::new(0, encrypted_archive_header.to_vec())];
                for section in sections.iter().flatten() {
                    let mut data = [0; FS_HEADER_LENGTH];
                    storage
                        .read(section.offset(), &mut data)
                        .context(StorageSnafu)?;
                    spans.push(PatchBlock::new(section.offset(), data.to_vec()));
                }
                spans
            }
            _ => {
                let mut image = Vec::with_capacity(FULL_HEADER_LENGTH);
                image.extend_from_slice(&encrypted_archive_header);
                image.extend_from_slice(&encrypted_fs_region);
                vec![PatchBlock::new(0, image)]
            }
        };

        Ok(Self {
            storage: storage.shared(),
            storage_kind,
            content_id,
            size,
            version,
            key_generation,
            rights_id_available,
            title_key,
            header_key,
            header,
            header_hash,
            raw_fs_headers,
            decrypted_key_area,
            sections,
            encrypted_header,
            header_dirty: false,
            header_image_stale: false,
            main_signature_valid,
        })
    }

    pub fn content_id(&self) -> ContentId {
        self.content_id
    }

    pub fn storage_kind(&self) -> StorageKind {
        self.storage_kind
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn version(&self) -> NcaMagic {
        self.version
    }

    pub fn content_type(&self) -> ContentType {
        self.header.content_type
    }

    /// The effective key generation.
    pub fn key_generation(&self) -> u8 {
        self.key_generation
    }

    pub fn has_rights_id(&self) -> bool {
        self.rights_id_available
    }

    pub fn header(&self) -> &NcaHeader {
        &self.header
    }

    /// SHA-256 of the plaintext archive header as read at initialization.
    pub fn header_hash(&self) -> Sha256Hash {
        self.header_hash
    }

    pub fn key_area(&self) -> &KeyArea {
        &self.decrypted_key_area
    }

    pub fn section(&self, index: usize) -> Option<&FsSection> {
        self.sections.get(index).and_then(Option::as_ref)
    }

    pub fn enabled_section_count(&self) -> usize {
        self.sections.iter().flatten().count()
    }

    pub fn is_header_dirty(&self) -> bool {
        self.header_dirty
    }

    /// Result of the main-signature check performed at initialization. A
    /// mismatch never fails construction; callers decide the policy.
    pub fn main_signature_valid(&self) -> bool {
        self.main_signature_valid
    }

    pub fn require_valid_main_signature(&self) -> Result<(), NcaError> {
        if self.main_signature_valid {
            Ok(())
        } else {
            Err(NcaError::InvalidMainSignature)
        }
    }

    pub(crate) fn enabled_section(&self, index: usize) -> Result<&FsSection, NcaError> {
        self.sections
            .get(index)
            .and_then(Option::as_ref)
            .ok_or(NcaError::SectionDisabled { index })
    }
}
