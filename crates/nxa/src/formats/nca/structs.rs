use crate::crypto::keyset::KeyAreaKeyIndex;
use crate::hexstring::HexData;
use crate::ids::{ProgramId, RightsId};
use binrw::{BinRead, BinWrite};
use std::fmt::Debug;

/// Sections are addressed in units of media sectors.
pub const SECTOR_SIZE: u64 = 0x200;

pub const BUCKET_TABLE_MAGIC: &[u8; 4] = b"BKTR";
pub const BUCKET_TABLE_VERSION: u32 = 1;

pub const MAX_HASH_REGION_COUNT: usize = 5;
pub const INTEGRITY_LEVEL_COUNT: usize = 6;

#[derive(Debug, Clone, Copy, PartialEq, Eq, BinRead, BinWrite)]
#[brw(repr = u8)]
pub enum DistributionType {
    Download,
    GameCard,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, BinRead, BinWrite)]
#[brw(repr = u8)]
pub enum ContentType {
    Program,
    Meta,
    Control,
    Manual,
    Data,
    PublicData,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, BinRead, BinWrite)]
#[brw(repr = u8)]
pub enum FsType {
    RomFs,
    PartitionFs,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, BinRead, BinWrite)]
#[brw(repr = u8)]
pub enum HashType {
    Auto,
    None,
    HierarchicalSha256,
    HierarchicalIntegrity,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, BinRead, BinWrite)]
#[brw(repr = u8)]
pub enum EncryptionType {
    Auto,
    None,
    AesXts,
    AesCtr,
    AesCtrEx,
}

/// The three supported archive formats, identified by the header magic.
#[derive(Debug, Clone, Copy, Eq, PartialEq, BinRead, BinWrite)]
pub enum NcaMagic {
    #[brw(magic = b"NCA0")]
    Nca0,
    #[brw(magic = b"NCA2")]
    Nca2,
    #[brw(magic = b"NCA3")]
    Nca3,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, BinRead, BinWrite)]
pub struct NcaSignature(pub HexData<0x100>);

#[repr(transparent)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, BinRead, BinWrite)]
pub struct Sha256Hash(pub HexData<0x20>);

impl Sha256Hash {
    pub const ZERO: Self = Sha256Hash(HexData::ZERO);

    pub fn of(data: &[u8]) -> Self {
        Sha256Hash(HexData(crate::crypto::sha256(data)))
    }

    pub fn matches(&self, data: &[u8]) -> bool {
        crate::crypto::sha256(data) == self.0 .0
    }
}

/// One slot of the section table. All-zero means the slot is unoccupied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, BinRead, BinWrite)]
pub struct NcaFsEntry {
    pub start_sector: u32,
    pub end_sector: u32,
    pub reserved: HexData<0x8>,
}

impl NcaFsEntry {
    pub fn is_empty(&self) -> bool {
        self.start_sector == 0 && self.end_sector == 0 && self.reserved.is_zero()
    }

    pub fn offset(&self) -> u64 {
        self.start_sector as u64 * SECTOR_SIZE
    }

    pub fn size(&self) -> u64 {
        (self.end_sector as u64).saturating_sub(self.start_sector as u64) * SECTOR_SIZE
    }
}

/// The in-header key area: four 16-byte slots.
///
/// Slot 0/1 form the XTS pair, slot 2 is the CTR key, slot 3 nominally
/// belongs to CTR-Ex (which in practice is keyed from slot 2 as well).
#[derive(Debug, Clone, Copy, PartialEq, Eq, BinRead, BinWrite)]
pub struct NcaKeyArea {
    pub slots: [HexData<0x10>; 4],
}

impl NcaKeyArea {
    pub fn to_bytes(&self) -> [u8; 0x40] {
        let mut out = [0; 0x40];
        for (slot, chunk) in self.slots.iter().zip(out.chunks_exact_mut(0x10)) {
            chunk.copy_from_slice(&slot.0);
        }
        out
    }
}

/// Archive header, the first 0x400 bytes of the decrypted archive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, BinRead, BinWrite)]
#[brw(little)]
pub struct NcaHeader {
    pub main_signature: NcaSignature,
    pub acid_signature: NcaSignature,
    pub magic: NcaMagic,
    pub distribution_type: DistributionType,
    pub content_type: ContentType,
    pub key_generation_old: u8,
    pub kaek_index: KeyAreaKeyIndex,
    pub content_size: u64,
    pub program_id: ProgramId,
    pub content_index: u32,
    pub sdk_version: u32,
    pub key_generation: u8,
    #[brw(pad_after = 0xe)]
    pub main_signature_key_generation: u8,
    pub rights_id: RightsId,
    pub fs_entries: [NcaFsEntry; 4],
    pub fs_header_hashes: [Sha256Hash; 4],
    #[brw(pad_after = 0xc0)]
    pub encrypted_key_area: NcaKeyArea,
}

impl NcaHeader {
    pub fn effective_key_generation(&self) -> u8 {
        std::cmp::max(self.key_generation, self.key_generation_old)
    }

    pub fn has_rights_id(&self) -> bool {
        !self.rights_id.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, BinRead, BinWrite)]
pub struct HashRegion {
    pub offset: u64,
    pub size: u64,
}

/// The flat-SHA256 tree: a single block size and an ordered list of regions,
/// the last of which is the data layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, BinRead, BinWrite)]
pub struct HierarchicalSha256Data {
    pub master_hash: Sha256Hash,
    pub block_size: u32,
    pub region_count: u32,
    pub regions: [HashRegion; MAX_HASH_REGION_COUNT],
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, BinRead, BinWrite)]
pub struct IntegrityLevelInfo {
    pub offset: u64,
    pub size: u64,
    /// Block size of this level is `1 << block_order`.
    #[brw(pad_after = 0x4)]
    pub block_order: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, BinRead, BinWrite)]
pub struct InfoLevelHash {
    pub max_level_count: u32,
    pub levels: [IntegrityLevelInfo; INTEGRITY_LEVEL_COUNT],
    pub signature_salt: HexData<0x20>,
}

/// The hierarchical integrity tree: exactly six levels, the last of which is
/// the data layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, BinRead, BinWrite)]
#[brw(magic = b"IVFC")]
pub struct IntegrityMetaInfo {
    pub version: u32,
    pub master_hash_size: u32,
    pub info_level_hash: InfoLevelHash,
    pub master_hash: Sha256Hash,
}

/// The hash-data union inside the section header, selected by the hash type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, BinRead, BinWrite)]
#[br(import(hash_type: HashType))]
pub enum HashData {
    #[br(pre_assert(hash_type == HashType::None))]
    None,
    #[br(pre_assert(hash_type == HashType::HierarchicalSha256))]
    HierarchicalSha256(HierarchicalSha256Data),
    #[br(pre_assert(hash_type == HashType::HierarchicalIntegrity))]
    HierarchicalIntegrity(IntegrityMetaInfo),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, BinRead, BinWrite)]
pub struct BucketTableHeader {
    pub magic: HexData<0x4>,
    pub version: u32,
    #[brw(pad_after = 0x4)]
    pub entry_count: u32,
}

impl BucketTableHeader {
    pub fn is_valid(&self) -> bool {
        &self.magic.0 == BUCKET_TABLE_MAGIC
            && self.version == BUCKET_TABLE_VERSION
            && self.entry_count > 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, BinRead, BinWrite)]
pub struct NcaBucketInfo {
    pub offset: u64,
    pub size: u64,
    pub header: BucketTableHeader,
}

impl NcaBucketInfo {
    pub fn is_empty(&self) -> bool {
        self.offset == 0 && self.size == 0
    }
}

/// Bucket tables of a patch section: the indirect table and the AES-CTR-Ex
/// generation table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, BinRead, BinWrite)]
pub struct PatchInfo {
    pub indirect_bucket: NcaBucketInfo,
    pub aes_ctr_ex_bucket: NcaBucketInfo,
}

impl PatchInfo {
    pub fn is_populated(&self) -> bool {
        !self.indirect_bucket.is_empty() && !self.aes_ctr_ex_bucket.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, BinRead, BinWrite)]
pub struct SparseInfo {
    pub bucket: NcaBucketInfo,
    pub physical_offset: u64,
    #[brw(pad_after = 0x6)]
    pub generation: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, BinRead, BinWrite)]
pub struct CompressionInfo {
    #[brw(pad_after = 0x8)]
    pub bucket: NcaBucketInfo,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, BinRead, BinWrite)]
pub struct MetaDataHashDataInfo {
    pub offset: u64,
    pub size: u64,
    pub hash: Sha256Hash,
}

/// Section header, 0x200 bytes on disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, BinRead, BinWrite)]
#[brw(little)]
pub struct NcaFsHeader {
    pub version: u16,
    pub fs_type: FsType,
    pub hash_type: HashType,
    pub encryption_type: EncryptionType,
    #[brw(pad_after = 0x2)]
    pub metadata_hash_type: u8,

    #[br(args(hash_type))]
    #[brw(pad_size_to = 0xf8)]
    pub hash_data: HashData,

    #[brw(pad_size_to = 0x40)]
    pub patch_info: PatchInfo,

    pub aes_ctr_upper_iv: u64,

    #[brw(pad_size_to = 0x30)]
    pub sparse_info: SparseInfo,

    #[brw(pad_size_to = 0x28)]
    pub compression_info: CompressionInfo,

    #[brw(pad_size_to = 0x30)]
    #[brw(pad_after = 0x30)]
    pub metadata_hash_data_info: MetaDataHashDataInfo,
}

impl NcaFsHeader {
    pub fn exists_sparse_layer(&self) -> bool {
        self.sparse_info.generation != 0
    }
}

#[cfg(test)]
impl NcaHeader {
    /// A zeroed header for tests.
    pub(crate) fn test_blank(magic: NcaMagic) -> Self {
        NcaHeader {
            main_signature: NcaSignature(HexData::ZERO),
            acid_signature: NcaSignature(HexData::ZERO),
            magic,
            distribution_type: DistributionType::Download,
            content_type: ContentType::Program,
            key_generation_old: 0,
            kaek_index: KeyAreaKeyIndex::Application,
            content_size: 0,
            program_id: ProgramId(0),
            content_index: 0,
            sdk_version: 0,
            key_generation: 0,
            main_signature_key_generation: 0,
            rights_id: RightsId::from([0; 0x10]),
            fs_entries: [NcaFsEntry {
                start_sector: 0,
                end_sector: 0,
                reserved: HexData::ZERO,
            }; 4],
            fs_header_hashes: [Sha256Hash::ZERO; 4],
            encrypted_key_area: NcaKeyArea {
                slots: [HexData::ZERO; 4],
            },
        }
    }
}
