use num_integer::Integer;
use snafu::ResultExt;

use crate::ids::ContentId;
use crate::storage::ReadableStorage;

use super::section::FsSection;
use super::staging::{self, StagingGuard};
use super::structs::{
    HashData, NcaFsHeader, Sha256Hash, INTEGRITY_LEVEL_COUNT, MAX_HASH_REGION_COUNT,
};
use super::{serialize_fs_header, HeaderSerializingSnafu, Nca, NcaError};

const HASH_SIZE: u64 = 0x20;

/// One ciphertext span that must overwrite its range of the archive.
#[derive(Debug)]
pub struct PatchBlock {
    offset: u64,
    data: Vec<u8>,
    written: bool,
}

impl PatchBlock {
    pub(super) fn new(offset: u64, data: Vec<u8>) -> Self {
        Self {
            offset,
            data,
            written: false,
        }
    }

    /// Absolute offset within the archive.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn size(&self) -> u64 {
        self.data.len() as u64
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn is_written(&self) -> bool {
        self.written
    }

    /// Overlays this block onto a buffer covering the archive range starting
    /// at `buf_offset`. Returns whether the block's tail has been consumed;
    /// once it has, further calls are no-ops.
    pub fn apply_to(&mut self, buf: &mut [u8], buf_offset: u64) -> bool {
        if self.written {
            return true;
        }

        let patch_end = self.offset + self.data.len() as u64;
        let buf_end = buf_offset + buf.len() as u64;
        if patch_end <= buf_offset || buf_end <= self.offset {
            return false;
        }

        let src = buf_offset.saturating_sub(self.offset) as usize;
        let dst = self.offset.saturating_sub(buf_offset) as usize;
        let len = std::cmp::min(self.data.len() - src, buf.len() - dst);
        buf[dst..dst + len].copy_from_slice(&self.data[src..src + len]);

        if src + len == self.data.len() {
            self.written = true;
        }
        self.written
    }
}

/// The patch set produced by a hash-tree patch: one ciphertext block per
/// layer, master layer first.
#[derive(Debug)]
pub struct HashTreePatch {
    content_id: ContentId,
    blocks: Vec<PatchBlock>,
}

impl HashTreePatch {
    pub fn content_id(&self) -> ContentId {
        self.content_id
    }

    pub fn blocks(&self) -> &[PatchBlock] {
        &self.blocks
    }

    pub fn blocks_mut(&mut self) -> &mut [PatchBlock] {
        &mut self.blocks
    }

    /// Applies every block to the given buffer range. Returns whether the
    /// whole patch set has been written out across this and previous calls.
    pub fn apply_to(&mut self, buf: &mut [u8], buf_offset: u64) -> bool {
        let mut written = true;
        for block in &mut self.blocks {
            written &= block.apply_to(buf, buf_offset);
        }
        written
    }

    pub fn is_written(&self) -> bool {
        self.blocks.iter().all(PatchBlock::is_written)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TreeKind {
    FlatSha256,
    Integrity,
}

#[derive(Debug, Clone, Copy)]
struct LayerInfo {
    /// Offset and size within the section.
    offset: u64,
    size: u64,
    /// Granularity at which this layer is hashed into its parent.
    block_size: u64,
}

fn resolve_layers(
    index: usize,
    header: &NcaFsHeader,
    section_size: u64,
) -> Result<(TreeKind, Vec<LayerInfo>), NcaError> {
    let check_bounds = |layer: &LayerInfo| {
        layer
            .offset
            .checked_add(layer.size)
            .map_or(false, |end| end <= section_size)
    };

    match &header.hash_data {
        HashData::HierarchicalSha256(data) => {
            let count = data.region_count as usize;
            if !(2..=MAX_HASH_REGION_COUNT).contains(&count) || data.block_size == 0 {
                return Err(NcaError::HashLayerGeometry { index });
            }
            let layers: Vec<LayerInfo> = data.regions[..count]
                .iter()
                .map(|region| LayerInfo {
                    offset: region.offset,
                    size: region.size,
                    block_size: data.block_size as u64,
                })
                .collect();
            if !layers.iter().all(check_bounds) {
                return Err(NcaError::HashLayerGeometry { index });
            }
            Ok((TreeKind::FlatSha256, layers))
        }
        HashData::HierarchicalIntegrity(meta) => {
            let mut layers = Vec::with_capacity(INTEGRITY_LEVEL_COUNT);
            for level in &meta.info_level_hash.levels {
                if level.block_order >= 0x20 {
                    return Err(NcaError::HashLayerGeometry { index });
                }
                let layer = LayerInfo {
                    offset: level.offset,
                    size: level.size,
                    block_size: 1u64 << level.block_order,
                };
                if !check_bounds(&layer) {
                    return Err(NcaError::HashLayerGeometry { index });
                }
                layers.push(layer);
            }
            Ok((TreeKind::Integrity, layers))
        }
        HashData::None => Err(NcaError::HashTreeMissing { index }),
    }
}

impl<S: ReadableStorage> Nca<S> {
    /// Rewrites `data` at `offset` of the section's data layer and returns
    /// the patch set covering every hash layer that must change with it.
    ///
    /// The section header's master hash and the archive header's fs-header
    /// hash slot are updated in place, leaving the header dirty.
    pub fn generate_hash_tree_patch(
        &mut self,
        index: usize,
        data: &[u8],
        offset: u64,
    ) -> Result<HashTreePatch, NcaError> {
        let mut staging = staging::acquire();
        let (blocks, master_hash) = {
            let section = self.enabled_section(index)?;
            if section.is_sparse() {
                return Err(NcaError::SparseSectionUnsupported { index });
            }
            let (kind, layers) = resolve_layers(index, &section.header, section.size)?;
            self.hash_tree_walk(section, kind, &layers, data, offset, &mut staging)?
        };

        let section = self.sections[index]
            .as_mut()
            .expect("BUG: patched section disappeared");
        match &mut section.header.hash_data {
            HashData::HierarchicalSha256(data) => data.master_hash = master_hash,
            HashData::HierarchicalIntegrity(meta) => meta.master_hash = master_hash,
            HashData::None => unreachable!("BUG: patched a section without a hash tree"),
        }
        section.raw_header =
            serialize_fs_header(&section.header).context(HeaderSerializingSnafu)?;
        self.header.fs_header_hashes[index] = Sha256Hash::of(&section.raw_header);
        self.mark_header_dirty();

        Ok(HashTreePatch {
            content_id: self.content_id,
            blocks,
        })
    }

    /// Walks the tree from the data layer up to the master layer. At every
    /// hash layer the enclosing block-aligned window is read, the promoted
    /// bytes overlaid, the parent's hash slots recomputed, and the mutated
    /// window re-encrypted into a patch block.
    fn hash_tree_walk(
        &self,
        section: &FsSection,
        kind: TreeKind,
        layers: &[LayerInfo],
        data: &[u8],
        offset: u64,
        staging: &mut StagingGuard,
    ) -> Result<(Vec<PatchBlock>, Sha256Hash), NcaError> {
        let index = section.index;
        let data_layer = layers.last().expect("BUG: empty layer list");
        let in_bounds = offset
            .checked_add(data.len() as u64)
            .map_or(false, |end| end <= data_layer.size);
        if data.is_empty() || !in_bounds {
            return Err(NcaError::SectionRange {
                index,
                offset,
                size: data.len() as u64,
            });
        }

        let mut blocks: Vec<Option<PatchBlock>> = Vec::new();
        blocks.resize_with(layers.len(), || None);

        let mut plain = data.to_vec();
        let mut plain_offset = offset;
        let mut master_hash = Sha256Hash::ZERO;

        for level in (0..layers.len()).rev() {
            let layer = &layers[level];
            if level > 0 {
                let block = layer.block_size;
                let first_block = plain_offset / block;
                let read_start = first_block * block;
                let padded_end =
                    Integer::div_ceil(&(plain_offset + plain.len() as u64), &block) * block;
                let read_end = std::cmp::min(padded_end, layer.size);
                if read_start >= read_end {
                    return Err(NcaError::HashLayerGeometry { index });
                }
                let read_size = (read_end - read_start) as usize;

                // zero-filled up to the block padding: integrity levels hash
                // whole blocks, with zeros past the end of the layer
                let mut cur = vec![0; (padded_end - read_start) as usize];
                self.read_section_inner(
                    section,
                    layer.offset + read_start,
                    &mut cur[..read_size],
                    None,
                    staging,
                )?;
                let overlay_at = (plain_offset - read_start) as usize;
                cur[overlay_at..overlay_at + plain.len()].copy_from_slice(&plain);

                let parent = &layers[level - 1];
                let hash_count = Integer::div_ceil(&(read_size as u64), &block);
                let parent_start = first_block * HASH_SIZE;
                let parent_size = hash_count * HASH_SIZE;
                let parent_in_bounds = parent_start
                    .checked_add(parent_size)
                    .map_or(false, |end| end <= parent.size);
                if !parent_in_bounds {
                    return Err(NcaError::HashLayerGeometry { index });
                }

                let mut parent_buf = vec![0; parent_size as usize];
                self.read_section_inner(
                    section,
                    parent.offset + parent_start,
                    &mut parent_buf,
                    None,
                    staging,
                )?;

                for slot in 0..hash_count as usize {
                    let block_start = slot * block as usize;
                    let hashed = match kind {
                        // a flat tree's final partial block hashes only its
                        // valid bytes
                        TreeKind::FlatSha256 => {
                            std::cmp::min(block as usize, read_size - block_start)
                        }
                        TreeKind::Integrity => block as usize,
                    };
                    let digest = Sha256Hash::of(&cur[block_start..block_start + hashed]);
                    parent_buf[slot * HASH_SIZE as usize..][..HASH_SIZE as usize]
                        .copy_from_slice(&digest.0 .0);
                }

                blocks[level] = Some(self.encrypt_section_block_inner(
                    section,
                    &cur[..read_size],
                    layer.offset + read_start,
                    staging,
                )?);

                plain = parent_buf;
                plain_offset = parent_start;
            } else {
                // master layer: the whole span is read and rehashed into the
                // section header
                let mut cur = vec![0; layer.size as usize];
                self.read_section_inner(section, layer.offset, &mut cur, None, staging)?;
                let overlay_at = plain_offset as usize;
                cur[overlay_at..overlay_at + plain.len()].copy_from_slice(&plain);
                master_hash = Sha256Hash::of(&cur);

                blocks[0] = Some(self.encrypt_section_block_inner(
                    section,
                    &cur,
                    layer.offset,
                    staging,
                )?);
            }
        }

        let blocks = blocks
            .into_iter()
            .map(|block| block.expect("BUG: layer left without a patch block"))
            .collect();
        Ok((blocks, master_hash))
    }
}
