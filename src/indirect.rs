use std::convert::TryFrom;

use anyhow::anyhow;
use anyhow::Context;
use anyhow::Error;
use log::trace;
use positioned_io::ReadAt;

use crate::raw::BLOCK_POINTERS;
use crate::read_le32;
use crate::zeroed;
use crate::ParseError;

/// Pointers held in the inode itself, before any indirection.
pub const DIRECT_BLOCKS: usize = 12;

/// Deepest chain of pointer blocks: triple-indirect.
pub const MAX_DEPTH: usize = 3;

/// The inode's fifteen pointer slots.
///
/// Zero, in any slot or pointer block, is a hole, never a block number.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BlockMap {
    pub direct: [u32; DIRECT_BLOCKS],
    pub indirect: u32,
    pub double_indirect: u32,
    pub triple_indirect: u32,
}

impl BlockMap {
    pub fn from_slots(slots: [u32; BLOCK_POINTERS]) -> BlockMap {
        let mut direct = [0u32; DIRECT_BLOCKS];
        direct.copy_from_slice(&slots[..DIRECT_BLOCKS]);
        BlockMap {
            direct,
            indirect: slots[12],
            double_indirect: slots[13],
            triple_indirect: slots[14],
        }
    }

    /// The slots as they sit on disc; fast symlinks keep their target here.
    pub fn to_bytes(&self) -> [u8; 4 * BLOCK_POINTERS] {
        let mut ret = [0u8; 4 * BLOCK_POINTERS];
        let indirect = [self.indirect, self.double_indirect, self.triple_indirect];
        for (chunk, slot) in ret
            .chunks_exact_mut(4)
            .zip(self.direct.iter().chain(indirect.iter()))
        {
            chunk.copy_from_slice(&slot.to_le_bytes());
        }
        ret
    }

    fn root(&self, depth: usize) -> u32 {
        match depth {
            1 => self.indirect,
            2 => self.double_indirect,
            _ => self.triple_indirect,
        }
    }
}

/// Where a logical block's pointer lives.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum BlockPath {
    /// In the inode, at this slot.
    Direct(usize),
    /// Behind `depth` pointer blocks; `indices[..depth]` picks the entry in each, top first.
    Indirect { depth: usize, indices: [u32; MAX_DEPTH] },
}

impl BlockPath {
    pub fn for_logical(logical: u64, block_size: u32) -> Result<BlockPath, ParseError> {
        let per_block = entries_per_block(block_size);

        if logical < DIRECT_BLOCKS as u64 {
            return Ok(BlockPath::Direct(logical as usize));
        }

        let mut block = logical - DIRECT_BLOCKS as u64;
        let mut span = per_block;
        for depth in 1..=MAX_DEPTH {
            if block < span {
                let mut indices = [0u32; MAX_DEPTH];
                let mut rest = block;
                for index in indices[..depth].iter_mut().rev() {
                    // each index is below per_block, which is at most 1024
                    *index = (rest % per_block) as u32;
                    rest /= per_block;
                }
                return Ok(BlockPath::Indirect { depth, indices });
            }
            block -= span;
            span *= per_block;
        }

        Err(ParseError::UnsupportedOffset { block: logical })
    }

    pub fn indices(&self) -> &[u32] {
        match self {
            BlockPath::Direct(_) => &[],
            BlockPath::Indirect { depth, indices } => &indices[..*depth],
        }
    }
}

/// The outcome of resolving a logical block.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Resolved {
    /// Nothing allocated; reads as zeros.
    Hole,
    /// Data lives in this (non-zero) block.
    Physical(u32),
}

impl Resolved {
    fn from_pointer(pointer: u32) -> Resolved {
        if 0 == pointer {
            Resolved::Hole
        } else {
            Resolved::Physical(pointer)
        }
    }

    /// The block number, with the on-disc convention of zero for a hole.
    pub fn physical(self) -> u32 {
        match self {
            Resolved::Hole => 0,
            Resolved::Physical(block) => block,
        }
    }

    pub fn is_hole(self) -> bool {
        Resolved::Hole == self
    }
}

/// Block numbers stored in one pointer block.
pub fn entries_per_block(block_size: u32) -> u64 {
    u64::from(block_size / 4)
}

/// How many logical blocks the direct, indirect, double and triple tiers can address, together.
pub fn max_logical_blocks(block_size: u32) -> u64 {
    let e = entries_per_block(block_size);
    DIRECT_BLOCKS as u64 + e + e * e + e * e * e
}

/// Map a logical block to its physical block.
///
/// Direct blocks need no I/O. Otherwise one pointer block is read per level,
/// stopping at the first zero pointer, which makes the whole subtree a hole.
/// Nothing is cached between calls.
pub fn resolve<R>(
    inner: &R,
    map: &BlockMap,
    logical: u64,
    block_size: u32,
) -> Result<Resolved, Error>
where
    R: ReadAt + ?Sized,
{
    let (depth, indices) = match BlockPath::for_logical(logical, block_size)? {
        BlockPath::Direct(slot) => return Ok(Resolved::from_pointer(map.direct[slot])),
        BlockPath::Indirect { depth, indices } => (depth, indices),
    };

    let mut pointer = map.root(depth);
    for &index in &indices[..depth] {
        if 0 == pointer {
            trace!("logical block {} is a hole (depth {})", logical, depth);
            return Ok(Resolved::Hole);
        }

        pointer = read_pointer(inner, pointer, index, block_size).with_context(|| {
            anyhow!(
                "reading pointer block {} for logical block {}",
                pointer,
                logical
            )
        })?;
    }

    trace!("logical block {} -> {}", logical, pointer);
    Ok(Resolved::from_pointer(pointer))
}

/// Entry `index` of pointer block `block`.
fn read_pointer<R>(inner: &R, block: u32, index: u32, block_size: u32) -> Result<u32, Error>
where
    R: ReadAt + ?Sized,
{
    let mut data = zeroed(usize::try_from(block_size)?)?;
    inner.read_exact_at(u64::from(block) * u64::from(block_size), &mut data)?;
    let at = usize::try_from(index)? * 4;
    Ok(read_le32(&data[at..]))
}
