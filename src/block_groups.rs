use anyhow::anyhow;
use anyhow::ensure;
use anyhow::Context;
use anyhow::Error;
use positioned_io::ReadAt;

use crate::assumption_failed;
use crate::not_found;
use crate::raw::RawGroupDesc;
use crate::zeroed;

/// One block group's descriptor.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GroupDesc {
    pub block_bitmap: u64,
    pub inode_bitmap: u64,
    pub inode_table: u64,
    pub free_blocks_count: u16,
    pub free_inodes_count: u16,
    pub used_dirs_count: u16,
}

impl GroupDesc {
    fn from_raw(raw: RawGroupDesc) -> GroupDesc {
        let join = |lo: u32, hi: Option<u32>| u64::from(lo) | (u64::from(hi.unwrap_or(0)) << 32);
        GroupDesc {
            block_bitmap: join(raw.bg_block_bitmap_lo, raw.bg_block_bitmap_hi),
            inode_bitmap: join(raw.bg_inode_bitmap_lo, raw.bg_inode_bitmap_hi),
            inode_table: join(raw.bg_inode_table_lo, raw.bg_inode_table_hi),
            free_blocks_count: raw.bg_free_blocks_count_lo,
            free_inodes_count: raw.bg_free_inodes_count_lo,
            used_dirs_count: raw.bg_used_dirs_count_lo,
        }
    }
}

/// Where the group descriptors are, and how inodes are spread over the groups.
///
/// Descriptors are read one at a time, when an inode in their group is wanted.
#[derive(Debug)]
pub struct BlockGroups {
    table_offset: u64,
    desc_size: u16,
    inodes_per_group: u32,
    pub count: u32,
    pub inodes_count: u32,
    pub blocks_count: u64,
    pub block_size: u32,
    pub inode_size: u16,
}

impl BlockGroups {
    pub fn new(
        count: u32,
        desc_size: u16,
        inodes_per_group: u32,
        inodes_count: u32,
        blocks_count: u64,
        block_size: u32,
        inode_size: u16,
    ) -> BlockGroups {
        let table_offset = if 1024 == block_size {
            // for 1k blocks, the table is in the third block, after:
            1024   // boot sector
            + 1024 // superblock
        } else {
            // for other blocks, the boot sector is in the first 1k of the first block,
            // followed by the superblock (also in first block), and the group table is afterwards
            u64::from(block_size)
        };

        BlockGroups {
            table_offset,
            desc_size,
            inodes_per_group,
            count,
            inodes_count,
            blocks_count,
            block_size,
            inode_size,
        }
    }

    pub fn descriptor<R>(&self, inner: &R, group: u32) -> Result<GroupDesc, Error>
    where
        R: ReadAt + ?Sized,
    {
        ensure!(
            group < self.count,
            not_found(format!(
                "block group {} is out of range; there are {}",
                group, self.count
            ))
        );

        let offset = self.table_offset + u64::from(group) * u64::from(self.desc_size);
        let mut data = zeroed(usize::from(self.desc_size))?;
        inner
            .read_exact_at(offset, &mut data)
            .with_context(|| anyhow!("reading descriptor of block group {}", group))?;

        Ok(GroupDesc::from_raw(RawGroupDesc::from_slice(&data)))
    }

    /// The byte offset of an inode's record, after checking the number is usable.
    pub fn index_of<R>(&self, inner: &R, inode: u32) -> Result<u64, Error>
    where
        R: ReadAt + ?Sized,
    {
        ensure!(0 != inode, not_found("there is no inode zero"));
        ensure!(
            inode <= self.inodes_count,
            not_found(format!(
                "inode <{}> is beyond the inode count, {}",
                inode, self.inodes_count
            ))
        );

        let index = inode - 1;
        let group_number = index / self.inodes_per_group;
        let inode_index_in_group = index % self.inodes_per_group;
        ensure!(
            group_number < self.count,
            not_found(format!(
                "inode <{}> would be in group {}, but there are only {}",
                inode, group_number, self.count
            ))
        );

        let group = self.descriptor(inner, group_number)?;
        ensure!(
            0 != group.inode_table && group.inode_table < self.blocks_count,
            assumption_failed(format!(
                "group {} has its inode table at block {}, outside 1..{}",
                group_number, group.inode_table, self.blocks_count
            ))
        );

        let table_bytes = group.inode_table * u64::from(self.block_size);
        Ok(table_bytes + u64::from(inode_index_in_group) * u64::from(self.inode_size))
    }
}
