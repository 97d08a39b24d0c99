use crate::read_le16;
use crate::read_le32;
use crate::read_lei32;

/// Bytes of the superblock we decode; everything after `s_desc_size` is ignored.
pub const SUPERBLOCK_DECODED_LEN: usize = 0x100;

/// Bytes of a group descriptor in the classic (32-bit) layout.
pub const GROUP_DESC_BASE_LEN: usize = 0x20;

/// Bytes of a group descriptor carrying the `_hi` halves.
pub const GROUP_DESC_LONG_LEN: usize = 0x40;

/// The fields of an inode every revision has.
pub const INODE_BASE_LEN: usize = 0x80;

pub const BLOCK_POINTERS: usize = 15;

pub struct RawSuperBlock {
    /* Inodes count */
    pub s_inodes_count: u32,
    /* Blocks count */
    pub s_blocks_count: u32,
    /* Reserved blocks count */
    pub s_r_blocks_count: u32,
    /* Free blocks count */
    pub s_free_blocks_count: u32,
    /* Free inodes count */
    pub s_free_inodes_count: u32,
    /* First Data Block */
    pub s_first_data_block: u32,
    /* Block size */
    pub s_log_block_size: u32,
    /* # Blocks per group */
    pub s_blocks_per_group: u32,
    /* # Inodes per group */
    pub s_inodes_per_group: u32,
    /* Mount time */
    pub s_mtime: u32,
    /* Write time */
    pub s_wtime: u32,
    /* Mount count */
    pub s_mnt_count: u16,
    /* Magic signature */
    pub s_magic: u16,
    /* File system state */
    pub s_state: u16,
    /* Behaviour when detecting errors */
    pub s_errors: u16,
    /* minor revision level */
    pub s_minor_rev_level: u16,
    /* OS */
    pub s_creator_os: u32,
    /* Revision level */
    pub s_rev_level: u32,
    /* First non-reserved inode */
    pub s_first_ino: u32,
    /* size of inode structure */
    pub s_inode_size: u16,
    /* compatible feature set */
    pub s_feature_compat: u32,
    /* incompatible feature set */
    pub s_feature_incompat: u32,
    /* readonly-compatible feature set */
    pub s_feature_ro_compat: u32,
    /* 128-bit uuid for volume */
    pub s_uuid: [u8; 16],
    /* volume name */
    pub s_volume_name: [u8; 16],
    /* size of group descriptor */
    pub s_desc_size: u16,
}

impl RawSuperBlock {
    /// `data` must hold at least `SUPERBLOCK_DECODED_LEN` bytes.
    pub fn from_slice(data: &[u8]) -> Self {
        let mut s_uuid = [0u8; 16];
        s_uuid.copy_from_slice(&data[0x68..0x78]);
        let mut s_volume_name = [0u8; 16];
        s_volume_name.copy_from_slice(&data[0x78..0x88]);

        Self {
            s_inodes_count: read_le32(&data[0x00..]),
            s_blocks_count: read_le32(&data[0x04..]),
            s_r_blocks_count: read_le32(&data[0x08..]),
            s_free_blocks_count: read_le32(&data[0x0c..]),
            s_free_inodes_count: read_le32(&data[0x10..]),
            s_first_data_block: read_le32(&data[0x14..]),
            s_log_block_size: read_le32(&data[0x18..]),
            s_blocks_per_group: read_le32(&data[0x20..]),
            s_inodes_per_group: read_le32(&data[0x28..]),
            s_mtime: read_le32(&data[0x2c..]),
            s_wtime: read_le32(&data[0x30..]),
            s_mnt_count: read_le16(&data[0x34..]),
            s_magic: read_le16(&data[0x38..]),
            s_state: read_le16(&data[0x3a..]),
            s_errors: read_le16(&data[0x3c..]),
            s_minor_rev_level: read_le16(&data[0x3e..]),
            s_creator_os: read_le32(&data[0x48..]),
            s_rev_level: read_le32(&data[0x4c..]),
            s_first_ino: read_le32(&data[0x54..]),
            s_inode_size: read_le16(&data[0x58..]),
            s_feature_compat: read_le32(&data[0x5c..]),
            s_feature_incompat: read_le32(&data[0x60..]),
            s_feature_ro_compat: read_le32(&data[0x64..]),
            s_uuid,
            s_volume_name,
            s_desc_size: read_le16(&data[0xfe..]),
        }
    }
}

pub struct RawGroupDesc {
    /* Blocks bitmap block */
    pub bg_block_bitmap_lo: u32,
    /* Inodes bitmap block */
    pub bg_inode_bitmap_lo: u32,
    /* Inodes table block */
    pub bg_inode_table_lo: u32,
    /* Free blocks count */
    pub bg_free_blocks_count_lo: u16,
    /* Free inodes count */
    pub bg_free_inodes_count_lo: u16,
    /* Directories count */
    pub bg_used_dirs_count_lo: u16,
    /* Blocks bitmap block MSB */
    pub bg_block_bitmap_hi: Option<u32>,
    /* Inodes bitmap block MSB */
    pub bg_inode_bitmap_hi: Option<u32>,
    /* Inodes table block MSB */
    pub bg_inode_table_hi: Option<u32>,
}

impl RawGroupDesc {
    /// `data` is one whole descriptor; the `_hi` halves are only read from long ones.
    pub fn from_slice(data: &[u8]) -> Self {
        let long = data.len() >= GROUP_DESC_LONG_LEN;
        Self {
            bg_block_bitmap_lo: read_le32(&data[0x00..]),
            bg_inode_bitmap_lo: read_le32(&data[0x04..]),
            bg_inode_table_lo: read_le32(&data[0x08..]),
            bg_free_blocks_count_lo: read_le16(&data[0x0c..]),
            bg_free_inodes_count_lo: read_le16(&data[0x0e..]),
            bg_used_dirs_count_lo: read_le16(&data[0x10..]),
            bg_block_bitmap_hi: if long {
                Some(read_le32(&data[0x20..]))
            } else {
                None
            },
            bg_inode_bitmap_hi: if long {
                Some(read_le32(&data[0x24..]))
            } else {
                None
            },
            bg_inode_table_hi: if long {
                Some(read_le32(&data[0x28..]))
            } else {
                None
            },
        }
    }
}

pub struct RawInode {
    /* File mode */
    pub i_mode: u16,
    /* Low 16 bits of Owner Uid */
    pub i_uid: u16,
    /* Size in bytes */
    pub i_size_lo: u32,
    /* Access time */
    pub i_atime: i32,
    /* Inode Change time */
    pub i_ctime: i32,
    /* Modification time */
    pub i_mtime: i32,
    /* Deletion Time */
    pub i_dtime: i32,
    /* Low 16 bits of Group Id */
    pub i_gid: u16,
    /* Links count */
    pub i_links_count: u16,
    /* 512-byte sectors count */
    pub i_blocks_lo: u32,
    /* File flags */
    pub i_flags: u32,
    /* Pointers to blocks */
    pub i_block: [u32; BLOCK_POINTERS],
    /* File version (for NFS) */
    pub i_generation: u32,
    /* Extended attribute block */
    pub i_file_acl: u32,
    pub i_size_high: u32,
    pub l_i_uid_high: u16,
    pub l_i_gid_high: u16,
    pub i_extra_isize: u16,
    /* extra Change time      (nsec << 2 | epoch) */
    pub i_ctime_extra: Option<u32>,
    /* extra Modification time(nsec << 2 | epoch) */
    pub i_mtime_extra: Option<u32>,
    /* extra Access time      (nsec << 2 | epoch) */
    pub i_atime_extra: Option<u32>,
    /* File Creation time */
    pub i_crtime: Option<i32>,
    /* extra FileCreationtime (nsec << 2 | epoch) */
    pub i_crtime_extra: Option<u32>,
}

impl RawInode {
    /// `data` is the whole on-disc record, at least `INODE_BASE_LEN` bytes.
    pub fn from_slice(data: &[u8]) -> Self {
        let mut i_block = [0u32; BLOCK_POINTERS];
        for (i, ptr) in i_block.iter_mut().enumerate() {
            *ptr = read_le32(&data[0x28 + i * 4..]);
        }

        // the extra fields are only there if the record is big enough to hold them
        let i_extra_isize = if data.len() >= INODE_BASE_LEN + 2 {
            read_le16(&data[0x80..])
        } else {
            0
        };
        let extra_end = std::cmp::min(
            INODE_BASE_LEN + usize::from(i_extra_isize),
            data.len(),
        );
        let has = |end: usize| extra_end >= end;

        Self {
            i_mode: read_le16(&data[0x00..]),
            i_uid: read_le16(&data[0x02..]),
            i_size_lo: read_le32(&data[0x04..]),
            i_atime: read_lei32(&data[0x08..]),
            i_ctime: read_lei32(&data[0x0c..]),
            i_mtime: read_lei32(&data[0x10..]),
            i_dtime: read_lei32(&data[0x14..]),
            i_gid: read_le16(&data[0x18..]),
            i_links_count: read_le16(&data[0x1a..]),
            i_blocks_lo: read_le32(&data[0x1c..]),
            i_flags: read_le32(&data[0x20..]),
            i_block,
            i_generation: read_le32(&data[0x64..]),
            i_file_acl: read_le32(&data[0x68..]),
            i_size_high: read_le32(&data[0x6c..]),
            l_i_uid_high: read_le16(&data[0x78..]),
            l_i_gid_high: read_le16(&data[0x7a..]),
            i_extra_isize,
            i_ctime_extra: if has(0x88) {
                Some(read_le32(&data[0x84..]))
            } else {
                None
            },
            i_mtime_extra: if has(0x8c) {
                Some(read_le32(&data[0x88..]))
            } else {
                None
            },
            i_atime_extra: if has(0x90) {
                Some(read_le32(&data[0x8c..]))
            } else {
                None
            },
            i_crtime: if has(0x94) {
                Some(read_lei32(&data[0x90..]))
            } else {
                None
            },
            i_crtime_extra: if has(0x98) {
                Some(read_le32(&data[0x94..]))
            } else {
                None
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::RawInode;
    use super::RawSuperBlock;

    #[test]
    fn superblock_offsets() {
        let mut data = vec![0u8; 1024];
        data[0x00..0x04].copy_from_slice(&64u32.to_le_bytes());
        data[0x18..0x1c].copy_from_slice(&2u32.to_le_bytes());
        data[0x38..0x3a].copy_from_slice(&0xEF53u16.to_le_bytes());
        data[0x58..0x5a].copy_from_slice(&256u16.to_le_bytes());
        data[0x78..0x7c].copy_from_slice(b"root");

        let raw = RawSuperBlock::from_slice(&data);
        assert_eq!(64, raw.s_inodes_count);
        assert_eq!(2, raw.s_log_block_size);
        assert_eq!(0xEF53, raw.s_magic);
        assert_eq!(256, raw.s_inode_size);
        assert_eq!(b"root", &raw.s_volume_name[..4]);
    }

    #[test]
    fn short_inode_has_no_extra() {
        let mut data = vec![0u8; 128];
        data[0x28..0x2c].copy_from_slice(&77u32.to_le_bytes());
        data[0x60..0x64].copy_from_slice(&99u32.to_le_bytes());

        let raw = RawInode::from_slice(&data);
        assert_eq!(77, raw.i_block[0]);
        assert_eq!(99, raw.i_block[14]);
        assert_eq!(0, raw.i_extra_isize);
        assert_eq!(None, raw.i_ctime_extra);
        assert_eq!(None, raw.i_crtime);
    }

    #[test]
    fn extra_fields_respect_isize() {
        let mut data = vec![0u8; 256];
        data[0x80..0x82].copy_from_slice(&16u16.to_le_bytes());
        data[0x84..0x88].copy_from_slice(&4u32.to_le_bytes());
        data[0x90..0x94].copy_from_slice(&1234i32.to_le_bytes());

        let raw = RawInode::from_slice(&data);
        assert_eq!(Some(4), raw.i_ctime_extra);
        assert!(raw.i_atime_extra.is_some());
        // 0x80 + 16 stops short of the creation time
        assert_eq!(None, raw.i_crtime);
    }
}
