use anyhow::anyhow;
use anyhow::ensure;
use anyhow::Context;
use anyhow::Error;
use bitflags::bitflags;
use log::debug;
use log::warn;
use positioned_io::ReadAt;

use crate::assumption_failed;
use crate::block_groups::BlockGroups;
use crate::indirect::BlockMap;
use crate::raw;
use crate::raw::RawInode;
use crate::raw::RawSuperBlock;
use crate::unsupported_feature;
use crate::FileType;
use crate::Inode;
use crate::InodeFlags;
use crate::Options;
use crate::Stat;
use crate::StateCheck;
use crate::SuperBlock;
use crate::Time;

const SUPERBLOCK_OFFSET: u64 = 1024;
const SUPERBLOCK_LEN: usize = 1024;
const EXT2_SUPER_MAGIC: u16 = 0xEF53;
const GOOD_OLD_REV: u32 = 0;
const GOOD_OLD_INODE_SIZE: u16 = 128;

bitflags! {
    struct IncompatibleFeature: u32 {
       const COMPRESSION = 0x0001;
       const FILETYPE    = 0x0002;
       const RECOVER     = 0x0004; /* Needs recovery */
       const JOURNAL_DEV = 0x0008; /* Journal device */
       const META_BG     = 0x0010;
       const EXTENTS     = 0x0040; /* extents support */
       const SIXTY_FOUR  = 0x0080;
       const MMP         = 0x0100;
       const FLEX_BG     = 0x0200;
       const EA_INODE    = 0x0400; /* EA in inode */
       const DIRDATA     = 0x1000; /* data in dirent */
       const CSUM_SEED   = 0x2000;
       const LARGEDIR    = 0x4000; /* >2GB or 3-lvl htree */
       const INLINE_DATA = 0x8000; /* data in inode */
       const ENCRYPT     = 0x10000;
    }
}

pub fn superblock<R>(inner: R, options: &Options) -> Result<SuperBlock<R>, Error>
where
    R: ReadAt,
{
    let mut data = [0u8; SUPERBLOCK_LEN];
    inner
        .read_exact_at(SUPERBLOCK_OFFSET, &mut data)
        .with_context(|| anyhow!("reading superblock"))?;
    let raw = RawSuperBlock::from_slice(&data[..raw::SUPERBLOCK_DECODED_LEN]);

    ensure!(
        EXT2_SUPER_MAGIC == raw.s_magic,
        assumption_failed(format!("invalid magic number: {:x}", raw.s_magic))
    );

    let block_size: u32 = match raw.s_log_block_size {
        0 => 1024,
        1 => 2048,
        2 => 4096,
        _ => {
            return Err(assumption_failed(format!(
                "unexpected block size: 2^{}",
                u64::from(raw.s_log_block_size) + 10
            ))
            .into());
        }
    };

    ensure!(
        0 != raw.s_blocks_per_group,
        assumption_failed("blocks per group cannot be zero")
    );
    ensure!(
        0 != raw.s_inodes_per_group,
        assumption_failed("inodes per group cannot be zero")
    );

    let inode_size = if GOOD_OLD_REV == raw.s_rev_level {
        GOOD_OLD_INODE_SIZE
    } else {
        raw.s_inode_size
    };
    ensure!(
        inode_size >= GOOD_OLD_INODE_SIZE
            && inode_size.is_power_of_two()
            && u32::from(inode_size) <= block_size,
        assumption_failed(format!(
            "inode size {} must be a power of two between {} and the block size, {}",
            inode_size, GOOD_OLD_INODE_SIZE, block_size
        ))
    );

    let incompatible_features = if GOOD_OLD_REV == raw.s_rev_level {
        IncompatibleFeature::empty()
    } else {
        IncompatibleFeature::from_bits(raw.s_feature_incompat).ok_or_else(|| {
            unsupported_feature(format!(
                "completely unsupported incompatible feature flag: {:b}",
                raw.s_feature_incompat
            ))
        })?
    };

    let supported_incompatible_features = IncompatibleFeature::FILETYPE
        | IncompatibleFeature::RECOVER
        | IncompatibleFeature::EXTENTS
        | IncompatibleFeature::FLEX_BG
        | IncompatibleFeature::SIXTY_FOUR;

    ensure!(
        !incompatible_features.intersects(!supported_incompatible_features),
        unsupported_feature(format!(
            "some unsupported incompatible feature flags: {:?}",
            incompatible_features & !supported_incompatible_features
        ))
    );

    if incompatible_features.contains(IncompatibleFeature::RECOVER) {
        warn!("the journal needs recovery; reading without replaying it");
    }

    let desc_size = if incompatible_features.contains(IncompatibleFeature::SIXTY_FOUR) {
        ensure!(
            usize::from(raw.s_desc_size) >= raw::GROUP_DESC_BASE_LEN
                && u32::from(raw.s_desc_size) <= block_size,
            assumption_failed(format!(
                "group descriptor size {} out of range",
                raw.s_desc_size
            ))
        );
        raw.s_desc_size
    } else {
        raw::GROUP_DESC_BASE_LEN as u16
    };

    check_state(raw.s_state, options.state_check)?;

    let blocks_count = u64::from(raw.s_blocks_count);
    let first_data_block = u64::from(raw.s_first_data_block);
    ensure!(
        blocks_count > first_data_block,
        assumption_failed(format!(
            "{} blocks, but data starts at block {}",
            blocks_count, first_data_block
        ))
    );

    let blocks_per_group = u64::from(raw.s_blocks_per_group);
    // a partial last group is still a group
    let group_count = (blocks_count - first_data_block + blocks_per_group - 1) / blocks_per_group;

    debug!(
        "ext2 rev {}.{}: {} byte blocks, {} blocks, {} inodes of {} bytes, {} groups",
        raw.s_rev_level,
        raw.s_minor_rev_level,
        block_size,
        blocks_count,
        raw.s_inodes_count,
        inode_size,
        group_count
    );
    debug!(
        "created by os {}, state {:b}, errors {}, features compat {:x} ro {:x}",
        raw.s_creator_os, raw.s_state, raw.s_errors, raw.s_feature_compat, raw.s_feature_ro_compat
    );
    debug!(
        "{} free blocks ({} reserved), {} free inodes, first inode {}, mounted {} times, last at {}, written at {}",
        raw.s_free_blocks_count,
        raw.s_r_blocks_count,
        raw.s_free_inodes_count,
        raw.s_first_ino,
        raw.s_mnt_count,
        raw.s_mtime,
        raw.s_wtime
    );

    let groups = BlockGroups::new(
        // never more groups than blocks, and blocks_count came from a u32
        group_count as u32,
        desc_size,
        raw.s_inodes_per_group,
        raw.s_inodes_count,
        blocks_count,
        block_size,
        inode_size,
    );

    let volume_name = raw
        .s_volume_name
        .split(|&b| 0 == b)
        .next()
        .map(|name| String::from_utf8_lossy(name).into_owned())
        .unwrap_or_default();

    Ok(SuperBlock {
        inner,
        groups,
        volume_name,
        uuid: raw.s_uuid,
    })
}

fn check_state(s_state: u16, check: StateCheck) -> Result<(), Error> {
    const S_STATE_UNMOUNTED_CLEANLY: u16 = 0b01;
    const S_STATE_ERRORS_DETECTED: u16 = 0b10;

    let clean = s_state & S_STATE_UNMOUNTED_CLEANLY != 0 && s_state & S_STATE_ERRORS_DETECTED == 0;
    if clean {
        return Ok(());
    }

    match check {
        StateCheck::Ignore => {}
        StateCheck::Warn => warn!(
            "filesystem is not in a clean state: {:b}; contents may be stale",
            s_state
        ),
        StateCheck::Require => {
            return Err(assumption_failed(format!(
                "filesystem is not in a clean state: {:b}",
                s_state
            ))
            .into())
        }
    }

    Ok(())
}

/// Decode an inode record; `data` is the whole record, as long as the superblock says.
pub fn inode(data: &[u8], number: u32) -> Result<Inode, Error> {
    ensure!(
        data.len() >= raw::INODE_BASE_LEN,
        assumption_failed(format!("inode record of only {} bytes", data.len()))
    );

    let raw = RawInode::from_slice(data);

    let stat = Stat {
        extracted_type: FileType::from_mode(raw.i_mode),
        file_mode: raw.i_mode & 0b111_111_111_111,
        uid: u32::from(raw.i_uid) | (u32::from(raw.l_i_uid_high) << 16),
        gid: u32::from(raw.i_gid) | (u32::from(raw.l_i_gid_high) << 16),
        size: u64::from(raw.i_size_lo) | (u64::from(raw.i_size_high) << 32),
        atime: Time::from_extra(raw.i_atime, raw.i_atime_extra),
        ctime: Time::from_extra(raw.i_ctime, raw.i_ctime_extra),
        mtime: Time::from_extra(raw.i_mtime, raw.i_mtime_extra),
        dtime: if 0 == raw.i_dtime {
            None
        } else {
            Some(i64::from(raw.i_dtime))
        },
        btime: raw
            .i_crtime
            .map(|epoch_secs| Time::from_extra(epoch_secs, raw.i_crtime_extra)),
        link_count: raw.i_links_count,
        sectors: raw.i_blocks_lo,
        xattr_block: raw.i_file_acl,
    };

    debug!(
        "inode <{}> generation {}, {} extra bytes",
        number, raw.i_generation, raw.i_extra_isize
    );

    Ok(Inode {
        stat,
        number,
        flags: InodeFlags::from_bits_truncate(raw.i_flags),
        blocks: BlockMap::from_slots(raw.i_block),
    })
}

#[cfg(test)]
mod tests {
    use super::inode;
    use crate::FileType;
    use crate::InodeFlags;

    #[test]
    fn regular_file_record() {
        let mut data = vec![0u8; 128];
        data[0x00..0x02].copy_from_slice(&0o100_644u16.to_le_bytes());
        data[0x04..0x08].copy_from_slice(&5u32.to_le_bytes());
        data[0x6c..0x70].copy_from_slice(&1u32.to_le_bytes());
        data[0x1c..0x20].copy_from_slice(&2u32.to_le_bytes());
        data[0x28..0x2c].copy_from_slice(&40u32.to_le_bytes());
        data[0x58..0x5c].copy_from_slice(&41u32.to_le_bytes());
        data[0x5c..0x60].copy_from_slice(&42u32.to_le_bytes());
        data[0x60..0x64].copy_from_slice(&43u32.to_le_bytes());
        data[0x68..0x6c].copy_from_slice(&44u32.to_le_bytes());

        let parsed = inode(&data, 12).unwrap();
        assert_eq!(Some(FileType::RegularFile), parsed.stat.extracted_type);
        assert_eq!(0o644, parsed.stat.file_mode);
        assert_eq!((1 << 32) + 5, parsed.stat.size);
        assert_eq!(None, parsed.stat.dtime);
        assert!(parsed.stat.btime.is_none());
        assert_eq!(40, parsed.block_map().direct[0]);
        assert_eq!(41, parsed.block_map().indirect);
        assert_eq!(42, parsed.block_map().double_indirect);
        assert_eq!(43, parsed.block_map().triple_indirect);
        assert_eq!(44, parsed.stat.xattr_block);
        assert!(!parsed.is_fast_symlink(1024));
    }

    fn symlink(target: &[u8], sectors: u32, xattr_block: u32) -> Vec<u8> {
        let mut data = vec![0u8; 128];
        data[0x00..0x02].copy_from_slice(&0o120_777u16.to_le_bytes());
        data[0x04..0x08].copy_from_slice(&(target.len() as u32).to_le_bytes());
        data[0x1c..0x20].copy_from_slice(&sectors.to_le_bytes());
        data[0x28..0x28 + target.len()].copy_from_slice(target);
        data[0x68..0x6c].copy_from_slice(&xattr_block.to_le_bytes());
        data
    }

    #[test]
    fn fast_symlinks() {
        let plain = inode(&symlink(b"/etc/passwd", 0, 0), 13).unwrap();
        assert!(plain.is_fast_symlink(1024));

        // the attribute block is all the sectors account for
        let labelled = inode(&symlink(b"/etc/passwd", 8, 300), 13).unwrap();
        assert!(labelled.is_fast_symlink(4096));
        assert!(!labelled.is_fast_symlink(1024));

        let slow = inode(&symlink(b"/etc/passwd", 2, 0), 13).unwrap();
        assert!(!slow.is_fast_symlink(1024));
    }

    #[test]
    fn unused_inode_has_no_type() {
        let data = vec![0u8; 256];
        let parsed = inode(&data, 3).unwrap();
        assert_eq!(None, parsed.stat.extracted_type);
        assert_eq!(0, parsed.stat.size);
    }

    #[test]
    fn flags_survive() {
        let mut data = vec![0u8; 128];
        data[0x20..0x24].copy_from_slice(&0x0008_0000u32.to_le_bytes());
        let parsed = inode(&data, 3).unwrap();
        assert!(parsed.flags.contains(InodeFlags::EXTENTS));
    }

    #[test]
    fn truncated_record() {
        assert!(inode(&[0u8; 100], 3).is_err());
    }
}
