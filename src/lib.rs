/*!
This crate reads ext2 filesystem images, letting you pull the full content
of a file out of one by inode number, without mounting anything.

# Example

```rust,no_run
let image = std::fs::File::open("disk.img").unwrap();
let superblock = ext2extract::SuperBlock::new(image).unwrap();
let inode = superblock.load_inode(12).unwrap();
let stdout = std::io::stdout();
superblock.extract(&inode, stdout.lock()).unwrap();
```

Only the classic direct / indirect / double-indirect / triple-indirect
block mapping is understood. Files using extents are refused.
*/

use std::convert::TryFrom;
use std::io;

use anyhow::anyhow;
use anyhow::ensure;
use anyhow::Context;
use anyhow::Error;
use bitflags::bitflags;
use byteorder::{ByteOrder, LittleEndian};
use derivative::Derivative;
use log::debug;
use positioned_io::ReadAt;

mod block_groups;
mod raw;
mod reconstruct;

/// Logical to physical block resolution through the inode's pointer table.
pub mod indirect;

/// Raw object parsing API. Not versioned / supported.
pub mod parse;

pub use crate::block_groups::GroupDesc;
pub use crate::indirect::BlockMap;
pub use crate::indirect::BlockPath;
pub use crate::indirect::Resolved;

#[derive(Debug, thiserror::Error)]
pub enum ParseError {
    /// The filesystem doesn't meet the code's expectations;
    /// maybe the code is wrong, maybe the filesystem is corrupt.
    #[error("assumption failed: {reason:?}")]
    AssumptionFailed { reason: String },

    /// The filesystem is valid, but requests a feature the code doesn't support.
    #[error("filesystem uses an unsupported feature: {reason:?}")]
    UnsupportedFeature { reason: String },

    /// The request is for something which we are sure is not there.
    #[error("not found: {reason:?}")]
    NotFound { reason: String },

    /// The file is bigger than the triple-indirect scheme can address.
    #[error("logical block {block} is beyond the triple-indirect range")]
    UnsupportedOffset { block: u64 },

    /// A transient buffer couldn't be allocated.
    #[error("failed to allocate {bytes} bytes")]
    ResourceExhausted { bytes: usize },
}

fn assumption_failed<S: ToString>(reason: S) -> ParseError {
    ParseError::AssumptionFailed {
        reason: reason.to_string(),
    }
}

fn unsupported_feature<S: ToString>(reason: S) -> ParseError {
    ParseError::UnsupportedFeature {
        reason: reason.to_string(),
    }
}

fn not_found<S: ToString>(reason: S) -> ParseError {
    ParseError::NotFound {
        reason: reason.to_string(),
    }
}

/// How a failure should be reported to a user; each has its own exit status.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Reading the image or writing the output failed.
    Io,
    /// Bad magic, unsupported block size or feature, or corrupt metadata.
    InvalidFilesystem,
    /// Couldn't allocate a buffer.
    ResourceExhausted,
    /// Inode zero, past the inode count, or in a group that doesn't exist.
    InvalidInode,
    /// The file's size needs blocks beyond the triple-indirect range.
    UnsupportedOffset,
}

impl ErrorCategory {
    /// Classify by the first domain or I/O error in the chain.
    pub fn of(error: &Error) -> ErrorCategory {
        for cause in error.chain() {
            if let Some(parse) = cause.downcast_ref::<ParseError>() {
                return match parse {
                    ParseError::AssumptionFailed { .. } | ParseError::UnsupportedFeature { .. } => {
                        ErrorCategory::InvalidFilesystem
                    }
                    ParseError::NotFound { .. } => ErrorCategory::InvalidInode,
                    ParseError::UnsupportedOffset { .. } => ErrorCategory::UnsupportedOffset,
                    ParseError::ResourceExhausted { .. } => ErrorCategory::ResourceExhausted,
                };
            }

            if cause.downcast_ref::<io::Error>().is_some() {
                return ErrorCategory::Io;
            }
        }

        ErrorCategory::InvalidFilesystem
    }

    pub fn exit_code(self) -> i32 {
        match self {
            ErrorCategory::Io => 1,
            ErrorCategory::InvalidFilesystem => 2,
            ErrorCategory::ResourceExhausted => 3,
            ErrorCategory::InvalidInode => 4,
            ErrorCategory::UnsupportedOffset => 5,
        }
    }
}

bitflags! {
    pub struct InodeFlags: u32 {
        const SECRM        = 0x0000_0001; /* Secure deletion */
        const UNRM         = 0x0000_0002; /* Undelete */
        const COMPR        = 0x0000_0004; /* Compress file */
        const SYNC         = 0x0000_0008; /* Synchronous updates */
        const IMMUTABLE    = 0x0000_0010; /* Immutable file */
        const APPEND       = 0x0000_0020; /* writes to file may only append */
        const NODUMP       = 0x0000_0040; /* do not dump file */
        const NOATIME      = 0x0000_0080; /* do not update atime */
        const DIRTY        = 0x0000_0100; /* reserved for compression */
        const COMPRBLK     = 0x0000_0200; /* One or more compressed clusters */
        const NOCOMPR      = 0x0000_0400; /* Don't compress */
        const ENCRYPT      = 0x0000_0800; /* encrypted file */
        const INDEX        = 0x0000_1000; /* hash-indexed directory */
        const IMAGIC       = 0x0000_2000; /* AFS directory */
        const JOURNAL_DATA = 0x0000_4000; /* file data should be journaled */
        const NOTAIL       = 0x0000_8000; /* file tail should not be merged */
        const DIRSYNC      = 0x0001_0000; /* dirsync behaviour (directories only) */
        const TOPDIR       = 0x0002_0000; /* Top of directory hierarchies*/
        const HUGE_FILE    = 0x0004_0000; /* Set to each huge file */
        const EXTENTS      = 0x0008_0000; /* Inode uses extents */
        const EA_INODE     = 0x0020_0000; /* Inode used for large EA */
        const EOFBLOCKS    = 0x0040_0000; /* Blocks allocated beyond EOF */
        const INLINE_DATA  = 0x1000_0000; /* Inode has inline data. */
        const PROJINHERIT  = 0x2000_0000; /* Create with parents projid */
        const RESERVED     = 0x8000_0000; /* reserved for ext4 lib */
    }
}

/// Flag indicating the type of file stored in this inode.
#[derive(Debug, PartialEq)]
pub enum FileType {
    RegularFile,     // S_IFREG (Regular file)
    SymbolicLink,    // S_IFLNK (Symbolic link)
    CharacterDevice, // S_IFCHR (Character device)
    BlockDevice,     // S_IFBLK (Block device)
    Directory,       // S_IFDIR (Directory)
    Fifo,            // S_IFIFO (FIFO)
    Socket,          // S_IFSOCK (Socket)
}

impl FileType {
    fn from_mode(mode: u16) -> Option<FileType> {
        match mode >> 12 {
            0x1 => Some(FileType::Fifo),
            0x2 => Some(FileType::CharacterDevice),
            0x4 => Some(FileType::Directory),
            0x6 => Some(FileType::BlockDevice),
            0x8 => Some(FileType::RegularFile),
            0xA => Some(FileType::SymbolicLink),
            0xC => Some(FileType::Socket),
            _ => None,
        }
    }
}

/// Full information about a disc entry.
#[derive(Debug)]
pub struct Stat {
    /// `None` for an unused inode, or a mode we don't recognise.
    pub extracted_type: Option<FileType>,
    pub file_mode: u16,
    pub uid: u32,
    pub gid: u32,
    pub size: u64,
    pub atime: Time,
    pub ctime: Time,
    pub mtime: Time,
    pub dtime: Option<i64>,
    pub btime: Option<Time>,
    pub link_count: u16,
    /// Space charged to the inode, in 512-byte sectors, including pointer blocks.
    pub sectors: u32,
    /// Block holding extended attributes, or zero.
    pub xattr_block: u32,
}

/// Longest symlink target stored in the pointer slots themselves.
const FAST_SYMLINK_MAX: u64 = 4 * raw::BLOCK_POINTERS as u64;

/// An actual disc metadata entry.
#[derive(Debug)]
pub struct Inode {
    pub stat: Stat,
    pub number: u32,
    pub flags: InodeFlags,
    blocks: BlockMap,
}

impl Inode {
    /// The direct and indirect pointers, straight from the inode.
    pub fn block_map(&self) -> &BlockMap {
        &self.blocks
    }

    /// A symlink short enough to live in the pointer slots, with no data block.
    ///
    /// An extended attribute block is charged to the inode too; it doesn't count.
    pub fn is_fast_symlink(&self, block_size: u32) -> bool {
        let xattr_sectors = if 0 == self.stat.xattr_block {
            0
        } else {
            block_size / 512
        };

        Some(FileType::SymbolicLink) == self.stat.extracted_type
            && self.stat.size < FAST_SYMLINK_MAX
            && self.stat.sectors == xattr_sectors
    }

    fn ensure_block_mapped(&self) -> Result<(), Error> {
        let mapped_elsewhere = self.flags & (InodeFlags::EXTENTS | InodeFlags::INLINE_DATA);
        ensure!(
            mapped_elsewhere.is_empty(),
            unsupported_feature(format!(
                "inode <{}> isn't mapped by block pointers: {:?}",
                self.number, mapped_elsewhere
            ))
        );
        Ok(())
    }
}

/// A raw filesystem time.
#[derive(Debug)]
pub struct Time {
    pub epoch_secs: i64,
    pub nanos: Option<u32>,
}

impl Time {
    // c.f. ext4_decode_extra_time
    // "We use an encoding that preserves the times for extra epoch"
    // the lower two bits of the extra field are added to the top of the sec field,
    // the remainder are the nsec
    pub fn from_extra(epoch_secs: i32, extra: Option<u32>) -> Time {
        let mut epoch_secs = i64::from(epoch_secs);
        match extra {
            None => Time {
                epoch_secs,
                nanos: None,
            },
            Some(extra) => {
                let epoch_bits = 2;

                // 0b1100_00..0000
                let epoch_mask = (1 << epoch_bits) - 1;

                // 0b00..00_0011
                let nsec_mask = !0u32 << epoch_bits;

                epoch_secs += i64::from(extra & epoch_mask) << 32;

                let nanos = (extra & nsec_mask) >> epoch_bits;
                Time {
                    epoch_secs,
                    nanos: Some(nanos.clamp(0, 999_999_999)),
                }
            }
        }
    }
}

/// What to do with a filesystem that wasn't cleanly unmounted, or has errors recorded.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum StateCheck {
    Ignore,
    Warn,
    Require,
}

impl Default for StateCheck {
    fn default() -> Self {
        StateCheck::Warn
    }
}

#[derive(Debug, Default)]
pub struct Options {
    pub state_check: StateCheck,
}

/// The critical core of the filesystem.
#[derive(Derivative)]
#[derivative(Debug)]
pub struct SuperBlock<R> {
    #[derivative(Debug = "ignore")]
    inner: R,
    groups: block_groups::BlockGroups,

    volume_name: String,
    uuid: [u8; 16],
}

impl<R> SuperBlock<R>
where
    R: ReadAt,
{
    /// Open a filesystem, and load its superblock.
    pub fn new(inner: R) -> Result<SuperBlock<R>, Error> {
        SuperBlock::new_with_options(inner, &Options::default())
    }

    pub fn new_with_options(inner: R, options: &Options) -> Result<SuperBlock<R>, Error> {
        Ok(parse::superblock(inner, options)
            .with_context(|| anyhow!("failed to parse superblock"))?)
    }

    pub fn block_size(&self) -> u32 {
        self.groups.block_size
    }

    pub fn inodes_count(&self) -> u32 {
        self.groups.inodes_count
    }

    pub fn blocks_count(&self) -> u64 {
        self.groups.blocks_count
    }

    pub fn group_count(&self) -> u32 {
        self.groups.count
    }

    pub fn volume_name(&self) -> &str {
        &self.volume_name
    }

    pub fn uuid(&self) -> [u8; 16] {
        self.uuid
    }

    /// Read the descriptor of one block group.
    pub fn group(&self, group: u32) -> Result<GroupDesc, Error> {
        self.groups.descriptor(&self.inner, group)
    }

    /// Load a filesystem entry by inode number.
    pub fn load_inode(&self, inode: u32) -> Result<Inode, Error> {
        let data = self
            .load_inode_bytes(inode)
            .with_context(|| anyhow!("failed to find inode <{}> on disc", inode))?;

        let parsed =
            parse::inode(&data, inode).with_context(|| anyhow!("failed to parse inode <{}>", inode))?;

        debug!(
            "inode <{}>: {:?}, {} bytes, flags {:?}",
            inode, parsed.stat.extracted_type, parsed.stat.size, parsed.flags
        );

        Ok(parsed)
    }

    fn load_inode_bytes(&self, inode: u32) -> Result<Vec<u8>, Error> {
        let offset = self.groups.index_of(&self.inner, inode)?;
        let mut data = zeroed(usize::from(self.groups.inode_size))?;
        self.inner.read_exact_at(offset, &mut data)?;
        Ok(data)
    }

    /// Find the physical block backing a logical block of the inode, if any.
    pub fn resolve(&self, inode: &Inode, logical: u64) -> Result<Resolved, Error> {
        inode.ensure_block_mapped()?;
        indirect::resolve(&self.inner, &inode.blocks, logical, self.groups.block_size)
    }

    /// Write the inode's exact content to `sink`, holes as zeros, returning the bytes written.
    ///
    /// On failure, whatever was already written stays written.
    pub fn extract<W>(&self, inode: &Inode, mut sink: W) -> Result<u64, Error>
    where
        W: io::Write,
    {
        if inode.is_fast_symlink(self.groups.block_size) {
            let target = inode.blocks.to_bytes();
            let len = usize::try_from(inode.stat.size)?;
            sink.write_all(&target[..len])?;
            return Ok(inode.stat.size);
        }

        inode.ensure_block_mapped()?;

        Ok(reconstruct::extract(
            &self.inner,
            &inode.blocks,
            inode.stat.size,
            self.groups.block_size,
            sink,
        )
        .with_context(|| anyhow!("extracting inode <{}>", inode.number))?)
    }

    /// Load, then extract, an inode.
    pub fn extract_inode<W>(&self, inode: u32, sink: W) -> Result<u64, Error>
    where
        W: io::Write,
    {
        let inode = self.load_inode(inode)?;
        self.extract(&inode, sink)
    }

    /// The whole content of an inode, in memory.
    pub fn read_all(&self, inode: &Inode) -> Result<Vec<u8>, Error> {
        let len = usize::try_from(inode.stat.size)?;
        let mut ret = Vec::new();
        ret.try_reserve_exact(len)
            .map_err(|_| ParseError::ResourceExhausted { bytes: len })?;
        self.extract(inode, &mut ret)?;
        Ok(ret)
    }
}

/// A buffer of `len` zeros, or `ResourceExhausted` if we can't have one.
fn zeroed(len: usize) -> Result<Vec<u8>, ParseError> {
    let mut buf = Vec::new();
    buf.try_reserve_exact(len)
        .map_err(|_| ParseError::ResourceExhausted { bytes: len })?;
    buf.resize(len, 0);
    Ok(buf)
}

#[inline]
fn read_le16(from: &[u8]) -> u16 {
    LittleEndian::read_u16(from)
}

#[inline]
fn read_le32(from: &[u8]) -> u32 {
    LittleEndian::read_u32(from)
}

#[inline]
fn read_lei32(from: &[u8]) -> i32 {
    LittleEndian::read_i32(from)
}
