//! Builds small ext2 images in memory, laid out the way mke2fs would,
//! minus the bitmaps: boot block, superblock, descriptors, then every
//! group's inode table back to back, then data blocks handed out in order.

#![allow(dead_code)]

pub const REGULAR: u16 = 0o100_644;
pub const SYMLINK: u16 = 0o120_777;

pub struct Image {
    pub data: Vec<u8>,
    pub block_size: u32,
    pub inodes_per_group: u32,
    pub inode_size: u32,
    tables: Vec<u32>,
    next_free: u32,
}

impl Image {
    /// One group, 16 inodes of 128 bytes, 512 blocks.
    pub fn new(block_size: u32) -> Image {
        Image::with_geometry(block_size, 512, 8192, 16, 128)
    }

    pub fn with_geometry(
        block_size: u32,
        blocks: u32,
        blocks_per_group: u32,
        inodes_per_group: u32,
        inode_size: u32,
    ) -> Image {
        let first_data_block = if 1024 == block_size { 1 } else { 0 };
        let groups = (blocks - first_data_block + blocks_per_group - 1) / blocks_per_group;
        let descriptors = first_data_block + 1;
        let table_blocks = (inodes_per_group * inode_size + block_size - 1) / block_size;

        // leave two blocks after the descriptors, where the bitmaps would go
        let first_table = descriptors + 1 + 2;
        let tables: Vec<u32> = (0..groups).map(|g| first_table + g * table_blocks).collect();
        let next_free = first_table + groups * table_blocks;

        let mut image = Image {
            data: vec![0u8; (blocks * block_size) as usize],
            block_size,
            inodes_per_group,
            inode_size,
            tables,
            next_free,
        };

        let log_block_size = block_size.trailing_zeros() - 10;
        image.put_u32(1024, groups * inodes_per_group); // s_inodes_count
        image.put_u32(1024 + 0x04, blocks); // s_blocks_count
        image.put_u32(1024 + 0x14, first_data_block);
        image.put_u32(1024 + 0x18, log_block_size);
        image.put_u32(1024 + 0x20, blocks_per_group);
        image.put_u32(1024 + 0x24, blocks_per_group); // s_frags_per_group
        image.put_u32(1024 + 0x28, inodes_per_group);
        image.put_u16(1024 + 0x38, 0xEF53);
        image.put_u16(1024 + 0x3a, 1); // cleanly unmounted
        image.put_u32(1024 + 0x4c, 1); // dynamic revision
        image.put_u32(1024 + 0x54, 11);
        image.put_u16(1024 + 0x58, inode_size as u16);
        image.put_u32(1024 + 0x60, 0x2); // filetype
        image.data[1024 + 0x78..1024 + 0x7e].copy_from_slice(b"tested");

        for group in 0..groups as usize {
            let at = (descriptors * block_size) as usize + group * 32;
            let table = image.tables[group];
            image.put_u32(at + 0x08, table);
        }

        image
    }

    pub fn put_u16(&mut self, at: usize, value: u16) {
        self.data[at..at + 2].copy_from_slice(&value.to_le_bytes());
    }

    pub fn put_u32(&mut self, at: usize, value: u32) {
        self.data[at..at + 4].copy_from_slice(&value.to_le_bytes());
    }

    /// The next unused block.
    pub fn alloc(&mut self) -> u32 {
        let block = self.next_free;
        assert!(
            ((block + 1) * self.block_size) as usize <= self.data.len(),
            "image is full"
        );
        self.next_free += 1;
        block
    }

    /// A fresh block whose every byte is `fill`.
    pub fn data_block(&mut self, fill: u8) -> u32 {
        let block = self.alloc();
        self.fill_block(block, fill);
        block
    }

    pub fn fill_block(&mut self, block: u32, fill: u8) {
        let start = (block * self.block_size) as usize;
        let end = start + self.block_size as usize;
        for b in &mut self.data[start..end] {
            *b = fill;
        }
    }

    /// A fresh pointer block, with `entries` set and everything else a hole.
    pub fn pointer_block(&mut self, entries: &[(u32, u32)]) -> u32 {
        let block = self.alloc();
        for &(index, pointer) in entries {
            let at = (block * self.block_size + index * 4) as usize;
            self.put_u32(at, pointer);
        }
        block
    }

    pub fn inode_offset(&self, number: u32) -> usize {
        let group = ((number - 1) / self.inodes_per_group) as usize;
        let index = (number - 1) % self.inodes_per_group;
        (self.tables[group] * self.block_size + index * self.inode_size) as usize
    }

    pub fn set_inode(&mut self, number: u32, mode: u16, size: u64, slots: &[(usize, u32)]) {
        let at = self.inode_offset(number);
        self.put_u16(at, mode);
        self.put_u32(at + 0x04, size as u32);
        self.put_u32(at + 0x6c, (size >> 32) as u32);
        self.put_u16(at + 0x1a, 1);

        let sectors = slots.iter().filter(|(_, p)| 0 != *p).count() as u32 * (self.block_size / 512);
        self.put_u32(at + 0x1c, sectors);

        for &(slot, pointer) in slots {
            self.put_u32(at + 0x28 + slot * 4, pointer);
        }
    }

    /// A symlink whose target lives in the pointer slots.
    pub fn set_fast_symlink(&mut self, number: u32, target: &[u8]) {
        assert!(target.len() < 60);
        let at = self.inode_offset(number);
        self.put_u16(at, SYMLINK);
        self.put_u32(at + 0x04, target.len() as u32);
        self.put_u16(at + 0x1a, 1);
        self.data[at + 0x28..at + 0x28 + target.len()].copy_from_slice(target);
    }

    pub fn set_inode_flags(&mut self, number: u32, flags: u32) {
        let at = self.inode_offset(number);
        self.put_u32(at + 0x20, flags);
    }

    /// The bytes of `block`, cut to `len`.
    pub fn block_bytes(&self, block: u32, len: usize) -> Vec<u8> {
        let start = (block * self.block_size) as usize;
        self.data[start..start + len].to_vec()
    }
}
