use std::convert::TryFrom;
use std::io;

use anyhow::anyhow;
use anyhow::ensure;
use anyhow::Context;
use anyhow::Error;
use log::debug;
use positioned_io::ReadAt;

use crate::indirect;
use crate::indirect::BlockMap;
use crate::indirect::Resolved;
use crate::zeroed;
use crate::ParseError;

/// Blocks needed to hold `size` bytes.
pub fn block_count(size: u64, block_size: u32) -> u64 {
    let block_size = u64::from(block_size);
    size / block_size + u64::from(0 != size % block_size)
}

/// Bytes of logical block `block` which belong to the file.
///
/// Every block is full, except the last one when the size isn't a multiple of the block size.
pub fn block_len(block: u64, size: u64, block_size: u32) -> u64 {
    let full = u64::from(block_size);
    if block + 1 != block_count(size, block_size) {
        return full;
    }

    match size % full {
        0 => full,
        remainder => remainder,
    }
}

/// Write the `size` bytes mapped by `map` to `sink`, in logical order.
///
/// Holes are written as zeros. Any failure stops the copy where it is;
/// nothing already written is taken back.
pub fn extract<R, W>(
    inner: &R,
    map: &BlockMap,
    size: u64,
    block_size: u32,
    mut sink: W,
) -> Result<u64, Error>
where
    R: ReadAt + ?Sized,
    W: io::Write,
{
    let blocks = block_count(size, block_size);
    let addressable = indirect::max_logical_blocks(block_size);
    ensure!(
        blocks <= addressable,
        ParseError::UnsupportedOffset { block: addressable }
    );

    debug!(
        "extracting {} bytes in {} blocks of {}",
        size, blocks, block_size
    );

    let mut written = 0u64;
    for block in 0..blocks {
        let len = usize::try_from(block_len(block, size, block_size))?;

        match indirect::resolve(inner, map, block, block_size)? {
            Resolved::Hole => {
                let zeros = zeroed(len)?;
                sink.write_all(&zeros)
                    .with_context(|| anyhow!("writing hole at logical block {}", block))?;
            }
            Resolved::Physical(physical) => {
                let mut data = zeroed(usize::try_from(block_size)?)?;
                inner
                    .read_exact_at(u64::from(physical) * u64::from(block_size), &mut data)
                    .with_context(|| {
                        anyhow!("reading block {} (logical {})", physical, block)
                    })?;
                sink.write_all(&data[..len])
                    .with_context(|| anyhow!("writing logical block {}", block))?;
            }
        }

        written += u64::try_from(len)?;
    }

    ensure!(
        written == size,
        crate::assumption_failed(format!("wrote {} bytes of {}", written, size))
    );

    Ok(written)
}
