mod support;

use ext2extract::SuperBlock;
use ext2extract::Time;

use support::Image;

#[test]
fn future_file() {
    // 2345-06-07 08:09:10.111213141Z
    let time = Time::from_extra(0xc229_d726u32 as i32, Some(0x1a83_e957));
    assert_eq!(11847456550, time.epoch_secs);
    assert_eq!(Some(111213141), time.nanos);
}

#[test]
fn large_inodes_carry_nanoseconds() {
    let mut image = Image::with_geometry(1024, 512, 8192, 16, 256);
    image.set_inode(12, support::REGULAR, 0, &[]);
    let at = image.inode_offset(12);
    image.put_u32(at + 0x10, 0xc229_d726); // i_mtime
    image.put_u16(at + 0x80, 32); // i_extra_isize
    image.put_u32(at + 0x88, 0x1a83_e957); // i_mtime_extra
    image.put_u32(at + 0x90, 1_000_000_000); // i_crtime

    let fs = SuperBlock::new(image.data.as_slice()).unwrap();
    let inode = fs.load_inode(12).unwrap();
    assert_eq!(11847456550, inode.stat.mtime.epoch_secs);
    assert_eq!(Some(111213141), inode.stat.mtime.nanos);
    assert_eq!(
        Some(1_000_000_000),
        inode.stat.btime.as_ref().map(|t| t.epoch_secs)
    );
}

#[test]
fn small_inodes_have_seconds_only() {
    let mut image = Image::new(1024);
    image.set_inode(12, support::REGULAR, 0, &[]);
    let at = image.inode_offset(12);
    image.put_u32(at + 0x08, 1_600_000_000); // i_atime

    let fs = SuperBlock::new(image.data.as_slice()).unwrap();
    let inode = fs.load_inode(12).unwrap();
    assert_eq!(1_600_000_000, inode.stat.atime.epoch_secs);
    assert_eq!(None, inode.stat.atime.nanos);
    assert!(inode.stat.btime.is_none());
}
