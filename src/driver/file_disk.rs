//! 镜像盘：以一个磁盘镜像文件作为单个块设备（对应 QEMU 挂载的 fs.img）。

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use parking_lot::Mutex;

use super::BlockDevice;
use crate::consts::fs::BSIZE;
use crate::error::{DiskError, Result};
use crate::fs::BufData;

/// 由镜像文件支撑的块设备，只响应一个设备号。
///
/// 打开与创建阶段的错误以 [`DiskError`] 返回；接入缓存之后，
/// 越界块号、错误的设备号和文件 I/O 失败都是致命错误。
pub struct FileDisk {
    file: Mutex<File>,
    path: PathBuf,
    dev: u32,
    nblocks: u32,
}

impl FileDisk {
    /// 打开已有的镜像。镜像长度必须是块大小的整数倍。
    pub fn open(path: impl AsRef<Path>, dev: u32) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new().read(true).write(true).open(&path)?;
        let len = file.metadata()?.len();
        if len % BSIZE as u64 != 0 {
            return Err(DiskError::Misaligned { len });
        }
        let nblocks = Self::block_count(len / BSIZE as u64)?;

        info!("filedisk: dev {} <- {:?}, {} blocks", dev, path, nblocks);
        Ok(Self { file: Mutex::new(file), path, dev, nblocks })
    }

    /// 创建（或截断）一个 `nblocks` 块、内容全零的镜像。
    pub fn create(path: impl AsRef<Path>, dev: u32, nblocks: u32) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)?;
        file.set_len(nblocks as u64 * BSIZE as u64)?;

        info!("filedisk: dev {} <- {:?}, created with {} blocks", dev, path, nblocks);
        Ok(Self { file: Mutex::new(file), path, dev, nblocks })
    }

    fn block_count(blocks: u64) -> Result<u32> {
        u32::try_from(blocks).map_err(|_| DiskError::TooLarge { blocks })
    }

    pub fn dev(&self) -> u32 {
        self.dev
    }

    pub fn nblocks(&self) -> u32 {
        self.nblocks
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// 把镜像内容刷到持久存储。
    pub fn sync(&self) -> Result<()> {
        self.file.lock().sync_all()?;
        Ok(())
    }
}

impl BlockDevice for FileDisk {
    fn rw(&self, dev: u32, blockno: u32, data: &mut BufData, writing: bool) {
        if dev != self.dev {
            panic!("filedisk: unknown device {}", dev);
        }
        if blockno >= self.nblocks {
            panic!("filedisk: block {} out of range ({} blocks)", blockno, self.nblocks);
        }

        let mut file = self.file.lock();
        let offset = blockno as u64 * BSIZE as u64;
        let res = file.seek(SeekFrom::Start(offset)).and_then(|_| {
            if writing {
                file.write_all(&data[..])
            } else {
                file.read_exact(&mut data[..])
            }
        });
        if let Err(e) = res {
            panic!("filedisk: block {}: {}", blockno, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_write_reopen_read() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fs.img");

        {
            let disk = FileDisk::create(&path, 1, 8).unwrap();
            assert_eq!(disk.nblocks(), 8);
            let mut data = BufData::new();
            data[..5].copy_from_slice(b"hello");
            disk.rw(1, 6, &mut data, true);
            disk.sync().unwrap();
        }

        let disk = FileDisk::open(&path, 1).unwrap();
        assert_eq!(disk.nblocks(), 8);
        let mut data = BufData::new();
        disk.rw(1, 6, &mut data, false);
        assert_eq!(&data[..5], b"hello");
        disk.rw(1, 5, &mut data, false);
        assert!(data.iter().all(|&b| b == 0));
    }

    #[test]
    fn misaligned_image_is_rejected() {
        let mut img = tempfile::NamedTempFile::new().unwrap();
        img.write_all(&[0u8; BSIZE + 1]).unwrap();
        img.flush().unwrap();

        match FileDisk::open(img.path(), 1) {
            Err(DiskError::Misaligned { len }) => assert_eq!(len, BSIZE as u64 + 1),
            Err(e) => panic!("unexpected error: {}", e),
            Ok(_) => panic!("misaligned image accepted"),
        }
    }

    #[test]
    fn missing_image_is_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = FileDisk::open(dir.path().join("nope.img"), 1).err().unwrap();
        assert!(matches!(err, DiskError::Io { .. }));
    }

    #[test]
    #[should_panic(expected = "filedisk: block 4 out of range")]
    fn out_of_range_block_panics() {
        let dir = tempfile::tempdir().unwrap();
        let disk = FileDisk::create(dir.path().join("small.img"), 1, 4).unwrap();
        let mut data = BufData::new();
        disk.rw(1, 4, &mut data, false);
    }

    #[test]
    #[should_panic(expected = "filedisk: unknown device 2")]
    fn wrong_device_panics() {
        let dir = tempfile::tempdir().unwrap();
        let disk = FileDisk::create(dir.path().join("one.img"), 1, 4).unwrap();
        let mut data = BufData::new();
        disk.rw(2, 0, &mut data, false);
    }
}
