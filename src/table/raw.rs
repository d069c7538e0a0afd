//! Raw image access
//!
//! Partition tables are written straight into an image file or block device
//! at fixed byte offsets. [`RawImage`] is a thin positioned-I/O wrapper over
//! the target that remembers its path for error messages and its size for
//! bounds checks.
//!
//! # Sizing
//!
//! The size is taken by seeking to the end rather than from file metadata,
//! so block devices (which report a metadata length of zero) are sized
//! correctly.
//!
//! # Usage
//!
//! ```rust,ignore
//! use p2v_disk::table::RawImage;
//!
//! let image = RawImage::open("disk.img")?;
//! let mut boot_sector = [0u8; 512];
//! image.read_exact_at(&mut boot_sector, 0)?;
//! assert_eq!(&boot_sector[510..512], &[0x55, 0xAA]);
//! ```

use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use gpt_disk_io::BlockIo;
use gpt_disk_types::{BlockSize, Lba};

use crate::error::{DiskError, DiskResult};
use crate::sectors::SECTOR_SIZE;

/// An image file or block device opened for positioned I/O
#[derive(Debug)]
pub struct RawImage {
    path: PathBuf,
    size: u64,
    file: File,
}

impl RawImage {
    /// Open read-only
    pub fn open(path: impl AsRef<Path>) -> DiskResult<Self> {
        Self::open_with(path.as_ref(), OpenOptions::new().read(true))
    }

    /// Open for reading and writing
    pub fn open_rw(path: impl AsRef<Path>) -> DiskResult<Self> {
        Self::open_with(path.as_ref(), OpenOptions::new().read(true).write(true))
    }

    /// Create (or truncate) an image file of `size` bytes
    ///
    /// The file is sparse on filesystems that support it.
    pub fn create(path: impl AsRef<Path>, size: u64) -> DiskResult<Self> {
        let path = path.as_ref();
        let file = File::options()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)
            .map_err(|e| open_error(path, e))?;
        file.set_len(size).map_err(|e| DiskError::table_io(path, e))?;
        log::debug!("created image {:?} ({} bytes)", path, size);
        Ok(Self {
            path: path.to_path_buf(),
            size,
            file,
        })
    }

    fn open_with(path: &Path, options: &OpenOptions) -> DiskResult<Self> {
        let mut file = options.open(path).map_err(|e| open_error(path, e))?;
        let size = file
            .seek(SeekFrom::End(0))
            .map_err(|e| DiskError::table_io(path, e))?;
        Ok(Self {
            path: path.to_path_buf(),
            size,
            file,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    /// Whole sectors in the image
    pub fn sectors(&self) -> u64 {
        self.size / SECTOR_SIZE
    }

    /// Read up to `buf.len()` bytes at `offset`, clamped to the image end
    pub fn read_at(&self, buf: &mut [u8], offset: u64) -> DiskResult<usize> {
        if offset >= self.size {
            return Err(DiskError::OutOfBounds {
                requested: offset,
                size: self.size,
            });
        }

        let available = usize::try_from(self.size - offset).unwrap_or(usize::MAX);
        let to_read = buf.len().min(available);

        let mut file = &self.file;
        file.seek(SeekFrom::Start(offset))
            .and_then(|_| file.read_exact(&mut buf[..to_read]))
            .map_err(|e| self.io_error(e))?;
        log::trace!("read {} bytes at {:#x} from {:?}", to_read, offset, self.path);

        Ok(to_read)
    }

    /// Fill `buf` from `offset`, failing if the image ends first
    pub fn read_exact_at(&self, buf: &mut [u8], offset: u64) -> DiskResult<()> {
        self.check_range(offset, buf.len())?;
        let mut file = &self.file;
        file.seek(SeekFrom::Start(offset))
            .and_then(|_| file.read_exact(buf))
            .map_err(|e| self.io_error(e))
    }

    /// Write all of `buf` at `offset`
    ///
    /// Writes never grow the image.
    pub fn write_at(&mut self, buf: &[u8], offset: u64) -> DiskResult<()> {
        self.check_range(offset, buf.len())?;
        let mut file = &self.file;
        file.seek(SeekFrom::Start(offset))
            .and_then(|_| file.write_all(buf))
            .map_err(|e| self.io_error(e))?;
        log::debug!("wrote {} bytes at {:#x} to {:?}", buf.len(), offset, self.path);
        Ok(())
    }

    /// Flush written data through to the device
    pub fn sync(&mut self) -> DiskResult<()> {
        self.file
            .flush()
            .and_then(|_| self.file.sync_data())
            .map_err(|e| self.io_error(e))
    }

    fn io_error(&self, err: io::Error) -> DiskError {
        DiskError::table_io(&self.path, err)
    }

    fn check_range(&self, offset: u64, len: usize) -> DiskResult<()> {
        let end = offset.checked_add(len as u64);
        match end {
            Some(end) if end <= self.size => Ok(()),
            _ => Err(DiskError::OutOfBounds {
                requested: end.unwrap_or(u64::MAX),
                size: self.size,
            }),
        }
    }
}

fn open_error(path: &Path, err: io::Error) -> DiskError {
    if err.kind() == io::ErrorKind::PermissionDenied {
        log::warn!("permission denied on {:?}; block devices usually need root", path);
    }
    DiskError::table_io(path, err)
}

/// [`BlockIo`] view of a [`RawImage`] in 512-byte blocks
pub(crate) struct ImageBlocks<'a> {
    image: &'a mut RawImage,
}

impl<'a> ImageBlocks<'a> {
    pub(crate) fn new(image: &'a mut RawImage) -> Self {
        Self { image }
    }
}

impl BlockIo for ImageBlocks<'_> {
    type Error = io::Error;

    fn block_size(&self) -> BlockSize {
        BlockSize::BS_512
    }

    fn num_blocks(&mut self) -> Result<u64, Self::Error> {
        Ok(self.image.sectors())
    }

    fn read_blocks(&mut self, start_lba: Lba, dst: &mut [u8]) -> Result<(), Self::Error> {
        self.block_size().assert_valid_block_buffer(dst);
        self.image
            .file
            .seek(SeekFrom::Start(start_lba.to_u64() * SECTOR_SIZE))?;
        self.image.file.read_exact(dst)
    }

    fn write_blocks(&mut self, start_lba: Lba, src: &[u8]) -> Result<(), Self::Error> {
        self.block_size().assert_valid_block_buffer(src);
        let offset = start_lba.to_u64() * SECTOR_SIZE;
        if offset + src.len() as u64 > self.image.size {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("block write past end of {:?}", self.image.path),
            ));
        }
        self.image.file.seek(SeekFrom::Start(offset))?;
        self.image.file.write_all(src)
    }

    fn flush(&mut self) -> Result<(), Self::Error> {
        self.image.file.flush()?;
        self.image.file.sync_data()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_create_and_size() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.img");

        let image = RawImage::create(&path, 1 << 20).unwrap();
        assert_eq!(image.size(), 1 << 20);
        assert_eq!(image.sectors(), 2048);

        let reopened = RawImage::open(&path).unwrap();
        assert_eq!(reopened.size(), 1 << 20);
        assert_eq!(reopened.path(), path.as_path());
    }

    #[test]
    fn test_read_at() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.img");

        let data: Vec<u8> = (0..=255).collect();
        std::fs::write(&path, &data).unwrap();

        let image = RawImage::open(&path).unwrap();

        let mut buf = [0u8; 10];
        let read = image.read_at(&mut buf, 100).unwrap();
        assert_eq!(read, 10);
        assert_eq!(&buf, &data[100..110]);

        // Clamped at the end of the image
        let mut buf = [0u8; 10];
        assert_eq!(image.read_at(&mut buf, 250).unwrap(), 6);
    }

    #[test]
    fn test_write_at() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.img");

        let mut image = RawImage::create(&path, 4096).unwrap();
        image.write_at(&[0xAB; 4], 0x1B8).unwrap();
        image.sync().unwrap();

        let image = RawImage::open(&path).unwrap();
        let mut buf = [0u8; 4];
        image.read_exact_at(&mut buf, 0x1B8).unwrap();
        assert_eq!(buf, [0xAB; 4]);
    }

    #[test]
    fn test_out_of_bounds() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("small.img");
        std::fs::write(&path, b"small").unwrap();

        let mut image = RawImage::open_rw(&path).unwrap();

        let mut buf = [0u8; 10];
        assert!(matches!(
            image.read_at(&mut buf, 1000),
            Err(DiskError::OutOfBounds { .. })
        ));
        assert!(matches!(
            image.read_exact_at(&mut buf, 0),
            Err(DiskError::OutOfBounds { requested: 10, size: 5 })
        ));
        assert!(matches!(
            image.write_at(&[0; 4], 4),
            Err(DiskError::OutOfBounds { .. })
        ));
    }

    #[test]
    fn test_missing_file() {
        let dir = tempdir().unwrap();
        let err = RawImage::open(dir.path().join("absent.img")).unwrap_err();
        assert!(matches!(
            &err,
            DiskError::TableCodec { source, .. } if source.kind() == io::ErrorKind::NotFound
        ));
        assert!(err.to_string().contains("absent.img"));
    }

    #[test]
    fn test_directory_target_names_path() {
        let dir = tempdir().unwrap();
        let err = RawImage::open_rw(dir.path()).unwrap_err();
        assert!(matches!(err, DiskError::TableCodec { .. }));
        assert!(err
            .to_string()
            .contains(&format!("{:?}", dir.path())));
    }
}
