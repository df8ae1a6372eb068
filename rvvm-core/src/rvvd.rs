//! RVVD virtual disk format (§6): a 512-byte header followed by a flat
//! sector table, with an optional overlay-over-base fallthrough. Interface
//! only, per spec.md's Non-goals — no copy-on-write compaction, no
//! compression codec beyond the header flag byte.

use crate::error::RvvdError;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

pub const SECTOR_SIZE: u64 = 512;
const MAGIC: &[u8; 4] = b"RVVD";
const HEADER_SIZE: u64 = 512;
const FILENAME_FIELD_LEN: usize = 256;

#[derive(Debug, Clone)]
pub struct RvvdHeader {
    pub version: u32,
    pub size_sectors: u64,
    pub next_free_sector: u64,
    pub is_overlay: bool,
    pub compressed: bool,
    pub base_filename: Option<PathBuf>,
}

impl RvvdHeader {
    fn parse(buf: &[u8; HEADER_SIZE as usize]) -> Result<Self, RvvdError> {
        if &buf[0..4] != MAGIC {
            return Err(RvvdError::BadMagic);
        }
        let version = u32::from_le_bytes(buf[4..8].try_into().unwrap());
        if version != 1 {
            return Err(RvvdError::UnsupportedVersion(version));
        }
        let size_sectors = u64::from_le_bytes(buf[8..16].try_into().unwrap());
        let next_free_sector = u64::from_le_bytes(buf[16..24].try_into().unwrap());
        let is_overlay = buf[24] != 0;
        let compressed = buf[25] != 0;
        let name_bytes = &buf[26..26 + FILENAME_FIELD_LEN];
        let name_len = name_bytes.iter().position(|&b| b == 0).unwrap_or(name_bytes.len());
        let base_filename = if is_overlay && name_len > 0 {
            Some(PathBuf::from(String::from_utf8_lossy(&name_bytes[..name_len]).into_owned()))
        } else {
            None
        };

        Ok(Self {
            version,
            size_sectors,
            next_free_sector,
            is_overlay,
            compressed,
            base_filename,
        })
    }

    fn encode(&self) -> [u8; HEADER_SIZE as usize] {
        let mut buf = [0u8; HEADER_SIZE as usize];
        buf[0..4].copy_from_slice(MAGIC);
        buf[4..8].copy_from_slice(&self.version.to_le_bytes());
        buf[8..16].copy_from_slice(&self.size_sectors.to_le_bytes());
        buf[16..24].copy_from_slice(&self.next_free_sector.to_le_bytes());
        buf[24] = self.is_overlay as u8;
        buf[25] = self.compressed as u8;
        if let Some(name) = &self.base_filename {
            let bytes = name.to_string_lossy();
            let bytes = bytes.as_bytes();
            let n = bytes.len().min(FILENAME_FIELD_LEN - 1);
            buf[26..26 + n].copy_from_slice(&bytes[..n]);
        }
        buf
    }

    pub fn new_base(size_sectors: u64) -> Self {
        Self {
            version: 1,
            size_sectors,
            next_free_sector: 0,
            is_overlay: false,
            compressed: false,
            base_filename: None,
        }
    }

    pub fn new_overlay(size_sectors: u64, base_filename: PathBuf) -> Self {
        Self {
            version: 1,
            size_sectors,
            next_free_sector: 0,
            is_overlay: true,
            compressed: false,
            base_filename: Some(base_filename),
        }
    }
}

fn require_aligned(offset: u64) -> Result<(), RvvdError> {
    if offset % SECTOR_SIZE != 0 {
        Err(RvvdError::Misaligned(offset))
    } else {
        Ok(())
    }
}

/// A single RVVD image; `base` is the fallthrough image an overlay reads
/// from when its own sector table has no entry (§6's overlay-over-base
/// design).
///
/// Layout on disk: the 512-byte header, immediately followed by the
/// sector table (§6: "one u64 LE offset per guest sector; value 0 means
/// unallocated"), then a data region that grows by appending one
/// `SECTOR_SIZE` slot per first write to a given sector. `next_free_sector`
/// is the bump cursor into that data region, in sector units -- it does
/// NOT track which guest sectors are present (the table does), so writes
/// in any order correctly leave untouched sectors unallocated.
pub struct RvvdImage {
    file: File,
    header: RvvdHeader,
    base: Option<Box<RvvdImage>>,
}

impl RvvdImage {
    pub fn create_base(path: &Path, size_sectors: u64) -> Result<Self, RvvdError> {
        Self::create(path, RvvdHeader::new_base(size_sectors))
    }

    pub fn create_overlay(path: &Path, size_sectors: u64, base_filename: PathBuf) -> Result<Self, RvvdError> {
        Self::create(path, RvvdHeader::new_overlay(size_sectors, base_filename))
    }

    fn create(path: &Path, header: RvvdHeader) -> Result<Self, RvvdError> {
        let mut file = OpenOptions::new().read(true).write(true).create(true).truncate(true).open(path)?;
        file.write_all(&header.encode())?;
        file.write_all(&vec![0u8; (header.size_sectors * 8) as usize])?;
        Ok(Self { file, header, base: None })
    }

    pub fn open(path: &Path) -> Result<Self, RvvdError> {
        let mut file = OpenOptions::new().read(true).write(true).open(path)?;
        let mut raw = [0u8; HEADER_SIZE as usize];
        file.read_exact(&mut raw)?;
        let header = RvvdHeader::parse(&raw)?;
        let base = if let Some(base_name) = &header.base_filename {
            let base_path = path.parent().map(|p| p.join(base_name)).unwrap_or_else(|| base_name.clone());
            Some(Box::new(RvvdImage::open(&base_path)?))
        } else {
            None
        };
        Ok(Self { file, header, base })
    }

    pub fn size_bytes(&self) -> u64 {
        self.header.size_sectors * SECTOR_SIZE
    }

    fn table_entry_offset(&self, sector: u64) -> u64 {
        HEADER_SIZE + sector * 8
    }

    fn data_region_start(&self) -> u64 {
        HEADER_SIZE + self.header.size_sectors * 8
    }

    /// `0` means the sector has never been written to this image (§6).
    fn read_table_entry(&mut self, sector: u64) -> Result<u64, RvvdError> {
        self.file.seek(SeekFrom::Start(self.table_entry_offset(sector)))?;
        let mut buf = [0u8; 8];
        self.file.read_exact(&mut buf)?;
        Ok(u64::from_le_bytes(buf))
    }

    fn write_table_entry(&mut self, sector: u64, data_offset: u64) -> Result<(), RvvdError> {
        self.file.seek(SeekFrom::Start(self.table_entry_offset(sector)))?;
        self.file.write_all(&data_offset.to_le_bytes())?;
        Ok(())
    }

    pub fn read(&mut self, sector: u64, buf: &mut [u8]) -> Result<(), RvvdError> {
        require_aligned(buf.len() as u64)?;
        let entry = self.read_table_entry(sector)?;
        if entry != 0 {
            self.file.seek(SeekFrom::Start(entry))?;
            self.file.read_exact(buf)?;
            return Ok(());
        }
        match &mut self.base {
            Some(base) => base.read(sector, buf),
            None => {
                buf.fill(0);
                Ok(())
            }
        }
    }

    pub fn write(&mut self, sector: u64, data: &[u8]) -> Result<(), RvvdError> {
        require_aligned(data.len() as u64)?;
        let entry = self.read_table_entry(sector)?;
        let data_offset = if entry != 0 {
            entry
        } else {
            let data_offset = self.data_region_start() + self.header.next_free_sector * SECTOR_SIZE;
            self.header.next_free_sector += 1;
            self.write_table_entry(sector, data_offset)?;
            self.sync_header()?;
            data_offset
        };
        self.file.seek(SeekFrom::Start(data_offset))?;
        self.file.write_all(data)?;
        Ok(())
    }

    pub fn trim(&mut self, sector: u64, count: u64) -> Result<(), RvvdError> {
        let zeros = vec![0u8; SECTOR_SIZE as usize];
        for s in sector..sector + count {
            self.write(s, &zeros)?;
        }
        Ok(())
    }

    pub fn sync(&mut self) -> Result<(), RvvdError> {
        self.file.sync_data()?;
        Ok(())
    }

    fn sync_header(&mut self) -> Result<(), RvvdError> {
        self.file.seek(SeekFrom::Start(0))?;
        self.file.write_all(&self.header.encode())?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_path(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("rvvm-rvvd-test-{}-{}", std::process::id(), name))
    }

    #[test]
    fn write_then_read_roundtrip() {
        let path = temp_path("base.rvvd");
        let mut img = RvvdImage::create_base(&path, 4).unwrap();
        let data = [0xabu8; SECTOR_SIZE as usize];
        img.write(1, &data).unwrap();
        let mut out = [0u8; SECTOR_SIZE as usize];
        img.read(1, &mut out).unwrap();
        assert_eq!(out, data);
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn overlay_falls_through_to_base() {
        let base_path = temp_path("falls-base.rvvd");
        let overlay_path = temp_path("falls-overlay.rvvd");
        let mut base = RvvdImage::create_base(&base_path, 4).unwrap();
        let base_data = [0x11u8; SECTOR_SIZE as usize];
        base.write(2, &base_data).unwrap();
        drop(base);

        let mut overlay = RvvdImage::create_overlay(&overlay_path, 4, PathBuf::from(base_path.file_name().unwrap())).unwrap();
        drop(overlay);
        let mut overlay = RvvdImage::open(&overlay_path).unwrap();
        let mut out = [0u8; SECTOR_SIZE as usize];
        overlay.read(2, &mut out).unwrap();
        assert_eq!(out, base_data);

        let overlay_data = [0x22u8; SECTOR_SIZE as usize];
        overlay.write(2, &overlay_data).unwrap();
        overlay.read(2, &mut out).unwrap();
        assert_eq!(out, overlay_data);

        let _ = std::fs::remove_file(&base_path);
        let _ = std::fs::remove_file(&overlay_path);
    }

    #[test]
    fn sparse_overlay_write_does_not_shadow_unwritten_sectors() {
        // Regression: presence must be tracked per-sector, not by a
        // high-water mark -- writing a high sector number must not make
        // lower, never-written sectors appear "allocated" in the overlay.
        let base_path = temp_path("sparse-base.rvvd");
        let overlay_path = temp_path("sparse-overlay.rvvd");
        let mut base = RvvdImage::create_base(&base_path, 8).unwrap();
        let base_data = [0x33u8; SECTOR_SIZE as usize];
        base.write(2, &base_data).unwrap();
        drop(base);

        let mut overlay = RvvdImage::create_overlay(&overlay_path, 8, PathBuf::from(base_path.file_name().unwrap())).unwrap();
        let overlay_data = [0x44u8; SECTOR_SIZE as usize];
        overlay.write(5, &overlay_data).unwrap();

        let mut out = [0u8; SECTOR_SIZE as usize];
        overlay.read(2, &mut out).unwrap();
        assert_eq!(out, base_data, "sector 2 was never written in the overlay, must fall through to base");

        overlay.read(5, &mut out).unwrap();
        assert_eq!(out, overlay_data);

        let _ = std::fs::remove_file(&base_path);
        let _ = std::fs::remove_file(&overlay_path);
    }

    #[test]
    fn misaligned_access_is_rejected() {
        let path = temp_path("misaligned.rvvd");
        let mut img = RvvdImage::create_base(&path, 2).unwrap();
        let bad = [0u8; 10];
        assert!(img.write(0, &bad).is_err());
        let _ = std::fs::remove_file(&path);
    }
}
