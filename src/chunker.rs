use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use crate::error::KiraError;

/// Number of parts for a file of `size` bytes. Always at least one, so an
/// empty file still uploads as a single empty part. Fails when the count does
/// not fit a part number.
pub fn part_count(size: u64, chunk_size: u64) -> Result<u32, KiraError> {
    let chunk_size = chunk_size.max(1);
    u32::try_from(size / chunk_size + 1).map_err(|_| {
        KiraError::InvalidConfig(format!(
            "{size} bytes in chunks of {chunk_size} needs more than {} parts",
            u32::MAX
        ))
    })
}

/// Reads fixed-size parts of a file on demand.
#[derive(Debug, Clone)]
pub struct FileChunker {
    path: PathBuf,
    size: u64,
    chunk_size: u64,
    parts: u32,
}

impl FileChunker {
    pub fn open(path: &Path, chunk_size: u64) -> Result<Self, KiraError> {
        let metadata = std::fs::metadata(path)
            .map_err(|err| KiraError::Filesystem(format!("stat {}: {err}", path.display())))?;
        let chunk_size = chunk_size.max(1);
        Ok(Self {
            path: path.to_path_buf(),
            size: metadata.len(),
            chunk_size,
            parts: part_count(metadata.len(), chunk_size)?,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn part_count(&self) -> u32 {
        self.parts
    }

    /// Byte range of a 1-based part; the trailing part may be empty.
    pub fn part_range(&self, part_number: u32) -> (u64, u64) {
        let start = (u64::from(part_number.saturating_sub(1)) * self.chunk_size).min(self.size);
        let end = (start + self.chunk_size).min(self.size);
        (start, end)
    }

    /// Opens its own handle so parts can be read from several threads.
    pub fn read_part(&self, part_number: u32) -> Result<Vec<u8>, KiraError> {
        let (start, end) = self.part_range(part_number);
        let mut file = File::open(&self.path)
            .map_err(|err| KiraError::Filesystem(format!("open {}: {err}", self.path.display())))?;
        file.seek(SeekFrom::Start(start)).map_err(KiraError::filesystem)?;
        let mut buffer = Vec::with_capacity((end - start) as usize);
        file.take(end - start)
            .read_to_end(&mut buffer)
            .map_err(KiraError::filesystem)?;
        Ok(buffer)
    }
}
