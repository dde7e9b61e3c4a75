// src/archive/reader.rs
// ============================================================================
// ZIP READER - Lee archivos ZIP store-only (verificación / inspección)
// ============================================================================
//
// Mismo modelo de acceso que el runtime: buscar por ruta completa
// ("float16/embedding.embed") o solo por nombre ("embedding.embed") y leer
// los bytes tal cual. Las entradas comprimidas se rechazan.
//
// ============================================================================

use std::collections::HashMap;
use std::fs::File;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, bail, Context, Result};
use memmap2::Mmap;

use super::header::*;

/// Máximo comentario ZIP: el EOCD está en los últimos 22 + 65535 bytes
const MAX_EOCD_SEARCH: usize = EOCD_SIZE + u16::MAX as usize;

/// Entrada del central directory
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ZipEntry {
    /// Ruta completa dentro del archivo
    pub name: String,
    pub crc32: u32,
    pub size: u64,
    pub compressed_size: u64,
    pub method: u16,
    /// Offset del local file header
    pub header_offset: u64,
}

impl ZipEntry {
    /// Último componente de la ruta
    pub fn file_name(&self) -> &str {
        self.name.rsplit('/').next().unwrap_or(&self.name)
    }
}

/// Archivo ZIP abierto (mmap)
pub struct ZipArchiveReader {
    path: PathBuf,
    mmap: Mmap,
    entries: Vec<ZipEntry>,
    by_path: HashMap<String, usize>,
    by_name: HashMap<String, usize>,
}

impl ZipArchiveReader {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = File::open(&path)
            .with_context(|| format!("Cannot open {}", path.display()))?;

        let file_size = file.metadata()?.len() as usize;
        if file_size < EOCD_SIZE {
            bail!("{} too small for a ZIP archive ({} bytes)", path.display(), file_size);
        }

        // SAFETY: solo lectura; el archivo no se modifica mientras vive el mmap
        let mmap = unsafe { Mmap::map(&file)? };

        let eocd_pos = find_eocd(&mmap)
            .ok_or_else(|| anyhow!("End of central directory not found in {}", path.display()))?;
        let eocd = EndOfCentralDirectory::from_bytes(&mmap[eocd_pos..])?;

        let (count, cd_size, cd_offset) = if eocd.is_zip64() {
            read_zip64_eocd(&mmap, eocd_pos)?
        } else {
            (eocd.entries as u64, eocd.cd_size as u64, eocd.cd_offset as u64)
        };

        let cd_start = cd_offset as usize;
        let cd_end = cd_start
            .checked_add(cd_size as usize)
            .filter(|&end| end <= eocd_pos)
            .ok_or_else(|| anyhow!("Central directory out of bounds"))?;

        let entries = read_central_directory(&mmap[cd_start..cd_end], count)?;

        let mut by_path = HashMap::with_capacity(entries.len());
        let mut by_name = HashMap::with_capacity(entries.len());
        for (idx, entry) in entries.iter().enumerate() {
            by_path.insert(entry.name.clone(), idx);
            by_name.insert(entry.file_name().to_string(), idx);
        }

        Ok(Self {
            path,
            mmap,
            entries,
            by_path,
            by_name,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn file_size(&self) -> u64 {
        self.mmap.len() as u64
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entradas en orden del central directory
    pub fn entries(&self) -> &[ZipEntry] {
        &self.entries
    }

    pub fn find_by_path(&self, path: &str) -> Option<&ZipEntry> {
        self.by_path.get(path).map(|&idx| &self.entries[idx])
    }

    pub fn find_by_name(&self, name: &str) -> Option<&ZipEntry> {
        self.by_name.get(name).map(|&idx| &self.entries[idx])
    }

    /// Bytes de una entrada (sin copia)
    pub fn read(&self, entry: &ZipEntry) -> Result<&[u8]> {
        let offset = entry.header_offset as usize;
        if offset >= self.mmap.len() {
            bail!("Local header of '{}' out of bounds", entry.name);
        }

        let local = LocalFileHeader::from_bytes(&self.mmap[offset..])
            .with_context(|| format!("Invalid local header for '{}'", entry.name))?;
        if local.name != entry.name.as_bytes() {
            bail!("Local header name mismatch for '{}'", entry.name);
        }

        let start = offset + local.encoded_len();
        let end = start
            .checked_add(entry.size as usize)
            .filter(|&end| end <= self.mmap.len())
            .ok_or_else(|| anyhow!("Data of '{}' out of bounds", entry.name))?;

        Ok(&self.mmap[start..end])
    }

    /// Comprueba el CRC-32 de una entrada
    pub fn verify(&self, entry: &ZipEntry) -> Result<bool> {
        Ok(crc32fast::hash(self.read(entry)?) == entry.crc32)
    }
}

/// Busca el EOCD desde el final (el comentario debe llegar justo al final)
fn find_eocd(data: &[u8]) -> Option<usize> {
    let last = data.len().checked_sub(EOCD_SIZE)?;
    let first = data.len().saturating_sub(MAX_EOCD_SEARCH);
    let sig = EOCD_SIG.to_le_bytes();

    (first..=last).rev().find(|&pos| {
        data[pos..pos + 4] == sig && {
            let comment_len = u16::from_le_bytes([data[pos + 20], data[pos + 21]]) as usize;
            pos + EOCD_SIZE + comment_len == data.len()
        }
    })
}

fn read_zip64_eocd(data: &[u8], eocd_pos: usize) -> Result<(u64, u64, u64)> {
    let locator_pos = eocd_pos
        .checked_sub(ZIP64_LOCATOR_SIZE)
        .ok_or_else(|| anyhow!("ZIP64 locator missing"))?;
    let locator = Zip64Locator::from_bytes(&data[locator_pos..eocd_pos])
        .context("ZIP64 locator missing")?;

    let pos = locator.eocd64_offset as usize;
    if pos + ZIP64_EOCD_SIZE > locator_pos {
        bail!("ZIP64 end of central directory out of bounds");
    }
    let eocd64 = Zip64EndOfCentralDirectory::from_bytes(&data[pos..locator_pos])?;

    Ok((eocd64.entries, eocd64.cd_size, eocd64.cd_offset))
}

fn read_central_directory(data: &[u8], count: u64) -> Result<Vec<ZipEntry>> {
    let mut entries = Vec::with_capacity(count.min(1 << 20) as usize);
    let mut pos = 0usize;

    for idx in 0..count {
        if pos >= data.len() {
            bail!("Central directory truncated at record {}", idx);
        }
        let (header, consumed) = CentralDirectoryHeader::from_bytes(&data[pos..])
            .with_context(|| format!("Invalid central directory record {}", idx))?;
        pos += consumed;

        let name = String::from_utf8(header.name)
            .with_context(|| format!("Entry name of record {} is not UTF-8", idx))?;

        if header.method != METHOD_STORED || header.compressed_size != header.uncompressed_size {
            bail!("Entry '{}' is compressed (method {}), only stored entries are supported", name, header.method);
        }

        entries.push(ZipEntry {
            name,
            crc32: header.crc32,
            size: header.uncompressed_size,
            compressed_size: header.compressed_size,
            method: header.method,
            header_offset: header.local_header_offset,
        });
    }

    Ok(entries)
}
