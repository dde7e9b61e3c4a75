// src/archive/writer.rs
// ============================================================================
// ZIP WRITER - Construye el archivo ZIP sin compresión
// ============================================================================
//
// Escribe a "<salida>.partial" y solo renombra a la ruta final en finalize().
// Si el writer se descarta o se dropea sin finalizar, el parcial se borra:
// nunca queda un archivo a medias con el nombre final.
//
// ============================================================================

use std::collections::HashSet;
use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};

use log::{debug, warn};

use super::header::*;
use super::ArchiveSink;

/// Registro de una entrada ya escrita (para el central directory)
#[derive(Debug, Clone)]
struct EntryRecord {
    name: String,
    crc32: u32,
    size: u64,
    offset: u64,
}

/// Writer de ZIP store-only
pub struct ZipArchiveWriter {
    path: PathBuf,
    partial_path: PathBuf,
    file: Option<BufWriter<File>>,
    current_offset: u64,
    records: Vec<EntryRecord>,
    names: HashSet<String>,
    modified: DosDateTime,
    #[cfg(test)]
    fail_sync: bool,
}

impl ZipArchiveWriter {
    /// Crea el archivo parcial junto a `path`
    pub fn create(path: impl AsRef<Path>) -> io::Result<Self> {
        let path = path.as_ref().to_path_buf();
        let partial_path = partial_path_for(&path)?;

        let file = File::create(&partial_path)?;
        debug!("Writing archive to {}", partial_path.display());

        Ok(Self {
            path,
            partial_path,
            file: Some(BufWriter::new(file)),
            current_offset: 0,
            records: Vec::new(),
            names: HashSet::new(),
            modified: DosDateTime::now(),
            #[cfg(test)]
            fail_sync: false,
        })
    }

    /// Ruta final (existe solo tras finalize)
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn partial_path(&self) -> &Path {
        &self.partial_path
    }

    pub fn entry_count(&self) -> usize {
        self.records.len()
    }

    fn file(&mut self) -> io::Result<&mut BufWriter<File>> {
        self.file
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "archive already closed"))
    }

    fn write_all(&mut self, data: &[u8]) -> io::Result<()> {
        self.file()?.write_all(data)?;
        self.current_offset += data.len() as u64;
        Ok(())
    }

    /// Central directory + EOCD (+ ZIP64 si hace falta)
    fn write_central_directory(&mut self) -> io::Result<()> {
        let cd_offset = self.current_offset;

        let headers: Vec<Vec<u8>> = self.records
            .iter()
            .map(|r| {
                CentralDirectoryHeader::stored(&r.name, r.crc32, r.size, r.offset, self.modified)
                    .to_bytes()
            })
            .collect();
        for header in &headers {
            self.write_all(header)?;
        }

        let cd_size = self.current_offset - cd_offset;
        let entries = self.records.len() as u64;

        if EndOfCentralDirectory::needs_zip64(entries, cd_size, cd_offset) {
            let eocd64_offset = self.current_offset;
            let eocd64 = Zip64EndOfCentralDirectory { entries, cd_size, cd_offset };
            self.write_all(&eocd64.to_bytes())?;
            self.write_all(&Zip64Locator { eocd64_offset }.to_bytes())?;
        }

        let eocd = EndOfCentralDirectory::new(entries, cd_size, cd_offset);
        self.write_all(&eocd.to_bytes())?;
        Ok(())
    }

    /// Vuelca el buffer y sincroniza a disco con el handle aún abierto
    fn sync(&mut self) -> io::Result<()> {
        #[cfg(test)]
        if self.fail_sync {
            return Err(io::Error::new(io::ErrorKind::Other, "injected sync failure"));
        }
        let file = self.file()?;
        file.flush()?;
        file.get_ref().sync_all()
    }

    fn remove_partial(&mut self) -> io::Result<()> {
        // Cerrar antes de borrar
        drop(self.file.take());
        match std::fs::remove_file(&self.partial_path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e),
        }
    }
}

impl ArchiveSink for ZipArchiveWriter {
    fn write_entry(&mut self, path: &str, bytes: &[u8]) -> io::Result<()> {
        if path.len() > u16::MAX as usize {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "entry name too long"));
        }
        if !self.names.insert(path.to_string()) {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("duplicate archive entry '{}'", path),
            ));
        }

        let crc32 = crc32fast::hash(bytes);
        let size = bytes.len() as u64;
        let offset = self.current_offset;

        let header = LocalFileHeader::stored(path, crc32, size, self.modified);
        self.write_all(&header.to_bytes())?;
        self.write_all(bytes)?;

        self.records.push(EntryRecord {
            name: path.to_string(),
            crc32,
            size,
            offset,
        });

        Ok(())
    }

    fn finalize(mut self) -> io::Result<()> {
        if let Err(e) = self.write_central_directory().and_then(|()| self.sync()) {
            if let Err(rm) = self.remove_partial() {
                warn!("Could not remove {}: {}", self.partial_path.display(), rm);
            }
            return Err(e);
        }
        drop(self.file.take());

        if let Err(e) = std::fs::rename(&self.partial_path, &self.path) {
            self.remove_partial()?;
            return Err(e);
        }
        debug!(
            "Archive {} finalized ({} entries, {} bytes)",
            self.path.display(),
            self.records.len(),
            self.current_offset
        );
        Ok(())
    }

    fn discard(mut self) -> io::Result<()> {
        debug!("Discarding partial archive {}", self.partial_path.display());
        self.remove_partial()
    }
}

impl Drop for ZipArchiveWriter {
    fn drop(&mut self) {
        // file == None: ya finalizado o descartado
        if self.file.is_some() {
            if let Err(e) = self.remove_partial() {
                warn!("Could not remove {}: {}", self.partial_path.display(), e);
            }
        }
    }
}

/// "<dir>/model.zip" → "<dir>/model.zip.partial"
fn partial_path_for(path: &Path) -> io::Result<PathBuf> {
    let file_name = path.file_name().ok_or_else(|| {
        io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("output path {} has no file name", path.display()),
        )
    })?;
    let mut partial = file_name.to_os_string();
    partial.push(".partial");
    Ok(path.with_file_name(partial))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::ZipArchiveReader;

    #[test]
    fn test_partial_path() {
        let p = partial_path_for(Path::new("/tmp/out/model.zip")).unwrap();
        assert_eq!(p, Path::new("/tmp/out/model.zip.partial"));
        assert!(partial_path_for(Path::new("/")).is_err());
    }

    #[test]
    fn test_write_and_read_back() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("params.zip");

        let mut writer = ZipArchiveWriter::create(&out).unwrap();
        writer.write_entry("float32/modelnorm.weights", &[0u8, 0, 128, 63]).unwrap();
        writer.write_entry("int32/dec0att.query.zeros", &[1u8, 2, 3, 4, 5, 6, 7, 8]).unwrap();
        writer.write_entry("float16/empty", &[]).unwrap();
        assert_eq!(writer.entry_count(), 3);
        assert!(!out.exists());
        writer.finalize().unwrap();

        assert!(out.exists());
        assert!(!dir.path().join("params.zip.partial").exists());

        let reader = ZipArchiveReader::open(&out).unwrap();
        assert_eq!(reader.len(), 3);
        let names: Vec<&str> = reader.entries().iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec![
            "float32/modelnorm.weights",
            "int32/dec0att.query.zeros",
            "float16/empty",
        ]);

        let e = reader.find_by_path("int32/dec0att.query.zeros").unwrap();
        assert_eq!(reader.read(e).unwrap(), &[1u8, 2, 3, 4, 5, 6, 7, 8]);
        assert!(reader.verify(e).unwrap());

        let e = reader.find_by_name("modelnorm.weights").unwrap();
        assert_eq!(reader.read(e).unwrap(), &[0u8, 0, 128, 63]);

        let e = reader.find_by_path("float16/empty").unwrap();
        assert!(reader.read(e).unwrap().is_empty());
    }

    #[test]
    fn test_duplicate_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mut writer = ZipArchiveWriter::create(dir.path().join("dup.zip")).unwrap();
        writer.write_entry("float32/x", &[0; 4]).unwrap();
        let err = writer.write_entry("float32/x", &[0; 4]).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
    }

    #[test]
    fn test_discard_removes_partial() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("gone.zip");

        let mut writer = ZipArchiveWriter::create(&out).unwrap();
        writer.write_entry("float32/x", &[0; 16]).unwrap();
        assert!(writer.partial_path().exists());
        writer.discard().unwrap();

        assert!(!out.exists());
        assert!(!dir.path().join("gone.zip.partial").exists());
    }

    #[test]
    fn test_drop_without_finalize_removes_partial() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("dropped.zip");
        {
            let mut writer = ZipArchiveWriter::create(&out).unwrap();
            writer.write_entry("float32/x", &[0; 16]).unwrap();
        }
        assert!(!out.exists());
        assert!(!dir.path().join("dropped.zip.partial").exists());
    }

    #[test]
    fn test_failed_sync_removes_partial() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("unsynced.zip");

        let mut writer = ZipArchiveWriter::create(&out).unwrap();
        writer.write_entry("float32/x", &[0; 16]).unwrap();
        writer.fail_sync = true;
        assert!(writer.finalize().is_err());

        assert!(!out.exists());
        assert!(!dir.path().join("unsynced.zip.partial").exists());
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn test_empty_archive() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("empty.zip");
        ZipArchiveWriter::create(&out).unwrap().finalize().unwrap();

        // Solo el EOCD
        assert_eq!(std::fs::metadata(&out).unwrap().len(), EOCD_SIZE as u64);
        let reader = ZipArchiveReader::open(&out).unwrap();
        assert!(reader.is_empty());
    }
}
