// src/archive/mod.rs
// ============================================================================
// ARCHIVE - Destino de las entradas (ZIP store-only o memoria)
// ============================================================================

pub mod header;
pub mod reader;
pub mod writer;

use std::io;

pub use reader::{ZipArchiveReader, ZipEntry};
pub use writer::ZipArchiveWriter;

/// Destino de escritura del encoder.
///
/// Recurso con ámbito: tras el primer write se cierra con `finalize()` (éxito)
/// o `discard()` (fallo), exactamente una vez.
pub trait ArchiveSink {
    /// Escribe una entrada. Cada ruta se escribe como mucho una vez.
    fn write_entry(&mut self, path: &str, bytes: &[u8]) -> io::Result<()>;

    /// Cierra el archivo como válido
    fn finalize(self) -> io::Result<()>;

    /// Abandona el archivo incompleto
    fn discard(self) -> io::Result<()>;
}

/// Estado de un archivo en memoria
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ArchiveState {
    #[default]
    Open,
    Finalized,
    Discarded,
}

/// Archivo en memoria.
///
/// Se usa como `&mut MemoryArchive` para poder inspeccionarlo después de
/// `finalize()` / `discard()`.
#[derive(Debug, Default, Clone)]
pub struct MemoryArchive {
    entries: Vec<(String, Vec<u8>)>,
    state: ArchiveState,
}

impl MemoryArchive {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> ArchiveState {
        self.state
    }

    pub fn is_finalized(&self) -> bool {
        self.state == ArchiveState::Finalized
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Rutas en orden de escritura
    pub fn paths(&self) -> Vec<&str> {
        self.entries.iter().map(|(p, _)| p.as_str()).collect()
    }

    pub fn get(&self, path: &str) -> Option<&[u8]> {
        self.entries
            .iter()
            .find(|(p, _)| p == path)
            .map(|(_, b)| b.as_slice())
    }

    fn ensure_open(&self) -> io::Result<()> {
        if self.state != ArchiveState::Open {
            return Err(io::Error::new(
                io::ErrorKind::Other,
                format!("archive already {:?}", self.state),
            ));
        }
        Ok(())
    }
}

impl ArchiveSink for &mut MemoryArchive {
    fn write_entry(&mut self, path: &str, bytes: &[u8]) -> io::Result<()> {
        self.ensure_open()?;
        if self.entries.iter().any(|(p, _)| p == path) {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("duplicate archive entry '{}'", path),
            ));
        }
        self.entries.push((path.to_string(), bytes.to_vec()));
        Ok(())
    }

    fn finalize(self) -> io::Result<()> {
        self.ensure_open()?;
        self.state = ArchiveState::Finalized;
        Ok(())
    }

    fn discard(self) -> io::Result<()> {
        self.ensure_open()?;
        self.state = ArchiveState::Discarded;
        Ok(())
    }
}
