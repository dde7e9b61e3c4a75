// src/archive/header.rs
// ============================================================================
// ZIP RECORDS - Cabeceras del contenedor ZIP (solo método STORED)
// ============================================================================
//
// Layout (APPNOTE 6.3):
//   [local header + nombre + extra + datos] * N
//   [central directory header + nombre + extra] * N
//   [zip64 EOCD + zip64 locator]   (solo si algo no cabe en 32 bits)
//   [EOCD]
//
// Todo little-endian.
//
// ============================================================================

use std::io::{Cursor, Read};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use chrono::{Datelike, NaiveDateTime, Timelike};

pub const LOCAL_FILE_SIG: u32 = 0x0403_4b50;
pub const CENTRAL_DIR_SIG: u32 = 0x0201_4b50;
pub const EOCD_SIG: u32 = 0x0605_4b50;
pub const ZIP64_EOCD_SIG: u32 = 0x0606_4b50;
pub const ZIP64_LOCATOR_SIG: u32 = 0x0706_4b50;

pub const LOCAL_HEADER_SIZE: usize = 30;
pub const CENTRAL_HEADER_SIZE: usize = 46;
pub const EOCD_SIZE: usize = 22;
pub const ZIP64_EOCD_SIZE: usize = 56;
pub const ZIP64_LOCATOR_SIZE: usize = 20;

/// Id del extra field ZIP64
pub const ZIP64_EXTRA_ID: u16 = 0x0001;

pub const VERSION_DEFAULT: u16 = 20;
pub const VERSION_ZIP64: u16 = 45;
/// Host "made by" = UNIX
pub const HOST_UNIX: u16 = 3 << 8;

pub const METHOD_STORED: u16 = 0;
/// Bit 11: nombre en UTF-8
pub const FLAG_UTF8: u16 = 1 << 11;

/// Valor centinela: el campo real está en el extra ZIP64
pub const U32_SENTINEL: u32 = 0xFFFF_FFFF;
pub const U16_SENTINEL: u16 = 0xFFFF;

/// ¿Necesita ZIP64 este valor?
pub fn overflows_u32(v: u64) -> bool {
    v >= U32_SENTINEL as u64
}

/// Fecha/hora MS-DOS (resolución de 2 segundos, desde 1980)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DosDateTime {
    pub time: u16,
    pub date: u16,
}

impl DosDateTime {
    pub fn from_datetime(dt: &NaiveDateTime) -> Self {
        // DOS no representa nada antes de 1980
        if dt.year() < 1980 {
            return Self { time: 0, date: (1 << 5) | 1 };
        }
        let year = (dt.year() - 1980).min(127) as u16;
        Self {
            time: ((dt.hour() as u16) << 11) | ((dt.minute() as u16) << 5) | (dt.second() as u16 / 2),
            date: (year << 9) | ((dt.month() as u16) << 5) | dt.day() as u16,
        }
    }

    pub fn now() -> Self {
        Self::from_datetime(&chrono::Local::now().naive_local())
    }
}

/// Local file header (30 bytes + nombre + extra)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalFileHeader {
    pub version_needed: u16,
    pub flags: u16,
    pub method: u16,
    pub modified: DosDateTime,
    pub crc32: u32,
    pub compressed_size: u32,
    pub uncompressed_size: u32,
    pub name: Vec<u8>,
    pub extra: Vec<u8>,
}

impl LocalFileHeader {
    /// Cabecera STORED para `size` bytes; añade extra ZIP64 si no cabe en 32 bits
    pub fn stored(name: &str, crc32: u32, size: u64, modified: DosDateTime) -> Self {
        let zip64 = overflows_u32(size);
        let extra = if zip64 {
            let mut extra = Vec::with_capacity(20);
            extra.write_u16::<LittleEndian>(ZIP64_EXTRA_ID).unwrap();
            extra.write_u16::<LittleEndian>(16).unwrap();
            extra.write_u64::<LittleEndian>(size).unwrap();
            extra.write_u64::<LittleEndian>(size).unwrap();
            extra
        } else {
            Vec::new()
        };
        let size32 = if zip64 { U32_SENTINEL } else { size as u32 };

        Self {
            version_needed: if zip64 { VERSION_ZIP64 } else { VERSION_DEFAULT },
            flags: name_flags(name),
            method: METHOD_STORED,
            modified,
            crc32,
            compressed_size: size32,
            uncompressed_size: size32,
            name: name.as_bytes().to_vec(),
            extra,
        }
    }

    pub fn encoded_len(&self) -> usize {
        LOCAL_HEADER_SIZE + self.name.len() + self.extra.len()
    }

    /// Serializa a bytes
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.encoded_len());
        buf.write_u32::<LittleEndian>(LOCAL_FILE_SIG).unwrap();
        buf.write_u16::<LittleEndian>(self.version_needed).unwrap();
        buf.write_u16::<LittleEndian>(self.flags).unwrap();
        buf.write_u16::<LittleEndian>(self.method).unwrap();
        buf.write_u16::<LittleEndian>(self.modified.time).unwrap();
        buf.write_u16::<LittleEndian>(self.modified.date).unwrap();
        buf.write_u32::<LittleEndian>(self.crc32).unwrap();
        buf.write_u32::<LittleEndian>(self.compressed_size).unwrap();
        buf.write_u32::<LittleEndian>(self.uncompressed_size).unwrap();
        buf.write_u16::<LittleEndian>(self.name.len() as u16).unwrap();
        buf.write_u16::<LittleEndian>(self.extra.len() as u16).unwrap();
        buf.extend_from_slice(&self.name);
        buf.extend_from_slice(&self.extra);
        buf
    }

    /// Deserializa desde bytes (incluye nombre y extra)
    pub fn from_bytes(data: &[u8]) -> std::io::Result<Self> {
        let mut cursor = Cursor::new(data);
        expect_signature(&mut cursor, LOCAL_FILE_SIG, "local file header")?;

        let version_needed = cursor.read_u16::<LittleEndian>()?;
        let flags = cursor.read_u16::<LittleEndian>()?;
        let method = cursor.read_u16::<LittleEndian>()?;
        let time = cursor.read_u16::<LittleEndian>()?;
        let date = cursor.read_u16::<LittleEndian>()?;
        let crc32 = cursor.read_u32::<LittleEndian>()?;
        let compressed_size = cursor.read_u32::<LittleEndian>()?;
        let uncompressed_size = cursor.read_u32::<LittleEndian>()?;
        let name_len = cursor.read_u16::<LittleEndian>()? as usize;
        let extra_len = cursor.read_u16::<LittleEndian>()? as usize;

        let mut name = vec![0u8; name_len];
        cursor.read_exact(&mut name)?;
        let mut extra = vec![0u8; extra_len];
        cursor.read_exact(&mut extra)?;

        Ok(Self {
            version_needed,
            flags,
            method,
            modified: DosDateTime { time, date },
            crc32,
            compressed_size,
            uncompressed_size,
            name,
            extra,
        })
    }
}

/// Central directory header (46 bytes + nombre + extra + comentario)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CentralDirectoryHeader {
    pub version_made_by: u16,
    pub version_needed: u16,
    pub flags: u16,
    pub method: u16,
    pub modified: DosDateTime,
    pub crc32: u32,
    pub compressed_size: u64,
    pub uncompressed_size: u64,
    pub external_attrs: u32,
    pub local_header_offset: u64,
    pub name: Vec<u8>,
    pub comment_len: u16,
}

impl CentralDirectoryHeader {
    pub fn stored(name: &str, crc32: u32, size: u64, offset: u64, modified: DosDateTime) -> Self {
        let zip64 = overflows_u32(size) || overflows_u32(offset);
        let version = if zip64 { VERSION_ZIP64 } else { VERSION_DEFAULT };
        Self {
            version_made_by: HOST_UNIX | version,
            version_needed: version,
            flags: name_flags(name),
            method: METHOD_STORED,
            modified,
            crc32,
            compressed_size: size,
            uncompressed_size: size,
            // -rw-r--r--
            external_attrs: 0o100644 << 16,
            local_header_offset: offset,
            name: name.as_bytes().to_vec(),
            comment_len: 0,
        }
    }

    /// Extra ZIP64: solo los campos que no caben, en orden fijo
    fn zip64_extra(&self) -> Vec<u8> {
        let mut fields = Vec::with_capacity(24);
        if overflows_u32(self.uncompressed_size) {
            fields.write_u64::<LittleEndian>(self.uncompressed_size).unwrap();
        }
        if overflows_u32(self.compressed_size) {
            fields.write_u64::<LittleEndian>(self.compressed_size).unwrap();
        }
        if overflows_u32(self.local_header_offset) {
            fields.write_u64::<LittleEndian>(self.local_header_offset).unwrap();
        }
        if fields.is_empty() {
            return fields;
        }

        let mut extra = Vec::with_capacity(4 + fields.len());
        extra.write_u16::<LittleEndian>(ZIP64_EXTRA_ID).unwrap();
        extra.write_u16::<LittleEndian>(fields.len() as u16).unwrap();
        extra.extend_from_slice(&fields);
        extra
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let extra = self.zip64_extra();
        let mut buf = Vec::with_capacity(CENTRAL_HEADER_SIZE + self.name.len() + extra.len());
        buf.write_u32::<LittleEndian>(CENTRAL_DIR_SIG).unwrap();
        buf.write_u16::<LittleEndian>(self.version_made_by).unwrap();
        buf.write_u16::<LittleEndian>(self.version_needed).unwrap();
        buf.write_u16::<LittleEndian>(self.flags).unwrap();
        buf.write_u16::<LittleEndian>(self.method).unwrap();
        buf.write_u16::<LittleEndian>(self.modified.time).unwrap();
        buf.write_u16::<LittleEndian>(self.modified.date).unwrap();
        buf.write_u32::<LittleEndian>(self.crc32).unwrap();
        buf.write_u32::<LittleEndian>(saturate_u32(self.compressed_size)).unwrap();
        buf.write_u32::<LittleEndian>(saturate_u32(self.uncompressed_size)).unwrap();
        buf.write_u16::<LittleEndian>(self.name.len() as u16).unwrap();
        buf.write_u16::<LittleEndian>(extra.len() as u16).unwrap();
        buf.write_u16::<LittleEndian>(0).unwrap(); // comment
        buf.write_u16::<LittleEndian>(0).unwrap(); // disk start
        buf.write_u16::<LittleEndian>(0).unwrap(); // internal attrs
        buf.write_u32::<LittleEndian>(self.external_attrs).unwrap();
        buf.write_u32::<LittleEndian>(saturate_u32(self.local_header_offset)).unwrap();
        buf.extend_from_slice(&self.name);
        buf.extend_from_slice(&extra);
        buf
    }

    /// Deserializa una entrada; devuelve la cabecera y los bytes consumidos
    pub fn from_bytes(data: &[u8]) -> std::io::Result<(Self, usize)> {
        let mut cursor = Cursor::new(data);
        expect_signature(&mut cursor, CENTRAL_DIR_SIG, "central directory header")?;

        let version_made_by = cursor.read_u16::<LittleEndian>()?;
        let version_needed = cursor.read_u16::<LittleEndian>()?;
        let flags = cursor.read_u16::<LittleEndian>()?;
        let method = cursor.read_u16::<LittleEndian>()?;
        let time = cursor.read_u16::<LittleEndian>()?;
        let date = cursor.read_u16::<LittleEndian>()?;
        let crc32 = cursor.read_u32::<LittleEndian>()?;
        let compressed32 = cursor.read_u32::<LittleEndian>()?;
        let uncompressed32 = cursor.read_u32::<LittleEndian>()?;
        let name_len = cursor.read_u16::<LittleEndian>()? as usize;
        let extra_len = cursor.read_u16::<LittleEndian>()? as usize;
        let comment_len = cursor.read_u16::<LittleEndian>()?;
        let _disk_start = cursor.read_u16::<LittleEndian>()?;
        let _internal_attrs = cursor.read_u16::<LittleEndian>()?;
        let external_attrs = cursor.read_u32::<LittleEndian>()?;
        let offset32 = cursor.read_u32::<LittleEndian>()?;

        let mut name = vec![0u8; name_len];
        cursor.read_exact(&mut name)?;
        let mut extra = vec![0u8; extra_len];
        cursor.read_exact(&mut extra)?;

        let mut uncompressed_size = uncompressed32 as u64;
        let mut compressed_size = compressed32 as u64;
        let mut local_header_offset = offset32 as u64;

        if uncompressed32 == U32_SENTINEL || compressed32 == U32_SENTINEL || offset32 == U32_SENTINEL {
            let mut fields = Cursor::new(find_extra(&extra, ZIP64_EXTRA_ID).ok_or_else(|| {
                invalid_data("ZIP64 sentinel without ZIP64 extra field")
            })?);
            if uncompressed32 == U32_SENTINEL {
                uncompressed_size = fields.read_u64::<LittleEndian>()?;
            }
            if compressed32 == U32_SENTINEL {
                compressed_size = fields.read_u64::<LittleEndian>()?;
            }
            if offset32 == U32_SENTINEL {
                local_header_offset = fields.read_u64::<LittleEndian>()?;
            }
        }

        let consumed = CENTRAL_HEADER_SIZE + name_len + extra_len + comment_len as usize;

        Ok((
            Self {
                version_made_by,
                version_needed,
                flags,
                method,
                modified: DosDateTime { time, date },
                crc32,
                compressed_size,
                uncompressed_size,
                external_attrs,
                local_header_offset,
                name,
                comment_len,
            },
            consumed,
        ))
    }
}

/// End of central directory (22 bytes, sin comentario)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct EndOfCentralDirectory {
    pub entries: u16,
    pub cd_size: u32,
    pub cd_offset: u32,
    pub comment_len: u16,
}

impl EndOfCentralDirectory {
    /// Valores reales o centinelas si no caben
    pub fn new(entries: u64, cd_size: u64, cd_offset: u64) -> Self {
        Self {
            entries: if entries >= U16_SENTINEL as u64 { U16_SENTINEL } else { entries as u16 },
            cd_size: saturate_u32(cd_size),
            cd_offset: saturate_u32(cd_offset),
            comment_len: 0,
        }
    }

    pub fn needs_zip64(entries: u64, cd_size: u64, cd_offset: u64) -> bool {
        entries >= U16_SENTINEL as u64 || overflows_u32(cd_size) || overflows_u32(cd_offset)
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(EOCD_SIZE);
        buf.write_u32::<LittleEndian>(EOCD_SIG).unwrap();
        buf.write_u16::<LittleEndian>(0).unwrap(); // disk
        buf.write_u16::<LittleEndian>(0).unwrap(); // disk con el CD
        buf.write_u16::<LittleEndian>(self.entries).unwrap();
        buf.write_u16::<LittleEndian>(self.entries).unwrap();
        buf.write_u32::<LittleEndian>(self.cd_size).unwrap();
        buf.write_u32::<LittleEndian>(self.cd_offset).unwrap();
        buf.write_u16::<LittleEndian>(self.comment_len).unwrap();
        buf
    }

    pub fn from_bytes(data: &[u8]) -> std::io::Result<Self> {
        let mut cursor = Cursor::new(data);
        expect_signature(&mut cursor, EOCD_SIG, "end of central directory")?;

        let disk = cursor.read_u16::<LittleEndian>()?;
        let cd_disk = cursor.read_u16::<LittleEndian>()?;
        let entries_disk = cursor.read_u16::<LittleEndian>()?;
        let entries = cursor.read_u16::<LittleEndian>()?;
        if disk != 0 || cd_disk != 0 || entries_disk != entries {
            return Err(invalid_data("multi-disk archives are not supported"));
        }

        Ok(Self {
            entries,
            cd_size: cursor.read_u32::<LittleEndian>()?,
            cd_offset: cursor.read_u32::<LittleEndian>()?,
            comment_len: cursor.read_u16::<LittleEndian>()?,
        })
    }

    /// ¿Algún campo es centinela? (hay que leer el registro ZIP64)
    pub fn is_zip64(&self) -> bool {
        self.entries == U16_SENTINEL || self.cd_size == U32_SENTINEL || self.cd_offset == U32_SENTINEL
    }
}

/// Registro ZIP64 end of central directory (56 bytes)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Zip64EndOfCentralDirectory {
    pub entries: u64,
    pub cd_size: u64,
    pub cd_offset: u64,
}

impl Zip64EndOfCentralDirectory {
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(ZIP64_EOCD_SIZE);
        buf.write_u32::<LittleEndian>(ZIP64_EOCD_SIG).unwrap();
        // Tamaño del resto del registro (sin firma ni este campo)
        buf.write_u64::<LittleEndian>((ZIP64_EOCD_SIZE - 12) as u64).unwrap();
        buf.write_u16::<LittleEndian>(HOST_UNIX | VERSION_ZIP64).unwrap();
        buf.write_u16::<LittleEndian>(VERSION_ZIP64).unwrap();
        buf.write_u32::<LittleEndian>(0).unwrap(); // disk
        buf.write_u32::<LittleEndian>(0).unwrap(); // disk con el CD
        buf.write_u64::<LittleEndian>(self.entries).unwrap();
        buf.write_u64::<LittleEndian>(self.entries).unwrap();
        buf.write_u64::<LittleEndian>(self.cd_size).unwrap();
        buf.write_u64::<LittleEndian>(self.cd_offset).unwrap();
        buf
    }

    pub fn from_bytes(data: &[u8]) -> std::io::Result<Self> {
        let mut cursor = Cursor::new(data);
        expect_signature(&mut cursor, ZIP64_EOCD_SIG, "zip64 end of central directory")?;

        let _record_size = cursor.read_u64::<LittleEndian>()?;
        let _made_by = cursor.read_u16::<LittleEndian>()?;
        let _needed = cursor.read_u16::<LittleEndian>()?;
        let _disk = cursor.read_u32::<LittleEndian>()?;
        let _cd_disk = cursor.read_u32::<LittleEndian>()?;
        let _entries_disk = cursor.read_u64::<LittleEndian>()?;

        Ok(Self {
            entries: cursor.read_u64::<LittleEndian>()?,
            cd_size: cursor.read_u64::<LittleEndian>()?,
            cd_offset: cursor.read_u64::<LittleEndian>()?,
        })
    }
}

/// Locator del registro ZIP64 (20 bytes, justo antes del EOCD)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Zip64Locator {
    pub eocd64_offset: u64,
}

impl Zip64Locator {
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(ZIP64_LOCATOR_SIZE);
        buf.write_u32::<LittleEndian>(ZIP64_LOCATOR_SIG).unwrap();
        buf.write_u32::<LittleEndian>(0).unwrap(); // disk del registro
        buf.write_u64::<LittleEndian>(self.eocd64_offset).unwrap();
        buf.write_u32::<LittleEndian>(1).unwrap(); // total disks
        buf
    }

    pub fn from_bytes(data: &[u8]) -> std::io::Result<Self> {
        let mut cursor = Cursor::new(data);
        expect_signature(&mut cursor, ZIP64_LOCATOR_SIG, "zip64 locator")?;
        let _disk = cursor.read_u32::<LittleEndian>()?;
        Ok(Self {
            eocd64_offset: cursor.read_u64::<LittleEndian>()?,
        })
    }
}

fn name_flags(name: &str) -> u16 {
    if name.is_ascii() { 0 } else { FLAG_UTF8 }
}

fn saturate_u32(v: u64) -> u32 {
    if overflows_u32(v) { U32_SENTINEL } else { v as u32 }
}

fn expect_signature(cursor: &mut Cursor<&[u8]>, sig: u32, what: &str) -> std::io::Result<()> {
    let found = cursor.read_u32::<LittleEndian>()?;
    if found != sig {
        return Err(invalid_data(&format!("invalid {} signature 0x{:08X}", what, found)));
    }
    Ok(())
}

/// Busca un extra field por id
fn find_extra(extra: &[u8], id: u16) -> Option<&[u8]> {
    let mut pos = 0;
    while pos + 4 <= extra.len() {
        let field_id = u16::from_le_bytes([extra[pos], extra[pos + 1]]);
        let len = u16::from_le_bytes([extra[pos + 2], extra[pos + 3]]) as usize;
        let end = (pos + 4 + len).min(extra.len());
        if field_id == id {
            return Some(&extra[pos + 4..end]);
        }
        pos = end;
    }
    None
}

fn invalid_data(msg: &str) -> std::io::Error {
    std::io::Error::new(std::io::ErrorKind::InvalidData, msg.to_string())
}
