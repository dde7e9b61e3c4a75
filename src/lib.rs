// src/lib.rs
// ============================================================================
// WEIGHTPACK - Checkpoint GPTQ → archivo ZIP con prefijo de tipo
// ============================================================================

pub mod archive;
pub mod dictionary;
pub mod encoder;
pub mod mapping;
pub mod safetensor;
pub mod store;
pub mod tensor;

// Re-exports principales
pub use archive::{ArchiveSink, MemoryArchive, ZipArchiveReader, ZipArchiveWriter};
pub use encoder::{convert, encode, ArchiveEncoder, EncodeError, EncodeStats, TypePrefix};
pub use mapping::{generate, MappingEntry, NameMap};
pub use safetensor::SafetensorReader;
pub use store::{ParameterStore, TensorMap};
pub use tensor::{ElementType, Tensor};
