// decompress/src/lib.rs

pub mod extractor;
pub mod restorer;
pub mod unpacker;

pub use extractor::{ExtractMode, ExtractorSink};
pub use restorer::{restore_stream, RestoreStats};
pub use unpacker::{extract_archive, extract_archive_with, extract_from_reader};
