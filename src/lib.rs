//! Forensic access to NTFS volumes: locating drives and partitions, decoding MFT
//! records and attribute streams, and reading volume shadow copies as they were
//! when each snapshot was taken.

pub mod compression;
pub mod context;
pub mod error;
pub mod io;
pub mod location;
pub mod mft;
pub mod models;
pub mod output;
pub mod shadow;

pub use context::ScanContext;
pub use error::{ForgeError, Result};
pub use io::SectorReader;
