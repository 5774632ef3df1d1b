pub mod attributes;
pub mod boot;
pub mod cache;
pub mod fixup;
pub mod record;
pub mod runlist;
pub mod sizer;
pub mod utils;
pub mod volume;

pub use attributes::{Attribute, AttributeListEntry, DataAttribute, FileReference};
pub use cache::RecordCache;
pub use record::{MftRecord, MftRecordHeader, MftRecordParser};
pub use sizer::get_data_size;
pub use volume::{NtfsVolume, WalkSummary};
