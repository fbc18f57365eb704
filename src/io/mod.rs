pub mod layout;
pub mod master;
pub mod segment;

pub use layout::{RunLayout, SegmentFile, SegmentName, SegmentState};
pub use master::{MasterLog, MasterRecords, RecordSink};
pub use segment::{AppendReceipt, SegmentReader, SegmentSummary, SegmentWriter};
