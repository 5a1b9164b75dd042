//! Send side - splitting, sending and outcome reconciliation.

mod batch;
mod range;
mod sender;
mod splitter;

pub use batch::{
    Batch, BatchId, BatchNotification, BatchOutcome, BatchTracker, SplitChild,
    FAILURE_CAUSE_ATTRIBUTE,
};
pub use range::{merge_ranges, ByteRange, MergedRange};
pub use sender::{FlowSender, OutboundArtifact};
pub use splitter::{parse_delimiter, split_messages, MessageSpan};
