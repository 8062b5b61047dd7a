pub mod entry;
pub mod log;
pub mod server;

pub use entry::{EntryKind, LogEntry, NewEntry};
pub use log::EventLog;

pub mod feed_proto {
    tonic::include_proto!("eventfeed");
}
