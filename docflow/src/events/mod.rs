//! The progress/log sink shared by every stage of a run.

mod sink;

pub use sink::{names, CollectingEventSink, EventSink, LoggingEventSink, NoOpEventSink};
