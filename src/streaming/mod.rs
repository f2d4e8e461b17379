//! Streaming I/O over chunked storage backends.
//!
//! Two independent stream types share an event channel and chunk planning:
//!
//! ```text
//! Read:   ChunkPlan -> read_part -> [held while paused] -> data ... finish
//! Write:  write() -> queue -> [priming] -> write_part (one at a time) -> drain
//! ```
//!
//! Both report progress through `EventChannel` (`data`, `finish`, `drain`,
//! `pause`, `resume`, `stop`, `error`, `debug`). An `error` with no listener
//! fails the calling operation instead of being dropped.

pub mod chunks;
pub mod events;
pub mod flow;
pub mod reader;
pub mod writer;

#[cfg(test)]
pub(crate) mod test_utils;

pub use chunks::{ChunkPlan, Chunks};
pub use events::{EventChannel, EventKind, Handler, ListenerId, Publisher, StreamEvent};
pub use flow::{Flow, FlowControl};
pub use reader::{ReadOutcome, ReadState, ReadStream};
pub use writer::{WriteAck, WriteOutcome, WriteState, WriteStream};
