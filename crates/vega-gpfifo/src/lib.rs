//! Guest GPU pushbuffer (GPFIFO) decoding.
//!
//! The guest submits work as GPFIFO entries, each pointing at a pushbuffer
//! segment in the GPU virtual address space. A segment is a stream of 32-bit
//! words: method headers followed by data words, dispatched to whichever
//! engine the guest bound to the header's subchannel. A single method's data
//! words may be split across two independently submitted segments, so the
//! decoder carries resume state across entry boundaries.
//!
//! One [`ChannelGpfifo`] exists per logical GPU channel and is driven by that
//! channel's host thread; it has no internal locking.

mod channel;
mod engine;
mod entry;
mod fifo;


pub use channel::{ChannelGpfifo, GpfifoError, ENGINE_METHOD_COUNT, GPFIFO_REGISTER_COUNT};
pub use engine::{EngineId, Engines};
pub use entry::{GpEntry, GpEntryOpcode, MethodHeader, SecOp};
pub use fifo::PushbufferFifo;
