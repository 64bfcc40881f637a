use tracing::{debug, trace, warn};
use vega_gmmu::{AddressSpace, AddressSpaceError, HostMemory};

use crate::engine::{EngineId, Engines};
use crate::entry::{GpEntry, GpEntryOpcode, MethodHeader, SecOp};

/// Methods below this count are handled by the channel's own GPFIFO control
/// registers rather than a bound engine.
pub const GPFIFO_REGISTER_COUNT: u16 = 0x40;

/// Methods at or above this count are macro calls into the bound engine.
pub const ENGINE_METHOD_COUNT: u16 = 0xE00;

const SUBCHANNEL_COUNT: usize = 8;

#[derive(Debug, thiserror::Error)]
pub enum GpfifoError {
    /// A method header used an operation the decoder does not implement;
    /// continuing would desynchronize the method stream.
    #[error("unsupported pushbuffer method secOp {sec_op} at word {index}")]
    UnsupportedSecOp { sec_op: u8, index: usize },
    #[error(transparent)]
    Memory(#[from] AddressSpaceError),
}

/// How the target address advances per data word of an in-flight method.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AddressMode {
    Increment,
    Hold,
    /// Increment once after the first word, then hold.
    IncrementOnce,
}

/// An in-flight method sequence; persisted across GPFIFO entry boundaries
/// when its data words are split over two pushbuffer segments.
#[derive(Debug, Clone, Copy)]
struct MethodState {
    mode: AddressMode,
    address: u16,
    subchannel: u8,
    remaining: u16,
}

/// Per-channel pushbuffer decoder.
///
/// Walks pushbuffer segments out of the channel's GPU address space and
/// dispatches every method call to the engine bound to its subchannel.
pub struct ChannelGpfifo<E: Engines> {
    engines: E,
    subchannels: [Option<EngineId>; SUBCHANNEL_COUNT],
    /// Raw GPFIFO control registers; semantics beyond storage are handled by
    /// the engines driving channel synchronization.
    gpfifo_registers: [u32; GPFIFO_REGISTER_COUNT as usize],
    resume: Option<MethodState>,
    /// Persistent buffer for segment contents to avoid per-entry allocation.
    pushbuffer: Vec<u32>,
}

impl<E: Engines> ChannelGpfifo<E> {
    pub fn new(engines: E) -> Self {
        Self {
            engines,
            subchannels: [None; SUBCHANNEL_COUNT],
            gpfifo_registers: [0; GPFIFO_REGISTER_COUNT as usize],
            resume: None,
            pushbuffer: Vec::new(),
        }
    }

    pub fn engines(&self) -> &E {
        &self.engines
    }

    pub fn engines_mut(&mut self) -> &mut E {
        &mut self.engines
    }

    /// Current value of a GPFIFO control register.
    pub fn gpfifo_register(&self, method: u16) -> u32 {
        self.gpfifo_registers[method as usize]
    }

    /// Dispatches one method call.
    fn send(&mut self, method: u16, argument: u32, subchannel: u8, last: bool) {
        trace!(
            method = format_args!("0x{method:X}"),
            argument = format_args!("0x{argument:X}"),
            subchannel,
            last,
            "GPU method call"
        );

        if method == 0 {
            // Binds the engine with the given class ID to the subchannel.
            match EngineId::from_raw(argument) {
                Some(engine) => {
                    self.subchannels[subchannel as usize] = Some(engine);
                    debug!(engine = ?engine, subchannel, "bound engine to subchannel");
                }
                None => warn!(
                    class = format_args!("0x{argument:X}"),
                    subchannel, "cannot bind unknown engine class"
                ),
            }
        } else if method < GPFIFO_REGISTER_COUNT {
            self.gpfifo_registers[method as usize] = argument;
        } else {
            let Some(engine) = self.subchannels[subchannel as usize] else {
                warn!(method, subchannel, "method call on unbound subchannel");
                return;
            };

            if method < ENGINE_METHOD_COUNT {
                self.engines.call_method(engine, method, argument, last);
            } else {
                self.engines
                    .macro_call(engine, method - ENGINE_METHOD_COUNT, argument, last);
            }
        }
    }

    /// Feeds data words into an in-flight method starting at `index`,
    /// stashing the state for the next entry if the segment runs out first.
    ///
    /// Returns the index of the first unconsumed word.
    fn run_method(&mut self, mut state: MethodState, start: usize) -> usize {
        let mut index = start;
        while state.remaining != 0 {
            let Some(&value) = self.pushbuffer.get(index) else {
                // Split method sequence; continue at the next entry.
                self.resume = Some(state);
                return index;
            };

            self.send(state.address, value, state.subchannel, state.remaining == 1);
            match state.mode {
                AddressMode::Increment => state.address += 1,
                AddressMode::Hold => {}
                AddressMode::IncrementOnce => {
                    // After the first word the address holds, including after
                    // a resume on the next entry.
                    state.address += 1;
                    state.mode = AddressMode::Hold;
                }
            }
            state.remaining -= 1;
            index += 1;
        }
        index
    }

    /// Processes one GPFIFO entry's pushbuffer segment.
    pub fn process<M: HostMemory>(
        &mut self,
        space: &AddressSpace,
        mem: &M,
        entry: GpEntry,
    ) -> Result<(), GpfifoError> {
        let size = entry.size_words() as usize;
        if size == 0 {
            // Control entries carry no pushbuffer.
            match entry.opcode() {
                GpEntryOpcode::Nop => {}
                opcode => warn!(?opcode, "unsupported GPFIFO control entry"),
            }
            return Ok(());
        }

        self.pushbuffer.resize(size, 0);
        space.read_words(mem, entry.address(), &mut self.pushbuffer)?;

        let mut index = 0;
        if let Some(state) = self.resume.take() {
            index = self.run_method(state, 0);
        }

        while index < self.pushbuffer.len() {
            let word = self.pushbuffer[index];
            if word == 0 {
                // All-zero words are NOPs.
                index += 1;
                continue;
            }

            let header = MethodHeader(word);
            let state = |mode| MethodState {
                mode,
                address: header.address(),
                subchannel: header.subchannel(),
                remaining: header.count(),
            };

            match SecOp::from_raw(header.sec_op_raw()) {
                Some(SecOp::IncMethod) => {
                    index = self.run_method(state(AddressMode::Increment), index + 1);
                }
                Some(SecOp::NonIncMethod) => {
                    index = self.run_method(state(AddressMode::Hold), index + 1);
                }
                Some(SecOp::OneInc) => {
                    index = self.run_method(state(AddressMode::IncrementOnce), index + 1);
                }
                Some(SecOp::ImmdDataMethod) => {
                    self.send(header.address(), header.immd_data(), header.subchannel(), true);
                    index += 1;
                }
                Some(SecOp::EndPbSegment) => return Ok(()),
                None => {
                    return Err(GpfifoError::UnsupportedSecOp {
                        sec_op: header.sec_op_raw(),
                        index,
                    })
                }
            }
        }

        Ok(())
    }
}
