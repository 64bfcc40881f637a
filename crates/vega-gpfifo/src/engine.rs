//! The seam between the decoder and the GPU engine state machines.

/// Host class IDs of the engines a subchannel can be bound to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EngineId {
    Fermi2D,
    KeplerMemory,
    Maxwell3D,
    MaxwellCompute,
    MaxwellDma,
}

impl EngineId {
    pub fn from_raw(raw: u32) -> Option<EngineId> {
        match raw {
            0x902D => Some(EngineId::Fermi2D),
            0xA140 => Some(EngineId::KeplerMemory),
            0xB197 => Some(EngineId::Maxwell3D),
            0xB1C0 => Some(EngineId::MaxwellCompute),
            0xB0B5 => Some(EngineId::MaxwellDma),
            _ => None,
        }
    }

    pub fn raw(self) -> u32 {
        match self {
            EngineId::Fermi2D => 0x902D,
            EngineId::KeplerMemory => 0xA140,
            EngineId::Maxwell3D => 0xB197,
            EngineId::MaxwellCompute => 0xB1C0,
            EngineId::MaxwellDma => 0xB0B5,
        }
    }
}

/// The engine state machines behind a channel's subchannels.
///
/// The decoder is the sole caller. `last` marks the final call produced by one
/// method header, which lets engines defer work until a sequence completes.
pub trait Engines {
    fn call_method(&mut self, engine: EngineId, method: u16, argument: u32, last: bool);

    /// A macro program invocation; `offset` selects the macro, counted from
    /// the end of the normal register space.
    fn macro_call(&mut self, engine: EngineId, offset: u16, argument: u32, last: bool);
}
