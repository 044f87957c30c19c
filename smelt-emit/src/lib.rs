//! Method-at-a-time machine-code emission: instruction descriptors are
//! buffered in groups, branches are resolved to their smallest encoding
//! form, GC liveness and debugger variable locations are tracked along
//! the way, and the finished method is handed to the compiler host as
//! code bytes plus offset-keyed tables.

pub mod code;
pub mod config;
pub mod emitter;
pub mod error;
pub mod gc;
pub mod host;
pub mod ig;
pub mod instr;
pub mod jump;
pub mod layout;
pub mod pool;
pub mod reg;
pub mod scope;
pub mod target;

pub use code::{Address, CodeDescriptor, RelocationKind, SafepointEntry, CODE_ALIGNMENT};
pub use config::EmitConfig;
pub use emitter::{BlockLabel, MethodEmitter};
pub use error::{EmitResult, FatalError};
pub use gc::{GcType, PointerKind, WriteBarrierForm};
pub use host::{CodeAllocation, CompilerHost, RecordingHost};
pub use instr::{CallTarget, InstrDesc, InstrId, InstrPayload, Opcode, OperandSize};
pub use reg::{FReg, Reg, RegSet};
pub use scope::{VarId, VarLoc};
pub use target::{Arch, CondCode};
