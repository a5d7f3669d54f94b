// Nova Bytecode
// Instruction set and chunk representation consumed by the VM

pub mod chunk;
pub mod opcode;

pub use chunk::{Chunk, Constant};
pub use opcode::OpCode;
