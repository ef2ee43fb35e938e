use std::fmt::{self, Display, Write};

use crate::compiler::CompileError;

/// Instructions of the native backend's stack program.
///
/// Operands follow the opcode byte as little-endian `u16`s.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpCode {
    /// `constant: u16`
    Constant,
    /// `identifier: u16`
    Variable,
    Add,
    Subtract,
    Multiply,
    Divide,
    Modulo,
    Power,
    Negate,
    /// `slot: u16`. Pops into the scratch buffer.
    Store,
    /// `identifier: u16, offset: u16, count: u16`. Calls with
    /// `scratch[offset..offset + count]` and pushes the result.
    Call,
    Return,
    Sentinel,
}

impl From<OpCode> for u8 {
    fn from(value: OpCode) -> u8 {
        value as u8
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error(
    "Invalid byte {0} found when expecting OpCode value between 0 and {}",
    OpCode::Sentinel as u8
)]
pub struct OpCodeFromU8Error(u8);

impl TryFrom<u8> for OpCode {
    type Error = OpCodeFromU8Error;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        if value < OpCode::Sentinel as u8 {
            Ok(unsafe { std::mem::transmute::<u8, OpCode>(value) })
        } else {
            Err(OpCodeFromU8Error(value))
        }
    }
}

/// The stack program of one expression, before it is translated to
/// machine code.
///
/// Besides the code it records how many scratch slots the calls in it need
/// and how deep the operand stack gets.
#[derive(Debug, Clone)]
pub struct Chunk {
    name: String,
    code: Vec<u8>,
    constants: Vec<f64>,
    identifiers: Vec<String>,
    scratch_size: usize,
    stack_size: usize,
}

impl Chunk {
    pub(crate) fn new(name: &str, scratch_size: usize) -> Self {
        Self {
            name: name.to_string(),
            code: Vec::new(),
            constants: Vec::new(),
            identifiers: Vec::new(),
            scratch_size,
            stack_size: 0,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn code(&self) -> &[u8] {
        &self.code
    }

    pub fn scratch_size(&self) -> usize {
        self.scratch_size
    }

    pub fn stack_size(&self) -> usize {
        self.stack_size
    }

    pub(crate) fn set_stack_size(&mut self, stack_size: usize) {
        self.stack_size = stack_size;
    }

    pub fn get_bytecode(&self, offset: usize) -> u8 {
        *self
            .code
            .get(offset)
            .expect("Chunk reader should only request valid offsets")
    }

    pub fn get_u16(&self, offset: usize) -> u16 {
        u16::from_le_bytes([self.get_bytecode(offset), self.get_bytecode(offset + 1)])
    }

    pub fn get_constant(&self, index: u16) -> f64 {
        *self
            .constants
            .get(index as usize)
            .expect("Chunk reader should only request valid constants")
    }

    pub fn get_identifier(&self, index: u16) -> &str {
        self.identifiers
            .get(index as usize)
            .expect("Chunk reader should only request valid identifiers")
    }

    pub(crate) fn add_bytecode(&mut self, byte: impl Into<u8>) {
        self.code.push(byte.into());
    }

    pub(crate) fn add_u16(&mut self, value: u16) {
        self.code.extend_from_slice(&value.to_le_bytes());
    }

    pub(crate) fn add_constant(&mut self, value: f64) -> Result<u16, CompileError> {
        let index =
            u16::try_from(self.constants.len()).map_err(|_| CompileError::TooManyConstants)?;
        self.constants.push(value);
        Ok(index)
    }

    pub(crate) fn add_identifier(&mut self, identifier: &str) -> Result<u16, CompileError> {
        let index =
            u16::try_from(self.identifiers.len()).map_err(|_| CompileError::TooManyIdentifiers)?;
        self.identifiers.push(identifier.to_string());
        Ok(index)
    }

    /// Writes one instruction and returns the offset of the next.
    pub fn disassemble_instruction(
        &self,
        f: &mut impl Write,
        offset: usize,
    ) -> Result<usize, fmt::Error> {
        write!(f, "{:04} ", offset)?;

        let instruction = self.code[offset];
        match OpCode::try_from(instruction).expect("Bytecode should contain valid opcodes") {
            OpCode::Constant => {
                let constant = self.get_u16(offset + 1);
                writeln!(
                    f,
                    "{:<16} {:4} '{}'",
                    "OP_CONSTANT",
                    constant,
                    self.get_constant(constant)
                )?;
                Ok(offset + 3)
            }
            OpCode::Variable => {
                let identifier = self.get_u16(offset + 1);
                writeln!(
                    f,
                    "{:<16} {:4} '{}'",
                    "OP_VARIABLE",
                    identifier,
                    self.get_identifier(identifier)
                )?;
                Ok(offset + 3)
            }
            OpCode::Store => {
                writeln!(f, "{:<16} {:4}", "OP_STORE", self.get_u16(offset + 1))?;
                Ok(offset + 3)
            }
            OpCode::Call => {
                let identifier = self.get_u16(offset + 1);
                let start = self.get_u16(offset + 3);
                let count = self.get_u16(offset + 5);
                writeln!(
                    f,
                    "{:<16} {:4} '{}' [{}..{}]",
                    "OP_CALL",
                    identifier,
                    self.get_identifier(identifier),
                    start,
                    start as usize + count as usize
                )?;
                Ok(offset + 7)
            }
            OpCode::Add => simple_instruction(f, "OP_ADD", offset),
            OpCode::Subtract => simple_instruction(f, "OP_SUBTRACT", offset),
            OpCode::Multiply => simple_instruction(f, "OP_MULTIPLY", offset),
            OpCode::Divide => simple_instruction(f, "OP_DIVIDE", offset),
            OpCode::Modulo => simple_instruction(f, "OP_MODULO", offset),
            OpCode::Power => simple_instruction(f, "OP_POWER", offset),
            OpCode::Negate => simple_instruction(f, "OP_NEGATE", offset),
            OpCode::Return => simple_instruction(f, "OP_RETURN", offset),
            OpCode::Sentinel => panic!("Sentinel opcode should not be present in bytecode"),
        }
    }
}

fn simple_instruction(f: &mut impl Write, name: &str, offset: usize) -> Result<usize, fmt::Error> {
    writeln!(f, "{}", name)?;
    Ok(offset + 1)
}

impl Display for Chunk {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "== {} ==", self.name)?;
        writeln!(
            f,
            "scratch slots: {}, stack slots: {}",
            self.scratch_size, self.stack_size
        )?;

        let mut offset = 0;
        while offset < self.code.len() {
            offset = self.disassemble_instruction(f, offset)?;
        }
        Ok(())
    }
}
