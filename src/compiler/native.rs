pub mod bytecode;

use cranelift::prelude::Value;
use rustc_hash::FxHashMap;

use crate::{
    ast::{Node, Operator},
    evaluator::Evaluator,
    ir::BinaryOp,
    jit::{Jit, Translator},
};

use self::bytecode::{Chunk, OpCode};

use super::{Backend, CompileError, Compiler};

/// Compiles to machine code by way of a stack program.
///
/// The tree is first flattened into a [`Chunk`] whose scratch buffer for
/// call parameters is sized before any code is emitted. The chunk is then
/// translated to Cranelift IR, with the operand stack simulated by SSA
/// values and the scratch buffer living in a single stack slot of the
/// compiled function.
#[derive(Debug, Clone, Copy, Default)]
pub struct NativeCompiler;

impl NativeCompiler {
    pub fn chunk(&self, name: &str, tree: &Node) -> Result<Chunk, CompileError> {
        let scratch_size = scratch_size(tree);
        if scratch_size > u16::MAX as usize {
            return Err(CompileError::ScratchOverflow(scratch_size));
        }

        let mut emitter = Emitter::new(name, scratch_size);
        emitter.tree(tree)?;
        Ok(emitter.finish())
    }
}

impl Compiler for NativeCompiler {
    fn compile(&self, name: &str, tree: &Node) -> Result<Evaluator, CompileError> {
        let chunk = self.chunk(name, tree)?;
        log::debug!(
            "Compiled {} into {} bytes with {} scratch and {} stack slots",
            name,
            chunk.code().len(),
            chunk.scratch_size(),
            chunk.stack_size()
        );

        #[cfg(feature = "disassemble")]
        print!("{}", chunk);

        let function = Jit::new()?.compile(name, |translator| translate(&chunk, translator))?;
        Ok(Evaluator::new(name, Backend::Native, move |context| {
            function.invoke(context)
        }))
    }
}

/// Scratch slots needed to evaluate `tree`.
///
/// A call whose parameters start at slot `base` owns `base..base + n`.
/// Parameter `i` is evaluated while slots `base..base + i` hold its finished
/// siblings, so any call nested in it starts at `base + i`.
pub fn scratch_size(tree: &Node) -> usize {
    let mut size = 0;
    let mut pending = vec![(tree, 0)];
    while let Some((node, base)) = pending.pop() {
        match node {
            Node::Function(_, parameters) => {
                size = size.max(base + parameters.len());
                pending.extend(
                    parameters
                        .iter()
                        .enumerate()
                        .map(|(i, parameter)| (parameter, base + i)),
                );
            }
            node => pending.extend(node.children().into_iter().map(|child| (child, base))),
        }
    }
    size
}

enum Pending<'a> {
    Visit(&'a Node, usize),
    Binary(OpCode),
    Negate,
    Store(usize),
    Call(&'a str, usize, usize),
}

struct Emitter {
    chunk: Chunk,
    constants: FxHashMap<u64, u16>,
    identifiers: FxHashMap<String, u16>,
    depth: usize,
    max_depth: usize,
}

impl Emitter {
    fn new(name: &str, scratch_size: usize) -> Self {
        Self {
            chunk: Chunk::new(name, scratch_size),
            constants: FxHashMap::default(),
            identifiers: FxHashMap::default(),
            depth: 0,
            max_depth: 0,
        }
    }

    fn finish(mut self) -> Chunk {
        self.emit(OpCode::Return);
        self.chunk.set_stack_size(self.max_depth);
        self.chunk
    }

    /// Emits `tree` in post-order, parameters of a call starting at `base`.
    fn tree(&mut self, tree: &Node) -> Result<(), CompileError> {
        let mut pending = vec![Pending::Visit(tree, 0)];
        while let Some(item) = pending.pop() {
            match item {
                Pending::Visit(Node::Number(value), _) => {
                    let index = self.constant(*value)?;
                    self.emit_u16(OpCode::Constant, index);
                    self.push();
                }
                Pending::Visit(Node::Variable(identifier), _) => {
                    let index = self.identifier(identifier)?;
                    self.emit_u16(OpCode::Variable, index);
                    self.push();
                }
                Pending::Visit(Node::Operator(op, left, right), base) => {
                    pending.push(Pending::Binary(match op {
                        Operator::Plus => OpCode::Add,
                        Operator::Minus => OpCode::Subtract,
                        Operator::Multiply => OpCode::Multiply,
                        Operator::Divide => OpCode::Divide,
                        Operator::Modulo => OpCode::Modulo,
                        Operator::Exponent => OpCode::Power,
                    }));
                    pending.push(Pending::Visit(right, base));
                    pending.push(Pending::Visit(left, base));
                }
                Pending::Visit(Node::Unary(Operator::Plus, child), base) => {
                    pending.push(Pending::Visit(child, base));
                }
                Pending::Visit(Node::Unary(Operator::Minus, child), base) => {
                    pending.push(Pending::Negate);
                    pending.push(Pending::Visit(child, base));
                }
                Pending::Visit(Node::Unary(op, _), _) => {
                    return Err(CompileError::UnknownUnaryOperator(*op))
                }
                Pending::Visit(Node::Function(identifier, parameters), base) => {
                    pending.push(Pending::Call(identifier, base, parameters.len()));
                    for (i, parameter) in parameters.iter().enumerate().rev() {
                        pending.push(Pending::Store(base + i));
                        pending.push(Pending::Visit(parameter, base + i));
                    }
                }
                Pending::Binary(op) => {
                    self.emit(op);
                    self.pop();
                }
                Pending::Negate => self.emit(OpCode::Negate),
                Pending::Store(slot) => {
                    let slot = self.slot(slot)?;
                    self.emit_u16(OpCode::Store, slot);
                    self.pop();
                }
                Pending::Call(identifier, base, count) => {
                    let index = self.identifier(identifier)?;
                    let start = self.slot(base)?;
                    let count = self.slot(count)?;
                    self.emit_u16(OpCode::Call, index);
                    self.chunk.add_u16(start);
                    self.chunk.add_u16(count);
                    self.push();
                }
            }
        }
        Ok(())
    }

    fn constant(&mut self, value: f64) -> Result<u16, CompileError> {
        if let Some(index) = self.constants.get(&value.to_bits()) {
            return Ok(*index);
        }
        let index = self.chunk.add_constant(value)?;
        self.constants.insert(value.to_bits(), index);
        Ok(index)
    }

    fn identifier(&mut self, identifier: &str) -> Result<u16, CompileError> {
        if let Some(index) = self.identifiers.get(identifier) {
            return Ok(*index);
        }
        let index = self.chunk.add_identifier(identifier)?;
        self.identifiers.insert(identifier.to_string(), index);
        Ok(index)
    }

    fn slot(&self, index: usize) -> Result<u16, CompileError> {
        u16::try_from(index).map_err(|_| CompileError::ScratchOverflow(self.chunk.scratch_size()))
    }

    fn emit(&mut self, op: OpCode) {
        self.chunk.add_bytecode(op);
    }

    fn emit_u16(&mut self, op: OpCode, operand: u16) {
        self.chunk.add_bytecode(op);
        self.chunk.add_u16(operand);
    }

    fn push(&mut self) {
        self.depth += 1;
        self.max_depth = self.max_depth.max(self.depth);
    }

    fn pop(&mut self) {
        self.depth -= 1;
    }
}

/// SSA values standing in for the operand stack while a chunk is
/// translated.
struct StackSimulator {
    values: Vec<Value>,
}

impl StackSimulator {
    fn with_capacity(capacity: usize) -> Self {
        Self {
            values: Vec::with_capacity(capacity),
        }
    }

    fn push(&mut self, value: Value) {
        self.values.push(value);
    }

    fn pop(&mut self, offset: usize) -> Result<Value, CompileError> {
        self.values
            .pop()
            .ok_or_else(|| invalid_chunk(offset, "operand stack underflow"))
    }
}

fn invalid_chunk(offset: usize, reason: &str) -> CompileError {
    CompileError::Codegen(format!("invalid chunk at {:04}: {}", offset, reason))
}

/// Replays `chunk` into the translator and returns the value it leaves.
fn translate(chunk: &Chunk, translator: &mut Translator<'_>) -> Result<Value, CompileError> {
    let scratch = match chunk.scratch_size() {
        0 => None,
        size => Some(translator.array(size)?),
    };
    let mut stack = StackSimulator::with_capacity(chunk.stack_size());
    let mut offset = 0;

    loop {
        let op = OpCode::try_from(chunk.get_bytecode(offset))
            .map_err(|e| invalid_chunk(offset, &e.to_string()))?;
        match op {
            OpCode::Constant => {
                let value = chunk.get_constant(chunk.get_u16(offset + 1));
                stack.push(translator.constant(value));
                offset += 3;
            }
            OpCode::Variable => {
                let identifier = chunk.get_identifier(chunk.get_u16(offset + 1));
                stack.push(translator.get_variable(identifier)?);
                offset += 3;
            }
            OpCode::Add
            | OpCode::Subtract
            | OpCode::Multiply
            | OpCode::Divide
            | OpCode::Modulo
            | OpCode::Power => {
                let b = stack.pop(offset)?;
                let a = stack.pop(offset)?;
                let op = match op {
                    OpCode::Add => BinaryOp::Add,
                    OpCode::Subtract => BinaryOp::Subtract,
                    OpCode::Multiply => BinaryOp::Multiply,
                    OpCode::Divide => BinaryOp::Divide,
                    OpCode::Modulo => BinaryOp::Modulo,
                    _ => BinaryOp::Power,
                };
                stack.push(translator.binary(op, a, b));
                offset += 1;
            }
            OpCode::Negate => {
                let value = stack.pop(offset)?;
                stack.push(translator.negate(value));
                offset += 1;
            }
            OpCode::Store => {
                let slot = chunk.get_u16(offset + 1) as usize;
                let value = stack.pop(offset)?;
                let scratch = scratch.ok_or_else(|| invalid_chunk(offset, "no scratch buffer"))?;
                translator.store(scratch, slot, value)?;
                offset += 3;
            }
            OpCode::Call => {
                let identifier = chunk.get_identifier(chunk.get_u16(offset + 1));
                let start = chunk.get_u16(offset + 3) as usize;
                let count = chunk.get_u16(offset + 5) as usize;
                let parameters = match count {
                    0 => None,
                    _ => Some((
                        scratch.ok_or_else(|| invalid_chunk(offset, "no scratch buffer"))?,
                        start,
                    )),
                };
                stack.push(translator.call_function(identifier, parameters, count)?);
                offset += 7;
            }
            OpCode::Return => return stack.pop(offset),
            OpCode::Sentinel => return Err(invalid_chunk(offset, "sentinel opcode")),
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::{
        context::{Context, EvaluationError},
        parser::parse,
    };

    use super::*;

    fn chunk(source: &str) -> Chunk {
        NativeCompiler.chunk("test", &parse(source).unwrap()).unwrap()
    }

    fn eval(source: &str, context: &Context) -> Result<f64, EvaluationError> {
        let tree = parse(source).unwrap();
        NativeCompiler.compile("test", &tree).unwrap().invoke(context)
    }

    #[test]
    fn test_scratch_size() {
        assert_eq!(chunk("1 + x").scratch_size(), 0);
        assert_eq!(chunk("f()").scratch_size(), 0);
        assert_eq!(chunk("f(1, 2, 3)").scratch_size(), 3);
        // g starts at slot 0, y lands in slot 1
        assert_eq!(chunk("f(g(x), y)").scratch_size(), 2);
        // g starts at slot 1 behind x and needs two slots
        assert_eq!(chunk("f(x, g(y, z))").scratch_size(), 3);
        assert_eq!(chunk("f(1, 2) + g(1, 2, 3, 4)").scratch_size(), 4);
        assert_eq!(chunk("f(a, f(b, f(c, d)))").scratch_size(), 4);
    }

    #[test]
    fn test_stack_size() {
        assert_eq!(chunk("1").stack_size(), 1);
        assert_eq!(chunk("1 + 2 + 3").stack_size(), 2);
        assert_eq!(chunk("1 + (2 + (3 + 4))").stack_size(), 4);
        assert_eq!(chunk("f(1, 2, 3)").stack_size(), 1);
    }

    #[test]
    fn test_constants_and_identifiers_are_shared() {
        let chunk = chunk("x * 2 + x * 2");
        assert_eq!(
            chunk.to_string(),
            "== test ==\n\
             scratch slots: 0, stack slots: 3\n\
             0000 OP_VARIABLE         0 'x'\n\
             0003 OP_CONSTANT         0 '2'\n\
             0006 OP_MULTIPLY\n\
             0007 OP_VARIABLE         0 'x'\n\
             0010 OP_CONSTANT         0 '2'\n\
             0013 OP_MULTIPLY\n\
             0014 OP_ADD\n\
             0015 OP_RETURN\n"
        );
    }

    #[test]
    fn test_parameters_are_stored_at_their_slots() {
        let chunk = chunk("f(x, g(y, 1))");
        assert_eq!(
            chunk.to_string(),
            "== test ==\n\
             scratch slots: 3, stack slots: 1\n\
             0000 OP_VARIABLE         0 'x'\n\
             0003 OP_STORE            0\n\
             0006 OP_VARIABLE         1 'y'\n\
             0009 OP_STORE            1\n\
             0012 OP_CONSTANT         0 '1'\n\
             0015 OP_STORE            2\n\
             0018 OP_CALL             2 'g' [1..3]\n\
             0025 OP_STORE            1\n\
             0028 OP_CALL             3 'f' [0..2]\n\
             0035 OP_RETURN\n"
        );
    }

    #[test]
    fn test_nested_calls_keep_their_parameters() {
        let mut context = Context::new();
        context
            .register_function("sub", |p: &[f64]| p[0] - p[1])
            .unwrap();
        context
            .register_function("sum", |p: &[f64]| p.iter().sum())
            .unwrap();

        assert_eq!(eval("sub(10, sub(4, 1))", &context), Ok(7.0));
        assert_eq!(eval("sub(sub(10, 4), 1)", &context), Ok(5.0));
        assert_eq!(
            eval("sum(1, sum(2, sum(3, 4), 5), sum(6, 7))", &context),
            Ok(28.0)
        );
        assert_eq!(
            eval("sum(1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12, 13, 14, 15, 16, 17)", &context),
            Ok(153.0)
        );
    }

    #[test]
    fn test_arithmetic() {
        let context = Context::new();
        assert_eq!(eval("2 + 1 * 5", &context), Ok(7.0));
        assert_eq!(eval("-(3 - 5) % 3", &context), Ok(2.0));
        assert_eq!(eval("2 ^ 3 ^ 2", &context), Ok(512.0));
        assert_eq!(eval("+4 / 8", &context), Ok(0.5));
    }

    #[test]
    fn test_errors_propagate() {
        let context = Context::with_builtins();
        assert_eq!(
            eval("sin(missing)", &context),
            Err(EvaluationError::UnknownVariable("missing".to_string()))
        );
        assert_eq!(
            eval("1 + nope(1)", &context),
            Err(EvaluationError::UnknownFunction("nope".to_string()))
        );
    }

    #[test]
    fn test_wide_calls_keep_the_scratch_on_the_frame() {
        let mut context = Context::new();
        context
            .register_function("count", |p: &[f64]| p.len() as f64)
            .unwrap();
        context
            .register_function("last", |p: &[f64]| p[p.len() - 1])
            .unwrap();
        let parameters = (1..=300).map(|i| i.to_string()).collect::<Vec<_>>();
        let source = format!("count({}) + last({})", parameters.join(", "), parameters.join(", "));
        assert_eq!(chunk(&source).scratch_size(), 300);
        assert_eq!(eval(&source, &context), Ok(600.0));
    }
}
