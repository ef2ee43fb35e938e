//! A small generic expression IR.
//!
//! Context access is not part of the IR itself. It is expressed as method
//! calls whose arguments are literals, values or freshly built arrays, and
//! every call is checked against its method's signature when a [`Lambda`]
//! is compiled to machine code. Each `NewArray` operand gets its own array
//! in the compiled function's frame, sized to its element count.

use std::{
    fmt::{Debug, Display},
    mem,
    sync::Arc,
};

use cranelift::codegen::ir::{StackSlot, Value};

use crate::{
    compiler::{Backend, CompileError},
    evaluator::Evaluator,
    jit::{Jit, Translator},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Subtract,
    Multiply,
    Divide,
    Modulo,
    Power,
}

/// Methods of the evaluation context reachable from IR.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    /// `(identifier: literal)`
    GetVariable,
    /// `(identifier: literal, parameters: new array)`
    CallFunction,
}

impl Method {
    pub fn name(self) -> &'static str {
        match self {
            Method::GetVariable => "GetVariable",
            Method::CallFunction => "CallFunction",
        }
    }
}

/// An IR expression. Traversals use explicit work lists, so bodies of any
/// depth can be compared, printed, compiled and dropped.
pub enum Expr {
    Constant(f64),
    Binary(BinaryOp, Box<Expr>, Box<Expr>),
    Negate(Box<Expr>),
    Call {
        method: Method,
        arguments: Vec<Operand>,
    },
}

#[derive(Debug, PartialEq)]
pub enum Operand {
    Literal(Arc<str>),
    Value(Expr),
    NewArray(Vec<Expr>),
}

impl Expr {
    pub fn binary(op: BinaryOp, left: Expr, right: Expr) -> Self {
        Expr::Binary(op, Box::new(left), Box::new(right))
    }

    pub fn negate(child: Expr) -> Self {
        Expr::Negate(Box::new(child))
    }

    pub fn get_variable(identifier: &str) -> Self {
        Expr::Call {
            method: Method::GetVariable,
            arguments: vec![Operand::Literal(identifier.into())],
        }
    }

    pub fn call_function(identifier: &str, parameters: Vec<Expr>) -> Self {
        Expr::Call {
            method: Method::CallFunction,
            arguments: vec![
                Operand::Literal(identifier.into()),
                Operand::NewArray(parameters),
            ],
        }
    }

    /// Nested expressions in evaluation order.
    pub(crate) fn children_mut(&mut self) -> Vec<&mut Expr> {
        match self {
            Expr::Constant(_) => Vec::new(),
            Expr::Binary(_, left, right) => vec![left.as_mut(), right.as_mut()],
            Expr::Negate(child) => vec![child.as_mut()],
            Expr::Call { arguments, .. } => arguments
                .iter_mut()
                .flat_map(|argument| match argument {
                    Operand::Literal(_) => Vec::new(),
                    Operand::Value(expr) => vec![expr],
                    Operand::NewArray(elements) => elements.iter_mut().collect(),
                })
                .collect(),
        }
    }
}

impl Drop for Expr {
    fn drop(&mut self) {
        let mut pending = detach_children(self);
        while let Some(mut expr) = pending.pop() {
            pending.append(&mut detach_children(&mut expr));
        }
    }
}

fn detach_children(expr: &mut Expr) -> Vec<Expr> {
    expr.children_mut()
        .into_iter()
        .filter(|child| !matches!(child, Expr::Constant(_)))
        .map(|child| mem::replace(child, Expr::Constant(0.0)))
        .collect()
}

impl PartialEq for Expr {
    fn eq(&self, other: &Self) -> bool {
        let mut pending = vec![(self, other)];
        while let Some(pair) = pending.pop() {
            let same = match pair {
                (Expr::Constant(a), Expr::Constant(b)) => a == b,
                (Expr::Binary(op_a, left_a, right_a), Expr::Binary(op_b, left_b, right_b)) => {
                    pending.push((left_a.as_ref(), left_b.as_ref()));
                    pending.push((right_a.as_ref(), right_b.as_ref()));
                    op_a == op_b
                }
                (Expr::Negate(a), Expr::Negate(b)) => {
                    pending.push((a.as_ref(), b.as_ref()));
                    true
                }
                (
                    Expr::Call {
                        method: method_a,
                        arguments: arguments_a,
                    },
                    Expr::Call {
                        method: method_b,
                        arguments: arguments_b,
                    },
                ) => {
                    method_a == method_b
                        && arguments_a.len() == arguments_b.len()
                        && arguments_a.iter().zip(arguments_b).all(|pair| match pair {
                            (Operand::Literal(a), Operand::Literal(b)) => a == b,
                            (Operand::Value(a), Operand::Value(b)) => {
                                pending.push((a, b));
                                true
                            }
                            (Operand::NewArray(a), Operand::NewArray(b)) => {
                                pending.extend(a.iter().zip(b));
                                a.len() == b.len()
                            }
                            _ => false,
                        })
                }
                _ => false,
            };
            if !same {
                return false;
            }
        }
        true
    }
}

/// A named IR body, the unit of compilation.
#[derive(Debug)]
pub struct Lambda {
    name: String,
    body: Expr,
}

impl Lambda {
    pub fn new(name: impl Into<String>, body: Expr) -> Self {
        Self {
            name: name.into(),
            body,
        }
    }

    pub fn body(&self) -> &Expr {
        &self.body
    }

    pub fn compile(&self) -> Result<Evaluator, CompileError> {
        let function = Jit::new()?.compile(&self.name, |translator| {
            translate(&self.body, translator)
        })?;
        Ok(Evaluator::new(&self.name, Backend::TreeIr, move |context| {
            function.invoke(context)
        }))
    }
}

enum Work<'a> {
    Visit(&'a Expr),
    Binary(BinaryOp),
    Negate,
    Store(StackSlot, usize),
    Call(&'a str, Option<StackSlot>, usize),
}

fn malformed(method: Method, reason: &'static str) -> CompileError {
    CompileError::MalformedIr {
        method: method.name(),
        reason,
    }
}

/// Emits `body` in evaluation order, checking every call against its
/// method's signature on the way.
fn translate(body: &Expr, translator: &mut Translator<'_>) -> Result<Value, CompileError> {
    let mut values = Vec::new();
    let mut work = vec![Work::Visit(body)];

    while let Some(item) = work.pop() {
        match item {
            Work::Visit(Expr::Constant(value)) => values.push(translator.constant(*value)),
            Work::Visit(Expr::Binary(op, left, right)) => {
                work.push(Work::Binary(*op));
                work.push(Work::Visit(right));
                work.push(Work::Visit(left));
            }
            Work::Visit(Expr::Negate(child)) => {
                work.push(Work::Negate);
                work.push(Work::Visit(child));
            }
            Work::Visit(Expr::Call { method, arguments }) => {
                match (method, arguments.as_slice()) {
                    (Method::GetVariable, [Operand::Literal(identifier)]) => {
                        values.push(translator.get_variable(identifier)?);
                    }
                    (
                        Method::CallFunction,
                        [Operand::Literal(identifier), Operand::NewArray(parameters)],
                    ) => {
                        if parameters.is_empty() {
                            work.push(Work::Call(identifier, None, 0));
                            continue;
                        }
                        let array = translator.array(parameters.len())?;
                        work.push(Work::Call(identifier, Some(array), parameters.len()));
                        for (i, parameter) in parameters.iter().enumerate().rev() {
                            work.push(Work::Store(array, i));
                            work.push(Work::Visit(parameter));
                        }
                    }
                    (Method::GetVariable, _) => {
                        return Err(malformed(*method, "expected a single literal identifier"))
                    }
                    (Method::CallFunction, _) => {
                        return Err(malformed(
                            *method,
                            "expected a literal identifier and a new parameter array",
                        ))
                    }
                }
            }
            Work::Binary(op) => {
                let b = operand(&mut values);
                let a = operand(&mut values);
                values.push(translator.binary(op, a, b));
            }
            Work::Negate => {
                let value = operand(&mut values);
                values.push(translator.negate(value));
            }
            Work::Store(array, index) => {
                let value = operand(&mut values);
                translator.store(array, index, value)?;
            }
            Work::Call(identifier, array, count) => {
                let parameters = array.map(|array| (array, 0));
                values.push(translator.call_function(identifier, parameters, count)?);
            }
        }
    }

    Ok(operand(&mut values))
}

fn operand(values: &mut Vec<Value>) -> Value {
    values
        .pop()
        .expect("Operands should be translated before their operator")
}

enum Piece<'a> {
    Text(&'static str),
    Expr(&'a Expr),
    Operand(&'a Operand),
}

fn write_pieces(f: &mut std::fmt::Formatter<'_>, mut pending: Vec<Piece<'_>>) -> std::fmt::Result {
    while let Some(piece) = pending.pop() {
        match piece {
            Piece::Text(text) => f.write_str(text)?,
            Piece::Expr(Expr::Constant(value)) => write!(f, "{}", value)?,
            Piece::Expr(Expr::Binary(op, left, right)) => {
                write!(f, "{:?}(", op)?;
                pending.extend([
                    Piece::Text(")"),
                    Piece::Expr(right),
                    Piece::Text(", "),
                    Piece::Expr(left),
                ]);
            }
            Piece::Expr(Expr::Negate(child)) => {
                f.write_str("Negate(")?;
                pending.extend([Piece::Text(")"), Piece::Expr(child)]);
            }
            Piece::Expr(Expr::Call { method, arguments }) => {
                write!(f, "context.{}(", method.name())?;
                pending.push(Piece::Text(")"));
                for (i, argument) in arguments.iter().enumerate().rev() {
                    pending.push(Piece::Operand(argument));
                    if i > 0 {
                        pending.push(Piece::Text(", "));
                    }
                }
            }
            Piece::Operand(Operand::Literal(literal)) => write!(f, "{:?}", literal)?,
            Piece::Operand(Operand::Value(expr)) => pending.push(Piece::Expr(expr)),
            Piece::Operand(Operand::NewArray(elements)) => {
                f.write_str("[")?;
                pending.push(Piece::Text("]"));
                for (i, element) in elements.iter().enumerate().rev() {
                    pending.push(Piece::Expr(element));
                    if i > 0 {
                        pending.push(Piece::Text(", "));
                    }
                }
            }
        }
    }
    Ok(())
}

impl Display for Expr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write_pieces(f, vec![Piece::Expr(self)])
    }
}

impl Debug for Expr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        Display::fmt(self, f)
    }
}

impl Display for Operand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write_pieces(f, vec![Piece::Operand(self)])
    }
}
