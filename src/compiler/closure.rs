mod stack;

use std::sync::Arc;

use crate::{
    ast::{Node, Operator},
    context::{EvaluationContext, EvaluationError},
    evaluator::Evaluator,
};

use self::stack::Stack;

use super::{Backend, CompileError, Compiler};

/// Subtrees up to this height become nested closures. Taller trees keep
/// nested closures for their short subtrees and run the rest as a flat
/// sequence of steps over a value stack.
const MAX_NESTED_HEIGHT: usize = 64;

type Part = Box<dyn Fn(&dyn EvaluationContext) -> Result<f64, EvaluationError> + Send + Sync>;

type Step =
    Box<dyn Fn(&mut Stack, &dyn EvaluationContext) -> Result<(), EvaluationError> + Send + Sync>;

/// Compiles each node into a closure over its already compiled children.
///
/// Needs no code generation at all, so it works everywhere.
#[derive(Debug, Clone, Copy, Default)]
pub struct ClosureCompiler;

impl Compiler for ClosureCompiler {
    fn compile(&self, name: &str, tree: &Node) -> Result<Evaluator, CompileError> {
        if fits(tree, MAX_NESTED_HEIGHT) {
            let root = compile_node(tree)?;
            return Ok(Evaluator::new(name, Backend::Closure, move |context| {
                root(context)
            }));
        }

        let program = Program::flatten(tree)?;
        log::debug!(
            "Flattened {} into {} steps with {} stack slots",
            name,
            program.steps.len(),
            program.stack_size
        );
        Ok(Evaluator::new(name, Backend::Closure, move |context| {
            program.run(context)
        }))
    }
}

/// Whether `node` is at most `height` levels tall.
fn fits(node: &Node, height: usize) -> bool {
    height > 0
        && node
            .children()
            .into_iter()
            .all(|child| fits(child, height - 1))
}

fn part(
    f: impl Fn(&dyn EvaluationContext) -> Result<f64, EvaluationError> + Send + Sync + 'static,
) -> Part {
    Box::new(f)
}

fn step(
    f: impl Fn(&mut Stack, &dyn EvaluationContext) -> Result<(), EvaluationError>
        + Send
        + Sync
        + 'static,
) -> Step {
    Box::new(f)
}

fn push(part: Part) -> Step {
    step(move |stack, context| {
        stack.push(part(context)?);
        Ok(())
    })
}

/// Compiles a subtree that [`fits`] into nested closures.
fn compile_node(node: &Node) -> Result<Part, CompileError> {
    match node {
        Node::Number(value) => {
            let value = *value;
            Ok(part(move |_| Ok(value)))
        }
        Node::Variable(identifier) => {
            let identifier: Arc<str> = identifier.as_str().into();
            Ok(part(move |context| context.get_variable(&identifier)))
        }
        Node::Operator(op, left, right) => {
            let left = compile_node(left)?;
            let right = compile_node(right)?;
            Ok(match op {
                Operator::Plus => part(move |context| Ok(left(context)? + right(context)?)),
                Operator::Minus => part(move |context| Ok(left(context)? - right(context)?)),
                Operator::Multiply => {
                    part(move |context| Ok(left(context)? * right(context)?))
                }
                Operator::Divide => part(move |context| Ok(left(context)? / right(context)?)),
                Operator::Modulo => part(move |context| Ok(left(context)? % right(context)?)),
                Operator::Exponent => {
                    part(move |context| Ok(left(context)?.powf(right(context)?)))
                }
            })
        }
        Node::Unary(op, child) => {
            let child = compile_node(child)?;
            match op {
                Operator::Plus => Ok(child),
                Operator::Minus => Ok(part(move |context| Ok(-child(context)?))),
                op => Err(CompileError::UnknownUnaryOperator(*op)),
            }
        }
        Node::Function(identifier, parameters) => {
            let identifier: Arc<str> = identifier.as_str().into();
            let parts = parameters
                .iter()
                .map(compile_node)
                .collect::<Result<Vec<_>, _>>()?;
            Ok(match parts.len() {
                0 => part(move |context| context.call_function(&identifier, &[])),
                1 => call_fixed::<1>(identifier, parts),
                2 => call_fixed::<2>(identifier, parts),
                3 => call_fixed::<3>(identifier, parts),
                4 => call_fixed::<4>(identifier, parts),
                5 => call_fixed::<5>(identifier, parts),
                6 => call_fixed::<6>(identifier, parts),
                7 => call_fixed::<7>(identifier, parts),
                8 => call_fixed::<8>(identifier, parts),
                _ => call_many(identifier, parts.into_boxed_slice()),
            })
        }
    }
}

/// Evaluates parameters into an array sized to this call site.
fn call_fixed<const N: usize>(identifier: Arc<str>, parts: Vec<Part>) -> Part {
    let parts: Box<[Part; N]> = match parts.into_boxed_slice().try_into() {
        Ok(parts) => parts,
        Err(_) => unreachable!("call_fixed is only used with exactly {} parameters", N),
    };
    part(move |context| {
        let mut values = [0.0; N];
        for (value, part) in values.iter_mut().zip(parts.iter()) {
            *value = part(context)?;
        }
        context.call_function(&identifier, &values)
    })
}

/// Evaluates parameters into a buffer of exactly `parts.len()` values,
/// allocated once per call.
fn call_many(identifier: Arc<str>, parts: Box<[Part]>) -> Part {
    part(move |context| {
        let mut values = vec![0.0; parts.len()].into_boxed_slice();
        for (value, part) in values.iter_mut().zip(parts.iter()) {
            *value = part(context)?;
        }
        context.call_function(&identifier, &values)
    })
}

enum Pending<'a> {
    Visit(&'a Node),
    Binary(Operator),
    Negate,
    Call(&'a str, usize),
}

/// Steps in evaluation order. Each step pops its operands and pushes one
/// value.
struct Program {
    steps: Vec<Step>,
    depth: usize,
    stack_size: usize,
}

impl Program {
    fn flatten(tree: &Node) -> Result<Self, CompileError> {
        let mut program = Program {
            steps: Vec::new(),
            depth: 0,
            stack_size: 0,
        };

        let mut pending = vec![Pending::Visit(tree)];
        while let Some(item) = pending.pop() {
            match item {
                Pending::Visit(node) if fits(node, MAX_NESTED_HEIGHT) => {
                    program.add(0, push(compile_node(node)?));
                }
                Pending::Visit(Node::Operator(op, left, right)) => {
                    pending.push(Pending::Binary(*op));
                    pending.push(Pending::Visit(right));
                    pending.push(Pending::Visit(left));
                }
                Pending::Visit(Node::Unary(Operator::Plus, child)) => {
                    pending.push(Pending::Visit(child));
                }
                Pending::Visit(Node::Unary(Operator::Minus, child)) => {
                    pending.push(Pending::Negate);
                    pending.push(Pending::Visit(child));
                }
                Pending::Visit(Node::Unary(op, _)) => {
                    return Err(CompileError::UnknownUnaryOperator(*op))
                }
                Pending::Visit(Node::Function(identifier, parameters)) => {
                    pending.push(Pending::Call(identifier, parameters.len()));
                    pending.extend(parameters.iter().rev().map(Pending::Visit));
                }
                Pending::Visit(leaf) => program.add(0, push(compile_node(leaf)?)),
                Pending::Binary(op) => {
                    let apply: fn(f64, f64) -> f64 = match op {
                        Operator::Plus => |a, b| a + b,
                        Operator::Minus => |a, b| a - b,
                        Operator::Multiply => |a, b| a * b,
                        Operator::Divide => |a, b| a / b,
                        Operator::Modulo => |a, b| a % b,
                        Operator::Exponent => f64::powf,
                    };
                    program.add(
                        2,
                        step(move |stack, _| {
                            let b = stack.pop();
                            let a = stack.pop();
                            stack.push(apply(a, b));
                            Ok(())
                        }),
                    );
                }
                Pending::Negate => program.add(
                    1,
                    step(|stack, _| {
                        let value = stack.pop();
                        stack.push(-value);
                        Ok(())
                    }),
                ),
                Pending::Call(identifier, count) => {
                    let identifier: Arc<str> = identifier.into();
                    program.add(
                        count,
                        step(move |stack, context| {
                            let value = context.call_function(&identifier, stack.top(count))?;
                            stack.discard(count);
                            stack.push(value);
                            Ok(())
                        }),
                    );
                }
            }
        }
        Ok(program)
    }

    fn add(&mut self, pops: usize, step: Step) {
        self.steps.push(step);
        self.depth = self.depth - pops + 1;
        self.stack_size = self.stack_size.max(self.depth);
    }

    fn run(&self, context: &dyn EvaluationContext) -> Result<f64, EvaluationError> {
        let mut stack = Stack::with_capacity(self.stack_size);
        for step in &self.steps {
            step(&mut stack, context)?;
        }
        Ok(stack.pop())
    }
}
