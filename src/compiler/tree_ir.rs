use crate::{
    ast::{Node, Operator},
    evaluator::Evaluator,
    ir::{BinaryOp, Expr, Lambda},
};

use super::{CompileError, Compiler};

/// Lowers the syntax tree to [`crate::ir`] and compiles the resulting
/// [`Lambda`].
#[derive(Debug, Clone, Copy, Default)]
pub struct TreeIrCompiler;

impl TreeIrCompiler {
    /// Builds the IR top-down, filling placeholder children as it goes.
    pub fn lower(&self, tree: &Node) -> Result<Expr, CompileError> {
        let mut root = placeholder();
        {
            let mut pending = vec![(tree, &mut root)];
            while let Some((mut node, target)) = pending.pop() {
                while let Node::Unary(Operator::Plus, child) = node {
                    node = child.as_ref();
                }

                *target = match node {
                    Node::Number(value) => Expr::Constant(*value),
                    Node::Variable(identifier) => Expr::get_variable(identifier),
                    Node::Operator(op, _, _) => {
                        Expr::binary(binary_op(*op), placeholder(), placeholder())
                    }
                    Node::Unary(Operator::Minus, _) => Expr::negate(placeholder()),
                    Node::Unary(op, _) => return Err(CompileError::UnknownUnaryOperator(*op)),
                    Node::Function(identifier, parameters) => Expr::call_function(
                        identifier,
                        parameters.iter().map(|_| placeholder()).collect(),
                    ),
                };

                let children: Vec<_> = node
                    .children()
                    .into_iter()
                    .zip(target.children_mut())
                    .collect();
                pending.extend(children.into_iter().rev());
            }
        }
        Ok(root)
    }
}

fn placeholder() -> Expr {
    Expr::Constant(0.0)
}

fn binary_op(op: Operator) -> BinaryOp {
    match op {
        Operator::Plus => BinaryOp::Add,
        Operator::Minus => BinaryOp::Subtract,
        Operator::Multiply => BinaryOp::Multiply,
        Operator::Divide => BinaryOp::Divide,
        Operator::Modulo => BinaryOp::Modulo,
        Operator::Exponent => BinaryOp::Power,
    }
}

impl Compiler for TreeIrCompiler {
    fn compile(&self, name: &str, tree: &Node) -> Result<Evaluator, CompileError> {
        Lambda::new(name, self.lower(tree)?).compile()
    }
}
