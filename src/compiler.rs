pub mod closure;
pub mod native;
pub mod tree_ir;

use crate::{
    ast::{Node, Operator},
    evaluator::Evaluator,
};

pub use self::{closure::ClosureCompiler, native::NativeCompiler, tree_ir::TreeIrCompiler};

/// Turns a syntax tree into an [`Evaluator`].
///
/// Compilers never mutate the tree and produce the same result for the same
/// input. Every tree the parser can build compiles; only hand-built trees
/// with invalid operator combinations fail.
pub trait Compiler {
    fn compile(&self, name: &str, tree: &Node) -> Result<Evaluator, CompileError>;
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CompileError {
    #[error("Unknown unary operator '{0}'")]
    UnknownUnaryOperator(Operator),
    #[error("Too many constants in one chunk")]
    TooManyConstants,
    #[error("Too many identifiers in one chunk")]
    TooManyIdentifiers,
    #[error("Scratch buffer of {0} slots exceeds the addressable range")]
    ScratchOverflow(usize),
    #[error("No JIT for this host: {0}")]
    JitUnavailable(String),
    #[error("Code generation failed: {0}")]
    Codegen(String),
    #[error("Malformed IR call to {method}: {reason}")]
    MalformedIr {
        method: &'static str,
        reason: &'static str,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Backend {
    /// Machine code translated from a stack program, with one compile-time
    /// sized scratch buffer for call parameters.
    #[default]
    Native,
    /// Lowered to the generic tree IR in [`crate::ir`], then to machine code.
    TreeIr,
    /// Nested closures, one per node. Runs on hosts without a JIT.
    Closure,
}

impl Backend {
    pub const ALL: [Backend; 3] = [Backend::Native, Backend::TreeIr, Backend::Closure];

    pub fn compiler(self) -> &'static dyn Compiler {
        match self {
            Backend::Native => &NativeCompiler,
            Backend::TreeIr => &TreeIrCompiler,
            Backend::Closure => &ClosureCompiler,
        }
    }
}

impl std::fmt::Display for Backend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Backend::Native => write!(f, "native"),
            Backend::TreeIr => write!(f, "tree-ir"),
            Backend::Closure => write!(f, "closure"),
        }
    }
}

#[derive(Debug, thiserror::Error)]
#[error("Unknown backend \"{0}\", expected one of native, tree-ir, closure")]
pub struct UnknownBackend(String);

impl std::str::FromStr for Backend {
    type Err = UnknownBackend;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "native" => Ok(Backend::Native),
            "tree-ir" => Ok(Backend::TreeIr),
            "closure" => Ok(Backend::Closure),
            _ => Err(UnknownBackend(s.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backend_names_round_trip() {
        for backend in Backend::ALL {
            assert_eq!(backend.to_string().parse::<Backend>().unwrap(), backend);
        }
        assert!("jit".parse::<Backend>().is_err());
    }

    #[test]
    fn test_every_backend_rejects_invalid_unary() {
        let tree = Node::unary(Operator::Multiply, Node::number(1.0));
        for backend in Backend::ALL {
            assert_eq!(
                backend.compiler().compile("bad", &tree).unwrap_err(),
                CompileError::UnknownUnaryOperator(Operator::Multiply)
            );
        }
    }

    #[test]
    fn test_invalid_unary_deep_in_tree() {
        let tree = Node::function(
            "f",
            vec![
                Node::number(1.0),
                Node::operator(
                    Operator::Plus,
                    Node::variable("x"),
                    Node::unary(Operator::Exponent, Node::number(2.0)),
                ),
            ],
        );
        for backend in Backend::ALL {
            assert!(backend.compiler().compile("bad", &tree).is_err());
        }
    }
}
