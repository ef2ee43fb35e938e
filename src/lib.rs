//! Compiles arithmetic expressions such as `4.0 * sin(pi / 4) + x` into
//! reusable [`Evaluator`]s.
//!
//! ```
//! use mathc::{compile, Backend, Context};
//!
//! let evaluator = compile("example", "2 + 1 * 5", Backend::Native).unwrap();
//! assert_eq!(evaluator.invoke(&Context::new()), Ok(7.0));
//! ```

pub mod ast;
pub mod compiler;
pub mod context;
pub mod evaluator;
pub mod ir;
mod jit;
pub mod parser;
pub mod span;
pub mod tokenizer;

pub use ast::{Node, Operator};
pub use compiler::{Backend, CompileError, Compiler};
pub use context::{Context, EvaluationContext, EvaluationError, RegistrationError};
pub use evaluator::Evaluator;
pub use parser::{parse, ParseError};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Parse(#[from] ParseError),
    #[error(transparent)]
    Compile(#[from] CompileError),
}

/// Parses `source` and compiles it with `backend`.
pub fn compile(name: &str, source: &str, backend: Backend) -> Result<Evaluator, Error> {
    log::trace!("Compiling {} with the {} backend", name, backend);
    let tree = parse(source)?;
    log::debug!("Parsed {}: {}", name, tree);
    Ok(backend.compiler().compile(name, &tree)?)
}
