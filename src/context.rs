mod builtins;

use std::collections::hash_map::Entry;

use rustc_hash::FxHashMap;

/// Runtime lookups consumed by every compiled [`Evaluator`](crate::evaluator::Evaluator).
///
/// Implementations are only read during evaluation. Registration must be
/// finished before an evaluator is shared across threads.
pub trait EvaluationContext {
    fn get_variable(&self, identifier: &str) -> Result<f64, EvaluationError>;

    /// Calls a function with its parameters in call order.
    fn call_function(&self, identifier: &str, parameters: &[f64]) -> Result<f64, EvaluationError>;
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum EvaluationError {
    #[error("Unknown variable: {0}")]
    UnknownVariable(String),
    #[error("Unknown function: {0}")]
    UnknownFunction(String),
    #[error("Invalid function call: {identifier} called with {found} parameters, expected {expected}")]
    InvalidFunctionCall {
        identifier: String,
        found: usize,
        expected: usize,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistrationError {
    #[error("Variable redeclaration: {0}")]
    VariableRedeclaration(String),
    #[error("Function redeclaration: {0}")]
    FunctionRedeclaration(String),
}

pub type NativeFunction = Box<dyn Fn(&[f64]) -> f64 + Send + Sync>;

enum Callable {
    /// Fixed arity, checked before the call.
    Builtin(fn(&[f64]) -> f64, usize),
    /// Receives however many parameters the expression passes.
    Native(NativeFunction),
}

impl Callable {
    fn call(&self, identifier: &str, parameters: &[f64]) -> Result<f64, EvaluationError> {
        match self {
            Callable::Builtin(f, arity) => {
                if parameters.len() != *arity {
                    return Err(EvaluationError::InvalidFunctionCall {
                        identifier: identifier.to_string(),
                        found: parameters.len(),
                        expected: *arity,
                    });
                }
                Ok(f(parameters))
            }
            Callable::Native(f) => Ok(f(parameters)),
        }
    }
}

impl std::fmt::Debug for Callable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Callable::Builtin(_, arity) => write!(f, "<builtin function {}>", arity),
            Callable::Native(_) => write!(f, "<native function>"),
        }
    }
}

/// Default [`EvaluationContext`]: two append-only maps filled during setup.
///
/// Registering an identifier twice in the same namespace is an error;
/// entries are never overwritten.
#[derive(Debug, Default)]
pub struct Context {
    variables: FxHashMap<String, f64>,
    functions: FxHashMap<String, Callable>,
}

impl Context {
    pub fn new() -> Self {
        Self::default()
    }

    /// A context with the constants and math functions from [`Context::register_builtins`].
    pub fn with_builtins() -> Self {
        let mut context = Self::new();
        context
            .register_builtins()
            .expect("Builtins should not fail to declare on an empty context");
        context
    }

    pub fn register_variable(
        &mut self,
        identifier: impl Into<String>,
        value: f64,
    ) -> Result<(), RegistrationError> {
        match self.variables.entry(identifier.into()) {
            Entry::Occupied(o) => Err(RegistrationError::VariableRedeclaration(o.key().clone())),
            Entry::Vacant(v) => {
                v.insert(value);
                Ok(())
            }
        }
    }

    pub fn register_function(
        &mut self,
        identifier: impl Into<String>,
        function: impl Fn(&[f64]) -> f64 + Send + Sync + 'static,
    ) -> Result<(), RegistrationError> {
        self.declare_function(identifier.into(), Callable::Native(Box::new(function)))
    }

    fn declare_function(
        &mut self,
        identifier: String,
        callable: Callable,
    ) -> Result<(), RegistrationError> {
        match self.functions.entry(identifier) {
            Entry::Occupied(o) => Err(RegistrationError::FunctionRedeclaration(o.key().clone())),
            Entry::Vacant(v) => {
                v.insert(callable);
                Ok(())
            }
        }
    }

    /// Registers `pi`, `e`, `tau`, `phi`, `inf`, `nan`, `degToRad`,
    /// `radToDeg` and the standard trig, log, rounding and clamping functions.
    pub fn register_builtins(&mut self) -> Result<(), RegistrationError> {
        for (identifier, value) in builtins::VARIABLES {
            self.register_variable(*identifier, *value)?;
        }
        for (identifier, function, arity) in builtins::FUNCTIONS {
            self.declare_function(identifier.to_string(), Callable::Builtin(*function, *arity))?;
        }
        Ok(())
    }
}

impl EvaluationContext for Context {
    fn get_variable(&self, identifier: &str) -> Result<f64, EvaluationError> {
        self.variables
            .get(identifier)
            .copied()
            .ok_or_else(|| EvaluationError::UnknownVariable(identifier.to_string()))
    }

    fn call_function(&self, identifier: &str, parameters: &[f64]) -> Result<f64, EvaluationError> {
        match self.functions.get(identifier) {
            Some(callable) => callable.call(identifier, parameters),
            None => Err(EvaluationError::UnknownFunction(identifier.to_string())),
        }
    }
}
