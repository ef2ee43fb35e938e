use std::sync::Arc;

use crate::{
    compiler::Backend,
    context::{EvaluationContext, EvaluationError},
};

type EvaluatorFn = dyn Fn(&dyn EvaluationContext) -> Result<f64, EvaluationError> + Send + Sync;

/// A compiled expression.
///
/// Holds no mutable state: it can be invoked any number of times, from any
/// thread, against any context. Cloning is cheap.
#[derive(Clone)]
pub struct Evaluator {
    name: Arc<str>,
    backend: Backend,
    function: Arc<EvaluatorFn>,
}

impl Evaluator {
    pub fn new(
        name: &str,
        backend: Backend,
        function: impl Fn(&dyn EvaluationContext) -> Result<f64, EvaluationError>
            + Send
            + Sync
            + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            backend,
            function: Arc::new(function),
        }
    }

    pub fn invoke(&self, context: &dyn EvaluationContext) -> Result<f64, EvaluationError> {
        (self.function)(context)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn backend(&self) -> Backend {
        self.backend
    }
}

impl std::fmt::Debug for Evaluator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Evaluator")
            .field("name", &self.name)
            .field("backend", &self.backend)
            .finish()
    }
}
