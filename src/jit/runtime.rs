//! Host functions called from compiled code.
//!
//! Trampolines that can fail return [`OK`] or [`FAILED`] and write their
//! value through an out pointer. The error itself stays on the Rust side in
//! the [`Environment`] of the running invocation.

use std::{
    any::Any,
    ffi::c_void,
    panic::{self, AssertUnwindSafe},
    sync::Arc,
};

use cranelift_jit::JITBuilder;

use crate::context::{EvaluationContext, EvaluationError};

pub(super) const OK: i32 = 0;
pub(super) const FAILED: i32 = 1;

pub(super) const GET_VARIABLE: &str = "mathc_get_variable";
pub(super) const CALL_FUNCTION: &str = "mathc_call_function";
pub(super) const POW: &str = "mathc_pow";
pub(super) const REM: &str = "mathc_rem";

pub(super) fn register_symbols(builder: &mut JITBuilder) {
    builder.symbol(GET_VARIABLE, get_variable as *const u8);
    builder.symbol(CALL_FUNCTION, call_function as *const u8);
    builder.symbol(POW, pow as *const u8);
    builder.symbol(REM, rem as *const u8);
}

/// State of one invocation, passed to compiled code as an opaque pointer.
pub(super) struct Environment<'a> {
    context: &'a dyn EvaluationContext,
    identifiers: &'a [Arc<str>],
    error: Option<EvaluationError>,
    panic: Option<Box<dyn Any + Send>>,
}

impl<'a> Environment<'a> {
    pub(super) fn new(context: &'a dyn EvaluationContext, identifiers: &'a [Arc<str>]) -> Self {
        Self {
            context,
            identifiers,
            error: None,
            panic: None,
        }
    }

    /// The result of the invocation. Panics raised by host functions are
    /// resumed here, outside of compiled code.
    pub(super) fn finish(self, result: f64) -> Result<f64, EvaluationError> {
        if let Some(payload) = self.panic {
            panic::resume_unwind(payload);
        }
        match self.error {
            Some(error) => Err(error),
            None => Ok(result),
        }
    }

    fn dispatch(
        &mut self,
        out: *mut f64,
        call: impl FnOnce(&dyn EvaluationContext, &[Arc<str>]) -> Result<f64, EvaluationError>,
    ) -> i32 {
        let (context, identifiers) = (self.context, self.identifiers);
        match panic::catch_unwind(AssertUnwindSafe(|| call(context, identifiers))) {
            Ok(Ok(value)) => {
                // Safety: `out` points at the caller's result slot
                unsafe { out.write(value) };
                OK
            }
            Ok(Err(error)) => {
                self.error = Some(error);
                FAILED
            }
            Err(payload) => {
                self.panic = Some(payload);
                FAILED
            }
        }
    }
}

/// # Safety
///
/// Only called by compiled code with the environment it was invoked with.
unsafe fn environment<'a>(environment: *mut c_void) -> &'a mut Environment<'a> {
    &mut *environment.cast::<Environment<'a>>()
}

extern "C" fn get_variable(environment: *mut c_void, identifier: u32, out: *mut f64) -> i32 {
    let environment = unsafe { self::environment(environment) };
    environment.dispatch(out, |context, identifiers| {
        context.get_variable(&identifiers[identifier as usize])
    })
}

extern "C" fn call_function(
    environment: *mut c_void,
    identifier: u32,
    parameters: *const f64,
    count: usize,
    out: *mut f64,
) -> i32 {
    let environment = unsafe { self::environment(environment) };
    let parameters: &[f64] = if count == 0 {
        &[]
    } else {
        // Safety: compiled code passes `count` initialized slots of its frame
        unsafe { std::slice::from_raw_parts(parameters, count) }
    };
    environment.dispatch(out, |context, identifiers| {
        context.call_function(&identifiers[identifier as usize], parameters)
    })
}

extern "C" fn pow(base: f64, exponent: f64) -> f64 {
    base.powf(exponent)
}

extern "C" fn rem(a: f64, b: f64) -> f64 {
    a % b
}

#[cfg(test)]
mod tests {
    use crate::context::Context;

    use super::*;

    #[test]
    fn test_dispatch_records_errors() {
        let mut context = Context::new();
        context.register_variable("x", 2.5).unwrap();
        let identifiers: Vec<Arc<str>> = vec!["x".into(), "y".into()];
        let mut environment = Environment::new(&context, &identifiers);
        let pointer = (&mut environment as *mut Environment<'_>).cast::<c_void>();

        let mut out = 0.0;
        assert_eq!(get_variable(pointer, 0, &mut out), OK);
        assert_eq!(out, 2.5);
        assert_eq!(get_variable(pointer, 1, &mut out), FAILED);
        assert_eq!(
            environment.finish(out),
            Err(EvaluationError::UnknownVariable("y".to_string()))
        );
    }

    #[test]
    fn test_call_function_reads_parameters() {
        let mut context = Context::new();
        context
            .register_function("sum", |p: &[f64]| p.iter().sum())
            .unwrap();
        let identifiers: Vec<Arc<str>> = vec!["sum".into()];
        let mut environment = Environment::new(&context, &identifiers);
        let pointer = (&mut environment as *mut Environment<'_>).cast::<c_void>();

        let parameters = [1.0, 2.0, 4.0];
        let mut out = 0.0;
        assert_eq!(call_function(pointer, 0, parameters.as_ptr(), 3, &mut out), OK);
        assert_eq!(out, 7.0);
        assert_eq!(call_function(pointer, 0, std::ptr::null(), 0, &mut out), OK);
        assert_eq!(out, 0.0);
        assert_eq!(environment.finish(out), Ok(0.0));
    }

    #[test]
    fn test_math() {
        assert_eq!(pow(2.0, 10.0), 1024.0);
        assert_eq!(rem(-7.0, 3.0), -1.0);
    }
}
