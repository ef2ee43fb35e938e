//! Machine code generation with Cranelift.
//!
//! The native and tree-IR backends both describe their expression to a
//! [`Translator`], which builds a single function of the shape
//! `extern "C" fn(environment, result) -> status`. Everything that touches
//! the evaluation context goes through the trampolines in [`runtime`], which
//! report failures through the status word.

mod runtime;

use std::{
    ffi::c_void,
    sync::{Arc, OnceLock},
};

use cranelift::{
    codegen::{
        self,
        ir::{FuncRef, StackSlot, UserFuncName},
        isa::OwnedTargetIsa,
    },
    prelude::*,
};
use cranelift_jit::{JITBuilder, JITModule};
use cranelift_module::{default_libcall_names, FuncId, Linkage, Module, ModuleError};
use rustc_hash::FxHashMap;
use target_lexicon::Triple;

use crate::{
    compiler::CompileError,
    context::{EvaluationContext, EvaluationError},
    ir::BinaryOp,
};

use self::runtime::Environment;

type Entry = unsafe extern "C" fn(*mut c_void, *mut f64) -> i32;

fn host_isa() -> Result<OwnedTargetIsa, CompileError> {
    static ISA: OnceLock<Result<OwnedTargetIsa, String>> = OnceLock::new();

    ISA.get_or_init(|| {
        let mut flags_builder = cranelift_codegen::settings::builder();
        flags_builder
            .set("opt_level", "speed")
            .map_err(|e| e.to_string())?;
        flags_builder
            .set("use_colocated_libcalls", "false")
            .map_err(|e| e.to_string())?;
        flags_builder
            .set("is_pic", "false")
            .map_err(|e| e.to_string())?;
        let flags = cranelift_codegen::settings::Flags::new(flags_builder);

        let isa = cranelift_native::builder()
            .map_err(|e| e.to_string())?
            .finish(flags)
            .map_err(|e| e.to_string())?;
        log::debug!("JIT target: {}", Triple::host());
        Ok(isa)
    })
    .clone()
    .map_err(|reason| CompileError::JitUnavailable(format!("{}: {}", Triple::host(), reason)))
}

fn module_error(error: ModuleError) -> CompileError {
    CompileError::Codegen(error.to_string())
}

/// Context trampolines, declared once per module.
struct Runtime {
    get_variable: FuncId,
    call_function: FuncId,
    pow: FuncId,
    rem: FuncId,
}

impl Runtime {
    fn declare(module: &mut JITModule) -> Result<Self, CompileError> {
        let pointer = module.target_config().pointer_type();
        Ok(Self {
            get_variable: declare_import(
                module,
                runtime::GET_VARIABLE,
                &[pointer, types::I32, pointer],
                types::I32,
            )?,
            call_function: declare_import(
                module,
                runtime::CALL_FUNCTION,
                &[pointer, types::I32, pointer, pointer, pointer],
                types::I32,
            )?,
            pow: declare_import(module, runtime::POW, &[types::F64, types::F64], types::F64)?,
            rem: declare_import(module, runtime::REM, &[types::F64, types::F64], types::F64)?,
        })
    }
}

fn declare_import(
    module: &mut JITModule,
    name: &str,
    params: &[Type],
    returns: Type,
) -> Result<FuncId, CompileError> {
    let mut signature = module.make_signature();
    signature
        .params
        .extend(params.iter().map(|param| AbiParam::new(*param)));
    signature.returns.push(AbiParam::new(returns));
    module
        .declare_function(name, Linkage::Import, &signature)
        .map_err(module_error)
}

/// One JIT module, good for a single compiled expression.
pub(crate) struct Jit {
    module: JITModule,
    context: codegen::Context,
    builder_context: FunctionBuilderContext,
    runtime: Runtime,
}

impl Jit {
    pub(crate) fn new() -> Result<Self, CompileError> {
        let mut builder = JITBuilder::with_isa(host_isa()?, default_libcall_names());
        runtime::register_symbols(&mut builder);

        let mut module = JITModule::new(builder);
        let runtime = Runtime::declare(&mut module)?;
        Ok(Self {
            context: module.make_context(),
            module,
            builder_context: FunctionBuilderContext::new(),
            runtime,
        })
    }

    /// Compiles the value `emit` produces into a callable function.
    pub(crate) fn compile(
        mut self,
        name: &str,
        emit: impl FnOnce(&mut Translator<'_>) -> Result<Value, CompileError>,
    ) -> Result<CompiledFunction, CompileError> {
        let pointer = self.module.target_config().pointer_type();
        let mut signature = self.module.make_signature();
        signature.params.push(AbiParam::new(pointer)); // environment
        signature.params.push(AbiParam::new(pointer)); // result
        signature.returns.push(AbiParam::new(types::I32)); // status

        let id = self
            .module
            .declare_function("expression", Linkage::Local, &signature)
            .map_err(module_error)?;
        self.context.func.signature = signature;
        self.context.func.name = UserFuncName::user(0, id.as_u32());

        let mut builder = FunctionBuilder::new(&mut self.context.func, &mut self.builder_context);
        let entry = builder.create_block();
        builder.append_block_params_for_function_params(entry);
        builder.switch_to_block(entry);
        builder.seal_block(entry);
        let environment = builder.block_params(entry)[0];
        let result = builder.block_params(entry)[1];

        let imports = Imports {
            get_variable: self
                .module
                .declare_func_in_func(self.runtime.get_variable, builder.func),
            call_function: self
                .module
                .declare_func_in_func(self.runtime.call_function, builder.func),
            pow: self.module.declare_func_in_func(self.runtime.pow, builder.func),
            rem: self.module.declare_func_in_func(self.runtime.rem, builder.func),
        };
        let out = builder.create_sized_stack_slot(StackSlotData::new(
            StackSlotKind::ExplicitSlot,
            8,
            3,
        ));

        let mut translator = Translator {
            builder,
            pointer,
            environment,
            imports,
            out,
            failed: None,
            identifiers: Vec::new(),
            indices: FxHashMap::default(),
        };
        let value = emit(&mut translator)?;
        let identifiers = translator.finish(result, value);

        log::debug!(
            "Translated {} into {} instructions",
            name,
            self.context.func.dfg.num_insts()
        );

        #[cfg(feature = "disassemble")]
        println!("{}", self.context.func.display());

        self.module
            .define_function(id, &mut self.context)
            .map_err(module_error)?;
        self.module.clear_context(&mut self.context);
        self.module.finalize_definitions().map_err(module_error)?;

        let code = self.module.get_finalized_function(id);
        // Safety: `code` was built with the `Entry` signature above
        let entry = unsafe { std::mem::transmute::<*const u8, Entry>(code) };
        Ok(CompiledFunction {
            module: Some(self.module),
            entry,
            identifiers,
        })
    }
}

struct Imports {
    get_variable: FuncRef,
    call_function: FuncRef,
    pow: FuncRef,
    rem: FuncRef,
}

/// Emits the body of one compiled expression.
///
/// Values are SSA values of type `f64`. Arrays are stack slots of the
/// compiled function, so evaluation never allocates for them.
pub(crate) struct Translator<'a> {
    builder: FunctionBuilder<'a>,
    pointer: Type,
    environment: Value,
    imports: Imports,
    /// Where trampolines write the value they produce.
    out: StackSlot,
    failed: Option<Block>,
    identifiers: Vec<Arc<str>>,
    indices: FxHashMap<Arc<str>, u32>,
}

impl Translator<'_> {
    pub(crate) fn constant(&mut self, value: f64) -> Value {
        self.builder.ins().f64const(value)
    }

    pub(crate) fn binary(&mut self, op: BinaryOp, a: Value, b: Value) -> Value {
        match op {
            BinaryOp::Add => self.builder.ins().fadd(a, b),
            BinaryOp::Subtract => self.builder.ins().fsub(a, b),
            BinaryOp::Multiply => self.builder.ins().fmul(a, b),
            BinaryOp::Divide => self.builder.ins().fdiv(a, b),
            BinaryOp::Modulo => self.call_math(self.imports.rem, a, b),
            BinaryOp::Power => self.call_math(self.imports.pow, a, b),
        }
    }

    pub(crate) fn negate(&mut self, value: Value) -> Value {
        self.builder.ins().fneg(value)
    }

    /// A fresh array of `slots` values in the compiled function's frame.
    pub(crate) fn array(&mut self, slots: usize) -> Result<StackSlot, CompileError> {
        let size = slots
            .checked_mul(8)
            .and_then(|size| u32::try_from(size).ok())
            .ok_or(CompileError::ScratchOverflow(slots))?;
        Ok(self.builder.create_sized_stack_slot(StackSlotData::new(
            StackSlotKind::ExplicitSlot,
            size,
            3,
        )))
    }

    pub(crate) fn store(
        &mut self,
        array: StackSlot,
        index: usize,
        value: Value,
    ) -> Result<(), CompileError> {
        let offset = offset(index)?;
        self.builder.ins().stack_store(value, array, offset);
        Ok(())
    }

    pub(crate) fn get_variable(&mut self, identifier: &str) -> Result<Value, CompileError> {
        let identifier = self.identifier(identifier)?;
        let environment = self.environment;
        Ok(self.checked_call(self.imports.get_variable, &[environment, identifier]))
    }

    /// Calls `identifier` with `count` values of `array` starting at `start`.
    pub(crate) fn call_function(
        &mut self,
        identifier: &str,
        parameters: Option<(StackSlot, usize)>,
        count: usize,
    ) -> Result<Value, CompileError> {
        let identifier = self.identifier(identifier)?;
        let address = match parameters {
            Some((array, start)) => {
                let offset = offset(start)?;
                self.builder.ins().stack_addr(self.pointer, array, offset)
            }
            None => self.builder.ins().iconst(self.pointer, 0),
        };
        let count = i64::try_from(count).map_err(|_| CompileError::ScratchOverflow(count))?;
        let count = self.builder.ins().iconst(self.pointer, count);
        let environment = self.environment;
        Ok(self.checked_call(
            self.imports.call_function,
            &[environment, identifier, address, count],
        ))
    }

    fn identifier(&mut self, identifier: &str) -> Result<Value, CompileError> {
        let index = match self.indices.get(identifier) {
            Some(index) => *index,
            None => {
                let index = u32::try_from(self.identifiers.len())
                    .map_err(|_| CompileError::TooManyIdentifiers)?;
                let identifier: Arc<str> = identifier.into();
                self.identifiers.push(identifier.clone());
                self.indices.insert(identifier, index);
                index
            }
        };
        Ok(self.builder.ins().iconst(types::I32, i64::from(index)))
    }

    fn call_math(&mut self, callee: FuncRef, a: Value, b: Value) -> Value {
        let call = self.builder.ins().call(callee, &[a, b]);
        self.builder.inst_results(call)[0]
    }

    /// Calls a trampoline and leaves through the failure block unless it
    /// reports success.
    fn checked_call(&mut self, callee: FuncRef, arguments: &[Value]) -> Value {
        let out = self.builder.ins().stack_addr(self.pointer, self.out, 0);
        let mut arguments = arguments.to_vec();
        arguments.push(out);

        let call = self.builder.ins().call(callee, &arguments);
        let status = self.builder.inst_results(call)[0];
        let failed = *self
            .failed
            .get_or_insert_with(|| self.builder.create_block());
        let next = self.builder.create_block();
        self.builder.ins().brif(status, failed, &[], next, &[]);
        self.builder.switch_to_block(next);
        self.builder.seal_block(next);

        self.builder.ins().stack_load(types::F64, self.out, 0)
    }

    fn finish(mut self, result: Value, value: Value) -> Box<[Arc<str>]> {
        self.builder
            .ins()
            .store(MemFlags::trusted(), value, result, 0);
        let ok = self.builder.ins().iconst(types::I32, i64::from(runtime::OK));
        self.builder.ins().return_(&[ok]);

        if let Some(failed) = self.failed {
            self.builder.switch_to_block(failed);
            let status = self
                .builder
                .ins()
                .iconst(types::I32, i64::from(runtime::FAILED));
            self.builder.ins().return_(&[status]);
        }

        self.builder.seal_all_blocks();
        self.builder.finalize();
        self.identifiers.into_boxed_slice()
    }
}

fn offset(index: usize) -> Result<i32, CompileError> {
    index
        .checked_mul(8)
        .and_then(|offset| i32::try_from(offset).ok())
        .ok_or(CompileError::ScratchOverflow(index))
}

/// Finalized machine code and the module that owns it.
pub(crate) struct CompiledFunction {
    module: Option<JITModule>,
    entry: Entry,
    identifiers: Box<[Arc<str>]>,
}

impl CompiledFunction {
    pub(crate) fn invoke(&self, context: &dyn EvaluationContext) -> Result<f64, EvaluationError> {
        let mut environment = Environment::new(context, &self.identifiers);
        let mut result = 0.0;
        // Safety: the code lives as long as `self.module` and only reads the
        // environment through the trampolines
        unsafe {
            (self.entry)(
                (&mut environment as *mut Environment<'_>).cast::<c_void>(),
                &mut result,
            );
        }
        environment.finish(result)
    }
}

impl Drop for CompiledFunction {
    fn drop(&mut self) {
        if let Some(module) = self.module.take() {
            // Safety: `entry` is never called after this
            unsafe { module.free_memory() };
        }
    }
}

// The finalized code is immutable and every invocation brings its own
// environment and stack frame.
unsafe impl Send for CompiledFunction {}
unsafe impl Sync for CompiledFunction {}
