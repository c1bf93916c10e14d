//! Function declarations.
//!
//! Every SSA function gets its LLVM declaration before any body is lowered,
//! so forward references (calls, function values, defer thunks) always
//! resolve. The signature shape is decided here:
//!
//! - non-blocking: void / single result / anonymous result struct;
//! - blocking: a byte-pointer return (the task handle) and a leading
//!   byte-pointer parent-task parameter;
//! - source parameters are expanded into fragments, symmetric with the
//!   call-site packing;
//! - closure bodies and bound methods get a trailing byte-pointer context.

use inkwell::types::{BasicMetadataTypeEnum, BasicType};
use inkwell::values::FunctionValue;

use crate::diagnostics::{CompileError, Result};
use crate::ssa::{FuncId, Function, Program};

use super::session::Session;

impl<'ctx> Session<'ctx> {
    pub(crate) fn declare_function(
        &mut self,
        _program: &Program,
        id: FuncId,
        func: &Function,
    ) -> Result<()> {
        let fn_type = if func.blocking {
            if !func.sig.results.is_empty() {
                return Err(CompileError::UnsupportedBlockingReturn(func.link_name.clone()));
            }
            // Task handle out, parent task in.
            let mut params: Vec<BasicMetadataTypeEnum<'ctx>> = vec![self.i8_ptr_type.into()];
            self.push_param_types(func, &mut params)?;
            self.i8_ptr_type.fn_type(&params, false)
        } else {
            let mut params: Vec<BasicMetadataTypeEnum<'ctx>> = Vec::new();
            self.push_param_types(func, &mut params)?;
            match func.sig.results.len() {
                0 => self.context.void_type().fn_type(&params, false),
                1 => self.lower_type(&func.sig.results[0])?.fn_type(&params, false),
                _ => {
                    let mut results = Vec::with_capacity(func.sig.results.len());
                    for r in &func.sig.results {
                        results.push(self.lower_type(r)?);
                    }
                    self.context.struct_type(&results, false).fn_type(&params, false)
                }
            }
        };

        // The symbol may already exist, e.g. a runtime helper declared at a
        // call site before the runtime package itself is compiled.
        let llvm_fn = match self.module.get_function(&func.link_name) {
            Some(f) => f,
            None => self.module.add_function(&func.link_name, fn_type, None),
        };
        self.functions.insert(id, llvm_fn);
        Ok(())
    }

    fn push_param_types(
        &self,
        func: &Function,
        out: &mut Vec<BasicMetadataTypeEnum<'ctx>>,
    ) -> Result<()> {
        for &pid in &func.params {
            let ty = func.value(pid).ty.clone().ok_or_else(|| {
                CompileError::internal(format!("untyped parameter in {}", func.link_name))
            })?;
            let llvm_ty = self.lower_type(&ty)?;
            for frag in self.expanded_param_types(llvm_ty) {
                out.push(frag.into());
            }
        }
        if func.needs_context {
            out.push(self.i8_ptr_type.into());
        }
        Ok(())
    }

    /// The declared LLVM function for an SSA function id.
    pub(crate) fn llvm_function(
        &self,
        program: &Program,
        id: FuncId,
    ) -> Result<FunctionValue<'ctx>> {
        self.functions.get(&id).copied().ok_or_else(|| {
            CompileError::UndefinedFunction(program.func(id).link_name.clone())
        })
    }
}
