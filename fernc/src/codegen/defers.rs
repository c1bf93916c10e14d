//! The defer engine.
//!
//! A defer site packs a frame `{thunk, next, payload…}` into a stack cell
//! (a task-frame cell in blocking functions) and pushes it onto the
//! function's defer list by swinging the head slot. `runtime.rundefers`
//! walks the list at function exit and calls each thunk, which unpacks its
//! frame and dispatches to the real target.
//!
//! Thunks cannot be shared across targets because the trailing payload
//! differs, but they are shared across call sites with the same callee or
//! (for function-pointer defers) the same signature: the cache is keyed by
//! kind plus target-or-signature. Bodies are emitted once all ordinary
//! functions are lowered.

use inkwell::module::Linkage;
use inkwell::types::{BasicTypeEnum, StructType};
use inkwell::values::{
    BasicMetadataValueEnum, BasicValue, BasicValueEnum, CallableValue, FunctionValue,
    UnnamedAddress,
};
use inkwell::AddressSpace;

use crate::diagnostics::{CompileError, Result};
use crate::ssa::{CallInstr, Callee, FuncId, Function, Program, ValueId};

use super::lower::Frame;
use super::runtime::shapes;
use super::session::Session;

/// A declared defer thunk awaiting its body.
pub(crate) enum PendingThunk<'ctx> {
    /// Deferred static call: payload is the argument list.
    Function {
        target: FuncId,
        thunk: FunctionValue<'ctx>,
        frame_ty: StructType<'ctx>,
    },
    /// Deferred interface method: payload is the resolved function pointer
    /// followed by receiver and arguments.
    Invoke {
        thunk: FunctionValue<'ctx>,
        frame_ty: StructType<'ctx>,
    },
    /// Deferred call through a closure-shaped function value: payload is
    /// the closure followed by the arguments.
    Closure {
        thunk: FunctionValue<'ctx>,
        frame_ty: StructType<'ctx>,
    },
}

impl<'ctx> Session<'ctx> {
    /// The LLVM struct type of one defer site's frame. Shared between the
    /// task-frame scan and the site lowering, so both see the same layout.
    pub(crate) fn defer_frame_type(
        &mut self,
        program: &Program,
        func: &Function,
        call: &CallInstr,
    ) -> Result<StructType<'ctx>> {
        let defer_ptr_ty =
            self.named_struct(shapes::DEFER)?.ptr_type(AddressSpace::default());
        let thunk_ptr_ty = self
            .context
            .void_type()
            .fn_type(&[defer_ptr_ty.into()], false)
            .ptr_type(AddressSpace::default());

        let mut fields: Vec<BasicTypeEnum<'ctx>> =
            vec![thunk_ptr_ty.into(), defer_ptr_ty.into()];
        match &call.callee {
            Callee::Function(_) => {}
            Callee::Invoke { sig, .. } => {
                let fn_ty = self.signature_fn_type(sig)?;
                fields.push(fn_ty.ptr_type(AddressSpace::default()).into());
                fields.push(self.i8_ptr_type.into()); // receiver
            }
            Callee::Pointer { sig, .. } => {
                let closure_ty =
                    self.lower_type(&crate::ssa::Type::signature(sig.clone()))?;
                fields.push(closure_ty);
            }
            Callee::Builtin(_) => {
                return Err(CompileError::UnsupportedInstruction(
                    "defer of a builtin".into(),
                ))
            }
        }
        for arg in &call.args {
            let ty = self.operand_type(program, func, arg)?;
            fields.push(self.lower_type(&ty)?);
        }
        Ok(self.context.struct_type(&fields, false))
    }

    /// Lower one defer site.
    pub(crate) fn lower_defer(
        &mut self,
        program: &Program,
        frame: &mut Frame<'ctx, '_>,
        vid: ValueId,
        call: &CallInstr,
    ) -> Result<()> {
        let head_slot = frame.defer_head.ok_or_else(|| {
            CompileError::internal(format!(
                "defer in {} without a defer list slot",
                frame.func.link_name
            ))
        })?;
        let next = self.builder.build_load(head_slot, "defer.next")?;
        let frame_ty = self.defer_frame_type(program, frame.func, call)?;
        let defer_ptr_ty =
            self.named_struct(shapes::DEFER)?.ptr_type(AddressSpace::default());
        let thunk_fn_ty = self
            .context
            .void_type()
            .fn_type(&[defer_ptr_ty.into()], false);

        // Frame values: thunk, old head, then the callee-specific payload.
        let mut values: Vec<BasicValueEnum<'ctx>> = Vec::new();
        match &call.callee {
            Callee::Function(fid) => {
                let target = program.func(*fid);
                if target.blocking {
                    return Err(CompileError::UnsupportedInstruction(format!(
                        "defer of blocking function {}",
                        target.link_name
                    )));
                }
                let key = format!("fn:{}", target.link_name);
                let thunk = match self.thunk_cache.get(&key) {
                    Some(&t) => t,
                    None => {
                        let t = self.declare_thunk(
                            &format!("{}$defer", target.link_name),
                            thunk_fn_ty,
                        );
                        self.thunk_cache.insert(key, t);
                        self.pending_thunks.push(PendingThunk::Function {
                            target: *fid,
                            thunk: t,
                            frame_ty,
                        });
                        t
                    }
                };
                values.push(thunk.as_global_value().as_pointer_value().into());
                values.push(next);
            }
            Callee::Invoke { itf, method, sig } => {
                let (fn_ptr, receiver) = self.resolve_invoke(program, frame, itf, method, sig)?;
                let key = format!("invoke:{}", method);
                let thunk = match self.thunk_cache.get(&key) {
                    Some(&t) => t,
                    None => {
                        let t = self.declare_thunk(&format!("{}$defer", method), thunk_fn_ty);
                        self.thunk_cache.insert(key, t);
                        self.pending_thunks.push(PendingThunk::Invoke { thunk: t, frame_ty });
                        t
                    }
                };
                values.push(thunk.as_global_value().as_pointer_value().into());
                values.push(next);
                values.push(fn_ptr.into());
                values.push(receiver);
            }
            Callee::Pointer { value, sig } => {
                let closure = self.resolve_operand(program, frame, value)?;
                let key = format!("fp:{}", sig.describe());
                let thunk = match self.thunk_cache.get(&key) {
                    Some(&t) => t,
                    None => {
                        let name = format!("{}$fpdefer", frame.func.link_name);
                        let t = self.declare_thunk(&name, thunk_fn_ty);
                        self.thunk_cache.insert(key, t);
                        self.pending_thunks.push(PendingThunk::Closure { thunk: t, frame_ty });
                        t
                    }
                };
                values.push(thunk.as_global_value().as_pointer_value().into());
                values.push(next);
                values.push(closure);
            }
            Callee::Builtin(_) => {
                return Err(CompileError::UnsupportedInstruction(
                    "defer of a builtin".into(),
                ))
            }
        }
        for arg in &call.args {
            values.push(self.resolve_operand(program, frame, arg)?);
        }

        let mut agg: BasicValueEnum<'ctx> = self.zero_value(frame_ty.into())?;
        for (i, v) in values.iter().enumerate() {
            agg = self
                .builder
                .build_insert_value(agg.into_struct_value(), *v, i as u32, "")?
                .as_basic_value_enum();
        }

        // Stack cell outside tasks; a frame cell inside, so the list
        // survives suspension.
        let storage = if let Some(task) = &frame.task {
            *task.in_place.get(&vid).ok_or_else(|| {
                CompileError::internal("defer site without a task-frame slot")
            })?
        } else {
            self.builder.build_alloca(frame_ty, "defer.alloca")?
        };
        self.builder.build_store(storage, agg)?;

        let cast = self
            .builder
            .build_pointer_cast(storage, defer_ptr_ty, "defer.alloca.cast")?;
        self.builder.build_store(head_slot, cast)?;
        Ok(())
    }

    fn declare_thunk(
        &mut self,
        name: &str,
        fn_ty: inkwell::types::FunctionType<'ctx>,
    ) -> FunctionValue<'ctx> {
        let f = self.module.add_function(name, fn_ty, Some(Linkage::Internal));
        f.as_global_value().set_unnamed_address(UnnamedAddress::Global);
        f
    }

    /// Emit the bodies of all thunks declared at defer sites.
    pub(crate) fn emit_defer_thunks(&mut self, program: &Program) -> Result<()> {
        let pending = std::mem::take(&mut self.pending_thunks);
        for thunk in pending {
            self.builder.unset_current_debug_location();
            match thunk {
                PendingThunk::Function { target, thunk, frame_ty } => {
                    self.emit_function_thunk(program, target, thunk, frame_ty)?;
                }
                PendingThunk::Invoke { thunk, frame_ty } => {
                    self.emit_invoke_thunk(thunk, frame_ty)?;
                }
                PendingThunk::Closure { thunk, frame_ty } => {
                    self.emit_closure_thunk(thunk, frame_ty)?;
                }
            }
        }
        Ok(())
    }

    /// Load frame fields `from..` as call arguments, expanded the way the
    /// callee expects.
    fn thunk_args(
        &mut self,
        frame_ptr: inkwell::values::PointerValue<'ctx>,
        frame_ty: StructType<'ctx>,
        from: u32,
    ) -> Result<Vec<BasicMetadataValueEnum<'ctx>>> {
        let mut args = Vec::new();
        for i in from..frame_ty.count_fields() {
            let gep = self.builder.build_struct_gep(frame_ptr, i, "gep")?;
            let value = self.builder.build_load(gep, "param")?;
            for frag in self.expand_param_value(value)? {
                args.push(frag.into());
            }
        }
        Ok(args)
    }

    fn thunk_frame_ptr(
        &mut self,
        thunk: FunctionValue<'ctx>,
        frame_ty: StructType<'ctx>,
    ) -> Result<inkwell::values::PointerValue<'ctx>> {
        let entry = self.context.append_basic_block(thunk, "entry");
        self.builder.position_at_end(entry);
        let raw = thunk
            .get_nth_param(0)
            .ok_or_else(|| CompileError::internal("thunk has no frame parameter"))?
            .into_pointer_value();
        Ok(self.builder.build_pointer_cast(
            raw,
            frame_ty.ptr_type(AddressSpace::default()),
            "deferFrame",
        )?)
    }

    fn emit_function_thunk(
        &mut self,
        program: &Program,
        target: FuncId,
        thunk: FunctionValue<'ctx>,
        frame_ty: StructType<'ctx>,
    ) -> Result<()> {
        let frame_ptr = self.thunk_frame_ptr(thunk, frame_ty)?;
        let mut args = self.thunk_args(frame_ptr, frame_ty, 2)?;
        let func = program.func(target);
        if func.needs_context {
            args.push(self.i8_ptr_type.const_null().into());
        }
        let llvm_fn = self.llvm_function(program, target)?;
        self.builder.build_call(llvm_fn, &args, "")?;
        self.builder.build_return(None)?;
        Ok(())
    }

    fn emit_invoke_thunk(
        &mut self,
        thunk: FunctionValue<'ctx>,
        frame_ty: StructType<'ctx>,
    ) -> Result<()> {
        let frame_ptr = self.thunk_frame_ptr(thunk, frame_ty)?;
        let fn_gep = self.builder.build_struct_gep(frame_ptr, 2, "fn.gep")?;
        let fn_ptr = self.builder.build_load(fn_gep, "fn")?.into_pointer_value();
        let args = self.thunk_args(frame_ptr, frame_ty, 3)?;
        let callable = CallableValue::try_from(fn_ptr)
            .map_err(|_| CompileError::internal("deferred method pointer is not callable"))?;
        self.builder.build_call(callable, &args, "")?;
        self.builder.build_return(None)?;
        Ok(())
    }

    fn emit_closure_thunk(
        &mut self,
        thunk: FunctionValue<'ctx>,
        frame_ty: StructType<'ctx>,
    ) -> Result<()> {
        let frame_ptr = self.thunk_frame_ptr(thunk, frame_ty)?;
        let closure_gep = self.builder.build_struct_gep(frame_ptr, 2, "closure.gep")?;
        let context_gep = self.builder.build_struct_gep(closure_gep, 0, "closure.context.ptr")?;
        let context = self.builder.build_load(context_gep, "closure.context")?;
        let fp_gep = self.builder.build_struct_gep(closure_gep, 1, "closure.fp.ptr")?;
        let fp = self.builder.build_load(fp_gep, "closure.fp")?.into_pointer_value();

        let mut args = self.thunk_args(frame_ptr, frame_ty, 3)?;
        args.push(context.into());
        let callable = CallableValue::try_from(fp)
            .map_err(|_| CompileError::internal("deferred function value is not callable"))?;
        self.builder.build_call(callable, &args, "")?;
        self.builder.build_return(None)?;
        Ok(())
    }
}
