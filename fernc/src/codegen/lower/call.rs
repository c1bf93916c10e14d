//! Call lowering: static calls, calls through function values, interface
//! invocations, language builtins and the magic inline-assembly intrinsics.

use inkwell::values::{
    BasicMetadataValueEnum, BasicValue, BasicValueEnum, CallableValue, PointerValue,
};
use inkwell::AddressSpace;

use crate::diagnostics::{CompileError, Result};
use crate::ssa::{Builtin, CallInstr, Callee, Operand, Program, Signature, TypeKind};

use super::super::session::Session;
use super::Frame;

/// Link names recognised as the one-string inline-assembly intrinsic.
const ASM_INTRINSICS: &[&str] = &["device/arm.Asm", "device/avr.Asm"];
/// Link names recognised as the template-plus-operands form.
const ASM_FULL_INTRINSICS: &[&str] = &["device/arm.AsmFull", "device/avr.AsmFull"];
/// The sleep primitive, intercepted inside blocking functions.
const TIME_SLEEP: &str = "time.Sleep";

impl<'ctx> Session<'ctx> {
    /// Lower a call-shaped instruction. `spawn` marks a `go` statement:
    /// the callee gets a null parent handle and the caller does not
    /// suspend.
    pub(crate) fn lower_call(
        &mut self,
        program: &Program,
        frame: &mut Frame<'ctx, '_>,
        call: &CallInstr,
        spawn: bool,
    ) -> Result<Option<BasicValueEnum<'ctx>>> {
        match &call.callee {
            Callee::Invoke { itf, method, sig } => {
                let (fn_ptr, receiver) = self.resolve_invoke(program, frame, itf, method, sig)?;
                let mut args: Vec<BasicMetadataValueEnum<'ctx>> = vec![receiver.into()];
                for arg in &call.args {
                    let v = self.resolve_operand(program, frame, arg)?;
                    for frag in self.expand_param_value(v)? {
                        args.push(frag.into());
                    }
                }
                let callable = CallableValue::try_from(fn_ptr)
                    .map_err(|_| CompileError::internal("interface method is not callable"))?;
                let result = self.builder.build_call(callable, &args, "")?;
                Ok(result.try_as_basic_value().left())
            }

            Callee::Function(fid) => {
                let target = program.func(*fid);

                if ASM_INTRINSICS.contains(&target.link_name.as_str()) {
                    return self.lower_inline_asm(call);
                }
                if ASM_FULL_INTRINSICS.contains(&target.link_name.as_str()) {
                    return self.lower_inline_asm_full(program, frame, call);
                }
                if frame.is_blocking() && target.link_name == TIME_SLEEP {
                    return self.lower_sleep(program, frame, call);
                }

                let llvm_fn = self.llvm_function(program, *fid)?;
                // A call to a context-taking function outside any closure
                // construction supplies a dummy null context; closures are
                // always applied through their function value instead.
                let context = if target.needs_context {
                    Some(self.i8_ptr_type.const_null().as_basic_value_enum())
                } else {
                    None
                };
                self.lower_function_call(
                    program,
                    frame,
                    &call.args,
                    llvm_fn.into(),
                    context,
                    target.blocking,
                    spawn,
                )
            }

            Callee::Builtin(b) => self.lower_builtin(program, frame, *b, &call.args),

            Callee::Pointer { value, sig } => {
                let v = self.resolve_operand(program, frame, value)?;
                let (fn_ptr, context) = if sig.needs_context {
                    // Closure-shaped value: {context, function pointer}.
                    let sv = v.into_struct_value();
                    let ctx = self.builder.build_extract_value(sv, 0, "")?;
                    let fp = self.builder.build_extract_value(sv, 1, "")?;
                    (fp.into_pointer_value(), Some(ctx))
                } else {
                    (v.into_pointer_value(), None)
                };
                let callable = CallableValue::try_from(fn_ptr)
                    .map_err(|_| CompileError::internal("function value is not callable"))?;
                self.lower_function_call(
                    program, frame, &call.args, callable, context, false, spawn,
                )
            }
        }
    }

    /// Emit the argument list and the call itself; blocking callees get
    /// their parent handle prepended and the caller suspends around the
    /// call.
    #[allow(clippy::too_many_arguments)]
    fn lower_function_call(
        &mut self,
        program: &Program,
        frame: &mut Frame<'ctx, '_>,
        args: &[Operand],
        callable: CallableValue<'ctx>,
        context: Option<BasicValueEnum<'ctx>>,
        callee_blocking: bool,
        spawn: bool,
    ) -> Result<Option<BasicValueEnum<'ctx>>> {
        let mut params: Vec<BasicMetadataValueEnum<'ctx>> = Vec::new();
        if callee_blocking {
            if spawn {
                // A spawned task has no parent frame.
                params.push(self.i8_ptr_type.const_null().into());
            } else {
                let task = frame.task.as_ref().ok_or_else(|| {
                    CompileError::internal(format!(
                        "blocking call in non-blocking function {}",
                        frame.func.link_name
                    ))
                })?;
                params.push(task.handle.into());
            }
        }
        for arg in args {
            let v = self.resolve_operand(program, frame, arg)?;
            for frag in self.expand_param_value(v)? {
                params.push(frag.into());
            }
        }
        if let Some(ctx) = context {
            params.push(ctx.into());
        }

        let result = self
            .builder
            .build_call(callable, &params, "")?
            .try_as_basic_value()
            .left();

        if callee_blocking && !spawn {
            // Hand the child to the scheduler, mark ourselves waiting and
            // suspend; the child reactivates us from its final return.
            let child = result.ok_or_else(|| {
                CompileError::internal("blocking callee returned no handle")
            })?;
            let handle = frame
                .task
                .as_ref()
                .expect("checked above")
                .handle;
            self.runtime_call("yieldToScheduler", &[child.into()], "")?;
            self.runtime_call("waitForAsyncCall", &[handle.into()], "")?;
            self.suspend(frame, "task.callComplete")?;
            return Ok(None);
        }
        Ok(result)
    }

    /// `time.Sleep` inside a blocking function: park the task with the
    /// scheduler and suspend; execution resumes in the wakeup block.
    fn lower_sleep(
        &mut self,
        program: &Program,
        frame: &mut Frame<'ctx, '_>,
        call: &CallInstr,
    ) -> Result<Option<BasicValueEnum<'ctx>>> {
        let duration = self
            .resolve_operand(program, frame, call.args.first().ok_or_else(|| {
                CompileError::internal("sleep without a duration argument")
            })?)?;
        let handle = frame.task.as_ref().expect("blocking frame").handle;
        self.runtime_call("sleepTask", &[handle.into(), duration.into()], "")?;
        self.suspend(frame, "task.wakeup")?;
        Ok(None)
    }

    /// Resolve an interface method to a typed function pointer plus the
    /// receiver argument (the stored byte pointer).
    pub(crate) fn resolve_invoke(
        &mut self,
        program: &Program,
        frame: &mut Frame<'ctx, '_>,
        itf: &Operand,
        method: &str,
        sig: &Signature,
    ) -> Result<(PointerValue<'ctx>, BasicValueEnum<'ctx>)> {
        let itf_ty = self.operand_type(program, frame.func, itf)?;
        let itf_v = self.resolve_operand(program, frame, itf)?.into_struct_value();
        let typecode = self.builder.build_extract_value(itf_v, 0, "invoke.typecode")?;
        let receiver = self.builder.build_extract_value(itf_v, 1, "invoke.value")?;

        let methods_g =
            self.marker_global("itfmethods", &itf_ty.describe(), self.i8_ptr_type.into());
        let method_base = method.rsplit('.').next().unwrap_or(method);
        let sig_key = format!("{}:{}", method_base, sig.describe());
        let signature_g =
            self.marker_global("signature", &sig_key, self.context.i16_type().into());

        let raw = self
            .runtime_call_value(
                "interfaceMethod",
                &[
                    typecode.into(),
                    methods_g.as_pointer_value().into(),
                    signature_g.as_pointer_value().into(),
                ],
                "invoke.func",
            )?
            .into_pointer_value();

        let fn_ty = self.signature_fn_type(sig)?;
        let fn_ptr = self.builder.build_pointer_cast(
            raw,
            fn_ty.ptr_type(AddressSpace::default()),
            "invoke.func.cast",
        )?;
        Ok((fn_ptr, receiver))
    }

    fn lower_builtin(
        &mut self,
        program: &Program,
        frame: &mut Frame<'ctx, '_>,
        builtin: Builtin,
        args: &[Operand],
    ) -> Result<Option<BasicValueEnum<'ctx>>> {
        match builtin {
            Builtin::Append => {
                let src = self.resolve_operand(program, frame, &args[0])?.into_struct_value();
                let elems = self.resolve_operand(program, frame, &args[1])?.into_struct_value();
                let src_buf = self
                    .builder
                    .build_extract_value(src, 0, "append.srcBuf")?
                    .into_pointer_value();
                let src_ptr =
                    self.builder.build_pointer_cast(src_buf, self.i8_ptr_type, "append.srcPtr")?;
                let src_len = self.builder.build_extract_value(src, 1, "append.srcLen")?;
                let src_cap = self.builder.build_extract_value(src, 2, "append.srcCap")?;
                let elems_buf = self
                    .builder
                    .build_extract_value(elems, 0, "append.elemsBuf")?
                    .into_pointer_value();
                let elems_ptr = self.builder.build_pointer_cast(
                    elems_buf,
                    self.i8_ptr_type,
                    "append.elemsPtr",
                )?;
                let elems_len = self.builder.build_extract_value(elems, 1, "append.elemsLen")?;

                let elem_ty: inkwell::types::BasicTypeEnum<'ctx> = src_buf
                    .get_type()
                    .get_element_type()
                    .try_into()
                    .map_err(|_| CompileError::internal("slice of non-basic element"))?;
                let elem_size =
                    self.uintptr_type.const_int(self.size_of(elem_ty), false);

                let result = self
                    .runtime_call_value(
                        "sliceAppend",
                        &[
                            src_ptr.into(),
                            elems_ptr.into(),
                            src_len.into(),
                            src_cap.into(),
                            elems_len.into(),
                            elem_size.into(),
                        ],
                        "append.new",
                    )?
                    .into_struct_value();
                let new_ptr = self
                    .builder
                    .build_extract_value(result, 0, "append.newPtr")?
                    .into_pointer_value();
                let new_buf =
                    self.builder.build_pointer_cast(new_ptr, src_buf.get_type(), "append.newBuf")?;
                let new_len = self.builder.build_extract_value(result, 1, "append.newLen")?;
                let new_cap = self.builder.build_extract_value(result, 2, "append.newCap")?;
                let out = src.get_type().get_undef();
                let out = self.builder.build_insert_value(out, new_buf, 0, "")?;
                let out = self.builder.build_insert_value(out, new_len, 1, "")?;
                let out = self.builder.build_insert_value(out, new_cap, 2, "")?;
                Ok(Some(out.as_basic_value_enum()))
            }

            Builtin::Cap => {
                let ty = self.underlying(&self.operand_type(program, frame.func, &args[0])?)?;
                match ty.kind() {
                    TypeKind::Slice(_) => {
                        let v = self.resolve_operand(program, frame, &args[0])?;
                        let cap = self
                            .builder
                            .build_extract_value(v.into_struct_value(), 2, "cap")?;
                        Ok(Some(self.extend_len(cap)?))
                    }
                    _ => Err(CompileError::UnsupportedInstruction(format!(
                        "cap of {}",
                        ty.describe()
                    ))),
                }
            }

            Builtin::Len => {
                let ty = self.underlying(&self.operand_type(program, frame.func, &args[0])?)?;
                let v = self.resolve_operand(program, frame, &args[0])?;
                let len = match ty.kind() {
                    TypeKind::String | TypeKind::Slice(_) => {
                        self.builder.build_extract_value(v.into_struct_value(), 1, "len")?
                    }
                    TypeKind::Map { .. } => {
                        self.runtime_call_value("hashmapLen", &[v.into()], "len")?
                    }
                    _ => {
                        return Err(CompileError::UnsupportedInstruction(format!(
                            "len of {}",
                            ty.describe()
                        )))
                    }
                };
                Ok(Some(self.extend_len(len)?))
            }

            Builtin::Copy => {
                let dst = self.resolve_operand(program, frame, &args[0])?.into_struct_value();
                let src = self.resolve_operand(program, frame, &args[1])?.into_struct_value();
                let dst_len = self.builder.build_extract_value(dst, 1, "copy.dstLen")?;
                let src_len = self.builder.build_extract_value(src, 1, "copy.srcLen")?;
                let dst_buf = self
                    .builder
                    .build_extract_value(dst, 0, "copy.dstArray")?
                    .into_pointer_value();
                let src_buf = self
                    .builder
                    .build_extract_value(src, 0, "copy.srcArray")?
                    .into_pointer_value();
                let elem_ty: inkwell::types::BasicTypeEnum<'ctx> = dst_buf
                    .get_type()
                    .get_element_type()
                    .try_into()
                    .map_err(|_| CompileError::internal("slice of non-basic element"))?;
                let dst_raw =
                    self.builder.build_pointer_cast(dst_buf, self.i8_ptr_type, "copy.dstPtr")?;
                let src_raw =
                    self.builder.build_pointer_cast(src_buf, self.i8_ptr_type, "copy.srcPtr")?;
                let elem_size =
                    self.uintptr_type.const_int(self.size_of(elem_ty), false);
                Ok(Some(self.runtime_call_value(
                    "sliceCopy",
                    &[
                        dst_raw.into(),
                        src_raw.into(),
                        dst_len.into(),
                        src_len.into(),
                        elem_size.into(),
                    ],
                    "copy.n",
                )?))
            }

            Builtin::Delete => {
                let m = self.resolve_operand(program, frame, &args[0])?;
                let key = self.resolve_operand(program, frame, &args[1])?;
                let key_ty = self.underlying(&self.operand_type(program, frame.func, &args[1])?)?;
                if matches!(key_ty.kind(), TypeKind::String) {
                    self.runtime_call("hashmapStringDelete", &[m.into(), key.into()], "")?;
                } else {
                    let slot = self.builder.build_alloca(key.get_type(), "delete.key")?;
                    self.builder.build_store(slot, key)?;
                    let raw =
                        self.builder.build_pointer_cast(slot, self.i8_ptr_type, "delete.keyptr")?;
                    self.runtime_call("hashmapBinaryDelete", &[m.into(), raw.into()], "")?;
                }
                Ok(None)
            }

            Builtin::Complex => {
                let re = self.resolve_operand(program, frame, &args[0])?.into_float_value();
                let im = self.resolve_operand(program, frame, &args[1])?.into_float_value();
                let vec_ty = re.get_type().vec_type(2);
                let i32t = self.context.i32_type();
                let v = self.builder.build_insert_element(
                    vec_ty.get_undef(),
                    re,
                    i32t.const_int(0, false),
                    "",
                )?;
                let v = self
                    .builder
                    .build_insert_element(v, im, i32t.const_int(1, false), "")?;
                Ok(Some(v.into()))
            }

            Builtin::Real => {
                let v = self.resolve_operand(program, frame, &args[0])?.into_vector_value();
                let idx = self.context.i32_type().const_int(0, false);
                Ok(Some(self.builder.build_extract_element(v, idx, "real")?))
            }

            Builtin::Imag => {
                let v = self.resolve_operand(program, frame, &args[0])?.into_vector_value();
                let idx = self.context.i32_type().const_int(1, false);
                Ok(Some(self.builder.build_extract_element(v, idx, "imag")?))
            }

            Builtin::Recover => Ok(Some(self.runtime_call_value("_recover", &[], "")?)),

            Builtin::WrapNilCheck => {
                Ok(Some(self.resolve_operand(program, frame, &args[0])?))
            }

            Builtin::Print | Builtin::Println => {
                let newline = builtin == Builtin::Println;
                for (i, arg) in args.iter().enumerate() {
                    if i >= 1 && newline {
                        self.runtime_call("printspace", &[], "")?;
                    }
                    self.lower_print_arg(program, frame, arg)?;
                }
                if newline {
                    self.runtime_call("printnl", &[], "")?;
                }
                Ok(None)
            }
        }
    }

    /// Lengths are lenType-wide; the builtin result is the platform int.
    fn extend_len(&mut self, len: BasicValueEnum<'ctx>) -> Result<BasicValueEnum<'ctx>> {
        let iv = len.into_int_value();
        if iv.get_type().get_bit_width() < self.int_type.get_bit_width() {
            Ok(self.builder.build_int_z_extend(iv, self.int_type, "len.int")?.into())
        } else {
            Ok(len)
        }
    }

    fn lower_print_arg(
        &mut self,
        program: &Program,
        frame: &mut Frame<'ctx, '_>,
        arg: &Operand,
    ) -> Result<()> {
        let ty = self.underlying(&self.operand_type(program, frame.func, arg)?)?;
        let value = self.resolve_operand(program, frame, arg)?;
        match ty.kind() {
            TypeKind::String => {
                self.runtime_call("printstring", &[value.into()], "")?;
            }
            TypeKind::Uintptr => {
                self.runtime_call("printptr", &[value.into()], "")?;
            }
            TypeKind::UnsafePointer | TypeKind::Pointer(_) => {
                let as_int = self.builder.build_ptr_to_int(
                    value.into_pointer_value(),
                    self.uintptr_type,
                    "",
                )?;
                self.runtime_call("printptr", &[as_int.into()], "")?;
            }
            TypeKind::Bool => {
                self.runtime_call("printbool", &[value.into()], "")?;
            }
            TypeKind::Float32 => {
                self.runtime_call("printfloat32", &[value.into()], "")?;
            }
            TypeKind::Float64 => {
                self.runtime_call("printfloat64", &[value.into()], "")?;
            }
            TypeKind::Complex64 => {
                self.runtime_call("printcomplex64", &[value.into()], "")?;
            }
            TypeKind::Complex128 => {
                self.runtime_call("printcomplex128", &[value.into()], "")?;
            }
            TypeKind::Interface => {
                self.runtime_call("printitf", &[value.into()], "")?;
            }
            TypeKind::Map { .. } => {
                self.runtime_call("printmap", &[value.into()], "")?;
            }
            _ if ty.is_integer() => {
                let bits = self.size_of(value.get_type()) * 8;
                let name = if ty.is_signed() {
                    format!("printint{}", bits)
                } else {
                    format!("printuint{}", bits)
                };
                self.runtime_call(&name, &[value.into()], "")?;
            }
            _ => {
                return Err(CompileError::UnsupportedInstruction(format!(
                    "print of {}",
                    ty.describe()
                )))
            }
        }
        Ok(())
    }

    /// One-string inline assembly: emitted verbatim with no operands.
    fn lower_inline_asm(&mut self, call: &CallInstr) -> Result<Option<BasicValueEnum<'ctx>>> {
        let asm = asm_template(call)?;
        let fn_ty = self.context.void_type().fn_type(&[], false);
        let asm_ptr = self.context.create_inline_asm(
            fn_ty,
            asm,
            String::new(),
            true,  // has side effects
            false, // align stack
            None,
            false,
        );
        let callable = CallableValue::try_from(asm_ptr)
            .map_err(|_| CompileError::internal("inline assembly value is not callable"))?;
        self.builder.build_call(callable, &[], "")?;
        Ok(None)
    }

    /// Template form: `{name}` placeholders are rewritten to numbered
    /// operands with constraints derived from the operand's LLVM kind.
    fn lower_inline_asm_full(
        &mut self,
        program: &Program,
        frame: &mut Frame<'ctx, '_>,
        call: &CallInstr,
    ) -> Result<Option<BasicValueEnum<'ctx>>> {
        let template = asm_template(call)?;
        let Some(Operand::RegisterMap(entries)) = call.args.get(1) else {
            return Err(CompileError::InlineAsm(
                "missing operand map argument".into(),
            ));
        };
        let mut registers = Vec::with_capacity(entries.len());
        for (name, op) in entries {
            let value = self.resolve_operand(program, frame, op)?;
            registers.push((name.clone(), value));
        }

        let mut numbered: Vec<(String, usize)> = Vec::new();
        let mut arg_values: Vec<BasicMetadataValueEnum<'ctx>> = Vec::new();
        let mut arg_types = Vec::new();
        let mut constraints: Vec<&'static str> = Vec::new();

        let mut rewritten = String::with_capacity(template.len());
        let mut chars = template.char_indices().peekable();
        while let Some((_, c)) = chars.next() {
            if c != '{' {
                rewritten.push(c);
                continue;
            }
            // Collect an alphabetic placeholder name up to '}'.
            let mut name = String::new();
            let mut closed = false;
            for (_, n) in chars.by_ref() {
                if n == '}' {
                    closed = true;
                    break;
                }
                name.push(n);
            }
            if !closed || name.is_empty() || !name.chars().all(|ch| ch.is_ascii_alphabetic()) {
                // Not an operand reference (e.g. a register-list brace).
                rewritten.push('{');
                rewritten.push_str(&name);
                if closed {
                    rewritten.push('}');
                }
                continue;
            }
            let value = registers
                .iter()
                .find(|(n, _)| *n == name)
                .map(|(_, v)| *v)
                .ok_or_else(|| {
                    CompileError::InlineAsm(format!("unknown register name: {}", name))
                })?;
            let number = match numbered.iter().find(|(n, _)| *n == name) {
                Some((_, num)) => *num,
                None => {
                    let num = numbered.len();
                    numbered.push((name.clone(), num));
                    constraints.push(match value {
                        BasicValueEnum::IntValue(_) => "r",
                        BasicValueEnum::PointerValue(_) => "*m",
                        _ => {
                            return Err(CompileError::InlineAsm(format!(
                                "unsupported operand type for {}",
                                name
                            )))
                        }
                    });
                    arg_types.push(value.get_type().into());
                    arg_values.push(value.into());
                    num
                }
            };
            rewritten.push_str(&format!("${{{}}}", number));
        }

        let fn_ty = self.context.void_type().fn_type(&arg_types, false);
        let asm_ptr = self.context.create_inline_asm(
            fn_ty,
            rewritten,
            constraints.join(","),
            true,
            false,
            None,
            false,
        );
        let callable = CallableValue::try_from(asm_ptr)
            .map_err(|_| CompileError::internal("inline assembly value is not callable"))?;
        self.builder.build_call(callable, &arg_values, "")?;
        Ok(None)
    }
}

/// The constant template string of an inline-assembly intrinsic call.
fn asm_template(call: &CallInstr) -> Result<String> {
    match call.args.first() {
        Some(Operand::Const(c)) => match &c.kind {
            crate::ssa::ConstKind::Str(bytes) => Ok(String::from_utf8_lossy(bytes).into_owned()),
            _ => Err(CompileError::InlineAsm("template is not a string constant".into())),
        },
        _ => Err(CompileError::InlineAsm("template is not a constant".into())),
    }
}
