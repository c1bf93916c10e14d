//! Value-producing instruction lowering.

use inkwell::types::{BasicType, BasicTypeEnum};
use inkwell::values::{BasicValue, BasicValueEnum, IntValue, PointerValue, VectorValue};
use inkwell::{AddressSpace, FloatPredicate, IntPredicate};

use crate::diagnostics::{CompileError, Result};
use crate::ssa::{BinOp, Instr, Operand, Program, Type, TypeKind, UnOp, ValueId};

use super::super::runtime::shapes;
use super::super::session::Session;
use super::Frame;

impl<'ctx> Session<'ctx> {
    /// Lower one value-producing instruction. `None` means the instruction
    /// produced no value (e.g. a call to a void function).
    pub(crate) fn lower_expr(
        &mut self,
        program: &Program,
        frame: &mut Frame<'ctx, '_>,
        vid: ValueId,
        instr: &Instr,
    ) -> Result<Option<BasicValueEnum<'ctx>>> {
        let func = frame.func;
        match instr {
            Instr::Alloc { ty, heap, comment } => {
                self.lower_alloc(frame, vid, ty, *heap, comment).map(Some)
            }

            Instr::BinOp { op, x, y } => {
                let ty = self.operand_type(program, func, x)?;
                let lhs = self.resolve_operand(program, frame, x)?;
                let rhs = self.resolve_operand(program, frame, y)?;
                let underlying = self.underlying(&ty)?;
                self.lower_binop(*op, &underlying, lhs, rhs).map(Some)
            }

            Instr::UnOp { op, x } => self.lower_unop(program, frame, *op, x),

            Instr::Call(call) => self.lower_call(program, frame, call, false),

            Instr::ChangeType { x } => {
                let value = self.resolve_operand(program, frame, x)?;
                let to = func.value(vid).ty.clone().ok_or_else(|| {
                    CompileError::internal("untyped type change")
                })?;
                let target = self.lower_type(&to)?;
                // Only named-struct identity actually changes representation;
                // the value is repacked field by field because struct values
                // cannot be bitcast.
                if target != value.get_type() {
                    if let (BasicTypeEnum::StructType(to_st), BasicValueEnum::StructValue(sv)) =
                        (target, value)
                    {
                        let mut agg = self.zero_value(target)?;
                        for i in 0..to_st.count_fields() {
                            let field = self.builder.build_extract_value(sv, i, "")?;
                            agg = self
                                .builder
                                .build_insert_value(agg.into_struct_value(), field, i, "")?
                                .as_basic_value_enum();
                        }
                        return Ok(Some(agg));
                    }
                }
                Ok(Some(value))
            }

            // The representation keeps the concrete typecode, so converting
            // between interface types is the identity; every method call
            // looks up its target anyway.
            Instr::ChangeInterface { x } => {
                self.resolve_operand(program, frame, x).map(Some)
            }

            Instr::Convert { x } => {
                let from = self.operand_type(program, func, x)?;
                let to = func.value(vid).ty.clone().ok_or_else(|| {
                    CompileError::internal("untyped conversion")
                })?;
                let value = self.resolve_operand(program, frame, x)?;
                self.lower_convert(&from, &to, value).map(Some)
            }

            Instr::Extract { tuple, index } => {
                let value = self.resolve_operand(program, frame, tuple)?;
                Ok(Some(self.builder.build_extract_value(
                    value.into_struct_value(),
                    *index,
                    "",
                )?))
            }

            Instr::Field { x, field } => {
                let value = self.resolve_operand(program, frame, x)?;
                Ok(Some(self.builder.build_extract_value(
                    value.into_struct_value(),
                    *field,
                    "",
                )?))
            }

            Instr::FieldAddr { x, field } => {
                let value = self.resolve_operand(program, frame, x)?;
                let ptr = value.into_pointer_value();
                Ok(Some(self.builder.build_struct_gep(ptr, *field, "")?.into()))
            }

            Instr::Index { x, index } => self.lower_index(program, frame, x, index).map(Some),

            Instr::IndexAddr { x, index } => {
                self.lower_index_addr(program, frame, x, index).map(Some)
            }

            Instr::Lookup { x, index, comma_ok } => {
                self.lower_lookup(program, frame, vid, x, index, *comma_ok).map(Some)
            }

            Instr::MakeClosure { func: callee, bindings } => {
                self.lower_make_closure(program, frame, *callee, bindings).map(Some)
            }

            Instr::MakeInterface { x } => {
                self.lower_make_interface(program, frame, x).map(Some)
            }

            Instr::MakeMap => {
                let ty = func.value(vid).ty.clone().ok_or_else(|| {
                    CompileError::internal("untyped map construction")
                })?;
                let underlying = self.underlying(&ty)?;
                let TypeKind::Map { key, value } = underlying.kind() else {
                    return Err(CompileError::internal("map construction of non-map type"));
                };
                let key_ty = self.lower_type(&self.underlying(key)?)?;
                let value_ty = self.lower_type(&self.underlying(value)?)?;
                let i8t = self.context.i8_type();
                let key_size = i8t.const_int(self.size_of(key_ty), false);
                let value_size = i8t.const_int(self.size_of(value_ty), false);
                self.runtime_call(
                    "hashmapMake",
                    &[key_size.into(), value_size.into()],
                    "makemap",
                )
            }

            Instr::MakeSlice { len, cap } => {
                self.lower_make_slice(program, frame, vid, len, cap).map(Some)
            }

            Instr::Next { range, is_string } => {
                self.lower_next(program, frame, *range, *is_string).map(Some)
            }

            Instr::Phi { .. } => Err(CompileError::internal(
                "phi outside the leading phi cluster",
            )),

            Instr::Range { x } => self.lower_range(program, frame, vid, x).map(Some),

            Instr::Slice { x, low, high } => {
                self.lower_slice(program, frame, x, low, high).map(Some)
            }

            Instr::TypeAssert { x, asserted, comma_ok } => {
                self.lower_type_assert(program, frame, x, asserted, *comma_ok).map(Some)
            }

            other => Err(CompileError::UnsupportedInstruction(format!("{:?}", other))),
        }
    }

    /// `new`-like allocation: a zeroed stack cell, or a runtime allocation
    /// when the front end decided the value escapes.
    fn lower_alloc(
        &mut self,
        frame: &mut Frame<'ctx, '_>,
        vid: ValueId,
        ty: &Type,
        heap: bool,
        comment: &str,
    ) -> Result<BasicValueEnum<'ctx>> {
        let llvm_ty = self.lower_type(ty)?;
        if heap {
            let size = self.uintptr_type.const_int(self.size_of(llvm_ty), false);
            let raw = self.runtime_call_value("alloc", &[size.into()], comment)?;
            let ptr = self.builder.build_pointer_cast(
                raw.into_pointer_value(),
                llvm_ty.ptr_type(AddressSpace::default()),
                "",
            )?;
            return Ok(ptr.into());
        }

        // Stack cell. In blocking functions the cell must survive
        // suspension, so it lives in the task frame instead of an alloca.
        let ptr = if let Some(task) = &frame.task {
            *task.in_place.get(&vid).ok_or_else(|| {
                CompileError::internal("stack allocation without a task-frame slot")
            })?
        } else {
            self.builder.build_alloca(llvm_ty, comment)?
        };
        if self.size_of(llvm_ty) != 0 {
            let zero = self.zero_value(llvm_ty)?;
            self.builder.build_store(ptr, zero)?;
        }
        Ok(ptr.into())
    }

    fn lower_binop(
        &mut self,
        op: BinOp,
        ty: &Type,
        x: BasicValueEnum<'ctx>,
        y: BasicValueEnum<'ctx>,
    ) -> Result<BasicValueEnum<'ctx>> {
        match ty.kind() {
            _ if ty.is_integer() => {
                let signed = ty.is_signed();
                let xi = x.into_int_value();
                let yi = y.into_int_value();
                let b = &self.builder;
                Ok(match op {
                    BinOp::Add => b.build_int_add(xi, yi, "")?.into(),
                    BinOp::Sub => b.build_int_sub(xi, yi, "")?.into(),
                    BinOp::Mul => b.build_int_mul(xi, yi, "")?.into(),
                    BinOp::Div if signed => b.build_int_signed_div(xi, yi, "")?.into(),
                    BinOp::Div => b.build_int_unsigned_div(xi, yi, "")?.into(),
                    BinOp::Rem if signed => b.build_int_signed_rem(xi, yi, "")?.into(),
                    BinOp::Rem => b.build_int_unsigned_rem(xi, yi, "")?.into(),
                    BinOp::And => b.build_and(xi, yi, "")?.into(),
                    BinOp::Or => b.build_or(xi, yi, "")?.into(),
                    BinOp::Xor => b.build_xor(xi, yi, "")?.into(),
                    BinOp::AndNot => {
                        let inv = b.build_not(yi, "")?;
                        b.build_and(xi, inv, "")?.into()
                    }
                    BinOp::Shl | BinOp::Shr => {
                        // The shift amount must match the operand width
                        // before the shift, never after.
                        let shift = self.normalize_shift_amount(xi, yi)?;
                        match op {
                            BinOp::Shl => self.builder.build_left_shift(xi, shift, "")?.into(),
                            _ => self
                                .builder
                                .build_right_shift(xi, shift, signed, "")?
                                .into(),
                        }
                    }
                    BinOp::Eq => b.build_int_compare(IntPredicate::EQ, xi, yi, "")?.into(),
                    BinOp::Ne => b.build_int_compare(IntPredicate::NE, xi, yi, "")?.into(),
                    BinOp::Lt | BinOp::Le | BinOp::Gt | BinOp::Ge => {
                        let pred = int_predicate(op, signed);
                        b.build_int_compare(pred, xi, yi, "")?.into()
                    }
                })
            }

            _ if ty.is_float() => {
                let xf = x.into_float_value();
                let yf = y.into_float_value();
                let b = &self.builder;
                Ok(match op {
                    BinOp::Add => b.build_float_add(xf, yf, "")?.into(),
                    BinOp::Sub => b.build_float_sub(xf, yf, "")?.into(),
                    BinOp::Mul => b.build_float_mul(xf, yf, "")?.into(),
                    BinOp::Div => b.build_float_div(xf, yf, "")?.into(),
                    BinOp::Rem => b.build_float_rem(xf, yf, "")?.into(),
                    BinOp::Eq => b.build_float_compare(FloatPredicate::OEQ, xf, yf, "")?.into(),
                    BinOp::Ne => b.build_float_compare(FloatPredicate::ONE, xf, yf, "")?.into(),
                    BinOp::Lt => b.build_float_compare(FloatPredicate::OLT, xf, yf, "")?.into(),
                    BinOp::Le => b.build_float_compare(FloatPredicate::OLE, xf, yf, "")?.into(),
                    BinOp::Gt => b.build_float_compare(FloatPredicate::OGT, xf, yf, "")?.into(),
                    BinOp::Ge => b.build_float_compare(FloatPredicate::OGE, xf, yf, "")?.into(),
                    _ => {
                        return Err(CompileError::UnsupportedInstruction(format!(
                            "{:?} on floats",
                            op
                        )))
                    }
                })
            }

            TypeKind::Bool => {
                let xi = x.into_int_value();
                let yi = y.into_int_value();
                match op {
                    BinOp::Eq => Ok(self
                        .builder
                        .build_int_compare(IntPredicate::EQ, xi, yi, "")?
                        .into()),
                    BinOp::Ne => Ok(self
                        .builder
                        .build_int_compare(IntPredicate::NE, xi, yi, "")?
                        .into()),
                    _ => Err(CompileError::UnsupportedInstruction(format!(
                        "{:?} on booleans",
                        op
                    ))),
                }
            }

            TypeKind::String => {
                let b = match op {
                    BinOp::Add => {
                        return self.runtime_call_value(
                            "stringConcat",
                            &[x.into(), y.into()],
                            "",
                        )
                    }
                    BinOp::Eq => {
                        return self.runtime_call_value("stringEqual", &[x.into(), y.into()], "")
                    }
                    BinOp::Ne => {
                        let eq = self
                            .runtime_call_value("stringEqual", &[x.into(), y.into()], "")?
                            .into_int_value();
                        return Ok(self.builder.build_not(eq, "")?.into());
                    }
                    BinOp::Lt => self
                        .runtime_call_value("stringLess", &[x.into(), y.into()], "")?
                        .into_int_value(),
                    BinOp::Le => {
                        // x <= y  is  !(y < x)
                        let less = self
                            .runtime_call_value("stringLess", &[y.into(), x.into()], "")?
                            .into_int_value();
                        self.builder.build_not(less, "")?
                    }
                    BinOp::Gt => self
                        .runtime_call_value("stringLess", &[y.into(), x.into()], "")?
                        .into_int_value(),
                    BinOp::Ge => {
                        // x >= y  is  !(x < y)
                        let less = self
                            .runtime_call_value("stringLess", &[x.into(), y.into()], "")?
                            .into_int_value();
                        self.builder.build_not(less, "")?
                    }
                    _ => {
                        return Err(CompileError::UnsupportedInstruction(format!(
                            "{:?} on strings",
                            op
                        )))
                    }
                };
                Ok(b.into())
            }

            TypeKind::Signature(sig) => {
                // Function values only compare against nil, so the context
                // of a closure-shaped value can be ignored.
                let (mut xv, mut yv) = (x, y);
                if sig.needs_context {
                    xv = self.builder.build_extract_value(x.into_struct_value(), 1, "")?;
                    yv = self.builder.build_extract_value(y.into_struct_value(), 1, "")?;
                }
                self.pointer_identity(op, xv.into_pointer_value(), yv.into_pointer_value())
            }

            TypeKind::Interface => {
                let eq = self
                    .runtime_call_value("interfaceEqual", &[x.into(), y.into()], "")?
                    .into_int_value();
                match op {
                    BinOp::Eq => Ok(eq.into()),
                    BinOp::Ne => Ok(self.builder.build_not(eq, "")?.into()),
                    _ => Err(CompileError::UnsupportedInstruction(format!(
                        "{:?} on interfaces",
                        op
                    ))),
                }
            }

            TypeKind::Map { .. } | TypeKind::Pointer(_) | TypeKind::UnsafePointer
            | TypeKind::Chan(_) => {
                self.pointer_identity(op, x.into_pointer_value(), y.into_pointer_value())
            }

            TypeKind::Slice(_) => {
                // Slices only compare against nil: compare the backing
                // pointers.
                let xp = self
                    .builder
                    .build_extract_value(x.into_struct_value(), 0, "")?
                    .into_pointer_value();
                let yp = self
                    .builder
                    .build_extract_value(y.into_struct_value(), 0, "")?
                    .into_pointer_value();
                self.pointer_identity(op, xp, yp)
            }

            TypeKind::Struct(fields) => {
                // Field-wise comparison, blank fields skipped.
                let mut result = self.context.bool_type().const_int(1, false);
                for (i, field) in fields.iter().enumerate() {
                    if field.name == "_" {
                        continue;
                    }
                    let xf = self
                        .builder
                        .build_extract_value(x.into_struct_value(), i as u32, "")?;
                    let yf = self
                        .builder
                        .build_extract_value(y.into_struct_value(), i as u32, "")?;
                    let field_underlying = self.underlying(&field.ty)?;
                    let eq = self
                        .lower_binop(BinOp::Eq, &field_underlying, xf, yf)?
                        .into_int_value();
                    result = self.builder.build_and(result, eq, "")?;
                }
                match op {
                    BinOp::Eq => Ok(result.into()),
                    BinOp::Ne => Ok(self.builder.build_not(result, "")?.into()),
                    _ => Err(CompileError::UnsupportedInstruction(format!(
                        "{:?} on structs",
                        op
                    ))),
                }
            }

            _ => Err(CompileError::UnsupportedInstruction(format!(
                "{:?} on {}",
                op,
                ty.describe()
            ))),
        }
    }

    fn pointer_identity(
        &mut self,
        op: BinOp,
        x: PointerValue<'ctx>,
        y: PointerValue<'ctx>,
    ) -> Result<BasicValueEnum<'ctx>> {
        let pred = match op {
            BinOp::Eq => IntPredicate::EQ,
            BinOp::Ne => IntPredicate::NE,
            _ => {
                return Err(CompileError::UnsupportedInstruction(format!(
                    "{:?} on pointers",
                    op
                )))
            }
        };
        Ok(self.builder.build_int_compare(pred, x, y, "")?.into())
    }

    /// Make the shift amount's width match the shifted operand.
    fn normalize_shift_amount(
        &mut self,
        x: IntValue<'ctx>,
        y: IntValue<'ctx>,
    ) -> Result<IntValue<'ctx>> {
        let xw = x.get_type().get_bit_width();
        let yw = y.get_type().get_bit_width();
        if yw < xw {
            // Shift amounts are unsigned by construction.
            Ok(self.builder.build_int_z_extend(y, x.get_type(), "")?)
        } else if yw > xw {
            Ok(self.builder.build_int_truncate(y, x.get_type(), "")?)
        } else {
            Ok(y)
        }
    }

    fn lower_unop(
        &mut self,
        program: &Program,
        frame: &mut Frame<'ctx, '_>,
        op: UnOp,
        x: &Operand,
    ) -> Result<Option<BasicValueEnum<'ctx>>> {
        let ty = self.operand_type(program, frame.func, x)?;
        let value = self.resolve_operand(program, frame, x)?;
        match op {
            UnOp::Not => Ok(Some(self.builder.build_not(value.into_int_value(), "")?.into())),
            UnOp::Neg => {
                let underlying = self.underlying(&ty)?;
                if underlying.is_integer() {
                    Ok(Some(
                        self.builder.build_int_neg(value.into_int_value(), "")?.into(),
                    ))
                } else if underlying.is_float() {
                    Ok(Some(
                        self.builder.build_float_neg(value.into_float_value(), "")?.into(),
                    ))
                } else {
                    Err(CompileError::UnsupportedInstruction(format!(
                        "negate on {}",
                        ty.describe()
                    )))
                }
            }
            UnOp::BitNot => {
                let iv = value.into_int_value();
                let ones = iv.get_type().const_all_ones();
                Ok(Some(self.builder.build_xor(iv, ones, "")?.into()))
            }
            UnOp::Deref => {
                let underlying = self.underlying(&ty)?;
                let pointee = match underlying.kind() {
                    TypeKind::Pointer(elem) => elem.clone(),
                    _ => {
                        return Err(CompileError::UnsupportedInstruction(
                            "dereference of non-pointer".into(),
                        ))
                    }
                };
                let llvm_pointee = self.lower_type(&pointee)?;
                if self.size_of(llvm_pointee) == 0 {
                    return Ok(Some(self.zero_value(llvm_pointee)?));
                }
                let load = self.builder.build_load(value.into_pointer_value(), "")?;
                if self.is_volatile(&pointee) {
                    // Memory-mapped register read.
                    if let Some(inst) = load.as_instruction_value() {
                        inst.set_volatile(true).map_err(CompileError::internal)?;
                    }
                }
                Ok(Some(load))
            }
        }
    }

    fn lower_convert(
        &mut self,
        from: &Type,
        to: &Type,
        value: BasicValueEnum<'ctx>,
    ) -> Result<BasicValueEnum<'ctx>> {
        let from_u = self.underlying(from)?;
        let to_u = self.underlying(to)?;
        let target = self.lower_type(to)?;

        // unsafe-pointer / uintptr / pointer conversions first.
        let from_ptr = from_u.is_pointer_shaped();
        let to_ptr = to_u.is_pointer_shaped();
        if from_ptr && !to_ptr {
            return Ok(self
                .builder
                .build_ptr_to_int(value.into_pointer_value(), target.into_int_type(), "")?
                .into());
        }
        if !from_ptr && to_ptr {
            return Ok(self
                .builder
                .build_int_to_ptr(value.into_int_value(), target.into_pointer_type(), "")?
                .into());
        }
        if from_ptr && to_ptr {
            return Ok(self
                .builder
                .build_pointer_cast(value.into_pointer_value(), target.into_pointer_type(), "")?
                .into());
        }

        if matches!(to_u.kind(), TypeKind::String) {
            if from_u.is_integer() {
                // A Unicode code point; widen to the i32 the runtime takes.
                let mut v = value.into_int_value();
                let w = v.get_type().get_bit_width();
                if w > 32 {
                    v = self.builder.build_int_truncate(v, self.context.i32_type(), "")?;
                } else if w < 32 {
                    v = self.builder.build_int_s_extend(v, self.context.i32_type(), "")?;
                }
                return self.runtime_call_value("stringFromUnicode", &[v.into()], "");
            }
            if let TypeKind::Slice(elem) = from_u.kind() {
                if matches!(self.underlying(elem)?.kind(), TypeKind::Uint8) {
                    return self.runtime_call_value("stringFromBytes", &[value.into()], "");
                }
            }
            return Err(CompileError::UnsupportedInstruction(format!(
                "conversion to string from {}",
                from.describe()
            )));
        }

        if let TypeKind::Slice(elem) = to_u.kind() {
            if matches!(from_u.kind(), TypeKind::String)
                && matches!(self.underlying(elem)?.kind(), TypeKind::Uint8)
            {
                return self.runtime_call_value("stringToBytes", &[value.into()], "");
            }
            return Err(CompileError::UnsupportedInstruction(format!(
                "conversion {} <- {}",
                to.describe(),
                from.describe()
            )));
        }

        if from_u.is_integer() && to_u.is_integer() {
            return self.int_cast(value.into_int_value(), target.into_int_type(), to_u.is_signed());
        }

        if from_u.is_float() && to_u.is_float() {
            let v = value.into_float_value();
            let target_f = target.into_float_type();
            let from_bits = self.size_of(v.get_type().into()) * 8;
            let to_bits = self.size_of(target_f.into()) * 8;
            return Ok(if from_bits > to_bits {
                self.builder.build_float_trunc(v, target_f, "")?.into()
            } else if from_bits < to_bits {
                self.builder.build_float_ext(v, target_f, "")?.into()
            } else {
                value
            });
        }

        if from_u.is_float() && to_u.is_integer() {
            let v = value.into_float_value();
            let t = target.into_int_type();
            return Ok(if to_u.is_signed() {
                self.builder.build_float_to_signed_int(v, t, "")?.into()
            } else {
                self.builder.build_float_to_unsigned_int(v, t, "")?.into()
            });
        }

        if from_u.is_integer() && to_u.is_float() {
            let v = value.into_int_value();
            let t = target.into_float_type();
            return Ok(if from_u.is_signed() {
                self.builder.build_signed_int_to_float(v, t, "")?.into()
            } else {
                self.builder.build_unsigned_int_to_float(v, t, "")?.into()
            });
        }

        match (from_u.kind(), to_u.kind()) {
            (TypeKind::Complex128, TypeKind::Complex64) => {
                self.complex_convert(value.into_vector_value(), self.context.f32_type().into())
            }
            (TypeKind::Complex64, TypeKind::Complex128) => {
                self.complex_convert(value.into_vector_value(), self.context.f64_type().into())
            }
            _ => Err(CompileError::UnsupportedInstruction(format!(
                "conversion {} <- {}",
                to.describe(),
                from.describe()
            ))),
        }
    }

    /// Integer-to-integer conversion: truncate, or extend according to the
    /// signedness of the target.
    pub(crate) fn int_cast(
        &mut self,
        value: IntValue<'ctx>,
        target: inkwell::types::IntType<'ctx>,
        target_signed: bool,
    ) -> Result<BasicValueEnum<'ctx>> {
        let from_w = value.get_type().get_bit_width();
        let to_w = target.get_bit_width();
        Ok(if from_w > to_w {
            self.builder.build_int_truncate(value, target, "")?.into()
        } else if from_w < to_w {
            if target_signed {
                self.builder.build_int_s_extend(value, target, "")?.into()
            } else {
                self.builder.build_int_z_extend(value, target, "")?.into()
            }
        } else {
            value.into()
        })
    }

    fn complex_convert(
        &mut self,
        value: VectorValue<'ctx>,
        target_elem: BasicTypeEnum<'ctx>,
    ) -> Result<BasicValueEnum<'ctx>> {
        let i32t = self.context.i32_type();
        let re = self
            .builder
            .build_extract_element(value, i32t.const_int(0, false), "real")?
            .into_float_value();
        let im = self
            .builder
            .build_extract_element(value, i32t.const_int(1, false), "imag")?
            .into_float_value();
        let target_f = target_elem.into_float_type();
        let (re2, im2) = if self.size_of(target_elem) > self.size_of(re.get_type().into()) {
            (
                self.builder.build_float_ext(re, target_f, "")?,
                self.builder.build_float_ext(im, target_f, "")?,
            )
        } else {
            (
                self.builder.build_float_trunc(re, target_f, "")?,
                self.builder.build_float_trunc(im, target_f, "")?,
            )
        };
        let undef = target_f.vec_type(2).get_undef();
        let v = self
            .builder
            .build_insert_element(undef, re2, i32t.const_int(0, false), "")?;
        let v = self
            .builder
            .build_insert_element(v, im2, i32t.const_int(1, false), "")?;
        Ok(v.into())
    }

    /// Array element read by value: spill to a stack cell so a dynamic
    /// index can address it.
    fn lower_index(
        &mut self,
        program: &Program,
        frame: &mut Frame<'ctx, '_>,
        x: &Operand,
        index: &Operand,
    ) -> Result<BasicValueEnum<'ctx>> {
        let array = self.resolve_operand(program, frame, x)?;
        let idx = self.resolve_operand(program, frame, index)?.into_int_value();
        let array_ty = self.underlying(&self.operand_type(program, frame.func, x)?)?;
        let TypeKind::Array { len, .. } = array_ty.kind() else {
            return Err(CompileError::internal("index into non-array value"));
        };
        let len_const = self.len_type.const_int(*len, false);
        let index_ty = self.operand_type(program, frame.func, index)?;
        self.emit_bounds_check(frame, len_const, idx, &index_ty)?;

        let alloca = self.builder.build_alloca(array.get_type(), "")?;
        self.builder.build_store(alloca, array)?;
        let zero = self.context.i32_type().const_int(0, false);
        let ptr = unsafe { self.builder.build_gep(alloca, &[zero, idx], "")? };
        Ok(self.builder.build_load(ptr, "")?)
    }

    fn lower_index_addr(
        &mut self,
        program: &Program,
        frame: &mut Frame<'ctx, '_>,
        x: &Operand,
        index: &Operand,
    ) -> Result<BasicValueEnum<'ctx>> {
        let value = self.resolve_operand(program, frame, x)?;
        let idx = self.resolve_operand(program, frame, index)?.into_int_value();
        let x_ty = self.underlying(&self.operand_type(program, frame.func, x)?)?;
        let index_ty = self.operand_type(program, frame.func, index)?;

        match x_ty.kind() {
            TypeKind::Pointer(elem) => {
                let elem_u = self.underlying(elem)?;
                let TypeKind::Array { len, .. } = elem_u.kind() else {
                    return Err(CompileError::UnsupportedInstruction(format!(
                        "element address through {}",
                        x_ty.describe()
                    )));
                };
                let len_const = self.len_type.const_int(*len, false);
                self.emit_bounds_check(frame, len_const, idx, &index_ty)?;
                let zero = self.context.i32_type().const_int(0, false);
                let ptr = unsafe {
                    self.builder.build_gep(value.into_pointer_value(), &[zero, idx], "")?
                };
                Ok(ptr.into())
            }
            TypeKind::Slice(_) => {
                let sv = value.into_struct_value();
                let buf = self
                    .builder
                    .build_extract_value(sv, 0, "indexaddr.ptr")?
                    .into_pointer_value();
                let len = self
                    .builder
                    .build_extract_value(sv, 1, "indexaddr.len")?
                    .into_int_value();
                self.emit_bounds_check(frame, len, idx, &index_ty)?;
                let ptr = unsafe { self.builder.build_gep(buf, &[idx], "")? };
                Ok(ptr.into())
            }
            _ => Err(CompileError::UnsupportedInstruction(format!(
                "element address through {}",
                x_ty.describe()
            ))),
        }
    }

    /// String byte read or map element read.
    fn lower_lookup(
        &mut self,
        program: &Program,
        frame: &mut Frame<'ctx, '_>,
        vid: ValueId,
        x: &Operand,
        index: &Operand,
        comma_ok: bool,
    ) -> Result<BasicValueEnum<'ctx>> {
        let x_ty = self.underlying(&self.operand_type(program, frame.func, x)?)?;
        let value = self.resolve_operand(program, frame, x)?;
        let key = self.resolve_operand(program, frame, index)?;

        match x_ty.kind() {
            TypeKind::String => {
                let sv = value.into_struct_value();
                let len = self.builder.build_extract_value(sv, 1, "len")?.into_int_value();
                let idx = key.into_int_value();
                let index_ty = self.operand_type(program, frame.func, index)?;
                self.emit_bounds_check(frame, len, idx, &index_ty)?;
                let buf = self.builder.build_extract_value(sv, 0, "")?.into_pointer_value();
                let ptr = unsafe { self.builder.build_gep(buf, &[idx], "")? };
                Ok(self.builder.build_load(ptr, "")?)
            }
            TypeKind::Map { key: key_ty, value: _ } => {
                let result_ty = frame.func.value(vid).ty.clone().ok_or_else(|| {
                    CompileError::internal("untyped map lookup")
                })?;
                let value_ty = if comma_ok {
                    match result_ty.kind() {
                        TypeKind::Tuple(elems) => elems[0].clone(),
                        _ => {
                            return Err(CompileError::internal(
                                "comma-ok lookup without tuple type",
                            ))
                        }
                    }
                } else {
                    result_ty
                };
                let llvm_value_ty = self.lower_type(&value_ty)?;
                let out = self.builder.build_alloca(llvm_value_ty, "lookup.value")?;
                let out_raw =
                    self.builder.build_pointer_cast(out, self.i8_ptr_type, "lookup.valueptr")?;

                let key_u = self.underlying(key_ty)?;
                let ok = if matches!(key_u.kind(), TypeKind::String) {
                    self.runtime_call_value(
                        "hashmapStringGet",
                        &[value.into(), key.into(), out_raw.into()],
                        "lookup.ok",
                    )?
                } else {
                    let key_slot = self.builder.build_alloca(key.get_type(), "lookup.key")?;
                    self.builder.build_store(key_slot, key)?;
                    let key_raw = self.builder.build_pointer_cast(
                        key_slot,
                        self.i8_ptr_type,
                        "lookup.keyptr",
                    )?;
                    self.runtime_call_value(
                        "hashmapBinaryGet",
                        &[value.into(), key_raw.into(), out_raw.into()],
                        "lookup.ok",
                    )?
                };

                let loaded = self.builder.build_load(out, "")?;
                if !comma_ok {
                    return Ok(loaded);
                }
                let tuple_ty = self
                    .context
                    .struct_type(&[llvm_value_ty, self.context.bool_type().into()], false);
                let tuple = tuple_ty.get_undef();
                let tuple = self.builder.build_insert_value(tuple, loaded, 0, "")?;
                let tuple = self.builder.build_insert_value(tuple, ok, 1, "")?;
                Ok(tuple.as_basic_value_enum())
            }
            _ => Err(CompileError::UnsupportedInstruction(format!(
                "lookup on {}",
                x_ty.describe()
            ))),
        }
    }

    fn lower_make_slice(
        &mut self,
        program: &Program,
        frame: &mut Frame<'ctx, '_>,
        vid: ValueId,
        len: &Operand,
        cap: &Operand,
    ) -> Result<BasicValueEnum<'ctx>> {
        let slice_ty = frame.func.value(vid).ty.clone().ok_or_else(|| {
            CompileError::internal("untyped slice construction")
        })?;
        let underlying = self.underlying(&slice_ty)?;
        let TypeKind::Slice(elem) = underlying.kind() else {
            return Err(CompileError::internal("slice construction of non-slice type"));
        };
        let llvm_elem = self.lower_type(elem)?;
        let elem_size = self.size_of(llvm_elem);

        let mut len_v = self.resolve_operand(program, frame, len)?.into_int_value();
        let mut cap_v = self.resolve_operand(program, frame, cap)?.into_int_value();

        if !frame.func.no_bounds {
            let len_chk = self.int_cast(len_v, self.int_type, true)?.into_int_value();
            let cap_chk = self.int_cast(cap_v, self.int_type, true)?.into_int_value();
            self.runtime_call(
                "sliceBoundsCheckMake",
                &[len_chk.into(), cap_chk.into()],
                "",
            )?;
        }

        // Allocate the backing array.
        let elem_size_v = self.uintptr_type.const_int(elem_size, false);
        let cap_uintptr = self.int_cast(cap_v, self.uintptr_type, false)?.into_int_value();
        let size = self.builder.build_int_mul(elem_size_v, cap_uintptr, "makeslice.cap")?;
        let raw = self.runtime_call_value("alloc", &[size.into()], "makeslice.buf")?;
        let buf = self.builder.build_pointer_cast(
            raw.into_pointer_value(),
            llvm_elem.ptr_type(AddressSpace::default()),
            "makeslice.array",
        )?;

        if len_v.get_type().get_bit_width() > self.len_type.get_bit_width() {
            len_v = self.builder.build_int_truncate(len_v, self.len_type, "")?;
            cap_v = self.builder.build_int_truncate(cap_v, self.len_type, "")?;
        }

        let slice_llvm_ty = self.lower_type(&slice_ty)?.into_struct_type();
        let slice = slice_llvm_ty.get_undef();
        let slice = self.builder.build_insert_value(slice, buf, 0, "")?;
        let slice = self.builder.build_insert_value(slice, len_v, 1, "")?;
        let slice = self.builder.build_insert_value(slice, cap_v, 2, "")?;
        Ok(slice.as_basic_value_enum())
    }

    /// Allocate and zero the iterator state for a range loop.
    fn lower_range(
        &mut self,
        program: &Program,
        frame: &mut Frame<'ctx, '_>,
        vid: ValueId,
        x: &Operand,
    ) -> Result<BasicValueEnum<'ctx>> {
        let x_ty = self.underlying(&self.operand_type(program, frame.func, x)?)?;
        let iter_name = match x_ty.kind() {
            TypeKind::String => shapes::STRING_ITERATOR,
            TypeKind::Map { .. } => shapes::HASHMAP_ITERATOR,
            _ => {
                return Err(CompileError::UnsupportedInstruction(format!(
                    "range over {}",
                    x_ty.describe()
                )))
            }
        };
        let iter_ty = self.named_struct(iter_name)?;

        // Iterator state must survive suspension in blocking functions.
        let it = if let Some(task) = &frame.task {
            *task.in_place.get(&vid).ok_or_else(|| {
                CompileError::internal("range iterator without a task-frame slot")
            })?
        } else {
            self.builder.build_alloca(iter_ty, "range.it")?
        };
        let zero = self.zero_value(iter_ty.into())?;
        self.builder.build_store(it, zero)?;
        Ok(it.into())
    }

    /// Advance a range iterator; yields `(ok, key, value)`.
    fn lower_next(
        &mut self,
        program: &Program,
        frame: &mut Frame<'ctx, '_>,
        range_vid: ValueId,
        is_string: bool,
    ) -> Result<BasicValueEnum<'ctx>> {
        let range_instr = frame.func.instr(range_vid).ok_or_else(|| {
            CompileError::internal("iterator advance without a range instruction")
        })?;
        let Instr::Range { x } = range_instr else {
            return Err(CompileError::internal(
                "iterator advance references a non-range value",
            ));
        };
        let x = x.clone();
        let ranged = self.resolve_operand(program, frame, &x)?;
        let it = self.read_value(frame, range_vid)?.into_pointer_value();

        if is_string {
            return self.runtime_call_value(
                "stringNext",
                &[ranged.into(), it.into()],
                "range.next",
            );
        }

        let x_ty = self.underlying(&self.operand_type(program, frame.func, &x)?)?;
        let TypeKind::Map { key, value } = x_ty.kind() else {
            return Err(CompileError::internal("map iteration over non-map"));
        };
        let llvm_key = self.lower_type(key)?;
        let llvm_value = self.lower_type(value)?;

        let key_slot = self.builder.build_alloca(llvm_key, "range.key")?;
        let key_raw = self.builder.build_pointer_cast(key_slot, self.i8_ptr_type, "range.keyptr")?;
        let value_slot = self.builder.build_alloca(llvm_value, "range.value")?;
        let value_raw =
            self.builder.build_pointer_cast(value_slot, self.i8_ptr_type, "range.valueptr")?;
        let ok = self.runtime_call_value(
            "hashmapNext",
            &[ranged.into(), it.into(), key_raw.into(), value_raw.into()],
            "range.next",
        )?;

        let tuple_ty = self.context.struct_type(
            &[self.context.bool_type().into(), llvm_key, llvm_value],
            false,
        );
        let tuple = tuple_ty.get_undef();
        let tuple = self.builder.build_insert_value(tuple, ok, 0, "")?;
        let k = self.builder.build_load(key_slot, "")?;
        let tuple = self.builder.build_insert_value(tuple, k, 1, "")?;
        let v = self.builder.build_load(value_slot, "")?;
        let tuple = self.builder.build_insert_value(tuple, v, 2, "")?;
        Ok(tuple.as_basic_value_enum())
    }

    fn lower_slice(
        &mut self,
        program: &Program,
        frame: &mut Frame<'ctx, '_>,
        x: &Operand,
        low: &Option<Operand>,
        high: &Option<Operand>,
    ) -> Result<BasicValueEnum<'ctx>> {
        let value = self.resolve_operand(program, frame, x)?;
        let x_ty = self.underlying(&self.operand_type(program, frame.func, x)?)?;

        let mut low_v = match low {
            Some(op) => self.resolve_operand(program, frame, op)?.into_int_value(),
            None => self.int_type.const_int(0, false),
        };
        let mut high_v = match high {
            Some(op) => Some(self.resolve_operand(program, frame, op)?.into_int_value()),
            None => None,
        };

        match x_ty.kind() {
            TypeKind::Pointer(elem) => {
                // Slicing an array through its pointer.
                let elem_u = self.underlying(elem)?;
                let TypeKind::Array { len, .. } = elem_u.kind() else {
                    return Err(CompileError::UnsupportedInstruction(format!(
                        "slice of {}",
                        x_ty.describe()
                    )));
                };
                let len_len = self.len_type.const_int(*len, false);
                let len_int = self.int_type.const_int(*len, false);
                let high_v = high_v.unwrap_or(len_int);
                self.emit_slice_bounds_check(frame, len_len, low_v, high_v)?;

                let zero = self.context.i32_type().const_int(0, false);
                let ptr = unsafe {
                    self.builder
                        .build_gep(value.into_pointer_value(), &[zero, low_v], "slice.ptr")?
                };
                let mut new_len = self.builder.build_int_sub(high_v, low_v, "slice.len")?;
                let mut new_cap = self.builder.build_int_sub(len_int, low_v, "slice.cap")?;
                if new_len.get_type().get_bit_width() > self.len_type.get_bit_width() {
                    new_len = self.builder.build_int_truncate(new_len, self.len_type, "")?;
                    new_cap = self.builder.build_int_truncate(new_cap, self.len_type, "")?;
                }
                self.pack_slice(ptr, new_len, new_cap)
            }

            TypeKind::Slice(_) => {
                let sv = value.into_struct_value();
                let old_ptr =
                    self.builder.build_extract_value(sv, 0, "")?.into_pointer_value();
                let old_len = self.builder.build_extract_value(sv, 1, "")?.into_int_value();
                let old_cap = self.builder.build_extract_value(sv, 2, "")?.into_int_value();
                let high_v = high_v.take().unwrap_or(old_len);
                self.emit_slice_bounds_check(frame, old_cap, low_v, high_v)?;

                let mut high_v = high_v;
                if low_v.get_type().get_bit_width() > self.len_type.get_bit_width() {
                    low_v = self.builder.build_int_truncate(low_v, self.len_type, "")?;
                }
                if high_v.get_type().get_bit_width() > self.len_type.get_bit_width() {
                    high_v = self.builder.build_int_truncate(high_v, self.len_type, "")?;
                }
                let low_ext = self.int_cast(low_v, self.len_type, true)?.into_int_value();
                let high_ext = self.int_cast(high_v, self.len_type, true)?.into_int_value();

                let new_ptr = unsafe { self.builder.build_gep(old_ptr, &[low_ext], "")? };
                let new_len = self.builder.build_int_sub(high_ext, low_ext, "")?;
                let new_cap = self.builder.build_int_sub(old_cap, low_ext, "")?;
                self.pack_slice(new_ptr, new_len, new_cap)
            }

            TypeKind::String => {
                let sv = value.into_struct_value();
                let old_ptr =
                    self.builder.build_extract_value(sv, 0, "")?.into_pointer_value();
                let old_len = self.builder.build_extract_value(sv, 1, "")?.into_int_value();
                let high_v = high_v.take().unwrap_or(old_len);
                self.emit_slice_bounds_check(frame, old_len, low_v, high_v)?;

                let low_ext = self.int_cast(low_v, self.len_type, true)?.into_int_value();
                let high_ext = self.int_cast(high_v, self.len_type, true)?.into_int_value();
                let new_ptr = unsafe { self.builder.build_gep(old_ptr, &[low_ext], "")? };
                let new_len = self.builder.build_int_sub(high_ext, low_ext, "")?;

                let str_ty = self.named_struct(shapes::STRING)?;
                let zero = self.zero_value(str_ty.into())?;
                let s = self
                    .builder
                    .build_insert_value(zero.into_struct_value(), new_ptr, 0, "")?;
                let s = self.builder.build_insert_value(s, new_len, 1, "")?;
                Ok(s.as_basic_value_enum())
            }

            _ => Err(CompileError::UnsupportedInstruction(format!(
                "slice of {}",
                x_ty.describe()
            ))),
        }
    }

    fn pack_slice(
        &mut self,
        ptr: PointerValue<'ctx>,
        len: IntValue<'ctx>,
        cap: IntValue<'ctx>,
    ) -> Result<BasicValueEnum<'ctx>> {
        let ty = self.context.struct_type(
            &[ptr.get_type().into(), self.len_type.into(), self.len_type.into()],
            false,
        );
        let slice = ty.get_undef();
        let slice = self.builder.build_insert_value(slice, ptr, 0, "")?;
        let slice = self.builder.build_insert_value(slice, len, 1, "")?;
        let slice = self.builder.build_insert_value(slice, cap, 2, "")?;
        Ok(slice.as_basic_value_enum())
    }

    /// Bounds check an index against a length; elided for constant
    /// in-bounds accesses and for functions marked no-bounds.
    pub(crate) fn emit_bounds_check(
        &mut self,
        frame: &Frame<'ctx, '_>,
        length: IntValue<'ctx>,
        mut index: IntValue<'ctx>,
        index_ty: &Type,
    ) -> Result<()> {
        if frame.func.no_bounds {
            return Ok(());
        }

        // Narrow indices extend to the platform int before the check.
        let int_w = self.int_type.get_bit_width();
        if index.get_type().get_bit_width() < int_w {
            index = if index_ty.is_signed() {
                self.builder.build_int_s_extend(index, self.int_type, "")?
            } else {
                self.builder.build_int_z_extend(index, self.int_type, "")?
            };
        }

        // Constant in-bounds accesses need no call.
        if index.is_const() && length.is_const() {
            if let (Some(i), Some(l)) =
                (index.get_sign_extended_constant(), length.get_sign_extended_constant())
            {
                if i >= 0 && i < l {
                    return Ok(());
                }
            }
        }

        if index.get_type().get_bit_width() > int_w {
            // Wide index: dispatch to the 64-bit variant.
            let wide = self.int_cast(index, self.context.i64_type(), true)?;
            self.runtime_call(
                "lookupBoundsCheckLong",
                &[length.into(), wide.into()],
                "",
            )?;
        } else {
            self.runtime_call("lookupBoundsCheck", &[length.into(), index.into()], "")?;
        }
        Ok(())
    }

    pub(crate) fn emit_slice_bounds_check(
        &mut self,
        frame: &Frame<'ctx, '_>,
        capacity: IntValue<'ctx>,
        low: IntValue<'ctx>,
        high: IntValue<'ctx>,
    ) -> Result<()> {
        if frame.func.no_bounds {
            return Ok(());
        }
        let low_w = low.get_type().get_bit_width();
        let high_w = high.get_type().get_bit_width();
        if low_w > 32 || high_w > 32 {
            let i64t = self.context.i64_type();
            let low64 = self.int_cast(low, i64t, true)?;
            let high64 = self.int_cast(high, i64t, true)?;
            self.runtime_call(
                "sliceBoundsCheckLong",
                &[capacity.into(), low64.into(), high64.into()],
                "",
            )?;
        } else {
            let low_n = self.int_cast(low, self.int_type, true)?;
            let high_n = self.int_cast(high, self.int_type, true)?;
            self.runtime_call(
                "sliceBoundsCheck",
                &[capacity.into(), low_n.into(), high_n.into()],
                "",
            )?;
        }
        Ok(())
    }

    /// Pack bound variables into a context and produce the closure value
    /// `{context, function pointer}`. Contexts that fit in a pointer are
    /// stored inline in the context slot; larger ones go to the heap.
    fn lower_make_closure(
        &mut self,
        program: &Program,
        frame: &mut Frame<'ctx, '_>,
        callee: crate::ssa::FuncId,
        bindings: &[Operand],
    ) -> Result<BasicValueEnum<'ctx>> {
        if bindings.is_empty() {
            return Err(CompileError::internal("closure with no bound variables"));
        }
        let target = program.func(callee);
        if !target.sig.needs_context {
            return Err(CompileError::internal(format!(
                "closure over {} whose signature takes no context",
                target.link_name
            )));
        }

        let mut bound = Vec::with_capacity(bindings.len());
        let mut bound_tys = Vec::with_capacity(bindings.len());
        for b in bindings {
            let v = self.resolve_operand(program, frame, b)?;
            bound_tys.push(v.get_type());
            bound.push(v);
        }
        let context_ty = self.context.struct_type(&bound_tys, false);
        let context_size = self.size_of(context_ty.into());
        let inline = context_size <= self.pointer_size() as u64;

        let (typed_ptr, heap_raw) = if inline {
            (self.builder.build_alloca(context_ty, "closure.context")?, None)
        } else {
            let size = self.uintptr_type.const_int(context_size, false);
            let raw = self
                .runtime_call_value("alloc", &[size.into()], "")?
                .into_pointer_value();
            let typed = self.builder.build_pointer_cast(
                raw,
                context_ty.ptr_type(AddressSpace::default()),
                "",
            )?;
            (typed, Some(raw))
        };

        for (i, v) in bound.iter().enumerate() {
            let gep = self.builder.build_struct_gep(typed_ptr, i as u32, "")?;
            self.builder.build_store(gep, *v)?;
        }

        let context = match heap_raw {
            Some(raw) => raw,
            None => {
                // Read the struct bytes back as the pointer itself. The
                // layout stored here must match the reload in the callee
                // prologue.
                let as_slot = self.builder.build_pointer_cast(
                    typed_ptr,
                    self.i8_ptr_type.ptr_type(AddressSpace::default()),
                    "",
                )?;
                self.builder.build_load(as_slot, "")?.into_pointer_value()
            }
        };

        let closure_ty = self.lower_type(&Type::signature(target.sig.clone()))?;
        let zero = self.zero_value(closure_ty)?;
        let llvm_fn = self.llvm_function(program, callee)?;
        let fn_ptr = llvm_fn.as_global_value().as_pointer_value();
        let closure = self
            .builder
            .build_insert_value(zero.into_struct_value(), fn_ptr, 1, "")?;
        let closure = self.builder.build_insert_value(closure, context, 0, "")?;
        Ok(closure.as_basic_value_enum())
    }

    /// Box a concrete value into an interface: `{typecode, value pointer}`.
    /// The typecode comes from the `makeInterface` pseudo-call that the
    /// interface-lowering pass resolves.
    fn lower_make_interface(
        &mut self,
        program: &Program,
        frame: &mut Frame<'ctx, '_>,
        x: &Operand,
    ) -> Result<BasicValueEnum<'ctx>> {
        let ty = self.operand_type(program, frame.func, x)?;
        let value = self.resolve_operand(program, frame, x)?;

        let i16t = self.context.i16_type();
        let typecode_g = self.marker_global("typecode", &ty.describe(), i16t.into());
        let methodset_g =
            self.marker_global("methodset", &ty.describe(), self.context.i8_type().into());
        let code = self.runtime_call_value(
            "makeInterface",
            &[
                typecode_g.as_pointer_value().into(),
                methodset_g.as_pointer_value().into(),
            ],
            "makeinterface",
        )?;

        let boxed = self.box_value(value)?;
        let itf_ty = self.named_struct(shapes::INTERFACE)?;
        let itf = itf_ty.get_undef();
        let itf = self.builder.build_insert_value(itf, code, 0, "")?;
        let itf = self.builder.build_insert_value(itf, boxed, 1, "")?;
        Ok(itf.as_basic_value_enum())
    }

    fn lower_type_assert(
        &mut self,
        program: &Program,
        frame: &mut Frame<'ctx, '_>,
        x: &Operand,
        asserted: &Type,
        comma_ok: bool,
    ) -> Result<BasicValueEnum<'ctx>> {
        let itf = self.resolve_operand(program, frame, x)?.into_struct_value();
        let actual = self.builder.build_extract_value(itf, 0, "typeassert.actual")?;

        let asserted_u = self.underlying(asserted)?;
        let (ok, value): (IntValue<'ctx>, BasicValueEnum<'ctx>) =
            if matches!(asserted_u.kind(), TypeKind::Interface) {
                let methods_g = self.marker_global(
                    "itfmethods",
                    &asserted.describe(),
                    self.i8_ptr_type.into(),
                );
                let ok = self
                    .runtime_call_value(
                        "interfaceImplements",
                        &[actual.into(), methods_g.as_pointer_value().into()],
                        "typeassert.ok",
                    )?
                    .into_int_value();
                (ok, itf.into())
            } else {
                let i16t = self.context.i16_type();
                let typecode_g =
                    self.marker_global("typecode", &asserted.describe(), i16t.into());
                let ok = self
                    .runtime_call_value(
                        "typeAssert",
                        &[actual.into(), typecode_g.as_pointer_value().into()],
                        "typeassert.ok",
                    )?
                    .into_int_value();
                if !comma_ok {
                    // A failed bare assert traps in the runtime before the
                    // value is unboxed.
                    self.runtime_call("interfaceTypeAssert", &[ok.into()], "")?;
                }
                let stored =
                    self.builder.build_extract_value(itf, 1, "")?.into_pointer_value();
                let target = self.lower_type(asserted)?;
                (ok, self.unbox_value(stored, target)?)
            };

        if comma_ok {
            let tuple_ty = self
                .context
                .struct_type(&[value.get_type(), self.context.bool_type().into()], false);
            let tuple = tuple_ty.get_undef();
            let tuple = self.builder.build_insert_value(tuple, value, 0, "")?;
            let tuple = self.builder.build_insert_value(tuple, ok, 1, "")?;
            Ok(tuple.as_basic_value_enum())
        } else if matches!(asserted_u.kind(), TypeKind::Interface) {
            self.runtime_call("interfaceTypeAssert", &[ok.into()], "")?;
            Ok(value)
        } else {
            Ok(value)
        }
    }

    /// Store a value into an interface's byte-pointer slot: pointer-sized
    /// values travel inline in the pointer, larger ones on the heap.
    pub(crate) fn box_value(
        &mut self,
        value: BasicValueEnum<'ctx>,
    ) -> Result<PointerValue<'ctx>> {
        let size = self.size_of(value.get_type());
        if size <= self.pointer_size() as u64 {
            let slot = self.builder.build_alloca(self.i8_ptr_type, "box.slot")?;
            self.builder.build_store(slot, self.i8_ptr_type.const_null())?;
            let typed = self.builder.build_pointer_cast(
                slot,
                value.get_type().ptr_type(AddressSpace::default()),
                "",
            )?;
            self.builder.build_store(typed, value)?;
            Ok(self.builder.build_load(slot, "box.value")?.into_pointer_value())
        } else {
            let raw = self
                .runtime_call_value(
                    "alloc",
                    &[self.uintptr_type.const_int(size, false).into()],
                    "box.heap",
                )?
                .into_pointer_value();
            let typed = self.builder.build_pointer_cast(
                raw,
                value.get_type().ptr_type(AddressSpace::default()),
                "",
            )?;
            self.builder.build_store(typed, value)?;
            Ok(raw)
        }
    }

    /// Reverse of [`Session::box_value`].
    pub(crate) fn unbox_value(
        &mut self,
        stored: PointerValue<'ctx>,
        target: BasicTypeEnum<'ctx>,
    ) -> Result<BasicValueEnum<'ctx>> {
        let size = self.size_of(target);
        if size <= self.pointer_size() as u64 {
            let slot = self.builder.build_alloca(self.i8_ptr_type, "unbox.slot")?;
            self.builder.build_store(slot, stored)?;
            let typed = self.builder.build_pointer_cast(
                slot,
                target.ptr_type(AddressSpace::default()),
                "",
            )?;
            self.builder.build_load(typed, "unbox.value")
                .map_err(CompileError::from)
        } else {
            let typed = self.builder.build_pointer_cast(
                stored,
                target.ptr_type(AddressSpace::default()),
                "",
            )?;
            self.builder.build_load(typed, "unbox.value").map_err(CompileError::from)
        }
    }
}

fn int_predicate(op: BinOp, signed: bool) -> IntPredicate {
    match (op, signed) {
        (BinOp::Lt, true) => IntPredicate::SLT,
        (BinOp::Lt, false) => IntPredicate::ULT,
        (BinOp::Le, true) => IntPredicate::SLE,
        (BinOp::Le, false) => IntPredicate::ULE,
        (BinOp::Gt, true) => IntPredicate::SGT,
        (BinOp::Gt, false) => IntPredicate::UGT,
        (BinOp::Ge, true) => IntPredicate::SGE,
        _ => IntPredicate::UGE,
    }
}
