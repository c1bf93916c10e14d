//! Type lowering: Fern types to LLVM types.
//!
//! Lowering is a pure function of the type and the session's target data.
//! Named struct types resolve through the named-aggregate cache so repeated
//! lowering is referentially stable; everything else lowers structurally.

use inkwell::types::{BasicMetadataTypeEnum, BasicType, BasicTypeEnum, FunctionType};
use inkwell::values::{ArrayValue, BasicValue, BasicValueEnum};
use inkwell::AddressSpace;

use crate::diagnostics::{CompileError, Result};
use crate::ssa::{Signature, Type, TypeKind};

use super::runtime::shapes;
use super::session::Session;

/// Aggregates whose flattened field count stays at or below this expand
/// into scalar call arguments; larger ones are passed whole. The call-site
/// packing and the prologue unpacking share this decision.
pub(crate) const MAX_PARAM_FRAGMENTS: usize = 3;

impl<'ctx> Session<'ctx> {
    /// Lower a Fern type to the corresponding LLVM type.
    pub(crate) fn lower_type(&self, ty: &Type) -> Result<BasicTypeEnum<'ctx>> {
        let ctx = self.context;
        Ok(match ty.kind() {
            TypeKind::Bool => ctx.bool_type().into(),
            TypeKind::Int8 | TypeKind::Uint8 => ctx.i8_type().into(),
            TypeKind::Int16 | TypeKind::Uint16 => ctx.i16_type().into(),
            TypeKind::Int32 | TypeKind::Uint32 => ctx.i32_type().into(),
            TypeKind::Int64 | TypeKind::Uint64 => ctx.i64_type().into(),
            TypeKind::Int | TypeKind::Uint => self.int_type.into(),
            TypeKind::Uintptr => self.uintptr_type.into(),
            TypeKind::Float32 => ctx.f32_type().into(),
            TypeKind::Float64 => ctx.f64_type().into(),
            TypeKind::Complex64 => ctx.f32_type().vec_type(2).into(),
            TypeKind::Complex128 => ctx.f64_type().vec_type(2).into(),
            TypeKind::String => self.named_struct(shapes::STRING)?.into(),
            TypeKind::UnsafePointer => self.i8_ptr_type.into(),
            TypeKind::Array { elem, len } => {
                let elem_ty = self.lower_type(elem)?;
                elem_ty.array_type(*len as u32).into()
            }
            TypeKind::Pointer(elem) => {
                let elem_ty = self.lower_type(elem)?;
                elem_ty.ptr_type(AddressSpace::default()).into()
            }
            TypeKind::Slice(elem) => {
                let elem_ty = self.lower_type(elem)?;
                ctx.struct_type(
                    &[
                        elem_ty.ptr_type(AddressSpace::default()).into(),
                        self.len_type.into(), // len
                        self.len_type.into(), // cap
                    ],
                    false,
                )
                .into()
            }
            TypeKind::Map { .. } => self
                .named_struct(shapes::HASHMAP)?
                .ptr_type(AddressSpace::default())
                .into(),
            TypeKind::Chan(_) => self
                .named_struct(shapes::CHANNEL)?
                .ptr_type(AddressSpace::default())
                .into(),
            TypeKind::Interface => self.named_struct(shapes::INTERFACE)?.into(),
            TypeKind::Struct(fields) => {
                let mut field_tys = Vec::with_capacity(fields.len());
                for field in fields {
                    field_tys.push(self.lower_type(&field.ty)?);
                }
                ctx.struct_type(&field_tys, false).into()
            }
            TypeKind::Named(name) => {
                // Named structs resolve to their previously-declared
                // aggregate; every other named type lowers to its shape.
                if let Some(&st) = self.named_structs.get(name.as_str()) {
                    st.into()
                } else {
                    let def = self.named_defs.get(name.as_str()).ok_or_else(|| {
                        CompileError::UnsupportedType(format!("type not found: {}", name))
                    })?;
                    self.lower_type(&def.underlying.clone())?
                }
            }
            TypeKind::Signature(sig) => {
                let fn_ptr = self
                    .signature_fn_type(sig)?
                    .ptr_type(AddressSpace::default());
                if sig.needs_context {
                    // Closure shape: {context, function pointer}.
                    ctx.struct_type(&[self.i8_ptr_type.into(), fn_ptr.into()], false)
                        .into()
                } else {
                    fn_ptr.into()
                }
            }
            TypeKind::Tuple(elems) => {
                let mut tys = Vec::with_capacity(elems.len());
                for e in elems {
                    tys.push(self.lower_type(e)?);
                }
                ctx.struct_type(&tys, false).into()
            }
        })
    }

    /// The raw LLVM function type for a signature: receiver expanded into
    /// leading parameters (an interface receiver is passed as the stored
    /// byte pointer), every parameter expanded, a trailing context pointer
    /// when the signature is closure-shaped.
    pub(crate) fn signature_fn_type(&self, sig: &Signature) -> Result<FunctionType<'ctx>> {
        let mut params: Vec<BasicMetadataTypeEnum<'ctx>> = Vec::new();
        if let Some(recv) = &sig.recv {
            let mut recv_ty = self.lower_type(recv)?;
            if recv_ty == self.named_struct(shapes::INTERFACE)?.into() {
                // Interface method: the receiver is the stored value, not
                // the wrapper.
                recv_ty = self.i8_ptr_type.into();
            }
            for frag in self.expanded_param_types(recv_ty) {
                params.push(frag.into());
            }
        }
        for p in &sig.params {
            let ty = self.lower_type(p)?;
            for frag in self.expanded_param_types(ty) {
                params.push(frag.into());
            }
        }
        if sig.needs_context {
            params.push(self.i8_ptr_type.into());
        }

        Ok(match sig.results.len() {
            0 => self.context.void_type().fn_type(&params, false),
            1 => self.lower_type(&sig.results[0])?.fn_type(&params, false),
            _ => {
                let mut results = Vec::with_capacity(sig.results.len());
                for r in &sig.results {
                    results.push(self.lower_type(r)?);
                }
                self.context.struct_type(&results, false).fn_type(&params, false)
            }
        })
    }

    /// The canonical zero constant for an LLVM type. Setting this as an
    /// initializer is equivalent to `zeroinitializer`.
    pub(crate) fn zero_value(&self, ty: BasicTypeEnum<'ctx>) -> Result<BasicValueEnum<'ctx>> {
        Ok(match ty {
            BasicTypeEnum::IntType(t) => t.const_int(0, false).into(),
            BasicTypeEnum::FloatType(t) => t.const_float(0.0).into(),
            BasicTypeEnum::PointerType(t) => t.const_null().into(),
            BasicTypeEnum::ArrayType(t) => {
                let elem = t.get_element_type();
                let zero = self.zero_value(elem)?;
                let elems = vec![zero; t.len() as usize];
                self.const_array(elem, &elems).into()
            }
            BasicTypeEnum::StructType(t) => {
                let mut fields = Vec::with_capacity(t.count_fields() as usize);
                for i in 0..t.count_fields() {
                    let field_ty = t.get_field_type_at_index(i).ok_or_else(|| {
                        CompileError::internal("struct field index out of range")
                    })?;
                    fields.push(self.zero_value(field_ty)?);
                }
                t.const_named_struct(&fields).into()
            }
            BasicTypeEnum::VectorType(t) => t.const_zero().into(),
        })
    }

    /// A constant array of `elem` from already-built element constants.
    pub(crate) fn const_array(
        &self,
        elem: BasicTypeEnum<'ctx>,
        values: &[BasicValueEnum<'ctx>],
    ) -> ArrayValue<'ctx> {
        match elem {
            BasicTypeEnum::IntType(t) => {
                let vals: Vec<_> = values.iter().map(|v| v.into_int_value()).collect();
                t.const_array(&vals)
            }
            BasicTypeEnum::FloatType(t) => {
                let vals: Vec<_> = values.iter().map(|v| v.into_float_value()).collect();
                t.const_array(&vals)
            }
            BasicTypeEnum::PointerType(t) => {
                let vals: Vec<_> = values.iter().map(|v| v.into_pointer_value()).collect();
                t.const_array(&vals)
            }
            BasicTypeEnum::StructType(t) => {
                let vals: Vec<_> = values.iter().map(|v| v.into_struct_value()).collect();
                t.const_array(&vals)
            }
            BasicTypeEnum::ArrayType(t) => {
                let vals: Vec<_> = values.iter().map(|v| v.into_array_value()).collect();
                t.const_array(&vals)
            }
            BasicTypeEnum::VectorType(t) => {
                let vals: Vec<_> = values.iter().map(|v| v.into_vector_value()).collect();
                t.const_array(&vals)
            }
        }
    }

    /// How a parameter of this LLVM type travels across a call: either as
    /// itself, or flattened into scalar fragments when it is a small
    /// aggregate.
    pub(crate) fn expanded_param_types(
        &self,
        ty: BasicTypeEnum<'ctx>,
    ) -> Vec<BasicTypeEnum<'ctx>> {
        let mut frags = Vec::new();
        flatten_type(ty, &mut frags);
        if frags.len() <= MAX_PARAM_FRAGMENTS {
            frags
        } else {
            vec![ty]
        }
    }

    /// Whether parameters of this type are passed flattened.
    fn param_is_expanded(&self, ty: BasicTypeEnum<'ctx>) -> bool {
        if !matches!(ty, BasicTypeEnum::StructType(_)) {
            return false;
        }
        let mut frags = Vec::new();
        flatten_type(ty, &mut frags);
        frags.len() <= MAX_PARAM_FRAGMENTS
    }

    /// Split an argument value into the fragments the callee expects.
    /// Symmetric with [`Session::collapse_param`].
    pub(crate) fn expand_param_value(
        &self,
        val: BasicValueEnum<'ctx>,
    ) -> Result<Vec<BasicValueEnum<'ctx>>> {
        if !self.param_is_expanded(val.get_type()) {
            return Ok(vec![val]);
        }
        let mut out = Vec::new();
        self.expand_value_into(val, &mut out)?;
        Ok(out)
    }

    fn expand_value_into(
        &self,
        val: BasicValueEnum<'ctx>,
        out: &mut Vec<BasicValueEnum<'ctx>>,
    ) -> Result<()> {
        match val.get_type() {
            BasicTypeEnum::StructType(st) => {
                let agg = val.into_struct_value();
                for i in 0..st.count_fields() {
                    let field = self.builder.build_extract_value(agg, i, "")?;
                    self.expand_value_into(field, out)?;
                }
            }
            _ => out.push(val),
        }
        Ok(())
    }

    /// Rebuild a parameter value from its fragments in the callee prologue.
    /// `next` yields the function's formal parameters in order.
    pub(crate) fn collapse_param(
        &self,
        ty: BasicTypeEnum<'ctx>,
        next: &mut dyn FnMut() -> Result<BasicValueEnum<'ctx>>,
    ) -> Result<BasicValueEnum<'ctx>> {
        if !self.param_is_expanded(ty) {
            return next();
        }
        self.collapse_fragments(ty, next)
    }

    fn collapse_fragments(
        &self,
        ty: BasicTypeEnum<'ctx>,
        next: &mut dyn FnMut() -> Result<BasicValueEnum<'ctx>>,
    ) -> Result<BasicValueEnum<'ctx>> {
        match ty {
            BasicTypeEnum::StructType(st) => {
                let mut agg: BasicValueEnum<'ctx> = self.zero_value(ty)?;
                for i in 0..st.count_fields() {
                    let field_ty = st.get_field_type_at_index(i).ok_or_else(|| {
                        CompileError::internal("struct field index out of range")
                    })?;
                    let field = self.collapse_fragments(field_ty, next)?;
                    agg = self
                        .builder
                        .build_insert_value(agg.into_struct_value(), field, i, "")?
                        .as_basic_value_enum();
                }
                Ok(agg)
            }
            _ => next(),
        }
    }
}

fn flatten_type<'ctx>(ty: BasicTypeEnum<'ctx>, out: &mut Vec<BasicTypeEnum<'ctx>>) {
    match ty {
        BasicTypeEnum::StructType(st) if !st.is_opaque() => {
            for field in st.get_field_types() {
                flatten_type(field, out);
            }
        }
        other => out.push(other),
    }
}
