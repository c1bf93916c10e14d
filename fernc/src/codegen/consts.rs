//! Constant materialisation.
//!
//! Turns SSA constants and the interpreted initializer trees produced by
//! the external partial evaluator into LLVM constants. Strings, slice
//! backings and map literals become internal-linkage globals whose names
//! derive from the owning symbol plus a suffix, so repeated compiles of the
//! same program intern identically.

use inkwell::module::Linkage;
use inkwell::types::{BasicType, VectorType};
use inkwell::values::{BasicValueEnum, GlobalValue, UnnamedAddress};

use crate::diagnostics::{CompileError, Result};
use crate::ssa::{Const, ConstKind, InitValue, Program, Type, TypeKind};

use super::runtime::shapes;
use super::session::Session;

/// Slots per hashmap bucket. Contractual with the runtime's hashmap.
const BUCKET_SLOTS: usize = 8;

/// The hash the runtime applies to map keys: 32-bit FNV-1a. Static bucket
/// placement must be byte-identical to the runtime's lookup hash, so keep
/// this in lock step with the runtime sources.
pub fn hashmap_hash(data: &[u8]) -> u32 {
    let mut hash: u32 = 2166136261;
    for &b in data {
        hash ^= b as u32;
        hash = hash.wrapping_mul(16777619);
    }
    hash
}

/// The bucket tophash byte for a key hash. Zero marks an empty slot, so a
/// zero high byte is bumped to one.
pub fn hashmap_top_hash(hash: u32) -> u8 {
    let top = (hash >> 24) as u8;
    if top < 1 {
        top + 1
    } else {
        top
    }
}

impl<'ctx> Session<'ctx> {
    /// Lower an SSA constant. `prefix` names any globals this introduces.
    pub(crate) fn parse_const(&mut self, prefix: &str, c: &Const) -> Result<BasicValueEnum<'ctx>> {
        let underlying = self.underlying(&c.ty)?;
        let llvm_ty = self.lower_type(&c.ty)?;
        match (underlying.kind(), &c.kind) {
            (TypeKind::Bool, ConstKind::Bool(b)) => {
                Ok(self.context.bool_type().const_int(*b as u64, false).into())
            }
            (_, ConstKind::Int(n)) if underlying.is_integer() => {
                Ok(llvm_ty.into_int_type().const_int(*n as u64, true).into())
            }
            (_, ConstKind::Uint(n)) if underlying.is_integer() => {
                Ok(llvm_ty.into_int_type().const_int(*n, false).into())
            }
            (_, ConstKind::Float(f)) if underlying.is_float() => {
                Ok(llvm_ty.into_float_type().const_float(*f).into())
            }
            (TypeKind::Complex64, ConstKind::Complex(re, im)) => {
                let f32t = self.context.f32_type();
                Ok(VectorType::const_vector(&[
                    f32t.const_float(*re),
                    f32t.const_float(*im),
                ])
                .into())
            }
            (TypeKind::Complex128, ConstKind::Complex(re, im)) => {
                let f64t = self.context.f64_type();
                Ok(VectorType::const_vector(&[
                    f64t.const_float(*re),
                    f64t.const_float(*im),
                ])
                .into())
            }
            (TypeKind::String, ConstKind::Str(bytes)) => self.intern_string(prefix, bytes),
            (TypeKind::UnsafePointer, ConstKind::Nil) => {
                Ok(self.i8_ptr_type.const_null().into())
            }
            (TypeKind::UnsafePointer, ConstKind::Uint(n)) => {
                // An absolute address, typically a memory-mapped register.
                let addr = self.uintptr_type.const_int(*n, false);
                Ok(addr.const_to_pointer(self.i8_ptr_type).into())
            }
            (TypeKind::Interface, ConstKind::Nil) => {
                // No dynamic type: typecode zero.
                let itf = self.named_struct(shapes::INTERFACE)?;
                Ok(itf
                    .const_named_struct(&[
                        self.context.i16_type().const_int(0, false).into(),
                        self.i8_ptr_type.const_null().into(),
                    ])
                    .into())
            }
            (
                TypeKind::Pointer(_)
                | TypeKind::Slice(_)
                | TypeKind::Map { .. }
                | TypeKind::Chan(_)
                | TypeKind::Signature(_),
                ConstKind::Nil,
            ) => self.zero_value(llvm_ty),
            _ => Err(CompileError::UnsupportedConstant(format!(
                "{:?} constant of type {}",
                c.kind,
                c.ty.describe()
            ))),
        }
    }

    /// Intern a string literal: a byte-array global plus the string header
    /// pointing at it.
    fn intern_string(&mut self, prefix: &str, bytes: &[u8]) -> Result<BasicValueEnum<'ctx>> {
        let data = self.context.const_string(bytes, false);
        let global = self.module.add_global(
            self.context.i8_type().array_type(bytes.len() as u32),
            None,
            &format!("{}$string", prefix),
        );
        global.set_initializer(&data);
        global.set_linkage(Linkage::Internal);
        global.set_constant(true);
        global.set_unnamed_address(UnnamedAddress::Global);

        let ptr = global.as_pointer_value().const_cast(self.i8_ptr_type);
        let len = self.len_type.const_int(bytes.len() as u64, false);
        let str_ty = self.named_struct(shapes::STRING)?;
        Ok(str_ty.const_named_struct(&[ptr.into(), len.into()]).into())
    }

    /// Turn an interpreted initializer tree into an LLVM constant,
    /// allocating backing globals as needed.
    pub(crate) fn materialise(
        &mut self,
        prefix: &str,
        program: &Program,
        value: &InitValue,
    ) -> Result<BasicValueEnum<'ctx>> {
        match value {
            InitValue::Const(c) => self.parse_const(prefix, c),

            InitValue::Array { elem, elems } => {
                let elem_ty = self.lower_type(elem)?;
                let mut vals = Vec::with_capacity(elems.len());
                for e in elems {
                    vals.push(self.materialise(&format!("{}$arrayval", prefix), program, e)?);
                }
                Ok(self.const_array(elem_ty, &vals).into())
            }

            InitValue::Pointer { ty, elem } => match elem {
                None => self.zero_value(self.lower_type(ty)?),
                Some(inner) => {
                    let pointee = self.materialise(prefix, program, inner)?;
                    let global = self.module.add_global(
                        pointee.get_type(),
                        None,
                        &format!("{}$ptrvalue", prefix),
                    );
                    global.set_initializer(&pointee);
                    global.set_linkage(Linkage::Internal);
                    Ok(global.as_pointer_value().into())
                }
            },

            InitValue::Slice { ty, array } => {
                let slice_ty = self.lower_type(ty)?.into_struct_type();
                match array {
                    None => self.zero_value(slice_ty.into()),
                    Some(arr) => {
                        let elems = match arr.as_ref() {
                            InitValue::Array { elems, .. } => elems.len() as u64,
                            _ => {
                                return Err(CompileError::UnsupportedConstant(
                                    "slice backing must be an array value".into(),
                                ))
                            }
                        };
                        let backing = self.materialise(prefix, program, arr)?;
                        let global = self.module.add_global(
                            backing.get_type(),
                            None,
                            &format!("{}$array", prefix),
                        );
                        global.set_initializer(&backing);
                        global.set_linkage(Linkage::Internal);

                        let elem_ptr_ty = slice_ty
                            .get_field_type_at_index(0)
                            .ok_or_else(|| CompileError::internal("slice type has no fields"))?
                            .into_pointer_type();
                        let ptr = global.as_pointer_value().const_cast(elem_ptr_ty);
                        let len = self.len_type.const_int(elems, false);
                        Ok(slice_ty
                            .const_named_struct(&[ptr.into(), len.into(), len.into()])
                            .into())
                    }
                }
            }

            InitValue::Struct { ty, fields } => {
                let mut vals = Vec::with_capacity(fields.len());
                for f in fields {
                    vals.push(self.materialise(prefix, program, f)?);
                }
                let st = self.lower_type(ty)?.into_struct_type();
                Ok(st.const_named_struct(&vals).into())
            }

            InitValue::Function { ty, func } => match func {
                None => self.zero_value(self.lower_type(ty)?),
                Some(id) => {
                    let target = program.func(*id);
                    let llvm_fn = self.functions.get(id).copied().ok_or_else(|| {
                        CompileError::UndefinedFunction(target.link_name.clone())
                    })?;
                    let fn_ptr = llvm_fn.as_global_value().as_pointer_value();
                    if target.sig.needs_context {
                        // Closure value: {context, function pointer}.
                        Ok(self
                            .context
                            .const_struct(&[self.i8_ptr_type.const_null().into(), fn_ptr.into()], false)
                            .into())
                    } else {
                        Ok(fn_ptr.into())
                    }
                }
            },

            InitValue::Global(id) => {
                let global = self.globals.get(id).copied().ok_or_else(|| {
                    CompileError::UndefinedGlobal(program.global(*id).link_name.clone())
                })?;
                Ok(global.as_pointer_value().into())
            }

            InitValue::Map { ty, keys, values } => {
                self.materialise_map(prefix, program, ty, keys, values)
            }

            InitValue::PointerBitCast { ty, elem } => {
                let inner = self.materialise(prefix, program, elem)?;
                let target = self.lower_type(ty)?.into_pointer_type();
                Ok(inner.into_pointer_value().const_cast(target).into())
            }

            InitValue::PointerToUintptr { elem } => {
                let inner = self.materialise(prefix, program, elem)?;
                Ok(inner.into_pointer_value().const_to_int(self.uintptr_type).into())
            }

            InitValue::ZeroBasic(ty) => self.zero_value(self.lower_type(ty)?),
        }
    }

    /// Build the statically-initialized bucket chain and header for a map
    /// literal. Returns a pointer to the header global.
    fn materialise_map(
        &mut self,
        prefix: &str,
        program: &Program,
        ty: &Type,
        keys: &[InitValue],
        values: &[InitValue],
    ) -> Result<BasicValueEnum<'ctx>> {
        let underlying = self.underlying(ty)?;
        let (key_ty, value_ty) = match underlying.kind() {
            TypeKind::Map { key, value } => (key.clone(), value.clone()),
            _ => {
                return Err(CompileError::UnsupportedConstant(format!(
                    "map literal of non-map type {}",
                    ty.describe()
                )))
            }
        };
        let llvm_key = self.lower_type(&self.underlying(&key_ty)?)?;
        let llvm_value = self.lower_type(&self.underlying(&value_ty)?)?;
        let key_size = self.size_of(llvm_key);
        let value_size = self.size_of(llvm_value);

        let bucket_ty = self.context.struct_type(
            &[
                self.context.i8_type().array_type(BUCKET_SLOTS as u32).into(), // tophash
                self.i8_ptr_type.into(),                                       // next bucket
                llvm_key.array_type(BUCKET_SLOTS as u32).into(),
                llvm_value.array_type(BUCKET_SLOTS as u32).into(),
            ],
            false,
        );

        let mut key_consts = Vec::with_capacity(keys.len());
        let mut value_consts = Vec::with_capacity(values.len());
        let mut tophashes = Vec::with_capacity(keys.len());
        for (key, value) in keys.iter().zip(values) {
            key_consts.push(self.materialise(prefix, program, key)?);
            value_consts.push(self.materialise(prefix, program, value)?);
            tophashes.push(hashmap_top_hash(hashmap_hash(&self.map_key_bytes(&key_ty, key)?)));
        }

        // Buckets chain forward, so build them back to front: each bucket
        // constant embeds the pointer to its successor.
        let num_buckets = keys.len().div_ceil(BUCKET_SLOTS).max(1);
        let mut next_bucket: Option<GlobalValue<'ctx>> = None;
        for b in (0..num_buckets).rev() {
            let lo = b * BUCKET_SLOTS;
            let hi = keys.len().min(lo + BUCKET_SLOTS);

            let i8t = self.context.i8_type();
            let mut tops = Vec::with_capacity(BUCKET_SLOTS);
            let mut ks = Vec::with_capacity(BUCKET_SLOTS);
            let mut vs = Vec::with_capacity(BUCKET_SLOTS);
            for slot in 0..BUCKET_SLOTS {
                let i = lo + slot;
                if i < hi {
                    tops.push(i8t.const_int(tophashes[i] as u64, false).into());
                    ks.push(key_consts[i]);
                    vs.push(value_consts[i]);
                } else {
                    tops.push(i8t.const_int(0, false).into());
                    ks.push(self.zero_value(llvm_key)?);
                    vs.push(self.zero_value(llvm_value)?);
                }
            }
            let next_ptr = match next_bucket {
                Some(g) => g.as_pointer_value().const_cast(self.i8_ptr_type),
                None => self.i8_ptr_type.const_null(),
            };
            let bucket = bucket_ty.const_named_struct(&[
                self.const_array(i8t.into(), &tops).into(),
                next_ptr.into(),
                self.const_array(llvm_key, &ks).into(),
                self.const_array(llvm_value, &vs).into(),
            ]);
            let global =
                self.module
                    .add_global(bucket_ty, None, &format!("{}$hashmap$bucket", prefix));
            global.set_initializer(&bucket);
            global.set_linkage(Linkage::Internal);
            next_bucket = Some(global);
        }

        let first_bucket = next_bucket.expect("at least one bucket");
        let hashmap_ty = self.named_struct(shapes::HASHMAP)?;
        let i8t = self.context.i8_type();
        let header = hashmap_ty.const_named_struct(&[
            hashmap_ty
                .ptr_type(inkwell::AddressSpace::default())
                .const_null()
                .into(),
            first_bucket.as_pointer_value().const_cast(self.i8_ptr_type).into(),
            self.len_type.const_int(keys.len() as u64, false).into(),
            i8t.const_int(key_size, false).into(),
            i8t.const_int(value_size, false).into(),
            i8t.const_int(0, false).into(), // bucket bits
        ]);
        let global = self
            .module
            .add_global(hashmap_ty, None, &format!("{}$hashmap", prefix));
        global.set_initializer(&header);
        global.set_linkage(Linkage::Internal);
        Ok(global.as_pointer_value().into())
    }

    /// The exact bytes the runtime would hash for this key.
    fn map_key_bytes(&self, key_ty: &Type, key: &InitValue) -> Result<Vec<u8>> {
        let c = match key {
            InitValue::Const(c) => c,
            _ => {
                return Err(CompileError::UnsupportedMapKey(
                    "map literal key is not a basic constant".into(),
                ))
            }
        };
        let underlying = self.underlying(key_ty)?;
        match (underlying.kind(), &c.kind) {
            (TypeKind::String, ConstKind::Str(bytes)) => Ok(bytes.clone()),
            (TypeKind::Int | TypeKind::Uint, kind) => {
                let mut n = match kind {
                    ConstKind::Int(v) => *v as u64,
                    ConstKind::Uint(v) => *v,
                    _ => {
                        return Err(CompileError::UnsupportedMapKey(
                            "integer map key is not an integer constant".into(),
                        ))
                    }
                };
                let width = self.size_of(self.int_type.into()) as usize;
                let mut bytes = Vec::with_capacity(width);
                for _ in 0..width {
                    bytes.push(n as u8);
                    n >>= 8;
                }
                Ok(bytes)
            }
            _ => Err(CompileError::UnsupportedMapKey(key_ty.describe())),
        }
    }
}
