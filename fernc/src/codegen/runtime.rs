//! Runtime support declarations.
//!
//! Compiled programs lean on a runtime library for everything the language
//! abstracts over the hardware: allocation, the task scheduler, hashmaps,
//! string helpers, printing, panics. The library is linked in later; the
//! session only declares the helpers it calls, lazily and by name.
//!
//! Names and signatures here are an ABI contract with the runtime sources.
//! The pseudo-functions (`makeInterface`, `typeAssert`,
//! `interfaceImplements`, `interfaceMethod`) are declared like ordinary
//! helpers so the module verifies, and are replaced by the downstream
//! interface-lowering pass.

use inkwell::module::Linkage;
use inkwell::types::{BasicMetadataTypeEnum, FunctionType};
use inkwell::values::{BasicMetadataValueEnum, BasicValueEnum, FunctionValue};
use inkwell::AddressSpace;

use crate::diagnostics::{CompileError, Result};

use super::session::Session;

/// Named aggregate types shared with the runtime. Bit layout is contractual.
pub mod shapes {
    pub const STRING: &str = "runtime._string";
    pub const INTERFACE: &str = "runtime._interface";
    pub const HASHMAP: &str = "runtime.hashmap";
    pub const CHANNEL: &str = "runtime.channel";
    pub const DEFER: &str = "runtime._defer";
    pub const TASK_STATE: &str = "runtime.taskState";
    pub const STRING_ITERATOR: &str = "runtime.stringIterator";
    pub const HASHMAP_ITERATOR: &str = "runtime.hashmapIterator";
}

impl<'ctx> Session<'ctx> {
    /// Declare (or fetch the cached declaration of) `runtime.<name>` and
    /// call it.
    pub(crate) fn runtime_call(
        &mut self,
        name: &str,
        args: &[BasicMetadataValueEnum<'ctx>],
        value_name: &str,
    ) -> Result<Option<BasicValueEnum<'ctx>>> {
        let func = self.runtime_fn(name)?;
        let call = self.builder.build_call(func, args, value_name)?;
        Ok(call.try_as_basic_value().left())
    }

    /// The declaration of `runtime.<name>`.
    pub(crate) fn runtime_fn(&mut self, name: &str) -> Result<FunctionValue<'ctx>> {
        if let Some(&f) = self.runtime_fns.get(name) {
            return Ok(f);
        }
        let fn_type = self.runtime_fn_type(name)?;
        let link_name = format!("runtime.{}", name);
        let f = self.module.add_function(&link_name, fn_type, Some(Linkage::External));
        self.runtime_fns.insert(name.to_string(), f);
        Ok(f)
    }

    fn runtime_fn_type(&self, name: &str) -> Result<FunctionType<'ctx>> {
        let ctx = self.context;
        let void = ctx.void_type();
        let i1 = ctx.bool_type();
        let i8t = ctx.i8_type();
        let i16t = ctx.i16_type();
        let i32t = ctx.i32_type();
        let i64t = ctx.i64_type();
        let i8p = self.i8_ptr_type;
        let i8pp = i8p.ptr_type(AddressSpace::default());
        let i16p = i16t.ptr_type(AddressSpace::default());
        let len = self.len_type;
        let int = self.int_type;
        let uintptr = self.uintptr_type;
        let str_t = self.named_struct(shapes::STRING)?;
        let itf_t = self.named_struct(shapes::INTERFACE)?;
        let map_p = self.named_struct(shapes::HASHMAP)?.ptr_type(AddressSpace::default());
        let defer_p = self.named_struct(shapes::DEFER)?.ptr_type(AddressSpace::default());
        let str_it_p =
            self.named_struct(shapes::STRING_ITERATOR)?.ptr_type(AddressSpace::default());
        let map_it_p =
            self.named_struct(shapes::HASHMAP_ITERATOR)?.ptr_type(AddressSpace::default());
        // Byte slices cross the runtime boundary as the raw slice triple.
        let byteslice = ctx.struct_type(&[i8p.into(), len.into(), len.into()], false);

        let a = |tys: &[BasicMetadataTypeEnum<'ctx>]| tys.to_vec();

        let ty = match name {
            "alloc" => i8p.fn_type(&a(&[uintptr.into()]), false),
            "free" => void.fn_type(&a(&[i8p.into()]), false),

            "stringConcat" => str_t.fn_type(&a(&[str_t.into(), str_t.into()]), false),
            "stringEqual" | "stringLess" => {
                i1.fn_type(&a(&[str_t.into(), str_t.into()]), false)
            }
            "stringFromBytes" => str_t.fn_type(&a(&[byteslice.into()]), false),
            "stringToBytes" => byteslice.fn_type(&a(&[str_t.into()]), false),
            "stringFromUnicode" => str_t.fn_type(&a(&[i32t.into()]), false),
            "stringNext" => {
                let tuple =
                    ctx.struct_type(&[i1.into(), int.into(), i32t.into()], false);
                tuple.fn_type(&a(&[str_t.into(), str_it_p.into()]), false)
            }

            "interfaceEqual" => i1.fn_type(&a(&[itf_t.into(), itf_t.into()]), false),
            "interfaceTypeAssert" => void.fn_type(&a(&[i1.into()]), false),

            "hashmapMake" => map_p.fn_type(&a(&[i8t.into(), i8t.into()]), false),
            "hashmapLen" => int.fn_type(&a(&[map_p.into()]), false),
            "hashmapNext" => i1.fn_type(
                &a(&[map_p.into(), map_it_p.into(), i8p.into(), i8p.into()]),
                false,
            ),
            "hashmapStringSet" => {
                void.fn_type(&a(&[map_p.into(), str_t.into(), i8p.into()]), false)
            }
            "hashmapStringGet" => {
                i1.fn_type(&a(&[map_p.into(), str_t.into(), i8p.into()]), false)
            }
            "hashmapStringDelete" => void.fn_type(&a(&[map_p.into(), str_t.into()]), false),
            "hashmapBinarySet" => {
                void.fn_type(&a(&[map_p.into(), i8p.into(), i8p.into()]), false)
            }
            "hashmapBinaryGet" => {
                i1.fn_type(&a(&[map_p.into(), i8p.into(), i8p.into()]), false)
            }
            "hashmapBinaryDelete" => void.fn_type(&a(&[map_p.into(), i8p.into()]), false),

            "sliceAppend" => byteslice.fn_type(
                &a(&[i8p.into(), i8p.into(), len.into(), len.into(), len.into(), uintptr.into()]),
                false,
            ),
            "sliceCopy" => int.fn_type(
                &a(&[i8p.into(), i8p.into(), len.into(), len.into(), uintptr.into()]),
                false,
            ),

            "lookupBoundsCheck" => void.fn_type(&a(&[len.into(), int.into()]), false),
            "lookupBoundsCheckLong" => void.fn_type(&a(&[len.into(), i64t.into()]), false),
            "sliceBoundsCheck" => {
                void.fn_type(&a(&[len.into(), int.into(), int.into()]), false)
            }
            "sliceBoundsCheckLong" => {
                void.fn_type(&a(&[len.into(), i64t.into(), i64t.into()]), false)
            }
            "sliceBoundsCheckMake" => void.fn_type(&a(&[int.into(), int.into()]), false),

            "_panic" => void.fn_type(&a(&[itf_t.into()]), false),
            "_recover" => itf_t.fn_type(&a(&[]), false),
            "rundefers" => void.fn_type(&a(&[defer_p.into()]), false),

            "yieldToScheduler" | "waitForAsyncCall" | "scheduler" => {
                void.fn_type(&a(&[i8p.into()]), false)
            }
            "sleepTask" => void.fn_type(&a(&[i8p.into(), i64t.into()]), false),

            "printstring" => void.fn_type(&a(&[str_t.into()]), false),
            "printint8" | "printuint8" => void.fn_type(&a(&[i8t.into()]), false),
            "printint16" | "printuint16" => void.fn_type(&a(&[i16t.into()]), false),
            "printint32" | "printuint32" => void.fn_type(&a(&[i32t.into()]), false),
            "printint64" | "printuint64" => void.fn_type(&a(&[i64t.into()]), false),
            "printfloat32" => void.fn_type(&a(&[ctx.f32_type().into()]), false),
            "printfloat64" => void.fn_type(&a(&[ctx.f64_type().into()]), false),
            "printcomplex64" => {
                void.fn_type(&a(&[ctx.f32_type().vec_type(2).into()]), false)
            }
            "printcomplex128" => {
                void.fn_type(&a(&[ctx.f64_type().vec_type(2).into()]), false)
            }
            "printbool" => void.fn_type(&a(&[i1.into()]), false),
            "printptr" => void.fn_type(&a(&[uintptr.into()]), false),
            "printitf" => void.fn_type(&a(&[itf_t.into()]), false),
            "printmap" => void.fn_type(&a(&[map_p.into()]), false),
            "printspace" | "printnl" => void.fn_type(&a(&[]), false),

            // Interface-lowering pseudo-functions.
            "makeInterface" => i16t.fn_type(&a(&[i16p.into(), i8p.into()]), false),
            "typeAssert" => i1.fn_type(&a(&[i16t.into(), i16p.into()]), false),
            "interfaceImplements" => i1.fn_type(&a(&[i16t.into(), i8pp.into()]), false),
            "interfaceMethod" => {
                i8p.fn_type(&a(&[i16t.into(), i8pp.into(), i16p.into()]), false)
            }

            other => {
                return Err(CompileError::internal(format!(
                    "no signature for runtime helper {}",
                    other
                )))
            }
        };
        Ok(ty)
    }
}
