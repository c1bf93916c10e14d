//! Late passes over the finished module, exposed to the build driver.
//!
//! The driver runs `verify` after every significant phase so a broken
//! module is attributed to the pass that produced it.

use std::path::Path;

use inkwell::module::Linkage;
use inkwell::targets::FileType;
use inkwell::types::{BasicType, BasicTypeEnum};
use inkwell::values::{BasicMetadataValueEnum, FunctionValue, UnnamedAddress};
use inkwell::AddressSpace;

use tracing::debug;

use crate::diagnostics::{CompileError, Result};

use super::session::Session;

impl<'ctx> Session<'ctx> {
    /// LLVM module verification, attributed to a phase.
    pub fn verify(&self, phase: &'static str) -> Result<()> {
        self.module.verify().map_err(|e| CompileError::Verify {
            phase,
            message: e.to_string(),
        })
    }

    /// Put every defined function in its own `.text.<name>` section so the
    /// linker can drop dead code.
    pub fn apply_function_sections(&self) {
        for f in self.module.get_functions() {
            if f.count_basic_blocks() == 0 {
                continue; // declaration
            }
            let name = f.get_name().to_string_lossy().into_owned();
            f.set_section(Some(&format!(".text.{}", name)));
        }
    }

    /// Clear the constant flag on every global. On Harvard architectures
    /// constant and non-constant pointers address different memories, and
    /// the compiler cannot yet tell which space a pointer belongs to.
    pub fn non_const_globals(&self) {
        for g in self.module.get_globals() {
            g.set_constant(false);
        }
    }

    /// Rewrite externally-visible functions that traffic in 64-bit
    /// integers to pass them through pointers instead, for host
    /// environments without native 64-bit integers.
    ///
    /// Definitions are renamed with a `$i64param` suffix, made internal and
    /// re-exported through a wrapper that loads from the pointer
    /// parameters. Declarations are renamed the same way and given a shim
    /// body that spills each 64-bit argument to a stack slot and calls a
    /// fresh pointer-parameter declaration under the original name; call
    /// sites follow the renamed value unchanged.
    pub fn external_int64_as_ptr(&mut self) -> Result<()> {
        let i64t = self.context.i64_type();
        let i64p = i64t.ptr_type(AddressSpace::default());

        let functions: Vec<FunctionValue<'ctx>> = self.module.get_functions().collect();
        for f in functions {
            if f.get_linkage() != Linkage::External {
                continue;
            }
            let name = f.get_name().to_string_lossy().into_owned();
            if name.starts_with("llvm.") {
                continue;
            }
            let param_types: Vec<BasicTypeEnum<'ctx>> =
                f.get_params().iter().map(|p| p.get_type()).collect();
            if !param_types.iter().any(|&t| t == i64t.into()) {
                continue;
            }
            debug!(name = %name, "rewriting 64-bit external ABI");

            let wrapper_params: Vec<inkwell::types::BasicMetadataTypeEnum<'ctx>> = param_types
                .iter()
                .map(|&t| {
                    if t == i64t.into() {
                        i64p.into()
                    } else {
                        t.into()
                    }
                })
                .collect();
            let ret_ty = f.get_type().get_return_type();
            let wrapper_ty = match ret_ty {
                Some(t) => t.fn_type(&wrapper_params, false),
                None => self.context.void_type().fn_type(&wrapper_params, false),
            };

            let is_import = f.count_basic_blocks() == 0;
            f.as_global_value().set_name(&format!("{}$i64param", name));
            let wrapper = self.module.add_function(&name, wrapper_ty, Some(Linkage::External));
            self.builder.unset_current_debug_location();

            if is_import {
                // The pointer-ABI symbol is provided externally; the
                // renamed declaration becomes a shim every internal call
                // still reaches.
                f.set_linkage(Linkage::Internal);
                f.as_global_value().set_unnamed_address(UnnamedAddress::Global);
                let entry = self.context.append_basic_block(f, "entry");
                self.builder.position_at_end(entry);
                let mut args: Vec<BasicMetadataValueEnum<'ctx>> = Vec::new();
                for param in f.get_params() {
                    if param.get_type() == i64t.into() {
                        let slot = self.builder.build_alloca(i64t, "i64asptr")?;
                        self.builder.build_store(slot, param)?;
                        args.push(slot.into());
                    } else {
                        args.push(param.into());
                    }
                }
                let call = self.builder.build_call(wrapper, &args, "")?;
                match call.try_as_basic_value().left() {
                    Some(v) => self.builder.build_return(Some(&v))?,
                    None => self.builder.build_return(None)?,
                };
            } else {
                // The definition stays internal; the wrapper carries the
                // exported pointer ABI.
                f.set_linkage(Linkage::Internal);
                f.as_global_value().set_unnamed_address(UnnamedAddress::Global);
                let entry = self.context.append_basic_block(wrapper, "entry");
                self.builder.position_at_end(entry);
                let mut args: Vec<BasicMetadataValueEnum<'ctx>> = Vec::new();
                for (i, param) in wrapper.get_params().iter().enumerate() {
                    if param_types[i] == i64t.into() {
                        let loaded =
                            self.builder.build_load(param.into_pointer_value(), "i64")?;
                        args.push(loaded.into());
                    } else {
                        args.push((*param).into());
                    }
                }
                let call = self.builder.build_call(f, &args, "")?;
                match call.try_as_basic_value().left() {
                    Some(v) => self.builder.build_return(Some(&v))?,
                    None => self.builder.build_return(None)?,
                };
            }
        }
        Ok(())
    }

    /// Emit a relocatable object file.
    pub fn emit_object(&self, path: &Path) -> Result<()> {
        self.machine
            .write_to_file(&self.module, FileType::Object, path)
            .map_err(|e| CompileError::Target(e.to_string()))
    }

    /// Emit LLVM bitcode.
    pub fn emit_bitcode(&self, path: &Path) -> Result<()> {
        if self.module.write_bitcode_to_path(path) {
            Ok(())
        } else {
            Err(CompileError::internal(format!(
                "bitcode emission failed for {}",
                path.display()
            )))
        }
    }

    /// Emit textual IR.
    pub fn emit_text(&self, path: &Path) -> Result<()> {
        self.module
            .print_to_file(path)
            .map_err(|e| CompileError::Target(e.to_string()))
    }
}
