//! Non-value instruction lowering: stores, control flow, panics, goroutine
//! spawns and map updates. Defer sites live in `codegen/defers.rs`.

use inkwell::values::{BasicValue, BasicValueEnum};

use crate::diagnostics::{CompileError, Result};
use crate::ssa::{Callee, Instr, Operand, Program, TypeKind};

use super::super::session::Session;
use super::Frame;

impl<'ctx> Session<'ctx> {
    pub(crate) fn lower_stmt(
        &mut self,
        program: &Program,
        frame: &mut Frame<'ctx, '_>,
        vid: crate::ssa::ValueId,
        instr: &Instr,
    ) -> Result<()> {
        match instr {
            Instr::Store { addr, val } => self.lower_store(program, frame, addr, val),

            Instr::If { cond } => {
                let cond_v = self.resolve_operand(program, frame, cond)?.into_int_value();
                let succs = &frame.func.block(frame.current_block).succs;
                if succs.len() != 2 {
                    return Err(CompileError::internal("two-way branch without two successors"));
                }
                let then_bb = frame.block_entries[&succs[0]];
                let else_bb = frame.block_entries[&succs[1]];
                self.builder.build_conditional_branch(cond_v, then_bb, else_bb)?;
                Ok(())
            }

            Instr::Jump => {
                let succs = &frame.func.block(frame.current_block).succs;
                if succs.len() != 1 {
                    return Err(CompileError::internal("jump without a single successor"));
                }
                let target = frame.block_entries[&succs[0]];
                self.builder.build_unconditional_branch(target)?;
                Ok(())
            }

            Instr::Return { results } => self.lower_return(program, frame, results),

            Instr::Panic { x } => {
                let value = self.resolve_operand(program, frame, x)?;
                self.runtime_call("_panic", &[value.into()], "")?;
                self.builder.build_unreachable()?;
                Ok(())
            }

            Instr::Go(call) => self.lower_go(program, frame, call),

            Instr::Defer(call) => self.lower_defer(program, frame, vid, call),

            Instr::RunDefers => {
                let head_slot = frame.defer_head.ok_or_else(|| {
                    CompileError::internal("rundefers without a defer list slot")
                })?;
                let head = self.builder.build_load(head_slot, "")?;
                self.runtime_call("rundefers", &[head.into()], "")?;
                Ok(())
            }

            Instr::MapUpdate { map, key, value } => {
                self.lower_map_update(program, frame, map, key, value)
            }

            other => Err(CompileError::UnsupportedInstruction(format!("{:?}", other))),
        }
    }

    fn lower_store(
        &mut self,
        program: &Program,
        frame: &mut Frame<'ctx, '_>,
        addr: &Operand,
        val: &Operand,
    ) -> Result<()> {
        let addr_v = match self.resolve_operand(program, frame, addr) {
            // Stores through foreign-glue globals are skipped wholesale.
            Err(CompileError::ForeignGlue) => return Ok(()),
            other => other?,
        };
        let value = self.resolve_operand(program, frame, val)?;
        if self.size_of(value.get_type()) == 0 {
            return Ok(());
        }
        let store = self.builder.build_store(addr_v.into_pointer_value(), value)?;

        let addr_ty = self.underlying(&self.operand_type(program, frame.func, addr)?)?;
        if let TypeKind::Pointer(pointee) = addr_ty.kind() {
            if self.is_volatile(pointee) {
                // Memory-mapped register write.
                store.set_volatile(true).map_err(CompileError::internal)?;
            }
        }
        Ok(())
    }

    fn lower_return(
        &mut self,
        program: &Program,
        frame: &mut Frame<'ctx, '_>,
        results: &[Operand],
    ) -> Result<()> {
        if frame.is_blocking() {
            if !results.is_empty() {
                return Err(CompileError::UnsupportedBlockingReturn(
                    frame.func.link_name.clone(),
                ));
            }
            return self.lower_task_return(frame);
        }

        match results.len() {
            0 => {
                self.builder.build_return(None)?;
            }
            1 => {
                let value = self.resolve_operand(program, frame, &results[0])?;
                self.builder.build_return(Some(&value))?;
            }
            _ => {
                // Multiple results collapse into the declared return struct.
                let declared = self.llvm_function(program, frame.func_id)?;
                let ret_ty = declared.get_type().get_return_type().ok_or_else(|| {
                    CompileError::internal("multi-result function declared void")
                })?;
                let mut agg: BasicValueEnum<'ctx> = self.zero_value(ret_ty)?;
                for (i, result) in results.iter().enumerate() {
                    let value = self.resolve_operand(program, frame, result)?;
                    agg = self
                        .builder
                        .build_insert_value(agg.into_struct_value(), value, i as u32, "")?
                        .as_basic_value_enum();
                }
                self.builder.build_return(Some(&agg))?;
            }
        }
        Ok(())
    }

    /// `go f(…)`: spawn a task for a blocking callee, or just run a
    /// non-blocking one to completion.
    fn lower_go(
        &mut self,
        program: &Program,
        frame: &mut Frame<'ctx, '_>,
        call: &crate::ssa::CallInstr,
    ) -> Result<()> {
        let Callee::Function(fid) = &call.callee else {
            return Err(CompileError::UnsupportedInstruction(
                "goroutine spawn through a method or function value".into(),
            ));
        };
        let target = program.func(*fid);
        if !target.blocking {
            // Nothing can suspend, so the spawn degenerates to a call.
            self.lower_call(program, frame, call, true)?;
            return Ok(());
        }
        let handle = self
            .lower_call(program, frame, call, true)?
            .ok_or_else(|| CompileError::internal("spawned task produced no handle"))?;
        self.runtime_call("yieldToScheduler", &[handle.into()], "")?;
        Ok(())
    }

    fn lower_map_update(
        &mut self,
        program: &Program,
        frame: &mut Frame<'ctx, '_>,
        map: &Operand,
        key: &Operand,
        value: &Operand,
    ) -> Result<()> {
        let map_v = self.resolve_operand(program, frame, map)?;
        let key_v = self.resolve_operand(program, frame, key)?;
        let value_v = self.resolve_operand(program, frame, value)?;

        // The runtime takes the value through a pointer.
        let value_slot = self.builder.build_alloca(value_v.get_type(), "mapupdate.value")?;
        self.builder.build_store(value_slot, value_v)?;
        let value_raw =
            self.builder
                .build_pointer_cast(value_slot, self.i8_ptr_type, "mapupdate.valueptr")?;

        let key_ty = self.underlying(&self.operand_type(program, frame.func, key)?)?;
        if matches!(key_ty.kind(), TypeKind::String) {
            self.runtime_call(
                "hashmapStringSet",
                &[map_v.into(), key_v.into(), value_raw.into()],
                "",
            )?;
        } else {
            let key_slot = self.builder.build_alloca(key_v.get_type(), "mapupdate.key")?;
            self.builder.build_store(key_slot, key_v)?;
            let key_raw =
                self.builder
                    .build_pointer_cast(key_slot, self.i8_ptr_type, "mapupdate.keyptr")?;
            self.runtime_call(
                "hashmapBinarySet",
                &[map_v.into(), key_raw.into(), value_raw.into()],
                "",
            )?;
        }
        Ok(())
    }
}
