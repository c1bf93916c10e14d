//! Blocking-function (goroutine) transformation.
//!
//! A blocking function may suspend, so it cannot keep state on the machine
//! stack across suspension points. Each blocking SSA function compiles to
//! two LLVM functions:
//!
//! - the **ramp**, carrying the declared link name: allocates the task
//!   frame through `runtime.alloc`, stores the resume-function pointer,
//!   state zero, the parent handle and the parameters, and returns the
//!   frame pointer — the task handle the scheduler traffics in;
//! - the **resume function** (`<name>$task`): re-derives every frame-slot
//!   pointer in its entry block, loads the state and switches to the first
//!   body block or to the suspension's resume block.
//!
//! Task frame layout (ABI contract with the scheduler, which resumes a
//! task by calling field 0 with the handle):
//!
//! ```text
//! { resume: void(i8*)*, state: i32, %runtime.taskState, parent: i8*,
//!   [defer head], param slots…, one slot per SSA value }
//! ```
//!
//! Every SSA value of a blocking function lives in a frame slot: stored
//! when defined, loaded at each use. Stack allocations, range iterators and
//! defer frames become in-place slots so their addresses stay valid across
//! suspensions. A suspension point stores its resume state and returns;
//! lowering continues in a fresh block which becomes the SSA block's exit
//! block, which is why φ edges must always go through the exit map.

use std::collections::HashMap;

use inkwell::basic_block::BasicBlock;
use inkwell::module::Linkage;
use inkwell::types::{BasicTypeEnum, StructType};
use inkwell::values::{IntValue, PointerValue, UnnamedAddress};
use inkwell::AddressSpace;

use crate::diagnostics::{CompileError, Result};
use crate::ssa::{Function, Instr, Program, TypeKind, ValueId, ValueKind};

use super::lower::Frame;
use super::runtime::shapes;
use super::session::Session;

/// Fixed frame fields before the defer head and the value slots.
const FIELD_RESUME: u32 = 0;
const FIELD_STATE: u32 = 1;
const FIELD_PARENT: u32 = 3;

/// Coroutine state carried while lowering a blocking function.
pub(crate) struct TaskFrame<'ctx> {
    /// The resume function's handle parameter.
    pub handle: PointerValue<'ctx>,
    pub state_slot: PointerValue<'ctx>,
    pub parent_slot: PointerValue<'ctx>,
    /// State loaded in the entry block; consumed by the dispatch switch.
    pub state_value: IntValue<'ctx>,
    /// The resume function's entry block, terminated by the dispatch
    /// switch once lowering is done.
    pub entry: BasicBlock<'ctx>,
    /// Spill slots: one per SSA value, stored at definition and loaded at
    /// use.
    pub slots: HashMap<ValueId, PointerValue<'ctx>>,
    /// In-place slots standing in for allocas (stack cells, range
    /// iterators, defer frames). The slot pointer is the value.
    pub in_place: HashMap<ValueId, PointerValue<'ctx>>,
    pub suspend_count: u32,
    pub resume_blocks: Vec<(u32, BasicBlock<'ctx>)>,
}

/// How one SSA value is represented in the task frame.
enum SlotKind {
    Spill,
    InPlace,
}

impl<'ctx> Session<'ctx> {
    /// Build the ramp, create the resume function and precompute the frame
    /// slots. On return the frame points at the resume function and the
    /// builder sits in its entry block.
    pub(crate) fn begin_task(
        &mut self,
        program: &Program,
        frame: &mut Frame<'ctx, '_>,
    ) -> Result<()> {
        let func = frame.func;
        let ramp = frame.llvm_fn;

        // Lay out the frame: fixed fields, then one field per slot.
        let mut field_types: Vec<BasicTypeEnum<'ctx>> = Vec::new();
        let defer_ptr_ty =
            self.named_struct(shapes::DEFER)?.ptr_type(AddressSpace::default());
        let resume_fn_ty = self
            .context
            .void_type()
            .fn_type(&[self.i8_ptr_type.into()], false);
        field_types.push(resume_fn_ty.ptr_type(AddressSpace::default()).into());
        field_types.push(self.context.i32_type().into());
        field_types.push(self.named_struct(shapes::TASK_STATE)?.into());
        field_types.push(self.i8_ptr_type.into());
        let defer_field = if func.has_defers {
            field_types.push(defer_ptr_ty.into());
            Some((field_types.len() - 1) as u32)
        } else {
            None
        };

        let mut value_fields: Vec<(ValueId, u32, SlotKind)> = Vec::new();
        for (i, data) in func.values.iter().enumerate() {
            let vid = ValueId(i as u32);
            let (slot_ty, kind) = match &data.kind {
                ValueKind::Param { .. } | ValueKind::FreeVar { .. } => {
                    let ty = data.ty.clone().ok_or_else(|| {
                        CompileError::internal("untyped parameter in blocking function")
                    })?;
                    (self.lower_type(&ty)?, SlotKind::Spill)
                }
                ValueKind::Instr(instr) => match instr {
                    Instr::Alloc { ty, heap: false, .. } => {
                        (self.lower_type(ty)?, SlotKind::InPlace)
                    }
                    Instr::Range { x } => {
                        let x_ty =
                            self.underlying(&self.operand_type(program, func, x)?)?;
                        let name = match x_ty.kind() {
                            TypeKind::String => shapes::STRING_ITERATOR,
                            TypeKind::Map { .. } => shapes::HASHMAP_ITERATOR,
                            _ => {
                                return Err(CompileError::UnsupportedInstruction(format!(
                                    "range over {}",
                                    x_ty.describe()
                                )))
                            }
                        };
                        (self.named_struct(name)?.into(), SlotKind::InPlace)
                    }
                    Instr::Defer(call) => {
                        let frame_ty = self.defer_frame_type(program, func, call)?;
                        (frame_ty.into(), SlotKind::InPlace)
                    }
                    _ => match &data.ty {
                        Some(ty) => (self.lower_type(ty)?, SlotKind::Spill),
                        None => continue,
                    },
                },
            };
            field_types.push(slot_ty);
            value_fields.push((vid, (field_types.len() - 1) as u32, kind));
        }

        let frame_ty = self.context.struct_type(&field_types, false);

        // Resume function, internal to the module; the scheduler reaches it
        // through the frame's first field.
        let resume_fn = self.module.add_function(
            &format!("{}$task", func.link_name),
            resume_fn_ty,
            Some(Linkage::Internal),
        );
        resume_fn
            .as_global_value()
            .set_unnamed_address(UnnamedAddress::Global);

        self.build_ramp(func, ramp, resume_fn, frame_ty, defer_field, &value_fields)?;
        // The ramp's scope must not leak onto the resume function.
        self.builder.unset_current_debug_location();

        // Resume-side entry: recompute every slot pointer, then load the
        // state for the dispatch switch that finish_task appends.
        let entry = self.context.append_basic_block(resume_fn, "task.entry");
        self.builder.position_at_end(entry);
        let handle = resume_fn
            .get_nth_param(0)
            .ok_or_else(|| CompileError::internal("resume function has no handle parameter"))?
            .into_pointer_value();
        handle.set_name("task.handle");
        let frame_ptr = self.builder.build_pointer_cast(
            handle,
            frame_ty.ptr_type(AddressSpace::default()),
            "task.frame",
        )?;
        let state_slot = self.builder.build_struct_gep(frame_ptr, FIELD_STATE, "task.stateptr")?;
        let parent_slot =
            self.builder.build_struct_gep(frame_ptr, FIELD_PARENT, "task.parentptr")?;
        if let Some(field) = defer_field {
            frame.defer_head =
                Some(self.builder.build_struct_gep(frame_ptr, field, "deferPtr")?);
        }

        let mut slots = HashMap::new();
        let mut in_place = HashMap::new();
        for (vid, field, kind) in &value_fields {
            let gep = self.builder.build_struct_gep(frame_ptr, *field, "")?;
            match kind {
                SlotKind::Spill => {
                    slots.insert(*vid, gep);
                }
                SlotKind::InPlace => {
                    in_place.insert(*vid, gep);
                }
            }
        }
        let state_value = self
            .builder
            .build_load(state_slot, "task.state")?
            .into_int_value();

        frame.llvm_fn = resume_fn;
        frame.task = Some(TaskFrame {
            handle,
            state_slot,
            parent_slot,
            state_value,
            entry,
            slots,
            in_place,
            suspend_count: 0,
            resume_blocks: Vec::new(),
        });
        Ok(())
    }

    /// The ramp: allocate and initialize the task frame, return the handle.
    /// The body does not start running until the scheduler's first resume.
    fn build_ramp(
        &mut self,
        func: &Function,
        ramp: inkwell::values::FunctionValue<'ctx>,
        resume_fn: inkwell::values::FunctionValue<'ctx>,
        frame_ty: StructType<'ctx>,
        defer_field: Option<u32>,
        value_fields: &[(ValueId, u32, SlotKind)],
    ) -> Result<()> {
        let entry = self.context.append_basic_block(ramp, "entry");
        self.builder.position_at_end(entry);

        let size = self.uintptr_type.const_int(self.size_of(frame_ty.into()), false);
        let raw = self
            .runtime_call_value("alloc", &[size.into()], "task.data")?
            .into_pointer_value();
        let frame_ptr = self.builder.build_pointer_cast(
            raw,
            frame_ty.ptr_type(AddressSpace::default()),
            "task.frame",
        )?;

        let resume_slot =
            self.builder.build_struct_gep(frame_ptr, FIELD_RESUME, "task.resumeptr")?;
        self.builder
            .build_store(resume_slot, resume_fn.as_global_value().as_pointer_value())?;
        let state_slot = self.builder.build_struct_gep(frame_ptr, FIELD_STATE, "")?;
        self.builder.build_store(state_slot, self.context.i32_type().const_int(0, false))?;
        let parent_slot = self.builder.build_struct_gep(frame_ptr, FIELD_PARENT, "")?;
        let parent = ramp
            .get_nth_param(0)
            .ok_or_else(|| CompileError::internal("blocking ramp has no parent parameter"))?;
        self.builder.build_store(parent_slot, parent)?;
        if let Some(field) = defer_field {
            let slot = self.builder.build_struct_gep(frame_ptr, field, "")?;
            let defer_ptr_ty =
                self.named_struct(shapes::DEFER)?.ptr_type(AddressSpace::default());
            self.builder.build_store(slot, defer_ptr_ty.const_null())?;
        }

        // Parameters arrive expanded in the ramp (after the parent handle)
        // and are reassembled into their frame slots.
        let all_params = ramp.get_params();
        let mut cursor = 1usize; // skip the parent handle
        for &pid in &func.params {
            let ty = func.value(pid).ty.clone().ok_or_else(|| {
                CompileError::internal("untyped parameter in blocking function")
            })?;
            let llvm_ty = self.lower_type(&ty)?;
            let value = self.collapse_param(llvm_ty, &mut || {
                let v = all_params.get(cursor).copied().ok_or_else(|| {
                    CompileError::internal("parameter fragment count mismatch")
                })?;
                cursor += 1;
                Ok(v)
            })?;
            let field = slot_field(value_fields, pid)?;
            let gep = self.builder.build_struct_gep(frame_ptr, field, "")?;
            self.builder.build_store(gep, value)?;
        }

        // Free variables are unpacked from the context here, once, and
        // spilled like parameters.
        if !func.free_vars.is_empty() {
            let context = ramp
                .get_last_param()
                .ok_or_else(|| CompileError::internal("closure ramp has no context parameter"))?
                .into_pointer_value();
            let values = self.unpack_context(func, ramp, context)?;
            for (&fv, value) in func.free_vars.iter().zip(values) {
                let field = slot_field(value_fields, fv)?;
                let gep = self.builder.build_struct_gep(frame_ptr, field, "")?;
                self.builder.build_store(gep, value)?;
            }
        }

        self.builder.build_return(Some(&raw))?;
        Ok(())
    }

    /// Emit a suspension point: persist the resume state, return to the
    /// scheduler and continue lowering in a fresh resume block, which
    /// becomes the current SSA block's exit block.
    pub(crate) fn suspend(&mut self, frame: &mut Frame<'ctx, '_>, name: &str) -> Result<()> {
        let (state_slot, state) = {
            let task = frame
                .task
                .as_mut()
                .ok_or_else(|| CompileError::internal("suspension outside a blocking function"))?;
            task.suspend_count += 1;
            (task.state_slot, task.suspend_count)
        };
        self.builder
            .build_store(state_slot, self.context.i32_type().const_int(state as u64, false))?;
        self.builder.build_return(None)?;

        let resume = self.context.append_basic_block(frame.llvm_fn, name);
        self.builder.position_at_end(resume);
        let task = frame.task.as_mut().expect("checked above");
        task.resume_blocks.push((state, resume));
        frame.block_exits.insert(frame.current_block, resume);
        Ok(())
    }

    /// The final return of a blocking function: reactivate the parent and
    /// release the frame.
    pub(crate) fn lower_task_return(&mut self, frame: &mut Frame<'ctx, '_>) -> Result<()> {
        let (handle, parent_slot) = {
            let task = frame.task.as_ref().expect("blocking frame");
            (task.handle, task.parent_slot)
        };
        let parent = self.builder.build_load(parent_slot, "task.parent")?;
        self.runtime_call("free", &[handle.into()], "")?;
        // A null parent (spawned task) is a scheduler no-op.
        self.runtime_call("yieldToScheduler", &[parent.into()], "")?;
        self.builder.build_return(None)?;
        Ok(())
    }

    /// Terminate the resume function's entry block with the state dispatch.
    pub(crate) fn finish_task(&mut self, frame: &mut Frame<'ctx, '_>) -> Result<()> {
        let task = frame
            .task
            .as_ref()
            .ok_or_else(|| CompileError::internal("finishing a non-blocking frame"))?;

        let invalid = self.context.append_basic_block(frame.llvm_fn, "task.invalid");
        self.builder.position_at_end(invalid);
        self.builder.build_unreachable()?;

        let first = *frame
            .block_entries
            .get(&crate::ssa::BlockId::ENTRY)
            .ok_or_else(|| CompileError::internal("blocking function has no entry block"))?;
        let i32t = self.context.i32_type();
        let mut cases = vec![(i32t.const_int(0, false), first)];
        for &(state, bb) in &task.resume_blocks {
            cases.push((i32t.const_int(state as u64, false), bb));
        }

        self.builder.position_at_end(task.entry);
        self.builder.build_switch(task.state_value, invalid, &cases)?;
        Ok(())
    }
}

fn slot_field(fields: &[(ValueId, u32, SlotKind)], vid: ValueId) -> Result<u32> {
    fields
        .iter()
        .find(|(v, _, _)| *v == vid)
        .map(|(_, f, _)| *f)
        .ok_or_else(|| CompileError::internal("value has no task-frame slot"))
}
