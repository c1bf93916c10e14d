//! Per-function instruction lowering.
//!
//! Blocks are visited in dominator pre-order so definitions are lowered
//! before their non-φ uses. φ-nodes are handled in two passes: created
//! empty where they appear, then given their incoming edges once every
//! block has been emitted. Incoming edges always reference the
//! predecessor's *exit* block — a block may be split by suspension points,
//! and the exit is where control actually leaves it.

mod call;
mod expr;
mod instr;

use std::collections::HashMap;

use inkwell::basic_block::BasicBlock;
use inkwell::debug_info::DISubprogram;
use inkwell::module::Linkage;
use inkwell::values::{
    BasicValue, BasicValueEnum, FunctionValue, PhiValue, PointerValue, UnnamedAddress,
};
use inkwell::AddressSpace;

use tracing::trace;

use crate::diagnostics::{CompileError, Result};
use crate::ssa::dom::dom_preorder;
use crate::ssa::{
    BlockId, FuncId, Function, Instr, Operand, Program, Type, ValueId, ValueKind,
};
use crate::span::Position;

use super::debug_info::{DiEncoding, DiTypeSpec};
use super::runtime::shapes;
use super::session::Session;
use super::tasks::TaskFrame;

/// Calling convention number for AVR interrupt handlers.
const AVR_SIGNAL_CALL_CONV: u32 = 85;

/// Transient per-function lowering state.
pub(crate) struct Frame<'ctx, 'p> {
    pub func_id: FuncId,
    pub func: &'p Function,
    /// The LLVM function whose body is being filled. For blocking
    /// functions this is the resume function, not the declared ramp.
    pub llvm_fn: FunctionValue<'ctx>,
    /// Already-lowered SSA values. In blocking functions only values whose
    /// LLVM value is recomputed in the entry block live here; everything
    /// else goes through task-frame slots.
    pub locals: HashMap<ValueId, BasicValueEnum<'ctx>>,
    /// First LLVM block of each SSA block.
    pub block_entries: HashMap<BlockId, BasicBlock<'ctx>>,
    /// LLVM block executing each SSA block's terminator. Differs from the
    /// entry when suspension points split the block.
    pub block_exits: HashMap<BlockId, BasicBlock<'ctx>>,
    pub current_block: BlockId,
    /// φ-nodes awaiting their incoming edges.
    pub phis: Vec<PendingPhi<'ctx>>,
    /// Coroutine state for blocking functions.
    pub task: Option<TaskFrame<'ctx>>,
    /// Head slot of the defer linked list, when the function defers.
    pub defer_head: Option<PointerValue<'ctx>>,
    pub di_func: Option<DISubprogram<'ctx>>,
}

pub(crate) struct PendingPhi<'ctx> {
    pub phi: PhiValue<'ctx>,
    pub value_id: ValueId,
    pub block: BlockId,
    pub edges: Vec<Operand>,
}

impl<'ctx, 'p> Frame<'ctx, 'p> {
    pub(crate) fn is_blocking(&self) -> bool {
        self.task.is_some()
    }
}

impl<'ctx> Session<'ctx> {
    /// Lower one SSA function body into its declared LLVM function.
    pub(crate) fn lower_function(&mut self, program: &Program, id: FuncId) -> Result<()> {
        let func = program.func(id);
        let declared = self.llvm_function(program, id)?;

        if self.config.dump_ssa {
            println!("\nfunc {}:", func.link_name);
        }

        if !func.exported {
            declared.set_linkage(Linkage::Internal);
            declared.as_global_value().set_unnamed_address(UnnamedAddress::Global);
        }
        if func.interrupt && self.triple.starts_with("avr") {
            declared.set_call_conventions(AVR_SIGNAL_CALL_CONV);
        }

        let di_func = self.attach_debug_info(func, declared, "")?;
        // A location left over from the previous function would attach its
        // scope to this one's instructions.
        self.builder.unset_current_debug_location();

        let mut frame = Frame {
            func_id: id,
            func,
            llvm_fn: declared,
            locals: HashMap::new(),
            block_entries: HashMap::new(),
            block_exits: HashMap::new(),
            current_block: BlockId::ENTRY,
            phis: Vec::new(),
            task: None,
            defer_head: None,
            di_func,
        };

        let order = dom_preorder(func);

        if func.blocking {
            // Build the ramp, switch the frame over to the resume function
            // and precompute the frame slots in its entry block.
            self.set_debug_location(&frame, &func.pos);
            self.begin_task(program, &mut frame)?;
            frame.di_func = self.attach_debug_info(func, frame.llvm_fn, "$task")?;
        }

        // Pre-create the LLVM blocks so forward branches resolve. For
        // non-split blocks the exit block is the entry block.
        for &b in &order {
            let name = block_name(func, b);
            let bb = self.context.append_basic_block(frame.llvm_fn, &name);
            frame.block_entries.insert(b, bb);
            frame.block_exits.insert(b, bb);
        }

        let entry_bb = *frame
            .block_entries
            .get(&BlockId::ENTRY)
            .ok_or_else(|| CompileError::internal("function has no entry block"))?;

        self.builder.position_at_end(entry_bb);
        self.set_debug_location(&frame, &func.pos);
        if !func.blocking {
            // Blocking parameters were already spilled by the ramp.
            self.lower_prologue(frame.func, &mut frame)?;
        }

        for &b in &order {
            self.lower_block(program, &mut frame, b)?;
        }

        self.resolve_phis(program, &mut frame)?;

        if func.blocking {
            self.finish_task(&mut frame)?;
        }
        Ok(())
    }

    /// Bind parameters and free variables for a non-blocking function. The
    /// builder is positioned in the entry block.
    fn lower_prologue(&mut self, func: &Function, frame: &mut Frame<'ctx, '_>) -> Result<()> {
        let all_params = frame.llvm_fn.get_params();
        let mut cursor = 0usize;
        for &pid in &func.params {
            let ty = param_type(func, pid)?;
            let llvm_ty = self.lower_type(&ty)?;
            let value = self.collapse_param(llvm_ty, &mut || {
                let v = all_params.get(cursor).copied().ok_or_else(|| {
                    CompileError::internal("parameter fragment count mismatch")
                })?;
                cursor += 1;
                Ok(v)
            })?;
            frame.locals.insert(pid, value);
        }

        if !func.free_vars.is_empty() {
            let context_ptr = self.context_param(frame)?;
            let free_ptrs = self.unpack_context(func, frame.llvm_fn, context_ptr)?;
            for (&fv, value) in func.free_vars.iter().zip(free_ptrs) {
                frame.locals.insert(fv, value);
            }
        }

        if func.has_defers {
            let defer_ptr_ty =
                self.named_struct(shapes::DEFER)?.ptr_type(AddressSpace::default());
            let slot = self.builder.build_alloca(defer_ptr_ty, "deferPtr")?;
            self.builder.build_store(slot, defer_ptr_ty.const_null())?;
            frame.defer_head = Some(slot);
        }
        Ok(())
    }

    /// The trailing context parameter of a context-taking function.
    pub(crate) fn context_param(&self, frame: &Frame<'ctx, '_>) -> Result<PointerValue<'ctx>> {
        if !frame.func.needs_context {
            return Err(CompileError::internal(format!(
                "free variables on {} but no context parameter",
                frame.func.link_name
            )));
        }
        let last = frame
            .llvm_fn
            .get_last_param()
            .ok_or_else(|| CompileError::internal("context-taking function has no parameters"))?;
        let ptr = last.into_pointer_value();
        ptr.set_name("context");
        Ok(ptr)
    }

    /// Load the free variables out of a context pointer. Contexts that fit
    /// in a pointer are stored inline in the pointer itself, so they are
    /// read back through a reinterpreted stack slot; larger contexts are a
    /// heap pointer.
    pub(crate) fn unpack_context(
        &mut self,
        func: &Function,
        _llvm_fn: FunctionValue<'ctx>,
        context: PointerValue<'ctx>,
    ) -> Result<Vec<BasicValueEnum<'ctx>>> {
        let mut var_tys = Vec::with_capacity(func.free_vars.len());
        for &fv in &func.free_vars {
            let ty = param_type(func, fv)?;
            var_tys.push(self.lower_type(&ty)?);
        }
        let context_ty = self.context.struct_type(&var_tys, false);
        let context_ptr_ty = context_ty.ptr_type(AddressSpace::default());

        let typed = if self.size_of(context_ty.into()) <= self.pointer_size() as u64 {
            // The pointer bits are the context: spill them to a slot and
            // reinterpret the slot.
            let slot = self.builder.build_alloca(self.i8_ptr_type, "context.inline")?;
            self.builder.build_store(slot, context)?;
            self.builder.build_pointer_cast(slot, context_ptr_ty, "context.frame")?
        } else {
            self.builder.build_pointer_cast(context, context_ptr_ty, "context.frame")?
        };

        let mut out = Vec::with_capacity(func.free_vars.len());
        for i in 0..func.free_vars.len() {
            let gep = self.builder.build_struct_gep(typed, i as u32, "freevar.ptr")?;
            out.push(self.builder.build_load(gep, "freevar")?);
        }
        Ok(out)
    }

    /// Lower the instructions of one SSA block. Leading φ-nodes are created
    /// as a group so their spill stores (in blocking functions) come after
    /// the φ cluster.
    fn lower_block(
        &mut self,
        program: &Program,
        frame: &mut Frame<'ctx, '_>,
        block: BlockId,
    ) -> Result<()> {
        let entry = *frame
            .block_entries
            .get(&block)
            .ok_or_else(|| CompileError::internal("block was not pre-created"))?;
        self.builder.position_at_end(entry);
        frame.current_block = block;

        if self.config.dump_ssa {
            println!("{}: {}:", block.0, frame.func.block(block).comment);
        }

        let instrs = &frame.func.block(block).instrs;
        let mut idx = 0;

        // φ cluster first.
        let mut new_phis: Vec<(ValueId, PhiValue<'ctx>)> = Vec::new();
        while let Some(&vid) = instrs.get(idx) {
            let Some(Instr::Phi { edges, comment }) = frame.func.instr(vid) else { break };
            let ty = frame.func.value(vid).ty.clone().ok_or_else(|| {
                CompileError::internal("untyped phi")
            })?;
            let llvm_ty = self.lower_type(&ty)?;
            let phi = self.builder.build_phi(llvm_ty, comment)?;
            frame.phis.push(PendingPhi {
                phi,
                value_id: vid,
                block,
                edges: edges.clone(),
            });
            new_phis.push((vid, phi));
            idx += 1;
        }
        for (vid, phi) in new_phis {
            self.bind_value(frame, vid, phi.as_basic_value())?;
        }

        while let Some(&vid) = instrs.get(idx) {
            idx += 1;
            let data = frame.func.value(vid);
            let ValueKind::Instr(instr) = &data.kind else {
                return Err(CompileError::internal("non-instruction in block body"));
            };
            if matches!(instr, Instr::Phi { .. }) {
                return Err(CompileError::internal("phi after non-phi instruction"));
            }
            if self.config.dump_ssa {
                println!("\t{:?}", instr);
            }
            trace!(block = block.0, value = vid.0, "lowering instruction");
            self.set_debug_location(frame, &data.pos);
            self.lower_instr(program, frame, vid, instr)?;
        }
        Ok(())
    }

    fn lower_instr(
        &mut self,
        program: &Program,
        frame: &mut Frame<'ctx, '_>,
        vid: ValueId,
        instr: &Instr,
    ) -> Result<()> {
        if is_value_instr(instr) {
            match self.lower_expr(program, frame, vid, instr) {
                Ok(Some(value)) => self.bind_value(frame, vid, value),
                Ok(None) => Ok(()),
                // Skipped foreign-glue node: leave the value unbound.
                Err(CompileError::ForeignGlue) => Ok(()),
                Err(e) => Err(e),
            }
        } else {
            self.lower_stmt(program, frame, vid, instr)
        }
    }

    /// Record the LLVM value of an SSA value: a spill store in blocking
    /// functions, a map entry otherwise.
    pub(crate) fn bind_value(
        &mut self,
        frame: &mut Frame<'ctx, '_>,
        vid: ValueId,
        value: BasicValueEnum<'ctx>,
    ) -> Result<()> {
        if let Some(task) = &frame.task {
            if let Some(&slot) = task.slots.get(&vid) {
                self.builder.build_store(slot, value)?;
                return Ok(());
            }
        }
        frame.locals.insert(vid, value);
        Ok(())
    }

    /// The LLVM value of an SSA value at the current insertion point.
    pub(crate) fn read_value(
        &mut self,
        frame: &Frame<'ctx, '_>,
        vid: ValueId,
    ) -> Result<BasicValueEnum<'ctx>> {
        if let Some(task) = &frame.task {
            if let Some(&slot) = task.slots.get(&vid) {
                return Ok(self.builder.build_load(slot, "")?);
            }
        }
        frame.locals.get(&vid).copied().ok_or_else(|| {
            CompileError::internal(format!(
                "value used before definition in {}",
                frame.func.link_name
            ))
        })
    }

    /// Resolve an operand to its LLVM value at the current insertion point.
    pub(crate) fn resolve_operand(
        &mut self,
        program: &Program,
        frame: &Frame<'ctx, '_>,
        op: &Operand,
    ) -> Result<BasicValueEnum<'ctx>> {
        match op {
            Operand::Value(vid) => self.read_value(frame, *vid),
            Operand::Const(c) => self.parse_const(&frame.func.link_name, c),
            Operand::Global(gid) => {
                let g = program.global(*gid);
                if g.name.starts_with("__ffi_") || g.name.starts_with("_ffi_") {
                    // Foreign-glue marker globals are never materialised.
                    return Err(CompileError::ForeignGlue);
                }
                let global = self.globals.get(gid).copied().ok_or_else(|| {
                    CompileError::UndefinedGlobal(g.link_name.clone())
                })?;
                Ok(global.as_pointer_value().into())
            }
            Operand::Function(fid) => {
                let func = program.func(*fid);
                let llvm_fn = self.llvm_function(program, *fid)?;
                let ptr = llvm_fn.as_global_value().as_pointer_value();
                if func.sig.needs_context {
                    // Bare function used as a closure value: null context.
                    Ok(self
                        .context
                        .const_struct(&[self.i8_ptr_type.const_null().into(), ptr.into()], false)
                        .into())
                } else {
                    Ok(ptr.into())
                }
            }
            Operand::RegisterMap(_) => Err(CompileError::internal(
                "register map operand outside inline assembly",
            )),
        }
    }

    /// The SSA type of an operand.
    pub(crate) fn operand_type(
        &self,
        program: &Program,
        func: &Function,
        op: &Operand,
    ) -> Result<Type> {
        match op {
            Operand::Value(vid) => func.value(*vid).ty.clone().ok_or_else(|| {
                CompileError::internal("operand references a void value")
            }),
            Operand::Const(c) => Ok(c.ty.clone()),
            Operand::Global(gid) => Ok(Type::pointer(program.global(*gid).ty.clone())),
            Operand::Function(fid) => {
                Ok(Type::signature(program.func(*fid).sig.clone()))
            }
            Operand::RegisterMap(_) => Err(CompileError::internal(
                "register map operand outside inline assembly",
            )),
        }
    }

    /// Patch φ incoming edges. Every edge references the predecessor's exit
    /// block; in blocking functions the incoming values are loads emitted
    /// just before that block's terminator.
    fn resolve_phis(&mut self, program: &Program, frame: &mut Frame<'ctx, '_>) -> Result<()> {
        let pending = std::mem::take(&mut frame.phis);
        for p in &pending {
            let preds = &frame.func.block(p.block).preds;
            if preds.len() != p.edges.len() {
                return Err(CompileError::internal(format!(
                    "phi {} has {} edges for {} predecessors in {}",
                    p.value_id.0,
                    p.edges.len(),
                    preds.len(),
                    frame.func.link_name
                )));
            }
            for (edge, &pred) in p.edges.iter().zip(preds) {
                let exit = *frame.block_exits.get(&pred).ok_or_else(|| {
                    CompileError::internal("phi predecessor has no exit block")
                })?;
                let terminator = exit.get_terminator().ok_or_else(|| {
                    CompileError::internal("phi predecessor exit block is unterminated")
                })?;
                self.builder.position_before(&terminator);
                let value = self.resolve_operand(program, frame, edge)?;
                p.phi.add_incoming(&[(&value as &dyn BasicValue<'ctx>, exit)]);
            }
        }
        Ok(())
    }

    /// Prepare and attach a DWARF subprogram. Returns `None` when debug
    /// info is disabled or the function has no source syntax.
    fn attach_debug_info(
        &mut self,
        func: &Function,
        llvm_fn: FunctionValue<'ctx>,
        suffix: &str,
    ) -> Result<Option<DISubprogram<'ctx>>> {
        if self.di.is_none() || (!func.pos.is_known() && func.synthetic.is_none()) {
            return Ok(None);
        }
        let mut params = Vec::with_capacity(func.params.len());
        for &pid in &func.params {
            let ty = param_type(func, pid)?;
            let name = match &func.value(pid).kind {
                ValueKind::Param { name, .. } => name.clone(),
                _ => String::new(),
            };
            params.push((name, self.di_type_spec(&ty)?));
        }
        let di = self.di.as_mut().expect("checked above");
        let sp = di.subprogram(
            &format!("{}{}", func.name, suffix),
            &format!("{}{}", func.link_name, suffix),
            &func.pos.file,
            func.pos.line,
            &params,
        );
        llvm_fn.set_subprogram(sp);
        Ok(Some(sp))
    }

    /// Describe a type for DWARF as a basic type: name, allocated size and
    /// encoding.
    fn di_type_spec(&self, ty: &Type) -> Result<DiTypeSpec> {
        let llvm_ty = self.lower_type(ty)?;
        let size_bits = self.size_of(llvm_ty) * 8;
        let underlying = self.underlying(ty)?;
        let encoding = match underlying.kind() {
            crate::ssa::TypeKind::Bool => DiEncoding::Boolean,
            crate::ssa::TypeKind::Float32 | crate::ssa::TypeKind::Float64 => DiEncoding::Float,
            crate::ssa::TypeKind::Complex64 | crate::ssa::TypeKind::Complex128 => {
                DiEncoding::ComplexFloat
            }
            crate::ssa::TypeKind::UnsafePointer | crate::ssa::TypeKind::Pointer(_) => {
                DiEncoding::Address
            }
            _ if underlying.is_integer() && !underlying.is_signed() => DiEncoding::Unsigned,
            _ => DiEncoding::Signed,
        };
        Ok(DiTypeSpec { name: ty.describe(), size_bits, encoding })
    }

    /// Point the builder's debug location at a source position. Positions
    /// without syntax get a line-zero location so every call inside a
    /// function with a subprogram still carries its scope.
    pub(crate) fn set_debug_location(&self, frame: &Frame<'ctx, '_>, pos: &Position) {
        let (Some(di), Some(scope)) = (&self.di, frame.di_func) else { return };
        let loc = di.location(self.context, pos.line, pos.column, scope);
        self.builder.set_current_debug_location(loc);
    }
}

/// The SSA-declared type of a parameter or free variable.
fn param_type(func: &Function, vid: ValueId) -> Result<Type> {
    func.value(vid)
        .ty
        .clone()
        .ok_or_else(|| CompileError::internal(format!("untyped value in {}", func.link_name)))
}

fn block_name(func: &Function, b: BlockId) -> String {
    let comment = &func.block(b).comment;
    if comment.is_empty() {
        format!("bb{}", b.0)
    } else {
        comment.clone()
    }
}

fn is_value_instr(instr: &Instr) -> bool {
    !matches!(
        instr,
        Instr::Store { .. }
            | Instr::If { .. }
            | Instr::Jump
            | Instr::Return { .. }
            | Instr::Panic { .. }
            | Instr::Defer(_)
            | Instr::Go(_)
            | Instr::RunDefers
            | Instr::MapUpdate { .. }
    )
}
