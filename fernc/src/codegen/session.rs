//! The compile session.
//!
//! A [`Session`] owns the LLVM context handles, the target description and
//! every cache the lowering needs (named aggregates, declared functions and
//! globals, runtime declarations, pending defer thunks, debug files and
//! types). Bundling all of it in one value keeps the compiler free of
//! ambient state and re-entrant from a test harness.
//!
//! A session compiles exactly one program and is single-threaded; the
//! driver may run it inside a thread but must not share it.

use std::collections::{HashMap, HashSet};

use inkwell::builder::Builder;
use inkwell::context::Context;
use inkwell::module::{FlagBehavior, Linkage, Module};
use inkwell::targets::{
    CodeModel, InitializationConfig, RelocMode, Target, TargetData, TargetMachine, TargetTriple,
};
use inkwell::types::{BasicTypeEnum, IntType, PointerType, StructType};
use inkwell::values::{BasicMetadataValueEnum, FunctionValue, GlobalValue, UnnamedAddress};
use inkwell::{AddressSpace, OptimizationLevel};

use tracing::debug;

use crate::diagnostics::{CompileError, Result};
use crate::ssa::{FuncId, GlobalId, NamedTypeDef, Program, Type, TypeKind};

use super::debug_info::DebugInfo;
use super::defers::PendingThunk;
use super::runtime::shapes;
use super::Config;

/// A single compilation session: one LLVM module, walked-once SSA input.
pub struct Session<'ctx> {
    pub(crate) context: &'ctx Context,
    pub(crate) module: Module<'ctx>,
    pub(crate) builder: Builder<'ctx>,
    pub(crate) machine: TargetMachine,
    pub(crate) target_data: TargetData,
    pub(crate) config: Config,
    /// The resolved triple as a string, for target-family decisions.
    pub(crate) triple: String,

    /// Platform `int`/`uint` width. Fixed at 32 bits.
    pub(crate) int_type: IntType<'ctx>,
    /// Pointer-width integer.
    pub(crate) uintptr_type: IntType<'ctx>,
    /// Width of slice/string lengths: 32-bit on targets with pointers of at
    /// least 4 bytes, pointer-width below that.
    pub(crate) len_type: IntType<'ctx>,
    /// Byte pointer, kept around for convenience.
    pub(crate) i8_ptr_type: PointerType<'ctx>,

    /// The named aggregate cache: fully-qualified type name to LLVM named
    /// struct. Every entry is declared (opaque) before any body is set, and
    /// each body is set exactly once.
    pub(crate) named_structs: HashMap<String, StructType<'ctx>>,
    /// Named type definitions copied from the program at compile start.
    pub(crate) named_defs: HashMap<String, NamedTypeDef>,
    /// Declared SSA functions. For blocking functions this is the ramp.
    pub(crate) functions: HashMap<FuncId, FunctionValue<'ctx>>,
    pub(crate) globals: HashMap<GlobalId, GlobalValue<'ctx>>,
    /// Lazily-declared runtime helpers, keyed by unprefixed name.
    pub(crate) runtime_fns: HashMap<String, FunctionValue<'ctx>>,
    /// External marker globals for the interface-lowering pass
    /// (`typecode:…`, `methodset:…`, `itfmethods:…`, `signature:…`).
    pub(crate) marker_globals: HashMap<String, GlobalValue<'ctx>>,
    /// Package initializers, in call order for `runtime.initAll`.
    pub(crate) init_funcs: Vec<FunctionValue<'ctx>>,
    /// Defer thunks declared at defer sites, awaiting bodies. Keyed cache
    /// lives next to it so thunks are shared per callee/signature.
    pub(crate) pending_thunks: Vec<PendingThunk<'ctx>>,
    pub(crate) thunk_cache: HashMap<String, FunctionValue<'ctx>>,

    pub(crate) di: Option<DebugInfo<'ctx>>,
}

impl<'ctx> Session<'ctx> {
    /// Create a session for the given target. An empty triple selects the
    /// host default.
    pub fn new(context: &'ctx Context, module_name: &str, config: Config) -> Result<Self> {
        Target::initialize_all(&InitializationConfig::default());

        let triple = if config.triple.is_empty() {
            TargetMachine::get_default_triple()
        } else {
            TargetTriple::create(&config.triple)
        };
        let target = Target::from_triple(&triple)
            .map_err(|e| CompileError::Target(e.to_string()))?;
        let machine = target
            .create_target_machine(
                &triple,
                "",
                "",
                OptimizationLevel::Default,
                RelocMode::Static,
                CodeModel::Default,
            )
            .ok_or_else(|| {
                CompileError::Target(format!("no machine for triple {:?}", triple))
            })?;
        let target_data = machine.get_target_data();
        let triple_str = triple.as_str().to_string_lossy().into_owned();

        let module = context.create_module(module_name);
        module.set_triple(&triple);
        module.set_data_layout(&target_data.get_data_layout());
        let builder = context.create_builder();

        let int_type = context.i32_type();
        let ptr_bytes = target_data.get_pointer_byte_size(None);
        let uintptr_type = context.custom_width_int_type(ptr_bytes * 8);
        let len_type = if ptr_bytes < 4 { uintptr_type } else { context.i32_type() };
        let i8_ptr_type = context.i8_type().ptr_type(AddressSpace::default());

        let mut session = Session {
            context,
            module,
            builder,
            machine,
            target_data,
            config,
            triple: triple_str,
            int_type,
            uintptr_type,
            len_type,
            i8_ptr_type,
            named_structs: HashMap::new(),
            named_defs: HashMap::new(),
            functions: HashMap::new(),
            globals: HashMap::new(),
            runtime_fns: HashMap::new(),
            marker_globals: HashMap::new(),
            init_funcs: Vec::new(),
            pending_thunks: Vec::new(),
            thunk_cache: HashMap::new(),
            di: None,
        };
        session.declare_runtime_shapes();
        Ok(session)
    }

    /// Declare the named aggregates shared with the runtime library. Their
    /// bit layout is contractual; see `codegen/runtime.rs`.
    fn declare_runtime_shapes(&mut self) {
        let ctx = self.context;
        let len = self.len_type;
        let i8t = ctx.i8_type();
        let i8p = self.i8_ptr_type;

        let string = ctx.opaque_struct_type(shapes::STRING);
        string.set_body(&[i8p.into(), len.into()], false);

        let interface = ctx.opaque_struct_type(shapes::INTERFACE);
        interface.set_body(&[ctx.i16_type().into(), i8p.into()], false);

        let hashmap = ctx.opaque_struct_type(shapes::HASHMAP);
        let hashmap_ptr = hashmap.ptr_type(AddressSpace::default());
        hashmap.set_body(
            &[
                hashmap_ptr.into(), // next map (grown maps chain)
                i8p.into(),         // first bucket
                len.into(),         // count
                i8t.into(),         // key size
                i8t.into(),         // value size
                i8t.into(),         // bucket bits
            ],
            false,
        );

        // Only ever used through a pointer; the body is the runtime's
        // business.
        let channel = ctx.opaque_struct_type(shapes::CHANNEL);

        let defer = ctx.opaque_struct_type(shapes::DEFER);
        let defer_ptr = defer.ptr_type(AddressSpace::default());
        let thunk_ptr = ctx
            .void_type()
            .fn_type(&[defer_ptr.into()], false)
            .ptr_type(AddressSpace::default());
        defer.set_body(&[thunk_ptr.into(), defer_ptr.into()], false);

        let task_state = ctx.opaque_struct_type(shapes::TASK_STATE);
        task_state.set_body(&[i8p.into(), ctx.i32_type().into(), ctx.i64_type().into()], false);

        let string_it = ctx.opaque_struct_type(shapes::STRING_ITERATOR);
        string_it.set_body(&[len.into(), len.into()], false);

        let map_it = ctx.opaque_struct_type(shapes::HASHMAP_ITERATOR);
        map_it.set_body(&[i8p.into(), len.into(), i8t.into()], false);

        for (name, st) in [
            (shapes::STRING, string),
            (shapes::INTERFACE, interface),
            (shapes::HASHMAP, hashmap),
            (shapes::CHANNEL, channel),
            (shapes::DEFER, defer),
            (shapes::TASK_STATE, task_state),
            (shapes::STRING_ITERATOR, string_it),
            (shapes::HASHMAP_ITERATOR, map_it),
        ] {
            self.named_structs.insert(name.to_string(), st);
        }
    }

    /// Compile a whole program into the session's module.
    pub fn compile(&mut self, program: &Program) -> Result<()> {
        for def in &program.named_types {
            self.named_defs.insert(def.name.clone(), def.clone());
        }

        // Declare all named struct aggregates first, then fill the bodies.
        // The two-phase split is what lets mutually pointer-referencing
        // definitions resolve.
        for def in &program.named_types {
            if matches!(def.underlying.kind(), TypeKind::Struct(_)) {
                if self.named_structs.contains_key(&def.name) {
                    return Err(CompileError::internal(format!(
                        "named type declared twice: {}",
                        def.name
                    )));
                }
                let st = self.context.opaque_struct_type(&def.name);
                self.named_structs.insert(def.name.clone(), st);
            }
        }
        for def in &program.named_types {
            if let TypeKind::Struct(fields) = def.underlying.kind() {
                let mut body = Vec::with_capacity(fields.len());
                for field in fields {
                    body.push(self.lower_type(&field.ty)?);
                }
                let st = self.named_struct(&def.name)?;
                st.set_body(&body, false);
            }
        }

        if self.config.debug {
            self.di = Some(DebugInfo::new(self.context, &self.module, program));
        }

        // Globals get declarations now and interpreted initializers after
        // the package initializers are compiled.
        for (i, g) in program.globals.iter().enumerate() {
            let llvm_ty = self.lower_type(&g.ty)?;
            let global = self.module.add_global(llvm_ty, None, &g.link_name);
            if !g.extern_linkage {
                global.set_linkage(Linkage::Internal);
                global.set_initializer(&self.zero_value(llvm_ty)?);
            }
            self.globals.insert(GlobalId(i as u32), global);
        }

        for (i, func) in program.functions.iter().enumerate() {
            self.declare_function(program, FuncId(i as u32), func)?;
        }

        // Package initializers first: their side effects define the global
        // initializers the materialiser did not fold.
        let mut lowered = HashSet::new();
        for &fid in &program.init_order {
            let func = program.func(fid);
            if func.is_declaration() {
                continue;
            }
            debug!(name = %func.link_name, "lowering package initializer");
            self.lower_function(program, fid)?;
            lowered.insert(fid);
            let llvm_fn = self.functions[&fid];
            self.init_funcs.push(llvm_fn);
        }

        for (i, g) in program.globals.iter().enumerate() {
            if let Some(init) = &g.initializer {
                let value = self.materialise(&g.link_name, program, init)?;
                self.globals[&GlobalId(i as u32)].set_initializer(&value);
            }
        }

        for (i, func) in program.functions.iter().enumerate() {
            let fid = FuncId(i as u32);
            if lowered.contains(&fid) || func.is_declaration() {
                continue;
            }
            debug!(name = %func.link_name, blocking = func.blocking, "lowering function");
            self.lower_function(program, fid)?;
        }

        self.emit_defer_thunks(program)?;
        self.synth_init_all()?;
        self.synth_main_wrapper(program)?;

        // Error on mismatch; see the LLVM release notes that introduced the
        // module flag.
        self.module.add_basic_value_flag(
            "Debug Info Version",
            FlagBehavior::Error,
            self.context.i32_type().const_int(3, false),
        );
        if let Some(di) = &self.di {
            di.finalize();
        }
        Ok(())
    }

    /// Synthesize `runtime.initAll`, calling every package initializer in
    /// dependency order.
    fn synth_init_all(&mut self) -> Result<()> {
        let fn_type = self.context.void_type().fn_type(&[], false);
        let f = self.module.add_function("runtime.initAll", fn_type, Some(Linkage::Internal));
        f.as_global_value().set_unnamed_address(UnnamedAddress::Global);
        let entry = self.context.append_basic_block(f, "entry");
        self.builder.unset_current_debug_location();
        self.builder.position_at_end(entry);
        for init in self.init_funcs.clone() {
            self.builder.build_call(init, &[], "")?;
        }
        self.builder.build_return(None)?;
        Ok(())
    }

    /// Synthesize `runtime.mainWrapper`: start the scheduler on `main.main`
    /// when the program spawns goroutines, call it directly otherwise.
    fn synth_main_wrapper(&mut self, program: &Program) -> Result<()> {
        let fn_type = self.context.void_type().fn_type(&[], false);
        let f = self.module.add_function("runtime.mainWrapper", fn_type, Some(Linkage::Internal));
        f.as_global_value().set_unnamed_address(UnnamedAddress::Global);
        let entry = self.context.append_basic_block(f, "entry");
        self.builder.unset_current_debug_location();
        self.builder.position_at_end(entry);

        if let Some(main_id) = program.main_func {
            let main_fn = self.functions.get(&main_id).copied().ok_or_else(|| {
                CompileError::UndefinedFunction(program.func(main_id).link_name.clone())
            })?;
            if program.needs_scheduler {
                if !program.func(main_id).blocking {
                    return Err(CompileError::internal(
                        "scheduler requested but main.main is not blocking",
                    ));
                }
                let null = self.i8_ptr_type.const_null();
                let handle = self
                    .builder
                    .build_call(main_fn, &[null.into()], "main.task")?
                    .try_as_basic_value()
                    .left()
                    .ok_or_else(|| CompileError::internal("blocking main returned void"))?;
                self.runtime_call("scheduler", &[handle.into()], "")?;
            } else {
                self.builder.build_call(main_fn, &[], "")?;
            }
        }
        self.builder.build_return(None)?;
        Ok(())
    }

    /// Look up a declared named aggregate.
    pub(crate) fn named_struct(&self, name: &str) -> Result<StructType<'ctx>> {
        self.named_structs.get(name).copied().ok_or_else(|| {
            CompileError::UnsupportedType(format!("named type not declared: {}", name))
        })
    }

    /// Resolve a named type to its underlying shape.
    pub(crate) fn underlying(&self, ty: &Type) -> Result<Type> {
        let mut current = ty.clone();
        loop {
            match current.kind() {
                TypeKind::Named(name) => {
                    let def = self.named_defs.get(name).ok_or_else(|| {
                        CompileError::UnsupportedType(format!("named type not defined: {}", name))
                    })?;
                    current = def.underlying.clone();
                }
                _ => return Ok(current),
            }
        }
    }

    /// Whether loads and stores of this type must be volatile.
    pub(crate) fn is_volatile(&self, ty: &Type) -> bool {
        match ty.kind() {
            TypeKind::Named(name) => {
                self.named_defs.get(name).map(|d| d.volatile).unwrap_or(false)
            }
            _ => false,
        }
    }

    /// ABI-allocated size of an LLVM type in bytes.
    pub(crate) fn size_of(&self, ty: BasicTypeEnum<'ctx>) -> u64 {
        self.target_data.get_abi_size(&ty)
    }

    /// Declare (or fetch) one of the external marker globals the interface
    /// lowering pass resolves.
    pub(crate) fn marker_global(
        &mut self,
        prefix: &str,
        key: &str,
        ty: BasicTypeEnum<'ctx>,
    ) -> GlobalValue<'ctx> {
        let name = format!("{}:{}", prefix, key);
        if let Some(&g) = self.marker_globals.get(&name) {
            return g;
        }
        let g = self.module.add_global(ty, None, &name);
        g.set_linkage(Linkage::External);
        self.marker_globals.insert(name, g);
        g
    }

    /// Shorthand for runtime calls whose result is required.
    pub(crate) fn runtime_call_value(
        &mut self,
        name: &str,
        args: &[BasicMetadataValueEnum<'ctx>],
        value_name: &str,
    ) -> Result<inkwell::values::BasicValueEnum<'ctx>> {
        self.runtime_call(name, args, value_name)?.ok_or_else(|| {
            CompileError::internal(format!("runtime.{} unexpectedly returned void", name))
        })
    }

    /// The module as textual IR. Only meaningful after a successful compile.
    pub fn ir(&self) -> String {
        self.module.print_to_string().to_string()
    }

    /// The LLVM module under construction.
    pub fn module(&self) -> &Module<'ctx> {
        &self.module
    }

    /// Pointer size of the configured target, in bytes.
    pub fn pointer_size(&self) -> u32 {
        self.target_data.get_pointer_byte_size(None)
    }
}
