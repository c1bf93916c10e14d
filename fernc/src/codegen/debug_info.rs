//! DWARF debug metadata.
//!
//! When the session is configured with `debug`, every function with source
//! syntax gets a subprogram, parameters get parameter-variable entries and
//! each lowered instruction carries its source line and column. Files and
//! type entries are cached here for the lifetime of the session.

use std::collections::HashMap;

use inkwell::context::Context;
use inkwell::debug_info::{
    AsDIScope, DICompileUnit, DIFile, DIFlags, DIFlagsConstants, DILocation, DISubprogram, DIType,
    DWARFEmissionKind, DWARFSourceLanguage, DebugInfoBuilder,
};
use inkwell::module::Module;

use crate::ssa::Program;

/// DWARF base type encodings.
const DW_ATE_ADDRESS: u32 = 0x01;
const DW_ATE_BOOLEAN: u32 = 0x02;
const DW_ATE_COMPLEX_FLOAT: u32 = 0x03;
const DW_ATE_FLOAT: u32 = 0x04;
const DW_ATE_SIGNED: u32 = 0x05;
const DW_ATE_UNSIGNED: u32 = 0x07;

/// A basic-type request prepared by the session (name, size, encoding), so
/// this module never needs to reach back into type lowering.
#[derive(Debug, Clone)]
pub(crate) struct DiTypeSpec {
    pub name: String,
    pub size_bits: u64,
    pub encoding: DiEncoding,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum DiEncoding {
    Boolean,
    Float,
    ComplexFloat,
    Signed,
    Unsigned,
    Address,
}

impl DiEncoding {
    fn dwarf(self) -> u32 {
        match self {
            DiEncoding::Boolean => DW_ATE_BOOLEAN,
            DiEncoding::Float => DW_ATE_FLOAT,
            DiEncoding::ComplexFloat => DW_ATE_COMPLEX_FLOAT,
            DiEncoding::Signed => DW_ATE_SIGNED,
            DiEncoding::Unsigned => DW_ATE_UNSIGNED,
            DiEncoding::Address => DW_ATE_ADDRESS,
        }
    }
}

/// Debug-info state for one compile session.
pub struct DebugInfo<'ctx> {
    builder: DebugInfoBuilder<'ctx>,
    compile_unit: DICompileUnit<'ctx>,
    /// Source file cache.
    files: HashMap<String, DIFile<'ctx>>,
    /// Debug type cache, keyed by rendered type name.
    types: HashMap<String, DIType<'ctx>>,
}

impl<'ctx> DebugInfo<'ctx> {
    pub(crate) fn new(_context: &'ctx Context, module: &Module<'ctx>, program: &Program) -> Self {
        // The compile unit points at the first file with real syntax; a
        // program of nothing but synthesized functions gets a placeholder.
        let main_path = program
            .functions
            .iter()
            .find(|f| f.pos.is_known())
            .map(|f| f.pos.file.clone())
            .unwrap_or_else(|| "<unknown>".to_string());
        let (directory, filename) = split_path(&main_path);

        let (builder, compile_unit) = module.create_debug_info_builder(
            true,
            DWARFSourceLanguage::Go,
            &filename,
            &directory,
            "fernc",
            true, // is_optimized
            "",
            0,
            "",
            DWARFEmissionKind::Full,
            0,
            false,
            false,
            "",
            "",
        );

        let mut files = HashMap::new();
        files.insert(main_path, compile_unit.get_file());

        DebugInfo { builder, compile_unit, files, types: HashMap::new() }
    }

    /// Get or create the DIFile for a source path.
    pub(crate) fn file(&mut self, path: &str) -> DIFile<'ctx> {
        if let Some(&f) = self.files.get(path) {
            return f;
        }
        let (directory, filename) = split_path(path);
        let f = self.builder.create_file(&filename, &directory);
        self.files.insert(path.to_string(), f);
        f
    }

    /// Get or create a basic debug type.
    pub(crate) fn basic_type(&mut self, spec: &DiTypeSpec) -> Option<DIType<'ctx>> {
        if let Some(&t) = self.types.get(&spec.name) {
            return Some(t);
        }
        let t = self
            .builder
            .create_basic_type(&spec.name, spec.size_bits, spec.encoding.dwarf(), DIFlags::ZERO)
            .ok()?
            .as_type();
        self.types.insert(spec.name.clone(), t);
        Some(t)
    }

    /// Create the subprogram for a function and its parameter variables.
    pub(crate) fn subprogram(
        &mut self,
        name: &str,
        link_name: &str,
        path: &str,
        line: u32,
        params: &[(String, DiTypeSpec)],
    ) -> DISubprogram<'ctx> {
        let file = self.file(path);
        let param_types: Vec<DIType<'ctx>> =
            params.iter().filter_map(|(_, spec)| self.basic_type(spec)).collect();
        let fn_type =
            self.builder
                .create_subroutine_type(file, None, &param_types, DIFlags::ZERO);
        let scope = self.compile_unit.as_debug_info_scope();
        let subprogram = self.builder.create_function(
            scope,
            name,
            Some(link_name),
            file,
            line,
            fn_type,
            true, // local to unit
            true, // definition
            line,
            DIFlags::PROTOTYPED,
            true, // optimized
        );
        for (i, (pname, spec)) in params.iter().enumerate() {
            if let Some(ty) = self.basic_type(spec) {
                self.builder.create_parameter_variable(
                    subprogram.as_debug_info_scope(),
                    pname,
                    i as u32 + 1,
                    file,
                    line,
                    ty,
                    true,
                    DIFlags::ZERO,
                );
            }
        }
        subprogram
    }

    /// A source location in the given scope.
    pub(crate) fn location(
        &self,
        context: &'ctx Context,
        line: u32,
        column: u32,
        scope: DISubprogram<'ctx>,
    ) -> DILocation<'ctx> {
        self.builder
            .create_debug_location(context, line, column, scope.as_debug_info_scope(), None)
    }

    /// Must run once after all metadata has been added.
    pub(crate) fn finalize(&self) {
        self.builder.finalize();
    }
}

fn split_path(path: &str) -> (String, String) {
    match path.rfind('/') {
        Some(idx) => (path[..idx].to_string(), path[idx + 1..].to_string()),
        None => (".".to_string(), path.to_string()),
    }
}
