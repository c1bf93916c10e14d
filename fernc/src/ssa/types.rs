//! The Fern type system as delivered by the front end.
//!
//! Types arrive fully resolved: the checker has already run, so the lowering
//! only inspects shapes. [`Type`] is a cheap-to-clone tree; named types are
//! referenced by their fully-qualified name and defined once in
//! [`crate::ssa::Program::named_types`], which is what makes pointer-cyclic
//! definitions (`type Node struct { next *Node }`) expressible.

use std::rc::Rc;

/// A Fern type. Clones share the underlying node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Type(Rc<TypeKind>);

/// The shape of a type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TypeKind {
    Bool,
    Int8,
    Int16,
    Int32,
    Int64,
    Uint8,
    Uint16,
    Uint32,
    Uint64,
    /// Platform-sized signed integer.
    Int,
    /// Platform-sized unsigned integer.
    Uint,
    /// Pointer-width unsigned integer.
    Uintptr,
    Float32,
    Float64,
    Complex64,
    Complex128,
    String,
    /// Untyped memory pointer; lowers to a byte pointer.
    UnsafePointer,
    /// Fixed-length array.
    Array { elem: Type, len: u64 },
    Pointer(Type),
    Slice(Type),
    Map { key: Type, value: Type },
    Chan(Type),
    /// Any interface type. Method sets are resolved by a downstream
    /// interface-lowering pass; the core only needs the box shape.
    Interface,
    Struct(Vec<Field>),
    /// Reference to a named type defined in the program's type table.
    Named(String),
    Signature(Box<Signature>),
    /// Multi-value aggregate produced by multi-result calls, comma-ok
    /// lookups and range iteration. Never a parameter or field type.
    Tuple(Vec<Type>),
}

/// A struct field. A field named `_` is blank and skipped in comparisons.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Field {
    pub name: String,
    pub ty: Type,
}

/// A function signature.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Signature {
    /// Receiver type for methods; expanded into leading parameters.
    pub recv: Option<Type>,
    pub params: Vec<Type>,
    pub results: Vec<Type>,
    /// Whether values of this signature must carry a context pointer
    /// (closure-shaped). Computed by the front end's function-pointer
    /// analysis; the core never re-derives it.
    pub needs_context: bool,
}

/// The definition of a named type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NamedTypeDef {
    /// Fully-qualified name, e.g. `main.Machine`.
    pub name: String,
    pub underlying: Type,
    /// Marked by the volatile pragma: loads and stores through pointers to
    /// this type must not be reordered or elided (memory-mapped registers).
    pub volatile: bool,
}

impl Type {
    pub fn new(kind: TypeKind) -> Self {
        Type(Rc::new(kind))
    }

    pub fn kind(&self) -> &TypeKind {
        &self.0
    }

    pub fn bool() -> Self {
        Type::new(TypeKind::Bool)
    }

    pub fn int() -> Self {
        Type::new(TypeKind::Int)
    }

    pub fn uintptr() -> Self {
        Type::new(TypeKind::Uintptr)
    }

    pub fn string() -> Self {
        Type::new(TypeKind::String)
    }

    pub fn unsafe_pointer() -> Self {
        Type::new(TypeKind::UnsafePointer)
    }

    pub fn pointer(elem: Type) -> Self {
        Type::new(TypeKind::Pointer(elem))
    }

    pub fn slice(elem: Type) -> Self {
        Type::new(TypeKind::Slice(elem))
    }

    pub fn array(elem: Type, len: u64) -> Self {
        Type::new(TypeKind::Array { elem, len })
    }

    pub fn map(key: Type, value: Type) -> Self {
        Type::new(TypeKind::Map { key, value })
    }

    pub fn interface() -> Self {
        Type::new(TypeKind::Interface)
    }

    pub fn strukt(fields: Vec<Field>) -> Self {
        Type::new(TypeKind::Struct(fields))
    }

    pub fn named(name: impl Into<String>) -> Self {
        Type::new(TypeKind::Named(name.into()))
    }

    pub fn tuple(elems: Vec<Type>) -> Self {
        Type::new(TypeKind::Tuple(elems))
    }

    pub fn signature(sig: Signature) -> Self {
        Type::new(TypeKind::Signature(Box::new(sig)))
    }

    /// Plain function signature with no receiver and no context.
    pub fn func(params: Vec<Type>, results: Vec<Type>) -> Self {
        Type::signature(Signature {
            recv: None,
            params,
            results,
            needs_context: false,
        })
    }

    /// Whether this is a signed integer type. Platform `int` is signed.
    pub fn is_signed(&self) -> bool {
        matches!(
            self.kind(),
            TypeKind::Int8 | TypeKind::Int16 | TypeKind::Int32 | TypeKind::Int64 | TypeKind::Int
        )
    }

    pub fn is_integer(&self) -> bool {
        matches!(
            self.kind(),
            TypeKind::Int8
                | TypeKind::Int16
                | TypeKind::Int32
                | TypeKind::Int64
                | TypeKind::Uint8
                | TypeKind::Uint16
                | TypeKind::Uint32
                | TypeKind::Uint64
                | TypeKind::Int
                | TypeKind::Uint
                | TypeKind::Uintptr
        )
    }

    pub fn is_float(&self) -> bool {
        matches!(self.kind(), TypeKind::Float32 | TypeKind::Float64)
    }

    /// Whether this is `unsafe.Pointer` or any `*T`.
    pub fn is_pointer_shaped(&self) -> bool {
        matches!(self.kind(), TypeKind::Pointer(_) | TypeKind::UnsafePointer)
    }

    /// Debug rendering used in error messages.
    pub fn describe(&self) -> String {
        match self.kind() {
            TypeKind::Named(name) => name.clone(),
            TypeKind::Pointer(elem) => format!("*{}", elem.describe()),
            TypeKind::Slice(elem) => format!("[]{}", elem.describe()),
            TypeKind::Array { elem, len } => format!("[{}]{}", len, elem.describe()),
            TypeKind::Map { key, value } => {
                format!("map[{}]{}", key.describe(), value.describe())
            }
            TypeKind::Chan(elem) => format!("chan {}", elem.describe()),
            TypeKind::Signature(sig) => sig.describe(),
            other => format!("{:?}", other).to_lowercase(),
        }
    }
}

impl Signature {
    /// Canonical textual form, used to key signature-scoped caches (defer
    /// thunks for function-pointer callees, interface method signature
    /// markers). Two signatures with the same canonical form share one ABI.
    pub fn describe(&self) -> String {
        let params: Vec<String> = self.params.iter().map(|p| p.describe()).collect();
        let results: Vec<String> = self.results.iter().map(|r| r.describe()).collect();
        let recv = match &self.recv {
            Some(r) => format!("({}) ", r.describe()),
            None => String::new(),
        };
        let ctx = if self.needs_context { "+ctx" } else { "" };
        format!("{}func({}) ({}){}", recv, params.join(", "), results.join(", "), ctx)
    }
}
