//! Semantic types as seen by the backend.
//!
//! Name and type resolution happen in the front-end; the backend only needs
//! sizes, register classes, pointee/element types and struct layouts.

use super::register_file::RegBank;
use std::fmt;
use std::rc::Rc;

/// Native machine word size in bytes.
pub const WORD_SIZE: u64 = 8;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TypeKind {
    Void,
    Bool,
    Int { size: u8, signed: bool },
    Float { size: u8 },
    Pointer(Box<Type>),
    Array { element: Box<Type>, len: u64 },
    Struct(Rc<StructLayout>),
    Function(Rc<Signature>),
}

/// A semantic type with its const qualifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Type {
    pub kind: TypeKind,
    pub is_const: bool,
}

impl Type {
    pub fn new(kind: TypeKind) -> Self {
        Self {
            kind,
            is_const: false,
        }
    }

    pub fn void() -> Self {
        Self::new(TypeKind::Void)
    }

    pub fn bool() -> Self {
        Self::new(TypeKind::Bool)
    }

    pub fn int(size: u8, signed: bool) -> Self {
        Self::new(TypeKind::Int { size, signed })
    }

    pub fn u8() -> Self {
        Self::int(1, false)
    }

    pub fn u16() -> Self {
        Self::int(2, false)
    }

    pub fn u32() -> Self {
        Self::int(4, false)
    }

    pub fn u64() -> Self {
        Self::int(8, false)
    }

    pub fn i8() -> Self {
        Self::int(1, true)
    }

    pub fn i16() -> Self {
        Self::int(2, true)
    }

    pub fn i32() -> Self {
        Self::int(4, true)
    }

    pub fn i64() -> Self {
        Self::int(8, true)
    }

    pub fn f32() -> Self {
        Self::new(TypeKind::Float { size: 4 })
    }

    pub fn f64() -> Self {
        Self::new(TypeKind::Float { size: 8 })
    }

    pub fn pointer_to(pointee: Type) -> Self {
        Self::new(TypeKind::Pointer(Box::new(pointee)))
    }

    pub fn array_of(element: Type, len: u64) -> Self {
        Self::new(TypeKind::Array {
            element: Box::new(element),
            len,
        })
    }

    pub fn structure(layout: Rc<StructLayout>) -> Self {
        Self::new(TypeKind::Struct(layout))
    }

    pub fn function(signature: Signature) -> Self {
        Self::new(TypeKind::Function(Rc::new(signature)))
    }

    /// The same type with the const qualifier set.
    pub fn constant(mut self) -> Self {
        self.is_const = true;
        self
    }

    /// The same type without qualifiers.
    pub fn unqualified(&self) -> Self {
        Self::new(self.kind.clone())
    }

    /// Size in bytes.
    pub fn size(&self) -> u64 {
        match &self.kind {
            TypeKind::Void => 0,
            TypeKind::Bool => 1,
            TypeKind::Int { size, .. } | TypeKind::Float { size } => *size as u64,
            TypeKind::Pointer(_) | TypeKind::Function(_) => WORD_SIZE,
            TypeKind::Array { element, len } => element.size() * len,
            TypeKind::Struct(layout) => layout.size,
        }
    }

    /// Natural alignment in bytes.
    pub fn align(&self) -> u64 {
        match &self.kind {
            TypeKind::Void => 1,
            TypeKind::Array { element, .. } => element.align(),
            TypeKind::Struct(layout) => layout.align,
            _ => self.size().max(1),
        }
    }

    pub fn is_void(&self) -> bool {
        matches!(self.kind, TypeKind::Void)
    }

    pub fn is_bool(&self) -> bool {
        matches!(self.kind, TypeKind::Bool)
    }

    pub fn is_integer(&self) -> bool {
        matches!(self.kind, TypeKind::Int { .. } | TypeKind::Bool)
    }

    pub fn is_float(&self) -> bool {
        matches!(self.kind, TypeKind::Float { .. })
    }

    pub fn is_pointer(&self) -> bool {
        matches!(self.kind, TypeKind::Pointer(_))
    }

    pub fn is_array(&self) -> bool {
        matches!(self.kind, TypeKind::Array { .. })
    }

    pub fn is_struct(&self) -> bool {
        matches!(self.kind, TypeKind::Struct(_))
    }

    pub fn is_function(&self) -> bool {
        matches!(self.kind, TypeKind::Function(_))
    }

    /// Integers, bools, floats and pointers.
    pub fn is_scalar(&self) -> bool {
        self.is_integer() || self.is_float() || self.is_pointer()
    }

    pub fn is_signed(&self) -> bool {
        matches!(self.kind, TypeKind::Int { signed: true, .. })
    }

    pub fn pointee(&self) -> Option<&Type> {
        match &self.kind {
            TypeKind::Pointer(inner) => Some(inner),
            _ => None,
        }
    }

    pub fn element(&self) -> Option<&Type> {
        match &self.kind {
            TypeKind::Array { element, .. } => Some(element),
            _ => None,
        }
    }

    pub fn struct_layout(&self) -> Option<&Rc<StructLayout>> {
        match &self.kind {
            TypeKind::Struct(layout) => Some(layout),
            _ => None,
        }
    }

    /// Signature of a function type, or of a pointer to one.
    pub fn signature(&self) -> Option<&Rc<Signature>> {
        match &self.kind {
            TypeKind::Function(sig) => Some(sig),
            TypeKind::Pointer(inner) => match &inner.kind {
                TypeKind::Function(sig) => Some(sig),
                _ => None,
            },
            _ => None,
        }
    }

    /// Register bank a value of this type lives in.
    pub fn bank(&self) -> RegBank {
        if self.is_float() {
            RegBank::Float
        } else {
            RegBank::Int
        }
    }

    /// Whether values of this type can be held in a single register.
    ///
    /// Arrays never are; other types qualify when they are one, two, four
    /// or eight bytes wide.
    pub fn fits_register(&self) -> bool {
        if self.is_array() || self.is_void() {
            return false;
        }
        matches!(self.size(), 1 | 2 | 4 | 8)
    }

    /// Whether a value of type `self` may be stored into `target` without
    /// an explicit conversion.
    pub fn assignable_to(&self, target: &Type) -> bool {
        match (&self.kind, &target.kind) {
            (TypeKind::Int { .. } | TypeKind::Bool, TypeKind::Int { .. } | TypeKind::Bool) => true,
            (TypeKind::Float { .. }, TypeKind::Float { .. }) => true,
            (TypeKind::Pointer(_), TypeKind::Pointer(_)) => true,
            (TypeKind::Array { element, .. }, TypeKind::Pointer(pointee)) => {
                element.unqualified() == pointee.unqualified()
            }
            (TypeKind::Array { .. }, TypeKind::Array { .. }) => {
                self.unqualified() == target.unqualified()
            }
            (TypeKind::Struct(a), TypeKind::Struct(b)) => Rc::ptr_eq(a, b) || a == b,
            (TypeKind::Function(a), TypeKind::Pointer(inner)) => {
                matches!(&inner.kind, TypeKind::Function(b) if a == b)
            }
            _ => false,
        }
    }
}

impl fmt::Display for Type {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_const {
            write!(f, "const ")?;
        }
        match &self.kind {
            TypeKind::Void => write!(f, "void"),
            TypeKind::Bool => write!(f, "bool"),
            TypeKind::Int { size, signed } => {
                write!(f, "{}{}", if *signed { 'i' } else { 'u' }, *size as u32 * 8)
            }
            TypeKind::Float { size } => write!(f, "f{}", *size as u32 * 8),
            TypeKind::Pointer(inner) => write!(f, "*{inner}"),
            TypeKind::Array { element, len } => write!(f, "[{element}; {len}]"),
            TypeKind::Struct(layout) => write!(f, "struct {}", layout.name),
            TypeKind::Function(sig) => write!(f, "{sig}"),
        }
    }
}

/// Parameter and return types of a function.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Signature {
    pub params: Vec<Type>,
    pub ret: Type,
}

impl Signature {
    pub fn new(params: Vec<Type>, ret: Type) -> Self {
        Self { params, ret }
    }

    pub fn returns_value(&self) -> bool {
        !self.ret.is_void()
    }
}

impl fmt::Display for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "func(")?;
        for (i, param) in self.params.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{param}")?;
        }
        write!(f, ") -> {}", self.ret)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Field {
    pub name: String,
    pub ty: Type,
    pub offset: u64,
}

/// Layout of a struct declaration, computed with natural alignment.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StructLayout {
    pub name: String,
    pub fields: Vec<Field>,
    pub size: u64,
    pub align: u64,
}

impl StructLayout {
    pub fn new(name: impl Into<String>, members: Vec<(String, Type)>) -> Rc<Self> {
        let mut offset = 0u64;
        let mut align = 1u64;
        let mut fields = Vec::with_capacity(members.len());
        for (name, ty) in members {
            let field_align = ty.align();
            offset = offset.div_ceil(field_align) * field_align;
            align = align.max(field_align);
            let size = ty.size();
            fields.push(Field { name, ty, offset });
            offset += size;
        }
        Rc::new(Self {
            name: name.into(),
            fields,
            size: offset.div_ceil(align) * align,
            align,
        })
    }

    pub fn field(&self, name: &str) -> Option<&Field> {
        self.fields.iter().find(|f| f.name == name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scalar_sizes_and_banks() {
        assert_eq!(Type::u8().size(), 1);
        assert_eq!(Type::i32().size(), 4);
        assert_eq!(Type::pointer_to(Type::u8()).size(), 8);
        assert_eq!(Type::f32().bank(), RegBank::Float);
        assert_eq!(Type::pointer_to(Type::f64()).bank(), RegBank::Int);
        assert!(Type::i16().is_signed());
        assert!(!Type::u16().is_signed());
    }

    #[test]
    fn test_register_fit() {
        assert!(Type::u64().fits_register());
        assert!(!Type::array_of(Type::u8(), 8).fits_register());
        let odd = StructLayout::new("Odd", vec![("a".into(), Type::u8()), ("b".into(), Type::u16())]);
        // u8 + pad + u16 = 4 bytes
        assert!(Type::structure(odd).fits_register());
        let wide = StructLayout::new("Wide", vec![("a".into(), Type::u64()), ("b".into(), Type::u64())]);
        assert!(!Type::structure(wide).fits_register());
    }

    #[test]
    fn test_struct_layout() {
        let layout = StructLayout::new(
            "Pair",
            vec![("tag".into(), Type::u8()), ("value".into(), Type::u64())],
        );
        assert_eq!(layout.field("tag").unwrap().offset, 0);
        assert_eq!(layout.field("value").unwrap().offset, 8);
        assert_eq!(layout.size, 16);
        assert_eq!(layout.align, 8);
        assert!(layout.field("missing").is_none());
    }

    #[test]
    fn test_assignability() {
        assert!(Type::u8().assignable_to(&Type::u64()));
        assert!(!Type::f64().assignable_to(&Type::u64()));
        let arr = Type::array_of(Type::u8(), 4);
        assert!(arr.assignable_to(&Type::pointer_to(Type::u8())));
        assert!(!arr.assignable_to(&Type::pointer_to(Type::u16())));
        assert_eq!(Type::pointer_to(Type::i32()).to_string(), "*i32");
    }
}
