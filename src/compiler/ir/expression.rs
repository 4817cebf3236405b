//! Value-producing IR nodes
//!
//! Expressions are immutable once stored in a graph's arena. Constants
//! are interned per graph, so two structurally equal constants resolve to
//! the same [`ExprId`]; variables are identified by their id alone.

use super::arena::Id;
use super::types::{BuiltInType, FieldId, MethodId, TypeDesc, TypeId, TypeKind};
use crate::error::{Error, Result};
use std::fmt;

/// Handle of an expression inside one graph
pub type ExprId = Id<Expression>;

/// A handle to a runtime descriptor, embedded in code as a pointer-sized word
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RuntimeHandle {
    Type(TypeId),
    Method(MethodId),
    Field(FieldId),
}

/// Payload of a constant
///
/// Floating point values are stored as raw bits so constants can be
/// hashed and compared exactly.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ConstantValue {
    Null,
    Bool(bool),
    Int(i64),
    UInt(u64),
    Float32(u32),
    Float64(u64),
    Str(String),
    /// Pointer to the type's virtual table
    TypeHandle(TypeId),
    RuntimeHandle(RuntimeHandle),
    /// Offset of a field whose owner is not laid out yet
    FieldOffset(FieldId),
    /// Size of a type that is not laid out yet
    TypeSize(TypeId),
}

impl ConstantValue {
    pub fn f32(value: f32) -> Self {
        ConstantValue::Float32(value.to_bits())
    }

    pub fn f64(value: f64) -> Self {
        ConstantValue::Float64(value.to_bits())
    }

    /// Integer view of numeric payloads
    pub fn as_i128(&self) -> Option<i128> {
        match self {
            ConstantValue::Bool(b) => Some(*b as i128),
            ConstantValue::Int(v) => Some(*v as i128),
            ConstantValue::UInt(v) => Some(*v as i128),
            _ => None,
        }
    }

    /// Sentinels resolved once the layout engine has run
    pub fn is_delayed(&self) -> bool {
        matches!(
            self,
            ConstantValue::FieldOffset(_) | ConstantValue::TypeSize(_)
        )
    }

    /// Whether this payload is representable as a value of `kind`.
    pub fn fits(&self, kind: TypeKind) -> bool {
        use BuiltInType as B;

        let integer = match kind {
            TypeKind::Scalar(b) if b.is_integer() => Some(b),
            TypeKind::Enum(b) => Some(b),
            _ => None,
        };

        match self {
            ConstantValue::Null => kind.is_nullable(),
            ConstantValue::Bool(_) => kind == TypeKind::Scalar(B::Boolean),
            ConstantValue::Int(v) => match integer {
                Some(b) if b.is_signed() => signed_fits(b, *v),
                _ => false,
            },
            ConstantValue::UInt(v) => match integer {
                Some(b) if !b.is_signed() => unsigned_fits(b, *v),
                _ => false,
            },
            ConstantValue::Float32(_) => kind == TypeKind::Scalar(B::R4),
            ConstantValue::Float64(_) => kind == TypeKind::Scalar(B::R8),
            ConstantValue::Str(_) => kind == TypeKind::Scalar(B::String),
            ConstantValue::TypeHandle(_) | ConstantValue::RuntimeHandle(_) => matches!(
                kind,
                TypeKind::Reference
                    | TypeKind::Pointer(_)
                    | TypeKind::Scalar(B::IntPtr)
                    | TypeKind::Scalar(B::UIntPtr)
                    | TypeKind::Scalar(B::Object)
            ),
            ConstantValue::FieldOffset(_) | ConstantValue::TypeSize(_) => matches!(
                kind,
                TypeKind::Scalar(B::I4 | B::U4 | B::IntPtr | B::UIntPtr)
            ),
        }
    }
}

// Pointer-sized integers are checked against the widest target word.
fn signed_fits(b: BuiltInType, v: i64) -> bool {
    match b {
        BuiltInType::I1 => i8::try_from(v).is_ok(),
        BuiltInType::I2 => i16::try_from(v).is_ok(),
        BuiltInType::I4 => i32::try_from(v).is_ok(),
        _ => true,
    }
}

fn unsigned_fits(b: BuiltInType, v: u64) -> bool {
    match b {
        BuiltInType::U1 => u8::try_from(v).is_ok(),
        BuiltInType::U2 | BuiltInType::Char => u16::try_from(v).is_ok(),
        BuiltInType::U4 => u32::try_from(v).is_ok(),
        _ => true,
    }
}

impl fmt::Display for ConstantValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConstantValue::Null => write!(f, "null"),
            ConstantValue::Bool(b) => write!(f, "{}", b),
            ConstantValue::Int(v) => write!(f, "{}", v),
            ConstantValue::UInt(v) => write!(f, "{}", v),
            ConstantValue::Float32(bits) => write!(f, "{}", f32::from_bits(*bits)),
            ConstantValue::Float64(bits) => write!(f, "{}", f64::from_bits(*bits)),
            ConstantValue::Str(s) => write!(f, "{:?}", s),
            ConstantValue::TypeHandle(t) => write!(f, "typeof{}", t),
            ConstantValue::RuntimeHandle(RuntimeHandle::Type(t)) => write!(f, "handle(type {})", t),
            ConstantValue::RuntimeHandle(RuntimeHandle::Method(m)) => {
                write!(f, "handle(method {})", m)
            }
            ConstantValue::RuntimeHandle(RuntimeHandle::Field(x)) => {
                write!(f, "handle(field {})", x)
            }
            ConstantValue::FieldOffset(x) => write!(f, "offsetof{}", x),
            ConstantValue::TypeSize(t) => write!(f, "sizeof{}", t),
        }
    }
}

/// A literal with its declared type
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConstantExpression {
    ty: TypeId,
    value: ConstantValue,
}

impl ConstantExpression {
    /// Build a constant, failing if `value` cannot be a `desc`.
    ///
    /// `ty` must be the id `desc` is registered under.
    pub fn new(ty: TypeId, desc: &TypeDesc, value: ConstantValue) -> Result<Self> {
        if !value.fits(desc.kind) {
            return Err(Error::ConstantTypeMismatch {
                declared: desc.name.clone(),
                value: format!("{:?}", value),
            });
        }
        Ok(Self { ty, value })
    }

    /// Rebuild a constant that was validated in another graph.
    pub(crate) fn from_parts(ty: TypeId, value: ConstantValue) -> Self {
        Self { ty, value }
    }

    pub fn ty(&self) -> TypeId {
        self.ty
    }

    pub fn value(&self) -> &ConstantValue {
        &self.value
    }
}

/// Storage class of a variable
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VariableKind {
    /// Calling-convention slot
    Argument(u32),
    Local,
    Temporary,
    /// Holds the in-flight exception inside a handler
    ExceptionObject,
    /// Merge point for the given variable
    Phi(ExprId),
}

/// A variable reference
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct VariableExpression {
    ty: TypeId,
    kind: VariableKind,
}

impl VariableExpression {
    pub fn new(ty: TypeId, kind: VariableKind) -> Self {
        Self { ty, kind }
    }

    pub fn ty(&self) -> TypeId {
        self.ty
    }

    pub fn kind(&self) -> VariableKind {
        self.kind
    }
}

/// Debug info attached to a variable slot of one graph
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VariableDebugInfo {
    pub name: String,
}

/// A value producer
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Expression {
    Constant(ConstantExpression),
    Variable(VariableExpression),
}

impl Expression {
    /// Declared type, fixed at construction
    pub fn ty(&self) -> TypeId {
        match self {
            Expression::Constant(c) => c.ty(),
            Expression::Variable(v) => v.ty(),
        }
    }

    pub fn as_constant(&self) -> Option<&ConstantExpression> {
        match self {
            Expression::Constant(c) => Some(c),
            Expression::Variable(_) => None,
        }
    }

    pub fn as_variable(&self) -> Option<&VariableExpression> {
        match self {
            Expression::Variable(v) => Some(v),
            Expression::Constant(_) => None,
        }
    }

    pub fn is_constant(&self) -> bool {
        matches!(self, Expression::Constant(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scalar(b: BuiltInType) -> TypeDesc {
        TypeDesc::new(b.name(), TypeKind::Scalar(b))
    }

    #[test]
    fn test_constant_rejects_mismatched_payload() {
        let i4 = scalar(BuiltInType::I4);
        assert!(ConstantExpression::new(TypeId::new(1), &i4, ConstantValue::Int(5)).is_ok());

        let err = ConstantExpression::new(TypeId::new(1), &i4, ConstantValue::UInt(5)).unwrap_err();
        assert!(matches!(err, Error::ConstantTypeMismatch { .. }));

        // No silent truncation
        assert!(ConstantExpression::new(TypeId::new(1), &i4, ConstantValue::Int(1 << 40)).is_err());
        assert!(ConstantExpression::new(TypeId::new(1), &i4, ConstantValue::Null).is_err());
    }

    #[test]
    fn test_null_fits_reference_kinds() {
        assert!(ConstantValue::Null.fits(TypeKind::Reference));
        assert!(ConstantValue::Null.fits(TypeKind::ManagedPointer(TypeId::new(3))));
        assert!(!ConstantValue::Null.fits(TypeKind::ValueType));
    }

    #[test]
    fn test_structurally_equal_constants_compare_equal() {
        let r8 = scalar(BuiltInType::R8);
        let a = ConstantExpression::new(TypeId::new(2), &r8, ConstantValue::f64(1.5)).unwrap();
        let b = ConstantExpression::new(TypeId::new(2), &r8, ConstantValue::f64(1.5)).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_delayed_sentinels() {
        assert!(ConstantValue::TypeSize(TypeId::new(4)).is_delayed());
        assert!(ConstantValue::TypeSize(TypeId::new(4)).fits(TypeKind::Scalar(BuiltInType::U4)));
        assert!(!ConstantValue::Int(4).is_delayed());
    }
}
