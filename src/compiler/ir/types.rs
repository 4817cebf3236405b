//! Type-system descriptors as seen by the IR
//!
//! Descriptors are owned by the [`TypeSystemForIr`](super::TypeSystemForIr)
//! bridge; the graph only stores their ids.

use super::arena::Id;
use super::expression::ConstantValue;
use crate::compiler::TargetLayout;

/// Handle of a registered type descriptor
pub type TypeId = Id<TypeDesc>;
/// Handle of a registered field descriptor
pub type FieldId = Id<FieldDesc>;
/// Handle of a registered method descriptor
pub type MethodId = Id<MethodDesc>;

/// Primitive types known to every target
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum BuiltInType {
    Void,
    Boolean,
    Char,
    I1,
    U1,
    I2,
    U2,
    I4,
    U4,
    I8,
    U8,
    R4,
    R8,
    /// Native signed integer, pointer sized
    IntPtr,
    /// Native unsigned integer, pointer sized
    UIntPtr,
    /// Root of the reference hierarchy
    Object,
    String,
}

impl BuiltInType {
    /// All built-ins, in registration order
    pub const ALL: [BuiltInType; 17] = [
        BuiltInType::Void,
        BuiltInType::Boolean,
        BuiltInType::Char,
        BuiltInType::I1,
        BuiltInType::U1,
        BuiltInType::I2,
        BuiltInType::U2,
        BuiltInType::I4,
        BuiltInType::U4,
        BuiltInType::I8,
        BuiltInType::U8,
        BuiltInType::R4,
        BuiltInType::R8,
        BuiltInType::IntPtr,
        BuiltInType::UIntPtr,
        BuiltInType::Object,
        BuiltInType::String,
    ];

    /// Size in bytes on the target
    pub fn size(self, layout: &TargetLayout) -> u32 {
        match self {
            BuiltInType::Void => 0,
            BuiltInType::Boolean | BuiltInType::I1 | BuiltInType::U1 => 1,
            BuiltInType::Char | BuiltInType::I2 | BuiltInType::U2 => 2,
            BuiltInType::I4 | BuiltInType::U4 | BuiltInType::R4 => 4,
            BuiltInType::I8 | BuiltInType::U8 | BuiltInType::R8 => 8,
            BuiltInType::IntPtr
            | BuiltInType::UIntPtr
            | BuiltInType::Object
            | BuiltInType::String => layout.pointer_size,
        }
    }

    pub fn is_integer(self) -> bool {
        matches!(
            self,
            BuiltInType::Char
                | BuiltInType::I1
                | BuiltInType::U1
                | BuiltInType::I2
                | BuiltInType::U2
                | BuiltInType::I4
                | BuiltInType::U4
                | BuiltInType::I8
                | BuiltInType::U8
                | BuiltInType::IntPtr
                | BuiltInType::UIntPtr
        )
    }

    pub fn is_signed(self) -> bool {
        matches!(
            self,
            BuiltInType::I1
                | BuiltInType::I2
                | BuiltInType::I4
                | BuiltInType::I8
                | BuiltInType::IntPtr
        )
    }

    pub fn is_floating_point(self) -> bool {
        matches!(self, BuiltInType::R4 | BuiltInType::R8)
    }

    pub fn is_reference(self) -> bool {
        matches!(self, BuiltInType::Object | BuiltInType::String)
    }

    /// Truncate `value` to this integer type's width, reinterpreting the sign.
    ///
    /// Returns `None` for non-integer types (booleans map to `Bool`).
    pub fn make_integer(self, value: i128, layout: &TargetLayout) -> Option<ConstantValue> {
        if self == BuiltInType::Boolean {
            return Some(ConstantValue::Bool(value != 0));
        }
        if !self.is_integer() {
            return None;
        }
        let bits = self.size(layout) * 8;
        let mask: u128 = if bits >= 128 {
            u128::MAX
        } else {
            (1u128 << bits) - 1
        };
        let raw = (value as u128) & mask;
        if self.is_signed() {
            let shift = 128 - bits;
            Some(ConstantValue::Int((((raw << shift) as i128) >> shift) as i64))
        } else {
            Some(ConstantValue::UInt(raw as u64))
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            BuiltInType::Void => "void",
            BuiltInType::Boolean => "bool",
            BuiltInType::Char => "char",
            BuiltInType::I1 => "I1",
            BuiltInType::U1 => "U1",
            BuiltInType::I2 => "I2",
            BuiltInType::U2 => "U2",
            BuiltInType::I4 => "I4",
            BuiltInType::U4 => "U4",
            BuiltInType::I8 => "I8",
            BuiltInType::U8 => "U8",
            BuiltInType::R4 => "R4",
            BuiltInType::R8 => "R8",
            BuiltInType::IntPtr => "IntPtr",
            BuiltInType::UIntPtr => "UIntPtr",
            BuiltInType::Object => "Object",
            BuiltInType::String => "String",
        }
    }
}

/// Shape of a type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TypeKind {
    /// One of the built-in primitives
    Scalar(BuiltInType),
    /// Heap-allocated class
    Reference,
    /// Struct laid out inline
    ValueType,
    /// Enumeration over an integer type
    Enum(BuiltInType),
    /// Unmanaged pointer
    Pointer(TypeId),
    /// Interior pointer the collector tracks, used for `this` of value types
    ManagedPointer(TypeId),
}

impl TypeKind {
    /// Whether null is a legal value of this kind
    pub fn is_nullable(self) -> bool {
        match self {
            TypeKind::Reference | TypeKind::Pointer(_) | TypeKind::ManagedPointer(_) => true,
            TypeKind::Scalar(b) => {
                b.is_reference() || matches!(b, BuiltInType::IntPtr | BuiltInType::UIntPtr)
            }
            TypeKind::ValueType | TypeKind::Enum(_) => false,
        }
    }

    /// Whether values of this kind live inline (non-pointer)
    pub fn is_value_type(self) -> bool {
        match self {
            TypeKind::ValueType | TypeKind::Enum(_) => true,
            TypeKind::Scalar(b) => !b.is_reference() && b != BuiltInType::Void,
            _ => false,
        }
    }
}

/// Size and alignment computed by the layout engine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TypeLayout {
    pub size: u32,
    pub align: u32,
}

/// A type descriptor
#[derive(Debug, Clone, PartialEq)]
pub struct TypeDesc {
    pub name: String,
    pub kind: TypeKind,
    /// Instance and static fields, in declaration order
    pub fields: Vec<FieldId>,
    /// `None` until the layout engine has run for this type
    pub layout: Option<TypeLayout>,
}

impl TypeDesc {
    pub fn new(name: impl Into<String>, kind: TypeKind) -> Self {
        Self {
            name: name.into(),
            kind,
            fields: Vec::new(),
            layout: None,
        }
    }
}

/// A field descriptor
#[derive(Debug, Clone, PartialEq)]
pub struct FieldDesc {
    pub name: String,
    pub owner: TypeId,
    pub field_type: TypeId,
    pub is_static: bool,
    /// Byte offset within the owner, once laid out
    pub offset: Option<u32>,
}

/// A method descriptor
#[derive(Debug, Clone, PartialEq)]
pub struct MethodDesc {
    pub name: String,
    /// Declaring type
    pub owner: TypeId,
    pub is_static: bool,
    /// Declared parameters, excluding the implicit slot 0
    pub parameters: Vec<TypeId>,
    /// Parameter names for debug info, may be shorter than `parameters`
    pub parameter_names: Vec<String>,
    /// Declared locals, used when the caller supplies none
    pub locals: Vec<TypeId>,
    /// `None` for methods returning void
    pub return_type: Option<TypeId>,
}

impl MethodDesc {
    pub fn new(name: impl Into<String>, owner: TypeId, is_static: bool) -> Self {
        Self {
            name: name.into(),
            owner,
            is_static,
            parameters: Vec::new(),
            parameter_names: Vec::new(),
            locals: Vec::new(),
            return_type: None,
        }
    }

    pub fn with_parameters(mut self, parameters: Vec<TypeId>) -> Self {
        self.parameters = parameters;
        self
    }

    pub fn with_parameter_names<S: Into<String>>(mut self, names: Vec<S>) -> Self {
        self.parameter_names = names.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_locals(mut self, locals: Vec<TypeId>) -> Self {
        self.locals = locals;
        self
    }

    pub fn with_return_type(mut self, ty: TypeId) -> Self {
        self.return_type = Some(ty);
        self
    }

    /// Argument slots in calling-convention order.
    ///
    /// Slot 0 is always the declaring type: the receiver for instance
    /// methods, the type-pointer slot for static ones.
    pub fn this_plus_arguments(&self) -> Vec<TypeId> {
        let mut slots = Vec::with_capacity(self.parameters.len() + 1);
        slots.push(self.owner);
        slots.extend_from_slice(&self.parameters);
        slots
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_sizes_follow_target() {
        let layout = TargetLayout::default();
        assert_eq!(BuiltInType::I4.size(&layout), 4);
        assert_eq!(BuiltInType::IntPtr.size(&layout), layout.pointer_size);
        let wide = TargetLayout {
            pointer_size: 8,
            pointer_align: 8,
        };
        assert_eq!(BuiltInType::Object.size(&wide), 8);
    }

    #[test]
    fn test_make_integer_wraps() {
        let layout = TargetLayout::default();
        assert_eq!(
            BuiltInType::U1.make_integer(300, &layout),
            Some(ConstantValue::UInt(44))
        );
        assert_eq!(
            BuiltInType::I1.make_integer(200, &layout),
            Some(ConstantValue::Int(-56))
        );
        assert_eq!(
            BuiltInType::I8.make_integer(-1, &layout),
            Some(ConstantValue::Int(-1))
        );
        assert_eq!(
            BuiltInType::Boolean.make_integer(2, &layout),
            Some(ConstantValue::Bool(true))
        );
        assert_eq!(BuiltInType::R8.make_integer(1, &layout), None);
    }

    #[test]
    fn test_this_plus_arguments() {
        let owner = TypeId::new(20);
        let md = MethodDesc::new("Foo", owner, true).with_parameters(vec![TypeId::new(7)]);
        assert_eq!(md.this_plus_arguments(), vec![owner, TypeId::new(7)]);
    }
}
