//! Static effect facts carried by every operator
//!
//! Each fact is a pair of bits, a positive one (`IS_*`/`MAY_*`) and its
//! negation (`IS_NON_*`/`DOES_NOT_*`). A well-formed mask has exactly one
//! bit of every pair set; an operator's mask is derived by its factory and
//! may only be narrowed later within its kind's bounds.

use std::fmt;

bitflags::bitflags! {
    /// Conservative effect mask of an operator.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
    pub struct Capabilities: u32 {
        const IS_COMMUTATIVE = 0x0000_0001;
        const IS_NON_COMMUTATIVE = 0x0000_0002;

        const MAY_MUTATE_EXISTING_STORAGE = 0x0000_0004;
        const DOES_NOT_MUTATE_EXISTING_STORAGE = 0x0000_0008;

        const MAY_ALLOCATE_STORAGE = 0x0000_0010;
        const DOES_NOT_ALLOCATE_STORAGE = 0x0000_0020;

        const MAY_READ_EXISTING_MUTABLE_STORAGE = 0x0000_0040;
        const DOES_NOT_READ_EXISTING_MUTABLE_STORAGE = 0x0000_0080;

        const MAY_THROW = 0x0000_0100;
        const DOES_NOT_THROW = 0x0000_0200;

        const MAY_READ_THROUGH_POINTER_OPERANDS = 0x0000_0400;
        const DOES_NOT_READ_THROUGH_POINTER_OPERANDS = 0x0000_0800;

        const MAY_WRITE_THROUGH_POINTER_OPERANDS = 0x0000_1000;
        const DOES_NOT_WRITE_THROUGH_POINTER_OPERANDS = 0x0000_2000;

        const MAY_CAPTURE_POINTER_OPERANDS = 0x0000_4000;
        const DOES_NOT_CAPTURE_POINTER_OPERANDS = 0x0000_8000;

        /// Bookkeeping operator that emits no code
        const IS_META_OPERATOR = 0x0001_0000;
    }
}

impl Capabilities {
    /// Every paired bit.
    pub const MUTUALLY_EXCLUSIVE: Capabilities = Capabilities::from_bits_retain(0x0000_FFFF);

    /// The positive half of every pair.
    pub const POSITIVE: Capabilities = Capabilities::from_bits_retain(0x0000_5555);

    /// The `MAY_*` effect bits, i.e. the positive half minus commutativity.
    pub const EFFECTS: Capabilities = Capabilities::from_bits_retain(0x0000_5554);

    /// A computation with no side effects at all.
    pub fn pure_computation(commutative: bool) -> Self {
        let commutativity = if commutative {
            Capabilities::IS_COMMUTATIVE
        } else {
            Capabilities::IS_NON_COMMUTATIVE
        };
        commutativity
            | Capabilities::DOES_NOT_MUTATE_EXISTING_STORAGE
            | Capabilities::DOES_NOT_ALLOCATE_STORAGE
            | Capabilities::DOES_NOT_READ_EXISTING_MUTABLE_STORAGE
            | Capabilities::DOES_NOT_THROW
            | Capabilities::DOES_NOT_READ_THROUGH_POINTER_OPERANDS
            | Capabilities::DOES_NOT_WRITE_THROUGH_POINTER_OPERANDS
            | Capabilities::DOES_NOT_CAPTURE_POINTER_OPERANDS
    }

    /// A computation that may do anything.
    pub fn opaque() -> Self {
        Capabilities::IS_NON_COMMUTATIVE | Capabilities::EFFECTS
    }

    /// Exactly one bit of each pair is set.
    pub fn is_well_formed(self) -> bool {
        let odd = self.bits() & Capabilities::POSITIVE.bits();
        let even = (self.bits() >> 1) & Capabilities::POSITIVE.bits();
        (odd ^ even) == Capabilities::POSITIVE.bits() && (odd & even) == 0
    }

    /// Set the positive bits in `effects`, clearing their negations.
    pub fn with(self, effects: Capabilities) -> Self {
        let positive = effects & Capabilities::POSITIVE;
        let negative = Capabilities::from_bits_retain(positive.bits() << 1);
        (self - negative) | positive
    }

    /// Clear the positive bits in `effects`, setting their negations.
    pub fn without(self, effects: Capabilities) -> Self {
        let positive = effects & Capabilities::POSITIVE;
        let negative = Capabilities::from_bits_retain(positive.bits() << 1);
        (self - positive) | negative
    }

    /// The `MAY_*` bits of this mask.
    pub fn may_effects(self) -> Capabilities {
        self & Capabilities::EFFECTS
    }

    pub fn is_commutative(self) -> bool {
        self.contains(Capabilities::IS_COMMUTATIVE)
    }

    pub fn may_throw(self) -> bool {
        !self.contains(Capabilities::DOES_NOT_THROW)
    }

    pub fn does_not_throw(self) -> bool {
        self.contains(Capabilities::DOES_NOT_THROW)
    }

    pub fn may_allocate_storage(self) -> bool {
        !self.contains(Capabilities::DOES_NOT_ALLOCATE_STORAGE)
    }

    pub fn may_mutate_existing_storage(self) -> bool {
        !self.contains(Capabilities::DOES_NOT_MUTATE_EXISTING_STORAGE)
    }

    pub fn may_read_existing_mutable_storage(self) -> bool {
        !self.contains(Capabilities::DOES_NOT_READ_EXISTING_MUTABLE_STORAGE)
    }

    pub fn may_read_through_pointer_operands(self) -> bool {
        !self.contains(Capabilities::DOES_NOT_READ_THROUGH_POINTER_OPERANDS)
    }

    pub fn may_write_through_pointer_operands(self) -> bool {
        !self.contains(Capabilities::DOES_NOT_WRITE_THROUGH_POINTER_OPERANDS)
    }

    pub fn may_capture_pointer_operands(self) -> bool {
        !self.contains(Capabilities::DOES_NOT_CAPTURE_POINTER_OPERANDS)
    }

    pub fn is_meta_operator(self) -> bool {
        self.contains(Capabilities::IS_META_OPERATOR)
    }

    /// Anything observable besides writing the operator's own results.
    pub fn has_side_effects(self) -> bool {
        self.may_throw()
            || self.may_allocate_storage()
            || self.may_mutate_existing_storage()
            || self.may_write_through_pointer_operands()
            || self.may_capture_pointer_operands()
    }
}

impl fmt::Display for Capabilities {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for (name, _) in self.iter_names() {
            if !first {
                write!(f, "|")?;
            }
            write!(f, "{}", name)?;
            first = false;
        }
        Ok(())
    }
}

/// Abstraction level of an operator, ordered from machine-near to object-oriented.
///
/// Lowering phases run until no operator above their target level remains.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum OperatorLevel {
    Registers,
    StackLocations,
    ScalarValues,
    ConcreteTypesNoExceptions,
    ConcreteTypes,
    ObjectOriented,
    FullyObjectOriented,
}

impl OperatorLevel {
    pub const LOWEST: OperatorLevel = OperatorLevel::Registers;
    pub const HIGHEST: OperatorLevel = OperatorLevel::FullyObjectOriented;
}
