//! Operators: the unit of computation and effect in a graph
//!
//! Operators are only built through the factory functions on [`Operator`],
//! which derive the capability mask and level from the operator kind. A
//! pass may later narrow the mask through the graph, but never below what
//! the kind is known to require.

use super::arena::Id;
use super::basic_block::BlockId;
use super::capabilities::{Capabilities, OperatorLevel};
use super::expression::ExprId;
use super::types::{BuiltInType, FieldId, MethodId, TypeId};
use crate::compiler::debug::{DumpArg, IntermediateRepresentationDumper};
use std::fmt;

/// Handle of an operator inside one graph
pub type OpId = Id<Operator>;

/// Two-operand ALU operations
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AluOperation {
    Add,
    Sub,
    Mul,
    Div,
    Rem,
    And,
    Or,
    Xor,
    Shl,
    Shr,
}

impl AluOperation {
    pub fn is_commutative(self) -> bool {
        matches!(
            self,
            AluOperation::Add
                | AluOperation::Mul
                | AluOperation::And
                | AluOperation::Or
                | AluOperation::Xor
        )
    }

    /// Division traps on a zero divisor
    pub fn may_trap(self) -> bool {
        matches!(self, AluOperation::Div | AluOperation::Rem)
    }

    pub fn mnemonic(self) -> &'static str {
        match self {
            AluOperation::Add => "add",
            AluOperation::Sub => "sub",
            AluOperation::Mul => "mul",
            AluOperation::Div => "div",
            AluOperation::Rem => "rem",
            AluOperation::And => "and",
            AluOperation::Or => "or",
            AluOperation::Xor => "xor",
            AluOperation::Shl => "shl",
            AluOperation::Shr => "shr",
        }
    }

    /// Fold over two integer operands. The result is exact before
    /// truncation to the destination type; `None` where the target traps.
    fn evaluate(self, signed: bool, left: IntegerOperand, right: IntegerOperand) -> Option<i128> {
        let bits = left.bits.max(right.bits);
        let (l, r) = (left.read(signed), right.read(signed));
        match self {
            AluOperation::Add => Some(l.wrapping_add(r)),
            AluOperation::Sub => Some(l.wrapping_sub(r)),
            AluOperation::Mul => Some(l.wrapping_mul(r)),
            AluOperation::Div | AluOperation::Rem if r == 0 => None,
            // MIN / -1 overflows the operand width
            AluOperation::Div | AluOperation::Rem
                if signed && r == -1 && l == IntegerOperand::signed_min(bits) =>
            {
                None
            }
            AluOperation::Div => Some(l / r),
            AluOperation::Rem => Some(l % r),
            AluOperation::And => Some(l & r),
            AluOperation::Or => Some(l | r),
            AluOperation::Xor => Some(l ^ r),
            AluOperation::Shl | AluOperation::Shr => {
                let amount = right.read(false);
                if amount >= left.bits as i128 {
                    return None;
                }
                match self {
                    AluOperation::Shl => Some(((l as u128) << amount) as i128),
                    // Arithmetic for signed operands, logical for unsigned ones
                    _ => Some(l >> amount),
                }
            }
        }
    }
}

/// A constant integer operand: its payload and the width of its type in bits
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IntegerOperand {
    pub value: i128,
    pub bits: u32,
}

impl IntegerOperand {
    pub fn new(value: i128, bits: u32) -> Self {
        Self {
            value,
            bits: bits.clamp(1, 64),
        }
    }

    /// The operand's bit pattern read as a signed or unsigned integer
    pub fn read(self, signed: bool) -> i128 {
        let raw = (self.value as u128) & ((1u128 << self.bits) - 1);
        if signed {
            let shift = 128 - self.bits;
            ((raw << shift) as i128) >> shift
        } else {
            raw as i128
        }
    }

    fn signed_min(bits: u32) -> i128 {
        -(1i128 << (bits - 1))
    }
}

/// One-operand ALU operations
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UnaryOperation {
    Neg,
    Not,
}

impl UnaryOperation {
    pub fn mnemonic(self) -> &'static str {
        match self {
            UnaryOperation::Neg => "neg",
            UnaryOperation::Not => "not",
        }
    }
}

/// Comparison used by compare-and-set and compare-and-branch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Condition {
    Eq,
    Ge,
    Gt,
    Le,
    Lt,
    Ne,
}

impl Condition {
    pub fn is_commutative(self) -> bool {
        matches!(self, Condition::Eq | Condition::Ne)
    }

    /// The condition that holds after swapping the operands
    pub fn swapped(self) -> Condition {
        match self {
            Condition::Ge => Condition::Le,
            Condition::Gt => Condition::Lt,
            Condition::Le => Condition::Ge,
            Condition::Lt => Condition::Gt,
            other => other,
        }
    }

    /// Compare two operands read at the comparison's signedness
    pub fn evaluate(self, signed: bool, left: IntegerOperand, right: IntegerOperand) -> bool {
        let (left, right) = (left.read(signed), right.read(signed));
        match self {
            Condition::Eq => left == right,
            Condition::Ge => left >= right,
            Condition::Gt => left > right,
            Condition::Le => left <= right,
            Condition::Lt => left < right,
            Condition::Ne => left != right,
        }
    }

    pub fn mnemonic(self) -> &'static str {
        match self {
            Condition::Eq => "eq",
            Condition::Ge => "ge",
            Condition::Gt => "gt",
            Condition::Le => "le",
            Condition::Lt => "lt",
            Condition::Ne => "ne",
        }
    }
}

/// Source position of an operator
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DebugInfo {
    pub file: String,
    pub line: u32,
    pub column: u32,
}

impl DebugInfo {
    pub fn new(file: impl Into<String>, line: u32, column: u32) -> Self {
        Self {
            file: file.into(),
            line,
            column,
        }
    }
}

impl fmt::Display for DebugInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({},{})", self.file, self.line, self.column)
    }
}

/// Facts attached to an operator by analyses
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Annotation {
    /// The expression is known to be non-null after this operator
    NotNull(ExprId),
    /// Keep the operator even if its results are dead
    DontRemove,
    /// Copy propagation must leave this slot alone
    BlockCopyPropagation { index: usize, is_result: bool },
    /// The operator clobbers the given variable as a side effect
    Invalidates(ExprId),
}

/// The closed set of operator kinds
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum OperatorKind {
    /// Emits no code
    Nop,
    Assignment,
    Binary {
        alu: AluOperation,
        signed: bool,
        overflow: bool,
    },
    Unary {
        op: UnaryOperation,
        signed: bool,
        overflow: bool,
    },
    Convert {
        input: BuiltInType,
        output: BuiltInType,
        overflow: bool,
    },
    CompareAndSet {
        condition: Condition,
        signed: bool,
    },
    LoadIndirect {
        ty: TypeId,
        offset: i32,
    },
    StoreIndirect {
        ty: TypeId,
        offset: i32,
    },
    LoadInstanceField {
        field: FieldId,
    },
    StoreInstanceField {
        field: FieldId,
    },
    AllocateObject {
        ty: TypeId,
    },
    DirectSubroutine {
        target: MethodId,
    },
    /// Argument 0 is the callee address
    IndirectSubroutine {
        signature: MethodId,
    },
    Unconditional {
        target: BlockId,
    },
    BinaryConditional {
        false_target: BlockId,
        true_target: BlockId,
    },
    CompareConditional {
        condition: Condition,
        signed: bool,
        false_target: BlockId,
        true_target: BlockId,
    },
    Return,
    Throw,
}

impl OperatorKind {
    pub fn name(&self) -> &'static str {
        match self {
            OperatorKind::Nop => "Nop",
            OperatorKind::Assignment => "Assignment",
            OperatorKind::Binary { .. } => "Binary",
            OperatorKind::Unary { .. } => "Unary",
            OperatorKind::Convert { .. } => "Convert",
            OperatorKind::CompareAndSet { .. } => "CompareAndSet",
            OperatorKind::LoadIndirect { .. } => "LoadIndirect",
            OperatorKind::StoreIndirect { .. } => "StoreIndirect",
            OperatorKind::LoadInstanceField { .. } => "LoadInstanceField",
            OperatorKind::StoreInstanceField { .. } => "StoreInstanceField",
            OperatorKind::AllocateObject { .. } => "AllocateObject",
            OperatorKind::DirectSubroutine { .. } => "DirectSubroutine",
            OperatorKind::IndirectSubroutine { .. } => "IndirectSubroutine",
            OperatorKind::Unconditional { .. } => "UnconditionalControl",
            OperatorKind::BinaryConditional { .. } => "BinaryConditionalControl",
            OperatorKind::CompareConditional { .. } => "CompareConditionalControl",
            OperatorKind::Return => "ReturnControl",
            OperatorKind::Throw => "ThrowControl",
        }
    }

    /// Ends a basic block
    pub fn is_control(&self) -> bool {
        matches!(
            self,
            OperatorKind::Unconditional { .. }
                | OperatorKind::BinaryConditional { .. }
                | OperatorKind::CompareConditional { .. }
                | OperatorKind::Return
                | OperatorKind::Throw
        )
    }

    pub fn is_subroutine(&self) -> bool {
        matches!(
            self,
            OperatorKind::DirectSubroutine { .. } | OperatorKind::IndirectSubroutine { .. }
        )
    }

    /// Normal-flow targets, false edge first, without duplicates.
    pub fn successors(&self) -> Vec<BlockId> {
        match self {
            OperatorKind::Unconditional { target } => vec![*target],
            OperatorKind::BinaryConditional {
                false_target,
                true_target,
            }
            | OperatorKind::CompareConditional {
                false_target,
                true_target,
                ..
            } => {
                if false_target == true_target {
                    vec![*false_target]
                } else {
                    vec![*false_target, *true_target]
                }
            }
            _ => Vec::new(),
        }
    }

    pub fn level(&self) -> OperatorLevel {
        match self {
            OperatorKind::LoadIndirect { .. } | OperatorKind::StoreIndirect { .. } => {
                OperatorLevel::ScalarValues
            }
            OperatorKind::LoadInstanceField { .. }
            | OperatorKind::StoreInstanceField { .. }
            | OperatorKind::Throw => OperatorLevel::ConcreteTypes,
            OperatorKind::AllocateObject { .. } => OperatorLevel::ObjectOriented,
            _ => OperatorLevel::LOWEST,
        }
    }

    /// Whether a mask for this kind may claim `IS_COMMUTATIVE`
    pub fn allows_commutative(&self) -> bool {
        match self {
            OperatorKind::Binary { alu, .. } => alu.is_commutative(),
            OperatorKind::CompareAndSet { condition, .. } => condition.is_commutative(),
            _ => false,
        }
    }

    /// Effects every operator of this kind has, whatever an analysis proves.
    pub fn minimum_effects(&self) -> Capabilities {
        match self {
            OperatorKind::LoadIndirect { .. } => Capabilities::MAY_READ_THROUGH_POINTER_OPERANDS,
            OperatorKind::StoreIndirect { .. } => {
                Capabilities::MAY_WRITE_THROUGH_POINTER_OPERANDS
                    | Capabilities::MAY_MUTATE_EXISTING_STORAGE
            }
            OperatorKind::LoadInstanceField { .. } => {
                Capabilities::MAY_READ_EXISTING_MUTABLE_STORAGE
            }
            OperatorKind::StoreInstanceField { .. } => Capabilities::MAY_MUTATE_EXISTING_STORAGE,
            OperatorKind::AllocateObject { .. } => Capabilities::MAY_ALLOCATE_STORAGE,
            OperatorKind::DirectSubroutine { .. } | OperatorKind::IndirectSubroutine { .. } => {
                Capabilities::EFFECTS
            }
            OperatorKind::Throw => Capabilities::MAY_THROW,
            _ => Capabilities::empty(),
        }
    }

    /// The mask a freshly built operator of this kind carries.
    pub fn default_capabilities(&self) -> Capabilities {
        let base = Capabilities::pure_computation(self.allows_commutative());
        match self {
            OperatorKind::Nop => base | Capabilities::IS_META_OPERATOR,
            OperatorKind::Binary { alu, overflow, .. } if *overflow || alu.may_trap() => {
                base.with(Capabilities::MAY_THROW)
            }
            OperatorKind::Unary { overflow: true, .. }
            | OperatorKind::Convert { overflow: true, .. } => base.with(Capabilities::MAY_THROW),
            OperatorKind::LoadIndirect { .. } => base.with(
                Capabilities::MAY_READ_THROUGH_POINTER_OPERANDS
                    | Capabilities::MAY_READ_EXISTING_MUTABLE_STORAGE,
            ),
            OperatorKind::LoadInstanceField { .. } => base.with(
                Capabilities::MAY_READ_EXISTING_MUTABLE_STORAGE | Capabilities::MAY_THROW,
            ),
            OperatorKind::StoreInstanceField { .. } => {
                base.with(Capabilities::MAY_MUTATE_EXISTING_STORAGE | Capabilities::MAY_THROW)
            }
            OperatorKind::AllocateObject { .. } => {
                base.with(Capabilities::MAY_ALLOCATE_STORAGE | Capabilities::MAY_THROW)
            }
            OperatorKind::DirectSubroutine { .. } | OperatorKind::IndirectSubroutine { .. } => {
                Capabilities::opaque()
            }
            _ => base.with(self.minimum_effects()),
        }
    }

    /// Why `caps` is not an acceptable mask for this kind, if it is not.
    pub fn capability_problem(&self, caps: Capabilities) -> Option<String> {
        if !caps.is_well_formed() {
            return Some(format!("unpaired capability mask {:#x}", caps.bits()));
        }
        if caps.is_commutative() && !self.allows_commutative() {
            return Some(format!("{} is not commutative", self.name()));
        }
        if caps.is_meta_operator() != matches!(self, OperatorKind::Nop) {
            return Some(format!("meta-operator flag does not match {}", self.name()));
        }
        let missing = self.minimum_effects() - caps;
        if !missing.is_empty() {
            return Some(format!("{} must declare {}", self.name(), missing));
        }
        None
    }
}

/// A computation or effect node
#[derive(Debug, Clone, PartialEq)]
pub struct Operator {
    kind: OperatorKind,
    capabilities: Capabilities,
    level: OperatorLevel,
    debug_info: Option<DebugInfo>,
    block: Option<BlockId>,
    results: Vec<ExprId>,
    arguments: Vec<ExprId>,
    annotations: Vec<Annotation>,
}

impl Operator {
    fn build(kind: OperatorKind, results: Vec<ExprId>, arguments: Vec<ExprId>) -> Self {
        Self {
            capabilities: kind.default_capabilities(),
            level: kind.level(),
            kind,
            debug_info: None,
            block: None,
            results,
            arguments,
            annotations: Vec::new(),
        }
    }

    // =========================================================================
    // Factories
    // =========================================================================

    pub fn nop() -> Self {
        Self::build(OperatorKind::Nop, Vec::new(), Vec::new())
    }

    /// `lhs = rhs`
    pub fn assignment(lhs: ExprId, rhs: ExprId) -> Self {
        Self::build(OperatorKind::Assignment, vec![lhs], vec![rhs])
    }

    /// `lhs = left <alu> right`
    pub fn binary(
        alu: AluOperation,
        signed: bool,
        overflow: bool,
        lhs: ExprId,
        left: ExprId,
        right: ExprId,
    ) -> Self {
        Self::build(
            OperatorKind::Binary {
                alu,
                signed,
                overflow,
            },
            vec![lhs],
            vec![left, right],
        )
    }

    pub fn unary(
        op: UnaryOperation,
        signed: bool,
        overflow: bool,
        lhs: ExprId,
        operand: ExprId,
    ) -> Self {
        Self::build(
            OperatorKind::Unary {
                op,
                signed,
                overflow,
            },
            vec![lhs],
            vec![operand],
        )
    }

    pub fn convert(
        input: BuiltInType,
        output: BuiltInType,
        overflow: bool,
        lhs: ExprId,
        operand: ExprId,
    ) -> Self {
        Self::build(
            OperatorKind::Convert {
                input,
                output,
                overflow,
            },
            vec![lhs],
            vec![operand],
        )
    }

    /// `lhs = left <condition> right ? 1 : 0`
    pub fn compare_and_set(
        condition: Condition,
        signed: bool,
        lhs: ExprId,
        left: ExprId,
        right: ExprId,
    ) -> Self {
        Self::build(
            OperatorKind::CompareAndSet { condition, signed },
            vec![lhs],
            vec![left, right],
        )
    }

    pub fn load_indirect(ty: TypeId, offset: i32, lhs: ExprId, pointer: ExprId) -> Self {
        Self::build(
            OperatorKind::LoadIndirect { ty, offset },
            vec![lhs],
            vec![pointer],
        )
    }

    pub fn store_indirect(ty: TypeId, offset: i32, pointer: ExprId, value: ExprId) -> Self {
        Self::build(
            OperatorKind::StoreIndirect { ty, offset },
            Vec::new(),
            vec![pointer, value],
        )
    }

    pub fn load_instance_field(field: FieldId, lhs: ExprId, object: ExprId) -> Self {
        Self::build(
            OperatorKind::LoadInstanceField { field },
            vec![lhs],
            vec![object],
        )
    }

    pub fn store_instance_field(field: FieldId, object: ExprId, value: ExprId) -> Self {
        Self::build(
            OperatorKind::StoreInstanceField { field },
            Vec::new(),
            vec![object, value],
        )
    }

    pub fn allocate_object(ty: TypeId, lhs: ExprId) -> Self {
        Self::build(OperatorKind::AllocateObject { ty }, vec![lhs], Vec::new())
    }

    /// Call to a statically known method; arguments are stored verbatim.
    pub fn direct_subroutine(target: MethodId, arguments: Vec<ExprId>) -> Self {
        Self::build(
            OperatorKind::DirectSubroutine { target },
            Vec::new(),
            arguments,
        )
    }

    /// Call through a computed address.
    ///
    /// The callee is inserted as argument 0, ahead of `arguments`.
    pub fn indirect_subroutine(
        signature: MethodId,
        callee: ExprId,
        mut arguments: Vec<ExprId>,
    ) -> Self {
        arguments.insert(0, callee);
        Self::build(
            OperatorKind::IndirectSubroutine { signature },
            Vec::new(),
            arguments,
        )
    }

    pub fn unconditional(target: BlockId) -> Self {
        Self::build(
            OperatorKind::Unconditional { target },
            Vec::new(),
            Vec::new(),
        )
    }

    /// Branch on `condition != 0`
    pub fn binary_conditional(
        condition: ExprId,
        false_target: BlockId,
        true_target: BlockId,
    ) -> Self {
        Self::build(
            OperatorKind::BinaryConditional {
                false_target,
                true_target,
            },
            Vec::new(),
            vec![condition],
        )
    }

    pub fn compare_conditional(
        condition: Condition,
        signed: bool,
        left: ExprId,
        right: ExprId,
        false_target: BlockId,
        true_target: BlockId,
    ) -> Self {
        Self::build(
            OperatorKind::CompareConditional {
                condition,
                signed,
                false_target,
                true_target,
            },
            Vec::new(),
            vec![left, right],
        )
    }

    pub fn return_control(value: Option<ExprId>) -> Self {
        Self::build(OperatorKind::Return, Vec::new(), value.into_iter().collect())
    }

    pub fn throw_control(exception: ExprId) -> Self {
        Self::build(OperatorKind::Throw, Vec::new(), vec![exception])
    }

    pub fn with_debug_info(mut self, debug_info: DebugInfo) -> Self {
        self.debug_info = Some(debug_info);
        self
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    pub fn kind(&self) -> &OperatorKind {
        &self.kind
    }

    pub fn capabilities(&self) -> Capabilities {
        self.capabilities
    }

    pub fn level(&self) -> OperatorLevel {
        self.level
    }

    pub fn debug_info(&self) -> Option<&DebugInfo> {
        self.debug_info.as_ref()
    }

    /// Owning block, `None` while detached
    pub fn block(&self) -> Option<BlockId> {
        self.block
    }

    /// Left-hand side
    pub fn results(&self) -> &[ExprId] {
        &self.results
    }

    /// Right-hand side
    pub fn arguments(&self) -> &[ExprId] {
        &self.arguments
    }

    pub fn annotations(&self) -> &[Annotation] {
        &self.annotations
    }

    pub fn first_result(&self) -> Option<ExprId> {
        self.results.first().copied()
    }

    pub fn first_argument(&self) -> Option<ExprId> {
        self.arguments.first().copied()
    }

    pub fn second_argument(&self) -> Option<ExprId> {
        self.arguments.get(1).copied()
    }

    pub fn is_control(&self) -> bool {
        self.kind.is_control()
    }

    pub fn successors(&self) -> Vec<BlockId> {
        self.kind.successors()
    }

    pub fn uses(&self, expr: ExprId) -> bool {
        self.arguments.contains(&expr)
    }

    pub fn defines(&self, expr: ExprId) -> bool {
        self.results.contains(&expr)
    }

    pub fn has_annotation(&self, annotation: &Annotation) -> bool {
        self.annotations.contains(annotation)
    }

    /// Whether copy propagation may replace `old` by `new` in this operator.
    ///
    /// Call arguments stay alive for unwinding and debugging, so calls refuse
    /// every slot.
    pub fn can_propagate_copy(&self, old: ExprId, new: ExprId) -> bool {
        if old == new || self.kind.is_subroutine() {
            return false;
        }
        !self.annotations.iter().any(|a| match a {
            Annotation::BlockCopyPropagation {
                index,
                is_result: false,
            } => self.arguments.get(*index) == Some(&old),
            _ => false,
        })
    }

    /// Fold integer operands, `None` when the operator cannot be evaluated.
    ///
    /// `operand_of` yields a constant operand with its type's width. The
    /// result still has to be truncated to the destination type.
    pub fn can_evaluate<F>(&self, operand_of: F) -> Option<i128>
    where
        F: Fn(ExprId) -> Option<IntegerOperand>,
    {
        let operand = |i: usize| -> Option<IntegerOperand> { operand_of(*self.arguments.get(i)?) };
        match &self.kind {
            OperatorKind::Binary {
                alu,
                signed,
                overflow: false,
            } => alu.evaluate(*signed, operand(0)?, operand(1)?),
            OperatorKind::Unary {
                op,
                overflow: false,
                ..
            } => {
                let v = operand(0)?.read(true);
                match op {
                    UnaryOperation::Neg => Some(v.wrapping_neg()),
                    UnaryOperation::Not => Some(!v),
                }
            }
            OperatorKind::CompareAndSet { condition, signed } => {
                Some(condition.evaluate(*signed, operand(0)?, operand(1)?) as i128)
            }
            _ => None,
        }
    }

    /// The target a conditional control operator takes on constant operands.
    pub fn can_evaluate_branch<F>(&self, operand_of: F) -> Option<BlockId>
    where
        F: Fn(ExprId) -> Option<IntegerOperand>,
    {
        let operand = |i: usize| -> Option<IntegerOperand> { operand_of(*self.arguments.get(i)?) };
        match &self.kind {
            OperatorKind::CompareConditional {
                condition,
                signed,
                false_target,
                true_target,
            } => {
                if condition.evaluate(*signed, operand(0)?, operand(1)?) {
                    Some(*true_target)
                } else {
                    Some(*false_target)
                }
            }
            OperatorKind::BinaryConditional {
                false_target,
                true_target,
            } => {
                if operand(0)?.read(false) != 0 {
                    Some(*true_target)
                } else {
                    Some(*false_target)
                }
            }
            _ => None,
        }
    }

    /// Text rendering through `dumper`, resolving names and labels.
    pub fn format_output(&self, dumper: &dyn IntermediateRepresentationDumper) -> String {
        let res = |i: usize| match self.results.get(i) {
            Some(e) => DumpArg::Expr(*e),
            None => DumpArg::Text("<none>".to_string()),
        };
        let arg = |i: usize| match self.arguments.get(i) {
            Some(e) => DumpArg::Expr(*e),
            None => DumpArg::Text("<none>".to_string()),
        };
        let sign = |signed: bool| if signed { "signed" } else { "unsigned" };

        let mut text = match &self.kind {
            OperatorKind::Nop => "nop".to_string(),
            OperatorKind::Assignment => dumper.format_output2("{0} = {1}", res(0), arg(0)),
            OperatorKind::Binary { alu, overflow, .. } => {
                let fmt = format!(
                    "{{0}} = {{1}} {}{} {{2}}",
                    alu.mnemonic(),
                    if *overflow { ".ovf" } else { "" }
                );
                dumper.format_output3(&fmt, res(0), arg(0), arg(1))
            }
            OperatorKind::Unary { op, overflow, .. } => {
                let fmt = format!(
                    "{{0}} = {}{} {{1}}",
                    op.mnemonic(),
                    if *overflow { ".ovf" } else { "" }
                );
                dumper.format_output2(&fmt, res(0), arg(0))
            }
            OperatorKind::Convert {
                input,
                output,
                overflow,
            } => {
                let fmt = format!(
                    "{{0}} = convert {{1}} from {} to {}{}",
                    input.name(),
                    output.name(),
                    if *overflow { " with overflow check" } else { "" }
                );
                dumper.format_output2(&fmt, res(0), arg(0))
            }
            OperatorKind::CompareAndSet { condition, signed } => {
                let fmt = format!(
                    "{{0}} = {{1}} {}.{} {{2}}",
                    condition.mnemonic(),
                    sign(*signed)
                );
                dumper.format_output3(&fmt, res(0), arg(0), arg(1))
            }
            OperatorKind::LoadIndirect { ty, offset } => dumper.format_output(
                "{0} = load {1} [{2} + {3}]",
                &[
                    res(0),
                    DumpArg::Type(*ty),
                    arg(0),
                    DumpArg::Text(offset.to_string()),
                ],
            ),
            OperatorKind::StoreIndirect { ty, offset } => dumper.format_output(
                "store {0} [{1} + {2}] = {3}",
                &[
                    DumpArg::Type(*ty),
                    arg(0),
                    DumpArg::Text(offset.to_string()),
                    arg(1),
                ],
            ),
            OperatorKind::LoadInstanceField { field } => {
                dumper.format_output3("{0} = {1}.{2}", res(0), arg(0), DumpArg::Field(*field))
            }
            OperatorKind::StoreInstanceField { field } => {
                dumper.format_output3("{0}.{1} = {2}", arg(0), DumpArg::Field(*field), arg(1))
            }
            OperatorKind::AllocateObject { ty } => {
                dumper.format_output2("{0} = new {1}", res(0), DumpArg::Type(*ty))
            }
            OperatorKind::DirectSubroutine { target } => {
                let slots: Vec<String> = (1..=self.arguments.len())
                    .map(|i| format!("{{{}}}", i))
                    .collect();
                let fmt = format!("directSubCall {{0}}({})", slots.join(", "));
                let mut args = vec![DumpArg::Method(*target)];
                args.extend(self.arguments.iter().map(|e| DumpArg::Expr(*e)));
                dumper.format_output(&fmt, &args)
            }
            OperatorKind::IndirectSubroutine { .. } => {
                let slots: Vec<String> = (1..self.arguments.len().max(1))
                    .map(|i| format!("{{{}}}", i))
                    .collect();
                let fmt = format!("indirectSubCall {{0}}( {} )", slots.join(", "));
                let args: Vec<DumpArg> = self.arguments.iter().map(|e| DumpArg::Expr(*e)).collect();
                dumper.format_output(&fmt, &args)
            }
            OperatorKind::Unconditional { target } => {
                dumper.format_output1("goto {0}", DumpArg::Block(*target))
            }
            OperatorKind::BinaryConditional {
                false_target,
                true_target,
            } => dumper.format_output3(
                "if {0} != ZERO then goto {1} else goto {2}",
                arg(0),
                DumpArg::Block(*true_target),
                DumpArg::Block(*false_target),
            ),
            OperatorKind::CompareConditional {
                condition,
                signed,
                false_target,
                true_target,
            } => {
                let fmt = format!(
                    "if {{0}} {}.{} {{1}} then goto {{2}} else goto {{3}}",
                    condition.mnemonic(),
                    sign(*signed)
                );
                dumper.format_output(
                    &fmt,
                    &[
                        arg(0),
                        arg(1),
                        DumpArg::Block(*true_target),
                        DumpArg::Block(*false_target),
                    ],
                )
            }
            OperatorKind::Return => match self.first_argument() {
                Some(value) => dumper.format_output1("return {0}", DumpArg::Expr(value)),
                None => "return".to_string(),
            },
            OperatorKind::Throw => dumper.format_output1("throw {0}", arg(0)),
        };

        if !self.kind.is_subroutine() && !self.is_control() && self.capabilities.may_throw() {
            text.push_str("  MayThrow");
        }
        text
    }

    // =========================================================================
    // Mutation, reachable through the owning graph only
    // =========================================================================

    pub(crate) fn set_block(&mut self, block: Option<BlockId>) {
        self.block = block;
    }

    pub(crate) fn set_arguments(&mut self, arguments: Vec<ExprId>) {
        self.arguments = arguments;
    }

    pub(crate) fn set_results(&mut self, results: Vec<ExprId>) {
        self.results = results;
    }

    pub(crate) fn set_debug_info(&mut self, debug_info: Option<DebugInfo>) {
        self.debug_info = debug_info;
    }

    /// Swap in a new kind, re-deriving capabilities and level.
    pub(crate) fn set_kind(&mut self, kind: OperatorKind) {
        self.capabilities = kind.default_capabilities();
        self.level = kind.level();
        self.kind = kind;
    }

    /// Replace every use of `old`, building a fresh argument array.
    pub(crate) fn substitute_usage(&mut self, old: ExprId, new: ExprId) -> bool {
        if !self.uses(old) {
            return false;
        }
        self.arguments = self
            .arguments
            .iter()
            .map(|&e| if e == old { new } else { e })
            .collect();
        true
    }

    /// Rewrite a single argument slot. Calls refuse.
    pub(crate) fn substitute_usage_at(&mut self, index: usize, new: ExprId) -> bool {
        if self.kind.is_subroutine() || index >= self.arguments.len() {
            return false;
        }
        let mut arguments = self.arguments.clone();
        arguments[index] = new;
        self.arguments = arguments;
        true
    }

    pub(crate) fn substitute_definition(&mut self, old: ExprId, new: ExprId) -> bool {
        if !self.defines(old) {
            return false;
        }
        self.results = self
            .results
            .iter()
            .map(|&e| if e == old { new } else { e })
            .collect();
        true
    }

    pub(crate) fn substitute_target(&mut self, old: BlockId, new: BlockId) -> bool {
        let swap = |b: &mut BlockId| {
            if *b == old {
                *b = new;
                true
            } else {
                false
            }
        };
        match &mut self.kind {
            OperatorKind::Unconditional { target } => swap(target),
            OperatorKind::BinaryConditional {
                false_target,
                true_target,
            }
            | OperatorKind::CompareConditional {
                false_target,
                true_target,
                ..
            } => {
                let a = swap(false_target);
                let b = swap(true_target);
                a || b
            }
            _ => false,
        }
    }

    /// Copy of this operator over other ids, detached from any block.
    ///
    /// `kind` must be the same variant as the current kind, so the
    /// capability mask and level carry over unchanged.
    pub(crate) fn remapped(
        &self,
        kind: OperatorKind,
        results: Vec<ExprId>,
        arguments: Vec<ExprId>,
        annotations: Vec<Annotation>,
    ) -> Operator {
        Operator {
            kind,
            capabilities: self.capabilities,
            level: self.level,
            debug_info: self.debug_info.clone(),
            block: None,
            results,
            arguments,
            annotations,
        }
    }

    /// Add an annotation unless an equal one is present.
    pub(crate) fn add_annotation(&mut self, annotation: Annotation) -> bool {
        if self.annotations.contains(&annotation) {
            return false;
        }
        self.annotations.push(annotation);
        true
    }

    pub(crate) fn remove_annotation(&mut self, annotation: &Annotation) -> bool {
        let before = self.annotations.len();
        self.annotations.retain(|a| a != annotation);
        before != self.annotations.len()
    }

    pub(crate) fn set_annotations(&mut self, annotations: Vec<Annotation>) {
        self.annotations = annotations;
    }

    /// Install a narrower mask; the error names what the kind forbids.
    pub(crate) fn refine_capabilities(&mut self, caps: Capabilities) -> Result<(), String> {
        if let Some(problem) = self.kind.capability_problem(caps) {
            return Err(problem);
        }
        self.capabilities = caps;
        Ok(())
    }

    /// Move a constant operand to the right for commutative or mirrorable
    /// comparisons. Returns whether the operands were swapped.
    pub(crate) fn ensure_constant_to_the_right<F>(&mut self, is_constant: F) -> bool
    where
        F: Fn(ExprId) -> bool,
    {
        let (left, right) = match (self.first_argument(), self.second_argument()) {
            (Some(l), Some(r)) => (l, r),
            _ => return false,
        };
        if !is_constant(left) || is_constant(right) {
            return false;
        }
        match &mut self.kind {
            OperatorKind::Binary { alu, .. } if alu.is_commutative() => {}
            OperatorKind::CompareAndSet { condition, .. }
            | OperatorKind::CompareConditional { condition, .. } => {
                *condition = condition.swapped();
            }
            _ => return false,
        }
        self.arguments = vec![right, left];
        true
    }
}

impl fmt::Display for Operator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let join = |ids: &[ExprId]| {
            ids.iter()
                .map(|e| e.to_string())
                .collect::<Vec<_>>()
                .join(", ")
        };
        write!(
            f,
            "{} Res: ({}) Arg: ({})",
            self.kind.name(),
            join(&self.results),
            join(&self.arguments)
        )?;
        if self.capabilities.may_throw() {
            write!(f, " MayThrow")?;
        }
        Ok(())
    }
}
