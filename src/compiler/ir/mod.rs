//! # Intermediate Representation (IR)
//!
//! The graph every compilation pass reads and rewrites: operators over
//! expressions, grouped into basic blocks, guarded by exception clauses,
//! one graph per method.
//!
//! ## Module Structure
//!
//! ```text
//! ir/
//! ├── mod.rs           # This file - module definition and re-exports
//! ├── arena.rs         # Id<T> handles and Arena<T> storage
//! ├── types.rs         # BuiltInType, TypeDesc, FieldDesc, MethodDesc
//! ├── expression.rs    # ConstantExpression, VariableExpression
//! ├── capabilities.rs  # Capabilities bit-set, OperatorLevel
//! ├── operator.rs      # Operator, OperatorKind and their factories
//! ├── basic_block.rs   # BasicBlock, ExceptionClause, BlockEdge
//! ├── cfg.rs           # ControlFlowGraphState and its mutation API
//! ├── type_system.rs   # TypeSystemForIr, the type-system bridge
//! └── transform.rs     # IrTransform, TransformationContext, CloningContext
//! ```
//!
//! ## Key Types
//!
//! - [`ControlFlowGraphState`] - owns every node of one method in arenas;
//!   cross-references are [`Id`]s, never pointers
//! - [`Operator`] - built only through factories that derive its
//!   [`Capabilities`] from its [`OperatorKind`]
//! - [`TypeSystemForIr`] - shared, read-mostly descriptor tables and the
//!   only fabricator of runtime-fact constants
//! - [`TransformationContext`] - drives an [`IrTransform`] over a graph
//! - [`CloningContext`] - identity-mapped copy or inline of a graph
//!
//! ## Graph Lifecycle
//!
//! ```text
//! Unbuilt → UnderConstruction (passes running) → Finalized (code generation)
//! ```
//!
//! A graph is owned by exactly one worker for its whole life; nothing in
//! this module locks. Only [`TypeSystemForIr`] is shared between workers.

pub mod arena;
pub mod basic_block;
pub mod capabilities;
pub mod cfg;
pub mod expression;
pub mod operator;
pub mod transform;
pub mod type_system;
pub mod types;

pub use arena::{Arena, Id};
pub use basic_block::{
    BasicBlock, BlockEdge, BlockId, BlockKind, ClauseId, EdgeClass, ExceptionClause, ExceptionFlag,
};
pub use capabilities::{Capabilities, OperatorLevel};
pub use cfg::{CfgState, ControlFlowGraphState};
pub use expression::{
    ConstantExpression, ConstantValue, ExprId, Expression, RuntimeHandle, VariableDebugInfo,
    VariableExpression, VariableKind,
};
pub use operator::{
    AluOperation, Annotation, Condition, DebugInfo, IntegerOperand, OpId, Operator, OperatorKind,
    UnaryOperation,
};
pub use transform::{
    clone_graph, Ancestor, CloneMap, CloningContext, DescriptorConverter, IdentityConverter,
    InlinedBody, IrTransform, Node, TransformationContext,
};
pub use type_system::{DescriptorRef, HostValue, TypeSystemForIr, WellKnownTypes};
pub use types::{
    BuiltInType, FieldDesc, FieldId, MethodDesc, MethodId, TypeDesc, TypeId, TypeKind, TypeLayout,
};
