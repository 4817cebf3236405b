//! # embir - IR framework for an embedded AOT compiler
//!
//! The intermediate representation every compilation pass of an
//! ahead-of-time compiler for microcontrollers reads and rewrites: operators
//! over expressions, grouped into basic blocks and exception regions, one
//! control-flow graph per method, plus the machinery to walk, clone and
//! inline those graphs safely.
//!
//! ## Features
//!
//! - **Arena-backed graphs** - blocks, operators and expressions are owned
//!   by their graph and addressed by typed ids
//! - **Capability facts** - every operator carries a paired effect mask
//!   (throws? allocates? writes through pointers?) derived by its factory
//! - **Exception regions** - nested protected ranges with catch, filter,
//!   finally and fault handlers
//! - **Generic rewriting** - [`compiler::ir::TransformationContext`] and
//!   [`compiler::ir::CloningContext`] for passes, specialization and inlining
//! - **Parallel driver** - one worker per method, shared read-mostly type
//!   system
//!
//! ## Quick Start
//!
//! Build the graph of `static int Math::Add(int a, int b)` and print it:
//!
//! ```rust
//! use embir::compiler::ir::{
//!     AluOperation, BuiltInType, MethodDesc, Operator, TypeDesc, TypeKind, TypeSystemForIr,
//! };
//! use embir::compiler::{dump_ir, TargetLayout};
//!
//! # fn main() -> embir::Result<()> {
//! let bridge = TypeSystemForIr::new(TargetLayout::default());
//! let math = bridge.register_type(TypeDesc::new("Math", TypeKind::Reference))?;
//! let i4 = bridge.builtin(BuiltInType::I4);
//! let add = bridge.register_method(
//!     MethodDesc::new("Add", math, true)
//!         .with_parameters(vec![i4, i4])
//!         .with_parameter_names(vec!["a", "b"])
//!         .with_return_type(i4),
//! )?;
//!
//! // Slot 0 of a static method is the declaring-type pointer
//! let (mut cfg, args, _locals) = bridge.create_control_flow_graph_state(add, None, None)?;
//! let body = cfg.create_first_normal_basic_block()?;
//! let ret = cfg.return_value().expect("Add returns a value");
//! cfg.add_operator(
//!     body,
//!     Operator::binary(AluOperation::Add, true, false, ret, args[1], args[2]),
//! )?;
//! cfg.finalize()?;
//!
//! assert!(dump_ir(&cfg, Some(&bridge)).contains("ReturnValue = a add b"));
//! # Ok(())
//! # }
//! ```
//!
//! ## Compiling many methods
//!
//! ```rust,ignore
//! use embir::compiler::{CompileOptions, Compiler, MethodOutcome};
//!
//! let compiler = Compiler::new(CompileOptions::from_file("embir.json")?);
//! let report = compiler.run(&bridge, graphs)?;
//! for outcome in report.outcomes {
//!     match outcome {
//!         MethodOutcome::Compiled(cfg) => emit(cfg),
//!         MethodOutcome::Skipped { method, .. } => emit_trap_stub(method),
//!     }
//! }
//! ```
//!
//! ## Error Handling
//!
//! All fallible operations return [`Result<T>`](Result). Errors are
//! classified by [`Error::classify`]:
//!
//! - [`ErrorSeverity::MethodFatal`] - abandon the method, keep compiling
//! - [`ErrorSeverity::RunFatal`] - the IR contract was broken, abort
//! - [`ErrorSeverity::Recoverable`] - a bridge lookup failed
//!
//! ## Logging
//!
//! The crate logs through [`tracing`] and installs no subscriber.
//!
//! ## Module Overview
//!
//! - [`compiler::ir`] - graph data model and transformation infrastructure
//! - [`compiler`] - options, pass driver, dumper, verifier, reference passes
//! - [`parallel`] - bounded rayon pool for per-method work
//! - [`error`] - error types and severity

/// Version of the embir crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

pub mod compiler;
pub mod error;
pub mod parallel;

// Re-export main types
pub use compiler::ir::{
    BlockId, Capabilities, ControlFlowGraphState, ExprId, OpId, Operator, OperatorKind,
    TypeSystemForIr,
};
pub use compiler::{CompileOptions, Compiler, FailurePolicy, MethodOutcome, Pass, TargetLayout};
pub use error::{Error, ErrorSeverity, Result};
