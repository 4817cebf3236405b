//! # embir Compiler - per-method pass pipeline over the IR
//!
//! Every method of the program is lowered into its own
//! [`ControlFlowGraphState`]; the [`Compiler`] then runs a pipeline of
//! [`Pass`]es over all graphs in parallel, one worker per graph, and
//! finalizes each graph for code generation.
//!
//! ## Architecture
//!
//! ```text
//! bytecode → TypeSystemForIr + CFG per method → passes (parallel) → finalize → codegen
//! ```
//!
//! ## Usage
//!
//! ```ignore
//! use embir::compiler::{CompileOptions, Compiler};
//!
//! let options = CompileOptions::from_file("embir.json")?;
//! let compiler = Compiler::new(options);
//! let report = compiler.run(&bridge, graphs)?;
//! for outcome in report.outcomes {
//!     // emit code, or a trap stub for skipped methods
//! }
//! ```

pub mod debug;
pub mod ir;
pub mod optimizer;
pub mod verifier;

pub use debug::{dump_ir, DumpArg, IntermediateRepresentationDumper, TextDumper};
pub use optimizer::{
    ConstantFolding, CopyPropagation, DeadCodeElimination, DeduplicateConstants, Optimizer,
};
pub use verifier::{GraphStats, GraphVerifier, VerifyError, VerifyResult};

use crate::error::ErrorSeverity;
use crate::parallel::{parallel_map, ParallelConfig};
use crate::{Error, Result};
use ir::{ControlFlowGraphState, MethodId, TypeSystemForIr};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Pointer geometry of the embedded target
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetLayout {
    /// Pointer size in bytes
    pub pointer_size: u32,
    /// Pointer alignment in bytes
    pub pointer_align: u32,
}

impl Default for TargetLayout {
    fn default() -> Self {
        // 32-bit microcontroller
        Self {
            pointer_size: 4,
            pointer_align: 4,
        }
    }
}

/// What to do when a method fails to compile
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum FailurePolicy {
    /// Report the method as skipped; the caller emits a trap stub for it
    #[default]
    SkipMethod,
    /// Fail the whole build on the first method error
    AbortBuild,
}

/// Compilation options
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CompileOptions {
    /// Optimization level (0-2)
    pub opt_level: u8,
    /// Target pointer geometry
    pub target: TargetLayout,
    /// Per-method failure handling
    pub failure_policy: FailurePolicy,
    /// Worker threads (default: num_cpus)
    pub max_parallelism: Option<usize>,
    /// Run the graph verifier after every pass that changed the graph
    pub verify_after_each_pass: bool,
    /// Log the graph at debug level after every pass that changed it
    pub dump_after_each_pass: bool,
}

impl Default for CompileOptions {
    fn default() -> Self {
        Self {
            opt_level: 2,
            target: TargetLayout::default(),
            failure_policy: FailurePolicy::SkipMethod,
            max_parallelism: None,
            verify_after_each_pass: false,
            dump_after_each_pass: false,
        }
    }
}

impl CompileOptions {
    /// Parse options from JSON; missing fields take their defaults.
    pub fn from_json_str(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| Error::Config(format!("invalid options: {}", e)))
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("cannot read {}: {}", path.display(), e)))?;
        Self::from_json_str(&text)
    }

    /// Effective worker count
    pub fn parallelism(&self) -> usize {
        self.max_parallelism.unwrap_or_else(num_cpus::get).max(1)
    }
}

/// A transformation over one graph.
///
/// Passes are shared by every worker, so they carry no per-graph state.
pub trait Pass: Send + Sync {
    fn name(&self) -> &'static str;

    /// Run over `cfg`, returning whether anything changed.
    fn run(&self, bridge: &TypeSystemForIr, cfg: &mut ControlFlowGraphState) -> Result<bool>;
}

/// Result of compiling one method
#[derive(Debug)]
pub enum MethodOutcome {
    /// Finalized graph, ready for code generation
    Compiled(ControlFlowGraphState),
    /// The method failed with a method-fatal error
    Skipped {
        method: MethodId,
        name: String,
        error: Error,
    },
}

impl MethodOutcome {
    pub fn method(&self) -> MethodId {
        match self {
            MethodOutcome::Compiled(cfg) => cfg.method(),
            MethodOutcome::Skipped { method, .. } => *method,
        }
    }

    pub fn is_compiled(&self) -> bool {
        matches!(self, MethodOutcome::Compiled(_))
    }
}

/// Outcome of a whole run, in input order
#[derive(Debug)]
pub struct CompileReport {
    pub outcomes: Vec<MethodOutcome>,
}

impl CompileReport {
    pub fn compiled_count(&self) -> usize {
        self.outcomes.iter().filter(|o| o.is_compiled()).count()
    }

    pub fn skipped_count(&self) -> usize {
        self.outcomes.len() - self.compiled_count()
    }
}

/// Parallel pass driver
pub struct Compiler {
    options: CompileOptions,
    passes: Vec<Box<dyn Pass>>,
}

impl Compiler {
    /// Create a compiler running the optimizer pipeline for `options.opt_level`
    pub fn new(options: CompileOptions) -> Self {
        let passes = Optimizer::new(options.opt_level).passes();
        Self { options, passes }
    }

    /// Create a compiler with an explicit pipeline
    pub fn with_passes(options: CompileOptions, passes: Vec<Box<dyn Pass>>) -> Self {
        Self { options, passes }
    }

    /// Append a pass to the pipeline
    pub fn add_pass(&mut self, pass: Box<dyn Pass>) {
        self.passes.push(pass);
    }

    pub fn options(&self) -> &CompileOptions {
        &self.options
    }

    pub fn pass_names(&self) -> Vec<&'static str> {
        self.passes.iter().map(|p| p.name()).collect()
    }

    /// Run the pipeline over one graph and finalize it.
    pub fn compile_method(
        &self,
        bridge: &TypeSystemForIr,
        cfg: &mut ControlFlowGraphState,
    ) -> Result<()> {
        for pass in &self.passes {
            let changed = pass.run(bridge, cfg)?;
            tracing::debug!(
                method = %cfg.method_name(),
                pass = pass.name(),
                changed,
                version = cfg.version(),
                "pass finished"
            );
            if !changed {
                continue;
            }
            if self.options.verify_after_each_pass {
                GraphVerifier::new().verify(cfg).into_result(cfg)?;
            }
            if self.options.dump_after_each_pass {
                tracing::debug!(
                    method = %cfg.method_name(),
                    pass = pass.name(),
                    "\n{}",
                    dump_ir(cfg, Some(bridge))
                );
            }
        }
        cfg.finalize()
    }

    /// Compile every graph, one worker per graph.
    ///
    /// The bridge must have been built for `options.target`; sizes and
    /// offsets folded into the graphs come from its layout. Method-fatal and
    /// recoverable errors skip the method under [`FailurePolicy::SkipMethod`];
    /// run-fatal errors, and any error under [`FailurePolicy::AbortBuild`],
    /// fail the run.
    pub fn run(
        &self,
        bridge: &TypeSystemForIr,
        graphs: Vec<ControlFlowGraphState>,
    ) -> Result<CompileReport> {
        if *bridge.layout() != self.options.target {
            return Err(Error::contract(
                "compile",
                format!(
                    "options target {:?} but the type system was built for {:?}",
                    self.options.target,
                    bridge.layout()
                ),
            ));
        }
        let config = ParallelConfig {
            max_parallelism: self.options.parallelism(),
            fail_fast: self.options.failure_policy == FailurePolicy::AbortBuild,
        };
        let total = graphs.len();

        let results = parallel_map(
            graphs,
            |mut cfg| {
                let method = cfg.method();
                let outcome = match self.compile_method(bridge, &mut cfg) {
                    Ok(()) => MethodOutcome::Compiled(cfg),
                    Err(error) => MethodOutcome::Skipped {
                        method,
                        name: cfg.method_name().to_string(),
                        error,
                    },
                };
                self.check_policy(outcome)
            },
            &config,
        )?;

        let mut outcomes = Vec::with_capacity(total);
        for result in results {
            outcomes.push(result?);
        }
        for outcome in &outcomes {
            if let MethodOutcome::Skipped { name, error, .. } = outcome {
                tracing::warn!(method = %name, error = %error, "method skipped");
            }
        }
        let report = CompileReport { outcomes };
        tracing::debug!(
            compiled = report.compiled_count(),
            skipped = report.skipped_count(),
            "compilation finished"
        );
        Ok(report)
    }

    /// Turn a skipped method into a run failure when the policy or the
    /// error's severity demands it.
    fn check_policy(&self, outcome: MethodOutcome) -> Result<MethodOutcome> {
        match outcome {
            MethodOutcome::Skipped { name, error, .. }
                if error.classify() == ErrorSeverity::RunFatal
                    || self.options.failure_policy == FailurePolicy::AbortBuild =>
            {
                tracing::error!(method = %name, error = %error, "aborting compilation");
                Err(error.in_method(name))
            }
            other => Ok(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::ir::{BuiltInType, MethodDesc, Operator, TypeDesc, TypeKind};

    #[test]
    fn test_options_from_json() {
        let options = CompileOptions::from_json_str(
            r#"{ "opt_level": 1, "target": { "pointer_size": 2, "pointer_align": 2 },
                 "failure_policy": "AbortBuild" }"#,
        )
        .unwrap();
        assert_eq!(options.opt_level, 1);
        assert_eq!(options.target.pointer_size, 2);
        assert_eq!(options.failure_policy, FailurePolicy::AbortBuild);
        assert!(!options.verify_after_each_pass);
    }

    #[test]
    fn test_options_defaults_and_errors() {
        let options = CompileOptions::from_json_str("{}").unwrap();
        assert_eq!(options, CompileOptions::default());
        assert!(options.parallelism() >= 1);

        let err = CompileOptions::from_json_str("{ \"opt_level\": \"high\" }").unwrap_err();
        assert!(matches!(err, Error::Config(_)));
        assert!(matches!(
            CompileOptions::from_file("/nonexistent/embir.json"),
            Err(Error::Config(_))
        ));
    }

    struct Breaks;

    impl Pass for Breaks {
        fn name(&self) -> &'static str {
            "Breaks"
        }

        /// Leaves the first body block without a control operator
        fn run(&self, _bridge: &TypeSystemForIr, cfg: &mut ControlFlowGraphState) -> Result<bool> {
            if cfg.method_name().ends_with("Bad") {
                let body = cfg.blocks()[2];
                if let Some(ctl) = cfg.control_operator(body) {
                    cfg.remove_operator(ctl)?;
                }
            }
            Ok(true)
        }
    }

    fn graphs(ts: &TypeSystemForIr, names: &[&str]) -> Vec<ControlFlowGraphState> {
        let owner = ts.register_type(TypeDesc::new("Prog", TypeKind::Reference)).unwrap();
        let i4 = ts.builtin(BuiltInType::I4);
        names
            .iter()
            .map(|name| {
                let method = ts
                    .register_method(MethodDesc::new(*name, owner, true).with_return_type(i4))
                    .unwrap();
                let (mut cfg, _, _) = ts.create_control_flow_graph_state(method, None, None).unwrap();
                let body = cfg.create_first_normal_basic_block().unwrap();
                let ret = cfg.return_value().unwrap();
                let one = ts
                    .create_constant(&mut cfg, i4, crate::compiler::ir::ConstantValue::Int(1))
                    .unwrap();
                cfg.add_operator(body, Operator::assignment(ret, one)).unwrap();
                cfg
            })
            .collect()
    }

    #[test]
    fn test_run_compiles_all_methods() {
        let ts = TypeSystemForIr::new(TargetLayout::default());
        let compiler = Compiler::new(CompileOptions {
            verify_after_each_pass: true,
            max_parallelism: Some(2),
            ..CompileOptions::default()
        });
        let report = compiler.run(&ts, graphs(&ts, &["A", "B", "C"])).unwrap();
        assert_eq!(report.compiled_count(), 3);
        assert!(report.outcomes.iter().all(|o| match o {
            MethodOutcome::Compiled(cfg) => cfg.is_finalized(),
            MethodOutcome::Skipped { .. } => false,
        }));
    }

    #[test]
    fn test_run_rejects_mismatched_target() {
        let ts = TypeSystemForIr::new(TargetLayout::default());
        let compiler = Compiler::new(CompileOptions {
            target: TargetLayout {
                pointer_size: 2,
                pointer_align: 2,
            },
            ..CompileOptions::default()
        });
        let err = compiler.run(&ts, graphs(&ts, &["A"])).unwrap_err();
        assert!(matches!(err, Error::ContractViolation { .. }));
        assert_eq!(err.classify(), ErrorSeverity::RunFatal);
    }

    #[test]
    fn test_structural_failure_skips_method() {
        let ts = TypeSystemForIr::new(TargetLayout::default());
        let compiler = Compiler::with_passes(CompileOptions::default(), vec![Box::new(Breaks)]);
        let report = compiler.run(&ts, graphs(&ts, &["Good", "Bad"])).unwrap();
        assert_eq!(report.compiled_count(), 1);
        match &report.outcomes[1] {
            MethodOutcome::Skipped { name, error, .. } => {
                assert_eq!(name, "Prog::Bad");
                assert_eq!(error.classify(), ErrorSeverity::MethodFatal);
            }
            other => panic!("expected skip, got {:?}", other),
        }
    }

    #[test]
    fn test_abort_policy_fails_run() {
        let ts = TypeSystemForIr::new(TargetLayout::default());
        let options = CompileOptions {
            failure_policy: FailurePolicy::AbortBuild,
            ..CompileOptions::default()
        };
        let compiler = Compiler::with_passes(options, vec![Box::new(Breaks)]);
        let err = compiler.run(&ts, graphs(&ts, &["Good", "Bad"])).unwrap_err();
        assert!(matches!(err, Error::CompilationFailure { ref method, .. } if method == "Prog::Bad"));
    }
}
