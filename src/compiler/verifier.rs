//! # Graph Verifier
//!
//! Checks the structural invariants of a [`ControlFlowGraphState`] before it
//! is frozen for code generation. The mutation API already refuses most
//! malformed edits; the verifier catches what raw construction, cloning and
//! multi-step rewrites can leave behind.

use super::ir::{
    BlockId, BlockKind, ClauseId, ControlFlowGraphState, EdgeClass, ExprId, OpId,
};
use crate::{Error, Result};
use std::collections::HashSet;

/// Verification result with warnings
#[derive(Debug)]
pub struct VerifyResult {
    /// Graph may be finalized
    pub valid: bool,
    /// Errors that prevent finalization
    pub errors: Vec<VerifyError>,
    /// Warnings (non-fatal)
    pub warnings: Vec<String>,
    /// Statistics
    pub stats: GraphStats,
}

/// Graph statistics
#[derive(Debug, Default)]
pub struct GraphStats {
    /// Live blocks
    pub block_count: usize,
    /// Blocks reachable from the entry
    pub reachable_blocks: usize,
    /// Operators in live blocks
    pub operator_count: usize,
    /// Operators that may raise an exception
    pub throwing_operators: usize,
    /// Exception clauses
    pub clause_count: usize,
    /// Variables across all tables
    pub variable_count: usize,
}

/// Verification error types
#[derive(Debug, Clone, PartialEq)]
pub enum VerifyError {
    /// A layout entry names a block that does not exist.
    DanglingBlock { block: BlockId },

    /// Entry or exit is missing, duplicated or of the wrong kind.
    EntryExit { message: String },

    /// Operator and block disagree about ownership.
    OwnershipMismatch { block: BlockId, operator: OpId },

    /// An operator references an expression that is not stored.
    DanglingExpression {
        block: BlockId,
        operator: OpId,
        expression: ExprId,
    },

    /// A constant appears as an operator result.
    ConstantAssigned { block: BlockId, operator: OpId },

    /// A control operator is followed by other operators.
    MisplacedControl { block: BlockId, operator: OpId },

    /// A reachable block falls off its end.
    MissingControl { block: BlockId },

    /// A control operator targets a block it may not.
    InvalidTarget {
        block: BlockId,
        target: BlockId,
        reason: &'static str,
    },

    /// The exit block has successors.
    ExitHasSuccessors,

    /// Clause and handler block disagree.
    HandlerMismatch { clause: ClauseId, message: String },

    /// Two clauses partially overlap.
    ClauseOverlap { first: ClauseId, second: ClauseId },

    /// A block's protection list and the clause table disagree.
    ProtectionMismatch { block: BlockId, clause: ClauseId },

    /// An operator's capability mask is not acceptable for its kind.
    CapabilityViolation {
        block: BlockId,
        operator: OpId,
        message: String,
    },

    /// An exception edge starts at an operator that cannot throw.
    SpuriousExceptionEdge { block: BlockId, position: usize },
}

impl std::fmt::Display for VerifyError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            VerifyError::DanglingBlock { block } => {
                write!(f, "layout names missing block {}", block)
            }
            VerifyError::EntryExit { message } => write!(f, "{}", message),
            VerifyError::OwnershipMismatch { operator, .. } => {
                write!(f, "operator {} is owned by another block", operator)
            }
            VerifyError::DanglingExpression {
                operator,
                expression,
                ..
            } => write!(
                f,
                "operator {} references missing expression {}",
                operator, expression
            ),
            VerifyError::ConstantAssigned { operator, .. } => {
                write!(f, "operator {} assigns to a constant", operator)
            }
            VerifyError::MisplacedControl { operator, .. } => {
                write!(f, "control operator {} is not last in its block", operator)
            }
            VerifyError::MissingControl { .. } => {
                write!(f, "block does not end with a control operator")
            }
            VerifyError::InvalidTarget { target, reason, .. } => {
                write!(f, "branch to {}: {}", target, reason)
            }
            VerifyError::ExitHasSuccessors => write!(f, "exit block cannot have successors"),
            VerifyError::HandlerMismatch { clause, message } => {
                write!(f, "clause {}: {}", clause, message)
            }
            VerifyError::ClauseOverlap { first, second } => {
                write!(f, "clauses {} and {} partially overlap", first, second)
            }
            VerifyError::ProtectionMismatch { clause, .. } => {
                write!(f, "protection by clause {} is recorded on one side only", clause)
            }
            VerifyError::CapabilityViolation { message, .. } => write!(f, "{}", message),
            VerifyError::SpuriousExceptionEdge { position, .. } => write!(
                f,
                "exception edge originates at operator {} which cannot throw",
                position
            ),
        }
    }
}

impl VerifyError {
    /// Printable location within `cfg`
    pub fn location(&self, cfg: &ControlFlowGraphState) -> String {
        match self {
            VerifyError::OwnershipMismatch { block, .. }
            | VerifyError::DanglingExpression { block, .. }
            | VerifyError::ConstantAssigned { block, .. }
            | VerifyError::MisplacedControl { block, .. }
            | VerifyError::MissingControl { block }
            | VerifyError::InvalidTarget { block, .. }
            | VerifyError::ProtectionMismatch { block, .. }
            | VerifyError::CapabilityViolation { block, .. }
            | VerifyError::SpuriousExceptionEdge { block, .. } => cfg.label(*block),
            VerifyError::DanglingBlock { .. } => "block layout".to_string(),
            VerifyError::EntryExit { .. } => "graph".to_string(),
            VerifyError::ExitHasSuccessors => cfg.label(cfg.exit_block()),
            VerifyError::HandlerMismatch { .. } | VerifyError::ClauseOverlap { .. } => {
                "exception clause".to_string()
            }
        }
    }
}

impl VerifyResult {
    /// The first error as a framework error, if any.
    ///
    /// Capability problems surface as [`Error::CapabilityViolation`],
    /// everything else as [`Error::Structural`].
    pub fn into_result(self, cfg: &ControlFlowGraphState) -> Result<()> {
        let Some(first) = self.errors.into_iter().next() else {
            return Ok(());
        };
        tracing::warn!(method = %cfg.method_name(), error = %first, "graph verification failed");
        match &first {
            VerifyError::CapabilityViolation {
                operator, message, ..
            } => Err(Error::CapabilityViolation {
                method: cfg.method_name().to_string(),
                operator: cfg
                    .operator(*operator)
                    .map(ToString::to_string)
                    .unwrap_or_else(|| operator.to_string()),
                message: message.clone(),
            }),
            other => Err(Error::structural(
                cfg.method_name(),
                other.location(cfg),
                other.to_string(),
            )),
        }
    }
}

/// IR graph verifier
pub struct GraphVerifier {
    /// Strict mode (treat warnings as errors)
    strict: bool,
}

impl GraphVerifier {
    pub fn new() -> Self {
        Self { strict: false }
    }

    /// Enable strict mode
    pub fn strict(mut self) -> Self {
        self.strict = true;
        self
    }

    /// Verify a graph
    pub fn verify(&self, cfg: &ControlFlowGraphState) -> VerifyResult {
        let mut errors = Vec::new();
        let mut warnings = Vec::new();

        let mut stats = GraphStats {
            block_count: cfg.blocks().len(),
            clause_count: cfg.clauses().len(),
            variable_count: cfg.variables().len(),
            ..GraphStats::default()
        };

        // Layout must only name stored blocks; the rest of the checks index freely
        let missing: Vec<BlockId> = cfg
            .blocks()
            .iter()
            .copied()
            .filter(|&b| cfg.block(b).is_none())
            .collect();
        if !missing.is_empty() {
            errors.extend(missing.into_iter().map(|block| VerifyError::DanglingBlock { block }));
            return self.finish(errors, warnings, stats);
        }

        self.check_entry_exit(cfg, &mut errors);
        self.check_clauses(cfg, &mut errors);

        let reachable = cfg.reachable_blocks();
        stats.reachable_blocks = reachable.len();

        for &block in cfg.blocks() {
            let Some(bb) = cfg.block(block) else { continue };
            let count = bb.operators().len();
            for (pos, &op) in bb.operators().iter().enumerate() {
                stats.operator_count += 1;
                let Some(operator) = cfg.operator(op) else {
                    errors.push(VerifyError::OwnershipMismatch { block, operator: op });
                    continue;
                };
                if operator.block() != Some(block) {
                    errors.push(VerifyError::OwnershipMismatch { block, operator: op });
                }
                for &expression in operator.results().iter().chain(operator.arguments()) {
                    if cfg.expression(expression).is_none() {
                        errors.push(VerifyError::DanglingExpression {
                            block,
                            operator: op,
                            expression,
                        });
                    }
                }
                if operator.results().iter().any(|&r| cfg.is_constant(r)) {
                    errors.push(VerifyError::ConstantAssigned { block, operator: op });
                }
                if operator.is_control() && pos + 1 != count {
                    errors.push(VerifyError::MisplacedControl { block, operator: op });
                }
                if let Some(message) = operator.kind().capability_problem(operator.capabilities()) {
                    errors.push(VerifyError::CapabilityViolation {
                        block,
                        operator: op,
                        message,
                    });
                }
                if operator.capabilities().may_throw() {
                    stats.throwing_operators += 1;
                }
                for target in operator.successors() {
                    if let Some(reason) = self.target_problem(cfg, target) {
                        errors.push(VerifyError::InvalidTarget {
                            block,
                            target,
                            reason,
                        });
                    }
                }
            }

            if block == cfg.exit_block() {
                if !cfg.successors(block).is_empty() {
                    errors.push(VerifyError::ExitHasSuccessors);
                }
            } else if reachable.contains(&block) && cfg.control_operator(block).is_none() {
                errors.push(VerifyError::MissingControl { block });
            }

            for edge in cfg.successors(block) {
                if edge.class != EdgeClass::Exception {
                    continue;
                }
                for &position in &edge.origins {
                    let throws = bb
                        .operators()
                        .get(position)
                        .and_then(|&o| cfg.operator(o))
                        .is_some_and(|o| o.capabilities().may_throw());
                    if !throws {
                        errors.push(VerifyError::SpuriousExceptionEdge { block, position });
                    }
                }
            }

            if block != cfg.exit_block() && !reachable.contains(&block) {
                warnings.push(format!("{} is unreachable", cfg.label(block)));
            }
        }

        self.finish(errors, warnings, stats)
    }

    fn finish(
        &self,
        errors: Vec<VerifyError>,
        warnings: Vec<String>,
        stats: GraphStats,
    ) -> VerifyResult {
        let valid = errors.is_empty() && (!self.strict || warnings.is_empty());
        VerifyResult {
            valid,
            errors,
            warnings,
            stats,
        }
    }

    fn check_entry_exit(&self, cfg: &ControlFlowGraphState, errors: &mut Vec<VerifyError>) {
        let kinds: Vec<BlockKind> = cfg
            .blocks()
            .iter()
            .filter_map(|&b| cfg.block(b))
            .map(|bb| bb.kind())
            .collect();
        let entries = kinds.iter().filter(|k| **k == BlockKind::Entry).count();
        let exits = kinds.iter().filter(|k| **k == BlockKind::Exit).count();
        if entries != 1 || exits != 1 {
            errors.push(VerifyError::EntryExit {
                message: format!("expected one entry and one exit, found {} and {}", entries, exits),
            });
        }
        let entry_ok = cfg.is_live_block(cfg.entry_block())
            && cfg.block(cfg.entry_block()).map(|b| b.kind()) == Some(BlockKind::Entry);
        let exit_ok = cfg.is_live_block(cfg.exit_block())
            && cfg.block(cfg.exit_block()).map(|b| b.kind()) == Some(BlockKind::Exit);
        if !entry_ok || !exit_ok {
            errors.push(VerifyError::EntryExit {
                message: "entry or exit block is not live".to_string(),
            });
        }
    }

    fn check_clauses(&self, cfg: &ControlFlowGraphState, errors: &mut Vec<VerifyError>) {
        let clauses = cfg.clauses();
        let mut handlers = HashSet::new();

        for (i, &id) in clauses.iter().enumerate() {
            let Some(clause) = cfg.clause(id) else {
                errors.push(VerifyError::HandlerMismatch {
                    clause: id,
                    message: "clause is not stored".to_string(),
                });
                continue;
            };

            let handler_kind = cfg
                .block(clause.handler())
                .filter(|_| cfg.is_live_block(clause.handler()))
                .map(|b| b.kind());
            match handler_kind {
                Some(BlockKind::ExceptionHandler(flag)) if flag == clause.flag() => {}
                Some(_) => errors.push(VerifyError::HandlerMismatch {
                    clause: id,
                    message: format!("handler is not a {} block", clause.flag().name()),
                }),
                None => errors.push(VerifyError::HandlerMismatch {
                    clause: id,
                    message: "handler block is not live".to_string(),
                }),
            }
            if !handlers.insert(clause.handler()) {
                errors.push(VerifyError::HandlerMismatch {
                    clause: id,
                    message: "handler block is shared with another clause".to_string(),
                });
            }

            for &block in clause.protected() {
                let recorded = cfg
                    .block(block)
                    .is_some_and(|bb| bb.protected_by().contains(&id));
                if !recorded {
                    errors.push(VerifyError::ProtectionMismatch { block, clause: id });
                }
            }

            for &other in &clauses[i + 1..] {
                if let Some(second) = cfg.clause(other) {
                    if !clause.nests_with(second) {
                        errors.push(VerifyError::ClauseOverlap { first: id, second: other });
                    }
                }
            }
        }

        for &block in cfg.blocks() {
            let Some(bb) = cfg.block(block) else { continue };
            for &clause in bb.protected_by() {
                let listed = clauses.contains(&clause)
                    && cfg
                        .clause(clause)
                        .is_some_and(|c| c.protected().contains(&block));
                if !listed {
                    errors.push(VerifyError::ProtectionMismatch { block, clause });
                }
            }
        }
    }

    fn target_problem(&self, cfg: &ControlFlowGraphState, target: BlockId) -> Option<&'static str> {
        if !cfg.is_live_block(target) {
            return Some("target block is not live");
        }
        if target == cfg.entry_block() {
            return Some("entry block cannot have predecessors");
        }
        if cfg.block(target).is_some_and(|b| b.is_handler()) {
            return Some("handlers are reached only through the exception-clause table");
        }
        None
    }
}

impl Default for GraphVerifier {
    fn default() -> Self {
        Self::new()
    }
}
