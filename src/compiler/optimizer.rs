//! # Reference Optimization Passes
//!
//! Passes over a single graph, built only on the public mutation API:
//! - Constant deduplication
//! - Constant folding (including branches on constant comparisons)
//! - Copy propagation
//! - Dead code elimination
//!
//! Each pass reports whether it changed the graph so the driver can
//! re-verify or dump only when something happened.

use super::ir::{
    Annotation, BlockId, BuiltInType, ControlFlowGraphState, ExprId, IntegerOperand, OpId,
    Operator, OperatorKind, TypeKind, TypeSystemForIr,
};
use super::Pass;
use crate::Result;
use std::collections::{HashMap, HashSet};

/// Optimizer with configurable optimization level
pub struct Optimizer {
    level: u8,
}

impl Optimizer {
    /// Create a new optimizer with the specified optimization level (0-2)
    pub fn new(level: u8) -> Self {
        Self { level }
    }

    /// The pipeline for this level, in run order
    pub fn passes(&self) -> Vec<Box<dyn Pass>> {
        let mut passes: Vec<Box<dyn Pass>> = Vec::new();
        if self.level >= 1 {
            passes.push(Box::new(DeduplicateConstants));
            passes.push(Box::new(ConstantFolding));
        }
        if self.level >= 2 {
            passes.push(Box::new(CopyPropagation));
        }
        if self.level >= 1 {
            passes.push(Box::new(DeadCodeElimination));
        }
        passes
    }

    /// Run the whole pipeline once. Returns how many passes changed the graph.
    pub fn optimize(&self, bridge: &TypeSystemForIr, cfg: &mut ControlFlowGraphState) -> Result<usize> {
        let mut changed = 0;
        for pass in self.passes() {
            if pass.run(bridge, cfg)? {
                changed += 1;
            }
        }
        Ok(changed)
    }
}

// =============================================================================
// Constant deduplication
// =============================================================================

/// Point every use of a constant at one canonical expression per value.
///
/// Cloned and inlined code may carry structurally equal constants under
/// distinct ids; the first one stored wins.
pub struct DeduplicateConstants;

impl Pass for DeduplicateConstants {
    fn name(&self) -> &'static str {
        "DeduplicateConstants"
    }

    fn run(&self, _bridge: &TypeSystemForIr, cfg: &mut ControlFlowGraphState) -> Result<bool> {
        let duplicates: HashMap<ExprId, ExprId> = cfg
            .expressions
            .iter()
            .filter_map(|(id, e)| {
                let canonical = *cfg.constants.get(e.as_constant()?)?;
                (canonical != id).then_some((id, canonical))
            })
            .collect();
        if duplicates.is_empty() {
            return Ok(false);
        }

        let mut changed = false;
        for op in cfg.live_operators() {
            let arguments = match cfg.operator(op) {
                Some(operator) => operator.arguments().to_vec(),
                None => continue,
            };
            for argument in arguments {
                if let Some(&canonical) = duplicates.get(&argument) {
                    changed |= cfg.substitute_usage(op, argument, canonical)?;
                }
            }
        }
        Ok(changed)
    }
}

// =============================================================================
// Constant folding
// =============================================================================

/// Replace computations over constants with an assignment of the result,
/// and branches on constant comparisons with an unconditional jump.
pub struct ConstantFolding;

/// A constant integer operand with the width of its declared type.
fn integer_operand(
    bridge: &TypeSystemForIr,
    cfg: &ControlFlowGraphState,
    expr: ExprId,
) -> Option<IntegerOperand> {
    let value = cfg.constant_value(expr)?.as_i128()?;
    let ty = cfg.expression(expr)?.ty();
    let builtin = match bridge.type_desc(ty).ok()?.kind {
        TypeKind::Scalar(b) | TypeKind::Enum(b) => b,
        _ => return None,
    };
    if !builtin.is_integer() && builtin != BuiltInType::Boolean {
        return None;
    }
    Some(IntegerOperand::new(value, builtin.size(bridge.layout()) * 8))
}

impl ConstantFolding {
    fn fold_operator(
        &self,
        bridge: &TypeSystemForIr,
        cfg: &mut ControlFlowGraphState,
        op: OpId,
    ) -> Result<bool> {
        let graph: &ControlFlowGraphState = cfg;
        let Some(operator) = graph.operator(op) else {
            return Ok(false);
        };
        if operator.results().len() != 1 {
            return Ok(false);
        }
        let Some(value) = operator.can_evaluate(|e| integer_operand(bridge, graph, e)) else {
            return Ok(false);
        };
        let lhs = operator.results()[0];

        let Some(ty) = graph.expression(lhs).map(|e| e.ty()) else {
            return Ok(false);
        };
        let builtin = match bridge.type_desc(ty)?.kind {
            TypeKind::Scalar(b) | TypeKind::Enum(b) => b,
            _ => return Ok(false),
        };
        let Some(folded) = builtin.make_integer(value, bridge.layout()) else {
            return Ok(false);
        };

        let constant = bridge.create_constant(cfg, ty, folded)?;
        cfg.substitute_operator(op, Operator::assignment(lhs, constant), true)?;
        Ok(true)
    }

    fn fold_branch(
        &self,
        bridge: &TypeSystemForIr,
        cfg: &mut ControlFlowGraphState,
        block: BlockId,
    ) -> Result<bool> {
        let Some(ctl) = cfg.control_operator(block) else {
            return Ok(false);
        };
        let graph: &ControlFlowGraphState = cfg;
        let target = graph
            .operator(ctl)
            .and_then(|operator| operator.can_evaluate_branch(|e| integer_operand(bridge, graph, e)));
        let Some(target) = target else {
            return Ok(false);
        };
        cfg.set_flow_control(block, Operator::unconditional(target))?;
        Ok(true)
    }
}

impl Pass for ConstantFolding {
    fn name(&self) -> &'static str {
        "ConstantFolding"
    }

    fn run(&self, bridge: &TypeSystemForIr, cfg: &mut ControlFlowGraphState) -> Result<bool> {
        let mut changed = false;
        for op in cfg.live_operators() {
            changed |= self.fold_operator(bridge, cfg, op)?;
        }

        let mut branches_folded = false;
        for block in cfg.blocks().to_vec() {
            branches_folded |= self.fold_branch(bridge, cfg, block)?;
        }
        if branches_folded {
            let removed = cfg.remove_unreachable_blocks()?;
            tracing::trace!(method = %cfg.method_name(), removed, "folded constant branches");
        }
        Ok(changed || branches_folded)
    }
}

// =============================================================================
// Copy propagation
// =============================================================================

/// Block-local copy propagation.
///
/// After `x = y`, later uses of `x` in the same block read `y` until either
/// is redefined. Call argument slots are never rewritten.
pub struct CopyPropagation;

impl Pass for CopyPropagation {
    fn name(&self) -> &'static str {
        "CopyPropagation"
    }

    fn run(&self, _bridge: &TypeSystemForIr, cfg: &mut ControlFlowGraphState) -> Result<bool> {
        let mut changed = false;
        for block in cfg.blocks().to_vec() {
            let ops = match cfg.block(block) {
                Some(bb) => bb.operators().to_vec(),
                None => continue,
            };
            // copy target -> source
            let mut copies: HashMap<ExprId, ExprId> = HashMap::new();

            for op in ops {
                let Some(operator) = cfg.operator(op) else { continue };
                let rewrites: Vec<(ExprId, ExprId)> = operator
                    .arguments()
                    .iter()
                    .filter_map(|a| copies.get(a).map(|s| (*a, *s)))
                    .filter(|(old, new)| operator.can_propagate_copy(*old, *new))
                    .collect();
                for (old, new) in rewrites {
                    changed |= cfg.substitute_usage(op, old, new)?;
                }

                let Some(operator) = cfg.operator(op) else { continue };
                let mut killed: HashSet<ExprId> = operator.results().iter().copied().collect();
                for annotation in operator.annotations() {
                    if let Annotation::Invalidates(e) = annotation {
                        killed.insert(*e);
                    }
                }
                if operator.kind().is_subroutine() {
                    copies.clear();
                } else {
                    copies.retain(|k, v| !killed.contains(k) && !killed.contains(v));
                }

                if matches!(operator.kind(), OperatorKind::Assignment) {
                    if let (Some(lhs), Some(rhs)) = (operator.first_result(), operator.first_argument()) {
                        if lhs != rhs && !cfg.is_constant(lhs) {
                            copies.insert(lhs, rhs);
                        }
                    }
                }
            }
        }
        Ok(changed)
    }
}

// =============================================================================
// Dead code elimination
// =============================================================================

/// Remove operators whose results nobody reads and whose capabilities show
/// no side effects. Meta operators go unconditionally.
pub struct DeadCodeElimination;

impl DeadCodeElimination {
    fn live_expressions(&self, cfg: &ControlFlowGraphState) -> HashSet<ExprId> {
        let mut live: HashSet<ExprId> = HashSet::new();
        for op in cfg.live_operators() {
            if let Some(operator) = cfg.operator(op) {
                live.extend(operator.arguments());
                for annotation in operator.annotations() {
                    if let Annotation::NotNull(e) | Annotation::Invalidates(e) = annotation {
                        live.insert(*e);
                    }
                }
            }
        }
        live.extend(cfg.return_value());
        live
    }
}

impl Pass for DeadCodeElimination {
    fn name(&self) -> &'static str {
        "DeadCodeElimination"
    }

    fn run(&self, _bridge: &TypeSystemForIr, cfg: &mut ControlFlowGraphState) -> Result<bool> {
        let mut changed = false;
        loop {
            let live = self.live_expressions(cfg);
            let dead: Vec<OpId> = cfg
                .live_operators()
                .into_iter()
                .filter(|&op| {
                    let Some(operator) = cfg.operator(op) else {
                        return false;
                    };
                    if operator.is_control() || operator.has_annotation(&Annotation::DontRemove) {
                        return false;
                    }
                    let caps = operator.capabilities();
                    if caps.is_meta_operator() {
                        return true;
                    }
                    !operator.results().is_empty()
                        && !caps.has_side_effects()
                        && operator.results().iter().all(|r| !live.contains(r))
                })
                .collect();
            if dead.is_empty() {
                break;
            }
            for op in dead {
                cfg.remove_operator(op)?;
            }
            changed = true;
        }
        Ok(changed)
    }
}
