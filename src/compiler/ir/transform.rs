//! Generic traversal, rewriting and cloning of graphs
//!
//! A pass implements [`IrTransform`] and overrides `transform` for the
//! [`Node`] kinds it cares about; every other kind falls through the
//! default arm unchanged. [`TransformationContext::apply`] drives the walk
//! and keeps the ancestor stack, then writes changed nodes back through the
//! graph's checked mutators.
//!
//! Structural nodes (blocks, operators, clauses, levels, exception flags)
//! are visible to a pass but must come back unchanged; rewriting them needs
//! the graph API proper.
//!
//! [`CloningContext`] copies a graph into a fresh one, or inlines it into
//! another graph, through an old-id → new-id map.

use super::basic_block::{BlockId, BlockKind, ClauseId, ExceptionClause, ExceptionFlag};
use super::capabilities::{Capabilities, OperatorLevel};
use super::cfg::{CfgState, ControlFlowGraphState};
use super::expression::{
    ConstantExpression, ConstantValue, ExprId, Expression, RuntimeHandle, VariableKind,
};
use super::operator::{
    AluOperation, Annotation, Condition, DebugInfo, OpId, Operator, OperatorKind, UnaryOperation,
};
use super::types::{BuiltInType, FieldId, MethodId, TypeId};
use crate::error::{Error, Result};
use std::collections::{BTreeSet, HashMap, HashSet};

/// Every kind of node a transform can see
#[derive(Debug, Clone, PartialEq)]
pub enum Node {
    Operator(OpId),
    /// The operator list of the current block
    Operators(Vec<OpId>),
    Annotation(Annotation),
    /// The annotation list of the current operator
    Annotations(Vec<Annotation>),
    Expression(ExprId),
    Block(BlockId),
    ExceptionClause(ClauseId),
    Method(MethodId),
    Type(TypeId),
    Field(FieldId),
    Capabilities(Capabilities),
    Level(OperatorLevel),
    Alu(AluOperation),
    Unary(UnaryOperation),
    Condition(Condition),
    BuiltIn(BuiltInType),
    ExceptionFlag(ExceptionFlag),
    DebugInfo(Option<DebugInfo>),
}

impl Node {
    pub fn kind_name(&self) -> &'static str {
        match self {
            Node::Operator(_) => "operator",
            Node::Operators(_) => "operator array",
            Node::Annotation(_) => "annotation",
            Node::Annotations(_) => "annotation array",
            Node::Expression(_) => "expression",
            Node::Block(_) => "block",
            Node::ExceptionClause(_) => "exception clause",
            Node::Method(_) => "method",
            Node::Type(_) => "type",
            Node::Field(_) => "field",
            Node::Capabilities(_) => "capabilities",
            Node::Level(_) => "level",
            Node::Alu(_) => "alu operation",
            Node::Unary(_) => "unary operation",
            Node::Condition(_) => "condition",
            Node::BuiltIn(_) => "built-in type",
            Node::ExceptionFlag(_) => "exception flag",
            Node::DebugInfo(_) => "debug info",
        }
    }
}

/// A rewriting pass over one graph.
pub trait IrTransform {
    /// Return `node` itself to leave it alone.
    fn transform(
        &mut self,
        cfg: &ControlFlowGraphState,
        ctx: &TransformationContext,
        node: Node,
    ) -> Result<Node> {
        let _ = (cfg, ctx);
        Ok(node)
    }
}

/// Enclosing node on the walk
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ancestor {
    Block(BlockId),
    Operator(OpId),
    Clause(ClauseId),
}

/// Drives an [`IrTransform`] and tracks where the walk is.
#[derive(Debug, Default)]
pub struct TransformationContext {
    ancestors: Vec<Ancestor>,
}

impl TransformationContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, ancestor: Ancestor) {
        self.ancestors.push(ancestor);
    }

    pub fn pop(&mut self) -> Option<Ancestor> {
        self.ancestors.pop()
    }

    /// Outermost first
    pub fn ancestors(&self) -> &[Ancestor] {
        &self.ancestors
    }

    pub fn depth(&self) -> usize {
        self.ancestors.len()
    }

    /// Innermost enclosing operator
    pub fn parent_operator(&self) -> Option<OpId> {
        self.ancestors.iter().rev().find_map(|a| match a {
            Ancestor::Operator(op) => Some(*op),
            _ => None,
        })
    }

    /// Innermost enclosing block
    pub fn parent_block(&self) -> Option<BlockId> {
        self.ancestors.iter().rev().find_map(|a| match a {
            Ancestor::Block(b) => Some(*b),
            _ => None,
        })
    }

    /// Walk every live block, operator and clause of `cfg` through `pass`.
    ///
    /// Returns the number of operators that changed. Nothing is written
    /// when nothing changed, so read-only walks work on finalized graphs.
    pub fn apply(
        &mut self,
        cfg: &mut ControlFlowGraphState,
        pass: &mut dyn IrTransform,
    ) -> Result<usize> {
        self.ancestors.clear();
        let mut rewritten = 0;

        for block in cfg.blocks().to_vec() {
            self.push(Ancestor::Block(block));
            self.expect_unchanged(cfg, pass, Node::Block(block))?;
            let ops = cfg
                .block(block)
                .map(|bb| bb.operators().to_vec())
                .unwrap_or_default();
            self.expect_unchanged(cfg, pass, Node::Operators(ops.clone()))?;

            for op in ops {
                self.push(Ancestor::Operator(op));
                let rewrite = self.plan_operator(cfg, pass, op)?;
                self.pop();
                if rewrite.write(cfg, op)? {
                    rewritten += 1;
                }
            }
            self.pop();
        }

        for clause in cfg.clauses().to_vec() {
            self.push(Ancestor::Clause(clause));
            self.visit_clause(cfg, pass, clause)?;
            self.pop();
        }
        Ok(rewritten)
    }

    fn expect_unchanged(
        &self,
        cfg: &ControlFlowGraphState,
        pass: &mut dyn IrTransform,
        node: Node,
    ) -> Result<()> {
        let out = pass.transform(cfg, self, node.clone())?;
        if out != node {
            return Err(cfg.contract(format!(
                "a transform cannot replace a {} node; use the graph API",
                node.kind_name()
            )));
        }
        Ok(())
    }

    fn plan_operator(
        &self,
        cfg: &ControlFlowGraphState,
        pass: &mut dyn IrTransform,
        op: OpId,
    ) -> Result<OperatorRewrite> {
        let operator = cfg
            .operator(op)
            .ok_or_else(|| cfg.structural(format!("operator {}", op), "operator is not in the graph"))?;
        self.expect_unchanged(cfg, pass, Node::Operator(op))?;
        self.expect_unchanged(cfg, pass, Node::Level(operator.level()))?;

        let mut mapper = KindMapper {
            method: cfg.method_name(),
            targets: false,
            visit: |node: Node| pass.transform(cfg, self, node),
        };
        let kind = mapper.kind(operator.kind())?;
        let mut retargets = Vec::new();
        for target in operator.successors() {
            retargets.push((target, mapper.block(target)?));
        }
        let results = mapper.expressions(operator.results())?;
        let arguments = mapper.expressions(operator.arguments())?;
        let capabilities = mapper.capabilities(operator.capabilities())?;
        let annotations = mapper.annotations(operator.annotations())?;
        let debug_info = mapper.debug_info(operator.debug_info().cloned())?;

        Ok(OperatorRewrite {
            kind,
            retargets,
            results,
            arguments,
            capabilities,
            annotations,
            debug_info,
        })
    }

    fn visit_clause(
        &self,
        cfg: &mut ControlFlowGraphState,
        pass: &mut dyn IrTransform,
        clause: ClauseId,
    ) -> Result<()> {
        let Some((flag, handler, filter)) = cfg
            .clause(clause)
            .map(|c| (c.flag(), c.handler(), c.class_filter()))
        else {
            return Err(cfg.structural(format!("clause {}", clause), "clause is not in the graph"));
        };
        self.expect_unchanged(cfg, pass, Node::ExceptionClause(clause))?;
        self.expect_unchanged(cfg, pass, Node::ExceptionFlag(flag))?;
        self.expect_unchanged(cfg, pass, Node::Block(handler))?;

        if let Some(ty) = filter {
            let new = {
                let graph: &ControlFlowGraphState = cfg;
                let mut mapper = KindMapper {
                    method: graph.method_name(),
                    targets: false,
                    visit: |node: Node| pass.transform(graph, self, node),
                };
                mapper.ty(ty)?
            };
            if new != ty {
                cfg.check_mutable()?;
                cfg.touch();
                cfg.clauses[clause].class_filter = Some(new);
            }
        }
        Ok(())
    }
}

/// Transformed parts of one operator, written back only where they differ.
struct OperatorRewrite {
    kind: OperatorKind,
    retargets: Vec<(BlockId, BlockId)>,
    results: Vec<ExprId>,
    arguments: Vec<ExprId>,
    capabilities: Capabilities,
    annotations: Vec<Annotation>,
    debug_info: Option<DebugInfo>,
}

impl OperatorRewrite {
    fn write(self, cfg: &mut ControlFlowGraphState, op: OpId) -> Result<bool> {
        let Some(current) = cfg.operator(op).cloned() else {
            return Err(cfg.structural(format!("operator {}", op), "operator is not in the graph"));
        };
        let mut changed = false;

        // A new kind starts from its own default mask. A refinement survives
        // only when the operation itself is unchanged (same variant, same
        // default effects), e.g. a rewritten field or method descriptor.
        if &self.kind != current.kind() {
            let same_operation = std::mem::discriminant(&self.kind)
                == std::mem::discriminant(current.kind())
                && self.kind.default_capabilities() == current.kind().default_capabilities();
            cfg.operator_mut(op)?.set_kind(self.kind);
            if same_operation {
                cfg.refine_capabilities(op, current.capabilities())?;
            } else if current.capabilities() != current.kind().default_capabilities() {
                tracing::trace!(operator = %op, "capability refinement dropped with the old kind");
            }
            changed = true;
        }
        if self.capabilities != current.capabilities() {
            cfg.refine_capabilities(op, self.capabilities)?;
            changed = true;
        }
        if self.results != current.results() {
            cfg.set_results(op, self.results)?;
            changed = true;
        }
        if self.arguments != current.arguments() {
            cfg.set_arguments(op, self.arguments)?;
            changed = true;
        }
        for (old, new) in self.retargets {
            if old != new {
                cfg.retarget(op, old, new)?;
                changed = true;
            }
        }
        if self.annotations != current.annotations() {
            for annotation in &self.annotations {
                if let Annotation::NotNull(e) | Annotation::Invalidates(e) = annotation {
                    if cfg.expression(*e).is_none() {
                        return Err(cfg.structural(
                            format!("operator {}", op),
                            format!("annotation refers to dangling expression {}", e),
                        ));
                    }
                }
            }
            cfg.operator_mut(op)?.set_annotations(self.annotations);
            changed = true;
        }
        if self.debug_info.as_ref() != current.debug_info() {
            cfg.operator_mut(op)?.set_debug_info(self.debug_info);
            changed = true;
        }
        Ok(changed)
    }
}

/// Runs every embedded node of an operator through `visit`, checking
/// that each comes back as the same kind of node.
struct KindMapper<'m, F> {
    method: &'m str,
    /// Visit branch targets as part of the kind
    targets: bool,
    visit: F,
}

macro_rules! map_node {
    ($name:ident, $variant:ident, $ty:ty, $label:literal) => {
        fn $name(&mut self, value: $ty) -> Result<$ty> {
            match (self.visit)(Node::$variant(value))? {
                Node::$variant(v) => Ok(v),
                other => Err(self.mismatch($label, &other)),
            }
        }
    };
}

impl<F> KindMapper<'_, F>
where
    F: FnMut(Node) -> Result<Node>,
{
    fn mismatch(&self, expected: &str, got: &Node) -> Error {
        Error::contract(
            self.method,
            format!(
                "transform returned a {} node for a {} node",
                got.kind_name(),
                expected
            ),
        )
    }

    map_node!(method, Method, MethodId, "method");
    map_node!(ty, Type, TypeId, "type");
    map_node!(field, Field, FieldId, "field");
    map_node!(alu, Alu, AluOperation, "alu operation");
    map_node!(unary, Unary, UnaryOperation, "unary operation");
    map_node!(condition, Condition, Condition, "condition");
    map_node!(builtin, BuiltIn, BuiltInType, "built-in type");
    map_node!(block, Block, BlockId, "block");
    map_node!(expression, Expression, ExprId, "expression");
    map_node!(capabilities, Capabilities, Capabilities, "capabilities");
    map_node!(debug_info, DebugInfo, Option<DebugInfo>, "debug info");
    map_node!(annotation, Annotation, Annotation, "annotation");
    map_node!(annotation_list, Annotations, Vec<Annotation>, "annotation array");

    fn target(&mut self, block: BlockId) -> Result<BlockId> {
        if self.targets {
            self.block(block)
        } else {
            Ok(block)
        }
    }

    fn expressions(&mut self, ids: &[ExprId]) -> Result<Vec<ExprId>> {
        ids.iter().map(|&e| self.expression(e)).collect()
    }

    fn annotations(&mut self, annotations: &[Annotation]) -> Result<Vec<Annotation>> {
        let list = self.annotation_list(annotations.to_vec())?;
        list.into_iter()
            .map(|a| -> Result<Annotation> {
                Ok(match self.annotation(a)? {
                    Annotation::NotNull(e) => Annotation::NotNull(self.expression(e)?),
                    Annotation::Invalidates(e) => Annotation::Invalidates(self.expression(e)?),
                    other => other,
                })
            })
            .collect()
    }

    fn kind(&mut self, kind: &OperatorKind) -> Result<OperatorKind> {
        Ok(match kind {
            OperatorKind::Nop => OperatorKind::Nop,
            OperatorKind::Assignment => OperatorKind::Assignment,
            OperatorKind::Binary {
                alu,
                signed,
                overflow,
            } => OperatorKind::Binary {
                alu: self.alu(*alu)?,
                signed: *signed,
                overflow: *overflow,
            },
            OperatorKind::Unary {
                op,
                signed,
                overflow,
            } => OperatorKind::Unary {
                op: self.unary(*op)?,
                signed: *signed,
                overflow: *overflow,
            },
            OperatorKind::Convert {
                input,
                output,
                overflow,
            } => OperatorKind::Convert {
                input: self.builtin(*input)?,
                output: self.builtin(*output)?,
                overflow: *overflow,
            },
            OperatorKind::CompareAndSet { condition, signed } => OperatorKind::CompareAndSet {
                condition: self.condition(*condition)?,
                signed: *signed,
            },
            OperatorKind::LoadIndirect { ty, offset } => OperatorKind::LoadIndirect {
                ty: self.ty(*ty)?,
                offset: *offset,
            },
            OperatorKind::StoreIndirect { ty, offset } => OperatorKind::StoreIndirect {
                ty: self.ty(*ty)?,
                offset: *offset,
            },
            OperatorKind::LoadInstanceField { field } => OperatorKind::LoadInstanceField {
                field: self.field(*field)?,
            },
            OperatorKind::StoreInstanceField { field } => OperatorKind::StoreInstanceField {
                field: self.field(*field)?,
            },
            OperatorKind::AllocateObject { ty } => OperatorKind::AllocateObject {
                ty: self.ty(*ty)?,
            },
            OperatorKind::DirectSubroutine { target } => OperatorKind::DirectSubroutine {
                target: self.method(*target)?,
            },
            OperatorKind::IndirectSubroutine { signature } => OperatorKind::IndirectSubroutine {
                signature: self.method(*signature)?,
            },
            OperatorKind::Unconditional { target } => OperatorKind::Unconditional {
                target: self.target(*target)?,
            },
            OperatorKind::BinaryConditional {
                false_target,
                true_target,
            } => OperatorKind::BinaryConditional {
                false_target: self.target(*false_target)?,
                true_target: self.target(*true_target)?,
            },
            OperatorKind::CompareConditional {
                condition,
                signed,
                false_target,
                true_target,
            } => OperatorKind::CompareConditional {
                condition: self.condition(*condition)?,
                signed: *signed,
                false_target: self.target(*false_target)?,
                true_target: self.target(*true_target)?,
            },
            OperatorKind::Return => OperatorKind::Return,
            OperatorKind::Throw => OperatorKind::Throw,
        })
    }
}

// =============================================================================
// Cloning
// =============================================================================

/// Maps descriptors of the source graph to those of the clone.
///
/// Generic specialization substitutes type arguments here.
pub trait DescriptorConverter {
    fn convert_method(&mut self, method: MethodId) -> Result<MethodId> {
        Ok(method)
    }

    fn convert_type(&mut self, ty: TypeId) -> Result<TypeId> {
        Ok(ty)
    }

    fn convert_field(&mut self, field: FieldId) -> Result<FieldId> {
        Ok(field)
    }
}

/// Keeps every descriptor
#[derive(Debug, Default, Clone, Copy)]
pub struct IdentityConverter;

impl DescriptorConverter for IdentityConverter {}

/// Old id → new id, per node kind
#[derive(Debug, Default, Clone)]
pub struct CloneMap {
    pub blocks: HashMap<BlockId, BlockId>,
    pub operators: HashMap<OpId, OpId>,
    pub expressions: HashMap<ExprId, ExprId>,
    pub clauses: HashMap<ClauseId, ClauseId>,
}

impl CloneMap {
    /// Check that `clone` mirrors `source` node for node through this map,
    /// with descriptors unchanged. Returns the first difference.
    pub fn check_equivalent(
        &self,
        source: &ControlFlowGraphState,
        clone: &ControlFlowGraphState,
    ) -> std::result::Result<(), String> {
        fn injective<K, V: Eq + std::hash::Hash + Copy>(map: &HashMap<K, V>) -> bool {
            map.values().copied().collect::<HashSet<V>>().len() == map.len()
        }
        if !(injective(&self.blocks)
            && injective(&self.operators)
            && injective(&self.expressions)
            && injective(&self.clauses))
        {
            return Err("two source nodes share one clone".to_string());
        }
        if self.blocks.len() != source.blocks().len() {
            return Err(format!(
                "{} of {} blocks visited",
                self.blocks.len(),
                source.blocks().len()
            ));
        }
        if self.operators.len() != source.live_operators().len() {
            return Err(format!(
                "{} of {} operators visited",
                self.operators.len(),
                source.live_operators().len()
            ));
        }

        let expr = |e: &ExprId| self.expressions.get(e).copied();
        let block = |b: &BlockId| self.blocks.get(b).copied();

        if source.blocks().len() != clone.blocks().len() {
            return Err("block count differs".to_string());
        }
        for (b, cb) in source.blocks().iter().zip(clone.blocks()) {
            if block(b) != Some(*cb) {
                return Err(format!("{} is out of order", source.label(*b)));
            }
            let (Some(sb), Some(kb)) = (source.block(*b), clone.block(*cb)) else {
                return Err(format!("{} is missing", source.label(*b)));
            };
            if sb.kind() != kb.kind() || sb.operators().len() != kb.operators().len() {
                return Err(format!("{} differs", source.label(*b)));
            }
            let protection: Vec<Option<ClauseId>> = sb
                .protected_by()
                .iter()
                .map(|c| self.clauses.get(c).copied())
                .collect();
            if protection != kb.protected_by().iter().map(|c| Some(*c)).collect::<Vec<_>>() {
                return Err(format!("protection of {} differs", source.label(*b)));
            }
            for (o, co) in sb.operators().iter().zip(kb.operators()) {
                if self.operators.get(o) != Some(co) {
                    return Err(format!("operator {} is not mapped in order", o));
                }
                let (Some(so), Some(ko)) = (source.operator(*o), clone.operator(*co)) else {
                    return Err(format!("operator {} is missing", o));
                };
                let same = so.kind().name() == ko.kind().name()
                    && so.capabilities() == ko.capabilities()
                    && so.level() == ko.level()
                    && so.debug_info() == ko.debug_info()
                    && so.results().iter().map(expr).collect::<Vec<_>>()
                        == ko.results().iter().map(|e| Some(*e)).collect::<Vec<_>>()
                    && so.arguments().iter().map(expr).collect::<Vec<_>>()
                        == ko.arguments().iter().map(|e| Some(*e)).collect::<Vec<_>>()
                    && so.successors().iter().map(block).collect::<Vec<_>>()
                        == ko.successors().iter().map(|b| Some(*b)).collect::<Vec<_>>()
                    && so.annotations().len() == ko.annotations().len();
                if !same {
                    return Err(format!("operator {} differs from its clone", so));
                }
            }
        }

        for (e, ce) in &self.expressions {
            let (Some(se), Some(ke)) = (source.expression(*e), clone.expression(*ce)) else {
                return Err(format!("expression {} is missing", e));
            };
            let same = match (se, ke) {
                (Expression::Constant(a), Expression::Constant(b)) => a == b,
                (Expression::Variable(a), Expression::Variable(b)) => {
                    a.ty() == b.ty()
                        && source.variable_index(*e) == clone.variable_index(*ce)
                        && source.variable_debug_info(*e) == clone.variable_debug_info(*ce)
                }
                _ => false,
            };
            if !same {
                return Err(format!("expression {} differs from its clone", e));
            }
        }

        if source.clauses().len() != clone.clauses().len() {
            return Err("clause count differs".to_string());
        }
        for (c, cc) in source.clauses().iter().zip(clone.clauses()) {
            let (Some(sc), Some(kc)) = (source.clause(*c), clone.clause(*cc)) else {
                return Err(format!("clause {} is missing", c));
            };
            let protected: BTreeSet<Option<BlockId>> = sc.protected().iter().map(block).collect();
            let cloned: BTreeSet<Option<BlockId>> = kc.protected().iter().map(|b| Some(*b)).collect();
            if sc.flag() != kc.flag()
                || block(&sc.handler()) != Some(kc.handler())
                || sc.class_filter() != kc.class_filter()
                || protected != cloned
            {
                return Err(format!("clause {} differs from its clone", c));
            }
        }
        Ok(())
    }
}

/// Where an inlined body landed in the target graph
#[derive(Debug, Clone)]
pub struct InlinedBody {
    /// Jump here to run the body
    pub entry: BlockId,
    /// Reached when the body returns; has no control operator yet
    pub exit: BlockId,
    /// Holds the returned value, if the callee returns one
    pub return_value: Option<ExprId>,
    pub map: CloneMap,
}

/// One clone operation.
///
/// Every node is cloned at most once; references inside the clone go
/// through the map, so shared expressions stay shared.
pub struct CloningContext<'c> {
    converter: &'c mut dyn DescriptorConverter,
    map: CloneMap,
    /// Share constants with those already in the target
    intern_constants: bool,
}

impl<'c> CloningContext<'c> {
    pub fn new(converter: &'c mut dyn DescriptorConverter) -> Self {
        Self {
            converter,
            map: CloneMap::default(),
            intern_constants: false,
        }
    }

    /// Copy `source` into a fresh graph. The clone is never finalized.
    pub fn clone_graph(
        mut self,
        source: &ControlFlowGraphState,
    ) -> Result<(ControlFlowGraphState, CloneMap)> {
        let method = self.converter.convert_method(source.method())?;
        let mut clone = ControlFlowGraphState::new(method, source.method_name());
        clone.state = match source.state() {
            CfgState::Unbuilt => CfgState::Unbuilt,
            _ => CfgState::UnderConstruction,
        };

        self.map.blocks.insert(source.entry_block(), clone.entry_block());
        self.map.blocks.insert(source.exit_block(), clone.exit_block());
        for &b in source.blocks() {
            if b == source.entry_block() || b == source.exit_block() {
                continue;
            }
            let kind = source
                .block(b)
                .map(|bb| bb.kind())
                .ok_or_else(|| source.structural(format!("block {}", b), "dangling block"))?;
            let cloned = clone.raw_new_block(kind);
            self.map.blocks.insert(b, cloned);
        }
        clone.block_order = source
            .blocks()
            .iter()
            .map(|b| self.block(source, *b))
            .collect::<Result<_>>()?;

        self.clone_clauses(source, &mut clone)?;

        for variable in source.variables() {
            self.clone_expression(source, &mut clone, variable)?;
        }
        clone.return_value = source
            .return_value()
            .map(|r| self.clone_expression(source, &mut clone, r))
            .transpose()?;

        for &b in source.blocks() {
            let into = self.block(source, b)?;
            let ops = source.block(b).map(|bb| bb.operators()).unwrap_or_default();
            for &op in ops {
                let cloned = self.clone_operator(source, &mut clone, op)?;
                let id = clone.raw_push_operator(into, cloned);
                self.map.operators.insert(op, id);
            }
        }

        tracing::trace!(
            method = %source.method_name(),
            blocks = self.map.blocks.len(),
            operators = self.map.operators.len(),
            "graph cloned"
        );
        Ok((clone, self.map))
    }

    /// Inline `source` into `target`, binding its arguments to `arguments`.
    ///
    /// Every parameter becomes a fresh temporary assigned from its argument
    /// at the top of `entry`. Locals and temporaries get fresh variables in
    /// `target`; returns
    /// become an assignment to the returned variable and a jump to the
    /// body's exit. The caller wires the call site to `entry` and gives
    /// `exit` a control operator. Clauses of the call site do not extend
    /// over the inlined blocks.
    pub fn clone_into(
        mut self,
        source: &ControlFlowGraphState,
        target: &mut ControlFlowGraphState,
        arguments: &[ExprId],
    ) -> Result<InlinedBody> {
        target.check_mutable()?;
        if arguments.len() != source.arguments().len() {
            return Err(target.contract(format!(
                "{} takes {} arguments, {} supplied",
                source.method_name(),
                source.arguments().len(),
                arguments.len()
            )));
        }
        for &arg in arguments {
            if target.expression(arg).is_none() {
                return Err(target.structural("inline", format!("dangling argument {}", arg)));
            }
        }
        self.intern_constants = true;

        let mut body_entry = None;
        let mut body_exit = None;
        for &b in source.blocks() {
            let kind = source
                .block(b)
                .map(|bb| bb.kind())
                .ok_or_else(|| source.structural(format!("block {}", b), "dangling block"))?;
            let cloned = match kind {
                BlockKind::Entry | BlockKind::Exit => target.raw_new_block(BlockKind::Normal),
                other => target.raw_new_block(other),
            };
            if b == source.entry_block() {
                body_entry = Some(cloned);
            } else if b == source.exit_block() {
                body_exit = Some(cloned);
            }
            self.map.blocks.insert(b, cloned);
        }
        let (Some(entry), Some(exit)) = (body_entry, body_exit) else {
            return Err(source.structural("inline", "source graph lacks entry or exit"));
        };

        // Each parameter gets its own temporary so the body may write it
        for (&param, &arg) in source.arguments().iter().zip(arguments) {
            let ty = source
                .expression(param)
                .map(Expression::ty)
                .ok_or_else(|| source.structural("inline", format!("dangling parameter {}", param)))?;
            let ty = self.converter.convert_type(ty)?;
            let temp = target.raw_push_variable(ty, VariableKind::Temporary);
            if let Some(info) = source.variable_debug_info(param) {
                target.debug_info.insert(temp, info.clone());
            }
            target.raw_push_operator(entry, Operator::assignment(temp, arg));
            self.map.expressions.insert(param, temp);
        }

        self.clone_clauses(source, target)?;

        for variable in source.variables() {
            self.clone_expression(source, target, variable)?;
        }
        let return_value = source
            .return_value()
            .map(|r| self.clone_expression(source, target, r))
            .transpose()?;

        for &b in source.blocks() {
            let into = self.block(source, b)?;
            let ops = source.block(b).map(|bb| bb.operators()).unwrap_or_default();
            for &op in ops {
                let is_return = matches!(
                    source.operator(op).map(Operator::kind),
                    Some(OperatorKind::Return)
                );
                if !is_return {
                    let cloned = self.clone_operator(source, target, op)?;
                    let id = target.raw_push_operator(into, cloned);
                    self.map.operators.insert(op, id);
                    continue;
                }

                let value = source.operator(op).and_then(Operator::first_argument);
                if let Some(value) = value {
                    let Some(ret) = return_value else {
                        return Err(source.structural(
                            source.label(b),
                            "return with a value but the method declares none",
                        ));
                    };
                    let value = self.clone_expression(source, target, value)?;
                    if value != ret {
                        let id = target.raw_push_operator(into, Operator::assignment(ret, value));
                        self.map.operators.insert(op, id);
                    }
                }
                if b != source.exit_block() {
                    let id = target.raw_push_operator(into, Operator::unconditional(exit));
                    self.map.operators.insert(op, id);
                }
            }
        }
        target.touch();

        tracing::trace!(
            callee = %source.method_name(),
            caller = %target.method_name(),
            blocks = self.map.blocks.len(),
            "graph inlined"
        );
        Ok(InlinedBody {
            entry,
            exit,
            return_value,
            map: self.map,
        })
    }

    fn block(&self, source: &ControlFlowGraphState, block: BlockId) -> Result<BlockId> {
        self.map.blocks.get(&block).copied().ok_or_else(|| {
            source.structural(
                source.label(block),
                "reference to a block outside the graph",
            )
        })
    }

    fn clone_clauses(
        &mut self,
        source: &ControlFlowGraphState,
        target: &mut ControlFlowGraphState,
    ) -> Result<()> {
        for &c in source.clauses() {
            let clause = source
                .clause(c)
                .ok_or_else(|| source.structural(format!("clause {}", c), "dangling clause"))?;
            let handler = self.block(source, clause.handler())?;
            let protected = clause
                .protected()
                .iter()
                .map(|b| self.block(source, *b))
                .collect::<Result<BTreeSet<_>>>()?;
            let class_filter = clause
                .class_filter()
                .map(|t| self.converter.convert_type(t))
                .transpose()?;
            let id = target.clauses.alloc(ExceptionClause {
                handler,
                flag: clause.flag(),
                protected,
                class_filter,
            });
            target.clause_order.push(id);
            self.map.clauses.insert(c, id);
        }

        for (&old, &new) in &self.map.blocks {
            let protection: Vec<ClauseId> = source
                .block(old)
                .map(|bb| bb.protected_by())
                .unwrap_or_default()
                .iter()
                .filter_map(|c| self.map.clauses.get(c).copied())
                .collect();
            target.blocks[new].protected_by = protection;
        }
        Ok(())
    }

    fn clone_constant(&mut self, constant: &ConstantExpression) -> Result<ConstantExpression> {
        let ty = self.converter.convert_type(constant.ty())?;
        let value = match constant.value() {
            ConstantValue::TypeHandle(t) => ConstantValue::TypeHandle(self.converter.convert_type(*t)?),
            ConstantValue::TypeSize(t) => ConstantValue::TypeSize(self.converter.convert_type(*t)?),
            ConstantValue::FieldOffset(f) => {
                ConstantValue::FieldOffset(self.converter.convert_field(*f)?)
            }
            ConstantValue::RuntimeHandle(h) => ConstantValue::RuntimeHandle(match h {
                RuntimeHandle::Type(t) => RuntimeHandle::Type(self.converter.convert_type(*t)?),
                RuntimeHandle::Method(m) => RuntimeHandle::Method(self.converter.convert_method(*m)?),
                RuntimeHandle::Field(f) => RuntimeHandle::Field(self.converter.convert_field(*f)?),
            }),
            other => other.clone(),
        };
        Ok(ConstantExpression::from_parts(ty, value))
    }

    fn clone_expression(
        &mut self,
        source: &ControlFlowGraphState,
        target: &mut ControlFlowGraphState,
        expr: ExprId,
    ) -> Result<ExprId> {
        if let Some(&cloned) = self.map.expressions.get(&expr) {
            return Ok(cloned);
        }
        let original = source
            .expression(expr)
            .ok_or_else(|| source.structural("clone", format!("dangling expression {}", expr)))?;

        let cloned = match original {
            Expression::Constant(c) => {
                let c = self.clone_constant(c)?;
                if self.intern_constants {
                    target.raw_intern_constant(c)
                } else {
                    target.raw_push_constant(c)
                }
            }
            Expression::Variable(v) => {
                let ty = self.converter.convert_type(v.ty())?;
                let kind = match v.kind() {
                    VariableKind::Phi(of) => VariableKind::Phi(self.clone_expression(source, target, of)?),
                    other => other,
                };
                let id = target.raw_push_variable(ty, kind);
                if let Some(info) = source.variable_debug_info(expr) {
                    target.debug_info.insert(id, info.clone());
                }
                id
            }
        };
        self.map.expressions.insert(expr, cloned);
        Ok(cloned)
    }

    fn clone_operator(
        &mut self,
        source: &ControlFlowGraphState,
        target: &mut ControlFlowGraphState,
        op: OpId,
    ) -> Result<Operator> {
        let operator = source
            .operator(op)
            .ok_or_else(|| source.structural(format!("operator {}", op), "dangling operator"))?;

        let kind = {
            let blocks = &self.map.blocks;
            let converter = &mut *self.converter;
            let method = source.method_name();
            let mut mapper = KindMapper {
                method,
                targets: true,
                visit: |node: Node| -> Result<Node> {
                    match node {
                        Node::Method(m) => converter.convert_method(m).map(Node::Method),
                        Node::Type(t) => converter.convert_type(t).map(Node::Type),
                        Node::Field(f) => converter.convert_field(f).map(Node::Field),
                        Node::Block(b) => blocks.get(&b).copied().map(Node::Block).ok_or_else(|| {
                            Error::structural(method, format!("block {}", b), "branch leaves the graph")
                        }),
                        other => Ok(other),
                    }
                },
            };
            mapper.kind(operator.kind())?
        };

        let results = operator
            .results()
            .iter()
            .map(|&e| self.clone_expression(source, target, e))
            .collect::<Result<Vec<_>>>()?;
        let arguments = operator
            .arguments()
            .iter()
            .map(|&e| self.clone_expression(source, target, e))
            .collect::<Result<Vec<_>>>()?;
        let annotations = operator
            .annotations()
            .iter()
            .map(|a| -> Result<Annotation> {
                Ok(match a {
                    Annotation::NotNull(e) => Annotation::NotNull(self.clone_expression(source, target, *e)?),
                    Annotation::Invalidates(e) => {
                        Annotation::Invalidates(self.clone_expression(source, target, *e)?)
                    }
                    other => other.clone(),
                })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(operator.remapped(kind, results, arguments, annotations))
    }
}

/// Identity clone of `source`.
pub fn clone_graph(source: &ControlFlowGraphState) -> Result<(ControlFlowGraphState, CloneMap)> {
    let mut identity = IdentityConverter;
    CloningContext::new(&mut identity).clone_graph(source)
}

#[cfg(test)]
mod tests {
    use super::*;

    /// entry → body → exit, body: `t = a + 1; if t != 0 ...`, protected by a catch
    fn sample() -> (ControlFlowGraphState, BlockId, ExprId, ExprId) {
        let ty = TypeId::new(0);
        let mut cfg = ControlFlowGraphState::new(MethodId::new(0), "Test::Sample");
        cfg.raw_push_operator(cfg.entry_block(), Operator::unconditional(cfg.exit_block()));
        let ret = cfg.raw_push_variable(ty, VariableKind::Local);
        cfg.return_value = Some(ret);
        cfg.raw_push_operator(cfg.exit_block(), Operator::return_control(Some(ret)));
        let a = cfg.raw_push_variable(ty, VariableKind::Argument(0));
        let one = cfg.raw_intern_constant(ConstantExpression::from_parts(ty, ConstantValue::Int(1)));

        let body = cfg.create_first_normal_basic_block().unwrap();
        let t = cfg.allocate_temporary(ty).unwrap();
        cfg.add_operator(body, Operator::binary(AluOperation::Add, true, false, t, a, one))
            .unwrap();
        cfg.add_operator(body, Operator::assignment(ret, t)).unwrap();
        let (_, handler) = cfg
            .add_exception_clause(ExceptionFlag::Catch, &[body], Some(ty))
            .unwrap();
        cfg.add_operator(handler, Operator::unconditional(cfg.exit_block()))
            .unwrap();
        (cfg, body, a, one)
    }

    struct Recorder {
        seen: Vec<&'static str>,
        parents: Vec<Option<OpId>>,
    }

    impl IrTransform for Recorder {
        fn transform(
            &mut self,
            _cfg: &ControlFlowGraphState,
            ctx: &TransformationContext,
            node: Node,
        ) -> Result<Node> {
            self.seen.push(node.kind_name());
            if let Node::Expression(_) = node {
                self.parents.push(ctx.parent_operator());
            }
            Ok(node)
        }
    }

    #[test]
    fn test_default_pass_changes_nothing() {
        struct Nothing;
        impl IrTransform for Nothing {}

        let (mut cfg, ..) = sample();
        let before = cfg.clone();
        let version = cfg.version();
        let rewritten = TransformationContext::new().apply(&mut cfg, &mut Nothing).unwrap();
        assert_eq!(rewritten, 0);
        assert_eq!(cfg.version(), version);
        assert_eq!(cfg.live_operators(), before.live_operators());
    }

    #[test]
    fn test_walk_visits_every_kind_with_parents() {
        let (mut cfg, ..) = sample();
        let mut recorder = Recorder {
            seen: Vec::new(),
            parents: Vec::new(),
        };
        TransformationContext::new().apply(&mut cfg, &mut recorder).unwrap();
        for kind in ["block", "operator array", "operator", "level", "expression", "alu operation", "exception clause", "exception flag", "type"] {
            assert!(recorder.seen.contains(&kind), "{} not visited", kind);
        }
        assert!(recorder.parents.iter().all(Option::is_some));
    }

    #[test]
    fn test_walk_works_on_finalized_graph() {
        let (mut cfg, ..) = sample();
        cfg.finalize().unwrap();
        struct Nothing;
        impl IrTransform for Nothing {}
        assert_eq!(TransformationContext::new().apply(&mut cfg, &mut Nothing).unwrap(), 0);
    }

    #[test]
    fn test_expression_rewrite_is_written_back() {
        struct Swap {
            from: ExprId,
            to: ExprId,
        }
        impl IrTransform for Swap {
            fn transform(
                &mut self,
                _cfg: &ControlFlowGraphState,
                _ctx: &TransformationContext,
                node: Node,
            ) -> Result<Node> {
                Ok(match node {
                    Node::Expression(e) if e == self.from => Node::Expression(self.to),
                    other => other,
                })
            }
        }

        let (mut cfg, body, a, one) = sample();
        let rewritten = TransformationContext::new()
            .apply(&mut cfg, &mut Swap { from: a, to: one })
            .unwrap();
        assert_eq!(rewritten, 1);
        let first = cfg.block(body).unwrap().operators()[0];
        assert_eq!(cfg.operator(first).unwrap().arguments(), &[one, one]);
    }

    #[test]
    fn test_structural_nodes_cannot_be_replaced() {
        struct DropBlocks;
        impl IrTransform for DropBlocks {
            fn transform(
                &mut self,
                _cfg: &ControlFlowGraphState,
                _ctx: &TransformationContext,
                node: Node,
            ) -> Result<Node> {
                Ok(match node {
                    Node::Operators(_) => Node::Operators(Vec::new()),
                    other => other,
                })
            }
        }
        let (mut cfg, ..) = sample();
        let err = TransformationContext::new().apply(&mut cfg, &mut DropBlocks).unwrap_err();
        assert!(matches!(err, Error::ContractViolation { .. }));
    }

    #[test]
    fn test_wrong_node_kind_is_contract_violation() {
        struct Confused;
        impl IrTransform for Confused {
            fn transform(
                &mut self,
                _cfg: &ControlFlowGraphState,
                _ctx: &TransformationContext,
                node: Node,
            ) -> Result<Node> {
                Ok(match node {
                    Node::Alu(_) => Node::Condition(Condition::Eq),
                    other => other,
                })
            }
        }
        let (mut cfg, ..) = sample();
        let err = TransformationContext::new().apply(&mut cfg, &mut Confused).unwrap_err();
        assert!(err.to_string().contains("alu operation"));
    }

    #[test]
    fn test_finalized_graph_rejects_rewrites() {
        struct Flip;
        impl IrTransform for Flip {
            fn transform(
                &mut self,
                _cfg: &ControlFlowGraphState,
                _ctx: &TransformationContext,
                node: Node,
            ) -> Result<Node> {
                Ok(match node {
                    Node::Alu(AluOperation::Add) => Node::Alu(AluOperation::Mul),
                    other => other,
                })
            }
        }
        let (mut cfg, ..) = sample();
        cfg.finalize().unwrap();
        let err = TransformationContext::new().apply(&mut cfg, &mut Flip).unwrap_err();
        assert!(matches!(err, Error::ContractViolation { .. }));
    }

    #[test]
    fn test_kind_rewrite_keeps_refinement_of_same_operation() {
        struct Refield;
        impl IrTransform for Refield {
            fn transform(
                &mut self,
                _cfg: &ControlFlowGraphState,
                _ctx: &TransformationContext,
                node: Node,
            ) -> Result<Node> {
                Ok(match node {
                    Node::Field(f) if f == FieldId::new(0) => Node::Field(FieldId::new(1)),
                    other => other,
                })
            }
        }

        let (mut cfg, body, a, _) = sample();
        let v = cfg.allocate_temporary(TypeId::new(0)).unwrap();
        let load = cfg
            .add_operator(body, Operator::load_instance_field(FieldId::new(0), v, a))
            .unwrap();
        let non_null = cfg
            .operator(load)
            .unwrap()
            .capabilities()
            .without(Capabilities::MAY_THROW);
        cfg.refine_capabilities(load, non_null).unwrap();

        TransformationContext::new().apply(&mut cfg, &mut Refield).unwrap();
        let operator = cfg.operator(load).unwrap();
        assert_eq!(
            operator.kind(),
            &OperatorKind::LoadInstanceField {
                field: FieldId::new(1)
            }
        );
        assert_eq!(operator.capabilities(), non_null);
    }

    #[test]
    fn test_kind_rewrite_to_other_operation_resets_capabilities() {
        struct ToDiv;
        impl IrTransform for ToDiv {
            fn transform(
                &mut self,
                _cfg: &ControlFlowGraphState,
                _ctx: &TransformationContext,
                node: Node,
            ) -> Result<Node> {
                Ok(match node {
                    Node::Alu(AluOperation::Add) => Node::Alu(AluOperation::Div),
                    other => other,
                })
            }
        }

        let (mut cfg, body, ..) = sample();
        let add = cfg.block(body).unwrap().operators()[0];
        assert!(!cfg.operator(add).unwrap().capabilities().may_throw());

        TransformationContext::new().apply(&mut cfg, &mut ToDiv).unwrap();
        let operator = cfg.operator(add).unwrap();
        assert_eq!(operator.kind().name(), "Binary");
        assert!(operator.capabilities().may_throw());
    }

    #[test]
    fn test_identity_clone_is_equivalent() {
        let (cfg, ..) = sample();
        let (clone, map) = clone_graph(&cfg).unwrap();
        map.check_equivalent(&cfg, &clone).unwrap();
        assert_eq!(clone.blocks().len(), cfg.blocks().len());
        assert_eq!(clone.locals().len(), cfg.locals().len());
    }

    #[test]
    fn test_converter_rewrites_descriptors() {
        struct Specialize;
        impl DescriptorConverter for Specialize {
            fn convert_type(&mut self, ty: TypeId) -> Result<TypeId> {
                Ok(TypeId::new(ty.index() + 10))
            }
        }
        let (cfg, ..) = sample();
        let mut converter = Specialize;
        let (clone, _) = CloningContext::new(&mut converter).clone_graph(&cfg).unwrap();
        let arg = clone.arguments()[0];
        assert_eq!(clone.expression(arg).unwrap().ty(), TypeId::new(10));
        let clause = clone.clauses()[0];
        assert_eq!(clone.clause(clause).unwrap().class_filter(), Some(TypeId::new(10)));
    }

    #[test]
    fn test_clone_into_binds_arguments() {
        let (callee, ..) = sample();
        let (mut caller, _, caller_arg, _) = sample();
        let body = CloningContext::new(&mut IdentityConverter)
            .clone_into(&callee, &mut caller, &[caller_arg])
            .unwrap();

        // The parameter becomes a temporary, not another argument
        assert_eq!(caller.arguments().len(), 1);
        assert!(body.return_value.is_some());
        assert!(caller.control_operator(body.exit).is_none());
        assert_eq!(caller.clauses().len(), 2);

        let entry_ops = caller.block(body.entry).unwrap().operators().to_vec();
        assert_eq!(entry_ops.len(), 2);
        let bind = caller.operator(entry_ops[0]).unwrap();
        assert_eq!(bind.kind(), &OperatorKind::Assignment);
        assert_eq!(bind.first_argument(), Some(caller_arg));
        let param = bind.first_result().unwrap();
        assert!(caller.temporaries().contains(&param));
        assert_eq!(body.map.expressions.get(&callee.arguments()[0]), Some(&param));

        let inner = caller.operator(entry_ops[1]).unwrap().successors()[0];
        let add = caller.block(inner).unwrap().operators()[0];
        assert_eq!(caller.operator(add).unwrap().first_argument(), Some(param));
    }

    #[test]
    fn test_clone_into_keeps_parameter_writes_local() {
        let ty = TypeId::new(0);
        let (mut callee, body, a, one) = sample();
        // a = a + 1 ahead of the body's own computation
        let first = callee.block(body).unwrap().operators()[0];
        callee
            .insert_operator_before(first, Operator::binary(AluOperation::Add, true, false, a, a, one))
            .unwrap();

        let (mut caller, ..) = sample();
        let local = caller.allocate_local(ty, Some("t")).unwrap();
        let five = caller.raw_intern_constant(ConstantExpression::from_parts(ty, ConstantValue::Int(5)));

        for bound in [local, five] {
            let inlined = CloningContext::new(&mut IdentityConverter)
                .clone_into(&callee, &mut caller, &[bound])
                .unwrap();
            let writes = caller
                .live_operators()
                .into_iter()
                .filter(|&op| caller.operator(op).unwrap().results().contains(&bound))
                .count();
            assert_eq!(writes, 0);
            let exit = caller.exit_block();
            caller
                .add_operator(inlined.exit, Operator::unconditional(exit))
                .unwrap();
        }
    }

    #[test]
    fn test_clone_into_checks_arity() {
        let (callee, ..) = sample();
        let (mut caller, ..) = sample();
        let err = CloningContext::new(&mut IdentityConverter)
            .clone_into(&callee, &mut caller, &[])
            .unwrap_err();
        assert!(matches!(err, Error::ContractViolation { .. }));
    }
}
