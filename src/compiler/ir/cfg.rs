//! Per-method control-flow graph state
//!
//! A [`ControlFlowGraphState`] owns every block, operator, expression and
//! exception clause of one method in its own arenas. Graphs are built by
//! [`TypeSystemForIr::create_control_flow_graph_state`](super::TypeSystemForIr::create_control_flow_graph_state),
//! mutated by passes through the methods below, and frozen by
//! [`finalize`](ControlFlowGraphState::finalize) before code generation.
//!
//! ```text
//! Unbuilt ──first mutation──▶ UnderConstruction ──finalize()──▶ Finalized
//! ```

use super::arena::Arena;
use super::basic_block::{
    BasicBlock, BlockEdge, BlockId, BlockKind, ClauseId, EdgeClass, ExceptionClause, ExceptionFlag,
};
use super::capabilities::{Capabilities, OperatorLevel};
use super::expression::{
    ConstantExpression, ConstantValue, ExprId, Expression, VariableDebugInfo, VariableExpression,
    VariableKind,
};
use super::operator::{Annotation, OpId, Operator, OperatorKind};
use super::types::{MethodId, TypeId};
use crate::compiler::verifier::GraphVerifier;
use crate::error::{Error, Result};
use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::fmt;

/// Lifecycle of a graph
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CfgState {
    Unbuilt,
    UnderConstruction,
    Finalized,
}

impl fmt::Display for CfgState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CfgState::Unbuilt => write!(f, "unbuilt"),
            CfgState::UnderConstruction => write!(f, "under construction"),
            CfgState::Finalized => write!(f, "finalized"),
        }
    }
}

/// The graph of one method
#[derive(Debug, Clone)]
pub struct ControlFlowGraphState {
    pub(crate) method: MethodId,
    pub(crate) method_name: String,
    pub(crate) state: CfgState,
    pub(crate) version: u64,

    pub(crate) blocks: Arena<BasicBlock>,
    /// Live blocks in layout order
    pub(crate) block_order: Vec<BlockId>,
    pub(crate) operators: Arena<Operator>,
    pub(crate) expressions: Arena<Expression>,
    pub(crate) clauses: Arena<ExceptionClause>,
    pub(crate) clause_order: Vec<ClauseId>,
    pub(crate) entry: BlockId,
    pub(crate) exit: BlockId,

    pub(crate) arguments: Vec<ExprId>,
    pub(crate) locals: Vec<ExprId>,
    pub(crate) temporaries: Vec<ExprId>,
    pub(crate) exception_objects: Vec<ExprId>,
    pub(crate) phis: Vec<ExprId>,
    pub(crate) return_value: Option<ExprId>,
    pub(crate) debug_info: HashMap<ExprId, VariableDebugInfo>,
    pub(crate) constants: HashMap<ConstantExpression, ExprId>,
}

impl ControlFlowGraphState {
    /// Empty graph with its entry and exit blocks, nothing wired.
    pub(crate) fn new(method: MethodId, method_name: impl Into<String>) -> Self {
        let mut blocks = Arena::new();
        let entry = blocks.alloc(BasicBlock::new(BlockKind::Entry));
        let exit = blocks.alloc(BasicBlock::new(BlockKind::Exit));
        Self {
            method,
            method_name: method_name.into(),
            state: CfgState::Unbuilt,
            version: 0,
            blocks,
            block_order: vec![entry, exit],
            operators: Arena::new(),
            expressions: Arena::new(),
            clauses: Arena::new(),
            clause_order: Vec::new(),
            entry,
            exit,
            arguments: Vec::new(),
            locals: Vec::new(),
            temporaries: Vec::new(),
            exception_objects: Vec::new(),
            phis: Vec::new(),
            return_value: None,
            debug_info: HashMap::new(),
            constants: HashMap::new(),
        }
    }

    // =========================================================================
    // Read access
    // =========================================================================

    pub fn method(&self) -> MethodId {
        self.method
    }

    pub fn method_name(&self) -> &str {
        &self.method_name
    }

    pub fn state(&self) -> CfgState {
        self.state
    }

    pub fn is_finalized(&self) -> bool {
        self.state == CfgState::Finalized
    }

    /// Bumped on every successful mutation
    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn entry_block(&self) -> BlockId {
        self.entry
    }

    pub fn exit_block(&self) -> BlockId {
        self.exit
    }

    /// Live blocks in layout order
    pub fn blocks(&self) -> &[BlockId] {
        &self.block_order
    }

    pub fn block(&self, id: BlockId) -> Option<&BasicBlock> {
        self.blocks.get(id)
    }

    pub fn is_live_block(&self, id: BlockId) -> bool {
        self.block_order.contains(&id)
    }

    pub fn operator(&self, id: OpId) -> Option<&Operator> {
        self.operators.get(id)
    }

    pub fn expression(&self, id: ExprId) -> Option<&Expression> {
        self.expressions.get(id)
    }

    pub fn clauses(&self) -> &[ClauseId] {
        &self.clause_order
    }

    pub fn clause(&self, id: ClauseId) -> Option<&ExceptionClause> {
        self.clauses.get(id)
    }

    pub fn arguments(&self) -> &[ExprId] {
        &self.arguments
    }

    pub fn locals(&self) -> &[ExprId] {
        &self.locals
    }

    pub fn temporaries(&self) -> &[ExprId] {
        &self.temporaries
    }

    pub fn exception_objects(&self) -> &[ExprId] {
        &self.exception_objects
    }

    pub fn phis(&self) -> &[ExprId] {
        &self.phis
    }

    /// Variable the exit block returns, when the method returns a value
    pub fn return_value(&self) -> Option<ExprId> {
        self.return_value
    }

    pub fn variable_debug_info(&self, expr: ExprId) -> Option<&VariableDebugInfo> {
        self.debug_info.get(&expr)
    }

    /// Number of expressions ever stored, live or not
    pub fn expression_count(&self) -> usize {
        self.expressions.len()
    }

    pub fn constant_value(&self, expr: ExprId) -> Option<&ConstantValue> {
        self.expressions
            .get(expr)
            .and_then(Expression::as_constant)
            .map(ConstantExpression::value)
    }

    pub fn is_constant(&self, expr: ExprId) -> bool {
        self.constant_value(expr).is_some()
    }

    /// Position of a variable within its table
    pub fn variable_index(&self, expr: ExprId) -> Option<usize> {
        let variable = self.expressions.get(expr)?.as_variable()?;
        let table = match variable.kind() {
            VariableKind::Argument(i) => return Some(i as usize),
            VariableKind::Local => &self.locals,
            VariableKind::Temporary => &self.temporaries,
            VariableKind::ExceptionObject => &self.exception_objects,
            VariableKind::Phi(_) => &self.phis,
        };
        table.iter().position(|&e| e == expr)
    }

    /// Every variable in table order: arguments, locals, temporaries,
    /// exception objects, phis.
    pub fn variables(&self) -> Vec<ExprId> {
        self.arguments
            .iter()
            .chain(&self.locals)
            .chain(&self.temporaries)
            .chain(&self.exception_objects)
            .chain(&self.phis)
            .copied()
            .collect()
    }

    /// Printable block label, e.g. `Normal_2`
    pub fn label(&self, block: BlockId) -> String {
        match self.blocks.get(block) {
            Some(bb) => format!("{}_{}", bb.kind().label_prefix(), block.index()),
            None => format!("Block{}", block),
        }
    }

    /// The block's trailing control operator
    pub fn control_operator(&self, block: BlockId) -> Option<OpId> {
        let last = *self.blocks.get(block)?.operators.last()?;
        self.operators[last].is_control().then_some(last)
    }

    /// Operators of all live blocks in layout order
    pub fn live_operators(&self) -> Vec<OpId> {
        self.block_order
            .iter()
            .flat_map(|&b| self.blocks[b].operators.iter().copied())
            .collect()
    }

    pub fn uses_of(&self, expr: ExprId) -> Vec<OpId> {
        self.live_operators()
            .into_iter()
            .filter(|&o| self.operators[o].uses(expr))
            .collect()
    }

    pub fn definitions_of(&self, expr: ExprId) -> Vec<OpId> {
        self.live_operators()
            .into_iter()
            .filter(|&o| self.operators[o].defines(expr))
            .collect()
    }

    pub fn block_max_level(&self, block: BlockId) -> OperatorLevel {
        self.blocks
            .get(block)
            .map(|bb| {
                bb.operators
                    .iter()
                    .map(|&o| self.operators[o].level())
                    .max()
                    .unwrap_or(OperatorLevel::LOWEST)
            })
            .unwrap_or(OperatorLevel::LOWEST)
    }

    /// Highest operator level present, i.e. how far lowering has come
    pub fn highest_level(&self) -> OperatorLevel {
        self.block_order
            .iter()
            .map(|&b| self.block_max_level(b))
            .max()
            .unwrap_or(OperatorLevel::LOWEST)
    }

    // =========================================================================
    // Flow information, computed on demand
    // =========================================================================

    /// Outgoing edges: control-operator targets, then one exception edge per
    /// protecting clause when some operator in the block may throw.
    pub fn successors(&self, block: BlockId) -> Vec<BlockEdge> {
        let Some(bb) = self.blocks.get(block) else {
            return Vec::new();
        };
        let mut edges = Vec::new();

        if let Some(ctl) = self.control_operator(block) {
            let origin = bb.operators.len() - 1;
            for to in self.operators[ctl].successors() {
                edges.push(BlockEdge {
                    from: block,
                    to,
                    class: EdgeClass::Normal,
                    origins: vec![origin],
                });
            }
        }

        let throwing: Vec<usize> = bb
            .operators
            .iter()
            .enumerate()
            .filter(|(_, o)| self.operators[**o].capabilities().may_throw())
            .map(|(i, _)| i)
            .collect();
        if !throwing.is_empty() {
            for &clause in &bb.protected_by {
                edges.push(BlockEdge {
                    from: block,
                    to: self.clauses[clause].handler,
                    class: EdgeClass::Exception,
                    origins: throwing.clone(),
                });
            }
        }
        edges
    }

    pub fn predecessors(&self, block: BlockId) -> Vec<BlockEdge> {
        self.block_order
            .iter()
            .flat_map(|&b| self.successors(b))
            .filter(|edge| edge.to == block)
            .collect()
    }

    /// Blocks reachable from the entry through control operators, plus the
    /// handlers of every clause protecting a reachable block.
    pub fn reachable_blocks(&self) -> HashSet<BlockId> {
        let mut seen = HashSet::new();
        let mut queue = VecDeque::from([self.entry]);
        while let Some(block) = queue.pop_front() {
            if !seen.insert(block) {
                continue;
            }
            if let Some(ctl) = self.control_operator(block) {
                queue.extend(self.operators[ctl].successors());
            }
            for &clause in &self.blocks[block].protected_by {
                queue.push_back(self.clauses[clause].handler);
            }
        }
        seen
    }

    // =========================================================================
    // Guards
    // =========================================================================

    pub(crate) fn structural(&self, location: impl Into<String>, message: impl Into<String>) -> Error {
        Error::structural(&self.method_name, location, message)
    }

    pub(crate) fn contract(&self, message: impl Into<String>) -> Error {
        Error::contract(&self.method_name, message)
    }

    /// Refuses mutation of a finalized graph. Does not change the state;
    /// a rejected mutation leaves the lifecycle where it was.
    pub(crate) fn check_mutable(&self) -> Result<()> {
        match self.state {
            CfgState::Finalized => Err(self.contract("graph is finalized, only read-only traversal is permitted")),
            CfgState::Unbuilt | CfgState::UnderConstruction => Ok(()),
        }
    }

    /// Record a successful mutation.
    pub(crate) fn touch(&mut self) {
        if self.state == CfgState::Unbuilt {
            self.state = CfgState::UnderConstruction;
        }
        self.version += 1;
    }

    fn check_block(&self, block: BlockId) -> Result<()> {
        if !self.is_live_block(block) {
            return Err(self.structural(format!("block {}", block), "dangling block reference"));
        }
        Ok(())
    }

    /// Owning block and position of a live operator
    fn locate(&self, op: OpId) -> Result<(BlockId, usize)> {
        let block = self
            .operators
            .get(op)
            .and_then(Operator::block)
            .ok_or_else(|| self.structural(format!("operator {}", op), "operator is not in the graph"))?;
        let pos = self.blocks[block]
            .position_of(op)
            .ok_or_else(|| self.structural(self.label(block), "operator/block ownership disagrees"))?;
        Ok((block, pos))
    }

    fn check_expressions(&self, location: &str, ids: &[ExprId]) -> Result<()> {
        for &e in ids {
            if !self.expressions.contains(e) {
                return Err(self.structural(location, format!("dangling expression {}", e)));
            }
        }
        Ok(())
    }

    /// Checks an operator about to enter `block`.
    fn check_new_operator(&self, block: BlockId, op: &Operator) -> Result<()> {
        let location = self.label(block);
        self.check_expressions(&location, op.results())?;
        self.check_expressions(&location, op.arguments())?;
        if op.results().iter().any(|&r| self.is_constant(r)) {
            return Err(self.structural(&location, "a constant cannot be assigned"));
        }
        let successors = op.successors();
        if block == self.exit && !successors.is_empty() {
            return Err(self.structural(&location, "exit block cannot have successors"));
        }
        for target in successors {
            self.check_target(&location, target)?;
        }
        Ok(())
    }

    fn check_target(&self, location: &str, target: BlockId) -> Result<()> {
        self.check_block(target)?;
        if target == self.entry {
            return Err(self.structural(location, "entry block cannot have predecessors"));
        }
        if self.blocks[target].is_handler() {
            return Err(self.structural(
                location,
                format!(
                    "{} is reachable only through the exception-clause table",
                    self.label(target)
                ),
            ));
        }
        Ok(())
    }

    fn live_operator_mut(&mut self, op: OpId) -> Result<&mut Operator> {
        self.locate(op)?;
        Ok(&mut self.operators[op])
    }

    /// Mutable access for the transformation walker.
    pub(crate) fn operator_mut(&mut self, op: OpId) -> Result<&mut Operator> {
        self.check_mutable()?;
        self.touch();
        self.live_operator_mut(op)
    }

    // =========================================================================
    // Raw construction, no state checks
    // =========================================================================

    pub(crate) fn raw_new_block(&mut self, kind: BlockKind) -> BlockId {
        let id = self.blocks.alloc(BasicBlock::new(kind));
        self.block_order.push(id);
        id
    }

    /// Append, keeping a trailing control operator last.
    pub(crate) fn raw_push_operator(&mut self, block: BlockId, mut op: Operator) -> OpId {
        op.set_block(Some(block));
        let is_control = op.is_control();
        let id = self.operators.alloc(op);
        let tail_is_control = self.control_operator(block).is_some();
        let ops = &mut self.blocks[block].operators;
        let len = ops.len();
        if !is_control && tail_is_control {
            ops.insert(len - 1, id);
        } else {
            ops.push(id);
        }
        id
    }

    pub(crate) fn raw_push_variable(&mut self, ty: TypeId, kind: VariableKind) -> ExprId {
        let id = self
            .expressions
            .alloc(Expression::Variable(VariableExpression::new(ty, kind)));
        match kind {
            VariableKind::Argument(_) => self.arguments.push(id),
            VariableKind::Local => self.locals.push(id),
            VariableKind::Temporary => self.temporaries.push(id),
            VariableKind::ExceptionObject => self.exception_objects.push(id),
            VariableKind::Phi(_) => self.phis.push(id),
        }
        id
    }

    pub(crate) fn raw_intern_constant(&mut self, constant: ConstantExpression) -> ExprId {
        if let Some(&id) = self.constants.get(&constant) {
            return id;
        }
        let id = self
            .expressions
            .alloc(Expression::Constant(constant.clone()));
        self.constants.insert(constant, id);
        id
    }

    /// Store a constant without interning, as a clone of foreign code may.
    pub(crate) fn raw_push_constant(&mut self, constant: ConstantExpression) -> ExprId {
        let id = self
            .expressions
            .alloc(Expression::Constant(constant.clone()));
        self.constants.entry(constant).or_insert(id);
        id
    }

    /// Intern a validated constant. Lookups of existing constants are
    /// permitted on finalized graphs.
    pub(crate) fn intern_constant(&mut self, constant: ConstantExpression) -> Result<ExprId> {
        if let Some(&id) = self.constants.get(&constant) {
            return Ok(id);
        }
        self.check_mutable()?;
        self.touch();
        Ok(self.raw_intern_constant(constant))
    }

    // =========================================================================
    // Blocks
    // =========================================================================

    pub fn create_normal_block(&mut self) -> Result<BlockId> {
        self.check_mutable()?;
        self.touch();
        Ok(self.raw_new_block(BlockKind::Normal))
    }

    /// Insert a normal block between entry and exit and return it.
    pub fn create_first_normal_basic_block(&mut self) -> Result<BlockId> {
        self.check_mutable()?;
        let block = self.raw_new_block(BlockKind::Normal);
        match self.control_operator(self.entry) {
            Some(ctl) => {
                let exit = self.exit;
                self.operators[ctl].substitute_target(exit, block);
            }
            None => {
                self.raw_push_operator(self.entry, Operator::unconditional(block));
            }
        }
        self.raw_push_operator(block, Operator::unconditional(self.exit));
        self.touch();
        Ok(block)
    }

    /// Move `op` and every operator after it into a new normal block.
    ///
    /// The new block inherits the protection of the old one. With `link`
    /// the old block jumps to the new one; without it the old block is
    /// left without a control operator for the caller to repair.
    pub fn split_at_operator(&mut self, op: OpId, link: bool) -> Result<BlockId> {
        self.check_mutable()?;
        let (block, pos) = self.locate(op)?;
        if matches!(self.blocks[block].kind(), BlockKind::Entry | BlockKind::Exit) {
            return Err(self.structural(self.label(block), "entry and exit blocks cannot be split"));
        }

        let new_block = self.blocks.alloc(BasicBlock::new(BlockKind::Normal));
        let at = self
            .block_order
            .iter()
            .position(|&b| b == block)
            .map_or(self.block_order.len(), |i| i + 1);
        self.block_order.insert(at, new_block);

        let tail = self.blocks[block].operators.split_off(pos);
        for &moved in &tail {
            self.operators[moved].set_block(Some(new_block));
        }
        let protection = self.blocks[block].protected_by.clone();
        for &clause in &protection {
            self.clauses[clause].protected.insert(new_block);
        }
        let bb = &mut self.blocks[new_block];
        bb.operators = tail;
        bb.protected_by = protection;

        if link {
            self.raw_push_operator(block, Operator::unconditional(new_block));
        }
        self.touch();
        Ok(new_block)
    }

    /// Register an exception clause and create its handler block.
    ///
    /// Clauses must be disjoint from or nested within every existing clause;
    /// two clauses may protect the identical range.
    pub fn add_exception_clause(
        &mut self,
        flag: ExceptionFlag,
        protected: &[BlockId],
        class_filter: Option<TypeId>,
    ) -> Result<(ClauseId, BlockId)> {
        self.check_mutable()?;
        if protected.is_empty() {
            return Err(self.structural("exception clause", "protected range is empty"));
        }
        for &block in protected {
            self.check_block(block)?;
            if matches!(self.blocks[block].kind(), BlockKind::Entry | BlockKind::Exit) {
                return Err(self.structural(
                    self.label(block),
                    "entry and exit blocks cannot be protected",
                ));
            }
        }

        let range: BTreeSet<BlockId> = protected.iter().copied().collect();
        let handler = self.blocks.next_id();
        let clause = ExceptionClause {
            handler,
            flag,
            protected: range,
            class_filter,
        };
        for &existing in &self.clause_order {
            if !clause.nests_with(&self.clauses[existing]) {
                return Err(self.structural(
                    "exception clause",
                    format!("protected range partially overlaps clause {}", existing),
                ));
            }
        }

        let handler = self.raw_new_block(BlockKind::ExceptionHandler(flag));
        let id = self.clauses.alloc(ExceptionClause { handler, ..clause });
        self.clause_order.push(id);

        let members: Vec<BlockId> = self.clauses[id].protected.iter().copied().collect();
        for block in members {
            let mut protected_by = std::mem::take(&mut self.blocks[block].protected_by);
            protected_by.push(id);
            protected_by.sort_by_key(|&c| self.clauses[c].protected.len());
            self.blocks[block].protected_by = protected_by;
        }
        self.touch();
        Ok((id, handler))
    }

    /// Drop blocks no longer reachable from the entry, with their operators.
    ///
    /// Clauses left protecting nothing are removed together with their
    /// handler. Returns the number of blocks removed.
    pub fn remove_unreachable_blocks(&mut self) -> Result<usize> {
        self.check_mutable()?;
        let mut removed = 0;
        loop {
            let reachable = self.reachable_blocks();
            let dead: Vec<BlockId> = self
                .block_order
                .iter()
                .copied()
                .filter(|b| *b != self.exit && !reachable.contains(b))
                .collect();
            if dead.is_empty() {
                break;
            }
            for &block in &dead {
                self.detach_block(block);
            }
            removed += dead.len();
        }
        if removed > 0 {
            self.touch();
        }
        Ok(removed)
    }

    fn detach_block(&mut self, block: BlockId) {
        self.block_order.retain(|&b| b != block);
        let ops = std::mem::take(&mut self.blocks[block].operators);
        for op in ops {
            self.operators[op].set_block(None);
        }
        let clauses = std::mem::take(&mut self.blocks[block].protected_by);
        for clause in clauses {
            self.clauses[clause].protected.remove(&block);
            if self.clauses[clause].protected.is_empty() {
                self.clause_order.retain(|&c| c != clause);
                let handler = self.clauses[clause].handler;
                if self.is_live_block(handler) {
                    self.detach_block(handler);
                }
            }
        }
        // A handler going away takes its clause with it
        self.clause_order.retain(|&c| self.clauses[c].handler != block);
    }

    // =========================================================================
    // Operators
    // =========================================================================

    /// Append `op` to `block`.
    ///
    /// Ordinary operators go before an existing control operator; a second
    /// control operator is rejected.
    pub fn add_operator(&mut self, block: BlockId, op: Operator) -> Result<OpId> {
        self.check_mutable()?;
        self.check_block(block)?;
        self.check_new_operator(block, &op)?;
        if op.is_control() && self.control_operator(block).is_some() {
            return Err(self.structural(
                self.label(block),
                "block already ends with a control operator",
            ));
        }
        let id = self.raw_push_operator(block, op);
        self.touch();
        Ok(id)
    }

    pub fn insert_operator_before(&mut self, anchor: OpId, op: Operator) -> Result<OpId> {
        self.check_mutable()?;
        let (block, pos) = self.locate(anchor)?;
        if op.is_control() {
            return Err(self.structural(self.label(block), "control operator must end its block"));
        }
        self.check_new_operator(block, &op)?;
        let id = self.alloc_attached(block, op);
        self.blocks[block].operators.insert(pos, id);
        self.touch();
        Ok(id)
    }

    pub fn insert_operator_after(&mut self, anchor: OpId, op: Operator) -> Result<OpId> {
        self.check_mutable()?;
        let (block, pos) = self.locate(anchor)?;
        if self.operators[anchor].is_control() {
            return Err(self.structural(self.label(block), "nothing may follow a control operator"));
        }
        if op.is_control() && pos + 1 != self.blocks[block].operators.len() {
            return Err(self.structural(self.label(block), "control operator must end its block"));
        }
        self.check_new_operator(block, &op)?;
        let id = self.alloc_attached(block, op);
        self.blocks[block].operators.insert(pos + 1, id);
        self.touch();
        Ok(id)
    }

    fn alloc_attached(&mut self, block: BlockId, mut op: Operator) -> OpId {
        op.set_block(Some(block));
        self.operators.alloc(op)
    }

    /// Detach an operator. Leaving a block without control flow is allowed.
    pub fn remove_operator(&mut self, op: OpId) -> Result<()> {
        self.check_mutable()?;
        let (block, pos) = self.locate(op)?;
        self.blocks[block].operators.remove(pos);
        self.operators[op].set_block(None);
        self.touch();
        Ok(())
    }

    /// Put `op` where `old` was. Debug info carries over when `op` has none.
    pub fn substitute_operator(
        &mut self,
        old: OpId,
        mut op: Operator,
        copy_annotations: bool,
    ) -> Result<OpId> {
        self.check_mutable()?;
        let (block, pos) = self.locate(old)?;
        if op.is_control() && pos + 1 != self.blocks[block].operators.len() {
            return Err(self.structural(self.label(block), "control operator must end its block"));
        }
        self.check_new_operator(block, &op)?;

        let previous = &self.operators[old];
        if copy_annotations {
            for annotation in previous.annotations().to_vec() {
                op.add_annotation(annotation);
            }
        }
        if op.debug_info().is_none() {
            op.set_debug_info(previous.debug_info().cloned());
        }

        let id = self.alloc_attached(block, op);
        self.blocks[block].operators[pos] = id;
        self.operators[old].set_block(None);
        self.touch();
        Ok(id)
    }

    /// Replace the block's control operator, or add one.
    pub fn set_flow_control(&mut self, block: BlockId, op: Operator) -> Result<OpId> {
        self.check_mutable()?;
        if !op.is_control() {
            return Err(self.contract(format!("{} is not a control operator", op.kind().name())));
        }
        self.check_block(block)?;
        match self.control_operator(block) {
            Some(existing) => self.substitute_operator(existing, op, false),
            None => self.add_operator(block, op),
        }
    }

    /// Narrow an operator's capability mask.
    pub fn refine_capabilities(&mut self, op: OpId, caps: Capabilities) -> Result<()> {
        self.check_mutable()?;
        let method = self.method_name.clone();
        let operator = self.live_operator_mut(op)?;
        let rendered = operator.to_string();
        operator
            .refine_capabilities(caps)
            .map_err(|message| Error::CapabilityViolation {
                method,
                operator: rendered,
                message,
            })?;
        self.touch();
        Ok(())
    }

    pub fn add_annotation(&mut self, op: OpId, annotation: Annotation) -> Result<bool> {
        self.check_mutable()?;
        let added = self.live_operator_mut(op)?.add_annotation(annotation);
        self.touch();
        Ok(added)
    }

    pub fn remove_annotation(&mut self, op: OpId, annotation: &Annotation) -> Result<bool> {
        self.check_mutable()?;
        let removed = self.live_operator_mut(op)?.remove_annotation(annotation);
        self.touch();
        Ok(removed)
    }

    /// Replace every use of `old` in `op` by swapping in a new argument array.
    pub fn substitute_usage(&mut self, op: OpId, old: ExprId, new: ExprId) -> Result<bool> {
        self.check_mutable()?;
        self.check_expressions("substitute_usage", &[new])?;
        let changed = self.live_operator_mut(op)?.substitute_usage(old, new);
        self.touch();
        Ok(changed)
    }

    /// Rewrite one argument slot; refused (`false`) for calls.
    pub fn substitute_usage_at(&mut self, op: OpId, index: usize, new: ExprId) -> Result<bool> {
        self.check_mutable()?;
        self.check_expressions("substitute_usage_at", &[new])?;
        let changed = self.live_operator_mut(op)?.substitute_usage_at(index, new);
        self.touch();
        Ok(changed)
    }

    pub fn substitute_definition(&mut self, op: OpId, old: ExprId, new: ExprId) -> Result<bool> {
        self.check_mutable()?;
        self.check_expressions("substitute_definition", &[new])?;
        if self.is_constant(new) {
            return Err(self.structural(format!("operator {}", op), "a constant cannot be assigned"));
        }
        let changed = self.live_operator_mut(op)?.substitute_definition(old, new);
        self.touch();
        Ok(changed)
    }

    /// Install a whole new argument array.
    pub fn set_arguments(&mut self, op: OpId, arguments: Vec<ExprId>) -> Result<()> {
        self.check_mutable()?;
        self.check_expressions("set_arguments", &arguments)?;
        let method = self.method_name.clone();
        let operator = self.live_operator_mut(op)?;
        if matches!(operator.kind(), OperatorKind::IndirectSubroutine { .. })
            && arguments.is_empty()
        {
            return Err(Error::contract(method, "indirect call lost its callee slot"));
        }
        operator.set_arguments(arguments);
        self.touch();
        Ok(())
    }

    pub fn set_results(&mut self, op: OpId, results: Vec<ExprId>) -> Result<()> {
        self.check_mutable()?;
        self.check_expressions("set_results", &results)?;
        if results.iter().any(|&r| self.is_constant(r)) {
            return Err(self.structural(format!("operator {}", op), "a constant cannot be assigned"));
        }
        self.live_operator_mut(op)?.set_results(results);
        self.touch();
        Ok(())
    }

    /// Redirect a control operator's edge from `old` to `new`.
    pub fn retarget(&mut self, op: OpId, old: BlockId, new: BlockId) -> Result<bool> {
        self.check_mutable()?;
        let (block, _) = self.locate(op)?;
        let location = self.label(block);
        self.check_target(&location, new)?;
        let changed = self.operators[op].substitute_target(old, new);
        self.touch();
        Ok(changed)
    }

    /// Canonicalize operand order so constants sit on the right.
    pub fn ensure_constant_to_the_right(&mut self, op: OpId) -> Result<bool> {
        self.check_mutable()?;
        self.locate(op)?;
        let constants: HashSet<ExprId> = self.operators[op]
            .arguments()
            .iter()
            .copied()
            .filter(|&e| self.is_constant(e))
            .collect();
        let swapped = self.operators[op].ensure_constant_to_the_right(|e| constants.contains(&e));
        if swapped {
            self.touch();
        }
        Ok(swapped)
    }

    // =========================================================================
    // Variables
    // =========================================================================

    pub fn allocate_local(&mut self, ty: TypeId, name: Option<&str>) -> Result<ExprId> {
        self.check_mutable()?;
        let id = self.raw_push_variable(ty, VariableKind::Local);
        if let Some(name) = name {
            self.debug_info.insert(
                id,
                VariableDebugInfo {
                    name: name.to_string(),
                },
            );
        }
        self.touch();
        Ok(id)
    }

    pub fn allocate_temporary(&mut self, ty: TypeId) -> Result<ExprId> {
        self.check_mutable()?;
        let id = self.raw_push_variable(ty, VariableKind::Temporary);
        self.touch();
        Ok(id)
    }

    pub fn allocate_exception_object(&mut self, ty: TypeId) -> Result<ExprId> {
        self.check_mutable()?;
        let id = self.raw_push_variable(ty, VariableKind::ExceptionObject);
        self.touch();
        Ok(id)
    }

    /// Merge variable for `target`, sharing its type.
    pub fn allocate_phi(&mut self, target: ExprId) -> Result<ExprId> {
        self.check_mutable()?;
        let ty = match self.expressions.get(target).and_then(Expression::as_variable) {
            Some(v) if !matches!(v.kind(), VariableKind::Phi(_)) => v.ty(),
            _ => {
                return Err(self.structural(
                    format!("expression {}", target),
                    "phi target must be a plain variable",
                ))
            }
        };
        let id = self.raw_push_variable(ty, VariableKind::Phi(target));
        self.touch();
        Ok(id)
    }

    /// Attach a debug name to a variable. Does not affect its identity.
    pub fn set_variable_debug_info(&mut self, expr: ExprId, name: impl Into<String>) -> Result<()> {
        self.check_mutable()?;
        self.raw_set_variable_debug_info(expr, name)?;
        self.touch();
        Ok(())
    }

    /// Name a variable while the bridge materializes the graph.
    pub(crate) fn raw_set_variable_debug_info(
        &mut self,
        expr: ExprId,
        name: impl Into<String>,
    ) -> Result<()> {
        if self.expressions.get(expr).and_then(Expression::as_variable).is_none() {
            return Err(self.structural(format!("expression {}", expr), "debug info needs a variable"));
        }
        self.debug_info
            .insert(expr, VariableDebugInfo { name: name.into() });
        Ok(())
    }

    /// Drop unreferenced locals, temporaries, exception objects and phis
    /// from the variable tables, compacting their numbering.
    ///
    /// Arguments and the return value are always kept. Returns how many
    /// variables were dropped.
    pub fn renumber_variables(&mut self) -> Result<usize> {
        self.check_mutable()?;
        let mut referenced: HashSet<ExprId> = HashSet::new();
        for op in self.live_operators() {
            let operator = &self.operators[op];
            referenced.extend(operator.results());
            referenced.extend(operator.arguments());
            for annotation in operator.annotations() {
                match annotation {
                    Annotation::NotNull(e) | Annotation::Invalidates(e) => {
                        referenced.insert(*e);
                    }
                    _ => {}
                }
            }
        }
        for &phi in &self.phis {
            if referenced.contains(&phi) {
                if let Some(VariableKind::Phi(target)) =
                    self.expressions[phi].as_variable().map(VariableExpression::kind)
                {
                    referenced.insert(target);
                }
            }
        }
        if let Some(ret) = self.return_value {
            referenced.insert(ret);
        }

        let before = self.locals.len()
            + self.temporaries.len()
            + self.exception_objects.len()
            + self.phis.len();
        self.locals.retain(|e| referenced.contains(e));
        self.temporaries.retain(|e| referenced.contains(e));
        self.exception_objects.retain(|e| referenced.contains(e));
        self.phis.retain(|e| referenced.contains(e));
        let after = self.locals.len()
            + self.temporaries.len()
            + self.exception_objects.len()
            + self.phis.len();

        self.touch();
        Ok(before - after)
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Verify the graph and freeze it for code generation.
    pub fn finalize(&mut self) -> Result<()> {
        if self.state == CfgState::Finalized {
            return Ok(());
        }
        GraphVerifier::new().verify(self).into_result(self)?;
        self.state = CfgState::Finalized;
        tracing::debug!(method = %self.method_name, version = self.version, "graph finalized");
        Ok(())
    }
}
