//! Basic blocks and exception regions

use super::arena::Id;
use super::operator::OpId;
use super::types::TypeId;
use std::collections::BTreeSet;
use std::fmt;

/// Handle of a block inside one graph
pub type BlockId = Id<BasicBlock>;
/// Handle of an exception clause inside one graph
pub type ClauseId = Id<ExceptionClause>;

/// Handler flavour of an exception clause
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExceptionFlag {
    Catch,
    Filter,
    Finally,
    Fault,
}

impl ExceptionFlag {
    pub fn name(self) -> &'static str {
        match self {
            ExceptionFlag::Catch => "Catch",
            ExceptionFlag::Filter => "Filter",
            ExceptionFlag::Finally => "Finally",
            ExceptionFlag::Fault => "Fault",
        }
    }
}

/// Qualifier of a block
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BlockKind {
    /// Unique, never a successor
    Entry,
    Normal,
    /// Reached only through the exception-clause table
    ExceptionHandler(ExceptionFlag),
    /// Unique, never a predecessor
    Exit,
}

impl BlockKind {
    pub fn label_prefix(self) -> &'static str {
        match self {
            BlockKind::Entry => "Entry",
            BlockKind::Normal => "Normal",
            BlockKind::ExceptionHandler(flag) => flag.name(),
            BlockKind::Exit => "Exit",
        }
    }
}

/// Ordered operators plus qualifier and protection
#[derive(Debug, Clone, PartialEq)]
pub struct BasicBlock {
    kind: BlockKind,
    pub(crate) operators: Vec<OpId>,
    pub(crate) protected_by: Vec<ClauseId>,
}

impl BasicBlock {
    pub(crate) fn new(kind: BlockKind) -> Self {
        Self {
            kind,
            operators: Vec::new(),
            protected_by: Vec::new(),
        }
    }

    pub fn kind(&self) -> BlockKind {
        self.kind
    }

    /// Handler flag, fixed when the clause created the block
    pub fn exception_flag(&self) -> Option<ExceptionFlag> {
        match self.kind {
            BlockKind::ExceptionHandler(flag) => Some(flag),
            _ => None,
        }
    }

    pub fn is_handler(&self) -> bool {
        self.exception_flag().is_some()
    }

    pub fn operators(&self) -> &[OpId] {
        &self.operators
    }

    /// Clauses whose protected range contains this block, innermost first
    pub fn protected_by(&self) -> &[ClauseId] {
        &self.protected_by
    }

    pub fn position_of(&self, op: OpId) -> Option<usize> {
        self.operators.iter().position(|&o| o == op)
    }
}

/// A protected range of blocks with its handler
#[derive(Debug, Clone, PartialEq)]
pub struct ExceptionClause {
    pub(crate) handler: BlockId,
    pub(crate) flag: ExceptionFlag,
    pub(crate) protected: BTreeSet<BlockId>,
    pub(crate) class_filter: Option<TypeId>,
}

impl ExceptionClause {
    pub fn handler(&self) -> BlockId {
        self.handler
    }

    pub fn flag(&self) -> ExceptionFlag {
        self.flag
    }

    pub fn protected(&self) -> &BTreeSet<BlockId> {
        &self.protected
    }

    /// Exception type caught by a `Catch` clause
    pub fn class_filter(&self) -> Option<TypeId> {
        self.class_filter
    }

    /// Disjoint or nested (identical ranges count as nested).
    pub fn nests_with(&self, other: &ExceptionClause) -> bool {
        self.protected.is_disjoint(&other.protected)
            || self.protected.is_subset(&other.protected)
            || other.protected.is_subset(&self.protected)
    }
}

/// Whether an edge follows control operators or the clause table
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EdgeClass {
    Normal,
    Exception,
}

/// A flow edge between two blocks
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockEdge {
    pub from: BlockId,
    pub to: BlockId,
    pub class: EdgeClass,
    /// Positions of the operators in `from` the edge originates at.
    /// For normal edges this is the control operator.
    pub origins: Vec<usize>,
}

impl fmt::Display for EdgeClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EdgeClass::Normal => write!(f, "Normal"),
            EdgeClass::Exception => write!(f, "Exception"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn clause(blocks: &[u32]) -> ExceptionClause {
        ExceptionClause {
            handler: BlockId::new(100),
            flag: ExceptionFlag::Catch,
            protected: blocks.iter().map(|&b| BlockId::new(b)).collect(),
            class_filter: None,
        }
    }

    #[test]
    fn test_nesting_rules() {
        let outer = clause(&[1, 2, 3]);
        let inner = clause(&[2]);
        let apart = clause(&[7, 8]);
        let straddle = clause(&[3, 4]);

        assert!(outer.nests_with(&inner));
        assert!(inner.nests_with(&outer));
        assert!(outer.nests_with(&apart));
        assert!(outer.nests_with(&outer.clone()));
        assert!(!outer.nests_with(&straddle));
    }

    #[test]
    fn test_handler_flag_is_exposed() {
        let block = BasicBlock::new(BlockKind::ExceptionHandler(ExceptionFlag::Finally));
        assert_eq!(block.exception_flag(), Some(ExceptionFlag::Finally));
        assert!(block.is_handler());
        assert_eq!(BasicBlock::new(BlockKind::Entry).exception_flag(), None);
    }
}
