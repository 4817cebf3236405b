//! Error types for the embir IR framework

use thiserror::Error;

/// IR framework errors
///
/// Every variant that concerns a single graph carries the printable name of
/// the method that owns it, so the pass driver can attribute the failure
/// without holding on to the graph.
#[derive(Error, Debug, Clone)]
pub enum Error {
    // Graph well-formedness
    /// Malformed control-flow graph
    ///
    /// **Triggered by:** dangling expression or block references, orphaned
    /// blocks, exception clauses that partially overlap, a second control
    /// operator appended to a block
    /// **Scope:** fatal to the current method only
    #[error("Structural error in {method} at {location}: {message}")]
    Structural {
        /// Method owning the graph
        method: String,
        /// Block/operator label or debug-info position
        location: String,
        /// Error description
        message: String,
    },

    /// An operator's declared capabilities disagree with what its kind can honour
    ///
    /// **Triggered by:** refining a mask below the kind's known-safe minimum,
    /// claiming commutativity on a non-commutative operator, an unpaired mask
    /// **Scope:** aborts the whole run, the IR invariants are not trustworthy
    #[error("Capability violation in {method} on {operator}: {message}")]
    CapabilityViolation {
        /// Method owning the graph
        method: String,
        /// Rendered operator
        operator: String,
        /// Error description
        message: String,
    },

    // Type-system bridge
    /// The bridge cannot resolve a referenced descriptor
    #[error("{kind} not found: {name}")]
    DescriptorNotFound {
        /// Descriptor kind (type, method, field)
        kind: String,
        /// Name or id that failed to resolve
        name: String,
    },

    /// A descriptor with the same qualified name is already registered
    #[error("Duplicate {kind}: {name}")]
    DuplicateDescriptor {
        /// Descriptor kind (type, method, field)
        kind: String,
        /// Qualified name
        name: String,
    },

    /// API misuse: mutation of a finalized graph, foreign ids, bad calling convention use
    #[error("Contract violation in {method}: {message}")]
    ContractViolation {
        /// Method owning the graph (or the bridge operation)
        method: String,
        /// Error description
        message: String,
    },

    /// A constant payload does not fit its declared type
    ///
    /// **Example:** `UInt(7)` declared as `I4`, `Str` declared as `R8`
    #[error("Constant of type {declared} cannot hold {value}")]
    ConstantTypeMismatch {
        /// Declared type name
        declared: String,
        /// Rendered payload
        value: String,
    },

    // Driver
    /// Configuration could not be loaded
    #[error("Configuration error: {0}")]
    Config(String),

    /// Worker pool could not be created
    #[error("Thread pool error: {0}")]
    ThreadPool(String),

    /// A per-method failure as seen by the pass driver
    #[error("Compilation of {method} failed: {source}")]
    CompilationFailure {
        /// Method whose compilation failed
        method: String,
        /// Underlying failure
        #[source]
        source: Box<Error>,
    },
}

/// Error severity classification
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorSeverity {
    /// Abandon the current method, keep compiling the others
    MethodFatal,
    /// Abort the whole run
    RunFatal,
    /// Reported at the bridge boundary, nothing is corrupted
    Recoverable,
}

impl Error {
    /// Create a structural error
    pub fn structural(
        method: impl Into<String>,
        location: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Error::Structural {
            method: method.into(),
            location: location.into(),
            message: message.into(),
        }
    }

    /// Create a contract violation
    pub fn contract(method: impl Into<String>, message: impl Into<String>) -> Self {
        Error::ContractViolation {
            method: method.into(),
            message: message.into(),
        }
    }

    /// Create a descriptor-not-found error
    pub fn not_found(kind: impl Into<String>, name: impl Into<String>) -> Self {
        Error::DescriptorNotFound {
            kind: kind.into(),
            name: name.into(),
        }
    }

    /// Wrap an error with the method it was raised for
    pub fn in_method(self, method: impl Into<String>) -> Self {
        match self {
            Error::CompilationFailure { .. } => self,
            other => Error::CompilationFailure {
                method: method.into(),
                source: Box::new(other),
            },
        }
    }

    /// Classify error severity
    pub fn classify(&self) -> ErrorSeverity {
        match self {
            Error::Structural { .. } => ErrorSeverity::MethodFatal,

            Error::CapabilityViolation { .. } => ErrorSeverity::RunFatal,
            Error::ContractViolation { .. } => ErrorSeverity::RunFatal,
            Error::ConstantTypeMismatch { .. } => ErrorSeverity::RunFatal,
            Error::Config(_) => ErrorSeverity::RunFatal,
            Error::ThreadPool(_) => ErrorSeverity::RunFatal,

            Error::DescriptorNotFound { .. } => ErrorSeverity::Recoverable,
            Error::DuplicateDescriptor { .. } => ErrorSeverity::Recoverable,

            Error::CompilationFailure { source, .. } => source.classify(),
        }
    }
}

/// Result type for IR operations
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify() {
        assert_eq!(
            Error::structural("A::f", "Normal_2", "dangling").classify(),
            ErrorSeverity::MethodFatal
        );
        assert_eq!(
            Error::contract("A::f", "finalized").classify(),
            ErrorSeverity::RunFatal
        );
        assert_eq!(
            Error::not_found("type", "Foo").classify(),
            ErrorSeverity::Recoverable
        );
    }

    #[test]
    fn test_in_method_keeps_severity() {
        let err = Error::structural("A::f", "Entry_0", "bad").in_method("A::f");
        assert_eq!(err.classify(), ErrorSeverity::MethodFatal);
        assert!(err.to_string().contains("Compilation of A::f failed"));

        // Wrapping twice is a no-op
        let again = err.clone().in_method("B::g");
        assert!(again.to_string().starts_with("Compilation of A::f"));
    }
}
