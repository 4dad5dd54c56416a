// Shared error vocabulary and the structured operation report returned by
// the public mutating surface.
//
// Each subsystem defines its own thiserror enum; every variant maps onto one
// of the ErrorKind values below so callers can route on kind without
// matching on subsystem-specific types.

use serde::{Deserialize, Serialize};

/// Classification of every error the controller can surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    /// Input or configuration failed validation
    Validation,
    /// A required dependency has no satisfying provider
    DependencyUnresolved,
    /// Circular or version conflict in the dependency graph
    DependencyConflict,
    /// Module-level conflict (duplicate registration, declared incompatibility)
    ModuleConflict,
    /// A resource limit would be breached
    ResourceLimit,
    /// Access-control evaluation denied the operation
    AccessDenied,
    /// Namespace lookup failed
    NamespaceNotFound,
    /// Namespace path or alias already taken
    NamespacePathConflict,
    /// Namespace is locked against mutation
    NamespaceLocked,
    /// A migration failed to apply
    MigrationFailed,
    /// Post-activation verification did not pass
    HealthCheckFailed,
    /// The activation exceeded its overall deadline
    ActivationTimeout,
    /// Another activation holds the lock for this module/tenant
    ActivationInProgress,
    /// Compensation itself failed
    RollbackFailed,
    /// Activation queue is full
    Busy,
    /// Unrecoverable; requires out-of-band intervention
    Critical,
}

impl ErrorKind {
    /// Recoverable errors are surfaced to the caller without any state
    /// mutation having taken place.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            ErrorKind::Validation
                | ErrorKind::DependencyUnresolved
                | ErrorKind::ResourceLimit
                | ErrorKind::AccessDenied
                | ErrorKind::Busy
                | ErrorKind::ActivationInProgress
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Validation => "VALIDATION",
            ErrorKind::DependencyUnresolved => "DEPENDENCY_UNRESOLVED",
            ErrorKind::DependencyConflict => "DEPENDENCY_CONFLICT",
            ErrorKind::ModuleConflict => "MODULE_CONFLICT",
            ErrorKind::ResourceLimit => "RESOURCE_LIMIT",
            ErrorKind::AccessDenied => "ACCESS_DENIED",
            ErrorKind::NamespaceNotFound => "NAMESPACE_NOT_FOUND",
            ErrorKind::NamespacePathConflict => "NAMESPACE_PATH_CONFLICT",
            ErrorKind::NamespaceLocked => "NAMESPACE_LOCKED",
            ErrorKind::MigrationFailed => "MIGRATION_FAILED",
            ErrorKind::HealthCheckFailed => "HEALTH_CHECK_FAILED",
            ErrorKind::ActivationTimeout => "ACTIVATION_TIMEOUT",
            ErrorKind::ActivationInProgress => "ACTIVATION_IN_PROGRESS",
            ErrorKind::RollbackFailed => "ROLLBACK_FAILED",
            ErrorKind::Busy => "BUSY",
            ErrorKind::Critical => "CRITICAL",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A single classified error inside an operation report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationError {
    pub kind: ErrorKind,
    pub message: String,
}

impl OperationError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

impl std::fmt::Display for OperationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

/// Structured result for public mutating operations.
///
/// Partial success is only expressed by `import` and bulk reads; everywhere
/// else `success` implies an empty error list.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperationReport {
    pub success: bool,
    pub errors: Vec<OperationError>,
    pub warnings: Vec<String>,
    /// Terminal state of the touched object, where one exists
    pub state: Option<String>,
}

impl OperationReport {
    pub fn ok() -> Self {
        Self {
            success: true,
            errors: Vec::new(),
            warnings: Vec::new(),
            state: None,
        }
    }

    pub fn ok_with_state(state: impl Into<String>) -> Self {
        Self {
            success: true,
            errors: Vec::new(),
            warnings: Vec::new(),
            state: Some(state.into()),
        }
    }

    pub fn failed(error: OperationError) -> Self {
        Self {
            success: false,
            errors: vec![error],
            warnings: Vec::new(),
            state: None,
        }
    }

    pub fn add_error(&mut self, error: OperationError) {
        self.success = false;
        self.errors.push(error);
    }

    pub fn add_warning(&mut self, warning: impl Into<String>) {
        self.warnings.push(warning.into());
    }

    pub fn has_kind(&self, kind: ErrorKind) -> bool {
        self.errors.iter().any(|e| e.kind == kind)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_strings_are_stable() {
        assert_eq!(ErrorKind::DependencyUnresolved.as_str(), "DEPENDENCY_UNRESOLVED");
        assert_eq!(ErrorKind::NamespacePathConflict.as_str(), "NAMESPACE_PATH_CONFLICT");
        assert_eq!(ErrorKind::Critical.as_str(), "CRITICAL");
    }

    #[test]
    fn recoverable_kinds_do_not_include_operational_failures() {
        assert!(ErrorKind::Validation.is_recoverable());
        assert!(ErrorKind::AccessDenied.is_recoverable());
        assert!(!ErrorKind::MigrationFailed.is_recoverable());
        assert!(!ErrorKind::RollbackFailed.is_recoverable());
    }

    #[test]
    fn report_accumulates_errors() {
        let mut report = OperationReport::ok();
        assert!(report.success);

        report.add_error(OperationError::new(ErrorKind::Validation, "bad id"));
        assert!(!report.success);
        assert!(report.has_kind(ErrorKind::Validation));
        assert!(!report.has_kind(ErrorKind::Busy));
    }
}
