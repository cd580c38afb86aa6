use mrp_core::policy::{PolicyCheck, PolicyReport};
use mrp_core::spec::OperatorKind;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CompileError {
    #[error("schema validation failed at `{path}`: {reason}")]
    SchemaValidation { path: String, reason: String },

    #[error("policy violation ({check}): {reason}")]
    PolicyViolation {
        check: PolicyCheck,
        reason: String,
        report: Box<PolicyReport>,
    },

    #[error("unresolved {phase} operator `{reference}`: {reason}")]
    UnresolvedOperator {
        phase: OperatorKind,
        reference: String,
        reason: String,
    },

    #[error("IR constraint violated: {0}")]
    IrConstraint(String),

    #[error("core error: {0}")]
    Core(#[from] mrp_core::Error),

    #[error("reading {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

impl CompileError {
    pub fn schema(path: impl Into<String>, reason: impl Into<String>) -> Self {
        CompileError::SchemaValidation {
            path: path.into(),
            reason: reason.into(),
        }
    }

    /// Wrap a rejected report; the first failing check names the violation.
    pub fn policy(report: PolicyReport) -> Self {
        let (check, reason) = match report.failing_check() {
            Some(c) => (c.check, c.reason.clone().unwrap_or_default()),
            None => (PolicyCheck::Caps, "policy rejected".to_string()),
        };
        CompileError::PolicyViolation {
            check,
            reason,
            report: Box::new(report),
        }
    }
}
