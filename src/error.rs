//! Errors raised by the trace engine and by stochastic procedures.

use std::{fmt, sync::Arc};

use thiserror::Error;

use crate::node::NodeId;

/// Where an error happened: the node being processed and the procedure
/// that was applied there, if known.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Site {
    pub node: Option<NodeId>,
    pub procedure: Option<Arc<str>>,
}

impl Site {
    pub fn procedure(name: &str) -> Site {
        Site {
            node: None,
            procedure: Some(name.into()),
        }
    }

    pub fn node(node: NodeId) -> Site {
        Site {
            node: Some(node),
            procedure: None,
        }
    }
}

impl fmt::Display for Site {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(procedure) = &self.procedure {
            write!(f, " in `{}`", procedure)?;
        }
        if let Some(node) = self.node {
            write!(f, " at node {}", node)?;
        }
        Ok(())
    }
}

#[non_exhaustive]
#[derive(Error, Debug, Clone, PartialEq)]
pub enum TraceError {
    #[error("type mismatch{site}: expected {expected}, got {got}")]
    TypeMismatch {
        site: Site,
        expected: &'static str,
        got: String,
    },
    #[error("wrong number of arguments{site}: expected {expected}, got {got}")]
    Arity {
        site: Site,
        expected: String,
        got: usize,
    },
    #[error("argument out of domain{site}: {message}")]
    Domain { site: Site, message: String },
    #[error("non-finite {quantity}{site}: {value}")]
    Numerical {
        site: Site,
        quantity: &'static str,
        value: f64,
    },
    #[error("unbound symbol `{symbol}`")]
    UnboundSymbol { symbol: String },
    #[error("gradient unavailable{site}: procedure lacks {capability}")]
    GradientUnavailable {
        site: Site,
        capability: &'static str,
    },
    #[error("log density unavailable{site}")]
    DensityUnavailable { site: Site },
    #[error("operator is not a procedure{site}: got {got}")]
    NotAProcedure { site: Site, got: String },
    #[error("malformed expression: {message}")]
    MalformedExpression { message: String },
    #[error("unknown directive {0}")]
    UnknownDirective(u64),
    #[error("cannot constrain{site}: {message}")]
    CannotConstrain { site: Site, message: String },
    #[error("directive {0} is still referenced by other parts of the trace")]
    DirectiveInUse(u64),
    #[error("scaffold not supported by this kernel: {0}")]
    UnsupportedScaffold(String),
    #[error("trace is inconsistent: {0}")]
    Inconsistent(String),
}

pub type Result<T> = std::result::Result<T, TraceError>;

/// The variants that carry a [`Site`], borrowed the same way as the error.
macro_rules! site_of {
    ($error:expr) => {
        match $error {
            TraceError::TypeMismatch { site, .. }
            | TraceError::Arity { site, .. }
            | TraceError::Domain { site, .. }
            | TraceError::Numerical { site, .. }
            | TraceError::GradientUnavailable { site, .. }
            | TraceError::DensityUnavailable { site }
            | TraceError::NotAProcedure { site, .. }
            | TraceError::CannotConstrain { site, .. } => Some(site),
            _ => None,
        }
    };
}

impl TraceError {
    pub fn type_mismatch(expected: &'static str, got: impl fmt::Display) -> TraceError {
        TraceError::TypeMismatch {
            site: Site::default(),
            expected,
            got: got.to_string(),
        }
    }

    pub fn arity(expected: impl Into<String>, got: usize) -> TraceError {
        TraceError::Arity {
            site: Site::default(),
            expected: expected.into(),
            got,
        }
    }

    pub fn domain(message: impl Into<String>) -> TraceError {
        TraceError::Domain {
            site: Site::default(),
            message: message.into(),
        }
    }

    pub fn numerical(quantity: &'static str, value: f64) -> TraceError {
        TraceError::Numerical {
            site: Site::default(),
            quantity,
            value,
        }
    }

    /// Numerical trouble inside a transition is treated like a divergence:
    /// the transition is rolled back and sampling continues. Everything
    /// else is reported to the caller.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, TraceError::Numerical { .. })
    }

    fn site_mut(&mut self) -> Option<&mut Site> {
        site_of!(self)
    }

    /// Fill in the node and procedure if the raising code did not know them.
    pub fn at(mut self, node: NodeId, procedure: Option<&str>) -> TraceError {
        if let Some(site) = self.site_mut() {
            if site.node.is_none() {
                site.node = Some(node);
            }
            if site.procedure.is_none() {
                site.procedure = procedure.map(Into::into);
            }
        }
        self
    }

    pub fn site(&self) -> Option<&Site> {
        site_of!(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn context_is_filled_once() {
        let err = TraceError::domain("scale must be positive")
            .at(NodeId(3), Some("normal"))
            .at(NodeId(9), Some("other"));
        let site = err.site().unwrap();
        assert_eq!(site.node, Some(NodeId(3)));
        assert_eq!(site.procedure.as_deref(), Some("normal"));
        assert_eq!(
            err.to_string(),
            "argument out of domain in `normal` at node 3: scale must be positive"
        );
    }

    #[test]
    fn site_is_shared_by_every_located_variant() {
        let located = [
            TraceError::type_mismatch("number", "#t"),
            TraceError::arity("2", 3),
            TraceError::numerical("log density", f64::NAN),
            TraceError::DensityUnavailable {
                site: Site::default(),
            },
            TraceError::CannotConstrain {
                site: Site::default(),
                message: "deterministic".into(),
            },
        ];
        for err in located {
            let err = err.at(NodeId(5), Some("flip"));
            assert_eq!(err.site().and_then(|site| site.node), Some(NodeId(5)));
        }
        let unlocated = TraceError::UnknownDirective(4).at(NodeId(5), None);
        assert_eq!(unlocated.site(), None);
    }

    #[test]
    fn only_numerical_errors_recover() {
        assert!(TraceError::numerical("log density", f64::NAN).is_recoverable());
        assert!(!TraceError::arity("2", 3).is_recoverable());
        assert!(!TraceError::UnboundSymbol {
            symbol: "x".into()
        }
        .is_recoverable());
    }
}
