//! Categorized errors shared across the daemon.
//!
//! Every failure in the reconciler and its collaborators is tagged with a
//! [`Category`] that decides how it is handled: critical errors terminate the
//! affected loop, recoverable errors are logged and aggregated, optional
//! errors are benign kernel responses that only show up at debug level.
//! Structured metadata travels with each error in an [`ErrorContext`].

use std::collections::BTreeMap;
use std::fmt;

/// Classifies an error to guide the handling strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Category {
    /// The surrounding loop cannot proceed (netlink subscribe failure,
    /// link enumeration failure, missing prerequisites).
    Critical,
    /// A per-interface or per-route failure. Logged, aggregated, and the
    /// reconciler keeps going.
    Recoverable,
    /// A command failed with a known-benign message. Logged at debug and
    /// swallowed.
    Optional,
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Category::Critical => "critical",
            Category::Recoverable => "recoverable",
            Category::Optional => "optional",
        };
        f.write_str(label)
    }
}

/// Structured metadata carried with a categorized error.
///
/// Non-empty fields from a later context override earlier ones when merged;
/// the open `extra` map is merged key by key.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ErrorContext {
    pub operation: Option<String>,
    pub interface: Option<String>,
    pub profile: Option<String>,
    pub command: Option<String>,
    pub ifb: Option<String>,
    pub value: Option<String>,
    pub expected: Option<String>,
    pub actual: Option<String>,
    pub extra: BTreeMap<String, String>,
}

impl ErrorContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn op(mut self, operation: impl Into<String>) -> Self {
        self.operation = Some(operation.into());
        self
    }

    pub fn iface(mut self, interface: impl Into<String>) -> Self {
        self.interface = Some(interface.into());
        self
    }

    pub fn profile(mut self, profile: impl Into<String>) -> Self {
        self.profile = Some(profile.into());
        self
    }

    pub fn command(mut self, command: impl Into<String>) -> Self {
        self.command = Some(command.into());
        self
    }

    pub fn ifb(mut self, ifb: impl Into<String>) -> Self {
        self.ifb = Some(ifb.into());
        self
    }

    pub fn value(mut self, value: impl Into<String>) -> Self {
        self.value = Some(value.into());
        self
    }

    pub fn expected(mut self, expected: impl Into<String>) -> Self {
        self.expected = Some(expected.into());
        self
    }

    pub fn actual(mut self, actual: impl Into<String>) -> Self {
        self.actual = Some(actual.into());
        self
    }

    pub fn extra(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.extra.insert(key.into(), value.into());
        self
    }

    /// Combines two contexts. Non-empty fields from `other` win.
    pub fn merge(mut self, other: ErrorContext) -> ErrorContext {
        if other.operation.is_some() {
            self.operation = other.operation;
        }
        if other.interface.is_some() {
            self.interface = other.interface;
        }
        if other.profile.is_some() {
            self.profile = other.profile;
        }
        if other.command.is_some() {
            self.command = other.command;
        }
        if other.ifb.is_some() {
            self.ifb = other.ifb;
        }
        if other.value.is_some() {
            self.value = other.value;
        }
        if other.expected.is_some() {
            self.expected = other.expected;
        }
        if other.actual.is_some() {
            self.actual = other.actual;
        }
        self.extra.extend(other.extra);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.operation.is_none()
            && self.interface.is_none()
            && self.profile.is_none()
            && self.command.is_none()
            && self.ifb.is_none()
            && self.value.is_none()
            && self.expected.is_none()
            && self.actual.is_none()
            && self.extra.is_empty()
    }

    /// Renders the populated fields as `key=value` pairs in a fixed order,
    /// for logging.
    pub fn pairs(&self) -> Vec<(&'static str, &str)> {
        let mut out = Vec::new();
        let fields: [(&'static str, &Option<String>); 8] = [
            ("operation", &self.operation),
            ("interface", &self.interface),
            ("profile", &self.profile),
            ("command", &self.command),
            ("ifb", &self.ifb),
            ("value", &self.value),
            ("expected", &self.expected),
            ("actual", &self.actual),
        ];
        for (key, value) in fields {
            if let Some(value) = value {
                out.push((key, value.as_str()));
            }
        }
        out
    }
}

impl fmt::Display for ErrorContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        let mut write_pair = |f: &mut fmt::Formatter<'_>, key: &str, value: &str| {
            if !first {
                f.write_str(" ")?;
            }
            first = false;
            write!(f, "{key}={value}")
        };
        for (key, value) in self.pairs() {
            write_pair(f, key, value)?;
        }
        for (key, value) in &self.extra {
            write_pair(f, key, value)?;
        }
        Ok(())
    }
}

/// The boxed root cause carried by a [`CategorizedError`].
pub type Cause = Box<dyn std::error::Error + Send + Sync + 'static>;

/// An error tagged with a [`Category`] and an [`ErrorContext`].
#[derive(Debug)]
pub struct CategorizedError {
    pub category: Category,
    pub cause: Cause,
    pub context: ErrorContext,
}

impl fmt::Display for CategorizedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.context.is_empty() {
            write!(f, "[{}] {}", self.category, self.cause)
        } else {
            write!(f, "[{}] {} (context: {})", self.category, self.cause, self.context)
        }
    }
}

impl std::error::Error for CategorizedError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        let cause: &(dyn std::error::Error + 'static) = self.cause.as_ref();
        Some(cause)
    }
}

impl CategorizedError {
    pub fn new(category: Category, cause: impl Into<Cause>, context: ErrorContext) -> Self {
        Self { category, cause: cause.into(), context }
    }

    pub fn critical(cause: impl Into<Cause>, context: ErrorContext) -> Self {
        Self::new(Category::Critical, cause, context)
    }

    pub fn recoverable(cause: impl Into<Cause>, context: ErrorContext) -> Self {
        Self::new(Category::Recoverable, cause, context)
    }

    pub fn optional(cause: impl Into<Cause>, context: ErrorContext) -> Self {
        Self::new(Category::Optional, cause, context)
    }

    /// Wraps a cause as recoverable, stamping the operation and merging any
    /// extra context on top.
    pub fn wrap_recoverable(
        cause: impl Into<Cause>,
        operation: &str,
        context: ErrorContext,
    ) -> Self {
        Self::new(Category::Recoverable, cause, ErrorContext::new().op(operation).merge(context))
    }
}

/// Aggregates several categorized errors while preserving the individual
/// cases for programmatic inspection.
#[derive(Debug, Default)]
pub struct MultiError {
    pub errors: Vec<CategorizedError>,
}

impl std::error::Error for MultiError {}

impl fmt::Display for MultiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, err) in self.errors.iter().enumerate() {
            if i > 0 {
                f.write_str("; ")?;
            }
            write!(f, "{err}")?;
        }
        Ok(())
    }
}

impl MultiError {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, err: CategorizedError) {
        self.errors.push(err);
    }

    pub fn extend(&mut self, errors: impl IntoIterator<Item = CategorizedError>) {
        self.errors.extend(errors);
    }

    pub fn len(&self) -> usize {
        self.errors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }

    /// Returns `Ok(())` when no errors were collected, the aggregate
    /// otherwise.
    pub fn into_result(self) -> Result<(), MultiError> {
        if self.errors.is_empty() {
            Ok(())
        } else {
            Err(self)
        }
    }
}

impl From<CategorizedError> for MultiError {
    fn from(err: CategorizedError) -> Self {
        Self { errors: vec![err] }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn merge_prefers_later_non_empty_fields() {
        let base = ErrorContext::new().op("configure_root_qdisc").iface("eth0").value("1500");
        let overlay = ErrorContext::new().iface("eth1").extra("feature", "gro");

        let merged = base.merge(overlay);
        assert_eq!(merged.operation.as_deref(), Some("configure_root_qdisc"));
        assert_eq!(merged.interface.as_deref(), Some("eth1"));
        assert_eq!(merged.value.as_deref(), Some("1500"));
        assert_eq!(merged.extra.get("feature").map(String::as_str), Some("gro"));
    }

    #[test]
    fn display_includes_category_and_context() {
        let err = CategorizedError::recoverable(
            std::io::Error::other("tc exited with status 2"),
            ErrorContext::new().op("configure_root_qdisc").iface("eth0"),
        );
        let rendered = err.to_string();
        assert!(rendered.starts_with("[recoverable]"), "{rendered}");
        assert!(rendered.contains("operation=configure_root_qdisc"), "{rendered}");
        assert!(rendered.contains("interface=eth0"), "{rendered}");
    }

    #[test]
    fn multi_error_joins_cases() {
        let mut errs = MultiError::new();
        assert!(errs.is_empty());
        errs.push(CategorizedError::recoverable(
            std::io::Error::other("first"),
            ErrorContext::new(),
        ));
        errs.push(CategorizedError::optional(std::io::Error::other("second"), ErrorContext::new()));

        assert_eq!(errs.len(), 2);
        let rendered = errs.to_string();
        assert!(rendered.contains("first"));
        assert!(rendered.contains("; "));
        assert!(rendered.contains("second"));
        assert!(errs.into_result().is_err());
    }

    #[test]
    fn empty_multi_error_is_ok() {
        assert!(MultiError::new().into_result().is_ok());
    }
}
