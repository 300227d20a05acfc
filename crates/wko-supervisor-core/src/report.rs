// ABOUTME: Typed validation results: tiered diagnostics, per-worker results, dry-run checks.
// ABOUTME: Also renders the human-readable configuration report.

use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;

/// One finding, optionally scoped to a worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Diagnostic {
    pub worker: Option<String>,
    pub message: String,
}

impl Diagnostic {
    pub fn global(message: impl Into<String>) -> Self {
        Self {
            worker: None,
            message: message.into(),
        }
    }

    pub fn for_worker(worker: &str, message: impl Into<String>) -> Self {
        Self {
            worker: Some(worker.to_string()),
            message: message.into(),
        }
    }
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.worker {
            Some(worker) => write!(f, "[{}] {}", worker, self.message),
            None => f.write_str(&self.message),
        }
    }
}

/// Validation result for a single worker configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct WorkerValidation {
    pub valid: bool,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
    pub recommendations: Vec<String>,
}

impl WorkerValidation {
    pub(crate) fn error(&mut self, message: impl Into<String>) {
        self.errors.push(message.into());
    }

    pub(crate) fn warn(&mut self, message: impl Into<String>) {
        self.warnings.push(message.into());
    }

    pub(crate) fn recommend(&mut self, message: impl Into<String>) {
        self.recommendations.push(message.into());
    }

    pub(crate) fn finish(mut self) -> Self {
        self.valid = self.errors.is_empty();
        self
    }
}

/// Result of validating a whole configuration document.
///
/// `valid` is true exactly when `errors` is empty; warnings and
/// recommendations never affect it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ValidationReport {
    pub valid: bool,
    pub errors: Vec<Diagnostic>,
    pub warnings: Vec<Diagnostic>,
    pub recommendations: Vec<Diagnostic>,
    pub per_worker: BTreeMap<String, WorkerValidation>,
}

impl ValidationReport {
    pub(crate) fn new() -> Self {
        Self {
            valid: true,
            errors: Vec::new(),
            warnings: Vec::new(),
            recommendations: Vec::new(),
            per_worker: BTreeMap::new(),
        }
    }

    /// A report with no findings.
    pub fn empty() -> Self {
        Self::new()
    }

    pub(crate) fn error(&mut self, diagnostic: Diagnostic) {
        self.errors.push(diagnostic);
    }

    pub(crate) fn warn(&mut self, diagnostic: Diagnostic) {
        self.warnings.push(diagnostic);
    }

    pub(crate) fn recommend(&mut self, diagnostic: Diagnostic) {
        self.recommendations.push(diagnostic);
    }

    /// Fold a worker's findings into the top-level lists, scoped by id.
    pub(crate) fn absorb(&mut self, id: &str, validation: WorkerValidation) {
        for message in &validation.errors {
            self.error(Diagnostic::for_worker(id, message.clone()));
        }
        for message in &validation.warnings {
            self.warn(Diagnostic::for_worker(id, message.clone()));
        }
        for message in &validation.recommendations {
            self.recommend(Diagnostic::for_worker(id, message.clone()));
        }
        self.per_worker.insert(id.to_string(), validation);
    }

    pub(crate) fn finish(mut self) -> Self {
        self.valid = self.errors.is_empty();
        self
    }

    /// Fatal findings attributed to one worker, including cross-worker ones
    /// such as port collisions.
    pub fn errors_for<'a>(&'a self, id: &'a str) -> impl Iterator<Item = &'a Diagnostic> + 'a {
        self.errors
            .iter()
            .filter(move |d| d.worker.as_deref() == Some(id))
    }

    /// Fatal findings that are not attributed to any worker.
    pub fn global_errors(&self) -> impl Iterator<Item = &Diagnostic> {
        self.errors.iter().filter(|d| d.worker.is_none())
    }
}

/// Outcome of a non-destructive dry run of a worker's launch command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExecutableCheck {
    pub can_start: bool,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
    pub info: Vec<String>,
}

impl Default for ExecutableCheck {
    fn default() -> Self {
        Self {
            can_start: true,
            errors: Vec::new(),
            warnings: Vec::new(),
            info: Vec::new(),
        }
    }
}

const RULE: &str = "============================================================";

/// Render a report the way operators read it on a terminal.
pub fn render_report(worker_count: usize, report: &ValidationReport) -> String {
    let mut out = Vec::new();
    out.push(RULE.to_string());
    out.push("WORKER CONFIGURATION VALIDATION REPORT".to_string());
    out.push(RULE.to_string());
    out.push(String::new());

    out.push("SUMMARY:".to_string());
    out.push(format!(
        "  Overall Status: {}",
        if report.valid { "VALID" } else { "INVALID" }
    ));
    out.push(format!("  Workers: {}", worker_count));
    out.push(format!("  Errors: {}", report.errors.len()));
    out.push(format!("  Warnings: {}", report.warnings.len()));
    out.push(format!("  Recommendations: {}", report.recommendations.len()));
    out.push(String::new());

    for (title, marker, items) in [
        ("ERRORS:", "x", &report.errors),
        ("WARNINGS:", "!", &report.warnings),
        ("RECOMMENDATIONS:", "*", &report.recommendations),
    ] {
        if items.is_empty() {
            continue;
        }
        out.push(title.to_string());
        for item in items {
            out.push(format!("  {} {}", marker, item));
        }
        out.push(String::new());
    }

    if !report.per_worker.is_empty() {
        out.push("WORKER DETAILS:".to_string());
        for (id, validation) in &report.per_worker {
            let status = if validation.valid { "VALID" } else { "INVALID" };
            out.push(format!("  {}: {}", id, status));
            for error in &validation.errors {
                out.push(format!("    x {}", error));
            }
            for warning in &validation.warnings {
                out.push(format!("    ! {}", warning));
            }
        }
        out.push(String::new());
    }

    out.push(RULE.to_string());
    out.join("\n")
}
