use crate::compiler::{CompileError, compile};
use crate::helpers::HelperRegistry;
use crate::item::{Item, ItemError};
use crate::trace::{SolveError, Solver, Trace, Verdict};
use crate::value::FieldPath;
use log::debug;
use rand::Rng;
use rand::seq::IndexedRandom;
use rand_core::RngCore;
use thiserror::Error;

/// Share of `apply` calls that go for a `Fail` trace when both kinds exist.
pub const DEFAULT_FAIL_RATIO: f64 = 0.1;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConstraintError {
    #[error("Constraint '{name}' does not compile: {source}")]
    Compile {
        name: String,
        #[source]
        source: CompileError,
    },

    #[error("Constraint name '{0}' is not a field path and no path was given")]
    InvalidName(String),

    #[error("Constraint '{name}' has a trace that never mentions '{subject}': {trace}")]
    SubjectNotMentioned {
        name: String,
        subject: String,
        trace: String,
    },

    #[error("Constraint '{name}' fail ratio {ratio} is outside 0..=1")]
    InvalidFailRatio { name: String, ratio: f64 },

    #[error("Constraint '{name}' could not solve '{trace}': {source}")]
    Solve {
        name: String,
        trace: String,
        #[source]
        source: SolveError,
    },

    #[error("Constraint '{name}' found no trace admitting the current item")]
    NoAdmissibleTrace { name: String },

    #[error("Constraint '{name}' could not write its value: {source}")]
    Item {
        name: String,
        #[source]
        source: ItemError,
    },
}

impl ConstraintError {
    /// Whether generating a fresh item may succeed where this one failed.
    pub fn is_retryable(&self) -> bool {
        match self {
            ConstraintError::Solve { source, .. } => source.is_retryable(),
            ConstraintError::NoAdmissibleTrace { .. } => true,
            _ => false,
        }
    }
}

/// One compiled oracle bound to the item field it writes.
#[derive(Debug, Clone)]
pub struct Constraint {
    name: String,
    subject: FieldPath,
    traces: Vec<Trace>,
    fail_ratio: f64,
}

impl Constraint {
    /// Compiles `oracle`. The written field is `path`, or the field named like the constraint.
    pub fn new(
        name: impl Into<String>,
        path: Option<FieldPath>,
        oracle: &str,
        helpers: &HelperRegistry,
    ) -> Result<Self, ConstraintError> {
        let name = name.into();
        let subject = match path {
            Some(path) => path,
            None => name
                .parse()
                .map_err(|_| ConstraintError::InvalidName(name.clone()))?,
        };
        let traces = compile(oracle, helpers).map_err(|source| ConstraintError::Compile {
            name: name.clone(),
            source,
        })?;
        if let Some(orphan) = traces.iter().find(|t| !t.mentions(&subject)) {
            return Err(ConstraintError::SubjectNotMentioned {
                name,
                subject: subject.to_string(),
                trace: orphan.to_string(),
            });
        }
        debug!(
            "Constraint '{name}' writes '{subject}' through {} traces",
            traces.len()
        );
        Ok(Self {
            name,
            subject,
            traces,
            fail_ratio: DEFAULT_FAIL_RATIO,
        })
    }

    pub fn with_fail_ratio(mut self, ratio: f64) -> Result<Self, ConstraintError> {
        if !(0.0..=1.0).contains(&ratio) {
            return Err(ConstraintError::InvalidFailRatio {
                name: self.name,
                ratio,
            });
        }
        self.fail_ratio = ratio;
        Ok(self)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn subject(&self) -> &FieldPath {
        &self.subject
    }

    pub fn traces(&self) -> &[Trace] {
        &self.traces
    }

    pub fn fail_ratio(&self) -> f64 {
        self.fail_ratio
    }

    /// Picks a trace, solves it and writes the value onto `item`.
    ///
    /// A `Fail` trace is chosen with probability `fail_ratio`. When the
    /// preferred bucket has no trace admitted by the item's current fields,
    /// the other bucket is used.
    pub fn apply(
        &self,
        item: &mut dyn Item,
        solver: &Solver<'_>,
        rng: &mut dyn RngCore,
    ) -> Result<Verdict, ConstraintError> {
        let mut passing: Vec<&Trace> = Vec::new();
        let mut failing: Vec<&Trace> = Vec::new();
        for trace in &self.traces {
            let admitted = solver
                .admits(trace, &self.subject, &*item, rng)
                .map_err(|source| self.solve_error(trace, source))?;
            if !admitted {
                continue;
            }
            if trace.verdict().is_fail() {
                failing.push(trace);
            } else {
                passing.push(trace);
            }
        }

        let want_fail = rng.random_bool(self.fail_ratio);
        let bucket = match (want_fail, passing.is_empty(), failing.is_empty()) {
            (_, true, true) => {
                return Err(ConstraintError::NoAdmissibleTrace {
                    name: self.name.clone(),
                });
            }
            (true, _, false) | (false, true, _) => &failing,
            _ => &passing,
        };
        let trace = *bucket
            .choose(rng)
            .ok_or_else(|| ConstraintError::NoAdmissibleTrace {
                name: self.name.clone(),
            })?;

        let value = solver
            .solve(trace, &self.subject, &*item, rng)
            .map_err(|source| self.solve_error(trace, source))?;
        debug!("Constraint '{}' chose {trace}, value {value:?}", self.name);
        item.set(&self.subject, value)
            .map_err(|source| ConstraintError::Item {
                name: self.name.clone(),
                source,
            })?;
        if let Some(pattern) = trace.verdict().pattern() {
            item.add_fail_patt(pattern.to_string());
        }
        Ok(trace.verdict().clone())
    }

    fn solve_error(&self, trace: &Trace, source: SolveError) -> ConstraintError {
        ConstraintError::Solve {
            name: self.name.clone(),
            trace: trace.to_string(),
            source,
        }
    }
}
