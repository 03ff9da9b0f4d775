use crate::compiler::CompileError;
use crate::constraint::{Constraint, ConstraintError};
use crate::item::Item;
use crate::parser::{CmpOp, Operand, parse_comparison};
use crate::trace::Solver;
use crate::value::{FieldPath, Value};
use log::{debug, trace};
use rand_core::RngCore;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use thiserror::Error;

/// Siblings are matched by field path, so `/a/b` and `a.b` name the same constraint.
fn sibling_key(name: &str) -> String {
    name.parse::<FieldPath>()
        .map(|path| path.to_string())
        .unwrap_or_else(|_| name.to_string())
}

/// Default cap on scheduling sweeps per `constrain` call.
pub const DEFAULT_MAX_SWEEPS: usize = 64;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ManagerError {
    #[error("Constraint '{name}' has an invalid precondition: {source}")]
    Precondition {
        name: String,
        #[source]
        source: CompileError,
    },

    #[error("Constraint '{name}' requires unknown constraint '{sibling}'")]
    UnknownSibling { name: String, sibling: String },

    #[error("Constraint '{0}' is defined more than once")]
    Duplicate(String),

    #[error("Constraint '{name}' writes '{path}', which the item does not accept")]
    UnacceptedPath { name: String, path: String },

    #[error(transparent)]
    Constraint(#[from] ConstraintError),

    /// A sweep applied or skipped nothing while constraints were still waiting.
    #[error("Scheduling made no progress; still waiting: {}", waiting.join(", "))]
    NoProgress { waiting: Vec<String> },

    #[error("Scheduling did not settle within {sweeps} sweeps")]
    SweepLimit { sweeps: usize },
}

impl ManagerError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, ManagerError::Constraint(e) if e.is_retryable())
    }
}

/// Per-cycle state of one constraint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Status {
    Untouched,
    Skipped,
    Pass,
    Fail,
}

impl Status {
    /// Status named in a precondition. Case-insensitive.
    pub fn from_word(word: &str) -> Option<Self> {
        match word.to_ascii_lowercase().as_str() {
            "passed" | "pass" | "success" => Some(Status::Pass),
            "failed" | "fail" | "failure" => Some(Status::Fail),
            "skipped" | "skip" => Some(Status::Skipped),
            _ => None,
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Status::Untouched => "untouched",
            Status::Skipped => "skipped",
            Status::Pass => "passed",
            Status::Fail => "failed",
        })
    }
}

/// `require` clause: `<sibling> is <status>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Precondition {
    sibling: String,
    expected: Status,
}

impl Precondition {
    pub fn parse(src: &str) -> Result<Self, CompileError> {
        let cmp = parse_comparison(src)?;
        let unsupported = |reason: &str| CompileError::Unsupported {
            comparison: cmp.to_string(),
            reason: reason.to_string(),
        };
        if cmp.op != CmpOp::Is {
            return Err(unsupported("preconditions only support 'is'"));
        }
        let word = match &cmp.right {
            Operand::Name(word) => word.as_str(),
            Operand::Literal(Value::Str(word)) => word.as_str(),
            _ => return Err(unsupported("expected a status word")),
        };
        let expected = Status::from_word(word).ok_or_else(|| CompileError::UnresolvedReference {
            name: word.to_string(),
            comparison: cmp.to_string(),
        })?;
        Ok(Self {
            sibling: cmp.left.to_string(),
            expected,
        })
    }

    pub fn sibling(&self) -> &str {
        &self.sibling
    }

    pub fn expected(&self) -> Status {
        self.expected
    }
}

#[derive(Debug, Clone)]
struct Entry {
    constraint: Constraint,
    require: Option<(Precondition, usize)>,
}

/// Final status of every constraint after one `constrain` call, keyed by name.
pub type Statuses = BTreeMap<String, Status>;

/// The full constraint set of one target, applied in dependency order.
#[derive(Debug, Clone)]
pub struct ConstraintManager {
    entries: Vec<Entry>,
    max_sweeps: usize,
}

impl ConstraintManager {
    /// Checks names and preconditions. Sibling references may point forward.
    pub fn new(
        constraints: Vec<(Constraint, Option<Precondition>)>,
    ) -> Result<Self, ManagerError> {
        let mut index: HashMap<String, usize> = HashMap::new();
        for (idx, (constraint, _)) in constraints.iter().enumerate() {
            if index.insert(sibling_key(constraint.name()), idx).is_some() {
                return Err(ManagerError::Duplicate(constraint.name().to_string()));
            }
        }
        let entries = constraints
            .into_iter()
            .map(|(constraint, require)| {
                let require = match require {
                    None => None,
                    Some(pre) => {
                        let target = *index.get(&sibling_key(pre.sibling())).ok_or_else(|| {
                            ManagerError::UnknownSibling {
                                name: constraint.name().to_string(),
                                sibling: pre.sibling().to_string(),
                            }
                        })?;
                        Some((pre, target))
                    }
                };
                Ok::<_, ManagerError>(Entry {
                    constraint,
                    require,
                })
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            entries,
            max_sweeps: DEFAULT_MAX_SWEEPS,
        })
    }

    pub fn with_max_sweeps(mut self, sweeps: usize) -> Self {
        self.max_sweeps = sweeps.max(1);
        self
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn constraints(&self) -> impl Iterator<Item = &Constraint> {
        self.entries.iter().map(|e| &e.constraint)
    }

    /// Fails when some constraint writes a field `item` can never hold.
    pub fn check_paths(&self, item: &dyn Item) -> Result<(), ManagerError> {
        for constraint in self.constraints() {
            if !item.accepts(constraint.subject()) {
                return Err(ManagerError::UnacceptedPath {
                    name: constraint.name().to_string(),
                    path: constraint.subject().to_string(),
                });
            }
        }
        Ok(())
    }

    /// Applies every constraint to `item` once, respecting preconditions.
    ///
    /// A constraint waits while its sibling is untouched, is applied once the
    /// sibling reached the required status and is skipped otherwise.
    pub fn constrain(
        &self,
        item: &mut dyn Item,
        solver: &Solver<'_>,
        rng: &mut dyn RngCore,
    ) -> Result<Statuses, ManagerError> {
        let mut status = vec![Status::Untouched; self.entries.len()];
        for sweep in 1..=self.max_sweeps {
            let mut progressed = false;
            for (idx, entry) in self.entries.iter().enumerate() {
                if status[idx] != Status::Untouched {
                    continue;
                }
                let name = entry.constraint.name();
                if let Some((pre, sibling)) = &entry.require {
                    let current = status[*sibling];
                    if current == Status::Untouched {
                        trace!("Constraint '{name}' waits for '{}'", pre.sibling());
                        continue;
                    }
                    if current != pre.expected() {
                        debug!(
                            "Skipping '{name}': '{}' is {current}, needs {}",
                            pre.sibling(),
                            pre.expected()
                        );
                        status[idx] = Status::Skipped;
                        progressed = true;
                        continue;
                    }
                }
                let verdict = entry.constraint.apply(item, solver, rng)?;
                status[idx] = if verdict.is_fail() {
                    Status::Fail
                } else {
                    Status::Pass
                };
                progressed = true;
            }

            let waiting: Vec<String> = self
                .entries
                .iter()
                .zip(&status)
                .filter(|(_, s)| **s == Status::Untouched)
                .map(|(e, _)| e.constraint.name().to_string())
                .collect();
            if waiting.is_empty() {
                trace!("Constraints settled after {sweep} sweeps");
                return Ok(self
                    .entries
                    .iter()
                    .zip(status)
                    .map(|(e, s)| (e.constraint.name().to_string(), s))
                    .collect());
            }
            if !progressed {
                return Err(ManagerError::NoProgress { waiting });
            }
        }
        Err(ManagerError::SweepLimit {
            sweeps: self.max_sweeps,
        })
    }
}
