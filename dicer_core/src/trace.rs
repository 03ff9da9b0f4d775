//! Compiled execution paths and the solver that turns one of them into a value.
//!
//! A [`Trace`] is the ordered list of [`Condition`]s collected along one path
//! through an oracle, ending in a [`Verdict`]. Solving replays the conditions
//! into a fresh [`SymbolTable`], each one narrowing the domain of the variable
//! it mentions, and then samples the subject variable's final domain.

use crate::helpers::{HelperError, HelperRegistry};
use crate::item::Item;
use crate::parser::{Argument, Call, CmpOp, fmt_literal};
use crate::symbol::{DEFAULT_SAMPLE_RETRIES, Domain, GenerateError, ListScope, Quantifier, SymbolType};
use crate::value::{FieldPath, Value};
use log::trace;
use rand_core::RngCore;
use std::collections::BTreeMap;
use std::collections::btree_map::Entry;
use std::fmt;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SolveError {
    /// The narrowed domain is empty or sampling gave up. Retryable.
    #[error("Cannot generate '{var}': {source}")]
    CannotGenerate {
        var: String,
        #[source]
        source: GenerateError,
    },

    #[error(transparent)]
    Helper(#[from] HelperError),

    /// A helper returned a value the comparison cannot use.
    #[error("'{condition}' needs {expected}, got {found}")]
    Shape {
        condition: String,
        expected: &'static str,
        found: String,
    },

    #[error("Trace never mentions subject '{0}'")]
    MissingSubject(String),
}

impl SolveError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, SolveError::CannotGenerate { .. })
    }
}

/// Terminal outcome of a trace: the target should accept the input, or reject
/// it and print something matching the optional pattern.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Verdict {
    Pass,
    Fail(Option<String>),
}

impl Verdict {
    pub fn is_fail(&self) -> bool {
        matches!(self, Verdict::Fail(_))
    }

    pub fn pattern(&self) -> Option<&str> {
        match self {
            Verdict::Fail(Some(pattern)) => Some(pattern),
            _ => None,
        }
    }
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Verdict::Pass => f.write_str("success()"),
            Verdict::Fail(None) => f.write_str("fail()"),
            Verdict::Fail(Some(pattern)) => write!(f, "fail({pattern:?})"),
        }
    }
}

/// Right-hand side of a compiled comparison.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Rhs {
    Type(SymbolType),
    Value(Value),
    Call(Call),
}

impl fmt::Display for Rhs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Rhs::Type(kind) => write!(f, "{kind}"),
            Rhs::Value(value) => fmt_literal(value, f),
            Rhs::Call(call) => {
                write!(f, "{}(", call.name)?;
                for (idx, arg) in call.args.iter().enumerate() {
                    if idx > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{arg}")?;
                }
                f.write_str(")")
            }
        }
    }
}

/// Right-hand side after helper calls have been evaluated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolved {
    Type(SymbolType),
    Value(Value),
}

/// One comparison on a path. `quantifier` is set for `any(...)`/`all(...)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Condition {
    pub var: FieldPath,
    pub op: CmpOp,
    pub rhs: Rhs,
    pub quantifier: Option<Quantifier>,
}

impl Condition {
    /// The condition that holds exactly when this one does not.
    pub fn negated(&self) -> Self {
        Self {
            var: self.var.clone(),
            op: self.op.negated(),
            rhs: self.rhs.clone(),
            quantifier: self.quantifier.map(|q| match q {
                Quantifier::Any => Quantifier::All,
                Quantifier::All => Quantifier::Any,
            }),
        }
    }

    /// Evaluates the comparison for a concrete left-hand value.
    pub fn holds(&self, value: &Value, rhs: &Resolved) -> bool {
        match (self.quantifier, rhs) {
            (Some(quantifier), Resolved::Value(Value::List(items))) => {
                let scope = ListScope {
                    items: items.clone(),
                    member: self.op == CmpOp::In,
                    quantifier,
                };
                value.as_list().is_some_and(|elements| scope.holds(elements))
            }
            (Some(_), _) => false,
            (None, Resolved::Type(kind)) => match self.op {
                CmpOp::Is => kind.admits(value),
                CmpOp::IsNot => !kind.admits(value),
                _ => false,
            },
            (None, Resolved::Value(expected)) => match self.op {
                CmpOp::Eq => value == expected,
                CmpOp::NotEq => value != expected,
                CmpOp::Lt | CmpOp::LtE | CmpOp::Gt | CmpOp::GtE => {
                    match (value.as_int(), expected.as_int()) {
                        (Some(v), Some(e)) => match self.op {
                            CmpOp::Lt => v < e,
                            CmpOp::LtE => v <= e,
                            CmpOp::Gt => v > e,
                            _ => v >= e,
                        },
                        _ => false,
                    }
                }
                CmpOp::In => expected.as_list().is_some_and(|l| l.contains(value)),
                CmpOp::NotIn => expected.as_list().is_some_and(|l| !l.contains(value)),
                CmpOp::Is | CmpOp::IsNot => false,
            },
        }
    }

    fn shape_error(&self, expected: &'static str, found: &Resolved) -> SolveError {
        SolveError::Shape {
            condition: self.to_string(),
            expected,
            found: match found {
                Resolved::Type(kind) => format!("type {kind}"),
                Resolved::Value(value) => value.kind_name().to_string(),
            },
        }
    }
}

impl fmt::Display for Condition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.quantifier {
            None => write!(f, "{} {} {}", self.var, self.op, self.rhs),
            Some(Quantifier::Any) => write!(f, "any({} {} {})", self.var, self.op, self.rhs),
            Some(Quantifier::All) => write!(f, "all({} {} {})", self.var, self.op, self.rhs),
        }
    }
}

/// One path through an oracle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Trace {
    conditions: Vec<Condition>,
    verdict: Verdict,
}

impl Trace {
    pub fn new(conditions: Vec<Condition>, verdict: Verdict) -> Self {
        Self {
            conditions,
            verdict,
        }
    }

    pub fn conditions(&self) -> &[Condition] {
        &self.conditions
    }

    pub fn verdict(&self) -> &Verdict {
        &self.verdict
    }

    pub fn mentions(&self, var: &FieldPath) -> bool {
        self.conditions.iter().any(|c| &c.var == var)
    }

    /// Conditions on variables other than `subject`.
    pub fn guards<'a>(&'a self, subject: &'a FieldPath) -> impl Iterator<Item = &'a Condition> {
        self.conditions.iter().filter(move |c| &c.var != subject)
    }
}

impl fmt::Display for Trace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("(")?;
        for (idx, cond) in self.conditions.iter().enumerate() {
            if idx > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{cond}")?;
        }
        write!(f, ") -> {}", self.verdict)
    }
}

/// Per-solve map from variable to its current domain.
#[derive(Debug, Clone, Default)]
pub struct SymbolTable {
    domains: BTreeMap<FieldPath, Domain>,
}

impl SymbolTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, var: &FieldPath) -> Option<&Domain> {
        self.domains.get(var)
    }

    /// Applies one condition, creating the variable's domain on first mention.
    pub fn narrow(&mut self, cond: &Condition, rhs: &Resolved) -> Result<(), SolveError> {
        let cannot = |source| SolveError::CannotGenerate {
            var: cond.var.to_string(),
            source,
        };
        let domain = match self.domains.entry(cond.var.clone()) {
            Entry::Occupied(entry) => entry.into_mut(),
            Entry::Vacant(entry) => entry.insert(initial_domain(cond, rhs)?),
        };
        trace!("Narrowing '{}' with {cond}", cond.var);

        if let Some(quantifier) = cond.quantifier {
            let Resolved::Value(Value::List(items)) = rhs else {
                return Err(cond.shape_error("a list", rhs));
            };
            return domain
                .restrict_list(ListScope {
                    items: items.clone(),
                    member: cond.op == CmpOp::In,
                    quantifier,
                })
                .map_err(cannot);
        }

        let narrowed = match (cond.op, rhs) {
            (CmpOp::Is, Resolved::Type(kind)) => domain.assert_kind(*kind),
            (CmpOp::IsNot, Resolved::Type(kind)) => domain.exclude_kind(*kind),
            (CmpOp::Is | CmpOp::IsNot, other) => return Err(cond.shape_error("a type name", other)),
            (CmpOp::Eq, Resolved::Value(value)) => domain.restrict_to(std::slice::from_ref(value)),
            (CmpOp::NotEq, Resolved::Value(value)) => domain.exclude(std::slice::from_ref(value)),
            (CmpOp::Lt | CmpOp::LtE | CmpOp::Gt | CmpOp::GtE, Resolved::Value(Value::Int(n))) => {
                let n = *n;
                match cond.op {
                    CmpOp::Lt => match n.checked_sub(1) {
                        Some(max) => domain.bound_above(max),
                        None => Err(GenerateError::Contradiction(format!("no integer below {n}"))),
                    },
                    CmpOp::LtE => domain.bound_above(n),
                    CmpOp::Gt => match n.checked_add(1) {
                        Some(min) => domain.bound_below(min),
                        None => Err(GenerateError::Contradiction(format!("no integer above {n}"))),
                    },
                    _ => domain.bound_below(n),
                }
            }
            (CmpOp::Lt | CmpOp::LtE | CmpOp::Gt | CmpOp::GtE, other) => {
                return Err(cond.shape_error("an integer", other));
            }
            (CmpOp::In, Resolved::Value(Value::List(items))) => domain.restrict_to(items),
            (CmpOp::NotIn, Resolved::Value(Value::List(items))) => domain.exclude(items),
            (CmpOp::In | CmpOp::NotIn, other) => return Err(cond.shape_error("a list", other)),
            (CmpOp::Eq | CmpOp::NotEq, other) => return Err(cond.shape_error("a value", other)),
        };
        narrowed.map_err(cannot)
    }
}

/// Domain a variable starts from the first time a condition mentions it.
fn initial_domain(cond: &Condition, rhs: &Resolved) -> Result<Domain, SolveError> {
    if cond.quantifier.is_some() {
        return Ok(Domain::new(SymbolType::StringList));
    }
    let kind = match (cond.op, rhs) {
        (CmpOp::IsNot, Resolved::Type(kind)) => {
            return Domain::excluding(*kind).map_err(|source| SolveError::CannotGenerate {
                var: cond.var.to_string(),
                source,
            });
        }
        (_, Resolved::Type(kind)) => *kind,
        (CmpOp::Lt | CmpOp::LtE | CmpOp::Gt | CmpOp::GtE, _) => SymbolType::Integer,
        (CmpOp::In | CmpOp::NotIn, Resolved::Value(Value::List(items))) => {
            items.first().map_or(SymbolType::Bytes, SymbolType::of_value)
        }
        (_, Resolved::Value(value)) => SymbolType::of_value(value),
    };
    Ok(Domain::new(kind))
}

/// Replays traces against items. Holds the helper registry calls resolve against.
#[derive(Debug, Clone, Copy)]
pub struct Solver<'h> {
    helpers: &'h HelperRegistry,
    sample_retries: usize,
}

impl<'h> Solver<'h> {
    pub fn new(helpers: &'h HelperRegistry) -> Self {
        Self {
            helpers,
            sample_retries: DEFAULT_SAMPLE_RETRIES,
        }
    }

    pub fn with_sample_retries(mut self, retries: usize) -> Self {
        self.sample_retries = retries.max(1);
        self
    }

    pub fn helpers(&self) -> &'h HelperRegistry {
        self.helpers
    }

    /// Evaluates helper calls, reading field arguments from `item`.
    pub fn resolve(
        &self,
        rhs: &Rhs,
        item: &dyn Item,
        rng: &mut dyn RngCore,
    ) -> Result<Resolved, SolveError> {
        match rhs {
            Rhs::Type(kind) => Ok(Resolved::Type(*kind)),
            Rhs::Value(value) => Ok(Resolved::Value(value.clone())),
            Rhs::Call(call) => {
                let args: Vec<Option<Value>> = call
                    .args
                    .iter()
                    .map(|arg| match arg {
                        Argument::Field(path) => item.get(path),
                        Argument::Literal(value) => Some(value.clone()),
                    })
                    .collect();
                let value = self.helpers.call(&call.name, rng, &args)?;
                Ok(Resolved::Value(value))
            }
        }
    }

    /// True when every guard of `trace` holds for the fields `item` already carries.
    pub fn admits(
        &self,
        trace: &Trace,
        subject: &FieldPath,
        item: &dyn Item,
        rng: &mut dyn RngCore,
    ) -> Result<bool, SolveError> {
        for cond in trace.guards(subject) {
            let Some(current) = item.get(&cond.var) else {
                continue;
            };
            let rhs = self.resolve(&cond.rhs, item, rng)?;
            if !cond.holds(&current, &rhs) {
                trace!("Guard {cond} rejects current value {current:?}");
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Narrows every variable along `trace` and samples a value for `subject`.
    pub fn solve(
        &self,
        trace: &Trace,
        subject: &FieldPath,
        item: &dyn Item,
        rng: &mut dyn RngCore,
    ) -> Result<Value, SolveError> {
        let mut table = SymbolTable::new();
        for cond in trace.conditions() {
            let rhs = self.resolve(&cond.rhs, item, rng)?;
            table.narrow(cond, &rhs)?;
        }
        let domain = table
            .get(subject)
            .ok_or_else(|| SolveError::MissingSubject(subject.to_string()))?;
        domain
            .model_with_retries(rng, self.sample_retries)
            .map_err(|source| SolveError::CannotGenerate {
                var: subject.to_string(),
                source,
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::compile;
    use crate::item::FieldItem;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    fn path(raw: &str) -> FieldPath {
        raw.parse().unwrap()
    }

    fn traces(src: &str, helpers: &HelperRegistry) -> Vec<Trace> {
        compile(src, helpers).unwrap()
    }

    #[test]
    fn solved_values_satisfy_every_condition_of_their_trace() {
        let helpers = HelperRegistry::with_builtins();
        let solver = Solver::new(&helpers);
        let src = "\
if x Is Integer:
    if x Gt 10:
        assert x LtE 1000
        assert x NotEq 500
        return success()
    elif x In [-3, -2, 7]:
        return fail(\"small\")
    else:
        return fail()
elif x Is String:
    assert x NotIn [\"\", \"a\"]
    return success()
";
        let item = FieldItem::new();
        let mut rng = ChaCha8Rng::seed_from_u64(11);
        let x = path("x");
        for trace in traces(src, &helpers) {
            for _ in 0..50 {
                let value = match solver.solve(&trace, &x, &item, &mut rng) {
                    Ok(value) => value,
                    Err(e) => panic!("solving {trace} failed: {e}"),
                };
                for cond in trace.conditions() {
                    let rhs = solver.resolve(&cond.rhs, &item, &mut rng).unwrap();
                    assert!(cond.holds(&value, &rhs), "{value:?} violates {cond} in {trace}");
                }
            }
        }
    }

    #[test]
    fn narrowing_only_shrinks_the_admissible_set() {
        let helpers = HelperRegistry::new();
        let trace = &traces(
            "assert n Is Integer\nassert n GtE -20\nassert n Lt 30\nassert n NotIn [0, 1, 2]\nassert n Eq 5",
            &helpers,
        )[0];
        let probes: Vec<Value> = (-40..40).map(Value::Int).chain([Value::from("s")]).collect();
        let mut table = SymbolTable::new();
        let mut previous: Option<Vec<bool>> = None;
        for cond in trace.conditions() {
            let rhs = match &cond.rhs {
                Rhs::Type(kind) => Resolved::Type(*kind),
                Rhs::Value(value) => Resolved::Value(value.clone()),
                Rhs::Call(_) => unreachable!(),
            };
            table.narrow(cond, &rhs).unwrap();
            let domain = table.get(&path("n")).unwrap();
            let admitted: Vec<bool> = probes.iter().map(|p| domain.contains(p)).collect();
            if let Some(before) = &previous {
                for (idx, (now, was)) in admitted.iter().zip(before).enumerate() {
                    assert!(!now || *was, "{cond} widened the domain to admit {:?}", probes[idx]);
                }
            }
            previous = Some(admitted);
        }
        let admitted: Vec<&Value> = probes
            .iter()
            .filter(|p| table.get(&path("n")).unwrap().contains(p))
            .collect();
        assert_eq!(admitted, vec![&Value::Int(5)]);
    }

    #[test]
    fn contradictory_trace_is_retryable_cannot_generate() {
        let helpers = HelperRegistry::new();
        let solver = Solver::new(&helpers);
        let trace = &traces("assert x Gt 5\nassert x Lt 3", &helpers)[0];
        let mut rng = ChaCha8Rng::seed_from_u64(12);
        let err = solver
            .solve(trace, &path("x"), &FieldItem::new(), &mut rng)
            .unwrap_err();
        assert!(err.is_retryable(), "{err}");
    }

    #[test]
    fn eq_outside_existing_scope_is_an_error() {
        let helpers = HelperRegistry::new();
        let solver = Solver::new(&helpers);
        let trace = &traces("assert x In [1, 2]\nassert x Eq 3", &helpers)[0];
        let mut rng = ChaCha8Rng::seed_from_u64(13);
        assert!(matches!(
            solver.solve(trace, &path("x"), &FieldItem::new(), &mut rng),
            Err(SolveError::CannotGenerate { .. })
        ));
    }

    #[test]
    fn helper_calls_read_item_fields() {
        let mut helpers = HelperRegistry::new();
        helpers.register("fs.sizes", |_rng, args| match args.first() {
            Some(Some(Value::Str(kind))) if kind == "small" => {
                Ok(Value::List(vec![Value::Int(1), Value::Int(2)]))
            }
            _ => Ok(Value::List(vec![Value::Int(100)])),
        });
        let solver = Solver::new(&helpers);
        let trace = &traces("assert size In fs.sizes(kind)", &helpers)[0];
        let mut item = FieldItem::new();
        item.set(&path("kind"), Value::from("small")).unwrap();
        let mut rng = ChaCha8Rng::seed_from_u64(14);
        for _ in 0..20 {
            let value = solver.solve(trace, &path("size"), &item, &mut rng).unwrap();
            assert!(matches!(value, Value::Int(1 | 2)), "unexpected {value:?}");
        }
    }

    #[test]
    fn wrongly_shaped_helper_result_is_rejected() {
        let mut helpers = HelperRegistry::new();
        helpers.register("one", |_rng, _args| Ok(Value::Int(1)));
        let solver = Solver::new(&helpers);
        let trace = &traces("assert x In one()", &helpers)[0];
        let mut rng = ChaCha8Rng::seed_from_u64(15);
        let err = solver
            .solve(trace, &path("x"), &FieldItem::new(), &mut rng)
            .unwrap_err();
        assert!(matches!(err, SolveError::Shape { expected: "a list", .. }), "{err}");
        assert!(!err.is_retryable());
    }

    #[test]
    fn quantified_conditions_build_string_lists() {
        let helpers = HelperRegistry::new();
        let solver = Solver::new(&helpers);
        let trace = &traces(
            "assert all(tags In [\"a\", \"b\", \"c\"])\nassert any(tags In [\"b\"])",
            &helpers,
        )[0];
        let mut rng = ChaCha8Rng::seed_from_u64(16);
        for _ in 0..50 {
            let value = solver
                .solve(trace, &path("tags"), &FieldItem::new(), &mut rng)
                .unwrap();
            let elements = value.as_list().unwrap();
            assert!(elements.contains(&Value::from("b")), "{value:?} lacks b");
            assert!(elements.iter().all(|e| ["a", "b", "c"].iter().any(|s| e == &Value::from(*s))));
        }
    }

    #[test]
    fn guards_follow_fields_already_on_the_item() {
        let helpers = HelperRegistry::new();
        let solver = Solver::new(&helpers);
        let all = traces(
            "if mode Eq \"raw\": return fail(\"raw\")\nassert size Is Integer",
            &helpers,
        );
        let size = path("size");
        let mut rng = ChaCha8Rng::seed_from_u64(17);
        let mut item = FieldItem::new();
        item.set(&path("mode"), Value::from("cooked")).unwrap();
        let admitted: Vec<&Trace> = all
            .iter()
            .filter(|t| solver.admits(t, &size, &item, &mut rng).unwrap())
            .collect();
        assert_eq!(admitted.len(), 1);
        assert_eq!(admitted[0].verdict(), &Verdict::Pass);

        let empty = FieldItem::new();
        assert!(all.iter().all(|t| solver.admits(t, &size, &empty, &mut rng).unwrap()));
    }

    #[test]
    fn missing_subject_is_reported() {
        let helpers = HelperRegistry::new();
        let solver = Solver::new(&helpers);
        let trace = &traces("assert other Is Integer", &helpers)[0];
        let mut rng = ChaCha8Rng::seed_from_u64(18);
        assert_eq!(
            solver.solve(trace, &path("x"), &FieldItem::new(), &mut rng),
            Err(SolveError::MissingSubject("x".into()))
        );
    }
}
