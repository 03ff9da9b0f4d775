use crate::helpers::HelperRegistry;
use crate::parser::{CmpOp, Comparison, Operand, ParseError, Stmt, Test, parse_oracle};
use crate::symbol::{Quantifier, SymbolType};
use crate::trace::{Condition, Rhs, Trace, Verdict};
use crate::value::Value;
use log::debug;
use thiserror::Error;

/// Upper bound on traces per oracle; branch expansion is exponential in nesting depth.
pub const MAX_TRACES: usize = 4096;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CompileError {
    #[error("Parse error at {0}")]
    Parse(#[from] ParseError),

    #[error("Unsupported comparison '{comparison}': {reason}")]
    Unsupported { comparison: String, reason: String },

    #[error("Unresolved reference '{name}' in '{comparison}'")]
    UnresolvedReference { name: String, comparison: String },

    #[error("Oracle expands to more than {} traces", MAX_TRACES)]
    TooManyTraces,
}

/// Parses `src` and expands it into every path it can take.
///
/// Statements after an `if` run on both of its branches, and a path that falls
/// off the end without `return` ends in `success()`.
pub fn compile(src: &str, helpers: &HelperRegistry) -> Result<Vec<Trace>, CompileError> {
    let stmts = parse_oracle(src)?;
    let mut expander = Expander {
        helpers,
        traces: Vec::new(),
    };
    let mut path = Vec::new();
    let mut pending = Vec::new();
    expander.expand(&stmts, &mut pending, &mut path)?;
    debug!("Compiled oracle into {} traces", expander.traces.len());
    Ok(expander.traces)
}

struct Expander<'h> {
    helpers: &'h HelperRegistry,
    traces: Vec<Trace>,
}

impl Expander<'_> {
    fn emit(&mut self, path: &[Condition], verdict: Verdict) -> Result<(), CompileError> {
        if self.traces.len() >= MAX_TRACES {
            return Err(CompileError::TooManyTraces);
        }
        self.traces.push(Trace::new(path.to_vec(), verdict));
        Ok(())
    }

    /// `pending` holds the statements that follow each enclosing `if`.
    fn expand<'s>(
        &mut self,
        current: &'s [Stmt],
        pending: &mut Vec<&'s [Stmt]>,
        path: &mut Vec<Condition>,
    ) -> Result<(), CompileError> {
        let Some((stmt, rest)) = current.split_first() else {
            return match pending.pop() {
                Some(next) => {
                    let result = self.expand(next, pending, path);
                    pending.push(next);
                    result
                }
                None => self.emit(path, Verdict::Pass),
            };
        };

        match stmt {
            Stmt::Return(verdict) => self.emit(path, verdict.clone()),
            Stmt::Assert(test) => {
                path.push(self.condition(test)?);
                let result = self.expand(rest, pending, path);
                path.pop();
                result
            }
            Stmt::If { test, body, orelse } => {
                let taken = self.condition(test)?;
                let skipped = taken.negated();
                pending.push(rest);
                for (cond, branch) in [(taken, body), (skipped, orelse)] {
                    path.push(cond);
                    let result = self.expand(branch, pending, path);
                    path.pop();
                    result?;
                }
                pending.pop();
                Ok(())
            }
        }
    }

    fn condition(&self, test: &Test) -> Result<Condition, CompileError> {
        let quantifier = match test {
            Test::Compare(_) => None,
            Test::Any(_) => Some(Quantifier::Any),
            Test::All(_) => Some(Quantifier::All),
        };
        let cmp = test.comparison();
        let unsupported = |reason: &str| CompileError::Unsupported {
            comparison: test.to_string(),
            reason: reason.to_string(),
        };

        if quantifier.is_some() && !matches!(cmp.op, CmpOp::In | CmpOp::NotIn) {
            return Err(unsupported("any()/all() only wrap In or NotIn"));
        }

        let rhs = self.rhs(cmp, test)?;
        match (&rhs, cmp.op) {
            (Rhs::Type(_), CmpOp::Is | CmpOp::IsNot) => {}
            (_, CmpOp::Is | CmpOp::IsNot) => {
                return Err(unsupported("Is and IsNot compare against a type name"));
            }
            (Rhs::Type(_), _) => {
                return Err(unsupported("a type name only follows Is or IsNot"));
            }
            (Rhs::Value(Value::Int(_)), CmpOp::Lt | CmpOp::LtE | CmpOp::Gt | CmpOp::GtE) => {}
            (Rhs::Value(_), CmpOp::Lt | CmpOp::LtE | CmpOp::Gt | CmpOp::GtE) => {
                return Err(unsupported("ordering needs an integer"));
            }
            (Rhs::Value(Value::List(_)), CmpOp::In | CmpOp::NotIn) => {}
            (Rhs::Value(_), CmpOp::In | CmpOp::NotIn) => {
                return Err(unsupported("membership needs a list"));
            }
            _ => {}
        }

        Ok(Condition {
            var: cmp.left.clone(),
            op: cmp.op,
            rhs,
            quantifier,
        })
    }

    fn rhs(&self, cmp: &Comparison, test: &Test) -> Result<Rhs, CompileError> {
        match &cmp.right {
            Operand::Literal(value) => Ok(Rhs::Value(value.clone())),
            Operand::Name(name) => SymbolType::from_name(name).map(Rhs::Type).ok_or_else(|| {
                CompileError::UnresolvedReference {
                    name: name.clone(),
                    comparison: test.to_string(),
                }
            }),
            Operand::Call(call) => {
                if !self.helpers.contains(&call.name) {
                    return Err(CompileError::UnresolvedReference {
                        name: call.name.clone(),
                        comparison: test.to_string(),
                    });
                }
                Ok(Rhs::Call(call.clone()))
            }
        }
    }
}
