use crate::symbol::{PRINTABLE, exponential};
use crate::value::Value;
use rand::Rng;
use rand::seq::IndexedRandom;
use rand_core::RngCore;
use std::collections::BTreeMap;
use std::fmt;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HelperError {
    #[error("Unknown helper '{0}'")]
    Unknown(String),

    #[error("Helper '{name}' takes at most {max} arguments, got {found}")]
    Arity {
        name: String,
        max: usize,
        found: usize,
    },

    #[error("Helper '{name}' argument {index} must be {expected}, got {found}")]
    Argument {
        name: String,
        index: usize,
        expected: &'static str,
        found: String,
    },

    #[error("Helper '{name}' failed: {reason}")]
    Failed { name: String, reason: String },
}

/// Signature of a helper callable from oracle text.
///
/// Arguments arrive positionally; `None` means the argument named an item
/// field that is not set, and helpers treat it like an omitted argument.
pub type HelperFn =
    dyn Fn(&mut dyn RngCore, &[Option<Value>]) -> Result<Value, HelperError> + Send + Sync;

/// Named functions that oracle comparisons may call on their right-hand side.
#[derive(Default)]
pub struct HelperRegistry {
    helpers: BTreeMap<String, Box<HelperFn>>,
}

impl fmt::Debug for HelperRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.helpers.keys()).finish()
    }
}

impl HelperRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry preloaded with the `rnd.*` namespace.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register("rnd.integer", rnd_integer);
        registry.register("rnd.int_exp", |rng, args| {
            rnd_int_exp("rnd.int_exp", rng, args, 0.01)
        });
        registry.register("rnd.count", |rng, args| {
            rnd_int_exp("rnd.count", rng, args, 0.1)
        });
        registry.register("rnd.text", rnd_text);
        registry
    }

    /// Adds or replaces the helper bound to `name`.
    pub fn register<F>(&mut self, name: impl Into<String>, helper: F)
    where
        F: Fn(&mut dyn RngCore, &[Option<Value>]) -> Result<Value, HelperError>
            + Send
            + Sync
            + 'static,
    {
        self.helpers.insert(name.into(), Box::new(helper));
    }

    pub fn contains(&self, name: &str) -> bool {
        self.helpers.contains_key(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.helpers.keys().map(String::as_str)
    }

    pub fn call(
        &self,
        name: &str,
        rng: &mut dyn RngCore,
        args: &[Option<Value>],
    ) -> Result<Value, HelperError> {
        let helper = self
            .helpers
            .get(name)
            .ok_or_else(|| HelperError::Unknown(name.to_string()))?;
        helper(rng, args)
    }
}

fn check_arity(name: &str, args: &[Option<Value>], max: usize) -> Result<(), HelperError> {
    if args.len() > max {
        return Err(HelperError::Arity {
            name: name.to_string(),
            max,
            found: args.len(),
        });
    }
    Ok(())
}

fn int_arg(
    name: &str,
    args: &[Option<Value>],
    index: usize,
    default: Option<i64>,
) -> Result<Option<i64>, HelperError> {
    match args.get(index).and_then(Option::as_ref) {
        None => Ok(default),
        Some(Value::Int(n)) => Ok(Some(*n)),
        Some(other) => Err(HelperError::Argument {
            name: name.to_string(),
            index,
            expected: "an integer",
            found: other.kind_name().to_string(),
        }),
    }
}

fn failed(name: &str, reason: String) -> HelperError {
    HelperError::Failed {
        name: name.to_string(),
        reason,
    }
}

/// `rnd.integer(min = 0, max = 10)`: uniform over the inclusive range.
fn rnd_integer(rng: &mut dyn RngCore, args: &[Option<Value>]) -> Result<Value, HelperError> {
    const NAME: &str = "rnd.integer";
    check_arity(NAME, args, 2)?;
    let min = int_arg(NAME, args, 0, Some(0))?.unwrap_or(0);
    let max = int_arg(NAME, args, 1, Some(10))?.unwrap_or(10);
    if min > max {
        return Err(failed(NAME, format!("empty range {min}..={max}")));
    }
    Ok(Value::Int(rng.random_range(min..=max)))
}

/// Exponentially biased integer: `min + floor(Exp(rate))`, wrapped into
/// `[min, max)` when a maximum is given. A negative minimum draws a random sign
/// and keeps the magnitude within `-min`.
fn rnd_int_exp(
    name: &str,
    rng: &mut dyn RngCore,
    args: &[Option<Value>],
    rate: f64,
) -> Result<Value, HelperError> {
    check_arity(name, args, 2)?;
    let min = int_arg(name, args, 0, Some(0))?.unwrap_or(0);
    let max = int_arg(name, args, 1, None)?;
    if max.is_some_and(|max| max < min) {
        return Err(failed(name, format!("maximum below minimum {min}")));
    }

    let mut shift = exponential(rng, rate).min(i64::MAX as f64) as i64;
    if let Some(max) = max {
        let span = max.saturating_sub(min);
        shift = if span == 0 { 0 } else { shift % span };
    }
    if min >= 0 {
        return Ok(Value::Int(min.saturating_add(shift)));
    }
    let negative = rng.random_bool(0.5);
    if negative && shift > min.saturating_neg() {
        shift %= min.saturating_neg();
    }
    Ok(Value::Int(if negative { -shift } else { shift }))
}

/// `rnd.text(min_len = 5, max_len = 10)`: printable text without line breaks or tabs.
fn rnd_text(rng: &mut dyn RngCore, args: &[Option<Value>]) -> Result<Value, HelperError> {
    const NAME: &str = "rnd.text";
    check_arity(NAME, args, 2)?;
    let min = int_arg(NAME, args, 0, Some(5))?.unwrap_or(5);
    let max = int_arg(NAME, args, 1, Some(10))?.unwrap_or(10);
    if min < 0 || min > max {
        return Err(failed(NAME, format!("invalid length range {min}..={max}")));
    }
    let len = rng.random_range(min..=max) as usize;
    let charset: Vec<char> = PRINTABLE
        .chars()
        .filter(|c| !"\n\t\r\x0b\x0c".contains(*c))
        .collect();
    let text: String = (0..len).filter_map(|_| charset.choose(rng).copied()).collect();
    Ok(Value::Str(text))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    fn ints(values: &[i64]) -> Vec<Option<Value>> {
        values.iter().map(|n| Some(Value::Int(*n))).collect()
    }

    #[test]
    fn builtins_are_registered_under_rnd_namespace() {
        let registry = HelperRegistry::with_builtins();
        let names: Vec<&str> = registry.names().collect();
        assert_eq!(
            names,
            vec!["rnd.count", "rnd.int_exp", "rnd.integer", "rnd.text"]
        );
    }

    #[test]
    fn unknown_helper_is_reported() {
        let registry = HelperRegistry::new();
        let mut rng = ChaCha8Rng::seed_from_u64(1);
        assert_eq!(
            registry.call("nope", &mut rng, &[]),
            Err(HelperError::Unknown("nope".into()))
        );
    }

    #[test]
    fn rnd_integer_stays_in_range() {
        let registry = HelperRegistry::with_builtins();
        let mut rng = ChaCha8Rng::seed_from_u64(2);
        for _ in 0..500 {
            let n = registry
                .call("rnd.integer", &mut rng, &ints(&[-3, 3]))
                .unwrap()
                .as_int()
                .unwrap();
            assert!((-3..=3).contains(&n), "value {n} escaped -3..=3");
        }
    }

    #[test]
    fn rnd_int_exp_respects_bounds_and_favors_small_values() {
        let registry = HelperRegistry::with_builtins();
        let mut rng = ChaCha8Rng::seed_from_u64(3);
        let mut small = 0;
        for _ in 0..1000 {
            let n = registry
                .call("rnd.count", &mut rng, &ints(&[2, 100]))
                .unwrap()
                .as_int()
                .unwrap();
            assert!((2..100).contains(&n), "count {n} escaped 2..100");
            if n < 20 {
                small += 1;
            }
        }
        assert!(small > 700, "only {small} of 1000 counts were below 20");
    }

    #[test]
    fn rnd_int_exp_with_negative_minimum_keeps_magnitude() {
        let registry = HelperRegistry::with_builtins();
        let mut rng = ChaCha8Rng::seed_from_u64(4);
        for _ in 0..500 {
            let n = registry
                .call("rnd.int_exp", &mut rng, &ints(&[-5]))
                .unwrap()
                .as_int()
                .unwrap();
            assert!(n >= -5, "value {n} below -5");
        }
    }

    #[test]
    fn rnd_text_length_and_charset() {
        let registry = HelperRegistry::with_builtins();
        let mut rng = ChaCha8Rng::seed_from_u64(5);
        for _ in 0..200 {
            let value = registry.call("rnd.text", &mut rng, &[]).unwrap();
            let Value::Str(text) = value else {
                panic!("rnd.text returned {value:?}");
            };
            assert!((5..=10).contains(&text.len()), "length {}", text.len());
            assert!(!text.contains(['\n', '\t', '\r']));
        }
    }

    #[test]
    fn missing_field_arguments_fall_back_to_defaults() {
        let registry = HelperRegistry::with_builtins();
        let mut rng = ChaCha8Rng::seed_from_u64(6);
        let n = registry
            .call("rnd.integer", &mut rng, &[None, Some(Value::Int(0))])
            .unwrap();
        assert_eq!(n, Value::Int(0));
    }

    #[test]
    fn wrongly_typed_argument_is_rejected() {
        let registry = HelperRegistry::with_builtins();
        let mut rng = ChaCha8Rng::seed_from_u64(7);
        let err = registry
            .call("rnd.integer", &mut rng, &[Some(Value::from("x"))])
            .unwrap_err();
        assert!(matches!(err, HelperError::Argument { index: 0, .. }), "{err}");
        assert!(registry.call("rnd.text", &mut rng, &ints(&[1, 2, 3])).is_err());
    }

    #[test]
    fn custom_helpers_can_return_lists() {
        let mut registry = HelperRegistry::new();
        registry.register("fs.formats", |_rng, _args| {
            Ok(Value::List(vec![Value::from("ext4"), Value::from("xfs")]))
        });
        let mut rng = ChaCha8Rng::seed_from_u64(8);
        assert!(registry.contains("fs.formats"));
        assert_eq!(
            registry.call("fs.formats", &mut rng, &[]).unwrap().as_list().map(<[Value]>::len),
            Some(2)
        );
    }
}
