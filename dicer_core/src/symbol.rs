use crate::value::Value;
use log::trace;
use rand::Rng;
use rand::seq::IndexedRandom;
use rand_core::RngCore;
use std::fmt;
use thiserror::Error;

/// Rate of the exponential law used for generated lengths (mean length 10).
const LENGTH_RATE: f64 = 0.1;
/// Scale of the exponent used for integer magnitudes, `2^Exp(1/scale) - 1`.
const INTEGER_SCALE: f64 = 50.0;
/// Hard cap on generated lengths so a far tail draw cannot allocate megabytes.
const MAX_GENERATED_LEN: usize = 4096;
/// Default cap on rejection-sampling attempts inside one `model` call.
pub const DEFAULT_SAMPLE_RETRIES: usize = 1000;

/// Characters a `String` domain draws from: ASCII digits, letters, punctuation and whitespace.
pub const PRINTABLE: &str = "0123456789abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ\
!\"#$%&'()*+,-./:;<=>?@[\\]^_`{|}~ \t\n\r\x0b\x0c";

/// Raised when a domain cannot produce a value. Callers may retry the whole item.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GenerateError {
    #[error("Contradictory domain: {0}")]
    Contradiction(String),
    #[error("No admissible value left in the {kind} scope")]
    EmptyScope { kind: SymbolType },
    #[error("Gave up generating a {kind} value after {attempts} attempts")]
    RetriesExhausted { kind: SymbolType, attempts: usize },
}

/// The value families an oracle can name on the right of `Is`/`IsNot`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SymbolType {
    Bytes,
    NonEmptyBytes,
    String,
    StringList,
    Integer,
}

impl SymbolType {
    pub const ALL: [SymbolType; 5] = [
        SymbolType::Bytes,
        SymbolType::NonEmptyBytes,
        SymbolType::String,
        SymbolType::StringList,
        SymbolType::Integer,
    ];

    /// Static name registry. Both the short and the descriptive spellings resolve.
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "Bytes" | "ByteString" => Some(SymbolType::Bytes),
            "NonEmptyBytes" | "NonEmptyByteString" => Some(SymbolType::NonEmptyBytes),
            "String" | "PrintableString" => Some(SymbolType::String),
            "StringList" | "StringSet" => Some(SymbolType::StringList),
            "Integer" => Some(SymbolType::Integer),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            SymbolType::Bytes => "Bytes",
            SymbolType::NonEmptyBytes => "NonEmptyBytes",
            SymbolType::String => "String",
            SymbolType::StringList => "StringList",
            SymbolType::Integer => "Integer",
        }
    }

    /// True when every value of `self` is also a value of `other`.
    pub fn refines(self, other: SymbolType) -> bool {
        self == other
            || matches!(
                (self, other),
                (SymbolType::NonEmptyBytes, SymbolType::Bytes)
                    | (SymbolType::String, SymbolType::Bytes)
            )
    }

    pub fn admits(self, value: &Value) -> bool {
        match self {
            SymbolType::Integer => matches!(value, Value::Int(_)),
            SymbolType::Bytes => value.as_bytes().is_some(),
            SymbolType::NonEmptyBytes => value.as_bytes().is_some_and(|b| !b.is_empty()),
            SymbolType::String => value.as_bytes().is_some_and(is_printable),
            SymbolType::StringList => value
                .as_list()
                .is_some_and(|items| items.iter().all(|v| SymbolType::String.admits(v))),
        }
    }

    /// Domain family a literal or helper result implies on first mention.
    pub fn of_value(value: &Value) -> SymbolType {
        match value {
            Value::Int(_) => SymbolType::Integer,
            Value::Str(_) | Value::Bytes(_) => SymbolType::Bytes,
            Value::List(_) => SymbolType::StringList,
        }
    }
}

impl fmt::Display for SymbolType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

fn is_printable(bytes: &[u8]) -> bool {
    bytes.iter().all(|b| PRINTABLE.as_bytes().contains(b))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Quantifier {
    Any,
    All,
}

/// Membership restriction on the elements of a list value, from `any(...)`/`all(...)` tests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListScope {
    pub items: Vec<Value>,
    pub member: bool,
    pub quantifier: Quantifier,
}

impl ListScope {
    pub fn holds(&self, elements: &[Value]) -> bool {
        let inside = |v: &Value| self.items.contains(v) == self.member;
        match self.quantifier {
            Quantifier::All => elements.iter().all(inside),
            Quantifier::Any => elements.iter().any(inside),
        }
    }
}

/// Admissible value space of one variable during a solve.
///
/// Every mutating method narrows: scopes intersect, exclusions accumulate and
/// bounds only tighten. A narrowing that leaves nothing admissible fails with
/// [`GenerateError::Contradiction`] right away.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Domain {
    kind: SymbolType,
    scope: Option<Vec<Value>>,
    excludes: Vec<Value>,
    excluded_kinds: Vec<SymbolType>,
    minimum: Option<i64>,
    maximum: Option<i64>,
    list_scopes: Vec<ListScope>,
}

impl Domain {
    pub fn new(kind: SymbolType) -> Self {
        Self {
            kind,
            scope: None,
            excludes: Vec::new(),
            excluded_kinds: Vec::new(),
            minimum: None,
            maximum: None,
            list_scopes: Vec::new(),
        }
    }

    /// Starting domain for a variable first seen in `x IsNot kind`.
    pub fn excluding(kind: SymbolType) -> Result<Self, GenerateError> {
        let base = if SymbolType::Bytes.refines(kind) {
            SymbolType::Integer
        } else {
            SymbolType::Bytes
        };
        let mut domain = Domain::new(base);
        domain.exclude_kind(kind)?;
        Ok(domain)
    }

    pub fn kind(&self) -> SymbolType {
        self.kind
    }

    pub fn scope(&self) -> Option<&[Value]> {
        self.scope.as_deref()
    }

    pub fn excludes(&self) -> &[Value] {
        &self.excludes
    }

    pub fn excluded_kinds(&self) -> &[SymbolType] {
        &self.excluded_kinds
    }

    pub fn minimum(&self) -> Option<i64> {
        self.minimum
    }

    pub fn maximum(&self) -> Option<i64> {
        self.maximum
    }

    pub fn list_scopes(&self) -> &[ListScope] {
        &self.list_scopes
    }

    pub fn assert_kind(&mut self, kind: SymbolType) -> Result<(), GenerateError> {
        if let Some(excluded) = self.excluded_kinds.iter().find(|ex| kind.refines(**ex)) {
            return Err(GenerateError::Contradiction(format!(
                "{kind} was already excluded by 'IsNot {excluded}'"
            )));
        }
        if self.kind.refines(kind) {
            return Ok(());
        }
        if !kind.refines(self.kind) {
            return Err(GenerateError::Contradiction(format!(
                "value is {} and cannot also be {kind}",
                self.kind
            )));
        }
        self.kind = kind;
        if let Some(scope) = self.scope.as_mut() {
            scope.retain(|v| kind.admits(v));
            if scope.is_empty() {
                return Err(GenerateError::EmptyScope { kind });
            }
        }
        Ok(())
    }

    pub fn exclude_kind(&mut self, kind: SymbolType) -> Result<(), GenerateError> {
        if self.kind.refines(kind) {
            return Err(GenerateError::Contradiction(format!(
                "value is {} and cannot avoid being {kind}",
                self.kind
            )));
        }
        if !self.excluded_kinds.contains(&kind) {
            self.excluded_kinds.push(kind);
        }
        Ok(())
    }

    /// Intersects the scope with `values`. `Eq` passes a singleton, `In` a whole list.
    pub fn restrict_to(&mut self, values: &[Value]) -> Result<(), GenerateError> {
        let kind = self.kind;
        let narrowed: Vec<Value> = values
            .iter()
            .filter(|v| kind.admits(v) && !self.excludes.contains(v) && self.within_bounds(v))
            .filter(|v| self.scope.as_ref().is_none_or(|s| s.contains(v)))
            .cloned()
            .collect();
        if narrowed.is_empty() {
            let shown: Vec<String> = values.iter().map(ToString::to_string).collect();
            return Err(GenerateError::Contradiction(format!(
                "no {kind} value among [{}] is still admissible",
                shown.join(", ")
            )));
        }
        self.scope = Some(narrowed);
        Ok(())
    }

    pub fn exclude(&mut self, values: &[Value]) -> Result<(), GenerateError> {
        for value in values {
            if !self.excludes.contains(value) {
                self.excludes.push(value.clone());
            }
        }
        if let Some(scope) = self.scope.as_ref() {
            if scope.iter().all(|v| self.excludes.contains(v)) {
                return Err(GenerateError::EmptyScope { kind: self.kind });
            }
        }
        Ok(())
    }

    pub fn bound_below(&mut self, minimum: i64) -> Result<(), GenerateError> {
        self.require_integer("a lower bound")?;
        self.minimum = Some(self.minimum.map_or(minimum, |m| m.max(minimum)));
        self.check_bounds()
    }

    pub fn bound_above(&mut self, maximum: i64) -> Result<(), GenerateError> {
        self.require_integer("an upper bound")?;
        self.maximum = Some(self.maximum.map_or(maximum, |m| m.min(maximum)));
        self.check_bounds()
    }

    pub fn restrict_list(&mut self, restriction: ListScope) -> Result<(), GenerateError> {
        if self.kind != SymbolType::StringList {
            return Err(GenerateError::Contradiction(format!(
                "any()/all() need a list value, found {}",
                self.kind
            )));
        }
        self.list_scopes.push(restriction);
        Ok(())
    }

    fn require_integer(&self, what: &str) -> Result<(), GenerateError> {
        if self.kind == SymbolType::Integer {
            Ok(())
        } else {
            Err(GenerateError::Contradiction(format!(
                "{} value cannot take {what}",
                self.kind
            )))
        }
    }

    fn check_bounds(&self) -> Result<(), GenerateError> {
        if let (Some(min), Some(max)) = (self.minimum, self.maximum) {
            if min > max {
                return Err(GenerateError::Contradiction(format!(
                    "empty integer range {min}..={max}"
                )));
            }
        }
        if let Some(scope) = self.scope.as_ref() {
            if !scope.iter().any(|v| self.within_bounds(v)) {
                return Err(GenerateError::EmptyScope { kind: self.kind });
            }
        }
        Ok(())
    }

    fn within_bounds(&self, value: &Value) -> bool {
        match value.as_int() {
            Some(n) => {
                self.minimum.is_none_or(|min| n >= min) && self.maximum.is_none_or(|max| n <= max)
            }
            None => self.minimum.is_none() && self.maximum.is_none(),
        }
    }

    /// True when `value` satisfies every narrowing applied to this domain.
    pub fn contains(&self, value: &Value) -> bool {
        if !self.kind.admits(value) {
            return false;
        }
        if self.excluded_kinds.iter().any(|k| k.admits(value)) {
            return false;
        }
        if self.excludes.contains(value) {
            return false;
        }
        if let Some(scope) = self.scope.as_ref() {
            if !scope.contains(value) {
                return false;
            }
        }
        if !self.within_bounds(value) {
            return false;
        }
        match value.as_list() {
            Some(elements) => self.list_scopes.iter().all(|s| s.holds(elements)),
            None => true,
        }
    }

    /// Draws from the type's natural distribution, ignoring scope and exclusions.
    pub fn generate(&self, rng: &mut dyn RngCore) -> Result<Value, GenerateError> {
        self.generate_with_retries(rng, DEFAULT_SAMPLE_RETRIES)
    }

    pub fn generate_with_retries(
        &self,
        rng: &mut dyn RngCore,
        retries: usize,
    ) -> Result<Value, GenerateError> {
        match self.kind {
            SymbolType::Bytes => {
                let len = exp_len(rng);
                Ok(Value::Bytes(random_bytes(rng, len)))
            }
            SymbolType::NonEmptyBytes => {
                let len = exp_len(rng) + 1;
                Ok(Value::Bytes(random_bytes(rng, len)))
            }
            SymbolType::String => {
                let len = exp_len(rng);
                Ok(Value::Str(printable_string(rng, len)))
            }
            SymbolType::Integer => self.generate_integer(rng, retries).map(Value::Int),
            SymbolType::StringList => self.generate_list(rng),
        }
    }

    /// Samples a value that satisfies the whole domain.
    pub fn model(&self, rng: &mut dyn RngCore) -> Result<Value, GenerateError> {
        self.model_with_retries(rng, DEFAULT_SAMPLE_RETRIES)
    }

    pub fn model_with_retries(
        &self,
        rng: &mut dyn RngCore,
        retries: usize,
    ) -> Result<Value, GenerateError> {
        if let Some(scope) = self.scope.as_ref() {
            let candidates: Vec<&Value> = scope.iter().filter(|v| self.contains(v)).collect();
            return candidates
                .choose(rng)
                .map(|v| (*v).clone())
                .ok_or(GenerateError::EmptyScope { kind: self.kind });
        }
        for attempt in 0..retries {
            let value = self.generate_with_retries(rng, retries)?;
            if self.contains(&value) {
                return Ok(value);
            }
            trace!("Rejected {} candidate #{attempt}: {value:?}", self.kind);
        }
        Err(GenerateError::RetriesExhausted {
            kind: self.kind,
            attempts: retries,
        })
    }

    fn generate_integer(&self, rng: &mut dyn RngCore, retries: usize) -> Result<i64, GenerateError> {
        for _ in 0..retries {
            let sign = if rng.random_bool(0.5) { 1.0 } else { -1.0 };
            let magnitude = 2f64.powf(exponential(rng, 1.0 / INTEGER_SCALE)) - 1.0;
            let candidate = sign * magnitude;
            // Magnitudes past the i64 range are redrawn like any out-of-bounds draw.
            if !candidate.is_finite() || candidate.abs() >= i64::MAX as f64 {
                continue;
            }
            let n = candidate.trunc() as i64;
            if self.within_bounds(&Value::Int(n)) {
                return Ok(n);
            }
        }
        // Narrow ranges far from zero are rarely hit by rejection alone.
        let offset = exp_len(rng) as i64;
        match (self.minimum, self.maximum) {
            (Some(min), Some(max)) => Ok(rng.random_range(min..=max)),
            (Some(min), None) => Ok(min.saturating_add(offset)),
            (None, Some(max)) => Ok(max.saturating_sub(offset)),
            (None, None) => Err(GenerateError::RetriesExhausted {
                kind: SymbolType::Integer,
                attempts: retries,
            }),
        }
    }

    fn generate_list(&self, rng: &mut dyn RngCore) -> Result<Value, GenerateError> {
        let mut pool: Option<Vec<Value>> = None;
        let mut banned: Vec<&Value> = Vec::new();
        for restriction in self
            .list_scopes
            .iter()
            .filter(|s| s.quantifier == Quantifier::All)
        {
            if restriction.member {
                pool = Some(match pool {
                    Some(existing) => existing
                        .into_iter()
                        .filter(|v| restriction.items.contains(v))
                        .collect(),
                    None => restriction.items.clone(),
                });
            } else {
                banned.extend(restriction.items.iter());
            }
        }
        let pool: Option<Vec<Value>> =
            pool.map(|p| p.into_iter().filter(|v| !banned.contains(&v)).collect());

        let mut entries: Vec<Value> = Vec::new();
        for restriction in self
            .list_scopes
            .iter()
            .filter(|s| s.quantifier == Quantifier::Any)
        {
            let witness = if restriction.member {
                let options: Vec<&Value> = restriction
                    .items
                    .iter()
                    .filter(|v| !banned.contains(v))
                    .filter(|v| pool.as_ref().is_none_or(|p| p.contains(v)))
                    .collect();
                options.choose(rng).map(|v| (*v).clone())
            } else {
                match pool.as_ref() {
                    Some(p) => {
                        let options: Vec<&Value> = p
                            .iter()
                            .filter(|v| !restriction.items.contains(v))
                            .collect();
                        options.choose(rng).map(|v| (*v).clone())
                    }
                    None => (0..DEFAULT_SAMPLE_RETRIES)
                        .map(|_| {
                            let len = exp_len(rng) + 1;
                            Value::Str(printable_string(rng, len))
                        })
                        .find(|v| !restriction.items.contains(v) && !banned.contains(&v)),
                }
            };
            match witness {
                Some(value) if !entries.contains(&value) => entries.push(value),
                Some(_) => {}
                None => {
                    return Err(GenerateError::Contradiction(format!(
                        "no element can satisfy {:?}({} {})",
                        restriction.quantifier,
                        if restriction.member { "In" } else { "NotIn" },
                        Value::List(restriction.items.clone())
                    )));
                }
            }
        }

        for _ in 0..exp_len(rng) {
            let entry = match pool.as_ref() {
                Some(p) => match p.choose(rng) {
                    Some(v) => v.clone(),
                    None => break,
                },
                None => {
                    let len = exp_len(rng);
                    Value::Str(printable_string(rng, len))
                }
            };
            if entry.as_bytes().is_some_and(|b| b.is_empty()) || banned.contains(&&entry) {
                continue;
            }
            if !entries.contains(&entry) {
                entries.push(entry);
            }
        }
        Ok(Value::List(entries))
    }
}

/// Inverse-CDF sample of an exponential distribution with the given rate.
pub(crate) fn exponential(rng: &mut dyn RngCore, rate: f64) -> f64 {
    let u: f64 = rng.random();
    -(1.0 - u).ln() / rate
}

pub(crate) fn exp_len(rng: &mut dyn RngCore) -> usize {
    (exponential(rng, LENGTH_RATE).floor() as usize).min(MAX_GENERATED_LEN)
}

fn random_bytes(rng: &mut dyn RngCore, len: usize) -> Vec<u8> {
    (0..len).map(|_| rng.random_range(1u8..=255u8)).collect()
}

pub(crate) fn printable_string(rng: &mut dyn RngCore, len: usize) -> String {
    let charset = PRINTABLE.as_bytes();
    (0..len)
        .filter_map(|_| charset.choose(rng).map(|b| *b as char))
        .collect()
}
