//! Parameter spaces: typed descriptors, random sampling and filtered grid enumeration.
//!
//! A `ParameterSpace` is an ordered table of `ParamSpec` descriptors plus a list
//! of pluggable `AssignmentFilter`s. Random sampling draws every parameter
//! independently and ignores the filters. Grid enumeration walks the Cartesian
//! product of the free parameters (rightmost parameter fastest), holds any fixed
//! overrides constant and drops assignments rejected by a filter.

use std::cmp::Ordering;
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::sync::Arc;

use rand::Rng;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors from building a parameter space or applying overrides to it.
#[derive(Debug, Error, PartialEq)]
pub enum ParamError {
    #[error("parameter space declares no parameters")]
    Empty,

    #[error("parameter name must not be empty")]
    EmptyName,

    #[error("parameter '{0}' is declared more than once")]
    Duplicate(String),

    #[error("parameter '{0}' has no candidate values")]
    NoCandidates(String),

    #[error("parameter '{name}' expects {expected} values, got {value}")]
    KindMismatch {
        name: String,
        expected: ParamKind,
        value: ParamValue,
    },

    #[error("unknown parameter '{0}'")]
    Unknown(String),

    #[error("assignment is missing parameter '{0}'")]
    Missing(String),

    #[error("expected parameter '{expected}' at this position, found '{found}'")]
    OutOfOrder { expected: String, found: String },

    #[error("value {value} is not a candidate for parameter '{name}'")]
    NotACandidate { name: String, value: ParamValue },
}

// ─── Values ─────────────────────────────────────────────────────────

/// Declared type of a parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParamKind {
    Int,
    Float,
}

impl ParamKind {
    /// Convert `value` to this kind, or `None` if it cannot be represented.
    ///
    /// Integers widen to floats; floats never narrow to integers.
    pub fn coerce(self, value: ParamValue) -> Option<ParamValue> {
        match (self, value) {
            (ParamKind::Int, ParamValue::Int(_)) => Some(value),
            (ParamKind::Int, ParamValue::Float(_)) => None,
            (ParamKind::Float, ParamValue::Int(v)) => Some(ParamValue::Float(v as f64)),
            (ParamKind::Float, ParamValue::Float(_)) => Some(value),
        }
    }
}

impl fmt::Display for ParamKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParamKind::Int => f.write_str("integer"),
            ParamKind::Float => f.write_str("float"),
        }
    }
}

/// A scalar parameter value.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParamValue {
    Int(i64),
    Float(f64),
}

impl ParamValue {
    pub fn kind(&self) -> ParamKind {
        match self {
            ParamValue::Int(_) => ParamKind::Int,
            ParamValue::Float(_) => ParamKind::Float,
        }
    }

    pub fn as_f64(&self) -> f64 {
        match *self {
            ParamValue::Int(v) => v as f64,
            ParamValue::Float(v) => v,
        }
    }

    /// The integer code, if this is an integer value.
    pub fn as_int(&self) -> Option<i64> {
        match *self {
            ParamValue::Int(v) => Some(v),
            ParamValue::Float(_) => None,
        }
    }

    /// Parse a textual cell: integers first, then floats.
    pub fn parse(text: &str) -> Option<Self> {
        let text = text.trim();
        if let Ok(v) = text.parse::<i64>() {
            return Some(ParamValue::Int(v));
        }
        text.parse::<f64>()
            .ok()
            .filter(|v| v.is_finite())
            .map(ParamValue::Float)
    }

    /// Numeric ordering across kinds; `Int(7)` and `Float(7.0)` compare equal.
    pub fn numeric_cmp(&self, other: &ParamValue) -> Ordering {
        match (self, other) {
            (ParamValue::Int(a), ParamValue::Int(b)) => a.cmp(b),
            _ => self.as_f64().total_cmp(&other.as_f64()),
        }
    }

    pub fn numeric_eq(&self, other: &ParamValue) -> bool {
        self.numeric_cmp(other) == Ordering::Equal
    }

    /// Multiply by `factor`; stays integral only when both sides are integers.
    pub fn scaled(&self, factor: ParamValue) -> ParamValue {
        match (*self, factor) {
            (ParamValue::Int(a), ParamValue::Int(b)) => ParamValue::Int(a.saturating_mul(b)),
            _ => ParamValue::Float(self.as_f64() * factor.as_f64()),
        }
    }
}

impl fmt::Display for ParamValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            ParamValue::Int(v) => write!(f, "{v}"),
            // Keep a decimal point so the value reads back as a float.
            ParamValue::Float(v) if v.is_finite() && v.fract() == 0.0 => write!(f, "{v:.1}"),
            ParamValue::Float(v) => write!(f, "{v}"),
        }
    }
}

impl From<i64> for ParamValue {
    fn from(v: i64) -> Self {
        ParamValue::Int(v)
    }
}

impl From<f64> for ParamValue {
    fn from(v: f64) -> Self {
        ParamValue::Float(v)
    }
}

// ─── Descriptors ────────────────────────────────────────────────────

/// Descriptor for one sweep parameter.
///
/// `name` is the simulator argument key (`--{name}=value`); `column` is the
/// label used in the result store header and defaults to `name`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParamSpec {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub column: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<ParamKind>,
    pub values: Vec<ParamValue>,
}

impl ParamSpec {
    pub fn new(name: impl Into<String>, values: Vec<ParamValue>) -> Self {
        Self {
            name: name.into(),
            column: None,
            kind: None,
            values,
        }
    }

    pub fn int(name: impl Into<String>, values: &[i64]) -> Self {
        let mut spec = Self::new(name, values.iter().copied().map(ParamValue::Int).collect());
        spec.kind = Some(ParamKind::Int);
        spec
    }

    pub fn float(name: impl Into<String>, values: &[f64]) -> Self {
        let mut spec = Self::new(name, values.iter().copied().map(ParamValue::Float).collect());
        spec.kind = Some(ParamKind::Float);
        spec
    }

    pub fn with_column(mut self, column: impl Into<String>) -> Self {
        self.column = Some(column.into());
        self
    }

    /// Store column label.
    pub fn column(&self) -> &str {
        self.column.as_deref().unwrap_or(&self.name)
    }

    /// Declared kind, or the kind inferred from the candidates (float wins).
    pub fn kind(&self) -> ParamKind {
        self.kind.unwrap_or_else(|| {
            if self.values.iter().any(|v| v.kind() == ParamKind::Float) {
                ParamKind::Float
            } else {
                ParamKind::Int
            }
        })
    }

    fn contains(&self, value: &ParamValue) -> bool {
        self.values.iter().any(|c| c.numeric_eq(value))
    }
}

// ─── Assignments ────────────────────────────────────────────────────

/// One concrete combination of parameter values, in declared order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterAssignment {
    entries: Vec<(String, ParamValue)>,
}

impl ParameterAssignment {
    /// Build an assignment from ordered pairs.
    ///
    /// Use `ParameterSpace::validate` to check it against a declared space.
    pub fn from_pairs<I, S>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (S, ParamValue)>,
        S: Into<String>,
    {
        Self {
            entries: pairs.into_iter().map(|(k, v)| (k.into(), v)).collect(),
        }
    }

    pub fn get(&self, name: &str) -> Option<ParamValue> {
        self.entries
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| *v)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, ParamValue)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), *v))
    }

    pub fn values(&self) -> impl Iterator<Item = ParamValue> + '_ {
        self.entries.iter().map(|(_, v)| *v)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl fmt::Display for ParameterAssignment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, (k, v)) in self.entries.iter().enumerate() {
            if i > 0 {
                f.write_str(" ")?;
            }
            write!(f, "{k}={v}")?;
        }
        Ok(())
    }
}

// ─── Filters ────────────────────────────────────────────────────────

/// Policy deciding whether an enumerated assignment is worth running.
pub trait AssignmentFilter: fmt::Debug + Send + Sync {
    fn accepts(&self, assignment: &ParameterAssignment) -> bool;
}

/// Uplink-only scenarios are only meaningful under the "used resources"
/// allocation mode: reject `downlink == downlink_off && allocation != allocation_used`.
///
/// Assignments lacking either parameter are accepted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkDirectionFilter {
    pub downlink: String,
    pub allocation: String,
    #[serde(default)]
    pub downlink_off: i64,
    #[serde(default = "default_allocation_used")]
    pub allocation_used: i64,
}

fn default_allocation_used() -> i64 {
    1
}

impl LinkDirectionFilter {
    pub fn new(downlink: impl Into<String>, allocation: impl Into<String>) -> Self {
        Self {
            downlink: downlink.into(),
            allocation: allocation.into(),
            downlink_off: 0,
            allocation_used: default_allocation_used(),
        }
    }
}

impl AssignmentFilter for LinkDirectionFilter {
    fn accepts(&self, assignment: &ParameterAssignment) -> bool {
        match (assignment.get(&self.downlink), assignment.get(&self.allocation)) {
            (Some(dl), Some(alloc)) => {
                let uplink = dl.numeric_eq(&ParamValue::Int(self.downlink_off));
                let used = alloc.numeric_eq(&ParamValue::Int(self.allocation_used));
                !(uplink && !used)
            }
            _ => true,
        }
    }
}

// ─── Space ──────────────────────────────────────────────────────────

/// Ordered, validated table of sweep parameters.
#[derive(Debug, Clone)]
pub struct ParameterSpace {
    params: Vec<ParamSpec>,
    filters: Vec<Arc<dyn AssignmentFilter>>,
}

impl ParameterSpace {
    /// Validate the descriptor table and coerce every candidate to its kind.
    pub fn new(params: Vec<ParamSpec>) -> Result<Self, ParamError> {
        if params.is_empty() {
            return Err(ParamError::Empty);
        }

        let mut seen = HashSet::new();
        let mut resolved = Vec::with_capacity(params.len());
        for spec in params {
            if spec.name.trim().is_empty() {
                return Err(ParamError::EmptyName);
            }
            if !seen.insert(spec.name.clone()) {
                return Err(ParamError::Duplicate(spec.name));
            }
            if spec.values.is_empty() {
                return Err(ParamError::NoCandidates(spec.name));
            }

            let kind = spec.kind();
            let values = spec
                .values
                .iter()
                .map(|&v| {
                    kind.coerce(v).ok_or_else(|| ParamError::KindMismatch {
                        name: spec.name.clone(),
                        expected: kind,
                        value: v,
                    })
                })
                .collect::<Result<Vec<_>, _>>()?;

            resolved.push(ParamSpec {
                kind: Some(kind),
                values,
                ..spec
            });
        }

        Ok(Self {
            params: resolved,
            filters: Vec::new(),
        })
    }

    /// Add a filter applied during grid enumeration.
    pub fn with_filter(mut self, filter: impl AssignmentFilter + 'static) -> Self {
        self.filters.push(Arc::new(filter));
        self
    }

    pub fn params(&self) -> &[ParamSpec] {
        &self.params
    }

    pub fn filters(&self) -> &[Arc<dyn AssignmentFilter>] {
        &self.filters
    }

    /// Store column labels in declared order.
    pub fn columns(&self) -> Vec<&str> {
        self.params.iter().map(|p| p.column()).collect()
    }

    pub fn spec(&self, name: &str) -> Option<&ParamSpec> {
        self.params.iter().find(|p| p.name == name)
    }

    /// Size of the unfiltered Cartesian product.
    pub fn cardinality(&self) -> usize {
        self.params.iter().map(|p| p.values.len()).product()
    }

    /// Whether every filter accepts `assignment`.
    pub fn accepts(&self, assignment: &ParameterAssignment) -> bool {
        self.filters.iter().all(|f| f.accepts(assignment))
    }

    /// Draw one value per parameter, independently and uniformly.
    pub fn sample_random<R: Rng>(&self, rng: &mut R) -> ParameterAssignment {
        let entries = self
            .params
            .iter()
            .map(|spec| {
                let idx = rng.gen_range(0..spec.values.len());
                (spec.name.clone(), spec.values[idx])
            })
            .collect();
        ParameterAssignment { entries }
    }

    /// Lazily enumerate the filtered product of every parameter not in `fixed`.
    ///
    /// Fixed overrides are checked for name and kind but not for membership in
    /// the candidate set, so a grid can pin a value the space never samples.
    pub fn enumerate_all(
        &self,
        fixed: &BTreeMap<String, ParamValue>,
    ) -> Result<Assignments<'_>, ParamError> {
        for name in fixed.keys() {
            if self.spec(name).is_none() {
                return Err(ParamError::Unknown(name.clone()));
            }
        }

        let slots = self
            .params
            .iter()
            .map(|spec| match fixed.get(&spec.name) {
                Some(&value) => {
                    let kind = spec.kind();
                    kind.coerce(value)
                        .map(Slot::Fixed)
                        .ok_or_else(|| ParamError::KindMismatch {
                            name: spec.name.clone(),
                            expected: kind,
                            value,
                        })
                }
                None => Ok(Slot::Free(0)),
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Assignments {
            space: self,
            slots,
            exhausted: false,
        })
    }

    /// Check that `assignment` names every declared parameter once, in order,
    /// with a value of the declared kind.
    pub fn validate(&self, assignment: &ParameterAssignment) -> Result<(), ParamError> {
        let mut seen = HashSet::new();
        for (name, _) in assignment.iter() {
            if self.spec(name).is_none() {
                return Err(ParamError::Unknown(name.to_string()));
            }
            if !seen.insert(name) {
                return Err(ParamError::Duplicate(name.to_string()));
            }
        }
        if let Some(spec) = self.params.iter().find(|p| !seen.contains(p.name.as_str())) {
            return Err(ParamError::Missing(spec.name.clone()));
        }
        for (spec, (name, value)) in self.params.iter().zip(assignment.iter()) {
            if spec.name != name {
                return Err(ParamError::OutOfOrder {
                    expected: spec.name.clone(),
                    found: name.to_string(),
                });
            }
            if spec.kind().coerce(value).is_none() {
                return Err(ParamError::KindMismatch {
                    name: spec.name.clone(),
                    expected: spec.kind(),
                    value,
                });
            }
        }
        Ok(())
    }

    /// Like `validate`, additionally requiring every value to be a declared candidate.
    pub fn validate_strict(&self, assignment: &ParameterAssignment) -> Result<(), ParamError> {
        self.validate(assignment)?;
        for (spec, (_, value)) in self.params.iter().zip(assignment.iter()) {
            if !spec.contains(&value) {
                return Err(ParamError::NotACandidate {
                    name: spec.name.clone(),
                    value,
                });
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy)]
enum Slot {
    Fixed(ParamValue),
    /// Index into the parameter's candidate list.
    Free(usize),
}

/// Lazy, filtered Cartesian product produced by `ParameterSpace::enumerate_all`.
#[derive(Debug)]
pub struct Assignments<'a> {
    space: &'a ParameterSpace,
    slots: Vec<Slot>,
    exhausted: bool,
}

impl Assignments<'_> {
    fn current(&self) -> ParameterAssignment {
        let entries = self
            .space
            .params
            .iter()
            .zip(&self.slots)
            .map(|(spec, slot)| {
                let value = match *slot {
                    Slot::Fixed(v) => v,
                    Slot::Free(i) => spec.values[i],
                };
                (spec.name.clone(), value)
            })
            .collect();
        ParameterAssignment { entries }
    }

    /// Odometer step, rightmost free slot first.
    fn advance(&mut self) {
        for (spec, slot) in self.space.params.iter().zip(self.slots.iter_mut()).rev() {
            if let Slot::Free(i) = slot {
                if *i + 1 < spec.values.len() {
                    *i += 1;
                    return;
                }
                *i = 0;
            }
        }
        self.exhausted = true;
    }
}

impl Iterator for Assignments<'_> {
    type Item = ParameterAssignment;

    fn next(&mut self) -> Option<Self::Item> {
        while !self.exhausted {
            let assignment = self.current();
            self.advance();
            if self.space.accepts(&assignment) {
                return Some(assignment);
            }
        }
        None
    }
}
