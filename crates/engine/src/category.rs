//! Category policies.
//!
//! Every setting belongs to one `Category`, which fixes the shape of its value
//! and the rules used to validate and repair it against the currently
//! available values:
//!
//! | Category         | Value shape          | Available values            |
//! |------------------|----------------------|-----------------------------|
//! | `SingleOption`   | any non-null value   | `Options`                   |
//! | `MultiOption`    | non-empty array      | `Options`                   |
//! | `Number`         | number               | `Numeric` / `Unconstrained` |
//! | `NumberWithStep` | number on the grid   | `Numeric` with a step       |
//! | `Range`          | `[lo, hi]`           | `Numeric` / `Unconstrained` |
//! | `Boolean`        | bool                 | ignored                     |
//! | `Static`         | anything             | ignored                     |
//!
//! All three operations are pure and total. `fixup` is idempotent and, for any
//! non-empty available set of the matching shape, always returns a value that
//! `is_valid` accepts.
//!
//! ## Equality
//!
//! Option membership uses deep `serde_json::Value` equality. `1` and `1.0` are
//! different values.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Relative tolerance for numeric bound and grid checks.
const EPSILON: f64 = 1e-9;

/// Closed set of value categories.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Category {
    SingleOption,
    MultiOption,
    Number,
    NumberWithStep,
    Range,
    Boolean,
    Static,
}

// ============================================================================
// Available values
// ============================================================================

/// Inclusive numeric bounds with an optional grid step.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct NumericBounds {
    pub min: f64,
    pub max: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step: Option<f64>,
}

impl NumericBounds {
    pub fn new(min: f64, max: f64) -> Self {
        Self { min, max, step: None }
    }

    pub fn with_step(min: f64, max: f64, step: f64) -> Self {
        Self {
            min,
            max,
            step: Some(step),
        }
    }

    /// True when no number satisfies the bounds (`min > max` or NaN).
    pub fn is_empty(&self) -> bool {
        !(self.min <= self.max)
    }

    fn tolerance(&self) -> f64 {
        EPSILON * (1.0 + self.min.abs().max(self.max.abs()))
    }

    fn contains(&self, x: f64) -> bool {
        let tol = self.tolerance();
        x >= self.min - tol && x <= self.max + tol
    }

    fn clamp(&self, x: f64) -> f64 {
        x.max(self.min).min(self.max)
    }

    /// Step usable for snapping. Non-positive or non-finite steps are ignored.
    fn usable_step(&self) -> Option<f64> {
        self.step.filter(|s| s.is_finite() && *s > 0.0)
    }

    fn on_grid(&self, x: f64) -> bool {
        match self.usable_step() {
            None => true,
            Some(step) => {
                let k = (x - self.min) / step;
                (k - k.round()).abs() <= EPSILON * k.abs().max(1.0)
            }
        }
    }

    /// Clamp into the bounds, then pick the nearest grid candidate that is
    /// still inside them.
    fn snap(&self, x: f64) -> f64 {
        let x = self.clamp(x);
        let Some(step) = self.usable_step() else {
            return x;
        };

        let k = ((x - self.min) / step).floor();
        let lower = self.min + k * step;
        let upper = self.min + (k + 1.0) * step;

        [lower, upper]
            .into_iter()
            .filter(|c| self.contains(*c))
            .min_by(|a, b| (a - x).abs().total_cmp(&(b - x).abs()))
            .unwrap_or(self.min)
    }
}

/// The currently permissible values for a setting.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AvailableValues {
    /// No valid configuration is currently possible.
    Empty,
    /// Any structurally valid value is accepted.
    Unconstrained,
    /// Explicit list of allowed values, in presentation order.
    Options(Vec<Value>),
    /// Numeric interval, optionally on a grid.
    Numeric(NumericBounds),
}

impl Default for AvailableValues {
    fn default() -> Self {
        AvailableValues::Empty
    }
}

impl AvailableValues {
    /// Build an option list. An empty list becomes `Empty`.
    pub fn options<I, T>(items: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<Value>,
    {
        let options: Vec<Value> = items.into_iter().map(Into::into).collect();
        if options.is_empty() {
            AvailableValues::Empty
        } else {
            AvailableValues::Options(options)
        }
    }

    /// Build an option list from serializable items (e.g. ensemble idents).
    pub fn options_from<T: Serialize>(items: &[T]) -> Result<Self, serde_json::Error> {
        let options = items
            .iter()
            .map(serde_json::to_value)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self::options(options))
    }

    pub fn numeric(min: f64, max: f64) -> Self {
        AvailableValues::Numeric(NumericBounds::new(min, max))
    }

    pub fn stepped(min: f64, max: f64, step: f64) -> Self {
        AvailableValues::Numeric(NumericBounds::with_step(min, max, step))
    }

    pub fn is_empty(&self) -> bool {
        match self {
            AvailableValues::Empty => true,
            AvailableValues::Unconstrained => false,
            AvailableValues::Options(options) => options.is_empty(),
            AvailableValues::Numeric(bounds) => bounds.is_empty(),
        }
    }

    /// The option list, or an empty slice for non-list shapes.
    pub fn as_options(&self) -> &[Value] {
        match self {
            AvailableValues::Options(options) => options,
            _ => &[],
        }
    }

    pub fn as_bounds(&self) -> Option<&NumericBounds> {
        match self {
            AvailableValues::Numeric(bounds) if !bounds.is_empty() => Some(bounds),
            _ => None,
        }
    }
}

// ============================================================================
// Policy operations
// ============================================================================

impl Category {
    /// The value a setting of this category holds when nothing is selected.
    pub fn empty_value(&self) -> Value {
        match self {
            Category::MultiOption => Value::Array(Vec::new()),
            _ => Value::Null,
        }
    }

    pub fn is_valid(&self, value: &Value, available: &AvailableValues) -> bool {
        match self {
            Category::Static => true,
            Category::Boolean => value.is_boolean(),
            Category::SingleOption => !value.is_null() && available.as_options().contains(value),
            Category::MultiOption => match value.as_array() {
                Some(selection) if !selection.is_empty() => {
                    let options = available.as_options();
                    selection.iter().all(|v| options.contains(v))
                }
                _ => false,
            },
            Category::Number => match (value.as_f64(), available) {
                (Some(x), AvailableValues::Numeric(b)) => !b.is_empty() && b.contains(x),
                (Some(_), AvailableValues::Unconstrained) => true,
                _ => false,
            },
            Category::NumberWithStep => match (value.as_f64(), available) {
                (Some(x), AvailableValues::Numeric(b)) => {
                    !b.is_empty() && b.contains(x) && b.on_grid(x)
                }
                (Some(_), AvailableValues::Unconstrained) => true,
                _ => false,
            },
            Category::Range => match (as_pair(value), available) {
                (Some((lo, hi)), AvailableValues::Numeric(b)) => {
                    lo <= hi
                        && !b.is_empty()
                        && b.contains(lo)
                        && b.contains(hi)
                        && b.on_grid(lo)
                        && b.on_grid(hi)
                }
                (Some((lo, hi)), AvailableValues::Unconstrained) => lo <= hi,
                _ => false,
            },
        }
    }

    /// Deterministically repair `value` against `available`.
    ///
    /// Valid values are returned unchanged. When nothing can be selected the
    /// category's empty value is returned.
    pub fn fixup(&self, value: &Value, available: &AvailableValues) -> Value {
        if self.is_valid(value, available) {
            return value.clone();
        }

        match self {
            Category::Static => value.clone(),
            Category::Boolean => Value::Bool(false),
            Category::SingleOption => available
                .as_options()
                .first()
                .cloned()
                .unwrap_or(Value::Null),
            Category::MultiOption => {
                let options = available.as_options();
                let Some(first) = options.first() else {
                    return Value::Array(Vec::new());
                };
                let kept: Vec<Value> = value
                    .as_array()
                    .map(|selection| {
                        selection
                            .iter()
                            .filter(|v| options.contains(v))
                            .cloned()
                            .collect()
                    })
                    .unwrap_or_default();
                if kept.is_empty() {
                    Value::Array(vec![first.clone()])
                } else {
                    Value::Array(kept)
                }
            }
            Category::Number => match (available, available.as_bounds()) {
                (AvailableValues::Unconstrained, _) => number_value(0.0),
                (_, Some(b)) => number_value(b.clamp(value.as_f64().unwrap_or(b.min))),
                (_, None) => Value::Null,
            },
            Category::NumberWithStep => match (available, available.as_bounds()) {
                (AvailableValues::Unconstrained, _) => number_value(0.0),
                (_, Some(b)) => number_value(b.snap(value.as_f64().unwrap_or(b.min))),
                (_, None) => Value::Null,
            },
            Category::Range => match (available, as_pair(value)) {
                (AvailableValues::Unconstrained, Some((lo, hi))) => {
                    pair_value(lo.min(hi), lo.max(hi))
                }
                (AvailableValues::Unconstrained, None) => pair_value(0.0, 0.0),
                _ => match available.as_bounds() {
                    Some(b) => {
                        let (lo, hi) = match as_pair(value) {
                            Some((lo, hi)) => (lo.min(hi), lo.max(hi)),
                            None => (b.min, b.max),
                        };
                        let (mut lo, mut hi) = (b.snap(lo), b.snap(hi));
                        if lo > hi {
                            std::mem::swap(&mut lo, &mut hi);
                        }
                        pair_value(lo, hi)
                    }
                    None => Value::Null,
                },
            },
        }
    }

    /// Combine available values contributed by several providers.
    ///
    /// `index == 0` seeds the accumulator with `next`. List categories keep
    /// the accumulator's (first provider's) order. Numeric categories narrow
    /// to the overlap and keep the coarser step. An empty result is reported
    /// as `AvailableValues::Empty`.
    pub fn intersection_reduce(
        &self,
        acc: AvailableValues,
        next: &AvailableValues,
        index: usize,
    ) -> AvailableValues {
        if matches!(self, Category::Boolean | Category::Static) {
            return AvailableValues::Unconstrained;
        }
        if index == 0 {
            return next.clone();
        }
        if acc.is_empty() || next.is_empty() {
            return AvailableValues::Empty;
        }

        match (self, acc, next) {
            (_, AvailableValues::Unconstrained, other) => other.clone(),
            (_, acc, AvailableValues::Unconstrained) => acc,
            (
                Category::SingleOption | Category::MultiOption,
                AvailableValues::Options(acc),
                AvailableValues::Options(next),
            ) => AvailableValues::options(acc.into_iter().filter(|v| next.contains(v))),
            (
                Category::Number | Category::NumberWithStep | Category::Range,
                AvailableValues::Numeric(a),
                AvailableValues::Numeric(b),
            ) => {
                let step = match (a.step, b.step) {
                    (Some(x), Some(y)) => Some(x.max(y)),
                    (x, y) => x.or(y),
                };
                let merged = NumericBounds {
                    min: a.min.max(b.min),
                    max: a.max.min(b.max),
                    step,
                };
                if merged.is_empty() {
                    AvailableValues::Empty
                } else {
                    AvailableValues::Numeric(merged)
                }
            }
            // Shape does not match the category
            _ => AvailableValues::Empty,
        }
    }
}

fn as_pair(value: &Value) -> Option<(f64, f64)> {
    match value.as_array()?.as_slice() {
        [lo, hi] => Some((lo.as_f64()?, hi.as_f64()?)),
        _ => None,
    }
}

/// Integral results are stored as JSON integers so `3` stays `3`, not `3.0`.
fn number_value(x: f64) -> Value {
    if x.fract() == 0.0 && x.abs() < 9.0e15 {
        Value::from(x as i64)
    } else {
        Value::from(x)
    }
}

fn pair_value(lo: f64, hi: f64) -> Value {
    Value::Array(vec![number_value(lo), number_value(hi)])
}
