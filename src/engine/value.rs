use rust_decimal::{
    Decimal,
    prelude::{FromPrimitive, ToPrimitive},
};
use std::{cmp::Ordering, fmt};

use crate::{
    compat::{self, NumericMode},
    engine::{convert::Converter, distribution::Distribution, units::Units},
    entity::EntityRef,
    error::{EngineError, VeldResult},
};

// ================================================================================================
// Real: the two-legged decimal
// ================================================================================================

/// A decimal number in the process-configured numeric mode.
///
/// `Decimal` is exact (`rust_decimal`); `Double` is IEEE-754. A binary op on
/// mixed legs falls back to `Double` — that only happens when values cross a
/// numeric-mode boundary, e.g. data loaded under a different mode.
/// Transcendental ops (`ln`, `log10`, fractional powers) route through `f64`
/// in both modes.
#[derive(Clone, Copy, Debug)]
pub enum Real {
    Decimal(Decimal),
    Double(f64),
}

impl Real {
    pub fn from_f64(value: f64) -> Self {
        match compat::numeric_mode() {
            NumericMode::Decimal => Decimal::from_f64(value)
                .map(Real::Decimal)
                .unwrap_or(Real::Double(value)),
            NumericMode::Double => Real::Double(value),
        }
    }

    pub fn from_i64(value: i64) -> Self {
        match compat::numeric_mode() {
            NumericMode::Decimal => Real::Decimal(Decimal::from(value)),
            NumericMode::Double => Real::Double(value as f64),
        }
    }

    pub fn to_f64(self) -> f64 {
        match self {
            Real::Decimal(d) => d.to_f64().unwrap_or(f64::NAN),
            Real::Double(f) => f,
        }
    }

    fn zip(self, other: Real) -> RealPair {
        match (self, other) {
            (Real::Decimal(a), Real::Decimal(b)) => RealPair::Decimal(a, b),
            (a, b) => RealPair::Double(a.to_f64(), b.to_f64()),
        }
    }

    pub fn add(self, other: Real) -> Real {
        match self.zip(other) {
            RealPair::Decimal(a, b) => Real::Decimal(a + b),
            RealPair::Double(a, b) => Real::Double(a + b),
        }
    }

    pub fn sub(self, other: Real) -> Real {
        match self.zip(other) {
            RealPair::Decimal(a, b) => Real::Decimal(a - b),
            RealPair::Double(a, b) => Real::Double(a - b),
        }
    }

    pub fn mul(self, other: Real) -> Real {
        match self.zip(other) {
            RealPair::Decimal(a, b) => Real::Decimal(a * b),
            RealPair::Double(a, b) => Real::Double(a * b),
        }
    }

    pub fn div(self, other: Real) -> VeldResult<Real> {
        match self.zip(other) {
            RealPair::Decimal(a, b) => {
                if b.is_zero() {
                    return Err(EngineError::Arithmetic("division by zero".into()).into());
                }
                Ok(Real::Decimal(a / b))
            }
            RealPair::Double(a, b) => {
                if b == 0.0 {
                    return Err(EngineError::Arithmetic("division by zero".into()).into());
                }
                Ok(Real::Double(a / b))
            }
        }
    }

    pub fn neg(self) -> Real {
        match self {
            Real::Decimal(d) => Real::Decimal(-d),
            Real::Double(f) => Real::Double(-f),
        }
    }

    pub fn abs(self) -> Real {
        match self {
            Real::Decimal(d) => Real::Decimal(d.abs()),
            Real::Double(f) => Real::Double(f.abs()),
        }
    }

    pub fn ceil(self) -> Real {
        match self {
            Real::Decimal(d) => Real::Decimal(d.ceil()),
            Real::Double(f) => Real::Double(f.ceil()),
        }
    }

    pub fn floor(self) -> Real {
        match self {
            Real::Decimal(d) => Real::Decimal(d.floor()),
            Real::Double(f) => Real::Double(f.floor()),
        }
    }

    pub fn round(self) -> Real {
        match self {
            Real::Decimal(d) => Real::Decimal(d.round()),
            Real::Double(f) => Real::Double(f.round()),
        }
    }

    pub fn ln(self) -> VeldResult<Real> {
        let v = self.to_f64();
        if v <= 0.0 {
            return Err(EngineError::Arithmetic(format!("ln of non-positive value {v}")).into());
        }
        Ok(Real::from_f64(v.ln()))
    }

    pub fn log10(self) -> VeldResult<Real> {
        let v = self.to_f64();
        if v <= 0.0 {
            return Err(EngineError::Arithmetic(format!("log10 of non-positive value {v}")).into());
        }
        Ok(Real::from_f64(v.log10()))
    }

    /// `self` raised to `exp`. Integer exponents stay exact in decimal mode.
    pub fn powf(self, exp: Real) -> VeldResult<Real> {
        let exp_f = exp.to_f64();
        if exp_f.fract() == 0.0 && exp_f.abs() <= i32::MAX as f64 {
            return self.powi(exp_f as i32);
        }
        let base = self.to_f64();
        let result = base.powf(exp_f);
        if !result.is_finite() {
            return Err(EngineError::Arithmetic(format!("{base}^{exp_f} is not finite")).into());
        }
        Ok(Real::from_f64(result))
    }

    pub fn powi(self, exp: i32) -> VeldResult<Real> {
        match self {
            Real::Decimal(base) => {
                let mut acc = Decimal::ONE;
                for _ in 0..exp.unsigned_abs() {
                    acc = acc.checked_mul(base).ok_or_else(|| {
                        EngineError::Arithmetic(format!("{base}^{exp} overflows decimal"))
                    })?;
                }
                if exp < 0 {
                    Real::Decimal(Decimal::ONE).div(Real::Decimal(acc))
                } else {
                    Ok(Real::Decimal(acc))
                }
            }
            Real::Double(base) => {
                let result = base.powi(exp);
                if !result.is_finite() {
                    return Err(
                        EngineError::Arithmetic(format!("{base}^{exp} is not finite")).into()
                    );
                }
                Ok(Real::Double(result))
            }
        }
    }

    pub fn compare(self, other: Real) -> Ordering {
        match self.zip(other) {
            RealPair::Decimal(a, b) => a.cmp(&b),
            RealPair::Double(a, b) => a.partial_cmp(&b).unwrap_or(Ordering::Equal),
        }
    }

    /// Equality within the numeric mode's tolerance: exact for decimals,
    /// a relative epsilon for doubles.
    pub fn approx_eq(self, other: Real) -> bool {
        match self.zip(other) {
            RealPair::Decimal(a, b) => a == b,
            RealPair::Double(a, b) => {
                let scale = a.abs().max(b.abs()).max(1.0);
                (a - b).abs() <= scale * 1e-9
            }
        }
    }
}

enum RealPair {
    Decimal(Decimal, Decimal),
    Double(f64, f64),
}

impl fmt::Display for Real {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Real::Decimal(d) => write!(f, "{d}"),
            Real::Double(v) => write!(f, "{v}"),
        }
    }
}

impl PartialEq for Real {
    fn eq(&self, other: &Self) -> bool {
        self.compare(*other) == Ordering::Equal
    }
}

impl PartialOrd for Real {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.compare(*other))
    }
}

// ================================================================================================
// EngineValue
// ================================================================================================

/// The universal value carrier flowing through handlers, scopes, and exports.
///
/// Numeric variants carry [`Units`]; combining two numbers triggers unit
/// algebra (`add`/`subtract` convert through the graph, `multiply`/`divide`
/// compose).
#[derive(Clone, Debug)]
pub enum EngineValue {
    Int { value: i64, units: Units },
    Real { value: Real, units: Units },
    Bool(bool),
    Str(String),
    Point { lat: f64, lon: f64 },
    Distribution(Distribution),
    Entity(EntityRef),
    Entities(Vec<EntityRef>),
}

impl EngineValue {
    pub fn int(value: i64, units: Units) -> Self {
        EngineValue::Int { value, units }
    }

    pub fn real(value: Real, units: Units) -> Self {
        EngineValue::Real { value, units }
    }

    pub fn decimal(value: f64, units: Units) -> Self {
        EngineValue::Real {
            value: Real::from_f64(value),
            units,
        }
    }

    /// A dimensionless count.
    pub fn count(value: i64) -> Self {
        EngineValue::Int {
            value,
            units: Units::empty(),
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            EngineValue::Int { .. } => "integer",
            EngineValue::Real { .. } => "decimal",
            EngineValue::Bool(_) => "boolean",
            EngineValue::Str(_) => "string",
            EngineValue::Point { .. } => "point",
            EngineValue::Distribution(_) => "distribution",
            EngineValue::Entity(_) => "entity",
            EngineValue::Entities(_) => "entities",
        }
    }

    pub fn units(&self) -> Option<&Units> {
        match self {
            EngineValue::Int { units, .. } | EngineValue::Real { units, .. } => Some(units),
            EngineValue::Distribution(dist) => Some(dist.units()),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> VeldResult<bool> {
        match self {
            EngineValue::Bool(b) => Ok(*b),
            other => Err(type_mismatch("boolean", other)),
        }
    }

    pub fn as_str(&self) -> VeldResult<&str> {
        match self {
            EngineValue::Str(s) => Ok(s),
            other => Err(type_mismatch("string", other)),
        }
    }

    pub fn as_int(&self) -> VeldResult<i64> {
        match self {
            EngineValue::Int { value, .. } => Ok(*value),
            other => Err(type_mismatch("integer", other)),
        }
    }

    /// Numeric view, widening integers.
    pub fn as_real(&self) -> VeldResult<Real> {
        match self {
            EngineValue::Int { value, .. } => Ok(Real::from_i64(*value)),
            EngineValue::Real { value, .. } => Ok(*value),
            other => Err(type_mismatch("number", other)),
        }
    }

    pub fn as_entities(&self) -> VeldResult<&[EntityRef]> {
        match self {
            EngineValue::Entities(refs) => Ok(refs),
            other => Err(type_mismatch("entities", other)),
        }
    }

    // --------------------------------------------------------------------------------------------
    // Binary arithmetic
    // --------------------------------------------------------------------------------------------

    /// Addition. Source units must agree after conversion; strings
    /// concatenate; distributions shift by scalar operands.
    pub fn add(&self, other: &EngineValue, conv: &Converter) -> VeldResult<EngineValue> {
        if let (EngineValue::Str(a), EngineValue::Str(b)) = (self, other) {
            return Ok(EngineValue::Str(format!("{a}{b}")));
        }
        match (self, other) {
            (EngineValue::Distribution(dist), _) => {
                let delta = other.aligned_real(dist.units(), conv)?;
                Ok(EngineValue::Distribution(dist.shift(delta)))
            }
            (_, EngineValue::Distribution(dist)) => {
                let delta = self.aligned_real(dist.units(), conv)?;
                Ok(EngineValue::Distribution(dist.shift(delta)))
            }
            _ => self.additive_op(other, conv, Real::add, i64::checked_add),
        }
    }

    pub fn subtract(&self, other: &EngineValue, conv: &Converter) -> VeldResult<EngineValue> {
        match (self, other) {
            (EngineValue::Distribution(dist), _) => {
                let delta = other.aligned_real(dist.units(), conv)?;
                Ok(EngineValue::Distribution(dist.shift(delta.neg())))
            }
            (_, EngineValue::Distribution(dist)) => {
                // scalar - dist == (-1 * dist) + scalar
                let scalar = self.aligned_real(dist.units(), conv)?;
                Ok(EngineValue::Distribution(
                    dist.scale(Real::from_i64(-1)).shift(scalar),
                ))
            }
            _ => self.additive_op(other, conv, Real::sub, i64::checked_sub),
        }
    }

    fn additive_op(
        &self,
        other: &EngineValue,
        conv: &Converter,
        real_op: impl Fn(Real, Real) -> Real,
        int_op: impl Fn(i64, i64) -> Option<i64>,
    ) -> VeldResult<EngineValue> {
        let units = self.require_units()?.clone();
        let rhs = align_operand(other, &units, conv)?;
        match (self, &rhs) {
            (EngineValue::Int { value: a, .. }, EngineValue::Int { value: b, .. }) => {
                match int_op(*a, *b) {
                    Some(v) => Ok(EngineValue::int(v, units)),
                    None => Ok(EngineValue::real(
                        real_op(Real::from_i64(*a), Real::from_i64(*b)),
                        units,
                    )),
                }
            }
            _ => Ok(EngineValue::real(
                real_op(self.as_real()?, rhs.as_real()?),
                units,
            )),
        }
    }

    /// Multiplication composes units; no conversion is attempted.
    pub fn multiply(&self, other: &EngineValue, _conv: &Converter) -> VeldResult<EngineValue> {
        match (self, other) {
            (EngineValue::Distribution(dist), _) => {
                let units = dist.units().multiply(other.require_units()?);
                let scalar = other.as_real()?;
                Ok(EngineValue::Distribution(dist.scale(scalar).with_units(units)))
            }
            (_, EngineValue::Distribution(dist)) => {
                let units = self.require_units()?.multiply(dist.units());
                let scalar = self.as_real()?;
                Ok(EngineValue::Distribution(dist.scale(scalar).with_units(units)))
            }
            (
                EngineValue::Int { value: a, units: ua },
                EngineValue::Int { value: b, units: ub },
            ) => {
                let units = ua.multiply(ub);
                match a.checked_mul(*b) {
                    Some(v) => Ok(EngineValue::int(v, units)),
                    None => Ok(EngineValue::real(
                        Real::from_i64(*a).mul(Real::from_i64(*b)),
                        units,
                    )),
                }
            }
            _ => {
                let units = self.require_units()?.multiply(other.require_units()?);
                Ok(EngineValue::real(self.as_real()?.mul(other.as_real()?), units))
            }
        }
    }

    /// Division composes units and widens integers (no silent truncation).
    pub fn divide(&self, other: &EngineValue, _conv: &Converter) -> VeldResult<EngineValue> {
        match (self, other) {
            (EngineValue::Distribution(dist), _) => {
                let units = dist.units().divide(other.require_units()?);
                let factor = Real::from_i64(1).div(other.as_real()?)?;
                Ok(EngineValue::Distribution(dist.scale(factor).with_units(units)))
            }
            _ => {
                let units = self.require_units()?.divide(other.require_units()?);
                Ok(EngineValue::real(
                    self.as_real()?.div(other.as_real()?)?,
                    units,
                ))
            }
        }
    }

    /// Exponentiation. The exponent must be dimensionless; a dimensioned
    /// base requires a non-negative integer exponent so the result units
    /// stay expressible.
    pub fn power(&self, exp: &EngineValue, _conv: &Converter) -> VeldResult<EngineValue> {
        let exp_units = exp.require_units()?;
        if !exp_units.is_dimensionless() {
            return Err(EngineError::Arithmetic(format!(
                "exponent must be dimensionless, found '{exp_units}'"
            ))
            .into());
        }

        let base_units = self.require_units()?;
        if base_units.is_dimensionless() {
            if let (EngineValue::Int { value: b, .. }, EngineValue::Int { value: e, .. }) =
                (self, exp)
                && *e >= 0
                && let Ok(e32) = u32::try_from(*e)
                && let Some(v) = b.checked_pow(e32)
            {
                return Ok(EngineValue::int(v, Units::empty()));
            }
            return Ok(EngineValue::real(
                self.as_real()?.powf(exp.as_real()?)?,
                Units::empty(),
            ));
        }

        let exp_int = match exp {
            EngineValue::Int { value, .. } if *value >= 0 => *value as u32,
            _ => {
                return Err(EngineError::Arithmetic(format!(
                    "base with units '{base_units}' needs a non-negative integer exponent"
                ))
                .into());
            }
        };
        let units = base_units.pow(exp_int);
        match self {
            EngineValue::Int { value, .. } => match value.checked_pow(exp_int) {
                Some(v) => Ok(EngineValue::int(v, units)),
                None => Ok(EngineValue::real(
                    Real::from_i64(*value).powi(exp_int as i32)?,
                    units,
                )),
            },
            _ => Ok(EngineValue::real(
                self.as_real()?.powi(exp_int as i32)?,
                units,
            )),
        }
    }

    // --------------------------------------------------------------------------------------------
    // Comparisons
    // --------------------------------------------------------------------------------------------

    /// Three-way comparison after unit alignment.
    pub fn compare(&self, other: &EngineValue, conv: &Converter) -> VeldResult<Ordering> {
        match (self, other) {
            (EngineValue::Str(a), EngineValue::Str(b)) => Ok(a.cmp(b)),
            (EngineValue::Bool(a), EngineValue::Bool(b)) => Ok(a.cmp(b)),
            _ => {
                let units = self.require_units()?.clone();
                let rhs = align_operand(other, &units, conv)?;
                Ok(self.as_real()?.compare(rhs.as_real()?))
            }
        }
    }

    pub fn equals(&self, other: &EngineValue, conv: &Converter) -> VeldResult<bool> {
        Ok(self.compare(other, conv)? == Ordering::Equal)
    }

    pub fn min(&self, other: &EngineValue, conv: &Converter) -> VeldResult<EngineValue> {
        match self.compare(other, conv)? {
            Ordering::Greater => align_operand(other, self.require_units()?, conv),
            _ => Ok(self.clone()),
        }
    }

    pub fn max(&self, other: &EngineValue, conv: &Converter) -> VeldResult<EngineValue> {
        match self.compare(other, conv)? {
            Ordering::Less => align_operand(other, self.require_units()?, conv),
            _ => Ok(self.clone()),
        }
    }

    // --------------------------------------------------------------------------------------------
    // Unary ops
    // --------------------------------------------------------------------------------------------

    pub fn abs(&self) -> VeldResult<EngineValue> {
        match self {
            EngineValue::Int { value, units } => {
                Ok(EngineValue::int(value.saturating_abs(), units.clone()))
            }
            EngineValue::Real { value, units } => {
                Ok(EngineValue::real(value.abs(), units.clone()))
            }
            EngineValue::Distribution(dist) => Ok(EngineValue::Distribution(
                dist.map_realized(|v| Ok(v.abs()))?,
            )),
            other => Err(type_mismatch("number", other)),
        }
    }

    pub fn ceil(&self) -> VeldResult<EngineValue> {
        self.rounding_op(Real::ceil)
    }

    pub fn floor(&self) -> VeldResult<EngineValue> {
        self.rounding_op(Real::floor)
    }

    pub fn round(&self) -> VeldResult<EngineValue> {
        self.rounding_op(Real::round)
    }

    fn rounding_op(&self, op: impl Fn(Real) -> Real + Copy) -> VeldResult<EngineValue> {
        match self {
            EngineValue::Int { .. } => Ok(self.clone()),
            EngineValue::Real { value, units } => {
                Ok(EngineValue::real(op(*value), units.clone()))
            }
            EngineValue::Distribution(dist) => {
                Ok(EngineValue::Distribution(dist.map_realized(|v| Ok(op(v)))?))
            }
            other => Err(type_mismatch("number", other)),
        }
    }

    /// Natural log; the input must be dimensionless.
    pub fn ln(&self) -> VeldResult<EngineValue> {
        self.log_op(Real::ln)
    }

    pub fn log10(&self) -> VeldResult<EngineValue> {
        self.log_op(Real::log10)
    }

    fn log_op(&self, op: impl Fn(Real) -> VeldResult<Real>) -> VeldResult<EngineValue> {
        let units = self.require_units()?;
        if !units.is_dimensionless() {
            return Err(EngineError::Arithmetic(format!(
                "logarithm input must be dimensionless, found '{units}'"
            ))
            .into());
        }
        Ok(EngineValue::real(op(self.as_real()?)?, Units::empty()))
    }

    // --------------------------------------------------------------------------------------------
    // Reductions
    // --------------------------------------------------------------------------------------------

    /// Sum over a distribution; a numeric scalar reduces to itself.
    pub fn sum(&self) -> VeldResult<EngineValue> {
        self.reduce(Distribution::sum)
    }

    /// Mean over a distribution; a numeric scalar reduces to itself.
    pub fn mean(&self) -> VeldResult<EngineValue> {
        self.reduce(Distribution::mean)
    }

    /// Standard deviation over a distribution. A lone scalar has none.
    pub fn std(&self) -> VeldResult<EngineValue> {
        match self {
            EngineValue::Distribution(dist) => {
                Ok(EngineValue::real(dist.std()?, dist.units().clone()))
            }
            other => Err(type_mismatch("distribution", other)),
        }
    }

    /// Number of realized samples; a scalar counts as one.
    pub fn count_of(&self) -> VeldResult<EngineValue> {
        match self {
            EngineValue::Distribution(dist) => Ok(EngineValue::count(dist.count()? as i64)),
            EngineValue::Int { .. } | EngineValue::Real { .. } => Ok(EngineValue::count(1)),
            other => Err(type_mismatch("distribution", other)),
        }
    }

    /// Draws `n` samples. A distribution materializes through the platform
    /// RNG; a numeric scalar repeats.
    pub fn sample(&self, n: usize, rng: &mut rand::rngs::StdRng) -> VeldResult<EngineValue> {
        match self {
            EngineValue::Distribution(dist) => {
                Ok(EngineValue::Distribution(dist.sample(n, rng)))
            }
            EngineValue::Int { .. } | EngineValue::Real { .. } => {
                let value = self.as_real()?;
                let units = self.require_units()?.clone();
                Ok(EngineValue::Distribution(Distribution::realized(
                    vec![value; n],
                    units,
                )))
            }
            other => Err(type_mismatch("distribution or number", other)),
        }
    }

    fn reduce(
        &self,
        op: impl Fn(&Distribution) -> VeldResult<Real>,
    ) -> VeldResult<EngineValue> {
        match self {
            EngineValue::Distribution(dist) => {
                Ok(EngineValue::real(op(dist)?, dist.units().clone()))
            }
            EngineValue::Int { .. } | EngineValue::Real { .. } => Ok(self.clone()),
            other => Err(type_mismatch("distribution", other)),
        }
    }

    // --------------------------------------------------------------------------------------------
    // Helpers
    // --------------------------------------------------------------------------------------------

    fn require_units(&self) -> VeldResult<&Units> {
        self.units()
            .ok_or_else(|| type_mismatch("value with units", self))
    }

    fn aligned_real(&self, units: &Units, conv: &Converter) -> VeldResult<Real> {
        align_operand(self, units, conv)?.as_real()
    }

    /// Approximate equality within the numeric mode's tolerance. Units must
    /// match exactly; no conversion is attempted.
    pub fn approx_eq(&self, other: &EngineValue) -> bool {
        match (self, other) {
            (EngineValue::Int { value: a, units: ua }, EngineValue::Int { value: b, units: ub }) => {
                a == b && ua == ub
            }
            (EngineValue::Bool(a), EngineValue::Bool(b)) => a == b,
            (EngineValue::Str(a), EngineValue::Str(b)) => a == b,
            _ => match (self.units(), other.units(), self.as_real(), other.as_real()) {
                (Some(ua), Some(ub), Ok(a), Ok(b)) => ua == ub && a.approx_eq(b),
                _ => false,
            },
        }
    }
}

impl fmt::Display for EngineValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EngineValue::Int { value, .. } => write!(f, "{value}"),
            EngineValue::Real { value, .. } => write!(f, "{value}"),
            EngineValue::Bool(b) => write!(f, "{b}"),
            EngineValue::Str(s) => write!(f, "{s}"),
            EngineValue::Point { lat, lon } => write!(f, "({lat}, {lon})"),
            EngineValue::Distribution(dist) => write!(f, "{dist}"),
            EngineValue::Entity(entity) => write!(f, "{}", entity.name()),
            EngineValue::Entities(refs) => write!(f, "[{} entities]", refs.len()),
        }
    }
}

pub(crate) fn type_mismatch(expected: &str, found: &EngineValue) -> crate::error::VeldError {
    EngineError::TypeMismatch {
        expected: expected.to_string(),
        found: found.type_name().to_string(),
    }
    .into()
}

/// Arithmetic alignment: an operand that cannot be expressed in the left
/// side's units is a unit mismatch, not a failed conversion request.
fn align_operand(
    value: &EngineValue,
    units: &Units,
    conv: &Converter,
) -> VeldResult<EngineValue> {
    conv.align(value, units).map_err(|err| match err {
        crate::error::VeldError::Engine(EngineError::NoConversion { from, to }) => {
            EngineError::UnitMismatch {
                left: to,
                right: from,
            }
            .into()
        }
        other => other,
    })
}
