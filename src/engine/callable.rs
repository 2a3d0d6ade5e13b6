use std::sync::Arc;

use crate::{
    engine::{
        scope::{Scope, SingleValueScope},
        units::Units,
        value::{EngineValue, Real},
    },
    error::VeldResult,
};

/// A compiled expression: takes a scope, returns a value.
///
/// The DSL compiler produces these; tests plug in closures through the
/// blanket impl below. Either way the evaluator cannot tell the difference.
pub trait CompiledCallable: Send + Sync {
    fn evaluate(&self, scope: &dyn Scope) -> VeldResult<EngineValue>;
}

impl<F> CompiledCallable for F
where
    F: Fn(&dyn Scope) -> VeldResult<EngineValue> + Send + Sync,
{
    fn evaluate(&self, scope: &dyn Scope) -> VeldResult<EngineValue> {
        self(scope)
    }
}

/// A compiled handler guard: takes a scope, answers whether the handler runs.
pub trait CompiledSelector: Send + Sync {
    fn matches(&self, scope: &dyn Scope) -> VeldResult<bool>;
}

impl<F> CompiledSelector for F
where
    F: Fn(&dyn Scope) -> VeldResult<bool> + Send + Sync,
{
    fn matches(&self, scope: &dyn Scope) -> VeldResult<bool> {
        self(scope)
    }
}

/// The identity on `current`.
#[derive(Debug, Clone, Copy, Default)]
pub struct ReturnCurrentCallable;

impl CompiledCallable for ReturnCurrentCallable {
    fn evaluate(&self, scope: &dyn Scope) -> VeldResult<EngineValue> {
        scope.get("current")
    }
}

/// Linear conversion transform: `current * factor`.
///
/// Scale transforms are the one shape the converter can invert on its own,
/// which is what makes their synthesized inverses communicative-safe.
#[derive(Debug, Clone, Copy)]
pub struct ScaleTransform {
    factor: f64,
}

impl ScaleTransform {
    pub fn new(factor: f64) -> Self {
        Self { factor }
    }

    pub fn inverse(&self) -> Self {
        Self {
            factor: 1.0 / self.factor,
        }
    }
}

impl CompiledCallable for ScaleTransform {
    fn evaluate(&self, scope: &dyn Scope) -> VeldResult<EngineValue> {
        let current = scope.get("current")?;
        let units = current.units().cloned().unwrap_or_else(Units::empty);
        let result = current.as_real()?.mul(Real::from_f64(self.factor));
        Ok(EngineValue::real(result, units))
    }
}

/// Convenience for applying a callable to one value.
pub fn apply(callable: &Arc<dyn CompiledCallable>, value: EngineValue) -> VeldResult<EngineValue> {
    callable.evaluate(&SingleValueScope::new(value))
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_return_current_is_identity() {
        let value = EngineValue::count(9);
        let callable = ReturnCurrentCallable;
        let result = callable
            .evaluate(&SingleValueScope::new(value.clone()))
            .unwrap();
        assert!(result.approx_eq(&value));
    }

    #[test]
    fn test_scale_transform_and_inverse_round_trip() {
        let cm_to_m = ScaleTransform::new(0.01);
        let m_to_cm = cm_to_m.inverse();

        let start = EngineValue::decimal(150.0, Units::of("cm").unwrap());
        let meters = cm_to_m
            .evaluate(&SingleValueScope::new(start.clone()))
            .unwrap();
        assert!((meters.as_real().unwrap().to_f64() - 1.5).abs() < 1e-12);

        let back = m_to_cm.evaluate(&SingleValueScope::new(meters)).unwrap();
        assert!((back.as_real().unwrap().to_f64() - 150.0).abs() < 1e-9);
    }

    #[test]
    fn test_closures_are_callables() {
        let double = |scope: &dyn Scope| {
            let v = scope.get("current")?;
            Ok(EngineValue::real(
                v.as_real()?.mul(Real::from_i64(2)),
                Units::empty(),
            ))
        };
        let result = double
            .evaluate(&SingleValueScope::new(EngineValue::count(21)))
            .unwrap();
        assert!((result.as_real().unwrap().to_f64() - 42.0).abs() < 1e-12);
    }
}
