use std::{
    collections::{HashMap, HashSet, VecDeque},
    sync::{Arc, Mutex},
};

use crate::{
    engine::{
        callable::{CompiledCallable, ScaleTransform},
        scope::SingleValueScope,
        units::Units,
        value::EngineValue,
    },
    error::{EngineError, VeldResult},
};

/// A directed conversion edge bearing the transform that carries a scalar
/// from `source` units into `dest` units.
#[derive(Clone)]
pub struct ConversionEdge {
    source: Units,
    dest: Units,
    transform: Arc<dyn CompiledCallable>,
    exact: bool,
}

impl ConversionEdge {
    pub fn source(&self) -> &Units {
        &self.source
    }

    pub fn dest(&self) -> &Units {
        &self.dest
    }
}

impl std::fmt::Debug for ConversionEdge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "ConversionEdge({} -> {}, exact: {})",
            self.source, self.dest, self.exact
        )
    }
}

/// The conversion graph built at program-build time. Immutable afterwards
/// and shared freely across threads; shortest paths are memoized.
pub struct Converter {
    edges: HashMap<Units, Vec<ConversionEdge>>,
    path_cache: Mutex<HashMap<(Units, Units), Arc<Vec<ConversionEdge>>>>,
}

impl Converter {
    /// Expresses `value` in `to` units. A no-op when units already match;
    /// otherwise walks the shortest conversion path.
    pub fn convert(&self, value: &EngineValue, to: &Units) -> VeldResult<EngineValue> {
        let from = match value.units() {
            Some(units) => units.clone(),
            None => return Err(crate::engine::value::type_mismatch("value with units", value)),
        };
        if from == *to {
            return Ok(value.clone());
        }

        let path = self.path(&from, to)?;
        let mut current = value.clone();
        for edge in path.iter() {
            current = apply_edge(&current, edge)?;
        }
        Ok(current)
    }

    /// Alias used by arithmetic when aligning an operand to the left side's
    /// units.
    pub fn align(&self, value: &EngineValue, to: &Units) -> VeldResult<EngineValue> {
        self.convert(value, to)
    }

    pub fn has_conversion(&self, from: &Units, to: &Units) -> bool {
        from == to || self.path(from, to).is_ok()
    }

    /// A direct pair is communicative-safe when both directions exist and
    /// both are exact.
    pub fn is_communicative_safe(&self, from: &Units, to: &Units) -> bool {
        let forward = self.direct_edge(from, to);
        let backward = self.direct_edge(to, from);
        matches!((forward, backward), (Some(f), Some(b)) if f.exact && b.exact)
    }

    fn direct_edge(&self, from: &Units, to: &Units) -> Option<&ConversionEdge> {
        self.edges
            .get(from)
            .and_then(|out| out.iter().find(|e| e.dest == *to))
    }

    /// Shortest path via BFS, memoized per (source, dest).
    fn path(&self, from: &Units, to: &Units) -> VeldResult<Arc<Vec<ConversionEdge>>> {
        let key = (from.clone(), to.clone());
        if let Some(hit) = self
            .path_cache
            .lock()
            .unwrap_or_else(|poison| poison.into_inner())
            .get(&key)
        {
            return Ok(hit.clone());
        }

        let mut visited: HashSet<Units> = HashSet::from([from.clone()]);
        let mut queue: VecDeque<Vec<ConversionEdge>> = VecDeque::new();

        for edge in self.edges.get(from).into_iter().flatten() {
            if edge.dest == *to {
                return Ok(self.remember(key, vec![edge.clone()]));
            }
            visited.insert(edge.dest.clone());
            queue.push_back(vec![edge.clone()]);
        }

        while let Some(prefix) = queue.pop_front() {
            let tail = &prefix.last().expect("non-empty prefix").dest;
            for edge in self.edges.get(tail).into_iter().flatten() {
                if edge.dest == *to {
                    let mut path = prefix.clone();
                    path.push(edge.clone());
                    return Ok(self.remember(key, path));
                }
                if visited.insert(edge.dest.clone()) {
                    let mut path = prefix.clone();
                    path.push(edge.clone());
                    queue.push_back(path);
                }
            }
        }

        Err(EngineError::NoConversion {
            from: from.to_string(),
            to: to.to_string(),
        }
        .into())
    }

    fn remember(
        &self,
        key: (Units, Units),
        path: Vec<ConversionEdge>,
    ) -> Arc<Vec<ConversionEdge>> {
        let path = Arc::new(path);
        self.path_cache
            .lock()
            .unwrap_or_else(|poison| poison.into_inner())
            .insert(key, path.clone());
        path
    }
}

fn apply_edge(value: &EngineValue, edge: &ConversionEdge) -> VeldResult<EngineValue> {
    match value {
        EngineValue::Distribution(dist) => {
            let mapped = dist.map_realized(|sample| {
                let scope = SingleValueScope::new(EngineValue::real(sample, edge.source.clone()));
                edge.transform.evaluate(&scope)?.as_real()
            })?;
            Ok(EngineValue::Distribution(mapped.with_units(edge.dest.clone())))
        }
        _ => {
            let scope = SingleValueScope::new(value.clone());
            let out = edge.transform.evaluate(&scope)?;
            Ok(EngineValue::real(out.as_real()?, edge.dest.clone()))
        }
    }
}

// ================================================================================================
// Builder
// ================================================================================================

/// Collects conversion declarations during program build.
#[derive(Default)]
pub struct ConverterBuilder {
    edges: HashMap<Units, Vec<ConversionEdge>>,
}

impl ConverterBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Linear conversion `dest = source * factor`. The inverse edge is
    /// synthesized automatically; both directions are exact, so the pair is
    /// communicative-safe.
    pub fn scale(mut self, from: &Units, to: &Units, factor: f64) -> Self {
        let forward = ScaleTransform::new(factor);
        let backward = forward.inverse();
        self.push(ConversionEdge {
            source: from.clone(),
            dest: to.clone(),
            transform: Arc::new(forward),
            exact: true,
        });
        self.push(ConversionEdge {
            source: to.clone(),
            dest: from.clone(),
            transform: Arc::new(backward),
            exact: true,
        });
        self
    }

    /// Arbitrary one-way conversion. The program must register the reverse
    /// direction itself if it wants one; the pair is communicative-safe only
    /// when both registrations are `exact`.
    pub fn callable(
        mut self,
        from: &Units,
        to: &Units,
        transform: Arc<dyn CompiledCallable>,
        exact: bool,
    ) -> Self {
        self.push(ConversionEdge {
            source: from.clone(),
            dest: to.clone(),
            transform,
            exact,
        });
        self
    }

    fn push(&mut self, edge: ConversionEdge) {
        self.edges.entry(edge.source.clone()).or_default().push(edge);
    }

    pub fn build(self) -> Converter {
        Converter {
            edges: self.edges,
            path_cache: Mutex::new(HashMap::new()),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn units(text: &str) -> Units {
        Units::of(text).unwrap()
    }

    #[test]
    fn test_identity_conversion_preserves_value() {
        let conv = ConverterBuilder::new().build();
        let v = EngineValue::int(7, units("m"));
        let out = conv.convert(&v, &units("m")).unwrap();
        assert!(out.approx_eq(&v), "to(U, v) == v for all v");
    }

    #[test]
    fn test_direct_scale_conversion() {
        let conv = ConverterBuilder::new()
            .scale(&units("cm"), &units("m"), 0.01)
            .build();
        let v = EngineValue::decimal(150.0, units("cm"));
        let out = conv.convert(&v, &units("m")).unwrap();
        assert!(out.approx_eq(&EngineValue::decimal(1.5, units("m"))));
    }

    #[test]
    fn test_scale_pair_is_communicative_safe() {
        let conv = ConverterBuilder::new()
            .scale(&units("cm"), &units("m"), 0.01)
            .build();
        assert!(conv.is_communicative_safe(&units("cm"), &units("m")));

        // g(f(v)) ~= v for communicative-safe pairs.
        let v = EngineValue::decimal(37.25, units("cm"));
        let there = conv.convert(&v, &units("m")).unwrap();
        let back = conv.convert(&there, &units("cm")).unwrap();
        assert!(back.approx_eq(&v));
    }

    #[test]
    fn test_one_way_callable_is_not_communicative_safe() {
        let square: Arc<dyn CompiledCallable> = Arc::new(|scope: &dyn crate::engine::scope::Scope| {
            let v = scope.get("current")?;
            let r = v.as_real()?;
            Ok(EngineValue::real(r.mul(r), Units::empty()))
        });
        let conv = ConverterBuilder::new()
            .callable(&units("a"), &units("b"), square, false)
            .build();

        assert!(conv.has_conversion(&units("a"), &units("b")));
        assert!(!conv.has_conversion(&units("b"), &units("a")));
        assert!(!conv.is_communicative_safe(&units("a"), &units("b")));
    }

    #[test]
    fn test_multi_hop_shortest_path() {
        let conv = ConverterBuilder::new()
            .scale(&units("cm"), &units("m"), 0.01)
            .scale(&units("m"), &units("km"), 0.001)
            .build();

        let v = EngineValue::decimal(250_000.0, units("cm"));
        let out = conv.convert(&v, &units("km")).unwrap();
        assert!(out.approx_eq(&EngineValue::decimal(2.5, units("km"))));
    }

    #[test]
    fn test_missing_conversion_fails() {
        let conv = ConverterBuilder::new().build();
        let v = EngineValue::int(1, units("m"));
        let err = conv.convert(&v, &units("kg")).unwrap_err();
        assert!(matches!(
            err,
            crate::error::VeldError::Engine(EngineError::NoConversion { .. })
        ));
    }

    #[test]
    fn test_path_cache_returns_stable_results() {
        let conv = ConverterBuilder::new()
            .scale(&units("cm"), &units("m"), 0.01)
            .scale(&units("m"), &units("km"), 0.001)
            .build();

        let v = EngineValue::decimal(100.0, units("cm"));
        let first = conv.convert(&v, &units("km")).unwrap();
        let second = conv.convert(&v, &units("km")).unwrap();
        assert!(first.approx_eq(&second));
    }

    #[test]
    fn test_realized_distribution_converts_elementwise() {
        let conv = ConverterBuilder::new()
            .scale(&units("cm"), &units("m"), 0.01)
            .build();
        let dist = EngineValue::Distribution(
            crate::engine::distribution::Distribution::realized_f64([100.0, 250.0], units("cm")),
        );
        let out = conv.convert(&dist, &units("m")).unwrap();
        match out {
            EngineValue::Distribution(d) => {
                let samples = d.samples().unwrap();
                assert!((samples[0].to_f64() - 1.0).abs() < 1e-12);
                assert!((samples[1].to_f64() - 2.5).abs() < 1e-12);
                assert_eq!(d.units(), &units("m"));
            }
            other => panic!("expected distribution, got {other:?}"),
        }
    }
}
