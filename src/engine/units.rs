use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::{
    collections::{BTreeMap, HashMap},
    fmt,
    hash::{Hash, Hasher},
    sync::{Arc, LazyLock, Mutex},
};

use crate::error::{EngineError, VeldResult};

/// Units as a pair of multisets over symbolic base names.
///
/// Canonicalization cancels common factors and strips `count` (which is
/// semantically identical to dimensionless). Instances are interned by
/// canonical string, so equality is a pointer comparison and repeated
/// `Units::of` / `multiply` calls return the same allocation.
#[derive(Clone)]
pub struct Units(Arc<UnitsInner>);

#[derive(Debug)]
struct UnitsInner {
    numer: Vec<(String, u32)>,
    denom: Vec<(String, u32)>,
    canonical: String,
}

static INTERN: LazyLock<Mutex<HashMap<String, Units>>> =
    LazyLock::new(|| Mutex::new(HashMap::new()));

impl Units {
    /// Dimensionless units. `count` parses to the same instance.
    pub fn empty() -> Self {
        intern(BTreeMap::new(), BTreeMap::new())
    }

    /// A single base unit, e.g. `meters` or `year`.
    pub fn base(name: &str) -> VeldResult<Self> {
        Self::of(name)
    }

    /// Parses unit text: base symbols joined by `*` (or whitespace) with an
    /// optional `^exp`, and at most one `/` separating the denominator.
    /// `a/b/c` is rejected everywhere.
    pub fn of(text: &str) -> VeldResult<Self> {
        let trimmed = text.trim();
        if trimmed.is_empty() {
            return Ok(Self::empty());
        }

        let sides: Vec<&str> = trimmed.split('/').collect();
        if sides.len() > 2 {
            return Err(EngineError::DenominatorDepth(trimmed.to_string()).into());
        }

        let numer = parse_side(sides[0], trimmed)?;
        let denom = match sides.get(1) {
            Some(side) => parse_side(side, trimmed)?,
            None => BTreeMap::new(),
        };

        Ok(intern(numer, denom))
    }

    pub fn is_dimensionless(&self) -> bool {
        self.0.numer.is_empty() && self.0.denom.is_empty()
    }

    /// Canonical text form; cached at interning time.
    pub fn canonical(&self) -> &str {
        &self.0.canonical
    }

    /// Units of the product of two quantities.
    pub fn multiply(&self, other: &Units) -> Units {
        let mut numer = to_multiset(&self.0.numer);
        let mut denom = to_multiset(&self.0.denom);
        merge(&mut numer, &other.0.numer);
        merge(&mut denom, &other.0.denom);
        intern(numer, denom)
    }

    /// Units of the quotient of two quantities.
    pub fn divide(&self, other: &Units) -> Units {
        self.multiply(&other.invert())
    }

    /// Swaps numerator and denominator.
    pub fn invert(&self) -> Units {
        intern(to_multiset(&self.0.denom), to_multiset(&self.0.numer))
    }

    /// Units raised to a non-negative integer power.
    pub fn pow(&self, exp: u32) -> Units {
        if exp == 0 {
            return Units::empty();
        }
        let mut result = self.clone();
        for _ in 1..exp {
            result = result.multiply(self);
        }
        result
    }
}

impl PartialEq for Units {
    fn eq(&self, other: &Self) -> bool {
        // Interning guarantees one allocation per canonical form.
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl Eq for Units {}

impl Hash for Units {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.0.canonical.hash(state);
    }
}

impl fmt::Display for Units {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0.canonical)
    }
}

impl fmt::Debug for Units {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Units({})", self.0.canonical)
    }
}

impl Serialize for Units {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0.canonical)
    }
}

impl<'de> Deserialize<'de> for Units {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        Units::of(&text).map_err(serde::de::Error::custom)
    }
}

// ================================================================================================
// Canonicalization internals
// ================================================================================================

fn parse_side(side: &str, full: &str) -> VeldResult<BTreeMap<String, u32>> {
    let mut terms = BTreeMap::new();
    for token in side.split(['*', ' ', '\t']).filter(|t| !t.is_empty()) {
        let (symbol, exp) = match token.split_once('^') {
            Some((sym, exp_text)) => {
                let exp: u32 = exp_text
                    .parse()
                    .map_err(|_| EngineError::InvalidUnits(full.to_string()))?;
                (sym, exp)
            }
            None => (token, 1),
        };
        if symbol.is_empty() || !symbol.chars().all(|c| c.is_ascii_alphabetic()) {
            return Err(EngineError::InvalidUnits(full.to_string()).into());
        }
        *terms.entry(symbol.to_string()).or_insert(0) += exp;
    }
    Ok(terms)
}

fn to_multiset(side: &[(String, u32)]) -> BTreeMap<String, u32> {
    side.iter().map(|(s, e)| (s.clone(), *e)).collect()
}

fn merge(into: &mut BTreeMap<String, u32>, from: &[(String, u32)]) {
    for (sym, exp) in from {
        *into.entry(sym.clone()).or_insert(0) += exp;
    }
}

fn intern(mut numer: BTreeMap<String, u32>, mut denom: BTreeMap<String, u32>) -> Units {
    // `count` carries no dimension.
    numer.remove("count");
    denom.remove("count");

    // Cancel common factors.
    let shared: Vec<String> = numer
        .keys()
        .filter(|k| denom.contains_key(*k))
        .cloned()
        .collect();
    for sym in shared {
        let n = numer[&sym];
        let d = denom[&sym];
        let cancel = n.min(d);
        if n == cancel {
            numer.remove(&sym);
        } else {
            numer.insert(sym.clone(), n - cancel);
        }
        if d == cancel {
            denom.remove(&sym);
        } else {
            denom.insert(sym.clone(), d - cancel);
        }
    }

    let canonical = render(&numer, &denom);

    let mut cache = INTERN.lock().unwrap_or_else(|poison| poison.into_inner());
    if let Some(existing) = cache.get(&canonical) {
        return existing.clone();
    }
    let units = Units(Arc::new(UnitsInner {
        numer: numer.into_iter().collect(),
        denom: denom.into_iter().collect(),
        canonical: canonical.clone(),
    }));
    cache.insert(canonical, units.clone());
    units
}

fn render(numer: &BTreeMap<String, u32>, denom: &BTreeMap<String, u32>) -> String {
    let render_side = |side: &BTreeMap<String, u32>| {
        side.iter()
            .map(|(sym, exp)| {
                if *exp == 1 {
                    sym.clone()
                } else {
                    format!("{sym}^{exp}")
                }
            })
            .collect::<Vec<_>>()
            .join("*")
    };

    let numer_text = if numer.is_empty() {
        "count".to_string()
    } else {
        render_side(numer)
    };

    if denom.is_empty() {
        numer_text
    } else {
        format!("{}/{}", numer_text, render_side(denom))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_of_is_idempotent_on_canonical_form() {
        let once = Units::of("kg*m/s").unwrap();
        let twice = Units::of(once.canonical()).unwrap();
        assert_eq!(once, twice);
        assert_eq!(once.canonical(), twice.canonical());
    }

    #[test]
    fn test_count_and_empty_are_identical() {
        let count = Units::of("count").unwrap();
        let empty = Units::empty();
        assert_eq!(count, empty);
        assert!(count.is_dimensionless());
    }

    #[test]
    fn test_two_denominator_layers_rejected() {
        let err = Units::of("m / s / kilogram").unwrap_err();
        assert!(matches!(
            err,
            crate::error::VeldError::Engine(EngineError::DenominatorDepth(_))
        ));
    }

    #[test]
    fn test_multiply_cancels_common_factors() {
        let speed = Units::of("m/s").unwrap();
        let time = Units::of("s").unwrap();
        let distance = speed.multiply(&time);
        assert_eq!(distance, Units::of("m").unwrap());
    }

    #[test]
    fn test_divide_composes_denominator() {
        let distance = Units::of("m").unwrap();
        let time = Units::of("s").unwrap();
        assert_eq!(distance.divide(&time).canonical(), "m/s");
    }

    #[test]
    fn test_self_division_is_dimensionless() {
        let m = Units::of("m").unwrap();
        assert!(m.divide(&m).is_dimensionless());
    }

    #[test]
    fn test_interning_gives_stable_cached_strings() {
        let a = Units::of("ha").unwrap();
        let b = Units::of("year").unwrap();
        let first = a.multiply(&b);
        let second = a.multiply(&b);
        // Same allocation both times.
        assert_eq!(first, second);
        assert_eq!(first.canonical(), "ha*year");
    }

    #[test]
    fn test_exponent_rendering() {
        let m = Units::of("m").unwrap();
        assert_eq!(m.multiply(&m).canonical(), "m^2");
        assert_eq!(m.pow(3).canonical(), "m^3");
        assert_eq!(m.pow(0), Units::empty());
    }

    #[test]
    fn test_invalid_symbols_rejected() {
        assert!(Units::of("m2").is_err());
        assert!(Units::of("m^x").is_err());
    }
}
