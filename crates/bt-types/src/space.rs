//! Parameter-space descriptor and the unit-hypercube <-> phenotype mapping.
//!
//! Every experiment point is a vector in [0,1]^D. A [`ParameterSpace`] lays its
//! parameters out in declaration order, each taking `size` consecutive
//! coordinates, and decodes a point into typed values deterministically.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;

use crate::errors::SpaceError;

/// A single named parameter, possibly vector-valued.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterDef {
    /// Human-readable parameter name (e.g. "learning_rate").
    pub name: String,
    /// The declared type and bounds.
    pub kind: ParameterKind,
    /// Vector width; each component takes one unit coordinate.
    #[serde(default = "default_size")]
    pub size: usize,
}

fn default_size() -> usize {
    1
}

impl ParameterDef {
    pub fn new(name: impl Into<String>, kind: ParameterKind) -> Self {
        Self {
            name: name.into(),
            kind,
            size: 1,
        }
    }

    pub fn with_size(mut self, size: usize) -> Self {
        self.size = size;
        self
    }
}

/// Describes how a unit coordinate maps onto a parameter value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ParameterKind {
    /// Integer range [min, max] inclusive.
    Integer { min: i64, max: i64 },
    /// Continuous range [min, max].
    Real { min: f64, max: f64 },
    /// Unordered named options.
    Categorical { options: Vec<String> },
}

/// A concrete decoded value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParameterValue {
    Int(i64),
    Real(f64),
    Categorical(String),
}

impl std::fmt::Display for ParameterValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Int(v) => write!(f, "{v}"),
            Self::Real(v) => write!(f, "{v}"),
            Self::Categorical(v) => write!(f, "{v}"),
        }
    }
}

/// The decoded values of one parameter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecodedParameter {
    pub name: String,
    pub values: Vec<ParameterValue>,
}

/// A fully decoded point, in declaration order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Phenotype {
    pub parameters: Vec<DecodedParameter>,
}

impl Phenotype {
    pub fn get(&self, name: &str) -> Option<&[ParameterValue]> {
        self.parameters
            .iter()
            .find(|p| p.name == name)
            .map(|p| p.values.as_slice())
    }

    /// First component of a real-valued parameter, widening integers.
    pub fn real(&self, name: &str) -> Option<f64> {
        match self.get(name)?.first()? {
            ParameterValue::Real(v) => Some(*v),
            ParameterValue::Int(v) => Some(*v as f64),
            ParameterValue::Categorical(_) => None,
        }
    }
}

/// The full search space: an ordered list of parameter definitions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterSpace {
    pub parameters: Vec<ParameterDef>,
}

impl ParameterSpace {
    pub fn new() -> Self {
        Self {
            parameters: Vec::new(),
        }
    }

    pub fn add(mut self, def: ParameterDef) -> Self {
        self.parameters.push(def);
        self
    }

    pub fn add_int(self, name: impl Into<String>, min: i64, max: i64) -> Self {
        self.add(ParameterDef::new(name, ParameterKind::Integer { min, max }))
    }

    pub fn add_real(self, name: impl Into<String>, min: f64, max: f64) -> Self {
        self.add(ParameterDef::new(name, ParameterKind::Real { min, max }))
    }

    pub fn add_categorical<I, S>(self, name: impl Into<String>, options: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let options = options.into_iter().map(Into::into).collect();
        self.add(ParameterDef::new(
            name,
            ParameterKind::Categorical { options },
        ))
    }

    /// Total number of unit coordinates.
    pub fn dimension(&self) -> usize {
        self.parameters.iter().map(|p| p.size).sum()
    }

    pub fn validate(&self) -> Result<(), SpaceError> {
        let mut seen = HashSet::new();
        for param in &self.parameters {
            if !seen.insert(param.name.as_str()) {
                return Err(SpaceError::DuplicateName {
                    name: param.name.clone(),
                });
            }
            if param.size == 0 {
                return Err(SpaceError::ZeroWidth {
                    name: param.name.clone(),
                });
            }
            match &param.kind {
                ParameterKind::Integer { min, max } if min > max => {
                    return Err(SpaceError::InvalidBounds {
                        name: param.name.clone(),
                        min: *min as f64,
                        max: *max as f64,
                    });
                }
                ParameterKind::Integer { min, max } if integer_count(*min, *max).is_none() => {
                    return Err(span_too_wide(param, *min, *max));
                }
                ParameterKind::Real { min, max } if !(min <= max) => {
                    return Err(SpaceError::InvalidBounds {
                        name: param.name.clone(),
                        min: *min,
                        max: *max,
                    });
                }
                ParameterKind::Categorical { options } if options.is_empty() => {
                    return Err(SpaceError::NoOptions {
                        name: param.name.clone(),
                    });
                }
                _ => {}
            }
        }
        Ok(())
    }

    /// Decode a unit-cube point into typed values.
    pub fn decode(&self, point: &[f64]) -> Result<Phenotype, SpaceError> {
        self.validate()?;
        let expected = self.dimension();
        if point.len() != expected {
            return Err(SpaceError::WrongDimension {
                expected,
                actual: point.len(),
            });
        }
        if let Some((index, &value)) = point
            .iter()
            .enumerate()
            .find(|(_, u)| !(0.0..=1.0).contains(*u))
        {
            return Err(SpaceError::OutOfUnitRange { index, value });
        }

        let mut offset = 0;
        let mut parameters = Vec::with_capacity(self.parameters.len());
        for param in &self.parameters {
            let coords = &point[offset..offset + param.size];
            offset += param.size;

            let values = coords
                .iter()
                .map(|&u| -> Result<ParameterValue, SpaceError> {
                    match &param.kind {
                        ParameterKind::Integer { min, max } => {
                            let count = integer_count(*min, *max)
                                .ok_or_else(|| span_too_wide(param, *min, *max))?;
                            Ok(ParameterValue::Int(min + index_map(u, count) as i64))
                        }
                        ParameterKind::Real { min, max } => {
                            Ok(ParameterValue::Real(min + u * (max - min)))
                        }
                        ParameterKind::Categorical { options } => Ok(ParameterValue::Categorical(
                            options[index_map(u, options.len())].clone(),
                        )),
                    }
                })
                .collect::<Result<Vec<_>, SpaceError>>()?;
            parameters.push(DecodedParameter {
                name: param.name.clone(),
                values,
            });
        }
        Ok(Phenotype { parameters })
    }

    /// Map decoded values back onto the unit cube. Integers and categoricals
    /// land on the centre of their bin, so `decode(encode(p)) == p`.
    pub fn encode(&self, phenotype: &Phenotype) -> Result<Vec<f64>, SpaceError> {
        let mut point = Vec::with_capacity(self.dimension());
        for param in &self.parameters {
            let values = phenotype.get(&param.name).ok_or_else(|| SpaceError::BadValue {
                name: param.name.clone(),
                message: "missing".to_string(),
            })?;
            if values.len() != param.size {
                return Err(SpaceError::BadValue {
                    name: param.name.clone(),
                    message: format!("expected {} components, got {}", param.size, values.len()),
                });
            }
            for value in values {
                point.push(encode_one(param, value)?);
            }
        }
        Ok(point)
    }
}

impl Default for ParameterSpace {
    fn default() -> Self {
        Self::new()
    }
}

/// Number of values in `[min, max]`, `None` when it does not fit a `usize`.
fn integer_count(min: i64, max: i64) -> Option<usize> {
    let span = max.checked_sub(min)?;
    usize::try_from(span).ok()?.checked_add(1)
}

fn span_too_wide(param: &ParameterDef, min: i64, max: i64) -> SpaceError {
    SpaceError::SpanTooWide {
        name: param.name.clone(),
        min,
        max,
    }
}

/// Bin index of `u` among `count` equal bins; u = 1 lands in the last bin.
fn index_map(u: f64, count: usize) -> usize {
    ((u * count as f64).floor() as usize).min(count - 1)
}

fn encode_one(param: &ParameterDef, value: &ParameterValue) -> Result<f64, SpaceError> {
    let bad = |message: String| SpaceError::BadValue {
        name: param.name.clone(),
        message,
    };
    match (&param.kind, value) {
        (ParameterKind::Integer { min, max }, ParameterValue::Int(v)) => {
            if v < min || v > max {
                return Err(bad(format!("{v} outside [{min}, {max}]")));
            }
            let count = integer_count(*min, *max).ok_or_else(|| span_too_wide(param, *min, *max))?;
            Ok(((v - min) as f64 + 0.5) / count as f64)
        }
        (ParameterKind::Real { min, max }, ParameterValue::Real(v)) => {
            if v < min || v > max {
                return Err(bad(format!("{v} outside [{min}, {max}]")));
            }
            if max == min {
                Ok(0.0)
            } else {
                Ok((v - min) / (max - min))
            }
        }
        (ParameterKind::Categorical { options }, ParameterValue::Categorical(v)) => {
            let pos = options
                .iter()
                .position(|o| o == v)
                .ok_or_else(|| bad(format!("unknown option {v}")))?;
            Ok((pos as f64 + 0.5) / options.len() as f64)
        }
        (_, other) => Err(bad(format!("type mismatch for value {other}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_space() -> ParameterSpace {
        ParameterSpace::new()
            .add_int("layers", 1, 4)
            .add_real("lr", 0.0, 1.0)
            .add_categorical("activation", ["relu", "tanh", "sigmoid"])
    }

    #[test]
    fn dimension_counts_vector_width() {
        let space = sample_space().add(
            ParameterDef::new("w", ParameterKind::Real { min: -1.0, max: 1.0 }).with_size(3),
        );
        assert_eq!(space.dimension(), 6);
    }

    #[test]
    fn integer_max_decodes_stably_at_unit_boundary() {
        let space = ParameterSpace::new().add_int("n", 3, 9);
        for _ in 0..5 {
            let decoded = space.decode(&[1.0]).unwrap();
            assert_eq!(decoded.get("n").unwrap(), &[ParameterValue::Int(9)]);
        }
        let low = space.decode(&[0.0]).unwrap();
        assert_eq!(low.get("n").unwrap(), &[ParameterValue::Int(3)]);
    }

    #[test]
    fn categorical_boundary_maps_to_last_option() {
        let space = sample_space();
        let decoded = space.decode(&[0.0, 0.5, 1.0]).unwrap();
        assert_eq!(
            decoded.get("activation").unwrap(),
            &[ParameterValue::Categorical("sigmoid".into())]
        );
        assert_eq!(decoded.real("lr"), Some(0.5));
    }

    #[test]
    fn encode_lands_on_bin_centres() {
        let space = sample_space();
        let decoded = space.decode(&[0.3, 0.25, 0.1]).unwrap();
        let point = space.encode(&decoded).unwrap();
        assert_eq!(space.decode(&point).unwrap(), decoded);
        // layers: 0.3 * 4 -> bin 1 -> centre 0.375
        assert!((point[0] - 0.375).abs() < 1e-12);
    }

    #[test]
    fn decode_rejects_bad_points() {
        let space = sample_space();
        assert!(matches!(
            space.decode(&[0.1, 0.2]),
            Err(SpaceError::WrongDimension { expected: 3, actual: 2 })
        ));
        assert!(matches!(
            space.decode(&[0.1, 1.2, 0.3]),
            Err(SpaceError::OutOfUnitRange { index: 1, .. })
        ));
    }

    #[test]
    fn validate_catches_bad_declarations() {
        let dup = ParameterSpace::new().add_int("a", 0, 1).add_int("a", 0, 1);
        assert!(matches!(dup.validate(), Err(SpaceError::DuplicateName { .. })));

        let bounds = ParameterSpace::new().add_real("x", 2.0, 1.0);
        assert!(matches!(bounds.validate(), Err(SpaceError::InvalidBounds { .. })));

        let empty = ParameterSpace::new().add_categorical("c", Vec::<String>::new());
        assert!(matches!(empty.validate(), Err(SpaceError::NoOptions { .. })));

        assert!(sample_space().validate().is_ok());
    }

    #[test]
    fn extreme_integer_ranges() {
        let full = ParameterSpace::new().add_int("seed", i64::MIN, i64::MAX);
        assert!(matches!(full.validate(), Err(SpaceError::SpanTooWide { .. })));
        assert!(full.decode(&[0.5]).is_err());

        let wide = ParameterSpace::new().add_int("offset", -(1 << 40), 1 << 40);
        assert!(wide.validate().is_ok());
        let decoded = wide.decode(&[1.0]).unwrap();
        assert_eq!(decoded.get("offset").unwrap(), &[ParameterValue::Int(1 << 40)]);
        assert!(wide.encode(&decoded).is_ok());
    }

    #[test]
    fn space_serializes_with_type_tags() {
        let space = sample_space();
        let json = serde_json::to_string(&space).unwrap();
        assert!(json.contains("\"type\":\"integer\""));
        let back: ParameterSpace = serde_json::from_str(&json).unwrap();
        assert_eq!(space, back);
    }

    mod property_tests {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            /// Property: decoding is pure and respects declared bounds
            #[test]
            fn prop_decode_in_bounds(u in 0.0f64..=1.0, min in -50i64..50, span in 0i64..20) {
                let space = ParameterSpace::new().add_int("k", min, min + span);
                let first = space.decode(&[u]).unwrap();
                let second = space.decode(&[u]).unwrap();
                prop_assert_eq!(&first, &second);
                match first.get("k").unwrap()[0] {
                    ParameterValue::Int(v) => prop_assert!(v >= min && v <= min + span),
                    ref other => prop_assert!(false, "unexpected value {:?}", other),
                }
            }
        }
    }
}
