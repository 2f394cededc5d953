//! The persisted experiment table and the read-only queries over it.

use bt_types::{JobRecord, JobStatus, ParameterSpace, Phenotype, StoreError, TuneError, TuneResult};
use ndarray::{Array1, Array2, ArrayView2};
use serde::{Deserialize, Serialize};

pub(crate) const FORMAT_VERSION: u32 = 1;

/// One committed state of the experiment: parallel per-row arrays keyed by
/// job id (the row index).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExperimentSnapshot {
    pub(crate) version: u32,
    pub(crate) space: ParameterSpace,
    pub(crate) points: Array2<f64>,
    pub(crate) status: Vec<JobStatus>,
    #[serde(with = "tagged_floats")]
    pub(crate) values: Vec<Option<f64>>,
    #[serde(with = "tagged_floats")]
    pub(crate) durations: Vec<Option<f64>>,
    pub(crate) handles: Vec<Option<String>>,
}

impl ExperimentSnapshot {
    /// A table whose every row is a Candidate at the given point.
    pub fn with_candidates(space: ParameterSpace, points: Array2<f64>) -> Self {
        let n = points.nrows();
        Self {
            version: FORMAT_VERSION,
            space,
            points,
            status: vec![JobStatus::Candidate; n],
            values: vec![None; n],
            durations: vec![None; n],
            handles: vec![None; n],
        }
    }

    pub(crate) fn check(&self) -> TuneResult<()> {
        let n = self.points.nrows();
        let corrupt = |message: String| -> TuneError { StoreError::Corrupt { message }.into() };
        if self.version != FORMAT_VERSION {
            return Err(corrupt(format!("unsupported format version {}", self.version)));
        }
        if self.points.ncols() != self.space.dimension() {
            return Err(corrupt(format!(
                "points have {} columns, space has dimension {}",
                self.points.ncols(),
                self.space.dimension()
            )));
        }
        for (name, len) in [
            ("status", self.status.len()),
            ("values", self.values.len()),
            ("durations", self.durations.len()),
            ("handles", self.handles.len()),
        ] {
            if len != n {
                return Err(corrupt(format!("{name} has {len} entries for {n} points")));
            }
        }
        Ok(())
    }

    pub fn space(&self) -> &ParameterSpace {
        &self.space
    }

    pub fn len(&self) -> usize {
        self.status.len()
    }

    pub fn is_empty(&self) -> bool {
        self.status.is_empty()
    }

    pub fn points(&self) -> ArrayView2<'_, f64> {
        self.points.view()
    }

    pub fn status(&self) -> &[JobStatus] {
        &self.status
    }

    pub fn values(&self) -> &[Option<f64>] {
        &self.values
    }

    pub fn durations(&self) -> &[Option<f64>] {
        &self.durations
    }

    pub fn handles(&self) -> &[Option<String>] {
        &self.handles
    }

    /// Values as a dense array, NaN where unset.
    pub fn value_array(&self) -> Array1<f64> {
        self.values.iter().map(|v| v.unwrap_or(f64::NAN)).collect()
    }

    /// Durations as a dense array, NaN where unset.
    pub fn duration_array(&self) -> Array1<f64> {
        self.durations.iter().map(|v| v.unwrap_or(f64::NAN)).collect()
    }

    pub fn ids_with(&self, status: JobStatus) -> Vec<usize> {
        self.status
            .iter()
            .enumerate()
            .filter(|&(_, &s)| s == status)
            .map(|(id, _)| id)
            .collect()
    }

    pub fn candidates(&self) -> Vec<usize> {
        self.ids_with(JobStatus::Candidate)
    }

    /// Submitted or running.
    pub fn pending(&self) -> Vec<usize> {
        self.status
            .iter()
            .enumerate()
            .filter(|(_, s)| s.is_pending())
            .map(|(id, _)| id)
            .collect()
    }

    pub fn complete(&self) -> Vec<usize> {
        self.ids_with(JobStatus::Complete)
    }

    pub fn broken(&self) -> Vec<usize> {
        self.ids_with(JobStatus::Broken)
    }

    /// Lowest finite complete value and its id.
    pub fn best(&self) -> Option<(usize, f64)> {
        self.complete()
            .into_iter()
            .filter_map(|id| self.values[id].filter(|v| v.is_finite()).map(|v| (id, v)))
            .min_by(|a, b| a.1.total_cmp(&b.1))
    }

    pub fn record(&self, id: usize) -> TuneResult<JobRecord> {
        self.check_id(id)?;
        Ok(JobRecord {
            id,
            point: self.points.row(id).to_vec(),
            status: self.status[id],
            value: self.values[id],
            duration: self.durations[id],
            handle: self.handles[id].clone(),
        })
    }

    /// Decoded parameters of row `id`.
    pub fn params(&self, id: usize) -> TuneResult<Phenotype> {
        self.check_id(id)?;
        let point = self.points.row(id).to_vec();
        Ok(self.space.decode(&point)?)
    }

    pub(crate) fn check_id(&self, id: usize) -> TuneResult<()> {
        if id >= self.len() {
            return Err(StoreError::JobNotFound { id }.into());
        }
        Ok(())
    }
}

/// JSON has no NaN or infinity, and a violated constraint is reported as
/// exactly that. Finite values stay numbers; the rest become strings.
mod tagged_floats {
    use serde::de::Error as _;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    #[derive(Serialize, Deserialize)]
    #[serde(untagged)]
    enum Encoded {
        Number(f64),
        Tag(String),
    }

    fn encode(v: f64) -> Encoded {
        if v.is_nan() {
            Encoded::Tag("nan".into())
        } else if v == f64::INFINITY {
            Encoded::Tag("inf".into())
        } else if v == f64::NEG_INFINITY {
            Encoded::Tag("-inf".into())
        } else {
            Encoded::Number(v)
        }
    }

    fn decode(e: Encoded) -> Result<f64, String> {
        match e {
            Encoded::Number(v) => Ok(v),
            Encoded::Tag(tag) => match tag.as_str() {
                "nan" => Ok(f64::NAN),
                "inf" => Ok(f64::INFINITY),
                "-inf" => Ok(f64::NEG_INFINITY),
                other => Err(format!("unrecognised float tag {other:?}")),
            },
        }
    }

    pub fn serialize<S: Serializer>(values: &[Option<f64>], s: S) -> Result<S::Ok, S::Error> {
        let encoded: Vec<Option<Encoded>> = values.iter().map(|v| v.map(encode)).collect();
        encoded.serialize(s)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<Option<f64>>, D::Error> {
        Vec::<Option<Encoded>>::deserialize(d)?
            .into_iter()
            .map(|v| v.map(decode).transpose())
            .collect::<Result<_, _>>()
            .map_err(D::Error::custom)
    }
}
