//! Ways of evaluating the objective at one decoded point.

use std::fmt;
use std::io::Write;
use std::process::{Command, Stdio};
use std::sync::Arc;
use std::time::Instant;

use bt_types::{ParameterValue, Phenotype, TuneError, TuneResult};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::debug;

/// In-process objective.
pub type ObjectiveFn = Arc<dyn Fn(&Phenotype) -> TuneResult<f64> + Send + Sync>;

/// Result of one evaluation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct JobOutcome {
    pub value: f64,
    /// Wall-clock seconds.
    pub duration: f64,
}

/// Objectives shipped with the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BuiltinObjective {
    /// Branin-Hoo on its usual domain `x1 in [-5, 10]`, `x2 in [0, 15]`.
    /// Reads the first two numeric parameter values in declaration order.
    Branin,
}

/// Global minimum of the Branin function.
pub const BRANIN_MINIMUM: f64 = 0.397_887_357_729_738;

impl BuiltinObjective {
    pub fn evaluate(self, params: &Phenotype) -> TuneResult<f64> {
        match self {
            BuiltinObjective::Branin => {
                let xs = numeric_values(params);
                match xs.as_slice() {
                    [x1, x2, ..] => Ok(branin(*x1, *x2)),
                    _ => Err(TuneError::Evaluation(format!(
                        "branin needs two numeric parameters, got {}",
                        xs.len()
                    ))),
                }
            }
        }
    }
}

pub fn branin(x1: f64, x2: f64) -> f64 {
    use std::f64::consts::PI;
    let b = 5.1 / (4.0 * PI * PI);
    let c = 5.0 / PI;
    let t = 1.0 / (8.0 * PI);
    (x2 - b * x1 * x1 + c * x1 - 6.0).powi(2) + 10.0 * (1.0 - t) * x1.cos() + 10.0
}

fn numeric_values(params: &Phenotype) -> Vec<f64> {
    params
        .parameters
        .iter()
        .flat_map(|p| p.values.iter())
        .filter_map(|v| match v {
            ParameterValue::Int(i) => Some(*i as f64),
            ParameterValue::Real(r) => Some(*r),
            ParameterValue::Categorical(_) => None,
        })
        .collect()
}

/// Decoded parameters as a flat JSON object; single-width parameters map to
/// a scalar, wider ones to an array.
pub fn params_json(params: &Phenotype) -> Value {
    let mut object = Map::new();
    for p in &params.parameters {
        let value = match p.values.as_slice() {
            [single] => serde_json::to_value(single),
            many => serde_json::to_value(many),
        }
        .unwrap_or(Value::Null);
        object.insert(p.name.clone(), value);
    }
    Value::Object(object)
}

/// How a job is evaluated.
#[derive(Clone)]
pub enum JobRunner {
    /// An external program. It receives the decoded parameters as a JSON
    /// object on stdin and prints the objective value as its last line of
    /// output.
    Command { program: String, args: Vec<String> },
    InProcess(ObjectiveFn),
    Builtin(BuiltinObjective),
}

impl fmt::Debug for JobRunner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Command { program, args } => f
                .debug_struct("Command")
                .field("program", program)
                .field("args", args)
                .finish(),
            Self::InProcess(_) => f.write_str("InProcess(..)"),
            Self::Builtin(objective) => f.debug_tuple("Builtin").field(objective).finish(),
        }
    }
}

impl JobRunner {
    pub fn in_process<F>(objective: F) -> Self
    where
        F: Fn(&Phenotype) -> TuneResult<f64> + Send + Sync + 'static,
    {
        Self::InProcess(Arc::new(objective))
    }

    /// Evaluate once. Any failure is reported as [`TuneError::Evaluation`].
    pub fn run(&self, params: &Phenotype) -> TuneResult<JobOutcome> {
        let started = Instant::now();
        let value = match self {
            Self::Command { program, args } => run_command(program, args, params)?,
            Self::InProcess(objective) => objective(params).map_err(|e| match e {
                TuneError::Evaluation(_) => e,
                other => TuneError::Evaluation(other.to_string()),
            })?,
            Self::Builtin(objective) => objective.evaluate(params)?,
        };
        Ok(JobOutcome {
            value,
            duration: started.elapsed().as_secs_f64(),
        })
    }
}

fn run_command(program: &str, args: &[String], params: &Phenotype) -> TuneResult<f64> {
    let failed = |message: String| TuneError::Evaluation(format!("{program}: {message}"));

    let mut child = Command::new(program)
        .args(args)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::inherit())
        .spawn()
        .map_err(|e| failed(format!("failed to start: {e}")))?;
    debug!(program, pid = child.id(), "started job process");

    if let Some(mut stdin) = child.stdin.take() {
        let input = serde_json::to_vec(&params_json(params))?;
        // A program that ignores its input may exit before reading it.
        if let Err(e) = stdin.write_all(&input) {
            debug!(program, error = %e, "job process closed stdin early");
        }
    }

    let output = child
        .wait_with_output()
        .map_err(|e| failed(format!("failed to wait: {e}")))?;
    if !output.status.success() {
        return Err(failed(format!("exited with {}", output.status)));
    }
    let stdout = String::from_utf8_lossy(&output.stdout);
    let last = stdout
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .last()
        .ok_or_else(|| failed("produced no output".to_string()))?;
    last.parse::<f64>()
        .map_err(|_| failed(format!("last line {last:?} is not a number")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use bt_types::{validation_error, DecodedParameter};

    fn phenotype(x1: f64, x2: f64) -> Phenotype {
        Phenotype {
            parameters: vec![
                DecodedParameter {
                    name: "x1".into(),
                    values: vec![ParameterValue::Real(x1)],
                },
                DecodedParameter {
                    name: "x2".into(),
                    values: vec![ParameterValue::Real(x2)],
                },
            ],
        }
    }

    #[test]
    fn branin_minima() {
        use std::f64::consts::PI;
        for (x1, x2) in [(-PI, 12.275), (PI, 2.275), (9.42478, 2.475)] {
            assert!((branin(x1, x2) - BRANIN_MINIMUM).abs() < 1e-5);
        }
        let value = BuiltinObjective::Branin.evaluate(&phenotype(PI, 2.275)).unwrap();
        assert!((value - BRANIN_MINIMUM).abs() < 1e-5);
    }

    #[test]
    fn branin_needs_two_values() {
        let params = Phenotype {
            parameters: vec![DecodedParameter {
                name: "x".into(),
                values: vec![ParameterValue::Real(1.0)],
            }],
        };
        assert!(matches!(
            BuiltinObjective::Branin.evaluate(&params),
            Err(TuneError::Evaluation(_))
        ));
    }

    #[test]
    fn params_json_flattens_single_values() {
        let mut params = phenotype(1.5, 2.0);
        params.parameters.push(DecodedParameter {
            name: "layers".into(),
            values: vec![ParameterValue::Int(2), ParameterValue::Int(3)],
        });
        let json = params_json(&params);
        assert_eq!(json["x1"], serde_json::json!(1.5));
        assert_eq!(json["layers"], serde_json::json!([2, 3]));
    }

    #[test]
    fn in_process_errors_become_evaluation_failures() {
        let runner = JobRunner::in_process(|_| Err(validation_error!("bad input")));
        assert!(matches!(
            runner.run(&phenotype(0.0, 0.0)),
            Err(TuneError::Evaluation(_))
        ));
        let ok = JobRunner::in_process(|p| Ok(p.real("x1").unwrap_or(0.0) * 2.0));
        let outcome = ok.run(&phenotype(1.5, 0.0)).unwrap();
        assert_eq!(outcome.value, 3.0);
        assert!(outcome.duration >= 0.0);
    }

    #[cfg(unix)]
    #[test]
    fn command_reads_last_line_of_output() {
        let runner = JobRunner::Command {
            program: "sh".into(),
            args: vec![
                "-c".into(),
                r#"read params; echo "got $params"; echo 2.5"#.into(),
            ],
        };
        let outcome = runner.run(&phenotype(1.0, 2.0)).unwrap();
        assert_eq!(outcome.value, 2.5);
    }

    #[cfg(unix)]
    #[test]
    fn command_failures_are_evaluation_errors() {
        for script in ["exit 3", "echo not-a-number", "true"] {
            let runner = JobRunner::Command {
                program: "sh".into(),
                args: vec!["-c".into(), script.into()],
            };
            assert!(
                matches!(runner.run(&phenotype(0.0, 0.0)), Err(TuneError::Evaluation(_))),
                "{script}"
            );
        }
        let missing = JobRunner::Command {
            program: "/nonexistent/bt-objective".into(),
            args: Vec::new(),
        };
        assert!(missing.run(&phenotype(0.0, 0.0)).is_err());
    }
}
