//! Sandboxed execution of problem and indicator containers.
//!
//! One job is one container run: the image is pulled (a local copy serves
//! when the registry is unreachable), the container is started with the job's
//! environment, input records are streamed on stdin one line each, and the
//! last JSON document on stdout is the result. Sandboxing is the container
//! runtime's job entirely; this crate only drives it.

pub mod docker;

pub use docker::DockerRunner;

use async_trait::async_trait;
use serde_json::Value;
use std::collections::BTreeMap;
use std::time::Duration;

/// Configuration of one container run.
#[derive(Debug, Clone)]
pub struct RunConfig {
    pub image: String,
    pub environments: BTreeMap<String, String>,
    /// Argv passed to the container.
    pub command: Vec<String>,
    /// Wall-clock budget for the wait on container exit.
    pub timeout: Duration,
    /// Remove the container after collecting its output.
    pub remove: bool,
}

#[derive(Debug, thiserror::Error)]
pub enum ExecError {
    #[error("failed to connect to the docker daemon")]
    Connect(#[source] bollard::errors::Error),
    #[error("failed to pull image {image}")]
    Pull {
        image: String,
        #[source]
        source: bollard::errors::Error,
    },
    #[error("failed to create container")]
    Create(#[source] bollard::errors::Error),
    #[error("failed to attach to container")]
    Attach(#[source] bollard::errors::Error),
    #[error("failed to start container")]
    Start(#[source] bollard::errors::Error),
    #[error("failed to write to container stdin")]
    Stdin(#[source] std::io::Error),
    #[error("container execution timeout after {0} seconds")]
    Timeout(u64),
    #[error("container exited with status {0}: {1}")]
    Exit(i64, String),
    #[error("error while waiting for the container")]
    Wait(#[source] bollard::errors::Error),
    #[error("failed to read container stdout")]
    Logs(#[source] bollard::errors::Error),
    #[error("failed to remove container")]
    Remove(#[source] bollard::errors::Error),
    #[error("no JSON document found on container stdout")]
    Parse,
    #[error("container reported an error: {0}")]
    Runtime(String),
}

/// Runs one container to completion and returns its decoded output.
#[async_trait]
pub trait ContainerRunner: Send + Sync {
    async fn run(&self, config: &RunConfig, stdin: &[String]) -> Result<Value, ExecError>;
}

/// Decode a container's stdout: scan upward from the last non-empty line and
/// take the first line that parses as a JSON document. Trailing banners or
/// progress noise above the result line are ignored.
pub fn parse_stdout(stdout: &str) -> Option<Value> {
    for line in stdout.lines().rev() {
        if line.trim().is_empty() {
            continue;
        }
        if let Ok(value) = serde_json::from_str(line) {
            return Some(value);
        }
    }
    None
}

/// Clamp a float into its JSON-representable form: the infinities saturate
/// to the largest finite doubles and NaN becomes null.
pub fn float_to_json_float(value: f64) -> Value {
    if value == f64::INFINITY {
        tracing::warn!("f64::INFINITY is converted to f64::MAX");
        Value::from(f64::MAX)
    } else if value == f64::NEG_INFINITY {
        tracing::warn!("f64::NEG_INFINITY is converted to -f64::MAX");
        Value::from(-f64::MAX)
    } else if value.is_nan() {
        tracing::warn!("f64::NAN is converted to null");
        Value::Null
    } else {
        Value::from(value)
    }
}

/// Rebuild `value` with every float leaf passed through
/// [`float_to_json_float`]; everything else is returned unchanged.
pub fn sanitize_floats(value: Value) -> Value {
    match value {
        Value::Array(items) => Value::Array(items.into_iter().map(sanitize_floats).collect()),
        Value::Object(fields) => Value::Object(
            fields
                .into_iter()
                .map(|(k, v)| (k, sanitize_floats(v)))
                .collect(),
        ),
        Value::Number(n) => match n.as_f64() {
            Some(f) if n.is_f64() => float_to_json_float(f),
            _ => Value::Number(n),
        },
        other => other,
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_the_last_non_empty_line() {
        let stdout = "pulling data\n{\"objective\": 1.0}\n{\"objective\": 2.0}\n\n\n";
        assert_eq!(parse_stdout(stdout), Some(json!({"objective": 2.0})));
    }

    #[test]
    fn scans_backwards_past_unparseable_lines() {
        let stdout = "{\"score\": 0.5}\ndone in 3.2s\n";
        assert_eq!(parse_stdout(stdout), Some(json!({"score": 0.5})));
    }

    #[test]
    fn no_parseable_line_is_none() {
        assert_eq!(parse_stdout("warming up\nno json here\n"), None);
        assert_eq!(parse_stdout(""), None);
    }

    #[test]
    fn non_finite_floats_are_clamped() {
        assert_eq!(float_to_json_float(f64::INFINITY), json!(f64::MAX));
        assert_eq!(float_to_json_float(f64::NEG_INFINITY), json!(-f64::MAX));
        assert_eq!(float_to_json_float(f64::NAN), Value::Null);
        assert_eq!(float_to_json_float(0.25), json!(0.25));
    }

    #[test]
    fn sanitize_is_identity_on_finite_values() {
        let value = json!({
            "objective": [1.5, -3],
            "info": {"note": "ok", "flag": true},
            "constraint": null,
        });
        assert_eq!(sanitize_floats(value.clone()), value);
    }
}
