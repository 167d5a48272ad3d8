//! Job records and their wire representation.
//!
//! A [`Job`] is published by a producer as one JSON message and decoded by
//! the worker daemon that claims it. The wire map always carries the keys
//! `type`, `id`, `command`, `num_cpus`, `expected_runtime`,
//! `log_file_template`, `output_file` and `batch_id`.

use std::path::{Path, PathBuf};

use chrono::Utc;
use rand::Rng;
use serde::{Deserialize, Deserializer, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{BatchError, Result};

/// `expected_runtime` value meaning "unknown".
pub const UNKNOWN_RUNTIME: f64 = -1.0;

/// `batch_id` given to jobs decoded from producers that never sent one.
pub const NO_BATCH: &str = "None";

pub const DEFAULT_LOG_TEMPLATE: &str = "job_{id}.log";

const MESSAGE_TYPE: &str = "job";
const BATCH_ID_LEN: usize = 10;
const BATCH_ID_CHARSET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";

#[derive(Debug, Clone, PartialEq)]
pub struct Job {
    pub id: String,
    pub batch_id: String,
    /// Executable and arguments, run without a shell
    pub argv: Vec<String>,
    /// Advisory only
    pub num_cpus: u32,
    /// Advisory only, [`UNKNOWN_RUNTIME`] when not given
    pub expected_runtime: f64,
    pub log_file_template: String,
    /// File the job must create; its presence after exit is the success signal
    pub output_file: Option<PathBuf>,
    /// Log path recorded by an earlier daemon, if the message carried one
    pub local_log_file: Option<PathBuf>,
}

impl Job {
    pub fn new(argv: Vec<String>) -> Self {
        Self {
            id: generate_job_id(),
            batch_id: NO_BATCH.to_string(),
            argv,
            num_cpus: 1,
            expected_runtime: UNKNOWN_RUNTIME,
            log_file_template: DEFAULT_LOG_TEMPLATE.to_string(),
            output_file: None,
            local_log_file: None,
        }
    }

    pub fn with_output_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.output_file = Some(path.into());
        self
    }

    pub fn with_log_template(mut self, template: impl Into<String>) -> Self {
        self.log_file_template = template.into();
        self
    }

    pub fn with_num_cpus(mut self, num_cpus: u32) -> Self {
        self.num_cpus = num_cpus;
        self
    }

    pub fn with_expected_runtime(mut self, seconds: f64) -> Self {
        self.expected_runtime = seconds;
        self
    }

    pub fn with_batch_id(mut self, batch_id: impl Into<String>) -> Self {
        self.batch_id = batch_id.into();
        self
    }

    /// Path of the combined stdout/stderr log under `work_dir`.
    ///
    /// `{id}` in the template is replaced by the job id. Only the final path
    /// component of the template is used, so a template cannot point outside
    /// `work_dir`.
    pub fn resolve_log_path(&self, work_dir: &Path) -> PathBuf {
        let rendered = self.log_file_template.replace("{id}", &self.id);
        let file_name = Path::new(&rendered)
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_else(|| format!("job_{}.log", self.id).into());
        work_dir.join(file_name)
    }

    /// The log template with `tag` inserted before the extension of the
    /// rendered file name, so `run.log` becomes `run.<tag>.log`.
    pub fn tagged_log_template(&self, tag: &str) -> String {
        let rendered = self.resolve_log_path(Path::new(""));
        let name = rendered.to_string_lossy();
        match name.rsplit_once('.') {
            Some((stem, ext)) if !stem.is_empty() => format!("{stem}.{tag}.{ext}"),
            _ => format!("{name}.{tag}"),
        }
    }
}

/// Generate a job id by hashing the current time at microsecond resolution.
///
/// Two ids generated within the same microsecond collide.
pub fn generate_job_id() -> String {
    let micros = Utc::now().timestamp_micros();
    let stamp = format!("{:.6}", micros as f64 / 1_000_000.0);
    let digest = Sha256::digest(stamp.as_bytes());
    hex::encode(&digest[..16])
}

/// Random batch id of uppercase letters and digits.
pub fn random_batch_id() -> String {
    let mut rng = rand::thread_rng();
    (0..BATCH_ID_LEN)
        .map(|_| BATCH_ID_CHARSET[rng.gen_range(0..BATCH_ID_CHARSET.len())] as char)
        .collect()
}

#[derive(Debug, Serialize, Deserialize)]
struct WireJob {
    #[serde(rename = "type")]
    kind: String,
    id: String,
    command: Vec<String>,
    #[serde(deserialize_with = "lenient_u32")]
    num_cpus: u32,
    // required key, `null` allowed
    #[serde(deserialize_with = "Option::deserialize")]
    expected_runtime: Option<f64>,
    log_file_template: String,
    #[serde(deserialize_with = "Option::deserialize")]
    output_file: Option<PathBuf>,
    #[serde(default = "no_batch")]
    batch_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    local_log_file: Option<PathBuf>,
}

fn no_batch() -> String {
    NO_BATCH.to_string()
}

/// Older producers sent `num_cpus` as a string or a whole-number float.
fn lenient_u32<'de, D>(deserializer: D) -> std::result::Result<u32, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum NumOrString {
        Num(u32),
        Float(f64),
        Str(String),
    }

    match NumOrString::deserialize(deserializer)? {
        NumOrString::Num(n) => Ok(n),
        NumOrString::Float(f) if f.fract() == 0.0 && (0.0..=u32::MAX as f64).contains(&f) => {
            Ok(f as u32)
        }
        NumOrString::Float(f) => Err(serde::de::Error::custom(format!(
            "num_cpus must be a whole number, got {f}"
        ))),
        NumOrString::Str(s) => s.trim().parse().map_err(serde::de::Error::custom),
    }
}

/// Serialize a job into its wire message.
pub fn encode(job: &Job) -> Result<Vec<u8>> {
    let wire = WireJob {
        kind: MESSAGE_TYPE.to_string(),
        id: job.id.clone(),
        command: job.argv.clone(),
        num_cpus: job.num_cpus,
        expected_runtime: Some(job.expected_runtime),
        log_file_template: job.log_file_template.clone(),
        output_file: job.output_file.clone(),
        batch_id: job.batch_id.clone(),
        local_log_file: job.local_log_file.clone(),
    };
    Ok(serde_json::to_vec(&wire)?)
}

/// Decode a wire message into a job, failing with
/// [`BatchError::MalformedJob`] when required keys are missing.
pub fn decode(body: &[u8]) -> Result<Job> {
    let wire: WireJob = serde_json::from_slice(body)?;
    if wire.kind != MESSAGE_TYPE {
        return Err(BatchError::MalformedJob(format!(
            "unexpected message type '{}'",
            wire.kind
        )));
    }
    if wire.command.is_empty() {
        return Err(BatchError::MalformedJob(format!(
            "job {} has an empty command",
            wire.id
        )));
    }
    Ok(Job {
        id: wire.id,
        batch_id: wire.batch_id,
        argv: wire.command,
        num_cpus: wire.num_cpus,
        expected_runtime: wire.expected_runtime.unwrap_or(UNKNOWN_RUNTIME),
        log_file_template: wire.log_file_template,
        output_file: wire.output_file,
        local_log_file: wire.local_log_file,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample_job() -> Job {
        Job::new(vec!["render".to_string(), "--frame".to_string(), "7".to_string()])
            .with_output_file("/scratch/frame7.png")
            .with_num_cpus(4)
            .with_expected_runtime(120.0)
            .with_batch_id("K3J9X0PQ2A")
    }

    #[test]
    fn encode_decode_round_trip() {
        let job = sample_job();
        let decoded = decode(&encode(&job).unwrap()).unwrap();
        assert_eq!(decoded, job);

        let bare = Job::new(vec!["true".to_string()]);
        assert_eq!(decode(&encode(&bare).unwrap()).unwrap(), bare);
    }

    #[test]
    fn wire_keys() {
        let value: serde_json::Value =
            serde_json::from_slice(&encode(&sample_job()).unwrap()).unwrap();
        let obj = value.as_object().unwrap();
        for key in [
            "type",
            "id",
            "command",
            "num_cpus",
            "expected_runtime",
            "log_file_template",
            "output_file",
            "batch_id",
        ] {
            assert!(obj.contains_key(key), "missing key {key}");
        }
        assert_eq!(obj["type"], "job");
        assert!(!obj.contains_key("local_log_file"));
    }

    #[test]
    fn missing_batch_id_defaults_to_sentinel() {
        let body = json!({
            "type": "job",
            "id": "abc",
            "command": ["echo", "hi"],
            "num_cpus": 1,
            "expected_runtime": -1,
            "log_file_template": "job.log",
            "output_file": null,
        });
        let job = decode(body.to_string().as_bytes()).unwrap();
        assert_eq!(job.batch_id, NO_BATCH);
        assert!(job.output_file.is_none());
        assert!(job.local_log_file.is_none());
    }

    #[test]
    fn prior_log_path_is_kept() {
        let body = json!({
            "type": "job",
            "id": "abc",
            "command": ["echo"],
            "num_cpus": "2",
            "expected_runtime": null,
            "log_file_template": "job.log",
            "output_file": "/tmp/out",
            "batch_id": "B",
            "local_log_file": "/tmp/job.log",
        });
        let job = decode(body.to_string().as_bytes()).unwrap();
        assert_eq!(job.num_cpus, 2);
        assert_eq!(job.expected_runtime, UNKNOWN_RUNTIME);
        assert_eq!(job.local_log_file, Some(PathBuf::from("/tmp/job.log")));
    }

    #[test]
    fn whole_float_cpu_count_is_accepted() {
        let mut value: serde_json::Value =
            serde_json::from_slice(&encode(&sample_job()).unwrap()).unwrap();
        value["num_cpus"] = json!(2.0);
        assert_eq!(decode(value.to_string().as_bytes()).unwrap().num_cpus, 2);

        for bad in [json!(1.5), json!(-2.0)] {
            value["num_cpus"] = bad;
            let err = decode(value.to_string().as_bytes()).unwrap_err();
            assert!(matches!(err, BatchError::MalformedJob(_)), "{err}");
        }
    }

    #[test]
    fn tagged_log_template_keeps_extension() {
        let mut job = Job::new(vec!["true".to_string()]).with_log_template("shared.log");
        job.id = "abc".to_string();
        assert_eq!(job.tagged_log_template("abc"), "shared.abc.log");

        let job = job.with_log_template("run_{id}");
        assert_eq!(job.tagged_log_template("2"), "run_abc.2");
    }

    #[test]
    fn missing_required_key_is_malformed() {
        let body = json!({
            "type": "job",
            "id": "abc",
            "command": ["echo"],
            "num_cpus": 1,
            "expected_runtime": 3,
            "log_file_template": "job.log",
        });
        let err = decode(body.to_string().as_bytes()).unwrap_err();
        assert!(matches!(err, BatchError::MalformedJob(_)), "{err}");
    }

    #[test]
    fn wrong_type_is_malformed() {
        let mut value: serde_json::Value =
            serde_json::from_slice(&encode(&sample_job()).unwrap()).unwrap();
        value["type"] = json!("heartbeat");
        let err = decode(value.to_string().as_bytes()).unwrap_err();
        assert!(matches!(err, BatchError::MalformedJob(_)));
    }

    #[test]
    fn empty_command_is_malformed() {
        let job = Job::new(Vec::new());
        let err = decode(&encode(&job).unwrap()).unwrap_err();
        assert!(matches!(err, BatchError::MalformedJob(_)));
    }

    #[test]
    fn garbage_is_malformed() {
        assert!(matches!(
            decode(b"\x00\x01not json").unwrap_err(),
            BatchError::MalformedJob(_)
        ));
    }

    #[test]
    fn log_path_substitutes_id_and_stays_in_work_dir() {
        let mut job = Job::new(vec!["true".to_string()]);
        job.id = "deadbeef".to_string();
        let work = Path::new("/var/tmp/batchq");
        assert_eq!(
            job.resolve_log_path(work),
            PathBuf::from("/var/tmp/batchq/job_deadbeef.log")
        );

        let job = job.with_log_template("../../etc/{id}.log");
        assert_eq!(
            job.resolve_log_path(work),
            PathBuf::from("/var/tmp/batchq/deadbeef.log")
        );
    }

    #[test]
    fn job_id_shape() {
        let id = generate_job_id();
        assert_eq!(id.len(), 32);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn batch_id_shape() {
        let id = random_batch_id();
        assert_eq!(id.len(), 10);
        assert!(id
            .chars()
            .all(|c| c.is_ascii_uppercase() || c.is_ascii_digit()));
    }
}
