//! Remote execution batches.
//!
//! Dataset ids are grouped into batches; each batch becomes one remote
//! execution, submitted with a delay between submissions and polled with
//! backoff until it reaches a terminal status. Outcomes go through the same
//! state store as downloads, keyed by a stable batch id, so an interrupted
//! campaign resubmits only what is not done yet.

use anyhow::{anyhow, bail, Context, Result};
use serde_json::{json, Value};
use std::fs;
use std::path::Path;
use std::time::Duration;

use crate::backoff::Backoff;
use crate::client::ShanoirClient;
use crate::state::{eligible_ids, Item, StateStore};

/// One group of dataset ids submitted as a single execution.
#[derive(Debug, Clone)]
pub struct ExecutionBatch {
    pub dataset_ids: Vec<String>,
}

impl ExecutionBatch {
    /// Stable identifier used as the state-store key for this batch.
    pub fn job_id(&self) -> String {
        self.dataset_ids.join("-")
    }
}

/// Parse the batches file: either an array of id arrays, or an array of
/// objects carrying a `datasetIds` array. Ids may be strings or numbers.
pub fn load_batches(path: &Path) -> Result<Vec<ExecutionBatch>> {
    let file = fs::File::open(path)
        .with_context(|| format!("Failed to open {}", path.display()))?;
    let root: Value = serde_json::from_reader(file)
        .with_context(|| format!("Failed to parse {}", path.display()))?;
    let Some(entries) = root.as_array() else {
        bail!("The batches file must contain a JSON array");
    };

    let mut batches = Vec::new();
    for entry in entries {
        let ids = match entry {
            Value::Array(ids) => ids.as_slice(),
            Value::Object(obj) => obj
                .get("datasetIds")
                .and_then(|v| v.as_array())
                .map(|a| a.as_slice())
                .ok_or_else(|| anyhow!("Batch object without a datasetIds array"))?,
            _ => bail!("Batch entries must be arrays or objects"),
        };
        let dataset_ids: Vec<String> = ids
            .iter()
            .filter_map(|id| match id {
                Value::String(s) => Some(s.clone()),
                Value::Number(n) => Some(n.to_string()),
                _ => None,
            })
            .collect();
        if !dataset_ids.is_empty() {
            batches.push(ExecutionBatch { dataset_ids });
        }
    }
    Ok(batches)
}

/// Terminal-status classification: `Some(true)` finished, `Some(false)`
/// failed or killed, `None` still running.
fn classify_status(status: &str) -> Option<bool> {
    match status {
        "Finished" => Some(true),
        "Killed" | "ExecutionFailed" => Some(false),
        _ => None,
    }
}

/// Spaces submissions out: the first call returns immediately, every later
/// call sleeps the configured delay. Used once per submission attempt, so
/// failed submissions are paced like successful ones.
struct SubmissionPacer {
    delay: Duration,
    submitted_before: bool,
}

impl SubmissionPacer {
    fn new(delay: Duration) -> Self {
        Self {
            delay,
            submitted_before: false,
        }
    }

    async fn pause(&mut self) {
        if self.submitted_before {
            tokio::time::sleep(self.delay).await;
        }
        self.submitted_before = true;
    }
}

pub struct ExecutionOptions {
    /// Pause between two submissions.
    pub delay: Duration,
    /// Backoff schedule for status polling.
    pub backoff: Backoff,
    /// Give up polling one execution after this many status checks.
    pub max_polls: u32,
    pub max_tries: u32,
    pub unrecoverable_reasons: Vec<String>,
}

/// Submit every batch not yet done, then poll each submission to completion.
pub async fn run_executions(
    client: &ShanoirClient,
    template: &Value,
    batches: &[ExecutionBatch],
    store: &mut StateStore,
    options: &ExecutionOptions,
) -> Result<()> {
    let items: Vec<Item> = batches
        .iter()
        .map(|batch| Item::from_id(batch.job_id()))
        .collect();
    let pending = eligible_ids(&items, store, options.max_tries, &options.unrecoverable_reasons);
    println!(
        "{} of {} batches left to submit.",
        pending.len(),
        batches.len()
    );

    let mut pacer = SubmissionPacer::new(options.delay);
    for batch in batches {
        let job_id = batch.job_id();
        if !pending.contains(&job_id) {
            continue;
        }
        pacer.pause().await;
        println!("Submitting execution for datasets [{}]...", batch.dataset_ids.join(", "));

        let mut execution = template.clone();
        if let Some(object) = execution.as_object_mut() {
            object.insert(
                "parametersRessources".into(),
                json!([{ "datasetIds": batch.dataset_ids }]),
            );
        }
        let identifier = match client.create_execution(execution).await {
            Ok(body) => body
                .get("identifier")
                .and_then(|v| v.as_str())
                .map(str::to_string),
            Err(err) => {
                store.record_failure(
                    &job_id,
                    "execution_submission_error",
                    &format!("{err:#}"),
                    &options.unrecoverable_reasons,
                )?;
                continue;
            }
        };
        let Some(identifier) = identifier else {
            store.record_failure(
                &job_id,
                "execution_submission_error",
                "createExecution response without an identifier",
                &options.unrecoverable_reasons,
            )?;
            continue;
        };

        match poll_execution(client, &identifier, options).await? {
            Some(true) => {
                store.record_success(&Item::from_id(job_id), None, None, None)?;
            }
            Some(false) => {
                store.record_failure(
                    &job_id,
                    "execution_failed",
                    &format!("Execution {identifier} failed or was killed"),
                    &options.unrecoverable_reasons,
                )?;
            }
            None => {
                store.record_failure(
                    &job_id,
                    "execution_timeout",
                    &format!("Execution {identifier} still running after {} polls", options.max_polls),
                    &options.unrecoverable_reasons,
                )?;
            }
        }
    }
    Ok(())
}

/// Poll one execution until terminal or out of polls. Transient status-check
/// errors count as a poll and do not abort.
async fn poll_execution(
    client: &ShanoirClient,
    identifier: &str,
    options: &ExecutionOptions,
) -> Result<Option<bool>> {
    for attempt in 0..options.max_polls {
        tokio::time::sleep(options.backoff.delay_for(attempt)).await;
        match client.execution_status(identifier).await {
            Ok(status) => {
                println!("  Execution {identifier}: {status}");
                if let Some(outcome) = classify_status(&status) {
                    return Ok(Some(outcome));
                }
            }
            Err(err) => {
                eprintln!("  Failed to read status of {identifier}: {err:#}");
            }
        }
    }
    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn batches_parse_from_arrays_and_objects() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("batches.json");
        fs::write(
            &path,
            r#"[["1", 2], {"datasetIds": [3, "4"]}, {"datasetIds": []}]"#,
        )
        .unwrap();
        let batches = load_batches(&path).unwrap();
        assert_eq!(batches.len(), 2);
        assert_eq!(batches[0].dataset_ids, vec!["1", "2"]);
        assert_eq!(batches[1].job_id(), "3-4");
    }

    #[test]
    fn object_without_dataset_ids_is_an_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("batches.json");
        fs::write(&path, r#"[{"name": "x"}]"#).unwrap();
        assert!(load_batches(&path).is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn submissions_are_paced_from_the_second_one() {
        let mut pacer = SubmissionPacer::new(Duration::from_millis(500));
        let start = tokio::time::Instant::now();
        pacer.pause().await;
        assert_eq!(start.elapsed(), Duration::ZERO);
        pacer.pause().await;
        assert_eq!(start.elapsed(), Duration::from_millis(500));
        pacer.pause().await;
        assert_eq!(start.elapsed(), Duration::from_millis(1000));
    }

    #[test]
    fn only_finished_is_a_success() {
        assert_eq!(classify_status("Finished"), Some(true));
        assert_eq!(classify_status("Killed"), Some(false));
        assert_eq!(classify_status("ExecutionFailed"), Some(false));
        assert_eq!(classify_status("Running"), None);
        assert_eq!(classify_status(""), None);
    }

    #[test]
    fn done_batches_are_not_resubmitted() {
        let dir = TempDir::new().unwrap();
        let mut store = StateStore::load(
            &dir.path().join("failed_executions.tsv"),
            &dir.path().join("done_executions.tsv"),
            &dir.path().join("raw"),
        )
        .unwrap();
        let batches = vec![
            ExecutionBatch { dataset_ids: vec!["1".into(), "2".into()] },
            ExecutionBatch { dataset_ids: vec!["3".into()] },
        ];
        store
            .record_success(&Item::from_id("1-2"), None, None, None)
            .unwrap();

        let items: Vec<Item> = batches
            .iter()
            .map(|batch| Item::from_id(batch.job_id()))
            .collect();
        let pending = eligible_ids(&items, &store, 3, &[]);
        assert_eq!(pending, vec!["3".to_string()]);
    }
}
