//! Driver loop: walks the eligible datasets sequentially, records every
//! outcome in the state store, and repeats until nothing is left to try.

use anyhow::{Context, Result};
use chrono::{DateTime, Local, TimeZone, Timelike};
use colored::Colorize;
use indicatif::{ProgressBar, ProgressStyle};
use std::collections::HashMap;
use std::time::Duration;

use crate::pipeline::{process_item, Fetcher, ItemOutcome, PipelineConfig};
use crate::state::{eligible_ids, Item, StateStore};

/// Daily window during which the server is down for maintenance. No download
/// is attempted between `shutdown_hour` (inclusive) and `available_hour`
/// (exclusive).
#[derive(Debug, Clone, Copy)]
pub struct MaintenanceWindow {
    pub shutdown_hour: u32,
    pub available_hour: u32,
}

impl MaintenanceWindow {
    pub fn new(shutdown_hour: u32, available_hour: u32) -> Self {
        Self {
            shutdown_hour,
            available_hour,
        }
    }

    /// How long to sleep from `now` until the window is over, or `None` when
    /// the window is not active.
    pub fn wait_duration(&self, now: DateTime<Local>) -> Option<Duration> {
        let hour = now.hour();
        if hour < self.shutdown_hour || hour >= self.available_hour {
            return None;
        }
        let reopen = now.date_naive().and_hms_opt(self.available_hour, 0, 0)?;
        let reopen = Local.from_local_datetime(&reopen).single()?;
        (reopen - now).to_std().ok()
    }
}

/// Download every eligible dataset, then recompute eligibility and start
/// over, until the eligible set is empty. Failed datasets are retried on the
/// next pass as long as the retry policy allows it.
pub async fn run_downloads<F: Fetcher>(
    fetcher: &F,
    items: &[Item],
    store: &mut StateStore,
    pipeline: &PipelineConfig<'_>,
    max_tries: u32,
    unrecoverable_reasons: &[String],
    window: Option<&MaintenanceWindow>,
) -> Result<()> {
    let by_id: HashMap<&str, &Item> = items
        .iter()
        .map(|item| (item.sequence_id.as_str(), item))
        .collect();

    loop {
        let ids = eligible_ids(items, store, max_tries, unrecoverable_reasons);
        if ids.is_empty() {
            break;
        }
        println!("Downloading {} datasets...", ids.len());
        let progress = ProgressBar::new(ids.len() as u64);
        progress.set_style(
            ProgressStyle::with_template(
                "[{elapsed_precise}] {bar:40.cyan/blue} {pos}/{len} {msg}",
            )
            .context("Invalid progress bar template")?,
        );

        for id in &ids {
            if let Some(window) = window {
                if let Some(wait) = window.wait_duration(Local::now()) {
                    println!(
                        "The server is in maintenance, waiting {} seconds...",
                        wait.as_secs()
                    );
                    tokio::time::sleep(wait).await;
                }
            }

            let item = by_id
                .get(id.as_str())
                .copied()
                .context("Eligible id without a matching item")?;
            progress.set_message(format!("dataset {id}"));
            println!("  Processing dataset {id}...");

            match process_item(fetcher, item, pipeline).await? {
                ItemOutcome::Completed(observed) => {
                    store.record_success(
                        item,
                        observed.patient_name.as_deref(),
                        observed.series_description.as_deref(),
                        observed.verified,
                    )?;
                }
                ItemOutcome::Failed(failure) => {
                    eprintln!(
                        "{}",
                        format!("  Dataset {id} failed: {}", failure.message).red()
                    );
                    store.record_failure(
                        id,
                        &failure.reason.tag(),
                        &failure.message,
                        unrecoverable_reasons,
                    )?;
                }
            }
            progress.inc(1);
        }
        progress.finish_and_clear();
    }

    print_summary(items, store);
    Ok(())
}

fn print_summary(items: &[Item], store: &StateStore) {
    let downloaded = items
        .iter()
        .filter(|item| store.downloaded().contains_key(&item.sequence_id))
        .count();
    println!(
        "{}",
        format!("{downloaded} of {} datasets downloaded.", items.len()).green()
    );
    if store.missing().is_empty() {
        return;
    }
    println!("{}", "Missing datasets:".red());
    for (id, rec) in store.missing() {
        println!(
            "{}",
            format!("  {id}: {} after {} tries ({})", rec.reason, rec.n_tries, rec.message).red()
        );
    }
}
