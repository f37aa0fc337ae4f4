//! Persistent bookkeeping for the download pipeline.
//!
//! Two tab-separated tables live next to the downloaded data: one row per
//! failed dataset (`missing_datasets.tsv`) and one row per completed dataset
//! (`downloaded_datasets.tsv`). Both are rewritten after every mutation so a
//! killed run can be resumed without losing track of finished work.

use anyhow::{Context, Result};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

/// One unit of work: a dataset to download, identified by its sequence id.
///
/// The optional fields are reference metadata from the input list, used to
/// cross-check the content actually served by the remote.
#[derive(Debug, Clone, Default)]
pub struct Item {
    pub sequence_id: String,
    pub shanoir_name: Option<String>,
    pub series_description: Option<String>,
    pub patient_id: Option<String>,
}

impl Item {
    pub fn from_id(id: impl Into<String>) -> Self {
        Self {
            sequence_id: id.into(),
            ..Default::default()
        }
    }
}

/// Row of the missing-datasets table.
#[derive(Debug, Clone)]
pub struct MissingRecord {
    pub reason: String,
    pub message: String,
    pub n_tries: u32,
}

/// Row of the downloaded-datasets table.
#[derive(Debug, Clone, Default)]
pub struct DownloadedRecord {
    pub shanoir_name: Option<String>,
    pub series_description: Option<String>,
    pub patient_name_in_dicom: Option<String>,
    pub series_description_in_dicom: Option<String>,
    pub shanoir_name_match: Option<bool>,
    pub series_description_match: Option<bool>,
    pub verified: Option<bool>,
}

const MISSING_HEADER: [&str; 4] = ["sequence_id", "reason", "message", "n_tries"];
const DOWNLOADED_HEADER: [&str; 8] = [
    "sequence_id",
    "shanoir_name",
    "series_description",
    "patient_name_in_dicom",
    "series_description_in_dicom",
    "shanoir_name_match",
    "series_description_match",
    "verified",
];

/// On-disk state store for one run directory.
///
/// An id is present in at most one of the two tables: recording a success
/// removes any failure row for the same id.
pub struct StateStore {
    missing_path: PathBuf,
    downloaded_path: PathBuf,
    raw_folder: PathBuf,
    missing: BTreeMap<String, MissingRecord>,
    downloaded: BTreeMap<String, DownloadedRecord>,
}

impl StateStore {
    /// Load both tables from disk, starting empty for files that do not exist
    /// yet. Tables written by older or newer versions of this tool load fine:
    /// columns are matched by header name and unknown ones are ignored.
    pub fn load(missing_path: &Path, downloaded_path: &Path, raw_folder: &Path) -> Result<Self> {
        let missing = if missing_path.exists() {
            read_missing_table(missing_path)
                .with_context(|| format!("Failed to load {}", missing_path.display()))?
        } else {
            BTreeMap::new()
        };
        let downloaded = if downloaded_path.exists() {
            read_downloaded_table(downloaded_path)
                .with_context(|| format!("Failed to load {}", downloaded_path.display()))?
        } else {
            BTreeMap::new()
        };
        Ok(Self {
            missing_path: missing_path.to_path_buf(),
            downloaded_path: downloaded_path.to_path_buf(),
            raw_folder: raw_folder.to_path_buf(),
            missing,
            downloaded,
        })
    }

    pub fn missing(&self) -> &BTreeMap<String, MissingRecord> {
        &self.missing
    }

    pub fn downloaded(&self) -> &BTreeMap<String, DownloadedRecord> {
        &self.downloaded
    }

    /// Record a failed attempt for `sequence_id`, persisting the table before
    /// returning. Repeated failures update the reason/message in place and
    /// bump the try counter.
    ///
    /// The partially-downloaded working directory is wiped so the next attempt
    /// starts clean, except for unrecoverable reasons where it is kept for
    /// postmortem (those ids are never retried anyway).
    pub fn record_failure(
        &mut self,
        sequence_id: &str,
        reason: &str,
        message: &str,
        unrecoverable_reasons: &[String],
    ) -> Result<()> {
        match self.missing.get_mut(sequence_id) {
            Some(rec) => {
                rec.reason = reason.to_string();
                rec.message = message.to_string();
                rec.n_tries += 1;
            }
            None => {
                self.missing.insert(
                    sequence_id.to_string(),
                    MissingRecord {
                        reason: reason.to_string(),
                        message: message.to_string(),
                        n_tries: 1,
                    },
                );
            }
        }
        self.persist_missing()?;

        let workdir = self.raw_folder.join(sequence_id);
        if workdir.exists() && !unrecoverable_reasons.iter().any(|r| r == reason) {
            fs::remove_dir_all(&workdir)
                .with_context(|| format!("Failed to clean {}", workdir.display()))?;
        }
        Ok(())
    }

    /// Record a completed dataset. A second call for the same id is a no-op.
    ///
    /// Match flags compare the reference metadata of `item` against the
    /// values observed in the downloaded content, ignoring case and
    /// whitespace. The downloaded table is persisted before the failure row
    /// is dropped, so a crash in between re-processes nothing that finished.
    pub fn record_success(
        &mut self,
        item: &Item,
        patient_name_in_dicom: Option<&str>,
        series_description_in_dicom: Option<&str>,
        verified: Option<bool>,
    ) -> Result<()> {
        if self.downloaded.contains_key(&item.sequence_id) {
            return Ok(());
        }
        let record = DownloadedRecord {
            shanoir_name: item.shanoir_name.clone(),
            series_description: item.series_description.clone(),
            patient_name_in_dicom: patient_name_in_dicom.map(str::to_string),
            series_description_in_dicom: series_description_in_dicom.map(str::to_string),
            shanoir_name_match: match_flag(item.shanoir_name.as_deref(), patient_name_in_dicom),
            series_description_match: match_flag(
                item.series_description.as_deref(),
                series_description_in_dicom,
            ),
            verified,
        };
        self.downloaded.insert(item.sequence_id.clone(), record);
        self.persist_downloaded()?;

        if self.missing.remove(&item.sequence_id).is_some() {
            self.persist_missing()?;
        }
        Ok(())
    }

    fn persist_missing(&self) -> Result<()> {
        replace_table(&self.missing_path, |wtr| {
            wtr.write_record(MISSING_HEADER)?;
            for (id, rec) in &self.missing {
                wtr.write_record([
                    id.as_str(),
                    rec.reason.as_str(),
                    rec.message.as_str(),
                    &rec.n_tries.to_string(),
                ])?;
            }
            Ok(())
        })
    }

    fn persist_downloaded(&self) -> Result<()> {
        replace_table(&self.downloaded_path, |wtr| {
            wtr.write_record(DOWNLOADED_HEADER)?;
            for (id, rec) in &self.downloaded {
                wtr.write_record([
                    id.as_str(),
                    rec.shanoir_name.as_deref().unwrap_or(""),
                    rec.series_description.as_deref().unwrap_or(""),
                    rec.patient_name_in_dicom.as_deref().unwrap_or(""),
                    rec.series_description_in_dicom.as_deref().unwrap_or(""),
                    &format_flag(rec.shanoir_name_match),
                    &format_flag(rec.series_description_match),
                    &format_flag(rec.verified),
                ])?;
            }
            Ok(())
        })
    }
}

/// Ids still worth attempting: everything not yet downloaded, minus ids that
/// exhausted their tries and ids whose last failure is unrecoverable. The
/// result keeps the enumeration order of `items` so reruns are reproducible.
pub fn eligible_ids(
    items: &[Item],
    store: &StateStore,
    max_tries: u32,
    unrecoverable_reasons: &[String],
) -> Vec<String> {
    items
        .iter()
        .map(|item| &item.sequence_id)
        .filter(|id| !store.downloaded().contains_key(*id))
        .filter(|id| match store.missing().get(*id) {
            Some(rec) => {
                rec.n_tries < max_tries && !unrecoverable_reasons.iter().any(|r| *r == rec.reason)
            }
            None => true,
        })
        .cloned()
        .collect()
}

/// Remove all whitespace from a string; series descriptions are compared in
/// this form because the server and the DICOM headers disagree on spacing.
pub fn squash_whitespace(s: &str) -> String {
    s.chars().filter(|c| !c.is_whitespace()).collect()
}

fn normalized_eq(a: &str, b: &str) -> bool {
    squash_whitespace(a).eq_ignore_ascii_case(&squash_whitespace(b))
}

fn match_flag(expected: Option<&str>, observed: Option<&str>) -> Option<bool> {
    match (expected, observed) {
        (Some(e), Some(o)) => Some(normalized_eq(e, o)),
        _ => None,
    }
}

fn format_flag(flag: Option<bool>) -> String {
    match flag {
        Some(true) => "true".to_string(),
        Some(false) => "false".to_string(),
        None => String::new(),
    }
}

fn parse_flag(field: &str) -> Option<bool> {
    match field.trim().to_ascii_lowercase().as_str() {
        "true" | "1" => Some(true),
        "false" | "0" => Some(false),
        _ => None,
    }
}

/// Rewrite a table through a temp file and rename, so a crash mid-write never
/// leaves a truncated table behind.
fn replace_table(
    path: &Path,
    write: impl FnOnce(&mut csv::Writer<fs::File>) -> Result<()>,
) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let tmp = path.with_extension("tsv.tmp");
    let mut wtr = csv::WriterBuilder::new()
        .delimiter(b'\t')
        .from_path(&tmp)
        .with_context(|| format!("Failed to write {}", tmp.display()))?;
    write(&mut wtr)?;
    wtr.flush()?;
    drop(wtr);
    fs::rename(&tmp, path).with_context(|| format!("Failed to replace {}", path.display()))?;
    Ok(())
}

fn column_index(headers: &csv::StringRecord, name: &str) -> Option<usize> {
    headers.iter().position(|h| h == name)
}

fn field<'r>(record: &'r csv::StringRecord, index: Option<usize>) -> Option<&'r str> {
    index
        .and_then(|i| record.get(i))
        .map(str::trim)
        .filter(|s| !s.is_empty())
}

fn read_missing_table(path: &Path) -> Result<BTreeMap<String, MissingRecord>> {
    let mut rdr = csv::ReaderBuilder::new()
        .delimiter(b'\t')
        .flexible(true)
        .from_path(path)?;
    let headers = rdr.headers()?.clone();
    let id_col = column_index(&headers, "sequence_id");
    let reason_col = column_index(&headers, "reason");
    let message_col = column_index(&headers, "message");
    let tries_col = column_index(&headers, "n_tries");

    let mut table = BTreeMap::new();
    for result in rdr.records() {
        let record = result?;
        let Some(id) = field(&record, id_col) else {
            continue;
        };
        table.insert(
            id.to_string(),
            MissingRecord {
                reason: field(&record, reason_col).unwrap_or("").to_string(),
                message: field(&record, message_col).unwrap_or("").to_string(),
                n_tries: field(&record, tries_col)
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(1),
            },
        );
    }
    Ok(table)
}

fn read_downloaded_table(path: &Path) -> Result<BTreeMap<String, DownloadedRecord>> {
    let mut rdr = csv::ReaderBuilder::new()
        .delimiter(b'\t')
        .flexible(true)
        .from_path(path)?;
    let headers = rdr.headers()?.clone();
    let id_col = column_index(&headers, "sequence_id");
    let name_col = column_index(&headers, "shanoir_name");
    let desc_col = column_index(&headers, "series_description");
    let dicom_name_col = column_index(&headers, "patient_name_in_dicom");
    let dicom_desc_col = column_index(&headers, "series_description_in_dicom");
    let name_match_col = column_index(&headers, "shanoir_name_match");
    let desc_match_col = column_index(&headers, "series_description_match");
    let verified_col = column_index(&headers, "verified");

    let mut table = BTreeMap::new();
    for result in rdr.records() {
        let record = result?;
        let Some(id) = field(&record, id_col) else {
            continue;
        };
        table.insert(
            id.to_string(),
            DownloadedRecord {
                shanoir_name: field(&record, name_col).map(str::to_string),
                series_description: field(&record, desc_col).map(str::to_string),
                patient_name_in_dicom: field(&record, dicom_name_col).map(str::to_string),
                series_description_in_dicom: field(&record, dicom_desc_col).map(str::to_string),
                shanoir_name_match: field(&record, name_match_col).and_then(parse_flag),
                series_description_match: field(&record, desc_match_col).and_then(parse_flag),
                verified: field(&record, verified_col).and_then(parse_flag),
            },
        );
    }
    Ok(table)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn store_in(dir: &TempDir) -> StateStore {
        StateStore::load(
            &dir.path().join("missing_datasets.tsv"),
            &dir.path().join("downloaded_datasets.tsv"),
            &dir.path().join("raw"),
        )
        .unwrap()
    }

    fn named_item(id: &str, name: &str, desc: &str) -> Item {
        Item {
            sequence_id: id.into(),
            shanoir_name: Some(name.into()),
            series_description: Some(desc.into()),
            patient_id: None,
        }
    }

    #[test]
    fn success_recording_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let mut store = store_in(&dir);
        let item = Item::from_id("101");
        store
            .record_success(&item, Some("p"), Some("d"), Some(true))
            .unwrap();
        store.record_success(&item, None, None, None).unwrap();

        assert_eq!(store.downloaded().len(), 1);
        // The first record wins.
        assert_eq!(
            store.downloaded()["101"].patient_name_in_dicom.as_deref(),
            Some("p")
        );
    }

    #[test]
    fn success_removes_failure_row() {
        let dir = TempDir::new().unwrap();
        let mut store = store_in(&dir);
        store.record_failure("7", "zip", "two archives", &[]).unwrap();
        assert!(store.missing().contains_key("7"));

        store
            .record_success(&Item::from_id("7"), None, None, None)
            .unwrap();
        assert!(!store.missing().contains_key("7"));
        assert!(store.downloaded().contains_key("7"));
    }

    #[test]
    fn repeated_failures_bump_try_count_and_overwrite_reason() {
        let dir = TempDir::new().unwrap();
        let mut store = store_in(&dir);
        store.record_failure("9", "zip", "first", &[]).unwrap();
        store
            .record_failure("9", "nodicom", "second", &[])
            .unwrap();

        let rec = &store.missing()["9"];
        assert_eq!(rec.n_tries, 2);
        assert_eq!(rec.reason, "nodicom");
        assert_eq!(rec.message, "second");
    }

    #[test]
    fn recoverable_failure_cleans_workdir_unrecoverable_keeps_it() {
        let dir = TempDir::new().unwrap();
        let raw = dir.path().join("raw");
        fs::create_dir_all(raw.join("a")).unwrap();
        fs::create_dir_all(raw.join("b")).unwrap();

        let mut store = store_in(&dir);
        let unrecoverable = vec!["status_code_404".to_string()];
        store.record_failure("a", "zip", "msg", &unrecoverable).unwrap();
        store
            .record_failure("b", "status_code_404", "msg", &unrecoverable)
            .unwrap();

        assert!(!raw.join("a").exists());
        assert!(raw.join("b").exists());
    }

    #[test]
    fn eligible_excludes_downloaded_exhausted_and_unrecoverable() {
        let dir = TempDir::new().unwrap();
        let mut store = store_in(&dir);
        let items: Vec<Item> = ["1", "2", "3", "4"].map(Item::from_id).to_vec();
        let unrecoverable = vec!["status_code_404".to_string()];

        store
            .record_success(&Item::from_id("1"), None, None, None)
            .unwrap();
        for _ in 0..3 {
            store.record_failure("2", "zip", "m", &unrecoverable).unwrap();
        }
        store
            .record_failure("3", "status_code_404", "m", &unrecoverable)
            .unwrap();

        let ids = eligible_ids(&items, &store, 3, &unrecoverable);
        assert_eq!(ids, vec!["4".to_string()]);
    }

    #[test]
    fn unrecoverable_excluded_even_on_first_try() {
        let dir = TempDir::new().unwrap();
        let mut store = store_in(&dir);
        let items = vec![Item::from_id("x")];
        let unrecoverable = vec!["encryption_error".to_string()];
        store
            .record_failure("x", "encryption_error", "m", &unrecoverable)
            .unwrap();
        assert_eq!(store.missing()["x"].n_tries, 1);
        assert!(eligible_ids(&items, &store, 10, &unrecoverable).is_empty());
    }

    #[test]
    fn eligible_keeps_item_order() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir);
        let items: Vec<Item> = ["30", "4", "200"].map(Item::from_id).to_vec();
        let ids = eligible_ids(&items, &store, 3, &[]);
        assert_eq!(ids, vec!["30", "4", "200"]);
    }

    #[test]
    fn tables_survive_reload() {
        let dir = TempDir::new().unwrap();
        {
            let mut store = store_in(&dir);
            store.record_failure("5", "zip", "bad\tarchive", &[]).unwrap();
            store
                .record_success(
                    &named_item("6", "sub-01", "T1 MPRAGE"),
                    Some("sub-01"),
                    Some("T1MPRAGE"),
                    Some(true),
                )
                .unwrap();
        }
        let store = store_in(&dir);
        assert_eq!(store.missing()["5"].reason, "zip");
        assert_eq!(store.missing()["5"].n_tries, 1);
        let rec = &store.downloaded()["6"];
        assert_eq!(rec.shanoir_name_match, Some(true));
        assert_eq!(rec.series_description_match, Some(true));
        assert_eq!(rec.verified, Some(true));
    }

    #[test]
    fn loads_tables_with_extra_and_missing_columns() {
        let dir = TempDir::new().unwrap();
        let downloaded = dir.path().join("downloaded_datasets.tsv");
        // Older run: fewer columns plus one this version does not know.
        fs::write(
            &downloaded,
            "sequence_id\tshanoir_name\tpreviously_sent\n42\tsub-02\t1\n",
        )
        .unwrap();
        let store = store_in(&dir);
        let rec = &store.downloaded()["42"];
        assert_eq!(rec.shanoir_name.as_deref(), Some("sub-02"));
        assert_eq!(rec.verified, None);
    }

    #[test]
    fn match_flags_ignore_case_and_whitespace() {
        let dir = TempDir::new().unwrap();
        let mut store = store_in(&dir);
        store
            .record_success(
                &named_item("8", "Sub 01", "t2 flair"),
                Some("SUB01"),
                Some("T2FLAIR"),
                None,
            )
            .unwrap();
        let rec = &store.downloaded()["8"];
        assert_eq!(rec.shanoir_name_match, Some(true));
        assert_eq!(rec.series_description_match, Some(true));
    }
}
