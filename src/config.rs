use anyhow::{anyhow, bail, Context, Result};
use serde::Deserialize;
use serde_json::Value;
use std::collections::HashSet;
use std::fs::{self, File};
use std::path::{Path, PathBuf};

use crate::state::Item;

/// Default runtime configuration file path.
pub const DEFAULT_CONFIG_PATH: &str = "config/shanoir_download_cli.toml";
/// Default Shanoir domain to query.
pub const DEFAULT_DOMAIN: &str = "shanoir.irisa.fr";
/// Default number of attempts before a dataset is given up on.
pub const DEFAULT_MAX_TRIES: u32 = 10;
/// Default request timeout, generous because archives can be heavy.
pub const DEFAULT_TIMEOUT_SECS: u64 = 240;
/// The server reboots nightly; no download is attempted in this hour window.
pub const DEFAULT_SHUTDOWN_HOUR: u32 = 2;
pub const DEFAULT_AVAILABLE_HOUR: u32 = 5;
/// Default SolR page size for searches.
pub const DEFAULT_PAGE_SIZE: usize = 200;

/// Failure reasons that a new attempt cannot fix.
pub fn default_unrecoverable_reasons() -> Vec<String> {
    [
        "status_code_404",
        "anonymization_error",
        "zip_compression_error",
        "encryption_error",
    ]
    .map(str::to_string)
    .to_vec()
}

/// Input rows skipped by default: datasets already sent in a previous campaign.
pub fn default_skip_columns() -> Vec<String> {
    vec!["previously_sent:1".to_string()]
}

#[derive(Deserialize, Default)]
/// Runtime overrides loaded from the TOML config referenced by `main`.
pub struct RuntimeConfigFile {
    pub domain: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub output_folder: Option<PathBuf>,
    pub gpg_recipient: Option<String>,
    pub skip_anonymization: Option<bool>,
    pub skip_encryption: Option<bool>,
    pub keep_intermediate_files: Option<bool>,
    pub max_tries: Option<u32>,
    pub unrecoverable_reasons: Option<Vec<String>>,
    pub skip_columns: Option<Vec<String>>,
    pub shutdown_hour: Option<u32>,
    pub available_hour: Option<u32>,
    pub timeout_secs: Option<u64>,
    pub accept_invalid_certs: Option<bool>,
    pub page_size: Option<usize>,
    pub sevenzip_path: Option<String>,
    pub gpg_path: Option<String>,
    pub dcm2niix_path: Option<String>,
    pub mcverter_path: Option<String>,
    pub anonymization_fields: Option<PathBuf>,
    pub verified_datasets: Option<PathBuf>,
    pub missing_datasets: Option<PathBuf>,
    pub downloaded_datasets: Option<PathBuf>,
}

/// Final configuration used throughout the download workflow.
pub struct EffectiveConfig {
    pub domain: String,
    pub username: String,
    pub password: Option<String>,
    pub output_folder: PathBuf,
    pub gpg_recipient: Option<String>,
    pub skip_anonymization: bool,
    pub skip_encryption: bool,
    pub keep_intermediate_files: bool,
    pub max_tries: u32,
    pub unrecoverable_reasons: Vec<String>,
    pub skip_columns: Vec<String>,
    pub shutdown_hour: u32,
    pub available_hour: u32,
    pub timeout_secs: u64,
    pub accept_invalid_certs: bool,
    pub page_size: usize,
    pub sevenzip_path: String,
    pub gpg_path: String,
    pub dcm2niix_path: String,
    pub mcverter_path: String,
    pub anonymization_fields: Option<PathBuf>,
    pub verified_datasets: Option<PathBuf>,
    pub missing_datasets: Option<PathBuf>,
    pub downloaded_datasets: Option<PathBuf>,
}

impl EffectiveConfig {
    /// Returns the crate-level defaults before CLI/runtime overrides are merged.
    pub fn defaults() -> Self {
        Self {
            domain: DEFAULT_DOMAIN.to_string(),
            username: String::new(),
            password: None,
            output_folder: PathBuf::new(),
            gpg_recipient: None,
            skip_anonymization: false,
            skip_encryption: false,
            keep_intermediate_files: false,
            max_tries: DEFAULT_MAX_TRIES,
            unrecoverable_reasons: default_unrecoverable_reasons(),
            skip_columns: default_skip_columns(),
            shutdown_hour: DEFAULT_SHUTDOWN_HOUR,
            available_hour: DEFAULT_AVAILABLE_HOUR,
            timeout_secs: DEFAULT_TIMEOUT_SECS,
            accept_invalid_certs: false,
            page_size: DEFAULT_PAGE_SIZE,
            sevenzip_path: "7z".to_string(),
            gpg_path: "gpg".to_string(),
            dcm2niix_path: "dcm2niix".to_string(),
            mcverter_path: "mcverter".to_string(),
            anonymization_fields: None,
            verified_datasets: None,
            missing_datasets: None,
            downloaded_datasets: None,
        }
    }

    /// Reject configurations that would only fail later, mid-run.
    pub fn validate(&self) -> Result<()> {
        if self.max_tries < 1 {
            bail!("max_tries must be at least 1");
        }
        if self.shutdown_hour >= 24 || self.available_hour >= 24 {
            bail!("Maintenance window hours must be between 0 and 23");
        }
        if self.shutdown_hour >= self.available_hour {
            bail!("shutdown_hour must be before available_hour");
        }
        if !self.skip_anonymization && self.anonymization_fields.is_none() {
            bail!(
                "Please provide --anonymization-fields to anonymize your datasets \
                 or use --skip-anonymization to skip the anonymization."
            );
        }
        if !self.skip_encryption && self.gpg_recipient.is_none() {
            bail!(
                "Please provide --gpg-recipient to encrypt your archives \
                 or use --skip-encryption to skip the encryption."
            );
        }
        Ok(())
    }
}

/// Attempts to read the runtime config file and deserialize CLI overrides.
///
/// Returns `Ok(None)` when the file is missing so defaults are preserved.
pub fn load_runtime_config(path: Option<&PathBuf>) -> Result<Option<RuntimeConfigFile>> {
    let path = match path {
        Some(path) => path.clone(),
        None => PathBuf::from(DEFAULT_CONFIG_PATH),
    };

    if !path.exists() {
        return Ok(None);
    }

    let content = fs::read_to_string(&path).context("Failed to read runtime config")?;
    let parsed: RuntimeConfigFile =
        toml::from_str(&content).context("Failed to parse runtime config")?;
    Ok(Some(parsed))
}

/// Trims whitespace and drops empty strings when parsing sensitive CLI overrides.
pub fn sanitize_optional_string(value: Option<String>) -> Option<String> {
    value.and_then(|s| {
        let trimmed = s.trim().to_string();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed)
        }
    })
}

/// Reads the dataset list from a CSV/TSV file (with a `sequence_id` column
/// and optional `shanoir_name`, `series_description`, `patient_id` columns)
/// or a JSON array of ids/objects.
///
/// Duplicate ids keep their first row. Rows matching one of the
/// `column:value` pairs in `skip_columns` are dropped.
pub fn parse_input_file(path: &Path, skip_columns: &[String]) -> Result<Vec<Item>> {
    let extension = path.extension().and_then(|s| s.to_str()).unwrap_or("");
    match extension.to_lowercase().as_str() {
        "csv" => parse_delimited(path, b',', skip_columns),
        "tsv" | "txt" => parse_delimited(path, b'\t', skip_columns),
        "json" => parse_json(path),
        _ => Err(anyhow!(
            "Unsupported file extension. Use .csv, .tsv, .txt or .json"
        )),
    }
}

fn parse_delimited(path: &Path, delimiter: u8, skip_columns: &[String]) -> Result<Vec<Item>> {
    let skip_rules: Vec<(String, String)> = skip_columns
        .iter()
        .map(|rule| {
            rule.split_once(':')
                .map(|(col, value)| (col.to_string(), value.to_string()))
                .ok_or_else(|| anyhow!("Invalid skip_columns entry: {rule} (expected column:value)"))
        })
        .collect::<Result<_>>()?;

    let mut rdr = csv::ReaderBuilder::new()
        .delimiter(delimiter)
        .flexible(true)
        .from_path(path)
        .with_context(|| format!("Failed to open {}", path.display()))?;
    let headers = rdr.headers()?.clone();
    let position = |name: &str| headers.iter().position(|h| h == name);
    let id_col = position("sequence_id")
        .ok_or_else(|| anyhow!("The input file must have a sequence_id column"))?;
    let name_col = position("shanoir_name");
    let desc_col = position("series_description");
    let patient_col = position("patient_id");
    let skip_indexed: Vec<(usize, &str)> = skip_rules
        .iter()
        .filter_map(|(col, value)| position(col).map(|i| (i, value.as_str())))
        .collect();

    let mut seen = HashSet::new();
    let mut items = Vec::new();
    for result in rdr.records() {
        let record = result?;
        let cell = |i: Option<usize>| {
            i.and_then(|i| record.get(i))
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
        };
        let Some(sequence_id) = cell(Some(id_col)) else {
            continue;
        };
        if skip_indexed
            .iter()
            .any(|(i, value)| record.get(*i).map(str::trim) == Some(*value))
        {
            continue;
        }
        if !seen.insert(sequence_id.clone()) {
            continue;
        }
        items.push(Item {
            sequence_id,
            shanoir_name: cell(name_col),
            series_description: cell(desc_col),
            patient_id: cell(patient_col),
        });
    }
    Ok(items)
}

fn parse_json(path: &Path) -> Result<Vec<Item>> {
    let file = File::open(path)?;
    let json_value: Value = serde_json::from_reader(file)?;
    let Some(array) = json_value.as_array() else {
        bail!("JSON root must be an array");
    };
    let mut seen = HashSet::new();
    let mut items = Vec::new();
    for value in array {
        let id = match value {
            Value::String(s) => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            Value::Object(obj) => ["sequence_id", "id"]
                .iter()
                .find_map(|key| obj.get(*key))
                .and_then(|v| match v {
                    Value::String(s) => Some(s.clone()),
                    Value::Number(n) => Some(n.to_string()),
                    _ => None,
                }),
            _ => None,
        };
        let Some(sequence_id) = id.filter(|s| !s.trim().is_empty()) else {
            continue;
        };
        if !seen.insert(sequence_id.clone()) {
            continue;
        }
        let field = |key: &str| {
            value
                .get(key)
                .and_then(|v| v.as_str())
                .map(str::to_string)
        };
        items.push(Item {
            sequence_id,
            shanoir_name: field("shanoir_name"),
            series_description: field("series_description"),
            patient_id: field("patient_id"),
        });
    }
    Ok(items)
}

/// One row of the anonymization field table: a DICOM tag to blank.
#[derive(Debug, Clone)]
pub struct AnonymizationRule {
    pub group: u16,
    pub element: u16,
    pub field_name: String,
}

/// Load the anonymization table: a TSV with `Field Name` and `Code` columns,
/// codes written `(gggg,eeee)` in hexadecimal.
pub fn load_anonymization_fields(path: &Path) -> Result<Vec<AnonymizationRule>> {
    let mut rdr = csv::ReaderBuilder::new()
        .delimiter(b'\t')
        .from_path(path)
        .with_context(|| format!("Failed to open {}", path.display()))?;
    let headers = rdr.headers()?.clone();
    let name_col = headers.iter().position(|h| h == "Field Name");
    let code_col = headers
        .iter()
        .position(|h| h == "Code")
        .ok_or_else(|| anyhow!("The anonymization table must have a Code column"))?;

    let mut rules = Vec::new();
    for result in rdr.records() {
        let record = result?;
        let Some(code) = record.get(code_col).map(str::trim).filter(|s| !s.is_empty()) else {
            continue;
        };
        let (group, element) = parse_tag_code(code)
            .with_context(|| format!("Invalid DICOM tag code: {code}"))?;
        rules.push(AnonymizationRule {
            group,
            element,
            field_name: name_col
                .and_then(|i| record.get(i))
                .unwrap_or("")
                .to_string(),
        });
    }
    Ok(rules)
}

fn parse_tag_code(code: &str) -> Result<(u16, u16)> {
    let inner = code
        .strip_prefix('(')
        .and_then(|s| s.strip_suffix(')'))
        .ok_or_else(|| anyhow!("expected (gggg,eeee)"))?;
    let (group, element) = inner
        .split_once(',')
        .ok_or_else(|| anyhow!("expected (gggg,eeee)"))?;
    Ok((
        u16::from_str_radix(group.trim(), 16)?,
        u16::from_str_radix(element.trim(), 16)?,
    ))
}

#[derive(Debug, Clone, Default)]
struct VerifiedRow {
    sequence_id: String,
    shanoir_name: Option<String>,
    patient_name_in_dicom: Option<String>,
    series_description: Option<String>,
    series_description_in_dicom: Option<String>,
}

/// Ledger of expected/observed pairings a human has already checked and
/// accepted; consulted when the downloaded content does not match the
/// reference metadata.
#[derive(Debug, Default)]
pub struct VerifiedLedger {
    rows: Vec<VerifiedRow>,
}

impl VerifiedLedger {
    /// Load the ledger from a CSV/TSV file; the downloaded-datasets table of
    /// a previous run works as-is.
    pub fn load(path: &Path) -> Result<Self> {
        let delimiter = match path.extension().and_then(|s| s.to_str()) {
            Some("csv") => b',',
            _ => b'\t',
        };
        let mut rdr = csv::ReaderBuilder::new()
            .delimiter(delimiter)
            .flexible(true)
            .from_path(path)
            .with_context(|| format!("Failed to open {}", path.display()))?;
        let headers = rdr.headers()?.clone();
        let position = |name: &str| headers.iter().position(|h| h == name);
        let id_col = position("sequence_id");
        let name_col = position("shanoir_name");
        let dicom_name_col = position("patient_name_in_dicom");
        let desc_col = position("series_description");
        let dicom_desc_col = position("series_description_in_dicom");

        let mut rows = Vec::new();
        for result in rdr.records() {
            let record = result?;
            let cell = |i: Option<usize>| {
                i.and_then(|i| record.get(i))
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(str::to_string)
            };
            rows.push(VerifiedRow {
                sequence_id: cell(id_col).unwrap_or_default(),
                shanoir_name: cell(name_col),
                patient_name_in_dicom: cell(dicom_name_col),
                series_description: cell(desc_col),
                series_description_in_dicom: cell(dicom_desc_col),
            });
        }
        Ok(Self { rows })
    }

    /// True when some accepted row pairs this expected name with this
    /// observed patient name.
    pub fn confirms_name(&self, shanoir_name: &str, patient_name_in_dicom: &str) -> bool {
        self.rows.iter().any(|row| {
            row.shanoir_name.as_deref() == Some(shanoir_name)
                && row.patient_name_in_dicom.as_deref() == Some(patient_name_in_dicom)
        })
    }

    /// True when this dataset's expected/observed description pairing was
    /// already accepted.
    pub fn confirms_description(
        &self,
        sequence_id: &str,
        series_description: &str,
        series_description_in_dicom: &str,
    ) -> bool {
        self.rows.iter().any(|row| {
            row.sequence_id == sequence_id
                && row.series_description.as_deref() == Some(series_description)
                && row.series_description_in_dicom.as_deref() == Some(series_description_in_dicom)
        })
    }
}
