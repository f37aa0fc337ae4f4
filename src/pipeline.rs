//! Per-dataset processing state machine.
//!
//! Each dataset goes through download, archive extraction, content checks,
//! optional anonymization, compression and encryption, and final placement
//! under `raw/` and `processed/`. Every step can fail independently; the
//! failure is tagged with a reason so the retry policy can decide whether the
//! dataset is worth another attempt.

use anyhow::{Context, Result};
use dicom_core::{DataElement, PrimitiveValue, Tag, VR};
use dicom_object::open_file;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::process::Command;

use crate::config::{AnonymizationRule, VerifiedLedger};
use crate::state::{squash_whitespace, Item};

/// Failure category of one pipeline attempt. The string tag is what gets
/// persisted and what the retry policy matches against.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureReason {
    StatusCode(u16),
    UnknownHttpError,
    Zip,
    NoDicom,
    ContentRead,
    AnonymizationError,
    ZipCompressionError,
    EncryptionError,
}

impl FailureReason {
    pub fn tag(&self) -> String {
        match self {
            Self::StatusCode(code) => format!("status_code_{code}"),
            Self::UnknownHttpError => "unknown_http_error".to_string(),
            Self::Zip => "zip".to_string(),
            Self::NoDicom => "nodicom".to_string(),
            Self::ContentRead => "content_read".to_string(),
            Self::AnonymizationError => "anonymization_error".to_string(),
            Self::ZipCompressionError => "zip_compression_error".to_string(),
            Self::EncryptionError => "encryption_error".to_string(),
        }
    }
}

/// Terminal outcome of a failed attempt.
#[derive(Debug)]
pub struct Failure {
    pub reason: FailureReason,
    pub message: String,
}

impl Failure {
    pub fn new(reason: FailureReason, message: impl Into<String>) -> Self {
        Self {
            reason,
            message: message.into(),
        }
    }
}

/// Values read out of the downloaded content, fed into the downloaded table.
#[derive(Debug, Default)]
pub struct Observed {
    pub patient_name: Option<String>,
    pub series_description: Option<String>,
    /// `None` when nothing was checked or everything matched, `Some(false)`
    /// on an unconfirmed mismatch, `Some(true)` when the verification ledger
    /// vouches for the mismatching pairing.
    pub verified: Option<bool>,
}

/// Result of one attempt. Infrastructure problems (disk errors and the like)
/// are reported through `anyhow` instead and abort the whole run.
#[derive(Debug)]
pub enum ItemOutcome {
    Completed(Observed),
    Failed(Failure),
}

/// Remote side of the fetch step. Abstracted so the pipeline can be driven
/// against a local stand-in in tests.
pub trait Fetcher {
    /// Download the dataset archive for `sequence_id` into `destination`.
    async fn fetch(&self, sequence_id: &str, destination: &Path) -> Result<(), Failure>;
}

/// Knobs of the per-item pipeline, shared by every dataset of a run.
pub struct PipelineConfig<'a> {
    pub raw_folder: &'a Path,
    pub processed_folder: &'a Path,
    pub anonymization_fields: &'a [AnonymizationRule],
    pub verified_ledger: Option<&'a VerifiedLedger>,
    pub gpg_recipient: Option<&'a str>,
    pub skip_anonymization: bool,
    pub skip_encryption: bool,
    pub keep_intermediate_files: bool,
    pub sevenzip_path: &'a str,
    pub gpg_path: &'a str,
}

/// Carry one dataset through the whole pipeline.
pub async fn process_item<F: Fetcher>(
    fetcher: &F,
    item: &Item,
    config: &PipelineConfig<'_>,
) -> Result<ItemOutcome> {
    let sequence_id = item.sequence_id.as_str();
    let dataset_folder = config.raw_folder.join(sequence_id);
    let download_folder = dataset_folder.join("downloaded_archive");
    fs::create_dir_all(&download_folder)
        .with_context(|| format!("Failed to create {}", download_folder.display()))?;

    // Fetch
    if let Err(failure) = fetcher.fetch(sequence_id, &download_folder).await {
        return Ok(ItemOutcome::Failed(failure));
    }

    // Unpack: exactly one archive is expected per download.
    let zip_files = files_with_extension(&download_folder, "zip")?;
    if zip_files.len() != 1 {
        let listing = list_names(&download_folder)?;
        let message = format!(
            "{} in the output directory {}. Downloaded files: [{}]",
            if zip_files.is_empty() {
                "No zip file was found".to_string()
            } else {
                format!("{} zip files were found", zip_files.len())
            },
            download_folder.display(),
            listing.join(", ")
        );
        return Ok(ItemOutcome::Failed(Failure::new(FailureReason::Zip, message)));
    }
    let dicom_zip = zip_files[0].clone();

    println!("    Extracting {}...", dicom_zip.display());
    let dicom_folder = dataset_folder.join(sequence_id);
    fs::create_dir_all(&dicom_folder)?;
    if let Err(err) = extract_zip(&dicom_zip, &dicom_folder) {
        return Ok(ItemOutcome::Failed(Failure::new(
            FailureReason::Zip,
            format!("Failed to extract {}: {err:#}", dicom_zip.display()),
        )));
    }

    // Content scan
    let dicom_files = files_with_extension(&dicom_folder, "dcm")?;
    if dicom_files.is_empty() {
        return Ok(ItemOutcome::Failed(Failure::new(
            FailureReason::NoDicom,
            format!(
                "No DICOM file was found in the dicom directory {}.",
                dicom_folder.display()
            ),
        )));
    }

    // Verify against the reference metadata, when we have any.
    let mut observed = Observed::default();
    if let (Some(shanoir_name), Some(series_description)) =
        (item.shanoir_name.as_deref(), item.series_description.as_deref())
    {
        println!("    Verifying file {}...", dicom_files[0].display());
        let (patient_name, description) = match read_identity(&dicom_files[0]) {
            Ok(identity) => identity,
            Err(err) => {
                return Ok(ItemOutcome::Failed(Failure::new(
                    FailureReason::ContentRead,
                    format!("Error while reading DICOM: {err:#}"),
                )));
            }
        };

        if patient_name != shanoir_name {
            eprintln!(
                "For dataset {sequence_id}: Shanoir name {shanoir_name} differs in dicom: {patient_name}"
            );
            observed.verified = Some(
                config
                    .verified_ledger
                    .is_some_and(|ledger| ledger.confirms_name(shanoir_name, &patient_name)),
            );
        }
        if squash_whitespace(&description) != squash_whitespace(series_description) {
            eprintln!(
                "For dataset {sequence_id}: Series description {series_description} differs in dicom: {description}"
            );
            let confirmed = observed.verified != Some(false)
                && config.verified_ledger.is_some_and(|ledger| {
                    ledger.confirms_description(sequence_id, series_description, &description)
                });
            observed.verified = Some(confirmed);
        }
        observed.patient_name = Some(patient_name);
        observed.series_description = Some(description);
    }

    // Anonymize and compress
    let mut final_output = dicom_zip.clone();
    let mut anonymized_folder = None;
    let mut compressed_archive = None;
    if !config.skip_anonymization {
        let output_folder = dataset_folder.join(format!("{sequence_id}_anonymized"));
        println!("    Anonymizing dataset to {}...", output_folder.display());
        fs::create_dir_all(&output_folder)?;
        if let Err(err) = anonymize_files(
            config.anonymization_fields,
            &dicom_files,
            &output_folder,
            sequence_id,
            item.patient_id.as_deref(),
        ) {
            return Ok(ItemOutcome::Failed(Failure::new(
                FailureReason::AnonymizationError,
                format!("{err:#}"),
            )));
        }

        let archive = dataset_folder.join(format!("{sequence_id}_anonymized.7z"));
        println!("    Compressing dataset to {}...", archive.display());
        if let Err(failure) = compress_folder(config.sevenzip_path, &output_folder, &archive).await {
            return Ok(ItemOutcome::Failed(failure));
        }
        anonymized_folder = Some(output_folder);
        compressed_archive = Some(archive.clone());
        final_output = archive;
    }

    // Encrypt the latest artifact to the configured recipient.
    let mut encrypted = false;
    if !config.skip_encryption {
        if let Some(recipient) = config.gpg_recipient {
            let encrypted_output = sibling_with_suffix(&final_output, ".gpg");
            println!("    Encrypting dataset to {}...", encrypted_output.display());
            if let Err(failure) =
                encrypt_file(config.gpg_path, recipient, &final_output, &encrypted_output).await
            {
                return Ok(ItemOutcome::Failed(failure));
            }
            final_output = encrypted_output;
            encrypted = true;
        }
    }

    // Place the raw archive and the final artifact, drop intermediates.
    let archived_name = format!(
        "{sequence_id}_{}",
        dicom_zip.file_name().unwrap_or_default().to_string_lossy()
    );
    rename_into(&dicom_zip, &dataset_folder.join(archived_name))?;
    let processed = config.processed_folder.join(sequence_id);
    if final_output != dicom_zip {
        let name = final_output.file_name().unwrap_or_default().to_os_string();
        rename_into(&final_output, &processed.join(name))?;
    }
    if let Some(folder) = anonymized_folder {
        if config.keep_intermediate_files {
            let name = folder.file_name().unwrap_or_default().to_os_string();
            rename_into(&folder, &processed.join(name))?;
            if encrypted {
                if let Some(archive) = &compressed_archive {
                    let name = archive.file_name().unwrap_or_default().to_os_string();
                    rename_into(archive, &processed.join(name))?;
                }
            }
        } else {
            fs::remove_dir_all(&folder)?;
            if encrypted {
                if let Some(archive) = &compressed_archive {
                    fs::remove_file(archive)?;
                }
            }
        }
    }
    if !config.keep_intermediate_files {
        fs::remove_dir_all(&dicom_folder)?;
    }
    fs::remove_dir_all(&download_folder)?;

    Ok(ItemOutcome::Completed(observed))
}

/// Read the identifying fields the verification step compares.
fn read_identity(path: &Path) -> Result<(String, String)> {
    let obj = open_file(path).context("Failed to open DICOM file")?;
    let patient_name = obj
        .element_by_name("PatientName")
        .context("PatientName not found")?
        .to_str()?
        .trim()
        .to_string();
    let series_description = obj
        .element_by_name("SeriesDescription")
        .context("SeriesDescription not found")?
        .to_str()?
        .trim()
        .to_string();
    Ok((patient_name, series_description))
}

/// Rewrite each file with identifying fields stripped. The patient name is
/// replaced by the sequence id, the patient ID by the study-side id when one
/// was supplied; every field of the rule table that exists in the file is
/// blanked, fields a file does not carry are skipped.
fn anonymize_files(
    rules: &[AnonymizationRule],
    dicom_files: &[PathBuf],
    output_folder: &Path,
    sequence_id: &str,
    patient_id: Option<&str>,
) -> Result<()> {
    for dicom_file in dicom_files {
        let mut obj = open_file(dicom_file)
            .with_context(|| format!("Failed to open {}", dicom_file.display()))?;
        // (0010,0010) Patient's Name, (0010,0020) Patient ID
        obj.put(DataElement::new(
            Tag(0x0010, 0x0010),
            VR::PN,
            PrimitiveValue::from(sequence_id),
        ));
        obj.put(DataElement::new(
            Tag(0x0010, 0x0020),
            VR::LO,
            PrimitiveValue::from(patient_id.unwrap_or(sequence_id)),
        ));
        for rule in rules {
            let tag = Tag(rule.group, rule.element);
            let vr = match obj.element(tag) {
                Ok(element) => element.vr(),
                Err(_) => continue,
            };
            obj.put(DataElement::new(tag, vr, PrimitiveValue::Empty));
        }
        let file_name = dicom_file
            .file_name()
            .context("DICOM file without a name")?;
        obj.write_to_file(output_folder.join(file_name))
            .with_context(|| format!("Failed to write anonymized {}", file_name.to_string_lossy()))?;
    }
    Ok(())
}

async fn compress_folder(
    sevenzip_path: &str,
    folder: &Path,
    archive: &Path,
) -> Result<(), Failure> {
    let output = Command::new(sevenzip_path)
        .arg("a")
        .arg(archive)
        .arg(".")
        .current_dir(folder)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
        .await
        .map_err(|err| {
            Failure::new(
                FailureReason::ZipCompressionError,
                format!("Failed to run {sevenzip_path}: {err}"),
            )
        })?;
    if !output.status.success() {
        return Err(Failure::new(
            FailureReason::ZipCompressionError,
            String::from_utf8_lossy(&output.stderr).into_owned(),
        ));
    }
    Ok(())
}

async fn encrypt_file(
    gpg_path: &str,
    recipient: &str,
    input: &Path,
    output_path: &Path,
) -> Result<(), Failure> {
    let output = Command::new(gpg_path)
        .arg("--batch")
        .arg("--yes")
        .arg("--output")
        .arg(output_path)
        .arg("--encrypt")
        .arg("--recipient")
        .arg(recipient)
        .arg("--trust-model")
        .arg("always")
        .arg(input)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
        .await
        .map_err(|err| {
            Failure::new(
                FailureReason::EncryptionError,
                format!("Failed to run {gpg_path}: {err}"),
            )
        })?;
    if !output.status.success() {
        return Err(Failure::new(
            FailureReason::EncryptionError,
            String::from_utf8_lossy(&output.stderr).into_owned(),
        ));
    }
    Ok(())
}

/// Extract every entry of a zip archive under `target_dir`, refusing entries
/// that would escape it.
pub fn extract_zip(zip_path: &Path, target_dir: &Path) -> Result<()> {
    let file = fs::File::open(zip_path)
        .with_context(|| format!("Failed to open {}", zip_path.display()))?;
    let mut archive = zip::ZipArchive::new(file)
        .with_context(|| format!("Failed to read {}", zip_path.display()))?;
    for i in 0..archive.len() {
        let mut entry = archive.by_index(i)?;
        let entry_path = match entry.enclosed_name() {
            Some(path) => target_dir.join(path),
            None => anyhow::bail!("zip entry path traversal detected"),
        };
        if entry.is_dir() {
            fs::create_dir_all(&entry_path)?;
            continue;
        }
        if let Some(parent) = entry_path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut outfile = fs::File::create(&entry_path)?;
        std::io::copy(&mut entry, &mut outfile)?;
    }
    Ok(())
}

/// Non-recursive listing of files with the given extension, sorted by name.
pub fn files_with_extension(dir: &Path, extension: &str) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    for entry in fs::read_dir(dir).with_context(|| format!("Failed to list {}", dir.display()))? {
        let path = entry?.path();
        if path.is_file()
            && path
                .extension()
                .map(|e| e.to_ascii_lowercase() == extension)
                .unwrap_or(false)
        {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}

fn list_names(dir: &Path) -> Result<Vec<String>> {
    let mut names = Vec::new();
    for entry in fs::read_dir(dir)? {
        names.push(entry?.file_name().to_string_lossy().into_owned());
    }
    names.sort();
    Ok(names)
}

fn sibling_with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let name = format!("{}{suffix}", path.file_name().unwrap_or_default().to_string_lossy());
    path.with_file_name(name)
}

fn rename_into(old_path: &Path, new_path: &Path) -> Result<()> {
    if let Some(parent) = new_path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::rename(old_path, new_path).with_context(|| {
        format!(
            "Failed to move {} to {}",
            old_path.display(),
            new_path.display()
        )
    })?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::Item;
    use dicom_object::meta::FileMetaTableBuilder;
    use dicom_object::InMemDicomObject;
    use std::io::Write;
    use tempfile::TempDir;

    fn sample_dicom(patient_name: &str, series_description: &str) -> InMemDicomObject {
        let mut obj = InMemDicomObject::new_empty();
        obj.put(DataElement::new(
            Tag(0x0008, 0x0016),
            VR::UI,
            PrimitiveValue::from("1.2.840.10008.5.1.4.1.1.4"),
        ));
        obj.put(DataElement::new(
            Tag(0x0008, 0x0018),
            VR::UI,
            PrimitiveValue::from("1.2.3.4.5"),
        ));
        obj.put(DataElement::new(
            Tag(0x0010, 0x0010),
            VR::PN,
            PrimitiveValue::from(patient_name),
        ));
        obj.put(DataElement::new(
            Tag(0x0008, 0x103E),
            VR::LO,
            PrimitiveValue::from(series_description),
        ));
        obj
    }

    fn save_dicom(obj: InMemDicomObject, path: &Path) {
        let meta = FileMetaTableBuilder::new()
            .transfer_syntax("1.2.840.10008.1.2.1")
            .media_storage_sop_class_uid("1.2.840.10008.5.1.4.1.1.4")
            .media_storage_sop_instance_uid("1.2.3.4.5");
        obj.with_meta(meta).unwrap().write_to_file(path).unwrap();
    }

    /// Serves one archive containing the DICOM file it was built with.
    struct ArchiveFetcher {
        dicom: PathBuf,
    }

    impl Fetcher for ArchiveFetcher {
        async fn fetch(&self, sequence_id: &str, destination: &Path) -> Result<(), Failure> {
            let bytes = fs::read(&self.dicom).unwrap();
            let file = fs::File::create(destination.join(format!("{sequence_id}.zip"))).unwrap();
            let mut writer = zip::ZipWriter::new(file);
            writer
                .start_file("img.dcm", zip::write::SimpleFileOptions::default())
                .unwrap();
            writer.write_all(&bytes).unwrap();
            writer.finish().unwrap();
            Ok(())
        }
    }

    fn verify_config<'a>(
        raw: &'a Path,
        processed: &'a Path,
        ledger: Option<&'a VerifiedLedger>,
    ) -> PipelineConfig<'a> {
        PipelineConfig {
            raw_folder: raw,
            processed_folder: processed,
            anonymization_fields: &[],
            verified_ledger: ledger,
            gpg_recipient: None,
            skip_anonymization: true,
            skip_encryption: true,
            keep_intermediate_files: false,
            sevenzip_path: "7z",
            gpg_path: "gpg",
        }
    }

    fn reference_item(id: &str) -> Item {
        Item {
            sequence_id: id.into(),
            shanoir_name: Some("sub-01".into()),
            series_description: Some("T1 MPRAGE".into()),
            patient_id: None,
        }
    }

    #[tokio::test]
    async fn metadata_mismatch_without_ledger_is_unverified() {
        let dir = TempDir::new().unwrap();
        let dicom = dir.path().join("src.dcm");
        save_dicom(sample_dicom("OTHER01", "T2 FLAIR"), &dicom);
        let raw = dir.path().join("raw");
        let processed = dir.path().join("processed");
        let config = verify_config(&raw, &processed, None);

        let outcome = process_item(&ArchiveFetcher { dicom }, &reference_item("55"), &config)
            .await
            .unwrap();
        let ItemOutcome::Completed(observed) = outcome else {
            panic!("expected a completed outcome");
        };
        assert_eq!(observed.verified, Some(false));
        assert_eq!(observed.patient_name.as_deref(), Some("OTHER01"));
        assert_eq!(observed.series_description.as_deref(), Some("T2 FLAIR"));
    }

    #[tokio::test]
    async fn ledger_confirmed_mismatch_is_verified() {
        let dir = TempDir::new().unwrap();
        let dicom = dir.path().join("src.dcm");
        save_dicom(sample_dicom("OTHER01", "T2 FLAIR"), &dicom);
        let ledger_path = dir.path().join("verified.tsv");
        fs::write(
            &ledger_path,
            "sequence_id\tshanoir_name\tpatient_name_in_dicom\tseries_description\tseries_description_in_dicom\n\
             55\tsub-01\tOTHER01\tT1 MPRAGE\tT2 FLAIR\n",
        )
        .unwrap();
        let ledger = VerifiedLedger::load(&ledger_path).unwrap();
        let raw = dir.path().join("raw");
        let processed = dir.path().join("processed");
        let config = verify_config(&raw, &processed, Some(&ledger));

        let outcome = process_item(&ArchiveFetcher { dicom }, &reference_item("55"), &config)
            .await
            .unwrap();
        let ItemOutcome::Completed(observed) = outcome else {
            panic!("expected a completed outcome");
        };
        assert_eq!(observed.verified, Some(true));
    }

    #[test]
    fn anonymization_blanks_the_listed_fields() {
        let dir = TempDir::new().unwrap();
        let input = dir.path().join("in.dcm");
        let mut obj = sample_dicom("SUB01", "T1 MPRAGE");
        obj.put(DataElement::new(
            Tag(0x0010, 0x0030),
            VR::DA,
            PrimitiveValue::from("19800101"),
        ));
        obj.put(DataElement::new(
            Tag(0x0008, 0x0080),
            VR::LO,
            PrimitiveValue::from("CHU Rennes"),
        ));
        save_dicom(obj, &input);

        let output_folder = dir.path().join("anon");
        fs::create_dir_all(&output_folder).unwrap();
        let rule = |group, element, name: &str| AnonymizationRule {
            group,
            element,
            field_name: name.into(),
        };
        let rules = vec![
            rule(0x0010, 0x0030, "Patient's Birth Date"),
            rule(0x0008, 0x0080, "Institution Name"),
            // Not present in the file: must be skipped, not an error.
            rule(0x0008, 0x1030, "Study Description"),
        ];
        anonymize_files(&rules, &[input], &output_folder, "999", Some("p-07")).unwrap();

        let anonymized = open_file(output_folder.join("in.dcm")).unwrap();
        let text = |tag| anonymized.element(tag).unwrap().to_str().unwrap().to_string();
        assert_eq!(text(Tag(0x0010, 0x0010)), "999");
        assert_eq!(text(Tag(0x0010, 0x0020)), "p-07");
        assert!(text(Tag(0x0010, 0x0030)).is_empty());
        assert!(text(Tag(0x0008, 0x0080)).is_empty());
        assert!(anonymized.element(Tag(0x0008, 0x1030)).is_err());
    }

    #[test]
    fn reason_tags_match_the_persisted_vocabulary() {
        assert_eq!(FailureReason::StatusCode(404).tag(), "status_code_404");
        assert_eq!(FailureReason::UnknownHttpError.tag(), "unknown_http_error");
        assert_eq!(FailureReason::Zip.tag(), "zip");
        assert_eq!(FailureReason::NoDicom.tag(), "nodicom");
        assert_eq!(FailureReason::ContentRead.tag(), "content_read");
        assert_eq!(FailureReason::AnonymizationError.tag(), "anonymization_error");
        assert_eq!(
            FailureReason::ZipCompressionError.tag(),
            "zip_compression_error"
        );
        assert_eq!(FailureReason::EncryptionError.tag(), "encryption_error");
    }

    #[test]
    fn descriptions_compare_whitespace_insensitively() {
        assert_eq!(squash_whitespace("T1 MPRAGE"), squash_whitespace("T1MPRAGE"));
        assert_ne!(squash_whitespace("T1 MPRAGE"), squash_whitespace("T2MPRAGE"));
    }

    #[test]
    fn extract_zip_unpacks_all_entries() {
        let dir = TempDir::new().unwrap();
        let archive_path = dir.path().join("data.zip");
        let file = fs::File::create(&archive_path).unwrap();
        let mut writer = zip::ZipWriter::new(file);
        let options = zip::write::SimpleFileOptions::default();
        writer.start_file("a.dcm", options).unwrap();
        writer.write_all(b"one").unwrap();
        writer.start_file("b.dcm", options).unwrap();
        writer.write_all(b"two").unwrap();
        writer.finish().unwrap();

        let target = dir.path().join("out");
        fs::create_dir_all(&target).unwrap();
        extract_zip(&archive_path, &target).unwrap();

        let files = files_with_extension(&target, "dcm").unwrap();
        assert_eq!(files.len(), 2);
        assert_eq!(fs::read(&files[0]).unwrap(), b"one");
    }

    #[test]
    fn files_with_extension_ignores_other_files_and_case() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("x.DCM"), b"").unwrap();
        fs::write(dir.path().join("y.dcm"), b"").unwrap();
        fs::write(dir.path().join("notes.txt"), b"").unwrap();
        fs::create_dir(dir.path().join("sub.dcm")).unwrap();

        let files = files_with_extension(dir.path(), "dcm").unwrap();
        let names: Vec<_> = files
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["x.DCM", "y.dcm"]);
    }
}
