//! BIDS-like organization of downloaded datasets.
//!
//! A JSON project config lists the subjects and maps Shanoir dataset names to
//! BIDS subdirectories and base names. Each downloaded archive is unpacked,
//! bare NIfTI files are gzipped, and every recognized file is renamed into the
//! subject tree. When the target name is taken, files get `_run-N` suffixes
//! with numbers that only ever grow.

use anyhow::{anyhow, Context, Result};
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};

use crate::client::ShanoirClient;
use crate::pipeline::{extract_zip, files_with_extension};

/// Extensions the organizer knows how to place. Order matters: `.nii.gz`
/// must be tried before `.nii`.
const KNOWN_EXTENSIONS: [&str; 5] = [".nii.gz", ".nii", ".json", ".bval", ".bvec"];

/// Project configuration for one study-to-BIDS download.
#[derive(Debug, Deserialize)]
pub struct BidsConfig {
    pub study_name: String,
    pub subjects: Vec<String>,
    #[serde(rename = "data_to_bids")]
    pub mappings: Vec<BidsMapping>,
}

/// One dataset-name-to-BIDS mapping of the project config.
#[derive(Debug, Deserialize)]
pub struct BidsMapping {
    #[serde(rename = "datasetName")]
    pub dataset_name: String,
    #[serde(rename = "bidsDir")]
    pub bids_dir: String,
    #[serde(rename = "bidsName")]
    pub bids_name: String,
}

pub fn load_bids_config(path: &Path) -> Result<BidsConfig> {
    let file = fs::File::open(path)
        .with_context(|| format!("Failed to open {}", path.display()))?;
    serde_json::from_reader(file)
        .with_context(|| format!("Failed to parse {}", path.display()))
}

/// Download every configured sequence of every subject and organize the
/// results under `download_dir`.
pub async fn download_study(
    client: &ShanoirClient,
    config: &BidsConfig,
    download_dir: &Path,
    page_size: usize,
) -> Result<()> {
    for subject in &config.subjects {
        println!("Downloading subject {subject}...");
        for (index, mapping) in config.mappings.iter().enumerate() {
            println!(
                "  - {} {subject} [{}/{}]",
                mapping.bids_name,
                index + 1,
                config.mappings.len()
            );
            let search_text = format!(
                "studyName:{} AND datasetName:\"{}\" AND subjectName:{subject}",
                config.study_name, mapping.dataset_name
            );
            let items = client.search(&search_text, page_size).await?;
            println!("    {} datasets found", items.len());

            for item in &items {
                let subject_name = item.shanoir_name.as_deref().unwrap_or(subject);
                let subject_id = format!("sub-{subject_name}");
                let bids_data_dir = download_dir.join(&subject_id).join(&mapping.bids_dir);
                let base = format!("{subject_id}_{}", mapping.bids_name);

                let archive_dir = download_dir
                    .join("archives")
                    .join(&item.sequence_id);
                fs::create_dir_all(&archive_dir)?;
                client
                    .download_dataset(&item.sequence_id, &archive_dir)
                    .await
                    .map_err(|failure| {
                        anyhow!(
                            "Failed to download dataset {} ({}): {}",
                            item.sequence_id,
                            failure.reason.tag(),
                            failure.message
                        )
                    })?;
                let archives = files_with_extension(&archive_dir, "zip")?;
                let archive = archives
                    .first()
                    .ok_or_else(|| anyhow!("No archive for dataset {}", item.sequence_id))?;
                organize_archive(archive, &bids_data_dir, &base)?;
                fs::remove_dir_all(&archive_dir)?;
            }
        }
    }
    Ok(())
}

/// Unpack one downloaded archive and move its recognized files into the BIDS
/// tree; the archive is deleted afterwards. Files with an unhandled extension
/// are left in place and reported.
pub fn organize_archive(archive: &Path, bids_data_dir: &Path, base: &str) -> Result<()> {
    let parent = archive.parent().context("Archive without a parent")?;
    let temp_dir = parent.join("temp_archive");
    fs::create_dir_all(&temp_dir)?;
    extract_zip(archive, &temp_dir)?;

    for entry in fs::read_dir(&temp_dir)? {
        let mut path = entry?.path();
        if !path.is_file() {
            continue;
        }
        let name = path.file_name().unwrap_or_default().to_string_lossy().into_owned();
        if name.ends_with(".nii") {
            path = gzip_file(&path)?;
        }
        let name = path.file_name().unwrap_or_default().to_string_lossy().into_owned();
        match split_bids_ext(&name) {
            Some((_, extension)) => {
                place_bids_file(&path, bids_data_dir, base, extension)?;
            }
            None => {
                eprintln!("The extension of {name} is not handled, file skipped");
            }
        }
    }
    fs::remove_dir_all(&temp_dir)?;
    fs::remove_file(archive)?;
    Ok(())
}

/// Split a file name into stem and known BIDS extension; `.nii.gz` counts as
/// one extension.
pub fn split_bids_ext(file_name: &str) -> Option<(&str, &str)> {
    KNOWN_EXTENSIONS
        .iter()
        .find_map(|ext| file_name.strip_suffix(ext).map(|stem| (stem, *ext)))
}

/// Move `source` into `dir` as `{base}{extension}`, resolving collisions with
/// run suffixes:
/// - nothing there yet: the plain name is used;
/// - one plain file there: it is renamed to `_run-1` and the new file becomes
///   `_run-2`;
/// - otherwise the new file gets the next run number, which never reuses a
///   number even after files were removed.
pub fn place_bids_file(source: &Path, dir: &Path, base: &str, extension: &str) -> Result<PathBuf> {
    fs::create_dir_all(dir)?;
    let plain = dir.join(format!("{base}{extension}"));
    let run_path = |n: u32| dir.join(format!("{base}_run-{n}{extension}"));

    let (plain_exists, runs) = existing_runs(dir, base, extension)?;
    let count = runs.len() + usize::from(plain_exists);
    let target = if count == 0 {
        plain
    } else if count == 1 && plain_exists {
        fs::rename(&plain, run_path(1))?;
        run_path(2)
    } else {
        let highest = runs.iter().copied().max().unwrap_or(0);
        run_path(highest.max(count as u32) + 1)
    };
    fs::rename(source, &target).with_context(|| {
        format!("Failed to move {} to {}", source.display(), target.display())
    })?;
    Ok(target)
}

/// Which targets already exist for this base/extension: the plain name, and
/// the run numbers in use.
fn existing_runs(dir: &Path, base: &str, extension: &str) -> Result<(bool, Vec<u32>)> {
    let mut plain_exists = false;
    let mut runs = Vec::new();
    if !dir.exists() {
        return Ok((false, runs));
    }
    for entry in fs::read_dir(dir)? {
        let name = entry?.file_name().to_string_lossy().into_owned();
        let Some(stem) = name.strip_suffix(extension) else {
            continue;
        };
        if stem == base {
            plain_exists = true;
        } else if let Some(run) = stem
            .strip_prefix(base)
            .and_then(|rest| rest.strip_prefix("_run-"))
            .and_then(|n| n.parse().ok())
        {
            runs.push(run);
        }
    }
    Ok((plain_exists, runs))
}

/// Gzip a file in place: `x.nii` becomes `x.nii.gz` and the original is
/// removed.
pub fn gzip_file(path: &Path) -> Result<PathBuf> {
    let name = path.file_name().context("File without a name")?;
    let target = path.with_file_name(format!("{}.gz", name.to_string_lossy()));
    let mut input = fs::File::open(path)
        .with_context(|| format!("Failed to open {}", path.display()))?;
    let output = fs::File::create(&target)?;
    let mut encoder = GzEncoder::new(output, Compression::default());
    std::io::copy(&mut input, &mut encoder)?;
    encoder.finish()?;
    fs::remove_file(path)?;
    Ok(target)
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::read::GzDecoder;
    use std::io::{Read, Write};
    use tempfile::TempDir;

    #[test]
    fn nii_gz_counts_as_one_extension() {
        assert_eq!(split_bids_ext("a.nii.gz"), Some(("a", ".nii.gz")));
        assert_eq!(split_bids_ext("a.nii"), Some(("a", ".nii")));
        assert_eq!(split_bids_ext("a.json"), Some(("a", ".json")));
        assert_eq!(split_bids_ext("a.bval"), Some(("a", ".bval")));
        assert_eq!(split_bids_ext("a.txt"), None);
    }

    fn drop_file(dir: &Path, name: &str) -> PathBuf {
        let path = dir.join(name);
        fs::write(&path, name).unwrap();
        path
    }

    fn names_in(dir: &Path) -> Vec<String> {
        let mut names: Vec<String> = fs::read_dir(dir)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        names
    }

    #[test]
    fn first_file_keeps_the_plain_name() {
        let dir = TempDir::new().unwrap();
        let incoming = drop_file(dir.path(), "incoming.nii.gz");
        let bids = dir.path().join("anat");
        place_bids_file(&incoming, &bids, "sub-01_t1w", ".nii.gz").unwrap();
        assert_eq!(names_in(&bids), vec!["sub-01_t1w.nii.gz"]);
    }

    #[test]
    fn second_file_renames_the_first_to_run_1() {
        let dir = TempDir::new().unwrap();
        let bids = dir.path().join("anat");
        let a = drop_file(dir.path(), "a.nii.gz");
        let b = drop_file(dir.path(), "b.nii.gz");
        place_bids_file(&a, &bids, "sub-01_t1w", ".nii.gz").unwrap();
        place_bids_file(&b, &bids, "sub-01_t1w", ".nii.gz").unwrap();
        assert_eq!(
            names_in(&bids),
            vec!["sub-01_t1w_run-1.nii.gz", "sub-01_t1w_run-2.nii.gz"]
        );
    }

    #[test]
    fn later_files_count_up_from_the_existing_runs() {
        let dir = TempDir::new().unwrap();
        let bids = dir.path().join("anat");
        for name in ["a", "b", "c", "d"] {
            let file = drop_file(dir.path(), &format!("{name}.nii.gz"));
            place_bids_file(&file, &bids, "sub-01_t1w", ".nii.gz").unwrap();
        }
        assert_eq!(
            names_in(&bids),
            vec![
                "sub-01_t1w_run-1.nii.gz",
                "sub-01_t1w_run-2.nii.gz",
                "sub-01_t1w_run-3.nii.gz",
                "sub-01_t1w_run-4.nii.gz",
            ]
        );
    }

    #[test]
    fn run_numbers_are_never_reused_after_a_removal() {
        let dir = TempDir::new().unwrap();
        let bids = dir.path().join("anat");
        fs::create_dir_all(&bids).unwrap();
        drop_file(&bids, "sub-01_t1w_run-1.nii.gz");
        drop_file(&bids, "sub-01_t1w_run-3.nii.gz");

        let incoming = drop_file(dir.path(), "new.nii.gz");
        let placed = place_bids_file(&incoming, &bids, "sub-01_t1w", ".nii.gz").unwrap();
        assert_eq!(
            placed.file_name().unwrap().to_string_lossy(),
            "sub-01_t1w_run-4.nii.gz"
        );
    }

    #[test]
    fn extensions_get_independent_run_numbers() {
        let dir = TempDir::new().unwrap();
        let bids = dir.path().join("anat");
        let nii = drop_file(dir.path(), "a.nii.gz");
        let json = drop_file(dir.path(), "a.json");
        place_bids_file(&nii, &bids, "sub-01_t1w", ".nii.gz").unwrap();
        place_bids_file(&json, &bids, "sub-01_t1w", ".json").unwrap();
        assert_eq!(
            names_in(&bids),
            vec!["sub-01_t1w.json", "sub-01_t1w.nii.gz"]
        );
    }

    #[test]
    fn gzip_replaces_the_file_and_keeps_the_content() {
        let dir = TempDir::new().unwrap();
        let path = drop_file(dir.path(), "image.nii");
        let gz = gzip_file(&path).unwrap();
        assert!(!path.exists());
        assert_eq!(gz.file_name().unwrap().to_string_lossy(), "image.nii.gz");

        let mut decoder = GzDecoder::new(fs::File::open(&gz).unwrap());
        let mut content = String::new();
        decoder.read_to_string(&mut content).unwrap();
        assert_eq!(content, "image.nii");
    }

    #[test]
    fn archives_are_unpacked_gzipped_and_placed() {
        let dir = TempDir::new().unwrap();
        let archive = dir.path().join("1234_dataset.zip");
        let file = fs::File::create(&archive).unwrap();
        let mut writer = zip::ZipWriter::new(file);
        let options = zip::write::SimpleFileOptions::default();
        for (name, content) in [("scan.nii", "voxels"), ("scan.json", "{}"), ("readme.txt", "?")] {
            writer.start_file(name, options).unwrap();
            writer.write_all(content.as_bytes()).unwrap();
        }
        writer.finish().unwrap();

        let bids = dir.path().join("sub-01").join("anat");
        organize_archive(&archive, &bids, "sub-01_t1w").unwrap();

        assert_eq!(
            names_in(&bids),
            vec!["sub-01_t1w.json", "sub-01_t1w.nii.gz"]
        );
        assert!(!archive.exists());
        assert!(!dir.path().join("temp_archive").exists());
    }

    #[test]
    fn project_config_parses_the_original_key_names() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("s2b.json");
        fs::write(
            &path,
            r#"{
                "study_name": "MYSTUDY",
                "subjects": ["01", "02"],
                "data_to_bids": [
                    {"datasetName": "t1 mprage", "bidsDir": "anat", "bidsName": "t1w"}
                ]
            }"#,
        )
        .unwrap();
        let config = load_bids_config(&path).unwrap();
        assert_eq!(config.study_name, "MYSTUDY");
        assert_eq!(config.subjects, vec!["01", "02"]);
        assert_eq!(config.mappings[0].bids_dir, "anat");
        assert_eq!(config.mappings[0].bids_name, "t1w");
    }
}
