//! DICOM to NIfTI conversion over a whole download tree.
//!
//! Every archive found below the root is extracted next to itself and handed
//! to a cascade of converter tools (`dcm2niix`, then `mcverter`). A directory
//! counts as converted once a NIfTI file appeared beside it; the DICOM files
//! are then deleted. Outcomes are appended to `conversion_info.tsv` so an
//! interrupted run picks up where it left off.

use anyhow::{Context, Result};
use std::ffi::OsString;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::process::Command;

use crate::pipeline::extract_zip;

/// Paths of the external converter binaries.
pub struct ConverterTools<'a> {
    pub dcm2niix: &'a str,
    pub mcverter: &'a str,
}

/// One row of `conversion_info.tsv`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConversionRecord {
    pub path: String,
    pub conversion_tool: String,
    pub converted: bool,
}

/// Convert every archive below `dicoms_root`, skipping directories already
/// present in the conversion report.
pub async fn convert_tree(dicoms_root: &Path, tools: &ConverterTools<'_>) -> Result<()> {
    let info_path = dicoms_root.join("conversion_info.tsv");
    let mut records = if info_path.exists() {
        load_conversion_info(&info_path)?
    } else {
        Vec::new()
    };

    let mut dataset_dirs: Vec<PathBuf> = fs::read_dir(dicoms_root)
        .with_context(|| format!("Failed to list {}", dicoms_root.display()))?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|path| path.is_dir())
        .collect();
    dataset_dirs.sort();

    for dataset_dir in dataset_dirs {
        for archive in find_files(&dataset_dir, "zip")? {
            println!("    Extracting {}...", archive.display());
            let dicom_dir = archive.with_extension("");
            fs::create_dir_all(&dicom_dir)?;
            extract_zip(&archive, &dicom_dir)?;
            convert_dicom_directory(&dicom_dir, tools, &mut records, &info_path).await?;
        }
    }
    Ok(())
}

async fn convert_dicom_directory(
    dicom_dir: &Path,
    tools: &ConverterTools<'_>,
    records: &mut Vec<ConversionRecord>,
    info_path: &Path,
) -> Result<()> {
    let parent = dicom_dir
        .parent()
        .context("DICOM directory without a parent")?;
    let parent_key = parent.display().to_string();
    if records.iter().any(|record| record.path == parent_key) {
        return Ok(());
    }

    let parent_arg: OsString = parent.into();
    let dicom_arg: OsString = dicom_dir.into();
    let attempts: [(&str, Vec<OsString>); 2] = [
        (
            tools.dcm2niix,
            vec![
                "-z".into(),
                "y".into(),
                "-o".into(),
                parent_arg.clone(),
                dicom_arg.clone(),
            ],
        ),
        (
            tools.mcverter,
            vec![
                "-o".into(),
                parent_arg.clone(),
                "-f".into(),
                "nifti".into(),
                "-n".into(),
                dicom_arg.clone(),
            ],
        ),
    ];

    let mut conversion_tool = String::new();
    let mut converted = false;
    for (program, args) in &attempts {
        conversion_tool = program.to_string();
        // The exit status alone is not trusted; what counts is whether an
        // output image actually appeared.
        run_tool(program, args).await;
        if !find_files(parent, "gz")?.is_empty() {
            converted = true;
            break;
        }
    }

    if converted {
        fs::remove_dir_all(dicom_dir)
            .with_context(|| format!("Failed to remove {}", dicom_dir.display()))?;
    } else {
        eprintln!("ERROR: could not convert {}", dicom_dir.display());
    }

    records.push(ConversionRecord {
        path: parent_key,
        conversion_tool,
        converted,
    });
    save_conversion_info(info_path, records)?;
    Ok(())
}

async fn run_tool(program: &str, args: &[OsString]) {
    let result = Command::new(program)
        .args(args)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
        .await;
    if let Err(err) = result {
        eprintln!("Failed to run {program}: {err}");
    }
}

pub fn load_conversion_info(path: &Path) -> Result<Vec<ConversionRecord>> {
    let mut rdr = csv::ReaderBuilder::new()
        .delimiter(b'\t')
        .flexible(true)
        .from_path(path)
        .with_context(|| format!("Failed to open {}", path.display()))?;
    let headers = rdr.headers()?.clone();
    let position = |name: &str| headers.iter().position(|h| h == name);
    let path_col = position("path");
    let tool_col = position("conversion_tool");
    let converted_col = position("converted");

    let mut records = Vec::new();
    for result in rdr.records() {
        let record = result?;
        let cell = |i: Option<usize>| i.and_then(|i| record.get(i)).unwrap_or("").trim();
        let path = cell(path_col);
        if path.is_empty() {
            continue;
        }
        records.push(ConversionRecord {
            path: path.to_string(),
            conversion_tool: cell(tool_col).to_string(),
            converted: cell(converted_col).eq_ignore_ascii_case("true"),
        });
    }
    Ok(records)
}

fn save_conversion_info(path: &Path, records: &[ConversionRecord]) -> Result<()> {
    let mut wtr = csv::WriterBuilder::new()
        .delimiter(b'\t')
        .from_path(path)
        .with_context(|| format!("Failed to write {}", path.display()))?;
    wtr.write_record(["path", "conversion_tool", "converted"])?;
    for record in records {
        wtr.write_record([
            record.path.as_str(),
            record.conversion_tool.as_str(),
            if record.converted { "true" } else { "false" },
        ])?;
    }
    wtr.flush()?;
    Ok(())
}

/// Recursive listing of files with the given extension, sorted by path.
pub fn find_files(dir: &Path, extension: &str) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    collect_files(dir, extension, &mut files)?;
    files.sort();
    Ok(files)
}

fn collect_files(dir: &Path, extension: &str, files: &mut Vec<PathBuf>) -> Result<()> {
    for entry in fs::read_dir(dir).with_context(|| format!("Failed to list {}", dir.display()))? {
        let path = entry?.path();
        if path.is_dir() {
            collect_files(&path, extension, files)?;
        } else if path
            .extension()
            .map(|e| e.to_ascii_lowercase() == extension)
            .unwrap_or(false)
        {
            files.push(path);
        }
    }
    Ok(())
}
