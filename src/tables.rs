//! Participants tables and site manifests.
//!
//! This is the only entry point for user-provided tabular data, and it
//! assumes failures are user-input errors: messages name the column and
//! file so the fix is obvious. Files are read through polars' CSV reader
//! with schema inference disabled — every cell arrives as text and the
//! typing rules below are applied explicitly, identically for TSV and CSV.
//!
//! Typing rules for covariate columns:
//! - a column whose non-missing cells all parse as numbers is numeric;
//! - `sex` accepts {M, F, Male, Female, 1, 0} case-insensitively and is
//!   encoded to {1.0, 0.0};
//! - any other text column is categorical, encoded to 0-based label
//!   indices in first-seen order;
//! - missing markers ("", NA, N/A, n/a) are mean-imputed after encoding.

use std::collections::BTreeMap;
use std::fs::File;
use std::path::{Path, PathBuf};

use polars::prelude::*;
use thiserror::Error;

/// Column names accepted as the manifest's image-path column, in
/// precedence order.
const IMAGE_PATH_COLUMNS: [&str; 6] =
    ["image_path", "image", "path", "fa_path", "fa", "fod_path"];

#[derive(Error, Debug)]
pub enum TableError {
    #[error("error from the underlying CSV reader: {0}")]
    Polars(#[from] PolarsError),
    #[error("failed to read table '{path}': {detail}")]
    Io { path: PathBuf, detail: String },
    #[error("required column '{column}' was not found in '{path}'")]
    ColumnNotFound { column: String, path: PathBuf },
    #[error(
        "no image-path column found in '{path}'; expected one of \
         image_path, image, path, fa_path, fa, fod_path"
    )]
    NoImagePathColumn { path: PathBuf },
    #[error("table '{path}' has no data rows")]
    EmptyTable { path: PathBuf },
    #[error("column '{column}' in '{path}' has no usable (non-missing) values")]
    AllMissing { column: String, path: PathBuf },
}

/// Parsed participants table: subject IDs plus numeric covariate columns.
#[derive(Debug, Clone)]
pub struct ParticipantTable {
    pub subject_ids: Vec<String>,
    pub covariates: BTreeMap<String, Vec<f64>>,
}

impl ParticipantTable {
    /// Covariate values for one subject, by ID.
    pub fn covariates_for(&self, subject_id: &str) -> Option<BTreeMap<String, f64>> {
        let row = self.subject_ids.iter().position(|id| id == subject_id)?;
        Some(
            self.covariates
                .iter()
                .map(|(name, values)| (name.clone(), values[row]))
                .collect(),
        )
    }
}

/// Parsed site manifest. Row order is the subject order used for design
/// construction.
#[derive(Debug, Clone)]
pub struct SiteManifest {
    pub subjects: Vec<String>,
    pub sites: Vec<String>,
    pub image_paths: Vec<PathBuf>,
    pub covariates: BTreeMap<String, Vec<f64>>,
}

impl SiteManifest {
    pub fn n_subjects(&self) -> usize {
        self.subjects.len()
    }
}

fn read_all_text(path: &Path, separator: u8) -> Result<DataFrame, TableError> {
    let file = File::open(path).map_err(|e| TableError::Io {
        path: path.to_path_buf(),
        detail: e.to_string(),
    })?;
    let df = CsvReadOptions::default()
        .with_has_header(true)
        // Every column as text; typing is applied by this module.
        .with_infer_schema_length(Some(0))
        .with_parse_options(CsvParseOptions::default().with_separator(separator))
        .into_reader_with_file_handle(file)
        .finish()?;
    if df.height() == 0 {
        return Err(TableError::EmptyTable {
            path: path.to_path_buf(),
        });
    }
    Ok(df)
}

fn column_names(df: &DataFrame) -> Vec<String> {
    df.get_column_names()
        .iter()
        .map(|name| name.to_string())
        .collect()
}

fn text_column(df: &DataFrame, name: &str) -> Result<Vec<Option<String>>, TableError> {
    let series = df.column(name)?;
    let chunked = series.str()?;
    Ok((0..df.height())
        .map(|row| chunked.get(row).map(|s| s.trim().to_string()))
        .collect())
}

fn is_missing(cell: &Option<String>) -> bool {
    match cell {
        None => true,
        Some(text) => is_missing_str(text),
    }
}

fn encode_sex(cell: &str) -> Option<f64> {
    match cell.to_ascii_lowercase().as_str() {
        "m" | "male" | "1" => Some(1.0),
        "f" | "female" | "0" => Some(0.0),
        _ => None,
    }
}

/// Encodes one covariate column to numbers, leaving missing cells as None.
fn encode_column(name: &str, cells: &[Option<String>]) -> Vec<Option<f64>> {
    let present: Vec<&String> = cells.iter().flatten().filter(|c| !is_missing_str(c)).collect();
    let all_numeric = !present.is_empty()
        && present.iter().all(|cell| cell.parse::<f64>().is_ok());

    if all_numeric {
        return cells
            .iter()
            .map(|cell| match cell {
                Some(text) if !is_missing_str(text) => text.parse::<f64>().ok(),
                _ => None,
            })
            .collect();
    }

    if name.eq_ignore_ascii_case("sex") {
        return cells
            .iter()
            .map(|cell| match cell {
                Some(text) if !is_missing_str(text) => encode_sex(text),
                _ => None,
            })
            .collect();
    }

    // Categorical: 0-based codes in first-seen order.
    let mut labels: Vec<String> = Vec::new();
    cells
        .iter()
        .map(|cell| match cell {
            Some(text) if !is_missing_str(text) => {
                let code = match labels.iter().position(|l| l == text) {
                    Some(code) => code,
                    None => {
                        labels.push(text.clone());
                        labels.len() - 1
                    }
                };
                Some(code as f64)
            }
            _ => None,
        })
        .collect()
}

fn is_missing_str(text: &str) -> bool {
    let lower = text.to_ascii_lowercase();
    text.is_empty() || lower == "na" || lower == "n/a"
}

/// Mean-imputes the missing entries of an encoded column.
fn impute_mean(
    encoded: Vec<Option<f64>>,
    column: &str,
    path: &Path,
) -> Result<Vec<f64>, TableError> {
    let present: Vec<f64> = encoded.iter().flatten().copied().collect();
    if present.is_empty() {
        return Err(TableError::AllMissing {
            column: column.to_string(),
            path: path.to_path_buf(),
        });
    }
    let mean = present.iter().sum::<f64>() / present.len() as f64;
    Ok(encoded.into_iter().map(|v| v.unwrap_or(mean)).collect())
}

/// Loads a participants table. The extension picks the dialect: `.csv`
/// means comma-separated with a `subject` ID column, anything else is
/// tab-separated with a `participant_id` ID column.
pub fn load_participants(path: &Path) -> Result<ParticipantTable, TableError> {
    let is_csv = path
        .extension()
        .map(|ext| ext.eq_ignore_ascii_case("csv"))
        .unwrap_or(false);
    let (separator, id_column) = if is_csv {
        (b',', "subject")
    } else {
        (b'\t', "participant_id")
    };

    let df = read_all_text(path, separator)?;
    let names = column_names(&df);
    if !names.iter().any(|n| n == id_column) {
        return Err(TableError::ColumnNotFound {
            column: id_column.to_string(),
            path: path.to_path_buf(),
        });
    }

    let subject_ids: Vec<String> = text_column(&df, id_column)?
        .into_iter()
        .map(|cell| cell.unwrap_or_default())
        .collect();

    let mut covariates = BTreeMap::new();
    for name in names.iter().filter(|n| *n != id_column) {
        let cells = text_column(&df, name)?;
        if cells.iter().all(is_missing) {
            log::warn!("column '{name}' in '{}' is entirely missing; skipped", path.display());
            continue;
        }
        let encoded = encode_column(name, &cells);
        covariates.insert(name.clone(), impute_mean(encoded, name, path)?);
    }

    log::info!(
        "loaded {} participants with {} covariate columns from '{}'",
        subject_ids.len(),
        covariates.len(),
        path.display()
    );
    Ok(ParticipantTable {
        subject_ids,
        covariates,
    })
}

/// Loads a site manifest CSV: `subject`, `site`, one image-path column,
/// covariate columns for everything else.
pub fn load_site_manifest(path: &Path) -> Result<SiteManifest, TableError> {
    let df = read_all_text(path, b',')?;
    let names = column_names(&df);

    for required in ["subject", "site"] {
        if !names.iter().any(|n| n == required) {
            return Err(TableError::ColumnNotFound {
                column: required.to_string(),
                path: path.to_path_buf(),
            });
        }
    }
    let image_column = IMAGE_PATH_COLUMNS
        .iter()
        .find(|candidate| names.iter().any(|n| n == *candidate))
        .ok_or_else(|| TableError::NoImagePathColumn {
            path: path.to_path_buf(),
        })?;

    let subjects: Vec<String> = text_column(&df, "subject")?
        .into_iter()
        .map(|cell| cell.unwrap_or_default())
        .collect();
    let sites: Vec<String> = text_column(&df, "site")?
        .into_iter()
        .map(|cell| cell.unwrap_or_default())
        .collect();
    let image_paths: Vec<PathBuf> = text_column(&df, image_column)?
        .into_iter()
        .map(|cell| PathBuf::from(cell.unwrap_or_default()))
        .collect();

    let mut covariates = BTreeMap::new();
    let reserved = ["subject", "site", *image_column];
    for name in names.iter().filter(|n| !reserved.contains(&n.as_str())) {
        let cells = text_column(&df, name)?;
        if cells.iter().all(is_missing) {
            continue;
        }
        let encoded = encode_column(name, &cells);
        covariates.insert(name.clone(), impute_mean(encoded, name, path)?);
    }

    log::info!(
        "loaded site manifest '{}': {} subjects across {} sites",
        path.display(),
        subjects.len(),
        sites.iter().collect::<std::collections::BTreeSet<_>>().len()
    );
    Ok(SiteManifest {
        subjects,
        sites,
        image_paths,
        covariates,
    })
}
