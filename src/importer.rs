//! Bulk import into a fresh store
//!
//! Two source formats:
//!
//! - **Tree files**: a flat array of fixed-size node records as written by
//!   annoy-style forest builders. Only leaf records (`n_descendants == 1`)
//!   carry a vector.
//! - **CSV**: one `key,c0,c1,...` row per vector.
//!
//! Both journal every vector through `Store::add_item` and finish with a
//! single `apply`. The store is built under `<target>.importing` and renamed
//! into place only once that apply succeeds; a failed import removes the
//! staging directory and leaves `target` untouched.

use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::str::FromStr;

use memmap2::Mmap;
use serde::Serialize;

use crate::config::{StoreConfig, StoreManifest};
use crate::error::{Result, StoreError};
use crate::fsutil::sync_parent;
use crate::store::{ApplyReport, Store};

/// Component byte order of a tree file
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ByteOrder {
    #[default]
    Little,
    Big,
}

impl FromStr for ByteOrder {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "little" | "le" => Ok(ByteOrder::Little),
            "big" | "be" => Ok(ByteOrder::Big),
            other => Err(format!("unknown byte order '{other}' (expected little or big)")),
        }
    }
}

/// Component width of a tree file
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Element {
    #[default]
    F64,
    F32,
}

impl Element {
    pub fn width(self) -> usize {
        match self {
            Element::F64 => 8,
            Element::F32 => 4,
        }
    }
}

impl FromStr for Element {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "f64" | "double" => Ok(Element::F64),
            "f32" | "float" => Ok(Element::F32),
            other => Err(format!("unknown element type '{other}' (expected f64 or f32)")),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ImportOptions {
    pub config: StoreConfig,
    pub byte_order: ByteOrder,
    pub element: Element,
    /// CSV of `positional_index,external_key` rows (tree imports only)
    pub mapping: Option<PathBuf>,
}

impl ImportOptions {
    pub fn new(config: StoreConfig) -> Self {
        Self {
            config,
            byte_order: ByteOrder::default(),
            element: Element::default(),
            mapping: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ImportReport {
    pub imported: u64,
    /// Non-leaf tree records
    pub skipped_nodes: u64,
    pub apply: ApplyReport,
}

pub trait Importer {
    /// Create a store at `target` and fill it from `source`.
    fn import(&self, source: &Path, target: &Path) -> Result<ImportReport>;
}

/// Pick an importer by file extension: `.csv` is CSV, anything else a tree file.
pub fn importer_for(path: &Path, options: ImportOptions) -> Box<dyn Importer> {
    let is_csv = path
        .extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case("csv"));
    if is_csv {
        Box::new(CsvImporter { options })
    } else {
        Box::new(TreeImporter { options })
    }
}

/// Suffix of the directory an import builds into before it is renamed
pub const STAGING_SUFFIX: &str = ".importing";

pub fn staging_path(target: &Path) -> PathBuf {
    let mut name = target.components().as_path().as_os_str().to_owned();
    name.push(STAGING_SUFFIX);
    PathBuf::from(name)
}

/// Build a store in the staging directory with `fill`, then move it to
/// `target`.
fn import_staged<F>(target: &Path, config: &StoreConfig, fill: F) -> Result<ImportReport>
where
    F: FnOnce(&Store) -> Result<ImportReport>,
{
    if StoreManifest::exists(target) {
        return Err(StoreError::AlreadyExists(target.to_path_buf()));
    }
    let staging = staging_path(target);
    if staging.exists() {
        tracing::warn!("removing leftover import directory {}", staging.display());
        fs::remove_dir_all(&staging)?;
    }

    let built = Store::create(&staging, config.clone()).and_then(|store: Store| fill(&store));
    let report = match built {
        Ok(report) => report,
        Err(err) => {
            if let Err(cleanup) = fs::remove_dir_all(&staging) {
                tracing::error!("failed to remove {}: {}", staging.display(), cleanup);
            }
            return Err(err);
        }
    };

    if let Err(err) = fs::rename(&staging, target) {
        if let Err(cleanup) = fs::remove_dir_all(&staging) {
            tracing::error!("failed to remove {}: {}", staging.display(), cleanup);
        }
        return Err(err.into());
    }
    sync_parent(target)?;

    tracing::info!(
        "import into {} complete: {} vectors, {} non-leaf nodes skipped",
        target.display(),
        report.imported,
        report.skipped_nodes
    );
    Ok(report)
}

/// Load a `positional_index,external_key` mapping file.
pub fn load_mapping(path: &Path) -> Result<HashMap<u64, u64>> {
    let reader = BufReader::new(File::open(path)?);
    let mut map = HashMap::new();
    for (idx, line) in reader.lines().enumerate() {
        let line = line?;
        let line_no = idx + 1;
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        let fields: Vec<&str> = trimmed.split(',').map(str::trim).collect();
        if fields.len() != 2 {
            return Err(StoreError::Parse {
                line: line_no,
                message: format!("expected 2 columns, found {}", fields.len()),
            });
        }
        let index = parse_u64(fields[0], line_no, "index")?;
        let key = parse_u64(fields[1], line_no, "key")?;
        map.insert(index, key);
    }
    Ok(map)
}

fn parse_u64(field: &str, line: usize, what: &str) -> Result<u64> {
    field.parse::<u64>().map_err(|e| StoreError::Parse {
        line,
        message: format!("invalid {what} '{field}': {e}"),
    })
}

/// Journal one vector, logging progress every 1%.
fn add_with_progress(
    store: &Store,
    key: u64,
    vector: &[f32],
    done: u64,
    total: u64,
) -> Result<()> {
    store.add_item(key, vector)?;
    let interval = (total / 100).max(1);
    if done % interval == 0 {
        let pct = (done as f64 / total.max(1) as f64) * 100.0;
        tracing::info!("Importing: {:.0}% ({}/{})", pct, done, total);
    }
    Ok(())
}

fn finish(store: &Store, mut report: ImportReport) -> Result<ImportReport> {
    report.apply = store.apply()?;
    Ok(report)
}

pub struct TreeImporter {
    options: ImportOptions,
}

impl TreeImporter {
    pub fn new(options: ImportOptions) -> Self {
        Self { options }
    }

    fn record_size(&self) -> usize {
        4 + 4 * 2 + self.options.element.width() * self.options.config.dim
    }

    fn read_i32(&self, bytes: &[u8]) -> i32 {
        let mut buf = [0u8; 4];
        buf.copy_from_slice(&bytes[..4]);
        match self.options.byte_order {
            ByteOrder::Little => i32::from_le_bytes(buf),
            ByteOrder::Big => i32::from_be_bytes(buf),
        }
    }

    /// Decode the component block of one record into `out`.
    fn read_vector(&self, bytes: &[u8], out: &mut Vec<f32>) {
        out.clear();
        let order = self.options.byte_order;
        match self.options.element {
            Element::F64 => out.extend(bytes.chunks_exact(8).map(|c| {
                let mut buf = [0u8; 8];
                buf.copy_from_slice(c);
                let value = match order {
                    ByteOrder::Little => f64::from_le_bytes(buf),
                    ByteOrder::Big => f64::from_be_bytes(buf),
                };
                value as f32
            })),
            Element::F32 => out.extend(bytes.chunks_exact(4).map(|c| {
                let mut buf = [0u8; 4];
                buf.copy_from_slice(c);
                match order {
                    ByteOrder::Little => f32::from_le_bytes(buf),
                    ByteOrder::Big => f32::from_be_bytes(buf),
                }
            })),
        }
    }
}

impl Importer for TreeImporter {
    fn import(&self, source: &Path, target: &Path) -> Result<ImportReport> {
        let mapping = match &self.options.mapping {
            Some(path) => Some(load_mapping(path)?),
            None => None,
        };

        let file = File::open(source)?;
        let file_len = file.metadata()?.len() as usize;
        let record_size = self.record_size();
        let count = file_len / record_size;
        if file_len % record_size != 0 {
            tracing::warn!(
                "{}: ignoring {} trailing bytes (record size {})",
                source.display(),
                file_len % record_size,
                record_size
            );
        }

        tracing::info!(
            "importing {} tree records from {} into {}",
            count,
            source.display(),
            target.display()
        );

        if count == 0 {
            return import_staged(target, &self.options.config, |store| {
                finish(store, ImportReport::default())
            });
        }

        // SAFETY: the source is opened read-only and not modified during import
        let mmap = unsafe { Mmap::map(&file)? };
        import_staged(target, &self.options.config, |store| {
            let mut report = ImportReport::default();
            let mut vector = Vec::with_capacity(self.options.config.dim);

            for i in 0..count {
                let record = &mmap[i * record_size..(i + 1) * record_size];
                if self.read_i32(&record[0..4]) != 1 {
                    report.skipped_nodes += 1;
                    continue;
                }

                let index = i as u64;
                let key = match &mapping {
                    Some(map) => *map
                        .get(&index)
                        .ok_or(StoreError::MappingNotFound { index })?,
                    None => index,
                };

                self.read_vector(&record[12..], &mut vector);
                add_with_progress(store, key, &vector, i as u64, count as u64)?;
                report.imported += 1;
            }

            finish(store, report)
        })
    }
}

pub struct CsvImporter {
    options: ImportOptions,
}

impl CsvImporter {
    pub fn new(options: ImportOptions) -> Self {
        Self { options }
    }

    fn parse_row(&self, row: &str, line: usize) -> Result<(u64, Vec<f32>)> {
        let mut fields = row.split(',').map(str::trim);
        let key_field = fields.next().unwrap_or_default();
        let key = parse_u64(key_field, line, "key")?;

        let vector = fields
            .enumerate()
            .map(|(col, field)| {
                let value = field.parse::<f32>().map_err(|e| StoreError::Parse {
                    line,
                    message: format!("invalid component {col} '{field}': {e}"),
                })?;
                if !value.is_finite() {
                    return Err(StoreError::Parse {
                        line,
                        message: format!("component {col} '{field}' is not finite"),
                    });
                }
                Ok(value)
            })
            .collect::<Result<Vec<f32>>>()?;

        if vector.len() != self.options.config.dim {
            return Err(StoreError::Parse {
                line,
                message: format!(
                    "expected {} components, found {}",
                    self.options.config.dim,
                    vector.len()
                ),
            });
        }
        Ok((key, vector))
    }
}

impl Importer for CsvImporter {
    fn import(&self, source: &Path, target: &Path) -> Result<ImportReport> {
        let file = File::open(source)?;
        let total = file.metadata()?.len();
        tracing::info!(
            "importing CSV {} into {}",
            source.display(),
            target.display()
        );

        import_staged(target, &self.options.config, |store| {
            let mut report = ImportReport::default();
            let mut consumed = 0u64;
            for (idx, line) in BufReader::new(file).lines().enumerate() {
                let line = line?;
                consumed += line.len() as u64 + 1;
                let row = line.trim();
                if row.is_empty() {
                    continue;
                }
                let (key, vector) = self.parse_row(row, idx + 1)?;
                // Progress is tracked in bytes since the row count is unknown upfront
                add_with_progress(store, key, &vector, consumed.min(total), total)?;
                report.imported += 1;
            }
            finish(store, report)
        })
    }
}
