//! Incremental Excel output
//!
//! The workbook is rewritten after every committed field rather than at the
//! end of the batch, so a crash never costs more than the task that was in
//! flight. Each rewrite goes to a temp file in the target directory and is
//! renamed over the destination, keeping the visible workbook complete at
//! all times. Values with a source URL become hyperlink cells.

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Path, PathBuf};

use chrono::Local;
use rust_xlsxwriter::{Color, Format, FormatUnderline, Url, Workbook};
use tracing::{debug, info};

use crate::checkpoint::CheckpointRecord;
use crate::config::StorageConfig;
use crate::error::ExtractError;
use crate::input::Entity;
use crate::parser::Confidence;

#[derive(Debug, Clone)]
struct Cell {
    value: Option<String>,
    url: Option<String>,
    confidence: Confidence,
}

#[derive(Debug, Clone)]
struct Row {
    entity_name: String,
    cells: HashMap<String, Cell>,
}

/// Grid-backed workbook writer.
///
/// Keyed by entity key so row order is stable across restarts; the key's
/// zero-padded row prefix makes the BTreeMap ordering match input order.
pub struct ExcelWriter {
    path: PathBuf,
    fields: Vec<String>,
    rows: BTreeMap<String, Row>,
}

impl ExcelWriter {
    /// Create a writer for `path` with the given field columns. If a
    /// workbook already exists there and backups are enabled, a timestamped
    /// copy is put aside before the first overwrite.
    pub fn create(
        path: &Path,
        fields: Vec<String>,
        storage: &StorageConfig,
    ) -> Result<Self, ExtractError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)
                    .map_err(|e| ExtractError::Persistence(format!("create {parent:?}: {e}")))?;
            }
        }

        if path.exists() && storage.backup_enabled {
            backup_existing(path, Path::new(&storage.backup_dir))?;
        }

        Ok(Self {
            path: path.to_path_buf(),
            fields,
            rows: BTreeMap::new(),
        })
    }

    /// Pre-register every entity so the output has a row per input entity
    /// from the first write, not just for entities already answered.
    pub fn seed_entities(&mut self, entities: &[Entity]) {
        for entity in entities {
            self.rows.entry(entity.key()).or_insert_with(|| Row {
                entity_name: entity.name.clone(),
                cells: HashMap::new(),
            });
        }
    }

    /// Replay already-done checkpoint rows into the grid on resume.
    pub fn restore(&mut self, records: &[CheckpointRecord]) {
        for record in records {
            let row = self
                .rows
                .entry(record.entity_key.clone())
                .or_insert_with(|| Row {
                    entity_name: record.entity_name.clone(),
                    cells: HashMap::new(),
                });
            row.cells.insert(
                record.field_name.clone(),
                Cell {
                    value: record.value.clone(),
                    url: record.url.clone(),
                    confidence: record.confidence.unwrap_or(Confidence::Forced),
                },
            );
        }
    }

    /// Record one field value and rewrite the workbook.
    pub fn commit_field(
        &mut self,
        entity_key: &str,
        entity_name: &str,
        field: &str,
        value: Option<&str>,
        url: Option<&str>,
        confidence: Confidence,
    ) -> Result<(), ExtractError> {
        let row = self
            .rows
            .entry(entity_key.to_string())
            .or_insert_with(|| Row {
                entity_name: entity_name.to_string(),
                cells: HashMap::new(),
            });
        row.cells.insert(
            field.to_string(),
            Cell {
                value: value.map(str::to_string),
                url: url.map(str::to_string),
                confidence,
            },
        );
        self.flush()
    }

    /// Rewrite the full workbook from the in-memory grid, atomically.
    pub fn flush(&self) -> Result<(), ExtractError> {
        let buffer = self.render()?;

        let tmp = self.path.with_extension("xlsx.tmp");
        fs::write(&tmp, &buffer)
            .map_err(|e| ExtractError::Persistence(format!("write {tmp:?}: {e}")))?;
        fs::rename(&tmp, &self.path)
            .map_err(|e| ExtractError::Persistence(format!("rename to {:?}: {e}", self.path)))?;

        debug!(path = ?self.path, rows = self.rows.len(), "workbook rewritten");
        Ok(())
    }

    fn render(&self) -> Result<Vec<u8>, ExtractError> {
        let mut workbook = Workbook::new();
        let sheet = workbook.add_worksheet();

        let header = Format::new().set_bold();
        let link = Format::new()
            .set_font_color(Color::Blue)
            .set_underline(FormatUnderline::Single);

        sheet.write_string_with_format(0, 0, "Name", &header)?;
        for (i, field) in self.fields.iter().enumerate() {
            sheet.write_string_with_format(0, (i + 1) as u16, field, &header)?;
        }

        for (r, row) in self.rows.values().enumerate() {
            let excel_row = (r + 1) as u32;
            sheet.write_string(excel_row, 0, &row.entity_name)?;

            for (c, field) in self.fields.iter().enumerate() {
                let col = (c + 1) as u16;
                let Some(cell) = row.cells.get(field) else {
                    continue;
                };
                match (&cell.value, &cell.url) {
                    (Some(value), Some(url)) => {
                        sheet.write_url_with_format(
                            excel_row,
                            col,
                            Url::new(url).set_text(value),
                            &link,
                        )?;
                    }
                    (Some(value), None) => {
                        sheet.write_string(excel_row, col, value)?;
                    }
                    // A source with no value is still worth keeping
                    (None, Some(url)) => {
                        sheet.write_url_with_format(excel_row, col, Url::new(url), &link)?;
                    }
                    // Nulls render as empty cells, regardless of confidence
                    (None, None) => {}
                }
            }
        }

        let buffer = workbook.save_to_buffer()?;
        Ok(buffer)
    }

    /// Current workbook bytes, for the download operation.
    pub fn workbook_bytes(&self) -> Result<Vec<u8>, ExtractError> {
        self.render()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn backup_existing(path: &Path, backup_dir: &Path) -> Result<(), ExtractError> {
    fs::create_dir_all(backup_dir)
        .map_err(|e| ExtractError::Persistence(format!("create {backup_dir:?}: {e}")))?;

    let stem = path
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("output");
    let stamp = Local::now().format("%Y%m%d-%H%M%S");
    let backup = backup_dir.join(format!("{stem}-{stamp}.xlsx"));

    fs::copy(path, &backup)
        .map_err(|e| ExtractError::Persistence(format!("backup to {backup:?}: {e}")))?;
    info!(from = ?path, to = ?backup, "backed up existing workbook");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::TaskState;
    use tempfile::TempDir;

    fn storage(dir: &TempDir, backups: bool) -> StorageConfig {
        StorageConfig {
            db_path: dir.path().join("db.sqlite").to_string_lossy().into_owned(),
            backup_dir: dir.path().join("backups").to_string_lossy().into_owned(),
            backup_enabled: backups,
        }
    }

    fn entity(row: usize, name: &str) -> Entity {
        Entity::new(row, name)
    }

    #[test]
    fn test_commit_writes_workbook_atomically() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("out.xlsx");
        let mut writer =
            ExcelWriter::create(&path, vec!["revenue".into()], &storage(&dir, false)).unwrap();
        writer.seed_entities(&[entity(0, "Acme")]);

        writer
            .commit_field("0000:Acme", "Acme", "revenue", Some("5M"), None, Confidence::Perfect)
            .unwrap();

        assert!(path.exists());
        assert!(!path.with_extension("xlsx.tmp").exists());
        // xlsx container magic
        let bytes = fs::read(&path).unwrap();
        assert_eq!(&bytes[..2], b"PK");
    }

    #[test]
    fn test_recommit_same_field_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("out.xlsx");
        let mut writer =
            ExcelWriter::create(&path, vec!["hq".into()], &storage(&dir, false)).unwrap();

        writer
            .commit_field("0000:Acme", "Acme", "hq", Some("Berlin"), None, Confidence::Useful)
            .unwrap();
        let first = fs::metadata(&path).unwrap().len();
        writer
            .commit_field("0000:Acme", "Acme", "hq", Some("Berlin"), None, Confidence::Useful)
            .unwrap();
        let second = fs::metadata(&path).unwrap().len();

        assert_eq!(writer.rows.len(), 1);
        assert!(first > 0 && second > 0);
    }

    #[test]
    fn test_backup_taken_for_existing_workbook() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("out.xlsx");
        fs::write(&path, b"previous run").unwrap();

        let config = storage(&dir, true);
        let _writer = ExcelWriter::create(&path, vec![], &config).unwrap();

        let backups: Vec<_> = fs::read_dir(&config.backup_dir).unwrap().collect();
        assert_eq!(backups.len(), 1);
    }

    #[test]
    fn test_no_backup_when_disabled() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("out.xlsx");
        fs::write(&path, b"previous run").unwrap();

        let config = storage(&dir, false);
        let _writer = ExcelWriter::create(&path, vec![], &config).unwrap();
        assert!(!Path::new(&config.backup_dir).exists());
    }

    #[test]
    fn test_restore_rebuilds_grid_from_checkpoints() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("out.xlsx");
        let mut writer =
            ExcelWriter::create(&path, vec!["revenue".into()], &storage(&dir, false)).unwrap();

        writer.restore(&[CheckpointRecord {
            batch_id: "b1".into(),
            entity_key: "0000:Acme".into(),
            entity_name: "Acme".into(),
            field_name: "revenue".into(),
            state: TaskState::Done,
            value: Some("5M".into()),
            url: Some("https://a.example".into()),
            confidence: Some(Confidence::Perfect),
            attempts: 1,
            last_error: None,
        }]);

        assert_eq!(writer.rows.len(), 1);
        let cell = &writer.rows["0000:Acme"].cells["revenue"];
        assert_eq!(cell.value.as_deref(), Some("5M"));
        writer.flush().unwrap();
        assert!(path.exists());
    }

    #[test]
    fn test_workbook_bytes_renders_without_touching_disk() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("never-written.xlsx");
        let writer =
            ExcelWriter::create(&path, vec!["a".into()], &storage(&dir, false)).unwrap();

        let bytes = writer.workbook_bytes().unwrap();
        assert_eq!(&bytes[..2], b"PK");
        assert!(!path.exists());
    }
}
