//! Input loading for entity and template spreadsheets
//!
//! Supports:
//! - .xlsx workbooks (first worksheet, header row mapped to attribute names)
//! - .csv files with a header row
//! - Tolerant row parsing (rows without a usable name are skipped)

use anyhow::{bail, Context, Result};
use calamine::{open_workbook_auto, Data, Reader};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use tracing::{debug, warn};

/// Column headers accepted as the entity name column, in priority order.
const NAME_HEADERS: &[&str] = &["name", "company", "company_name", "entity"];

/// One row of input data. Immutable once loaded; uniquely keyed within a
/// batch by row order plus name.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Entity {
    /// Zero-based input row order (excluding the header row)
    pub row: usize,
    /// Entity name (always also available as the `name` attribute)
    pub name: String,
    /// Seed attributes from the remaining columns
    #[serde(default)]
    pub attributes: HashMap<String, String>,
}

impl Entity {
    pub fn new(row: usize, name: impl Into<String>) -> Self {
        let name = name.into();
        let mut attributes = HashMap::new();
        attributes.insert("name".to_string(), name.clone());
        Self { row, name, attributes }
    }

    /// Stable composite key: row order plus name.
    pub fn key(&self) -> String {
        format!("{:04}:{}", self.row, self.name)
    }

    pub fn attribute(&self, attr: &str) -> Option<&str> {
        self.attributes.get(attr).map(|s| s.as_str())
    }
}

/// Expected value shape for a field, used to normalize parsed values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum FieldKind {
    #[default]
    Text,
    Number,
    YesNo,
    List,
}

impl FieldKind {
    pub fn parse(s: &str) -> Self {
        match s.trim().to_lowercase().as_str() {
            "number" | "numeric" | "count" => FieldKind::Number,
            "yes_no" | "yesno" | "bool" | "boolean" => FieldKind::YesNo,
            "list" | "text_list" | "csv" => FieldKind::List,
            _ => FieldKind::Text,
        }
    }
}

/// One field definition from the template spreadsheet: the field name, the
/// query template used to research it, and the expected value kind.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FieldTemplate {
    pub field: String,
    pub template: String,
    #[serde(default)]
    pub kind: FieldKind,
}

/// Input format for entity/template files
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum InputFormat {
    Xlsx,
    Csv,
}

impl InputFormat {
    /// Detect format from file extension
    pub fn from_path(path: &Path) -> Option<Self> {
        match path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_lowercase())
            .as_deref()
        {
            Some("xlsx") | Some("xlsm") => Some(Self::Xlsx),
            Some("csv") => Some(Self::Csv),
            _ => None,
        }
    }
}

/// Load entities from a spreadsheet (auto-detects format from extension).
pub fn load_entities(path: &Path) -> Result<Vec<Entity>> {
    let format = InputFormat::from_path(path).context(format!(
        "Cannot determine input format from file extension. Expected .xlsx or .csv: {}",
        path.display()
    ))?;

    let rows = match format {
        InputFormat::Xlsx => read_xlsx_rows(path)?,
        InputFormat::Csv => read_csv_rows(path)?,
    };

    entities_from_rows(rows)
}

/// Load field templates from a spreadsheet. Expected columns:
/// field name, query template, optional kind.
pub fn load_templates(path: &Path) -> Result<Vec<FieldTemplate>> {
    let format = InputFormat::from_path(path).context(format!(
        "Cannot determine template format from file extension. Expected .xlsx or .csv: {}",
        path.display()
    ))?;

    let rows = match format {
        InputFormat::Xlsx => read_xlsx_rows(path)?,
        InputFormat::Csv => read_csv_rows(path)?,
    };

    templates_from_rows(rows)
}

/// Read the first worksheet of an xlsx workbook as string rows.
fn read_xlsx_rows(path: &Path) -> Result<Vec<Vec<String>>> {
    let mut workbook = open_workbook_auto(path)
        .with_context(|| format!("Failed to open workbook: {}", path.display()))?;

    let range = workbook
        .worksheet_range_at(0)
        .context("Workbook has no worksheets")?
        .with_context(|| format!("Failed to read first worksheet of {}", path.display()))?;

    let mut rows = Vec::new();
    for row in range.rows() {
        let cells: Vec<String> = row
            .iter()
            .map(|cell| match cell {
                Data::Empty => String::new(),
                other => other.to_string().trim().to_string(),
            })
            .collect();
        rows.push(cells);
    }

    Ok(rows)
}

/// Read a CSV file as string rows (header row included).
fn read_csv_rows(path: &Path) -> Result<Vec<Vec<String>>> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .from_path(path)
        .with_context(|| format!("Failed to read input file: {}", path.display()))?;

    let mut rows = Vec::new();
    for record in reader.records() {
        let record = record.context("Failed to parse CSV record")?;
        rows.push(record.iter().map(|s| s.trim().to_string()).collect());
    }

    Ok(rows)
}

/// Build entities from raw rows: first row is the header, one of its columns
/// must be the entity name (or the first column is used).
pub fn entities_from_rows(rows: Vec<Vec<String>>) -> Result<Vec<Entity>> {
    let mut iter = rows.into_iter();
    let header = match iter.next() {
        Some(h) if !h.is_empty() => h,
        _ => bail!("Input spreadsheet is empty"),
    };

    let headers: Vec<String> = header.iter().map(|h| normalize_header(h)).collect();

    let name_idx = NAME_HEADERS
        .iter()
        .find_map(|candidate| headers.iter().position(|h| h == candidate))
        .unwrap_or(0);

    let mut entities = Vec::new();
    for (row_num, cells) in iter.enumerate() {
        let name = match cells.get(name_idx).map(|s| s.trim()) {
            Some(n) if !n.is_empty() => n.to_string(),
            _ => {
                debug!("Skipping input row {} with no entity name", row_num + 2);
                continue;
            }
        };

        let mut entity = Entity::new(entities.len(), name);
        for (idx, value) in cells.iter().enumerate() {
            if idx == name_idx || value.is_empty() {
                continue;
            }
            if let Some(attr) = headers.get(idx).filter(|h| !h.is_empty()) {
                entity.attributes.insert(attr.clone(), value.clone());
            }
        }
        entities.push(entity);
    }

    if entities.is_empty() {
        bail!("Input spreadsheet contains no usable entity rows");
    }

    debug!("Loaded {} entities", entities.len());
    Ok(entities)
}

/// Build field templates from raw rows. A header row is skipped when its
/// first cell reads like one ("field"/"name").
pub fn templates_from_rows(rows: Vec<Vec<String>>) -> Result<Vec<FieldTemplate>> {
    let mut templates = Vec::new();

    for (row_num, cells) in rows.into_iter().enumerate() {
        let field = match cells.first().map(|s| s.trim()) {
            Some(f) if !f.is_empty() => f.to_string(),
            _ => continue,
        };

        if row_num == 0 {
            let lowered = normalize_header(&field);
            if lowered == "field" || lowered == "name" || lowered == "field_name" {
                continue;
            }
        }

        let template = match cells.get(1).map(|s| s.trim()) {
            Some(t) if !t.is_empty() => t.to_string(),
            _ => {
                warn!("Template row for field '{}' has no query template, skipping", field);
                continue;
            }
        };

        let kind = cells
            .get(2)
            .map(|k| FieldKind::parse(k))
            .unwrap_or_default();

        templates.push(FieldTemplate { field, template, kind });
    }

    if templates.is_empty() {
        bail!("Template spreadsheet contains no usable field definitions");
    }

    // Duplicate field names would make checkpoint keys ambiguous
    let mut seen = std::collections::HashSet::new();
    for t in &templates {
        if !seen.insert(t.field.clone()) {
            bail!("Duplicate field name in template spreadsheet: {}", t.field);
        }
    }

    debug!("Loaded {} field templates", templates.len());
    Ok(templates)
}

fn normalize_header(h: &str) -> String {
    h.trim().to_lowercase().replace([' ', '-'], "_")
}
