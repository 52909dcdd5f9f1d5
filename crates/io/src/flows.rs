// Flow tables in CSV

use std::collections::BTreeSet;
use std::fs::File;
use std::io::{BufWriter, Read, Write};
use std::path::Path;

use sectorflow_core::{FlowAmount, FlowRecord, Provenance};

use crate::error::{LoadError, Result};

/// Columns written for every record, in order. Extra dimensions follow,
/// sorted by name.
pub const COLUMNS: [&str; 14] = [
    "Location",
    "ActivityProducedBy",
    "ActivityConsumedBy",
    "SectorProducedBy",
    "SectorConsumedBy",
    "SectorSourceName",
    "FlowName",
    "Compartment",
    "FlowAmount",
    "Unit",
    "Year",
    "DataReliability",
    "DataCollection",
    "Provenance",
];

const REQUIRED: [&str; 2] = ["Location", "FlowAmount"];

#[derive(Debug, Clone, PartialEq)]
enum Column {
    Location,
    ActivityProducedBy,
    ActivityConsumedBy,
    SectorProducedBy,
    SectorConsumedBy,
    SectorSourceName,
    FlowName,
    Compartment,
    FlowAmount,
    Unit,
    Year,
    DataReliability,
    DataCollection,
    Provenance,
    DisaggregateFlag,
    /// Stage intermediates never survive a load.
    Skip,
    Extra(String),
}

impl Column {
    fn from_header(name: &str) -> Self {
        match name {
            "Location" => Self::Location,
            "ActivityProducedBy" => Self::ActivityProducedBy,
            "ActivityConsumedBy" => Self::ActivityConsumedBy,
            "SectorProducedBy" => Self::SectorProducedBy,
            "SectorConsumedBy" => Self::SectorConsumedBy,
            "SectorSourceName" => Self::SectorSourceName,
            "FlowName" => Self::FlowName,
            "Compartment" => Self::Compartment,
            "FlowAmount" => Self::FlowAmount,
            "Unit" => Self::Unit,
            "Year" => Self::Year,
            "DataReliability" => Self::DataReliability,
            "DataCollection" => Self::DataCollection,
            "Provenance" => Self::Provenance,
            "disaggregate_flag" => Self::DisaggregateFlag,
            "HelperFlow" | "FlowAmountRatio" => Self::Skip,
            other => Self::Extra(other.to_string()),
        }
    }
}

// ---------------------------------------------------------------------------
// Read
// ---------------------------------------------------------------------------

/// Read a flow table. `Location` and `FlowAmount` are required; unknown
/// columns are kept in [`FlowRecord::extra`]. The keyword `withdrawn` loads
/// as [`FlowAmount::Suppressed`]; an empty amount is an error.
pub fn read_flow_records<R: Read>(reader: R) -> Result<Vec<FlowRecord>> {
    let mut rdr = csv::ReaderBuilder::new()
        .trim(csv::Trim::All)
        .from_reader(reader);
    let headers = rdr.headers()?.clone();
    for required in REQUIRED {
        if !headers.iter().any(|h| h == required) {
            return Err(LoadError::MissingColumn(required.to_string()));
        }
    }
    let columns: Vec<Column> = headers.iter().map(Column::from_header).collect();

    let mut records = Vec::new();
    for (i, row) in rdr.records().enumerate() {
        let row = row?;
        let line = row.position().map_or(i as u64 + 2, |p| p.line());
        let mut rec = FlowRecord::default();
        for ((column, header), cell) in columns.iter().zip(headers.iter()).zip(row.iter()) {
            let bad = |message: String| LoadError::Parse {
                line,
                column: header.to_string(),
                message,
            };
            match column {
                Column::Location => rec.location = cell.to_string(),
                Column::ActivityProducedBy => rec.activity_produced_by = optional(cell),
                Column::ActivityConsumedBy => rec.activity_consumed_by = optional(cell),
                Column::SectorProducedBy => rec.sector_produced_by = optional(cell),
                Column::SectorConsumedBy => rec.sector_consumed_by = optional(cell),
                Column::SectorSourceName => rec.sector_source_name = cell.to_string(),
                Column::FlowName => rec.flow_name = cell.to_string(),
                Column::Compartment => rec.compartment = optional(cell),
                Column::FlowAmount => {
                    rec.flow_amount = cell.parse::<FlowAmount>().map_err(|e| bad(e.to_string()))?
                }
                Column::Unit => rec.unit = cell.to_string(),
                Column::Year => {
                    rec.year = cell
                        .parse()
                        .map_err(|_| bad(format!("cannot parse year '{cell}'")))?
                }
                Column::DataReliability => rec.data_reliability = score(cell).map_err(bad)?,
                Column::DataCollection => rec.data_collection = score(cell).map_err(bad)?,
                Column::Provenance => rec.provenance = provenance(cell).map_err(bad)?,
                Column::DisaggregateFlag => rec.disaggregate_flag = flag(cell).map_err(bad)?,
                Column::Skip => {}
                Column::Extra(name) => {
                    if !cell.is_empty() {
                        rec.extra.insert(name.clone(), cell.to_string());
                    }
                }
            }
        }
        records.push(rec);
    }
    Ok(records)
}

/// Read a flow table from disk, decoding Windows-1252 when the file is not
/// valid UTF-8.
pub fn read_flow_records_path(path: &Path) -> Result<Vec<FlowRecord>> {
    let content = read_file_as_utf8(path)?;
    let records = read_flow_records(content.as_bytes())?;
    log::info!("read {} flow records from {}", records.len(), path.display());
    Ok(records)
}

pub(crate) fn read_file_as_utf8(path: &Path) -> Result<String> {
    let mut bytes = Vec::new();
    File::open(path)?.read_to_end(&mut bytes)?;
    match String::from_utf8(bytes) {
        Ok(s) => Ok(s),
        Err(e) => {
            log::debug!("{} is not UTF-8; decoding as Windows-1252", path.display());
            let bytes = e.into_bytes();
            let (decoded, _, _) = encoding_rs::WINDOWS_1252.decode(&bytes);
            Ok(decoded.into_owned())
        }
    }
}

fn optional(cell: &str) -> Option<String> {
    (!cell.is_empty()).then(|| cell.to_string())
}

fn score(cell: &str) -> std::result::Result<Option<f64>, String> {
    if cell.is_empty() {
        return Ok(None);
    }
    cell.parse()
        .map(Some)
        .map_err(|_| format!("cannot parse score '{cell}'"))
}

fn provenance(cell: &str) -> std::result::Result<Provenance, String> {
    match cell.to_ascii_lowercase().as_str() {
        "" | "measured" => Ok(Provenance::Measured),
        "estimated" => Ok(Provenance::Estimated),
        other => Err(format!("unknown provenance '{other}'")),
    }
}

fn flag(cell: &str) -> std::result::Result<bool, String> {
    match cell.to_ascii_lowercase().as_str() {
        "" | "0" | "false" => Ok(false),
        "1" | "true" => Ok(true),
        other => Err(format!("cannot parse flag '{other}'")),
    }
}

// ---------------------------------------------------------------------------
// Write
// ---------------------------------------------------------------------------

/// Write records with [`COLUMNS`] followed by every extra dimension present.
/// Stage intermediates are not written.
pub fn write_flow_records<W: Write>(writer: W, records: &[FlowRecord]) -> Result<()> {
    let extras: BTreeSet<&str> = records
        .iter()
        .flat_map(|r| r.extra.keys().map(String::as_str))
        .collect();

    let mut wtr = csv::Writer::from_writer(writer);
    wtr.write_record(COLUMNS.iter().copied().chain(extras.iter().copied()))?;
    for r in records {
        let mut row: Vec<String> = vec![
            r.location.clone(),
            r.activity_produced_by.clone().unwrap_or_default(),
            r.activity_consumed_by.clone().unwrap_or_default(),
            r.sector_produced_by.clone().unwrap_or_default(),
            r.sector_consumed_by.clone().unwrap_or_default(),
            r.sector_source_name.clone(),
            r.flow_name.clone(),
            r.compartment.clone().unwrap_or_default(),
            r.flow_amount.to_string(),
            r.unit.clone(),
            r.year.to_string(),
            r.data_reliability.map(|v| v.to_string()).unwrap_or_default(),
            r.data_collection.map(|v| v.to_string()).unwrap_or_default(),
            match r.provenance {
                Provenance::Measured => "measured".to_string(),
                Provenance::Estimated => "estimated".to_string(),
            },
        ];
        row.extend(extras.iter().map(|k| r.extra.get(*k).cloned().unwrap_or_default()));
        wtr.write_record(&row)?;
    }
    wtr.flush()?;
    Ok(())
}

pub fn write_flow_records_path(path: &Path, records: &[FlowRecord]) -> Result<()> {
    let file = File::create(path)?;
    write_flow_records(BufWriter::new(file), records)?;
    log::info!("wrote {} flow records to {}", records.len(), path.display());
    Ok(())
}
