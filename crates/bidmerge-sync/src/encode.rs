use bidmerge_core::{ArtifactFormat, CellValue, ConsolidatedDataset};
use rust_xlsxwriter::Workbook;
use thiserror::Error;

pub const WORKBOOK_SHEET_NAME: &str = "MergedData";

#[derive(Debug, Error)]
pub enum EncodeError {
    #[error("csv encoding failed: {0}")]
    Csv(#[from] csv::Error),
    #[error("csv buffer flush failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("xlsx encoding failed: {0}")]
    Xlsx(#[from] rust_xlsxwriter::XlsxError),
    #[error("dataset has too many rows for a worksheet")]
    TooManyRows,
}

pub fn encode(dataset: &ConsolidatedDataset, format: ArtifactFormat) -> Result<Vec<u8>, EncodeError> {
    match format {
        ArtifactFormat::Csv => encode_csv(dataset),
        ArtifactFormat::Xlsx => encode_xlsx(dataset),
    }
}

/// UTF-8 CSV, header row = profile fields, nulls as empty fields.
pub fn encode_csv(dataset: &ConsolidatedDataset) -> Result<Vec<u8>, EncodeError> {
    let mut writer = csv::Writer::from_writer(Vec::new());
    writer.write_record(&dataset.fields)?;
    for row in &dataset.rows {
        writer.write_record(
            row.values()
                .iter()
                .map(|cell| cell.as_ref().map(CellValue::render).unwrap_or_default()),
        )?;
    }
    writer.into_inner().map_err(|e| EncodeError::Io(e.into_error()))
}

pub fn encode_xlsx(dataset: &ConsolidatedDataset) -> Result<Vec<u8>, EncodeError> {
    let mut workbook = Workbook::new();
    let sheet = workbook.add_worksheet();
    sheet.set_name(WORKBOOK_SHEET_NAME)?;

    for (col, field) in dataset.fields.iter().enumerate() {
        sheet.write_string(0, col as u16, field.as_str())?;
    }
    for (index, row) in dataset.rows.iter().enumerate() {
        let r = u32::try_from(index + 1).map_err(|_| EncodeError::TooManyRows)?;
        for (col, cell) in row.values().iter().enumerate() {
            let c = col as u16;
            match cell {
                None => {}
                Some(CellValue::Text(text)) => {
                    sheet.write_string(r, c, text.as_str())?;
                }
                Some(CellValue::Int(value)) => {
                    sheet.write_number(r, c, *value as f64)?;
                }
                Some(CellValue::Float(value)) => {
                    sheet.write_number(r, c, *value)?;
                }
                Some(CellValue::Bool(value)) => {
                    sheet.write_boolean(r, c, *value)?;
                }
                Some(other @ CellValue::DateTime(_)) => {
                    sheet.write_string(r, c, other.render())?;
                }
            }
        }
    }
    Ok(workbook.save_to_buffer()?)
}
