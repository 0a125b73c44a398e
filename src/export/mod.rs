//! Spreadsheet export of task results.

use rust_xlsxwriter::{Format, Workbook, XlsxError};

use crate::schedule::types::{Task, TaskStatus};

pub const EXPORT_FILENAME: &str = "transcription_results.xlsx";
pub const XLSX_CONTENT_TYPE: &str =
    "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet";

const HEADERS: [&str; 5] = ["Filename", "Created At", "Completed At", "Status", "Result"];
const TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// One spreadsheet row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExportRow {
    pub filename: String,
    pub created_at: String,
    pub completed_at: Option<String>,
    pub status: TaskStatus,
    pub result: Option<String>,
}

impl From<&Task> for ExportRow {
    fn from(task: &Task) -> Self {
        Self {
            filename: task.filename.clone(),
            created_at: task.created_at.format(TIME_FORMAT).to_string(),
            completed_at: task.completed_at.map(|t| t.format(TIME_FORMAT).to_string()),
            status: task.status,
            result: task.result.clone(),
        }
    }
}

pub fn export_rows(tasks: &[Task]) -> Vec<ExportRow> {
    tasks.iter().map(ExportRow::from).collect()
}

/// Render rows into an in-memory xlsx workbook. Missing values stay empty cells.
pub fn write_xlsx(rows: &[ExportRow]) -> Result<Vec<u8>, XlsxError> {
    let mut workbook = Workbook::new();
    let header_format = Format::new().set_bold();
    let worksheet = workbook.add_worksheet();
    worksheet.set_name("Results")?;

    for (col, header) in HEADERS.iter().enumerate() {
        worksheet.write_string_with_format(0, col as u16, *header, &header_format)?;
    }
    worksheet.set_column_width(0, 32)?;
    worksheet.set_column_width(1, 20)?;
    worksheet.set_column_width(2, 20)?;
    worksheet.set_column_width(3, 12)?;
    worksheet.set_column_width(4, 80)?;

    for (i, row) in rows.iter().enumerate() {
        let r = (i + 1) as u32;
        worksheet.write_string(r, 0, &row.filename)?;
        worksheet.write_string(r, 1, &row.created_at)?;
        if let Some(completed_at) = &row.completed_at {
            worksheet.write_string(r, 2, completed_at)?;
        }
        worksheet.write_string(r, 3, row.status.as_str())?;
        if let Some(result) = &row.result {
            worksheet.write_string(r, 4, result)?;
        }
    }

    workbook.save_to_buffer()
}
