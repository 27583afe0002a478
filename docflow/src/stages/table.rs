//! Table reader: `.csv` spreadsheets to staged tables.

use super::inputs::select_sources;
use super::{item_error, Emitter, Stage, StageContext, StageOutcome};
use crate::config::WorkingArea;
use crate::core::{Artifact, ArtifactKind, StageKind, StageResult, Table};
use crate::errors::StageError;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

const EXTENSIONS: &[&str] = &["csv"];
const MAX_SCAN_ROWS: usize = 10;
const MIN_FILLED_RATIO: f64 = 0.5;

/// Reads spreadsheets and writes `processing/<stem>.table.json`.
///
/// Sources are the `.csv` files in `source/` plus spreadsheet
/// attachments saved by earlier stages.
#[derive(Debug, Clone)]
pub struct TableReaderStage {
    name: String,
    area: WorkingArea,
    files: Option<Vec<String>>,
    header_candidates: Vec<String>,
}

impl TableReaderStage {
    /// Creates a reader over the working area.
    #[must_use]
    pub fn new(area: WorkingArea) -> Self {
        Self {
            name: "table_reader".to_string(),
            area,
            files: None,
            header_candidates: Vec::new(),
        }
    }

    /// Restricts the reader to the given source files.
    #[must_use]
    pub fn with_files(mut self, files: Option<Vec<String>>) -> Self {
        self.files = files;
        self
    }

    /// Requires the header row to contain every one of these words.
    #[must_use]
    pub fn with_header_candidates(mut self, candidates: Vec<String>) -> Self {
        self.header_candidates = candidates;
        self
    }

    /// Finds the header row among the first rows of the sheet.
    fn find_header_row(&self, records: &[Vec<String>]) -> Option<usize> {
        let width = records.iter().map(Vec::len).max().unwrap_or(0).max(1);
        records.iter().take(MAX_SCAN_ROWS).position(|row| {
            let filled = row.iter().filter(|c| !c.trim().is_empty()).count();
            #[allow(clippy::cast_precision_loss)]
            let ratio = filled as f64 / width as f64;
            ratio >= MIN_FILLED_RATIO
                && self
                    .header_candidates
                    .iter()
                    .all(|key| row.iter().any(|c| c.trim().contains(key.as_str())))
        })
    }

    /// Parses a sheet into a table. `None` when no header row is found.
    ///
    /// Rows may differ in width; a UTF-8 byte order mark is ignored and
    /// invalid UTF-8 is replaced.
    pub(crate) fn read_table(&self, raw: &[u8]) -> Result<Option<Table>, csv::Error> {
        let raw = raw.strip_prefix(b"\xef\xbb\xbf").unwrap_or(raw);
        let mut reader = csv::ReaderBuilder::new()
            .has_headers(false)
            .flexible(true)
            .from_reader(raw);
        let records = reader
            .byte_records()
            .map(|record| {
                record.map(|r| r.iter().map(|f| String::from_utf8_lossy(f).into_owned()).collect())
            })
            .collect::<Result<Vec<Vec<String>>, _>>()?;
        let Some(header_row) = self.find_header_row(&records) else {
            return Ok(None);
        };
        let columns: Vec<String> = records[header_row].iter().map(|c| c.trim().to_string()).collect();

        // Rows without a value in the key column are padding or totals.
        let key = self
            .header_candidates
            .first()
            .and_then(|k| columns.iter().position(|c| c.contains(k.as_str())))
            .unwrap_or(0);
        let rows = records
            .into_iter()
            .skip(header_row + 1)
            .filter(|row| row.get(key).is_some_and(|v| !v.trim().is_empty()))
            .collect();
        Ok(Some(Table::new(columns, rows)))
    }

    async fn sources(&self, ctx: &StageContext) -> std::io::Result<Vec<(PathBuf, String)>> {
        let mut sources: Vec<(PathBuf, String)> =
            select_sources(&self.area.source(), self.files.as_deref(), EXTENSIONS)
                .await?
                .into_iter()
                .map(|p| {
                    let stem = stem_of(&p);
                    (p, stem)
                })
                .collect();

        // Attachments live under processing/<mail stem>/.
        for artifact in ctx.inputs().iter().filter(|a| self.accepts(a)) {
            let Some(path) = artifact.path() else { continue };
            let parent = path
                .parent()
                .and_then(Path::file_name)
                .map(|n| n.to_string_lossy().into_owned());
            let stem = match parent {
                Some(parent) => format!("{parent}_{}", stem_of(path)),
                None => stem_of(path),
            };
            if !sources.iter().any(|(p, _)| p == path) {
                sources.push((path.to_path_buf(), stem));
            }
        }
        Ok(sources)
    }
}

fn stem_of(path: &Path) -> String {
    path.file_stem().map(|s| s.to_string_lossy().into_owned()).unwrap_or_default()
}

#[async_trait]
impl Stage for TableReaderStage {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> StageKind {
        StageKind::Reader
    }

    fn accepts(&self, artifact: &Artifact) -> bool {
        artifact.kind == ArtifactKind::Other
            && artifact
                .path()
                .and_then(Path::extension)
                .and_then(|e| e.to_str())
                .is_some_and(|e| EXTENSIONS.iter().any(|x| x.eq_ignore_ascii_case(e)))
    }

    async fn produce(&self, ctx: &StageContext, out: &Emitter) -> StageOutcome {
        let sources = self
            .sources(ctx)
            .await
            .map_err(|e| StageError::fatal(&self.name, format!("cannot list source files: {e}")))?;
        info!(task_id = %ctx.task_id(), count = sources.len(), "Found spreadsheets");

        for (path, stem) in sources {
            ctx.checkpoint()?;
            let file_name = path.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_default();
            let raw = match tokio::fs::read(&path).await {
                Ok(raw) => raw,
                Err(e) => {
                    warn!(file = %file_name, error = %e, "Cannot read spreadsheet");
                    item_error(out, &self.name, file_name, e).await?;
                    continue;
                }
            };
            let table = match self.read_table(&raw) {
                Ok(Some(table)) => table,
                Ok(None) => {
                    out.emit(StageResult::progress(format!("{file_name}: no header row found, skipped")))
                        .await?;
                    continue;
                }
                Err(e) => {
                    warn!(file = %file_name, error = %e, "Malformed spreadsheet");
                    item_error(out, &self.name, file_name, e).await?;
                    continue;
                }
            };
            if table.is_empty() {
                warn!(file = %file_name, "Spreadsheet has no data rows");
                out.emit(StageResult::progress(format!("{file_name}: no data rows, skipped")))
                    .await?;
                continue;
            }

            let target = self.area.processing().join(format!("{stem}.table.json"));
            if let Err(e) = table.write(&target).await {
                item_error(out, &self.name, file_name, e).await?;
                continue;
            }
            debug!(file = %file_name, rows = table.rows.len(), "Staged table");
            out.emit(
                Artifact::file(ArtifactKind::Table, &self.name, target)
                    .with_count(table.rows.len())
                    .with_metadata("source", serde_json::Value::String(file_name)),
            )
            .await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cancellation::CancellationToken;
    use crate::profile::{InMemoryProfileStore, ProfileStore};
    use crate::stages::stage_stream;
    use futures::StreamExt;
    use pretty_assertions::assert_eq;
    use std::sync::Arc;

    fn stage() -> TableReaderStage {
        TableReaderStage::new(WorkingArea::new("/unused"))
    }

    #[test]
    fn test_header_row_is_found_below_title() {
        let text = "Staff list,,,\n,,,\nname,amount,phone,\nAnn,1,555,\n,2,,\nBob,3,,\n";
        let table = stage().read_table(text.as_bytes()).unwrap().unwrap();
        assert_eq!(table.columns, vec!["name", "amount", "phone", ""]);
        assert_eq!(table.rows.len(), 2);
        assert_eq!(table.rows[1][0], "Bob");
    }

    #[test]
    fn test_header_candidates_must_all_appear() {
        let text = "a,b\nx,y\n姓名,身份证号\n张三,1\n";
        let table = stage()
            .with_header_candidates(vec!["姓名".into(), "身份证".into()])
            .read_table(text.as_bytes())
            .unwrap()
            .unwrap();
        assert_eq!(table.columns, vec!["姓名", "身份证号"]);
        assert_eq!(table.rows, vec![vec!["张三".to_string(), "1".to_string()]]);

        let missing = stage().with_header_candidates(vec!["电话".into()]).read_table(text.as_bytes());
        assert!(missing.unwrap().is_none());
    }

    #[test]
    fn test_quoted_fields_ragged_rows_and_bom() {
        let text = "\u{feff}name,note,amount\r\n\"Ann, Jr.\",\"two\nlines\",1\r\nBob,\"say \"\"hi\"\"\"\r\n";
        let table = stage().read_table(text.as_bytes()).unwrap().unwrap();
        assert_eq!(table.columns, vec!["name", "note", "amount"]);
        assert_eq!(
            table.rows,
            vec![
                vec!["Ann, Jr.".to_string(), "two\nlines".into(), "1".into()],
                vec!["Bob".to_string(), "say \"hi\"".into()],
            ]
        );
    }

    #[tokio::test]
    async fn test_stage_reads_sources_and_attachments() {
        let dir = tempfile::tempdir().unwrap();
        let area = WorkingArea::new(dir.path());
        area.prepare().await.unwrap();
        tokio::fs::write(area.source().join("staff.csv"), "name,amount\nAnn,1\n").await.unwrap();
        tokio::fs::write(area.source().join("empty.csv"), "name,amount\n").await.unwrap();
        let attached = area.processing().join("mail1").join("data.csv");
        tokio::fs::create_dir_all(attached.parent().unwrap()).await.unwrap();
        tokio::fs::write(&attached, "name,amount\nBob,2\n").await.unwrap();

        let stage = Arc::new(TableReaderStage::new(area.clone()));
        let input = Artifact::file(ArtifactKind::Other, "mail_reader", attached);
        assert!(stage.accepts(&input));
        let ctx = StageContext::new(
            "t",
            Arc::new(CancellationToken::new()),
            InMemoryProfileStore::new().snapshot(),
        )
        .with_inputs(vec![input]);

        let lines: Vec<String> = stage_stream(stage, ctx, 4).map(|r| r.to_line()).collect().await;
        assert_eq!(
            lines,
            vec![
                "empty.csv: no data rows, skipped",
                "[table_reader] produced staff.table.json (1)",
                "[table_reader] produced mail1_data.table.json (1)",
            ]
        );
        let staged = Table::read(&area.processing().join("mail1_data.table.json")).await.unwrap();
        assert_eq!(staged.rows, vec![vec!["Bob".to_string(), "2".to_string()]]);
    }
}
