//! Tabular export: records to one CSV per source group.

use super::{item_error, read_records, Emitter, Record, Stage, StageContext, StageOutcome};
use crate::config::WorkingArea;
use crate::core::{Artifact, ArtifactKind, StageKind, StageResult};
use crate::errors::StageError;
use async_trait::async_trait;
use serde_json::Value;
use tracing::{info, warn};

/// Writes `destination/<group>_formatted.csv` for each group of record
/// artifacts.
///
/// A group is the artifact stem up to its last `_` segment, so
/// `staff_sheet1` and `staff_sheet2` land in `staff_formatted.csv`. The
/// header row is the profile's information-item labels.
#[derive(Debug, Clone)]
pub struct TabularExportStage {
    name: String,
    area: WorkingArea,
}

impl TabularExportStage {
    /// Creates the stage.
    #[must_use]
    pub fn new(area: WorkingArea) -> Self {
        Self {
            name: "tabular_export".to_string(),
            area,
        }
    }
}

/// The export group of an artifact stem.
pub(crate) fn group_of(stem: &str) -> &str {
    match stem.rsplit_once('_') {
        Some((group, _)) if !group.is_empty() => group,
        _ => stem,
    }
}

fn cell(value: Option<&Value>) -> String {
    match value {
        None | Some(Value::Null) => String::new(),
        Some(Value::String(s)) => s.clone(),
        Some(other) => other.to_string(),
    }
}

/// Renders the header and one row per record, CRLF terminated.
fn render(labels: &[String], records: &[Record]) -> Result<Vec<u8>, csv::Error> {
    let mut writer = csv::WriterBuilder::new()
        .terminator(csv::Terminator::CRLF)
        .from_writer(Vec::new());
    writer.write_record(labels)?;
    for record in records {
        writer.write_record(labels.iter().map(|l| cell(record.get(l))))?;
    }
    writer.into_inner().map_err(|e| e.into_error().into())
}

#[async_trait]
impl Stage for TabularExportStage {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> StageKind {
        StageKind::Exporter
    }

    fn accepts(&self, artifact: &Artifact) -> bool {
        artifact.kind == ArtifactKind::Records
    }

    async fn produce(&self, ctx: &StageContext, out: &Emitter) -> StageOutcome {
        let mut groups: Vec<(String, Vec<&Artifact>)> = Vec::new();
        for artifact in ctx.inputs().iter().filter(|a| self.accepts(a)) {
            let stem = artifact.stem();
            let group = group_of(&stem).to_string();
            match groups.iter_mut().find(|(g, _)| *g == group) {
                Some((_, members)) => members.push(artifact),
                None => groups.push((group, vec![artifact])),
            }
        }
        if groups.is_empty() {
            out.progress("no records to export").await?;
            return Ok(());
        }

        let destination = self.area.destination();
        tokio::fs::create_dir_all(&destination)
            .await
            .map_err(|e| StageError::fatal(&self.name, format!("cannot create destination: {e}")))?;
        let labels = ctx.profile().labels();
        info!(task_id = %ctx.task_id(), groups = groups.len(), "Exporting records");

        for (group, members) in groups {
            ctx.checkpoint()?;
            let mut records = Vec::new();
            for artifact in members {
                let Some(path) = artifact.path() else { continue };
                match read_records(path).await {
                    Ok(found) => records.extend(found),
                    Err(e) => {
                        warn!(file = %artifact.name, error = %e, "Cannot read records");
                        item_error(out, &self.name, &artifact.name, e).await?;
                    }
                }
            }
            if records.is_empty() {
                out.emit(StageResult::progress(format!("{group}: no records, skipped")))
                    .await?;
                continue;
            }

            let target = destination.join(format!("{group}_formatted.csv"));
            let written = match render(&labels, &records) {
                Ok(bytes) => tokio::fs::write(&target, bytes).await.map_err(|e| e.to_string()),
                Err(e) => Err(e.to_string()),
            };
            if let Err(e) = written {
                item_error(out, &self.name, &group, e).await?;
                continue;
            }
            out.emit(Artifact::file(ArtifactKind::Export, &self.name, target).with_count(records.len()))
                .await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cancellation::CancellationToken;
    use crate::profile::{InMemoryProfileStore, InfoItem, ProfileStore};
    use crate::stages::{stage_stream, write_records};
    use futures::StreamExt;
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use std::sync::Arc;

    #[test]
    fn test_group_of() {
        assert_eq!(group_of("staff_sheet1"), "staff");
        assert_eq!(group_of("a_b_c"), "a_b");
        assert_eq!(group_of("plain"), "plain");
        assert_eq!(group_of("_x"), "_x");
    }

    fn record(value: Value) -> Record {
        match value {
            Value::Object(map) => map,
            _ => unreachable!(),
        }
    }

    #[test]
    fn test_render_uses_labels_and_blanks() {
        let labels = vec!["name".to_string(), "amount".to_string()];
        let rows = vec![
            record(json!({"name": "Ann, Jr.", "amount": 3})),
            record(json!({"name": "Bob", "amount": null, "extra": "x"})),
        ];
        let rendered = String::from_utf8(render(&labels, &rows).unwrap()).unwrap();
        assert_eq!(rendered, "name,amount\r\n\"Ann, Jr.\",3\r\nBob,\r\n");
    }

    #[test]
    fn test_render_quotes_embedded_quotes_and_line_breaks() {
        let labels = vec!["note".to_string()];
        let rows = vec![record(json!({"note": "say \"hi\"\nthen leave"}))];
        let rendered = String::from_utf8(render(&labels, &rows).unwrap()).unwrap();
        assert_eq!(rendered, "note\r\n\"say \"\"hi\"\"\nthen leave\"\r\n");
    }

    #[tokio::test]
    async fn test_stage_groups_by_source() {
        let dir = tempfile::tempdir().unwrap();
        let area = WorkingArea::new(dir.path());
        area.prepare().await.unwrap();
        let store = InMemoryProfileStore::new();
        store.add_info_item(1, InfoItem::new("name", 1)).unwrap();

        let mut inputs = Vec::new();
        for (stem, name) in [("staff_s1", "A"), ("staff_s2", "B"), ("memo", "C")] {
            let path = area.processing().join(format!("{stem}.records.json"));
            write_records(&path, &[record(json!({"name": name}))]).await.unwrap();
            inputs.push(Artifact::file(ArtifactKind::Records, "mapping_extract", path));
        }

        let stage = Arc::new(TabularExportStage::new(area.clone()));
        let ctx = StageContext::new("t", Arc::new(CancellationToken::new()), store.snapshot()).with_inputs(inputs);
        let lines: Vec<String> = stage_stream(stage, ctx, 4).map(|r| r.to_line()).collect().await;

        assert_eq!(
            lines,
            vec![
                "[tabular_export] produced staff_formatted.csv (2)",
                "[tabular_export] produced memo_formatted.csv (1)",
            ]
        );
        let staff = tokio::fs::read_to_string(area.destination().join("staff_formatted.csv")).await.unwrap();
        assert_eq!(staff, "name\r\nA\r\nB\r\n");
    }
}
