//! Mapping extraction: staged tables to records through the mapping cache.

use super::{item_error, write_records, Emitter, Stage, StageContext, StageOutcome, StageStop};
use crate::config::WorkingArea;
use crate::core::{Artifact, ArtifactKind, StageKind, Table};
use crate::mapping::{canonicalize_headers, Fingerprint, MappingOrigin, MappingRequest, MappingResolver, Projection};
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, info, warn};

const SAMPLE_ROWS: usize = 3;

/// Maps each staged table onto the profile's information items.
///
/// Mappings are keyed by the fingerprint of the active profile and the
/// table's canonical headers, so a header shape seen before reuses the
/// cached mapping instead of deriving a new one.
#[derive(Debug, Clone)]
pub struct MappingExtractStage {
    name: String,
    area: WorkingArea,
    resolver: MappingResolver,
}

impl MappingExtractStage {
    /// Creates the stage.
    #[must_use]
    pub fn new(area: WorkingArea, resolver: MappingResolver) -> Self {
        Self {
            name: "mapping_extract".to_string(),
            area,
            resolver,
        }
    }
}

#[async_trait]
impl Stage for MappingExtractStage {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> StageKind {
        StageKind::Extractor
    }

    fn accepts(&self, artifact: &Artifact) -> bool {
        artifact.kind == ArtifactKind::Table
    }

    async fn produce(&self, ctx: &StageContext, out: &Emitter) -> StageOutcome {
        let inputs: Vec<&Artifact> = ctx.inputs().iter().filter(|a| self.accepts(a)).collect();
        info!(task_id = %ctx.task_id(), count = inputs.len(), "Mapping tables");

        for artifact in inputs {
            ctx.checkpoint()?;
            let Some(path) = artifact.path() else { continue };
            let table = match Table::read(path).await {
                Ok(table) => Arc::new(table),
                Err(e) => {
                    item_error(out, &self.name, &artifact.name, e).await?;
                    continue;
                }
            };

            let headers = canonicalize_headers(table.columns.as_slice());
            let fingerprint = Fingerprint::compute(ctx.profile().profile_id(), &headers);
            let request = MappingRequest {
                profile: Arc::clone(ctx.profile()),
                headers,
                sample_rows: table.rows.iter().take(SAMPLE_ROWS).cloned().collect(),
                fingerprint: fingerprint.clone(),
            };

            let applied = Arc::clone(&table);
            let resolved = self
                .resolver
                .resolve(&request, ctx.token(), ctx.events(), move |sql| {
                    Projection::parse(sql)?.apply(&applied)
                })
                .await;
            let (records, origin) = match resolved {
                Ok(Some(resolved)) => resolved,
                Ok(None) => return Err(StageStop::Stopped),
                Err(e) => {
                    warn!(file = %artifact.name, fingerprint = %fingerprint, error = %e, "Mapping failed");
                    item_error(out, &self.name, &artifact.name, e).await?;
                    continue;
                }
            };

            let target = self.area.processing().join(format!("{}.records.json", artifact.stem()));
            if let Err(e) = write_records(&target, &records).await {
                item_error(out, &self.name, &artifact.name, e).await?;
                continue;
            }
            let origin = match origin {
                MappingOrigin::Cached => "cached",
                MappingOrigin::Derived => "derived",
            };
            debug!(file = %artifact.name, fingerprint = %fingerprint, origin, "Mapped table");
            out.emit(
                Artifact::file(ArtifactKind::Records, &self.name, target)
                    .with_count(records.len())
                    .with_metadata("fingerprint", Value::String(fingerprint.to_string()))
                    .with_metadata("mapping", Value::String(origin.to_string())),
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
    use crate::core::StageResult;
    use crate::events::{names, CollectingEventSink};
    use crate::mapping::{HeaderMatchGenerator, InMemoryMappingCache};
    use crate::profile::{InMemoryProfileStore, InfoItem, ProfileStore};
    use crate::stages::{read_records, stage_stream};
    use futures::StreamExt;
    use pretty_assertions::assert_eq;
    use std::time::Duration;

    async fn stage_table(area: &WorkingArea, stem: &str, table: &Table) -> Artifact {
        let path = area.processing().join(format!("{stem}.table.json"));
        table.write(&path).await.unwrap();
        Artifact::file(ArtifactKind::Table, "table_reader", path)
    }

    #[tokio::test]
    async fn test_equal_header_shapes_share_one_derivation() {
        let dir = tempfile::tempdir().unwrap();
        let area = WorkingArea::new(dir.path());
        area.prepare().await.unwrap();

        let store = InMemoryProfileStore::new();
        store.add_info_item(1, InfoItem::new("name", 1)).unwrap();
        store.add_info_item(1, InfoItem::new("amount", 2)).unwrap();

        let a = Table::new(
            vec!["name".into(), "amount".into()],
            vec![vec!["Ann".into(), "1".into()]],
        );
        let b = Table::new(
            vec![" name ".into(), "amount".into()],
            vec![vec!["Bob".into(), String::new()]],
        );
        let inputs = vec![stage_table(&area, "a", &a).await, stage_table(&area, "b", &b).await];

        let resolver = MappingResolver::new(
            Arc::new(InMemoryMappingCache::new()),
            Arc::new(HeaderMatchGenerator::new()),
            Duration::from_secs(5),
        );
        let events = Arc::new(CollectingEventSink::new());
        let stage = Arc::new(MappingExtractStage::new(area.clone(), resolver.clone()));
        let ctx = StageContext::new("t", Arc::new(CancellationToken::new()), store.snapshot())
            .with_inputs(inputs)
            .with_events(events.clone());
        let results: Vec<StageResult> = stage_stream(stage, ctx, 4).collect().await;

        let origins: Vec<_> = results
            .iter()
            .map(|r| r.artifact().unwrap().metadata["mapping"].clone())
            .collect();
        assert_eq!(origins, vec![Value::from("derived"), Value::from("cached")]);
        assert_eq!(resolver.stats().derivations, 1);
        assert_eq!(events.count(names::MAPPING_CACHE_HIT), 1);

        let records = read_records(&area.processing().join("b.records.json")).await.unwrap();
        assert_eq!(records[0]["name"], "Bob");
        assert_eq!(records[0]["amount"], Value::Null);
    }

    #[tokio::test]
    async fn test_unmappable_table_is_an_item_error() {
        let dir = tempfile::tempdir().unwrap();
        let area = WorkingArea::new(dir.path());
        area.prepare().await.unwrap();

        let store = InMemoryProfileStore::new();
        store.add_info_item(1, InfoItem::new("name", 1)).unwrap();
        let table = Table::new(vec!["x".into()], vec![vec!["1".into()]]);
        let inputs = vec![stage_table(&area, "odd", &table).await];

        let resolver = MappingResolver::new(
            Arc::new(InMemoryMappingCache::new()),
            Arc::new(HeaderMatchGenerator::new()),
            Duration::from_secs(5),
        );
        let stage = Arc::new(MappingExtractStage::new(area, resolver));
        let ctx = StageContext::new("t", Arc::new(CancellationToken::new()), store.snapshot()).with_inputs(inputs);
        let results: Vec<StageResult> = stage_stream(stage, ctx, 4).collect().await;

        assert_eq!(results.len(), 1);
        assert!(matches!(&results[0], StageResult::Error(e) if !e.is_fatal()));
    }
}
