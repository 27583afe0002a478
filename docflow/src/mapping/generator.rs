//! Producers of mappings for unseen header shapes.

use super::fingerprint::canonicalize_header;
use super::sql::{Projection, ProjectionItem, Source};
use super::Fingerprint;
use crate::errors::MappingError;
use crate::profile::ProfileSnapshot;
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use tracing::debug;

/// What a generator is asked to map.
#[derive(Debug, Clone)]
pub struct MappingRequest {
    /// The profile whose information items are the targets.
    pub profile: Arc<ProfileSnapshot>,
    /// Canonical source headers in order.
    pub headers: Vec<String>,
    /// A few data rows to help model-backed generators.
    pub sample_rows: Vec<Vec<String>>,
    /// The fingerprint the result will be cached under.
    pub fingerprint: Fingerprint,
}

/// Derives mapping code for a header shape. This is the expensive step the
/// mapping cache exists to avoid.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait MappingGenerator: Send + Sync {
    /// Returns a projection query over `df`.
    async fn generate(&self, request: &MappingRequest) -> Result<String, MappingError>;
}

/// Matches headers to information items by label, synonym or sample
/// column name, all compared in canonical form.
#[derive(Debug, Clone, Copy, Default)]
pub struct HeaderMatchGenerator;

impl HeaderMatchGenerator {
    /// Creates the generator.
    #[must_use]
    pub fn new() -> Self {
        Self
    }

    fn build(request: &MappingRequest) -> Result<Projection, MappingError> {
        let mut matched = 0;
        let items = request
            .profile
            .info_items
            .iter()
            .map(|item| {
                let mut candidates = vec![canonicalize_header(&item.label)];
                candidates.extend(item.synonyms().iter().map(|s| canonicalize_header(s)));
                if let Some(sample) = &item.sample_col_name {
                    candidates.push(canonicalize_header(sample));
                }

                let column = candidates
                    .iter()
                    .find_map(|c| request.headers.iter().find(|h| *h == c))
                    .cloned();
                let source = match column {
                    Some(column) => {
                        matched += 1;
                        Source::Column(column)
                    }
                    None => Source::Literal(Value::Null),
                };
                ProjectionItem {
                    source,
                    alias: item.label.clone(),
                }
            })
            .collect();

        if matched == 0 {
            return Err(MappingError::Generation(
                "no header matches any information item".to_string(),
            ));
        }
        Ok(Projection { items })
    }
}

#[async_trait]
impl MappingGenerator for HeaderMatchGenerator {
    async fn generate(&self, request: &MappingRequest) -> Result<String, MappingError> {
        let projection = Self::build(request)?;
        debug!(fingerprint = %request.fingerprint, "Matched headers");
        Ok(projection.to_sql())
    }
}

#[cfg(feature = "llm")]
pub use chat::ChatMappingGenerator;

#[cfg(feature = "llm")]
mod chat {
    use super::{MappingGenerator, MappingRequest};
    use crate::errors::MappingError;
    use crate::llm::ChatClient;
    use crate::mapping::sql::{strip_code_fence, Projection};
    use async_trait::async_trait;

    const INSTRUCTIONS: &str = "You are a data analyst. Write one SQL SELECT over the table `df` \
        that maps its columns to the requested information items. Reply with the SQL only. \
        Only rename and select columns: no WHERE, JOIN or functions. Quote identifiers with \
        double quotes. Use NULL for items with no matching column.";

    /// Asks a chat model for the mapping.
    #[derive(Debug, Clone)]
    pub struct ChatMappingGenerator {
        client: ChatClient,
    }

    impl ChatMappingGenerator {
        /// Creates a generator over a chat client.
        #[must_use]
        pub fn new(client: ChatClient) -> Self {
            Self { client }
        }

        fn prompt(request: &MappingRequest) -> String {
            let columns = request
                .headers
                .iter()
                .map(|h| format!("\"{h}\""))
                .collect::<Vec<_>>()
                .join(", ");
            let samples = request
                .sample_rows
                .iter()
                .map(|row| row.join(" | "))
                .collect::<Vec<_>>()
                .join("\n");
            format!(
                "{}\n\nExpected shape:\n{}\n\ndf columns: {columns}\nSample rows:\n{samples}\n",
                request.profile.item_prompt(),
                request.profile.sample_sql(),
            )
        }
    }

    #[async_trait]
    impl MappingGenerator for ChatMappingGenerator {
        async fn generate(&self, request: &MappingRequest) -> Result<String, MappingError> {
            let reply = self
                .client
                .complete(INSTRUCTIONS, &Self::prompt(request))
                .await
                .map_err(|e| MappingError::Generation(e.to_string()))?;
            let sql = strip_code_fence(&reply).to_string();
            // Reject anything outside the projection subset before it is cached.
            Projection::parse(&sql)?;
            Ok(sql)
        }
    }
}
