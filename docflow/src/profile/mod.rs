//! Configuration profiles.
//!
//! A profile selects which information items and examples are visible to
//! a run. Tasks capture an immutable [`ProfileSnapshot`] when they start,
//! so a concurrent [`ProfileStore::switch_profile`] never changes the
//! configuration a running task observes.

use crate::errors::ProfileError;
use parking_lot::RwLock;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::{Arc, LazyLock};
use tracing::info;

/// Profile identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProfileInfo {
    /// Unique id.
    pub id: i64,
    /// Unique display name.
    pub name: String,
    /// Free-form description.
    #[serde(default)]
    pub description: Option<String>,
    /// Whether this is the profile active at startup.
    #[serde(default)]
    pub is_default: bool,
}

/// A field to extract, i.e. one output column.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InfoItem {
    /// Item id.
    #[serde(default)]
    pub id: i64,
    /// Output column label.
    pub label: String,
    /// Description; may list synonyms as `同义词："a"、"b"`.
    #[serde(default)]
    pub describe: Option<String>,
    /// Declared data type (`text`, `date`, `number`...).
    #[serde(default = "default_data_type")]
    pub data_type: String,
    /// Position in the output.
    #[serde(default)]
    pub sort_no: i32,
    /// A sample source column name used in mapping prompts.
    #[serde(default)]
    pub sample_col_name: Option<String>,
}

fn default_data_type() -> String {
    "text".to_string()
}

#[allow(clippy::expect_used)]
static QUOTED_WORD: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"["“]([^"”]+)["”]"#).expect("valid regex"));

impl InfoItem {
    /// Creates an item with the given label and sort position.
    #[must_use]
    pub fn new(label: impl Into<String>, sort_no: i32) -> Self {
        Self {
            id: 0,
            label: label.into(),
            describe: None,
            data_type: default_data_type(),
            sort_no,
            sample_col_name: None,
        }
    }

    /// Sets the description.
    #[must_use]
    pub fn with_describe(mut self, describe: impl Into<String>) -> Self {
        self.describe = Some(describe.into());
        self
    }

    /// Synonyms quoted in the description, when it declares `同义词`.
    #[must_use]
    pub fn synonyms(&self) -> Vec<String> {
        match self.describe.as_deref() {
            Some(describe) if describe.contains("同义词") => QUOTED_WORD
                .captures_iter(describe)
                .filter_map(|c| c.get(1))
                .map(|m| m.as_str().trim().to_string())
                .filter(|w| !w.is_empty())
                .collect(),
            _ => Vec::new(),
        }
    }
}

/// A worked example passed to model-backed extractors.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Example {
    /// Example id.
    #[serde(default)]
    pub id: i64,
    /// The source fragment.
    pub fragment: String,
}

/// A profile as loaded from a JSON document.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProfileDocument {
    /// Profile name.
    pub name: String,
    /// Description.
    #[serde(default)]
    pub description: Option<String>,
    /// Information items.
    #[serde(default)]
    pub info_items: Vec<InfoItem>,
    /// Examples.
    #[serde(default)]
    pub examples: Vec<Example>,
}

/// The configuration a task sees for its whole duration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProfileSnapshot {
    /// The profile.
    pub profile: ProfileInfo,
    /// Information items in output order.
    pub info_items: Vec<InfoItem>,
    /// Examples.
    pub examples: Vec<Example>,
}

impl ProfileSnapshot {
    /// Creates a snapshot, sorting items by `sort_no`.
    #[must_use]
    pub fn new(profile: ProfileInfo, mut info_items: Vec<InfoItem>, examples: Vec<Example>) -> Self {
        info_items.sort_by_key(|item| item.sort_no);
        Self {
            profile,
            info_items,
            examples,
        }
    }

    /// The profile id that partitions the mapping cache.
    #[must_use]
    pub fn profile_id(&self) -> i64 {
        self.profile.id
    }

    /// Output column labels in order.
    #[must_use]
    pub fn labels(&self) -> Vec<String> {
        self.info_items.iter().map(|item| item.label.clone()).collect()
    }

    /// Describes the items to extract, one per line, for model prompts.
    #[must_use]
    pub fn item_prompt(&self) -> String {
        let mut lines = vec!["# Information items to extract:".to_string()];
        for item in &self.info_items {
            match item.describe.as_deref() {
                Some(describe) => {
                    lines.push(format!("- {} : {} # {describe}", item.label, item.data_type));
                }
                None => lines.push(format!("- {} : {}", item.label, item.data_type)),
            }
        }
        lines.join("\n")
    }

    /// A sample `SELECT` that shows a model the expected shape.
    #[must_use]
    pub fn sample_sql(&self) -> String {
        let columns: Vec<String> = self
            .info_items
            .iter()
            .map(|item| {
                let source = item
                    .sample_col_name
                    .as_deref()
                    .map_or_else(|| "NULL".to_string(), |c| format!("\"{c}\""));
                format!("{source} AS \"{}\"", item.label)
            })
            .collect();
        format!("SELECT {} FROM df", columns.join(", "))
    }
}

/// The configuration collaborator.
pub trait ProfileStore: Send + Sync {
    /// Captures the active profile. The returned snapshot never changes.
    fn snapshot(&self) -> Arc<ProfileSnapshot>;

    /// The active profile.
    fn current_profile(&self) -> ProfileInfo {
        self.snapshot().profile.clone()
    }

    /// Information items of the active profile.
    fn active_information_items(&self) -> Vec<InfoItem> {
        self.snapshot().info_items.clone()
    }

    /// Examples of the active profile.
    fn examples(&self) -> Vec<Example> {
        self.snapshot().examples.clone()
    }

    /// Makes another profile active.
    fn switch_profile(&self, id: i64) -> Result<ProfileInfo, ProfileError>;

    /// All profiles.
    fn profiles(&self) -> Vec<ProfileInfo>;
}

#[derive(Debug, Clone)]
struct ProfileData {
    info: ProfileInfo,
    info_items: Vec<InfoItem>,
    examples: Vec<Example>,
}

impl ProfileData {
    fn snapshot(&self) -> ProfileSnapshot {
        ProfileSnapshot::new(self.info.clone(), self.info_items.clone(), self.examples.clone())
    }
}

#[derive(Debug)]
struct StoreState {
    profiles: BTreeMap<i64, ProfileData>,
    next_id: i64,
    active_id: i64,
}

/// Profile store kept in memory.
///
/// The active snapshot is an `Arc` swapped under a lock, so readers never
/// see a half-switched profile.
#[derive(Debug)]
pub struct InMemoryProfileStore {
    state: RwLock<StoreState>,
    active: RwLock<Arc<ProfileSnapshot>>,
}

impl Default for InMemoryProfileStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryProfileStore {
    /// Creates a store holding one empty default profile with id 1.
    #[must_use]
    pub fn new() -> Self {
        Self::with_default(ProfileDocument {
            name: "default".to_string(),
            ..Default::default()
        })
    }

    /// Creates a store whose default profile (id 1) is built from `doc`.
    #[must_use]
    pub fn with_default(doc: ProfileDocument) -> Self {
        let data = ProfileData {
            info: ProfileInfo {
                id: 1,
                name: doc.name,
                description: doc.description,
                is_default: true,
            },
            info_items: doc.info_items,
            examples: doc.examples,
        };
        let active = Arc::new(data.snapshot());
        let mut profiles = BTreeMap::new();
        profiles.insert(1, data);
        Self {
            state: RwLock::new(StoreState {
                profiles,
                next_id: 2,
                active_id: 1,
            }),
            active: RwLock::new(active),
        }
    }

    /// Adds a profile. Names must be unique.
    pub fn create_profile(
        &self,
        name: impl Into<String>,
        description: Option<String>,
    ) -> Result<ProfileInfo, ProfileError> {
        self.import(ProfileDocument {
            name: name.into(),
            description,
            ..Default::default()
        })
    }

    /// Adds a profile with its items and examples. Names must be unique.
    pub fn import(&self, doc: ProfileDocument) -> Result<ProfileInfo, ProfileError> {
        let mut state = self.state.write();
        if state.profiles.values().any(|p| p.info.name == doc.name) {
            return Err(ProfileError::DuplicateName(doc.name));
        }
        let id = state.next_id;
        state.next_id += 1;
        let info = ProfileInfo {
            id,
            name: doc.name,
            description: doc.description,
            is_default: false,
        };
        state.profiles.insert(
            id,
            ProfileData {
                info: info.clone(),
                info_items: doc.info_items,
                examples: doc.examples,
            },
        );
        info!(profile_id = id, name = %info.name, "Created profile");
        Ok(info)
    }

    /// Appends an information item to a profile.
    pub fn add_info_item(&self, profile_id: i64, mut item: InfoItem) -> Result<(), ProfileError> {
        self.update(profile_id, |data| {
            if item.id == 0 {
                item.id = data.info_items.iter().map(|i| i.id).max().unwrap_or(0) + 1;
            }
            data.info_items.push(item);
        })
    }

    /// Appends an example to a profile.
    pub fn add_example(&self, profile_id: i64, fragment: impl Into<String>) -> Result<(), ProfileError> {
        let fragment = fragment.into();
        self.update(profile_id, |data| {
            let id = data.examples.iter().map(|e| e.id).max().unwrap_or(0) + 1;
            data.examples.push(Example { id, fragment });
        })
    }

    fn update(&self, profile_id: i64, f: impl FnOnce(&mut ProfileData)) -> Result<(), ProfileError> {
        let mut state = self.state.write();
        let active_id = state.active_id;
        let data = state
            .profiles
            .get_mut(&profile_id)
            .ok_or(ProfileError::NotFound(profile_id))?;
        f(data);
        if profile_id == active_id {
            *self.active.write() = Arc::new(data.snapshot());
        }
        Ok(())
    }
}

impl ProfileStore for InMemoryProfileStore {
    fn snapshot(&self) -> Arc<ProfileSnapshot> {
        Arc::clone(&self.active.read())
    }

    fn switch_profile(&self, id: i64) -> Result<ProfileInfo, ProfileError> {
        let mut state = self.state.write();
        let data = state.profiles.get(&id).ok_or(ProfileError::NotFound(id))?;
        let snapshot = Arc::new(data.snapshot());
        let info = data.info.clone();
        state.active_id = id;
        *self.active.write() = snapshot;
        info!(profile_id = id, name = %info.name, "Switched profile");
        Ok(info)
    }

    fn profiles(&self) -> Vec<ProfileInfo> {
        self.state.read().profiles.values().map(|p| p.info.clone()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn hr_doc() -> ProfileDocument {
        ProfileDocument {
            name: "hr".to_string(),
            description: None,
            info_items: vec![
                InfoItem::new("amount", 2),
                InfoItem::new("name", 1).with_describe(r#"同义词："姓名"、"名字""#),
            ],
            examples: vec![],
        }
    }

    #[test]
    fn test_synonyms_from_description() {
        let item = InfoItem::new("证件号码", 1).with_describe(r#"同义词，例如："身份证号"、"身份证号码"等"#);
        assert_eq!(item.synonyms(), vec!["身份证号", "身份证号码"]);

        let plain = InfoItem::new("x", 1).with_describe(r#"see "other""#);
        assert!(plain.synonyms().is_empty());
    }

    #[test]
    fn test_duplicate_names_rejected() {
        let store = InMemoryProfileStore::new();
        store.import(hr_doc()).unwrap();
        let err = store.create_profile("hr", None).unwrap_err();
        assert_eq!(err, ProfileError::DuplicateName("hr".to_string()));
        assert!(store.create_profile("default", None).is_err());
    }

    #[test]
    fn test_switch_profile() {
        let store = InMemoryProfileStore::new();
        let hr = store.import(hr_doc()).unwrap();
        assert_eq!(store.current_profile().id, 1);

        store.switch_profile(hr.id).unwrap();
        assert_eq!(store.current_profile().name, "hr");
        assert_eq!(store.snapshot().labels(), vec!["name", "amount"]);

        assert_eq!(store.switch_profile(99), Err(ProfileError::NotFound(99)));
        assert_eq!(store.current_profile().name, "hr");
    }

    #[test]
    fn test_snapshot_is_stable_across_switch_and_edit() {
        let store = InMemoryProfileStore::new();
        let hr = store.import(hr_doc()).unwrap();
        let before = store.snapshot();

        store.switch_profile(hr.id).unwrap();
        store.add_info_item(hr.id, InfoItem::new("date", 3)).unwrap();

        assert_eq!(before.profile_id(), 1);
        assert!(before.info_items.is_empty());
        assert_eq!(store.active_information_items().len(), 3);
    }

    #[test]
    fn test_prompts() {
        let store = InMemoryProfileStore::with_default(hr_doc());
        let snapshot = store.snapshot();
        assert!(snapshot.item_prompt().contains("- name : text # 同义词"));
        assert_eq!(snapshot.sample_sql(), r#"SELECT NULL AS "name", NULL AS "amount" FROM df"#);

        store.add_example(1, "Ann paid 10").unwrap();
        assert_eq!(store.examples()[0].id, 1);
    }
}
