//! The collection document data model (spec §3).
//!
//! The engine consumes an already-validated, in-memory [`Collection`]; file
//! loading and schema validation are external collaborators (spec §1/§6).

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::value::VarMap;
use quest_plugin_core::{AuthConfig, RequestData, RequestOptions};

/// Collection identity metadata (spec §3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CollectionInfo {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
}

/// One row of iteration/test data (spec §3 `testData`).
pub type TestDataRow = VarMap;

/// Common fields shared by requests and folders (spec §3 "Item").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ItemCommon {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub depends_on: Vec<String>,
    /// Expression string evaluated in the script sandbox against the
    /// current context; a falsy result skips the item (and, for a folder,
    /// all of its descendants).
    #[serde(default)]
    pub condition: Option<String>,
    #[serde(default)]
    pub auth: Option<AuthConfig>,
    #[serde(default)]
    pub pre_request_script: Option<String>,
    #[serde(default)]
    pub post_request_script: Option<String>,
}

/// A leaf request item (spec §3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    #[serde(flatten)]
    pub common: ItemCommon,
    /// Protocol-opaque request payload (URL, method, headers, body, ...).
    pub data: RequestData,
    #[serde(default)]
    pub options: RequestOptions,
    /// Request-level iteration data, lowest priority per spec §4.5.
    #[serde(default)]
    pub test_data: Option<Vec<TestDataRow>>,
}

/// A grouping item that may carry its own scripts and auth (spec §3/§4.3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Folder {
    #[serde(flatten)]
    pub common: ItemCommon,
    /// Runs once on folder entry, before any descendant request.
    #[serde(default)]
    pub folder_pre_script: Option<String>,
    /// Runs once on folder exit.
    #[serde(default)]
    pub folder_post_script: Option<String>,
    pub items: Vec<Item>,
    /// Folder-level iteration data (beats request-level, loses to
    /// collection-level and CLI-supplied data per spec §4.5).
    #[serde(default)]
    pub test_data: Option<Vec<TestDataRow>>,
}

/// A collection item: a request leaf or a folder (spec §3 sum type).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum Item {
    Request(Request),
    Folder(Folder),
}

impl Item {
    /// The shared `id`/`name`/`dependsOn`/... fields of this item.
    pub fn common(&self) -> &ItemCommon {
        match self {
            Self::Request(r) => &r.common,
            Self::Folder(f) => &f.common,
        }
    }

    pub fn id(&self) -> &str {
        &self.common().id
    }

    pub fn name(&self) -> &str {
        &self.common().name
    }

    /// Whether this item is a folder.
    pub fn is_folder(&self) -> bool {
        matches!(self, Self::Folder(_))
    }
}

/// The top-level test document (spec §3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Collection {
    pub info: CollectionInfo,
    /// Protocol tag matched against a registered `ProtocolPlugin`.
    pub protocol: String,
    pub items: Vec<Item>,
    #[serde(default)]
    pub variables: VarMap,
    #[serde(default)]
    pub test_data: Option<Vec<TestDataRow>>,
    #[serde(default)]
    pub pre_request_script: Option<String>,
    #[serde(default)]
    pub post_request_script: Option<String>,
    #[serde(default)]
    pub auth: Option<AuthConfig>,
}

impl Collection {
    /// Depth-first walk of every item (folders before their children),
    /// useful for validation passes that need to see every node once.
    pub fn walk(&self) -> Vec<&Item> {
        fn recurse<'a>(items: &'a [Item], out: &mut Vec<&'a Item>) {
            for item in items {
                out.push(item);
                if let Item::Folder(folder) = item {
                    recurse(&folder.items, out);
                }
            }
        }
        let mut out = Vec::new();
        recurse(&self.items, &mut out);
        out
    }

    /// Find an item anywhere in the tree by id.
    pub fn find(&self, id: &str) -> Option<&Item> {
        self.walk().into_iter().find(|item| item.id() == id)
    }
}

/// A freeform JSON variable definition that may select a non-default
/// [`quest_plugin_core::ValueProviderPlugin`] (spec §4.6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VariableDefinition {
    pub name: String,
    #[serde(default)]
    pub provider: Option<String>,
    #[serde(default)]
    pub value: Option<JsonValue>,
    #[serde(default)]
    pub params: Option<JsonValue>,
}
