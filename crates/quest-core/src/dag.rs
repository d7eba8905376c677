//! Tree-to-DAG compilation (spec §4.5).
//!
//! Grounded on the teacher's `GraphData`/`GraphBuilder`
//! (`mockforge-core::graph`): nodes and edges collected into plain
//! `IndexMap`s rather than a general graph crate, since the engine only
//! ever needs a topological ready-set, not arbitrary graph queries.

use std::fmt;

use indexmap::{IndexMap, IndexSet};

use crate::collection::{Collection, Item};
use crate::Result;

/// Identifies one schedulable unit: a request, or one of a folder's two
/// pseudo-nodes (spec §4.5 "folder's `folderPreScript`/`folderPostScript`
/// pseudo-node").
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum NodeId {
    Request(String),
    FolderPre(String),
    FolderPost(String),
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Request(id) => write!(f, "request:{id}"),
            Self::FolderPre(id) => write!(f, "folder-pre:{id}"),
            Self::FolderPost(id) => write!(f, "folder-post:{id}"),
        }
    }
}

/// Everything the scheduler and runner need to know about one node besides
/// its dependency edges.
#[derive(Debug, Clone)]
pub struct NodeInfo {
    pub id: NodeId,
    /// Display name, used only to break ties deterministically among
    /// concurrently-ready nodes (spec §4.5 "sorts children alphabetically
    /// by name").
    pub name: String,
    /// Ids of ancestor folders, root to immediate parent, for scope-chain
    /// construction and envelope path segments.
    pub folder_path: Vec<String>,
}

/// A compiled, cycle-free execution graph for one collection (spec §4.5).
pub struct Dag {
    nodes: IndexMap<NodeId, NodeInfo>,
    /// Inbound edges: node -> the set of nodes that must complete first.
    deps: IndexMap<NodeId, IndexSet<NodeId>>,
}

impl Dag {
    /// Compile `collection`'s item tree into a DAG.
    ///
    /// `sequential` adds an edge from each item to its previous sibling
    /// (spec §4.5 "optionally, its previous sibling under sequential
    /// mode"), forcing declaration order when parallelism is disabled.
    pub fn build(collection: &Collection, sequential: bool) -> Result<Self> {
        let mut dag = Self { nodes: IndexMap::new(), deps: IndexMap::new() };
        dag.visit_items(&collection.items, &[], sequential);
        dag.wire_depends_on(collection)?;
        dag.check_acyclic()?;
        Ok(dag)
    }

    fn insert_node(&mut self, id: NodeId, name: String, folder_path: Vec<String>) {
        self.deps.entry(id.clone()).or_default();
        self.nodes.insert(id.clone(), NodeInfo { id, name, folder_path });
    }

    fn add_dep(&mut self, node: &NodeId, depends_on: NodeId) {
        self.deps.entry(node.clone()).or_default().insert(depends_on);
    }

    fn visit_items(&mut self, items: &[Item], folder_path: &[String], sequential: bool) {
        let mut previous: Option<NodeId> = None;
        for item in items {
            match item {
                Item::Request(request) => {
                    let node = NodeId::Request(request.common.id.clone());
                    self.insert_node(node.clone(), request.common.name.clone(), folder_path.to_vec());
                    if let Some(parent) = folder_path.last() {
                        self.add_dep(&node, NodeId::FolderPre(parent.clone()));
                    }
                    if sequential {
                        if let Some(prev) = &previous {
                            self.add_dep(&node, prev.clone());
                        }
                    }
                    previous = Some(node);
                }
                Item::Folder(folder) => {
                    let pre = NodeId::FolderPre(folder.common.id.clone());
                    let post = NodeId::FolderPost(folder.common.id.clone());
                    self.insert_node(pre.clone(), format!("{} (pre)", folder.common.name), folder_path.to_vec());
                    self.insert_node(post.clone(), format!("{} (post)", folder.common.name), folder_path.to_vec());
                    if let Some(parent) = folder_path.last() {
                        self.add_dep(&pre, NodeId::FolderPre(parent.clone()));
                    }
                    if sequential {
                        if let Some(prev) = &previous {
                            self.add_dep(&pre, prev.clone());
                        }
                    }

                    let mut child_path = folder_path.to_vec();
                    child_path.push(folder.common.id.clone());
                    self.visit_items(&folder.items, &child_path, sequential);

                    // The folder's post pseudo-node depends on every direct
                    // child's completion node, so depending on the folder
                    // itself (via `completion_node`) waits on everything
                    // nested inside it.
                    for child in &folder.items {
                        self.add_dep(&post, self.completion_node(child));
                    }
                    // An empty folder still runs its post script right
                    // after its pre script.
                    if folder.items.is_empty() {
                        self.add_dep(&post, pre.clone());
                    }

                    let folder_node = NodeId::FolderPost(folder.common.id.clone());
                    previous = Some(folder_node);
                }
            }
        }
    }

    /// The node whose completion marks `item` as fully done: the request
    /// itself, or a folder's post pseudo-node (spec §4.5 "depending on a
    /// folder means depending on its full completion").
    fn completion_node(&self, item: &Item) -> NodeId {
        match item {
            Item::Request(r) => NodeId::Request(r.common.id.clone()),
            Item::Folder(f) => NodeId::FolderPost(f.common.id.clone()),
        }
    }

    /// The node an explicit `dependsOn` reference or a sequential-sibling
    /// edge should point at for entering `item`.
    fn entry_node(&self, item: &Item) -> NodeId {
        match item {
            Item::Request(r) => NodeId::Request(r.common.id.clone()),
            Item::Folder(f) => NodeId::FolderPre(f.common.id.clone()),
        }
    }

    fn wire_depends_on(&mut self, collection: &Collection) -> Result<()> {
        for item in collection.walk() {
            let node = self.entry_node(item);
            for target_id in &item.common().depends_on {
                let target = collection
                    .find(target_id)
                    .ok_or_else(|| crate::Error::scheduling(format!("dependsOn target '{target_id}' not found")))?;
                let completion = self.completion_node(target);
                self.add_dep(&node, completion);
            }
        }
        Ok(())
    }

    fn check_acyclic(&self) -> Result<()> {
        // Kahn's algorithm over "node depends on prerequisites": a node is
        // ready once every prerequisite has been removed.
        let mut remaining: IndexMap<NodeId, IndexSet<NodeId>> = self.deps.clone();
        let mut done: IndexSet<NodeId> = IndexSet::new();
        let total = remaining.len();

        loop {
            let ready: Vec<NodeId> = remaining
                .iter()
                .filter(|(_, deps)| deps.iter().all(|d| done.contains(d)))
                .map(|(id, _)| id.clone())
                .collect();
            if ready.is_empty() {
                break;
            }
            for id in &ready {
                remaining.shift_remove(id);
                done.insert(id.clone());
            }
        }

        if done.len() != total {
            let stuck: Vec<String> = remaining.keys().map(|id| id.to_string()).collect();
            return Err(crate::Error::scheduling(format!("dependency cycle detected among: {}", stuck.join(", "))));
        }
        Ok(())
    }

    /// All node ids, in declaration order.
    pub fn node_ids(&self) -> impl Iterator<Item = &NodeId> {
        self.nodes.keys()
    }

    pub fn info(&self, id: &NodeId) -> &NodeInfo {
        &self.nodes[id]
    }

    pub fn dependencies(&self, id: &NodeId) -> &IndexSet<NodeId> {
        &self.deps[id]
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collection::{CollectionInfo, Folder, ItemCommon, Request};
    use quest_plugin_core::RequestData;

    fn common(id: &str, name: &str, depends_on: Vec<&str>) -> ItemCommon {
        ItemCommon {
            id: id.to_string(),
            name: name.to_string(),
            depends_on: depends_on.into_iter().map(String::from).collect(),
            condition: None,
            auth: None,
            pre_request_script: None,
            post_request_script: None,
        }
    }

    fn request(id: &str, name: &str, depends_on: Vec<&str>) -> Item {
        Item::Request(Request {
            common: common(id, name, depends_on),
            data: RequestData::new("GET", "https://example.com"),
            options: Default::default(),
            test_data: None,
        })
    }

    fn folder(id: &str, name: &str, items: Vec<Item>) -> Item {
        Item::Folder(Folder {
            common: common(id, name, vec![]),
            folder_pre_script: None,
            folder_post_script: None,
            items,
            test_data: None,
        })
    }

    fn collection(items: Vec<Item>) -> Collection {
        Collection {
            info: CollectionInfo { id: "c".into(), name: "c".into(), version: None, description: None },
            protocol: "http".into(),
            items,
            variables: Default::default(),
            test_data: None,
            pre_request_script: None,
            post_request_script: None,
            auth: None,
        }
    }

    #[test]
    fn folder_post_depends_on_all_descendants() {
        let col = collection(vec![folder("f1", "Folder", vec![request("r1", "A", vec![]), request("r2", "B", vec![])])]);
        let dag = Dag::build(&col, false).unwrap();
        let post = NodeId::FolderPost("f1".into());
        let deps = dag.dependencies(&post);
        assert!(deps.contains(&NodeId::Request("r1".into())));
        assert!(deps.contains(&NodeId::Request("r2".into())));
    }

    #[test]
    fn depends_on_folder_waits_for_its_post_script() {
        let col = collection(vec![
            folder("f1", "Folder", vec![request("r1", "A", vec![])]),
            request("r2", "B", vec!["f1"]),
        ]);
        let dag = Dag::build(&col, false).unwrap();
        let deps = dag.dependencies(&NodeId::Request("r2".into()));
        assert!(deps.contains(&NodeId::FolderPost("f1".into())));
    }

    #[test]
    fn sequential_mode_chains_siblings() {
        let col = collection(vec![request("r1", "A", vec![]), request("r2", "B", vec![])]);
        let dag = Dag::build(&col, true).unwrap();
        let deps = dag.dependencies(&NodeId::Request("r2".into()));
        assert!(deps.contains(&NodeId::Request("r1".into())));
    }

    #[test]
    fn cycle_is_rejected() {
        let col = collection(vec![request("r1", "A", vec!["r2"]), request("r2", "B", vec!["r1"])]);
        assert!(Dag::build(&col, false).is_err());
    }

    #[test]
    fn empty_folder_still_runs_post_after_pre() {
        let col = collection(vec![folder("f1", "Empty", vec![])]);
        let dag = Dag::build(&col, false).unwrap();
        let deps = dag.dependencies(&NodeId::FolderPost("f1".into()));
        assert!(deps.contains(&NodeId::FolderPre("f1".into())));
    }
}
