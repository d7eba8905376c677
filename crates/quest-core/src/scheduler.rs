//! Bounded-concurrency dependency scheduler (spec §4.5/§4.7/§8).
//!
//! Grounded on the teacher's `ChainExecutionEngine` dispatch loop
//! (`request_chaining.rs`): a ready-set drained against a concurrency cap
//! using `tokio::task::JoinSet`, generalized here to walk a [`Dag`] instead
//! of a flat chain.

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use indexmap::{IndexMap, IndexSet};
use tokio::task::JoinSet;

use crate::dag::{Dag, NodeId};
use quest_plugin_core::CancellationToken;

/// A node's execution future. Resolves to `true` when the caller wants the
/// scheduler to stop dispatching new nodes (a `bail`-triggering failure),
/// `false` otherwise.
pub type NodeFuture = Pin<Box<dyn Future<Output = bool> + Send>>;

/// Walks a [`Dag`] to completion, dispatching each node once its
/// dependencies have finished.
pub struct Scheduler<'a> {
    dag: &'a Dag,
}

impl<'a> Scheduler<'a> {
    pub fn new(dag: &'a Dag) -> Self {
        Self { dag }
    }

    /// Whether `id` is a `FolderPost` node whose folder was actually
    /// entered (its `FolderPre` already ran) — the only nodes still
    /// eligible to dispatch once draining (spec §4.7 best-effort cleanup).
    fn is_entered_folder_post(&self, id: &NodeId, done: &IndexSet<NodeId>) -> bool {
        matches!(id, NodeId::FolderPost(folder_id) if done.contains(&NodeId::FolderPre(folder_id.clone())))
    }

    /// Whether dependency `d` of an entered `FolderPost` can be treated as
    /// met while draining: it already ran, or it's the post hook of a
    /// folder that was never entered (no cleanup owed, so it can never
    /// block). A `FolderPost` of an entered-but-unfinished nested folder
    /// still blocks, so nested cleanup still runs innermost-first.
    fn dep_satisfied_while_draining(&self, d: &NodeId, done: &IndexSet<NodeId>) -> bool {
        done.contains(d) || matches!(d, NodeId::FolderPost(folder_id) if !done.contains(&NodeId::FolderPre(folder_id.clone())))
    }

    /// Run every node to completion.
    ///
    /// `execute` is invoked once per node as soon as it becomes ready; its
    /// future is spawned onto the scheduler's own `JoinSet` so up to
    /// `concurrency` nodes run concurrently. Among several simultaneously
    /// ready nodes, the alphabetically-first by name is dispatched first
    /// (spec §4.5 "sorts children alphabetically by name" tie-break).
    ///
    /// A tripped `abort`, or an `execute` future resolving `true` (a bail),
    /// stops new dispatch without cancelling nodes already in flight (spec
    /// §4.7).
    pub async fn run<F>(&self, concurrency: usize, delay_ms: u64, abort: CancellationToken, mut execute: F)
    where
        F: FnMut(NodeId) -> NodeFuture,
    {
        let concurrency = concurrency.max(1);
        let sequential = concurrency == 1;

        let mut remaining: IndexMap<NodeId, IndexSet<NodeId>> =
            self.dag.node_ids().map(|id| (id.clone(), self.dag.dependencies(id).clone())).collect();
        let mut done: IndexSet<NodeId> = IndexSet::new();
        let mut in_flight: IndexSet<NodeId> = IndexSet::new();
        let mut join_set: JoinSet<(NodeId, bool)> = JoinSet::new();
        let mut bailed = false;
        let mut dispatched_any = false;

        loop {
            let draining = bailed || abort.is_aborted();

            loop {
                if in_flight.len() >= concurrency {
                    break;
                }
                let mut ready: Vec<NodeId> = remaining
                    .iter()
                    .filter(|(id, deps)| {
                        if in_flight.contains(*id) {
                            return false;
                        }
                        if draining {
                            // Best-effort cleanup: an already-entered folder
                            // still runs its post hook on abort/bail, but no
                            // new request or not-yet-entered folder dispatches.
                            self.is_entered_folder_post(id, &done)
                                && deps.iter().all(|d| self.dep_satisfied_while_draining(d, &done))
                        } else {
                            deps.iter().all(|d| done.contains(d))
                        }
                    })
                    .map(|(id, _)| id.clone())
                    .collect();
                if ready.is_empty() {
                    break;
                }
                ready.sort_by(|a, b| self.dag.info(a).name.cmp(&self.dag.info(b).name));
                let node = ready.remove(0);

                if !draining && sequential && dispatched_any && delay_ms > 0 {
                    tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                }
                dispatched_any = true;

                in_flight.insert(node.clone());
                let fut = execute(node.clone());
                join_set.spawn(async move { (node, fut.await) });
            }

            if in_flight.is_empty() {
                break;
            }

            match join_set.join_next().await {
                Some(Ok((node, should_bail))) => {
                    in_flight.shift_remove(&node);
                    remaining.shift_remove(&node);
                    done.insert(node);
                    if should_bail {
                        bailed = true;
                    }
                }
                Some(Err(join_err)) => {
                    tracing::error!(error = %join_err, "scheduled node task panicked");
                }
                None => break,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collection::{Collection, CollectionInfo, Folder, Item, ItemCommon, Request};
    use quest_plugin_core::RequestData;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn common(id: &str, depends_on: Vec<&str>) -> ItemCommon {
        ItemCommon {
            id: id.to_string(),
            name: id.to_string(),
            depends_on: depends_on.into_iter().map(String::from).collect(),
            condition: None,
            auth: None,
            pre_request_script: None,
            post_request_script: None,
        }
    }

    fn request(id: &str, depends_on: Vec<&str>) -> Item {
        Item::Request(Request {
            common: common(id, depends_on),
            data: RequestData::new("GET", "https://example.com"),
            options: Default::default(),
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

    #[tokio::test]
    async fn all_nodes_run_exactly_once() {
        let col = collection(vec![request("a", vec![]), request("b", vec![]), request("c", vec!["a"])]);
        let dag = Dag::build(&col, false).unwrap();
        let scheduler = Scheduler::new(&dag);
        let count = Arc::new(AtomicUsize::new(0));
        let abort = CancellationToken::new();
        let c = count.clone();
        scheduler
            .run(4, 0, abort, move |_node| {
                let c = c.clone();
                Box::pin(async move {
                    c.fetch_add(1, Ordering::SeqCst);
                    false
                })
            })
            .await;
        assert_eq!(count.load(Ordering::SeqCst), dag.len());
    }

    #[tokio::test]
    async fn dependency_runs_before_dependent() {
        let col = collection(vec![request("a", vec![]), request("b", vec!["a"])]);
        let dag = Dag::build(&col, false).unwrap();
        let scheduler = Scheduler::new(&dag);
        let order = Arc::new(tokio::sync::Mutex::new(Vec::<String>::new()));
        let abort = CancellationToken::new();
        let o = order.clone();
        scheduler
            .run(4, 0, abort, move |node| {
                let o = o.clone();
                Box::pin(async move {
                    o.lock().await.push(node.to_string());
                    false
                })
            })
            .await;
        let seen = order.lock().await;
        let a_pos = seen.iter().position(|s| s == "request:a").unwrap();
        let b_pos = seen.iter().position(|s| s == "request:b").unwrap();
        assert!(a_pos < b_pos);
    }

    #[tokio::test]
    async fn bail_stops_new_dispatch_but_lets_in_flight_finish() {
        let col = collection(vec![request("a", vec![]), request("b", vec![]), request("c", vec![])]);
        let dag = Dag::build(&col, false).unwrap();
        let scheduler = Scheduler::new(&dag);
        let count = Arc::new(AtomicUsize::new(0));
        let abort = CancellationToken::new();
        let c = count.clone();
        scheduler
            .run(1, 0, abort, move |node| {
                let c = c.clone();
                Box::pin(async move {
                    c.fetch_add(1, Ordering::SeqCst);
                    node.to_string() == "request:a"
                })
            })
            .await;
        // sequential mode forces a->b->c order; bailing after "a" should stop "b"/"c".
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn entered_folder_post_runs_after_bail_but_unentered_folder_post_does_not() {
        let col = collection(vec![
            Item::Folder(Folder {
                common: common("f1", vec![]),
                folder_pre_script: None,
                folder_post_script: Some("1".into()),
                items: vec![request("a1", vec![])],
                test_data: None,
            }),
            Item::Folder(Folder {
                common: common("f2", vec![]),
                folder_pre_script: None,
                folder_post_script: Some("1".into()),
                items: vec![request("b1", vec![])],
                test_data: None,
            }),
        ]);
        let dag = Dag::build(&col, false).unwrap();
        let scheduler = Scheduler::new(&dag);
        let ran = Arc::new(tokio::sync::Mutex::new(Vec::<String>::new()));
        let abort = CancellationToken::new();
        let r = ran.clone();
        scheduler
            .run(1, 0, abort, move |node| {
                let r = r.clone();
                Box::pin(async move {
                    let node_str = node.to_string();
                    r.lock().await.push(node_str.clone());
                    node_str == "request:a1"
                })
            })
            .await;
        let seen = ran.lock().await;
        assert!(seen.contains(&"folder-post:f1".to_string()), "entered folder's post should still run on bail: {seen:?}");
        assert!(!seen.contains(&"folder-pre:f2".to_string()), "never-entered folder should not dispatch: {seen:?}");
        assert!(!seen.contains(&"request:b1".to_string()));
        assert!(!seen.contains(&"folder-post:f2".to_string()));
    }

    #[tokio::test]
    async fn folder_pseudo_nodes_run_in_order() {
        let col = collection(vec![Item::Folder(Folder {
            common: common("f1", vec![]),
            folder_pre_script: Some("1".into()),
            folder_post_script: Some("1".into()),
            items: vec![request("r1", vec![])],
            test_data: None,
        })]);
        let dag = Dag::build(&col, false).unwrap();
        let scheduler = Scheduler::new(&dag);
        let order = Arc::new(tokio::sync::Mutex::new(Vec::<String>::new()));
        let abort = CancellationToken::new();
        let o = order.clone();
        scheduler
            .run(4, 0, abort, move |node| {
                let o = o.clone();
                Box::pin(async move {
                    o.lock().await.push(node.to_string());
                    false
                })
            })
            .await;
        let seen = order.lock().await;
        let pre = seen.iter().position(|s| s == "folder-pre:f1").unwrap();
        let req = seen.iter().position(|s| s == "request:r1").unwrap();
        let post = seen.iter().position(|s| s == "folder-post:f1").unwrap();
        assert!(pre < req && req < post);
    }
}
