use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};

use model_types::FeatureId;
use slotmap::{new_key_type, SlotMap};
use tracing::{debug, info, instrument};

use crate::types::{CallbackId, EngineError, UpdateOutcome, UpdateReport};

new_key_type! {
    /// Arena index of a graph node.
    pub struct NodeKey;
}

type UpdateCallback = Box<dyn FnMut(&FeatureId)>;

struct Node {
    id: FeatureId,
    /// Insertion sequence. Breaks ties in every ordering.
    seq: u64,
    /// Nodes this one reads from.
    dependencies: Vec<NodeKey>,
    /// Nodes reading from this one.
    dependents: Vec<NodeKey>,
    callbacks: Vec<(CallbackId, UpdateCallback)>,
}

/// Directed acyclic graph over feature ids.
///
/// An edge `dependent -> dependency` means the dependent reads the
/// dependency's output. Nodes live in a slot arena; external ids map to
/// arena keys through a side table.
pub struct DependencyGraph {
    nodes: SlotMap<NodeKey, Node>,
    index: HashMap<FeatureId, NodeKey>,
    next_seq: u64,
    next_callback: u64,
}

impl DependencyGraph {
    pub fn new() -> Self {
        Self {
            nodes: SlotMap::with_key(),
            index: HashMap::new(),
            next_seq: 0,
            next_callback: 1,
        }
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn contains(&self, id: &FeatureId) -> bool {
        self.index.contains_key(id)
    }

    fn key(&self, id: &FeatureId) -> Result<NodeKey, EngineError> {
        self.index
            .get(id)
            .copied()
            .ok_or_else(|| EngineError::FeatureNotFound { id: id.clone() })
    }

    /// Register a node with no edges.
    pub fn add_feature(&mut self, id: FeatureId) -> Result<(), EngineError> {
        if self.index.contains_key(&id) {
            return Err(EngineError::DuplicateFeature { id });
        }
        let seq = self.next_seq;
        self.next_seq += 1;
        let key = self.nodes.insert(Node {
            id: id.clone(),
            seq,
            dependencies: Vec::new(),
            dependents: Vec::new(),
            callbacks: Vec::new(),
        });
        self.index.insert(id, key);
        Ok(())
    }

    /// Delete a node together with its incident edges and callbacks.
    pub fn remove_feature(&mut self, id: &FeatureId) -> Result<(), EngineError> {
        let key = self.key(id)?;
        let Some(node) = self.nodes.remove(key) else {
            return Err(EngineError::FeatureNotFound { id: id.clone() });
        };
        for dep in node.dependencies {
            if let Some(n) = self.nodes.get_mut(dep) {
                n.dependents.retain(|k| *k != key);
            }
        }
        for dependent in node.dependents {
            if let Some(n) = self.nodes.get_mut(dependent) {
                n.dependencies.retain(|k| *k != key);
            }
        }
        self.index.remove(id);
        debug!(feature = %id, "graph node removed");
        Ok(())
    }

    /// Add `dependent -> dependency`. Returns `false` if the edge already exists.
    pub fn add_dependency(
        &mut self,
        dependent: &FeatureId,
        dependency: &FeatureId,
    ) -> Result<bool, EngineError> {
        let from = self.key(dependent)?;
        let to = self.key(dependency)?;
        if self.nodes[from].dependencies.contains(&to) {
            return Ok(false);
        }
        if from == to || self.reaches(from, to) {
            return Err(EngineError::CycleDetected {
                dependent: dependent.clone(),
                dependency: dependency.clone(),
            });
        }
        self.nodes[from].dependencies.push(to);
        self.nodes[to].dependents.push(from);
        debug!(%dependent, %dependency, "dependency added");
        Ok(true)
    }

    pub fn remove_dependency(
        &mut self,
        dependent: &FeatureId,
        dependency: &FeatureId,
    ) -> Result<(), EngineError> {
        let from = self.key(dependent)?;
        let to = self.key(dependency)?;
        if !self.nodes[from].dependencies.contains(&to) {
            return Err(EngineError::DependencyNotFound {
                dependent: dependent.clone(),
                dependency: dependency.clone(),
            });
        }
        self.nodes[from].dependencies.retain(|k| *k != to);
        self.nodes[to].dependents.retain(|k| *k != from);
        debug!(%dependent, %dependency, "dependency removed");
        Ok(())
    }

    pub fn has_dependency(&self, dependent: &FeatureId, dependency: &FeatureId) -> bool {
        match (self.index.get(dependent), self.index.get(dependency)) {
            (Some(from), Some(to)) => self.nodes[*from].dependencies.contains(to),
            _ => false,
        }
    }

    /// True if adding `dependent -> dependency` would close a cycle.
    pub fn would_create_cycle(&self, dependent: &FeatureId, dependency: &FeatureId) -> bool {
        match (self.index.get(dependent), self.index.get(dependency)) {
            (Some(from), Some(to)) => from == to || self.reaches(*from, *to),
            _ => false,
        }
    }

    /// Breadth-first walk along dependents edges from `from` looking for `to`.
    fn reaches(&self, from: NodeKey, to: NodeKey) -> bool {
        let mut seen = HashSet::new();
        let mut queue = VecDeque::from([from]);
        while let Some(key) = queue.pop_front() {
            if key == to {
                return true;
            }
            if !seen.insert(key) {
                continue;
            }
            queue.extend(self.nodes[key].dependents.iter().copied());
        }
        false
    }

    fn ids_of(&self, keys: &[NodeKey]) -> Vec<FeatureId> {
        keys.iter()
            .filter_map(|k| self.nodes.get(*k))
            .map(|n| n.id.clone())
            .collect()
    }

    /// Direct dependencies in edge order. Empty for unknown ids.
    pub fn dependencies(&self, id: &FeatureId) -> Vec<FeatureId> {
        self.index
            .get(id)
            .map(|k| self.ids_of(&self.nodes[*k].dependencies))
            .unwrap_or_default()
    }

    /// Direct dependents in edge order. Empty for unknown ids.
    pub fn dependents(&self, id: &FeatureId) -> Vec<FeatureId> {
        self.index
            .get(id)
            .map(|k| self.ids_of(&self.nodes[*k].dependents))
            .unwrap_or_default()
    }

    pub fn has_dependencies(&self, id: &FeatureId) -> bool {
        self.index
            .get(id)
            .is_some_and(|k| !self.nodes[*k].dependencies.is_empty())
    }

    pub fn has_dependents(&self, id: &FeatureId) -> bool {
        self.index
            .get(id)
            .is_some_and(|k| !self.nodes[*k].dependents.is_empty())
    }

    /// Every node in insertion order.
    pub fn features(&self) -> Vec<FeatureId> {
        let mut nodes: Vec<&Node> = self.nodes.values().collect();
        nodes.sort_by_key(|n| n.seq);
        nodes.into_iter().map(|n| n.id.clone()).collect()
    }

    fn sorted(&self, keys: &[NodeKey], descending: bool) -> Vec<NodeKey> {
        let mut out = keys.to_vec();
        out.sort_by_key(|k| self.nodes[*k].seq);
        if descending {
            out.reverse();
        }
        out
    }

    /// Depth-first post-order from `start`, following dependents or dependencies.
    fn post_order(&self, start: NodeKey, along_dependents: bool) -> Vec<NodeKey> {
        let children = |key: NodeKey| {
            let node = &self.nodes[key];
            if along_dependents {
                // Reversed later, so visit later siblings first.
                self.sorted(&node.dependents, true)
            } else {
                self.sorted(&node.dependencies, false)
            }
        };

        let mut visited = HashSet::from([start]);
        let mut post = Vec::new();
        let mut stack = vec![(start, children(start), 0usize)];
        loop {
            let Some(frame) = stack.last_mut() else {
                break;
            };
            if frame.2 < frame.1.len() {
                let child = frame.1[frame.2];
                frame.2 += 1;
                if visited.insert(child) {
                    stack.push((child, children(child), 0));
                }
            } else {
                let node = frame.0;
                stack.pop();
                post.push(node);
            }
        }
        post
    }

    /// Transitive dependents of `id` in topological order, excluding `id`.
    pub fn update_order(&self, id: &FeatureId) -> Result<Vec<FeatureId>, EngineError> {
        let start = self.key(id)?;
        let mut order = self.post_order(start, true);
        order.reverse();
        Ok(self.ids_of(&order[1..]))
    }

    /// Transitive dependencies of `id`, dependencies first, excluding `id`.
    pub fn upstream_order(&self, id: &FeatureId) -> Result<Vec<FeatureId>, EngineError> {
        let start = self.key(id)?;
        let mut order = self.post_order(start, false);
        order.pop();
        Ok(self.ids_of(&order))
    }

    /// Every node in dependency order. Ties go to the earlier-inserted node.
    pub fn topological_order(&self) -> Vec<FeatureId> {
        let mut indegree: HashMap<NodeKey, usize> = self
            .nodes
            .iter()
            .map(|(k, n)| (k, n.dependencies.len()))
            .collect();
        let mut ready: BTreeMap<u64, NodeKey> = self
            .nodes
            .iter()
            .filter(|(_, n)| n.dependencies.is_empty())
            .map(|(k, n)| (n.seq, k))
            .collect();

        let mut order = Vec::with_capacity(self.nodes.len());
        while let Some((_, key)) = ready.pop_first() {
            order.push(key);
            for dependent in &self.nodes[key].dependents {
                if let Some(d) = indegree.get_mut(dependent) {
                    *d -= 1;
                    if *d == 0 {
                        ready.insert(self.nodes[*dependent].seq, *dependent);
                    }
                }
            }
        }
        self.ids_of(&order)
    }

    /// Register a callback fired each time `id` is updated.
    pub fn on_update(
        &mut self,
        id: &FeatureId,
        callback: impl FnMut(&FeatureId) + 'static,
    ) -> Result<CallbackId, EngineError> {
        let key = self.key(id)?;
        let cb = CallbackId(self.next_callback);
        self.next_callback += 1;
        self.nodes[key].callbacks.push((cb, Box::new(callback)));
        Ok(cb)
    }

    pub fn remove_update_callback(
        &mut self,
        id: &FeatureId,
        callback: CallbackId,
    ) -> Result<(), EngineError> {
        let key = self.key(id)?;
        let callbacks = &mut self.nodes[key].callbacks;
        let before = callbacks.len();
        callbacks.retain(|(cb, _)| *cb != callback);
        if callbacks.len() == before {
            return Err(EngineError::CallbackNotFound { id: callback });
        }
        Ok(())
    }

    fn notify(&mut self, id: &FeatureId) {
        let Some(&key) = self.index.get(id) else {
            return;
        };
        for (_, callback) in self.nodes[key].callbacks.iter_mut() {
            callback(id);
        }
    }

    /// Evaluate `order` in sequence, firing update callbacks after each feature.
    pub fn run(
        &mut self,
        order: &[FeatureId],
        evaluate: &mut dyn FnMut(&FeatureId) -> UpdateOutcome,
        report: &mut UpdateReport,
    ) {
        for id in order {
            let outcome = evaluate(id);
            let missing = outcome == UpdateOutcome::Missing;
            report.record(id, outcome);
            if !missing {
                self.notify(id);
            }
        }
    }

    /// Evaluate `id`, then every transitive dependent in topological order.
    ///
    /// A failed evaluation does not stop the cascade.
    #[instrument(skip(self, id, evaluate), fields(feature = %id))]
    pub fn update_feature<F>(&mut self, id: &FeatureId, mut evaluate: F) -> Result<UpdateReport, EngineError>
    where
        F: FnMut(&FeatureId) -> UpdateOutcome,
    {
        let mut order = vec![id.clone()];
        order.extend(self.update_order(id)?);
        let mut report = UpdateReport::default();
        self.run(&order, &mut evaluate, &mut report);
        info!(
            evaluated = report.evaluated.len(),
            failed = report.failed.len(),
            "update cascade finished"
        );
        Ok(report)
    }

    /// Evaluate every node exactly once in global topological order.
    #[instrument(skip(self, evaluate))]
    pub fn update_all<F>(&mut self, mut evaluate: F) -> UpdateReport
    where
        F: FnMut(&FeatureId) -> UpdateOutcome,
    {
        let order = self.topological_order();
        let mut report = UpdateReport::default();
        self.run(&order, &mut evaluate, &mut report);
        info!(
            evaluated = report.evaluated.len(),
            failed = report.failed.len(),
            "full update finished"
        );
        report
    }
}

impl Default for DependencyGraph {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    fn id(s: &str) -> FeatureId {
        FeatureId::new(s)
    }

    fn graph(nodes: &[&str], edges: &[(&str, &str)]) -> DependencyGraph {
        let mut g = DependencyGraph::new();
        for n in nodes {
            g.add_feature(id(n)).unwrap();
        }
        for (dependent, dependency) in edges {
            g.add_dependency(&id(dependent), &id(dependency)).unwrap();
        }
        g
    }

    fn names(ids: &[FeatureId]) -> Vec<&str> {
        ids.iter().map(FeatureId::as_str).collect()
    }

    #[test]
    fn duplicate_node_rejected() {
        let mut g = graph(&["a"], &[]);
        assert!(matches!(
            g.add_feature(id("a")),
            Err(EngineError::DuplicateFeature { .. })
        ));
    }

    #[test]
    fn existing_edge_is_a_no_op() {
        let mut g = graph(&["a", "b"], &[("a", "b")]);
        assert!(!g.add_dependency(&id("a"), &id("b")).unwrap());
        assert_eq!(g.dependencies(&id("a")), vec![id("b")]);
        assert_eq!(g.dependents(&id("b")), vec![id("a")]);
    }

    #[test]
    fn cycles_are_rejected_and_graph_unchanged() {
        // a depends on b, b depends on c.
        let mut g = graph(&["a", "b", "c"], &[("a", "b"), ("b", "c")]);
        assert!(g.would_create_cycle(&id("c"), &id("a")));
        let err = g.add_dependency(&id("c"), &id("a")).unwrap_err();
        assert!(matches!(err, EngineError::CycleDetected { .. }));
        assert!(g.dependencies(&id("c")).is_empty());
        assert!(g.dependents(&id("a")).is_empty());

        assert!(g.add_dependency(&id("a"), &id("a")).is_err());
        // The reverse shortcut is fine.
        assert!(g.add_dependency(&id("a"), &id("c")).unwrap());
    }

    #[test]
    fn missing_endpoints() {
        let mut g = graph(&["a"], &[]);
        assert!(matches!(
            g.add_dependency(&id("a"), &id("zz")),
            Err(EngineError::FeatureNotFound { .. })
        ));
        assert!(matches!(
            g.remove_dependency(&id("a"), &id("a")),
            Err(EngineError::DependencyNotFound { .. })
        ));
        assert!(g.dependencies(&id("zz")).is_empty());
    }

    #[test]
    fn remove_feature_drops_incident_edges() {
        let mut g = graph(&["a", "b", "c"], &[("b", "a"), ("c", "b")]);
        g.remove_feature(&id("b")).unwrap();
        assert!(!g.has_dependents(&id("a")));
        assert!(!g.has_dependencies(&id("c")));
        assert_eq!(names(&g.features()), ["a", "c"]);
    }

    #[test]
    fn update_order_is_topological_with_insertion_ties() {
        // Diamond: b and c read a, d reads b and c.
        let g = graph(
            &["a", "b", "c", "d"],
            &[("b", "a"), ("c", "a"), ("d", "b"), ("d", "c")],
        );
        assert_eq!(names(&g.update_order(&id("a")).unwrap()), ["b", "c", "d"]);
        assert_eq!(names(&g.update_order(&id("c")).unwrap()), ["d"]);
        assert!(g.update_order(&id("d")).unwrap().is_empty());
    }

    #[test]
    fn upstream_order_lists_dependencies_first() {
        let g = graph(&["a", "b", "c"], &[("b", "a"), ("c", "b")]);
        assert_eq!(names(&g.upstream_order(&id("c")).unwrap()), ["a", "b"]);
        assert!(g.upstream_order(&id("a")).unwrap().is_empty());
    }

    #[test]
    fn global_topological_order() {
        // Inserted in reverse dependency order.
        let g = graph(&["c", "b", "a"], &[("c", "b"), ("b", "a")]);
        assert_eq!(names(&g.topological_order()), ["a", "b", "c"]);

        let g = graph(&["x", "y", "z"], &[]);
        assert_eq!(names(&g.topological_order()), ["x", "y", "z"]);
    }

    #[test]
    fn cascade_fires_callbacks_between_evaluations() {
        let mut g = graph(&["a", "b", "c"], &[("b", "a"), ("c", "b")]);
        let log = Rc::new(RefCell::new(Vec::new()));

        for n in ["a", "b", "c"] {
            let sink = log.clone();
            g.on_update(&id(n), move |f| sink.borrow_mut().push(format!("cb:{f}")))
                .unwrap();
        }

        let eval_log = log.clone();
        let report = g
            .update_feature(&id("a"), |f| {
                eval_log.borrow_mut().push(format!("eval:{f}"));
                UpdateOutcome::Valid
            })
            .unwrap();

        assert_eq!(names(&report.evaluated), ["a", "b", "c"]);
        assert_eq!(
            *log.borrow(),
            ["eval:a", "cb:a", "eval:b", "cb:b", "eval:c", "cb:c"]
        );
    }

    #[test]
    fn failures_do_not_stop_the_cascade() {
        let mut g = graph(&["a", "b", "c"], &[("b", "a"), ("c", "b")]);
        let report = g
            .update_feature(&id("a"), |f| {
                if f.as_str() == "b" {
                    UpdateOutcome::Failed {
                        reason: "bad".into(),
                    }
                } else {
                    UpdateOutcome::Valid
                }
            })
            .unwrap();
        assert_eq!(report.evaluated.len(), 3);
        assert_eq!(report.failed, vec![(id("b"), "bad".to_string())]);
    }

    #[test]
    fn callbacks_can_be_removed() {
        let mut g = graph(&["a"], &[]);
        let hits = Rc::new(RefCell::new(0));
        let sink = hits.clone();
        let cb = g.on_update(&id("a"), move |_| *sink.borrow_mut() += 1).unwrap();
        g.update_all(|_| UpdateOutcome::Valid);
        g.remove_update_callback(&id("a"), cb).unwrap();
        g.update_all(|_| UpdateOutcome::Valid);
        assert_eq!(*hits.borrow(), 1);
        assert!(g.remove_update_callback(&id("a"), cb).is_err());
    }
}
