//! Generic Monte Carlo tree search over environment states.
//!
//! Values are costs: lower is better. Each node records the best value seen
//! anywhere in its subtree and how often it was visited.

use crate::error::ScheduleResult;
use log::{debug, trace};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;
use std::fmt;

/// Number of votes distributed among children during selection.
const SELECTION_VOTES: f64 = 30.0;

/// A state the search can explore.
pub trait EnvironmentState: Sized {
    type Action: Clone + fmt::Display;

    /// Number of actions not yet tried from this state.
    fn legal_actions(&self) -> usize;

    /// Remove and return the `index`-th untried action.
    fn next_action(&mut self, index: usize) -> Option<Self::Action>;

    /// Apply `action` to a copy of this state. `Ok(None)` means the action
    /// was rejected and the branch must not be expanded.
    fn perform_action(&self, action: &Self::Action) -> ScheduleResult<Option<Self>>;

    /// Evaluate this state. Unusable states report `f64::INFINITY`.
    fn roll_out(&mut self) -> ScheduleResult<f64>;
}

/// One node of the search tree.
pub struct SearchNode<S: EnvironmentState> {
    pub state: S,
    pub parent: Option<usize>,
    pub children: Vec<usize>,
    /// Action that led here from the parent
    pub action: Option<S::Action>,
    /// Lowest value seen in this subtree
    pub quality: f64,
    pub visits: u64,
}

/// Serializable view of a search subtree.
#[derive(Debug, Clone, Serialize)]
pub struct NodeDump {
    pub id: usize,
    pub action: Option<String>,
    /// `None` while no finite value has been seen
    pub quality: Option<f64>,
    pub visits: u64,
    pub children: Vec<NodeDump>,
}

/// UCB-driven Monte Carlo tree search.
pub struct MctsSearcher<S: EnvironmentState> {
    nodes: Vec<SearchNode<S>>,
    rng: StdRng,
    exploration: f64,
    temperature: f64,
    best_value: f64,
    best_node: Option<usize>,
    rollouts: usize,
}

impl<S: EnvironmentState> MctsSearcher<S> {
    pub fn new(root: S, seed: u64) -> Self {
        Self {
            nodes: vec![SearchNode {
                state: root,
                parent: None,
                children: Vec::new(),
                action: None,
                quality: f64::INFINITY,
                visits: 0,
            }],
            rng: StdRng::seed_from_u64(seed),
            exploration: std::f64::consts::SQRT_2,
            temperature: 0.5,
            best_value: f64::INFINITY,
            best_node: None,
            rollouts: 0,
        }
    }

    /// Set the exploration constant and softmax temperature.
    pub fn with_exploration(mut self, exploration: f64, temperature: f64) -> Self {
        self.exploration = exploration;
        self.temperature = if temperature > 0.0 { temperature } else { 0.5 };
        self
    }

    /// Run `iterations` rounds of selection, expansion, simulation and
    /// backpropagation.
    pub fn search(&mut self, iterations: usize) -> ScheduleResult<()> {
        for i in 0..iterations {
            let selected = self.select(0);
            let Some(node) = self.expand(selected)? else {
                trace!("iteration {}: expansion of node {} rejected", i, selected);
                continue;
            };
            let value = self.simulate(node)?;
            debug!("iteration {}: node {} value {}", i, node, value);
            self.backpropagate(node, value);
        }
        Ok(())
    }

    /// Walk down fully expanded nodes.
    fn select(&mut self, mut id: usize) -> usize {
        while self.nodes[id].state.legal_actions() == 0 && !self.nodes[id].children.is_empty() {
            id = self.ucb_select_child(id);
        }
        id
    }

    /// Sample a child with probability derived from its UCB score.
    ///
    /// Scores go through a softmax and are turned into integer vote counts.
    /// When no child gets a vote the pick is uniform.
    fn ucb_select_child(&mut self, id: usize) -> usize {
        let node = &self.nodes[id];
        let scale = if self.best_value.is_finite() && self.best_value > 0.0 {
            self.best_value
        } else {
            1.0
        };
        let ln_visits = (node.visits.max(1) as f64).ln();
        let weights: Vec<f64> = node
            .children
            .iter()
            .map(|&c| {
                let child = &self.nodes[c];
                if !child.quality.is_finite() {
                    return 0.0;
                }
                let exploit = -child.quality / scale;
                let explore = self.exploration * (ln_visits / child.visits.max(1) as f64).sqrt();
                ((exploit + explore) / self.temperature).exp()
            })
            .collect();
        let sum: f64 = weights.iter().sum();

        let mut candidates = Vec::new();
        if sum > 0.0 && sum.is_finite() {
            for (i, w) in weights.iter().enumerate() {
                let votes = (w / sum * SELECTION_VOTES) as usize;
                candidates.extend(std::iter::repeat(i).take(votes));
            }
        }
        let pick = if candidates.is_empty() {
            self.rng.gen_range(0..node.children.len())
        } else {
            candidates[self.rng.gen_range(0..candidates.len())]
        };
        self.nodes[id].children[pick]
    }

    /// Expand one untried action of a visited node. Unvisited or exhausted
    /// nodes are simulated as they are.
    fn expand(&mut self, id: usize) -> ScheduleResult<Option<usize>> {
        let legal = self.nodes[id].state.legal_actions();
        if self.nodes[id].visits == 0 || legal == 0 {
            return Ok(Some(id));
        }
        // first untried action; ordering is left to selection
        let Some(action) = self.nodes[id].state.next_action(0) else {
            return Ok(None);
        };
        match self.nodes[id].state.perform_action(&action)? {
            Some(state) => {
                let child = self.nodes.len();
                self.nodes.push(SearchNode {
                    state,
                    parent: Some(id),
                    children: Vec::new(),
                    action: Some(action),
                    quality: f64::INFINITY,
                    visits: 0,
                });
                self.nodes[id].children.push(child);
                Ok(Some(child))
            }
            None => {
                debug!("rejected action {}", action);
                Ok(None)
            }
        }
    }

    fn simulate(&mut self, id: usize) -> ScheduleResult<f64> {
        let value = self.nodes[id].state.roll_out()?;
        self.rollouts += 1;
        if value < self.best_value {
            self.best_value = value;
            self.best_node = Some(id);
        }
        Ok(value)
    }

    fn backpropagate(&mut self, id: usize, value: f64) {
        let mut cur = Some(id);
        while let Some(n) = cur {
            let node = &mut self.nodes[n];
            if value < node.quality {
                node.quality = value;
            }
            node.visits += 1;
            cur = node.parent;
        }
    }

    pub fn root(&self) -> &SearchNode<S> {
        &self.nodes[0]
    }

    pub fn node(&self, id: usize) -> &SearchNode<S> {
        &self.nodes[id]
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Number of simulations run.
    pub fn rollouts(&self) -> usize {
        self.rollouts
    }

    /// Lowest finite value seen.
    pub fn best_value(&self) -> Option<f64> {
        self.best_value.is_finite().then_some(self.best_value)
    }

    /// Node that produced the best value.
    pub fn best_node(&self) -> Option<usize> {
        self.best_node.filter(|_| self.best_value.is_finite())
    }

    /// Actions from the root down to `id`.
    pub fn path(&self, id: usize) -> Vec<S::Action> {
        let mut actions = Vec::new();
        let mut cur = Some(id);
        while let Some(n) = cur {
            if let Some(a) = &self.nodes[n].action {
                actions.push(a.clone());
            }
            cur = self.nodes[n].parent;
        }
        actions.reverse();
        actions
    }

    /// Serializable view of the whole search tree.
    pub fn dump(&self) -> NodeDump {
        self.dump_node(0)
    }

    fn dump_node(&self, id: usize) -> NodeDump {
        let node = &self.nodes[id];
        NodeDump {
            id,
            action: node.action.as_ref().map(|a| a.to_string()),
            quality: node.quality.is_finite().then_some(node.quality),
            visits: node.visits,
            children: node.children.iter().map(|&c| self.dump_node(c)).collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Pick digits one at a time; the value is the number formed, with
    /// digit 0 rejected.
    struct Digits {
        prefix: Vec<u32>,
        untried: Vec<u32>,
        depth: usize,
    }

    impl Digits {
        fn new(depth: usize) -> Self {
            Self {
                prefix: Vec::new(),
                untried: (0..4).collect(),
                depth,
            }
        }
    }

    impl EnvironmentState for Digits {
        type Action = u32;

        fn legal_actions(&self) -> usize {
            if self.prefix.len() == self.depth {
                0
            } else {
                self.untried.len()
            }
        }

        fn next_action(&mut self, index: usize) -> Option<u32> {
            (index < self.untried.len()).then(|| self.untried.remove(index))
        }

        fn perform_action(&self, action: &u32) -> ScheduleResult<Option<Self>> {
            if *action == 0 {
                return Ok(None);
            }
            let mut prefix = self.prefix.clone();
            prefix.push(*action);
            Ok(Some(Self {
                prefix,
                untried: (0..4).collect(),
                depth: self.depth,
            }))
        }

        fn roll_out(&mut self) -> ScheduleResult<f64> {
            if self.prefix.is_empty() {
                return Ok(f64::INFINITY);
            }
            Ok(self.prefix.iter().fold(0, |acc, d| acc * 10 + d) as f64 + 100.0 * (self.depth - self.prefix.len()) as f64)
        }
    }

    #[test]
    fn test_finds_minimum() {
        let mut searcher = MctsSearcher::new(Digits::new(2), 1010);
        searcher.search(200).unwrap();
        assert_eq!(searcher.best_value(), Some(11.0));
        let best = searcher.best_node().unwrap();
        assert_eq!(searcher.path(best), vec![1, 1]);
    }

    #[test]
    fn test_quality_is_subtree_minimum() {
        let mut searcher = MctsSearcher::new(Digits::new(2), 3);
        searcher.search(50).unwrap();
        for id in 0..searcher.len() {
            let node = searcher.node(id);
            for &c in &node.children {
                assert!(node.quality <= searcher.node(c).quality);
                assert!(node.visits >= searcher.node(c).visits);
            }
        }
        assert_eq!(searcher.root().quality, searcher.best_value().unwrap());
    }

    #[test]
    fn test_infeasible_root_has_no_best() {
        let mut searcher = MctsSearcher::new(Digits::new(0), 1);
        searcher.search(5).unwrap();
        assert_eq!(searcher.best_value(), None);
        assert_eq!(searcher.rollouts(), 5);
        let dump = searcher.dump();
        assert_eq!(dump.visits, 5);
        assert!(dump.quality.is_none());
    }
}
