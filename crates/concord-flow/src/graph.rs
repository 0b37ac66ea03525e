use std::collections::{HashMap, HashSet, VecDeque};

use crate::error::FlowError;
use crate::flow::Step;

/// Dependency graph over the steps of a flow.
///
/// Edges run from a step to the steps that depend on it. A barrier also
/// receives an implicit edge from its `wait_for` step.
#[derive(Debug, Clone)]
pub struct Graph {
  /// Step ids in declaration order.
  order: Vec<String>,
  /// Adjacency list: step_id -> list of downstream step_ids.
  adjacency: HashMap<String, Vec<String>>,
  /// Reverse adjacency: step_id -> list of upstream step_ids.
  reverse_adjacency: HashMap<String, Vec<String>>,
  /// Steps with no incoming edges.
  entry_points: Vec<String>,
}

impl Graph {
  /// Build a graph from steps. Edges to unknown steps are ignored.
  pub fn new(steps: &[Step]) -> Self {
    let mut adjacency: HashMap<String, Vec<String>> = HashMap::new();
    let mut reverse_adjacency: HashMap<String, Vec<String>> = HashMap::new();

    for step in steps {
      adjacency.entry(step.id.clone()).or_default();
      reverse_adjacency.entry(step.id.clone()).or_default();
    }

    for step in steps {
      let mut upstream: Vec<&String> = step.depends_on.iter().collect();
      if let Some(barrier) = &step.barrier
        && !step.depends_on.contains(&barrier.wait_for)
      {
        upstream.push(&barrier.wait_for);
      }

      for from in upstream {
        if !adjacency.contains_key(from) {
          continue;
        }
        adjacency.entry(from.clone()).or_default().push(step.id.clone());
        reverse_adjacency
          .entry(step.id.clone())
          .or_default()
          .push(from.clone());
      }
    }

    let order: Vec<String> = steps.iter().map(|s| s.id.clone()).collect();
    let entry_points = order
      .iter()
      .filter(|id| reverse_adjacency.get(*id).is_none_or(|v| v.is_empty()))
      .cloned()
      .collect();

    Self {
      order,
      adjacency,
      reverse_adjacency,
      entry_points,
    }
  }

  /// Get entry points (steps with no upstream).
  pub fn entry_points(&self) -> &[String] {
    &self.entry_points
  }

  /// Get downstream steps for a given step.
  pub fn downstream(&self, step_id: &str) -> &[String] {
    self
      .adjacency
      .get(step_id)
      .map(|v| v.as_slice())
      .unwrap_or(&[])
  }

  /// Get upstream steps for a given step.
  pub fn upstream(&self, step_id: &str) -> &[String] {
    self
      .reverse_adjacency
      .get(step_id)
      .map(|v| v.as_slice())
      .unwrap_or(&[])
  }

  /// Every step reachable by walking upstream edges from `step_id`.
  pub fn ancestors(&self, step_id: &str) -> HashSet<String> {
    let mut seen = HashSet::new();
    let mut queue: VecDeque<&str> = VecDeque::from([step_id]);

    while let Some(current) = queue.pop_front() {
      for parent in self.upstream(current) {
        if seen.insert(parent.clone()) {
          queue.push_back(parent);
        }
      }
    }

    seen
  }

  /// Find one cycle, returned as a closed path such as `[a, b, a]`.
  pub fn find_cycle(&self) -> Option<Vec<String>> {
    #[derive(Clone, Copy, PartialEq)]
    enum Mark {
      Visiting,
      Done,
    }

    fn visit(
      graph: &Graph,
      id: &str,
      marks: &mut HashMap<String, Mark>,
      path: &mut Vec<String>,
    ) -> Option<Vec<String>> {
      match marks.get(id) {
        Some(Mark::Done) => return None,
        Some(Mark::Visiting) => {
          let start = path.iter().position(|p| p == id)?;
          let mut cycle = path[start..].to_vec();
          cycle.push(id.to_string());
          return Some(cycle);
        }
        None => {}
      }

      marks.insert(id.to_string(), Mark::Visiting);
      path.push(id.to_string());
      for next in graph.downstream(id) {
        if let Some(cycle) = visit(graph, next, marks, path) {
          return Some(cycle);
        }
      }
      path.pop();
      marks.insert(id.to_string(), Mark::Done);
      None
    }

    let mut marks = HashMap::new();
    for id in &self.order {
      let mut path = Vec::new();
      if let Some(cycle) = visit(self, id, &mut marks, &mut path) {
        return Some(cycle);
      }
    }
    None
  }

  /// Step ids ordered so that every step follows its upstream steps.
  /// Ties keep declaration order.
  pub fn topological_order(&self) -> Result<Vec<String>, FlowError> {
    let mut remaining: HashMap<&str, usize> = self
      .order
      .iter()
      .map(|id| (id.as_str(), self.upstream(id).len()))
      .collect();
    let mut sorted = Vec::with_capacity(self.order.len());

    while sorted.len() < self.order.len() {
      let next = self
        .order
        .iter()
        .find(|id| remaining.get(id.as_str()) == Some(&0));

      let Some(next) = next else {
        let cycle = self.find_cycle().unwrap_or_default();
        return Err(FlowError::Cycle { cycle });
      };

      remaining.remove(next.as_str());
      for child in self.downstream(next) {
        if let Some(count) = remaining.get_mut(child.as_str()) {
          *count = count.saturating_sub(1);
        }
      }
      sorted.push(next.clone());
    }

    Ok(sorted)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::flow::{Barrier, Run};
  use concord_config::Strategy;

  fn step(id: &str, depends_on: &[&str]) -> Step {
    Step {
      id: id.to_string(),
      name: id.to_string(),
      description: None,
      number: 0,
      run: Some(Run {
        targets: vec!["all".to_string()],
        strategy: Strategy::Parallel,
      }),
      depends_on: depends_on.iter().map(|s| s.to_string()).collect(),
      barrier: None,
      shares: Vec::new(),
    }
  }

  #[test]
  fn test_linear_graph() {
    let steps = vec![step("c", &["b"]), step("a", &[]), step("b", &["a"])];
    let graph = Graph::new(&steps);

    assert_eq!(graph.entry_points(), &["a".to_string()]);
    assert_eq!(graph.downstream("a"), &["b".to_string()]);
    assert_eq!(graph.upstream("c"), &["b".to_string()]);
    assert_eq!(graph.topological_order().unwrap(), vec!["a", "b", "c"]);
    assert!(graph.find_cycle().is_none());
  }

  #[test]
  fn test_ancestors() {
    let steps = vec![
      step("a", &[]),
      step("b", &["a"]),
      step("c", &[]),
      step("d", &["b", "c"]),
    ];
    let graph = Graph::new(&steps);

    let ancestors = graph.ancestors("d");
    assert_eq!(ancestors.len(), 3);
    assert!(graph.ancestors("a").is_empty());
  }

  #[test]
  fn test_two_step_cycle() {
    let steps = vec![step("A", &["B"]), step("B", &["A"])];
    let graph = Graph::new(&steps);

    assert_eq!(graph.find_cycle().unwrap(), vec!["A", "B", "A"]);
    let err = graph.topological_order().unwrap_err();
    assert_eq!(err.to_string(), "dependency cycle: A -> B -> A");
  }

  #[test]
  fn test_barrier_wait_for_is_an_edge() {
    let mut barrier = step("ready", &[]);
    barrier.run = None;
    barrier.barrier = Some(Barrier {
      wait_for: "a".to_string(),
      targets: vec!["all".to_string()],
      timeout_secs: None,
    });
    let steps = vec![step("a", &[]), barrier];
    let graph = Graph::new(&steps);

    assert_eq!(graph.upstream("ready"), &["a".to_string()]);
    assert_eq!(graph.topological_order().unwrap(), vec!["a", "ready"]);
  }
}
