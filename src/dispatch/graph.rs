//! Step dependency resolution.
//!
//! Steps reference each other only through named outputs: a step consuming
//! input "A" depends on whichever step produces output "A". This forms a
//! bipartite graph of step nodes and name nodes. Execution order is a
//! topological sort of that graph, computed via Tarjan's strongly connected
//! components so cycles are detected in the same pass: any component with
//! more than one node means a step (transitively) feeds itself.

use std::collections::{BTreeMap, BTreeSet};

use itertools::Itertools as _;

use super::Step;
use crate::errplan;
use crate::error::Result;

/// A graph node: either a step (by position) or a named output.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
enum Node<'a> {
    Step(usize),
    Output(&'a str),
}

/// Returns the indexes of the given steps in dependency order, so every step
/// comes after the producers of all its inputs. Fails on cyclic dependencies
/// and on inputs no step produces.
pub fn sort(steps: &[Step]) -> Result<Vec<usize>> {
    // Map each output name to its producing steps.
    let mut producers: BTreeMap<&str, Vec<usize>> = BTreeMap::new();
    for (i, step) in steps.iter().enumerate() {
        for output in &step.outputs {
            producers.entry(output).or_default().push(i);
        }
    }

    // Edges point at dependencies: step -> consumed name -> producing step.
    let mut edges: BTreeMap<Node<'_>, Vec<Node<'_>>> = BTreeMap::new();
    for (i, step) in steps.iter().enumerate() {
        for input in &step.inputs {
            let Some(sources) = producers.get(input.as_str()) else {
                return errplan!("step {} consumes undefined input {input}", step.kind);
            };
            edges.entry(Node::Step(i)).or_default().push(Node::Output(input));
            let dependencies = edges.entry(Node::Output(input)).or_default();
            for source in sources {
                dependencies.push(Node::Step(*source));
            }
        }
    }

    let mut tarjan = Tarjan::default();
    for i in 0..steps.len() {
        if !tarjan.index.contains_key(&Node::Step(i)) {
            tarjan.visit(Node::Step(i), &edges);
        }
    }

    // Components complete only after everything they depend on, so their
    // completion order is execution order.
    let mut order = Vec::with_capacity(steps.len());
    for component in tarjan.components {
        if component.len() > 1 {
            let cycle = component
                .iter()
                .filter_map(|node| match node {
                    Node::Step(i) => Some(steps[*i].kind.as_str()),
                    Node::Output(_) => None,
                })
                .join(", ");
            return errplan!("cyclic steps: {cycle}");
        }
        if let [Node::Step(i)] = component[..] {
            order.push(i);
        }
    }
    Ok(order)
}

/// Tarjan's strongly-connected-components state.
#[derive(Default)]
struct Tarjan<'a> {
    index: BTreeMap<Node<'a>, usize>,
    lowlink: BTreeMap<Node<'a>, usize>,
    stack: Vec<Node<'a>>,
    on_stack: BTreeSet<Node<'a>>,
    next_index: usize,
    components: Vec<Vec<Node<'a>>>,
}

impl<'a> Tarjan<'a> {
    fn visit(&mut self, node: Node<'a>, edges: &BTreeMap<Node<'a>, Vec<Node<'a>>>) {
        self.index.insert(node, self.next_index);
        self.lowlink.insert(node, self.next_index);
        self.next_index += 1;
        self.stack.push(node);
        self.on_stack.insert(node);

        for &next in edges.get(&node).map(Vec::as_slice).unwrap_or_default() {
            if !self.index.contains_key(&next) {
                self.visit(next, edges);
                let low = self.lowlink[&node].min(self.lowlink[&next]);
                self.lowlink.insert(node, low);
            } else if self.on_stack.contains(&next) {
                let low = self.lowlink[&node].min(self.index[&next]);
                self.lowlink.insert(node, low);
            }
        }

        if self.lowlink[&node] == self.index[&node] {
            let mut component = Vec::new();
            loop {
                let member = self.stack.pop().expect("stack underflow");
                self.on_stack.remove(&member);
                component.push(member);
                if member == node {
                    break;
                }
            }
            self.components.push(component);
        }
    }
}
