use std::collections::HashMap;
use std::hash::Hash;

#[derive(Clone, Copy, PartialEq, Eq)]
enum Mark {
    InProgress,
    Done,
}

/// Iterative three-colour DFS over the nodes reachable from `roots`.
///
/// `successors` is only called for nodes actually visited, so callers backed by an index
/// pay for the explored region rather than the whole graph.
pub fn has_cycle<N, I, F>(roots: I, mut successors: F) -> bool
where
    N: Clone + Eq + Hash,
    I: IntoIterator<Item = N>,
    F: FnMut(&N) -> Vec<N>,
{
    let mut marks: HashMap<N, Mark> = HashMap::new();

    for root in roots {
        if marks.contains_key(&root) {
            continue;
        }
        marks.insert(root.clone(), Mark::InProgress);
        let mut stack: Vec<(N, std::vec::IntoIter<N>)> =
            vec![(root.clone(), successors(&root).into_iter())];

        while let Some((_, children)) = stack.last_mut() {
            match children.next() {
                Some(child) => match marks.get(&child) {
                    Some(Mark::InProgress) => return true,
                    Some(Mark::Done) => {}
                    None => {
                        marks.insert(child.clone(), Mark::InProgress);
                        let next = successors(&child).into_iter();
                        stack.push((child, next));
                    }
                },
                None => {
                    if let Some((node, _)) = stack.pop() {
                        marks.insert(node, Mark::Done);
                    }
                }
            }
        }
    }
    false
}
