use std::collections::HashSet;
use std::hash::Hash;

/// The keys on a dependency cycle, first key repeated at the end.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cycle<K>(pub Vec<K>);

/// Depth-first topological sort.
///
/// Returns every key reachable from `roots` through `dependencies`, each one
/// after all of its dependencies. Ties follow the order of `roots` and of the
/// lists `dependencies` returns, so the result is deterministic.
pub fn topological_sort<K>(
    roots: impl IntoIterator<Item = K>,
    dependencies: impl Fn(&K) -> Vec<K>,
) -> Result<Vec<K>, Cycle<K>>
where
    K: Hash + Eq + Clone,
{
    struct Search<'a, K> {
        dependencies: &'a dyn Fn(&K) -> Vec<K>,
        done: HashSet<K>,
        on_stack: HashSet<K>,
        stack: Vec<K>,
        order: Vec<K>,
    }

    impl<K: Hash + Eq + Clone> Search<'_, K> {
        fn visit(&mut self, key: K) -> Result<(), Cycle<K>> {
            if self.done.contains(&key) {
                return Ok(());
            }
            if self.on_stack.contains(&key) {
                let start = self.stack.iter().rposition(|k| *k == key).unwrap_or(0);
                let mut keys = self.stack[start..].to_vec();
                keys.push(key);
                return Err(Cycle(keys));
            }
            self.on_stack.insert(key.clone());
            self.stack.push(key.clone());
            for parent in (self.dependencies)(&key) {
                self.visit(parent)?;
            }
            self.stack.pop();
            self.on_stack.remove(&key);
            self.done.insert(key.clone());
            self.order.push(key);
            Ok(())
        }
    }

    let mut search = Search {
        dependencies: &dependencies,
        done: HashSet::new(),
        on_stack: HashSet::new(),
        stack: Vec::new(),
        order: Vec::new(),
    };
    for root in roots {
        search.visit(root)?;
    }
    Ok(search.order)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parents_of(edges: &'static [(u32, u32)]) -> impl Fn(&u32) -> Vec<u32> {
        move |key| edges.iter().filter(|(_, to)| to == key).map(|(from, _)| *from).collect()
    }

    #[test]
    fn test_parents_come_first() {
        // 1 -> 2 -> 4, 1 -> 3 -> 4
        let edges = &[(1, 2), (1, 3), (2, 4), (3, 4)];
        let order = topological_sort(vec![4, 3, 2, 1], parents_of(edges)).unwrap();
        assert_eq!(order, vec![1, 2, 3, 4]);
    }

    #[test]
    fn test_roots_pull_in_ancestors_once() {
        let edges = &[(0, 1), (1, 2), (1, 3)];
        let order = topological_sort(vec![2, 3, 2], parents_of(edges)).unwrap();
        assert_eq!(order, vec![0, 1, 2, 3]);
    }

    #[test]
    fn test_cycle_is_reported_closed() {
        let edges = &[(5, 6), (6, 7), (7, 6)];
        let Cycle(keys) = topological_sort(vec![7], parents_of(edges)).unwrap_err();
        assert_eq!(keys.first(), keys.last());
        assert_eq!(keys.len(), 3);
        assert!(keys.contains(&6) && keys.contains(&7));
    }

    #[test]
    fn test_long_chain() {
        let count = 2_000u32;
        let order = topological_sort(vec![count - 1], |&k| if k == 0 { vec![] } else { vec![k - 1] }).unwrap();
        assert_eq!(order.len(), count as usize);
        assert!(order.iter().copied().eq(0..count));

        let closed = topological_sort(vec![count - 1], |&k| vec![(k + count - 1) % count]);
        let Cycle(keys) = closed.unwrap_err();
        assert_eq!(keys.len(), count as usize + 1);
        assert_eq!(keys.first(), keys.last());
    }
}
