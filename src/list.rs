//! Index-based circular list primitives.
//!
//! A circular list threaded by index instead of raw pointers: the
//! "pointer" is an index `K` (a [`crate::thread::Pid`] for run queues, a
//! timer slot for the soft-timer pool) and the `next` links live in a
//! [`LinkStore`] the caller provides, a typed handle with a checkable
//! invariant instead of a raw linked pointer.
//!
//! The list's `head` field actually points at the *tail*: `head` is the
//! last-pushed node, and `tail.next` is the first node due for service.
//! This is what lets round-robin rotation be a single pointer (index)
//! assignment.

/// Storage for the `next` links of a circular list keyed by index `K`.
pub trait LinkStore<K: Copy + Eq> {
    fn next(&self, k: K) -> Option<K>;
    fn set_next(&mut self, k: K, v: Option<K>);
}

/// Appends `node` as the new tail of the circular list rooted at `head`.
pub fn rpush<K: Copy + Eq, S: LinkStore<K>>(store: &mut S, head: &mut Option<K>, node: K) {
    match *head {
        None => store.set_next(node, Some(node)),
        Some(tail) => {
            let first = store.next(tail).unwrap_or(tail);
            store.set_next(node, Some(first));
            store.set_next(tail, Some(node));
        }
    }
    *head = Some(node);
}

/// Removes and returns the head (first-to-run) element of the list.
pub fn lpop<K: Copy + Eq, S: LinkStore<K>>(store: &mut S, head: &mut Option<K>) -> Option<K> {
    let tail = (*head)?;
    let first = store.next(tail).unwrap_or(tail);
    if first == tail {
        *head = None;
    } else {
        let new_first = store.next(first);
        store.set_next(tail, new_first);
    }
    store.set_next(first, None);
    Some(first)
}

/// Rotates the list by one: the current head becomes the new tail.
/// Used for round-robin `sched_yield` and periodic-class requeueing.
pub fn lpoprpush<K: Copy + Eq, S: LinkStore<K>>(store: &mut S, head: &mut Option<K>) {
    if let Some(tail) = *head {
        *head = store.next(tail);
    }
}

/// The first-to-run element without removing it.
pub fn peek_head<K: Copy + Eq, S: LinkStore<K>>(store: &S, head: Option<K>) -> Option<K> {
    let tail = head?;
    Some(store.next(tail).unwrap_or(tail))
}

/// Removes a specific node from anywhere in the circular list.
/// Used by `sched_set_status` when a thread leaves its run queue and by
/// mutex wait-list cancellation; no-op if `node` is not in the list.
pub fn remove<K: Copy + Eq, S: LinkStore<K>>(store: &mut S, head: &mut Option<K>, node: K) {
    let tail = match *head {
        Some(t) => t,
        None => return,
    };
    let first = store.next(tail).unwrap_or(tail);
    if first == tail {
        // single-element list
        if first == node {
            *head = None;
            store.set_next(node, None);
        }
        return;
    }
    let mut prev = tail;
    let mut cur = first;
    loop {
        if cur == node {
            let after = store.next(cur);
            store.set_next(prev, after);
            if cur == tail {
                *head = Some(prev);
            }
            store.set_next(node, None);
            return;
        }
        prev = cur;
        cur = match store.next(cur) {
            Some(n) => n,
            None => return, // not found
        };
        if cur == first {
            return; // wrapped around without finding it
        }
    }
}

/// Inserts `node` into the list ordered ascending by `key_of`, used by
/// the mutex wait list (priority order) and the soft-timer lists (firing
/// time order). Ties keep insertion order (stable, new node goes after
/// equal keys).
pub fn insert_sorted<K: Copy + Eq, S: LinkStore<K>, F, Key>(
    store: &mut S,
    head: &mut Option<K>,
    node: K,
    mut key_of: F,
) where
    F: FnMut(&S, K) -> Key,
    Key: PartialOrd,
{
    match *head {
        None => {
            store.set_next(node, Some(node));
            *head = Some(node);
            return;
        }
        Some(tail) => {
            let first = store.next(tail).unwrap_or(tail);
            let node_key = key_of(store, node);
            // walk from first to tail looking for the first element whose
            // key is strictly greater than node's key.
            let mut prev: Option<K> = None;
            let mut cur = first;
            loop {
                if key_of(store, cur) > node_key {
                    break;
                }
                prev = Some(cur);
                if cur == tail {
                    break; // reached the end: insertion point is after tail
                }
                cur = store.next(cur).unwrap_or(first);
            }
            match prev {
                None => {
                    // insert before `first`, i.e. node becomes new first.
                    store.set_next(node, Some(first));
                    store.set_next(tail, Some(node));
                }
                Some(p) if p == tail => {
                    // insert after tail: node becomes new tail.
                    store.set_next(node, Some(first));
                    store.set_next(tail, Some(node));
                    *head = Some(node);
                }
                Some(p) => {
                    let after = store.next(p).unwrap_or(first);
                    store.set_next(p, Some(node));
                    store.set_next(node, Some(after));
                }
            }
        }
    }
}

/// Pops the front of a plain (non-circular, `None`-terminated) singly
/// linked list, used by the mutex wait queue.
pub fn linear_pop_front<K: Copy + Eq, S: LinkStore<K>>(
    store: &mut S,
    head: &mut Option<K>,
) -> Option<K> {
    let first = (*head)?;
    *head = store.next(first);
    store.set_next(first, None);
    Some(first)
}

/// Removes a specific node from anywhere in a plain `None`-terminated
/// list; no-op if `node` is not present.
pub fn linear_remove<K: Copy + Eq, S: LinkStore<K>>(store: &mut S, head: &mut Option<K>, node: K) {
    match *head {
        None => {}
        Some(first) if first == node => {
            *head = store.next(first);
            store.set_next(node, None);
        }
        Some(first) => {
            let mut prev = first;
            loop {
                match store.next(prev) {
                    Some(n) if n == node => {
                        let after = store.next(node);
                        store.set_next(prev, after);
                        store.set_next(node, None);
                        return;
                    }
                    Some(n) => prev = n,
                    None => return,
                }
            }
        }
    }
}

/// Inserts `node` into a plain ascending-sorted, `None`-terminated list.
/// Ties keep arrival order (new node goes after existing equal keys),
/// matching the mutex wait queue's FIFO-within-priority contract.
pub fn linear_insert_sorted<K: Copy + Eq, S: LinkStore<K>, F, Key>(
    store: &mut S,
    head: &mut Option<K>,
    node: K,
    mut key_of: F,
) where
    F: FnMut(&S, K) -> Key,
    Key: PartialOrd,
{
    let node_key = key_of(store, node);
    match *head {
        None => {
            store.set_next(node, None);
            *head = Some(node);
        }
        Some(first) => {
            if key_of(store, first) > node_key {
                store.set_next(node, Some(first));
                *head = Some(node);
                return;
            }
            let mut prev = first;
            loop {
                match store.next(prev) {
                    Some(n) if key_of(store, n) <= node_key => prev = n,
                    next => {
                        store.set_next(node, next);
                        store.set_next(prev, Some(node));
                        return;
                    }
                }
            }
        }
    }
}
