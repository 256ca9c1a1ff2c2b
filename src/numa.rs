//! NUMA Topology
//!
//! Best-effort discovery of the machine's NUMA layout, used by the
//! node-shared object pool to pick a bucket near the calling thread. The
//! answers here are a placement *hint*: a stale or wrong node costs some
//! cross-node traffic but never correctness, so `current_node()` caches its
//! answer per thread and only refreshes about once a second.
//!
//! On machines without NUMA (or without `/sys` exposure) everything
//! degrades to a single node 0.

use std::cell::Cell;
use std::sync::OnceLock;
use std::time::{Duration, Instant};

const NODE_REFRESH_INTERVAL: Duration = Duration::from_secs(1);

/// Number of NUMA nodes on this machine. At least 1.
pub fn node_count() -> usize {
    static COUNT: OnceLock<usize> = OnceLock::new();
    *COUNT.get_or_init(|| {
        std::fs::read_to_string("/sys/devices/system/node/possible")
            .ok()
            .and_then(|s| parse_range_list(s.trim()).map(|ids| ids.len()))
            .filter(|&n| n > 0)
            .unwrap_or(1)
    })
}

/// Map from CPU index to node index. CPUs not covered map to node 0.
fn cpu_to_node_map() -> &'static [usize] {
    static MAP: OnceLock<Vec<usize>> = OnceLock::new();
    MAP.get_or_init(|| {
        let cpus = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        let mut map = vec![0usize; cpus.max(1)];
        for node in 0..node_count() {
            let path = format!("/sys/devices/system/node/node{}/cpulist", node);
            let Ok(list) = std::fs::read_to_string(&path) else {
                continue;
            };
            if let Some(ids) = parse_range_list(list.trim()) {
                for cpu in ids {
                    if cpu < map.len() {
                        map[cpu] = node;
                    }
                }
            }
        }
        map
    })
}

/// The NUMA node the calling thread is (approximately) running on.
///
/// Cached per thread for about a second; threads migrate rarely enough that
/// a stale answer is fine for cache placement.
pub fn current_node() -> usize {
    thread_local! {
        static CACHED_NODE: Cell<usize> = const { Cell::new(usize::MAX) };
        static REFRESHED_AT: Cell<Option<Instant>> = const { Cell::new(None) };
    }
    let now = Instant::now();
    let stale = REFRESHED_AT.with(|t| match t.get() {
        Some(at) => now.duration_since(at) >= NODE_REFRESH_INTERVAL,
        None => true,
    });
    if stale {
        let node = query_current_node();
        CACHED_NODE.with(|n| n.set(node));
        REFRESHED_AT.with(|t| t.set(Some(now)));
        node
    } else {
        CACHED_NODE.with(|n| n.get())
    }
}

fn query_current_node() -> usize {
    // Safety: sched_getcpu has no preconditions.
    let cpu = unsafe { libc::sched_getcpu() };
    if cpu < 0 {
        return 0;
    }
    let map = cpu_to_node_map();
    map.get(cpu as usize).copied().unwrap_or(0)
}

/// Parse a sysfs range list such as "0-3,8-11" into individual indices.
fn parse_range_list(s: &str) -> Option<Vec<usize>> {
    let mut out = Vec::new();
    for part in s.split(',') {
        let part = part.trim();
        if part.is_empty() {
            continue;
        }
        match part.split_once('-') {
            Some((lo, hi)) => {
                let lo: usize = lo.parse().ok()?;
                let hi: usize = hi.parse().ok()?;
                if lo > hi {
                    return None;
                }
                out.extend(lo..=hi);
            }
            None => out.push(part.parse().ok()?),
        }
    }
    Some(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_range_list() {
        assert_eq!(parse_range_list("0"), Some(vec![0]));
        assert_eq!(parse_range_list("0-3"), Some(vec![0, 1, 2, 3]));
        assert_eq!(parse_range_list("0-1,4-5"), Some(vec![0, 1, 4, 5]));
        assert_eq!(parse_range_list("2,7"), Some(vec![2, 7]));
        assert_eq!(parse_range_list("3-1"), None);
        assert_eq!(parse_range_list("x"), None);
    }

    #[test]
    fn test_node_count_at_least_one() {
        assert!(node_count() >= 1);
    }

    #[test]
    fn test_current_node_in_range() {
        let node = current_node();
        assert!(node < node_count());
        // Second call hits the per-thread cache.
        assert_eq!(current_node(), node);
    }
}
