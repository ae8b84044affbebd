// =============================================================================
// MESH CORE :: optimizer.rs
// Route optimization probes
// =============================================================================
//
// Every cycle, for each neighbor U and each other neighbor V, a probe for V
// leaves through U:
//
//   origin ──▶ U ──▶ X ──▶ ... ──▶ V
//
// Each hop delivers the probe to itself (route.last == self) and floods a
// copy to every neighbor not yet on the route, appending {name, ping} for
// the link it used. V sums the pings and sends `receiveOptimizedRoute` back
// along the reversed route; only the origin applies the result.
//
// The flood is bounded three ways: `max_probe_hops` links, the origin's
// current optimum carried as `bound` (a copy that already costs that much
// cannot win), and `send_probe`, which sheds probes before control frames.
// =============================================================================

use crate::connection::{startup_jitter, Connection};
use crate::constants::{MSG_OPTIMIZE_ROUTE, MSG_RECEIVE_OPTIMIZED_ROUTE};
use crate::network::{to_contents, Hop, Message, OptimizeRoutePayload, OptimizedRoutePayload};
use crate::p2p::MeshNode;
use crate::router;
use std::sync::Arc;
use tokio::time::{interval, sleep, MissedTickBehavior};

pub async fn optimization_loop(node: Arc<MeshNode>, conn: Arc<Connection>) {
    let rate = node.config.route_optimization_rate;
    tokio::select! {
        _ = conn.cancelled() => return,
        _ = sleep(startup_jitter(rate)) => {}
    }

    let mut ticker = interval(rate);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = conn.cancelled() => break,
            _ = ticker.tick() => {}
        }

        // nothing to contribute until the first hop is measured
        let Some(first_ping) = conn.current_ping().await else { continue };

        let names = node.connected_names().await;
        let targets: Vec<(String, Option<u64>, u64)> = {
            let routes = node.routes.read().await;
            names
                .into_iter()
                .filter(|name| *name != conn.peer_name)
                .map(|name| {
                    let bound = routes.optimum_ping(&name);
                    (name, bound, routes.generation())
                })
                .collect()
        };

        for (destination, bound, generation) in targets {
            if bound.map_or(false, |b| first_ping >= b) {
                continue;
            }
            let payload = OptimizeRoutePayload {
                destination,
                probe_id: uuid::Uuid::new_v4().to_string(),
                accumulated_path: vec![Hop {
                    name: conn.peer_name.clone(),
                    ping: first_ping,
                }],
                generation,
                bound,
            };
            log::debug!(
                "[{}] 🔍 Probe {} for [{}] via [{}]",
                node.name(),
                payload.probe_id,
                payload.destination,
                conn.peer_name
            );
            if let Ok(contents) = to_contents(&payload) {
                conn.send_probe(Message::direct(MSG_OPTIMIZE_ROUTE, contents, node.name(), &conn.peer_name));
            }
        }
    }
}

/// Hops a probe that arrived along `route` may take next: every neighbor
/// with a measured ping that is not already on the route, as long as the
/// extended probe stays within `max_hops` links and its link ping stays
/// under `budget`, what is left of the origin's optimum.
pub fn next_probe_hops(
    route: &[String],
    neighbors: &[(String, Option<u64>)],
    max_hops: usize,
    budget: Option<u64>,
) -> Vec<Hop> {
    if route.len() > max_hops {
        return vec![];
    }
    neighbors
        .iter()
        .filter(|(name, _)| !route.contains(name))
        .filter_map(|(name, ping)| ping.map(|ping| Hop { name: name.clone(), ping }))
        .filter(|hop| budget.map_or(true, |b| hop.ping < b))
        .collect()
}

pub fn final_ping(hops: &[Hop]) -> u64 {
    hops.iter().map(|h| h.ping).sum()
}

pub async fn handle_optimize_route(node: &MeshNode, message: &Message) {
    let payload: OptimizeRoutePayload = match message.payload() {
        Ok(p) => p,
        Err(e) => {
            log::warn!("[{}] Bad route probe: {}", node.name(), e);
            return;
        }
    };

    if payload.destination == node.name() {
        return_optimization(node, message, payload).await;
    } else {
        forward_optimization(node, message, payload).await;
    }
}

/// Terminal hop: total the probe and send the result back to its origin.
async fn return_optimization(node: &MeshNode, message: &Message, payload: OptimizeRoutePayload) {
    let total = final_ping(&payload.accumulated_path);
    let mut back = message.route.clone();
    back.reverse();

    let result = OptimizedRoutePayload {
        destination: node.name().to_string(),
        probe_id: payload.probe_id,
        final_ping: total,
        path: message.route.clone(),
        generation: payload.generation,
    };
    log::debug!(
        "[{}] Probe {} arrived via {:?}, total {}ms",
        node.name(),
        result.probe_id,
        result.path,
        total
    );

    if let Ok(contents) = to_contents(&result) {
        let reply = Message::new(MSG_RECEIVE_OPTIMIZED_ROUTE, contents, back);
        router::forward(node, reply).await;
    }
}

async fn forward_optimization(node: &MeshNode, message: &Message, payload: OptimizeRoutePayload) {
    let mut neighbors = vec![];
    for conn in node.connections_snapshot().await {
        let ping = conn.current_ping().await;
        neighbors.push((conn.peer_name.clone(), ping));
    }

    let budget = payload
        .bound
        .map(|b| b.saturating_sub(final_ping(&payload.accumulated_path)));
    let hops = next_probe_hops(&message.route, &neighbors, node.config.max_probe_hops, budget);
    for hop in hops {
        let Some(conn) = node.connection(&hop.name).await else { continue };

        let mut onward = payload.clone();
        onward.accumulated_path.push(hop.clone());
        let mut route = message.route.clone();
        route.push(hop.name.clone());

        if let Ok(contents) = to_contents(&onward) {
            conn.send_probe(Message::new(MSG_OPTIMIZE_ROUTE, contents, route));
        }
    }
}

/// At the probe origin: adopt the path when it beats the current optimum.
pub async fn handle_optimized_route(node: &MeshNode, message: &Message) {
    let payload: OptimizedRoutePayload = match message.payload() {
        Ok(p) => p,
        Err(e) => {
            log::warn!("[{}] Bad route result: {}", node.name(), e);
            return;
        }
    };

    let Some(first_hop) = payload.path.get(1) else { return };
    if !node.is_connected(first_hop).await {
        log::debug!(
            "[{}] Discarding probe {}: first hop [{}] is gone",
            node.name(),
            payload.probe_id,
            first_hop
        );
        return;
    }

    let improved = {
        let mut routes = node.routes.write().await;
        if routes.is_stale(&payload.destination, &payload.path, payload.generation) {
            log::debug!(
                "[{}] Discarding probe {}: {:?} predates a route reset",
                node.name(),
                payload.probe_id,
                payload.path
            );
            return;
        }
        routes.offer_measured(&payload.destination, payload.path.clone(), payload.final_ping, payload.generation)
    };
    if improved {
        log::info!(
            "[{}] 🛣️ Route to [{}] is now {:?} ({}ms)",
            node.name(),
            payload.destination,
            payload.path,
            payload.final_ping
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn route(names: &[&str]) -> Vec<String> {
        names.iter().map(|n| n.to_string()).collect()
    }

    fn neighbors(list: &[(&str, Option<u64>)]) -> Vec<(String, Option<u64>)> {
        list.iter().map(|(n, p)| (n.to_string(), *p)).collect()
    }

    #[test]
    fn test_probe_never_revisits_a_node() {
        let hops = next_probe_hops(
            &route(&["alpha", "bravo"]),
            &neighbors(&[("alpha", Some(1)), ("charlie", Some(4)), ("delta", Some(2))]),
            6,
            None,
        );
        let names: Vec<&str> = hops.iter().map(|h| h.name.as_str()).collect();
        assert_eq!(names, vec!["charlie", "delta"]);
        assert_eq!(hops[0].ping, 4);
    }

    #[test]
    fn test_unmeasured_links_are_skipped() {
        let hops = next_probe_hops(
            &route(&["alpha", "bravo"]),
            &neighbors(&[("charlie", None), ("delta", Some(2))]),
            6,
            None,
        );
        assert_eq!(hops, vec![Hop { name: "delta".into(), ping: 2 }]);
    }

    #[test]
    fn test_hop_cap() {
        let n = neighbors(&[("echo", Some(1))]);
        // 3 links so far, one more allowed
        assert_eq!(next_probe_hops(&route(&["a", "b", "c", "d"]), &n, 4, None).len(), 1);
        // 4 links so far, cap reached
        assert!(next_probe_hops(&route(&["a", "b", "c", "d", "e"]), &n, 4, None).is_empty());
    }

    #[test]
    fn test_copies_that_cannot_beat_the_optimum_stop() {
        let n = neighbors(&[("charlie", Some(4)), ("delta", Some(9))]);
        let names = |hops: Vec<Hop>| hops.into_iter().map(|h| h.name).collect::<Vec<_>>();

        assert_eq!(names(next_probe_hops(&route(&["alpha", "bravo"]), &n, 6, Some(9))), vec!["charlie"]);
        assert!(next_probe_hops(&route(&["alpha", "bravo"]), &n, 6, Some(4)).is_empty());
        assert!(next_probe_hops(&route(&["alpha", "bravo"]), &n, 6, Some(0)).is_empty());
    }

    /// Copies of one probe the full flood would send in a mesh of `n` nodes
    /// where every link costs the same and the origin knows the direct ping.
    fn flood_size(n: usize, max_hops: usize, bound: Option<u64>) -> usize {
        fn walk(route: &mut Vec<String>, spent: u64, all: &[String], max_hops: usize, bound: Option<u64>) -> usize {
            let last = route.last().cloned().unwrap();
            if last == "n1" {
                return 0;
            }
            let neighbors: Vec<(String, Option<u64>)> =
                all.iter().filter(|x| **x != last).map(|x| (x.clone(), Some(10))).collect();
            let budget = bound.map(|b| b.saturating_sub(spent));
            let mut sent = 0;
            for hop in next_probe_hops(route, &neighbors, max_hops, budget) {
                route.push(hop.name.clone());
                sent += 1 + walk(route, spent + hop.ping, all, max_hops, bound);
                route.pop();
            }
            sent
        }
        let all: Vec<String> = (0..n).map(|i| format!("n{}", i)).collect();
        // probe for n1 leaving n0 through n2
        let mut start = route(&["n0", "n2"]);
        1 + walk(&mut start, 10, &all, max_hops, bound)
    }

    #[test]
    fn test_flood_stays_small_in_a_full_mesh() {
        let unbounded = flood_size(10, 6, None);
        let capped = flood_size(10, crate::constants::DEFAULT_MAX_PROBE_HOPS, None);
        assert!(capped * 50 < unbounded);

        // equal links: nothing beats a direct 10ms optimum, so the first copy goes no further
        assert!(flood_size(10, crate::constants::DEFAULT_MAX_PROBE_HOPS, Some(10)) <= 1);
        assert!(flood_size(10, crate::constants::DEFAULT_MAX_PROBE_HOPS, Some(25)) < capped);
    }

    #[test]
    fn test_final_ping_sums_every_hop() {
        let hops = vec![
            Hop { name: "bravo".into(), ping: 3 },
            Hop { name: "charlie".into(), ping: 5 },
            Hop { name: "delta".into(), ping: 11 },
        ];
        assert_eq!(final_ping(&hops), 19);
        assert_eq!(final_ping(&[]), 0);
    }
}
