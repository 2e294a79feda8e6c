//! Headroom arithmetic.
//!
//! Headroom is spare capacity in sessions. A cluster scales up when its
//! available headroom falls short of the required headroom, and scales
//! down by draining idle nodes from the newest end of the waterfall while
//! the surplus still covers a whole node.

/// Number of nodes needed to cover `deficit` sessions.
///
/// `users_per_small` must be non-zero; callers validate it first.
pub fn servers_needed(deficit: i64, users_per_small: u32) -> u32 {
    if deficit <= 0 || users_per_small == 0 {
        return 0;
    }
    let per_node = i64::from(users_per_small);
    let needed = (deficit + per_node - 1) / per_node;
    u32::try_from(needed).unwrap_or(u32::MAX)
}

/// Pick idle nodes to drain, newest first.
///
/// `inuse_map` is in waterfall order (oldest first). Each selected node
/// spends `users_per_small` of `overprov`; a node is only selected while
/// the remaining surplus covers it. Busy nodes are never selected, and a
/// skipped node does not stop the scan.
pub fn select_for_shutdown<T>(
    inuse_map: &[(T, u32)],
    overprov: i64,
    users_per_small: u32,
) -> Vec<&T> {
    let per_node = i64::from(users_per_small);
    let mut remaining = overprov;
    let mut selected = Vec::new();

    if per_node == 0 {
        return selected;
    }

    for (node, sessions) in inuse_map.iter().rev() {
        if *sessions == 0 && remaining >= per_node {
            remaining -= per_node;
            selected.push(node);
        }
    }
    selected
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn servers_needed_rounds_up() {
        assert_eq!(servers_needed(10, 4), 3);
        assert_eq!(servers_needed(8, 4), 2);
        assert_eq!(servers_needed(1, 4), 1);
        assert_eq!(servers_needed(4, 4), 1);
        assert_eq!(servers_needed(5, 1), 5);
    }

    #[test]
    fn servers_needed_zero_without_deficit() {
        assert_eq!(servers_needed(0, 4), 0);
        assert_eq!(servers_needed(-3, 4), 0);
    }

    #[test]
    fn servers_needed_matches_ceiling_across_range() {
        for users_per_small in 1..=12u32 {
            for deficit in 1..=100i64 {
                let expected = (deficit as f64 / users_per_small as f64).ceil() as u32;
                assert_eq!(servers_needed(deficit, users_per_small), expected);
            }
        }
    }

    #[test]
    fn waterfall_scale_down_prefers_newest_idle_node() {
        let map = vec![("n1", 0), ("n2", 0), ("n3", 2)];
        let selected = select_for_shutdown(&map, 5, 3);
        assert_eq!(selected, vec![&"n2"]);
    }

    #[test]
    fn busy_nodes_are_never_selected() {
        let map = vec![("n1", 1), ("n2", 3), ("n3", 7)];
        assert!(select_for_shutdown(&map, 100, 2).is_empty());
    }

    #[test]
    fn selection_stops_when_surplus_below_one_node() {
        let map = vec![("n1", 0), ("n2", 0), ("n3", 0), ("n4", 0)];
        let selected = select_for_shutdown(&map, 9, 4);
        assert_eq!(selected, vec![&"n4", &"n3"]);
    }

    #[test]
    fn negative_surplus_selects_nothing() {
        let map = vec![("n1", 0)];
        assert!(select_for_shutdown(&map, -2, 4).is_empty());
    }

    #[test]
    fn selection_never_overspends_surplus() {
        let map: Vec<(u32, u32)> = (0..20).map(|i| (i, i % 3)).collect();
        for overprov in 0..40i64 {
            for users_per_small in 1..6u32 {
                let selected = select_for_shutdown(&map, overprov, users_per_small);
                let spent = selected.len() as i64 * i64::from(users_per_small);
                assert!(spent <= overprov);
                assert!(overprov - spent >= 0);
                for node in selected {
                    assert_eq!(map[*node as usize].1, 0);
                }
            }
        }
    }
}
