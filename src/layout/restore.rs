//! Reconciling a saved layout with the live registry at startup

use std::collections::HashSet;
use tracing::warn;

use super::{PersistedLayout, PersistedNode, Position};
use crate::config::{AgentDefinition, LayoutSettings};

/// What to do with one saved node
#[derive(Debug, Clone, PartialEq)]
pub enum RestoreAction {
    /// A live session already owns this node
    Attach,
    /// Start a fresh process for the node's agent, keeping ids and overrides
    Resume(AgentDefinition),
    /// Show the node without a process
    Placeholder {
        /// The node's agent is not configured anymore
        orphaned: bool,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct RestorePlan {
    pub node: PersistedNode,
    pub action: RestoreAction,
}

/// Decide how each saved node comes back. Later duplicates of a node id are
/// dropped.
pub fn plan(
    layout: &PersistedLayout,
    live_nodes: &HashSet<String>,
    agents: &[AgentDefinition],
    resume: bool,
) -> Vec<RestorePlan> {
    let mut seen = HashSet::new();
    let mut plans = Vec::with_capacity(layout.nodes.len());

    for node in &layout.nodes {
        if !seen.insert(node.node_id.clone()) {
            warn!("Skipping duplicate saved node {}", node.node_id);
            continue;
        }

        let agent = agents.iter().find(|a| a.id == node.agent_id);
        let action = if live_nodes.contains(&node.node_id) {
            RestoreAction::Attach
        } else {
            match agent {
                Some(agent) if resume => RestoreAction::Resume(agent.clone()),
                Some(_) => RestoreAction::Placeholder { orphaned: false },
                None => RestoreAction::Placeholder { orphaned: true },
            }
        };

        plans.push(RestorePlan {
            node: node.clone(),
            action,
        });
    }

    plans
}

/// Grid slot for the `index`-th node without a saved position
pub fn fallback_position(index: usize, settings: &LayoutSettings) -> Position {
    let columns = settings.grid_columns.max(1);
    Position::new(
        settings.origin_x + (index % columns) as f64 * settings.spacing_x,
        settings.origin_y + (index / columns) as f64 * settings.spacing_y,
    )
}

/// Give every node a position and snap all of them to the grid
pub fn assign_positions(nodes: &mut [PersistedNode], settings: &LayoutSettings) {
    for (index, node) in nodes.iter_mut().enumerate() {
        let position = node
            .position
            .unwrap_or_else(|| fallback_position(index, settings));
        node.position = Some(position.snapped(settings.grid_size));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::default_agents;
    use crate::layout::store::tests::node;

    fn layout(nodes: Vec<PersistedNode>) -> PersistedLayout {
        PersistedLayout {
            nodes,
            categories: Vec::new(),
        }
    }

    #[test]
    fn test_plan_actions() {
        let saved = layout(vec![
            node("live", "claude", None),
            node("known", "claude", None),
            node("gone", "retired-agent", None),
        ]);
        let live = HashSet::from(["node-live".to_string()]);
        let agents = default_agents();

        let plans = plan(&saved, &live, &agents, false);
        assert_eq!(plans.len(), 3);
        assert_eq!(plans[0].action, RestoreAction::Attach);
        assert_eq!(plans[1].action, RestoreAction::Placeholder { orphaned: false });
        assert_eq!(plans[2].action, RestoreAction::Placeholder { orphaned: true });

        let plans = plan(&saved, &live, &agents, true);
        assert_eq!(plans[0].action, RestoreAction::Attach);
        assert!(matches!(&plans[1].action, RestoreAction::Resume(agent) if agent.id == "claude"));
        assert_eq!(plans[2].action, RestoreAction::Placeholder { orphaned: true });
    }

    #[test]
    fn test_plan_drops_duplicate_ids() {
        let saved = layout(vec![node("a", "claude", None), node("a", "shell", None)]);
        let plans = plan(&saved, &HashSet::new(), &default_agents(), false);
        assert_eq!(plans.len(), 1);
        assert_eq!(plans[0].node.agent_id, "claude");
    }

    #[test]
    fn test_fallback_grid() {
        let settings = LayoutSettings::default();
        assert_eq!(fallback_position(0, &settings), Position::new(100.0, 100.0));
        assert_eq!(fallback_position(4, &settings), Position::new(980.0, 100.0));
        assert_eq!(fallback_position(5, &settings), Position::new(100.0, 250.0));
        assert_eq!(fallback_position(7, &settings), Position::new(540.0, 250.0));
    }

    #[test]
    fn test_assign_positions_snaps() {
        let settings = LayoutSettings::default();
        let mut nodes = vec![
            node("a", "claude", Some(Position::new(50.0, 61.0))),
            node("b", "claude", None),
            node("c", "claude", None),
        ];
        assign_positions(&mut nodes, &settings);

        assert_eq!(nodes[0].position, Some(Position::new(48.0, 72.0)));
        assert_eq!(
            nodes[1].position,
            Some(Position::new(320.0, 100.0).snapped(24.0))
        );
        assert_eq!(
            nodes[2].position,
            Some(Position::new(540.0, 100.0).snapped(24.0))
        );
        for node in &nodes {
            let p = node.position.unwrap();
            assert_eq!(p.x % 24.0, 0.0);
            assert_eq!(p.y % 24.0, 0.0);
        }
    }
}
