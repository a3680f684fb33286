//! Interactive hunting: a cursor per resource class over the set of
//! ever-seen identities.
//!
//! Navigation order is ascending by identity value; insertion order is
//! deliberately irrelevant so the walk is stable across frames even though the
//! application binds shaders in arbitrary order. The cursor stores its zero-based
//! position alongside the selected identity so iteration can recover when the
//! underlying set changes under it (new shaders keep appearing mid-hunt).

use std::collections::BTreeSet;
use std::time::Duration;

use crate::identity::ResourceClass;

/// Hunting history is dropped after this much input silence.
pub const IDLE_RESET: Duration = Duration::from_secs(60);

/// Operator commands driving the hunt. Key binding and config parsing live
/// outside this workspace; commands arrive here already decoded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HuntCommand {
    Next(ResourceClass),
    Previous(ResourceClass),
    /// Persist cross-reference data for the current selection and, for shader
    /// classes, export its source for editing.
    Mark(ResourceClass),
    /// Clear all visited sets and selections. Identities and replacement
    /// records survive.
    Reset,
    /// Run a reload sweep over the override directory on the next frame.
    Reload,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Forward,
    Back,
}

/// Cursor state for one resource class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Selection {
    /// Nothing selected; draws pass through unmodified.
    #[default]
    Idle,
    /// `id` is the raw identity value; `position` is its last known zero-based
    /// index in the ascending walk, used to recover after set mutation.
    Selected { id: u64, position: usize },
}

impl Selection {
    pub fn id(self) -> Option<u64> {
        match self {
            Self::Idle => None,
            Self::Selected { id, .. } => Some(id),
        }
    }
}

fn class_index(class: ResourceClass) -> usize {
    match class {
        ResourceClass::VertexShader => 0,
        ResourceClass::PixelShader => 1,
        ResourceClass::IndexBuffer => 2,
        ResourceClass::RenderTarget => 3,
    }
}

/// All four cursors.
#[derive(Debug, Clone, Default)]
pub struct HuntState {
    selections: [Selection; 4],
}

impl HuntState {
    pub fn selection(&self, class: ResourceClass) -> Selection {
        self.selections[class_index(class)]
    }

    /// Steps the cursor through `visited` in ascending identity order, wrapping
    /// at both ends. An empty set leaves the cursor idle.
    pub fn step(&mut self, class: ResourceClass, visited: &BTreeSet<u64>, dir: Direction) {
        let slot = &mut self.selections[class_index(class)];
        if visited.is_empty() {
            *slot = Selection::Idle;
            return;
        }
        let items: Vec<u64> = visited.iter().copied().collect();
        let next = match *slot {
            Selection::Idle => match dir {
                Direction::Forward => 0,
                Direction::Back => items.len() - 1,
            },
            Selection::Selected { id, position } => {
                // If the selected identity is still present, step from its
                // current index; otherwise recover from the remembered position.
                let base = items
                    .binary_search(&id)
                    .unwrap_or_else(|_| position.min(items.len() - 1));
                match dir {
                    Direction::Forward => (base + 1) % items.len(),
                    Direction::Back => (base + items.len() - 1) % items.len(),
                }
            }
        };
        *slot = Selection::Selected {
            id: items[next],
            position: next,
        };
    }

    /// Returns every cursor to idle.
    pub fn reset(&mut self) {
        self.selections = [Selection::Idle; 4];
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn set(ids: &[u64]) -> BTreeSet<u64> {
        ids.iter().copied().collect()
    }

    #[test]
    fn empty_set_stays_idle() {
        let mut hunt = HuntState::default();
        hunt.step(ResourceClass::PixelShader, &set(&[]), Direction::Forward);
        assert_eq!(hunt.selection(ResourceClass::PixelShader), Selection::Idle);
    }

    #[test]
    fn forward_walks_ascending_and_wraps() {
        let visited = set(&[30, 10, 20]);
        let mut hunt = HuntState::default();

        hunt.step(ResourceClass::PixelShader, &visited, Direction::Forward);
        assert_eq!(hunt.selection(ResourceClass::PixelShader).id(), Some(10));
        hunt.step(ResourceClass::PixelShader, &visited, Direction::Forward);
        assert_eq!(hunt.selection(ResourceClass::PixelShader).id(), Some(20));
        hunt.step(ResourceClass::PixelShader, &visited, Direction::Forward);
        assert_eq!(hunt.selection(ResourceClass::PixelShader).id(), Some(30));
        hunt.step(ResourceClass::PixelShader, &visited, Direction::Forward);
        assert_eq!(hunt.selection(ResourceClass::PixelShader).id(), Some(10));
    }

    #[test]
    fn next_then_previous_returns_to_start() {
        let visited = set(&[5, 9]);
        let mut hunt = HuntState::default();

        hunt.step(ResourceClass::VertexShader, &visited, Direction::Forward);
        let start = hunt.selection(ResourceClass::VertexShader).id();
        hunt.step(ResourceClass::VertexShader, &visited, Direction::Forward);
        hunt.step(ResourceClass::VertexShader, &visited, Direction::Back);
        assert_eq!(hunt.selection(ResourceClass::VertexShader).id(), start);
    }

    #[test]
    fn back_from_idle_selects_last() {
        let visited = set(&[1, 2, 3]);
        let mut hunt = HuntState::default();
        hunt.step(ResourceClass::IndexBuffer, &visited, Direction::Back);
        assert_eq!(hunt.selection(ResourceClass::IndexBuffer).id(), Some(3));
    }

    #[test]
    fn cursor_recovers_position_after_selected_id_vanishes() {
        let mut visited = set(&[10, 20, 30, 40]);
        let mut hunt = HuntState::default();
        hunt.step(ResourceClass::PixelShader, &visited, Direction::Forward);
        hunt.step(ResourceClass::PixelShader, &visited, Direction::Forward);
        assert_eq!(hunt.selection(ResourceClass::PixelShader).id(), Some(20));

        // The selected identity disappears (e.g. the sets were rebuilt); the
        // remembered position keeps the walk near where it was.
        visited.remove(&20);
        hunt.step(ResourceClass::PixelShader, &visited, Direction::Forward);
        assert_eq!(hunt.selection(ResourceClass::PixelShader).id(), Some(40));
    }

    #[test]
    fn reset_idles_every_class() {
        let visited = set(&[1]);
        let mut hunt = HuntState::default();
        for class in ResourceClass::ALL {
            hunt.step(class, &visited, Direction::Forward);
        }
        hunt.reset();
        for class in ResourceClass::ALL {
            assert_eq!(hunt.selection(class), Selection::Idle);
        }
    }
}
