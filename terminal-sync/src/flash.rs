//! Cell-level change highlighting
//!
//! Remembers the last value rendered in each displayed cell. A numeric
//! change arms a short highlight carrying its direction; re-observing the
//! same value never re-arms it.

use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use terminal_core::{EntityKey, FieldValue};

use crate::clock::millis;

/// One displayed value: an entity field
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CellKey {
    pub entity: EntityKey,
    pub field: String,
}

impl CellKey {
    pub fn new(entity: EntityKey, field: impl Into<String>) -> Self {
        Self {
            entity,
            field: field.into(),
        }
    }
}

impl fmt::Display for CellKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.entity, self.field)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FlashDirection {
    Increase,
    Decrease,
    Unchanged,
}

/// Highlight to render for a cell
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlashState {
    pub direction: FlashDirection,
    /// When the highlight ends; `None` when nothing is highlighted
    pub expires_at: Option<u64>,
}

impl FlashState {
    pub const IDLE: FlashState = FlashState {
        direction: FlashDirection::Unchanged,
        expires_at: None,
    };

    pub fn is_active(&self, now: u64) -> bool {
        self.expires_at.is_some_and(|at| at > now)
    }
}

#[derive(Debug, Clone)]
struct Cell {
    previous: FieldValue,
    highlight: FlashState,
}

/// Per-cell change detector
#[derive(Debug)]
pub struct FlashEngine {
    cells: HashMap<CellKey, Cell>,
    duration: Duration,
}

impl FlashEngine {
    pub fn new(duration: Duration) -> Self {
        Self {
            cells: HashMap::new(),
            duration,
        }
    }

    /// Compare `value` with the last value seen in `cell`
    ///
    /// Returns the highlight armed by this observation; an unchanged value,
    /// a first sighting or a non-numeric change yields
    /// [`FlashDirection::Unchanged`].
    pub fn observe(&mut self, cell: CellKey, value: &FieldValue, now: u64) -> FlashState {
        self.observe_inner(cell, value, now).0
    }

    /// Observe a burst of cells in one pass
    ///
    /// Only cells whose highlight changed are returned, so a caller can
    /// render the whole burst at once.
    pub fn observe_batch<I>(&mut self, values: I, now: u64) -> Vec<(CellKey, FlashState)>
    where
        I: IntoIterator<Item = (CellKey, FieldValue)>,
    {
        values
            .into_iter()
            .filter_map(|(cell, value)| {
                let (state, changed) = self.observe_inner(cell.clone(), &value, now);
                changed.then_some((cell, state))
            })
            .collect()
    }

    fn observe_inner(&mut self, cell: CellKey, value: &FieldValue, now: u64) -> (FlashState, bool) {
        let expires_at = now + millis(self.duration);

        let Some(entry) = self.cells.get_mut(&cell) else {
            self.cells.insert(
                cell,
                Cell {
                    previous: value.clone(),
                    highlight: FlashState::IDLE,
                },
            );
            return (FlashState::IDLE, false);
        };

        if !entry.highlight.is_active(now) {
            entry.highlight = FlashState::IDLE;
        }
        if entry.previous == *value {
            return (FlashState::IDLE, false);
        }

        let direction = match (entry.previous.as_decimal(), value.as_decimal()) {
            (Some(before), Some(after)) => direction_of(before, after),
            _ => FlashDirection::Unchanged,
        };
        entry.previous = value.clone();

        if direction == FlashDirection::Unchanged {
            // Re-baseline; a live highlight for the old value no longer applies
            let cleared = entry.highlight.expires_at.is_some();
            entry.highlight = FlashState::IDLE;
            return (FlashState::IDLE, cleared);
        }

        entry.highlight = FlashState {
            direction,
            expires_at: Some(expires_at),
        };
        (entry.highlight, true)
    }

    /// Highlight currently showing for `cell`
    pub fn state(&self, cell: &CellKey, now: u64) -> FlashState {
        match self.cells.get(cell) {
            Some(entry) if entry.highlight.is_active(now) => entry.highlight,
            _ => FlashState::IDLE,
        }
    }

    /// Clear every highlight that ended at or before `now`
    ///
    /// Returns the cells that stopped flashing.
    pub fn sweep(&mut self, now: u64) -> Vec<CellKey> {
        let mut cleared = Vec::new();
        for (cell, entry) in self.cells.iter_mut() {
            if entry.highlight.expires_at.is_some_and(|at| at <= now) {
                entry.highlight = FlashState::IDLE;
                cleared.push(cell.clone());
            }
        }
        cleared.sort();
        cleared
    }

    /// Stop tracking a cell that left the screen
    pub fn forget(&mut self, cell: &CellKey) {
        self.cells.remove(cell);
    }

    pub fn len(&self) -> usize {
        self.cells.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }
}

fn direction_of(before: Decimal, after: Decimal) -> FlashDirection {
    match after.cmp(&before) {
        std::cmp::Ordering::Greater => FlashDirection::Increase,
        std::cmp::Ordering::Less => FlashDirection::Decrease,
        std::cmp::Ordering::Equal => FlashDirection::Unchanged,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use terminal_core::EntityKind;

    fn cell(field: &str) -> CellKey {
        CellKey::new(EntityKey::new(EntityKind::Instrument, "EURUSD"), field)
    }

    fn engine() -> FlashEngine {
        FlashEngine::new(Duration::from_millis(800))
    }

    #[test]
    fn test_first_observation_does_not_flash() {
        let mut flash = engine();
        assert_eq!(flash.observe(cell("bid"), &dec!(1.1).into(), 0), FlashState::IDLE);
    }

    #[test]
    fn test_increase_then_repeat_is_idempotent() {
        let mut flash = engine();
        flash.observe(cell("bid"), &dec!(1.1).into(), 0);

        let state = flash.observe(cell("bid"), &dec!(1.2).into(), 100);
        assert_eq!(state.direction, FlashDirection::Increase);
        assert_eq!(state.expires_at, Some(900));

        // Same value again: no new highlight, the running one keeps its expiry
        let again = flash.observe(cell("bid"), &dec!(1.2).into(), 200);
        assert_eq!(again.direction, FlashDirection::Unchanged);
        assert_eq!(flash.state(&cell("bid"), 200).expires_at, Some(900));
    }

    #[test]
    fn test_decrease_flashes() {
        let mut flash = engine();
        flash.observe(cell("ask"), &dec!(1.3).into(), 0);
        assert_eq!(
            flash.observe(cell("ask"), &dec!(1.25).into(), 10).direction,
            FlashDirection::Decrease
        );
    }

    #[test]
    fn test_numerically_equal_decimals_do_not_flash() {
        let mut flash = engine();
        flash.observe(cell("bid"), &dec!(1.10).into(), 0);
        assert_eq!(flash.observe(cell("bid"), &dec!(1.1).into(), 10), FlashState::IDLE);
    }

    #[test]
    fn test_non_numeric_change_rebaselines() {
        let mut flash = engine();
        flash.observe(cell("status"), &"working".into(), 0);
        assert_eq!(flash.observe(cell("status"), &"filled".into(), 10), FlashState::IDLE);

        flash.observe(cell("qty"), &dec!(1).into(), 0);
        flash.observe(cell("qty"), &FieldValue::Null, 10);
        assert_eq!(flash.observe(cell("qty"), &dec!(5).into(), 20), FlashState::IDLE);
    }

    #[test]
    fn test_batch_returns_only_changed_cells() {
        let mut flash = engine();
        flash.observe_batch(
            vec![(cell("bid"), dec!(1.1).into()), (cell("ask"), dec!(1.3).into())],
            0,
        );

        let changed = flash.observe_batch(
            vec![
                (cell("bid"), dec!(1.2).into()),
                (cell("ask"), dec!(1.3).into()),
                (cell("last"), dec!(1.25).into()),
            ],
            50,
        );
        assert_eq!(changed.len(), 1);
        assert_eq!(changed[0].0, cell("bid"));
        assert_eq!(changed[0].1.direction, FlashDirection::Increase);
    }

    #[test]
    fn test_sweep_clears_expired() {
        let mut flash = engine();
        flash.observe(cell("bid"), &dec!(1).into(), 0);
        flash.observe(cell("bid"), &dec!(2).into(), 0);

        assert!(flash.sweep(799).is_empty());
        assert!(flash.state(&cell("bid"), 799).is_active(799));
        assert_eq!(flash.sweep(800), vec![cell("bid")]);
        assert_eq!(flash.state(&cell("bid"), 800), FlashState::IDLE);
        assert!(flash.sweep(10_000).is_empty());
    }

    #[test]
    fn test_expired_highlight_reads_idle_without_sweep() {
        let mut flash = engine();
        flash.observe(cell("bid"), &dec!(1).into(), 0);
        flash.observe(cell("bid"), &dec!(2).into(), 0);
        assert_eq!(flash.state(&cell("bid"), 5_000), FlashState::IDLE);
    }
}
