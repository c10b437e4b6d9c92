//! Retention policies applied before checkpoint export

use super::value::{column_slice, SlotMeta, ValueSlot};
use crate::types::Element;
use serde::{Deserialize, Serialize};

/// Arguments of one shrink pass
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ShrinkArgs {
    /// Current training step
    pub global_step: i64,
    /// Length of the primary column
    pub value_len: usize,
    /// Primary column index
    pub column: usize,
    /// Element offset of the primary column (fixed-length layouts)
    pub offset: usize,
}

impl ShrinkArgs {
    pub fn new(global_step: i64, value_len: usize) -> Self {
        Self {
            global_step,
            value_len,
            column: 0,
            offset: 0,
        }
    }

    pub fn with_column(mut self, column: usize, offset: usize) -> Self {
        self.column = column;
        self.offset = offset;
        self
    }
}

/// When a key is dropped during shrink
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ShrinkPolicy {
    /// Keep everything
    #[default]
    None,
    /// Drop keys not updated within `steps_to_live` steps
    GlobalStep { steps_to_live: i64 },
    /// Drop keys whose primary embedding has a small L2 weight
    L2Weight { threshold: f64 },
}

impl ShrinkPolicy {
    pub fn is_none(&self) -> bool {
        matches!(self, ShrinkPolicy::None)
    }

    /// Whether `slot` fails the retention predicate
    pub fn should_remove<S: ValueSlot + SlotMeta>(&self, slot: &S, args: &ShrinkArgs) -> bool {
        match *self {
            ShrinkPolicy::None => false,
            ShrinkPolicy::GlobalStep { steps_to_live } => {
                let step = slot.step();
                // never stepped
                if step < 0 {
                    return false;
                }
                args.global_step - step > steps_to_live
            }
            ShrinkPolicy::L2Weight { threshold } => {
                let Some(ptr) = slot.get(args.column, args.offset) else {
                    return false;
                };
                // SAFETY: the column holds value_len initialized elements
                let values = unsafe { column_slice(ptr, args.value_len) };
                l2_weight(values) < threshold
            }
        }
    }
}

/// `0.5 * Σ v²`
pub fn l2_weight<V: Element>(values: &[V]) -> f64 {
    0.5 * values.iter().map(|v| v.to_f64() * v.to_f64()).sum::<f64>()
}
