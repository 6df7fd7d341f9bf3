//! Result Slot: single-write, single-read handoff of one step's outcome code.
//!
//! The supervisor owns the [`ResultSlot`]; the running task only ever holds the
//! [`SlotWriter`] it was handed, and consumes it with its one write. A task
//! that ends without writing leaves the slot [`InProgress`](SlotState::InProgress),
//! which [`ResultSlot::read`] reports as [`StepError::MissingSlot`], never as
//! success.

use std::sync::{Arc, Mutex, PoisonError};

use stepwright_utils::StepError;

/// Contents of an open slot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    /// Created, not yet written
    InProgress,
    /// Terminal outcome code written by the payload
    Written(i32),
}

type Cell = Arc<Mutex<SlotState>>;

/// At most one open slot per supervisor.
#[derive(Debug, Default)]
pub struct ResultSlot {
    cell: Option<Cell>,
}

impl ResultSlot {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether a slot exists that has not been released
    #[must_use]
    pub const fn is_open(&self) -> bool {
        self.cell.is_some()
    }

    /// Open the slot for `step` with the in-progress sentinel.
    ///
    /// # Errors
    ///
    /// [`StepError::AlreadyInProgress`] when a slot is already open; the open
    /// slot is left untouched.
    pub fn create(&mut self, step: &str) -> Result<SlotWriter, StepError> {
        if self.cell.is_some() {
            return Err(StepError::AlreadyInProgress {
                step: step.to_string(),
            });
        }
        let cell = Arc::new(Mutex::new(SlotState::InProgress));
        self.cell = Some(Arc::clone(&cell));
        Ok(SlotWriter { cell })
    }

    /// Read the outcome after the task has ended.
    ///
    /// # Errors
    ///
    /// [`StepError::MissingSlot`] when no slot exists or the payload never wrote it.
    pub fn read(&self, step: &str) -> Result<i32, StepError> {
        let missing = || StepError::MissingSlot {
            step: step.to_string(),
        };
        let cell = self.cell.as_ref().ok_or_else(missing)?;
        match *cell.lock().unwrap_or_else(PoisonError::into_inner) {
            SlotState::Written(code) => Ok(code),
            SlotState::InProgress => Err(missing()),
        }
    }

    /// Current contents, `None` when no slot is open
    #[must_use]
    pub fn peek(&self) -> Option<SlotState> {
        self.cell
            .as_ref()
            .map(|cell| *cell.lock().unwrap_or_else(PoisonError::into_inner))
    }

    /// Delete the slot so the next step may create one
    pub fn release(&mut self) {
        self.cell = None;
    }
}

/// Write end of an open slot, moved into the task.
#[derive(Debug)]
pub struct SlotWriter {
    cell: Cell,
}

impl SlotWriter {
    /// Store the terminal outcome. Consumes the writer so it happens once.
    pub fn write(self, code: i32) {
        *self.cell.lock().unwrap_or_else(PoisonError::into_inner) = SlotState::Written(code);
    }
}
