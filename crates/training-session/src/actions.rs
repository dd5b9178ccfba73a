/// The side-activities a session can schedule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionKind {
    Checkpoint,
    CrossValidate,
    Progress,
}

#[derive(Debug)]
struct PeriodicAction {
    frequency: u64,
    current_index: u64,
    last_fired_samples: u64,
    kind: ActionKind,
}

/// Periodic actions keyed off the absolute sample count. Triggering
/// depends only on `total_samples / frequency`, so the same period
/// boundaries are crossed exactly once regardless of how processing was
/// chunked or where a restore landed.
#[derive(Debug, Default)]
pub struct ActionSchedule {
    actions: Vec<PeriodicAction>,
}

impl ActionSchedule {
    /// Register an action. Frequency 0 means the feature is disabled and
    /// nothing is registered.
    pub fn register(&mut self, frequency: u64, kind: ActionKind) {
        if frequency == 0 {
            return;
        }
        self.actions.push(PeriodicAction {
            frequency,
            current_index: 0,
            last_fired_samples: 0,
            kind,
        });
    }

    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    /// Actions whose period index moved at `total_samples`, paired with
    /// the period index being closed. Bookkeeping advances here,
    /// independent of what the caller does with the result.
    pub fn due(&mut self, total_samples: u64) -> Vec<(ActionKind, u64)> {
        let mut fired = Vec::new();
        for action in &mut self.actions {
            let index = total_samples / action.frequency;
            if index != action.current_index {
                fired.push((action.kind, action.current_index));
                action.current_index = index;
                action.last_fired_samples = total_samples;
            }
        }
        fired
    }

    /// Actions owed one final invocation for a trailing partial period:
    /// the run ended off a period boundary and the action has not fired at
    /// this exact sample count.
    pub fn flush(&self, total_samples: u64) -> Vec<(ActionKind, u64)> {
        self.actions
            .iter()
            .filter(|action| {
                total_samples % action.frequency != 0
                    && action.last_fired_samples != total_samples
            })
            .map(|action| (action.kind, action.current_index))
            .collect()
    }

    /// Recompute bookkeeping from a restored sample count so triggering
    /// resumes at the correct boundary instead of re-firing completed
    /// periods.
    pub fn resync(&mut self, total_samples: u64) {
        for action in &mut self.actions {
            action.current_index = total_samples / action.frequency;
            action.last_fired_samples = total_samples - total_samples % action.frequency;
        }
    }
}
