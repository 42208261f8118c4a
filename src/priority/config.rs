/// Weights for the task selection score.
#[derive(Debug, Clone)]
pub struct PriorityConfig {
    /// Base score per priority rank
    pub base_urgent: f64,
    pub base_high: f64,
    pub base_medium: f64,
    pub base_lowest: f64,

    /// Full bonus when due today or overdue; decays as 1/(1+days) after that
    pub due_bonus: f64,

    /// Per open subtask, capped
    pub subtask_bonus: f64,
    pub subtask_bonus_cap: f64,

    /// Per reschedule, capped
    pub reschedule_penalty: f64,
    pub reschedule_penalty_cap: f64,

    /// Keeps the task that owns the running timer from being pre-empted
    pub active_bonus: f64,
}

impl Default for PriorityConfig {
    fn default() -> Self {
        Self {
            base_urgent: 400.0,
            base_high: 300.0,
            base_medium: 200.0,
            base_lowest: 100.0,
            due_bonus: 150.0,
            subtask_bonus: 5.0,
            subtask_bonus_cap: 25.0,
            reschedule_penalty: 10.0,
            reschedule_penalty_cap: 50.0,
            active_bonus: 75.0,
        }
    }
}
