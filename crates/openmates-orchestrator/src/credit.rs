//! Credit reservation/settlement arithmetic (SPEC_FULL.md §4.H steps 4/7,
//! §8 "Credit conservation"). Pure functions only — the actual balance
//! mutation lives behind `ChatRepo::reserve_credits`/`settle_credits`, kept
//! there so this module stays trivially testable against the invariant.

/// Per-turn cost breakdown. All fields are already-rounded credit amounts,
/// never raw tokens — token→credit pricing is a provider/skill concern.
#[derive(Debug, Clone, Copy, Default)]
pub struct CreditBreakdown {
    pub preprocess: i64,
    pub main_input: i64,
    pub main_output: i64,
    pub skills: i64,
    pub postprocess: i64,
}

impl CreditBreakdown {
    /// §8: `total_debited == preprocess_cost + main_cost + Σ skill_costs + postprocess_cost`.
    pub fn total(&self) -> i64 {
        self.preprocess + self.main_input + self.main_output + self.skills + self.postprocess
    }
}

/// Minimum expected cost to reserve before Main runs (§4.H step 4): the
/// preprocess call already happened and is known exactly; everything after it
/// is estimated as at least one token of the cheapest tier's floor cost.
pub fn minimum_reservation(preprocess_cost: i64, main_floor_cost: i64) -> i64 {
    preprocess_cost + main_floor_cost
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn total_sums_every_component() {
        let breakdown = CreditBreakdown { preprocess: 1, main_input: 2, main_output: 3, skills: 4, postprocess: 5 };
        assert_eq!(breakdown.total(), 15);
    }

    #[test]
    fn cancelled_tasks_debit_nothing() {
        let breakdown = CreditBreakdown::default();
        assert_eq!(breakdown.total(), 0);
    }
}
