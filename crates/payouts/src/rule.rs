use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use bursar_core::{
    BasisPoints, Entity, LedgerError, LedgerResult, Money, PayoutRuleId, TeacherId, TenantId,
    UserId,
};

/// How revenue turns into pay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RateSchedule {
    Fixed {
        percentage: BasisPoints,
    },
    /// `tier1_percentage` up to and including `tier1_threshold`, `tier2_percentage` above it.
    Tiered {
        tier1_percentage: BasisPoints,
        tier1_threshold: Money,
        tier2_percentage: BasisPoints,
    },
}

impl RateSchedule {
    pub fn validate(&self) -> LedgerResult<()> {
        let rates = match self {
            RateSchedule::Fixed { percentage } => vec![*percentage],
            RateSchedule::Tiered {
                tier1_percentage,
                tier1_threshold,
                tier2_percentage,
            } => {
                if !tier1_threshold.is_positive() {
                    return Err(LedgerError::invalid_amount(
                        "tier 1 threshold must be positive",
                    ));
                }
                vec![*tier1_percentage, *tier2_percentage]
            }
        };
        for rate in &rates {
            // Deserialized values skip the constructor check.
            BasisPoints::new(rate.get())?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewPayoutRule {
    pub teacher_id: TeacherId,
    pub schedule: RateSchedule,
    pub effective_from: NaiveDate,
}

/// One row of a teacher's rate history. Rows are never overwritten: a newer
/// rule deactivates older ones and records from when it took over.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PayoutRule {
    pub id: PayoutRuleId,
    pub tenant_id: TenantId,
    pub teacher_id: TeacherId,
    pub schedule: RateSchedule,
    pub effective_from: NaiveDate,
    pub is_active: bool,
    pub superseded_from: Option<NaiveDate>,
    pub created_by: UserId,
    pub created_at: DateTime<Utc>,
}

impl Entity for PayoutRule {
    type Id = PayoutRuleId;

    fn id(&self) -> &Self::Id {
        &self.id
    }

    fn tenant_id(&self) -> TenantId {
        self.tenant_id
    }
}

impl PayoutRule {
    pub fn create(
        id: PayoutRuleId,
        tenant_id: TenantId,
        cmd: NewPayoutRule,
        created_by: UserId,
        now: DateTime<Utc>,
    ) -> LedgerResult<Self> {
        cmd.schedule.validate()?;
        Ok(Self {
            id,
            tenant_id,
            teacher_id: cmd.teacher_id,
            schedule: cmd.schedule,
            effective_from: cmd.effective_from,
            is_active: true,
            superseded_from: None,
            created_by,
            created_at: now,
        })
    }

    /// Did this rule set the rate on `date`?
    pub fn governs(&self, date: NaiveDate) -> bool {
        if self.effective_from > date {
            return false;
        }
        match (self.is_active, self.superseded_from) {
            (true, _) => true,
            (false, Some(from)) => from > date,
            (false, None) => false,
        }
    }
}

/// Deactivate every active rule a new rule starting `effective_from` replaces.
/// Returns the ids that changed.
pub fn supersede_rules(rules: &mut [PayoutRule], effective_from: NaiveDate) -> Vec<PayoutRuleId> {
    let mut changed = Vec::new();
    for rule in rules
        .iter_mut()
        .filter(|r| r.is_active && r.effective_from <= effective_from)
    {
        rule.is_active = false;
        rule.superseded_from = Some(effective_from);
        changed.push(rule.id);
    }
    changed
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuleSelection {
    pub rule: PayoutRule,
    /// Other rules that tied on `effective_from`. Non-empty means the rule
    /// table is inconsistent for this teacher.
    pub overlapping: Vec<PayoutRuleId>,
}

impl RuleSelection {
    pub fn is_ambiguous(&self) -> bool {
        !self.overlapping.is_empty()
    }

    /// All tied candidates, chosen rule first.
    pub fn candidates(&self) -> Vec<PayoutRuleId> {
        std::iter::once(self.rule.id)
            .chain(self.overlapping.iter().copied())
            .collect()
    }
}

/// The rule with the latest `effective_from` among those governing `on`.
/// Ties go to the most recently created row.
pub fn select_rule(rules: &[PayoutRule], on: NaiveDate) -> Option<RuleSelection> {
    let mut governing: Vec<&PayoutRule> = rules.iter().filter(|r| r.governs(on)).collect();
    governing.sort_by(|a, b| {
        b.effective_from
            .cmp(&a.effective_from)
            .then(b.created_at.cmp(&a.created_at))
            .then(b.id.cmp(&a.id))
    });
    let (chosen, rest) = governing.split_first()?;
    let overlapping = rest
        .iter()
        .take_while(|r| r.effective_from == chosen.effective_from)
        .map(|r| r.id)
        .collect();
    Some(RuleSelection {
        rule: (*chosen).clone(),
        overlapping,
    })
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use chrono::Duration;

    pub(crate) fn day(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    pub(crate) fn fixed(percent: u32) -> RateSchedule {
        RateSchedule::Fixed {
            percentage: BasisPoints::from_whole_percent(percent).unwrap(),
        }
    }

    pub(crate) fn rule(teacher_id: TeacherId, schedule: RateSchedule, from: NaiveDate) -> PayoutRule {
        PayoutRule::create(
            PayoutRuleId::new(),
            TenantId::new(),
            NewPayoutRule {
                teacher_id,
                schedule,
                effective_from: from,
            },
            UserId::new(),
            Utc::now(),
        )
        .unwrap()
    }

    #[test]
    fn tiered_rule_requires_positive_threshold() {
        let schedule = RateSchedule::Tiered {
            tier1_percentage: BasisPoints::from_whole_percent(70).unwrap(),
            tier1_threshold: Money::ZERO,
            tier2_percentage: BasisPoints::from_whole_percent(60).unwrap(),
        };
        assert!(matches!(schedule.validate(), Err(LedgerError::InvalidAmount(_))));
    }

    #[test]
    fn superseded_rule_still_governs_the_past() {
        let teacher = TeacherId::new();
        let mut rules = vec![rule(teacher, fixed(70), day(2024, 1, 1))];
        let changed = supersede_rules(&mut rules, day(2024, 3, 1));
        assert_eq!(changed, vec![rules[0].id]);
        rules.push(rule(teacher, fixed(60), day(2024, 3, 1)));

        let feb = select_rule(&rules, day(2024, 2, 29)).unwrap();
        assert_eq!(feb.rule.schedule, fixed(70));
        assert!(!feb.is_ambiguous());

        let mar = select_rule(&rules, day(2024, 3, 1)).unwrap();
        assert_eq!(mar.rule.schedule, fixed(60));
        assert!(!mar.is_ambiguous());

        assert!(select_rule(&rules, day(2023, 12, 31)).is_none());
    }

    #[test]
    fn same_day_replacement_fully_retires_the_old_rule() {
        let teacher = TeacherId::new();
        let mut rules = vec![rule(teacher, fixed(70), day(2024, 1, 1))];
        supersede_rules(&mut rules, day(2024, 1, 1));
        rules.push(rule(teacher, fixed(65), day(2024, 1, 1)));

        let selection = select_rule(&rules, day(2024, 6, 1)).unwrap();
        assert_eq!(selection.rule.schedule, fixed(65));
        assert!(!selection.is_ambiguous());
    }

    #[test]
    fn future_rule_is_left_active() {
        let teacher = TeacherId::new();
        let mut rules = vec![rule(teacher, fixed(50), day(2024, 9, 1))];
        assert!(supersede_rules(&mut rules, day(2024, 1, 1)).is_empty());
        assert!(rules[0].is_active);
    }

    #[test]
    fn overlapping_active_rules_pick_newest_and_report_the_rest() {
        let teacher = TeacherId::new();
        let older = rule(teacher, fixed(70), day(2024, 1, 1));
        let mut newer = rule(teacher, fixed(80), day(2024, 1, 1));
        newer.created_at = older.created_at + Duration::seconds(5);

        let selection = select_rule(&[older.clone(), newer.clone()], day(2024, 1, 31)).unwrap();
        assert_eq!(selection.rule.id, newer.id);
        assert_eq!(selection.overlapping, vec![older.id]);
        assert_eq!(selection.candidates(), vec![newer.id, older.id]);
    }
}
