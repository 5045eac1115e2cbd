//! Rebalance scheduling.
//!
//! The scheduler is a small state machine:
//!
//! ```text
//! Idle --poll (trigger)--> Due --begin--> Executing --complete--> Idle
//!                                              |
//!                                              +--defer--> Due
//! ```
//!
//! Calendar and drift triggers are OR-ed; when both fire the rebalance is
//! recorded as scheduled.

use chrono::{DateTime, Datelike, Duration, Months, NaiveDate, Utc, Weekday};
use serde::{Deserialize, Serialize};

use crate::error::{BacktestError, Result};
use crate::types::TriggerReason;

/// Calendar rule for scheduled rebalances.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CalendarRule {
    /// Every `rebalance_period` processed periods.
    #[default]
    Periods,
    /// Once per ISO week.
    Weekly,
    Monthly,
    Quarterly,
    Yearly,
}

/// Where in each calendar period the rebalance falls.
///
/// The rebalance runs on the first processed period on or after the anchor
/// date, so a holiday on the anchor moves it to the next period.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CalendarAnchor {
    /// First day of the period: Monday, the 1st, the first day of the
    /// quarter, January 1.
    #[default]
    Start,
    /// Wednesday, the 15th, the 15th of the quarter's middle month, July 1.
    Mid,
    /// Last weekday of the period.
    End,
    /// A fixed day of the week. Weekly rule only.
    On(Weekday),
}

impl CalendarRule {
    /// First day of the calendar period holding `date`; `None` for
    /// count-based scheduling.
    fn period_start(self, date: NaiveDate) -> Option<NaiveDate> {
        let (year, month) = (date.year(), date.month());
        match self {
            CalendarRule::Periods => None,
            CalendarRule::Weekly => {
                Some(date - Duration::days(date.weekday().num_days_from_monday() as i64))
            }
            CalendarRule::Monthly => NaiveDate::from_ymd_opt(year, month, 1),
            CalendarRule::Quarterly => NaiveDate::from_ymd_opt(year, (month - 1) / 3 * 3 + 1, 1),
            CalendarRule::Yearly => NaiveDate::from_ymd_opt(year, 1, 1),
        }
    }

    fn next_period_start(self, start: NaiveDate) -> Option<NaiveDate> {
        match self {
            CalendarRule::Periods => None,
            CalendarRule::Weekly => Some(start + Duration::days(7)),
            CalendarRule::Monthly => start.checked_add_months(Months::new(1)),
            CalendarRule::Quarterly => start.checked_add_months(Months::new(3)),
            CalendarRule::Yearly => start.checked_add_months(Months::new(12)),
        }
    }

    /// Anchor date of the period starting at `start`.
    fn anchor_date(self, anchor: CalendarAnchor, start: NaiveDate) -> Option<NaiveDate> {
        match (anchor, self) {
            (_, CalendarRule::Periods) => None,
            (CalendarAnchor::Start, _) => Some(start),
            (CalendarAnchor::Mid, CalendarRule::Weekly) => Some(start + Duration::days(2)),
            (CalendarAnchor::Mid, CalendarRule::Monthly) => Some(start + Duration::days(14)),
            (CalendarAnchor::Mid, CalendarRule::Quarterly) => start
                .checked_add_months(Months::new(1))
                .map(|d| d + Duration::days(14)),
            (CalendarAnchor::Mid, CalendarRule::Yearly) => start.checked_add_months(Months::new(6)),
            (CalendarAnchor::End, rule) => {
                let mut last = rule.next_period_start(start)?.pred_opt()?;
                while matches!(last.weekday(), Weekday::Sat | Weekday::Sun) {
                    last = last.pred_opt()?;
                }
                Some(last)
            }
            (CalendarAnchor::On(day), CalendarRule::Weekly) => {
                Some(start + Duration::days(day.num_days_from_monday() as i64))
            }
            (CalendarAnchor::On(_), _) => None,
        }
    }

    /// Whether an anchor date falls in `(last, today]`. The previous
    /// period's anchor is checked too, to catch up on one with no data.
    fn anchor_passed(self, anchor: CalendarAnchor, last: NaiveDate, today: NaiveDate) -> bool {
        let Some(current) = self.period_start(today) else {
            return false;
        };
        let previous = current.pred_opt().and_then(|d| self.period_start(d));
        [previous, Some(current)]
            .into_iter()
            .flatten()
            .filter_map(|start| self.anchor_date(anchor, start))
            .any(|a| last < a && a <= today)
    }
}

/// Schedule configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduleConfig {
    /// Periods between scheduled rebalances under `CalendarRule::Periods`.
    #[serde(default = "default_rebalance_period")]
    pub rebalance_period: usize,
    #[serde(default)]
    pub calendar: CalendarRule,
    #[serde(default)]
    pub anchor: CalendarAnchor,
    /// L1 drift from target weights that forces a rebalance.
    #[serde(default)]
    pub drift_threshold: Option<f64>,
}

fn default_rebalance_period() -> usize { 21 }

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            rebalance_period: default_rebalance_period(),
            calendar: CalendarRule::Periods,
            anchor: CalendarAnchor::Start,
            drift_threshold: None,
        }
    }
}

impl ScheduleConfig {
    pub fn validate(&self) -> Result<()> {
        if self.rebalance_period == 0 {
            return Err(BacktestError::ConfigError(
                "rebalance_period must be at least 1".to_string(),
            ));
        }
        if matches!(self.anchor, CalendarAnchor::On(_)) && self.calendar != CalendarRule::Weekly {
            return Err(BacktestError::ConfigError(format!(
                "a weekday anchor needs the weekly calendar, got {:?}",
                self.calendar
            )));
        }
        if let Some(t) = self.drift_threshold {
            if !(t > 0.0 && t.is_finite()) {
                return Err(BacktestError::ConfigError(format!(
                    "drift_threshold must be positive, got {}",
                    t
                )));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SchedulerPhase {
    Idle,
    Due(TriggerReason),
    Executing(TriggerReason),
}

/// Decides when the engine rebalances.
#[derive(Debug, Clone)]
pub struct RebalanceScheduler {
    config: ScheduleConfig,
    phase: SchedulerPhase,
    last_rebalance: Option<DateTime<Utc>>,
    periods_since_rebalance: usize,
}

impl RebalanceScheduler {
    pub fn new(config: ScheduleConfig) -> Self {
        Self {
            config,
            phase: SchedulerPhase::Idle,
            last_rebalance: None,
            periods_since_rebalance: 0,
        }
    }

    pub fn phase(&self) -> SchedulerPhase {
        self.phase
    }

    pub fn last_rebalance(&self) -> Option<DateTime<Utc>> {
        self.last_rebalance
    }

    /// Register one processed period and check the triggers.
    ///
    /// `drift` is the L1 distance between current and target weights.
    /// Returns the pending reason if a rebalance is due.
    pub fn poll(&mut self, timestamp: DateTime<Utc>, drift: f64) -> Result<Option<TriggerReason>> {
        if self.last_rebalance.is_some() {
            self.periods_since_rebalance += 1;
        }
        match self.phase {
            SchedulerPhase::Due(reason) => Ok(Some(reason)),
            SchedulerPhase::Executing(_) => Err(BacktestError::InvalidTransition(
                "poll while a rebalance is executing".to_string(),
            )),
            SchedulerPhase::Idle => {
                let reason = if self.calendar_due(timestamp) {
                    Some(TriggerReason::Scheduled)
                } else if self.drift_due(drift) {
                    Some(TriggerReason::DriftThreshold)
                } else {
                    None
                };
                if let Some(reason) = reason {
                    self.phase = SchedulerPhase::Due(reason);
                }
                Ok(reason)
            }
        }
    }

    /// Due -> Executing.
    pub fn begin(&mut self) -> Result<TriggerReason> {
        match self.phase {
            SchedulerPhase::Due(reason) => {
                self.phase = SchedulerPhase::Executing(reason);
                Ok(reason)
            }
            other => Err(BacktestError::InvalidTransition(format!(
                "begin from {:?}",
                other
            ))),
        }
    }

    /// Executing -> Idle, recording the rebalance time.
    pub fn complete(&mut self, timestamp: DateTime<Utc>) -> Result<()> {
        match self.phase {
            SchedulerPhase::Executing(_) => {
                self.phase = SchedulerPhase::Idle;
                self.last_rebalance = Some(timestamp);
                self.periods_since_rebalance = 0;
                Ok(())
            }
            other => Err(BacktestError::InvalidTransition(format!(
                "complete from {:?}",
                other
            ))),
        }
    }

    /// Executing -> Due: the rebalance could not run this period.
    pub fn defer(&mut self) -> Result<()> {
        match self.phase {
            SchedulerPhase::Executing(reason) => {
                self.phase = SchedulerPhase::Due(reason);
                Ok(())
            }
            other => Err(BacktestError::InvalidTransition(format!(
                "defer from {:?}",
                other
            ))),
        }
    }

    fn calendar_due(&self, timestamp: DateTime<Utc>) -> bool {
        let Some(last) = self.last_rebalance else {
            return true;
        };
        match self.config.calendar {
            CalendarRule::Periods => self.periods_since_rebalance >= self.config.rebalance_period,
            rule => rule.anchor_passed(self.config.anchor, last.date_naive(), timestamp.date_naive()),
        }
    }

    fn drift_due(&self, drift: f64) -> bool {
        match self.config.drift_threshold {
            Some(threshold) => self.last_rebalance.is_some() && drift > threshold,
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn day(i: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap() + Duration::days(i)
    }

    fn run_cycle(s: &mut RebalanceScheduler, ts: DateTime<Utc>) {
        s.begin().unwrap();
        s.complete(ts).unwrap();
    }

    #[test]
    fn test_first_period_is_due() {
        let mut s = RebalanceScheduler::new(ScheduleConfig::default());
        assert_eq!(s.poll(day(0), 0.0).unwrap(), Some(TriggerReason::Scheduled));
        assert_eq!(s.phase(), SchedulerPhase::Due(TriggerReason::Scheduled));
    }

    #[test]
    fn test_period_count() {
        let mut s = RebalanceScheduler::new(ScheduleConfig {
            rebalance_period: 3,
            ..Default::default()
        });
        s.poll(day(0), 0.0).unwrap();
        run_cycle(&mut s, day(0));

        assert_eq!(s.poll(day(1), 0.0).unwrap(), None);
        assert_eq!(s.poll(day(2), 0.0).unwrap(), None);
        assert_eq!(s.poll(day(3), 0.0).unwrap(), Some(TriggerReason::Scheduled));
    }

    #[test]
    fn test_drift_trigger() {
        let mut s = RebalanceScheduler::new(ScheduleConfig {
            rebalance_period: 100,
            drift_threshold: Some(0.05),
            ..Default::default()
        });
        s.poll(day(0), 0.0).unwrap();
        run_cycle(&mut s, day(0));

        assert_eq!(s.poll(day(1), 0.04).unwrap(), None);
        assert_eq!(s.poll(day(2), 0.06).unwrap(), Some(TriggerReason::DriftThreshold));
    }

    #[test]
    fn test_calendar_wins_over_drift() {
        let mut s = RebalanceScheduler::new(ScheduleConfig {
            rebalance_period: 1,
            drift_threshold: Some(0.05),
            ..Default::default()
        });
        s.poll(day(0), 0.0).unwrap();
        run_cycle(&mut s, day(0));
        assert_eq!(s.poll(day(1), 0.5).unwrap(), Some(TriggerReason::Scheduled));
    }

    #[test]
    fn test_monthly_calendar() {
        let mut s = RebalanceScheduler::new(ScheduleConfig {
            calendar: CalendarRule::Monthly,
            ..Default::default()
        });
        let jan_2 = Utc.with_ymd_and_hms(2024, 1, 2, 0, 0, 0).unwrap();
        s.poll(jan_2, 0.0).unwrap();
        run_cycle(&mut s, jan_2);

        let jan_31 = Utc.with_ymd_and_hms(2024, 1, 31, 0, 0, 0).unwrap();
        assert_eq!(s.poll(jan_31, 0.0).unwrap(), None);
        // First trading day of February, whatever the date
        let feb_5 = Utc.with_ymd_and_hms(2024, 2, 5, 0, 0, 0).unwrap();
        assert_eq!(s.poll(feb_5, 0.0).unwrap(), Some(TriggerReason::Scheduled));
    }

    #[test]
    fn test_quarterly_and_weekly_periods() {
        let mar = NaiveDate::from_ymd_opt(2024, 3, 29).unwrap();
        let apr = NaiveDate::from_ymd_opt(2024, 4, 1).unwrap();
        assert_ne!(CalendarRule::Quarterly.period_start(mar), CalendarRule::Quarterly.period_start(apr));
        // Friday and the following Monday are in different ISO weeks
        assert_ne!(CalendarRule::Weekly.period_start(mar), CalendarRule::Weekly.period_start(apr));
        assert_eq!(CalendarRule::Yearly.period_start(mar), CalendarRule::Yearly.period_start(apr));
        assert_eq!(CalendarRule::Periods.period_start(mar), None);
    }

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn anchor_of(rule: CalendarRule, anchor: CalendarAnchor, d: NaiveDate) -> NaiveDate {
        rule.anchor_date(anchor, rule.period_start(d).unwrap()).unwrap()
    }

    #[test]
    fn test_anchor_dates() {
        use CalendarAnchor::*;
        use CalendarRule::*;
        let d = date(2024, 5, 20);
        assert_eq!(anchor_of(Monthly, Start, d), date(2024, 5, 1));
        assert_eq!(anchor_of(Monthly, Mid, d), date(2024, 5, 15));
        assert_eq!(anchor_of(Monthly, End, d), date(2024, 5, 31));
        // 2024-06-30 is a Sunday
        assert_eq!(anchor_of(Quarterly, End, d), date(2024, 6, 28));
        assert_eq!(anchor_of(Quarterly, Mid, d), date(2024, 5, 15));
        assert_eq!(anchor_of(Quarterly, Start, d), date(2024, 4, 1));
        assert_eq!(anchor_of(Yearly, Mid, d), date(2024, 7, 1));
        assert_eq!(anchor_of(Yearly, End, d), date(2024, 12, 31));
        // 2024-05-20 is a Monday
        assert_eq!(anchor_of(Weekly, Start, d), date(2024, 5, 20));
        assert_eq!(anchor_of(Weekly, Mid, d), date(2024, 5, 22));
        assert_eq!(anchor_of(Weekly, End, d), date(2024, 5, 24));
        assert_eq!(anchor_of(Weekly, On(Weekday::Thu), d), date(2024, 5, 23));
        assert_eq!(Monthly.anchor_date(On(Weekday::Thu), date(2024, 5, 1)), None);
    }

    /// Dates on which a scheduler with the given rule rebalances over a run
    /// of weekdays.
    fn rebalance_dates(calendar: CalendarRule, anchor: CalendarAnchor, days: i64) -> Vec<NaiveDate> {
        let mut s = RebalanceScheduler::new(ScheduleConfig {
            calendar,
            anchor,
            ..Default::default()
        });
        let mut dates = Vec::new();
        for ts in (0..days).map(day).filter(|t| t.weekday().num_days_from_monday() < 5) {
            if s.poll(ts, 0.0).unwrap().is_some() {
                run_cycle(&mut s, ts);
                dates.push(ts.date_naive());
            }
        }
        dates
    }

    #[test]
    fn test_mid_month_rebalances() {
        // 2024-06-15 is a Saturday: the rebalance moves to Monday the 17th.
        let dates = rebalance_dates(CalendarRule::Monthly, CalendarAnchor::Mid, 200);
        assert_eq!(dates[0], date(2024, 1, 1));
        assert!(dates.contains(&date(2024, 1, 15)));
        assert!(dates.contains(&date(2024, 2, 15)));
        assert!(dates.contains(&date(2024, 6, 17)));
        assert!(!dates.contains(&date(2024, 2, 1)));
    }

    #[test]
    fn test_end_of_month_rebalances() {
        let dates = rebalance_dates(CalendarRule::Monthly, CalendarAnchor::End, 121);
        assert_eq!(
            dates,
            vec![
                date(2024, 1, 1),
                date(2024, 1, 31),
                date(2024, 2, 29),
                date(2024, 3, 29),
                date(2024, 4, 30),
            ]
        );
    }

    #[test]
    fn test_end_of_quarter_and_year_rebalances() {
        let quarters = rebalance_dates(CalendarRule::Quarterly, CalendarAnchor::End, 370);
        assert_eq!(
            quarters,
            vec![
                date(2024, 1, 1),
                date(2024, 3, 29),
                date(2024, 6, 28),
                date(2024, 9, 30),
                date(2024, 12, 31),
            ]
        );
        let years = rebalance_dates(CalendarRule::Yearly, CalendarAnchor::Mid, 370);
        assert_eq!(years, vec![date(2024, 1, 1), date(2024, 7, 1)]);
    }

    #[test]
    fn test_every_friday() {
        let dates = rebalance_dates(CalendarRule::Weekly, CalendarAnchor::On(Weekday::Fri), 21);
        assert_eq!(
            dates,
            vec![date(2024, 1, 1), date(2024, 1, 5), date(2024, 1, 12), date(2024, 1, 19)]
        );
    }

    #[test]
    fn test_missed_anchor_catches_up() {
        let mut s = RebalanceScheduler::new(ScheduleConfig {
            calendar: CalendarRule::Monthly,
            anchor: CalendarAnchor::End,
            ..Default::default()
        });
        let jan_10 = Utc.with_ymd_and_hms(2024, 1, 10, 0, 0, 0).unwrap();
        s.poll(jan_10, 0.0).unwrap();
        run_cycle(&mut s, jan_10);
        // No data on Jan 31: the first February period rebalances.
        let feb_1 = Utc.with_ymd_and_hms(2024, 2, 1, 0, 0, 0).unwrap();
        assert_eq!(s.poll(feb_1, 0.0).unwrap(), Some(TriggerReason::Scheduled));
        run_cycle(&mut s, feb_1);
        let feb_2 = Utc.with_ymd_and_hms(2024, 2, 2, 0, 0, 0).unwrap();
        assert_eq!(s.poll(feb_2, 0.0).unwrap(), None);
    }

    #[test]
    fn test_defer_keeps_rebalance_due() {
        let mut s = RebalanceScheduler::new(ScheduleConfig::default());
        s.poll(day(0), 0.0).unwrap();
        s.begin().unwrap();
        s.defer().unwrap();
        assert_eq!(s.phase(), SchedulerPhase::Due(TriggerReason::Scheduled));
        assert_eq!(s.poll(day(1), 0.0).unwrap(), Some(TriggerReason::Scheduled));
        run_cycle(&mut s, day(1));
        assert_eq!(s.last_rebalance(), Some(day(1)));
        assert_eq!(s.phase(), SchedulerPhase::Idle);
    }

    #[test]
    fn test_invalid_transitions() {
        let mut s = RebalanceScheduler::new(ScheduleConfig::default());
        assert!(matches!(s.begin(), Err(BacktestError::InvalidTransition(_))));
        assert!(s.complete(day(0)).is_err());
        assert!(s.defer().is_err());

        s.poll(day(0), 0.0).unwrap();
        s.begin().unwrap();
        assert!(s.poll(day(1), 0.0).is_err());
    }

    #[test]
    fn test_config_validation() {
        assert!(ScheduleConfig::default().validate().is_ok());
        let bad = ScheduleConfig {
            rebalance_period: 0,
            ..Default::default()
        };
        assert!(bad.validate().is_err());
        let bad = ScheduleConfig {
            drift_threshold: Some(-0.1),
            ..Default::default()
        };
        assert!(bad.validate().is_err());
        let bad = ScheduleConfig {
            calendar: CalendarRule::Monthly,
            anchor: CalendarAnchor::On(Weekday::Mon),
            ..Default::default()
        };
        assert!(bad.validate().is_err());
    }
}
