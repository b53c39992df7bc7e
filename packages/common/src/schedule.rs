//! Benefit schedule construction.
//!
//! A plan pays `principal * daily_rate` once per payout day. Each cycle is
//! `days_per_cycle` payout days followed by `pause_days` days without payout.
//! Payout day `n` of the whole plan lands `n + 1 + pauses_so_far` days after the
//! start date, so the first payout is one full day after the purchase.

use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Refuse schedules larger than this many payout days.
pub const MAX_SCHEDULE_ITEMS: u32 = 10_000;

/// Refuse schedules whose calendar, pause days included, spans more days than this.
pub const MAX_SCHEDULE_SPAN_DAYS: u64 = 36_500;

/// Inputs for [`build_schedule`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduleParams {
    pub principal: Decimal,
    /// Fraction of principal paid per payout day, in `(0, 1]`.
    pub daily_rate: Decimal,
    pub cycles_total: u32,
    pub days_per_cycle: u32,
    pub pause_days: u32,
    pub start_date: DateTime<Utc>,
}

/// One payout day produced by the builder.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlannedPayout {
    /// 0-based, contiguous across the whole plan.
    pub day_index: u32,
    /// 1-based.
    pub cycle_number: u32,
    /// Percent of principal, e.g. `12.5` for a daily rate of `0.125`.
    pub percent: Decimal,
    pub amount: Decimal,
    pub scheduled_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BenefitSchedule {
    pub items: Vec<PlannedPayout>,
    /// Sum of all `percent` values.
    pub total_percent: Decimal,
    pub total_amount: Decimal,
    /// Total payout as a multiple of principal (`total_percent / 100`).
    pub total_potential: Decimal,
    /// End of the last cycle, pause days included.
    pub ends_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ScheduleError {
    #[error("principal must be positive, got {0}")]
    NonPositivePrincipal(Decimal),
    #[error("cycles_total must be positive")]
    NonPositiveCycles,
    #[error("days_per_cycle must be positive")]
    NonPositiveDaysPerCycle,
    #[error("daily_rate must be in (0, 1], got {0}")]
    RateOutOfRange(Decimal),
    #[error("schedule of {0} payout days exceeds the limit of {MAX_SCHEDULE_ITEMS}")]
    TooManyItems(u64),
    #[error("schedule spans {0} days, more than the limit of {MAX_SCHEDULE_SPAN_DAYS}")]
    SpanTooLong(u64),
    #[error("start date {start} is earlier than the allowed {earliest}")]
    StartInPast {
        start: DateTime<Utc>,
        earliest: DateTime<Utc>,
    },
}

/// Build the ordered payout calendar for a plan.
///
/// Pure: the caller passes `now` and the grace window that bounds how far in the
/// past `start_date` may be.
pub fn build_schedule(
    params: &ScheduleParams,
    now: DateTime<Utc>,
    start_grace: Duration,
) -> Result<BenefitSchedule, ScheduleError> {
    validate(params, now, start_grace)?;

    let hundred = Decimal::ONE_HUNDRED;
    let amount = params.principal * params.daily_rate;
    let percent = params.daily_rate * hundred;
    let cycle_length = i64::from(params.days_per_cycle) + i64::from(params.pause_days);

    let mut items =
        Vec::with_capacity((params.cycles_total * params.days_per_cycle) as usize);
    for cycle in 0..params.cycles_total {
        let cycle_offset = i64::from(cycle) * cycle_length;
        for day in 0..params.days_per_cycle {
            let offset = cycle_offset + i64::from(day) + 1;
            items.push(PlannedPayout {
                day_index: cycle * params.days_per_cycle + day,
                cycle_number: cycle + 1,
                percent,
                amount,
                scheduled_at: days_after(params, offset)?,
            });
        }
    }

    let count = Decimal::from(items.len() as u64);
    let total_percent = percent * count;

    Ok(BenefitSchedule {
        total_amount: amount * count,
        total_potential: total_percent / hundred,
        total_percent,
        ends_at: days_after(params, i64::from(params.cycles_total) * cycle_length)?,
        items,
    })
}

fn days_after(params: &ScheduleParams, days: i64) -> Result<DateTime<Utc>, ScheduleError> {
    Duration::try_days(days)
        .and_then(|offset| params.start_date.checked_add_signed(offset))
        .ok_or(ScheduleError::SpanTooLong(days.unsigned_abs()))
}

fn validate(
    params: &ScheduleParams,
    now: DateTime<Utc>,
    start_grace: Duration,
) -> Result<(), ScheduleError> {
    if params.principal <= Decimal::ZERO {
        return Err(ScheduleError::NonPositivePrincipal(params.principal));
    }
    if params.cycles_total == 0 {
        return Err(ScheduleError::NonPositiveCycles);
    }
    if params.days_per_cycle == 0 {
        return Err(ScheduleError::NonPositiveDaysPerCycle);
    }
    if params.daily_rate <= Decimal::ZERO || params.daily_rate > Decimal::ONE {
        return Err(ScheduleError::RateOutOfRange(params.daily_rate));
    }

    let total = u64::from(params.cycles_total) * u64::from(params.days_per_cycle);
    if total > u64::from(MAX_SCHEDULE_ITEMS) {
        return Err(ScheduleError::TooManyItems(total));
    }

    let span = u64::from(params.cycles_total)
        * (u64::from(params.days_per_cycle) + u64::from(params.pause_days));
    if span > MAX_SCHEDULE_SPAN_DAYS {
        return Err(ScheduleError::SpanTooLong(span));
    }

    let earliest = now - start_grace;
    if params.start_date < earliest {
        return Err(ScheduleError::StartInPast {
            start: params.start_date,
            earliest,
        });
    }

    Ok(())
}
