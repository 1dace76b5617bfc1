use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use crate::ledger::types::AccountRow;

/// Signed change to the four engine-owned account counters.
///
/// Every change to `total_balance_cents`, `today_profit_cents`, `total_orders`
/// or `current_orders` goes through [`apply_delta`] (or the equivalent
/// conditional update in the Postgres store).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BalanceDelta {
    pub total_balance_cents: i64,
    pub today_profit_cents: i64,
    pub total_orders: i64,
    pub current_orders: i64,
}

impl BalanceDelta {
    pub fn credit(amount_cents: i64) -> Self {
        Self {
            total_balance_cents: amount_cents,
            ..Self::default()
        }
    }

    pub fn debit(amount_cents: i64) -> Self {
        Self {
            total_balance_cents: -amount_cents,
            ..Self::default()
        }
    }

    pub fn commission(commission_cents: i64) -> Self {
        Self {
            total_balance_cents: commission_cents,
            today_profit_cents: commission_cents,
            total_orders: 1,
            current_orders: 0,
        }
    }

    pub fn service_reservation(amount_cents: i64) -> Self {
        Self {
            total_balance_cents: -amount_cents,
            current_orders: 1,
            ..Self::default()
        }
    }

    pub fn service_completion() -> Self {
        Self {
            current_orders: -1,
            ..Self::default()
        }
    }

    pub fn adjustment(delta_cents: i64) -> Self {
        Self::credit(delta_cents)
    }

    /// Delta that brings balance, today's profit and total orders back to zero.
    pub fn reset_of(account: &AccountRow, today: NaiveDate) -> Self {
        Self {
            total_balance_cents: -account.total_balance_cents,
            today_profit_cents: -account.today_profit_on(today),
            total_orders: -account.total_orders,
            current_orders: 0,
        }
    }

    pub fn debits(&self) -> bool {
        self.total_balance_cents < 0
    }

    pub fn is_zero(&self) -> bool {
        *self == Self::default()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MutationKind {
    DepositApproved,
    WithdrawApproved,
    OrderCompleted,
    ServiceGrabbed,
    ServiceCompleted,
    AdminAdjustment,
    AdminReset,
}

impl MutationKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::DepositApproved => "deposit_approved",
            Self::WithdrawApproved => "withdraw_approved",
            Self::OrderCompleted => "order_completed",
            Self::ServiceGrabbed => "service_grabbed",
            Self::ServiceCompleted => "service_completed",
            Self::AdminAdjustment => "admin_adjustment",
            Self::AdminReset => "admin_reset",
        }
    }
}

/// The single event a balance mutation is attributed to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MutationCause {
    pub kind: MutationKind,
    pub reference_id: String,
}

impl MutationCause {
    pub fn new(kind: MutationKind, reference_id: impl Into<String>) -> Self {
        Self {
            kind,
            reference_id: reference_id.into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BalanceMutation {
    pub account_id: String,
    pub cause: MutationCause,
    pub delta: BalanceDelta,
    pub total_balance_cents: i64,
    pub today_profit_cents: i64,
    pub total_orders: i64,
    pub current_orders: i64,
    pub applied_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BalanceError {
    #[error("insufficient funds: available {available_cents}, required {required_cents}")]
    InsufficientFunds {
        available_cents: i64,
        required_cents: i64,
    },
    #[error("{0} would become negative")]
    CounterUnderflow(&'static str),
    #[error("{0} overflow")]
    Overflow(&'static str),
}

/// Applies `delta` to `account` in place, or leaves it untouched on error.
///
/// The daily profit accumulator is rolled to the UTC day of `now` before the
/// delta lands, so the first credit of a new day starts from zero.
pub fn apply_delta(
    account: &mut AccountRow,
    delta: BalanceDelta,
    cause: MutationCause,
    now: DateTime<Utc>,
) -> Result<BalanceMutation, BalanceError> {
    let today = now.date_naive();
    let profit_base = account.today_profit_on(today);

    let total_balance_cents = account
        .total_balance_cents
        .checked_add(delta.total_balance_cents)
        .ok_or(BalanceError::Overflow("total_balance_cents"))?;
    if delta.debits() && total_balance_cents < 0 {
        return Err(BalanceError::InsufficientFunds {
            available_cents: account.total_balance_cents,
            required_cents: delta.total_balance_cents.saturating_neg(),
        });
    }
    let today_profit_cents = checked_counter(
        profit_base,
        delta.today_profit_cents,
        "today_profit_cents",
    )?;
    let total_orders = checked_counter(account.total_orders, delta.total_orders, "total_orders")?;
    let current_orders = checked_counter(
        account.current_orders,
        delta.current_orders,
        "current_orders",
    )?;

    account.total_balance_cents = total_balance_cents;
    account.today_profit_cents = today_profit_cents;
    account.today_profit_day = today;
    account.total_orders = total_orders;
    account.current_orders = current_orders;
    account.updated_at = now;

    Ok(BalanceMutation {
        account_id: account.account_id.clone(),
        cause,
        delta,
        total_balance_cents,
        today_profit_cents,
        total_orders,
        current_orders,
        applied_at: now,
    })
}

fn checked_counter(current: i64, delta: i64, field: &'static str) -> Result<i64, BalanceError> {
    let next = current
        .checked_add(delta)
        .ok_or(BalanceError::Overflow(field))?;
    if next < 0 {
        return Err(BalanceError::CounterUnderflow(field));
    }
    Ok(next)
}
