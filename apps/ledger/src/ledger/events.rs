use std::sync::Arc;

use serde::Serialize;

use crate::ledger::balance::BalanceMutation;

/// Money-movement notifications published after a store operation commits.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum LedgerEvent {
    DepositApproved {
        deposit_id: String,
        mutation: BalanceMutation,
    },
    DepositRejected {
        deposit_id: String,
        account_id: String,
    },
    WithdrawApproved {
        withdraw_id: String,
        mutation: BalanceMutation,
    },
    WithdrawRejected {
        withdraw_id: String,
        account_id: String,
    },
    OrderCompleted {
        order_id: String,
        mutation: BalanceMutation,
    },
    ServiceGrabbed {
        service_order_id: String,
        mutation: BalanceMutation,
    },
    ServiceCompleted {
        service_order_id: String,
        mutation: BalanceMutation,
    },
    BalanceAdjusted {
        mutation: BalanceMutation,
    },
}

impl LedgerEvent {
    pub fn name(&self) -> &'static str {
        match self {
            Self::DepositApproved { .. } => "deposit_approved",
            Self::DepositRejected { .. } => "deposit_rejected",
            Self::WithdrawApproved { .. } => "withdraw_approved",
            Self::WithdrawRejected { .. } => "withdraw_rejected",
            Self::OrderCompleted { .. } => "order_completed",
            Self::ServiceGrabbed { .. } => "service_grabbed",
            Self::ServiceCompleted { .. } => "service_completed",
            Self::BalanceAdjusted { .. } => "balance_adjusted",
        }
    }

    pub fn mutation(&self) -> Option<&BalanceMutation> {
        match self {
            Self::DepositApproved { mutation, .. }
            | Self::WithdrawApproved { mutation, .. }
            | Self::OrderCompleted { mutation, .. }
            | Self::ServiceGrabbed { mutation, .. }
            | Self::ServiceCompleted { mutation, .. }
            | Self::BalanceAdjusted { mutation } => Some(mutation),
            Self::DepositRejected { .. } | Self::WithdrawRejected { .. } => None,
        }
    }
}

pub trait LedgerObserver: Send + Sync {
    fn notify(&self, event: &LedgerEvent);
}

#[derive(Debug, Default, Clone, Copy)]
pub struct TracingObserver;

impl LedgerObserver for TracingObserver {
    fn notify(&self, event: &LedgerEvent) {
        match event.mutation() {
            Some(mutation) => tracing::info!(
                event = event.name(),
                account_id = %mutation.account_id,
                cause = mutation.cause.kind.as_str(),
                reference_id = %mutation.cause.reference_id,
                delta_cents = mutation.delta.total_balance_cents,
                total_balance_cents = mutation.total_balance_cents,
                "ledger balance mutation"
            ),
            None => tracing::info!(event = event.name(), "ledger request resolved"),
        }
    }
}

pub fn tracing_observer() -> Arc<dyn LedgerObserver> {
    Arc::new(TracingObserver)
}

#[cfg(test)]
pub(crate) mod recording {
    use std::sync::Mutex;

    use super::{LedgerEvent, LedgerObserver};

    /// Observer that keeps every event for assertions.
    #[derive(Default)]
    pub struct RecordingObserver {
        events: Mutex<Vec<LedgerEvent>>,
    }

    impl RecordingObserver {
        pub fn names(&self) -> Vec<&'static str> {
            self.events
                .lock()
                .map(|events| events.iter().map(LedgerEvent::name).collect())
                .unwrap_or_default()
        }

        pub fn events(&self) -> Vec<LedgerEvent> {
            self.events
                .lock()
                .map(|events| events.clone())
                .unwrap_or_default()
        }
    }

    impl LedgerObserver for RecordingObserver {
        fn notify(&self, event: &LedgerEvent) {
            if let Ok(mut events) = self.events.lock() {
                events.push(event.clone());
            }
        }
    }
}
