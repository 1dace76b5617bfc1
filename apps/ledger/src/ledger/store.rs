use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tokio_postgres::Transaction;

use crate::db::LedgerDb;
use crate::ledger::balance::{
    BalanceDelta, BalanceError, BalanceMutation, MutationCause, MutationKind, apply_delta,
};
use crate::ledger::types::{
    AccountRole, AccountRow, DepositRequestRow, DepositWallet, LedgerStats, NewOrder,
    OrderPlatform, OrderRow, OrderScopeKey, OrderStatus, OrderType, RequestDecision,
    RequestStatus, ServiceOrderRow, ServiceOrderStatus, WalletRef, WithdrawRequestRow,
};

#[derive(Debug, thiserror::Error)]
pub enum LedgerStoreError {
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("invalid state: {0}")]
    InvalidState(String),
    #[error("forbidden: {0}")]
    Forbidden(String),
    #[error("insufficient funds: available {available_cents}, required {required_cents}")]
    InsufficientFunds {
        available_cents: i64,
        required_cents: i64,
    },
    #[error("db error: {0}")]
    Db(String),
}

impl From<BalanceError> for LedgerStoreError {
    fn from(error: BalanceError) -> Self {
        match error {
            BalanceError::InsufficientFunds {
                available_cents,
                required_cents,
            } => Self::InsufficientFunds {
                available_cents,
                required_cents,
            },
            BalanceError::CounterUnderflow(_) | BalanceError::Overflow(_) => {
                Self::InvalidState(error.to_string())
            }
        }
    }
}

fn db_error(error: tokio_postgres::Error) -> LedgerStoreError {
    LedgerStoreError::Db(error.to_string())
}

/// A resolved deposit or withdraw request plus the balance mutation it caused.
#[derive(Debug, Clone)]
pub struct Resolution<T> {
    pub request: T,
    pub mutation: Option<BalanceMutation>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PurgeCounts {
    pub deposits: u64,
    pub withdrawals: u64,
}

#[async_trait]
pub trait LedgerStore: Send + Sync {
    async fn insert_account(&self, account: AccountRow) -> Result<AccountRow, LedgerStoreError>;

    async fn get_account(&self, account_id: &str) -> Result<Option<AccountRow>, LedgerStoreError>;

    async fn find_account_by_phone(
        &self,
        phone: &str,
    ) -> Result<Option<AccountRow>, LedgerStoreError>;

    /// Earliest-created account whose nickname or phone equals `identifier`.
    async fn find_account_by_nickname_or_phone(
        &self,
        identifier: &str,
    ) -> Result<Option<AccountRow>, LedgerStoreError>;

    async fn find_account_by_invitation_code(
        &self,
        invitation_code: &str,
    ) -> Result<Option<AccountRow>, LedgerStoreError>;

    /// Accounts ordered by creation time; `query` filters case-insensitively on
    /// nickname, phone and invitation code.
    async fn list_accounts(&self, query: Option<&str>)
    -> Result<Vec<AccountRow>, LedgerStoreError>;

    async fn update_wallet(
        &self,
        account_id: &str,
        wallet: WalletRef,
        now: DateTime<Utc>,
    ) -> Result<AccountRow, LedgerStoreError>;

    async fn set_deposit_wallet(
        &self,
        account_id: &str,
        wallet: DepositWallet,
        now: DateTime<Utc>,
    ) -> Result<AccountRow, LedgerStoreError>;

    async fn apply_balance_delta(
        &self,
        account_id: &str,
        delta: BalanceDelta,
        cause: MutationCause,
        now: DateTime<Utc>,
    ) -> Result<BalanceMutation, LedgerStoreError>;

    async fn reset_account(
        &self,
        account_id: &str,
        reference_id: &str,
        now: DateTime<Utc>,
    ) -> Result<BalanceMutation, LedgerStoreError>;

    async fn insert_deposit(
        &self,
        deposit: DepositRequestRow,
    ) -> Result<DepositRequestRow, LedgerStoreError>;

    async fn list_deposits(
        &self,
        status: Option<RequestStatus>,
    ) -> Result<Vec<DepositRequestRow>, LedgerStoreError>;

    /// Newest first.
    async fn list_account_deposits(
        &self,
        account_id: &str,
    ) -> Result<Vec<DepositRequestRow>, LedgerStoreError>;

    /// Applies the decision and, for approvals, credits the account in the
    /// same atomic step.
    async fn resolve_deposit(
        &self,
        deposit_id: &str,
        decision: RequestDecision,
        now: DateTime<Utc>,
    ) -> Result<Resolution<DepositRequestRow>, LedgerStoreError>;

    async fn insert_withdraw(
        &self,
        withdraw: WithdrawRequestRow,
    ) -> Result<WithdrawRequestRow, LedgerStoreError>;

    async fn list_withdrawals(
        &self,
        status: Option<RequestStatus>,
    ) -> Result<Vec<WithdrawRequestRow>, LedgerStoreError>;

    /// Newest first.
    async fn list_account_withdrawals(
        &self,
        account_id: &str,
    ) -> Result<Vec<WithdrawRequestRow>, LedgerStoreError>;

    /// Applies the decision and, for approvals, debits the account in the same
    /// atomic step. A failed debit leaves the request pending.
    async fn resolve_withdraw(
        &self,
        withdraw_id: &str,
        decision: RequestDecision,
        now: DateTime<Utc>,
    ) -> Result<Resolution<WithdrawRequestRow>, LedgerStoreError>;

    /// Inserts all orders or none, assigning consecutive indices per scope.
    async fn insert_orders(&self, orders: Vec<NewOrder>) -> Result<Vec<OrderRow>, LedgerStoreError>;

    async fn list_visible_orders(
        &self,
        platform: OrderPlatform,
        invitation_code: &str,
    ) -> Result<Vec<OrderRow>, LedgerStoreError>;

    /// Archives and removes the order while crediting its commission.
    async fn complete_order(
        &self,
        order_id: &str,
        account_id: &str,
        now: DateTime<Utc>,
    ) -> Result<(OrderRow, BalanceMutation), LedgerStoreError>;

    /// Debits the service amount and records the queued service order together.
    async fn grab_service(
        &self,
        service_order: ServiceOrderRow,
        now: DateTime<Utc>,
    ) -> Result<(ServiceOrderRow, BalanceMutation), LedgerStoreError>;

    async fn complete_service(
        &self,
        service_order_id: &str,
        account_id: &str,
        now: DateTime<Utc>,
    ) -> Result<(ServiceOrderRow, BalanceMutation), LedgerStoreError>;

    async fn stats(&self) -> Result<LedgerStats, LedgerStoreError>;

    /// Deletes approved and rejected requests created before `cutoff`.
    async fn purge_resolved_before(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<PurgeCounts, LedgerStoreError>;
}

pub fn memory() -> Arc<dyn LedgerStore> {
    Arc::new(MemoryLedgerStore::default())
}

pub fn postgres(db: Arc<LedgerDb>) -> Arc<dyn LedgerStore> {
    Arc::new(PostgresLedgerStore { db })
}

#[derive(Default)]
struct MemoryLedgerStore {
    inner: Mutex<MemoryLedgerStoreInner>,
}

#[derive(Default)]
struct MemoryLedgerStoreInner {
    accounts: HashMap<String, AccountRow>,
    deposits: HashMap<String, DepositRequestRow>,
    withdrawals: HashMap<String, WithdrawRequestRow>,
    orders: HashMap<String, OrderRow>,
    order_sequences: HashMap<OrderScopeKey, i64>,
    service_orders: HashMap<String, ServiceOrderRow>,
}

impl MemoryLedgerStoreInner {
    fn account_mut(&mut self, account_id: &str) -> Result<&mut AccountRow, LedgerStoreError> {
        self.accounts
            .get_mut(account_id)
            .ok_or_else(|| LedgerStoreError::NotFound("account".to_string()))
    }

    fn accounts_by_created(&self) -> Vec<AccountRow> {
        let mut rows = self.accounts.values().cloned().collect::<Vec<_>>();
        rows.sort_by(|left, right| {
            left.created_at
                .cmp(&right.created_at)
                .then_with(|| left.account_id.cmp(&right.account_id))
        });
        rows
    }
}

fn matches_query(account: &AccountRow, query: &str) -> bool {
    let needle = query.to_lowercase();
    [&account.nickname, &account.phone, &account.invitation_code]
        .iter()
        .any(|field| field.to_lowercase().contains(&needle))
}

fn pending_error(kind: &str, status: RequestStatus) -> LedgerStoreError {
    LedgerStoreError::InvalidState(format!("{kind} request is already {}", status.as_str()))
}

#[async_trait]
impl LedgerStore for MemoryLedgerStore {
    async fn insert_account(&self, account: AccountRow) -> Result<AccountRow, LedgerStoreError> {
        let mut inner = self.inner.lock().await;
        if inner.accounts.values().any(|row| row.phone == account.phone) {
            return Err(LedgerStoreError::Conflict(
                "phone already registered".to_string(),
            ));
        }
        if inner
            .accounts
            .values()
            .any(|row| row.invitation_code == account.invitation_code)
        {
            return Err(LedgerStoreError::Conflict(
                "invitation code already in use".to_string(),
            ));
        }
        inner
            .accounts
            .insert(account.account_id.clone(), account.clone());
        Ok(account)
    }

    async fn get_account(&self, account_id: &str) -> Result<Option<AccountRow>, LedgerStoreError> {
        let inner = self.inner.lock().await;
        Ok(inner.accounts.get(account_id).cloned())
    }

    async fn find_account_by_phone(
        &self,
        phone: &str,
    ) -> Result<Option<AccountRow>, LedgerStoreError> {
        let inner = self.inner.lock().await;
        Ok(inner.accounts.values().find(|row| row.phone == phone).cloned())
    }

    async fn find_account_by_nickname_or_phone(
        &self,
        identifier: &str,
    ) -> Result<Option<AccountRow>, LedgerStoreError> {
        let inner = self.inner.lock().await;
        Ok(inner
            .accounts_by_created()
            .into_iter()
            .find(|row| row.nickname == identifier || row.phone == identifier))
    }

    async fn find_account_by_invitation_code(
        &self,
        invitation_code: &str,
    ) -> Result<Option<AccountRow>, LedgerStoreError> {
        let inner = self.inner.lock().await;
        Ok(inner
            .accounts
            .values()
            .find(|row| row.invitation_code == invitation_code)
            .cloned())
    }

    async fn list_accounts(
        &self,
        query: Option<&str>,
    ) -> Result<Vec<AccountRow>, LedgerStoreError> {
        let inner = self.inner.lock().await;
        let rows = inner.accounts_by_created();
        Ok(match query {
            Some(query) => rows
                .into_iter()
                .filter(|row| matches_query(row, query))
                .collect(),
            None => rows,
        })
    }

    async fn update_wallet(
        &self,
        account_id: &str,
        wallet: WalletRef,
        now: DateTime<Utc>,
    ) -> Result<AccountRow, LedgerStoreError> {
        let mut inner = self.inner.lock().await;
        let account = inner.account_mut(account_id)?;
        account.wallet = wallet;
        account.updated_at = now;
        Ok(account.clone())
    }

    async fn set_deposit_wallet(
        &self,
        account_id: &str,
        wallet: DepositWallet,
        now: DateTime<Utc>,
    ) -> Result<AccountRow, LedgerStoreError> {
        let mut inner = self.inner.lock().await;
        let account = inner.account_mut(account_id)?;
        account.deposit_wallet = Some(wallet);
        account.updated_at = now;
        Ok(account.clone())
    }

    async fn apply_balance_delta(
        &self,
        account_id: &str,
        delta: BalanceDelta,
        cause: MutationCause,
        now: DateTime<Utc>,
    ) -> Result<BalanceMutation, LedgerStoreError> {
        let mut inner = self.inner.lock().await;
        let account = inner.account_mut(account_id)?;
        Ok(apply_delta(account, delta, cause, now)?)
    }

    async fn reset_account(
        &self,
        account_id: &str,
        reference_id: &str,
        now: DateTime<Utc>,
    ) -> Result<BalanceMutation, LedgerStoreError> {
        let mut inner = self.inner.lock().await;
        let account = inner.account_mut(account_id)?;
        let delta = BalanceDelta::reset_of(account, now.date_naive());
        let cause = MutationCause::new(MutationKind::AdminReset, reference_id);
        Ok(apply_delta(account, delta, cause, now)?)
    }

    async fn insert_deposit(
        &self,
        deposit: DepositRequestRow,
    ) -> Result<DepositRequestRow, LedgerStoreError> {
        let mut inner = self.inner.lock().await;
        if inner.deposits.contains_key(&deposit.deposit_id) {
            return Err(LedgerStoreError::Conflict(
                "deposit_id already exists".to_string(),
            ));
        }
        inner
            .deposits
            .insert(deposit.deposit_id.clone(), deposit.clone());
        Ok(deposit)
    }

    async fn list_deposits(
        &self,
        status: Option<RequestStatus>,
    ) -> Result<Vec<DepositRequestRow>, LedgerStoreError> {
        let inner = self.inner.lock().await;
        let mut rows = inner
            .deposits
            .values()
            .filter(|row| status.is_none_or(|status| row.status == status))
            .cloned()
            .collect::<Vec<_>>();
        rows.sort_by(|left, right| right.created_at.cmp(&left.created_at));
        Ok(rows)
    }

    async fn list_account_deposits(
        &self,
        account_id: &str,
    ) -> Result<Vec<DepositRequestRow>, LedgerStoreError> {
        let inner = self.inner.lock().await;
        let mut rows = inner
            .deposits
            .values()
            .filter(|row| row.account_id == account_id)
            .cloned()
            .collect::<Vec<_>>();
        rows.sort_by(|left, right| right.created_at.cmp(&left.created_at));
        Ok(rows)
    }

    async fn resolve_deposit(
        &self,
        deposit_id: &str,
        decision: RequestDecision,
        now: DateTime<Utc>,
    ) -> Result<Resolution<DepositRequestRow>, LedgerStoreError> {
        let mut guard = self.inner.lock().await;
        let inner = &mut *guard;
        let request = inner
            .deposits
            .get_mut(deposit_id)
            .ok_or_else(|| LedgerStoreError::NotFound("deposit request".to_string()))?;
        if request.status != RequestStatus::Pending {
            return Err(pending_error("deposit", request.status));
        }

        let mutation = match decision {
            RequestDecision::Approve => {
                let account = inner
                    .accounts
                    .get_mut(&request.account_id)
                    .ok_or_else(|| LedgerStoreError::NotFound("account".to_string()))?;
                Some(apply_delta(
                    account,
                    BalanceDelta::credit(request.amount_cents),
                    MutationCause::new(MutationKind::DepositApproved, deposit_id),
                    now,
                )?)
            }
            RequestDecision::Reject => None,
        };

        request.status = decision.target_status();
        request.resolved_at = Some(now);
        Ok(Resolution {
            request: request.clone(),
            mutation,
        })
    }

    async fn insert_withdraw(
        &self,
        withdraw: WithdrawRequestRow,
    ) -> Result<WithdrawRequestRow, LedgerStoreError> {
        let mut inner = self.inner.lock().await;
        if inner.withdrawals.contains_key(&withdraw.withdraw_id) {
            return Err(LedgerStoreError::Conflict(
                "withdraw_id already exists".to_string(),
            ));
        }
        inner
            .withdrawals
            .insert(withdraw.withdraw_id.clone(), withdraw.clone());
        Ok(withdraw)
    }

    async fn list_withdrawals(
        &self,
        status: Option<RequestStatus>,
    ) -> Result<Vec<WithdrawRequestRow>, LedgerStoreError> {
        let inner = self.inner.lock().await;
        let mut rows = inner
            .withdrawals
            .values()
            .filter(|row| status.is_none_or(|status| row.status == status))
            .cloned()
            .collect::<Vec<_>>();
        rows.sort_by(|left, right| right.created_at.cmp(&left.created_at));
        Ok(rows)
    }

    async fn list_account_withdrawals(
        &self,
        account_id: &str,
    ) -> Result<Vec<WithdrawRequestRow>, LedgerStoreError> {
        let inner = self.inner.lock().await;
        let mut rows = inner
            .withdrawals
            .values()
            .filter(|row| row.account_id == account_id)
            .cloned()
            .collect::<Vec<_>>();
        rows.sort_by(|left, right| right.created_at.cmp(&left.created_at));
        Ok(rows)
    }

    async fn resolve_withdraw(
        &self,
        withdraw_id: &str,
        decision: RequestDecision,
        now: DateTime<Utc>,
    ) -> Result<Resolution<WithdrawRequestRow>, LedgerStoreError> {
        let mut guard = self.inner.lock().await;
        let inner = &mut *guard;
        let request = inner
            .withdrawals
            .get_mut(withdraw_id)
            .ok_or_else(|| LedgerStoreError::NotFound("withdraw request".to_string()))?;
        if request.status != RequestStatus::Pending {
            return Err(pending_error("withdraw", request.status));
        }

        let mutation = match decision {
            RequestDecision::Approve => {
                let account = inner
                    .accounts
                    .get_mut(&request.account_id)
                    .ok_or_else(|| LedgerStoreError::NotFound("account".to_string()))?;
                Some(apply_delta(
                    account,
                    BalanceDelta::debit(request.amount_cents),
                    MutationCause::new(MutationKind::WithdrawApproved, withdraw_id),
                    now,
                )?)
            }
            RequestDecision::Reject => None,
        };

        request.status = decision.target_status();
        request.resolved_at = Some(now);
        Ok(Resolution {
            request: request.clone(),
            mutation,
        })
    }

    async fn insert_orders(&self, orders: Vec<NewOrder>) -> Result<Vec<OrderRow>, LedgerStoreError> {
        let mut inner = self.inner.lock().await;
        if let Some(duplicate) = orders
            .iter()
            .find(|order| inner.orders.contains_key(&order.order_id))
        {
            return Err(LedgerStoreError::Conflict(format!(
                "order_id {} already exists",
                duplicate.order_id
            )));
        }

        let mut inserted = Vec::with_capacity(orders.len());
        for order in orders {
            let next = inner.order_sequences.entry(order.scope_key()).or_insert(0);
            *next += 1;
            let row = order.into_row(*next);
            inner.orders.insert(row.order_id.clone(), row.clone());
            inserted.push(row);
        }
        Ok(inserted)
    }

    async fn list_visible_orders(
        &self,
        platform: OrderPlatform,
        invitation_code: &str,
    ) -> Result<Vec<OrderRow>, LedgerStoreError> {
        let inner = self.inner.lock().await;
        let mut rows = inner
            .orders
            .values()
            .filter(|row| row.platform == platform && row.visible_to(invitation_code))
            .cloned()
            .collect::<Vec<_>>();
        rows.sort_by(|left, right| {
            left.order_index
                .cmp(&right.order_index)
                .then_with(|| left.created_at.cmp(&right.created_at))
        });
        Ok(rows)
    }

    async fn complete_order(
        &self,
        order_id: &str,
        account_id: &str,
        now: DateTime<Utc>,
    ) -> Result<(OrderRow, BalanceMutation), LedgerStoreError> {
        let mut guard = self.inner.lock().await;
        let inner = &mut *guard;
        let order = inner
            .orders
            .get(order_id)
            .ok_or_else(|| LedgerStoreError::NotFound("order".to_string()))?;
        if order.status != OrderStatus::Active {
            return Err(LedgerStoreError::InvalidState(
                "order is not active".to_string(),
            ));
        }
        let account = inner
            .accounts
            .get_mut(account_id)
            .ok_or_else(|| LedgerStoreError::NotFound("account".to_string()))?;
        if !order.visible_to(&account.invitation_code) {
            return Err(LedgerStoreError::Forbidden(
                "order is assigned to another account".to_string(),
            ));
        }

        let mutation = apply_delta(
            account,
            BalanceDelta::commission(order.commission_cents),
            MutationCause::new(MutationKind::OrderCompleted, order_id),
            now,
        )?;
        let mut archived = inner
            .orders
            .remove(order_id)
            .ok_or_else(|| LedgerStoreError::NotFound("order".to_string()))?;
        archived.status = OrderStatus::Archived;
        archived.completed_by = Some(account_id.to_string());
        Ok((archived, mutation))
    }

    async fn grab_service(
        &self,
        service_order: ServiceOrderRow,
        now: DateTime<Utc>,
    ) -> Result<(ServiceOrderRow, BalanceMutation), LedgerStoreError> {
        let mut guard = self.inner.lock().await;
        let inner = &mut *guard;
        if inner
            .service_orders
            .contains_key(&service_order.service_order_id)
        {
            return Err(LedgerStoreError::Conflict(
                "service_order_id already exists".to_string(),
            ));
        }
        let account = inner
            .accounts
            .get_mut(&service_order.account_id)
            .ok_or_else(|| LedgerStoreError::NotFound("account".to_string()))?;
        let mutation = apply_delta(
            account,
            BalanceDelta::service_reservation(service_order.amount_cents),
            MutationCause::new(
                MutationKind::ServiceGrabbed,
                service_order.service_order_id.clone(),
            ),
            now,
        )?;
        inner
            .service_orders
            .insert(service_order.service_order_id.clone(), service_order.clone());
        Ok((service_order, mutation))
    }

    async fn complete_service(
        &self,
        service_order_id: &str,
        account_id: &str,
        now: DateTime<Utc>,
    ) -> Result<(ServiceOrderRow, BalanceMutation), LedgerStoreError> {
        let mut guard = self.inner.lock().await;
        let inner = &mut *guard;
        let service_order = inner
            .service_orders
            .get_mut(service_order_id)
            .ok_or_else(|| LedgerStoreError::NotFound("service order".to_string()))?;
        if service_order.account_id != account_id {
            return Err(LedgerStoreError::Forbidden(
                "service order belongs to another account".to_string(),
            ));
        }
        if service_order.status != ServiceOrderStatus::Queued {
            return Err(LedgerStoreError::InvalidState(
                "service order is already done".to_string(),
            ));
        }
        let account = inner
            .accounts
            .get_mut(account_id)
            .ok_or_else(|| LedgerStoreError::NotFound("account".to_string()))?;
        let mutation = apply_delta(
            account,
            BalanceDelta::service_completion(),
            MutationCause::new(MutationKind::ServiceCompleted, service_order_id),
            now,
        )?;
        service_order.status = ServiceOrderStatus::Done;
        service_order.completed_at = Some(now);
        Ok((service_order.clone(), mutation))
    }

    // Totals saturate at i64::MAX instead of overflowing.
    async fn stats(&self) -> Result<LedgerStats, LedgerStoreError> {
        let inner = self.inner.lock().await;
        let approved_deposits_cents = inner
            .deposits
            .values()
            .filter(|row| row.status == RequestStatus::Approved)
            .map(|row| row.amount_cents)
            .fold(0, i64::saturating_add);
        let approved_withdrawals_cents = inner
            .withdrawals
            .values()
            .filter(|row| row.status == RequestStatus::Approved)
            .map(|row| row.amount_cents)
            .fold(0, i64::saturating_add);
        Ok(LedgerStats {
            total_accounts: inner.accounts.len() as u64,
            total_balance_cents: inner
                .accounts
                .values()
                .map(|row| row.total_balance_cents)
                .fold(0, i64::saturating_add),
            approved_deposits_cents,
            approved_withdrawals_cents,
            pending_deposits: inner
                .deposits
                .values()
                .filter(|row| row.status == RequestStatus::Pending)
                .count() as u64,
            pending_withdrawals: inner
                .withdrawals
                .values()
                .filter(|row| row.status == RequestStatus::Pending)
                .count() as u64,
        })
    }

    async fn purge_resolved_before(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<PurgeCounts, LedgerStoreError> {
        let mut inner = self.inner.lock().await;
        let deposits_before = inner.deposits.len();
        inner
            .deposits
            .retain(|_, row| !(row.status.is_resolved() && row.created_at < cutoff));
        let withdrawals_before = inner.withdrawals.len();
        inner
            .withdrawals
            .retain(|_, row| !(row.status.is_resolved() && row.created_at < cutoff));
        Ok(PurgeCounts {
            deposits: (deposits_before - inner.deposits.len()) as u64,
            withdrawals: (withdrawals_before - inner.withdrawals.len()) as u64,
        })
    }
}

struct PostgresLedgerStore {
    db: Arc<LedgerDb>,
}

const ACCOUNT_COLUMNS: &str = "account_id, nickname, phone, invitation_code, credential_hash, \
     total_balance_cents, today_profit_cents, today_profit_day, total_orders, current_orders, \
     wallet_platform, wallet_address, deposit_wallet_address, deposit_wallet_network, role, \
     created_at, updated_at";

const DEPOSIT_COLUMNS: &str = "deposit_id, account_id, amount_cents, network, wallet_address, \
     invitation_code, status, created_at, resolved_at";

const WITHDRAW_COLUMNS: &str = "withdraw_id, account_id, amount_cents, wallet_address, network, \
     invitation_code, status, created_at, resolved_at";

const ORDER_COLUMNS: &str = "order_id, platform, order_type, title, amount_cents, \
     commission_cents, total_profit_cents, order_index, image, images, invitation_code, status, \
     completed_by, created_at";

const SERVICE_ORDER_COLUMNS: &str =
    "service_order_id, account_id, service_name, amount_cents, status, created_at, completed_at";

impl PostgresLedgerStore {
    async fn query_accounts(
        &self,
        filter: &str,
        params: &[&(dyn tokio_postgres::types::ToSql + Sync)],
    ) -> Result<Vec<AccountRow>, LedgerStoreError> {
        let client = self.db.client();
        let client = client.lock().await;
        let sql = format!("SELECT {ACCOUNT_COLUMNS} FROM ledger.accounts {filter}");
        let rows = client.query(&sql, params).await.map_err(db_error)?;
        rows.iter()
            .map(map_account_row)
            .collect::<Result<Vec<_>, _>>()
            .map_err(LedgerStoreError::Db)
    }

    async fn query_one_account(
        &self,
        filter: &str,
        params: &[&(dyn tokio_postgres::types::ToSql + Sync)],
    ) -> Result<Option<AccountRow>, LedgerStoreError> {
        Ok(self.query_accounts(filter, params).await?.into_iter().next())
    }
}

/// Conditional balance update shared by every composite operation.
///
/// A zero-row update is diagnosed by replaying the delta through the engine
/// against the current row, which yields the same error the memory store does.
async fn apply_delta_tx(
    tx: &Transaction<'_>,
    account_id: &str,
    delta: BalanceDelta,
    cause: MutationCause,
    now: DateTime<Utc>,
) -> Result<BalanceMutation, LedgerStoreError> {
    let today = now.date_naive();
    let updated = tx
        .query_opt(
            r#"
            UPDATE ledger.accounts
               SET total_balance_cents = total_balance_cents + $2::bigint,
                   today_profit_cents =
                       CASE WHEN today_profit_day = $6::date THEN today_profit_cents ELSE 0 END
                       + $3::bigint,
                   today_profit_day = $6::date,
                   total_orders = total_orders + $4::bigint,
                   current_orders = current_orders + $5::bigint,
                   updated_at = $7
             WHERE account_id = $1
               AND ($2::bigint >= 0 OR total_balance_cents + $2::bigint >= 0)
               AND CASE WHEN today_profit_day = $6::date THEN today_profit_cents ELSE 0 END
                   + $3::bigint >= 0
               AND total_orders + $4::bigint >= 0
               AND current_orders + $5::bigint >= 0
            RETURNING total_balance_cents, today_profit_cents, total_orders, current_orders
            "#,
            &[
                &account_id,
                &delta.total_balance_cents,
                &delta.today_profit_cents,
                &delta.total_orders,
                &delta.current_orders,
                &today,
                &now,
            ],
        )
        .await
        .map_err(db_error)?;

    let Some(row) = updated else {
        let current = tx
            .query_opt(
                &format!("SELECT {ACCOUNT_COLUMNS} FROM ledger.accounts WHERE account_id = $1"),
                &[&account_id],
            )
            .await
            .map_err(db_error)?
            .ok_or_else(|| LedgerStoreError::NotFound("account".to_string()))?;
        let mut account = map_account_row(&current).map_err(LedgerStoreError::Db)?;
        apply_delta(&mut account, delta, cause, now)?;
        return Err(LedgerStoreError::Db(
            "conditional balance update matched no row".to_string(),
        ));
    };

    Ok(BalanceMutation {
        account_id: account_id.to_string(),
        cause,
        delta,
        total_balance_cents: row.try_get(0).map_err(db_error)?,
        today_profit_cents: row.try_get(1).map_err(db_error)?,
        total_orders: row.try_get(2).map_err(db_error)?,
        current_orders: row.try_get(3).map_err(db_error)?,
        applied_at: now,
    })
}

fn unique_violation(error: &tokio_postgres::Error) -> Option<String> {
    let db_error = error.as_db_error()?;
    if db_error.code() != &tokio_postgres::error::SqlState::UNIQUE_VIOLATION {
        return None;
    }
    Some(db_error.constraint().unwrap_or("unique").to_string())
}

#[async_trait]
impl LedgerStore for PostgresLedgerStore {
    async fn insert_account(&self, account: AccountRow) -> Result<AccountRow, LedgerStoreError> {
        let client = self.db.client();
        let client = client.lock().await;
        let deposit_address = account
            .deposit_wallet
            .as_ref()
            .map(|wallet| wallet.address.clone());
        let deposit_network = account
            .deposit_wallet
            .as_ref()
            .map(|wallet| wallet.network.clone());
        let result = client
            .execute(
                r#"
                INSERT INTO ledger.accounts (
                    account_id, nickname, phone, invitation_code, credential_hash,
                    total_balance_cents, today_profit_cents, today_profit_day, total_orders,
                    current_orders, wallet_platform, wallet_address, deposit_wallet_address,
                    deposit_wallet_network, role, is_admin, created_at, updated_at
                ) VALUES (
                    $1,$2,$3,$4,$5,$6,$7,$8,$9,$10,$11,$12,$13,$14,$15,$16,$17,$18
                )
                "#,
                &[
                    &account.account_id,
                    &account.nickname,
                    &account.phone,
                    &account.invitation_code,
                    &account.credential_hash,
                    &account.total_balance_cents,
                    &account.today_profit_cents,
                    &account.today_profit_day,
                    &account.total_orders,
                    &account.current_orders,
                    &account.wallet.platform,
                    &account.wallet.address,
                    &deposit_address,
                    &deposit_network,
                    &account.role.as_str(),
                    &account.is_admin(),
                    &account.created_at,
                    &account.updated_at,
                ],
            )
            .await;
        match result {
            Ok(_) => Ok(account),
            Err(error) => match unique_violation(&error) {
                Some(constraint) if constraint.contains("phone") => Err(
                    LedgerStoreError::Conflict("phone already registered".to_string()),
                ),
                Some(constraint) if constraint.contains("invitation") => Err(
                    LedgerStoreError::Conflict("invitation code already in use".to_string()),
                ),
                Some(constraint) => Err(LedgerStoreError::Conflict(constraint)),
                None => Err(db_error(error)),
            },
        }
    }

    async fn get_account(&self, account_id: &str) -> Result<Option<AccountRow>, LedgerStoreError> {
        self.query_one_account("WHERE account_id = $1", &[&account_id])
            .await
    }

    async fn find_account_by_phone(
        &self,
        phone: &str,
    ) -> Result<Option<AccountRow>, LedgerStoreError> {
        self.query_one_account("WHERE phone = $1", &[&phone]).await
    }

    async fn find_account_by_nickname_or_phone(
        &self,
        identifier: &str,
    ) -> Result<Option<AccountRow>, LedgerStoreError> {
        self.query_one_account(
            "WHERE nickname = $1 OR phone = $1 ORDER BY created_at, account_id LIMIT 1",
            &[&identifier],
        )
        .await
    }

    async fn find_account_by_invitation_code(
        &self,
        invitation_code: &str,
    ) -> Result<Option<AccountRow>, LedgerStoreError> {
        self.query_one_account("WHERE invitation_code = $1", &[&invitation_code])
            .await
    }

    async fn list_accounts(
        &self,
        query: Option<&str>,
    ) -> Result<Vec<AccountRow>, LedgerStoreError> {
        match query {
            Some(query) => {
                let pattern = format!("%{}%", escape_like(query));
                self.query_accounts(
                    "WHERE nickname ILIKE $1 OR phone ILIKE $1 OR invitation_code ILIKE $1 \
                     ORDER BY created_at, account_id",
                    &[&pattern],
                )
                .await
            }
            None => {
                self.query_accounts("ORDER BY created_at, account_id", &[])
                    .await
            }
        }
    }

    async fn update_wallet(
        &self,
        account_id: &str,
        wallet: WalletRef,
        now: DateTime<Utc>,
    ) -> Result<AccountRow, LedgerStoreError> {
        let client = self.db.client();
        let client = client.lock().await;
        let row = client
            .query_opt(
                &format!(
                    "UPDATE ledger.accounts \
                        SET wallet_platform = $2, wallet_address = $3, updated_at = $4 \
                      WHERE account_id = $1 \
                  RETURNING {ACCOUNT_COLUMNS}"
                ),
                &[&account_id, &wallet.platform, &wallet.address, &now],
            )
            .await
            .map_err(db_error)?
            .ok_or_else(|| LedgerStoreError::NotFound("account".to_string()))?;
        map_account_row(&row).map_err(LedgerStoreError::Db)
    }

    async fn set_deposit_wallet(
        &self,
        account_id: &str,
        wallet: DepositWallet,
        now: DateTime<Utc>,
    ) -> Result<AccountRow, LedgerStoreError> {
        let client = self.db.client();
        let client = client.lock().await;
        let row = client
            .query_opt(
                &format!(
                    "UPDATE ledger.accounts \
                        SET deposit_wallet_address = $2, deposit_wallet_network = $3, \
                            updated_at = $4 \
                      WHERE account_id = $1 \
                  RETURNING {ACCOUNT_COLUMNS}"
                ),
                &[&account_id, &wallet.address, &wallet.network, &now],
            )
            .await
            .map_err(db_error)?
            .ok_or_else(|| LedgerStoreError::NotFound("account".to_string()))?;
        map_account_row(&row).map_err(LedgerStoreError::Db)
    }

    async fn apply_balance_delta(
        &self,
        account_id: &str,
        delta: BalanceDelta,
        cause: MutationCause,
        now: DateTime<Utc>,
    ) -> Result<BalanceMutation, LedgerStoreError> {
        let client = self.db.client();
        let mut client = client.lock().await;
        let tx = client.transaction().await.map_err(db_error)?;
        let mutation = apply_delta_tx(&tx, account_id, delta, cause, now).await?;
        tx.commit().await.map_err(db_error)?;
        Ok(mutation)
    }

    async fn reset_account(
        &self,
        account_id: &str,
        reference_id: &str,
        now: DateTime<Utc>,
    ) -> Result<BalanceMutation, LedgerStoreError> {
        let client = self.db.client();
        let mut client = client.lock().await;
        let tx = client.transaction().await.map_err(db_error)?;
        let row = tx
            .query_opt(
                &format!(
                    "SELECT {ACCOUNT_COLUMNS} FROM ledger.accounts WHERE account_id = $1 FOR UPDATE"
                ),
                &[&account_id],
            )
            .await
            .map_err(db_error)?
            .ok_or_else(|| LedgerStoreError::NotFound("account".to_string()))?;
        let account = map_account_row(&row).map_err(LedgerStoreError::Db)?;
        let delta = BalanceDelta::reset_of(&account, now.date_naive());
        let cause = MutationCause::new(MutationKind::AdminReset, reference_id);
        let mutation = apply_delta_tx(&tx, account_id, delta, cause, now).await?;
        tx.commit().await.map_err(db_error)?;
        Ok(mutation)
    }

    async fn insert_deposit(
        &self,
        deposit: DepositRequestRow,
    ) -> Result<DepositRequestRow, LedgerStoreError> {
        let client = self.db.client();
        let client = client.lock().await;
        client
            .execute(
                r#"
                INSERT INTO ledger.deposit_requests (
                    deposit_id, account_id, amount_cents, network, wallet_address,
                    invitation_code, status, created_at, resolved_at
                ) VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9)
                "#,
                &[
                    &deposit.deposit_id,
                    &deposit.account_id,
                    &deposit.amount_cents,
                    &deposit.network,
                    &deposit.wallet_address,
                    &deposit.invitation_code,
                    &deposit.status.as_str(),
                    &deposit.created_at,
                    &deposit.resolved_at,
                ],
            )
            .await
            .map_err(|error| match unique_violation(&error) {
                Some(_) => LedgerStoreError::Conflict("deposit_id already exists".to_string()),
                None => db_error(error),
            })?;
        Ok(deposit)
    }

    async fn list_deposits(
        &self,
        status: Option<RequestStatus>,
    ) -> Result<Vec<DepositRequestRow>, LedgerStoreError> {
        let client = self.db.client();
        let client = client.lock().await;
        let status = status.map(RequestStatus::as_str);
        let rows = client
            .query(
                &format!(
                    "SELECT {DEPOSIT_COLUMNS} FROM ledger.deposit_requests \
                      WHERE $1::text IS NULL OR status = $1 \
                      ORDER BY created_at DESC"
                ),
                &[&status],
            )
            .await
            .map_err(db_error)?;
        rows.iter()
            .map(map_deposit_row)
            .collect::<Result<Vec<_>, _>>()
            .map_err(LedgerStoreError::Db)
    }

    async fn list_account_deposits(
        &self,
        account_id: &str,
    ) -> Result<Vec<DepositRequestRow>, LedgerStoreError> {
        let client = self.db.client();
        let client = client.lock().await;
        let rows = client
            .query(
                &format!(
                    "SELECT {DEPOSIT_COLUMNS} FROM ledger.deposit_requests \
                      WHERE account_id = $1 ORDER BY created_at DESC"
                ),
                &[&account_id],
            )
            .await
            .map_err(db_error)?;
        rows.iter()
            .map(map_deposit_row)
            .collect::<Result<Vec<_>, _>>()
            .map_err(LedgerStoreError::Db)
    }

    async fn resolve_deposit(
        &self,
        deposit_id: &str,
        decision: RequestDecision,
        now: DateTime<Utc>,
    ) -> Result<Resolution<DepositRequestRow>, LedgerStoreError> {
        let client = self.db.client();
        let mut client = client.lock().await;
        let tx = client.transaction().await.map_err(db_error)?;
        let row = tx
            .query_opt(
                &format!(
                    "SELECT {DEPOSIT_COLUMNS} FROM ledger.deposit_requests \
                      WHERE deposit_id = $1 FOR UPDATE"
                ),
                &[&deposit_id],
            )
            .await
            .map_err(db_error)?
            .ok_or_else(|| LedgerStoreError::NotFound("deposit request".to_string()))?;
        let mut request = map_deposit_row(&row).map_err(LedgerStoreError::Db)?;
        if request.status != RequestStatus::Pending {
            return Err(pending_error("deposit", request.status));
        }

        let mutation = match decision {
            RequestDecision::Approve => Some(
                apply_delta_tx(
                    &tx,
                    &request.account_id,
                    BalanceDelta::credit(request.amount_cents),
                    MutationCause::new(MutationKind::DepositApproved, deposit_id),
                    now,
                )
                .await?,
            ),
            RequestDecision::Reject => None,
        };

        request.status = decision.target_status();
        request.resolved_at = Some(now);
        tx.execute(
            "UPDATE ledger.deposit_requests SET status = $2, resolved_at = $3 WHERE deposit_id = $1",
            &[&deposit_id, &request.status.as_str(), &now],
        )
        .await
        .map_err(db_error)?;
        tx.commit().await.map_err(db_error)?;
        Ok(Resolution { request, mutation })
    }

    async fn insert_withdraw(
        &self,
        withdraw: WithdrawRequestRow,
    ) -> Result<WithdrawRequestRow, LedgerStoreError> {
        let client = self.db.client();
        let client = client.lock().await;
        client
            .execute(
                r#"
                INSERT INTO ledger.withdraw_requests (
                    withdraw_id, account_id, amount_cents, wallet_address, network,
                    invitation_code, status, created_at, resolved_at
                ) VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9)
                "#,
                &[
                    &withdraw.withdraw_id,
                    &withdraw.account_id,
                    &withdraw.amount_cents,
                    &withdraw.wallet_address,
                    &withdraw.network,
                    &withdraw.invitation_code,
                    &withdraw.status.as_str(),
                    &withdraw.created_at,
                    &withdraw.resolved_at,
                ],
            )
            .await
            .map_err(|error| match unique_violation(&error) {
                Some(_) => LedgerStoreError::Conflict("withdraw_id already exists".to_string()),
                None => db_error(error),
            })?;
        Ok(withdraw)
    }

    async fn list_withdrawals(
        &self,
        status: Option<RequestStatus>,
    ) -> Result<Vec<WithdrawRequestRow>, LedgerStoreError> {
        let client = self.db.client();
        let client = client.lock().await;
        let status = status.map(RequestStatus::as_str);
        let rows = client
            .query(
                &format!(
                    "SELECT {WITHDRAW_COLUMNS} FROM ledger.withdraw_requests \
                      WHERE $1::text IS NULL OR status = $1 \
                      ORDER BY created_at DESC"
                ),
                &[&status],
            )
            .await
            .map_err(db_error)?;
        rows.iter()
            .map(map_withdraw_row)
            .collect::<Result<Vec<_>, _>>()
            .map_err(LedgerStoreError::Db)
    }

    async fn list_account_withdrawals(
        &self,
        account_id: &str,
    ) -> Result<Vec<WithdrawRequestRow>, LedgerStoreError> {
        let client = self.db.client();
        let client = client.lock().await;
        let rows = client
            .query(
                &format!(
                    "SELECT {WITHDRAW_COLUMNS} FROM ledger.withdraw_requests \
                      WHERE account_id = $1 ORDER BY created_at DESC"
                ),
                &[&account_id],
            )
            .await
            .map_err(db_error)?;
        rows.iter()
            .map(map_withdraw_row)
            .collect::<Result<Vec<_>, _>>()
            .map_err(LedgerStoreError::Db)
    }

    async fn resolve_withdraw(
        &self,
        withdraw_id: &str,
        decision: RequestDecision,
        now: DateTime<Utc>,
    ) -> Result<Resolution<WithdrawRequestRow>, LedgerStoreError> {
        let client = self.db.client();
        let mut client = client.lock().await;
        let tx = client.transaction().await.map_err(db_error)?;
        let row = tx
            .query_opt(
                &format!(
                    "SELECT {WITHDRAW_COLUMNS} FROM ledger.withdraw_requests \
                      WHERE withdraw_id = $1 FOR UPDATE"
                ),
                &[&withdraw_id],
            )
            .await
            .map_err(db_error)?
            .ok_or_else(|| LedgerStoreError::NotFound("withdraw request".to_string()))?;
        let mut request = map_withdraw_row(&row).map_err(LedgerStoreError::Db)?;
        if request.status != RequestStatus::Pending {
            return Err(pending_error("withdraw", request.status));
        }

        let mutation = match decision {
            RequestDecision::Approve => Some(
                apply_delta_tx(
                    &tx,
                    &request.account_id,
                    BalanceDelta::debit(request.amount_cents),
                    MutationCause::new(MutationKind::WithdrawApproved, withdraw_id),
                    now,
                )
                .await?,
            ),
            RequestDecision::Reject => None,
        };

        request.status = decision.target_status();
        request.resolved_at = Some(now);
        tx.execute(
            "UPDATE ledger.withdraw_requests SET status = $2, resolved_at = $3 WHERE withdraw_id = $1",
            &[&withdraw_id, &request.status.as_str(), &now],
        )
        .await
        .map_err(db_error)?;
        tx.commit().await.map_err(db_error)?;
        Ok(Resolution { request, mutation })
    }

    async fn insert_orders(&self, orders: Vec<NewOrder>) -> Result<Vec<OrderRow>, LedgerStoreError> {
        let client = self.db.client();
        let mut client = client.lock().await;
        let tx = client.transaction().await.map_err(db_error)?;

        let mut counts: Vec<(OrderScopeKey, i64)> = Vec::new();
        for order in &orders {
            let key = order.scope_key();
            match counts.iter_mut().find(|(existing, _)| *existing == key) {
                Some((_, count)) => *count += 1,
                None => counts.push((key, 1)),
            }
        }

        let mut next_index: HashMap<OrderScopeKey, i64> = HashMap::new();
        for (key, count) in counts {
            let row = tx
                .query_one(
                    r#"
                    INSERT INTO ledger.order_sequences (platform, scope_key, last_index)
                    VALUES ($1, $2, $3)
                    ON CONFLICT (platform, scope_key)
                    DO UPDATE SET last_index = ledger.order_sequences.last_index + EXCLUDED.last_index
                    RETURNING last_index
                    "#,
                    &[&key.platform.as_str(), &key.scope, &count],
                )
                .await
                .map_err(db_error)?;
            let last_index: i64 = row.try_get(0).map_err(db_error)?;
            next_index.insert(key, last_index - count + 1);
        }

        let mut inserted = Vec::with_capacity(orders.len());
        for order in orders {
            let key = order.scope_key();
            let index = next_index
                .get_mut(&key)
                .ok_or_else(|| LedgerStoreError::Db("order sequence not allocated".to_string()))?;
            let row = order.into_row(*index);
            *index += 1;
            tx.execute(
                r#"
                INSERT INTO ledger.orders (
                    order_id, platform, order_type, title, amount_cents, commission_cents,
                    total_profit_cents, order_index, image, images, invitation_code, status,
                    completed_by, created_at
                ) VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10,$11,$12,$13,$14)
                "#,
                &[
                    &row.order_id,
                    &row.platform.as_str(),
                    &row.order_type.as_str(),
                    &row.title,
                    &row.amount_cents,
                    &row.commission_cents,
                    &row.total_profit_cents,
                    &row.order_index,
                    &row.image,
                    &row.images,
                    &row.invitation_code,
                    &row.status.as_str(),
                    &row.completed_by,
                    &row.created_at,
                ],
            )
            .await
            .map_err(|error| match unique_violation(&error) {
                Some(_) => LedgerStoreError::Conflict(format!(
                    "order_id {} already exists",
                    row.order_id
                )),
                None => db_error(error),
            })?;
            inserted.push(row);
        }

        tx.commit().await.map_err(db_error)?;
        Ok(inserted)
    }

    async fn list_visible_orders(
        &self,
        platform: OrderPlatform,
        invitation_code: &str,
    ) -> Result<Vec<OrderRow>, LedgerStoreError> {
        let client = self.db.client();
        let client = client.lock().await;
        let rows = client
            .query(
                &format!(
                    "SELECT {ORDER_COLUMNS} FROM ledger.orders \
                      WHERE platform = $1 AND status = 'active' \
                        AND (invitation_code IS NULL OR invitation_code = $2) \
                      ORDER BY order_index, created_at"
                ),
                &[&platform.as_str(), &invitation_code],
            )
            .await
            .map_err(db_error)?;
        rows.iter()
            .map(map_order_row)
            .collect::<Result<Vec<_>, _>>()
            .map_err(LedgerStoreError::Db)
    }

    async fn complete_order(
        &self,
        order_id: &str,
        account_id: &str,
        now: DateTime<Utc>,
    ) -> Result<(OrderRow, BalanceMutation), LedgerStoreError> {
        let client = self.db.client();
        let mut client = client.lock().await;
        let tx = client.transaction().await.map_err(db_error)?;
        let row = tx
            .query_opt(
                &format!("SELECT {ORDER_COLUMNS} FROM ledger.orders WHERE order_id = $1 FOR UPDATE"),
                &[&order_id],
            )
            .await
            .map_err(db_error)?
            .ok_or_else(|| LedgerStoreError::NotFound("order".to_string()))?;
        let mut order = map_order_row(&row).map_err(LedgerStoreError::Db)?;
        if order.status != OrderStatus::Active {
            return Err(LedgerStoreError::InvalidState(
                "order is not active".to_string(),
            ));
        }

        let invitation_code: String = tx
            .query_opt(
                "SELECT invitation_code FROM ledger.accounts WHERE account_id = $1",
                &[&account_id],
            )
            .await
            .map_err(db_error)?
            .ok_or_else(|| LedgerStoreError::NotFound("account".to_string()))?
            .try_get(0)
            .map_err(db_error)?;
        if !order.visible_to(&invitation_code) {
            return Err(LedgerStoreError::Forbidden(
                "order is assigned to another account".to_string(),
            ));
        }

        let mutation = apply_delta_tx(
            &tx,
            account_id,
            BalanceDelta::commission(order.commission_cents),
            MutationCause::new(MutationKind::OrderCompleted, order_id),
            now,
        )
        .await?;
        tx.execute(
            "UPDATE ledger.orders SET status = 'archived', completed_by = $2 WHERE order_id = $1",
            &[&order_id, &account_id],
        )
        .await
        .map_err(db_error)?;
        tx.execute("DELETE FROM ledger.orders WHERE order_id = $1", &[&order_id])
            .await
            .map_err(db_error)?;
        tx.commit().await.map_err(db_error)?;

        order.status = OrderStatus::Archived;
        order.completed_by = Some(account_id.to_string());
        Ok((order, mutation))
    }

    async fn grab_service(
        &self,
        service_order: ServiceOrderRow,
        now: DateTime<Utc>,
    ) -> Result<(ServiceOrderRow, BalanceMutation), LedgerStoreError> {
        let client = self.db.client();
        let mut client = client.lock().await;
        let tx = client.transaction().await.map_err(db_error)?;
        let mutation = apply_delta_tx(
            &tx,
            &service_order.account_id,
            BalanceDelta::service_reservation(service_order.amount_cents),
            MutationCause::new(
                MutationKind::ServiceGrabbed,
                service_order.service_order_id.clone(),
            ),
            now,
        )
        .await?;
        tx.execute(
            r#"
            INSERT INTO ledger.service_orders (
                service_order_id, account_id, service_name, amount_cents, status,
                created_at, completed_at
            ) VALUES ($1,$2,$3,$4,$5,$6,$7)
            "#,
            &[
                &service_order.service_order_id,
                &service_order.account_id,
                &service_order.service_name,
                &service_order.amount_cents,
                &service_order.status.as_str(),
                &service_order.created_at,
                &service_order.completed_at,
            ],
        )
        .await
        .map_err(|error| match unique_violation(&error) {
            Some(_) => LedgerStoreError::Conflict("service_order_id already exists".to_string()),
            None => db_error(error),
        })?;
        tx.commit().await.map_err(db_error)?;
        Ok((service_order, mutation))
    }

    async fn complete_service(
        &self,
        service_order_id: &str,
        account_id: &str,
        now: DateTime<Utc>,
    ) -> Result<(ServiceOrderRow, BalanceMutation), LedgerStoreError> {
        let client = self.db.client();
        let mut client = client.lock().await;
        let tx = client.transaction().await.map_err(db_error)?;
        let row = tx
            .query_opt(
                &format!(
                    "SELECT {SERVICE_ORDER_COLUMNS} FROM ledger.service_orders \
                      WHERE service_order_id = $1 FOR UPDATE"
                ),
                &[&service_order_id],
            )
            .await
            .map_err(db_error)?
            .ok_or_else(|| LedgerStoreError::NotFound("service order".to_string()))?;
        let mut service_order = map_service_order_row(&row).map_err(LedgerStoreError::Db)?;
        if service_order.account_id != account_id {
            return Err(LedgerStoreError::Forbidden(
                "service order belongs to another account".to_string(),
            ));
        }
        if service_order.status != ServiceOrderStatus::Queued {
            return Err(LedgerStoreError::InvalidState(
                "service order is already done".to_string(),
            ));
        }

        let mutation = apply_delta_tx(
            &tx,
            account_id,
            BalanceDelta::service_completion(),
            MutationCause::new(MutationKind::ServiceCompleted, service_order_id),
            now,
        )
        .await?;
        tx.execute(
            "UPDATE ledger.service_orders SET status = 'done', completed_at = $2 \
              WHERE service_order_id = $1",
            &[&service_order_id, &now],
        )
        .await
        .map_err(db_error)?;
        tx.commit().await.map_err(db_error)?;

        service_order.status = ServiceOrderStatus::Done;
        service_order.completed_at = Some(now);
        Ok((service_order, mutation))
    }

    async fn stats(&self) -> Result<LedgerStats, LedgerStoreError> {
        let client = self.db.client();
        let client = client.lock().await;
        let row = client
            .query_one(
                r#"
                SELECT
                    (SELECT COUNT(*) FROM ledger.accounts) AS total_accounts,
                    (SELECT LEAST(COALESCE(SUM(total_balance_cents), 0), 9223372036854775807)::bigint
                       FROM ledger.accounts) AS total_balance_cents,
                    (SELECT LEAST(COALESCE(SUM(amount_cents), 0), 9223372036854775807)::bigint
                       FROM ledger.deposit_requests WHERE status = 'approved')
                        AS approved_deposits_cents,
                    (SELECT LEAST(COALESCE(SUM(amount_cents), 0), 9223372036854775807)::bigint
                       FROM ledger.withdraw_requests WHERE status = 'approved')
                        AS approved_withdrawals_cents,
                    (SELECT COUNT(*) FROM ledger.deposit_requests WHERE status = 'pending')
                        AS pending_deposits,
                    (SELECT COUNT(*) FROM ledger.withdraw_requests WHERE status = 'pending')
                        AS pending_withdrawals
                "#,
                &[],
            )
            .await
            .map_err(db_error)?;
        let count = |name: &str| -> Result<u64, LedgerStoreError> {
            let value: i64 = row.try_get(name).map_err(db_error)?;
            Ok(value.max(0) as u64)
        };
        Ok(LedgerStats {
            total_accounts: count("total_accounts")?,
            total_balance_cents: row.try_get("total_balance_cents").map_err(db_error)?,
            approved_deposits_cents: row.try_get("approved_deposits_cents").map_err(db_error)?,
            approved_withdrawals_cents: row
                .try_get("approved_withdrawals_cents")
                .map_err(db_error)?,
            pending_deposits: count("pending_deposits")?,
            pending_withdrawals: count("pending_withdrawals")?,
        })
    }

    async fn purge_resolved_before(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<PurgeCounts, LedgerStoreError> {
        let client = self.db.client();
        let mut client = client.lock().await;
        let tx = client.transaction().await.map_err(db_error)?;
        let deposits = tx
            .execute(
                "DELETE FROM ledger.deposit_requests \
                  WHERE status IN ('approved', 'rejected') AND created_at < $1",
                &[&cutoff],
            )
            .await
            .map_err(db_error)?;
        let withdrawals = tx
            .execute(
                "DELETE FROM ledger.withdraw_requests \
                  WHERE status IN ('approved', 'rejected') AND created_at < $1",
                &[&cutoff],
            )
            .await
            .map_err(db_error)?;
        tx.commit().await.map_err(db_error)?;
        Ok(PurgeCounts {
            deposits,
            withdrawals,
        })
    }
}

fn escape_like(raw: &str) -> String {
    raw.replace('\\', "\\\\")
        .replace('%', "\\%")
        .replace('_', "\\_")
}

fn parse_column<T>(
    row: &tokio_postgres::Row,
    column: &str,
    parse: impl Fn(&str) -> Option<T>,
) -> Result<T, String> {
    let raw: String = row.try_get(column).map_err(|e| e.to_string())?;
    parse(&raw).ok_or_else(|| format!("invalid {column}: {raw}"))
}

fn map_account_row(row: &tokio_postgres::Row) -> Result<AccountRow, String> {
    let deposit_address: Option<String> = row
        .try_get("deposit_wallet_address")
        .map_err(|e| e.to_string())?;
    let deposit_network: Option<String> = row
        .try_get("deposit_wallet_network")
        .map_err(|e| e.to_string())?;
    Ok(AccountRow {
        account_id: row.try_get("account_id").map_err(|e| e.to_string())?,
        nickname: row.try_get("nickname").map_err(|e| e.to_string())?,
        phone: row.try_get("phone").map_err(|e| e.to_string())?,
        invitation_code: row
            .try_get("invitation_code")
            .map_err(|e| e.to_string())?,
        credential_hash: row
            .try_get("credential_hash")
            .map_err(|e| e.to_string())?,
        total_balance_cents: row
            .try_get("total_balance_cents")
            .map_err(|e| e.to_string())?,
        today_profit_cents: row
            .try_get("today_profit_cents")
            .map_err(|e| e.to_string())?,
        today_profit_day: row
            .try_get("today_profit_day")
            .map_err(|e| e.to_string())?,
        total_orders: row.try_get("total_orders").map_err(|e| e.to_string())?,
        current_orders: row
            .try_get("current_orders")
            .map_err(|e| e.to_string())?,
        wallet: WalletRef {
            platform: row
                .try_get("wallet_platform")
                .map_err(|e| e.to_string())?,
            address: row
                .try_get("wallet_address")
                .map_err(|e| e.to_string())?,
        },
        deposit_wallet: deposit_address.map(|address| DepositWallet {
            address,
            network: deposit_network.unwrap_or_default(),
        }),
        role: parse_column(row, "role", AccountRole::parse)?,
        created_at: row.try_get("created_at").map_err(|e| e.to_string())?,
        updated_at: row.try_get("updated_at").map_err(|e| e.to_string())?,
    })
}

fn map_deposit_row(row: &tokio_postgres::Row) -> Result<DepositRequestRow, String> {
    Ok(DepositRequestRow {
        deposit_id: row.try_get("deposit_id").map_err(|e| e.to_string())?,
        account_id: row.try_get("account_id").map_err(|e| e.to_string())?,
        amount_cents: row.try_get("amount_cents").map_err(|e| e.to_string())?,
        network: row.try_get("network").map_err(|e| e.to_string())?,
        wallet_address: row
            .try_get("wallet_address")
            .map_err(|e| e.to_string())?,
        invitation_code: row
            .try_get("invitation_code")
            .map_err(|e| e.to_string())?,
        status: parse_column(row, "status", RequestStatus::parse)?,
        created_at: row.try_get("created_at").map_err(|e| e.to_string())?,
        resolved_at: row.try_get("resolved_at").map_err(|e| e.to_string())?,
    })
}

fn map_withdraw_row(row: &tokio_postgres::Row) -> Result<WithdrawRequestRow, String> {
    Ok(WithdrawRequestRow {
        withdraw_id: row.try_get("withdraw_id").map_err(|e| e.to_string())?,
        account_id: row.try_get("account_id").map_err(|e| e.to_string())?,
        amount_cents: row.try_get("amount_cents").map_err(|e| e.to_string())?,
        wallet_address: row
            .try_get("wallet_address")
            .map_err(|e| e.to_string())?,
        network: row.try_get("network").map_err(|e| e.to_string())?,
        invitation_code: row
            .try_get("invitation_code")
            .map_err(|e| e.to_string())?,
        status: parse_column(row, "status", RequestStatus::parse)?,
        created_at: row.try_get("created_at").map_err(|e| e.to_string())?,
        resolved_at: row.try_get("resolved_at").map_err(|e| e.to_string())?,
    })
}

fn map_order_row(row: &tokio_postgres::Row) -> Result<OrderRow, String> {
    Ok(OrderRow {
        order_id: row.try_get("order_id").map_err(|e| e.to_string())?,
        platform: parse_column(row, "platform", OrderPlatform::parse)?,
        order_type: parse_column(row, "order_type", OrderType::parse)?,
        title: row.try_get("title").map_err(|e| e.to_string())?,
        amount_cents: row.try_get("amount_cents").map_err(|e| e.to_string())?,
        commission_cents: row
            .try_get("commission_cents")
            .map_err(|e| e.to_string())?,
        total_profit_cents: row
            .try_get("total_profit_cents")
            .map_err(|e| e.to_string())?,
        order_index: row.try_get("order_index").map_err(|e| e.to_string())?,
        image: row.try_get("image").map_err(|e| e.to_string())?,
        images: row.try_get("images").map_err(|e| e.to_string())?,
        invitation_code: row
            .try_get("invitation_code")
            .map_err(|e| e.to_string())?,
        status: parse_column(row, "status", OrderStatus::parse)?,
        completed_by: row.try_get("completed_by").map_err(|e| e.to_string())?,
        created_at: row.try_get("created_at").map_err(|e| e.to_string())?,
    })
}

fn map_service_order_row(row: &tokio_postgres::Row) -> Result<ServiceOrderRow, String> {
    Ok(ServiceOrderRow {
        service_order_id: row
            .try_get("service_order_id")
            .map_err(|e| e.to_string())?,
        account_id: row.try_get("account_id").map_err(|e| e.to_string())?,
        service_name: row.try_get("service_name").map_err(|e| e.to_string())?,
        amount_cents: row.try_get("amount_cents").map_err(|e| e.to_string())?,
        status: parse_column(row, "status", ServiceOrderStatus::parse)?,
        created_at: row.try_get("created_at").map_err(|e| e.to_string())?,
        completed_at: row.try_get("completed_at").map_err(|e| e.to_string())?,
    })
}
