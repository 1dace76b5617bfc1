use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use uuid::Uuid;

use crate::auth::{BcryptCredentialHasher, CredentialHasher, Principal, SessionAuthority};
use crate::ledger::balance::{BalanceDelta, BalanceMutation, MutationCause, MutationKind};
use crate::ledger::events::{LedgerEvent, LedgerObserver, tracing_observer};
use crate::ledger::store::{LedgerStore, LedgerStoreError};
use crate::ledger::types::{
    AccountRole, AccountRow, AccountView, AdjustBalanceRequest, CreateOrderRequest,
    DEFAULT_DEPOSIT_NETWORK, DepositRecords, DepositRequestBody, DepositRequestRow, DepositWallet,
    GrabServiceRequest, LedgerStats, LoginRequest, LoginResponse, NewOrder, ORDER_UPLOADS_PATH,
    OrderCompletion, OrderImportRequest, OrderImportResponse, OrderImportRow, OrderPlatform,
    OrderRow, OrderType, RecordsSummary, RequestDecision, RequestStatus, RetentionSummary,
    SaveWalletRequest, ServiceGrab, ServiceOrderRow, ServiceOrderStatus, SetDepositWalletRequest,
    SignupRequest, SubmitOrderRequest, WalletRef, WithdrawRecords, WithdrawRequestBody,
    WithdrawRequestRow,
};

#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("unauthenticated: {0}")]
    Unauthenticated(String),
    #[error("forbidden: {0}")]
    Forbidden(String),
    #[error("invalid state: {0}")]
    InvalidState(String),
    #[error("insufficient funds: available {available_cents}, required {required_cents}")]
    InsufficientFunds {
        available_cents: i64,
        required_cents: i64,
    },
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("internal error: {0}")]
    Internal(String),
}

impl LedgerError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidRequest(_) => "invalid_request",
            Self::NotFound(_) => "not_found",
            Self::Unauthenticated(_) => "unauthorized",
            Self::Forbidden(_) => "forbidden",
            Self::InvalidState(_) => "invalid_state",
            Self::InsufficientFunds { .. } => "insufficient_funds",
            Self::Conflict(_) => "conflict",
            Self::Internal(_) => "internal_error",
        }
    }

    pub fn message(&self) -> String {
        match self {
            Self::InvalidRequest(message)
            | Self::NotFound(message)
            | Self::Unauthenticated(message)
            | Self::Forbidden(message)
            | Self::InvalidState(message)
            | Self::Conflict(message)
            | Self::Internal(message) => message.clone(),
            Self::InsufficientFunds { .. } => "insufficient balance".to_string(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct LedgerPolicyConfig {
    pub min_deposit_cents: i64,
    pub default_deposit_network: String,
    /// Upper-case network identifiers accepted for withdrawals.
    pub withdraw_networks: Vec<String>,
    pub max_combine_images: usize,
    /// Base for rendered order image URLs, without a trailing slash.
    pub public_base_url: String,
    pub password_hash_cost: u32,
}

impl Default for LedgerPolicyConfig {
    fn default() -> Self {
        Self {
            min_deposit_cents: 2_000,
            default_deposit_network: DEFAULT_DEPOSIT_NETWORK.to_string(),
            withdraw_networks: vec!["BEP20".to_string(), "TRC20".to_string()],
            max_combine_images: 5,
            public_base_url: "http://127.0.0.1:4200".to_string(),
            password_hash_cost: 10,
        }
    }
}

/// Credentials for the administrator account created at startup when absent.
#[derive(Debug, Clone)]
pub struct AdminBootstrap {
    pub nickname: String,
    pub phone: String,
    pub password: String,
    pub invitation_code: String,
}

#[derive(Clone)]
pub struct LedgerService {
    store: Arc<dyn LedgerStore>,
    sessions: SessionAuthority,
    hasher: Arc<dyn CredentialHasher>,
    observer: Arc<dyn LedgerObserver>,
    policy: LedgerPolicyConfig,
}

impl LedgerService {
    pub fn new(store: Arc<dyn LedgerStore>, sessions: SessionAuthority) -> Self {
        Self::new_with_policy(store, sessions, LedgerPolicyConfig::default())
    }

    pub fn new_with_policy(
        store: Arc<dyn LedgerStore>,
        sessions: SessionAuthority,
        policy: LedgerPolicyConfig,
    ) -> Self {
        Self {
            store,
            sessions,
            hasher: Arc::new(BcryptCredentialHasher::new(policy.password_hash_cost)),
            observer: tracing_observer(),
            policy,
        }
    }

    #[must_use]
    pub fn with_observer(mut self, observer: Arc<dyn LedgerObserver>) -> Self {
        self.observer = observer;
        self
    }

    #[must_use]
    pub fn with_credential_hasher(mut self, hasher: Arc<dyn CredentialHasher>) -> Self {
        self.hasher = hasher;
        self
    }

    pub fn sessions(&self) -> &SessionAuthority {
        &self.sessions
    }

    pub fn policy(&self) -> &LedgerPolicyConfig {
        &self.policy
    }

    // Accounts

    pub async fn signup(&self, body: SignupRequest) -> Result<AccountView, LedgerError> {
        let account = self.create_account(body, AccountRole::User).await?;
        Ok(account.view(Utc::now().date_naive()))
    }

    /// Creates the bootstrap administrator unless its phone is already registered.
    pub async fn ensure_admin(&self, bootstrap: AdminBootstrap) -> Result<bool, LedgerError> {
        let phone = required_field("phone", &bootstrap.phone)?;
        if self
            .store
            .find_account_by_phone(&phone)
            .await
            .map_err(map_store_error)?
            .is_some()
        {
            return Ok(false);
        }
        let account = self
            .create_account(
                SignupRequest {
                    nickname: bootstrap.nickname,
                    phone,
                    password: bootstrap.password,
                    invitation_code: bootstrap.invitation_code,
                },
                AccountRole::Admin,
            )
            .await?;
        tracing::info!(account_id = %account.account_id, "bootstrap admin account created");
        Ok(true)
    }

    async fn create_account(
        &self,
        body: SignupRequest,
        role: AccountRole,
    ) -> Result<AccountRow, LedgerError> {
        let nickname = required_field("nickname", &body.nickname)?;
        let phone = required_field("phone", &body.phone)?;
        let invitation_code = required_field("invitation_code", &body.invitation_code)?;
        if body.password.is_empty() {
            return Err(LedgerError::InvalidRequest(
                "password is required".to_string(),
            ));
        }

        let credential_hash = self
            .hasher
            .hash(&body.password)
            .map_err(|error| LedgerError::Internal(error.to_string()))?;
        let now = Utc::now();
        let account = AccountRow {
            account_id: new_id("acct"),
            nickname,
            phone,
            invitation_code,
            credential_hash,
            total_balance_cents: 0,
            today_profit_cents: 0,
            today_profit_day: now.date_naive(),
            total_orders: 0,
            current_orders: 0,
            wallet: WalletRef::default(),
            deposit_wallet: None,
            role,
            created_at: now,
            updated_at: now,
        };
        self.store
            .insert_account(account)
            .await
            .map_err(map_store_error)
    }

    pub async fn login(&self, body: LoginRequest) -> Result<LoginResponse, LedgerError> {
        let phone = body.phone.trim();
        let account = self
            .store
            .find_account_by_phone(phone)
            .await
            .map_err(map_store_error)?
            .filter(|account| self.hasher.verify(&body.password, &account.credential_hash))
            .ok_or_else(|| LedgerError::Unauthenticated("invalid phone or password".to_string()))?;

        let now = Utc::now();
        let session = self
            .sessions
            .issue(&account.account_id, account.role, now)
            .map_err(|error| LedgerError::Internal(error.to_string()))?;
        tracing::info!(account_id = %account.account_id, "ledger session issued");
        Ok(LoginResponse {
            token: session.token,
            expires_at: session.expires_at,
            account: account.view(now.date_naive()),
        })
    }

    pub async fn profile(&self, principal: &Principal) -> Result<AccountView, LedgerError> {
        let account = self.principal_account(principal).await?;
        Ok(account.view(Utc::now().date_naive()))
    }

    pub async fn save_wallet(
        &self,
        principal: &Principal,
        body: SaveWalletRequest,
    ) -> Result<AccountView, LedgerError> {
        let wallet = WalletRef {
            platform: required_field("platform", &body.platform)?,
            address: required_field("address", &body.address)?,
        };
        let now = Utc::now();
        let account = self
            .store
            .update_wallet(&principal.account_id, wallet, now)
            .await
            .map_err(map_store_error)?;
        Ok(account.view(now.date_naive()))
    }

    pub async fn list_accounts(&self, query: Option<&str>) -> Result<Vec<AccountView>, LedgerError> {
        let query = query.map(str::trim).filter(|query| !query.is_empty());
        let today = Utc::now().date_naive();
        Ok(self
            .store
            .list_accounts(query)
            .await
            .map_err(map_store_error)?
            .iter()
            .map(|account| account.view(today))
            .collect())
    }

    pub async fn stats(&self) -> Result<LedgerStats, LedgerError> {
        self.store.stats().await.map_err(map_store_error)
    }

    pub async fn adjust_balance(
        &self,
        body: AdjustBalanceRequest,
    ) -> Result<BalanceMutation, LedgerError> {
        if body.delta_cents == 0 {
            return Err(LedgerError::InvalidRequest(
                "delta_cents must be non-zero".to_string(),
            ));
        }
        let account = self.account_by_nickname_or_phone(&body.account).await?;
        let mutation = self
            .store
            .apply_balance_delta(
                &account.account_id,
                BalanceDelta::adjustment(body.delta_cents),
                MutationCause::new(MutationKind::AdminAdjustment, new_id("adj")),
                Utc::now(),
            )
            .await
            .map_err(map_store_error)?;
        self.observer.notify(&LedgerEvent::BalanceAdjusted {
            mutation: mutation.clone(),
        });
        Ok(mutation)
    }

    pub async fn reset_account(&self, account_id: &str) -> Result<AccountView, LedgerError> {
        let now = Utc::now();
        let mutation = self
            .store
            .reset_account(account_id, &new_id("rst"), now)
            .await
            .map_err(map_store_error)?;
        self.observer.notify(&LedgerEvent::BalanceAdjusted { mutation });
        let account = self.require_account(account_id).await?;
        Ok(account.view(now.date_naive()))
    }

    pub async fn set_deposit_wallet(
        &self,
        body: SetDepositWalletRequest,
    ) -> Result<AccountView, LedgerError> {
        let address = required_field("address", &body.address)?;
        let network = self.deposit_network(body.network.as_deref());
        let account = self.account_by_nickname_or_phone(&body.account).await?;
        let now = Utc::now();
        let account = self
            .store
            .set_deposit_wallet(&account.account_id, DepositWallet { address, network }, now)
            .await
            .map_err(map_store_error)?;
        Ok(account.view(now.date_naive()))
    }

    // Deposits

    pub async fn deposit_address(&self, principal: &Principal) -> Result<DepositWallet, LedgerError> {
        self.principal_account(principal)
            .await?
            .deposit_wallet
            .ok_or_else(|| LedgerError::NotFound("deposit wallet not assigned".to_string()))
    }

    pub async fn request_deposit(
        &self,
        principal: &Principal,
        body: DepositRequestBody,
    ) -> Result<DepositRequestRow, LedgerError> {
        if body.amount_cents < self.policy.min_deposit_cents {
            return Err(LedgerError::InvalidRequest(format!(
                "minimum deposit is {} cents",
                self.policy.min_deposit_cents
            )));
        }
        let wallet_address = required_field("wallet_address", &body.wallet_address)?;
        let account = self.principal_account(principal).await?;

        let deposit = DepositRequestRow {
            deposit_id: new_id("dep"),
            account_id: account.account_id,
            amount_cents: body.amount_cents,
            network: self.deposit_network(body.network.as_deref()),
            wallet_address,
            invitation_code: account.invitation_code,
            status: RequestStatus::Pending,
            created_at: Utc::now(),
            resolved_at: None,
        };
        let deposit = self
            .store
            .insert_deposit(deposit)
            .await
            .map_err(map_store_error)?;
        tracing::info!(
            deposit_id = %deposit.deposit_id,
            account_id = %deposit.account_id,
            amount_cents = deposit.amount_cents,
            "deposit requested"
        );
        Ok(deposit)
    }

    pub async fn approve_deposit(&self, deposit_id: &str) -> Result<DepositRequestRow, LedgerError> {
        self.resolve_deposit(deposit_id, RequestDecision::Approve)
            .await
    }

    pub async fn reject_deposit(&self, deposit_id: &str) -> Result<DepositRequestRow, LedgerError> {
        self.resolve_deposit(deposit_id, RequestDecision::Reject)
            .await
    }

    async fn resolve_deposit(
        &self,
        deposit_id: &str,
        decision: RequestDecision,
    ) -> Result<DepositRequestRow, LedgerError> {
        let resolution = self
            .store
            .resolve_deposit(deposit_id, decision, Utc::now())
            .await
            .map_err(|error| {
                tracing::warn!(deposit_id, reason = %error, "deposit resolution rejected");
                map_store_error(error)
            })?;
        let request = resolution.request;
        let event = match resolution.mutation {
            Some(mutation) => LedgerEvent::DepositApproved {
                deposit_id: request.deposit_id.clone(),
                mutation,
            },
            None => LedgerEvent::DepositRejected {
                deposit_id: request.deposit_id.clone(),
                account_id: request.account_id.clone(),
            },
        };
        self.observer.notify(&event);
        Ok(request)
    }

    pub async fn list_deposits(
        &self,
        status: Option<RequestStatus>,
    ) -> Result<Vec<DepositRequestRow>, LedgerError> {
        self.store
            .list_deposits(status)
            .await
            .map_err(map_store_error)
    }

    pub async fn deposit_history(&self) -> Result<Vec<DepositRequestRow>, LedgerError> {
        Ok(self
            .list_deposits(None)
            .await?
            .into_iter()
            .filter(|row| row.status.is_resolved())
            .collect())
    }

    pub async fn deposit_records(
        &self,
        principal: &Principal,
        invitation_code: &str,
    ) -> Result<DepositRecords, LedgerError> {
        let account = self.records_account(principal, invitation_code).await?;
        let records = self
            .store
            .list_account_deposits(&account.account_id)
            .await
            .map_err(map_store_error)?;
        let summary = summarize_records(
            &account,
            records
                .iter()
                .map(|row| (row.status, row.amount_cents, row.created_at)),
        );
        Ok(DepositRecords { records, summary })
    }

    // Withdrawals

    pub async fn request_withdraw(
        &self,
        principal: &Principal,
        body: WithdrawRequestBody,
    ) -> Result<WithdrawRequestRow, LedgerError> {
        if body.amount_cents <= 0 {
            return Err(LedgerError::InvalidRequest(
                "amount_cents must be positive".to_string(),
            ));
        }
        let wallet_address = required_field("wallet_address", &body.wallet_address)?;
        let network = body.network.trim().to_ascii_uppercase();
        if !self.policy.withdraw_networks.contains(&network) {
            return Err(LedgerError::InvalidRequest(format!(
                "network must be one of {}",
                self.policy.withdraw_networks.join(", ")
            )));
        }

        let account = self.principal_account(principal).await?;
        if !self
            .hasher
            .verify(&body.password, &account.credential_hash)
        {
            return Err(LedgerError::Forbidden("invalid credential".to_string()));
        }
        if account.total_balance_cents < body.amount_cents {
            return Err(LedgerError::InsufficientFunds {
                available_cents: account.total_balance_cents,
                required_cents: body.amount_cents,
            });
        }

        let withdraw = WithdrawRequestRow {
            withdraw_id: new_id("wdr"),
            account_id: account.account_id,
            amount_cents: body.amount_cents,
            wallet_address,
            network,
            invitation_code: account.invitation_code,
            status: RequestStatus::Pending,
            created_at: Utc::now(),
            resolved_at: None,
        };
        let withdraw = self
            .store
            .insert_withdraw(withdraw)
            .await
            .map_err(map_store_error)?;
        tracing::info!(
            withdraw_id = %withdraw.withdraw_id,
            account_id = %withdraw.account_id,
            amount_cents = withdraw.amount_cents,
            "withdraw requested"
        );
        Ok(withdraw)
    }

    pub async fn approve_withdraw(
        &self,
        withdraw_id: &str,
    ) -> Result<WithdrawRequestRow, LedgerError> {
        self.resolve_withdraw(withdraw_id, RequestDecision::Approve)
            .await
    }

    pub async fn reject_withdraw(
        &self,
        withdraw_id: &str,
    ) -> Result<WithdrawRequestRow, LedgerError> {
        self.resolve_withdraw(withdraw_id, RequestDecision::Reject)
            .await
    }

    async fn resolve_withdraw(
        &self,
        withdraw_id: &str,
        decision: RequestDecision,
    ) -> Result<WithdrawRequestRow, LedgerError> {
        let resolution = self
            .store
            .resolve_withdraw(withdraw_id, decision, Utc::now())
            .await
            .map_err(|error| {
                tracing::warn!(withdraw_id, reason = %error, "withdraw resolution rejected");
                map_store_error(error)
            })?;
        let request = resolution.request;
        let event = match resolution.mutation {
            Some(mutation) => LedgerEvent::WithdrawApproved {
                withdraw_id: request.withdraw_id.clone(),
                mutation,
            },
            None => LedgerEvent::WithdrawRejected {
                withdraw_id: request.withdraw_id.clone(),
                account_id: request.account_id.clone(),
            },
        };
        self.observer.notify(&event);
        Ok(request)
    }

    pub async fn list_withdrawals(
        &self,
        status: Option<RequestStatus>,
    ) -> Result<Vec<WithdrawRequestRow>, LedgerError> {
        self.store
            .list_withdrawals(status)
            .await
            .map_err(map_store_error)
    }

    pub async fn withdraw_history(&self) -> Result<Vec<WithdrawRequestRow>, LedgerError> {
        Ok(self
            .list_withdrawals(None)
            .await?
            .into_iter()
            .filter(|row| row.status.is_resolved())
            .collect())
    }

    pub async fn withdraw_records(
        &self,
        principal: &Principal,
        invitation_code: &str,
    ) -> Result<WithdrawRecords, LedgerError> {
        let account = self.records_account(principal, invitation_code).await?;
        let records = self
            .store
            .list_account_withdrawals(&account.account_id)
            .await
            .map_err(map_store_error)?;
        let summary = summarize_records(
            &account,
            records
                .iter()
                .map(|row| (row.status, row.amount_cents, row.created_at)),
        );
        Ok(WithdrawRecords { records, summary })
    }

    // Orders

    pub async fn create_order(&self, body: CreateOrderRequest) -> Result<OrderRow, LedgerError> {
        let scope = self.order_scope(body.nickname.as_deref()).await?;
        let now = Utc::now();
        let order = self.validate_order(
            OrderFields {
                platform: Some(body.platform.as_str()),
                title: Some(body.title.as_str()),
                amount_cents: Some(body.amount_cents),
                commission_cents: Some(body.commission_cents),
                total_profit_cents: body.total_profit_cents,
                order_type: body.order_type.as_deref(),
                image: body.image.as_deref(),
                images: body.images,
            },
            scope,
            now,
        )?;
        let mut inserted = self
            .store
            .insert_orders(vec![order])
            .await
            .map_err(map_store_error)?;
        let order = inserted
            .pop()
            .ok_or_else(|| LedgerError::Internal("order insert returned no row".to_string()))?;
        tracing::info!(
            order_id = %order.order_id,
            platform = order.platform.as_str(),
            order_index = order.order_index,
            "order created"
        );
        Ok(self.render_order(order))
    }

    pub async fn import_orders(
        &self,
        body: OrderImportRequest,
    ) -> Result<OrderImportResponse, LedgerError> {
        let Some(first) = body.rows.first() else {
            return Err(LedgerError::InvalidRequest(
                "import contains no rows".to_string(),
            ));
        };
        if first
            .platform
            .as_deref()
            .is_none_or(|platform| platform.trim().is_empty())
        {
            return Err(LedgerError::InvalidRequest(
                "platform missing in first import row".to_string(),
            ));
        }

        let scope = self.order_scope(body.nickname.as_deref()).await?;
        let now = Utc::now();
        let mut orders = Vec::with_capacity(body.rows.len());
        for (position, row) in body.rows.iter().enumerate() {
            let order = self
                .validate_order(import_fields(row), scope.clone(), now)
                .map_err(|error| match error {
                    LedgerError::InvalidRequest(message) => {
                        LedgerError::InvalidRequest(format!("row {}: {message}", position + 1))
                    }
                    other => other,
                })?;
            orders.push(order);
        }

        let inserted = self
            .store
            .insert_orders(orders)
            .await
            .map_err(map_store_error)?;
        tracing::info!(imported = inserted.len(), "orders imported");
        Ok(OrderImportResponse {
            imported: inserted.len(),
            orders: inserted
                .into_iter()
                .map(|order| self.render_order(order))
                .collect(),
        })
    }

    pub async fn list_orders(
        &self,
        principal: &Principal,
        platform: &str,
    ) -> Result<Vec<OrderRow>, LedgerError> {
        let platform = parse_platform(platform)?;
        let account = self.principal_account(principal).await?;
        Ok(self
            .store
            .list_visible_orders(platform, &account.invitation_code)
            .await
            .map_err(map_store_error)?
            .into_iter()
            .map(|order| self.render_order(order))
            .collect())
    }

    pub async fn submit_order(
        &self,
        principal: &Principal,
        body: SubmitOrderRequest,
    ) -> Result<OrderCompletion, LedgerError> {
        let order_id = required_field("order_id", &body.order_id)?;
        let (order, mutation) = self
            .store
            .complete_order(&order_id, &principal.account_id, Utc::now())
            .await
            .map_err(map_store_error)?;
        self.observer.notify(&LedgerEvent::OrderCompleted {
            order_id: order.order_id.clone(),
            mutation: mutation.clone(),
        });
        Ok(OrderCompletion {
            order_id: order.order_id,
            commission_cents: order.commission_cents,
            total_balance_cents: mutation.total_balance_cents,
            today_profit_cents: mutation.today_profit_cents,
            total_orders: mutation.total_orders,
        })
    }

    // Services

    pub async fn grab_service(
        &self,
        principal: &Principal,
        body: GrabServiceRequest,
    ) -> Result<ServiceGrab, LedgerError> {
        let service_name = required_field("service_name", &body.service_name)?;
        if body.amount_cents <= 0 {
            return Err(LedgerError::InvalidRequest(
                "amount_cents must be positive".to_string(),
            ));
        }
        let service_order = ServiceOrderRow {
            service_order_id: new_id("svc"),
            account_id: principal.account_id.clone(),
            service_name,
            amount_cents: body.amount_cents,
            status: ServiceOrderStatus::Queued,
            created_at: Utc::now(),
            completed_at: None,
        };
        let (service_order, mutation) = self
            .store
            .grab_service(service_order, Utc::now())
            .await
            .map_err(map_store_error)?;
        self.observer.notify(&LedgerEvent::ServiceGrabbed {
            service_order_id: service_order.service_order_id.clone(),
            mutation: mutation.clone(),
        });
        Ok(ServiceGrab {
            service_order,
            total_balance_cents: mutation.total_balance_cents,
        })
    }

    pub async fn submit_service(
        &self,
        principal: &Principal,
        service_order_id: &str,
    ) -> Result<ServiceOrderRow, LedgerError> {
        let (service_order, mutation) = self
            .store
            .complete_service(service_order_id, &principal.account_id, Utc::now())
            .await
            .map_err(map_store_error)?;
        self.observer.notify(&LedgerEvent::ServiceCompleted {
            service_order_id: service_order.service_order_id.clone(),
            mutation,
        });
        Ok(service_order)
    }

    // Retention

    pub async fn purge_resolved_requests(
        &self,
        retention_days: i64,
        now: DateTime<Utc>,
    ) -> Result<RetentionSummary, LedgerError> {
        let window = Duration::try_days(retention_days.max(1))
            .ok_or_else(|| LedgerError::InvalidRequest("retention window too large".to_string()))?;
        let cutoff = now - window;
        let counts = self
            .store
            .purge_resolved_before(cutoff)
            .await
            .map_err(map_store_error)?;
        Ok(RetentionSummary {
            cutoff,
            deposits_deleted: counts.deposits,
            withdrawals_deleted: counts.withdrawals,
        })
    }

    // Helpers

    async fn require_account(&self, account_id: &str) -> Result<AccountRow, LedgerError> {
        self.store
            .get_account(account_id)
            .await
            .map_err(map_store_error)?
            .ok_or_else(|| LedgerError::NotFound("account".to_string()))
    }

    async fn principal_account(&self, principal: &Principal) -> Result<AccountRow, LedgerError> {
        self.require_account(&principal.account_id).await
    }

    async fn account_by_nickname_or_phone(
        &self,
        identifier: &str,
    ) -> Result<AccountRow, LedgerError> {
        let identifier = required_field("account", identifier)?;
        self.store
            .find_account_by_nickname_or_phone(&identifier)
            .await
            .map_err(map_store_error)?
            .ok_or_else(|| LedgerError::NotFound("account".to_string()))
    }

    async fn records_account(
        &self,
        principal: &Principal,
        invitation_code: &str,
    ) -> Result<AccountRow, LedgerError> {
        let account = self
            .store
            .find_account_by_invitation_code(invitation_code.trim())
            .await
            .map_err(map_store_error)?
            .ok_or_else(|| LedgerError::NotFound("account".to_string()))?;
        if !principal.is_admin() && account.account_id != principal.account_id {
            return Err(LedgerError::Forbidden(
                "records belong to another account".to_string(),
            ));
        }
        Ok(account)
    }

    async fn order_scope(&self, nickname: Option<&str>) -> Result<Option<String>, LedgerError> {
        let Some(nickname) = nickname.map(str::trim).filter(|value| !value.is_empty()) else {
            return Ok(None);
        };
        let account = self
            .store
            .find_account_by_nickname_or_phone(nickname)
            .await
            .map_err(map_store_error)?
            .ok_or_else(|| LedgerError::NotFound(format!("no account with nickname {nickname}")))?;
        Ok(Some(account.invitation_code))
    }

    fn deposit_network(&self, requested: Option<&str>) -> String {
        requested
            .map(|network| network.trim().to_ascii_uppercase())
            .filter(|network| !network.is_empty())
            .unwrap_or_else(|| self.policy.default_deposit_network.clone())
    }

    fn validate_order(
        &self,
        fields: OrderFields<'_>,
        invitation_code: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<NewOrder, LedgerError> {
        let platform = parse_platform(fields.platform.unwrap_or_default())?;
        let title = required_field("title", fields.title.unwrap_or_default())?;
        let amount_cents = fields.amount_cents.unwrap_or_default();
        if amount_cents <= 0 {
            return Err(LedgerError::InvalidRequest(
                "amount_cents must be positive".to_string(),
            ));
        }
        let commission_cents = fields.commission_cents.unwrap_or_default();
        if commission_cents < 0 {
            return Err(LedgerError::InvalidRequest(
                "commission_cents must not be negative".to_string(),
            ));
        }
        let total_profit_cents = fields.total_profit_cents.unwrap_or(commission_cents);
        if total_profit_cents < 0 {
            return Err(LedgerError::InvalidRequest(
                "total_profit_cents must not be negative".to_string(),
            ));
        }
        let order_type = match fields.order_type.map(str::trim).filter(|raw| !raw.is_empty()) {
            Some(raw) => OrderType::parse(raw).ok_or_else(|| {
                LedgerError::InvalidRequest("order_type must be single or combine".to_string())
            })?,
            None => OrderType::Single,
        };

        let image = fields
            .image
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .map(str::to_string);
        let images = fields
            .images
            .into_iter()
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
            .collect::<Vec<_>>();
        let (image, images) = match order_type {
            OrderType::Single => {
                if images.len() > 1 || (image.is_some() && !images.is_empty()) {
                    return Err(LedgerError::InvalidRequest(
                        "single orders carry at most one image".to_string(),
                    ));
                }
                let image = image.or_else(|| images.into_iter().next());
                (image.unwrap_or_default(), Vec::new())
            }
            OrderType::Combine => {
                if images.is_empty() || images.len() > self.policy.max_combine_images {
                    return Err(LedgerError::InvalidRequest(format!(
                        "combine orders carry between 1 and {} images",
                        self.policy.max_combine_images
                    )));
                }
                (image.unwrap_or_default(), images)
            }
        };

        Ok(NewOrder {
            order_id: new_id("ord"),
            platform,
            order_type,
            title,
            amount_cents,
            commission_cents,
            total_profit_cents,
            image,
            images,
            invitation_code,
            created_at: now,
        })
    }

    fn render_order(&self, mut order: OrderRow) -> OrderRow {
        order.image = self.image_url(&order.image);
        order.images = order
            .images
            .iter()
            .map(|image| self.image_url(image))
            .collect();
        order
    }

    fn image_url(&self, filename: &str) -> String {
        if filename.is_empty() || filename.starts_with("http") {
            return filename.to_string();
        }
        format!(
            "{}{ORDER_UPLOADS_PATH}/{filename}",
            self.policy.public_base_url.trim_end_matches('/')
        )
    }
}

struct OrderFields<'a> {
    platform: Option<&'a str>,
    title: Option<&'a str>,
    amount_cents: Option<i64>,
    commission_cents: Option<i64>,
    total_profit_cents: Option<i64>,
    order_type: Option<&'a str>,
    image: Option<&'a str>,
    images: Vec<String>,
}

fn import_fields(row: &OrderImportRow) -> OrderFields<'_> {
    OrderFields {
        platform: row.platform.as_deref(),
        title: row.title.as_deref(),
        amount_cents: row.amount_cents,
        commission_cents: row.commission_cents,
        total_profit_cents: row.total_profit_cents,
        order_type: row.order_type.as_deref(),
        image: row.image.as_deref(),
        images: row
            .images
            .as_deref()
            .map(|raw| raw.split(',').map(str::to_string).collect())
            .unwrap_or_default(),
    }
}

fn summarize_records(
    account: &AccountRow,
    records: impl Iterator<Item = (RequestStatus, i64, DateTime<Utc>)>,
) -> RecordsSummary {
    let today = Utc::now().date_naive();
    let mut summary = RecordsSummary {
        nickname: account.nickname.clone(),
        phone: account.phone.clone(),
        invitation_code: account.invitation_code.clone(),
        approved_total_cents: 0,
        approved_today_cents: 0,
        pending_count: 0,
    };
    for (status, amount_cents, created_at) in records {
        match status {
            RequestStatus::Approved => {
                summary.approved_total_cents =
                    summary.approved_total_cents.saturating_add(amount_cents);
                if created_at.date_naive() == today {
                    summary.approved_today_cents =
                        summary.approved_today_cents.saturating_add(amount_cents);
                }
            }
            RequestStatus::Pending => summary.pending_count += 1,
            RequestStatus::Rejected => {}
        }
    }
    summary
}

fn parse_platform(raw: &str) -> Result<OrderPlatform, LedgerError> {
    OrderPlatform::parse(raw).ok_or_else(|| {
        LedgerError::InvalidRequest(
            "platform must be one of amazon, alibaba, aliexpress".to_string(),
        )
    })
}

fn required_field(name: &str, value: &str) -> Result<String, LedgerError> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(LedgerError::InvalidRequest(format!("{name} is required")));
    }
    Ok(trimmed.to_string())
}

fn new_id(prefix: &str) -> String {
    format!("{prefix}_{}", Uuid::now_v7().simple())
}

fn map_store_error(error: LedgerStoreError) -> LedgerError {
    match error {
        LedgerStoreError::Conflict(message) => LedgerError::Conflict(message),
        LedgerStoreError::NotFound(message) => LedgerError::NotFound(message),
        LedgerStoreError::InvalidState(message) => LedgerError::InvalidState(message),
        LedgerStoreError::Forbidden(message) => LedgerError::Forbidden(message),
        LedgerStoreError::InsufficientFunds {
            available_cents,
            required_cents,
        } => LedgerError::InsufficientFunds {
            available_cents,
            required_cents,
        },
        LedgerStoreError::Db(message) => {
            tracing::error!(reason = %message, "ledger store failure");
            LedgerError::Internal(message)
        }
    }
}
