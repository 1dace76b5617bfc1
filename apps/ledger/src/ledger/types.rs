use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

pub const DEFAULT_DEPOSIT_NETWORK: &str = "TRC20";
pub const ORDER_UPLOADS_PATH: &str = "/uploads/orders";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccountRole {
    User,
    Admin,
}

impl AccountRole {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Admin => "admin",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim() {
            "user" => Some(Self::User),
            "admin" => Some(Self::Admin),
            _ => None,
        }
    }

    pub fn is_admin(self) -> bool {
        matches!(self, Self::Admin)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestStatus {
    Pending,
    Approved,
    Rejected,
}

impl RequestStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Approved => "approved",
            Self::Rejected => "rejected",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim() {
            "pending" => Some(Self::Pending),
            "approved" => Some(Self::Approved),
            "rejected" => Some(Self::Rejected),
            _ => None,
        }
    }

    pub fn is_resolved(self) -> bool {
        !matches!(self, Self::Pending)
    }
}

/// Admin decision applied to a pending deposit or withdraw request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestDecision {
    Approve,
    Reject,
}

impl RequestDecision {
    pub fn target_status(self) -> RequestStatus {
        match self {
            Self::Approve => RequestStatus::Approved,
            Self::Reject => RequestStatus::Rejected,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderPlatform {
    Amazon,
    Alibaba,
    Aliexpress,
}

impl OrderPlatform {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Amazon => "amazon",
            Self::Alibaba => "alibaba",
            Self::Aliexpress => "aliexpress",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "amazon" => Some(Self::Amazon),
            "alibaba" => Some(Self::Alibaba),
            "aliexpress" => Some(Self::Aliexpress),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderType {
    Single,
    Combine,
}

impl OrderType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Single => "single",
            Self::Combine => "combine",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "single" => Some(Self::Single),
            "combine" => Some(Self::Combine),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    Active,
    /// Set immediately before the completed order is deleted.
    Archived,
}

impl OrderStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Archived => "archived",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim() {
            "active" => Some(Self::Active),
            "archived" => Some(Self::Archived),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceOrderStatus {
    Queued,
    Done,
}

impl ServiceOrderStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Done => "done",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim() {
            "queued" => Some(Self::Queued),
            "done" => Some(Self::Done),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WalletRef {
    pub platform: String,
    pub address: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DepositWallet {
    pub address: String,
    pub network: String,
}

#[derive(Debug, Clone)]
pub struct AccountRow {
    pub account_id: String,
    pub nickname: String,
    pub phone: String,
    pub invitation_code: String,
    pub credential_hash: String,
    pub total_balance_cents: i64,
    pub today_profit_cents: i64,
    pub today_profit_day: NaiveDate,
    pub total_orders: i64,
    pub current_orders: i64,
    pub wallet: WalletRef,
    pub deposit_wallet: Option<DepositWallet>,
    pub role: AccountRole,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl AccountRow {
    pub fn is_admin(&self) -> bool {
        self.role.is_admin()
    }

    /// Profit accumulated on `today`; zero when the stored day is older.
    pub fn today_profit_on(&self, today: NaiveDate) -> i64 {
        if self.today_profit_day == today {
            self.today_profit_cents
        } else {
            0
        }
    }

    pub fn view(&self, today: NaiveDate) -> AccountView {
        AccountView {
            account_id: self.account_id.clone(),
            nickname: self.nickname.clone(),
            phone: self.phone.clone(),
            invitation_code: self.invitation_code.clone(),
            total_balance_cents: self.total_balance_cents,
            today_profit_cents: self.today_profit_on(today),
            total_orders: self.total_orders,
            current_orders: self.current_orders,
            wallet: self.wallet.clone(),
            deposit_wallet: self.deposit_wallet.clone(),
            role: self.role,
            is_admin: self.is_admin(),
            created_at: self.created_at,
        }
    }
}

/// Account as exposed over the API; never carries the credential hash.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountView {
    pub account_id: String,
    pub nickname: String,
    pub phone: String,
    pub invitation_code: String,
    pub total_balance_cents: i64,
    pub today_profit_cents: i64,
    pub total_orders: i64,
    pub current_orders: i64,
    pub wallet: WalletRef,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deposit_wallet: Option<DepositWallet>,
    pub role: AccountRole,
    pub is_admin: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DepositRequestRow {
    pub deposit_id: String,
    pub account_id: String,
    pub amount_cents: i64,
    pub network: String,
    pub wallet_address: String,
    pub invitation_code: String,
    pub status: RequestStatus,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resolved_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WithdrawRequestRow {
    pub withdraw_id: String,
    pub account_id: String,
    pub amount_cents: i64,
    pub wallet_address: String,
    pub network: String,
    pub invitation_code: String,
    pub status: RequestStatus,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resolved_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderRow {
    pub order_id: String,
    pub platform: OrderPlatform,
    pub order_type: OrderType,
    pub title: String,
    pub amount_cents: i64,
    pub commission_cents: i64,
    pub total_profit_cents: i64,
    pub order_index: i64,
    pub image: String,
    pub images: Vec<String>,
    pub invitation_code: Option<String>,
    pub status: OrderStatus,
    pub completed_by: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl OrderRow {
    pub fn visible_to(&self, invitation_code: &str) -> bool {
        self.status == OrderStatus::Active
            && self
                .invitation_code
                .as_deref()
                .is_none_or(|scope| scope == invitation_code)
    }
}

/// Order fields before the store assigns `order_index`.
#[derive(Debug, Clone)]
pub struct NewOrder {
    pub order_id: String,
    pub platform: OrderPlatform,
    pub order_type: OrderType,
    pub title: String,
    pub amount_cents: i64,
    pub commission_cents: i64,
    pub total_profit_cents: i64,
    pub image: String,
    pub images: Vec<String>,
    pub invitation_code: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl NewOrder {
    pub fn scope_key(&self) -> OrderScopeKey {
        OrderScopeKey::new(self.platform, self.invitation_code.as_deref())
    }

    pub fn into_row(self, order_index: i64) -> OrderRow {
        OrderRow {
            order_id: self.order_id,
            platform: self.platform,
            order_type: self.order_type,
            title: self.title,
            amount_cents: self.amount_cents,
            commission_cents: self.commission_cents,
            total_profit_cents: self.total_profit_cents,
            order_index,
            image: self.image,
            images: self.images,
            invitation_code: self.invitation_code,
            status: OrderStatus::Active,
            completed_by: None,
            created_at: self.created_at,
        }
    }
}

/// Sequencing scope for `order_index`: platform plus invitation code, with the
/// empty string standing for globally visible orders.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct OrderScopeKey {
    pub platform: OrderPlatform,
    pub scope: String,
}

impl OrderScopeKey {
    pub fn new(platform: OrderPlatform, invitation_code: Option<&str>) -> Self {
        Self {
            platform,
            scope: invitation_code.unwrap_or_default().to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceOrderRow {
    pub service_order_id: String,
    pub account_id: String,
    pub service_name: String,
    pub amount_cents: i64,
    pub status: ServiceOrderStatus,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignupRequest {
    pub nickname: String,
    pub phone: String,
    pub password: String,
    pub invitation_code: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoginRequest {
    pub phone: String,
    pub password: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoginResponse {
    pub token: String,
    pub expires_at: DateTime<Utc>,
    pub account: AccountView,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SaveWalletRequest {
    pub address: String,
    pub platform: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DepositRequestBody {
    pub amount_cents: i64,
    #[serde(default)]
    pub network: Option<String>,
    pub wallet_address: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WithdrawRequestBody {
    pub amount_cents: i64,
    pub wallet_address: String,
    pub network: String,
    /// Login password, re-entered to authorise the withdrawal.
    pub password: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateOrderRequest {
    pub platform: String,
    pub title: String,
    pub amount_cents: i64,
    #[serde(default)]
    pub commission_cents: i64,
    #[serde(default)]
    pub total_profit_cents: Option<i64>,
    #[serde(default)]
    pub order_type: Option<String>,
    /// Nickname of the account the order is scoped to; omitted for global orders.
    #[serde(default)]
    pub nickname: Option<String>,
    #[serde(default)]
    pub image: Option<String>,
    #[serde(default)]
    pub images: Vec<String>,
}

/// One parsed row of a bulk order import.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OrderImportRow {
    #[serde(default)]
    pub platform: Option<String>,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub amount_cents: Option<i64>,
    #[serde(default)]
    pub commission_cents: Option<i64>,
    #[serde(default)]
    pub total_profit_cents: Option<i64>,
    #[serde(default)]
    pub order_type: Option<String>,
    #[serde(default)]
    pub image: Option<String>,
    /// Comma separated filenames.
    #[serde(default)]
    pub images: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderImportRequest {
    #[serde(default)]
    pub nickname: Option<String>,
    pub rows: Vec<OrderImportRow>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderImportResponse {
    pub imported: usize,
    pub orders: Vec<OrderRow>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmitOrderRequest {
    pub order_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderCompletion {
    pub order_id: String,
    pub commission_cents: i64,
    pub total_balance_cents: i64,
    pub today_profit_cents: i64,
    pub total_orders: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GrabServiceRequest {
    pub service_name: String,
    pub amount_cents: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceGrab {
    pub service_order: ServiceOrderRow,
    pub total_balance_cents: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdjustBalanceRequest {
    /// Nickname or phone of the target account.
    pub account: String,
    pub delta_cents: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SetDepositWalletRequest {
    /// Nickname or phone of the target account.
    pub account: String,
    pub address: String,
    #[serde(default)]
    pub network: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerStats {
    pub total_accounts: u64,
    pub total_balance_cents: i64,
    pub approved_deposits_cents: i64,
    pub approved_withdrawals_cents: i64,
    pub pending_deposits: u64,
    pub pending_withdrawals: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecordsSummary {
    pub nickname: String,
    pub phone: String,
    pub invitation_code: String,
    pub approved_total_cents: i64,
    pub approved_today_cents: i64,
    pub pending_count: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DepositRecords {
    pub records: Vec<DepositRequestRow>,
    pub summary: RecordsSummary,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WithdrawRecords {
    pub records: Vec<WithdrawRequestRow>,
    pub summary: RecordsSummary,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetentionSummary {
    pub cutoff: DateTime<Utc>,
    pub deposits_deleted: u64,
    pub withdrawals_deleted: u64,
}
