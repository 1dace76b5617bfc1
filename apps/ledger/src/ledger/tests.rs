use std::sync::Arc;

use anyhow::{Context, Result, anyhow};
use chrono::{Duration, Utc};

use crate::auth::{Principal, SessionAuthority, SessionConfig};
use crate::ledger::balance::MutationKind;
use crate::ledger::events::{LedgerEvent, recording::RecordingObserver};
use crate::ledger::store::{self, LedgerStore};
use crate::ledger::types::{
    AccountRole, AdjustBalanceRequest, CreateOrderRequest, DepositRequestBody, DepositRequestRow,
    GrabServiceRequest, LoginRequest, OrderImportRequest, OrderImportRow, RequestStatus,
    SetDepositWalletRequest, SignupRequest, SubmitOrderRequest, WithdrawRequestBody,
    WithdrawRequestRow,
};
use crate::ledger::{AdminBootstrap, LedgerError, LedgerPolicyConfig, LedgerService};

const PASSWORD: &str = "correct-horse";

struct Harness {
    service: LedgerService,
    store: Arc<dyn LedgerStore>,
    observer: Arc<RecordingObserver>,
}

fn sessions() -> SessionAuthority {
    SessionAuthority::from_config(SessionConfig {
        signing_key: "ledger-test-key".to_string(),
        fallback_signing_keys: Vec::new(),
        issuer: "https://grabdesk.test".to_string(),
        audience: "grabdesk-ledger".to_string(),
        ttl_seconds: 3600,
        clock_skew_leeway_seconds: 0,
    })
}

fn harness() -> Harness {
    let store = store::memory();
    let observer = Arc::new(RecordingObserver::default());
    let service = LedgerService::new_with_policy(
        store.clone(),
        sessions(),
        LedgerPolicyConfig {
            public_base_url: "https://cdn.grabdesk.test".to_string(),
            password_hash_cost: 4,
            ..LedgerPolicyConfig::default()
        },
    )
    .with_observer(observer.clone());
    Harness {
        service,
        store,
        observer,
    }
}

async fn signup(service: &LedgerService, nickname: &str, code: &str) -> Result<Principal> {
    let account = service
        .signup(SignupRequest {
            nickname: nickname.to_string(),
            phone: format!("phone-{nickname}"),
            password: PASSWORD.to_string(),
            invitation_code: code.to_string(),
        })
        .await
        .context("signup")?;
    Ok(Principal {
        account_id: account.account_id,
        role: AccountRole::User,
    })
}

async fn fund(service: &LedgerService, nickname: &str, cents: i64) -> Result<()> {
    service
        .adjust_balance(AdjustBalanceRequest {
            account: nickname.to_string(),
            delta_cents: cents,
        })
        .await
        .context("fund account")?;
    Ok(())
}

async fn balance(service: &LedgerService, principal: &Principal) -> Result<i64> {
    Ok(service.profile(principal).await?.total_balance_cents)
}

async fn deposit(
    service: &LedgerService,
    principal: &Principal,
    amount_cents: i64,
) -> Result<DepositRequestRow, LedgerError> {
    service
        .request_deposit(
            principal,
            DepositRequestBody {
                amount_cents,
                network: None,
                wallet_address: "TXsender".to_string(),
            },
        )
        .await
}

async fn withdraw(
    service: &LedgerService,
    principal: &Principal,
    amount_cents: i64,
) -> Result<WithdrawRequestRow, LedgerError> {
    service
        .request_withdraw(
            principal,
            WithdrawRequestBody {
                amount_cents,
                wallet_address: "0xdestination".to_string(),
                network: "bep20".to_string(),
                password: PASSWORD.to_string(),
            },
        )
        .await
}

fn order(platform: &str, commission_cents: i64, nickname: Option<&str>) -> CreateOrderRequest {
    CreateOrderRequest {
        platform: platform.to_string(),
        title: "Wireless earbuds".to_string(),
        amount_cents: 4_999,
        commission_cents,
        total_profit_cents: None,
        order_type: None,
        nickname: nickname.map(str::to_string),
        image: Some("earbuds.png".to_string()),
        images: Vec::new(),
    }
}

#[tokio::test]
async fn signup_rejects_duplicate_phone_and_invitation_code() -> Result<()> {
    let h = harness();
    signup(&h.service, "alice", "INV-A").await?;

    let same_code = h
        .service
        .signup(SignupRequest {
            nickname: "bob".to_string(),
            phone: "phone-bob".to_string(),
            password: PASSWORD.to_string(),
            invitation_code: "INV-A".to_string(),
        })
        .await;
    assert!(matches!(same_code, Err(LedgerError::Conflict(_))));

    let same_phone = h
        .service
        .signup(SignupRequest {
            nickname: "carol".to_string(),
            phone: "phone-alice".to_string(),
            password: PASSWORD.to_string(),
            invitation_code: "INV-C".to_string(),
        })
        .await;
    assert!(matches!(same_phone, Err(LedgerError::Conflict(_))));

    let missing = h
        .service
        .signup(SignupRequest {
            nickname: " ".to_string(),
            phone: "phone-dan".to_string(),
            password: PASSWORD.to_string(),
            invitation_code: "INV-D".to_string(),
        })
        .await;
    assert!(matches!(missing, Err(LedgerError::InvalidRequest(_))));
    Ok(())
}

#[tokio::test]
async fn login_issues_session_for_valid_credentials_only() -> Result<()> {
    let h = harness();
    let alice = signup(&h.service, "alice", "INV-A").await?;

    let session = h
        .service
        .login(LoginRequest {
            phone: "phone-alice".to_string(),
            password: PASSWORD.to_string(),
        })
        .await?;
    let principal = h.service.sessions().authenticate(&session.token)?;
    assert_eq!(principal, alice);

    let wrong = h
        .service
        .login(LoginRequest {
            phone: "phone-alice".to_string(),
            password: "nope".to_string(),
        })
        .await;
    assert!(matches!(wrong, Err(LedgerError::Unauthenticated(_))));
    Ok(())
}

#[tokio::test]
async fn minimum_deposit_approval_credits_exactly_once() -> Result<()> {
    let h = harness();
    let alice = signup(&h.service, "alice", "INV-A").await?;

    let too_small = deposit(&h.service, &alice, 1_999).await;
    assert!(matches!(too_small, Err(LedgerError::InvalidRequest(_))));

    let request = deposit(&h.service, &alice, 2_000).await?;
    assert_eq!(request.network, "TRC20");
    assert_eq!(request.invitation_code, "INV-A");
    assert_eq!(request.status, RequestStatus::Pending);

    let approved = h.service.approve_deposit(&request.deposit_id).await?;
    assert_eq!(approved.status, RequestStatus::Approved);
    assert!(approved.resolved_at.is_some());
    assert_eq!(balance(&h.service, &alice).await?, 2_000);

    let pending = h.service.list_deposits(Some(RequestStatus::Pending)).await?;
    assert!(pending.is_empty());
    let history = h.service.deposit_history().await?;
    assert_eq!(history.len(), 1);

    let again = h.service.approve_deposit(&request.deposit_id).await;
    assert!(matches!(again, Err(LedgerError::InvalidState(_))));
    assert_eq!(balance(&h.service, &alice).await?, 2_000);

    let missing = h.service.approve_deposit("dep_missing").await;
    assert!(matches!(missing, Err(LedgerError::NotFound(_))));

    assert_eq!(
        h.observer.names(),
        vec!["deposit_approved"],
        "only the successful approval is published"
    );
    Ok(())
}

#[tokio::test]
async fn rejected_deposit_has_no_balance_effect() -> Result<()> {
    let h = harness();
    let alice = signup(&h.service, "alice", "INV-A").await?;
    let request = deposit(&h.service, &alice, 5_000).await?;

    let rejected = h.service.reject_deposit(&request.deposit_id).await?;
    assert_eq!(rejected.status, RequestStatus::Rejected);
    assert_eq!(balance(&h.service, &alice).await?, 0);

    let approve_after_reject = h.service.approve_deposit(&request.deposit_id).await;
    assert!(matches!(
        approve_after_reject,
        Err(LedgerError::InvalidState(_))
    ));
    Ok(())
}

#[tokio::test]
async fn withdraw_beyond_balance_creates_nothing() -> Result<()> {
    let h = harness();
    let alice = signup(&h.service, "alice", "INV-A").await?;
    fund(&h.service, "alice", 100).await?;

    let result = withdraw(&h.service, &alice, 150).await;
    assert!(matches!(
        result,
        Err(LedgerError::InsufficientFunds {
            available_cents: 100,
            required_cents: 150,
        })
    ));
    assert!(h.service.list_withdrawals(None).await?.is_empty());
    Ok(())
}

#[tokio::test]
async fn second_pending_withdraw_fails_at_approval_time() -> Result<()> {
    let h = harness();
    let alice = signup(&h.service, "alice", "INV-A").await?;
    fund(&h.service, "alice", 100).await?;

    let first = withdraw(&h.service, &alice, 80).await?;
    let second = withdraw(&h.service, &alice, 50).await?;

    let approved = h.service.approve_withdraw(&first.withdraw_id).await?;
    assert_eq!(approved.status, RequestStatus::Approved);
    assert_eq!(balance(&h.service, &alice).await?, 20);

    let result = h.service.approve_withdraw(&second.withdraw_id).await;
    assert!(matches!(
        result,
        Err(LedgerError::InsufficientFunds {
            available_cents: 20,
            required_cents: 50,
        })
    ));
    assert_eq!(balance(&h.service, &alice).await?, 20);

    let pending = h
        .service
        .list_withdrawals(Some(RequestStatus::Pending))
        .await?;
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].withdraw_id, second.withdraw_id);

    let again = h.service.approve_withdraw(&first.withdraw_id).await;
    assert!(matches!(again, Err(LedgerError::InvalidState(_))));
    assert_eq!(balance(&h.service, &alice).await?, 20);
    Ok(())
}

#[tokio::test]
async fn withdraw_requires_credential_and_known_network() -> Result<()> {
    let h = harness();
    let alice = signup(&h.service, "alice", "INV-A").await?;
    fund(&h.service, "alice", 1_000).await?;

    let bad_password = h
        .service
        .request_withdraw(
            &alice,
            WithdrawRequestBody {
                amount_cents: 100,
                wallet_address: "0xdestination".to_string(),
                network: "TRC20".to_string(),
                password: "wrong".to_string(),
            },
        )
        .await;
    assert!(matches!(bad_password, Err(LedgerError::Forbidden(_))));

    let bad_network = h
        .service
        .request_withdraw(
            &alice,
            WithdrawRequestBody {
                amount_cents: 100,
                wallet_address: "0xdestination".to_string(),
                network: "ERC20".to_string(),
                password: PASSWORD.to_string(),
            },
        )
        .await;
    assert!(matches!(bad_network, Err(LedgerError::InvalidRequest(_))));

    let created = withdraw(&h.service, &alice, 100).await?;
    assert_eq!(created.network, "BEP20");
    Ok(())
}

#[tokio::test]
async fn concurrent_withdraw_approvals_never_overdraw() -> Result<()> {
    let h = harness();
    let alice = signup(&h.service, "alice", "INV-A").await?;
    fund(&h.service, "alice", 100).await?;

    let mut ids = Vec::new();
    for _ in 0..5 {
        ids.push(withdraw(&h.service, &alice, 40).await?.withdraw_id);
    }

    let results = futures::future::join_all(ids.iter().map(|id| {
        let service = h.service.clone();
        let id = id.clone();
        async move { service.approve_withdraw(&id).await }
    }))
    .await;

    let approved = results.iter().filter(|result| result.is_ok()).count();
    assert_eq!(approved, 2);
    assert!(results.iter().all(|result| matches!(
        result,
        Ok(_) | Err(LedgerError::InsufficientFunds { .. })
    )));
    assert_eq!(balance(&h.service, &alice).await?, 20);
    Ok(())
}

#[tokio::test]
async fn order_submission_credits_commission_and_removes_order() -> Result<()> {
    let h = harness();
    let alice = signup(&h.service, "alice", "INV-A").await?;

    let created = h
        .service
        .create_order(order("amazon", 5, Some("alice")))
        .await?;
    assert_eq!(created.order_index, 1);
    assert_eq!(created.invitation_code.as_deref(), Some("INV-A"));
    assert_eq!(created.total_profit_cents, 5);
    assert_eq!(
        created.image,
        "https://cdn.grabdesk.test/uploads/orders/earbuds.png"
    );

    let listed = h.service.list_orders(&alice, "amazon").await?;
    assert_eq!(listed.len(), 1);

    let completion = h
        .service
        .submit_order(
            &alice,
            SubmitOrderRequest {
                order_id: created.order_id.clone(),
            },
        )
        .await?;
    assert_eq!(completion.total_balance_cents, 5);
    assert_eq!(completion.today_profit_cents, 5);
    assert_eq!(completion.total_orders, 1);

    let profile = h.service.profile(&alice).await?;
    assert_eq!(profile.total_balance_cents, 5);
    assert_eq!(profile.today_profit_cents, 5);
    assert_eq!(profile.total_orders, 1);
    assert!(h.service.list_orders(&alice, "amazon").await?.is_empty());

    let resubmit = h
        .service
        .submit_order(
            &alice,
            SubmitOrderRequest {
                order_id: created.order_id,
            },
        )
        .await;
    assert!(matches!(resubmit, Err(LedgerError::NotFound(_))));
    assert_eq!(h.observer.names().last().copied(), Some("order_completed"));
    Ok(())
}

#[tokio::test]
async fn order_scoped_to_other_code_is_forbidden_without_state_change() -> Result<()> {
    let h = harness();
    signup(&h.service, "xavier", "X1").await?;
    let yolanda = signup(&h.service, "yolanda", "X2").await?;

    let created = h
        .service
        .create_order(order("alibaba", 5, Some("xavier")))
        .await?;
    assert!(h.service.list_orders(&yolanda, "alibaba").await?.is_empty());

    let result = h
        .service
        .submit_order(
            &yolanda,
            SubmitOrderRequest {
                order_id: created.order_id,
            },
        )
        .await;
    assert!(matches!(result, Err(LedgerError::Forbidden(_))));

    let profile = h.service.profile(&yolanda).await?;
    assert_eq!(profile.total_balance_cents, 0);
    assert_eq!(profile.total_orders, 0);

    let xavier = h
        .store
        .find_account_by_invitation_code("X1")
        .await?
        .ok_or_else(|| anyhow!("xavier should exist"))?;
    let principal = Principal {
        account_id: xavier.account_id,
        role: AccountRole::User,
    };
    assert_eq!(h.service.list_orders(&principal, "alibaba").await?.len(), 1);
    Ok(())
}

#[tokio::test]
async fn global_orders_are_visible_and_submittable_by_anyone() -> Result<()> {
    let h = harness();
    let alice = signup(&h.service, "alice", "INV-A").await?;
    let bob = signup(&h.service, "bob", "INV-B").await?;

    let global = h.service.create_order(order("aliexpress", 7, None)).await?;
    assert!(global.invitation_code.is_none());
    assert_eq!(h.service.list_orders(&alice, "aliexpress").await?.len(), 1);
    assert_eq!(h.service.list_orders(&bob, "aliexpress").await?.len(), 1);

    h.service
        .submit_order(
            &bob,
            SubmitOrderRequest {
                order_id: global.order_id,
            },
        )
        .await?;
    assert_eq!(balance(&h.service, &bob).await?, 7);
    assert!(h.service.list_orders(&alice, "aliexpress").await?.is_empty());
    Ok(())
}

#[tokio::test]
async fn order_indices_are_sequential_per_scope() -> Result<()> {
    let h = harness();
    signup(&h.service, "alice", "INV-A").await?;
    signup(&h.service, "bob", "INV-B").await?;

    let a1 = h.service.create_order(order("amazon", 1, Some("alice"))).await?;
    let a2 = h.service.create_order(order("amazon", 1, Some("alice"))).await?;
    let b1 = h.service.create_order(order("amazon", 1, Some("bob"))).await?;
    let a_other_platform = h
        .service
        .create_order(order("alibaba", 1, Some("alice")))
        .await?;
    assert_eq!(
        (a1.order_index, a2.order_index, b1.order_index, a_other_platform.order_index),
        (1, 2, 1, 1)
    );
    Ok(())
}

#[tokio::test]
async fn concurrent_order_creation_never_duplicates_indices() -> Result<()> {
    let h = harness();
    signup(&h.service, "alice", "INV-A").await?;

    let results = futures::future::join_all((0..20).map(|_| {
        let service = h.service.clone();
        async move { service.create_order(order("amazon", 1, Some("alice"))).await }
    }))
    .await;

    let mut indices = results
        .into_iter()
        .map(|result| result.map(|order| order.order_index))
        .collect::<Result<Vec<_>, _>>()?;
    indices.sort_unstable();
    assert_eq!(indices, (1..=20).collect::<Vec<i64>>());
    Ok(())
}

#[tokio::test]
async fn order_validation_enforces_image_rules() -> Result<()> {
    let h = harness();

    let mut combine = order("amazon", 1, None);
    combine.order_type = Some("combine".to_string());
    combine.image = None;
    let empty_combine = h.service.create_order(combine.clone()).await;
    assert!(matches!(empty_combine, Err(LedgerError::InvalidRequest(_))));

    combine.images = (0..6).map(|i| format!("img-{i}.png")).collect();
    let too_many = h.service.create_order(combine.clone()).await;
    assert!(matches!(too_many, Err(LedgerError::InvalidRequest(_))));

    combine.images.truncate(5);
    let created = h.service.create_order(combine).await?;
    assert_eq!(created.images.len(), 5);

    let mut single = order("amazon", 1, None);
    single.images = vec!["a.png".to_string(), "b.png".to_string()];
    single.image = None;
    let two_images = h.service.create_order(single).await;
    assert!(matches!(two_images, Err(LedgerError::InvalidRequest(_))));

    let unknown_platform = h.service.create_order(order("ebay", 1, None)).await;
    assert!(matches!(
        unknown_platform,
        Err(LedgerError::InvalidRequest(_))
    ));

    let unknown_nickname = h
        .service
        .create_order(order("amazon", 1, Some("nobody")))
        .await;
    assert!(matches!(unknown_nickname, Err(LedgerError::NotFound(_))));
    Ok(())
}

#[tokio::test]
async fn import_is_all_or_nothing_with_consecutive_indices() -> Result<()> {
    let h = harness();
    let alice = signup(&h.service, "alice", "INV-A").await?;
    h.service
        .create_order(order("amazon", 1, Some("alice")))
        .await?;

    let row = |title: &str| OrderImportRow {
        platform: Some("amazon".to_string()),
        title: Some(title.to_string()),
        amount_cents: Some(1_000),
        commission_cents: Some(30),
        images: Some("a.png, b.png".to_string()),
        order_type: Some("combine".to_string()),
        ..OrderImportRow::default()
    };

    let mut broken = vec![row("first"), row("second")];
    broken[1].amount_cents = Some(0);
    let rejected = h
        .service
        .import_orders(OrderImportRequest {
            nickname: Some("alice".to_string()),
            rows: broken,
        })
        .await;
    assert!(matches!(rejected, Err(LedgerError::InvalidRequest(_))));
    assert_eq!(h.service.list_orders(&alice, "amazon").await?.len(), 1);

    let imported = h
        .service
        .import_orders(OrderImportRequest {
            nickname: Some("alice".to_string()),
            rows: vec![row("first"), row("second"), row("third")],
        })
        .await?;
    assert_eq!(imported.imported, 3);
    let indices = imported
        .orders
        .iter()
        .map(|order| order.order_index)
        .collect::<Vec<_>>();
    assert_eq!(indices, vec![2, 3, 4]);
    assert_eq!(imported.orders[0].images.len(), 2);
    assert_eq!(imported.orders[0].total_profit_cents, 30);

    let listed = h.service.list_orders(&alice, "amazon").await?;
    assert_eq!(
        listed.iter().map(|o| o.order_index).collect::<Vec<_>>(),
        vec![1, 2, 3, 4]
    );

    let empty = h
        .service
        .import_orders(OrderImportRequest {
            nickname: None,
            rows: Vec::new(),
        })
        .await;
    assert!(matches!(empty, Err(LedgerError::InvalidRequest(_))));

    let no_platform = h
        .service
        .import_orders(OrderImportRequest {
            nickname: None,
            rows: vec![OrderImportRow {
                platform: None,
                ..row("x")
            }],
        })
        .await;
    assert!(matches!(no_platform, Err(LedgerError::InvalidRequest(_))));
    Ok(())
}

#[tokio::test]
async fn service_grab_and_submit_share_the_balance_engine() -> Result<()> {
    let h = harness();
    let alice = signup(&h.service, "alice", "INV-A").await?;
    let bob = signup(&h.service, "bob", "INV-B").await?;
    fund(&h.service, "alice", 300).await?;

    let too_much = h
        .service
        .grab_service(
            &alice,
            GrabServiceRequest {
                service_name: "review".to_string(),
                amount_cents: 500,
            },
        )
        .await;
    assert!(matches!(
        too_much,
        Err(LedgerError::InsufficientFunds { .. })
    ));
    assert_eq!(h.service.profile(&alice).await?.current_orders, 0);

    let grab = h
        .service
        .grab_service(
            &alice,
            GrabServiceRequest {
                service_name: "review".to_string(),
                amount_cents: 200,
            },
        )
        .await?;
    assert_eq!(grab.total_balance_cents, 100);
    assert_eq!(h.service.profile(&alice).await?.current_orders, 1);

    let id = grab.service_order.service_order_id.clone();
    let stranger = h.service.submit_service(&bob, &id).await;
    assert!(matches!(stranger, Err(LedgerError::Forbidden(_))));

    let done = h.service.submit_service(&alice, &id).await?;
    assert!(done.completed_at.is_some());
    let profile = h.service.profile(&alice).await?;
    assert_eq!(profile.current_orders, 0);
    assert_eq!(profile.total_balance_cents, 100);

    let twice = h.service.submit_service(&alice, &id).await;
    assert!(matches!(twice, Err(LedgerError::InvalidState(_))));
    Ok(())
}

#[tokio::test]
async fn admin_operations_adjust_reset_and_report() -> Result<()> {
    let h = harness();
    let alice = signup(&h.service, "alice", "INV-A").await?;
    signup(&h.service, "bob", "INV-B").await?;

    let mutation = h
        .service
        .adjust_balance(AdjustBalanceRequest {
            account: "phone-alice".to_string(),
            delta_cents: 10_000,
        })
        .await?;
    assert_eq!(mutation.total_balance_cents, 10_000);

    let overdraw = h
        .service
        .adjust_balance(AdjustBalanceRequest {
            account: "alice".to_string(),
            delta_cents: -20_000,
        })
        .await;
    assert!(matches!(overdraw, Err(LedgerError::InsufficientFunds { .. })));

    let dep = deposit(&h.service, &alice, 3_000).await?;
    h.service.approve_deposit(&dep.deposit_id).await?;
    withdraw(&h.service, &alice, 1_000).await?;

    let stats = h.service.stats().await?;
    assert_eq!(stats.total_accounts, 2);
    assert_eq!(stats.total_balance_cents, 13_000);
    assert_eq!(stats.approved_deposits_cents, 3_000);
    assert_eq!(stats.approved_withdrawals_cents, 0);
    assert_eq!(stats.pending_deposits, 0);
    assert_eq!(stats.pending_withdrawals, 1);

    let found = h.service.list_accounts(Some("inv-b")).await?;
    assert_eq!(found.len(), 1);
    assert_eq!(found[0].nickname, "bob");
    assert_eq!(h.service.list_accounts(None).await?.len(), 2);

    h.service
        .create_order(order("amazon", 50, Some("alice")))
        .await?;
    let listed = h.service.list_orders(&alice, "amazon").await?;
    h.service
        .submit_order(
            &alice,
            SubmitOrderRequest {
                order_id: listed[0].order_id.clone(),
            },
        )
        .await?;

    let reset = h.service.reset_account(&alice.account_id).await?;
    assert_eq!(reset.total_balance_cents, 0);
    assert_eq!(reset.today_profit_cents, 0);
    assert_eq!(reset.total_orders, 0);
    Ok(())
}

#[tokio::test]
async fn deposit_wallet_assignment_and_records() -> Result<()> {
    let h = harness();
    let alice = signup(&h.service, "alice", "INV-A").await?;
    let bob = signup(&h.service, "bob", "INV-B").await?;

    let unassigned = h.service.deposit_address(&alice).await;
    assert!(matches!(unassigned, Err(LedgerError::NotFound(_))));

    h.service
        .set_deposit_wallet(SetDepositWalletRequest {
            account: "alice".to_string(),
            address: "TWalletForAlice".to_string(),
            network: None,
        })
        .await?;
    let wallet = h.service.deposit_address(&alice).await?;
    assert_eq!(wallet.address, "TWalletForAlice");
    assert_eq!(wallet.network, "TRC20");

    let approved = deposit(&h.service, &alice, 2_500).await?;
    h.service.approve_deposit(&approved.deposit_id).await?;
    deposit(&h.service, &alice, 4_000).await?;

    let records = h.service.deposit_records(&alice, "INV-A").await?;
    assert_eq!(records.records.len(), 2);
    assert_eq!(records.summary.approved_total_cents, 2_500);
    assert_eq!(records.summary.approved_today_cents, 2_500);
    assert_eq!(records.summary.pending_count, 1);

    let foreign = h.service.deposit_records(&bob, "INV-A").await;
    assert!(matches!(foreign, Err(LedgerError::Forbidden(_))));

    let admin = Principal {
        account_id: "acct_admin".to_string(),
        role: AccountRole::Admin,
    };
    assert!(h.service.withdraw_records(&admin, "INV-A").await.is_ok());
    Ok(())
}

#[tokio::test]
async fn retention_purges_only_old_resolved_requests() -> Result<()> {
    let h = harness();
    let alice = signup(&h.service, "alice", "INV-A").await?;
    let resolved = deposit(&h.service, &alice, 2_000).await?;
    h.service.reject_deposit(&resolved.deposit_id).await?;
    deposit(&h.service, &alice, 2_000).await?;

    let now = Utc::now();
    let fresh = h.service.purge_resolved_requests(30, now).await?;
    assert_eq!(fresh.deposits_deleted, 0);

    let later = now + Duration::days(31);
    let summary = h.service.purge_resolved_requests(30, later).await?;
    assert_eq!(summary.deposits_deleted, 1);
    assert_eq!(summary.withdrawals_deleted, 0);

    let remaining = h.service.list_deposits(None).await?;
    assert_eq!(remaining.len(), 1);
    assert_eq!(remaining[0].status, RequestStatus::Pending);
    Ok(())
}

#[tokio::test]
async fn bootstrap_admin_is_created_once() -> Result<()> {
    let h = harness();
    let bootstrap = AdminBootstrap {
        nickname: "root".to_string(),
        phone: "000".to_string(),
        password: "admin-pass".to_string(),
        invitation_code: "ADMIN".to_string(),
    };
    assert!(h.service.ensure_admin(bootstrap.clone()).await?);
    assert!(!h.service.ensure_admin(bootstrap).await?);

    let session = h
        .service
        .login(LoginRequest {
            phone: "000".to_string(),
            password: "admin-pass".to_string(),
        })
        .await?;
    assert!(session.account.is_admin);
    assert_eq!(session.account.role, AccountRole::Admin);
    Ok(())
}

#[tokio::test]
async fn reporting_totals_saturate_instead_of_overflowing() -> Result<()> {
    let h = harness();
    let alice = signup(&h.service, "alice", "INV-A").await?;

    let large = deposit(&h.service, &alice, i64::MAX).await?;
    h.service.approve_deposit(&large.deposit_id).await?;
    assert_eq!(balance(&h.service, &alice).await?, i64::MAX);

    let drain = withdraw(&h.service, &alice, i64::MAX).await?;
    h.service.approve_withdraw(&drain.withdraw_id).await?;
    assert_eq!(balance(&h.service, &alice).await?, 0);

    let small = deposit(&h.service, &alice, 2_000).await?;
    h.service.approve_deposit(&small.deposit_id).await?;
    assert_eq!(balance(&h.service, &alice).await?, 2_000);

    let stats = h.service.stats().await?;
    assert_eq!(stats.total_balance_cents, 2_000);
    assert_eq!(stats.approved_deposits_cents, i64::MAX);
    assert_eq!(stats.approved_withdrawals_cents, i64::MAX);

    let records = h.service.deposit_records(&alice, "INV-A").await?;
    assert_eq!(records.records.len(), 2);
    assert_eq!(records.summary.approved_total_cents, i64::MAX);
    assert_eq!(records.summary.approved_today_cents, i64::MAX);
    Ok(())
}

#[tokio::test]
async fn each_admin_mutation_names_its_own_cause() -> Result<()> {
    let h = harness();
    let alice = signup(&h.service, "alice", "INV-A").await?;

    let first = h
        .service
        .adjust_balance(AdjustBalanceRequest {
            account: "alice".to_string(),
            delta_cents: 500,
        })
        .await?;
    let second = h
        .service
        .adjust_balance(AdjustBalanceRequest {
            account: "alice".to_string(),
            delta_cents: 700,
        })
        .await?;
    assert_eq!(first.cause.kind, MutationKind::AdminAdjustment);
    assert_eq!(second.cause.kind, MutationKind::AdminAdjustment);
    assert_ne!(first.cause.reference_id, second.cause.reference_id);
    assert_ne!(first.cause.reference_id, alice.account_id);

    h.service.reset_account(&alice.account_id).await?;

    let causes = h
        .observer
        .events()
        .into_iter()
        .filter_map(|event| match event {
            LedgerEvent::BalanceAdjusted { mutation } => Some(mutation.cause),
            _ => None,
        })
        .collect::<Vec<_>>();
    assert_eq!(causes.len(), 3);
    assert_eq!(causes[2].kind, MutationKind::AdminReset);
    let mut references = causes
        .iter()
        .map(|cause| cause.reference_id.as_str())
        .collect::<Vec<_>>();
    references.sort_unstable();
    references.dedup();
    assert_eq!(references.len(), 3);
    Ok(())
}
