use std::sync::Arc;

use futures::future::join_all;
use memory_store::MemoryStore;
use model::{Balance, OrderStatus, OrderUpdate, UserId};
use service::{
    Ledger, Listing, LoyaltyService, LoyaltyServiceImpl, OrderStore, UploadOutcome,
    WithdrawOutcome,
};

struct Fixture {
    service: Arc<LoyaltyServiceImpl>,
    orders: OrderStore,
    ledger: Ledger,
}

fn fixture() -> Fixture {
    let store = Arc::new(MemoryStore::new());
    let orders = OrderStore::new(store.clone());
    let ledger = Ledger::new(store);
    let service = Arc::new(LoyaltyServiceImpl::new(orders.clone(), ledger.clone()));
    Fixture {
        service,
        orders,
        ledger,
    }
}

#[tokio::test]
async fn upload_dedup_and_conflict() {
    let f = fixture();
    let a = UserId::from("a");
    let b = UserId::from("b");

    let first = f.service.upload_order(&a, "12345678903").await.unwrap();
    let again = f.service.upload_order(&a, "12345678903").await.unwrap();
    let other = f.service.upload_order(&b, "12345678903").await.unwrap();
    let bad = f.service.upload_order(&a, "12345678904").await.unwrap();

    assert_eq!(first, UploadOutcome::Accepted);
    assert_eq!(again, UploadOutcome::AlreadyUploaded);
    assert_eq!(other, UploadOutcome::Conflict);
    assert_eq!(bad, UploadOutcome::InvalidFormat);

    let Listing::Found(orders) = f.service.list_orders(&a).await.unwrap() else {
        panic!("expected orders for a");
    };
    assert_eq!(orders.len(), 1);
    assert_eq!(orders[0].status, OrderStatus::New);
    assert_eq!(f.service.list_orders(&b).await.unwrap(), Listing::Empty);
}

#[tokio::test]
async fn processed_order_is_credited_exactly_once() {
    let f = fixture();
    let a = UserId::from("a");
    f.service.upload_order(&a, "9278923470").await.unwrap();

    for update in [
        OrderUpdate::Processing,
        OrderUpdate::Processed { accrual: 500 },
        OrderUpdate::Processed { accrual: 500 },
        OrderUpdate::Processing,
    ] {
        f.orders
            .apply_accrual_result("9278923470", update)
            .await
            .unwrap();
    }

    let balance = f.service.balance(&a).await.unwrap();
    assert_eq!(
        balance,
        Balance {
            current: 500,
            withdrawn: 0
        }
    );
    let Listing::Found(orders) = f.service.list_orders(&a).await.unwrap() else {
        panic!("expected orders for a");
    };
    assert_eq!(orders[0].status, OrderStatus::Processed);
    assert_eq!(orders[0].accrual, Some(500));
}

#[tokio::test]
async fn withdraw_against_balance() {
    let f = fixture();
    let a = UserId::from("a");
    f.ledger.credit(&a, 500).await.unwrap();

    let too_much = f.service.withdraw(&a, "2377225624", 600).await.unwrap();
    assert_eq!(too_much, WithdrawOutcome::InsufficientFunds);
    assert_eq!(
        f.service.balance(&a).await.unwrap(),
        Balance {
            current: 500,
            withdrawn: 0
        }
    );
    assert_eq!(f.service.list_withdrawals(&a).await.unwrap(), Listing::Empty);

    let WithdrawOutcome::Accepted(withdrawal) =
        f.service.withdraw(&a, "2377225624", 500).await.unwrap()
    else {
        panic!("withdrawal of the full balance was not accepted");
    };
    assert_eq!(withdrawal.sum, 500);
    assert_eq!(
        f.service.balance(&a).await.unwrap(),
        Balance {
            current: 0,
            withdrawn: 500
        }
    );
    assert_eq!(
        f.service.list_withdrawals(&a).await.unwrap(),
        Listing::Found(vec![withdrawal])
    );
}

#[tokio::test]
async fn withdraw_validates_reference_and_sum() {
    let f = fixture();
    let a = UserId::from("a");
    f.ledger.credit(&a, 100).await.unwrap();

    assert_eq!(
        f.service.withdraw(&a, "2377225625", 10).await.unwrap(),
        WithdrawOutcome::InvalidOrderNumber
    );
    assert_eq!(
        f.service.withdraw(&a, "2377225624", 0).await.unwrap(),
        WithdrawOutcome::InvalidSum
    );
    assert_eq!(f.service.balance(&a).await.unwrap().current, 100);
}

#[tokio::test]
async fn withdrawal_reference_need_not_be_uploaded() {
    let f = fixture();
    let a = UserId::from("a");
    f.ledger.credit(&a, 100).await.unwrap();

    let outcome = f.service.withdraw(&a, "79927398713", 40).await.unwrap();
    assert!(matches!(outcome, WithdrawOutcome::Accepted(_)));
    assert_eq!(f.service.list_orders(&a).await.unwrap(), Listing::Empty);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_withdrawals_never_overdraw() {
    let f = fixture();
    let a = UserId::from("a");
    f.ledger.credit(&a, 1000).await.unwrap();

    let attempts = (0..12).map(|_| {
        let service = Arc::clone(&f.service);
        let user = a.clone();
        tokio::spawn(async move { service.withdraw(&user, "2377225624", 300).await })
    });
    let results = join_all(attempts).await;

    let accepted = results
        .into_iter()
        .map(|joined| joined.unwrap().unwrap())
        .filter(|outcome| matches!(outcome, WithdrawOutcome::Accepted(_)))
        .count();
    assert_eq!(accepted, 3);
    assert_eq!(
        f.service.balance(&a).await.unwrap(),
        Balance {
            current: 100,
            withdrawn: 900
        }
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn credit_and_withdraw_race_keeps_totals_consistent() {
    let f = fixture();
    let a = UserId::from("a");
    f.service.upload_order(&a, "12345678903").await.unwrap();
    f.ledger.credit(&a, 100).await.unwrap();

    let orders = f.orders.clone();
    let credit = tokio::spawn(async move {
        orders
            .apply_accrual_result("12345678903", OrderUpdate::Processed { accrual: 200 })
            .await
    });
    let service = Arc::clone(&f.service);
    let user = a.clone();
    let debit = tokio::spawn(async move { service.withdraw(&user, "2377225624", 250).await });

    credit.await.unwrap().unwrap();
    let debit = debit.await.unwrap().unwrap();

    let balance = f.service.balance(&a).await.unwrap();
    match debit {
        WithdrawOutcome::Accepted(_) => assert_eq!(balance.current, 50),
        WithdrawOutcome::InsufficientFunds => assert_eq!(balance.current, 300),
        other => panic!("unexpected outcome {other:?}"),
    }
}
