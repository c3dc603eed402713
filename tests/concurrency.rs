use std::sync::Arc;

use chrono::{DateTime, Duration};
use ride_ledger::booking::NewRide;
use ride_ledger::clock::FixedClock;
use ride_ledger::model::{BookingStatus, Location, User, Vehicle, VehicleKind};
use ride_ledger::store::MemoryStore;
use ride_ledger::{Amount, Config, Engine, ErrorKind, RetryPolicy};

const DRIVER: u64 = 1000;
const RIDE: u64 = 1;
const SEATS: u32 = 3;

async fn engine_with_riders(riders: u64) -> Arc<Engine> {
    let config = Config {
        retry: RetryPolicy {
            max_attempts: 50,
            backoff_ms: 1,
        },
        ..Config::default()
    };
    let now = DateTime::UNIX_EPOCH + Duration::days(1);
    let engine = Engine::new(MemoryStore::new(), config).with_clock(Arc::new(FixedClock::new(now)));

    engine
        .register_user(User::new(DRIVER, "driver", "driver@example.com"))
        .await
        .unwrap();
    for rider in 1..=riders {
        engine
            .register_user(User::new(rider, format!("rider-{rider}"), "r@example.com"))
            .await
            .unwrap();
        engine.top_up(rider, Amount::from_whole(500)).await.unwrap();
    }
    engine
        .add_location(Location {
            id: 1,
            name: "Campus".to_string(),
            is_organization: true,
            distance_from_org: 0.0,
        })
        .await
        .unwrap();
    engine
        .add_location(Location {
            id: 2,
            name: "Depot".to_string(),
            is_organization: false,
            distance_from_org: 3.0,
        })
        .await
        .unwrap();
    engine
        .add_vehicle(Vehicle {
            id: 1,
            owner: DRIVER,
            kind: VehicleKind::FourWheeler,
        })
        .await
        .unwrap();
    engine
        .create_ride(NewRide {
            id: RIDE,
            driver: DRIVER,
            starting_time: now + Duration::hours(1),
            max_passengers: SEATS,
            starting_location: 2,
            destination_location: 1,
            vehicle: Some(1),
        })
        .await
        .unwrap();
    Arc::new(engine)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_bookings_never_oversell() {
    let riders = 10;
    let engine = engine_with_riders(riders).await;

    let handles: Vec<_> = (1..=riders)
        .map(|rider| {
            let engine = engine.clone();
            tokio::spawn(async move { (rider, engine.book_ride(rider, RIDE).await) })
        })
        .collect();

    let mut confirmed = Vec::new();
    for handle in handles {
        let (rider, result) = handle.await.unwrap();
        match result {
            Ok(outcome) => {
                assert_eq!(outcome.status, BookingStatus::Confirmed);
                confirmed.push(rider);
            }
            Err(e) => assert_eq!(e.kind(), ErrorKind::CapacityExceeded, "{e}"),
        }
    }
    assert_eq!(confirmed.len(), SEATS as usize);

    for rider in 1..=riders {
        let wallet = engine.get_wallet(rider).await.unwrap();
        assert_eq!(wallet.total, Amount::from_whole(500));
        assert_eq!(wallet.total, wallet.spendable + wallet.held);
        if confirmed.contains(&rider) {
            assert_eq!(wallet.held, Amount::from_whole(100));
        } else {
            assert_eq!(wallet.held, Amount::ZERO);
            assert!(engine.find_booking(RIDE, rider).await.unwrap().is_none());
        }
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn duplicate_requests_book_once() {
    let engine = engine_with_riders(1).await;

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let engine = engine.clone();
            tokio::spawn(async move { engine.book_ride(1, RIDE).await })
        })
        .collect();

    let mut booked = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(_) => booked += 1,
            Err(e) => assert_eq!(e.kind(), ErrorKind::InvalidState, "{e}"),
        }
    }
    assert_eq!(booked, 1);

    let wallet = engine.get_wallet(1).await.unwrap();
    assert_eq!(wallet.spendable, Amount::from_whole(400));
    assert_eq!(wallet.held, Amount::from_whole(100));
}
