use std::time::{Duration, Instant};

use mediahash_core::rate_limit::{RateLimit, RateLimiter};
use mediahash_db::Database;

use crate::integration::common::setup_test_db;

#[tokio::test]
async fn spaces_permits_at_configured_rate() {
    let (pool, _container) = setup_test_db().await;
    let limiter = Database::from_pool(pool)
        .rate_limiter("hash", RateLimit::per_second(10).unwrap())
        .await
        .unwrap();

    let start = Instant::now();
    for _ in 0..5 {
        limiter.acquire().await.unwrap();
    }
    let elapsed = start.elapsed();
    assert!(
        elapsed >= Duration::from_millis(350),
        "five permits at 10/s took only {elapsed:?}"
    );
}

#[tokio::test]
async fn handles_share_one_bucket() {
    let (pool, _container) = setup_test_db().await;
    let db = Database::from_pool(pool);
    let limit = RateLimit::per_second(4).unwrap();
    let first = db.rate_limiter("hash", limit).await.unwrap();
    let second = db.rate_limiter("hash", limit).await.unwrap();

    let start = Instant::now();
    tokio::join!(
        async {
            first.acquire().await.unwrap();
            first.acquire().await.unwrap();
        },
        async {
            second.acquire().await.unwrap();
            second.acquire().await.unwrap();
        }
    );
    let elapsed = start.elapsed();
    assert!(
        elapsed >= Duration::from_millis(650),
        "four permits at 4/s across two handles took only {elapsed:?}"
    );
}

#[tokio::test]
async fn separate_names_do_not_interfere() {
    let (pool, _container) = setup_test_db().await;
    let db = Database::from_pool(pool);
    let slow = db
        .rate_limiter("slow", "1/m".parse().unwrap())
        .await
        .unwrap();
    let fast = db
        .rate_limiter("fast", RateLimit::per_second(50).unwrap())
        .await
        .unwrap();

    slow.acquire().await.unwrap();
    let start = Instant::now();
    fast.acquire().await.unwrap();
    fast.acquire().await.unwrap();
    assert!(start.elapsed() < Duration::from_secs(5));
}
