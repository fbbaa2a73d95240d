use std::collections::HashSet;

use chrono::{TimeDelta, Utc};
use mediahash_core::claim::{ClaimConfig, ClaimProtocol};
use mediahash_core::traits::WorkStore;
use mediahash_core::work::{Handler, NewWork, UpdateGuard, WorkStatus, WorkUpdate};
use mediahash_db::WorkRepository;
use uuid::Uuid;

use crate::integration::common::{seed, setup_test_db};

#[tokio::test]
async fn insert_is_idempotent_per_url() {
    let (pool, _container) = setup_test_db().await;
    let repo = WorkRepository::new(pool);

    let work = NewWork::new(Handler::Wmc, "File:Duplicate.jpg");
    assert!(repo.insert_if_absent(&work).await.unwrap());
    assert!(!repo.insert_if_absent(&work).await.unwrap());

    assert_eq!(repo.count_by_status(WorkStatus::Idle).await.unwrap(), 1);
    let ids = repo.select_batch(WorkStatus::Idle, 10).await.unwrap();
    let items = repo.get_by_ids(&ids).await.unwrap();
    assert_eq!(items[0].handler, Handler::Wmc);
    assert!(items[0].claim_token.is_none());
    assert!(items[0].metadata_blob.is_none());
}

#[tokio::test]
async fn select_batch_respects_status_and_limit() {
    let (pool, _container) = setup_test_db().await;
    let repo = WorkRepository::new(pool);
    seed(&repo, 7, WorkStatus::Queued).await;

    assert_eq!(repo.select_batch(WorkStatus::Queued, 5).await.unwrap().len(), 5);
    assert!(repo.select_batch(WorkStatus::Idle, 5).await.unwrap().is_empty());
}

#[tokio::test]
async fn conditional_update_honours_guard() {
    let (pool, _container) = setup_test_db().await;
    let repo = WorkRepository::new(pool);
    let ids = seed(&repo, 3, WorkStatus::Queued).await;

    let token = Uuid::new_v4();
    let claim = WorkUpdate::new()
        .status(WorkStatus::Processing)
        .claim(token, Utc::now());
    let won = repo
        .conditional_update(&ids, UpdateGuard::unclaimed(WorkStatus::Queued), &claim)
        .await
        .unwrap();
    assert_eq!(won, 3);

    // A second claimant sees nothing left to take.
    let again = repo
        .conditional_update(&ids, UpdateGuard::unclaimed(WorkStatus::Queued), &claim)
        .await
        .unwrap();
    assert_eq!(again, 0);

    // A foreign token cannot finish the items.
    let done = WorkUpdate::new().status(WorkStatus::Done).clear_claim();
    let foreign = repo
        .conditional_update(&ids, UpdateGuard::held(WorkStatus::Processing, Uuid::new_v4()), &done)
        .await
        .unwrap();
    assert_eq!(foreign, 0);

    let finished = repo
        .conditional_update(&ids[..1], UpdateGuard::held(WorkStatus::Processing, token), &done)
        .await
        .unwrap();
    assert_eq!(finished, 1);

    let items = repo.get_by_ids(&ids).await.unwrap();
    assert_eq!(items[0].status, WorkStatus::Done);
    assert!(items[0].claim_token.is_none());
    assert!(items[0].claim_started_at.is_some());
    assert_eq!(items[1].status, WorkStatus::Processing);
    assert_eq!(items[1].claim_token, Some(token));
}

#[tokio::test]
async fn hash_value_is_write_once() {
    let (pool, _container) = setup_test_db().await;
    let repo = WorkRepository::new(pool);
    let ids = seed(&repo, 1, WorkStatus::Queued).await;
    let guard = UpdateGuard::status(WorkStatus::Queued);

    repo.conditional_update(&ids, guard, &WorkUpdate::new().hash("ffff0000"))
        .await
        .unwrap();
    repo.conditional_update(
        &ids,
        guard,
        &WorkUpdate::new()
            .hash("00000000")
            .metadata(serde_json::json!({"sha1": "abc"})),
    )
    .await
    .unwrap();

    let item = &repo.get_by_ids(&ids).await.unwrap()[0];
    assert_eq!(item.hash_value.as_deref(), Some("ffff0000"));
    assert_eq!(item.metadata_blob, Some(serde_json::json!({"sha1": "abc"})));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_claims_are_disjoint() {
    let (pool, _container) = setup_test_db().await;
    let repo = WorkRepository::new(pool);
    let seeded = seed(&repo, 200, WorkStatus::Queued).await;

    let mut handles = Vec::new();
    for _ in 0..8 {
        let protocol = ClaimProtocol::new(repo.clone(), ClaimConfig::default().with_batch_size(25));
        let repo = repo.clone();
        handles.push(tokio::spawn(async move {
            let mut won = Vec::new();
            loop {
                let claim = protocol
                    .claim_batch(WorkStatus::Queued, WorkStatus::Processing)
                    .await
                    .unwrap();
                if claim.is_empty() {
                    if repo.count_by_status(WorkStatus::Queued).await.unwrap() == 0 {
                        break;
                    }
                    continue;
                }
                for work in &claim.items {
                    assert_eq!(work.claim_token, Some(claim.token));
                }
                won.extend(claim.ids());
            }
            won
        }));
    }

    let mut seen = HashSet::new();
    for result in futures::future::join_all(handles).await {
        for id in result.unwrap() {
            assert!(seen.insert(id), "item {id} was claimed twice");
        }
    }
    assert_eq!(seen, seeded.into_iter().collect::<HashSet<_>>());
    assert_eq!(repo.count_by_status(WorkStatus::Processing).await.unwrap(), 200);
}

#[tokio::test]
async fn stale_claims_are_released() {
    let (pool, _container) = setup_test_db().await;
    let repo = WorkRepository::new(pool);
    seed(&repo, 4, WorkStatus::Queued).await;

    let protocol = ClaimProtocol::new(repo.clone(), ClaimConfig::default());
    let claim = protocol
        .claim_batch(WorkStatus::Queued, WorkStatus::Processing)
        .await
        .unwrap();
    assert_eq!(claim.len(), 4);

    let cutoff = Utc::now() - TimeDelta::minutes(10);
    assert!(repo.select_stale(WorkStatus::Processing, cutoff, 10).await.unwrap().is_empty());

    let future = Utc::now() + TimeDelta::seconds(5);
    let stale = repo.select_stale(WorkStatus::Processing, future, 10).await.unwrap();
    assert_eq!(stale.len(), 4);

    let released = protocol
        .release_stale(WorkStatus::Processing, WorkStatus::Queued, future, 10)
        .await
        .unwrap();
    assert_eq!(released, 4);
    assert_eq!(repo.count_by_status(WorkStatus::Queued).await.unwrap(), 4);
}

#[tokio::test]
async fn list_by_status_returns_oldest_first() {
    let (pool, _container) = setup_test_db().await;
    let repo = WorkRepository::new(pool);
    let ids = seed(&repo, 5, WorkStatus::Done).await;

    let listed = repo.list_by_status(WorkStatus::Done, 3).await.unwrap();
    let listed_ids: Vec<i64> = listed.iter().map(|w| w.id).collect();
    assert_eq!(listed_ids, ids[..3]);
}
