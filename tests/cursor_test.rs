mod common;

use backfill_engine::cursor::{CursorKey, CursorStore, CursorValue, SubTask, Walk};
use backfill_engine::db;
use backfill_engine::model::Provider;
use common::ts;
use uuid::Uuid;

async fn store() -> CursorStore {
    CursorStore::new(db::memory_pool().await.unwrap())
}

#[tokio::test]
async fn set_get_clear() {
    let cursors = store().await;
    let key = CursorKey::BatchProgress {
        backfill_id: Uuid::new_v4(),
        batch_index: 4,
    };
    assert!(cursors.get("acme", &key).await.unwrap().is_none());

    let value = CursorValue::Completed(vec!["a".into(), "b".into()]);
    cursors.set("acme", &key, &value).await.unwrap();
    assert_eq!(cursors.get("acme", &key).await.unwrap(), Some(value));

    let token = CursorValue::Token("page-7".into());
    cursors.set("acme", &key, &token).await.unwrap();
    assert_eq!(cursors.get("acme", &key).await.unwrap(), Some(token));

    cursors.clear("acme", &key).await.unwrap();
    assert!(cursors.get("acme", &key).await.unwrap().is_none());
    // clearing twice is fine
    cursors.clear("acme", &key).await.unwrap();
}

#[tokio::test]
async fn cursors_are_scoped_by_tenant() {
    let cursors = store().await;
    let key = CursorKey::SyncedUntil(Provider::Zendesk);
    cursors
        .set("acme", &key, &CursorValue::Timestamp(ts(2024, 1, 1, 0)))
        .await
        .unwrap();
    assert!(cursors.get("globex", &key).await.unwrap().is_none());
}

#[tokio::test]
async fn synced_until_only_moves_forward() {
    let cursors = store().await;
    let p = Provider::Hubspot;
    assert!(cursors.synced_until("acme", p).await.unwrap().is_none());

    assert!(cursors.advance_synced_until("acme", p, ts(2024, 1, 10, 0)).await.unwrap());
    assert!(!cursors.advance_synced_until("acme", p, ts(2024, 1, 9, 0)).await.unwrap());
    assert!(!cursors.advance_synced_until("acme", p, ts(2024, 1, 10, 0)).await.unwrap());
    assert_eq!(
        cursors.synced_until("acme", p).await.unwrap(),
        Some(ts(2024, 1, 10, 0))
    );
    assert!(cursors.advance_synced_until("acme", p, ts(2024, 1, 11, 0)).await.unwrap());
    assert_eq!(
        cursors.synced_until("acme", p).await.unwrap(),
        Some(ts(2024, 1, 11, 0))
    );
}

#[tokio::test]
async fn reset_may_move_backward_or_clear() {
    let cursors = store().await;
    let p = Provider::Intercom;
    cursors.advance_synced_until("acme", p, ts(2024, 3, 1, 0)).await.unwrap();

    cursors.reset_synced_until("acme", p, Some(ts(2023, 1, 1, 0))).await.unwrap();
    assert_eq!(
        cursors.synced_until("acme", p).await.unwrap(),
        Some(ts(2023, 1, 1, 0))
    );

    cursors.reset_synced_until("acme", p, None).await.unwrap();
    assert!(cursors.synced_until("acme", p).await.unwrap().is_none());
}

#[tokio::test]
async fn clear_progress_only_touches_its_walk() {
    let cursors = store().await;
    let p = Provider::Zendesk;
    let at = CursorValue::Timestamp(ts(2024, 1, 9, 0));
    for subtask in SubTask::ALL {
        for walk in [Walk::Backfill, Walk::Incremental] {
            cursors
                .set("acme", &CursorKey::progress(walk, p, subtask), &at)
                .await
                .unwrap();
        }
    }
    cursors
        .advance_synced_until("acme", p, ts(2024, 1, 1, 0))
        .await
        .unwrap();

    cursors.clear_progress("acme", p, Walk::Backfill).await.unwrap();

    assert!(cursors.keys_with_prefix("acme", "window/").await.unwrap().is_empty());
    let mut left = cursors.keys_with_prefix("acme", "incremental/").await.unwrap();
    left.sort();
    assert_eq!(
        left,
        vec![
            "incremental/zendesk/primary",
            "incremental/zendesk/search",
            "incremental/zendesk/secondary"
        ]
    );
    assert!(cursors.synced_until("acme", p).await.unwrap().is_some());
}
