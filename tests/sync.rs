//! Integration tests for the sync manager: offline writes drained on
//! connectivity restoration, trigger coalescing, and per-row failure
//! isolation.

mod common;

use serde_json::json;

use common::{harness, settle};
use pocket_db::QueryOptions;

#[tokio::test]
async fn offline_create_drains_on_connectivity_edge() {
    let h = harness(false);
    h.client.start();
    let posts = h.client.collection("posts");

    let record = posts.create(&json!({"title": "Hi"}), None).await.unwrap();
    let id = record["id"].as_str().unwrap().to_string();
    assert_eq!(record["synced"], false);
    assert_eq!(record["isNew"], true);

    h.connectivity.set_online(true);
    settle().await;
    h.client.wait_for_sync().await;

    // the server received a create carrying the locally generated id
    assert_eq!(h.remote.calls_matching(&format!("create posts {id}")), 1);
    let server = h.remote.record("posts", &id).unwrap();
    assert_eq!(server["title"], "Hi");
    assert!(server.get("isNew").is_none(), "control flags are stripped");

    // and the local row flipped to server-confirmed
    let row = h.client.store().get_row("posts", &id).unwrap().unwrap();
    assert_eq!(row["synced"], true);
    assert_eq!(row["isNew"], false);
}

#[tokio::test]
async fn offline_update_and_delete_replay_in_order() {
    let h = harness(false);
    h.client.start();
    let posts = h.client.collection("posts");
    let store = h.client.store();

    // two rows the server already knows about
    for id in ["aaaaaaaaaaaaaaa", "bbbbbbbbbbbbbbb"] {
        h.remote.seed("posts", json!({"id": id, "title": "orig"}));
        store
            .set_local("posts", &[json!({"id": id, "title": "orig"})], false)
            .unwrap();
    }

    posts
        .update("aaaaaaaaaaaaaaa", &json!({"title": "edited"}), None)
        .await
        .unwrap();
    posts.delete("bbbbbbbbbbbbbbb", None).await.unwrap();

    h.connectivity.set_online(true);
    settle().await;
    h.client.wait_for_sync().await;

    assert_eq!(
        h.remote.record("posts", "aaaaaaaaaaaaaaa").unwrap()["title"],
        "edited"
    );
    assert!(h.remote.record("posts", "bbbbbbbbbbbbbbb").is_none());
    assert!(
        store.get_row("posts", "bbbbbbbbbbbbbbb").unwrap().is_none(),
        "tombstone removed after server confirmed the delete"
    );
}

#[tokio::test]
async fn local_only_rows_are_never_drained() {
    let h = harness(false);
    h.client.start();
    let posts = h.client.collection("posts");

    posts
        .create(
            &json!({"title": "private"}),
            Some(pocket_db::RequestPolicy::CacheOnly),
        )
        .await
        .unwrap();

    h.connectivity.set_online(true);
    settle().await;
    h.client.wait_for_sync().await;

    assert_eq!(h.remote.calls_matching("create"), 0);
}

#[tokio::test]
async fn repeated_triggers_coalesce_and_replays_are_idempotent() {
    let h = harness(false);
    h.client.start();
    let posts = h.client.collection("posts");

    let record = posts.create(&json!({"title": "Hi"}), None).await.unwrap();
    let id = record["id"].as_str().unwrap().to_string();

    h.connectivity.set_online(true);
    // connectivity flap: a second rising edge lands mid-drain
    h.connectivity.set_online(false);
    h.connectivity.set_online(true);
    h.client.sync_manager().trigger();
    settle().await;
    h.client.wait_for_sync().await;
    settle().await;

    assert_eq!(
        h.remote.calls_matching(&format!("create posts {id}")),
        1,
        "the row is replayed exactly once"
    );
}

#[tokio::test]
async fn one_failing_row_does_not_stop_the_drain() {
    let h = harness(false);
    h.client.start();
    let posts = h.client.collection("posts");

    let first = posts
        .create(
            &json!({"id": "aaaaaaaaaaaaaaa", "title": "doomed"}),
            None,
        )
        .await
        .unwrap();
    let second = posts
        .create(
            &json!({"id": "bbbbbbbbbbbbbbb", "title": "fine"}),
            None,
        )
        .await
        .unwrap();
    assert_eq!(first["synced"], false);
    assert_eq!(second["synced"], false);

    h.remote
        .fail_ids
        .lock()
        .unwrap()
        .insert("aaaaaaaaaaaaaaa".to_string());

    h.connectivity.set_online(true);
    settle().await;
    h.client.wait_for_sync().await;

    let store = h.client.store();
    let doomed = store.get_row("posts", "aaaaaaaaaaaaaaa").unwrap().unwrap();
    assert_eq!(doomed["synced"], false, "failed row stays pending");
    let fine = store.get_row("posts", "bbbbbbbbbbbbbbb").unwrap().unwrap();
    assert_eq!(fine["synced"], true, "later rows still drained");

    // the next drain picks the failed row up again
    h.remote.fail_ids.lock().unwrap().clear();
    h.client.sync_manager().trigger();
    h.client.wait_for_sync().await;
    let recovered = store.get_row("posts", "aaaaaaaaaaaaaaa").unwrap().unwrap();
    assert_eq!(recovered["synced"], true);
}

#[tokio::test]
async fn schema_records_are_never_replayed() {
    let h = harness(false);
    h.client.start();

    // the preloaded snapshot lives in the schema collection as local rows
    h.connectivity.set_online(true);
    settle().await;
    h.client.wait_for_sync().await;

    assert_eq!(h.remote.calls_matching("create schema"), 0);
    assert_eq!(h.remote.calls_matching("update schema"), 0);
}

#[tokio::test]
async fn stream_full_list_emits_cache_then_merged_result() {
    let h = harness(true);
    let store = h.client.store();
    store
        .set_local(
            "posts",
            &[json!({"id": "aaaaaaaaaaaaaaa", "title": "cached", "community": "x"})],
            false,
        )
        .unwrap();
    h.remote.seed(
        "posts",
        json!({"id": "aaaaaaaaaaaaaaa", "title": "cached", "community": "x",
               "updated": "2999-01-01T00:00:00.000Z"}),
    );
    h.remote.seed(
        "posts",
        json!({"id": "bbbbbbbbbbbbbbb", "title": "fresh", "community": "x",
               "updated": "2999-01-01T00:00:00.000Z"}),
    );

    let mut rx = h
        .client
        .collection("posts")
        .stream_full_list(&QueryOptions::default())
        .unwrap();

    let snapshot = rx.recv().await.unwrap();
    assert_eq!(snapshot.len(), 1, "cache snapshot first");

    let merged = rx.recv().await.unwrap();
    assert_eq!(merged.len(), 2, "then the merged server result");
}
