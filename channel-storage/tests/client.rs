mod support;

use std::time::{Duration, Instant};

use anyhow::Result;
use channel_storage::{client::StorageClient, config::StorageClientConfig, error::StorageError};
use futures::future::join_all;
use tokio::net::TcpListener;

use support::Fixture;

#[tokio::test]
async fn put_get_delete() -> Result<()> {
    let fixture = Fixture::start().await?;
    let client = &fixture.client;

    assert_eq!(client.get("missing").await?, None);

    client.put("key", "value").await?;
    assert_eq!(client.get("key").await?, Some(b"value".to_vec()));

    client.put("key", "replaced").await?;
    assert_eq!(client.get("key").await?, Some(b"replaced".to_vec()));

    client.delete("key").await?;
    assert_eq!(client.get("key").await?, None);
    client.delete("key").await?;

    fixture.teardown().await
}

#[tokio::test]
async fn empty_value_is_not_absence() -> Result<()> {
    let fixture = Fixture::start().await?;
    let client = &fixture.client;

    client.put("empty", "").await?;
    assert_eq!(client.get("empty").await?, Some(Vec::new()));
    assert!(!client.put_if_absent("empty", "other").await?);

    // An absent key never matches an empty expectation.
    assert!(!client.compare_and_swap("absent", "", "x").await?);
    assert_eq!(client.get("absent").await?, None);

    fixture.teardown().await
}

#[tokio::test]
async fn prefix_query_is_ordered_and_exact() -> Result<()> {
    let fixture = Fixture::start().await?;
    let client = &fixture.client;

    for (key, value) in [
        ("aaa/2", "two"),
        ("bbb", "decoy"),
        ("aaa/1", "one"),
        ("aa", "short"),
        ("aab", "sibling"),
        ("aaa/10", "ten"),
    ] {
        client.put(key, value).await?;
    }

    let values = client.get_by_key_prefix("aaa/").await?;
    assert_eq!(values, vec![b"one".to_vec(), b"ten".to_vec(), b"two".to_vec()]);

    let keys: Vec<Vec<u8>> = client
        .range("aa")
        .await?
        .into_iter()
        .map(|kv| kv.key)
        .collect();
    assert_eq!(
        keys,
        vec![
            b"aa".to_vec(),
            b"aaa/1".to_vec(),
            b"aaa/10".to_vec(),
            b"aaa/2".to_vec(),
            b"aab".to_vec(),
        ]
    );

    assert!(client.get_by_key_prefix("zzz").await?.is_empty());

    fixture.teardown().await
}

#[tokio::test]
async fn compare_and_swap_requires_exact_value() -> Result<()> {
    let fixture = Fixture::start().await?;
    let client = &fixture.client;

    client.put("balance", "10").await?;

    assert!(!client.compare_and_swap("balance", "1", "20").await?);
    assert_eq!(client.get("balance").await?, Some(b"10".to_vec()));

    assert!(client.compare_and_swap("balance", "10", "20").await?);
    assert_eq!(client.get("balance").await?, Some(b"20".to_vec()));

    // The old expectation is stale now.
    assert!(!client.compare_and_swap("balance", "10", "30").await?);
    assert_eq!(client.get("balance").await?, Some(b"20".to_vec()));

    fixture.teardown().await
}

#[tokio::test]
async fn concurrent_swaps_have_one_winner() -> Result<()> {
    let fixture = Fixture::start().await?;
    fixture.client.put("counter", "0").await?;

    let attempts = (0..10).map(|i| {
        let client = fixture.client.clone();
        async move { client.compare_and_swap("counter", "0", format!("{i}")).await }
    });
    let results = join_all(attempts).await;

    let mut winners = 0;
    for result in results {
        if result? {
            winners += 1;
        }
    }
    assert_eq!(winners, 1);

    fixture.teardown().await
}

#[tokio::test]
async fn put_if_absent_keeps_first_value() -> Result<()> {
    let fixture = Fixture::start().await?;
    let client = &fixture.client;

    assert!(client.put_if_absent("owner", "alice").await?);
    assert!(!client.put_if_absent("owner", "bob").await?);
    assert_eq!(client.get("owner").await?, Some(b"alice".to_vec()));

    fixture.teardown().await
}

#[tokio::test]
async fn transaction_writes_all_or_nothing() -> Result<()> {
    let fixture = Fixture::start().await?;
    let client = &fixture.client;

    client.put("a", "1").await?;
    client.put("b", "2").await?;

    let applied = client
        .transaction([("a", "1"), ("b", "2")], [("a", "3"), ("b", "4"), ("c", "5")])
        .await?;
    assert!(applied);
    assert_eq!(client.get("a").await?, Some(b"3".to_vec()));
    assert_eq!(client.get("b").await?, Some(b"4".to_vec()));
    assert_eq!(client.get("c").await?, Some(b"5".to_vec()));

    // One stale guard fails the whole transaction.
    let applied = client
        .transaction([("a", "3"), ("b", "2")], [("a", "6"), ("b", "7"), ("d", "8")])
        .await?;
    assert!(!applied);
    assert_eq!(client.get("a").await?, Some(b"3".to_vec()));
    assert_eq!(client.get("b").await?, Some(b"4".to_vec()));
    assert_eq!(client.get("d").await?, None);

    fixture.teardown().await
}

#[tokio::test]
async fn transaction_guards_write_only_keys() -> Result<()> {
    let fixture = Fixture::start().await?;
    let client = &fixture.client;

    async fn assert_values(client: &StorageClient, expected: [(&str, &str); 3]) -> Result<()> {
        for (key, value) in expected {
            assert_eq!(client.get(key).await?, Some(value.as_bytes().to_vec()), "key {key}");
        }
        Ok(())
    }

    client.put("key1", "expect1").await?;
    client.put("key2", "expect2").await?;

    let guards = [("key1", "expect1"), ("key2", "expect2")];
    let writes = [("key2", "update2"), ("key3", "update3")];

    assert!(client.transaction(guards, writes).await?);
    assert_values(client, [("key1", "expect1"), ("key2", "update2"), ("key3", "update3")]).await?;

    // The identical call is stale now and changes nothing.
    assert!(!client.transaction(guards, writes).await?);
    assert_values(client, [("key1", "expect1"), ("key2", "update2"), ("key3", "update3")]).await?;

    // Guarding the write-only key and reverting key2 leaves key3 in place.
    let applied = client
        .transaction(
            [("key1", "expect1"), ("key2", "update2"), ("key3", "update3")],
            [("key2", "expect2")],
        )
        .await?;
    assert!(applied);
    assert_values(client, [("key1", "expect1"), ("key2", "expect2"), ("key3", "update3")]).await?;

    fixture.teardown().await
}

#[tokio::test]
async fn transaction_sequence_over_shared_keys() -> Result<()> {
    let fixture = Fixture::start().await?;
    let first = &fixture.client;
    let second = fixture.connect_client().await?;

    first.put("x", "0").await?;
    first.put("y", "0").await?;

    // Both read the same state; only the first to commit wins.
    assert!(first.transaction([("x", "0"), ("y", "0")], [("x", "1"), ("y", "1")]).await?);
    assert!(!second.transaction([("x", "0"), ("y", "0")], [("x", "2"), ("y", "2")]).await?);

    // The loser retries against what it now reads.
    let x = second.get("x").await?.unwrap_or_default();
    let y = second.get("y").await?.unwrap_or_default();
    assert!(second.transaction([("x", x), ("y", y)], [("x", "2"), ("y", "2")]).await?);
    assert_eq!(first.get("x").await?, Some(b"2".to_vec()));
    assert_eq!(first.get("y").await?, Some(b"2".to_vec()));

    second.close().await?;
    fixture.teardown().await
}

#[tokio::test]
async fn status_reports_key_count() -> Result<()> {
    let fixture = Fixture::start().await?;
    let client = &fixture.client;

    client.put("one", "1").await?;
    client.put("two", "2").await?;

    let status = client.status().await?;
    assert_eq!(status.member, "storage-1");
    assert_eq!(status.keys, 2);
    assert!(status.revision >= 2);

    fixture.teardown().await
}

#[tokio::test]
async fn closed_client_rejects_operations() -> Result<()> {
    let fixture = Fixture::start().await?;
    let clone = fixture.client.clone();

    fixture.client.close().await?;
    fixture.client.close().await?;
    assert!(clone.is_closed());

    let err = clone.get("key").await.expect_err("closed client must fail");
    assert!(matches!(err, StorageError::Closed), "unexpected error: {err:?}");
    let err = clone.put("key", "value").await.expect_err("closed client must fail");
    assert!(matches!(err, StorageError::Closed), "unexpected error: {err:?}");

    fixture.teardown().await
}

#[tokio::test]
async fn connect_fails_fast_without_a_store() -> Result<()> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    drop(listener);

    let config = StorageClientConfig {
        connection_timeout: Duration::from_millis(500),
        ..StorageClientConfig::for_endpoint(addr)
    };
    let started = Instant::now();
    let err = match StorageClient::connect(&config).await {
        Ok(_) => panic!("connect must fail without a store"),
        Err(err) => err,
    };

    assert!(matches!(err, StorageError::Connect { .. }), "unexpected error: {err:?}");
    assert!(started.elapsed() < Duration::from_secs(2));
    Ok(())
}

#[tokio::test]
async fn connect_rejects_malformed_endpoint() -> Result<()> {
    let config = StorageClientConfig {
        endpoints: vec!["http://no-port".to_string()],
        ..StorageClientConfig::default()
    };
    let err = match StorageClient::connect(&config).await {
        Ok(_) => panic!("malformed endpoint must be rejected"),
        Err(err) => err,
    };
    assert!(matches!(err, StorageError::Config(_)), "unexpected error: {err:?}");
    Ok(())
}

#[tokio::test]
async fn silent_store_times_out() -> Result<()> {
    // Accepts connections and never answers.
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    let silent = tokio::spawn(async move {
        let mut held = Vec::new();
        while let Ok((stream, _)) = listener.accept().await {
            held.push(stream);
        }
    });

    let config = StorageClientConfig {
        request_timeout: Duration::from_millis(200),
        ..StorageClientConfig::for_endpoint(addr)
    };
    let client = StorageClient::connect(&config).await?;

    let started = Instant::now();
    let err = client.get("key").await.expect_err("request must time out");
    assert!(
        matches!(err, StorageError::Timeout { operation: "get", .. }),
        "unexpected error: {err:?}"
    );
    assert!(started.elapsed() < Duration::from_secs(2));

    client.close().await?;
    silent.abort();
    Ok(())
}
