mod common;

use common::{ok, read_request_head, status, table_body, ScriptedTransport};
use rowscope::{
    DataFetcher, FetchError, FetchOptions, QueryRequest, ReqwestTransport, TransientNetworkError,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::time::Instant;

fn options() -> FetchOptions {
    FetchOptions {
        base_url: "http://metabase.local".to_string(),
        ..FetchOptions::default()
    }
}

#[tokio::test(start_paused = true)]
async fn test_repeated_request_served_from_cache() {
    let fetcher = DataFetcher::new(ScriptedTransport::new(vec![ok(table_body(3))]), options());
    let request = QueryRequest::new(42u64).with_filter("state", "SP");

    let first = fetcher.fetch(&request).await.unwrap();
    let second = fetcher.fetch(&request).await.unwrap();

    assert!(Arc::ptr_eq(&first, &second));
    assert_eq!(first.row_count(), 3);
    assert_eq!(fetcher.transport().calls(), 1);
    let stats = fetcher.stats();
    assert_eq!(stats.network_requests, 1);
    assert_eq!(stats.cache.hits, 1);
    assert_eq!(stats.cache.entries, 1);
}

#[tokio::test(start_paused = true)]
async fn test_filter_order_does_not_change_cache_key() {
    let fetcher = DataFetcher::new(ScriptedTransport::new(vec![ok(table_body(1))]), options());
    let a = QueryRequest::new(7u64)
        .with_filter("year", "2024")
        .with_filter_values("state", ["SP", "RJ"]);
    let b = QueryRequest::new(7u64)
        .with_filter_values("state", ["SP", "RJ"])
        .with_filter("year", "2024");

    fetcher.fetch(&a).await.unwrap();
    fetcher.fetch(&b).await.unwrap();
    assert_eq!(fetcher.transport().calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_multi_valued_filter_sent_as_repeated_params() {
    let fetcher = DataFetcher::new(ScriptedTransport::new(vec![ok(table_body(1))]), options());
    let request = QueryRequest::new(7u64).with_filter_values("state", ["SP", "RJ"]);
    fetcher.fetch(&request).await.unwrap();

    let sent = fetcher.transport().requests();
    assert_eq!(sent[0].url, "http://metabase.local/api/query");
    let states: Vec<&str> = sent[0]
        .query
        .iter()
        .filter(|(k, _)| k == "state")
        .map(|(_, v)| v.as_str())
        .collect();
    assert_eq!(states, vec!["SP", "RJ"]);
}

#[tokio::test(start_paused = true)]
async fn test_new_fetch_cancels_the_one_in_flight() {
    let transport = ScriptedTransport::default();
    transport.push(Duration::from_secs(5), ok(table_body(10)));
    transport.push(Duration::ZERO, ok(table_body(2)));
    let fetcher = Arc::new(DataFetcher::new(transport, options()));

    let slow = {
        let fetcher = Arc::clone(&fetcher);
        tokio::spawn(async move { fetcher.fetch(&QueryRequest::new(1u64)).await })
    };
    tokio::task::yield_now().await;

    let fast = fetcher.fetch(&QueryRequest::new(2u64)).await.unwrap();
    assert_eq!(fast.row_count(), 2);

    let slow = slow.await.unwrap();
    assert_eq!(slow.unwrap_err(), FetchError::Cancelled);
    // only the request that finished is cached
    assert_eq!(fetcher.stats().cache.entries, 1);
}

#[tokio::test(start_paused = true)]
async fn test_new_fetch_during_backoff_ends_the_old_retries() {
    let transport = ScriptedTransport::default();
    transport.push(Duration::ZERO, status(503));
    transport.push(Duration::ZERO, ok(table_body(2)));
    let fetcher = Arc::new(DataFetcher::new(transport, options()));

    let first = {
        let fetcher = Arc::clone(&fetcher);
        tokio::spawn(async move { fetcher.fetch(&QueryRequest::new(1u64)).await })
    };
    // the first fetch is now waiting out its 1s backoff
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(fetcher.transport().calls(), 1);

    let second = fetcher.fetch(&QueryRequest::new(2u64)).await.unwrap();
    assert_eq!(second.row_count(), 2);
    assert_eq!(first.await.unwrap().unwrap_err(), FetchError::Cancelled);

    // well past every backoff the first fetch could have scheduled
    tokio::time::sleep(Duration::from_secs(10)).await;
    assert_eq!(fetcher.transport().calls(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_cache_entry_expires_after_ttl() {
    let fetcher = DataFetcher::new(
        ScriptedTransport::new(vec![ok(table_body(1)), ok(table_body(2))]),
        FetchOptions {
            cache_ttl: Duration::from_secs(300),
            ..options()
        },
    );
    let request = QueryRequest::new(5u64);

    fetcher.fetch(&request).await.unwrap();
    tokio::time::advance(Duration::from_secs(299)).await;
    assert_eq!(fetcher.fetch(&request).await.unwrap().row_count(), 1);

    tokio::time::advance(Duration::from_secs(2)).await;
    assert_eq!(fetcher.fetch(&request).await.unwrap().row_count(), 2);
    assert_eq!(fetcher.transport().calls(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_backoff_grows_linearly() {
    let fetcher = DataFetcher::new(
        ScriptedTransport::new(vec![status(503), status(502), ok(table_body(4))]),
        FetchOptions {
            max_retries: 3,
            base_delay: Duration::from_millis(1000),
            ..options()
        },
    );
    let started = Instant::now();
    let store = fetcher.fetch(&QueryRequest::new(3u64)).await.unwrap();
    let elapsed = started.elapsed();

    assert_eq!(store.row_count(), 4);
    assert_eq!(fetcher.transport().calls(), 3);
    // 1s after the first failure, 2s after the second
    assert!(elapsed >= Duration::from_secs(3), "{:?}", elapsed);
    assert!(elapsed < Duration::from_millis(3100), "{:?}", elapsed);
}

#[tokio::test(start_paused = true)]
async fn test_slow_response_times_out() {
    let transport = ScriptedTransport::default();
    transport.push(Duration::from_secs(60), ok(table_body(1)));
    let fetcher = DataFetcher::new(
        transport,
        FetchOptions {
            max_retries: 1,
            timeout: Duration::from_secs(10),
            ..options()
        },
    );
    let err = fetcher.fetch(&QueryRequest::new(3u64)).await.unwrap_err();
    assert_eq!(
        err,
        FetchError::Exhausted {
            attempts: 1,
            source: TransientNetworkError::Timeout(Duration::from_secs(10)),
        }
    );
}

#[tokio::test(start_paused = true)]
async fn test_ragged_rows_fail_without_retry() {
    let body = r#"{"data": {"cols": [{"name": "a"}, {"name": "b"}], "rows": [[1, 2], [3]]}}"#;
    let fetcher = DataFetcher::new(ScriptedTransport::new(vec![ok(body)]), options());
    let err = fetcher.fetch(&QueryRequest::new(3u64)).await.unwrap_err();
    assert!(matches!(err, FetchError::SchemaMismatch(_)), "{:?}", err);
    assert_eq!(fetcher.transport().calls(), 1);
    assert_eq!(fetcher.stats().cache.entries, 0);
}

#[tokio::test(start_paused = true)]
async fn test_legacy_array_of_objects() {
    let body = r#"[{"city": "Recife", "population": 1488920}, {"city": "Natal", "population": 751300}]"#;
    let fetcher = DataFetcher::new(ScriptedTransport::new(vec![ok(body)]), options());
    let store = fetcher.fetch(&QueryRequest::new(8u64)).await.unwrap();
    assert_eq!(store.column_count(), 2);
    assert_eq!(store.row_count(), 2);
    assert_eq!(store.columns()[0].name, "city");
}

#[tokio::test]
async fn test_cancel_closes_the_connection() {
    let listener = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (received_tx, received_rx) = oneshot::channel();
    let server = tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();
        read_request_head(&mut socket).await;
        let _ = received_tx.send(());
        // never answer; wait for the client to hang up
        let mut buf = [0u8; 64];
        tokio::time::timeout(Duration::from_secs(5), socket.read(&mut buf)).await
    });

    let client = reqwest::Client::builder().no_proxy().build().unwrap();
    let fetcher = Arc::new(DataFetcher::new(
        ReqwestTransport::with_client(client),
        FetchOptions {
            base_url: format!("http://{}", addr),
            max_retries: 1,
            ..FetchOptions::default()
        },
    ));
    let pending = {
        let fetcher = Arc::clone(&fetcher);
        tokio::spawn(async move { fetcher.fetch(&QueryRequest::new(1u64)).await })
    };

    received_rx.await.unwrap();
    tokio::time::sleep(Duration::from_millis(300)).await;
    fetcher.cancel();
    assert_eq!(pending.await.unwrap().unwrap_err(), FetchError::Cancelled);

    let read = server
        .await
        .unwrap()
        .expect("server still connected 5s after cancel");
    assert!(matches!(read, Ok(0) | Err(_)), "{:?}", read);
}
