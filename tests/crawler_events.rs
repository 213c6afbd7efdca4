//! Crawler behavior: polling, dynamic observables, confirmation watchers,
//! failure isolation and shutdown.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::timeout;

use tidepool::crawler::{spawn_crawler, CrawlerConfig, CrawlerEvent, Observable};
use tidepool::testing::MockChainClient;
use tidepool::{AccountIndex, AssetId};

const WAIT: Duration = Duration::from_secs(5);

fn fast_config() -> CrawlerConfig {
    CrawlerConfig {
        crawl_interval: Duration::from_millis(20),
        start_stagger: Duration::from_millis(5),
        max_backoff: Duration::from_millis(100),
        event_capacity: 16,
    }
}

fn observable(addr: &str, account: u32) -> Observable {
    Observable {
        account: AccountIndex::new(account),
        address: addr.to_string(),
        blinding_key: vec![1; 32],
    }
}

fn asset(byte: u8) -> AssetId {
    AssetId::new([byte; 32])
}

/// Wait for the next event for a given address.
async fn next_utxo_event_for(
    events: &mut tokio::sync::mpsc::Receiver<CrawlerEvent>,
    address: &str,
) -> (AccountIndex, Vec<tidepool::ports::ChainUtxo>) {
    loop {
        let event = timeout(WAIT, events.recv())
            .await
            .expect("timed out waiting for event")
            .expect("event stream closed");
        if let CrawlerEvent::Utxos {
            account,
            address: a,
            utxos,
        } = event
        {
            if a == address {
                return (account, utxos);
            }
        }
    }
}

#[tokio::test]
async fn observables_emit_utxo_events() {
    let chain = Arc::new(MockChainClient::new());
    chain.set_utxos("a1", vec![MockChainClient::utxo("tx1", 0, 100, asset(1))]);

    let (handle, mut events) =
        spawn_crawler(chain.clone(), fast_config(), vec![observable("a1", 5)]);

    let (account, utxos) = next_utxo_event_for(&mut events, "a1").await;
    assert_eq!(account, AccountIndex::new(5));
    assert_eq!(utxos.len(), 1);
    assert_eq!(utxos[0].value, 100);

    // A dynamically added observable starts emitting too.
    chain.set_utxos("a2", vec![MockChainClient::utxo("tx2", 1, 200, asset(2))]);
    handle.add_observable(observable("a2", 6));
    let (account, utxos) = next_utxo_event_for(&mut events, "a2").await;
    assert_eq!(account, AccountIndex::new(6));
    assert_eq!(utxos[0].value, 200);

    handle.stop();
}

#[tokio::test]
async fn removed_observable_stops_emitting() {
    let chain = Arc::new(MockChainClient::new());
    chain.set_utxos("gone", vec![MockChainClient::utxo("tx", 0, 1, asset(1))]);
    chain.set_utxos("kept", vec![MockChainClient::utxo("tx", 1, 2, asset(1))]);

    let (handle, mut events) = spawn_crawler(
        chain.clone(),
        fast_config(),
        vec![observable("gone", 5), observable("kept", 6)],
    );

    next_utxo_event_for(&mut events, "gone").await;
    handle.remove_observable("gone");

    // Give the worker a few poll boundaries to notice the cancellation,
    // then drain the backlog.
    tokio::time::sleep(Duration::from_millis(100)).await;
    while events.try_recv().is_ok() {}

    // Only the kept address keeps producing.
    for _ in 0..5 {
        let event = timeout(WAIT, events.recv()).await.unwrap().unwrap();
        if let CrawlerEvent::Utxos { address, .. } = event {
            assert_eq!(address, "kept");
        }
    }

    handle.stop();
}

#[tokio::test]
async fn tx_watcher_emits_once_confirmed() {
    let chain = Arc::new(MockChainClient::new());
    let (handle, mut events) = spawn_crawler(chain.clone(), fast_config(), vec![]);

    handle.watch_tx("txid-abc");
    // Unconfirmed: no event yet.
    tokio::time::sleep(Duration::from_millis(80)).await;
    assert!(events.try_recv().is_err());

    chain.confirm_tx("txid-abc");
    let event = timeout(WAIT, events.recv()).await.unwrap().unwrap();
    match event {
        CrawlerEvent::TxConfirmed { txid } => assert_eq!(txid, "txid-abc"),
        other => panic!("unexpected event: {other:?}"),
    }

    // The watcher self-removed: no further confirmation events.
    tokio::time::sleep(Duration::from_millis(100)).await;
    while let Ok(event) = events.try_recv() {
        assert!(!matches!(event, CrawlerEvent::TxConfirmed { .. }));
    }

    handle.stop();
}

#[tokio::test]
async fn one_failing_observable_does_not_halt_others() {
    let chain = Arc::new(MockChainClient::new());
    chain.set_utxos("ok", vec![MockChainClient::utxo("tx", 0, 5, asset(1))]);
    chain.set_utxos("bad", vec![MockChainClient::utxo("tx", 1, 6, asset(1))]);
    chain.fail_address("bad", true);

    let (handle, mut events) = spawn_crawler(
        chain.clone(),
        fast_config(),
        vec![observable("bad", 5), observable("ok", 6)],
    );

    // The healthy worker emits repeatedly while the other errors.
    for _ in 0..3 {
        let (_, utxos) = next_utxo_event_for(&mut events, "ok").await;
        assert_eq!(utxos[0].value, 5);
    }

    // Once the address recovers, its events flow with backoff reset.
    chain.fail_address("bad", false);
    let (_, utxos) = next_utxo_event_for(&mut events, "bad").await;
    assert_eq!(utxos[0].value, 6);

    handle.stop();
}

#[tokio::test]
async fn stop_closes_the_event_stream() {
    let chain = Arc::new(MockChainClient::new());
    chain.set_utxos("a", vec![MockChainClient::utxo("tx", 0, 1, asset(1))]);

    let (handle, mut events) = spawn_crawler(chain.clone(), fast_config(), vec![observable("a", 5)]);
    next_utxo_event_for(&mut events, "a").await;

    handle.stop();

    // Drain whatever is buffered; the channel must then close.
    let closed = timeout(WAIT, async {
        while events.recv().await.is_some() {}
    })
    .await;
    assert!(closed.is_ok(), "event stream did not close after stop");
}
