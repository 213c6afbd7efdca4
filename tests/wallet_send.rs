//! send_to_many: input selection, locking and broadcast.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::timeout;

use tidepool::crawler::{spawn_crawler, CrawlerConfig};
use tidepool::ports::ChainUtxo;
use tidepool::testing::{MockChainClient, MockPsetBuilder};
use tidepool::{
    AssetId, Config, Error, InitProgress, SoftwareKeyStore, Stores, TxOut, Unspent, WalletService,
};

const WAIT: Duration = Duration::from_secs(10);

struct Setup {
    service: WalletService,
    stores: Stores,
    chain: Arc<MockChainClient>,
    base: AssetId,
    address: String,
}

/// A ready, unlocked wallet with one receive address.
async fn setup() -> Setup {
    let config = Config::default();
    let base = config.base_asset;

    let chain = Arc::new(MockChainClient::new());
    let stores = Stores::new();
    let (crawler, _events) = spawn_crawler(chain.clone(), CrawlerConfig::default(), vec![]);
    let service = WalletService::new(
        stores.clone(),
        chain.clone(),
        Arc::new(MockPsetBuilder::new()),
        Arc::new(SoftwareKeyStore::new()),
        crawler,
        &config,
    );

    let words = vec!["alpha".to_string(), "beta".to_string(), "gamma".to_string()];
    let mut progress = service.init_wallet(words, "pass".into(), false).unwrap();
    loop {
        match timeout(WAIT, progress.recv())
            .await
            .expect("init timed out")
            .expect("progress stream ended early")
        {
            InitProgress::Done => break,
            InitProgress::Failed(e) => panic!("init failed: {e}"),
            _ => {}
        }
    }

    let address = service.wallet_address().unwrap().address;
    Setup {
        service,
        stores,
        chain,
        base,
        address,
    }
}

fn seeded(addr: &str, txid: &str, vout: u32, value: u64, asset: AssetId) -> Unspent {
    Unspent::from_chain(
        ChainUtxo {
            txid: txid.into(),
            vout,
            value,
            asset,
            script_pubkey: vec![0x00, 0x14],
            confirmed: true,
            nonce: vec![],
            range_proof: vec![],
        },
        addr,
    )
}

#[tokio::test]
async fn send_to_many_locks_inputs_and_broadcasts() {
    let s = setup().await;
    s.stores
        .transact(|tx| {
            tx.add_unspents(&s.address, vec![seeded(&s.address, "w", 0, 10_000, s.base)])
        })
        .unwrap();

    let built = s
        .service
        .send_to_many(
            vec![TxOut {
                asset: s.base,
                amount: 1_000,
                address: "ext1destination".into(),
            }],
            100,
            true,
        )
        .await
        .unwrap();
    assert!(!built.txid.is_empty());
    assert_eq!(s.chain.broadcast_count(), 1);

    // The selected input stays locked until the crawler observes the
    // spend; nothing at the address remains spendable.
    s.stores.read(|tx| {
        let addrs = vec![s.address.clone()];
        let all = tx.unspents_for_addresses(&addrs);
        assert_eq!(all.len(), 1);
        assert!(all[0].is_locked());
        assert!(!all[0].spent);
        assert!(tx.available_for_addresses(&addrs).is_empty());
    });
}

#[tokio::test]
async fn send_to_many_spends_from_every_needed_asset() {
    let s = setup().await;
    let other = AssetId::new([0xcc; 32]);
    s.stores
        .transact(|tx| {
            tx.add_unspents(
                &s.address,
                vec![
                    seeded(&s.address, "w", 0, 10_000, s.base),
                    seeded(&s.address, "w", 1, 5_000, other),
                ],
            )
        })
        .unwrap();

    // Paying out `other` still needs base inputs for the network fee, so
    // both utxos end up selected and locked.
    s.service
        .send_to_many(
            vec![TxOut {
                asset: other,
                amount: 2_000,
                address: "ext1destination".into(),
            }],
            100,
            false,
        )
        .await
        .unwrap();

    s.stores.read(|tx| {
        let addrs = vec![s.address.clone()];
        assert!(tx
            .unspents_for_addresses(&addrs)
            .iter()
            .all(|u| u.is_locked()));
    });
}

#[tokio::test]
async fn send_to_many_without_funds_is_refused() {
    let s = setup().await;
    s.stores
        .transact(|tx| {
            tx.add_unspents(&s.address, vec![seeded(&s.address, "w", 0, 1_000, s.base)])
        })
        .unwrap();

    let err = s
        .service
        .send_to_many(
            vec![TxOut {
                asset: s.base,
                amount: 10_000,
                address: "ext1destination".into(),
            }],
            100,
            true,
        )
        .await
        .unwrap_err();
    assert!(matches!(err, Error::WalletNotFunded));

    // A refused transfer leaves the wallet untouched.
    s.stores.read(|tx| {
        let addrs = vec![s.address.clone()];
        assert!(tx
            .unspents_for_addresses(&addrs)
            .iter()
            .all(|u| !u.is_locked()));
    });
    assert_eq!(s.chain.broadcast_count(), 0);
}

#[tokio::test]
async fn send_to_many_rejects_empty_outputs() {
    let s = setup().await;
    assert!(matches!(
        s.service.send_to_many(vec![], 100, false).await,
        Err(Error::PreviewAmountTooLow)
    ));
}
