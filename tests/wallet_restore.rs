//! Wallet initialization: fresh setup, gap-limit restore, lock cycle and
//! balances.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::timeout;

use tidepool::crawler::{spawn_crawler, CrawlerConfig};
use tidepool::ports::KeyStore;
use tidepool::testing::{MockChainClient, MockPsetBuilder};
use tidepool::{
    Config, Error, InitProgress, SoftwareKeyStore, Stores, WalletService, WalletStatus,
    FEE_ACCOUNT, WALLET_ACCOUNT,
};

const WAIT: Duration = Duration::from_secs(10);
const MNEMONIC: [&str; 4] = ["alpha", "beta", "gamma", "delta"];

fn words() -> Vec<String> {
    MNEMONIC.iter().map(|w| w.to_string()).collect()
}

fn service(chain: Arc<MockChainClient>) -> (WalletService, Stores) {
    let config = Config::default();
    let stores = Stores::new();
    let (crawler, _events) = spawn_crawler(chain.clone(), CrawlerConfig::default(), vec![]);
    let service = WalletService::new(
        stores.clone(),
        chain,
        Arc::new(MockPsetBuilder::new()),
        Arc::new(SoftwareKeyStore::new()),
        crawler,
        &config,
    );
    (service, stores)
}

async fn drain_until_done(mut progress: tokio::sync::mpsc::Receiver<InitProgress>) {
    loop {
        match timeout(WAIT, progress.recv())
            .await
            .expect("init timed out")
            .expect("progress stream ended early")
        {
            InitProgress::Done => return,
            InitProgress::Failed(e) => panic!("init failed: {e}"),
            _ => {}
        }
    }
}

#[tokio::test]
async fn fresh_init_reaches_ready_unlocked() {
    let chain = Arc::new(MockChainClient::new());
    let (service, stores) = service(chain);
    assert_eq!(service.status(), WalletStatus::Uninitialized);
    assert!(matches!(
        service.unlock_wallet("x"),
        Err(Error::WalletNotInitialized)
    ));

    let progress = service.init_wallet(words(), "pass".into(), false).unwrap();
    drain_until_done(progress).await;

    assert_eq!(service.status(), WalletStatus::Ready { locked: false });
    stores.read(|tx| {
        let vault = tx.vault().unwrap();
        assert_eq!(vault.account(FEE_ACCOUNT).unwrap().next_external_index(), 1);
        assert_eq!(
            vault.account(WALLET_ACCOUNT).unwrap().next_external_index(),
            1
        );
    });

    // A second initialization is refused.
    assert!(matches!(
        service.init_wallet(words(), "pass".into(), false),
        Err(Error::WalletAlreadyInitialized)
    ));
}

#[tokio::test]
async fn restore_walks_the_gap_limit() {
    let chain = Arc::new(MockChainClient::new());

    // Pre-compute the first five external wallet addresses for the same
    // mnemonic and give them on-chain history.
    let keystore = SoftwareKeyStore::new();
    let mnemonic = words().join(" ");
    for index in 0..5u32 {
        let derived = keystore
            .derive_child(&mnemonic, WALLET_ACCOUNT.value(), 0, index)
            .unwrap();
        chain.set_history(&derived.address);
    }

    let (service, stores) = service(chain);
    let progress = service.init_wallet(words(), "pass".into(), true).unwrap();
    drain_until_done(progress).await;

    stores.read(|tx| {
        let vault = tx.vault().unwrap();
        let wallet_account = vault.account(WALLET_ACCOUNT).unwrap();
        assert_eq!(wallet_account.next_external_index(), 5);
        assert_eq!(wallet_account.next_internal_index(), 0);
        // No history anywhere else.
        assert_eq!(vault.account(FEE_ACCOUNT).unwrap().next_external_index(), 0);
    });

    // The next receive address continues where the chain left off.
    let info = service.wallet_address().unwrap();
    assert!(info.derivation_path.ends_with("'/0/5"));
}

#[tokio::test]
async fn lock_cycle_and_password_change() {
    let chain = Arc::new(MockChainClient::new());
    let (service, _stores) = service(chain);
    let progress = service.init_wallet(words(), "pass".into(), false).unwrap();
    drain_until_done(progress).await;

    service.lock_wallet().unwrap();
    assert_eq!(service.status(), WalletStatus::Ready { locked: true });

    // Deriving while locked is refused.
    assert!(matches!(
        service.wallet_address(),
        Err(Error::MustBeUnlocked)
    ));

    service.change_password("pass", "better").unwrap();
    assert!(matches!(
        service.unlock_wallet("pass"),
        Err(Error::InvalidPassphrase)
    ));
    service.unlock_wallet("better").unwrap();
    assert_eq!(service.status(), WalletStatus::Ready { locked: false });
    service.wallet_address().unwrap();
}

#[tokio::test]
async fn restore_discovers_market_accounts() {
    let chain = Arc::new(MockChainClient::new());

    let keystore = SoftwareKeyStore::new();
    let mnemonic = words().join(" ");
    // History on the first market account (index 5) only.
    let derived = keystore.derive_child(&mnemonic, 5, 0, 0).unwrap();
    chain.set_history(&derived.address);

    let (service, stores) = service(chain);
    let progress = service.init_wallet(words(), "pass".into(), true).unwrap();
    drain_until_done(progress).await;

    stores.read(|tx| {
        let vault = tx.vault().unwrap();
        let market = vault
            .account(tidepool::MARKET_ACCOUNT_START)
            .expect("market account restored");
        assert_eq!(market.next_external_index(), 1);
        // Probing stopped at the first account with no history.
        assert!(vault
            .account(tidepool::MARKET_ACCOUNT_START.next())
            .map(|a| a.next_external_index() == 0)
            .unwrap_or(true));
    });
}

#[tokio::test]
async fn wallet_balance_groups_by_asset() {
    use tidepool::ports::ChainUtxo;
    use tidepool::{AssetId, Unspent};

    let chain = Arc::new(MockChainClient::new());
    let (service, stores) = service(chain);
    let progress = service.init_wallet(words(), "pass".into(), false).unwrap();
    drain_until_done(progress).await;

    let info = service.wallet_address().unwrap();
    let asset = AssetId::new([7; 32]);
    stores
        .transact(|tx| {
            tx.add_unspents(
                &info.address,
                vec![Unspent::from_chain(
                    ChainUtxo {
                        txid: "t".into(),
                        vout: 0,
                        value: 1234,
                        asset,
                        script_pubkey: vec![],
                        confirmed: true,
                        nonce: vec![],
                        range_proof: vec![],
                    },
                    &info.address,
                )],
            )
        })
        .unwrap();

    let balances = service.wallet_balance().unwrap();
    assert_eq!(balances[&asset].confirmed, 1234);
}
