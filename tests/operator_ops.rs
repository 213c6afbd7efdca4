//! Operator control-plane flows: deposits, open/close, updates, withdraw
//! and the fee-account balance.

use std::sync::Arc;

use rust_decimal::Decimal;

use tidepool::crawler::{spawn_crawler, CrawlerConfig};
use tidepool::ports::ChainUtxo;
use tidepool::testing::{MockChainClient, MockPsetBuilder};
use tidepool::{
    AssetId, Config, Error, OperatorOps, SoftwareKeyStore, Stores, Strategy, Unspent, Vault,
    WithdrawMarketRequest, FEE_ACCOUNT, MARKET_ACCOUNT_START,
};

const QUOTE: &str = "aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa";

struct Setup {
    ops: OperatorOps,
    stores: Stores,
    chain: Arc<MockChainClient>,
    base: AssetId,
    quote: AssetId,
}

fn setup_with_vault() -> Setup {
    let config = Config::default();
    let keystore = Arc::new(SoftwareKeyStore::new());
    let vault = Vault::new(keystore.as_ref(), "alpha beta gamma", "pass").unwrap();

    let stores = Stores::new();
    stores
        .transact(|tx| {
            tx.set_vault(vault.clone());
            Ok(())
        })
        .unwrap();

    let chain = Arc::new(MockChainClient::new());
    let (crawler, _events) = spawn_crawler(chain.clone(), CrawlerConfig::default(), vec![]);
    let ops = OperatorOps::new(
        stores.clone(),
        chain.clone(),
        Arc::new(MockPsetBuilder::new()),
        keystore,
        crawler,
        &config,
    );

    Setup {
        ops,
        stores,
        chain,
        base: config.base_asset,
        quote: QUOTE.parse().unwrap(),
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
async fn deposit_allocates_market_accounts() {
    let s = setup_with_vault();

    // First deposit with an unknown quote asset allocates account 5.
    let first = s.ops.deposit_market(None).unwrap();
    assert_eq!(first.account, MARKET_ACCOUNT_START);

    // A deposit for a still-unfunded market cannot be matched by asset,
    // so it allocates the next account.
    let second = s.ops.deposit_market(None).unwrap();
    assert_eq!(second.account, MARKET_ACCOUNT_START.next());

    s.stores.read(|tx| {
        assert_eq!(tx.markets().len(), 2);
    });
}

#[tokio::test]
async fn open_close_and_update_market() {
    let s = setup_with_vault();
    let deposit = s.ops.deposit_market(None).unwrap();

    // Opening an unfunded account fails until a deposit lands.
    assert!(matches!(
        s.ops.open_market(&s.base, &s.quote),
        Err(Error::WalletNotFunded)
    ));

    s.stores
        .transact(|tx| {
            tx.add_unspents(
                &deposit.address,
                vec![
                    seeded(&deposit.address, "f", 0, 100_000, s.base),
                    seeded(&deposit.address, "f", 1, 4_000_000_000, s.quote),
                ],
            )
        })
        .unwrap();

    // Wrong base asset is refused outright.
    assert!(matches!(
        s.ops.open_market(&s.quote, &s.quote),
        Err(Error::InvalidBaseAsset)
    ));

    s.ops.open_market(&s.base, &s.quote).unwrap();
    let market = s
        .stores
        .read(|tx| tx.market_by_quote_asset(&s.quote))
        .unwrap();
    assert!(market.is_tradable());
    assert_eq!(market.base_asset(), Some(s.base));

    // Mutations require the market to be closed.
    assert!(matches!(
        s.ops.update_market_fee(&s.quote, 100),
        Err(Error::MarketMustBeClosed)
    ));

    s.ops.close_market(&s.base, &s.quote).unwrap();
    let updated = s.ops.update_market_fee(&s.quote, 100).unwrap();
    assert_eq!(updated.fee_basis_points(), 100);
    s.ops.update_market_fixed_fee(&s.quote, 650, 20_000_000).unwrap();

    // Pluggable markets need prices before reopening.
    s.ops
        .update_market_strategy(&s.quote, Strategy::Pluggable)
        .unwrap();
    assert!(matches!(
        s.ops.open_market(&s.base, &s.quote),
        Err(Error::MarketNotPriced)
    ));
    s.ops
        .update_market_price(
            &s.quote,
            "0.000028571429".parse().unwrap(),
            Decimal::from(35_000),
        )
        .unwrap();
    s.ops.open_market(&s.base, &s.quote).unwrap();

    // Further deposits for this quote asset reuse its account.
    let again = s.ops.deposit_market(Some(s.quote)).unwrap();
    assert_eq!(again.account, MARKET_ACCOUNT_START);
}

#[tokio::test]
async fn withdraw_market_funds_builds_and_broadcasts() {
    let s = setup_with_vault();
    let deposit = s.ops.deposit_market(None).unwrap();
    let fee_deposit = s.ops.deposit_fee_account().unwrap();
    assert_eq!(fee_deposit.account, FEE_ACCOUNT);

    s.stores
        .transact(|tx| {
            tx.add_unspents(
                &deposit.address,
                vec![
                    seeded(&deposit.address, "f", 0, 100_000, s.base),
                    seeded(&deposit.address, "f", 1, 4_000_000_000, s.quote),
                ],
            )?;
            tx.add_unspents(
                &fee_deposit.address,
                vec![seeded(&fee_deposit.address, "g", 0, 50_000, s.base)],
            )
        })
        .unwrap();
    s.ops.open_market(&s.base, &s.quote).unwrap();

    let built = s
        .ops
        .withdraw_market_funds(WithdrawMarketRequest {
            quote_asset: s.quote,
            base_amount: 10_000,
            quote_amount: 1_000_000,
            address: "ext1destination".into(),
            millisats_per_byte: 100,
            push: true,
        })
        .await
        .unwrap();
    assert!(!built.txid.is_empty());
    assert_eq!(s.chain.broadcast_count(), 1);

    // The selected inputs stay locked until the crawler reconciles the
    // spend, so no concurrent flow can double-select them.
    s.stores.read(|tx| {
        let addrs = vec![deposit.address.clone(), fee_deposit.address.clone()];
        assert!(tx
            .unspents_for_addresses(&addrs)
            .iter()
            .all(|u| u.is_locked()));
        assert!(tx.available_for_addresses(&addrs).is_empty());
    });

    // Without spendable funds the withdrawal is refused.
    let err = s
        .ops
        .withdraw_market_funds(WithdrawMarketRequest {
            quote_asset: s.quote,
            base_amount: 10_000_000,
            quote_amount: 0,
            address: "ext1destination".into(),
            millisats_per_byte: 100,
            push: false,
        })
        .await
        .unwrap_err();
    assert!(matches!(err, Error::WalletNotFunded));
}

#[tokio::test]
async fn fee_account_balance_reports_confirmed_base() {
    let s = setup_with_vault();
    let fee_deposit = s.ops.deposit_fee_account().unwrap();

    assert_eq!(s.ops.fee_account_balance().unwrap(), 0);

    s.stores
        .transact(|tx| {
            tx.add_unspents(
                &fee_deposit.address,
                vec![
                    seeded(&fee_deposit.address, "g", 0, 700, s.base),
                    seeded(&fee_deposit.address, "g", 1, 800, s.quote),
                ],
            )
        })
        .unwrap();

    // Only the base asset counts.
    assert_eq!(s.ops.fee_account_balance().unwrap(), 700);
}

#[tokio::test]
async fn list_swaps_is_empty_without_trades() {
    let s = setup_with_vault();
    assert!(s.ops.list_swaps().is_empty());
    assert!(s.ops.list_markets().is_empty());
}
