use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    // ── Market domain ───────────────────────────────────────────────
    #[error("market account index is not valid")]
    InvalidAccount,

    #[error("market fee is too low: must be at least 1 basis point")]
    MarketFeeTooLow,

    #[error("market fee is too high: must be at most 9999 basis points")]
    MarketFeeTooHigh,

    #[error("fixed fees must be non-negative")]
    InvalidFixedFee,

    #[error("base and quote fixed fees must be set together")]
    MissingFixedFee,

    #[error("market must be funded before this operation")]
    MarketNotFunded,

    #[error("market must be closed before this operation")]
    MarketMustBeClosed,

    #[error("market is closed")]
    MarketIsClosed,

    #[error("market does not exist")]
    MarketNotExist,

    #[error("market with pluggable strategy requires both prices to be set")]
    MarketNotPriced,

    #[error("outpoints must include the base asset")]
    MarketMissingBaseAsset,

    #[error("outpoints must include one quote asset")]
    MarketMissingQuoteAsset,

    #[error("outpoints must span at most 2 distinct assets")]
    MarketTooManyAssets,

    #[error("the given asset is not the configured base asset")]
    InvalidBaseAsset,

    #[error("the given asset is not the base or quote asset of the pair")]
    InvalidQuoteAsset,

    #[error("price must be strictly positive")]
    InvalidPrice,

    #[error("a price for this timestamp already exists")]
    PriceExists,

    #[error("preview amount is too low")]
    PreviewAmountTooLow,

    #[error("preview amount is too big")]
    PreviewAmountTooBig,

    // ── Trade domain ────────────────────────────────────────────────
    #[error("trade status is not valid for the requested transition")]
    TradeStatusNotValid,

    #[error("trade has expired")]
    TradeExpired,

    #[error("trade does not exist")]
    TradeNotExist,

    // ── Wallet / vault domain ───────────────────────────────────────
    #[error("wallet is not initialized")]
    WalletNotInitialized,

    #[error("wallet is already initialized")]
    WalletAlreadyInitialized,

    #[error("wallet is syncing")]
    WalletIsSyncing,

    #[error("vault must be locked for this operation")]
    MustBeLocked,

    #[error("vault must be unlocked for this operation")]
    MustBeUnlocked,

    #[error("passphrase is not valid")]
    InvalidPassphrase,

    #[error("wallet account has no spendable funds")]
    WalletNotFunded,

    // ── Unspents ────────────────────────────────────────────────────
    #[error("unspent not found for key {0}")]
    UnspentNotFound(String),

    #[error("unspents passed to reconciliation must share one address")]
    UnspentAddressMismatch,

    // ── Infrastructure ──────────────────────────────────────────────
    #[error("transaction conflict: too many concurrent commits")]
    TxConflict,

    #[error("configuration is not valid: {0}")]
    Config(String),

    #[error("asset id is not valid: {0}")]
    InvalidAssetId(String),

    // ── External capabilities ───────────────────────────────────────
    #[error("chain client error: {0}")]
    Chain(String),

    #[error("pset builder error: {0}")]
    Pset(String),

    #[error("key store error: {0}")]
    KeyStore(String),

    #[error("swap message error: {0}")]
    Swap(String),
}

pub type Result<T> = std::result::Result<T, Error>;
