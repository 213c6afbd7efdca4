//! Blockchain crawler.
//!
//! A supervisor task owns a dynamic set of observables and runs one worker
//! per observed address. Workers poll the [`ChainClient`] on a fixed
//! interval (staggered at startup to smooth explorer load) and push
//! [`CrawlerEvent`]s into a bounded channel; when consumers fall behind,
//! workers block on the channel rather than dropping events.
//! Transaction-confirmation watchers are one-shot workers that poll a txid
//! until it confirms, emit once and exit.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::sync::{mpsc, watch};
use tokio::time::{sleep, Instant};

use crate::ports::{ChainClient, ChainUtxo};
use crate::types::AccountIndex;

/// Minimum delay between two workers' first polls.
const START_STAGGER: Duration = Duration::from_millis(200);
/// Ceiling for the per-worker error backoff.
const MAX_BACKOFF: Duration = Duration::from_secs(30);
/// Bounded event queue: when full, workers wait for consumers.
const EVENT_CAPACITY: usize = 128;

/// An address watched on behalf of an account.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Observable {
    pub account: AccountIndex,
    pub address: String,
    pub blinding_key: Vec<u8>,
}

/// Events emitted by the crawler. `Utxos` carries the full unspent set of
/// the address at poll time; consumers reconcile, so delivery is
/// at-least-once.
#[derive(Debug, Clone)]
pub enum CrawlerEvent {
    Utxos {
        account: AccountIndex,
        address: String,
        utxos: Vec<ChainUtxo>,
    },
    TxConfirmed {
        txid: String,
    },
}

#[derive(Debug)]
enum Cmd {
    Add(Observable),
    Remove(String),
    WatchTx(String),
    Stop,
}

/// Handle for steering a running crawler. Cloneable; commands are fire and
/// forget, a stopped crawler simply ignores them.
#[derive(Clone)]
pub struct CrawlerHandle {
    cmd_tx: mpsc::UnboundedSender<Cmd>,
}

impl CrawlerHandle {
    pub fn add_observable(&self, observable: Observable) {
        let _ = self.cmd_tx.send(Cmd::Add(observable));
    }

    /// Cancels the address's worker at its next poll boundary.
    pub fn remove_observable(&self, address: impl Into<String>) {
        let _ = self.cmd_tx.send(Cmd::Remove(address.into()));
    }

    /// Enroll a one-shot confirmation watcher for the txid.
    pub fn watch_tx(&self, txid: impl Into<String>) {
        let _ = self.cmd_tx.send(Cmd::WatchTx(txid.into()));
    }

    /// Cancel every worker and close the event channel.
    pub fn stop(&self) {
        let _ = self.cmd_tx.send(Cmd::Stop);
    }
}

/// Crawler configuration; the interval normally comes from
/// `Config::crawl_interval`.
#[derive(Debug, Clone)]
pub struct CrawlerConfig {
    pub crawl_interval: Duration,
    pub start_stagger: Duration,
    pub max_backoff: Duration,
    pub event_capacity: usize,
}

impl Default for CrawlerConfig {
    fn default() -> Self {
        Self {
            crawl_interval: Duration::from_secs(1),
            start_stagger: START_STAGGER,
            max_backoff: MAX_BACKOFF,
            event_capacity: EVENT_CAPACITY,
        }
    }
}

impl CrawlerConfig {
    pub fn with_interval(crawl_interval: Duration) -> Self {
        Self {
            crawl_interval,
            ..Self::default()
        }
    }
}

/// Spawn the crawler supervisor, pre-loading it with `initial`
/// observables. Returns the steering handle and the event stream; the
/// stream ends after `stop()`.
pub fn spawn_crawler(
    chain: Arc<dyn ChainClient>,
    config: CrawlerConfig,
    initial: Vec<Observable>,
) -> (CrawlerHandle, mpsc::Receiver<CrawlerEvent>) {
    let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
    let (event_tx, event_rx) = mpsc::channel(config.event_capacity.max(1));

    for observable in initial {
        let _ = cmd_tx.send(Cmd::Add(observable));
    }

    tokio::spawn(supervisor(chain, config, cmd_rx, event_tx));

    (CrawlerHandle { cmd_tx }, event_rx)
}

async fn supervisor(
    chain: Arc<dyn ChainClient>,
    config: CrawlerConfig,
    mut cmd_rx: mpsc::UnboundedReceiver<Cmd>,
    event_tx: mpsc::Sender<CrawlerEvent>,
) {
    // Per-address cancellation plus one shutdown switch for everything.
    let mut workers: HashMap<String, watch::Sender<bool>> = HashMap::new();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut next_start = Instant::now();

    while let Some(cmd) = cmd_rx.recv().await {
        match cmd {
            Cmd::Add(observable) => {
                if workers.contains_key(&observable.address) {
                    continue;
                }
                let (cancel_tx, cancel_rx) = watch::channel(false);

                // Stagger worker start-ups so a burst of added addresses
                // does not hammer the explorer in one tick.
                let now = Instant::now();
                next_start = next_start.max(now) + config.start_stagger;
                let initial_delay = next_start - now;

                log::debug!(
                    "crawler: observing {} for account {}",
                    observable.address,
                    observable.account
                );
                workers.insert(observable.address.clone(), cancel_tx);
                tokio::spawn(address_worker(
                    chain.clone(),
                    config.clone(),
                    observable,
                    initial_delay,
                    cancel_rx,
                    shutdown_rx.clone(),
                    event_tx.clone(),
                ));
            }
            Cmd::Remove(address) => {
                if let Some(cancel) = workers.remove(&address) {
                    log::debug!("crawler: dropping observable {address}");
                    let _ = cancel.send(true);
                }
            }
            Cmd::WatchTx(txid) => {
                log::debug!("crawler: watching confirmation of {txid}");
                tokio::spawn(tx_watcher(
                    chain.clone(),
                    config.clone(),
                    txid,
                    shutdown_rx.clone(),
                    event_tx.clone(),
                ));
            }
            Cmd::Stop => break,
        }
    }

    log::info!("crawler: stopping {} workers", workers.len());
    let _ = shutdown_tx.send(true);
    for cancel in workers.values() {
        let _ = cancel.send(true);
    }
    // Dropping the supervisor's event sender lets the stream close once
    // the last worker exits.
}

async fn address_worker(
    chain: Arc<dyn ChainClient>,
    config: CrawlerConfig,
    observable: Observable,
    initial_delay: Duration,
    mut cancel: watch::Receiver<bool>,
    mut shutdown: watch::Receiver<bool>,
    event_tx: mpsc::Sender<CrawlerEvent>,
) {
    tokio::select! {
        _ = sleep(initial_delay) => {}
        _ = cancel.changed() => return,
        _ = shutdown.changed() => return,
    }

    let mut delay = config.crawl_interval;
    let mut failures: u32 = 0;

    loop {
        match chain
            .get_utxos(&observable.address, &observable.blinding_key)
            .await
        {
            Ok(utxos) => {
                failures = 0;
                delay = config.crawl_interval;
                let event = CrawlerEvent::Utxos {
                    account: observable.account,
                    address: observable.address.clone(),
                    utxos,
                };
                tokio::select! {
                    sent = event_tx.send(event) => {
                        if sent.is_err() {
                            return; // consumers are gone
                        }
                    }
                    _ = cancel.changed() => return,
                    _ = shutdown.changed() => return,
                }
            }
            Err(e) => {
                failures = failures.saturating_add(1);
                delay = backoff_delay(config.crawl_interval, failures, config.max_backoff);
                log::warn!(
                    "crawler: poll failed for {} ({e}), retrying in {delay:?}",
                    observable.address
                );
            }
        }

        tokio::select! {
            _ = sleep(delay) => {}
            _ = cancel.changed() => return,
            _ = shutdown.changed() => return,
        }
    }
}

async fn tx_watcher(
    chain: Arc<dyn ChainClient>,
    config: CrawlerConfig,
    txid: String,
    mut shutdown: watch::Receiver<bool>,
    event_tx: mpsc::Sender<CrawlerEvent>,
) {
    let mut failures: u32 = 0;

    loop {
        match chain.tx_status(&txid).await {
            Ok(status) if status.confirmed => {
                let event = CrawlerEvent::TxConfirmed { txid: txid.clone() };
                tokio::select! {
                    _ = event_tx.send(event) => {}
                    _ = shutdown.changed() => {}
                }
                return;
            }
            Ok(_) => {
                failures = 0;
            }
            Err(e) => {
                failures = failures.saturating_add(1);
                log::warn!("crawler: tx status poll failed for {txid} ({e})");
            }
        }

        let delay = backoff_delay(config.crawl_interval, failures, config.max_backoff);
        tokio::select! {
            _ = sleep(delay) => {}
            _ = shutdown.changed() => return,
        }
    }
}

/// Exponential backoff with a little jitter, capped at `max`. Zero
/// failures means the plain interval.
fn backoff_delay(base: Duration, failures: u32, max: Duration) -> Duration {
    if failures == 0 {
        return base;
    }
    let exp = failures.min(10);
    let backed_off = base.saturating_mul(1u32 << exp.min(5));
    let capped = backed_off.min(max);
    let jitter_ms = rand::thread_rng().gen_range(0..=50u64);
    (capped + Duration::from_millis(jitter_ms)).min(max)
}
