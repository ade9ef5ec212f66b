use std::sync::Arc;

use tokio::sync::broadcast;
use tracing::info;

use common::config::ExchangeConfig;
use common::{Error, FuturesMarketData, FuturesOrderExecutor, OrderUpdate, Result, Venue};

use crate::binance::{BinanceFutures, BinanceUserStream};
use crate::bitget::{BitgetFutures, BitgetPrivateStream};
use crate::bybit::{BybitFutures, BybitPrivateStream};

/// One connected venue: the two REST surfaces plus the order-update
/// broadcast fed by the venue's private stream task.
pub struct ExchangeHandle {
    pub venue: Venue,
    pub market: Arc<dyn FuturesMarketData>,
    pub orders: Arc<dyn FuturesOrderExecutor>,
    pub updates: broadcast::Sender<OrderUpdate>,
}

impl ExchangeHandle {
    pub fn subscribe_updates(&self) -> broadcast::Receiver<OrderUpdate> {
        self.updates.subscribe()
    }
}

/// Build the configured venue's clients and spawn its private update stream.
/// This is the only place in the codebase that matches on `Venue`.
pub fn connect(config: &ExchangeConfig) -> Result<ExchangeHandle> {
    let (update_tx, _) = broadcast::channel(1024);
    info!(venue = %config.venue, testnet = config.testnet, "connecting exchange");

    let handle = match config.venue {
        Venue::Binance => {
            let client = Arc::new(BinanceFutures::new(
                &config.api_key,
                &config.api_secret,
                config.testnet,
            ));
            let stream =
                BinanceUserStream::new(&config.api_key, config.testnet, update_tx.clone());
            tokio::spawn(stream.run());
            ExchangeHandle {
                venue: Venue::Binance,
                market: client.clone(),
                orders: client,
                updates: update_tx,
            }
        }
        Venue::Bybit => {
            let client = Arc::new(BybitFutures::new(
                &config.api_key,
                &config.api_secret,
                config.testnet,
            ));
            let stream = BybitPrivateStream::new(
                &config.api_key,
                &config.api_secret,
                config.testnet,
                update_tx.clone(),
            );
            tokio::spawn(stream.run());
            ExchangeHandle {
                venue: Venue::Bybit,
                market: client.clone(),
                orders: client,
                updates: update_tx,
            }
        }
        Venue::Bitget => {
            let passphrase = config
                .passphrase
                .clone()
                .ok_or_else(|| Error::Config("bitget requires exchange.passphrase".into()))?;
            let client = Arc::new(BitgetFutures::new(
                &config.api_key,
                &config.api_secret,
                &passphrase,
                config.testnet,
            ));
            let stream = BitgetPrivateStream::new(
                &config.api_key,
                &config.api_secret,
                &passphrase,
                update_tx.clone(),
            );
            tokio::spawn(stream.run());
            ExchangeHandle {
                venue: Venue::Bitget,
                market: client.clone(),
                orders: client,
                updates: update_tx,
            }
        }
    };
    Ok(handle)
}
