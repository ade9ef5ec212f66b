use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use common::config::ChannelConfig;
use common::{normalize_channel_id, RawChannelMessage, SignalSource};
use signals::{looks_like_signal, ParserRegistry, SignalValidator};

use crate::trader::SignalTrader;

/// Single consumer of raw channel messages: heuristic filter → the channel's
/// assigned parser → validator → trader. One consumer per process keeps
/// messages from the same channel strictly in message-id order.
pub struct SignalPipeline {
    registry: ParserRegistry,
    validator: SignalValidator,
    trader: Arc<SignalTrader>,
    /// Channel table keyed by normalized channel id.
    channels: HashMap<i64, ChannelConfig>,
    global_default_leverage: u32,
    /// Highest message id handled per channel; doubles as dedupe.
    last_message: HashMap<i64, i64>,
}

impl SignalPipeline {
    pub fn new(
        registry: ParserRegistry,
        validator: SignalValidator,
        trader: Arc<SignalTrader>,
        channels: &[ChannelConfig],
        global_default_leverage: u32,
    ) -> Self {
        let channels = channels
            .iter()
            .map(|c| (normalize_channel_id(c.id), c.clone()))
            .collect();
        Self {
            registry,
            validator,
            trader,
            channels,
            global_default_leverage,
            last_message: HashMap::new(),
        }
    }

    pub async fn run(
        mut self,
        mut messages: mpsc::Receiver<RawChannelMessage>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        info!("SignalPipeline running");
        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("SignalPipeline stopping");
                        return;
                    }
                }
                message = messages.recv() => {
                    match message {
                        Some(message) => self.handle_message(message).await,
                        None => {
                            warn!("message channel closed — SignalPipeline exiting");
                            return;
                        }
                    }
                }
            }
        }
    }

    pub async fn handle_message(&mut self, message: RawChannelMessage) {
        let channel_id = normalize_channel_id(message.channel_id);

        // Listener-level dedupe can miss across restarts; drop anything at or
        // below the last processed id.
        let last = self.last_message.entry(channel_id).or_insert(0);
        if message.message_id <= *last {
            return;
        }
        *last = message.message_id;

        let Some(channel) = self.channels.get(&channel_id).cloned() else {
            debug!(channel_id, "message from unmonitored channel ignored");
            return;
        };

        if !looks_like_signal(&message.text) {
            debug!(channel = %channel.name, message_id = message.message_id, "message failed heuristic filter");
            return;
        }

        let Some(parser) = self.registry.get(&channel.parser) else {
            warn!(channel = %channel.name, parser = %channel.parser, "no such parser registered");
            return;
        };

        let source = SignalSource {
            channel_name: channel.name.clone(),
            channel_id,
            message_id: message.message_id,
        };
        let default_leverage = channel
            .default_leverage
            .unwrap_or(self.global_default_leverage)
            .max(1);

        let signal = match parser.parse(&message.text, source, default_leverage) {
            Ok(signal) => signal,
            Err(e) => {
                warn!(channel = %channel.name, message_id = message.message_id, error = %e, "message did not parse as a signal");
                return;
            }
        };

        let signal = match self.validator.validate(signal) {
            Ok(signal) => signal,
            Err(e) => {
                warn!(channel = %channel.name, error = %e, "signal rejected by validator");
                return;
            }
        };

        info!(
            channel = %channel.name,
            symbol = %signal.symbol,
            direction = %signal.direction,
            entry = signal.entry_price,
            "signal admitted — executing"
        );
        match self.trader.execute(signal).await {
            Ok(Some(position)) => {
                debug!(position_id = %position.id, status = %position.status, "execution finished");
            }
            Ok(None) => {}
            Err(e) => warn!(error = %e, "execution failed"),
        }
    }
}
