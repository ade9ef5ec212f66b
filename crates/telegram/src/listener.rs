use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use teloxide::prelude::*;
use teloxide::types::{AllowedUpdate, Recipient, UpdateKind};
use tokio::sync::{broadcast, mpsc, watch, RwLock};
use tracing::{debug, info, warn};

use common::config::ChannelConfig;
use common::{normalize_channel_id, Error, RawChannelMessage, Result};

/// Messages kept per channel for catch-up queries.
const RECENT_CAP: usize = 256;

/// Capability bundle over the broadcast-channel side of the chat transport:
/// push subscription, catch-up fetch, and name resolution.
#[async_trait]
pub trait ChannelTransport: Send + Sync {
    /// Resolve a channel name (e.g. `@signals`) to its id.
    async fn resolve_channel(&self, name: &str) -> Result<i64>;

    /// Messages for a channel with id greater than `after_message_id`,
    /// oldest first.
    async fn messages_since(
        &self,
        channel_id: i64,
        after_message_id: i64,
    ) -> Result<Vec<RawChannelMessage>>;

    fn subscribe(&self) -> broadcast::Receiver<RawChannelMessage>;
}

/// Teloxide-backed transport. One long-poll loop receives channel posts,
/// fans them out on a broadcast channel and keeps a bounded per-channel
/// buffer that answers `messages_since` for the catch-up timer.
pub struct TelegramChannelTransport {
    bot: Bot,
    tx: broadcast::Sender<RawChannelMessage>,
    recent: Arc<RwLock<HashMap<i64, VecDeque<RawChannelMessage>>>>,
    base_delay: Duration,
    max_delay: Duration,
}

impl TelegramChannelTransport {
    pub fn new(token: &str, base_delay: Duration, max_delay: Duration) -> Arc<Self> {
        let (tx, _) = broadcast::channel(1024);
        Arc::new(Self {
            bot: Bot::new(token),
            tx,
            recent: Arc::new(RwLock::new(HashMap::new())),
            base_delay,
            max_delay,
        })
    }

    /// Long-poll loop. Transient errors back off exponentially within the
    /// configured bounds; a successful poll resets the delay.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        info!("Telegram channel transport polling");
        let mut offset: i32 = 0;
        let mut delay = self.base_delay;

        loop {
            if *shutdown.borrow() {
                info!("channel transport stopping");
                return;
            }
            let poll = self
                .bot
                .get_updates()
                .offset(offset)
                .timeout(25)
                .allowed_updates(vec![AllowedUpdate::ChannelPost])
                .send();

            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("channel transport stopping");
                        return;
                    }
                }
                updates = poll => {
                    match updates {
                        Ok(updates) => {
                            delay = self.base_delay;
                            for update in updates {
                                offset = offset.max(update.id + 1);
                                if let UpdateKind::ChannelPost(post) = update.kind {
                                    self.ingest(post).await;
                                }
                            }
                        }
                        Err(e) => {
                            warn!(error = %e, delay = ?delay, "channel poll failed, backing off");
                            tokio::time::sleep(delay).await;
                            delay = (delay * 2).min(self.max_delay);
                        }
                    }
                }
            }
        }
    }

    async fn ingest(&self, post: teloxide::types::Message) {
        let Some(text) = post.text() else { return };
        let message = RawChannelMessage {
            channel_name: post.chat.title().unwrap_or_default().to_string(),
            channel_id: normalize_channel_id(post.chat.id.0),
            message_id: post.id.0 as i64,
            text: text.to_string(),
        };
        debug!(
            channel = %message.channel_name,
            message_id = message.message_id,
            "channel post received"
        );

        let mut recent = self.recent.write().await;
        let buffer = recent.entry(message.channel_id).or_default();
        // Poll redelivery after an offset reset must not duplicate.
        if buffer.iter().any(|m| m.message_id == message.message_id) {
            return;
        }
        buffer.push_back(message.clone());
        while buffer.len() > RECENT_CAP {
            buffer.pop_front();
        }
        drop(recent);

        let _ = self.tx.send(message);
    }
}

#[async_trait]
impl ChannelTransport for TelegramChannelTransport {
    async fn resolve_channel(&self, name: &str) -> Result<i64> {
        let handle = if name.starts_with('@') {
            name.to_string()
        } else {
            format!("@{name}")
        };
        let chat = self
            .bot
            .get_chat(Recipient::ChannelUsername(handle))
            .send()
            .await
            .map_err(|e| Error::Telegram(format!("cannot resolve channel '{name}': {e}")))?;
        Ok(normalize_channel_id(chat.id.0))
    }

    async fn messages_since(
        &self,
        channel_id: i64,
        after_message_id: i64,
    ) -> Result<Vec<RawChannelMessage>> {
        let recent = self.recent.read().await;
        Ok(recent
            .get(&normalize_channel_id(channel_id))
            .map(|buffer| {
                buffer
                    .iter()
                    .filter(|m| m.message_id > after_message_id)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    fn subscribe(&self) -> broadcast::Receiver<RawChannelMessage> {
        self.tx.subscribe()
    }
}

/// Bridges the transport to the signal pipeline: forwards pushed posts as
/// they arrive and additionally polls every `poll_interval` for message ids
/// the push path missed. Emission per channel is strictly increasing in
/// message id, which the pipeline relies on.
pub struct ChannelListener {
    transport: Arc<dyn ChannelTransport>,
    channels: Vec<ChannelConfig>,
    out: mpsc::Sender<RawChannelMessage>,
    poll_interval: Duration,
    last_seen: HashMap<i64, i64>,
}

impl ChannelListener {
    pub fn new(
        transport: Arc<dyn ChannelTransport>,
        channels: Vec<ChannelConfig>,
        out: mpsc::Sender<RawChannelMessage>,
        poll_interval: Duration,
    ) -> Self {
        Self {
            transport,
            channels,
            out,
            poll_interval,
            last_seen: HashMap::new(),
        }
    }

    fn monitored(&self, channel_id: i64) -> bool {
        self.channels
            .iter()
            .any(|c| normalize_channel_id(c.id) == channel_id)
    }

    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        info!(channels = self.channels.len(), "ChannelListener running");
        let mut pushes = self.transport.subscribe();
        let mut timer = tokio::time::interval(self.poll_interval);
        timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("ChannelListener stopping");
                        return;
                    }
                }
                push = pushes.recv() => {
                    match push {
                        Ok(message) => {
                            if self.forward(message).await.is_err() {
                                return;
                            }
                        }
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            warn!(dropped = n, "listener lagged — catch-up poll will recover");
                        }
                        Err(broadcast::error::RecvError::Closed) => {
                            warn!("transport broadcast closed — ChannelListener exiting");
                            return;
                        }
                    }
                }
                _ = timer.tick() => {
                    if self.catch_up().await.is_err() {
                        return;
                    }
                }
            }
        }
    }

    /// Fetch anything the push path missed, per channel, in id order.
    async fn catch_up(&mut self) -> std::result::Result<(), ()> {
        for channel in self.channels.clone() {
            let channel_id = normalize_channel_id(channel.id);
            let after = self.last_seen.get(&channel_id).copied().unwrap_or(0);
            match self.transport.messages_since(channel_id, after).await {
                Ok(mut messages) => {
                    messages.sort_by_key(|m| m.message_id);
                    for message in messages {
                        self.forward(message).await?;
                    }
                }
                Err(e) => {
                    warn!(channel = %channel.name, error = %e, "catch-up poll failed");
                }
            }
        }
        Ok(())
    }

    async fn forward(&mut self, message: RawChannelMessage) -> std::result::Result<(), ()> {
        if !self.monitored(message.channel_id) {
            return Ok(());
        }
        let last = self.last_seen.entry(message.channel_id).or_insert(0);
        if message.message_id <= *last {
            return Ok(());
        }
        *last = message.message_id;
        self.out.send(message).await.map_err(|_| {
            warn!("pipeline channel closed — ChannelListener exiting");
        })
    }
}
