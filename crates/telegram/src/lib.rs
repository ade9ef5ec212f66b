//! Telegram surfaces: the operator command bot, the channel listener that
//! feeds the signal pipeline, and the notification sender.

pub mod commands;
pub mod listener;
pub mod notify;

pub use commands::{run_command_bot, BotDeps, Command};
pub use listener::{ChannelListener, ChannelTransport, TelegramChannelTransport};
pub use notify::TelegramNotifier;
