use std::sync::Arc;
use std::time::Duration;

use teloxide::{dispatching::UpdateHandler, prelude::*, utils::command::BotCommands};
use tokio::sync::{mpsc, oneshot};
use tracing::{info, warn};

use common::OperatorCommand;

type HandlerResult = Result<(), Box<dyn std::error::Error + Send + Sync>>;

const REPLY_TIMEOUT: Duration = Duration::from_secs(30);

/// Dependencies injected into every handler via `dptree`.
#[derive(Clone)]
pub struct BotDeps {
    pub command_tx: mpsc::Sender<OperatorCommand>,
    /// The single chat authorized to issue commands.
    pub command_chat_id: i64,
    pub authorized_user_ids: Arc<Vec<i64>>,
}

/// Operator commands exposed over Telegram.
#[derive(BotCommands, Clone)]
#[command(rename_rule = "lowercase", description = "SignalBot commands:")]
pub enum Command {
    #[command(description = "Mode, balance, open positions, PnL, cooldown")]
    Status,
    #[command(description = "List open positions with live PnL")]
    Positions,
    #[command(description = "Stop accepting new signals (positions stay managed)")]
    Pause,
    #[command(description = "Resume automatic trading")]
    Resume,
    #[command(description = "Close one symbol: /close BTCUSDT")]
    Close { symbol: String },
    #[command(description = "Close every open position")]
    CloseAll,
    #[command(description = "Emergency stop: halt and close everything")]
    Stop,
    #[command(description = "Clear the cooldown clock")]
    ResetCooldown,
    #[command(description = "Show this help")]
    Help,
}

/// Run the command bot forever. The dispatcher long-polls; if it ever exits
/// it is restarted with exponential backoff bounded by the given delays.
pub async fn run_command_bot(
    token: String,
    deps: BotDeps,
    base_delay: Duration,
    max_delay: Duration,
) {
    let mut delay = base_delay;
    loop {
        let bot = Bot::new(token.clone());
        info!("Telegram command bot starting (long-polling)");
        Dispatcher::builder(bot, schema())
            .dependencies(dptree::deps![Arc::new(deps.clone())])
            .build()
            .dispatch()
            .await;
        warn!(delay = ?delay, "command bot dispatcher exited, restarting");
        tokio::time::sleep(delay).await;
        delay = (delay * 2).min(max_delay);
    }
}

fn schema() -> UpdateHandler<Box<dyn std::error::Error + Send + Sync>> {
    use dptree::case;

    let command_handler = teloxide::filter_command::<Command, _>()
        .branch(case![Command::Status].endpoint(handle_status))
        .branch(case![Command::Positions].endpoint(handle_positions))
        .branch(case![Command::Pause].endpoint(handle_pause))
        .branch(case![Command::Resume].endpoint(handle_resume))
        .branch(case![Command::Close { symbol }].endpoint(handle_close))
        .branch(case![Command::CloseAll].endpoint(handle_close_all))
        .branch(case![Command::Stop].endpoint(handle_stop))
        .branch(case![Command::ResetCooldown].endpoint(handle_reset_cooldown))
        .branch(case![Command::Help].endpoint(handle_help));

    Update::filter_message()
        .branch(dptree::filter(is_unauthorized).endpoint(handle_unauthorized))
        .branch(command_handler)
        .branch(dptree::entry().endpoint(handle_unknown))
}

fn is_unauthorized(msg: Message, deps: Arc<BotDeps>) -> bool {
    let chat_ok = msg.chat.id.0 == deps.command_chat_id;
    let user_ok = msg
        .from()
        .map(|u| deps.authorized_user_ids.contains(&(u.id.0 as i64)))
        .unwrap_or(false);
    !(chat_ok && user_ok)
}

/// Unauthorized senders get a refusal and a log line, nothing else.
async fn handle_unauthorized(bot: Bot, msg: Message) -> HandlerResult {
    warn!(
        chat_id = msg.chat.id.0,
        user_id = msg.from().map(|u| u.id.0).unwrap_or(0),
        "unauthorized command attempt"
    );
    bot.send_message(msg.chat.id, "You are not authorized to control this bot.")
        .await?;
    Ok(())
}

async fn handle_unknown(bot: Bot, msg: Message) -> HandlerResult {
    if msg.text().map(|t| t.starts_with('/')).unwrap_or(false) {
        bot.send_message(
            msg.chat.id,
            format!("Unknown command.\n{}", Command::descriptions()),
        )
        .await?;
    }
    Ok(())
}

/// Forward a command to the engine and relay its reply.
async fn relay(
    bot: &Bot,
    msg: &Message,
    deps: &BotDeps,
    build: impl FnOnce(oneshot::Sender<String>) -> OperatorCommand,
) -> HandlerResult {
    let (reply_tx, reply_rx) = oneshot::channel();
    if deps.command_tx.send(build(reply_tx)).await.is_err() {
        bot.send_message(msg.chat.id, "Engine is not running.").await?;
        return Ok(());
    }
    let text = match tokio::time::timeout(REPLY_TIMEOUT, reply_rx).await {
        Ok(Ok(text)) => text,
        _ => "No reply from the engine (still working?).".to_string(),
    };
    bot.send_message(msg.chat.id, text).await?;
    Ok(())
}

async fn handle_status(bot: Bot, msg: Message, deps: Arc<BotDeps>) -> HandlerResult {
    relay(&bot, &msg, &deps, |reply| OperatorCommand::Status { reply }).await
}

async fn handle_positions(bot: Bot, msg: Message, deps: Arc<BotDeps>) -> HandlerResult {
    relay(&bot, &msg, &deps, |reply| OperatorCommand::Positions { reply }).await
}

async fn handle_pause(bot: Bot, msg: Message, deps: Arc<BotDeps>) -> HandlerResult {
    relay(&bot, &msg, &deps, |reply| OperatorCommand::Pause { reply }).await
}

async fn handle_resume(bot: Bot, msg: Message, deps: Arc<BotDeps>) -> HandlerResult {
    relay(&bot, &msg, &deps, |reply| OperatorCommand::Resume { reply }).await
}

async fn handle_close(
    bot: Bot,
    msg: Message,
    symbol: String,
    deps: Arc<BotDeps>,
) -> HandlerResult {
    if symbol.trim().is_empty() {
        bot.send_message(msg.chat.id, "Usage: /close BTCUSDT").await?;
        return Ok(());
    }
    relay(&bot, &msg, &deps, |reply| OperatorCommand::Close {
        symbol: symbol.trim().to_string(),
        reply,
    })
    .await
}

async fn handle_close_all(bot: Bot, msg: Message, deps: Arc<BotDeps>) -> HandlerResult {
    relay(&bot, &msg, &deps, |reply| OperatorCommand::CloseAll { reply }).await
}

async fn handle_stop(bot: Bot, msg: Message, deps: Arc<BotDeps>) -> HandlerResult {
    relay(&bot, &msg, &deps, |reply| OperatorCommand::EmergencyStop { reply }).await
}

async fn handle_reset_cooldown(bot: Bot, msg: Message, deps: Arc<BotDeps>) -> HandlerResult {
    relay(&bot, &msg, &deps, |reply| OperatorCommand::ResetCooldown { reply }).await
}

async fn handle_help(bot: Bot, msg: Message) -> HandlerResult {
    bot.send_message(msg.chat.id, Command::descriptions().to_string())
        .await?;
    Ok(())
}
