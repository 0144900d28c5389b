use std::sync::Arc;

use futures::StreamExt;

use funnel_bot::channels::{Notifier, TelegramChannel, TelegramOperatorSink};
use funnel_bot::config::BotConfig;
use funnel_bot::content;
use funnel_bot::funnel::{default_table, FunnelMachine};
use funnel_bot::reminder::{spawn_sweep_task, ReminderScheduler};
use funnel_bot::store::{LibSqlBackend, Store};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let config = BotConfig::from_env().unwrap_or_else(|e| {
        eprintln!("Error: {e}");
        eprintln!("  export FUNNEL_BOT_TOKEN=123:ABC...");
        eprintln!("  export FUNNEL_OPERATOR_CHAT_ID=123456789");
        std::process::exit(1);
    });

    eprintln!("🤖 Funnel Bot v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Database: {}", config.db_path.display());
    eprintln!(
        "   Reminders: {}h / {}h, sweep every {}s",
        config.reminders.first_nudge_hours,
        config.reminders.second_nudge_hours,
        config.reminders.sweep_interval.as_secs()
    );

    // ── Database ─────────────────────────────────────────────────────────
    let store: Arc<dyn Store> = Arc::new(
        LibSqlBackend::new_local(&config.db_path)
            .await
            .unwrap_or_else(|e| {
                eprintln!(
                    "Error: Failed to open database at {}: {e}",
                    config.db_path.display()
                );
                std::process::exit(1);
            }),
    );

    // ── Telegram channel ─────────────────────────────────────────────────
    let channel = Arc::new(TelegramChannel::new(config.bot_token.clone()));
    let mut events = channel.start().await?;
    let notifier: Arc<dyn Notifier> = channel.clone();
    let operator = Arc::new(TelegramOperatorSink::new(
        Arc::clone(&channel),
        config.operator_chat_id.clone(),
    ));

    // ── Reminder sweep ───────────────────────────────────────────────────
    let scheduler = Arc::new(ReminderScheduler::new(
        Arc::clone(&store),
        Arc::clone(&notifier),
        config.reminders.clone(),
    ));
    let _sweep_handle = spawn_sweep_task(scheduler, config.reminders.sweep_interval);

    // ── Funnel ───────────────────────────────────────────────────────────
    let machine = FunnelMachine::new(
        Arc::clone(&store),
        Arc::clone(&notifier),
        operator,
        default_table(),
        config.funnel.clone(),
        &config.reminders,
    );

    tracing::info!("Funnel bot started");

    while let Some(event) = events.next().await {
        let subject_id = event.subject.subject_id.clone();
        if let Err(e) = machine.handle_event(&event).await {
            tracing::error!(subject_id, error = %e, "Event handling failed");
            if !subject_id.trim().is_empty() {
                if let Err(e) = notifier.send(&subject_id, &content::apology()).await {
                    tracing::warn!(subject_id, error = %e, "Failed to send apology");
                }
            }
        }
    }

    tracing::info!("Event stream ended, shutting down");
    Ok(())
}
