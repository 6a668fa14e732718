//! Channel worker for the notification dispatch pipeline
//!
//! Consumes the notification queue under its own consumer group and delivers
//! the messages for one channel through that channel's provider.

use notification_dispatch::{
    bootstrap::{init_tracing, load_config, wait_for_shutdown_signal},
    config::NotificationConfig,
    NotificationService,
};

use anyhow::Context;
use clap::{Arg, ArgAction, ArgMatches, Command};
use dispatch_shared::Channel;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let matches = create_cli().get_matches();

    init_tracing(matches.get_flag("json-logs"))?;

    let config = configure(&matches)?;
    config.validate_worker().map_err(|e| {
        error!("Configuration validation failed: {}", e);
        anyhow::anyhow!(e)
    })?;

    let channel = config
        .worker
        .channel
        .context("No channel given; pass --channel or set NOTIFICATION__WORKER__CHANNEL")?;

    info!(
        "Starting notification worker for channel {} as {}",
        channel, config.worker.consumer_name
    );

    let service = NotificationService::new(config)
        .await
        .context("Failed to initialize notification service")?;

    let shutdown = CancellationToken::new();
    let mut worker_task = tokio::spawn({
        let shutdown = shutdown.clone();
        let service = service.clone();
        async move { service.run_worker(channel, shutdown).await }
    });

    tokio::select! {
        _ = wait_for_shutdown_signal() => {
            info!("Shutdown signal received, stopping consumer...");
            shutdown.cancel();
        }
        result = &mut worker_task => {
            return match result {
                Ok(Ok(())) => {
                    info!("Consumer exited");
                    Ok(())
                }
                Ok(Err(e)) => Err(anyhow::anyhow!("Consumer error: {}", e)),
                Err(e) => Err(anyhow::anyhow!("Consumer task failed: {}", e)),
            };
        }
    }

    match worker_task.await {
        Ok(Ok(())) => {
            info!("Notification worker for {} stopped gracefully", channel);
            Ok(())
        }
        Ok(Err(e)) => Err(anyhow::anyhow!("Consumer error during shutdown: {}", e)),
        Err(e) => Err(anyhow::anyhow!("Consumer task error during shutdown: {}", e)),
    }
}

/// Create CLI argument parser
fn create_cli() -> Command {
    Command::new("notification-worker")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Notification dispatch worker - delivers queued notifications for one channel")
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .help("Configuration file path"),
        )
        .arg(
            Arg::new("channel")
                .long("channel")
                .value_name("CHANNEL")
                .value_parser(["email", "sms", "push"])
                .help("Channel this worker delivers"),
        )
        .arg(
            Arg::new("consumer")
                .long("consumer")
                .value_name("NAME")
                .help("Consumer name within the channel's group"),
        )
        .arg(
            Arg::new("json-logs")
                .long("json-logs")
                .action(ArgAction::SetTrue)
                .help("Emit logs as JSON"),
        )
}

/// Load configuration and apply CLI overrides
fn configure(matches: &ArgMatches) -> anyhow::Result<NotificationConfig> {
    let mut config = load_config(matches.get_one::<String>("config"))?;

    if let Some(channel) = matches.get_one::<String>("channel") {
        config.worker.channel = Some(channel.parse::<Channel>()?);
    }

    if let Some(consumer) = matches.get_one::<String>("consumer") {
        config.worker.consumer_name = consumer.clone();
    }

    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    #[serial]
    fn test_memory_queue_is_rejected() {
        std::env::set_var("NOTIFICATION__QUEUE__BACKEND", "memory");
        let matches =
            create_cli().get_matches_from(vec!["notification-worker", "--channel", "email"]);
        let config = configure(&matches);
        std::env::remove_var("NOTIFICATION__QUEUE__BACKEND");

        assert!(config.unwrap().validate_worker().is_err());
    }

    #[test]
    fn test_channel_must_be_known() {
        assert!(create_cli()
            .try_get_matches_from(vec!["notification-worker", "--channel", "fax"])
            .is_err());
    }

    #[test]
    #[serial]
    fn test_channel_override() {
        let matches = create_cli().get_matches_from(vec![
            "notification-worker",
            "--channel",
            "sms",
            "--consumer",
            "sms-1",
        ]);

        let config = configure(&matches).unwrap();
        assert_eq!(config.worker.channel, Some(Channel::Sms));
        assert_eq!(config.worker.consumer_name, "sms-1");
    }
}
