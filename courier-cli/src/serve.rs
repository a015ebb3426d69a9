use courier_http::{BridgeConfigBuilder, BridgeServer, shutdown_signal};
use std::process::ExitCode;
use tracing::info;

use crate::{CliError, ServeArgs};

/// Build the bridge configuration: environment first, then flags
pub fn config_builder(args: ServeArgs) -> Result<BridgeConfigBuilder, CliError> {
    let mut builder = BridgeConfigBuilder::from_env()?;

    if let Some(addr) = args.bind {
        builder = builder.bind_addr(addr);
    }
    if let Some(channel) = args.channel {
        builder = builder.channel(channel);
    }
    if let Some(url) = args.redis_url {
        builder = builder.redis_url(url);
    }
    if let Some(timeout) = args.handler_timeout_ms {
        builder = builder.handler_timeout_ms(timeout);
    }
    if args.no_cors {
        builder = builder.enable_cors(false);
    }
    for target in args.forward {
        builder = builder.forward_target(target);
    }

    Ok(builder)
}

pub async fn run(args: ServeArgs) -> Result<ExitCode, CliError> {
    let config = config_builder(args)?.build()?;
    info!(
        bind = %config.bind_addr,
        channel = %config.channel,
        forward_targets = config.forward_targets.len(),
        "Starting courier bridge"
    );

    let server = BridgeServer::connect(config).await?;
    let listener = server.bind().await?;
    server.serve(listener, shutdown_signal()).await?;

    Ok(ExitCode::SUCCESS)
}
