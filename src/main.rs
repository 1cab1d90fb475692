use std::sync::Arc;

use ts_chain::control::{ControlServer, parse_log_level, send_command};
use ts_chain::{Outcome, Pipeline, PluginRegistry};

mod cli;

use cli::{Commands, ControlArgs, RunArgs};

/// Exit code for a command line or control failure.
const EXIT_FAILURE: i32 = 1;

#[tokio::main]
async fn main() -> ! {
    let cli = cli::parse(std::env::args().collect());

    env_logger::Builder::from_default_env()
        .filter_level(log::LevelFilter::Trace)
        .init();
    match parse_log_level(&cli.log_level) {
        Ok(level) => log::set_max_level(level),
        Err(e) => {
            eprintln!("{}", e);
            std::process::exit(EXIT_FAILURE);
        }
    }

    let code = match cli.command {
        Commands::Run(args) => match run(args).await {
            Ok(outcome) => outcome.exit_code(),
            Err(e) => {
                log::error!("{:#}", e);
                EXIT_FAILURE
            }
        },
        Commands::Control(args) => match control(args).await {
            Ok(true) => 0,
            Ok(false) => EXIT_FAILURE,
            Err(e) => {
                eprintln!("{:#}", e);
                EXIT_FAILURE
            }
        },
    };
    std::process::exit(code);
}

async fn run(args: RunArgs) -> anyhow::Result<Outcome> {
    let config = cli::pipeline_config(&args)?;
    let control_address = config.control_address.clone();

    let registry = PluginRegistry::with_builtins();
    let pipeline = tokio::task::spawn_blocking(move || Pipeline::build(&config, &registry)).await??;
    let pipeline = Arc::new(pipeline);

    if let Some(address) = control_address {
        match ControlServer::bind(&address, pipeline.clone()).await {
            Ok(server) => {
                tokio::spawn(server.run());
            }
            Err(e) => {
                pipeline.request_exit(true);
                wait(pipeline).await?;
                return Err(e);
            }
        }
    }

    let terminated = pipeline.coordinator().terminated_token();
    let mut interrupts = 0;
    loop {
        tokio::select! {
            _ = terminated.cancelled() => {
                break;
            },
            _ = tokio::signal::ctrl_c() => {
                interrupts += 1;
                if interrupts == 1 {
                    log::info!("interrupted, draining (interrupt again to abort)");
                    pipeline.request_exit(false);
                } else {
                    log::warn!("interrupted again, aborting");
                    pipeline.request_exit(true);
                }
            },
        }
    }

    wait(pipeline).await
}

/// Joins the stage threads off the async workers.
async fn wait(pipeline: Arc<Pipeline>) -> anyhow::Result<Outcome> {
    Ok(tokio::task::spawn_blocking(move || pipeline.wait()).await?)
}

async fn control(args: ControlArgs) -> anyhow::Result<bool> {
    let line = args.command.join(" ");
    let reply = send_command(&args.address, &line).await?;
    for line in &reply.lines {
        println!("{}", line);
    }
    match reply.error {
        Some(message) => {
            eprintln!("error: {}", message);
            Ok(false)
        }
        None => Ok(true),
    }
}
