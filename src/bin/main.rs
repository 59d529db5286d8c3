use std::{error::Error, process, sync::Arc};

use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

use devstack::{
    cli::{Cli, parse_args},
    command::SystemRunner,
    config::{DEFAULT_TUNABLES_FILE, Environment, Layout, Tunables, resolve_root},
    orchestrator::Orchestrator,
    platform,
    process::SystemSupervisor,
    services::{self, ServiceContext},
};

fn main() -> Result<(), Box<dyn Error>> {
    let args = parse_args();
    init_logging(&args);

    let root = resolve_root(args.root.as_deref())?;
    let layout = Layout::new(&root);
    info!("Using environment root {}", root.display());

    let env_file = args.env_file.clone().unwrap_or_else(|| root.join(".env"));
    let env = Environment::load(&env_file)?;

    let tunables_file = args
        .config
        .clone()
        .unwrap_or_else(|| root.join(DEFAULT_TUNABLES_FILE));
    let tunables = Tunables::load(&tunables_file, &env)?;
    debug!("Tunables: {tunables:?}");

    let platform = platform::detect();
    let ctx = ServiceContext {
        supervisor: Arc::new(SystemSupervisor::new(
            platform.clone(),
            tunables.timing.stop_grace,
        )),
        runner: Arc::new(SystemRunner),
        platform,
        timing: tunables.timing,
    };

    let orchestrator = Orchestrator::new(services::stack(&env, &layout, &tunables, &ctx));
    let result = orchestrator.run(args.action());
    println!("{result}");

    let code = result.exit_code();
    if code != 0 {
        process::exit(code);
    }
    Ok(())
}

fn init_logging(args: &Cli) {
    let filter = if let Some(level) = args.log_level {
        EnvFilter::new(level.as_str())
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}
