use std::{process, sync::Arc};

use rowcache::{
    cache::{MemoryStore, QueryCache},
    config::{self, Command, SimulateArgs},
    infra::{error::InfraError, telemetry},
    simulate,
};
use tracing::{Dispatch, Level, dispatcher, error, info};
use tracing_subscriber::fmt as tracing_fmt;

#[tokio::main]
async fn main() {
    if let Err(error) = run().await {
        report_error(&error);
        process::exit(1);
    }
}

fn report_error(error: &InfraError) {
    if dispatcher::has_been_set() {
        error!(error = %error, "rowcache failed");
        return;
    }

    let subscriber = tracing_fmt().with_max_level(Level::ERROR).finish();
    let dispatch = Dispatch::new(subscriber);
    dispatcher::with_default(&dispatch, || {
        error!(error = %error, "rowcache failed");
    });
}

async fn run() -> Result<(), InfraError> {
    let (cli_args, settings) = config::load_with_cli()?;

    telemetry::init(&settings.logging)?;

    match cli_args.command {
        Some(Command::Check(_)) | None => run_check(settings),
        Some(Command::Simulate(args)) => run_simulate(settings, args).await,
    }
}

fn run_check(settings: config::Settings) -> Result<(), InfraError> {
    let cache = settings.cache;
    info!(level = %cache.level, "configuration is valid");

    println!("level:                  {}", cache.level);
    if cache.tables.is_empty() {
        println!("tables:                 (all)");
    } else {
        println!("tables:                 {}", cache.tables.join(", "));
    }
    println!("invalidate_on_write:    {}", cache.invalidate_on_write);
    println!("async_write:            {}", cache.async_write);
    println!("ttl:                    {:?} (±20% jitter)", cache.ttl());
    if cache.max_item_count == 0 {
        println!("max_item_count:         unlimited");
    } else {
        println!("max_item_count:         {}", cache.max_item_count);
    }
    println!("penetration_protection: {}", cache.penetration_protection());
    println!("key_prefix:             {}", cache.key_prefix);
    println!(
        "instance_id:            {}",
        cache.instance_id.as_deref().unwrap_or("(random per instance)")
    );
    println!("memory_capacity:        {}", cache.memory_capacity);
    Ok(())
}

async fn run_simulate(settings: config::Settings, args: SimulateArgs) -> Result<(), InfraError> {
    let store = Arc::new(MemoryStore::new(&settings.cache));
    let cache = QueryCache::new(settings.cache, store)?;

    let report = simulate::run(cache, &args).await?;
    println!("{report}");
    Ok(())
}
