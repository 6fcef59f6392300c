use anyhow::Context;
use clap::Parser;
use rsis_core::{scenario, Config, Framework};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    #[arg(help = "Scenario file (TOML)")]
    scenario: PathBuf,

    /// Step this many ticks instead of running to the scenario end time
    #[arg(long)]
    steps: Option<u64>,

    /// Extra directories searched for plugins, ahead of the scenario's
    #[arg(long = "plugin-dir")]
    plugin_dirs: Vec<PathBuf>,

    /// Print every model schema as JSON and exit without running
    #[arg(long)]
    schema: bool,
}

fn main() -> anyhow::Result<()> {
    use env_logger::{Builder, Env};

    Builder::from_env(Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let config = Config::load(&args.scenario)?;
    if args.steps.is_none() && config.scheduler.end_time.is_none() && !args.schema {
        anyhow::bail!(
            "{} has no scheduler.end_time; pass --steps to bound the run",
            args.scenario.display()
        );
    }

    let mut fw_config = config.framework_config();
    let mut plugin_dirs = args.plugin_dirs.clone();
    plugin_dirs.append(&mut fw_config.plugin_dirs);
    fw_config.plugin_dirs = plugin_dirs;
    let fw = Framework::new(fw_config)?;
    log::info!("{} at {} Hz", fw.scheduler_name(), config.scheduler.frequency);

    let result = simulate(&args, &config, &fw);
    fw.shutdown();
    result
}

fn simulate(args: &Args, config: &Config, fw: &Framework) -> anyhow::Result<()> {
    scenario::apply(config, fw)
        .with_context(|| format!("Failed to set up {}", args.scenario.display()))?;

    if args.schema {
        for model in fw.models() {
            println!("{}", fw.schema_json(&model)?);
        }
        return Ok(());
    }

    fw.init_scheduler(true).context("Scheduler init failed")?;
    match args.steps {
        Some(steps) => fw.step_scheduler(steps, true),
        None => fw.run_scheduler(true),
    }
    .with_context(|| format!("Simulation stopped: {}", fw.message()))?;

    let time = fw.time();
    log::info!(
        "Finished in state {:?} at t = {:.6} s (step {}, epoch {})",
        fw.state(),
        time.time,
        time.step,
        time.epoch
    );
    log_outputs(fw)
}

fn log_outputs(fw: &Framework) -> anyhow::Result<()> {
    for model in fw.models() {
        let schema = fw.schema(&model)?;
        for field in &schema.outputs {
            match scenario::read_value(fw, &model, &field.path) {
                Ok(value) => log::info!("{}.{} = {}", model, field.path, value),
                Err(e) => log::warn!("{}.{}: {:#}", model, field.path, e),
            }
        }
    }
    Ok(())
}
