use std::{fs, io::BufWriter, path::PathBuf, process::ExitCode};

use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use wlcache::{
    config::Config,
    error::SimError,
    sim::{self, Source},
    trace::Trace,
    workload::Workload,
};

fn main() -> ExitCode {
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("wlcache=info")),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    match run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!("{err}");
            ExitCode::FAILURE
        }
    }
}

fn run() -> Result<(), SimError> {
    let mut args = pico_args::Arguments::from_env();
    let n_warm: u64 = args.opt_value_from_str("-w")?.unwrap_or(0);
    let n_instr: u64 = args.opt_value_from_str("-i")?.unwrap_or(1_000_000);
    let heartbeat_int: u64 = args.opt_value_from_str("-h")?.unwrap_or(0);

    let config_str: String = if let Some(config_str) = args.opt_value_from_str("--config")? {
        config_str
    } else {
        let config_path: Option<PathBuf> = args.opt_value_from_str("-p")?;
        let config_path = config_path.ok_or(SimError::Usage(
            "must provide a config with --config <json> or -p <path>",
        ))?;
        fs::read_to_string(config_path)?
    };
    let config = Config::from_json(&config_str)?;
    let line_size = config.line_size;
    let mut caches = config.to_caches()?;

    let stats_path: Option<PathBuf> = args.opt_value_from_str("--json")?;
    let stats_path = stats_path.ok_or(SimError::Usage("must provide output path with --json"))?;

    let inst_per_block: usize = args.opt_value_from_str("--buffer-size")?.unwrap_or(1024 * 16);
    let blocks_per_queue: usize = args.opt_value_from_str("--queue-size")?.unwrap_or(32);

    let trace_path: Option<PathBuf> = args.opt_value_from_str("-t")?;
    let seed: Option<u64> = args.opt_value_from_str("--synthetic")?;
    let footprint: u64 = args.opt_value_from_str("--footprint")?.unwrap_or(4096);
    let hot: u64 = args.opt_value_from_str("--hot")?.unwrap_or(64);
    let hot_fraction: f64 = args.opt_value_from_str("--hot-fraction")?.unwrap_or(0.9);

    let remaining = args.finish();
    if !remaining.is_empty() {
        warn!("ignoring unused arguments: {remaining:?}");
    }

    let mut source = match (trace_path, seed) {
        (Some(path), _) => {
            info!("replaying trace {}", path.display());
            Source::Trace(Trace::read(path, inst_per_block, blocks_per_queue)?)
        }
        (None, Some(seed)) => {
            info!(seed, footprint, hot, hot_fraction, "running synthetic workload");
            Source::Synthetic(
                Workload::new(footprint, hot, hot_fraction, line_size, seed)?,
                inst_per_block.max(1),
            )
        }
        (None, None) => {
            return Err(SimError::Usage(
                "must provide a trace with -t or a seed with --synthetic",
            ))
        }
    };

    let instr_idx = sim::replay(&mut source, &mut caches, n_warm, n_instr, heartbeat_int)?;
    info!("Ran {} instructions", instr_idx);

    let mut stats = Vec::with_capacity(caches.len());
    for cache in caches.iter_mut() {
        cache.finish()?;
        stats.push(cache.make_stats());
    }

    let stats_file = BufWriter::new(fs::File::create(stats_path)?);
    serde_json::to_writer_pretty(stats_file, &stats)?;
    Ok(())
}
