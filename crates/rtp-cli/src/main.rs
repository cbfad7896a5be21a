use std::path::PathBuf;

use anyhow::{anyhow, Context};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use rtp_core::TimePoint;
use rtp_runner::{Config, Pipeline, RunRequest, Selection};

#[derive(Parser)]
#[command(name = "rtp", version, about = "Region tracking pipeline")]
struct Cli {
    /// Pipeline config (default: ./rtp.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    cmd: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Write an example rtp.toml in the current directory
    Init,

    /// Check that the configured programs, config files and directories are usable
    Doctor,

    /// Segment, track and extract every time step of [start, end)
    Run {
        #[arg(long, value_parser = parse_time)]
        start: TimePoint,
        /// Defaults to now
        #[arg(long, value_parser = parse_time)]
        end: Option<TimePoint>,
        /// Hours between time steps
        #[arg(long, default_value_t = 6)]
        interval: i64,
        /// Map tracked by a previous run (repeatable)
        #[arg(long = "tracked-map")]
        tracked_maps: Vec<PathBuf>,
        /// Longlived region colors file (overrides lifespan.colors_file)
        #[arg(long)]
        regions_colors: Option<PathBuf>,
        /// Also write the run report as JSON
        #[arg(long)]
        report: Option<PathBuf>,
    },

    /// Print the best quality file of a source for a time
    Locate {
        source: String,
        #[arg(value_parser = parse_time)]
        time: TimePoint,
        /// Pattern parameters as key=value
        #[arg(value_parser = parse_param)]
        params: Vec<(String, String)>,
    },

    /// Compute class-centre files for every time step of [start, end)
    ClassCenters {
        #[arg(long, value_parser = parse_time)]
        start: TimePoint,
        #[arg(long, value_parser = parse_time)]
        end: Option<TimePoint>,
        #[arg(long, default_value_t = 6)]
        interval: i64,
    },
}

fn parse_time(s: &str) -> Result<TimePoint, String> {
    TimePoint::parse_iso(s).map_err(|e| e.to_string())
}

fn parse_param(s: &str) -> Result<(String, String), String> {
    s.split_once('=')
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .ok_or_else(|| format!("expected key=value, got {s:?}"))
}

fn now() -> TimePoint {
    TimePoint::new(chrono::Utc::now().naive_utc())
}

fn interval_hours(hours: i64) -> anyhow::Result<chrono::Duration> {
    chrono::Duration::try_hours(hours)
        .filter(|d| *d > chrono::Duration::zero())
        .ok_or_else(|| anyhow!("interval must be a positive number of hours, got {hours}"))
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let cwd = std::env::current_dir()?;
    let config_path = cli.config.unwrap_or_else(|| Config::config_path(&cwd));

    match cli.cmd {
        Command::Init => {
            let path = Pipeline::init(&cwd)?;
            println!("Config at {}", path.display());
        }
        Command::Doctor => {
            let p = Pipeline::open(&config_path)?;
            p.doctor()?;
            println!("OK");
        }
        Command::Run { start, end, interval, tracked_maps, regions_colors, report } => {
            let p = Pipeline::open(&config_path)?;
            let req = RunRequest {
                start,
                end: end.unwrap_or_else(now),
                interval: interval_hours(interval)?,
                seed_tracked: tracked_maps,
                colors_file: regions_colors,
            };
            let r = p.run(req)?;
            if let Some(path) = report {
                r.write_to(&path)?;
            }
            print!("{}", r.summary());
        }
        Command::Locate { source, time, params } => {
            let p = Pipeline::open(&config_path)?;
            let selection = Selection { source, params: params.into_iter().collect() };
            match p.locate(&selection, time).with_context(|| format!("locate {selection} at {time}"))? {
                Some(path) => println!("{}", path.display()),
                None => println!("No file found!"),
            }
        }
        Command::ClassCenters { start, end, interval } => {
            let p = Pipeline::open(&config_path)?;
            let outcome = p.class_centers(start, end.unwrap_or_else(now), interval_hours(interval)?)?;
            for (t, path) in &outcome.centers {
                println!("{t} {}", path.display());
            }
            for d in &outcome.dropped {
                println!("{} dropped at {}: {}", d.time, d.stage, d.reason);
            }
        }
    }
    Ok(())
}
