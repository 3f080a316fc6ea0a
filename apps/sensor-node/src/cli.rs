use clap::Parser;
use std::path::PathBuf;

#[derive(Parser, Debug, Clone)]
#[command(
    name = "sensor-node",
    version,
    about = "Sensor monitoring node"
)]
pub struct Args {
    /// JSON configuration file.
    #[arg(short, long, env = "SENSOR_NODE_CONFIG")]
    pub config: PathBuf,
    /// Raise log verbosity (`-v` debug, `-vv` trace).
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,
    /// Load the configuration, report what would run and exit.
    #[arg(long, default_value_t = false)]
    pub check: bool,
}

impl Args {
    /// Default log filter when `RUST_LOG` is unset.
    pub fn log_filter(&self) -> &'static str {
        match self.verbose {
            0 => "info,sensor_node=info",
            1 => "info,sensor_node=debug",
            _ => "debug,sensor_node=trace",
        }
    }
}
