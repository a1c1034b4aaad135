use clap::Parser;

/// UWB TDoA tag simulation configuration
#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
pub struct Config {
    /// Number of radio events to run through the driver.
    #[arg(long, default_value_t = 4000)]
    pub events: usize,

    /// Tag position as "x,y,z" in metres.
    #[arg(long, default_value = "2.0,3.0,1.0")]
    pub tag_position: String,

    /// JSON file with anchor positions: {"anchors": [[x,y,z], ...]}.
    #[arg(long, value_name = "FILE")]
    pub layout: Option<String>,

    /// Peer matching algorithm: "random" or "youngest".
    #[arg(long, default_value = "youngest")]
    pub matching: String,

    /// Seed for the simulated mesh.
    #[arg(long, default_value_t = 1)]
    pub seed: u64,

    /// Probability that the tag misses an anchor transmission.
    #[arg(long, default_value_t = 0.05)]
    pub packet_loss: f64,

    /// Standard deviation of the arrival-timestamp jitter, in ticks.
    #[arg(long, default_value_t = 1.0)]
    pub rx_jitter: f64,

    /// Fixed height (m) for 2-D operation; emits height measurements too.
    #[arg(long)]
    pub fixed_height: Option<f32>,

    /// Override the measurement standard deviation (m).
    #[arg(long)]
    pub stddev: Option<f32>,

    /// Write emitted measurements as JSON lines to a file.
    #[arg(long, value_name = "FILE")]
    pub dump_measurements: Option<String>,

    /// Verbose logging (DEBUG level)
    #[arg(long, short, default_value_t = false)]
    pub verbose: bool,
}
