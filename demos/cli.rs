use clap::Parser;

#[derive(Parser, Debug, Clone)]
#[command(name = "streamsql-demo", about)]
pub struct Cli {
    /// Path to a TOML query config (see demos/sample_query.toml)
    #[arg(long, default_value = "demos/sample_query.toml")]
    pub config: String,

    /// How many synthetic records to feed through the stream
    #[arg(long, default_value_t = 20)]
    pub record_count: u64,

    /// Tokio worker threads
    #[arg(long, default_value_t = default_workers())]
    pub workers: usize,
}

fn default_workers() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(2)
}
