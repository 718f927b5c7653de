// Command-line interface for the daemon
// Uses clap for parsing arguments

use clap::Parser;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(
    name = "clipd",
    about = "clipd - automation daemon for recording pipelines",
    version,
    author
)]
pub struct Args {
    /// Root of the persistent state tree (db, config, cache, thumbs)
    #[arg(long, value_name = "DIR", default_value = "/data")]
    pub data_dir: PathBuf,

    /// Number of concurrent worker tasks
    #[arg(long, value_name = "N", default_value = "2")]
    pub concurrent: usize,

    /// Path to the ffmpeg binary (default: from PATH)
    #[arg(long, value_name = "FILE")]
    pub ffmpeg: Option<PathBuf>,

    /// Path to the ffprobe binary (default: from PATH)
    #[arg(long, value_name = "FILE")]
    pub ffprobe: Option<PathBuf>,

    /// Verbosity level (can be repeated: -v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,
}
