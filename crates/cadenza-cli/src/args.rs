use clap::{Parser, Subcommand};

#[derive(Debug, Parser)]
#[command(name = "cadenza")]
#[command(about = "Cadenza CLI for submitting and tracking song generation", long_about = None)]
pub struct Args {
    /// Server URL
    #[arg(long, env = "CADENZA_SERVER_URL", default_value = "http://127.0.0.1:8080")]
    pub server_url: String,

    /// API key (Authorization: Bearer)
    #[arg(long, env = "CADENZA_API_KEY")]
    pub token: Option<String>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Show server health and model readiness
    Health,
    /// Model artifact management
    Models {
        #[command(subcommand)]
        subcommand: ModelsCommand,
    },
    /// Submit a generation request
    Generate(GenerateArgs),
    /// Show the state of a submitted job
    Status {
        request_id: String,
    },
    /// Download a finished result file
    Download {
        request_id: String,
        /// File type: wav, mp3, mid or json
        #[arg(long = "type", default_value = "wav")]
        kind: String,
        /// Destination path (defaults to <request_id>.<type>)
        #[arg(short, long)]
        output: Option<String>,
    },
}

#[derive(Debug, Subcommand)]
pub enum ModelsCommand {
    /// Show artifact readiness
    Status,
    /// Trigger a model download and wait for it to finish
    Download,
}

#[derive(Debug, clap::Args)]
pub struct GenerateArgs {
    /// Lyrics text
    #[arg(long, conflicts_with = "lyrics_file")]
    pub lyrics: Option<String>,

    /// Read lyrics from a file
    #[arg(long)]
    pub lyrics_file: Option<String>,

    #[arg(long)]
    pub genre: Option<String>,

    /// Free-text description used to write lyrics and pick a genre
    #[arg(long)]
    pub prompt: Option<String>,

    #[arg(long)]
    pub song_name: Option<String>,

    #[arg(long)]
    pub user_id: Option<String>,

    /// Only return generated lyrics
    #[arg(long)]
    pub lyrics_only: bool,

    #[arg(long)]
    pub max_new_tokens: Option<u32>,

    #[arg(long)]
    pub run_n_segments: Option<u32>,

    /// Poll until the job finishes
    #[arg(long)]
    pub wait: bool,

    #[arg(long, default_value_t = 10)]
    pub poll_secs: u64,

    /// With --wait, save the wav result here
    #[arg(short, long, requires = "wait")]
    pub output: Option<String>,
}
