use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "depth-gateway")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start the market-data gateway (REST + WebSocket fan-out)
    Serve {
        /// Port to listen on
        #[arg(short, long, default_value = "8787")]
        port: u16,

        /// Host to bind to
        #[arg(long, default_value = "127.0.0.1")]
        host: String,

        /// Allowed CORS origin (repeatable); none means any origin
        #[arg(long)]
        origin: Vec<String>,
    },
}
