mod rallonge;

use clap::Parser;

use rallonge::cli::Cli;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    if let Err(err) = rallonge::run(cli).await {
        eprintln!("rallonge: {err:#}");
        std::process::exit(1);
    }
}
