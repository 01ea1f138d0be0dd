//! mcp-gateway CLI entry point.

#![warn(clippy::all)]

#[tokio::main]
async fn main() {
    use clap::Parser;

    let cli = mcp_gateway::cli::Cli::parse();

    if let Err(e) = cli.execute().await {
        let exit_code = mcp_gateway::cli::error::display_error(&e);
        std::process::exit(exit_code);
    }
}
