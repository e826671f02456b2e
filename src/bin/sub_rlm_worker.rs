//! Worker side of the Worker Protocol.
//!
//! Reads `{"prompt": ..., "model": ...}` from stdin, calls an
//! OpenAI-compatible endpoint (`OPENAI_API_KEY`, optional `OPENAI_BASE_URL`)
//! and writes the reply to stdout. Diagnostics go to stderr.

use deeprecurse::provider::OpenAIProvider;
use deeprecurse::worker::serve;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();

    let provider = match OpenAIProvider::from_env() {
        Ok(p) => p,
        Err(e) => {
            eprintln!("ERROR: {e}");
            std::process::exit(1);
        }
    };

    if let Err(e) = serve(&provider, tokio::io::stdin(), tokio::io::stdout()).await {
        eprintln!("ERROR: {e}");
        std::process::exit(1);
    }
}
