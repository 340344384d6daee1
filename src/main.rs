use ai_news_shorts::generator::run_generation;
use anyhow::Result;
use std::path::PathBuf;

const USAGE: &str = "usage: ai-news-shorts <timeline.json> [config.json]";

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let mut args = std::env::args().skip(1);
    let timeline = match args.next() {
        Some(arg) if arg == "-h" || arg == "--help" => {
            println!("{}", USAGE);
            return Ok(());
        }
        Some(arg) => PathBuf::from(arg),
        None => {
            eprintln!("{}", USAGE);
            std::process::exit(2);
        }
    };
    let config = args.next().map(PathBuf::from).unwrap_or_else(|| PathBuf::from("config.json"));

    let code = run_generation(&config, &timeline).await?;
    std::process::exit(code);
}
