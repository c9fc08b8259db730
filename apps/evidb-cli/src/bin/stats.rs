use clap::Parser;

use evidb_cli::{init_tracing, ConfigArgs};

#[derive(Parser)]
#[command(name = "evidb-stats")]
#[command(about = "Print index statistics as JSON")]
struct Args {
    #[command(flatten)]
    config: ConfigArgs,
}

fn main() -> anyhow::Result<()> {
    init_tracing();
    let args = Args::parse();
    let (_, kb) = args.config.open()?;
    println!("{}", serde_json::to_string_pretty(&kb.stats())?);
    Ok(())
}
