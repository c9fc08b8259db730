use std::path::PathBuf;

use anyhow::{bail, Context as _};
use clap::Parser;

use evidb_cli::{init_tracing, ConfigArgs};
use evidb_rag::{build_generator, TestCase};

#[derive(Parser)]
#[command(name = "evidb-script")]
#[command(about = "Generate a Selenium script for a test case against a page")]
struct Args {
    /// JSON file holding one test case (an element of `evidb-query --test-cases` output)
    test_case: PathBuf,

    /// HTML of the page under test
    #[arg(long)]
    html: PathBuf,

    /// URL the script should open
    #[arg(long)]
    url: Option<String>,

    /// Number of documentation chunks to retrieve (defaults to retrieval.k)
    #[arg(short, long)]
    k: Option<usize>,

    #[arg(long, default_value_t = 2048)]
    max_tokens: usize,

    /// Print the script with its metadata as JSON
    #[arg(long)]
    json: bool,

    #[command(flatten)]
    config: ConfigArgs,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();
    let args = Args::parse();
    let (settings, kb) = args.config.open()?;
    let Some(generator_config) = &settings.generator else {
        bail!("no [generator] section in the configuration");
    };
    let generator = build_generator(generator_config).context("creating generator")?;

    let case_json = std::fs::read_to_string(&args.test_case)
        .with_context(|| format!("reading {}", args.test_case.display()))?;
    let case: TestCase = serde_json::from_str(&case_json).context("parsing the test case")?;
    let html = std::fs::read_to_string(&args.html).with_context(|| format!("reading {}", args.html.display()))?;

    let k = args.k.unwrap_or(settings.retrieval.k);
    let script = kb
        .generate_script(generator.as_ref(), &case, &html, args.url.as_deref(), k, args.max_tokens)
        .await?;
    if args.json {
        println!("{}", serde_json::to_string_pretty(&script)?);
    } else {
        println!("{}", script.script);
        eprintln!(
            "🧪 {}: {} ids, {} names, {} classes; docs from {}",
            script.test_id,
            script.selectors.ids,
            script.selectors.names,
            script.selectors.classes,
            if script.sources.is_empty() { "none".to_string() } else { script.sources.join(", ") }
        );
    }
    Ok(())
}
