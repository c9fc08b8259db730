use anyhow::{bail, Context as _};
use clap::Parser;

use evidb_cli::{init_tracing, ConfigArgs};
use evidb_rag::build_generator;

#[derive(Parser)]
#[command(name = "evidb-query")]
#[command(about = "Retrieve grounded context for a query")]
struct Args {
    query: String,

    /// Number of results (defaults to retrieval.k)
    #[arg(short, long)]
    k: Option<usize>,

    /// Drop results scoring below this (defaults to retrieval.min_score)
    #[arg(long)]
    min_score: Option<f32>,

    /// Print the grounding context as JSON
    #[arg(long)]
    json: bool,

    /// Ask the configured generator for an answer
    #[arg(long, conflicts_with = "test_cases")]
    answer: bool,

    /// Ask the configured generator for grounded QA test cases
    #[arg(long)]
    test_cases: bool,

    #[arg(long, default_value_t = 1024)]
    max_tokens: usize,

    #[command(flatten)]
    config: ConfigArgs,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();
    let args = Args::parse();
    let (settings, kb) = args.config.open()?;
    let k = args.k.unwrap_or(settings.retrieval.k);
    let min_score = args.min_score.or(settings.retrieval.min_score);

    if args.answer || args.test_cases {
        let Some(generator_config) = &settings.generator else {
            bail!("no [generator] section in the configuration");
        };
        let generator = build_generator(generator_config).context("creating generator")?;
        if args.answer {
            let answer = kb.answer(generator.as_ref(), &args.query, k, args.max_tokens).await?;
            if args.json {
                println!("{}", serde_json::to_string_pretty(&answer)?);
            } else {
                println!("{}\n", answer.answer);
                for source in answer.context.sources() {
                    println!("  📄 {source}");
                }
            }
        } else {
            let report = kb.generate_test_cases(generator.as_ref(), &args.query, k, args.max_tokens).await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
            if !report.all_grounded() {
                eprintln!("⚠️  {} test case(s) cite sources outside the context", report.ungrounded.len());
            }
        }
        return Ok(());
    }

    let context = kb.query(&args.query, k, min_score).await?;
    if args.json {
        println!("{}", serde_json::to_string_pretty(&context)?);
        return Ok(());
    }
    println!("🔍 {} results for: \"{}\"", context.len(), args.query);
    for entry in &context.entries {
        println!(
            "\n  [{}] score={:.4}  {}  (chars {})",
            entry.marker, entry.score, entry.chunk.source_name, entry.chunk.char_span
        );
        println!("     {}", entry.chunk.text.replace('\n', "\n     "));
    }
    if context.dropped > 0 {
        println!("\n({} more results did not fit the context budget)", context.dropped);
    }
    Ok(())
}
