use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use tracing::debug;

use roomcheck_core::config::{expand_path, AppConfig, Config};
use roomcheck_core::logging::init_tracing;
use roomcheck_core::CancellationToken;
use roomcheck_embed::load_embedder;
use roomcheck_index::{IndexOptions, IndexRegistry, LanceRuleStore, RuleIndex};
use roomcheck_pipeline::{Analyzer, Backends};

#[derive(Parser)]
#[command(name = "roomcheck", about = "Check room photos against a housing policy")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Assess one image against a policy document (plain text or PDF).
    Analyze {
        image: PathBuf,
        policy: PathBuf,
        /// Minimum detection confidence; defaults to detector.confidence_threshold.
        #[arg(long)]
        threshold: Option<f32>,
        /// Rules retrieved per detected label; defaults to retrieval.k_per_label.
        #[arg(long)]
        k: Option<usize>,
        /// Print the full report as JSON instead of the summary.
        #[arg(long)]
        json: bool,
    },
    /// Build (and persist, when store.lancedb_dir is set) the rule index for a policy.
    Index { policy: PathBuf },
    /// Show the policy fragments closest to a free-text query.
    Rules {
        policy: PathBuf,
        query: String,
        #[arg(long, default_value_t = 5)]
        k: usize,
    },
}

fn spinner(msg: &str) -> anyhow::Result<ProgressBar> {
    let pb = ProgressBar::new_spinner();
    pb.set_style(ProgressStyle::default_spinner().template("{spinner:.green} [{elapsed_precise}] {msg}")?);
    pb.set_message(msg.to_string());
    pb.enable_steady_tick(Duration::from_millis(120));
    Ok(pb)
}

fn read(path: &Path) -> anyhow::Result<Vec<u8>> {
    fs::read(path).with_context(|| format!("reading {}", path.display()))
}

async fn build_index(app: &AppConfig, policy: &Path) -> anyhow::Result<Arc<RuleIndex>> {
    let embedder = load_embedder(&app.embedding)?;
    let mut registry = IndexRegistry::new(embedder, IndexOptions::from(&app.index));
    if let Some(dir) = &app.store.lancedb_dir {
        let dir = expand_path(dir);
        fs::create_dir_all(&dir)?;
        registry = registry.with_store(Arc::new(LanceRuleStore::open(&dir).await?));
    }
    let bytes = read(policy)?;
    let pb = spinner("indexing policy")?;
    let index = registry.get_or_build_bytes(&bytes, &CancellationToken::new()).await;
    pb.finish_and_clear();
    Ok(index?)
}

async fn analyze(app: &AppConfig, image: &Path, policy: &Path, threshold: Option<f32>, k: Option<usize>, json: bool) -> anyhow::Result<()> {
    let image_bytes = read(image)?;
    let policy_bytes = read(policy)?;
    let backends = Backends::init(app)?;
    let analyzer = Analyzer::open(backends.clone(), app).await?;

    let cancel = CancellationToken::new();
    let on_ctrl_c = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            on_ctrl_c.cancel();
        }
    });

    let threshold = threshold.unwrap_or(app.detector.confidence_threshold);
    let k = k.unwrap_or(app.retrieval.k_per_label);
    debug!(threshold, k, "starting analysis");
    let pb = spinner("analyzing room")?;
    let report = analyzer.analyze_with_context(&image_bytes, &policy_bytes, threshold, k, &cancel).await;
    pb.finish_and_clear();
    let report = report?;
    drop(analyzer);
    backends.shutdown();

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }
    println!("{}", report.assessment.summary());
    println!("{} Scene: {} ({}x{}).", report.detection_summary.message(), report.image.room_type, report.image.width, report.image.height);
    debug!(status = ?report.assessment.compliance_status(), "assessment status");
    for verdict in &report.assessment.verdicts {
        println!(
            "\n- {} ({:.0}%): {} [{}]",
            verdict.subject.label,
            verdict.subject.confidence * 100.0,
            if verdict.violation_found { "VIOLATION" } else { "ok" },
            verdict.severity
        );
        println!("  {}", verdict.rationale);
        if verdict.violation_found {
            println!("  action: {}", verdict.recommended_action);
        }
        for id in &verdict.matched_rule_ids {
            let text = report
                .retrieved
                .get(&verdict.subject.label)
                .and_then(|rules| rules.iter().find(|r| &r.fragment.id == id))
                .map(|r| r.fragment.text.as_str())
                .unwrap_or("");
            println!("  rule {id}: {text}");
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing("warn");
    let cli = Cli::parse();
    let config = Config::load().map_err(|e| {
        eprintln!("Error loading config: {e}");
        e
    })?;
    let app = config.app()?;

    match cli.command {
        Command::Analyze { image, policy, threshold, k, json } => analyze(&app, &image, &policy, threshold, k, json).await?,
        Command::Index { policy } => {
            let index = build_index(&app, &policy).await?;
            let summary = index.summary();
            println!("Policy {} ({} fragments, embedder {})", &index.document_id()[..16], summary.total_fragments, index.embedder_id());
            for (rule_type, count) in &summary.by_rule_type {
                println!("  {:<12} {count}", rule_type.as_str());
            }
        }
        Command::Rules { policy, query, k } => {
            let index = build_index(&app, &policy).await?;
            let hits = tokio::task::spawn_blocking(move || index.query(&query, k)).await??;
            for (i, hit) in hits.iter().enumerate() {
                println!("{}. score={:.4} id={} type={}", i + 1, hit.relevance_score, hit.fragment.id, hit.fragment.rule_type);
                println!("   {}", hit.fragment.text);
            }
        }
    }
    Ok(())
}
