use anyhow::{bail, Context};
use chrono::Utc;
use clap::{Parser, Subcommand};
use kbvault_core::{
    FollowUpOptions, IngestOptions, KbVaultConfig, KnowledgeService, LogProgress,
};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser)]
#[command(name = "kbvault", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// TOML configuration file
    #[arg(long, env = "KBVAULT_CONFIG")]
    config: Option<PathBuf>,

    /// Storage root, overrides `[storage] root`
    #[arg(long, env = "KBVAULT_ROOT")]
    root: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Command {
    /// Create an empty knowledge base.
    Create { kb: String },
    /// Delete a knowledge base and its chat history.
    Delete { kb: String },
    /// List knowledge bases under the storage root.
    List,
    /// Ingest files or folders into a knowledge base.
    Ingest {
        kb: String,
        #[arg(required = true)]
        paths: Vec<PathBuf>,
        /// OCR scanned PDF pages.
        #[arg(long, default_value_t = false)]
        ocr: bool,
        /// Ask the configured LLM for file summaries.
        #[arg(long, default_value_t = false)]
        summary: bool,
    },
    /// Retrieve the chunks most relevant to a question.
    Query {
        kb: String,
        text: String,
        #[arg(long)]
        top_k: Option<usize>,
        /// Fuse dense scores with BM25.
        #[arg(long, default_value_t = false)]
        bm25: bool,
        /// Rerank candidates with the configured reranker.
        #[arg(long, default_value_t = false)]
        rerank: bool,
        /// Print chunk text under each hit.
        #[arg(long, default_value_t = false)]
        show_text: bool,
    },
    /// Suggest follow-up questions for a conversation snippet.
    FollowUp {
        kb: String,
        context: String,
        #[arg(short = 'n', long)]
        num: Option<usize>,
        /// A question already asked; repeatable.
        #[arg(long)]
        existing: Vec<String>,
    },
    /// List indexed files.
    Files { kb: String },
    /// Remove one file and its chunks.
    Remove { kb: String, name: String },
    /// Drop orphaned chunks and stale stats.
    Compact { kb: String },
    /// Show retrieval statistics.
    Stats {
        kb: String,
        #[arg(long, default_value = "5")]
        hot: usize,
        #[arg(long)]
        cold: Option<i64>,
    },
    /// Group file names that share identical content.
    Duplicates { kb: String },
}

fn load_config(cli: &Cli) -> anyhow::Result<KbVaultConfig> {
    let mut config = match &cli.config {
        Some(path) => KbVaultConfig::load(path)
            .with_context(|| format!("loading config {}", path.display()))?,
        None => KbVaultConfig::default(),
    };
    if let Some(root) = &cli.root {
        config.storage.root = root.clone();
    }
    Ok(config)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let app_version = env!("CARGO_PKG_VERSION");

    tracing_subscriber::registry()
        .with(EnvFilter::from_default_env())
        .with(fmt::layer())
        .init();

    let cli = Cli::parse();
    let config = load_config(&cli)?;
    info!(
        version = app_version,
        root = %config.storage.root.display(),
        started_at = %Utc::now().to_rfc3339(),
        "kbvault boot"
    );
    let retrieval = config.retrieval.options();
    let follow_up = config.follow_up.options();
    let service = KnowledgeService::new(config)?;

    match cli.command {
        Command::Create { kb } => {
            let summary = service.create_kb(&kb).await?;
            println!(
                "created {} ({} / {} dims)",
                summary.slug, summary.embedding_model, summary.embedding_dim
            );
        }
        Command::Delete { kb } => {
            service.delete_kb(&kb).await?;
            println!("deleted {kb}");
        }
        Command::List => {
            for slug in service.list_kbs()? {
                match service.kb_summary(&slug).await {
                    Ok(summary) => println!(
                        "{slug}\tfiles={}\tchunks={}\tbytes={}",
                        summary.file_count, summary.chunk_count, summary.total_size
                    ),
                    Err(error) => println!("{slug}\tunavailable: {error}"),
                }
            }
        }
        Command::Ingest {
            kb,
            paths,
            ocr,
            summary,
        } => {
            let options = IngestOptions {
                use_ocr: ocr,
                generate_summary: summary,
            };
            let handle = service
                .ingest(&kb, paths, options, Arc::new(LogProgress))
                .await?;
            info!(job = %handle.id(), kb = %kb, "ingestion started");
            let report = handle.wait().await;

            for issue in &report.issues {
                warn!(file = %issue.file, kind = %issue.kind, "{}", issue.message);
            }
            println!(
                "{:?}: indexed={} unchanged={} aliased={} chunks={} ocr_pages={} issues={}",
                report.outcome,
                report.indexed.len(),
                report.unchanged.len(),
                report.aliased.len(),
                report.chunks_added,
                report.ocr_pages,
                report.issues.len()
            );
            if !report.is_done() {
                bail!("ingestion {} ended as {:?}", report.job_id, report.outcome);
            }
        }
        Command::Query {
            kb,
            text,
            top_k,
            bm25,
            rerank,
            show_text,
        } => {
            let mut options = retrieval;
            if let Some(top_k) = top_k {
                options.top_k = top_k;
            }
            options.enable_bm25 |= bm25;
            options.enable_rerank |= rerank;

            let hits = service.query(&kb, &text, &options).await?;
            if hits.is_empty() {
                println!("no results");
            }
            for hit in hits {
                let page = hit
                    .page_index
                    .map(|page| format!(" page={}", page + 1))
                    .unwrap_or_default();
                println!(
                    "score={:.4} dense={:.4} source={}{page} chunk={}",
                    hit.score, hit.dense_score, hit.source_name, hit.chunk_id
                );
                if show_text {
                    println!("{}\n", hit.text);
                }
            }
        }
        Command::FollowUp {
            kb,
            context,
            num,
            existing,
        } => {
            let options = FollowUpOptions {
                num_questions: num.unwrap_or(follow_up.num_questions),
                existing_questions: existing,
                ..follow_up
            };
            for question in service.follow_up(&kb, &context, &options).await {
                println!("{question}");
            }
        }
        Command::Files { kb } => {
            for file in service.list_files(&kb).await? {
                println!(
                    "{}\t{}\t{}\t{} chunks\t{}",
                    file.name,
                    file.file_type,
                    file.category,
                    file.chunk_ids.len(),
                    file.updated_at.to_rfc3339()
                );
                if !file.aliases.is_empty() {
                    println!("  aliases: {}", file.aliases.join(", "));
                }
            }
        }
        Command::Remove { kb, name } => {
            let removed = service.remove_file(&kb, &name).await?;
            println!("removed {} ({} chunks)", removed.name, removed.chunk_ids.len());
        }
        Command::Compact { kb } => {
            let report = service.compact(&kb).await?;
            println!(
                "orphan_chunks={} pruned_stats={}",
                report.orphan_chunks, report.pruned_stats
            );
        }
        Command::Stats { kb, hot, cold } => {
            for (name, stats) in service.hot_files(&kb, hot).await? {
                println!(
                    "hot {name}\thits={}\tavg_score={:.4}",
                    stats.hit_count, stats.avg_score
                );
            }
            if let Some(days) = cold {
                for name in service.cold_files(&kb, days).await? {
                    println!("cold {name}");
                }
            }
        }
        Command::Duplicates { kb } => {
            for group in service.duplicates(&kb).await? {
                println!("{}", group.join("\t"));
            }
        }
    }

    service.shutdown().await;
    Ok(())
}
