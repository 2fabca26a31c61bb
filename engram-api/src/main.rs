//! Engram CLI
//!
//! `serve` runs the tool protocol on stdio (or HTTP with `--rest`);
//! `backup`, `reindex`, `verify-response`, `setup-hook`, and `sync-rules`
//! are operator commands. Exit codes: 0 success, 1 violation/failure,
//! 2 argument or environment error.

use clap::{Parser, Subcommand};
use engram_api::{build_app_context, shutdown, AppContext, Dispatcher};
use engram_core::{EngramConfig, EntryFilter, EntryKind, EntryPayload, Page, ScopeRef};
use engram_services::{reindex, ProposedAction, ReindexOptions};
use std::io::Read;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

#[derive(Parser)]
#[command(name = "engram", version, about = "Structured memory service for AI coding agents")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the tool protocol over stdio (or HTTP with --rest)
    Serve {
        /// Serve the HTTP surface instead of stdio
        #[arg(long)]
        rest: bool,
    },
    /// Manage database backups
    Backup {
        #[command(subcommand)]
        action: BackupAction,
    },
    /// Re-enqueue embedding jobs for existing entries
    Reindex {
        /// Restrict to one entry type (guideline|knowledge|tool)
        #[arg(long = "type")]
        entry_type: Option<String>,
        #[arg(long, default_value_t = 50)]
        batch_size: u32,
        #[arg(long, default_value_t = 100)]
        delay_ms: u64,
        /// Re-embed even entries whose head already has a vector
        #[arg(long)]
        force: bool,
        /// Only reopen entries whose last attempt failed
        #[arg(long)]
        retry_failed: bool,
        /// Print embedding statistics and exit
        #[arg(long)]
        stats: bool,
    },
    /// Verify a proposed action (read from stdin) against critical guidelines
    VerifyResponse,
    /// Install a verification hook for an IDE
    SetupHook {
        #[arg(long)]
        ide: String,
    },
    /// Export active guidelines to the local rules file
    SyncRules,
}

#[derive(Subcommand)]
enum BackupAction {
    Create,
    List,
    Cleanup {
        #[arg(long, default_value_t = 5)]
        keep: usize,
    },
}

const MAX_STDIN_BYTES: u64 = 1024 * 1024;

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = match EngramConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("configuration error: {e}");
            return ExitCode::from(2);
        }
    };

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("runtime error: {e}");
            return ExitCode::from(2);
        }
    };
    runtime.block_on(run(cli, config))
}

async fn run(cli: Cli, config: EngramConfig) -> ExitCode {
    let ctx = match build_app_context(config).await {
        Ok(ctx) => ctx,
        Err(e) => {
            eprintln!("startup error: {e}");
            return ExitCode::from(2);
        }
    };

    let outcome = match cli.command {
        Command::Serve { rest } => serve(&ctx, rest).await,
        Command::Backup { action } => run_backup(&ctx, action).await,
        Command::Reindex {
            entry_type,
            batch_size,
            delay_ms,
            force,
            retry_failed,
            stats,
        } => {
            run_reindex(
                &ctx,
                entry_type,
                batch_size,
                delay_ms,
                force,
                retry_failed,
                stats,
            )
            .await
        }
        Command::VerifyResponse => run_verify(&ctx).await,
        Command::SetupHook { ide } => run_setup_hook(&ide),
        Command::SyncRules => run_sync_rules(&ctx).await,
    };

    shutdown(&ctx).await;
    outcome
}

async fn serve(ctx: &Arc<AppContext>, rest: bool) -> ExitCode {
    let maintenance = engram_api::runtime::spawn_maintenance(ctx);
    let result = if rest {
        let bind = ctx.config.http_bind.clone();
        engram_api::http::serve_http(ctx.clone(), &bind).await
    } else {
        engram_api::rpc::serve_stdio(Dispatcher::new(ctx.clone())).await
    };
    maintenance.abort();
    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("serve error: {e}");
            ExitCode::from(1)
        }
    }
}

async fn run_backup(ctx: &Arc<AppContext>, action: BackupAction) -> ExitCode {
    let (verb, params) = match action {
        BackupAction::Create => ("create", serde_json::json!({})),
        BackupAction::List => ("list", serde_json::json!({})),
        BackupAction::Cleanup { keep } => ("cleanup", serde_json::json!({ "keep": keep })),
    };
    match engram_api::transfer::handle_backup(ctx, verb, &params).await {
        Ok(result) => {
            println!("{result}");
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("backup {verb} failed: {e}");
            ExitCode::from(1)
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn run_reindex(
    ctx: &Arc<AppContext>,
    entry_type: Option<String>,
    batch_size: u32,
    delay_ms: u64,
    force: bool,
    retry_failed: bool,
    stats: bool,
) -> ExitCode {
    if stats {
        return match ctx.embeddings.stats().await {
            Ok((stored, failed)) => {
                println!("stored: {stored}\nfailed: {failed}");
                ExitCode::SUCCESS
            }
            Err(e) => {
                eprintln!("stats failed: {e}");
                ExitCode::from(1)
            }
        };
    }

    let Some(pool) = ctx.runtime.embedding_pool.as_ref() else {
        eprintln!("embedding is disabled; set ENGRAM_EMBEDDING_PROVIDER");
        return ExitCode::from(2);
    };

    let kinds = match entry_type {
        Some(raw) => match raw.parse::<EntryKind>() {
            Ok(kind) => vec![kind],
            Err(e) => {
                eprintln!("invalid --type: {e}");
                return ExitCode::from(2);
            }
        },
        None => EntryKind::ALL.to_vec(),
    };

    // Exclusive: two concurrent reindex runs would double-enqueue.
    let hold = match ctx
        .runtime
        .resource_locks
        .acquire(
            "maintenance:reindex",
            Duration::from_secs(3600),
            &engram_core::AgentId::system(),
        )
        .await
    {
        Ok(Some(hold)) => hold,
        Ok(None) => {
            eprintln!("another reindex is already running");
            return ExitCode::from(1);
        }
        Err(e) => {
            eprintln!("reindex lock failed: {e}");
            return ExitCode::from(1);
        }
    };

    let options = ReindexOptions {
        kinds,
        batch_size,
        delay: Duration::from_millis(delay_ms),
        force,
        retry_failed,
    };
    let outcome = reindex(
        &options,
        ctx.storage.as_ref(),
        &ctx.embeddings,
        pool.as_ref(),
    )
    .await;
    let _ = ctx.runtime.resource_locks.release(&hold).await;
    match outcome {
        Ok(report) => {
            println!(
                "scanned: {}\nenqueued: {}\nskipped: {}",
                report.scanned, report.enqueued, report.skipped
            );
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("reindex failed: {e}");
            ExitCode::from(1)
        }
    }
}

async fn run_verify(ctx: &Arc<AppContext>) -> ExitCode {
    let mut input = String::new();
    let read = std::io::stdin()
        .lock()
        .take(MAX_STDIN_BYTES)
        .read_to_string(&mut input);
    if let Err(e) = read {
        eprintln!("stdin read failed: {e}");
        return ExitCode::from(2);
    }

    #[derive(serde::Deserialize)]
    struct VerifyInput {
        description: String,
        #[serde(default)]
        payload: Option<serde_json::Value>,
        #[serde(default)]
        scope: Option<ScopeRef>,
    }
    let parsed: VerifyInput = match serde_json::from_str(&input) {
        Ok(parsed) => parsed,
        Err(e) => {
            eprintln!("invalid input: {e}");
            return ExitCode::from(2);
        }
    };

    let chain = match parsed.scope {
        Some(scope) => match ctx.entries.resolve_chain(&scope).await {
            Ok(chain) => chain,
            Err(e) => {
                eprintln!("invalid scope: {e}");
                return ExitCode::from(2);
            }
        },
        None => engram_core::ScopeChain::global_only(),
    };

    match ctx
        .verification
        .verify(
            &ProposedAction {
                description: parsed.description,
                payload: parsed.payload,
            },
            &chain,
        )
        .await
    {
        Ok(outcome) => {
            println!("{}", serde_json::to_string_pretty(&outcome).unwrap_or_default());
            if outcome.blocked {
                ExitCode::from(1)
            } else {
                ExitCode::SUCCESS
            }
        }
        Err(e) => {
            eprintln!("verification failed: {e}");
            ExitCode::from(1)
        }
    }
}

fn run_setup_hook(ide: &str) -> ExitCode {
    let (dir, file, content) = match ide {
        "claude" => (
            ".claude/hooks",
            "engram-verify.sh",
            "#!/bin/sh\n# Pipe proposed actions through engram verification.\nexec engram verify-response\n",
        ),
        "cursor" | "vscode" => (
            ".engram",
            "verify-hook.sh",
            "#!/bin/sh\nexec engram verify-response\n",
        ),
        other => {
            eprintln!("unsupported ide '{other}' (expected claude, cursor, or vscode)");
            return ExitCode::from(2);
        }
    };
    let dir = std::path::Path::new(dir);
    if let Err(e) = std::fs::create_dir_all(dir) {
        eprintln!("cannot create {}: {e}", dir.display());
        return ExitCode::from(1);
    }
    let path = dir.join(file);
    if let Err(e) = std::fs::write(&path, content) {
        eprintln!("cannot write {}: {e}", path.display());
        return ExitCode::from(1);
    }
    println!("installed {}", path.display());
    ExitCode::SUCCESS
}

async fn run_sync_rules(ctx: &Arc<AppContext>) -> ExitCode {
    let guidelines = match ctx
        .entries
        .list(
            EntryKind::Guideline,
            &EntryFilter {
                scope: ScopeRef::global(),
                inherit: false,
                category: None,
                include_inactive: false,
                name_prefix: None,
            },
            Page {
                limit: 500,
                offset: 0,
            },
        )
        .await
    {
        Ok(guidelines) => guidelines,
        Err(e) => {
            eprintln!("listing guidelines failed: {e}");
            return ExitCode::from(1);
        }
    };

    let mut rendered = String::from("# Engram Rules\n\n");
    let mut sorted = guidelines;
    sorted.sort_by(|a, b| b.effective_priority().cmp(&a.effective_priority()));
    for entry in &sorted {
        if let EntryPayload::Guideline(g) = &entry.payload {
            rendered.push_str(&format!("## {} (priority {})\n\n{}\n\n", entry.name, g.priority, g.content));
            if let Some(rationale) = &g.rationale {
                rendered.push_str(&format!("_{rationale}_\n\n"));
            }
        }
    }

    let path = std::path::Path::new(".engram/rules.md");
    if let Some(parent) = path.parent() {
        if let Err(e) = std::fs::create_dir_all(parent) {
            eprintln!("cannot create {}: {e}", parent.display());
            return ExitCode::from(1);
        }
    }
    match std::fs::write(path, rendered) {
        Ok(()) => {
            println!("wrote {} rules to {}", sorted.len(), path.display());
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("cannot write {}: {e}", path.display());
            ExitCode::from(1)
        }
    }
}
