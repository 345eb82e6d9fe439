//! Constel CLI
//!
//! Command-line front end over the engine and the in-memory store:
//! - resolve constellation queries against a snapshot file
//! - run assert/create/update/delete mutations (rewriting the snapshot)
//! - inspect the store change log
//! - a small REPL for interactive use

use std::fs;
use std::path::PathBuf;

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use colored::Colorize;
use serde_json::Value;

use constel_engine::Engine;
use constel_query::Schema;
use constel_store::MemoryStore;

mod repl;

#[derive(Parser)]
#[command(name = "constel")]
#[command(
    author,
    version,
    about = "Constel: constellation queries over a fact-oriented store"
)]
struct Cli {
    /// Schema document (JSON).
    #[arg(long, global = true, default_value = "schema.json")]
    schema: PathBuf,

    /// Store snapshot (JSON); created on first mutation if missing.
    #[arg(long, global = true, default_value = "store.json")]
    store: PathBuf,

    /// Emit raw JSON instead of human output.
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Resolve a query; prints result values and the lock hash.
    Resolve { query: String },
    /// Assert the facts named by the resource (overwrites contradictions).
    Assert { query: String },
    /// Create the resource; fails on contradiction with existing facts.
    Create { query: String },
    /// Replace the value set named by the resource, guarded by a lock hash.
    Update {
        query: String,
        /// New values mirroring the resource shape.
        #[arg(long)]
        values: String,
        /// Lock hash from a prior resolve.
        #[arg(long)]
        lock: String,
    },
    /// Delete matched entities (cascades through mandatory dependencies).
    Delete { query: String },
    /// Show the store change log.
    Log,
    /// Interactive read-eval loop.
    Repl,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let schema_raw: Value = serde_json::from_str(
        &fs::read_to_string(&cli.schema)
            .with_context(|| format!("reading schema {}", cli.schema.display()))?,
    )?;
    let schema = Schema::from_json(&schema_raw).map_err(|e| anyhow!("invalid schema: {e}"))?;

    let store = load_or_new_store(&cli, &schema)?;

    match &cli.command {
        Commands::Resolve { query } => {
            let q: Value = serde_json::from_str(query).context("query is not valid JSON")?;
            let engine = Engine::new(&schema, &store);
            let (values, lock) = engine.resolve(&q)?;
            if cli.json {
                println!(
                    "{}",
                    serde_json::json!({"values": values, "lock": lock})
                );
            } else {
                println!("{}", serde_json::to_string_pretty(&values)?);
                println!("{} {}", "lock:".bold(), lock.dimmed());
            }
        }
        Commands::Assert { query } => {
            mutate(&cli, &schema, &store, query, |engine, q| engine.assert(q))?;
        }
        Commands::Create { query } => {
            mutate(&cli, &schema, &store, query, |engine, q| engine.create(q))?;
        }
        Commands::Update { query, values, lock } => {
            let q: Value = serde_json::from_str(query).context("query is not valid JSON")?;
            let vals: Value = serde_json::from_str(values).context("values are not valid JSON")?;
            let engine = Engine::new(&schema, &store);
            let outcome = engine.update(&q, &vals, lock)?;
            store.save_to(&cli.store)?;
            report(&cli, outcome)?;
        }
        Commands::Delete { query } => {
            mutate(&cli, &schema, &store, query, |engine, q| engine.delete(q))?;
        }
        Commands::Log => {
            for record in store.changes() {
                if cli.json {
                    println!("{}", serde_json::to_string(&record)?);
                } else {
                    println!(
                        "{} rev {} ({} ops) {}",
                        record.at.to_rfc3339().dimmed(),
                        record.revision,
                        record.ops,
                        record.summary
                    );
                }
            }
        }
        Commands::Repl => {
            repl::run(&schema, &store, &cli.store)?;
        }
    }
    Ok(())
}

fn mutate<F>(
    cli: &Cli,
    schema: &Schema,
    store: &MemoryStore,
    query: &str,
    f: F,
) -> Result<()>
where
    F: FnOnce(&Engine<'_>, &Value) -> constel_engine::EngineResult<constel_engine::MutationOutcome>,
{
    let q: Value = serde_json::from_str(query).context("query is not valid JSON")?;
    let engine = Engine::new(schema, store);
    let outcome = f(&engine, &q)?;
    store.save_to(&cli.store)?;
    report(cli, outcome)
}

fn load_or_new_store(cli: &Cli, schema: &Schema) -> Result<MemoryStore> {
    if cli.store.exists() {
        MemoryStore::load_from(schema.clone(), &cli.store)
            .with_context(|| format!("loading store {}", cli.store.display()))
    } else {
        Ok(MemoryStore::new(schema.clone()))
    }
}

fn report(cli: &Cli, outcome: constel_engine::MutationOutcome) -> Result<()> {
    if cli.json {
        println!(
            "{}",
            serde_json::json!({
                "revision": outcome.revision,
                "created": outcome.created,
                "deleted": outcome.deleted,
            })
        );
    } else {
        let mut line = format!("{} rev {}", "ok".green().bold(), outcome.revision);
        if !outcome.created.is_empty() {
            line.push_str(&format!(" created {:?}", outcome.created));
        }
        if !outcome.deleted.is_empty() {
            line.push_str(&format!(" deleted {:?}", outcome.deleted));
        }
        println!("{line}");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;
    use serde_json::json;
    use tempfile::tempdir;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn mutate_writes_the_snapshot_back_to_disk() {
        let dir = tempdir().unwrap();
        let schema_path = dir.path().join("schema.json");
        let store_path = dir.path().join("store.json");
        std::fs::write(
            &schema_path,
            json!({
                "entity_types": [
                    {"name": "note", "roles": [
                        {"name": "slug", "kind": "scalar", "identifying": true},
                        {"name": "text", "kind": "scalar"}
                    ]}
                ]
            })
            .to_string(),
        )
        .unwrap();

        let cli = Cli::parse_from([
            "constel",
            "--schema",
            schema_path.to_str().unwrap(),
            "--store",
            store_path.to_str().unwrap(),
            "--json",
            "assert",
            r#"{"note": {"slug": ["a"], "text": ["hi"]}}"#,
        ]);
        let Commands::Assert { query } = &cli.command else {
            panic!("expected the assert subcommand");
        };

        let schema_raw: Value =
            serde_json::from_str(&std::fs::read_to_string(&cli.schema).unwrap()).unwrap();
        let schema = Schema::from_json(&schema_raw).unwrap();
        let store = load_or_new_store(&cli, &schema).unwrap();
        mutate(&cli, &schema, &store, query, |engine, q| engine.assert(q)).unwrap();

        // A fresh load from the written snapshot sees the fact.
        let reloaded = load_or_new_store(&cli, &schema).unwrap();
        let (values, _) = Engine::new(&schema, &reloaded)
            .resolve(&json!({"note": {"slug": ["a"], "text": []}}))
            .unwrap();
        assert_eq!(values["note"][0]["text"], json!("hi"));
    }
}
