//! Minimal interactive loop: one command per line, queries inline as JSON.

use std::io::{self, BufRead, Write};
use std::path::Path;

use anyhow::Result;
use colored::Colorize;
use serde_json::Value;

use constel_engine::Engine;
use constel_query::Schema;
use constel_store::MemoryStore;

const HELP: &str = "\
commands:
  resolve <query-json>
  assert <query-json>
  create <query-json>
  update <query-json> ; <values-json> ; <lock>
  delete <query-json>
  log
  help
  quit
";

pub fn run(schema: &Schema, store: &MemoryStore, snapshot_path: &Path) -> Result<()> {
    let stdin = io::stdin();
    let mut out = io::stdout();
    writeln!(out, "{}", "constel repl, `help` lists commands".bold())?;

    loop {
        write!(out, "{} ", ">".cyan())?;
        out.flush()?;
        let mut line = String::new();
        if stdin.lock().read_line(&mut line)? == 0 {
            break;
        }
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let (cmd, rest) = match line.split_once(' ') {
            Some((c, r)) => (c, r.trim()),
            None => (line, ""),
        };

        let outcome = match cmd {
            "quit" | "exit" => break,
            "help" => {
                write!(out, "{HELP}")?;
                continue;
            }
            "log" => {
                for record in store.changes() {
                    writeln!(
                        out,
                        "{} rev {} ({} ops) {}",
                        record.at.to_rfc3339().dimmed(),
                        record.revision,
                        record.ops,
                        record.summary
                    )?;
                }
                continue;
            }
            "resolve" => match parse_json(rest) {
                Ok(q) => match Engine::new(schema, store).resolve(&q) {
                    Ok((values, lock)) => {
                        writeln!(out, "{}", serde_json::to_string_pretty(&values)?)?;
                        writeln!(out, "{} {}", "lock:".bold(), lock.dimmed())?;
                        continue;
                    }
                    Err(e) => Err(e),
                },
                Err(e) => {
                    writeln!(out, "{} {e}", "error:".red().bold())?;
                    continue;
                }
            },
            "assert" | "create" | "delete" => match parse_json(rest) {
                Ok(q) => {
                    let engine = Engine::new(schema, store);
                    match cmd {
                        "assert" => engine.assert(&q),
                        "create" => engine.create(&q),
                        _ => engine.delete(&q),
                    }
                }
                Err(e) => {
                    writeln!(out, "{} {e}", "error:".red().bold())?;
                    continue;
                }
            },
            "update" => {
                let parts: Vec<&str> = rest.splitn(3, ';').map(str::trim).collect();
                let [query, values, lock] = parts.as_slice() else {
                    writeln!(
                        out,
                        "{} update takes `query ; values ; lock`",
                        "error:".red().bold()
                    )?;
                    continue;
                };
                match (parse_json(query), parse_json(values)) {
                    (Ok(q), Ok(vals)) => Engine::new(schema, store).update(&q, &vals, lock),
                    (Err(e), _) | (_, Err(e)) => {
                        writeln!(out, "{} {e}", "error:".red().bold())?;
                        continue;
                    }
                }
            }
            other => {
                writeln!(out, "{} unknown command `{other}`", "error:".red().bold())?;
                continue;
            }
        };

        match outcome {
            Ok(result) => {
                store.save_to(snapshot_path)?;
                writeln!(out, "{} rev {}", "ok".green().bold(), result.revision)?;
            }
            Err(e) => writeln!(out, "{} {e}", "error:".red().bold())?,
        }
    }
    Ok(())
}

fn parse_json(text: &str) -> Result<Value, serde_json::Error> {
    serde_json::from_str(text)
}
