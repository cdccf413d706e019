//! `evalbench`: stream, compare and batch-evaluate chat models from a shell.

mod cli;

use std::io::Write as _;
use std::sync::Arc;

use clap::Parser as _;
use evalbench_core::{
    ApiKey, BatchEvent, BatchRequest, ComparisonEvent, EvalConfig, Evaluator, JsonlSink,
    StreamEvent, export, init_observability,
};
use tracing::info;

use crate::cli::{Cli, Commands, KeyAction, comparison_groups};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let _ = dotenvy::dotenv();
    init_observability();

    let cli = Cli::parse();
    let config = EvalConfig::from_env()?;
    let mut builder = Evaluator::from_config(&config)?;
    if let Some(path) = &cli.records {
        builder = builder.sink(Arc::new(JsonlSink::new(path)));
    }
    let evaluator = builder.build()?;
    if let Some(key) = &cli.api_key {
        evaluator.set_runtime_key(Some(ApiKey::new(key.clone())));
    }

    match &cli.command {
        Commands::Infer { target, input } => {
            let payload = input.payload()?;
            let model = target.target(&payload);
            let credentials = target.credentials();
            let mut call = evaluator
                .infer(&model, &payload, &target.params.params(), credentials.as_ref())
                .await?;
            while let Some(event) = call.next_event().await {
                print_call_event(&event, cli.json)?;
            }
            let outcome = call.finish().await?;
            info!(status = outcome.status.as_str(), elapsed_ms = outcome.elapsed_ms, "done");
        }
        Commands::Compare {
            model_a,
            model_b,
            params,
            input,
        } => {
            let payload = input.payload()?;
            let mut stream = evaluator
                .compare(comparison_groups(model_a, model_b, params, &payload), &payload)
                .await?;
            while let Some(item) = stream.next_event().await {
                match item {
                    ComparisonEvent::Group(event) if cli.json => {
                        println!("{}", serde_json::to_string(&event)?);
                    }
                    ComparisonEvent::Group(event) => match &event.event {
                        StreamEvent::Token { text } => println!("[{}] {text}", event.group),
                        StreamEvent::Error { message, .. } => {
                            println!("[{}] error: {message}", event.group)
                        }
                        _ => {}
                    },
                    ComparisonEvent::Finished(result) if cli.json => {
                        println!("{}", serde_json::to_string(&result)?);
                    }
                    ComparisonEvent::Finished(result) => {
                        println!("comparison {}", result.status.as_str());
                        for (group, outcome) in result.outcomes.iter().enumerate() {
                            println!(
                                "[{group}] {}: {} ({} in / {} out, {} ms)",
                                result.model_ids[group],
                                outcome.status.as_str(),
                                outcome.input_tokens,
                                outcome.output_tokens,
                                outcome.elapsed_ms
                            );
                        }
                    }
                }
            }
        }
        Commands::Batch {
            target,
            template,
            items,
            items_file,
        } => {
            let mut all_items = items.clone();
            if let Some(path) = items_file {
                let text = tokio::fs::read_to_string(path).await?;
                all_items.extend(
                    text.lines()
                        .map(str::trim)
                        .filter(|l| !l.is_empty())
                        .map(str::to_string),
                );
            }
            let mut request =
                BatchRequest::new(target.target(&Default::default()), template.clone(), all_items)
                    .params(target.params.params());
            if let Some(credentials) = target.credentials() {
                request = request.credentials(credentials);
            }
            let mut stream = evaluator.batch(request)?;
            while let Some(event) = stream.next_event().await {
                print_batch_event(&event, cli.json)?;
            }
        }
        Commands::Suggest { text, max } => {
            let suggestions = evaluator.suggest(text, *max).await;
            if cli.json {
                println!("{}", serde_json::to_string(&suggestions)?);
            } else {
                for suggestion in &suggestions {
                    println!("{text}{suggestion}");
                }
            }
        }
        Commands::Export {
            batch_id,
            format,
            output,
        } => {
            let path = cli.records.as_ref().ok_or("export reads batches from --records")?;
            let snapshots = JsonlSink::new(path).read_batch_snapshots().await?;
            let (batch_id, items) = export::batch_items(&snapshots, *batch_id)
                .ok_or_else(|| format!("no batch found in {}", path.display()))?;
            let rendered = export::render(&items, (*format).into())?;
            match output {
                Some(out) => {
                    tokio::fs::write(out, rendered).await?;
                    info!(%batch_id, rows = items.len(), path = %out.display(), "exported");
                }
                None => print!("{rendered}"),
            }
        }
        Commands::Key {
            action: KeyAction::Status,
        } => {
            let status = evaluator.key_status();
            if cli.json {
                println!("{}", serde_json::to_string(&status)?);
            } else {
                println!(
                    "source: {:?}, key: {}",
                    status.source,
                    status.masked.as_deref().unwrap_or("<none>")
                );
            }
        }
    }
    Ok(())
}

fn print_call_event(event: &StreamEvent, json: bool) -> Result<(), Box<dyn std::error::Error>> {
    if json {
        println!("{}", serde_json::to_string(event)?);
        return Ok(());
    }
    let mut stdout = std::io::stdout().lock();
    match event {
        StreamEvent::Token { text } => {
            write!(stdout, "{text}")?;
            stdout.flush()?;
        }
        StreamEvent::Audio { url } => writeln!(stdout, "\n[audio] {url}")?,
        StreamEvent::Usage {
            input_tokens,
            output_tokens,
        } => writeln!(stdout, "\n[usage] {input_tokens} in / {output_tokens} out")?,
        StreamEvent::Done { elapsed_ms, .. } => writeln!(stdout, "[done] {elapsed_ms} ms")?,
        StreamEvent::Error {
            message,
            is_timeout,
            ..
        } => {
            let kind = if *is_timeout { "timeout" } else { "error" };
            writeln!(stdout, "\n[{kind}] {message}")?;
        }
    }
    Ok(())
}

fn print_batch_event(event: &BatchEvent, json: bool) -> Result<(), Box<dyn std::error::Error>> {
    if json {
        println!("{}", serde_json::to_string(event)?);
        return Ok(());
    }
    match event {
        BatchEvent::Progress {
            completed_count,
            total_count,
            current_item,
            ..
        } => println!("[{completed_count}/{total_count}] {current_item}"),
        BatchEvent::ItemResult {
            item,
            output_preview,
            error,
            ..
        } => match error {
            Some(error) => println!("  {item}: failed: {error}"),
            None => println!("  {item}: {output_preview}"),
        },
        BatchEvent::Done {
            completed_count,
            failed_count,
            status,
        } => println!(
            "batch {}: {completed_count} done, {failed_count} failed",
            status.as_str()
        ),
    }
    Ok(())
}
