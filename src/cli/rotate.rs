//! Rotation commands: handle, step, rotate, rollback, status.

use crate::cli::CliContext;
use crate::constants::{STAGE_CURRENT, STAGE_PENDING, STAGE_PREVIOUS};
use crate::core::rotation::{self, SecretStatus, StepOutcome};
use crate::models::event::{RotationEvent, RotationStep};
use anyhow::{Context, Result};
use clap::{Args, ValueEnum};
use comfy_table::{presets::UTF8_FULL, Attribute, Cell, Color, Table};
use std::io::Read;
use std::path::PathBuf;

#[derive(Args, Debug)]
pub struct HandleArgs {
    /// Event JSON file (default: stdin)
    #[arg(long, value_name = "FILE")]
    pub event: Option<PathBuf>,
}

#[derive(Args, Debug)]
pub struct StepArgs {
    pub secret_id: String,
    /// Client request token (the pending version id)
    pub token: String,
    /// createSecret, setSecret, testSecret, or finishSecret
    pub step: RotationStep,
}

#[derive(Args, Debug)]
pub struct RotateArgs {
    pub secret_id: String,
}

#[derive(Args, Debug)]
pub struct RollbackArgs {
    pub secret_id: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    Table,
    Json,
}

#[derive(Args, Debug)]
pub struct StatusArgs {
    pub secret_id: String,
    #[arg(long, value_enum, default_value_t = OutputFormat::Table)]
    pub format: OutputFormat,
}

fn report_outcome(outcome: StepOutcome, step: &str) {
    match outcome {
        StepOutcome::Completed => println!("{}: done", step),
        StepOutcome::AlreadyCurrent => println!("{}: version already AWSCURRENT, nothing to do", step),
    }
}

pub async fn run_handle(ctx: &CliContext, args: HandleArgs) -> Result<()> {
    let payload = match &args.event {
        Some(path) => std::fs::read(path).with_context(|| format!("read event {}", path.display()))?,
        None => {
            let mut buf = Vec::new();
            std::io::stdin()
                .read_to_end(&mut buf)
                .context("read event from stdin")?;
            buf
        }
    };
    let handler = ctx.build_handler().await?;
    let outcome = handler.handle_json(&payload).await?;
    report_outcome(outcome, "event");
    Ok(())
}

pub async fn run_step(ctx: &CliContext, args: StepArgs) -> Result<()> {
    let handler = ctx.build_handler().await?;
    let outcome = handler
        .handle(RotationEvent::new(&args.secret_id, &args.token, args.step))
        .await?;
    report_outcome(outcome, args.step.as_str());
    Ok(())
}

pub async fn run_rotate(ctx: &CliContext, args: RotateArgs) -> Result<()> {
    let handler = ctx.build_handler().await?;
    let report = handler
        .rotate(&args.secret_id)
        .await
        .with_context(|| format!("rotate {}", args.secret_id))?;
    println!("Rotated {}", report.secret_id);
    println!("  new AWSCURRENT:  {}", report.token);
    println!("  AWSPREVIOUS:     {}", report.previous_version);
    Ok(())
}

pub async fn run_rollback(ctx: &CliContext, args: RollbackArgs) -> Result<()> {
    let handler = ctx.build_handler().await?;
    let report = handler
        .rollback(&args.secret_id)
        .await
        .with_context(|| format!("roll back {}", args.secret_id))?;
    println!("Rolled back {}", report.secret_id);
    println!("  AWSCURRENT:  {}", report.restored_version);
    println!("  AWSPREVIOUS: {}", report.replaced_version);
    Ok(())
}

pub async fn run_status(ctx: &CliContext, args: StatusArgs) -> Result<()> {
    let store = ctx.open_store().await?;
    let status = rotation::status(store.as_ref(), &args.secret_id).await?;
    match args.format {
        OutputFormat::Json => {
            let doc = serde_json::json!({
                "secret_id": args.secret_id,
                "name": status.metadata.name,
                "rotation_enabled": status.metadata.rotation_enabled,
                "username": status.username,
                "versions": status.metadata.versions,
            });
            println!("{}", serde_json::to_string_pretty(&doc)?);
        }
        OutputFormat::Table => print_status(&args.secret_id, &status),
    }
    Ok(())
}

fn stage_color(stage: &str) -> Color {
    match stage {
        STAGE_CURRENT => Color::Green,
        STAGE_PENDING => Color::Yellow,
        STAGE_PREVIOUS => Color::Blue,
        _ => Color::Reset,
    }
}

fn print_status(secret_id: &str, status: &SecretStatus) {
    println!("Secret:   {}", status.metadata.name.as_deref().unwrap_or(secret_id));
    println!("Username: {}", status.username.as_deref().unwrap_or("-"));
    println!(
        "Rotation: {}",
        if status.metadata.rotation_enabled { "enabled" } else { "disabled" }
    );

    let mut table = Table::new();
    table.load_preset(UTF8_FULL);
    table.set_header(vec![
        Cell::new("Version").add_attribute(Attribute::Bold),
        Cell::new("Stages").add_attribute(Attribute::Bold),
    ]);
    for (version, stages) in &status.metadata.versions {
        let color = stages.first().map(|s| stage_color(s)).unwrap_or(Color::Reset);
        let label = if stages.is_empty() { "-".to_string() } else { stages.join(", ") };
        table.add_row(vec![Cell::new(version), Cell::new(label).fg(color)]);
    }
    println!("{}", table);
}
