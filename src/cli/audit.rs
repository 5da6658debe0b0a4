use crate::cli::CliContext;
use crate::core::audit_log::AuditLog;
use anyhow::{bail, Context, Result};
use chrono::{DateTime, Local};
use clap::{Args, Subcommand};
use comfy_table::{presets::UTF8_FULL, Attribute, Cell, Table};

#[derive(Subcommand, Debug)]
pub enum AuditCommand {
    /// Display the audit trail
    Log(AuditLogArgs),
    /// Verify audit chain integrity
    Verify(AuditVerifyArgs),
}

#[derive(Args, Debug)]
pub struct AuditLogArgs {
    /// Maximum number of entries to display
    #[arg(long, default_value_t = 50)]
    pub limit: usize,
}

#[derive(Args, Debug)]
pub struct AuditVerifyArgs {}

pub fn run(ctx: &CliContext, cmd: AuditCommand) -> Result<()> {
    let log = ctx
        .audit_log()
        .context("no audit log configured (set [audit] path or SNOWROT_AUDIT_LOG)")?;
    match cmd {
        AuditCommand::Log(args) => run_log(&log, args),
        AuditCommand::Verify(_) => run_verify(&log),
    }
}

fn run_log(log: &AuditLog, args: AuditLogArgs) -> Result<()> {
    let (entries, malformed) = log.read(Some(args.limit))?;

    if entries.is_empty() {
        println!("No audit entries found.");
        return Ok(());
    }

    let mut table = Table::new();
    table.load_preset(UTF8_FULL);
    table.set_header(vec![
        Cell::new("Timestamp").add_attribute(Attribute::Bold),
        Cell::new("Action").add_attribute(Attribute::Bold),
        Cell::new("Secret").add_attribute(Attribute::Bold),
        Cell::new("Step").add_attribute(Attribute::Bold),
        Cell::new("Actor").add_attribute(Attribute::Bold),
        Cell::new("Result").add_attribute(Attribute::Bold),
    ]);

    for entry in &entries {
        let local: DateTime<Local> = entry.timestamp.into();
        let result = if entry.result.success {
            match &entry.result.detail {
                Some(detail) => format!("OK ({})", detail),
                None => "OK".to_string(),
            }
        } else {
            format!("FAIL: {}", entry.result.error.as_deref().unwrap_or("?"))
        };
        table.add_row(vec![
            local.format("%Y-%m-%d %H:%M:%S").to_string(),
            entry.action.clone(),
            entry.secret_id.clone(),
            entry.step.clone().unwrap_or_else(|| "-".into()),
            entry.actor.clone(),
            result,
        ]);
    }

    println!("{}", table);
    println!("\n{} entries shown.", entries.len());
    if malformed > 0 {
        println!("{} malformed lines skipped (run `audit verify`).", malformed);
    }
    Ok(())
}

fn run_verify(log: &AuditLog) -> Result<()> {
    let report = log.verify_chain()?;

    if report.total == 0 {
        println!("No audit entries to verify.");
        return Ok(());
    }

    for err in &report.errors {
        println!("  [FAIL] {}", err);
    }

    println!();
    if !report.errors.is_empty() {
        bail!(
            "audit chain: {} entries, {} errors",
            report.total,
            report.errors.len()
        );
    }
    println!("Audit chain: {} entries verified, 0 errors", report.total);
    Ok(())
}
