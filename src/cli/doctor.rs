//! Diagnostics for configuration and deployment readiness.

use crate::cli::CliContext;
use crate::constants;
use crate::core::file_lock::FileLock;
use crate::core::settings;
use crate::core::target::snowflake::SnowflakeSettings;
use crate::models::config::StoreKind;
use anyhow::{bail, Result};
use clap::Args;
use std::collections::BTreeSet;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Args, Debug)]
pub struct DoctorArgs {
    /// Also check for multiple snowrot binaries on PATH
    #[arg(long)]
    pub path: bool,
}

#[derive(Default)]
struct Tally {
    ok: u32,
    warn: u32,
    fail: u32,
}

impl Tally {
    fn pass(&mut self, msg: impl AsRef<str>) {
        println!("  [PASS] {}", msg.as_ref());
        self.ok += 1;
    }

    fn warn(&mut self, msg: impl AsRef<str>) {
        println!("  [WARN] {}", msg.as_ref());
        self.warn += 1;
    }

    fn fail(&mut self, msg: impl AsRef<str>) {
        println!("  [FAIL] {}", msg.as_ref());
        self.fail += 1;
    }

    fn info(&self, msg: impl AsRef<str>) {
        println!("  [INFO] {}", msg.as_ref());
    }
}

pub fn run(ctx: &CliContext, args: DoctorArgs) -> Result<()> {
    let config = &ctx.config;
    let mut t = Tally::default();

    println!("Doctor: snowrot {}", env!("CARGO_PKG_VERSION"));
    match &ctx.config_path {
        Some(path) => t.pass(format!("config loaded: {}", path.display())),
        None => t.info("no config file, using environment and defaults"),
    }
    if let Some(environment) = &config.environment {
        t.info(format!("environment: {}", environment));
    }

    match settings::validate(config) {
        Ok(()) => t.pass("configuration valid"),
        Err(e) => t.fail(format!("configuration invalid: {:#}", anyhow::Error::from(e))),
    }

    check_store(ctx, &mut t);
    check_snowflake(ctx, &mut t);
    check_audit(ctx, &mut t);

    if env::var_os("AWS_LAMBDA_RUNTIME_API").is_some() {
        t.info("running under a function host (AWS_LAMBDA_RUNTIME_API set)");
    }

    if args.path {
        let bins = find_bins_on_path(constants::APP_NAME);
        if bins.is_empty() {
            t.warn("snowrot not found on PATH");
        } else {
            t.info("snowrot binaries on PATH:");
            for b in &bins {
                println!("    - {}", b.display());
            }
            if bins.len() > 1 {
                t.warn("multiple binaries detected; automation should pin one path");
            } else {
                t.ok += 1;
            }
        }
    }

    println!();
    println!("Doctor summary: {} pass, {} warn, {} fail", t.ok, t.warn, t.fail);
    if t.fail > 0 {
        bail!("doctor found {} failing checks", t.fail);
    }
    Ok(())
}

fn check_store(ctx: &CliContext, t: &mut Tally) {
    let store = &ctx.config.store;
    t.info(format!("secret store: {}", store.kind));
    match store.kind {
        StoreKind::Aws => {
            let region = store
                .region
                .clone()
                .or_else(|| env::var("AWS_REGION").ok())
                .or_else(|| env::var("AWS_DEFAULT_REGION").ok());
            match region {
                Some(region) => t.pass(format!("AWS region: {}", region)),
                None => t.warn("no AWS region configured; relying on the SDK profile"),
            }
            if let Some(endpoint) = &store.endpoint_url {
                t.info(format!("Secrets Manager endpoint override: {}", endpoint));
            }
        }
        StoreKind::Local => {
            let Ok(local) = ctx.local_store("doctor") else {
                t.fail("local store has no path");
                return;
            };
            let path = local.path();
            if !path.exists() {
                t.warn(format!("local store does not exist yet: {}", path.display()));
                return;
            }
            check_mode(t, path, constants::STORE_FILE_MODE, "local store");
            match FileLock::try_acquire(path) {
                Ok(Some(_lock)) => {}
                Ok(None) => t.warn("local store is locked by another process"),
                Err(e) => t.warn(format!("cannot open local store lock: {}", e)),
            }
            match local.list_secrets() {
                Ok(ids) => t.pass(format!("local store readable: {} secrets", ids.len())),
                Err(e) => t.fail(format!("local store unreadable: {}", e)),
            }
            t.warn("local store keeps values in plain text; use it for rehearsals only");
        }
    }
}

fn check_snowflake(ctx: &CliContext, t: &mut Tally) {
    let sf = &ctx.config.snowflake;
    match SnowflakeSettings::from_section(sf) {
        Ok(settings) => t.pass(format!("Snowflake endpoint: {}", settings.base_url)),
        Err(e) => t.fail(format!("Snowflake: {}", e)),
    }
    match (&sf.admin_secret_id, &sf.admin_user, &sf.admin_password) {
        (Some(id), _, _) => t.pass(format!("admin credentials from secret '{}'", id)),
        (None, Some(user), Some(_)) => {
            t.pass(format!("admin credentials for {} from config/environment", user))
        }
        _ => t.fail("no Snowflake admin credentials configured"),
    }
    t.info(format!("ALTER USER runs as role {}", sf.role));
}

fn check_audit(ctx: &CliContext, t: &mut Tally) {
    let Some(log) = ctx.audit_log() else {
        t.info("audit log disabled");
        return;
    };
    let path = log.path();
    if !path.exists() {
        let parent_ok = path.parent().is_some_and(|p| p.as_os_str().is_empty() || p.is_dir());
        if parent_ok {
            t.pass(format!("audit log will be created at {}", path.display()));
        } else {
            t.warn(format!("audit log directory missing for {}", path.display()));
        }
        return;
    }
    check_mode(t, path, constants::AUDIT_LOG_MODE, "audit log");
    match log.verify_chain() {
        Ok(report) if report.errors.is_empty() => {
            t.pass(format!("audit chain intact ({} entries)", report.total))
        }
        Ok(report) => t.fail(format!(
            "audit chain broken: {} errors in {} entries (run `audit verify`)",
            report.errors.len(),
            report.total
        )),
        Err(e) => t.warn(format!("cannot read audit log: {:#}", e)),
    }
}

fn check_mode(t: &mut Tally, path: &Path, expected: u32, what: &str) {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        if let Ok(meta) = fs::metadata(path) {
            let mode = meta.permissions().mode() & 0o777;
            if mode & !expected == 0 {
                t.pass(format!("{} mode ok: {:04o}", what, mode));
            } else {
                t.warn(format!("{} mode: {:04o} (expected {:04o})", what, mode, expected));
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = (t, path, expected, what);
    }
}

fn find_bins_on_path(name: &str) -> Vec<PathBuf> {
    let mut out: BTreeSet<PathBuf> = BTreeSet::new();
    let path = env::var_os("PATH").unwrap_or_default();
    for dir in env::split_paths(&path) {
        let candidate = dir.join(name);
        if is_executable_file(&candidate) {
            out.insert(candidate);
        }
    }
    out.into_iter().collect()
}

fn is_executable_file(path: &Path) -> bool {
    if !path.is_file() {
        return false;
    }
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::metadata(path).is_ok_and(|meta| meta.permissions().mode() & 0o111 != 0)
    }
    #[cfg(not(unix))]
    {
        true
    }
}
