//! nexo-admin: installation and maintenance commands for a Nexo database.
//!
//! Usage:
//!   nexo-admin install --short
//!   nexo-admin install --org-name "Acme School" --org-slug acme --username alice --email alice@acme.dev
//!   nexo-admin migrate-configs
//!   nexo-admin affiliate-stats --org defaultorg
//!   nexo-admin export-audit --out audit.csv --action POST
//!
//! Every command accepts `--config path/to/config.json`; without it the
//! defaults plus NEXO_* environment variables are used.

use anyhow::{anyhow, bail, Context, Result};
use nexo_core::{
    affiliate_service::AffiliateStats,
    config::PlatformConfig,
    platform::{InstallRequest, Platform},
    store::{is_memory_path, AuditFilter},
};
use std::env;
use std::io::{self, BufRead, Write};

#[derive(serde::Serialize)]
struct StatsReport<'a> {
    org: &'a str,
    generated_at: String,
    affiliates: Vec<AffiliateStats>,
}

fn main() -> Result<()> {
    env_logger::init();

    let args: Vec<String> = env::args().collect();
    let command = args.get(1).map(String::as_str).unwrap_or("help");

    let config = match flag(&args, "--config") {
        Some(path) => PlatformConfig::load(path)?,
        None => PlatformConfig::from_env(),
    };
    if is_memory_path(&config.database.path) {
        bail!(
            "database path '{}' is in memory; set database.path or NEXO_DATABASE_PATH",
            config.database.path
        );
    }

    match command {
        "install" => install(config, &args),
        "migrate-configs" => migrate_configs(config),
        "affiliate-stats" => affiliate_stats(config, &args),
        "export-audit" => export_audit(config, &args),
        _ => {
            println!("nexo-admin <install|migrate-configs|affiliate-stats|export-audit> [--config file]");
            Ok(())
        }
    }
}

fn install(config: PlatformConfig, args: &[String]) -> Result<()> {
    let short = args.iter().any(|a| a == "--short");
    let request = if short {
        let password = first_env(&["NEXO_INITIAL_ADMIN_PASSWORD"])
            .ok_or_else(|| anyhow!("NEXO_INITIAL_ADMIN_PASSWORD environment variable is required"))?;
        let email = first_env(&["NEXO_INITIAL_ADMIN_EMAIL"]);
        InstallRequest::short(email, password)
    } else {
        InstallRequest {
            org_name: flag_or_prompt(args, "--org-name", "Organization name")?,
            org_slug: flag_or_prompt(args, "--org-slug", "Organization slug (e.g. school, acme)")?,
            admin_username: flag_or_prompt(args, "--username", "Admin username")?,
            admin_email: flag_or_prompt(args, "--email", "Admin email")?,
            admin_password: match first_env(&["NEXO_INITIAL_ADMIN_PASSWORD"]) {
                Some(password) => password,
                None => prompt("Admin password")?,
            },
        }
    };

    let platform = Platform::open(config)?;
    let installed = platform.install(&request)?;

    println!("Installation completed");
    println!("  organization: {} ({})", installed.organization.name, installed.organization.slug);
    println!("  login email:  {}", installed.admin.email);
    if short {
        println!("Remember to change the password after logging in.");
    }
    Ok(())
}

/// Read every organization config, which upgrades and stores old versions.
fn migrate_configs(config: PlatformConfig) -> Result<()> {
    let platform = Platform::open(config)?;
    let orgs = platform.orgs();
    let mut count = 0;
    for org in orgs.list()? {
        let migrated = orgs
            .config(org.id)
            .with_context(|| format!("config of organization '{}'", org.slug))?;
        println!("{:<24} config {}", org.slug, migrated.config_version);
        count += 1;
    }
    println!("{count} organization configs checked");
    Ok(())
}

fn affiliate_stats(config: PlatformConfig, args: &[String]) -> Result<()> {
    let Some(slug) = flag(args, "--org") else {
        bail!("--org <slug> is required");
    };
    let platform = Platform::open(config)?;
    let org = platform.orgs().get_by_slug(slug)?;
    let report = StatsReport {
        org: slug,
        generated_at: chrono::Utc::now().to_rfc3339(),
        affiliates: platform.affiliates().admin_stats(org.id)?,
    };
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

fn export_audit(config: PlatformConfig, args: &[String]) -> Result<()> {
    let status_code = status_filter(flag(args, "--status"))?;
    let filter = AuditFilter {
        user_id: flag(args, "--user-id").map(str::to_string),
        username: flag(args, "--username").map(str::to_string),
        action: flag(args, "--action").map(str::to_string),
        resource: flag(args, "--resource").map(str::to_string),
        status_code,
        ip_address: flag(args, "--ip").map(str::to_string),
        ..AuditFilter::default()
    };
    let default_out = format!("audit_logs_{}.csv", chrono::Utc::now().format("%Y%m%d_%H%M%S"));
    let out = flag(args, "--out").unwrap_or(&default_out);

    let platform = Platform::open(config)?;
    let csv = platform.audit().export_csv(&filter)?;
    std::fs::write(out, &csv).with_context(|| format!("cannot write {out}"))?;
    log::info!("audit export written to {out}");
    println!("{} rows written to {out}", csv.lines().count().saturating_sub(1));
    Ok(())
}

fn status_filter(raw: Option<&str>) -> Result<Option<i64>> {
    raw.map(|raw| {
        raw.trim()
            .parse::<i64>()
            .map_err(|_| anyhow!("--status expects an HTTP status code, got '{raw}'"))
    })
    .transpose()
}

fn flag<'a>(args: &'a [String], name: &str) -> Option<&'a str> {
    args.windows(2)
        .find(|w| w[0] == name)
        .map(|w| w[1].as_str())
}

fn first_env(keys: &[&str]) -> Option<String> {
    keys.iter()
        .filter_map(|k| env::var(k).ok())
        .find(|v| !v.trim().is_empty())
}

fn flag_or_prompt(args: &[String], name: &str, label: &str) -> Result<String> {
    match flag(args, name) {
        Some(value) => Ok(value.to_string()),
        None => prompt(label),
    }
}

fn prompt(label: &str) -> Result<String> {
    print!("{label}: ");
    io::stdout().flush()?;
    let mut line = String::new();
    io::stdin().lock().read_line(&mut line)?;
    let value = line.trim().to_string();
    if value.is_empty() {
        bail!("{label} must not be empty");
    }
    Ok(value)
}
