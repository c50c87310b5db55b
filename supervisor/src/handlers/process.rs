//! Process lifecycle and status handlers

use std::collections::BTreeMap;
use std::path::PathBuf;

use anyhow::Result;

use mcp_supervisor::control::{LifecycleResponse, StatusReport};
use mcp_supervisor::registry::{ProcessOptions, Transport};

use super::CommandContext;

/// Arguments of the `start` command
pub struct StartArgs {
    pub name: String,
    pub command: Vec<String>,
    pub cwd: Option<PathBuf>,
    pub env: Vec<String>,
    pub systemd: bool,
    pub kind: Option<String>,
    pub log_file: Option<PathBuf>,
    pub no_stdio: bool,
}

impl StartArgs {
    fn options(&self) -> Result<ProcessOptions> {
        Ok(ProcessOptions {
            working_directory: self.cwd.clone(),
            environment: parse_env(&self.env)?,
            use_systemd: self.systemd,
            kind: self.kind.clone(),
            log_file: self.log_file.clone(),
            transport: if self.no_stdio {
                Transport::None
            } else {
                Transport::Stdio
            },
        })
    }
}

/// Parse repeated `KEY=VALUE` arguments
fn parse_env(pairs: &[String]) -> Result<BTreeMap<String, String>> {
    pairs
        .iter()
        .map(|pair| match pair.split_once('=') {
            Some((key, value)) if !key.is_empty() => Ok((key.to_string(), value.to_string())),
            _ => anyhow::bail!("invalid --env '{}': expected KEY=VALUE", pair),
        })
        .collect()
}

fn report_lifecycle(action: &str, name: &str, response: LifecycleResponse) -> Result<()> {
    if response.success {
        match response.pid {
            Some(pid) => println!("✓ {} '{}' (pid {})", action, name, pid),
            None => println!("✓ {} '{}'", action, name),
        }
        Ok(())
    } else {
        anyhow::bail!(
            "{} '{}' failed: {}",
            action,
            name,
            response.error.unwrap_or_else(|| "unknown error".to_string())
        )
    }
}

/// Handle the `start` command
pub async fn run_start(ctx: &CommandContext, args: StartArgs) -> Result<()> {
    let options = args.options()?;
    let response = ctx
        .client()
        .start(&args.name, args.command.clone(), options)
        .await?;
    report_lifecycle("started", &args.name, response)
}

/// Handle the `stop` command
pub async fn run_stop(ctx: &CommandContext, name: &str) -> Result<()> {
    let response = ctx.client().stop(name).await?;
    report_lifecycle("stopped", name, response)
}

/// Handle the `restart` command
pub async fn run_restart(ctx: &CommandContext, name: &str) -> Result<()> {
    let response = ctx.client().restart(name).await?;
    report_lifecycle("restarted", name, response)
}

/// Handle the `status` command
pub async fn run_status(ctx: &CommandContext, name: &str) -> Result<()> {
    let response = ctx.client().status(name).await?;
    let Some(report) = response.process else {
        anyhow::bail!(
            "{}",
            response.error.unwrap_or_else(|| format!("no status for '{}'", name))
        );
    };

    println!("=== {} ===", report.name);
    println!("  Status:   {}", report.status);
    println!("  PID:      {}", display_opt(report.pid));
    println!(
        "  Started:  {}",
        report
            .started_at
            .map(|t| t.to_rfc3339())
            .unwrap_or_else(|| "-".to_string())
    );
    println!(
        "  Uptime:   {}",
        report
            .uptime_secs
            .map(format_uptime)
            .unwrap_or_else(|| "-".to_string())
    );
    println!("  Restarts: {}", report.restart_count);
    println!("  Health:   {}", display_opt(report.health_score));
    if let Some(ref error) = report.error {
        println!("  Error:    {}", error);
    }
    Ok(())
}

/// Handle the `list` command
pub async fn run_list(ctx: &CommandContext) -> Result<()> {
    let response = ctx.client().list().await?;
    if !response.success {
        anyhow::bail!("{}", response.error.unwrap_or_default());
    }
    if response.processes.is_empty() {
        println!("No processes registered.");
        return Ok(());
    }

    println!(
        "{:<24} {:<9} {:>8} {:>10} {:>8} {:>6}",
        "NAME", "STATUS", "PID", "UPTIME", "RESTARTS", "HEALTH"
    );
    for report in &response.processes {
        println!("{}", list_row(report));
    }
    Ok(())
}

fn list_row(report: &StatusReport) -> String {
    format!(
        "{:<24} {:<9} {:>8} {:>10} {:>8} {:>6}",
        report.name,
        report.status.to_string(),
        display_opt(report.pid),
        report
            .uptime_secs
            .map(format_uptime)
            .unwrap_or_else(|| "-".to_string()),
        report.restart_count,
        display_opt(report.health_score),
    )
}

fn display_opt<T: ToString>(value: Option<T>) -> String {
    value.map(|v| v.to_string()).unwrap_or_else(|| "-".to_string())
}

fn format_uptime(secs: i64) -> String {
    let secs = secs.max(0);
    match secs {
        s if s < 60 => format!("{}s", s),
        s if s < 3600 => format!("{}m{}s", s / 60, s % 60),
        s => format!("{}h{}m", s / 3600, (s % 3600) / 60),
    }
}
