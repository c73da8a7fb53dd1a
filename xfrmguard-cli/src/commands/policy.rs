//! `xfrmguard policy` command handler

use std::io::Write;
use std::path::Path;
use std::time::Duration;

use serde::Serialize;
use tracing::info;

use xfrmguard_core::clock::{Clock, SystemClock};
use xfrmguard_core::config::XfrmGuardConfig;
use xfrmguard_core::error::FatalReconciliationError;
use xfrmguard_policy_table::{
    AddressFamily, GracefulShutdownPhase, NetlinkXfrmConnector, PolicyTable, XfrmConnector,
    XfrmHandle, XfrmPolicy,
};

use crate::cli::{PolicyAction, PolicyArgs};
use crate::error::CliError;
use crate::output::{OutputWriter, Render};

/// Execute the `policy` command.
pub fn execute(
    args: PolicyArgs,
    config_path: &Path,
    writer: &OutputWriter,
) -> Result<(), CliError> {
    let config = XfrmGuardConfig::load(config_path)?;
    match args.action {
        PolicyAction::List { all } => execute_list(&config, all, writer),
        PolicyAction::Cleanup {
            short_grace,
            interval_ms,
        } => execute_cleanup(&config, short_grace, interval_ms, writer),
    }
}

/// Lists kernel XFRM policies over a NETLINK_XFRM socket.
///
/// # Errors
///
/// Returns `CliError::Command` if the kernel policy table cannot be read.
fn execute_list(
    config: &XfrmGuardConfig,
    all: bool,
    writer: &OutputWriter,
) -> Result<(), CliError> {
    let req_id = config.ipsec.request_id;
    info!(req_id, all, "listing kernel XFRM policies");

    let policies = read_kernel_policies(&NetlinkXfrmConnector)?;
    let report = PolicyListReport::build(&policies, req_id, all);
    writer.render(&report)?;
    Ok(())
}

fn read_kernel_policies<C: XfrmConnector>(connector: &C) -> Result<Vec<XfrmPolicy>, CliError> {
    let mut handle = connector
        .connect()
        .map_err(|e| CliError::Command(e.to_string()))?;
    let result = handle.list_policies(AddressFamily::V4);
    handle.close();
    result.map_err(|e| CliError::Command(e.to_string()))
}

/// Runs a `PolicyTable` with IPsec disabled until the `remove-all` phase
/// has been applied.
///
/// # Errors
///
/// Returns `CliError::Fatal` if reconciliation gives up.
fn execute_cleanup(
    config: &XfrmGuardConfig,
    short_grace: bool,
    interval_ms: u64,
    writer: &OutputWriter,
) -> Result<(), CliError> {
    let req_id = config.ipsec.request_id;
    let short = short_grace || config.ipsec.short_grace_time;
    info!(req_id, short_grace = short, interval_ms, "starting graceful IPsec policy cleanup");

    let mut table = PolicyTable::new(req_id, false, short);
    let report = drive_cleanup(&mut table, &SystemClock, Duration::from_millis(interval_ms))?;
    writer.render(&report)?;
    Ok(())
}

/// Applies `table` every `interval` until it has applied the last phase.
fn drive_cleanup<C: XfrmConnector, K: Clock>(
    table: &mut PolicyTable<C, K>,
    clock: &impl Clock,
    interval: Duration,
) -> Result<CleanupReport, FatalReconciliationError> {
    let mut rounds = 0u32;
    let mut phases = Vec::new();
    loop {
        table.apply()?;
        rounds += 1;

        let phase = table.graceful_shutdown_phase();
        if phases.last() != Some(&phase) {
            info!(phase = %phase, remaining = table.active_policy_count(), "cleanup phase applied");
            phases.push(phase);
        }
        if phase == GracefulShutdownPhase::RemoveAll {
            break;
        }
        clock.sleep(interval);
    }

    Ok(CleanupReport {
        request_id: table.req_id(),
        rounds,
        phases: phases.iter().map(|p| p.as_str().to_owned()).collect(),
        remaining_policies: table.active_policy_count(),
    })
}

/// One kernel policy as shown by `policy list`.
#[derive(Debug, Serialize)]
pub struct PolicyEntry {
    /// Carries the configured request id
    pub owned: bool,
    pub direction: String,
    /// Decoded selector, for owned policies
    #[serde(skip_serializing_if = "Option::is_none")]
    pub selector: Option<String>,
    /// Decoded rule, for owned policies
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rule: Option<String>,
    /// Raw kernel representation
    pub kernel: String,
}

#[derive(Debug, Serialize)]
pub struct PolicyListReport {
    pub request_id: u32,
    pub include_foreign: bool,
    pub policies: Vec<PolicyEntry>,
}

impl PolicyListReport {
    fn build(policies: &[XfrmPolicy], req_id: u32, all: bool) -> Self {
        let policies = policies
            .iter()
            .filter_map(|policy| {
                let decoded = policy.decode_owned(req_id);
                if decoded.is_none() && !all {
                    return None;
                }
                Some(PolicyEntry {
                    owned: decoded.is_some(),
                    direction: policy.dir.as_str().to_owned(),
                    selector: decoded.map(|(sel, _)| sel.to_string()),
                    rule: decoded.map(|(_, rule)| rule.to_string()),
                    kernel: policy.to_string(),
                })
            })
            .collect();
        Self {
            request_id: req_id,
            include_foreign: all,
            policies,
        }
    }
}

impl Render for PolicyListReport {
    fn render_text(&self, w: &mut dyn Write) -> std::io::Result<()> {
        use colored::Colorize;

        writeln!(
            w,
            "XFRM policies (reqid {}): {}",
            self.request_id,
            self.policies.len().to_string().bold()
        )?;
        if self.policies.is_empty() {
            return Ok(());
        }

        writeln!(w)?;
        writeln!(w, "{:<7} {:<5} {}", "OWNER", "DIR", "POLICY")?;
        writeln!(w, "{}", "-".repeat(72))?;
        for entry in &self.policies {
            let owner = if entry.owned { "ours".green() } else { "other".dimmed() };
            let detail = match (&entry.selector, &entry.rule) {
                (Some(sel), Some(rule)) => format!("{sel} => {rule}"),
                _ => entry.kernel.clone(),
            };
            writeln!(w, "{:<7} {:<5} {}", owner, entry.direction, detail)?;
        }
        Ok(())
    }
}

#[derive(Debug, Serialize)]
pub struct CleanupReport {
    pub request_id: u32,
    pub rounds: u32,
    /// Phases in the order they were applied
    pub phases: Vec<String>,
    pub remaining_policies: usize,
}

impl Render for CleanupReport {
    fn render_text(&self, w: &mut dyn Write) -> std::io::Result<()> {
        use colored::Colorize;

        writeln!(w, "IPsec policy cleanup (reqid {})", self.request_id)?;
        writeln!(w, "  Phases: {}", self.phases.join(" -> "))?;
        writeln!(w, "  Rounds: {}", self.rounds)?;
        if self.remaining_policies == 0 {
            writeln!(w, "  Result: {}", "CLEAN".green().bold())
        } else {
            writeln!(
                w,
                "  Result: {} ({} policies remain)",
                "INCOMPLETE".red().bold(),
                self.remaining_policies
            )
        }
    }
}
