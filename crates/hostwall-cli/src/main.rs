//! `hostwall` operator CLI.
//!
//! Every operation is one variant of a closed command enum dispatched through
//! a single exhaustive match; adding an operation without wiring it up is a
//! compile error, not a silent no-op. Mutating commands run against a
//! substrate state file (the native adapter is out of tree).

mod state;

use std::fs;
use std::io::Read as _;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::{Context, Result, bail};
use clap::{Args, Parser, Subcommand};
use serde::Serialize;
use tracing_subscriber::EnvFilter;

use hostwall_core::{
    CompilationError, CompilationWarning, CompiledFilter, FilterDirection, PathIdentityResolver,
    Policy, SimulationQuery, TransportProtocol, ValidationIssue, compile, simulate, validate,
};
use hostwall_engine::{EngineError, PolicyController, ReconcileEngine};
use hostwall_store::LkgStore;

use crate::state::{load_substrate, save_substrate};

/// Exit code for a policy rejected by validation or compilation.
const EXIT_POLICY_REJECTED: u8 = 2;

#[derive(Parser)]
#[command(name = "hostwall", version, about = "Host-based network traffic control plane")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Validate a policy document, reporting every problem found.
    Validate(PolicyInput),
    /// Compile a policy into its concrete filter set without applying it.
    Compile(PolicyInput),
    /// Dry-run a connection tuple against a policy.
    Simulate(SimulateArgs),
    /// Apply a policy to the substrate, transactionally.
    Apply(ApplyArgs),
    /// Remove every hostwall filter, keeping provider and sublayer.
    Rollback(StateArgs),
    /// Remove every filter plus the provider and sublayer.
    Teardown(StateArgs),
    /// Last-known-good policy operations.
    Lkg(LkgArgs),
    /// Startup recovery: re-apply the last-known-good policy, failing open.
    Bootstrap(BootstrapArgs),
}

#[derive(Args)]
struct PolicyInput {
    /// Policy JSON file; "-" reads stdin.
    #[arg(long)]
    policy: PathBuf,
}

#[derive(Args)]
struct SimulateArgs {
    /// Policy JSON file; "-" reads stdin.
    #[arg(long)]
    policy: PathBuf,
    /// Flow direction: inbound or outbound.
    #[arg(long)]
    direction: String,
    /// Transport protocol: tcp or udp.
    #[arg(long)]
    protocol: String,
    #[arg(long)]
    remote_ip: Option<Ipv4Addr>,
    #[arg(long)]
    remote_port: Option<u16>,
    /// Process path (or bare executable name) originating the flow.
    #[arg(long)]
    process: Option<String>,
}

#[derive(Args)]
struct StateArgs {
    /// Substrate state file; created when absent.
    #[arg(long)]
    state: PathBuf,
}

#[derive(Args)]
struct ApplyArgs {
    /// Policy JSON file; "-" reads stdin.
    #[arg(long)]
    policy: PathBuf,
    #[command(flatten)]
    state: StateArgs,
    /// Last-known-good store directory.
    #[arg(long, default_value = ".hostwall/lkg")]
    lkg_dir: PathBuf,
}

#[derive(Args)]
struct LkgArgs {
    #[command(subcommand)]
    command: LkgCommand,
}

#[derive(Subcommand)]
enum LkgCommand {
    /// Show metadata for the stored last-known-good policy.
    Show {
        /// Last-known-good store directory.
        #[arg(long, default_value = ".hostwall/lkg")]
        lkg_dir: PathBuf,
    },
    /// Re-apply the stored last-known-good policy.
    Revert {
        /// Substrate state file; created when absent.
        #[arg(long)]
        state: PathBuf,
        /// Last-known-good store directory.
        #[arg(long, default_value = ".hostwall/lkg")]
        lkg_dir: PathBuf,
    },
}

#[derive(Args)]
struct BootstrapArgs {
    /// Substrate state file; created when absent.
    #[arg(long)]
    state: PathBuf,
    /// Last-known-good store directory.
    #[arg(long, default_value = ".hostwall/lkg")]
    lkg_dir: PathBuf,
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match run(cli) {
        Ok(code) => code,
        Err(err) => {
            eprintln!("error: {err:#}");
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> Result<ExitCode> {
    match cli.command {
        Command::Validate(args) => run_validate(&args),
        Command::Compile(args) => run_compile(&args),
        Command::Simulate(args) => run_simulate(&args),
        Command::Apply(args) => run_apply(&args),
        Command::Rollback(args) => run_rollback(&args),
        Command::Teardown(args) => run_teardown(&args),
        Command::Lkg(args) => match args.command {
            LkgCommand::Show { lkg_dir } => run_lkg_show(&lkg_dir),
            LkgCommand::Revert { state, lkg_dir } => run_lkg_revert(&state, &lkg_dir),
        },
        Command::Bootstrap(args) => run_bootstrap(&args),
    }
}

#[derive(Serialize)]
struct ValidateOutput {
    is_valid: bool,
    issues: Vec<ValidationIssue>,
}

fn run_validate(args: &PolicyInput) -> Result<ExitCode> {
    let raw = read_input(&args.policy)?;
    let result = validate(&raw);
    let is_valid = result.is_valid();
    print_json(&ValidateOutput {
        is_valid,
        issues: result.issues,
    })?;
    Ok(if is_valid {
        ExitCode::SUCCESS
    } else {
        ExitCode::from(EXIT_POLICY_REJECTED)
    })
}

#[derive(Serialize)]
struct CompileOutput {
    is_success: bool,
    filter_count: usize,
    skipped_rule_count: usize,
    filters: Vec<CompiledFilter>,
    errors: Vec<CompilationError>,
    warnings: Vec<CompilationWarning>,
}

fn run_compile(args: &PolicyInput) -> Result<ExitCode> {
    let raw = read_input(&args.policy)?;
    let validation = validate(&raw);
    if !validation.is_valid() {
        print_json(&ValidateOutput {
            is_valid: false,
            issues: validation.issues,
        })?;
        return Ok(ExitCode::from(EXIT_POLICY_REJECTED));
    }
    let policy = Policy::from_json(&raw).context("parsing policy")?;
    let result = compile(&policy, &PathIdentityResolver);
    let is_success = result.is_success();
    print_json(&CompileOutput {
        is_success,
        filter_count: result.filters.len(),
        skipped_rule_count: result.skipped_rule_count,
        filters: result.filters,
        errors: result.errors,
        warnings: result.warnings,
    })?;
    Ok(if is_success {
        ExitCode::SUCCESS
    } else {
        ExitCode::from(EXIT_POLICY_REJECTED)
    })
}

fn run_simulate(args: &SimulateArgs) -> Result<ExitCode> {
    let raw = read_input(&args.policy)?;
    let validation = validate(&raw);
    if !validation.is_valid() {
        print_json(&ValidateOutput {
            is_valid: false,
            issues: validation.issues,
        })?;
        return Ok(ExitCode::from(EXIT_POLICY_REJECTED));
    }
    let policy = Policy::from_json(&raw).context("parsing policy")?;
    let query = SimulationQuery {
        direction: parse_direction(&args.direction)?,
        protocol: parse_protocol(&args.protocol)?,
        remote_ip: args.remote_ip,
        remote_port: args.remote_port,
        process_path: args.process.clone(),
    };
    print_json(&simulate(&policy, &query))?;
    Ok(ExitCode::SUCCESS)
}

#[derive(Serialize)]
struct RejectedOutput<'a, T: Serialize> {
    error: &'a str,
    details: &'a [T],
}

fn run_apply(args: &ApplyArgs) -> Result<ExitCode> {
    let raw = read_input(&args.policy)?;
    let substrate = load_substrate(&args.state.state)?;
    let controller = PolicyController::new(
        ReconcileEngine::new(substrate),
        LkgStore::new(&args.lkg_dir),
    );
    let source = args.policy.display().to_string();
    match controller.apply_policy_json(&raw, Some(source.as_str())) {
        Ok(report) => {
            print_json(&report)?;
            let substrate = controller.into_engine().into_substrate();
            save_substrate(&args.state.state, &substrate)?;
            Ok(ExitCode::SUCCESS)
        }
        Err(EngineError::Validation { issues }) => {
            print_json(&RejectedOutput {
                error: "policy validation failed",
                details: &issues,
            })?;
            Ok(ExitCode::from(EXIT_POLICY_REJECTED))
        }
        Err(EngineError::Compilation { errors }) => {
            print_json(&RejectedOutput {
                error: "policy compilation failed",
                details: &errors,
            })?;
            Ok(ExitCode::from(EXIT_POLICY_REJECTED))
        }
        Err(err) => Err(err.into()),
    }
}

#[derive(Serialize)]
struct RollbackOutput {
    removed: usize,
}

fn run_rollback(args: &StateArgs) -> Result<ExitCode> {
    let engine = ReconcileEngine::new(load_substrate(&args.state)?);
    let removed = engine.remove_all_filters()?;
    print_json(&RollbackOutput { removed })?;
    save_substrate(&args.state, &engine.into_substrate())?;
    Ok(ExitCode::SUCCESS)
}

fn run_teardown(args: &StateArgs) -> Result<ExitCode> {
    let engine = ReconcileEngine::new(load_substrate(&args.state)?);
    let result = engine.remove_infrastructure()?;
    print_json(&result)?;
    save_substrate(&args.state, &engine.into_substrate())?;
    Ok(ExitCode::SUCCESS)
}

fn run_lkg_show(lkg_dir: &Path) -> Result<ExitCode> {
    print_json(&LkgStore::new(lkg_dir).metadata())?;
    Ok(ExitCode::SUCCESS)
}

fn run_lkg_revert(state_path: &Path, lkg_dir: &Path) -> Result<ExitCode> {
    let controller = PolicyController::new(
        ReconcileEngine::new(load_substrate(state_path)?),
        LkgStore::new(lkg_dir),
    );
    let report = controller.lkg_revert()?;
    print_json(&report)?;
    save_substrate(state_path, &controller.into_engine().into_substrate())?;
    Ok(ExitCode::SUCCESS)
}

fn run_bootstrap(args: &BootstrapArgs) -> Result<ExitCode> {
    let controller = PolicyController::new(
        ReconcileEngine::new(load_substrate(&args.state)?),
        LkgStore::new(&args.lkg_dir),
    );
    let outcome = controller.recover_from_lkg();
    print_json(&outcome)?;
    save_substrate(&args.state, &controller.into_engine().into_substrate())?;
    // Startup recovery fails open: a missing or unusable LKG is still a
    // clean start.
    Ok(ExitCode::SUCCESS)
}

fn parse_direction(s: &str) -> Result<FilterDirection> {
    match s.to_ascii_lowercase().as_str() {
        "inbound" | "in" => Ok(FilterDirection::Inbound),
        "outbound" | "out" => Ok(FilterDirection::Outbound),
        other => bail!("unknown direction {other:?} (inbound, outbound)"),
    }
}

fn parse_protocol(s: &str) -> Result<TransportProtocol> {
    match s.to_ascii_lowercase().as_str() {
        "tcp" => Ok(TransportProtocol::Tcp),
        "udp" => Ok(TransportProtocol::Udp),
        other => bail!("unknown protocol {other:?} (tcp, udp)"),
    }
}

fn read_input(path: &Path) -> Result<String> {
    if path.as_os_str() == "-" {
        let mut raw = String::new();
        std::io::stdin()
            .read_to_string(&mut raw)
            .context("reading policy from stdin")?;
        Ok(raw)
    } else {
        fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
