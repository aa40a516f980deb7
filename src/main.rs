//! fwqueue - serialized, idempotent iptables rule application
//!
//! Command-line front end to the rule queue.
//!
//! # Usage
//!
//! ```bash
//! fwqueue allow --protocol tcp --src 10.0.0.5 --dport 443      # host ACL
//! fwqueue drop --src 10.0.0.7 --delete                          # remove an ACL
//! fwqueue port-forward --dest-ip 1.2.3.4 --dport 8080 --to-ip 10.0.0.9 --to-port 80
//! fwqueue dns --src 192.168.0.0/24 --server 10.0.0.1
//! fwqueue dhcp 192.168.218.1/24 --remove
//! fwqueue diag-http 10.0.0.2
//! fwqueue apply requests.json                                   # JSON array of requests
//! fwqueue run migrate.txt                                       # one raw command per line
//! fwqueue flush
//! fwqueue wrap iptables -A INPUT -j DROP                        # print idempotent form
//! fwqueue --dry-run dns --server 10.0.0.1                       # print, don't execute
//! ```

use clap::{Args, Parser, Subcommand};
use fwqueue::config::{self, AppConfig};
use fwqueue::core::bulk;
use fwqueue::core::rule::{
    DEFAULT_CHAIN, DhcpMasquerade, DiagHttpRedirect, DnsRedirect, HostAcl, HostAclAction,
    Intent, PortForward, PortRange, Protocol, RuleChangeRequest, Verdict,
};
use fwqueue::{ApplyReport, ProcessRunner, RuleQueue, Synthesizer, wrap_idempotent};
use ipnetwork::IpNetwork;
use std::net::{IpAddr, Ipv4Addr};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use tracing::{Level, warn};

type CliResult<T> = Result<T, Box<dyn std::error::Error>>;

#[derive(Parser)]
#[command(name = "fwqueue")]
#[command(about = "Serialized, idempotent iptables rule application", long_about = None)]
struct Cli {
    /// Log debug output
    #[arg(short, long, global = true)]
    verbose: bool,
    /// Write logs to this file instead of stderr
    #[arg(long, global = true, value_name = "PATH")]
    log_file: Option<PathBuf>,
    /// Config file (default: config.json in the data directory)
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,
    /// Print the commands that would run, execute nothing
    #[arg(long, global = true)]
    dry_run: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Host ACL with an ACCEPT verdict
    Allow(HostArgs),
    /// Host ACL with a DROP verdict
    Drop(HostArgs),
    /// Host ACL with a REJECT verdict
    Reject(HostArgs),
    /// List a filter chain
    List {
        #[arg(default_value = DEFAULT_CHAIN)]
        chain: String,
        #[arg(long)]
        sudo: bool,
    },
    /// NAT port forward
    PortForward {
        #[arg(short, long, default_value = "tcp")]
        protocol: Protocol,
        /// External destination address
        #[arg(long)]
        dest_ip: Ipv4Addr,
        /// External port or range (a:b)
        #[arg(long)]
        dport: PortRange,
        /// Internal target address
        #[arg(long)]
        to_ip: Ipv4Addr,
        /// Internal target port or range
        #[arg(long)]
        to_port: PortRange,
        #[arg(long)]
        remove: bool,
    },
    /// Redirect DNS (tcp and udp port 53) to another resolver
    Dns {
        /// Source scope; 0.0.0.0/0 matches the LAN interface
        #[arg(long, default_value = "0.0.0.0/0")]
        src: IpNetwork,
        /// Resolver address, optionally with :port
        #[arg(long)]
        server: String,
        #[arg(long)]
        remove: bool,
    },
    /// Masquerade a DHCP subnet
    Dhcp {
        cidr: IpNetwork,
        #[arg(long)]
        remove: bool,
    },
    /// Redirect port 80 for an address to the diagnostic page
    DiagHttp {
        ip: IpAddr,
        #[arg(long)]
        remove: bool,
    },
    /// Submit a JSON array of requests, in file order
    Apply { file: PathBuf },
    /// Run raw commands from a file, one per line, with the bulk runner
    Run { file: PathBuf },
    /// Flush the filter, nat, raw and mangle tables
    Flush,
    /// Print the idempotent form of a raw iptables command line
    Wrap {
        #[arg(trailing_var_arg = true, allow_hyphen_values = true, num_args = 1..)]
        rule: Vec<String>,
    },
}

#[derive(Args)]
struct HostArgs {
    #[arg(long, default_value = DEFAULT_CHAIN)]
    chain: String,
    #[arg(short, long)]
    protocol: Option<Protocol>,
    /// Source address; 0.0.0.0 matches the LAN interface instead
    #[arg(long)]
    src: Option<IpNetwork>,
    #[arg(long)]
    dst: Option<IpNetwork>,
    #[arg(long)]
    sport: Option<PortRange>,
    #[arg(long)]
    dport: Option<PortRange>,
    #[arg(long = "in", value_name = "IFACE")]
    in_iface: Option<String>,
    #[arg(long = "out", value_name = "IFACE")]
    out_iface: Option<String>,
    #[arg(long)]
    mac: Option<String>,
    /// Insert at the top of the chain instead of appending
    #[arg(long, conflicts_with = "delete")]
    insert: bool,
    /// Remove the rule if present
    #[arg(long)]
    delete: bool,
    /// Run through the privilege launcher
    #[arg(long)]
    sudo: bool,
}

impl HostArgs {
    fn into_acl(self) -> (HostAcl, bool) {
        let action = if self.delete {
            HostAclAction::Delete
        } else if self.insert {
            HostAclAction::Insert
        } else {
            HostAclAction::Append
        };
        let acl = HostAcl {
            action,
            chain: self.chain,
            protocol: self.protocol,
            src: self.src,
            dst: self.dst,
            sport: self.sport,
            dport: self.dport,
            in_iface: self.in_iface,
            out_iface: self.out_iface,
            target: None,
            mac: self.mac,
        };
        (acl, self.sudo)
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.verbose, cli.log_file.as_deref());

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("Error: failed to create Tokio runtime: {e}");
            return ExitCode::FAILURE;
        }
    };

    match runtime.block_on(handle_cli(cli)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {e}");
            ExitCode::FAILURE
        }
    }
}

fn init_logging(verbose: bool, log_file: Option<&Path>) {
    let level = if verbose { Level::DEBUG } else { Level::INFO };
    let subscriber = tracing_subscriber::fmt().with_max_level(level);

    if let Some(path) = log_file {
        match std::fs::File::create(path) {
            Ok(file) => {
                subscriber.with_writer(file).with_ansi(false).init();
                return;
            }
            Err(e) => eprintln!("Cannot open log file {}: {e}", path.display()),
        }
    }
    subscriber.with_writer(std::io::stderr).init();
}

/// Either a live queue or, for `--dry-run`, just the synthesizer
enum Target {
    Live(RuleQueue),
    DryRun(Synthesizer),
}

impl Target {
    fn new(config: &AppConfig, dry_run: bool) -> CliResult<Self> {
        if dry_run {
            let prefix = fwqueue::elevation::resolve_prefix(config.elevation).unwrap_or_else(|e| {
                warn!("{e}; showing commands without a launcher");
                Vec::new()
            });
            Ok(Target::DryRun(Synthesizer::from_config(config, prefix)))
        } else {
            Ok(Target::Live(RuleQueue::from_config(config)?))
        }
    }

    fn synthesizer(&self) -> &Synthesizer {
        match self {
            Target::Live(queue) => queue.synthesizer(),
            Target::DryRun(synth) => synth,
        }
    }

    /// Prints the plan in dry-run mode, otherwise applies and reports
    async fn apply(&self, request: RuleChangeRequest) -> CliResult<()> {
        match self {
            Target::DryRun(synth) => {
                println!("{}", synth.plan(&request)?.invocation);
                Ok(())
            }
            Target::Live(queue) => {
                let report = queue.apply(request).await?;
                print_report(&report);
                Ok(())
            }
        }
    }
}

fn print_report(report: &ApplyReport) {
    println!(
        "✓ {} {}: {}",
        report.category, report.intent, report.status
    );
    for step in report.failed_steps() {
        println!("  ignored: {step:?}");
    }
    for warning in &report.warnings {
        println!("  warning: {warning}");
    }
    if !report.output.trim().is_empty() {
        println!("{}", report.output.trim_end());
    }
}

async fn handle_cli(cli: Cli) -> CliResult<()> {
    let config = match &cli.config {
        Some(path) => config::load_config_from(path).await?,
        None => config::load_config().await,
    };

    match cli.command {
        Commands::Wrap { rule } => {
            println!("{}", wrap_idempotent(&rule.join(" ")));
            Ok(())
        }
        Commands::Run { file } => run_file(&config, &file, cli.dry_run).await,
        Commands::Flush => {
            let target = Target::new(&config, cli.dry_run)?;
            let command = bulk::flush_command(target.synthesizer());
            if cli.dry_run {
                println!("{command}");
                return Ok(());
            }
            bulk::flush(&ProcessRunner::new(), target.synthesizer(), config.bulk_timeout()).await?;
            println!("✓ Tables flushed");
            Ok(())
        }
        Commands::Apply { file } => {
            let target = Target::new(&config, cli.dry_run)?;
            apply_file(&target, &file).await
        }
        command => {
            let target = Target::new(&config, cli.dry_run)?;
            apply_single(&target, command).await
        }
    }
}

async fn apply_single(target: &Target, command: Commands) -> CliResult<()> {
    let request = match command {
        Commands::Allow(args) => host_request(args, Verdict::Accept),
        Commands::Drop(args) => host_request(args, Verdict::Drop),
        Commands::Reject(args) => host_request(args, Verdict::Reject),
        Commands::List { chain, sudo } => {
            let acl = HostAcl {
                action: HostAclAction::List,
                chain,
                ..HostAcl::default()
            };
            RuleChangeRequest::new(acl.into()).elevated(sudo)
        }
        Commands::PortForward {
            protocol,
            dest_ip,
            dport,
            to_ip,
            to_port,
            remove,
        } => RuleChangeRequest::new(
            PortForward {
                protocol,
                dest_ip,
                dport,
                to_ip,
                to_port,
                state: !remove,
            }
            .into(),
        ),
        Commands::Dns {
            src,
            server,
            remove,
        } => RuleChangeRequest::new(
            DnsRedirect {
                ip: src,
                dns: server,
                state: !remove,
            }
            .into(),
        ),
        Commands::Dhcp { cidr, remove } => RuleChangeRequest::new(
            DhcpMasquerade {
                ip: cidr,
                state: !remove,
            }
            .into(),
        ),
        Commands::DiagHttp { ip, remove } => RuleChangeRequest::new(
            DiagHttpRedirect {
                ip,
                state: !remove,
            }
            .into(),
        ),
        Commands::Apply { .. } | Commands::Run { .. } | Commands::Flush | Commands::Wrap { .. } => {
            return Err("not a single-request command".into());
        }
    };
    target.apply(request).await
}

fn host_request(args: HostArgs, verdict: Verdict) -> RuleChangeRequest {
    let (acl, sudo) = args.into_acl();
    let acl = HostAcl {
        target: Some(verdict),
        ..acl
    };
    RuleChangeRequest::new(acl.into()).elevated(sudo)
}

/// Admits every request in the file, queues them all, then reports in order.
/// Fails if any request was rejected or any add failed.
async fn apply_file(target: &Target, file: &Path) -> CliResult<()> {
    let text = tokio::fs::read_to_string(file).await?;
    let values: Vec<serde_json::Value> = serde_json::from_str(&text)?;
    let mut failures = 0usize;

    let mut admitted = Vec::with_capacity(values.len());
    for (index, value) in values.iter().enumerate() {
        match RuleChangeRequest::from_json(value) {
            Ok(request) => admitted.push((index, request)),
            Err(e) => {
                eprintln!("✗ #{index}: {e}");
                failures += 1;
            }
        }
    }

    match target {
        Target::DryRun(_) => {
            for (_, request) in admitted {
                target.apply(request).await?;
            }
        }
        Target::Live(queue) => {
            let mut tickets = Vec::with_capacity(admitted.len());
            for (index, request) in admitted {
                let intent = request.intent();
                match queue.submit(request) {
                    Ok(ticket) => tickets.push((index, intent, ticket)),
                    Err(e) => {
                        eprintln!("✗ #{index}: {e}");
                        failures += 1;
                    }
                }
            }
            for (index, intent, ticket) in tickets {
                match ticket.await {
                    Ok(report) => print_report(&report),
                    Err(e) => {
                        eprintln!("✗ #{index}: {e}");
                        if intent == Intent::Add {
                            failures += 1;
                        }
                    }
                }
            }
        }
    }

    if failures > 0 {
        return Err(format!("{failures} request(s) failed").into());
    }
    Ok(())
}

async fn run_file(config: &AppConfig, file: &Path, dry_run: bool) -> CliResult<()> {
    let text = tokio::fs::read_to_string(file).await?;
    let commands: Vec<String> = text
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(String::from)
        .collect();

    if dry_run {
        for command in &commands {
            println!("{command}");
        }
        return Ok(());
    }

    bulk::run_all(
        &ProcessRunner::new(),
        &commands,
        config.bulk_timeout(),
        |index, command, result| match result {
            Ok(_) => println!("✓ [{index}] {command}"),
            Err(e) => eprintln!("✗ [{index}] {command}: {e}"),
        },
    )
    .await?;
    Ok(())
}
