use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use trafficd::bpf::BpfMode;
use trafficd::config::{Config, DEFAULT_CONFIG_PATH};
use trafficd::controller::{ChildChain, FirewallRule, FirewallType, StatsFilter, StatsLine};
use trafficd::{SkDestroyListener, TrafficController};

/// Format bytes as human-readable string (e.g., "1.5 MB", "500 KB")
fn human_readable(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;

    if bytes >= GB {
        format!("{:.1} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.1} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.1} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} B", bytes)
    }
}

/// trafficd - per-uid network traffic accounting and firewall
#[derive(Parser, Debug)]
#[command(name = "trafficd")]
#[command(version)]
#[command(about = "Per-uid traffic accounting and firewall over pinned BPF maps", long_about = None)]
struct Args {
    /// Configuration file
    #[arg(long, value_name = "PATH", default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Accounting backend: auto (BPF when supported), force (always BPF), legacy (qtaguid)
    #[arg(long, value_name = "MODE")]
    bpf_mode: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Set up maps and programs, then drop tags of destroyed sockets until Ctrl+C
    Run,

    /// Print map and program status
    Dump {
        /// Also list every row
        #[arg(long)]
        verbose: bool,
    },

    /// Print traffic statistics
    Stats {
        /// Only this uid
        #[arg(long)]
        uid: Option<u32>,

        /// Only this interface (repeatable)
        #[arg(long)]
        iface: Vec<String>,

        /// Only this tag
        #[arg(long)]
        tag: Option<u32>,

        /// Emit JSON instead of a table
        #[arg(long)]
        json: bool,
    },

    /// Move a uid into a counter set (0 restores the default)
    CounterSet { counter_set: u32, uid: u32 },

    /// Delete a uid's data for one tag, or all of it with tag 0
    DeleteTagData { tag: u32, uid: u32 },

    /// Register an interface name for an index
    AddInterface { name: String, index: u32 },

    /// Manage the uid owner chains
    Firewall {
        #[command(subcommand)]
        action: FirewallAction,
    },

    /// Write the effective configuration, defaults filled in, to the config path
    WriteConfig,
}

#[derive(Subcommand, Debug)]
enum FirewallAction {
    /// Change the rule of one uid
    Rule {
        #[arg(value_enum)]
        chain: ChainArg,
        uid: u32,
        #[arg(value_enum)]
        rule: RuleArg,
        #[arg(long)]
        blacklist: bool,
    },

    /// Replace the uids of a chain (fw_dozable, fw_standby, fw_powersave)
    Replace {
        chain: String,
        #[arg(long)]
        blacklist: bool,
        uids: Vec<u32>,
    },

    /// Enable or disable a chain
    Toggle {
        #[arg(value_enum)]
        chain: ChainArg,
        #[arg(action = clap::ArgAction::Set)]
        enable: bool,
    },
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum ChainArg {
    Dozable,
    Standby,
    Powersave,
}

impl From<ChainArg> for ChildChain {
    fn from(arg: ChainArg) -> Self {
        match arg {
            ChainArg::Dozable => ChildChain::Dozable,
            ChainArg::Standby => ChildChain::Standby,
            ChainArg::Powersave => ChildChain::Powersave,
        }
    }
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum RuleArg {
    Allow,
    Deny,
}

impl From<RuleArg> for FirewallRule {
    fn from(arg: RuleArg) -> Self {
        match arg {
            RuleArg::Allow => FirewallRule::Allow,
            RuleArg::Deny => FirewallRule::Deny,
        }
    }
}

/// Start the controller and run the destroy listener until Ctrl+C
async fn run_daemon(config: &Config, mode: BpfMode) -> Result<()> {
    use tokio::signal;

    let controller = Arc::new(
        TrafficController::start(config, mode).context("Failed to start traffic controller")?,
    );
    println!(
        "trafficd started (BPF accounting: {})",
        if controller.check_bpf_stats_enable() {
            "on"
        } else {
            "off"
        }
    );

    let stop = Arc::new(AtomicBool::new(false));
    let listener_task = if controller.check_bpf_stats_enable() {
        let listener =
            SkDestroyListener::new().context("Failed to open sock_diag netlink socket")?;
        let controller = Arc::clone(&controller);
        let stop = Arc::clone(&stop);
        Some(tokio::task::spawn_blocking(move || {
            listener.run(&controller, &stop)
        }))
    } else {
        None
    };

    println!("Press Ctrl+C to stop...");
    signal::ctrl_c().await?;
    println!("\n🛑 Received Ctrl+C, shutting down...");

    stop.store(true, Ordering::Relaxed);
    if let Some(task) = listener_task {
        task.await
            .context("Socket destroy listener panicked")?
            .context("Socket destroy listener failed")?;
    }

    Ok(())
}

fn print_stats(controller: &TrafficController, filter: &StatsFilter, json: bool) -> Result<()> {
    let detail = controller.network_stats_detail(filter)?;
    let dev = controller.network_stats_dev()?;

    if json {
        #[derive(serde::Serialize)]
        struct Report<'a> {
            ifaces: &'a [StatsLine],
            detail: &'a [StatsLine],
        }
        let report = Report {
            ifaces: &dev,
            detail: &detail,
        };
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    println!("Interfaces:");
    for line in &dev {
        println!(
            "  {:16} rx {:>10} ({} pkts)  tx {:>10} ({} pkts)",
            line.iface,
            human_readable(line.rx_bytes),
            line.rx_packets,
            human_readable(line.tx_bytes),
            line.tx_packets
        );
    }

    println!();
    println!(
        "  {:16} {:>8} {:>4} {:>10} {:>10} {:>10}",
        "IFACE", "UID", "SET", "TAG", "RX", "TX"
    );
    for line in &detail {
        println!(
            "  {:16} {:>8} {:>4} {:>#10x} {:>10} {:>10}",
            line.iface,
            line.uid,
            line.set,
            line.tag,
            human_readable(line.rx_bytes),
            human_readable(line.tx_bytes)
        );
    }

    if let Some(uid) = filter.uid {
        let total = controller.uid_stats(uid)?;
        println!();
        println!(
            "uid {} total: rx {} tx {}",
            uid,
            human_readable(total.rx_bytes),
            human_readable(total.tx_bytes)
        );
    }

    Ok(())
}

fn run_firewall(controller: &TrafficController, action: FirewallAction) -> Result<()> {
    match action {
        FirewallAction::Rule {
            chain,
            uid,
            rule,
            blacklist,
        } => {
            let fw_type = if blacklist {
                FirewallType::Blacklist
            } else {
                FirewallType::Whitelist
            };
            controller.change_uid_owner_rule(chain.into(), uid, rule.into(), fw_type)?;
        }
        FirewallAction::Replace {
            chain,
            blacklist,
            uids,
        } => controller.replace_uid_owner_map(&chain, !blacklist, &uids)?,
        FirewallAction::Toggle { chain, enable } => {
            controller.toggle_uid_owner_map(chain.into(), enable)?
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    // Parse CLI arguments
    let args = Args::parse();

    if std::env::var("RUST_LOG").is_ok() {
        pretty_env_logger::formatted_builder()
            .parse_default_env()
            .init();
    }

    let config = Config::load(&args.config)?;
    let mode = BpfMode::from_env_and_arg(args.bpf_mode.as_deref(), config.bpf_mode);
    log::info!("BPF mode: {:?}", mode);

    // Everything but `run` works on what a running daemon pinned
    let pinned = || TrafficController::open_pinned(&config, mode);

    match args.command {
        Command::Run => run_daemon(&config, mode).await?,
        Command::Dump { verbose } => pinned().dump(&mut io::stdout().lock(), verbose)?,
        Command::Stats {
            uid,
            iface,
            tag,
            json,
        } => {
            let filter = StatsFilter {
                ifaces: iface,
                tag,
                uid,
            };
            print_stats(&pinned(), &filter, json)?;
        }
        Command::CounterSet { counter_set, uid } => {
            pinned().set_counter_set(counter_set, uid)?;
            println!("✅ uid {} moved to counter set {}", uid, counter_set);
        }
        Command::DeleteTagData { tag, uid } => {
            pinned().delete_tag_data(tag, uid)?;
            println!("✅ Deleted tag {:#x} data of uid {}", tag, uid);
        }
        Command::AddInterface { name, index } => {
            pinned().add_interface(&name, index)?;
            println!("✅ Registered {} at index {}", name, index);
        }
        Command::Firewall { action } => run_firewall(&pinned(), action)?,
        Command::WriteConfig => {
            config.save(&args.config)?;
            println!("✅ Wrote {}", args.config.display());
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_human_readable() {
        assert_eq!(human_readable(512), "512 B");
        assert_eq!(human_readable(1536), "1.5 KB");
        assert_eq!(human_readable(3 * 1024 * 1024), "3.0 MB");
    }

    #[test]
    fn test_cli_parses_subcommands() {
        let args = Args::try_parse_from([
            "trafficd",
            "--bpf-mode",
            "legacy",
            "firewall",
            "replace",
            "fw_standby",
            "--blacklist",
            "10001",
            "10002",
        ])
        .unwrap();
        assert_eq!(args.bpf_mode.as_deref(), Some("legacy"));
        assert!(matches!(
            args.command,
            Command::Firewall {
                action: FirewallAction::Replace { blacklist: true, ref uids, .. }
            } if uids == &[10001, 10002]
        ));

        let args = Args::try_parse_from(["trafficd", "--config", "/tmp/t.json", "write-config"]).unwrap();
        assert!(matches!(args.command, Command::WriteConfig));
        assert_eq!(args.config, PathBuf::from("/tmp/t.json"));

        let args = Args::try_parse_from(["trafficd", "firewall", "toggle", "dozable", "true"]).unwrap();
        assert!(matches!(
            args.command,
            Command::Firewall {
                action: FirewallAction::Toggle {
                    chain: ChainArg::Dozable,
                    enable: true
                }
            }
        ));
    }
}
