//! relayctl - Relay Control CLI Tool
//!
//! Operates on the node directly, without going through relayctld. Useful
//! for bootstrapping a node and for inspecting what the daemon would do.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use librelayctl::config::{AgentConfig, DEFAULT_CONFIG_PATH};
use librelayctl::routing::render_acl;
use librelayctl::*;
use serde::Serialize;
use std::path::PathBuf;
use std::process;
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "relayctl")]
#[command(version)]
#[command(about = "Relay control tool - certificates, SNI, ACLs, egress routing", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file
    #[arg(short, long, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Output format: text, json
    #[arg(short = 'o', long, default_value = "text")]
    output: String,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// TLS certificates
    #[command(subcommand)]
    Cert(CertCommands),

    /// SNI domain registry
    #[command(subcommand)]
    Sni(SniCommands),

    /// Print the ACL for an obfuscation mode
    Acl {
        /// none, masquerade, salamander, outbound_proxy, tls_mimicry
        mode: String,
    },

    /// Egress routing rules
    #[command(subcommand)]
    Routing(RoutingCommands),

    /// Print the relay descriptor for the current state
    Render,
}

#[derive(Subcommand)]
enum CertCommands {
    /// Generate a self-signed certificate
    Generate { domain: String },
    /// Install a PEM certificate and key
    Install {
        domain: String,
        #[arg(long)]
        cert: PathBuf,
        #[arg(long)]
        key: PathBuf,
    },
    /// Check the installed certificate for a domain
    Validate { domain: String },
    /// Obtain a certificate via ACME, falling back to self-signed
    Issue {
        domain: String,
        #[arg(long)]
        email: String,
        /// http-01, tls-alpn-01, dns-01
        #[arg(long, default_value = "http-01")]
        challenge: String,
    },
    /// Renew every issued certificate close to expiry
    Renew,
    /// List domains with installed certificates
    List,
}

#[derive(Subcommand)]
enum SniCommands {
    /// Register a domain (generates a self-signed certificate if needed)
    Add { domain: String },
    /// Unregister a domain
    Remove { domain: String },
    /// Show the registry
    Status,
}

#[derive(Subcommand)]
enum RoutingCommands {
    /// Redirect relay traffic into the outbound proxy and masquerade egress
    Setup {
        /// Local proxy port
        #[arg(long)]
        port: u32,
        /// Interface relay clients arrive on
        #[arg(long)]
        interface: String,
        /// Egress interface (defaults to the configured one)
        #[arg(long)]
        egress: Option<String>,
        /// Print the commands instead of running them
        #[arg(long)]
        dry_run: bool,
    },
    /// Remove all relayctl chains
    Cleanup {
        #[arg(long)]
        dry_run: bool,
    },
    /// List relayctl chains present on the host
    List,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    if cli.verbose {
        tracing_subscriber::fmt()
            .with_env_filter("relayctl=debug,librelayctl=debug")
            .with_target(false)
            .with_ansi(atty::is(atty::Stream::Stderr))
            .with_writer(std::io::stderr)
            .init();
    }

    let result = match cli.command {
        Commands::Cert(ref cmd) => handle_cert(cmd, &cli).await,
        Commands::Sni(ref cmd) => handle_sni(cmd, &cli).await,
        Commands::Acl { ref mode } => handle_acl(mode),
        Commands::Routing(ref cmd) => handle_routing(cmd, &cli).await,
        Commands::Render => handle_render(&cli).await,
    };

    if let Err(e) = result {
        eprintln!("Error: {:#}", e);
        process::exit(1);
    }
}

fn load_config(cli: &Cli) -> Result<AgentConfig> {
    AgentConfig::load_or_default(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))
}

async fn agent(cli: &Cli) -> Result<RelayAgent> {
    let config = load_config(cli)?;
    Ok(RelayAgent::from_config(config).await?)
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn print_certificate(cert: &DomainCertificate) {
    println!("Domain:      {}", cert.domain);
    println!("Certificate: {}", cert.cert_path.display());
    println!("Key:         {}", cert.key_path.display());
    println!("Issuer:      {}{}", cert.issuer_cn, if cert.self_signed { " (self-signed)" } else { "" });
    println!("Valid:       {} .. {}", cert.not_before, cert.not_after);
    println!("SHA-256:     {}", cert.fingerprint);
}

async fn handle_cert(cmd: &CertCommands, cli: &Cli) -> Result<()> {
    let agent = agent(cli).await?;
    let store = agent.certificates();

    match cmd {
        CertCommands::Generate { domain } => {
            let cert = store.generate_self_signed(domain).await?;
            if cli.output == "json" {
                print_json(&cert)?;
            } else {
                print_certificate(&cert);
            }
        }
        CertCommands::Install { domain, cert, key } => {
            let cert_pem = std::fs::read_to_string(cert)
                .with_context(|| format!("reading {}", cert.display()))?;
            let key_pem = std::fs::read_to_string(key)
                .with_context(|| format!("reading {}", key.display()))?;
            let installed = store.install(domain, &cert_pem, &key_pem).await?;
            if cli.output == "json" {
                print_json(&installed)?;
            } else {
                print_certificate(&installed);
            }
        }
        CertCommands::Validate { domain } => {
            let cert = store.validate(domain).await?;
            if cli.output == "json" {
                print_json(&cert)?;
            } else {
                print_certificate(&cert);
                println!("Status:      valid");
            }
        }
        CertCommands::Issue { domain, email, challenge } => {
            let challenge: ChallengeType = challenge.parse()?;
            let outcome = store.automated_issuance(domain, email, challenge).await?;
            if let IssuanceOutcome::SelfSignedFallback { reason, .. } = &outcome {
                eprintln!("Warning: issuance failed, installed a self-signed certificate: {}", reason);
            }
            if cli.output == "json" {
                print_json(outcome.certificate())?;
            } else {
                print_certificate(outcome.certificate());
            }
        }
        CertCommands::Renew => {
            let report = agent.renew_certificates().await;
            if cli.output == "json" {
                print_json(&report)?;
            } else {
                for domain in &report.renewed {
                    println!("renewed  {}", domain);
                }
                for domain in &report.skipped {
                    println!("skipped  {}", domain);
                }
                for (domain, reason) in &report.failed {
                    println!("FAILED   {}: {}", domain, reason);
                }
            }
            if !report.failed.is_empty() {
                anyhow::bail!("{} renewal(s) failed", report.failed.len());
            }
        }
        CertCommands::List => {
            let domains = store.list_domains().await?;
            if cli.output == "json" {
                print_json(&domains)?;
            } else {
                for domain in domains {
                    let state = match store.validate(&domain).await {
                        Ok(cert) if cert.self_signed => "self-signed".to_string(),
                        Ok(_) => "valid".to_string(),
                        Err(e) => e.to_string(),
                    };
                    println!("{:<40} {}", domain, state);
                }
            }
        }
    }
    Ok(())
}

async fn handle_sni(cmd: &SniCommands, cli: &Cli) -> Result<()> {
    let agent = agent(cli).await?;

    let status = match cmd {
        SniCommands::Add { domain } => agent.add_sni_domain(domain).await?,
        SniCommands::Remove { domain } => agent.remove_sni_domain(domain).await?,
        SniCommands::Status => agent.sni_status().await,
    };

    if cli.output == "json" {
        print_json(&status)?;
    } else {
        println!("SNI:     {}", if status.enabled { "enabled" } else { "disabled" });
        println!("Primary: {}", status.primary.as_deref().unwrap_or("-"));
        for domain in &status.domains {
            println!("  {}", domain);
        }
    }
    Ok(())
}

fn handle_acl(mode: &str) -> Result<()> {
    let mode: ObfuscationMode = mode.parse()?;
    print!("{}", render_acl(mode));
    Ok(())
}

async fn handle_routing(cmd: &RoutingCommands, cli: &Cli) -> Result<()> {
    let config = load_config(cli)?;
    let dry_run = match cmd {
        RoutingCommands::Setup { dry_run, .. } | RoutingCommands::Cleanup { dry_run } => *dry_run,
        RoutingCommands::List => false,
    };

    let scripted = Arc::new(ScriptedGateway::succeeding());
    let gateway: Arc<dyn ToolGateway> = if dry_run {
        scripted.clone()
    } else {
        Arc::new(SystemGateway::new())
    };
    let egress_default = config.proxy.egress_interface.clone();
    let agent = RelayAgent::with_gateway(config, gateway).await?;
    let router = agent.router();

    match cmd {
        RoutingCommands::Setup { port, interface, egress, .. } => {
            router.setup_routing(*port, interface).await?;
            router
                .enable_masquerade(egress.as_deref().unwrap_or(&egress_default))
                .await?;
            if !dry_run {
                println!("Routing active: {} -> 127.0.0.1:{}", interface, port);
            }
        }
        RoutingCommands::Cleanup { .. } => {
            router.cleanup_routing().await?;
            if !dry_run {
                println!("Routing removed");
            }
        }
        RoutingCommands::List => {
            let chains = router.list_chains().await?;
            if cli.output == "json" {
                print_json(&chains)?;
            } else if chains.is_empty() {
                println!("No relayctl chains present");
            } else {
                for chain in chains {
                    println!("{:<8} {:<12} {} rule(s)", chain.table, chain.name, chain.rules);
                }
            }
        }
    }

    if dry_run {
        for line in scripted.lines() {
            println!("{}", line);
        }
    }
    Ok(())
}

async fn handle_render(cli: &Cli) -> Result<()> {
    let agent = agent(cli).await?;
    println!("{}", agent.render_descriptor().await?);
    Ok(())
}
