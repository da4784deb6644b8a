//! `veilctl` command-line surface.
//!
//! `status` probes external dependencies and validates configuration,
//! reporting pass/fail per check. `demo` drives the full encrypted
//! workflow against the in-process simulator.

use std::sync::Arc;

use clap::{Args, Parser, Subcommand};
use tokio_stream::wrappers::WatchStream;
use tokio_stream::StreamExt;

use crate::activity::ActivityLog;
use crate::config::Config;
use crate::contract::StaticContractDirectory;
use crate::controller::EncryptedCounterController;
use crate::runtime::relayer::probe_relayer;
use crate::runtime::FheRuntimeBootstrapper;
use crate::signature::{DecryptionSignatureCache, LocalSigner, WalletSigner};
use crate::sim::{SimChain, SimRuntimeProvider};

#[derive(Parser, Debug)]
#[command(name = "veilctl", version, about = "ComputeVeil encrypted counter client")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Validate configuration and probe the relayer endpoint.
    Status,
    /// Run an end-to-end encrypted workflow against the local simulator.
    Demo(DemoArgs),
}

#[derive(Args, Debug)]
pub struct DemoArgs {
    /// Delta to apply to the encrypted counter (negative rolls back).
    #[arg(long, default_value_t = 3, allow_hyphen_values = true)]
    pub delta: i64,

    /// Skip the final local decryption step.
    #[arg(long)]
    pub skip_decrypt: bool,
}

pub async fn run(cli: Cli) -> anyhow::Result<()> {
    match cli.command {
        Command::Status => run_status().await,
        Command::Demo(args) => run_demo(args).await,
    }
}

fn check(name: &str, result: Result<String, String>, passed: &mut u32, failed: &mut u32) {
    match result {
        Ok(detail) => {
            println!("  ok   {name}: {detail}");
            *passed += 1;
        }
        Err(detail) => {
            println!("  FAIL {name}: {detail}");
            *failed += 1;
        }
    }
}

async fn run_status() -> anyhow::Result<()> {
    println!("ComputeVeil Status");
    println!("==================\n");

    let mut passed = 0u32;
    let mut failed = 0u32;

    let config = match Config::load() {
        Ok(config) => {
            check("Configuration", Ok("loaded".to_string()), &mut passed, &mut failed);
            Some(config)
        }
        Err(error) => {
            check("Configuration", Err(error.to_string()), &mut passed, &mut failed);
            None
        }
    };

    if let Some(config) = config {
        check(
            "Deployments",
            if config.deployments.is_empty() {
                Err("no contract deployments configured".to_string())
            } else {
                let mut chains: Vec<String> = config
                    .deployments
                    .chains()
                    .map(|(chain_id, address)| format!("{chain_id} -> {address}"))
                    .collect();
                chains.sort();
                Ok(chains.join(", "))
            },
            &mut passed,
            &mut failed,
        );

        match config.relayer.endpoint_url() {
            Ok(endpoint) => {
                check(
                    "Relayer endpoint",
                    Ok(endpoint.to_string()),
                    &mut passed,
                    &mut failed,
                );
                let probe = probe_relayer(&endpoint, config.relayer.timeout).await;
                check(
                    "Relayer reachability",
                    if probe.state.is_healthy() {
                        Ok(probe.detail)
                    } else {
                        Err(format!("{} ({})", probe.detail, probe.state.as_str()))
                    },
                    &mut passed,
                    &mut failed,
                );
            }
            Err(error) => {
                check(
                    "Relayer endpoint",
                    Err(error.to_string()),
                    &mut passed,
                    &mut failed,
                );
            }
        }
    }

    println!("\n{passed} passed, {failed} failed");
    if failed > 0 {
        anyhow::bail!("{failed} status checks failed");
    }
    Ok(())
}

async fn run_demo(args: DemoArgs) -> anyhow::Result<()> {
    let config = Config::load()?;
    let wallet: Arc<dyn WalletSigner> = Arc::new(LocalSigner::random());

    let chain = SimChain::new(31337, wallet.address().clone());
    println!("simulated chain 31337, contract {}", chain.contract_address());

    let identity = crate::identity::ChainSignerIdentity::new();
    identity.set_network(31337);
    identity.connect(wallet);

    let bootstrapper = Arc::new(FheRuntimeBootstrapper::new(Arc::new(
        SimRuntimeProvider::new().with_chain(&chain),
    )));
    bootstrapper.bootstrap(31337).await?;

    let directory = StaticContractDirectory::new().with(chain.contract());
    let controller = EncryptedCounterController::new(
        identity,
        bootstrapper,
        DecryptionSignatureCache::new(),
        Arc::new(directory),
        ActivityLog::with_capacity(config.workflow.activity_capacity),
        config.workflow,
    );

    let mut transitions = WatchStream::new(controller.subscribe());
    tokio::spawn(async move {
        while let Some(snapshot) = transitions.next().await {
            tracing::debug!(state = ?snapshot.state, "controller transition");
        }
    });

    let magnitude = u32::try_from(args.delta.unsigned_abs()).unwrap_or(u32::MAX);
    let receipt = if args.delta < 0 {
        controller.decrement(magnitude).await?
    } else {
        controller.increment(magnitude).await?
    };
    println!(
        "confirmed {} in block {}",
        receipt.tx_hash, receipt.block_number
    );

    let handle = controller.refresh_handle().await?;
    println!("encrypted handle: {handle}");

    if !args.skip_decrypt {
        let clear = controller.decrypt().await?;
        println!("clear value: {clear}");
    }

    println!("\nactivity:");
    for entry in controller.activity().entries() {
        match &entry.details {
            Some(details) => println!("  [{}] {} ({})", entry.kind.as_str(), entry.title, details),
            None => println!("  [{}] {}", entry.kind.as_str(), entry.title),
        }
    }
    Ok(())
}
