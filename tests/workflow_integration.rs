//! End-to-end coverage of the encrypted counter workflow: round trips,
//! serialization of concurrent requests, bounded retry, staleness
//! discards, and authorization reuse.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use secrecy::SecretString;

use computeveil::activity::ActivityKind;
use computeveil::config::WorkflowConfig;
use computeveil::contract::{Address, StaticContractDirectory};
use computeveil::controller::{ClearState, EncryptedCounterController};
use computeveil::error::{Error, PreconditionError, SignerError, StalenessError};
use computeveil::identity::ChainSignerIdentity;
use computeveil::runtime::FheRuntimeBootstrapper;
use computeveil::signature::{DecryptionSignatureCache, LocalSigner, WalletSigner};
use computeveil::sim::{SimChain, SimRuntimeProvider};

/// Wallet wrapper that counts signature prompts.
struct CountingSigner {
    inner: LocalSigner,
    prompts: Arc<AtomicU32>,
}

#[async_trait]
impl WalletSigner for CountingSigner {
    fn address(&self) -> &Address {
        self.inner.address()
    }

    async fn sign_decryption_request(
        &self,
        contract: &Address,
        chain_id: u64,
    ) -> Result<SecretString, SignerError> {
        self.prompts.fetch_add(1, Ordering::SeqCst);
        self.inner.sign_decryption_request(contract, chain_id).await
    }
}

struct World {
    controller: Arc<EncryptedCounterController>,
    identity: ChainSignerIdentity,
    chain: SimChain,
    signatures: DecryptionSignatureCache,
    prompts: Arc<AtomicU32>,
}

async fn world_with(config: WorkflowConfig) -> World {
    let prompts = Arc::new(AtomicU32::new(0));
    let wallet = Arc::new(CountingSigner {
        inner: LocalSigner::from_bytes(&[11u8; 32]).expect("valid key"),
        prompts: prompts.clone(),
    });

    let chain = SimChain::new(31337, wallet.address().clone());
    let identity = ChainSignerIdentity::new();
    identity.set_network(31337);
    identity.connect(wallet);

    let bootstrapper = Arc::new(FheRuntimeBootstrapper::new(Arc::new(
        SimRuntimeProvider::new().with_chain(&chain),
    )));
    bootstrapper.bootstrap(31337).await.expect("bootstraps");

    let signatures = DecryptionSignatureCache::new();
    let directory = StaticContractDirectory::new().with(chain.contract());
    let controller = Arc::new(EncryptedCounterController::new(
        identity.clone(),
        bootstrapper,
        signatures.clone(),
        Arc::new(directory),
        computeveil::activity::ActivityLog::new(),
        config,
    ));

    World {
        controller,
        identity,
        chain,
        signatures,
        prompts,
    }
}

async fn world() -> World {
    world_with(WorkflowConfig {
        retry_backoff: Duration::from_millis(1),
        ..WorkflowConfig::default()
    })
    .await
}

fn other_wallet(seed: u8) -> Arc<dyn WalletSigner> {
    Arc::new(LocalSigner::from_bytes(&[seed; 32]).expect("valid key"))
}

#[tokio::test]
async fn increment_then_decrypt_round_trips() {
    let world = world().await;

    // Initial state: uninitialized handle, no clear value, idle.
    let handle = world.controller.refresh_handle().await.expect("refreshes");
    assert!(handle.is_zero());
    assert_eq!(world.controller.snapshot().clear_state(), ClearState::Absent);
    assert!(world.controller.snapshot().state.is_idle());

    world.controller.increment(3).await.expect("increments");

    let snapshot = world.controller.snapshot();
    assert!(snapshot.state.is_idle());
    let handle = snapshot.handle.as_ref().expect("handle replaced");
    assert!(!handle.is_zero());
    assert_eq!(snapshot.clear_state(), ClearState::Absent);

    assert_eq!(world.controller.decrypt().await.expect("decrypts"), 3);
    assert_eq!(
        world.controller.snapshot().clear_state(),
        ClearState::Fresh(3)
    );
}

#[tokio::test]
async fn decrypt_tracks_accumulated_deltas() {
    let world = world().await;

    world.controller.increment(5).await.expect("increments");
    assert_eq!(world.controller.decrypt().await.expect("decrypts"), 5);

    world.controller.decrement(2).await.expect("decrements");
    assert_eq!(world.controller.decrypt().await.expect("decrypts"), 3);

    world.controller.increment(20).await.expect("increments");
    assert_eq!(world.controller.decrypt().await.expect("decrypts"), 23);
}

#[tokio::test]
async fn rollback_below_zero_wraps_modulo_counter_width() {
    let world = world().await;

    world.controller.decrement(1).await.expect("decrements");
    assert_eq!(
        world.controller.decrypt().await.expect("decrypts"),
        u32::MAX
    );
}

#[tokio::test(start_paused = true)]
async fn concurrent_requests_are_rejected_not_queued() {
    let world = world().await;
    world.chain.set_runtime_delay(Duration::from_millis(50));

    let busy = {
        let controller = world.controller.clone();
        tokio::spawn(async move { controller.increment(3).await })
    };
    // Let the first operation reach its encryption round trip.
    tokio::time::sleep(Duration::from_millis(5)).await;
    assert!(world.controller.snapshot().state.is_busy());

    let err = world.controller.increment(1).await.expect_err("busy");
    assert!(matches!(
        err,
        Error::Precondition(PreconditionError::Busy)
    ));

    // The first operation is unaffected by the rejected second request.
    busy.await.expect("task completes").expect("first succeeds");
    assert!(world.controller.snapshot().state.is_idle());
    world.chain.set_runtime_delay(Duration::ZERO);
    assert_eq!(world.controller.decrypt().await.expect("decrypts"), 3);
}

#[tokio::test]
async fn refresh_handle_is_idempotent() {
    let world = world().await;
    world.controller.increment(4).await.expect("increments");

    let first = world.controller.refresh_handle().await.expect("refreshes");
    let second = world.controller.refresh_handle().await.expect("refreshes");
    assert_eq!(first, second);
}

#[tokio::test]
async fn refresh_keeps_clear_value_when_handle_is_unchanged() {
    let world = world().await;
    world.controller.increment(7).await.expect("increments");
    assert_eq!(world.controller.decrypt().await.expect("decrypts"), 7);

    world.controller.refresh_handle().await.expect("refreshes");
    assert_eq!(
        world.controller.snapshot().clear_state(),
        ClearState::Fresh(7)
    );
}

#[tokio::test]
async fn retries_exhaust_into_a_terminal_failure() {
    let world = world().await;
    world.chain.fail_next_submissions(3);

    let err = world.controller.increment(2).await.expect_err("exhausts");
    assert!(matches!(err, Error::RetriesExhausted { attempts: 3, .. }));
    assert!(err.to_string().contains("retries exhausted"));

    let snapshot = world.controller.snapshot();
    assert!(snapshot.state.is_idle());
    assert_eq!(
        snapshot.last_failure.expect("failure recorded").code,
        "transport.retries_exhausted"
    );

    // A manual retry is a fresh operation with its own attempt budget.
    world.controller.increment(2).await.expect("fresh attempt");
    assert_eq!(world.controller.decrypt().await.expect("decrypts"), 2);
}

#[tokio::test]
async fn transient_failures_within_budget_are_absorbed() {
    let world = world().await;
    world.chain.fail_next_submissions(2);

    world.controller.increment(6).await.expect("third attempt lands");
    assert_eq!(world.controller.decrypt().await.expect("decrypts"), 6);
}

#[tokio::test]
async fn paused_contract_fails_immediately_without_retries() {
    let world = world().await;
    let owner = world
        .identity
        .current_signer()
        .expect("connected")
        .address;
    world.chain.set_paused(&owner, true).expect("owner pauses");

    let err = world.controller.increment(1).await.expect_err("paused");
    assert_eq!(err.to_failure_payload().code, "contract.paused");

    world.chain.set_paused(&owner, false).expect("unpauses");
    world.controller.increment(1).await.expect("recovers");
}

#[tokio::test(start_paused = true)]
async fn signer_change_mid_decrypt_discards_the_result() {
    let world = world().await;
    world.controller.increment(3).await.expect("increments");
    assert_eq!(world.controller.decrypt().await.expect("decrypts"), 3);

    world.chain.set_runtime_delay(Duration::from_millis(50));
    let pending = {
        let controller = world.controller.clone();
        tokio::spawn(async move { controller.decrypt().await })
    };
    tokio::time::sleep(Duration::from_millis(5)).await;
    world.identity.switch_account(other_wallet(22));

    let err = pending
        .await
        .expect("task completes")
        .expect_err("stale result discarded");
    assert!(matches!(
        err,
        Error::Stale(StalenessError::SignerChanged)
    ));

    // The observable clear value is unchanged from before the operation,
    // and the authorization cache was flushed for the old identity.
    assert_eq!(
        world.controller.snapshot().clear_state(),
        ClearState::Fresh(3)
    );
    assert!(world.signatures.is_empty());
}

#[tokio::test(start_paused = true)]
async fn network_change_mid_increment_discards_the_result() {
    let world = world().await;
    world.chain.set_runtime_delay(Duration::from_millis(50));

    let pending = {
        let controller = world.controller.clone();
        tokio::spawn(async move { controller.increment(2).await })
    };
    tokio::time::sleep(Duration::from_millis(5)).await;
    world.identity.set_network(11155111);

    let err = pending
        .await
        .expect("task completes")
        .expect_err("stale result discarded");
    assert!(matches!(
        err,
        Error::Stale(StalenessError::NetworkChanged)
    ));
    assert!(world.controller.snapshot().handle.is_none());
}

#[tokio::test]
async fn authorization_is_reused_across_decrypts() {
    let world = world().await;
    world.controller.increment(1).await.expect("increments");

    world.controller.decrypt().await.expect("first decrypt");
    world.controller.increment(1).await.expect("increments");
    world.controller.decrypt().await.expect("second decrypt");

    // One signature prompt serves both decrypt calls.
    assert_eq!(world.prompts.load(Ordering::SeqCst), 1);
    assert_eq!(world.signatures.len(), 1);
}

#[tokio::test]
async fn expired_authorizations_trigger_a_fresh_prompt() {
    let world = world_with(WorkflowConfig {
        retry_backoff: Duration::from_millis(1),
        authorization_ttl: Duration::from_millis(50),
        ..WorkflowConfig::default()
    })
    .await;
    world.controller.increment(1).await.expect("increments");

    world.controller.decrypt().await.expect("first decrypt");
    tokio::time::sleep(Duration::from_millis(60)).await;
    world.controller.decrypt().await.expect("second decrypt");

    assert_eq!(world.prompts.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn connectivity_change_hook_flushes_authorizations() {
    let world = world().await;
    world.controller.increment(1).await.expect("increments");
    world.controller.decrypt().await.expect("decrypts");
    assert_eq!(world.signatures.len(), 1);

    world
        .controller
        .on_connectivity_changed()
        .await
        .expect("rebootstraps");
    assert!(world.signatures.is_empty());
}

#[tokio::test]
async fn permission_read_reflects_participation() {
    let world = world().await;
    assert!(!world
        .controller
        .signer_has_permission()
        .await
        .expect("reads"));

    world.controller.increment(1).await.expect("increments");
    assert!(world
        .controller
        .signer_has_permission()
        .await
        .expect("reads"));
}

#[tokio::test]
async fn activity_log_records_the_workflow() {
    let world = world().await;
    world.controller.increment(3).await.expect("increments");
    world.controller.decrement(1).await.expect("decrements");
    world.controller.refresh_handle().await.expect("refreshes");
    world.controller.decrypt().await.expect("decrypts");

    let entries = world.controller.activity().entries();
    let kinds: Vec<ActivityKind> = entries.iter().map(|entry| entry.kind).collect();
    assert_eq!(
        kinds,
        vec![
            ActivityKind::Decrypt,
            ActivityKind::Refresh,
            ActivityKind::Rollback,
            ActivityKind::Job,
        ]
    );
}

#[tokio::test]
async fn dataset_presets_drive_the_counter() {
    let world = world().await;

    let job = computeveil::catalog::preset(1).expect("preset 1");
    world.controller.submit_dataset(job).await.expect("runs");
    assert_eq!(world.controller.decrypt().await.expect("decrypts"), 3);

    let rollback = computeveil::catalog::preset(4).expect("preset 4");
    world
        .controller
        .submit_dataset(rollback)
        .await
        .expect("rolls back");
    assert_eq!(
        world.controller.decrypt().await.expect("decrypts"),
        u32::MAX
    );
}
