//! Deploy-factory → create → fund state machine for a single sale.
//!
//! Every step reads the locked descriptor, submits at most one transaction,
//! journals it as pending, waits for its confirmation and only then commits
//! what it learned. A step that cannot prove its outcome leaves the descriptor
//! exactly as it was and the journal entry in place, so the next run settles
//! that transaction instead of submitting another.

use alloy_primitives::{Address, Bytes, B256, U256};
use serde::Serialize;
use tracing::{info, warn};

use crate::contracts::{self, events, find_event, FactoryInit, SaleCreated, Transfer, MAX_FEE_BPS};
use crate::descriptor::{DescriptorCheckpoint, LaunchDescriptor, PendingTransaction, SaleState, Step};
use crate::error::LaunchpadError;
use crate::ledger::{await_confirmation, BlockId, ConfirmationPolicy, LedgerClient, Receipt, TransactionRequest};
use crate::units::format_units;

/// Descriptor state together with what the ledger says about the sale.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SaleStatus {
    pub state: SaleState,
    pub factory: Option<Address>,
    pub sale: Option<Address>,
    /// Tokens the funding transfer moves, in base units.
    pub funding_amount_base: U256,
    /// Token balance of the sale contract, when one is recorded.
    pub sale_balance_base: Option<U256>,
    /// Transaction submitted by an earlier run and not yet settled.
    pub pending: Option<PendingTransaction>,
}

/// What [`DeploymentOrchestrator::deploy_factory`] deploys.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FactoryDeployment {
    pub creation_code: Bytes,
    /// Receiver of platform fees.
    pub treasury: Address,
    pub fee_bps: u16,
}

pub struct DeploymentOrchestrator<L> {
    ledger: L,
    sender: Address,
    creation_code: Option<Bytes>,
    confirmation: ConfirmationPolicy,
}

impl<L: LedgerClient> DeploymentOrchestrator<L> {
    /// `sender` is the account the node signs for; it owns the factory and
    /// the sale and pays for funding.
    pub fn new(ledger: L, sender: Address) -> Self {
        Self {
            ledger,
            sender,
            creation_code: None,
            confirmation: ConfirmationPolicy::default(),
        }
    }

    /// Creation bytecode of the sale contract, required by [`Self::create`].
    pub fn with_creation_code(mut self, creation_code: Bytes) -> Self {
        self.creation_code = Some(creation_code);
        self
    }

    pub fn with_confirmation(mut self, confirmation: ConfirmationPolicy) -> Self {
        self.confirmation = confirmation;
        self
    }

    /// Deploy a launchpad factory settling in the descriptor's asset and
    /// record its address as `factory`.
    ///
    /// A descriptor that already names a factory is returned as is.
    pub async fn deploy_factory(
        &self,
        checkpoint: &mut DescriptorCheckpoint,
        deployment: &FactoryDeployment,
    ) -> Result<Address, LaunchpadError> {
        self.settle_pending(checkpoint).await?;
        let descriptor = checkpoint.descriptor();
        if let Some(factory) = descriptor.factory {
            info!(%factory, "factory already recorded, nothing to deploy");
            return Ok(factory);
        }
        if deployment.creation_code.is_empty() {
            return Err(LaunchpadError::Config(
                "factory creation code is required to deploy a factory".into(),
            ));
        }
        if deployment.fee_bps > MAX_FEE_BPS {
            return Err(LaunchpadError::Config(format!(
                "fee of {} bps exceeds {MAX_FEE_BPS}",
                deployment.fee_bps
            )));
        }
        let init = FactoryInit {
            owner: self.sender,
            settlement_asset: descriptor.settlement_asset,
            settlement_decimals: descriptor.settlement_decimals,
            treasury: deployment.treasury,
            fee_bps: deployment.fee_bps,
        };
        info!(
            owner = %self.sender,
            treasury = %init.treasury,
            fee_bps = init.fee_bps,
            "deploying launchpad factory"
        );
        let request = TransactionRequest::deploy(self.sender, init.init_code(&deployment.creation_code).into());
        let receipt = self.submit(checkpoint, Step::DeployFactory, request).await?;
        self.settle(checkpoint, Step::DeployFactory, &receipt)
    }

    /// Deploy the sale through the factory and record its address.
    ///
    /// A descriptor that already names a sale is returned as is, without
    /// submitting anything.
    pub async fn create(&self, checkpoint: &mut DescriptorCheckpoint) -> Result<Address, LaunchpadError> {
        self.settle_pending(checkpoint).await?;
        let descriptor = checkpoint.descriptor();
        if let Some(sale) = descriptor.sale {
            info!(%sale, "sale already created, nothing to submit");
            return Ok(sale);
        }
        let factory = descriptor.factory.ok_or_else(|| {
            LaunchpadError::Precondition("no factory recorded; set factory or run deploy-factory first".into())
        })?;
        let creation_code = match &self.creation_code {
            Some(code) if !code.is_empty() => code,
            _ => {
                return Err(LaunchpadError::Config(
                    "sale creation code is required to create a sale".into(),
                ))
            }
        };

        let init = descriptor.sale_init(self.sender)?;
        let request = TransactionRequest::call(self.sender, factory, init.create_sale_call(creation_code));
        info!(
            %factory,
            owner = %self.sender,
            price = %init.price,
            cap_tokens = %init.cap_tokens,
            "submitting createSale"
        );
        let receipt = self.submit(checkpoint, Step::Create, request).await?;
        self.settle(checkpoint, Step::Create, &receipt)
    }

    /// Transfer the full cap of tokens from the sender to the sale.
    pub async fn fund(&self, checkpoint: &mut DescriptorCheckpoint) -> Result<B256, LaunchpadError> {
        self.settle_pending(checkpoint).await?;
        let descriptor = checkpoint.descriptor();
        let sale = match (descriptor.state(), descriptor.sale) {
            (SaleState::Created, Some(sale)) => sale,
            (SaleState::Funded, sale) => {
                return Err(LaunchpadError::IdempotencyViolation(format!(
                    "sale {} is already funded{}",
                    sale.unwrap_or_default(),
                    descriptor
                        .funding_tx
                        .map(|tx| format!(" by {tx}"))
                        .unwrap_or_default()
                )))
            }
            _ => {
                return Err(LaunchpadError::Precondition(
                    "no sale address recorded; run create first".into(),
                ))
            }
        };
        check_terms(descriptor)?;

        let token = descriptor.token;
        let decimals = descriptor.token_decimals;
        let amount = descriptor.cap_base()?;

        let held = self.balance_of(token, sale).await?;
        if held >= amount {
            return Err(LaunchpadError::IdempotencyViolation(format!(
                "sale {sale} already holds {} tokens (cap {}); record the funding transfer with recover",
                format_units(held, decimals),
                format_units(amount, decimals)
            )));
        }
        let available = self.balance_of(token, self.sender).await?;
        if available < amount {
            return Err(LaunchpadError::Precondition(format!(
                "sender {} holds {} tokens, funding needs {}",
                self.sender,
                format_units(available, decimals),
                format_units(amount, decimals)
            )));
        }

        info!(%sale, %token, amount_base = %amount, "submitting funding transfer");
        let request = TransactionRequest::call(self.sender, token, contracts::transfer_call(sale, amount));
        let receipt = self.submit(checkpoint, Step::Fund, request).await?;
        self.settle(checkpoint, Step::Fund, &receipt)?;
        Ok(receipt.transaction_hash)
    }

    /// Settle the descriptor from a transaction whose outcome was not recorded,
    /// typically after a confirmation timeout or a missing event.
    ///
    /// The step is taken from the pending journal when `tx` is the journaled
    /// transaction, otherwise from the descriptor's state.
    pub async fn reconcile(
        &self,
        checkpoint: &mut DescriptorCheckpoint,
        tx: B256,
    ) -> Result<SaleState, LaunchpadError> {
        let receipt = self.ledger.transaction_receipt(tx).await?.ok_or_else(|| {
            LaunchpadError::Precondition(format!(
                "no receipt for {tx}; it is still pending or unknown to the node"
            ))
        })?;
        let journaled = checkpoint.pending().filter(|pending| pending.tx == tx);
        if !receipt.success {
            warn!(%tx, "transaction reverted, descriptor left unchanged");
            if journaled.is_some() {
                checkpoint.clear_pending()?;
            }
            return Err(LaunchpadError::Revert { tx });
        }

        let descriptor = checkpoint.descriptor();
        let step = match (journaled, descriptor.state(), descriptor.factory) {
            (_, SaleState::Funded, _) => {
                return Err(LaunchpadError::IdempotencyViolation(
                    "descriptor is already funded; nothing to reconcile".into(),
                ))
            }
            (Some(pending), _, _) => pending.step,
            (None, SaleState::Created, _) => Step::Fund,
            (None, SaleState::Unconfigured, Some(_)) => Step::Create,
            (None, SaleState::Unconfigured, None) => Step::DeployFactory,
        };
        self.settle(checkpoint, step, &receipt)?;
        info!(%tx, %step, "recorded outcome from receipt");
        Ok(checkpoint.descriptor().state())
    }

    /// Descriptor state plus the sale's on-chain token balance.
    pub async fn status(
        &self,
        descriptor: &LaunchDescriptor,
        pending: Option<PendingTransaction>,
    ) -> Result<SaleStatus, LaunchpadError> {
        let sale_balance_base = match descriptor.sale {
            Some(sale) => Some(self.balance_of(descriptor.token, sale).await?),
            None => None,
        };
        Ok(SaleStatus {
            state: descriptor.state(),
            factory: descriptor.factory,
            sale: descriptor.sale,
            funding_amount_base: descriptor.cap_base()?,
            sale_balance_base,
            pending,
        })
    }

    /// Resolve a transaction an earlier run journaled but never recorded.
    ///
    /// Still unmined: the step is refused, since submitting again could
    /// repeat it. Reverted: the entry is dropped. Mined: its outcome is
    /// committed as if the earlier run had seen it.
    async fn settle_pending(&self, checkpoint: &mut DescriptorCheckpoint) -> Result<(), LaunchpadError> {
        let Some(PendingTransaction { step, tx }) = checkpoint.pending() else {
            return Ok(());
        };
        match self.ledger.transaction_receipt(tx).await? {
            None => Err(LaunchpadError::Precondition(format!(
                "{step} transaction {tx} from an earlier run is still unconfirmed; \
                 rerun once it is mined or settle it with recover"
            ))),
            Some(receipt) if !receipt.success => {
                warn!(%tx, %step, "transaction from an earlier run reverted, dropping it");
                checkpoint.clear_pending()
            }
            Some(receipt) => {
                info!(%tx, %step, "settling transaction from an earlier run");
                self.settle(checkpoint, step, &receipt).map(|_| ())
            }
        }
    }

    /// Submit `request`, journal it as pending and wait for its receipt.
    ///
    /// The journal entry is dropped when the transaction reverts and kept on
    /// every uncertain outcome.
    async fn submit(
        &self,
        checkpoint: &mut DescriptorCheckpoint,
        step: Step,
        request: TransactionRequest,
    ) -> Result<Receipt, LaunchpadError> {
        let tx = self.ledger.send_transaction(request).await?;
        info!(%tx, %step, "transaction submitted, awaiting confirmation");
        checkpoint.record_pending(step, tx).inspect_err(|err| {
            warn!(%tx, %step, "journaling the transaction failed, run recover with it once mined: {err}")
        })?;
        match await_confirmation(&self.ledger, tx, &self.confirmation).await {
            Ok(receipt) => Ok(receipt),
            Err(err @ LaunchpadError::Revert { .. }) => {
                warn!(%tx, %step, "transaction reverted");
                checkpoint.clear_pending()?;
                Err(err)
            }
            Err(err) => {
                warn!(%tx, %step, "confirmation failed, outcome uncertain: {err}");
                Err(err)
            }
        }
    }

    /// Commit what the successful `receipt` of `step` proves and clear the
    /// journal. Returns the factory or sale address the step concerns.
    fn settle(
        &self,
        checkpoint: &mut DescriptorCheckpoint,
        step: Step,
        receipt: &Receipt,
    ) -> Result<Address, LaunchpadError> {
        let tx = receipt.transaction_hash;
        let descriptor = checkpoint.descriptor();
        let address = match step {
            Step::DeployFactory => {
                let factory = receipt.contract_address.ok_or_else(|| LaunchpadError::Consistency {
                    tx,
                    detail: "its receipt names no deployed contract".into(),
                })?;
                checkpoint
                    .commit(|d| {
                        d.factory = Some(factory);
                        Ok(())
                    })
                    .map_err(|err| unrecorded(tx, format!("factory {factory}"), err))?;
                info!(%factory, %tx, "factory deployed");
                factory
            }
            Step::Create => {
                let factory = descriptor.factory.ok_or_else(|| LaunchpadError::Consistency {
                    tx,
                    detail: "the descriptor names no factory to attribute SaleCreated to".into(),
                })?;
                let created = find_event::<SaleCreated>(&receipt.logs, factory)?.ok_or_else(|| {
                    LaunchpadError::Consistency {
                        tx,
                        detail: format!("factory {factory} emitted no SaleCreated event"),
                    }
                })?;
                let sale = created.sale;
                let digest = descriptor.terms_digest()?;
                checkpoint
                    .commit(|d| {
                        d.sale = Some(sale);
                        d.creation_tx = Some(tx);
                        d.config_digest = Some(digest);
                        Ok(())
                    })
                    .map_err(|err| unrecorded(tx, format!("sale {sale}"), err))?;
                info!(%sale, %tx, "sale created");
                sale
            }
            Step::Fund => {
                let token = descriptor.token;
                let (sale, amount) = match descriptor.sale {
                    Some(sale) => (sale, descriptor.cap_base()?),
                    None => {
                        return Err(LaunchpadError::Consistency {
                            tx,
                            detail: "the descriptor names no sale the transfer could fund".into(),
                        })
                    }
                };
                let transferred = events::<Transfer>(&receipt.logs, token)?
                    .into_iter()
                    .any(|t| t.to == sale && t.value >= amount);
                if !transferred {
                    return Err(LaunchpadError::Consistency {
                        tx,
                        detail: format!("token {token} emitted no Transfer of {amount} to {sale}"),
                    });
                }
                checkpoint
                    .commit(|d| {
                        d.funded = true;
                        d.funding_tx = Some(tx);
                        Ok(())
                    })
                    .map_err(|err| unrecorded(tx, format!("funding of {sale}"), err))?;
                info!(%sale, %tx, "sale funded");
                sale
            }
        };
        if checkpoint.pending().is_some_and(|pending| pending.tx == tx) {
            checkpoint.clear_pending()?;
        }
        Ok(address)
    }

    async fn balance_of(&self, token: Address, holder: Address) -> Result<U256, LaunchpadError> {
        let out = self
            .ledger
            .call(token, contracts::balance_of_call(holder), BlockId::Latest)
            .await?;
        contracts::decode_balance(&out)
    }
}

/// Funding is bound to the terms the sale was created with.
fn check_terms(descriptor: &LaunchDescriptor) -> Result<(), LaunchpadError> {
    match &descriptor.config_digest {
        Some(recorded) if *recorded != descriptor.terms_digest()? => Err(LaunchpadError::Config(
            "sale terms changed since the sale was created; restore them before funding".into(),
        )),
        Some(_) => Ok(()),
        None => {
            warn!("descriptor carries no configDigest, cannot verify terms against the deployed sale");
            Ok(())
        }
    }
}

/// The transaction confirmed but the descriptor could not be updated.
fn unrecorded(tx: B256, what: String, err: LaunchpadError) -> LaunchpadError {
    LaunchpadError::Consistency {
        tx,
        detail: format!("recording {what} in the descriptor failed: {err}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use std::sync::Arc;
    use std::time::Duration;

    use serde_json::json;
    use tempfile::TempDir;

    use crate::descriptor;
    use crate::ledger::InMemoryLedger;

    const CREATION_CODE: [u8; 6] = [0x60, 0x80, 0x60, 0x40, 0x52, 0x00];
    const FACTORY_CODE: [u8; 4] = [0xfa, 0xc7, 0x60, 0x80];

    fn factory() -> Address {
        Address::repeat_byte(0x11)
    }

    fn token() -> Address {
        Address::repeat_byte(0x22)
    }

    fn deployer() -> Address {
        Address::repeat_byte(0xde)
    }

    struct Fixture {
        _dir: TempDir,
        path: PathBuf,
        ledger: Arc<InMemoryLedger>,
        orchestrator: DeploymentOrchestrator<Arc<InMemoryLedger>>,
    }

    impl Fixture {
        fn new() -> Self {
            Self::with_descriptor(json!({
                "factory": factory(),
                "token": token(),
                "usdc": Address::repeat_byte(0x33),
                "tokenDecimals": 6,
                "priceUSDCPerToken": "50000",
                "capTokensHuman": "1000000",
                "startTime": 1_700_000_000u64,
                "endTime": 1_700_086_400u64
            }))
        }

        fn with_descriptor(raw: serde_json::Value) -> Self {
            let dir = tempfile::tempdir().unwrap();
            let path = dir.path().join("launch.json");
            std::fs::write(&path, serde_json::to_vec_pretty(&raw).unwrap()).unwrap();

            let ledger = Arc::new(InMemoryLedger::new());
            ledger.register_factory(factory());
            ledger.mint(token(), deployer(), U256::from(2_000_000_000_000u64));
            let orchestrator = DeploymentOrchestrator::new(ledger.clone(), deployer())
                .with_creation_code(Bytes::from_static(&CREATION_CODE))
                .with_confirmation(ConfirmationPolicy {
                    timeout: Duration::from_secs(5),
                    poll_interval: Duration::from_secs(1),
                });
            Self {
                _dir: dir,
                path,
                ledger,
                orchestrator,
            }
        }

        fn checkpoint(&self) -> DescriptorCheckpoint {
            DescriptorCheckpoint::acquire(&self.path).unwrap()
        }
    }

    #[tokio::test]
    async fn create_deploys_once_and_records_the_sale() {
        let fx = Fixture::new();
        let mut checkpoint = fx.checkpoint();
        let sale = fx.orchestrator.create(&mut checkpoint).await.unwrap();

        let record = fx.ledger.sale(sale).unwrap();
        assert_eq!(record.owner, deployer());
        assert_eq!(record.cap_tokens, U256::from(1_000_000u64));
        assert_eq!(record.price, U256::from(50_000u64));
        let init = checkpoint.descriptor().sale_init(deployer()).unwrap();
        assert_eq!(record.init_code.as_ref(), init.init_code(&CREATION_CODE).as_slice());

        let stored = descriptor::load(&fx.path).unwrap();
        assert_eq!(stored.sale, Some(sale));
        assert!(stored.creation_tx.is_some());
        assert_eq!(stored.config_digest, Some(stored.terms_digest().unwrap()));

        let again = fx.orchestrator.create(&mut checkpoint).await.unwrap();
        assert_eq!(again, sale);
        assert_eq!(fx.ledger.submitted().len(), 1);
        assert_eq!(checkpoint.pending(), None);
        assert!(descriptor::load_pending(&fx.path).unwrap().is_none());
    }

    #[tokio::test]
    async fn fractional_cap_is_refused_before_submitting() {
        let fx = Fixture::with_descriptor(json!({
            "factory": factory(),
            "token": token(),
            "usdc": Address::repeat_byte(0x33),
            "tokenDecimals": 6,
            "priceUSDCPerToken": "50000",
            "capTokensHuman": "1000000.5",
            "startTime": 1,
            "endTime": 2
        }));
        let err = fx.orchestrator.create(&mut fx.checkpoint()).await.unwrap_err();
        assert!(matches!(err, LaunchpadError::Config(ref msg) if msg.contains("whole number")), "{err}");
        assert!(fx.ledger.submitted().is_empty());
    }

    #[tokio::test]
    async fn create_needs_a_factory() {
        let fx = Fixture::with_descriptor(json!({
            "token": token(),
            "usdc": Address::repeat_byte(0x33),
            "tokenDecimals": 6,
            "priceUSDCPerToken": "50000",
            "capTokensHuman": "10",
            "startTime": 1,
            "endTime": 2
        }));
        let err = fx.orchestrator.create(&mut fx.checkpoint()).await.unwrap_err();
        assert!(matches!(err, LaunchpadError::Precondition(ref msg) if msg.contains("deploy-factory")));
        assert!(fx.ledger.submitted().is_empty());
    }

    #[tokio::test]
    async fn existing_sale_address_short_circuits_create() {
        let recorded = Address::repeat_byte(0xab);
        let fx = Fixture::with_descriptor(json!({
            "factory": factory(),
            "token": token(),
            "usdc": Address::repeat_byte(0x33),
            "tokenDecimals": 6,
            "priceUSDCPerToken": "50000",
            "capTokensHuman": "10",
            "startTime": 1,
            "endTime": 2,
            "sale": recorded
        }));
        let orchestrator = DeploymentOrchestrator::new(fx.ledger.clone(), deployer());
        let sale = orchestrator.create(&mut fx.checkpoint()).await.unwrap();
        assert_eq!(sale, recorded);
        assert!(fx.ledger.submitted().is_empty());
    }

    #[tokio::test]
    async fn create_without_creation_code_is_a_config_error() {
        let fx = Fixture::new();
        let orchestrator = DeploymentOrchestrator::new(fx.ledger.clone(), deployer());
        let err = orchestrator.create(&mut fx.checkpoint()).await.unwrap_err();
        assert!(matches!(err, LaunchpadError::Config(_)));
        assert!(fx.ledger.submitted().is_empty());
    }

    #[tokio::test]
    async fn missing_creation_event_is_a_consistency_error() {
        let fx = Fixture::new();
        fx.ledger.omit_sale_created(true);
        let before = std::fs::read(&fx.path).unwrap();
        let mut checkpoint = fx.checkpoint();
        let err = fx.orchestrator.create(&mut checkpoint).await.unwrap_err();
        let tx = err.transaction().expect("error names the transaction");
        assert!(matches!(err, LaunchpadError::Consistency { .. }));
        assert_eq!(std::fs::read(&fx.path).unwrap(), before);
        assert!(checkpoint.descriptor().sale.is_none());
        assert_eq!(fx.ledger.submitted().len(), 1);

        // the transaction holds no event either, so reconciling cannot guess
        let err = fx.orchestrator.reconcile(&mut checkpoint, tx).await.unwrap_err();
        assert!(matches!(err, LaunchpadError::Consistency { .. }));

        // nor does a rerun paper over it with a second sale
        let err = fx.orchestrator.create(&mut checkpoint).await.unwrap_err();
        assert!(matches!(err, LaunchpadError::Consistency { tx: t, .. } if t == tx));
        assert_eq!(fx.ledger.submitted().len(), 1);
    }

    #[tokio::test]
    async fn reverted_creation_leaves_the_descriptor_alone() {
        let fx = Fixture::new();
        fx.ledger.revert_next();
        let mut checkpoint = fx.checkpoint();
        let err = fx.orchestrator.create(&mut checkpoint).await.unwrap_err();
        assert!(matches!(err, LaunchpadError::Revert { .. }));
        assert_eq!(err.exit_code(), 3);
        assert!(descriptor::load(&fx.path).unwrap().sale.is_none());
        assert_eq!(checkpoint.pending(), None);

        // a revert is a definite outcome, so trying again is allowed
        fx.orchestrator.create(&mut checkpoint).await.unwrap();
        assert_eq!(fx.ledger.submitted().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn rerun_after_a_creation_timeout_reuses_the_submitted_sale() {
        let fx = Fixture::new();
        fx.ledger.withhold_receipts(true);
        {
            let mut checkpoint = fx.checkpoint();
            let err = fx.orchestrator.create(&mut checkpoint).await.unwrap_err();
            assert!(matches!(err, LaunchpadError::ConfirmationTimeout { .. }));
        }
        let pending = descriptor::load_pending(&fx.path).unwrap().unwrap();
        assert_eq!(pending.step, Step::Create);

        // still unmined as far as the node tells: refuse rather than resubmit
        let err = fx.orchestrator.create(&mut fx.checkpoint()).await.unwrap_err();
        assert!(matches!(err, LaunchpadError::Precondition(ref msg) if msg.contains("unconfirmed")));
        assert_eq!(fx.ledger.submitted().len(), 1);

        fx.ledger.release_receipts();
        let mut checkpoint = fx.checkpoint();
        let sale = fx.orchestrator.create(&mut checkpoint).await.unwrap();
        assert_eq!(fx.ledger.submitted().len(), 1);
        assert!(fx.ledger.sale(sale).is_some());
        let stored = descriptor::load(&fx.path).unwrap();
        assert_eq!(stored.sale, Some(sale));
        assert_eq!(stored.creation_tx, Some(pending.tx));
        assert!(descriptor::load_pending(&fx.path).unwrap().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn rerun_after_a_funding_timeout_does_not_transfer_twice() {
        let fx = Fixture::new();
        let mut checkpoint = fx.checkpoint();
        let sale = fx.orchestrator.create(&mut checkpoint).await.unwrap();
        fx.ledger.withhold_receipts(true);
        let err = fx.orchestrator.fund(&mut checkpoint).await.unwrap_err();
        let tx = err.transaction().unwrap();
        drop(checkpoint);

        fx.ledger.release_receipts();
        let mut checkpoint = fx.checkpoint();
        assert_eq!(checkpoint.pending().map(|p| p.tx), Some(tx));
        let err = fx.orchestrator.fund(&mut checkpoint).await.unwrap_err();
        assert!(matches!(err, LaunchpadError::IdempotencyViolation(ref msg) if msg.contains(&tx.to_string())));
        assert_eq!(fx.ledger.submitted().len(), 2);
        assert_eq!(fx.ledger.balance_of(token(), sale), U256::from(1_000_000_000_000u64));
        assert!(descriptor::load(&fx.path).unwrap().funded);
        assert_eq!(checkpoint.pending(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn creation_timeout_is_recovered_from_the_receipt() {
        let fx = Fixture::new();
        fx.ledger.withhold_receipts(true);
        let mut checkpoint = fx.checkpoint();
        let err = fx.orchestrator.create(&mut checkpoint).await.unwrap_err();
        let LaunchpadError::ConfirmationTimeout { tx } = err else {
            panic!("expected an uncertain outcome, got {err:?}");
        };
        assert_eq!(descriptor::load(&fx.path).unwrap().revision, 0);

        let err = fx.orchestrator.reconcile(&mut checkpoint, tx).await.unwrap_err();
        assert!(matches!(err, LaunchpadError::Precondition(_)));

        fx.ledger.release_receipts();
        let state = fx.orchestrator.reconcile(&mut checkpoint, tx).await.unwrap();
        assert_eq!(state, SaleState::Created);
        let stored = descriptor::load(&fx.path).unwrap();
        assert_eq!(stored.creation_tx, Some(tx));
        assert!(fx.ledger.sale(stored.sale.unwrap()).is_some());
    }

    #[tokio::test]
    async fn fund_transfers_the_exact_cap_once() {
        let fx = Fixture::new();
        let mut checkpoint = fx.checkpoint();
        let sale = fx.orchestrator.create(&mut checkpoint).await.unwrap();
        let tx = fx.orchestrator.fund(&mut checkpoint).await.unwrap();

        assert_eq!(fx.ledger.balance_of(token(), sale), U256::from(1_000_000_000_000u64));
        assert_eq!(fx.ledger.balance_of(token(), deployer()), U256::from(1_000_000_000_000u64));
        let stored = descriptor::load(&fx.path).unwrap();
        assert!(stored.funded);
        assert_eq!(stored.funding_tx, Some(tx));
        assert_eq!(stored.state(), SaleState::Funded);
        assert_eq!(stored.revision, 2);

        let err = fx.orchestrator.fund(&mut checkpoint).await.unwrap_err();
        assert!(matches!(err, LaunchpadError::IdempotencyViolation(_)));
        assert_eq!(fx.ledger.submitted().len(), 2);
    }

    #[tokio::test]
    async fn funding_moves_the_fractional_cap_in_base_units() {
        // a sale created elsewhere, recorded by hand: only funding runs here
        let sale = Address::repeat_byte(0xab);
        let fx = Fixture::with_descriptor(json!({
            "factory": factory(),
            "token": token(),
            "usdc": Address::repeat_byte(0x33),
            "tokenDecimals": 6,
            "priceUSDCPerToken": "50000",
            "capTokensHuman": "1000000.5",
            "startTime": 1,
            "endTime": 2,
            "sale": sale
        }));
        fx.orchestrator.fund(&mut fx.checkpoint()).await.unwrap();
        assert_eq!(fx.ledger.balance_of(token(), sale), U256::from(1_000_000_500_000u64));
        assert_eq!(fx.ledger.submitted().len(), 1);
    }

    #[tokio::test]
    async fn fund_requires_a_created_sale() {
        let fx = Fixture::new();
        let err = fx.orchestrator.fund(&mut fx.checkpoint()).await.unwrap_err();
        assert!(matches!(err, LaunchpadError::Precondition(_)));
        assert!(fx.ledger.submitted().is_empty());
    }

    #[tokio::test]
    async fn fund_refuses_edited_terms() {
        let fx = Fixture::new();
        {
            let mut checkpoint = fx.checkpoint();
            fx.orchestrator.create(&mut checkpoint).await.unwrap();
        }
        let mut edited = descriptor::load(&fx.path).unwrap();
        edited.cap_tokens_human = "2000000".into();
        descriptor::save(&fx.path, &edited).unwrap();

        let err = fx.orchestrator.fund(&mut fx.checkpoint()).await.unwrap_err();
        assert!(matches!(err, LaunchpadError::Config(_)));
        assert_eq!(fx.ledger.submitted().len(), 1);
    }

    #[tokio::test]
    async fn fund_detects_a_transfer_the_descriptor_missed() {
        let fx = Fixture::new();
        let mut checkpoint = fx.checkpoint();
        let sale = fx.orchestrator.create(&mut checkpoint).await.unwrap();
        // an earlier run transferred the cap but crashed before recording it
        fx.ledger.mint(token(), sale, U256::from(1_000_000_500_000u64));

        let err = fx.orchestrator.fund(&mut checkpoint).await.unwrap_err();
        assert!(matches!(err, LaunchpadError::IdempotencyViolation(_)));
        assert_eq!(fx.ledger.submitted().len(), 1);
        assert!(!checkpoint.descriptor().funded);
    }

    #[tokio::test]
    async fn fund_checks_the_sender_balance_first() {
        let fx = Fixture::new();
        let mut checkpoint = fx.checkpoint();
        fx.orchestrator.create(&mut checkpoint).await.unwrap();
        let poor = DeploymentOrchestrator::new(fx.ledger.clone(), Address::repeat_byte(0x99));
        let err = poor.fund(&mut checkpoint).await.unwrap_err();
        assert!(matches!(err, LaunchpadError::Precondition(ref msg) if msg.contains("needs 1000000")));
        assert_eq!(fx.ledger.submitted().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn funding_timeout_then_reconcile_marks_funded() {
        let fx = Fixture::new();
        let mut checkpoint = fx.checkpoint();
        let sale = fx.orchestrator.create(&mut checkpoint).await.unwrap();

        fx.ledger.withhold_receipts(true);
        let err = fx.orchestrator.fund(&mut checkpoint).await.unwrap_err();
        let tx = err.transaction().unwrap();
        assert!(matches!(err, LaunchpadError::ConfirmationTimeout { .. }));
        assert!(!descriptor::load(&fx.path).unwrap().funded);

        // the journaled transfer blocks a blind retry
        let err = fx.orchestrator.fund(&mut checkpoint).await.unwrap_err();
        assert!(matches!(err, LaunchpadError::Precondition(_)));
        let status = fx.orchestrator.status(checkpoint.descriptor(), checkpoint.pending()).await.unwrap();
        assert_eq!(status.pending.map(|p| (p.step, p.tx)), Some((Step::Fund, tx)));

        fx.ledger.release_receipts();
        let state = fx.orchestrator.reconcile(&mut checkpoint, tx).await.unwrap();
        assert_eq!(state, SaleState::Funded);
        let status = fx.orchestrator.status(checkpoint.descriptor(), checkpoint.pending()).await.unwrap();
        assert_eq!(status.state, SaleState::Funded);
        assert_eq!(status.sale, Some(sale));
        assert_eq!(status.sale_balance_base, Some(status.funding_amount_base));
        assert_eq!(status.pending, None);
    }

    fn factory_deployment() -> FactoryDeployment {
        FactoryDeployment {
            creation_code: Bytes::from_static(&FACTORY_CODE),
            treasury: Address::repeat_byte(0x7e),
            fee_bps: contracts::DEFAULT_FEE_BPS,
        }
    }

    fn without_factory() -> Fixture {
        let fx = Fixture::with_descriptor(json!({
            "token": token(),
            "usdc": Address::repeat_byte(0x33),
            "tokenDecimals": 6,
            "priceUSDCPerToken": "50000",
            "capTokensHuman": "1000000",
            "startTime": 1,
            "endTime": 2
        }));
        fx.ledger.register_factory_code(Bytes::from_static(&FACTORY_CODE));
        fx
    }

    #[tokio::test]
    async fn deployed_factory_is_recorded_and_creates_the_sale() {
        let fx = without_factory();
        let mut checkpoint = fx.checkpoint();
        let factory = fx
            .orchestrator
            .deploy_factory(&mut checkpoint, &factory_deployment())
            .await
            .unwrap();
        assert_eq!(descriptor::load(&fx.path).unwrap().factory, Some(factory));

        let init = FactoryInit {
            owner: deployer(),
            settlement_asset: Address::repeat_byte(0x33),
            settlement_decimals: 6,
            treasury: Address::repeat_byte(0x7e),
            fee_bps: 200,
        };
        assert_eq!(fx.ledger.deployment(factory).unwrap().as_ref(), init.init_code(&FACTORY_CODE).as_slice());

        let again = fx
            .orchestrator
            .deploy_factory(&mut checkpoint, &factory_deployment())
            .await
            .unwrap();
        assert_eq!(again, factory);
        assert_eq!(fx.ledger.submitted().len(), 1);

        let sale = fx.orchestrator.create(&mut checkpoint).await.unwrap();
        assert_eq!(fx.ledger.sale(sale).unwrap().factory, factory);
    }

    #[tokio::test]
    async fn factory_fee_above_the_whole_is_refused() {
        let fx = without_factory();
        let deployment = FactoryDeployment {
            fee_bps: 10_001,
            ..factory_deployment()
        };
        let err = fx
            .orchestrator
            .deploy_factory(&mut fx.checkpoint(), &deployment)
            .await
            .unwrap_err();
        assert!(matches!(err, LaunchpadError::Config(_)));
        assert!(fx.ledger.submitted().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn factory_deployment_timeout_is_recovered_from_the_receipt() {
        let fx = without_factory();
        fx.ledger.withhold_receipts(true);
        let mut checkpoint = fx.checkpoint();
        let err = fx
            .orchestrator
            .deploy_factory(&mut checkpoint, &factory_deployment())
            .await
            .unwrap_err();
        let tx = err.transaction().unwrap();

        fx.ledger.release_receipts();
        let state = fx.orchestrator.reconcile(&mut checkpoint, tx).await.unwrap();
        assert_eq!(state, SaleState::Unconfigured);
        assert!(checkpoint.descriptor().factory.is_some());
        assert_eq!(checkpoint.pending(), None);
        assert_eq!(fx.ledger.submitted().len(), 1);
    }
}
