//! Deterministic in-process ledger.
//!
//! Understands exactly the contract surface of [`crate::contracts`]: ERC-20
//! `transfer`/`balanceOf`, the factory's `createSale`, the sale's
//! `totalSoldBase` (derived from its `Bought` events up to the queried block)
//! and `Bought` events. Contract deployments get an address but no code,
//! except that init code starting with the registered factory code makes the
//! new contract a factory. Every submitted transaction is mined immediately in
//! its own block. Faults can be switched on to reproduce node and contract
//! misbehaviour.

use std::collections::{BTreeMap, BTreeSet};

use alloy_primitives::{keccak256, Address, Bytes, LogData, B256, U256};
use alloy_sol_types::{SolCall, SolEvent, SolValue};
use async_trait::async_trait;
use parking_lot::Mutex;

use super::{BlockId, Finality, LedgerClient, Log, LogFilter, Receipt, TransactionRequest};
use crate::contracts::{decode_event, Bought, ILaunchpadFactory, ILaunchpadSale, SaleCreated, Transfer, IERC20};
use crate::error::LaunchpadError;

/// On-chain record of a sale deployed by a registered factory.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SaleRecord {
    pub factory: Address,
    pub owner: Address,
    pub token: Address,
    pub price: U256,
    pub cap_tokens: U256,
    pub init_code: Bytes,
}

#[derive(Default)]
struct Faults {
    withhold_receipts: bool,
    omit_sale_created: bool,
    revert_next: bool,
    max_log_range: Option<u64>,
}

#[derive(Default)]
struct ChainState {
    height: u64,
    nonce: u64,
    balances: BTreeMap<(Address, Address), U256>,
    factory_code: Option<Bytes>,
    factories: BTreeSet<Address>,
    deployments: BTreeMap<Address, Bytes>,
    sales: BTreeMap<Address, SaleRecord>,
    logs: Vec<Log>,
    receipts: BTreeMap<B256, Receipt>,
    withheld: BTreeMap<B256, Receipt>,
    submitted: Vec<TransactionRequest>,
    faults: Faults,
}

/// Outcome of executing one transaction against the state.
enum Execution {
    Success {
        logs: Vec<(Address, LogData)>,
        contract: Option<Address>,
    },
    Reverted,
}

impl Execution {
    fn emitted(address: Address, data: LogData) -> Self {
        Execution::Success {
            logs: vec![(address, data)],
            contract: None,
        }
    }
}

fn reverted() -> LaunchpadError {
    LaunchpadError::Rpc {
        code: 3,
        message: "execution reverted".into(),
    }
}

impl ChainState {
    fn balance(&self, token: Address, holder: Address) -> U256 {
        self.balances.get(&(token, holder)).copied().unwrap_or_default()
    }

    fn credit_account(&mut self, token: Address, holder: Address, amount: U256) {
        let balance = self.balances.entry((token, holder)).or_default();
        *balance = balance.saturating_add(amount);
    }

    fn debit_account(&mut self, token: Address, holder: Address, amount: U256) -> bool {
        let balance = self.balances.entry((token, holder)).or_default();
        if *balance < amount {
            return false;
        }
        *balance -= amount;
        true
    }

    fn next_block(&mut self) -> u64 {
        self.height += 1;
        self.height
    }

    /// Address of the next contract `creator` brings into existence.
    fn next_address(&self, creator: Address) -> Address {
        let seed = [creator.as_slice(), self.nonce.to_be_bytes().as_slice()].concat();
        Address::from_slice(&keccak256(seed)[12..])
    }

    /// `totalSoldBase` as of `block`: the tokens of every `Bought` the sale emitted.
    fn sold_through(&self, sale: Address, block: Option<u64>) -> U256 {
        self.logs
            .iter()
            .filter(|log| log.address == sale && log.topics.first() == Some(&Bought::SIGNATURE_HASH))
            .filter(|log| block.map_or(true, |block| log.block_number <= block))
            .filter_map(|log| decode_event::<Bought>(log).ok())
            .fold(U256::ZERO, |sold, bought| sold.saturating_add(bought.tokensOutBase))
    }

    fn push_log(&mut self, block: u64, tx: B256, address: Address, data: LogData) -> Log {
        let log_index = self.logs.iter().filter(|log| log.block_number == block).count() as u64;
        let log = Log {
            address,
            topics: data.topics().to_vec(),
            data: data.data,
            block_number: block,
            transaction_hash: tx,
            log_index,
            removed: false,
        };
        self.logs.push(log.clone());
        log
    }

    fn execute(&mut self, request: &TransactionRequest) -> Execution {
        if std::mem::take(&mut self.faults.revert_next) {
            return Execution::Reverted;
        }
        let Some(to) = request.to else {
            return self.execute_deploy(request);
        };
        let data = request.data.as_ref();
        if data.starts_with(&IERC20::transferCall::SELECTOR) {
            return match IERC20::transferCall::abi_decode(data, true) {
                Ok(call) => self.execute_transfer(request.from, to, call),
                Err(_) => Execution::Reverted,
            };
        }
        if data.starts_with(&ILaunchpadFactory::createSaleCall::SELECTOR) && self.factories.contains(&to) {
            return match ILaunchpadFactory::createSaleCall::abi_decode(data, true) {
                Ok(call) => self.execute_create_sale(to, call),
                Err(_) => Execution::Reverted,
            };
        }
        Execution::Reverted
    }

    fn execute_deploy(&mut self, request: &TransactionRequest) -> Execution {
        let address = self.next_address(request.from);
        let is_factory = self
            .factory_code
            .as_ref()
            .is_some_and(|code| request.data.starts_with(code));
        if is_factory {
            self.factories.insert(address);
        }
        self.deployments.insert(address, request.data.clone());
        Execution::Success {
            logs: Vec::new(),
            contract: Some(address),
        }
    }

    fn execute_transfer(&mut self, from: Address, token: Address, call: IERC20::transferCall) -> Execution {
        if !self.debit_account(token, from, call.amount) {
            return Execution::Reverted;
        }
        self.credit_account(token, call.to, call.amount);
        let event = Transfer {
            from,
            to: call.to,
            value: call.amount,
        };
        Execution::emitted(token, event.encode_log_data())
    }

    fn execute_create_sale(&mut self, factory: Address, call: ILaunchpadFactory::createSaleCall) -> Execution {
        let sale = self.next_address(factory);
        self.sales.insert(
            sale,
            SaleRecord {
                factory,
                owner: call.owner,
                token: call.token,
                price: call.priceUSDCPerToken,
                cap_tokens: call.capTokens,
                init_code: call.initCode,
            },
        );
        if self.faults.omit_sale_created {
            return Execution::Success {
                logs: Vec::new(),
                contract: None,
            };
        }
        let event = SaleCreated { sale, owner: call.owner };
        Execution::emitted(factory, event.encode_log_data())
    }
}

/// In-process [`LedgerClient`] backed by a mutex-guarded chain state.
#[derive(Default)]
pub struct InMemoryLedger {
    state: Mutex<ChainState>,
}

impl InMemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Treat `address` as a launchpad factory.
    pub fn register_factory(&self, address: Address) {
        self.state.lock().factories.insert(address);
    }

    /// Deployments whose init code starts with `code` become factories.
    pub fn register_factory_code(&self, code: impl Into<Bytes>) {
        self.state.lock().factory_code = Some(code.into());
    }

    /// Init code a deployment was created with.
    pub fn deployment(&self, address: Address) -> Option<Bytes> {
        self.state.lock().deployments.get(&address).cloned()
    }

    pub fn mint(&self, token: Address, holder: Address, amount: U256) {
        self.state.lock().credit_account(token, holder, amount);
    }

    pub fn balance_of(&self, token: Address, holder: Address) -> U256 {
        self.state.lock().balance(token, holder)
    }

    pub fn sale(&self, address: Address) -> Option<SaleRecord> {
        self.state.lock().sales.get(&address).cloned()
    }

    /// Emit a `Bought` event from `sale` in a new block. An unknown `sale` is
    /// tracked from here on.
    pub fn record_purchase(
        &self,
        sale: Address,
        buyer: Address,
        settlement_in: U256,
        fee: U256,
        tokens_out: U256,
    ) -> B256 {
        let mut state = self.state.lock();
        let block = state.next_block();
        state.nonce += 1;
        let tx = keccak256([buyer.as_slice(), state.nonce.to_be_bytes().as_slice()].concat());
        let event = Bought {
            buyer,
            usdcIn: settlement_in,
            feeUsdc: fee,
            tokensOutBase: tokens_out,
        };
        state.push_log(block, tx, sale, event.encode_log_data());
        state.sales.entry(sale).or_insert_with(|| SaleRecord {
            factory: Address::ZERO,
            owner: Address::ZERO,
            token: Address::ZERO,
            price: U256::ZERO,
            cap_tokens: U256::ZERO,
            init_code: Bytes::new(),
        });
        tx
    }

    /// Append a raw log in a new block, for events the ledger does not model.
    pub fn push_raw_log(&self, address: Address, topics: Vec<B256>, data: Vec<u8>) -> Log {
        let mut state = self.state.lock();
        let block = state.next_block();
        state.nonce += 1;
        let tx = keccak256(state.nonce.to_be_bytes());
        state.push_log(block, tx, address, LogData::new_unchecked(topics, data.into()))
    }

    /// Transactions submitted so far, reverted ones included.
    pub fn submitted(&self) -> Vec<TransactionRequest> {
        self.state.lock().submitted.clone()
    }

    /// Mine transactions but keep their receipts hidden until [`Self::release_receipts`].
    pub fn withhold_receipts(&self, on: bool) {
        self.state.lock().faults.withhold_receipts = on;
    }

    pub fn release_receipts(&self) {
        let mut state = self.state.lock();
        state.faults.withhold_receipts = false;
        let withheld = std::mem::take(&mut state.withheld);
        state.receipts.extend(withheld);
    }

    /// Deploy sales without emitting `SaleCreated`.
    pub fn omit_sale_created(&self, on: bool) {
        self.state.lock().faults.omit_sale_created = on;
    }

    /// Revert the next submitted transaction regardless of its content.
    pub fn revert_next(&self) {
        self.state.lock().faults.revert_next = true;
    }

    /// Refuse log queries spanning more than `blocks` blocks.
    pub fn limit_log_range(&self, blocks: u64) {
        self.state.lock().faults.max_log_range = Some(blocks.max(1));
    }
}

#[async_trait]
impl LedgerClient for InMemoryLedger {
    async fn call(&self, to: Address, data: Bytes, block: BlockId) -> Result<Bytes, LaunchpadError> {
        let state = self.state.lock();
        let value = if data.starts_with(&IERC20::balanceOfCall::SELECTOR) {
            let call = IERC20::balanceOfCall::abi_decode(&data, true)
                .map_err(|err| LaunchpadError::Decode(err.to_string()))?;
            state.balance(to, call.account)
        } else if data.starts_with(&ILaunchpadSale::totalSoldBaseCall::SELECTOR) {
            if !state.sales.contains_key(&to) {
                return Err(reverted());
            }
            let block = match block {
                BlockId::Latest => None,
                BlockId::Number(number) => Some(number),
            };
            state.sold_through(to, block)
        } else {
            return Err(reverted());
        };
        Ok(value.abi_encode().into())
    }

    async fn get_logs(&self, filter: &LogFilter) -> Result<Vec<Log>, LaunchpadError> {
        let state = self.state.lock();
        let span = filter.to_block.saturating_sub(filter.from_block) + 1;
        if let Some(max) = state.faults.max_log_range {
            if span > max {
                return Err(LaunchpadError::RangeTooLarge(format!(
                    "block range {span} exceeds {max}"
                )));
            }
        }
        Ok(state
            .logs
            .iter()
            .filter(|log| {
                log.address == filter.address
                    && log.topics.first() == Some(&filter.topic0)
                    && (filter.from_block..=filter.to_block).contains(&log.block_number)
            })
            .cloned()
            .collect())
    }

    async fn head(&self, finality: Finality) -> Result<u64, LaunchpadError> {
        let height = self.state.lock().height;
        Ok(match finality {
            Finality::Finalized => height,
            Finality::Confirmations(depth) => height.saturating_sub(depth),
        })
    }

    async fn send_transaction(&self, request: TransactionRequest) -> Result<B256, LaunchpadError> {
        let mut state = self.state.lock();
        state.nonce += 1;
        let tx = keccak256(
            [
                request.from.as_slice(),
                request.to.unwrap_or_default().as_slice(),
                request.data.as_ref(),
                state.nonce.to_be_bytes().as_slice(),
            ]
            .concat(),
        );
        state.submitted.push(request.clone());
        let block = state.next_block();

        let (success, contract_address, logs) = match state.execute(&request) {
            Execution::Success { logs, contract } => {
                let logs = logs
                    .into_iter()
                    .map(|(address, data)| state.push_log(block, tx, address, data))
                    .collect();
                (true, contract, logs)
            }
            Execution::Reverted => (false, None, Vec::new()),
        };
        let receipt = Receipt {
            transaction_hash: tx,
            block_number: block,
            success,
            contract_address,
            logs,
        };
        if state.faults.withhold_receipts {
            state.withheld.insert(tx, receipt);
        } else {
            state.receipts.insert(tx, receipt);
        }
        Ok(tx)
    }

    async fn transaction_receipt(&self, tx: B256) -> Result<Option<Receipt>, LaunchpadError> {
        Ok(self.state.lock().receipts.get(&tx).cloned())
    }
}
