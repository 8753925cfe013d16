//! The launch descriptor: the operator-authored JSON file describing one sale,
//! which orchestration extends with what it learns on-chain.
//!
//! The file is the durable state of the tooling. It is read and written under
//! an exclusive lock through [`DescriptorCheckpoint`], every write is an
//! atomic rename, and each successful commit bumps `revision`. A transaction
//! submitted but not yet reflected in the descriptor is journaled in a
//! `<descriptor>.pending` sidecar until its outcome is known.

use std::collections::BTreeMap;
use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use alloy_primitives::{Address, B256, U256};
use fs2::FileExt;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::contracts::SaleInit;
use crate::error::LaunchpadError;
use crate::units::{self, MAX_DECIMALS};

fn default_settlement_decimals() -> u8 {
    6
}

/// Accept a decimal amount written either as a JSON string or a JSON number.
fn decimal_string<'de, D: Deserializer<'de>>(deserializer: D) -> Result<String, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Text(String),
        Number(serde_json::Number),
    }
    Ok(match Raw::deserialize(deserializer)? {
        Raw::Text(text) => text,
        Raw::Number(number) => number.to_string(),
    })
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct LaunchDescriptor {
    /// Absent until a factory is deployed or chosen.
    #[serde(alias = "factoryAddress", default, skip_serializing_if = "Option::is_none")]
    pub factory: Option<Address>,
    #[serde(alias = "tokenAddress")]
    pub token: Address,
    #[serde(rename = "usdc", alias = "settlementAssetAddress")]
    pub settlement_asset: Address,
    pub token_decimals: u8,
    #[serde(default = "default_settlement_decimals")]
    pub settlement_decimals: u8,
    /// Price as the sale contract takes it, verbatim. Must be a whole number
    /// by the time the sale is created.
    #[serde(
        rename = "priceUSDCPerToken",
        alias = "priceInSettlementPerToken",
        deserialize_with = "decimal_string"
    )]
    pub price: String,
    /// Tokens offered, in whole-token units.
    #[serde(deserialize_with = "decimal_string")]
    pub cap_tokens_human: String,
    pub start_time: u64,
    pub end_time: u64,

    #[serde(rename = "sale", alias = "saleAddress", default, skip_serializing_if = "Option::is_none")]
    pub sale: Option<Address>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub creation_tx: Option<B256>,
    /// [`LaunchDescriptor::terms_digest`] at the time the sale was created.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config_digest: Option<String>,
    #[serde(default)]
    pub funded: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub funding_tx: Option<B256>,
    #[serde(default)]
    pub revision: u64,

    /// Keys this tool does not know about, kept as written.
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

fn field_amount(field: &str, raw: &str, decimals: u8) -> Result<U256, LaunchpadError> {
    units::parse_units(raw, decimals).map_err(|err| match err {
        LaunchpadError::Config(msg) => LaunchpadError::Config(format!("{field}: {msg}")),
        other => other,
    })
}

fn whole_number(field: &str, raw: &str) -> Result<U256, LaunchpadError> {
    units::parse_units(raw, 0).map_err(|_| {
        LaunchpadError::Config(format!(
            "{field} {raw:?} is passed to the sale contract as an integer and must be a whole number"
        ))
    })
}

/// Lifecycle position of a sale, derived from its descriptor.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SaleState {
    Unconfigured,
    Created,
    Funded,
}

impl fmt::Display for SaleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            SaleState::Unconfigured => "unconfigured",
            SaleState::Created => "created",
            SaleState::Funded => "funded",
        })
    }
}

impl LaunchDescriptor {
    pub fn validate(&self) -> Result<(), LaunchpadError> {
        let config = |msg: String| Err(LaunchpadError::Config(msg));

        if self.factory == Some(Address::ZERO) {
            return config("factory must not be the zero address".into());
        }
        for (name, address) in [
            ("token", self.token),
            ("usdc", self.settlement_asset),
        ] {
            if address == Address::ZERO {
                return config(format!("{name} must not be the zero address"));
            }
        }
        if self.token_decimals > MAX_DECIMALS {
            return config(format!(
                "tokenDecimals {} exceeds {MAX_DECIMALS}",
                self.token_decimals
            ));
        }
        if self.settlement_decimals > MAX_DECIMALS {
            return config(format!(
                "settlementDecimals {} exceeds {MAX_DECIMALS}",
                self.settlement_decimals
            ));
        }
        if self.start_time >= self.end_time {
            return config(format!(
                "startTime {} must be before endTime {}",
                self.start_time, self.end_time
            ));
        }
        if self.exact_price()?.is_zero() {
            return config("priceUSDCPerToken must be greater than zero".into());
        }
        if self.cap_base()?.is_zero() {
            return config("capTokensHuman must be greater than zero".into());
        }
        if self.sale == Some(Address::ZERO) {
            return config("sale must not be the zero address".into());
        }
        if self.funded && self.sale.is_none() {
            return config("descriptor is marked funded but has no sale address".into());
        }
        Ok(())
    }

    /// The price scaled to the widest precision, so any valid spelling of it
    /// compares and hashes the same.
    fn exact_price(&self) -> Result<U256, LaunchpadError> {
        field_amount("priceUSDCPerToken", &self.price, MAX_DECIMALS)
    }

    /// Cap in token base units; also the funding amount.
    pub fn cap_base(&self) -> Result<U256, LaunchpadError> {
        field_amount("capTokensHuman", &self.cap_tokens_human, self.token_decimals)
    }

    /// SHA-256 over the sale terms a deployed sale is bound to.
    ///
    /// Amounts enter as integers, so `"1"` and `"1.0"` hash the same.
    pub fn terms_digest(&self) -> Result<String, LaunchpadError> {
        let mut hasher = Sha256::new();
        hasher.update(b"launchpad/sale-terms/v1");
        hasher.update(self.token.as_slice());
        hasher.update(self.settlement_asset.as_slice());
        hasher.update([self.token_decimals, self.settlement_decimals]);
        hasher.update(self.exact_price()?.to_be_bytes::<32>());
        hasher.update(self.cap_base()?.to_be_bytes::<32>());
        hasher.update(self.start_time.to_be_bytes());
        hasher.update(self.end_time.to_be_bytes());
        Ok(hex::encode(hasher.finalize()))
    }

    /// Constructor and `createSale` arguments.
    ///
    /// Price and cap go to the contracts exactly as written, and the contracts
    /// take integers: a fractional value is refused here, before anything is
    /// submitted.
    pub fn sale_init(&self, owner: Address) -> Result<SaleInit, LaunchpadError> {
        Ok(SaleInit {
            owner,
            token: self.token,
            settlement_asset: self.settlement_asset,
            token_decimals: self.token_decimals,
            price: whole_number("priceUSDCPerToken", &self.price)?,
            cap_tokens: whole_number("capTokensHuman", &self.cap_tokens_human)?,
            start_time: self.start_time,
            end_time: self.end_time,
        })
    }

    pub fn state(&self) -> SaleState {
        match (self.sale, self.funded) {
            (Some(_), true) => SaleState::Funded,
            (Some(_), false) => SaleState::Created,
            (None, _) => SaleState::Unconfigured,
        }
    }
}

/// Read and validate a descriptor.
pub fn load(path: &Path) -> Result<LaunchDescriptor, LaunchpadError> {
    let raw = fs::read_to_string(path).map_err(|err| match err.kind() {
        ErrorKind::NotFound => {
            LaunchpadError::Config(format!("descriptor {} not found", path.display()))
        }
        _ => LaunchpadError::Io(err),
    })?;
    let descriptor: LaunchDescriptor = serde_json::from_str(&raw)
        .map_err(|err| LaunchpadError::Config(format!("descriptor {}: {err}", path.display())))?;
    descriptor.validate()?;
    Ok(descriptor)
}

/// Atomically replace the descriptor at `path`.
pub fn save(path: &Path, descriptor: &LaunchDescriptor) -> Result<(), LaunchpadError> {
    let mut json = serde_json::to_string_pretty(descriptor)?;
    json.push('\n');
    write_atomic(path, json.as_bytes())
}

/// Write `bytes` to a temp file next to `path`, sync it and rename it over `path`.
pub(crate) fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), LaunchpadError> {
    let parent = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    let mut temp = tempfile::NamedTempFile::new_in(parent)?;
    temp.write_all(bytes)?;
    temp.as_file().sync_all()?;
    temp.persist(path).map_err(|err| LaunchpadError::Io(err.error))?;
    Ok(())
}

fn sidecar(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(suffix);
    PathBuf::from(name)
}

/// Lifecycle step a submitted transaction belongs to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Step {
    DeployFactory,
    Create,
    Fund,
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Step::DeployFactory => "deploy-factory",
            Step::Create => "create",
            Step::Fund => "fund",
        })
    }
}

/// A submitted transaction whose outcome the descriptor does not reflect yet.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingTransaction {
    pub step: Step,
    pub tx: B256,
}

/// Journal entry next to the descriptor at `path`, if any.
pub fn load_pending(path: &Path) -> Result<Option<PendingTransaction>, LaunchpadError> {
    let journal = sidecar(path, ".pending");
    let raw = match fs::read(&journal) {
        Ok(raw) => raw,
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(err.into()),
    };
    serde_json::from_slice(&raw)
        .map(Some)
        .map_err(|err| LaunchpadError::Config(format!("pending journal {}: {err}", journal.display())))
}

/// A descriptor held under an exclusive advisory lock.
///
/// The lock lives on a `<descriptor>.lock` sidecar so atomic renames of the
/// descriptor itself never drop it. It is released when the checkpoint is
/// dropped.
#[derive(Debug)]
pub struct DescriptorCheckpoint {
    path: PathBuf,
    descriptor: LaunchDescriptor,
    pending: Option<PendingTransaction>,
    _lock: File,
}

impl DescriptorCheckpoint {
    /// Lock and load the descriptor at `path`. Fails fast if another process
    /// (or another checkpoint in this one) holds the lock.
    pub fn acquire(path: impl Into<PathBuf>) -> Result<Self, LaunchpadError> {
        let path = path.into();
        let lock_path = sidecar(&path, ".lock");
        let lock = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&lock_path)?;
        lock.try_lock_exclusive().map_err(|err| {
            LaunchpadError::Precondition(format!(
                "descriptor locked ({}): {err}",
                lock_path.display()
            ))
        })?;
        let descriptor = load(&path)?;
        let pending = load_pending(&path)?;
        debug!(path = %path.display(), revision = descriptor.revision, ?pending, "descriptor checkpoint acquired");
        Ok(Self {
            path,
            descriptor,
            pending,
            _lock: lock,
        })
    }

    pub fn descriptor(&self) -> &LaunchDescriptor {
        &self.descriptor
    }

    pub fn pending(&self) -> Option<PendingTransaction> {
        self.pending
    }

    /// Journal `tx` as submitted for `step`. Only one transaction can be
    /// outstanding at a time.
    pub fn record_pending(&mut self, step: Step, tx: B256) -> Result<(), LaunchpadError> {
        if let Some(outstanding) = self.pending {
            return Err(LaunchpadError::Precondition(format!(
                "{} transaction {} is still outstanding",
                outstanding.step, outstanding.tx
            )));
        }
        let entry = PendingTransaction { step, tx };
        let mut json = serde_json::to_string_pretty(&entry)?;
        json.push('\n');
        write_atomic(&sidecar(&self.path, ".pending"), json.as_bytes())?;
        debug!(%tx, %step, "pending transaction journaled");
        self.pending = Some(entry);
        Ok(())
    }

    /// Drop the journal entry once its outcome is recorded or known to be void.
    pub fn clear_pending(&mut self) -> Result<(), LaunchpadError> {
        match fs::remove_file(sidecar(&self.path, ".pending")) {
            Ok(()) => {}
            Err(err) if err.kind() == ErrorKind::NotFound => {}
            Err(err) => return Err(err.into()),
        }
        self.pending = None;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Apply `update` to a copy, validate it, persist it with the next
    /// revision and only then adopt it in memory.
    ///
    /// Recorded factory and sale addresses cannot be changed and a funded
    /// descriptor cannot be un-funded. On any error neither the file nor the in-memory
    /// descriptor change.
    pub fn commit<F>(&mut self, update: F) -> Result<&LaunchDescriptor, LaunchpadError>
    where
        F: FnOnce(&mut LaunchDescriptor) -> Result<(), LaunchpadError>,
    {
        let current = &self.descriptor;
        let mut next = current.clone();
        update(&mut next)?;

        if current.factory.is_some() && next.factory != current.factory {
            return Err(LaunchpadError::IdempotencyViolation(format!(
                "factory is already recorded as {}",
                current.factory.unwrap_or_default()
            )));
        }
        if current.sale.is_some() && next.sale != current.sale {
            return Err(LaunchpadError::IdempotencyViolation(format!(
                "sale address is already recorded as {}",
                current.sale.unwrap_or_default()
            )));
        }
        if current.funded && !next.funded {
            return Err(LaunchpadError::IdempotencyViolation(
                "a funded descriptor cannot be marked unfunded".into(),
            ));
        }
        next.validate()?;
        next.revision = current.revision + 1;

        save(&self.path, &next)?;
        debug!(path = %self.path.display(), revision = next.revision, "descriptor committed");
        self.descriptor = next;
        Ok(&self.descriptor)
    }
}
