//! Contract surface used by the tooling: the factory, the sale and the
//! ERC-20 token being sold.

use alloy_primitives::{Address, Bytes, U256};
use alloy_sol_types::{sol, SolCall, SolConstructor, SolEvent};

use crate::error::LaunchpadError;
use crate::ledger::Log;

/// Platform fee a new factory charges unless told otherwise.
pub const DEFAULT_FEE_BPS: u16 = 200;
pub const MAX_FEE_BPS: u16 = 10_000;

sol! {
    #[derive(Debug, PartialEq, Eq)]
    interface ILaunchpadFactory {
        event SaleCreated(address indexed sale, address indexed owner);

        function createSale(
            address owner,
            bytes initCode,
            address token,
            uint256 priceUSDCPerToken,
            uint256 capTokens,
            uint256 startTime,
            uint256 endTime
        ) external returns (address sale);
    }

    #[derive(Debug, PartialEq, Eq)]
    interface ILaunchpadSale {
        event Bought(address indexed buyer, uint256 usdcIn, uint256 feeUsdc, uint256 tokensOutBase);

        function totalSoldBase() external view returns (uint256);
    }

    #[derive(Debug, PartialEq, Eq)]
    interface IERC20 {
        event Transfer(address indexed from, address indexed to, uint256 value);

        function balanceOf(address account) external view returns (uint256);
        function transfer(address to, uint256 amount) external returns (bool);
    }

    contract LaunchpadSale {
        constructor(
            address owner,
            address token,
            address usdc,
            uint8 tokenDecimals,
            uint256 priceUSDCPerToken,
            uint256 capTokens,
            uint256 startTime,
            uint256 endTime
        );
    }

    contract LaunchpadFactory {
        constructor(address owner, address usdc, uint8 usdcDecimals, address treasury, uint16 feeBps);
    }
}

pub use ILaunchpadFactory::SaleCreated;
pub use ILaunchpadSale::Bought;
pub use IERC20::Transfer;

/// Constructor arguments of a sale, in the order the sale contract takes them.
///
/// Price and cap are handed over as the integers the operator wrote; the
/// sale contract scales the cap by `token_decimals` itself.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SaleInit {
    pub owner: Address,
    pub token: Address,
    pub settlement_asset: Address,
    pub token_decimals: u8,
    pub price: U256,
    pub cap_tokens: U256,
    pub start_time: u64,
    pub end_time: u64,
}

impl SaleInit {
    /// Creation code followed by the ABI-encoded constructor arguments.
    pub fn init_code(&self, creation_code: &[u8]) -> Vec<u8> {
        let args = LaunchpadSale::constructorCall {
            owner: self.owner,
            token: self.token,
            usdc: self.settlement_asset,
            tokenDecimals: self.token_decimals,
            priceUSDCPerToken: self.price,
            capTokens: self.cap_tokens,
            startTime: U256::from(self.start_time),
            endTime: U256::from(self.end_time),
        };
        [creation_code, args.abi_encode().as_slice()].concat()
    }

    /// Calldata for the factory's `createSale`.
    pub fn create_sale_call(&self, creation_code: &[u8]) -> Bytes {
        ILaunchpadFactory::createSaleCall {
            owner: self.owner,
            initCode: self.init_code(creation_code).into(),
            token: self.token,
            priceUSDCPerToken: self.price,
            capTokens: self.cap_tokens,
            startTime: U256::from(self.start_time),
            endTime: U256::from(self.end_time),
        }
        .abi_encode()
        .into()
    }
}

/// Constructor arguments of a launchpad factory.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FactoryInit {
    pub owner: Address,
    pub settlement_asset: Address,
    pub settlement_decimals: u8,
    pub treasury: Address,
    pub fee_bps: u16,
}

impl FactoryInit {
    pub fn init_code(&self, creation_code: &[u8]) -> Vec<u8> {
        let args = LaunchpadFactory::constructorCall {
            owner: self.owner,
            usdc: self.settlement_asset,
            usdcDecimals: self.settlement_decimals,
            treasury: self.treasury,
            feeBps: self.fee_bps,
        };
        [creation_code, args.abi_encode().as_slice()].concat()
    }
}

pub fn transfer_call(to: Address, amount: U256) -> Bytes {
    IERC20::transferCall { to, amount }.abi_encode().into()
}

pub fn balance_of_call(account: Address) -> Bytes {
    IERC20::balanceOfCall { account }.abi_encode().into()
}

pub fn total_sold_call() -> Bytes {
    ILaunchpadSale::totalSoldBaseCall {}.abi_encode().into()
}

fn returned<C: SolCall>(out: &[u8]) -> Result<C::Return, LaunchpadError> {
    C::abi_decode_returns(out, true).map_err(|err| {
        LaunchpadError::Decode(format!("{} returned {} bytes: {err}", C::SIGNATURE, out.len()))
    })
}

/// Decode the result of a `balanceOf` call.
pub fn decode_balance(out: &[u8]) -> Result<U256, LaunchpadError> {
    Ok(returned::<IERC20::balanceOfCall>(out)?._0)
}

/// Decode the result of a `totalSoldBase` call.
pub fn decode_total_sold(out: &[u8]) -> Result<U256, LaunchpadError> {
    Ok(returned::<ILaunchpadSale::totalSoldBaseCall>(out)?._0)
}

/// Decode `log` as `E`, which the caller has matched by signature.
pub fn decode_event<E: SolEvent>(log: &Log) -> Result<E, LaunchpadError> {
    E::decode_raw_log(log.topics.iter().copied(), &log.data, true).map_err(|err| {
        LaunchpadError::Decode(format!(
            "{} log {} of tx {}: {err}",
            E::SIGNATURE,
            log.log_index,
            log.transaction_hash
        ))
    })
}

/// Every `E` emitted by `emitter` in `logs`, in order.
///
/// Logs from other addresses or with another signature are skipped; a log
/// that matches both but does not decode is an error.
pub fn events<E: SolEvent>(logs: &[Log], emitter: Address) -> Result<Vec<E>, LaunchpadError> {
    logs.iter()
        .filter(|log| log.address == emitter && log.topics.first() == Some(&E::SIGNATURE_HASH))
        .map(decode_event::<E>)
        .collect()
}

/// First `E` emitted by `emitter`. `Ok(None)` when there is none.
pub fn find_event<E: SolEvent>(logs: &[Log], emitter: Address) -> Result<Option<E>, LaunchpadError> {
    Ok(events(logs, emitter)?.into_iter().next())
}
