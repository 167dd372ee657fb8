//! In-memory lending protocol used as the simulated deployment.
//!
//! Two contract kinds are modelled:
//!
//! - `PriceOracle`: a single `price` field, updated through `setPrice`
//! - `StableBaseCDP`: collateralised debt positions ("safes") with a
//!   bootstrap mode, a borrow fee and a redemption queue kept as a doubly
//!   linked list ordered by safe weight
//!
//! Every call checks its preconditions before touching state, so a revert
//! never leaves partial writes behind. Fault injection follows the same
//! shape as a simulated network: a shared controller can make the chain
//! unreachable immediately or after a number of calls.

use async_trait::async_trait;
use num_bigint::BigInt;
use num_traits::{Signed, ToPrimitive, Zero};
use protosim_core::ProviderSet;
use protosim_env::{
    resolve_params, AccountAddress, CallReceipt, CallRequest, CallStatus, ContractHandle, DeploymentDescriptor,
    DeploymentService, DeploymentStep, EnvError, EnvironmentController, ExecutionEnvironment,
    SnapshotProvider, Value,
};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, info, warn};

pub const CDP_KIND: &str = "StableBaseCDP";
pub const ORACLE_KIND: &str = "PriceOracle";

const BPS: i64 = 10_000;

/// Deliberate implementation bugs, for exercising the validator.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Defects {
    /// `borrow` does not add to `totalDebt`
    pub skip_total_debt: bool,
    /// `borrow` never leaves bootstrap mode
    pub frozen_mode: bool,
    /// First borrows append to the redemption queue instead of inserting
    /// in weight order
    pub unordered_queue: bool,
}

/// Configuration of the simulated chain.
#[derive(Debug, Clone)]
pub struct LendingConfig {
    /// Balance of every account the chain has not seen yet
    pub initial_balance: BigInt,
    pub defects: Defects,
}

impl Default for LendingConfig {
    fn default() -> Self {
        Self {
            initial_balance: BigInt::from(1_000),
            defects: Defects::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Bootstrap,
    Normal,
}

impl Mode {
    fn as_str(&self) -> &'static str {
        match self {
            Mode::Bootstrap => "BOOTSTRAP",
            Mode::Normal => "NORMAL",
        }
    }
}

#[derive(Debug, Clone)]
struct Safe {
    owner: AccountAddress,
    collateral: BigInt,
    borrowed: BigInt,
    weight: BigInt,
}

#[derive(Debug, Clone)]
struct QueueNode {
    prev: u64,
    next: u64,
    value: BigInt,
}

/// Linked list over safe ids; 0 is the null id.
#[derive(Debug, Clone, Default)]
struct RedemptionQueue {
    head: u64,
    tail: u64,
    nodes: BTreeMap<u64, QueueNode>,
}

impl RedemptionQueue {
    /// Inserts after every node whose value is not greater than `value`.
    fn insert_sorted(&mut self, id: u64, value: BigInt) {
        let mut cursor = self.head;
        while let Some(node) = self.nodes.get(&cursor) {
            if node.value > value {
                break;
            }
            cursor = node.next;
        }
        if cursor == 0 {
            self.push_back(id, value);
            return;
        }

        let prev = self.nodes.get(&cursor).map(|n| n.prev).unwrap_or(0);
        self.nodes.insert(id, QueueNode { prev, next: cursor, value });
        if let Some(at) = self.nodes.get_mut(&cursor) {
            at.prev = id;
        }
        match self.nodes.get_mut(&prev) {
            Some(before) => before.next = id,
            None => self.head = id,
        }
    }

    fn push_back(&mut self, id: u64, value: BigInt) {
        let prev = self.tail;
        self.nodes.insert(id, QueueNode { prev, next: 0, value });
        match self.nodes.get_mut(&prev) {
            Some(before) => before.next = id,
            None => self.head = id,
        }
        self.tail = id;
    }

    fn remove(&mut self, id: u64) {
        let Some(node) = self.nodes.remove(&id) else {
            return;
        };
        match self.nodes.get_mut(&node.prev) {
            Some(before) => before.next = node.next,
            None => self.head = node.next,
        }
        match self.nodes.get_mut(&node.next) {
            Some(after) => after.prev = node.prev,
            None => self.tail = node.prev,
        }
    }

    fn to_value(&self) -> Value {
        let nodes = self
            .nodes
            .iter()
            .map(|(id, node)| {
                let fields = BTreeMap::from([
                    ("prev".to_string(), Value::int(node.prev)),
                    ("next".to_string(), Value::int(node.next)),
                    ("value".to_string(), Value::Int(node.value.clone())),
                ]);
                (id.to_string(), Value::Map(fields))
            })
            .collect();
        Value::Map(BTreeMap::from([
            ("head".to_string(), Value::int(self.head)),
            ("tail".to_string(), Value::int(self.tail)),
            ("nodes".to_string(), Value::Map(nodes)),
        ]))
    }
}

#[derive(Debug, Clone)]
struct CdpState {
    oracle: Option<AccountAddress>,
    mode: Mode,
    bootstrap_threshold: BigInt,
    borrow_fee_bps: BigInt,
    /// Minimum collateral value over debt, in percent
    min_collateral_ratio: BigInt,
    total_debt: BigInt,
    total_collateral: BigInt,
    fees_collected: BigInt,
    next_safe_id: u64,
    safes: BTreeMap<u64, Safe>,
    queue: RedemptionQueue,
}

impl CdpState {
    fn fields(&self) -> BTreeMap<String, Value> {
        let safes = self
            .safes
            .iter()
            .map(|(id, safe)| {
                let fields = BTreeMap::from([
                    ("owner".to_string(), Value::from(safe.owner.clone())),
                    ("collateral".to_string(), Value::Int(safe.collateral.clone())),
                    ("borrowedAmount".to_string(), Value::Int(safe.borrowed.clone())),
                    ("weight".to_string(), Value::Int(safe.weight.clone())),
                ]);
                (id.to_string(), Value::Map(fields))
            })
            .collect();

        let oracle = self
            .oracle
            .as_ref()
            .map(|a| Value::from(a.clone()))
            .unwrap_or_else(|| Value::int(0));

        BTreeMap::from([
            ("oracle".to_string(), oracle),
            ("mode".to_string(), Value::text(self.mode.as_str())),
            ("bootstrapThreshold".to_string(), Value::Int(self.bootstrap_threshold.clone())),
            ("borrowFeeBps".to_string(), Value::Int(self.borrow_fee_bps.clone())),
            ("minCollateralRatio".to_string(), Value::Int(self.min_collateral_ratio.clone())),
            ("totalDebt".to_string(), Value::Int(self.total_debt.clone())),
            ("totalCollateral".to_string(), Value::Int(self.total_collateral.clone())),
            ("feesCollected".to_string(), Value::Int(self.fees_collected.clone())),
            ("nextSafeId".to_string(), Value::int(self.next_safe_id)),
            ("safes".to_string(), Value::Map(safes)),
            ("redemptionQueue".to_string(), self.queue.to_value()),
        ])
    }
}

#[derive(Debug, Clone)]
enum Instance {
    Oracle { price: BigInt },
    Cdp(Box<CdpState>),
}

#[derive(Debug, Default)]
struct ChainState {
    contracts: Vec<ContractHandle>,
    instances: BTreeMap<String, Instance>,
    balances: BTreeMap<AccountAddress, BigInt>,
    tx_count: u64,
    /// Calls left before the chain becomes unreachable
    remaining_calls: Option<u64>,
    unreachable: bool,
}

impl ChainState {
    fn check_reachable(&self) -> Result<(), EnvError> {
        if self.unreachable {
            Err(EnvError::unreachable("simulated chain is down"))
        } else {
            Ok(())
        }
    }

    fn balance(&self, account: &AccountAddress, initial: &BigInt) -> BigInt {
        self.balances.get(account).cloned().unwrap_or_else(|| initial.clone())
    }

    fn price_at(&self, address: &AccountAddress) -> Option<BigInt> {
        let name = &self.contracts.iter().find(|c| &c.address == address)?.name;
        match self.instances.get(name)? {
            Instance::Oracle { price } => Some(price.clone()),
            Instance::Cdp(_) => None,
        }
    }
}

/// Revert reason on the error side, so argument parsing can use `?`.
type CallResult = Result<CallReceipt, String>;

fn int_arg(request: &CallRequest, name: &str) -> Result<BigInt, String> {
    request
        .arg(name)
        .and_then(|v| v.as_int())
        .cloned()
        .ok_or_else(|| format!("missing integer argument '{}'", name))
}

fn id_arg(request: &CallRequest, name: &str) -> Result<u64, String> {
    int_arg(request, name)?
        .to_u64()
        .ok_or_else(|| format!("argument '{}' is not a valid id", name))
}

fn address_arg(request: &CallRequest, name: &str) -> Result<AccountAddress, String> {
    match request.arg(name) {
        Some(Value::Text(s)) => Ok(AccountAddress::parse(s)),
        _ => Err(format!("missing address argument '{}'", name)),
    }
}

/// Deterministic in-memory chain hosting the lending protocol.
pub struct SimChain {
    state: Mutex<ChainState>,
    config: LendingConfig,
}

impl SimChain {
    pub fn new(config: LendingConfig) -> Self {
        Self {
            state: Mutex::new(ChainState::default()),
            config,
        }
    }

    /// Creates an Arc-wrapped chain for sharing between seams.
    pub fn shared(config: LendingConfig) -> Arc<Self> {
        Arc::new(Self::new(config))
    }

    /// Account that signs deployment transactions.
    pub fn deployer() -> AccountAddress {
        AccountAddress::from_seed(0)
    }

    /// Snapshot providers for both contract kinds, reading from this chain.
    pub fn providers(self: &Arc<Self>) -> ProviderSet {
        let mut providers: ProviderSet = BTreeMap::new();
        providers.insert(
            CDP_KIND.to_string(),
            Arc::new(LendingSnapshotProvider { chain: Arc::clone(self), kind: CDP_KIND }),
        );
        providers.insert(
            ORACLE_KIND.to_string(),
            Arc::new(LendingSnapshotProvider { chain: Arc::clone(self), kind: ORACLE_KIND }),
        );
        providers
    }

    fn lock(&self) -> MutexGuard<'_, ChainState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Applies one call to the chain state.
    fn dispatch(&self, state: &mut ChainState, request: &CallRequest) -> Result<CallReceipt, EnvError> {
        let is_oracle = match state.instances.get(&request.contract) {
            None => return Err(EnvError::rpc(format!("no contract named '{}'", request.contract))),
            Some(instance) => matches!(instance, Instance::Oracle { .. }),
        };
        let result = if is_oracle {
            self.oracle_call(state, request)
        } else {
            self.cdp_call(state, request)
        };

        state.tx_count += 1;
        let mut receipt = result.unwrap_or_else(CallReceipt::reverted);
        receipt.tx_hash = Some(format!("0x{:064x}", state.tx_count));
        Ok(receipt)
    }

    fn oracle_call(&self, state: &mut ChainState, request: &CallRequest) -> CallResult {
        match request.method.as_str() {
            "setPrice" => {
                let price = int_arg(request, "price")?;
                if !price.is_positive() {
                    return Err("price must be positive".into());
                }
                if let Some(Instance::Oracle { price: p }) = state.instances.get_mut(&request.contract) {
                    *p = price;
                }
                Ok(CallReceipt::success())
            }
            other => Err(format!("unknown method '{}'", other)),
        }
    }

    fn cdp_call(&self, state: &mut ChainState, request: &CallRequest) -> CallResult {
        let initial = &self.config.initial_balance;
        let defects = self.config.defects;
        let sender = &request.sender;
        let sender_balance = state.balance(sender, initial);

        let price = match state.instances.get(&request.contract) {
            Some(Instance::Cdp(cdp)) => cdp.oracle.as_ref().and_then(|o| state.price_at(o)),
            _ => None,
        };

        let ChainState { instances, balances, .. } = state;
        let Some(Instance::Cdp(cdp)) = instances.get_mut(&request.contract) else {
            return Err("not a CDP contract".into());
        };

        match request.method.as_str() {
            "setOracle" => {
                cdp.oracle = Some(address_arg(request, "oracle")?);
                Ok(CallReceipt::success())
            }

            "openSafe" => {
                let collateral = int_arg(request, "collateral")?;
                if !collateral.is_positive() {
                    return Err("collateral must be positive".into());
                }
                if collateral > sender_balance {
                    return Err("insufficient balance".into());
                }

                let id = cdp.next_safe_id;
                cdp.next_safe_id += 1;
                cdp.total_collateral += &collateral;
                balances.insert(sender.clone(), sender_balance - &collateral);
                cdp.safes.insert(
                    id,
                    Safe {
                        owner: sender.clone(),
                        collateral,
                        borrowed: BigInt::zero(),
                        weight: BigInt::zero(),
                    },
                );
                Ok(CallReceipt::success().with_output("safeId", Value::int(id)))
            }

            "borrow" => {
                let id = id_arg(request, "safeId")?;
                let amount = int_arg(request, "amount")?;
                let weight = int_arg(request, "weight")?;
                let price = price.ok_or("oracle not set")?;

                let safe = cdp.safes.get(&id).ok_or("unknown safe")?;
                if &safe.owner != sender {
                    return Err("caller does not own safe".into());
                }
                if !amount.is_positive() {
                    return Err("amount must be positive".into());
                }
                if !weight.is_positive() {
                    return Err("weight must be positive".into());
                }
                let new_debt = &safe.borrowed + &amount;
                if &safe.collateral * &price * 100 < &new_debt * &cdp.min_collateral_ratio {
                    return Err("undercollateralized".into());
                }

                let first_borrow = safe.borrowed.is_zero();
                let fee = &amount * &cdp.borrow_fee_bps / BPS;
                let crosses = &cdp.total_debt + &amount >= cdp.bootstrap_threshold;

                if cdp.mode == Mode::Bootstrap && crosses && !defects.frozen_mode {
                    cdp.mode = Mode::Normal;
                }
                if !defects.skip_total_debt {
                    cdp.total_debt += &amount;
                }
                cdp.fees_collected += &fee;
                balances.insert(sender.clone(), sender_balance + &amount - &fee);

                if first_borrow {
                    if defects.unordered_queue {
                        cdp.queue.push_back(id, weight.clone());
                    } else {
                        cdp.queue.insert_sorted(id, weight.clone());
                    }
                }
                if let Some(safe) = cdp.safes.get_mut(&id) {
                    safe.borrowed = new_debt;
                    if first_borrow {
                        safe.weight = weight;
                    }
                }
                Ok(CallReceipt::success())
            }

            "repay" => {
                let id = id_arg(request, "safeId")?;
                let amount = int_arg(request, "amount")?;

                let safe = cdp.safes.get(&id).ok_or("unknown safe")?;
                if &safe.owner != sender {
                    return Err("caller does not own safe".into());
                }
                if !amount.is_positive() || amount > safe.borrowed {
                    return Err("invalid repay amount".into());
                }
                if amount > sender_balance {
                    return Err("insufficient balance".into());
                }

                let remaining = &safe.borrowed - &amount;
                cdp.total_debt -= &amount;
                balances.insert(sender.clone(), sender_balance - &amount);
                if remaining.is_zero() {
                    cdp.queue.remove(id);
                }
                if let Some(safe) = cdp.safes.get_mut(&id) {
                    if remaining.is_zero() {
                        safe.weight = BigInt::zero();
                    }
                    safe.borrowed = remaining;
                }
                Ok(CallReceipt::success())
            }

            other => Err(format!("unknown method '{}'", other)),
        }
    }

    fn instantiate(kind: &str, params: &[(Option<String>, Value)]) -> Result<Instance, EnvError> {
        let named = |name: &str, default: i64| -> Result<BigInt, EnvError> {
            match params.iter().find(|(n, _)| n.as_deref() == Some(name)) {
                None => Ok(BigInt::from(default)),
                Some((_, Value::Int(i))) => Ok(i.clone()),
                Some((_, other)) => Err(EnvError::deployment(format!(
                    "parameter '{}' must be an integer, got {}",
                    name,
                    other.type_name()
                ))),
            }
        };

        match kind {
            ORACLE_KIND => Ok(Instance::Oracle { price: named("price", 1)? }),
            CDP_KIND => Ok(Instance::Cdp(Box::new(CdpState {
                oracle: None,
                mode: Mode::Bootstrap,
                bootstrap_threshold: named("bootstrapThreshold", 1_000)?,
                borrow_fee_bps: named("borrowFeeBps", 50)?,
                min_collateral_ratio: named("minCollateralRatio", 150)?,
                total_debt: BigInt::zero(),
                total_collateral: BigInt::zero(),
                fees_collected: BigInt::zero(),
                next_safe_id: 1,
                safes: BTreeMap::new(),
                queue: RedemptionQueue::default(),
            }))),
            other => Err(EnvError::deployment(format!("unknown contract kind '{}'", other))),
        }
    }
}

#[async_trait]
impl ExecutionEnvironment for SimChain {
    async fn execute(&self, request: CallRequest) -> Result<CallReceipt, EnvError> {
        let mut state = self.lock();
        state.check_reachable()?;
        if let Some(remaining) = state.remaining_calls {
            if remaining == 0 {
                warn!("Simulated chain going down");
                state.unreachable = true;
                return Err(EnvError::unreachable("simulated chain went down"));
            }
            state.remaining_calls = Some(remaining - 1);
        }

        let receipt = self.dispatch(&mut state, &request)?;
        debug!(
            "{}.{} from {} -> {:?}",
            request.contract, request.method, request.sender, receipt.status
        );
        Ok(receipt)
    }

    async fn balance(&self, account: &AccountAddress) -> Result<BigInt, EnvError> {
        let state = self.lock();
        state.check_reachable()?;
        Ok(state.balance(account, &self.config.initial_balance))
    }

    fn contracts(&self) -> Vec<ContractHandle> {
        self.lock().contracts.clone()
    }
}

#[async_trait]
impl DeploymentService for SimChain {
    async fn deploy(&self, descriptor: &DeploymentDescriptor) -> Result<Vec<ContractHandle>, EnvError> {
        descriptor.check_references()?;
        let mut state = self.lock();
        state.check_reachable()?;

        for (index, step) in descriptor.steps.iter().enumerate() {
            let params = resolve_params(step.params(), &state.contracts)?;
            match step {
                DeploymentStep::Contract { contract, kind, .. } => {
                    if state.instances.contains_key(contract) {
                        return Err(EnvError::deployment(format!(
                            "step {}: '{}' is already deployed",
                            index, contract
                        )));
                    }
                    let kind = kind.clone().unwrap_or_else(|| contract.clone());
                    let instance = Self::instantiate(&kind, &params)?;
                    let handle = ContractHandle {
                        name: contract.clone(),
                        kind,
                        address: AccountAddress::from_seed(0xC0DE_0000 + index as u64),
                    };
                    info!("Deployed {} ({}) at {}", handle.name, handle.kind, handle.address);
                    state.instances.insert(contract.clone(), instance);
                    state.contracts.push(handle);
                }
                DeploymentStep::Transaction { contract, method, .. } => {
                    let request = CallRequest {
                        contract: contract.clone(),
                        method: method.clone(),
                        sender: Self::deployer(),
                        args: params
                            .into_iter()
                            .enumerate()
                            .map(|(i, (name, value))| (name.unwrap_or_else(|| format!("arg{}", i)), value))
                            .collect(),
                    };
                    let receipt = self.dispatch(&mut state, &request)?;
                    if let CallStatus::Reverted { reason } = receipt.status {
                        return Err(EnvError::deployment(format!(
                            "step {}: {}.{} reverted: {}",
                            index, contract, method, reason
                        )));
                    }
                }
            }
        }

        Ok(state.contracts.clone())
    }
}

impl EnvironmentController for SimChain {
    fn fail_after(&self, calls: u64) {
        self.lock().remaining_calls = Some(calls);
    }

    fn set_unreachable(&self, unreachable: bool) {
        self.lock().unreachable = unreachable;
    }

    fn heal(&self) {
        let mut state = self.lock();
        state.unreachable = false;
        state.remaining_calls = None;
    }
}

/// Reads contract fields straight out of the chain state.
struct LendingSnapshotProvider {
    chain: Arc<SimChain>,
    kind: &'static str,
}

#[async_trait]
impl SnapshotProvider for LendingSnapshotProvider {
    fn kind(&self) -> &str {
        self.kind
    }

    async fn snapshot(
        &self,
        contract: &ContractHandle,
        _actors: &[AccountAddress],
    ) -> Result<BTreeMap<String, Value>, EnvError> {
        let state = self.chain.lock();
        state.check_reachable()?;
        match state.instances.get(&contract.name) {
            Some(Instance::Oracle { price }) if self.kind == ORACLE_KIND => {
                Ok(BTreeMap::from([("price".to_string(), Value::Int(price.clone()))]))
            }
            Some(Instance::Cdp(cdp)) if self.kind == CDP_KIND => Ok(cdp.fields()),
            Some(_) => Err(EnvError::snapshot(format!(
                "'{}' is not a {} contract",
                contract.name, self.kind
            ))),
            None => Err(EnvError::snapshot(format!("no contract named '{}'", contract.name))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scenarios::{LENDING_ACTIONS, LENDING_DEPLOYMENT, LENDING_INVARIANTS};
    use protosim_core::queue::{check_queue, QueueOrder};
    use protosim_core::{
        capture_state, ActionCatalogue, ExecutionOutcome, Parameters, ProtocolInvariants, RuleKind,
        RuleStatus, Validator, WorldState,
    };

    fn alice() -> AccountAddress {
        AccountAddress::from_seed(101)
    }

    fn bob() -> AccountAddress {
        AccountAddress::from_seed(102)
    }

    async fn deployed(config: LendingConfig) -> Arc<SimChain> {
        let chain = SimChain::shared(config);
        let descriptor = DeploymentDescriptor::from_json(LENDING_DEPLOYMENT).unwrap();
        chain.deploy(&descriptor).await.unwrap();
        chain
    }

    fn call(sender: &AccountAddress, contract: &str, method: &str, args: &[(&str, i64)]) -> CallRequest {
        CallRequest {
            contract: contract.into(),
            method: method.into(),
            sender: sender.clone(),
            args: args.iter().map(|(n, v)| (n.to_string(), Value::int(*v))).collect(),
        }
    }

    async fn capture(chain: &Arc<SimChain>) -> WorldState {
        capture_state(chain.as_ref(), &chain.providers(), &[alice(), bob()]).await.unwrap()
    }

    fn int(state: &WorldState, path: &str) -> Option<BigInt> {
        let keys: Vec<String> = path.split('.').map(String::from).collect();
        state.lookup(&keys).and_then(|v| v.as_int()).cloned()
    }

    /// Executes `action` with `params` as `sender` and validates it against
    /// the lending action models.
    async fn validated_step(
        chain: &Arc<SimChain>,
        sender: &AccountAddress,
        action: &str,
        params: &[(&str, i64)],
    ) -> (ExecutionOutcome, Vec<protosim_core::RuleResult>) {
        let catalogue = ActionCatalogue::from_json(LENDING_ACTIONS).unwrap();
        let model = catalogue.get(action).unwrap();
        let mut p = Parameters::new();
        for (n, v) in params {
            p.push(n, Value::int(*v));
        }
        let pre = capture(chain).await;
        let receipt = chain
            .execute(call(sender, &model.contract, &model.function, params))
            .await
            .unwrap();
        let outcome = ExecutionOutcome::from(receipt);
        let post = capture(chain).await;
        let invariants = ProtocolInvariants::from_json(LENDING_INVARIANTS).unwrap();
        let validator = Validator::new()
            .with_ignored(["StableBaseCDP.redemptionQueue"])
            .with_invariants(invariants);
        let results = validator.evaluate(model, &pre, &post, &p, &outcome, sender);
        (outcome, results)
    }

    fn find<'a>(results: &'a [protosim_core::RuleResult], label: &str) -> Vec<&'a protosim_core::RuleResult> {
        results.iter().filter(|r| r.label == label).collect()
    }

    #[tokio::test]
    async fn test_deployment_resolves_references() {
        let chain = deployed(LendingConfig::default()).await;
        let contracts = chain.contracts();
        assert_eq!(contracts.len(), 2);
        let state = capture(&chain).await;
        assert_eq!(
            state.lookup(&["StableBaseCDP".into(), "oracle".into()]),
            Some(&Value::from(contracts[0].address.clone()))
        );
        assert_eq!(int(&state, "PriceOracle.price"), Some(BigInt::from(2)));
    }

    #[tokio::test]
    async fn test_open_and_borrow() {
        let chain = deployed(LendingConfig::default()).await;
        let receipt = chain
            .execute(call(&alice(), CDP_KIND, "openSafe", &[("collateral", 500)]))
            .await
            .unwrap();
        assert_eq!(receipt.outputs.get("safeId"), Some(&Value::int(1)));

        chain
            .execute(call(&alice(), CDP_KIND, "borrow", &[("safeId", 1), ("amount", 400), ("weight", 7)]))
            .await
            .unwrap();
        let state = capture(&chain).await;
        assert_eq!(int(&state, "StableBaseCDP.totalDebt"), Some(BigInt::from(400)));
        assert_eq!(int(&state, "StableBaseCDP.feesCollected"), Some(BigInt::from(2)));
        assert_eq!(
            int(&state, &format!("accounts.{}.balance", alice())),
            Some(BigInt::from(1_000 - 500 + 400 - 2))
        );
        assert_eq!(int(&state, "StableBaseCDP.safes.1.weight"), Some(BigInt::from(7)));
        assert_eq!(int(&state, "StableBaseCDP.redemptionQueue.head"), Some(BigInt::from(1)));
    }

    #[tokio::test]
    async fn test_revert_leaves_state_unchanged() {
        let chain = deployed(LendingConfig::default()).await;
        chain
            .execute(call(&alice(), CDP_KIND, "openSafe", &[("collateral", 10)]))
            .await
            .unwrap();
        let before = capture(&chain).await;

        // 10 * 2 * 100 / 150 = 13 is the most this safe can carry
        let receipt = chain
            .execute(call(&alice(), CDP_KIND, "borrow", &[("safeId", 1), ("amount", 14), ("weight", 1)]))
            .await
            .unwrap();
        assert!(matches!(receipt.status, CallStatus::Reverted { .. }));

        let receipt = chain
            .execute(call(&bob(), CDP_KIND, "borrow", &[("safeId", 1), ("amount", 1), ("weight", 1)]))
            .await
            .unwrap();
        assert!(matches!(receipt.status, CallStatus::Reverted { .. }));

        assert!(before.diff(&capture(&chain).await).is_empty());
    }

    #[tokio::test]
    async fn test_queue_stays_sorted() {
        let chain = deployed(LendingConfig::default()).await;
        for (i, weight) in [(1, 50), (2, 10), (3, 30), (4, 50)] {
            chain
                .execute(call(&alice(), CDP_KIND, "openSafe", &[("collateral", 100)]))
                .await
                .unwrap();
            chain
                .execute(call(&alice(), CDP_KIND, "borrow", &[("safeId", i), ("amount", 10), ("weight", weight)]))
                .await
                .unwrap();
        }
        chain
            .execute(call(&alice(), CDP_KIND, "repay", &[("safeId", 3), ("amount", 10)]))
            .await
            .unwrap();

        let state = capture(&chain).await;
        let queue = state
            .lookup(&["StableBaseCDP".into(), "redemptionQueue".into()])
            .unwrap();
        assert!(check_queue(queue, QueueOrder::Ascending).is_empty());
        assert_eq!(int(&state, "StableBaseCDP.redemptionQueue.head"), Some(BigInt::from(2)));
        assert_eq!(int(&state, "StableBaseCDP.redemptionQueue.tail"), Some(BigInt::from(4)));
        assert_eq!(int(&state, "StableBaseCDP.safes.3.weight"), Some(BigInt::zero()));
    }

    #[tokio::test]
    async fn test_unordered_queue_defect_detected() {
        let config = LendingConfig {
            defects: Defects { unordered_queue: true, ..Defects::default() },
            ..LendingConfig::default()
        };
        let chain = deployed(config).await;
        for (i, weight) in [(1, 50), (2, 10)] {
            chain
                .execute(call(&alice(), CDP_KIND, "openSafe", &[("collateral", 100)]))
                .await
                .unwrap();
            chain
                .execute(call(&alice(), CDP_KIND, "borrow", &[("safeId", i), ("amount", 10), ("weight", weight)]))
                .await
                .unwrap();
        }
        let state = capture(&chain).await;
        let queue = state
            .lookup(&["StableBaseCDP".into(), "redemptionQueue".into()])
            .unwrap();
        assert!(!check_queue(queue, QueueOrder::Ascending).is_empty());
    }

    #[tokio::test]
    async fn test_fail_after_and_heal() {
        let chain = deployed(LendingConfig::default()).await;
        chain.fail_after(1);
        assert!(chain
            .execute(call(&alice(), CDP_KIND, "openSafe", &[("collateral", 1)]))
            .await
            .is_ok());
        let err = chain
            .execute(call(&alice(), CDP_KIND, "openSafe", &[("collateral", 1)]))
            .await
            .unwrap_err();
        assert!(matches!(err, EnvError::Unreachable(_)));
        assert!(chain.balance(&alice()).await.is_err());
        assert!(capture_state(chain.as_ref(), &chain.providers(), &[]).await.is_err());

        chain.heal();
        assert!(chain.balance(&alice()).await.is_ok());
    }

    #[tokio::test]
    async fn test_deploy_rejects_unknown_kind() {
        let chain = SimChain::shared(LendingConfig::default());
        let descriptor =
            DeploymentDescriptor::from_json(r#"{"steps": [{"type": "contract", "contract": "Vault"}]}"#).unwrap();
        let err = chain.deploy(&descriptor).await.unwrap_err();
        assert!(matches!(err, EnvError::DeploymentError(_)));
    }

    #[tokio::test]
    async fn test_capture_is_idempotent() {
        let chain = deployed(LendingConfig::default()).await;
        chain
            .execute(call(&alice(), CDP_KIND, "openSafe", &[("collateral", 10)]))
            .await
            .unwrap();
        let a = capture(&chain).await;
        let b = capture(&chain).await;
        assert_eq!(a, b);
    }

    // =========================================================================
    // Validation against the lending action models
    // =========================================================================

    #[tokio::test]
    async fn test_open_safe_passes_validation() {
        let chain = deployed(LendingConfig::default()).await;
        let (outcome, results) = validated_step(&chain, &alice(), "openSafe", &[("collateral", 40)]).await;
        assert!(outcome.is_success());
        assert!(results.iter().all(|r| !r.is_violation() && !r.is_authoring_error()), "{:#?}", results);
        assert_eq!(find(&results, "closed-world")[0].status, RuleStatus::Satisfied);
    }

    #[tokio::test]
    async fn test_borrow_branches_are_exclusive() {
        let chain = deployed(LendingConfig::default()).await;
        for _ in 0..2 {
            chain
                .execute(call(&alice(), CDP_KIND, "openSafe", &[("collateral", 100)]))
                .await
                .unwrap();
        }

        // first borrow into an empty queue, first borrow into a non-empty
        // queue, then a subsequent borrow
        let steps = [
            [("safeId", 1), ("amount", 10), ("weight", 5)],
            [("safeId", 2), ("amount", 10), ("weight", 3)],
            [("safeId", 1), ("amount", 10), ("weight", 9)],
        ];
        for params in steps {
            let (outcome, results) = validated_step(&chain, &alice(), "borrow", &params).await;
            assert!(outcome.is_success());

            let branches: Vec<_> = results
                .iter()
                .filter(|r| r.kind == RuleKind::StateUpdate && r.label == "Safe: StableBaseCDP.safes[params.safeId].weight")
                .collect();
            assert_eq!(branches.len(), 2, "{:#?}", results);
            assert!(branches.iter().all(|r| r.status == RuleStatus::Inapplicable));

            let label = format!("Safe: StableBaseCDP.safes[{}].weight", params[0].1);
            let applied = find(&results, &label);
            assert_eq!(applied.len(), 1);
            assert_eq!(applied[0].status, RuleStatus::Satisfied);
            assert!(results.iter().all(|r| !r.is_violation() && !r.is_authoring_error()), "{:#?}", results);
        }

        // the subsequent borrow keeps the first weight
        let state = capture(&chain).await;
        assert_eq!(int(&state, "StableBaseCDP.safes.1.weight"), Some(BigInt::from(5)));
    }

    #[tokio::test]
    async fn test_deltas_are_additive() {
        let chain = deployed(LendingConfig::default()).await;
        chain
            .execute(call(&alice(), CDP_KIND, "openSafe", &[("collateral", 500)]))
            .await
            .unwrap();
        for amount in [40, 60] {
            let (_, results) =
                validated_step(&chain, &alice(), "borrow", &[("safeId", 1), ("amount", amount), ("weight", 2)]).await;
            assert_eq!(find(&results, "Protocol: StableBaseCDP.totalDebt")[0].status, RuleStatus::Satisfied);
        }
        let state = capture(&chain).await;
        assert_eq!(int(&state, "StableBaseCDP.totalDebt"), Some(BigInt::from(100)));
    }

    #[tokio::test]
    async fn test_mode_transition_boundary() {
        // threshold is 2000: borrowing up to 1999 stays in bootstrap,
        // reaching 2000 exactly switches to normal
        let chain = deployed(LendingConfig::default()).await;
        chain
            .execute(call(&alice(), CDP_KIND, "openSafe", &[("collateral", 1000)]))
            .await
            .unwrap();
        chain
            .execute(call(&bob(), ORACLE_KIND, "setPrice", &[("price", 5)]))
            .await
            .unwrap();
        let mode_label = "Protocol: StableBaseCDP.mode";

        let (_, results) =
            validated_step(&chain, &alice(), "borrow", &[("safeId", 1), ("amount", 1999), ("weight", 1)]).await;
        assert!(results.iter().all(|r| !r.is_violation()), "{:#?}", results);
        assert_eq!(find(&results, mode_label)[0].status, RuleStatus::Inapplicable);

        let (_, results) =
            validated_step(&chain, &alice(), "borrow", &[("safeId", 1), ("amount", 1), ("weight", 1)]).await;
        assert!(results.iter().all(|r| !r.is_violation()), "{:#?}", results);
        assert_eq!(find(&results, mode_label)[0].status, RuleStatus::Satisfied);

        let state = capture(&chain).await;
        assert_eq!(
            state.lookup(&["StableBaseCDP".into(), "mode".into()]),
            Some(&Value::text("NORMAL"))
        );
    }

    #[tokio::test]
    async fn test_frozen_mode_defect_flagged() {
        let config = LendingConfig {
            defects: Defects { frozen_mode: true, ..Defects::default() },
            ..LendingConfig::default()
        };
        let chain = deployed(config).await;
        chain
            .execute(call(&alice(), CDP_KIND, "openSafe", &[("collateral", 1000)]))
            .await
            .unwrap();
        chain
            .execute(call(&bob(), ORACLE_KIND, "setPrice", &[("price", 5)]))
            .await
            .unwrap();
        let (_, results) =
            validated_step(&chain, &alice(), "borrow", &[("safeId", 1), ("amount", 2000), ("weight", 1)]).await;
        let mode = find(&results, "Protocol: StableBaseCDP.mode");
        assert_eq!(mode[0].status, RuleStatus::Violated);
    }

    #[tokio::test]
    async fn test_skipped_debt_defect_flagged() {
        let config = LendingConfig {
            defects: Defects { skip_total_debt: true, ..Defects::default() },
            ..LendingConfig::default()
        };
        let chain = deployed(config).await;
        chain
            .execute(call(&alice(), CDP_KIND, "openSafe", &[("collateral", 100)]))
            .await
            .unwrap();
        let (_, results) =
            validated_step(&chain, &alice(), "borrow", &[("safeId", 1), ("amount", 10), ("weight", 1)]).await;
        assert_eq!(
            find(&results, "Protocol: StableBaseCDP.totalDebt")[0].status,
            RuleStatus::Violated
        );
        assert_eq!(find(&results, "Debt #1")[0].status, RuleStatus::Violated);
    }

    #[tokio::test]
    async fn test_reverted_borrow_is_inapplicable() {
        let chain = deployed(LendingConfig::default()).await;
        chain
            .execute(call(&alice(), CDP_KIND, "openSafe", &[("collateral", 10)]))
            .await
            .unwrap();
        let (outcome, results) =
            validated_step(&chain, &alice(), "borrow", &[("safeId", 1), ("amount", 500), ("weight", 1)]).await;
        assert!(outcome.is_reverted());
        assert!(results
            .iter()
            .filter(|r| r.kind == RuleKind::StateUpdate || r.kind == RuleKind::ValidationRule)
            .all(|r| r.status == RuleStatus::Inapplicable));
        assert!(results.iter().all(|r| !r.is_violation()));
    }

    #[tokio::test]
    async fn test_full_repay_validates() {
        let chain = deployed(LendingConfig::default()).await;
        chain
            .execute(call(&alice(), CDP_KIND, "openSafe", &[("collateral", 100)]))
            .await
            .unwrap();
        chain
            .execute(call(&alice(), CDP_KIND, "borrow", &[("safeId", 1), ("amount", 20), ("weight", 4)]))
            .await
            .unwrap();
        let (outcome, results) =
            validated_step(&chain, &alice(), "repay", &[("safeId", 1), ("amount", 20)]).await;
        assert!(outcome.is_success());
        assert!(results.iter().all(|r| !r.is_violation() && !r.is_authoring_error()), "{:#?}", results);
    }
}
