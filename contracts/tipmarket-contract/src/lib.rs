#![no_std]
#![allow(clippy::too_many_arguments)]


use soroban_sdk::{
    contract, contracterror, contractevent, contractimpl, contracttype, token, Address, Env,
    IntoVal, String, Symbol, Vec,
};

// ═══════════════════════════════════════════════════════════════════════════
// ENGINE INVARIANTS
// ═══════════════════════════════════════════════════════════════════════════
//
// INV-1: token balance held by the contract = Σ(Balance) + Σ(LockedFunds.amount)
//        + escrowed stakes and fees of unsettled assignments and unclaimed
//        earnings/refunds
// INV-2: Prediction.state transitions: Pending → {Withdrawn | Rejected | Active},
//        Active → {Won | Lost}, never reversed
// INV-3: PredictionStats.validator_count ≤ MAX_VALIDATORS; once equal the
//        prediction is absent from the mining pool
// INV-4: upvote_count + downvote_count ≤ validator_count, and at most one side
//        of either vote phase reaches the majority threshold
// INV-5: Validation.settled and Purchase.refunded are write-once
// INV-6: used_free_quota counts outstanding free predictions only; released
//        when a free prediction is withdrawn, rejected or concluded
//
// ═══════════════════════════════════════════════════════════════════════════

const DAY_IN_LEDGERS: u32 = 17280;
const BUMP_THRESHOLD: u32 = 14 * DAY_IN_LEDGERS;
const BUMP_AMOUNT: u32 = 30 * DAY_IN_LEDGERS;

/// Fixed validator cohort size per prediction.
const MAX_VALIDATORS: u32 = 5;
/// Votes needed to carry either phase: 60% of the full cohort, rounded up.
const MAJORITY: u32 = (MAX_VALIDATORS * 60).div_ceil(100);

/// Earliest allowed `start_time`, measured from creation (8 hours).
const MIN_START_LEAD: u64 = 28800;
/// Latest allowed `start_time`, measured from creation (24 hours).
const MAX_START_LEAD: u64 = 86400;
/// Maximum event window `end_time - start_time` (48 hours).
const MAX_EVENT_SPAN: u64 = 172800;

/// Quarantine after creation during which no validator may be assigned (4 hours).
const MINING_QUARANTINE: u64 = 14400;
/// Minimum remaining lead to `start_time` for a new assignment (2 hours).
const ASSIGNMENT_LEAD: u64 = 7200;

/// Closing votes open this long after `end_time` (2 hours).
const CLOSING_OPENS_AFTER: u64 = 7200;
/// Closing votes close this long after `end_time` (6 hours).
const CLOSING_CLOSES_AFTER: u64 = 21600;
/// Settlement cool-down after the closing majority is reached (5 hours).
const SETTLEMENT_COOLDOWN: u64 = 18000;

/// Rolling lock applied to a minority validator's stake (30 days).
const STAKE_LOCK_PERIOD: u64 = 2592000;

/// Capacity of a seller's recent-conclusions ring.
const RECENT_PREDICTIONS: u32 = 10;

/// Odds are scaled by 100; anything at or below 1.00x is meaningless.
const MIN_ODD: u32 = 100;

const VOTE_UP: u32 = 1;
const VOTE_DOWN: u32 = 2;
const VOTE_WON: u32 = 1;
const VOTE_LOST: u32 = 2;

#[contracterror]
#[derive(Copy, Clone, Debug, PartialEq)]
pub enum TipMarketError {
    // Authorization
    Unauthorized = 10,
    OnlySeller = 11,
    NotSlotOwner = 12,
    NotMiner = 13,
    NotCredentialOwner = 14,
    ContractLocked = 15,
    // Timing
    TimeRequirementsNotMet = 20,
    EndBeforeStart = 21,
    EventAlreadyStarted = 22,
    NotAvailableForMining = 23,
    ClosingVoteTooEarly = 24,
    ClosingWindowExpired = 25,
    NotCooledDownYet = 26,
    AssetsFrozen = 27,
    // State
    MiningPoolEmpty = 30,
    MiningPoolDrained = 31,
    NotAssigned = 32,
    PredictionInactive = 33,
    PredictionNotConcluded = 34,
    NotAnActivePrediction = 35,
    PredictionAlreadyMined = 36,
    PredictionAlreadyWithdrawn = 37,
    PredictionNotRejected = 38,
    PredictionWon = 39,
    PredictionLost = 40,
    // Funds
    InsufficientBalance = 50,
    PriceRequired = 51,
    // Duplicates & validation
    InvalidVoteOption = 60,
    OpeningVoteAlreadyCast = 61,
    ClosingVoteAlreadyCast = 62,
    MinerAlreadySettled = 63,
    StakingFeeAlreadyRefunded = 64,
    AlreadyPurchased = 65,
    NoPurchaseRecord = 66,
    AlreadyRefunded = 67,
    EarningsAlreadyWithdrawn = 68,
    FreeQuotaUsedUp = 69,
    InvalidOdd = 70,
}

#[contracttype]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PredictionState {
    Pending = 0,
    Withdrawn = 1,
    Rejected = 2,
    Active = 3,
    Won = 4,
    Lost = 5,
}

#[contracttype]
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Config {
    pub owner: Address,
    pub nominated_owner: Option<Address>,
    /// External validator-credential contract (`owner_of` / `transfer`).
    pub credential: Address,
    /// Token all fees, stakes and purchases are denominated in.
    pub token: Address,
    pub mining_fee: i128,
    pub miner_staking_fee: i128,
    pub miner_percentage: u32,
    pub free_tips_quota: u32,
    /// Settled predictions a seller needs before the paid tier is forced.
    pub paid_history_threshold: u32,
}

#[contracttype]
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Prediction {
    pub seller: Address,
    pub ipfs_hash: String,
    /// Decryption credential released to paying buyers and validators.
    pub key: String,
    pub created_at: u64,
    pub start_time: u64,
    pub end_time: u64,
    /// Scaled by 100, so 200 reads as 2.00x.
    pub odd: u32,
    /// Zero while the prediction rides the free quota.
    pub price: i128,
    pub state: PredictionState,
    pub winning_opening_vote: u32,
    pub winning_closing_vote: u32,
    pub withdrawn_earnings: bool,
    /// Stamped when either closing tally first reaches the majority.
    pub closing_majority_at: u64,
}

/// Hot-path counters, kept apart from the prediction record itself.
#[contracttype]
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct PredictionStats {
    pub validator_count: u32,
    pub upvote_count: u32,
    pub downvote_count: u32,
    pub won_vote_count: u32,
    pub lost_vote_count: u32,
    pub buy_count: u32,
}

/// One validator slot on one prediction. Slot indices follow assignment
/// order (1..=MAX_VALIDATORS); existence of the record means assigned.
#[contracttype]
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Validation {
    pub miner: Address,
    pub token_id: u64,
    pub opening: u32,
    pub closing: u32,
    pub settled: bool,
}

/// Entry in a miner's reverse index of live assignments.
#[contracttype]
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct OwnedValidation {
    pub id: u64,
    pub slot: u32,
    pub token_id: u64,
    pub key: String,
}

#[contracttype]
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct UserProfile {
    pub profile: String,
    pub key: String,
    pub won_count: u32,
    pub lost_count: u32,
    pub total_predictions: u32,
    /// Ring of the most recently concluded prediction ids.
    pub recent: Vec<u64>,
}

/// Forfeited-but-not-burned stake, held under a rolling time lock.
#[contracttype]
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct LockedFunds {
    pub amount: i128,
    pub release_date: u64,
    pub last_push_date: u64,
    pub total_instances: u32,
}

#[contracttype]
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Purchase {
    pub purchased: bool,
    pub key: String,
    pub refunded: bool,
}

#[contracttype]
#[derive(Clone)]
pub enum DataKey {
    Config,
    Locked,
    PredictionCounter,
    UsedFreeQuota,
    Prediction(u64),
    Stats(u64),
    Validation(u64, u32),
    MiningPool,
    MiningPoolPos(u64),
    ActivePool,
    ActivePoolPos(u64),
    Balance(Address),
    LockedFunds(Address),
    User(Address),
    /// Miner a held credential token belongs to while in custody.
    TokenCustodian(u64),
    OwnedPredictions(Address),
    OwnedPredictionPos(Address, u64),
    OwnedValidations(Address),
    OwnedValidationPos(Address, u64, u32),
    Purchase(Address, u64),
    BoughtPredictions(Address),
}

// ── Events ───────────────────────────────────────────────────────────────────

#[contractevent(topics = ["init"])]
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct InitEvent {
    pub owner: Address,
    pub credential: Address,
    pub token: Address,
}

#[contractevent(topics = ["variables_update"])]
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct VariablesUpdateEvent {
    pub mining_fee: i128,
    pub miner_staking_fee: i128,
    pub miner_percentage: u32,
}

#[contractevent(topics = ["free_quota_update"])]
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct FreeQuotaUpdateEvent {
    pub quota: u32,
}

#[contractevent(topics = ["lock"])]
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct LockEvent {
    pub owner: Address,
}

#[contractevent(topics = ["unlock"])]
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct UnlockEvent {
    pub owner: Address,
}

#[contractevent(topics = ["owner_nominated"])]
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct OwnerNominatedEvent {
    pub nominee: Address,
}

#[contractevent(topics = ["ownership_transferred"])]
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct OwnershipTransferredEvent {
    pub owner: Address,
}

#[contractevent(topics = ["prediction_created"])]
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct PredictionCreatedEvent {
    pub id: u64,
    pub seller: Address,
    pub start_time: u64,
    pub end_time: u64,
    pub odd: u32,
    pub price: i128,
}

#[contractevent(topics = ["prediction_updated"])]
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct PredictionUpdatedEvent {
    pub id: u64,
}

#[contractevent(topics = ["prediction_withdrawn"])]
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct PredictionWithdrawnEvent {
    pub id: u64,
    pub seller: Address,
}

#[contractevent(topics = ["validation_assigned"])]
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ValidationAssignedEvent {
    pub id: u64,
    pub slot: u32,
    pub miner: Address,
    pub token_id: u64,
}

#[contractevent(topics = ["opening_vote"])]
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct OpeningVoteEvent {
    pub id: u64,
    pub slot: u32,
    pub vote: u32,
}

#[contractevent(topics = ["prediction_activated"])]
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct PredictionActivatedEvent {
    pub id: u64,
}

#[contractevent(topics = ["prediction_rejected"])]
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct PredictionRejectedEvent {
    pub id: u64,
}

#[contractevent(topics = ["closing_vote"])]
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ClosingVoteEvent {
    pub id: u64,
    pub slot: u32,
    pub vote: u32,
}

#[contractevent(topics = ["prediction_concluded"])]
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct PredictionConcludedEvent {
    pub id: u64,
    pub outcome: u32,
    pub timestamp: u64,
}

#[contractevent(topics = ["prediction_purchased"])]
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct PredictionPurchasedEvent {
    pub id: u64,
    pub buyer: Address,
}

#[contractevent(topics = ["buyer_refunded"])]
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct BuyerRefundedEvent {
    pub id: u64,
    pub buyer: Address,
    pub amount: i128,
}

#[contractevent(topics = ["miner_settled"])]
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct MinerSettledEvent {
    pub id: u64,
    pub slot: u32,
    pub miner: Address,
    pub agreed: bool,
}

#[contractevent(topics = ["seller_settled"])]
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SellerSettledEvent {
    pub id: u64,
    pub seller: Address,
    pub amount: i128,
}

#[contractevent(topics = ["stake_locked"])]
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct StakeLockedEvent {
    pub miner: Address,
    pub amount: i128,
    pub release_date: u64,
    pub total_instances: u32,
}

#[contractevent(topics = ["locked_funds_transfer"])]
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct LockedFundsTransferEvent {
    pub account: Address,
    pub amount: i128,
}

#[contractevent(topics = ["deposit"])]
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct DepositEvent {
    pub account: Address,
    pub amount: i128,
}

#[contractevent(topics = ["withdrawal"])]
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct WithdrawalEvent {
    pub account: Address,
    pub amount: i128,
}

#[contractevent(topics = ["profile_update"])]
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ProfileUpdateEvent {
    pub account: Address,
}

// ─────────────────────────────────────────────────────────────────────────────

#[contract]
pub struct TipMarketContract;

#[contractimpl]
impl TipMarketContract {
    // ── Storage plumbing ──────────────────────────────────────────────────────

    fn extend_instance(env: &Env) {
        env.storage()
            .instance()
            .extend_ttl(BUMP_THRESHOLD, BUMP_AMOUNT);
    }

    fn extend_persistent(env: &Env, key: &DataKey) {
        env.storage()
            .persistent()
            .extend_ttl(key, BUMP_THRESHOLD, BUMP_AMOUNT);
    }

    fn read_config(env: &Env) -> Config {
        let config = env
            .storage()
            .instance()
            .get(&DataKey::Config)
            .expect("Config not set");
        Self::extend_instance(env);
        config
    }

    fn set_config(env: &Env, config: &Config) {
        env.storage().instance().set(&DataKey::Config, config);
        Self::extend_instance(env);
    }

    fn require_owner(env: &Env, caller: &Address) -> Result<Config, TipMarketError> {
        caller.require_auth();
        let config = Self::read_config(env);
        if config.owner != *caller {
            return Err(TipMarketError::Unauthorized);
        }
        Ok(config)
    }

    fn require_unlocked(env: &Env) -> Result<(), TipMarketError> {
        let locked: bool = env
            .storage()
            .instance()
            .get(&DataKey::Locked)
            .unwrap_or(false);
        if locked {
            return Err(TipMarketError::ContractLocked);
        }
        Ok(())
    }

    fn load_prediction(env: &Env, id: u64) -> Prediction {
        let key = DataKey::Prediction(id);
        let prediction = env
            .storage()
            .persistent()
            .get(&key)
            .expect("Prediction not found");
        Self::extend_persistent(env, &key);
        prediction
    }

    fn store_prediction(env: &Env, id: u64, prediction: &Prediction) {
        let key = DataKey::Prediction(id);
        env.storage().persistent().set(&key, prediction);
        Self::extend_persistent(env, &key);
    }

    fn load_stats(env: &Env, id: u64) -> PredictionStats {
        env.storage()
            .persistent()
            .get(&DataKey::Stats(id))
            .unwrap_or_default()
    }

    fn store_stats(env: &Env, id: u64, stats: &PredictionStats) {
        let key = DataKey::Stats(id);
        env.storage().persistent().set(&key, stats);
        Self::extend_persistent(env, &key);
    }

    fn load_user(env: &Env, account: &Address) -> UserProfile {
        env.storage()
            .persistent()
            .get(&DataKey::User(account.clone()))
            .unwrap_or_else(|| UserProfile {
                profile: String::from_str(env, ""),
                key: String::from_str(env, ""),
                won_count: 0,
                lost_count: 0,
                total_predictions: 0,
                recent: Vec::new(env),
            })
    }

    fn store_user(env: &Env, account: &Address, user: &UserProfile) {
        let key = DataKey::User(account.clone());
        env.storage().persistent().set(&key, user);
        Self::extend_persistent(env, &key);
    }

    // ── Index arrays with O(1) swap-remove ────────────────────────────────────
    //
    // Every id list carries a back-pointer entry per member (id → position) so
    // removal never scans. Position only encodes rotation order.

    fn id_list(env: &Env, list_key: &DataKey) -> Vec<u64> {
        env.storage()
            .persistent()
            .get(list_key)
            .unwrap_or_else(|| Vec::new(env))
    }

    fn id_list_push(env: &Env, list_key: &DataKey, pos_key: &DataKey, id: u64) {
        let mut list = Self::id_list(env, list_key);
        list.push_back(id);
        env.storage().persistent().set(pos_key, &(list.len() - 1));
        env.storage().persistent().set(list_key, &list);
        Self::extend_persistent(env, list_key);
    }

    fn id_list_remove<F: Fn(u64) -> DataKey>(env: &Env, list_key: &DataKey, pos_of: F, id: u64) {
        let pos_key = pos_of(id);
        let pos: u32 = match env.storage().persistent().get(&pos_key) {
            Some(pos) => pos,
            None => return,
        };
        let mut list = Self::id_list(env, list_key);
        let last = list.len() - 1;
        if pos != last {
            let moved = list.get(last).expect("index out of sync");
            list.set(pos, moved);
            env.storage().persistent().set(&pos_of(moved), &pos);
        }
        list.pop_back();
        env.storage().persistent().remove(&pos_key);
        env.storage().persistent().set(list_key, &list);
        Self::extend_persistent(env, list_key);
    }

    fn owned_validation_list(env: &Env, miner: &Address) -> Vec<OwnedValidation> {
        env.storage()
            .persistent()
            .get(&DataKey::OwnedValidations(miner.clone()))
            .unwrap_or_else(|| Vec::new(env))
    }

    fn owned_validation_push(env: &Env, miner: &Address, entry: OwnedValidation) {
        let list_key = DataKey::OwnedValidations(miner.clone());
        let pos_key = DataKey::OwnedValidationPos(miner.clone(), entry.id, entry.slot);
        let mut list = Self::owned_validation_list(env, miner);
        list.push_back(entry);
        env.storage().persistent().set(&pos_key, &(list.len() - 1));
        env.storage().persistent().set(&list_key, &list);
        Self::extend_persistent(env, &list_key);
    }

    fn owned_validation_remove(env: &Env, miner: &Address, id: u64, slot: u32) {
        let list_key = DataKey::OwnedValidations(miner.clone());
        let pos_key = DataKey::OwnedValidationPos(miner.clone(), id, slot);
        let pos: u32 = match env.storage().persistent().get(&pos_key) {
            Some(pos) => pos,
            None => return,
        };
        let mut list = Self::owned_validation_list(env, miner);
        let last = list.len() - 1;
        if pos != last {
            let moved = list.get(last).expect("index out of sync");
            env.storage().persistent().set(
                &DataKey::OwnedValidationPos(miner.clone(), moved.id, moved.slot),
                &pos,
            );
            list.set(pos, moved);
        }
        list.pop_back();
        env.storage().persistent().remove(&pos_key);
        env.storage().persistent().set(&list_key, &list);
        Self::extend_persistent(env, &list_key);
    }

    // ── Balance vault ─────────────────────────────────────────────────────────

    fn balance_of(env: &Env, account: &Address) -> i128 {
        env.storage()
            .persistent()
            .get(&DataKey::Balance(account.clone()))
            .unwrap_or(0)
    }

    fn credit(env: &Env, account: &Address, amount: i128) {
        if amount <= 0 {
            return;
        }
        let key = DataKey::Balance(account.clone());
        let balance = Self::balance_of(env, account);
        env.storage()
            .persistent()
            .set(&key, &(balance.checked_add(amount).expect("balance overflow")));
        Self::extend_persistent(env, &key);
    }

    fn debit(env: &Env, account: &Address, amount: i128) -> Result<(), TipMarketError> {
        let balance = Self::balance_of(env, account);
        if balance < amount {
            return Err(TipMarketError::InsufficientBalance);
        }
        let key = DataKey::Balance(account.clone());
        env.storage().persistent().set(&key, &(balance - amount));
        Self::extend_persistent(env, &key);
        Ok(())
    }

    /// Collect `fee` from a payable call carrying `payment` tokens: any excess
    /// is credited to the caller's Balance, any shortfall is drawn from it.
    /// Internal bookkeeping settles before the token is pulled in.
    fn collect_fee(
        env: &Env,
        config: &Config,
        from: &Address,
        fee: i128,
        payment: i128,
    ) -> Result<(), TipMarketError> {
        assert!(payment >= 0, "payment must be non-negative");
        if payment < fee {
            Self::debit(env, from, fee - payment)?;
        } else if payment > fee {
            Self::credit(env, from, payment - fee);
        }
        if payment > 0 {
            let client = token::Client::new(env, &config.token);
            client.transfer(from, &env.current_contract_address(), &payment);
        }
        Ok(())
    }

    /// Move a minority validator's stake under the rolling 30-day lock.
    /// A fresh lock starts a new 30-day clock; piling onto a live lock
    /// extends the clock by another 30 days instead.
    fn lock_stake(env: &Env, account: &Address, amount: i128, now: u64) {
        let key = DataKey::LockedFunds(account.clone());
        let mut locked: LockedFunds =
            env.storage().persistent().get(&key).unwrap_or(LockedFunds {
                amount: 0,
                release_date: 0,
                last_push_date: 0,
                total_instances: 0,
            });
        if locked.amount > 0 && now < locked.release_date {
            locked.release_date += STAKE_LOCK_PERIOD;
            locked.total_instances += 1;
        } else {
            locked.release_date = now + STAKE_LOCK_PERIOD;
            locked.total_instances = 1;
        }
        locked.amount = locked
            .amount
            .checked_add(amount)
            .expect("locked funds overflow");
        locked.last_push_date = now;
        env.storage().persistent().set(&key, &locked);
        Self::extend_persistent(env, &key);

        StakeLockedEvent {
            miner: account.clone(),
            amount,
            release_date: locked.release_date,
            total_instances: locked.total_instances,
        }
        .publish(env);
    }

    // ── Credential gateway ────────────────────────────────────────────────────

    fn credential_owner(env: &Env, credential: &Address, token_id: u64) -> Address {
        env.invoke_contract(
            credential,
            &Symbol::new(env, "owner_of"),
            soroban_sdk::vec![env, token_id.into_val(env)],
        )
    }

    fn credential_transfer(
        env: &Env,
        credential: &Address,
        from: &Address,
        to: &Address,
        token_id: u64,
    ) {
        let _: () = env.invoke_contract(
            credential,
            &Symbol::new(env, "transfer"),
            soroban_sdk::vec![
                env,
                from.into_val(env),
                to.into_val(env),
                token_id.into_val(env)
            ],
        );
    }

    /// Return a held credential to its custodian. No-op when custody has
    /// already been released.
    fn release_custody(env: &Env, config: &Config, token_id: u64, miner: &Address) {
        let key = DataKey::TokenCustodian(token_id);
        let custodian: Option<Address> = env.storage().persistent().get(&key);
        if custodian.as_ref() == Some(miner) {
            env.storage().persistent().remove(&key);
            Self::credential_transfer(
                env,
                &config.credential,
                &env.current_contract_address(),
                miner,
                token_id,
            );
        }
    }

    // ── Free quota & pricing policy ───────────────────────────────────────────

    fn used_free_quota_count(env: &Env) -> u32 {
        env.storage()
            .instance()
            .get(&DataKey::UsedFreeQuota)
            .unwrap_or(0)
    }

    fn release_free_slot(env: &Env, prediction: &Prediction) {
        if prediction.price != 0 {
            return;
        }
        let used = Self::used_free_quota_count(env);
        env.storage()
            .instance()
            .set(&DataKey::UsedFreeQuota, &used.saturating_sub(1));
        Self::extend_instance(env);
    }

    /// Sellers with a profitable settled history must price their predictions;
    /// everyone else draws a slot from the global outstanding-free quota.
    fn apply_pricing_policy(
        env: &Env,
        config: &Config,
        seller: &Address,
        price: i128,
    ) -> Result<i128, TipMarketError> {
        let user = Self::load_user(env, seller);
        let verified = user.won_count > user.lost_count
            && user.total_predictions >= config.paid_history_threshold;
        if verified {
            if price <= 0 {
                return Err(TipMarketError::PriceRequired);
            }
            return Ok(price);
        }
        let used = Self::used_free_quota_count(env);
        if used >= config.free_tips_quota {
            return Err(TipMarketError::FreeQuotaUsedUp);
        }
        env.storage()
            .instance()
            .set(&DataKey::UsedFreeQuota, &(used + 1));
        Self::extend_instance(env);
        Ok(0)
    }

    fn check_schedule(now: u64, start_time: u64, end_time: u64) -> Result<(), TipMarketError> {
        if end_time <= start_time {
            return Err(TipMarketError::EndBeforeStart);
        }
        if start_time < now + MIN_START_LEAD || start_time > now + MAX_START_LEAD {
            return Err(TipMarketError::TimeRequirementsNotMet);
        }
        if end_time - start_time > MAX_EVENT_SPAN {
            return Err(TipMarketError::TimeRequirementsNotMet);
        }
        Ok(())
    }

    /// Per-validator share of the pooled buyer revenue on a Won prediction.
    fn miner_cut(stats: &PredictionStats, prediction: &Prediction, percentage: u32) -> i128 {
        (stats.buy_count as i128)
            .checked_mul(prediction.price)
            .expect("overflow in miner cut")
            .checked_mul(percentage as i128)
            .expect("overflow in miner cut")
            / 100
    }

    // ── Conclusion ────────────────────────────────────────────────────────────

    /// Flip a majority-complete Active prediction to Won/Lost. Runs exactly
    /// once, inline with the first settlement call, and owns every side
    /// effect of conclusion: active-pool removal, seller aggregates, the
    /// recent ring, owned-index cleanup for losses and the free-quota slot.
    fn conclude(env: &Env, id: u64, prediction: &mut Prediction, stats: &PredictionStats) {
        let won = stats.won_vote_count >= MAJORITY;
        prediction.winning_closing_vote = if won { VOTE_WON } else { VOTE_LOST };
        prediction.state = if won {
            PredictionState::Won
        } else {
            PredictionState::Lost
        };

        Self::id_list_remove(env, &DataKey::ActivePool, DataKey::ActivePoolPos, id);

        let seller = prediction.seller.clone();
        let mut user = Self::load_user(env, &seller);
        if won {
            user.won_count += 1;
        } else {
            user.lost_count += 1;
        }
        user.total_predictions += 1;
        if user.recent.len() >= RECENT_PREDICTIONS {
            user.recent.remove(0);
        }
        user.recent.push_back(id);
        Self::store_user(env, &seller, &user);

        if !won {
            Self::id_list_remove(
                env,
                &DataKey::OwnedPredictions(seller.clone()),
                |pid| DataKey::OwnedPredictionPos(seller.clone(), pid),
                id,
            );
        }

        Self::release_free_slot(env, prediction);

        PredictionConcludedEvent {
            id,
            outcome: prediction.winning_closing_vote,
            timestamp: env.ledger().timestamp(),
        }
        .publish(env);
    }

    // ── Setup & administration ────────────────────────────────────────────────

    /// Initialize the contract. Idempotent, safe to call multiple times.
    pub fn init(env: Env, owner: Address, credential: Address, token: Address) {
        if !env.storage().instance().has(&DataKey::Config) {
            let config = Config {
                owner: owner.clone(),
                nominated_owner: None,
                credential: credential.clone(),
                token: token.clone(),
                mining_fee: 0,
                miner_staking_fee: 0,
                miner_percentage: 0,
                free_tips_quota: 0,
                paid_history_threshold: 10,
            };
            Self::set_config(&env, &config);
            env.storage()
                .instance()
                .set(&DataKey::PredictionCounter, &0u64);
            Self::extend_instance(&env);

            InitEvent {
                owner,
                credential,
                token,
            }
            .publish(&env);
        }
    }

    /// Set the fee economics. Owner only.
    pub fn set_variables(
        env: Env,
        owner: Address,
        mining_fee: i128,
        miner_staking_fee: i128,
        miner_percentage: u32,
    ) -> Result<(), TipMarketError> {
        let mut config = Self::require_owner(&env, &owner)?;
        assert!(miner_percentage <= 100, "percentage exceeds 100");
        config.mining_fee = mining_fee;
        config.miner_staking_fee = miner_staking_fee;
        config.miner_percentage = miner_percentage;
        Self::set_config(&env, &config);

        VariablesUpdateEvent {
            mining_fee,
            miner_staking_fee,
            miner_percentage,
        }
        .publish(&env);
        Ok(())
    }

    /// Set how many free predictions may be outstanding at once. Owner only.
    pub fn set_free_tips_quota(env: Env, owner: Address, quota: u32) -> Result<(), TipMarketError> {
        let mut config = Self::require_owner(&env, &owner)?;
        config.free_tips_quota = quota;
        Self::set_config(&env, &config);

        FreeQuotaUpdateEvent { quota }.publish(&env);
        Ok(())
    }

    /// Set the settled-history size beyond which profitable sellers must
    /// charge. Owner only.
    pub fn set_paid_history_threshold(
        env: Env,
        owner: Address,
        threshold: u32,
    ) -> Result<(), TipMarketError> {
        let mut config = Self::require_owner(&env, &owner)?;
        config.paid_history_threshold = threshold;
        Self::set_config(&env, &config);
        Ok(())
    }

    /// Point the engine at the validator-credential contract. Owner only.
    pub fn set_credential_address(
        env: Env,
        owner: Address,
        credential: Address,
    ) -> Result<(), TipMarketError> {
        let mut config = Self::require_owner(&env, &owner)?;
        config.credential = credential;
        Self::set_config(&env, &config);
        Ok(())
    }

    /// Kill-switch: abort every mutating entry point. Owner only.
    pub fn lock(env: Env, owner: Address) -> Result<(), TipMarketError> {
        Self::require_owner(&env, &owner)?;
        env.storage().instance().set(&DataKey::Locked, &true);
        Self::extend_instance(&env);
        LockEvent { owner }.publish(&env);
        Ok(())
    }

    pub fn unlock(env: Env, owner: Address) -> Result<(), TipMarketError> {
        Self::require_owner(&env, &owner)?;
        env.storage().instance().set(&DataKey::Locked, &false);
        Self::extend_instance(&env);
        UnlockEvent { owner }.publish(&env);
        Ok(())
    }

    pub fn nominate_new_owner(
        env: Env,
        owner: Address,
        nominee: Address,
    ) -> Result<(), TipMarketError> {
        let mut config = Self::require_owner(&env, &owner)?;
        config.nominated_owner = Some(nominee.clone());
        Self::set_config(&env, &config);
        OwnerNominatedEvent { nominee }.publish(&env);
        Ok(())
    }

    /// Nominated owner claims ownership.
    pub fn transfer_ownership(env: Env, caller: Address) -> Result<(), TipMarketError> {
        caller.require_auth();
        let mut config = Self::read_config(&env);
        if config.nominated_owner != Some(caller.clone()) {
            return Err(TipMarketError::Unauthorized);
        }
        config.owner = caller.clone();
        config.nominated_owner = None;
        Self::set_config(&env, &config);
        OwnershipTransferredEvent { owner: caller }.publish(&env);
        Ok(())
    }

    // ── Funds ─────────────────────────────────────────────────────────────────

    /// Credit tokens to the caller's withdrawable balance.
    pub fn deposit(env: Env, account: Address, amount: i128) {
        account.require_auth();
        assert!(amount > 0, "amount must be positive");
        Self::credit(&env, &account, amount);
        let config = Self::read_config(&env);
        let client = token::Client::new(&env, &config.token);
        client.transfer(&account, &env.current_contract_address(), &amount);

        DepositEvent { account, amount }.publish(&env);
    }

    /// Withdraw from the caller's balance back to their token account.
    pub fn withdraw_funds(env: Env, account: Address, amount: i128) -> Result<(), TipMarketError> {
        account.require_auth();
        assert!(amount > 0, "amount must be positive");
        Self::debit(&env, &account, amount)?;
        let config = Self::read_config(&env);
        let client = token::Client::new(&env, &config.token);
        client.transfer(&env.current_contract_address(), &account, &amount);

        WithdrawalEvent { account, amount }.publish(&env);
        Ok(())
    }

    /// Move released locked funds back into the withdrawable balance.
    pub fn transfer_locked_funds(
        env: Env,
        account: Address,
        amount: i128,
    ) -> Result<(), TipMarketError> {
        Self::require_unlocked(&env)?;
        account.require_auth();
        let key = DataKey::LockedFunds(account.clone());
        let mut locked: LockedFunds = env
            .storage()
            .persistent()
            .get(&key)
            .ok_or(TipMarketError::InsufficientBalance)?;
        if env.ledger().timestamp() < locked.release_date {
            return Err(TipMarketError::AssetsFrozen);
        }
        if amount <= 0 || amount > locked.amount {
            return Err(TipMarketError::InsufficientBalance);
        }
        locked.amount -= amount;
        env.storage().persistent().set(&key, &locked);
        Self::extend_persistent(&env, &key);
        Self::credit(&env, &account, amount);

        LockedFundsTransferEvent { account, amount }.publish(&env);
        Ok(())
    }

    /// Free-text profile metadata for an account.
    pub fn add_profile(env: Env, account: Address, profile: String, key: String) {
        account.require_auth();
        let mut user = Self::load_user(&env, &account);
        user.profile = profile;
        user.key = key;
        Self::store_user(&env, &account, &user);

        ProfileUpdateEvent { account }.publish(&env);
    }

    // ── Prediction registry ───────────────────────────────────────────────────

    /// Publish a prediction. Returns the new id.
    ///
    /// The event must start between 8 and 24 hours from now and span at most
    /// 48 hours; the odd is a scaled integer strictly above 1.00x. The call
    /// carries `payment` tokens against the mining fee; excess lands in the
    /// seller's balance, a shortfall is drawn from it. Whether the prediction
    /// is free or paid is decided by the pricing policy, not the caller.
    pub fn create_prediction(
        env: Env,
        seller: Address,
        ipfs_hash: String,
        key: String,
        start_time: u64,
        end_time: u64,
        odd: u32,
        price: i128,
        payment: i128,
    ) -> Result<u64, TipMarketError> {
        Self::require_unlocked(&env)?;
        seller.require_auth();
        let config = Self::read_config(&env);
        let now = env.ledger().timestamp();

        Self::check_schedule(now, start_time, end_time)?;
        if odd <= MIN_ODD {
            return Err(TipMarketError::InvalidOdd);
        }

        let price = Self::apply_pricing_policy(&env, &config, &seller, price)?;
        Self::collect_fee(&env, &config, &seller, config.mining_fee, payment)?;

        let id: u64 = env
            .storage()
            .instance()
            .get(&DataKey::PredictionCounter)
            .unwrap_or(0u64)
            + 1;
        env.storage()
            .instance()
            .set(&DataKey::PredictionCounter, &id);
        Self::extend_instance(&env);

        let prediction = Prediction {
            seller: seller.clone(),
            ipfs_hash,
            key,
            created_at: now,
            start_time,
            end_time,
            odd,
            price,
            state: PredictionState::Pending,
            winning_opening_vote: 0,
            winning_closing_vote: 0,
            withdrawn_earnings: false,
            closing_majority_at: 0,
        };
        Self::store_prediction(&env, id, &prediction);
        Self::store_stats(&env, id, &PredictionStats::default());

        Self::id_list_push(&env, &DataKey::MiningPool, &DataKey::MiningPoolPos(id), id);
        Self::id_list_push(
            &env,
            &DataKey::OwnedPredictions(seller.clone()),
            &DataKey::OwnedPredictionPos(seller.clone(), id),
            id,
        );

        PredictionCreatedEvent {
            id,
            seller,
            start_time,
            end_time,
            odd,
            price,
        }
        .publish(&env);

        Ok(id)
    }

    /// Rework a pending, still-unassigned prediction. Seller only.
    pub fn update_prediction(
        env: Env,
        seller: Address,
        id: u64,
        ipfs_hash: String,
        key: String,
        start_time: u64,
        end_time: u64,
        odd: u32,
        price: i128,
    ) -> Result<(), TipMarketError> {
        Self::require_unlocked(&env)?;
        seller.require_auth();
        let mut prediction = Self::load_prediction(&env, id);
        if prediction.seller != seller {
            return Err(TipMarketError::OnlySeller);
        }
        if prediction.state == PredictionState::Withdrawn {
            return Err(TipMarketError::PredictionAlreadyWithdrawn);
        }
        if prediction.state != PredictionState::Pending
            || Self::load_stats(&env, id).validator_count > 0
        {
            return Err(TipMarketError::PredictionAlreadyMined);
        }

        let now = env.ledger().timestamp();
        Self::check_schedule(now, start_time, end_time)?;
        if odd <= MIN_ODD {
            return Err(TipMarketError::InvalidOdd);
        }

        prediction.ipfs_hash = ipfs_hash;
        prediction.key = key;
        prediction.start_time = start_time;
        prediction.end_time = end_time;
        prediction.odd = odd;
        // The free/paid tier was fixed at creation; only a paid prediction
        // may reprice.
        if prediction.price > 0 {
            if price <= 0 {
                return Err(TipMarketError::PriceRequired);
            }
            prediction.price = price;
        }
        Self::store_prediction(&env, id, &prediction);

        PredictionUpdatedEvent { id }.publish(&env);
        Ok(())
    }

    /// Pull a pending, still-unassigned prediction off the market and refund
    /// the mining fee. Seller only.
    pub fn withdraw_prediction(env: Env, seller: Address, id: u64) -> Result<(), TipMarketError> {
        Self::require_unlocked(&env)?;
        seller.require_auth();
        let config = Self::read_config(&env);
        let mut prediction = Self::load_prediction(&env, id);
        if prediction.seller != seller {
            return Err(TipMarketError::OnlySeller);
        }
        if prediction.state == PredictionState::Withdrawn {
            return Err(TipMarketError::PredictionAlreadyWithdrawn);
        }
        if prediction.state != PredictionState::Pending
            || Self::load_stats(&env, id).validator_count > 0
        {
            return Err(TipMarketError::PredictionAlreadyMined);
        }

        prediction.state = PredictionState::Withdrawn;
        Self::store_prediction(&env, id, &prediction);
        Self::id_list_remove(&env, &DataKey::MiningPool, DataKey::MiningPoolPos, id);
        Self::id_list_remove(
            &env,
            &DataKey::OwnedPredictions(seller.clone()),
            |pid| DataKey::OwnedPredictionPos(seller.clone(), pid),
            id,
        );
        Self::credit(&env, &seller, config.mining_fee);
        Self::release_free_slot(&env, &prediction);

        PredictionWithdrawnEvent { id, seller }.publish(&env);
        Ok(())
    }

    // ── Mining pool assignment ────────────────────────────────────────────────

    /// Stake a credential token and claim the next assignable prediction.
    ///
    /// The scan starts at the pool head. A prediction still inside its 4-hour
    /// creation quarantine aborts the call when it is the first candidate;
    /// one starting in under 2 hours is skipped. The staking fee follows the
    /// shortfall/excess rule and credential custody moves to the contract as
    /// the final step of the call. Returns the (prediction, slot) pair.
    pub fn request_validation(
        env: Env,
        miner: Address,
        token_id: u64,
        key: String,
        payment: i128,
    ) -> Result<(u64, u32), TipMarketError> {
        Self::require_unlocked(&env)?;
        miner.require_auth();
        let config = Self::read_config(&env);

        if Self::credential_owner(&env, &config.credential, token_id) != miner {
            return Err(TipMarketError::NotCredentialOwner);
        }

        let pool = Self::id_list(&env, &DataKey::MiningPool);
        if pool.is_empty() {
            return Err(TipMarketError::MiningPoolEmpty);
        }

        let now = env.ledger().timestamp();
        let mut chosen: Option<u64> = None;
        for (scanned, candidate) in pool.iter().enumerate() {
            let prediction = Self::load_prediction(&env, candidate);
            if now < prediction.created_at + MINING_QUARANTINE {
                if scanned == 0 {
                    return Err(TipMarketError::NotAvailableForMining);
                }
                continue;
            }
            if prediction.start_time < now + ASSIGNMENT_LEAD {
                continue;
            }
            chosen = Some(candidate);
            break;
        }
        let id = chosen.ok_or(TipMarketError::MiningPoolDrained)?;

        let mut stats = Self::load_stats(&env, id);
        stats.validator_count += 1;
        let slot = stats.validator_count;

        let validation_key = DataKey::Validation(id, slot);
        env.storage().persistent().set(
            &validation_key,
            &Validation {
                miner: miner.clone(),
                token_id,
                opening: 0,
                closing: 0,
                settled: false,
            },
        );
        Self::extend_persistent(&env, &validation_key);

        Self::owned_validation_push(
            &env,
            &miner,
            OwnedValidation {
                id,
                slot,
                token_id,
                key,
            },
        );
        env.storage()
            .persistent()
            .set(&DataKey::TokenCustodian(token_id), &miner);

        // A full cohort leaves the pool (INV-3).
        if stats.validator_count == MAX_VALIDATORS {
            Self::id_list_remove(&env, &DataKey::MiningPool, DataKey::MiningPoolPos, id);
        }
        Self::store_stats(&env, id, &stats);

        Self::collect_fee(&env, &config, &miner, config.miner_staking_fee, payment)?;
        Self::credential_transfer(
            &env,
            &config.credential,
            &miner,
            &env.current_contract_address(),
            token_id,
        );

        ValidationAssignedEvent {
            id,
            slot,
            miner,
            token_id,
        }
        .publish(&env);

        Ok((id, slot))
    }

    // ── Consensus: opening phase ──────────────────────────────────────────────

    /// Cast an opening up/down vote on an assigned slot, before the event
    /// starts. Every cast earns the participation share of the mining fee
    /// immediately, regardless of how the vote turns out.
    pub fn submit_opening_vote(
        env: Env,
        miner: Address,
        id: u64,
        slot: u32,
        vote: u32,
    ) -> Result<(), TipMarketError> {
        Self::require_unlocked(&env)?;
        miner.require_auth();
        let config = Self::read_config(&env);
        let mut prediction = Self::load_prediction(&env, id);

        let validation_key = DataKey::Validation(id, slot);
        let mut validation: Validation = env
            .storage()
            .persistent()
            .get(&validation_key)
            .ok_or(TipMarketError::NotAssigned)?;
        if validation.miner != miner {
            return Err(TipMarketError::NotSlotOwner);
        }
        if vote != VOTE_UP && vote != VOTE_DOWN {
            return Err(TipMarketError::InvalidVoteOption);
        }
        if env.ledger().timestamp() >= prediction.start_time {
            return Err(TipMarketError::EventAlreadyStarted);
        }
        if validation.opening != 0 {
            return Err(TipMarketError::OpeningVoteAlreadyCast);
        }

        validation.opening = vote;
        env.storage().persistent().set(&validation_key, &validation);
        Self::extend_persistent(&env, &validation_key);

        let mut stats = Self::load_stats(&env, id);
        if vote == VOTE_UP {
            stats.upvote_count += 1;
        } else {
            stats.downvote_count += 1;
        }

        Self::credit(&env, &miner, config.mining_fee / (MAX_VALIDATORS as i128));

        if prediction.state == PredictionState::Pending {
            if vote == VOTE_UP && stats.upvote_count == MAJORITY {
                prediction.winning_opening_vote = VOTE_UP;
                prediction.state = PredictionState::Active;
                Self::id_list_push(&env, &DataKey::ActivePool, &DataKey::ActivePoolPos(id), id);

                PredictionActivatedEvent { id }.publish(&env);
            } else if vote == VOTE_DOWN && stats.downvote_count == MAJORITY {
                prediction.winning_opening_vote = VOTE_DOWN;
                prediction.state = PredictionState::Rejected;
                Self::id_list_remove(&env, &DataKey::MiningPool, DataKey::MiningPoolPos, id);
                let seller = prediction.seller.clone();
                Self::id_list_remove(
                    &env,
                    &DataKey::OwnedPredictions(seller.clone()),
                    |pid| DataKey::OwnedPredictionPos(seller.clone(), pid),
                    id,
                );
                Self::release_free_slot(&env, &prediction);

                PredictionRejectedEvent { id }.publish(&env);
            }
        }

        Self::store_stats(&env, id, &stats);
        Self::store_prediction(&env, id, &prediction);

        OpeningVoteEvent { id, slot, vote }.publish(&env);
        Ok(())
    }

    // ── Consensus: closing phase ──────────────────────────────────────────────

    /// Cast a closing won/lost vote inside the post-event window. Reaching
    /// the majority stamps the conclusion clock; the state flip itself waits
    /// for the first settlement after the cool-down.
    pub fn submit_closing_vote(
        env: Env,
        miner: Address,
        id: u64,
        slot: u32,
        vote: u32,
    ) -> Result<(), TipMarketError> {
        Self::require_unlocked(&env)?;
        miner.require_auth();
        let mut prediction = Self::load_prediction(&env, id);
        if prediction.state != PredictionState::Active {
            return Err(TipMarketError::PredictionInactive);
        }

        let validation_key = DataKey::Validation(id, slot);
        let mut validation: Validation = env
            .storage()
            .persistent()
            .get(&validation_key)
            .ok_or(TipMarketError::NotAssigned)?;
        if validation.miner != miner {
            return Err(TipMarketError::NotSlotOwner);
        }
        if vote != VOTE_WON && vote != VOTE_LOST {
            return Err(TipMarketError::InvalidVoteOption);
        }
        let now = env.ledger().timestamp();
        if now < prediction.end_time + CLOSING_OPENS_AFTER {
            return Err(TipMarketError::ClosingVoteTooEarly);
        }
        if now > prediction.end_time + CLOSING_CLOSES_AFTER {
            return Err(TipMarketError::ClosingWindowExpired);
        }
        if validation.closing != 0 {
            return Err(TipMarketError::ClosingVoteAlreadyCast);
        }

        validation.closing = vote;
        env.storage().persistent().set(&validation_key, &validation);
        Self::extend_persistent(&env, &validation_key);

        let mut stats = Self::load_stats(&env, id);
        if vote == VOTE_WON {
            stats.won_vote_count += 1;
        } else {
            stats.lost_vote_count += 1;
        }
        Self::store_stats(&env, id, &stats);

        if prediction.closing_majority_at == 0
            && (stats.won_vote_count >= MAJORITY || stats.lost_vote_count >= MAJORITY)
        {
            prediction.closing_majority_at = now;
            Self::store_prediction(&env, id, &prediction);
        }

        ClosingVoteEvent { id, slot, vote }.publish(&env);
        Ok(())
    }

    // ── Purchases ─────────────────────────────────────────────────────────────

    /// Buy access to an active prediction before its event starts. The key
    /// passed in is recorded on the purchase so the unlock material can be
    /// re-encrypted for this buyer.
    pub fn purchase_prediction(
        env: Env,
        buyer: Address,
        id: u64,
        key: String,
        payment: i128,
    ) -> Result<(), TipMarketError> {
        Self::require_unlocked(&env)?;
        buyer.require_auth();
        let config = Self::read_config(&env);
        let prediction = Self::load_prediction(&env, id);
        if prediction.state != PredictionState::Active {
            return Err(TipMarketError::PredictionInactive);
        }
        if env.ledger().timestamp() >= prediction.start_time {
            return Err(TipMarketError::EventAlreadyStarted);
        }
        let purchase_key = DataKey::Purchase(buyer.clone(), id);
        if env.storage().persistent().has(&purchase_key) {
            return Err(TipMarketError::AlreadyPurchased);
        }

        env.storage().persistent().set(
            &purchase_key,
            &Purchase {
                purchased: true,
                key,
                refunded: false,
            },
        );
        Self::extend_persistent(&env, &purchase_key);

        let mut stats = Self::load_stats(&env, id);
        stats.buy_count += 1;
        Self::store_stats(&env, id, &stats);

        let bought_key = DataKey::BoughtPredictions(buyer.clone());
        let mut bought = Self::id_list(&env, &bought_key);
        bought.push_back(id);
        env.storage().persistent().set(&bought_key, &bought);
        Self::extend_persistent(&env, &bought_key);

        Self::collect_fee(&env, &config, &buyer, prediction.price, payment)?;

        PredictionPurchasedEvent { id, buyer }.publish(&env);
        Ok(())
    }

    /// Claim back the purchase price of a lost prediction.
    pub fn refund_buyer(env: Env, buyer: Address, id: u64) -> Result<(), TipMarketError> {
        Self::require_unlocked(&env)?;
        buyer.require_auth();
        let prediction = Self::load_prediction(&env, id);
        let purchase_key = DataKey::Purchase(buyer.clone(), id);
        let mut purchase: Purchase = env
            .storage()
            .persistent()
            .get(&purchase_key)
            .ok_or(TipMarketError::NoPurchaseRecord)?;
        match prediction.state {
            PredictionState::Lost => {}
            PredictionState::Won => return Err(TipMarketError::PredictionWon),
            _ => return Err(TipMarketError::PredictionNotConcluded),
        }
        if purchase.refunded {
            return Err(TipMarketError::AlreadyRefunded);
        }

        purchase.refunded = true;
        env.storage().persistent().set(&purchase_key, &purchase);
        Self::extend_persistent(&env, &purchase_key);
        Self::credit(&env, &buyer, prediction.price);

        BuyerRefundedEvent {
            id,
            buyer,
            amount: prediction.price,
        }
        .publish(&env);
        Ok(())
    }

    // ── Settlement ────────────────────────────────────────────────────────────

    /// Settle one validator slot of a concluded (or majority-complete)
    /// prediction, after the 5-hour cool-down. The first settlement performs
    /// the Won/Lost transition inline. A vote matching the majority returns
    /// the stake, plus the buyer-revenue share when the prediction won; a
    /// minority or missing closing vote sends the stake under the 30-day
    /// rolling lock instead. Custody of the credential token returns to the
    /// miner in every case.
    pub fn settle_miner(env: Env, miner: Address, id: u64, slot: u32) -> Result<(), TipMarketError> {
        Self::require_unlocked(&env)?;
        miner.require_auth();
        let config = Self::read_config(&env);
        let mut prediction = Self::load_prediction(&env, id);
        let stats = Self::load_stats(&env, id);

        match prediction.state {
            PredictionState::Active => {
                if prediction.closing_majority_at == 0 {
                    return Err(TipMarketError::PredictionNotConcluded);
                }
            }
            PredictionState::Won | PredictionState::Lost => {}
            _ => return Err(TipMarketError::NotAnActivePrediction),
        }
        let now = env.ledger().timestamp();
        if now < prediction.closing_majority_at + SETTLEMENT_COOLDOWN {
            return Err(TipMarketError::NotCooledDownYet);
        }

        let validation_key = DataKey::Validation(id, slot);
        let mut validation: Validation = env
            .storage()
            .persistent()
            .get(&validation_key)
            .ok_or(TipMarketError::NotMiner)?;
        if validation.miner != miner {
            return Err(TipMarketError::NotMiner);
        }
        if validation.settled {
            return Err(TipMarketError::MinerAlreadySettled);
        }

        if prediction.state == PredictionState::Active {
            Self::conclude(&env, id, &mut prediction, &stats);
        }

        let agreed = validation.closing == prediction.winning_closing_vote;
        if agreed {
            let mut payout = config.miner_staking_fee;
            if prediction.state == PredictionState::Won {
                payout = payout
                    .checked_add(Self::miner_cut(&stats, &prediction, config.miner_percentage))
                    .expect("overflow in miner payout");
            }
            Self::credit(&env, &miner, payout);
        } else {
            Self::lock_stake(&env, &miner, config.miner_staking_fee, now);
        }

        validation.settled = true;
        env.storage().persistent().set(&validation_key, &validation);
        Self::extend_persistent(&env, &validation_key);
        Self::owned_validation_remove(&env, &miner, id, slot);
        Self::store_prediction(&env, id, &prediction);

        Self::release_custody(&env, &config, validation.token_id, &miner);

        MinerSettledEvent {
            id,
            slot,
            miner,
            agreed,
        }
        .publish(&env);
        Ok(())
    }

    /// Early exit for a rejected prediction: the staking fee comes straight
    /// back, since there is no majority outcome to disagree with, and the
    /// credential token is released.
    pub fn withdraw_nft_and_staking_fee(
        env: Env,
        miner: Address,
        id: u64,
        slot: u32,
    ) -> Result<(), TipMarketError> {
        Self::require_unlocked(&env)?;
        miner.require_auth();
        let config = Self::read_config(&env);
        let prediction = Self::load_prediction(&env, id);
        if prediction.state != PredictionState::Rejected {
            return Err(TipMarketError::PredictionNotRejected);
        }

        let validation_key = DataKey::Validation(id, slot);
        let mut validation: Validation = env
            .storage()
            .persistent()
            .get(&validation_key)
            .ok_or(TipMarketError::NotAssigned)?;
        if validation.miner != miner {
            return Err(TipMarketError::NotSlotOwner);
        }
        if validation.settled {
            return Err(TipMarketError::StakingFeeAlreadyRefunded);
        }

        validation.settled = true;
        env.storage().persistent().set(&validation_key, &validation);
        Self::extend_persistent(&env, &validation_key);
        Self::credit(&env, &miner, config.miner_staking_fee);
        Self::owned_validation_remove(&env, &miner, id, slot);

        Self::release_custody(&env, &config, validation.token_id, &miner);

        MinerSettledEvent {
            id,
            slot,
            miner,
            agreed: true,
        }
        .publish(&env);
        Ok(())
    }

    /// Pay the seller their buyer revenue, net of the validator reward pool.
    /// Won predictions only, once only.
    pub fn settle_seller(env: Env, seller: Address, id: u64) -> Result<(), TipMarketError> {
        Self::require_unlocked(&env)?;
        seller.require_auth();
        let config = Self::read_config(&env);
        let mut prediction = Self::load_prediction(&env, id);
        if prediction.seller != seller {
            return Err(TipMarketError::OnlySeller);
        }
        match prediction.state {
            PredictionState::Won => {}
            PredictionState::Lost => return Err(TipMarketError::PredictionLost),
            _ => return Err(TipMarketError::PredictionNotConcluded),
        }
        if prediction.withdrawn_earnings {
            return Err(TipMarketError::EarningsAlreadyWithdrawn);
        }

        let stats = Self::load_stats(&env, id);
        let gross = (stats.buy_count as i128)
            .checked_mul(prediction.price)
            .expect("overflow in seller earnings");
        let miners_pool = Self::miner_cut(&stats, &prediction, config.miner_percentage)
            .checked_mul(MAX_VALIDATORS as i128)
            .expect("overflow in seller earnings");
        let earnings = gross - miners_pool;

        prediction.withdrawn_earnings = true;
        Self::store_prediction(&env, id, &prediction);
        Self::credit(&env, &seller, earnings);

        SellerSettledEvent {
            id,
            seller,
            amount: earnings,
        }
        .publish(&env);
        Ok(())
    }

    // ── Views ─────────────────────────────────────────────────────────────────

    pub fn get_prediction(env: Env, id: u64) -> Prediction {
        Self::load_prediction(&env, id)
    }

    pub fn get_prediction_stats(env: Env, id: u64) -> PredictionStats {
        Self::load_stats(&env, id)
    }

    pub fn get_validation(env: Env, id: u64, slot: u32) -> Option<Validation> {
        env.storage().persistent().get(&DataKey::Validation(id, slot))
    }

    pub fn get_mining_pool(env: Env) -> Vec<u64> {
        Self::id_list(&env, &DataKey::MiningPool)
    }

    pub fn get_active_pool(env: Env) -> Vec<u64> {
        Self::id_list(&env, &DataKey::ActivePool)
    }

    pub fn get_owned_predictions(env: Env, seller: Address) -> Vec<u64> {
        Self::id_list(&env, &DataKey::OwnedPredictions(seller))
    }

    pub fn get_owned_validations(env: Env, miner: Address) -> Vec<OwnedValidation> {
        Self::owned_validation_list(&env, &miner)
    }

    pub fn get_bought_predictions(env: Env, buyer: Address) -> Vec<u64> {
        Self::id_list(&env, &DataKey::BoughtPredictions(buyer))
    }

    pub fn get_purchase(env: Env, buyer: Address, id: u64) -> Option<Purchase> {
        env.storage().persistent().get(&DataKey::Purchase(buyer, id))
    }

    pub fn get_balance(env: Env, account: Address) -> i128 {
        Self::balance_of(&env, &account)
    }

    pub fn get_locked_funds(env: Env, account: Address) -> LockedFunds {
        env.storage()
            .persistent()
            .get(&DataKey::LockedFunds(account))
            .unwrap_or(LockedFunds {
                amount: 0,
                release_date: 0,
                last_push_date: 0,
                total_instances: 0,
            })
    }

    pub fn get_user(env: Env, account: Address) -> UserProfile {
        Self::load_user(&env, &account)
    }

    pub fn get_token_custodian(env: Env, token_id: u64) -> Option<Address> {
        env.storage().persistent().get(&DataKey::TokenCustodian(token_id))
    }

    pub fn used_free_quota(env: Env) -> u32 {
        Self::used_free_quota_count(&env)
    }

    pub fn get_config(env: Env) -> Config {
        Self::read_config(&env)
    }

    pub fn is_locked(env: Env) -> bool {
        env.storage()
            .instance()
            .get(&DataKey::Locked)
            .unwrap_or(false)
    }
}

mod integration_test;
