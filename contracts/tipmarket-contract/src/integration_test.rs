#![cfg(test)]
#![allow(deprecated)]

use super::*;
use soroban_sdk::{
    testutils::{Address as _, Ledger},
    token, Address, Env, String,
};

mod credential_nft {
    use soroban_sdk::{contract, contractimpl, Address, Env};

    #[contract]
    pub struct CredentialNft;

    #[contractimpl]
    impl CredentialNft {
        pub fn mint(env: Env, to: Address, token_id: u64) {
            env.storage().instance().set(&token_id, &to);
        }

        pub fn owner_of(env: Env, token_id: u64) -> Address {
            env.storage()
                .instance()
                .get(&token_id)
                .expect("token not minted")
        }

        pub fn transfer(env: Env, from: Address, to: Address, token_id: u64) {
            from.require_auth();
            let owner: Address = env
                .storage()
                .instance()
                .get(&token_id)
                .expect("token not minted");
            assert!(owner == from, "not token owner");
            env.storage().instance().set(&token_id, &to);
        }
    }
}

const MINING_FEE: i128 = 10_000;
const STAKING_FEE: i128 = 10_000;
const MINER_PERCENTAGE: u32 = 5;
const PRICE: i128 = 10_000;

fn setup_integration(
    env: &Env,
) -> (
    TipMarketContractClient<'_>,
    credential_nft::CredentialNftClient<'_>,
    token::Client<'_>,
    token::StellarAssetClient<'_>,
    Address,
) {
    let owner = Address::generate(env);

    let nft_id = env.register(credential_nft::CredentialNft, ());
    let nft = credential_nft::CredentialNftClient::new(env, &nft_id);

    let token_admin = Address::generate(env);
    let token_contract = env.register_stellar_asset_contract(token_admin.clone());
    let token_client = token::Client::new(env, &token_contract);
    let token_admin_client = token::StellarAssetClient::new(env, &token_contract);

    let contract_id = env.register(TipMarketContract, ());
    let client = TipMarketContractClient::new(env, &contract_id);
    client.init(&owner, &nft_id, &token_contract);
    client.set_variables(&owner, &MINING_FEE, &STAKING_FEE, &MINER_PERCENTAGE);
    client.set_free_tips_quota(&owner, &100u32);
    client.set_paid_history_threshold(&owner, &2u32);

    (client, nft, token_client, token_admin_client, owner)
}

fn advance(env: &Env, by: u64) {
    env.ledger().with_mut(|li| li.timestamp += by);
}

fn create_prediction(
    env: &Env,
    client: &TipMarketContractClient,
    token_admin: &token::StellarAssetClient,
    seller: &Address,
) -> u64 {
    token_admin.mint(seller, &MINING_FEE);
    let now = env.ledger().timestamp();
    client.create_prediction(
        seller,
        &String::from_str(env, "bafkreiintegration"),
        &String::from_str(env, "unlock-key"),
        &(now + 43200),
        &(now + 43200 + 86400),
        &200u32,
        &PRICE,
        &MINING_FEE,
    )
}

fn miner_cohort(
    env: &Env,
    nft: &credential_nft::CredentialNftClient,
    token_admin: &token::StellarAssetClient,
) -> [(Address, u64); 5] {
    core::array::from_fn(|i| {
        let token_id = 1 + i as u64;
        let miner = Address::generate(env);
        nft.mint(&miner, &token_id);
        token_admin.mint(&miner, &(STAKING_FEE * 20));
        (miner, token_id)
    })
}

/// Full unanimous-won cycle over the given cohort, everyone settled.
fn run_won_cycle(
    env: &Env,
    client: &TipMarketContractClient,
    token_admin: &token::StellarAssetClient,
    seller: &Address,
    miners: &[(Address, u64); 5],
) -> u64 {
    let id = create_prediction(env, client, token_admin, seller);
    advance(env, 14400);
    for (miner, token_id) in miners {
        client.request_validation(
            miner,
            token_id,
            &String::from_str(env, "miner-key"),
            &STAKING_FEE,
        );
    }
    for (i, (miner, _)) in miners.iter().enumerate() {
        client.submit_opening_vote(miner, &id, &(i as u32 + 1), &VOTE_UP);
    }
    advance(env, 122500);
    for (i, (miner, _)) in miners.iter().enumerate() {
        client.submit_closing_vote(miner, &id, &(i as u32 + 1), &VOTE_WON);
    }
    advance(env, 18000);
    for (i, (miner, _)) in miners.iter().enumerate() {
        client.settle_miner(miner, &id, &(i as u32 + 1));
    }
    id
}

#[test]
fn test_full_won_lifecycle() {
    let env = Env::default();
    env.mock_all_auths();
    let (client, nft, token, token_admin, _) = setup_integration(&env);

    let seller = Address::generate(&env);
    let miners = miner_cohort(&env, &nft, &token_admin);

    // Two settled wins graduate the seller into the paid tier.
    let first = run_won_cycle(&env, &client, &token_admin, &seller, &miners);
    let second = run_won_cycle(&env, &client, &token_admin, &seller, &miners);
    assert_eq!(client.get_prediction(&first).price, 0);
    assert_eq!(client.get_prediction(&second).price, 0);

    let id = create_prediction(&env, &client, &token_admin, &seller);
    assert_eq!(client.get_prediction(&id).price, PRICE);

    advance(&env, 14400);
    for (miner, token_id) in &miners {
        let (assigned, _) = client.request_validation(
            miner,
            token_id,
            &String::from_str(&env, "miner-key"),
            &STAKING_FEE,
        );
        assert_eq!(assigned, id);
    }
    assert_eq!(client.get_prediction_stats(&id).validator_count, 5);
    assert_eq!(client.get_mining_pool().len(), 0);

    for (i, (miner, _)) in miners.iter().enumerate() {
        client.submit_opening_vote(miner, &id, &(i as u32 + 1), &VOTE_UP);
    }
    assert_eq!(client.get_prediction(&id).state, PredictionState::Active);

    // Five buyers pay the asking price before the event starts.
    let buyers: [Address; 5] = core::array::from_fn(|_| {
        let buyer = Address::generate(&env);
        token_admin.mint(&buyer, &PRICE);
        client.purchase_prediction(&buyer, &id, &String::from_str(&env, "buyer-key"), &PRICE);
        buyer
    });
    assert_eq!(client.get_prediction_stats(&id).buy_count, 5);

    advance(&env, 122500);
    let closing = [VOTE_WON, VOTE_WON, VOTE_WON, VOTE_LOST, VOTE_LOST];
    for (i, (miner, _)) in miners.iter().enumerate() {
        client.submit_closing_vote(miner, &id, &(i as u32 + 1), &closing[i]);
    }
    advance(&env, 18000);

    let share = MINING_FEE / MAX_VALIDATORS as i128;
    let cut = 5 * PRICE * MINER_PERCENTAGE as i128 / 100;
    // two settled cycles plus this round's opening share
    let carried = 2 * (share + STAKING_FEE) + share;

    for (i, (miner, _)) in miners.iter().enumerate() {
        client.settle_miner(miner, &id, &(i as u32 + 1));
    }
    assert_eq!(client.get_prediction(&id).state, PredictionState::Won);
    for (miner, _) in miners.iter().take(3) {
        assert_eq!(client.get_balance(miner), carried + STAKING_FEE + cut);
        assert_eq!(client.get_locked_funds(miner).amount, 0);
    }
    for (miner, _) in miners.iter().skip(3) {
        assert_eq!(client.get_balance(miner), carried);
        assert_eq!(client.get_locked_funds(miner).amount, STAKING_FEE);
    }

    client.settle_seller(&seller, &id);
    let earnings = 5 * PRICE - 5 * cut;
    assert_eq!(client.get_balance(&seller), earnings);
    let retry = client.try_settle_seller(&seller, &id);
    assert_eq!(retry, Err(Ok(TipMarketError::EarningsAlreadyWithdrawn)));

    let user = client.get_user(&seller);
    assert_eq!(user.won_count, 3);
    assert_eq!(user.lost_count, 0);
    assert_eq!(user.total_predictions, 3);
    assert_eq!(user.recent, soroban_sdk::vec![&env, first, second, id]);

    // Conservation: everything the contract holds is owed to someone, except
    // the two reward shares charged to the seller that no minority validator
    // could claim.
    let mut owed: i128 = client.get_balance(&seller);
    for (miner, _) in &miners {
        owed += client.get_balance(miner);
        owed += client.get_locked_funds(miner).amount;
    }
    for buyer in &buyers {
        owed += client.get_balance(buyer);
    }
    let unclaimed_cuts = 2 * cut;
    assert_eq!(token.balance(&client.address), owed + unclaimed_cuts);
}

#[test]
fn test_full_lost_lifecycle_with_refunds() {
    let env = Env::default();
    env.mock_all_auths();
    let (client, nft, token, token_admin, _) = setup_integration(&env);

    let seller = Address::generate(&env);
    let miners = miner_cohort(&env, &nft, &token_admin);

    run_won_cycle(&env, &client, &token_admin, &seller, &miners);
    run_won_cycle(&env, &client, &token_admin, &seller, &miners);

    let id = create_prediction(&env, &client, &token_admin, &seller);
    assert_eq!(client.get_prediction(&id).price, PRICE);

    advance(&env, 14400);
    for (miner, token_id) in &miners {
        client.request_validation(
            miner,
            token_id,
            &String::from_str(&env, "miner-key"),
            &STAKING_FEE,
        );
    }
    for (i, (miner, _)) in miners.iter().enumerate() {
        client.submit_opening_vote(miner, &id, &(i as u32 + 1), &VOTE_UP);
    }

    let buyers: [Address; 2] = core::array::from_fn(|_| {
        let buyer = Address::generate(&env);
        token_admin.mint(&buyer, &PRICE);
        client.purchase_prediction(&buyer, &id, &String::from_str(&env, "buyer-key"), &PRICE);
        buyer
    });

    advance(&env, 122500);
    // three lost votes conclude it, one dissenter, one abstainer
    let closing = [VOTE_LOST, VOTE_LOST, VOTE_LOST, VOTE_WON, 0];
    for (i, (miner, _)) in miners.iter().enumerate() {
        if closing[i] != 0 {
            client.submit_closing_vote(miner, &id, &(i as u32 + 1), &closing[i]);
        }
    }
    advance(&env, 18000);

    for (i, (miner, _)) in miners.iter().enumerate() {
        client.settle_miner(miner, &id, &(i as u32 + 1));
    }
    assert_eq!(client.get_prediction(&id).state, PredictionState::Lost);

    let share = MINING_FEE / MAX_VALIDATORS as i128;
    let carried = 2 * (share + STAKING_FEE) + share;
    // the majority gets stakes back and nothing else; losers pay no reward
    for (miner, _) in miners.iter().take(3) {
        assert_eq!(client.get_balance(miner), carried + STAKING_FEE);
    }
    // dissenter and abstainer both forfeit into the rolling lock
    for (miner, _) in miners.iter().skip(3) {
        assert_eq!(client.get_balance(miner), carried);
        assert_eq!(client.get_locked_funds(miner).amount, STAKING_FEE);
    }

    let blocked = client.try_settle_seller(&seller, &id);
    assert_eq!(blocked, Err(Ok(TipMarketError::PredictionLost)));

    for buyer in &buyers {
        client.refund_buyer(buyer, &id);
        assert_eq!(client.get_balance(buyer), PRICE);
        assert!(client.get_purchase(buyer, &id).unwrap().refunded);
    }
    let double = client.try_refund_buyer(&buyers[0], &id);
    assert_eq!(double, Err(Ok(TipMarketError::AlreadyRefunded)));

    // a lost prediction drops out of the seller's live index but stays on
    // record for audit
    assert_eq!(client.get_owned_predictions(&seller).len(), 2);
    assert_eq!(client.get_prediction(&id).state, PredictionState::Lost);
    let user = client.get_user(&seller);
    assert_eq!(user.won_count, 2);
    assert_eq!(user.lost_count, 1);
    assert_eq!(user.total_predictions, 3);

    // with no winner cut withheld, conservation is exact
    let mut owed: i128 = client.get_balance(&seller);
    for (miner, _) in &miners {
        owed += client.get_balance(miner);
        owed += client.get_locked_funds(miner).amount;
    }
    for buyer in &buyers {
        owed += client.get_balance(buyer);
    }
    assert_eq!(token.balance(&client.address), owed);
}
