//! Random secrets for the RPC session and plugin callbacks

use rand::Rng;
use rand::distributions::Alphanumeric;

const TOKEN_LEN: usize = 32;

pub fn random_token() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(TOKEN_LEN)
        .map(char::from)
        .collect()
}
