//! Manage announce tokens for remote addresses.

use std::{
    collections::VecDeque,
    fmt::{self, Debug, Formatter},
    net::SocketAddrV4,
    time::{Duration, Instant},
};

use rand::Rng;
use tracing::trace;

const SECRET_SIZE: usize = 20;
/// Number of secrets a token can be derived from.
const MAX_SECRETS: usize = 3;

/// Default interval between secret rotations.
pub const DEFAULT_TOKEN_ROTATION: Duration = Duration::from_secs(5 * 60);

/// Tokens generator.
///
/// A token is `sha1(secret ++ "address/port")`, valid as long as its secret
/// is one of the last [MAX_SECRETS] generated ones.
///
/// Read [BEP_0005](https://www.bittorrent.org/beps/bep_0005.html) for more information.
#[derive(Clone)]
pub struct Tokens {
    secrets: VecDeque<[u8; SECRET_SIZE]>,
    rotation_interval: Duration,
    last_updated: Instant,
}

impl Debug for Tokens {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "Tokens (_)")
    }
}

impl Tokens {
    /// Create a Tokens generator.
    pub fn new(rotation_interval: Duration) -> Self {
        let mut secrets = VecDeque::with_capacity(MAX_SECRETS + 1);
        secrets.push_back(random());

        Tokens {
            secrets,
            rotation_interval,
            last_updated: Instant::now(),
        }
    }

    // === Public Methods ===

    /// Returns `true` if the current secret needs to be updated after an interval.
    pub fn should_update(&self) -> bool {
        self.should_update_at(Instant::now())
    }

    pub(crate) fn should_update_at(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.last_updated) >= self.rotation_interval
    }

    /// Validate that the token was generated from one of the retained secrets.
    pub fn validate(&self, address: SocketAddrV4, token: &[u8]) -> bool {
        self.secrets
            .iter()
            .any(|secret| internal_generate_token(address, secret) == token)
    }

    /// Rotate the tokens secret.
    pub fn rotate(&mut self) {
        trace!("Rotating secrets");

        self.secrets.push_back(random());
        while self.secrets.len() > MAX_SECRETS {
            self.secrets.pop_front();
        }

        self.last_updated = Instant::now();
    }

    /// Generates a new token for a remote peer.
    pub fn generate_token(&self, address: SocketAddrV4) -> [u8; 20] {
        match self.secrets.back() {
            Some(secret) => internal_generate_token(address, secret),
            // `secrets` is never empty.
            None => [0; 20],
        }
    }
}

impl Default for Tokens {
    fn default() -> Self {
        Self::new(DEFAULT_TOKEN_ROTATION)
    }
}

fn internal_generate_token(address: SocketAddrV4, secret: &[u8; SECRET_SIZE]) -> [u8; 20] {
    let mut hasher = sha1_smol::Sha1::new();

    hasher.update(secret);
    hasher.update(format!("{}/{}", address.ip(), address.port()).as_bytes());

    hasher.digest().bytes()
}

fn random() -> [u8; SECRET_SIZE] {
    rand::thread_rng().gen()
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn valid_tokens() {
        let tokens = Tokens::default();

        let address = SocketAddrV4::new([127, 0, 0, 1].into(), 6881);
        let token = tokens.generate_token(address);

        assert!(tokens.validate(address, &token));
        assert_eq!(token, tokens.generate_token(address));
    }

    #[test]
    fn tokens_are_bound_to_address_and_port() {
        let tokens = Tokens::default();

        let address = SocketAddrV4::new([127, 0, 0, 1].into(), 6881);
        let token = tokens.generate_token(address);

        assert!(!tokens.validate(SocketAddrV4::new([127, 0, 0, 1].into(), 6882), &token));
        assert!(!tokens.validate(SocketAddrV4::new([127, 0, 0, 2].into(), 6881), &token));
        assert!(!tokens.validate(address, &token[..4]));
    }

    #[test]
    fn tokens_survive_two_rotations() {
        let mut tokens = Tokens::default();

        let address = SocketAddrV4::new([127, 0, 0, 1].into(), 6881);
        let token = tokens.generate_token(address);

        tokens.rotate();
        assert!(tokens.validate(address, &token));
        assert_ne!(tokens.generate_token(address), token);

        tokens.rotate();
        assert!(tokens.validate(address, &token));

        tokens.rotate();
        assert!(!tokens.validate(address, &token));
    }

    #[test]
    fn should_update_after_interval() {
        let tokens = Tokens::new(Duration::from_secs(300));
        let now = Instant::now();

        assert!(!tokens.should_update_at(now));
        assert!(tokens.should_update_at(now + Duration::from_secs(301)));
    }
}
