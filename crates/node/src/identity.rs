//! Deterministic node identity.
//!
//! The configuration seed string is hashed with SHA-256, the first eight
//! bytes are read as a big-endian integer seeding a PRNG, and a secp256k1
//! ECDSA key is drawn from it. The same seed always yields the same peer id.

use libp2p::identity::{self, Keypair};
use rand::distributions::Alphanumeric;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use sha2::{Digest, Sha256};
use tracing::info;

pub fn generate_keypair(seed: &str) -> Keypair {
    let seed = if seed.is_empty() {
        let random: String = rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(8)
            .map(char::from)
            .collect();

        info!("Using random seed: {random}");
        random
    } else {
        seed.to_string()
    };

    let digest = Sha256::digest(seed.as_bytes());
    let num = u64::from_be_bytes(digest[..8].try_into().expect("digest has 8 bytes"));
    let mut rng = StdRng::seed_from_u64(num);

    // Rejection-sample until the scalar is a valid secp256k1 secret key.
    loop {
        let mut secret_bytes = [0u8; 32];
        rng.fill(&mut secret_bytes);

        if let Ok(secret) = identity::secp256k1::SecretKey::try_from_bytes(&mut secret_bytes) {
            let keypair = identity::secp256k1::Keypair::from(secret);
            return Keypair::from(keypair);
        }
    }
}
