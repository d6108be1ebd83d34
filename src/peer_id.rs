//! Peer identifier helpers.
//!
//! Peers normally register with a wallet-derived or user-chosen address; when
//! none is given we generate a readable id like "amber-falcon-ridge" so it can
//! be dictated over the phone.

use rand::seq::SliceRandom;
use rand::thread_rng;

const ADJECTIVES: &[&str] = &[
    "amber", "brisk", "cedar", "dusty", "early", "frost", "green", "hazel",
    "ivory", "jade", "keen", "lunar", "mellow", "noble", "opal", "pale",
    "quick", "rustic", "stone", "tidal", "umber", "vivid", "windy", "zonal",
];

const NOUNS: &[&str] = &[
    "falcon", "ridge", "harbor", "comet", "meadow", "otter", "pine", "quarry",
    "reef", "spruce", "trail", "valley", "wharf", "aspen", "bison", "canyon",
    "delta", "ember", "fjord", "grove", "heron", "inlet", "juniper", "knoll",
];

/// Generate a human-friendly peer id like "amber-falcon-ridge".
pub fn generate_peer_id() -> String {
    let mut rng = thread_rng();
    let adj = ADJECTIVES.choose(&mut rng).copied().unwrap_or("amber");
    let noun1 = NOUNS.choose(&mut rng).copied().unwrap_or("falcon");
    let noun2 = NOUNS.choose(&mut rng).copied().unwrap_or("ridge");
    format!("{}-{}-{}", adj, noun1, noun2)
}

/// Validate a peer id: 1-64 chars, alphanumeric plus dash/underscore,
/// starting and ending alphanumeric.
pub fn is_valid_peer_id(id: &str) -> bool {
    if id.is_empty() || id.len() > 64 {
        return false;
    }
    let chars: Vec<char> = id.chars().collect();
    if !chars.first().map(|c| c.is_alphanumeric()).unwrap_or(false) {
        return false;
    }
    if !chars.last().map(|c| c.is_alphanumeric()).unwrap_or(false) {
        return false;
    }
    chars
        .iter()
        .all(|c| c.is_alphanumeric() || *c == '-' || *c == '_')
}
