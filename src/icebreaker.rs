//! First chat message for a freshly activated match.
//!
//! Selection is a pure function of the shared interests (or, when there are
//! none, the meet point), so the same match always gets the same opener.

use std::collections::BTreeSet;

const INTEREST_TEMPLATES: &[&str] = &[
    "You both listed {interest}. Who found it first?",
    "Shared interest spotted: {interest}. Any recommendations for the ride?",
    "Looks like {interest} is common ground. Best {interest} spot near your route?",
    "{interest} fans on the same commute. What got you into it?",
];

const ROUTE_TEMPLATES: &[&str] = &[
    "You will be travelling together from {place}. Say hi before you meet!",
    "Same route, same time. Meeting near {place}?",
    "Your commutes line up from {place}. How long have you been doing this trip?",
];

/// FNV-1a; stable across platforms and releases, unlike `DefaultHasher`.
fn stable_hash(parts: impl IntoIterator<Item = impl AsRef<str>>) -> u64 {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for part in parts {
        for byte in part.as_ref().bytes().chain(std::iter::once(0x1f)) {
            hash ^= u64::from(byte);
            hash = hash.wrapping_mul(0x0100_0000_01b3);
        }
    }
    hash
}

/// Pick an opener. `shared_interests` should already be normalised.
pub fn icebreaker(shared_interests: &BTreeSet<String>, meet_place: Option<&str>) -> String {
    if shared_interests.is_empty() {
        let place = meet_place.unwrap_or("your meeting point");
        let index = (stable_hash([place]) % ROUTE_TEMPLATES.len() as u64) as usize;
        return ROUTE_TEMPLATES[index].replace("{place}", place);
    }

    let seed = stable_hash(shared_interests.iter());
    let template = INTEREST_TEMPLATES[(seed % INTEREST_TEMPLATES.len() as u64) as usize];
    let interests: Vec<&String> = shared_interests.iter().collect();
    let featured = interests[((seed >> 32) % interests.len() as u64) as usize];
    template.replace("{interest}", featured)
}
