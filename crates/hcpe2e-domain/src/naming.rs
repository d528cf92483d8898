use rand::Rng;

/// Consonants and digits only, so suffixes never spell words.
const SUFFIX_ALPHABET: &[u8] = b"bcdfghjklmnpqrstvwxz2456789";

/// Length of the random suffix appended by [`unique_name`].
pub const DEFAULT_SUFFIX_LEN: usize = 6;

/// Length limit the harness applies to resource-group names.
pub const RESOURCE_GROUP_MAX_LEN: usize = 64;

const HASH_LEN: usize = 8;

/// Random lowercase alphanumeric string of `len` characters.
pub fn random_suffix(len: usize) -> String {
    let mut rng = rand::rng();
    (0..len)
        .map(|_| SUFFIX_ALPHABET[rng.random_range(0..SUFFIX_ALPHABET.len())] as char)
        .collect()
}

/// `<prefix>-<random>` bounded to `max_len`.
pub fn unique_name(prefix: &str, max_len: usize) -> String {
    suffix_name(prefix, &random_suffix(DEFAULT_SUFFIX_LEN), max_len)
}

/// Join `base` and `suffix` with a dash, staying within `max_len`.
///
/// When the joined name is too long the base is shortened and an FNV-1a hash
/// of the full name is inserted before the suffix, so the suffix survives
/// intact and distinct long bases stay distinct:
/// `<base[..k]>-<hash8>-<suffix>`.
///
/// Lengths are in bytes, which is what ARM limits. Cuts never split a
/// multi-byte character.
pub fn suffix_name(base: &str, suffix: &str, max_len: usize) -> String {
    let suffix = suffix.trim_start_matches('-');
    let full = if base.is_empty() {
        suffix.to_string()
    } else {
        format!("{}-{}", base, suffix)
    };
    if full.len() <= max_len {
        return full;
    }

    // Degenerate limits: nothing but (part of) the suffix fits.
    if suffix.len() >= max_len {
        return truncate(suffix, max_len);
    }
    let budget = max_len - suffix.len() - 1;
    if budget == 0 {
        return suffix.to_string();
    }

    let hash = format!("{:08x}", fnv32a(&full));
    let head = if budget > HASH_LEN + 1 {
        let kept = truncate(base, budget - HASH_LEN - 1);
        let kept = kept.trim_end_matches('-');
        if kept.is_empty() {
            hash
        } else {
            format!("{}-{}", kept, hash)
        }
    } else {
        truncate(&hash, budget)
    };
    format!("{}-{}", head, suffix)
}

/// Longest prefix of `s` that fits in `max_bytes` and ends on a char boundary.
fn truncate(s: &str, max_bytes: usize) -> String {
    if s.len() <= max_bytes {
        return s.to_string();
    }
    let end = (0..=max_bytes).rev().find(|&i| s.is_char_boundary(i)).unwrap_or(0);
    s[..end].to_string()
}

/// 32-bit FNV-1a.
fn fnv32a(s: &str) -> u32 {
    const OFFSET: u32 = 0x811c_9dc5;
    const PRIME: u32 = 0x0100_0193;
    s.bytes().fold(OFFSET, |h, b| (h ^ u32::from(b)).wrapping_mul(PRIME))
}
