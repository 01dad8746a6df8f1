use crate::error::CrackError;
use crate::partition::PartitionRange;
use sha2::{Digest, Sha256, Sha512};
use std::sync::atomic::{AtomicU64, Ordering};
use tokio_util::sync::CancellationToken;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HashAlgorithm {
    Md5,
    Sha256,
    Sha512,
}

impl HashAlgorithm {
    /// The algorithm is implied by the hex length of the target digest.
    pub fn detect(hex_digest: &str) -> Result<Self, CrackError> {
        match hex_digest.len() {
            32 => Ok(HashAlgorithm::Md5),
            64 => Ok(HashAlgorithm::Sha256),
            128 => Ok(HashAlgorithm::Sha512),
            other => Err(CrackError::Validation(format!(
                "unsupported hash length {} (expected 32, 64 or 128 hex characters)",
                other
            ))),
        }
    }

    pub fn digest_hex(&self, word: &[u8]) -> String {
        match self {
            HashAlgorithm::Md5 => hex::encode(md5::compute(word).0),
            HashAlgorithm::Sha256 => hex::encode(Sha256::digest(word)),
            HashAlgorithm::Sha512 => hex::encode(Sha512::digest(word)),
        }
    }

    fn matches(&self, word: &[u8], target: &[u8]) -> bool {
        match self {
            HashAlgorithm::Md5 => md5::compute(word).0[..] == *target,
            HashAlgorithm::Sha256 => Sha256::digest(word).as_slice() == target,
            HashAlgorithm::Sha512 => Sha512::digest(word).as_slice() == target,
        }
    }
}

/// A parsed target digest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetHash {
    algorithm: HashAlgorithm,
    hex: String,
    bytes: Vec<u8>,
}

impl TargetHash {
    pub fn parse(hash: &str) -> Result<Self, CrackError> {
        let hex = hash.trim().to_ascii_lowercase();
        let algorithm = HashAlgorithm::detect(&hex)?;
        let bytes = hex::decode(&hex)
            .map_err(|e| CrackError::Validation(format!("hash is not valid hex: {}", e)))?;
        Ok(Self { algorithm, hex, bytes })
    }

    pub fn algorithm(&self) -> HashAlgorithm {
        self.algorithm
    }

    /// Normalized lower-case hex form.
    pub fn as_hex(&self) -> &str {
        &self.hex
    }

    pub fn matches(&self, word: &[u8]) -> bool {
        self.algorithm.matches(word, &self.bytes)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MatchOutcome {
    Found(String),
    NotFound,
    Cancelled,
}

/// Candidates checked so far, readable from other threads while a search runs.
#[derive(Debug, Default)]
pub struct MatchProgress {
    checked: AtomicU64,
}

impl MatchProgress {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn checked(&self) -> u64 {
        self.checked.load(Ordering::Relaxed)
    }

    fn record(&self) -> u64 {
        self.checked.fetch_add(1, Ordering::Relaxed) + 1
    }
}

pub struct HashMatcher {
    target: TargetHash,
    progress_log_interval: u64,
}

impl HashMatcher {
    pub fn new(target: TargetHash) -> Self {
        Self {
            target,
            progress_log_interval: 0,
        }
    }

    /// Logs progress every `interval` candidates; 0 disables progress logging.
    pub fn with_progress_log_interval(mut self, interval: u64) -> Self {
        self.progress_log_interval = interval;
        self
    }

    pub fn target(&self) -> &TargetHash {
        &self.target
    }

    /// Scans `range` until the first match, exhaustion, or cancellation.
    /// The token is checked before every candidate.
    pub fn search(
        &self,
        range: &PartitionRange,
        cancel: &CancellationToken,
        progress: &MatchProgress,
    ) -> MatchOutcome {
        let mut words = range.words();
        while let Some(word) = words.next_word() {
            if cancel.is_cancelled() {
                return MatchOutcome::Cancelled;
            }
            if self.target.matches(word) {
                return MatchOutcome::Found(String::from_utf8_lossy(word).into_owned());
            }
            let checked = progress.record();
            if self.progress_log_interval > 0 && checked % self.progress_log_interval == 0 {
                debug!(
                    hash = %self.target.as_hex(),
                    checked,
                    remaining = %words.remaining(),
                    "partition progress"
                );
            }
        }
        MatchOutcome::NotFound
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn md5_hex(word: &str) -> String {
        HashAlgorithm::Md5.digest_hex(word.as_bytes())
    }

    #[test]
    fn test_detects_algorithm_from_length() {
        assert_eq!(HashAlgorithm::detect(&"a".repeat(32)).unwrap(), HashAlgorithm::Md5);
        assert_eq!(HashAlgorithm::detect(&"a".repeat(64)).unwrap(), HashAlgorithm::Sha256);
        assert_eq!(HashAlgorithm::detect(&"a".repeat(128)).unwrap(), HashAlgorithm::Sha512);
        assert!(HashAlgorithm::detect("abc").is_err());
    }

    #[test]
    fn test_parse_rejects_non_hex() {
        assert!(TargetHash::parse(&"z".repeat(32)).is_err());
        let parsed = TargetHash::parse(&md5_hex("cat").to_uppercase()).unwrap();
        assert_eq!(parsed.as_hex(), md5_hex("cat"));
    }

    #[test]
    fn test_finds_md5_of_cat() {
        let matcher = HashMatcher::new(TargetHash::parse(&md5_hex("cat")).unwrap());
        let range = PartitionRange::compute(3, 1, 1).unwrap();
        let progress = MatchProgress::new();
        let outcome = matcher.search(&range, &CancellationToken::new(), &progress);
        assert_eq!(outcome, MatchOutcome::Found("cat".to_string()));
        // every word of length 1 and 2 was checked and rejected first
        assert!(progress.checked() >= 36 + 1296);
    }

    #[test]
    fn test_finds_sha256_word() {
        let hash = HashAlgorithm::Sha256.digest_hex(b"z9");
        let matcher = HashMatcher::new(TargetHash::parse(&hash).unwrap());
        let range = PartitionRange::compute(2, 1, 1).unwrap();
        let outcome = matcher.search(&range, &CancellationToken::new(), &MatchProgress::new());
        assert_eq!(outcome, MatchOutcome::Found("z9".to_string()));
    }

    #[test]
    fn test_word_outside_partition_is_not_found() {
        let matcher = HashMatcher::new(TargetHash::parse(&md5_hex("zz")).unwrap());
        let range = PartitionRange::compute(2, 2, 1).unwrap();
        let progress = MatchProgress::new();
        let outcome = matcher.search(&range, &CancellationToken::new(), &progress);
        assert_eq!(outcome, MatchOutcome::NotFound);
        assert_eq!(progress.checked() as u128, range.word_count);
    }

    #[test]
    fn test_cancelled_token_stops_search() {
        let matcher = HashMatcher::new(TargetHash::parse(&md5_hex("99")).unwrap());
        let range = PartitionRange::compute(2, 1, 1).unwrap();
        let token = CancellationToken::new();
        token.cancel();
        let progress = MatchProgress::new();
        assert_eq!(matcher.search(&range, &token, &progress), MatchOutcome::Cancelled);
        assert_eq!(progress.checked(), 0);
    }
}
