use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use contrast_common::{ContrastError, VerificationError, NONCE_SIZE};
use tokio::sync::Mutex;

/// Lifetime of an issued nonce.
pub const NONCE_VALIDITY: Duration = Duration::from_secs(120);
/// Upper bound on nonces issued but not yet presented.
pub const MAX_OUTSTANDING_NONCES: usize = 10_000;

/// Single-use attestation challenges.
///
/// A nonce is removed on its first presentation, whether or not the
/// attestation that carried it succeeds.
#[derive(Clone)]
pub struct NonceManager {
    validity: Duration,
    capacity: usize,
    outstanding: Arc<Mutex<HashMap<[u8; NONCE_SIZE], Instant>>>,
}

impl NonceManager {
    pub fn new(validity: Duration, capacity: usize) -> Self {
        Self {
            validity,
            capacity,
            outstanding: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn validity(&self) -> Duration {
        self.validity
    }

    pub async fn issue(&self) -> Result<[u8; NONCE_SIZE], ContrastError> {
        let mut outstanding = self.outstanding.lock().await;
        if outstanding.len() >= self.capacity {
            let now = Instant::now();
            let validity = self.validity;
            outstanding.retain(|_, issued| now.duration_since(*issued) < validity);
            if outstanding.len() >= self.capacity {
                return Err(ContrastError::ResourceExhausted(
                    "too many outstanding nonces".to_string(),
                ));
            }
        }
        let nonce = contrast_common::generate_nonce();
        outstanding.insert(nonce, Instant::now());
        Ok(nonce)
    }

    /// Remove `nonce` and report whether it was fresh.
    pub async fn consume(&self, nonce: &[u8]) -> Result<(), VerificationError> {
        let key: [u8; NONCE_SIZE] = nonce.try_into().map_err(|_| VerificationError::StaleNonce {
            reason: format!("nonce must be {} bytes", NONCE_SIZE),
        })?;
        let issued = self.outstanding.lock().await.remove(&key);
        match issued {
            None => Err(VerificationError::StaleNonce {
                reason: "nonce was not issued by this coordinator or was already used".to_string(),
            }),
            Some(at) if at.elapsed() >= self.validity => Err(VerificationError::StaleNonce {
                reason: "nonce expired".to_string(),
            }),
            Some(_) => Ok(()),
        }
    }

    pub async fn outstanding(&self) -> usize {
        self.outstanding.lock().await.len()
    }

    /// Periodically drop expired nonces.
    pub fn spawn_cleanup_task(&self) {
        let outstanding = self.outstanding.clone();
        let validity = self.validity;
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(validity);
            loop {
                interval.tick().await;
                let now = Instant::now();
                outstanding
                    .lock()
                    .await
                    .retain(|_, issued| now.duration_since(*issued) < validity);
            }
        });
    }
}

impl Default for NonceManager {
    fn default() -> Self {
        Self::new(NONCE_VALIDITY, MAX_OUTSTANDING_NONCES)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_nonce_is_single_use() {
        let nonces = NonceManager::default();
        let n = nonces.issue().await.unwrap();
        nonces.consume(&n).await.unwrap();
        assert!(matches!(
            nonces.consume(&n).await,
            Err(VerificationError::StaleNonce { .. })
        ));
    }

    #[tokio::test]
    async fn test_unknown_nonce_rejected() {
        let nonces = NonceManager::default();
        assert!(nonces.consume(&[7u8; NONCE_SIZE]).await.is_err());
        assert!(nonces.consume(&[7u8; 4]).await.is_err());
    }

    #[tokio::test]
    async fn test_expired_nonce_rejected() {
        let nonces = NonceManager::new(Duration::from_millis(10), 10);
        let n = nonces.issue().await.unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        let err = nonces.consume(&n).await.unwrap_err();
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_capacity_is_enforced() {
        let nonces = NonceManager::new(NONCE_VALIDITY, 2);
        nonces.issue().await.unwrap();
        nonces.issue().await.unwrap();
        assert!(matches!(
            nonces.issue().await,
            Err(ContrastError::ResourceExhausted(_))
        ));
        assert_eq!(nonces.outstanding().await, 2);
    }
}
