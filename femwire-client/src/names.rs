//! Workspace name allocation.
//!
//! Every name is a fixed-length uppercase token: the session prefix followed
//! by a base-26 rendering of a per-session counter. Names from one allocator
//! never repeat; running out of counter space is an error.

use crate::error::ClientError;
use std::sync::atomic::{AtomicU64, Ordering};

/// Number of counter digits after the prefix.
pub const COUNTER_DIGITS: u32 = 6;

/// Length of a randomly drawn prefix.
pub const RANDOM_PREFIX_LEN: usize = 2;

/// Longest accepted prefix.
pub const MAX_PREFIX_LEN: usize = 4;

/// Names available per prefix.
pub const CAPACITY: u64 = 26u64.pow(COUNTER_DIGITS);

/// Hands out unique workspace names for one session.
#[derive(Debug)]
pub struct NameAllocator {
    prefix: String,
    next: AtomicU64,
}

impl NameAllocator {
    /// Creates an allocator with a fixed prefix.
    pub fn new(prefix: impl Into<String>) -> Result<Self, ClientError> {
        let prefix = prefix.into();
        validate_prefix(&prefix)?;
        Ok(Self {
            prefix,
            next: AtomicU64::new(0),
        })
    }

    /// Creates an allocator with a random prefix, so that two sessions
    /// sharing one engine are unlikely to meet.
    pub fn random() -> Self {
        let bytes = uuid::Uuid::new_v4().into_bytes();
        let prefix = bytes
            .iter()
            .take(RANDOM_PREFIX_LEN)
            .map(|b| char::from(b'A' + b % 26))
            .collect();
        Self {
            prefix,
            next: AtomicU64::new(0),
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Number of names handed out so far.
    pub fn issued(&self) -> u64 {
        self.next.load(Ordering::Relaxed).min(CAPACITY)
    }

    /// Returns the next unused name.
    pub fn allocate(&self) -> Result<String, ClientError> {
        let n = self
            .next
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| {
                (n < CAPACITY).then_some(n + 1)
            })
            .map_err(|_| ClientError::NamesExhausted(self.prefix.clone()))?;
        Ok(render(&self.prefix, n))
    }
}

fn render(prefix: &str, mut n: u64) -> String {
    let mut digits = [b'A'; COUNTER_DIGITS as usize];
    for slot in digits.iter_mut().rev() {
        *slot = b'A' + (n % 26) as u8;
        n /= 26;
    }
    let mut name = String::with_capacity(prefix.len() + digits.len());
    name.push_str(prefix);
    name.extend(digits.iter().map(|&b| char::from(b)));
    name
}

/// Checks a configured prefix: 1 to 4 uppercase ASCII letters.
pub fn validate_prefix(prefix: &str) -> Result<(), ClientError> {
    if prefix.is_empty() || prefix.len() > MAX_PREFIX_LEN {
        return Err(ClientError::InvalidName {
            name: prefix.to_string(),
            reason: "prefix must be 1 to 4 characters",
        });
    }
    if !prefix.bytes().all(|b| b.is_ascii_uppercase()) {
        return Err(ClientError::InvalidName {
            name: prefix.to_string(),
            reason: "prefix must be uppercase letters",
        });
    }
    Ok(())
}

/// Checks a user-supplied object name before it reaches the engine.
pub fn validate_name(name: &str) -> Result<(), ClientError> {
    if name.is_empty() {
        return Err(ClientError::InvalidName {
            name: String::new(),
            reason: "name is empty",
        });
    }
    if name.contains(':') {
        return Err(ClientError::InvalidName {
            name: name.to_string(),
            reason: "':' is reserved",
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Arc;

    #[test]
    fn test_names_are_fixed_length_uppercase() {
        let names = NameAllocator::new("QX").unwrap();
        assert_eq!(names.allocate().unwrap(), "QXAAAAAA");
        assert_eq!(names.allocate().unwrap(), "QXAAAAAB");
        for _ in 0..30 {
            let name = names.allocate().unwrap();
            assert_eq!(name.len(), 8);
            assert!(name.bytes().all(|b| b.is_ascii_uppercase()));
        }
        assert_eq!(names.issued(), 32);
    }

    #[test]
    fn test_counter_carries_into_next_digit() {
        let names = NameAllocator::new("A").unwrap();
        for _ in 0..26 {
            names.allocate().unwrap();
        }
        assert_eq!(names.allocate().unwrap(), "AAAAABA");
    }

    #[test]
    fn test_exhaustion_is_an_error() {
        let names = NameAllocator::new("Z").unwrap();
        names.next.store(CAPACITY - 1, Ordering::Relaxed);
        assert_eq!(names.allocate().unwrap(), "ZZZZZZZ");
        assert!(matches!(
            names.allocate(),
            Err(ClientError::NamesExhausted(p)) if p == "Z"
        ));
        assert!(names.allocate().is_err());
    }

    #[test]
    fn test_random_prefix() {
        let names = NameAllocator::random();
        assert_eq!(names.prefix().len(), RANDOM_PREFIX_LEN);
        assert!(validate_prefix(names.prefix()).is_ok());
    }

    #[test]
    fn test_concurrent_allocation_is_unique() {
        let names = Arc::new(NameAllocator::new("T").unwrap());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let names = Arc::clone(&names);
                std::thread::spawn(move || {
                    (0..500)
                        .map(|_| names.allocate().unwrap())
                        .collect::<Vec<_>>()
                })
            })
            .collect();

        let mut seen = HashSet::new();
        for handle in handles {
            for name in handle.join().unwrap() {
                assert!(seen.insert(name));
            }
        }
        assert_eq!(seen.len(), 4000);
    }

    #[test]
    fn test_validate_prefix() {
        assert!(validate_prefix("AB").is_ok());
        assert!(validate_prefix("").is_err());
        assert!(validate_prefix("ABCDE").is_err());
        assert!(validate_prefix("ab").is_err());
        assert!(validate_prefix("A1").is_err());
    }

    #[test]
    fn test_validate_name() {
        assert!(validate_name("KMAT").is_ok());
        assert!(matches!(
            validate_name(""),
            Err(ClientError::InvalidName { reason: "name is empty", .. })
        ));
        assert!(validate_name("A::B").is_err());
    }
}
