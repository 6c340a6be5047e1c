use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use crate::common::Id;

#[derive(Debug, Clone)]
pub struct InflightRequest {
    pub transaction_id: u32,
    pub to: SocketAddr,
    /// Id of the node we expect to answer, if known.
    pub node_id: Option<Id>,
    /// Encoded request, kept for retransmission.
    pub bytes: Box<[u8]>,
    /// Retransmissions so far.
    pub attempts: u8,
    pub deadline: Instant,
}

impl InflightRequest {
    /// Same tid, and same address ignoring unspecified ips.
    pub fn does_match(&self, from: &SocketAddr, tid: u32) -> bool {
        if self.transaction_id != tid {
            return false;
        }

        if self.to.port() != from.port() {
            return false;
        }

        if self.to.ip().is_unspecified() {
            return true;
        }

        self.to.ip() == from.ip()
    }
}

#[derive(Debug, Default)]
pub struct InflightRequests {
    requests: HashMap<u32, InflightRequest>,
}

impl InflightRequests {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, request: InflightRequest) {
        self.requests.insert(request.transaction_id, request);
    }

    pub fn contains(&self, transaction_id: u32) -> bool {
        self.requests.contains_key(&transaction_id)
    }

    /// Returns true if a request to this address is awaiting a response.
    pub fn contains_address(&self, address: &SocketAddr) -> bool {
        self.requests.values().any(|request| request.to == *address)
    }

    pub fn len(&self) -> usize {
        self.requests.len()
    }

    pub fn is_empty(&self) -> bool {
        self.requests.is_empty()
    }

    /// Remove an inflight request if it exists and matches the address.
    pub fn remove(&mut self, transaction_id: u32, from: &SocketAddr) -> Option<InflightRequest> {
        let request = self.requests.get(&transaction_id)?;

        if !request.does_match(from, transaction_id) {
            return None;
        }

        self.requests.remove(&transaction_id)
    }

    /// Remove an inflight request regardless of who it was sent to.
    pub fn cancel(&mut self, transaction_id: u32) -> Option<InflightRequest> {
        self.requests.remove(&transaction_id)
    }

    /// Split requests past their deadline into those to retransmit (attempts incremented,
    /// deadline backed off) and those that exhausted `max_retries` (removed).
    pub fn expired(
        &mut self,
        now: Instant,
        request_timeout: Duration,
        max_retries: u8,
    ) -> (Vec<InflightRequest>, Vec<InflightRequest>) {
        let mut retry = vec![];
        let mut failed = vec![];

        for request in self.requests.values_mut() {
            if request.deadline > now {
                continue;
            }

            if request.attempts < max_retries {
                request.attempts += 1;
                request.deadline = now + backoff(request_timeout, request.attempts);

                retry.push(request.clone());
            } else {
                failed.push(request.transaction_id);
            }
        }

        let failed = failed
            .into_iter()
            .filter_map(|tid| self.requests.remove(&tid))
            .collect();

        (retry, failed)
    }
}

/// `request_timeout * 2^attempt`
pub fn backoff(request_timeout: Duration, attempt: u8) -> Duration {
    request_timeout.saturating_mul(1_u32 << attempt.min(16))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(tid: u32, to: SocketAddr, timeout: Duration) -> InflightRequest {
        let now = Instant::now();

        InflightRequest {
            transaction_id: tid,
            to,
            node_id: None,
            bytes: [0].into(),
            attempts: 0,
            deadline: now + timeout,
        }
    }

    #[test]
    fn remove_matches_address() {
        let mut requests = InflightRequests::new();
        let to: SocketAddr = "127.0.0.1:5000".parse().unwrap();

        requests.add(request(1, to, Duration::from_secs(1)));

        assert!(requests
            .remove(1, &"127.0.0.1:5001".parse().unwrap())
            .is_none());
        assert!(requests.contains(1));
        assert!(requests.remove(1, &to).is_some());
        assert!(requests.is_empty());
    }

    #[test]
    fn backoff_doubles() {
        let timeout = Duration::from_millis(100);

        assert_eq!(backoff(timeout, 0), Duration::from_millis(100));
        assert_eq!(backoff(timeout, 1), Duration::from_millis(200));
        assert_eq!(backoff(timeout, 3), Duration::from_millis(800));
    }

    #[test]
    fn expired_retries_then_fails() {
        let mut requests = InflightRequests::new();
        let timeout = Duration::from_millis(10);
        let to: SocketAddr = "127.0.0.1:5000".parse().unwrap();

        requests.add(request(1, to, timeout));

        let mut now = Instant::now();
        let (retry, failed) = requests.expired(now, timeout, 2);
        assert!(retry.is_empty() && failed.is_empty());

        for attempt in 1..=2 {
            now += Duration::from_secs(1);
            let (retry, failed) = requests.expired(now, timeout, 2);

            assert_eq!(retry.len(), 1);
            assert_eq!(retry[0].attempts, attempt);
            assert!(failed.is_empty());
        }

        now += Duration::from_secs(1);
        let (retry, failed) = requests.expired(now, timeout, 2);
        assert!(retry.is_empty());
        assert_eq!(failed.len(), 1);
        assert!(requests.is_empty());
    }

    #[test]
    fn contains_address_until_removed() {
        let mut requests = InflightRequests::new();
        let to: SocketAddr = "127.0.0.1:5000".parse().unwrap();
        let other: SocketAddr = "127.0.0.1:5001".parse().unwrap();

        requests.add(request(1, to, Duration::from_millis(10)));

        assert!(requests.contains_address(&to));
        assert!(!requests.contains_address(&other));

        requests.cancel(1);
        assert!(!requests.contains_address(&to));
    }
}
