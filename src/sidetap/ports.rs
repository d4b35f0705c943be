use std::collections::BTreeSet;
use std::net::UdpSocket;
use std::sync::Mutex;

use crate::error::SideTapError;

/// A reserved consecutive RTP/RTCP pair. `rtcp == rtp + 1` always.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortPair {
    pub rtp: u16,
    pub rtcp: u16,
}

/// Process-wide pool of loopback UDP ports for plain-transport taps.
/// Candidate pairs are removed from the free set before probing so two
/// allocations can never race onto the same ports.
pub struct PortPool {
    free: Mutex<BTreeSet<u16>>,
}

impl PortPool {
    pub fn new(min: u16, max: u16) -> Self {
        Self {
            free: Mutex::new((min..max).collect()),
        }
    }

    pub fn allocate(&self) -> Result<PortPair, SideTapError> {
        loop {
            // Reserve the first consecutive pair under the lock.
            let candidate = {
                let mut free = self.free.lock().unwrap();
                let pair = free
                    .iter()
                    .copied()
                    .find(|p| p % 2 == 0 && free.contains(&(p + 1)));
                match pair {
                    Some(rtp) => {
                        free.remove(&rtp);
                        free.remove(&(rtp + 1));
                        rtp
                    }
                    None => {
                        // Odd-aligned pairs are better than none.
                        let any = free.iter().copied().find(|p| free.contains(&(p + 1)));
                        match any {
                            Some(rtp) => {
                                free.remove(&rtp);
                                free.remove(&(rtp + 1));
                                rtp
                            }
                            None => return Err(SideTapError::NoPortPairs),
                        }
                    }
                }
            };

            let rtp_ok = probe(candidate);
            let rtcp_ok = probe(candidate + 1);
            match (rtp_ok, rtcp_ok) {
                (true, true) => {
                    return Ok(PortPair {
                        rtp: candidate,
                        rtcp: candidate + 1,
                    });
                }
                (rtp_ok, rtcp_ok) => {
                    // Keep the usable half for future pairs; the offender
                    // stays out of the pool.
                    let mut free = self.free.lock().unwrap();
                    if rtp_ok {
                        free.insert(candidate);
                    }
                    if rtcp_ok {
                        free.insert(candidate + 1);
                    }
                }
            }
        }
    }

    pub fn release(&self, pair: PortPair) {
        let mut free = self.free.lock().unwrap();
        free.insert(pair.rtp);
        free.insert(pair.rtcp);
    }

    pub fn available(&self) -> usize {
        self.free.lock().unwrap().len()
    }
}

fn probe(port: u16) -> bool {
    UdpSocket::bind(("127.0.0.1", port)).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocates_consecutive_pairs() {
        let pool = PortPool::new(61820, 61830);
        let pair = pool.allocate().unwrap();
        assert_eq!(pair.rtcp, pair.rtp + 1);
        assert_eq!(pool.available(), 8);
        pool.release(pair);
        assert_eq!(pool.available(), 10);
    }

    #[test]
    fn distinct_allocations_never_overlap() {
        let pool = PortPool::new(61840, 61850);
        let a = pool.allocate().unwrap();
        let b = pool.allocate().unwrap();
        assert_ne!(a.rtp, b.rtp);
        assert!(a.rtcp != b.rtp && b.rtcp != a.rtp);
    }

    #[test]
    fn exhaustion_fails_without_partial_allocation() {
        let pool = PortPool::new(61860, 61862);
        let pair = pool.allocate().unwrap();
        assert_eq!(pool.available(), 0);
        match pool.allocate() {
            Err(SideTapError::NoPortPairs) => {}
            other => panic!("expected NoPortPairs, got {other:?}"),
        }
        pool.release(pair);
        assert_eq!(pool.available(), 2);
    }

    #[test]
    fn occupied_port_is_skipped() {
        // Hold one port of the only even-aligned pair; the allocator must
        // not hand it out.
        let blocker = match UdpSocket::bind(("127.0.0.1", 61870)) {
            Ok(sock) => sock,
            Err(_) => return, // environment owns the port, nothing to test
        };
        let pool = PortPool::new(61870, 61874);
        let pair = pool.allocate().unwrap();
        assert_eq!(pair.rtp, 61872);
        drop(blocker);
    }
}
