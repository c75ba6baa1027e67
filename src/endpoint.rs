//! Byte-stream endpoint
//!
//! The USART needs somewhere to put transmitted characters and
//! somewhere to take received ones from. An `Endpoint` is the
//! simulator-side half of a pair of unbounded channels; the matching
//! `HostEndpoint` can live on any host thread (a pty pump, a test, a
//! TCP bridge). Neither side ever blocks the simulation loop.

use crossbeam_channel::{unbounded, Receiver, Sender, TryRecvError};

/// Simulator-side endpoint, owned by the USART.
#[derive(Debug, Clone)]
pub struct Endpoint {
    tx: Sender<u8>,
    rx: Receiver<u8>,
}

/// Host-side endpoint.
#[derive(Debug, Clone)]
pub struct HostEndpoint {
    tx: Sender<u8>,
    rx: Receiver<u8>,
}

/// Create a connected endpoint pair.
pub fn pair() -> (Endpoint, HostEndpoint) {
    let (sim_tx, host_rx) = unbounded();
    let (host_tx, sim_rx) = unbounded();
    (
        Endpoint {
            tx: sim_tx,
            rx: sim_rx,
        },
        HostEndpoint {
            tx: host_tx,
            rx: host_rx,
        },
    )
}

impl Endpoint {
    /// Deliver one transmitted byte to the host.
    pub fn send(&self, byte: u8) -> bool {
        self.tx.send(byte).is_ok()
    }

    /// Take one byte from the host, if any is waiting.
    pub fn try_recv(&self) -> Option<u8> {
        match self.rx.try_recv() {
            Ok(b) => Some(b),
            Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => None,
        }
    }
}

impl HostEndpoint {
    /// Queue one byte for the simulated receiver.
    pub fn send(&self, byte: u8) -> bool {
        self.tx.send(byte).is_ok()
    }

    /// Take one byte transmitted by the firmware, if any.
    pub fn try_recv(&self) -> Option<u8> {
        match self.rx.try_recv() {
            Ok(b) => Some(b),
            Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => None,
        }
    }

    /// Drain everything transmitted so far.
    pub fn drain(&self) -> Vec<u8> {
        let mut out = Vec::new();
        while let Some(b) = self.try_recv() {
            out.push(b);
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_both_directions() {
        let (sim, host) = pair();

        assert!(host.send(0x55));
        assert_eq!(sim.try_recv(), Some(0x55));
        assert_eq!(sim.try_recv(), None);

        assert!(sim.send(0xAA));
        assert!(sim.send(0xBB));
        assert_eq!(host.drain(), vec![0xAA, 0xBB]);
    }
}
