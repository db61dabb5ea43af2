//! Resource identifiers.
//!
//! Every table-addressable object in the core — descriptors, sockets, peers,
//! timers, queued responses — is keyed by a 64-bit id drawn from a
//! cryptographic RNG. The namespace is global within a process and `0` is
//! reserved to mean "absent", so callers can treat a zero id as a null.

/// A process-global 64-bit resource id. Zero is reserved.
pub type Id = u64;

/// Draws a fresh nonzero id from the thread-local CSPRNG.
pub fn rand64() -> Id {
    loop {
        let id: u64 = rand::random();
        if id != 0 {
            return id;
        }
    }
}
