//! Stand-in for the spec's "user-visible identity/log hooks"
//! collaborator (spec.md §1, out of scope as an interface the core
//! *consumes*). A default implementation is provided so the crate is
//! usable standalone; embedders replace it with their own.

use rand::RngCore;

/// Identity generation and lifecycle logging, pluggable per
/// [`Chirp`](crate::chirp::Chirp) instance.
pub trait Hooks {
    /// Called once at `start` when `Config::identity` is all-zero.
    fn generate_identity(&self) -> [u8; 16] {
        let mut id = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut id);
        id
    }
}

/// The hooks implementation used when the embedder supplies none.
pub struct DefaultHooks;

impl Hooks for DefaultHooks {}
