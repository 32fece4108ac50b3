//! Join-semilattice trait used for document updates.
//!
//! A join-semilattice (S, ⊔) satisfies:
//! - Commutativity: a ⊔ b = b ⊔ a
//! - Associativity: (a ⊔ b) ⊔ c = a ⊔ (b ⊔ c)
//! - Idempotence: a ⊔ a = a
//!
//! Updates that form a lattice can be buffered, merged and replayed in any
//! order and still converge.

/// State that merges by least upper bound.
pub trait Lattice: Clone + PartialEq {
    /// The bottom element (identity for join)
    fn bottom() -> Self;

    /// Join operation (least upper bound)
    /// Must be commutative, associative, and idempotent
    fn join(&self, other: &Self) -> Self;

    /// Join-assign: self = self ⊔ other
    fn join_assign(&mut self, other: &Self) {
        *self = self.join(other);
    }

    /// Check if self ≤ other in the lattice order
    fn leq(&self, other: &Self) -> bool {
        &self.join(other) == other
    }
}
