//! Proxy-collector safe memory reclamation, in two flavors.
//!
//! Both flavors solve the same problem: a reader may hold a pointer into a
//! lock-free structure after the node has been unlinked, so destruction must
//! be deferred until every reader that could have seen the node has left.
//! Readers bracket their traversals with `acquire`/`release`; writers hand
//! retired nodes to the proxy instead of freeing them.
//!
//! [`linked`] pools its collectors on a free list and chains them into an
//! epoch lifecycle list; deferred work is an arbitrary thunk and the
//! deferred depth is unbounded. [`indexed`] holds a fixed power-of-two fanout
//! of collectors and is allocation-free after construction, at the price of
//! a serialized quiesce transition and an intrusive node type.
//!
//! Neither flavor is a hazard-pointer or epoch-GC equivalent; the contract
//! is only that a node retired at instant `t` is destroyed after the release
//! of every reader whose acquire returned before `t`.

pub mod indexed;
pub mod linked;
