//! Core discovery logic - pure computation with no direct I/O.
//!
//! Contains the disjoint-path `lookup` and its lanes (`path_bucket`), and
//! `routing_maintenance` decisions. All I/O orchestration lives in `actor/`,
//! which calls into this module.

pub(crate) mod lookup;
pub(crate) mod path_bucket;
pub(crate) mod routing_maintenance;
