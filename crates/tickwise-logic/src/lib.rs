//! Viewer-relative update throttling for large simulations.
//!
//! This crate decides which dynamic objects need a full update on a given
//! step, smooths the objects it skips when they are drawn, and caches
//! expensive lookups (paths, occlusion, line of sight, region
//! classification, rule matches) with explicit expiry. It owns no world
//! state: the host passes handles, distances and states in, and gets
//! decisions and blended states back.
//!
//! # Module Overview
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`cache`] | Generic expiring cache: TTL, step scope, movement, LRU, validator |
//! | [`config`] | Tunables, validation, repair and versioned snapshots |
//! | [`geometry`] | Positions, grid cells, regions, angle blending |
//! | [`handle`] | Generational object handles and stable phases |
//! | [`lookup`] | Path, occlusion, visibility, spatial, rule and membership caches |
//! | [`motion`] | Two-sample interpolation for throttled objects |
//! | [`schedule`] | Per-object update decisions with overrides |
//! | [`stress`] | Step-time moving average to stress factor |
//! | [`throttle`] | Host-facing facade tying everything together |
//! | [`tier`] | Distance tiers, stress shrinking, batch statistics |

pub mod cache;
pub mod config;
pub mod geometry;
pub mod handle;
pub mod lookup;
pub mod motion;
pub mod schedule;
pub mod stress;
pub mod throttle;
pub mod tier;

pub use handle::ObjectHandle;
pub use schedule::OverrideFlags;
pub use throttle::Throttle;
