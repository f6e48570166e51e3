//! Pay-to-dispense gateway.
//!
//! Customers pay through a mobile push prompt or a hosted checkout page,
//! receive a one-time numeric code for the liters they bought, and a
//! dispensing station redeems that code exactly once.

pub mod api;
pub mod cache;
pub mod config;
pub mod db;
pub mod errors;
pub mod gateway;
pub mod ledger;
pub mod models;
pub mod notify;
pub mod otp;
pub mod pricing;
pub mod station;
pub mod sweeper;
