//! Proxy module: data types, list parsing, judge routing and checks
//!
//! This module provides functionality for:
//! - Parsing proxies from various formats (IP:PORT, IP:PORT:USER:PASS, etc.)
//! - Routing each (user, protocol) pair to a judge in round-robin order
//! - Checking a proxy against a judge with retries and anonymity detection

pub mod checker;
pub mod judge;
pub mod models;
pub mod parser;

pub use checker::{Checker, ProbeRequest, ProbeResponse, Prober, ReqwestProber};
pub use judge::{Judge, JudgeRouter};
pub use models::{
    AnonymityLevel, CheckOutcome, Protocol, Proxy, ProxyAuth, ProxyOwner, WorkItem,
};
pub use parser::ProxyParser;
