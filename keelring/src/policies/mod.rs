//! Pluggable request routing behaviour: address translation, host
//! selection, retries and speculative execution.

pub mod address_translator;
pub mod host_filter;
pub mod load_balancing;
pub mod retry;
pub mod speculative_execution;
