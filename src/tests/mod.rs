//! Cross-component tests for the resilience layer.

#[cfg(test)]
mod cache_tests;

#[cfg(test)]
mod resilience_tests;
