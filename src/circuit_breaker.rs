use failsafe::backoff::{self, Exponential};
use failsafe::failure_policy::{self, ConsecutiveFailures};
use failsafe::Config;
use std::time::Duration;

/// Concrete breaker type guarding lead-store operations.
pub type StoreCircuitBreaker = failsafe::StateMachine<ConsecutiveFailures<Exponential>, ()>;

/// Creates a circuit breaker for lead-store operations to prevent cascading
/// failures.
///
/// # Configuration
///
/// - **Failure threshold**: 5 consecutive failures triggers OPEN state.
/// - **Backoff**: Exponential backoff from 10s to 60s before attempting recovery.
///
/// # States
///
/// - **CLOSED**: Normal operation, requests pass through.
/// - **OPEN**: Too many failures, requests fail fast.
/// - **HALF_OPEN**: Testing if service recovered.
pub fn create_store_circuit_breaker() -> StoreCircuitBreaker {
    let backoff_strategy = backoff::exponential(
        Duration::from_secs(10), // Initial delay
        Duration::from_secs(60), // Maximum delay
    );

    let failure_policy = failure_policy::consecutive_failures(5, backoff_strategy);

    Config::new().failure_policy(failure_policy).build()
}
