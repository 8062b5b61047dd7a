// ABOUTME: Retry and circuit-breaker controller wrapped around every destination call
// ABOUTME: Breakers are per destination; retry policy is per sync pair

pub mod breaker;
pub mod retry;

pub use breaker::{
    BreakerConfig, BreakerPermit, BreakerRegistry, BreakerSnapshot, BreakerState, CircuitBreaker,
};
pub use retry::RetryPolicy;
