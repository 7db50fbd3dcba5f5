//! Connection Pool Manager (§4.1): the single place every other crate goes
//! through to reach Postgres. Wraps `sqlx::PgPool` with a circuit breaker
//! and a leak detector so that a stuck query degrades the process instead
//! of exhausting it silently.

mod breaker;
mod error;
mod leak;
mod pool;

pub use breaker::{BreakerState, CircuitBreaker};
pub use error::{classify, ErrorClass, PoolError};
pub use leak::LeakRegistry;
pub use pool::{Acquired, DbPool};
