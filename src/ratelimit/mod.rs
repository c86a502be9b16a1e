//! Rate limiting logic: policy, counter keys, decisions and the engine.

mod backend;
mod clock;
mod decision;
mod key;
mod limiter;
mod policy;
mod window;

pub use backend::RateLimiterBackend;
pub use clock::{Clock, ManualClock, SystemClock};
pub use decision::{Decision, Remaining, WindowRemaining};
pub use key::CounterKey;
pub use limiter::RateLimiter;
pub use policy::{Category, CategoryPolicy, Quota, RateLimitPolicy, WindowQuota};
pub use window::WindowKind;
