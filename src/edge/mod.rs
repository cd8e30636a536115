//! # Edge Device
//!
//! Everything that runs on the sensor node: turn noisy raw samples into a
//! debounced logical state, keep the broker session alive, and publish the
//! state whenever it changes.
//!
//! ```text
//! edge/
//! ├── source.rs      - Raw metric sources (GPIO, ultrasonic ranger, value files)
//! ├── debounce.rs    - Hysteresis band and dwell-time debouncers
//! ├── context.rs     - Per-channel and per-device state threaded through the loop
//! ├── supervisor.rs  - Link/session establishment with bounded retries and backoff
//! ├── publisher.rs   - Publish-on-change against the last successful publish
//! └── agent.rs       - The device loop tying the pieces together
//! ```

pub mod agent;
pub mod context;
pub mod debounce;
pub mod publisher;
pub mod source;
pub mod supervisor;

pub use agent::{AgentError, AgentStats, DeviceAgent};
pub use context::{ChannelContext, DeviceContext, LinkState};
pub use debounce::{DebounceConfig, Debouncer, RawReading};
pub use publisher::{ChangePublisher, PublishOutcome};
pub use supervisor::{ConnectivitySupervisor, SupervisorSettings};
