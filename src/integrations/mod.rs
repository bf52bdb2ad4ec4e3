//! Narrow interfaces to the world outside the resolution engine:
//! host resolver configuration, notifications, and content-safety
//! assessment.

pub mod notify;
pub mod platform;
pub mod safety;

pub use notify::{Event, LogNotifier, Notifier, RecordingNotifier};
pub use platform::{PlatformResolverConfig, ResolvConf, Unmanaged, host_upstreams};
pub use safety::{Assessment, ContentSafety, Disabled, SafetyMonitor, SafetyVerdict};
