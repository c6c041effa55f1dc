pub mod lifecycle;
pub mod tweak_scanner;

pub use lifecycle::{LifecycleConfig, LifecycleDriver};
pub use tweak_scanner::{claim_operation_id, TweakScanRequest, TweakScanner};
