//! Cold-start gating: decides between the native app, the remote surface
//! and the interstitial screens.

mod actor;
pub mod machine;

pub use actor::{BootstrapOrchestrator, OrchestratorHandle, OrchestratorSettings, Services};
pub use machine::{Phase, Presentation, PromptVariant};
