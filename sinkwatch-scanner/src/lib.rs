pub mod error;
pub mod hooks;
pub mod origin;
pub mod paths;
pub mod renderer;
pub mod result;
pub mod scanner;
pub mod sinks;

pub use error::ScanError;
pub use hooks::Instrumentation;
pub use origin::{Category, ExternalGroup, NormalizedUrl};
#[cfg(feature = "browser")]
pub use renderer::ChromiumRenderer;
pub use renderer::{HttpRenderer, RenderOptions, RenderedPage, Renderer};
pub use result::{PageScan, ScriptSource};
pub use scanner::{ScanConfig, Scanner};
pub use sinks::{SinkFinding, SinkKind, SourceType};
