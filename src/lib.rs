pub mod binding;
pub mod error;
pub mod format;
pub mod permutation;
pub mod state_tracking;
pub mod traits;
pub mod types;
pub mod upload;
pub mod versioning;

#[cfg(feature = "kiln-vulkan")]
pub mod vulkan;

#[cfg(all(windows, feature = "kiln-d3d11"))]
pub mod d3d11;

pub use error::{GpuError, MessageCallback, MessageSeverity, MessageSink, Result};
pub use format::{format_info, Format, FormatInfo, FormatKind};
pub use traits::*;
pub use types::*;
