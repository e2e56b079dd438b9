use std::fmt;
use std::sync::Arc;

/// Severity attached to every message that reaches the application callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum MessageSeverity {
    Info,
    Warning,
    Error,
}

/// Application-injected sink for every diagnostic the library emits.
///
/// All errors and warnings reach the application this way; operations
/// themselves only report success or failure through their return values.
pub type MessageCallback = Arc<dyn Fn(MessageSeverity, &str) + Send + Sync>;

/// Shared wrapper around an optional [`MessageCallback`].
///
/// When no callback is installed, messages are forwarded to the `log` crate.
#[derive(Clone, Default)]
pub struct MessageSink {
    callback: Option<MessageCallback>,
}

impl MessageSink {
    pub fn new(callback: Option<MessageCallback>) -> Self {
        Self { callback }
    }

    pub fn message(&self, severity: MessageSeverity, text: &str) {
        match &self.callback {
            Some(cb) => cb(severity, text),
            None => match severity {
                MessageSeverity::Info => log::info!("{}", text),
                MessageSeverity::Warning => log::warn!("{}", text),
                MessageSeverity::Error => log::error!("{}", text),
            },
        }
    }

    pub fn error(&self, text: &str) {
        self.message(MessageSeverity::Error, text);
    }

    pub fn warning(&self, text: &str) {
        self.message(MessageSeverity::Warning, text);
    }
}

impl fmt::Debug for MessageSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MessageSink")
            .field("installed", &self.callback.is_some())
            .finish()
    }
}

#[derive(Debug)]
pub enum GpuError {
    /// The backend cannot express the request (missing extension, wrong
    /// backend family, unsupported enum value).
    NotSupported(&'static str),
    /// Out-of-range enum or logically invalid descriptor.
    InvalidArgument(String),
    /// The backend returned a non-success status code.
    #[cfg(feature = "kiln-vulkan")]
    VulkanError(ash::vk::Result),
    #[cfg(feature = "kiln-vulkan")]
    LoadingError(ash::LoadingError),
    #[cfg(all(windows, feature = "kiln-d3d11"))]
    D3DError(windows::core::Error),
    /// The GPU device was lost or removed.
    DeviceLost,
    /// Ran out of a bounded resource (volatile versions, descriptor slots,
    /// scratch memory budget).
    OutOfSlots(&'static str),
    /// Developer misuse detected at record time; the command list stays in a
    /// coherent state.
    Misuse(String),
}

impl fmt::Display for GpuError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GpuError::NotSupported(what) => write!(f, "operation not supported: {}", what),
            GpuError::InvalidArgument(what) => write!(f, "invalid argument: {}", what),
            #[cfg(feature = "kiln-vulkan")]
            GpuError::VulkanError(res) => write!(f, "Vulkan error: VkResult = {:#x}", res.as_raw()),
            #[cfg(feature = "kiln-vulkan")]
            GpuError::LoadingError(err) => write!(f, "failed to load Vulkan library: {}", err),
            #[cfg(all(windows, feature = "kiln-d3d11"))]
            GpuError::D3DError(err) => {
                write!(f, "D3D error: HRESULT = {:#x}", err.code().0)
            }
            GpuError::DeviceLost => write!(f, "device lost"),
            GpuError::OutOfSlots(what) => write!(f, "ran out of {}", what),
            GpuError::Misuse(what) => write!(f, "{}", what),
        }
    }
}

impl std::error::Error for GpuError {}

#[cfg(feature = "kiln-vulkan")]
impl From<ash::vk::Result> for GpuError {
    fn from(res: ash::vk::Result) -> Self {
        if res == ash::vk::Result::ERROR_DEVICE_LOST {
            GpuError::DeviceLost
        } else {
            GpuError::VulkanError(res)
        }
    }
}

#[cfg(feature = "kiln-vulkan")]
impl From<ash::LoadingError> for GpuError {
    fn from(err: ash::LoadingError) -> Self {
        GpuError::LoadingError(err)
    }
}

#[cfg(all(windows, feature = "kiln-d3d11"))]
impl From<windows::core::Error> for GpuError {
    fn from(err: windows::core::Error) -> Self {
        use windows::Win32::Graphics::Dxgi::{DXGI_ERROR_DEVICE_REMOVED, DXGI_ERROR_DEVICE_RESET};
        if err.code() == DXGI_ERROR_DEVICE_REMOVED || err.code() == DXGI_ERROR_DEVICE_RESET {
            GpuError::DeviceLost
        } else {
            GpuError::D3DError(err)
        }
    }
}

/// Convenient crate-wide result type.
pub type Result<T, E = GpuError> = std::result::Result<T, E>;
