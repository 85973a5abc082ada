use crate::hal::BackendKind;
use crate::types::{CommandListType, DescriptorHeapType, ResourceUsage, ResourceViewType};

pub type RhiResult<T> = Result<T, RhiError>;

/// Errors reported by the rendering hardware interface.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum RhiError {
    /// A native API call failed.
    #[error("{backend:?} call `{call}` failed with {message} ({code:#x}) at {file}:{line}")]
    Native {
        backend: BackendKind,
        code: i64,
        message: String,
        call: &'static str,
        file: &'static str,
        line: u32,
    },
    /// The backend runtime could not be loaded or initialized.
    #[error("Failed to load graphics runtime: {0}")]
    Loading(String),
    /// The backend is not compiled in or not available on this platform.
    #[error("Backend {0:?} is not available on this platform")]
    UnsupportedBackend(BackendKind),
    #[error("No suitable graphics adapter found")]
    NoSuitableAdapter,
    #[error("Adapter {0} does not exist")]
    AdapterNotFound(usize),
    /// A device is already alive on this adapter.
    #[error("Adapter {adapter} already has a live device")]
    AdapterInUse { adapter: usize },
    /// The adapter does not support a feature the call needs.
    #[error("Feature not supported by this device: {0}")]
    FeatureNotSupported(&'static str),
    /// Every slot of a descriptor heap is issued.
    #[error("Descriptor heap {heap:?} exhausted (capacity: {capacity})")]
    DescriptorHeapExhausted { heap: DescriptorHeapType, capacity: u32 },
    /// A handle refers to a destroyed object.
    #[error("Invalid or destroyed {0} handle")]
    InvalidHandle(&'static str),
    /// A handle created by one device was passed to another.
    #[error("Object belongs to a different device")]
    DeviceMismatch,
    #[error("Command list is not recording")]
    CommandListClosed,
    #[error("Command list is still recording")]
    CommandListOpen,
    #[error("Command list type mismatch: expected {expected:?}, got {actual:?}")]
    CommandListTypeMismatch { expected: CommandListType, actual: CommandListType },
    /// An allocator was reset while command lists recorded through it are still open.
    #[error("Command allocator reset while {open_lists} command list(s) are open")]
    AllocatorInUse { open_lists: u32 },
    #[error("Command requires an active render pass")]
    NoActiveRenderPass,
    #[error("A render pass is already active")]
    RenderPassActive,
    #[error("Resource '{resource}' was not created with usage {required:?}")]
    UsageMismatch { resource: String, required: ResourceUsage },
    #[error("Cannot create {view:?} view: {reason}")]
    IncompatibleView { view: ResourceViewType, reason: &'static str },
    #[error("Frame buffer does not match render pass: {0}")]
    FrameBufferMismatch(String),
    #[error("Resource layout slot {slot}: {reason}")]
    LayoutMismatch { slot: u32, reason: String },
    #[error("{what} out of range: requested {requested}, available {available}")]
    OutOfRange { what: &'static str, requested: u64, available: u64 },
    #[error("Acceleration structure has not been built")]
    AccelerationStructureNotBuilt,
    #[error("Acceleration structure was not built with the allow-update flag")]
    UpdateNotAllowed,
    /// A fence wait can never complete because nothing will signal the value.
    #[error("Fence value {value} will never be signaled")]
    Timeout { value: u64 },
    #[error("Invalid descriptor: {0}")]
    InvalidDescriptor(String),
    #[error("Presentation surface error: {0}")]
    Surface(String),
}

impl RhiError {
    pub fn native(
        backend: BackendKind,
        error: impl NativeError,
        call: &'static str,
        file: &'static str,
        line: u32,
    ) -> Self {
        RhiError::Native {
            backend,
            code: error.code(),
            message: error.describe(),
            call,
            file,
            line,
        }
    }

    pub fn is_native(&self) -> bool {
        matches!(self, RhiError::Native { .. })
    }
}

/// A native error value that can be reported through [`RhiError::Native`].
pub trait NativeError {
    fn code(&self) -> i64;
    fn describe(&self) -> String;
}

impl NativeError for ash::vk::Result {
    fn code(&self) -> i64 {
        self.as_raw() as i64
    }

    fn describe(&self) -> String {
        format!("{:?}", self)
    }
}

#[cfg(windows)]
impl NativeError for windows::core::Error {
    fn code(&self) -> i64 {
        self.code().0 as i64
    }

    fn describe(&self) -> String {
        self.message()
    }
}

/// Evaluate a native call returning `Result<T, E: NativeError>`; on failure return an
/// [`RhiError::Native`] carrying the error code, the call text and the source location.
macro_rules! native_try {
    ($backend:expr, $call:expr) => {
        match $call {
            Ok(value) => value,
            Err(error) => {
                return Err($crate::error::RhiError::native(
                    $backend,
                    error,
                    stringify!($call),
                    file!(),
                    line!(),
                ))
            }
        }
    };
}

pub(crate) use native_try;

#[cfg(test)]
mod tests {
    use super::*;
    use ash::vk;

    fn failing_call() -> RhiResult<u32> {
        let value = native_try!(BackendKind::Vulkan, Err::<u32, _>(vk::Result::ERROR_DEVICE_LOST));
        Ok(value)
    }

    #[test]
    fn native_try_captures_call_site() {
        let error = failing_call().unwrap_err();
        match error {
            RhiError::Native { backend, code, call, file, .. } => {
                assert_eq!(backend, BackendKind::Vulkan);
                assert_eq!(code, vk::Result::ERROR_DEVICE_LOST.as_raw() as i64);
                assert!(call.contains("ERROR_DEVICE_LOST"));
                assert!(file.ends_with("error.rs"));
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn display_mentions_heap_and_capacity() {
        let message = RhiError::DescriptorHeapExhausted { heap: DescriptorHeapType::Rtv, capacity: 64 }.to_string();
        assert!(message.contains("Rtv"));
        assert!(message.contains("64"));
    }

    #[test]
    fn native_display_carries_call_and_location() {
        let message = failing_call().unwrap_err().to_string();
        assert!(message.starts_with("Vulkan call `"));
        assert!(message.contains("ERROR_DEVICE_LOST"));
        assert!(message.contains("error.rs:"));
    }
}
