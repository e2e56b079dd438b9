#![allow(dead_code)]

use std::ops::Deref;
use std::sync::{Arc, Mutex};

use kiln::error::{GpuError, MessageCallback, MessageSeverity};
use kiln::vulkan::{VulkanDevice, VulkanDeviceDesc};

/// Collects everything the device reports through its message callback so
/// tests can assert on diagnostics instead of scraping logs.
#[derive(Clone, Default)]
pub struct CapturedMessages {
    entries: Arc<Mutex<Vec<(MessageSeverity, String)>>>,
}

impl CapturedMessages {
    pub fn callback(&self) -> MessageCallback {
        let entries = Arc::clone(&self.entries);
        Arc::new(move |severity: MessageSeverity, text: &str| {
            entries.lock().unwrap().push((severity, text.to_owned()));
        })
    }

    pub fn errors(&self) -> Vec<String> {
        self.entries
            .lock()
            .unwrap()
            .iter()
            .filter(|(severity, _)| *severity == MessageSeverity::Error)
            .map(|(_, text)| text.clone())
            .collect()
    }

    pub fn take(&self) -> Vec<(MessageSeverity, String)> {
        std::mem::take(&mut *self.entries.lock().unwrap())
    }
}

/// A validation-enabled device with its captured diagnostics.
pub struct TestDevice {
    device: VulkanDevice,
    pub messages: CapturedMessages,
}

impl TestDevice {
    pub fn new() -> Result<Self, GpuError> {
        let messages = CapturedMessages::default();
        let device = VulkanDevice::new(&VulkanDeviceDesc {
            enable_validation: true,
            message_callback: Some(messages.callback()),
            ..Default::default()
        })?;
        Ok(Self { device, messages })
    }

    /// Returns `None` when no Vulkan implementation is available so the suite
    /// still passes on machines without a driver.
    pub fn acquire(test_name: &str) -> Option<Self> {
        match Self::new() {
            Ok(device) => Some(device),
            Err(err) => {
                eprintln!(
                    "skipping {}: Vulkan initialization unavailable: {:?}",
                    test_name, err
                );
                None
            }
        }
    }
}

impl Deref for TestDevice {
    type Target = VulkanDevice;

    fn deref(&self) -> &VulkanDevice {
        &self.device
    }
}
